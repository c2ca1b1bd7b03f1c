use super::gateway::{ChannelSession, LedgerConnector};
use crate::config::ChannelConfig;
use crate::error::{GatewayError, Result};
use crate::identity::Identity;
use crate::metrics::GatewayMetrics;
use lru::LruCache;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// A session on one channel for one (organization, identity).
pub struct LedgerClient {
    pub organization: String,
    pub identity: Arc<Identity>,
    pub channel: Arc<ChannelConfig>,
    session: Arc<dyn ChannelSession>,
    permits: Arc<Semaphore>,
}

impl LedgerClient {
    pub fn session(&self) -> &Arc<dyn ChannelSession> {
        &self.session
    }

    /// Bounds the number of outstanding network calls on this client.
    pub async fn permit(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::Connection("ledger client disconnected".into()))
    }

    pub async fn disconnect(&self) {
        self.permits.close();
        self.session.disconnect().await;
        log::info!(
            "Disconnected {}@{} from {}",
            self.identity.username,
            self.organization,
            self.channel.channel_name
        );
    }

    pub fn is_connected(&self) -> bool {
        !self.permits.is_closed()
    }
}

impl fmt::Debug for LedgerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerClient")
            .field("organization", &self.organization)
            .field("username", &self.identity.username)
            .field("channel", &self.channel.channel_name)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

type ClientKey = (String, String, String);

/// Builds ledger clients and memoizes them per (organization, user, channel).
pub struct LedgerClientFactory {
    connector: Arc<dyn LedgerConnector>,
    clients: Mutex<LruCache<ClientKey, Arc<LedgerClient>>>,
    max_in_flight: usize,
    metrics: Arc<GatewayMetrics>,
}

impl LedgerClientFactory {
    pub fn new(
        connector: Arc<dyn LedgerConnector>,
        capacity: usize,
        max_in_flight: usize,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            connector,
            clients: Mutex::new(LruCache::new(capacity)),
            max_in_flight: max_in_flight.max(1),
            metrics,
        }
    }

    pub async fn get_client(
        &self,
        organization: &str,
        identity: Arc<Identity>,
        channel: &ChannelConfig,
    ) -> Result<Arc<LedgerClient>> {
        if identity.organization != organization {
            return Err(GatewayError::identity(
                &identity.username,
                organization,
                format!("identity belongs to {}", identity.organization),
            ));
        }
        channel.validate()?;

        let key = (
            organization.to_string(),
            identity.username.clone(),
            channel.channel_name.clone(),
        );

        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            let same_identity = client.identity.certificate.serial == identity.certificate.serial;
            if same_identity && client.is_connected() && client.channel.as_ref() == channel {
                self.metrics.record_cache_hit();
                return Ok(client.clone());
            }
        }
        self.metrics.record_cache_miss();

        if let Some(stale) = clients.pop(&key) {
            stale.disconnect().await;
        }

        let session = self.connector.connect(identity.clone(), channel).await?;
        let client = Arc::new(LedgerClient {
            organization: organization.to_string(),
            identity,
            channel: Arc::new(channel.clone()),
            session,
            permits: Arc::new(Semaphore::new(self.max_in_flight)),
        });
        log::info!(
            "Connected {}@{} to channel {} ({} peers)",
            client.identity.username,
            organization,
            channel.channel_name,
            channel.peers.len()
        );

        if let Some((_, evicted)) = clients.push(key, client.clone()) {
            evicted.disconnect().await;
        }
        Ok(client)
    }

    pub async fn disconnect_all(&self) {
        let mut clients = self.clients.lock().await;
        while let Some((_, client)) = clients.pop_lru() {
            client.disconnect().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerEndpoint;
    use crate::identity::{IdentityManager, LocalCertificateAuthority};
    use crate::network::fabric::SimulatedFabricNetwork;

    fn channel() -> ChannelConfig {
        ChannelConfig::new(
            "mychannel",
            "bank",
            vec![PeerEndpoint::new("peer0", "grpcs://peer0.org1:7051")],
        )
    }

    async fn identities() -> IdentityManager {
        let ca = Arc::new(LocalCertificateAuthority::new("Org1", "Org1MSP"));
        ca.add_user("admin", "adminpw").await;
        let manager = IdentityManager::new().with_authority(ca);
        manager.add_credentials("admin", "Org1", "adminpw").await;
        manager
    }

    fn factory(network: Arc<SimulatedFabricNetwork>, capacity: usize) -> LedgerClientFactory {
        LedgerClientFactory::new(network, capacity, 4, Arc::new(GatewayMetrics::new()))
    }

    #[tokio::test]
    async fn reuses_session_per_key() {
        let network = Arc::new(SimulatedFabricNetwork::new());
        let factory = factory(network.clone(), 4);
        let identity = identities().await.get_identity("admin", "Org1", true).await.unwrap();

        let a = factory.get_client("Org1", identity.clone(), &channel()).await.unwrap();
        let b = factory.get_client("Org1", identity, &channel()).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(network.connection_count(), 1);
    }

    #[tokio::test]
    async fn rejects_invalid_channel_config() {
        let network = Arc::new(SimulatedFabricNetwork::new());
        let factory = factory(network.clone(), 4);
        let identity = identities().await.get_identity("admin", "Org1", true).await.unwrap();

        let mut bad = channel();
        bad.peers.clear();
        let err = factory.get_client("Org1", identity, &bad).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connection);
        assert_eq!(network.connection_count(), 0);
    }

    #[tokio::test]
    async fn debug_names_the_client_without_its_session() {
        let network = Arc::new(SimulatedFabricNetwork::new());
        let factory = factory(network, 4);
        let identity = identities().await.get_identity("admin", "Org1", true).await.unwrap();
        let client = factory.get_client("Org1", identity, &channel()).await.unwrap();

        let shown = format!("{:?}", client);
        assert!(shown.contains("Org1"));
        assert!(shown.contains("admin"));
        assert!(shown.contains("mychannel"));
        assert!(!shown.contains("session"));
    }

    #[tokio::test]
    async fn refuses_cross_organization_use() {
        let network = Arc::new(SimulatedFabricNetwork::new());
        let factory = factory(network, 4);
        let identity = identities().await.get_identity("admin", "Org1", true).await.unwrap();
        assert!(factory.get_client("Org2", identity, &channel()).await.is_err());
    }

    #[tokio::test]
    async fn eviction_disconnects_least_recent_client() {
        let network = Arc::new(SimulatedFabricNetwork::new());
        let factory = factory(network.clone(), 1);
        let manager = identities().await;
        let admin = manager.get_identity("admin", "Org1", true).await.unwrap();
        let teller = manager.get_identity("teller", "Org1", true).await.unwrap();

        let first = factory.get_client("Org1", admin, &channel()).await.unwrap();
        let _second = factory.get_client("Org1", teller, &channel()).await.unwrap();

        assert!(!first.is_connected());
        assert_eq!(factory.len().await, 1);
    }

    #[tokio::test]
    async fn unreachable_network_is_a_connection_error() {
        let network = Arc::new(SimulatedFabricNetwork::new());
        network.set_reachable(false);
        let factory = factory(network, 4);
        let identity = identities().await.get_identity("admin", "Org1", true).await.unwrap();
        let err = factory.get_client("Org1", identity, &channel()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connection);
    }
}
