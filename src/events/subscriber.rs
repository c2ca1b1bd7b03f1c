use super::event::DeliveredEvent;
use crate::config::{Backoff, ChannelConfig};
use crate::error::Result;
use crate::identity::Identity;
use crate::metrics::GatewayMetrics;
use crate::network::{ChannelSession, EventRegistration, LedgerClientFactory};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Connection state of a chaincode event subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Disconnected,
    Connecting,
    Subscribed,
    Reconnecting,
    ShutDown,
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriberState::Disconnected => "disconnected",
            SubscriberState::Connecting => "connecting",
            SubscriberState::Subscribed => "subscribed",
            SubscriberState::Reconnecting => "reconnecting",
            SubscriberState::ShutDown => "shut down",
        };
        f.write_str(name)
    }
}

/// Keeps one chaincode event registration alive on a channel and hands every
/// observed event to the forwarder.
///
/// After a transport failure the registration is reopened with backoff and
/// replays from the last block seen, so events of that block may arrive
/// twice. Nothing is dropped.
///
/// The session is taken from the client factory on every (re)connect, so a
/// client evicted from the cache is replaced rather than reused.
pub struct EventSubscriber {
    clients: Arc<LedgerClientFactory>,
    identity: Arc<Identity>,
    channel: ChannelConfig,
    event_name: String,
    start_block: Option<u64>,
    backoff: Backoff,
    metrics: Arc<GatewayMetrics>,
}

/// Observes and stops a running subscriber.
pub struct SubscriberHandle {
    state: watch::Receiver<SubscriberState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SubscriberHandle {
    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.state.clone()
    }

    /// Unregisters from the event hub and waits for the task to end.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            log::error!("Event subscriber task failed: {}", e);
        }
    }
}

enum Exit {
    Shutdown,
    Dropped,
}

struct Cursor {
    /// Next registration replays from here, inclusive.
    resume_from: Option<u64>,
    epoch: u64,
    sequence: u64,
}

impl EventSubscriber {
    pub fn new(
        clients: Arc<LedgerClientFactory>,
        identity: Arc<Identity>,
        channel: ChannelConfig,
        event_name: impl Into<String>,
        backoff: Backoff,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            clients,
            identity,
            channel,
            event_name: event_name.into(),
            start_block: None,
            backoff,
            metrics,
        }
    }

    /// First registration replays from `block`. Without it the subscriber
    /// starts after the newest block at the time it first connects.
    pub fn starting_at(mut self, block: u64) -> Self {
        self.start_block = Some(block);
        self
    }

    pub fn organization(&self) -> &str {
        &self.identity.organization
    }

    pub fn channel(&self) -> &ChannelConfig {
        &self.channel
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn spawn(self, deliveries: mpsc::UnboundedSender<DeliveredEvent>) -> SubscriberHandle {
        let (state_tx, state_rx) = watch::channel(SubscriberState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(deliveries, state_tx, shutdown_rx));
        SubscriberHandle {
            state: state_rx,
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(
        self,
        deliveries: mpsc::UnboundedSender<DeliveredEvent>,
        state: watch::Sender<SubscriberState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut cursor = Cursor {
            resume_from: self.start_block,
            epoch: 0,
            sequence: 0,
        };
        let mut attempt = 0u32;
        let _ = state.send(SubscriberState::Connecting);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let opened = tokio::select! {
                _ = shutdown.changed() => break,
                opened = self.open(&mut cursor) => opened,
            };

            match opened {
                Ok((session, registration)) => {
                    let _ = state.send(SubscriberState::Subscribed);
                    attempt = 0;
                    log::info!(
                        "Listening for {} on {}/{} from block {:?}",
                        self.event_name,
                        self.channel.channel_name,
                        self.channel.chaincode_name,
                        cursor.resume_from
                    );
                    let id = registration.id;
                    let exit = self
                        .pump(registration, &deliveries, &mut cursor, &mut shutdown)
                        .await;
                    session.unregister(id).await;
                    if let Exit::Shutdown = exit {
                        break;
                    }
                    cursor.epoch += 1;
                    self.metrics.record_reconnect();
                }
                Err(e) if e.is_transient() => {
                    log::warn!("Event hub registration failed: {}", e);
                }
                Err(e) => {
                    log::error!("Giving up on {} events: {}", self.event_name, e);
                    break;
                }
            }

            let _ = state.send(SubscriberState::Reconnecting);
            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            log::info!("Reconnecting to event hub in {:?}", delay);
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(delay) => {}
            }
        }

        let _ = state.send(SubscriberState::ShutDown);
        log::info!("Stopped listening for {}", self.event_name);
    }

    async fn open(
        &self,
        cursor: &mut Cursor,
    ) -> Result<(Arc<dyn ChannelSession>, EventRegistration)> {
        let client = self
            .clients
            .get_client(&self.identity.organization, self.identity.clone(), &self.channel)
            .await?;
        let session = client.session().clone();
        if cursor.resume_from.is_none() {
            cursor.resume_from = Some(session.block_height().await? + 1);
        }
        let registration = session
            .register_chaincode_events(
                &self.channel.chaincode_name,
                &self.event_name,
                cursor.resume_from,
            )
            .await?;
        Ok((session, registration))
    }

    async fn pump(
        &self,
        mut registration: EventRegistration,
        deliveries: &mpsc::UnboundedSender<DeliveredEvent>,
        cursor: &mut Cursor,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit {
        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => return Exit::Shutdown,
                next = registration.events.recv() => next,
            };
            match next {
                Some(Ok(event)) => {
                    log::debug!(
                        "Event {} from tx {} in block {} ({})",
                        event.event_name,
                        event.tx_id,
                        event.block_number,
                        event.status
                    );
                    cursor.resume_from = Some(event.block_number);
                    cursor.sequence += 1;
                    self.metrics.record_event_received();
                    let delivered = DeliveredEvent {
                        event,
                        connection_epoch: cursor.epoch,
                        sequence: cursor.sequence,
                    };
                    if deliveries.send(delivered).is_err() {
                        log::warn!("Forwarder gone, stopping subscriber");
                        return Exit::Shutdown;
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Event hub error on {}: {}", self.event_name, e);
                    return Exit::Dropped;
                }
                None => {
                    log::warn!("Event hub closed the {} registration", self.event_name);
                    return Exit::Dropped;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, PeerEndpoint};
    use crate::identity::{IdentityManager, LocalCertificateAuthority};
    use crate::network::{LedgerClientFactory, SimulatedFabricNetwork};
    use serde_json::json;
    use tokio::time::{Duration, timeout};

    async fn subscriber(
        network: Arc<SimulatedFabricNetwork>,
        metrics: Arc<GatewayMetrics>,
    ) -> EventSubscriber {
        let ca = Arc::new(LocalCertificateAuthority::new("Org1", "Org1MSP"));
        ca.add_user("admin", "adminpw").await;
        let identities = IdentityManager::new().with_authority(ca);
        identities.add_credentials("admin", "Org1", "adminpw").await;
        let admin = identities.get_identity("admin", "Org1", true).await.unwrap();
        let channel = ChannelConfig::new(
            "mychannel",
            "bank",
            vec![PeerEndpoint::new("peer0", "grpcs://peer0.org1:7051")],
        );
        let clients = Arc::new(LedgerClientFactory::new(network, 2, 4, metrics.clone()));
        EventSubscriber::new(
            clients,
            admin,
            channel,
            "transfer-event",
            Backoff::new(10, 50),
            metrics,
        )
    }

    async fn wait_for(handle: &SubscriberHandle, wanted: SubscriberState) {
        let mut state = handle.watch_state();
        timeout(Duration::from_secs(5), state.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached")
            .unwrap();
    }

    fn transfer(to_bank: &str) -> Vec<(String, Vec<u8>)> {
        vec![(
            "transfer-event".to_string(),
            serde_json::to_vec(&json!({"ToBankID": to_bank})).unwrap(),
        )]
    }

    #[tokio::test]
    async fn delivers_matching_events_in_order() {
        let network = Arc::new(SimulatedFabricNetwork::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = subscriber(network.clone(), Arc::new(GatewayMetrics::new()))
            .await
            .spawn(tx);
        wait_for(&handle, SubscriberState::Subscribed).await;

        network.emit_block("bank", transfer("BANK2")).await;
        network
            .emit_block("bank", vec![("other-event".into(), b"{}".to_vec())])
            .await;
        network.emit_block("bank", transfer("BANK3")).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(second.event.block_number, 3);
        assert!(!first.may_be_redelivery());

        handle.shutdown().await;
        assert_eq!(network.registration_count().await, 0);
    }

    #[tokio::test]
    async fn reconnect_replays_from_last_seen_block() {
        let network = Arc::new(SimulatedFabricNetwork::new());
        let metrics = Arc::new(GatewayMetrics::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = subscriber(network.clone(), metrics.clone()).await.spawn(tx);
        wait_for(&handle, SubscriberState::Subscribed).await;

        network.emit_block("bank", transfer("BANK2")).await;
        let before = rx.recv().await.unwrap();

        network.fail_next_registrations(2);
        network.drop_event_connections().await;
        // Committed while the subscriber is away.
        network.emit_block("bank", transfer("BANK3")).await;

        let replayed = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let missed = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();

        assert_eq!(replayed.event, before.event);
        assert!(replayed.may_be_redelivery());
        assert_eq!(missed.event.block_number, 2);
        assert_eq!(metrics.snapshot().subscriber_reconnects, 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn drop_before_first_event_loses_nothing() {
        let network = Arc::new(SimulatedFabricNetwork::new());
        network.emit_block("bank", transfer("OLD")).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = subscriber(network.clone(), Arc::new(GatewayMetrics::new()))
            .await
            .spawn(tx);
        wait_for(&handle, SubscriberState::Subscribed).await;

        network.drop_event_connections().await;
        network.emit_block("bank", transfer("BANK2")).await;

        let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        let record: serde_json::Value = serde_json::from_slice(&event.event.payload).unwrap();
        assert_eq!(record["ToBankID"], "BANK2");
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_while_reconnecting() {
        let network = Arc::new(SimulatedFabricNetwork::new());
        network.fail_next_registrations(usize::MAX);
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = subscriber(network.clone(), Arc::new(GatewayMetrics::new()))
            .await
            .spawn(tx);
        wait_for(&handle, SubscriberState::Reconnecting).await;

        let mut state = handle.watch_state();
        handle.shutdown().await;
        assert_eq!(*state.borrow_and_update(), SubscriberState::ShutDown);
    }
}
