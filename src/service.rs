use crate::config::{ChannelConfig, GatewayConfig};
use crate::error::{GatewayError, Result};
use crate::events::{
    EventPipeline, EventSubscriber, PipelineKey, StreamClient, StreamTarget, SubscriberState,
};
use crate::identity::{Identity, IdentityManager};
use crate::metrics::GatewayMetrics;
use crate::network::{LedgerClientFactory, LedgerConnector};
use crate::transaction::{ContractSchema, TransactionGateway, TransactionResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Liveness of the event pipelines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub pipelines: Vec<(PipelineKey, SubscriberState)>,
}

impl HealthReport {
    /// True when every running pipeline is subscribed.
    pub fn is_healthy(&self) -> bool {
        self.pipelines
            .iter()
            .all(|(_, state)| *state == SubscriberState::Subscribed)
    }
}

/// Entry point for ledger reads, writes and the transfer event pipeline.
pub struct LedgerService {
    config: GatewayConfig,
    identities: Arc<IdentityManager>,
    clients: Arc<LedgerClientFactory>,
    transactions: TransactionGateway,
    stream: Arc<dyn StreamClient>,
    metrics: Arc<GatewayMetrics>,
    pipelines: Mutex<HashMap<PipelineKey, EventPipeline>>,
}

impl LedgerService {
    pub fn new(
        config: GatewayConfig,
        identities: Arc<IdentityManager>,
        connector: Arc<dyn LedgerConnector>,
        stream: Arc<dyn StreamClient>,
        metrics: Arc<GatewayMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let clients = Arc::new(LedgerClientFactory::new(
            connector,
            config.client_cache_capacity,
            config.max_in_flight_per_client,
            metrics.clone(),
        ));
        let transactions = TransactionGateway::new(
            clients.clone(),
            ContractSchema::bank(),
            config.endorsement_policy,
            config.commit_timeout(),
            metrics.clone(),
        );
        Ok(Self {
            config,
            identities,
            clients,
            transactions,
            stream,
            metrics,
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Enrolls the user on first use.
    pub async fn identity(&self, username: &str, organization: &str) -> Result<Arc<Identity>> {
        self.identities
            .get_identity(username, organization, true)
            .await
    }

    /// The configured channel with the channel and chaincode names replaced.
    pub fn channel(&self, channel_name: &str, chaincode_name: &str) -> ChannelConfig {
        ChannelConfig {
            channel_name: channel_name.to_string(),
            chaincode_name: chaincode_name.to_string(),
            ..self.config.channel.clone()
        }
    }

    /// Evaluates on every listed peer (all channel peers when empty) and
    /// returns each answering peer's payload.
    pub async fn query_ledger(
        &self,
        peers: &[String],
        channel_name: &str,
        chaincode_name: &str,
        args: Vec<String>,
        function: &str,
        identity: Arc<Identity>,
    ) -> Result<Vec<Value>> {
        let channel = self.channel(channel_name, chaincode_name);
        let result = self
            .transactions
            .query(peers, &channel, function, args, identity)
            .await?;
        Ok(result.json_payloads())
    }

    pub async fn invoke_ledger(
        &self,
        peers: &[String],
        channel_name: &str,
        chaincode_name: &str,
        args: Vec<String>,
        function: &str,
        identity: Arc<Identity>,
    ) -> Result<TransactionResult> {
        let channel = self.channel(channel_name, chaincode_name);
        self.transactions
            .invoke(peers, &channel, function, args, identity)
            .await
    }

    /// Starts forwarding `event_name` events to the configured stream, as the
    /// configured user of the configured organization.
    pub async fn start_event_pipeline(
        &self,
        channel_name: &str,
        chaincode_name: &str,
        event_name: &str,
    ) -> Result<PipelineKey> {
        let key = PipelineKey {
            organization: self.config.org.clone(),
            channel: channel_name.to_string(),
            event_name: event_name.to_string(),
        };

        let mut pipelines = self.pipelines.lock().await;
        if pipelines.contains_key(&key) {
            return Err(GatewayError::PipelineActive(key.to_string()));
        }

        let identity = self.identity(&self.config.username, &self.config.org).await?;
        let channel = self.channel(channel_name, chaincode_name);
        // Pin the start block so nothing committed after this call is missed.
        let client = self
            .clients
            .get_client(&self.config.org, identity.clone(), &channel)
            .await?;
        let height = client.session().block_height().await?;

        let subscriber = EventSubscriber::new(
            self.clients.clone(),
            identity,
            channel,
            event_name,
            self.config.subscriber.backoff(),
            self.metrics.clone(),
        )
        .starting_at(height + 1);
        let pipeline = EventPipeline::start(
            subscriber,
            StreamTarget {
                stream: self.stream.clone(),
                stream_name: self.config.stream_name.clone(),
                partition_key_field: self.config.partition_key_field.clone(),
            },
            &self.config.forwarder,
            self.metrics.clone(),
        );
        pipelines.insert(key.clone(), pipeline);
        Ok(key)
    }

    /// Returns false when no such pipeline was running.
    pub async fn stop_event_pipeline(&self, key: &PipelineKey) -> bool {
        let pipeline = self.pipelines.lock().await.remove(key);
        match pipeline {
            Some(pipeline) => {
                pipeline.stop().await;
                true
            }
            None => {
                log::warn!("No event pipeline running for {}", key);
                false
            }
        }
    }

    pub async fn health(&self) -> HealthReport {
        let pipelines = self.pipelines.lock().await;
        let mut report: Vec<_> = pipelines
            .iter()
            .map(|(key, pipeline)| (key.clone(), pipeline.state()))
            .collect();
        report.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        HealthReport { pipelines: report }
    }

    /// Stops every pipeline and closes every ledger session.
    pub async fn shutdown(&self) {
        let pipelines: Vec<_> = self.pipelines.lock().await.drain().map(|(_, p)| p).collect();
        for pipeline in pipelines {
            pipeline.stop().await;
        }
        self.clients.disconnect_all().await;
    }
}
