use super::forwarder::{EventForwarder, ForwarderHandle};
use super::stream::StreamClient;
use super::subscriber::{EventSubscriber, SubscriberHandle, SubscriberState};
use crate::config::ForwarderConfig;
use crate::metrics::GatewayMetrics;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Identifies a pipeline. At most one runs per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub organization: String,
    pub channel: String,
    pub event_name: String,
}

impl fmt::Display for PipelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.organization, self.channel, self.event_name)
    }
}

/// Where a pipeline sends its records.
pub struct StreamTarget {
    pub stream: Arc<dyn StreamClient>,
    pub stream_name: String,
    pub partition_key_field: String,
}

/// A subscriber feeding a forwarder over an unbounded channel.
pub struct EventPipeline {
    key: PipelineKey,
    subscriber: SubscriberHandle,
    forwarder: ForwarderHandle,
}

impl EventPipeline {
    pub fn start(
        subscriber: EventSubscriber,
        target: StreamTarget,
        forwarder_config: &ForwarderConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let key = PipelineKey {
            organization: subscriber.organization().to_string(),
            channel: subscriber.channel().channel_name.clone(),
            event_name: subscriber.event_name().to_string(),
        };

        let forwarder = EventForwarder::new(
            target.stream,
            target.stream_name,
            target.partition_key_field,
            forwarder_config,
            metrics,
        )
        .spawn();
        let subscriber = subscriber.spawn(forwarder.sender());

        log::info!("Event pipeline {} started", key);
        Self {
            key,
            subscriber,
            forwarder,
        }
    }

    pub fn key(&self) -> &PipelineKey {
        &self.key
    }

    pub fn state(&self) -> SubscriberState {
        self.subscriber.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.subscriber.watch_state()
    }

    /// Unregisters the subscription first so nothing new arrives, then lets
    /// the forwarder drain within its grace period.
    pub async fn stop(self) {
        self.subscriber.shutdown().await;
        self.forwarder.shutdown().await;
        log::info!("Event pipeline {} stopped", self.key);
    }
}
