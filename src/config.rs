use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tokio::time::Duration;

/// A peer the gateway can send proposals to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub name: String,
    pub url: String,
}

impl PeerEndpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Channel, chaincode and peer set. Loaded once and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub channel_name: String,
    pub chaincode_name: String,
    pub peers: Vec<PeerEndpoint>,
}

impl ChannelConfig {
    pub fn new(
        channel_name: impl Into<String>,
        chaincode_name: impl Into<String>,
        peers: Vec<PeerEndpoint>,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            chaincode_name: chaincode_name.into(),
            peers,
        }
    }

    pub fn peer(&self, name: &str) -> Option<&PeerEndpoint> {
        self.peers.iter().find(|p| p.name == name)
    }

    /// Resolves peer names against this channel. An empty selection means
    /// every peer on the channel.
    pub fn resolve_peers(&self, names: &[String]) -> Result<Vec<PeerEndpoint>> {
        if names.is_empty() {
            return Ok(self.peers.clone());
        }
        names
            .iter()
            .map(|name| {
                self.peer(name).cloned().ok_or_else(|| {
                    GatewayError::Connection(format!(
                        "peer {} is not part of channel {}",
                        name, self.channel_name
                    ))
                })
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_name.trim().is_empty() {
            return Err(GatewayError::Connection("channel name is empty".into()));
        }
        if self.chaincode_name.trim().is_empty() {
            return Err(GatewayError::Connection("chaincode name is empty".into()));
        }
        if self.peers.is_empty() {
            return Err(GatewayError::Connection(format!(
                "channel {} has no peers",
                self.channel_name
            )));
        }
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.name.as_str()) {
                return Err(GatewayError::Connection(format!(
                    "duplicate peer {}",
                    peer.name
                )));
            }
            if !(peer.url.starts_with("grpc://") || peer.url.starts_with("grpcs://")) {
                return Err(GatewayError::Connection(format!(
                    "peer {} has unsupported url {}",
                    peer.name, peer.url
                )));
            }
        }
        Ok(())
    }
}

/// How many of the targeted peers must endorse an invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndorsementPolicy {
    All,
    Majority,
    AtLeast(usize),
}

impl Default for EndorsementPolicy {
    fn default() -> Self {
        EndorsementPolicy::All
    }
}

impl EndorsementPolicy {
    pub fn required(&self, targeted: usize) -> usize {
        match self {
            EndorsementPolicy::All => targeted,
            EndorsementPolicy::Majority => targeted / 2 + 1,
            EndorsementPolicy::AtLeast(n) => *n,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ForwarderConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub shutdown_grace_ms: u64,
    /// A partition lane with nothing queued for this long is retired.
    pub lane_idle_ms: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            shutdown_grace_ms: 5_000,
            lane_idle_ms: 30_000,
        }
    }
}

impl ForwarderConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff_ms, self.max_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn lane_idle(&self) -> Duration {
        Duration::from_millis(self.lane_idle_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriberConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl SubscriberConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff_ms, self.max_backoff_ms)
    }
}

/// Exponential backoff: `initial * 2^attempt`, capped at `max`, plus up to
/// 50% random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(max_ms.max(initial_ms)),
        }
    }

    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(20)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let base = self.base_delay(attempt);
        let jitter_ms = base.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

fn default_username() -> String {
    "admin".to_string()
}

fn default_event_name() -> String {
    "transfer-event".to_string()
}

fn default_stream_name() -> String {
    "bank-transfer-events".to_string()
}

fn default_partition_key_field() -> String {
    "ToBankID".to_string()
}

fn default_commit_timeout_ms() -> u64 {
    30_000
}

fn default_max_in_flight() -> usize {
    16
}

fn default_client_cache_capacity() -> usize {
    8
}

fn default_stream_dir() -> String {
    "stream".to_string()
}

fn default_metrics_csv() -> String {
    "gateway-metrics.csv".to_string()
}

/// Process-wide configuration. Built once at startup and handed to each
/// component's constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub org: String,
    #[serde(default)]
    pub msp_id: Option<String>,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(flatten)]
    pub channel: ChannelConfig,
    #[serde(default = "default_event_name")]
    pub event_name: String,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    #[serde(default = "default_partition_key_field")]
    pub partition_key_field: String,
    #[serde(default)]
    pub endorsement_policy: EndorsementPolicy,
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_per_client: usize,
    #[serde(default = "default_client_cache_capacity")]
    pub client_cache_capacity: usize,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub subscriber: SubscriberConfig,
    #[serde(default = "default_stream_dir")]
    pub stream_dir: String,
    #[serde(default = "default_metrics_csv")]
    pub metrics_csv: String,
}

impl GatewayConfig {
    pub fn new(org: impl Into<String>, channel: ChannelConfig) -> Self {
        Self {
            org: org.into(),
            msp_id: None,
            username: default_username(),
            channel,
            event_name: default_event_name(),
            stream_name: default_stream_name(),
            partition_key_field: default_partition_key_field(),
            endorsement_policy: EndorsementPolicy::default(),
            commit_timeout_ms: default_commit_timeout_ms(),
            max_in_flight_per_client: default_max_in_flight(),
            client_cache_capacity: default_client_cache_capacity(),
            forwarder: ForwarderConfig::default(),
            subscriber: SubscriberConfig::default(),
            stream_dir: default_stream_dir(),
            metrics_csv: default_metrics_csv(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: GatewayConfig =
            serde_json::from_str(text).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn msp_id(&self) -> String {
        self.msp_id
            .clone()
            .unwrap_or_else(|| format!("{}MSP", self.org))
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.org.trim().is_empty() {
            return Err(GatewayError::Config("org is empty".into()));
        }
        self.channel
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        if self.endorsement_policy.required(self.channel.peers.len()) == 0 {
            return Err(GatewayError::Config("endorsement quorum is zero".into()));
        }
        if self.partition_key_field.is_empty() {
            return Err(GatewayError::Config("partitionKeyField is empty".into()));
        }
        if self.max_in_flight_per_client == 0 || self.client_cache_capacity == 0 {
            return Err(GatewayError::Config(
                "maxInFlightPerClient and clientCacheCapacity must be positive".into(),
            ));
        }
        Ok(())
    }
}
