use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Coarse classification callers can map onto transport responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Identity,
    Connection,
    Validation,
    Evaluation,
    Endorsement,
    EndorsementMismatch,
    Submission,
    CommitTimeout,
    CommitRejected,
    StreamDelivery,
    Config,
    PipelineActive,
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("identity error for {username}@{organization}: {reason}")]
    Identity {
        username: String,
        organization: String,
        reason: String,
    },

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid request for {function}: {reason}")]
    Validation { function: String, reason: String },

    #[error("evaluation of {function} rejected by all peers: {}", .messages.join("; "))]
    Evaluation {
        function: String,
        messages: Vec<String>,
    },

    #[error("endorsement quorum not met: {endorsed} of {required} required peers endorsed")]
    Endorsement {
        endorsed: usize,
        required: usize,
        messages: Vec<String>,
    },

    #[error("endorsement mismatch: peer {peer} disagrees with peer {reference}")]
    EndorsementMismatch { peer: String, reference: String },

    #[error("ordering service rejected transaction {tx_id}: {reason}")]
    Submission { tx_id: String, reason: String },

    #[error("no commit event for transaction {tx_id} within {waited_ms} ms")]
    CommitTimeout { tx_id: String, waited_ms: u64 },

    #[error("transaction {tx_id} committed as invalid: {status}")]
    CommitRejected { tx_id: String, status: String },

    #[error(
        "stream delivery to {stream} (key {partition_key}) failed after {attempts} attempts: \
         {reason}"
    )]
    StreamDelivery {
        stream: String,
        partition_key: String,
        attempts: u32,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("event pipeline already active for {0}")]
    PipelineActive(String),
}

impl GatewayError {
    pub fn identity(username: &str, organization: &str, reason: impl Into<String>) -> Self {
        GatewayError::Identity {
            username: username.to_string(),
            organization: organization.to_string(),
            reason: reason.into(),
        }
    }

    pub fn validation(function: &str, reason: impl Into<String>) -> Self {
        GatewayError::Validation {
            function: function.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Identity { .. } => ErrorKind::Identity,
            GatewayError::Connection(_) => ErrorKind::Connection,
            GatewayError::Validation { .. } => ErrorKind::Validation,
            GatewayError::Evaluation { .. } => ErrorKind::Evaluation,
            GatewayError::Endorsement { .. } => ErrorKind::Endorsement,
            GatewayError::EndorsementMismatch { .. } => ErrorKind::EndorsementMismatch,
            GatewayError::Submission { .. } => ErrorKind::Submission,
            GatewayError::CommitTimeout { .. } => ErrorKind::CommitTimeout,
            GatewayError::CommitRejected { .. } => ErrorKind::CommitRejected,
            GatewayError::StreamDelivery { .. } => ErrorKind::StreamDelivery,
            GatewayError::Config(_) => ErrorKind::Config,
            GatewayError::PipelineActive(_) => ErrorKind::PipelineActive,
        }
    }

    /// Only transport-level failures are safe to retry, and only inside the
    /// event pipeline. Transaction-path errors are final for that attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Connection(_))
    }
}
