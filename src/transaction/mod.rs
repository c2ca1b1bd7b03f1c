pub mod gateway;
pub mod proposal;
pub mod request;

pub use gateway::TransactionGateway;
pub use proposal::{
    ChaincodeEvent, CommitEvent, Proposal, ProposalResponse, STATUS_OK, SignedProposal,
    SignedTransaction, TxValidationCode, compute_tx_id,
};
pub use request::{ContractSchema, FunctionSignature, Mode, ParamKind, TransactionRequest};

use crate::error::{GatewayError, Result};
use serde_json::Value;

/// One peer's contribution to a transaction. Unreachable peers carry status 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerResponse {
    pub peer: String,
    pub status: u16,
    pub message: String,
    pub payload: Vec<u8>,
}

impl PeerResponse {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }
}

impl From<&ProposalResponse> for PeerResponse {
    fn from(response: &ProposalResponse) -> Self {
        Self {
            peer: response.peer.clone(),
            status: response.status,
            message: response.message.clone(),
            payload: response.payload.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionResult {
    pub tx_id: String,
    pub mode: Mode,
    /// In the order the peers were targeted.
    pub responses: Vec<PeerResponse>,
    /// First successful payload; for invokes, the agreed one.
    pub payload: Vec<u8>,
    pub success: bool,
    pub block_number: Option<u64>,
}

impl TransactionResult {
    pub fn successful_payloads(&self) -> impl Iterator<Item = &[u8]> {
        self.responses
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.payload.as_slice())
    }

    /// Successful payloads parsed as JSON, one per answering peer. Empty
    /// payloads map to `null` and non-JSON text to a string.
    pub fn json_payloads(&self) -> Vec<Value> {
        self.successful_payloads().map(payload_to_json).collect()
    }

    pub fn first_json(&self) -> Result<Value> {
        self.json_payloads()
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Evaluation {
                function: self.tx_id.clone(),
                messages: vec!["no successful response".into()],
            })
    }
}

fn payload_to_json(payload: &[u8]) -> Value {
    if payload.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(peer: &str, status: u16, payload: &[u8]) -> PeerResponse {
        PeerResponse {
            peer: peer.into(),
            status,
            message: String::new(),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn json_payloads_skip_failed_peers() {
        let result = TransactionResult {
            tx_id: "tx".into(),
            mode: Mode::Query,
            responses: vec![
                response("peer0", 0, b""),
                response("peer1", 200, br#"{"balance":500}"#),
                response("peer2", 200, b""),
                response("peer3", 200, b"plain"),
            ],
            payload: br#"{"balance":500}"#.to_vec(),
            success: true,
            block_number: None,
        };
        assert_eq!(
            result.json_payloads(),
            vec![json!({"balance": 500}), Value::Null, json!("plain")]
        );
        assert_eq!(result.first_json().unwrap(), json!({"balance": 500}));
    }
}
