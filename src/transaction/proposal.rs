use super::request::TransactionRequest;
use crate::config::ChannelConfig;
use crate::error::{GatewayError, Result};
use crate::identity::EnrollmentCertificate;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

pub const STATUS_OK: u16 = 200;

/// Unsigned transaction proposal as sent to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub tx_id: String,
    pub channel: String,
    pub chaincode: String,
    pub function: String,
    pub args: Vec<String>,
    pub creator: EnrollmentCertificate,
    pub nonce: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl Proposal {
    pub fn new(request: &TransactionRequest, channel: &ChannelConfig) -> Self {
        let mut nonce = vec![0u8; 24];
        OsRng.fill_bytes(&mut nonce);
        let creator = request.identity().certificate.clone();
        let tx_id = compute_tx_id(&nonce, &creator);

        Self {
            tx_id,
            channel: channel.channel_name.clone(),
            chaincode: channel.chaincode_name.clone(),
            function: request.function().to_string(),
            args: request.args().to_vec(),
            creator,
            nonce,
            timestamp: Utc::now(),
        }
    }

    pub fn sign(&self, request: &TransactionRequest) -> Result<SignedProposal> {
        let bytes = bincode::serialize(self)
            .map_err(|e| GatewayError::validation(&self.function, e.to_string()))?;
        let signature = request.identity().sign(&bytes);
        Ok(SignedProposal {
            tx_id: self.tx_id.clone(),
            bytes,
            signature,
        })
    }
}

/// hex(SHA-256(nonce || creator)).
pub fn compute_tx_id(nonce: &[u8], creator: &EnrollmentCertificate) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(creator.encode());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedProposal {
    pub tx_id: String,
    pub bytes: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedProposal {
    pub fn decode(&self) -> Result<Proposal> {
        bincode::deserialize(&self.bytes)
            .map_err(|e| GatewayError::Connection(format!("malformed proposal: {}", e)))
    }

    /// Checks the creator's signature and that the tx id binds nonce and creator.
    pub fn verify(&self) -> Result<Proposal> {
        let proposal = self.decode()?;
        if !proposal.creator.verify(&self.bytes, &self.signature) {
            return Err(GatewayError::identity(
                &proposal.creator.subject,
                &proposal.creator.organization,
                "proposal signature does not match creator",
            ));
        }
        if compute_tx_id(&proposal.nonce, &proposal.creator) != proposal.tx_id {
            return Err(GatewayError::validation(&proposal.function, "tx id mismatch"));
        }
        Ok(proposal)
    }
}

/// Event set by chaincode during simulation, emitted once the block commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaincodeEvent {
    pub event_name: String,
    pub payload: Vec<u8>,
}

/// One peer's answer to a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalResponse {
    pub peer: String,
    pub status: u16,
    pub message: String,
    pub payload: Vec<u8>,
    pub events: Vec<ChaincodeEvent>,
    pub endorsement: Vec<u8>,
}

impl ProposalResponse {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Endorsements agree only if payload and emitted events match exactly.
    pub fn same_result(&self, other: &ProposalResponse) -> bool {
        self.payload == other.payload && self.events == other.events
    }
}

#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub tx_id: String,
    pub proposal: SignedProposal,
    pub endorsements: Vec<ProposalResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxValidationCode {
    Valid,
    Invalid(String),
}

impl fmt::Display for TxValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxValidationCode::Valid => write!(f, "VALID"),
            TxValidationCode::Invalid(reason) => write!(f, "{}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    pub tx_id: String,
    pub block_number: u64,
    pub status: TxValidationCode,
}
