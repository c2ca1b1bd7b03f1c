use crate::config::{ChannelConfig, PeerEndpoint};
use crate::error::Result;
use crate::events::LedgerEvent;
use crate::identity::Identity;
use crate::transaction::{CommitEvent, ProposalResponse, SignedProposal, SignedTransaction};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Opens channel sessions on a ledger network.
#[async_trait]
pub trait LedgerConnector: Send + Sync {
    async fn connect(
        &self,
        identity: Arc<Identity>,
        channel: &ChannelConfig,
    ) -> Result<Arc<dyn ChannelSession>>;
}

/// An open session on one channel for one identity.
///
/// `Err` from a call means the transport failed; a peer that ran the
/// chaincode and refused it answers `Ok` with a non-200 status.
#[async_trait]
pub trait ChannelSession: Send + Sync {
    /// Runs the proposal on a peer without ordering it.
    async fn evaluate(&self, peer: &PeerEndpoint, proposal: &SignedProposal)
    -> Result<ProposalResponse>;

    /// Simulates and signs the proposal on a peer.
    async fn endorse(&self, peer: &PeerEndpoint, proposal: &SignedProposal)
    -> Result<ProposalResponse>;

    /// Registers interest in the commit of `tx_id` as seen by `peer`. Must be
    /// called before [`ChannelSession::submit`] so the event cannot be missed.
    async fn watch_commit(
        &self,
        peer: &PeerEndpoint,
        tx_id: &str,
    ) -> Result<oneshot::Receiver<CommitEvent>>;

    /// Broadcasts an endorsed transaction to the ordering service.
    async fn submit(&self, transaction: &SignedTransaction) -> Result<()>;

    /// Number of the newest committed block.
    async fn block_height(&self) -> Result<u64>;

    /// Registers for a chaincode event on the channel's event hub, replaying
    /// from `start_block` (inclusive) when given. A transport failure arrives
    /// as an `Err` item; a closed receiver also means the hub went away.
    async fn register_chaincode_events(
        &self,
        chaincode: &str,
        event_name: &str,
        start_block: Option<u64>,
    ) -> Result<EventRegistration>;

    async fn unregister(&self, registration_id: u64);

    async fn disconnect(&self);
}

pub struct EventRegistration {
    pub id: u64,
    pub events: mpsc::UnboundedReceiver<Result<LedgerEvent>>,
}
