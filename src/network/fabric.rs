use super::chaincode::{ChaincodeHandler, DemoBankContract, Execution, LedgerState};
use super::gateway::{ChannelSession, EventRegistration, LedgerConnector};
use crate::config::{ChannelConfig, PeerEndpoint};
use crate::error::{GatewayError, Result};
use crate::events::LedgerEvent;
use crate::identity::Identity;
use crate::transaction::{
    CommitEvent, ProposalResponse, STATUS_OK, SignedProposal, SignedTransaction, TxValidationCode,
};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::{Duration, sleep};

/// How a simulated peer answers proposals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerBehavior {
    Healthy,
    /// Transport failure.
    Down,
    /// Runs but refuses with the given message.
    Refuse(String),
    /// Endorses a payload that differs from the other peers.
    Diverge,
}

struct Registration {
    chaincode: String,
    event_name: String,
    sender: mpsc::UnboundedSender<Result<LedgerEvent>>,
}

struct CommitWatcher {
    peer: String,
    sender: oneshot::Sender<CommitEvent>,
}

#[derive(Default)]
struct NetworkState {
    ledger: LedgerState,
    peers: HashMap<String, PeerBehavior>,
    pending_writes: HashMap<String, Vec<(String, Vec<u8>)>>,
    commit_watchers: HashMap<String, Vec<CommitWatcher>>,
    registrations: HashMap<u64, Registration>,
    blocks: Vec<(u64, Vec<LedgerEvent>)>,
    next_block: u64,
    forced_commit_status: Option<String>,
}

impl NetworkState {
    fn publish(&mut self, block_number: u64, events: Vec<LedgerEvent>) {
        self.registrations.retain(|_, registration| {
            events
                .iter()
                .filter(|e| {
                    e.chaincode == registration.chaincode && e.event_name == registration.event_name
                })
                .all(|e| registration.sender.send(Ok(e.clone())).is_ok())
        });
        self.blocks.push((block_number, events));
    }
}

struct NetworkInner {
    chaincode: Arc<dyn ChaincodeHandler>,
    state: Mutex<NetworkState>,
    latency: Duration,
    reachable: AtomicBool,
    orderer_available: AtomicBool,
    deliver_commits: AtomicBool,
    registration_failures: AtomicUsize,
    connections: AtomicUsize,
    submissions: AtomicUsize,
    next_registration: AtomicU64,
}

/// In-process Fabric network: peers running a chaincode handler, a solo
/// orderer cutting one block per transaction, and a channel event hub.
pub struct SimulatedFabricNetwork {
    inner: Arc<NetworkInner>,
}

impl SimulatedFabricNetwork {
    pub fn new() -> Self {
        Self::with_chaincode(Arc::new(DemoBankContract::new("BANK1")), Duration::ZERO)
    }

    pub fn with_chaincode(chaincode: Arc<dyn ChaincodeHandler>, latency: Duration) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                chaincode,
                state: Mutex::new(NetworkState {
                    next_block: 1,
                    ..NetworkState::default()
                }),
                latency,
                reachable: AtomicBool::new(true),
                orderer_available: AtomicBool::new(true),
                deliver_commits: AtomicBool::new(true),
                registration_failures: AtomicUsize::new(0),
                connections: AtomicUsize::new(0),
                submissions: AtomicUsize::new(0),
                next_registration: AtomicU64::new(1),
            }),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_orderer_available(&self, available: bool) {
        self.inner.orderer_available.store(available, Ordering::SeqCst);
    }

    /// When false, blocks still commit but no commit events are sent.
    pub fn set_deliver_commits(&self, deliver: bool) {
        self.inner.deliver_commits.store(deliver, Ordering::SeqCst);
    }

    pub fn fail_next_registrations(&self, count: usize) {
        self.inner.registration_failures.store(count, Ordering::SeqCst);
    }

    pub async fn set_peer_behavior(&self, peer: &str, behavior: PeerBehavior) {
        self.inner
            .state
            .lock()
            .await
            .peers
            .insert(peer.to_string(), behavior);
    }

    /// Marks subsequently committed transactions invalid with `reason`.
    pub async fn force_commit_status(&self, reason: Option<String>) {
        self.inner.state.lock().await.forced_commit_status = reason;
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    pub fn submission_count(&self) -> usize {
        self.inner.submissions.load(Ordering::SeqCst)
    }

    pub async fn block_height(&self) -> u64 {
        self.inner.state.lock().await.next_block - 1
    }

    pub async fn registration_count(&self) -> usize {
        self.inner.state.lock().await.registrations.len()
    }

    /// Breaks every event hub connection with a transport error.
    pub async fn drop_event_connections(&self) {
        let mut state = self.inner.state.lock().await;
        for (_, registration) in state.registrations.drain() {
            let _ = registration.sender.send(Err(GatewayError::Connection(
                "event hub connection reset".into(),
            )));
        }
    }

    /// Commits a block carrying `events` without going through endorsement.
    pub async fn emit_block(&self, chaincode: &str, events: Vec<(String, Vec<u8>)>) -> u64 {
        let mut state = self.inner.state.lock().await;
        let block_number = state.next_block;
        state.next_block += 1;
        let events = events
            .into_iter()
            .enumerate()
            .map(|(i, (event_name, payload))| LedgerEvent {
                event_name,
                chaincode: chaincode.to_string(),
                block_number,
                tx_id: format!("block{}-tx{}", block_number, i),
                status: TxValidationCode::Valid.to_string(),
                payload,
            })
            .collect();
        state.publish(block_number, events);
        block_number
    }
}

impl Default for SimulatedFabricNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkInner {
    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
    }

    async fn run_proposal(
        &self,
        peer: &PeerEndpoint,
        signed: &SignedProposal,
    ) -> Result<(ProposalResponse, Execution)> {
        self.simulate_latency().await;
        let state = self.state.lock().await;
        let behavior = state
            .peers
            .get(&peer.name)
            .cloned()
            .unwrap_or(PeerBehavior::Healthy);

        let refused = |status: u16, message: String| ProposalResponse {
            peer: peer.name.clone(),
            status,
            message,
            payload: Vec::new(),
            events: Vec::new(),
            endorsement: Vec::new(),
        };

        match &behavior {
            PeerBehavior::Down => {
                return Err(GatewayError::Connection(format!(
                    "peer {} unreachable at {}",
                    peer.name, peer.url
                )));
            }
            PeerBehavior::Refuse(message) => {
                return Ok((refused(500, message.clone()), Execution::default()));
            }
            _ => {}
        }

        let proposal = match signed.verify() {
            Ok(proposal) => proposal,
            Err(e) => return Ok((refused(403, e.to_string()), Execution::default())),
        };

        let mut execution =
            match self
                .chaincode
                .execute(&state.ledger, &proposal.function, &proposal.args)
            {
                Ok(execution) => execution,
                Err(message) => return Ok((refused(500, message), Execution::default())),
            };
        if behavior == PeerBehavior::Diverge {
            execution.payload.extend_from_slice(b"\x00diverged");
        }

        let mut hasher = Sha256::new();
        hasher.update(peer.name.as_bytes());
        hasher.update(proposal.tx_id.as_bytes());
        hasher.update(&execution.payload);
        let response = ProposalResponse {
            peer: peer.name.clone(),
            status: STATUS_OK,
            message: String::new(),
            payload: execution.payload.clone(),
            events: execution.events.clone(),
            endorsement: hasher.finalize().to_vec(),
        };
        Ok((response, execution))
    }
}

#[async_trait]
impl LedgerConnector for SimulatedFabricNetwork {
    async fn connect(
        &self,
        identity: Arc<Identity>,
        channel: &ChannelConfig,
    ) -> Result<Arc<dyn ChannelSession>> {
        self.inner.simulate_latency().await;
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection(format!(
                "channel {} unreachable",
                channel.channel_name
            )));
        }
        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        log::debug!(
            "Simulated session for {} on {}",
            identity.username,
            channel.channel_name
        );
        Ok(Arc::new(SimulatedSession {
            network: self.inner.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct SimulatedSession {
    network: Arc<NetworkInner>,
    closed: AtomicBool,
}

impl SimulatedSession {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection("session closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelSession for SimulatedSession {
    async fn evaluate(
        &self,
        peer: &PeerEndpoint,
        proposal: &SignedProposal,
    ) -> Result<ProposalResponse> {
        self.ensure_open()?;
        let (mut response, _) = self.network.run_proposal(peer, proposal).await?;
        response.endorsement.clear();
        Ok(response)
    }

    async fn endorse(
        &self,
        peer: &PeerEndpoint,
        proposal: &SignedProposal,
    ) -> Result<ProposalResponse> {
        self.ensure_open()?;
        let (response, execution) = self.network.run_proposal(peer, proposal).await?;
        if response.is_success() {
            self.network
                .state
                .lock()
                .await
                .pending_writes
                .entry(proposal.tx_id.clone())
                .or_insert(execution.writes);
        }
        Ok(response)
    }

    async fn watch_commit(
        &self,
        peer: &PeerEndpoint,
        tx_id: &str,
    ) -> Result<oneshot::Receiver<CommitEvent>> {
        self.ensure_open()?;
        let (sender, receiver) = oneshot::channel();
        self.network
            .state
            .lock()
            .await
            .commit_watchers
            .entry(tx_id.to_string())
            .or_default()
            .push(CommitWatcher {
                peer: peer.name.clone(),
                sender,
            });
        Ok(receiver)
    }

    async fn submit(&self, transaction: &SignedTransaction) -> Result<()> {
        self.ensure_open()?;
        self.network.simulate_latency().await;
        if !self.network.orderer_available.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection("orderer unavailable".into()));
        }
        if transaction.endorsements.is_empty() {
            return Err(GatewayError::Connection("BAD_REQUEST: no endorsements".into()));
        }
        self.network.submissions.fetch_add(1, Ordering::SeqCst);

        let mut state = self.network.state.lock().await;
        let block_number = state.next_block;
        state.next_block += 1;

        let writes = state
            .pending_writes
            .remove(&transaction.tx_id)
            .unwrap_or_default();
        let status = match state.forced_commit_status.clone() {
            Some(reason) => TxValidationCode::Invalid(reason),
            None => TxValidationCode::Valid,
        };

        let mut events = Vec::new();
        if status == TxValidationCode::Valid {
            state.ledger.apply(&writes);
            if let Ok(proposal) = transaction.proposal.decode() {
                for event in &transaction.endorsements[0].events {
                    events.push(LedgerEvent {
                        event_name: event.event_name.clone(),
                        chaincode: proposal.chaincode.clone(),
                        block_number,
                        tx_id: transaction.tx_id.clone(),
                        status: status.to_string(),
                        payload: event.payload.clone(),
                    });
                }
            }
        }
        state.publish(block_number, events);

        let watchers = state
            .commit_watchers
            .remove(&transaction.tx_id)
            .unwrap_or_default();
        if self.network.deliver_commits.load(Ordering::SeqCst) {
            for watcher in watchers {
                log::debug!("Commit of {} seen by {}", transaction.tx_id, watcher.peer);
                let _ = watcher.sender.send(CommitEvent {
                    tx_id: transaction.tx_id.clone(),
                    block_number,
                    status: status.clone(),
                });
            }
        } else {
            // Keep senders alive so waiters time out instead of seeing a hangup.
            state
                .commit_watchers
                .insert(transaction.tx_id.clone(), watchers);
        }
        Ok(())
    }

    async fn block_height(&self) -> Result<u64> {
        self.ensure_open()?;
        if !self.network.reachable.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection("channel unreachable".into()));
        }
        Ok(self.network.state.lock().await.next_block - 1)
    }

    async fn register_chaincode_events(
        &self,
        chaincode: &str,
        event_name: &str,
        start_block: Option<u64>,
    ) -> Result<EventRegistration> {
        self.ensure_open()?;
        let failures = &self.network.registration_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GatewayError::Connection("event hub refused connection".into()));
        }

        let (sender, events) = mpsc::unbounded_channel();
        let mut state = self.network.state.lock().await;
        if let Some(start) = start_block {
            for (_, block_events) in state.blocks.iter().filter(|(n, _)| *n >= start) {
                for event in block_events
                    .iter()
                    .filter(|e| e.chaincode == chaincode && e.event_name == event_name)
                {
                    let _ = sender.send(Ok(event.clone()));
                }
            }
        }

        let id = self.network.next_registration.fetch_add(1, Ordering::SeqCst);
        state.registrations.insert(
            id,
            Registration {
                chaincode: chaincode.to_string(),
                event_name: event_name.to_string(),
                sender,
            },
        );
        Ok(EventRegistration { id, events })
    }

    async fn unregister(&self, registration_id: u64) {
        self.network
            .state
            .lock()
            .await
            .registrations
            .remove(&registration_id);
    }

    async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
