use super::proposal::{
    Proposal, ProposalResponse, SignedProposal, SignedTransaction, TxValidationCode,
};
use super::request::{ContractSchema, Mode, TransactionRequest};
use super::{PeerResponse, TransactionResult};
use crate::config::{ChannelConfig, EndorsementPolicy, PeerEndpoint};
use crate::error::{GatewayError, Result};
use crate::identity::Identity;
use crate::metrics::GatewayMetrics;
use crate::network::{LedgerClient, LedgerClientFactory};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::{Duration, timeout};

/// Runs queries and invokes against the chaincode of a channel.
///
/// Nothing here is retried: a failed invoke is reported once, and the caller
/// decides whether resubmitting a transfer is safe.
pub struct TransactionGateway {
    clients: Arc<LedgerClientFactory>,
    schema: ContractSchema,
    policy: EndorsementPolicy,
    commit_timeout: Duration,
    metrics: Arc<GatewayMetrics>,
}

struct Prepared {
    client: Arc<LedgerClient>,
    targets: Vec<PeerEndpoint>,
    proposal: SignedProposal,
}

impl TransactionGateway {
    pub fn new(
        clients: Arc<LedgerClientFactory>,
        schema: ContractSchema,
        policy: EndorsementPolicy,
        commit_timeout: Duration,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            clients,
            schema,
            policy,
            commit_timeout,
            metrics,
        }
    }

    pub async fn query(
        &self,
        peers: &[String],
        channel: &ChannelConfig,
        function: &str,
        args: Vec<String>,
        identity: Arc<Identity>,
    ) -> Result<TransactionResult> {
        let outcome = self
            .query_inner(peers, channel, function, args, identity)
            .await;
        self.metrics.record_query();
        if outcome.is_err() {
            self.metrics.record_query_failed();
        }
        outcome
    }

    pub async fn invoke(
        &self,
        peers: &[String],
        channel: &ChannelConfig,
        function: &str,
        args: Vec<String>,
        identity: Arc<Identity>,
    ) -> Result<TransactionResult> {
        let outcome = self
            .invoke_inner(peers, channel, function, args, identity)
            .await;
        match &outcome {
            Ok(result) => {
                self.metrics.record_invoke_committed();
                log::info!(
                    "Invoke {} committed in block {:?}",
                    result.tx_id,
                    result.block_number
                );
            }
            Err(e) => {
                self.metrics.record_invoke_failed();
                log::warn!("Invoke of {} failed: {}", function, e);
            }
        }
        outcome
    }

    async fn query_inner(
        &self,
        peers: &[String],
        channel: &ChannelConfig,
        function: &str,
        args: Vec<String>,
        identity: Arc<Identity>,
    ) -> Result<TransactionResult> {
        let prepared = self
            .prepare(Mode::Query, peers, channel, function, args, identity)
            .await?;
        let tx_id = prepared.proposal.tx_id.clone();
        let outcomes = fan_out(&prepared, Mode::Query).await;

        let responses: Vec<PeerResponse> = outcomes.iter().map(peer_response).collect();
        let Some(first) = responses.iter().find(|r| r.is_success()) else {
            return Err(GatewayError::Evaluation {
                function: function.to_string(),
                messages: responses
                    .iter()
                    .map(|r| format!("{}: {}", r.peer, r.message))
                    .collect(),
            });
        };

        Ok(TransactionResult {
            tx_id,
            mode: Mode::Query,
            payload: first.payload.clone(),
            responses,
            success: true,
            block_number: None,
        })
    }

    async fn invoke_inner(
        &self,
        peers: &[String],
        channel: &ChannelConfig,
        function: &str,
        args: Vec<String>,
        identity: Arc<Identity>,
    ) -> Result<TransactionResult> {
        let prepared = self
            .prepare(Mode::Invoke, peers, channel, function, args, identity)
            .await?;
        let tx_id = prepared.proposal.tx_id.clone();
        let outcomes = fan_out(&prepared, Mode::Invoke).await;
        let responses: Vec<PeerResponse> = outcomes.iter().map(peer_response).collect();

        let endorsements: Vec<ProposalResponse> = outcomes
            .into_iter()
            .filter_map(|(_, outcome)| outcome.ok())
            .filter(|r| r.is_success())
            .collect();

        // An invoke with no endorsement is never submitted, whatever the policy.
        let required = self.policy.required(prepared.targets.len()).max(1);
        if endorsements.len() < required {
            return Err(GatewayError::Endorsement {
                endorsed: endorsements.len(),
                required,
                messages: responses
                    .iter()
                    .filter(|r| !r.is_success())
                    .map(|r| format!("{}: {}", r.peer, r.message))
                    .collect(),
            });
        }

        let reference = &endorsements[0];
        if let Some(diverging) = endorsements.iter().find(|e| !e.same_result(reference)) {
            return Err(GatewayError::EndorsementMismatch {
                peer: diverging.peer.clone(),
                reference: reference.peer.clone(),
            });
        }
        let payload = reference.payload.clone();

        let commit_peer = prepared
            .targets
            .iter()
            .find(|p| p.name == reference.peer)
            .cloned()
            .ok_or_else(|| GatewayError::Connection(format!("unknown peer {}", reference.peer)))?;

        let client = &prepared.client;
        let session = client.session();
        let commit = {
            let _permit = client.permit().await?;
            session.watch_commit(&commit_peer, &tx_id).await?
        };

        let transaction = SignedTransaction {
            tx_id: tx_id.clone(),
            proposal: prepared.proposal.clone(),
            endorsements,
        };
        {
            let _permit = client.permit().await?;
            session
                .submit(&transaction)
                .await
                .map_err(|e| GatewayError::Submission {
                    tx_id: tx_id.clone(),
                    reason: e.to_string(),
                })?;
        }
        log::info!(
            "Submitted {} to the orderer, waiting for commit on {}",
            tx_id,
            commit_peer.name
        );

        let event = match timeout(self.commit_timeout, commit).await {
            Ok(Ok(event)) => event,
            Ok(Err(_)) => {
                return Err(GatewayError::Connection(format!(
                    "commit listener for {} closed",
                    tx_id
                )));
            }
            Err(_) => {
                return Err(GatewayError::CommitTimeout {
                    tx_id,
                    waited_ms: self.commit_timeout.as_millis() as u64,
                });
            }
        };
        if event.status != TxValidationCode::Valid {
            return Err(GatewayError::CommitRejected {
                tx_id,
                status: event.status.to_string(),
            });
        }

        Ok(TransactionResult {
            tx_id,
            mode: Mode::Invoke,
            responses,
            payload,
            success: true,
            block_number: Some(event.block_number),
        })
    }

    /// Validation, peer resolution and signing all happen before the first
    /// network call.
    async fn prepare(
        &self,
        mode: Mode,
        peers: &[String],
        channel: &ChannelConfig,
        function: &str,
        args: Vec<String>,
        identity: Arc<Identity>,
    ) -> Result<Prepared> {
        self.schema.validate(function, &args)?;
        let targets = channel.resolve_peers(peers)?;

        let organization = identity.organization.clone();
        let request = TransactionRequest::new(function, args, identity, mode);
        let client = self
            .clients
            .get_client(&organization, request.identity().clone(), channel)
            .await?;
        let proposal = Proposal::new(&request, channel).sign(&request)?;

        log::info!(
            "##### {} {} on {}/{} as {}@{} via [{}], tx {}",
            mode,
            function,
            channel.channel_name,
            channel.chaincode_name,
            request.identity().username,
            organization,
            targets
                .iter()
                .map(|p| p.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            proposal.tx_id
        );
        log::debug!("##### {} args: {:?}", function, request.args());

        Ok(Prepared {
            client,
            targets,
            proposal,
        })
    }
}

fn peer_response((peer, outcome): &(PeerEndpoint, Result<ProposalResponse>)) -> PeerResponse {
    match outcome {
        Ok(response) => PeerResponse::from(response),
        Err(e) => PeerResponse {
            peer: peer.name.clone(),
            status: 0,
            message: e.to_string(),
            payload: Vec::new(),
        },
    }
}

/// Sends the proposal to every target concurrently; results keep target order.
async fn fan_out(
    prepared: &Prepared,
    mode: Mode,
) -> Vec<(PeerEndpoint, Result<ProposalResponse>)> {
    let mut tasks = JoinSet::new();
    for (index, peer) in prepared.targets.iter().cloned().enumerate() {
        let client = prepared.client.clone();
        let proposal = prepared.proposal.clone();
        tasks.spawn(async move {
            let outcome = async {
                let _permit = client.permit().await?;
                match mode {
                    Mode::Query => client.session().evaluate(&peer, &proposal).await,
                    Mode::Invoke => client.session().endorse(&peer, &proposal).await,
                }
            }
            .await;
            (index, peer, outcome)
        });
    }

    let mut results: Vec<Option<(PeerEndpoint, Result<ProposalResponse>)>> =
        prepared.targets.iter().map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, peer, outcome)) => {
                if let Err(e) = &outcome {
                    log::warn!("Peer {} failed: {}", peer.name, e);
                }
                results[index] = Some((peer, outcome));
            }
            Err(e) => log::error!("Peer task aborted: {}", e),
        }
    }

    results
        .into_iter()
        .zip(prepared.targets.iter())
        .map(|(slot, peer)| {
            slot.unwrap_or_else(|| {
                (
                    peer.clone(),
                    Err(GatewayError::Connection(format!("peer {} task aborted", peer.name))),
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerEndpoint;
    use crate::error::ErrorKind;
    use crate::identity::{IdentityManager, LocalCertificateAuthority};
    use crate::network::{PeerBehavior, SimulatedFabricNetwork};
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        network: Arc<SimulatedFabricNetwork>,
        gateway: TransactionGateway,
        channel: ChannelConfig,
        admin: Arc<Identity>,
        metrics: Arc<GatewayMetrics>,
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    async fn harness(policy: EndorsementPolicy, commit_timeout: Duration) -> Harness {
        let network = Arc::new(SimulatedFabricNetwork::new());
        let metrics = Arc::new(GatewayMetrics::new());
        let clients = Arc::new(LedgerClientFactory::new(
            network.clone(),
            4,
            8,
            metrics.clone(),
        ));
        let gateway = TransactionGateway::new(
            clients,
            ContractSchema::bank(),
            policy,
            commit_timeout,
            metrics.clone(),
        );
        let channel = ChannelConfig::new(
            "mychannel",
            "bank",
            vec![
                PeerEndpoint::new("peer0", "grpcs://peer0.org1:7051"),
                PeerEndpoint::new("peer1", "grpcs://peer1.org1:7051"),
                PeerEndpoint::new("peer2", "grpcs://peer2.org1:7051"),
            ],
        );
        let ca = Arc::new(LocalCertificateAuthority::new("Org1", "Org1MSP"));
        ca.add_user("admin", "adminpw").await;
        let identities = IdentityManager::new().with_authority(ca);
        identities.add_credentials("admin", "Org1", "adminpw").await;
        let admin = identities.get_identity("admin", "Org1", true).await.unwrap();

        let harness = Harness {
            network,
            gateway,
            channel,
            admin,
            metrics,
        };
        harness
            .invoke("createAccount", &["Alice", "A100", "500", "USD"])
            .await
            .unwrap();
        harness
    }

    impl Harness {
        async fn invoke(&self, function: &str, values: &[&str]) -> Result<TransactionResult> {
            self.gateway
                .invoke(&[], &self.channel, function, args(values), self.admin.clone())
                .await
        }

        async fn query(&self, function: &str, values: &[&str]) -> Result<TransactionResult> {
            self.gateway
                .query(&[], &self.channel, function, args(values), self.admin.clone())
                .await
        }
    }

    #[tokio::test]
    async fn transfer_commits_with_agreeing_endorsements() {
        let h = harness(EndorsementPolicy::All, Duration::from_secs(5)).await;
        let result = assert_ok!(h.invoke("transfer", &["A100", "BANK2", "B200", "50.00"]).await);

        assert!(result.success);
        assert_eq!(result.responses.len(), 3);
        assert!(result.block_number.is_some());
        assert_eq!(h.network.submission_count(), 2);

        let account = h.query("queryAccount", &["A100"]).await.unwrap();
        assert_eq!(account.first_json().unwrap()["balance"], "450.00");
    }

    #[tokio::test]
    async fn below_quorum_never_reaches_the_orderer() {
        let h = harness(EndorsementPolicy::All, Duration::from_secs(5)).await;
        h.network
            .set_peer_behavior("peer1", PeerBehavior::Down)
            .await;
        h.network
            .set_peer_behavior("peer2", PeerBehavior::Refuse("busy".into()))
            .await;
        let submitted = h.network.submission_count();

        let err = assert_err!(h.invoke("transfer", &["A100", "BANK2", "B200", "50.00"]).await);
        match err {
            GatewayError::Endorsement {
                endorsed, required, ..
            } => {
                assert_eq!(endorsed, 1);
                assert_eq!(required, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.network.submission_count(), submitted);
    }

    #[tokio::test]
    async fn zero_quorum_still_needs_one_endorsement() {
        let h = harness(EndorsementPolicy::AtLeast(0), Duration::from_secs(5)).await;
        for peer in ["peer0", "peer1", "peer2"] {
            h.network.set_peer_behavior(peer, PeerBehavior::Down).await;
        }
        let submitted = h.network.submission_count();

        let err = assert_err!(h.invoke("deposit", &["A100", "1"]).await);
        match err {
            GatewayError::Endorsement {
                endorsed, required, ..
            } => {
                assert_eq!(endorsed, 0);
                assert_eq!(required, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(h.network.submission_count(), submitted);
    }

    #[tokio::test]
    async fn majority_policy_tolerates_one_down_peer() {
        let h = harness(EndorsementPolicy::Majority, Duration::from_secs(5)).await;
        h.network
            .set_peer_behavior("peer0", PeerBehavior::Down)
            .await;
        let result = assert_ok!(h.invoke("deposit", &["A100", "10"]).await);
        assert_eq!(result.responses[0].status, 0);
        assert!(result.success);
    }

    #[tokio::test]
    async fn diverging_endorsement_is_a_hard_failure() {
        let h = harness(EndorsementPolicy::All, Duration::from_secs(5)).await;
        h.network
            .set_peer_behavior("peer2", PeerBehavior::Diverge)
            .await;
        let submitted = h.network.submission_count();

        let err = assert_err!(h.invoke("transfer", &["A100", "BANK2", "B200", "50.00"]).await);
        assert_eq!(err.kind(), ErrorKind::EndorsementMismatch);
        assert_eq!(h.network.submission_count(), submitted);
    }

    #[tokio::test]
    async fn orderer_failure_is_a_submission_error() {
        let h = harness(EndorsementPolicy::All, Duration::from_secs(5)).await;
        h.network.set_orderer_available(false);
        let err = assert_err!(h.invoke("deposit", &["A100", "10"]).await);
        assert_eq!(err.kind(), ErrorKind::Submission);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_commit_event_times_out() {
        let h = harness(EndorsementPolicy::All, Duration::from_millis(200)).await;
        h.network.set_deliver_commits(false);
        let err = assert_err!(h.invoke("deposit", &["A100", "10"]).await);
        assert_eq!(err.kind(), ErrorKind::CommitTimeout);
        assert_eq!(h.metrics.snapshot().invokes_failed, 1);
    }

    #[tokio::test]
    async fn invalid_commit_is_reported_as_failure() {
        let h = harness(EndorsementPolicy::All, Duration::from_secs(5)).await;
        h.network
            .force_commit_status(Some("MVCC_READ_CONFLICT".into()))
            .await;
        let err = assert_err!(h.invoke("deposit", &["A100", "10"]).await);
        assert_eq!(err.kind(), ErrorKind::CommitRejected);
    }

    #[tokio::test]
    async fn wrong_arity_is_rejected_before_any_network_call() {
        let h = harness(EndorsementPolicy::All, Duration::from_secs(5)).await;
        let connections = h.network.connection_count();
        let submitted = h.network.submission_count();

        let err = assert_err!(h.invoke("transfer", &["A100", "BANK2", "50.00"]).await);
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(h.network.connection_count(), connections);
        assert_eq!(h.network.submission_count(), submitted);
    }

    #[tokio::test]
    async fn query_returns_each_peer_payload_unmodified() {
        let h = harness(EndorsementPolicy::All, Duration::from_secs(5)).await;
        let result = assert_ok!(h.query("queryAccount", &["A100"]).await);
        let payloads = result.json_payloads();

        assert_eq!(payloads.len(), 3);
        assert_eq!(
            payloads[0],
            json!({"name": "Alice", "id": "A100", "balance": "500", "currency": "USD"})
        );
        assert!(payloads.iter().all(|p| p == &payloads[0]));
    }

    #[tokio::test]
    async fn query_fails_only_when_every_peer_rejects() {
        let h = harness(EndorsementPolicy::All, Duration::from_secs(5)).await;
        h.network
            .set_peer_behavior("peer0", PeerBehavior::Down)
            .await;
        h.network
            .set_peer_behavior("peer1", PeerBehavior::Refuse("no".into()))
            .await;
        let partial = assert_ok!(h.query("queryAccount", &["A100"]).await);
        assert_eq!(partial.json_payloads().len(), 1);

        h.network
            .set_peer_behavior("peer2", PeerBehavior::Down)
            .await;
        let err = assert_err!(h.query("queryAccount", &["A100"]).await);
        assert_eq!(err.kind(), ErrorKind::Evaluation);
    }

    #[tokio::test]
    async fn unknown_peer_names_are_rejected() {
        let h = harness(EndorsementPolicy::All, Duration::from_secs(5)).await;
        let err = h
            .gateway
            .query(
                &["peer9".to_string()],
                &h.channel,
                "queryAccount",
                args(&["A100"]),
                h.admin.clone(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }
}
