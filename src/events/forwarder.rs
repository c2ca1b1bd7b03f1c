use super::event::{DeliveredEvent, StreamRecord};
use super::stream::StreamClient;
use crate::config::{Backoff, ForwarderConfig};
use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, sleep, timeout};

/// Turns delivered ledger events into stream records and puts them on the
/// downstream stream.
///
/// Each partition key gets its own lane task, so a key that is retrying
/// never holds up the others while records of one key keep their order.
/// A lane with nothing queued for `lane_idle` retires; the next record for
/// its key starts a fresh lane once the old one has drained.
pub struct EventForwarder {
    lane: Arc<Lane>,
    partition_key_field: String,
    shutdown_grace: Duration,
}

struct Lane {
    stream: Arc<dyn StreamClient>,
    stream_name: String,
    max_retries: u32,
    backoff: Backoff,
    idle: Duration,
    /// Records accepted by a lane and not yet delivered or given up on.
    backlog: AtomicUsize,
    live: AtomicUsize,
    metrics: Arc<GatewayMetrics>,
}

/// Dispatcher side of one partition lane.
struct LaneEntry {
    records: mpsc::UnboundedSender<StreamRecord>,
    finished: oneshot::Receiver<()>,
}

impl LaneEntry {
    fn is_finished(&mut self) -> bool {
        matches!(self.finished.try_recv(), Err(TryRecvError::Closed))
    }
}

pub struct ForwarderHandle {
    sender: mpsc::UnboundedSender<DeliveredEvent>,
    lane: Arc<Lane>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ForwarderHandle {
    /// Channel the subscriber delivers into.
    pub fn sender(&self) -> mpsc::UnboundedSender<DeliveredEvent> {
        self.sender.clone()
    }

    /// Partition lanes currently running.
    pub fn active_lanes(&self) -> usize {
        self.lane.live.load(Ordering::SeqCst)
    }

    /// Queues an event and returns immediately.
    pub fn forward(&self, event: DeliveredEvent) {
        if let Err(rejected) = self.sender.send(event) {
            log::warn!(
                "Forwarder stopped, dropping event from tx {}",
                rejected.0.event.tx_id
            );
        }
    }

    /// Stops accepting events, then gives queued and in-flight records the
    /// configured grace period. Every record still undelivered after that
    /// counts as one delivery gap.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        drop(self.sender);
        if let Err(e) = self.task.await {
            log::error!("Forwarder task failed: {}", e);
        }
    }
}

impl EventForwarder {
    pub fn new(
        stream: Arc<dyn StreamClient>,
        stream_name: impl Into<String>,
        partition_key_field: impl Into<String>,
        config: &ForwarderConfig,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            lane: Arc::new(Lane {
                stream,
                stream_name: stream_name.into(),
                max_retries: config.max_retries,
                backoff: config.backoff(),
                idle: config.lane_idle(),
                backlog: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                metrics,
            }),
            partition_key_field: partition_key_field.into(),
            shutdown_grace: config.shutdown_grace(),
        }
    }

    pub fn spawn(self) -> ForwarderHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (stop, stopped) = oneshot::channel();
        let lane = self.lane.clone();
        let task = tokio::spawn(self.run(receiver, stopped));
        ForwarderHandle {
            sender,
            lane,
            stop,
            task,
        }
    }

    async fn run(
        self,
        mut receiver: mpsc::UnboundedReceiver<DeliveredEvent>,
        mut stopped: oneshot::Receiver<()>,
    ) {
        let mut lanes: HashMap<String, LaneEntry> = HashMap::new();
        let mut tasks = JoinSet::new();
        let mut stopping = false;

        loop {
            let delivered = tokio::select! {
                biased;
                next = receiver.recv() => match next {
                    Some(delivered) => delivered,
                    None => break,
                },
                _ = &mut stopped, if !stopping => {
                    stopping = true;
                    receiver.close();
                    continue;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok(key) => {
                            if lanes.get_mut(&key).is_some_and(LaneEntry::is_finished) {
                                lanes.remove(&key);
                            }
                        }
                        Err(e) => log::error!("Partition lane failed: {}", e),
                    }
                    continue;
                }
            };
            self.dispatch(delivered, &mut lanes, &mut tasks);
        }

        drop(lanes);
        let pending = tasks.len();
        if pending == 0 {
            return;
        }
        log::info!(
            "Forwarder draining {} partition lanes (grace {:?})",
            pending,
            self.shutdown_grace
        );
        let drained = timeout(self.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    log::error!("Partition lane failed: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            let lanes = tasks.len();
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            self.lane.live.store(0, Ordering::SeqCst);
            let abandoned = self.lane.backlog.swap(0, Ordering::SeqCst);
            for _ in 0..abandoned {
                self.lane.metrics.record_delivery_gap();
            }
            log::error!(
                "Delivery gap: {} records on {} partition lanes abandoned after {:?}",
                abandoned,
                lanes,
                self.shutdown_grace
            );
        }
    }

    fn dispatch(
        &self,
        delivered: DeliveredEvent,
        lanes: &mut HashMap<String, LaneEntry>,
        tasks: &mut JoinSet<String>,
    ) {
        let record = match StreamRecord::from_event(
            &delivered.event,
            &self.partition_key_field,
            &self.lane.stream_name,
        ) {
            Ok(record) => record,
            Err(e) => {
                self.lane.metrics.record_delivery_gap();
                log::error!(
                    "Delivery gap: skipping event from tx {}: {}",
                    delivered.event.tx_id,
                    e
                );
                return;
            }
        };
        if delivered.may_be_redelivery() {
            log::debug!(
                "Forwarding event from tx {} after reconnect (may repeat)",
                delivered.event.tx_id
            );
        }

        self.lane.backlog.fetch_add(1, Ordering::SeqCst);
        let key = record.partition_key.clone();
        let record = match lanes.get(&key) {
            Some(entry) => match entry.records.send(record) {
                Ok(()) => return,
                Err(retired) => retired.0,
            },
            None => record,
        };

        // The key has no open lane; a retired one may still be draining.
        let previous = lanes.remove(&key).map(|entry| entry.finished);
        let (records, receiver) = mpsc::unbounded_channel();
        let (done, finished) = oneshot::channel();
        self.lane.live.fetch_add(1, Ordering::SeqCst);
        tasks.spawn(self.lane.clone().run(key.clone(), receiver, previous, done));
        if records.send(record).is_err() {
            log::error!("Partition lane {} closed before its first record", key);
        }
        lanes.insert(key, LaneEntry { records, finished });
    }
}

impl Lane {
    async fn run(
        self: Arc<Self>,
        key: String,
        mut records: mpsc::UnboundedReceiver<StreamRecord>,
        previous: Option<oneshot::Receiver<()>>,
        _done: oneshot::Sender<()>,
    ) -> String {
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        log::debug!("Partition lane {} started", key);
        loop {
            match timeout(self.idle, records.recv()).await {
                Ok(Some(record)) => self.deliver_counted(&record).await,
                Ok(None) => break,
                Err(_) => {
                    records.close();
                    while let Some(record) = records.recv().await {
                        self.deliver_counted(&record).await;
                    }
                    log::debug!("Partition lane {} retired after {:?} idle", key, self.idle);
                    break;
                }
            }
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
        key
    }

    async fn deliver_counted(&self, record: &StreamRecord) {
        self.deliver(record).await;
        self.backlog.fetch_sub(1, Ordering::SeqCst);
    }

    async fn deliver(&self, record: &StreamRecord) {
        let mut attempt = 0u32;
        loop {
            let outcome = self
                .stream
                .put_record(&record.stream_name, &record.partition_key, &record.data)
                .await;
            attempt += 1;
            match outcome {
                Ok(sequence) => {
                    self.metrics.record_forwarded();
                    log::debug!(
                        "Put record for {} on {} as {}",
                        record.partition_key,
                        record.stream_name,
                        sequence
                    );
                    return;
                }
                Err(e) if attempt > self.max_retries => {
                    let gap = GatewayError::StreamDelivery {
                        stream: record.stream_name.clone(),
                        partition_key: record.partition_key.clone(),
                        attempts: attempt,
                        reason: e.to_string(),
                    };
                    self.metrics.record_delivery_gap();
                    log::error!("Delivery gap: {}", gap);
                    return;
                }
                Err(e) => {
                    self.metrics.record_forward_retry();
                    let delay = self.backoff.delay(attempt - 1);
                    log::warn!(
                        "Put for {} failed (attempt {}), retrying in {:?}: {}",
                        record.partition_key,
                        attempt,
                        delay,
                        e
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
