use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters shared by the transaction path and the event pipeline.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    queries: AtomicU64,
    queries_failed: AtomicU64,
    invokes_committed: AtomicU64,
    invokes_failed: AtomicU64,
    events_received: AtomicU64,
    records_forwarded: AtomicU64,
    forward_retries: AtomicU64,
    delivery_gaps: AtomicU64,
    subscriber_reconnects: AtomicU64,
    client_cache_hits: AtomicU64,
    client_cache_misses: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_query, queries);
    counter!(record_query_failed, queries_failed);
    counter!(record_invoke_committed, invokes_committed);
    counter!(record_invoke_failed, invokes_failed);
    counter!(record_event_received, events_received);
    counter!(record_forwarded, records_forwarded);
    counter!(record_forward_retry, forward_retries);
    counter!(record_delivery_gap, delivery_gaps);
    counter!(record_reconnect, subscriber_reconnects);
    counter!(record_cache_hit, client_cache_hits);
    counter!(record_cache_miss, client_cache_misses);

    pub fn client_cache_hit_rate(&self) -> f64 {
        let hits = self.client_cache_hits.load(Ordering::Relaxed);
        let misses = self.client_cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;

        if total == 0 {
            return 0.0;
        }

        (hits as f64 / total as f64) * 100.0
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            queries: self.queries.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            invokes_committed: self.invokes_committed.load(Ordering::Relaxed),
            invokes_failed: self.invokes_failed.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            records_forwarded: self.records_forwarded.load(Ordering::Relaxed),
            forward_retries: self.forward_retries.load(Ordering::Relaxed),
            delivery_gaps: self.delivery_gaps.load(Ordering::Relaxed),
            subscriber_reconnects: self.subscriber_reconnects.load(Ordering::Relaxed),
            client_cache_hit_rate: self.client_cache_hit_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub queries: u64,
    pub queries_failed: u64,
    pub invokes_committed: u64,
    pub invokes_failed: u64,
    pub events_received: u64,
    pub records_forwarded: u64,
    pub forward_retries: u64,
    pub delivery_gaps: u64,
    pub subscriber_reconnects: u64,
    pub client_cache_hit_rate: f64,
}

impl MetricsSnapshot {
    pub fn print_report(&self) {
        log::info!("Gateway metrics at {}", self.timestamp);
        log::info!(
            "  queries: {} ({} failed)",
            self.queries,
            self.queries_failed
        );
        log::info!(
            "  invokes: {} committed, {} failed",
            self.invokes_committed,
            self.invokes_failed
        );
        log::info!(
            "  events: {} received, {} forwarded, {} retries, {} delivery gaps",
            self.events_received,
            self.records_forwarded,
            self.forward_retries,
            self.delivery_gaps
        );
        log::info!("  subscriber reconnects: {}", self.subscriber_reconnects);
        log::info!("  client cache hit rate: {:.2}%", self.client_cache_hit_rate);
    }

    /// Appends one row, writing the header only when the file is new.
    pub fn save_to_csv(
        &self,
        filename: impl AsRef<Path>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let path = filename.as_ref();
        let file_exists = path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        let mut wtr = csv::WriterBuilder::new()
            .has_headers(!file_exists)
            .from_writer(file);
        wtr.serialize(self)?;
        wtr.flush()?;
        Ok(())
    }
}
