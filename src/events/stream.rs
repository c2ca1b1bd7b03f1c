use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Downstream record stream. Ordering is only guaranteed within a partition key.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Returns the sequence number assigned to the record.
    async fn put_record(
        &self,
        stream_name: &str,
        partition_key: &str,
        data: &str,
    ) -> Result<String>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SinkRow {
    sequence_number: u64,
    partition_key: String,
    data: String,
}

/// Appends records to `<dir>/<stream>.csv`, one row per record.
pub struct CsvStreamSink {
    dir: PathBuf,
    sequences: Mutex<HashMap<String, u64>>,
}

impl CsvStreamSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| GatewayError::Config(format!("{}: {}", dir.display(), e)))?;
        Ok(Self {
            dir,
            sequences: Mutex::new(HashMap::new()),
        })
    }

    pub fn path_for(&self, stream_name: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", stream_name))
    }

    fn existing_rows(path: &Path) -> u64 {
        csv::Reader::from_path(path)
            .map(|mut reader| reader.records().filter(|r| r.is_ok()).count() as u64)
            .unwrap_or(0)
    }

    fn append(path: &Path, row: &SinkRow) -> std::result::Result<(), csv::Error> {
        let file_exists = path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(!file_exists)
            .from_writer(file);
        wtr.serialize(row)?;
        wtr.flush()?;
        Ok(())
    }
}

#[async_trait]
impl StreamClient for CsvStreamSink {
    async fn put_record(
        &self,
        stream_name: &str,
        partition_key: &str,
        data: &str,
    ) -> Result<String> {
        let path = self.path_for(stream_name);
        let mut sequences = self.sequences.lock().await;
        let next = sequences
            .entry(stream_name.to_string())
            .or_insert_with(|| Self::existing_rows(&path));

        let row = SinkRow {
            sequence_number: *next + 1,
            partition_key: partition_key.to_string(),
            data: data.to_string(),
        };
        Self::append(&path, &row).map_err(|e| GatewayError::StreamDelivery {
            stream: stream_name.to_string(),
            partition_key: partition_key.to_string(),
            attempts: 1,
            reason: e.to_string(),
        })?;
        *next = row.sequence_number;
        Ok(row.sequence_number.to_string())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Duration, sleep};

    /// In-memory stream with scripted failures and per-key latency.
    #[derive(Default)]
    pub struct RecordingStream {
        pub records: Mutex<Vec<(String, String, String)>>,
        failures: Mutex<HashMap<String, usize>>,
        delays: Mutex<HashMap<String, Duration>>,
        pub attempts: AtomicUsize,
    }

    impl RecordingStream {
        /// The next `count` puts for `key` fail.
        pub async fn fail_key(&self, key: &str, count: usize) {
            self.failures.lock().await.insert(key.to_string(), count);
        }

        pub async fn delay_key(&self, key: &str, delay: Duration) {
            self.delays.lock().await.insert(key.to_string(), delay);
        }

        pub async fn data_for(&self, key: &str) -> Vec<String> {
            self.records
                .lock()
                .await
                .iter()
                .filter(|(_, k, _)| k == key)
                .map(|(_, _, data)| data.clone())
                .collect()
        }
    }

    #[async_trait]
    impl StreamClient for RecordingStream {
        async fn put_record(
            &self,
            stream_name: &str,
            partition_key: &str,
            data: &str,
        ) -> Result<String> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let delay = self.delays.lock().await.get(partition_key).copied();
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            let failed = match self.failures.lock().await.get_mut(partition_key) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            if failed {
                return Err(GatewayError::StreamDelivery {
                    stream: stream_name.to_string(),
                    partition_key: partition_key.to_string(),
                    attempts: 1,
                    reason: "ProvisionedThroughputExceeded".into(),
                });
            }
            let mut records = self.records.lock().await;
            records.push((
                stream_name.to_string(),
                partition_key.to_string(),
                data.to_string(),
            ));
            Ok(records.len().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn sink_numbers_records_per_stream() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvStreamSink::new(dir.path()).unwrap();

        assert_eq!(assert_ok!(sink.put_record("transfers", "BANK2", "{\"a\":1}\n").await), "1");
        assert_eq!(assert_ok!(sink.put_record("transfers", "BANK3", "{\"a\":2}\n").await), "2");
        assert_eq!(assert_ok!(sink.put_record("audit", "BANK2", "{}\n").await), "1");

        let mut reader = csv::Reader::from_path(sink.path_for("transfers")).unwrap();
        let rows: Vec<SinkRow> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].partition_key, "BANK3");
        assert_eq!(rows[0].data, "{\"a\":1}\n");
    }

    #[tokio::test]
    async fn sequence_resumes_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let sink = CsvStreamSink::new(dir.path()).unwrap();
            sink.put_record("transfers", "BANK2", "x\n").await.unwrap();
        }
        let sink = CsvStreamSink::new(dir.path()).unwrap();
        assert_eq!(sink.put_record("transfers", "BANK2", "y\n").await.unwrap(), "2");
    }
}
