use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A chaincode event observed on a committed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEvent {
    pub event_name: String,
    pub chaincode: String,
    pub block_number: u64,
    pub tx_id: String,
    pub status: String,
    pub payload: Vec<u8>,
}

/// An event as handed from the subscriber to the forwarder.
#[derive(Debug, Clone)]
pub struct DeliveredEvent {
    pub event: LedgerEvent,
    /// Incremented on every reconnect; events carrying an epoch above zero
    /// may repeat ones delivered before the disconnect.
    pub connection_epoch: u64,
    /// Observation order within the pipeline.
    pub sequence: u64,
}

impl DeliveredEvent {
    pub fn may_be_redelivery(&self) -> bool {
        self.connection_epoch > 0
    }
}

/// One record destined for the downstream stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRecord {
    pub data: String,
    pub partition_key: String,
    pub stream_name: String,
}

impl StreamRecord {
    /// Parses the event payload and routes it by `partition_key_field`.
    /// `data` is the compact JSON of the payload followed by a newline.
    pub fn from_event(
        event: &LedgerEvent,
        partition_key_field: &str,
        stream_name: &str,
    ) -> Result<Self> {
        let undeliverable = |partition_key: &str, reason: String| GatewayError::StreamDelivery {
            stream: stream_name.to_string(),
            partition_key: partition_key.to_string(),
            attempts: 0,
            reason,
        };
        let record: Value = serde_json::from_slice(&event.payload).map_err(|e| {
            undeliverable("-", format!("payload of tx {} is not JSON: {}", event.tx_id, e))
        })?;

        let partition_key = match record.get(partition_key_field) {
            Some(Value::String(key)) if !key.is_empty() => key.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(undeliverable(
                    "-",
                    format!(
                        "payload of tx {} has no routing field {}",
                        event.tx_id, partition_key_field
                    ),
                ));
            }
        };

        let mut data = serde_json::to_string(&record)
            .map_err(|e| undeliverable(&partition_key, e.to_string()))?;
        data.push('\n');

        Ok(Self {
            data,
            partition_key,
            stream_name: stream_name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn event(payload: Value) -> LedgerEvent {
        LedgerEvent {
            event_name: "transfer-event".into(),
            chaincode: "bank".into(),
            block_number: 7,
            tx_id: "tx1".into(),
            status: "VALID".into(),
            payload: serde_json::to_vec(&payload).unwrap(),
        }
    }

    #[test]
    fn routes_by_destination_bank() {
        let payload = json!({"ToBankID": "BANK2", "amount": "50.00"});
        let record =
            StreamRecord::from_event(&event(payload.clone()), "ToBankID", "bank-transfer-events")
                .unwrap();

        assert_eq!(record.partition_key, "BANK2");
        assert_eq!(record.stream_name, "bank-transfer-events");
        assert_eq!(record.data, format!("{}\n", serde_json::to_string(&payload).unwrap()));
    }

    #[test]
    fn preserves_field_order() {
        let raw = br#"{"FromAccNumber":"A100","ToBankID":"BANK2","Amount":"50"}"#;
        let mut ev = event(json!({}));
        ev.payload = raw.to_vec();
        let record = StreamRecord::from_event(&ev, "ToBankID", "s").unwrap();
        assert_eq!(record.data.as_bytes(), [raw.as_slice(), b"\n".as_slice()].concat().as_slice());
    }

    #[test]
    fn rejects_missing_routing_field_and_non_json() {
        let missing = StreamRecord::from_event(&event(json!({"amount": "1"})), "ToBankID", "s");
        assert_eq!(missing.unwrap_err().kind(), ErrorKind::StreamDelivery);

        let mut ev = event(json!({}));
        ev.payload = b"not json".to_vec();
        let malformed = StreamRecord::from_event(&ev, "ToBankID", "s");
        assert_eq!(malformed.unwrap_err().kind(), ErrorKind::StreamDelivery);
    }

    #[test]
    fn wire_shape_uses_stream_field_names() {
        let record = StreamRecord {
            data: "{}\n".into(),
            partition_key: "BANK2".into(),
            stream_name: "s".into(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["partitionKey"], "BANK2");
        assert_eq!(value["streamName"], "s");
        assert_eq!(value["data"], "{}\n");
    }
}
