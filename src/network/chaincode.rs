use crate::transaction::ChaincodeEvent;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;

/// Committed world state plus per-key history, as seen by chaincode.
#[derive(Debug, Default, Clone)]
pub struct LedgerState {
    values: HashMap<String, Vec<u8>>,
    history: HashMap<String, Vec<(i64, Vec<u8>)>>,
}

impl LedgerState {
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.values.get(key).map(|v| v.as_slice())
    }

    pub fn history(&self, key: &str) -> &[(i64, Vec<u8>)] {
        self.history.get(key).map(|h| h.as_slice()).unwrap_or(&[])
    }

    pub fn apply(&mut self, writes: &[(String, Vec<u8>)]) {
        let now = Utc::now().timestamp();
        for (key, value) in writes {
            self.values.insert(key.clone(), value.clone());
            self.history
                .entry(key.clone())
                .or_default()
                .push((now, value.clone()));
        }
    }
}

/// Outcome of simulating one chaincode call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Execution {
    pub payload: Vec<u8>,
    pub writes: Vec<(String, Vec<u8>)>,
    pub events: Vec<ChaincodeEvent>,
}

/// Chaincode run by simulated peers. Errors become non-200 responses.
pub trait ChaincodeHandler: Send + Sync {
    fn execute(
        &self,
        state: &LedgerState,
        function: &str,
        args: &[String],
    ) -> std::result::Result<Execution, String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Account {
    name: String,
    id: String,
    #[serde(with = "rust_decimal::serde::str")]
    balance: Decimal,
    currency: String,
}

/// Small bank ledger used by the simulator and tests.
pub struct DemoBankContract {
    bank_id: String,
}

impl DemoBankContract {
    pub fn new(bank_id: impl Into<String>) -> Self {
        Self {
            bank_id: bank_id.into(),
        }
    }

    fn load(state: &LedgerState, id: &str) -> Result<Account, String> {
        let bytes = state
            .get(id)
            .ok_or_else(|| format!("account {} does not exist", id))?;
        serde_json::from_slice(bytes).map_err(|e| e.to_string())
    }

    fn store(account: &Account) -> Result<(String, Vec<u8>), String> {
        let bytes = serde_json::to_vec(account).map_err(|e| e.to_string())?;
        Ok((account.id.clone(), bytes))
    }

    fn amount(raw: &str) -> Result<Decimal, String> {
        let amount = Decimal::from_str(raw).map_err(|_| format!("unable to parse amount {}", raw))?;
        if amount <= Decimal::ZERO {
            return Err("amount must be a positive number".into());
        }
        Ok(amount)
    }
}

impl ChaincodeHandler for DemoBankContract {
    fn execute(
        &self,
        state: &LedgerState,
        function: &str,
        args: &[String],
    ) -> Result<Execution, String> {
        match (function, args) {
            ("createAccount", [name, id, balance, currency]) => {
                if state.get(id).is_some() {
                    return Err(format!("account {} already exists", id));
                }
                let balance = Decimal::from_str(balance).map_err(|e| e.to_string())?;
                let account = Account {
                    name: name.clone(),
                    id: id.clone(),
                    balance,
                    currency: currency.clone(),
                };
                Ok(Execution {
                    writes: vec![Self::store(&account)?],
                    ..Execution::default()
                })
            }
            ("queryAccount", [id]) => Ok(Execution {
                payload: state.get(id).map(|v| v.to_vec()).unwrap_or_default(),
                ..Execution::default()
            }),
            ("deposit", [id, amount]) => {
                let mut account = Self::load(state, id)?;
                account.balance += Self::amount(amount)?;
                Ok(Execution {
                    writes: vec![Self::store(&account)?],
                    ..Execution::default()
                })
            }
            ("transfer", [from, to_bank, to, amount]) => {
                let amount = Self::amount(amount)?;
                let mut source = Self::load(state, from)?;
                if source.balance < amount {
                    return Err("account has insufficient funds".into());
                }
                source.balance -= amount;
                let mut writes = vec![Self::store(&source)?];
                // Interbank credits settle downstream from the event.
                if *to_bank == self.bank_id {
                    let mut target = Self::load(state, to)?;
                    target.balance += amount;
                    writes.push(Self::store(&target)?);
                }
                let event = json!({
                    "FromAccNumber": from,
                    "FromBankID": self.bank_id,
                    "ToAccNumber": to,
                    "ToBankID": to_bank,
                    "Amount": amount.to_string(),
                });
                Ok(Execution {
                    payload: Vec::new(),
                    writes,
                    events: vec![ChaincodeEvent {
                        event_name: "transfer-event".into(),
                        payload: serde_json::to_vec(&event).map_err(|e| e.to_string())?,
                    }],
                })
            }
            ("getTransactionHistory", [id]) => {
                let history: Vec<_> = state
                    .history(id)
                    .iter()
                    .map(|(ts, value)| {
                        json!({
                            "Timestamp": ts,
                            "Value": String::from_utf8_lossy(value),
                        })
                    })
                    .collect();
                let payload =
                    serde_json::to_vec(&json!({ "History": history })).map_err(|e| e.to_string())?;
                Ok(Execution {
                    payload,
                    ..Execution::default()
                })
            }
            (other, _) => Err(format!("invalid function or arguments: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn state_with(accounts: &[(&str, &str)]) -> LedgerState {
        let contract = DemoBankContract::new("BANK1");
        let mut state = LedgerState::default();
        for (id, balance) in accounts {
            let exec = contract
                .execute(&state, "createAccount", &args(&["Alice", id, balance, "USD"]))
                .unwrap();
            state.apply(&exec.writes);
        }
        state
    }

    #[test]
    fn interbank_transfer_debits_and_emits_event() {
        let contract = DemoBankContract::new("BANK1");
        let state = state_with(&[("A100", "500")]);
        let exec = contract
            .execute(&state, "transfer", &args(&["A100", "BANK2", "B200", "50.00"]))
            .unwrap();

        assert_eq!(exec.writes.len(), 1);
        let event: serde_json::Value = serde_json::from_slice(&exec.events[0].payload).unwrap();
        assert_eq!(event["ToBankID"], "BANK2");
        assert_eq!(event["Amount"], "50.00");
    }

    #[test]
    fn insufficient_funds_is_refused() {
        let contract = DemoBankContract::new("BANK1");
        let state = state_with(&[("A100", "10")]);
        assert!(
            contract
                .execute(&state, "transfer", &args(&["A100", "BANK2", "B200", "50"]))
                .is_err()
        );
    }

    #[test]
    fn history_lists_every_write() {
        let contract = DemoBankContract::new("BANK1");
        let mut state = state_with(&[("A100", "10")]);
        let exec = contract.execute(&state, "deposit", &args(&["A100", "5"])).unwrap();
        state.apply(&exec.writes);

        let exec = contract
            .execute(&state, "getTransactionHistory", &args(&["A100"]))
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&exec.payload).unwrap();
        assert_eq!(body["History"].as_array().unwrap().len(), 2);
    }
}
