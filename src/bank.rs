use crate::error::{GatewayError, Result};
use crate::identity::Identity;
use crate::service::LedgerService;
use crate::transaction::TransactionResult;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Body of a transfer, in the field names the bank front end sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    #[serde(rename = "FromAccNumber")]
    pub from_account: String,
    #[serde(rename = "ToBankID")]
    pub to_bank_id: String,
    #[serde(rename = "ToAccNumber")]
    pub to_account: String,
    #[serde(rename = "Amount")]
    pub amount: Decimal,
}

impl TransferRequest {
    /// Positional chaincode arguments, amount as a decimal string.
    pub fn to_args(&self) -> Result<Vec<String>> {
        positive("transfer", self.amount)?;
        Ok(vec![
            self.from_account.clone(),
            self.to_bank_id.clone(),
            self.to_account.clone(),
            self.amount.to_string(),
        ])
    }
}

fn positive(function: &str, amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(GatewayError::validation(
            function,
            format!("amount must be positive, got {}", amount),
        ));
    }
    Ok(())
}

/// Typed access to the bank chaincode on one channel.
pub struct BankContract {
    service: Arc<LedgerService>,
    channel_name: String,
    chaincode_name: String,
    peers: Vec<String>,
}

impl BankContract {
    /// Targets every configured peer of the service's channel.
    pub fn new(service: Arc<LedgerService>) -> Self {
        let channel = &service.config().channel;
        Self {
            channel_name: channel.channel_name.clone(),
            chaincode_name: channel.chaincode_name.clone(),
            peers: Vec::new(),
            service,
        }
    }

    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }

    async fn query(
        &self,
        function: &str,
        args: Vec<String>,
        identity: Arc<Identity>,
    ) -> Result<Value> {
        let results = self
            .service
            .query_ledger(
                &self.peers,
                &self.channel_name,
                &self.chaincode_name,
                args,
                function,
                identity,
            )
            .await?;
        Ok(results.into_iter().next().unwrap_or(Value::Null))
    }

    async fn invoke(
        &self,
        function: &str,
        args: Vec<String>,
        identity: Arc<Identity>,
    ) -> Result<TransactionResult> {
        self.service
            .invoke_ledger(
                &self.peers,
                &self.channel_name,
                &self.chaincode_name,
                args,
                function,
                identity,
            )
            .await
    }

    /// The account object as the first answering peer returned it; `null`
    /// when the account does not exist.
    pub async fn query_account(&self, identity: Arc<Identity>, account: &str) -> Result<Value> {
        self.query("queryAccount", vec![account.to_string()], identity)
            .await
    }

    pub async fn transaction_history(
        &self,
        identity: Arc<Identity>,
        account: &str,
    ) -> Result<Vec<Value>> {
        let body = self
            .query("getTransactionHistory", vec![account.to_string()], identity)
            .await?;
        Ok(match body.get("History") {
            Some(Value::Array(entries)) => entries.clone(),
            _ => Vec::new(),
        })
    }

    pub async fn transfer(
        &self,
        identity: Arc<Identity>,
        request: &TransferRequest,
    ) -> Result<TransactionResult> {
        let args = request.to_args()?;
        self.invoke("transfer", args, identity).await
    }

    pub async fn create_account(
        &self,
        identity: Arc<Identity>,
        name: &str,
        account: &str,
        opening_balance: Decimal,
        currency: &str,
    ) -> Result<TransactionResult> {
        if opening_balance < Decimal::ZERO {
            return Err(GatewayError::validation(
                "createAccount",
                "opening balance cannot be negative",
            ));
        }
        let args = vec![
            name.to_string(),
            account.to_string(),
            opening_balance.to_string(),
            currency.to_string(),
        ];
        self.invoke("createAccount", args, identity).await
    }

    pub async fn deposit(
        &self,
        identity: Arc<Identity>,
        account: &str,
        amount: Decimal,
    ) -> Result<TransactionResult> {
        positive("deposit", amount)?;
        self.invoke("deposit", vec![account.to_string(), amount.to_string()], identity)
            .await
    }
}
