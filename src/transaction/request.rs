use crate::error::{GatewayError, Result};
use crate::identity::Identity;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Query,
    Invoke,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Query => write!(f, "query"),
            Mode::Invoke => write!(f, "invoke"),
        }
    }
}

/// A single call into the chaincode. Immutable once built.
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    function: String,
    args: Vec<String>,
    identity: Arc<Identity>,
    mode: Mode,
}

impl TransactionRequest {
    pub fn new(
        function: impl Into<String>,
        args: Vec<String>,
        identity: Arc<Identity>,
        mode: Mode,
    ) -> Self {
        Self {
            function: function.into(),
            args,
            identity,
            mode,
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Text,
    /// A base-10 decimal string; never a float.
    Decimal,
}

#[derive(Debug, Clone)]
pub struct FunctionSignature {
    pub name: String,
    pub params: Vec<(String, ParamKind)>,
}

impl FunctionSignature {
    pub fn new(name: &str, params: &[(&str, ParamKind)]) -> Self {
        Self {
            name: name.to_string(),
            params: params
                .iter()
                .map(|(n, k)| (n.to_string(), *k))
                .collect(),
        }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

/// Positional parameter lists of the chaincode functions the gateway may call.
#[derive(Debug, Clone, Default)]
pub struct ContractSchema {
    functions: HashMap<String, FunctionSignature>,
}

impl ContractSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function(mut self, signature: FunctionSignature) -> Self {
        self.functions.insert(signature.name.clone(), signature);
        self
    }

    pub fn bank() -> Self {
        use ParamKind::{Decimal, Text};
        Self::new()
            .with_function(FunctionSignature::new(
                "createAccount",
                &[
                    ("name", Text),
                    ("accountNumber", Text),
                    ("balance", Decimal),
                    ("currency", Text),
                ],
            ))
            .with_function(FunctionSignature::new(
                "queryAccount",
                &[("accountNumber", Text)],
            ))
            .with_function(FunctionSignature::new(
                "transfer",
                &[
                    ("fromAccount", Text),
                    ("toBankId", Text),
                    ("toAccount", Text),
                    ("amount", Decimal),
                ],
            ))
            .with_function(FunctionSignature::new(
                "deposit",
                &[("accountNumber", Text), ("amount", Decimal)],
            ))
            .with_function(FunctionSignature::new(
                "getTransactionHistory",
                &[("accountNumber", Text)],
            ))
    }

    pub fn signature(&self, function: &str) -> Option<&FunctionSignature> {
        self.functions.get(function)
    }

    pub fn validate(&self, function: &str, args: &[String]) -> Result<()> {
        let signature = self
            .signature(function)
            .ok_or_else(|| GatewayError::validation(function, "unknown chaincode function"))?;

        if args.len() != signature.arity() {
            let names: Vec<&str> = signature.params.iter().map(|(n, _)| n.as_str()).collect();
            return Err(GatewayError::validation(
                function,
                format!(
                    "expected {} arguments [{}], got {}",
                    signature.arity(),
                    names.join(", "),
                    args.len()
                ),
            ));
        }

        for ((name, kind), value) in signature.params.iter().zip(args) {
            match kind {
                ParamKind::Text if value.is_empty() => {
                    return Err(GatewayError::validation(function, format!("{} is empty", name)));
                }
                ParamKind::Decimal if Decimal::from_str(value).is_err() => {
                    return Err(GatewayError::validation(
                        function,
                        format!("{} is not a decimal string: {}", name, value),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
