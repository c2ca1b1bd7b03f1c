//! Gateway between a bank's services and a Hyperledger Fabric channel:
//! queries and invokes against the bank chaincode, plus a pipeline that
//! forwards committed transfer events to a partitioned record stream.

pub mod bank;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod metrics;
pub mod network;
pub mod service;
pub mod transaction;

pub use bank::{BankContract, TransferRequest};
pub use config::{ChannelConfig, EndorsementPolicy, GatewayConfig, PeerEndpoint};
pub use error::{ErrorKind, GatewayError, Result};
pub use service::{HealthReport, LedgerService};
