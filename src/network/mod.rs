pub mod chaincode;
pub mod client;
pub mod fabric;
pub mod gateway;

pub use chaincode::{ChaincodeHandler, DemoBankContract, Execution, LedgerState};
pub use client::{LedgerClient, LedgerClientFactory};
pub use fabric::{PeerBehavior, SimulatedFabricNetwork};
pub use gateway::{ChannelSession, EventRegistration, LedgerConnector};
