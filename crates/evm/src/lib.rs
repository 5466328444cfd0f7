//! Everything the federator does on the EVM side: signing message hashes, talking to the bridge
//! contracts and scanning their events.
//!
//! The contracts are reached through [`RuneBridgeContract`] and [`TapBridgeContract`]; the
//! alloy-backed implementations live in [`client`].

pub mod client;
pub mod contracts;
pub mod errors;
pub mod scanner;
pub mod signer;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use contracts::{
    AcceptTransferFromBtc, RuneBridgeContract, RuneTransferToBtc, TapBridgeContract, TapTransfer,
    TransactionTracker, TransferToTap,
};
pub use errors::{EvmError, EvmResult};
pub use scanner::{EventBatch, EventScanner, EventSource, TransfersToTap};
