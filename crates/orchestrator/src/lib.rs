//! Drives the bridges: every poll interval each [`Bridge`] scans its sources, and the leader
//! gathers co-signatures from the other federators and submits what reached the threshold.
//!
//! Two bridges live here:
//!
//! - [`RuneBridge`](runes::RuneBridge) moves runes deposited to the multisig into EVM tokens, and
//!   pays runes back out when tokens are burned.
//! - [`TapBridge`](tap::TapBridge) credits Taproot-Assets deposits on the EVM in signed batches.

pub mod bridge;
pub mod claims;
pub mod errors;
pub mod runes;
pub mod signatures;
pub mod tap;

pub use bridge::{Bridge, BridgeRunner, DEFAULT_POLL_INTERVAL};
pub use errors::{BridgeError, BridgeResult};
pub use signatures::{collect_signatures, CollectConfig};
