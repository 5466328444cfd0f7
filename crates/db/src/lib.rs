//! Persistence for the federator: scan checkpoints, bridge records and the claims it signed.
//!
//! Each concern is a trait ([`KeyValueStore`], [`RuneBridgeDb`], [`TapBridgeDb`], [`EvmToTapDb`],
//! [`SignedClaimsDb`]) implemented by both the SQLite store and the in-memory store used in tests.
//! Status columns only ever move forward; both stores refuse a backwards transition with
//! [`DbError::InvalidTransition`].

/// Taproot-Assets transfers and their batches.
pub mod batches;
/// Claims this federator signed.
pub mod claims;
/// Errors returned by every store.
pub mod errors;
/// A store kept in memory, for tests and dry runs.
pub mod inmemory;
/// Scan checkpoints and other small values.
pub mod kv;
/// The SQLite store.
pub mod persistent;
/// Rune deposits and their EVM transfers.
pub mod runes;
/// Records and statuses.
pub mod types;

#[cfg(test)]
mod store_tests;

pub use batches::{EvmToTapDb, TapBridgeDb};
pub use claims::SignedClaimsDb;
pub use errors::{DbError, DbResult};
pub use inmemory::InMemoryDb;
pub use kv::KeyValueStore;
pub use persistent::{config::DbConfig, sqlite::SqliteDb};
pub use runes::RuneBridgeDb;

/// Everything the bridges persist.
pub trait Database:
    KeyValueStore + RuneBridgeDb + TapBridgeDb + EvmToTapDb + SignedClaimsDb + Send + Sync + std::fmt::Debug
{
}

impl<T> Database for T where
    T: KeyValueStore
        + RuneBridgeDb
        + TapBridgeDb
        + EvmToTapDb
        + SignedClaimsDb
        + Send
        + Sync
        + std::fmt::Debug
{
}
