//! Rune-aware custody: the runestone codec, the ord indexer client and the rune wallet.

pub mod ord;
pub mod runestone;
pub mod types;
pub mod wallet;

pub use types::{Edict, Rune, RuneId, RuneTransfer};
pub use wallet::{OrdMultisig, TARGET_POSTAGE_SAT};
