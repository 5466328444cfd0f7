//! The multisig transaction engine.
//!
//! All federators share one `k`-of-`n` P2WSH wallet. This crate builds unsigned PSBTs against it,
//! signs them with the local key, combines co-signatures, finalizes and broadcasts. It also
//! carries the rune-aware variant that moves rune balances with a runestone output.

pub mod descriptor;
pub mod errors;
pub mod fees;
pub mod keys;
pub mod psbt;
pub mod rpc;
pub mod runes;
pub mod wallet;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use errors::MultisigError;
pub use keys::MultisigKeys;
pub use wallet::BitcoinMultisig;
