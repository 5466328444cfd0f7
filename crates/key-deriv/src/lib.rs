//! Deterministic key and deposit address derivation shared by every federator.
//!
//! Every cosigner maps an EVM account address and an index to the same BIP32 path, derives its
//! child key at that path, and ends up with the same `k`-of-`n` P2WSH deposit address.
//!
//! # Usage
//!
//! ```rust,ignore
//! use federator_key_deriv::{derive_deposit_address_info, derive_path};
//!
//! let path = derive_path("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed", 0)?;
//! let info = derive_deposit_address_info(&xpubs, 2, evm_address, 0, &params)?;
//! println!("deposit to {}", info.address);
//! ```

pub mod address;
pub mod derive;

// Internal module, callers go through the derivation functions.
mod paths;

pub use address::{derive_deposit_address_info, multisig_redeem_script, DepositAddressInfo};
pub use derive::{derive_path, derive_privkey, derive_pubkey, path_to_evm_address, DerivationError};
pub use paths::MAX_INDEX;
