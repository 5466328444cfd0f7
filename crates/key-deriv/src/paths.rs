//! BIP32 paths for deposit addresses.
//!
//! ```text
//! m/1/<a0>/<a1>/<a2>/<a3>/<a4>/<a5>/<a6>/<index>
//! ```
//!
//! `a0..a5` are 3-byte big-endian chunks of the 20-byte EVM address and `a6` holds the last two
//! bytes. Every component is below 2^24 so the whole path stays non-hardened.
//!
//! Changing anything here changes every deposit address ever handed out.
use bitcoin::bip32::ChildNumber;

/// Base path for all per-user deposit addresses: `m/1`.
pub(crate) const DEPOSIT_BASE_PATH: &[ChildNumber] = &[ChildNumber::Normal { index: 1 }];

/// Largest index accepted for a deposit address.
pub const MAX_INDEX: u32 = 100;

/// Size of one address chunk in bytes.
pub(crate) const CHUNK_LEN: usize = 3;

/// Number of path components encoding the 20-byte address.
pub(crate) const NUM_CHUNKS: usize = 20_usize.div_ceil(CHUNK_LEN);
