//! Path derivation and BIP32 child key derivation.

use alloy::primitives::Address as EvmAddress;
use bitcoin::bip32::{self, ChildNumber, DerivationPath, Xpriv, Xpub};
use secp256k1::SECP256K1;
use thiserror::Error;

use crate::paths::{CHUNK_LEN, DEPOSIT_BASE_PATH, MAX_INDEX, NUM_CHUNKS};

/// Errors raised while deriving paths, keys, or addresses.
#[derive(Debug, Error)]
pub enum DerivationError {
    /// BIP32 derivation failed.
    #[error("BIP32 derivation error: {0}")]
    Bip32(#[from] bip32::Error),

    /// The EVM address is not a `0x`-prefixed EIP-55 checksummed address.
    #[error("invalid evm address {0:?} (must be a checksummed, 0x-prefixed EVM address)")]
    InvalidEvmAddress(String),

    /// The index is outside `0..=MAX_INDEX`.
    #[error("index must be at most {MAX_INDEX}, got {0}")]
    IndexOutOfRange(u32),

    /// The path does not have the deposit path layout.
    #[error("not a deposit derivation path: {0}")]
    NotADepositPath(DerivationPath),

    /// `required` is zero or larger than the number of keys.
    #[error("cannot build a {required}-of-{total} multisig")]
    InvalidThreshold {
        /// Signatures required.
        required: usize,
        /// Keys available.
        total: usize,
    },

    /// The address could not be encoded for the network.
    #[error("address encoding failed: {0}")]
    Address(String),
}

/// Maps an EVM address and index to the BIP32 path of the matching deposit key.
///
/// The mapping is lossless: [`path_to_evm_address`] recovers both inputs.
pub fn derive_path(evm_address: &str, index: u32) -> Result<DerivationPath, DerivationError> {
    let address = parse_checksummed(evm_address)?;
    if index > MAX_INDEX {
        return Err(DerivationError::IndexOutOfRange(index));
    }

    let mut path: Vec<ChildNumber> = DEPOSIT_BASE_PATH.to_vec();
    for chunk in address.as_slice().chunks(CHUNK_LEN) {
        let value = chunk.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
        path.push(ChildNumber::from_normal_idx(value)?);
    }
    path.push(ChildNumber::from_normal_idx(index)?);

    Ok(DerivationPath::from(path))
}

/// Inverse of [`derive_path`]: returns the checksummed EVM address and index.
pub fn path_to_evm_address(path: &DerivationPath) -> Result<(String, u32), DerivationError> {
    let components: &[ChildNumber] = path.as_ref();
    let base_len = DEPOSIT_BASE_PATH.len();
    if components.len() != base_len + NUM_CHUNKS + 1 || !components.starts_with(DEPOSIT_BASE_PATH)
    {
        return Err(DerivationError::NotADepositPath(path.clone()));
    }

    let mut bytes = Vec::with_capacity(20);
    for (i, child) in components[base_len..base_len + NUM_CHUNKS].iter().enumerate() {
        let ChildNumber::Normal { index } = *child else {
            return Err(DerivationError::NotADepositPath(path.clone()));
        };
        let chunk_len = (20 - i * CHUNK_LEN).min(CHUNK_LEN);
        let be = index.to_be_bytes();
        if be[..4 - chunk_len].iter().any(|b| *b != 0) {
            return Err(DerivationError::NotADepositPath(path.clone()));
        }
        bytes.extend_from_slice(&be[4 - chunk_len..]);
    }

    let ChildNumber::Normal { index } = components[components.len() - 1] else {
        return Err(DerivationError::NotADepositPath(path.clone()));
    };

    Ok((EvmAddress::from_slice(&bytes).to_checksum(None), index))
}

/// Derives the child public key of `xpub` at `path`.
pub fn derive_pubkey(xpub: &Xpub, path: &DerivationPath) -> Result<Xpub, DerivationError> {
    Ok(xpub.derive_pub(SECP256K1, path)?)
}

/// Derives the child private key of `xpriv` at `path`.
pub fn derive_privkey(xpriv: &Xpriv, path: &DerivationPath) -> Result<Xpriv, DerivationError> {
    Ok(xpriv.derive_priv(SECP256K1, path)?)
}

fn parse_checksummed(evm_address: &str) -> Result<EvmAddress, DerivationError> {
    if !evm_address.starts_with("0x") {
        return Err(DerivationError::InvalidEvmAddress(evm_address.to_owned()));
    }
    EvmAddress::parse_checksummed(evm_address, None)
        .map_err(|_| DerivationError::InvalidEvmAddress(evm_address.to_owned()))
}
