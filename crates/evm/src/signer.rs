//! EIP-191 signing of 32-byte message hashes, the form every bridge contract verifies.

use alloy::{
    hex,
    primitives::{Address, Bytes, Signature, B256},
    signers::{local::PrivateKeySigner, SignerSync},
};
use bitcoin::{hashes::Hash, Txid};

use crate::errors::{EvmError, EvmResult};

/// Signs `hash` as a `personal_sign` message and returns the 65-byte signature as `0x` hex.
pub fn sign_message_hash(signer: &PrivateKeySigner, hash: &B256) -> EvmResult<String> {
    let signature = signer.sign_message_sync(hash.as_slice())?;
    Ok(hex::encode_prefixed(signature.as_bytes()))
}

/// Decodes a `0x` hex signature into the bytes the contracts take.
pub fn decode_signature(signature: &str) -> EvmResult<Bytes> {
    let raw = hex::decode(signature)
        .map_err(|e| EvmError::InvalidData(format!("signature hex: {e}")))?;
    if raw.len() != 65 {
        return Err(EvmError::InvalidData(format!(
            "signature must be 65 bytes, got {}",
            raw.len()
        )));
    }
    Ok(Bytes::from(raw))
}

/// The address that produced `signature` over `hash` with [`sign_message_hash`].
pub fn recover_message_signer(hash: &B256, signature: &str) -> EvmResult<Address> {
    let raw = decode_signature(signature)?;
    let signature = Signature::from_raw(&raw)?;
    Ok(signature.recover_address_from_msg(hash.as_slice())?)
}

/// A txid as the contracts store it: the displayed (byte-reversed) hex as `bytes32`.
pub fn txid_to_bytes32(txid: &Txid) -> B256 {
    let mut bytes = txid.to_byte_array();
    bytes.reverse();
    B256::from(bytes)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn signatures_recover_to_the_signer() {
        let signer = PrivateKeySigner::random();
        let hash = B256::repeat_byte(0x42);
        let signature = sign_message_hash(&signer, &hash).unwrap();

        assert!(signature.starts_with("0x"));
        assert_eq!(signature.len(), 2 + 130);
        assert_eq!(
            recover_message_signer(&hash, &signature).unwrap(),
            signer.address()
        );

        let other = B256::repeat_byte(0x43);
        assert_ne!(
            recover_message_signer(&other, &signature).unwrap(),
            signer.address()
        );
    }

    #[test]
    fn malformed_signatures_are_rejected() {
        let hash = B256::ZERO;
        assert!(recover_message_signer(&hash, "0x1234").is_err());
        assert!(recover_message_signer(&hash, "not hex").is_err());
    }

    #[test]
    fn txid_is_stored_in_display_order() {
        let display = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";
        let txid = Txid::from_str(display).unwrap();
        assert_eq!(
            txid_to_bytes32(&txid),
            B256::from_str(&format!("0x{display}")).unwrap()
        );
    }
}
