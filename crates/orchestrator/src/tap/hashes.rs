//! Content hashes identifying transfers and batches between federators.

use alloy::primitives::{keccak256, B256, U256};
use federator_db::types::EvmToTapTransfer;
use federator_evm::TapTransfer;

/// Domain prefix of a transfer hash.
pub const TRANSFER_PREFIX: &[u8] = b"TapToEvmTransfer:";

/// Domain prefix of a batch hash, right padded to 32 bytes.
pub const BATCH_PREFIX: &[u8] = b"TransferBatch:";

/// Domain prefix of an EVM to Taproot-Assets batch hash, right padded to 32 bytes.
pub const EVM_TO_TAP_BATCH_PREFIX: &[u8] = b"EvmToTapBatch:";

/// `keccak256(prefix || evm_address || tap_address || btc_txid || uint256(btc_vout))`.
pub fn transfer_hash(transfer: &TapTransfer) -> B256 {
    let mut packed = Vec::with_capacity(TRANSFER_PREFIX.len() + 84 + transfer.tap_address.len());
    packed.extend_from_slice(TRANSFER_PREFIX);
    packed.extend_from_slice(transfer.evm_address.as_slice());
    packed.extend_from_slice(transfer.tap_address.as_bytes());
    packed.extend_from_slice(transfer.btc_txid.as_slice());
    packed.extend_from_slice(&U256::from(transfer.btc_vout).to_be_bytes::<32>());
    keccak256(packed)
}

/// `keccak256(pad32("TransferBatch:") || transfer_hash...)`, in batch order.
pub fn batch_hash(transfer_hashes: &[B256]) -> B256 {
    let mut packed = Vec::with_capacity(32 * (transfer_hashes.len() + 1));
    packed.extend_from_slice(B256::right_padding_from(BATCH_PREFIX).as_slice());
    for hash in transfer_hashes {
        packed.extend_from_slice(hash.as_slice());
    }
    keccak256(packed)
}

/// `keccak256(pad32("EvmToTapBatch:") || (uint256(counter) || sender || keccak256(recipient))...)`,
/// in batch order.
pub fn evm_to_tap_batch_hash(transfers: &[EvmToTapTransfer]) -> B256 {
    let mut packed = Vec::with_capacity(32 + 84 * transfers.len());
    packed.extend_from_slice(B256::right_padding_from(EVM_TO_TAP_BATCH_PREFIX).as_slice());
    for transfer in transfers {
        packed.extend_from_slice(&U256::from(transfer.counter).to_be_bytes::<32>());
        packed.extend_from_slice(transfer.sender_evm_address.as_slice());
        packed.extend_from_slice(keccak256(transfer.recipient_tap_address.as_bytes()).as_slice());
    }
    keccak256(packed)
}

#[cfg(test)]
mod tests {
    use alloy::primitives::Address;

    use super::*;

    fn transfer(vout: u32) -> TapTransfer {
        TapTransfer {
            evm_address: Address::repeat_byte(0xaa),
            tap_address: "taprt1qqqsqq".to_string(),
            btc_txid: B256::repeat_byte(7),
            btc_vout: vout,
        }
    }

    #[test]
    fn every_field_changes_the_transfer_hash() {
        let base = transfer(0);
        assert_eq!(transfer_hash(&base), transfer_hash(&transfer(0)));
        assert_ne!(transfer_hash(&base), transfer_hash(&transfer(1)));

        let mut other = base.clone();
        other.tap_address.push('x');
        assert_ne!(transfer_hash(&base), transfer_hash(&other));

        let mut other = base.clone();
        other.evm_address = Address::repeat_byte(0xbb);
        assert_ne!(transfer_hash(&base), transfer_hash(&other));
    }

    #[test]
    fn batch_hash_is_ordered() {
        let a = transfer_hash(&transfer(0));
        let b = transfer_hash(&transfer(1));
        assert_eq!(batch_hash(&[a, b]), batch_hash(&[a, b]));
        assert_ne!(batch_hash(&[a, b]), batch_hash(&[b, a]));
        assert_ne!(batch_hash(&[a]), batch_hash(&[a, b]));
    }

    fn outgoing(counter: u64, recipient: &str) -> EvmToTapTransfer {
        EvmToTapTransfer {
            counter,
            sender_evm_address: Address::repeat_byte(0xcc),
            recipient_tap_address: recipient.to_string(),
            evm_tx_hash: B256::repeat_byte(1),
            block_number: 10,
            log_index: 0,
            batch_id: None,
        }
    }

    #[test]
    fn evm_to_tap_batch_hash_covers_recipients_and_order() {
        let a = outgoing(1, "taprt1a");
        let b = outgoing(2, "taprt1b");
        let hash = evm_to_tap_batch_hash(&[a.clone(), b.clone()]);
        assert_ne!(hash, evm_to_tap_batch_hash(&[b.clone(), a.clone()]));
        assert_ne!(hash, evm_to_tap_batch_hash(&[a.clone(), outgoing(2, "taprt1c")]));

        let mut batched = a.clone();
        batched.batch_id = Some(4);
        assert_eq!(
            evm_to_tap_batch_hash(&[a]),
            evm_to_tap_batch_hash(&[batched]),
            "where a transfer is stored does not change what is signed"
        );
    }
}
