//! What federators exchange about batches.

use alloy::primitives::{Address, B256};
use bitcoin::Txid;
use federator_db::types::{
    BatchSignatures, BatchStatus, BatchTransfer, EvmToTapBatch, EvmToTapTransfer, TransferBatch,
};
use federator_evm::{signer::txid_to_bytes32, TapTransfer};
use serde::{Deserialize, Serialize};

use super::hashes::transfer_hash;

/// A deposit address: whom to credit for receives on which Taproot-Assets address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DepositAddressMessage {
    /// Recipient on the EVM.
    pub evm_address: Address,
    /// The Taproot-Assets address.
    pub tap_address: String,
}

/// One transfer of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchTransferMessage {
    /// The transfer's content hash.
    pub hash: B256,
    /// Where it was received.
    pub deposit_address: DepositAddressMessage,
    /// Anchor transaction of the receive.
    pub deposit_btc_tx_id: Txid,
    /// Anchor output index.
    pub deposit_btc_tx_vout: u32,
}

impl BatchTransferMessage {
    /// The transfer as the contract sees it.
    pub fn to_tap_transfer(&self) -> TapTransfer {
        TapTransfer {
            evm_address: self.deposit_address.evm_address,
            tap_address: self.deposit_address.tap_address.clone(),
            btc_txid: txid_to_bytes32(&self.deposit_btc_tx_id),
            btc_vout: self.deposit_btc_tx_vout,
        }
    }
}

/// A batch the leader asks followers to sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchMessage {
    /// Batch content hash.
    pub hash: B256,
    /// Status on the leader.
    pub status: BatchStatus,
    /// Signatures the leader holds.
    pub signatures: BatchSignatures,
    /// The transfers, in order.
    pub transfers: Vec<BatchTransferMessage>,
}

impl BatchMessage {
    /// Describes a stored batch.
    pub fn from_batch(batch: &TransferBatch) -> Self {
        Self {
            hash: batch.hash,
            status: batch.status,
            signatures: batch.signatures.clone(),
            transfers: batch
                .transfers
                .iter()
                .map(|t| BatchTransferMessage {
                    hash: transfer_hash(&tap_transfer(t)),
                    deposit_address: DepositAddressMessage {
                        evm_address: t.evm_address,
                        tap_address: t.tap_address.clone(),
                    },
                    deposit_btc_tx_id: t.deposit_outpoint.txid,
                    deposit_btc_tx_vout: t.deposit_outpoint.vout,
                })
                .collect(),
        }
    }
}

/// A follower's signatures on a batch, one per transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchSignaturesResponse {
    /// The follower's EVM signer.
    pub signer: Address,
    /// Hex signatures, in transfer order.
    pub signatures: Vec<String>,
}

/// One transfer of an EVM to Taproot-Assets batch, as the leader scanned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvmToTapTransferMessage {
    /// The contract's transfer counter.
    pub counter: u64,
    /// Account that burned.
    pub sender_evm_address: Address,
    /// Where the assets go.
    pub recipient_tap_address: String,
    /// Transaction that emitted the event.
    pub evm_tx_hash: B256,
    /// Log index of the event.
    pub log_index: u64,
}

impl EvmToTapTransferMessage {
    fn from_transfer(transfer: &EvmToTapTransfer) -> Self {
        Self {
            counter: transfer.counter,
            sender_evm_address: transfer.sender_evm_address,
            recipient_tap_address: transfer.recipient_tap_address.clone(),
            evm_tx_hash: transfer.evm_tx_hash,
            log_index: transfer.log_index,
        }
    }

    /// Whether `stored` is the same event with the same recipient.
    pub fn matches(&self, stored: &EvmToTapTransfer) -> bool {
        self.counter == stored.counter
            && self.sender_evm_address == stored.sender_evm_address
            && self.recipient_tap_address == stored.recipient_tap_address
            && self.evm_tx_hash == stored.evm_tx_hash
            && self.log_index == stored.log_index
    }
}

/// An EVM to Taproot-Assets batch the leader asks followers to approve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvmToTapBatchMessage {
    /// Batch content hash.
    pub hash: B256,
    /// The transfers, by counter.
    pub transfers: Vec<EvmToTapTransferMessage>,
}

impl EvmToTapBatchMessage {
    /// Describes a stored batch.
    pub fn from_batch(batch: &EvmToTapBatch) -> Self {
        Self {
            hash: batch.hash,
            transfers: batch
                .transfers
                .iter()
                .map(EvmToTapTransferMessage::from_transfer)
                .collect(),
        }
    }
}

/// A follower's signature over an EVM to Taproot-Assets batch hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvmToTapApproval {
    /// The follower's EVM signer.
    pub signer: Address,
    /// Hex signature over the batch hash.
    pub signature: String,
}

/// A stored transfer as the contract sees it.
pub fn tap_transfer(transfer: &BatchTransfer) -> TapTransfer {
    TapTransfer {
        evm_address: transfer.evm_address,
        tap_address: transfer.tap_address.clone(),
        btc_txid: txid_to_bytes32(&transfer.deposit_outpoint.txid),
        btc_vout: transfer.deposit_outpoint.vout,
    }
}
