//! Taproot-Assets transfers and their batches, in both directions.

use std::collections::HashSet;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use bitcoin::OutPoint;

use crate::{
    errors::DbResult,
    types::{
        BatchSignatures, BatchStatus, BatchTransfer, EvmToTapBatch, EvmToTapBatchStatus,
        EvmToTapTransfer, NewEvmToTapTransfer, TapDepositAddress, TransferBatch,
    },
};

/// Storage for Taproot-Assets to EVM transfers.
#[async_trait]
pub trait TapBridgeDb {
    /// Stores a deposit address. Addresses are unique.
    async fn add_tap_deposit_address(&self, address: TapDepositAddress) -> DbResult<()>;

    /// Every deposit address.
    async fn tap_deposit_addresses(&self) -> DbResult<Vec<TapDepositAddress>>;

    /// Outpoints already recorded as transfers.
    async fn known_deposit_outpoints(&self) -> DbResult<HashSet<OutPoint>>;

    /// Records a completed receive as an unbatched transfer. Returns whether it was new.
    async fn insert_batch_transfer(
        &self,
        evm_address: Address,
        tap_address: &str,
        deposit_outpoint: OutPoint,
    ) -> DbResult<bool>;

    /// Up to `limit` transfers not in any batch, by counter.
    async fn unbatched_transfers(&self, limit: usize) -> DbResult<Vec<BatchTransfer>>;

    /// The oldest batch that is not finalized.
    async fn current_batch(&self) -> DbResult<Option<TransferBatch>>;

    /// Creates a `Created` batch holding the transfers with `counters`. Fails if any of them is
    /// already batched.
    async fn create_batch(&self, hash: B256, counters: &[u64]) -> DbResult<TransferBatch>;

    /// A batch by content hash.
    async fn get_batch_by_hash(&self, hash: B256) -> DbResult<Option<TransferBatch>>;

    /// Stores a batch signed as a follower, without transfers.
    async fn insert_signed_batch(
        &self,
        hash: B256,
        signatures: BatchSignatures,
    ) -> DbResult<TransferBatch>;

    /// Replaces a batch's signatures.
    async fn set_batch_signatures(&self, id: i64, signatures: BatchSignatures) -> DbResult<()>;

    /// Moves a batch to `status`, recording the last submission if given.
    async fn set_batch_status(
        &self,
        id: i64,
        status: BatchStatus,
        executed_tx_hash: Option<B256>,
    ) -> DbResult<()>;
}

/// Storage for EVM to Taproot-Assets transfers and their batches.
#[async_trait]
pub trait EvmToTapDb {
    /// Records a `TransferToTap` event. Counters are unique; returns whether it was new.
    async fn insert_evm_to_tap_transfer(&self, transfer: NewEvmToTapTransfer) -> DbResult<bool>;

    /// A transfer by counter.
    async fn get_evm_to_tap_transfer(&self, counter: u64) -> DbResult<Option<EvmToTapTransfer>>;

    /// Up to `limit` transfers not in any batch, by counter.
    async fn unbatched_evm_to_tap_transfers(&self, limit: usize)
        -> DbResult<Vec<EvmToTapTransfer>>;

    /// The oldest batch that is not finalized.
    async fn current_evm_to_tap_batch(&self) -> DbResult<Option<EvmToTapBatch>>;

    /// Creates a `Created` batch holding the transfers with `counters`. Fails if any of them is
    /// already batched.
    async fn create_evm_to_tap_batch(&self, hash: B256, counters: &[u64])
        -> DbResult<EvmToTapBatch>;

    /// Moves a batch to `status`, recording the daemon's answer if given.
    async fn set_evm_to_tap_batch_status(
        &self,
        id: i64,
        status: EvmToTapBatchStatus,
        sending_result: Option<String>,
    ) -> DbResult<()>;
}
