//! Incremental EVM event scanning with a persisted checkpoint.
//!
//! Each scan covers `last + 1 ..= current - safety_margin`, fetched in chunks of at most
//! `max_block_range` blocks. The caller stores the events and then marks the batch scanned,
//! which moves the checkpoint to the batch's last block.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use federator_db::KeyValueStore;
use tracing::{debug, info};

use crate::{
    contracts::{RuneBridgeContract, RuneTransferToBtc, TapBridgeContract, TransferToTap},
    errors::{EvmError, EvmResult},
};

/// Blocks fetched per log query.
pub const DEFAULT_MAX_BLOCK_RANGE: u64 = 1_000;

/// Default wait between receipt polls.
pub const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Something with a block height and a log of events.
#[async_trait]
pub trait EventSource: Send + Sync + fmt::Debug {
    /// The event type.
    type Event: Send;

    /// The current block number.
    async fn current_block(&self) -> EvmResult<u64>;

    /// Events in `from_block..=to_block`.
    async fn events(&self, from_block: u64, to_block: u64) -> EvmResult<Vec<Self::Event>>;
}

#[async_trait]
impl<T> EventSource for T
where
    T: RuneBridgeContract + ?Sized,
{
    type Event = RuneTransferToBtc;

    async fn current_block(&self) -> EvmResult<u64> {
        self.block_number().await
    }

    async fn events(&self, from_block: u64, to_block: u64) -> EvmResult<Vec<RuneTransferToBtc>> {
        self.rune_transfers_to_btc(from_block, to_block).await
    }
}

/// The `TransferToTap` events of a Taproot-Assets bridge contract.
#[derive(Debug, Clone, Copy)]
pub struct TransfersToTap<'a>(pub &'a dyn TapBridgeContract);

#[async_trait]
impl EventSource for TransfersToTap<'_> {
    type Event = TransferToTap;

    async fn current_block(&self) -> EvmResult<u64> {
        self.0.block_number().await
    }

    async fn events(&self, from_block: u64, to_block: u64) -> EvmResult<Vec<TransferToTap>> {
        self.0.transfers_to_tap(from_block, to_block).await
    }
}

/// Events from one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch<E> {
    /// First block scanned.
    pub from_block: u64,
    /// Last block scanned.
    pub to_block: u64,
    /// The events, in block order.
    pub events: Vec<E>,
}

/// Scans an [`EventSource`], remembering progress under `"{namespace}:evm:events:last_scanned_block"`.
#[derive(Debug, Clone)]
pub struct EventScanner {
    namespace: String,
    block_safety_margin: u64,
    default_start_block: u64,
    max_block_range: u64,
}

impl EventScanner {
    /// A scanner that stays `block_safety_margin` blocks behind the tip and starts at
    /// `default_start_block` when no checkpoint exists.
    pub fn new(
        namespace: impl Into<String>,
        block_safety_margin: u64,
        default_start_block: u64,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            block_safety_margin,
            default_start_block,
            max_block_range: DEFAULT_MAX_BLOCK_RANGE,
        }
    }

    /// Caps the blocks fetched per query.
    pub fn with_max_block_range(mut self, max_block_range: u64) -> Self {
        self.max_block_range = max_block_range.max(1);
        self
    }

    /// The checkpoint key.
    pub fn checkpoint_key(&self) -> String {
        format!("{}:evm:events:last_scanned_block", self.namespace)
    }

    async fn last_scanned_block<K>(&self, kv: &K) -> EvmResult<Option<u64>>
    where
        K: KeyValueStore + Sync + ?Sized,
    {
        kv.get_value(&self.checkpoint_key())
            .await?
            .map(|raw| {
                raw.parse::<u64>()
                    .map_err(|e| EvmError::InvalidData(format!("checkpoint {raw}: {e}")))
            })
            .transpose()
    }

    /// Fetches the events since the checkpoint, or `None` when there are no new safe blocks.
    pub async fn next_batch<K, S>(&self, kv: &K, source: &S) -> EvmResult<Option<EventBatch<S::Event>>>
    where
        K: KeyValueStore + Sync + ?Sized,
        S: EventSource + ?Sized,
    {
        let from_block = match self.last_scanned_block(kv).await? {
            Some(last) => last + 1,
            None => self.default_start_block,
        };
        let current = source.current_block().await?;
        let Some(to_block) = current.checked_sub(self.block_safety_margin) else {
            return Ok(None);
        };
        if to_block < from_block {
            debug!(from_block, current, margin = self.block_safety_margin, "no new blocks to scan");
            return Ok(None);
        }

        info!(from_block, to_block, "scanning EVM events");
        let mut events = Vec::new();
        let mut chunk_start = from_block;
        while chunk_start <= to_block {
            let chunk_end = to_block.min(chunk_start.saturating_add(self.max_block_range - 1));
            events.extend(source.events(chunk_start, chunk_end).await?);
            chunk_start = chunk_end + 1;
        }

        Ok(Some(EventBatch {
            from_block,
            to_block,
            events,
        }))
    }

    /// Moves the checkpoint to `to_block` of a processed batch.
    pub async fn mark_scanned<K>(&self, kv: &K, to_block: u64) -> EvmResult<()>
    where
        K: KeyValueStore + Sync + ?Sized,
    {
        kv.set_value(&self.checkpoint_key(), &to_block.to_string())
            .await?;
        Ok(())
    }
}

/// Polls `tracker` until `tx_hash` is mined and returns whether it succeeded.
pub async fn wait_for_receipt<T>(
    tracker: &T,
    tx_hash: alloy::primitives::B256,
    timeout: Duration,
    poll_interval: Duration,
) -> EvmResult<bool>
where
    T: crate::contracts::TransactionTracker + ?Sized,
{
    let poll = async {
        loop {
            if let Some(success) = tracker.transaction_status(tx_hash).await? {
                return Ok::<_, EvmError>(success);
            }
            tokio::time::sleep(poll_interval).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| EvmError::ReceiptTimeout(tx_hash))?
}
