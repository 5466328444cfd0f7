//! Settings of the rune bridge.

use std::time::Duration;

use bitcoin::Amount;
use federator_evm::scanner::RECEIPT_POLL_INTERVAL;
use federator_primitives::amount::Percentage;

use crate::signatures::CollectConfig;

/// Settings of a [`super::RuneBridge`].
#[derive(Debug, Clone)]
pub struct RuneBridgeConfig {
    /// Name in logs, checkpoint keys and stored records.
    pub name: String,

    /// Confirmations before a BTC deposit is accepted, and before a payout is confirmed.
    pub btc_min_confirmations: u32,

    /// Blocks re-listed by every `listsinceblock`, never below `btc_min_confirmations`.
    pub btc_listsinceblock_buffer: u32,

    /// Smallest postage a rune deposit may carry.
    pub btc_min_postage: Amount,

    /// Highest fee rate, in sat/vB, a payout is built at.
    pub btc_max_fee_rate: u64,

    /// Lowest fee rate, in sat/vB.
    pub btc_min_fee_rate: u64,

    /// Blocks the EVM scanner stays behind the tip.
    pub evm_block_safety_margin: u64,

    /// First EVM block scanned when there is no checkpoint.
    pub evm_default_start_block: u64,

    /// Fee taken from rune deposits.
    pub to_evm_fee_percentage: Percentage,

    /// Mint transactions we may have pending before we stop submitting.
    pub max_pending_evm_txs: u64,

    /// How long to wait for ord to catch up with bitcoind.
    pub ord_sync_timeout: Duration,

    /// Wait between ord height checks.
    pub ord_sync_poll_interval: Duration,

    /// Times a deposit output is looked up before ord is declared behind.
    pub ord_output_poll_attempts: usize,

    /// Unit of the linear backoff between those lookups.
    pub ord_output_poll_unit: Duration,

    /// Signature collection.
    pub collect: CollectConfig,

    /// How long to wait for a mint receipt per iteration.
    pub receipt_timeout: Duration,

    /// Wait between receipt polls.
    pub receipt_poll_interval: Duration,

    /// Most burns paid out by one transaction.
    pub max_transfers_per_psbt: usize,
}

impl Default for RuneBridgeConfig {
    fn default() -> Self {
        Self {
            name: "rune".to_string(),
            btc_min_confirmations: 1,
            btc_listsinceblock_buffer: 1,
            btc_min_postage: Amount::from_sat(10_000),
            btc_max_fee_rate: 100,
            btc_min_fee_rate: 1,
            evm_block_safety_margin: 0,
            evm_default_start_block: 1,
            to_evm_fee_percentage: Percentage::parse("0.4").unwrap_or_default(),
            max_pending_evm_txs: 4,
            ord_sync_timeout: Duration::from_secs(60),
            ord_sync_poll_interval: Duration::from_secs(1),
            ord_output_poll_attempts: 10,
            ord_output_poll_unit: Duration::from_secs(1),
            collect: CollectConfig::default(),
            receipt_timeout: Duration::from_secs(60),
            receipt_poll_interval: RECEIPT_POLL_INTERVAL,
            max_transfers_per_psbt: 10,
        }
    }
}

impl RuneBridgeConfig {
    /// Target confirmations passed to `listsinceblock`.
    pub fn listsinceblock_target(&self) -> u32 {
        self.btc_listsinceblock_buffer
            .max(self.btc_min_confirmations)
            .max(1)
    }

    /// The fee rate to build a payout at, given the estimate.
    pub fn payout_fee_rate(&self, estimate: u64) -> Option<u64> {
        if estimate > self.btc_max_fee_rate {
            return None;
        }
        Some((estimate.saturating_mul(11) / 10).max(self.btc_min_fee_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payout_fee_rate_adds_a_tenth_within_bounds() {
        let config = RuneBridgeConfig::default();
        assert_eq!(config.payout_fee_rate(10), Some(11));
        assert_eq!(config.payout_fee_rate(0), Some(1));
        assert_eq!(config.payout_fee_rate(100), Some(110));
        assert_eq!(config.payout_fee_rate(101), None);
    }

    #[test]
    fn listsinceblock_target_covers_min_confirmations() {
        let config = RuneBridgeConfig {
            btc_min_confirmations: 3,
            ..Default::default()
        };
        assert_eq!(config.listsinceblock_target(), 3);
    }
}
