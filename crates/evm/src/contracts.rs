//! The bridge contracts as the federator sees them.

use std::fmt;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use federator_transport::federators::FederatorSource;

use crate::errors::EvmResult;

pub(crate) mod bindings {
    #![allow(missing_docs)]

    use alloy::sol;

    sol! {
        #[sol(rpc)]
        interface IRuneBridge {
            event RuneTransferToBtc(
                address indexed from,
                uint256 indexed rune,
                address indexed token,
                string receiverBtcAddress,
                uint256 transferredTokenAmount,
                uint256 netRuneAmount
            );

            function getFederators() external view returns (address[] memory);
            function isFederator(address account) external view returns (bool);
            function numRequiredFederators() external view returns (uint256);
            function frozen() external view returns (bool);
            function isRuneRegistered(uint256 rune) external view returns (bool);
            function getAcceptTransferFromBtcMessageHash(
                address to,
                uint256 rune,
                uint256 netRuneAmount,
                bytes32 btcTxId,
                uint256 btcTxVout
            ) external view returns (bytes32);
            function acceptTransferFromBtc(
                address to,
                uint256 rune,
                uint256 netRuneAmount,
                bytes32 btcTxId,
                uint256 btcTxVout,
                bytes[] memory signatures
            ) external;
        }

        #[sol(rpc)]
        interface ITapBridge {
            event TransferToTap(
                uint256 counter,
                address indexed from,
                string tapAddress
            );

            function getFederators() external view returns (address[] memory);
            function numRequiredSigners() external view returns (uint256);
            function isProcessed(bytes32 btcTxId, uint256 btcTxVout) external view returns (bool);
            function getTransferFromTapMessageHash(
                address to,
                string memory tapAddress,
                bytes32 btcTxId,
                uint256 btcTxVout
            ) external view returns (bytes32);
            function acceptTransferFromTap(
                address to,
                string memory tapAddress,
                bytes32 btcTxId,
                uint256 btcTxVout,
                bytes[] memory signatures
            ) external;
        }
    }
}

/// Parameters of a rune deposit credited on the EVM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptTransferFromBtc {
    /// Recipient.
    pub evm_address: Address,
    /// Base-26 rune number.
    pub rune_number: u128,
    /// Raw rune amount to mint.
    pub net_rune_amount: u128,
    /// Funding txid, see [`crate::signer::txid_to_bytes32`].
    pub btc_txid: B256,
    /// Funding output index.
    pub btc_vout: u32,
}

/// A burn of rune tokens requesting a payout on BTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuneTransferToBtc {
    /// Transaction that emitted the event.
    pub evm_tx_hash: B256,
    /// Log index of the event.
    pub log_index: u64,
    /// Block of the event.
    pub block_number: u64,
    /// Account that burned.
    pub from: Address,
    /// Base-26 rune number.
    pub rune_number: u128,
    /// Token contract.
    pub token: Address,
    /// Where the runes go.
    pub receiver_btc_address: String,
    /// Raw rune amount to send.
    pub net_rune_amount: u128,
    /// Tokens burned, in base units.
    pub transferred_token_amount: U256,
}

/// A Taproot-Assets receive credited on the EVM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapTransfer {
    /// Recipient.
    pub evm_address: Address,
    /// The Taproot-Assets address that received.
    pub tap_address: String,
    /// Anchor txid, see [`crate::signer::txid_to_bytes32`].
    pub btc_txid: B256,
    /// Anchor output index.
    pub btc_vout: u32,
}

/// A burn requesting a payout to a Taproot-Assets address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferToTap {
    /// The contract's transfer counter.
    pub counter: u64,
    /// Account that burned.
    pub from: Address,
    /// Where the assets go.
    pub tap_address: String,
    /// Transaction that emitted the event.
    pub evm_tx_hash: B256,
    /// Block of the event.
    pub block_number: u64,
    /// Log index of the event.
    pub log_index: u64,
}

/// Looks up the outcome of submitted transactions.
#[async_trait]
pub trait TransactionTracker: Send + Sync + fmt::Debug {
    /// `Some(success)` once `tx_hash` is mined, `None` before.
    async fn transaction_status(&self, tx_hash: B256) -> EvmResult<Option<bool>>;
}

/// The rune bridge contract.
#[async_trait]
pub trait RuneBridgeContract: FederatorSource + TransactionTracker {
    /// Whether `account` is a federator.
    async fn is_federator(&self, account: Address) -> EvmResult<bool>;

    /// Signatures needed to accept a transfer.
    async fn num_required_federators(&self) -> EvmResult<usize>;

    /// Whether the bridge is frozen.
    async fn frozen(&self) -> EvmResult<bool>;

    /// Whether the rune has a token on the EVM.
    async fn is_rune_registered(&self, rune_number: u128) -> EvmResult<bool>;

    /// The hash federators sign to accept `transfer`.
    async fn accept_transfer_message_hash(
        &self,
        transfer: &AcceptTransferFromBtc,
    ) -> EvmResult<B256>;

    /// Submits `acceptTransferFromBtc` and returns the transaction hash.
    async fn accept_transfer_from_btc(
        &self,
        transfer: &AcceptTransferFromBtc,
        signatures: Vec<Bytes>,
    ) -> EvmResult<B256>;

    /// Transactions from our account that are sent but not mined.
    async fn pending_transaction_count(&self) -> EvmResult<u64>;

    /// The current block number.
    async fn block_number(&self) -> EvmResult<u64>;

    /// `RuneTransferToBtc` events in `from_block..=to_block`.
    async fn rune_transfers_to_btc(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> EvmResult<Vec<RuneTransferToBtc>>;
}

/// The Taproot-Assets bridge contract.
#[async_trait]
pub trait TapBridgeContract: FederatorSource + TransactionTracker {
    /// Signatures needed to accept a transfer.
    async fn num_required_signers(&self) -> EvmResult<usize>;

    /// Whether the deposit at `btc_txid:btc_vout` was already credited.
    async fn is_processed(&self, btc_txid: B256, btc_vout: u32) -> EvmResult<bool>;

    /// The hash federators sign to accept `transfer`.
    async fn transfer_message_hash(&self, transfer: &TapTransfer) -> EvmResult<B256>;

    /// Submits `acceptTransferFromTap` and returns the transaction hash.
    async fn accept_transfer_from_tap(
        &self,
        transfer: &TapTransfer,
        signatures: Vec<Bytes>,
    ) -> EvmResult<B256>;

    /// The current block number.
    async fn block_number(&self) -> EvmResult<u64>;

    /// `TransferToTap` events in `from_block..=to_block`.
    async fn transfers_to_tap(&self, from_block: u64, to_block: u64)
        -> EvmResult<Vec<TransferToTap>>;
}
