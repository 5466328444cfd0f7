//! Records and their status machines.

use std::collections::BTreeMap;

use alloy::primitives::{Address, B256, U256};
use bitcoin::{Amount, OutPoint, Txid};
use serde::{Deserialize, Serialize};

use crate::errors::{DbError, DbResult};

/// A status column that only moves forward.
pub trait Status: Copy + Eq + std::fmt::Debug + Send + Sync + 'static {
    /// Name of the record kind, for errors.
    const ENTITY: &'static str;

    /// The stored integer code.
    fn code(self) -> i64;

    /// Parses a stored code.
    fn from_code(code: i64) -> Option<Self>;

    /// Whether a record in this status may move to `next`. Staying put is always allowed.
    fn can_transition_to(self, next: Self) -> bool;
}

/// Fails unless `from` may move to `to`.
pub(crate) fn check_transition<S: Status>(id: i64, from: S, to: S) -> DbResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(DbError::InvalidTransition {
            entity: S::ENTITY,
            id,
            from: from.code(),
            to: to.code(),
        })
    }
}

macro_rules! status_codes {
    ($ty:ident { $($variant:ident = $code:expr),+ $(,)? }) => {
        impl $ty {
            /// Every status.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];
        }

        impl $ty {
            const fn to_code(self) -> i64 {
                match self {
                    $(Self::$variant => $code),+
                }
            }

            fn parse_code(code: i64) -> Option<Self> {
                match code {
                    $(c if c == $code => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

/// Status of a BTC output seen on a deposit address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IncomingBtcTxStatus {
    /// Seen, not yet deep enough.
    Detected,
    /// Has the required confirmations.
    Accepted,
}

status_codes!(IncomingBtcTxStatus { Detected = 1, Accepted = 2 });

impl Status for IncomingBtcTxStatus {
    const ENTITY: &'static str = "incoming btc tx";

    fn code(self) -> i64 {
        self.to_code()
    }

    fn from_code(code: i64) -> Option<Self> {
        Self::parse_code(code)
    }

    fn can_transition_to(self, next: Self) -> bool {
        self.code() <= next.code()
    }
}

/// Status of a rune deposit on its way to the EVM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuneDepositStatus {
    /// Seen, not yet deep enough.
    Detected,
    /// Has the required confirmations.
    Accepted,
    /// The mint transaction is being submitted.
    SendingToEvm,
    /// The mint transaction was submitted.
    SentToEvm,
    /// The mint transaction succeeded.
    ConfirmedInEvm,
    /// Refused.
    Rejected,
    /// Submitting the mint transaction failed.
    SendingToEvmFailed,
    /// The mint transaction reverted.
    EvmTransactionFailed,
}

status_codes!(RuneDepositStatus {
    Detected = 10,
    Accepted = 20,
    SendingToEvm = 30,
    SentToEvm = 40,
    ConfirmedInEvm = 50,
    Rejected = -1,
    SendingToEvmFailed = -2,
    EvmTransactionFailed = -3,
});

impl Status for RuneDepositStatus {
    const ENTITY: &'static str = "rune deposit";

    fn code(self) -> i64 {
        self.to_code()
    }

    fn from_code(code: i64) -> Option<Self> {
        Self::parse_code(code)
    }

    fn can_transition_to(self, next: Self) -> bool {
        use RuneDepositStatus::*;
        if self == next {
            return true;
        }
        match next {
            Rejected => matches!(self, Detected | Accepted),
            SendingToEvmFailed => self == SendingToEvm,
            EvmTransactionFailed => self == SentToEvm,
            _ => self.code() > 0 && self.code() < next.code(),
        }
    }
}

/// Status of a rune token burn on its way back to BTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuneTokenDepositStatus {
    /// Seen on the EVM.
    Detected,
    /// Past the safety margin.
    Accepted,
    /// The finalized PSBT is stored and being broadcast.
    SendingToBtc,
    /// Broadcast.
    SentToBtc,
    /// Mined.
    ConfirmedInBtc,
    /// Refused.
    Rejected,
    /// Broadcasting failed.
    SendingToBtcFailed,
}

status_codes!(RuneTokenDepositStatus {
    Detected = 10,
    Accepted = 20,
    SendingToBtc = 30,
    SentToBtc = 40,
    ConfirmedInBtc = 50,
    Rejected = -1,
    SendingToBtcFailed = -2,
});

impl Status for RuneTokenDepositStatus {
    const ENTITY: &'static str = "rune token deposit";

    fn code(self) -> i64 {
        self.to_code()
    }

    fn from_code(code: i64) -> Option<Self> {
        Self::parse_code(code)
    }

    fn can_transition_to(self, next: Self) -> bool {
        use RuneTokenDepositStatus::*;
        if self == next {
            return true;
        }
        match next {
            Rejected => matches!(self, Detected | Accepted),
            SendingToBtcFailed => self == SendingToBtc,
            _ => self.code() > 0 && self.code() < next.code(),
        }
    }
}

/// Status of a Taproot-Assets to EVM transfer batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Collecting signatures.
    Created,
    /// Enough signatures to submit.
    SignaturesCollected,
    /// Submission started. Never resumed automatically.
    Sending,
    /// Every transfer was submitted.
    Sent,
    /// The last submission was mined successfully.
    Finalized,
}

status_codes!(BatchStatus {
    Created = 1,
    SignaturesCollected = 2,
    Sending = 3,
    Sent = 4,
    Finalized = 7,
});

impl Status for BatchStatus {
    const ENTITY: &'static str = "transfer batch";

    fn code(self) -> i64 {
        self.to_code()
    }

    fn from_code(code: i64) -> Option<Self> {
        Self::parse_code(code)
    }

    fn can_transition_to(self, next: Self) -> bool {
        self.code() <= next.code()
    }
}

/// Status of an EVM to Taproot-Assets batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvmToTapBatchStatus {
    /// Waiting for the followers to vouch for its transfers.
    Created,
    /// The send to the daemon started. Never resumed automatically.
    SendingToTap,
    /// The daemon accepted the send.
    SentToTap,
    /// Done.
    Finalized,
}

status_codes!(EvmToTapBatchStatus {
    Created = 1,
    SendingToTap = 4,
    SentToTap = 5,
    Finalized = 8,
});

impl Status for EvmToTapBatchStatus {
    const ENTITY: &'static str = "evm to tap batch";

    fn code(self) -> i64 {
        self.to_code()
    }

    fn from_code(code: i64) -> Option<Self> {
        Self::parse_code(code)
    }

    fn can_transition_to(self, next: Self) -> bool {
        self.code() <= next.code()
    }
}

/// A BTC output paid to one of our deposit addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingBtcTx {
    /// Funding transaction.
    pub txid: Txid,
    /// Output index.
    pub vout: u32,
    /// The deposit address paid.
    pub address: String,
    /// Output value.
    pub amount: Amount,
    /// Height of the including block, if mined.
    pub block_number: Option<u64>,
    /// Wallet time of the transaction.
    pub time: u64,
    /// Status.
    pub status: IncomingBtcTxStatus,
}

impl IncomingBtcTx {
    /// The funding outpoint.
    pub const fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.vout,
        }
    }
}

/// A deposit address handed out for an EVM account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositAddressRecord {
    /// The EVM account.
    pub evm_address: Address,
    /// The derived P2WSH address.
    pub btc_address: String,
    /// Derivation index.
    pub index: u32,
}

/// Fields of a rune deposit as seen by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRuneDeposit {
    /// Funding transaction.
    pub txid: Txid,
    /// Output index.
    pub vout: u32,
    /// Base-26 rune number.
    pub rune_number: u128,
    /// Rune id, `block:tx`.
    pub rune_id: String,
    /// Spaced rune name.
    pub spaced_rune: String,
    /// Recipient on the EVM.
    pub evm_address: Address,
    /// Height of the including block, if mined.
    pub block_number: Option<u64>,
    /// Sats carried by the output.
    pub postage: Amount,
    /// Raw rune amount received.
    pub transfer_amount: u128,
    /// Raw rune amount to mint, after fees.
    pub net_amount: u128,
    /// Status the scan observed.
    pub status: RuneDepositStatus,
}

/// A stored rune deposit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuneDeposit {
    /// Store id.
    pub id: i64,
    /// Funding transaction.
    pub txid: Txid,
    /// Output index.
    pub vout: u32,
    /// Base-26 rune number.
    pub rune_number: u128,
    /// Rune id, `block:tx`.
    pub rune_id: String,
    /// Spaced rune name.
    pub spaced_rune: String,
    /// Recipient on the EVM.
    pub evm_address: Address,
    /// Height of the including block, if mined.
    pub block_number: Option<u64>,
    /// Sats carried by the output.
    pub postage: Amount,
    /// Raw rune amount received.
    pub transfer_amount: u128,
    /// Raw rune amount to mint, after fees.
    pub net_amount: u128,
    /// Hash the federators sign.
    pub message_hash: Option<B256>,
    /// Collected signatures by signer, hex encoded.
    pub signatures: BTreeMap<Address, String>,
    /// The mint transaction.
    pub evm_tx_hash: Option<B256>,
    /// Status.
    pub status: RuneDepositStatus,
}

impl RuneDeposit {
    pub(crate) fn from_new(id: i64, new: NewRuneDeposit) -> Self {
        Self {
            id,
            txid: new.txid,
            vout: new.vout,
            rune_number: new.rune_number,
            rune_id: new.rune_id,
            spaced_rune: new.spaced_rune,
            evm_address: new.evm_address,
            block_number: new.block_number,
            postage: new.postage,
            transfer_amount: new.transfer_amount,
            net_amount: new.net_amount,
            message_hash: None,
            signatures: BTreeMap::new(),
            evm_tx_hash: None,
            status: new.status,
        }
    }

    /// Raw fee kept by the bridge.
    pub const fn fee(&self) -> u128 {
        self.transfer_amount - self.net_amount
    }
}

/// Fields of a rune token burn as read from the EVM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRuneTokenDeposit {
    /// Transaction that emitted the event.
    pub evm_tx_hash: B256,
    /// Log index of the event.
    pub log_index: u64,
    /// Block of the event.
    pub block_number: u64,
    /// EVM account that burned.
    pub user_evm_address: Address,
    /// Where the runes go.
    pub receiver_btc_address: String,
    /// Base-26 rune number.
    pub rune_number: u128,
    /// Spaced rune name.
    pub spaced_rune: String,
    /// Token contract.
    pub token_address: Address,
    /// Raw rune amount to send.
    pub net_rune_amount: u128,
    /// Token amount burned, in token base units.
    pub transferred_token_amount: U256,
    /// Initial status.
    pub status: RuneTokenDepositStatus,
}

/// A stored rune token burn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuneTokenDeposit {
    /// Store id.
    pub id: i64,
    /// Transaction that emitted the event.
    pub evm_tx_hash: B256,
    /// Log index of the event.
    pub log_index: u64,
    /// Block of the event.
    pub block_number: u64,
    /// EVM account that burned.
    pub user_evm_address: Address,
    /// Where the runes go.
    pub receiver_btc_address: String,
    /// Base-26 rune number.
    pub rune_number: u128,
    /// Spaced rune name.
    pub spaced_rune: String,
    /// Token contract.
    pub token_address: Address,
    /// Raw rune amount to send.
    pub net_rune_amount: u128,
    /// Token amount burned, in token base units.
    pub transferred_token_amount: U256,
    /// The BTC transaction paying the runes out.
    pub btc_txid: Option<Txid>,
    /// The finalized PSBT, base64.
    pub finalized_psbt: Option<String>,
    /// Status.
    pub status: RuneTokenDepositStatus,
}

impl RuneTokenDeposit {
    pub(crate) fn from_new(id: i64, new: NewRuneTokenDeposit) -> Self {
        Self {
            id,
            evm_tx_hash: new.evm_tx_hash,
            log_index: new.log_index,
            block_number: new.block_number,
            user_evm_address: new.user_evm_address,
            receiver_btc_address: new.receiver_btc_address,
            rune_number: new.rune_number,
            spaced_rune: new.spaced_rune,
            token_address: new.token_address,
            net_rune_amount: new.net_rune_amount,
            transferred_token_amount: new.transferred_token_amount,
            btc_txid: None,
            finalized_psbt: None,
            status: new.status,
        }
    }
}

/// Where a user deposits Taproot Assets, and whom to credit on the EVM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapDepositAddress {
    /// Recipient on the EVM.
    pub evm_address: Address,
    /// Encoded Taproot-Assets address.
    pub tap_address: String,
}

/// A completed Taproot-Assets receive waiting to be credited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTransfer {
    /// Insertion order.
    pub counter: u64,
    /// Recipient on the EVM.
    pub evm_address: Address,
    /// The Taproot-Assets address that received.
    pub tap_address: String,
    /// Anchor outpoint of the receive.
    pub deposit_outpoint: OutPoint,
    /// Batch holding this transfer, once batched.
    pub batch_id: Option<i64>,
}

/// Signatures on a batch: per signer, one hex signature per transfer in batch order.
pub type BatchSignatures = BTreeMap<Address, Vec<String>>;

/// A batch of transfers signed and submitted together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferBatch {
    /// Store id.
    pub id: i64,
    /// Content hash.
    pub hash: B256,
    /// Status.
    pub status: BatchStatus,
    /// Collected signatures.
    pub signatures: BatchSignatures,
    /// The transfers, by counter. Empty for batches stored by followers.
    pub transfers: Vec<BatchTransfer>,
    /// Hash of the last submission.
    pub executed_tx_hash: Option<B256>,
}

/// A `TransferToTap` event: tokens burned on the EVM to be paid out to a Taproot-Assets address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvmToTapTransfer {
    /// The contract's transfer counter.
    pub counter: u64,
    /// Account that burned.
    pub sender_evm_address: Address,
    /// Where the assets go.
    pub recipient_tap_address: String,
    /// Transaction that emitted the event.
    pub evm_tx_hash: B256,
    /// Block of the event.
    pub block_number: u64,
    /// Log index of the event.
    pub log_index: u64,
}

/// A stored EVM to Taproot-Assets transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmToTapTransfer {
    /// The contract's transfer counter.
    pub counter: u64,
    /// Account that burned.
    pub sender_evm_address: Address,
    /// Where the assets go.
    pub recipient_tap_address: String,
    /// Transaction that emitted the event.
    pub evm_tx_hash: B256,
    /// Block of the event.
    pub block_number: u64,
    /// Log index of the event.
    pub log_index: u64,
    /// Batch holding this transfer, once batched.
    pub batch_id: Option<i64>,
}

impl EvmToTapTransfer {
    pub(crate) fn from_new(new: NewEvmToTapTransfer) -> Self {
        Self {
            counter: new.counter,
            sender_evm_address: new.sender_evm_address,
            recipient_tap_address: new.recipient_tap_address,
            evm_tx_hash: new.evm_tx_hash,
            block_number: new.block_number,
            log_index: new.log_index,
            batch_id: None,
        }
    }
}

/// Transfers paid out to Taproot-Assets addresses in one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmToTapBatch {
    /// Store id.
    pub id: i64,
    /// Content hash.
    pub hash: B256,
    /// Status.
    pub status: EvmToTapBatchStatus,
    /// The transfers, by counter.
    pub transfers: Vec<EvmToTapTransfer>,
    /// The daemon's answer to the send, as JSON.
    pub sending_result: Option<String>,
}

/// What this federator signed for a resource, such as a deposit outpoint or a burn event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedClaim {
    /// The resource, for example `tap-deposit:<txid>:<vout>`.
    pub resource: String,
    /// What it was signed for, for example a batch hash or a payout txid.
    pub commitment: String,
}

impl SignedClaim {
    /// A claim on `resource` for `commitment`.
    pub fn new(resource: impl Into<String>, commitment: impl ToString) -> Self {
        Self {
            resource: resource.into(),
            commitment: commitment.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for s in RuneDepositStatus::ALL {
            assert_eq!(RuneDepositStatus::from_code(s.code()), Some(*s));
        }
        for s in BatchStatus::ALL {
            assert_eq!(BatchStatus::from_code(s.code()), Some(*s));
        }
        assert_eq!(BatchStatus::Finalized.code(), 7);
        assert_eq!(RuneDepositStatus::EvmTransactionFailed.code(), -3);
        assert!(BatchStatus::from_code(5).is_none());
        for s in EvmToTapBatchStatus::ALL {
            assert_eq!(EvmToTapBatchStatus::from_code(s.code()), Some(*s));
        }
        assert_eq!(EvmToTapBatchStatus::SendingToTap.code(), 4);
        assert_eq!(EvmToTapBatchStatus::Finalized.code(), 8);
    }

    #[test]
    fn evm_to_tap_batches_never_go_back() {
        use EvmToTapBatchStatus::*;
        assert!(Created.can_transition_to(SendingToTap));
        assert!(SendingToTap.can_transition_to(SentToTap));
        assert!(SentToTap.can_transition_to(Finalized));
        assert!(!SendingToTap.can_transition_to(Created));
        assert!(!Finalized.can_transition_to(SentToTap));
    }

    #[test]
    fn rune_deposit_status_never_regresses() {
        use RuneDepositStatus::*;
        assert!(Detected.can_transition_to(Accepted));
        assert!(Accepted.can_transition_to(SendingToEvm));
        assert!(SendingToEvm.can_transition_to(SendingToEvmFailed));
        assert!(SentToEvm.can_transition_to(EvmTransactionFailed));
        assert!(SentToEvm.can_transition_to(ConfirmedInEvm));

        assert!(!Accepted.can_transition_to(Detected));
        assert!(!SentToEvm.can_transition_to(SendingToEvm));
        assert!(!SendingToEvmFailed.can_transition_to(SentToEvm));
        assert!(!Accepted.can_transition_to(EvmTransactionFailed));
        assert!(!ConfirmedInEvm.can_transition_to(Rejected));
    }

    #[test]
    fn batch_status_is_monotonic() {
        for (i, a) in BatchStatus::ALL.iter().enumerate() {
            for (j, b) in BatchStatus::ALL.iter().enumerate() {
                assert_eq!(a.can_transition_to(*b), i <= j, "{a:?} -> {b:?}");
            }
        }
    }
}
