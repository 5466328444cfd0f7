//! Errors raised by the transaction engine.

use bitcoin::Amount;
use federator_key_deriv::DerivationError;
use federator_primitives::errors::TransferError;
use thiserror::Error;

use crate::{
    rpc::RpcError,
    runes::{ord::OrdError, runestone::RunestoneError},
};

/// Errors from building, signing, combining or broadcasting multisig transactions.
#[derive(Debug, Error)]
pub enum MultisigError {
    /// The bitcoin node returned an error or could not be reached.
    #[error("bitcoin rpc: {0}")]
    Rpc(#[from] RpcError),

    /// The ord indexer returned an error or could not be reached.
    #[error("ord: {0}")]
    Ord(#[from] OrdError),

    /// Key or address derivation failed.
    #[error(transparent)]
    Derivation(#[from] DerivationError),

    /// A transfer failed validation.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// A rune transfer failed validation.
    #[error("invalid rune transfer: {0}")]
    InvalidRuneTransfer(String),

    /// The wallet ran out of UTXOs before covering outputs and fee.
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds {
        /// Outputs plus fee.
        needed: Amount,
        /// Everything the wallet could contribute.
        available: Amount,
    },

    /// The wallet does not hold enough of some rune.
    #[error("missing required rune balances: {0:?}")]
    MissingRuneBalances(Vec<String>),

    /// Our master xpriv is not one of the configured master xpubs.
    #[error("master xpriv does not match any of the master xpubs")]
    SignerNotInXpubs,

    /// The threshold is zero or larger than the number of cosigners.
    #[error("invalid threshold {required} of {total}")]
    InvalidThreshold {
        /// Signatures required.
        required: usize,
        /// Cosigners known.
        total: usize,
    },

    /// An input carries no BIP32 derivation for our master fingerprint.
    #[error("input {0} has no derivation for our key")]
    NotOurInput(usize),

    /// An input lacks data needed to sign or finalize it.
    #[error("input {index}: {reason}")]
    MalformedInput {
        /// Input index.
        index: usize,
        /// What is missing.
        reason: &'static str,
    },

    /// Fewer than the threshold of distinct valid signatures on some input.
    #[error("cannot finalize input {input}: {valid} valid signatures, {required} required")]
    CannotFinalize {
        /// Input index.
        input: usize,
        /// Valid signatures found.
        valid: usize,
        /// Signatures required.
        required: usize,
    },

    /// `testmempoolaccept` refused the transaction.
    #[error("transaction rejected by mempool: {0}")]
    RejectedByMempool(String),

    /// The PSBT fee does not match what was computed during construction.
    #[error("fee mismatch: computed {computed}, psbt pays {actual}")]
    FeeMismatch {
        /// Fee computed during construction.
        computed: Amount,
        /// Fee implied by the PSBT.
        actual: Amount,
    },

    /// Generic PSBT failure (combine, fee computation).
    #[error("psbt: {0}")]
    Psbt(#[from] bitcoin::psbt::Error),

    /// A serialized PSBT could not be decoded.
    #[error("psbt encoding: {0}")]
    PsbtEncoding(#[from] bitcoin::psbt::PsbtParseError),

    /// The sighash for an input could not be computed.
    #[error("sighash: {0}")]
    Sighash(String),

    /// The final transaction could not be extracted.
    #[error("extract tx: {0}")]
    Extract(String),

    /// A wallet descriptor could not be parsed or built.
    #[error("descriptor: {0}")]
    Descriptor(String),

    /// No fee source produced an estimate.
    #[error("fee estimation failed: {0}")]
    FeeEstimation(String),

    /// A runestone could not be encoded or decoded.
    #[error("runestone: {0}")]
    Runestone(#[from] RunestoneError),
}

/// Shorthand result.
pub type MultisigResult<T> = Result<T, MultisigError>;
