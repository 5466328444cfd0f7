//! Errors raised while running a bridge.

use alloy::primitives::B256;
use bitcoin::OutPoint;
use federator_db::DbError;
use federator_evm::EvmError;
use federator_key_deriv::DerivationError;
use federator_multisig::{rpc::RpcError, runes::ord::OrdError, MultisigError};
use federator_p2p::{AnswerError, NetworkError};
use federator_primitives::errors::AmountError;
use federator_transport::FederatorLookupError;
use thiserror::Error;

use crate::tap::client::TapError;

/// Errors from a bridge iteration or from answering a peer.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The store failed.
    #[error("db: {0}")]
    Db(#[from] DbError),

    /// The EVM side failed.
    #[error("evm: {0}")]
    Evm(#[from] EvmError),

    /// Building, signing or broadcasting a BTC transaction failed.
    #[error("multisig: {0}")]
    Multisig(#[from] MultisigError),

    /// bitcoind failed.
    #[error("bitcoin rpc: {0}")]
    Rpc(#[from] RpcError),

    /// The ord indexer failed.
    #[error("ord: {0}")]
    Ord(#[from] OrdError),

    /// The Taproot-Assets daemon failed.
    #[error("tap: {0}")]
    Tap(#[from] TapError),

    /// The peer network failed.
    #[error("network: {0}")]
    Network(#[from] NetworkError),

    /// A deposit address could not be derived.
    #[error("derivation: {0}")]
    Derivation(#[from] DerivationError),

    /// An amount did not compute.
    #[error("amount: {0}")]
    Amount(#[from] AmountError),

    /// The federator set could not be read.
    #[error("federators: {0}")]
    Federators(#[from] FederatorLookupError),

    /// A payload did not encode or decode.
    #[error("payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// A request or answer failed validation.
    #[error("invalid: {0}")]
    Invalid(String),

    /// We already signed something else for the same resource.
    #[error("conflicting claim: {0}")]
    ConflictingClaim(String),

    /// Too many of our EVM transactions are still unmined.
    #[error("{0} EVM transactions pending")]
    TooManyPending(u64),

    /// The network fee rate is above what we are willing to pay.
    #[error("fee rate {rate} sat/vB is above the maximum of {max}")]
    FeeRateTooHigh {
        /// Estimated rate.
        rate: u64,
        /// Configured maximum.
        max: u64,
    },

    /// ord lags behind bitcoind.
    #[error("ord did not reach block {0} in time")]
    OrdNotSynced(u64),

    /// ord has not indexed a deposit output after every retry.
    #[error("ord has not indexed {0}")]
    OrdOutputNotIndexed(OutPoint),

    /// Another writer moved the scan checkpoint while we scanned.
    #[error("checkpoint {0} changed during the scan")]
    CheckpointChanged(String),

    /// A batch was left mid-submission. It needs an operator.
    #[error("batch {0} is stuck mid-submission")]
    StuckBatch(B256),

    /// A batch's last submission reverted.
    #[error("batch {hash}: transaction {tx_hash} failed")]
    BatchTransactionFailed {
        /// Batch hash.
        hash: B256,
        /// The reverted transaction.
        tx_hash: B256,
    },
}

/// Result alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// A validation failure.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }
}

impl From<BridgeError> for AnswerError {
    fn from(err: BridgeError) -> Self {
        Self::new(err)
    }
}
