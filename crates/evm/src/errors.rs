//! Errors from the EVM side.

use alloy::primitives::B256;
use federator_db::DbError;
use thiserror::Error;

/// Errors talking to the EVM or handling its data.
#[derive(Debug, Error)]
pub enum EvmError {
    /// A contract call or transaction failed.
    #[error("contract: {0}")]
    Contract(#[from] alloy::contract::Error),

    /// The JSON-RPC transport failed.
    #[error("transport: {0}")]
    Transport(#[from] alloy::transports::TransportError),

    /// A signature could not be decoded or recovered.
    #[error("signature: {0}")]
    Signature(#[from] alloy::primitives::SignatureError),

    /// Signing failed.
    #[error("signer: {0}")]
    Signer(#[from] alloy::signers::Error),

    /// A value did not fit the expected type.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Bad configuration, such as an unparsable URL or key.
    #[error("config: {0}")]
    Config(String),

    /// The contract refused the call.
    #[error("reverted: {0}")]
    Reverted(String),

    /// No receipt showed up in time.
    #[error("no receipt for {0} before the timeout")]
    ReceiptTimeout(B256),

    /// The checkpoint store failed.
    #[error("db: {0}")]
    Db(#[from] DbError),
}

/// Result alias for EVM operations.
pub type EvmResult<T> = Result<T, EvmError>;
