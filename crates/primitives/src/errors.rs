//! Errors for the value types in this crate.

use thiserror::Error;

/// Errors converting between integer base units and decimal strings.
#[derive(Debug, Error)]
pub enum AmountError {
    /// The decimal BTC string could not be parsed into an exact satoshi amount.
    #[error("invalid btc amount: {0}")]
    Btc(#[from] bitcoin::amount::ParseAmountError),

    /// The string is not a non-negative decimal number.
    #[error("malformed decimal: {0}")]
    Malformed(String),

    /// The value has more fractional digits than the unit allows.
    #[error("{value} has more than {max} fractional digits")]
    TooPrecise {
        /// The offending input.
        value: String,
        /// The number of fractional digits allowed.
        max: u32,
    },

    /// The value does not fit into the integer representation.
    #[error("amount overflow")]
    Overflow,
}

/// Errors validating a transfer destination or amount.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The recipient is not a valid address for the configured network.
    #[error("invalid recipient {recipient}: {reason}")]
    InvalidRecipient {
        /// The recipient as given.
        recipient: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Zero amounts are never accepted.
    #[error("transfer amount must be positive")]
    ZeroAmount,
}
