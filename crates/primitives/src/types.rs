//! Shared value types.

use bitcoin::{Amount, TxOut};
use serde::{Deserialize, Serialize};

use crate::{errors::TransferError, params::NetworkParams};

/// An intended BTC payment to one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Destination address, checked against the network on use.
    pub recipient: String,

    /// Amount in satoshi.
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
}

impl Transfer {
    /// Creates a new transfer.
    pub fn new(recipient: impl Into<String>, amount: Amount) -> Self {
        Self {
            recipient: recipient.into(),
            amount,
        }
    }

    /// Validates the transfer and returns the output paying it.
    pub fn to_txout(&self, params: &NetworkParams) -> Result<TxOut, TransferError> {
        if self.amount == Amount::ZERO {
            return Err(TransferError::ZeroAmount);
        }
        Ok(TxOut {
            value: self.amount,
            script_pubkey: params.script_pubkey(&self.recipient)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::Network;

    use super::*;

    #[test]
    fn zero_amount_is_rejected() {
        let params = NetworkParams::new(Network::Regtest);
        let transfer = Transfer::new(
            "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080",
            Amount::ZERO,
        );
        assert!(matches!(
            transfer.to_txout(&params),
            Err(TransferError::ZeroAmount)
        ));
    }

    #[test]
    fn valid_transfer_builds_output() {
        let params = NetworkParams::new(Network::Regtest);
        let transfer = Transfer::new(
            "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080",
            Amount::from_sat(1_000),
        );
        let out = transfer.to_txout(&params).unwrap();
        assert_eq!(out.value, Amount::from_sat(1_000));
        assert!(out.script_pubkey.is_p2wpkh());
    }
}
