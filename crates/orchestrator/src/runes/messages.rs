//! Questions and answers federators exchange about rune transfers.

use alloy::primitives::{Address, B256};
use bitcoin::{bip32::Xpub, Txid};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

/// Asks a follower to sign the mint of a rune deposit.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignRuneToEvmTransferQuestion {
    /// Recipient on the EVM.
    pub evm_address: Address,
    /// Funding transaction.
    pub btc_txid: Txid,
    /// Funding output index.
    pub btc_vout: u32,
    /// Spaced rune name.
    pub rune_name: String,
    /// Base-26 rune number.
    #[serde_as(as = "DisplayFromStr")]
    pub rune_number: u128,
    /// Raw amount held by the output.
    #[serde_as(as = "DisplayFromStr")]
    pub amount_raw: u128,
    /// Raw amount to mint, after fees.
    #[serde_as(as = "DisplayFromStr")]
    pub net_amount_raw: u128,
}

/// A follower's signature of a mint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignRuneToEvmTransferAnswer {
    /// EIP-191 signature, `0x` hex.
    pub signature: String,
    /// Who signed.
    pub signer: Address,
    /// What was signed.
    pub message_hash: B256,
}

/// One burn a payout covers.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuneTokenTransfer {
    /// Transaction that emitted the burn event.
    pub evm_tx_hash: B256,
    /// Log index of the event.
    pub log_index: u64,
    /// Where the runes go.
    pub receiver_address: String,
    /// Base-26 rune number.
    #[serde_as(as = "DisplayFromStr")]
    pub rune_number: u128,
    /// Spaced rune name.
    pub rune_name: String,
    /// Raw amount paid.
    #[serde_as(as = "DisplayFromStr")]
    pub net_rune_amount: u128,
}

/// Asks a follower to sign a payout of burned rune tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignRuneTokenToBtcTransferQuestion {
    /// The burns, in output order.
    pub transfers: Vec<RuneTokenTransfer>,
    /// The unsigned PSBT, base64.
    pub unsigned_psbt: String,
    /// Fee rate the PSBT was built at, sat/vB.
    pub fee_rate: u64,
}

/// A follower's signed copy of the payout PSBT.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignRuneTokenToBtcTransferAnswer {
    /// The PSBT with the follower's signatures, base64.
    pub signed_psbt: String,
    /// The follower's master xpub.
    #[serde_as(as = "DisplayFromStr")]
    pub signer_xpub: Xpub,
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;
    use serde_json::json;

    use super::*;

    #[test]
    fn amounts_travel_as_strings() {
        let question = SignRuneToEvmTransferQuestion {
            evm_address: Address::repeat_byte(1),
            btc_txid: Txid::all_zeros(),
            btc_vout: 1,
            rune_name: "TEST•RUNE".to_string(),
            rune_number: 1,
            amount_raw: u128::MAX,
            net_amount_raw: 2,
        };
        let value = serde_json::to_value(&question).unwrap();
        assert_eq!(value["amount_raw"], json!(u128::MAX.to_string()));
        assert_eq!(
            serde_json::from_value::<SignRuneToEvmTransferQuestion>(value).unwrap(),
            question
        );
    }

    #[test]
    fn unknown_fields_are_refused() {
        let body = json!({
            "signature": "0x00",
            "signer": Address::repeat_byte(1),
            "message_hash": B256::ZERO,
            "extra": true,
        });
        assert!(serde_json::from_value::<SignRuneToEvmTransferAnswer>(body).is_err());
    }
}
