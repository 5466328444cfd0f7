//! Network parameters threaded through every component that encodes addresses or scripts.

use bitcoin::{address::NetworkUnchecked, Address, Network, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::errors::TransferError;

/// Minimum fee rate accepted on mainnet, in sat/vB.
pub const MAINNET_MIN_FEE_RATE: u64 = 15;

/// Minimum fee rate accepted on every other network, in sat/vB.
pub const DEFAULT_MIN_FEE_RATE: u64 = 1;

/// Immutable network context, constructed once at startup and passed to constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkParams {
    network: Network,
}

impl NetworkParams {
    /// Creates params for `network`.
    pub const fn new(network: Network) -> Self {
        Self { network }
    }

    /// The bitcoin network.
    pub const fn network(&self) -> Network {
        self.network
    }

    /// Whether this is a local regtest network.
    pub fn is_regtest(&self) -> bool {
        self.network == Network::Regtest
    }

    /// The lowest fee rate this network will relay in practice, in sat/vB.
    pub fn min_fee_rate(&self) -> u64 {
        match self.network {
            Network::Bitcoin => MAINNET_MIN_FEE_RATE,
            _ => DEFAULT_MIN_FEE_RATE,
        }
    }

    /// Parses an address and checks it belongs to this network.
    pub fn parse_address(&self, address: &str) -> Result<Address, TransferError> {
        let invalid = |reason: String| TransferError::InvalidRecipient {
            recipient: address.to_owned(),
            reason,
        };
        address
            .parse::<Address<NetworkUnchecked>>()
            .map_err(|e| invalid(e.to_string()))?
            .require_network(self.network)
            .map_err(|e| invalid(e.to_string()))
    }

    /// Parses an address and returns its output script.
    pub fn script_pubkey(&self, address: &str) -> Result<ScriptBuf, TransferError> {
        Ok(self.parse_address(address)?.script_pubkey())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_must_match_network() {
        let regtest = NetworkParams::new(Network::Regtest);
        let mainnet = NetworkParams::new(Network::Bitcoin);
        let addr = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";

        assert!(regtest.parse_address(addr).is_ok());
        assert!(mainnet.parse_address(addr).is_err());
        assert!(regtest.parse_address("not an address").is_err());
    }

    #[test]
    fn min_fee_rate_depends_on_network() {
        assert_eq!(NetworkParams::new(Network::Bitcoin).min_fee_rate(), 15);
        assert_eq!(NetworkParams::new(Network::Signet).min_fee_rate(), 1);
    }

    #[test]
    fn params_serde() {
        let params: NetworkParams = serde_json::from_str(r#"{"network":"regtest"}"#).unwrap();
        assert!(params.is_regtest());
    }
}
