use std::{net::SocketAddr, path::PathBuf, time::Duration};

use alloy::primitives::Address;
use bitcoin::{bip32::Xpub, Amount, Network};
use federator_db::DbConfig;
use federator_orchestrator::{
    runes::RuneBridgeConfig,
    tap::{to_tap::EvmToTapConfig, TapBridgeConfig},
};
use federator_p2p::{NodeId, PeerConfig};
use federator_primitives::amount::Percentage;
use federator_transport::tls::TlsPaths;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};

/// The configuration of one federator node.
///
/// Everything here is local to the node, except the key set in `[btc]` and the bridge settings
/// that feed signing checks, which must agree across the federation for followers to sign what
/// the leader proposes.
#[derive(Debug, Deserialize)]
pub(crate) struct Config {
    /// The bitcoin network the federation custodies on.
    pub network: Network,

    /// The directory to store all the data in.
    pub datadir: PathBuf,

    /// Seconds between bridge iterations.
    pub poll_interval_secs: Option<u64>,

    /// Tokio worker threads.
    pub num_threads: Option<u8>,

    /// Stack size of each worker thread.
    pub thread_stack_size: Option<usize>,

    pub p2p: P2pConfig,

    pub tls: TlsPaths,

    pub btc: BtcConfig,

    /// Required when `[runes]` is set.
    pub ord: Option<OrdConfig>,

    pub evm: EvmConfig,

    #[serde(default)]
    pub db: DbConfig,

    pub runes: Option<RunesConfig>,

    pub tap: Option<TapConfig>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct P2pConfig {
    /// This node's id among its peers.
    pub node_id: NodeId,

    /// The id of the node that drives signing rounds.
    pub leader_id: NodeId,

    /// Address the QUIC server binds to.
    pub listen_addr: SocketAddr,

    /// Every other federator.
    pub peers: Vec<PeerConfig>,

    pub connection_limit: Option<usize>,

    /// Seconds before a peer request is abandoned.
    pub timeout_secs: Option<u64>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
pub(crate) struct BtcConfig {
    pub url: String,
    pub user: String,
    pub pass: String,
    pub retry_count: Option<usize>,
    pub retry_interval_ms: Option<u64>,
    pub timeout_secs: Option<u64>,

    /// File holding this node's master xpriv.
    pub xpriv_path: PathBuf,

    /// Every cosigner's master xpub, ours included.
    #[serde_as(as = "Vec<DisplayFromStr>")]
    pub xpubs: Vec<Xpub>,

    /// Signatures needed to spend from custody.
    pub required: usize,

    /// Overrides the mempool.space fee endpoint. Unused on regtest.
    pub mempool_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OrdConfig {
    pub url: String,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EvmConfig {
    pub rpc_url: String,

    /// File holding this node's hex EVM private key.
    pub private_key_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RunesConfig {
    pub contract: Address,
    pub fee_percentage: Option<Percentage>,
    pub min_confirmations: Option<u32>,
    pub min_postage_sat: Option<u64>,
    pub min_fee_rate: Option<u64>,
    pub max_fee_rate: Option<u64>,
    pub start_block: Option<u64>,
    pub block_safety_margin: Option<u64>,
    pub max_pending_evm_txs: Option<u64>,
    pub max_transfers_per_psbt: Option<usize>,
}

impl RunesConfig {
    /// The bridge settings, defaults filled in.
    pub(crate) fn bridge_config(&self) -> RuneBridgeConfig {
        let defaults = RuneBridgeConfig::default();
        RuneBridgeConfig {
            btc_min_confirmations: self
                .min_confirmations
                .unwrap_or(defaults.btc_min_confirmations),
            btc_min_postage: self
                .min_postage_sat
                .map(Amount::from_sat)
                .unwrap_or(defaults.btc_min_postage),
            btc_min_fee_rate: self.min_fee_rate.unwrap_or(defaults.btc_min_fee_rate),
            btc_max_fee_rate: self.max_fee_rate.unwrap_or(defaults.btc_max_fee_rate),
            evm_default_start_block: self.start_block.unwrap_or(defaults.evm_default_start_block),
            evm_block_safety_margin: self
                .block_safety_margin
                .unwrap_or(defaults.evm_block_safety_margin),
            to_evm_fee_percentage: self
                .fee_percentage
                .unwrap_or(defaults.to_evm_fee_percentage),
            max_pending_evm_txs: self
                .max_pending_evm_txs
                .unwrap_or(defaults.max_pending_evm_txs),
            max_transfers_per_psbt: self
                .max_transfers_per_psbt
                .unwrap_or(defaults.max_transfers_per_psbt),
            ..defaults
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TapConfig {
    pub contract: Address,

    /// `host:port` of tapd's REST server.
    pub host: String,
    pub tls_cert_path: PathBuf,
    pub macaroon_path: PathBuf,
    pub timeout_secs: Option<u64>,
    pub batch_limit: Option<usize>,
    pub start_block: Option<u64>,
    pub block_safety_margin: Option<u64>,
}

impl TapConfig {
    /// The bridge settings, defaults filled in.
    pub(crate) fn bridge_config(&self) -> TapBridgeConfig {
        let defaults = TapBridgeConfig::default();
        TapBridgeConfig {
            batch_limit: self.batch_limit.unwrap_or(defaults.batch_limit),
            ..defaults
        }
    }

    /// Settings of the EVM to Taproot-Assets direction, defaults filled in.
    pub(crate) fn evm_to_tap_config(&self) -> EvmToTapConfig {
        let defaults = EvmToTapConfig::default();
        EvmToTapConfig {
            batch_limit: self.batch_limit.unwrap_or(defaults.batch_limit),
            evm_default_start_block: self.start_block.unwrap_or(defaults.evm_default_start_block),
            evm_block_safety_margin: self
                .block_safety_margin
                .unwrap_or(defaults.evm_block_safety_margin),
            ..defaults
        }
    }
}

/// Seconds from an optional config value.
pub(crate) fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

    fn example() -> String {
        format!(
            r#"
            network = "regtest"
            datadir = ".data"
            poll_interval_secs = 5

            [p2p]
            node_id = "node-1"
            leader_id = "node-0"
            listen_addr = "127.0.0.1:5001"
            peers = [
                {{ node_id = "node-0", address = "127.0.0.1:5000", server_name = "node-0" }},
                {{ node_id = "node-2", address = "127.0.0.1:5002", server_name = "node-2" }},
            ]

            [tls]
            server_cert = "tls/server.pem"
            server_key = "tls/server.key"
            client_cert = "tls/client.pem"
            client_key = "tls/client.key"
            ca_cert = "tls/ca.pem"

            [btc]
            url = "http://localhost:18443/wallet/federator"
            user = "user"
            pass = "password"
            xpriv_path = "keys/xpriv"
            xpubs = ["{XPUB}"]
            required = 1

            [ord]
            url = "http://localhost:8080"

            [evm]
            rpc_url = "http://localhost:8545"
            private_key_path = "keys/evm"

            [db]
            max_retry_count = 3
            backoff_period = {{ secs = 1, nanos = 0 }}

            [runes]
            contract = "0x00000000000000000000000000000000000000aa"
            fee_percentage = "0.5"
            max_fee_rate = 50

            [tap]
            contract = "0x00000000000000000000000000000000000000bb"
            host = "localhost:8289"
            tls_cert_path = "tap/tls.cert"
            macaroon_path = "tap/admin.macaroon"
            start_block = 120
        "#
        )
    }

    #[test]
    fn parses_a_node_config() {
        let config = toml::from_str::<Config>(&example()).unwrap();

        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.p2p.peers.len(), 2);
        assert_eq!(config.p2p.peers[0].node_id, "node-0");
        assert_eq!(config.btc.xpubs[0].to_string(), XPUB);
        assert_eq!(config.db.max_retry_count(), 3);
        let tap = config.tap.as_ref().unwrap();
        assert_eq!(tap.bridge_config().batch_limit, 10);
        let outgoing = tap.evm_to_tap_config();
        assert_eq!(outgoing.evm_default_start_block, 120);
        assert_eq!(outgoing.evm_block_safety_margin, 0);

        let runes = config.runes.unwrap().bridge_config();
        assert_eq!(runes.btc_max_fee_rate, 50);
        assert_eq!(runes.to_evm_fee_percentage, Percentage::parse("0.5").unwrap());
        assert_eq!(runes.btc_min_confirmations, RuneBridgeConfig::default().btc_min_confirmations);
    }

    #[test]
    fn db_section_is_optional() {
        let without_db = example().replace("max_retry_count = 3", "").replace(
            "backoff_period = { secs = 1, nanos = 0 }",
            "",
        );
        let without_db = without_db.replace("[db]", "");
        let config = toml::from_str::<Config>(&without_db).unwrap();
        assert_eq!(config.db, DbConfig::default());
    }
}
