//! The slice of the bitcoind JSON-RPC interface the federator needs, plus an HTTP client for it.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bitcoin::{
    consensus::encode::{deserialize_hex, serialize_hex},
    Amount, BlockHash, Denomination, ScriptBuf, SignedAmount, Transaction, Txid,
};
use federator_common::retry::{linear_delay, retry_with, RetryAction, Strategy};
use federator_primitives::amount::{btc_to_sat, parse_decimal};
use serde::{de, de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{json, value::RawValue, Value};
use thiserror::Error;
use tracing::{trace, warn};

/// Errors talking to bitcoind.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The HTTP request failed before a JSON-RPC response was received.
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    /// bitcoind answered with a JSON-RPC error.
    #[error("server error {code}: {message}")]
    Server {
        /// JSON-RPC error code.
        code: i64,
        /// Error message.
        message: String,
    },

    /// The response did not have the expected shape.
    #[error("could not decode response: {0}")]
    Decode(String),
}

/// Shorthand result.
pub type RpcResult<T> = Result<T, RpcError>;

/// Bitcoin node calls used by the wallet and the deposit scanner.
#[async_trait]
pub trait BitcoinRpc: Send + Sync + fmt::Debug {
    /// `listunspent minconf 9999999 [addresses] false`.
    async fn list_unspent(
        &self,
        min_conf: u32,
        addresses: Option<&[String]>,
    ) -> RpcResult<Vec<ListUnspentEntry>>;

    /// `listsinceblock`, from the genesis block when `block_hash` is `None`.
    async fn list_since_block(
        &self,
        block_hash: Option<&BlockHash>,
        target_confirmations: u32,
    ) -> RpcResult<ListSinceBlock>;

    /// `gettransaction txid true`.
    async fn get_transaction(&self, txid: &Txid) -> RpcResult<GetTransaction>;

    /// `testmempoolaccept [hex]`.
    async fn test_mempool_accept(&self, tx: &Transaction) -> RpcResult<Vec<MempoolAcceptResult>>;

    /// `sendrawtransaction hex`.
    async fn send_raw_transaction(&self, tx: &Transaction) -> RpcResult<Txid>;

    /// `importdescriptors [requests]`.
    async fn import_descriptors(
        &self,
        requests: Vec<ImportDescriptorRequest>,
    ) -> RpcResult<Vec<ImportDescriptorResult>>;

    /// `estimaterawfee conf_target`.
    async fn estimate_raw_fee(&self, conf_target: u32) -> RpcResult<EstimateRawFee>;

    /// `getblockcount`.
    async fn get_block_count(&self) -> RpcResult<u64>;
}

/// One entry of `listunspent`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListUnspentEntry {
    /// Funding transaction.
    pub txid: Txid,
    /// Output index.
    pub vout: u32,
    /// Address the output pays to.
    #[serde(default)]
    pub address: Option<String>,
    /// Output value, exact.
    #[serde(deserialize_with = "deserialize_btc")]
    pub amount: Amount,
    /// Confirmation count.
    pub confirmations: u32,
    /// The P2WSH witness script, when the wallet knows it.
    #[serde(rename = "witnessScript", default)]
    pub witness_script: Option<ScriptBuf>,
    /// Output descriptor with key origin info.
    #[serde(default)]
    pub desc: Option<String>,
}

/// Result of `listsinceblock`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListSinceBlock {
    /// Wallet transactions since the block.
    pub transactions: Vec<SinceBlockTx>,
    /// Hash to pass on the next call.
    pub lastblock: BlockHash,
}

/// One wallet transaction entry from `listsinceblock`.
#[derive(Debug, Clone, Deserialize)]
pub struct SinceBlockTx {
    /// Address involved, absent for some categories.
    #[serde(default)]
    pub address: Option<String>,
    /// `send`, `receive`, `generate`, `immature` or `orphan`.
    pub category: String,
    /// Signed amount, exact.
    #[serde(deserialize_with = "deserialize_signed_btc")]
    pub amount: SignedAmount,
    /// Output index.
    pub vout: u32,
    /// Confirmations, negative when conflicted.
    pub confirmations: i64,
    /// Block containing the transaction.
    #[serde(default)]
    pub blockhash: Option<BlockHash>,
    /// Height of that block.
    #[serde(default)]
    pub blockheight: Option<u64>,
    /// Transaction id.
    pub txid: Txid,
    /// Transaction time.
    pub time: u64,
}

/// Result of `gettransaction`.
#[derive(Debug, Clone, Deserialize)]
pub struct GetTransaction {
    /// Raw transaction hex.
    pub hex: String,
    /// Confirmations, negative when conflicted.
    pub confirmations: i64,
}

impl GetTransaction {
    /// Decodes the raw transaction.
    pub fn transaction(&self) -> RpcResult<Transaction> {
        deserialize_hex(&self.hex).map_err(|e| RpcError::Decode(e.to_string()))
    }
}

/// One entry of `testmempoolaccept`.
#[derive(Debug, Clone, Deserialize)]
pub struct MempoolAcceptResult {
    /// Transaction id.
    pub txid: Txid,
    /// Whether the mempool would accept it.
    pub allowed: bool,
    /// Why it would not.
    #[serde(rename = "reject-reason", default)]
    pub reject_reason: Option<String>,
}

/// One request for `importdescriptors`.
#[derive(Debug, Clone, Serialize)]
pub struct ImportDescriptorRequest {
    /// The descriptor, with checksum.
    pub desc: String,
    /// `"now"` or a unix timestamp to rescan from.
    pub timestamp: Value,
    /// Index range for ranged descriptors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<(u32, u32)>,
    /// Whether outputs are spendable with the wallet's keys.
    pub watchonly: bool,
}

/// One result of `importdescriptors`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportDescriptorResult {
    /// Whether the import succeeded.
    pub success: bool,
    /// Error detail.
    #[serde(default)]
    pub error: Option<Value>,
}

/// Result of `estimaterawfee`.
#[derive(Debug, Deserialize)]
pub struct EstimateRawFee {
    /// Short horizon estimate.
    #[serde(default)]
    pub short: Option<FeeHorizon>,
}

/// One horizon of `estimaterawfee`.
#[derive(Debug, Deserialize)]
pub struct FeeHorizon {
    /// Fee rate in BTC/kvB, absent when no estimate is available.
    #[serde(default)]
    pub feerate: Option<Box<RawValue>>,
}

impl EstimateRawFee {
    /// The short horizon fee rate in sat/vB, rounded up.
    pub fn short_sat_per_vb(&self) -> Option<u64> {
        let raw = self.short.as_ref()?.feerate.as_ref()?;
        // BTC/kvB * 1e8 / 1000 = BTC/kvB * 1e5
        let scaled = parse_decimal(raw.get(), 18).ok()?;
        let sat_per_vb = scaled.div_ceil(10u128.pow(13));
        (sat_per_vb > 0).then(|| u64::try_from(sat_per_vb).ok()).flatten()
    }
}

fn deserialize_btc<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
    let raw = <Box<RawValue>>::deserialize(deserializer)?;
    btc_to_sat(raw.get()).map_err(de::Error::custom)
}

fn deserialize_signed_btc<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<SignedAmount, D::Error> {
    let raw = <Box<RawValue>>::deserialize(deserializer)?;
    SignedAmount::from_str_in(raw.get(), Denomination::Bitcoin).map_err(de::Error::custom)
}

/// Connection settings for [`BitcoindClient`].
#[derive(Debug, Clone)]
pub struct BitcoindConfig {
    /// Node RPC URL, wallet path included when needed.
    pub url: String,
    /// RPC user.
    pub user: String,
    /// RPC password.
    pub pass: String,
    /// Retries for transport failures.
    pub retry_count: usize,
    /// Backoff unit between retries.
    pub retry_interval: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// JSON-RPC client for bitcoind over HTTP.
#[derive(Debug)]
pub struct BitcoindClient {
    http: reqwest::Client,
    config: BitcoindConfig,
    next_id: AtomicU64,
    retry: Strategy<RpcError>,
}

impl BitcoindClient {
    /// Creates a new client. No request is made until the first call.
    pub fn new(config: BitcoindConfig) -> RpcResult<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        let interval = config.retry_interval;
        let retry = Strategy::new(move |error: &RpcError, attempt| match error {
            RpcError::Transport(_) => RetryAction::Retry(linear_delay(interval, attempt)),
            _ => RetryAction::Stop,
        })
        .with_max_retries(config.retry_count);

        Ok(Self {
            http,
            config,
            next_id: AtomicU64::new(0),
            retry,
        })
    }

    /// Calls `method` with `params`, retrying transport failures.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> RpcResult<T> {
        let this = self;
        let params = &params;
        let result = retry_with(&self.retry, move || this.call_once(method, params)).await;
        if let Err(e) = &result {
            warn!(%method, %e, "bitcoind call failed");
        }
        let value = result?;
        serde_json::from_value(value).map_err(|e| RpcError::Decode(format!("{method}: {e}")))
    }

    async fn call_once(&self, method: &str, params: &Value) -> RpcResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(%method, id, "bitcoind request");
        let body = json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });

        // bitcoind reports JSON-RPC errors with non-2xx statuses, so the body is parsed either way.
        let response: RpcResponse = self
            .http
            .post(&self.config.url)
            .basic_auth(&self.config.user, Some(&self.config.pass))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(RpcError::Server {
                code: err.code,
                message: err.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl BitcoinRpc for BitcoindClient {
    async fn list_unspent(
        &self,
        min_conf: u32,
        addresses: Option<&[String]>,
    ) -> RpcResult<Vec<ListUnspentEntry>> {
        let addresses = addresses.map(<[String]>::to_vec).unwrap_or_default();
        self.call("listunspent", json!([min_conf, 9_999_999, addresses, false]))
            .await
    }

    async fn list_since_block(
        &self,
        block_hash: Option<&BlockHash>,
        target_confirmations: u32,
    ) -> RpcResult<ListSinceBlock> {
        let from = block_hash.map(ToString::to_string).unwrap_or_default();
        self.call("listsinceblock", json!([from, target_confirmations]))
            .await
    }

    async fn get_transaction(&self, txid: &Txid) -> RpcResult<GetTransaction> {
        self.call("gettransaction", json!([txid.to_string(), true]))
            .await
    }

    async fn test_mempool_accept(&self, tx: &Transaction) -> RpcResult<Vec<MempoolAcceptResult>> {
        self.call("testmempoolaccept", json!([[serialize_hex(tx)]]))
            .await
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> RpcResult<Txid> {
        self.call("sendrawtransaction", json!([serialize_hex(tx)]))
            .await
    }

    async fn import_descriptors(
        &self,
        requests: Vec<ImportDescriptorRequest>,
    ) -> RpcResult<Vec<ImportDescriptorResult>> {
        self.call("importdescriptors", json!([requests])).await
    }

    async fn estimate_raw_fee(&self, conf_target: u32) -> RpcResult<EstimateRawFee> {
        self.call("estimaterawfee", json!([conf_target])).await
    }

    async fn get_block_count(&self) -> RpcResult<u64> {
        self.call("getblockcount", json!([])).await
    }
}
