//! Transaction size and fee rate estimation.

use std::{sync::Arc, time::Duration};

use bitcoin::{hashes::Hash, Amount, Network, ScriptBuf, Transaction, TxOut, WScriptHash, Witness};
use federator_primitives::params::NetworkParams;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    errors::{MultisigError, MultisigResult},
    rpc::BitcoinRpc,
};

/// Length of the placeholder for one DER signature plus sighash byte.
pub const SIGNATURE_PLACEHOLDER_LEN: usize = 71;

/// Fee rate used on regtest, in sat/vB.
pub const REGTEST_FEE_RATE: u64 = 10;

/// Timeout for a mempool.space fee request.
pub const MEMPOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Estimates the virtual size of `tx` once every input is signed.
///
/// Each input's witness is filled with `[empty, 71-byte placeholder x num_signatures,
/// witness_script]`. With `add_change`, a P2WSH change output is appended. This is a slight
/// overestimate since real DER signatures are often 70 or 71 bytes.
pub fn estimate_vsize(
    tx: &Transaction,
    witness_scripts: &[ScriptBuf],
    num_signatures: usize,
    add_change: bool,
) -> u64 {
    let mut tx = tx.clone();
    for (input, script) in tx.input.iter_mut().zip(witness_scripts) {
        let mut witness = Witness::new();
        witness.push(Vec::<u8>::new());
        for _ in 0..num_signatures {
            witness.push([0u8; SIGNATURE_PLACEHOLDER_LEN]);
        }
        witness.push(script.as_bytes());
        input.witness = witness;
    }
    if add_change {
        tx.output.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::new_p2wsh(&WScriptHash::all_zeros()),
        });
    }
    tx.weight().to_vbytes_ceil()
}

/// Fee for `vsize` virtual bytes at `fee_rate` sat/vB.
pub fn fee_for(vsize: u64, fee_rate: u64) -> Amount {
    Amount::from_sat(vsize.saturating_mul(fee_rate))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendedFees {
    fastest_fee: u64,
}

/// Fee rate source: mempool.space first (off regtest), then bitcoind's raw estimates.
#[derive(Debug, Clone)]
pub struct FeeEstimator {
    rpc: Arc<dyn BitcoinRpc>,
    params: NetworkParams,
    http: reqwest::Client,
    mempool_url: Option<String>,
}

impl FeeEstimator {
    /// Creates an estimator. `mempool_url` of `None` disables the mempool.space source.
    pub fn new(
        rpc: Arc<dyn BitcoinRpc>,
        params: NetworkParams,
        mempool_url: Option<String>,
    ) -> MultisigResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(MEMPOOL_TIMEOUT)
            .build()
            .map_err(|e| MultisigError::FeeEstimation(format!("mempool.space client: {e}")))?;
        Ok(Self {
            rpc,
            params,
            http,
            mempool_url,
        })
    }

    /// The public mempool.space API root for `network`.
    pub fn default_mempool_url(network: Network) -> Option<String> {
        let suffix = match network {
            Network::Bitcoin => "",
            Network::Testnet => "/testnet",
            Network::Signet => "/signet",
            _ => return None,
        };
        Some(format!("https://mempool.space{suffix}"))
    }

    /// Current fee rate in sat/vB.
    pub async fn fee_rate(&self) -> MultisigResult<u64> {
        if !self.params.is_regtest() {
            if let Some(url) = &self.mempool_url {
                match self.mempool_fee_rate(url).await {
                    Ok(rate) => return Ok(rate),
                    Err(e) => warn!(%e, "mempool.space fee estimation failed"),
                }
            }
        }
        self.bitcoind_fee_rate().await
    }

    async fn mempool_fee_rate(&self, base: &str) -> Result<u64, reqwest::Error> {
        let fees: RecommendedFees = self
            .http
            .get(format!("{base}/api/v1/fees/recommended"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(rate = fees.fastest_fee, "fee rate from mempool.space");
        Ok(fees.fastest_fee)
    }

    async fn bitcoind_fee_rate(&self) -> MultisigResult<u64> {
        if self.params.is_regtest() {
            return Ok(REGTEST_FEE_RATE);
        }
        for target in [1, 2] {
            match self.rpc.estimate_raw_fee(target).await {
                Ok(estimate) => {
                    if let Some(rate) = estimate.short_sat_per_vb() {
                        debug!(rate, target, "fee rate from bitcoind");
                        return Ok(rate);
                    }
                }
                Err(e) => warn!(%e, target, "estimaterawfee failed"),
            }
        }
        Err(MultisigError::FeeEstimation(
            "no fee source returned an estimate".to_string(),
        ))
    }
}
