//! Client for the ord indexer's JSON API.

use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;
use bitcoin::{Amount, OutPoint};
use reqwest::{header::ACCEPT, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use super::types::{Rune, RuneId};

/// Errors talking to ord.
#[derive(Debug, Error)]
pub enum OrdError {
    /// The HTTP request failed.
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    /// ord answered with an unexpected status.
    #[error("unexpected status {status} for {url}")]
    Status {
        /// HTTP status.
        status: StatusCode,
        /// Requested URL.
        url: String,
    },

    /// The response could not be decoded.
    #[error("decode: {0}")]
    Decode(String),
}

/// Balance of one rune held by an output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuneBalance {
    /// Raw amount.
    pub amount: u128,
    /// Decimal places.
    pub divisibility: u8,
    /// Currency symbol.
    #[serde(default)]
    pub symbol: Option<char>,
}

/// ord's view of one transaction output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrdOutput {
    /// Sats held by the output.
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub value: Amount,
    /// Rune balances keyed by spaced rune name.
    #[serde(default)]
    pub runes: BTreeMap<String, RuneBalance>,
    /// Inscription ids on the output's sats.
    #[serde(default)]
    pub inscriptions: Vec<String>,
    /// Whether ord has indexed the output.
    #[serde(default)]
    pub indexed: bool,
    /// Whether the output has been spent.
    #[serde(default)]
    pub spent: bool,
}

impl OrdOutput {
    /// Raw balance of `rune` (spacers ignored), zero if absent.
    pub fn rune_balance(&self, rune: &str) -> u128 {
        let wanted = Rune::unspaced(rune);
        self.runes
            .iter()
            .filter(|(name, _)| Rune::unspaced(name) == wanted)
            .map(|(_, balance)| balance.amount)
            .sum()
    }
}

/// An etched rune.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuneEntry {
    /// Etching location.
    pub id: RuneId,
    /// Name as its base-26 number.
    pub number: u128,
    /// Decimal places.
    pub divisibility: u8,
    /// Name with spacers.
    pub spaced_rune: String,
    /// Currency symbol.
    pub symbol: Option<char>,
}

/// ord queries the rune wallet and the bridge rely on.
#[async_trait]
pub trait OrdApi: Send + Sync + fmt::Debug {
    /// ord's view of `outpoint`.
    async fn output(&self, outpoint: &OutPoint) -> Result<OrdOutput, OrdError>;

    /// Looks up a rune by name; `None` if it has not been etched.
    async fn rune(&self, name: &str) -> Result<Option<RuneEntry>, OrdError>;

    /// Height of the last block ord has indexed.
    async fn block_count(&self) -> Result<u64, OrdError>;
}

#[derive(Debug, Deserialize)]
struct RuneResponse {
    id: RuneId,
    entry: RuneResponseEntry,
}

#[derive(Debug, Deserialize)]
struct RuneResponseEntry {
    divisibility: u8,
    spaced_rune: String,
    #[serde(default)]
    symbol: Option<char>,
}

/// [`OrdApi`] over ord's HTTP server with `Accept: application/json`.
#[derive(Debug, Clone)]
pub struct OrdClient {
    http: reqwest::Client,
    base_url: String,
}

impl OrdClient {
    /// Creates a client for the ord server at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, OrdError> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, path: &str) -> Result<Option<reqwest::Response>, OrdError> {
        let url = format!("{}/{path}", self.base_url);
        trace!(%url, "ord request");
        let response = self
            .http
            .get(&url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status => Err(OrdError::Status { status, url }),
        }
    }
}

#[async_trait]
impl OrdApi for OrdClient {
    async fn output(&self, outpoint: &OutPoint) -> Result<OrdOutput, OrdError> {
        let path = format!("output/{outpoint}");
        let response = self
            .get(&path)
            .await?
            .ok_or_else(|| OrdError::Decode(format!("output {outpoint} not found")))?;
        Ok(response.json().await?)
    }

    async fn rune(&self, name: &str) -> Result<Option<RuneEntry>, OrdError> {
        let unspaced = Rune::unspaced(name);
        let number: Rune = unspaced.parse().map_err(OrdError::Decode)?;
        let Some(response) = self.get(&format!("rune/{unspaced}")).await? else {
            return Ok(None);
        };
        let rune: RuneResponse = response.json().await?;
        Ok(Some(RuneEntry {
            id: rune.id,
            number: number.0,
            divisibility: rune.entry.divisibility,
            spaced_rune: rune.entry.spaced_rune,
            symbol: rune.entry.symbol,
        }))
    }

    async fn block_count(&self) -> Result<u64, OrdError> {
        let response = self
            .get("blockcount")
            .await?
            .ok_or_else(|| OrdError::Decode("blockcount not found".to_string()))?;
        let text = response.text().await?;
        text.trim()
            .parse()
            .map_err(|_| OrdError::Decode(format!("bad block count: {text}")))
    }
}
