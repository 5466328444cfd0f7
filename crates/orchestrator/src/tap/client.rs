//! The Taproot-Assets daemon, reached over its REST gateway.

use std::{fmt, path::Path, time::Duration};

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue},
    Certificate,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_with::{serde_as, DisplayFromStr};
use thiserror::Error;
use tracing::debug;

/// Status of a receive whose transfer is complete.
pub const ADDR_EVENT_STATUS_COMPLETED: &str = "ADDR_EVENT_STATUS_COMPLETED";

/// Header carrying the hex encoded macaroon.
pub const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";

/// Errors from the Taproot-Assets daemon.
#[derive(Debug, Error)]
pub enum TapError {
    /// The HTTP request failed.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// The daemon answered with an error status.
    #[error("status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// A credential file could not be read.
    #[error("reading {path}: {source}")]
    Credentials {
        /// The file.
        path: String,
        /// The cause.
        source: std::io::Error,
    },

    /// The daemon returned something unexpected.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// A Taproot-Assets address as returned by the daemon.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapAddress {
    /// The bech32m encoded address.
    pub encoded: String,
    /// Asset id, as the gateway encodes it.
    #[serde(default)]
    pub asset_id: String,
    /// Amount of the asset, in base units.
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default)]
    pub amount: u64,
}

/// A receive event on one of our addresses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AddressReceive {
    /// The address that received.
    pub addr: TapAddress,
    /// Event status.
    pub status: String,
    /// Anchor outpoint, `txid:vout`.
    pub outpoint: String,
}

#[derive(Debug, Deserialize)]
struct ReceivesResponse {
    #[serde(default)]
    events: Vec<AddressReceive>,
}

/// The calls the bridge makes to the Taproot-Assets daemon.
#[async_trait]
pub trait TapClient: Send + Sync + fmt::Debug {
    /// Receive events for `address` in `status`.
    async fn list_receives(
        &self,
        address: &str,
        status: &str,
    ) -> Result<Vec<AddressReceive>, TapError>;

    /// A new address for `amount` of `asset_id`.
    async fn create_address(&self, asset_id: &str, amount: u64) -> Result<TapAddress, TapError>;

    /// Pays every address in one send. Returns the daemon's answer as is.
    async fn send_assets(&self, tap_addresses: &[String]) -> Result<serde_json::Value, TapError>;
}

/// [`TapClient`] over `https://{host}/v1/taproot-assets/`.
#[derive(Debug, Clone)]
pub struct TapRestClient {
    http: reqwest::Client,
    base_url: String,
}

impl TapRestClient {
    /// Connects to `host`, trusting the daemon's TLS certificate at `tls_cert_path` and
    /// authenticating with the macaroon at `macaroon_path`.
    pub fn new(
        host: &str,
        tls_cert_path: &Path,
        macaroon_path: &Path,
        timeout: Duration,
    ) -> Result<Self, TapError> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|source| TapError::Credentials {
                path: path.display().to_string(),
                source,
            })
        };
        let cert = Certificate::from_pem(&read(tls_cert_path)?)?;
        let macaroon = HeaderValue::from_str(&hex::encode(read(macaroon_path)?))
            .map_err(|e| TapError::InvalidResponse(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(MACAROON_HEADER, macaroon);
        let http = reqwest::Client::builder()
            .add_root_certificate(cert)
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: format!("https://{host}/v1/taproot-assets"),
        })
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, TapError> {
        let url = format!("{}/{path}", self.base_url);
        debug!(%url, "tapd request");
        let response = self.http.post(url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TapError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl TapClient for TapRestClient {
    async fn list_receives(
        &self,
        address: &str,
        status: &str,
    ) -> Result<Vec<AddressReceive>, TapError> {
        let response: ReceivesResponse = self
            .post(
                "addrs/receives",
                json!({ "filter_addr": address, "filter_status": status }),
            )
            .await?;
        Ok(response.events)
    }

    async fn create_address(&self, asset_id: &str, amount: u64) -> Result<TapAddress, TapError> {
        self.post(
            "addrs",
            json!({ "asset_id": asset_id, "amt": amount.to_string() }),
        )
        .await
    }

    async fn send_assets(&self, tap_addresses: &[String]) -> Result<serde_json::Value, TapError> {
        if tap_addresses.is_empty() {
            return Err(TapError::InvalidResponse("nothing to send".to_string()));
        }
        self.post("send", json!({ "tap_addrs": tap_addresses })).await
    }
}
