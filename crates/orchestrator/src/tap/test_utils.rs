//! A scripted Taproot-Assets daemon shared by every node of a test federation.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use bitcoin::OutPoint;
use serde_json::{json, Value};

use super::client::{AddressReceive, TapAddress, TapClient, TapError, ADDR_EVENT_STATUS_COMPLETED};

#[derive(Debug, Default)]
pub(crate) struct MockTap {
    receives: Mutex<HashMap<String, Vec<AddressReceive>>>,
    created: Mutex<u64>,
    sends: Mutex<Vec<Vec<String>>>,
    send_error: Mutex<Option<String>>,
}

impl MockTap {
    /// A completed receive at `outpoint` on `tap_address`, listed as paid to `listed_as`.
    pub(crate) fn receive(&self, tap_address: &str, listed_as: &str, outpoint: OutPoint) {
        self.receives
            .lock()
            .unwrap()
            .entry(tap_address.to_string())
            .or_default()
            .push(AddressReceive {
                addr: TapAddress {
                    encoded: listed_as.to_string(),
                    asset_id: "asset".to_string(),
                    amount: 1,
                },
                status: ADDR_EVENT_STATUS_COMPLETED.to_string(),
                outpoint: outpoint.to_string(),
            });
    }

    /// Makes every later send fail with `reason` until cleared.
    pub(crate) fn fail_sends(&self, reason: Option<&str>) {
        *self.send_error.lock().unwrap() = reason.map(str::to_string);
    }

    /// Recipients of every send so far.
    pub(crate) fn sends(&self) -> Vec<Vec<String>> {
        self.sends.lock().unwrap().clone()
    }
}

#[async_trait]
impl TapClient for MockTap {
    async fn list_receives(
        &self,
        address: &str,
        _status: &str,
    ) -> Result<Vec<AddressReceive>, TapError> {
        Ok(self
            .receives
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_address(&self, asset_id: &str, amount: u64) -> Result<TapAddress, TapError> {
        let mut created = self.created.lock().unwrap();
        *created += 1;
        Ok(TapAddress {
            encoded: format!("taprt1qq{created}"),
            asset_id: asset_id.to_string(),
            amount,
        })
    }

    async fn send_assets(&self, tap_addresses: &[String]) -> Result<Value, TapError> {
        if let Some(reason) = self.send_error.lock().unwrap().clone() {
            return Err(TapError::Status {
                status: 500,
                body: reason,
            });
        }
        let mut sends = self.sends.lock().unwrap();
        sends.push(tap_addresses.to_vec());
        Ok(json!({ "transfer": { "anchor_tx_hash": format!("{:064x}", sends.len()) } }))
    }
}
