//! Runes to EVM tokens and back.
//!
//! Deposits: users send runes to a per-account P2WSH deposit address. Every federator scans its
//! node wallet for them; the leader asks the others to sign the mint and submits
//! `acceptTransferFromBtc` once enough have.
//!
//! Withdrawals: burns emit `RuneTransferToBtc`. Every federator records them; the leader builds a
//! PSBT paying the runes out of custody, the others check it against their own records and sign,
//! and the leader finalizes and broadcasts.

pub mod config;
pub mod messages;
mod to_btc;
mod to_evm;

use std::sync::Arc;

use alloy::{primitives::Address, signers::local::PrivateKeySigner};
use async_trait::async_trait;
use federator_db::{types::DepositAddressRecord, Database};
use federator_evm::{EventScanner, RuneBridgeContract};
use federator_key_deriv::{derive_deposit_address_info, DepositAddressInfo};
use federator_multisig::{fees::FeeEstimator, runes::wallet::OrdMultisig};
use federator_p2p::{AnswerError, Network, QuestionHandler, Topic};
use serde_json::Value;
use tracing::{debug, info};

pub use self::config::RuneBridgeConfig;
use self::messages::{SignRuneToEvmTransferQuestion, SignRuneTokenToBtcTransferQuestion};
use crate::{bridge::Bridge, errors::BridgeResult};

/// The rune bridge.
#[derive(Debug, Clone)]
pub struct RuneBridge {
    config: RuneBridgeConfig,
    network: Arc<dyn Network>,
    db: Arc<dyn Database>,
    wallet: OrdMultisig,
    contract: Arc<dyn RuneBridgeContract>,
    signer: PrivateKeySigner,
    fees: FeeEstimator,
    scanner: EventScanner,
}

impl RuneBridge {
    /// Creates the bridge. `signer` is this federator's EVM key; `wallet` holds its BTC key.
    pub fn new(
        config: RuneBridgeConfig,
        network: Arc<dyn Network>,
        db: Arc<dyn Database>,
        wallet: OrdMultisig,
        contract: Arc<dyn RuneBridgeContract>,
        signer: PrivateKeySigner,
        fees: FeeEstimator,
    ) -> Self {
        let scanner = EventScanner::new(
            config.name.clone(),
            config.evm_block_safety_margin,
            config.evm_default_start_block,
        );
        Self {
            config,
            network,
            db,
            wallet,
            contract,
            signer,
            fees,
            scanner,
        }
    }

    /// This federator's EVM address.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// The settings.
    pub const fn config(&self) -> &RuneBridgeConfig {
        &self.config
    }

    fn derive_deposit_address(&self, evm_address: Address) -> BridgeResult<DepositAddressInfo> {
        let keys = self.wallet.multisig().keys();
        Ok(derive_deposit_address_info(
            keys.xpubs(),
            keys.required(),
            &evm_address.to_checksum(None),
            0,
            self.wallet.multisig().params(),
        )?)
    }

    /// The deposit address of `evm_address`, derived, imported into the node wallet and stored on
    /// first use.
    pub async fn get_deposit_address(
        &self,
        evm_address: Address,
    ) -> BridgeResult<DepositAddressRecord> {
        let name = &self.config.name;
        if let Some(record) = self.db.get_deposit_address(name, evm_address).await? {
            return Ok(record);
        }

        let info = self.derive_deposit_address(evm_address)?;
        self.wallet
            .multisig()
            .import_address_descriptor(&info.derivation_path)
            .await?;
        let record = self
            .db
            .insert_deposit_address(
                name,
                DepositAddressRecord {
                    evm_address,
                    btc_address: info.address.to_string(),
                    index: info.index,
                },
            )
            .await?;
        info!(%evm_address, btc_address = %record.btc_address, "new rune deposit address");
        Ok(record)
    }
}

#[derive(Debug)]
struct ToEvmSigner(RuneBridge);

#[async_trait]
impl QuestionHandler for ToEvmSigner {
    async fn answer(&self, sender: Address, body: Value) -> Result<Option<Value>, AnswerError> {
        let question: SignRuneToEvmTransferQuestion =
            serde_json::from_value(body).map_err(AnswerError::new)?;
        debug!(%sender, txid = %question.btc_txid, vout = question.btc_vout, "mint signature requested");
        let answer = self.0.answer_sign_rune_to_evm(question).await?;
        Ok(Some(serde_json::to_value(answer).map_err(AnswerError::new)?))
    }
}

#[derive(Debug)]
struct ToBtcSigner(RuneBridge);

#[async_trait]
impl QuestionHandler for ToBtcSigner {
    async fn answer(&self, sender: Address, body: Value) -> Result<Option<Value>, AnswerError> {
        let question: SignRuneTokenToBtcTransferQuestion =
            serde_json::from_value(body).map_err(AnswerError::new)?;
        debug!(%sender, transfers = question.transfers.len(), "payout signature requested");
        let answer = self.0.answer_sign_token_to_btc(question).await?;
        Ok(Some(serde_json::to_value(answer).map_err(AnswerError::new)?))
    }
}

#[async_trait]
impl Bridge for RuneBridge {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn init(&self) -> BridgeResult<()> {
        if self.network.is_leader() {
            return Ok(());
        }
        self.network.answer_with(
            Topic::SignRuneDepositToEvm,
            Arc::new(ToEvmSigner(self.clone())),
        )?;
        self.network.answer_with(
            Topic::SignRuneTokenDepositToBtc,
            Arc::new(ToBtcSigner(self.clone())),
        )?;
        Ok(())
    }

    async fn run_iteration(&self) -> BridgeResult<()> {
        let deposits = self.scan_rune_deposits().await?;
        let burns = self.scan_rune_token_deposits().await?;
        debug!(deposits, burns, "scanned rune bridge sources");
        if !self.network.is_leader() {
            return Ok(());
        }

        let to_evm = self.process_rune_deposits().await;
        let to_btc = self.process_rune_token_deposits().await;
        to_evm.and(to_btc)
    }
}

#[cfg(test)]
mod test_utils;
