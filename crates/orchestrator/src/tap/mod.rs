//! Taproot-Assets to EVM: completed receives on our deposit addresses are credited on the EVM in
//! batches signed by the federation.
//!
//! A batch moves `Created -> SignaturesCollected -> Sending -> Sent -> Finalized` and never
//! back. A batch found in `Sending` was interrupted mid-submission; it is reported as
//! [`BridgeError::StuckBatch`] on every iteration and never resubmitted.

pub mod client;
pub mod hashes;
pub mod messages;
pub mod to_tap;

#[cfg(test)]
mod test_utils;

use std::{sync::Arc, time::Duration};

use alloy::{
    primitives::{Address, Bytes, B256},
    signers::local::PrivateKeySigner,
};
use async_trait::async_trait;
use bitcoin::OutPoint;
use federator_db::{
    types::{BatchSignatures, BatchStatus, SignedClaim, TapDepositAddress, TransferBatch},
    Database, DbError, TapBridgeDb,
};
use federator_evm::{
    scanner::{wait_for_receipt, RECEIPT_POLL_INTERVAL},
    signer::{decode_signature, recover_message_signer, sign_message_hash},
    EvmError, TapBridgeContract, TapTransfer,
};
use federator_p2p::{Answer, AnswerError, Network, Question, QuestionHandler, Topic};
use serde_json::Value;
use tracing::{debug, info, warn};

use self::{
    client::{TapClient, ADDR_EVENT_STATUS_COMPLETED},
    hashes::{batch_hash, transfer_hash},
    messages::{tap_transfer, BatchMessage, BatchSignaturesResponse, BatchTransferMessage},
};
use crate::{
    bridge::Bridge,
    claims::record_claims,
    errors::{BridgeError, BridgeResult},
    signatures::{collect_signatures, CollectConfig},
};

/// Settings of a [`TapBridge`].
#[derive(Debug, Clone)]
pub struct TapBridgeConfig {
    /// Name in logs.
    pub name: String,
    /// Most transfers in one batch.
    pub batch_limit: usize,
    /// Signature collection.
    pub collect: CollectConfig,
    /// How long to wait for the last submission of a batch to be mined per iteration.
    pub receipt_timeout: Duration,
    /// Wait between receipt polls.
    pub receipt_poll_interval: Duration,
}

impl Default for TapBridgeConfig {
    fn default() -> Self {
        Self {
            name: "tap".to_string(),
            batch_limit: 10,
            collect: CollectConfig::default(),
            receipt_timeout: Duration::from_secs(60),
            receipt_poll_interval: RECEIPT_POLL_INTERVAL,
        }
    }
}

/// The Taproot-Assets bridge.
#[derive(Debug, Clone)]
pub struct TapBridge {
    config: TapBridgeConfig,
    network: Arc<dyn Network>,
    db: Arc<dyn Database>,
    tap: Arc<dyn TapClient>,
    contract: Arc<dyn TapBridgeContract>,
    signer: PrivateKeySigner,
}

impl TapBridge {
    /// Creates the bridge. `signer` is this federator's EVM key.
    pub fn new(
        config: TapBridgeConfig,
        network: Arc<dyn Network>,
        db: Arc<dyn Database>,
        tap: Arc<dyn TapClient>,
        contract: Arc<dyn TapBridgeContract>,
        signer: PrivateKeySigner,
    ) -> Self {
        Self {
            config,
            network,
            db,
            tap,
            contract,
            signer,
        }
    }

    /// This federator's EVM address.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Asks the daemon for a new address crediting `evm_address` and stores it.
    pub async fn create_deposit_address(
        &self,
        evm_address: Address,
        asset_id: &str,
        amount: u64,
    ) -> BridgeResult<TapDepositAddress> {
        let address = self.tap.create_address(asset_id, amount).await?;
        let record = TapDepositAddress {
            evm_address,
            tap_address: address.encoded,
        };
        self.db.add_tap_deposit_address(record.clone()).await?;
        info!(%evm_address, tap_address = %record.tap_address, "created tap deposit address");
        Ok(record)
    }

    /// Records completed receives on every deposit address as transfers. Returns how many were
    /// new.
    pub async fn scan_tap_deposits(&self) -> BridgeResult<usize> {
        let known = self.db.known_deposit_outpoints().await?;
        let mut added = 0;
        for address in self.db.tap_deposit_addresses().await? {
            let receives = self
                .tap
                .list_receives(&address.tap_address, ADDR_EVENT_STATUS_COMPLETED)
                .await?;
            for receive in receives {
                if receive.addr.encoded != address.tap_address {
                    return Err(BridgeError::invalid(format!(
                        "receive for {} listed under {}",
                        receive.addr.encoded, address.tap_address
                    )));
                }
                let outpoint: OutPoint = receive.outpoint.parse().map_err(|e| {
                    BridgeError::invalid(format!("outpoint {}: {e}", receive.outpoint))
                })?;
                if known.contains(&outpoint) {
                    continue;
                }
                if self
                    .db
                    .insert_batch_transfer(address.evm_address, &address.tap_address, outpoint)
                    .await?
                {
                    info!(%outpoint, evm_address = %address.evm_address, "new tap deposit");
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    /// The oldest unfinished batch, or a new one over the oldest unbatched transfers.
    pub async fn get_or_create_current_batch(&self) -> BridgeResult<Option<TransferBatch>> {
        if let Some(batch) = self.db.current_batch().await? {
            return Ok(Some(batch));
        }
        let transfers = self.db.unbatched_transfers(self.config.batch_limit).await?;
        if transfers.is_empty() {
            return Ok(None);
        }

        let tap_transfers = transfers.iter().map(tap_transfer).collect::<Vec<_>>();
        let hash = batch_hash(&tap_transfers.iter().map(transfer_hash).collect::<Vec<_>>());
        let counters = transfers.iter().map(|t| t.counter).collect::<Vec<_>>();
        let mut batch = self.db.create_batch(hash, &counters).await?;

        let signatures = BatchSignatures::from([(
            self.address(),
            self.sign_transfers(&tap_transfers).await?,
        )]);
        self.db
            .set_batch_signatures(batch.id, signatures.clone())
            .await?;
        batch.signatures = signatures;
        info!(%hash, transfers = counters.len(), "created transfer batch");
        Ok(Some(batch))
    }

    async fn message_hashes(&self, transfers: &[TapTransfer]) -> BridgeResult<Vec<B256>> {
        let mut hashes = Vec::with_capacity(transfers.len());
        for transfer in transfers {
            hashes.push(self.contract.transfer_message_hash(transfer).await?);
        }
        Ok(hashes)
    }

    async fn sign_transfers(&self, transfers: &[TapTransfer]) -> BridgeResult<Vec<String>> {
        self.message_hashes(transfers)
            .await?
            .iter()
            .map(|hash| sign_message_hash(&self.signer, hash).map_err(BridgeError::from))
            .collect()
    }

    /// Pushes `batch` forward as far as it goes this iteration. Returns where it stopped.
    pub async fn process_batch(&self, mut batch: TransferBatch) -> BridgeResult<BatchStatus> {
        loop {
            let next = match batch.status {
                BatchStatus::Created => self.collect_batch_signatures(&batch).await?,
                BatchStatus::SignaturesCollected => self.submit_batch(&batch).await?,
                BatchStatus::Sending => return Err(BridgeError::StuckBatch(batch.hash)),
                BatchStatus::Sent => self.finalize_batch(&batch).await?,
                BatchStatus::Finalized => return Ok(BatchStatus::Finalized),
            };
            if next == batch.status {
                return Ok(next);
            }
            batch = self
                .db
                .get_batch_by_hash(batch.hash)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("batch {}", batch.hash)))?;
        }
    }

    async fn collect_batch_signatures(&self, batch: &TransferBatch) -> BridgeResult<BatchStatus> {
        let me = self.address();
        let transfers = batch.transfers.iter().map(tap_transfer).collect::<Vec<_>>();
        let hashes = self.message_hashes(&transfers).await?;
        let required = self.contract.num_required_signers().await?;
        let federators = self.contract.federators().await?;

        let mut signatures = batch.signatures.clone();
        if !signatures.contains_key(&me) {
            signatures.insert(me, self.sign_transfers(&transfers).await?);
        }
        let question = Question::new(
            Topic::SignTapBatch,
            &BatchMessage::from_batch(&TransferBatch {
                signatures: signatures.clone(),
                ..batch.clone()
            }),
        )?;

        let this = self;
        let federators = &federators;
        let hashes = &hashes;
        let collected = collect_signatures(
            self.network.as_ref(),
            &question,
            signatures.into_iter().collect(),
            required,
            &self.config.collect,
            move |answer| async move { this.check_batch_answer(answer, federators, hashes).await },
        )
        .await;

        let merged = collected.into_iter().collect::<BatchSignatures>();
        let peers = merged.keys().filter(|signer| **signer != me).count();
        self.db.set_batch_signatures(batch.id, merged).await?;

        if peers + 1 >= required {
            self.db
                .set_batch_status(batch.id, BatchStatus::SignaturesCollected, None)
                .await?;
            info!(hash = %batch.hash, peers, "batch signatures collected");
            Ok(BatchStatus::SignaturesCollected)
        } else {
            warn!(hash = %batch.hash, peers, required, "not enough batch signatures yet");
            Ok(BatchStatus::Created)
        }
    }

    async fn check_batch_answer(
        &self,
        answer: Answer,
        federators: &[Address],
        hashes: &[B256],
    ) -> BridgeResult<Vec<String>> {
        let response: BatchSignaturesResponse = answer.decode()?;
        if response.signer != answer.sender {
            return Err(BridgeError::invalid(format!(
                "{} answered for {}",
                answer.sender, response.signer
            )));
        }
        if !federators.contains(&response.signer) {
            return Err(BridgeError::invalid(format!(
                "{} is not a federator",
                response.signer
            )));
        }
        if response.signatures.len() != hashes.len() {
            return Err(BridgeError::invalid(format!(
                "{} signatures for {} transfers",
                response.signatures.len(),
                hashes.len()
            )));
        }
        for (signature, hash) in response.signatures.iter().zip(hashes) {
            let recovered = recover_message_signer(hash, signature)?;
            if recovered != response.signer {
                return Err(BridgeError::invalid(format!(
                    "signature over {hash} recovers to {recovered}"
                )));
            }
        }
        Ok(response.signatures)
    }

    async fn submit_batch(&self, batch: &TransferBatch) -> BridgeResult<BatchStatus> {
        let required = self.contract.num_required_signers().await?;
        self.db
            .set_batch_status(batch.id, BatchStatus::Sending, None)
            .await?;

        let signers = batch.signatures.values().take(required).collect::<Vec<_>>();
        let mut last = None;
        for (i, transfer) in batch.transfers.iter().enumerate() {
            let signatures = signers
                .iter()
                .map(|sigs| -> BridgeResult<Bytes> {
                    let sig = sigs.get(i).ok_or_else(|| {
                        BridgeError::invalid(format!("missing signature for transfer {i}"))
                    })?;
                    Ok(decode_signature(sig)?)
                })
                .collect::<BridgeResult<Vec<_>>>()?;
            let tx_hash = self
                .contract
                .accept_transfer_from_tap(&tap_transfer(transfer), signatures)
                .await?;
            debug!(%tx_hash, outpoint = %transfer.deposit_outpoint, "submitted transfer");
            last = Some(tx_hash);
        }

        let last = last.ok_or_else(|| BridgeError::invalid("batch has no transfers"))?;
        self.db
            .set_batch_status(batch.id, BatchStatus::Sent, Some(last))
            .await?;
        info!(hash = %batch.hash, tx_hash = %last, "batch sent");
        Ok(BatchStatus::Sent)
    }

    async fn finalize_batch(&self, batch: &TransferBatch) -> BridgeResult<BatchStatus> {
        let tx_hash = batch
            .executed_tx_hash
            .ok_or_else(|| BridgeError::invalid(format!("sent batch {} has no tx", batch.hash)))?;
        match wait_for_receipt(
            self.contract.as_ref(),
            tx_hash,
            self.config.receipt_timeout,
            self.config.receipt_poll_interval,
        )
        .await
        {
            Ok(true) => {
                self.db
                    .set_batch_status(batch.id, BatchStatus::Finalized, None)
                    .await?;
                info!(hash = %batch.hash, %tx_hash, "batch finalized");
                Ok(BatchStatus::Finalized)
            }
            Ok(false) => Err(BridgeError::BatchTransactionFailed {
                hash: batch.hash,
                tx_hash,
            }),
            Err(EvmError::ReceiptTimeout(_)) => {
                debug!(hash = %batch.hash, %tx_hash, "batch transaction not mined yet");
                Ok(BatchStatus::Sent)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Signs a batch for the leader, or returns the signatures given before.
    pub async fn answer_sign_batch(
        &self,
        message: BatchMessage,
    ) -> BridgeResult<BatchSignaturesResponse> {
        if self.network.is_leader() {
            return Err(BridgeError::invalid("the leader does not sign on request"));
        }
        if message.status != BatchStatus::Created {
            return Err(BridgeError::invalid(format!(
                "batch {} is {:?}",
                message.hash, message.status
            )));
        }

        let me = self.address();
        let respond = |signatures: Vec<String>| BatchSignaturesResponse {
            signer: me,
            signatures,
        };
        if let Some(signatures) = message.signatures.get(&me) {
            return Ok(respond(signatures.clone()));
        }
        let stored = self.db.get_batch_by_hash(message.hash).await?;
        if let Some(signatures) = stored.as_ref().and_then(|b| b.signatures.get(&me)) {
            return Ok(respond(signatures.clone()));
        }

        if message.transfers.is_empty() {
            return Err(BridgeError::invalid("empty batch"));
        }
        let transfers = message
            .transfers
            .iter()
            .map(|t| t.to_tap_transfer())
            .collect::<Vec<_>>();
        let mut transfer_hashes = Vec::with_capacity(transfers.len());
        for (transfer, claimed) in transfers.iter().zip(&message.transfers) {
            let hash = transfer_hash(transfer);
            if hash != claimed.hash {
                return Err(BridgeError::invalid(format!(
                    "transfer hash {} does not match its content",
                    claimed.hash
                )));
            }
            transfer_hashes.push(hash);
        }
        if batch_hash(&transfer_hashes) != message.hash {
            return Err(BridgeError::invalid(format!(
                "batch hash {} does not match its transfers",
                message.hash
            )));
        }
        for transfer in &transfers {
            if self
                .contract
                .is_processed(transfer.btc_txid, transfer.btc_vout)
                .await?
            {
                return Err(BridgeError::invalid(format!(
                    "deposit {}:{} already processed",
                    transfer.btc_txid, transfer.btc_vout
                )));
            }
        }

        for claimed in &message.transfers {
            self.check_completed_receive(claimed).await?;
        }

        let claims = message
            .transfers
            .iter()
            .map(|t| {
                SignedClaim::new(
                    deposit_claim(&t.deposit_btc_tx_id, t.deposit_btc_tx_vout),
                    format!("{}/{}", message.hash, t.deposit_address.evm_address),
                )
            })
            .collect::<Vec<_>>();
        record_claims(self.db.as_ref(), &self.config.name, &claims).await?;

        let signatures = self.sign_transfers(&transfers).await?;
        match stored {
            Some(batch) => {
                let mut merged = batch.signatures;
                merged.insert(me, signatures.clone());
                self.db.set_batch_signatures(batch.id, merged).await?;
            }
            None => {
                let signed = BatchSignatures::from([(me, signatures.clone())]);
                self.db.insert_signed_batch(message.hash, signed).await?;
            }
        }
        info!(hash = %message.hash, transfers = transfers.len(), "signed batch");
        Ok(respond(signatures))
    }

    /// Fails unless the daemon lists a completed receive at the transfer's outpoint on its
    /// address.
    async fn check_completed_receive(&self, transfer: &BatchTransferMessage) -> BridgeResult<()> {
        let tap_address = &transfer.deposit_address.tap_address;
        let outpoint = OutPoint::new(transfer.deposit_btc_tx_id, transfer.deposit_btc_tx_vout);
        let receives = self
            .tap
            .list_receives(tap_address, ADDR_EVENT_STATUS_COMPLETED)
            .await?;
        let found = receives.iter().any(|receive| {
            receive.addr.encoded == *tap_address
                && receive.outpoint.parse::<OutPoint>().ok() == Some(outpoint)
        });
        if !found {
            return Err(BridgeError::invalid(format!(
                "no completed receive at {outpoint} for {tap_address}"
            )));
        }
        Ok(())
    }
}

/// The resource a deposit credit claims.
fn deposit_claim(txid: &bitcoin::Txid, vout: u32) -> String {
    format!("tap-deposit:{txid}:{vout}")
}

#[derive(Debug)]
struct BatchSigner(TapBridge);

#[async_trait]
impl QuestionHandler for BatchSigner {
    async fn answer(&self, sender: Address, body: Value) -> Result<Option<Value>, AnswerError> {
        let message: BatchMessage = serde_json::from_value(body).map_err(AnswerError::new)?;
        debug!(%sender, hash = %message.hash, "batch signature requested");
        let response = self.0.answer_sign_batch(message).await?;
        Ok(Some(serde_json::to_value(response).map_err(AnswerError::new)?))
    }
}

#[async_trait]
impl Bridge for TapBridge {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn init(&self) -> BridgeResult<()> {
        if self.network.is_leader() {
            return Ok(());
        }
        self.network
            .answer_with(Topic::SignTapBatch, Arc::new(BatchSigner(self.clone())))?;
        Ok(())
    }

    async fn run_iteration(&self) -> BridgeResult<()> {
        let added = self.scan_tap_deposits().await?;
        if added > 0 {
            debug!(added, "scanned tap deposits");
        }
        if !self.network.is_leader() {
            return Ok(());
        }
        let Some(batch) = self.get_or_create_current_batch().await? else {
            return Ok(());
        };
        let status = self.process_batch(batch).await?;
        debug!(?status, "processed current batch");
        Ok(())
    }
}
