//! EVM to Taproot-Assets: `TransferToTap` burns are paid out by the federation's daemon in
//! batches.
//!
//! Every node records the burns it sees on the EVM. The leader batches the oldest of them by
//! counter and pays a batch in one send once enough federators approved it, each having checked
//! the batch against the burns it recorded itself. A batch moves
//! `Created -> SendingToTap -> SentToTap -> Finalized`. One found in `SendingToTap` may or may not
//! have been paid, so it is reported as [`BridgeError::StuckBatch`] and never sent again.

use std::sync::Arc;

use alloy::{
    primitives::{Address, B256},
    signers::local::PrivateKeySigner,
};
use async_trait::async_trait;
use federator_db::{
    types::{EvmToTapBatch, EvmToTapBatchStatus, NewEvmToTapTransfer, SignedClaim},
    Database, EvmToTapDb,
};
use federator_evm::{
    signer::{recover_message_signer, sign_message_hash},
    EventScanner, TapBridgeContract, TransfersToTap,
};
use federator_p2p::{Answer, AnswerError, Network, Question, QuestionHandler, Topic};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{
    client::TapClient,
    hashes::evm_to_tap_batch_hash,
    messages::{EvmToTapApproval, EvmToTapBatchMessage},
};
use crate::{
    bridge::Bridge,
    claims::record_claims,
    errors::{BridgeError, BridgeResult},
    signatures::{collect_signatures, CollectConfig},
};

/// Settings of an [`EvmToTapBridge`].
#[derive(Debug, Clone)]
pub struct EvmToTapConfig {
    /// Name in logs, checkpoint keys and signed claims.
    pub name: String,
    /// Most transfers in one batch.
    pub batch_limit: usize,
    /// Approval collection.
    pub collect: CollectConfig,
    /// Blocks the EVM scanner stays behind the tip.
    pub evm_block_safety_margin: u64,
    /// First EVM block scanned when there is no checkpoint.
    pub evm_default_start_block: u64,
}

impl Default for EvmToTapConfig {
    fn default() -> Self {
        Self {
            name: "evm-to-tap".to_string(),
            batch_limit: 10,
            collect: CollectConfig::default(),
            evm_block_safety_margin: 0,
            evm_default_start_block: 1,
        }
    }
}

/// Pays out `TransferToTap` burns on Taproot-Assets.
#[derive(Debug, Clone)]
pub struct EvmToTapBridge {
    config: EvmToTapConfig,
    network: Arc<dyn Network>,
    db: Arc<dyn Database>,
    tap: Arc<dyn TapClient>,
    contract: Arc<dyn TapBridgeContract>,
    signer: PrivateKeySigner,
    scanner: EventScanner,
}

impl EvmToTapBridge {
    /// Creates the bridge. `signer` is this federator's EVM key.
    pub fn new(
        config: EvmToTapConfig,
        network: Arc<dyn Network>,
        db: Arc<dyn Database>,
        tap: Arc<dyn TapClient>,
        contract: Arc<dyn TapBridgeContract>,
        signer: PrivateKeySigner,
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
            tap,
            contract,
            signer,
            scanner,
        }
    }

    /// This federator's EVM address.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Records `TransferToTap` events since the checkpoint. Returns how many were new.
    pub async fn scan_transfers_to_tap(&self) -> BridgeResult<usize> {
        let Some(batch) = self
            .scanner
            .next_batch(self.db.as_ref(), &TransfersToTap(self.contract.as_ref()))
            .await?
        else {
            return Ok(0);
        };

        let mut new = 0;
        for event in batch.events {
            let transfer = NewEvmToTapTransfer {
                counter: event.counter,
                sender_evm_address: event.from,
                recipient_tap_address: event.tap_address,
                evm_tx_hash: event.evm_tx_hash,
                block_number: event.block_number,
                log_index: event.log_index,
            };
            if self.db.insert_evm_to_tap_transfer(transfer).await? {
                info!(counter = event.counter, tx_hash = %event.evm_tx_hash, "new transfer to tap");
                new += 1;
            }
        }
        self.scanner
            .mark_scanned(self.db.as_ref(), batch.to_block)
            .await?;
        Ok(new)
    }

    /// The oldest unfinished batch, or a new one over the oldest unbatched transfers.
    pub async fn get_or_create_current_batch(&self) -> BridgeResult<Option<EvmToTapBatch>> {
        if let Some(batch) = self.db.current_evm_to_tap_batch().await? {
            return Ok(Some(batch));
        }
        let transfers = self
            .db
            .unbatched_evm_to_tap_transfers(self.config.batch_limit)
            .await?;
        if transfers.is_empty() {
            return Ok(None);
        }

        let hash = evm_to_tap_batch_hash(&transfers);
        let counters = transfers.iter().map(|t| t.counter).collect::<Vec<_>>();
        let batch = self.db.create_evm_to_tap_batch(hash, &counters).await?;
        info!(%hash, transfers = counters.len(), "created evm to tap batch");
        Ok(Some(batch))
    }

    /// Pushes `batch` forward as far as it goes this iteration. Returns where it stopped.
    pub async fn process_batch(
        &self,
        mut batch: EvmToTapBatch,
    ) -> BridgeResult<EvmToTapBatchStatus> {
        loop {
            let next = match batch.status {
                EvmToTapBatchStatus::Created => self.send_approved_batch(&batch).await?,
                EvmToTapBatchStatus::SendingToTap => {
                    return Err(BridgeError::StuckBatch(batch.hash))
                }
                EvmToTapBatchStatus::SentToTap => {
                    self.db
                        .set_evm_to_tap_batch_status(
                            batch.id,
                            EvmToTapBatchStatus::Finalized,
                            None,
                        )
                        .await?;
                    info!(hash = %batch.hash, "evm to tap batch finalized");
                    EvmToTapBatchStatus::Finalized
                }
                EvmToTapBatchStatus::Finalized => return Ok(EvmToTapBatchStatus::Finalized),
            };
            if next == batch.status {
                return Ok(next);
            }
            batch.status = next;
        }
    }

    async fn send_approved_batch(&self, batch: &EvmToTapBatch) -> BridgeResult<EvmToTapBatchStatus> {
        let required = self.contract.num_required_signers().await?;
        let approvals = self.collect_approvals(batch, required).await?;
        if approvals < required {
            warn!(hash = %batch.hash, approvals, required, "not enough approvals yet");
            return Ok(EvmToTapBatchStatus::Created);
        }

        self.db
            .set_evm_to_tap_batch_status(batch.id, EvmToTapBatchStatus::SendingToTap, None)
            .await?;
        let recipients = batch
            .transfers
            .iter()
            .map(|t| t.recipient_tap_address.clone())
            .collect::<Vec<_>>();
        info!(hash = %batch.hash, recipients = recipients.len(), "sending batch to tap");
        let result = self.tap.send_assets(&recipients).await?;

        self.db
            .set_evm_to_tap_batch_status(
                batch.id,
                EvmToTapBatchStatus::SentToTap,
                Some(result.to_string()),
            )
            .await?;
        info!(hash = %batch.hash, "batch sent to tap");
        Ok(EvmToTapBatchStatus::SentToTap)
    }

    /// Our approval plus the peers' until `required`. Returns how many approve.
    async fn collect_approvals(&self, batch: &EvmToTapBatch, required: usize) -> BridgeResult<usize> {
        let me = self.address();
        let own = sign_message_hash(&self.signer, &batch.hash)?;
        let federators = self.contract.federators().await?;
        let question = Question::new(
            Topic::ApproveEvmToTapBatch,
            &EvmToTapBatchMessage::from_batch(batch),
        )?;

        let federators = &federators;
        let hash = batch.hash;
        let approvals = collect_signatures(
            self.network.as_ref(),
            &question,
            vec![(me, own)],
            required,
            &self.config.collect,
            move |answer| async move { check_approval(answer, federators, &hash) },
        )
        .await;
        Ok(approvals.len())
    }

    /// Approves a batch for the leader once every transfer in it matches a burn we recorded.
    pub async fn answer_approve_batch(
        &self,
        message: EvmToTapBatchMessage,
    ) -> BridgeResult<EvmToTapApproval> {
        if self.network.is_leader() {
            return Err(BridgeError::invalid("the leader does not approve on request"));
        }
        if message.transfers.is_empty() {
            return Err(BridgeError::invalid("empty batch"));
        }

        let mut stored = Vec::with_capacity(message.transfers.len());
        for claimed in &message.transfers {
            let transfer = self
                .db
                .get_evm_to_tap_transfer(claimed.counter)
                .await?
                .ok_or_else(|| {
                    BridgeError::invalid(format!("unknown transfer {}", claimed.counter))
                })?;
            if !claimed.matches(&transfer) {
                return Err(BridgeError::invalid(format!(
                    "transfer {} does not match the recorded burn",
                    claimed.counter
                )));
            }
            stored.push(transfer);
        }
        if evm_to_tap_batch_hash(&stored) != message.hash {
            return Err(BridgeError::invalid(format!(
                "batch hash {} does not match its transfers",
                message.hash
            )));
        }

        let claims = stored
            .iter()
            .map(|t| SignedClaim::new(format!("evm-to-tap:{}", t.counter), message.hash))
            .collect::<Vec<_>>();
        record_claims(self.db.as_ref(), &self.config.name, &claims).await?;

        let signature = sign_message_hash(&self.signer, &message.hash)?;
        info!(hash = %message.hash, transfers = stored.len(), "approved evm to tap batch");
        Ok(EvmToTapApproval {
            signer: self.address(),
            signature,
        })
    }
}

fn check_approval(answer: Answer, federators: &[Address], hash: &B256) -> BridgeResult<String> {
    let approval: EvmToTapApproval = answer.decode()?;
    if approval.signer != answer.sender {
        return Err(BridgeError::invalid(format!(
            "{} answered for {}",
            answer.sender, approval.signer
        )));
    }
    if !federators.contains(&approval.signer) {
        return Err(BridgeError::invalid(format!(
            "{} is not a federator",
            approval.signer
        )));
    }
    let recovered = recover_message_signer(hash, &approval.signature)?;
    if recovered != approval.signer {
        return Err(BridgeError::invalid(format!(
            "approval of {hash} recovers to {recovered}"
        )));
    }
    Ok(approval.signature)
}

#[derive(Debug)]
struct BatchApprover(EvmToTapBridge);

#[async_trait]
impl QuestionHandler for BatchApprover {
    async fn answer(&self, sender: Address, body: Value) -> Result<Option<Value>, AnswerError> {
        let message: EvmToTapBatchMessage =
            serde_json::from_value(body).map_err(AnswerError::new)?;
        debug!(%sender, hash = %message.hash, "evm to tap approval requested");
        let approval = self.0.answer_approve_batch(message).await?;
        Ok(Some(serde_json::to_value(approval).map_err(AnswerError::new)?))
    }
}

#[async_trait]
impl Bridge for EvmToTapBridge {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn init(&self) -> BridgeResult<()> {
        if self.network.is_leader() {
            return Ok(());
        }
        self.network.answer_with(
            Topic::ApproveEvmToTapBatch,
            Arc::new(BatchApprover(self.clone())),
        )?;
        Ok(())
    }

    async fn run_iteration(&self) -> BridgeResult<()> {
        let added = self.scan_transfers_to_tap().await?;
        if added > 0 {
            debug!(added, "scanned transfers to tap");
        }
        if !self.network.is_leader() {
            return Ok(());
        }
        let Some(batch) = self.get_or_create_current_batch().await? else {
            return Ok(());
        };
        let status = self.process_batch(batch).await?;
        debug!(?status, "processed current evm to tap batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use federator_db::{InMemoryDb, SignedClaimsDb};
    use federator_evm::{test_utils::MockTapBridge, TransferToTap};
    use federator_p2p::InMemoryHub;

    use super::{super::test_utils::MockTap, *};

    struct Federation {
        nodes: Vec<EvmToTapBridge>,
        dbs: Vec<InMemoryDb>,
        tap: Arc<MockTap>,
        contract: MockTapBridge,
    }

    fn config() -> EvmToTapConfig {
        EvmToTapConfig {
            batch_limit: 2,
            collect: CollectConfig {
                max_attempts: 1,
                backoff_unit: std::time::Duration::ZERO,
            },
            ..Default::default()
        }
    }

    async fn federation(keys: usize, online: usize, required: usize) -> Federation {
        let signers = (0..keys)
            .map(|_| PrivateKeySigner::random())
            .collect::<Vec<_>>();
        let contract = MockTapBridge::new(signers.iter().map(|s| s.address()).collect(), required);
        let tap = Arc::new(MockTap::default());
        let hub = InMemoryHub::new("node-0");

        let mut nodes = Vec::new();
        let mut dbs = Vec::new();
        for (i, signer) in signers.into_iter().take(online).enumerate() {
            let db = InMemoryDb::default();
            let node = EvmToTapBridge::new(
                config(),
                Arc::new(hub.join(format!("node-{i}"), signer.address())),
                Arc::new(db.clone()),
                tap.clone(),
                Arc::new(contract.clone()),
                signer,
            );
            node.init().await.unwrap();
            nodes.push(node);
            dbs.push(db);
        }
        Federation {
            nodes,
            dbs,
            tap,
            contract,
        }
    }

    fn recipient(counter: u64) -> String {
        format!("taprt1recipient{counter}")
    }

    /// Burns `counters`, one per block, and lets every node scan them.
    async fn burn(fed: &Federation, counters: &[u64]) {
        for &counter in counters {
            fed.contract.push_transfer_to_tap(TransferToTap {
                counter,
                from: Address::repeat_byte(0x11),
                tap_address: recipient(counter),
                evm_tx_hash: B256::repeat_byte(counter as u8),
                block_number: counter,
                log_index: 0,
            });
        }
        fed.contract
            .set_block_number(counters.iter().copied().max().unwrap_or(0));
        for node in &fed.nodes {
            node.scan_transfers_to_tap().await.unwrap();
        }
    }

    async fn created_batch(fed: &Federation) -> EvmToTapBatchMessage {
        let batch = fed.nodes[0]
            .get_or_create_current_batch()
            .await
            .unwrap()
            .unwrap();
        EvmToTapBatchMessage::from_batch(&batch)
    }

    #[tokio::test]
    async fn approved_batches_are_sent_oldest_first() {
        let fed = federation(3, 3, 2).await;
        burn(&fed, &[1, 2, 3]).await;

        fed.nodes[0].run_iteration().await.unwrap();
        assert_eq!(fed.tap.sends(), vec![vec![recipient(1), recipient(2)]]);
        assert!(fed.dbs[0].current_evm_to_tap_batch().await.unwrap().is_none());

        fed.nodes[0].run_iteration().await.unwrap();
        assert_eq!(fed.tap.sends().len(), 2);
        assert_eq!(fed.tap.sends()[1], vec![recipient(3)]);

        fed.nodes[0].run_iteration().await.unwrap();
        assert_eq!(fed.tap.sends().len(), 2, "nothing left to send");
    }

    #[tokio::test]
    async fn batch_waits_in_created_below_threshold() {
        let fed = federation(3, 1, 2).await;
        burn(&fed, &[1]).await;

        fed.nodes[0].run_iteration().await.unwrap();

        let batch = fed.dbs[0].current_evm_to_tap_batch().await.unwrap().unwrap();
        assert_eq!(batch.status, EvmToTapBatchStatus::Created);
        assert!(fed.tap.sends().is_empty());
    }

    #[tokio::test]
    async fn failed_send_is_never_retried() {
        let fed = federation(3, 3, 2).await;
        burn(&fed, &[1]).await;
        fed.tap.fail_sends(Some("wallet locked"));

        let err = fed.nodes[0].run_iteration().await.unwrap_err();
        assert!(matches!(err, BridgeError::Tap(_)));
        let batch = fed.dbs[0].current_evm_to_tap_batch().await.unwrap().unwrap();
        assert_eq!(batch.status, EvmToTapBatchStatus::SendingToTap);

        fed.tap.fail_sends(None);
        for _ in 0..2 {
            let err = fed.nodes[0].run_iteration().await.unwrap_err();
            assert!(matches!(err, BridgeError::StuckBatch(hash) if hash == batch.hash));
        }
        assert!(fed.tap.sends().is_empty());
    }

    #[tokio::test]
    async fn follower_approves_only_burns_it_recorded() {
        let fed = federation(3, 3, 2).await;
        burn(&fed, &[1]).await;
        let message = created_batch(&fed).await;

        let approval = fed.nodes[1]
            .answer_approve_batch(message.clone())
            .await
            .unwrap();
        assert_eq!(approval.signer, fed.nodes[1].address());
        assert_eq!(
            recover_message_signer(&message.hash, &approval.signature).unwrap(),
            approval.signer
        );

        let late = InMemoryDb::default();
        let unscanned = EvmToTapBridge::new(
            config(),
            Arc::new(InMemoryHub::new("node-0").join("node-9", Address::repeat_byte(9))),
            Arc::new(late),
            fed.tap.clone(),
            Arc::new(fed.contract.clone()),
            PrivateKeySigner::random(),
        );
        let err = unscanned
            .answer_approve_batch(message.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Invalid(_)));

        let mut redirected = message.clone();
        redirected.transfers[0].recipient_tap_address = "taprt1thief".to_string();
        let err = fed.nodes[2]
            .answer_approve_batch(redirected)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Invalid(_)));

        let err = fed.nodes[0]
            .answer_approve_batch(message)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Invalid(_)));
    }

    #[tokio::test]
    async fn follower_never_approves_a_transfer_in_two_batches() {
        let fed = federation(3, 3, 2).await;
        burn(&fed, &[1, 2]).await;
        let message = created_batch(&fed).await;
        assert_eq!(message.transfers.len(), 2);

        let first = fed.nodes[1]
            .answer_approve_batch(message.clone())
            .await
            .unwrap();
        let again = fed.nodes[1]
            .answer_approve_batch(message.clone())
            .await
            .unwrap();
        assert_eq!(again, first);

        let stored = fed.dbs[1].get_evm_to_tap_transfer(2).await.unwrap().unwrap();
        let regrouped = EvmToTapBatchMessage {
            hash: evm_to_tap_batch_hash(std::slice::from_ref(&stored)),
            transfers: message.transfers[1..].to_vec(),
        };
        let err = fed.nodes[1]
            .answer_approve_batch(regrouped)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConflictingClaim(_)));
        assert_eq!(
            fed.dbs[1]
                .signed_claim("evm-to-tap", "evm-to-tap:2")
                .await
                .unwrap(),
            Some(message.hash.to_string())
        );
    }
}
