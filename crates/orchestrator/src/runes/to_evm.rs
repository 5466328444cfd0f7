//! Rune deposits: scanning the node wallet, minting on the EVM, and co-signing mints.

use std::{collections::HashMap, str::FromStr};

use alloy::primitives::{Address, B256};
use bitcoin::{BlockHash, OutPoint};
use federator_common::retry::linear_delay;
use federator_db::{
    types::{
        IncomingBtcTx, IncomingBtcTxStatus, NewRuneDeposit, RuneDeposit, RuneDepositStatus,
    },
    RuneBridgeDb,
};
use federator_evm::{
    scanner::wait_for_receipt,
    signer::{decode_signature, recover_message_signer, sign_message_hash, txid_to_bytes32},
    AcceptTransferFromBtc, EvmError,
};
use federator_multisig::runes::{ord::OrdOutput, types::Rune};
use federator_p2p::{Answer, Question, Topic};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::{
    messages::{SignRuneToEvmTransferAnswer, SignRuneToEvmTransferQuestion},
    RuneBridge,
};
use crate::{
    errors::{BridgeError, BridgeResult},
    signatures::collect_signatures,
};

impl RuneBridge {
    fn deposits_checkpoint_key(&self) -> String {
        format!("{}:btc:deposits:last_scanned_block", self.config.name)
    }

    async fn wait_for_ord_sync(&self) -> BridgeResult<()> {
        let height = self.wallet.multisig().rpc().get_block_count().await?;
        let deadline = Instant::now() + self.config.ord_sync_timeout;
        loop {
            let indexed = self.wallet.ord().block_count().await?;
            if indexed >= height {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BridgeError::OrdNotSynced(height));
            }
            debug!(indexed, height, "waiting for ord to catch up");
            sleep(self.config.ord_sync_poll_interval).await;
        }
    }

    async fn indexed_output(&self, outpoint: &OutPoint) -> BridgeResult<OrdOutput> {
        for attempt in 0..self.config.ord_output_poll_attempts {
            if attempt > 0 {
                sleep(linear_delay(self.config.ord_output_poll_unit, attempt - 1)).await;
            }
            let output = self.wallet.ord().output(outpoint).await?;
            if output.indexed {
                return Ok(output);
            }
            debug!(%outpoint, attempt, "deposit output not indexed yet");
        }
        Err(BridgeError::OrdOutputNotIndexed(*outpoint))
    }

    /// Records wallet receives on our deposit addresses since the checkpoint, and the rune
    /// deposits of those with enough confirmations. Returns how many outputs were new.
    pub async fn scan_rune_deposits(&self) -> BridgeResult<usize> {
        let name = &self.config.name;
        let key = self.deposits_checkpoint_key();
        let checkpoint = self.db.get_value(&key).await?;
        let since = checkpoint
            .as_deref()
            .map(BlockHash::from_str)
            .transpose()
            .map_err(|e| BridgeError::invalid(format!("checkpoint {key}: {e}")))?;

        self.wait_for_ord_sync().await?;

        let addresses = self
            .db
            .deposit_addresses(name)
            .await?
            .into_iter()
            .map(|r| (r.btc_address, r.evm_address))
            .collect::<HashMap<_, _>>();
        let listing = self
            .wallet
            .multisig()
            .rpc()
            .list_since_block(since.as_ref(), self.config.listsinceblock_target())
            .await?;

        let min_confirmations = i64::from(self.config.btc_min_confirmations);
        let mut new = 0;
        for tx in listing.transactions {
            if tx.category != "receive" {
                continue;
            }
            let Some(address) = tx.address else {
                continue;
            };
            let Some(evm_address) = addresses.get(&address).copied() else {
                continue;
            };
            if tx.confirmations < 0 {
                debug!(txid = %tx.txid, "skipping conflicted transaction");
                continue;
            }

            let confirmed = tx.confirmations >= min_confirmations;
            let incoming = IncomingBtcTx {
                txid: tx.txid,
                vout: tx.vout,
                address,
                amount: tx.amount.unsigned_abs(),
                block_number: tx.blockheight,
                time: tx.time,
                status: if confirmed {
                    IncomingBtcTxStatus::Accepted
                } else {
                    IncomingBtcTxStatus::Detected
                },
            };
            if self.db.upsert_incoming_btc_tx(name, incoming.clone()).await? {
                info!(txid = %incoming.txid, vout = incoming.vout, amount = %incoming.amount, "new deposit output");
                new += 1;
            }
            if confirmed {
                self.record_rune_deposits(&incoming, evm_address).await?;
            }
        }

        let last_block = listing.lastblock.to_string();
        if !self
            .db
            .compare_and_set(&key, checkpoint.as_deref(), &last_block)
            .await?
        {
            return Err(BridgeError::CheckpointChanged(key));
        }
        Ok(new)
    }

    async fn record_rune_deposits(
        &self,
        incoming: &IncomingBtcTx,
        evm_address: Address,
    ) -> BridgeResult<()> {
        let outpoint = incoming.outpoint();
        let output = self.indexed_output(&outpoint).await?;
        for (spaced, balance) in &output.runes {
            if balance.amount == 0 {
                continue;
            }
            let Some(entry) = self.wallet.ord().rune(spaced).await? else {
                warn!(%outpoint, rune = %spaced, "ord lists a rune it does not know");
                continue;
            };
            let (net_amount, _) = self.config.to_evm_fee_percentage.split(balance.amount)?;
            let deposit = self
                .db
                .upsert_rune_deposit(
                    &self.config.name,
                    NewRuneDeposit {
                        txid: incoming.txid,
                        vout: incoming.vout,
                        rune_number: entry.number,
                        rune_id: entry.id.to_string(),
                        spaced_rune: entry.spaced_rune,
                        evm_address,
                        block_number: incoming.block_number,
                        postage: incoming.amount,
                        transfer_amount: balance.amount,
                        net_amount,
                        status: RuneDepositStatus::Accepted,
                    },
                )
                .await?;
            debug!(id = deposit.id, %outpoint, rune = %deposit.spaced_rune, status = ?deposit.status, "rune deposit");
        }
        Ok(())
    }

    fn accept_transfer(deposit: &RuneDeposit) -> AcceptTransferFromBtc {
        AcceptTransferFromBtc {
            evm_address: deposit.evm_address,
            rune_number: deposit.rune_number,
            net_rune_amount: deposit.net_amount,
            btc_txid: txid_to_bytes32(&deposit.txid),
            btc_vout: deposit.vout,
        }
    }

    async fn rejection_reason(&self, deposit: &RuneDeposit) -> BridgeResult<Option<String>> {
        if deposit.postage < self.config.btc_min_postage {
            return Ok(Some(format!(
                "postage {} below {}",
                deposit.postage, self.config.btc_min_postage
            )));
        }
        if deposit.net_amount == 0 {
            return Ok(Some("nothing left after fees".to_string()));
        }
        if !self.contract.is_rune_registered(deposit.rune_number).await? {
            return Ok(Some(format!("rune {} is not registered", deposit.spaced_rune)));
        }
        Ok(None)
    }

    /// Mints accepted deposits that reach the threshold, then confirms submitted mints.
    pub async fn process_rune_deposits(&self) -> BridgeResult<()> {
        self.confirm_sent_rune_deposits().await?;
        if self.contract.frozen().await? {
            warn!("rune bridge contract is frozen, not minting");
            return Ok(());
        }
        let deposits = self
            .db
            .rune_deposits_by_status(&self.config.name, RuneDepositStatus::Accepted)
            .await?;
        if !deposits.is_empty() {
            let required = self.contract.num_required_federators().await?;
            for deposit in deposits {
                let pending = self.contract.pending_transaction_count().await?;
                if pending >= self.config.max_pending_evm_txs {
                    return Err(BridgeError::TooManyPending(pending));
                }
                self.send_rune_deposit(deposit, required).await?;
            }
        }
        Ok(())
    }

    async fn send_rune_deposit(&self, deposit: RuneDeposit, required: usize) -> BridgeResult<()> {
        let name = &self.config.name;
        if let Some(reason) = self.rejection_reason(&deposit).await? {
            warn!(id = deposit.id, %reason, "rejecting rune deposit");
            self.db
                .set_rune_deposit_status(name, deposit.id, RuneDepositStatus::Rejected, None)
                .await?;
            return Ok(());
        }

        let me = self.address();
        let transfer = Self::accept_transfer(&deposit);
        let message_hash = self.contract.accept_transfer_message_hash(&transfer).await?;
        let mut initial = vec![(me, sign_message_hash(&self.signer, &message_hash)?)];
        if deposit.message_hash == Some(message_hash) {
            initial.extend(
                deposit
                    .signatures
                    .iter()
                    .filter(|(signer, _)| **signer != me)
                    .map(|(signer, sig)| (*signer, sig.clone())),
            );
        }

        let question = Question::new(
            Topic::SignRuneDepositToEvm,
            &SignRuneToEvmTransferQuestion {
                evm_address: deposit.evm_address,
                btc_txid: deposit.txid,
                btc_vout: deposit.vout,
                rune_name: deposit.spaced_rune.clone(),
                rune_number: deposit.rune_number,
                amount_raw: deposit.transfer_amount,
                net_amount_raw: deposit.net_amount,
            },
        )?;
        let this = self;
        let signatures = collect_signatures(
            self.network.as_ref(),
            &question,
            initial,
            required,
            &self.config.collect,
            move |answer| async move { this.check_to_evm_answer(answer, message_hash).await },
        )
        .await;
        self.db
            .add_rune_deposit_signatures(name, deposit.id, message_hash, &signatures)
            .await?;
        if signatures.len() < required {
            warn!(
                id = deposit.id,
                collected = signatures.len(),
                required,
                "not enough signatures to mint yet"
            );
            return Ok(());
        }

        let decoded = signatures
            .iter()
            .map(|(_, sig)| decode_signature(sig))
            .collect::<Result<Vec<_>, _>>()?;
        self.db
            .set_rune_deposit_status(name, deposit.id, RuneDepositStatus::SendingToEvm, None)
            .await?;
        match self.contract.accept_transfer_from_btc(&transfer, decoded).await {
            Ok(tx_hash) => {
                self.db
                    .set_rune_deposit_status(
                        name,
                        deposit.id,
                        RuneDepositStatus::SentToEvm,
                        Some(tx_hash),
                    )
                    .await?;
                info!(id = deposit.id, %tx_hash, net = deposit.net_amount, "submitted rune mint");
            }
            Err(e) => {
                warn!(id = deposit.id, %e, "submitting rune mint failed");
                self.db
                    .set_rune_deposit_status(
                        name,
                        deposit.id,
                        RuneDepositStatus::SendingToEvmFailed,
                        None,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn check_to_evm_answer(
        &self,
        answer: Answer,
        message_hash: B256,
    ) -> BridgeResult<String> {
        let response: SignRuneToEvmTransferAnswer = answer.decode()?;
        if response.signer != answer.sender {
            return Err(BridgeError::invalid(format!(
                "{} answered for {}",
                answer.sender, response.signer
            )));
        }
        if response.message_hash != message_hash {
            return Err(BridgeError::invalid(format!(
                "signed {} instead of {message_hash}",
                response.message_hash
            )));
        }
        if !self.contract.is_federator(response.signer).await? {
            return Err(BridgeError::invalid(format!(
                "{} is not a federator",
                response.signer
            )));
        }
        let recovered = recover_message_signer(&message_hash, &response.signature)?;
        if recovered != response.signer {
            return Err(BridgeError::invalid(format!(
                "signature recovers to {recovered}, not {}",
                response.signer
            )));
        }
        Ok(response.signature)
    }

    async fn confirm_sent_rune_deposits(&self) -> BridgeResult<()> {
        let name = &self.config.name;
        for deposit in self
            .db
            .rune_deposits_by_status(name, RuneDepositStatus::SentToEvm)
            .await?
        {
            let Some(tx_hash) = deposit.evm_tx_hash else {
                warn!(id = deposit.id, "sent rune deposit has no transaction");
                continue;
            };
            let status = match wait_for_receipt(
                self.contract.as_ref(),
                tx_hash,
                self.config.receipt_timeout,
                self.config.receipt_poll_interval,
            )
            .await
            {
                Ok(true) => RuneDepositStatus::ConfirmedInEvm,
                Ok(false) => {
                    warn!(id = deposit.id, %tx_hash, "rune mint reverted");
                    RuneDepositStatus::EvmTransactionFailed
                }
                Err(EvmError::ReceiptTimeout(_)) => {
                    debug!(id = deposit.id, %tx_hash, "rune mint not mined yet");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.db
                .set_rune_deposit_status(name, deposit.id, status, None)
                .await?;
            info!(id = deposit.id, %tx_hash, ?status, "rune mint settled");
        }
        Ok(())
    }

    /// Checks a mint the leader proposes against ord, the contract and our own scan, and signs
    /// it.
    pub async fn answer_sign_rune_to_evm(
        &self,
        question: SignRuneToEvmTransferQuestion,
    ) -> BridgeResult<SignRuneToEvmTransferAnswer> {
        if self.network.is_leader() {
            return Err(BridgeError::invalid("the leader does not sign on request"));
        }

        let entry = self
            .wallet
            .ord()
            .rune(&question.rune_name)
            .await?
            .ok_or_else(|| BridgeError::invalid(format!("unknown rune {}", question.rune_name)))?;
        let parsed = Rune::from_str(&question.rune_name).ok().map(|r| r.0);
        if entry.number != question.rune_number || parsed != Some(question.rune_number) {
            return Err(BridgeError::invalid(format!(
                "rune {} is not number {}",
                question.rune_name, question.rune_number
            )));
        }
        if !self.contract.is_rune_registered(question.rune_number).await? {
            return Err(BridgeError::invalid(format!(
                "rune {} is not registered",
                question.rune_name
            )));
        }

        let (net, _) = self.config.to_evm_fee_percentage.split(question.amount_raw)?;
        if net != question.net_amount_raw {
            return Err(BridgeError::invalid(format!(
                "net amount {} should be {net}",
                question.net_amount_raw
            )));
        }
        if net == 0 {
            return Err(BridgeError::invalid("nothing left after fees"));
        }

        let outpoint = OutPoint::new(question.btc_txid, question.btc_vout);
        let incoming = self
            .db
            .get_incoming_btc_tx(&self.config.name, question.btc_txid, question.btc_vout)
            .await?
            .ok_or_else(|| BridgeError::invalid(format!("unknown deposit {outpoint}")))?;
        if incoming.status != IncomingBtcTxStatus::Accepted {
            return Err(BridgeError::invalid(format!(
                "deposit {outpoint} is not confirmed"
            )));
        }
        let expected = self.derive_deposit_address(question.evm_address)?;
        if incoming.address != expected.address.to_string() {
            return Err(BridgeError::invalid(format!(
                "deposit {outpoint} did not pay the address of {}",
                question.evm_address
            )));
        }
        let balance = self
            .wallet
            .get_rune_balance_at_output(&outpoint, &question.rune_name)
            .await?;
        if balance != question.amount_raw {
            return Err(BridgeError::invalid(format!(
                "{outpoint} holds {balance} {}, not {}",
                question.rune_name, question.amount_raw
            )));
        }

        let transfer = AcceptTransferFromBtc {
            evm_address: question.evm_address,
            rune_number: question.rune_number,
            net_rune_amount: net,
            btc_txid: txid_to_bytes32(&question.btc_txid),
            btc_vout: question.btc_vout,
        };
        let message_hash = self.contract.accept_transfer_message_hash(&transfer).await?;
        let signature = sign_message_hash(&self.signer, &message_hash)?;
        info!(%outpoint, rune = %question.rune_name, net, "signed rune mint");
        Ok(SignRuneToEvmTransferAnswer {
            signature,
            signer: self.address(),
            message_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::{Amount, Txid};

    use super::*;
    use crate::{bridge::Bridge, runes::test_utils::*};

    #[tokio::test]
    async fn deposit_is_minted_once_confirmed() {
        let fed = Federation::new(3, 2).await;
        let user = Address::repeat_byte(0xaa);
        let txid = fed.rune_deposit(user, 1_000, 1).await;

        fed.run_followers().await;
        fed.leader().run_iteration().await.unwrap();

        let accepted = fed.contract.accepted();
        assert_eq!(accepted.len(), 1);
        let (transfer, signatures) = &accepted[0];
        assert_eq!(transfer.evm_address, user);
        assert_eq!(transfer.rune_number, test_rune_number());
        assert_eq!(transfer.net_rune_amount, 996);
        assert_eq!(transfer.btc_txid, txid_to_bytes32(&txid));
        assert_eq!(signatures.len(), 2);
        fed.leader_deposit(RuneDepositStatus::SentToEvm).await;

        fed.run_followers().await;
        fed.leader().run_iteration().await.unwrap();
        assert_eq!(fed.contract.accepted().len(), 1);
        let deposit = fed.leader_deposit(RuneDepositStatus::ConfirmedInEvm).await;
        assert_eq!(deposit.transfer_amount, 1_000);
        assert_eq!(deposit.signatures.len(), 2);
    }

    #[tokio::test]
    async fn unconfirmed_deposit_waits() {
        let fed = Federation::new(3, 2).await;
        let txid = fed.rune_deposit(Address::repeat_byte(0xaa), 1_000, 0).await;

        fed.run_followers().await;
        fed.leader().run_iteration().await.unwrap();

        assert!(fed.contract.accepted().is_empty());
        let incoming = fed.dbs[0]
            .get_incoming_btc_tx("rune", txid, 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(incoming.status, IncomingBtcTxStatus::Detected);
        assert!(fed.dbs[0]
            .rune_deposits_by_status("rune", RuneDepositStatus::Accepted)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn frozen_contract_mints_nothing() {
        let fed = Federation::new(3, 2).await;
        fed.rune_deposit(Address::repeat_byte(0xaa), 1_000, 1).await;
        fed.contract.set_frozen(true);

        fed.run_followers().await;
        fed.leader().run_iteration().await.unwrap();

        assert!(fed.contract.accepted().is_empty());
        fed.leader_deposit(RuneDepositStatus::Accepted).await;
    }

    #[tokio::test]
    async fn too_many_pending_transactions_stop_minting() {
        let fed = Federation::new(3, 2).await;
        fed.rune_deposit(Address::repeat_byte(0xaa), 1_000, 1).await;
        fed.contract.set_pending(4);

        fed.run_followers().await;
        let err = fed.leader().run_iteration().await.unwrap_err();
        assert!(matches!(err, BridgeError::TooManyPending(4)));
        assert!(fed.contract.accepted().is_empty());
    }

    #[tokio::test]
    async fn sent_mints_settle_while_too_many_are_pending() {
        let fed = Federation::new(3, 2).await;
        fed.rune_deposit(Address::repeat_byte(0xaa), 1_000, 1).await;
        fed.run_followers().await;
        fed.leader().run_iteration().await.unwrap();
        fed.leader_deposit(RuneDepositStatus::SentToEvm).await;

        fed.rune_deposit(Address::repeat_byte(0xbb), 2_000, 1).await;
        fed.contract.set_pending(4);
        fed.run_followers().await;
        let err = fed.leader().run_iteration().await.unwrap_err();

        assert!(matches!(err, BridgeError::TooManyPending(4)));
        fed.leader_deposit(RuneDepositStatus::ConfirmedInEvm).await;
        fed.leader_deposit(RuneDepositStatus::Accepted).await;
        assert_eq!(fed.contract.accepted().len(), 1);
    }

    #[tokio::test]
    async fn small_postage_is_rejected() {
        let fed = Federation::new(3, 2).await;
        fed.rune_deposit_with_postage(Address::repeat_byte(0xaa), 1_000, 1, Amount::from_sat(546))
            .await;

        fed.run_followers().await;
        fed.leader().run_iteration().await.unwrap();

        assert!(fed.contract.accepted().is_empty());
        fed.leader_deposit(RuneDepositStatus::Rejected).await;
    }

    #[tokio::test]
    async fn failed_submission_is_recorded() {
        let fed = Federation::new(3, 2).await;
        fed.rune_deposit(Address::repeat_byte(0xaa), 1_000, 1).await;
        fed.contract.fail_accepts(Some("paused"));

        fed.run_followers().await;
        fed.leader().run_iteration().await.unwrap();

        fed.leader_deposit(RuneDepositStatus::SendingToEvmFailed).await;
    }

    fn question(txid: Txid, user: Address) -> SignRuneToEvmTransferQuestion {
        SignRuneToEvmTransferQuestion {
            evm_address: user,
            btc_txid: txid,
            btc_vout: 0,
            rune_name: TEST_RUNE.to_string(),
            rune_number: test_rune_number(),
            amount_raw: 1_000,
            net_amount_raw: 996,
        }
    }

    #[tokio::test]
    async fn follower_signs_a_matching_mint() {
        let fed = Federation::new(3, 2).await;
        let user = Address::repeat_byte(0xaa);
        let txid = fed.rune_deposit(user, 1_000, 1).await;
        fed.run_followers().await;

        let follower = &fed.nodes[1];
        let answer = follower
            .answer_sign_rune_to_evm(question(txid, user))
            .await
            .unwrap();
        assert_eq!(answer.signer, follower.address());
        assert_eq!(
            recover_message_signer(&answer.message_hash, &answer.signature).unwrap(),
            follower.address()
        );
    }

    #[tokio::test]
    async fn follower_refuses_mismatched_mints() {
        let fed = Federation::new(3, 2).await;
        let user = Address::repeat_byte(0xaa);
        let txid = fed.rune_deposit(user, 1_000, 1).await;
        fed.run_followers().await;
        let follower = &fed.nodes[1];

        let mut wrong_net = question(txid, user);
        wrong_net.net_amount_raw = 1_000;
        let mut wrong_amount = question(txid, user);
        wrong_amount.amount_raw = 2_000;
        wrong_amount.net_amount_raw = 1_992;
        let mut wrong_number = question(txid, user);
        wrong_number.rune_number += 1;
        let mut unknown_rune = question(txid, user);
        unknown_rune.rune_name = "OTHER•RUNE".to_string();
        let wrong_user = question(txid, Address::repeat_byte(0xbb));
        let unknown_deposit = question(fed.rpc.next_txid(), user);

        for question in [
            wrong_net,
            wrong_amount,
            wrong_number,
            unknown_rune,
            wrong_user,
            unknown_deposit,
        ] {
            let err = follower.answer_sign_rune_to_evm(question).await.unwrap_err();
            assert!(matches!(err, BridgeError::Invalid(_)), "{err}");
        }

        let err = fed
            .leader()
            .answer_sign_rune_to_evm(question(txid, user))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Invalid(_)));
    }
}
