//! Rune token burns: recording them from the EVM, paying the runes out, and co-signing payouts.

use std::collections::HashSet;

use bitcoin::{Amount, Psbt};
use federator_db::{
    types::{NewRuneTokenDeposit, RuneTokenDeposit, RuneTokenDepositStatus, SignedClaim},
    RuneBridgeDb,
};
use federator_multisig::{
    fees::{estimate_vsize, fee_for},
    psbt::{deserialize_psbt, psbt_fee, serialize_psbt},
    runes::{
        runestone::Runestone,
        types::{Rune, RuneTransfer},
        wallet::{FIRST_TRANSFER_OUTPUT, RUNESTONE_OUTPUT, RUNE_CHANGE_OUTPUT, TARGET_POSTAGE_SAT},
    },
    MultisigError,
};
use federator_p2p::{Answer, Question, Topic};
use tracing::{debug, info, warn};

use super::{
    messages::{
        RuneTokenTransfer, SignRuneTokenToBtcTransferAnswer, SignRuneTokenToBtcTransferQuestion,
    },
    RuneBridge,
};
use crate::{
    claims::record_claims,
    errors::{BridgeError, BridgeResult},
    signatures::collect_signatures,
};

fn rune_transfer(rune: &str, receiver: &str, amount: u128) -> RuneTransfer {
    RuneTransfer {
        rune: rune.to_string(),
        receiver: receiver.to_string(),
        amount,
        postage: TARGET_POSTAGE_SAT,
    }
}

impl RuneBridge {
    /// Records burn events since the EVM checkpoint. Returns how many were new.
    pub async fn scan_rune_token_deposits(&self) -> BridgeResult<usize> {
        let Some(batch) = self
            .scanner
            .next_batch(self.db.as_ref(), self.contract.as_ref())
            .await?
        else {
            return Ok(0);
        };

        let mut new = 0;
        for event in batch.events {
            let name = Rune(event.rune_number).to_string();
            let (spaced_rune, status) = match self.wallet.ord().rune(&name).await? {
                Some(entry) => (entry.spaced_rune, RuneTokenDepositStatus::Accepted),
                None => {
                    warn!(rune = %name, tx_hash = %event.evm_tx_hash, "burn of a rune ord does not know");
                    (name, RuneTokenDepositStatus::Rejected)
                }
            };
            let deposit = NewRuneTokenDeposit {
                evm_tx_hash: event.evm_tx_hash,
                log_index: event.log_index,
                block_number: event.block_number,
                user_evm_address: event.from,
                receiver_btc_address: event.receiver_btc_address,
                rune_number: event.rune_number,
                spaced_rune,
                token_address: event.token,
                net_rune_amount: event.net_rune_amount,
                transferred_token_amount: event.transferred_token_amount,
                status,
            };
            if self
                .db
                .insert_rune_token_deposit(&self.config.name, deposit)
                .await?
            {
                info!(tx_hash = %event.evm_tx_hash, log_index = event.log_index, "new rune token burn");
                new += 1;
            }
        }
        self.scanner
            .mark_scanned(self.db.as_ref(), batch.to_block)
            .await?;
        Ok(new)
    }

    /// Pays out accepted burns, in transactions of at most `max_transfers_per_psbt`.
    pub async fn process_rune_token_deposits(&self) -> BridgeResult<()> {
        let name = &self.config.name;
        self.confirm_sent_token_deposits().await?;

        let params = self.wallet.multisig().params();
        let mut payable = Vec::new();
        for deposit in self
            .db
            .rune_token_deposits_by_status(name, RuneTokenDepositStatus::Accepted)
            .await?
        {
            let reason = if params.script_pubkey(&deposit.receiver_btc_address).is_err() {
                Some("receiver is not a valid address")
            } else if deposit.net_rune_amount == 0 {
                Some("zero amount")
            } else {
                None
            };
            match reason {
                Some(reason) => {
                    warn!(id = deposit.id, receiver = %deposit.receiver_btc_address, reason, "rejecting rune token burn");
                    self.db
                        .set_rune_token_deposit_status(
                            name,
                            deposit.id,
                            RuneTokenDepositStatus::Rejected,
                            None,
                            None,
                        )
                        .await?;
                }
                None => payable.push(deposit),
            }
        }
        if payable.is_empty() {
            return Ok(());
        }

        let estimate = self.fees.fee_rate().await?;
        let fee_rate =
            self.config
                .payout_fee_rate(estimate)
                .ok_or(BridgeError::FeeRateTooHigh {
                    rate: estimate,
                    max: self.config.btc_max_fee_rate,
                })?;
        for chunk in payable.chunks(self.config.max_transfers_per_psbt.max(1)) {
            self.send_token_deposits(chunk, fee_rate).await?;
        }
        Ok(())
    }

    async fn send_token_deposits(
        &self,
        deposits: &[RuneTokenDeposit],
        fee_rate: u64,
    ) -> BridgeResult<()> {
        let name = &self.config.name;
        let multisig = self.wallet.multisig();
        let transfers = deposits
            .iter()
            .map(|d| rune_transfer(&d.spaced_rune, &d.receiver_btc_address, d.net_rune_amount))
            .collect::<Vec<_>>();
        let unsigned = self.pending_payout(deposits, &transfers, fee_rate).await?;
        let own = multisig.sign_psbt(&unsigned)?;

        let question = Question::new(
            Topic::SignRuneTokenDepositToBtc,
            &SignRuneTokenToBtcTransferQuestion {
                transfers: deposits
                    .iter()
                    .map(|d| RuneTokenTransfer {
                        evm_tx_hash: d.evm_tx_hash,
                        log_index: d.log_index,
                        receiver_address: d.receiver_btc_address.clone(),
                        rune_number: d.rune_number,
                        rune_name: d.spaced_rune.clone(),
                        net_rune_amount: d.net_rune_amount,
                    })
                    .collect(),
                unsigned_psbt: serialize_psbt(&unsigned),
                fee_rate,
            },
        )?;
        let required = multisig.required();
        let this = self;
        let unsigned_ref = &unsigned;
        let signed = collect_signatures(
            self.network.as_ref(),
            &question,
            vec![(self.address(), own)],
            required,
            &self.config.collect,
            move |answer| async move { this.check_to_btc_answer(answer, unsigned_ref) },
        )
        .await;
        if signed.len() < required {
            warn!(
                transfers = deposits.len(),
                collected = signed.len(),
                required,
                "not enough signatures to pay out yet"
            );
            return Ok(());
        }

        let signed = signed.into_iter().map(|(_, psbt)| psbt).collect::<Vec<_>>();
        let finalized = multisig.combine_and_finalize_psbt(&unsigned, &signed)?;
        let encoded = serialize_psbt(&finalized);
        for deposit in deposits {
            self.db
                .set_rune_token_deposit_status(
                    name,
                    deposit.id,
                    RuneTokenDepositStatus::SendingToBtc,
                    Some(encoded.clone()),
                    None,
                )
                .await?;
        }

        let (status, txid) = match multisig.broadcast_psbt(&finalized).await {
            Ok(txid) => {
                info!(%txid, transfers = deposits.len(), "broadcast rune payout");
                (RuneTokenDepositStatus::SentToBtc, Some(txid))
            }
            Err(e) => {
                warn!(%e, transfers = deposits.len(), "broadcasting rune payout failed");
                (RuneTokenDepositStatus::SendingToBtcFailed, None)
            }
        };
        for deposit in deposits {
            self.db
                .set_rune_token_deposit_status(name, deposit.id, status, None, txid)
                .await?;
        }
        Ok(())
    }

    /// The unsigned payout for `deposits`. A payout offered before is offered again unchanged,
    /// since followers sign at most one payout per burn.
    async fn pending_payout(
        &self,
        deposits: &[RuneTokenDeposit],
        transfers: &[RuneTransfer],
        fee_rate: u64,
    ) -> BridgeResult<Psbt> {
        let ids = deposits
            .iter()
            .map(|d| d.id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let key = format!("{}:rune-payout:{ids}", self.config.name);
        if let Some(stored) = self.db.get_value(&key).await? {
            debug!(%key, "offering the pending payout again");
            return Ok(deserialize_psbt(&stored)?);
        }
        let unsigned = self.wallet.create_rune_psbt(transfers, fee_rate).await?;
        self.db.set_value(&key, &serialize_psbt(&unsigned)).await?;
        Ok(unsigned)
    }

    fn check_to_btc_answer(&self, answer: Answer, unsigned: &Psbt) -> BridgeResult<Psbt> {
        let response: SignRuneTokenToBtcTransferAnswer = answer.decode()?;
        let keys = self.wallet.multisig().keys();
        if !keys.xpubs().contains(&response.signer_xpub) {
            return Err(BridgeError::invalid(format!(
                "{} is not a cosigner",
                response.signer_xpub
            )));
        }
        if response.signer_xpub == keys.signer_xpub() {
            return Err(BridgeError::invalid("answer signed with our own key"));
        }
        let psbt = deserialize_psbt(&response.signed_psbt)?;
        if psbt.unsigned_tx != unsigned.unsigned_tx {
            return Err(BridgeError::invalid("signed a different transaction"));
        }
        Ok(psbt)
    }

    async fn confirm_sent_token_deposits(&self) -> BridgeResult<()> {
        let name = &self.config.name;
        let rpc = self.wallet.multisig().rpc();
        let min_confirmations = i64::from(self.config.btc_min_confirmations);
        for deposit in self
            .db
            .rune_token_deposits_by_status(name, RuneTokenDepositStatus::SentToBtc)
            .await?
        {
            let Some(txid) = deposit.btc_txid else {
                warn!(id = deposit.id, "sent rune token burn has no transaction");
                continue;
            };
            let tx = rpc.get_transaction(&txid).await?;
            if tx.confirmations >= min_confirmations {
                self.db
                    .set_rune_token_deposit_status(
                        name,
                        deposit.id,
                        RuneTokenDepositStatus::ConfirmedInBtc,
                        None,
                        None,
                    )
                    .await?;
                info!(id = deposit.id, %txid, "rune payout confirmed");
            } else {
                debug!(id = deposit.id, %txid, confirmations = tx.confirmations, "rune payout not deep enough");
            }
        }
        Ok(())
    }

    /// Checks a payout the leader proposes against our records and our own fee estimate, and
    /// signs it.
    pub async fn answer_sign_token_to_btc(
        &self,
        question: SignRuneTokenToBtcTransferQuestion,
    ) -> BridgeResult<SignRuneTokenToBtcTransferAnswer> {
        if self.network.is_leader() {
            return Err(BridgeError::invalid("the leader does not sign on request"));
        }
        if question.transfers.is_empty() {
            return Err(BridgeError::invalid("payout without transfers"));
        }

        let mut seen = HashSet::new();
        for transfer in &question.transfers {
            let event = (transfer.evm_tx_hash, transfer.log_index);
            if !seen.insert(event) {
                return Err(BridgeError::invalid(format!(
                    "burn {}:{} listed twice",
                    event.0, event.1
                )));
            }
            let deposit = self
                .db
                .get_rune_token_deposit_by_event(&self.config.name, event.0, event.1)
                .await?
                .ok_or_else(|| {
                    BridgeError::invalid(format!("unknown burn {}:{}", event.0, event.1))
                })?;
            if deposit.status != RuneTokenDepositStatus::Accepted {
                return Err(BridgeError::invalid(format!(
                    "burn {}:{} is {:?}",
                    event.0, event.1, deposit.status
                )));
            }
            if deposit.receiver_btc_address != transfer.receiver_address
                || deposit.rune_number != transfer.rune_number
                || deposit.net_rune_amount != transfer.net_rune_amount
                || Rune::unspaced(&deposit.spaced_rune) != Rune::unspaced(&transfer.rune_name)
            {
                return Err(BridgeError::invalid(format!(
                    "burn {}:{} does not match our record",
                    event.0, event.1
                )));
            }
        }

        let psbt = deserialize_psbt(&question.unsigned_psbt)?;
        self.check_payout_outputs(&question.transfers, &psbt).await?;
        self.check_payout_fee(&question, &psbt).await?;

        let txid = psbt.unsigned_tx.compute_txid();
        let claims = question
            .transfers
            .iter()
            .map(|t| {
                SignedClaim::new(format!("rune-burn:{}:{}", t.evm_tx_hash, t.log_index), txid)
            })
            .collect::<Vec<_>>();
        record_claims(self.db.as_ref(), &self.config.name, &claims).await?;

        let multisig = self.wallet.multisig();
        let signed = multisig.sign_psbt(&psbt)?;
        info!(
            txid = %psbt.unsigned_tx.compute_txid(),
            transfers = question.transfers.len(),
            "signed rune payout"
        );
        Ok(SignRuneTokenToBtcTransferAnswer {
            signed_psbt: serialize_psbt(&signed),
            signer_xpub: multisig.signer_xpub(),
        })
    }

    async fn check_payout_outputs(
        &self,
        transfers: &[RuneTokenTransfer],
        psbt: &Psbt,
    ) -> BridgeResult<()> {
        let multisig = self.wallet.multisig();
        let outputs = &psbt.unsigned_tx.output;
        let n = transfers.len();
        if outputs.len() != n + 2 && outputs.len() != n + 3 {
            return Err(BridgeError::invalid(format!(
                "{} outputs for {n} transfers",
                outputs.len()
            )));
        }

        let rune_transfers = transfers
            .iter()
            .map(|t| rune_transfer(&t.rune_name, &t.receiver_address, t.net_rune_amount))
            .collect::<Vec<_>>();
        let runestone = Runestone {
            edicts: self.wallet.transfer_edicts(&rune_transfers).await?,
            pointer: Some(RUNE_CHANGE_OUTPUT),
        }
        .encipher()
        .map_err(MultisigError::from)?;
        let stone = &outputs[RUNESTONE_OUTPUT];
        if stone.script_pubkey != runestone || stone.value != Amount::ZERO {
            return Err(BridgeError::invalid("runestone does not match the transfers"));
        }

        let change = multisig.change_script_pubkey()?;
        let rune_change = &outputs[RUNE_CHANGE_OUTPUT as usize];
        if rune_change.script_pubkey != change || rune_change.value != TARGET_POSTAGE_SAT {
            return Err(BridgeError::invalid("rune change output is not ours"));
        }

        let params = multisig.params();
        for (i, transfer) in rune_transfers.iter().enumerate() {
            let output = &outputs[FIRST_TRANSFER_OUTPUT as usize + i];
            let script = params
                .script_pubkey(&transfer.receiver)
                .map_err(MultisigError::from)?;
            if output.script_pubkey != script || output.value != transfer.postage {
                return Err(BridgeError::invalid(format!(
                    "output {} does not pay {}",
                    FIRST_TRANSFER_OUTPUT as usize + i,
                    transfer.receiver
                )));
            }
        }
        if outputs.len() == n + 3 && outputs[n + 2].script_pubkey != change {
            return Err(BridgeError::invalid("btc change output is not ours"));
        }
        Ok(())
    }

    async fn check_payout_fee(
        &self,
        question: &SignRuneTokenToBtcTransferQuestion,
        psbt: &Psbt,
    ) -> BridgeResult<()> {
        let estimate = self.fees.fee_rate().await?;
        let min = self.config.btc_min_fee_rate;
        let lowest = (estimate / 3).max(min);
        let highest = estimate.max(min).saturating_mul(3);
        if !(lowest..=highest).contains(&question.fee_rate) {
            return Err(BridgeError::invalid(format!(
                "fee rate {} outside {lowest}..={highest}",
                question.fee_rate
            )));
        }

        let scripts = psbt
            .inputs
            .iter()
            .enumerate()
            .map(|(i, input)| {
                input
                    .witness_script
                    .clone()
                    .ok_or_else(|| BridgeError::invalid(format!("input {i} has no witness script")))
            })
            .collect::<BridgeResult<Vec<_>>>()?;
        let has_change = psbt.unsigned_tx.output.len() == question.transfers.len() + 3;
        let vsize = estimate_vsize(
            &psbt.unsigned_tx,
            &scripts,
            self.wallet.multisig().required(),
            !has_change,
        );
        let expected = u128::from(fee_for(vsize, question.fee_rate).to_sat());
        let fee = u128::from(psbt_fee(psbt)?.to_sat());
        if fee * 11 < expected * 10 || fee * 10 >= expected * 11 {
            return Err(BridgeError::invalid(format!(
                "fee {fee} sat is not within a tenth of {expected} sat"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::B256;
    use federator_db::{KeyValueStore, SignedClaimsDb};

    use super::*;
    use crate::{
        bridge::Bridge,
        runes::{test_utils::*, RuneBridgeConfig},
    };

    #[tokio::test]
    async fn burn_is_paid_out_on_btc() {
        let fed = Federation::new(3, 2).await;
        fed.fund_runes(1_000);
        let burn = fed.burn(0, RECEIVER, 600);

        fed.run_followers().await;
        fed.leader().run_iteration().await.unwrap();

        let sent = fed.rpc.sent_transactions();
        assert_eq!(sent.len(), 1);
        let tx = &sent[0];
        assert!(tx.input.iter().all(|input| !input.witness.is_empty()));
        let runestone = Runestone::decipher(tx).unwrap().unwrap();
        assert_eq!(runestone.edicts.len(), 1);
        assert_eq!(runestone.edicts[0].amount, 600);
        assert_eq!(runestone.edicts[0].output, FIRST_TRANSFER_OUTPUT);

        let deposit = fed
            .dbs[0]
            .get_rune_token_deposit_by_event("rune", burn.evm_tx_hash, burn.log_index)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deposit.status, RuneTokenDepositStatus::SentToBtc);
        assert_eq!(deposit.btc_txid, Some(tx.compute_txid()));
        assert!(deposit.finalized_psbt.is_some());
    }

    #[tokio::test]
    async fn followers_that_have_not_seen_the_burn_refuse() {
        let fed = Federation::new(3, 2).await;
        fed.fund_runes(1_000);
        fed.burn(0, RECEIVER, 600);

        fed.leader().run_iteration().await.unwrap();

        assert!(fed.rpc.sent_transactions().is_empty());
        let accepted = fed
            .dbs[0]
            .rune_token_deposits_by_status("rune", RuneTokenDepositStatus::Accepted)
            .await
            .unwrap();
        assert_eq!(accepted.len(), 1);
    }

    #[tokio::test]
    async fn invalid_receiver_is_rejected() {
        let fed = Federation::new(3, 2).await;
        fed.fund_runes(1_000);
        fed.burn(0, "not-an-address", 600);

        fed.leader().run_iteration().await.unwrap();

        let rejected = fed
            .dbs[0]
            .rune_token_deposits_by_status("rune", RuneTokenDepositStatus::Rejected)
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert!(fed.rpc.sent_transactions().is_empty());
    }

    #[tokio::test]
    async fn expensive_network_pays_nothing_out() {
        let config = RuneBridgeConfig {
            btc_max_fee_rate: 5,
            ..config()
        };
        let fed = Federation::with_config(3, 2, config).await;
        fed.fund_runes(1_000);
        fed.burn(0, RECEIVER, 600);

        fed.run_followers().await;
        let err = fed.leader().run_iteration().await.unwrap_err();

        assert!(matches!(err, BridgeError::FeeRateTooHigh { rate: 10, max: 5 }));
        assert!(fed.rpc.sent_transactions().is_empty());
    }

    #[tokio::test]
    async fn scanning_twice_records_a_burn_once() {
        let fed = Federation::new(3, 2).await;
        fed.burn(0, RECEIVER, 600);

        assert_eq!(fed.leader().scan_rune_token_deposits().await.unwrap(), 1);
        assert_eq!(fed.leader().scan_rune_token_deposits().await.unwrap(), 0);
    }

    async fn payout_question(fed: &Federation) -> SignRuneTokenToBtcTransferQuestion {
        payout_question_at(fed, 11).await
    }

    async fn payout_question_at(
        fed: &Federation,
        fee_rate: u64,
    ) -> SignRuneTokenToBtcTransferQuestion {
        let deposits = fed
            .dbs[0]
            .rune_token_deposits_by_status("rune", RuneTokenDepositStatus::Accepted)
            .await
            .unwrap();
        let transfers = deposits
            .iter()
            .map(|d| rune_transfer(&d.spaced_rune, &d.receiver_btc_address, d.net_rune_amount))
            .collect::<Vec<_>>();
        let psbt = fed
            .leader()
            .wallet
            .create_rune_psbt(&transfers, fee_rate)
            .await
            .unwrap();
        SignRuneTokenToBtcTransferQuestion {
            transfers: deposits
                .iter()
                .map(|d| RuneTokenTransfer {
                    evm_tx_hash: d.evm_tx_hash,
                    log_index: d.log_index,
                    receiver_address: d.receiver_btc_address.clone(),
                    rune_number: d.rune_number,
                    rune_name: d.spaced_rune.clone(),
                    net_rune_amount: d.net_rune_amount,
                })
                .collect(),
            unsigned_psbt: serialize_psbt(&psbt),
            fee_rate,
        }
    }

    #[tokio::test]
    async fn follower_signs_a_matching_payout() {
        let fed = Federation::new(3, 2).await;
        fed.fund_runes(1_000);
        fed.burn(0, RECEIVER, 600);
        fed.leader().scan_rune_token_deposits().await.unwrap();
        fed.run_followers().await;

        let question = payout_question(&fed).await;
        let answer = fed.nodes[1].answer_sign_token_to_btc(question).await.unwrap();
        assert_eq!(answer.signer_xpub, fed.nodes[1].wallet.multisig().signer_xpub());
        let signed = deserialize_psbt(&answer.signed_psbt).unwrap();
        assert!(signed.inputs.iter().all(|input| input.partial_sigs.len() == 1));
    }

    #[tokio::test]
    async fn follower_refuses_tampered_payouts() {
        let fed = Federation::new(3, 2).await;
        fed.fund_runes(1_000);
        fed.burn(0, RECEIVER, 600);
        fed.leader().scan_rune_token_deposits().await.unwrap();
        fed.run_followers().await;
        let question = payout_question(&fed).await;
        let follower = &fed.nodes[1];

        let mut more = question.clone();
        more.transfers[0].net_rune_amount = 700;
        let mut duplicated = question.clone();
        duplicated.transfers.push(duplicated.transfers[0].clone());
        let mut unknown = question.clone();
        unknown.transfers[0].evm_tx_hash = B256::repeat_byte(0xee);
        let mut greedy = question.clone();
        greedy.fee_rate = 1_000;
        let mut rerouted = question.clone();
        let mut psbt = deserialize_psbt(&rerouted.unsigned_psbt).unwrap();
        psbt.unsigned_tx.output[FIRST_TRANSFER_OUTPUT as usize].script_pubkey =
            follower.wallet.multisig().change_script_pubkey().unwrap();
        rerouted.unsigned_psbt = serialize_psbt(&psbt);

        for question in [more, duplicated, unknown, greedy, rerouted] {
            let err = follower.answer_sign_token_to_btc(question).await.unwrap_err();
            assert!(matches!(err, BridgeError::Invalid(_)), "{err}");
        }
    }

    #[tokio::test]
    async fn follower_signs_one_payout_per_burn() {
        let fed = Federation::new(3, 2).await;
        fed.fund_runes(1_000);
        let burn = fed.burn(0, RECEIVER, 600);
        fed.leader().scan_rune_token_deposits().await.unwrap();
        fed.run_followers().await;
        let follower = &fed.nodes[1];

        let first = payout_question_at(&fed, 11).await;
        let second = payout_question_at(&fed, 12).await;
        assert_ne!(first.unsigned_psbt, second.unsigned_psbt);

        follower.answer_sign_token_to_btc(first.clone()).await.unwrap();
        let err = follower.answer_sign_token_to_btc(second).await.unwrap_err();
        assert!(matches!(err, BridgeError::ConflictingClaim(_)), "{err}");

        follower.answer_sign_token_to_btc(first.clone()).await.unwrap();
        let txid = deserialize_psbt(&first.unsigned_psbt)
            .unwrap()
            .unsigned_tx
            .compute_txid();
        let resource = format!("rune-burn:{}:{}", burn.evm_tx_hash, burn.log_index);
        assert_eq!(
            fed.dbs[1].signed_claim("rune", &resource).await.unwrap(),
            Some(txid.to_string())
        );
    }

    #[tokio::test]
    async fn leader_offers_the_same_payout_until_it_is_signed() {
        let fed = Federation::new(3, 2).await;
        fed.fund_runes(1_000);
        fed.burn(0, RECEIVER, 600);

        fed.leader().run_iteration().await.unwrap();
        assert!(fed.rpc.sent_transactions().is_empty());
        let deposit = fed
            .dbs[0]
            .rune_token_deposits_by_status("rune", RuneTokenDepositStatus::Accepted)
            .await
            .unwrap()
            .remove(0);
        let pending = fed
            .dbs[0]
            .get_value(&format!("rune:rune-payout:{}", deposit.id))
            .await
            .unwrap()
            .unwrap();
        let offered = deserialize_psbt(&pending).unwrap().unsigned_tx.compute_txid();

        fed.run_followers().await;
        fed.leader().run_iteration().await.unwrap();

        let sent = fed.rpc.sent_transactions();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].compute_txid(), offered);
    }
}
