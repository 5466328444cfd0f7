//! In-memory store, used in tests and local runs.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use bitcoin::{OutPoint, Txid};
use tokio::sync::RwLock;

use crate::{
    batches::{EvmToTapDb, TapBridgeDb},
    claims::SignedClaimsDb,
    errors::{DbError, DbResult},
    kv::KeyValueStore,
    runes::RuneBridgeDb,
    types::{
        check_transition, BatchSignatures, BatchStatus, BatchTransfer, DepositAddressRecord,
        EvmToTapBatch, EvmToTapBatchStatus, EvmToTapTransfer, IncomingBtcTx, NewEvmToTapTransfer,
        NewRuneDeposit, NewRuneTokenDeposit, RuneDeposit, RuneDepositStatus, RuneTokenDeposit,
        RuneTokenDepositStatus, SignedClaim, Status, TapDepositAddress, TransferBatch,
    },
};

#[derive(Debug, Clone)]
struct BatchRow {
    id: i64,
    hash: B256,
    status: BatchStatus,
    signatures: BatchSignatures,
    executed_tx_hash: Option<B256>,
}

#[derive(Debug, Clone)]
struct EvmToTapBatchRow {
    id: i64,
    hash: B256,
    status: EvmToTapBatchStatus,
    sending_result: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    kv: HashMap<String, String>,
    deposit_addresses: Vec<(String, DepositAddressRecord)>,
    incoming: HashMap<(String, Txid, u32), IncomingBtcTx>,
    rune_deposits: Vec<(String, RuneDeposit)>,
    token_deposits: Vec<(String, RuneTokenDeposit)>,
    tap_addresses: Vec<TapDepositAddress>,
    transfers: Vec<BatchTransfer>,
    batches: Vec<BatchRow>,
    claims: HashMap<(String, String), String>,
    evm_to_tap_transfers: BTreeMap<u64, EvmToTapTransfer>,
    evm_to_tap_batches: Vec<EvmToTapBatchRow>,
}

impl State {
    fn rune_deposit_mut(&mut self, bridge: &str, id: i64) -> DbResult<&mut RuneDeposit> {
        self.rune_deposits
            .iter_mut()
            .find(|(b, d)| b == bridge && d.id == id)
            .map(|(_, d)| d)
            .ok_or_else(|| DbError::NotFound(format!("rune deposit {id}")))
    }

    fn batch(&self, row: &BatchRow) -> TransferBatch {
        TransferBatch {
            id: row.id,
            hash: row.hash,
            status: row.status,
            signatures: row.signatures.clone(),
            transfers: self
                .transfers
                .iter()
                .filter(|t| t.batch_id == Some(row.id))
                .cloned()
                .collect(),
            executed_tx_hash: row.executed_tx_hash,
        }
    }

    fn batch_row_mut(&mut self, id: i64) -> DbResult<&mut BatchRow> {
        self.batches
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| DbError::NotFound(format!("transfer batch {id}")))
    }

    fn next_batch_id(&self) -> i64 {
        self.batches.len() as i64 + 1
    }

    fn evm_to_tap_batch(&self, row: &EvmToTapBatchRow) -> EvmToTapBatch {
        EvmToTapBatch {
            id: row.id,
            hash: row.hash,
            status: row.status,
            transfers: self
                .evm_to_tap_transfers
                .values()
                .filter(|t| t.batch_id == Some(row.id))
                .cloned()
                .collect(),
            sending_result: row.sending_result.clone(),
        }
    }
}

/// Store that lives in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDb {
    state: Arc<RwLock<State>>,
}

#[async_trait]
impl KeyValueStore for InMemoryDb {
    async fn get_value(&self, key: &str) -> DbResult<Option<String>> {
        Ok(self.state.read().await.kv.get(key).cloned())
    }

    async fn set_value(&self, key: &str, value: &str) -> DbResult<()> {
        self.state
            .write()
            .await
            .kv
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> DbResult<bool> {
        let mut state = self.state.write().await;
        if state.kv.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        state.kv.insert(key.to_owned(), value.to_owned());
        Ok(true)
    }
}

#[async_trait]
impl RuneBridgeDb for InMemoryDb {
    async fn get_deposit_address(
        &self,
        bridge: &str,
        evm_address: Address,
    ) -> DbResult<Option<DepositAddressRecord>> {
        Ok(self
            .state
            .read()
            .await
            .deposit_addresses
            .iter()
            .find(|(b, r)| b == bridge && r.evm_address == evm_address)
            .map(|(_, r)| r.clone()))
    }

    async fn get_deposit_address_by_btc(
        &self,
        bridge: &str,
        btc_address: &str,
    ) -> DbResult<Option<DepositAddressRecord>> {
        Ok(self
            .state
            .read()
            .await
            .deposit_addresses
            .iter()
            .find(|(b, r)| b == bridge && r.btc_address == btc_address)
            .map(|(_, r)| r.clone()))
    }

    async fn insert_deposit_address(
        &self,
        bridge: &str,
        record: DepositAddressRecord,
    ) -> DbResult<DepositAddressRecord> {
        let mut state = self.state.write().await;
        if let Some((_, existing)) = state
            .deposit_addresses
            .iter()
            .find(|(b, r)| b == bridge && r.evm_address == record.evm_address)
        {
            return Ok(existing.clone());
        }
        if state
            .deposit_addresses
            .iter()
            .any(|(_, r)| r.btc_address == record.btc_address)
        {
            return Err(DbError::Conflict(format!(
                "deposit address {} already assigned",
                record.btc_address
            )));
        }
        state
            .deposit_addresses
            .push((bridge.to_owned(), record.clone()));
        Ok(record)
    }

    async fn deposit_addresses(&self, bridge: &str) -> DbResult<Vec<DepositAddressRecord>> {
        Ok(self
            .state
            .read()
            .await
            .deposit_addresses
            .iter()
            .filter(|(b, _)| b == bridge)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn upsert_incoming_btc_tx(&self, bridge: &str, tx: IncomingBtcTx) -> DbResult<bool> {
        let mut state = self.state.write().await;
        let key = (bridge.to_owned(), tx.txid, tx.vout);
        match state.incoming.get_mut(&key) {
            Some(existing) => {
                let status = if existing.status.can_transition_to(tx.status) {
                    tx.status
                } else {
                    existing.status
                };
                *existing = IncomingBtcTx { status, ..tx };
                Ok(false)
            }
            None => {
                state.incoming.insert(key, tx);
                Ok(true)
            }
        }
    }

    async fn get_incoming_btc_tx(
        &self,
        bridge: &str,
        txid: Txid,
        vout: u32,
    ) -> DbResult<Option<IncomingBtcTx>> {
        Ok(self
            .state
            .read()
            .await
            .incoming
            .get(&(bridge.to_owned(), txid, vout))
            .cloned())
    }

    async fn upsert_rune_deposit(
        &self,
        bridge: &str,
        deposit: NewRuneDeposit,
    ) -> DbResult<RuneDeposit> {
        let mut state = self.state.write().await;
        let existing = state.rune_deposits.iter_mut().find(|(b, d)| {
            b == bridge
                && d.txid == deposit.txid
                && d.vout == deposit.vout
                && d.rune_number == deposit.rune_number
        });
        if let Some((_, existing)) = existing {
            existing.block_number = deposit.block_number;
            existing.postage = deposit.postage;
            existing.transfer_amount = deposit.transfer_amount;
            existing.net_amount = deposit.net_amount;
            existing.evm_address = deposit.evm_address;
            if existing.status == RuneDepositStatus::Detected
                && deposit.status == RuneDepositStatus::Accepted
            {
                existing.status = RuneDepositStatus::Accepted;
            }
            return Ok(existing.clone());
        }
        let id = state.rune_deposits.len() as i64 + 1;
        let record = RuneDeposit::from_new(id, deposit);
        state
            .rune_deposits
            .push((bridge.to_owned(), record.clone()));
        Ok(record)
    }

    async fn get_rune_deposit(&self, bridge: &str, id: i64) -> DbResult<Option<RuneDeposit>> {
        Ok(self
            .state
            .read()
            .await
            .rune_deposits
            .iter()
            .find(|(b, d)| b == bridge && d.id == id)
            .map(|(_, d)| d.clone()))
    }

    async fn rune_deposits_by_status(
        &self,
        bridge: &str,
        status: RuneDepositStatus,
    ) -> DbResult<Vec<RuneDeposit>> {
        Ok(self
            .state
            .read()
            .await
            .rune_deposits
            .iter()
            .filter(|(b, d)| b == bridge && d.status == status)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn add_rune_deposit_signatures(
        &self,
        bridge: &str,
        id: i64,
        message_hash: B256,
        signatures: &[(Address, String)],
    ) -> DbResult<RuneDeposit> {
        let mut state = self.state.write().await;
        let deposit = state.rune_deposit_mut(bridge, id)?;
        deposit.message_hash = Some(message_hash);
        for (signer, signature) in signatures {
            deposit
                .signatures
                .entry(*signer)
                .or_insert_with(|| signature.clone());
        }
        Ok(deposit.clone())
    }

    async fn set_rune_deposit_status(
        &self,
        bridge: &str,
        id: i64,
        status: RuneDepositStatus,
        evm_tx_hash: Option<B256>,
    ) -> DbResult<()> {
        let mut state = self.state.write().await;
        let deposit = state.rune_deposit_mut(bridge, id)?;
        check_transition(id, deposit.status, status)?;
        deposit.status = status;
        if evm_tx_hash.is_some() {
            deposit.evm_tx_hash = evm_tx_hash;
        }
        Ok(())
    }

    async fn insert_rune_token_deposit(
        &self,
        bridge: &str,
        deposit: NewRuneTokenDeposit,
    ) -> DbResult<bool> {
        let mut state = self.state.write().await;
        if state.token_deposits.iter().any(|(b, d)| {
            b == bridge && d.evm_tx_hash == deposit.evm_tx_hash && d.log_index == deposit.log_index
        }) {
            return Ok(false);
        }
        let id = state.token_deposits.len() as i64 + 1;
        state
            .token_deposits
            .push((bridge.to_owned(), RuneTokenDeposit::from_new(id, deposit)));
        Ok(true)
    }

    async fn get_rune_token_deposit_by_event(
        &self,
        bridge: &str,
        evm_tx_hash: B256,
        log_index: u64,
    ) -> DbResult<Option<RuneTokenDeposit>> {
        Ok(self
            .state
            .read()
            .await
            .token_deposits
            .iter()
            .find(|(b, d)| b == bridge && d.evm_tx_hash == evm_tx_hash && d.log_index == log_index)
            .map(|(_, d)| d.clone()))
    }

    async fn rune_token_deposits_by_status(
        &self,
        bridge: &str,
        status: RuneTokenDepositStatus,
    ) -> DbResult<Vec<RuneTokenDeposit>> {
        Ok(self
            .state
            .read()
            .await
            .token_deposits
            .iter()
            .filter(|(b, d)| b == bridge && d.status == status)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn set_rune_token_deposit_status(
        &self,
        bridge: &str,
        id: i64,
        status: RuneTokenDepositStatus,
        finalized_psbt: Option<String>,
        btc_txid: Option<Txid>,
    ) -> DbResult<()> {
        let mut state = self.state.write().await;
        let deposit = state
            .token_deposits
            .iter_mut()
            .find(|(b, d)| b == bridge && d.id == id)
            .map(|(_, d)| d)
            .ok_or_else(|| DbError::NotFound(format!("rune token deposit {id}")))?;
        check_transition(id, deposit.status, status)?;
        deposit.status = status;
        if finalized_psbt.is_some() {
            deposit.finalized_psbt = finalized_psbt;
        }
        if btc_txid.is_some() {
            deposit.btc_txid = btc_txid;
        }
        Ok(())
    }
}

#[async_trait]
impl TapBridgeDb for InMemoryDb {
    async fn add_tap_deposit_address(&self, address: TapDepositAddress) -> DbResult<()> {
        let mut state = self.state.write().await;
        if state
            .tap_addresses
            .iter()
            .any(|a| a.tap_address == address.tap_address)
        {
            return Err(DbError::Conflict(format!(
                "tap address {} already stored",
                address.tap_address
            )));
        }
        state.tap_addresses.push(address);
        Ok(())
    }

    async fn tap_deposit_addresses(&self) -> DbResult<Vec<TapDepositAddress>> {
        Ok(self.state.read().await.tap_addresses.clone())
    }

    async fn known_deposit_outpoints(&self) -> DbResult<HashSet<OutPoint>> {
        Ok(self
            .state
            .read()
            .await
            .transfers
            .iter()
            .map(|t| t.deposit_outpoint)
            .collect())
    }

    async fn insert_batch_transfer(
        &self,
        evm_address: Address,
        tap_address: &str,
        deposit_outpoint: OutPoint,
    ) -> DbResult<bool> {
        let mut state = self.state.write().await;
        if state
            .transfers
            .iter()
            .any(|t| t.deposit_outpoint == deposit_outpoint)
        {
            return Ok(false);
        }
        let counter = state.transfers.len() as u64 + 1;
        state.transfers.push(BatchTransfer {
            counter,
            evm_address,
            tap_address: tap_address.to_owned(),
            deposit_outpoint,
            batch_id: None,
        });
        Ok(true)
    }

    async fn unbatched_transfers(&self, limit: usize) -> DbResult<Vec<BatchTransfer>> {
        Ok(self
            .state
            .read()
            .await
            .transfers
            .iter()
            .filter(|t| t.batch_id.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn current_batch(&self) -> DbResult<Option<TransferBatch>> {
        let state = self.state.read().await;
        Ok(state
            .batches
            .iter()
            .find(|b| b.status != BatchStatus::Finalized)
            .map(|row| state.batch(row)))
    }

    async fn create_batch(&self, hash: B256, counters: &[u64]) -> DbResult<TransferBatch> {
        let mut state = self.state.write().await;
        if state.batches.iter().any(|b| b.hash == hash) {
            return Err(DbError::Conflict(format!("batch {hash} already exists")));
        }
        let wanted: HashSet<u64> = counters.iter().copied().collect();
        let available = state
            .transfers
            .iter()
            .filter(|t| wanted.contains(&t.counter) && t.batch_id.is_none())
            .count();
        if available != wanted.len() {
            return Err(DbError::Conflict(
                "transfers missing or already batched".to_string(),
            ));
        }

        let id = state.next_batch_id();
        for transfer in state.transfers.iter_mut() {
            if wanted.contains(&transfer.counter) {
                transfer.batch_id = Some(id);
            }
        }
        let row = BatchRow {
            id,
            hash,
            status: BatchStatus::Created,
            signatures: BTreeMap::new(),
            executed_tx_hash: None,
        };
        let batch = state.batch(&row);
        state.batches.push(row);
        Ok(batch)
    }

    async fn get_batch_by_hash(&self, hash: B256) -> DbResult<Option<TransferBatch>> {
        let state = self.state.read().await;
        Ok(state
            .batches
            .iter()
            .find(|b| b.hash == hash)
            .map(|row| state.batch(row)))
    }

    async fn insert_signed_batch(
        &self,
        hash: B256,
        signatures: BatchSignatures,
    ) -> DbResult<TransferBatch> {
        let mut state = self.state.write().await;
        if state.batches.iter().any(|b| b.hash == hash) {
            return Err(DbError::Conflict(format!("batch {hash} already exists")));
        }
        let row = BatchRow {
            id: state.next_batch_id(),
            hash,
            status: BatchStatus::Created,
            signatures,
            executed_tx_hash: None,
        };
        let batch = state.batch(&row);
        state.batches.push(row);
        Ok(batch)
    }

    async fn set_batch_signatures(&self, id: i64, signatures: BatchSignatures) -> DbResult<()> {
        self.state.write().await.batch_row_mut(id)?.signatures = signatures;
        Ok(())
    }

    async fn set_batch_status(
        &self,
        id: i64,
        status: BatchStatus,
        executed_tx_hash: Option<B256>,
    ) -> DbResult<()> {
        let mut state = self.state.write().await;
        let row = state.batch_row_mut(id)?;
        check_transition(id, row.status, status)?;
        row.status = status;
        if executed_tx_hash.is_some() {
            row.executed_tx_hash = executed_tx_hash;
        }
        Ok(())
    }
}

#[async_trait]
impl EvmToTapDb for InMemoryDb {
    async fn insert_evm_to_tap_transfer(&self, transfer: NewEvmToTapTransfer) -> DbResult<bool> {
        let mut state = self.state.write().await;
        if state.evm_to_tap_transfers.contains_key(&transfer.counter)
            || state.evm_to_tap_transfers.values().any(|t| {
                t.evm_tx_hash == transfer.evm_tx_hash && t.log_index == transfer.log_index
            })
        {
            return Ok(false);
        }
        state
            .evm_to_tap_transfers
            .insert(transfer.counter, EvmToTapTransfer::from_new(transfer));
        Ok(true)
    }

    async fn get_evm_to_tap_transfer(&self, counter: u64) -> DbResult<Option<EvmToTapTransfer>> {
        Ok(self
            .state
            .read()
            .await
            .evm_to_tap_transfers
            .get(&counter)
            .cloned())
    }

    async fn unbatched_evm_to_tap_transfers(
        &self,
        limit: usize,
    ) -> DbResult<Vec<EvmToTapTransfer>> {
        Ok(self
            .state
            .read()
            .await
            .evm_to_tap_transfers
            .values()
            .filter(|t| t.batch_id.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn current_evm_to_tap_batch(&self) -> DbResult<Option<EvmToTapBatch>> {
        let state = self.state.read().await;
        Ok(state
            .evm_to_tap_batches
            .iter()
            .find(|b| b.status != EvmToTapBatchStatus::Finalized)
            .map(|row| state.evm_to_tap_batch(row)))
    }

    async fn create_evm_to_tap_batch(
        &self,
        hash: B256,
        counters: &[u64],
    ) -> DbResult<EvmToTapBatch> {
        let mut state = self.state.write().await;
        if state.evm_to_tap_batches.iter().any(|b| b.hash == hash) {
            return Err(DbError::Conflict(format!("batch {hash} already exists")));
        }
        let wanted: HashSet<u64> = counters.iter().copied().collect();
        let available = wanted
            .iter()
            .filter(|c| {
                state
                    .evm_to_tap_transfers
                    .get(*c)
                    .is_some_and(|t| t.batch_id.is_none())
            })
            .count();
        if available != wanted.len() {
            return Err(DbError::Conflict(
                "transfers missing or already batched".to_string(),
            ));
        }

        let id = state.evm_to_tap_batches.len() as i64 + 1;
        for counter in &wanted {
            if let Some(transfer) = state.evm_to_tap_transfers.get_mut(counter) {
                transfer.batch_id = Some(id);
            }
        }
        let row = EvmToTapBatchRow {
            id,
            hash,
            status: EvmToTapBatchStatus::Created,
            sending_result: None,
        };
        let batch = state.evm_to_tap_batch(&row);
        state.evm_to_tap_batches.push(row);
        Ok(batch)
    }

    async fn set_evm_to_tap_batch_status(
        &self,
        id: i64,
        status: EvmToTapBatchStatus,
        sending_result: Option<String>,
    ) -> DbResult<()> {
        let mut state = self.state.write().await;
        let row = state
            .evm_to_tap_batches
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| DbError::NotFound(format!("evm to tap batch {id}")))?;
        check_transition(id, row.status, status)?;
        row.status = status;
        if sending_result.is_some() {
            row.sending_result = sending_result;
        }
        Ok(())
    }
}

#[async_trait]
impl SignedClaimsDb for InMemoryDb {
    async fn record_signed_claims(&self, bridge: &str, claims: &[SignedClaim]) -> DbResult<()> {
        let mut state = self.state.write().await;
        for claim in claims {
            let key = (bridge.to_owned(), claim.resource.clone());
            match state.claims.get(&key) {
                Some(existing) if *existing != claim.commitment => {
                    return Err(DbError::Conflict(format!(
                        "{} already signed for {existing}",
                        claim.resource
                    )));
                }
                _ => {}
            }
        }
        for claim in claims {
            state
                .claims
                .entry((bridge.to_owned(), claim.resource.clone()))
                .or_insert_with(|| claim.commitment.clone());
        }
        Ok(())
    }

    async fn signed_claim(&self, bridge: &str, resource: &str) -> DbResult<Option<String>> {
        Ok(self
            .state
            .read()
            .await
            .claims
            .get(&(bridge.to_owned(), resource.to_owned()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_tests;

    #[tokio::test]
    async fn checkpoints_compare_and_set() {
        store_tests::checkpoints_compare_and_set(&InMemoryDb::default()).await;
    }

    #[tokio::test]
    async fn deposit_addresses_are_stable() {
        store_tests::deposit_addresses_are_stable(&InMemoryDb::default()).await;
    }

    #[tokio::test]
    async fn incoming_txs_upsert_forward_only() {
        store_tests::incoming_txs_upsert_forward_only(&InMemoryDb::default()).await;
    }

    #[tokio::test]
    async fn rune_deposits_keep_progress() {
        store_tests::rune_deposits_keep_progress(&InMemoryDb::default()).await;
    }

    #[tokio::test]
    async fn token_deposits_are_inserted_once() {
        store_tests::token_deposits_are_inserted_once(&InMemoryDb::default()).await;
    }

    #[tokio::test]
    async fn batches_move_forward() {
        store_tests::batches_move_forward(&InMemoryDb::default()).await;
    }

    #[tokio::test]
    async fn evm_to_tap_batches_move_forward() {
        store_tests::evm_to_tap_batches_move_forward(&InMemoryDb::default()).await;
    }

    #[tokio::test]
    async fn signed_claims_refuse_conflicts() {
        store_tests::signed_claims_refuse_conflicts(&InMemoryDb::default()).await;
    }

    #[tokio::test]
    async fn clones_share_state() {
        let db = InMemoryDb::default();
        let clone = db.clone();
        db.set_value("k", "v").await.unwrap();
        assert_eq!(clone.get_value("k").await.unwrap().as_deref(), Some("v"));
    }
}
