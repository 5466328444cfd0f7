//! In-memory bridge contracts that verify signatures the way the real ones do.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use alloy::{
    primitives::{keccak256, Address, Bytes, Signature, B256, U256},
    sol_types::SolValue,
};
use async_trait::async_trait;
use federator_transport::federators::{FederatorLookupError, FederatorSource};
use parking_lot::Mutex;

use crate::{
    contracts::{
        AcceptTransferFromBtc, RuneBridgeContract, RuneTransferToBtc, TapBridgeContract,
        TapTransfer, TransactionTracker, TransferToTap,
    },
    errors::{EvmError, EvmResult},
};

fn check_signatures(
    hash: &B256,
    signatures: &[Bytes],
    federators: &[Address],
    required: usize,
) -> EvmResult<()> {
    if signatures.len() < required {
        return Err(EvmError::Reverted(format!(
            "not enough signatures: {} < {required}",
            signatures.len()
        )));
    }
    let mut seen = HashSet::new();
    for signature in signatures {
        let signer = Signature::from_raw(signature)?.recover_address_from_msg(hash.as_slice())?;
        if !federators.contains(&signer) {
            return Err(EvmError::Reverted(format!("{signer} is not a federator")));
        }
        if !seen.insert(signer) {
            return Err(EvmError::Reverted(format!("duplicate signer {signer}")));
        }
    }
    Ok(())
}

fn next_tx_hash(counter: &mut u64) -> B256 {
    *counter += 1;
    keccak256(counter.to_be_bytes())
}

#[derive(Debug, Default)]
struct RuneBridgeState {
    federators: Vec<Address>,
    required: usize,
    frozen: bool,
    registered: HashSet<u128>,
    accepted: Vec<(AcceptTransferFromBtc, Vec<Bytes>)>,
    accept_error: Option<String>,
    receipts: HashMap<B256, bool>,
    pending: u64,
    block_number: u64,
    events: Vec<RuneTransferToBtc>,
    queried: Vec<(u64, u64)>,
    tx_counter: u64,
}

/// A scripted rune bridge contract. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockRuneBridge {
    state: Arc<Mutex<RuneBridgeState>>,
}

impl MockRuneBridge {
    /// A contract with the given federators and threshold.
    pub fn new(federators: Vec<Address>, required: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(RuneBridgeState {
                federators,
                required,
                ..Default::default()
            })),
        }
    }

    /// Registers a token for `rune_number`.
    pub fn register_rune(&self, rune_number: u128) {
        self.state.lock().registered.insert(rune_number);
    }

    /// Freezes or unfreezes the bridge.
    pub fn set_frozen(&self, frozen: bool) {
        self.state.lock().frozen = frozen;
    }

    /// Makes `acceptTransferFromBtc` fail with `reason` until cleared.
    pub fn fail_accepts(&self, reason: Option<&str>) {
        self.state.lock().accept_error = reason.map(str::to_string);
    }

    /// Sets the number of unmined transactions from our account.
    pub fn set_pending(&self, pending: u64) {
        self.state.lock().pending = pending;
    }

    /// Sets the chain height.
    pub fn set_block_number(&self, block_number: u64) {
        self.state.lock().block_number = block_number;
    }

    /// Adds an emitted event.
    pub fn push_event(&self, event: RuneTransferToBtc) {
        self.state.lock().events.push(event);
    }

    /// Block ranges passed to log queries.
    pub fn queried_ranges(&self) -> Vec<(u64, u64)> {
        self.state.lock().queried.clone()
    }

    /// Sets the outcome of `tx_hash`.
    pub fn set_receipt(&self, tx_hash: B256, success: bool) {
        self.state.lock().receipts.insert(tx_hash, success);
    }

    /// Transfers accepted so far, with their signatures.
    pub fn accepted(&self) -> Vec<(AcceptTransferFromBtc, Vec<Bytes>)> {
        self.state.lock().accepted.clone()
    }

    fn message_hash(transfer: &AcceptTransferFromBtc) -> B256 {
        keccak256(
            (
                transfer.evm_address,
                U256::from(transfer.rune_number),
                U256::from(transfer.net_rune_amount),
                transfer.btc_txid,
                U256::from(transfer.btc_vout),
            )
                .abi_encode_packed(),
        )
    }
}

#[async_trait]
impl FederatorSource for MockRuneBridge {
    async fn federators(&self) -> Result<Vec<Address>, FederatorLookupError> {
        Ok(self.state.lock().federators.clone())
    }
}

#[async_trait]
impl TransactionTracker for MockRuneBridge {
    async fn transaction_status(&self, tx_hash: B256) -> EvmResult<Option<bool>> {
        Ok(self.state.lock().receipts.get(&tx_hash).copied())
    }
}

#[async_trait]
impl RuneBridgeContract for MockRuneBridge {
    async fn is_federator(&self, account: Address) -> EvmResult<bool> {
        Ok(self.state.lock().federators.contains(&account))
    }

    async fn num_required_federators(&self) -> EvmResult<usize> {
        Ok(self.state.lock().required)
    }

    async fn frozen(&self) -> EvmResult<bool> {
        Ok(self.state.lock().frozen)
    }

    async fn is_rune_registered(&self, rune_number: u128) -> EvmResult<bool> {
        Ok(self.state.lock().registered.contains(&rune_number))
    }

    async fn accept_transfer_message_hash(
        &self,
        transfer: &AcceptTransferFromBtc,
    ) -> EvmResult<B256> {
        Ok(Self::message_hash(transfer))
    }

    async fn accept_transfer_from_btc(
        &self,
        transfer: &AcceptTransferFromBtc,
        signatures: Vec<Bytes>,
    ) -> EvmResult<B256> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.accept_error {
            return Err(EvmError::Reverted(reason.clone()));
        }
        if state.accepted.iter().any(|(t, _)| {
            t.btc_txid == transfer.btc_txid
                && t.btc_vout == transfer.btc_vout
                && t.rune_number == transfer.rune_number
        }) {
            return Err(EvmError::Reverted("already processed".to_string()));
        }
        check_signatures(
            &Self::message_hash(transfer),
            &signatures,
            &state.federators,
            state.required,
        )?;

        let tx_hash = next_tx_hash(&mut state.tx_counter);
        state.accepted.push((transfer.clone(), signatures));
        state.receipts.insert(tx_hash, true);
        Ok(tx_hash)
    }

    async fn pending_transaction_count(&self) -> EvmResult<u64> {
        Ok(self.state.lock().pending)
    }

    async fn block_number(&self) -> EvmResult<u64> {
        Ok(self.state.lock().block_number)
    }

    async fn rune_transfers_to_btc(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> EvmResult<Vec<RuneTransferToBtc>> {
        let mut state = self.state.lock();
        state.queried.push((from_block, to_block));
        Ok(state
            .events
            .iter()
            .filter(|e| (from_block..=to_block).contains(&e.block_number))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
struct TapBridgeState {
    federators: Vec<Address>,
    required: usize,
    processed: HashSet<(B256, u32)>,
    accepted: Vec<(TapTransfer, Vec<Bytes>)>,
    receipts: HashMap<B256, bool>,
    revert_receipts: bool,
    tx_counter: u64,
    block_number: u64,
    transfers_to_tap: Vec<TransferToTap>,
}

/// A scripted Taproot-Assets bridge contract. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockTapBridge {
    state: Arc<Mutex<TapBridgeState>>,
}

impl MockTapBridge {
    /// A contract with the given federators and threshold.
    pub fn new(federators: Vec<Address>, required: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(TapBridgeState {
                federators,
                required,
                ..Default::default()
            })),
        }
    }

    /// Marks a deposit as already credited.
    pub fn mark_processed(&self, btc_txid: B256, btc_vout: u32) {
        self.state.lock().processed.insert((btc_txid, btc_vout));
    }

    /// Makes every later submission revert once mined.
    pub fn revert_receipts(&self, revert: bool) {
        self.state.lock().revert_receipts = revert;
    }

    /// Sets the chain height.
    pub fn set_block_number(&self, block_number: u64) {
        self.state.lock().block_number = block_number;
    }

    /// Adds an emitted `TransferToTap` event.
    pub fn push_transfer_to_tap(&self, event: TransferToTap) {
        self.state.lock().transfers_to_tap.push(event);
    }

    /// Transfers accepted so far, with their signatures.
    pub fn accepted(&self) -> Vec<(TapTransfer, Vec<Bytes>)> {
        self.state.lock().accepted.clone()
    }

    /// The hash the contract expects signed for `transfer`.
    pub fn message_hash(transfer: &TapTransfer) -> B256 {
        keccak256(
            (
                transfer.evm_address,
                transfer.tap_address.clone(),
                transfer.btc_txid,
                U256::from(transfer.btc_vout),
            )
                .abi_encode_packed(),
        )
    }
}

#[async_trait]
impl FederatorSource for MockTapBridge {
    async fn federators(&self) -> Result<Vec<Address>, FederatorLookupError> {
        Ok(self.state.lock().federators.clone())
    }
}

#[async_trait]
impl TransactionTracker for MockTapBridge {
    async fn transaction_status(&self, tx_hash: B256) -> EvmResult<Option<bool>> {
        Ok(self.state.lock().receipts.get(&tx_hash).copied())
    }
}

#[async_trait]
impl TapBridgeContract for MockTapBridge {
    async fn num_required_signers(&self) -> EvmResult<usize> {
        Ok(self.state.lock().required)
    }

    async fn is_processed(&self, btc_txid: B256, btc_vout: u32) -> EvmResult<bool> {
        Ok(self.state.lock().processed.contains(&(btc_txid, btc_vout)))
    }

    async fn transfer_message_hash(&self, transfer: &TapTransfer) -> EvmResult<B256> {
        Ok(Self::message_hash(transfer))
    }

    async fn accept_transfer_from_tap(
        &self,
        transfer: &TapTransfer,
        signatures: Vec<Bytes>,
    ) -> EvmResult<B256> {
        let mut state = self.state.lock();
        if state
            .processed
            .contains(&(transfer.btc_txid, transfer.btc_vout))
        {
            return Err(EvmError::Reverted("already processed".to_string()));
        }
        check_signatures(
            &Self::message_hash(transfer),
            &signatures,
            &state.federators,
            state.required,
        )?;

        let tx_hash = next_tx_hash(&mut state.tx_counter);
        let success = !state.revert_receipts;
        state.receipts.insert(tx_hash, success);
        if success {
            state
                .processed
                .insert((transfer.btc_txid, transfer.btc_vout));
        }
        state.accepted.push((transfer.clone(), signatures));
        Ok(tx_hash)
    }

    async fn block_number(&self) -> EvmResult<u64> {
        Ok(self.state.lock().block_number)
    }

    async fn transfers_to_tap(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> EvmResult<Vec<TransferToTap>> {
        Ok(self
            .state
            .lock()
            .transfers_to_tap
            .iter()
            .filter(|e| (from_block..=to_block).contains(&e.block_number))
            .cloned()
            .collect())
    }
}
