//! Rune bridge records. Every call is scoped to one bridge name.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use bitcoin::Txid;

use crate::{
    errors::DbResult,
    types::{
        DepositAddressRecord, IncomingBtcTx, NewRuneDeposit, NewRuneTokenDeposit, RuneDeposit,
        RuneDepositStatus, RuneTokenDeposit, RuneTokenDepositStatus,
    },
};

/// Storage for the rune bridge.
#[async_trait]
pub trait RuneBridgeDb {
    /// The deposit address handed out to `evm_address`.
    async fn get_deposit_address(
        &self,
        bridge: &str,
        evm_address: Address,
    ) -> DbResult<Option<DepositAddressRecord>>;

    /// The deposit address record for a BTC address.
    async fn get_deposit_address_by_btc(
        &self,
        bridge: &str,
        btc_address: &str,
    ) -> DbResult<Option<DepositAddressRecord>>;

    /// Stores a deposit address. An EVM account keeps the first address it was given, which is
    /// returned.
    async fn insert_deposit_address(
        &self,
        bridge: &str,
        record: DepositAddressRecord,
    ) -> DbResult<DepositAddressRecord>;

    /// Every deposit address of the bridge.
    async fn deposit_addresses(&self, bridge: &str) -> DbResult<Vec<DepositAddressRecord>>;

    /// Inserts or refreshes an incoming output. Returns whether it was new. The status only
    /// moves forward.
    async fn upsert_incoming_btc_tx(&self, bridge: &str, tx: IncomingBtcTx) -> DbResult<bool>;

    /// The incoming output at `txid:vout`.
    async fn get_incoming_btc_tx(
        &self,
        bridge: &str,
        txid: Txid,
        vout: u32,
    ) -> DbResult<Option<IncomingBtcTx>>;

    /// Inserts or refreshes the deposit keyed by `(txid, vout, rune_number)`. An existing
    /// deposit keeps its signatures and only takes the new status if it is a forward move out of
    /// `Detected`.
    async fn upsert_rune_deposit(
        &self,
        bridge: &str,
        deposit: NewRuneDeposit,
    ) -> DbResult<RuneDeposit>;

    /// A deposit by id.
    async fn get_rune_deposit(&self, bridge: &str, id: i64) -> DbResult<Option<RuneDeposit>>;

    /// Deposits in `status`, oldest first.
    async fn rune_deposits_by_status(
        &self,
        bridge: &str,
        status: RuneDepositStatus,
    ) -> DbResult<Vec<RuneDeposit>>;

    /// Records the signed message hash and adds signatures from signers not yet present.
    async fn add_rune_deposit_signatures(
        &self,
        bridge: &str,
        id: i64,
        message_hash: B256,
        signatures: &[(Address, String)],
    ) -> DbResult<RuneDeposit>;

    /// Moves a deposit to `status`, recording the mint transaction if given.
    async fn set_rune_deposit_status(
        &self,
        bridge: &str,
        id: i64,
        status: RuneDepositStatus,
        evm_tx_hash: Option<B256>,
    ) -> DbResult<()>;

    /// Stores a burn unless one with the same `(evm_tx_hash, log_index)` exists. Returns whether
    /// it was new.
    async fn insert_rune_token_deposit(
        &self,
        bridge: &str,
        deposit: NewRuneTokenDeposit,
    ) -> DbResult<bool>;

    /// The burn emitted at `(evm_tx_hash, log_index)`.
    async fn get_rune_token_deposit_by_event(
        &self,
        bridge: &str,
        evm_tx_hash: B256,
        log_index: u64,
    ) -> DbResult<Option<RuneTokenDeposit>>;

    /// Burns in `status`, oldest first.
    async fn rune_token_deposits_by_status(
        &self,
        bridge: &str,
        status: RuneTokenDepositStatus,
    ) -> DbResult<Vec<RuneTokenDeposit>>;

    /// Moves a burn to `status`, recording the finalized PSBT and payout txid if given.
    async fn set_rune_token_deposit_status(
        &self,
        bridge: &str,
        id: i64,
        status: RuneTokenDepositStatus,
        finalized_psbt: Option<String>,
        btc_txid: Option<Txid>,
    ) -> DbResult<()>;
}
