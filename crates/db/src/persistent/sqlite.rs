//! SQLite implementation of the persistent storage layer.

use std::{
    collections::{BTreeMap, HashSet},
    fmt::Display,
    future::Future,
    path::Path,
    str::FromStr,
};

use alloy::{
    hex,
    primitives::{Address, B256, U256},
};
use async_trait::async_trait;
use bitcoin::{Amount, OutPoint, Txid};
use federator_common::retry::{retry_with, RetryAction, Strategy};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use tracing::{info, warn};

use super::{config::DbConfig, errors::StorageError};
use crate::{
    batches::{EvmToTapDb, TapBridgeDb},
    claims::SignedClaimsDb,
    errors::{DbError, DbResult},
    kv::KeyValueStore,
    runes::RuneBridgeDb,
    types::{
        check_transition, BatchSignatures, BatchStatus, BatchTransfer, DepositAddressRecord,
        EvmToTapBatch, EvmToTapBatchStatus, EvmToTapTransfer, IncomingBtcTx, IncomingBtcTxStatus,
        NewEvmToTapTransfer, NewRuneDeposit, NewRuneTokenDeposit, RuneDeposit, RuneDepositStatus,
        RuneTokenDeposit, RuneTokenDepositStatus, SignedClaim, Status, TapDepositAddress,
        TransferBatch,
    },
};

const RUNE_DEPOSIT_COLUMNS: &str = "id, txid, vout, rune_number, rune_id, spaced_rune, \
    evm_address, block_number, postage_sat, transfer_amount, net_amount, message_hash, \
    signatures, evm_tx_hash, status";

const RUNE_TOKEN_DEPOSIT_COLUMNS: &str = "id, evm_tx_hash, log_index, block_number, \
    user_evm_address, receiver_btc_address, rune_number, spaced_rune, token_address, \
    net_rune_amount, transferred_token_amount, btc_txid, finalized_psbt, status";

const BATCH_TRANSFER_COLUMNS: &str =
    "counter, evm_address, tap_address, deposit_txid, deposit_vout, batch_id";

const TRANSFER_BATCH_COLUMNS: &str = "id, hash, status, signatures, executed_tx_hash";

const EVM_TO_TAP_TRANSFER_COLUMNS: &str = "counter, sender_evm_address, recipient_tap_address, \
    evm_tx_hash, block_number, log_index, batch_id";

const EVM_TO_TAP_BATCH_COLUMNS: &str = "id, hash, status, sending_result";

/// Store backed by a SQLite pool. Writes that hit a busy or locked database are retried per
/// [`DbConfig`].
#[derive(Debug, Clone)]
pub struct SqliteDb {
    pool: SqlitePool,
    config: DbConfig,
    retry_strategy: Strategy<DbError>,
}

impl SqliteDb {
    /// Wraps an already migrated pool.
    pub fn new(pool: SqlitePool, config: DbConfig) -> Self {
        let backoff = config.backoff_period();
        let retry_strategy = Strategy::new(move |err: &DbError, attempt| {
            if is_busy(err) {
                warn!(%err, %attempt, "database busy, retrying");
                RetryAction::Retry(backoff)
            } else {
                RetryAction::Stop
            }
        })
        .with_max_retries(config.max_retry_count());

        Self {
            pool,
            config,
            retry_strategy,
        }
    }

    /// Opens (creating if needed) the database file at `path` in WAL mode and applies the
    /// embedded migrations.
    pub async fn connect(path: &Path, config: DbConfig) -> DbResult<Self> {
        let connect_options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .connect_with(connect_options)
            .await?;

        info!(action = "running migrations", path = %path.display());
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(StorageError::from)?;

        Ok(Self::new(pool, config))
    }

    /// The retry configuration.
    pub const fn config(&self) -> &DbConfig {
        &self.config
    }

    async fn retrying<T, F, Fut>(&self, op: F) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        retry_with(&self.retry_strategy, op).await
    }

    async fn batch_from_row(&self, row: &SqliteRow) -> DbResult<TransferBatch> {
        let id: i64 = row.try_get("id")?;
        let rows = sqlx::query(&format!(
            "SELECT {BATCH_TRANSFER_COLUMNS} FROM batch_transfer WHERE batch_id = ? ORDER BY counter"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        let transfers = rows
            .iter()
            .map(batch_transfer_from_row)
            .collect::<DbResult<Vec<_>>>()?;

        Ok(TransferBatch {
            id,
            hash: parse_column(row, "hash")?,
            status: status_column(row, "status")?,
            signatures: decode_signatures(row.try_get("signatures")?)?,
            transfers,
            executed_tx_hash: parse_optional_column(row, "executed_tx_hash")?,
        })
    }

    async fn evm_to_tap_batch_from_row(&self, row: &SqliteRow) -> DbResult<EvmToTapBatch> {
        let id: i64 = row.try_get("id")?;
        let transfers = sqlx::query(&format!(
            "SELECT {EVM_TO_TAP_TRANSFER_COLUMNS} FROM evm_to_tap_transfer
             WHERE batch_id = ? ORDER BY counter"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(evm_to_tap_transfer_from_row)
        .collect::<DbResult<Vec<_>>>()?;

        Ok(EvmToTapBatch {
            id,
            hash: parse_column(row, "hash")?,
            status: status_column(row, "status")?,
            transfers,
            sending_result: row.try_get("sending_result")?,
        })
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_busy(err: &DbError) -> bool {
    let DbError::Storage(StorageError::Driver(sqlx::Error::Database(db_err))) = err else {
        return false;
    };
    db_err
        .code()
        .and_then(|code| code.parse::<i64>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}

fn mismatched(column: &str, err: impl Display) -> DbError {
    StorageError::MismatchedTypes(format!("{column}: {err}")).into()
}

fn parse_column<T>(row: &SqliteRow, column: &str) -> DbResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e| mismatched(column, e))
}

fn parse_optional_column<T>(row: &SqliteRow, column: &str) -> DbResult<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|raw| raw.parse().map_err(|e| mismatched(column, e)))
        .transpose()
}

fn status_column<S: Status>(row: &SqliteRow, column: &str) -> DbResult<S> {
    let code: i64 = row.try_get(column)?;
    S::from_code(code).ok_or_else(|| mismatched(column, format!("unknown status code {code}")))
}

fn u64_column(row: &SqliteRow, column: &str) -> DbResult<u64> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value).map_err(|e| mismatched(column, e))
}

fn optional_u64_column(row: &SqliteRow, column: &str) -> DbResult<Option<u64>> {
    let value: Option<i64> = row.try_get(column)?;
    value
        .map(|v| u64::try_from(v).map_err(|e| mismatched(column, e)))
        .transpose()
}

fn u32_column(row: &SqliteRow, column: &str) -> DbResult<u32> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).map_err(|e| mismatched(column, e))
}

fn to_i64(value: u64) -> DbResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidData(format!("{value} does not fit a column")).into())
}

fn encode_hash(hash: &B256) -> String {
    hex::encode_prefixed(hash)
}

fn encode_address(address: &Address) -> String {
    address.to_checksum(None)
}

fn encode_signatures<V: Serialize>(signatures: &BTreeMap<Address, V>) -> DbResult<String> {
    let by_signer: BTreeMap<String, &V> = signatures
        .iter()
        .map(|(signer, sig)| (encode_address(signer), sig))
        .collect();
    serde_json::to_string(&by_signer)
        .map_err(|e| StorageError::InvalidData(e.to_string()).into())
}

fn decode_signatures<V: DeserializeOwned>(raw: String) -> DbResult<BTreeMap<Address, V>> {
    let by_signer: BTreeMap<String, V> =
        serde_json::from_str(&raw).map_err(|e| mismatched("signatures", e))?;
    by_signer
        .into_iter()
        .map(|(signer, sig)| {
            let signer = signer.parse().map_err(|e| mismatched("signatures", e))?;
            Ok::<_, DbError>((signer, sig))
        })
        .collect()
}

fn deposit_address_from_row(row: &SqliteRow) -> DbResult<DepositAddressRecord> {
    Ok(DepositAddressRecord {
        evm_address: parse_column(row, "evm_address")?,
        btc_address: row.try_get("btc_address")?,
        index: u32_column(row, "idx")?,
    })
}

fn incoming_from_row(row: &SqliteRow) -> DbResult<IncomingBtcTx> {
    Ok(IncomingBtcTx {
        txid: parse_column(row, "txid")?,
        vout: u32_column(row, "vout")?,
        address: row.try_get("address")?,
        amount: Amount::from_sat(u64_column(row, "amount_sat")?),
        block_number: optional_u64_column(row, "block_number")?,
        time: u64_column(row, "time")?,
        status: status_column(row, "status")?,
    })
}

fn rune_deposit_from_row(row: &SqliteRow) -> DbResult<RuneDeposit> {
    Ok(RuneDeposit {
        id: row.try_get("id")?,
        txid: parse_column(row, "txid")?,
        vout: u32_column(row, "vout")?,
        rune_number: parse_column(row, "rune_number")?,
        rune_id: row.try_get("rune_id")?,
        spaced_rune: row.try_get("spaced_rune")?,
        evm_address: parse_column(row, "evm_address")?,
        block_number: optional_u64_column(row, "block_number")?,
        postage: Amount::from_sat(u64_column(row, "postage_sat")?),
        transfer_amount: parse_column(row, "transfer_amount")?,
        net_amount: parse_column(row, "net_amount")?,
        message_hash: parse_optional_column(row, "message_hash")?,
        signatures: decode_signatures(row.try_get("signatures")?)?,
        evm_tx_hash: parse_optional_column(row, "evm_tx_hash")?,
        status: status_column(row, "status")?,
    })
}

fn rune_token_deposit_from_row(row: &SqliteRow) -> DbResult<RuneTokenDeposit> {
    Ok(RuneTokenDeposit {
        id: row.try_get("id")?,
        evm_tx_hash: parse_column(row, "evm_tx_hash")?,
        log_index: u64_column(row, "log_index")?,
        block_number: u64_column(row, "block_number")?,
        user_evm_address: parse_column(row, "user_evm_address")?,
        receiver_btc_address: row.try_get("receiver_btc_address")?,
        rune_number: parse_column(row, "rune_number")?,
        spaced_rune: row.try_get("spaced_rune")?,
        token_address: parse_column(row, "token_address")?,
        net_rune_amount: parse_column(row, "net_rune_amount")?,
        transferred_token_amount: parse_column::<U256>(row, "transferred_token_amount")?,
        btc_txid: parse_optional_column(row, "btc_txid")?,
        finalized_psbt: row.try_get("finalized_psbt")?,
        status: status_column(row, "status")?,
    })
}

fn batch_transfer_from_row(row: &SqliteRow) -> DbResult<BatchTransfer> {
    Ok(BatchTransfer {
        counter: u64_column(row, "counter")?,
        evm_address: parse_column(row, "evm_address")?,
        tap_address: row.try_get("tap_address")?,
        deposit_outpoint: OutPoint {
            txid: parse_column(row, "deposit_txid")?,
            vout: u32_column(row, "deposit_vout")?,
        },
        batch_id: row.try_get("batch_id")?,
    })
}

fn evm_to_tap_transfer_from_row(row: &SqliteRow) -> DbResult<EvmToTapTransfer> {
    Ok(EvmToTapTransfer {
        counter: u64_column(row, "counter")?,
        sender_evm_address: parse_column(row, "sender_evm_address")?,
        recipient_tap_address: row.try_get("recipient_tap_address")?,
        evm_tx_hash: parse_column(row, "evm_tx_hash")?,
        block_number: u64_column(row, "block_number")?,
        log_index: u64_column(row, "log_index")?,
        batch_id: row.try_get("batch_id")?,
    })
}

#[async_trait]
impl KeyValueStore for SqliteDb {
    async fn get_value(&self, key: &str) -> DbResult<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM key_value_pair WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_value(&self, key: &str, value: &str) -> DbResult<()> {
        let pool = &self.pool;
        self.retrying(|| async move {
            sqlx::query(
                "INSERT INTO key_value_pair (key, value) VALUES (?, ?)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(pool)
            .await?;
            Ok::<_, DbError>(())
        })
        .await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> DbResult<bool> {
        let pool = &self.pool;
        self.retrying(|| async move {
            let result = match expected {
                Some(expected) => {
                    sqlx::query("UPDATE key_value_pair SET value = ? WHERE key = ? AND value = ?")
                        .bind(value)
                        .bind(key)
                        .bind(expected)
                        .execute(pool)
                        .await?
                }
                None => {
                    sqlx::query(
                        "INSERT INTO key_value_pair (key, value) VALUES (?, ?)
                         ON CONFLICT (key) DO NOTHING",
                    )
                    .bind(key)
                    .bind(value)
                    .execute(pool)
                    .await?
                }
            };
            Ok::<_, DbError>(result.rows_affected() == 1)
        })
        .await
    }
}

#[async_trait]
impl RuneBridgeDb for SqliteDb {
    async fn get_deposit_address(
        &self,
        bridge: &str,
        evm_address: Address,
    ) -> DbResult<Option<DepositAddressRecord>> {
        sqlx::query(
            "SELECT evm_address, btc_address, idx FROM deposit_address
             WHERE bridge = ? AND evm_address = ?",
        )
        .bind(bridge)
        .bind(encode_address(&evm_address))
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(deposit_address_from_row)
        .transpose()
    }

    async fn get_deposit_address_by_btc(
        &self,
        bridge: &str,
        btc_address: &str,
    ) -> DbResult<Option<DepositAddressRecord>> {
        sqlx::query(
            "SELECT evm_address, btc_address, idx FROM deposit_address
             WHERE bridge = ? AND btc_address = ?",
        )
        .bind(bridge)
        .bind(btc_address)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(deposit_address_from_row)
        .transpose()
    }

    async fn insert_deposit_address(
        &self,
        bridge: &str,
        record: DepositAddressRecord,
    ) -> DbResult<DepositAddressRecord> {
        let pool = &self.pool;
        let evm_address = encode_address(&record.evm_address);
        let evm_address = evm_address.as_str();
        let record = &record;
        self.retrying(|| async move {
            let mut tx = pool.begin().await?;

            let existing = sqlx::query(
                "SELECT evm_address, btc_address, idx FROM deposit_address
                 WHERE bridge = ? AND evm_address = ?",
            )
            .bind(bridge)
            .bind(evm_address)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(existing) = existing {
                return deposit_address_from_row(&existing);
            }

            let taken: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM deposit_address WHERE btc_address = ?")
                    .bind(&record.btc_address)
                    .fetch_optional(&mut *tx)
                    .await?;
            if taken.is_some() {
                return Err(DbError::Conflict(format!(
                    "deposit address {} already assigned",
                    record.btc_address
                )));
            }

            sqlx::query(
                "INSERT INTO deposit_address (bridge, evm_address, btc_address, idx)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(bridge)
            .bind(evm_address)
            .bind(&record.btc_address)
            .bind(i64::from(record.index))
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            Ok::<_, DbError>(record.clone())
        })
        .await
    }

    async fn deposit_addresses(&self, bridge: &str) -> DbResult<Vec<DepositAddressRecord>> {
        sqlx::query(
            "SELECT evm_address, btc_address, idx FROM deposit_address
             WHERE bridge = ? ORDER BY idx",
        )
        .bind(bridge)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(deposit_address_from_row)
        .collect()
    }

    async fn upsert_incoming_btc_tx(&self, bridge: &str, btc_tx: IncomingBtcTx) -> DbResult<bool> {
        let pool = &self.pool;
        let txid = btc_tx.txid.to_string();
        let txid = txid.as_str();
        let amount = to_i64(btc_tx.amount.to_sat())?;
        let block_number = btc_tx.block_number.map(to_i64).transpose()?;
        let time = to_i64(btc_tx.time)?;
        let btc_tx = &btc_tx;
        self.retrying(|| async move {
            let mut tx = pool.begin().await?;

            let existing: Option<i64> = sqlx::query_scalar(
                "SELECT status FROM incoming_btc_tx WHERE bridge = ? AND txid = ? AND vout = ?",
            )
            .bind(bridge)
            .bind(txid)
            .bind(i64::from(btc_tx.vout))
            .fetch_optional(&mut *tx)
            .await?;

            let status = match existing.and_then(IncomingBtcTxStatus::from_code) {
                Some(current) if !current.can_transition_to(btc_tx.status) => current,
                _ => btc_tx.status,
            };

            sqlx::query(
                "INSERT INTO incoming_btc_tx
                 (bridge, txid, vout, address, amount_sat, block_number, time, status)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (bridge, txid, vout) DO UPDATE SET
                 address = excluded.address, amount_sat = excluded.amount_sat,
                 block_number = excluded.block_number, time = excluded.time,
                 status = excluded.status",
            )
            .bind(bridge)
            .bind(txid)
            .bind(i64::from(btc_tx.vout))
            .bind(&btc_tx.address)
            .bind(amount)
            .bind(block_number)
            .bind(time)
            .bind(status.code())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            Ok::<_, DbError>(existing.is_none())
        })
        .await
    }

    async fn get_incoming_btc_tx(
        &self,
        bridge: &str,
        txid: Txid,
        vout: u32,
    ) -> DbResult<Option<IncomingBtcTx>> {
        sqlx::query(
            "SELECT txid, vout, address, amount_sat, block_number, time, status
             FROM incoming_btc_tx WHERE bridge = ? AND txid = ? AND vout = ?",
        )
        .bind(bridge)
        .bind(txid.to_string())
        .bind(i64::from(vout))
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(incoming_from_row)
        .transpose()
    }

    async fn upsert_rune_deposit(
        &self,
        bridge: &str,
        deposit: NewRuneDeposit,
    ) -> DbResult<RuneDeposit> {
        let pool = &self.pool;
        let txid = deposit.txid.to_string();
        let txid = txid.as_str();
        let rune_number = deposit.rune_number.to_string();
        let rune_number = rune_number.as_str();
        let evm_address = encode_address(&deposit.evm_address);
        let evm_address = evm_address.as_str();
        let transfer_amount = deposit.transfer_amount.to_string();
        let transfer_amount = transfer_amount.as_str();
        let net_amount = deposit.net_amount.to_string();
        let net_amount = net_amount.as_str();
        let postage = to_i64(deposit.postage.to_sat())?;
        let block_number = deposit.block_number.map(to_i64).transpose()?;
        let deposit = &deposit;
        self.retrying(|| async move {
            let mut tx = pool.begin().await?;

            let existing = sqlx::query(
                "SELECT id, status FROM rune_deposit
                 WHERE bridge = ? AND txid = ? AND vout = ? AND rune_number = ?",
            )
            .bind(bridge)
            .bind(txid)
            .bind(i64::from(deposit.vout))
            .bind(rune_number)
            .fetch_optional(&mut *tx)
            .await?;

            let id = match existing {
                Some(row) => {
                    let id: i64 = row.try_get("id")?;
                    let current: RuneDepositStatus = status_column(&row, "status")?;
                    let status = if current == RuneDepositStatus::Detected
                        && deposit.status == RuneDepositStatus::Accepted
                    {
                        RuneDepositStatus::Accepted
                    } else {
                        current
                    };
                    sqlx::query(
                        "UPDATE rune_deposit SET evm_address = ?, block_number = ?,
                         postage_sat = ?, transfer_amount = ?, net_amount = ?, status = ?
                         WHERE id = ?",
                    )
                    .bind(evm_address)
                    .bind(block_number)
                    .bind(postage)
                    .bind(transfer_amount)
                    .bind(net_amount)
                    .bind(status.code())
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    id
                }
                None => sqlx::query(
                    "INSERT INTO rune_deposit
                     (bridge, txid, vout, rune_number, rune_id, spaced_rune, evm_address,
                      block_number, postage_sat, transfer_amount, net_amount, status)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(bridge)
                .bind(txid)
                .bind(i64::from(deposit.vout))
                .bind(rune_number)
                .bind(&deposit.rune_id)
                .bind(&deposit.spaced_rune)
                .bind(evm_address)
                .bind(block_number)
                .bind(postage)
                .bind(transfer_amount)
                .bind(net_amount)
                .bind(deposit.status.code())
                .execute(&mut *tx)
                .await?
                .last_insert_rowid(),
            };

            let row = sqlx::query(&format!(
                "SELECT {RUNE_DEPOSIT_COLUMNS} FROM rune_deposit WHERE id = ?"
            ))
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;

            rune_deposit_from_row(&row)
        })
        .await
    }

    async fn get_rune_deposit(&self, bridge: &str, id: i64) -> DbResult<Option<RuneDeposit>> {
        sqlx::query(&format!(
            "SELECT {RUNE_DEPOSIT_COLUMNS} FROM rune_deposit WHERE bridge = ? AND id = ?"
        ))
        .bind(bridge)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(rune_deposit_from_row)
        .transpose()
    }

    async fn rune_deposits_by_status(
        &self,
        bridge: &str,
        status: RuneDepositStatus,
    ) -> DbResult<Vec<RuneDeposit>> {
        sqlx::query(&format!(
            "SELECT {RUNE_DEPOSIT_COLUMNS} FROM rune_deposit
             WHERE bridge = ? AND status = ? ORDER BY id"
        ))
        .bind(bridge)
        .bind(status.code())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(rune_deposit_from_row)
        .collect()
    }

    async fn add_rune_deposit_signatures(
        &self,
        bridge: &str,
        id: i64,
        message_hash: B256,
        signatures: &[(Address, String)],
    ) -> DbResult<RuneDeposit> {
        let pool = &self.pool;
        let encoded_hash = encode_hash(&message_hash);
        let encoded_hash = encoded_hash.as_str();
        self.retrying(|| async move {
            let mut tx = pool.begin().await?;

            let row = sqlx::query(&format!(
                "SELECT {RUNE_DEPOSIT_COLUMNS} FROM rune_deposit WHERE bridge = ? AND id = ?"
            ))
            .bind(bridge)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("rune deposit {id}")))?;
            let mut deposit = rune_deposit_from_row(&row)?;

            for (signer, signature) in signatures {
                deposit
                    .signatures
                    .entry(*signer)
                    .or_insert_with(|| signature.clone());
            }
            let encoded = encode_signatures(&deposit.signatures)?;

            sqlx::query("UPDATE rune_deposit SET message_hash = ?, signatures = ? WHERE id = ?")
                .bind(encoded_hash)
                .bind(encoded)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            deposit.message_hash = Some(message_hash);
            Ok::<_, DbError>(deposit)
        })
        .await
    }

    async fn set_rune_deposit_status(
        &self,
        bridge: &str,
        id: i64,
        status: RuneDepositStatus,
        evm_tx_hash: Option<B256>,
    ) -> DbResult<()> {
        let pool = &self.pool;
        let evm_tx_hash = evm_tx_hash.as_ref().map(encode_hash);
        let evm_tx_hash = evm_tx_hash.as_deref();
        self.retrying(|| async move {
            let mut tx = pool.begin().await?;

            let current: i64 =
                sqlx::query_scalar("SELECT status FROM rune_deposit WHERE bridge = ? AND id = ?")
                    .bind(bridge)
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| DbError::NotFound(format!("rune deposit {id}")))?;
            let current = RuneDepositStatus::from_code(current)
                .ok_or_else(|| mismatched("status", format!("unknown status code {current}")))?;
            check_transition(id, current, status)?;

            sqlx::query(
                "UPDATE rune_deposit SET status = ?, evm_tx_hash = COALESCE(?, evm_tx_hash)
                 WHERE id = ?",
            )
            .bind(status.code())
            .bind(evm_tx_hash)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            Ok::<_, DbError>(())
        })
        .await
    }

    async fn insert_rune_token_deposit(
        &self,
        bridge: &str,
        deposit: NewRuneTokenDeposit,
    ) -> DbResult<bool> {
        let pool = &self.pool;
        let evm_tx_hash = encode_hash(&deposit.evm_tx_hash);
        let evm_tx_hash = evm_tx_hash.as_str();
        let log_index = to_i64(deposit.log_index)?;
        let block_number = to_i64(deposit.block_number)?;
        let user_evm_address = encode_address(&deposit.user_evm_address);
        let user_evm_address = user_evm_address.as_str();
        let rune_number = deposit.rune_number.to_string();
        let rune_number = rune_number.as_str();
        let token_address = encode_address(&deposit.token_address);
        let token_address = token_address.as_str();
        let net_rune_amount = deposit.net_rune_amount.to_string();
        let net_rune_amount = net_rune_amount.as_str();
        let transferred = deposit.transferred_token_amount.to_string();
        let transferred = transferred.as_str();
        let deposit = &deposit;
        self.retrying(|| async move {
            let result = sqlx::query(
                "INSERT INTO rune_token_deposit
                 (bridge, evm_tx_hash, log_index, block_number, user_evm_address,
                  receiver_btc_address, rune_number, spaced_rune, token_address,
                  net_rune_amount, transferred_token_amount, status)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (bridge, evm_tx_hash, log_index) DO NOTHING",
            )
            .bind(bridge)
            .bind(evm_tx_hash)
            .bind(log_index)
            .bind(block_number)
            .bind(user_evm_address)
            .bind(&deposit.receiver_btc_address)
            .bind(rune_number)
            .bind(&deposit.spaced_rune)
            .bind(token_address)
            .bind(net_rune_amount)
            .bind(transferred)
            .bind(deposit.status.code())
            .execute(pool)
            .await?;
            Ok::<_, DbError>(result.rows_affected() == 1)
        })
        .await
    }

    async fn get_rune_token_deposit_by_event(
        &self,
        bridge: &str,
        evm_tx_hash: B256,
        log_index: u64,
    ) -> DbResult<Option<RuneTokenDeposit>> {
        sqlx::query(&format!(
            "SELECT {RUNE_TOKEN_DEPOSIT_COLUMNS} FROM rune_token_deposit
             WHERE bridge = ? AND evm_tx_hash = ? AND log_index = ?"
        ))
        .bind(bridge)
        .bind(encode_hash(&evm_tx_hash))
        .bind(to_i64(log_index)?)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(rune_token_deposit_from_row)
        .transpose()
    }

    async fn rune_token_deposits_by_status(
        &self,
        bridge: &str,
        status: RuneTokenDepositStatus,
    ) -> DbResult<Vec<RuneTokenDeposit>> {
        sqlx::query(&format!(
            "SELECT {RUNE_TOKEN_DEPOSIT_COLUMNS} FROM rune_token_deposit
             WHERE bridge = ? AND status = ? ORDER BY id"
        ))
        .bind(bridge)
        .bind(status.code())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(rune_token_deposit_from_row)
        .collect()
    }

    async fn set_rune_token_deposit_status(
        &self,
        bridge: &str,
        id: i64,
        status: RuneTokenDepositStatus,
        finalized_psbt: Option<String>,
        btc_txid: Option<Txid>,
    ) -> DbResult<()> {
        let pool = &self.pool;
        let finalized_psbt = finalized_psbt.as_deref();
        let btc_txid = btc_txid.map(|txid| txid.to_string());
        let btc_txid = btc_txid.as_deref();
        self.retrying(|| async move {
            let mut tx = pool.begin().await?;

            let current: i64 = sqlx::query_scalar(
                "SELECT status FROM rune_token_deposit WHERE bridge = ? AND id = ?",
            )
            .bind(bridge)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("rune token deposit {id}")))?;
            let current = RuneTokenDepositStatus::from_code(current)
                .ok_or_else(|| mismatched("status", format!("unknown status code {current}")))?;
            check_transition(id, current, status)?;

            sqlx::query(
                "UPDATE rune_token_deposit SET status = ?,
                 finalized_psbt = COALESCE(?, finalized_psbt), btc_txid = COALESCE(?, btc_txid)
                 WHERE id = ?",
            )
            .bind(status.code())
            .bind(finalized_psbt)
            .bind(btc_txid)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            Ok::<_, DbError>(())
        })
        .await
    }
}

#[async_trait]
impl TapBridgeDb for SqliteDb {
    async fn add_tap_deposit_address(&self, address: TapDepositAddress) -> DbResult<()> {
        let pool = &self.pool;
        let evm_address = encode_address(&address.evm_address);
        let evm_address = evm_address.as_str();
        let tap_address = address.tap_address.as_str();
        let inserted = self
            .retrying(|| async move {
                let result = sqlx::query(
                    "INSERT INTO tap_deposit_address (tap_address, evm_address) VALUES (?, ?)
                     ON CONFLICT (tap_address) DO NOTHING",
                )
                .bind(tap_address)
                .bind(evm_address)
                .execute(pool)
                .await?;
                Ok::<_, DbError>(result.rows_affected() == 1)
            })
            .await?;

        if !inserted {
            return Err(DbError::Conflict(format!(
                "tap address {tap_address} already stored"
            )));
        }
        Ok(())
    }

    async fn tap_deposit_addresses(&self) -> DbResult<Vec<TapDepositAddress>> {
        sqlx::query("SELECT tap_address, evm_address FROM tap_deposit_address ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| {
                Ok::<_, DbError>(TapDepositAddress {
                    evm_address: parse_column(row, "evm_address")?,
                    tap_address: row.try_get("tap_address")?,
                })
            })
            .collect()
    }

    async fn known_deposit_outpoints(&self) -> DbResult<HashSet<OutPoint>> {
        sqlx::query("SELECT deposit_txid, deposit_vout FROM batch_transfer")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| {
                Ok::<_, DbError>(OutPoint {
                    txid: parse_column(row, "deposit_txid")?,
                    vout: u32_column(row, "deposit_vout")?,
                })
            })
            .collect()
    }

    async fn insert_batch_transfer(
        &self,
        evm_address: Address,
        tap_address: &str,
        deposit_outpoint: OutPoint,
    ) -> DbResult<bool> {
        let pool = &self.pool;
        let evm_address = encode_address(&evm_address);
        let evm_address = evm_address.as_str();
        let txid = deposit_outpoint.txid.to_string();
        let txid = txid.as_str();
        let vout = i64::from(deposit_outpoint.vout);
        self.retrying(|| async move {
            let result = sqlx::query(
                "INSERT INTO batch_transfer (evm_address, tap_address, deposit_txid, deposit_vout)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (deposit_txid, deposit_vout) DO NOTHING",
            )
            .bind(evm_address)
            .bind(tap_address)
            .bind(txid)
            .bind(vout)
            .execute(pool)
            .await?;
            Ok::<_, DbError>(result.rows_affected() == 1)
        })
        .await
    }

    async fn unbatched_transfers(&self, limit: usize) -> DbResult<Vec<BatchTransfer>> {
        sqlx::query(&format!(
            "SELECT {BATCH_TRANSFER_COLUMNS} FROM batch_transfer
             WHERE batch_id IS NULL ORDER BY counter LIMIT ?"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(batch_transfer_from_row)
        .collect()
    }

    async fn current_batch(&self) -> DbResult<Option<TransferBatch>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_BATCH_COLUMNS} FROM transfer_batch
             WHERE status != ? ORDER BY id LIMIT 1"
        ))
        .bind(BatchStatus::Finalized.code())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.batch_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn create_batch(&self, hash: B256, counters: &[u64]) -> DbResult<TransferBatch> {
        let pool = &self.pool;
        let encoded_hash = encode_hash(&hash);
        let encoded_hash = encoded_hash.as_str();
        let counters = counters
            .iter()
            .map(|counter| to_i64(*counter))
            .collect::<DbResult<Vec<_>>>()?;
        let counters = counters.as_slice();

        let id = self
            .retrying(|| async move {
                let mut tx = pool.begin().await?;

                let exists: Option<i64> =
                    sqlx::query_scalar("SELECT id FROM transfer_batch WHERE hash = ?")
                        .bind(encoded_hash)
                        .fetch_optional(&mut *tx)
                        .await?;
                if exists.is_some() {
                    return Err(DbError::Conflict(format!(
                        "batch {encoded_hash} already exists"
                    )));
                }

                let id = sqlx::query(
                    "INSERT INTO transfer_batch (hash, status, signatures) VALUES (?, ?, '{}')",
                )
                .bind(encoded_hash)
                .bind(BatchStatus::Created.code())
                .execute(&mut *tx)
                .await?
                .last_insert_rowid();

                for counter in counters {
                    let result = sqlx::query(
                        "UPDATE batch_transfer SET batch_id = ?
                         WHERE counter = ? AND batch_id IS NULL",
                    )
                    .bind(id)
                    .bind(*counter)
                    .execute(&mut *tx)
                    .await?;
                    if result.rows_affected() != 1 {
                        return Err(DbError::Conflict(format!(
                            "transfer {counter} missing or already batched"
                        )));
                    }
                }
                tx.commit().await?;

                Ok::<_, DbError>(id)
            })
            .await?;

        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_BATCH_COLUMNS} FROM transfer_batch WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        self.batch_from_row(&row).await
    }

    async fn get_batch_by_hash(&self, hash: B256) -> DbResult<Option<TransferBatch>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_BATCH_COLUMNS} FROM transfer_batch WHERE hash = ?"
        ))
        .bind(encode_hash(&hash))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.batch_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn insert_signed_batch(
        &self,
        hash: B256,
        signatures: BatchSignatures,
    ) -> DbResult<TransferBatch> {
        let pool = &self.pool;
        let encoded_hash = encode_hash(&hash);
        let encoded_hash = encoded_hash.as_str();
        let encoded_signatures = encode_signatures(&signatures)?;
        let encoded_signatures = encoded_signatures.as_str();

        let id = self
            .retrying(|| async move {
                let result = sqlx::query(
                    "INSERT INTO transfer_batch (hash, status, signatures) VALUES (?, ?, ?)
                     ON CONFLICT (hash) DO NOTHING",
                )
                .bind(encoded_hash)
                .bind(BatchStatus::Created.code())
                .bind(encoded_signatures)
                .execute(pool)
                .await?;
                if result.rows_affected() != 1 {
                    return Err(DbError::Conflict(format!(
                        "batch {encoded_hash} already exists"
                    )));
                }
                Ok::<_, DbError>(result.last_insert_rowid())
            })
            .await?;

        Ok(TransferBatch {
            id,
            hash,
            status: BatchStatus::Created,
            signatures,
            transfers: Vec::new(),
            executed_tx_hash: None,
        })
    }

    async fn set_batch_signatures(&self, id: i64, signatures: BatchSignatures) -> DbResult<()> {
        let pool = &self.pool;
        let encoded = encode_signatures(&signatures)?;
        let encoded = encoded.as_str();
        self.retrying(|| async move {
            let result = sqlx::query("UPDATE transfer_batch SET signatures = ? WHERE id = ?")
                .bind(encoded)
                .bind(id)
                .execute(pool)
                .await?;
            if result.rows_affected() != 1 {
                return Err(DbError::NotFound(format!("transfer batch {id}")));
            }
            Ok::<_, DbError>(())
        })
        .await
    }

    async fn set_batch_status(
        &self,
        id: i64,
        status: BatchStatus,
        executed_tx_hash: Option<B256>,
    ) -> DbResult<()> {
        let pool = &self.pool;
        let executed_tx_hash = executed_tx_hash.as_ref().map(encode_hash);
        let executed_tx_hash = executed_tx_hash.as_deref();
        self.retrying(|| async move {
            let mut tx = pool.begin().await?;

            let current: i64 = sqlx::query_scalar("SELECT status FROM transfer_batch WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("transfer batch {id}")))?;
            let current = BatchStatus::from_code(current)
                .ok_or_else(|| mismatched("status", format!("unknown status code {current}")))?;
            check_transition(id, current, status)?;

            sqlx::query(
                "UPDATE transfer_batch SET status = ?,
                 executed_tx_hash = COALESCE(?, executed_tx_hash) WHERE id = ?",
            )
            .bind(status.code())
            .bind(executed_tx_hash)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            Ok::<_, DbError>(())
        })
        .await
    }
}

#[async_trait]
impl EvmToTapDb for SqliteDb {
    async fn insert_evm_to_tap_transfer(&self, transfer: NewEvmToTapTransfer) -> DbResult<bool> {
        let pool = &self.pool;
        let counter = to_i64(transfer.counter)?;
        let sender = encode_address(&transfer.sender_evm_address);
        let sender = sender.as_str();
        let recipient = transfer.recipient_tap_address.as_str();
        let evm_tx_hash = encode_hash(&transfer.evm_tx_hash);
        let evm_tx_hash = evm_tx_hash.as_str();
        let block_number = to_i64(transfer.block_number)?;
        let log_index = to_i64(transfer.log_index)?;
        self.retrying(|| async move {
            let result = sqlx::query(
                "INSERT INTO evm_to_tap_transfer
                 (counter, sender_evm_address, recipient_tap_address, evm_tx_hash, block_number,
                  log_index)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT DO NOTHING",
            )
            .bind(counter)
            .bind(sender)
            .bind(recipient)
            .bind(evm_tx_hash)
            .bind(block_number)
            .bind(log_index)
            .execute(pool)
            .await?;
            Ok::<_, DbError>(result.rows_affected() == 1)
        })
        .await
    }

    async fn get_evm_to_tap_transfer(&self, counter: u64) -> DbResult<Option<EvmToTapTransfer>> {
        sqlx::query(&format!(
            "SELECT {EVM_TO_TAP_TRANSFER_COLUMNS} FROM evm_to_tap_transfer WHERE counter = ?"
        ))
        .bind(to_i64(counter)?)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(evm_to_tap_transfer_from_row)
        .transpose()
    }

    async fn unbatched_evm_to_tap_transfers(
        &self,
        limit: usize,
    ) -> DbResult<Vec<EvmToTapTransfer>> {
        sqlx::query(&format!(
            "SELECT {EVM_TO_TAP_TRANSFER_COLUMNS} FROM evm_to_tap_transfer
             WHERE batch_id IS NULL ORDER BY counter LIMIT ?"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(evm_to_tap_transfer_from_row)
        .collect()
    }

    async fn current_evm_to_tap_batch(&self) -> DbResult<Option<EvmToTapBatch>> {
        let row = sqlx::query(&format!(
            "SELECT {EVM_TO_TAP_BATCH_COLUMNS} FROM evm_to_tap_batch
             WHERE status != ? ORDER BY id LIMIT 1"
        ))
        .bind(EvmToTapBatchStatus::Finalized.code())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.evm_to_tap_batch_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn create_evm_to_tap_batch(
        &self,
        hash: B256,
        counters: &[u64],
    ) -> DbResult<EvmToTapBatch> {
        let pool = &self.pool;
        let encoded_hash = encode_hash(&hash);
        let encoded_hash = encoded_hash.as_str();
        let counters = counters
            .iter()
            .map(|counter| to_i64(*counter))
            .collect::<DbResult<Vec<_>>>()?;
        let counters = counters.as_slice();

        let id = self
            .retrying(|| async move {
                let mut tx = pool.begin().await?;

                let id = sqlx::query(
                    "INSERT INTO evm_to_tap_batch (hash, status) VALUES (?, ?)
                     ON CONFLICT (hash) DO NOTHING",
                )
                .bind(encoded_hash)
                .bind(EvmToTapBatchStatus::Created.code())
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)
                .and_then(|result| {
                    if result.rows_affected() == 1 {
                        Ok(result.last_insert_rowid())
                    } else {
                        Err(DbError::Conflict(format!(
                            "batch {encoded_hash} already exists"
                        )))
                    }
                })?;

                for counter in counters {
                    let result = sqlx::query(
                        "UPDATE evm_to_tap_transfer SET batch_id = ?
                         WHERE counter = ? AND batch_id IS NULL",
                    )
                    .bind(id)
                    .bind(*counter)
                    .execute(&mut *tx)
                    .await?;
                    if result.rows_affected() != 1 {
                        return Err(DbError::Conflict(format!(
                            "transfer {counter} missing or already batched"
                        )));
                    }
                }
                tx.commit().await?;

                Ok::<_, DbError>(id)
            })
            .await?;

        let row = sqlx::query(&format!(
            "SELECT {EVM_TO_TAP_BATCH_COLUMNS} FROM evm_to_tap_batch WHERE id = ?"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        self.evm_to_tap_batch_from_row(&row).await
    }

    async fn set_evm_to_tap_batch_status(
        &self,
        id: i64,
        status: EvmToTapBatchStatus,
        sending_result: Option<String>,
    ) -> DbResult<()> {
        let pool = &self.pool;
        let sending_result = sending_result.as_deref();
        self.retrying(|| async move {
            let mut tx = pool.begin().await?;

            let current: i64 =
                sqlx::query_scalar("SELECT status FROM evm_to_tap_batch WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| DbError::NotFound(format!("evm to tap batch {id}")))?;
            let current = EvmToTapBatchStatus::from_code(current)
                .ok_or_else(|| mismatched("status", format!("unknown status code {current}")))?;
            check_transition(id, current, status)?;

            sqlx::query(
                "UPDATE evm_to_tap_batch SET status = ?,
                 sending_result = COALESCE(?, sending_result) WHERE id = ?",
            )
            .bind(status.code())
            .bind(sending_result)
            .bind(id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            Ok::<_, DbError>(())
        })
        .await
    }
}

#[async_trait]
impl SignedClaimsDb for SqliteDb {
    async fn record_signed_claims(&self, bridge: &str, claims: &[SignedClaim]) -> DbResult<()> {
        let pool = &self.pool;
        self.retrying(|| async move {
            let mut tx = pool.begin().await?;

            for claim in claims {
                let existing: Option<String> = sqlx::query_scalar(
                    "SELECT commitment FROM signed_claim WHERE bridge = ? AND resource = ?",
                )
                .bind(bridge)
                .bind(&claim.resource)
                .fetch_optional(&mut *tx)
                .await?;
                match existing {
                    Some(existing) if existing != claim.commitment => {
                        return Err(DbError::Conflict(format!(
                            "{} already signed for {existing}",
                            claim.resource
                        )));
                    }
                    Some(_) => {}
                    None => {
                        sqlx::query(
                            "INSERT INTO signed_claim (bridge, resource, commitment)
                             VALUES (?, ?, ?)",
                        )
                        .bind(bridge)
                        .bind(&claim.resource)
                        .bind(&claim.commitment)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
            }
            tx.commit().await?;

            Ok::<_, DbError>(())
        })
        .await
    }

    async fn signed_claim(&self, bridge: &str, resource: &str) -> DbResult<Option<String>> {
        Ok(sqlx::query_scalar(
            "SELECT commitment FROM signed_claim WHERE bridge = ? AND resource = ?",
        )
        .bind(bridge)
        .bind(resource)
        .fetch_optional(&self.pool)
        .await?)
    }
}
