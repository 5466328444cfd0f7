//! Behaviour shared by every store, run against each implementation.

use std::collections::BTreeMap;

use alloy::primitives::{Address, B256, U256};
use bitcoin::{Amount, OutPoint, Txid};

use crate::{
    errors::DbError,
    types::{
        BatchStatus, DepositAddressRecord, EvmToTapBatchStatus, IncomingBtcTx,
        IncomingBtcTxStatus, NewEvmToTapTransfer, NewRuneDeposit, NewRuneTokenDeposit,
        RuneDepositStatus, RuneTokenDepositStatus, SignedClaim, TapDepositAddress,
    },
    Database,
};

const BRIDGE: &str = "test-bridge";

fn txid(n: u8) -> Txid {
    format!("{n:02x}").repeat(32).parse().unwrap()
}

fn incoming(status: IncomingBtcTxStatus) -> IncomingBtcTx {
    IncomingBtcTx {
        txid: txid(1),
        vout: 0,
        address: "bcrt1qdeposit".to_string(),
        amount: Amount::from_sat(10_000),
        block_number: Some(101),
        time: 1_700_000_000,
        status,
    }
}

fn rune_deposit(status: RuneDepositStatus) -> NewRuneDeposit {
    NewRuneDeposit {
        txid: txid(2),
        vout: 1,
        rune_number: 99_246_114_928_149_462,
        rune_id: "840000:3".to_string(),
        spaced_rune: "UNCOMMON•GOODS".to_string(),
        evm_address: Address::repeat_byte(0x11),
        block_number: Some(102),
        postage: Amount::from_sat(10_000),
        transfer_amount: 1_000_000,
        net_amount: 996_000,
        status,
    }
}

fn token_deposit() -> NewRuneTokenDeposit {
    NewRuneTokenDeposit {
        evm_tx_hash: B256::repeat_byte(0xaa),
        log_index: 3,
        block_number: 50,
        user_evm_address: Address::repeat_byte(0x22),
        receiver_btc_address: "bcrt1qreceiver".to_string(),
        rune_number: 12,
        spaced_rune: "M".to_string(),
        token_address: Address::repeat_byte(0x33),
        net_rune_amount: 500,
        transferred_token_amount: U256::from(500_000_000_000_000_000u128),
        status: RuneTokenDepositStatus::Accepted,
    }
}

pub(crate) async fn checkpoints_compare_and_set(db: &impl Database) {
    let key = "test-bridge:btc:deposits:last_scanned_block";
    assert_eq!(db.get_value(key).await.unwrap(), None);

    assert!(db.compare_and_set(key, None, "10").await.unwrap());
    assert!(!db.compare_and_set(key, None, "11").await.unwrap());
    assert!(!db.compare_and_set(key, Some("9"), "12").await.unwrap());
    assert!(db.compare_and_set(key, Some("10"), "12").await.unwrap());
    assert_eq!(db.get_value(key).await.unwrap().as_deref(), Some("12"));

    db.set_value(key, "13").await.unwrap();
    assert_eq!(db.get_value(key).await.unwrap().as_deref(), Some("13"));
}

pub(crate) async fn deposit_addresses_are_stable(db: &impl Database) {
    let evm = Address::repeat_byte(0x11);
    let first = DepositAddressRecord {
        evm_address: evm,
        btc_address: "bcrt1qfirst".to_string(),
        index: 1,
    };
    let stored = db.insert_deposit_address(BRIDGE, first.clone()).await.unwrap();
    assert_eq!(stored, first);

    let again = DepositAddressRecord {
        btc_address: "bcrt1qsecond".to_string(),
        index: 2,
        ..first.clone()
    };
    let stored = db.insert_deposit_address(BRIDGE, again).await.unwrap();
    assert_eq!(stored, first, "an account keeps its first address");

    let stolen = DepositAddressRecord {
        evm_address: Address::repeat_byte(0x12),
        ..first.clone()
    };
    assert!(matches!(
        db.insert_deposit_address(BRIDGE, stolen).await,
        Err(DbError::Conflict(_))
    ));

    assert_eq!(
        db.get_deposit_address_by_btc(BRIDGE, "bcrt1qfirst")
            .await
            .unwrap(),
        Some(first.clone())
    );
    assert_eq!(db.get_deposit_address(BRIDGE, evm).await.unwrap(), Some(first));
    assert!(db
        .get_deposit_address("other-bridge", evm)
        .await
        .unwrap()
        .is_none());
    assert_eq!(db.deposit_addresses(BRIDGE).await.unwrap().len(), 1);
}

pub(crate) async fn incoming_txs_upsert_forward_only(db: &impl Database) {
    assert!(db
        .upsert_incoming_btc_tx(BRIDGE, incoming(IncomingBtcTxStatus::Detected))
        .await
        .unwrap());
    assert!(!db
        .upsert_incoming_btc_tx(BRIDGE, incoming(IncomingBtcTxStatus::Accepted))
        .await
        .unwrap());
    assert!(!db
        .upsert_incoming_btc_tx(BRIDGE, incoming(IncomingBtcTxStatus::Detected))
        .await
        .unwrap());

    let stored = db
        .get_incoming_btc_tx(BRIDGE, txid(1), 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, IncomingBtcTxStatus::Accepted);
    assert_eq!(stored.amount, Amount::from_sat(10_000));
}

pub(crate) async fn rune_deposits_keep_progress(db: &impl Database) {
    let detected = db
        .upsert_rune_deposit(BRIDGE, rune_deposit(RuneDepositStatus::Detected))
        .await
        .unwrap();
    assert_eq!(detected.status, RuneDepositStatus::Detected);
    assert_eq!(detected.fee(), 4_000);

    let accepted = db
        .upsert_rune_deposit(BRIDGE, rune_deposit(RuneDepositStatus::Accepted))
        .await
        .unwrap();
    assert_eq!(accepted.id, detected.id);
    assert_eq!(accepted.status, RuneDepositStatus::Accepted);

    let hash = B256::repeat_byte(0x42);
    let signer = Address::repeat_byte(0x01);
    db.add_rune_deposit_signatures(BRIDGE, accepted.id, hash, &[(signer, "0xaa".to_string())])
        .await
        .unwrap();
    let signed = db
        .add_rune_deposit_signatures(
            BRIDGE,
            accepted.id,
            hash,
            &[
                (signer, "0xbb".to_string()),
                (Address::repeat_byte(0x02), "0xcc".to_string()),
            ],
        )
        .await
        .unwrap();
    assert_eq!(signed.message_hash, Some(hash));
    assert_eq!(
        signed.signatures,
        BTreeMap::from([
            (signer, "0xaa".to_string()),
            (Address::repeat_byte(0x02), "0xcc".to_string()),
        ])
    );

    db.set_rune_deposit_status(BRIDGE, accepted.id, RuneDepositStatus::SendingToEvm, None)
        .await
        .unwrap();

    let rescanned = db
        .upsert_rune_deposit(BRIDGE, rune_deposit(RuneDepositStatus::Detected))
        .await
        .unwrap();
    assert_eq!(rescanned.status, RuneDepositStatus::SendingToEvm);
    assert_eq!(rescanned.signatures.len(), 2);

    let err = db
        .set_rune_deposit_status(BRIDGE, accepted.id, RuneDepositStatus::Accepted, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidTransition { .. }));

    let evm_tx = B256::repeat_byte(0x77);
    db.set_rune_deposit_status(BRIDGE, accepted.id, RuneDepositStatus::SentToEvm, Some(evm_tx))
        .await
        .unwrap();
    let sent = db
        .rune_deposits_by_status(BRIDGE, RuneDepositStatus::SentToEvm)
        .await
        .unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].evm_tx_hash, Some(evm_tx));
    assert!(db
        .rune_deposits_by_status(BRIDGE, RuneDepositStatus::Accepted)
        .await
        .unwrap()
        .is_empty());
}

pub(crate) async fn token_deposits_are_inserted_once(db: &impl Database) {
    assert!(db
        .insert_rune_token_deposit(BRIDGE, token_deposit())
        .await
        .unwrap());
    assert!(!db
        .insert_rune_token_deposit(BRIDGE, token_deposit())
        .await
        .unwrap());

    let stored = db
        .get_rune_token_deposit_by_event(BRIDGE, B256::repeat_byte(0xaa), 3)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.net_rune_amount, 500);
    assert_eq!(
        stored.transferred_token_amount,
        U256::from(500_000_000_000_000_000u128)
    );

    db.set_rune_token_deposit_status(
        BRIDGE,
        stored.id,
        RuneTokenDepositStatus::SendingToBtc,
        Some("cHNidP8=".to_string()),
        None,
    )
    .await
    .unwrap();
    db.set_rune_token_deposit_status(
        BRIDGE,
        stored.id,
        RuneTokenDepositStatus::SentToBtc,
        None,
        Some(txid(9)),
    )
    .await
    .unwrap();

    let sent = db
        .rune_token_deposits_by_status(BRIDGE, RuneTokenDepositStatus::SentToBtc)
        .await
        .unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].finalized_psbt.as_deref(), Some("cHNidP8="));
    assert_eq!(sent[0].btc_txid, Some(txid(9)));

    assert!(matches!(
        db.set_rune_token_deposit_status(
            BRIDGE,
            stored.id,
            RuneTokenDepositStatus::SendingToBtcFailed,
            None,
            None,
        )
        .await,
        Err(DbError::InvalidTransition { .. })
    ));
}

pub(crate) async fn batches_move_forward(db: &impl Database) {
    let address = TapDepositAddress {
        evm_address: Address::repeat_byte(0x11),
        tap_address: "taprt1qqq".to_string(),
    };
    db.add_tap_deposit_address(address.clone()).await.unwrap();
    assert!(matches!(
        db.add_tap_deposit_address(address.clone()).await,
        Err(DbError::Conflict(_))
    ));
    assert_eq!(db.tap_deposit_addresses().await.unwrap(), vec![address.clone()]);

    for n in 1..=3 {
        let outpoint = OutPoint {
            txid: txid(n),
            vout: 0,
        };
        assert!(db
            .insert_batch_transfer(address.evm_address, &address.tap_address, outpoint)
            .await
            .unwrap());
    }
    let duplicate = OutPoint {
        txid: txid(1),
        vout: 0,
    };
    assert!(!db
        .insert_batch_transfer(address.evm_address, &address.tap_address, duplicate)
        .await
        .unwrap());
    assert_eq!(db.known_deposit_outpoints().await.unwrap().len(), 3);

    let pending = db.unbatched_transfers(2).await.unwrap();
    let counters: Vec<u64> = pending.iter().map(|t| t.counter).collect();
    assert_eq!(counters.len(), 2);
    assert_eq!(pending[0].deposit_outpoint, duplicate);

    let hash = B256::repeat_byte(0x10);
    let batch = db.create_batch(hash, &counters).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Created);
    assert_eq!(batch.transfers.len(), 2);
    assert!(batch.transfers.iter().all(|t| t.batch_id == Some(batch.id)));

    assert!(matches!(
        db.create_batch(B256::repeat_byte(0x20), &counters[..1]).await,
        Err(DbError::Conflict(_))
    ));
    assert_eq!(db.unbatched_transfers(10).await.unwrap().len(), 1);

    let current = db.current_batch().await.unwrap().unwrap();
    assert_eq!(current.hash, hash);

    let signatures = BTreeMap::from([(
        Address::repeat_byte(0x05),
        vec!["0x01".to_string(), "0x02".to_string()],
    )]);
    db.set_batch_signatures(batch.id, signatures.clone())
        .await
        .unwrap();
    db.set_batch_status(batch.id, BatchStatus::SignaturesCollected, None)
        .await
        .unwrap();
    db.set_batch_status(batch.id, BatchStatus::Sending, None)
        .await
        .unwrap();
    assert!(matches!(
        db.set_batch_status(batch.id, BatchStatus::Created, None).await,
        Err(DbError::InvalidTransition { .. })
    ));

    let executed = B256::repeat_byte(0x99);
    db.set_batch_status(batch.id, BatchStatus::Sent, Some(executed))
        .await
        .unwrap();
    let sent = db.get_batch_by_hash(hash).await.unwrap().unwrap();
    assert_eq!(sent.signatures, signatures);
    assert_eq!(sent.executed_tx_hash, Some(executed));

    db.set_batch_status(batch.id, BatchStatus::Finalized, None)
        .await
        .unwrap();
    assert!(db.current_batch().await.unwrap().is_none());

    let followed = B256::repeat_byte(0x30);
    let stored = db
        .insert_signed_batch(followed, signatures.clone())
        .await
        .unwrap();
    assert!(stored.transfers.is_empty());
    assert!(matches!(
        db.insert_signed_batch(followed, signatures).await,
        Err(DbError::Conflict(_))
    ));
    assert_eq!(
        db.get_batch_by_hash(followed).await.unwrap().unwrap().id,
        stored.id
    );
}

fn evm_to_tap(counter: u64) -> NewEvmToTapTransfer {
    NewEvmToTapTransfer {
        counter,
        sender_evm_address: Address::repeat_byte(0x44),
        recipient_tap_address: format!("taprt1recipient{counter}"),
        evm_tx_hash: B256::repeat_byte(counter as u8),
        block_number: 70 + counter,
        log_index: counter,
    }
}

pub(crate) async fn evm_to_tap_batches_move_forward(db: &impl Database) {
    for counter in [3, 1, 2] {
        assert!(db.insert_evm_to_tap_transfer(evm_to_tap(counter)).await.unwrap());
    }
    assert!(!db.insert_evm_to_tap_transfer(evm_to_tap(2)).await.unwrap());
    let stored = db.get_evm_to_tap_transfer(3).await.unwrap().unwrap();
    assert_eq!(stored.recipient_tap_address, "taprt1recipient3");
    assert_eq!(stored.batch_id, None);
    assert!(db.get_evm_to_tap_transfer(9).await.unwrap().is_none());

    let pending = db.unbatched_evm_to_tap_transfers(2).await.unwrap();
    let counters: Vec<u64> = pending.iter().map(|t| t.counter).collect();
    assert_eq!(counters, vec![1, 2]);

    let hash = B256::repeat_byte(0x40);
    let batch = db.create_evm_to_tap_batch(hash, &counters).await.unwrap();
    assert_eq!(batch.status, EvmToTapBatchStatus::Created);
    assert_eq!(batch.transfers.len(), 2);
    assert!(matches!(
        db.create_evm_to_tap_batch(B256::repeat_byte(0x41), &[2, 3]).await,
        Err(DbError::Conflict(_))
    ));
    assert_eq!(db.unbatched_evm_to_tap_transfers(10).await.unwrap().len(), 1);
    assert_eq!(
        db.current_evm_to_tap_batch().await.unwrap().unwrap().id,
        batch.id
    );

    db.set_evm_to_tap_batch_status(batch.id, EvmToTapBatchStatus::SendingToTap, None)
        .await
        .unwrap();
    assert!(matches!(
        db.set_evm_to_tap_batch_status(batch.id, EvmToTapBatchStatus::Created, None)
            .await,
        Err(DbError::InvalidTransition { .. })
    ));
    let result = r#"{"transfer":{"anchor_tx_hash":"ab"}}"#.to_string();
    db.set_evm_to_tap_batch_status(batch.id, EvmToTapBatchStatus::SentToTap, Some(result.clone()))
        .await
        .unwrap();
    let sent = db.current_evm_to_tap_batch().await.unwrap().unwrap();
    assert_eq!(sent.sending_result, Some(result));

    db.set_evm_to_tap_batch_status(batch.id, EvmToTapBatchStatus::Finalized, None)
        .await
        .unwrap();
    assert!(db.current_evm_to_tap_batch().await.unwrap().is_none());
}

pub(crate) async fn signed_claims_refuse_conflicts(db: &impl Database) {
    let first = [
        SignedClaim::new("tap-deposit:aa:0", "0x01"),
        SignedClaim::new("tap-deposit:aa:1", "0x01"),
    ];
    db.record_signed_claims(BRIDGE, &first).await.unwrap();
    db.record_signed_claims(BRIDGE, &first).await.unwrap();
    assert_eq!(
        db.signed_claim(BRIDGE, "tap-deposit:aa:0").await.unwrap().as_deref(),
        Some("0x01")
    );

    let conflicting = [
        SignedClaim::new("tap-deposit:bb:0", "0x02"),
        SignedClaim::new("tap-deposit:aa:1", "0x02"),
    ];
    assert!(matches!(
        db.record_signed_claims(BRIDGE, &conflicting).await,
        Err(DbError::Conflict(_))
    ));
    assert!(db
        .signed_claim(BRIDGE, "tap-deposit:bb:0")
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        db.signed_claim(BRIDGE, "tap-deposit:aa:1").await.unwrap().as_deref(),
        Some("0x01")
    );

    db.record_signed_claims("other-bridge", &conflicting)
        .await
        .unwrap();
}
