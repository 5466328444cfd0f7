//! A federation of rune bridges sharing one mocked bitcoind, ord and contract.

use std::{sync::Arc, time::Duration};

use alloy::{
    primitives::{Address, B256, U256},
    signers::local::PrivateKeySigner,
};
use bitcoin::{Amount, Network as BitcoinNetwork, OutPoint, SignedAmount, Txid};
use federator_db::{
    types::{RuneDeposit, RuneDepositStatus},
    InMemoryDb, RuneBridgeDb,
};
use federator_evm::{test_utils::MockRuneBridge, RuneTransferToBtc};
use federator_multisig::{
    fees::FeeEstimator,
    rpc::SinceBlockTx,
    runes::{types::RuneId, wallet::OrdMultisig, Rune},
    test_utils::{fund, test_wallets, MockBitcoinRpc, MockOrd},
};
use federator_p2p::InMemoryHub;
use federator_primitives::params::NetworkParams;

use super::{RuneBridge, RuneBridgeConfig};
use crate::{bridge::Bridge, signatures::CollectConfig};

pub(crate) const TEST_RUNE: &str = "TEST•RUNE";
pub(crate) const RUNE_ID: RuneId = RuneId { block: 100, tx: 1 };
pub(crate) const RECEIVER: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";

pub(crate) fn test_rune_number() -> u128 {
    Rune::unspaced(TEST_RUNE)
        .parse::<Rune>()
        .map(|r| r.0)
        .unwrap()
}

pub(crate) struct Federation {
    pub(crate) nodes: Vec<RuneBridge>,
    pub(crate) dbs: Vec<InMemoryDb>,
    pub(crate) rpc: MockBitcoinRpc,
    pub(crate) ord: MockOrd,
    pub(crate) contract: MockRuneBridge,
}

pub(crate) fn config() -> RuneBridgeConfig {
    RuneBridgeConfig {
        collect: CollectConfig {
            max_attempts: 1,
            backoff_unit: Duration::ZERO,
        },
        receipt_timeout: Duration::from_millis(50),
        receipt_poll_interval: Duration::from_millis(5),
        ord_sync_timeout: Duration::ZERO,
        ord_output_poll_attempts: 1,
        ord_output_poll_unit: Duration::ZERO,
        ..Default::default()
    }
}

impl Federation {
    /// `n` federators on regtest, `required` of which must sign. Node 0 leads.
    pub(crate) async fn new(n: u8, required: usize) -> Self {
        Self::with_config(n, required, config()).await
    }

    pub(crate) async fn with_config(n: u8, required: usize, config: RuneBridgeConfig) -> Self {
        let params = NetworkParams::new(BitcoinNetwork::Regtest);
        let rpc = MockBitcoinRpc::default();
        let ord = MockOrd::default();
        ord.add_rune(TEST_RUNE, RUNE_ID, 0);

        let signers = (0..n)
            .map(|_| PrivateKeySigner::random())
            .collect::<Vec<_>>();
        let contract = MockRuneBridge::new(signers.iter().map(|s| s.address()).collect(), required);
        contract.register_rune(test_rune_number());
        let hub = InMemoryHub::new("node-0");

        let wallets = test_wallets(n, required, &rpc, params);
        let mut nodes = Vec::new();
        let mut dbs = Vec::new();
        for (i, (signer, wallet)) in signers.into_iter().zip(wallets).enumerate() {
            let network = hub.join(format!("node-{i}"), signer.address());
            let db = InMemoryDb::default();
            let node = RuneBridge::new(
                config.clone(),
                Arc::new(network),
                Arc::new(db.clone()),
                OrdMultisig::new(wallet, Arc::new(ord.clone())),
                Arc::new(contract.clone()),
                signer,
                FeeEstimator::new(Arc::new(rpc.clone()), params, None).unwrap(),
            );
            node.init().await.unwrap();
            nodes.push(node);
            dbs.push(db);
        }
        Self {
            nodes,
            dbs,
            rpc,
            ord,
            contract,
        }
    }

    pub(crate) fn leader(&self) -> &RuneBridge {
        &self.nodes[0]
    }

    /// One iteration on every node but the leader.
    pub(crate) async fn run_followers(&self) {
        for node in &self.nodes[1..] {
            node.run_iteration().await.unwrap();
        }
    }

    /// `user` deposits `amount` raw units of the test rune with the default postage.
    pub(crate) async fn rune_deposit(&self, user: Address, amount: u128, confirmations: i64) -> Txid {
        self.rune_deposit_with_postage(user, amount, confirmations, Amount::from_sat(10_000))
            .await
    }

    pub(crate) async fn rune_deposit_with_postage(
        &self,
        user: Address,
        amount: u128,
        confirmations: i64,
        postage: Amount,
    ) -> Txid {
        let mut address = String::new();
        for node in &self.nodes {
            address = node.get_deposit_address(user).await.unwrap().btc_address;
        }
        let txid = self.rpc.next_txid();
        self.rpc.add_wallet_tx(SinceBlockTx {
            address: Some(address),
            category: "receive".to_string(),
            amount: SignedAmount::from_sat(postage.to_sat() as i64),
            vout: 0,
            confirmations,
            blockhash: None,
            blockheight: (confirmations > 0).then_some(100),
            txid,
            time: 1_700_000_000,
        });
        self.ord
            .set_runes(OutPoint::new(txid, 0), TEST_RUNE, amount);
        txid
    }

    /// The leader's only deposit, which must be in `status`.
    pub(crate) async fn leader_deposit(&self, status: RuneDepositStatus) -> RuneDeposit {
        let mut deposits = self.dbs[0]
            .rune_deposits_by_status("rune", status)
            .await
            .unwrap();
        assert_eq!(deposits.len(), 1, "expected one deposit in {status:?}");
        deposits.remove(0)
    }

    /// Puts `amount` of the test rune and some spare sats into custody.
    pub(crate) fn fund_runes(&self, amount: u128) {
        let wallet = self.leader().wallet.multisig();
        let rune_utxo = fund(&self.rpc, wallet, Amount::from_sat(10_000), 6);
        self.ord.set_runes(rune_utxo, TEST_RUNE, amount);
        fund(&self.rpc, wallet, Amount::from_sat(100_000), 3);
    }

    /// Burns `amount` tokens of the test rune at block 5, paid out to `receiver`.
    pub(crate) fn burn(&self, log_index: u64, receiver: &str, amount: u128) -> RuneTransferToBtc {
        let event = RuneTransferToBtc {
            evm_tx_hash: B256::repeat_byte(0x42),
            log_index,
            block_number: 5,
            from: Address::repeat_byte(0xaa),
            rune_number: test_rune_number(),
            token: Address::repeat_byte(0x70),
            receiver_btc_address: receiver.to_string(),
            net_rune_amount: amount,
            transferred_token_amount: U256::from(amount),
        };
        self.contract.push_event(event.clone());
        self.contract.set_block_number(5);
        event
    }
}
