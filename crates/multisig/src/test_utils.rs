//! In-memory doubles for bitcoind and ord, and helpers to build test wallets.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use bitcoin::{
    bip32::{DerivationPath, Xpriv},
    hashes::Hash,
    BlockHash, OutPoint, PublicKey, Transaction, Txid,
};
use federator_primitives::params::NetworkParams;
use parking_lot::Mutex;

use crate::{
    descriptor::address_descriptor,
    keys::MultisigKeys,
    rpc::{
        BitcoinRpc, EstimateRawFee, GetTransaction, ImportDescriptorRequest,
        ImportDescriptorResult, ListSinceBlock, ListUnspentEntry, MempoolAcceptResult,
        RpcError, RpcResult, SinceBlockTx,
    },
    runes::{
        ord::{OrdApi, OrdError, OrdOutput, RuneBalance, RuneEntry},
        types::{Rune, RuneId},
    },
    wallet::BitcoinMultisig,
};

#[derive(Debug, Default)]
struct RpcState {
    unspent: Vec<ListUnspentEntry>,
    since_block: Vec<SinceBlockTx>,
    last_block: Option<BlockHash>,
    transactions: HashMap<Txid, GetTransaction>,
    raw_fees: BTreeMap<u32, String>,
    reject_reason: Option<String>,
    sent: Vec<Transaction>,
    imported: Vec<ImportDescriptorRequest>,
    block_count: u64,
    next_txid: u64,
}

/// A scripted bitcoind. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockBitcoinRpc {
    state: Arc<Mutex<RpcState>>,
}

impl MockBitcoinRpc {
    /// Adds a wallet UTXO.
    pub fn add_unspent(&self, entry: ListUnspentEntry) {
        self.state.lock().unspent.push(entry);
    }

    /// Sets the confirmations of every unspent and wallet transaction entry for `txid`.
    pub fn set_confirmations(&self, txid: Txid, confirmations: u32) {
        let mut state = self.state.lock();
        for entry in state.unspent.iter_mut().filter(|e| e.txid == txid) {
            entry.confirmations = confirmations;
        }
        for entry in state.since_block.iter_mut().filter(|e| e.txid == txid) {
            entry.confirmations = i64::from(confirmations);
        }
    }

    /// Adds a wallet transaction entry reported by `listsinceblock`.
    pub fn add_wallet_tx(&self, entry: SinceBlockTx) {
        self.state.lock().since_block.push(entry);
    }

    /// Sets the hash `listsinceblock` reports as `lastblock`.
    pub fn set_last_block(&self, hash: BlockHash) {
        self.state.lock().last_block = Some(hash);
    }

    /// Registers a transaction for `gettransaction`.
    pub fn add_transaction(&self, tx: &Transaction, confirmations: i64) {
        self.state.lock().transactions.insert(
            tx.compute_txid(),
            GetTransaction {
                hex: bitcoin::consensus::encode::serialize_hex(tx),
                confirmations,
            },
        );
    }

    /// Sets the `estimaterawfee` short feerate, in BTC/kvB, for `target`.
    pub fn set_raw_fee(&self, target: u32, btc_per_kvb: &str) {
        self.state
            .lock()
            .raw_fees
            .insert(target, btc_per_kvb.to_string());
    }

    /// Makes `testmempoolaccept` refuse everything with `reason`.
    pub fn reject_mempool(&self, reason: &str) {
        self.state.lock().reject_reason = Some(reason.to_string());
    }

    /// Sets the chain height.
    pub fn set_block_count(&self, height: u64) {
        self.state.lock().block_count = height;
    }

    /// Transactions passed to `sendrawtransaction`.
    pub fn sent_transactions(&self) -> Vec<Transaction> {
        self.state.lock().sent.clone()
    }

    /// Descriptors passed to `importdescriptors`.
    pub fn imported_descriptors(&self) -> Vec<ImportDescriptorRequest> {
        self.state.lock().imported.clone()
    }

    /// A fresh, distinct txid.
    pub fn next_txid(&self) -> Txid {
        let mut state = self.state.lock();
        state.next_txid += 1;
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&state.next_txid.to_le_bytes());
        Txid::from_byte_array(bytes)
    }
}

#[async_trait]
impl BitcoinRpc for MockBitcoinRpc {
    async fn list_unspent(
        &self,
        min_conf: u32,
        addresses: Option<&[String]>,
    ) -> RpcResult<Vec<ListUnspentEntry>> {
        let state = self.state.lock();
        Ok(state
            .unspent
            .iter()
            .filter(|e| e.confirmations >= min_conf)
            .filter(|e| match (addresses, &e.address) {
                (Some(wanted), Some(address)) => wanted.contains(address),
                (Some(_), None) => false,
                (None, _) => true,
            })
            .cloned()
            .collect())
    }

    async fn list_since_block(
        &self,
        _block_hash: Option<&BlockHash>,
        _target_confirmations: u32,
    ) -> RpcResult<ListSinceBlock> {
        let state = self.state.lock();
        Ok(ListSinceBlock {
            transactions: state.since_block.clone(),
            lastblock: state.last_block.unwrap_or_else(BlockHash::all_zeros),
        })
    }

    async fn get_transaction(&self, txid: &Txid) -> RpcResult<GetTransaction> {
        self.state
            .lock()
            .transactions
            .get(txid)
            .cloned()
            .ok_or(RpcError::Server {
                code: -5,
                message: "Invalid or non-wallet transaction id".to_string(),
            })
    }

    async fn test_mempool_accept(&self, tx: &Transaction) -> RpcResult<Vec<MempoolAcceptResult>> {
        let reason = self.state.lock().reject_reason.clone();
        Ok(vec![MempoolAcceptResult {
            txid: tx.compute_txid(),
            allowed: reason.is_none(),
            reject_reason: reason,
        }])
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> RpcResult<Txid> {
        self.state.lock().sent.push(tx.clone());
        Ok(tx.compute_txid())
    }

    async fn import_descriptors(
        &self,
        requests: Vec<ImportDescriptorRequest>,
    ) -> RpcResult<Vec<ImportDescriptorResult>> {
        let results = requests
            .iter()
            .map(|_| ImportDescriptorResult {
                success: true,
                error: None,
            })
            .collect();
        self.state.lock().imported.extend(requests);
        Ok(results)
    }

    async fn estimate_raw_fee(&self, conf_target: u32) -> RpcResult<EstimateRawFee> {
        let json = match self.state.lock().raw_fees.get(&conf_target) {
            Some(rate) => format!(r#"{{"short": {{"feerate": {rate}}}}}"#),
            None => r#"{"short": {"fail": true}}"#.to_string(),
        };
        serde_json::from_str(&json).map_err(|e| RpcError::Decode(e.to_string()))
    }

    async fn get_block_count(&self) -> RpcResult<u64> {
        Ok(self.state.lock().block_count)
    }
}

#[derive(Debug, Default)]
struct OrdState {
    runes: HashMap<String, RuneEntry>,
    outputs: HashMap<OutPoint, OrdOutput>,
    block_count: u64,
}

/// A scripted ord indexer. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockOrd {
    state: Arc<Mutex<OrdState>>,
}

impl MockOrd {
    /// Etches a rune.
    pub fn add_rune(&self, spaced_name: &str, id: RuneId, divisibility: u8) {
        let name = Rune::unspaced(spaced_name);
        let number = name.parse::<Rune>().map(|r| r.0).unwrap_or_default();
        self.state.lock().runes.insert(
            name,
            RuneEntry {
                id,
                number,
                divisibility,
                spaced_rune: spaced_name.to_string(),
                symbol: None,
            },
        );
    }

    /// Sets the balance of `rune` at `outpoint`.
    pub fn set_runes(&self, outpoint: OutPoint, spaced_name: &str, amount: u128) {
        let mut state = self.state.lock();
        let divisibility = state
            .runes
            .get(&Rune::unspaced(spaced_name))
            .map(|r| r.divisibility)
            .unwrap_or_default();
        let output = state.outputs.entry(outpoint).or_insert_with(indexed_output);
        output.runes.insert(
            spaced_name.to_string(),
            RuneBalance {
                amount,
                divisibility,
                symbol: None,
            },
        );
    }

    /// Marks `outpoint` as carrying an inscription.
    pub fn set_inscribed(&self, outpoint: OutPoint) {
        let mut state = self.state.lock();
        let output = state.outputs.entry(outpoint).or_insert_with(indexed_output);
        output.inscriptions.push(format!("{}i0", outpoint.txid));
    }

    /// Sets the indexed height.
    pub fn set_block_count(&self, height: u64) {
        self.state.lock().block_count = height;
    }
}

fn indexed_output() -> OrdOutput {
    OrdOutput {
        indexed: true,
        ..Default::default()
    }
}

#[async_trait]
impl OrdApi for MockOrd {
    async fn output(&self, outpoint: &OutPoint) -> Result<OrdOutput, OrdError> {
        Ok(self
            .state
            .lock()
            .outputs
            .get(outpoint)
            .cloned()
            .unwrap_or_else(indexed_output))
    }

    async fn rune(&self, name: &str) -> Result<Option<RuneEntry>, OrdError> {
        Ok(self.state.lock().runes.get(&Rune::unspaced(name)).cloned())
    }

    async fn block_count(&self) -> Result<u64, OrdError> {
        Ok(self.state.lock().block_count)
    }
}

/// Key sets for cosigners seeded with `[seed; 32]`, one per seed.
pub fn keys_from_seeds(seeds: &[u8], required: usize, params: NetworkParams) -> Vec<MultisigKeys> {
    let xprivs = seeds
        .iter()
        .map(|seed| Xpriv::new_master(params.network(), &[*seed; 32]).expect("valid seed"))
        .collect::<Vec<_>>();
    let xpubs = xprivs
        .iter()
        .map(|xpriv| bitcoin::bip32::Xpub::from_priv(secp256k1::SECP256K1, xpriv))
        .collect::<Vec<_>>();
    xprivs
        .into_iter()
        .map(|xpriv| MultisigKeys::new(xpriv, xpubs.clone(), required).expect("valid keys"))
        .collect()
}

/// One wallet per seed, all sharing `rpc`.
pub fn wallets_from_seeds(
    seeds: &[u8],
    required: usize,
    rpc: &MockBitcoinRpc,
    params: NetworkParams,
) -> Vec<BitcoinMultisig> {
    let base_path: DerivationPath = crate::wallet::DEFAULT_BASE_PATH
        .parse()
        .expect("valid path");
    keys_from_seeds(seeds, required, params)
        .into_iter()
        .map(|keys| BitcoinMultisig::new(keys, params, Arc::new(rpc.clone()), base_path.clone()))
        .collect()
}

/// `n` wallets of a `required`-of-`n` federation.
pub fn test_wallets(
    n: u8,
    required: usize,
    rpc: &MockBitcoinRpc,
    params: NetworkParams,
) -> Vec<BitcoinMultisig> {
    let seeds = (1..=n).collect::<Vec<_>>();
    wallets_from_seeds(&seeds, required, rpc, params)
}

/// Pays `amount` to `wallet`'s custody address in a new UTXO and returns its outpoint.
pub fn fund(
    rpc: &MockBitcoinRpc,
    wallet: &BitcoinMultisig,
    amount: bitcoin::Amount,
    confirmations: u32,
) -> OutPoint {
    let path = wallet.change_path();
    let keys = wallet.keys();
    let origins = keys
        .xpubs()
        .iter()
        .map(|xpub| {
            let child = federator_key_deriv::derive_pubkey(xpub, &path).expect("derivable");
            (xpub.fingerprint(), PublicKey::new(child.public_key))
        })
        .collect::<Vec<_>>();
    let desc = address_descriptor(&origins, keys.required(), &path).expect("valid descriptor");
    let txid = rpc.next_txid();

    rpc.add_unspent(ListUnspentEntry {
        txid,
        vout: 0,
        address: Some(wallet.change_address().expect("address").to_string()),
        amount,
        confirmations,
        witness_script: Some(keys.redeem_script(&path).expect("script")),
        desc: Some(desc),
    });
    OutPoint { txid, vout: 0 }
}
