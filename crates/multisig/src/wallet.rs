//! The shared BTC wallet: UTXO discovery, PSBT construction and the signing entry points.

use std::sync::Arc;

use bitcoin::{
    absolute::LockTime,
    bip32::{ChildNumber, DerivationPath, Xpub},
    psbt::PsbtSighashType,
    transaction::Version,
    Address, Amount, EcdsaSighashType, OutPoint, Psbt, ScriptBuf, Sequence, Transaction, TxIn,
    TxOut, Txid, Witness,
};
use federator_primitives::{params::NetworkParams, types::Transfer};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    descriptor::{parse_utxo_descriptor, wallet_descriptor},
    errors::{MultisigError, MultisigResult},
    fees::{estimate_vsize, fee_for},
    keys::MultisigKeys,
    psbt,
    rpc::{BitcoinRpc, ImportDescriptorRequest},
};

/// Default BIP32 base path of the custody (change) addresses.
pub const DEFAULT_BASE_PATH: &str = "m/13/0/0";

/// Number of children of the base path imported into the node wallet.
pub const DESCRIPTOR_RANGE: u32 = 1000;

/// A wallet UTXO we can sign for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    /// Funding transaction.
    pub txid: Txid,
    /// Output index.
    pub vout: u32,
    /// Value.
    pub amount: Amount,
    /// Confirmations.
    pub confirmations: u32,
    /// Address the output pays to.
    pub address: Option<String>,
    /// The P2WSH witness script.
    pub witness_script: ScriptBuf,
    /// Derivation path of the cosigner keys in `witness_script`.
    pub path: DerivationPath,
}

impl Utxo {
    /// The outpoint this UTXO lives at.
    pub const fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.vout,
        }
    }
}

/// Inputs and outputs of a transaction under construction.
#[derive(Debug)]
pub(crate) struct Draft {
    pub(crate) tx: Transaction,
    pub(crate) inputs: Vec<Utxo>,
}

impl Draft {
    pub(crate) fn new(outputs: Vec<TxOut>) -> Self {
        Self {
            tx: Transaction {
                version: Version::TWO,
                lock_time: LockTime::ZERO,
                input: Vec::new(),
                output: outputs,
            },
            inputs: Vec::new(),
        }
    }

    pub(crate) fn add_input(&mut self, utxo: Utxo) {
        self.tx.input.push(TxIn {
            previous_output: utxo.outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        });
        self.inputs.push(utxo);
    }

    pub(crate) fn input_total(&self) -> Amount {
        self.inputs.iter().map(|u| u.amount).sum()
    }

    pub(crate) fn output_total(&self) -> Amount {
        self.tx.output.iter().map(|o| o.value).sum()
    }

    /// Fee for the draft with a change output, once fully signed.
    pub(crate) fn fee(&self, required: usize, fee_rate: u64) -> Amount {
        let scripts = self
            .inputs
            .iter()
            .map(|u| u.witness_script.clone())
            .collect::<Vec<_>>();
        fee_for(estimate_vsize(&self.tx, &scripts, required, true), fee_rate)
    }
}

/// One federator's handle on the shared `k`-of-`n` BTC wallet.
#[derive(Debug, Clone)]
pub struct BitcoinMultisig {
    keys: MultisigKeys,
    params: NetworkParams,
    rpc: Arc<dyn BitcoinRpc>,
    base_path: DerivationPath,
}

impl BitcoinMultisig {
    /// Creates the wallet handle. Custody addresses live under `base_path`.
    pub fn new(
        keys: MultisigKeys,
        params: NetworkParams,
        rpc: Arc<dyn BitcoinRpc>,
        base_path: DerivationPath,
    ) -> Self {
        Self {
            keys,
            params,
            rpc,
            base_path,
        }
    }

    /// Our master xpub.
    pub fn signer_xpub(&self) -> Xpub {
        self.keys.signer_xpub()
    }

    /// Keys and threshold.
    pub const fn keys(&self) -> &MultisigKeys {
        &self.keys
    }

    /// Network parameters.
    pub const fn params(&self) -> &NetworkParams {
        &self.params
    }

    /// The node client.
    pub fn rpc(&self) -> &dyn BitcoinRpc {
        self.rpc.as_ref()
    }

    /// Signatures required to spend.
    pub const fn required(&self) -> usize {
        self.keys.required()
    }

    /// Path of the custody address receiving change: base path + `/0`.
    pub fn change_path(&self) -> DerivationPath {
        self.base_path.child(ChildNumber::Normal { index: 0 })
    }

    /// Custody address at base path + `/index`.
    pub fn derive_address(&self, index: u32) -> MultisigResult<Address> {
        let child =
            ChildNumber::from_normal_idx(index).map_err(federator_key_deriv::DerivationError::from)?;
        let path = self.base_path.child(child);
        let script = self.keys.redeem_script(&path)?;
        Ok(Address::p2wsh(&script, self.params.network()))
    }

    /// The custody address receiving change.
    pub fn change_address(&self) -> MultisigResult<Address> {
        self.derive_address(0)
    }

    /// Script pubkey of the change address.
    pub fn change_script_pubkey(&self) -> MultisigResult<ScriptBuf> {
        Ok(self.change_address()?.script_pubkey())
    }

    /// Imports the ranged custody descriptor into the node wallet.
    pub async fn import_wallet_descriptor(&self) -> MultisigResult<()> {
        let desc = wallet_descriptor(
            self.keys.xpubs(),
            self.keys.required(),
            &self.base_path,
            true,
        )?;
        self.import_descriptors(vec![ImportDescriptorRequest {
            desc,
            timestamp: json!("now"),
            range: Some((0, DESCRIPTOR_RANGE)),
            watchonly: true,
        }])
        .await
    }

    /// Imports the single-address descriptor at `path`, e.g. a deposit address.
    pub async fn import_address_descriptor(&self, path: &DerivationPath) -> MultisigResult<()> {
        let desc = wallet_descriptor(self.keys.xpubs(), self.keys.required(), path, false)?;
        self.import_descriptors(vec![ImportDescriptorRequest {
            desc,
            timestamp: json!("now"),
            range: None,
            watchonly: true,
        }])
        .await
    }

    async fn import_descriptors(&self, requests: Vec<ImportDescriptorRequest>) -> MultisigResult<()> {
        let results = self.rpc.import_descriptors(requests).await?;
        if let Some(failed) = results.iter().find(|r| !r.success) {
            return Err(MultisigError::Descriptor(format!(
                "importdescriptors failed: {:?}",
                failed.error
            )));
        }
        info!(count = results.len(), "imported descriptors");
        Ok(())
    }

    /// Wallet UTXOs we hold a key for, most confirmed first.
    ///
    /// UTXOs without a witness script or descriptor, or whose descriptor does not include our
    /// master fingerprint, are skipped.
    pub async fn list_utxos(
        &self,
        min_conf: u32,
        addresses: Option<&[String]>,
    ) -> MultisigResult<Vec<Utxo>> {
        let fingerprint = self.keys.fingerprint();
        let mut utxos = Vec::new();

        for entry in self.rpc.list_unspent(min_conf, addresses).await? {
            let outpoint = format!("{}:{}", entry.txid, entry.vout);
            let Some(witness_script) = entry.witness_script else {
                debug!(%outpoint, "skipping utxo without witness script");
                continue;
            };
            let Some(desc) = entry.desc else {
                debug!(%outpoint, "skipping utxo without descriptor");
                continue;
            };
            let parsed = match parse_utxo_descriptor(&desc) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!(%outpoint, %e, "skipping utxo with foreign descriptor");
                    continue;
                }
            };
            let Some(path) = parsed.path_for(fingerprint).cloned() else {
                debug!(%outpoint, "skipping utxo not signable by us");
                continue;
            };
            if self.keys.redeem_script(&path)? != witness_script {
                warn!(%outpoint, %path, "witness script does not match derived keys");
                continue;
            }

            utxos.push(Utxo {
                txid: entry.txid,
                vout: entry.vout,
                amount: entry.amount,
                confirmations: entry.confirmations,
                address: entry.address,
                witness_script,
                path,
            });
        }

        utxos.sort_by(|a, b| b.confirmations.cmp(&a.confirmations));
        Ok(utxos)
    }

    /// Builds an unsigned PSBT paying `transfers` at `fee_rate` sat/vB from the custody address.
    pub async fn construct_psbt(&self, transfers: &[Transfer], fee_rate: u64) -> MultisigResult<Psbt> {
        let outputs = transfers
            .iter()
            .map(|t| t.to_txout(&self.params))
            .collect::<Result<Vec<_>, _>>()?;
        let custody = vec![self.change_address()?.to_string()];
        let utxos = self.list_utxos(0, Some(&custody)).await?;

        let mut draft = Draft::new(outputs);
        let target = draft.output_total();
        let mut fee = Amount::ZERO;
        let mut funded = false;
        for utxo in utxos {
            draft.add_input(utxo);
            fee = draft.fee(self.required(), fee_rate);
            if draft.input_total() >= target + fee {
                funded = true;
                break;
            }
        }
        if !funded {
            return Err(MultisigError::InsufficientFunds {
                needed: target + fee,
                available: draft.input_total(),
            });
        }

        let change = draft.input_total() - target - fee;
        if change > Amount::ZERO {
            draft.tx.output.push(TxOut {
                value: change,
                script_pubkey: self.change_script_pubkey()?,
            });
        }

        self.finish_psbt(draft, fee)
    }

    /// Turns a funded draft into a PSBT with signing metadata on every input.
    pub(crate) fn finish_psbt(&self, draft: Draft, fee: Amount) -> MultisigResult<Psbt> {
        let mut psbt = Psbt::from_unsigned_tx(draft.tx)?;
        for (input, utxo) in psbt.inputs.iter_mut().zip(&draft.inputs) {
            input.witness_utxo = Some(TxOut {
                value: utxo.amount,
                script_pubkey: ScriptBuf::new_p2wsh(&utxo.witness_script.wscript_hash()),
            });
            input.witness_script = Some(utxo.witness_script.clone());
            input.bip32_derivation = self.keys.bip32_derivation(&utxo.path)?;
            input.sighash_type = Some(PsbtSighashType::from(EcdsaSighashType::All));
        }

        let actual = psbt::psbt_fee(&psbt)?;
        if actual != fee {
            return Err(MultisigError::FeeMismatch {
                computed: fee,
                actual,
            });
        }
        debug!(txid = %psbt.unsigned_tx.compute_txid(), %fee, "constructed psbt");
        Ok(psbt)
    }

    /// Adds our signature to every input of `psbt`.
    pub fn sign_psbt(&self, psbt: &Psbt) -> MultisigResult<Psbt> {
        psbt::sign_psbt(&self.keys, psbt)
    }

    /// Combines co-signed copies of `initial` and finalizes it.
    pub fn combine_and_finalize_psbt(&self, initial: &Psbt, signed: &[Psbt]) -> MultisigResult<Psbt> {
        psbt::combine_and_finalize_psbt(initial, signed)
    }

    /// Test-accepts and broadcasts a finalized PSBT.
    pub async fn broadcast_psbt(&self, psbt: &Psbt) -> MultisigResult<Txid> {
        psbt::broadcast_psbt(self.rpc.as_ref(), psbt).await
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::Network;

    use super::*;
    use crate::test_utils::{fund, test_wallets, wallets_from_seeds, MockBitcoinRpc};

    const RECIPIENT: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";

    fn wallets(rpc: &MockBitcoinRpc) -> Vec<BitcoinMultisig> {
        test_wallets(3, 2, rpc, NetworkParams::new(Network::Regtest))
    }

    #[test]
    fn every_cosigner_derives_the_same_custody_address() {
        let rpc = MockBitcoinRpc::default();
        let wallets = wallets(&rpc);
        let first = wallets[0].change_address().unwrap();
        assert!(wallets
            .iter()
            .all(|w| w.change_address().unwrap() == first));
        assert_ne!(wallets[0].derive_address(1).unwrap(), first);
    }

    #[tokio::test]
    async fn construct_prefers_confirmed_and_adds_change() {
        let rpc = MockBitcoinRpc::default();
        let wallets = wallets(&rpc);
        fund(&rpc, &wallets[0], Amount::from_sat(30_000), 1);
        fund(&rpc, &wallets[0], Amount::from_sat(80_000), 10);

        let psbt = wallets[1]
            .construct_psbt(&[Transfer::new(RECIPIENT, Amount::from_sat(50_000))], 1)
            .await
            .unwrap();

        assert_eq!(psbt.inputs.len(), 1);
        assert_eq!(psbt.inputs[0].witness_utxo.as_ref().unwrap().value, Amount::from_sat(80_000));
        assert_eq!(psbt.unsigned_tx.output.len(), 2);
        assert_eq!(
            psbt.unsigned_tx.output[1].script_pubkey,
            wallets[1].change_script_pubkey().unwrap()
        );
        assert!(psbt.inputs[0].witness_script.is_some());
        assert_eq!(psbt.inputs[0].bip32_derivation.len(), 3);
    }

    #[tokio::test]
    async fn construct_fails_without_funds() {
        let rpc = MockBitcoinRpc::default();
        let wallets = wallets(&rpc);
        fund(&rpc, &wallets[0], Amount::from_sat(10_000), 1);

        let err = wallets[0]
            .construct_psbt(&[Transfer::new(RECIPIENT, Amount::from_sat(50_000))], 1)
            .await
            .unwrap_err();
        assert!(matches!(err, MultisigError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn construct_rejects_bad_transfers() {
        let rpc = MockBitcoinRpc::default();
        let wallets = wallets(&rpc);
        fund(&rpc, &wallets[0], Amount::from_sat(100_000), 1);

        let zero = wallets[0]
            .construct_psbt(&[Transfer::new(RECIPIENT, Amount::ZERO)], 1)
            .await;
        assert!(matches!(zero, Err(MultisigError::Transfer(_))));

        let mainnet = wallets[0]
            .construct_psbt(
                &[Transfer::new(
                    "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq",
                    Amount::from_sat(1_000),
                )],
                1,
            )
            .await;
        assert!(matches!(mainnet, Err(MultisigError::Transfer(_))));
    }

    #[tokio::test]
    async fn foreign_utxos_are_ignored() {
        let rpc = MockBitcoinRpc::default();
        let ours = wallets(&rpc);
        let other_rpc = MockBitcoinRpc::default();
        let theirs =
            wallets_from_seeds(&[0xaa, 0xbb], 1, &other_rpc, NetworkParams::new(Network::Regtest));
        // a UTXO described with keys that do not include ours
        fund(&rpc, &theirs[0], Amount::from_sat(100_000), 5);

        assert!(ours[0].list_utxos(0, None).await.unwrap().is_empty());
    }
}
