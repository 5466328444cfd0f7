//! The rune-aware wallet: builds PSBTs that move rune balances out of custody.

use std::{collections::BTreeMap, str::FromStr, sync::Arc};

use bitcoin::{Amount, OutPoint, Psbt, TxOut};
use tracing::{debug, info};

use super::{
    ord::{OrdApi, OrdOutput},
    runestone::Runestone,
    types::{Edict, Rune, RuneId, RuneTransfer},
};
use crate::{
    errors::{MultisigError, MultisigResult},
    wallet::{BitcoinMultisig, Draft, Utxo},
};

/// Sats kept on the rune change output.
pub const TARGET_POSTAGE_SAT: Amount = Amount::from_sat(10_000);

/// Output index of the runestone.
pub const RUNESTONE_OUTPUT: usize = 0;

/// Output index receiving unallocated runes.
pub const RUNE_CHANGE_OUTPUT: u32 = 1;

/// Index of the first transfer output.
pub const FIRST_TRANSFER_OUTPUT: u32 = 2;

/// [`BitcoinMultisig`] plus an ord indexer for rune balances.
#[derive(Debug, Clone)]
pub struct OrdMultisig {
    multisig: BitcoinMultisig,
    ord: Arc<dyn OrdApi>,
}

impl OrdMultisig {
    /// Wraps `multisig` with an ord client.
    pub fn new(multisig: BitcoinMultisig, ord: Arc<dyn OrdApi>) -> Self {
        Self { multisig, ord }
    }

    /// The underlying BTC wallet.
    pub const fn multisig(&self) -> &BitcoinMultisig {
        &self.multisig
    }

    /// The ord client.
    pub fn ord(&self) -> &dyn OrdApi {
        self.ord.as_ref()
    }

    /// Raw balance of `rune` held by `outpoint`.
    pub async fn get_rune_balance_at_output(
        &self,
        outpoint: &OutPoint,
        rune: &str,
    ) -> MultisigResult<u128> {
        Ok(self.ord.output(outpoint).await?.rune_balance(rune))
    }

    /// The edicts `transfers` produce, resolving each rune's id through ord.
    pub async fn transfer_edicts(&self, transfers: &[RuneTransfer]) -> MultisigResult<Vec<Edict>> {
        let mut edicts = Vec::with_capacity(transfers.len());
        let mut ids = BTreeMap::<String, RuneId>::new();
        for (i, transfer) in transfers.iter().enumerate() {
            let name = Rune::unspaced(&transfer.rune);
            let id = match ids.get(&name) {
                Some(id) => *id,
                None => {
                    let entry = self.ord.rune(&name).await?.ok_or_else(|| {
                        MultisigError::InvalidRuneTransfer(format!("unknown rune {name}"))
                    })?;
                    ids.insert(name, entry.id);
                    entry.id
                }
            };
            let output = FIRST_TRANSFER_OUTPUT + u32::try_from(i).unwrap_or(u32::MAX);
            edicts.push(Edict {
                id,
                amount: transfer.amount,
                output,
            });
        }
        Ok(edicts)
    }

    fn validate(&self, transfer: &RuneTransfer) -> MultisigResult<TxOut> {
        let name = Rune::unspaced(&transfer.rune);
        Rune::from_str(&name).map_err(MultisigError::InvalidRuneTransfer)?;
        if transfer.amount == 0 {
            return Err(MultisigError::InvalidRuneTransfer(format!(
                "zero amount of {name}"
            )));
        }
        if transfer.postage == Amount::ZERO {
            return Err(MultisigError::InvalidRuneTransfer(format!(
                "zero postage for {name}"
            )));
        }
        let script_pubkey = self.multisig.params().script_pubkey(&transfer.receiver)?;
        Ok(TxOut {
            value: transfer.postage,
            script_pubkey,
        })
    }

    /// Builds an unsigned PSBT paying `transfers` from custody at `fee_rate` sat/vB.
    ///
    /// Output 0 is the runestone, output 1 keeps [`TARGET_POSTAGE_SAT`] and any unallocated
    /// runes, outputs 2.. pay the transfers, and a BTC change output may follow.
    pub async fn create_rune_psbt(
        &self,
        transfers: &[RuneTransfer],
        fee_rate: u64,
    ) -> MultisigResult<Psbt> {
        let transfer_outputs = transfers
            .iter()
            .map(|t| self.validate(t))
            .collect::<MultisigResult<Vec<_>>>()?;
        let edicts = self.transfer_edicts(transfers).await?;
        let runestone = Runestone {
            edicts,
            pointer: Some(RUNE_CHANGE_OUTPUT),
        }
        .encipher()?;

        let change_script = self.multisig.change_script_pubkey()?;
        let mut outputs = vec![
            TxOut {
                value: Amount::ZERO,
                script_pubkey: runestone,
            },
            TxOut {
                value: TARGET_POSTAGE_SAT,
                script_pubkey: change_script.clone(),
            },
        ];
        outputs.extend(transfer_outputs);

        let mut needed = BTreeMap::<String, u128>::new();
        for transfer in transfers {
            *needed.entry(Rune::unspaced(&transfer.rune)).or_default() += transfer.amount;
        }

        let mut draft = Draft::new(outputs);
        let mut rune_free = Vec::new();
        for utxo in self.multisig.list_utxos(0, None).await? {
            let outpoint = utxo.outpoint();
            let output = self.ord.output(&outpoint).await?;
            if !output.indexed {
                debug!(%outpoint, "skipping utxo not yet indexed by ord");
                continue;
            }
            if !output.inscriptions.is_empty() {
                debug!(%outpoint, "skipping utxo with inscriptions");
                continue;
            }
            if output.runes.is_empty() {
                rune_free.push(utxo);
                continue;
            }
            if needed.values().all(|n| *n == 0) {
                continue;
            }
            if take_runes(&mut needed, &output) {
                draft.add_input(utxo);
            }
        }

        let missing = needed
            .into_iter()
            .filter(|(_, amount)| *amount > 0)
            .map(|(name, _)| name)
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(MultisigError::MissingRuneBalances(missing));
        }

        let fee = self.fund(&mut draft, rune_free, fee_rate)?;
        let change = draft.input_total() - draft.output_total() - fee;
        if change > Amount::ZERO {
            draft.tx.output.push(TxOut {
                value: change,
                script_pubkey: change_script,
            });
        }

        info!(
            transfers = transfers.len(),
            inputs = draft.inputs.len(),
            %fee,
            "constructed rune psbt"
        );
        self.multisig.finish_psbt(draft, fee)
    }

    /// Adds rune-free UTXOs until the draft pays its outputs and fee, returning the fee.
    fn fund(&self, draft: &mut Draft, rune_free: Vec<Utxo>, fee_rate: u64) -> MultisigResult<Amount> {
        let required = self.multisig.required();
        let mut candidates = rune_free.into_iter();
        loop {
            let fee = draft.fee(required, fee_rate);
            let spent = draft.output_total() + fee;
            let available = draft.input_total();
            if available == spent || available >= spent + TARGET_POSTAGE_SAT {
                return Ok(fee);
            }
            match candidates.next() {
                Some(utxo) => draft.add_input(utxo),
                None => {
                    return Err(MultisigError::InsufficientFunds {
                        needed: spent,
                        available,
                    })
                }
            }
        }
    }
}

/// Subtracts what `output` holds from `needed`, returning whether it held anything needed.
fn take_runes(needed: &mut BTreeMap<String, u128>, output: &OrdOutput) -> bool {
    let mut useful = false;
    for (name, balance) in &output.runes {
        if let Some(remaining) = needed.get_mut(&Rune::unspaced(name)) {
            if *remaining > 0 && balance.amount > 0 {
                *remaining = remaining.saturating_sub(balance.amount);
                useful = true;
            }
        }
    }
    useful
}

#[cfg(test)]
mod tests {
    use bitcoin::Network;
    use federator_primitives::params::NetworkParams;

    use super::*;
    use crate::{
        psbt::psbt_fee,
        test_utils::{fund, test_wallets, MockBitcoinRpc, MockOrd},
    };

    const RECEIVER: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";
    const RUNE_ID: RuneId = RuneId { block: 100, tx: 1 };

    fn transfer(amount: u128) -> RuneTransfer {
        RuneTransfer {
            rune: "TEST•RUNE".into(),
            receiver: RECEIVER.into(),
            amount,
            postage: Amount::from_sat(10_000),
        }
    }

    fn setup() -> (MockBitcoinRpc, MockOrd, OrdMultisig) {
        let rpc = MockBitcoinRpc::default();
        let ord = MockOrd::default();
        ord.add_rune("TEST•RUNE", RUNE_ID, 2);
        let wallet = test_wallets(3, 2, &rpc, NetworkParams::new(Network::Regtest))
            .remove(0);
        let wallet = OrdMultisig::new(wallet, Arc::new(ord.clone()));
        (rpc, ord, wallet)
    }

    #[tokio::test]
    async fn layout_and_fee() {
        let (rpc, ord, wallet) = setup();
        let rune_utxo = fund(&rpc, wallet.multisig(), Amount::from_sat(10_000), 6);
        ord.set_runes(rune_utxo, "TEST•RUNE", 1_000);
        fund(&rpc, wallet.multisig(), Amount::from_sat(100_000), 3);

        let psbt = wallet.create_rune_psbt(&[transfer(600)], 5).await.unwrap();
        let tx = &psbt.unsigned_tx;
        assert_eq!(tx.input.len(), 2);
        assert_eq!(tx.output.len(), 4);
        assert_eq!(tx.output[1].value, TARGET_POSTAGE_SAT);
        assert_eq!(tx.output[2].value, Amount::from_sat(10_000));

        let runestone = Runestone::decipher(tx).unwrap().unwrap();
        assert_eq!(runestone.pointer, Some(RUNE_CHANGE_OUTPUT));
        assert_eq!(
            runestone.edicts,
            vec![Edict {
                id: RUNE_ID,
                amount: 600,
                output: 2
            }]
        );

        let fee = psbt_fee(&psbt).unwrap();
        assert!(fee > Amount::ZERO);
        let total_in = Amount::from_sat(110_000);
        let total_out: Amount = tx.output.iter().map(|o| o.value).sum();
        assert_eq!(total_in - total_out, fee);
    }

    #[tokio::test]
    async fn missing_runes_are_reported() {
        let (rpc, ord, wallet) = setup();
        let rune_utxo = fund(&rpc, wallet.multisig(), Amount::from_sat(10_000), 6);
        ord.set_runes(rune_utxo, "TEST•RUNE", 100);
        fund(&rpc, wallet.multisig(), Amount::from_sat(100_000), 3);

        let err = wallet.create_rune_psbt(&[transfer(600)], 5).await.unwrap_err();
        assert!(matches!(err, MultisigError::MissingRuneBalances(names) if names == ["TESTRUNE"]));
    }

    #[tokio::test]
    async fn inscribed_utxos_are_never_spent() {
        let (rpc, ord, wallet) = setup();
        let rune_utxo = fund(&rpc, wallet.multisig(), Amount::from_sat(10_000), 6);
        ord.set_runes(rune_utxo, "TEST•RUNE", 1_000);
        let inscribed = fund(&rpc, wallet.multisig(), Amount::from_sat(500_000), 9);
        ord.set_inscribed(inscribed);

        let err = wallet.create_rune_psbt(&[transfer(600)], 5).await.unwrap_err();
        assert!(matches!(err, MultisigError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn invalid_transfers_are_rejected() {
        let (_rpc, _ord, wallet) = setup();
        let zero = wallet.create_rune_psbt(&[transfer(0)], 5).await;
        assert!(matches!(zero, Err(MultisigError::InvalidRuneTransfer(_))));

        let mut lower = transfer(1);
        lower.rune = "test".into();
        let lower = wallet.create_rune_psbt(&[lower], 5).await;
        assert!(matches!(lower, Err(MultisigError::InvalidRuneTransfer(_))));

        let mut no_postage = transfer(1);
        no_postage.postage = Amount::ZERO;
        let no_postage = wallet.create_rune_psbt(&[no_postage], 5).await;
        assert!(matches!(no_postage, Err(MultisigError::InvalidRuneTransfer(_))));
    }
}
