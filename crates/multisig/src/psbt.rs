//! Signing, combining, finalizing and broadcasting P2WSH multisig PSBTs.

use std::str::FromStr;

use bitcoin::{
    ecdsa,
    hashes::Hash,
    script::Instruction,
    secp256k1::{Message, SECP256K1},
    sighash::SighashCache,
    EcdsaSighashType, Psbt, PublicKey, Script, Transaction, Txid, Witness,
};
use tracing::{debug, info};

use crate::{
    errors::{MultisigError, MultisigResult},
    keys::MultisigKeys,
    rpc::BitcoinRpc,
};

/// Base64 encoding of `psbt`, the form PSBTs take on the wire and in the database.
pub fn serialize_psbt(psbt: &Psbt) -> String {
    psbt.to_string()
}

/// Decodes a base64 PSBT.
pub fn deserialize_psbt(encoded: &str) -> MultisigResult<Psbt> {
    Ok(Psbt::from_str(encoded)?)
}

/// Fee paid by `psbt`, from its witness UTXOs.
pub fn psbt_fee(psbt: &Psbt) -> MultisigResult<bitcoin::Amount> {
    Ok(psbt.fee()?)
}

/// Public keys of a bare multisig script, in script order.
pub fn multisig_pubkeys(script: &Script) -> Vec<PublicKey> {
    script
        .instructions()
        .filter_map(|ins| match ins {
            Ok(Instruction::PushBytes(bytes)) if bytes.len() == 33 => {
                PublicKey::from_slice(bytes.as_bytes()).ok()
            }
            _ => None,
        })
        .collect()
}

/// The threshold `k` of a `k`-of-`n` multisig script.
pub fn multisig_threshold(script: &Script) -> Option<usize> {
    script
        .as_bytes()
        .first()
        .filter(|op| (0x51..=0x60).contains(*op))
        .map(|op| usize::from(op - 0x50))
}

fn input_sighash(
    cache: &mut SighashCache<&Transaction>,
    psbt: &Psbt,
    index: usize,
) -> MultisigResult<Message> {
    let input = &psbt.inputs[index];
    let script = input
        .witness_script
        .as_ref()
        .ok_or(MultisigError::MalformedInput {
            index,
            reason: "missing witness script",
        })?;
    let value = input
        .witness_utxo
        .as_ref()
        .ok_or(MultisigError::MalformedInput {
            index,
            reason: "missing witness utxo",
        })?
        .value;
    let sighash = cache
        .p2wsh_signature_hash(index, script, value, EcdsaSighashType::All)
        .map_err(|e| MultisigError::Sighash(e.to_string()))?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}

/// Returns a copy of `psbt` with our signature added to every input. Never finalizes.
///
/// Each input must carry a BIP32 derivation for our master fingerprint.
pub fn sign_psbt(keys: &MultisigKeys, psbt: &Psbt) -> MultisigResult<Psbt> {
    let mut signed = psbt.clone();
    let tx = psbt.unsigned_tx.clone();
    let mut cache = SighashCache::new(&tx);
    let fingerprint = keys.fingerprint();

    for index in 0..signed.inputs.len() {
        let (derived_key, path) = signed.inputs[index]
            .bip32_derivation
            .iter()
            .find(|(_, (fp, _))| *fp == fingerprint)
            .map(|(pk, (_, path))| (*pk, path.clone()))
            .ok_or(MultisigError::NotOurInput(index))?;

        let secret_key = keys.child_secret_key(&path)?;
        if secret_key.public_key(SECP256K1) != derived_key {
            return Err(MultisigError::MalformedInput {
                index,
                reason: "derivation does not match our key",
            });
        }

        let message = input_sighash(&mut cache, psbt, index)?;
        let signature = SECP256K1.sign_ecdsa(&message, &secret_key);
        signed.inputs[index].partial_sigs.insert(
            PublicKey::new(derived_key),
            ecdsa::Signature::sighash_all(signature),
        );
    }

    debug!(txid = %tx.compute_txid(), inputs = signed.inputs.len(), "signed psbt");
    Ok(signed)
}

/// Combines `initial` with every PSBT in `signed` and finalizes each input.
///
/// Only signatures that verify against the input's sighash and belong to a key in its witness
/// script are used. They are ordered by key position in the script and cut at the script's
/// threshold.
pub fn combine_and_finalize_psbt(initial: &Psbt, signed: &[Psbt]) -> MultisigResult<Psbt> {
    let mut combined = initial.clone();
    for other in signed {
        combined.combine(other.clone())?;
    }

    let tx = combined.unsigned_tx.clone();
    let mut cache = SighashCache::new(&tx);

    for index in 0..combined.inputs.len() {
        let message = input_sighash(&mut cache, &combined, index)?;
        let input = &mut combined.inputs[index];
        let script = input
            .witness_script
            .take()
            .ok_or(MultisigError::MalformedInput {
                index,
                reason: "missing witness script",
            })?;
        let required = multisig_threshold(&script).ok_or(MultisigError::MalformedInput {
            index,
            reason: "witness script is not a multisig",
        })?;

        let mut sigs: Vec<ecdsa::Signature> = multisig_pubkeys(&script)
            .iter()
            .filter_map(|pk| input.partial_sigs.get(pk).map(|sig| (pk, sig)))
            .filter(|(pk, sig)| {
                sig.sighash_type == EcdsaSighashType::All
                    && SECP256K1
                        .verify_ecdsa(&message, &sig.signature, &pk.inner)
                        .is_ok()
            })
            .map(|(_, sig)| *sig)
            .collect();

        if sigs.len() < required {
            return Err(MultisigError::CannotFinalize {
                input: index,
                valid: sigs.len(),
                required,
            });
        }
        sigs.truncate(required);

        let mut witness = Witness::new();
        witness.push(Vec::<u8>::new());
        for sig in &sigs {
            witness.push(sig.to_vec());
        }
        witness.push(script.as_bytes());

        input.final_script_witness = Some(witness);
        input.partial_sigs.clear();
        input.bip32_derivation.clear();
        input.sighash_type = None;
        input.redeem_script = None;
    }

    Ok(combined)
}

/// Extracts the final transaction from a finalized PSBT.
pub fn extract_tx(psbt: &Psbt) -> MultisigResult<Transaction> {
    psbt.clone()
        .extract_tx()
        .map_err(|e| MultisigError::Extract(e.to_string()))
}

/// Test-accepts the finalized transaction, then sends it.
pub async fn broadcast_psbt(rpc: &dyn BitcoinRpc, psbt: &Psbt) -> MultisigResult<Txid> {
    let tx = extract_tx(psbt)?;
    let results = rpc.test_mempool_accept(&tx).await?;
    let verdict = results
        .into_iter()
        .next()
        .ok_or_else(|| MultisigError::RejectedByMempool("empty testmempoolaccept result".into()))?;
    if !verdict.allowed {
        return Err(MultisigError::RejectedByMempool(
            verdict.reject_reason.unwrap_or_default(),
        ));
    }

    let txid = rpc.send_raw_transaction(&tx).await?;
    info!(%txid, "broadcast transaction");
    Ok(txid)
}

#[cfg(test)]
mod tests {
    use bitcoin::{Amount, Network};
    use federator_primitives::{params::NetworkParams, types::Transfer};

    use super::*;
    use crate::test_utils::{fund, test_wallets, MockBitcoinRpc};

    const RECIPIENT: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";

    async fn unsigned_psbt(rpc: &MockBitcoinRpc) -> (Vec<crate::BitcoinMultisig>, Psbt) {
        let wallets = test_wallets(3, 2, rpc, NetworkParams::new(Network::Regtest));
        fund(rpc, &wallets[0], Amount::from_sat(100_000), 3);
        fund(rpc, &wallets[0], Amount::from_sat(50_000), 1);
        let psbt = wallets[0]
            .construct_psbt(&[Transfer::new(RECIPIENT, Amount::from_sat(120_000))], 2)
            .await
            .unwrap();
        (wallets, psbt)
    }

    #[tokio::test]
    async fn threshold_signatures_finalize() {
        let rpc = MockBitcoinRpc::default();
        let (wallets, psbt) = unsigned_psbt(&rpc).await;
        assert_eq!(psbt.inputs.len(), 2);

        let a = wallets[0].sign_psbt(&psbt).unwrap();
        let c = wallets[2].sign_psbt(&psbt).unwrap();

        let finalized = combine_and_finalize_psbt(&psbt, &[a, c]).unwrap();
        for input in &finalized.inputs {
            let witness = input.final_script_witness.as_ref().unwrap();
            // empty, two sigs, script
            assert_eq!(witness.len(), 4);
            assert!(input.partial_sigs.is_empty());
        }

        let txid = broadcast_psbt(&rpc, &finalized).await.unwrap();
        assert_eq!(rpc.sent_transactions()[0].compute_txid(), txid);
    }

    #[tokio::test]
    async fn one_short_of_threshold_fails() {
        let rpc = MockBitcoinRpc::default();
        let (wallets, psbt) = unsigned_psbt(&rpc).await;

        let a = wallets[1].sign_psbt(&psbt).unwrap();
        // the same signer twice counts once
        let err = combine_and_finalize_psbt(&psbt, &[a.clone(), a]).unwrap_err();
        assert!(matches!(
            err,
            MultisigError::CannotFinalize {
                valid: 1,
                required: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn forged_signature_is_ignored() {
        let rpc = MockBitcoinRpc::default();
        let (wallets, psbt) = unsigned_psbt(&rpc).await;

        let good = wallets[0].sign_psbt(&psbt).unwrap();
        let mut forged = wallets[1].sign_psbt(&psbt).unwrap();
        // move wallet 1's signatures onto wallet 2's keys
        for (index, input) in forged.inputs.iter_mut().enumerate() {
            let own = *input.partial_sigs.keys().next().unwrap();
            let sig = input.partial_sigs.remove(&own).unwrap();
            let script = input.witness_script.clone().unwrap();
            let theirs = multisig_pubkeys(&script)
                .into_iter()
                .find(|pk| *pk != own && !good.inputs[index].partial_sigs.contains_key(pk))
                .unwrap();
            input.partial_sigs.insert(theirs, sig);
        }

        let result = combine_and_finalize_psbt(&psbt, &[good, forged]);
        assert!(matches!(result, Err(MultisigError::CannotFinalize { .. })));
    }

    #[tokio::test]
    async fn mempool_rejection_is_not_sent() {
        let rpc = MockBitcoinRpc::default();
        let (wallets, psbt) = unsigned_psbt(&rpc).await;
        let a = wallets[0].sign_psbt(&psbt).unwrap();
        let b = wallets[1].sign_psbt(&psbt).unwrap();
        let finalized = combine_and_finalize_psbt(&psbt, &[a, b]).unwrap();

        rpc.reject_mempool("min relay fee not met");
        let err = broadcast_psbt(&rpc, &finalized).await.unwrap_err();
        assert!(matches!(err, MultisigError::RejectedByMempool(reason) if reason == "min relay fee not met"));
        assert!(rpc.sent_transactions().is_empty());
    }

    #[tokio::test]
    async fn base64_round_trip() {
        let rpc = MockBitcoinRpc::default();
        let (_, psbt) = unsigned_psbt(&rpc).await;
        let decoded = deserialize_psbt(&serialize_psbt(&psbt)).unwrap();
        assert_eq!(decoded, psbt);
        assert!(deserialize_psbt("not base64!").is_err());
    }
}
