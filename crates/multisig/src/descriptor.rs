//! Output descriptors: reading the per-UTXO descriptors bitcoind reports, and producing the
//! wallet descriptors we import into it.

use std::{
    collections::{BTreeMap, BTreeSet},
    str::FromStr,
};

use bitcoin::{
    bip32::{DerivationPath, Fingerprint, Xpub},
    PublicKey,
};
use miniscript::{
    descriptor::{DescriptorType, SinglePubKey},
    Descriptor, DescriptorPublicKey, ForEachKey,
};

use crate::errors::{MultisigError, MultisigResult};

/// What a `wsh(multi(..))` or `wsh(sortedmulti(..))` UTXO descriptor tells us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoDescriptor {
    /// Signatures needed to spend.
    pub num_required: usize,
    /// Keys in the script.
    pub num_signers: usize,
    /// Key origin of every key in the script.
    pub derivations: BTreeMap<PublicKey, (Fingerprint, DerivationPath)>,
    /// Master fingerprints of every cosigner.
    pub fingerprints: BTreeSet<Fingerprint>,
}

impl UtxoDescriptor {
    /// Derivation path of the key belonging to `fingerprint`, if it is one of ours.
    pub fn path_for(&self, fingerprint: Fingerprint) -> Option<&DerivationPath> {
        self.derivations
            .values()
            .find(|(fp, _)| *fp == fingerprint)
            .map(|(_, path)| path)
    }
}

/// Parses a P2WSH multisig descriptor with key origins, as found in `listunspent` output.
pub fn parse_utxo_descriptor(desc: &str) -> MultisigResult<UtxoDescriptor> {
    let descriptor = Descriptor::<DescriptorPublicKey>::from_str(desc)
        .map_err(|e| MultisigError::Descriptor(e.to_string()))?;

    if !matches!(
        descriptor.desc_type(),
        DescriptorType::Wsh | DescriptorType::WshSortedMulti
    ) {
        return Err(MultisigError::Descriptor(format!("not a P2WSH descriptor: {desc}")));
    }

    let mut keys = Vec::new();
    descriptor.for_each_key(|key| {
        keys.push(key.clone());
        true
    });

    let mut derivations = BTreeMap::new();
    for key in keys {
        let DescriptorPublicKey::Single(single) = key else {
            return Err(MultisigError::Descriptor(
                "extended keys are not expected in a UTXO descriptor".to_string(),
            ));
        };
        let SinglePubKey::FullKey(pubkey) = single.key else {
            return Err(MultisigError::Descriptor("x-only key in P2WSH".to_string()));
        };
        let origin = single
            .origin
            .ok_or_else(|| MultisigError::Descriptor(format!("key {pubkey} has no origin")))?;
        derivations.insert(pubkey, origin);
    }

    let script = descriptor
        .at_derivation_index(0)
        .map_err(|e| MultisigError::Descriptor(e.to_string()))?
        .explicit_script()
        .map_err(|e| MultisigError::Descriptor(e.to_string()))?;
    let num_required = script
        .as_bytes()
        .first()
        .filter(|op| (0x51..=0x60).contains(*op))
        .map(|op| usize::from(op - 0x50))
        .ok_or_else(|| MultisigError::Descriptor(format!("not a multisig script: {desc}")))?;

    let fingerprints = derivations.values().map(|(fp, _)| *fp).collect();
    Ok(UtxoDescriptor {
        num_required,
        num_signers: derivations.len(),
        derivations,
        fingerprints,
    })
}

fn path_suffix(path: &DerivationPath) -> String {
    path.into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("/")
}

fn with_checksum(desc: &str) -> MultisigResult<String> {
    Descriptor::<DescriptorPublicKey>::from_str(desc)
        .map(|d| d.to_string())
        .map_err(|e| MultisigError::Descriptor(e.to_string()))
}

/// `wsh(sortedmulti(k, xpub/path[/*], ...))#checksum` for `importdescriptors`.
///
/// With `ranged`, the descriptor covers every child of `path`; otherwise exactly `path`.
pub fn wallet_descriptor(
    xpubs: &[Xpub],
    required: usize,
    path: &DerivationPath,
    ranged: bool,
) -> MultisigResult<String> {
    let suffix = path_suffix(path);
    let keys = xpubs
        .iter()
        .map(|xpub| {
            let mut key = xpub.to_string();
            if !suffix.is_empty() {
                key.push('/');
                key.push_str(&suffix);
            }
            if ranged {
                key.push_str("/*");
            }
            key
        })
        .collect::<Vec<_>>()
        .join(",");
    with_checksum(&format!("wsh(sortedmulti({required},{keys}))"))
}

/// The single-key form bitcoind reports for one address of a wallet descriptor:
/// `wsh(sortedmulti(k, [fingerprint/path]pubkey, ...))#checksum`.
pub fn address_descriptor(
    origins: &[(Fingerprint, PublicKey)],
    required: usize,
    path: &DerivationPath,
) -> MultisigResult<String> {
    let suffix = path_suffix(path);
    let keys = origins
        .iter()
        .map(|(fp, pk)| format!("[{fp}/{suffix}]{pk}"))
        .collect::<Vec<_>>()
        .join(",");
    with_checksum(&format!("wsh(sortedmulti({required},{keys}))"))
}

#[cfg(test)]
mod tests {
    use bitcoin::{bip32::Xpriv, Network};
    use secp256k1::SECP256K1;

    use super::*;

    fn xpubs(n: u8) -> Vec<Xpub> {
        (1..=n)
            .map(|i| {
                let xpriv = Xpriv::new_master(Network::Regtest, &[i; 32]).unwrap();
                Xpub::from_priv(SECP256K1, &xpriv)
            })
            .collect()
    }

    #[test]
    fn address_descriptor_parses_back() {
        let path = DerivationPath::from_str("m/13/0/0/5").unwrap();
        let origins = xpubs(3)
            .iter()
            .map(|x| {
                let child = x.derive_pub(SECP256K1, &path).unwrap();
                (x.fingerprint(), PublicKey::new(child.public_key))
            })
            .collect::<Vec<_>>();

        let desc = address_descriptor(&origins, 2, &path).unwrap();
        assert!(desc.contains('#'));

        let parsed = parse_utxo_descriptor(&desc).unwrap();
        assert_eq!(parsed.num_required, 2);
        assert_eq!(parsed.num_signers, 3);
        for (fp, _) in &origins {
            assert!(parsed.fingerprints.contains(fp));
            assert_eq!(parsed.path_for(*fp), Some(&path));
        }
    }

    #[test]
    fn wallet_descriptor_is_ranged() {
        let path = DerivationPath::from_str("m/13/0/0").unwrap();
        let desc = wallet_descriptor(&xpubs(2), 2, &path, true).unwrap();
        assert!(desc.starts_with("wsh(sortedmulti(2,"));
        assert!(desc.contains("/13/0/0/*"));
        assert!(desc.contains('#'));
    }

    #[test]
    fn rejects_non_wsh() {
        let pk = "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";
        let desc = format!("wpkh([00000000/1]{pk})");
        assert!(parse_utxo_descriptor(&desc).is_err());
    }
}
