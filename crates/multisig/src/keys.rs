//! The local signing key and the cosigner set.

use std::{collections::BTreeMap, fmt};

use bitcoin::{
    bip32::{DerivationPath, Fingerprint, Xpriv, Xpub},
    PublicKey, ScriptBuf,
};
use federator_key_deriv::{derive_privkey, derive_pubkey, multisig_redeem_script};
use secp256k1::SECP256K1;

use crate::errors::{MultisigError, MultisigResult};

/// This node's master private key plus every cosigner's master public key.
#[derive(Clone)]
pub struct MultisigKeys {
    xpriv: Xpriv,
    xpubs: Vec<Xpub>,
    required: usize,
}

impl fmt::Debug for MultisigKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultisigKeys")
            .field("signer", &self.signer_xpub())
            .field("xpubs", &self.xpubs)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

impl MultisigKeys {
    /// Creates the key set. `xpriv` must neuter to one of `xpubs`.
    pub fn new(xpriv: Xpriv, xpubs: Vec<Xpub>, required: usize) -> MultisigResult<Self> {
        if required == 0 || required > xpubs.len() {
            return Err(MultisigError::InvalidThreshold {
                required,
                total: xpubs.len(),
            });
        }
        if !xpubs.contains(&Xpub::from_priv(SECP256K1, &xpriv)) {
            return Err(MultisigError::SignerNotInXpubs);
        }
        Ok(Self {
            xpriv,
            xpubs,
            required,
        })
    }

    /// Our own master xpub.
    pub fn signer_xpub(&self) -> Xpub {
        Xpub::from_priv(SECP256K1, &self.xpriv)
    }

    /// Our master fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        self.xpriv.fingerprint(SECP256K1)
    }

    /// Every cosigner's master xpub, ours included.
    pub fn xpubs(&self) -> &[Xpub] {
        &self.xpubs
    }

    /// Number of signatures needed to spend.
    pub const fn required(&self) -> usize {
        self.required
    }

    /// Child public keys of every cosigner at `path`, in xpub order.
    pub fn child_pubkeys(&self, path: &DerivationPath) -> MultisigResult<Vec<PublicKey>> {
        self.xpubs
            .iter()
            .map(|xpub| Ok(derive_pubkey(xpub, path)?.to_pub().into()))
            .collect()
    }

    /// The sorted multisig witness script at `path`.
    pub fn redeem_script(&self, path: &DerivationPath) -> MultisigResult<ScriptBuf> {
        Ok(multisig_redeem_script(
            self.required,
            self.child_pubkeys(path)?,
        )?)
    }

    /// BIP32 derivation entries for every cosigner key at `path`, as stored on PSBT inputs.
    pub fn bip32_derivation(
        &self,
        path: &DerivationPath,
    ) -> MultisigResult<BTreeMap<secp256k1::PublicKey, (Fingerprint, DerivationPath)>> {
        self.xpubs
            .iter()
            .map(|xpub| {
                let child = derive_pubkey(xpub, path)?;
                Ok((child.public_key, (xpub.fingerprint(), path.clone())))
            })
            .collect()
    }

    /// Our child private key at `path`.
    pub(crate) fn child_secret_key(
        &self,
        path: &DerivationPath,
    ) -> MultisigResult<secp256k1::SecretKey> {
        Ok(derive_privkey(&self.xpriv, path)?.private_key)
    }
}
