//! Multisig deposit addresses.

use bitcoin::{
    bip32::{DerivationPath, Xpub},
    opcodes::all::OP_CHECKMULTISIG,
    script::Builder,
    Address, PublicKey, ScriptBuf,
};
use federator_primitives::params::NetworkParams;

use crate::derive::{derive_path, derive_pubkey, DerivationError};

/// A derived per-user multisig deposit address.
///
/// This is a pure function of the master xpubs, the threshold, the EVM address and the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositAddressInfo {
    /// The `k`-of-`n` multisig witness script.
    pub redeem_script: ScriptBuf,

    /// The P2WSH output script committing to [`Self::redeem_script`].
    pub script_pubkey: ScriptBuf,

    /// The encoded segwit address.
    pub address: Address,

    /// Path used to derive each cosigner's child key.
    pub derivation_path: DerivationPath,

    /// The checksummed EVM address this deposit address belongs to.
    pub evm_address: String,

    /// Index of the address for this EVM account.
    pub index: u32,
}

/// Builds a standard `required`-of-`n` `OP_CHECKMULTISIG` script.
///
/// Keys are sorted by their serialized bytes first so that every cosigner produces the same
/// script regardless of the order it knows the keys in.
pub fn multisig_redeem_script(
    required: usize,
    mut pubkeys: Vec<PublicKey>,
) -> Result<ScriptBuf, DerivationError> {
    let total = pubkeys.len();
    if required == 0 || required > total || total > 16 {
        return Err(DerivationError::InvalidThreshold { required, total });
    }
    pubkeys.sort_by_key(|pk| pk.to_bytes());

    let builder = pubkeys
        .iter()
        .fold(Builder::new().push_int(required as i64), |b, pk| {
            b.push_key(pk)
        });
    Ok(builder
        .push_int(total as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script())
}

/// Derives the deposit address for `evm_address` at `index`.
pub fn derive_deposit_address_info(
    master_xpubs: &[Xpub],
    required: usize,
    evm_address: &str,
    index: u32,
    params: &NetworkParams,
) -> Result<DepositAddressInfo, DerivationError> {
    let derivation_path = derive_path(evm_address, index)?;
    let child_pubkeys = master_xpubs
        .iter()
        .map(|xpub| derive_pubkey(xpub, &derivation_path).map(|child| child.to_pub().into()))
        .collect::<Result<Vec<PublicKey>, _>>()?;

    let redeem_script = multisig_redeem_script(required, child_pubkeys)?;
    let address = Address::p2wsh(&redeem_script, params.network());

    Ok(DepositAddressInfo {
        script_pubkey: address.script_pubkey(),
        redeem_script,
        address,
        derivation_path,
        evm_address: evm_address.to_owned(),
        index,
    })
}

#[cfg(test)]
mod tests {
    use bitcoin::{bip32::Xpriv, Network};
    use secp256k1::SECP256K1;

    use super::*;

    const EVM_ADDRESS: &str = "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359";

    fn xpubs(network: Network) -> Vec<Xpub> {
        (1u8..=3)
            .map(|seed| {
                let xpriv = Xpriv::new_master(network, &[seed; 32]).unwrap();
                Xpub::from_priv(SECP256K1, &xpriv)
            })
            .collect()
    }

    #[test]
    fn address_is_independent_of_key_order() {
        let params = NetworkParams::new(Network::Regtest);
        let keys = xpubs(Network::Regtest);
        let mut reversed = keys.clone();
        reversed.reverse();

        let a = derive_deposit_address_info(&keys, 2, EVM_ADDRESS, 0, &params).unwrap();
        let b = derive_deposit_address_info(&reversed, 2, EVM_ADDRESS, 0, &params).unwrap();
        assert_eq!(a, b);
        assert!(a.script_pubkey.is_p2wsh());
        assert!(a.address.to_string().starts_with("bcrt1q"));
    }

    #[test]
    fn different_index_gives_different_address() {
        let params = NetworkParams::new(Network::Regtest);
        let keys = xpubs(Network::Regtest);
        let a = derive_deposit_address_info(&keys, 2, EVM_ADDRESS, 0, &params).unwrap();
        let b = derive_deposit_address_info(&keys, 2, EVM_ADDRESS, 1, &params).unwrap();
        assert_ne!(a.address, b.address);
    }

    #[test]
    fn network_selects_prefix() {
        let keys = xpubs(Network::Bitcoin);
        let main = derive_deposit_address_info(
            &keys,
            2,
            EVM_ADDRESS,
            0,
            &NetworkParams::new(Network::Bitcoin),
        )
        .unwrap();
        let test = derive_deposit_address_info(
            &keys,
            2,
            EVM_ADDRESS,
            0,
            &NetworkParams::new(Network::Testnet),
        )
        .unwrap();
        assert!(main.address.to_string().starts_with("bc1q"));
        assert!(test.address.to_string().starts_with("tb1q"));
        assert_eq!(main.redeem_script, test.redeem_script);
    }

    #[test]
    fn redeem_script_layout() {
        let params = NetworkParams::new(Network::Regtest);
        let keys = xpubs(Network::Regtest);
        let info = derive_deposit_address_info(&keys, 2, EVM_ADDRESS, 0, &params).unwrap();
        let bytes = info.redeem_script.as_bytes();
        // OP_2 <33> <33> <33> OP_3 OP_CHECKMULTISIG
        assert_eq!(bytes.len(), 1 + 3 * 34 + 1 + 1);
        assert_eq!(bytes[0], 0x52);
        assert_eq!(bytes[bytes.len() - 2], 0x53);
        assert_eq!(bytes[bytes.len() - 1], 0xae);
    }

    #[test]
    fn invalid_threshold() {
        let params = NetworkParams::new(Network::Regtest);
        let keys = xpubs(Network::Regtest);
        assert!(derive_deposit_address_info(&keys, 4, EVM_ADDRESS, 0, &params).is_err());
        assert!(derive_deposit_address_info(&keys, 0, EVM_ADDRESS, 0, &params).is_err());
    }
}
