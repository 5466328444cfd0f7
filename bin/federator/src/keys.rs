//! This node's key material and the key-only modes.

use std::{fs, str::FromStr};

use alloy::{primitives::Address, signers::local::PrivateKeySigner};
use anyhow::{ensure, Context};
use bitcoin::{
    bip32::{Xpriv, Xpub},
    secp256k1::Secp256k1,
};
use federator_key_deriv::derive_deposit_address_info;
use federator_primitives::params::NetworkParams;

use crate::config::{BtcConfig, Config, EvmConfig};

pub(crate) fn load_xpriv(config: &BtcConfig) -> anyhow::Result<Xpriv> {
    let path = &config.xpriv_path;
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read xpriv from {}", path.display()))?;
    Xpriv::from_str(raw.trim()).with_context(|| format!("invalid xpriv in {}", path.display()))
}

pub(crate) fn load_evm_signer(config: &EvmConfig) -> anyhow::Result<PrivateKeySigner> {
    let path = &config.private_key_path;
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read EVM key from {}", path.display()))?;
    PrivateKeySigner::from_str(raw.trim())
        .with_context(|| format!("invalid EVM key in {}", path.display()))
}

/// Prints what the other federators need to know about this node.
pub(crate) fn print_xpub(config: &Config) -> anyhow::Result<()> {
    let xpriv = load_xpriv(&config.btc)?;
    let xpub = Xpub::from_priv(&Secp256k1::signing_only(), &xpriv);
    let signer = load_evm_signer(&config.evm)?;
    ensure!(
        config.btc.xpubs.contains(&xpub),
        "xpub {xpub} is missing from [btc].xpubs"
    );

    println!("xpub: {xpub}");
    println!("evm address: {}", signer.address());
    Ok(())
}

pub(crate) fn print_deposit_address(config: &Config, evm_address: Address) -> anyhow::Result<()> {
    let params = NetworkParams::new(config.network);
    let info = derive_deposit_address_info(
        &config.btc.xpubs,
        config.btc.required,
        &evm_address.to_checksum(None),
        0,
        &params,
    )?;
    println!("address: {}", info.address);
    println!("derivation path: {}", info.derivation_path);
    Ok(())
}
