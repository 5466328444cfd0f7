//! Parses command-line arguments for the federator.

use std::{fmt::Display, path::PathBuf};

use alloy::primitives::Address;
use clap::{crate_version, Parser, ValueEnum};

#[derive(Debug, Parser)]
#[clap(
    name = "federator",
    about = "A federator node of the rune and Taproot-Assets bridges",
    version = crate_version!()
)]
pub(crate) struct Cli {
    #[arg(
        value_enum,
        help = "What to do: run the node, print this node's keys, or print a deposit address",
        default_value_t = Mode::Federator
    )]
    pub mode: Mode,

    #[clap(
        long,
        short = 'c',
        help = "The file containing the configuration for the federator",
        default_value = "config.toml",
        env = "FEDERATOR_CONFIG"
    )]
    pub config: PathBuf,

    #[clap(
        long,
        help = "EVM account whose rune deposit address to print (deposit-address mode)"
    )]
    pub evm_address: Option<Address>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum Mode {
    /// Run the bridges until interrupted.
    Federator,

    /// Print the BTC xpub and EVM address of this node's keys.
    PrintXpub,

    /// Print the rune deposit address of `--evm-address`.
    DepositAddress,
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Federator => write!(f, "federator"),
            Mode::PrintXpub => write!(f, "print-xpub"),
            Mode::DepositAddress => write!(f, "deposit-address"),
        }
    }
}
