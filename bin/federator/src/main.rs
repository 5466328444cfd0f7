//! A federator node: custodies runes and Taproot Assets together with its peers and mints and
//! burns their EVM representations.

use std::{fs, path::Path};

use anyhow::Context;
use args::Mode;
use clap::Parser;
use config::Config;
use constants::{DEFAULT_THREAD_COUNT, DEFAULT_THREAD_STACK_SIZE};
use federator_common::logging::{self, LoggerConfig};
use serde::de::DeserializeOwned;
use tokio::runtime;
use tracing::{debug, info, trace};

mod args;
mod bootstrap;
mod config;
mod keys;

mod constants;

fn main() -> anyhow::Result<()> {
    let mut logger = LoggerConfig::with_base_name("federator");
    if let Some(url) = logging::get_otlp_url_from_env() {
        logger.set_otlp_url(url);
    }
    logging::init(logger)?;

    let cli = args::Cli::parse();
    info!(mode = %cli.mode, "starting federator");

    let config = parse_toml::<Config>(&cli.config)?;

    match cli.mode {
        Mode::PrintXpub => keys::print_xpub(&config),
        Mode::DepositAddress => {
            let evm_address = cli
                .evm_address
                .context("deposit-address needs --evm-address")?;
            keys::print_deposit_address(&config, evm_address)
        }
        Mode::Federator => {
            let runtime = runtime::Builder::new_multi_thread()
                .worker_threads(config.num_threads.unwrap_or(DEFAULT_THREAD_COUNT).into())
                .thread_stack_size(
                    config
                        .thread_stack_size
                        .unwrap_or(DEFAULT_THREAD_STACK_SIZE),
                )
                .enable_all()
                .build()
                .context("failed to create the tokio runtime")?;
            runtime.block_on(bootstrap::run(config))
        }
    }
}

/// Reads and parses a TOML file from the given path into the given type `T`.
fn parse_toml<T>(path: impl AsRef<Path>) -> anyhow::Result<T>
where
    T: std::fmt::Debug + DeserializeOwned,
{
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    trace!(?raw, "read file");

    let parsed = toml::from_str::<T>(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    debug!(?parsed, "parsed TOML file");
    Ok(parsed)
}
