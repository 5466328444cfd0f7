//! Builds every component of a federator node from its config and runs the bridges.

use std::{fs, str::FromStr, sync::Arc};

use anyhow::{bail, Context};
use bitcoin::bip32::DerivationPath;
use federator_db::{Database, SqliteDb};
use federator_evm::client::{connect_provider, AlloyRuneBridge, AlloyTapBridge};
use federator_multisig::{
    fees::FeeEstimator,
    rpc::{BitcoinRpc, BitcoindClient, BitcoindConfig},
    runes::{
        ord::{OrdApi, OrdClient},
        OrdMultisig,
    },
    wallet::DEFAULT_BASE_PATH,
    BitcoinMultisig, MultisigKeys,
};
use federator_orchestrator::{
    runes::RuneBridge,
    tap::{client::TapRestClient, to_tap::EvmToTapBridge, TapBridge},
    Bridge, BridgeRunner, DEFAULT_POLL_INTERVAL,
};
use federator_p2p::QuicNetwork;
use federator_primitives::params::NetworkParams;
use federator_transport::{
    federators::{CachedFederators, FederatorSource, DEFAULT_FEDERATOR_TTL},
    tls::{install_crypto_provider, load_client_config, load_server_config},
    HandshakeAuthenticator, ServerConfig,
};
use tracing::{info, warn};

use crate::{
    config::{secs_or, Config},
    constants::{
        DEFAULT_DB_FILE, DEFAULT_PEER_TIMEOUT, DEFAULT_RPC_RETRY_COUNT, DEFAULT_RPC_RETRY_INTERVAL,
        DEFAULT_RPC_TIMEOUT,
    },
    keys::{load_evm_signer, load_xpriv},
};

/// Wires the node together and runs it until ctrl-c.
pub(crate) async fn run(config: Config) -> anyhow::Result<()> {
    install_crypto_provider();
    let params = NetworkParams::new(config.network);
    let signer = load_evm_signer(&config.evm)?;
    info!(address = %signer.address(), network = %config.network, "federator identity loaded");

    fs::create_dir_all(&config.datadir)
        .with_context(|| format!("failed to create {}", config.datadir.display()))?;
    let db: Arc<dyn Database> = Arc::new(
        SqliteDb::connect(&config.datadir.join(DEFAULT_DB_FILE), config.db.clone()).await?,
    );

    let provider = connect_provider(&config.evm.rpc_url, signer.clone())?;
    let rune_contract = config
        .runes
        .as_ref()
        .map(|runes| Arc::new(AlloyRuneBridge::new(provider.clone(), runes.contract, signer.address())));
    let tap_contract = config
        .tap
        .as_ref()
        .map(|tap| Arc::new(AlloyTapBridge::new(provider.clone(), tap.contract)));

    // Peers authenticate against the federator set of whichever bridge we run.
    let federators: Arc<dyn FederatorSource> = match (&rune_contract, &tap_contract) {
        (Some(contract), _) => contract.clone(),
        (None, Some(contract)) => contract.clone(),
        (None, None) => bail!("neither [runes] nor [tap] is configured"),
    };
    let auth = Arc::new(HandshakeAuthenticator::new(
        signer.clone(),
        Arc::new(CachedFederators::new(federators, DEFAULT_FEDERATOR_TTL)),
    ));

    let p2p = &config.p2p;
    let network = Arc::new(QuicNetwork::new(
        p2p.node_id.clone(),
        p2p.leader_id.clone(),
        p2p.peers.clone(),
        auth,
        load_client_config(&config.tls).await?,
        secs_or(p2p.timeout_secs, DEFAULT_PEER_TIMEOUT),
    ));
    let server = network
        .start(ServerConfig {
            addr: p2p.listen_addr,
            connection_limit: p2p.connection_limit,
            tls_config: load_server_config(&config.tls).await?,
        })
        .await?;
    info!(node_id = %p2p.node_id, leader = %p2p.leader_id, "joined the federation");

    let mut bridges: Vec<Arc<dyn Bridge>> = Vec::new();

    if let (Some(runes), Some(contract)) = (&config.runes, rune_contract) {
        let ord_config = config
            .ord
            .as_ref()
            .context("[runes] needs an [ord] section")?;
        let btc = &config.btc;
        let rpc: Arc<dyn BitcoinRpc> = Arc::new(BitcoindClient::new(BitcoindConfig {
            url: btc.url.clone(),
            user: btc.user.clone(),
            pass: btc.pass.clone(),
            retry_count: btc.retry_count.unwrap_or(DEFAULT_RPC_RETRY_COUNT),
            retry_interval: btc
                .retry_interval_ms
                .map(std::time::Duration::from_millis)
                .unwrap_or(DEFAULT_RPC_RETRY_INTERVAL),
            timeout: secs_or(btc.timeout_secs, DEFAULT_RPC_TIMEOUT),
        })?);

        let keys = MultisigKeys::new(load_xpriv(btc)?, btc.xpubs.clone(), btc.required)?;
        let multisig = BitcoinMultisig::new(
            keys,
            params,
            rpc.clone(),
            DerivationPath::from_str(DEFAULT_BASE_PATH)?,
        );
        multisig.import_wallet_descriptor().await?;
        info!(change = %multisig.change_address()?, "custody wallet imported");

        let ord: Arc<dyn OrdApi> = Arc::new(OrdClient::new(
            ord_config.url.clone(),
            secs_or(ord_config.timeout_secs, DEFAULT_RPC_TIMEOUT),
        )?);
        let mempool_url = btc
            .mempool_url
            .clone()
            .or_else(|| FeeEstimator::default_mempool_url(config.network));
        let fees = FeeEstimator::new(rpc, params, mempool_url)?;

        bridges.push(Arc::new(RuneBridge::new(
            runes.bridge_config(),
            network.clone(),
            db.clone(),
            OrdMultisig::new(multisig, ord),
            contract,
            signer.clone(),
            fees,
        )));
    }

    if let (Some(tap), Some(contract)) = (&config.tap, tap_contract) {
        let client = TapRestClient::new(
            &tap.host,
            &tap.tls_cert_path,
            &tap.macaroon_path,
            secs_or(tap.timeout_secs, DEFAULT_RPC_TIMEOUT),
        )?;
        let client = Arc::new(client);
        bridges.push(Arc::new(EvmToTapBridge::new(
            tap.evm_to_tap_config(),
            network.clone(),
            db.clone(),
            client.clone(),
            contract.clone(),
            signer.clone(),
        )));
        bridges.push(Arc::new(TapBridge::new(
            tap.bridge_config(),
            network.clone(),
            db.clone(),
            client,
            contract,
            signer.clone(),
        )));
    }

    let runner = BridgeRunner::new(
        bridges,
        secs_or(config.poll_interval_secs, DEFAULT_POLL_INTERVAL),
    );
    runner
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(%e, "could not listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    server.abort();
    info!("federator stopped");
    Ok(())
}
