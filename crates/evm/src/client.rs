//! alloy-backed contract clients.

use std::fmt;

use alloy::{
    network::EthereumWallet,
    primitives::{Address, Bytes, B256, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
};
use async_trait::async_trait;
use federator_transport::federators::{FederatorLookupError, FederatorSource};
use tracing::{debug, info};

use crate::{
    contracts::{
        bindings::{IRuneBridge, ITapBridge},
        AcceptTransferFromBtc, RuneBridgeContract, RuneTransferToBtc, TapBridgeContract,
        TapTransfer, TransactionTracker, TransferToTap,
    },
    errors::{EvmError, EvmResult},
};

/// Connects an HTTP provider that signs and fills transactions with `signer`.
pub fn connect_provider(rpc_url: &str, signer: PrivateKeySigner) -> EvmResult<DynProvider> {
    let url = rpc_url
        .parse()
        .map_err(|e| EvmError::Config(format!("invalid EVM rpc url {rpc_url}: {e}")))?;
    Ok(ProviderBuilder::new()
        .wallet(EthereumWallet::from(signer))
        .connect_http(url)
        .erased())
}

fn to_usize(value: U256, what: &str) -> EvmResult<usize> {
    usize::try_from(value).map_err(|_| EvmError::InvalidData(format!("{what} out of range: {value}")))
}

fn to_u128(value: U256, what: &str) -> EvmResult<u128> {
    u128::try_from(value).map_err(|_| EvmError::InvalidData(format!("{what} out of range: {value}")))
}

async fn transaction_status(provider: &DynProvider, tx_hash: B256) -> EvmResult<Option<bool>> {
    let receipt = provider.get_transaction_receipt(tx_hash).await?;
    Ok(receipt.map(|receipt| receipt.status()))
}

/// The rune bridge contract over JSON-RPC.
#[derive(Clone)]
pub struct AlloyRuneBridge {
    contract: IRuneBridge::IRuneBridgeInstance<DynProvider>,
    provider: DynProvider,
    account: Address,
}

impl fmt::Debug for AlloyRuneBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlloyRuneBridge")
            .field("contract", self.contract.address())
            .field("account", &self.account)
            .finish()
    }
}

impl AlloyRuneBridge {
    /// The contract at `address`, sending from `account`.
    pub fn new(provider: DynProvider, address: Address, account: Address) -> Self {
        Self {
            contract: IRuneBridge::new(address, provider.clone()),
            provider,
            account,
        }
    }
}

#[async_trait]
impl FederatorSource for AlloyRuneBridge {
    async fn federators(&self) -> Result<Vec<Address>, FederatorLookupError> {
        self.contract
            .getFederators()
            .call()
            .await
            .map_err(|e| FederatorLookupError(e.to_string()))
    }
}

#[async_trait]
impl TransactionTracker for AlloyRuneBridge {
    async fn transaction_status(&self, tx_hash: B256) -> EvmResult<Option<bool>> {
        transaction_status(&self.provider, tx_hash).await
    }
}

#[async_trait]
impl RuneBridgeContract for AlloyRuneBridge {
    async fn is_federator(&self, account: Address) -> EvmResult<bool> {
        Ok(self.contract.isFederator(account).call().await?)
    }

    async fn num_required_federators(&self) -> EvmResult<usize> {
        let required = self.contract.numRequiredFederators().call().await?;
        to_usize(required, "numRequiredFederators")
    }

    async fn frozen(&self) -> EvmResult<bool> {
        Ok(self.contract.frozen().call().await?)
    }

    async fn is_rune_registered(&self, rune_number: u128) -> EvmResult<bool> {
        Ok(self
            .contract
            .isRuneRegistered(U256::from(rune_number))
            .call()
            .await?)
    }

    async fn accept_transfer_message_hash(
        &self,
        transfer: &AcceptTransferFromBtc,
    ) -> EvmResult<B256> {
        Ok(self
            .contract
            .getAcceptTransferFromBtcMessageHash(
                transfer.evm_address,
                U256::from(transfer.rune_number),
                U256::from(transfer.net_rune_amount),
                transfer.btc_txid,
                U256::from(transfer.btc_vout),
            )
            .call()
            .await?)
    }

    async fn accept_transfer_from_btc(
        &self,
        transfer: &AcceptTransferFromBtc,
        signatures: Vec<Bytes>,
    ) -> EvmResult<B256> {
        let pending = self
            .contract
            .acceptTransferFromBtc(
                transfer.evm_address,
                U256::from(transfer.rune_number),
                U256::from(transfer.net_rune_amount),
                transfer.btc_txid,
                U256::from(transfer.btc_vout),
                signatures,
            )
            .send()
            .await?;
        let tx_hash = *pending.tx_hash();
        info!(%tx_hash, to = %transfer.evm_address, "sent acceptTransferFromBtc");
        Ok(tx_hash)
    }

    async fn pending_transaction_count(&self) -> EvmResult<u64> {
        let pending = self
            .provider
            .get_transaction_count(self.account)
            .pending()
            .await?;
        let latest = self
            .provider
            .get_transaction_count(self.account)
            .latest()
            .await?;
        Ok(pending.saturating_sub(latest))
    }

    async fn block_number(&self) -> EvmResult<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn rune_transfers_to_btc(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> EvmResult<Vec<RuneTransferToBtc>> {
        let logs = self
            .contract
            .RuneTransferToBtc_filter()
            .from_block(from_block)
            .to_block(to_block)
            .query()
            .await?;
        debug!(from_block, to_block, count = logs.len(), "fetched RuneTransferToBtc logs");

        logs.into_iter()
            .map(|(event, log)| {
                Ok::<_, EvmError>(RuneTransferToBtc {
                    evm_tx_hash: log
                        .transaction_hash
                        .ok_or_else(|| EvmError::InvalidData("log without tx hash".into()))?,
                    log_index: log
                        .log_index
                        .ok_or_else(|| EvmError::InvalidData("log without index".into()))?,
                    block_number: log
                        .block_number
                        .ok_or_else(|| EvmError::InvalidData("log without block".into()))?,
                    from: event.from,
                    rune_number: to_u128(event.rune, "rune")?,
                    token: event.token,
                    receiver_btc_address: event.receiverBtcAddress,
                    net_rune_amount: to_u128(event.netRuneAmount, "netRuneAmount")?,
                    transferred_token_amount: event.transferredTokenAmount,
                })
            })
            .collect()
    }
}

/// The Taproot-Assets bridge contract over JSON-RPC.
#[derive(Clone)]
pub struct AlloyTapBridge {
    contract: ITapBridge::ITapBridgeInstance<DynProvider>,
    provider: DynProvider,
}

impl fmt::Debug for AlloyTapBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlloyTapBridge")
            .field("contract", self.contract.address())
            .finish()
    }
}

impl AlloyTapBridge {
    /// The contract at `address`.
    pub fn new(provider: DynProvider, address: Address) -> Self {
        Self {
            contract: ITapBridge::new(address, provider.clone()),
            provider,
        }
    }
}

#[async_trait]
impl FederatorSource for AlloyTapBridge {
    async fn federators(&self) -> Result<Vec<Address>, FederatorLookupError> {
        self.contract
            .getFederators()
            .call()
            .await
            .map_err(|e| FederatorLookupError(e.to_string()))
    }
}

#[async_trait]
impl TransactionTracker for AlloyTapBridge {
    async fn transaction_status(&self, tx_hash: B256) -> EvmResult<Option<bool>> {
        transaction_status(&self.provider, tx_hash).await
    }
}

#[async_trait]
impl TapBridgeContract for AlloyTapBridge {
    async fn num_required_signers(&self) -> EvmResult<usize> {
        let required = self.contract.numRequiredSigners().call().await?;
        to_usize(required, "numRequiredSigners")
    }

    async fn is_processed(&self, btc_txid: B256, btc_vout: u32) -> EvmResult<bool> {
        Ok(self
            .contract
            .isProcessed(btc_txid, U256::from(btc_vout))
            .call()
            .await?)
    }

    async fn transfer_message_hash(&self, transfer: &TapTransfer) -> EvmResult<B256> {
        Ok(self
            .contract
            .getTransferFromTapMessageHash(
                transfer.evm_address,
                transfer.tap_address.clone(),
                transfer.btc_txid,
                U256::from(transfer.btc_vout),
            )
            .call()
            .await?)
    }

    async fn accept_transfer_from_tap(
        &self,
        transfer: &TapTransfer,
        signatures: Vec<Bytes>,
    ) -> EvmResult<B256> {
        let pending = self
            .contract
            .acceptTransferFromTap(
                transfer.evm_address,
                transfer.tap_address.clone(),
                transfer.btc_txid,
                U256::from(transfer.btc_vout),
                signatures,
            )
            .send()
            .await?;
        let tx_hash = *pending.tx_hash();
        info!(%tx_hash, to = %transfer.evm_address, "sent acceptTransferFromTap");
        Ok(tx_hash)
    }

    async fn block_number(&self) -> EvmResult<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn transfers_to_tap(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> EvmResult<Vec<TransferToTap>> {
        let logs = self
            .contract
            .TransferToTap_filter()
            .from_block(from_block)
            .to_block(to_block)
            .query()
            .await?;
        debug!(from_block, to_block, count = logs.len(), "fetched TransferToTap logs");

        logs.into_iter()
            .map(|(event, log)| {
                Ok::<_, EvmError>(TransferToTap {
                    counter: u64::try_from(event.counter).map_err(|_| {
                        EvmError::InvalidData(format!("counter out of range: {}", event.counter))
                    })?,
                    from: event.from,
                    tap_address: event.tapAddress,
                    evm_tx_hash: log
                        .transaction_hash
                        .ok_or_else(|| EvmError::InvalidData("log without tx hash".into()))?,
                    block_number: log
                        .block_number
                        .ok_or_else(|| EvmError::InvalidData("log without block".into()))?,
                    log_index: log
                        .log_index
                        .ok_or_else(|| EvmError::InvalidData("log without index".into()))?,
                })
            })
            .collect()
    }
}
