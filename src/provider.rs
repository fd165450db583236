// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Access to an EVM node, narrowed to the queries the swap client needs,
//! and the signer capability surface.

use std::time::Duration;

use alloy::{
    network::{Ethereum, EthereumWallet},
    providers::{DynProvider, Provider, ProviderBuilder},
    rpc::types::{BlockNumberOrTag, Filter, Log, Transaction, TransactionReceipt,
        TransactionRequest},
};
use alloy_primitives::{Address, Bytes, Signature, TxHash};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use url::Url;

use crate::error::SwapError;

/// Poll interval while waiting for a transaction receipt.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Current fee information of the chain.
#[derive(Clone, Copy, Debug)]
pub struct FeeData {
    /// Legacy gas price.
    pub gas_price: u128,
    /// Base fee of the latest block, when the chain runs EIP-1559.
    pub last_base_fee_per_gas: Option<u128>,
    /// Suggested priority fee, when available.
    pub max_priority_fee_per_gas: Option<u128>,
}

impl FeeData {
    /// The price to use for fee estimates: the EIP-1559 base fee when the
    /// chain reports one, the legacy gas price otherwise.
    pub fn estimate_price(&self) -> u128 {
        self.last_base_fee_per_gas.unwrap_or(self.gas_price)
    }
}

/// The EVM node queries consumed by the swap client.
#[async_trait]
pub trait EvmQueries: Send + Sync {
    /// The latest block number.
    async fn get_block_number(&self) -> Result<u64, SwapError>;

    /// The logs matching `filter`.
    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, SwapError>;

    /// Executes a read-only call.
    async fn call(&self, tx: TransactionRequest) -> Result<Bytes, SwapError>;

    /// Signs (through the node's configured wallet) and submits a transaction.
    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, SwapError>;

    /// The receipt of a mined transaction, if any.
    async fn get_transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<TransactionReceipt>, SwapError>;

    /// A transaction by hash, if known to the node.
    async fn get_transaction_by_hash(&self, hash: TxHash)
        -> Result<Option<Transaction>, SwapError>;

    /// The current fee information.
    async fn get_fee_data(&self) -> Result<FeeData, SwapError>;

    /// The legacy gas price.
    async fn get_gas_price(&self) -> Result<u128, SwapError>;

    /// Waits until the transaction is mined and returns its receipt.
    async fn wait_for_transaction(&self, hash: TxHash) -> Result<TransactionReceipt, SwapError> {
        loop {
            if let Some(receipt) = self.get_transaction_receipt(hash).await? {
                return Ok(receipt);
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }
}

/// An EVM node endpoint backed by an `alloy` provider.
#[derive(Clone)]
pub struct EvmClient<M> {
    pub provider: M,
}

impl EvmClient<DynProvider> {
    /// Connects to a node for read-only queries.
    pub fn connect(url: &str) -> Result<Self, SwapError> {
        let rpc_url: Url = url.parse()?;
        let provider = ProviderBuilder::new().connect_http(rpc_url).erased();
        Ok(EvmClient { provider })
    }

    /// Connects to a node with a local signer wired in, so that
    /// [`EvmQueries::send_transaction`] signs before submitting.
    pub fn connect_with_signer(url: &str, signer: PrivateKeySigner) -> Result<Self, SwapError> {
        let rpc_url: Url = url.parse()?;
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(rpc_url)
            .erased();
        Ok(EvmClient { provider })
    }
}

#[async_trait]
impl<M> EvmQueries for EvmClient<M>
where
    M: Provider<Ethereum> + Send + Sync,
{
    async fn get_block_number(&self) -> Result<u64, SwapError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, SwapError> {
        Ok(self.provider.get_logs(filter).await?)
    }

    async fn call(&self, tx: TransactionRequest) -> Result<Bytes, SwapError> {
        Ok(self.provider.call(tx).await?)
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, SwapError> {
        let pending = self.provider.send_transaction(tx).await?;
        Ok(*pending.tx_hash())
    }

    async fn get_transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<TransactionReceipt>, SwapError> {
        Ok(self.provider.get_transaction_receipt(hash).await?)
    }

    async fn get_transaction_by_hash(
        &self,
        hash: TxHash,
    ) -> Result<Option<Transaction>, SwapError> {
        Ok(self.provider.get_transaction_by_hash(hash).await?)
    }

    async fn get_fee_data(&self) -> Result<FeeData, SwapError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await?;
        let last_base_fee_per_gas = block
            .and_then(|block| block.header.base_fee_per_gas)
            .map(u128::from);
        let max_priority_fee_per_gas = self.provider.get_max_priority_fee_per_gas().await.ok();
        let gas_price = self.provider.get_gas_price().await?;
        Ok(FeeData {
            gas_price,
            last_base_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }

    async fn get_gas_price(&self) -> Result<u128, SwapError> {
        Ok(self.provider.get_gas_price().await?)
    }
}

/// Signer capabilities used by the swap client.
///
/// Optional capabilities return `None` when the signer does not support
/// them; callers feature-test instead of downcasting.
pub trait EvmSignerExt: Send + Sync {
    /// The signer's address.
    fn address(&self) -> Address;

    /// Signs `message` through the EIP-191 personal-message envelope.
    fn sign_message(&self, message: &[u8]) -> Result<Signature, SwapError>;

    /// Whether the signer tracks the given transaction as pending.
    /// `None` if the signer has no pending-transaction tracking.
    fn is_tx_pending(&self, hash: TxHash) -> Option<bool> {
        let _ = hash;
        None
    }

    /// Invoked before a pending transaction is replaced, when supported.
    /// Returns `None` if the signer has no replacement hook.
    fn on_before_tx_replace(&self, previous: TxHash, replacement: &TransactionRequest)
        -> Option<()> {
        let _ = (previous, replacement);
        None
    }
}

impl EvmSignerExt for PrivateKeySigner {
    fn address(&self) -> Address {
        PrivateKeySigner::address(self)
    }

    fn sign_message(&self, message: &[u8]) -> Result<Signature, SwapError> {
        Ok(self.sign_message_sync(message)?)
    }
}
