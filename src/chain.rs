//! Chain cache diagnostics for development networks.
//!
//! Browser wallets cache chain data. When a local dev chain is restarted the
//! wallet may keep serving the old chain: a stale genesis hash, an old block
//! height, stale account nonces. These checks compare what the wallet reports
//! against a trusted node and turn mismatches into flags on the network state.
//! They never fail the session. Errors are logged and the flag stays unknown.

use std::{borrow::Cow, sync::Arc};

use alloy::{
    network::Ethereum,
    primitives::{Address, B256},
    providers::{Provider, RootProvider},
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::Url;
use serde_json::json;

use crate::{
    blocks::BlockHeader,
    storage::{self, KeyValueStore},
    wrap::WrappedProvider,
};

/// Blocks the wallet may lag behind the node before it is considered cached.
pub const BLOCK_HEIGHT_TOLERANCE: u64 = 2;

// ============================================================================
// Reference node
// ============================================================================

/// The trusted node wallet answers are compared against.
#[cfg_attr(target_family = "wasm", async_trait(?Send))]
#[cfg_attr(not(target_family = "wasm"), async_trait)]
pub trait ReferenceNode: Send + Sync {
    async fn genesis_hash(&self) -> anyhow::Result<B256>;

    async fn block_number(&self) -> anyhow::Result<u64>;

    async fn transaction_count(&self, address: Address) -> anyhow::Result<u64>;
}

/// [`ReferenceNode`] over JSON-RPC HTTP.
pub struct HttpReferenceNode {
    provider: RootProvider<Ethereum>,
}

impl HttpReferenceNode {
    pub fn new(url: Url) -> Self {
        Self {
            provider: RootProvider::new_http(url),
        }
    }
}

#[async_trait]
impl ReferenceNode for HttpReferenceNode {
    async fn genesis_hash(&self) -> anyhow::Result<B256> {
        let block: Option<BlockHeader> = self
            .provider
            .raw_request(Cow::Borrowed("eth_getBlockByNumber"), ("earliest", false))
            .await?;
        block
            .and_then(|b| b.hash)
            .ok_or_else(|| anyhow!("node returned no genesis block"))
    }

    async fn block_number(&self) -> anyhow::Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn transaction_count(&self, address: Address) -> anyhow::Result<u64> {
        Ok(self.provider.get_transaction_count(address).latest().await?)
    }
}

// ============================================================================
// Diagnostics state
// ============================================================================

/// How a wallet reported nonce compares to the node's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceCachedStatus {
    BelowNode,
    AboveNode,
}

/// Cache related flags carried by the network state. `None` means unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkDiagnostics {
    pub genesis_hash: Option<B256>,
    pub genesis_not_matching: Option<bool>,
    /// The genesis differs from the one acknowledged earlier (chain reset).
    pub genesis_changed: Option<bool>,
    pub nonce_cached: Option<NonceCachedStatus>,
    pub blocks_cached: Option<bool>,
    /// Persisted: a stale block cache was seen on this chain at some point.
    pub has_encountered_blocks_cache_issue: Option<bool>,
}

impl NetworkDiagnostics {
    /// Whether any check currently reports a cache problem.
    pub fn has_issue(&self) -> bool {
        self.genesis_not_matching == Some(true)
            || self.nonce_cached.is_some()
            || self.blocks_cached == Some(true)
    }
}

// ============================================================================
// ChainDiagnostics
// ============================================================================

/// Runs the cache checks for one dev chain.
pub struct ChainDiagnostics {
    chain_id: u64,
    node: Arc<dyn ReferenceNode>,
    store: Arc<dyn KeyValueStore>,
}

impl ChainDiagnostics {
    pub fn new(chain_id: u64, node: Arc<dyn ReferenceNode>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            chain_id,
            node,
            store,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Run the genesis and block height checks against `wallet`.
    ///
    /// Requests go through the wrapper, so a stale cache error met on the way
    /// still reaches its hook.
    pub async fn inspect(&self, wallet: &WrappedProvider) -> NetworkDiagnostics {
        tracing::info!(chain_id = self.chain_id, "checking genesis...");
        let mut diagnostics = NetworkDiagnostics {
            has_encountered_blocks_cache_issue: Some(
                storage::has_encountered_blocks_cache_issue(self.store.as_ref(), self.chain_id),
            ),
            ..Default::default()
        };

        match self.check_genesis(wallet).await {
            Ok((hash, matching)) => {
                if !matching {
                    tracing::warn!(chain_id = self.chain_id, %hash, "wallet returned a different genesis, it is serving cached data");
                }
                diagnostics.genesis_hash = Some(hash);
                diagnostics.genesis_not_matching = Some(!matching);
                diagnostics.genesis_changed = Some(storage::has_tracked_genesis_changed(
                    self.store.as_ref(),
                    self.chain_id,
                    hash,
                ));
            }
            Err(e) => tracing::warn!(chain_id = self.chain_id, error = %e, "genesis check failed"),
        }

        match self.blocks_cached(wallet).await {
            Ok(cached) => {
                if cached {
                    self.record_blocks_cache_issue();
                    diagnostics.has_encountered_blocks_cache_issue = Some(true);
                }
                diagnostics.blocks_cached = Some(cached);
            }
            Err(e) => tracing::warn!(chain_id = self.chain_id, error = %e, "block height check failed"),
        }
        diagnostics
    }

    /// The node's genesis hash and whether the wallet agrees with it.
    pub async fn check_genesis(&self, wallet: &WrappedProvider) -> anyhow::Result<(B256, bool)> {
        let from_wallet: Option<BlockHeader> = wallet
            .call("eth_getBlockByNumber", vec![json!("earliest"), json!(false)])
            .await
            .context("wallet genesis")?;
        let node_hash = self.node.genesis_hash().await.context("node genesis")?;
        let wallet_hash = from_wallet.and_then(|b| b.hash);
        Ok((node_hash, wallet_hash == Some(node_hash)))
    }

    /// Whether the wallet's latest block lags the node beyond tolerance.
    pub async fn blocks_cached(&self, wallet: &WrappedProvider) -> anyhow::Result<bool> {
        let wallet_block: Option<BlockHeader> = wallet
            .call("eth_getBlockByNumber", vec![json!("latest"), json!(false)])
            .await
            .context("wallet block")?;
        let wallet_block = wallet_block.context("wallet has no latest block")?;
        let node_block = self.node.block_number().await.context("node block")?;
        Ok(wallet_block.number().saturating_add(BLOCK_HEIGHT_TOLERANCE) < node_block)
    }

    /// Compare the wallet's view of `address`'s nonce with the node's.
    pub async fn nonce_cached(
        &self,
        address: Address,
        wallet: &WrappedProvider,
    ) -> anyhow::Result<Option<NonceCachedStatus>> {
        let from_wallet: alloy::primitives::U64 = wallet
            .call("eth_getTransactionCount", vec![json!(address), json!("latest")])
            .await
            .context("wallet nonce")?;
        let from_wallet = from_wallet.to::<u64>();
        let from_node = self.node.transaction_count(address).await.context("node nonce")?;
        Ok(match from_wallet.cmp(&from_node) {
            std::cmp::Ordering::Less => Some(NonceCachedStatus::BelowNode),
            std::cmp::Ordering::Greater => Some(NonceCachedStatus::AboveNode),
            std::cmp::Ordering::Equal => None,
        })
    }

    pub fn record_blocks_cache_issue(&self) {
        storage::record_blocks_cache_issue(self.store.as_ref(), self.chain_id);
    }

    /// Accept `hash` as this chain's genesis from now on.
    pub fn acknowledge_genesis(&self, hash: B256) {
        storage::record_new_genesis(self.store.as_ref(), self.chain_id, hash);
    }
}
