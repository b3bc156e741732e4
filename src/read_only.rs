//! Read-only provider over a plain JSON-RPC endpoint.
//!
//! Used as the session's fallback when no wallet is selected: reads work,
//! anything that needs an account fails with a clear error.

use std::borrow::Cow;

use alloy::{
    network::Ethereum,
    providers::{Provider, RootProvider},
};
use async_trait::async_trait;
use reqwest::Url;
use serde_json::{json, Value};

use crate::{
    error::ProviderError,
    transport::{Eip1193Provider, RpcRequest},
};

/// Wallet type kind given to sessions connected through the default RPC.
pub const READ_ONLY: &str = "ReadOnly";

const WALLET_ONLY_METHODS: &[&str] = &[
    "eth_requestAccounts",
    "eth_sendTransaction",
    "eth_sign",
    "eth_signTransaction",
    "eth_signTypedData",
    "eth_signTypedData_v4",
    "personal_sign",
    "wallet_addEthereumChain",
    "wallet_switchEthereumChain",
    "eth_subscribe",
    "eth_unsubscribe",
];

/// EIP-1193 facade over an HTTP node.
#[derive(Clone)]
pub struct ReadOnlyRpcProvider {
    chain_id: u64,
    url: Url,
    provider: RootProvider<Ethereum>,
}

impl std::fmt::Debug for ReadOnlyRpcProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyRpcProvider")
            .field("chain_id", &self.chain_id)
            .field("url", &self.url.as_str())
            .finish()
    }
}

impl ReadOnlyRpcProvider {
    pub fn new(chain_id: u64, url: Url) -> Self {
        let provider = RootProvider::new_http(url.clone());
        Self {
            chain_id,
            url,
            provider,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Fail unless the node serves the configured chain.
    pub async fn verify_chain_id(&self) -> Result<(), ProviderError> {
        let actual = self.provider.get_chain_id().await?;
        if actual != self.chain_id {
            return Err(ProviderError::InvalidResponse(format!(
                "rpc at {} serves chain {actual}, expected {}",
                self.url, self.chain_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Eip1193Provider for ReadOnlyRpcProvider {
    async fn request(&self, request: RpcRequest) -> Result<Value, ProviderError> {
        let method = request.method.as_str();
        if WALLET_ONLY_METHODS.contains(&method) {
            return Err(ProviderError::Unsupported(format!(
                "{method} not available on read-only RPC providers."
            )));
        }
        if method == "eth_accounts" {
            return Ok(json!([]));
        }
        tracing::trace!(method, "read-only rpc request");
        let result = self
            .provider
            .raw_request::<_, Value>(Cow::Owned(request.method), request.params)
            .await?;
        Ok(result)
    }
}
