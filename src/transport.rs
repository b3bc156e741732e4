//! Wallet transport contract.
//!
//! A wallet is anything that answers EIP-1193 `request({method, params})`
//! calls and optionally pushes `chainChanged` / `accountsChanged` / `message`
//! events. Older injected wallets only offer a callback based `sendAsync`;
//! those are adapted once, when the [`Transport`] is built, instead of probing
//! the object shape on every call.

use std::{fmt, sync::Arc};

use alloy::primitives::Address;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use crate::error::ProviderError;

// ============================================================================
// Requests and events
// ============================================================================

/// An EIP-1193 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// A request without parameters.
    pub fn method(method: impl Into<String>) -> Self {
        Self::new(method, Vec::new())
    }
}

/// Payload of an `eth_subscribe` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionMessage {
    pub subscription: String,
    pub result: Value,
}

/// Events a wallet may push.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Hex encoded chain id, as the wallet reported it.
    ChainChanged(String),
    AccountsChanged(Vec<Address>),
    /// An `eth_subscription` message.
    Message(SubscriptionMessage),
}

/// Wallet implementations with known quirks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalletVendor {
    Brave,
    Metamask,
    Frame,
    Opera,
    #[default]
    Unknown,
}

impl WalletVendor {
    /// Pick a vendor from the flags an injected provider exposes.
    ///
    /// Brave also sets the Metamask flag, so it is checked first.
    pub fn detect(is_brave: bool, is_metamask: bool, is_frame: bool, is_opera: bool) -> Self {
        if is_brave {
            WalletVendor::Brave
        } else if is_metamask {
            WalletVendor::Metamask
        } else if is_frame {
            WalletVendor::Frame
        } else if is_opera {
            WalletVendor::Opera
        } else {
            WalletVendor::Unknown
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WalletVendor::Brave => "Brave",
            WalletVendor::Metamask => "Metamask",
            WalletVendor::Frame => "Frame",
            WalletVendor::Opera => "Opera",
            WalletVendor::Unknown => "unknown",
        }
    }

    /// Inverse of [`WalletVendor::name`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "Brave" => WalletVendor::Brave,
            "Metamask" => WalletVendor::Metamask,
            "Frame" => WalletVendor::Frame,
            "Opera" => WalletVendor::Opera,
            _ => WalletVendor::Unknown,
        }
    }
}

impl fmt::Display for WalletVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Provider traits
// ============================================================================

/// Request style EIP-1193 provider.
#[cfg_attr(target_family = "wasm", async_trait(?Send))]
#[cfg_attr(not(target_family = "wasm"), async_trait)]
pub trait Eip1193Provider: Send + Sync {
    async fn request(&self, request: RpcRequest) -> Result<Value, ProviderError>;

    /// Event stream, if the wallet pushes events at all.
    fn events(&self) -> Option<broadcast::Receiver<ProviderEvent>> {
        None
    }

    fn vendor(&self) -> WalletVendor {
        WalletVendor::Unknown
    }
}

/// Completion callback of a legacy `sendAsync` call.
pub type LegacyCallback = Box<dyn FnOnce(Result<Value, ProviderError>) + Send>;

/// Callback style provider (`sendAsync(payload, cb)`).
pub trait LegacyProvider: Send + Sync {
    fn send_async(&self, request: RpcRequest, callback: LegacyCallback);

    fn events(&self) -> Option<broadcast::Receiver<ProviderEvent>> {
        None
    }

    fn vendor(&self) -> WalletVendor {
        WalletVendor::Unknown
    }
}

// ============================================================================
// Transport
// ============================================================================

/// A raw wallet transport, tagged with its calling convention.
#[derive(Clone)]
pub enum Transport {
    Request(Arc<dyn Eip1193Provider>),
    Legacy(Arc<dyn LegacyProvider>),
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Request(_) => f.write_str("Transport::Request"),
            Transport::Legacy(_) => f.write_str("Transport::Legacy"),
        }
    }
}

impl<P: Eip1193Provider + 'static> From<Arc<P>> for Transport {
    fn from(provider: Arc<P>) -> Self {
        Transport::Request(provider)
    }
}

impl From<Arc<dyn Eip1193Provider>> for Transport {
    fn from(provider: Arc<dyn Eip1193Provider>) -> Self {
        Transport::Request(provider)
    }
}

impl Transport {
    pub fn legacy(provider: Arc<dyn LegacyProvider>) -> Self {
        Transport::Legacy(provider)
    }

    pub async fn request(&self, request: RpcRequest) -> Result<Value, ProviderError> {
        match self {
            Transport::Request(provider) => provider.request(request).await,
            Transport::Legacy(provider) => {
                let (tx, rx) = oneshot::channel();
                provider.send_async(
                    request,
                    Box::new(move |result| {
                        let _ = tx.send(result);
                    }),
                );
                rx.await.map_err(|_| {
                    ProviderError::Transport("legacy provider dropped the callback".into())
                })?
            }
        }
    }

    /// Request and deserialize the result.
    pub async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<R, ProviderError> {
        let value = self.request(RpcRequest::new(method, params)).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn events(&self) -> Option<broadcast::Receiver<ProviderEvent>> {
        match self {
            Transport::Request(provider) => provider.events(),
            Transport::Legacy(provider) => provider.events(),
        }
    }

    pub fn vendor(&self) -> WalletVendor {
        match self {
            Transport::Request(provider) => provider.vendor(),
            Transport::Legacy(provider) => provider.vendor(),
        }
    }

    /// Whether both handles point at the same wallet object.
    pub fn same_as(&self, other: &Transport) -> bool {
        match (self, other) {
            (Transport::Request(a), Transport::Request(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            (Transport::Legacy(a), Transport::Legacy(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            _ => false,
        }
    }
}
