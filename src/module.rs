//! Pluggable wallet modules.
//!
//! A module turns some external wallet (WalletConnect, a hardware bridge...)
//! into an EIP-1193 transport. Modules can be handed to the session directly
//! or behind a loader that builds them on first use.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use crate::{error::StateError, transport::Transport};

/// Result of a successful [`WalletModule::setup`].
#[derive(Debug, Clone)]
pub struct ModuleSetup {
    pub chain_id: u64,
    pub provider: Transport,
}

#[cfg_attr(target_family = "wasm", async_trait(?Send))]
#[cfg_attr(not(target_family = "wasm"), async_trait)]
pub trait WalletModule: Send + Sync {
    fn id(&self) -> &str;

    async fn setup(&self, config: Option<Value>) -> Result<ModuleSetup, StateError>;

    /// Session teardown hook.
    async fn disconnect(&self);

    /// Explicit logout, when the module distinguishes it from disconnect.
    async fn logout(&self) {}
}

/// Lazily builds a module.
#[cfg_attr(target_family = "wasm", async_trait(?Send))]
#[cfg_attr(not(target_family = "wasm"), async_trait)]
pub trait WalletModuleLoader: Send + Sync {
    fn id(&self) -> &str;

    async fn load(&self) -> Result<Arc<dyn WalletModule>, StateError>;
}

/// Wallet type id of the injected provider.
pub const BUILTIN: &str = "builtin";

/// A wallet choice offered to the user.
#[derive(Clone)]
pub enum WalletOption {
    /// The injected provider, or an announced injected wallet by name.
    Builtin,
    Module(Arc<dyn WalletModule>),
    Loader(Arc<dyn WalletModuleLoader>),
}

impl WalletOption {
    pub fn id(&self) -> &str {
        match self {
            WalletOption::Builtin => BUILTIN,
            WalletOption::Module(module) => module.id(),
            WalletOption::Loader(loader) => loader.id(),
        }
    }

    /// Resolve to a module, loading it if needed. `None` for builtin.
    pub async fn module(&self) -> Result<Option<Arc<dyn WalletModule>>, StateError> {
        match self {
            WalletOption::Builtin => Ok(None),
            WalletOption::Module(module) => Ok(Some(module.clone())),
            WalletOption::Loader(loader) => loader.load().await.map(Some),
        }
    }
}

impl fmt::Debug for WalletOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WalletOption").field(&self.id()).finish()
    }
}
