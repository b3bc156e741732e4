//! Session scenario framework.
//!
//! This module provides `SessionScenario` for building a `Session` around
//! fake wallets, plus helpers to wait for observable state.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use tokio::sync::watch;

use crate::ext::{
    ConnectionConfig, DevNetwork, KeyValueStore, MemoryStore, PollingConfig, ReadinessKey, Session,
    StateError, WalletOption, WrapConfig,
};

use super::{FakeReferenceNode, FakeWallet};

/// Upper bound for any wait in a scenario. Time is paused in these tests, so
/// this only trips when the awaited state never comes.
pub const SCENARIO_TIMEOUT: Duration = Duration::from_secs(120);

// ============================================================================
// SessionScenario
// ============================================================================

/// Builds a session over fake wallets.
pub struct SessionScenario {
    config: ConnectionConfig,
    store: Arc<MemoryStore>,
    wallet: Option<Arc<FakeWallet>>,
}

impl SessionScenario {
    /// Session whose builtin wallet is `wallet`, not reconnecting on start.
    pub fn builtin(wallet: Arc<FakeWallet>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let config = ConnectionConfig::default()
            .with_auto_connect(false)
            .with_builtin(wallet.clone())
            .with_store(store.clone())
            .with_polling(PollingConfig::default().with_interval(Duration::from_secs(1)))
            .with_request_timeout(Duration::from_secs(5));
        Self {
            config,
            store,
            wallet: Some(wallet),
        }
    }

    /// Session without a builtin wallet.
    pub fn without_builtin() -> Self {
        let store = Arc::new(MemoryStore::new());
        let config = ConnectionConfig::default()
            .with_auto_connect(false)
            .with_store(store.clone())
            .with_polling(PollingConfig::default().with_interval(Duration::from_secs(1)))
            .with_request_timeout(Duration::from_secs(5));
        Self {
            config,
            store,
            wallet: None,
        }
    }

    pub fn configure(mut self, f: impl FnOnce(ConnectionConfig) -> ConnectionConfig) -> Self {
        self.config = f(self.config);
        self
    }

    pub fn with_options(self, options: Vec<WalletOption>) -> Self {
        self.configure(|config| config.with_options(options))
    }

    /// Reconnect to `previous` on start.
    pub fn with_previous_selection(self, previous: &str) -> Self {
        crate::ext::record_selection(self.store.as_ref(), previous);
        self.configure(|config| config.with_auto_connect(true))
    }

    /// Run cache diagnostics against `node` for `chain_id`.
    pub fn with_dev_node(self, chain_id: u64, node: Arc<FakeReferenceNode>, nonce_checks: bool) -> Self {
        self.configure(|config| {
            config
                .with_dev_network(DevNetwork::new(chain_id, node).with_cache_checks(nonce_checks))
                .with_provider_config(WrapConfig::without_clock_check())
        })
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.store.clone()
    }

    /// Build the session and wait until it reports `initialised`.
    pub async fn start(self) -> RunningScenario {
        let session = Session::init(self.config);
        let mut connection = session.subscribe_connection();
        wait_for(&mut connection, |state| state.initialised)
            .await
            .unwrap_or_else(|e| panic!("session never initialised: {e}"));
        RunningScenario {
            session,
            store: self.store,
            wallet: self.wallet,
        }
    }
}

// ============================================================================
// RunningScenario
// ============================================================================

/// A started session and the fakes behind it.
pub struct RunningScenario {
    pub session: Session,
    pub store: Arc<MemoryStore>,
    pub wallet: Option<Arc<FakeWallet>>,
}

impl RunningScenario {
    pub fn wallet(&self) -> &Arc<FakeWallet> {
        self.wallet.as_ref().unwrap_or_else(|| panic!("scenario has no builtin wallet"))
    }

    pub fn stored(&self, key: &str) -> Option<String> {
        self.store.get(key)
    }

    /// `connect` the full tier, bounded by [`SCENARIO_TIMEOUT`].
    pub async fn connect_all(&self) -> Result<bool, StateError> {
        self.connect(ReadinessKey::ConnectionNetworkAccount).await
    }

    pub async fn connect(&self, tier: ReadinessKey) -> Result<bool, StateError> {
        tokio::time::timeout(SCENARIO_TIMEOUT, self.session.connect(tier))
            .await
            .unwrap_or_else(|_| panic!("connect({tier}) never settled"))
    }

    /// Wait until the session sees chain `chain_id` connected.
    pub async fn wait_for_chain(&self, chain_id: u64) -> Result<()> {
        let mut network = self.session.subscribe_network();
        wait_for(&mut network, |n| n.is_connected() && n.chain_id() == Some(chain_id))
            .await
            .map(|_| ())
    }

    /// Wait until the session's account is connected as `address`.
    pub async fn wait_for_account(&self, address: alloy::primitives::Address) -> Result<()> {
        let mut account = self.session.subscribe_account();
        wait_for(&mut account, |a| a.is_connected() && a.address() == Some(address))
            .await
            .map(|_| ())
    }

    /// Wait until the session's account reports locked.
    pub async fn wait_for_locked(&self) -> Result<()> {
        let mut account = self.session.subscribe_account();
        wait_for(&mut account, |a| a.locked()).await.map(|_| ())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Wait until `predicate` holds for the watched value, returning a snapshot.
pub async fn wait_for<T: Clone>(
    receiver: &mut watch::Receiver<T>,
    predicate: impl FnMut(&T) -> bool,
) -> Result<T> {
    let waited = tokio::time::timeout(SCENARIO_TIMEOUT, receiver.wait_for(predicate)).await;
    match waited {
        Ok(Ok(value)) => Ok(value.clone()),
        Ok(Err(_)) => Err(anyhow!("state channel closed")),
        Err(_) => Err(anyhow!("timed out after {SCENARIO_TIMEOUT:?}")),
    }
}

/// Let spawned handlers and one poll cycle run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(2)).await;
}
