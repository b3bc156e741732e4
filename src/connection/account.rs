//! Account resolution, unlock and account data loading.
//!
//! Every resolution takes a load id from the session counter. A load that
//! sees the counter move on (another account, another chain, a disconnect)
//! stops touching state, so only the latest resolution ever lands.

use std::{fmt, sync::atomic::Ordering};

use alloy::primitives::Address;
use async_trait::async_trait;
use serde_json::Value;

use super::{Session, ACCOUNT_TIERS};
use crate::{
    deadline::call_as_with_deadline,
    error::{ProviderError, ProviderErrorKind, SessionError, StateError},
    networks::Contracts,
    state::{AccountState, AccountStatus, DisconnectedAccount, LoadingStep},
    transport::WalletVendor,
    wrap::WrappedProvider,
};

/// Shown while account data waits for the network to resolve.
pub(super) const WAITING_FOR_NETWORK: &str = "Waiting for Network...";

/// Step id used when a loader does not name one.
pub const DEFAULT_LOADING_STEP: &str = "WaitingForConfirmation";

const METAMASK_UNLOCK_HINT: &str =
    "To unlock your wallet, please click on the Metamask add-on's icon and unlock from there.";
const BRAVE_UNLOCK_HINT: &str =
    "To unlock your wallet, please click on the Brave wallet's icon and unlock from there.";

/// Application hook that loads per-account data before the account counts as
/// connected.
#[async_trait]
pub trait AccountDataLoader: Send + Sync {
    async fn load(&self, context: AccountDataContext) -> Result<(), StateError>;

    async fn unload(&self) -> Result<(), StateError>;
}

/// Handed to [`AccountDataLoader::load`].
pub struct AccountDataContext {
    pub address: Address,
    pub chain_id: Option<u64>,
    pub contracts: Option<Contracts>,
    pub provider: Option<WrappedProvider>,
    session: Session,
    load_id: u64,
}

impl fmt::Debug for AccountDataContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountDataContext")
            .field("address", &self.address)
            .field("chain_id", &self.chain_id)
            .field("load_id", &self.load_id)
            .finish_non_exhaustive()
    }
}

impl AccountDataContext {
    /// Whether this load is still the latest one.
    pub fn is_current(&self) -> bool {
        self.session.inner.load_counter.load(Ordering::SeqCst) == self.load_id
    }

    /// Show progress. Empty messages keep the current one.
    pub fn set_loading_message(&self, message: impl Into<String>) {
        let message = message.into();
        if message.is_empty() || !self.is_current() {
            return;
        }
        self.session
            .inner
            .account
            .send_modify(|account| account.update_disconnected(|a| a.loading_data = Some(message)));
    }

    /// Publish an intermediate step and wait until the application accepts
    /// or rejects it.
    pub async fn wait_for_step(
        &self,
        step: Option<&str>,
        data: Option<Value>,
    ) -> Result<Option<Value>, StateError> {
        let step = LoadingStep {
            id: step.unwrap_or(DEFAULT_LOADING_STEP).to_string(),
            data,
        };
        tracing::debug!(step = %step.id, "waiting for loading step");
        self.session
            .inner
            .account
            .send_modify(|account| account.update_disconnected(|a| a.loading_step = Some(step)));

        let outcome = self.session.inner.loading_step.promise(|| {}).await;

        if self.is_current() {
            self.session
                .inner
                .account
                .send_modify(|account| account.update_disconnected(|a| a.loading_step = None));
        }
        outcome.unwrap_or_else(|| Err(StateError::new("loading step abandoned")))
    }
}

/// Connection error shown when a vendor needs the user to unlock by hand.
/// The flag says whether waiting tiers should settle now.
fn vendor_unlock_hint(vendor: Option<WalletVendor>, error: &ProviderError) -> Option<(&'static str, bool)> {
    let message = error.message();
    match (vendor?, error.kind()) {
        (WalletVendor::Metamask, ProviderErrorKind::AlreadyProcessing)
            if message.contains("Already processing eth_requestAccounts")
                || message.contains("wallet_requestPermissions' already pending") =>
        {
            Some((METAMASK_UNLOCK_HINT, false))
        }
        (WalletVendor::Brave, ProviderErrorKind::UserRejected)
            if message.contains("The user rejected the request.") =>
        {
            Some((BRAVE_UNLOCK_HINT, true))
        }
        _ => None,
    }
}

impl Session {
    fn is_stale_load(&self, load_id: u64) -> bool {
        self.inner.load_counter.load(Ordering::SeqCst) != load_id
    }

    fn next_load_id(&self) -> u64 {
        self.inner.load_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn set_account_connected(&self, address: Address) {
        tracing::info!(%address, "account connected");
        self.inner.account.send_replace(AccountState::connected(address));
        self.resolve_satisfied();
    }

    fn set_account_loading(&self, address: Address, message: String) {
        self.inner
            .account
            .send_replace(AccountState::disconnected(DisconnectedAccount {
                address: Some(address),
                loading_data: Some(message),
                ..Default::default()
            }));
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Reconcile the account state with `address`. `None` means locked.
    pub(super) async fn handle_account(&self, address: Option<Address>, new_chain: bool) {
        let Some(address) = address else {
            self.next_load_id();
            let interrupted = self.inner.account.borrow().loading_data().is_some();
            if interrupted {
                *self.inner.account_data_loaded.lock() = None;
            }
            tracing::debug!("no account exposed, wallet locked");
            self.inner.account.send_modify(|account| {
                account.update_disconnected(|a| {
                    a.locked = true;
                    a.unlocking = false;
                    a.loading_data = None;
                    a.loading_step = None;
                })
            });
            return;
        };

        let load_id = self.inner.load_counter.load(Ordering::SeqCst);
        self.check_nonce(address).await;
        if self.is_stale_load(load_id) {
            tracing::debug!(%address, "account resolution superseded");
            return;
        }

        let Some(loader) = self.inner.config.account_data.clone() else {
            self.next_load_id();
            self.set_account_connected(address);
            return;
        };

        let (network_ready, chain_id, contracts) = {
            let network = self.inner.network.borrow();
            (
                network.is_connected() || network.not_supported(),
                network.chain_id(),
                network.contracts().cloned(),
            )
        };
        if !network_ready {
            self.set_account_loading(address, WAITING_FOR_NETWORK.into());
            return;
        }

        let previous = *self.inner.account_data_loaded.lock();
        if previous == Some(address) && !new_chain {
            let (connected, loading) = {
                let account = self.inner.account.borrow();
                (account.is_connected(), account.loading_data().is_some())
            };
            if !connected && !loading {
                self.set_account_connected(address);
            }
            return;
        }

        *self.inner.account_data_loaded.lock() = Some(address);
        let load_id = self.next_load_id();
        if let Some(previous) = previous {
            self.set_account_loading(address, format!("Unloading... for ({previous})"));
            if let Err(e) = loader.unload().await {
                tracing::warn!(address = %previous, error = %e, "failed to unload account data");
            }
            if self.is_stale_load(load_id) {
                tracing::info!("account or network changed, stopping before load");
                return;
            }
        }
        self.set_account_loading(address, format!("Loading... {address}"));

        tracing::info!(%address, ?chain_id, "loading account data");
        let context = AccountDataContext {
            address,
            chain_id,
            contracts,
            provider: self.provider(),
            session: self.clone(),
            load_id,
        };
        let result = loader.load(context).await;
        if self.is_stale_load(load_id) {
            tracing::debug!(%address, "account data load superseded");
            return;
        }

        match result {
            Ok(()) => self.set_account_connected(address),
            Err(e) => {
                tracing::error!(%address, error = %e, "failed to load account data");
                *self.inner.account_data_loaded.lock() = None;
                let shown = e.clone();
                self.inner.account.send_replace(AccountState {
                    error: Some(shown),
                    status: AccountStatus::Disconnected(DisconnectedAccount {
                        address: Some(address),
                        ..Default::default()
                    }),
                });
                self.inner.readiness.reject_many(&ACCOUNT_TIERS, e);
            }
        }
    }

    /// Compare the wallet's nonce with the dev node's when checks are enabled
    /// for the current chain.
    async fn check_nonce(&self, address: Address) {
        let Some(diagnostics) = self.inner.diagnostics.clone() else {
            return;
        };
        let enabled = self
            .inner
            .config
            .dev_network
            .as_ref()
            .is_some_and(|dev| dev.check_cache_issues);
        let current = self.inner.network.borrow().chain_id();
        if !enabled || current != Some(diagnostics.chain_id()) {
            return;
        }
        let Some(provider) = self.provider() else {
            return;
        };

        tracing::info!(%address, "checking nonce...");
        match diagnostics.nonce_cached(address, &provider).await {
            Ok(status) => {
                if let Some(status) = status {
                    tracing::error!(%address, ?status, "nonce not matching, the wallet is caching stale data");
                }
                self.inner
                    .network
                    .send_modify(|network| network.diagnostics.nonce_cached = status);
                if status.is_some() {
                    self.spawn_diagnostic_loop(super::network::DiagnosticLoop::Nonce, true);
                }
            }
            Err(e) => tracing::warn!(%address, error = %e, "nonce check failed"),
        }
    }

    /// Read the exposed accounts and resolve the first one. With
    /// `auto_unlock`, a locked wallet is asked for access right away.
    pub(super) async fn fetch_account(&self, auto_unlock: bool) -> Result<(), SessionError> {
        let provider = self.provider().ok_or(SessionError::NoProvider)?;
        tracing::info!("fetching accounts...");
        let fetched = call_as_with_deadline::<Vec<Address>>(
            &provider,
            "eth_accounts",
            vec![],
            self.inner.config.request_timeout,
        )
        .await;
        let accounts = match fetched {
            Ok(accounts) => accounts,
            Err(e) if e.kind().is_benign_account_error() => {
                tracing::info!(error = %e, "account access not granted yet");
                vec![]
            }
            Err(e) => {
                let error = StateError::new("failed to fetch accounts").with_cause(e.clone());
                let shown = error.clone();
                self.inner
                    .connection
                    .send_modify(|state| state.error = Some(shown));
                self.inner.readiness.reject_many(&ACCOUNT_TIERS, error);
                return Err(e.into());
            }
        };

        let address = accounts.first().copied();
        *self.inner.last_account.lock() = address;
        self.handle_account(address, false).await;

        if auto_unlock && self.inner.account.borrow().locked() {
            return self.unlock().await;
        }
        Ok(())
    }

    // ========================================================================
    // Unlock
    // ========================================================================

    /// Ask the wallet for account access.
    pub async fn unlock(&self) -> Result<(), SessionError> {
        if !self.inner.account.borrow().locked() {
            self.inner
                .readiness
                .reject_many(&ACCOUNT_TIERS, SessionError::NotLocked.into());
            return Err(SessionError::NotLocked);
        }
        let provider = self.provider().ok_or(SessionError::NoProvider)?;
        let vendor = self
            .inner
            .connection
            .borrow()
            .wallet_type()
            .and_then(|w| w.name.as_deref().map(WalletVendor::from_name));

        tracing::info!("unlocking...");
        self.inner
            .account
            .send_modify(|account| account.update_disconnected(|a| a.unlocking = true));

        let accounts = match provider.call::<Vec<Address>>("eth_requestAccounts", vec![]).await {
            Ok(accounts) => accounts,
            Err(e) => {
                if let Some((hint, settle)) = vendor_unlock_hint(vendor, &e) {
                    tracing::info!(error = %e, "wallet needs to be unlocked by hand");
                    let error = StateError::new(hint).with_cause(e);
                    self.inner
                        .connection
                        .send_modify(|state| state.error = Some(error));
                    if settle {
                        self.clear_unlocking();
                        self.inner.readiness.resolve_many(&ACCOUNT_TIERS, false);
                    }
                    return Ok(());
                }
                if e.kind().is_user_rejection() {
                    tracing::info!("unlock rejected by the user");
                    self.clear_unlocking();
                    self.inner.readiness.resolve_many(&ACCOUNT_TIERS, false);
                    return Ok(());
                }
                tracing::error!(error = %e, "unlock failed");
                vec![]
            }
        };

        let address = accounts.first().copied();
        *self.inner.last_account.lock() = address;
        self.handle_account(address, false).await;
        Ok(())
    }

    /// Give up on unlocking: clears the unlock hint and settles the account
    /// tiers `false`.
    pub fn cancel_unlock(&self) {
        self.inner.connection.send_modify(|state| state.error = None);
        self.clear_unlocking();
        self.inner.readiness.resolve_many(&ACCOUNT_TIERS, false);
    }

    fn clear_unlocking(&self) {
        self.inner.account.send_if_modified(|account| match &mut account.status {
            AccountStatus::Disconnected(a) if a.unlocking => {
                a.unlocking = false;
                true
            }
            _ => false,
        });
    }

    // ========================================================================
    // Loading steps
    // ========================================================================

    /// Accept the loading step a loader is waiting on.
    pub fn accept_loading_step(&self, data: Option<Value>) {
        if !self.inner.loading_step.is_pending() {
            tracing::debug!("no loading step to accept");
        }
        self.inner.loading_step.resolve(data);
    }

    /// Reject the loading step a loader is waiting on.
    pub fn reject_loading_step(&self, error: StateError) {
        if !self.inner.loading_step.is_pending() {
            tracing::debug!("no loading step to reject");
        }
        self.inner.loading_step.reject(error);
    }

    // ========================================================================
    // Change detection
    // ========================================================================

    pub(super) fn has_account_changed(&self, address: Option<Address>) -> bool {
        *self.inner.last_account.lock() != address
    }

    /// `accountsChanged` handler, shared by the event and polling paths.
    pub(super) async fn on_accounts_changed(&self, address: Option<Address>) {
        {
            let mut last = self.inner.last_account.lock();
            if *last == address {
                tracing::debug!("false account changed");
                return;
            }
            *last = address;
        }
        tracing::info!(?address, "accounts changed");
        self.handle_account(address, false).await;
    }
}
