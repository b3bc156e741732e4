//! Wallet session state machine.
//!
//! A [`Session`] reconciles three independently changing sources (the wallet
//! connection, the active chain and the unlocked account) into observable
//! state slices, and gates work on readiness tiers.
//!
//! ## Architecture
//!
//! ```text
//!   connect(tier) ──► SettlementRegistry<ReadinessKey> ──(first caller)──► attempt
//!        ▲                                                                   │
//!        │ resolve / reject                                                  ▼
//!   ┌────┴──────────────────────────────────────────────┐        select ─► create_provider
//!   │ handle_network ◄── chainChanged / chain poll       │                   │
//!   │ handle_account ◄── accountsChanged / account poll  │◄── listening ◄────┘
//!   └────┬──────────────────────────────────────────────┘
//!        ▼
//!   watch channels: connection / network / account / execution
//! ```
//!
//! Every tier that holds is settled `true` as soon as it holds. A disconnect
//! or cancel settles everything `false`. Wallet events are backed by polling
//! loops; both paths go through the same change detection so a change seen
//! twice is handled once.

mod account;
mod listen;
mod network;

pub use account::{AccountDataContext, AccountDataLoader, DEFAULT_LOADING_STEP};

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use alloy::primitives::Address;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};

use crate::{
    blocks::{BlockEmitter, BlockPoller, NewBlock},
    builtin::Builtin,
    chain::ChainDiagnostics,
    config::{AddChainParams, ChainParameters, ConnectionConfig},
    error::{ProviderError, SessionError, StateError},
    module::{WalletModule, BUILTIN},
    networks::{to_hex_chain_id, Contracts, NetworkSource},
    observer::{MultiObserver, ProviderObserver},
    pending::{PendingAction, PendingActions},
    read_only::{ReadOnlyRpcProvider, READ_ONLY},
    settlement::{SettlementRegistry, SettlementSlot},
    state::{
        AccountState, AccountStatus, ConnectedWallet, ConnectionState, ConnectionStatus,
        DisconnectedWallet, ExecutionState, NetworkState, NetworkStatus, ReadinessKey, WalletType,
    },
    storage,
    transport::{RpcRequest, Transport},
    wrap::{wrap, StaleCacheHook, WrappedProvider},
};

const NETWORK_TIERS: [ReadinessKey; 2] = [
    ReadinessKey::ConnectionNetwork,
    ReadinessKey::ConnectionNetworkAccount,
];

const ACCOUNT_TIERS: [ReadinessKey; 2] = [
    ReadinessKey::ConnectionAccount,
    ReadinessKey::ConnectionNetworkAccount,
];

/// Options for [`Session::select`].
#[derive(Debug, Clone)]
pub struct SelectOptions {
    /// Passed to the module's `setup`.
    pub module_config: Option<Value>,
    /// Ask for account access right away when the wallet is locked.
    pub auto_unlock: bool,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            module_config: None,
            auto_unlock: true,
        }
    }
}

impl SelectOptions {
    pub fn with_module_config(mut self, config: Value) -> Self {
        self.module_config = Some(config);
        self
    }

    pub fn with_auto_unlock(mut self, auto_unlock: bool) -> Self {
        self.auto_unlock = auto_unlock;
        self
    }
}

/// Snapshot handed to [`Session::execute`] callbacks.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub wallet: ConnectedWallet,
    pub chain_id: u64,
    pub contracts: Contracts,
    pub address: Address,
}

pub(crate) struct SessionInner {
    config: ConnectionConfig,
    networks: RwLock<Option<NetworkSource>>,
    builtin: Builtin,

    connection: watch::Sender<ConnectionState>,
    network: watch::Sender<NetworkState>,
    account: watch::Sender<AccountState>,
    execution: watch::Sender<ExecutionState>,
    /// `execute` calls in flight. Only touched under the `execution` lock.
    executing: AtomicUsize,
    pending: Arc<PendingActions>,
    observers: Arc<dyn ProviderObserver>,

    readiness: SettlementRegistry<ReadinessKey, bool, StateError>,
    loading_step: SettlementSlot<Option<Value>, StateError>,
    requirements: Mutex<ReadinessKey>,

    emitter: Arc<BlockEmitter>,
    poller: BlockPoller,
    /// The one wrapper handed out for the session's lifetime.
    provider: Mutex<Option<WrappedProvider>>,
    module: Mutex<Option<Arc<dyn WalletModule>>>,

    listening: Mutex<Option<listen::Listening>>,
    observed_chain: Mutex<Option<u64>>,
    last_account: Mutex<Option<Address>>,
    account_data_loaded: Mutex<Option<Address>>,
    /// Bumped on every account resolution, so superseded loads can bail out.
    load_counter: AtomicU64,

    diagnostics: Option<Arc<ChainDiagnostics>>,
    loops: network::DiagnosticLoops,
}

/// Handle to one wallet session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection", &*self.inner.connection.borrow())
            .field("network", &*self.inner.network.borrow())
            .field("account", &*self.inner.account.borrow())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build the session and start it in the background: reconnect to the
    /// previously selected wallet when configured to, otherwise fall back to
    /// the default RPC or an idle disconnected state.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn init(config: ConnectionConfig) -> Self {
        let session = Self::new(config);
        let starting = session.clone();
        tokio::spawn(async move {
            if starting.inner.config.auto_connect_using_previous {
                starting.auto_start().await;
            } else {
                starting.start().await;
            }
        });
        session
    }

    fn new(config: ConnectionConfig) -> Self {
        let pending = Arc::new(PendingActions::new());
        let mut observers = MultiObserver::new(vec![pending.clone() as Arc<dyn ProviderObserver>]);
        if let Some(external) = &config.observers {
            observers.push(external.clone());
        }

        let emitter = Arc::new(BlockEmitter::new());
        let poller = BlockPoller::new(emitter.clone(), config.parameters.default.block_time);
        let diagnostics = config.dev_network.as_ref().map(|dev| {
            Arc::new(ChainDiagnostics::new(
                dev.chain_id,
                dev.node.clone(),
                config.store.clone(),
            ))
        });
        let builtin = Builtin::new(config.builtin.clone().map(Transport::from));

        Self {
            inner: Arc::new(SessionInner {
                networks: RwLock::new(config.networks.clone()),
                builtin,
                connection: watch::channel(ConnectionState::default()).0,
                network: watch::channel(NetworkState::default()).0,
                account: watch::channel(AccountState::default()).0,
                execution: watch::channel(ExecutionState::default()).0,
                executing: AtomicUsize::new(0),
                pending,
                observers: Arc::new(observers),
                readiness: SettlementRegistry::new(),
                loading_step: SettlementSlot::new(),
                requirements: Mutex::new(ReadinessKey::default()),
                emitter,
                poller,
                provider: Mutex::new(None),
                module: Mutex::new(None),
                listening: Mutex::new(None),
                observed_chain: Mutex::new(None),
                last_account: Mutex::new(None),
                account_data_loaded: Mutex::new(None),
                load_counter: AtomicU64::new(0),
                diagnostics,
                loops: network::DiagnosticLoops::default(),
                config,
            }),
        }
    }

    // ========================================================================
    // Observable state
    // ========================================================================

    pub fn connection(&self) -> ConnectionState {
        self.inner.connection.borrow().clone()
    }

    pub fn network(&self) -> NetworkState {
        self.inner.network.borrow().clone()
    }

    pub fn account(&self) -> AccountState {
        self.inner.account.borrow().clone()
    }

    pub fn execution(&self) -> ExecutionState {
        self.inner.execution.borrow().clone()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    pub fn subscribe_network(&self) -> watch::Receiver<NetworkState> {
        self.inner.network.subscribe()
    }

    pub fn subscribe_account(&self) -> watch::Receiver<AccountState> {
        self.inner.account.subscribe()
    }

    pub fn subscribe_execution(&self) -> watch::Receiver<ExecutionState> {
        self.inner.execution.subscribe()
    }

    /// New block notifications, deduplicated by height.
    pub fn subscribe_new_blocks(&self) -> broadcast::Receiver<NewBlock> {
        self.inner.emitter.subscribe()
    }

    pub fn pending_actions(&self) -> &PendingActions {
        &self.inner.pending
    }

    /// Drop the oldest pending action, e.g. one stuck in an external wallet.
    pub fn skip_pending_action(&self) -> Option<PendingAction> {
        self.inner.pending.skip()
    }

    pub fn builtin(&self) -> &Builtin {
        &self.inner.builtin
    }

    /// Ids of the configured wallet options.
    pub fn options(&self) -> Vec<String> {
        self.inner.config.option_ids()
    }

    /// The provider of the current connection, if any.
    pub fn provider(&self) -> Option<WrappedProvider> {
        self.inner.connection.borrow().provider().cloned()
    }

    /// Timing parameters of the current chain.
    pub fn parameters(&self) -> ChainParameters {
        *self
            .inner
            .config
            .parameters
            .for_chain(self.inner.network.borrow().chain_id())
    }

    /// Replace the network configuration and re-evaluate the current chain.
    pub async fn update_networks(&self, networks: impl Into<NetworkSource>) {
        *self.inner.networks.write() = Some(networks.into());
        let chain_id = self.inner.network.borrow().chain_id();
        if let Some(chain_id) = chain_id {
            if let Err(e) = self.handle_network(chain_id).await {
                tracing::warn!(chain_id, error = %e, "failed to apply new network configuration");
            }
        }
    }

    // ========================================================================
    // Readiness
    // ========================================================================

    /// Settle `true` every tier that currently holds.
    fn resolve_satisfied(&self) {
        if !self.inner.connection.borrow().is_connected() {
            return;
        }
        let network = self.inner.network.borrow().is_connected();
        let account = self.inner.account.borrow().is_connected();
        let tiers = ReadinessKey::satisfied_by(network, account);
        tracing::debug!(?tiers, "resolving readiness");
        self.inner.readiness.resolve_many(&tiers, true);
    }

    fn default_wallet_type(&self) -> Option<String> {
        match self.inner.config.options.as_slice() {
            [only] => Some(only.id().to_string()),
            _ => None,
        }
    }

    /// Wait until `requirements` hold.
    ///
    /// Concurrent calls for the same tier share one attempt. Returns `false`
    /// when the attempt is abandoned (cancel, disconnect) and an error when
    /// connecting itself failed.
    pub async fn connect(&self, requirements: ReadinessKey) -> Result<bool, StateError> {
        *self.inner.requirements.lock() = requirements;
        self.inner.connection.send_if_modified(|state| match &mut state.status {
            ConnectionStatus::Connected(wallet) if wallet.requirements != requirements => {
                wallet.requirements = requirements;
                true
            }
            _ => false,
        });

        let session = self.clone();
        let settlement = self.inner.readiness.promise(requirements, move || {
            tokio::spawn(async move { session.attempt(requirements).await });
        });
        Ok(settlement.await.transpose()?.unwrap_or(false))
    }

    async fn attempt(&self, requirements: ReadinessKey) {
        tracing::debug!(%requirements, "connection attempt");
        let default_type = self.default_wallet_type();
        if !self.inner.connection.borrow().is_connected() {
            self.from_disconnected(default_type).await;
            return;
        }

        if self.inner.network.borrow().is_connected() {
            if requirements.needs_account() && !self.inner.account.borrow().is_connected() {
                let read_only = self
                    .inner
                    .connection
                    .borrow()
                    .wallet_type()
                    .is_some_and(WalletType::is_read_only);
                if read_only {
                    self.disconnect(false).await;
                    self.from_disconnected(default_type).await;
                } else {
                    self.ensure_account(default_type).await;
                }
            } else {
                self.resolve_satisfied();
            }
            return;
        }

        if requirements == ReadinessKey::Connection {
            self.resolve_satisfied();
            return;
        }

        let known = self.inner.network.borrow().chain_id();
        let chain_id = match known {
            Some(chain_id) => chain_id,
            None => match self.fetch_and_set_chain_id().await {
                Ok(chain_id) => chain_id,
                Err(e) => {
                    tracing::warn!(error = %e, "could not fetch chainId");
                    self.inner.readiness.reject_many(
                        &NETWORK_TIERS,
                        StateError::new("could not fetch chainId").with_cause(e),
                    );
                    return;
                }
            },
        };
        if let Err(e) = self.handle_network(chain_id).await {
            tracing::warn!(chain_id, error = %e, "network resolution failed");
            return;
        }

        if requirements.needs_account() && !self.inner.account.borrow().is_connected() {
            self.ensure_account(default_type).await;
        } else {
            self.resolve_satisfied();
        }
    }

    async fn ensure_account(&self, default_type: Option<String>) {
        let (locked, address) = {
            let account = self.inner.account.borrow();
            (account.locked(), account.address())
        };
        if locked {
            if let Err(e) = self.unlock().await {
                tracing::warn!(error = %e, "unlock failed");
            }
        } else if let Some(address) = address {
            self.handle_account(Some(address), false).await;
        } else {
            self.from_disconnected(default_type).await;
        }
    }

    /// Start a selection: select the only option, or wait for the user to pick.
    async fn from_disconnected(&self, wallet_type: Option<String>) {
        let mut in_flight = false;
        self.inner.connection.send_modify(|state| {
            in_flight = state.connecting();
            state.update_disconnected(|wallet| wallet.connecting = true);
        });
        if in_flight {
            tracing::debug!("selection already in flight");
            return;
        }
        match wallet_type {
            None => {
                self.inner.builtin.probe().await;
                self.inner
                    .connection
                    .send_modify(|state| state.update_disconnected(|w| w.require_selection = true));
            }
            Some(kind) => {
                // failures already settled the registry
                if let Err(e) = self.select(Some(kind), SelectOptions::default()).await {
                    tracing::debug!(error = %e, "selection failed");
                }
            }
        }
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Connect to the wallet of type `wallet_type`: `builtin`, an announced
    /// builtin wallet name, or a module id. `None` selects the only option.
    pub async fn select(
        &self,
        wallet_type: Option<String>,
        options: SelectOptions,
    ) -> Result<(), SessionError> {
        let result = self.select_wallet(wallet_type, options).await;
        if let Err(e) = &result {
            tracing::info!(error = %e, "select error");
            let error = StateError::from(e.clone());
            let shown = error.clone();
            self.inner.connection.send_modify(|state| {
                state.update_disconnected(|wallet| {
                    wallet.connecting = false;
                    wallet.require_selection = false;
                    wallet.loading_module = false;
                });
                state.error = Some(shown);
            });
            self.inner.readiness.reject_all(error);
        }
        result
    }

    async fn select_wallet(
        &self,
        wallet_type: Option<String>,
        options: SelectOptions,
    ) -> Result<(), SessionError> {
        if self.inner.connection.borrow().is_connected() {
            tracing::info!("disconnecting for select...");
            self.disconnect(false).await;
        }

        let kind = match wallet_type.filter(|t| !t.is_empty()) {
            Some(kind) => kind,
            None => self
                .default_wallet_type()
                .ok_or_else(|| SessionError::NoWalletType(self.options()))?,
        };
        if kind == BUILTIN && self.inner.builtin.known_unavailable() {
            return Err(SessionError::NoBuiltinWallet);
        }

        self.inner
            .connection
            .send_modify(|state| state.update_disconnected(|w| w.connecting = true));
        let (transport, wallet_type, module) = self.resolve_wallet(&kind, options.module_config).await?;
        *self.inner.module.lock() = module;

        let provider = self.create_provider(transport);
        let shown = wallet_type.clone();
        let installed = provider.clone();
        self.inner.connection.send_modify(|state| {
            state.update_disconnected(|wallet| {
                wallet.require_selection = false;
                wallet.wallet_type = Some(shown);
                wallet.provider = Some(installed);
            })
        });
        storage::record_selection(self.inner.config.store.as_ref(), &kind);

        tracing::info!("getting chainId...");
        let chain_id = match self.fetch_and_set_chain_id().await {
            Ok(chain_id) => chain_id,
            Err(e) => {
                tracing::info!(error = %e, "falling back on requesting access...");
                crate::deadline::call_with_deadline(
                    &provider,
                    RpcRequest::method("eth_requestAccounts"),
                    self.inner.config.request_timeout,
                )
                .await
                .map_err(SessionError::ChainIdUnavailable)?;
                self.fetch_and_set_chain_id()
                    .await
                    .map_err(SessionError::ChainIdUnavailable)?
            }
        };

        let requirements = *self.inner.requirements.lock();
        let connected = ConnectedWallet {
            wallet_type,
            provider,
            requirements,
        };
        self.inner.connection.send_modify(|state| {
            state.error = None;
            state.status = ConnectionStatus::Connected(connected);
        });
        tracing::info!(wallet = %kind, chain_id, "connected");
        self.start_listening();
        self.resolve_satisfied();

        if let Err(e) = self.handle_network(chain_id).await {
            tracing::warn!(chain_id, error = %e, "network resolution failed");
        }
        if let Err(e) = self.fetch_account(options.auto_unlock).await {
            tracing::warn!(error = %e, "account resolution failed");
        }
        Ok(())
    }

    async fn resolve_wallet(
        &self,
        kind: &str,
        module_config: Option<Value>,
    ) -> Result<(Transport, WalletType, Option<Arc<dyn WalletModule>>), SessionError> {
        if kind == BUILTIN {
            tracing::info!("probing builtin wallet...");
            let transport = self
                .inner
                .builtin
                .probe()
                .await
                .ok_or(SessionError::NoBuiltinWallet)?;
            let vendor = transport.vendor();
            tracing::info!(%vendor, "builtin wallet found, setting up provider...");
            return Ok((transport, WalletType::new(BUILTIN, Some(vendor.to_string())), None));
        }

        if let Some(announced) = self.inner.builtin.announced(kind) {
            return Ok((
                announced.provider,
                WalletType::new(kind, Some(announced.name)),
                None,
            ));
        }

        let option = self
            .inner
            .config
            .options
            .iter()
            .find(|option| option.id() == kind)
            .cloned()
            .ok_or_else(|| SessionError::ModuleNotFound(kind.to_string()))?;

        self.inner
            .connection
            .send_modify(|state| state.update_disconnected(|w| w.loading_module = true));
        let setup = async {
            let module = option
                .module()
                .await?
                .ok_or_else(|| StateError::new(format!("{kind} is not a module")))?;
            tracing::info!(module = kind, "setting up module");
            let setup = module.setup(module_config).await?;
            Ok::<_, StateError>((module, setup))
        }
        .await;
        self.inner
            .connection
            .send_modify(|state| state.update_disconnected(|w| w.loading_module = false));

        let (module, setup) = setup.map_err(SessionError::State)?;
        tracing::info!(module = kind, chain_id = setup.chain_id, "module setup");
        Ok((
            setup.provider,
            WalletType::new(kind, Some(kind.to_string())),
            Some(module),
        ))
    }

    /// Wrap `transport`, or swap it under the existing wrapper so the handle
    /// given out earlier keeps working.
    fn create_provider(&self, transport: Transport) -> WrappedProvider {
        let provider = {
            let mut slot = self.inner.provider.lock();
            match &*slot {
                Some(existing) => {
                    existing.set_underlying_provider(transport.clone());
                    existing.clone()
                }
                None => {
                    let provider = wrap(
                        transport.clone(),
                        Some(self.inner.observers.clone()),
                        self.inner.config.provider.clone(),
                    );
                    provider.set_block_emitter(self.inner.emitter.clone());
                    provider.set_stale_cache_hook(self.stale_cache_hook());
                    *slot = Some(provider.clone());
                    provider
                }
            }
        };

        self.inner.poller.start(provider.clone());
        tokio::spawn(self.inner.poller.resubscribe(transport));
        provider
    }

    fn stale_cache_hook(&self) -> StaleCacheHook {
        let session = Arc::downgrade(&self.inner);
        Arc::new(move |error: &ProviderError| {
            if let Some(inner) = session.upgrade() {
                Session { inner }.on_stale_cache(error);
            }
        })
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Tear the connection down. With `resolve` set, every pending `connect`
    /// settles `false`. Safe to call repeatedly.
    pub async fn disconnect(&self, resolve: bool) {
        self.stop_listening();
        self.inner.load_counter.fetch_add(1, Ordering::SeqCst);
        *self.inner.last_account.lock() = None;
        *self.inner.observed_chain.lock() = None;
        self.inner.emitter.set_chain_id(None);
        self.inner.account.send_replace(AccountState::default());
        self.inner.network.send_replace(NetworkState::default());

        let module = self.inner.module.lock().take();
        self.inner.connection.send_modify(|state| {
            state.status = ConnectionStatus::Disconnected(DisconnectedWallet::default());
        });
        storage::record_selection(self.inner.config.store.as_ref(), "");
        if resolve {
            self.inner.readiness.resolve_all(false);
        }

        let loaded = self.inner.account_data_loaded.lock().take();
        if let (Some(address), Some(loader)) = (loaded, &self.inner.config.account_data) {
            if let Err(e) = loader.unload().await {
                tracing::warn!(%address, error = %e, "failed to unload account data");
            }
        }
        if let Some(module) = module {
            module.disconnect().await;
        }
    }

    /// Abandon any connection attempt: back to the disconnected baseline,
    /// every pending `connect` settles `false`.
    pub fn cancel(&self) {
        self.stop_listening();
        self.inner.connection.send_modify(|state| {
            state.status = ConnectionStatus::Disconnected(DisconnectedWallet::default());
        });
        self.inner.readiness.resolve_all(false);
    }

    // ========================================================================
    // Execution
    // ========================================================================

    fn execution_context(&self) -> Option<ExecutionContext> {
        let wallet = self.inner.connection.borrow().connected()?.clone();
        let (chain_id, contracts) = match &self.inner.network.borrow().status {
            NetworkStatus::Connected {
                chain_id,
                contracts,
            } => (*chain_id, contracts.clone()),
            _ => return None,
        };
        let address = match self.inner.account.borrow().status {
            AccountStatus::Connected { address } => address,
            AccountStatus::Disconnected(_) => return None,
        };
        Some(ExecutionContext {
            wallet,
            chain_id,
            contracts,
            address,
        })
    }

    /// Run `callback` once connection, network and account are all ready,
    /// connecting first if needed. `Ok(None)` when connecting was abandoned.
    pub async fn execute<T, F, Fut>(&self, callback: F) -> Result<Option<T>, StateError>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = T>,
    {
        let _executing = ExecutingGuard::new(&self.inner);
        if let Some(context) = self.execution_context() {
            return Ok(Some(callback(context).await));
        }

        match self.connect(ReadinessKey::ConnectionNetworkAccount).await {
            Ok(true) => match self.execution_context() {
                Some(context) => Ok(Some(callback(context).await)),
                None => {
                    tracing::error!("connect resolved but the session is not ready");
                    Ok(None)
                }
            },
            Ok(false) => Ok(None),
            Err(e) => {
                let shown = e.clone();
                self.inner
                    .execution
                    .send_modify(|state| state.error = Some(shown));
                Err(e)
            }
        }
    }

    /// Like [`Session::execute`] but only requires a connection.
    pub async fn connect_and_execute<T, F, Fut>(&self, callback: F) -> Result<Option<T>, StateError>
    where
        F: FnOnce(ConnectedWallet) -> Fut,
        Fut: Future<Output = T>,
    {
        let connected = self.inner.connection.borrow().connected().cloned();
        if let Some(wallet) = connected {
            return Ok(Some(callback(wallet).await));
        }
        if !self.connect(ReadinessKey::Connection).await? {
            return Ok(None);
        }
        let connected = self.inner.connection.borrow().connected().cloned();
        match connected {
            Some(wallet) => Ok(Some(callback(wallet).await)),
            None => Ok(None),
        }
    }

    /// Abandon the connect an `execute` is waiting on.
    pub fn cancel_execution(&self) {
        if self.inner.execution.borrow().executing {
            self.inner.readiness.resolve_all(false);
        }
    }

    // ========================================================================
    // Chain switching
    // ========================================================================

    /// Ask the wallet to switch to `chain_id`, adding the chain first when the
    /// wallet does not know it and `params` carries rpc urls. A user rejection
    /// is not an error.
    pub async fn switch_to(
        &self,
        chain_id: u64,
        params: Option<AddChainParams>,
    ) -> Result<(), SessionError> {
        let provider = self.provider().ok_or(SessionError::NoProvider)?;
        let hex_chain_id = to_hex_chain_id(chain_id);

        let switched = provider
            .request(RpcRequest::new(
                "wallet_switchEthereumChain",
                vec![json!({ "chainId": hex_chain_id })],
            ))
            .await
            .and_then(null_result);
        let Err(e) = switched else {
            tracing::info!(chain_id, "wallet_switchEthereumChain: complete");
            return Ok(());
        };
        if e.kind().is_user_rejection() {
            tracing::info!(chain_id, "wallet_switchEthereumChain: user rejected");
            return Ok(());
        }

        let params = params.filter(|p| !p.rpc_urls.is_empty());
        let Some(params) = params else {
            tracing::info!(chain_id, "cannot call wallet_addEthereumChain without network details");
            let label = format!("with chainId = {chain_id}");
            return Err(self.connection_error(
                StateError::new(format!("Chain \"{label}\" is not available on your wallet."))
                    .with_cause(e),
            ));
        };

        tracing::info!(chain_id, "could not switch, adding the chain via wallet_addEthereumChain");
        let mut chain = serde_json::to_value(&params).map_err(ProviderError::from)?;
        if let Some(object) = chain.as_object_mut() {
            object.insert("chainId".into(), json!(hex_chain_id));
        }
        let added = provider
            .request(RpcRequest::new("wallet_addEthereumChain", vec![chain]))
            .await
            .and_then(null_result);
        match added {
            Ok(()) => Ok(()),
            Err(e) if e.kind().is_user_rejection() => {
                tracing::info!(chain_id, "wallet_addEthereumChain: user rejected");
                Ok(())
            }
            Err(e) => {
                tracing::info!(chain_id, error = %e, "wallet_addEthereumChain: failed");
                Err(self.connection_error(StateError::from(e)))
            }
        }
    }

    fn connection_error(&self, error: StateError) -> SessionError {
        let shown = error.clone();
        self.inner
            .connection
            .send_modify(|state| state.error = Some(shown));
        SessionError::State(error)
    }

    // ========================================================================
    // Start-up
    // ========================================================================

    async fn auto_start(&self) {
        let previous = storage::fetch_previous_selection(self.inner.config.store.as_ref())
            .filter(|kind| !kind.is_empty());
        let Some(kind) = previous else {
            self.start().await;
            return;
        };

        let timeout = self.inner.config.auto_start_timeout;
        let options = SelectOptions::default().with_auto_unlock(false);
        match tokio::time::timeout(timeout, self.select(Some(kind.clone()), options)).await {
            Ok(result) => {
                if let Err(e) = result {
                    tracing::info!(wallet = %kind, error = %e, "could not reuse previous wallet");
                }
                self.inner
                    .connection
                    .send_modify(|state| state.initialised = true);
            }
            Err(_) => {
                tracing::info!(
                    wallet = %kind,
                    "attempt to reuse previous wallet timed out after {} seconds.",
                    timeout.as_secs_f64()
                );
                self.disconnect(true).await;
                self.start().await;
            }
        }
    }

    /// Baseline state: read-only over the default RPC when configured.
    async fn start(&self) {
        let Some(rpc) = self.inner.config.default_rpc.clone() else {
            self.inner
                .connection
                .send_modify(|state| state.initialised = true);
            return;
        };

        tracing::info!(url = %rpc.url, "using default rpc provider");
        let read_only = Arc::new(ReadOnlyRpcProvider::new(rpc.chain_id, rpc.url.clone()));
        let provider = self.create_provider(Transport::from(read_only));
        let connected = ConnectedWallet {
            wallet_type: WalletType::new(READ_ONLY, Some(rpc.url.to_string())),
            provider,
            requirements: *self.inner.requirements.lock(),
        };
        self.inner.connection.send_modify(|state| {
            state.initialised = true;
            state.status = ConnectionStatus::Connected(connected);
        });
        *self.inner.observed_chain.lock() = Some(rpc.chain_id);
        if let Err(e) = self.handle_network(rpc.chain_id).await {
            tracing::warn!(chain_id = rpc.chain_id, error = %e, "default rpc network resolution failed");
        }
    }
}

/// Wallet methods answer `null` on success. Anything else is an error payload.
fn null_result(value: Value) -> Result<(), ProviderError> {
    if value.is_null() {
        Ok(())
    } else {
        Err(ProviderError::InvalidResponse(value.to_string()))
    }
}

/// Holds `executing` up while any `execute` call is in flight.
struct ExecutingGuard<'a> {
    inner: &'a SessionInner,
}

impl<'a> ExecutingGuard<'a> {
    fn new(inner: &'a SessionInner) -> Self {
        inner.execution.send_modify(|execution| {
            inner.executing.fetch_add(1, Ordering::SeqCst);
            execution.executing = true;
            execution.error = None;
        });
        Self { inner }
    }
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        let inner = self.inner;
        inner.execution.send_modify(|execution| {
            let remaining = inner.executing.fetch_sub(1, Ordering::SeqCst) - 1;
            execution.executing = remaining > 0;
        });
    }
}
