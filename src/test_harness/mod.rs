//! In-process wallet harness for session tests.
//!
//! This module provides `FakeWallet`, a scriptable EIP-1193 provider, for
//! driving a `Session` through connection, chain switches, account changes,
//! locking and failure scenarios without a browser or a node.
//!
//! # Example
//!
//! ```ignore
//! use wallet_connection::test_harness::{FakeWallet, SessionScenario};
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_connects() {
//!     let wallet = FakeWallet::new(1).into_arc();
//!     let scenario = SessionScenario::builtin(wallet.clone()).start().await;
//!
//!     assert!(scenario.connect_all().await.unwrap());
//! }
//! ```

#[cfg(test)]
mod error_scenarios;
mod scenario;

pub use scenario::*;

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use alloy::primitives::{address, Address, B256};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot};

use crate::ext::{
    to_hex_chain_id, AccountDataContext, AccountDataLoader, Eip1193Provider, ModuleSetup,
    ProviderError, ProviderEvent, ReferenceNode, RpcRequest, StateError, SubscriptionMessage,
    Transport, WalletModule, WalletVendor,
};

pub const ALICE: Address = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
pub const BOB: Address = address!("70997970C51812dc3A010C7d01b50e0d17dc79C8");

/// Genesis hash served by a freshly built wallet and reference node.
pub const GENESIS: B256 = B256::repeat_byte(0x11);

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

// ============================================================================
// FakeWallet
// ============================================================================

struct WalletState {
    chain_id: u64,
    known_chains: HashSet<u64>,
    accounts: Vec<Address>,
    locked: bool,
    /// `eth_requestAccounts` unlocks right away instead of waiting.
    auto_approve: bool,
    block_number: u64,
    genesis: B256,
    nonce: u64,
    fail_next: HashMap<String, VecDeque<ProviderError>>,
    fail_always: HashMap<String, ProviderError>,
    hanging: HashSet<String>,
    unlock_waiters: Vec<oneshot::Sender<Vec<Address>>>,
    /// Prefix for `eth_subscribe` ids. `None` rejects subscriptions.
    subscription_prefix: Option<String>,
    next_subscription: u64,
    subscriptions: Vec<String>,
}

enum Answer {
    Ready(Result<Value, ProviderError>),
    WaitForUnlock(oneshot::Receiver<Vec<Address>>),
    Hang,
}

/// Scriptable EIP-1193 wallet.
///
/// Unlocked with [`ALICE`] by default. State changes made through the
/// `switch_*`/`set_*`/`lock`/`unlock` helpers emit the matching wallet events
/// unless the `_silently` variant is used, which leaves detection to polling.
pub struct FakeWallet {
    state: Mutex<WalletState>,
    events: broadcast::Sender<ProviderEvent>,
    emits_events: bool,
    vendor: WalletVendor,
    calls: Mutex<Vec<String>>,
}

impl FakeWallet {
    pub fn new(chain_id: u64) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(WalletState {
                chain_id,
                known_chains: HashSet::from([chain_id]),
                accounts: vec![ALICE],
                locked: false,
                auto_approve: true,
                block_number: 100,
                genesis: GENESIS,
                nonce: 0,
                fail_next: HashMap::new(),
                fail_always: HashMap::new(),
                hanging: HashSet::new(),
                unlock_waiters: Vec::new(),
                subscription_prefix: None,
                next_subscription: 0,
                subscriptions: Vec::new(),
            }),
            events,
            emits_events: true,
            vendor: WalletVendor::Unknown,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Start locked. `eth_requestAccounts` waits for [`unlock`](Self::unlock).
    pub fn locked(self) -> Self {
        {
            let mut state = self.state.lock();
            state.locked = true;
            state.auto_approve = false;
        }
        self
    }

    /// Start locked, but approve the first `eth_requestAccounts` right away.
    pub fn locked_auto_approve(self) -> Self {
        self.state.lock().locked = true;
        self
    }

    pub fn with_vendor(mut self, vendor: WalletVendor) -> Self {
        self.vendor = vendor;
        self
    }

    pub fn with_accounts(self, accounts: Vec<Address>) -> Self {
        self.state.lock().accounts = accounts;
        self
    }

    pub fn with_known_chain(self, chain_id: u64) -> Self {
        self.state.lock().known_chains.insert(chain_id);
        self
    }

    pub fn with_genesis(self, genesis: B256) -> Self {
        self.state.lock().genesis = genesis;
        self
    }

    pub fn with_nonce(self, nonce: u64) -> Self {
        self.state.lock().nonce = nonce;
        self
    }

    pub fn with_block_number(self, number: u64) -> Self {
        self.state.lock().block_number = number;
        self
    }

    /// Accept `newHeads` subscriptions, handing out ids `<prefix>-<n>`.
    pub fn with_subscriptions(self, prefix: &str) -> Self {
        self.state.lock().subscription_prefix = Some(prefix.to_string());
        self
    }

    /// No event stream at all.
    pub fn without_events(mut self) -> Self {
        self.emits_events = false;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn transport(self: &Arc<Self>) -> Transport {
        Transport::from(self.clone())
    }

    fn emit(&self, event: ProviderEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------------

    /// Unlock and answer any waiting `eth_requestAccounts`.
    pub fn unlock(&self) {
        let accounts = self.unlock_silently();
        self.emit(ProviderEvent::AccountsChanged(accounts));
    }

    /// Unlock without an event. Waiting requests are still answered.
    pub fn unlock_silently(&self) -> Vec<Address> {
        let (accounts, waiters) = {
            let mut state = self.state.lock();
            state.locked = false;
            (state.accounts.clone(), std::mem::take(&mut state.unlock_waiters))
        };
        for waiter in waiters {
            let _ = waiter.send(accounts.clone());
        }
        accounts
    }

    pub fn lock(&self) {
        self.state.lock().locked = true;
        self.emit(ProviderEvent::AccountsChanged(vec![]));
    }

    pub fn set_accounts(&self, accounts: Vec<Address>) {
        self.set_accounts_silently(accounts.clone());
        self.emit(ProviderEvent::AccountsChanged(accounts));
    }

    pub fn set_accounts_silently(&self, accounts: Vec<Address>) {
        self.state.lock().accounts = accounts;
    }

    pub fn switch_chain(&self, chain_id: u64) {
        self.switch_chain_silently(chain_id);
        self.emit(ProviderEvent::ChainChanged(to_hex_chain_id(chain_id)));
    }

    pub fn switch_chain_silently(&self, chain_id: u64) {
        let mut state = self.state.lock();
        state.chain_id = chain_id;
        state.known_chains.insert(chain_id);
    }

    /// Emit a raw `chainChanged` payload.
    pub fn emit_chain_changed(&self, raw: &str) {
        self.emit(ProviderEvent::ChainChanged(raw.to_string()));
    }

    pub fn set_block_number(&self, number: u64) {
        self.state.lock().block_number = number;
    }

    pub fn set_genesis(&self, genesis: B256) {
        self.state.lock().genesis = genesis;
    }

    pub fn set_nonce(&self, nonce: u64) {
        self.state.lock().nonce = nonce;
    }

    /// Mine a block and announce it to every live subscription.
    pub fn push_new_head(&self, number: u64) {
        let subscriptions = {
            let mut state = self.state.lock();
            state.block_number = number;
            state.subscriptions.clone()
        };
        for subscription in subscriptions {
            self.push_message(&subscription, number);
        }
    }

    /// Announce head `number` under an arbitrary subscription id.
    pub fn push_message(&self, subscription: &str, number: u64) {
        self.emit(ProviderEvent::Message(SubscriptionMessage {
            subscription: subscription.to_string(),
            result: json!({ "number": format!("{number:#x}") }),
        }));
    }

    /// Fail the next call to `method` with `error`.
    pub fn fail_next(&self, method: &str, error: ProviderError) {
        self.state
            .lock()
            .fail_next
            .entry(method.to_string())
            .or_default()
            .push_back(error);
    }

    /// Fail every call to `method` until [`recover`](Self::recover).
    pub fn fail_always(&self, method: &str, error: ProviderError) {
        self.state.lock().fail_always.insert(method.to_string(), error);
    }

    /// Never answer `method` until [`recover`](Self::recover).
    pub fn hang(&self, method: &str) {
        self.state.lock().hanging.insert(method.to_string());
    }

    pub fn recover(&self, method: &str) {
        let mut state = self.state.lock();
        state.fail_always.remove(method);
        state.fail_next.remove(method);
        state.hanging.remove(method);
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn chain_id(&self) -> u64 {
        self.state.lock().chain_id
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Number of calls to `method` so far.
    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|m| *m == method).count()
    }

    /// Subscription ids handed out and not yet unsubscribed.
    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    pub fn has_unlock_waiters(&self) -> bool {
        !self.state.lock().unlock_waiters.is_empty()
    }

    // ------------------------------------------------------------------------
    // Request handling
    // ------------------------------------------------------------------------

    fn answer(&self, request: &RpcRequest) -> Answer {
        let method = request.method.as_str();
        let mut state = self.state.lock();

        if let Some(error) = state.fail_next.get_mut(method).and_then(VecDeque::pop_front) {
            return Answer::Ready(Err(error));
        }
        if let Some(error) = state.fail_always.get(method) {
            return Answer::Ready(Err(error.clone()));
        }
        if state.hanging.contains(method) {
            return Answer::Hang;
        }

        let block = |number: u64, hash: B256| {
            json!({
                "number": format!("{number:#x}"),
                "hash": hash,
                "timestamp": format!("{:#x}", now_secs()),
            })
        };

        let result = match method {
            "eth_chainId" => Ok(json!(to_hex_chain_id(state.chain_id))),
            "eth_accounts" => Ok(if state.locked {
                json!([])
            } else {
                json!(state.accounts)
            }),
            "eth_requestAccounts" => {
                if !state.locked {
                    Ok(json!(state.accounts))
                } else if state.auto_approve {
                    state.locked = false;
                    Ok(json!(state.accounts))
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.unlock_waiters.push(tx);
                    return Answer::WaitForUnlock(rx);
                }
            }
            "eth_blockNumber" => Ok(json!(format!("{:#x}", state.block_number))),
            "eth_getBlockByNumber" => {
                match request.params.first().and_then(Value::as_str) {
                    Some("earliest") => Ok(block(0, state.genesis)),
                    _ => Ok(block(state.block_number, B256::with_last_byte(0x22))),
                }
            }
            "eth_getTransactionCount" => Ok(json!(format!("{:#x}", state.nonce))),
            "wallet_switchEthereumChain" | "wallet_addEthereumChain" => {
                let requested = request
                    .params
                    .first()
                    .and_then(|p| p.get("chainId"))
                    .and_then(Value::as_str)
                    .and_then(crate::ext::parse_chain_id);
                match requested {
                    Some(chain_id) if method == "wallet_addEthereumChain" => {
                        state.known_chains.insert(chain_id);
                        state.chain_id = chain_id;
                        drop(state);
                        self.emit(ProviderEvent::ChainChanged(to_hex_chain_id(chain_id)));
                        return Answer::Ready(Ok(Value::Null));
                    }
                    Some(chain_id) if state.known_chains.contains(&chain_id) => {
                        state.chain_id = chain_id;
                        drop(state);
                        self.emit(ProviderEvent::ChainChanged(to_hex_chain_id(chain_id)));
                        return Answer::Ready(Ok(Value::Null));
                    }
                    Some(_) => Err(ProviderError::rpc(4902, "Unrecognized chain ID")),
                    None => Err(ProviderError::rpc(-32602, "missing chainId")),
                }
            }
            "eth_subscribe" if state.subscription_prefix.is_some() => {
                state.next_subscription += 1;
                let id = format!(
                    "{}-{}",
                    state.subscription_prefix.as_deref().unwrap_or_default(),
                    state.next_subscription
                );
                state.subscriptions.push(id.clone());
                Ok(json!(id))
            }
            "eth_unsubscribe" if state.subscription_prefix.is_some() => {
                let id = request.params.first().and_then(Value::as_str).unwrap_or_default();
                let before = state.subscriptions.len();
                state.subscriptions.retain(|s| s != id);
                Ok(json!(state.subscriptions.len() < before))
            }
            "eth_sendTransaction" => Ok(json!(B256::repeat_byte(0xab))),
            "personal_sign" | "eth_sign" | "eth_signTypedData_v4" => Ok(json!("0x1234")),
            other => Err(ProviderError::Unsupported(other.to_string())),
        };
        Answer::Ready(result)
    }
}

#[async_trait]
impl Eip1193Provider for FakeWallet {
    async fn request(&self, request: RpcRequest) -> Result<Value, ProviderError> {
        self.calls.lock().push(request.method.clone());
        match self.answer(&request) {
            Answer::Ready(result) => result,
            Answer::WaitForUnlock(rx) => match rx.await {
                Ok(accounts) => Ok(json!(accounts)),
                Err(_) => Err(ProviderError::Transport("wallet dropped the request".into())),
            },
            Answer::Hang => std::future::pending().await,
        }
    }

    fn events(&self) -> Option<broadcast::Receiver<ProviderEvent>> {
        self.emits_events.then(|| self.events.subscribe())
    }

    fn vendor(&self) -> WalletVendor {
        self.vendor
    }
}

// ============================================================================
// FakeReferenceNode
// ============================================================================

/// Reference node with settable answers.
pub struct FakeReferenceNode {
    genesis: Mutex<B256>,
    block: AtomicU64,
    nonce: AtomicU64,
}

impl FakeReferenceNode {
    pub fn new() -> Self {
        Self {
            genesis: Mutex::new(GENESIS),
            block: AtomicU64::new(100),
            nonce: AtomicU64::new(0),
        }
    }

    pub fn set_genesis(&self, genesis: B256) {
        *self.genesis.lock() = genesis;
    }

    pub fn set_block_number(&self, number: u64) {
        self.block.store(number, Ordering::SeqCst);
    }

    pub fn set_nonce(&self, nonce: u64) {
        self.nonce.store(nonce, Ordering::SeqCst);
    }
}

impl Default for FakeReferenceNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReferenceNode for FakeReferenceNode {
    async fn genesis_hash(&self) -> anyhow::Result<B256> {
        Ok(*self.genesis.lock())
    }

    async fn block_number(&self) -> anyhow::Result<u64> {
        Ok(self.block.load(Ordering::SeqCst))
    }

    async fn transaction_count(&self, _address: Address) -> anyhow::Result<u64> {
        Ok(self.nonce.load(Ordering::SeqCst))
    }
}

// ============================================================================
// FakeModule
// ============================================================================

/// Module handing out a [`FakeWallet`], counting setups and disconnects.
pub struct FakeModule {
    id: String,
    wallet: Arc<FakeWallet>,
    failure: Mutex<Option<StateError>>,
    setups: AtomicUsize,
    disconnects: AtomicUsize,
}

impl FakeModule {
    pub fn new(id: impl Into<String>, wallet: Arc<FakeWallet>) -> Self {
        Self {
            id: id.into(),
            wallet,
            failure: Mutex::new(None),
            setups: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    /// Fail the next setup with `error`.
    pub fn fail_setup(&self, error: StateError) {
        *self.failure.lock() = Some(error);
    }

    pub fn setups(&self) -> usize {
        self.setups.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WalletModule for FakeModule {
    fn id(&self) -> &str {
        &self.id
    }

    async fn setup(&self, _config: Option<Value>) -> Result<ModuleSetup, StateError> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if let Some(error) = self.failure.lock().take() {
            return Err(error);
        }
        Ok(ModuleSetup {
            chain_id: self.wallet.chain_id(),
            provider: self.wallet.transport(),
        })
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// RecordingLoader
// ============================================================================

/// Account data loader recording loads and unloads.
#[derive(Default)]
pub struct RecordingLoader {
    loads: Mutex<Vec<(Address, Option<u64>)>>,
    unloads: AtomicUsize,
    /// Wait for the application to accept a loading step during each load.
    waits_for_step: bool,
    failure: Mutex<Option<StateError>>,
}

impl RecordingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step() -> Self {
        Self {
            waits_for_step: true,
            ..Default::default()
        }
    }

    pub fn fail_next(&self, error: StateError) {
        *self.failure.lock() = Some(error);
    }

    pub fn loads(&self) -> Vec<(Address, Option<u64>)> {
        self.loads.lock().clone()
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountDataLoader for RecordingLoader {
    async fn load(&self, context: AccountDataContext) -> Result<(), StateError> {
        self.loads.lock().push((context.address, context.chain_id));
        context.set_loading_message("Fetching balances...");
        if self.waits_for_step {
            context.wait_for_step(None, Some(json!({ "address": context.address }))).await?;
        }
        tokio::task::yield_now().await;
        match self.failure.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn unload(&self) -> Result<(), StateError> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
