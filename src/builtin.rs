//! The builtin (injected) wallet.
//!
//! The host may hand the session one injected provider, and wallets may
//! announce themselves by name later on. Probing is memoized: the first
//! call decides availability and vendor, later calls return the same answer.

use parking_lot::RwLock;
use tokio::sync::{watch, OnceCell};

use crate::transport::{Transport, WalletVendor};

/// Probing progress of the builtin wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuiltinStatus {
    #[default]
    Idle,
    Ready,
}

/// Observable builtin wallet state.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BuiltinState {
    pub status: BuiltinStatus,
    pub probing: bool,
    /// Known once probed.
    pub available: Option<bool>,
    pub vendor: Option<WalletVendor>,
    /// Names of wallets that announced themselves.
    pub announced: Vec<String>,
}

/// A wallet that announced itself after start-up.
#[derive(Debug, Clone)]
pub struct AnnouncedWallet {
    pub name: String,
    pub provider: Transport,
}

/// Builtin wallet discovery.
pub struct Builtin {
    injected: Option<Transport>,
    announced: RwLock<Vec<AnnouncedWallet>>,
    probed: OnceCell<Option<Transport>>,
    state: watch::Sender<BuiltinState>,
}

impl Builtin {
    pub fn new(injected: Option<Transport>) -> Self {
        let (state, _) = watch::channel(BuiltinState::default());
        Self {
            injected,
            announced: RwLock::new(Vec::new()),
            probed: OnceCell::new(),
            state,
        }
    }

    pub fn state(&self) -> BuiltinState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BuiltinState> {
        self.state.subscribe()
    }

    /// Whether a probe already concluded that no injected wallet exists.
    pub fn known_unavailable(&self) -> bool {
        let state = self.state.borrow();
        state.status == BuiltinStatus::Ready && state.available == Some(false)
    }

    /// Look for the injected provider. Memoized.
    pub async fn probe(&self) -> Option<Transport> {
        self.probed
            .get_or_init(|| async {
                self.state.send_modify(|state| state.probing = true);
                let found = self.injected.clone();
                let vendor = found.as_ref().map(Transport::vendor);
                tracing::debug!(available = found.is_some(), ?vendor, "builtin wallet probed");
                self.state.send_modify(|state| {
                    state.status = BuiltinStatus::Ready;
                    state.probing = false;
                    state.available = Some(found.is_some());
                    state.vendor = vendor;
                });
                found
            })
            .await
            .clone()
    }

    /// Register a wallet announcing itself under `name`. A repeated name replaces the entry.
    pub fn announce(&self, name: impl Into<String>, provider: Transport) {
        let name = name.into();
        {
            let mut announced = self.announced.write();
            announced.retain(|wallet| wallet.name != name);
            announced.push(AnnouncedWallet {
                name: name.clone(),
                provider,
            });
        }
        self.state.send_modify(|state| {
            if !state.announced.contains(&name) {
                state.announced.push(name);
            }
        });
    }

    /// The announced wallet called `name`.
    pub fn announced(&self, name: &str) -> Option<AnnouncedWallet> {
        self.announced
            .read()
            .iter()
            .find(|wallet| wallet.name == name)
            .cloned()
    }
}
