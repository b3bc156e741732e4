//! Observable session state.
//!
//! Connection, network and account are independent tri-state unions. Each
//! one is published through a `watch` channel by the session. The invariants
//! are carried by the types: a connected wallet always has a provider and a
//! wallet type, and a connected account is never locked.

use std::{fmt, str::FromStr};

use alloy::primitives::Address;
use serde_json::Value;

use crate::{chain::NetworkDiagnostics, error::StateError, networks::Contracts, wrap::WrappedProvider};

// ============================================================================
// Readiness tiers
// ============================================================================

/// Condition gating `connect` and `execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadinessKey {
    Connection,
    ConnectionNetwork,
    ConnectionAccount,
    #[default]
    ConnectionNetworkAccount,
}

impl ReadinessKey {
    pub const ALL: [ReadinessKey; 4] = [
        ReadinessKey::Connection,
        ReadinessKey::ConnectionNetwork,
        ReadinessKey::ConnectionAccount,
        ReadinessKey::ConnectionNetworkAccount,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadinessKey::Connection => "connection",
            ReadinessKey::ConnectionNetwork => "connection+network",
            ReadinessKey::ConnectionAccount => "connection+account",
            ReadinessKey::ConnectionNetworkAccount => "connection+network+account",
        }
    }

    pub fn needs_network(&self) -> bool {
        matches!(
            self,
            ReadinessKey::ConnectionNetwork | ReadinessKey::ConnectionNetworkAccount
        )
    }

    pub fn needs_account(&self) -> bool {
        matches!(
            self,
            ReadinessKey::ConnectionAccount | ReadinessKey::ConnectionNetworkAccount
        )
    }

    /// Whether this tier holds given which refinements are satisfied.
    pub fn is_satisfied(&self, network: bool, account: bool) -> bool {
        (!self.needs_network() || network) && (!self.needs_account() || account)
    }

    /// Tiers that hold given which refinements are satisfied (connection assumed).
    pub fn satisfied_by(network: bool, account: bool) -> Vec<ReadinessKey> {
        Self::ALL
            .into_iter()
            .filter(|key| key.is_satisfied(network, account))
            .collect()
    }
}

impl fmt::Display for ReadinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadinessKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| format!("unknown readiness tier {s:?}"))
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Which wallet backs the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletType {
    /// `builtin`, a module id, or `ReadOnly`.
    pub kind: String,
    /// Vendor or announced wallet name, or the RPC url for read-only sessions.
    pub name: Option<String>,
}

impl WalletType {
    pub fn new(kind: impl Into<String>, name: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            name,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.kind == crate::read_only::READ_ONLY
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectedWallet {
    pub wallet_type: WalletType,
    pub provider: WrappedProvider,
    /// Tier most recently requested through `connect`.
    pub requirements: ReadinessKey,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DisconnectedWallet {
    pub connecting: bool,
    /// Multiple options and none chosen: the UI must call `select`.
    pub require_selection: bool,
    pub loading_module: bool,
    pub wallet_type: Option<WalletType>,
    pub provider: Option<WrappedProvider>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Connected(ConnectedWallet),
    Disconnected(DisconnectedWallet),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    /// Set once start-up (auto-connect or fallback) has finished.
    pub initialised: bool,
    pub error: Option<StateError>,
    pub status: ConnectionStatus,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            initialised: false,
            error: None,
            status: ConnectionStatus::Disconnected(DisconnectedWallet::default()),
        }
    }
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self.status, ConnectionStatus::Connected(_))
    }

    pub fn connected(&self) -> Option<&ConnectedWallet> {
        match &self.status {
            ConnectionStatus::Connected(wallet) => Some(wallet),
            ConnectionStatus::Disconnected(_) => None,
        }
    }

    pub fn provider(&self) -> Option<&WrappedProvider> {
        match &self.status {
            ConnectionStatus::Connected(wallet) => Some(&wallet.provider),
            ConnectionStatus::Disconnected(wallet) => wallet.provider.as_ref(),
        }
    }

    pub fn wallet_type(&self) -> Option<&WalletType> {
        match &self.status {
            ConnectionStatus::Connected(wallet) => Some(&wallet.wallet_type),
            ConnectionStatus::Disconnected(wallet) => wallet.wallet_type.as_ref(),
        }
    }

    pub fn connecting(&self) -> bool {
        matches!(&self.status, ConnectionStatus::Disconnected(w) if w.connecting)
    }

    pub fn require_selection(&self) -> bool {
        matches!(&self.status, ConnectionStatus::Disconnected(w) if w.require_selection)
    }

    pub fn loading_module(&self) -> bool {
        matches!(&self.status, ConnectionStatus::Disconnected(w) if w.loading_module)
    }

    /// Apply `f` if disconnected. No-op while connected.
    pub(crate) fn update_disconnected(&mut self, f: impl FnOnce(&mut DisconnectedWallet)) {
        if let ConnectionStatus::Disconnected(wallet) = &mut self.status {
            f(wallet);
        }
    }
}

// ============================================================================
// Network
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkStatus {
    Disconnected {
        fetching_chain_id: bool,
        chain_id: Option<u64>,
        /// The network resolver is running.
        loading: bool,
    },
    NotSupported {
        chain_id: u64,
    },
    Connected {
        chain_id: u64,
        contracts: Contracts,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkState {
    pub error: Option<StateError>,
    pub diagnostics: NetworkDiagnostics,
    pub status: NetworkStatus,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            error: None,
            diagnostics: NetworkDiagnostics::default(),
            status: NetworkStatus::Disconnected {
                fetching_chain_id: false,
                chain_id: None,
                loading: false,
            },
        }
    }
}

impl NetworkState {
    pub fn is_connected(&self) -> bool {
        matches!(self.status, NetworkStatus::Connected { .. })
    }

    pub fn not_supported(&self) -> bool {
        matches!(self.status, NetworkStatus::NotSupported { .. })
    }

    pub fn chain_id(&self) -> Option<u64> {
        match &self.status {
            NetworkStatus::Disconnected { chain_id, .. } => *chain_id,
            NetworkStatus::NotSupported { chain_id } | NetworkStatus::Connected { chain_id, .. } => {
                Some(*chain_id)
            }
        }
    }

    pub fn contracts(&self) -> Option<&Contracts> {
        match &self.status {
            NetworkStatus::Connected { contracts, .. } => Some(contracts),
            _ => None,
        }
    }

    pub fn loading(&self) -> bool {
        matches!(self.status, NetworkStatus::Disconnected { loading: true, .. })
    }

    pub fn fetching_chain_id(&self) -> bool {
        matches!(
            self.status,
            NetworkStatus::Disconnected {
                fetching_chain_id: true,
                ..
            }
        )
    }
}

// ============================================================================
// Account
// ============================================================================

/// Intermediate step an account data loader is waiting on.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadingStep {
    pub id: String,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DisconnectedAccount {
    pub locked: bool,
    pub unlocking: bool,
    /// Address retained from the last time one was seen.
    pub address: Option<Address>,
    pub loading_data: Option<String>,
    pub loading_step: Option<LoadingStep>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AccountStatus {
    Connected { address: Address },
    Disconnected(DisconnectedAccount),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountState {
    pub error: Option<StateError>,
    pub status: AccountStatus,
}

impl Default for AccountState {
    fn default() -> Self {
        Self {
            error: None,
            status: AccountStatus::Disconnected(DisconnectedAccount::default()),
        }
    }
}

impl AccountState {
    pub fn is_connected(&self) -> bool {
        matches!(self.status, AccountStatus::Connected { .. })
    }

    pub fn address(&self) -> Option<Address> {
        match &self.status {
            AccountStatus::Connected { address } => Some(*address),
            AccountStatus::Disconnected(account) => account.address,
        }
    }

    pub fn locked(&self) -> bool {
        matches!(&self.status, AccountStatus::Disconnected(a) if a.locked)
    }

    pub fn unlocking(&self) -> bool {
        matches!(&self.status, AccountStatus::Disconnected(a) if a.unlocking)
    }

    pub fn loading_data(&self) -> Option<&str> {
        match &self.status {
            AccountStatus::Disconnected(account) => account.loading_data.as_deref(),
            AccountStatus::Connected { .. } => None,
        }
    }

    pub fn loading_step(&self) -> Option<&LoadingStep> {
        match &self.status {
            AccountStatus::Disconnected(account) => account.loading_step.as_ref(),
            AccountStatus::Connected { .. } => None,
        }
    }

    pub(crate) fn connected(address: Address) -> Self {
        Self {
            error: None,
            status: AccountStatus::Connected { address },
        }
    }

    pub(crate) fn disconnected(account: DisconnectedAccount) -> Self {
        Self {
            error: None,
            status: AccountStatus::Disconnected(account),
        }
    }

    /// Apply `f` to the disconnected fields, leaving a connected account
    /// disconnected with its address retained.
    pub(crate) fn update_disconnected(&mut self, f: impl FnOnce(&mut DisconnectedAccount)) {
        if let AccountStatus::Connected { address } = self.status {
            self.status = AccountStatus::Disconnected(DisconnectedAccount {
                address: Some(address),
                ..Default::default()
            });
        }
        if let AccountStatus::Disconnected(account) = &mut self.status {
            f(account);
        }
    }
}

// ============================================================================
// Execution
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExecutionState {
    pub executing: bool,
    pub error: Option<StateError>,
}
