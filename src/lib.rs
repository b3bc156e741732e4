//! # alloy-wallet-connection
//!
//! Wallet connection management for EIP-1193 providers, built on Alloy.
//!
//! ## Core Features
//!
//! - **Readiness Tiers**: `connect(tier)` waits until connection, network and/or account hold
//! - **Connection State Machine**: wallet selection, chain and account reconciliation, unlock flows
//! - **Event + Polling Listeners**: wallet events backed by polling with backoff and change detection
//! - **Provider Wrapper**: request deadlines, observer hooks, clock sync and block notifications
//! - **Pending Actions**: a queue of wallet requests awaiting the user
//! - **Chain Cache Diagnostics**: detects wallets serving stale data for restarted dev chains
//!
//! ## Usage
//!
//! ```ignore
//! use wallet_connection::ext::*;
//!
//! let session = Session::init(ConnectionConfig::default());
//! if session.connect(ReadinessKey::ConnectionNetworkAccount).await? {
//!     let address = session.account().address();
//! }
//! ```

// ============================================================================
// Internal Module Declarations
// ============================================================================

/// Keyed registry of deferred outcomes settled from elsewhere
mod settlement;

/// Deadline-bounded provider calls
mod deadline;

/// Block height polling and deduplicated new block notifications
mod blocks;

/// EIP-1193 transport abstraction and wallet events
mod transport;

/// Request lifecycle observers
mod observer;

/// Provider wrapper with observers, metadata and clock sync
mod wrap;

/// Read-only provider over a default JSON-RPC endpoint
mod read_only;

/// Observable connection, network, account and execution state
mod state;

/// Session state machine
mod connection;

/// Queue of wallet requests waiting on the user
mod pending;

/// Chain cache diagnostics against a reference node
mod chain;

/// Persisted selection and diagnostics flags
mod storage;

/// Builtin (injected) wallet discovery
mod builtin;

/// Pluggable wallet modules
mod module;

/// Network configuration and resolution
mod networks;

/// Session configuration
mod config;

/// Provider, state and session error types
mod error;

/// Test harness module (compiled only in test mode)
#[cfg(test)]
pub mod test_harness;

// ============================================================================
// Public Exports
// ============================================================================

/// Re-export all public APIs from the alloy crate.
pub use alloy::*;

/// Extension module containing the connection manager:
///
/// - `Session` - Wallet session state machine
/// - `ConnectionConfig` - Session configuration
/// - `WrappedProvider` - Provider wrapper handed out by the session
/// - `SettlementRegistry` - Keyed deferred outcomes
/// - `ChainDiagnostics` - Dev chain cache checks
/// - `ProviderError` / `StateError` / `SessionError` - Error types
pub mod ext {
    pub use super::blocks::*;
    pub use super::builtin::*;
    pub use super::chain::*;
    pub use super::config::*;
    pub use super::connection::*;
    pub use super::deadline::*;
    pub use super::error::*;
    pub use super::module::*;
    pub use super::networks::*;
    pub use super::observer::*;
    pub use super::pending::*;
    pub use super::read_only::*;
    pub use super::settlement::*;
    pub use super::state::*;
    pub use super::storage::*;
    pub use super::transport::*;
    pub use super::wrap::*;
}
