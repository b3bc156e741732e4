//! Provider error classification and session error types.
//!
//! Wallets report failures as `{code, message, data}` objects whose shape
//! varies between vendors. Everything that crosses the transport boundary is
//! turned into a [`ProviderError`] once, and [`classify_provider_error`] is the
//! only place that looks at codes and messages to decide what a failure means.
//! Code further up (the session, the diagnostics) only matches on
//! [`ProviderErrorKind`].

use std::time::Duration;

use alloy::transports::{RpcError, TransportError};
use serde_json::Value;

// ============================================================================
// Well-known EIP-1193 / JSON-RPC error codes
// ============================================================================

/// EIP-1193 error codes matched by [`classify_provider_error`].
pub mod codes {
    /// The user rejected the request.
    pub const USER_REJECTED: i64 = 4001;
    /// The requested method and/or account has not been authorized.
    pub const UNAUTHORIZED: i64 = 4100;
    /// The wallet does not know the chain (EIP-3085 / EIP-3326).
    pub const UNRECOGNIZED_CHAIN: i64 = 4902;
    /// Some wallets use this for "permission denied".
    pub const PERMISSION_DENIED: i64 = -32500;
    /// A request of the same kind is already pending in the wallet.
    pub const ALREADY_PROCESSING: i64 = -32002;
    /// Internal JSON-RPC error, also used to wrap stale cache signals.
    pub const INTERNAL: i64 = -32603;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
}

// ============================================================================
// ProviderError
// ============================================================================

/// A failure returned by a wallet transport or by the wrapper around it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// The wallet answered with a JSON-RPC error object.
    #[error("{message} (code {code})")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The call did not settle before its deadline.
    #[error("request timed out after {} seconds", .0.as_secs_f64())]
    Timeout(Duration),

    /// The transport itself failed (connection refused, closed channel...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The wallet answered with something that is not what the method returns.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Both explicit metadata and a staged metadata value were supplied.
    #[error("conflicting metadata, explicit metadata was provided while another value was staged")]
    ConflictingMetadata,

    /// `set_next_metadata` was called while a previous value was still staged.
    #[error("previous metadata was not consumed. Please resolve the issue.")]
    MetadataNotConsumed,

    /// `current_time` was called before any block was observed.
    #[error("The provider need to be synced with block.timestamp before being able to provide currentTime")]
    NotSynced,

    /// The node clock differs from the local clock by more than the threshold.
    #[error("{0}")]
    ClockDiscrepancy(String),

    /// The method is not offered by this transport.
    #[error("{0}")]
    Unsupported(String),
}

impl ProviderError {
    /// Build an [`ProviderError::Rpc`] from a code and message.
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        ProviderError::Rpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Numeric code when the error came from the wallet.
    pub fn code(&self) -> Option<i64> {
        match self {
            ProviderError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Message as reported by the wallet, or the display form otherwise.
    pub fn message(&self) -> String {
        match self {
            ProviderError::Rpc { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Shorthand for `classify_provider_error(self)`.
    pub fn kind(&self) -> ProviderErrorKind {
        classify_provider_error(self)
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::InvalidResponse(err.to_string())
    }
}

impl From<TransportError> for ProviderError {
    fn from(err: TransportError) -> Self {
        match err {
            RpcError::ErrorResp(payload) => ProviderError::Rpc {
                code: payload.code,
                message: payload.message.to_string(),
                data: payload
                    .data
                    .and_then(|raw| serde_json::from_str(raw.get()).ok()),
            },
            RpcError::DeserError { err, .. } => ProviderError::InvalidResponse(err.to_string()),
            other => ProviderError::Transport(other.to_string()),
        }
    }
}

// ============================================================================
// Error Classification Types
// ============================================================================

/// Closed set of error meanings the session reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// User dismissed the wallet prompt (4001). Benign.
    UserRejected,

    /// Method or account not authorized yet (4100).
    Unauthorized,

    /// Wallet refuses the method until permission is granted (-32500).
    PermissionDenied,

    /// Wallet does not know the requested chain (4902).
    UnrecognizedChain,

    /// A request of the same kind is already open in the wallet (-32002).
    AlreadyProcessing,

    /// Wallet served data from a stale block cache (-32603 with a
    /// `BlockOutOfRangeError` or `Received invalid block tag` message).
    StaleCache,

    /// Deadline exceeded.
    Timeout,

    /// Transport failure.
    Transport,

    /// Local misuse: conflicting metadata, unsynced clock, bad response shape.
    Invalid,

    /// Anything else.
    Unknown,
}

impl ProviderErrorKind {
    /// A rejection initiated by the user; surfaced as a no-op.
    pub fn is_user_rejection(&self) -> bool {
        matches!(self, ProviderErrorKind::UserRejected)
    }

    /// Errors that, on an account list fetch, simply mean "no account exposed".
    pub fn is_benign_account_error(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::UserRejected
                | ProviderErrorKind::Unauthorized
                | ProviderErrorKind::PermissionDenied
        )
    }

    /// Whether the failure indicates a wallet serving stale cached chain data.
    pub fn is_stale_cache(&self) -> bool {
        matches!(self, ProviderErrorKind::StaleCache)
    }
}

// ============================================================================
// Error Classification Functions
// ============================================================================

/// Classify a provider error into a [`ProviderErrorKind`].
///
/// Codes are matched first. A few vendors reuse generic codes, so the message
/// is inspected for the permission-denied and stale-cache variants.
pub fn classify_provider_error(error: &ProviderError) -> ProviderErrorKind {
    match error {
        ProviderError::Rpc { code, message, data } => {
            let message = message.to_lowercase();
            match *code {
                codes::USER_REJECTED => ProviderErrorKind::UserRejected,
                codes::UNAUTHORIZED => ProviderErrorKind::Unauthorized,
                codes::UNRECOGNIZED_CHAIN => ProviderErrorKind::UnrecognizedChain,
                codes::ALREADY_PROCESSING => ProviderErrorKind::AlreadyProcessing,
                codes::PERMISSION_DENIED if message.contains("permission denied") => {
                    ProviderErrorKind::PermissionDenied
                }
                codes::INTERNAL if is_stale_cache_message(&message, data.as_ref()) => {
                    ProviderErrorKind::StaleCache
                }
                _ => ProviderErrorKind::Unknown,
            }
        }
        ProviderError::Timeout(_) => ProviderErrorKind::Timeout,
        ProviderError::Transport(_) => ProviderErrorKind::Transport,
        ProviderError::InvalidResponse(_)
        | ProviderError::ConflictingMetadata
        | ProviderError::MetadataNotConsumed
        | ProviderError::NotSynced
        | ProviderError::ClockDiscrepancy(_)
        | ProviderError::Unsupported(_) => ProviderErrorKind::Invalid,
    }
}

fn is_stale_cache_message(message: &str, data: Option<&Value>) -> bool {
    let matches = |s: &str| {
        let s = s.to_lowercase();
        s.contains("blockoutofrangeerror") || s.contains("received invalid block tag")
    };
    if matches(message) {
        return true;
    }
    // Metamask nests the original node error under data.originalError
    match data {
        Some(value) => matches(&value.to_string()),
        None => false,
    }
}

// ============================================================================
// State errors
// ============================================================================

/// Structured error attached to a state slice's `error` field.
#[derive(Debug, Clone, PartialEq)]
pub struct StateError {
    /// Short heading for display, when one makes sense.
    pub title: Option<String>,
    /// Human readable description.
    pub message: String,
    /// The provider failure that led here, if any.
    pub cause: Option<ProviderError>,
}

impl StateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            title: None,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_cause(mut self, cause: ProviderError) -> Self {
        self.cause = Some(cause);
        self
    }
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.title {
            Some(title) => write!(f, "{title}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c as _)
    }
}

impl From<ProviderError> for StateError {
    fn from(err: ProviderError) -> Self {
        StateError::new(err.message()).with_cause(err)
    }
}

// ============================================================================
// Session errors
// ============================================================================

/// Errors returned by direct calls on a session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("no provider available")]
    NoProvider,

    #[error("Not Locked")]
    NotLocked,

    #[error("No Wallet Type Specified, choose from {0:?}")]
    NoWalletType(Vec<String>),

    #[error("No Builtin Wallet")]
    NoBuiltinWallet,

    #[error("no module found: {0}")]
    ModuleNotFound(String),

    #[error("could not fetch chainId: {0}")]
    ChainIdUnavailable(ProviderError),

    #[error(transparent)]
    State(StateError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("{0}")]
    Unavailable(String),
}

impl From<SessionError> for StateError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::State(state) => state,
            SessionError::Provider(cause) => StateError::from(cause),
            SessionError::ChainIdUnavailable(cause) => {
                StateError::new("could not fetch chainId").with_cause(cause)
            }
            other => StateError::new(other.to_string()),
        }
    }
}

// ============================================================================
// Retry Utilities
// ============================================================================

/// Calculate exponential backoff duration for retries.
///
/// Uses 2^retry_count * base_ms formula, capped at 30 seconds max.
///
/// # Examples
/// ```
/// use wallet_connection::ext::backoff_duration;
///
/// assert_eq!(backoff_duration(0, 100).as_millis(), 100);
/// assert_eq!(backoff_duration(2, 100).as_millis(), 400);
/// assert_eq!(backoff_duration(10, 100).as_millis(), 30_000);
/// ```
pub fn backoff_duration(retry_count: u32, base_ms: u64) -> Duration {
    let ms = base_ms.saturating_mul(2u64.saturating_pow(retry_count));
    Duration::from_millis(ms.min(30_000))
}
