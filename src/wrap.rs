//! Observability wrapper around a wallet transport.
//!
//! Every write call (send transaction, sign, typed sign) goes through
//! [`WrappedProvider::request`], which attaches caller metadata, stamps it with
//! the synchronized chain time and fires observer callbacks before and after
//! the wallet answers. Reads pass through, except that latest block and block
//! number results advance the new block notifier and the chain clock.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────── WrappedProvider ───────────────────────┐
//! request(args) ─►│ eth_sendTransaction ─► metadata ─► on_tx_requested ─► wallet ──┼─► on_tx_sent / on_tx_cancelled
//!                 │ eth_sign, personal_sign, eth_signTypedData[_v4] ─► same triad  │
//!                 │ eth_getBlockByNumber(latest), eth_blockNumber ─► BlockEmitter  │
//!                 │ anything else ─────────────────────────────────► wallet        │
//!                 └───────────────▲────────────────────────────────────────────────┘
//!                                 │ set_underlying_provider(new transport)
//! ```
//!
//! The handle is cheap to clone and keeps its identity and observers when the
//! underlying transport is swapped, so code holding a `WrappedProvider` does
//! not notice a wallet switch.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use alloy::{
    primitives::{Address, B256},
    rpc::types::TransactionRequest,
};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::{sync::broadcast, time::Instant};

use crate::{
    blocks::{fetch_latest_block, parse_block_number, BlockEmitter, BlockHeader},
    error::{codes, ProviderError},
    observer::{Metadata, ProviderObserver, SignatureRequest, TxRequest},
    transport::{ProviderEvent, RpcRequest, Transport, WalletVendor},
};

const ONE_HOUR_MS: i128 = 3_600_000;

// ============================================================================
// Configuration
// ============================================================================

/// What to do when the node clock and the local clock disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeDiscrepancyConfig {
    /// Maximum tolerated drift.
    pub threshold: Duration,
    /// Log instead of failing the sync.
    pub only_log: bool,
}

impl Default for TimeDiscrepancyConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(3600),
            only_log: false,
        }
    }
}

/// Wrapper configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapConfig {
    /// `None` disables the clock discrepancy check.
    pub time_discrepancy: Option<TimeDiscrepancyConfig>,
}

impl Default for WrapConfig {
    fn default() -> Self {
        Self {
            time_discrepancy: Some(TimeDiscrepancyConfig::default()),
        }
    }
}

impl WrapConfig {
    pub fn without_clock_check() -> Self {
        Self {
            time_discrepancy: None,
        }
    }

    pub fn with_time_discrepancy(mut self, config: TimeDiscrepancyConfig) -> Self {
        self.time_discrepancy = Some(config);
        self
    }
}

/// Source for [`WrappedProvider::sync_time`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSource {
    /// Block timestamp in seconds.
    Timestamp(u64),
    Block(BlockHeader),
}

/// Called when a request fails with a stale block cache error.
pub type StaleCacheHook = Arc<dyn Fn(&ProviderError) + Send + Sync>;

// ============================================================================
// WrappedProvider
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct ClockSync {
    chain_time: u64,
    at: Instant,
}

struct WrapperInner {
    transport: RwLock<Transport>,
    observers: RwLock<Option<Arc<dyn ProviderObserver>>>,
    emitter: RwLock<Option<Arc<BlockEmitter>>>,
    stale_cache_hook: RwLock<Option<StaleCacheHook>>,
    next_metadata: Mutex<Option<Metadata>>,
    clock: Mutex<Option<ClockSync>>,
    next_id: AtomicU64,
    config: WrapConfig,
}

/// Provider handle with write-call interception. See the module docs.
#[derive(Clone)]
pub struct WrappedProvider {
    inner: Arc<WrapperInner>,
}

impl std::fmt::Debug for WrappedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedProvider")
            .field("transport", &*self.inner.transport.read())
            .field("synced", &self.is_synced())
            .finish()
    }
}

impl PartialEq for WrappedProvider {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A raw transport or an already wrapped one.
///
/// Passing a wrapped handle to [`wrap`] only replaces its observers.
#[derive(Debug, Clone)]
pub enum ProviderHandle {
    Raw(Transport),
    Wrapped(WrappedProvider),
}

impl From<Transport> for ProviderHandle {
    fn from(transport: Transport) -> Self {
        ProviderHandle::Raw(transport)
    }
}

impl From<WrappedProvider> for ProviderHandle {
    fn from(provider: WrappedProvider) -> Self {
        ProviderHandle::Wrapped(provider)
    }
}

/// Wrap `handle`, or update the observers of an already wrapped handle.
pub fn wrap(
    handle: impl Into<ProviderHandle>,
    observers: Option<Arc<dyn ProviderObserver>>,
    config: WrapConfig,
) -> WrappedProvider {
    match handle.into() {
        ProviderHandle::Wrapped(provider) => {
            provider.set_observers(observers);
            provider
        }
        ProviderHandle::Raw(transport) => WrappedProvider::new(transport, observers, config),
    }
}

impl WrappedProvider {
    pub fn new(
        transport: impl Into<Transport>,
        observers: Option<Arc<dyn ProviderObserver>>,
        config: WrapConfig,
    ) -> Self {
        Self {
            inner: Arc::new(WrapperInner {
                transport: RwLock::new(transport.into()),
                observers: RwLock::new(observers),
                emitter: RwLock::new(None),
                stale_cache_hook: RwLock::new(None),
                next_metadata: Mutex::new(None),
                clock: Mutex::new(None),
                next_id: AtomicU64::new(1),
                config,
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Wiring
    // ------------------------------------------------------------------------

    /// The transport requests are currently forwarded to.
    pub fn transport(&self) -> Transport {
        self.inner.transport.read().clone()
    }

    /// Swap the underlying transport, keeping identity and observers.
    pub fn set_underlying_provider(&self, transport: impl Into<Transport>) {
        *self.inner.transport.write() = transport.into();
    }

    pub fn set_observers(&self, observers: Option<Arc<dyn ProviderObserver>>) {
        *self.inner.observers.write() = observers;
    }

    pub fn unset_observers(&self) {
        self.set_observers(None);
    }

    pub fn set_block_emitter(&self, emitter: Arc<BlockEmitter>) {
        *self.inner.emitter.write() = Some(emitter);
    }

    pub fn set_stale_cache_hook(&self, hook: StaleCacheHook) {
        *self.inner.stale_cache_hook.write() = Some(hook);
    }

    pub fn events(&self) -> Option<broadcast::Receiver<ProviderEvent>> {
        self.transport().events()
    }

    pub fn vendor(&self) -> WalletVendor {
        self.transport().vendor()
    }

    /// Stage metadata for the next write call that carries none.
    pub fn set_next_metadata(&self, metadata: Metadata) -> Result<(), ProviderError> {
        let mut staged = self.inner.next_metadata.lock();
        if staged.is_some() {
            return Err(ProviderError::MetadataNotConsumed);
        }
        *staged = Some(metadata);
        Ok(())
    }

    fn observers(&self) -> Option<Arc<dyn ProviderObserver>> {
        self.inner.observers.read().clone()
    }

    fn emit_block(&self, number: u64) {
        let emitter = self.inner.emitter.read().clone();
        if let Some(emitter) = emitter {
            emitter.emit_if_new(number);
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Explicit metadata wins, otherwise consume the staged value. Both is an error.
    fn take_metadata(&self, explicit: Option<&Value>) -> Result<Option<Metadata>, ProviderError> {
        let mut staged = self.inner.next_metadata.lock();
        match explicit.filter(|m| !m.is_null()) {
            Some(_) if staged.is_some() => Err(ProviderError::ConflictingMetadata),
            Some(metadata) => Ok(Some(metadata.clone())),
            None => {
                let metadata = staged.take();
                tracing::debug!(found = metadata.is_some(), "no metadata in request, using staged value");
                Ok(metadata)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Send `request`, intercepting write calls. See the module docs.
    pub async fn request(&self, request: RpcRequest) -> Result<Value, ProviderError> {
        if !self.is_synced() {
            match self.sync_time(None).await {
                Ok(_) => {}
                Err(e @ ProviderError::ClockDiscrepancy(_)) => return Err(e),
                Err(e) => tracing::debug!(error = %e, "initial clock sync failed"),
            }
        }

        let result = match request.method.as_str() {
            "eth_sendTransaction" => self.send_transaction(request).await,
            "eth_sign" | "eth_signTypedData" | "eth_signTypedData_v4" => {
                self.sign(request, 0, 1).await
            }
            // personal_sign takes (message, address)
            "personal_sign" => self.sign(request, 1, 0).await,
            "eth_getBlockByNumber" => {
                let is_latest = request.params.first().and_then(Value::as_str) == Some("latest");
                let block = self.transport().request(request).await?;
                if is_latest {
                    self.observe_latest(&block);
                }
                Ok(block)
            }
            "eth_blockNumber" => {
                let number = self.transport().request(request).await?;
                if let Some(number) = parse_block_number(&number) {
                    self.emit_block(number);
                }
                Ok(number)
            }
            _ => self.transport().request(request).await,
        };

        if let Err(e) = &result {
            if e.kind().is_stale_cache() {
                let hook = self.inner.stale_cache_hook.read().clone();
                if let Some(hook) = hook {
                    hook(e);
                }
            }
        }
        result
    }

    /// [`request`](Self::request) and deserialize the result.
    pub async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<R, ProviderError> {
        let value = self.request(RpcRequest::new(method, params)).await?;
        Ok(serde_json::from_value(value)?)
    }

    fn observe_latest(&self, block: &Value) {
        let Ok(Some(header)) = serde_json::from_value::<Option<BlockHeader>>(block.clone()) else {
            return;
        };
        self.emit_block(header.number());
        if let Err(e) = self.apply_sync(header.timestamp()) {
            tracing::warn!(error = %e, "clock discrepancy on latest block");
        }
    }

    async fn send_transaction(&self, request: RpcRequest) -> Result<Value, ProviderError> {
        let Some(raw_tx) = request.params.first().cloned() else {
            return Err(ProviderError::rpc(codes::INVALID_PARAMS, "eth_sendTransaction expects a transaction"));
        };
        let tx: TransactionRequest = serde_json::from_value(raw_tx.clone()).map_err(|e| {
            ProviderError::rpc(codes::INVALID_PARAMS, format!("invalid transaction: {e}"))
        })?;
        let metadata = self.take_metadata(request.params.get(1))?;
        let timestamp = self.sync_time(None).await?;

        let tx = TxRequest {
            id: self.next_id(),
            tx,
            metadata,
            timestamp,
        };
        let observers = self.observers();
        if let Some(observers) = &observers {
            observers.on_tx_requested(&tx);
        }

        // metadata is never forwarded to the wallet
        let forwarded = RpcRequest::new("eth_sendTransaction", vec![raw_tx]);
        let sent = self.transport().request(forwarded).await.and_then(|value| {
            let hash: B256 = serde_json::from_value(value.clone())?;
            Ok((value, hash))
        });

        match sent {
            Ok((value, hash)) => {
                tracing::debug!(id = tx.id, %hash, "transaction sent");
                if let Some(observers) = &observers {
                    observers.on_tx_sent(&tx, hash);
                }
                Ok(value)
            }
            Err(e) => {
                tracing::debug!(id = tx.id, error = %e, "transaction cancelled");
                if let Some(observers) = &observers {
                    observers.on_tx_cancelled(&tx);
                }
                Err(e)
            }
        }
    }

    async fn sign(
        &self,
        request: RpcRequest,
        from_index: usize,
        message_index: usize,
    ) -> Result<Value, ProviderError> {
        let from: Address = request
            .params
            .get(from_index)
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ProviderError::rpc(codes::INVALID_PARAMS, format!("invalid signer: {e}")))?
            .ok_or_else(|| ProviderError::rpc(codes::INVALID_PARAMS, "missing signer address"))?;
        let message = request.params.get(message_index).cloned().unwrap_or(Value::Null);
        let metadata = self.take_metadata(request.params.get(2))?;
        let timestamp = self.sync_time(None).await?;

        let signature_request = SignatureRequest {
            id: self.next_id(),
            method: request.method.clone(),
            from,
            message,
            metadata,
            timestamp,
        };
        let observers = self.observers();
        if let Some(observers) = &observers {
            observers.on_signature_request(&signature_request);
        }

        let forwarded = RpcRequest::new(
            request.method,
            request.params.into_iter().take(2).collect(),
        );
        match self.transport().request(forwarded).await {
            Ok(signature) => {
                if let Some(observers) = &observers {
                    let text = signature.as_str().map(str::to_owned).unwrap_or_else(|| signature.to_string());
                    observers.on_signature_response(&signature_request, &text);
                }
                Ok(signature)
            }
            Err(e) => {
                if let Some(observers) = &observers {
                    observers.on_signature_cancelled(&signature_request);
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Chain clock
    // ------------------------------------------------------------------------

    pub fn is_synced(&self) -> bool {
        self.inner.clock.lock().is_some()
    }

    /// Chain time in seconds, extrapolated from the last sync.
    pub fn current_time(&self) -> Result<u64, ProviderError> {
        let clock = (*self.inner.clock.lock()).ok_or(ProviderError::NotSynced)?;
        Ok(clock.chain_time + clock.at.elapsed().as_secs())
    }

    /// Re-anchor the chain clock. Without a source, fetches the latest block.
    pub async fn sync_time(&self, source: Option<TimeSource>) -> Result<u64, ProviderError> {
        let chain_time = match source {
            Some(TimeSource::Timestamp(timestamp)) => timestamp,
            Some(TimeSource::Block(block)) => block.timestamp(),
            None => {
                let block = fetch_latest_block(&self.transport()).await?;
                self.emit_block(block.number());
                block.timestamp()
            }
        };
        self.apply_sync(chain_time)?;
        self.current_time()
    }

    fn apply_sync(&self, chain_time: u64) -> Result<(), ProviderError> {
        if let Some(check) = self.inner.config.time_discrepancy {
            if let Some(message) = clock_discrepancy(chain_time, check.threshold) {
                if check.only_log {
                    tracing::error!("{message}");
                } else {
                    return Err(ProviderError::ClockDiscrepancy(message));
                }
            }
        }
        *self.inner.clock.lock() = Some(ClockSync {
            chain_time,
            at: Instant::now(),
        });
        Ok(())
    }

    /// Poll the latest block until its number exceeds the one seen at call time.
    ///
    /// Busy loop without backoff, meant for dev and test tooling.
    pub async fn wait_new_block(&self) -> Result<BlockHeader, ProviderError> {
        let latest: BlockHeader = self
            .call("eth_getBlockByNumber", vec![json!("latest"), json!(false)])
            .await?;
        loop {
            let block: BlockHeader = self
                .call("eth_getBlockByNumber", vec![json!("latest"), json!(false)])
                .await?;
            if block.number() > latest.number() {
                return Ok(block);
            }
            tokio::task::yield_now().await;
        }
    }
}

/// Describe the drift between the node and the local clock, if above `threshold`.
fn clock_discrepancy(chain_time: u64, threshold: Duration) -> Option<String> {
    let local_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i128)
        .unwrap_or_default();
    let discrepancy = local_ms - chain_time as i128 * 1000;
    if discrepancy.unsigned_abs() <= threshold.as_millis() {
        return None;
    }
    let hours = discrepancy.div_euclid(ONE_HOUR_MS);
    let head = if discrepancy < 0 {
        format!("Node is {} hours ahead of your machine's clock.", -hours)
    } else {
        format!("Node is {hours} hours behind of your machine's clock.")
    };
    Some(format!(
        "{head} The client cannot know which one is more correct. Please ensure your node is synced and that your local clock is correct"
    ))
}
