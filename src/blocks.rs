//! New block notifications.
//!
//! [`BlockEmitter`] owns the "last seen block" and broadcasts each new height
//! exactly once. Several sources feed it: the [`BlockPoller`] timer, the
//! `newHeads` subscription and the wrapper whenever a caller happens to fetch
//! the latest block.
//!
//! ## Architecture
//!
//! ```text
//! interval tick ─────────┐
//! newHeads message ──────┼──► fetch latest ──► BlockEmitter::emit_if_new ──► broadcast
//! wrapper (latest block) ┘                        │
//!                                                 └─ suppressed when number <= last
//!                                                    and chain id unchanged
//! ```

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use alloy::primitives::{B256, U64};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::{
    error::ProviderError,
    transport::{ProviderEvent, RpcRequest, Transport},
    wrap::WrappedProvider,
};

/// Minimum poll interval regardless of block time.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Block header
// ============================================================================

/// The subset of an `eth_getBlockByNumber` response the session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: U64,
    #[serde(default)]
    pub hash: Option<B256>,
    pub timestamp: U64,
}

impl BlockHeader {
    pub fn number(&self) -> u64 {
        self.number.to::<u64>()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.to::<u64>()
    }
}

/// Fetch the latest block header through `transport`.
pub async fn fetch_latest_block(transport: &Transport) -> Result<BlockHeader, ProviderError> {
    let block: Option<BlockHeader> = transport
        .call("eth_getBlockByNumber", vec![json!("latest"), json!(false)])
        .await?;
    block.ok_or_else(|| ProviderError::InvalidResponse("latest block not available".into()))
}

// ============================================================================
// BlockEmitter
// ============================================================================

/// A new block observed on a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBlock {
    pub chain_id: Option<u64>,
    pub number: u64,
}

#[derive(Debug, Default)]
struct EmitterState {
    chain_id: Option<u64>,
    last: Option<NewBlock>,
}

/// De-duplicating broadcaster of new block heights.
#[derive(Debug)]
pub struct BlockEmitter {
    state: Mutex<EmitterState>,
    tx: broadcast::Sender<NewBlock>,
}

impl Default for BlockEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(EmitterState::default()),
            tx,
        }
    }

    /// Set the active chain. Heights are only emitted while a chain is active.
    pub fn set_chain_id(&self, chain_id: Option<u64>) {
        self.state.lock().chain_id = chain_id;
    }

    pub fn chain_id(&self) -> Option<u64> {
        self.state.lock().chain_id
    }

    pub fn last(&self) -> Option<NewBlock> {
        self.state.lock().last
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NewBlock> {
        self.tx.subscribe()
    }

    /// Emit `number` unless it was already emitted for the active chain.
    ///
    /// Returns whether a notification went out.
    pub fn emit_if_new(&self, number: u64) -> bool {
        let block = {
            let mut state = self.state.lock();
            let chain_id = state.chain_id;
            if chain_id.is_none() {
                return false;
            }
            let is_new = match state.last {
                None => true,
                Some(last) => last.chain_id != chain_id || number > last.number,
            };
            if !is_new {
                return false;
            }
            let block = NewBlock { chain_id, number };
            state.last = Some(block);
            block
        };
        tracing::trace!(number, chain_id = ?block.chain_id, "new block");
        // No receivers is fine
        let _ = self.tx.send(block);
        true
    }
}

// ============================================================================
// BlockPoller
// ============================================================================

struct ActiveSubscription {
    transport: Transport,
    id: String,
    listener: JoinHandle<()>,
}

impl ActiveSubscription {
    async fn cancel(self) {
        self.listener.abort();
        let request = RpcRequest::new("eth_unsubscribe", vec![json!(self.id)]);
        if let Err(e) = self.transport.request(request).await {
            tracing::warn!(subscription = %self.id, error = %e, "failed to unsubscribe from newHeads");
        }
    }
}

#[derive(Default)]
struct PollerState {
    timer: Option<JoinHandle<()>>,
    subscription: Option<ActiveSubscription>,
}

struct PollerShared {
    emitter: Arc<BlockEmitter>,
    state: Mutex<PollerState>,
    /// Held across a whole subscription swap.
    swap: tokio::sync::Mutex<()>,
    /// Bumped by every `resubscribe` and `stop`. Only the latest swap may
    /// leave a subscription behind.
    generation: AtomicU64,
}

/// Timer plus subscription driven source of new block notifications.
pub struct BlockPoller {
    interval: Duration,
    shared: Arc<PollerShared>,
}

impl BlockPoller {
    /// Poll every `max(block_time / 2, 1s)`.
    pub fn new(emitter: Arc<BlockEmitter>, block_time: Duration) -> Self {
        Self {
            interval: (block_time / 2).max(MIN_POLL_INTERVAL),
            shared: Arc::new(PollerShared {
                emitter,
                state: Mutex::new(PollerState::default()),
                swap: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().timer.is_some()
    }

    /// Id of the live `newHeads` subscription, if any.
    pub fn subscription_id(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .subscription
            .as_ref()
            .map(|subscription| subscription.id.clone())
    }

    /// Start the timer if it is not already running.
    ///
    /// The timer polls whatever transport `provider` currently wraps, so it
    /// survives underlying provider swaps.
    pub fn start(&self, provider: WrappedProvider) {
        let mut state = self.shared.state.lock();
        if state.timer.is_some() {
            return;
        }
        let emitter = self.shared.emitter.clone();
        let period = self.interval;
        state.timer = Some(tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = check_latest(&provider.transport(), &emitter).await {
                    tracing::debug!(error = %e, "block poll failed");
                }
            }
        }));
    }

    /// Move the `newHeads` subscription from the previous transport to `transport`.
    ///
    /// Swaps are ordered by call, not by when the returned future runs: a swap
    /// overtaken by a later one undoes its own subscription. Unsubscribing is
    /// best effort. A wallet without subscription support simply leaves the
    /// timer as the only source.
    pub fn resubscribe(&self, transport: Transport) -> impl Future<Output = ()> + Send + 'static {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = self.shared.clone();
        async move { shared.resubscribe(generation, transport).await }
    }

    /// Tear down the timer and the subscription listener.
    pub fn stop(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let mut state = self.shared.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if let Some(subscription) = state.subscription.take() {
            subscription.listener.abort();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(subscription.cancel());
            }
        }
    }
}

impl Drop for BlockPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

impl PollerShared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn resubscribe(&self, generation: u64, transport: Transport) {
        let _swap = self.swap.lock().await;
        if !self.is_current(generation) {
            return;
        }

        let previous = self.state.lock().subscription.take();
        if let Some(previous) = previous {
            previous.cancel().await;
        }

        let Some(mut events) = transport.events() else {
            return;
        };
        let id: String = match transport.call("eth_subscribe", vec![json!("newHeads")]).await {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!(error = %e, "newHeads subscription not supported");
                return;
            }
        };
        tracing::debug!(subscription = %id, "subscribed to newHeads");

        let emitter = self.emitter.clone();
        let listen_on = transport.clone();
        let subscription_id = id.clone();
        let listener = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ProviderEvent::Message(message)) if message.subscription == subscription_id => {
                        if let Err(e) = check_latest(&listen_on, &emitter).await {
                            tracing::debug!(error = %e, "block check after newHeads failed");
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        let subscription = ActiveSubscription {
            transport,
            id,
            listener,
        };

        if !self.is_current(generation) {
            tracing::debug!(subscription = %subscription.id, "newHeads swap superseded");
            subscription.cancel().await;
            return;
        }
        self.state.lock().subscription = Some(subscription);
    }
}

/// Fetch the latest block and feed it to the emitter. No-op without an active chain.
async fn check_latest(transport: &Transport, emitter: &BlockEmitter) -> Result<(), ProviderError> {
    if emitter.chain_id().is_none() {
        return Ok(());
    }
    let block = fetch_latest_block(transport).await?;
    emitter.emit_if_new(block.number());
    Ok(())
}

/// Parse a `0x` quantity the way `eth_blockNumber` returns it.
pub(crate) fn parse_block_number(value: &Value) -> Option<u64> {
    serde_json::from_value::<U64>(value.clone())
        .ok()
        .map(|n| n.to::<u64>())
}
