//! Observer hooks fired by the provider wrapper around write requests.

use std::sync::Arc;

use alloy::{
    primitives::{Address, B256},
    rpc::types::TransactionRequest,
};
use serde_json::Value;

/// Caller supplied metadata attached to a transaction or signature request.
pub type Metadata = Value;

/// An `eth_sendTransaction` as seen by observers.
#[derive(Debug, Clone, PartialEq)]
pub struct TxRequest {
    /// Identity of this request, unique for the wrapper's lifetime.
    pub id: u64,
    /// Transaction fields as forwarded to the wallet.
    pub tx: TransactionRequest,
    pub metadata: Option<Metadata>,
    /// Synchronized chain time (seconds) when the request was issued.
    pub timestamp: u64,
}

/// A signature request (`eth_sign`, `personal_sign`, `eth_signTypedData*`).
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureRequest {
    pub id: u64,
    pub method: String,
    pub from: Address,
    /// The message or typed data, exactly as the caller passed it.
    pub message: Value,
    pub metadata: Option<Metadata>,
    pub timestamp: u64,
}

/// Receives the before/after/cancel triad of every intercepted write call.
///
/// All methods default to no-ops.
pub trait ProviderObserver: Send + Sync {
    fn on_tx_requested(&self, _tx: &TxRequest) {}

    fn on_tx_cancelled(&self, _tx: &TxRequest) {}

    fn on_tx_sent(&self, _tx: &TxRequest, _hash: B256) {}

    fn on_signature_request(&self, _request: &SignatureRequest) {}

    fn on_signature_cancelled(&self, _request: &SignatureRequest) {}

    fn on_signature_response(&self, _request: &SignatureRequest, _signature: &str) {}
}

/// Fans every callback out to a list of observers, in order.
#[derive(Clone, Default)]
pub struct MultiObserver {
    observers: Vec<Arc<dyn ProviderObserver>>,
}

impl MultiObserver {
    pub fn new(observers: Vec<Arc<dyn ProviderObserver>>) -> Self {
        Self { observers }
    }

    pub fn push(&mut self, observer: Arc<dyn ProviderObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl ProviderObserver for MultiObserver {
    fn on_tx_requested(&self, tx: &TxRequest) {
        self.observers.iter().for_each(|o| o.on_tx_requested(tx));
    }

    fn on_tx_cancelled(&self, tx: &TxRequest) {
        self.observers.iter().for_each(|o| o.on_tx_cancelled(tx));
    }

    fn on_tx_sent(&self, tx: &TxRequest, hash: B256) {
        self.observers.iter().for_each(|o| o.on_tx_sent(tx, hash));
    }

    fn on_signature_request(&self, request: &SignatureRequest) {
        self.observers.iter().for_each(|o| o.on_signature_request(request));
    }

    fn on_signature_cancelled(&self, request: &SignatureRequest) {
        self.observers.iter().for_each(|o| o.on_signature_cancelled(request));
    }

    fn on_signature_response(&self, request: &SignatureRequest, signature: &str) {
        self.observers
            .iter()
            .for_each(|o| o.on_signature_response(request, signature));
    }
}
