//! Pending write actions derived from wrapper observer callbacks.
//!
//! The tracker is a plain [`ProviderObserver`]: requests are pushed in arrival
//! order and removed by identity once they are sent, answered or cancelled.

use tokio::sync::watch;

use crate::observer::{ProviderObserver, SignatureRequest, TxRequest};

/// A transaction or signature waiting on the wallet.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingAction {
    Transaction(TxRequest),
    Signature(SignatureRequest),
}

impl PendingAction {
    pub fn id(&self) -> u64 {
        match self {
            PendingAction::Transaction(tx) => tx.id,
            PendingAction::Signature(request) => request.id,
        }
    }

    pub fn is_transaction(&self) -> bool {
        matches!(self, PendingAction::Transaction(_))
    }
}

/// Observable, insertion ordered list of pending actions.
#[derive(Debug)]
pub struct PendingActions {
    actions: watch::Sender<Vec<PendingAction>>,
}

impl Default for PendingActions {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingActions {
    pub fn new() -> Self {
        let (actions, _) = watch::channel(Vec::new());
        Self { actions }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PendingAction>> {
        self.actions.subscribe()
    }

    pub fn snapshot(&self) -> Vec<PendingAction> {
        self.actions.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.actions.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.borrow().is_empty()
    }

    /// Drop the oldest entry, for a UI giving up on a stuck confirmation.
    pub fn skip(&self) -> Option<PendingAction> {
        let mut skipped = None;
        self.actions.send_if_modified(|actions| {
            if actions.is_empty() {
                return false;
            }
            skipped = Some(actions.remove(0));
            true
        });
        skipped
    }

    fn push(&self, action: PendingAction) {
        self.actions.send_modify(|actions| actions.push(action));
    }

    fn remove(&self, id: u64) {
        self.actions.send_if_modified(|actions| {
            let before = actions.len();
            actions.retain(|action| action.id() != id);
            actions.len() != before
        });
    }
}

impl ProviderObserver for PendingActions {
    fn on_tx_requested(&self, tx: &TxRequest) {
        self.push(PendingAction::Transaction(tx.clone()));
    }

    fn on_tx_cancelled(&self, tx: &TxRequest) {
        self.remove(tx.id);
    }

    fn on_tx_sent(&self, tx: &TxRequest, _hash: alloy::primitives::B256) {
        self.remove(tx.id);
    }

    fn on_signature_request(&self, request: &SignatureRequest) {
        self.push(PendingAction::Signature(request.clone()));
    }

    fn on_signature_cancelled(&self, request: &SignatureRequest) {
        self.remove(request.id);
    }

    fn on_signature_response(&self, request: &SignatureRequest, _signature: &str) {
        self.remove(request.id);
    }
}
