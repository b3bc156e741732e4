//! Wallet change listeners.
//!
//! ## Architecture
//!
//! ```text
//!   provider events ──► pump_events ──┐
//!   eth_accounts poll ─► poll_accounts ┼──► on_accounts_changed / on_chain_changed
//!   eth_chainId poll ──► poll_chain ───┘          (spawned, change-detected)
//! ```
//!
//! Wallets do not all emit events reliably, so both paths run. The handlers
//! dedupe, a change reported by both is handled once. The loops hold a weak
//! reference and end when the session is dropped.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use alloy::primitives::Address;
use rand::Rng;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

use super::{network::chain_id_from_value, Session, SessionInner};
use crate::{
    config::PollingConfig,
    deadline::{call_as_with_deadline, call_with_deadline},
    error::backoff_duration,
    networks::to_hex_chain_id,
    transport::{ProviderEvent, RpcRequest},
};

/// Listener tasks of one connection. Aborted on drop.
#[derive(Debug)]
pub(super) struct Listening {
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Listening {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Delay before the next poll after `failures` consecutive failed polls.
pub(super) fn poll_delay(polling: &PollingConfig, failures: u32) -> Duration {
    let base = if failures == 0 {
        polling.interval
    } else {
        let interval_ms = u64::try_from(polling.interval.as_millis()).unwrap_or(u64::MAX);
        backoff_duration(failures, interval_ms)
            .min(polling.max_backoff)
            .max(polling.interval)
    };
    let jitter_ms = u64::try_from(polling.jitter.as_millis()).unwrap_or(u64::MAX);
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
}

fn upgrade(inner: &Weak<SessionInner>) -> Option<Session> {
    inner.upgrade().map(|inner| Session { inner })
}

impl Session {
    pub(super) fn start_listening(&self) {
        let mut listening = self.inner.listening.lock();
        if listening.is_some() {
            return;
        }
        let Some(provider) = self.provider() else {
            tracing::error!("no provider to listen to");
            return;
        };
        tracing::info!("listening for wallet changes");

        let inner = Arc::downgrade(&self.inner);
        let mut tasks = Vec::with_capacity(3);
        if let Some(events) = provider.events() {
            tasks.push(tokio::spawn(pump_events(inner.clone(), events)));
        }
        tasks.push(tokio::spawn(poll_accounts(inner.clone())));
        tasks.push(tokio::spawn(poll_chain(inner)));
        *listening = Some(Listening { tasks });
    }

    pub(super) fn stop_listening(&self) {
        if self.inner.listening.lock().take().is_some() {
            tracing::info!("stopped listening");
        }
    }
}

async fn pump_events(inner: Weak<SessionInner>, mut events: broadcast::Receiver<ProviderEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "wallet events lagged, polling will catch up");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(session) = upgrade(&inner) else {
            break;
        };
        match event {
            ProviderEvent::ChainChanged(chain_id) => {
                tracing::debug!(%chain_id, "chainChanged event");
                tokio::spawn(async move { session.on_chain_changed(chain_id).await });
            }
            ProviderEvent::AccountsChanged(accounts) => {
                tracing::debug!(?accounts, "accountsChanged event");
                let address = accounts.first().copied();
                tokio::spawn(async move { session.on_accounts_changed(address).await });
            }
            ProviderEvent::Message(_) => {}
        }
    }
}

async fn poll_accounts(inner: Weak<SessionInner>) {
    let mut failures = 0u32;
    loop {
        let Some(delay) = upgrade(&inner).map(|s| poll_delay(&s.inner.config.polling, failures)) else {
            break;
        };
        tokio::time::sleep(delay).await;

        let Some(session) = upgrade(&inner) else {
            break;
        };
        let Some(provider) = session.provider() else {
            tracing::error!("polling accounts without a provider");
            break;
        };
        let fetched = call_as_with_deadline::<Vec<Address>>(
            &provider,
            "eth_accounts",
            vec![],
            session.inner.config.request_timeout,
        )
        .await;
        let accounts = match fetched {
            Ok(accounts) => accounts,
            Err(e) if e.kind().is_benign_account_error() => vec![],
            Err(e) => {
                failures = failures.saturating_add(1);
                tracing::warn!(error = %e, failures, "failed to poll accounts");
                continue;
            }
        };
        failures = 0;

        let address = accounts.first().copied();
        if session.has_account_changed(address) {
            tokio::spawn(async move { session.on_accounts_changed(address).await });
        }
    }
}

async fn poll_chain(inner: Weak<SessionInner>) {
    let mut failures = 0u32;
    loop {
        let Some(delay) = upgrade(&inner).map(|s| poll_delay(&s.inner.config.polling, failures)) else {
            break;
        };
        tokio::time::sleep(delay).await;

        let Some(session) = upgrade(&inner) else {
            break;
        };
        let Some(provider) = session.provider() else {
            tracing::error!("polling chainId without a provider");
            break;
        };
        let fetched = call_with_deadline(
            &provider,
            RpcRequest::method("eth_chainId"),
            session.inner.config.request_timeout,
        )
        .await;
        let chain_id = match fetched.as_ref().map(chain_id_from_value) {
            Ok(Some(chain_id)) => chain_id,
            Ok(None) => {
                failures = failures.saturating_add(1);
                tracing::warn!(failures, "wallet returned an invalid chainId");
                continue;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                tracing::warn!(error = %e, failures, "failed to poll chainId");
                continue;
            }
        };
        failures = 0;

        if session.has_chain_changed(chain_id) {
            let raw = to_hex_chain_id(chain_id);
            tokio::spawn(async move { session.on_chain_changed(raw).await });
        }
    }
}
