//! Network resolution and chain cache diagnostics.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde_json::Value;

use super::{account::WAITING_FOR_NETWORK, Session, ACCOUNT_TIERS, NETWORK_TIERS};
use crate::{
    chain::{ChainDiagnostics, NetworkDiagnostics},
    deadline::call_with_deadline,
    error::{ProviderError, SessionError, StateError},
    networks::{parse_chain_id, Contracts, NetworkSource},
    state::NetworkStatus,
    storage,
    transport::RpcRequest,
};

/// Which self-healing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum DiagnosticLoop {
    Genesis,
    Nonce,
    Blocks,
}

/// Running flags, one loop of each kind at a time.
#[derive(Debug, Default)]
pub(super) struct DiagnosticLoops {
    genesis: AtomicBool,
    nonce: AtomicBool,
    blocks: AtomicBool,
}

impl DiagnosticLoops {
    fn flag(&self, kind: DiagnosticLoop) -> &AtomicBool {
        match kind {
            DiagnosticLoop::Genesis => &self.genesis,
            DiagnosticLoop::Nonce => &self.nonce,
            DiagnosticLoop::Blocks => &self.blocks,
        }
    }
}

/// Chain id from an `eth_chainId` answer, hex string or number.
pub(super) fn chain_id_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => parse_chain_id(s),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

impl Session {
    // ========================================================================
    // Network resolution
    // ========================================================================

    /// Recompute the network state for `chain_id` and settle the tiers that
    /// now hold. Failures reject the network tiers.
    pub(super) async fn handle_network(&self, chain_id: u64) -> Result<(), StateError> {
        let result = self.resolve_network(chain_id).await;
        if let Err(e) = &result {
            let shown = e.clone();
            self.inner
                .network
                .send_modify(|network| network.error = Some(shown));
            self.inner.readiness.reject_many(&NETWORK_TIERS, e.clone());
        }
        result
    }

    async fn resolve_network(&self, chain_id: u64) -> Result<(), StateError> {
        let provider = self
            .inner
            .provider
            .lock()
            .clone()
            .ok_or_else(|| StateError::from(SessionError::NoProvider))?;
        *self.inner.observed_chain.lock() = Some(chain_id);
        self.inner.emitter.set_chain_id(Some(chain_id));

        let diagnostics = match &self.inner.diagnostics {
            Some(diagnostics) if diagnostics.chain_id() == chain_id => {
                diagnostics.inspect(&provider).await
            }
            _ => NetworkDiagnostics {
                has_encountered_blocks_cache_issue: Some(storage::has_encountered_blocks_cache_issue(
                    self.inner.config.store.as_ref(),
                    chain_id,
                )),
                ..Default::default()
            },
        };
        let genesis_mismatch = diagnostics.genesis_not_matching == Some(true);
        let blocks_cached = diagnostics.blocks_cached == Some(true);
        self.inner.network.send_modify(|network| {
            let nonce_cached = network.diagnostics.nonce_cached;
            let same_chain = network.chain_id() == Some(chain_id);
            network.diagnostics = diagnostics;
            if same_chain {
                network.diagnostics.nonce_cached = nonce_cached;
            }
        });
        if genesis_mismatch {
            self.spawn_diagnostic_loop(DiagnosticLoop::Genesis, true);
        }
        if blocks_cached {
            self.spawn_diagnostic_loop(DiagnosticLoop::Blocks, true);
        }

        let source = self.inner.networks.read().clone();
        let contracts = match source {
            None => Some(Contracts::new()),
            Some(NetworkSource::Static(configs)) => configs.contracts_for(chain_id).cloned(),
            Some(NetworkSource::Resolver(resolver)) => {
                self.inner.network.send_modify(|network| {
                    network.status = NetworkStatus::Disconnected {
                        fetching_chain_id: false,
                        chain_id: Some(chain_id),
                        loading: true,
                    }
                });
                match resolver.resolve(chain_id).await {
                    Ok(configs) => configs.contracts_for(chain_id).cloned(),
                    Err(e) => {
                        self.inner.network.send_modify(|network| {
                            network.status = NetworkStatus::Disconnected {
                                fetching_chain_id: false,
                                chain_id: Some(chain_id),
                                loading: false,
                            }
                        });
                        return Err(e);
                    }
                }
            }
        };

        if *self.inner.observed_chain.lock() != Some(chain_id) {
            tracing::debug!(chain_id, "chain changed while resolving, dropping result");
            return Ok(());
        }

        match contracts {
            Some(contracts) => {
                tracing::info!(chain_id, contracts = contracts.len(), "network connected");
                self.inner.network.send_modify(|network| {
                    network.error = None;
                    network.status = NetworkStatus::Connected {
                        chain_id,
                        contracts,
                    };
                });
                self.resolve_satisfied();
            }
            None => {
                tracing::info!(chain_id, "network not supported");
                self.inner.network.send_modify(|network| {
                    network.error = None;
                    network.status = NetworkStatus::NotSupported { chain_id };
                });
            }
        }

        let waiting = {
            let account = self.inner.account.borrow();
            if account.loading_data() == Some(WAITING_FOR_NETWORK) {
                account.address()
            } else {
                None
            }
        };
        if let Some(address) = waiting {
            self.handle_account(Some(address), false).await;
        }
        Ok(())
    }

    /// Fetch the chain id from the wallet, under the request deadline.
    pub(super) async fn fetch_and_set_chain_id(&self) -> Result<u64, ProviderError> {
        if self.inner.network.borrow().is_connected() {
            tracing::error!("chain id fetched while the network is connected");
        }
        let provider = self
            .inner
            .provider
            .lock()
            .clone()
            .ok_or_else(|| ProviderError::Transport("no provider setup".into()))?;

        self.set_network_disconnected(true, None);
        let fetched = call_with_deadline(
            &provider,
            RpcRequest::method("eth_chainId"),
            self.inner.config.request_timeout,
        )
        .await
        .and_then(|value| {
            chain_id_from_value(&value)
                .ok_or_else(|| ProviderError::InvalidResponse(format!("invalid chainId {value}")))
        });

        match fetched {
            Ok(chain_id) => {
                self.set_network_disconnected(false, Some(chain_id));
                *self.inner.observed_chain.lock() = Some(chain_id);
                Ok(chain_id)
            }
            Err(e) => {
                self.set_network_disconnected(false, None);
                Err(e)
            }
        }
    }

    fn set_network_disconnected(&self, fetching_chain_id: bool, chain_id: Option<u64>) {
        self.inner.network.send_modify(|network| {
            network.status = NetworkStatus::Disconnected {
                fetching_chain_id,
                chain_id,
                loading: false,
            }
        });
    }

    pub(super) fn has_chain_changed(&self, chain_id: u64) -> bool {
        *self.inner.observed_chain.lock() != Some(chain_id)
    }

    /// Record `chain_id` as observed. `false` if it already was.
    fn mark_chain_observed(&self, chain_id: u64) -> bool {
        let mut observed = self.inner.observed_chain.lock();
        if *observed == Some(chain_id) {
            return false;
        }
        *observed = Some(chain_id);
        true
    }

    /// `chainChanged` handler, shared by the event and polling paths.
    pub(super) async fn on_chain_changed(&self, raw: String) {
        let raw = if raw == "0xNaN" {
            tracing::warn!("chainChanged reported 0xNaN, fetching chainId again");
            let Some(provider) = self.provider() else {
                tracing::error!("no provider to get chainId");
                return;
            };
            match provider.request(RpcRequest::method("eth_chainId")).await {
                Ok(Value::String(chain_id)) => chain_id,
                Ok(other) => other.to_string(),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to fetch chainId after 0xNaN");
                    return;
                }
            }
        } else {
            raw
        };
        let Some(chain_id) = parse_chain_id(&raw) else {
            tracing::warn!(chain_id = %raw, "ignoring unparsable chainId");
            return;
        };
        if !self.mark_chain_observed(chain_id) {
            return;
        }
        tracing::info!(chain_id, "chain changed");

        let loads_account_data = self.inner.config.account_data.is_some();
        if loads_account_data {
            self.set_loading_data("Loading Network...");
        }
        if let Err(e) = self.handle_network(chain_id).await {
            tracing::error!(chain_id, error = %e, "failed to handle network and account");
            if loads_account_data {
                self.inner.account.send_modify(|account| {
                    account.update_disconnected(|a| {
                        a.loading_data = None;
                        a.loading_step = None;
                    });
                    account.error = Some(e);
                });
                self.inner.readiness.resolve_many(&ACCOUNT_TIERS, false);
            }
            return;
        }
        if loads_account_data {
            self.set_loading_data("Loading account...");
        }

        let address = {
            let account = self.inner.account.borrow();
            if account.locked() {
                None
            } else {
                account.address()
            }
        };
        self.handle_account(address, true).await;
    }

    fn set_loading_data(&self, message: &str) {
        self.inner.account.send_modify(|account| {
            account.update_disconnected(|a| a.loading_data = Some(message.to_string()))
        });
    }

    // ========================================================================
    // Cache diagnostics
    // ========================================================================

    /// Record the current genesis as the expected one for this chain.
    pub fn acknowledge_new_genesis(&self) {
        let (chain_id, hash) = {
            let network = self.inner.network.borrow();
            (network.chain_id(), network.diagnostics.genesis_hash)
        };
        if let (Some(chain_id), Some(hash)) = (chain_id, hash) {
            storage::record_new_genesis(self.inner.config.store.as_ref(), chain_id, hash);
            self.inner
                .network
                .send_modify(|network| network.diagnostics.genesis_changed = Some(false));
        }
    }

    /// The user says the wallet cache was cleared: check again now and keep
    /// checking until the flags clear.
    pub fn notify_cache_cleared(&self) {
        self.spawn_diagnostic_loop(DiagnosticLoop::Genesis, false);
        self.spawn_diagnostic_loop(DiagnosticLoop::Nonce, false);
        self.spawn_diagnostic_loop(DiagnosticLoop::Blocks, false);
    }

    /// A wrapped request failed because the wallet serves stale blocks.
    pub(super) fn on_stale_cache(&self, error: &ProviderError) {
        let Some(chain_id) = self.inner.network.borrow().chain_id() else {
            return;
        };
        tracing::warn!(chain_id, error = %error, "wallet is serving a stale block cache");
        storage::record_blocks_cache_issue(self.inner.config.store.as_ref(), chain_id);
        self.inner.network.send_modify(|network| {
            network.diagnostics.blocks_cached = Some(true);
            network.diagnostics.has_encountered_blocks_cache_issue = Some(true);
        });
        self.spawn_diagnostic_loop(DiagnosticLoop::Blocks, true);
    }

    /// Poll until the flag for `kind` clears. No-op without a dev network or
    /// when a loop of that kind already runs.
    pub(super) fn spawn_diagnostic_loop(&self, kind: DiagnosticLoop, skip_first: bool) {
        let Some(diagnostics) = self.inner.diagnostics.clone() else {
            return;
        };
        if self.inner.loops.flag(kind).swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::downgrade(&self.inner);
        let interval = self.inner.config.diagnostics_interval;
        tokio::spawn(async move {
            let mut skip = skip_first;
            loop {
                if skip {
                    skip = false;
                } else {
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    if !(Session { inner }).diagnostic_step(kind, &diagnostics).await {
                        break;
                    }
                }
                tokio::time::sleep(interval).await;
            }
            if let Some(inner) = inner.upgrade() {
                inner.loops.flag(kind).store(false, Ordering::SeqCst);
            }
        });
    }

    /// One check. Returns whether the loop should keep going.
    async fn diagnostic_step(&self, kind: DiagnosticLoop, diagnostics: &ChainDiagnostics) -> bool {
        let (chain_id, flagged, genesis_hash) = {
            let network = self.inner.network.borrow();
            let flagged = match kind {
                DiagnosticLoop::Genesis => network.diagnostics.genesis_not_matching == Some(true),
                DiagnosticLoop::Nonce => network.diagnostics.nonce_cached.is_some(),
                DiagnosticLoop::Blocks => network.diagnostics.blocks_cached == Some(true),
            };
            (network.chain_id(), flagged, network.diagnostics.genesis_hash)
        };
        if chain_id != Some(diagnostics.chain_id()) || !flagged {
            return false;
        }
        let Some(provider) = self.provider() else {
            return false;
        };

        match kind {
            DiagnosticLoop::Genesis => match diagnostics.check_genesis(&provider).await {
                Ok((hash, true)) => {
                    tracing::info!(chain_id = diagnostics.chain_id(), "genesis cache cleared");
                    diagnostics.acknowledge_genesis(hash);
                    self.inner.network.send_modify(|network| {
                        network.diagnostics.genesis_hash = Some(hash);
                        network.diagnostics.genesis_not_matching = Some(false);
                        network.diagnostics.genesis_changed = Some(false);
                    });
                    false
                }
                Ok((_, false)) => true,
                Err(e) => {
                    tracing::debug!(error = %e, "genesis check failed");
                    true
                }
            },
            DiagnosticLoop::Nonce => {
                let Some(address) = self.inner.account.borrow().address() else {
                    return true;
                };
                match diagnostics.nonce_cached(address, &provider).await {
                    Ok(None) => {
                        tracing::info!(%address, "nonce cache cleared");
                        if let Some(hash) = genesis_hash {
                            diagnostics.acknowledge_genesis(hash);
                        }
                        self.inner.network.send_modify(|network| {
                            network.diagnostics.nonce_cached = None;
                            if genesis_hash.is_some() {
                                network.diagnostics.genesis_changed = Some(false);
                            }
                        });
                        false
                    }
                    Ok(Some(_)) => true,
                    Err(e) => {
                        tracing::debug!(error = %e, "nonce check failed");
                        true
                    }
                }
            }
            DiagnosticLoop::Blocks => match diagnostics.blocks_cached(&provider).await {
                Ok(false) => {
                    tracing::info!(chain_id = diagnostics.chain_id(), "block cache cleared");
                    self.inner
                        .network
                        .send_modify(|network| network.diagnostics.blocks_cached = Some(false));
                    false
                }
                Ok(true) => true,
                Err(e) => {
                    tracing::debug!(error = %e, "block height check failed");
                    true
                }
            },
        }
    }
}
