//! Session configuration.
//!
//! Everything has a sensible default; `ConnectionConfig::default()` gives a
//! session offering the builtin wallet only, with an in-memory store.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    chain::{HttpReferenceNode, ReferenceNode},
    connection::AccountDataLoader,
    deadline::DEFAULT_REQUEST_TIMEOUT,
    module::WalletOption,
    networks::{parse_chain_id, NetworkSource},
    observer::ProviderObserver,
    storage::{KeyValueStore, MemoryStore},
    transport::Eip1193Provider,
    wrap::WrapConfig,
};

// ============================================================================
// Chain parameters
// ============================================================================

/// Timing parameters for one chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainParameters {
    /// Confirmations before a block is considered final.
    pub finality: u64,
    /// Expected block interval (seconds in serialized form).
    #[serde(with = "secs")]
    pub block_time: Duration,
    /// Transaction confirmation timeout (seconds in serialized form).
    #[serde(with = "secs", default = "default_tx_timeout")]
    pub timeout: Duration,
}

fn default_tx_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ChainParameters {
    fn default() -> Self {
        Self {
            finality: 12,
            block_time: Duration::from_secs(5),
            timeout: default_tx_timeout(),
        }
    }
}

/// Default parameters plus per chain overrides keyed by chain id (decimal or hex).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(flatten)]
    pub default: ChainParameters,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub chains: BTreeMap<String, ChainParameters>,
}

impl Parameters {
    pub fn with_chain(mut self, chain_id: u64, parameters: ChainParameters) -> Self {
        self.chains.insert(chain_id.to_string(), parameters);
        self
    }

    /// Parameters for `chain_id`, falling back to the defaults.
    pub fn for_chain(&self, chain_id: Option<u64>) -> &ChainParameters {
        chain_id
            .and_then(|id| {
                self.chains
                    .iter()
                    .find(|(key, _)| parse_chain_id(key) == Some(id))
                    .map(|(_, params)| params)
            })
            .unwrap_or(&self.default)
    }
}

// ============================================================================
// Polling
// ============================================================================

/// Account and chain id polling, the backstop for unreliable wallet events.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingConfig {
    #[serde(with = "secs")]
    pub interval: Duration,
    /// Random extra delay added to each interval, up to this value.
    #[serde(with = "secs", default)]
    pub jitter: Duration,
    /// Upper bound for the delay after consecutive failed polls.
    #[serde(with = "secs")]
    pub max_backoff: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            jitter: Duration::ZERO,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl PollingConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }
}

// ============================================================================
// RPC endpoints
// ============================================================================

/// Read-only endpoint used when no wallet is connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRpc {
    pub chain_id: u64,
    pub url: Url,
}

/// Dev chain whose wallet cache is checked against a trusted node.
#[derive(Clone)]
pub struct DevNetwork {
    pub chain_id: u64,
    pub node: Arc<dyn ReferenceNode>,
    /// Also compare account nonces.
    pub check_cache_issues: bool,
}

impl DevNetwork {
    pub fn new(chain_id: u64, node: Arc<dyn ReferenceNode>) -> Self {
        Self {
            chain_id,
            node,
            check_cache_issues: false,
        }
    }

    /// Compare against the JSON-RPC node at `url`.
    pub fn http(chain_id: u64, url: Url) -> Self {
        Self::new(chain_id, Arc::new(HttpReferenceNode::new(url)))
    }

    pub fn with_cache_checks(mut self, enabled: bool) -> Self {
        self.check_cache_issues = enabled;
        self
    }
}

impl fmt::Debug for DevNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevNetwork")
            .field("chain_id", &self.chain_id)
            .field("check_cache_issues", &self.check_cache_issues)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Chain switching
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// Chain description sent with `wallet_addEthereumChain`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddChainParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_name: Option<String>,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_explorer_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub icon_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_currency: Option<NativeCurrency>,
}

// ============================================================================
// ConnectionConfig
// ============================================================================

#[derive(Clone)]
pub struct ConnectionConfig {
    pub options: Vec<WalletOption>,
    pub parameters: Parameters,
    /// Reconnect to the previously selected wallet on start.
    pub auto_connect_using_previous: bool,
    pub networks: Option<NetworkSource>,
    pub default_rpc: Option<DefaultRpc>,
    pub account_data: Option<Arc<dyn AccountDataLoader>>,
    pub observers: Option<Arc<dyn ProviderObserver>>,
    pub dev_network: Option<DevNetwork>,
    pub provider: WrapConfig,
    pub polling: PollingConfig,
    /// Deadline for chain id and account list fetches.
    pub request_timeout: Duration,
    /// How long start-up waits on the previous wallet before giving up.
    pub auto_start_timeout: Duration,
    /// Period of the cache diagnostics self-healing loops.
    pub diagnostics_interval: Duration,
    pub store: Arc<dyn KeyValueStore>,
    /// The injected provider, when the host has one.
    pub builtin: Option<Arc<dyn Eip1193Provider>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            options: vec![WalletOption::Builtin],
            parameters: Parameters::default(),
            auto_connect_using_previous: true,
            networks: None,
            default_rpc: None,
            account_data: None,
            observers: None,
            dev_network: None,
            provider: WrapConfig::default(),
            polling: PollingConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            auto_start_timeout: Duration::from_secs(2),
            diagnostics_interval: Duration::from_secs(1),
            store: Arc::new(MemoryStore::new()),
            builtin: None,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("options", &self.options)
            .field("parameters", &self.parameters)
            .field("auto_connect_using_previous", &self.auto_connect_using_previous)
            .field("networks", &self.networks)
            .field("default_rpc", &self.default_rpc)
            .field("account_data", &self.account_data.is_some())
            .field("observers", &self.observers.is_some())
            .field("dev_network", &self.dev_network)
            .field("provider", &self.provider)
            .field("polling", &self.polling)
            .field("request_timeout", &self.request_timeout)
            .field("auto_start_timeout", &self.auto_start_timeout)
            .field("builtin", &self.builtin.is_some())
            .finish_non_exhaustive()
    }
}

impl ConnectionConfig {
    /// An empty list falls back to `[Builtin]`.
    pub fn with_options(mut self, options: Vec<WalletOption>) -> Self {
        self.options = if options.is_empty() {
            vec![WalletOption::Builtin]
        } else {
            options
        };
        self
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect_using_previous = enabled;
        self
    }

    pub fn with_networks(mut self, networks: impl Into<NetworkSource>) -> Self {
        self.networks = Some(networks.into());
        self
    }

    pub fn with_default_rpc(mut self, chain_id: u64, url: Url) -> Self {
        self.default_rpc = Some(DefaultRpc { chain_id, url });
        self
    }

    pub fn with_account_data(mut self, loader: Arc<dyn AccountDataLoader>) -> Self {
        self.account_data = Some(loader);
        self
    }

    pub fn with_observers(mut self, observers: Arc<dyn ProviderObserver>) -> Self {
        self.observers = Some(observers);
        self
    }

    pub fn with_dev_network(mut self, dev_network: DevNetwork) -> Self {
        self.dev_network = Some(dev_network);
        self
    }

    pub fn with_provider_config(mut self, provider: WrapConfig) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_auto_start_timeout(mut self, timeout: Duration) -> Self {
        self.auto_start_timeout = timeout;
        self
    }

    pub fn with_diagnostics_interval(mut self, interval: Duration) -> Self {
        self.diagnostics_interval = interval;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_builtin(mut self, provider: Arc<dyn Eip1193Provider>) -> Self {
        self.builtin = Some(provider);
        self
    }

    /// Ids of the wallet options, in order.
    pub fn option_ids(&self) -> Vec<String> {
        self.options.iter().map(|o| o.id().to_string()).collect()
    }
}

/// Durations as (possibly fractional) seconds.
mod secs {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.option_ids(), vec!["builtin".to_string()]);
        assert!(config.auto_connect_using_previous);
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.polling.interval, Duration::from_secs(3));
        assert_eq!(config.parameters.default.finality, 12);
        assert_eq!(config.parameters.default.block_time, Duration::from_secs(5));
    }

    #[test]
    fn test_parameters_from_json() {
        let parameters: Parameters = serde_json::from_value(json!({
            "finality": 3,
            "blockTime": 0.5,
            "chains": { "0x7a69": { "finality": 1, "blockTime": 1 } }
        }))
        .unwrap();
        assert_eq!(parameters.default.block_time, Duration::from_millis(500));
        assert_eq!(parameters.default.timeout, Duration::from_secs(30));
        assert_eq!(parameters.for_chain(Some(31337)).finality, 1);
        assert_eq!(parameters.for_chain(Some(1)).finality, 3);
        assert_eq!(parameters.for_chain(None).finality, 3);
    }

    #[test]
    fn test_polling_from_json() {
        let polling: PollingConfig =
            serde_json::from_value(json!({ "interval": 1, "maxBackoff": 10 })).unwrap();
        assert_eq!(polling.interval, Duration::from_secs(1));
        assert_eq!(polling.jitter, Duration::ZERO);
        assert_eq!(polling.max_backoff, Duration::from_secs(10));
    }

    #[test]
    fn test_add_chain_params_shape() {
        let params = AddChainParams {
            chain_name: Some("Dev".into()),
            rpc_urls: vec!["http://localhost:8545".into()],
            native_currency: Some(NativeCurrency {
                name: "Ether".into(),
                symbol: "ETH".into(),
                decimals: 18,
            }),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({
                "chainName": "Dev",
                "rpcUrls": ["http://localhost:8545"],
                "nativeCurrency": { "name": "Ether", "symbol": "ETH", "decimals": 18 }
            })
        );
    }

    #[test]
    fn test_empty_options_fall_back_to_builtin() {
        let config = ConnectionConfig::default().with_options(vec![]);
        assert_eq!(config.option_ids(), vec!["builtin".to_string()]);
    }
}
