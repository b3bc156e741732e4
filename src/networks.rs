//! Per chain contract lookup.
//!
//! A session is configured with either one network, a map of networks keyed
//! by chain id, or an async resolver that produces either for a given chain.
//! A chain is supported when a lookup yields its contracts.

use std::{collections::BTreeMap, sync::Arc};

use alloy::{json_abi::JsonAbi, primitives::Address};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::StateError;

/// Address and ABI of a deployed contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractInfo {
    pub address: Address,
    #[serde(default)]
    pub abi: JsonAbi,
}

/// Contracts by name.
pub type Contracts = BTreeMap<String, ContractInfo>;

/// Contracts deployed on one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    #[serde(deserialize_with = "deserialize_chain_id")]
    pub chain_id: u64,
    #[serde(default)]
    pub name: Option<String>,
    pub contracts: Contracts,
}

/// Static network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworkConfigs {
    /// `{ chains: { "<chainId>": NetworkConfig } }`, keys decimal or hex.
    Multi { chains: BTreeMap<String, NetworkConfig> },
    Single(NetworkConfig),
}

impl NetworkConfigs {
    /// Contracts for `chain_id`, or `None` when the chain is not supported.
    pub fn contracts_for(&self, chain_id: u64) -> Option<&Contracts> {
        match self {
            NetworkConfigs::Single(config) => {
                (config.chain_id == chain_id).then_some(&config.contracts)
            }
            NetworkConfigs::Multi { chains } => chains
                .iter()
                .find(|(key, _)| parse_chain_id(key) == Some(chain_id))
                .map(|(_, config)| &config.contracts),
        }
    }
}

/// Produces the network configuration on demand.
#[cfg_attr(target_family = "wasm", async_trait(?Send))]
#[cfg_attr(not(target_family = "wasm"), async_trait)]
pub trait NetworkResolver: Send + Sync {
    async fn resolve(&self, chain_id: u64) -> Result<NetworkConfigs, StateError>;
}

/// Where the session gets network configuration from.
#[derive(Clone)]
pub enum NetworkSource {
    Static(NetworkConfigs),
    Resolver(Arc<dyn NetworkResolver>),
}

impl std::fmt::Debug for NetworkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkSource::Static(configs) => f.debug_tuple("Static").field(configs).finish(),
            NetworkSource::Resolver(_) => f.write_str("Resolver"),
        }
    }
}

impl From<NetworkConfigs> for NetworkSource {
    fn from(configs: NetworkConfigs) -> Self {
        NetworkSource::Static(configs)
    }
}

// ============================================================================
// Chain id formatting
// ============================================================================

/// Parse a chain id given as `0x` hex or decimal.
pub fn parse_chain_id(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// `0x` hex form used by wallet RPC methods.
pub fn to_hex_chain_id(chain_id: u64) -> String {
    format!("{chain_id:#x}")
}

fn deserialize_chain_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => parse_chain_id(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid chain id {s:?}"))),
    }
}
