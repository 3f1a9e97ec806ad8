//! # Network Description
//!
//! Immutable value describing one chain network the runtime can connect to.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

use super::errors::{RuntimeError, RuntimeResult};

/// URL schemes accepted for node endpoints.
pub const SUPPORTED_SCHEMES: [&str; 4] = ["ws", "wss", "http", "https"];

/// One selectable network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Display name, also used in logs.
    pub name: String,
    /// Node RPC endpoint.
    pub endpoint: String,
    /// Key of the chain descriptor describing this network's surface.
    pub descriptor_key: String,
    /// Free-form extra attributes (token symbol, explorer url, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl NetworkConfig {
    /// Create a network description.
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        descriptor_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            descriptor_key: descriptor_key.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach an extra attribute.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check the description is usable and return the parsed endpoint.
    pub fn validate(&self) -> RuntimeResult<Url> {
        if self.name.trim().is_empty() {
            return Err(RuntimeError::Config("network name cannot be empty".into()));
        }
        if self.descriptor_key.trim().is_empty() {
            return Err(RuntimeError::Config(format!(
                "network '{}' has no descriptor key",
                self.name
            )));
        }

        let url = Url::parse(&self.endpoint).map_err(|e| {
            RuntimeError::Config(format!(
                "network '{}' endpoint '{}' is not a URL: {e}",
                self.name, self.endpoint
            ))
        })?;

        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(RuntimeError::Config(format!(
                "network '{}' endpoint scheme '{}' is not supported",
                self.name,
                url.scheme()
            )));
        }

        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_network() {
        let network = NetworkConfig::new("polkadot", "wss://rpc.polkadot.io", "dot");
        let url = network.validate().unwrap();
        assert_eq!(url.scheme(), "wss");
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let network = NetworkConfig::new("broken", "not a url", "dot");
        assert!(matches!(network.validate(), Err(RuntimeError::Config(_))));
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let network = NetworkConfig::new("ftp", "ftp://node.example", "dot");
        let err = network.validate().unwrap_err();
        assert!(err.to_string().contains("ftp"));
    }

    #[test]
    fn test_rejects_empty_descriptor_key() {
        let network = NetworkConfig::new("local", "ws://127.0.0.1:9944", " ");
        assert!(network.validate().is_err());
    }

    #[test]
    fn test_serde_camel_case() {
        let network = NetworkConfig::new("local", "ws://127.0.0.1:9944", "dev")
            .with_metadata("symbol", "UNIT");
        let json = serde_json::to_value(&network).unwrap();
        assert_eq!(json["descriptorKey"], "dev");
        assert_eq!(json["metadata"]["symbol"], "UNIT");

        let back: NetworkConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, network);
    }
}
