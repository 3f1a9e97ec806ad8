//! # Chain Descriptor
//!
//! Metadata describing what a chain exposes: storage items that can be
//! queried, calls that can be submitted, events it emits and constants.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Queryable/callable surface of one chain.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainDescriptor {
    /// Descriptor key networks refer to.
    #[serde(default)]
    pub key: String,
    /// Runtime spec version the descriptor was generated from.
    #[serde(default)]
    pub spec_version: u32,
    /// Pallets (sections) of the runtime.
    #[serde(default)]
    pub pallets: Vec<PalletDescriptor>,
}

/// One pallet (section) of the runtime.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PalletDescriptor {
    /// Section name, e.g. `System`.
    pub name: String,
    /// Storage item names.
    #[serde(default)]
    pub storage: Vec<String>,
    /// Call names.
    #[serde(default)]
    pub calls: Vec<String>,
    /// Event names.
    #[serde(default)]
    pub events: Vec<String>,
    /// Constant values.
    #[serde(default)]
    pub constants: BTreeMap<String, serde_json::Value>,
}

impl ChainDescriptor {
    /// Create an empty descriptor.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    /// Add a pallet.
    pub fn with_pallet(mut self, pallet: PalletDescriptor) -> Self {
        self.pallets.push(pallet);
        self
    }

    /// Look up a pallet by section name.
    pub fn pallet(&self, section: &str) -> Option<&PalletDescriptor> {
        self.pallets.iter().find(|p| p.name == section)
    }

    /// Whether `section.item` is a storage item.
    pub fn has_storage(&self, section: &str, item: &str) -> bool {
        self.pallet(section)
            .is_some_and(|p| p.storage.iter().any(|s| s == item))
    }

    /// Whether `section.call` is a call.
    pub fn has_call(&self, section: &str, call: &str) -> bool {
        self.pallet(section)
            .is_some_and(|p| p.calls.iter().any(|c| c == call))
    }

    /// Whether `section.method` is an event.
    pub fn has_event(&self, section: &str, method: &str) -> bool {
        self.pallet(section)
            .is_some_and(|p| p.events.iter().any(|e| e == method))
    }

    /// Value of `section.name` constant.
    pub fn constant(&self, section: &str, name: &str) -> Option<&serde_json::Value> {
        self.pallet(section).and_then(|p| p.constants.get(name))
    }
}

impl PalletDescriptor {
    /// Create an empty pallet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add storage items.
    pub fn storage<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.storage.extend(items.into_iter().map(Into::into));
        self
    }

    /// Add calls.
    pub fn calls<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.calls.extend(items.into_iter().map(Into::into));
        self
    }

    /// Add events.
    pub fn events<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events.extend(items.into_iter().map(Into::into));
        self
    }

    /// Add a constant.
    pub fn constant(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.constants.insert(name.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor() -> ChainDescriptor {
        ChainDescriptor::new("dev").with_pallet(
            PalletDescriptor::new("System")
                .storage(["Account", "Number"])
                .calls(["remark"])
                .events(["ExtrinsicSuccess"])
                .constant("SS58Prefix", json!(42)),
        )
    }

    #[test]
    fn test_lookups() {
        let d = descriptor();
        assert!(d.has_storage("System", "Account"));
        assert!(!d.has_storage("System", "Nope"));
        assert!(!d.has_storage("Balances", "Account"));
        assert!(d.has_call("System", "remark"));
        assert!(d.has_event("System", "ExtrinsicSuccess"));
        assert_eq!(d.constant("System", "SS58Prefix"), Some(&json!(42)));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let d: ChainDescriptor = serde_json::from_value(json!({
            "key": "dev",
            "pallets": [{ "name": "Balances", "storage": ["TotalIssuance"] }]
        }))
        .unwrap();
        assert_eq!(d.spec_version, 0);
        assert!(d.has_storage("Balances", "TotalIssuance"));
        assert!(d.pallet("Balances").unwrap().calls.is_empty());
    }
}
