//! # Event Domain Types
//!
//! Chain events, their typed payloads and logical subscriptions.
//!
//! Payloads are a tagged union keyed by `(section, method)`. Known kinds are
//! decoded into fixed shapes when the event is constructed; anything else is
//! kept as [`EventPayload::Other`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::cache::Timestamp;
use super::errors::{RuntimeError, RuntimeResult};

/// Default bound of the event log.
pub const DEFAULT_MAX_EVENTS: usize = 100;

/// Token amount. Nodes encode large balances as strings, small ones as
/// numbers; both are accepted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(pub u128);

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Amount(u128::from(n))),
            Raw::Text(s) => {
                let digits = s.trim();
                let parsed = match digits.strip_prefix("0x") {
                    Some(hex) => u128::from_str_radix(hex, 16),
                    None => digits.parse::<u128>(),
                };
                parsed.map(Amount).map_err(serde::de::Error::custom)
            }
        }
    }
}

/// Dispatch outcome metadata attached to extrinsic events.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatchInfo {
    /// Weight consumed (shape varies by runtime version).
    pub weight: serde_json::Value,
    /// Dispatch class (`Normal`, `Operational`, `Mandatory`).
    pub class: Option<String>,
    /// Whether fees were paid (`Yes` / `No`).
    pub pays_fee: Option<String>,
}

/// `System.ExtrinsicFailed` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtrinsicFailed {
    /// Module or generic dispatch error.
    pub dispatch_error: serde_json::Value,
    /// Dispatch metadata.
    #[serde(default)]
    pub dispatch_info: DispatchInfo,
}

/// Account lifecycle payload (`NewAccount`, `KilledAccount`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEvent {
    /// Account address.
    pub account: String,
}

/// `Balances.Transfer` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Sender.
    pub from: String,
    /// Recipient.
    pub to: String,
    /// Amount moved.
    pub amount: Amount,
}

/// `Balances.Deposit` / `Balances.Withdraw` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    /// Affected account.
    pub who: String,
    /// Amount credited or debited.
    pub amount: Amount,
}

/// Typed event payload keyed by `(section, method)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum EventPayload {
    /// `System.ExtrinsicSuccess`
    ExtrinsicSuccess(DispatchInfo),
    /// `System.ExtrinsicFailed`
    ExtrinsicFailed(ExtrinsicFailed),
    /// `System.NewAccount`
    NewAccount(AccountEvent),
    /// `System.KilledAccount`
    KilledAccount(AccountEvent),
    /// `Balances.Transfer`
    Transfer(Transfer),
    /// `Balances.Deposit`
    Deposit(BalanceChange),
    /// `Balances.Withdraw`
    Withdraw(BalanceChange),
    /// Any kind without a known shape.
    Other {
        /// Section (pallet) name
        section: String,
        /// Method (event variant) name
        method: String,
        /// Raw payload
        data: serde_json::Value,
    },
}

impl EventPayload {
    /// Decode `data` into the shape registered for `(section, method)`.
    pub fn decode(section: &str, method: &str, data: serde_json::Value) -> RuntimeResult<Self> {
        let invalid = |e: serde_json::Error| RuntimeError::InvalidEvent {
            section: section.to_string(),
            method: method.to_string(),
            reason: e.to_string(),
        };

        let payload = match (section, method) {
            ("System", "ExtrinsicSuccess") => {
                Self::ExtrinsicSuccess(serde_json::from_value(data).map_err(invalid)?)
            }
            ("System", "ExtrinsicFailed") => {
                Self::ExtrinsicFailed(serde_json::from_value(data).map_err(invalid)?)
            }
            ("System", "NewAccount") => {
                Self::NewAccount(serde_json::from_value(data).map_err(invalid)?)
            }
            ("System", "KilledAccount") => {
                Self::KilledAccount(serde_json::from_value(data).map_err(invalid)?)
            }
            ("Balances", "Transfer") => {
                Self::Transfer(serde_json::from_value(data).map_err(invalid)?)
            }
            ("Balances", "Deposit") => {
                Self::Deposit(serde_json::from_value(data).map_err(invalid)?)
            }
            ("Balances", "Withdraw") => {
                Self::Withdraw(serde_json::from_value(data).map_err(invalid)?)
            }
            _ => Self::Other {
                section: section.to_string(),
                method: method.to_string(),
                data,
            },
        };

        Ok(payload)
    }

    /// Section (pallet) of this payload.
    pub fn section(&self) -> &str {
        match self {
            Self::ExtrinsicSuccess(_)
            | Self::ExtrinsicFailed(_)
            | Self::NewAccount(_)
            | Self::KilledAccount(_) => "System",
            Self::Transfer(_) | Self::Deposit(_) | Self::Withdraw(_) => "Balances",
            Self::Other { section, .. } => section,
        }
    }

    /// Method (event variant) of this payload.
    pub fn method(&self) -> &str {
        match self {
            Self::ExtrinsicSuccess(_) => "ExtrinsicSuccess",
            Self::ExtrinsicFailed(_) => "ExtrinsicFailed",
            Self::NewAccount(_) => "NewAccount",
            Self::KilledAccount(_) => "KilledAccount",
            Self::Transfer(_) => "Transfer",
            Self::Deposit(_) => "Deposit",
            Self::Withdraw(_) => "Withdraw",
            Self::Other { method, .. } => method,
        }
    }
}

/// Event record as delivered by the node, before typing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    /// Section (pallet) name.
    pub section: String,
    /// Method (event variant) name.
    pub method: String,
    /// Payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Hash of the block that emitted the event.
    #[serde(default)]
    pub block_hash: Option<String>,
    /// Number of the block that emitted the event.
    #[serde(default)]
    pub block_number: Option<u64>,
    /// Position of the event within its block.
    #[serde(default)]
    pub index: u32,
}

/// Immutable chain event stored in the event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEvent {
    /// Unique id, `<block>-<index>`.
    pub id: String,
    /// Typed payload.
    pub payload: EventPayload,
    /// Arrival time at the runtime.
    pub timestamp: Timestamp,
    /// Emitting block hash.
    pub block_hash: Option<String>,
    /// Emitting block number.
    pub block_number: Option<u64>,
}

impl ChainEvent {
    /// Type a raw event, validating its payload.
    pub fn from_raw(raw: RawEvent, now: Timestamp) -> RuntimeResult<Self> {
        let payload = EventPayload::decode(&raw.section, &raw.method, raw.data)?;
        let id = match raw.block_number {
            Some(number) => format!("{number}-{}", raw.index),
            None => format!("t{now}-{}", raw.index),
        };

        Ok(Self {
            id,
            payload,
            timestamp: now,
            block_hash: raw.block_hash,
            block_number: raw.block_number,
        })
    }

    /// Section (pallet) of the event.
    pub fn section(&self) -> &str {
        self.payload.section()
    }

    /// Method of the event.
    pub fn method(&self) -> &str {
        self.payload.method()
    }
}

/// Logical interest in one `(section, method)` stream.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Subscription id, conventionally `section:method`.
    pub id: String,
    /// Section watched.
    pub section: String,
    /// Method watched.
    pub method: String,
    /// Whether the subscription is live.
    pub active: bool,
    /// Most recent matching event.
    pub last_event: Option<ChainEvent>,
    /// Failure reported by the underlying stream.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: Timestamp,
}

impl Subscription {
    /// Conventional id for `(section, method)`.
    pub fn key_for(section: &str, method: &str) -> String {
        format!("{section}:{method}")
    }

    /// Whether `event` belongs to this subscription's stream.
    pub fn matches(&self, event: &ChainEvent) -> bool {
        self.section == event.section() && self.method == event.method()
    }
}

/// Optional section/method filter for reading the event log.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventFilter {
    /// Section to match, any when unset.
    pub section: Option<String>,
    /// Method to match, any when unset.
    pub method: Option<String>,
}

impl EventFilter {
    /// Match everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match one section.
    pub fn section(section: impl Into<String>) -> Self {
        Self {
            section: Some(section.into()),
            method: None,
        }
    }

    /// Match one `(section, method)` kind.
    pub fn kind(section: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            section: Some(section.into()),
            method: Some(method.into()),
        }
    }

    /// Narrow to one method.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Whether `event` passes the filter.
    pub fn matches(&self, event: &ChainEvent) -> bool {
        self.section.as_deref().is_none_or(|s| s == event.section())
            && self.method.as_deref().is_none_or(|m| m == event.method())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(section: &str, method: &str, data: serde_json::Value) -> RawEvent {
        RawEvent {
            section: section.into(),
            method: method.into(),
            data,
            block_hash: Some("0xabc".into()),
            block_number: Some(42),
            index: 3,
        }
    }

    #[test]
    fn test_decode_transfer() {
        let event = ChainEvent::from_raw(
            raw(
                "Balances",
                "Transfer",
                json!({ "from": "alice", "to": "bob", "amount": "1000000000000000000000" }),
            ),
            7,
        )
        .unwrap();

        assert_eq!(event.id, "42-3");
        assert_eq!(event.section(), "Balances");
        assert_eq!(event.method(), "Transfer");
        match event.payload {
            EventPayload::Transfer(t) => assert_eq!(t.amount, Amount(1_000_000_000_000_000_000_000)),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_amount_accepts_numbers_and_hex() {
        let a: Amount = serde_json::from_value(json!(12)).unwrap();
        let b: Amount = serde_json::from_value(json!("0x10")).unwrap();
        assert_eq!(a, Amount(12));
        assert_eq!(b, Amount(16));
        assert_eq!(serde_json::to_value(b).unwrap(), json!("16"));
    }

    #[test]
    fn test_malformed_known_kind_rejected() {
        let err = ChainEvent::from_raw(raw("Balances", "Transfer", json!({ "from": 1 })), 0)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidEvent { .. }));
    }

    #[test]
    fn test_unknown_kind_is_other() {
        let event =
            ChainEvent::from_raw(raw("Staking", "Rewarded", json!([1, 2])), 0).unwrap();
        assert_eq!(event.section(), "Staking");
        assert_eq!(event.method(), "Rewarded");
        assert!(matches!(event.payload, EventPayload::Other { .. }));
    }

    #[test]
    fn test_extrinsic_success_defaults() {
        let event =
            ChainEvent::from_raw(raw("System", "ExtrinsicSuccess", json!({})), 0).unwrap();
        assert!(matches!(event.payload, EventPayload::ExtrinsicSuccess(_)));
    }

    #[test]
    fn test_id_without_block_number() {
        let mut r = raw("System", "ExtrinsicSuccess", json!({}));
        r.block_number = None;
        let event = ChainEvent::from_raw(r, 99).unwrap();
        assert_eq!(event.id, "t99-3");
    }

    #[test]
    fn test_filter() {
        let event =
            ChainEvent::from_raw(raw("System", "ExtrinsicSuccess", json!({})), 0).unwrap();
        assert!(EventFilter::all().matches(&event));
        assert!(EventFilter::section("System").matches(&event));
        assert!(EventFilter::kind("System", "ExtrinsicSuccess").matches(&event));
        assert!(!EventFilter::kind("System", "ExtrinsicFailed").matches(&event));
        assert!(!EventFilter::section("Balances").matches(&event));
        assert!(EventFilter::default().with_method("ExtrinsicSuccess").matches(&event));
    }

    #[test]
    fn test_subscription_key() {
        assert_eq!(
            Subscription::key_for("System", "ExtrinsicSuccess"),
            "System:ExtrinsicSuccess"
        );
    }
}
