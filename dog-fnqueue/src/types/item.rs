use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::config::constants::CAPACITY_LEASE_VALIDITY_BUFFER;
use crate::clock::duration_ms;
use crate::types::ids::{hash_id, is_lease_valid, lease_expiry_ms};

/// The envelope stored in the queue item hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique id within the queue, hashed from the caller's id on enqueue
    pub id: String,
    #[serde(rename = "fn_id")]
    pub function_id: Uuid,
    #[serde(rename = "ws_id")]
    pub workspace_id: Uuid,
    /// Set for items that run on a system queue instead of a function partition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    /// Score of the item: when it becomes available
    pub at_ms: i64,
    /// Wall time the item was meant for, kept across requeues for latency tracking
    pub wall_time_ms: i64,
    #[serde(default)]
    pub enqueued_at_ms: i64,
    /// Backlog the item was last refilled from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refilled_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refilled_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<Ulid>,
    /// Explicit idempotency window, overriding the queue default
    #[serde(
        default,
        rename = "idempotency_period",
        skip_serializing_if = "Option::is_none"
    )]
    pub idempotency_period_ms: Option<i64>,
    /// Capacity reserved by an external capacity manager for this item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_lease: Option<CapacityLease>,
    pub data: Item,
}

/// Routing metadata and payload of a queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub kind: Kind,
    pub identifier: Identifier,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<Throttle>,
    /// At most two custom concurrency keys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_concurrency_keys: Vec<CustomConcurrency>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singleton: Option<Singleton>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    Start,
    Edge,
    EdgeError,
    Sleep,
    Pause,
    Debounce,
    ScheduleBatch,
    Cancel,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Edge => "edge",
            Self::EdgeError => "edge-error",
            Self::Sleep => "sleep",
            Self::Pause => "pause",
            Self::Debounce => "debounce",
            Self::ScheduleBatch => "schedule-batch",
            Self::Cancel => "cancel",
        }
    }
}

/// Tenant and run the item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub account_id: Uuid,
    pub env_id: Uuid,
    pub fn_id: Uuid,
    pub run_id: Ulid,
}

impl Identifier {
    pub fn new(account_id: Uuid, env_id: Uuid, fn_id: Uuid, run_id: Ulid) -> Self {
        Self {
            account_id,
            env_id,
            fn_id,
            run_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throttle {
    /// Hashed throttle key value
    pub key: String,
    pub limit: i64,
    #[serde(default)]
    pub burst: i64,
    /// Period in seconds
    pub period: i64,
    #[serde(default)]
    pub unhashed_throttle_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_expression_hash: Option<String>,
}

impl Throttle {
    pub fn new(key: impl Into<String>, limit: i64, burst: i64, period_secs: i64) -> Self {
        let key = key.into();
        Self {
            unhashed_throttle_key: key.clone(),
            key,
            limit,
            burst,
            period: period_secs,
            key_expression_hash: None,
        }
    }

    pub fn with_key_expression_hash(mut self, hash: impl Into<String>) -> Self {
        self.key_expression_hash = Some(hash.into());
        self
    }
}

/// Scope a custom concurrency key applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyScope {
    Function,
    Env,
    Account,
}

impl ConcurrencyScope {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Function => "f",
            Self::Env => "e",
            Self::Account => "a",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "f" => Some(Self::Function),
            "e" => Some(Self::Env),
            "a" => Some(Self::Account),
            _ => None,
        }
    }
}

/// An evaluated custom concurrency key, `<scope>:<scope-id>:<value-hash>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomConcurrency {
    pub key: String,
    /// Hash of the key expression that produced the value
    pub hash: String,
    pub limit: i64,
    #[serde(default)]
    pub unhashed_evaluated_key_value: String,
}

impl CustomConcurrency {
    pub fn new(
        scope: ConcurrencyScope,
        scope_id: Uuid,
        expression_hash: impl Into<String>,
        evaluated_value: impl Into<String>,
        limit: i64,
    ) -> Self {
        let value = evaluated_value.into();
        Self {
            key: format!("{}:{}:{}", scope.prefix(), scope_id, hash_id(&value)),
            hash: expression_hash.into(),
            limit,
            unhashed_evaluated_key_value: value,
        }
    }

    pub fn scope(&self) -> Option<ConcurrencyScope> {
        self.key
            .split(':')
            .next()
            .and_then(ConcurrencyScope::from_prefix)
    }

    pub fn scope_id(&self) -> Option<Uuid> {
        self.key.split(':').nth(1).and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Hash of the evaluated key value, the last key segment.
    pub fn evaluated_hash(&self) -> &str {
        self.key.rsplit(':').next().unwrap_or(&self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Singleton {
    pub key: String,
}

/// A lease granted by an external capacity manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityLease {
    pub lease_id: Ulid,
}

impl CapacityLease {
    /// Trusted only while it outlives `now` by the validity buffer.
    pub fn is_valid(&self, now_ms: i64) -> bool {
        lease_expiry_ms(&self.lease_id) > now_ms + duration_ms(CAPACITY_LEASE_VALIDITY_BUFFER)
    }
}

impl QueueItem {
    /// Creates an item due at `at_ms` for the function in `identifier`.
    pub fn new(id: impl Into<String>, identifier: Identifier, kind: Kind, at_ms: i64) -> Self {
        Self {
            id: id.into(),
            function_id: identifier.fn_id,
            workspace_id: identifier.env_id,
            queue_name: None,
            at_ms,
            wall_time_ms: at_ms,
            enqueued_at_ms: 0,
            refilled_from: None,
            refilled_at_ms: None,
            lease_id: None,
            idempotency_period_ms: None,
            capacity_lease: None,
            data: Item {
                kind,
                identifier,
                attempt: 0,
                max_attempts: None,
                throttle: None,
                custom_concurrency_keys: Vec::new(),
                singleton: None,
                payload: serde_json::Value::Null,
                queue_name: None,
            },
        }
    }

    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        let name = queue_name.into();
        self.queue_name = Some(name.clone());
        self.data.queue_name = Some(name);
        self
    }

    pub fn with_throttle(mut self, throttle: Throttle) -> Self {
        self.data.throttle = Some(throttle);
        self
    }

    pub fn with_custom_concurrency_key(mut self, key: CustomConcurrency) -> Self {
        self.data.custom_concurrency_keys.push(key);
        self
    }

    pub fn with_singleton(mut self, key: impl Into<String>) -> Self {
        self.data.singleton = Some(Singleton { key: key.into() });
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.data.payload = payload;
        self
    }

    pub fn with_idempotency_period_ms(mut self, period_ms: i64) -> Self {
        self.idempotency_period_ms = Some(period_ms);
        self
    }

    pub fn account_id(&self) -> Uuid {
        self.data.identifier.account_id
    }

    pub fn run_id(&self) -> Ulid {
        self.data.identifier.run_id
    }

    /// System items have a queue name and no function partition.
    pub fn is_system(&self) -> bool {
        self.queue_name.is_some()
    }

    pub fn is_start(&self) -> bool {
        self.data.kind == Kind::Start
    }

    /// Id of the partition the item is enqueued to.
    pub fn partition_id(&self) -> String {
        match &self.queue_name {
            Some(name) => name.clone(),
            None => self.function_id.to_string(),
        }
    }

    pub fn is_leased(&self, now_ms: i64) -> bool {
        self.lease_id
            .as_ref()
            .is_some_and(|lease| is_lease_valid(lease, now_ms))
    }

    pub fn lease_expires_at(&self) -> Option<i64> {
        self.lease_id.as_ref().map(lease_expiry_ms)
    }

    pub fn has_valid_capacity_lease(&self, now_ms: i64) -> bool {
        self.capacity_lease.is_some_and(|l| l.is_valid(now_ms))
    }

    /// How far past its due time the item is, zero when not due yet.
    pub fn expected_delay(&self, now_ms: i64) -> i64 {
        (now_ms - self.at_ms).max(0)
    }

    pub(crate) fn custom_key(&self, index: usize) -> Option<&CustomConcurrency> {
        self.data.custom_concurrency_keys.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ids::new_lease_id;

    fn identifier() -> Identifier {
        Identifier::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Ulid::new())
    }

    #[test]
    fn test_item_json_field_names() {
        let item = QueueItem::new("i1", identifier(), Kind::Start, 1_000);
        let json = serde_json::to_value(&item).unwrap();

        assert!(json.get("fn_id").is_some());
        assert!(json.get("ws_id").is_some());
        assert_eq!(json["data"]["kind"], "start");
        assert!(json.get("lease_id").is_none());

        let back: QueueItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_custom_key_parts() {
        let scope_id = Uuid::new_v4();
        let key = CustomConcurrency::new(ConcurrencyScope::Env, scope_id, "exprhash", "user-1", 2);

        assert_eq!(key.scope(), Some(ConcurrencyScope::Env));
        assert_eq!(key.scope_id(), Some(scope_id));
        assert_eq!(key.evaluated_hash(), hash_id("user-1"));
    }

    #[test]
    fn test_partition_id_prefers_queue_name() {
        let item = QueueItem::new("i1", identifier(), Kind::Edge, 0);
        assert_eq!(item.partition_id(), item.function_id.to_string());
        assert!(!item.is_system());

        let system = item.with_queue_name("pauses");
        assert_eq!(system.partition_id(), "pauses");
        assert!(system.is_system());
    }

    #[test]
    fn test_lease_state() {
        let mut item = QueueItem::new("i1", identifier(), Kind::Edge, 0);
        assert!(!item.is_leased(0));

        item.lease_id = Some(new_lease_id(5_000));
        assert!(item.is_leased(4_999));
        assert!(!item.is_leased(5_000));
        assert_eq!(item.lease_expires_at(), Some(5_000));
    }

    #[test]
    fn test_capacity_lease_needs_buffer() {
        let lease = CapacityLease {
            lease_id: new_lease_id(10_000),
        };
        assert!(lease.is_valid(7_999));
        assert!(!lease.is_valid(8_000));
    }
}
