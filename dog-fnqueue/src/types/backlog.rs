use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::duration_ms;
use crate::config::constants::BACKLOG_DEFAULT_REQUEUE_EXTENSION;
use crate::types::constraints::PartitionConstraintConfig;
use crate::types::item::{ConcurrencyScope, QueueItem};
use crate::types::shadow::QueueShadowPartition;

/// A sub-queue of a shadow partition holding items that share the same
/// throttle key and custom concurrency key values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueBacklog {
    pub backlog_id: String,
    pub shadow_partition_id: String,
    #[serde(default)]
    pub earliest_function_version: i32,
    /// Holds function start items
    #[serde(default)]
    pub start: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<BacklogThrottle>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concurrency_keys: Vec<BacklogConcurrencyKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogThrottle {
    pub throttle_key: String,
    #[serde(default)]
    pub throttle_key_raw_value: String,
    #[serde(default)]
    pub throttle_key_expression_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogConcurrencyKey {
    /// Full evaluated key, `<scope>:<scope-id>:<value-hash>`
    pub canonical_key_id: String,
    pub scope: ConcurrencyScope,
    pub entity_id: Uuid,
    pub hashed_key_expression: String,
    pub hashed_value: String,
    #[serde(default)]
    pub unhashed_value: String,
}

/// Why a backlog no longer matches its shadow partition's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NormalizeReason {
    Unchanged,
    ThrottleRemoved,
    ThrottleKeyChanged,
    CustomKeyCountMismatch,
    CustomKeyNotFoundOnShadowPartition,
}

impl NormalizeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::ThrottleRemoved => "throttle_removed",
            Self::ThrottleKeyChanged => "throttle_key_changed",
            Self::CustomKeyCountMismatch => "custom_key_count_mismatch",
            Self::CustomKeyNotFoundOnShadowPartition => "custom_key_not_found_on_shadow_partition",
        }
    }
}

impl QueueBacklog {
    /// The backlog an item belongs to.
    ///
    /// Ids compose the function, whether the items are starts, the throttle
    /// key (starts only) and each custom key value hash.
    pub fn for_item(item: &QueueItem, function_version: i32) -> Self {
        let shadow_partition_id = item.partition_id();

        if let Some(name) = &item.queue_name {
            return Self {
                backlog_id: format!("system:{}", name),
                shadow_partition_id,
                earliest_function_version: function_version,
                start: false,
                throttle: None,
                concurrency_keys: Vec::new(),
            };
        }

        let start = item.is_start();
        let mut backlog_id = format!("fn:{}", item.function_id);
        if start {
            backlog_id.push_str(":start");
        }

        let throttle = match (&item.data.throttle, start) {
            (Some(t), true) => {
                backlog_id.push_str(&format!(":t<{}>", t.key));
                Some(BacklogThrottle {
                    throttle_key: t.key.clone(),
                    throttle_key_raw_value: t.unhashed_throttle_key.clone(),
                    throttle_key_expression_hash: t.key_expression_hash.clone().unwrap_or_default(),
                })
            }
            _ => None,
        };

        let mut concurrency_keys = Vec::new();
        for (i, key) in item.data.custom_concurrency_keys.iter().take(2).enumerate() {
            let (Some(scope), Some(entity_id)) = (key.scope(), key.scope_id()) else {
                continue;
            };
            backlog_id.push_str(&format!(":c{}<{}>", i + 1, key.evaluated_hash()));
            concurrency_keys.push(BacklogConcurrencyKey {
                canonical_key_id: key.key.clone(),
                scope,
                entity_id,
                hashed_key_expression: key.hash.clone(),
                hashed_value: key.evaluated_hash().to_string(),
                unhashed_value: key.unhashed_evaluated_key_value.clone(),
            });
        }

        Self {
            backlog_id,
            shadow_partition_id,
            earliest_function_version: function_version,
            start,
            throttle,
            concurrency_keys,
        }
    }

    /// A backlog without throttle or custom keys.
    pub fn is_default(&self) -> bool {
        self.throttle.is_none() && self.concurrency_keys.is_empty()
    }

    /// Compares the keys this backlog was built with against the current
    /// constraint configuration.
    pub fn is_outdated(&self, constraints: &PartitionConstraintConfig) -> NormalizeReason {
        if self.start {
            match (&self.throttle, &constraints.throttle) {
                (Some(_), None) => return NormalizeReason::ThrottleRemoved,
                (Some(have), Some(want))
                    if have.throttle_key_expression_hash != want.throttle_key_expression_hash =>
                {
                    return NormalizeReason::ThrottleKeyChanged
                }
                _ => {}
            }
        }

        let configured = &constraints.concurrency.custom_concurrency_keys;
        if self.concurrency_keys.len() != configured.len() {
            return NormalizeReason::CustomKeyCountMismatch;
        }

        let missing = self.concurrency_keys.iter().any(|key| {
            !configured
                .iter()
                .any(|c| c.scope == key.scope && c.hashed_key_expression == key.hashed_key_expression)
        });
        if missing {
            return NormalizeReason::CustomKeyNotFoundOnShadowPartition;
        }

        NormalizeReason::Unchanged
    }

    /// When a constrained backlog should be looked at again. Throttled
    /// backlogs wait for the throttle, everything else backs off briefly.
    pub fn requeue_backoff(&self, now_ms: i64, retry_at_ms: i64) -> i64 {
        if self.throttle.is_some() && retry_at_ms > now_ms {
            return retry_at_ms;
        }
        now_ms + duration_ms(BACKLOG_DEFAULT_REQUEUE_EXTENSION)
    }

    /// Custom key limit for the key at `index`, taken from the shadow partition.
    pub fn custom_key_limit(&self, index: usize, sp: &QueueShadowPartition) -> Option<i64> {
        let key = self.concurrency_keys.get(index)?;
        sp.custom_concurrency_keys
            .iter()
            .find(|k| k.scope == key.scope && k.hashed_key_expression == key.hashed_key_expression)
            .map(|k| k.concurrency_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::constraints::ThrottleConstraint;
    use crate::types::ids::hash_id;
    use crate::types::item::{CustomConcurrency, Identifier, Kind, Throttle};
    use ulid::Ulid;

    fn item(kind: Kind) -> QueueItem {
        let ident = Identifier::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Ulid::new());
        QueueItem::new("i1", ident, kind, 0)
    }

    #[test]
    fn test_default_backlog_ids() {
        let edge = item(Kind::Edge);
        let backlog = QueueBacklog::for_item(&edge, 1);
        assert_eq!(backlog.backlog_id, format!("fn:{}", edge.function_id));
        assert!(backlog.is_default());

        let start = item(Kind::Start);
        let backlog = QueueBacklog::for_item(&start, 1);
        assert_eq!(backlog.backlog_id, format!("fn:{}:start", start.function_id));
        assert!(backlog.start);
    }

    #[test]
    fn test_keyed_backlog_id() {
        let mut start = item(Kind::Start).with_throttle(Throttle::new("tk", 1, 0, 60));
        let env = start.data.identifier.env_id;
        start = start.with_custom_concurrency_key(CustomConcurrency::new(
            ConcurrencyScope::Env,
            env,
            "expr",
            "customer-1",
            3,
        ));

        let backlog = QueueBacklog::for_item(&start, 1);
        assert_eq!(
            backlog.backlog_id,
            format!("fn:{}:start:t<tk>:c1<{}>", start.function_id, hash_id("customer-1"))
        );
        assert_eq!(backlog.concurrency_keys.len(), 1);
        assert_eq!(backlog.concurrency_keys[0].entity_id, env);
    }

    #[test]
    fn test_throttle_ignored_for_non_start_items() {
        let edge = item(Kind::Edge).with_throttle(Throttle::new("tk", 1, 0, 60));
        let backlog = QueueBacklog::for_item(&edge, 1);
        assert!(backlog.throttle.is_none());
    }

    #[test]
    fn test_system_backlog() {
        let system = item(Kind::Pause).with_queue_name("pauses");
        let backlog = QueueBacklog::for_item(&system, 0);
        assert_eq!(backlog.backlog_id, "system:pauses");
        assert_eq!(backlog.shadow_partition_id, "pauses");
    }

    #[test]
    fn test_outdated_reasons() {
        let throttled = item(Kind::Start)
            .with_throttle(Throttle::new("tk", 1, 0, 60).with_key_expression_hash("h1"));
        let backlog = QueueBacklog::for_item(&throttled, 1);

        let none = PartitionConstraintConfig::default();
        assert_eq!(backlog.is_outdated(&none), NormalizeReason::ThrottleRemoved);

        let changed = PartitionConstraintConfig::default().with_throttle(ThrottleConstraint {
            limit: 1,
            burst: 0,
            period: 60,
            throttle_key_expression_hash: "h2".to_string(),
        });
        assert_eq!(backlog.is_outdated(&changed), NormalizeReason::ThrottleKeyChanged);

        let same = PartitionConstraintConfig::default().with_throttle(ThrottleConstraint {
            limit: 1,
            burst: 0,
            period: 60,
            throttle_key_expression_hash: "h1".to_string(),
        });
        assert_eq!(backlog.is_outdated(&same), NormalizeReason::Unchanged);

        let keyed = same.clone().with_custom_key(ConcurrencyScope::Env, "expr", 1);
        assert_eq!(backlog.is_outdated(&keyed), NormalizeReason::CustomKeyCountMismatch);
    }

    #[test]
    fn test_outdated_custom_key_not_found() {
        let mut it = item(Kind::Edge);
        let env = it.data.identifier.env_id;
        it = it.with_custom_concurrency_key(CustomConcurrency::new(ConcurrencyScope::Env, env, "old", "v", 1));
        let backlog = QueueBacklog::for_item(&it, 1);

        let config = PartitionConstraintConfig::default().with_custom_key(ConcurrencyScope::Env, "new", 1);
        assert_eq!(
            backlog.is_outdated(&config),
            NormalizeReason::CustomKeyNotFoundOnShadowPartition
        );
    }
}
