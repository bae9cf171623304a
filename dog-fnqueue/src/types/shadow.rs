use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::types::constraints::PartitionConstraintConfig;
use crate::types::ids::is_lease_valid;
use crate::types::item::{ConcurrencyScope, QueueItem};

/// Candidate-side twin of a partition. Shares the partition's id and owns
/// the backlogs that feed its ready set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueShadowPartition {
    pub partition_id: String,
    #[serde(default)]
    pub function_version: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_queue_name: Option<String>,
    #[serde(default)]
    pub system_concurrency: i64,
    #[serde(default)]
    pub account_concurrency: i64,
    #[serde(default)]
    pub function_concurrency: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_concurrency_keys: Vec<ShadowCustomConcurrencyKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ShadowThrottle>,
    #[serde(default)]
    pub pause_refill: bool,
    #[serde(default)]
    pub pause_enqueue: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowCustomConcurrencyKey {
    pub scope: ConcurrencyScope,
    /// Function, env or account the key is scoped to
    pub entity_id: Uuid,
    pub hashed_key_expression: String,
    pub concurrency_limit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowThrottle {
    pub key_expression_hash: String,
    pub limit: i64,
    #[serde(default)]
    pub burst: i64,
    pub period: i64,
}

impl QueueShadowPartition {
    /// Shadow partition of an item's partition under the given constraints.
    pub fn for_item(item: &QueueItem, constraints: &PartitionConstraintConfig) -> Self {
        let ident = &item.data.identifier;
        let concurrency = &constraints.concurrency;

        let custom_concurrency_keys = concurrency
            .custom_concurrency_keys
            .iter()
            .map(|k| ShadowCustomConcurrencyKey {
                scope: k.scope,
                entity_id: match k.scope {
                    ConcurrencyScope::Function => ident.fn_id,
                    ConcurrencyScope::Env => ident.env_id,
                    ConcurrencyScope::Account => ident.account_id,
                },
                hashed_key_expression: k.hashed_key_expression.clone(),
                concurrency_limit: k.limit,
            })
            .collect();

        let throttle = constraints.throttle.as_ref().map(|t| ShadowThrottle {
            key_expression_hash: t.throttle_key_expression_hash.clone(),
            limit: t.limit,
            burst: t.burst,
            period: t.period,
        });

        let system = item.is_system();
        Self {
            partition_id: item.partition_id(),
            function_version: constraints.function_version,
            function_id: (!system).then_some(item.function_id),
            env_id: (!system).then_some(ident.env_id),
            account_id: (!system).then_some(ident.account_id),
            system_queue_name: item.queue_name.clone(),
            system_concurrency: concurrency.system_concurrency,
            account_concurrency: concurrency.account_concurrency,
            function_concurrency: concurrency.function_concurrency,
            custom_concurrency_keys,
            throttle,
            pause_refill: false,
            pause_enqueue: false,
            lease_id: None,
        }
    }

    pub fn is_system(&self) -> bool {
        self.system_queue_name.is_some()
    }

    pub fn is_leased(&self, now_ms: i64) -> bool {
        self.lease_id
            .as_ref()
            .is_some_and(|lease| is_lease_valid(lease, now_ms))
    }

    pub fn has_custom_key(&self, scope: ConcurrencyScope, hashed_key_expression: &str) -> bool {
        self.custom_concurrency_keys
            .iter()
            .any(|k| k.scope == scope && k.hashed_key_expression == hashed_key_expression)
    }
}
