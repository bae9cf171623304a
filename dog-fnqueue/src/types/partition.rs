use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::config::constants::PRIORITY_DEFAULT;
use crate::types::ids::is_lease_valid;
use crate::types::item::QueueItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
    #[default]
    Default,
    ConcurrencyKey,
}

/// The ready set of one function, or of one named system queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePartition {
    pub id: String,
    #[serde(default)]
    pub partition_type: PartitionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_id: Option<Uuid>,
    #[serde(default)]
    pub account_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    /// Function (or system) concurrency last seen for this partition
    #[serde(default)]
    pub concurrency_limit: i64,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<Ulid>,
    /// Last time the partition was leased for scanning
    #[serde(default)]
    pub last_leased_ms: i64,
    /// Pushed-forward time; the partition is not peeked before it
    #[serde(default)]
    pub force_at_ms: i64,
}

fn default_priority() -> u8 {
    PRIORITY_DEFAULT
}

impl QueuePartition {
    /// The default partition an item is enqueued to.
    pub fn for_item(item: &QueueItem) -> Self {
        let ident = &item.data.identifier;
        match &item.queue_name {
            Some(name) => Self {
                id: name.clone(),
                partition_type: PartitionType::Default,
                function_id: None,
                env_id: None,
                account_id: ident.account_id,
                queue_name: Some(name.clone()),
                concurrency_limit: 0,
                priority: PRIORITY_DEFAULT,
                lease_id: None,
                last_leased_ms: 0,
                force_at_ms: 0,
            },
            None => Self {
                id: item.function_id.to_string(),
                partition_type: PartitionType::Default,
                function_id: Some(item.function_id),
                env_id: Some(ident.env_id),
                account_id: ident.account_id,
                queue_name: None,
                concurrency_limit: 0,
                priority: PRIORITY_DEFAULT,
                lease_id: None,
                last_leased_ms: 0,
                force_at_ms: 0,
            },
        }
    }

    pub fn is_system(&self) -> bool {
        self.queue_name.is_some()
    }

    pub fn is_leased(&self, now_ms: i64) -> bool {
        self.lease_id
            .as_ref()
            .is_some_and(|lease| is_lease_valid(lease, now_ms))
    }

    /// Whether a forced requeue still holds the partition back at `until`.
    pub fn is_forced_after(&self, until_ms: i64) -> bool {
        self.force_at_ms > until_ms
    }

    /// Name matched against allow and deny lists.
    pub fn queue_name_or_id(&self) -> &str {
        self.queue_name.as_deref().unwrap_or(&self.id)
    }
}

/// Per-function flags kept next to the partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FnMetadata {
    #[serde(rename = "id")]
    pub function_id: Uuid,
    /// Paused functions are not leased
    #[serde(default)]
    pub off: bool,
}
