//! Key generator for every index the queue maintains.
//!
//! All keys share one hash-tagged namespace (`{queue}` by default) so that a
//! clustered store places them on the same shard. Scripts never build keys
//! themselves; everything they touch comes from here.

use std::fmt;

use ulid::Ulid;
use uuid::Uuid;

use crate::types::Throttle;

/// Scope of an in-progress or active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyScope {
    Partition,
    Account,
    Custom,
}

impl KeyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Partition => "p",
            Self::Account => "account",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGenerator {
    prefix: String,
}

impl KeyGenerator {
    pub fn new(namespace: &str) -> Self {
        Self {
            prefix: format!("{{{}}}", namespace),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Hash of all queue items, keyed by item id.
    pub fn queue_item(&self) -> String {
        format!("{}:queue:item", self.prefix)
    }

    /// Hash of all partitions, keyed by partition id.
    pub fn partition_item(&self) -> String {
        format!("{}:partition:item", self.prefix)
    }

    /// Ready set of one partition, scored by item time.
    pub fn ready_set(&self, partition_id: &str) -> String {
        format!("{}:queue:sorted:{}", self.prefix, partition_id)
    }

    pub fn global_partition_index(&self) -> String {
        format!("{}:partition:sorted", self.prefix)
    }

    pub fn account_partition_index(&self, account_id: Uuid) -> String {
        format!("{}:accounts:{}:partition:sorted", self.prefix, account_id)
    }

    pub fn global_account_index(&self) -> String {
        format!("{}:accounts:sorted", self.prefix)
    }

    pub fn backlog_set(&self, backlog_id: &str) -> String {
        format!("{}:backlog:sorted:{}", self.prefix, backlog_id)
    }

    pub fn backlog_meta(&self) -> String {
        format!("{}:backlogs", self.prefix)
    }

    /// Backlogs of one shadow partition, scored by their earliest item.
    pub fn shadow_partition_set(&self, partition_id: &str) -> String {
        format!("{}:shadow:sorted:{}", self.prefix, partition_id)
    }

    pub fn shadow_partition_meta(&self) -> String {
        format!("{}:shadows", self.prefix)
    }

    pub fn global_shadow_partition_set(&self) -> String {
        format!("{}:shadow:sorted", self.prefix)
    }

    pub fn global_account_shadow_partitions(&self) -> String {
        format!("{}:accounts:shadows:sorted", self.prefix)
    }

    pub fn account_shadow_partitions(&self, account_id: Uuid) -> String {
        format!("{}:accounts:{}:shadows:sorted", self.prefix, account_id)
    }

    pub fn partition_normalize_set(&self, partition_id: &str) -> String {
        format!("{}:partition-normalize:sorted:{}", self.prefix, partition_id)
    }

    pub fn account_normalize_set(&self, account_id: Uuid) -> String {
        format!("{}:accounts:{}:normalize:sorted", self.prefix, account_id)
    }

    pub fn global_account_normalize_set(&self) -> String {
        format!("{}:accounts:normalize:sorted", self.prefix)
    }

    /// In-progress set of a scope, scored by lease expiry.
    pub fn concurrency(&self, scope: KeyScope, key: &str) -> String {
        if key.is_empty() {
            return format!("{}:-", self.prefix);
        }
        format!("{}:concurrency:{}:{}", self.prefix, scope, key)
    }

    pub fn in_progress_partition(&self, partition_id: &str) -> String {
        self.concurrency(KeyScope::Partition, partition_id)
    }

    pub fn in_progress_account(&self, account_id: Uuid) -> String {
        self.concurrency(KeyScope::Account, &account_id.to_string())
    }

    pub fn in_progress_custom(&self, key: &str) -> String {
        self.concurrency(KeyScope::Custom, key)
    }

    /// Prefix shared by custom key in-progress sets.
    pub fn custom_concurrency_prefix(&self) -> String {
        format!("{}:concurrency:{}:", self.prefix, KeyScope::Custom)
    }

    /// Partition id to earliest lease expiry among its in-progress items.
    pub fn concurrency_index(&self) -> String {
        format!("{}:concurrency:sorted", self.prefix)
    }

    /// Item id to lease expiry for one partition.
    pub fn partition_scavenger_index(&self, partition_id: &str) -> String {
        format!("{}:scavenger:p:{}", self.prefix, partition_id)
    }

    pub fn active_set(&self, scope: KeyScope, key: &str) -> String {
        format!("{}:active:{}:{}", self.prefix, scope, key)
    }

    pub fn active_runs_set(&self, scope: KeyScope, key: &str) -> String {
        format!("{}:active-runs:{}:{}", self.prefix, scope, key)
    }

    pub fn run_active_set(&self, run_id: Ulid) -> String {
        format!("{}:run:{}:active", self.prefix, run_id)
    }

    pub fn throttle_key(&self, throttle: Option<&Throttle>) -> String {
        match throttle {
            Some(t) => format!("{}:throttle:{}", self.prefix, t.key),
            None => format!("{}:throttle:-", self.prefix),
        }
    }

    pub fn idempotency(&self, item_id: &str) -> String {
        format!("{}:queue:seen:{}", self.prefix, item_id)
    }

    /// Marks a lease already granted for an external capacity reservation.
    pub fn lease_idempotency(&self, key: &str) -> String {
        format!("{}:lease-idempotency:{}", self.prefix, key)
    }

    pub fn singleton_run(&self, run_id: Ulid) -> String {
        format!("{}:singleton-run:{}", self.prefix, run_id)
    }

    pub fn singleton_key(&self, key: &str) -> String {
        format!("{}:singleton:{}", self.prefix, key)
    }

    pub fn fn_metadata(&self, function_id: Uuid) -> String {
        format!("{}:fnMeta:{}", self.prefix, function_id)
    }

    pub fn migration_lock(&self, function_id: Uuid) -> String {
        format!("{}:migrate-lock:{}", self.prefix, function_id)
    }

    pub fn config_lease(&self, name: &str) -> String {
        format!("{}:queue:config-lease:{}", self.prefix, name)
    }

    pub fn concurrency_fn_ewma(&self, function_id: Uuid) -> String {
        format!("{}:queue:ewma:{}", self.prefix, function_id)
    }

    /// Item ids of a run, scored by item time.
    pub fn run_index(&self, run_id: Ulid) -> String {
        format!("{}:idx:run:{}", self.prefix, run_id)
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new("queue")
    }
}
