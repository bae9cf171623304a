use std::collections::HashMap;
use std::time::Duration;

use crate::clock::duration_ms;

/// Default values for every tunable of the queue.
pub mod constants {
    use std::time::Duration;

    pub const PARTITION_LEASE_DURATION: Duration = Duration::from_secs(4);
    pub const PARTITION_REQUEUE_EXTENSION: Duration = Duration::from_secs(30);
    /// Must stay above [`PARTITION_LOOKAHEAD`].
    pub const PARTITION_CONCURRENCY_LIMIT_REQUEUE_EXTENSION: Duration = Duration::from_secs(5);
    pub const PARTITION_THROTTLE_LIMIT_REQUEUE_EXTENSION: Duration = Duration::from_secs(1);
    pub const PARTITION_PAUSED_REQUEUE_EXTENSION: Duration = Duration::from_secs(5 * 60);
    pub const PARTITION_LOOKAHEAD: Duration = Duration::from_secs(1);
    pub const PARTITION_SELECTION_MAX: i64 = 100;
    pub const PARTITION_PEEK_MAX: i64 = 300;
    pub const ACCOUNT_PEEK_MAX: i64 = 30;

    pub const SHADOW_PARTITION_LEASE_DURATION: Duration = Duration::from_secs(4);
    pub const SHADOW_PARTITION_LOOKAHEAD: Duration = Duration::from_secs(2);
    pub const SHADOW_PARTITION_PEEK_MAX_BACKLOGS: i64 = 100;
    pub const SHADOW_PARTITION_ACCOUNT_PEEK_MAX: i64 = 30;
    pub const SHADOW_PARTITION_REFILL_PAUSED_REQUEUE_EXTENSION: Duration =
        Duration::from_secs(24 * 60 * 60);
    pub const BACKLOG_NORMALIZE_LEASE_DURATION: Duration = Duration::from_secs(4);
    pub const BACKLOG_DEFAULT_REQUEUE_EXTENSION: Duration = Duration::from_secs(2);
    pub const BACKLOG_REFILL_HARD_LIMIT: i64 = 1000;
    pub const NORMALIZE_ACCOUNT_PEEK_MAX: i64 = 30;

    pub const DEFAULT_QUEUE_PEEK_MIN: i64 = 300;
    pub const DEFAULT_QUEUE_PEEK_MAX: i64 = 750;
    /// The store's script engine cannot unpack more than 8000 values at once.
    pub const ABSOLUTE_QUEUE_PEEK_MAX: i64 = 5000;
    pub const QUEUE_PEEK_CURR_MULTIPLIER: i64 = 4;
    pub const QUEUE_PEEK_EWMA_LEN: usize = 10;

    pub const QUEUE_LEASE_DURATION: Duration = Duration::from_secs(30);
    pub const QUEUE_LEASE_MAX: Duration = Duration::from_secs(30);
    pub const CONFIG_LEASE_DURATION: Duration = Duration::from_secs(10);
    pub const CONFIG_LEASE_MAX: Duration = Duration::from_secs(20);

    pub const SCAVENGE_PEEK_SIZE: i64 = 100;
    pub const SCAVENGE_CONCURRENCY_QUEUE_PEEK_SIZE: i64 = 100;

    /// Lower numbers run first.
    pub const PRIORITY_MAX: u8 = 0;
    pub const PRIORITY_DEFAULT: u8 = 5;
    pub const PRIORITY_MIN: u8 = 9;

    pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(12 * 60 * 60);
    pub const DEFAULT_CONCURRENCY: i64 = 1000;
    pub const NO_CONCURRENCY_LIMIT: i64 = -1;

    pub const DEFAULT_POLL_TICK: Duration = Duration::from_millis(10);
    pub const DEFAULT_SHADOW_POLL_TICK: Duration = Duration::from_millis(100);
    pub const DEFAULT_BACKLOG_NORMALIZE_POLL_TICK: Duration = Duration::from_millis(250);
    pub const DEFAULT_ACTIVE_CHECK_TICK: Duration = Duration::from_secs(10);

    pub const DEFAULT_NUM_WORKERS: usize = 100;
    pub const DEFAULT_NUM_SHADOW_WORKERS: usize = 100;
    pub const DEFAULT_NUM_BACKLOG_NORMALIZATION_WORKERS: usize = 10;

    pub const MAX_FUNCTION_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
    pub const CAPACITY_LEASE_MARGIN: Duration = Duration::from_secs(60);
    /// A capacity lease is only trusted when it outlives now by this much.
    pub const CAPACITY_LEASE_VALIDITY_BUFFER: Duration = Duration::from_secs(2);

    pub const CONTINUATION_LIMIT: u32 = 5;
    pub const CONTINUATION_COOLDOWN: Duration = Duration::from_secs(10);

    pub const RUN_JOBS_MAX: i64 = 1000;
}

/// Configuration for a queue instance
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Name of the shard this queue instance serves
    pub primary_shard: String,
    /// Namespace wrapped around every key, e.g. `queue` produces `{queue}:...`
    pub key_prefix: String,

    pub partition_lease_duration: Duration,
    pub partition_requeue_extension: Duration,
    pub partition_concurrency_limit_requeue_extension: Duration,
    pub partition_throttle_limit_requeue_extension: Duration,
    pub partition_paused_requeue_extension: Duration,
    /// Items due within this window are leased when a partition is processed
    pub partition_lookahead: Duration,

    pub shadow_partition_lease_duration: Duration,
    /// Items due within this window are refilled right away
    pub shadow_partition_lookahead: Duration,
    pub backlog_normalize_lease_duration: Duration,
    pub backlog_refill_limit: i64,

    /// Lower bound of a peek batch
    pub peek_min: i64,
    /// Upper bound of a peek batch, never above the absolute maximum
    pub peek_max: i64,
    pub peek_curr_multiplier: i64,
    pub peek_ewma_len: usize,

    pub queue_lease_duration: Duration,
    pub config_lease_duration: Duration,
    pub config_lease_max: Duration,

    pub scavenge_peek_size: i64,
    pub scavenge_concurrency_queue_peek_size: i64,

    /// TTL for idempotency tokens when the item has no explicit period
    pub idempotency_ttl: Duration,
    /// Fallback used for unset account and function concurrency
    pub default_concurrency: i64,

    pub poll_tick: Duration,
    pub shadow_poll_tick: Duration,
    pub backlog_normalize_poll_tick: Duration,
    pub active_check_tick: Duration,

    /// Size of the partition worker semaphore
    pub num_workers: usize,
    pub num_shadow_workers: usize,
    pub num_backlog_normalization_workers: usize,

    pub max_function_timeout: Duration,
    pub capacity_lease_margin: Duration,

    pub continuation_limit: u32,
    pub continuation_cooldown: Duration,

    /// Key queues for system queues, which have no account to ask
    pub allow_system_key_queues: bool,
    /// Exact queue names, or prefixes when ending in `*`. Empty allows all.
    pub allow_queues: Vec<String>,
    pub deny_queues: Vec<String>,
    /// Maps an item kind to a system queue name, bypassing the function partition
    pub queue_kind_mapping: HashMap<String, String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        use constants::*;

        Self {
            primary_shard: "default".to_string(),
            key_prefix: "queue".to_string(),
            partition_lease_duration: PARTITION_LEASE_DURATION,
            partition_requeue_extension: PARTITION_REQUEUE_EXTENSION,
            partition_concurrency_limit_requeue_extension:
                PARTITION_CONCURRENCY_LIMIT_REQUEUE_EXTENSION,
            partition_throttle_limit_requeue_extension: PARTITION_THROTTLE_LIMIT_REQUEUE_EXTENSION,
            partition_paused_requeue_extension: PARTITION_PAUSED_REQUEUE_EXTENSION,
            partition_lookahead: PARTITION_LOOKAHEAD,
            shadow_partition_lease_duration: SHADOW_PARTITION_LEASE_DURATION,
            shadow_partition_lookahead: SHADOW_PARTITION_LOOKAHEAD,
            backlog_normalize_lease_duration: BACKLOG_NORMALIZE_LEASE_DURATION,
            backlog_refill_limit: BACKLOG_REFILL_HARD_LIMIT,
            peek_min: DEFAULT_QUEUE_PEEK_MIN,
            peek_max: DEFAULT_QUEUE_PEEK_MAX,
            peek_curr_multiplier: QUEUE_PEEK_CURR_MULTIPLIER,
            peek_ewma_len: QUEUE_PEEK_EWMA_LEN,
            queue_lease_duration: QUEUE_LEASE_DURATION,
            config_lease_duration: CONFIG_LEASE_DURATION,
            config_lease_max: CONFIG_LEASE_MAX,
            scavenge_peek_size: SCAVENGE_PEEK_SIZE,
            scavenge_concurrency_queue_peek_size: SCAVENGE_CONCURRENCY_QUEUE_PEEK_SIZE,
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            default_concurrency: DEFAULT_CONCURRENCY,
            poll_tick: DEFAULT_POLL_TICK,
            shadow_poll_tick: DEFAULT_SHADOW_POLL_TICK,
            backlog_normalize_poll_tick: DEFAULT_BACKLOG_NORMALIZE_POLL_TICK,
            active_check_tick: DEFAULT_ACTIVE_CHECK_TICK,
            num_workers: DEFAULT_NUM_WORKERS,
            num_shadow_workers: DEFAULT_NUM_SHADOW_WORKERS,
            num_backlog_normalization_workers: DEFAULT_NUM_BACKLOG_NORMALIZATION_WORKERS,
            max_function_timeout: MAX_FUNCTION_TIMEOUT,
            capacity_lease_margin: CAPACITY_LEASE_MARGIN,
            continuation_limit: CONTINUATION_LIMIT,
            continuation_cooldown: CONTINUATION_COOLDOWN,
            allow_system_key_queues: false,
            allow_queues: Vec::new(),
            deny_queues: Vec::new(),
            queue_kind_mapping: HashMap::new(),
        }
    }
}

impl QueueConfig {
    pub fn with_primary_shard(mut self, shard: impl Into<String>) -> Self {
        self.primary_shard = shard.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the peek batch range. Both ends are clamped to
    /// [`constants::ABSOLUTE_QUEUE_PEEK_MAX`] and `min` never exceeds `max`.
    pub fn with_peek_size_range(mut self, min: i64, max: i64) -> Self {
        let max = max.clamp(1, constants::ABSOLUTE_QUEUE_PEEK_MAX);
        self.peek_max = max;
        self.peek_min = min.clamp(1, max);
        self
    }

    pub fn with_peek_ewma_len(mut self, len: usize) -> Self {
        self.peek_ewma_len = len.max(1);
        self
    }

    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    pub fn with_default_concurrency(mut self, limit: i64) -> Self {
        self.default_concurrency = limit;
        self
    }

    pub fn with_num_workers(mut self, workers: usize) -> Self {
        self.num_workers = workers.max(1);
        self
    }

    pub fn with_backlog_refill_limit(mut self, limit: i64) -> Self {
        self.backlog_refill_limit = limit.clamp(1, constants::BACKLOG_REFILL_HARD_LIMIT);
        self
    }

    pub fn with_system_key_queues(mut self, enabled: bool) -> Self {
        self.allow_system_key_queues = enabled;
        self
    }

    pub fn with_allow_queues(mut self, queues: Vec<String>) -> Self {
        self.allow_queues = queues;
        self
    }

    pub fn with_deny_queues(mut self, queues: Vec<String>) -> Self {
        self.deny_queues = queues;
        self
    }

    pub fn with_queue_kind_mapping(mut self, kind: impl Into<String>, queue: impl Into<String>) -> Self {
        self.queue_kind_mapping.insert(kind.into(), queue.into());
        self
    }

    pub fn with_continuation_limit(mut self, limit: u32) -> Self {
        self.continuation_limit = limit;
        self
    }

    /// TTL written next to a capacity-manager lease idempotency key.
    pub(crate) fn capacity_lease_ttl_ms(&self) -> i64 {
        duration_ms(self.max_function_timeout) + duration_ms(self.capacity_lease_margin)
    }

    /// Whether a partition name passes the allow and deny lists.
    pub fn is_queue_allowed(&self, name: &str) -> bool {
        if check_list(name, &self.deny_queues) {
            return false;
        }
        self.allow_queues.is_empty() || check_list(name, &self.allow_queues)
    }
}

/// Exact match, or prefix match for entries ending in `*`.
fn check_list(name: &str, list: &[String]) -> bool {
    list.iter().any(|entry| match entry.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => entry == name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_peek_range() {
        let config = QueueConfig::default();
        assert_eq!(config.peek_min, 300);
        assert_eq!(config.peek_max, 750);
        assert!(
            config.partition_concurrency_limit_requeue_extension > config.partition_lookahead
        );
    }

    #[test]
    fn test_peek_range_is_clamped_to_absolute_max() {
        let config = QueueConfig::default().with_peek_size_range(9_000, 10_000);
        assert_eq!(config.peek_max, constants::ABSOLUTE_QUEUE_PEEK_MAX);
        assert_eq!(config.peek_min, constants::ABSOLUTE_QUEUE_PEEK_MAX);
    }

    #[test]
    fn test_allow_and_deny_lists() {
        let config = QueueConfig::default()
            .with_allow_queues(vec!["pause-*".to_string(), "debounce".to_string()])
            .with_deny_queues(vec!["pause-blocked".to_string()]);

        assert!(config.is_queue_allowed("pause-events"));
        assert!(config.is_queue_allowed("debounce"));
        assert!(!config.is_queue_allowed("pause-blocked"));
        assert!(!config.is_queue_allowed("debounce-2"));
    }

    #[test]
    fn test_empty_allow_list_allows_everything_not_denied() {
        let config = QueueConfig::default().with_deny_queues(vec!["fn-*".to_string()]);
        assert!(config.is_queue_allowed("anything"));
        assert!(!config.is_queue_allowed("fn-1"));
    }
}
