//! Interfaces the host implements to feed tenant state into the queue.
//!
//! Each synchronous collaborator is also implemented for plain closures, so
//! hosts can write `Arc::new(|p: &QueuePartition| 3)`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::config::constants::PRIORITY_DEFAULT;
use crate::constraints::CustomKeyLimit;
use crate::error::QueueResult;
use crate::types::{PartitionConstraintConfig, QueueItem, QueuePartition, Throttle};

pub trait PartitionPriorityFinder: Send + Sync {
    /// Priority in `[0, 9]`, lower runs first.
    fn priority(&self, partition: &QueuePartition) -> u8;
}

impl<F> PartitionPriorityFinder for F
where
    F: Fn(&QueuePartition) -> u8 + Send + Sync,
{
    fn priority(&self, partition: &QueuePartition) -> u8 {
        self(partition)
    }
}

pub trait AccountPriorityFinder: Send + Sync {
    fn priority(&self, account_id: Uuid) -> u8;
}

impl<F> AccountPriorityFinder for F
where
    F: Fn(Uuid) -> u8 + Send + Sync,
{
    fn priority(&self, account_id: Uuid) -> u8 {
        self(account_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PausedInfo {
    pub paused: bool,
    /// The answer came from a cache that may be out of date
    pub stale: bool,
}

pub trait PartitionPausedGetter: Send + Sync {
    fn paused(&self, function_id: Uuid) -> PausedInfo;
}

impl<F> PartitionPausedGetter for F
where
    F: Fn(Uuid) -> PausedInfo + Send + Sync,
{
    fn paused(&self, function_id: Uuid) -> PausedInfo {
        self(function_id)
    }
}

pub trait PartitionConstraintConfigGetter: Send + Sync {
    fn constraints(&self, partition_id: &str) -> PartitionConstraintConfig;
}

impl<F> PartitionConstraintConfigGetter for F
where
    F: Fn(&str) -> PartitionConstraintConfig + Send + Sync,
{
    fn constraints(&self, partition_id: &str) -> PartitionConstraintConfig {
        self(partition_id)
    }
}

pub trait AllowKeyQueues: Send + Sync {
    fn allow(&self, account_id: Uuid) -> bool;
}

impl<F> AllowKeyQueues for F
where
    F: Fn(Uuid) -> bool + Send + Sync,
{
    fn allow(&self, account_id: Uuid) -> bool {
        self(account_id)
    }
}

pub trait DisableLeaseChecks: Send + Sync {
    fn disable(&self, account_id: Uuid) -> bool;
}

impl<F> DisableLeaseChecks for F
where
    F: Fn(Uuid) -> bool + Send + Sync,
{
    fn disable(&self, account_id: Uuid) -> bool {
        self(account_id)
    }
}

pub trait ShardSelector: Send + Sync {
    /// Name of the shard serving this account and queue.
    fn select(&self, account_id: Uuid, queue_name: Option<&str>) -> String;
}

impl<F> ShardSelector for F
where
    F: Fn(Uuid, Option<&str>) -> String + Send + Sync,
{
    fn select(&self, account_id: Uuid, queue_name: Option<&str>) -> String {
        self(account_id, queue_name)
    }
}

pub trait CustomConcurrencyLimitRefresher: Send + Sync {
    fn refresh(&self, item: &QueueItem) -> Vec<CustomKeyLimit>;
}

impl<F> CustomConcurrencyLimitRefresher for F
where
    F: Fn(&QueueItem) -> Vec<CustomKeyLimit> + Send + Sync,
{
    fn refresh(&self, item: &QueueItem) -> Vec<CustomKeyLimit> {
        self(item)
    }
}

/// Per-item idempotency window. `None` falls back to the item's own period
/// and then to the configured default.
pub trait IdempotencyTtl: Send + Sync {
    fn ttl(&self, item: &QueueItem) -> Option<Duration>;
}

impl<F> IdempotencyTtl for F
where
    F: Fn(&QueueItem) -> Option<Duration> + Send + Sync,
{
    fn ttl(&self, item: &QueueItem) -> Option<Duration> {
        self(item)
    }
}

/// Rebuilds the throttle of an item enqueued before key expression hashes
/// were recorded. Returns [`crate::QueueError::EventNotFound`] when the
/// triggering event is gone.
#[async_trait]
pub trait RefreshItemThrottle: Send + Sync {
    async fn refresh(&self, item: &QueueItem) -> QueueResult<Option<Throttle>>;
}

/// Keeps whatever throttle the item already has.
pub struct KeepItemThrottle;

#[async_trait]
impl RefreshItemThrottle for KeepItemThrottle {
    async fn refresh(&self, item: &QueueItem) -> QueueResult<Option<Throttle>> {
        Ok(item.data.throttle.clone())
    }
}

pub trait QueueLifecycleListener: Send + Sync {
    fn on_fn_concurrency_limit_reached(&self, _function_id: Uuid) {}

    fn on_account_concurrency_limit_reached(&self, _account_id: Uuid) {}

    fn on_custom_key_concurrency_limit_reached(&self, _key: &str) {}
}

/// Decides whether an account, env and function go through the capacity
/// manager. Returns `(enable, fallback)`: with `fallback` the queue's own
/// checks run when the manager fails.
pub trait UseConstraintApi: Send + Sync {
    fn use_constraint_api(&self, account_id: Uuid, env_id: Uuid, function_id: Uuid) -> (bool, bool);
}

impl<F> UseConstraintApi for F
where
    F: Fn(Uuid, Uuid, Uuid) -> (bool, bool) + Send + Sync,
{
    fn use_constraint_api(&self, account_id: Uuid, env_id: Uuid, function_id: Uuid) -> (bool, bool) {
        self(account_id, env_id, function_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySource {
    pub service: String,
    pub location: String,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityAcquireRequest {
    pub account_id: Uuid,
    pub env_id: Uuid,
    pub function_id: Uuid,
    /// `<backlog or partition id>-<now ms>`
    pub idempotency_key: String,
    pub duration: Duration,
    pub amount: usize,
    /// One key per item, the item ids
    pub lease_idempotency_keys: Vec<String>,
    pub maximum_lifetime: Duration,
    pub source: CapacitySource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityGrant {
    pub idempotency_key: String,
    pub lease_id: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapacityAcquireResponse {
    pub leases: Vec<CapacityGrant>,
    /// When the caller should try again for the rest
    pub retry_after_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityCheckRequest {
    pub account_id: Uuid,
    pub env_id: Uuid,
    pub function_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapacityCheckResponse {
    pub available: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityExtendLeaseRequest {
    pub account_id: Uuid,
    pub idempotency_key: String,
    pub lease_id: Ulid,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityReleaseRequest {
    pub account_id: Uuid,
    pub idempotency_key: String,
    pub lease_id: Ulid,
}

/// External capacity reservation service.
#[async_trait]
pub trait CapacityManager: Send + Sync {
    async fn acquire(&self, req: CapacityAcquireRequest) -> QueueResult<CapacityAcquireResponse>;

    async fn check(&self, req: CapacityCheckRequest) -> QueueResult<CapacityCheckResponse>;

    /// Returns the renewed lease, or `None` when the lease is gone.
    async fn extend_lease(&self, req: CapacityExtendLeaseRequest) -> QueueResult<Option<Ulid>>;

    async fn release(&self, req: CapacityReleaseRequest) -> QueueResult<()>;
}

pub(crate) struct DefaultPriority;

impl PartitionPriorityFinder for DefaultPriority {
    fn priority(&self, _partition: &QueuePartition) -> u8 {
        PRIORITY_DEFAULT
    }
}

impl AccountPriorityFinder for DefaultPriority {
    fn priority(&self, _account_id: Uuid) -> u8 {
        PRIORITY_DEFAULT
    }
}

pub(crate) struct NeverPaused;

impl PartitionPausedGetter for NeverPaused {
    fn paused(&self, _function_id: Uuid) -> PausedInfo {
        PausedInfo::default()
    }
}

pub(crate) struct NoConstraints;

impl PartitionConstraintConfigGetter for NoConstraints {
    fn constraints(&self, _partition_id: &str) -> PartitionConstraintConfig {
        PartitionConstraintConfig::default()
    }
}

/// Answers a fixed value for every account.
pub(crate) struct Fixed(pub bool);

impl AllowKeyQueues for Fixed {
    fn allow(&self, _account_id: Uuid) -> bool {
        self.0
    }
}

impl DisableLeaseChecks for Fixed {
    fn disable(&self, _account_id: Uuid) -> bool {
        self.0
    }
}

pub(crate) struct NoopListener;

impl QueueLifecycleListener for NoopListener {}

pub(crate) struct NeverUseConstraintApi;

impl UseConstraintApi for NeverUseConstraintApi {
    fn use_constraint_api(&self, _: Uuid, _: Uuid, _: Uuid) -> (bool, bool) {
        (false, false)
    }
}
