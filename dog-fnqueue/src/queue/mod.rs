//! The queue: typed operations over the atomic scripts.
//!
//! [`Queue`] owns the store handle, the key generator, the configuration and
//! every collaborator the host plugs in. Each public operation builds the
//! keys and arguments for one script, runs it atomically and maps the
//! script's result code to a [`QueueResult`].

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::clock::{duration_ms, Clock, SystemClock};
use crate::collaborators::{
    AccountPriorityFinder, AllowKeyQueues, CapacityManager, CustomConcurrencyLimitRefresher,
    DefaultPriority, DisableLeaseChecks, Fixed, IdempotencyTtl, KeepItemThrottle, NeverPaused,
    NeverUseConstraintApi, NoConstraints, NoopListener, PartitionConstraintConfigGetter,
    PartitionPausedGetter, PartitionPriorityFinder, QueueLifecycleListener, RefreshItemThrottle,
    ShardSelector, UseConstraintApi,
};
use crate::config::QueueConfig;
use crate::constraints::ResolvedConstraints;
use crate::continuations::Continuations;
use crate::error::{QueueError, QueueResult};
use crate::keys::KeyGenerator;
use crate::observability::QueueMetrics;
use crate::scripts::ItemKeys;
use crate::store::{Store, StoreResult, Txn};
use crate::types::{
    PartitionConstraintConfig, QueueBacklog, QueueItem, QueuePartition, QueueShadowPartition,
};

mod backlogs;
mod config_lease;
mod items;
mod partitions;
mod peek;

pub use backlogs::{BacklogRefill, RefillConstraint, ShadowPartitionPeek};
pub use config_lease::{ConfigLeaseHolder, ConfigLeaseRole};
pub use items::{Enqueued, EnqueueOptions, LeaseOptions};
pub use partitions::PartitionLease;

/// Multi-tenant function queue over a [`Store`].
pub struct Queue<S: Store> {
    store: Arc<S>,
    kg: KeyGenerator,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    partition_priority: Arc<dyn PartitionPriorityFinder>,
    account_priority: Arc<dyn AccountPriorityFinder>,
    paused: Arc<dyn PartitionPausedGetter>,
    constraints: Arc<dyn PartitionConstraintConfigGetter>,
    allow_key_queues: Arc<dyn AllowKeyQueues>,
    disable_lease_checks: Arc<dyn DisableLeaseChecks>,
    shard_selector: Option<Arc<dyn ShardSelector>>,
    custom_limits: Option<Arc<dyn CustomConcurrencyLimitRefresher>>,
    refresh_throttle: Arc<dyn RefreshItemThrottle>,
    idempotency_ttl: Option<Arc<dyn IdempotencyTtl>>,
    listener: Arc<dyn QueueLifecycleListener>,
    use_constraint_api: Arc<dyn UseConstraintApi>,
    capacity_manager: Option<Arc<dyn CapacityManager>>,
    metrics: Arc<QueueMetrics>,
    continuations: Arc<Continuations>,
}

impl<S: Store> Clone for Queue<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            kg: self.kg.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            partition_priority: self.partition_priority.clone(),
            account_priority: self.account_priority.clone(),
            paused: self.paused.clone(),
            constraints: self.constraints.clone(),
            allow_key_queues: self.allow_key_queues.clone(),
            disable_lease_checks: self.disable_lease_checks.clone(),
            shard_selector: self.shard_selector.clone(),
            custom_limits: self.custom_limits.clone(),
            refresh_throttle: self.refresh_throttle.clone(),
            idempotency_ttl: self.idempotency_ttl.clone(),
            listener: self.listener.clone(),
            use_constraint_api: self.use_constraint_api.clone(),
            capacity_manager: self.capacity_manager.clone(),
            metrics: self.metrics.clone(),
            continuations: self.continuations.clone(),
        }
    }
}

impl<S: Store> Queue<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, QueueConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: QueueConfig) -> Self {
        let continuations = Continuations::new(
            config.continuation_limit,
            duration_ms(config.continuation_cooldown),
        );
        Self {
            store,
            kg: KeyGenerator::new(&config.key_prefix),
            config,
            clock: Arc::new(SystemClock),
            partition_priority: Arc::new(DefaultPriority),
            account_priority: Arc::new(DefaultPriority),
            paused: Arc::new(NeverPaused),
            constraints: Arc::new(NoConstraints),
            allow_key_queues: Arc::new(Fixed(false)),
            disable_lease_checks: Arc::new(Fixed(false)),
            shard_selector: None,
            custom_limits: None,
            refresh_throttle: Arc::new(KeepItemThrottle),
            idempotency_ttl: None,
            listener: Arc::new(NoopListener),
            use_constraint_api: Arc::new(NeverUseConstraintApi),
            capacity_manager: None,
            metrics: Arc::new(QueueMetrics::new()),
            continuations: Arc::new(continuations),
        }
    }

    /// Clock used for every "now". The store should share it.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_partition_priority_finder(mut self, finder: Arc<dyn PartitionPriorityFinder>) -> Self {
        self.partition_priority = finder;
        self
    }

    pub fn with_account_priority_finder(mut self, finder: Arc<dyn AccountPriorityFinder>) -> Self {
        self.account_priority = finder;
        self
    }

    pub fn with_partition_paused_getter(mut self, getter: Arc<dyn PartitionPausedGetter>) -> Self {
        self.paused = getter;
        self
    }

    pub fn with_constraint_config_getter(
        mut self,
        getter: Arc<dyn PartitionConstraintConfigGetter>,
    ) -> Self {
        self.constraints = getter;
        self
    }

    pub fn with_allow_key_queues(mut self, allow: Arc<dyn AllowKeyQueues>) -> Self {
        self.allow_key_queues = allow;
        self
    }

    pub fn with_disable_lease_checks(mut self, disable: Arc<dyn DisableLeaseChecks>) -> Self {
        self.disable_lease_checks = disable;
        self
    }

    pub fn with_shard_selector(mut self, selector: Arc<dyn ShardSelector>) -> Self {
        self.shard_selector = Some(selector);
        self
    }

    pub fn with_custom_concurrency_limit_refresher(
        mut self,
        refresher: Arc<dyn CustomConcurrencyLimitRefresher>,
    ) -> Self {
        self.custom_limits = Some(refresher);
        self
    }

    pub fn with_refresh_item_throttle(mut self, refresh: Arc<dyn RefreshItemThrottle>) -> Self {
        self.refresh_throttle = refresh;
        self
    }

    pub fn with_idempotency_ttl_fn(mut self, ttl: Arc<dyn IdempotencyTtl>) -> Self {
        self.idempotency_ttl = Some(ttl);
        self
    }

    pub fn with_lifecycle_listener(mut self, listener: Arc<dyn QueueLifecycleListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Routes leasing through an external capacity manager for the
    /// accounts `use_api` enables.
    pub fn with_capacity_manager(
        mut self,
        manager: Arc<dyn CapacityManager>,
        use_api: Arc<dyn UseConstraintApi>,
    ) -> Self {
        self.capacity_manager = Some(manager);
        self.use_constraint_api = use_api;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn keys(&self) -> &KeyGenerator {
        &self.kg
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    pub fn continuations(&self) -> &Continuations {
        &self.continuations
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub(crate) fn listener(&self) -> &dyn QueueLifecycleListener {
        self.listener.as_ref()
    }

    pub(crate) fn capacity_manager_for(&self, item: &QueueItem) -> Option<(&Arc<dyn CapacityManager>, bool)> {
        let manager = self.capacity_manager.as_ref()?;
        let ident = &item.data.identifier;
        let (enable, fallback) =
            self.use_constraint_api
                .use_constraint_api(ident.account_id, ident.env_id, item.function_id);
        enable.then_some((manager, fallback))
    }

    /// Capacity manager of a function partition. System queues never use one.
    pub(crate) fn capacity_manager_for_partition(
        &self,
        p: &QueuePartition,
    ) -> Option<&Arc<dyn CapacityManager>> {
        let manager = self.capacity_manager.as_ref()?;
        let (function_id, env_id) = (p.function_id?, p.env_id?);
        let (enable, _) = self
            .use_constraint_api
            .use_constraint_api(p.account_id, env_id, function_id);
        enable.then_some(manager)
    }

    pub(crate) async fn run<T, F>(&self, script: &'static str, f: F) -> QueueResult<T>
    where
        F: FnOnce(&mut dyn Txn) -> StoreResult<T> + Send,
        T: Send,
    {
        Ok(self.store.atomic(script, f).await?)
    }

    /// Rejects work owned by another shard.
    pub(crate) fn check_shard(&self, account_id: Uuid, queue_name: Option<&str>) -> QueueResult<()> {
        let Some(selector) = &self.shard_selector else {
            return Ok(());
        };
        let shard = selector.select(account_id, queue_name);
        if shard != self.config.primary_shard {
            debug!(%account_id, shard = %shard, "item belongs to another shard");
            return Err(QueueError::UnknownShard {
                shard,
                primary: self.config.primary_shard.clone(),
            });
        }
        Ok(())
    }

    /// Whether items of this tenant go through backlogs.
    pub(crate) fn key_queues_enabled(&self, item: &QueueItem) -> bool {
        if item.is_system() {
            return self.config.allow_system_key_queues;
        }
        self.allow_key_queues.allow(item.account_id())
    }

    pub(crate) fn partition_constraints(&self, partition_id: &str) -> PartitionConstraintConfig {
        self.constraints.constraints(partition_id)
    }

    pub(crate) fn resolve_constraints(
        &self,
        item: &QueueItem,
        config: &PartitionConstraintConfig,
    ) -> ResolvedConstraints {
        let overrides = self
            .custom_limits
            .as_ref()
            .map(|r| r.refresh(item))
            .unwrap_or_default();
        ResolvedConstraints::resolve(
            &self.kg,
            item,
            config,
            self.config.default_concurrency,
            &overrides,
        )
    }

    /// Default partition of an item, carrying its current concurrency limit.
    pub(crate) fn partition_for(
        &self,
        item: &QueueItem,
    ) -> (QueuePartition, PartitionConstraintConfig) {
        let mut partition = QueuePartition::for_item(item);
        let config = self.partition_constraints(&partition.id);
        partition.concurrency_limit = self.resolve_constraints(item, &config).partition_limit;
        (partition, config)
    }

    /// Backlog and shadow partition of an item when key queues are on.
    pub(crate) fn key_queue_for(
        &self,
        item: &QueueItem,
        config: &PartitionConstraintConfig,
    ) -> Option<(QueueBacklog, QueueShadowPartition)> {
        self.key_queues_enabled(item).then(|| {
            (
                QueueBacklog::for_item(item, config.function_version),
                QueueShadowPartition::for_item(item, config),
            )
        })
    }

    pub(crate) fn item_keys(&self, item: &QueueItem, backlog: Option<&QueueBacklog>) -> ItemKeys {
        ItemKeys::new(&self.kg, item, backlog.map(|b| b.backlog_id.as_str()))
    }
}
