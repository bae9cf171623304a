//! One worker pass over due partitions and shadow partitions.
//!
//! The processor leases a partition, peeks a batch sized from the
//! function's recent contention, leases as many items as the constraints
//! allow and puts the partition back. Leased items are handed to the
//! caller; running them is the caller's job.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, instrument, trace, warn};
use ulid::Ulid;

use crate::clock::duration_ms;
use crate::collaborators::{
    CapacityAcquireRequest, CapacityCheckRequest, CapacityManager, CapacitySource,
};
use crate::config::constants::{
    PARTITION_PEEK_MAX, SHADOW_PARTITION_PEEK_MAX_BACKLOGS,
    SHADOW_PARTITION_REFILL_PAUSED_REQUEUE_EXTENSION,
};
use crate::deny::LeaseDenies;
use crate::error::{QueueError, QueueResult};
use crate::queue::{LeaseOptions, Queue, RefillConstraint};
use crate::store::Store;
use crate::types::{CapacityLease, NormalizeReason, QueueItem, QueuePartition, QueueShadowPartition};

/// An item this worker now holds a lease on.
#[derive(Debug, Clone)]
pub struct LeasedItem {
    pub item: QueueItem,
    pub lease_id: Ulid,
}

/// What one shadow partition pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShadowPass {
    pub backlogs: usize,
    pub refilled: usize,
    /// Backlogs sent to normalization
    pub normalizing: usize,
    /// Backlogs pushed back because a constraint was hit
    pub constrained: usize,
}

#[derive(Debug, Default)]
struct BatchOutcome {
    leased: Vec<LeasedItem>,
    constrained: i64,
    concurrency_hit: bool,
    throttle_hit: bool,
}

impl<S: Store> Queue<S> {
    /// Leases a batch of items from one partition.
    ///
    /// `continuation_count` is how many times in a row this partition was
    /// picked up as a continuation, 0 for a regular scan.
    #[instrument(skip(self, p), fields(partition = %p.id))]
    pub async fn process_partition(
        &self,
        p: &QueuePartition,
        continuation_count: u32,
    ) -> QueueResult<Vec<LeasedItem>> {
        let now = self.now_ms();

        let lease = match self
            .partition_lease(p, self.config().partition_lease_duration)
            .await
        {
            Ok(lease) => lease,
            Err(err) if err.is_concurrency_limit() => {
                debug!("Partition {} at capacity: {}", p.id, err);
                self.notify_limit(p, &err);
                let at = now + duration_ms(self.config().partition_concurrency_limit_requeue_extension);
                self.requeue_partition(p, at, true).await?;
                return Ok(Vec::new());
            }
            Err(QueueError::PartitionPaused) => {
                self.continuations().remove(&p.id, false, now);
                let at = now + duration_ms(self.config().partition_paused_requeue_extension);
                self.requeue_partition(p, at, true).await?;
                return Ok(Vec::new());
            }
            Err(QueueError::PartitionAlreadyLeased | QueueError::PartitionNotFound) => {
                trace!("Partition {} taken or gone", p.id);
                self.continuations().remove(&p.id, false, now);
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        let mut limit = match p.function_id {
            Some(fn_id) => self.peek_size_for(fn_id).await?,
            None => self.config().peek_min,
        };
        let capacity = match self.capacity_manager_for_partition(p) {
            Some(manager) => self.external_capacity(manager, p).await,
            None => lease.capacity,
        };
        if let Some(capacity) = capacity {
            limit = limit.min(capacity.max(1));
        }
        let until = now + duration_ms(self.config().partition_lookahead);
        let items = self.peek(p, until, limit).await?;

        let batch = self.lease_batch(p, items).await?;

        if let Some(fn_id) = p.function_id {
            self.set_peek_ewma(fn_id, batch.constrained).await?;
        }

        let now = self.now_ms();
        if batch.concurrency_hit {
            let at = now + duration_ms(self.config().partition_concurrency_limit_requeue_extension);
            self.requeue_partition(p, at, true).await?;
        } else if batch.throttle_hit {
            let at = now + duration_ms(self.config().partition_throttle_limit_requeue_extension);
            self.requeue_partition(p, at, true).await?;
        } else {
            let at = now + duration_ms(self.config().partition_requeue_extension);
            self.requeue_partition(p, at, false).await?;
        }

        if !batch.leased.is_empty() && batch.constrained == 0 {
            self.continuations().add(p, continuation_count + 1, now);
        } else {
            self.continuations().remove(&p.id, false, now);
        }

        debug!(
            leased = batch.leased.len(),
            constrained = batch.constrained,
            "processed partition"
        );
        Ok(batch.leased)
    }

    /// Capacity the manager reports for a partition. Items it tracks never
    /// reach the local in-progress sets, so their count would be wrong.
    async fn external_capacity(&self, manager: &Arc<dyn CapacityManager>, p: &QueuePartition) -> Option<i64> {
        let (function_id, env_id) = (p.function_id?, p.env_id?);
        let request = CapacityCheckRequest {
            account_id: p.account_id,
            env_id,
            function_id,
        };
        match manager.check(request).await {
            Ok(resp) => Some(resp.available),
            Err(err) => {
                warn!("Capacity check failed for partition {}: {}", p.id, err);
                None
            }
        }
    }

    async fn requeue_partition(&self, p: &QueuePartition, at_ms: i64, force: bool) -> QueueResult<()> {
        match self.partition_requeue(p, at_ms, force).await {
            Ok(()) => Ok(()),
            Err(QueueError::PartitionGarbageCollected | QueueError::PartitionNotFound) => {
                self.continuations().remove(&p.id, false, self.now_ms());
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn notify_limit(&self, p: &QueuePartition, err: &QueueError) {
        let listener = self.listener();
        match err {
            QueueError::AccountConcurrencyLimit { .. } => {
                listener.on_account_concurrency_limit_reached(p.account_id)
            }
            QueueError::ConcurrencyLimitCustomKey { key, .. } => {
                listener.on_custom_key_concurrency_limit_reached(key)
            }
            _ => {
                if let Some(fn_id) = p.function_id {
                    listener.on_fn_concurrency_limit_reached(fn_id);
                }
            }
        }
    }

    /// Leases each peeked item in order, sharing one deny cache.
    async fn lease_batch(&self, p: &QueuePartition, items: Vec<QueueItem>) -> QueueResult<BatchOutcome> {
        let denies = LeaseDenies::new();
        let duration = self.config().queue_lease_duration;
        let mut outcome = BatchOutcome::default();

        for item in items {
            let opts = match self.capacity_lease_options(&item, &denies).await? {
                Some(opts) => opts,
                None => {
                    outcome.constrained += 1;
                    outcome.concurrency_hit = true;
                    continue;
                }
            };

            let capacity_lease = opts.capacity_lease;
            match self.lease(&item, duration, opts).await {
                Ok(lease_id) => {
                    let mut item = item;
                    item.lease_id = Some(lease_id);
                    item.capacity_lease = capacity_lease;
                    outcome.leased.push(LeasedItem { item, lease_id });
                }
                Err(err) if err.is_concurrency_limit() => {
                    outcome.constrained += 1;
                    outcome.concurrency_hit = true;
                    self.notify_limit(p, &err);
                }
                Err(err) if err.is_throttled() => {
                    outcome.constrained += 1;
                    outcome.throttle_hit = true;
                }
                Err(QueueError::ItemAlreadyLeased | QueueError::ItemNotFound) => {}
                Err(err) => warn!("Error leasing item {}: {}", item.id, err),
            }
        }
        Ok(outcome)
    }

    /// Lease options for one item. Accounts routed through the capacity
    /// manager reserve capacity there first; `None` means no capacity was
    /// granted and the item should be skipped.
    async fn capacity_lease_options<'a>(
        &self,
        item: &QueueItem,
        denies: &'a LeaseDenies,
    ) -> QueueResult<Option<LeaseOptions<'a>>> {
        let Some((manager, fallback)) = self.capacity_manager_for(item) else {
            return Ok(Some(LeaseOptions {
                denies: Some(denies),
                ..Default::default()
            }));
        };

        let ident = &item.data.identifier;
        let idempotency_key = item.id.clone();
        let request = CapacityAcquireRequest {
            account_id: ident.account_id,
            env_id: ident.env_id,
            function_id: item.function_id,
            idempotency_key: format!("{}-{}", item.partition_id(), self.now_ms()),
            duration: self.config().queue_lease_duration,
            amount: 1,
            lease_idempotency_keys: vec![idempotency_key.clone()],
            maximum_lifetime: self.config().max_function_timeout + self.config().capacity_lease_margin,
            source: CapacitySource {
                service: "queue".to_string(),
                location: "process_partition".to_string(),
                mode: "item_lease".to_string(),
            },
        };

        match manager.acquire(request).await {
            Ok(resp) => match resp.leases.first() {
                Some(grant) => Ok(Some(LeaseOptions {
                    denies: Some(denies),
                    disable_constraint_checks: true,
                    fallback_idempotency_key: Some(grant.idempotency_key.clone()),
                    capacity_lease: Some(CapacityLease {
                        lease_id: grant.lease_id,
                    }),
                })),
                None => {
                    trace!(item_id = %item.id, retry_after_ms = ?resp.retry_after_ms, "no capacity granted");
                    Ok(None)
                }
            },
            Err(err) if fallback => {
                warn!("Capacity manager failed for item {}, checking constraints locally: {}", item.id, err);
                Ok(Some(LeaseOptions {
                    denies: Some(denies),
                    fallback_idempotency_key: Some(idempotency_key),
                    ..Default::default()
                }))
            }
            Err(err) => Err(err),
        }
    }

    /// Processes continuations and then every partition due now, at most
    /// `num_workers` at a time. Per-partition failures are logged and
    /// skipped.
    pub async fn scan_partitions(&self, sequential: bool) -> QueueResult<Vec<LeasedItem>> {
        let now = self.now_ms();
        let until = now + duration_ms(self.config().partition_lookahead);

        let mut work: Vec<(QueuePartition, u32)> = self
            .continuations()
            .snapshot()
            .into_iter()
            .map(|c| (c.partition, c.count))
            .collect();
        for p in self.partition_peek(sequential, until, PARTITION_PEEK_MAX).await? {
            if !work.iter().any(|(w, _)| w.id == p.id) {
                work.push((p, 0));
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config().num_workers.max(1)));
        let mut handles = Vec::with_capacity(work.len());
        for (p, count) in work {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| QueueError::Internal("Failed to acquire scan permit".to_string()))?;
            let queue = self.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let result = queue.process_partition(&p, count).await;
                (p.id, result)
            }));
        }

        let mut leased = Vec::new();
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok((_, Ok(items))) => leased.extend(items),
                Ok((id, Err(err))) => warn!("Error processing partition {}: {}", id, err),
                Err(err) => warn!("Partition task failed: {}", err),
            }
        }
        Ok(leased)
    }

    /// Refills the due backlogs of one shadow partition.
    ///
    /// Backlogs built for an older constraint configuration are sent to
    /// normalization instead of being refilled.
    #[instrument(skip(self, sp), fields(partition = %sp.partition_id))]
    pub async fn process_shadow_partition(&self, sp: &QueueShadowPartition) -> QueueResult<ShadowPass> {
        let now = self.now_ms();
        let lease_id = match self
            .shadow_partition_lease(sp, self.config().shadow_partition_lease_duration)
            .await
        {
            Ok(lease) => lease,
            Err(QueueError::ShadowPartitionAlreadyLeased | QueueError::ShadowPartitionNotFound) => {
                return Ok(ShadowPass::default())
            }
            Err(err) => return Err(err),
        };

        if sp.pause_refill {
            let at = now + duration_ms(SHADOW_PARTITION_REFILL_PAUSED_REQUEUE_EXTENSION);
            self.shadow_partition_requeue(sp, lease_id, Some(at)).await?;
            return Ok(ShadowPass::default());
        }

        let constraints = self.partition_constraints(&sp.partition_id);
        let until = now + duration_ms(self.config().shadow_partition_lookahead);
        let peeked = self
            .shadow_partition_peek(sp, false, until, SHADOW_PARTITION_PEEK_MAX_BACKLOGS)
            .await?;

        let mut pass = ShadowPass {
            backlogs: peeked.backlogs.len(),
            ..Default::default()
        };
        for backlog in &peeked.backlogs {
            let reason = backlog.is_outdated(&constraints);
            if reason != NormalizeReason::Unchanged {
                debug!(backlog = %backlog.backlog_id, reason = reason.as_str(), "backlog outdated");
                match self.backlog_prepare_normalize(backlog, sp).await {
                    Ok(()) => pass.normalizing += 1,
                    Err(QueueError::BacklogGarbageCollected) => {}
                    Err(err) => return Err(err),
                }
                continue;
            }

            let refill = self.backlog_refill(backlog, sp, until).await?;
            pass.refilled += refill.refilled;
            if refill.constraint != RefillConstraint::None {
                pass.constrained += 1;
                let at = backlog.requeue_backoff(self.now_ms(), refill.retry_at_ms);
                match self.backlog_requeue(backlog, sp, at).await {
                    Ok(()) | Err(QueueError::BacklogNotFound) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        match self.shadow_partition_requeue(sp, lease_id, None).await {
            Ok(()) | Err(QueueError::ShadowPartitionNotFound) => {}
            Err(err) => return Err(err),
        }
        Ok(pass)
    }

    /// Moves items of every backlog of `sp` waiting for normalization into
    /// their current backlogs. Returns how many items moved.
    pub async fn normalize_shadow_partition(&self, sp: &QueueShadowPartition, limit: i64) -> QueueResult<usize> {
        let backlogs = self
            .shadow_partition_peek_normalize_backlogs(sp, i64::MAX, SHADOW_PARTITION_PEEK_MAX_BACKLOGS)
            .await?;
        let mut moved = 0;
        for backlog in &backlogs {
            moved += self.normalize_backlog(backlog, sp, limit).await?;
        }
        Ok(moved)
    }
}
