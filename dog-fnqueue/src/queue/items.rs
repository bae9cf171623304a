use std::time::Duration;

use tracing::{debug, instrument, trace, warn};
use ulid::Ulid;

use super::Queue;
use crate::clock::duration_ms;
use crate::collaborators::{CapacityExtendLeaseRequest, CapacityReleaseRequest};
use crate::config::constants::{QUEUE_LEASE_MAX, RUN_JOBS_MAX};
use crate::constraints::ResolvedConstraints;
use crate::decode::{parallel_decode, DEFAULT_DECODE_CHUNK};
use crate::deny::LeaseDenies;
use crate::error::{QueueError, QueueResult};
use crate::keys::KeyScope;
use crate::scripts::dequeue::{self, DequeueArgs};
use crate::scripts::enqueue::{self, EnqueueArgs, KeyQueueTarget};
use crate::scripts::extend_lease::{self, ExtendLeaseArgs};
use crate::scripts::lease::{self, LeaseArgs, LeaseLimits};
use crate::scripts::requeue::{self, RequeueArgs, RequeueByIdArgs};
use crate::scripts::{decode, in_progress, maintenance, peek, read_field, BacklogKeys};
use crate::store::Store;
use crate::types::{hash_id, new_lease_id, ulid_at, CapacityLease, QueueItem};

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Store the caller's id as is instead of hashing it
    pub passthrough_job_id: bool,
    /// Backlog the item is being moved out of while normalizing
    pub normalize_from_backlog_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Enqueued {
    pub item: QueueItem,
    /// The item is due within the shadow lookahead and should be refilled soon
    pub continuation_hint: bool,
}

#[derive(Debug, Default)]
pub struct LeaseOptions<'a> {
    /// Deny cache of the current peek and lease batch
    pub denies: Option<&'a LeaseDenies>,
    pub disable_constraint_checks: bool,
    /// Idempotency key of an external capacity reservation
    pub fallback_idempotency_key: Option<String>,
    pub capacity_lease: Option<CapacityLease>,
}

fn lease_duration_ms(duration: Duration) -> QueueResult<i64> {
    let ms = duration_ms(duration);
    let max_ms = duration_ms(QUEUE_LEASE_MAX);
    if ms > max_ms {
        return Err(QueueError::LeaseDurationExceedsLimits {
            duration_ms: ms,
            max_ms,
        });
    }
    Ok(ms)
}

/// The first deny cache hit, in check order.
fn denied(c: &ResolvedConstraints, denies: &LeaseDenies) -> Option<QueueError> {
    if let Some(key) = &c.account_key {
        if c.account_limit >= 0 && denies.deny_concurrency(key) {
            return Some(QueueError::AccountConcurrencyLimit { key: key.clone() });
        }
    }
    if c.partition_limit >= 0 && denies.deny_concurrency(&c.partition_key) {
        return Some(partition_limit_error(c));
    }
    for (index, custom) in c.custom.iter().enumerate() {
        if let Some(custom) = custom {
            if custom.limit >= 0 && denies.deny_concurrency(&custom.in_progress_key) {
                return Some(QueueError::ConcurrencyLimitCustomKey {
                    index,
                    key: custom.in_progress_key.clone(),
                });
            }
        }
    }
    match &c.throttle {
        Some(t) if denies.deny_throttle(&t.key) => {
            Some(QueueError::QueueItemThrottled { key: t.key.clone() })
        }
        _ => None,
    }
}

fn partition_limit_error(c: &ResolvedConstraints) -> QueueError {
    let key = c.partition_key.clone();
    if c.is_system {
        QueueError::SystemConcurrencyLimit { key }
    } else {
        QueueError::PartitionConcurrencyLimit { key }
    }
}

fn custom_limit_error(c: &ResolvedConstraints, index: usize) -> QueueError {
    let key = c.custom[index]
        .as_ref()
        .map(|k| k.in_progress_key.clone())
        .unwrap_or_default();
    QueueError::ConcurrencyLimitCustomKey { index, key }
}

impl<S: Store> Queue<S> {
    /// Adds an item due at `at_ms`.
    #[instrument(skip(self, item, opts), fields(fn_id = %item.function_id, kind = item.data.kind.as_str()))]
    pub async fn enqueue(
        &self,
        mut item: QueueItem,
        at_ms: i64,
        opts: EnqueueOptions,
    ) -> QueueResult<Enqueued> {
        let now = self.now_ms();

        if item.id.is_empty() {
            item.id = ulid_at(now).to_string();
        }
        if !opts.passthrough_job_id {
            item.id = hash_id(&item.id);
        }
        if item.queue_name.is_none() {
            if let Some(name) = self.config.queue_kind_mapping.get(item.data.kind.as_str()) {
                item = item.with_queue_name(name.clone());
            }
        }
        self.check_shard(item.account_id(), item.queue_name.as_deref())?;

        item.at_ms = at_ms;
        if item.wall_time_ms == 0 {
            item.wall_time_ms = at_ms;
        }
        item.enqueued_at_ms = now;
        item.lease_id = None;

        let (partition, config) = self.partition_for(&item);
        let key_queue = self.key_queue_for(&item, &config);
        let keys = self.item_keys(&item, key_queue.as_ref().map(|(b, _)| b));
        let account = (!item.is_system()).then(|| item.account_id());
        let normalize_from = opts
            .normalize_from_backlog_id
            .map(|id| BacklogKeys::new(&self.kg, &id, &partition.id, account));

        let args = EnqueueArgs {
            item: &item,
            partition: &partition,
            at: at_ms,
            partition_time: at_ms.max(now),
            now,
            key_queue: key_queue
                .as_ref()
                .map(|(backlog, shadow)| KeyQueueTarget { backlog, shadow }),
            normalize_from: normalize_from.as_ref(),
        };
        let code = self
            .run("enqueue", |tx| enqueue::enqueue(tx, &keys, &args))
            .await?;

        match code {
            enqueue::OK => {}
            enqueue::EXISTS => return Err(QueueError::ItemExists),
            enqueue::SINGLETON_EXISTS => return Err(QueueError::SingletonExists),
            code => return Err(QueueError::UnknownResponse { script: "enqueue", code }),
        }

        self.metrics.increment_enqueued();
        let continuation_hint = key_queue.is_some()
            && at_ms - now < duration_ms(self.config.shadow_partition_lookahead);
        debug!("Enqueued item {} to partition {}", item.id, partition.id);

        Ok(Enqueued {
            item,
            continuation_hint,
        })
    }

    /// Leases an item for `duration`, returning the lease id whose timestamp
    /// is the lease expiry.
    #[instrument(skip(self, item, opts), fields(item_id = %item.id, partition = %item.partition_id()))]
    pub async fn lease(
        &self,
        item: &QueueItem,
        duration: Duration,
        mut opts: LeaseOptions<'_>,
    ) -> QueueResult<Ulid> {
        let duration_ms = lease_duration_ms(duration)?;
        let now = self.now_ms();

        if opts.capacity_lease.is_some_and(|l| !l.is_valid(now)) {
            warn!("Capacity lease for item {} is expiring, checking constraints locally", item.id);
            opts.capacity_lease = None;
            opts.disable_constraint_checks = false;
            opts.fallback_idempotency_key = None;
        }

        let config = self.partition_constraints(&item.partition_id());
        let mut constraints = self.resolve_constraints(item, &config);
        if constraints.throttle.as_ref().is_some_and(|t| t.outdated) {
            self.metrics.increment_outdated_throttle();
        }
        if item.refilled_from.is_some() {
            constraints.throttle = None;
        }

        let check_constraints = !opts.disable_constraint_checks
            && !self.disable_lease_checks.disable(item.account_id());

        if check_constraints {
            if let Some(err) = opts.denies.and_then(|d| denied(&constraints, d)) {
                trace!(item_id = %item.id, error = %err, "lease denied without store call");
                self.metrics.increment_denied_without_store();
                return Err(err);
            }
        }

        let lease_id = new_lease_id(now + duration_ms);
        let keys = self.item_keys(item, None);
        let partition_id = item.partition_id();
        let args = LeaseArgs {
            item_id: &item.id,
            partition_id: &partition_id,
            lease_id,
            expiry: now + duration_ms,
            now,
            check_constraints,
            limits: LeaseLimits {
                account: constraints.account_limit,
                partition: constraints.partition_limit,
                custom: [0, 1].map(|i| constraints.custom[i].as_ref().map_or(-1, |c| c.limit)),
                throttle: constraints.throttle.as_ref().map(|t| t.params),
            },
            fallback_idempotency: opts
                .fallback_idempotency_key
                .as_deref()
                .map(|k| (self.kg.lease_idempotency(k), self.config.capacity_lease_ttl_ms())),
            capacity_lease: opts.capacity_lease,
        };
        let code = self.run("lease", |tx| lease::lease(tx, &keys, &args)).await?;

        let err = match code {
            lease::OK => {
                self.metrics.increment_leased();
                return Ok(lease_id);
            }
            lease::NOT_FOUND => QueueError::ItemNotFound,
            lease::ALREADY_LEASED => {
                self.metrics.increment_lease_contention();
                QueueError::ItemAlreadyLeased
            }
            lease::PARTITION_LIMIT => partition_limit_error(&constraints),
            lease::CUSTOM_KEY_1_LIMIT => custom_limit_error(&constraints, 0),
            lease::CUSTOM_KEY_2_LIMIT => custom_limit_error(&constraints, 1),
            lease::ACCOUNT_LIMIT => QueueError::AccountConcurrencyLimit {
                key: constraints.account_key.clone().unwrap_or_default(),
            },
            lease::THROTTLED => QueueError::QueueItemThrottled {
                key: constraints
                    .throttle
                    .as_ref()
                    .map(|t| t.key.clone())
                    .unwrap_or_default(),
            },
            code => return Err(QueueError::UnknownResponse { script: "lease", code }),
        };

        if err.constraint_key().is_some() {
            self.metrics.increment_constraint_hit();
            if let Some(denies) = opts.denies {
                denies.record(&err);
            }
        }
        Err(err)
    }

    /// Swaps a held lease for a fresh one `duration` from now.
    #[instrument(skip(self, item), fields(item_id = %item.id))]
    pub async fn extend_lease(
        &self,
        item: &QueueItem,
        lease_id: Ulid,
        duration: Duration,
    ) -> QueueResult<Ulid> {
        let duration_ms = lease_duration_ms(duration)?;
        let now = self.now_ms();
        let next = new_lease_id(now + duration_ms);

        let keys = self.item_keys(item, None);
        let partition_id = item.partition_id();
        let args = ExtendLeaseArgs {
            item_id: &item.id,
            partition_id: &partition_id,
            current: lease_id,
            next,
            expiry: now + duration_ms,
        };
        let (code, capacity_lease) = self
            .run("extendLease", |tx| extend_lease::extend_lease(tx, &keys, &args))
            .await?;

        match code {
            extend_lease::OK => {}
            extend_lease::NOT_FOUND => return Err(QueueError::ItemNotFound),
            extend_lease::NOT_LEASED => return Err(QueueError::ItemNotLeased),
            extend_lease::LEASE_MISMATCH => return Err(QueueError::ItemLeaseMismatch),
            code => return Err(QueueError::UnknownResponse { script: "extendLease", code }),
        }

        if let Some(lease) = capacity_lease {
            self.extend_capacity_lease(item, lease, duration).await?;
        }
        Ok(next)
    }

    /// Renews the external reservation behind a capacity-leased item. A
    /// reservation the manager no longer knows is dropped, and the item is
    /// tracked by the queue's own constraint state from its next extension.
    async fn extend_capacity_lease(
        &self,
        item: &QueueItem,
        lease: CapacityLease,
        duration: Duration,
    ) -> QueueResult<()> {
        let Some((manager, _)) = self.capacity_manager_for(item) else {
            return Ok(());
        };
        let request = CapacityExtendLeaseRequest {
            account_id: item.account_id(),
            idempotency_key: item.id.clone(),
            lease_id: lease.lease_id,
            duration,
        };
        let renewed = match manager.extend_lease(request).await {
            Ok(renewed) => renewed,
            Err(err) => {
                warn!("Failed to extend capacity lease of item {}: {}", item.id, err);
                return Ok(());
            }
        };
        if renewed.is_none() {
            warn!("Capacity lease of item {} is gone", item.id);
        }

        let queue_item = self.kg.queue_item();
        let next = renewed.map(|lease_id| CapacityLease { lease_id });
        self.run("setCapacityLease", |tx| {
            maintenance::set_capacity_lease(tx, &queue_item, &item.id, next)
        })
        .await?;
        Ok(())
    }

    /// Hands a finished item's reservation back. Failures only cost the
    /// manager a lease that runs out on its own.
    async fn release_capacity_lease(&self, item: &QueueItem, lease: CapacityLease) {
        let Some((manager, _)) = self.capacity_manager_for(item) else {
            return;
        };
        let request = CapacityReleaseRequest {
            account_id: item.account_id(),
            idempotency_key: item.id.clone(),
            lease_id: lease.lease_id,
        };
        if let Err(err) = manager.release(request).await {
            warn!("Failed to release capacity lease of item {}: {}", item.id, err);
        }
    }

    /// Puts an item back, due at `at_ms` or now, whichever is later.
    #[instrument(skip(self, item), fields(item_id = %item.id, partition = %item.partition_id()))]
    pub async fn requeue(&self, item: &QueueItem, at_ms: i64) -> QueueResult<()> {
        let now = self.now_ms();
        let at = at_ms.max(now);

        let mut item = item.clone();
        let mut throttle = None;
        let legacy_throttle = item
            .data
            .throttle
            .as_ref()
            .is_some_and(|t| t.key_expression_hash.is_none());
        if legacy_throttle && self.key_queues_enabled(&item) {
            match self.refresh_throttle.refresh(&item).await {
                Ok(refreshed) => {
                    item.data.throttle = refreshed.clone();
                    throttle = Some(refreshed);
                }
                Err(QueueError::EventNotFound) => {
                    warn!("Event for item {} is gone, dequeueing instead of requeueing", item.id);
                    return match self.dequeue(&item).await {
                        Err(QueueError::ItemNotFound) => Ok(()),
                        other => other,
                    };
                }
                Err(err) => return Err(err),
            }
        }

        let (partition, config) = self.partition_for(&item);
        let key_queue = self.key_queue_for(&item, &config);
        let keys = self.item_keys(&item, key_queue.as_ref().map(|(b, _)| b));
        let args = RequeueArgs {
            item_id: &item.id,
            partition: &partition,
            at,
            now,
            throttle,
            key_queue: key_queue
                .as_ref()
                .map(|(backlog, shadow)| KeyQueueTarget { backlog, shadow }),
        };
        let code = self
            .run("requeue", |tx| requeue::requeue(tx, &keys, &args))
            .await?;

        match code {
            requeue::OK => {
                self.metrics.increment_requeued();
                Ok(())
            }
            requeue::NOT_FOUND => Err(QueueError::ItemNotFound),
            code => Err(QueueError::UnknownResponse { script: "requeue", code }),
        }
    }

    /// Moves an unleased item, looked up by the caller's job id, to `at_ms`.
    #[instrument(skip(self))]
    pub async fn requeue_by_job_id(&self, job_id: &str, at_ms: i64) -> QueueResult<()> {
        let now = self.now_ms();
        let item = self
            .item_by_id(&hash_id(job_id))
            .await?
            .ok_or(QueueError::ItemNotFound)?;

        let config = self.partition_constraints(&item.partition_id());
        let key_queue = self.key_queue_for(&item, &config);
        let keys = self.item_keys(&item, key_queue.as_ref().map(|(b, _)| b));
        let partition_id = item.partition_id();
        let args = RequeueByIdArgs {
            item_id: &item.id,
            partition_id: &partition_id,
            at: at_ms.max(now),
            now,
        };
        let code = self
            .run("requeueByID", |tx| requeue::requeue_by_id(tx, &keys, &args))
            .await?;

        match code {
            requeue::BY_ID_OK => Ok(()),
            requeue::BY_ID_NOT_FOUND => Err(QueueError::ItemNotFound),
            requeue::BY_ID_ALREADY_LEASED => Err(QueueError::ItemAlreadyLeased),
            code => Err(QueueError::UnknownResponse { script: "requeueByID", code }),
        }
    }

    /// Removes a finished item everywhere and remembers its id for the
    /// idempotency window.
    #[instrument(skip(self, item), fields(item_id = %item.id, partition = %item.partition_id()))]
    pub async fn dequeue(&self, item: &QueueItem) -> QueueResult<()> {
        let now = self.now_ms();
        let config = self.partition_constraints(&item.partition_id());
        let key_queue = self.key_queue_for(item, &config);
        let keys = self.item_keys(item, key_queue.as_ref().map(|(b, _)| b));
        let partition_id = item.partition_id();
        let args = DequeueArgs {
            item_id: &item.id,
            partition_id: &partition_id,
            now,
            idempotency_ttl_ms: self
                .idempotency_ttl
                .as_ref()
                .and_then(|ttl| ttl.ttl(item))
                .map(duration_ms),
            default_idempotency_ttl_ms: duration_ms(self.config.idempotency_ttl),
        };
        let (code, capacity_lease) = self
            .run("dequeue", |tx| dequeue::dequeue(tx, &keys, &args))
            .await?;

        match code {
            dequeue::OK => {
                self.metrics.increment_dequeued();
                debug!("Dequeued item {}", item.id);
                if let Some(lease) = capacity_lease {
                    self.release_capacity_lease(item, lease).await;
                }
                Ok(())
            }
            dequeue::NOT_FOUND => Err(QueueError::ItemNotFound),
            code => Err(QueueError::UnknownResponse { script: "dequeue", code }),
        }
    }

    /// Dequeues by the caller's job id. Unknown ids are ignored.
    pub async fn dequeue_by_job_id(&self, job_id: &str) -> QueueResult<()> {
        match self.item_by_id(&hash_id(job_id)).await? {
            Some(item) => match self.dequeue(&item).await {
                Err(QueueError::ItemNotFound) => Ok(()),
                other => other,
            },
            None => Ok(()),
        }
    }

    pub async fn reset_attempts(&self, item: &QueueItem) -> QueueResult<()> {
        let queue_item = self.kg.queue_item();
        let found = self
            .run("resetAttempts", |tx| {
                maintenance::reset_attempts(tx, &queue_item, &item.id)
            })
            .await?;
        if found {
            Ok(())
        } else {
            Err(QueueError::ItemNotFound)
        }
    }

    /// Deletes an item without writing an idempotency key.
    pub async fn remove_queue_item(&self, item_id: &str) -> QueueResult<bool> {
        let Some(item) = self.item_by_id(item_id).await? else {
            return Ok(false);
        };
        let config = self.partition_constraints(&item.partition_id());
        let key_queue = self.key_queue_for(&item, &config);
        let keys = self.item_keys(&item, key_queue.as_ref().map(|(b, _)| b));
        let partition_id = item.partition_id();
        let now = self.now_ms();
        self.run("removeItem", |tx| {
            maintenance::remove_item(tx, &keys, &item.id, &partition_id, now)
        })
        .await
    }

    /// Loads an item by its stored id.
    pub async fn item_by_id(&self, item_id: &str) -> QueueResult<Option<QueueItem>> {
        let queue_item = self.kg.queue_item();
        let id = item_id.to_string();
        self.run("itemByID", move |tx| read_field::<QueueItem>(tx, &queue_item, &id))
            .await
    }

    /// Items of a run, earliest first. `limit` is capped at 1000.
    pub async fn run_jobs(&self, run_id: Ulid, limit: i64, offset: usize) -> QueueResult<Vec<QueueItem>> {
        let limit = limit.clamp(1, RUN_JOBS_MAX) as usize;
        let queue_item = self.kg.queue_item();
        let run_index = self.kg.run_index(run_id);
        let rows = self
            .run("runJobs", |tx| {
                peek::index_records(tx, &queue_item, &run_index, (i64::MIN, i64::MAX), offset, limit)
            })
            .await?;

        let raw: Vec<String> = rows.into_iter().filter_map(|(_, raw)| raw).collect();
        let key = queue_item.clone();
        let batch = parallel_decode(raw, DEFAULT_DECODE_CHUNK, move |raw| {
            Ok(Some(decode::<QueueItem>(&key, &raw)?))
        })
        .await?;
        if let Some(err) = batch.first_error() {
            return Err(err.clone());
        }
        Ok(batch.items)
    }

    /// Number of items a run still has queued or in progress.
    pub async fn outstanding_job_count(&self, run_id: Ulid) -> QueueResult<usize> {
        let run_index = self.kg.run_index(run_id);
        self.run("outstandingJobCount", |tx| tx.zcard(&run_index)).await
    }

    /// Unexpired leases in one in-progress set.
    pub async fn in_progress(&self, scope: KeyScope, key: &str) -> QueueResult<i64> {
        let set = self.kg.concurrency(scope, key);
        let now = self.now_ms();
        self.run("inProgress", |tx| in_progress(tx, &set, now)).await
    }
}
