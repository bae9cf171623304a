//! Key queues: shadow partitions, their backlogs, refills into the ready
//! set and normalization of backlogs built from outdated constraints.

use std::time::Duration;

use tracing::{debug, info, instrument};
use ulid::Ulid;
use uuid::Uuid;

use super::{EnqueueOptions, Queue};
use crate::clock::duration_ms;
use crate::config::constants::{
    BACKLOG_REFILL_HARD_LIMIT, NORMALIZE_ACCOUNT_PEEK_MAX, SHADOW_PARTITION_ACCOUNT_PEEK_MAX,
    SHADOW_PARTITION_PEEK_MAX_BACKLOGS,
};
use crate::decode::{parallel_decode, DEFAULT_DECODE_CHUNK};
use crate::error::{QueueError, QueueResult};
use crate::scripts::backlog::{
    self, NormalizeKeys, RefillArgs, RefillCandidate, RefillLimits,
};
use crate::scripts::shadow::{self, ShadowKeys};
use crate::scripts::{decode, peek, refresh_backlog_pointers, BacklogKeys};
use crate::shuffle::{shuffle, weighted_shuffle};
use crate::store::Store;
use crate::types::{
    new_lease_id, PartitionConstraintConfig, QueueBacklog, QueueItem, QueueShadowPartition,
};

/// The constraint that stopped a refill short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefillConstraint {
    #[default]
    None,
    Account,
    Function,
    CustomKey1,
    CustomKey2,
    Throttle,
}

impl RefillConstraint {
    fn from_code(code: i64) -> QueueResult<Self> {
        Ok(match code {
            backlog::REFILL_OK => Self::None,
            backlog::REFILL_ACCOUNT_LIMIT => Self::Account,
            backlog::REFILL_FUNCTION_LIMIT => Self::Function,
            backlog::REFILL_CUSTOM_KEY_1_LIMIT => Self::CustomKey1,
            backlog::REFILL_CUSTOM_KEY_2_LIMIT => Self::CustomKey2,
            backlog::REFILL_THROTTLED => Self::Throttle,
            code => return Err(QueueError::UnknownResponse { script: "backlogRefill", code }),
        })
    }
}

/// Outcome of one backlog refill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BacklogRefill {
    pub constraint: RefillConstraint,
    pub refilled: usize,
    /// Due items in the backlog before the refill
    pub backlog_count_until: i64,
    pub total_backlog_count: i64,
    /// Capacity left once the refill was sized, `i64::MAX` when unbounded
    pub capacity: i64,
    /// Items the refill set out to move
    pub refill: i64,
    pub refilled_items: Vec<String>,
    /// Earliest time a throttled backlog admits another item, 0 when not throttled
    pub retry_at_ms: i64,
}

/// Backlogs of a shadow partition due by the peek time.
#[derive(Debug, Clone, Default)]
pub struct ShadowPartitionPeek {
    pub backlogs: Vec<QueueBacklog>,
    /// All backlogs of the shadow partition, due or not
    pub total_count: usize,
}

/// Start backlogs get a lower weight so that runs already in flight finish
/// before new ones are admitted.
pub fn shuffle_backlogs(backlogs: Vec<QueueBacklog>) -> Vec<QueueBacklog> {
    weighted_shuffle(backlogs, |b| if b.start { 1.0 } else { 10.0 })
}

fn peek_limit(limit: i64, max: i64) -> usize {
    if limit <= 0 || limit > max {
        max as usize
    } else {
        limit as usize
    }
}

impl<S: Store> Queue<S> {
    fn shadow_keys(&self, sp: &QueueShadowPartition) -> ShadowKeys {
        ShadowKeys::new(&self.kg, &sp.partition_id, sp.account_id)
    }

    fn backlog_keys(&self, backlog: &QueueBacklog, sp: &QueueShadowPartition) -> BacklogKeys {
        BacklogKeys::new(&self.kg, &backlog.backlog_id, &sp.partition_id, sp.account_id)
    }

    fn normalize_keys(&self, sp: &QueueShadowPartition) -> NormalizeKeys {
        NormalizeKeys {
            partition_normalize: self.kg.partition_normalize_set(&sp.partition_id),
            account_normalize: sp.account_id.map(|a| self.kg.account_normalize_set(a)),
            global_account_normalize: self.kg.global_account_normalize_set(),
        }
    }

    /// Leases a shadow partition so a single worker refills its backlogs.
    #[instrument(skip(self, sp), fields(partition = %sp.partition_id))]
    pub async fn shadow_partition_lease(
        &self,
        sp: &QueueShadowPartition,
        duration: Duration,
    ) -> QueueResult<Ulid> {
        let now = self.now_ms();
        let expiry = now + duration_ms(duration);
        let lease_id = new_lease_id(expiry);
        let keys = self.shadow_keys(sp);
        let code = self
            .run("shadowPartitionLease", |tx| {
                shadow::shadow_lease(tx, &keys, &sp.partition_id, lease_id, expiry, now)
            })
            .await?;

        match code {
            shadow::OK => Ok(lease_id),
            shadow::NOT_FOUND => Err(QueueError::ShadowPartitionNotFound),
            shadow::LEASE_CONFLICT => Err(QueueError::ShadowPartitionAlreadyLeased),
            code => Err(QueueError::UnknownResponse { script: "shadowPartitionLease", code }),
        }
    }

    pub async fn shadow_partition_extend_lease(
        &self,
        sp: &QueueShadowPartition,
        lease_id: Ulid,
        duration: Duration,
    ) -> QueueResult<Ulid> {
        let now = self.now_ms();
        let expiry = now + duration_ms(duration);
        let next = new_lease_id(expiry);
        let keys = self.shadow_keys(sp);
        let code = self
            .run("shadowPartitionExtendLease", |tx| {
                shadow::shadow_extend(tx, &keys, &sp.partition_id, lease_id, next, expiry, now)
            })
            .await?;

        match code {
            shadow::OK => Ok(next),
            shadow::NOT_FOUND => Err(QueueError::ShadowPartitionNotFound),
            shadow::LEASE_CONFLICT => Err(QueueError::ShadowPartitionLeaseNotFound),
            code => Err(QueueError::UnknownResponse { script: "shadowPartitionExtendLease", code }),
        }
    }

    /// Releases a shadow partition lease. The partition is next due at
    /// `force_at_ms`, or at its earliest backlog when `None`.
    pub async fn shadow_partition_requeue(
        &self,
        sp: &QueueShadowPartition,
        lease_id: Ulid,
        force_at_ms: Option<i64>,
    ) -> QueueResult<()> {
        let keys = self.shadow_keys(sp);
        let code = self
            .run("shadowPartitionRequeue", |tx| {
                shadow::shadow_requeue(tx, &keys, &sp.partition_id, lease_id, force_at_ms)
            })
            .await?;

        match code {
            shadow::OK => Ok(()),
            shadow::NOT_FOUND => Err(QueueError::ShadowPartitionNotFound),
            shadow::LEASE_CONFLICT => Err(QueueError::ShadowPartitionLeaseNotFound),
            code => Err(QueueError::UnknownResponse { script: "shadowPartitionRequeue", code }),
        }
    }

    /// Backlogs of a shadow partition due by `until_ms`.
    pub async fn shadow_partition_peek(
        &self,
        sp: &QueueShadowPartition,
        sequential: bool,
        until_ms: i64,
        limit: i64,
    ) -> QueueResult<ShadowPartitionPeek> {
        let limit = peek_limit(limit, SHADOW_PARTITION_PEEK_MAX_BACKLOGS);
        let shadow_set = self.kg.shadow_partition_set(&sp.partition_id);
        self.peek_backlog_index(shadow_set, sequential, until_ms, limit).await
    }

    /// Backlogs of a shadow partition waiting for normalization.
    pub async fn shadow_partition_peek_normalize_backlogs(
        &self,
        sp: &QueueShadowPartition,
        until_ms: i64,
        limit: i64,
    ) -> QueueResult<Vec<QueueBacklog>> {
        let limit = peek_limit(limit, SHADOW_PARTITION_PEEK_MAX_BACKLOGS);
        let set = self.kg.partition_normalize_set(&sp.partition_id);
        Ok(self.peek_backlog_index(set, true, until_ms, limit).await?.backlogs)
    }

    async fn peek_backlog_index(
        &self,
        index: String,
        sequential: bool,
        until_ms: i64,
        limit: usize,
    ) -> QueueResult<ShadowPartitionPeek> {
        let backlog_meta = self.kg.backlog_meta();
        let (rows, total) = self
            .run("shadowPartitionPeek", |tx| {
                let rows =
                    peek::index_records(tx, &backlog_meta, &index, (i64::MIN, until_ms), 0, limit)?;
                Ok((rows, tx.zcard(&index)?))
            })
            .await?;

        let mut missing = Vec::new();
        let mut backlogs = Vec::with_capacity(rows.len());
        for (id, raw) in rows {
            match raw {
                Some(raw) => backlogs.push(decode::<QueueBacklog>(&backlog_meta, &raw)?),
                None => missing.push(id),
            }
        }
        if !missing.is_empty() {
            self.heal_dangling(backlog_meta, vec![index], missing);
        }

        let backlogs = if sequential {
            backlogs
        } else {
            shuffle_backlogs(backlogs)
        };
        Ok(ShadowPartitionPeek {
            backlogs,
            total_count: total,
        })
    }

    /// Shadow partitions due by `until_ms` across all accounts.
    pub async fn global_shadow_partition_peek(
        &self,
        until_ms: i64,
        limit: i64,
    ) -> QueueResult<Vec<QueueShadowPartition>> {
        let limit = peek_limit(limit, SHADOW_PARTITION_PEEK_MAX_BACKLOGS);
        self.peek_shadow_index(self.kg.global_shadow_partition_set(), until_ms, limit)
            .await
    }

    pub async fn account_shadow_partition_peek(
        &self,
        account_id: Uuid,
        until_ms: i64,
        limit: i64,
    ) -> QueueResult<Vec<QueueShadowPartition>> {
        let limit = peek_limit(limit, SHADOW_PARTITION_PEEK_MAX_BACKLOGS);
        self.peek_shadow_index(self.kg.account_shadow_partitions(account_id), until_ms, limit)
            .await
    }

    async fn peek_shadow_index(
        &self,
        index: String,
        until_ms: i64,
        limit: usize,
    ) -> QueueResult<Vec<QueueShadowPartition>> {
        let shadow_meta = self.kg.shadow_partition_meta();
        let rows = self
            .run("shadowPartitionIndexPeek", |tx| {
                peek::index_records(tx, &shadow_meta, &index, (i64::MIN, until_ms), 0, limit)
            })
            .await?;

        let mut missing = Vec::new();
        let mut partitions = Vec::with_capacity(rows.len());
        for (id, raw) in rows {
            match raw {
                Some(raw) => partitions.push(decode::<QueueShadowPartition>(&shadow_meta, &raw)?),
                None => missing.push(id),
            }
        }
        if !missing.is_empty() {
            self.heal_dangling(shadow_meta, vec![index], missing);
        }
        Ok(shuffle(partitions))
    }

    /// Accounts with due shadow partitions.
    pub async fn account_shadow_peek(&self, until_ms: i64, limit: i64) -> QueueResult<Vec<Uuid>> {
        let limit = peek_limit(limit, SHADOW_PARTITION_ACCOUNT_PEEK_MAX);
        self.peek_account_members(self.kg.global_account_shadow_partitions(), until_ms, limit)
            .await
    }

    /// Accounts with backlogs waiting for normalization.
    pub async fn account_normalize_peek(&self, until_ms: i64, limit: i64) -> QueueResult<Vec<Uuid>> {
        let limit = peek_limit(limit, NORMALIZE_ACCOUNT_PEEK_MAX);
        self.peek_account_members(self.kg.global_account_normalize_set(), until_ms, limit)
            .await
    }

    async fn peek_account_members(&self, index: String, until_ms: i64, limit: usize) -> QueueResult<Vec<Uuid>> {
        let rows = self
            .run("accountIndexPeek", |tx| peek::index_peek(tx, &index, until_ms, limit))
            .await?;
        Ok(shuffle(
            rows.into_iter()
                .filter_map(|(member, _)| member.parse::<Uuid>().ok())
                .collect(),
        ))
    }

    /// Items of a backlog due by `until_ms`, earliest first.
    pub async fn backlog_peek(
        &self,
        backlog: &QueueBacklog,
        until_ms: i64,
        limit: i64,
    ) -> QueueResult<Vec<QueueItem>> {
        let limit = peek_limit(limit, BACKLOG_REFILL_HARD_LIMIT);
        let queue_item = self.kg.queue_item();
        let backlog_set = self.kg.backlog_set(&backlog.backlog_id);
        let rows = self
            .run("backlogPeek", |tx| {
                peek::index_records(tx, &queue_item, &backlog_set, (i64::MIN, until_ms), 0, limit)
            })
            .await?;

        let mut missing = Vec::new();
        let mut raw = Vec::with_capacity(rows.len());
        for (id, record) in rows {
            match record {
                Some(record) => raw.push(record),
                None => missing.push(id),
            }
        }
        if !missing.is_empty() {
            self.heal_dangling(queue_item.clone(), vec![backlog_set], missing);
        }

        let batch = parallel_decode(raw, DEFAULT_DECODE_CHUNK, move |raw| {
            Ok(Some(decode::<QueueItem>(&queue_item, &raw)?))
        })
        .await?;
        if let Some(err) = batch.first_error() {
            return Err(err.clone());
        }
        Ok(batch.items)
    }

    /// Moves due items of a backlog into the partition's ready set, as many
    /// as the account, function, custom key and throttle capacity allow.
    #[instrument(skip(self, backlog, sp), fields(backlog = %backlog.backlog_id))]
    pub async fn backlog_refill(
        &self,
        backlog: &QueueBacklog,
        sp: &QueueShadowPartition,
        until_ms: i64,
    ) -> QueueResult<BacklogRefill> {
        let now = self.now_ms();
        let max = self.config.backlog_refill_limit.clamp(1, BACKLOG_REFILL_HARD_LIMIT);
        let items = self.backlog_peek(backlog, until_ms, max).await?;
        let bk = self.backlog_keys(backlog, sp);
        let account = sp.account_id.map(|a| a.to_string());

        let Some(first) = items.first() else {
            let (count_until, total) = self
                .run("backlogRefill", |tx| {
                    let count_until = tx.zcount(&bk.backlog_set, i64::MIN, until_ms)? as i64;
                    let total = tx.zcard(&bk.backlog_set)? as i64;
                    refresh_backlog_pointers(tx, &bk, &sp.partition_id, account.as_deref(), now)?;
                    Ok((count_until, total))
                })
                .await?;
            return Ok(BacklogRefill {
                backlog_count_until: count_until,
                total_backlog_count: total,
                capacity: i64::MAX,
                ..Default::default()
            });
        };

        let config = self.partition_constraints(&sp.partition_id);
        let constraints = self.resolve_constraints(first, &config);
        let limits = RefillLimits {
            account: constraints.account_limit,
            function: constraints.partition_limit,
            custom: [0, 1].map(|i| constraints.custom[i].as_ref().map_or(-1, |c| c.limit)),
            throttle: constraints.throttle.as_ref().map(|t| t.params),
        };
        let shared = self.item_keys(first, Some(backlog));
        let candidates: Vec<RefillCandidate> = items
            .iter()
            .map(|item| RefillCandidate {
                item_id: item.id.clone(),
                keys: self.item_keys(item, Some(backlog)),
            })
            .collect();

        let args = RefillArgs {
            backlog: &bk,
            shared: &shared,
            candidates: &candidates,
            partition_id: &sp.partition_id,
            account_id: account,
            until: until_ms,
            now,
            max,
            limits,
        };
        let outcome = self
            .run("backlogRefill", |tx| backlog::refill(tx, &args))
            .await?;

        let refilled = outcome.refilled.len();
        self.metrics.add_backlog_refills(refilled as u64);
        debug!(
            refilled,
            due = outcome.backlog_count_until,
            capacity = outcome.capacity,
            "refilled backlog"
        );

        Ok(BacklogRefill {
            constraint: RefillConstraint::from_code(outcome.status)?,
            refilled,
            backlog_count_until: outcome.backlog_count_until,
            total_backlog_count: outcome.total_backlog_count,
            capacity: outcome.capacity,
            refill: outcome.refill,
            refilled_items: outcome.refilled,
            retry_at_ms: outcome.retry_at,
        })
    }

    /// Moves a backlog to `at_ms` in its shadow partition. Empty backlogs
    /// are dropped.
    pub async fn backlog_requeue(
        &self,
        backlog: &QueueBacklog,
        sp: &QueueShadowPartition,
        at_ms: i64,
    ) -> QueueResult<()> {
        let now = self.now_ms();
        let bk = self.backlog_keys(backlog, sp);
        let account = sp.account_id.map(|a| a.to_string());
        let code = self
            .run("backlogRequeue", |tx| {
                backlog::backlog_requeue(tx, &bk, &sp.partition_id, account.as_deref(), at_ms, now)
            })
            .await?;

        match code {
            backlog::REQUEUE_OK | backlog::REQUEUE_EMPTY => Ok(()),
            backlog::REQUEUE_NOT_FOUND => Err(QueueError::BacklogNotFound),
            code => Err(QueueError::UnknownResponse { script: "backlogRequeue", code }),
        }
    }

    /// Takes a backlog out of refill rotation and queues it for
    /// normalization.
    pub async fn backlog_prepare_normalize(
        &self,
        backlog: &QueueBacklog,
        sp: &QueueShadowPartition,
    ) -> QueueResult<()> {
        let now = self.now_ms();
        let bk = self.backlog_keys(backlog, sp);
        let nk = self.normalize_keys(sp);
        let account = sp.account_id.map(|a| a.to_string());
        let code = self
            .run("backlogPrepareNormalize", |tx| {
                backlog::prepare_normalize(tx, &bk, &nk, &sp.partition_id, account.as_deref(), now)
            })
            .await?;

        match code {
            backlog::NORMALIZE_OK => Ok(()),
            backlog::NORMALIZE_GARBAGE_COLLECTED => Err(QueueError::BacklogGarbageCollected),
            code => Err(QueueError::UnknownResponse { script: "backlogPrepareNormalize", code }),
        }
    }

    /// Re-enqueues up to `limit` items of a backlog prepared for
    /// normalization into the backlogs their current constraints select.
    /// Returns how many items moved.
    #[instrument(skip(self, backlog, sp), fields(backlog = %backlog.backlog_id))]
    pub async fn normalize_backlog(
        &self,
        backlog: &QueueBacklog,
        sp: &QueueShadowPartition,
        limit: i64,
    ) -> QueueResult<usize> {
        let config = self.partition_constraints(&sp.partition_id);
        let items = self.backlog_peek(backlog, i64::MAX, limit).await?;
        let mut moved = 0;
        for item in items {
            let Some(item) = self.normalize_item(item, &config).await? else {
                continue;
            };
            let at = item.at_ms;
            let opts = EnqueueOptions {
                passthrough_job_id: true,
                normalize_from_backlog_id: Some(backlog.backlog_id.clone()),
            };
            self.enqueue(item, at, opts).await?;
            moved += 1;
        }

        let bk = self.backlog_keys(backlog, sp);
        let nk = self.normalize_keys(sp);
        let account = sp.account_id.map(|a| a.to_string());
        let drained = self
            .run("backlogNormalizeFinish", |tx| {
                backlog::finish_normalize(tx, &bk, &nk, &sp.partition_id, account.as_deref())
            })
            .await?;
        if drained {
            info!("Normalized backlog {} ({} items)", backlog.backlog_id, moved);
        }
        Ok(moved)
    }

    /// Rewrites an item's keys to the current configuration: custom keys
    /// that are no longer configured are dropped and a changed throttle is
    /// re-evaluated. Items whose event is gone are dequeued and `None` is
    /// returned.
    async fn normalize_item(
        &self,
        mut item: QueueItem,
        config: &PartitionConstraintConfig,
    ) -> QueueResult<Option<QueueItem>> {
        let original = item.clone();
        item.data.custom_concurrency_keys.retain(|key| {
            key.scope()
                .is_some_and(|scope| config.custom_key_limit(scope, &key.hash).is_some())
        });

        let Some(current) = item.data.throttle.as_ref().filter(|_| item.is_start()) else {
            return Ok(Some(item));
        };
        match &config.throttle {
            None => item.data.throttle = None,
            Some(want) if current.key_expression_hash.as_deref() != Some(want.throttle_key_expression_hash.as_str()) => {
                match self.refresh_throttle.refresh(&item).await {
                    Ok(throttle) => item.data.throttle = throttle,
                    Err(QueueError::EventNotFound) => {
                        debug!("Event for item {} is gone, dropping it from normalization", item.id);
                        self.dequeue(&original).await?;
                        return Ok(None);
                    }
                    Err(err) => return Err(err),
                }
            }
            Some(_) => {}
        }
        Ok(Some(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backlog(id: &str, start: bool) -> QueueBacklog {
        QueueBacklog {
            backlog_id: id.to_string(),
            shadow_partition_id: "p".to_string(),
            earliest_function_version: 1,
            start,
            throttle: None,
            concurrency_keys: Vec::new(),
        }
    }

    #[test]
    fn test_shuffle_backlogs_favours_non_start() {
        let mut non_start_first = 0;
        for _ in 0..500 {
            let out = shuffle_backlogs(vec![backlog("start", true), backlog("edge", false)]);
            assert_eq!(out.len(), 2);
            if out[0].backlog_id == "edge" {
                non_start_first += 1;
            }
        }
        // weight 10 vs 1 puts the edge backlog first about 91% of the time
        assert!(non_start_first > 350, "edge first {} times", non_start_first);
    }

    #[test]
    fn test_peek_limit_defaults_to_max() {
        assert_eq!(peek_limit(0, 100), 100);
        assert_eq!(peek_limit(-3, 100), 100);
        assert_eq!(peek_limit(500, 100), 100);
        assert_eq!(peek_limit(7, 100), 7);
    }
}
