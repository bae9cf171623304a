//! Atomic scripts.
//!
//! Each script is a plain function run inside [`crate::store::Store::atomic`].
//! Scripts receive every key they touch through a keys struct built by the
//! [`KeyGenerator`] and return small integer codes that the queue maps to
//! typed results.

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::keys::{KeyGenerator, KeyScope};
use crate::store::{StoreError, StoreResult, Txn};
use crate::types::{QueueItem, QueuePartition, QueueShadowPartition};

pub(crate) mod backlog;
pub(crate) mod config_lease;
pub(crate) mod dequeue;
pub(crate) mod enqueue;
pub(crate) mod extend_lease;
pub(crate) mod lease;
pub(crate) mod maintenance;
pub(crate) mod partition;
pub(crate) mod peek;
pub(crate) mod requeue;
pub(crate) mod shadow;

pub(crate) fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> StoreResult<T> {
    serde_json::from_str(raw).map_err(|e| StoreError::invalid(key, e))
}

pub(crate) fn encode<T: Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::invalid("<encode>", e))
}

pub(crate) fn read_field<T: DeserializeOwned>(
    tx: &mut dyn Txn,
    key: &str,
    field: &str,
) -> StoreResult<Option<T>> {
    match tx.hget(key, field)? {
        Some(raw) => decode(key, &raw).map(Some),
        None => Ok(None),
    }
}

/// Number of unexpired entries in an in-progress set.
pub(crate) fn in_progress(tx: &mut dyn Txn, key: &str, now: i64) -> StoreResult<i64> {
    Ok(tx.zcount(key, now.saturating_add(1), i64::MAX)? as i64)
}

/// Scores a member by the minimum of `source`, removing it when `source` is empty.
pub(crate) fn set_to_min_of(
    tx: &mut dyn Txn,
    index: &str,
    member: &str,
    source: &str,
) -> StoreResult<Option<i64>> {
    match tx.zmin(source)? {
        Some((_, score)) => {
            tx.zadd(index, member, score)?;
            Ok(Some(score))
        }
        None => {
            tx.zrem(index, member)?;
            Ok(None)
        }
    }
}

/// Keys of the backlog and shadow partition an item is routed through.
#[derive(Debug, Clone)]
pub(crate) struct BacklogKeys {
    pub backlog_id: String,
    pub backlog_set: String,
    pub backlog_meta: String,
    pub shadow_set: String,
    pub shadow_meta: String,
    pub global_shadow_set: String,
    pub account_shadows: Option<String>,
    pub global_account_shadows: String,
}

impl BacklogKeys {
    pub fn new(kg: &KeyGenerator, backlog_id: &str, partition_id: &str, account_id: Option<Uuid>) -> Self {
        Self {
            backlog_id: backlog_id.to_string(),
            backlog_set: kg.backlog_set(backlog_id),
            backlog_meta: kg.backlog_meta(),
            shadow_set: kg.shadow_partition_set(partition_id),
            shadow_meta: kg.shadow_partition_meta(),
            global_shadow_set: kg.global_shadow_partition_set(),
            account_shadows: account_id.map(|a| kg.account_shadow_partitions(a)),
            global_account_shadows: kg.global_account_shadow_partitions(),
        }
    }
}

/// Every key a script may touch on behalf of one item.
#[derive(Debug, Clone)]
pub(crate) struct ItemKeys {
    pub queue_item: String,
    pub partition_item: String,
    pub ready_set: String,
    pub global_partition_index: String,
    pub account_partition_index: Option<String>,
    pub global_account_index: String,
    pub in_progress_partition: String,
    pub in_progress_account: Option<String>,
    pub in_progress_custom: [Option<String>; 2],
    pub scavenger_index: String,
    pub concurrency_index: String,
    pub active_partition: String,
    pub active_account: Option<String>,
    pub active_custom: [Option<String>; 2],
    pub active_runs_partition: String,
    pub active_runs_account: Option<String>,
    pub run_active: String,
    pub run_index: String,
    pub idempotency: String,
    pub singleton: Option<String>,
    pub singleton_run: String,
    pub throttle: Option<String>,
    pub backlog: Option<BacklogKeys>,
}

impl ItemKeys {
    /// Keys for `item`. `backlog_id` routes the item through a key queue.
    pub fn new(kg: &KeyGenerator, item: &QueueItem, backlog_id: Option<&str>) -> Self {
        let partition_id = item.partition_id();
        let account = (!item.is_system()).then(|| item.account_id());
        let account_str = account.map(|a| a.to_string());

        let custom = |i: usize| item.custom_key(i).map(|k| kg.in_progress_custom(&k.key));
        let active_custom = |i: usize| {
            item.custom_key(i)
                .map(|k| kg.active_set(KeyScope::Custom, &k.key))
        };

        Self {
            queue_item: kg.queue_item(),
            partition_item: kg.partition_item(),
            ready_set: kg.ready_set(&partition_id),
            global_partition_index: kg.global_partition_index(),
            account_partition_index: account.map(|a| kg.account_partition_index(a)),
            global_account_index: kg.global_account_index(),
            in_progress_partition: kg.in_progress_partition(&partition_id),
            in_progress_account: account.map(|a| kg.in_progress_account(a)),
            in_progress_custom: [custom(0), custom(1)],
            scavenger_index: kg.partition_scavenger_index(&partition_id),
            concurrency_index: kg.concurrency_index(),
            active_partition: kg.active_set(KeyScope::Partition, &partition_id),
            active_account: account_str
                .as_deref()
                .map(|a| kg.active_set(KeyScope::Account, a)),
            active_custom: [active_custom(0), active_custom(1)],
            active_runs_partition: kg.active_runs_set(KeyScope::Partition, &partition_id),
            active_runs_account: account_str
                .as_deref()
                .map(|a| kg.active_runs_set(KeyScope::Account, a)),
            run_active: kg.run_active_set(item.run_id()),
            run_index: kg.run_index(item.run_id()),
            idempotency: kg.idempotency(&item.id),
            singleton: item
                .data
                .singleton
                .as_ref()
                .map(|s| kg.singleton_key(&s.key)),
            singleton_run: kg.singleton_run(item.run_id()),
            throttle: item.data.throttle.as_ref().map(|t| kg.throttle_key(Some(t))),
            backlog: backlog_id.map(|b| BacklogKeys::new(kg, b, &partition_id, account)),
        }
    }

    pub fn in_progress_sets(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.in_progress_partition)
            .chain(self.in_progress_account.iter())
            .chain(self.in_progress_custom.iter().flatten())
    }

    pub fn active_sets(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.active_partition)
            .chain(self.active_account.iter())
            .chain(self.active_custom.iter().flatten())
    }

    pub fn active_runs_sets(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.active_runs_partition).chain(self.active_runs_account.iter())
    }
}

/// Writes the partition record unless one exists; returns the stored record.
pub(crate) fn upsert_partition(
    tx: &mut dyn Txn,
    partition_item: &str,
    partition: &QueuePartition,
) -> StoreResult<QueuePartition> {
    match read_field::<QueuePartition>(tx, partition_item, &partition.id)? {
        Some(mut existing) => {
            if existing.concurrency_limit != partition.concurrency_limit {
                existing.concurrency_limit = partition.concurrency_limit;
                tx.hset(partition_item, &partition.id, &encode(&existing)?)?;
            }
            Ok(existing)
        }
        None => {
            tx.hset(partition_item, &partition.id, &encode(partition)?)?;
            Ok(partition.clone())
        }
    }
}

/// Moves the partition pointers no later than `score`, unless the partition
/// was pushed forward past `now`.
pub(crate) fn lower_partition_pointers(
    tx: &mut dyn Txn,
    keys: &ItemKeys,
    partition: &QueuePartition,
    score: i64,
    now: i64,
) -> StoreResult<()> {
    if partition.force_at_ms > now {
        return Ok(());
    }
    tx.zadd_min(&keys.global_partition_index, &partition.id, score)?;
    if let Some(account_index) = &keys.account_partition_index {
        tx.zadd_min(account_index, &partition.id, score)?;
        tx.zadd_min(
            &keys.global_account_index,
            &partition.account_id.to_string(),
            score,
        )?;
    }
    Ok(())
}

/// Recomputes a partition's global concurrency index entry from its
/// scavenger index.
pub(crate) fn refresh_concurrency_index(
    tx: &mut dyn Txn,
    concurrency_index: &str,
    scavenger_index: &str,
    partition_id: &str,
) -> StoreResult<()> {
    set_to_min_of(tx, concurrency_index, partition_id, scavenger_index).map(|_| ())
}

/// Drops the item from every in-progress set and the scavenger index.
pub(crate) fn clear_in_progress(
    tx: &mut dyn Txn,
    keys: &ItemKeys,
    item_id: &str,
    partition_id: &str,
) -> StoreResult<()> {
    for key in keys.in_progress_sets() {
        tx.zrem(key, item_id)?;
    }
    tx.zrem(&keys.scavenger_index, item_id)?;
    refresh_concurrency_index(tx, &keys.concurrency_index, &keys.scavenger_index, partition_id)
}

/// Removes the item from active sets, and the run from active-runs sets
/// once the run has nothing active left.
pub(crate) fn clear_active(
    tx: &mut dyn Txn,
    keys: &ItemKeys,
    item_id: &str,
    run_id: &str,
) -> StoreResult<()> {
    for key in keys.active_sets() {
        tx.srem(key, item_id)?;
    }
    tx.srem(&keys.run_active, item_id)?;
    if tx.scard(&keys.run_active)? == 0 {
        for key in keys.active_runs_sets() {
            tx.srem(key, run_id)?;
        }
    }
    Ok(())
}

pub(crate) fn mark_active(
    tx: &mut dyn Txn,
    keys: &ItemKeys,
    item_id: &str,
    run_id: &str,
) -> StoreResult<()> {
    for key in keys.active_sets() {
        tx.sadd(key, item_id)?;
    }
    tx.sadd(&keys.run_active, item_id)?;
    for key in keys.active_runs_sets() {
        tx.sadd(key, run_id)?;
    }
    Ok(())
}

/// Re-scores the backlog in its shadow partition, dropping it when empty,
/// then refreshes the shadow partition pointers.
pub(crate) fn refresh_backlog_pointers(
    tx: &mut dyn Txn,
    bk: &BacklogKeys,
    partition_id: &str,
    account_id: Option<&str>,
    now: i64,
) -> StoreResult<()> {
    match tx.zmin(&bk.backlog_set)? {
        Some((_, score)) => tx.zadd(&bk.shadow_set, &bk.backlog_id, score)?,
        None => {
            tx.zrem(&bk.shadow_set, &bk.backlog_id)?;
            tx.hdel(&bk.backlog_meta, &bk.backlog_id)?;
        }
    }
    refresh_shadow_pointers(tx, bk, partition_id, account_id, now)
}

/// Points the global and account shadow indexes at the earliest backlog,
/// leaving a leased shadow partition where its lease put it.
pub(crate) fn refresh_shadow_pointers(
    tx: &mut dyn Txn,
    bk: &BacklogKeys,
    partition_id: &str,
    account_id: Option<&str>,
    now: i64,
) -> StoreResult<()> {
    let leased = read_field::<QueueShadowPartition>(tx, &bk.shadow_meta, partition_id)?
        .is_some_and(|sp| sp.is_leased(now));

    match tx.zmin(&bk.shadow_set)? {
        Some((_, score)) => {
            if !leased {
                tx.zadd(&bk.global_shadow_set, partition_id, score)?;
                if let Some(account_shadows) = &bk.account_shadows {
                    tx.zadd(account_shadows, partition_id, score)?;
                }
            }
        }
        None => {
            tx.zrem(&bk.global_shadow_set, partition_id)?;
            if let Some(account_shadows) = &bk.account_shadows {
                tx.zrem(account_shadows, partition_id)?;
            }
        }
    }

    if let (Some(account_shadows), Some(account)) = (&bk.account_shadows, account_id) {
        set_to_min_of(tx, &bk.global_account_shadows, account, account_shadows)?;
    }
    Ok(())
}
