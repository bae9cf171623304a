use ulid::Ulid;

use crate::store::{StoreError, StoreResult, Txn};
use crate::types::{CapacityLease, FnMetadata, QueueItem};

use super::{clear_active, clear_in_progress, encode, read_field, refresh_backlog_pointers, ItemKeys};

/// Clears the attempt counter of an item. Returns `false` when it is gone.
pub(crate) fn reset_attempts(tx: &mut dyn Txn, queue_item: &str, item_id: &str) -> StoreResult<bool> {
    let Some(mut item) = read_field::<QueueItem>(tx, queue_item, item_id)? else {
        return Ok(false);
    };
    item.data.attempt = 0;
    tx.hset(queue_item, item_id, &encode(&item)?)?;
    Ok(true)
}

/// Replaces the capacity lease of an item. Returns `false` when it is gone.
pub(crate) fn set_capacity_lease(
    tx: &mut dyn Txn,
    queue_item: &str,
    item_id: &str,
    lease: Option<CapacityLease>,
) -> StoreResult<bool> {
    let Some(mut item) = read_field::<QueueItem>(tx, queue_item, item_id)? else {
        return Ok(false);
    };
    item.capacity_lease = lease;
    tx.hset(queue_item, item_id, &encode(&item)?)?;
    Ok(true)
}

/// Deletes an item and every index entry it holds, without an idempotency key.
pub(crate) fn remove_item(
    tx: &mut dyn Txn,
    keys: &ItemKeys,
    item_id: &str,
    partition_id: &str,
    now: i64,
) -> StoreResult<bool> {
    let Some(item) = read_field::<QueueItem>(tx, &keys.queue_item, item_id)? else {
        return Ok(false);
    };
    tx.hdel(&keys.queue_item, item_id)?;
    tx.zrem(&keys.ready_set, item_id)?;
    tx.zrem(&keys.run_index, item_id)?;

    if let Some(bk) = &keys.backlog {
        if tx.zrem(&bk.backlog_set, item_id)? {
            let account = (!item.is_system()).then(|| item.account_id().to_string());
            refresh_backlog_pointers(tx, bk, partition_id, account.as_deref(), now)?;
        }
    }

    clear_in_progress(tx, keys, item_id, partition_id)?;
    clear_active(tx, keys, item_id, &item.run_id().to_string())?;
    Ok(true)
}

/// Appends a constrained-item count, keeping the newest `len` samples.
pub(crate) fn set_peek_ewma(tx: &mut dyn Txn, key: &str, value: i64, len: usize) -> StoreResult<()> {
    tx.rpush(key, &value.to_string())?;
    let keep = len.max(1) as i64;
    tx.ltrim(key, -keep, -1)
}

pub(crate) fn peek_ewma_samples(tx: &mut dyn Txn, key: &str) -> StoreResult<Vec<i64>> {
    tx.lrange(key, 0, -1)?
        .iter()
        .map(|raw| raw.parse::<i64>().map_err(|e| StoreError::invalid(key, e)))
        .collect()
}

pub(crate) fn set_function_paused(
    tx: &mut dyn Txn,
    key: &str,
    metadata: &FnMetadata,
) -> StoreResult<()> {
    tx.set(key, &encode(metadata)?, None)
}

pub(crate) fn set_migration_lock(
    tx: &mut dyn Txn,
    key: &str,
    lock: Option<(Ulid, i64)>,
) -> StoreResult<()> {
    match lock {
        Some((lease, ttl_ms)) => tx.set(key, &lease.to_string(), Some(ttl_ms)),
        None => tx.del(key).map(|_| ()),
    }
}
