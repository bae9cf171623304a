use crate::store::{StoreResult, Txn};
use crate::types::{QueueItem, QueuePartition, Throttle};

use super::enqueue::KeyQueueTarget;
use super::{
    clear_active, clear_in_progress, encode, lower_partition_pointers, read_field,
    set_to_min_of, upsert_partition, ItemKeys,
};

pub(crate) const OK: i64 = 0;
pub(crate) const NOT_FOUND: i64 = 1;

pub(crate) const BY_ID_OK: i64 = 0;
pub(crate) const BY_ID_NOT_FOUND: i64 = 1;
pub(crate) const BY_ID_ALREADY_LEASED: i64 = 2;

pub(crate) struct RequeueArgs<'a> {
    pub item_id: &'a str,
    pub partition: &'a QueuePartition,
    /// Already clamped to `now` or later
    pub at: i64,
    pub now: i64,
    /// Replacement throttle for items with an outdated one
    pub throttle: Option<Option<Throttle>>,
    pub key_queue: Option<KeyQueueTarget<'a>>,
}

pub(crate) fn requeue(tx: &mut dyn Txn, keys: &ItemKeys, args: &RequeueArgs<'_>) -> StoreResult<i64> {
    let id = args.item_id;
    let Some(mut item) = read_field::<QueueItem>(tx, &keys.queue_item, id)? else {
        return Ok(NOT_FOUND);
    };
    let constraint_updates = item.capacity_lease.is_none();

    item.at_ms = args.at;
    item.wall_time_ms = args.at;
    item.enqueued_at_ms = args.now;
    item.lease_id = None;
    item.refilled_from = None;
    item.refilled_at_ms = None;
    item.capacity_lease = None;
    if let Some(throttle) = &args.throttle {
        item.data.throttle = throttle.clone();
    }
    tx.hset(&keys.queue_item, id, &encode(&item)?)?;

    if constraint_updates {
        clear_in_progress(tx, keys, id, &args.partition.id)?;
    }

    let partition = upsert_partition(tx, &keys.partition_item, args.partition)?;

    match (&keys.backlog, &args.key_queue) {
        (Some(bk), Some(target)) => {
            tx.zrem(&keys.ready_set, id)?;
            tx.zadd(&bk.backlog_set, id, args.at)?;
            if !tx.hexists(&bk.backlog_meta, &bk.backlog_id)? {
                tx.hset(&bk.backlog_meta, &bk.backlog_id, &encode(target.backlog)?)?;
            }
            if !tx.hexists(&bk.shadow_meta, &partition.id)? {
                tx.hset(&bk.shadow_meta, &partition.id, &encode(target.shadow)?)?;
            }
            tx.zadd_min(&bk.shadow_set, &bk.backlog_id, args.at)?;
            tx.zadd_min(&bk.global_shadow_set, &partition.id, args.at)?;
            if let Some(account_shadows) = &bk.account_shadows {
                tx.zadd_min(account_shadows, &partition.id, args.at)?;
                tx.zadd_min(
                    &bk.global_account_shadows,
                    &item.account_id().to_string(),
                    args.at,
                )?;
            }
            clear_active(tx, keys, id, &item.run_id().to_string())?;
        }
        _ => {
            tx.zadd(&keys.ready_set, id, args.at)?;
            lower_partition_pointers(tx, keys, &partition, args.at, args.now)?;
        }
    }

    tx.zadd(&keys.run_index, id, args.at)?;
    Ok(OK)
}

pub(crate) struct RequeueByIdArgs<'a> {
    pub item_id: &'a str,
    pub partition_id: &'a str,
    pub at: i64,
    pub now: i64,
}

/// Moves an unleased item to a new time and repoints the partition at its
/// earliest item.
pub(crate) fn requeue_by_id(
    tx: &mut dyn Txn,
    keys: &ItemKeys,
    args: &RequeueByIdArgs<'_>,
) -> StoreResult<i64> {
    let id = args.item_id;
    let Some(mut item) = read_field::<QueueItem>(tx, &keys.queue_item, id)? else {
        return Ok(BY_ID_NOT_FOUND);
    };
    if item.is_leased(args.now) {
        return Ok(BY_ID_ALREADY_LEASED);
    }

    item.at_ms = args.at;
    item.wall_time_ms = args.at;
    tx.hset(&keys.queue_item, id, &encode(&item)?)?;
    tx.zadd(&keys.run_index, id, args.at)?;

    if let Some(bk) = &keys.backlog {
        if tx.zadd_existing(&bk.backlog_set, id, args.at)? {
            set_to_min_of(tx, &bk.shadow_set, &bk.backlog_id, &bk.backlog_set)?;
            return Ok(BY_ID_OK);
        }
    }

    tx.zadd_existing(&keys.ready_set, id, args.at)?;

    let Some(partition) = read_field::<QueuePartition>(tx, &keys.partition_item, args.partition_id)? else {
        return Ok(BY_ID_OK);
    };
    if partition.is_leased(args.now) || partition.is_forced_after(args.now) {
        return Ok(BY_ID_OK);
    }
    if let Some((_, earliest)) = tx.zmin(&keys.ready_set)? {
        let score = earliest.max(args.now);
        tx.zadd(&keys.global_partition_index, args.partition_id, score)?;
        if let Some(account_index) = &keys.account_partition_index {
            tx.zadd(account_index, args.partition_id, score)?;
            set_to_min_of(
                tx,
                &keys.global_account_index,
                &partition.account_id.to_string(),
                account_index,
            )?;
        }
    }
    Ok(BY_ID_OK)
}
