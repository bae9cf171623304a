use crate::store::{StoreResult, Txn};
use crate::types::{QueueBacklog, QueueItem, QueuePartition, QueueShadowPartition};

use super::{
    encode, lower_partition_pointers, read_field, refresh_backlog_pointers, upsert_partition,
    BacklogKeys, ItemKeys,
};

pub(crate) const OK: i64 = 0;
pub(crate) const EXISTS: i64 = 1;
pub(crate) const SINGLETON_EXISTS: i64 = 2;

/// Where a key-queue item lands.
pub(crate) struct KeyQueueTarget<'a> {
    pub backlog: &'a QueueBacklog,
    pub shadow: &'a QueueShadowPartition,
}

pub(crate) struct EnqueueArgs<'a> {
    pub item: &'a QueueItem,
    pub partition: &'a QueuePartition,
    /// Score of the item
    pub at: i64,
    /// Score used for partition pointers, never in the past
    pub partition_time: i64,
    pub now: i64,
    pub key_queue: Option<KeyQueueTarget<'a>>,
    /// Backlog the item is moved out of while normalizing
    pub normalize_from: Option<&'a BacklogKeys>,
}

pub(crate) fn enqueue(tx: &mut dyn Txn, keys: &ItemKeys, args: &EnqueueArgs<'_>) -> StoreResult<i64> {
    let item = args.item;
    let id = item.id.as_str();

    if args.normalize_from.is_none()
        && (tx.exists(&keys.idempotency)? || tx.hexists(&keys.queue_item, id)?)
    {
        return Ok(EXISTS);
    }

    if let Some(singleton) = &keys.singleton {
        let run = item.run_id().to_string();
        if let Some(holder) = tx.get(singleton)? {
            if holder != run {
                return Ok(SINGLETON_EXISTS);
            }
        }
        tx.set(singleton, &run, None)?;
        tx.set(&keys.singleton_run, singleton, None)?;
    }

    tx.hset(&keys.queue_item, id, &encode(item)?)?;
    let partition = upsert_partition(tx, &keys.partition_item, args.partition)?;

    if let Some(old) = args.normalize_from {
        let account = (!item.is_system()).then(|| item.account_id().to_string());
        tx.zrem(&old.backlog_set, id)?;
        // A backlog being normalized stays out of refill rotation until drained.
        if tx.zcard(&old.backlog_set)? == 0 {
            refresh_backlog_pointers(tx, old, &partition.id, account.as_deref(), args.now)?;
        }
    }

    match (&keys.backlog, &args.key_queue) {
        (Some(bk), Some(target)) => {
            tx.zadd(&bk.backlog_set, id, args.at)?;

            if !tx.hexists(&bk.backlog_meta, &bk.backlog_id)? {
                tx.hset(&bk.backlog_meta, &bk.backlog_id, &encode(target.backlog)?)?;
            }
            let shadow = match read_field::<QueueShadowPartition>(tx, &bk.shadow_meta, &partition.id)? {
                Some(existing) => QueueShadowPartition {
                    lease_id: existing.lease_id,
                    pause_refill: existing.pause_refill,
                    pause_enqueue: existing.pause_enqueue,
                    ..target.shadow.clone()
                },
                None => target.shadow.clone(),
            };
            tx.hset(&bk.shadow_meta, &partition.id, &encode(&shadow)?)?;

            tx.zadd_min(&bk.shadow_set, &bk.backlog_id, args.partition_time)?;
            if !shadow.is_leased(args.now) {
                tx.zadd_min(&bk.global_shadow_set, &partition.id, args.partition_time)?;
                if let Some(account_shadows) = &bk.account_shadows {
                    tx.zadd_min(account_shadows, &partition.id, args.partition_time)?;
                    tx.zadd_min(
                        &bk.global_account_shadows,
                        &item.account_id().to_string(),
                        args.partition_time,
                    )?;
                }
            }
        }
        _ => {
            tx.zadd(&keys.ready_set, id, args.at)?;
            lower_partition_pointers(tx, keys, &partition, args.partition_time, args.now)?;
        }
    }

    tx.zadd(&keys.run_index, id, args.at)?;
    Ok(OK)
}
