use crate::store::{StoreResult, Txn};
use crate::types::{CapacityLease, QueueItem};

use super::{clear_active, clear_in_progress, read_field, refresh_backlog_pointers, ItemKeys};

pub(crate) const OK: i64 = 0;
pub(crate) const NOT_FOUND: i64 = 1;

pub(crate) struct DequeueArgs<'a> {
    pub item_id: &'a str,
    pub partition_id: &'a str,
    pub now: i64,
    /// TTL chosen by the host for this item, ahead of the item's own period
    pub idempotency_ttl_ms: Option<i64>,
    /// TTL of the idempotency key when neither is set
    pub default_idempotency_ttl_ms: i64,
}

/// Returns the result code and the capacity lease the item held, if any.
pub(crate) fn dequeue(
    tx: &mut dyn Txn,
    keys: &ItemKeys,
    args: &DequeueArgs<'_>,
) -> StoreResult<(i64, Option<CapacityLease>)> {
    let id = args.item_id;
    let Some(item) = read_field::<QueueItem>(tx, &keys.queue_item, id)? else {
        return Ok((NOT_FOUND, None));
    };
    let run_id = item.run_id().to_string();

    tx.hdel(&keys.queue_item, id)?;
    tx.zrem(&keys.ready_set, id)?;

    if let Some(bk) = &keys.backlog {
        if tx.zrem(&bk.backlog_set, id)? {
            let account = (!item.is_system()).then(|| item.account_id().to_string());
            refresh_backlog_pointers(tx, bk, args.partition_id, account.as_deref(), args.now)?;
        }
    }

    // Constraint state of a valid capacity lease belongs to the manager.
    if !item.has_valid_capacity_lease(args.now) {
        clear_in_progress(tx, keys, id, args.partition_id)?;
    }
    clear_active(tx, keys, id, &run_id)?;
    tx.zrem(&keys.run_index, id)?;

    let ttl = args
        .idempotency_ttl_ms
        .filter(|ttl| *ttl > 0)
        .or(item.idempotency_period_ms.filter(|ttl| *ttl > 0))
        .unwrap_or(args.default_idempotency_ttl_ms);
    tx.set(&keys.idempotency, "", Some(ttl))?;

    if let Some(singleton) = &keys.singleton {
        let run_done = tx.scard(&keys.run_active)? == 0 && tx.zcard(&keys.run_index)? == 0;
        if run_done && tx.get(singleton)?.as_deref() == Some(run_id.as_str()) {
            tx.del(singleton)?;
            tx.del(&keys.singleton_run)?;
        }
    }
    Ok((OK, item.capacity_lease))
}
