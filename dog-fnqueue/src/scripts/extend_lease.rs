use ulid::Ulid;

use crate::store::{StoreResult, Txn};
use crate::types::{CapacityLease, QueueItem};

use super::{encode, read_field, refresh_concurrency_index, ItemKeys};

pub(crate) const OK: i64 = 0;
pub(crate) const NOT_FOUND: i64 = 1;
pub(crate) const NOT_LEASED: i64 = 2;
pub(crate) const LEASE_MISMATCH: i64 = 3;

pub(crate) struct ExtendLeaseArgs<'a> {
    pub item_id: &'a str,
    pub partition_id: &'a str,
    pub current: Ulid,
    pub next: Ulid,
    pub expiry: i64,
}

/// Returns the result code and the capacity lease the item holds, if any.
pub(crate) fn extend_lease(
    tx: &mut dyn Txn,
    keys: &ItemKeys,
    args: &ExtendLeaseArgs<'_>,
) -> StoreResult<(i64, Option<CapacityLease>)> {
    let Some(mut item) = read_field::<QueueItem>(tx, &keys.queue_item, args.item_id)? else {
        return Ok((NOT_FOUND, None));
    };
    match item.lease_id {
        None => return Ok((NOT_LEASED, None)),
        Some(held) if held != args.current => return Ok((LEASE_MISMATCH, None)),
        Some(_) => {}
    }

    item.lease_id = Some(args.next);
    tx.hset(&keys.queue_item, args.item_id, &encode(&item)?)?;

    if item.capacity_lease.is_none() {
        for key in keys.in_progress_sets() {
            tx.zadd(key, args.item_id, args.expiry)?;
        }
        tx.zadd(&keys.scavenger_index, args.item_id, args.expiry)?;
        refresh_concurrency_index(tx, &keys.concurrency_index, &keys.scavenger_index, args.partition_id)?;
    }
    Ok((OK, item.capacity_lease))
}
