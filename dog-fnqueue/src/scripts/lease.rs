use ulid::Ulid;

use crate::gcra::{self, GcraParams};
use crate::store::{StoreResult, Txn};
use crate::types::{CapacityLease, QueueItem};

use super::{encode, in_progress, mark_active, read_field, refresh_concurrency_index, ItemKeys};

pub(crate) const OK: i64 = 0;
pub(crate) const NOT_FOUND: i64 = -1;
pub(crate) const ALREADY_LEASED: i64 = -2;
pub(crate) const PARTITION_LIMIT: i64 = -3;
pub(crate) const CUSTOM_KEY_1_LIMIT: i64 = -4;
pub(crate) const CUSTOM_KEY_2_LIMIT: i64 = -5;
pub(crate) const ACCOUNT_LIMIT: i64 = -6;
pub(crate) const THROTTLED: i64 = -7;

/// Limits checked by a lease. `-1` disables a concurrency check.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LeaseLimits {
    pub account: i64,
    pub partition: i64,
    pub custom: [i64; 2],
    pub throttle: Option<GcraParams>,
}

pub(crate) struct LeaseArgs<'a> {
    pub item_id: &'a str,
    pub partition_id: &'a str,
    pub lease_id: Ulid,
    pub expiry: i64,
    pub now: i64,
    pub check_constraints: bool,
    pub limits: LeaseLimits,
    /// Key that turns a retried lease into a no-op check, with its TTL
    pub fallback_idempotency: Option<(String, i64)>,
    pub capacity_lease: Option<CapacityLease>,
}

pub(crate) fn lease(tx: &mut dyn Txn, keys: &ItemKeys, args: &LeaseArgs<'_>) -> StoreResult<i64> {
    let Some(mut item) = read_field::<QueueItem>(tx, &keys.queue_item, args.item_id)? else {
        return Ok(NOT_FOUND);
    };
    if item.is_leased(args.now) {
        return Ok(ALREADY_LEASED);
    }

    let mut check = args.check_constraints;
    if let Some((key, _)) = &args.fallback_idempotency {
        if tx.exists(key)? {
            check = false;
        }
    }

    if check {
        if let Some(code) = check_limits(tx, keys, &item, args)? {
            return Ok(code);
        }
    }

    if let Some((key, ttl)) = &args.fallback_idempotency {
        tx.set(key, "1", Some(*ttl))?;
    }

    item.lease_id = Some(args.lease_id);
    if args.capacity_lease.is_some() {
        item.capacity_lease = args.capacity_lease;
    }
    tx.hset(&keys.queue_item, args.item_id, &encode(&item)?)?;
    tx.zrem(&keys.ready_set, args.item_id)?;

    if item.capacity_lease.is_none() {
        for key in keys.in_progress_sets() {
            tx.zadd(key, args.item_id, args.expiry)?;
        }
        tx.zadd(&keys.scavenger_index, args.item_id, args.expiry)?;
        refresh_concurrency_index(tx, &keys.concurrency_index, &keys.scavenger_index, args.partition_id)?;
    }

    mark_active(tx, keys, args.item_id, &item.run_id().to_string())?;
    Ok(OK)
}

fn check_limits(
    tx: &mut dyn Txn,
    keys: &ItemKeys,
    item: &QueueItem,
    args: &LeaseArgs<'_>,
) -> StoreResult<Option<i64>> {
    let limits = &args.limits;

    if let Some(account) = &keys.in_progress_account {
        if limits.account >= 0 && in_progress(tx, account, args.now)? >= limits.account {
            return Ok(Some(ACCOUNT_LIMIT));
        }
    }

    if limits.partition >= 0
        && in_progress(tx, &keys.in_progress_partition, args.now)? >= limits.partition
    {
        return Ok(Some(PARTITION_LIMIT));
    }

    let codes = [CUSTOM_KEY_1_LIMIT, CUSTOM_KEY_2_LIMIT];
    for ((key, limit), code) in keys.in_progress_custom.iter().zip(limits.custom).zip(codes) {
        let Some(key) = key else { continue };
        if limit >= 0 && in_progress(tx, key, args.now)? >= limit {
            return Ok(Some(code));
        }
    }

    // Refill already counted items that came through a backlog.
    let throttled = item.is_start() && item.refilled_from.is_none();
    if let (Some(params), Some(key), true) = (&limits.throttle, &keys.throttle, throttled) {
        if !gcra::consume(tx, key, args.now, params, 1)?.allowed {
            return Ok(Some(THROTTLED));
        }
    }

    Ok(None)
}
