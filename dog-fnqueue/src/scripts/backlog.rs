use crate::gcra::{self, GcraParams};
use crate::store::{StoreResult, Txn};
use crate::types::{QueueItem, QueuePartition};

use super::{
    encode, lower_partition_pointers, read_field, refresh_backlog_pointers,
    refresh_shadow_pointers, BacklogKeys, ItemKeys,
};

pub(crate) const REFILL_OK: i64 = 0;
pub(crate) const REFILL_ACCOUNT_LIMIT: i64 = 1;
pub(crate) const REFILL_FUNCTION_LIMIT: i64 = 2;
pub(crate) const REFILL_CUSTOM_KEY_1_LIMIT: i64 = 3;
pub(crate) const REFILL_CUSTOM_KEY_2_LIMIT: i64 = 4;
pub(crate) const REFILL_THROTTLED: i64 = 5;

pub(crate) const REQUEUE_OK: i64 = 0;
pub(crate) const REQUEUE_EMPTY: i64 = 1;
pub(crate) const REQUEUE_NOT_FOUND: i64 = -1;

pub(crate) const NORMALIZE_OK: i64 = 1;
pub(crate) const NORMALIZE_GARBAGE_COLLECTED: i64 = -1;

/// An item the refill may move, with its run scoped keys.
#[derive(Debug, Clone)]
pub(crate) struct RefillCandidate {
    pub item_id: String,
    pub keys: ItemKeys,
}

/// Limits a refill respects. `-1` disables a check.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RefillLimits {
    pub account: i64,
    pub function: i64,
    pub custom: [i64; 2],
    pub throttle: Option<GcraParams>,
}

pub(crate) struct RefillArgs<'a> {
    pub backlog: &'a BacklogKeys,
    /// Keys shared by every item of the backlog
    pub shared: &'a ItemKeys,
    pub candidates: &'a [RefillCandidate],
    pub partition_id: &'a str,
    pub account_id: Option<String>,
    pub until: i64,
    pub now: i64,
    pub max: i64,
    pub limits: RefillLimits,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RefillOutcome {
    pub status: i64,
    pub refilled: Vec<String>,
    /// Items due in the backlog before the refill
    pub backlog_count_until: i64,
    pub total_backlog_count: i64,
    pub capacity: i64,
    /// How many items the refill meant to move
    pub refill: i64,
    /// Earliest time a throttled backlog admits another item
    pub retry_at: i64,
}

/// Moves due items from a backlog into the partition's ready set while
/// capacity remains.
pub(crate) fn refill(tx: &mut dyn Txn, args: &RefillArgs<'_>) -> StoreResult<RefillOutcome> {
    let bk = args.backlog;
    let keys = args.shared;
    let count_until = tx.zcount(&bk.backlog_set, i64::MIN, args.until)? as i64;
    let total = tx.zcard(&bk.backlog_set)? as i64;

    let mut capacity = i64::MAX;
    let mut status = REFILL_OK;
    let mut constrain = |left: i64, code: i64| {
        if left < capacity {
            capacity = left;
            status = code;
        }
    };

    if let Some(account) = &keys.active_account {
        if args.limits.account >= 0 {
            constrain(args.limits.account - tx.scard(account)? as i64, REFILL_ACCOUNT_LIMIT);
        }
    }
    if args.limits.function >= 0 {
        constrain(
            args.limits.function - tx.scard(&keys.active_partition)? as i64,
            REFILL_FUNCTION_LIMIT,
        );
    }
    let custom_codes = [REFILL_CUSTOM_KEY_1_LIMIT, REFILL_CUSTOM_KEY_2_LIMIT];
    for ((key, limit), code) in keys.active_custom.iter().zip(args.limits.custom).zip(custom_codes) {
        if let (Some(key), true) = (key, limit >= 0) {
            constrain(limit - tx.scard(key)? as i64, code);
        }
    }

    let mut retry_at = 0;
    if let (Some(params), Some(key)) = (&args.limits.throttle, &keys.throttle) {
        let left = gcra::capacity(tx, key, args.now, params)?;
        if left <= 0 {
            retry_at = gcra::retry_at(tx, key, args.now, params)?;
        }
        constrain(left, REFILL_THROTTLED);
    }

    let capacity = capacity.max(0);
    let want = args.max.min(count_until);
    let status = if capacity < want { status } else { REFILL_OK };
    let take = want.min(capacity);

    let mut refilled = Vec::new();
    for candidate in args.candidates {
        if refilled.len() as i64 >= take {
            break;
        }
        let id = candidate.item_id.as_str();
        let Some(score) = tx.zscore(&bk.backlog_set, id)? else {
            continue;
        };
        if score > args.until {
            continue;
        }
        let Some(mut item) = read_field::<QueueItem>(tx, &keys.queue_item, id)? else {
            tx.zrem(&bk.backlog_set, id)?;
            continue;
        };

        item.refilled_from = Some(bk.backlog_id.clone());
        item.refilled_at_ms = Some(args.now);
        tx.hset(&keys.queue_item, id, &encode(&item)?)?;
        tx.zrem(&bk.backlog_set, id)?;
        tx.zadd(&keys.ready_set, id, score)?;

        let run_id = item.run_id().to_string();
        for key in keys.active_sets() {
            tx.sadd(key, id)?;
        }
        tx.sadd(&candidate.keys.run_active, id)?;
        for key in keys.active_runs_sets() {
            tx.sadd(key, &run_id)?;
        }
        refilled.push(candidate.item_id.clone());
    }

    if !refilled.is_empty() {
        if let (Some(params), Some(key)) = (&args.limits.throttle, &keys.throttle) {
            let decision = gcra::consume(tx, key, args.now, params, refilled.len() as i64)?;
            if !decision.allowed {
                retry_at = decision.retry_at;
            }
        }

        if let Some(partition) = read_field::<QueuePartition>(tx, &keys.partition_item, args.partition_id)? {
            if let Some((_, earliest)) = tx.zmin(&keys.ready_set)? {
                lower_partition_pointers(tx, keys, &partition, earliest.max(args.now), args.now)?;
            }
        }
    }

    refresh_backlog_pointers(tx, bk, args.partition_id, args.account_id.as_deref(), args.now)?;

    Ok(RefillOutcome {
        status,
        refilled,
        backlog_count_until: count_until,
        total_backlog_count: total,
        capacity,
        refill: take,
        retry_at,
    })
}

/// Re-scores a backlog in its shadow partition, dropping it when empty.
pub(crate) fn backlog_requeue(
    tx: &mut dyn Txn,
    bk: &BacklogKeys,
    partition_id: &str,
    account_id: Option<&str>,
    at: i64,
    now: i64,
) -> StoreResult<i64> {
    if !tx.hexists(&bk.backlog_meta, &bk.backlog_id)? {
        return Ok(REQUEUE_NOT_FOUND);
    }
    if tx.zcard(&bk.backlog_set)? == 0 {
        tx.zrem(&bk.shadow_set, &bk.backlog_id)?;
        tx.hdel(&bk.backlog_meta, &bk.backlog_id)?;
        refresh_shadow_pointers(tx, bk, partition_id, account_id, now)?;
        return Ok(REQUEUE_EMPTY);
    }
    tx.zadd(&bk.shadow_set, &bk.backlog_id, at)?;
    refresh_shadow_pointers(tx, bk, partition_id, account_id, now)?;
    Ok(REQUEUE_OK)
}

/// Keys of the normalization indexes.
#[derive(Debug, Clone)]
pub(crate) struct NormalizeKeys {
    pub partition_normalize: String,
    pub account_normalize: Option<String>,
    pub global_account_normalize: String,
}

/// Takes a backlog out of refill rotation and queues it for normalization.
pub(crate) fn prepare_normalize(
    tx: &mut dyn Txn,
    bk: &BacklogKeys,
    nk: &NormalizeKeys,
    partition_id: &str,
    account_id: Option<&str>,
    now: i64,
) -> StoreResult<i64> {
    if tx.zcard(&bk.backlog_set)? == 0 {
        tx.zrem(&bk.shadow_set, &bk.backlog_id)?;
        tx.hdel(&bk.backlog_meta, &bk.backlog_id)?;
        refresh_shadow_pointers(tx, bk, partition_id, account_id, now)?;
        return Ok(NORMALIZE_GARBAGE_COLLECTED);
    }

    tx.zrem(&bk.shadow_set, &bk.backlog_id)?;
    tx.zadd(&nk.partition_normalize, &bk.backlog_id, now)?;
    if let (Some(account_normalize), Some(account)) = (&nk.account_normalize, account_id) {
        tx.zadd_min(account_normalize, partition_id, now)?;
        tx.zadd_min(&nk.global_account_normalize, account, now)?;
    }
    refresh_shadow_pointers(tx, bk, partition_id, account_id, now)?;
    Ok(NORMALIZE_OK)
}

/// Clears a backlog from the normalization indexes once it drained.
pub(crate) fn finish_normalize(
    tx: &mut dyn Txn,
    bk: &BacklogKeys,
    nk: &NormalizeKeys,
    partition_id: &str,
    account_id: Option<&str>,
) -> StoreResult<bool> {
    if tx.zcard(&bk.backlog_set)? > 0 {
        return Ok(false);
    }
    tx.hdel(&bk.backlog_meta, &bk.backlog_id)?;
    tx.zrem(&nk.partition_normalize, &bk.backlog_id)?;
    if tx.zcard(&nk.partition_normalize)? == 0 {
        if let (Some(account_normalize), Some(account)) = (&nk.account_normalize, account_id) {
            tx.zrem(account_normalize, partition_id)?;
            if tx.zcard(account_normalize)? == 0 {
                tx.zrem(&nk.global_account_normalize, account)?;
            }
        }
    }
    Ok(true)
}
