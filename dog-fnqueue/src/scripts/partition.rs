use ulid::Ulid;

use crate::keys::KeyGenerator;
use crate::store::{StoreResult, Txn};
use crate::types::{is_lease_valid, FnMetadata, QueuePartition};

use super::{decode, encode, in_progress, read_field, refresh_concurrency_index, set_to_min_of};

pub(crate) const LEASE_OK: i64 = 0;
pub(crate) const LEASE_PARTITION_LIMIT: i64 = -1;
pub(crate) const LEASE_NOT_FOUND: i64 = -2;
pub(crate) const LEASE_ALREADY_LEASED: i64 = -3;
pub(crate) const LEASE_PAUSED: i64 = -4;
pub(crate) const LEASE_ACCOUNT_LIMIT: i64 = -5;

pub(crate) const REQUEUE_OK: i64 = 0;
pub(crate) const REQUEUE_NOT_FOUND: i64 = 1;
pub(crate) const REQUEUE_GARBAGE_COLLECTED: i64 = 2;

/// Keys touched when leasing or requeueing a partition.
#[derive(Debug, Clone)]
pub(crate) struct PartitionKeys {
    pub partition_item: String,
    pub global_partition_index: String,
    pub account_partition_index: Option<String>,
    pub global_account_index: String,
    pub ready_set: String,
    pub in_progress_partition: String,
    pub in_progress_account: Option<String>,
    pub shadow_set: String,
    pub shadow_meta: String,
    pub fn_metadata: Option<String>,
}

impl PartitionKeys {
    pub fn new(kg: &KeyGenerator, partition: &QueuePartition) -> Self {
        let account = (!partition.is_system()).then_some(partition.account_id);
        Self {
            partition_item: kg.partition_item(),
            global_partition_index: kg.global_partition_index(),
            account_partition_index: account.map(|a| kg.account_partition_index(a)),
            global_account_index: kg.global_account_index(),
            ready_set: kg.ready_set(&partition.id),
            in_progress_partition: kg.in_progress_partition(&partition.id),
            in_progress_account: account.map(|a| kg.in_progress_account(a)),
            shadow_set: kg.shadow_partition_set(&partition.id),
            shadow_meta: kg.shadow_partition_meta(),
            fn_metadata: partition.function_id.map(|f| kg.fn_metadata(f)),
        }
    }

    fn account_member(&self, partition: &QueuePartition) -> String {
        partition.account_id.to_string()
    }
}

pub(crate) struct PartitionLeaseArgs<'a> {
    pub partition_id: &'a str,
    pub lease_id: Ulid,
    pub expiry: i64,
    pub now: i64,
    pub check_constraints: bool,
    pub account_limit: i64,
    pub partition_limit: i64,
}

/// Returns the result code and the remaining capacity, `-1` when unbounded.
pub(crate) fn partition_lease(
    tx: &mut dyn Txn,
    keys: &PartitionKeys,
    args: &PartitionLeaseArgs<'_>,
) -> StoreResult<(i64, i64)> {
    let Some(mut partition) = read_field::<QueuePartition>(tx, &keys.partition_item, args.partition_id)? else {
        return Ok((LEASE_NOT_FOUND, 0));
    };
    if partition.is_leased(args.now) {
        return Ok((LEASE_ALREADY_LEASED, 0));
    }
    if let Some(meta_key) = &keys.fn_metadata {
        if let Some(raw) = tx.get(meta_key)? {
            if decode::<FnMetadata>(meta_key, &raw)?.off {
                return Ok((LEASE_PAUSED, 0));
            }
        }
    }

    let mut capacity = -1;
    if args.check_constraints {
        if let Some(account) = &keys.in_progress_account {
            if args.account_limit >= 0 {
                let used = in_progress(tx, account, args.now)?;
                if used >= args.account_limit {
                    return Ok((LEASE_ACCOUNT_LIMIT, 0));
                }
                capacity = args.account_limit - used;
            }
        }
        if args.partition_limit >= 0 {
            let used = in_progress(tx, &keys.in_progress_partition, args.now)?;
            if used >= args.partition_limit {
                return Ok((LEASE_PARTITION_LIMIT, 0));
            }
            let left = args.partition_limit - used;
            capacity = if capacity < 0 { left } else { capacity.min(left) };
        }
    }

    partition.lease_id = Some(args.lease_id);
    partition.last_leased_ms = args.now;
    tx.hset(&keys.partition_item, args.partition_id, &encode(&partition)?)?;

    tx.zadd_existing(&keys.global_partition_index, args.partition_id, args.expiry)?;
    if let Some(account_index) = &keys.account_partition_index {
        tx.zadd_existing(account_index, args.partition_id, args.expiry)?;
        set_to_min_of(
            tx,
            &keys.global_account_index,
            &keys.account_member(&partition),
            account_index,
        )?;
    }
    Ok((LEASE_OK, capacity))
}

pub(crate) struct PartitionRequeueArgs<'a> {
    pub partition_id: &'a str,
    pub at: i64,
    pub now: i64,
    pub force: bool,
}

pub(crate) fn partition_requeue(
    tx: &mut dyn Txn,
    keys: &PartitionKeys,
    args: &PartitionRequeueArgs<'_>,
) -> StoreResult<i64> {
    let pid = args.partition_id;
    let Some(mut partition) = read_field::<QueuePartition>(tx, &keys.partition_item, pid)? else {
        return Ok(REQUEUE_NOT_FOUND);
    };
    let account = keys.account_member(&partition);

    if tx.zcard(&keys.ready_set)? == 0
        && tx.zcard(&keys.in_progress_partition)? == 0
        && tx.zcard(&keys.shadow_set)? == 0
    {
        tx.hdel(&keys.partition_item, pid)?;
        tx.hdel(&keys.shadow_meta, pid)?;
        tx.zrem(&keys.global_partition_index, pid)?;
        if let Some(account_index) = &keys.account_partition_index {
            tx.zrem(account_index, pid)?;
            cleanup_empty_account(tx, &keys.global_account_index, account_index, &account)?;
        }
        return Ok(REQUEUE_GARBAGE_COLLECTED);
    }

    let score = if args.force {
        partition.force_at_ms = args.at;
        args.at
    } else {
        partition.force_at_ms = 0;
        match tx.zmin(&keys.ready_set)? {
            Some((_, earliest)) => args.at.min(earliest.max(args.now)),
            None => args.at,
        }
    };
    partition.lease_id = None;
    tx.hset(&keys.partition_item, pid, &encode(&partition)?)?;

    tx.zadd(&keys.global_partition_index, pid, score)?;
    if let Some(account_index) = &keys.account_partition_index {
        tx.zadd(account_index, pid, score)?;
        set_to_min_of(tx, &keys.global_account_index, &account, account_index)?;
    }
    Ok(REQUEUE_OK)
}

/// Drops an account from the global account index once it has no partitions.
pub(crate) fn cleanup_empty_account(
    tx: &mut dyn Txn,
    global_account_index: &str,
    account_partition_index: &str,
    account: &str,
) -> StoreResult<bool> {
    if tx.zcard(account_partition_index)? == 0 {
        tx.zrem(global_account_index, account)?;
        return Ok(true);
    }
    Ok(false)
}

/// Removes a partition from the concurrency index when its scavenger index
/// is empty, otherwise re-scores it to the earliest expiry.
pub(crate) fn drop_partition_pointer_if_empty(
    tx: &mut dyn Txn,
    concurrency_index: &str,
    scavenger_index: &str,
    partition_id: &str,
) -> StoreResult<bool> {
    refresh_concurrency_index(tx, concurrency_index, scavenger_index, partition_id)?;
    Ok(tx.zscore(concurrency_index, partition_id)?.is_none())
}

/// Which of the given migration lock keys hold an unexpired lock.
pub(crate) fn migration_locks(tx: &mut dyn Txn, keys: &[String], now: i64) -> StoreResult<Vec<bool>> {
    keys.iter()
        .map(|key| {
            Ok(tx
                .get(key)?
                .and_then(|raw| raw.parse::<Ulid>().ok())
                .is_some_and(|lease| is_lease_valid(&lease, now)))
        })
        .collect()
}

/// Rewrites the partition priority.
pub(crate) fn set_priority(
    tx: &mut dyn Txn,
    partition_item: &str,
    partition_id: &str,
    priority: u8,
) -> StoreResult<bool> {
    let Some(mut partition) = read_field::<QueuePartition>(tx, partition_item, partition_id)? else {
        return Ok(false);
    };
    partition.priority = priority;
    tx.hset(partition_item, partition_id, &encode(&partition)?)?;
    Ok(true)
}
