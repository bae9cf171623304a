use ulid::Ulid;
use uuid::Uuid;

use crate::keys::KeyGenerator;
use crate::store::{StoreResult, Txn};
use crate::types::QueueShadowPartition;

use super::{encode, read_field, set_to_min_of, BacklogKeys};

pub(crate) const OK: i64 = 0;
pub(crate) const NOT_FOUND: i64 = -1;
/// Lease already held when leasing, lease missing when extending or requeueing
pub(crate) const LEASE_CONFLICT: i64 = -2;

/// Keys of a shadow partition's pointers.
#[derive(Debug, Clone)]
pub(crate) struct ShadowKeys {
    pub shadow_meta: String,
    pub shadow_set: String,
    pub global_shadow_set: String,
    pub account_shadows: Option<String>,
    pub global_account_shadows: String,
}

impl ShadowKeys {
    pub fn new(kg: &KeyGenerator, partition_id: &str, account_id: Option<Uuid>) -> Self {
        Self {
            shadow_meta: kg.shadow_partition_meta(),
            shadow_set: kg.shadow_partition_set(partition_id),
            global_shadow_set: kg.global_shadow_partition_set(),
            account_shadows: account_id.map(|a| kg.account_shadow_partitions(a)),
            global_account_shadows: kg.global_account_shadow_partitions(),
        }
    }
}

impl From<&BacklogKeys> for ShadowKeys {
    fn from(bk: &BacklogKeys) -> Self {
        Self {
            shadow_meta: bk.shadow_meta.clone(),
            shadow_set: bk.shadow_set.clone(),
            global_shadow_set: bk.global_shadow_set.clone(),
            account_shadows: bk.account_shadows.clone(),
            global_account_shadows: bk.global_account_shadows.clone(),
        }
    }
}

fn point_at(
    tx: &mut dyn Txn,
    keys: &ShadowKeys,
    sp: &QueueShadowPartition,
    score: i64,
    existing_only: bool,
) -> StoreResult<()> {
    let pid = sp.partition_id.as_str();
    if existing_only {
        tx.zadd_existing(&keys.global_shadow_set, pid, score)?;
    } else {
        tx.zadd(&keys.global_shadow_set, pid, score)?;
    }
    if let (Some(account_shadows), Some(account)) = (&keys.account_shadows, sp.account_id) {
        if existing_only {
            tx.zadd_existing(account_shadows, pid, score)?;
        } else {
            tx.zadd(account_shadows, pid, score)?;
        }
        set_to_min_of(tx, &keys.global_account_shadows, &account.to_string(), account_shadows)?;
    }
    Ok(())
}

pub(crate) fn shadow_lease(
    tx: &mut dyn Txn,
    keys: &ShadowKeys,
    partition_id: &str,
    lease_id: Ulid,
    expiry: i64,
    now: i64,
) -> StoreResult<i64> {
    let Some(mut sp) = read_field::<QueueShadowPartition>(tx, &keys.shadow_meta, partition_id)? else {
        return Ok(NOT_FOUND);
    };
    if sp.is_leased(now) {
        return Ok(LEASE_CONFLICT);
    }
    sp.lease_id = Some(lease_id);
    tx.hset(&keys.shadow_meta, partition_id, &encode(&sp)?)?;
    point_at(tx, keys, &sp, expiry, true)?;
    Ok(OK)
}

pub(crate) fn shadow_extend(
    tx: &mut dyn Txn,
    keys: &ShadowKeys,
    partition_id: &str,
    current: Ulid,
    next: Ulid,
    expiry: i64,
    now: i64,
) -> StoreResult<i64> {
    let Some(mut sp) = read_field::<QueueShadowPartition>(tx, &keys.shadow_meta, partition_id)? else {
        return Ok(NOT_FOUND);
    };
    if sp.lease_id != Some(current) || !sp.is_leased(now) {
        return Ok(LEASE_CONFLICT);
    }
    sp.lease_id = Some(next);
    tx.hset(&keys.shadow_meta, partition_id, &encode(&sp)?)?;
    point_at(tx, keys, &sp, expiry, true)?;
    Ok(OK)
}

/// Releases the lease and points the partition at `at`, or at its earliest
/// backlog when `at` is `None`.
pub(crate) fn shadow_requeue(
    tx: &mut dyn Txn,
    keys: &ShadowKeys,
    partition_id: &str,
    current: Ulid,
    at: Option<i64>,
) -> StoreResult<i64> {
    let Some(mut sp) = read_field::<QueueShadowPartition>(tx, &keys.shadow_meta, partition_id)? else {
        return Ok(NOT_FOUND);
    };
    if sp.lease_id != Some(current) {
        return Ok(LEASE_CONFLICT);
    }
    sp.lease_id = None;
    tx.hset(&keys.shadow_meta, partition_id, &encode(&sp)?)?;

    let score = match (at, tx.zmin(&keys.shadow_set)?) {
        (_, None) => None,
        (Some(at), Some(_)) => Some(at),
        (None, Some((_, earliest))) => Some(earliest),
    };
    match score {
        Some(score) => point_at(tx, keys, &sp, score, false)?,
        None => {
            tx.zrem(&keys.global_shadow_set, partition_id)?;
            if let (Some(account_shadows), Some(account)) = (&keys.account_shadows, sp.account_id) {
                tx.zrem(account_shadows, partition_id)?;
                set_to_min_of(tx, &keys.global_account_shadows, &account.to_string(), account_shadows)?;
            }
        }
    }
    Ok(OK)
}
