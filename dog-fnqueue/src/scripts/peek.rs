use crate::store::{StoreResult, Txn};

pub(crate) struct PeekArgs {
    pub until: i64,
    pub limit: usize,
    /// Start at a random offset derived from this seed instead of the head
    pub random_seed: Option<u64>,
}

/// Item ids in a ready set scored at or before `until`, with raw records.
pub(crate) fn peek(
    tx: &mut dyn Txn,
    queue_item: &str,
    ready_set: &str,
    args: &PeekArgs,
) -> StoreResult<Vec<(String, Option<String>)>> {
    let offset = match args.random_seed {
        Some(seed) => {
            let due = tx.zcount(ready_set, i64::MIN, args.until)?;
            if due == 0 {
                return Ok(Vec::new());
            }
            let window = due.saturating_sub(args.limit) + 1;
            (seed % window as u64) as usize
        }
        None => 0,
    };
    index_records(tx, queue_item, ready_set, (i64::MIN, args.until), offset, args.limit)
}

/// Members of a sorted index within `range`, each with its raw record from
/// the hash at `records`.
pub(crate) fn index_records(
    tx: &mut dyn Txn,
    records: &str,
    index: &str,
    range: (i64, i64),
    offset: usize,
    limit: usize,
) -> StoreResult<Vec<(String, Option<String>)>> {
    let ids: Vec<String> = tx
        .zrange_by_score(index, range.0, range.1, offset, Some(limit))?
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    let raw = tx.hmget(records, &ids)?;
    Ok(ids.into_iter().zip(raw).collect())
}

/// Members of a pointer index scored at or before `until`.
pub(crate) fn index_peek(
    tx: &mut dyn Txn,
    index: &str,
    until: i64,
    limit: usize,
) -> StoreResult<Vec<(String, i64)>> {
    tx.zrange_by_score(index, i64::MIN, until, 0, Some(limit))
}

/// Drops ids that no longer have a record from the given sorted sets.
pub(crate) fn remove_dangling(
    tx: &mut dyn Txn,
    queue_item: &str,
    sets: &[String],
    ids: &[String],
) -> StoreResult<usize> {
    let mut removed = 0;
    for id in ids {
        if tx.hexists(queue_item, id)? {
            continue;
        }
        for set in sets {
            if tx.zrem(set, id)? {
                removed += 1;
            }
        }
    }
    Ok(removed)
}
