use ulid::Ulid;

use crate::store::{StoreResult, Txn};
use crate::types::is_lease_valid;

pub(crate) const OK: i64 = 0;
pub(crate) const ALREADY_LEASED: i64 = 1;

/// Claims or renews a named lease. A caller renewing must pass the lease it
/// holds; anyone may claim an expired lease.
pub(crate) fn config_lease(
    tx: &mut dyn Txn,
    key: &str,
    current: Option<Ulid>,
    next: Ulid,
    now: i64,
    ttl_ms: i64,
) -> StoreResult<i64> {
    let held = tx.get(key)?.and_then(|raw| raw.parse::<Ulid>().ok());
    if let Some(held) = held {
        if is_lease_valid(&held, now) && Some(held) != current {
            return Ok(ALREADY_LEASED);
        }
    }
    tx.set(key, &next.to_string(), Some(ttl_ms))?;
    Ok(OK)
}
