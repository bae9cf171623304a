//! Generic cell rate algorithm used for throttles.
//!
//! The stored state is the theoretical arrival time (TAT) of the next
//! request. With emission interval `T = period / limit` and tolerance
//! `τ = T × (limit + burst)`, a request at `now` is admitted iff
//! `max(tat, now) + T − now ≤ τ`.

use crate::store::{StoreError, StoreResult, Txn};
use crate::types::{Throttle, ThrottleConstraint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcraParams {
    pub limit: i64,
    pub burst: i64,
    pub period_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcraDecision {
    pub allowed: bool,
    /// TAT after the decision; unchanged when rejected
    pub tat: i64,
    /// Earliest time a single request would be admitted
    pub retry_at: i64,
}

impl GcraParams {
    pub fn new(limit: i64, burst: i64, period_secs: i64) -> Self {
        Self {
            limit,
            burst: burst.max(0),
            period_ms: period_secs.saturating_mul(1000),
        }
    }

    pub fn from_throttle(t: &Throttle) -> Self {
        Self::new(t.limit, t.burst, t.period)
    }

    pub fn from_constraint(t: &ThrottleConstraint) -> Self {
        Self::new(t.limit, t.burst, t.period)
    }

    /// Limits of zero or below disable the throttle.
    pub fn is_enabled(&self) -> bool {
        self.limit > 0 && self.period_ms > 0
    }

    pub fn emission_ms(&self) -> i64 {
        (self.period_ms / self.limit.max(1)).max(1)
    }

    pub fn tolerance_ms(&self) -> i64 {
        self.emission_ms()
            .saturating_mul(self.limit.max(1) + self.burst)
    }

    /// Decides whether `quantity` requests at `now` fit.
    pub fn decide(&self, tat: Option<i64>, now: i64, quantity: i64) -> GcraDecision {
        let base = tat.unwrap_or(now).max(now);
        if !self.is_enabled() {
            return GcraDecision {
                allowed: true,
                tat: base,
                retry_at: now,
            };
        }

        let t = self.emission_ms();
        let tau = self.tolerance_ms();
        let new_tat = base + t * quantity.max(1);

        if new_tat - now <= tau {
            GcraDecision {
                allowed: true,
                tat: new_tat,
                retry_at: now,
            }
        } else {
            GcraDecision {
                allowed: false,
                tat: base,
                retry_at: (base + t - tau).max(now),
            }
        }
    }

    /// How many requests would be admitted right now.
    pub fn capacity(&self, tat: Option<i64>, now: i64) -> i64 {
        if !self.is_enabled() {
            return i64::MAX;
        }
        let base = tat.unwrap_or(now).max(now);
        ((self.tolerance_ms() - (base - now)) / self.emission_ms()).max(0)
    }
}

fn read_tat(tx: &mut dyn Txn, key: &str) -> StoreResult<Option<i64>> {
    match tx.get(key)? {
        Some(raw) => raw
            .parse::<i64>()
            .map(Some)
            .map_err(|e| StoreError::invalid(key, e)),
        None => Ok(None),
    }
}

/// Applies GCRA for `quantity` requests, persisting the new TAT when allowed.
pub(crate) fn consume(
    tx: &mut dyn Txn,
    key: &str,
    now: i64,
    params: &GcraParams,
    quantity: i64,
) -> StoreResult<GcraDecision> {
    let tat = read_tat(tx, key)?;
    let decision = params.decide(tat, now, quantity);
    if decision.allowed && params.is_enabled() {
        tx.set(key, &decision.tat.to_string(), Some(decision.tat - now))?;
    }
    Ok(decision)
}

/// How many requests the stored state admits at `now`.
pub(crate) fn capacity(tx: &mut dyn Txn, key: &str, now: i64, params: &GcraParams) -> StoreResult<i64> {
    let tat = read_tat(tx, key)?;
    Ok(params.capacity(tat, now))
}

/// Earliest time the stored state admits a single request.
pub(crate) fn retry_at(tx: &mut dyn Txn, key: &str, now: i64, params: &GcraParams) -> StoreResult<i64> {
    let tat = read_tat(tx, key)?;
    Ok(params.decide(tat, now, 1).retry_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_two_per_minute() {
        let params = GcraParams::new(2, 0, 60);

        let first = params.decide(None, 0, 1);
        assert!(first.allowed);
        let second = params.decide(Some(first.tat), 1_000, 1);
        assert!(second.allowed);
        let third = params.decide(Some(second.tat), 2_000, 1);
        assert!(!third.allowed);
        assert_eq!(third.retry_at, 30_000);

        let later = params.decide(Some(second.tat), 60_000, 1);
        assert!(later.allowed);
    }

    #[test]
    fn test_capacity_matches_decide() {
        let params = GcraParams::new(5, 2, 10);
        assert_eq!(params.capacity(None, 0), 7);

        let after = params.decide(None, 0, 3);
        assert!(after.allowed);
        assert_eq!(params.capacity(Some(after.tat), 0), 4);
    }

    #[test]
    fn test_disabled_throttle_always_allows() {
        let params = GcraParams::new(0, 0, 60);
        assert!(params.decide(Some(i64::MAX / 2), 0, 1).allowed);
        assert_eq!(params.capacity(None, 0), i64::MAX);
    }

    proptest! {
        #[test]
        fn prop_instant_burst_admits_limit_plus_burst(limit in 1i64..50, burst in 0i64..10, period in 1i64..3600) {
            let params = GcraParams::new(limit, burst, period);
            let mut tat = None;
            let mut admitted = 0;
            for _ in 0..(limit + burst + 5) {
                let d = params.decide(tat, 1_000, 1);
                if d.allowed {
                    admitted += 1;
                    tat = Some(d.tat);
                }
            }
            prop_assert_eq!(admitted, limit + burst);
        }
    }
}
