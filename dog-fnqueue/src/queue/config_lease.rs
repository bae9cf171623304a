use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};
use ulid::Ulid;

use super::Queue;
use crate::clock::duration_ms;
use crate::error::{QueueError, QueueResult};
use crate::scripts::config_lease;
use crate::store::Store;
use crate::types::{is_lease_valid, new_lease_id};

/// Cluster-wide singleton duties, each guarded by its own config lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigLeaseRole {
    /// Scans partitions in pointer order instead of shuffled
    Sequential,
    Scavenger,
    Instrumentation,
    ActiveChecker,
}

impl ConfigLeaseRole {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Scavenger => "scavenger",
            Self::Instrumentation => "instrument",
            Self::ActiveChecker => "active-checker",
        }
    }
}

/// The lease id this worker holds for one role, if any.
#[derive(Debug)]
pub struct ConfigLeaseHolder {
    role: ConfigLeaseRole,
    current: Mutex<Option<Ulid>>,
}

impl ConfigLeaseHolder {
    pub fn new(role: ConfigLeaseRole) -> Self {
        Self {
            role,
            current: Mutex::new(None),
        }
    }

    pub fn role(&self) -> ConfigLeaseRole {
        self.role
    }

    pub fn current(&self) -> Option<Ulid> {
        *self.current.lock()
    }

    /// Whether the held lease is still valid at `now_ms`.
    pub fn is_held(&self, now_ms: i64) -> bool {
        self.current().is_some_and(|l| is_lease_valid(&l, now_ms))
    }

    /// Claims the lease, or renews the one already held. Returns `false`
    /// when another worker holds it.
    pub async fn renew<S: Store>(&self, queue: &Queue<S>, duration: Duration) -> QueueResult<bool> {
        let existing = self.current();
        match queue.config_lease(self.role, duration, existing).await {
            Ok(lease) => {
                if existing.is_none() {
                    debug!(role = self.role.name(), "claimed config lease");
                }
                *self.current.lock() = Some(lease);
                Ok(true)
            }
            Err(QueueError::ConfigAlreadyLeased) => {
                trace!(role = self.role.name(), "config lease held elsewhere");
                *self.current.lock() = None;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

impl<S: Store> Queue<S> {
    /// Claims a config lease, or renews `existing` when it is the one held.
    pub async fn config_lease(
        &self,
        role: ConfigLeaseRole,
        duration: Duration,
        existing: Option<Ulid>,
    ) -> QueueResult<Ulid> {
        let ttl_ms = duration_ms(duration);
        let max_ms = duration_ms(self.config.config_lease_max);
        if ttl_ms > max_ms {
            return Err(QueueError::ConfigLeaseExceedsLimits { max_ms });
        }

        let now = self.now_ms();
        let next = new_lease_id(now + ttl_ms);
        let key = self.kg.config_lease(role.name());
        let code = self
            .run("configLease", |tx| {
                config_lease::config_lease(tx, &key, existing, next, now, ttl_ms)
            })
            .await?;

        match code {
            config_lease::OK => Ok(next),
            config_lease::ALREADY_LEASED => Err(QueueError::ConfigAlreadyLeased),
            code => Err(QueueError::UnknownResponse { script: "configLease", code }),
        }
    }
}
