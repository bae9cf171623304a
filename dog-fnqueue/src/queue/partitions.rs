use std::time::Duration;

use tracing::{debug, instrument};
use ulid::Ulid;
use uuid::Uuid;

use super::Queue;
use crate::clock::duration_ms;
use crate::config::constants::{
    ACCOUNT_PEEK_MAX, PARTITION_PEEK_MAX, PARTITION_SELECTION_MAX, PRIORITY_MAX, PRIORITY_MIN,
};
use crate::constraints::partition_limits;
use crate::error::{QueueError, QueueResult};
use crate::scripts::partition::{
    self, PartitionKeys, PartitionLeaseArgs, PartitionRequeueArgs,
};
use crate::scripts::{decode, maintenance, peek, read_field};
use crate::shuffle::{priority_weight, weighted_shuffle};
use crate::store::Store;
use crate::types::{new_lease_id, FnMetadata, QueuePartition};

/// A granted partition lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLease {
    pub lease_id: Ulid,
    /// Items that may still be leased right now, `None` when unbounded
    pub capacity: Option<i64>,
}

impl<S: Store> Queue<S> {
    /// Leases a partition for scanning. Checks the partition and account
    /// limits first so a worker does not peek a partition it cannot lease
    /// from.
    #[instrument(skip(self, p), fields(partition = %p.id))]
    pub async fn partition_lease(
        &self,
        p: &QueuePartition,
        duration: Duration,
    ) -> QueueResult<PartitionLease> {
        let now = self.now_ms();
        let expiry = now + duration_ms(duration);
        let lease_id = new_lease_id(expiry);

        let config = self.partition_constraints(&p.id);
        let (account_limit, partition_limit) =
            partition_limits(&config, p.is_system(), self.config.default_concurrency);
        let keys = PartitionKeys::new(&self.kg, p);
        let args = PartitionLeaseArgs {
            partition_id: &p.id,
            lease_id,
            expiry,
            now,
            check_constraints: !self.disable_lease_checks.disable(p.account_id),
            account_limit,
            partition_limit,
        };
        let (code, capacity) = self
            .run("partitionLease", |tx| partition::partition_lease(tx, &keys, &args))
            .await?;

        match code {
            partition::LEASE_OK => Ok(PartitionLease {
                lease_id,
                capacity: (capacity >= 0).then_some(capacity),
            }),
            partition::LEASE_PARTITION_LIMIT if p.is_system() => {
                Err(QueueError::SystemConcurrencyLimit {
                    key: keys.in_progress_partition,
                })
            }
            partition::LEASE_PARTITION_LIMIT => Err(QueueError::PartitionConcurrencyLimit {
                key: keys.in_progress_partition,
            }),
            partition::LEASE_ACCOUNT_LIMIT => Err(QueueError::AccountConcurrencyLimit {
                key: keys.in_progress_account.unwrap_or_default(),
            }),
            partition::LEASE_NOT_FOUND => Err(QueueError::PartitionNotFound),
            partition::LEASE_ALREADY_LEASED => Err(QueueError::PartitionAlreadyLeased),
            partition::LEASE_PAUSED => Err(QueueError::PartitionPaused),
            code => Err(QueueError::UnknownResponse { script: "partitionLease", code }),
        }
    }

    /// Releases a partition lease and schedules the next scan at `at_ms`.
    ///
    /// With `force` the partition is held back until exactly `at_ms`, even
    /// if earlier items are ready. Empty partitions are deleted.
    #[instrument(skip(self, p), fields(partition = %p.id))]
    pub async fn partition_requeue(&self, p: &QueuePartition, at_ms: i64, force: bool) -> QueueResult<()> {
        let keys = PartitionKeys::new(&self.kg, p);
        let args = PartitionRequeueArgs {
            partition_id: &p.id,
            at: at_ms,
            now: self.now_ms(),
            force,
        };
        let code = self
            .run("partitionRequeue", |tx| partition::partition_requeue(tx, &keys, &args))
            .await?;

        match code {
            partition::REQUEUE_OK => Ok(()),
            partition::REQUEUE_NOT_FOUND => Err(QueueError::PartitionNotFound),
            partition::REQUEUE_GARBAGE_COLLECTED => {
                debug!("Garbage collected empty partition {}", p.id);
                Err(QueueError::PartitionGarbageCollected)
            }
            code => Err(QueueError::UnknownResponse { script: "partitionRequeue", code }),
        }
    }

    /// Partitions due by `until_ms` from the global pointer.
    pub async fn partition_peek(
        &self,
        sequential: bool,
        until_ms: i64,
        limit: i64,
    ) -> QueueResult<Vec<QueuePartition>> {
        let index = self.kg.global_partition_index();
        self.peek_partitions(&index, None, sequential, until_ms, limit).await
    }

    /// Partitions of one account due by `until_ms`.
    pub async fn account_partition_peek(
        &self,
        account_id: Uuid,
        sequential: bool,
        until_ms: i64,
        limit: i64,
    ) -> QueueResult<Vec<QueuePartition>> {
        let index = self.kg.account_partition_index(account_id);
        self.peek_partitions(&index, Some(account_id), sequential, until_ms, limit)
            .await
    }

    async fn peek_partitions(
        &self,
        index: &str,
        account_id: Option<Uuid>,
        sequential: bool,
        until_ms: i64,
        limit: i64,
    ) -> QueueResult<Vec<QueuePartition>> {
        if limit > PARTITION_PEEK_MAX {
            return Err(QueueError::PartitionPeekMaxExceedsLimits {
                limit,
                max: PARTITION_PEEK_MAX,
            });
        }
        let limit = if limit <= 0 { PARTITION_PEEK_MAX } else { limit } as usize;

        let partition_item = self.kg.partition_item();
        let rows = self
            .run("partitionPeek", |tx| {
                peek::index_records(tx, &partition_item, index, (i64::MIN, until_ms), 0, limit)
            })
            .await?;

        let mut missing = Vec::new();
        let mut partitions = Vec::with_capacity(rows.len());
        for (id, raw) in rows {
            match raw {
                Some(raw) => partitions.push(decode::<QueuePartition>(&partition_item, &raw)?),
                None if account_id.is_none() => return Err(QueueError::MissingPartition(id)),
                None => missing.push(id),
            }
        }

        if !missing.is_empty() {
            // Left behind in account pointers by older executors.
            self.metrics.increment_partition_gone();
            self.heal_dangling(partition_item.clone(), vec![index.to_string()], missing);
        }

        let migration_keys: Vec<String> = partitions
            .iter()
            .map(|p| p.function_id.map(|f| self.kg.migration_lock(f)).unwrap_or_default())
            .collect();
        let now = self.now_ms();
        let locked = self
            .run("partitionMigrationLocks", |tx| {
                partition::migration_locks(tx, &migration_keys, now)
            })
            .await?;

        let partitions: Vec<QueuePartition> = partitions
            .into_iter()
            .zip(locked)
            .filter(|(p, locked)| {
                if *locked || p.is_forced_after(until_ms) {
                    return false;
                }
                if p.function_id.is_some_and(|f| self.paused.paused(f).paused) {
                    return false;
                }
                self.config.is_queue_allowed(p.queue_name_or_id())
            })
            .map(|(p, _)| p)
            .collect();

        if sequential {
            let n = partitions.len().min(PARTITION_SELECTION_MAX as usize);
            return Ok(partitions.into_iter().take(n).collect());
        }
        Ok(weighted_shuffle(partitions, |p| {
            priority_weight(self.partition_priority.priority(p))
        }))
    }

    /// Accounts with due partitions, weighted by account priority.
    pub async fn account_peek(
        &self,
        sequential: bool,
        until_ms: i64,
        limit: i64,
    ) -> QueueResult<Vec<Uuid>> {
        if limit > ACCOUNT_PEEK_MAX {
            return Err(QueueError::AccountPeekMaxExceedsLimits {
                limit,
                max: ACCOUNT_PEEK_MAX,
            });
        }
        let limit = if limit <= 0 { ACCOUNT_PEEK_MAX } else { limit } as usize;

        let index = self.kg.global_account_index();
        let rows = self
            .run("accountPeek", |tx| peek::index_peek(tx, &index, until_ms, limit))
            .await?;
        let accounts: Vec<Uuid> = rows
            .into_iter()
            .filter_map(|(member, _)| member.parse::<Uuid>().ok())
            .collect();

        if sequential {
            return Ok(accounts);
        }
        Ok(weighted_shuffle(accounts, |a| {
            priority_weight(self.account_priority.priority(*a))
        }))
    }

    /// Stores a new priority on the partition record.
    pub async fn partition_reprioritize(&self, partition_id: &str, priority: i64) -> QueueResult<()> {
        if priority < i64::from(PRIORITY_MAX) {
            return Err(QueueError::PriorityTooHigh(priority));
        }
        if priority > i64::from(PRIORITY_MIN) {
            return Err(QueueError::PriorityTooLow(priority));
        }
        let partition_item = self.kg.partition_item();
        let found = self
            .run("partitionReprioritize", |tx| {
                partition::set_priority(tx, &partition_item, partition_id, priority as u8)
            })
            .await?;
        if found {
            Ok(())
        } else {
            Err(QueueError::PartitionNotFound)
        }
    }

    /// Pauses or resumes leasing of a function's partition.
    #[instrument(skip(self))]
    pub async fn set_function_paused(&self, function_id: Uuid, paused: bool) -> QueueResult<()> {
        let key = self.kg.fn_metadata(function_id);
        let metadata = FnMetadata {
            function_id,
            off: paused,
        };
        self.run("setFunctionPaused", |tx| {
            maintenance::set_function_paused(tx, &key, &metadata)
        })
        .await
    }

    /// Holds a function's partition out of peeks for `duration`, or clears
    /// the hold when `None`.
    pub async fn set_migration_lock(&self, function_id: Uuid, duration: Option<Duration>) -> QueueResult<()> {
        let key = self.kg.migration_lock(function_id);
        let lock = duration.map(|d| {
            let ttl = duration_ms(d);
            (new_lease_id(self.now_ms() + ttl), ttl)
        });
        self.run("setMigrationLock", |tx| maintenance::set_migration_lock(tx, &key, lock))
            .await
    }

    pub async fn partition_by_id(&self, partition_id: &str) -> QueueResult<Option<QueuePartition>> {
        let partition_item = self.kg.partition_item();
        self.run("partitionByID", |tx| {
            read_field::<QueuePartition>(tx, &partition_item, partition_id)
        })
        .await
    }
}
