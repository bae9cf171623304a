//! Recovery of items whose worker died while holding the lease.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, instrument, warn};

use crate::config::constants::SCAVENGE_CONCURRENCY_QUEUE_PEEK_SIZE;
use crate::error::{MultiError, QueueError, QueueResult};
use crate::queue::{ConfigLeaseHolder, ConfigLeaseRole, Queue};
use crate::scripts::partition::drop_partition_pointer_if_empty;
use crate::scripts::{decode, peek};
use crate::store::Store;
use crate::types::QueueItem;

const DEFAULT_SCAVENGE_TICK: Duration = Duration::from_secs(1);

impl<S: Store> Queue<S> {
    /// Requeues up to `limit` partitions' worth of items whose leases
    /// expired. Returns the number of items requeued.
    ///
    /// Per-partition failures do not stop the pass; they are returned
    /// together once every partition was visited.
    #[instrument(skip(self))]
    pub async fn scavenge(&self, limit: i64) -> QueueResult<usize> {
        let limit = limit.max(1) as usize;
        let now = self.now_ms();
        let concurrency_index = self.keys().concurrency_index();

        let partitions = self
            .run("scavengePeek", |tx| {
                let count = tx.zcount(&concurrency_index, i64::MIN, now)?;
                let offset = if count > limit {
                    rand::thread_rng().gen_range(0..=count - limit)
                } else {
                    0
                };
                tx.zrange_by_score(&concurrency_index, i64::MIN, now, offset, Some(limit))
            })
            .await?;

        let custom_prefix = self.keys().custom_concurrency_prefix();
        let mut errors = MultiError::new();
        let mut requeued = 0;

        for (partition_id, _) in partitions {
            if partition_id.starts_with(&custom_prefix) {
                // Custom key sets never belong in the concurrency index.
                self.run("scavengeDropCustomKey", |tx| tx.zrem(&concurrency_index, &partition_id))
                    .await?;
                continue;
            }

            match self.scavenge_partition(&partition_id, now).await {
                Ok(n) => requeued += n,
                Err(err) => {
                    warn!("Error scavenging partition {}: {}", partition_id, err);
                    errors.push(err);
                }
            }
        }

        self.metrics().add_scavenged(requeued as u64);
        if requeued > 0 {
            info!("Scavenged {} expired leases", requeued);
        }
        errors.into_result()?;
        Ok(requeued)
    }

    async fn scavenge_partition(&self, partition_id: &str, now: i64) -> QueueResult<usize> {
        let kg = self.keys();
        let queue_item = kg.queue_item();
        let scavenger_index = kg.partition_scavenger_index(partition_id);
        let in_progress = kg.in_progress_partition(partition_id);
        let peek_size = SCAVENGE_CONCURRENCY_QUEUE_PEEK_SIZE as usize;

        // The in-progress set is read as well for leases taken before the
        // scavenger index existed.
        let rows = self
            .run("scavengePartitionPeek", |tx| {
                let mut seen = HashSet::new();
                let mut rows = Vec::new();
                for index in [&scavenger_index, &in_progress] {
                    for row in peek::index_records(tx, &queue_item, index, (i64::MIN, now), 0, peek_size)? {
                        if seen.insert(row.0.clone()) {
                            rows.push(row);
                        }
                    }
                }
                Ok(rows)
            })
            .await?;

        let mut orphans = Vec::new();
        let mut requeued = 0;
        for (id, raw) in rows {
            let Some(raw) = raw else {
                orphans.push(id);
                continue;
            };
            let item = decode::<QueueItem>(&queue_item, &raw)?;
            if item.is_leased(now) {
                continue;
            }
            debug!("Requeueing item {} with an expired lease", item.id);
            match self.requeue(&item, now).await {
                Ok(()) => requeued += 1,
                Err(QueueError::ItemNotFound) => {}
                Err(err) => return Err(err),
            }
        }

        let concurrency_index = kg.concurrency_index();
        self.run("scavengePartitionFinish", |tx| {
            peek::remove_dangling(tx, &queue_item, &[scavenger_index.clone(), in_progress.clone()], &orphans)?;
            drop_partition_pointer_if_empty(tx, &concurrency_index, &scavenger_index, partition_id)
        })
        .await?;
        Ok(requeued)
    }
}

/// Background task that scavenges while this worker holds the scavenger
/// config lease.
pub struct Scavenger<S: Store> {
    queue: Queue<S>,
    interval: Duration,
    lease: ConfigLeaseHolder,
}

impl<S: Store> Scavenger<S> {
    pub fn new(queue: Queue<S>) -> Self {
        Self::with_interval(queue, DEFAULT_SCAVENGE_TICK)
    }

    pub fn with_interval(queue: Queue<S>, interval: Duration) -> Self {
        Self {
            queue,
            interval,
            lease: ConfigLeaseHolder::new(ConfigLeaseRole::Scavenger),
        }
    }

    /// Runs one cycle. Returns `None` when another worker holds the lease.
    pub async fn tick(&self) -> QueueResult<Option<usize>> {
        let duration = self.queue.config().config_lease_duration;
        if !self.lease.renew(&self.queue, duration).await? {
            return Ok(None);
        }
        let limit = self.queue.config().scavenge_peek_size;
        self.queue.scavenge(limit).await.map(Some)
    }

    /// Ticks forever.
    pub async fn start(self) -> QueueResult<()> {
        let mut ticker = interval(self.interval);
        info!("Starting scavenger with interval: {:?}", self.interval);

        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(Some(n)) if n > 0 => debug!("Scavenger recovered {} items", n),
                Ok(_) => {}
                Err(e) => warn!("Error during scavenging: {}", e),
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<QueueResult<()>> {
        tokio::spawn(self.start())
    }
}
