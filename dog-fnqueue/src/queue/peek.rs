use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::Queue;
use crate::config::constants::ABSOLUTE_QUEUE_PEEK_MAX;
use crate::decode::{parallel_decode, DEFAULT_DECODE_CHUNK};
use crate::error::{QueueError, QueueResult};
use crate::ewma::peek_size;
use crate::scripts::peek::{self, PeekArgs};
use crate::scripts::{decode, maintenance};
use crate::store::Store;
use crate::types::{QueueItem, QueuePartition};

impl<S: Store> Queue<S> {
    /// Ready items of a partition due by `until_ms`, earliest first.
    ///
    /// A negative `limit` peeks a single item and `0` peeks the configured
    /// minimum. Items that are still leased are left out.
    pub async fn peek(&self, p: &QueuePartition, until_ms: i64, limit: i64) -> QueueResult<Vec<QueueItem>> {
        self.peek_items(p, until_ms, limit, false).await
    }

    /// Like [`Queue::peek`], starting at a random due item instead of the
    /// earliest one.
    pub async fn peek_random(
        &self,
        p: &QueuePartition,
        until_ms: i64,
        limit: i64,
    ) -> QueueResult<Vec<QueueItem>> {
        self.peek_items(p, until_ms, limit, true).await
    }

    fn peek_limit(&self, limit: i64) -> QueueResult<usize> {
        if limit > ABSOLUTE_QUEUE_PEEK_MAX {
            return Err(QueueError::PeekMaxExceedsLimits {
                limit,
                max: ABSOLUTE_QUEUE_PEEK_MAX,
            });
        }
        let limit = match limit {
            l if l < 0 => 1,
            0 => self.config.peek_min,
            l => l.min(self.config.peek_max),
        };
        Ok(limit as usize)
    }

    #[instrument(skip(self, p), fields(partition = %p.id))]
    async fn peek_items(
        &self,
        p: &QueuePartition,
        until_ms: i64,
        limit: i64,
        random: bool,
    ) -> QueueResult<Vec<QueueItem>> {
        let limit = self.peek_limit(limit)?;
        let queue_item = self.kg.queue_item();
        let ready_set = self.kg.ready_set(&p.id);
        let args = PeekArgs {
            until: until_ms,
            limit,
            random_seed: random.then(rand::random::<u64>),
        };
        let rows = self
            .run("peek", |tx| peek::peek(tx, &queue_item, &ready_set, &args))
            .await?;

        let mut missing = Vec::new();
        let mut raw = Vec::with_capacity(rows.len());
        for (id, record) in rows {
            match record {
                Some(record) => raw.push(record),
                None => missing.push(id),
            }
        }
        if !missing.is_empty() {
            self.heal_dangling(queue_item.clone(), vec![ready_set], missing);
        }

        let now = self.now_ms();
        let key = queue_item;
        let batch = parallel_decode(raw, DEFAULT_DECODE_CHUNK, move |raw| {
            let item = decode::<QueueItem>(&key, &raw)?;
            Ok((!item.is_leased(now)).then_some(item))
        })
        .await?;

        for _ in 0..batch.skipped {
            self.metrics.increment_peek_leased_skip();
        }
        if let Some(err) = batch.first_error() {
            return Err(err.clone());
        }
        debug!(
            partition = %p.id,
            peeked = batch.items.len(),
            leased = batch.skipped,
            "peeked partition"
        );
        Ok(batch.items)
    }

    /// Drops pointers to records that no longer exist, off the hot path.
    pub(crate) fn heal_dangling(&self, records: String, sets: Vec<String>, ids: Vec<String>) {
        let store = self.store.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let result = store
                .atomic("removeDangling", move |tx| {
                    peek::remove_dangling(tx, &records, &sets, &ids)
                })
                .await;
            match result {
                Ok(removed) => {
                    for _ in 0..removed {
                        metrics.increment_dangling_pointer();
                    }
                }
                Err(err) => warn!("Failed to remove dangling queue pointers: {}", err),
            }
        });
    }

    /// Records how many items of a function's last peek were constrained.
    pub async fn set_peek_ewma(&self, function_id: Uuid, value: i64) -> QueueResult<()> {
        let key = self.kg.concurrency_fn_ewma(function_id);
        let len = self.config.peek_ewma_len;
        self.run("setPeekEWMA", |tx| maintenance::set_peek_ewma(tx, &key, value, len))
            .await
    }

    /// Peek batch size for a function, sized from its recent history.
    pub async fn peek_size_for(&self, function_id: Uuid) -> QueueResult<i64> {
        let key = self.kg.concurrency_fn_ewma(function_id);
        let samples = self
            .run("peekEWMA", |tx| maintenance::peek_ewma_samples(tx, &key))
            .await?;
        Ok(peek_size(&samples, &self.config))
    }
}
