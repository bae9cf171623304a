use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::types::QueuePartition;

#[derive(Debug, Clone)]
pub struct Continuation {
    pub partition: QueuePartition,
    /// How many times in a row the partition was continued
    pub count: u32,
}

#[derive(Debug, Default)]
struct State {
    continues: HashMap<String, Continuation>,
    cooldowns: HashMap<String, i64>,
}

/// Partitions this worker should scan again right away, with a per-partition
/// cap after which the partition cools down.
///
/// State is local to one queue instance; other workers never see it.
#[derive(Debug)]
pub struct Continuations {
    limit: u32,
    cooldown_ms: i64,
    state: Mutex<State>,
}

impl Continuations {
    pub fn new(limit: u32, cooldown_ms: i64) -> Self {
        Self {
            limit,
            cooldown_ms,
            state: Mutex::new(State::default()),
        }
    }

    /// Adds or bumps a continuation. Returns `false` when the partition is
    /// cooling down or hit the limit, in which case it starts cooling down.
    pub fn add(&self, partition: &QueuePartition, count: u32, now_ms: i64) -> bool {
        if self.limit == 0 {
            return false;
        }
        let mut state = self.state.lock();

        if let Some(until) = state.cooldowns.get(&partition.id).copied() {
            if until > now_ms {
                return false;
            }
            state.cooldowns.remove(&partition.id);
        }

        if count >= self.limit {
            trace!(partition = %partition.id, count, "continuation limit reached");
            state.continues.remove(&partition.id);
            state
                .cooldowns
                .insert(partition.id.clone(), now_ms + self.cooldown_ms);
            return false;
        }

        let entry = state
            .continues
            .entry(partition.id.clone())
            .or_insert_with(|| Continuation {
                partition: partition.clone(),
                count,
            });
        if count >= entry.count {
            entry.count = count;
            entry.partition = partition.clone();
        }
        true
    }

    /// Removes a continuation, optionally putting the partition on cooldown.
    pub fn remove(&self, partition_id: &str, cooldown: bool, now_ms: i64) {
        let mut state = self.state.lock();
        state.continues.remove(partition_id);
        if cooldown {
            state
                .cooldowns
                .insert(partition_id.to_string(), now_ms + self.cooldown_ms);
        }
    }

    pub fn get(&self, partition_id: &str) -> Option<Continuation> {
        self.state.lock().continues.get(partition_id).cloned()
    }

    /// All continuations, for the scan loop to process first.
    pub fn snapshot(&self) -> Vec<Continuation> {
        self.state.lock().continues.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().continues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
