//! Storage seam for the queue.
//!
//! Every state transition of the queue is a *script*: a closure that runs
//! against a [`Txn`] with serializable isolation and all-or-nothing
//! semantics. The primitives mirror a sorted-set key/value store: strings
//! with TTL, hashes, sorted sets scored by integer milliseconds, sets and
//! lists. Collections that become empty cease to exist.

use async_trait::async_trait;
use thiserror::Error;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Failures raised by a store.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("WRONGTYPE operation against key {0}")]
    WrongType(String),

    #[error("Invalid value at {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Script {script} aborted: {reason}")]
    Aborted { script: &'static str, reason: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn invalid(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// A store able to run scripts atomically.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Runs `f` as one atomic unit. If `f` fails nothing it wrote is kept.
    /// `script` names the operation for logging and call accounting.
    async fn atomic<T, F>(&self, script: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut dyn Txn) -> StoreResult<T> + Send,
        T: Send;
}

/// Operations available inside a script.
///
/// Score ranges are inclusive on both ends; use `i64::MIN` and `i64::MAX`
/// for unbounded sides. Members with equal scores are ordered by member.
pub trait Txn {
    // strings
    fn get(&mut self, key: &str) -> StoreResult<Option<String>>;
    /// Writes a string. `ttl_ms` of `None` keeps the key until deleted.
    fn set(&mut self, key: &str, value: &str, ttl_ms: Option<i64>) -> StoreResult<()>;
    fn del(&mut self, key: &str) -> StoreResult<bool>;
    fn exists(&mut self, key: &str) -> StoreResult<bool>;

    // hashes
    fn hget(&mut self, key: &str, field: &str) -> StoreResult<Option<String>>;
    fn hset(&mut self, key: &str, field: &str, value: &str) -> StoreResult<()>;
    fn hdel(&mut self, key: &str, field: &str) -> StoreResult<bool>;
    fn hexists(&mut self, key: &str, field: &str) -> StoreResult<bool>;
    fn hmget(&mut self, key: &str, fields: &[String]) -> StoreResult<Vec<Option<String>>>;
    fn hlen(&mut self, key: &str) -> StoreResult<usize>;

    // sorted sets
    fn zadd(&mut self, key: &str, member: &str, score: i64) -> StoreResult<()>;
    fn zscore(&mut self, key: &str, member: &str) -> StoreResult<Option<i64>>;
    fn zrem(&mut self, key: &str, member: &str) -> StoreResult<bool>;
    fn zcard(&mut self, key: &str) -> StoreResult<usize>;
    fn zcount(&mut self, key: &str, min: i64, max: i64) -> StoreResult<usize>;
    fn zrange_by_score(
        &mut self,
        key: &str,
        min: i64,
        max: i64,
        offset: usize,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, i64)>>;

    // sets
    fn sadd(&mut self, key: &str, member: &str) -> StoreResult<bool>;
    fn srem(&mut self, key: &str, member: &str) -> StoreResult<bool>;
    fn scard(&mut self, key: &str) -> StoreResult<usize>;
    fn sismember(&mut self, key: &str, member: &str) -> StoreResult<bool>;
    fn smembers(&mut self, key: &str) -> StoreResult<Vec<String>>;

    // lists
    fn rpush(&mut self, key: &str, value: &str) -> StoreResult<usize>;
    /// Keeps the inclusive range `[start, stop]`; negative indexes count from the end.
    fn ltrim(&mut self, key: &str, start: i64, stop: i64) -> StoreResult<()>;
    fn lrange(&mut self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;

    /// Lowest scored member of a sorted set.
    fn zmin(&mut self, key: &str) -> StoreResult<Option<(String, i64)>> {
        Ok(self
            .zrange_by_score(key, i64::MIN, i64::MAX, 0, Some(1))?
            .into_iter()
            .next())
    }

    /// Adds `member` with `score` unless it already has a lower score.
    fn zadd_min(&mut self, key: &str, member: &str, score: i64) -> StoreResult<()> {
        match self.zscore(key, member)? {
            Some(existing) if existing <= score => Ok(()),
            _ => self.zadd(key, member, score),
        }
    }

    /// Updates the score of an existing member, doing nothing when absent.
    fn zadd_existing(&mut self, key: &str, member: &str, score: i64) -> StoreResult<bool> {
        if self.zscore(key, member)?.is_some() {
            self.zadd(key, member, score)?;
            return Ok(true);
        }
        Ok(false)
    }
}
