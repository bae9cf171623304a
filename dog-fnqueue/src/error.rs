use std::fmt;

use thiserror::Error;

use crate::store::StoreError;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced by queue operations.
///
/// Constraint errors carry the key of the in-progress set or throttle that
/// rejected the lease, so callers can feed them into a [`crate::LeaseDenies`].
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("Queue item already exists")]
    ItemExists,

    #[error("Queue item not found")]
    ItemNotFound,

    #[error("Queue item already leased")]
    ItemAlreadyLeased,

    #[error("Queue item lease mismatch")]
    ItemLeaseMismatch,

    #[error("Queue item not leased")]
    ItemNotLeased,

    #[error("Singleton item already exists")]
    SingletonExists,

    #[error("Partition not found")]
    PartitionNotFound,

    #[error("Partition already leased")]
    PartitionAlreadyLeased,

    #[error("Partition garbage collected")]
    PartitionGarbageCollected,

    #[error("Partition is paused")]
    PartitionPaused,

    #[error("Account concurrency limit reached: {key}")]
    AccountConcurrencyLimit { key: String },

    #[error("Partition concurrency limit reached: {key}")]
    PartitionConcurrencyLimit { key: String },

    #[error("System concurrency limit reached: {key}")]
    SystemConcurrencyLimit { key: String },

    #[error("Custom concurrency limit {index} reached: {key}")]
    ConcurrencyLimitCustomKey { index: usize, key: String },

    #[error("Queue item throttled: {key}")]
    QueueItemThrottled { key: String },

    #[error("Config lease already held")]
    ConfigAlreadyLeased,

    #[error("Config lease duration exceeds the maximum of {max_ms}ms")]
    ConfigLeaseExceedsLimits { max_ms: i64 },

    #[error("Peek limit {limit} exceeds the maximum of {max}")]
    PeekMaxExceedsLimits { limit: i64, max: i64 },

    #[error("Account peek limit {limit} exceeds the maximum of {max}")]
    AccountPeekMaxExceedsLimits { limit: i64, max: i64 },

    #[error("Partition peek limit {limit} exceeds the maximum of {max}")]
    PartitionPeekMaxExceedsLimits { limit: i64, max: i64 },

    #[error("Lease duration {duration_ms}ms exceeds the maximum of {max_ms}ms")]
    LeaseDurationExceedsLimits { duration_ms: i64, max_ms: i64 },

    #[error("Priority {0} is higher than the maximum priority")]
    PriorityTooHigh(i64),

    #[error("Priority {0} is lower than the minimum priority")]
    PriorityTooLow(i64),

    #[error("Backlog not found")]
    BacklogNotFound,

    #[error("Backlog garbage collected")]
    BacklogGarbageCollected,

    #[error("Shadow partition not found")]
    ShadowPartitionNotFound,

    #[error("Shadow partition already leased")]
    ShadowPartitionAlreadyLeased,

    #[error("Shadow partition lease not found")]
    ShadowPartitionLeaseNotFound,

    #[error("Partition {0} referenced by the global pointer has no record")]
    MissingPartition(String),

    #[error("Item routed to shard {shard}, this queue serves {primary}")]
    UnknownShard { shard: String, primary: String },

    #[error("Event not found for queue item")]
    EventNotFound,

    #[error("Unknown response from {script}: {code}")]
    UnknownResponse { script: &'static str, code: i64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Multi(#[from] MultiError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// The concurrency or throttle key that caused a constraint error.
    pub fn constraint_key(&self) -> Option<&str> {
        match self {
            Self::AccountConcurrencyLimit { key }
            | Self::PartitionConcurrencyLimit { key }
            | Self::SystemConcurrencyLimit { key }
            | Self::ConcurrencyLimitCustomKey { key, .. }
            | Self::QueueItemThrottled { key } => Some(key),
            _ => None,
        }
    }

    /// Whether the error is a concurrency limit of any scope.
    pub fn is_concurrency_limit(&self) -> bool {
        matches!(
            self,
            Self::AccountConcurrencyLimit { .. }
                | Self::PartitionConcurrencyLimit { .. }
                | Self::SystemConcurrencyLimit { .. }
                | Self::ConcurrencyLimitCustomKey { .. }
        )
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::QueueItemThrottled { .. })
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

/// A collection of errors gathered while processing many units of work.
#[derive(Debug, Clone, Default)]
pub struct MultiError {
    errors: Vec<QueueError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: QueueError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// The first error recorded, in insertion order.
    pub fn first(&self) -> Option<&QueueError> {
        self.errors.first()
    }

    pub fn errors(&self) -> &[QueueError] {
        &self.errors
    }

    /// `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred", self.errors.len())?;
        for err in &self.errors {
            write!(f, "; {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

impl Extend<QueueError> for MultiError {
    fn extend<I: IntoIterator<Item = QueueError>>(&mut self, iter: I) {
        self.errors.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_key_is_exposed() {
        let err = QueueError::AccountConcurrencyLimit {
            key: "{queue}:concurrency:account:a".to_string(),
        };
        assert_eq!(err.constraint_key(), Some("{queue}:concurrency:account:a"));
        assert!(err.is_concurrency_limit());
        assert!(!err.is_throttled());

        assert_eq!(QueueError::ItemNotFound.constraint_key(), None);
    }

    #[test]
    fn test_multi_error_keeps_order() {
        let mut multi = MultiError::new();
        assert!(multi.clone().into_result().is_ok());

        multi.push(QueueError::ItemNotFound);
        multi.push(QueueError::PartitionNotFound);

        assert_eq!(multi.len(), 2);
        assert!(matches!(multi.first(), Some(QueueError::ItemNotFound)));
        assert!(multi.to_string().starts_with("2 error(s) occurred"));
    }
}
