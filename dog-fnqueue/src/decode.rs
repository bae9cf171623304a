use std::sync::Arc;

use futures::future::try_join_all;

use crate::error::{MultiError, QueueError, QueueResult};

/// Inputs smaller than this are decoded on the calling task.
pub const DEFAULT_DECODE_CHUNK: usize = 64;

/// Outcome of a parallel decode.
#[derive(Debug)]
pub struct DecodeBatch<T> {
    /// Decoded values in input order
    pub items: Vec<T>,
    /// Number of inputs the decoder chose to skip
    pub skipped: usize,
    /// Hard errors in input order
    pub errors: MultiError,
}

impl<T> DecodeBatch<T> {
    pub fn first_error(&self) -> Option<&QueueError> {
        self.errors.first()
    }

    /// The decoded values, or every hard error when there was at least one.
    pub fn into_result(self) -> Result<Vec<T>, MultiError> {
        if self.errors.is_empty() {
            Ok(self.items)
        } else {
            Err(self.errors)
        }
    }
}

/// Decodes `raw` on the blocking pool in chunks of `chunk_size`.
///
/// The decoder returns `Ok(None)` to skip an element; skips never fail the
/// batch. Hard errors are collected rather than short-circuiting.
pub async fn parallel_decode<T, F>(
    raw: Vec<String>,
    chunk_size: usize,
    decode: F,
) -> QueueResult<DecodeBatch<T>>
where
    T: Send + 'static,
    F: Fn(String) -> QueueResult<Option<T>> + Send + Sync + 'static,
{
    let chunk_size = chunk_size.max(1);
    let results: Vec<QueueResult<Option<T>>> = if raw.len() <= chunk_size {
        raw.into_iter().map(&decode).collect()
    } else {
        let decode = Arc::new(decode);
        let mut handles = Vec::new();
        let mut iter = raw.into_iter().peekable();
        while iter.peek().is_some() {
            let chunk: Vec<String> = iter.by_ref().take(chunk_size).collect();
            let decode = decode.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                chunk.into_iter().map(|r| decode(r)).collect::<Vec<_>>()
            }));
        }
        try_join_all(handles)
            .await
            .map_err(|e| QueueError::Internal(format!("decode task failed: {}", e)))?
            .into_iter()
            .flatten()
            .collect()
    };

    let mut batch = DecodeBatch {
        items: Vec::with_capacity(results.len()),
        skipped: 0,
        errors: MultiError::new(),
    };
    for result in results {
        match result {
            Ok(Some(item)) => batch.items.push(item),
            Ok(None) => batch.skipped += 1,
            Err(err) => batch.errors.push(err),
        }
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: String) -> QueueResult<Option<i64>> {
        if raw == "skip" {
            return Ok(None);
        }
        raw.parse::<i64>()
            .map(Some)
            .map_err(|e| QueueError::Serialization(e.to_string()))
    }

    #[tokio::test]
    async fn test_preserves_order_across_chunks() {
        let raw: Vec<String> = (0..200).map(|i| i.to_string()).collect();
        let batch = parallel_decode(raw, 16, parse).await.unwrap();
        assert_eq!(batch.items, (0..200).collect::<Vec<i64>>());
        assert_eq!(batch.skipped, 0);
    }

    #[tokio::test]
    async fn test_skips_do_not_fail_the_batch() {
        let raw = vec!["1".to_string(), "skip".to_string(), "3".to_string()];
        let batch = parallel_decode(raw, 2, parse).await.unwrap();
        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.into_result().unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_first_error_is_surfaced() {
        let raw = vec![
            "1".to_string(),
            "bad-a".to_string(),
            "2".to_string(),
            "bad-b".to_string(),
        ];
        let batch = parallel_decode(raw, 1, parse).await.unwrap();
        assert_eq!(batch.items, vec![1, 2]);
        assert_eq!(batch.errors.len(), 2);
        match batch.first_error() {
            Some(QueueError::Serialization(msg)) => assert!(msg.contains("invalid digit")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
