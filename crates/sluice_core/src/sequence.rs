//! The monotonic sequence allocator.

use crate::error::{CoreError, CoreResult};
use sluice_kv::{BoxError, Bucket, UpdateAction};
use std::sync::Arc;

/// The KV key holding the sequence counter.
const SEQUENCE_KEY: &str = "_sync:seq";

/// Allocates strictly increasing sequence numbers for one database.
///
/// The counter persists in the KV store as decimal ASCII and advances
/// through the bucket's CAS update, so concurrent writers never see
/// the same value twice. There is no gap guarantee: a write retried by
/// the CAS loop burns the sequences its earlier attempts allocated.
pub struct SequenceAllocator {
    bucket: Arc<dyn Bucket>,
}

impl SequenceAllocator {
    /// Creates an allocator over the given bucket.
    #[must_use]
    pub fn new(bucket: Arc<dyn Bucket>) -> Self {
        Self { bucket }
    }

    /// Returns the next sequence number.
    pub fn next_sequence(&self) -> CoreResult<u64> {
        let mut allocated = 0u64;
        self.bucket
            .update(SEQUENCE_KEY, 0, &mut |current| {
                let last = match current {
                    Some(bytes) => String::from_utf8(bytes)
                        .ok()
                        .and_then(|s| s.parse::<u64>().ok())
                        .ok_or_else(|| {
                            BoxError::from(CoreError::internal("corrupt sequence counter"))
                        })?,
                    None => 0,
                };
                allocated = last + 1;
                Ok(UpdateAction::Replace(allocated.to_string().into_bytes()))
            })
            .map_err(CoreError::from_kv)?;
        Ok(allocated)
    }

    /// The most recently allocated sequence, without advancing.
    pub fn last_sequence(&self) -> CoreResult<u64> {
        match self.bucket.get(SEQUENCE_KEY) {
            Ok(bytes) => String::from_utf8(bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| CoreError::internal("corrupt sequence counter")),
            Err(err) if err.is_not_found() => Ok(0),
            Err(err) => Err(err.into()),
        }
    }
}

impl std::fmt::Debug for SequenceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceAllocator")
            .field("bucket", &self.bucket.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_kv::MemoryBucket;

    #[test]
    fn sequences_start_at_one_and_increase() {
        let bucket: Arc<dyn Bucket> = Arc::new(MemoryBucket::new("db"));
        let seqs = SequenceAllocator::new(bucket);
        assert_eq!(seqs.last_sequence().unwrap(), 0);
        assert_eq!(seqs.next_sequence().unwrap(), 1);
        assert_eq!(seqs.next_sequence().unwrap(), 2);
        assert_eq!(seqs.last_sequence().unwrap(), 2);
    }

    #[test]
    fn sequences_unique_under_concurrency() {
        let bucket: Arc<dyn Bucket> = Arc::new(MemoryBucket::new("db"));
        let seqs = Arc::new(SequenceAllocator::new(bucket));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let seqs = Arc::clone(&seqs);
            handles.push(std::thread::spawn(move || {
                (0..25)
                    .map(|_| seqs.next_sequence().unwrap())
                    .collect::<Vec<u64>>()
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 100);
        assert_eq!(*all.last().unwrap(), 100);
    }

    #[test]
    fn corrupt_counter_is_an_error() {
        let bucket = Arc::new(MemoryBucket::new("db"));
        bucket.set(SEQUENCE_KEY, 0, b"not a number").unwrap();
        let seqs = SequenceAllocator::new(bucket);
        assert!(seqs.next_sequence().is_err());
        assert!(seqs.last_sequence().is_err());
    }
}
