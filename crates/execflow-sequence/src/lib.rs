#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **execflow-sequence** – per-execution sequence numbers and gap detection.
//!
//! The [`SequenceManager`] trait is the capability set every backend (memory,
//! Redis) implements; [`SequenceTracker`] is a separate, purely in-process
//! structure the idempotent processor uses to notice when events for an
//! execution have arrived out of order or been skipped.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use execflow_ids::ExecutionId;
use thiserror::Error;

/// The ceiling past which a sequence counter is considered to have
/// overflowed; matches the source's "fatal past 2^63" rule.
pub const SEQUENCE_OVERFLOW_LIMIT: u64 = 1u64 << 63;

/// Errors raised by a [`SequenceManager`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    /// `ReserveRange` was called with a non-positive count.
    #[error("reserve range count must be > 0")]
    InvalidRangeCount,
    /// The sequence counter for an execution passed [`SEQUENCE_OVERFLOW_LIMIT`].
    #[error("sequence overflow for execution {0}")]
    Overflow(ExecutionId),
    /// The backend (e.g. Redis) could not be reached or returned malformed data.
    #[error("sequence backend error: {0}")]
    Backend(String),
}

/// Capability set for issuing and validating per-execution sequence numbers.
#[async_trait]
pub trait SequenceManager: Send + Sync {
    /// Returns a value strictly greater than any previously returned value
    /// for `exec`; the first call for a given execution returns 1.
    async fn next_sequence(&self, exec: ExecutionId) -> Result<u64, SequenceError>;

    /// The last issued value for `exec`, or 0 if none has been issued.
    async fn current_sequence(&self, exec: ExecutionId) -> Result<u64, SequenceError>;

    /// True iff `seq` is strictly greater than the current value for `exec`.
    async fn validate_sequence(&self, exec: ExecutionId, seq: u64) -> Result<bool, SequenceError> {
        Ok(seq > self.current_sequence(exec).await?)
    }

    /// Reserve `count` contiguous sequence numbers, returning `(start, end)`
    /// inclusive, and atomically advance the execution's counter to `end`.
    async fn reserve_range(
        &self,
        exec: ExecutionId,
        count: u64,
    ) -> Result<(u64, u64), SequenceError>;
}

//─────────────────────────────
//  In-memory backend
//─────────────────────────────

/// In-memory [`SequenceManager`], backed by a concurrent map of atomic counters.
#[derive(Default)]
pub struct MemorySequenceManager {
    counters: DashMap<ExecutionId, AtomicU64>,
}

impl MemorySequenceManager {
    /// Construct an empty manager.
    pub fn new() -> Self {
        MemorySequenceManager { counters: DashMap::new() }
    }

    fn entry(&self, exec: ExecutionId) -> dashmap::mapref::one::RefMut<'_, ExecutionId, AtomicU64> {
        self.counters.entry(exec).or_insert_with(|| AtomicU64::new(0))
    }
}

#[async_trait]
impl SequenceManager for MemorySequenceManager {
    async fn next_sequence(&self, exec: ExecutionId) -> Result<u64, SequenceError> {
        let counter = self.entry(exec);
        let next = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if next > SEQUENCE_OVERFLOW_LIMIT {
            return Err(SequenceError::Overflow(exec));
        }
        Ok(next)
    }

    async fn current_sequence(&self, exec: ExecutionId) -> Result<u64, SequenceError> {
        Ok(self
            .counters
            .get(&exec)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0))
    }

    async fn reserve_range(
        &self,
        exec: ExecutionId,
        count: u64,
    ) -> Result<(u64, u64), SequenceError> {
        if count == 0 {
            return Err(SequenceError::InvalidRangeCount);
        }
        let counter = self.entry(exec);
        let start = counter.fetch_add(count, Ordering::SeqCst) + 1;
        let end = start + count - 1;
        if end > SEQUENCE_OVERFLOW_LIMIT {
            return Err(SequenceError::Overflow(exec));
        }
        Ok((start, end))
    }
}

//─────────────────────────────
//  Redis backend
//─────────────────────────────

#[cfg(feature = "redis-backend")]
pub mod redis_backend {
    //! Redis-backed [`SequenceManager`], using `INCR`/`INCRBY` on `seq:{exec}`.
    use super::*;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;

    /// Redis-backed sequence manager. Counters never expire.
    pub struct RedisSequenceManager {
        conn: ConnectionManager,
    }

    impl RedisSequenceManager {
        /// Wrap an established connection manager.
        pub fn new(conn: ConnectionManager) -> Self {
            RedisSequenceManager { conn }
        }

        fn key(exec: ExecutionId) -> String {
            format!("seq:{exec}")
        }
    }

    #[async_trait]
    impl SequenceManager for RedisSequenceManager {
        async fn next_sequence(&self, exec: ExecutionId) -> Result<u64, SequenceError> {
            let mut conn = self.conn.clone();
            let next: u64 = conn
                .incr(Self::key(exec), 1u64)
                .await
                .map_err(|e| SequenceError::Backend(e.to_string()))?;
            if next > SEQUENCE_OVERFLOW_LIMIT {
                return Err(SequenceError::Overflow(exec));
            }
            Ok(next)
        }

        async fn current_sequence(&self, exec: ExecutionId) -> Result<u64, SequenceError> {
            let mut conn = self.conn.clone();
            let value: Option<u64> = conn
                .get(Self::key(exec))
                .await
                .map_err(|e| SequenceError::Backend(e.to_string()))?;
            Ok(value.unwrap_or(0))
        }

        async fn reserve_range(
            &self,
            exec: ExecutionId,
            count: u64,
        ) -> Result<(u64, u64), SequenceError> {
            if count == 0 {
                return Err(SequenceError::InvalidRangeCount);
            }
            let mut conn = self.conn.clone();
            let end: u64 = conn
                .incr(Self::key(exec), count)
                .await
                .map_err(|e| SequenceError::Backend(e.to_string()))?;
            if end > SEQUENCE_OVERFLOW_LIMIT {
                return Err(SequenceError::Overflow(exec));
            }
            Ok((end - count + 1, end))
        }
    }
}

//─────────────────────────────
//  Gap detection
//─────────────────────────────

/// Tracks which sequence numbers have been seen per execution, so the
/// idempotent processor can report gaps left by DLQ'd or discarded events.
#[derive(Default)]
pub struct SequenceTracker {
    seen: DashMap<ExecutionId, TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    last_processed: u64,
    out_of_order: BTreeSet<u64>,
}

impl SequenceTracker {
    /// Construct an empty tracker.
    pub fn new() -> Self {
        SequenceTracker { seen: DashMap::new() }
    }

    /// Record that `seq` has been processed for `exec`.
    pub fn record(&self, exec: ExecutionId, seq: u64) {
        let mut state = self.seen.entry(exec).or_default();
        if seq == state.last_processed + 1 {
            state.last_processed = seq;
            // Absorb any out-of-order numbers that are now contiguous.
            while state.out_of_order.remove(&(state.last_processed + 1)) {
                state.last_processed += 1;
            }
        } else if seq > state.last_processed {
            state.out_of_order.insert(seq);
        }
        // seq <= last_processed: already accounted for, a duplicate delivery.
    }

    /// Sequence numbers in `1..last_processed` not yet seen for `exec`.
    pub fn gaps(&self, exec: ExecutionId) -> Vec<u64> {
        let Some(state) = self.seen.get(&exec) else {
            return Vec::new();
        };
        (1..state.last_processed)
            .filter(|n| !state.out_of_order.contains(n))
            .collect()
    }

    /// The highest contiguous sequence number processed so far for `exec`.
    pub fn last_processed(&self, exec: ExecutionId) -> u64 {
        self.seen.get(&exec).map(|s| s.last_processed).unwrap_or(0)
    }
}
