#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **execflow-dedup** – the deduplication store.
//!
//! Answers "have we already processed this event?" and, if so, with what
//! result — the mechanism that promotes the broker's at-least-once delivery
//! to application-level exactly-once outcomes (see `execflow-idempotent`).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use execflow_events::ProcessingResult;
use execflow_ids::{EventId, ExecutionId};
use thiserror::Error;

/// Default time-to-live for a dedup entry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors raised by a [`DedupStore`].
#[derive(Debug, Error)]
pub enum DedupError {
    /// The backend (e.g. Redis) could not be reached or returned malformed data.
    #[error("dedup backend error: {0}")]
    Backend(String),
}

/// Capability set for recording and querying processed events.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Record that `event_id` (belonging to `execution_id`) has been
    /// processed, with no result payload attached.
    async fn mark_processed(
        &self,
        event_id: EventId,
        execution_id: ExecutionId,
    ) -> Result<(), DedupError>;

    /// Record `result` for `event_id`, superseding any existing entry.
    async fn mark_processed_with_result(
        &self,
        event_id: EventId,
        result: ProcessingResult,
    ) -> Result<(), DedupError>;

    /// True iff `event_id` has a live (non-expired) entry.
    async fn is_processed(&self, event_id: EventId) -> Result<bool, DedupError>;

    /// The stored result for `event_id`, if one was recorded and has not expired.
    async fn get_processing_result(
        &self,
        event_id: EventId,
    ) -> Result<Option<ProcessingResult>, DedupError>;

    /// Remove entries older than `older_than`; returns the number removed.
    /// Backends that rely on a native TTL (Redis) may return 0 unconditionally.
    async fn cleanup(&self, older_than: Duration) -> Result<u64, DedupError>;
}

//─────────────────────────────
//  In-memory backend
//─────────────────────────────

#[derive(Clone)]
struct Entry {
    processed_at: DateTime<Utc>,
    result: Option<ProcessingResult>,
}

/// In-memory [`DedupStore`] with lazy TTL expiry: an expired entry is treated
/// as absent the moment it is read, and physically removed by [`Self::cleanup`].
pub struct MemoryDedupStore {
    entries: DashMap<EventId, Entry>,
    ttl: Duration,
}

impl MemoryDedupStore {
    /// Construct a store using [`DEFAULT_TTL`].
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Construct a store with an explicit TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        MemoryDedupStore { entries: DashMap::new(), ttl }
    }

    fn is_live(&self, entry: &Entry) -> bool {
        let age = Utc::now().signed_duration_since(entry.processed_at);
        age.to_std().map(|a| a < self.ttl).unwrap_or(false)
    }
}

impl Default for MemoryDedupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn mark_processed(
        &self,
        event_id: EventId,
        execution_id: ExecutionId,
    ) -> Result<(), DedupError> {
        self.entries.insert(
            event_id,
            Entry {
                processed_at: Utc::now(),
                result: Some(ProcessingResult::success(event_id, execution_id, 0, Vec::new(), None)),
            },
        );
        Ok(())
    }

    async fn mark_processed_with_result(
        &self,
        event_id: EventId,
        result: ProcessingResult,
    ) -> Result<(), DedupError> {
        self.entries.insert(
            event_id,
            Entry { processed_at: Utc::now(), result: Some(result) },
        );
        Ok(())
    }

    async fn is_processed(&self, event_id: EventId) -> Result<bool, DedupError> {
        Ok(self
            .entries
            .get(&event_id)
            .map(|e| self.is_live(&e))
            .unwrap_or(false))
    }

    async fn get_processing_result(
        &self,
        event_id: EventId,
    ) -> Result<Option<ProcessingResult>, DedupError> {
        Ok(self.entries.get(&event_id).and_then(|e| {
            if self.is_live(&e) {
                e.result.clone()
            } else {
                None
            }
        }))
    }

    async fn cleanup(&self, older_than: Duration) -> Result<u64, DedupError> {
        let mut removed = 0u64;
        self.entries.retain(|_, entry| {
            let age = Utc::now()
                .signed_duration_since(entry.processed_at)
                .to_std()
                .unwrap_or_default();
            let keep = age < older_than;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

//─────────────────────────────
//  Redis backend
//─────────────────────────────

#[cfg(feature = "redis-backend")]
pub mod redis_backend {
    //! Redis-backed [`DedupStore`], storing `dedup:{event_id}` as JSON with
    //! the entry's TTL expressed natively so expiry needs no background sweep.
    use super::*;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;

    /// Redis-backed dedup store.
    pub struct RedisDedupStore {
        conn: ConnectionManager,
        ttl: Duration,
    }

    impl RedisDedupStore {
        /// Wrap an established connection manager, using [`DEFAULT_TTL`].
        pub fn new(conn: ConnectionManager) -> Self {
            Self::with_ttl(conn, DEFAULT_TTL)
        }

        /// Wrap an established connection manager with an explicit TTL.
        pub fn with_ttl(conn: ConnectionManager, ttl: Duration) -> Self {
            RedisDedupStore { conn, ttl }
        }

        fn key(event_id: EventId) -> String {
            format!("dedup:{event_id}")
        }
    }

    #[async_trait]
    impl DedupStore for RedisDedupStore {
        async fn mark_processed(
            &self,
            event_id: EventId,
            execution_id: ExecutionId,
        ) -> Result<(), DedupError> {
            let result = ProcessingResult::success(event_id, execution_id, 0, Vec::new(), None);
            self.mark_processed_with_result(event_id, result).await
        }

        async fn mark_processed_with_result(
            &self,
            event_id: EventId,
            result: ProcessingResult,
        ) -> Result<(), DedupError> {
            let mut conn = self.conn.clone();
            let payload = serde_json::to_string(&result)
                .map_err(|e| DedupError::Backend(e.to_string()))?;
            conn.set_ex::<_, _, ()>(Self::key(event_id), payload, self.ttl.as_secs())
                .await
                .map_err(|e| DedupError::Backend(e.to_string()))
        }

        async fn is_processed(&self, event_id: EventId) -> Result<bool, DedupError> {
            let mut conn = self.conn.clone();
            let exists: bool = conn
                .exists(Self::key(event_id))
                .await
                .map_err(|e| DedupError::Backend(e.to_string()))?;
            Ok(exists)
        }

        async fn get_processing_result(
            &self,
            event_id: EventId,
        ) -> Result<Option<ProcessingResult>, DedupError> {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn
                .get(Self::key(event_id))
                .await
                .map_err(|e| DedupError::Backend(e.to_string()))?;
            match raw {
                Some(s) => serde_json::from_str(&s)
                    .map(Some)
                    .map_err(|e| DedupError::Backend(e.to_string())),
                None => Ok(None),
            }
        }

        async fn cleanup(&self, _older_than: Duration) -> Result<u64, DedupError> {
            // Redis TTL handles expiry natively; nothing for us to sweep.
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mark_then_is_processed_agrees_within_ttl() {
        let store = MemoryDedupStore::new();
        let event = EventId::new();
        let exec = ExecutionId::new();
        assert!(!store.is_processed(event).await.unwrap());
        store.mark_processed(event, exec).await.unwrap();
        assert!(store.is_processed(event).await.unwrap());
    }

    #[tokio::test]
    async fn mark_processed_with_result_supersedes_bare_marker() {
        let store = MemoryDedupStore::new();
        let event = EventId::new();
        let exec = ExecutionId::new();
        store.mark_processed(event, exec).await.unwrap();
        let failure = ProcessingResult::failure(event, exec, 12, "timeout", "boom");
        store.mark_processed_with_result(event, failure).await.unwrap();
        let stored = store.get_processing_result(event).await.unwrap().unwrap();
        assert!(!stored.success);
        assert_eq!(stored.error_code.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let store = MemoryDedupStore::with_ttl(Duration::from_millis(10));
        let event = EventId::new();
        let exec = ExecutionId::new();
        store.mark_processed(event, exec).await.unwrap();
        assert!(store.is_processed(event).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.is_processed(event).await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_removes_only_entries_older_than_threshold() {
        let store = MemoryDedupStore::new();
        let old = EventId::new();
        store.mark_processed(old, ExecutionId::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let fresh = EventId::new();
        store.mark_processed(fresh, ExecutionId::new()).await.unwrap();

        let removed = store.cleanup(Duration::from_millis(15)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_processing_result(old).await.unwrap().is_none());
        assert!(store.get_processing_result(fresh).await.unwrap().is_some());
    }
}
