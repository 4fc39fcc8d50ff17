#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **execflow-backends** – the backend factory.
//!
//! Resolves a [`BackendConfig`] into the concrete sequence, dedup, lock, and
//! DLQ store trait objects every other crate programs against. Redis is
//! probed with a `PING` before anything is handed out; an unreachable Redis
//! downgrades every subsystem to its in-memory counterpart rather than
//! failing startup, logging a warning so the operator notices the
//! degradation instead of silently losing durability.

use std::sync::Arc;

use execflow_dedup::DedupStore;
use execflow_dlq::DlqStore;
use execflow_lock::LockService;
use execflow_queue::QueuePublisher;
use execflow_sequence::SequenceManager;
use thiserror::Error;

/// Which concrete implementation a subsystem should use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// The in-process, non-durable implementation.
    Memory,
    /// The Redis-backed implementation.
    Redis,
}

/// Per-subsystem backend selection, as read from deployment configuration.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// `REDIS_URL`, required when any subsystem selects [`BackendKind::Redis`].
    pub redis_url: Option<String>,
    /// Backend for the sequence manager.
    pub sequence: BackendKind,
    /// Backend for the dedup store.
    pub dedup: BackendKind,
    /// Backend for the lock service.
    pub lock: BackendKind,
    /// Backend for the DLQ store.
    pub dlq: BackendKind,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            redis_url: None,
            sequence: BackendKind::Memory,
            dedup: BackendKind::Memory,
            lock: BackendKind::Memory,
            dlq: BackendKind::Memory,
        }
    }
}

/// Errors constructing a backend set.
#[derive(Debug, Error)]
pub enum BackendError {
    /// A subsystem requested Redis but no `redis_url` was configured.
    #[error("redis backend selected but no redis_url configured")]
    MissingRedisUrl,
    /// The Redis client could not be constructed from the configured URL.
    #[error("invalid redis url: {0}")]
    InvalidRedisUrl(String),
}

/// The fully-resolved set of backend trait objects every subsystem's
/// consumer programs against, plus which [`BackendKind`] each subsystem
/// actually ended up using (after any fallback).
pub struct Backends {
    /// The resolved sequence manager.
    pub sequence: Arc<dyn SequenceManager>,
    /// The resolved dedup store.
    pub dedup: Arc<dyn DedupStore>,
    /// The resolved lock service.
    pub lock: Arc<dyn LockService>,
    /// The resolved DLQ store.
    pub dlq: Arc<dyn DlqStore>,
    /// What each subsystem actually ended up running on, post-fallback.
    pub resolved: ResolvedKinds,
}

/// Per-subsystem kind actually selected, which may differ from the
/// requested [`BackendConfig`] if Redis was requested but unreachable.
#[derive(Clone, Copy, Debug)]
pub struct ResolvedKinds {
    /// Sequence manager's actual backend.
    pub sequence: BackendKind,
    /// Dedup store's actual backend.
    pub dedup: BackendKind,
    /// Lock service's actual backend.
    pub lock: BackendKind,
    /// DLQ store's actual backend.
    pub dlq: BackendKind,
}

#[cfg(not(feature = "redis-backend"))]
async fn build_memory_only(
    config: &BackendConfig,
    publisher: Arc<dyn QueuePublisher>,
    dlq_main_queue: &str,
) -> Backends {
    if config.sequence == BackendKind::Redis
        || config.dedup == BackendKind::Redis
        || config.lock == BackendKind::Redis
        || config.dlq == BackendKind::Redis
    {
        tracing::warn!("redis backend requested but this binary was built without the redis-backend feature; using memory for every subsystem");
    }
    Backends {
        sequence: Arc::new(execflow_sequence::MemorySequenceManager::new()),
        dedup: Arc::new(execflow_dedup::MemoryDedupStore::new()),
        lock: Arc::new(execflow_lock::MemoryLockService::new()),
        dlq: Arc::new(execflow_dlq::MemoryDlqStore::new(publisher, dlq_main_queue)),
        resolved: ResolvedKinds {
            sequence: BackendKind::Memory,
            dedup: BackendKind::Memory,
            lock: BackendKind::Memory,
            dlq: BackendKind::Memory,
        },
    }
}

/// Build the backend set described by `config`, probing Redis once (if any
/// subsystem requests it) and falling back to memory per-subsystem on
/// failure — this is `NewBackendsWithFallback`.
#[cfg(not(feature = "redis-backend"))]
pub async fn new_backends_with_fallback(
    config: &BackendConfig,
    publisher: Arc<dyn QueuePublisher>,
    dlq_main_queue: &str,
) -> Result<Backends, BackendError> {
    Ok(build_memory_only(config, publisher, dlq_main_queue).await)
}

#[cfg(feature = "redis-backend")]
/// Build the backend set described by `config`, probing Redis once (if any
/// subsystem requests it) and falling back to memory per-subsystem on
/// failure — this is `NewBackendsWithFallback`.
pub async fn new_backends_with_fallback(
    config: &BackendConfig,
    publisher: Arc<dyn QueuePublisher>,
    dlq_main_queue: &str,
) -> Result<Backends, BackendError> {
    use redis::aio::ConnectionManager;

    let wants_redis = config.sequence == BackendKind::Redis
        || config.dedup == BackendKind::Redis
        || config.lock == BackendKind::Redis
        || config.dlq == BackendKind::Redis;

    let conn: Option<ConnectionManager> = if wants_redis {
        let url = config.redis_url.as_ref().ok_or(BackendError::MissingRedisUrl)?;
        let client = redis::Client::open(url.as_str()).map_err(|e| BackendError::InvalidRedisUrl(e.to_string()))?;
        match client.get_connection_manager().await {
            Ok(mut manager) => match redis::cmd("PING").query_async::<String>(&mut manager).await {
                Ok(_) => Some(manager),
                Err(err) => {
                    tracing::warn!(error = %err, "redis ping failed, falling back to memory backends");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "failed to establish redis connection, falling back to memory backends");
                None
            }
        }
    } else {
        None
    };

    let sequence: Arc<dyn SequenceManager> = match (config.sequence, &conn) {
        (BackendKind::Redis, Some(c)) => Arc::new(execflow_sequence::redis_backend::RedisSequenceManager::new(c.clone())),
        _ => Arc::new(execflow_sequence::MemorySequenceManager::new()),
    };
    let dedup: Arc<dyn DedupStore> = match (config.dedup, &conn) {
        (BackendKind::Redis, Some(c)) => Arc::new(execflow_dedup::redis_backend::RedisDedupStore::new(c.clone())),
        _ => Arc::new(execflow_dedup::MemoryDedupStore::new()),
    };
    let lock: Arc<dyn LockService> = match (config.lock, &conn) {
        (BackendKind::Redis, Some(c)) => Arc::new(execflow_lock::redis_backend::RedisLockService::new(c.clone())),
        _ => Arc::new(execflow_lock::MemoryLockService::new()),
    };
    let dlq: Arc<dyn DlqStore> = match (config.dlq, &conn) {
        (BackendKind::Redis, Some(c)) => {
            Arc::new(execflow_dlq::redis_backend::RedisDlqStore::new(c.clone(), publisher, dlq_main_queue))
        }
        _ => Arc::new(execflow_dlq::MemoryDlqStore::new(publisher, dlq_main_queue)),
    };

    let resolved_kind = |requested: BackendKind| if conn.is_some() { requested } else { BackendKind::Memory };

    Ok(Backends {
        sequence,
        dedup,
        lock,
        dlq,
        resolved: ResolvedKinds {
            sequence: resolved_kind(config.sequence),
            dedup: resolved_kind(config.dedup),
            lock: resolved_kind(config.lock),
            dlq: resolved_kind(config.dlq),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use execflow_events::Event;
    use execflow_queue::QueueError;
    use async_trait::async_trait;

    struct NoopPublisher;

    #[async_trait]
    impl QueuePublisher for NoopPublisher {
        async fn publish(&self, _queue: &str, _event: &Event) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn memory_config_resolves_to_memory_everywhere() {
        let config = BackendConfig::default();
        let backends = new_backends_with_fallback(&config, Arc::new(NoopPublisher), "feature.events")
            .await
            .unwrap();
        assert_eq!(backends.resolved.sequence, BackendKind::Memory);
        assert_eq!(backends.resolved.dedup, BackendKind::Memory);
        assert_eq!(backends.resolved.lock, BackendKind::Memory);
        assert_eq!(backends.resolved.dlq, BackendKind::Memory);
    }

    #[cfg(feature = "redis-backend")]
    #[tokio::test]
    async fn redis_selection_without_a_url_is_an_error() {
        let config = BackendConfig { sequence: BackendKind::Redis, ..BackendConfig::default() };
        let result = new_backends_with_fallback(&config, Arc::new(NoopPublisher), "feature.events").await;
        assert!(matches!(result, Err(BackendError::MissingRedisUrl)));
    }

    #[cfg(feature = "redis-backend")]
    #[tokio::test]
    async fn unreachable_redis_falls_back_to_memory_instead_of_failing() {
        let config = BackendConfig {
            redis_url: Some("redis://127.0.0.1:1".to_string()),
            sequence: BackendKind::Redis,
            ..BackendConfig::default()
        };
        let backends = new_backends_with_fallback(&config, Arc::new(NoopPublisher), "feature.events")
            .await
            .unwrap();
        assert_eq!(backends.resolved.sequence, BackendKind::Memory);
    }
}
