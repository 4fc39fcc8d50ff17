#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **execflow-lock** – named distributed locks.
//!
//! Workers take a per-repo-branch (or per-execution, or per-workspace) lock
//! before mutating shared state. [`LockService`] is the capability set;
//! [`LockExtender`] renews a held lock in the background; [`with_lock`]
//! acquires, runs a closure, and releases on every exit path.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Base backoff delay for [`LockService::acquire`]'s poll loop.
pub const ACQUIRE_BASE_DELAY: Duration = Duration::from_millis(100);
/// Cap on the exponential backoff delay.
pub const ACQUIRE_MAX_DELAY: Duration = Duration::from_secs(30);
/// Symmetric jitter fraction applied to each backoff delay.
pub const ACQUIRE_JITTER: f64 = 0.3;

/// Errors raised by a [`LockService`].
#[derive(Debug, Error)]
pub enum LockError {
    /// `acquire` did not obtain the lock before its deadline elapsed.
    #[error("lock not acquired: {0}")]
    NotAcquired(String),
    /// `release`/`extend` was attempted by a party that does not own the lock.
    #[error("lock not held by this owner")]
    NotHeld,
    /// The lock had already expired by the time the operation ran.
    #[error("lock expired")]
    Expired,
    /// `acquire` was interrupted by the caller's cancellation token.
    #[error("lock acquisition cancelled")]
    Cancelled,
    /// The backend (e.g. Redis) could not be reached or returned malformed data.
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// A held (or formerly held) lock: its key, owner, and lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockInfo {
    /// Namespaced key, e.g. `repo:{id}:branch:{name}`.
    pub key: String,
    /// Identifies the holder — usually an execution id, as a string.
    pub owner: String,
    /// When this lock (or its current holder) was established.
    pub acquired_at: DateTime<Utc>,
    /// When this lock expires absent a further extend.
    pub expires_at: DateTime<Utc>,
    /// Caller-supplied metadata, opaque to the lock service.
    pub metadata: HashMap<String, String>,
}

/// Capability set for named distributed locks.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Attempt to acquire `key` for `owner`, without blocking. Succeeds
    /// (`acquired = true`) if the key was free, or if it was already held by
    /// `owner` — in which case the TTL is atomically reset.
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<(Option<LockInfo>, bool), LockError>;

    /// Poll [`Self::try_acquire`] with exponential backoff (base
    /// [`ACQUIRE_BASE_DELAY`], cap [`ACQUIRE_MAX_DELAY`], ±[`ACQUIRE_JITTER`]
    /// symmetric jitter) until it succeeds, `deadline` elapses, or `cancel`
    /// fires.
    async fn acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockInfo, LockError> {
        let start = Instant::now();
        let mut delay = ACQUIRE_BASE_DELAY;
        loop {
            if cancel.is_cancelled() {
                return Err(LockError::Cancelled);
            }
            let (lock, acquired) = self.try_acquire(key, owner, ttl).await?;
            if acquired {
                return Ok(lock.expect("acquired implies a lock was returned"));
            }
            if start.elapsed() >= deadline {
                return Err(LockError::NotAcquired(key.to_string()));
            }
            let jitter = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * ACQUIRE_JITTER;
            let sleep_for = delay.mul_f64(jitter.max(0.0));
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancel.cancelled() => return Err(LockError::Cancelled),
            }
            delay = (delay * 2).min(ACQUIRE_MAX_DELAY);
        }
    }

    /// Atomically check-owner-then-delete. Succeeds silently if the key is
    /// already absent; fails with [`LockError::NotHeld`] if owned by someone else.
    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError>;

    /// Atomically check-owner-then-set-expiry, returning the refreshed lock.
    async fn extend(&self, lock: &LockInfo, ttl: Duration) -> Result<LockInfo, LockError>;

    /// True iff the store still records `lock.owner` as the current, unexpired holder.
    async fn is_held(&self, lock: &LockInfo) -> Result<bool, LockError>;
}

//─────────────────────────────
//  In-memory backend
//─────────────────────────────

struct Record {
    owner: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    metadata: HashMap<String, String>,
}

/// In-memory [`LockService`]. Atomicity is provided by `dashmap`'s
/// per-shard locking: every operation that must be atomic touches exactly
/// one entry under its shard's write lock.
#[derive(Default)]
pub struct MemoryLockService {
    locks: DashMap<String, Record>,
}

impl MemoryLockService {
    /// Construct an empty lock table.
    pub fn new() -> Self {
        MemoryLockService { locks: DashMap::new() }
    }
}

fn expires_at(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero())
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<(Option<LockInfo>, bool), LockError> {
        let now = Utc::now();
        let mut acquired = false;

        self.locks
            .entry(key.to_string())
            .and_modify(|rec| {
                if rec.owner == owner || rec.expires_at <= now {
                    rec.owner = owner.to_string();
                    rec.acquired_at = now;
                    rec.expires_at = expires_at(now, ttl);
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                Record {
                    owner: owner.to_string(),
                    acquired_at: now,
                    expires_at: expires_at(now, ttl),
                    metadata: HashMap::new(),
                }
            });

        if !acquired {
            return Ok((None, false));
        }
        let rec = self.locks.get(key).expect("just inserted or modified");
        Ok((
            Some(LockInfo {
                key: key.to_string(),
                owner: rec.owner.clone(),
                acquired_at: rec.acquired_at,
                expires_at: rec.expires_at,
                metadata: rec.metadata.clone(),
            }),
            true,
        ))
    }

    async fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
        let removed = self.locks.remove_if(key, |_, rec| rec.owner == owner);
        if removed.is_some() {
            return Ok(());
        }
        if self.locks.contains_key(key) {
            Err(LockError::NotHeld)
        } else {
            Ok(())
        }
    }

    async fn extend(&self, lock: &LockInfo, ttl: Duration) -> Result<LockInfo, LockError> {
        let mut rec = self.locks.get_mut(&lock.key).ok_or(LockError::NotHeld)?;
        if rec.owner != lock.owner {
            return Err(LockError::NotHeld);
        }
        let now = Utc::now();
        if rec.expires_at <= now {
            return Err(LockError::Expired);
        }
        rec.expires_at = expires_at(now, ttl);
        Ok(LockInfo {
            key: lock.key.clone(),
            owner: rec.owner.clone(),
            acquired_at: rec.acquired_at,
            expires_at: rec.expires_at,
            metadata: rec.metadata.clone(),
        })
    }

    async fn is_held(&self, lock: &LockInfo) -> Result<bool, LockError> {
        Ok(self
            .locks
            .get(&lock.key)
            .map(|rec| rec.owner == lock.owner && rec.expires_at > Utc::now())
            .unwrap_or(false))
    }
}

//─────────────────────────────
//  Redis backend
//─────────────────────────────

#[cfg(feature = "redis-backend")]
pub mod redis_backend {
    //! Redis-backed [`LockService`]. `release` and `extend` are Lua-scripted
    //! (`GET` then `DEL`/`PEXPIRE`) so a lock cannot be stolen between the
    //! ownership check and the mutation — relying on `WATCH`/`MULTI` instead
    //! would leave a TOCTOU window if the key expires in between.
    use super::*;
    use redis::aio::ConnectionManager;
    use redis::{AsyncCommands, Script};

    const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

    const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

    /// Redis-backed lock service.
    pub struct RedisLockService {
        conn: ConnectionManager,
        release_script: Script,
        extend_script: Script,
    }

    impl RedisLockService {
        /// Wrap an established connection manager.
        pub fn new(conn: ConnectionManager) -> Self {
            RedisLockService {
                conn,
                release_script: Script::new(RELEASE_SCRIPT),
                extend_script: Script::new(EXTEND_SCRIPT),
            }
        }

        fn key(key: &str) -> String {
            format!("lock:{key}")
        }
    }

    #[async_trait]
    impl LockService for RedisLockService {
        async fn try_acquire(
            &self,
            key: &str,
            owner: &str,
            ttl: Duration,
        ) -> Result<(Option<LockInfo>, bool), LockError> {
            let mut conn = self.conn.clone();
            let now = Utc::now();
            let redis_key = Self::key(key);

            let set: Option<String> = redis::cmd("SET")
                .arg(&redis_key)
                .arg(owner)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;

            let acquired = if set.is_some() {
                true
            } else {
                // Not free — but if we already own it, atomically re-arm the TTL.
                let result: i64 = self
                    .extend_script
                    .key(&redis_key)
                    .arg(owner)
                    .arg(ttl.as_millis() as u64)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(|e| LockError::Backend(e.to_string()))?;
                result == 1
            };

            if !acquired {
                return Ok((None, false));
            }
            Ok((
                Some(LockInfo {
                    key: key.to_string(),
                    owner: owner.to_string(),
                    acquired_at: now,
                    expires_at: expires_at(now, ttl),
                    metadata: HashMap::new(),
                }),
                true,
            ))
        }

        async fn release(&self, key: &str, owner: &str) -> Result<(), LockError> {
            let mut conn = self.conn.clone();
            let result: i64 = self
                .release_script
                .key(Self::key(key))
                .arg(owner)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;
            if result == 1 {
                return Ok(());
            }
            let exists: bool = conn
                .exists(Self::key(key))
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;
            if exists {
                Err(LockError::NotHeld)
            } else {
                Ok(())
            }
        }

        async fn extend(&self, lock: &LockInfo, ttl: Duration) -> Result<LockInfo, LockError> {
            let mut conn = self.conn.clone();
            let result: i64 = self
                .extend_script
                .key(Self::key(&lock.key))
                .arg(&lock.owner)
                .arg(ttl.as_millis() as u64)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;
            if result != 1 {
                return Err(LockError::NotHeld);
            }
            let mut updated = lock.clone();
            updated.expires_at = expires_at(Utc::now(), ttl);
            Ok(updated)
        }

        async fn is_held(&self, lock: &LockInfo) -> Result<bool, LockError> {
            let mut conn = self.conn.clone();
            let value: Option<String> = conn
                .get(Self::key(&lock.key))
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;
            Ok(value.as_deref() == Some(lock.owner.as_str()))
        }
    }
}

//─────────────────────────────
//  LockExtender
//─────────────────────────────

/// Periodically calls [`LockService::extend`] on a held lock until stopped
/// or an extend fails (at which point the lock is considered lost and the
/// task exits silently, logging a warning).
pub struct LockExtender {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl LockExtender {
    /// Spawn a renewal task. `interval` is typically `ttl / 3`.
    pub fn spawn(
        service: Arc<dyn LockService>,
        lock: LockInfo,
        ttl: Duration,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let child_token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut current = lock;
            loop {
                tokio::select! {
                    _ = child_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match service.extend(&current, ttl).await {
                    Ok(updated) => current = updated,
                    Err(error) => {
                        tracing::warn!(key = %current.key, %error, "lock extender stopping: lock considered lost");
                        break;
                    }
                }
            }
        });
        LockExtender { cancel, handle }
    }

    /// Signal the extender to stop and wait for it to finish its current iteration.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

//─────────────────────────────
//  RAII guard and with_lock
//─────────────────────────────

/// Holds a lock and releases it when dropped, best-effort, if
/// [`LockGuard::release`] was never called explicitly. The explicit path
/// (used by [`with_lock`] on its non-panicking return) is synchronous and
/// reliable; the `Drop` path spawns a detached release so a panic unwinding
/// through the guard still relinquishes the lock, on a best-effort basis
/// (it requires a live Tokio runtime handle, which is always true for
/// panics unwinding inside a task).
pub struct LockGuard {
    service: Arc<dyn LockService>,
    lock: LockInfo,
    released: Arc<AtomicBool>,
}

impl LockGuard {
    /// Wrap an already-acquired lock.
    pub fn new(service: Arc<dyn LockService>, lock: LockInfo) -> Self {
        LockGuard { service, lock, released: Arc::new(AtomicBool::new(false)) }
    }

    /// The wrapped lock's current info.
    pub fn info(&self) -> &LockInfo {
        &self.lock
    }

    /// Release explicitly. Safe to call at most once; the `Drop` impl
    /// no-ops afterward.
    pub async fn release(self) -> Result<(), LockError> {
        self.released.store(true, Ordering::SeqCst);
        self.service.release(&self.lock.key, &self.lock.owner).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let service = self.service.clone();
        let key = self.lock.key.clone();
        let owner = self.lock.owner.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(error) = service.release(&key, &owner).await {
                    tracing::warn!(%key, %error, "best-effort lock release on drop failed");
                }
            });
        }
    }
}

/// Acquire `key`, run `f` with the held [`LockInfo`], and release on every
/// exit path.
pub async fn with_lock<T, F, Fut>(
    service: Arc<dyn LockService>,
    key: &str,
    owner: &str,
    ttl: Duration,
    deadline: Duration,
    cancel: &CancellationToken,
    f: F,
) -> Result<T, LockError>
where
    F: FnOnce(LockInfo) -> Fut,
    Fut: Future<Output = T>,
{
    let lock = service.acquire(key, owner, ttl, deadline, cancel).await?;
    let guard = LockGuard::new(service, lock.clone());
    let result = f(lock).await;
    guard.release().await?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_acquire_succeeds_on_a_free_key() {
        let svc = MemoryLockService::new();
        let (lock, acquired) = svc.try_acquire("k", "owner-a", Duration::from_secs(10)).await.unwrap();
        assert!(acquired);
        assert_eq!(lock.unwrap().owner, "owner-a");
    }

    #[tokio::test]
    async fn try_acquire_by_the_same_owner_resets_ttl() {
        let svc = MemoryLockService::new();
        svc.try_acquire("k", "owner-a", Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let (lock, acquired) = svc.try_acquire("k", "owner-a", Duration::from_secs(10)).await.unwrap();
        assert!(acquired);
        assert!(lock.unwrap().expires_at > Utc::now() + chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn try_acquire_by_another_owner_fails_while_held() {
        let svc = MemoryLockService::new();
        svc.try_acquire("k", "owner-a", Duration::from_secs(10)).await.unwrap();
        let (lock, acquired) = svc.try_acquire("k", "owner-b", Duration::from_secs(10)).await.unwrap();
        assert!(!acquired);
        assert!(lock.is_none());
    }

    #[tokio::test]
    async fn try_acquire_succeeds_after_expiry() {
        let svc = MemoryLockService::new();
        svc.try_acquire("k", "owner-a", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let (_, acquired) = svc.try_acquire("k", "owner-b", Duration::from_secs(10)).await.unwrap();
        assert!(acquired);
    }

    #[tokio::test]
    async fn release_by_wrong_owner_fails() {
        let svc = MemoryLockService::new();
        svc.try_acquire("k", "owner-a", Duration::from_secs(10)).await.unwrap();
        let err = svc.release("k", "owner-b").await.unwrap_err();
        assert!(matches!(err, LockError::NotHeld));
    }

    #[tokio::test]
    async fn release_on_absent_key_is_a_silent_success() {
        let svc = MemoryLockService::new();
        svc.release("never-acquired", "owner-a").await.unwrap();
    }

    #[tokio::test]
    async fn extend_refreshes_expiry_for_the_owner() {
        let svc = MemoryLockService::new();
        let (lock, _) = svc.try_acquire("k", "owner-a", Duration::from_millis(50)).await.unwrap();
        let lock = lock.unwrap();
        let extended = svc.extend(&lock, Duration::from_secs(60)).await.unwrap();
        assert!(extended.expires_at > lock.expires_at);
    }

    #[tokio::test]
    async fn extend_by_wrong_owner_fails() {
        let svc = MemoryLockService::new();
        let (lock, _) = svc.try_acquire("k", "owner-a", Duration::from_secs(10)).await.unwrap();
        let mut impostor = lock.unwrap();
        impostor.owner = "owner-b".to_string();
        let err = svc.extend(&impostor, Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, LockError::NotHeld));
    }

    #[tokio::test]
    async fn is_held_reflects_ownership_and_expiry() {
        let svc = MemoryLockService::new();
        let (lock, _) = svc.try_acquire("k", "owner-a", Duration::from_millis(20)).await.unwrap();
        let lock = lock.unwrap();
        assert!(svc.is_held(&lock).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!svc.is_held(&lock).await.unwrap());
    }

    #[tokio::test]
    async fn acquire_times_out_against_a_held_lock() {
        let svc = Arc::new(MemoryLockService::new());
        svc.try_acquire("k", "owner-a", Duration::from_secs(10)).await.unwrap();
        let cancel = CancellationToken::new();
        let err = svc
            .acquire("k", "owner-b", Duration::from_secs(10), Duration::from_millis(250), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::NotAcquired(_)));
    }

    #[tokio::test]
    async fn acquire_honors_cancellation() {
        let svc = Arc::new(MemoryLockService::new());
        svc.try_acquire("k", "owner-a", Duration::from_secs(30)).await.unwrap();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_clone.cancel();
        });
        let err = svc
            .acquire("k", "owner-b", Duration::from_secs(30), Duration::from_secs(30), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Cancelled));
    }

    #[tokio::test]
    async fn with_lock_releases_after_the_closure_completes() {
        let svc: Arc<dyn LockService> = Arc::new(MemoryLockService::new());
        let cancel = CancellationToken::new();
        let result = with_lock(svc.clone(), "k", "owner-a", Duration::from_secs(10), Duration::from_secs(1), &cancel, |lock| async move {
            lock.key.len()
        })
        .await
        .unwrap();
        assert_eq!(result, 1);
        let (_, acquired) = svc.try_acquire("k", "owner-b", Duration::from_secs(10)).await.unwrap();
        assert!(acquired, "lock should have been released by with_lock");
    }

    #[tokio::test]
    async fn lock_extender_keeps_a_lock_alive_past_its_original_ttl() {
        let svc: Arc<dyn LockService> = Arc::new(MemoryLockService::new());
        let (lock, _) = svc.try_acquire("k", "owner-a", Duration::from_millis(60)).await.unwrap();
        let lock = lock.unwrap();
        let extender = LockExtender::spawn(svc.clone(), lock.clone(), Duration::from_millis(60), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(svc.is_held(&lock).await.unwrap());
        extender.stop().await;
    }
}
