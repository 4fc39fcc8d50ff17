#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **execflow-dlq** – the dead-letter queue.
//!
//! [`DlqStore`] is the sole source of truth for parked events: the retry
//! pipeline escalates into it, operators requeue or discard out of it
//! through [`http::dlq_router`]. A [`DlqEntry`] may wrap either a fully
//! decoded [`Event`] or, for poison-pill messages that never parsed, the
//! raw bytes alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use execflow_events::Event;
use execflow_hlc::HlcClock;
use execflow_ids::{EventId, ExecutionId};
use execflow_queue::{queue_payload_to_event, QueuePublisher};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod http;

/// Default page size for [`DlqStore::list_entries`].
pub const DEFAULT_PAGE_SIZE: usize = 100;
/// Upper bound on a caller-requested page size.
pub const MAX_PAGE_SIZE: usize = 1000;
/// Default retention window for a parked entry, from the moment it enters the DLQ.
pub const DEFAULT_RETENTION_DAYS: i64 = 28;

//─────────────────────────────
//  Types
//─────────────────────────────

/// Why a message ended up parked in the DLQ.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClassification {
    /// Likely to succeed on its own given time; the retry pipeline already
    /// exhausted its tiers.
    Transient,
    /// Will never succeed without operator intervention.
    Permanent,
    /// The message itself is invalid (parse failure, checksum mismatch, ...).
    Validation,
    /// Failure was due to resource exhaustion (memory, disk, quota).
    Resource,
    /// Cause could not be determined.
    Unknown,
}

/// Retry bookkeeping carried alongside a parked event, when one exists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryMetadata {
    /// The very first attempt's event id.
    pub original_event_id: EventId,
    /// Attempt number that led to this entry.
    pub current_attempt: u32,
    /// The configured ceiling at the time this entry was created.
    pub max_attempt: u32,
    /// When the first attempt ran.
    pub first_attempt_at: DateTime<Utc>,
    /// When the most recent attempt ran.
    pub last_attempt_at: DateTime<Utc>,
    /// The error from the most recent attempt.
    pub last_error: String,
}

/// How a [`DlqEntry`] was resolved. Write-once: see [`DlqEntry::resolution`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// Re-published to a queue for another attempt.
    Requeued,
    /// Permanently dropped by operator decision.
    Discarded,
    /// Resolved out-of-band; recorded for the audit trail.
    ManualFix,
    /// Removed by [`DlqStore::cleanup_expired`] without operator action.
    Expired,
}

/// The terminal disposition of a [`DlqEntry`]. Once set, it is never
/// replaced — both [`DlqStore::requeue_entry`] and
/// [`DlqStore::discard_entry`] fail with [`DlqError::AlreadyResolved`] on an
/// entry that already carries one.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Resolution {
    /// How the entry was resolved.
    pub status: ResolutionStatus,
    /// Who (or what) resolved it.
    pub resolver: String,
    /// When it was resolved.
    pub resolved_at: DateTime<Utc>,
    /// Free-form operator notes; required for a discard.
    pub notes: String,
    /// The event id produced by a requeue, if this resolution is a requeue.
    pub retry_event_id: Option<EventId>,
}

/// A message parked in the dead-letter queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Monotonic local id, e.g. `dlq-42`. Assigned by [`DlqStore::add_entry`];
    /// any value set here before adding is overwritten.
    pub id: String,
    /// The decoded event, when the wire payload parsed successfully.
    pub event: Option<Event>,
    /// The exact bytes that were published, preserved even when `event` is `None`.
    pub raw_payload: Vec<u8>,
    /// Retry history, when this entry arrived via the retry pipeline.
    pub retry_metadata: Option<RetryMetadata>,
    /// Human-readable explanation of why this message was parked.
    pub failure_reason: String,
    /// Classification driving default handling and operator triage.
    pub failure_classification: FailureClassification,
    /// When this entry was parked.
    pub entered_dlq_at: DateTime<Utc>,
    /// When this entry is eligible for [`DlqStore::cleanup_expired`].
    pub expires_at: DateTime<Utc>,
    /// True if an operator must look at this before it can resolve itself.
    /// Always true for `Permanent` and `Unknown` classifications.
    pub manual_review_required: bool,
    /// Write-once terminal disposition.
    pub resolution: Option<Resolution>,
}

impl DlqEntry {
    /// Build an entry for a fully decoded event that exhausted its retries
    /// or was deemed non-retryable.
    pub fn for_event(
        event: Event,
        failure_reason: impl Into<String>,
        classification: FailureClassification,
        retry_metadata: Option<RetryMetadata>,
    ) -> Self {
        let now = Utc::now();
        let raw_payload = serde_json::to_vec(&event).unwrap_or_default();
        let manual_review_required = matches!(
            classification,
            FailureClassification::Permanent | FailureClassification::Unknown
        );
        DlqEntry {
            id: String::new(),
            event: Some(event),
            raw_payload,
            retry_metadata,
            failure_reason: failure_reason.into(),
            failure_classification: classification,
            entered_dlq_at: now,
            expires_at: now + chrono::Duration::days(DEFAULT_RETENTION_DAYS),
            manual_review_required,
            resolution: None,
        }
    }

    /// Build an entry for a message that could not even be decoded as an
    /// [`Event`] — a poison pill. Always classified `validation`, always
    /// requires manual review.
    pub fn for_poison_pill(raw_payload: Vec<u8>, parse_error: impl std::fmt::Display) -> Self {
        let now = Utc::now();
        DlqEntry {
            id: String::new(),
            event: None,
            raw_payload,
            retry_metadata: None,
            failure_reason: format!("failed to parse event: {parse_error}"),
            failure_classification: FailureClassification::Validation,
            entered_dlq_at: now,
            expires_at: now + chrono::Duration::days(DEFAULT_RETENTION_DAYS),
            manual_review_required: true,
            resolution: None,
        }
    }
}

/// Decode a wire message received on the DLQ topic. Prefers a structured
/// [`DlqEntry`]; if that fails, falls back to decoding the bytes as a bare
/// [`Event`] (wrapping it with classification `unknown`); if that also
/// fails, the bytes are kept verbatim with `event: None`.
pub fn decode_dlq_wire_message(bytes: &[u8]) -> DlqEntry {
    if let Ok(entry) = serde_json::from_slice::<DlqEntry>(bytes) {
        return entry;
    }
    tracing::warn!("dlq message did not decode as a structured entry; falling back to raw event decode");
    match queue_payload_to_event(bytes) {
        Ok(event) => DlqEntry::for_event(
            event,
            "recovered via raw event fallback decode",
            FailureClassification::Unknown,
            None,
        ),
        Err(err) => DlqEntry::for_poison_pill(bytes.to_vec(), err),
    }
}

//─────────────────────────────
//  Filtering, paging, stats
//─────────────────────────────

/// Filter criteria for [`DlqStore::list_entries`].
#[derive(Clone, Debug, Default)]
pub struct DlqFilter {
    /// Restrict to a single execution.
    pub execution_id: Option<ExecutionId>,
    /// Restrict to a single event type.
    pub event_type: Option<String>,
    /// Restrict to a single classification.
    pub failure_classification: Option<FailureClassification>,
    /// Only entries requiring manual review.
    pub manual_review_only: bool,
    /// Include already-resolved entries (excluded by default).
    pub include_resolved: bool,
    /// Only entries parked at or after this time.
    pub entered_after: Option<DateTime<Utc>>,
    /// Only entries parked at or before this time.
    pub entered_before: Option<DateTime<Utc>>,
    /// Page size; `0` means [`DEFAULT_PAGE_SIZE`], clamped to [`MAX_PAGE_SIZE`].
    pub limit: usize,
    /// Offset into the (descending, by `entered_dlq_at`) result set.
    pub offset: usize,
}

/// One page of [`DlqStore::list_entries`] results.
#[derive(Clone, Debug, Serialize)]
pub struct DlqPage {
    /// The entries on this page, most-recently-parked first.
    pub entries: Vec<DlqEntry>,
    /// Total entries matching the filter, across all pages.
    pub total: usize,
    /// True if further pages remain.
    pub has_more: bool,
}

/// Aggregate counts and ages across the whole store.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DlqStats {
    /// Total entries, resolved or not.
    pub total: usize,
    /// Counts keyed by [`FailureClassification`] (lower-case).
    pub by_classification: HashMap<String, usize>,
    /// Counts keyed by event type.
    pub by_event_type: HashMap<String, usize>,
    /// Counts keyed by [`ResolutionStatus`] (lower-case), resolved entries only.
    pub by_resolution_status: HashMap<String, usize>,
    /// The oldest `entered_dlq_at` across all entries.
    pub oldest_entered_at: Option<DateTime<Utc>>,
    /// The newest `entered_dlq_at` across all entries.
    pub newest_entered_at: Option<DateTime<Utc>>,
    /// Mean age, in minutes, of unresolved entries.
    pub average_pending_age_minutes: f64,
    /// Unresolved entries requiring manual review.
    pub requires_review_count: usize,
}

/// Body of a requeue request.
#[derive(Clone, Debug, Deserialize)]
pub struct RequeueRequest {
    /// Who is requeuing this entry.
    pub resolved_by: String,
    /// Optional operator notes.
    #[serde(default)]
    pub notes: Option<String>,
    /// Queue to publish the new event to; defaults to the store's main queue.
    #[serde(default)]
    pub target_queue: Option<String>,
    /// If true, clears prior retry bookkeeping tags on the new event.
    #[serde(default)]
    pub reset_retry_count: bool,
}

/// Body of a discard request. `notes` is mandatory.
#[derive(Clone, Debug, Deserialize)]
pub struct DiscardRequest {
    /// Who is discarding this entry.
    pub resolved_by: String,
    /// Mandatory justification.
    pub notes: String,
}

/// Errors raised by a [`DlqStore`].
#[derive(Debug, Error)]
pub enum DlqError {
    /// No entry with the given id.
    #[error("dlq entry not found: {0}")]
    NotFound(String),
    /// The entry already carries a [`Resolution`].
    #[error("dlq entry already resolved: {0}")]
    AlreadyResolved(String),
    /// The requested resolution is invalid (e.g. empty discard notes, or no
    /// parseable event to requeue).
    #[error("invalid resolution: {0}")]
    InvalidResolution(String),
    /// The backend (e.g. Redis, or the injected publisher) failed.
    #[error("dlq backend error: {0}")]
    Backend(String),
}

//─────────────────────────────
//  Store trait
//─────────────────────────────

/// Capability set for the dead-letter queue: the sole source of truth for
/// parked messages.
#[async_trait]
pub trait DlqStore: Send + Sync {
    /// Park `entry`, assigning it a fresh id. Returns the assigned id.
    async fn add_entry(&self, entry: DlqEntry) -> Result<String, DlqError>;

    /// Fetch a single entry by id.
    async fn get_entry(&self, id: &str) -> Result<DlqEntry, DlqError>;

    /// List entries matching `filter`, newest-parked first.
    async fn list_entries(&self, filter: &DlqFilter) -> Result<DlqPage, DlqError>;

    /// Requeue entry `id`: publishes a fresh event (new id, HLC, created-at,
    /// tagged `requeued_from_dlq`) to `req.target_queue` or the store's main
    /// queue, then — only on publish success — records the resolution.
    /// Fails with [`DlqError::NotFound`] if absent, [`DlqError::AlreadyResolved`]
    /// if already resolved, or [`DlqError::InvalidResolution`] if the entry
    /// has no parseable event.
    async fn requeue_entry(&self, id: &str, req: RequeueRequest) -> Result<EventId, DlqError>;

    /// Discard entry `id`, requiring non-empty notes. Fails with
    /// [`DlqError::NotFound`]/[`DlqError::AlreadyResolved`] as above.
    async fn discard_entry(&self, id: &str, req: DiscardRequest) -> Result<(), DlqError>;

    /// Aggregate statistics across the whole store.
    async fn stats(&self) -> Result<DlqStats, DlqError>;

    /// Remove entries past their `expires_at`; returns the number removed.
    async fn cleanup_expired(&self) -> Result<u64, DlqError>;
}

//─────────────────────────────
//  In-memory backend
//─────────────────────────────

/// In-memory [`DlqStore`]. Requeues publish through an injected
/// [`QueuePublisher`], so this store composes with any broker adapter
/// (including the in-process `mem://` broker).
pub struct MemoryDlqStore {
    entries: DashMap<String, DlqEntry>,
    counter: AtomicU64,
    clock: HlcClock,
    publisher: Arc<dyn QueuePublisher>,
    main_queue: String,
}

impl MemoryDlqStore {
    /// Construct an empty store that requeues to `main_queue` by default.
    pub fn new(publisher: Arc<dyn QueuePublisher>, main_queue: impl Into<String>) -> Self {
        MemoryDlqStore {
            entries: DashMap::new(),
            counter: AtomicU64::new(0),
            clock: HlcClock::new(),
            publisher,
            main_queue: main_queue.into(),
        }
    }
}

fn classification_key(c: FailureClassification) -> &'static str {
    match c {
        FailureClassification::Transient => "transient",
        FailureClassification::Permanent => "permanent",
        FailureClassification::Validation => "validation",
        FailureClassification::Resource => "resource",
        FailureClassification::Unknown => "unknown",
    }
}

fn resolution_key(s: ResolutionStatus) -> &'static str {
    match s {
        ResolutionStatus::Requeued => "requeued",
        ResolutionStatus::Discarded => "discarded",
        ResolutionStatus::ManualFix => "manual_fix",
        ResolutionStatus::Expired => "expired",
    }
}

#[async_trait]
impl DlqStore for MemoryDlqStore {
    async fn add_entry(&self, mut entry: DlqEntry) -> Result<String, DlqError> {
        let id = format!("dlq-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
        entry.id = id.clone();
        self.entries.insert(id.clone(), entry);
        Ok(id)
    }

    async fn get_entry(&self, id: &str) -> Result<DlqEntry, DlqError> {
        self.entries
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| DlqError::NotFound(id.to_string()))
    }

    async fn list_entries(&self, filter: &DlqFilter) -> Result<DlqPage, DlqError> {
        let mut matched: Vec<DlqEntry> = self
            .entries
            .iter()
            .filter_map(|kv| {
                let e = kv.value();
                if !filter.include_resolved && e.resolution.is_some() {
                    return None;
                }
                if let Some(exec) = filter.execution_id {
                    if e.event.as_ref().map(|ev| ev.execution_id) != Some(exec) {
                        return None;
                    }
                }
                if let Some(ref et) = filter.event_type {
                    if e.event.as_ref().map(|ev| ev.event_type.as_str()) != Some(et.as_str()) {
                        return None;
                    }
                }
                if let Some(fc) = filter.failure_classification {
                    if e.failure_classification != fc {
                        return None;
                    }
                }
                if filter.manual_review_only && !e.manual_review_required {
                    return None;
                }
                if let Some(after) = filter.entered_after {
                    if e.entered_dlq_at < after {
                        return None;
                    }
                }
                if let Some(before) = filter.entered_before {
                    if e.entered_dlq_at > before {
                        return None;
                    }
                }
                Some(e.clone())
            })
            .collect();

        matched.sort_by(|a, b| b.entered_dlq_at.cmp(&a.entered_dlq_at));
        let total = matched.len();
        let limit = if filter.limit == 0 { DEFAULT_PAGE_SIZE } else { filter.limit.min(MAX_PAGE_SIZE) };

        let page = if filter.offset >= total {
            Vec::new()
        } else {
            matched.into_iter().skip(filter.offset).take(limit).collect::<Vec<_>>()
        };
        let has_more = filter.offset + page.len() < total;
        Ok(DlqPage { entries: page, total, has_more })
    }

    async fn requeue_entry(&self, id: &str, req: RequeueRequest) -> Result<EventId, DlqError> {
        let original = {
            let entry = self.entries.get(id).ok_or_else(|| DlqError::NotFound(id.to_string()))?;
            if entry.resolution.is_some() {
                return Err(DlqError::AlreadyResolved(id.to_string()));
            }
            entry
                .event
                .clone()
                .ok_or_else(|| DlqError::InvalidResolution("entry has no parseable event to requeue".to_string()))?
        };

        let mut new_event = original.begin_retry(self.clock.now());
        if req.reset_retry_count {
            new_event.metadata.tags.remove("retry_attempt");
            new_event.metadata.tags.remove("retry_level");
            new_event.metadata.tags.remove("last_error");
            new_event.original_event_id = None;
        }
        new_event.metadata.tags.insert("requeued_from_dlq".to_string(), id.to_string());
        new_event.metadata.tags.insert("requeued_by".to_string(), req.resolved_by.clone());
        new_event.metadata.tags.insert("requeued_at".to_string(), Utc::now().to_rfc3339());

        let target_queue = req.target_queue.clone().unwrap_or_else(|| self.main_queue.clone());
        self.publisher
            .publish(&target_queue, &new_event)
            .await
            .map_err(|e| DlqError::Backend(e.to_string()))?;

        let mut entry = self.entries.get_mut(id).ok_or_else(|| DlqError::NotFound(id.to_string()))?;
        entry.resolution = Some(Resolution {
            status: ResolutionStatus::Requeued,
            resolver: req.resolved_by,
            resolved_at: Utc::now(),
            notes: req.notes.unwrap_or_default(),
            retry_event_id: Some(new_event.event_id),
        });
        Ok(new_event.event_id)
    }

    async fn discard_entry(&self, id: &str, req: DiscardRequest) -> Result<(), DlqError> {
        if req.notes.trim().is_empty() {
            return Err(DlqError::InvalidResolution("discard notes must not be empty".to_string()));
        }
        let mut entry = self.entries.get_mut(id).ok_or_else(|| DlqError::NotFound(id.to_string()))?;
        if entry.resolution.is_some() {
            return Err(DlqError::AlreadyResolved(id.to_string()));
        }
        entry.resolution = Some(Resolution {
            status: ResolutionStatus::Discarded,
            resolver: req.resolved_by,
            resolved_at: Utc::now(),
            notes: req.notes,
            retry_event_id: None,
        });
        Ok(())
    }

    async fn stats(&self) -> Result<DlqStats, DlqError> {
        let mut stats = DlqStats::default();
        let now = Utc::now();
        let mut pending_age_minutes_total = 0.0;
        let mut pending_count = 0usize;

        for kv in self.entries.iter() {
            let e = kv.value();
            stats.total += 1;
            *stats.by_classification.entry(classification_key(e.failure_classification).to_string()).or_insert(0) += 1;
            if let Some(event) = &e.event {
                *stats.by_event_type.entry(event.event_type.clone()).or_insert(0) += 1;
            }
            if let Some(res) = &e.resolution {
                *stats.by_resolution_status.entry(resolution_key(res.status).to_string()).or_insert(0) += 1;
            } else {
                pending_count += 1;
                let age_minutes = now.signed_duration_since(e.entered_dlq_at).num_seconds() as f64 / 60.0;
                pending_age_minutes_total += age_minutes;
                if e.manual_review_required {
                    stats.requires_review_count += 1;
                }
            }
            stats.oldest_entered_at = Some(stats.oldest_entered_at.map_or(e.entered_dlq_at, |o| o.min(e.entered_dlq_at)));
            stats.newest_entered_at = Some(stats.newest_entered_at.map_or(e.entered_dlq_at, |n| n.max(e.entered_dlq_at)));
        }

        stats.average_pending_age_minutes = if pending_count > 0 {
            pending_age_minutes_total / pending_count as f64
        } else {
            0.0
        };
        Ok(stats)
    }

    async fn cleanup_expired(&self) -> Result<u64, DlqError> {
        let now = Utc::now();
        let mut removed = 0u64;
        self.entries.retain(|_, e| {
            let keep = e.expires_at > now;
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
    //! Redis-backed [`DlqStore`]. Entries live at `dlq:{id}` as JSON; `dlq:index`
    //! is a sorted set (score = `entered_dlq_at` as a unix timestamp) giving the
    //! Redis analogue of the in-memory backend's newest-first ordering; `dlq:counter`
    //! is an atomic `INCR` counter assigning ids.
    use super::*;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;

    /// Redis-backed dead-letter queue store.
    pub struct RedisDlqStore {
        conn: ConnectionManager,
        clock: HlcClock,
        publisher: Arc<dyn QueuePublisher>,
        main_queue: String,
    }

    impl RedisDlqStore {
        /// Wrap an established connection manager.
        pub fn new(conn: ConnectionManager, publisher: Arc<dyn QueuePublisher>, main_queue: impl Into<String>) -> Self {
            RedisDlqStore { conn, clock: HlcClock::new(), publisher, main_queue: main_queue.into() }
        }

        fn entry_key(id: &str) -> String {
            format!("dlq:{id}")
        }

        async fn load(&self, id: &str) -> Result<DlqEntry, DlqError> {
            let mut conn = self.conn.clone();
            let raw: Option<String> = conn
                .get(Self::entry_key(id))
                .await
                .map_err(|e| DlqError::Backend(e.to_string()))?;
            match raw {
                Some(s) => serde_json::from_str(&s).map_err(|e| DlqError::Backend(e.to_string())),
                None => Err(DlqError::NotFound(id.to_string())),
            }
        }

        async fn save(&self, entry: &DlqEntry) -> Result<(), DlqError> {
            let mut conn = self.conn.clone();
            let payload = serde_json::to_string(entry).map_err(|e| DlqError::Backend(e.to_string()))?;
            conn.set::<_, _, ()>(Self::entry_key(&entry.id), payload)
                .await
                .map_err(|e| DlqError::Backend(e.to_string()))?;
            conn.zadd::<_, _, _, ()>("dlq:index", &entry.id, entry.entered_dlq_at.timestamp())
                .await
                .map_err(|e| DlqError::Backend(e.to_string()))
        }
    }

    #[async_trait]
    impl DlqStore for RedisDlqStore {
        async fn add_entry(&self, mut entry: DlqEntry) -> Result<String, DlqError> {
            let mut conn = self.conn.clone();
            let next: u64 = conn.incr("dlq:counter", 1).await.map_err(|e| DlqError::Backend(e.to_string()))?;
            let id = format!("dlq-{next}");
            entry.id = id.clone();
            self.save(&entry).await?;
            Ok(id)
        }

        async fn get_entry(&self, id: &str) -> Result<DlqEntry, DlqError> {
            self.load(id).await
        }

        async fn list_entries(&self, filter: &DlqFilter) -> Result<DlqPage, DlqError> {
            let mut conn = self.conn.clone();
            let ids: Vec<String> = conn
                .zrevrange("dlq:index", 0, -1)
                .await
                .map_err(|e| DlqError::Backend(e.to_string()))?;

            let mut matched = Vec::new();
            for id in ids {
                let entry = match self.load(&id).await {
                    Ok(e) => e,
                    Err(DlqError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                if !filter.include_resolved && entry.resolution.is_some() {
                    continue;
                }
                if let Some(exec) = filter.execution_id {
                    if entry.event.as_ref().map(|ev| ev.execution_id) != Some(exec) {
                        continue;
                    }
                }
                if let Some(ref et) = filter.event_type {
                    if entry.event.as_ref().map(|ev| ev.event_type.as_str()) != Some(et.as_str()) {
                        continue;
                    }
                }
                if let Some(fc) = filter.failure_classification {
                    if entry.failure_classification != fc {
                        continue;
                    }
                }
                if filter.manual_review_only && !entry.manual_review_required {
                    continue;
                }
                if let Some(after) = filter.entered_after {
                    if entry.entered_dlq_at < after {
                        continue;
                    }
                }
                if let Some(before) = filter.entered_before {
                    if entry.entered_dlq_at > before {
                        continue;
                    }
                }
                matched.push(entry);
            }

            let total = matched.len();
            let limit = if filter.limit == 0 { DEFAULT_PAGE_SIZE } else { filter.limit.min(MAX_PAGE_SIZE) };
            let page = if filter.offset >= total {
                Vec::new()
            } else {
                matched.into_iter().skip(filter.offset).take(limit).collect::<Vec<_>>()
            };
            let has_more = filter.offset + page.len() < total;
            Ok(DlqPage { entries: page, total, has_more })
        }

        async fn requeue_entry(&self, id: &str, req: RequeueRequest) -> Result<EventId, DlqError> {
            let mut entry = self.load(id).await?;
            if entry.resolution.is_some() {
                return Err(DlqError::AlreadyResolved(id.to_string()));
            }
            let original = entry
                .event
                .clone()
                .ok_or_else(|| DlqError::InvalidResolution("entry has no parseable event to requeue".to_string()))?;

            let mut new_event = original.begin_retry(self.clock.now());
            if req.reset_retry_count {
                new_event.metadata.tags.remove("retry_attempt");
                new_event.metadata.tags.remove("retry_level");
                new_event.metadata.tags.remove("last_error");
                new_event.original_event_id = None;
            }
            new_event.metadata.tags.insert("requeued_from_dlq".to_string(), id.to_string());
            new_event.metadata.tags.insert("requeued_by".to_string(), req.resolved_by.clone());
            new_event.metadata.tags.insert("requeued_at".to_string(), Utc::now().to_rfc3339());

            let target_queue = req.target_queue.clone().unwrap_or_else(|| self.main_queue.clone());
            self.publisher
                .publish(&target_queue, &new_event)
                .await
                .map_err(|e| DlqError::Backend(e.to_string()))?;

            entry.resolution = Some(Resolution {
                status: ResolutionStatus::Requeued,
                resolver: req.resolved_by,
                resolved_at: Utc::now(),
                notes: req.notes.unwrap_or_default(),
                retry_event_id: Some(new_event.event_id),
            });
            self.save(&entry).await?;
            Ok(new_event.event_id)
        }

        async fn discard_entry(&self, id: &str, req: DiscardRequest) -> Result<(), DlqError> {
            if req.notes.trim().is_empty() {
                return Err(DlqError::InvalidResolution("discard notes must not be empty".to_string()));
            }
            let mut entry = self.load(id).await?;
            if entry.resolution.is_some() {
                return Err(DlqError::AlreadyResolved(id.to_string()));
            }
            entry.resolution = Some(Resolution {
                status: ResolutionStatus::Discarded,
                resolver: req.resolved_by,
                resolved_at: Utc::now(),
                notes: req.notes,
                retry_event_id: None,
            });
            self.save(&entry).await
        }

        async fn stats(&self) -> Result<DlqStats, DlqError> {
            let filter = DlqFilter { include_resolved: true, limit: MAX_PAGE_SIZE, ..DlqFilter::default() };
            let page = self.list_entries(&filter).await?;
            let mut stats = DlqStats::default();
            let now = Utc::now();
            let mut pending_age_minutes_total = 0.0;
            let mut pending_count = 0usize;

            for e in &page.entries {
                stats.total += 1;
                *stats.by_classification.entry(classification_key(e.failure_classification).to_string()).or_insert(0) += 1;
                if let Some(event) = &e.event {
                    *stats.by_event_type.entry(event.event_type.clone()).or_insert(0) += 1;
                }
                if let Some(res) = &e.resolution {
                    *stats.by_resolution_status.entry(resolution_key(res.status).to_string()).or_insert(0) += 1;
                } else {
                    pending_count += 1;
                    let age_minutes = now.signed_duration_since(e.entered_dlq_at).num_seconds() as f64 / 60.0;
                    pending_age_minutes_total += age_minutes;
                    if e.manual_review_required {
                        stats.requires_review_count += 1;
                    }
                }
                stats.oldest_entered_at = Some(stats.oldest_entered_at.map_or(e.entered_dlq_at, |o| o.min(e.entered_dlq_at)));
                stats.newest_entered_at = Some(stats.newest_entered_at.map_or(e.entered_dlq_at, |n| n.max(e.entered_dlq_at)));
            }

            stats.average_pending_age_minutes = if pending_count > 0 {
                pending_age_minutes_total / pending_count as f64
            } else {
                0.0
            };
            Ok(stats)
        }

        async fn cleanup_expired(&self) -> Result<u64, DlqError> {
            let filter = DlqFilter { include_resolved: true, limit: MAX_PAGE_SIZE, ..DlqFilter::default() };
            let page = self.list_entries(&filter).await?;
            let now = Utc::now();
            let mut conn = self.conn.clone();
            let mut removed = 0u64;
            for entry in page.entries {
                if entry.expires_at <= now {
                    conn.del::<_, ()>(Self::entry_key(&entry.id)).await.map_err(|e| DlqError::Backend(e.to_string()))?;
                    conn.zrem::<_, _, ()>("dlq:index", &entry.id).await.map_err(|e| DlqError::Backend(e.to_string()))?;
                    removed += 1;
                }
            }
            Ok(removed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execflow_events::{EventMetadata, ProcessingHints};
    use execflow_queue::QueueError;
    use std::sync::Mutex;

    struct RecordingPublisher {
        published: Mutex<Vec<(String, Event)>>,
        fail: bool,
    }

    impl RecordingPublisher {
        fn new(fail: bool) -> Self {
            RecordingPublisher { published: Mutex::new(Vec::new()), fail }
        }
    }

    #[async_trait]
    impl QueuePublisher for RecordingPublisher {
        async fn publish(&self, queue: &str, event: &Event) -> Result<(), QueueError> {
            if self.fail {
                return Err(QueueError::Broker("simulated failure".to_string()));
            }
            self.published.lock().unwrap().push((queue.to_string(), event.clone()));
            Ok(())
        }
    }

    fn sample_event() -> Event {
        let clock = HlcClock::new();
        Event::new(
            ExecutionId::new(),
            EventId::new(),
            "feature.execution.step_failed",
            1,
            clock.now(),
            b"payload".to_vec(),
            EventMetadata {
                producer_id: "retry-pipeline".into(),
                producer_version: "1".into(),
                tenant: None,
                environment: None,
                tags: HashMap::new(),
                trace_context: None,
            },
            ProcessingHints::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn add_entry_assigns_a_monotonic_id() {
        let publisher = Arc::new(RecordingPublisher::new(false));
        let store = MemoryDlqStore::new(publisher, "feature.events");
        let id1 = store.add_entry(DlqEntry::for_event(sample_event(), "boom", FailureClassification::Transient, None)).await.unwrap();
        let id2 = store.add_entry(DlqEntry::for_event(sample_event(), "boom", FailureClassification::Transient, None)).await.unwrap();
        assert_eq!(id1, "dlq-1");
        assert_eq!(id2, "dlq-2");
    }

    #[tokio::test]
    async fn get_entry_on_missing_id_is_not_found() {
        let publisher = Arc::new(RecordingPublisher::new(false));
        let store = MemoryDlqStore::new(publisher, "feature.events");
        assert!(matches!(store.get_entry("dlq-404").await, Err(DlqError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_entries_excludes_resolved_by_default_and_can_include_them() {
        let publisher = Arc::new(RecordingPublisher::new(false));
        let store = MemoryDlqStore::new(publisher, "feature.events");
        let id = store.add_entry(DlqEntry::for_event(sample_event(), "boom", FailureClassification::Transient, None)).await.unwrap();
        store.discard_entry(&id, DiscardRequest { resolved_by: "alice".into(), notes: "not worth it".into() }).await.unwrap();

        let default_page = store.list_entries(&DlqFilter::default()).await.unwrap();
        assert_eq!(default_page.total, 0);

        let filter = DlqFilter { include_resolved: true, ..Default::default() };
        let all_page = store.list_entries(&filter).await.unwrap();
        assert_eq!(all_page.total, 1);
    }

    #[tokio::test]
    async fn list_entries_offset_past_total_is_empty_with_no_more() {
        let publisher = Arc::new(RecordingPublisher::new(false));
        let store = MemoryDlqStore::new(publisher, "feature.events");
        store.add_entry(DlqEntry::for_event(sample_event(), "boom", FailureClassification::Transient, None)).await.unwrap();

        let filter = DlqFilter { offset: 50, ..Default::default() };
        let page = store.list_entries(&filter).await.unwrap();
        assert!(page.entries.is_empty());
        assert!(!page.has_more);
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn requeue_publishes_a_fresh_event_and_sets_resolution() {
        let publisher = Arc::new(RecordingPublisher::new(false));
        let store = MemoryDlqStore::new(publisher.clone(), "feature.events");
        let original = sample_event();
        let id = store.add_entry(DlqEntry::for_event(original.clone(), "boom", FailureClassification::Transient, None)).await.unwrap();

        let new_id = store
            .requeue_entry(&id, RequeueRequest { resolved_by: "alice".into(), notes: Some("retry it".into()), target_queue: None, reset_retry_count: true })
            .await
            .unwrap();
        assert_ne!(new_id, original.event_id);

        let entry = store.get_entry(&id).await.unwrap();
        let resolution = entry.resolution.unwrap();
        assert!(matches!(resolution.status, ResolutionStatus::Requeued));
        assert_eq!(resolution.retry_event_id, Some(new_id));

        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "feature.events");
        assert_eq!(published[0].1.metadata.tags.get("requeued_from_dlq"), Some(&id));
    }

    #[tokio::test]
    async fn requeue_is_rolled_back_on_publish_failure() {
        let publisher = Arc::new(RecordingPublisher::new(true));
        let store = MemoryDlqStore::new(publisher, "feature.events");
        let id = store.add_entry(DlqEntry::for_event(sample_event(), "boom", FailureClassification::Transient, None)).await.unwrap();

        let err = store
            .requeue_entry(&id, RequeueRequest { resolved_by: "alice".into(), notes: None, target_queue: None, reset_retry_count: false })
            .await
            .unwrap_err();
        assert!(matches!(err, DlqError::Backend(_)));

        let entry = store.get_entry(&id).await.unwrap();
        assert!(entry.resolution.is_none(), "a failed publish must not leave a resolution behind");
    }

    #[tokio::test]
    async fn requeue_fails_for_a_poison_pill_with_no_event() {
        let publisher = Arc::new(RecordingPublisher::new(false));
        let store = MemoryDlqStore::new(publisher, "feature.events");
        let id = store.add_entry(DlqEntry::for_poison_pill(b"not json".to_vec(), "parse error")).await.unwrap();
        let err = store
            .requeue_entry(&id, RequeueRequest { resolved_by: "alice".into(), notes: None, target_queue: None, reset_retry_count: false })
            .await
            .unwrap_err();
        assert!(matches!(err, DlqError::InvalidResolution(_)));
    }

    #[tokio::test]
    async fn resolution_is_write_once() {
        let publisher = Arc::new(RecordingPublisher::new(false));
        let store = MemoryDlqStore::new(publisher, "feature.events");
        let id = store.add_entry(DlqEntry::for_event(sample_event(), "boom", FailureClassification::Transient, None)).await.unwrap();
        store.discard_entry(&id, DiscardRequest { resolved_by: "alice".into(), notes: "dropping it".into() }).await.unwrap();

        let err = store.discard_entry(&id, DiscardRequest { resolved_by: "bob".into(), notes: "again".into() }).await.unwrap_err();
        assert!(matches!(err, DlqError::AlreadyResolved(_)));

        let err2 = store
            .requeue_entry(&id, RequeueRequest { resolved_by: "bob".into(), notes: None, target_queue: None, reset_retry_count: false })
            .await
            .unwrap_err();
        assert!(matches!(err2, DlqError::AlreadyResolved(_)));
    }

    #[tokio::test]
    async fn discard_requires_non_empty_notes() {
        let publisher = Arc::new(RecordingPublisher::new(false));
        let store = MemoryDlqStore::new(publisher, "feature.events");
        let id = store.add_entry(DlqEntry::for_event(sample_event(), "boom", FailureClassification::Transient, None)).await.unwrap();
        let err = store.discard_entry(&id, DiscardRequest { resolved_by: "alice".into(), notes: "  ".into() }).await.unwrap_err();
        assert!(matches!(err, DlqError::InvalidResolution(_)));
    }

    #[tokio::test]
    async fn cleanup_expired_removes_only_past_expiry() {
        let publisher = Arc::new(RecordingPublisher::new(false));
        let store = MemoryDlqStore::new(publisher, "feature.events");
        let mut expired = DlqEntry::for_event(sample_event(), "boom", FailureClassification::Transient, None);
        expired.expires_at = Utc::now() - chrono::Duration::days(1);
        store.add_entry(expired).await.unwrap();
        store.add_entry(DlqEntry::for_event(sample_event(), "boom", FailureClassification::Transient, None)).await.unwrap();

        let removed = store.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_entries(&DlqFilter::default()).await.unwrap().total, 1);
    }

    #[test]
    fn decode_falls_back_to_poison_pill_on_unparseable_bytes() {
        let entry = decode_dlq_wire_message(b"not json at all");
        assert!(entry.event.is_none());
        assert!(entry.failure_reason.starts_with("failed to parse event"));
        assert!(entry.manual_review_required);
        assert!(matches!(entry.failure_classification, FailureClassification::Validation));
    }
}
