#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **execflow-events** – the canonical event envelope.
//!
//! Every message that crosses a queue boundary in this platform is an
//! [`Event`]: identity, ordering, causality, a checksummed payload, and a
//! bag of producer metadata and processing hints. This crate only models
//! the envelope and the input type the gateway constructs the first event
//! from ([`FeatureRequest`]); queue wire encoding lives in the facade crate
//! and business payload semantics are opaque bytes here.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use execflow_hlc::HybridTimestamp;
use execflow_ids::{EventId, ExecutionId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

//─────────────────────────────
//  Checksum
//─────────────────────────────

/// Lower-case hex SHA-256 digest of `bytes`, used as the payload checksum.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

//─────────────────────────────
//  Priority & hints
//─────────────────────────────

/// Relative processing priority carried by an event's hints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work; no latency expectation.
    Low,
    /// Default priority.
    Normal,
    /// Expedited; scheduling may prefer these over `Normal`.
    High,
    /// Operator- or incident-driven; highest scheduling preference.
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Processing hints: retry/timeout/priority guidance for downstream consumers.
///
/// `max_retries` is advisory only — the retry pipeline's tier accounting is
/// what actually governs escalation to the next tier or to the DLQ. It is
/// retained here purely so operators and callers can inspect the configured
/// ceiling; tests assert it never itself gates escalation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingHints {
    /// Scheduling priority.
    pub priority: Priority,
    /// Advisory retry ceiling; see the struct-level note.
    pub max_retries: u32,
    /// Base delay used by the retry policy's backoff computation.
    pub retry_base_delay: Duration,
    /// Cap on the retry policy's backoff computation.
    pub retry_max_delay: Duration,
    /// Maximum time a business handler may run before being treated as failed.
    pub processing_timeout: Duration,
    /// If true, a handler may choose to skip this event on failure instead of
    /// escalating it through the retry pipeline.
    pub allow_skip_on_failure: bool,
}

impl Default for ProcessingHints {
    fn default() -> Self {
        ProcessingHints {
            priority: Priority::Normal,
            max_retries: 5,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            processing_timeout: Duration::from_secs(30),
            allow_skip_on_failure: false,
        }
    }
}

//─────────────────────────────
//  Metadata
//─────────────────────────────

/// W3C trace context, propagated as a `traceparent` (and optional
/// `tracestate`) header when present.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceContext {
    /// The W3C `traceparent` value.
    pub traceparent: String,
    /// The optional W3C `tracestate` value.
    pub tracestate: Option<String>,
}

/// Producer identity, tenancy, and free-form tags carried by every event.
///
/// Retries add `retry_attempt`, `retry_level`, `last_error`,
/// `original_event_id`, and `requeued_from_dlq` (among others) to `tags`;
/// this crate does not interpret those keys, it only carries them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Identifies the producing service.
    pub producer_id: String,
    /// Producer build/version string, for diagnosing behavior drift.
    pub producer_version: String,
    /// Tenant this event belongs to, when the deployment is multi-tenant.
    pub tenant: Option<String>,
    /// Deployment environment (`production`, `staging`, ...).
    pub environment: Option<String>,
    /// Free-form string tags.
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// W3C trace context, when the producer participates in distributed tracing.
    pub trace_context: Option<TraceContext>,
}

//─────────────────────────────
//  Event envelope
//─────────────────────────────

/// Errors raised when an [`Event`] fails to satisfy the platform's invariants.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    /// `execution_id` was [`ExecutionId::ZERO`].
    #[error("execution id must not be zero")]
    ZeroExecutionId,
    /// `correlation_id` was [`EventId::ZERO`].
    #[error("correlation id must not be zero")]
    ZeroCorrelationId,
    /// `event_type` was empty.
    #[error("event type must not be empty")]
    EmptyEventType,
    /// `sequence_number` was zero; sequence numbers start at 1.
    #[error("sequence number must be >= 1, got {0}")]
    InvalidSequenceNumber(u64),
    /// `payload` was empty.
    #[error("payload must not be empty")]
    EmptyPayload,
    /// The stored checksum did not match the payload bytes.
    #[error("payload checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        /// The checksum recorded on the envelope.
        expected: String,
        /// The checksum actually computed from `payload`.
        computed: String,
    },
}

/// The canonical message record routed through every queue in the platform.
///
/// See the crate-level documentation for the envelope's four groups of
/// fields: identity, ordering, causality, and payload/metadata/hints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    // Identity
    /// Identifier of this event.
    pub event_id: EventId,
    /// Partition key: the execution this event belongs to.
    pub execution_id: ExecutionId,
    /// Dotted `domain.aggregate.action` event type, e.g. `feature.execution.started`.
    pub event_type: String,
    /// Schema version of the payload, for forward-compatible decoding.
    pub schema_version: u32,

    // Ordering
    /// Per-execution monotonic sequence number, starting at 1.
    pub sequence_number: u64,
    /// Cross-partition hybrid logical clock timestamp.
    pub hlc_timestamp: HybridTimestamp,
    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,

    // Causality
    /// The event that directly caused this one, if any.
    pub causation_id: Option<EventId>,
    /// The root event of the execution; constant across an execution.
    pub correlation_id: EventId,
    /// Set on retries to the first attempt's event id; never overwritten.
    pub original_event_id: Option<EventId>,

    // Payload
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Lower-case hex SHA-256 of `payload`.
    pub payload_checksum: String,

    // Metadata & hints
    /// Producer metadata and free-form tags.
    pub metadata: EventMetadata,
    /// Processing hints (priority, retry/timeout guidance).
    pub hints: ProcessingHints,
}

impl Event {
    /// Construct a fresh, first-attempt event. `correlation_id` must already
    /// be known (the root event of the execution, or this event's own id if
    /// it is itself the root — callers decide).
    ///
    /// Fails if `execution_id`, `correlation_id`, `event_type`, or `payload`
    /// fail to satisfy the envelope invariants described on [`EventError`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        execution_id: ExecutionId,
        correlation_id: EventId,
        event_type: impl Into<String>,
        sequence_number: u64,
        hlc_timestamp: HybridTimestamp,
        payload: Vec<u8>,
        metadata: EventMetadata,
        hints: ProcessingHints,
    ) -> Result<Self, EventError> {
        let event_type = event_type.into();
        let checksum = sha256_hex(&payload);
        let event = Event {
            event_id: EventId::new(),
            execution_id,
            event_type,
            schema_version: 1,
            sequence_number,
            hlc_timestamp,
            created_at: Utc::now(),
            causation_id: None,
            correlation_id,
            original_event_id: None,
            payload,
            payload_checksum: checksum,
            metadata,
            hints,
        };
        event.validate()?;
        Ok(event)
    }

    /// Check every envelope invariant. `Event::new` always produces a valid
    /// event; `validate` exists for events deserialized off the wire.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.execution_id.is_zero() {
            return Err(EventError::ZeroExecutionId);
        }
        if self.correlation_id.is_zero() {
            return Err(EventError::ZeroCorrelationId);
        }
        if self.event_type.is_empty() {
            return Err(EventError::EmptyEventType);
        }
        if self.sequence_number == 0 {
            return Err(EventError::InvalidSequenceNumber(self.sequence_number));
        }
        if self.payload.is_empty() {
            return Err(EventError::EmptyPayload);
        }
        let computed = sha256_hex(&self.payload);
        if computed != self.payload_checksum {
            return Err(EventError::ChecksumMismatch {
                expected: self.payload_checksum.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// True iff the stored checksum matches the current payload bytes.
    pub fn checksum_matches(&self) -> bool {
        sha256_hex(&self.payload) == self.payload_checksum
    }

    /// Produce the envelope for a retry attempt of this event: a fresh
    /// `event_id`, `created_at`, and `hlc_timestamp`, with `original_event_id`
    /// preserved if this event already carries one (never overwritten on a
    /// re-retry) or set to this event's own id on the first retry.
    ///
    /// The caller (the retry pipeline) is responsible for assigning a fresh
    /// `sequence_number` from the execution's sequence manager and for
    /// updating the tag map with attempt bookkeeping.
    pub fn begin_retry(&self, next_hlc: HybridTimestamp) -> Event {
        let mut retry = self.clone();
        retry.original_event_id = Some(self.original_event_id.unwrap_or(self.event_id));
        retry.event_id = EventId::new();
        retry.created_at = Utc::now();
        retry.hlc_timestamp = next_hlc;
        retry
    }
}

//─────────────────────────────
//  ProcessingResult
//─────────────────────────────

/// The outcome of processing one event, as recorded by the deduplication store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingResult {
    /// The event this result is for.
    pub event_id: EventId,
    /// The execution the event belonged to.
    pub execution_id: ExecutionId,
    /// When processing completed.
    pub processed_at: DateTime<Utc>,
    /// Whether the business handler succeeded.
    pub success: bool,
    /// Machine-readable error code, when `success` is false.
    pub error_code: Option<String>,
    /// Human-readable error message, when `success` is false.
    pub error_message: Option<String>,
    /// Wall-clock processing duration, in milliseconds.
    pub duration_ms: u64,
    /// Event ids this processing run produced, if any.
    #[serde(default)]
    pub produced_event_ids: Vec<EventId>,
    /// Arbitrary structured result data, opaque to this crate.
    pub result_data: Option<serde_json::Value>,
}

impl ProcessingResult {
    /// Build a successful result.
    pub fn success(
        event_id: EventId,
        execution_id: ExecutionId,
        duration_ms: u64,
        produced_event_ids: Vec<EventId>,
        result_data: Option<serde_json::Value>,
    ) -> Self {
        ProcessingResult {
            event_id,
            execution_id,
            processed_at: Utc::now(),
            success: true,
            error_code: None,
            error_message: None,
            duration_ms,
            produced_event_ids,
            result_data,
        }
    }

    /// Build a failed result.
    pub fn failure(
        event_id: EventId,
        execution_id: ExecutionId,
        duration_ms: u64,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        ProcessingResult {
            event_id,
            execution_id,
            processed_at: Utc::now(),
            success: false,
            error_code: Some(error_code.into()),
            error_message: Some(error_message.into()),
            duration_ms,
            produced_event_ids: Vec::new(),
            result_data: None,
        }
    }
}

//─────────────────────────────
//  FeatureRequest (gateway input type)
//─────────────────────────────

const MAX_TITLE_LEN: usize = 200;
const MAX_DESCRIPTION_BYTES: usize = 10_240;

/// What kind of change a feature request describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureCategory {
    /// A net-new capability.
    NewFeature,
    /// A defect correction.
    BugFix,
    /// Internal restructuring with no behavior change.
    Refactor,
    /// Documentation-only change.
    Documentation,
    /// Test-only change.
    Test,
    /// Dependency version bump or replacement.
    Dependency,
}

/// The specification of the change to make, as supplied by the requester.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Specification {
    /// Short human title, at most [`MAX_TITLE_LEN`] characters.
    pub title: String,
    /// Full description, at most [`MAX_DESCRIPTION_BYTES`] bytes.
    pub description: String,
    /// Criteria the finished change must satisfy.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Files the change is expected to touch, if known up front.
    #[serde(default)]
    pub target_files: Vec<String>,
    /// Primary programming language of the target repository, if known.
    pub language: Option<String>,
    /// Classification of the change.
    pub category: Option<FeatureCategory>,
    /// Any further free-form context for the planner.
    pub additional_context: Option<String>,
}

/// Errors raised validating a [`FeatureRequest`] or its [`Specification`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeatureRequestError {
    /// `specification.title` exceeded [`MAX_TITLE_LEN`] characters.
    #[error("title exceeds {MAX_TITLE_LEN} characters")]
    TitleTooLong,
    /// `specification.description` exceeded [`MAX_DESCRIPTION_BYTES`] bytes.
    #[error("description exceeds {MAX_DESCRIPTION_BYTES} bytes")]
    DescriptionTooLarge,
    /// `repository_url` did not use the `http`/`https` scheme.
    #[error("repository url must use http or https")]
    InvalidScheme,
    /// `repository_url`'s host was not in the caller-supplied allow-list.
    #[error("repository host {0:?} is not allowed")]
    HostNotAllowed(String),
    /// `repository_url` had no parseable host component.
    #[error("repository url has no host")]
    MissingHost,
}

/// Execution constraints a requester may impose on the pipeline.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Constraints {
    /// Maximum number of plan steps.
    pub max_steps: Option<u32>,
    /// Wall-clock budget for the whole execution, in minutes.
    pub timeout_minutes: Option<u32>,
    /// Cap on total LLM tokens consumed.
    pub max_llm_tokens: Option<u64>,
    /// Paths the pipeline is allowed to modify; empty means unrestricted.
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    /// Paths the pipeline must never modify.
    #[serde(default)]
    pub forbidden_paths: Vec<String>,
}

/// The JSON body the gateway accepts on `feature.requests`.
///
/// The gateway's HTTP handler itself is out of scope for this crate; this
/// type exists so the validation and first-event construction it depends on
/// can be exercised directly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureRequest {
    /// Source repository URL; host must be in the deployment's allow-list.
    pub repository_url: String,
    /// Branch to base the work on.
    pub branch: String,
    /// What to build.
    pub specification: Specification,
    /// Identity of the requester, if known.
    pub requested_by: Option<String>,
    /// Scheduling priority; defaults to `normal`.
    #[serde(default)]
    pub priority: Priority,
    /// Optional execution constraints.
    pub constraints: Option<Constraints>,
    /// Assigned by the gateway once the request is accepted.
    pub execution_id: Option<ExecutionId>,
    /// Stamped by the gateway once the request is accepted.
    pub requested_at: Option<DateTime<Utc>>,
}

fn extract_host(url: &str) -> Result<(&str, &str), FeatureRequestError> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or(FeatureRequestError::InvalidScheme)?;
    if scheme != "http" && scheme != "https" {
        return Err(FeatureRequestError::InvalidScheme);
    }
    let host = rest.split(['/', '?', '#']).next().unwrap_or("");
    if host.is_empty() {
        return Err(FeatureRequestError::MissingHost);
    }
    Ok((scheme, host))
}

impl FeatureRequest {
    /// Validate size limits on the embedded specification and, when
    /// `allowed_hosts` is non-empty, that `repository_url`'s host appears in
    /// it (case-insensitive, ignoring a leading `www.`).
    pub fn validate(&self, allowed_hosts: &[String]) -> Result<(), FeatureRequestError> {
        if self.specification.title.chars().count() > MAX_TITLE_LEN {
            return Err(FeatureRequestError::TitleTooLong);
        }
        if self.specification.description.len() > MAX_DESCRIPTION_BYTES {
            return Err(FeatureRequestError::DescriptionTooLarge);
        }
        let (_, host) = extract_host(&self.repository_url)?;
        if !allowed_hosts.is_empty() {
            let normalized = host.to_ascii_lowercase();
            let normalized = normalized.strip_prefix("www.").unwrap_or(&normalized);
            let allowed = allowed_hosts.iter().any(|h| {
                let h = h.to_ascii_lowercase();
                let h = h.strip_prefix("www.").unwrap_or(&h);
                h == normalized
            });
            if !allowed {
                return Err(FeatureRequestError::HostNotAllowed(host.to_string()));
            }
        }
        Ok(())
    }
}
