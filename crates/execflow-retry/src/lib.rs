#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **execflow-retry** – the tiered retry pipeline.
//!
//! Three delay queues (`feature.events.retry.{1,2,3}`), escalating on
//! exhaustion at each tier, each tier guarded by a per-event-type
//! [`CircuitBreaker`] so a systematically failing downstream gets fast-failed
//! instead of burning through its attempt budget on every redelivery. A
//! message that exhausts every tier, or whose error code is not retryable at
//! all, is handed to the [`execflow_dlq::DlqStore`].
//!
//! The "delay" a tier name implies is a property of that queue's
//! retention/visibility timeout, not something this crate sleeps for — see
//! the tier table on [`RetryLevel`].

use std::collections::HashMap as StdHashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use execflow_dedup::DedupStore;
use execflow_dlq::{DlqEntry, DlqStore, FailureClassification, RetryMetadata};
use execflow_events::{Event, ProcessingResult};
use execflow_hlc::HlcClock;
use execflow_ids::EventId;
use execflow_queue::{queue_payload_to_event, QueuePublisher};
use execflow_sequence::SequenceManager;
use thiserror::Error;

//─────────────────────────────
//  Business handler seam
//─────────────────────────────

/// An error returned by a business handler. `code` drives
/// [`RetryPolicy::should_retry`]; `message` is recorded as `last_error`.
#[derive(Clone, Debug)]
pub struct HandlerError {
    /// Machine-readable error code (`timeout`, `validation_error`, ...).
    pub code: String,
    /// Human-readable detail.
    pub message: String,
}

impl HandlerError {
    /// Construct a handler error.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError { code: code.into(), message: message.into() }
    }
}

/// The business logic this platform's feature-execution pipeline plugs in
/// at the processing boundary. Everything upstream of this trait (planning,
/// patch generation, review, LLM invocation) is opaque to this crate.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one event, returning optional structured result data on
    /// success or a classified [`HandlerError`] on failure.
    async fn handle(&self, event: &Event) -> Result<Option<serde_json::Value>, HandlerError>;
}

//─────────────────────────────
//  Retry policy
//─────────────────────────────

/// Error codes retried by default: `network`, `timeout`, `rate_limit`,
/// `overloaded`, `server_error`.
pub fn default_retryable_error_codes() -> HashSet<String> {
    ["network", "timeout", "rate_limit", "overloaded", "server_error"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Governs which error codes are retried at all, and the per-attempt delay
/// reported alongside a retry (the queue's own retention is what actually
/// delays redelivery; this is advisory/observability data).
///
/// `max_retries` is carried for operator visibility only — see the
/// crate-level note on [`RetryLevel`] and this platform's design notes on
/// the relationship between this field and the tier ceiling.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Error codes eligible for retry; anything else goes straight to the DLQ.
    pub retryable_error_codes: HashSet<String>,
    /// Base delay for the first retry attempt.
    pub base_delay: Duration,
    /// Cap on the computed delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt (exponential backoff).
    pub multiplier: f64,
    /// Symmetric jitter fraction applied to the computed delay.
    pub jitter: f64,
    /// Advisory retry ceiling; does not itself gate escalation (the tier
    /// table does — see [`RetryLevel`]).
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retryable_error_codes: default_retryable_error_codes(),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// True iff `error_code` is in the retryable set. `attempt` is accepted
    /// for interface symmetry with the source; this policy's retryability
    /// does not vary by attempt number (the tier table governs that axis).
    pub fn should_retry(&self, error_code: &str, _attempt: u32) -> bool {
        self.retryable_error_codes.contains(error_code)
    }

    /// `min(base * multiplier^(attempt-1), max) ± jitter * delay`.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jitter_factor = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * self.jitter;
        Duration::from_secs_f64((capped * jitter_factor).max(0.0))
    }
}

//─────────────────────────────
//  Retry tiers
//─────────────────────────────

/// One of the three retry-delay queues. Each tier allows
/// [`RetryLevel::MAX_ATTEMPTS_AT_LEVEL`] attempts before escalating to the
/// next tier, or to the DLQ past the last one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryLevel {
    /// `feature.events.retry.1`, nominal ~1 minute delay.
    One,
    /// `feature.events.retry.2`, nominal ~5 minute delay.
    Two,
    /// `feature.events.retry.3`, nominal ~30 minute delay.
    Three,
}

impl RetryLevel {
    /// Attempts permitted at any one tier before escalating.
    pub const MAX_ATTEMPTS_AT_LEVEL: u32 = 2;

    /// The tier's 1-based number, as recorded in the `retry_level` tag.
    pub fn number(&self) -> u32 {
        match self {
            RetryLevel::One => 1,
            RetryLevel::Two => 2,
            RetryLevel::Three => 3,
        }
    }

    /// The queue this tier's messages are published to.
    pub fn queue_name(&self) -> &'static str {
        match self {
            RetryLevel::One => "feature.events.retry.1",
            RetryLevel::Two => "feature.events.retry.2",
            RetryLevel::Three => "feature.events.retry.3",
        }
    }

    /// The tier's nominal retention/visibility delay.
    pub fn nominal_delay(&self) -> Duration {
        match self {
            RetryLevel::One => Duration::from_secs(60),
            RetryLevel::Two => Duration::from_secs(5 * 60),
            RetryLevel::Three => Duration::from_secs(30 * 60),
        }
    }

    /// The tier escalated to on exhaustion, or `None` past the last tier.
    pub fn next(&self) -> Option<RetryLevel> {
        match self {
            RetryLevel::One => Some(RetryLevel::Two),
            RetryLevel::Two => Some(RetryLevel::Three),
            RetryLevel::Three => None,
        }
    }

    /// Parse a `retry_level` tag value (`"1"`, `"2"`, `"3"`).
    pub fn from_tag(s: &str) -> Option<RetryLevel> {
        match s {
            "1" => Some(RetryLevel::One),
            "2" => Some(RetryLevel::Two),
            "3" => Some(RetryLevel::Three),
            _ => None,
        }
    }
}

//─────────────────────────────
//  Circuit breaker
//─────────────────────────────

/// Tunables for a [`CircuitBreaker`]. Defaults: 5 failures to open, 30
/// minute reset timeout, 3 half-open probes.
#[derive(Clone, Copy, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive (closed-state) failures before the breaker opens.
    pub max_failures: u32,
    /// How long an open breaker waits before admitting a half-open probe.
    pub reset_timeout: Duration,
    /// Probes a half-open breaker admits before reopening on any failure.
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30 * 60),
            half_open_max_probes: 3,
        }
    }
}

/// The three states a [`CircuitBreaker`] can be in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally; failures accumulate toward `max_failures`.
    Closed,
    /// Fast-failing; no requests admitted until `reset_timeout` elapses.
    Open,
    /// Admitting up to `half_open_max_probes` trial requests.
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    half_open_probes_used: u32,
}

/// Per-event-type circuit breaker. Safe for concurrent callers: every
/// operation takes the single internal mutex for its whole duration.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Construct a breaker in the closed state.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                half_open_probes_used: 0,
            }),
            config,
        }
    }

    /// The breaker's current state, resolving an elapsed `reset_timeout`
    /// into a transition to half-open as a side effect (matching `allow`'s
    /// own transition, so callers that only want to observe state see the
    /// same view a concurrent `allow` would act on).
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    fn maybe_transition_to_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_probes_used = 0;
                }
            }
        }
    }

    /// True iff a request may proceed. A half-open breaker admits up to
    /// `half_open_max_probes` callers, each call consuming one probe slot.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        self.maybe_transition_to_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_probes_used < self.config.half_open_max_probes {
                    inner.half_open_probes_used += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call. From half-open this closes the breaker and
    /// resets its failure count; from closed it resets the failure count.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            CircuitState::HalfOpen | CircuitState::Closed => {
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.half_open_probes_used = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call. From half-open this reopens immediately; from
    /// closed it increments the failure count and opens at `max_failures`.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker mutex poisoned");
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_probes_used = 0;
            }
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.max_failures {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }
}

/// Per-event-type table of [`CircuitBreaker`]s. Lookup is double-checked: a
/// read lock is tried first, and only on a miss is the write lock taken
/// (re-checking, since another caller may have inserted meanwhile) to
/// construct and insert a fresh breaker.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<StdHashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    /// Construct a registry whose breakers all share `config`.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreakerRegistry { breakers: RwLock::new(StdHashMap::new()), config }
    }

    /// Fetch the breaker for `event_type`, creating it on first use.
    pub fn get_or_create(&self, event_type: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().expect("registry lock poisoned").get(event_type) {
            return existing.clone();
        }
        let mut write = self.breakers.write().expect("registry lock poisoned");
        if let Some(existing) = write.get(event_type) {
            return existing.clone();
        }
        let breaker = Arc::new(CircuitBreaker::new(self.config));
        write.insert(event_type.to_string(), breaker.clone());
        breaker
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

//─────────────────────────────
//  Pipeline
//─────────────────────────────

/// Errors a [`RetryPipeline::process`] call can return. Most failure modes
/// of the *business handler* never surface here — they are classified and
/// routed to a retry tier or the DLQ instead. This type is for
/// infrastructure failures (the publisher or DLQ store itself erroring).
#[derive(Debug, Error)]
pub enum RetryPipelineError {
    /// The publisher failed to enqueue a retry or escalation.
    #[error("failed to publish retry event: {0}")]
    Publish(String),
    /// The DLQ store failed to accept a parked entry.
    #[error("failed to park entry in dlq: {0}")]
    Dlq(String),
    /// The dedup store failed to record an outcome (logged, non-fatal in
    /// practice — see [`Outcome::Acknowledged`] — but surfaced here for
    /// callers that want to know).
    #[error("dedup store error: {0}")]
    Dedup(String),
    /// The sequence manager failed to assign a fresh sequence number.
    #[error("sequence manager error: {0}")]
    Sequence(String),
}

/// What happened to one delivered message.
#[derive(Debug)]
pub enum Outcome {
    /// Already processed, or processed successfully just now; safe to ack.
    Acknowledged,
    /// Re-enqueued at the current tier for another attempt.
    RetriedSameLevel {
        /// The queue the retry was published to.
        queue: &'static str,
        /// The retry event's id.
        event_id: EventId,
    },
    /// Escalated to the next tier (or tier 1, from the main queue).
    Escalated {
        /// The queue the escalation was published to.
        queue: &'static str,
        /// The retry event's id.
        event_id: EventId,
    },
    /// Parked in the DLQ; no further delivery will occur.
    DeadLettered {
        /// The assigned DLQ entry id.
        dlq_id: String,
    },
}

/// The tiered retry pipeline: owns the per-event-type circuit breakers and
/// composes the dedup store, queue publisher, sequence manager, and DLQ
/// store needed to execute the handler algorithm described for each
/// delivery.
pub struct RetryPipeline {
    dedup: Arc<dyn DedupStore>,
    publisher: Arc<dyn QueuePublisher>,
    sequence: Arc<dyn SequenceManager>,
    dlq: Arc<dyn DlqStore>,
    clock: HlcClock,
    breakers: CircuitBreakerRegistry,
    policy: RetryPolicy,
}

impl RetryPipeline {
    /// Construct a pipeline over the given backends, using `policy` for
    /// retryability decisions and `breaker_config` for every event type's
    /// circuit breaker.
    pub fn new(
        dedup: Arc<dyn DedupStore>,
        publisher: Arc<dyn QueuePublisher>,
        sequence: Arc<dyn SequenceManager>,
        dlq: Arc<dyn DlqStore>,
        policy: RetryPolicy,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        RetryPipeline {
            dedup,
            publisher,
            sequence,
            dlq,
            clock: HlcClock::new(),
            breakers: CircuitBreakerRegistry::new(breaker_config),
            policy,
        }
    }

    fn total_attempt(event: &Event) -> u32 {
        event
            .metadata
            .tags
            .get("retry_attempt")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(1)
    }

    fn current_level(event: &Event) -> Option<RetryLevel> {
        event.metadata.tags.get("retry_level").and_then(|s| RetryLevel::from_tag(s))
    }

    /// Attempts already made at `level` as of `total_attempt`'s delivery,
    /// counting this delivery. See the crate's design notes for how this
    /// resolves the spec's stated ambiguity between the per-level ceiling
    /// and the policy's advisory `max_retries`.
    fn attempts_at_level(total_attempt: u32, level: RetryLevel) -> u32 {
        let level_start = 2 * (level.number() - 1) + 2; // first total_attempt value delivered at this level
        total_attempt + 1 - level_start
    }

    async fn build_retry_event(
        &self,
        original: &Event,
        next_total_attempt: u32,
        next_level: RetryLevel,
        error: &HandlerError,
    ) -> Result<Event, RetryPipelineError> {
        let mut retry = original.begin_retry(self.clock.now());
        retry.sequence_number = self
            .sequence
            .next_sequence(original.execution_id)
            .await
            .map_err(|e| RetryPipelineError::Sequence(e.to_string()))?;
        retry.metadata.tags.insert("retry_attempt".to_string(), next_total_attempt.to_string());
        retry.metadata.tags.insert("retry_level".to_string(), next_level.number().to_string());
        retry.metadata.tags.insert("last_error".to_string(), error.message.clone());
        retry.metadata.tags.insert("original_event_id".to_string(), retry.original_event_id.expect("begin_retry always sets this").to_string());
        Ok(retry)
    }

    async fn park(
        &self,
        event: Event,
        classification: FailureClassification,
        error: &HandlerError,
        total_attempt: u32,
    ) -> Result<Outcome, RetryPipelineError> {
        let now = chrono::Utc::now();
        let retry_metadata = RetryMetadata {
            original_event_id: event.original_event_id.unwrap_or(event.event_id),
            current_attempt: total_attempt,
            max_attempt: RetryLevel::MAX_ATTEMPTS_AT_LEVEL * 3,
            first_attempt_at: event.created_at,
            last_attempt_at: now,
            last_error: error.message.clone(),
        };
        let entry = DlqEntry::for_event(event, error.message.clone(), classification, Some(retry_metadata));
        let dlq_id = self.dlq.add_entry(entry).await.map_err(|e| RetryPipelineError::Dlq(e.to_string()))?;
        Ok(Outcome::DeadLettered { dlq_id })
    }

    /// Process one wire delivery. `handler` is the business handler;
    /// `current_level` is `None` for a delivery off the main event stream,
    /// `Some` for a delivery off a `retry.N` queue.
    pub async fn process(
        &self,
        raw: &[u8],
        handler: &dyn EventHandler,
    ) -> Result<Outcome, RetryPipelineError> {
        // Step 1: deserialize + validate.
        let event = match queue_payload_to_event(raw) {
            Ok(event) => event,
            Err(err) => {
                let entry = DlqEntry::for_poison_pill(raw.to_vec(), err);
                let dlq_id = self.dlq.add_entry(entry).await.map_err(|e| RetryPipelineError::Dlq(e.to_string()))?;
                return Ok(Outcome::DeadLettered { dlq_id });
            }
        };
        if let Err(validation_err) = event.validate() {
            let entry = DlqEntry::for_poison_pill(raw.to_vec(), validation_err);
            let dlq_id = self.dlq.add_entry(entry).await.map_err(|e| RetryPipelineError::Dlq(e.to_string()))?;
            return Ok(Outcome::DeadLettered { dlq_id });
        }

        // Step 2: dedup check.
        if self
            .dedup
            .is_processed(event.event_id)
            .await
            .map_err(|e| RetryPipelineError::Dedup(e.to_string()))?
        {
            return Ok(Outcome::Acknowledged);
        }

        let total_attempt = Self::total_attempt(&event);
        let level = Self::current_level(&event);
        let breaker = self.breakers.get_or_create(&event.event_type);

        // Step 3: circuit breaker.
        if !breaker.allow() {
            let error = HandlerError::new(
                "circuit_open",
                format!("circuit breaker open for event type {}", event.event_type),
            );
            return self.escalate_or_park(event, total_attempt, level, &error).await;
        }

        // Step 4: invoke the business handler.
        let started = Instant::now();
        let outcome = handler.handle(&event).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result_data) => {
                breaker.record_success();
                let result = ProcessingResult::success(event.event_id, event.execution_id, duration_ms, Vec::new(), result_data);
                if let Err(e) = self.dedup.mark_processed_with_result(event.event_id, result).await {
                    // Per the idempotent-handler contract: a dedup write
                    // failure after a successful handler run must not fail
                    // the message. The retry pipeline will dedup on
                    // redelivery regardless.
                    tracing::warn!(event_id = %event.event_id, error = %e, "dedup write failed after successful handler run");
                }
                Ok(Outcome::Acknowledged)
            }
            Err(handler_error) => {
                breaker.record_failure();
                if !self.policy.should_retry(&handler_error.code, total_attempt) {
                    return self
                        .park(event, FailureClassification::Permanent, &handler_error, total_attempt)
                        .await;
                }
                self.escalate_or_park(event, total_attempt, level, &handler_error).await
            }
        }
    }

    async fn escalate_or_park(
        &self,
        event: Event,
        total_attempt: u32,
        level: Option<RetryLevel>,
        error: &HandlerError,
    ) -> Result<Outcome, RetryPipelineError> {
        match level {
            None => {
                // First failure, off the main stream: always escalate to tier 1.
                let next_attempt = total_attempt + 1;
                let retry = self.build_retry_event(&event, next_attempt, RetryLevel::One, error).await?;
                let queue = RetryLevel::One.queue_name();
                self.publisher
                    .publish(queue, &retry)
                    .await
                    .map_err(|e| RetryPipelineError::Publish(e.to_string()))?;
                Ok(Outcome::Escalated { queue, event_id: retry.event_id })
            }
            Some(current) => {
                let attempts_at_level = Self::attempts_at_level(total_attempt, current);
                if attempts_at_level < RetryLevel::MAX_ATTEMPTS_AT_LEVEL {
                    let next_attempt = total_attempt + 1;
                    let retry = self.build_retry_event(&event, next_attempt, current, error).await?;
                    let queue = current.queue_name();
                    self.publisher
                        .publish(queue, &retry)
                        .await
                        .map_err(|e| RetryPipelineError::Publish(e.to_string()))?;
                    Ok(Outcome::RetriedSameLevel { queue, event_id: retry.event_id })
                } else if let Some(next_level) = current.next() {
                    let next_attempt = total_attempt + 1;
                    let retry = self.build_retry_event(&event, next_attempt, next_level, error).await?;
                    let queue = next_level.queue_name();
                    self.publisher
                        .publish(queue, &retry)
                        .await
                        .map_err(|e| RetryPipelineError::Publish(e.to_string()))?;
                    Ok(Outcome::Escalated { queue, event_id: retry.event_id })
                } else {
                    self.park(event, FailureClassification::Transient, error, total_attempt).await
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execflow_dedup::MemoryDedupStore;
    use execflow_dlq::MemoryDlqStore;
    use execflow_events::{EventMetadata, ProcessingHints};
    use execflow_ids::{EventId, ExecutionId};
    use execflow_queue::{event_to_queue_payload, InMemoryBroker};
    use execflow_sequence::MemorySequenceManager;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Subscribes to every retry tier's queue up front (a `broadcast`
    /// channel only sees messages published after subscription) and hands
    /// back the wire bytes of whatever is published to `queue` next.
    struct Redelivery {
        one: tokio::sync::broadcast::Receiver<Arc<Event>>,
        two: tokio::sync::broadcast::Receiver<Arc<Event>>,
        three: tokio::sync::broadcast::Receiver<Arc<Event>>,
    }

    impl Redelivery {
        fn subscribe(broker: &InMemoryBroker) -> Self {
            Redelivery {
                one: broker.subscribe(RetryLevel::One.queue_name()),
                two: broker.subscribe(RetryLevel::Two.queue_name()),
                three: broker.subscribe(RetryLevel::Three.queue_name()),
            }
        }

        async fn next(&mut self, queue: &str) -> Vec<u8> {
            let event = if queue == RetryLevel::One.queue_name() {
                self.one.recv().await.unwrap()
            } else if queue == RetryLevel::Two.queue_name() {
                self.two.recv().await.unwrap()
            } else {
                self.three.recv().await.unwrap()
            };
            event_to_queue_payload(&event).unwrap().body
        }
    }

    struct AlwaysFail {
        code: String,
    }

    #[async_trait]
    impl EventHandler for AlwaysFail {
        async fn handle(&self, _event: &Event) -> Result<Option<serde_json::Value>, HandlerError> {
            Err(HandlerError::new(self.code.clone(), "boom"))
        }
    }

    struct AlwaysSucceed;

    #[async_trait]
    impl EventHandler for AlwaysSucceed {
        async fn handle(&self, _event: &Event) -> Result<Option<serde_json::Value>, HandlerError> {
            Ok(None)
        }
    }

    struct SequenceOfOutcomes {
        results: StdMutex<Vec<Result<Option<serde_json::Value>, HandlerError>>>,
    }

    #[async_trait]
    impl EventHandler for SequenceOfOutcomes {
        async fn handle(&self, _event: &Event) -> Result<Option<serde_json::Value>, HandlerError> {
            self.results.lock().unwrap().remove(0)
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
                producer_id: "worker".into(),
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

    fn pipeline() -> (RetryPipeline, Arc<InMemoryBroker>, Arc<MemoryDlqStore>) {
        let dedup = Arc::new(MemoryDedupStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let sequence = Arc::new(MemorySequenceManager::new());
        let dlq = Arc::new(MemoryDlqStore::new(broker.clone(), "feature.events"));
        let pipeline = RetryPipeline::new(
            dedup,
            broker.clone(),
            sequence,
            dlq.clone(),
            RetryPolicy::default(),
            CircuitBreakerConfig::default(),
        );
        (pipeline, broker, dlq)
    }

    #[tokio::test]
    async fn successful_handler_acknowledges() {
        let (pipeline, _broker, _dlq) = pipeline();
        let event = sample_event();
        let raw = event_to_queue_payload(&event).unwrap().body;
        let outcome = pipeline.process(&raw, &AlwaysSucceed).await.unwrap();
        assert!(matches!(outcome, Outcome::Acknowledged));
    }

    #[tokio::test]
    async fn poison_pill_is_parked_for_manual_review() {
        let (pipeline, _broker, dlq) = pipeline();
        let outcome = pipeline.process(b"not json", &AlwaysSucceed).await.unwrap();
        let Outcome::DeadLettered { dlq_id } = outcome else { panic!("expected dead-lettered") };
        let entry = dlq.get_entry(&dlq_id).await.unwrap();
        assert!(matches!(entry.failure_classification, FailureClassification::Validation));
        assert!(entry.manual_review_required);
    }

    #[tokio::test]
    async fn non_retryable_error_goes_straight_to_dlq_as_permanent() {
        let (pipeline, _broker, dlq) = pipeline();
        let event = sample_event();
        let raw = event_to_queue_payload(&event).unwrap().body;
        let outcome = pipeline
            .process(&raw, &AlwaysFail { code: "validation_error".to_string() })
            .await
            .unwrap();
        let Outcome::DeadLettered { dlq_id } = outcome else { panic!("expected dead-lettered") };
        let entry = dlq.get_entry(&dlq_id).await.unwrap();
        assert!(matches!(entry.failure_classification, FailureClassification::Permanent));
    }

    #[tokio::test]
    async fn first_failure_off_main_escalates_to_tier_one() {
        let (pipeline, _broker, _dlq) = pipeline();
        let event = sample_event();
        let raw = event_to_queue_payload(&event).unwrap().body;
        let outcome = pipeline.process(&raw, &AlwaysFail { code: "timeout".to_string() }).await.unwrap();
        match outcome {
            Outcome::Escalated { queue, .. } => assert_eq!(queue, "feature.events.retry.1"),
            other => panic!("expected escalation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_trajectory_matches_the_documented_scenario() {
        // main(1) -> retry.1(2) -> retry.1(3) -> retry.2(4) -> success
        let dedup = Arc::new(MemoryDedupStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let sequence = Arc::new(MemorySequenceManager::new());
        let dlq = Arc::new(MemoryDlqStore::new(broker.clone(), "feature.events"));
        let pipeline = RetryPipeline::new(
            dedup,
            broker.clone(),
            sequence,
            dlq,
            RetryPolicy::default(),
            CircuitBreakerConfig::default(),
        );
        let mut redelivery = Redelivery::subscribe(&broker);

        let handler = SequenceOfOutcomes {
            results: StdMutex::new(vec![
                Err(HandlerError::new("timeout", "1")),
                Err(HandlerError::new("timeout", "2")),
                Err(HandlerError::new("timeout", "3")),
                Ok(None),
            ]),
        };

        let event = sample_event();
        let raw = event_to_queue_payload(&event).unwrap().body;

        // attempt 1, main.
        let outcome = pipeline.process(&raw, &handler).await.unwrap();
        let Outcome::Escalated { queue, .. } = outcome else { panic!("expected escalation, got {outcome:?}") };
        assert_eq!(queue, "feature.events.retry.1");
        let next_raw = redelivery.next(queue).await;

        // attempt 2, retry.1 -> retries at the same tier.
        let outcome = pipeline.process(&next_raw, &handler).await.unwrap();
        let Outcome::RetriedSameLevel { queue, .. } = outcome else { panic!("expected same-level retry, got {outcome:?}") };
        assert_eq!(queue, "feature.events.retry.1");
        let next_raw = redelivery.next(queue).await;

        // attempt 3, retry.1 -> escalates to retry.2.
        let outcome = pipeline.process(&next_raw, &handler).await.unwrap();
        let Outcome::Escalated { queue, .. } = outcome else { panic!("expected escalation, got {outcome:?}") };
        assert_eq!(queue, "feature.events.retry.2");
        let next_raw = redelivery.next(queue).await;

        // attempt 4, retry.2 -> succeeds.
        let outcome = pipeline.process(&next_raw, &handler).await.unwrap();
        assert!(matches!(outcome, Outcome::Acknowledged));
    }

    #[tokio::test]
    async fn exhausting_every_tier_parks_as_transient() {
        let dedup = Arc::new(MemoryDedupStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let sequence = Arc::new(MemorySequenceManager::new());
        let dlq = Arc::new(MemoryDlqStore::new(broker.clone(), "feature.events"));
        let pipeline = RetryPipeline::new(
            dedup,
            broker.clone(),
            sequence,
            dlq,
            RetryPolicy::default(),
            CircuitBreakerConfig::default(),
        );
        let mut redelivery = Redelivery::subscribe(&broker);
        let handler = AlwaysFail { code: "timeout".to_string() };
        let event = sample_event();
        let mut raw = event_to_queue_payload(&event).unwrap().body;

        let mut last_outcome = pipeline.process(&raw, &handler).await.unwrap();
        for _ in 0..6 {
            let queue = match &last_outcome {
                Outcome::Escalated { queue, .. } | Outcome::RetriedSameLevel { queue, .. } => *queue,
                Outcome::DeadLettered { .. } => break,
                Outcome::Acknowledged => panic!("handler always fails"),
            };
            raw = redelivery.next(queue).await;
            last_outcome = pipeline.process(&raw, &handler).await.unwrap();
        }
        assert!(matches!(last_outcome, Outcome::DeadLettered { .. }));
    }

    #[test]
    fn circuit_breaker_opens_at_exactly_max_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig { max_failures: 3, ..CircuitBreakerConfig::default() });
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn circuit_breaker_half_open_success_closes_and_resets() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            max_failures: 1,
            reset_timeout: Duration::from_millis(0),
            half_open_max_probes: 3,
        });
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.allow()); // transitions to half-open and consumes a probe
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn circuit_breaker_half_open_failure_reopens_immediately() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            max_failures: 1,
            reset_timeout: Duration::from_millis(0),
            half_open_max_probes: 3,
        });
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn registry_returns_the_same_breaker_for_the_same_event_type() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get_or_create("feature.execution.step_failed");
        let b = registry.get_or_create("feature.execution.step_failed");
        a.record_failure();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn retry_policy_honors_the_configured_retryable_codes() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry("timeout", 1));
        assert!(!policy.should_retry("validation_error", 1));
    }

    #[test]
    fn retry_policy_delay_is_capped() {
        let policy = RetryPolicy { jitter: 0.0, ..RetryPolicy::default() };
        let delay = policy.compute_delay(10);
        assert!(delay <= policy.max_delay);
    }
}
