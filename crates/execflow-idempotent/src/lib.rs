#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **execflow-idempotent** – the exactly-once processor.
//!
//! Wraps any [`EventHandler`] so that at-least-once broker delivery becomes
//! application-level exactly-once *outcomes*: a redelivered event is either
//! acknowledged silently (the prior attempt already succeeded) or replayed
//! with the same failure (so the caller's retry/DLQ logic sees a consistent
//! decision), never invoked twice for real. A [`SequenceTracker`] records
//! every event that reaches the wrapper so gaps can be reported later.
//!
//! This does not itself retry or escalate anything — it only decides
//! "have we already resolved this one?" — so it composes naturally as the
//! innermost handler a [`RetryPipeline`] drives.
//!
//! [`RetryPipeline`]: execflow_retry::RetryPipeline

use std::sync::Arc;

use async_trait::async_trait;
use execflow_dedup::DedupStore;
use execflow_events::{Event, ProcessingResult};
use execflow_retry::{EventHandler, HandlerError};
use execflow_sequence::SequenceTracker;

/// Wraps an inner [`EventHandler`] with deduplication and sequence-gap
/// tracking. Implements [`EventHandler`] itself, so it can be handed
/// straight to a [`RetryPipeline`](execflow_retry::RetryPipeline) (or
/// invoked directly by a consumer that does its own retry handling).
pub struct IdempotentProcessor<H: EventHandler> {
    inner: H,
    dedup: Arc<dyn DedupStore>,
    tracker: Arc<SequenceTracker>,
}

impl<H: EventHandler> IdempotentProcessor<H> {
    /// Wrap `inner`, recording outcomes in `dedup` and arrivals in `tracker`.
    pub fn new(inner: H, dedup: Arc<dyn DedupStore>, tracker: Arc<SequenceTracker>) -> Self {
        IdempotentProcessor { inner, dedup, tracker }
    }

    /// The sequence-gap tracker this processor feeds, for an operator or
    /// health endpoint to inspect.
    pub fn tracker(&self) -> Arc<SequenceTracker> {
        self.tracker.clone()
    }
}

#[async_trait]
impl<H: EventHandler> EventHandler for IdempotentProcessor<H> {
    async fn handle(&self, event: &Event) -> Result<Option<serde_json::Value>, HandlerError> {
        self.tracker.record(event.execution_id, event.sequence_number);

        match self.dedup.get_processing_result(event.event_id).await {
            Ok(Some(prior)) => {
                return if prior.success {
                    Ok(prior.result_data)
                } else {
                    Err(HandlerError::new(
                        prior.error_code.unwrap_or_else(|| "unknown".to_string()),
                        prior.error_message.unwrap_or_else(|| "replayed failure".to_string()),
                    ))
                };
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(event_id = %event.event_id, error = %err, "dedup lookup failed, invoking handler anyway");
            }
        }

        let started = std::time::Instant::now();
        let outcome = self.inner.handle(event).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match &outcome {
            Ok(data) => ProcessingResult::success(event.event_id, event.execution_id, duration_ms, Vec::new(), data.clone()),
            Err(err) => ProcessingResult::failure(event.event_id, event.execution_id, duration_ms, err.code.clone(), err.message.clone()),
        };
        if let Err(err) = self.dedup.mark_processed_with_result(event.event_id, result).await {
            // The retry pipeline will dedup on redelivery regardless; a
            // write failure here must not fail an otherwise-successful message.
            tracing::warn!(event_id = %event.event_id, error = %err, "dedup write failed after handler run");
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execflow_dedup::MemoryDedupStore;
    use execflow_events::{EventMetadata, ProcessingHints};
    use execflow_hlc::HlcClock;
    use execflow_ids::{EventId, ExecutionId};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Event) -> Result<Option<serde_json::Value>, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(HandlerError::new("timeout", "simulated failure"))
            } else {
                Ok(Some(serde_json::json!({ "ok": true })))
            }
        }
    }

    fn sample_event(seq: u64) -> Event {
        let clock = HlcClock::new();
        Event::new(
            ExecutionId::new(),
            EventId::new(),
            "feature.execution.step_completed",
            seq,
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

    #[tokio::test]
    async fn redelivery_of_a_successful_event_does_not_reinvoke_the_handler() {
        let handler = CountingHandler { calls: AtomicUsize::new(0), fail: false };
        let processor = IdempotentProcessor::new(
            handler,
            Arc::new(MemoryDedupStore::new()),
            Arc::new(SequenceTracker::new()),
        );
        let event = sample_event(1);

        processor.handle(&event).await.unwrap();
        processor.handle(&event).await.unwrap();

        assert_eq!(processor.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn redelivery_of_a_failed_event_replays_the_same_error_without_reinvoking() {
        let handler = CountingHandler { calls: AtomicUsize::new(0), fail: true };
        let processor = IdempotentProcessor::new(
            handler,
            Arc::new(MemoryDedupStore::new()),
            Arc::new(SequenceTracker::new()),
        );
        let event = sample_event(1);

        let first = processor.handle(&event).await.unwrap_err();
        let second = processor.handle(&event).await.unwrap_err();

        assert_eq!(processor.inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.code, second.code);
        assert_eq!(first.message, second.message);
    }

    #[tokio::test]
    async fn fresh_events_are_tracked_for_gap_accounting() {
        let handler = CountingHandler { calls: AtomicUsize::new(0), fail: false };
        let tracker = Arc::new(SequenceTracker::new());
        let processor = IdempotentProcessor::new(handler, Arc::new(MemoryDedupStore::new()), tracker.clone());

        let first = sample_event(1);
        let exec = first.execution_id;
        processor.handle(&first).await.unwrap();

        let mut third = sample_event(3);
        third.execution_id = exec;
        processor.handle(&third).await.unwrap();

        assert_eq!(tracker.gaps(exec), vec![2]);
    }
}
