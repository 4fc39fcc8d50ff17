#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **execflow-queue** – the queue facade.
//!
//! Maps an [`execflow_events::Event`] to and from its wire payload, derives
//! partition keys, and ships an in-process `mem://` broker
//! (`tokio::sync::broadcast`-backed) for local development and tests. Real
//! broker adapters (NATS, Kafka) are named for interface completeness only;
//! [`QueuePublisher`]/[`EventEmitter`] are shaped so one can be dropped in
//! without touching callers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use execflow_events::Event;
use execflow_ids::ExecutionId;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors raised mapping events to/from the wire, or by a broker adapter.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The event failed to serialize to its wire form.
    #[error("failed to serialize event: {0}")]
    Serialize(String),
    /// The wire payload failed to deserialize into an event.
    #[error("failed to deserialize event: {0}")]
    Deserialize(String),
    /// [`topic_partition_key`] was called with `n == 0`.
    #[error("partition count must be > 0")]
    InvalidPartitionCount,
    /// The broker URI scheme was not recognized.
    #[error("unrecognized broker uri: {0}")]
    UnrecognizedScheme(String),
    /// A broker-specific failure.
    #[error("broker error: {0}")]
    Broker(String),
}

//─────────────────────────────
//  Wire mapping
//─────────────────────────────

/// The serialized form of an event as it travels over a queue: a JSON body
/// plus routing/observability headers.
#[derive(Debug, Clone)]
pub struct QueuePayload {
    /// JSON-encoded envelope.
    pub body: Vec<u8>,
    /// Routing and observability headers.
    pub headers: HashMap<String, String>,
}

/// Serialize `event` to its wire payload. Headers carry `event_type`,
/// `event_id`, `execution_id`, `sequence`, `schema_version`, and — when the
/// event carries trace context — a W3C `traceparent`.
pub fn event_to_queue_payload(event: &Event) -> Result<QueuePayload, QueueError> {
    let body = serde_json::to_vec(event).map_err(|e| QueueError::Serialize(e.to_string()))?;
    let mut headers = HashMap::new();
    headers.insert("event_type".to_string(), event.event_type.clone());
    headers.insert("event_id".to_string(), event.event_id.to_string());
    headers.insert("execution_id".to_string(), event.execution_id.to_string());
    headers.insert("sequence".to_string(), event.sequence_number.to_string());
    headers.insert("schema_version".to_string(), event.schema_version.to_string());
    if let Some(trace) = &event.metadata.trace_context {
        headers.insert("traceparent".to_string(), trace.traceparent.clone());
    }
    Ok(QueuePayload { body, headers })
}

/// Inverse of [`event_to_queue_payload`]. Checksum verification against the
/// payload bytes is the caller's responsibility (see [`Event::validate`]).
///
/// [`Event::validate`]: execflow_events::Event::validate
pub fn queue_payload_to_event(body: &[u8]) -> Result<Event, QueueError> {
    serde_json::from_slice(body).map_err(|e| QueueError::Deserialize(e.to_string()))
}

/// The partition key for an execution: its string form.
pub fn partition_key(exec: ExecutionId) -> String {
    exec.to_string()
}

//─────────────────────────────
//  Murmur2 partitioning
//─────────────────────────────

const MURMUR2_SEED: u32 = 0x9747_b28c;
const MURMUR2_M: u32 = 0x5bd1_e995;
const MURMUR2_R: u32 = 24;

/// Standard 32-bit Murmur2, seeded `0x9747b28c`. The constants are
/// normative: implementations of this platform in other languages must use
/// exactly this hash so identical partition keys route to identical
/// partitions everywhere.
pub fn murmur2(data: &[u8]) -> u32 {
    let mut h: u32 = MURMUR2_SEED ^ (data.len() as u32);
    let nblocks = data.len() / 4;

    for i in 0..nblocks {
        let base = i * 4;
        let mut k = u32::from_le_bytes([data[base], data[base + 1], data[base + 2], data[base + 3]]);
        k = k.wrapping_mul(MURMUR2_M);
        k ^= k >> MURMUR2_R;
        k = k.wrapping_mul(MURMUR2_M);
        h = h.wrapping_mul(MURMUR2_M);
        h ^= k;
    }

    let tail = &data[nblocks * 4..];
    match tail.len() {
        3 => {
            h ^= (tail[2] as u32) << 16;
            h ^= (tail[1] as u32) << 8;
            h ^= tail[0] as u32;
            h = h.wrapping_mul(MURMUR2_M);
        }
        2 => {
            h ^= (tail[1] as u32) << 8;
            h ^= tail[0] as u32;
            h = h.wrapping_mul(MURMUR2_M);
        }
        1 => {
            h ^= tail[0] as u32;
            h = h.wrapping_mul(MURMUR2_M);
        }
        _ => {}
    }

    h ^= h >> 13;
    h = h.wrapping_mul(MURMUR2_M);
    h ^= h >> 15;
    h
}

/// `murmur2(exec.to_string()) mod n`, the partition an execution's events
/// route to among `n` partitions.
pub fn topic_partition_key(exec: ExecutionId, n: u32) -> Result<u32, QueueError> {
    if n == 0 {
        return Err(QueueError::InvalidPartitionCount);
    }
    Ok(murmur2(partition_key(exec).as_bytes()) % n)
}

//─────────────────────────────
//  Publisher / emitter traits
//─────────────────────────────

/// Publishes an event to a named queue on a broker.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Publish `event` to `queue`.
    async fn publish(&self, queue: &str, event: &Event) -> Result<(), QueueError>;
}

/// Emits an event to in-process listeners, independent of any broker.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    /// Emit `event` under `topic` to whatever is subscribed in-process.
    async fn emit(&self, topic: &str, event: &Event) -> Result<(), QueueError>;
}

//─────────────────────────────
//  Broker URI scheme
//─────────────────────────────

/// A broker URI scheme this platform names. Only [`BrokerScheme::Mem`] has a
/// concrete adapter in this crate; the others exist for interface completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerScheme {
    /// `mem://` — the in-process [`InMemoryBroker`].
    Mem,
    /// `nats://` — named, not implemented here.
    Nats,
    /// `kafka://` — named, not implemented here.
    Kafka,
}

/// Parse a broker URI's scheme.
pub fn parse_broker_scheme(uri: &str) -> Result<BrokerScheme, QueueError> {
    if uri.starts_with("mem://") {
        Ok(BrokerScheme::Mem)
    } else if uri.starts_with("nats://") {
        Ok(BrokerScheme::Nats)
    } else if uri.starts_with("kafka://") {
        Ok(BrokerScheme::Kafka)
    } else {
        Err(QueueError::UnrecognizedScheme(uri.to_string()))
    }
}

//─────────────────────────────
//  In-memory broker
//─────────────────────────────

/// An in-process, topic-partitioned, fan-out broker backed by
/// `tokio::sync::broadcast`. Registered under the `mem://` scheme; intended
/// for local development and tests, not production traffic.
pub struct InMemoryBroker {
    topics: DashMap<String, broadcast::Sender<Arc<Event>>>,
    capacity: usize,
}

impl InMemoryBroker {
    /// Construct a broker with a default per-topic channel capacity of 1024.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Construct a broker with an explicit per-topic channel capacity.
    /// A slow subscriber that falls more than `capacity` messages behind
    /// will see [`broadcast::error::RecvError::Lagged`] and skip ahead.
    pub fn with_capacity(capacity: usize) -> Self {
        InMemoryBroker { topics: DashMap::new(), capacity }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Arc<Event>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Subscribe to `topic`, receiving every event emitted or published to
    /// it from this point forward.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Arc<Event>> {
        self.sender(topic).subscribe()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueuePublisher for InMemoryBroker {
    async fn publish(&self, queue: &str, event: &Event) -> Result<(), QueueError> {
        // Round-trip through the wire encoding even though delivery stays
        // in-process, so a malformed envelope is caught the same way a real
        // broker adapter would catch it.
        event_to_queue_payload(event)?;
        let sender = self.sender(queue);
        // No subscribers is not an error for a fire-and-forget broadcast.
        let _ = sender.send(Arc::new(event.clone()));
        Ok(())
    }
}

#[async_trait]
impl EventEmitter for InMemoryBroker {
    async fn emit(&self, topic: &str, event: &Event) -> Result<(), QueueError> {
        self.publish(topic, event).await
    }
}
