#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **execflow-ids** – time-sortable identifiers for the execution platform.
//!
//! Every execution and every event carries a 12-byte, time-sortable identifier
//! encoded as a 20-character base32-hex string. The encoding is lexicographic:
//! sorting the encoded strings sorts the underlying bytes, which sorts by
//! creation time to within the tie-breaking counter. Callers must not depend
//! on ordering between two IDs minted within the same second other than by
//! that counter — see [`RawId::time`].
//!
//! This crate also owns the small set of derived-name conventions
//! (branch names, lock keys) that downstream systems depend on as contracts.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

//─────────────────────────────
//  Encoding
//─────────────────────────────

const RAW_LEN: usize = 12;
const ENCODED_LEN: usize = 20;
const SHORT_LEN: usize = 8;

/// RFC 4648 "base32hex" alphabet, chosen so the encoded form sorts identically
/// to the underlying bytes (ordinary base32's alphabet does not have this
/// property past the first few characters).
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

fn encode(bytes: &[u8; RAW_LEN]) -> String {
    // 12 bytes = 96 bits; 20 base32 symbols carry 100 bits, so we pad with
    // four trailing zero bits before splitting into 5-bit groups.
    let mut bits: u128 = 0;
    for &b in bytes {
        bits = (bits << 8) | b as u128;
    }
    bits <<= 4; // pad to 100 bits

    let mut out = [0u8; ENCODED_LEN];
    for (i, slot) in out.iter_mut().enumerate() {
        let shift = 95 - i * 5;
        let idx = ((bits >> shift) & 0x1F) as usize;
        *slot = ALPHABET[idx];
    }
    // SAFETY-free: ALPHABET is ASCII, so this is always valid UTF-8.
    String::from_utf8(out.to_vec()).expect("alphabet is ascii")
}

fn decode_symbol(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'V' => Some(c - b'A' + 10),
        b'a'..=b'v' => Some(c - b'a' + 10),
        _ => None,
    }
}

fn decode(s: &str) -> Result<[u8; RAW_LEN], ParseIdError> {
    let s = s.as_bytes();
    if s.len() != ENCODED_LEN {
        return Err(ParseIdError::WrongLength(s.len()));
    }
    let mut bits: u128 = 0;
    for &c in s {
        let v = decode_symbol(c).ok_or(ParseIdError::InvalidCharacter(c as char))?;
        bits = (bits << 5) | v as u128;
    }
    bits >>= 4; // drop the padding bits
    let mut out = [0u8; RAW_LEN];
    for (i, slot) in out.iter_mut().enumerate().rev() {
        *slot = (bits & 0xFF) as u8;
        bits >>= 8;
    }
    Ok(out)
}

/// Errors produced while parsing an identifier from its string form.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseIdError {
    /// The input was not exactly 20 characters long.
    #[error("identifier must be {ENCODED_LEN} characters, got {0}")]
    WrongLength(usize),
    /// The input contained a character outside the base32-hex alphabet.
    #[error("invalid identifier character: {0:?}")]
    InvalidCharacter(char),
}

//─────────────────────────────
//  Raw 12-byte identifier
//─────────────────────────────

/// The common 96-bit layout shared by [`ExecutionId`] and [`EventId`]:
/// 4-byte big-endian Unix timestamp (seconds), 3-byte machine identifier,
/// 2-byte process identifier, 3-byte monotonic counter.
///
/// Byte-wise comparison (`Ord`) is the contractual comparison used
/// throughout the platform; because the timestamp occupies the leading
/// bytes, it also orders IDs by creation time to within one second.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawId([u8; RAW_LEN]);

static COUNTER: Lazy<AtomicU32> =
    Lazy::new(|| AtomicU32::new(rand::random::<u32>() & 0x00FF_FFFF));

static MACHINE_ID: Lazy<[u8; 3]> = Lazy::new(|| {
    use rand::RngCore;
    let mut seed = [0u8; 3];
    rand::thread_rng().fill_bytes(&mut seed);
    seed
});

impl RawId {
    /// The distinguishable zero value. `is_zero()` is true only for this ID.
    pub const ZERO: RawId = RawId([0u8; RAW_LEN]);

    /// Mint a fresh, time-sortable identifier.
    pub fn new() -> Self {
        let now = Utc::now().timestamp();
        let ts = (now as u32).to_be_bytes();

        let pid = std::process::id() as u16;
        let pid_bytes = pid.to_be_bytes();

        let counter = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00FF_FFFF;
        let counter_bytes = counter.to_be_bytes(); // 4 bytes, take the low 3

        let mut bytes = [0u8; RAW_LEN];
        bytes[0..4].copy_from_slice(&ts);
        bytes[4..7].copy_from_slice(&*MACHINE_ID);
        bytes[7..9].copy_from_slice(&pid_bytes);
        bytes[9..12].copy_from_slice(&counter_bytes[1..4]);
        RawId(bytes)
    }

    /// Parse a previously-encoded identifier, rejecting malformed input.
    pub fn parse(s: &str) -> Result<Self, ParseIdError> {
        Ok(RawId(decode(s)?))
    }

    /// True only for [`RawId::ZERO`].
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; RAW_LEN]
    }

    /// Recover the creation timestamp, accurate to one second.
    pub fn time(&self) -> DateTime<Utc> {
        let mut ts_bytes = [0u8; 4];
        ts_bytes.copy_from_slice(&self.0[0..4]);
        let secs = u32::from_be_bytes(ts_bytes) as i64;
        Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
    }

    /// The raw bytes, for callers that need to embed the ID in another wire format.
    pub fn as_bytes(&self) -> &[u8; RAW_LEN] {
        &self.0
    }

    /// First 8 characters of the encoded form — for human-readable contexts
    /// such as log lines and branch names. Not guaranteed globally unique.
    pub fn short(&self) -> String {
        encode(&self.0)[..SHORT_LEN].to_string()
    }
}

impl Default for RawId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(&self.0))
    }
}

impl fmt::Debug for RawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawId({})", encode(&self.0))
    }
}

impl FromStr for RawId {
    type Err = ParseIdError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RawId::parse(s)
    }
}

impl Serialize for RawId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RawId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RawId::parse(&s).map_err(DeError::custom)
    }
}

//─────────────────────────────
//  Macro: newtype wrappers over RawId
//─────────────────────────────

macro_rules! id_newtype {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(RawId);

        impl $name {
            /// Mint a fresh identifier.
            pub fn new() -> Self {
                $name(RawId::new())
            }

            /// The distinguishable zero value.
            pub const ZERO: $name = $name(RawId::ZERO);

            /// Parse from its 20-character encoded form.
            pub fn parse(s: &str) -> Result<Self, ParseIdError> {
                Ok($name(RawId::parse(s)?))
            }

            /// True only for the zero value.
            pub fn is_zero(&self) -> bool {
                self.0.is_zero()
            }

            /// Recover the creation timestamp, accurate to one second.
            pub fn time(&self) -> DateTime<Utc> {
                self.0.time()
            }

            /// First 8 characters of the encoded form, for human contexts.
            pub fn short(&self) -> String {
                self.0.short()
            }

            /// Compare two identifiers byte-wise (the contractual ordering).
            pub fn compare(&self, other: &Self) -> std::cmp::Ordering {
                self.0.cmp(&other.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $name::parse(s)
            }
        }
    };
}

id_newtype!(
    ExecutionId,
    "Opaque, time-sortable identifier for a feature execution. Used as the partition key for every event belonging to that execution."
);
id_newtype!(
    EventId,
    "Opaque, time-sortable identifier for a single event."
);

//─────────────────────────────
//  StepId
//─────────────────────────────

/// Identifies one attempt at one step of an execution.
///
/// Serializes as `{exec}/step/{index}/attempt/{attempt}`, matching the
/// contractual workspace-path convention used by external tooling.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct StepId {
    /// The execution this step belongs to.
    pub execution: ExecutionId,
    /// Zero-based step index within the execution's plan.
    pub step_index: u32,
    /// One-based attempt number for this step.
    pub attempt: u32,
}

impl StepId {
    /// Construct a `StepId` for the first attempt (`attempt = 1`) of a step.
    pub fn first_attempt(execution: ExecutionId, step_index: u32) -> Self {
        StepId { execution, step_index, attempt: 1 }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/step/{}/attempt/{}",
            self.execution, self.step_index, self.attempt
        )
    }
}

/// Errors produced while parsing a [`StepId`] from its string form.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseStepIdError {
    /// The input did not match `{exec}/step/{i}/attempt/{a}`.
    #[error("malformed step id: {0:?}")]
    Malformed(String),
    /// The embedded execution id failed to parse.
    #[error("invalid execution id in step id: {0}")]
    InvalidExecutionId(#[from] ParseIdError),
    /// The step index or attempt number was not a valid integer.
    #[error("invalid integer field in step id")]
    InvalidInteger,
}

impl FromStr for StepId {
    type Err = ParseStepIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 5 || parts[1] != "step" || parts[3] != "attempt" {
            return Err(ParseStepIdError::Malformed(s.to_string()));
        }
        let execution = ExecutionId::parse(parts[0])?;
        let step_index: u32 = parts[2].parse().map_err(|_| ParseStepIdError::InvalidInteger)?;
        let attempt: u32 = parts[4].parse().map_err(|_| ParseStepIdError::InvalidInteger)?;
        Ok(StepId { execution, step_index, attempt })
    }
}

//─────────────────────────────
//  Derived naming conventions
//─────────────────────────────

/// `feature/{exec.Short()}` — the git branch name convention external
/// tooling (and the workspace path layout) depends on.
pub fn branch_name(exec: &ExecutionId) -> String {
    format!("feature/{}", exec.short())
}

/// `repo:{repo}:branch:{branch}` — the lock-service key convention for
/// per-repo-branch mutual exclusion.
pub fn repo_branch_lock_key(repo: &str, branch: &str) -> String {
    format!("repo:{repo}:branch:{branch}")
}

/// `workspace:{path}` — the lock-service key convention for workspace
/// directory mutual exclusion.
pub fn workspace_lock_key(path: &str) -> String {
    format!("workspace:{path}")
}

/// `execution:{id}` — the lock-service key convention for whole-execution
/// mutual exclusion.
pub fn execution_lock_key(exec: &ExecutionId) -> String {
    format!("execution:{exec}")
}
