//! # Shared Export Engine Types
//!
//! This module defines the types that cross the boundary between client
//! implementations, fetch workers and the merge/pipeline layers: message
//! records, half-open ID ranges, datacenter tags and hot-zone severities.
//!
//! Messages are opaque to the engine except for their integer `id`, which is
//! strictly increasing per source. Everything the destination format cares
//! about travels in the `payload` untouched.

use serde::{Deserialize, Serialize};

/// Message identifier as assigned by the remote history. Strictly increasing
/// per source chat.
pub type MessageId = i64;

/// A single exported message: the ordering key plus an opaque payload.
///
/// The engine never inspects `payload`; it is carried verbatim from the
/// client implementation through spill files to the downstream consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl MessageRecord {
    pub fn new(id: MessageId, payload: serde_json::Value) -> Self {
        Self { id, payload }
    }

    /// A record with an empty payload, mostly useful in tests and probes.
    pub fn bare(id: MessageId) -> Self {
        Self {
            id,
            payload: serde_json::Value::Null,
        }
    }
}

/// A half-open ID range `[lo, hi)` handed to a worker as one unit of fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub lo: MessageId,
    pub hi: MessageId,
}

impl ChunkRange {
    pub fn new(lo: MessageId, hi: MessageId) -> Self {
        debug_assert!(lo < hi, "chunk range must be non-empty");
        Self { lo, hi }
    }

    /// Number of IDs covered by the range.
    pub fn span(&self) -> i64 {
        self.hi - self.lo
    }

    /// Divides the range into 4 equal sub-ranges; the last one absorbs the
    /// remainder so the union is exactly `self`.
    pub fn split4(&self) -> [ChunkRange; 4] {
        let quarter = self.span() / 4;
        let mut parts = [*self; 4];
        for (i, part) in parts.iter_mut().enumerate() {
            part.lo = self.lo + quarter * i as i64;
            part.hi = if i < 3 {
                self.lo + quarter * (i as i64 + 1)
            } else {
                self.hi
            };
        }
        parts
    }
}

impl core::fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}-{}", self.lo, self.hi)
    }
}

/// Opaque datacenter tag partitioning hot-zone knowledge.
///
/// Observed values look like `"DC2"`; an unresolvable datacenter is
/// `"Unknown"` and never matches learned zones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Datacenter(pub String);

impl Datacenter {
    pub const UNKNOWN: &'static str = "Unknown";

    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    /// Builds a tag from a numeric datacenter id; `0` means unknown.
    pub fn from_dc_id(dc_id: u32) -> Self {
        if dc_id > 0 {
            Self(format!("DC{dc_id}"))
        } else {
            Self::unknown()
        }
    }

    pub fn is_known(&self) -> bool {
        self.0 != Self::UNKNOWN
    }
}

impl core::fmt::Display for Datacenter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Datacenter {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Risk level of a hot zone. Lower severity implies a larger recommended
/// chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl core::fmt::Display for Severity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}
