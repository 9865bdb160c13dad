//! Error types for the export engine.
//!
//! This module defines the central `Error` enum shared by the engine and by
//! client implementations. Remote-side failures are classified into the
//! handful of kinds the retry layer knows how to recover from; everything
//! else surfaces through the generic variants.
//!
//! ## Error Cases
//! - `RateLimited` / `SlowMode`: the server demanded a wait; the engine
//!   sleeps the exact amount and retries without consuming an attempt.
//! - `Timeout`: a per-attempt deadline elapsed; consumes an attempt and
//!   scales future timeouts.
//! - `Rpc`: a generic remote failure; consumes an attempt.
//! - `Channel`: an internal communication failure between tasks.
//! - `EntityUnresolved` / `InvalidRequest`: unusable caller input; fatal.
//! - `ServiceShutdown`: work was refused because shutdown is in progress.

use core::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the export engine.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The remote imposed a rate limit and told us how long to wait.
    #[error("rate limited, server asked for {}s", wait.as_secs())]
    RateLimited { wait: Duration },

    /// The remote is in slow mode and told us how long to wait.
    #[error("slow mode, server asked for {}s", wait.as_secs())]
    SlowMode { wait: Duration },

    /// A per-attempt deadline elapsed before the operation finished.
    #[error("operation timed out after {}s", elapsed.as_secs())]
    Timeout { elapsed: Duration },

    /// Generic remote call failure.
    #[error("remote call failed: {message}")]
    Rpc { message: String },

    /// Internal channel send/receive failure (e.g., closed or full channel).
    #[error("channel error: {context}")]
    Channel { context: String },

    /// The target entity could not be resolved by the remote.
    #[error("cannot resolve entity: {target}")]
    EntityUnresolved { target: String },

    /// The caller's request was invalid or exceeded constraints.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Work arrived while the engine was shutting down.
    #[error("service is shutting down")]
    ServiceShutdown,

    /// Spill file or slow-range database I/O failure.
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame payload or database (de)serialization failure.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Anything the classifier could not place.
    #[error("{message}")]
    Other { message: String },
}

impl Error {
    /// Returns the server-demanded wait when this error is one of the
    /// wait-and-retry kinds. Such errors never consume a retry attempt.
    pub fn server_wait(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { wait } | Self::SlowMode { wait } => Some(*wait),
            _ => None,
        }
    }

    /// Shorthand for a generic remote failure.
    pub fn rpc(message: impl Into<String>) -> Self {
        Self::Rpc {
            message: message.into(),
        }
    }

    /// Shorthand for an unclassified failure.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}
