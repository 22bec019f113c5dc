//! Asset fetch error taxonomy.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub type AssetResult<T> = Result<T, AssetFetchError>;

/// Why an asset could not be produced.
///
/// `Clone` because one failure is delivered to every waiter of a shared fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetFetchError {
    /// Transport failure that outlived the retry budget.
    Retryable {
        key: String,
        reason: String,
        attempts: u32,
    },
    /// Failure that retrying cannot fix, e.g. the resource does not exist.
    Terminal { key: String, reason: String },
    /// Every attempt hit the per-attempt timeout.
    TimedOut {
        key: String,
        timeout_ms: u64,
        attempts: u32,
    },
    /// The in-flight fetch was cancelled; callers may simply retry.
    Cancelled { key: String },
}

impl AssetFetchError {
    pub fn key(&self) -> &str {
        match self {
            Self::Retryable { key, .. }
            | Self::Terminal { key, .. }
            | Self::TimedOut { key, .. }
            | Self::Cancelled { key } => key,
        }
    }

    /// Returns whether a later `get` for the same key may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Terminal { .. })
    }
}

impl Display for AssetFetchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable {
                key,
                reason,
                attempts,
            } => write!(f, "fetching {key} failed after {attempts} attempt(s): {reason}"),
            Self::Terminal { key, reason } => write!(f, "fetching {key} failed: {reason}"),
            Self::TimedOut {
                key,
                timeout_ms,
                attempts,
            } => write!(
                f,
                "fetching {key} timed out after {timeout_ms}ms ({attempts} attempt(s))"
            ),
            Self::Cancelled { key } => write!(f, "fetching {key} was cancelled"),
        }
    }
}

impl Error for AssetFetchError {}
