#![forbid(unsafe_code)]
//! Error types for the sweep workspace.
//!
//! Defines `SweepError` and a `Result<T>` alias used throughout the
//! workspace. The variants follow the daemon's error policy: transient
//! I/O defers a subvolume, missing entities drop a candidate, corrupt
//! persistent state is repaired loudly, and programmer invariants abort
//! the current operation rather than the process.

use thiserror::Error;

/// Unified error type for all sweep operations.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tree search failed in root {root}: {detail}")]
    Search { root: u64, detail: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad state record at line {line}: {detail}")]
    State { line: usize, detail: String },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("stop requested")]
    Stopped,
}

impl SweepError {
    /// True for errors that defer one subvolume and let the scan continue.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Search { .. })
    }
}

/// Result alias using `SweepError`.
pub type Result<T> = std::result::Result<T, SweepError>;
