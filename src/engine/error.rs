//! Error types for the SLAM engine.
//!
//! # Error Recovery Strategies
//!
//! The pipeline degrades rather than fails wherever possible:
//!
//! ## Recovered locally (frame skipped, state unchanged)
//!
//! - **`InputInvalid`**: empty cloud, duplicate or non-monotonic
//!   timestamp, or a frame-id mismatch. [`Slam::add_frame`] returns this
//!   error, logs a warning, and leaves every piece of state untouched —
//!   the next valid frame proceeds as if the bad one never arrived.
//!
//! ## Degraded internally (no error returned)
//!
//! - **Degenerate extraction**: too few keypoints. The frame advances on
//!   the extrapolated pose only; localization and the map update are
//!   skipped. Reported through `debug_information()`.
//! - **Divergent or numerically failed registration**: the seed pose is
//!   kept and the covariance inflated. Also reported through
//!   `debug_information()`.
//!
//! ## Surfaced to the caller
//!
//! - **`Io`** / **`Format`**: map save/load problems. The caller decides
//!   whether to retry with another path or continue without persistence.
//!
//! [`Slam::add_frame`]: crate::engine::Slam::add_frame

use thiserror::Error;

/// Errors surfaced by the SLAM engine.
#[derive(Error, Debug)]
pub enum SlamError {
    /// The input frame cannot be processed; state is unchanged.
    #[error("invalid input frame: {reason}")]
    InputInvalid {
        /// Human-readable cause.
        reason: String,
    },

    /// Map persistence I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unsupported map file content.
    #[error("malformed file {path}: {reason}")]
    Format {
        /// Offending file.
        path: String,
        /// What was wrong.
        reason: String,
    },
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, SlamError>;
