//! SLAM engine layer.
//!
//! # Contents
//!
//! - [`config`]: the single configuration record and its enumerated modes
//! - [`error`]: engine error variants and recovery strategies
//! - [`slam`]: the per-frame pipeline orchestrator

pub mod config;
pub mod error;
pub mod slam;

pub use config::{EgoMotionMode, LoggingStorage, MapsConfig, SlamConfig, UndistortionMode};
pub use error::{Result, SlamError};
pub use slam::{PoseGraphData, Slam};
