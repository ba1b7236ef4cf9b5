//! # ChakraSLAM
//!
//! Real-time LiDAR-only SLAM for spinning multi-beam range sensors.
//!
//! The engine ingests successive point-cloud sweeps and produces a 6-DoF
//! pose trajectory of a tracked body frame plus three persistent feature
//! maps (edge, planar and blob keypoints) accumulated around the sensor.
//!
//! # Architecture
//!
//! The crate is organized into 4 logical layers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      io/                            │  ← Persistence
//! │              (PCD maps, LZF packing)                │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                    engine/                          │  ← Orchestration
//! │           (pipeline, config, errors)                │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                  algorithms/                        │  ← Core algorithms
//! │        (extraction, matching, mapping)              │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     core/                           │  ← Foundation
//! │              (types, math, motion)                  │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Pipeline
//!
//! Each call to [`Slam::add_frame`] runs one sweep through:
//!
//! 1. **Keypoint extraction** — per-scan-line curvature analysis labels
//!    every point edge / planar / blob / invalid.
//! 2. **Ego-motion** — a fast seed of the new pose, by constant-velocity
//!    extrapolation and/or ICP against the previous frame's keypoints.
//! 3. **Localization** — robust ICP + Levenberg-Marquardt against the
//!    rolling feature maps, with optional within-sweep undistortion and a
//!    6-DoF covariance estimate.
//! 4. **Map update** — world-frame keypoints are inserted into the three
//!    rolling voxel grids, which slide with the sensor and evict what
//!    falls behind.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use chakra_slam::{PointCloud, Slam, SlamConfig};
//!
//! let mut slam = Slam::new(SlamConfig::default());
//!
//! for cloud in sweeps {
//!     slam.add_frame(&cloud)?;
//!     let pose = slam.world_transform();
//!     println!("x = {:.2} m, yaw = {:.3} rad", pose.x(), pose.rz());
//! }
//!
//! slam.save_maps_to_pcd("run1", chakra_slam::PcdFormat::BinaryCompressed)?;
//! ```
//!
//! # Coordinate frames
//!
//! - **LIDAR**: frame of the incoming clouds (sensor origin)
//! - **BASE**: tracked body frame; equals LIDAR unless a rigid
//!   `base_to_lidar_offset` is configured
//! - **WORLD**: fixed frame, coincident with BASE at the first sweep

#![warn(missing_docs)]

// ============================================================================
// Layer 1: Core foundation (no internal deps)
// ============================================================================
pub mod core;

// ============================================================================
// Layer 2: Algorithms (depends on core)
// ============================================================================
pub mod algorithms;

// ============================================================================
// Layer 3: Engine (depends on core, algorithms)
// ============================================================================
pub mod engine;

// ============================================================================
// Layer 4: I/O (depends on all layers)
// ============================================================================
pub mod io;

// ============================================================================
// Convenience re-exports (flat namespace for common use)
// ============================================================================

pub use crate::core::motion::LinearTransformInterpolator;
pub use crate::core::types::{
    Covariance6, Keypoint, KeypointLabel, LidarPoint, PointCloud, Transform,
};

pub use algorithms::extraction::{
    ExtractedKeypoints, KeypointExtractor, SpinningExtractorConfig,
    SpinningSensorKeypointExtractor,
};
pub use algorithms::mapping::{RollingGrid, RollingGridConfig};
pub use algorithms::matching::{MatchStatus, RegistrationConfig};

pub use engine::{
    EgoMotionMode, LoggingStorage, MapsConfig, PoseGraphData, Result, Slam, SlamConfig, SlamError,
    UndistortionMode,
};

pub use io::{load_pcd, save_pcd, PcdFormat};
