//! Engine configuration.
//!
//! One serde record of sections, loadable from any serde format. Every
//! field has a default so partial configurations deserialize cleanly.

use nalgebra::Isometry3;
use serde::{Deserialize, Serialize};

use crate::algorithms::extraction::SpinningExtractorConfig;
use crate::algorithms::mapping::RollingGridConfig;
use crate::algorithms::matching::RegistrationConfig;

/// How the ego-motion seed for localization is produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EgoMotionMode {
    /// Identity relative motion; the previous pose is reused.
    None,
    /// Constant-velocity extrapolation from the two previous poses.
    #[default]
    MotionExtrapolation,
    /// ICP against the previous frame's keypoints.
    Registration,
    /// Extrapolate, then refine by ICP.
    MotionExtrapolationAndRegistration,
}

/// How within-sweep motion distortion is compensated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndistortionMode {
    /// Points are used as measured.
    None,
    /// Points are de-skewed with an interpolated pose; only the sweep-end
    /// pose is optimized.
    #[default]
    Approximated,
    /// Begin and end poses are optimized jointly; residuals interpolate
    /// the pose at each point's timestamp.
    Optimized,
}

/// How logged keypoint snapshots are stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggingStorage {
    /// Plain clouds.
    #[default]
    Cloud,
    /// LZF-packed clouds; slower to log, about 4x smaller.
    CompressedCloud,
}

/// Per-feature-kind rolling grid parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MapsConfig {
    /// Voxels per window side, shared by the three maps.
    #[serde(default = "default_grid_size")]
    pub grid_size: usize,
    /// Voxel edge length in meters, shared by the three maps.
    #[serde(default = "default_voxel_resolution")]
    pub voxel_resolution: f64,
    /// Leaf size of the edges map (meters).
    #[serde(default = "default_leaf_size_edges")]
    pub leaf_size_edges: f64,
    /// Leaf size of the planes map (meters).
    #[serde(default = "default_leaf_size_planes")]
    pub leaf_size_planes: f64,
    /// Leaf size of the blobs map (meters).
    #[serde(default = "default_leaf_size_blobs")]
    pub leaf_size_blobs: f64,
}

fn default_grid_size() -> usize {
    50
}
fn default_voxel_resolution() -> f64 {
    10.0
}
fn default_leaf_size_edges() -> f64 {
    0.30
}
fn default_leaf_size_planes() -> f64 {
    0.60
}
fn default_leaf_size_blobs() -> f64 {
    0.30
}

impl Default for MapsConfig {
    fn default() -> Self {
        Self {
            grid_size: default_grid_size(),
            voxel_resolution: default_voxel_resolution(),
            leaf_size_edges: default_leaf_size_edges(),
            leaf_size_planes: default_leaf_size_planes(),
            leaf_size_blobs: default_leaf_size_blobs(),
        }
    }
}

impl MapsConfig {
    /// Grid configuration of one map kind.
    pub fn grid_config(&self, leaf_size: f64) -> RollingGridConfig {
        RollingGridConfig {
            grid_size: self.grid_size,
            voxel_resolution: self.voxel_resolution,
            leaf_size,
        }
    }
}

/// Complete engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SlamConfig {
    /// Worker threads for the data-parallel sections (1 = sequential).
    #[serde(default = "default_nb_threads")]
    pub nb_threads: usize,

    /// When true, localization planars are the extractor's planar
    /// keypoints; when false, every non-invalid point is used.
    #[serde(default = "default_fast_slam")]
    pub fast_slam: bool,

    /// Ego-motion seeding strategy.
    #[serde(default)]
    pub ego_motion: EgoMotionMode,

    /// Within-sweep motion compensation.
    #[serde(default)]
    pub undistortion: UndistortionMode,

    /// Trajectory/keypoint log window in seconds. 0 disables logging, a
    /// negative value keeps everything.
    #[serde(default)]
    pub logging_timeout: f64,

    /// Storage of logged keypoint snapshots.
    #[serde(default)]
    pub logging_storage: LoggingStorage,

    /// Whether the feature maps are updated each frame. Disabling it runs
    /// localization-only in a frozen map.
    #[serde(default = "default_update_map")]
    pub update_map: bool,

    /// Frame id of the fixed world frame.
    #[serde(default = "default_world_frame_id")]
    pub world_frame_id: String,

    /// Frame id of the tracked body. When unset, the input cloud's frame
    /// is tracked directly (BASE = LIDAR).
    #[serde(default)]
    pub base_frame_id: Option<String>,

    /// Pose of the LIDAR origin in BASE coordinates. Changing it mid-run
    /// resets the engine state.
    #[serde(skip, default = "Isometry3::identity")]
    pub base_to_lidar_offset: Isometry3<f64>,

    /// Neighborhoods farther than this from a keypoint never produce a
    /// match (meters).
    #[serde(default = "default_max_distance_for_icp_matching")]
    pub max_distance_for_icp_matching: f64,

    /// Below this many total matches a registration stage is declared
    /// divergent and the seed pose is kept.
    #[serde(default = "default_min_nb_matched_keypoints")]
    pub min_nb_matched_keypoints: usize,

    /// Ego-motion stage parameters.
    #[serde(default = "RegistrationConfig::ego_motion")]
    pub ego_motion_registration: RegistrationConfig,

    /// Localization stage parameters.
    #[serde(default = "RegistrationConfig::localization")]
    pub localization_registration: RegistrationConfig,

    /// Rolling grid parameters.
    #[serde(default)]
    pub maps: MapsConfig,

    /// Keypoint extractor parameters.
    #[serde(default)]
    pub extractor: SpinningExtractorConfig,
}

fn default_nb_threads() -> usize {
    1
}
fn default_fast_slam() -> bool {
    true
}
fn default_update_map() -> bool {
    true
}
fn default_world_frame_id() -> String {
    "world".to_string()
}
fn default_max_distance_for_icp_matching() -> f64 {
    5.0
}
fn default_min_nb_matched_keypoints() -> usize {
    20
}

impl Default for SlamConfig {
    fn default() -> Self {
        Self {
            nb_threads: default_nb_threads(),
            fast_slam: default_fast_slam(),
            ego_motion: EgoMotionMode::default(),
            undistortion: UndistortionMode::default(),
            logging_timeout: 0.0,
            logging_storage: LoggingStorage::default(),
            update_map: default_update_map(),
            world_frame_id: default_world_frame_id(),
            base_frame_id: None,
            base_to_lidar_offset: Isometry3::identity(),
            max_distance_for_icp_matching: default_max_distance_for_icp_matching(),
            min_nb_matched_keypoints: default_min_nb_matched_keypoints(),
            ego_motion_registration: RegistrationConfig::ego_motion(),
            localization_registration: RegistrationConfig::localization(),
            maps: MapsConfig::default(),
            extractor: SpinningExtractorConfig::default(),
        }
    }
}
