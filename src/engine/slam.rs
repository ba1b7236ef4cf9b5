//! SLAM orchestrator.
//!
//! One [`Slam`] instance owns the extractor, the three rolling feature
//! maps and the pose state, and runs the per-frame pipeline:
//!
//! ```text
//! check_frame -> extract_keypoints -> compute_ego_motion -> localization
//!             -> update_maps_using_tworld -> log_current_frame_state
//! ```
//!
//! `add_frame` is a blocking call and must not be re-entered; `&mut self`
//! enforces that. Within a frame, match building and extraction fan out
//! over the configured thread pool; the maps are only mutated after all
//! parallel work has completed.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::time::Instant;

use log::{debug, info, warn};
use nalgebra::{Isometry3, Matrix6, Vector3};

use crate::algorithms::extraction::{
    ExtractedKeypoints, KeypointExtractor, SpinningSensorKeypointExtractor,
};
use crate::algorithms::mapping::RollingGrid;
use crate::algorithms::matching::{
    optimize_interpolated_pose, optimize_single_pose, KdTreeCloud, KeypointsRegistration,
    MatchStatus, MatchingResults, SolverOutput,
};
use crate::core::math::{angular_distance, scale_isometry, translation_distance};
use crate::core::motion::LinearTransformInterpolator;
use crate::core::types::{Covariance6, Keypoint, KeypointLabel, LidarPoint, PointCloud, Transform};
use crate::engine::config::{EgoMotionMode, LoggingStorage, SlamConfig, UndistortionMode};
use crate::engine::error::{Result, SlamError};
use crate::io::pcd::{load_pcd, save_pcd, PcdFormat};
use crate::io::{lzf, pcd};

/// Default frame id of the tracked body when an offset is configured but
/// no name was given.
const DEFAULT_BASE_FRAME_ID: &str = "base";

/// A logged keypoint snapshot, raw or LZF-packed.
#[derive(Clone, Debug)]
enum StoredCloud {
    Raw(PointCloud),
    Compressed {
        bytes: Vec<u8>,
        nb_points: usize,
        timestamp_us: u64,
        frame_id: String,
    },
}

impl StoredCloud {
    fn store(cloud: &PointCloud, storage: LoggingStorage) -> Self {
        match storage {
            LoggingStorage::Cloud => StoredCloud::Raw(cloud.clone()),
            LoggingStorage::CompressedCloud => {
                let packed = lzf::compress(&pcd::pack_points_soa(&cloud.points));
                StoredCloud::Compressed {
                    bytes: packed,
                    nb_points: cloud.len(),
                    timestamp_us: cloud.timestamp_us,
                    frame_id: cloud.frame_id.clone(),
                }
            }
        }
    }

    fn load(&self) -> PointCloud {
        match self {
            StoredCloud::Raw(cloud) => cloud.clone(),
            StoredCloud::Compressed {
                bytes,
                nb_points,
                timestamp_us,
                frame_id,
            } => {
                let expected = nb_points * pcd::ROW_SIZE;
                match lzf::decompress(bytes, expected)
                    .and_then(|soa| pcd::unpack_points_soa(&soa, *nb_points))
                {
                    Ok(points) => PointCloud::from_points(points, *timestamp_us, frame_id.clone()),
                    Err(reason) => {
                        warn!("corrupt compressed keypoint log: {reason}");
                        PointCloud::new(*timestamp_us, frame_id.clone())
                    }
                }
            }
        }
    }
}

/// Per-frame timing and outcome record backing `debug_information()`.
#[derive(Clone, Debug, Default)]
struct FrameDiagnostics {
    extraction_ms: f64,
    ego_motion_ms: f64,
    localization_ms: f64,
    map_update_ms: f64,
    total_ms: f64,
    ego_iterations: usize,
    localization_iterations: usize,
    degenerate: bool,
    divergent: bool,
    numerical_failure: bool,
}

/// Snapshot of everything the external pose-graph collaborator needs.
#[derive(Clone, Debug, Default)]
pub struct PoseGraphData {
    /// Logged trajectory, oldest first.
    pub trajectory: Vec<Transform>,
    /// Covariance per trajectory entry.
    pub covariances: Vec<Covariance6>,
    /// Logged BASE-frame edge keypoints per entry.
    pub edges: Vec<PointCloud>,
    /// Logged BASE-frame planar keypoints per entry.
    pub planars: Vec<PointCloud>,
    /// Logged BASE-frame blob keypoints per entry.
    pub blobs: Vec<PointCloud>,
}

/// Real-time LiDAR-only SLAM engine for a spinning multi-beam sensor.
pub struct Slam {
    config: SlamConfig,
    pool: Option<rayon::ThreadPool>,
    extractor: Box<dyn KeypointExtractor>,

    // Frame bookkeeping
    nb_frames_processed: u32,
    previous_timestamp_us: Option<u64>,
    last_frame_gap: f64,
    lidar_frame_id: Option<String>,
    frame_duration: f64,
    latency: f64,

    // Pose state
    t_world: Isometry3<f64>,
    previous_t_world: Isometry3<f64>,
    t_relative: Isometry3<f64>,
    t_world_frame_start: Isometry3<f64>,
    within_frame_motion: LinearTransformInterpolator,

    // Current and previous keypoints, BASE frame, raw (not undistorted)
    current_frame: PointCloud,
    current_edges: PointCloud,
    current_planars: PointCloud,
    current_blobs: PointCloud,
    localization_planars: PointCloud,
    previous_edges: PointCloud,
    previous_planars: PointCloud,

    // Current keypoints in WORLD frame (undistorted when enabled)
    current_world_edges: PointCloud,
    current_world_planars: PointCloud,
    current_world_blobs: PointCloud,

    // Extraction debug
    labels: Vec<KeypointLabel>,
    curvature: Vec<f64>,

    // Feature maps
    edges_map: RollingGrid,
    planars_map: RollingGrid,
    blobs_map: RollingGrid,

    // Registration debug
    ego_statuses: HashMap<Keypoint, Vec<MatchStatus>>,
    localization_statuses: HashMap<Keypoint, Vec<MatchStatus>>,
    ego_matches: HashMap<Keypoint, usize>,
    localization_matches: HashMap<Keypoint, usize>,
    covariance: Matrix6<f64>,
    diagnostics: FrameDiagnostics,

    // Logs
    log_trajectory: VecDeque<Transform>,
    log_covariances: VecDeque<Covariance6>,
    log_edges: VecDeque<StoredCloud>,
    log_planars: VecDeque<StoredCloud>,
    log_blobs: VecDeque<StoredCloud>,
}

impl Slam {
    /// Create an engine with the spinning-sensor extractor.
    pub fn new(config: SlamConfig) -> Self {
        let extractor = Box::new(SpinningSensorKeypointExtractor::new(config.extractor.clone()));
        Self::with_extractor(config, extractor)
    }

    /// Create an engine with a custom keypoint extractor.
    pub fn with_extractor(config: SlamConfig, extractor: Box<dyn KeypointExtractor>) -> Self {
        let pool = if config.nb_threads > 1 {
            rayon::ThreadPoolBuilder::new()
                .num_threads(config.nb_threads)
                .build()
                .map_err(|e| warn!("thread pool creation failed, running sequentially: {e}"))
                .ok()
        } else {
            None
        };
        let edges_grid = config.maps.grid_config(config.maps.leaf_size_edges);
        let planars_grid = config.maps.grid_config(config.maps.leaf_size_planes);
        let blobs_grid = config.maps.grid_config(config.maps.leaf_size_blobs);
        Self {
            config,
            pool,
            extractor,
            nb_frames_processed: 0,
            previous_timestamp_us: None,
            last_frame_gap: 0.0,
            lidar_frame_id: None,
            frame_duration: 0.0,
            latency: 0.0,
            t_world: Isometry3::identity(),
            previous_t_world: Isometry3::identity(),
            t_relative: Isometry3::identity(),
            t_world_frame_start: Isometry3::identity(),
            within_frame_motion: LinearTransformInterpolator::identity(),
            current_frame: PointCloud::default(),
            current_edges: PointCloud::default(),
            current_planars: PointCloud::default(),
            current_blobs: PointCloud::default(),
            localization_planars: PointCloud::default(),
            previous_edges: PointCloud::default(),
            previous_planars: PointCloud::default(),
            current_world_edges: PointCloud::default(),
            current_world_planars: PointCloud::default(),
            current_world_blobs: PointCloud::default(),
            labels: Vec::new(),
            curvature: Vec::new(),
            edges_map: RollingGrid::new(edges_grid),
            planars_map: RollingGrid::new(planars_grid),
            blobs_map: RollingGrid::new(blobs_grid),
            ego_statuses: HashMap::new(),
            localization_statuses: HashMap::new(),
            ego_matches: HashMap::new(),
            localization_matches: HashMap::new(),
            covariance: Matrix6::identity(),
            diagnostics: FrameDiagnostics::default(),
            log_trajectory: VecDeque::new(),
            log_covariances: VecDeque::new(),
            log_edges: VecDeque::new(),
            log_planars: VecDeque::new(),
            log_blobs: VecDeque::new(),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &SlamConfig {
        &self.config
    }

    /// Number of frames processed since construction or the last reset.
    pub fn nb_frames_processed(&self) -> u32 {
        self.nb_frames_processed
    }

    /// Replace the BASE<-LIDAR offset. The offset is invariant for a run,
    /// so all engine state is reset.
    pub fn set_base_to_lidar_offset(&mut self, offset: Isometry3<f64>) {
        self.config.base_to_lidar_offset = offset;
        self.reset(true);
    }

    /// Drop all state. When `reset_log` is false the trajectory and
    /// keypoint logs survive; calling this twice is equivalent to once.
    pub fn reset(&mut self, reset_log: bool) {
        self.nb_frames_processed = 0;
        self.previous_timestamp_us = None;
        self.last_frame_gap = 0.0;
        self.lidar_frame_id = None;
        self.frame_duration = 0.0;
        self.latency = 0.0;
        self.t_world = Isometry3::identity();
        self.previous_t_world = Isometry3::identity();
        self.t_relative = Isometry3::identity();
        self.t_world_frame_start = Isometry3::identity();
        self.within_frame_motion = LinearTransformInterpolator::identity();
        self.current_frame = PointCloud::default();
        self.current_edges = PointCloud::default();
        self.current_planars = PointCloud::default();
        self.current_blobs = PointCloud::default();
        self.localization_planars = PointCloud::default();
        self.previous_edges = PointCloud::default();
        self.previous_planars = PointCloud::default();
        self.current_world_edges = PointCloud::default();
        self.current_world_planars = PointCloud::default();
        self.current_world_blobs = PointCloud::default();
        self.labels = Vec::new();
        self.curvature = Vec::new();
        self.clear_maps();
        self.ego_statuses = HashMap::new();
        self.localization_statuses = HashMap::new();
        self.ego_matches = HashMap::new();
        self.localization_matches = HashMap::new();
        self.covariance = Matrix6::identity();
        self.diagnostics = FrameDiagnostics::default();
        if reset_log {
            self.log_trajectory = VecDeque::new();
            self.log_covariances = VecDeque::new();
            self.log_edges = VecDeque::new();
            self.log_planars = VecDeque::new();
            self.log_blobs = VecDeque::new();
        }
    }

    /// Empty the three feature maps.
    pub fn clear_maps(&mut self) {
        self.edges_map.clear();
        self.planars_map.clear();
        self.blobs_map.clear();
    }

    // =========================================================================
    // MAIN PIPELINE
    // =========================================================================

    /// Process one sweep end-to-end.
    ///
    /// On an invalid input frame (empty cloud, duplicate or non-monotonic
    /// timestamp, frame-id mismatch) an [`SlamError::InputInvalid`] is
    /// returned and no state is modified.
    pub fn add_frame(&mut self, cloud: &PointCloud) -> Result<()> {
        let frame_start = Instant::now();
        self.check_frame(cloud)?;

        if self.lidar_frame_id.is_none() {
            self.lidar_frame_id = Some(cloud.frame_id.clone());
        }
        self.last_frame_gap = self
            .previous_timestamp_us
            .map(|prev| (cloud.timestamp_us.saturating_sub(prev)) as f64 * 1e-6)
            .unwrap_or(0.0);
        self.update_frame_time(cloud);
        self.diagnostics = FrameDiagnostics::default();

        // 1. Keypoint extraction, LIDAR frame, then LIDAR -> BASE.
        let t0 = Instant::now();
        self.extract_keypoints(cloud);
        self.diagnostics.extraction_ms = t0.elapsed().as_secs_f64() * 1e3;

        let degenerate = self.current_edges.len() + self.localization_planars.len()
            < self.config.min_nb_matched_keypoints;
        self.diagnostics.degenerate = degenerate;

        if self.nb_frames_processed == 0 {
            // WORLD coincides with BASE at the first sweep; just seed the
            // maps.
            self.t_relative = Isometry3::identity();
            self.within_frame_motion.set_endpoints(
                self.t_world,
                0.0,
                self.t_world,
                1.0,
            );
            self.t_world_frame_start = self.t_world;
        } else if degenerate {
            warn!(
                "frame {}: only {} keypoints, falling back to extrapolation",
                self.nb_frames_processed,
                self.current_edges.len() + self.localization_planars.len()
            );
            self.apply_extrapolation_only();
        } else {
            // 2. Ego-motion: seed the world pose.
            let t1 = Instant::now();
            self.compute_ego_motion();
            self.diagnostics.ego_motion_ms = t1.elapsed().as_secs_f64() * 1e3;

            // 3. Localization: refine against the maps.
            let t2 = Instant::now();
            self.localization();
            self.diagnostics.localization_ms = t2.elapsed().as_secs_f64() * 1e3;
        }

        // 4. Map update with world-frame (undistorted) keypoints.
        let t3 = Instant::now();
        self.update_maps_using_tworld(degenerate);
        self.diagnostics.map_update_ms = t3.elapsed().as_secs_f64() * 1e3;

        // 5. Trajectory/keypoint logging and frame state swap.
        self.log_current_frame_state(cloud);

        self.previous_t_world = self.t_world;
        self.previous_timestamp_us = Some(cloud.timestamp_us);
        self.nb_frames_processed += 1;
        self.latency = frame_start.elapsed().as_secs_f64();
        self.diagnostics.total_ms = self.latency * 1e3;

        info!(
            "frame {} processed in {:.1} ms: pose = ({:.3}, {:.3}, {:.3})",
            self.nb_frames_processed,
            self.diagnostics.total_ms,
            self.t_world.translation.vector.x,
            self.t_world.translation.vector.y,
            self.t_world.translation.vector.z,
        );
        Ok(())
    }

    /// Validate the input frame without touching state.
    fn check_frame(&self, cloud: &PointCloud) -> Result<()> {
        if cloud.is_empty() {
            return Err(SlamError::InputInvalid {
                reason: "empty point cloud".to_string(),
            });
        }
        if let Some(prev) = self.previous_timestamp_us {
            if cloud.timestamp_us == prev {
                return Err(SlamError::InputInvalid {
                    reason: format!("duplicate timestamp {} us", prev),
                });
            }
            if cloud.timestamp_us < prev {
                return Err(SlamError::InputInvalid {
                    reason: format!(
                        "non-monotonic timestamp: {} us after {} us",
                        cloud.timestamp_us, prev
                    ),
                });
            }
        }
        if let Some(expected) = &self.lidar_frame_id {
            if *expected != cloud.frame_id {
                return Err(SlamError::InputInvalid {
                    reason: format!(
                        "frame id '{}' does not match expected '{}'",
                        cloud.frame_id, expected
                    ),
                });
            }
        }
        Ok(())
    }

    /// Measure the sweep duration from the point time field.
    fn update_frame_time(&mut self, cloud: &PointCloud) {
        self.frame_duration = cloud
            .points
            .iter()
            .map(|p| p.time)
            .fold(0.0f64, f64::max)
            .max(0.0);
        if self.config.undistortion != UndistortionMode::None && self.frame_duration <= 0.0 {
            debug!("point times are flat, undistortion disabled for this frame");
        }
    }

    /// Run the extractor and move keypoints into BASE coordinates.
    fn extract_keypoints(&mut self, cloud: &PointCloud) {
        let extractor = &self.extractor;
        let extracted: ExtractedKeypoints = match &self.pool {
            Some(pool) => pool.install(|| extractor.extract(cloud)),
            None => extractor.extract(cloud),
        };

        let base_frame = self.tracked_frame_id();
        let offset = self.config.base_to_lidar_offset;
        self.current_frame = cloud.transformed(&offset, base_frame.clone());
        self.current_edges = extracted.edges.transformed(&offset, base_frame.clone());
        self.current_planars = extracted.planars.transformed(&offset, base_frame.clone());
        self.current_blobs = extracted.blobs.transformed(&offset, base_frame.clone());

        // Localization planars: extractor labels only (fast), or every
        // non-invalid point.
        self.localization_planars = if self.config.fast_slam {
            self.current_planars.clone()
        } else {
            let points: Vec<LidarPoint> = self
                .current_frame
                .points
                .iter()
                .zip(extracted.labels.iter())
                .filter(|(_, label)| label.is_valid())
                .map(|(p, _)| *p)
                .collect();
            PointCloud::from_points(points, cloud.timestamp_us, base_frame)
        };

        self.labels = extracted.labels;
        self.curvature = extracted.curvature;

        debug!(
            "extracted {} edges, {} planars, {} blobs",
            self.current_edges.len(),
            self.current_planars.len(),
            self.current_blobs.len()
        );
    }

    /// Degenerate-extraction fallback: constant-velocity pose only.
    fn apply_extrapolation_only(&mut self) {
        if !matches!(
            self.config.ego_motion,
            EgoMotionMode::MotionExtrapolation | EgoMotionMode::MotionExtrapolationAndRegistration
        ) {
            self.t_relative = Isometry3::identity();
        }
        self.t_world = self.previous_t_world * self.t_relative;
        self.t_world_frame_start = self.previous_t_world;
        self.within_frame_motion
            .set_endpoints(self.t_world_frame_start, 0.0, self.t_world, 1.0);
        // Nothing constrained the pose; make that visible downstream.
        self.covariance *= 10.0;
    }

    // =========================================================================
    // EGO-MOTION
    // =========================================================================

    /// Estimate the relative motion since the previous sweep.
    fn compute_ego_motion(&mut self) {
        self.ego_statuses.clear();
        self.ego_matches.clear();

        // Seed from the motion model.
        let mut relative = match self.config.ego_motion {
            EgoMotionMode::None | EgoMotionMode::Registration => Isometry3::identity(),
            EgoMotionMode::MotionExtrapolation
            | EgoMotionMode::MotionExtrapolationAndRegistration => self.t_relative,
        };

        let register = matches!(
            self.config.ego_motion,
            EgoMotionMode::Registration | EgoMotionMode::MotionExtrapolationAndRegistration
        );

        if register && (!self.previous_edges.is_empty() || !self.previous_planars.is_empty()) {
            relative = self.register_against_previous_frame(relative);
        }

        self.t_relative = relative;
        self.t_world = self.previous_t_world * self.t_relative;
    }

    /// Frame-to-frame ICP refining the relative motion estimate.
    fn register_against_previous_frame(&mut self, seed: Isometry3<f64>) -> Isometry3<f64> {
        let reg_config = self.config.ego_motion_registration.clone();
        let max_dist = self.config.max_distance_for_icp_matching;
        let min_matches = self.config.min_nb_matched_keypoints;

        let edge_tree = KdTreeCloud::build(&self.previous_edges);
        let planar_tree = KdTreeCloud::build(&self.previous_planars);

        let edge_points: Vec<(Vector3<f64>, f64)> = keypoint_solver_inputs(&self.current_edges);
        let planar_points: Vec<(Vector3<f64>, f64)> =
            keypoint_solver_inputs(&self.current_planars);

        let mut estimate = seed;
        let total_icp = reg_config.icp_max_iter;
        for icp_iter in 0..total_icp {
            let previous_estimate = estimate;
            let loss_scale = reg_config.loss_scale_at(icp_iter, total_icp);

            let registration = KeypointsRegistration::new(&reg_config, max_dist);
            let edge_queries: Vec<Vector3<f64>> = edge_points
                .iter()
                .map(|(p, _)| crate::core::math::transform_vector(&estimate, p))
                .collect();
            let planar_queries: Vec<Vector3<f64>> = planar_points
                .iter()
                .map(|(p, _)| crate::core::math::transform_vector(&estimate, p))
                .collect();

            let (edge_results, planar_results) = self.run_in_pool(|| {
                (
                    registration.match_edges(&edge_tree, &edge_points, &edge_queries),
                    registration.match_planes(&planar_tree, &planar_points, &planar_queries),
                )
            });

            let nb_matches = edge_results.nb_matches() + planar_results.nb_matches();
            self.record_ego_results(&edge_results, &planar_results);

            if nb_matches < min_matches {
                warn!(
                    "ego-motion: {} matches < {}, keeping extrapolated estimate",
                    nb_matches, min_matches
                );
                self.diagnostics.divergent = true;
                return seed;
            }

            let mut matches = edge_results.matches;
            matches.extend(planar_results.matches);
            let output = optimize_single_pose(
                &matches,
                &estimate,
                loss_scale,
                reg_config.lm_max_iter,
            );
            if !output.valid {
                warn!("ego-motion: solver failed, keeping extrapolated estimate");
                self.diagnostics.numerical_failure = true;
                return seed;
            }
            estimate = output.pose;
            self.diagnostics.ego_iterations = icp_iter + 1;

            if translation_distance(&previous_estimate, &estimate) < reg_config.translation_epsilon
                && angular_distance(&previous_estimate, &estimate) < reg_config.rotation_epsilon
            {
                break;
            }
        }
        estimate
    }

    fn record_ego_results(&mut self, edges: &MatchingResults, planars: &MatchingResults) {
        self.ego_statuses
            .insert(Keypoint::Edge, edges.statuses.clone());
        self.ego_statuses
            .insert(Keypoint::Planar, planars.statuses.clone());
        self.ego_matches.insert(Keypoint::Edge, edges.nb_matches());
        self.ego_matches
            .insert(Keypoint::Planar, planars.nb_matches());
    }

    // =========================================================================
    // LOCALIZATION
    // =========================================================================

    /// Refine the world pose against the rolling feature maps.
    fn localization(&mut self) {
        self.localization_statuses.clear();
        self.localization_matches.clear();

        let seed = self.t_world;
        let reg_config = self.config.localization_registration.clone();
        let max_dist = self.config.max_distance_for_icp_matching;
        let min_matches = self.config.min_nb_matched_keypoints;

        // Within-sweep motion: the sweep spans
        // [t_end - frame_duration, t_end]; its begin pose starts on the
        // previous trajectory sample and is refined with the end pose.
        let undistortion = if self.frame_duration > 0.0 {
            self.config.undistortion
        } else {
            UndistortionMode::None
        };
        self.t_world_frame_start = self.interpolate_begin_scan_pose();
        self.within_frame_motion
            .set_endpoints(self.t_world_frame_start, 0.0, self.t_world, 1.0);

        let edge_tree = KdTreeCloud::from_points(positions_of(&self.edges_map.all_points()));
        let planar_tree = KdTreeCloud::from_points(positions_of(&self.planars_map.all_points()));
        let blob_tree = KdTreeCloud::from_points(positions_of(&self.blobs_map.all_points()));

        if planar_tree.is_empty() && edge_tree.is_empty() {
            debug!("localization skipped: maps are empty");
            return;
        }

        let edge_inputs = keypoint_solver_inputs_normalized(&self.current_edges, self.frame_duration);
        let planar_inputs =
            keypoint_solver_inputs_normalized(&self.localization_planars, self.frame_duration);
        let blob_inputs = keypoint_solver_inputs_normalized(&self.current_blobs, self.frame_duration);

        let total_icp = reg_config.icp_max_iter;
        for icp_iter in 0..total_icp {
            let previous_estimate = self.t_world;
            let loss_scale = reg_config.loss_scale_at(icp_iter, total_icp);
            let registration = KeypointsRegistration::new(&reg_config, max_dist);

            // World-frame query positions under the current estimate, with
            // per-point de-skewing when undistortion is active.
            let queries = |inputs: &[(Vector3<f64>, f64)]| -> Vec<Vector3<f64>> {
                inputs
                    .iter()
                    .map(|(p, s)| {
                        let pose = match undistortion {
                            UndistortionMode::None => self.t_world,
                            _ => self.within_frame_motion.at_fraction(*s),
                        };
                        crate::core::math::transform_vector(&pose, p)
                    })
                    .collect()
            };
            let edge_queries = queries(&edge_inputs);
            let planar_queries = queries(&planar_inputs);
            let blob_queries = queries(&blob_inputs);

            // Solver-frame points: for the single-pose solve the de-skewed
            // point expressed back in the end-of-sweep BASE frame.
            let end_inverse = self.t_world.inverse();
            let solver_inputs = |inputs: &[(Vector3<f64>, f64)],
                                 world: &[Vector3<f64>]|
             -> Vec<(Vector3<f64>, f64)> {
                match undistortion {
                    UndistortionMode::None | UndistortionMode::Optimized => inputs.to_vec(),
                    UndistortionMode::Approximated => inputs
                        .iter()
                        .zip(world.iter())
                        .map(|(&(_, s), w)| (crate::core::math::transform_vector(&end_inverse, w), s))
                        .collect(),
                }
            };
            let edge_solver = solver_inputs(&edge_inputs, &edge_queries);
            let planar_solver = solver_inputs(&planar_inputs, &planar_queries);
            let blob_solver = solver_inputs(&blob_inputs, &blob_queries);

            let (edge_results, planar_results, blob_results) = self.run_in_pool(|| {
                (
                    registration.match_edges(&edge_tree, &edge_solver, &edge_queries),
                    registration.match_planes(&planar_tree, &planar_solver, &planar_queries),
                    if blob_tree.is_empty() {
                        MatchingResults::default()
                    } else {
                        registration.match_blobs(&blob_tree, &blob_solver, &blob_queries)
                    },
                )
            });

            let nb_matches = edge_results.nb_matches()
                + planar_results.nb_matches()
                + blob_results.nb_matches();
            self.record_localization_results(&edge_results, &planar_results, &blob_results);

            if nb_matches < min_matches {
                warn!(
                    "localization: {} matches < {}, keeping ego-motion seed",
                    nb_matches, min_matches
                );
                self.diagnostics.divergent = true;
                self.t_world = seed;
                self.inflate_covariance();
                break;
            }

            let mut matches = edge_results.matches;
            matches.extend(planar_results.matches);
            matches.extend(blob_results.matches);

            let output: SolverOutput = match undistortion {
                UndistortionMode::Optimized => optimize_interpolated_pose(
                    &matches,
                    &self.t_world_frame_start,
                    &self.t_world,
                    loss_scale,
                    reg_config.lm_max_iter,
                ),
                _ => optimize_single_pose(
                    &matches,
                    &self.t_world,
                    loss_scale,
                    reg_config.lm_max_iter,
                ),
            };

            if !output.valid || !output.pose.translation.vector.iter().all(|v| v.is_finite()) {
                warn!("localization: numerical failure, keeping ego-motion seed");
                self.diagnostics.numerical_failure = true;
                self.t_world = seed;
                self.inflate_covariance();
                break;
            }

            self.t_world = output.pose;
            if let Some(begin) = output.begin_pose {
                self.t_world_frame_start = begin;
            }
            self.within_frame_motion
                .set_endpoints(self.t_world_frame_start, 0.0, self.t_world, 1.0);
            self.covariance = output.covariance;
            self.diagnostics.localization_iterations = icp_iter + 1;

            if translation_distance(&previous_estimate, &self.t_world)
                < reg_config.translation_epsilon
                && angular_distance(&previous_estimate, &self.t_world)
                    < reg_config.rotation_epsilon
            {
                break;
            }
        }

        // Keep the within-sweep interpolator consistent with whatever pose
        // survived the loop (it may have been reset to the seed).
        self.within_frame_motion
            .set_endpoints(self.t_world_frame_start, 0.0, self.t_world, 1.0);
        self.t_relative = self.previous_t_world.inverse() * self.t_world;
    }

    fn record_localization_results(
        &mut self,
        edges: &MatchingResults,
        planars: &MatchingResults,
        blobs: &MatchingResults,
    ) {
        self.localization_statuses
            .insert(Keypoint::Edge, edges.statuses.clone());
        self.localization_statuses
            .insert(Keypoint::Planar, planars.statuses.clone());
        self.localization_statuses
            .insert(Keypoint::Blob, blobs.statuses.clone());
        self.localization_matches
            .insert(Keypoint::Edge, edges.nb_matches());
        self.localization_matches
            .insert(Keypoint::Planar, planars.nb_matches());
        self.localization_matches
            .insert(Keypoint::Blob, blobs.nb_matches());
    }

    /// Pose of BASE at the start of the current sweep, interpolated on the
    /// previous trajectory segment.
    fn interpolate_begin_scan_pose(&self) -> Isometry3<f64> {
        if self.last_frame_gap <= 0.0 || self.frame_duration <= 0.0 {
            return self.previous_t_world;
        }
        // Previous pose sits at the previous sweep end; walk forward to
        // the current sweep start.
        let s = (self.last_frame_gap - self.frame_duration) / self.last_frame_gap;
        let interp = LinearTransformInterpolator::new(
            self.previous_t_world,
            0.0,
            self.previous_t_world * self.t_relative,
            1.0,
        );
        interp.at_fraction(s.clamp(0.0, 1.0))
    }

    fn inflate_covariance(&mut self) {
        self.covariance = self.covariance * 10.0 + Matrix6::identity() * 1e-2;
    }

    // =========================================================================
    // MAP UPDATE AND LOGGING
    // =========================================================================

    /// Transform the current keypoints into WORLD and feed the maps.
    fn update_maps_using_tworld(&mut self, skip_map_update: bool) {
        let world_frame = self.config.world_frame_id.clone();
        let undistort = self.config.undistortion != UndistortionMode::None
            && self.frame_duration > 0.0;

        let transform_cloud = |cloud: &PointCloud,
                               motion: &LinearTransformInterpolator,
                               end: &Isometry3<f64>,
                               duration: f64|
         -> PointCloud {
            let points = cloud
                .points
                .iter()
                .map(|p| {
                    let pose = if undistort {
                        motion.at_fraction((p.time / duration).clamp(0.0, 1.0))
                    } else {
                        *end
                    };
                    p.transformed(&pose)
                })
                .collect();
            PointCloud::from_points(points, cloud.timestamp_us, world_frame.clone())
        };

        self.current_world_edges = transform_cloud(
            &self.current_edges,
            &self.within_frame_motion,
            &self.t_world,
            self.frame_duration.max(1e-9),
        );
        self.current_world_planars = transform_cloud(
            &self.current_planars,
            &self.within_frame_motion,
            &self.t_world,
            self.frame_duration.max(1e-9),
        );
        self.current_world_blobs = transform_cloud(
            &self.current_blobs,
            &self.within_frame_motion,
            &self.t_world,
            self.frame_duration.max(1e-9),
        );

        if !self.config.update_map || skip_map_update {
            return;
        }

        let center = self.t_world.translation.vector;
        self.edges_map.roll(&center);
        self.planars_map.roll(&center);
        self.blobs_map.roll(&center);
        self.edges_map.add(&self.current_world_edges.points);
        self.planars_map.add(&self.current_world_planars.points);
        self.blobs_map.add(&self.current_world_blobs.points);
    }

    /// Append this frame to the trajectory log and swap keypoint buffers.
    fn log_current_frame_state(&mut self, cloud: &PointCloud) {
        if self.config.logging_timeout != 0.0 {
            let transform = self.make_world_transform(cloud.time_s());
            self.log_trajectory.push_back(transform);
            self.log_covariances.push_back(self.transform_covariance());
            let storage = self.config.logging_storage;
            self.log_edges
                .push_back(StoredCloud::store(&self.current_edges, storage));
            self.log_planars
                .push_back(StoredCloud::store(&self.current_planars, storage));
            self.log_blobs
                .push_back(StoredCloud::store(&self.current_blobs, storage));

            if self.config.logging_timeout > 0.0 {
                let horizon = cloud.time_s() - self.config.logging_timeout;
                while self
                    .log_trajectory
                    .front()
                    .map(|t| t.time < horizon)
                    .unwrap_or(false)
                {
                    self.log_trajectory.pop_front();
                    self.log_covariances.pop_front();
                    self.log_edges.pop_front();
                    self.log_planars.pop_front();
                    self.log_blobs.pop_front();
                }
            }
        }

        std::mem::swap(&mut self.previous_edges, &mut self.current_edges);
        std::mem::swap(&mut self.previous_planars, &mut self.current_planars);
    }

    // =========================================================================
    // OUTPUT ACCESSORS
    // =========================================================================

    /// Frame id of the tracked body.
    fn tracked_frame_id(&self) -> String {
        if let Some(base) = &self.config.base_frame_id {
            return base.clone();
        }
        let offset_is_identity = self.config.base_to_lidar_offset == Isometry3::identity();
        if offset_is_identity {
            self.lidar_frame_id
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_FRAME_ID.to_string())
        } else {
            DEFAULT_BASE_FRAME_ID.to_string()
        }
    }

    fn make_world_transform(&self, time: f64) -> Transform {
        Transform::new(
            self.t_world,
            time,
            self.config.world_frame_id.clone(),
            self.tracked_frame_id(),
        )
    }

    /// Current BASE pose in WORLD, stamped at the last sweep end.
    pub fn world_transform(&self) -> Transform {
        let time = self
            .previous_timestamp_us
            .map(|t| t as f64 * 1e-6)
            .unwrap_or(0.0);
        self.make_world_transform(time)
    }

    /// Current pose extrapolated by the measured processing latency.
    pub fn latency_compensated_world_transform(&self) -> Transform {
        let mut transform = self.world_transform();
        if self.last_frame_gap > 0.0 {
            let advance = scale_isometry(&self.t_relative, self.latency / self.last_frame_gap);
            transform.isometry = self.t_world * advance;
            transform.time += self.latency;
        }
        transform
    }

    /// Covariance of the last localization, row-major, DoF order
    /// X, Y, Z, rX, rY, rZ.
    pub fn transform_covariance(&self) -> Covariance6 {
        let mut out = [0.0f64; 36];
        for i in 0..6 {
            for j in 0..6 {
                out[i * 6 + j] = self.covariance[(i, j)];
            }
        }
        out
    }

    /// Logged trajectory, oldest first.
    pub fn trajectory(&self) -> Vec<Transform> {
        self.log_trajectory.iter().cloned().collect()
    }

    /// Logged covariances, aligned with [`Self::trajectory`].
    pub fn covariances(&self) -> Vec<Covariance6> {
        self.log_covariances.iter().copied().collect()
    }

    /// Edge feature map content.
    pub fn edges_map(&self) -> PointCloud {
        self.map_cloud(&self.edges_map)
    }

    /// Planar feature map content.
    pub fn planars_map(&self) -> PointCloud {
        self.map_cloud(&self.planars_map)
    }

    /// Blob feature map content.
    pub fn blobs_map(&self) -> PointCloud {
        self.map_cloud(&self.blobs_map)
    }

    fn map_cloud(&self, grid: &RollingGrid) -> PointCloud {
        grid.as_cloud(
            self.previous_timestamp_us.unwrap_or(0),
            self.config.world_frame_id.clone(),
        )
    }

    /// Current-frame edge keypoints, in WORLD (undistorted) or raw BASE
    /// coordinates.
    pub fn edges_keypoints(&self, world_coordinates: bool) -> PointCloud {
        if world_coordinates {
            self.current_world_edges.clone()
        } else {
            // After the frame swap the raw keypoints live in the previous
            // buffers.
            self.previous_edges.clone()
        }
    }

    /// Current-frame planar keypoints.
    pub fn planars_keypoints(&self, world_coordinates: bool) -> PointCloud {
        if world_coordinates {
            self.current_world_planars.clone()
        } else {
            self.previous_planars.clone()
        }
    }

    /// Current-frame blob keypoints.
    pub fn blobs_keypoints(&self, world_coordinates: bool) -> PointCloud {
        if world_coordinates {
            self.current_world_blobs.clone()
        } else {
            self.current_blobs.clone()
        }
    }

    /// The last input frame registered into WORLD coordinates.
    pub fn output_frame(&self) -> PointCloud {
        self.current_frame
            .transformed(&self.t_world, self.config.world_frame_id.clone())
    }

    /// Overwrite the world pose (e.g. from an external calibration) and
    /// clear the interpolation state.
    pub fn set_world_transform_from_guess(&mut self, guess: &Transform) {
        self.t_world = guess.isometry;
        self.previous_t_world = guess.isometry;
        self.t_relative = Isometry3::identity();
        self.t_world_frame_start = guess.isometry;
        self.within_frame_motion
            .set_endpoints(guess.isometry, 0.0, guess.isometry, 1.0);
    }

    // =========================================================================
    // PERSISTENCE AND POSE-GRAPH BOUNDARY
    // =========================================================================

    /// Save the three feature maps as `<prefix>_edges.pcd`,
    /// `<prefix>_planes.pcd` and `<prefix>_blobs.pcd`.
    pub fn save_maps_to_pcd(&self, prefix: &str, format: PcdFormat) -> Result<()> {
        for (kind, grid) in [
            (Keypoint::Edge, &self.edges_map),
            (Keypoint::Planar, &self.planars_map),
            (Keypoint::Blob, &self.blobs_map),
        ] {
            let path = format!("{}_{}.pcd", prefix, kind.name());
            save_pcd(&self.map_cloud(grid), Path::new(&path), format)?;
        }
        Ok(())
    }

    /// Load feature maps saved by [`Self::save_maps_to_pcd`]. With
    /// `reset_maps` the current content is dropped first.
    pub fn load_maps_from_pcd(&mut self, prefix: &str, reset_maps: bool) -> Result<()> {
        if reset_maps {
            self.clear_maps();
        }
        for (kind, grid) in [
            (Keypoint::Edge, &mut self.edges_map),
            (Keypoint::Planar, &mut self.planars_map),
            (Keypoint::Blob, &mut self.blobs_map),
        ] {
            let path = format!("{}_{}.pcd", prefix, kind.name());
            let cloud = load_pcd(Path::new(&path))?;
            if cloud.is_empty() {
                continue;
            }
            let centroid = cloud
                .points
                .iter()
                .map(|p| p.position())
                .sum::<Vector3<f64>>()
                / cloud.len() as f64;
            grid.roll(&centroid);
            grid.add(&cloud.points);
        }
        Ok(())
    }

    /// Hand the logged trajectory and keypoints to the external pose-graph
    /// optimizer.
    pub fn pose_graph_data(&self) -> PoseGraphData {
        PoseGraphData {
            trajectory: self.trajectory(),
            covariances: self.covariances(),
            edges: self.log_edges.iter().map(StoredCloud::load).collect(),
            planars: self.log_planars.iter().map(StoredCloud::load).collect(),
            blobs: self.log_blobs.iter().map(StoredCloud::load).collect(),
        }
    }

    /// Rebuild the maps and pose state from an externally optimized
    /// trajectory aligned with the logged frames.
    pub fn apply_optimized_trajectory(&mut self, poses: &[Transform]) -> Result<()> {
        if poses.len() != self.log_edges.len() {
            return Err(SlamError::InputInvalid {
                reason: format!(
                    "{} optimized poses for {} logged frames",
                    poses.len(),
                    self.log_edges.len()
                ),
            });
        }
        if poses.is_empty() {
            return Ok(());
        }

        self.clear_maps();
        let last = poses[poses.len() - 1].isometry;
        self.edges_map.roll(&last.translation.vector);
        self.planars_map.roll(&last.translation.vector);
        self.blobs_map.roll(&last.translation.vector);

        for (i, pose) in poses.iter().enumerate() {
            let iso = pose.isometry;
            for (log, grid) in [
                (&self.log_edges[i], &mut self.edges_map),
                (&self.log_planars[i], &mut self.planars_map),
                (&self.log_blobs[i], &mut self.blobs_map),
            ] {
                let world = log.load().transformed(&iso, self.config.world_frame_id.clone());
                grid.add(&world.points);
            }
            self.log_trajectory[i].isometry = iso;
        }

        if poses.len() >= 2 {
            let before_last = poses[poses.len() - 2].isometry;
            self.t_relative = before_last.inverse() * last;
            self.previous_t_world = last;
        }
        self.t_world = last;
        Ok(())
    }

    // =========================================================================
    // DIAGNOSTICS
    // =========================================================================

    /// Scalar diagnostics of the last processed frame.
    pub fn debug_information(&self) -> HashMap<String, f64> {
        let mut info = HashMap::new();
        info.insert(
            "Extraction: edges".to_string(),
            self.previous_edges.len() as f64,
        );
        info.insert(
            "Extraction: planars".to_string(),
            self.previous_planars.len() as f64,
        );
        info.insert(
            "Extraction: blobs".to_string(),
            self.current_blobs.len() as f64,
        );
        for (kind, count) in &self.ego_matches {
            info.insert(format!("EgoMotion: {} used", kind.name()), *count as f64);
        }
        for (kind, count) in &self.localization_matches {
            info.insert(format!("Localization: {} used", kind.name()), *count as f64);
        }
        info.insert(
            "EgoMotion: iterations".to_string(),
            self.diagnostics.ego_iterations as f64,
        );
        info.insert(
            "Localization: iterations".to_string(),
            self.diagnostics.localization_iterations as f64,
        );
        let variance = (0..6).map(|i| self.covariance[(i, i)]).fold(0.0, f64::max);
        info.insert("Localization: variance error".to_string(), variance);
        info.insert(
            "Localization: degenerate".to_string(),
            self.diagnostics.degenerate as u8 as f64,
        );
        info.insert(
            "Localization: divergent".to_string(),
            self.diagnostics.divergent as u8 as f64,
        );
        info.insert(
            "Localization: numerical failure".to_string(),
            self.diagnostics.numerical_failure as u8 as f64,
        );
        info.insert(
            "time: extraction (ms)".to_string(),
            self.diagnostics.extraction_ms,
        );
        info.insert(
            "time: ego motion (ms)".to_string(),
            self.diagnostics.ego_motion_ms,
        );
        info.insert(
            "time: localization (ms)".to_string(),
            self.diagnostics.localization_ms,
        );
        info.insert(
            "time: map update (ms)".to_string(),
            self.diagnostics.map_update_ms,
        );
        info.insert("time: total (ms)".to_string(), self.diagnostics.total_ms);
        info.insert("latency (s)".to_string(), self.latency);
        info
    }

    /// Per-point diagnostic arrays of the last processed frame.
    pub fn debug_arrays(&self) -> HashMap<String, Vec<f64>> {
        let mut arrays = HashMap::new();
        arrays.insert(
            "Extraction: keypoints label".to_string(),
            self.labels.iter().map(|l| l.as_debug_value()).collect(),
        );
        arrays.insert("Extraction: curvature".to_string(), self.curvature.clone());
        for (prefix, statuses) in [
            ("EgoMotion", &self.ego_statuses),
            ("Localization", &self.localization_statuses),
        ] {
            for (kind, list) in statuses {
                arrays.insert(
                    format!("{}: {} matching status", prefix, kind.name()),
                    list.iter().map(|s| s.as_debug_value()).collect(),
                );
            }
        }
        arrays
    }

    /// Run a closure inside the engine's thread pool, if any.
    fn run_in_pool<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}

/// Keypoint positions with raw in-sweep times.
fn keypoint_solver_inputs(cloud: &PointCloud) -> Vec<(Vector3<f64>, f64)> {
    cloud.points.iter().map(|p| (p.position(), p.time)).collect()
}

/// Keypoint positions with times normalized by the sweep duration.
fn keypoint_solver_inputs_normalized(
    cloud: &PointCloud,
    frame_duration: f64,
) -> Vec<(Vector3<f64>, f64)> {
    let duration = frame_duration.max(1e-9);
    cloud
        .points
        .iter()
        .map(|p| (p.position(), (p.time / duration).clamp(0.0, 1.0)))
        .collect()
}

fn positions_of(points: &[LidarPoint]) -> Vec<Vector3<f64>> {
    points.iter().map(|p| p.position()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::LidarPoint;

    fn tiny_cloud(timestamp_us: u64) -> PointCloud {
        let mut cloud = PointCloud::new(timestamp_us, "lidar");
        for ring in 0..2u8 {
            for i in 0..64 {
                let az = i as f64 * std::f64::consts::TAU / 64.0;
                cloud.push(LidarPoint {
                    x: 5.0 * az.cos(),
                    y: 5.0 * az.sin(),
                    z: ring as f64 * 0.4,
                    intensity: 1.0,
                    laser_id: ring,
                    time: i as f64 / 64.0 * 0.1,
                });
            }
        }
        cloud
    }

    #[test]
    fn test_empty_cloud_rejected_without_state_change() {
        let mut slam = Slam::new(SlamConfig::default());
        let err = slam.add_frame(&PointCloud::new(100, "lidar")).unwrap_err();
        assert!(matches!(err, SlamError::InputInvalid { .. }));
        assert_eq!(slam.nb_frames_processed(), 0);
    }

    #[test]
    fn test_duplicate_timestamp_rejected() {
        let mut slam = Slam::new(SlamConfig::default());
        slam.add_frame(&tiny_cloud(1_000_000)).unwrap();
        let err = slam.add_frame(&tiny_cloud(1_000_000)).unwrap_err();
        assert!(matches!(err, SlamError::InputInvalid { .. }));
        assert_eq!(slam.nb_frames_processed(), 1);
    }

    #[test]
    fn test_non_monotonic_timestamp_rejected() {
        let mut slam = Slam::new(SlamConfig::default());
        slam.add_frame(&tiny_cloud(2_000_000)).unwrap();
        assert!(slam.add_frame(&tiny_cloud(1_000_000)).is_err());
    }

    #[test]
    fn test_frame_id_mismatch_rejected() {
        let mut slam = Slam::new(SlamConfig::default());
        slam.add_frame(&tiny_cloud(1_000_000)).unwrap();
        let mut other = tiny_cloud(2_000_000);
        other.frame_id = "other_lidar".to_string();
        assert!(slam.add_frame(&other).is_err());
        assert_eq!(slam.nb_frames_processed(), 1);
    }

    #[test]
    fn test_first_frame_pose_is_identity() {
        let mut slam = Slam::new(SlamConfig::default());
        slam.add_frame(&tiny_cloud(1_000_000)).unwrap();
        let t = slam.world_transform();
        assert!(t.isometry.translation.vector.norm() < 1e-12);
        assert_eq!(t.frame_id, "world");
    }

    #[test]
    fn test_reset_without_log_is_idempotent() {
        let mut config = SlamConfig::default();
        config.logging_timeout = -1.0;
        let mut slam = Slam::new(config);
        slam.add_frame(&tiny_cloud(1_000_000)).unwrap();
        slam.add_frame(&tiny_cloud(2_000_000)).unwrap();

        slam.reset(false);
        let log_after_one = slam.trajectory().len();
        slam.reset(false);
        assert_eq!(slam.trajectory().len(), log_after_one);
        assert_eq!(slam.nb_frames_processed(), 0);
        assert!(slam.edges_map().is_empty());
    }

    #[test]
    fn test_set_world_transform_from_guess() {
        let mut slam = Slam::new(SlamConfig::default());
        let guess = Transform::from_xyz_rpy(5.0, -1.0, 0.5, 0.0, 0.0, 0.3, 0.0, "world", "base");
        slam.set_world_transform_from_guess(&guess);
        let t = slam.world_transform();
        assert!((t.x() - 5.0).abs() < 1e-12);
        assert!((t.rz() - 0.3).abs() < 1e-10);
    }

    #[test]
    fn test_maps_populated_after_first_frame() {
        let mut slam = Slam::new(SlamConfig::default());
        slam.add_frame(&tiny_cloud(1_000_000)).unwrap();
        // The tiny ring cloud is blob-heavy but something must land in the
        // maps.
        let total =
            slam.edges_map().len() + slam.planars_map().len() + slam.blobs_map().len();
        assert!(total > 0);
    }

    #[test]
    fn test_debug_information_keys() {
        let mut slam = Slam::new(SlamConfig::default());
        slam.add_frame(&tiny_cloud(1_000_000)).unwrap();
        let info = slam.debug_information();
        assert!(info.contains_key("time: total (ms)"));
        assert!(info.contains_key("Localization: variance error"));
        let arrays = slam.debug_arrays();
        assert!(arrays.contains_key("Extraction: keypoints label"));
    }
}
