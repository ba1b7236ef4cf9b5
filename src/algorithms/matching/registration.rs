//! Keypoint-to-feature match building.
//!
//! For every current keypoint, the reference set (previous frame or map)
//! is queried for nearest neighbors and a local feature is fitted by PCA:
//! a 3D line for edges, a plane for planars, an unconstrained ellipsoid
//! for blobs. Each accepted match contributes the quadratic residual
//! `(R·X + T - P)^T · A · (R·X + T - P)`; the square root of `A` is
//! precomputed so the solver works with plain 3-vector residuals.

use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::KdTreeCloud;
use crate::core::math::{mean_and_covariance, sorted_eigen};

/// Why a keypoint failed (or succeeded) to produce a match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchStatus {
    /// A residual was built.
    Success,
    /// The reference set had too few neighbors.
    NotEnoughNeighbors,
    /// The neighborhood lies beyond the ICP matching distance.
    NeighborsTooFar,
    /// Neighborhood eigenvalue ratios do not support the feature model.
    BadPcaStructure,
    /// A non-finite value appeared while fitting.
    InvalidNumerical,
    /// The residual at the current estimate exceeds the feature cap.
    MseTooLarge,
    /// Unclassified failure.
    Unknown,
}

impl MatchStatus {
    /// All statuses, histogram order.
    pub const ALL: [MatchStatus; 7] = [
        MatchStatus::Success,
        MatchStatus::NotEnoughNeighbors,
        MatchStatus::NeighborsTooFar,
        MatchStatus::BadPcaStructure,
        MatchStatus::InvalidNumerical,
        MatchStatus::MseTooLarge,
        MatchStatus::Unknown,
    ];

    /// Histogram slot of this status.
    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or(6)
    }

    /// Numeric code used in debug arrays.
    pub fn as_debug_value(&self) -> f64 {
        self.index() as f64
    }
}

/// One accepted ICP match.
#[derive(Clone, Debug)]
pub struct KeypointMatch {
    /// Keypoint position in the frame the solver optimizes.
    pub point: Vector3<f64>,
    /// Normalized in-sweep time of the keypoint (0 at sweep start, 1 at
    /// end); drives within-frame pose interpolation.
    pub time: f64,
    /// Feature anchor point (neighborhood mean).
    pub target: Vector3<f64>,
    /// Square root of the quadratic-form weight `A`.
    pub sqrt_weight: Matrix3<f64>,
}

/// Matches plus the per-keypoint rejection record of one build pass.
#[derive(Clone, Debug, Default)]
pub struct MatchingResults {
    /// Status per queried keypoint, in input order.
    pub statuses: Vec<MatchStatus>,
    /// Accepted matches.
    pub matches: Vec<KeypointMatch>,
}

impl MatchingResults {
    /// Number of accepted matches.
    pub fn nb_matches(&self) -> usize {
        self.matches.len()
    }

    /// Rejection histogram in [`MatchStatus::ALL`] order.
    pub fn histogram(&self) -> [usize; 7] {
        let mut h = [0usize; 7];
        for s in &self.statuses {
            h[s.index()] += 1;
        }
        h
    }

    fn from_outcomes(outcomes: Vec<Result<KeypointMatch, MatchStatus>>) -> Self {
        let mut result = Self {
            statuses: Vec::with_capacity(outcomes.len()),
            matches: Vec::new(),
        };
        for outcome in outcomes {
            match outcome {
                Ok(m) => {
                    result.statuses.push(MatchStatus::Success);
                    result.matches.push(m);
                }
                Err(status) => result.statuses.push(status),
            }
        }
        result
    }
}

/// Parameters of one registration stage (ego-motion or localization).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Outer ICP iterations (re-association passes).
    pub icp_max_iter: usize,
    /// Inner Levenberg-Marquardt iterations per ICP pass.
    pub lm_max_iter: usize,
    /// Neighbors used for line fitting.
    pub line_distance_nb_neighbors: usize,
    /// Minimum neighbors required to keep a line fit.
    pub minimum_line_neighbor_rejection: usize,
    /// Line shape test: largest eigenvalue must exceed this factor times
    /// the middle one.
    pub line_distance_factor: f64,
    /// Neighbors used for plane fitting.
    pub plane_distance_nb_neighbors: usize,
    /// Plane shape test: middle eigenvalue must exceed this factor times
    /// the smallest.
    pub plane_distance_factor1: f64,
    /// Plane shape test: largest eigenvalue must not exceed this factor
    /// times the middle one.
    pub plane_distance_factor2: f64,
    /// Residual cap for line matches (meters).
    pub max_line_distance: f64,
    /// Residual cap for plane matches (meters).
    pub max_plane_distance: f64,
    /// Neighbors used for blob covariance fitting.
    pub blob_distance_nb_neighbors: usize,
    /// Robust loss scale at the first ICP iteration.
    pub init_loss_scale: f64,
    /// Robust loss scale at the last ICP iteration.
    pub final_loss_scale: f64,
    /// ICP termination: translation change below this stops iterating.
    pub translation_epsilon: f64,
    /// ICP termination: rotation change below this stops iterating.
    pub rotation_epsilon: f64,
}

impl RegistrationConfig {
    /// Defaults of the ego-motion stage (frame-to-frame).
    pub fn ego_motion() -> Self {
        Self {
            icp_max_iter: 4,
            lm_max_iter: 15,
            line_distance_nb_neighbors: 8,
            minimum_line_neighbor_rejection: 3,
            line_distance_factor: 5.0,
            plane_distance_nb_neighbors: 5,
            plane_distance_factor1: 35.0,
            plane_distance_factor2: 8.0,
            max_line_distance: 0.2,
            max_plane_distance: 0.2,
            blob_distance_nb_neighbors: 25,
            init_loss_scale: 2.0,
            final_loss_scale: 0.2,
            translation_epsilon: 1e-4,
            rotation_epsilon: 1e-4,
        }
    }

    /// Defaults of the localization stage (frame-to-map).
    pub fn localization() -> Self {
        Self {
            icp_max_iter: 3,
            lm_max_iter: 15,
            line_distance_nb_neighbors: 10,
            minimum_line_neighbor_rejection: 4,
            line_distance_factor: 5.0,
            plane_distance_nb_neighbors: 5,
            plane_distance_factor1: 35.0,
            plane_distance_factor2: 8.0,
            max_line_distance: 0.2,
            max_plane_distance: 0.2,
            blob_distance_nb_neighbors: 25,
            init_loss_scale: 0.7,
            final_loss_scale: 0.05,
            translation_epsilon: 1e-4,
            rotation_epsilon: 1e-4,
        }
    }

    /// Robust loss scale for ICP iteration `iter` of `total`, annealed
    /// linearly from the initial to the final scale.
    pub fn loss_scale_at(&self, iter: usize, total: usize) -> f64 {
        if total <= 1 {
            return self.final_loss_scale;
        }
        let s = iter as f64 / (total - 1) as f64;
        self.init_loss_scale + s * (self.final_loss_scale - self.init_loss_scale)
    }
}

/// Match builder over one reference set.
pub struct KeypointsRegistration<'a> {
    config: &'a RegistrationConfig,
    max_matching_distance: f64,
}

impl<'a> KeypointsRegistration<'a> {
    /// Create a builder for the given stage parameters.
    pub fn new(config: &'a RegistrationConfig, max_matching_distance: f64) -> Self {
        Self {
            config,
            max_matching_distance,
        }
    }

    /// Build line matches for edge keypoints.
    ///
    /// `solver_points` are the keypoints in the solver frame with their
    /// normalized times; `query_points` are the same keypoints mapped into
    /// the reference frame by the current estimate.
    pub fn match_edges(
        &self,
        reference: &KdTreeCloud,
        solver_points: &[(Vector3<f64>, f64)],
        query_points: &[Vector3<f64>],
    ) -> MatchingResults {
        let outcomes: Vec<_> = solver_points
            .par_iter()
            .zip(query_points.par_iter())
            .map(|(&(raw, time), query)| self.build_line_match(reference, raw, time, query))
            .collect();
        MatchingResults::from_outcomes(outcomes)
    }

    /// Build plane matches for planar keypoints.
    pub fn match_planes(
        &self,
        reference: &KdTreeCloud,
        solver_points: &[(Vector3<f64>, f64)],
        query_points: &[Vector3<f64>],
    ) -> MatchingResults {
        let outcomes: Vec<_> = solver_points
            .par_iter()
            .zip(query_points.par_iter())
            .map(|(&(raw, time), query)| self.build_plane_match(reference, raw, time, query))
            .collect();
        MatchingResults::from_outcomes(outcomes)
    }

    /// Build full-covariance matches for blob keypoints.
    pub fn match_blobs(
        &self,
        reference: &KdTreeCloud,
        solver_points: &[(Vector3<f64>, f64)],
        query_points: &[Vector3<f64>],
    ) -> MatchingResults {
        let outcomes: Vec<_> = solver_points
            .par_iter()
            .zip(query_points.par_iter())
            .map(|(&(raw, time), query)| self.build_blob_match(reference, raw, time, query))
            .collect();
        MatchingResults::from_outcomes(outcomes)
    }

    /// Gather the neighborhood of `query`, enforcing count and distance.
    fn neighborhood(
        &self,
        reference: &KdTreeCloud,
        query: &Vector3<f64>,
        k: usize,
        min_required: usize,
    ) -> Result<Vec<Vector3<f64>>, MatchStatus> {
        let neighbors = reference.nearest_n(query, k);
        if neighbors.len() < min_required {
            return Err(MatchStatus::NotEnoughNeighbors);
        }
        let max_sq = self.max_matching_distance * self.max_matching_distance;
        if neighbors.last().map(|&(_, d)| d > max_sq).unwrap_or(true) {
            return Err(MatchStatus::NeighborsTooFar);
        }
        Ok(neighbors
            .iter()
            .map(|&(i, _)| *reference.point(i))
            .collect())
    }

    fn build_line_match(
        &self,
        reference: &KdTreeCloud,
        raw: Vector3<f64>,
        time: f64,
        query: &Vector3<f64>,
    ) -> Result<KeypointMatch, MatchStatus> {
        let neighbors = self.neighborhood(
            reference,
            query,
            self.config.line_distance_nb_neighbors,
            self.config.minimum_line_neighbor_rejection,
        )?;
        let (mean, cov) = mean_and_covariance(&neighbors);
        let (vals, vecs) = sorted_eigen(&cov);
        if !vals.iter().all(|v| v.is_finite()) {
            return Err(MatchStatus::InvalidNumerical);
        }
        if vals[0] < self.config.line_distance_factor * vals[1] {
            return Err(MatchStatus::BadPcaStructure);
        }
        let direction = vecs[0];
        // Projector orthogonal to the line direction; it is its own
        // square root.
        let sqrt_weight = Matrix3::identity() - direction * direction.transpose();
        let residual = sqrt_weight * (query - mean);
        if !residual.iter().all(|v| v.is_finite()) {
            return Err(MatchStatus::InvalidNumerical);
        }
        if residual.norm() > self.config.max_line_distance {
            return Err(MatchStatus::MseTooLarge);
        }
        Ok(KeypointMatch {
            point: raw,
            time,
            target: mean,
            sqrt_weight,
        })
    }

    fn build_plane_match(
        &self,
        reference: &KdTreeCloud,
        raw: Vector3<f64>,
        time: f64,
        query: &Vector3<f64>,
    ) -> Result<KeypointMatch, MatchStatus> {
        let k = self.config.plane_distance_nb_neighbors;
        let neighbors = self.neighborhood(reference, query, k, k)?;
        let (mean, cov) = mean_and_covariance(&neighbors);
        let (vals, vecs) = sorted_eigen(&cov);
        if !vals.iter().all(|v| v.is_finite()) {
            return Err(MatchStatus::InvalidNumerical);
        }
        // Planar when the smallest spread collapses and the patch is not
        // degenerate along a single direction.
        let floor = 1e-10;
        if vals[2] > (vals[1] / self.config.plane_distance_factor1).max(floor)
            || vals[0] > self.config.plane_distance_factor2 * vals[1].max(floor)
        {
            return Err(MatchStatus::BadPcaStructure);
        }
        let normal = vecs[2];
        // Rank-one projector onto the normal; idempotent, so also its own
        // square root.
        let sqrt_weight = normal * normal.transpose();
        let residual = normal.dot(&(query - mean));
        if !residual.is_finite() {
            return Err(MatchStatus::InvalidNumerical);
        }
        if residual.abs() > self.config.max_plane_distance {
            return Err(MatchStatus::MseTooLarge);
        }
        Ok(KeypointMatch {
            point: raw,
            time,
            target: mean,
            sqrt_weight,
        })
    }

    fn build_blob_match(
        &self,
        reference: &KdTreeCloud,
        raw: Vector3<f64>,
        time: f64,
        query: &Vector3<f64>,
    ) -> Result<KeypointMatch, MatchStatus> {
        let neighbors =
            self.neighborhood(reference, query, self.config.blob_distance_nb_neighbors, 4)?;
        let (mean, cov) = mean_and_covariance(&neighbors);
        let (vals, vecs) = sorted_eigen(&cov);
        if !vals.iter().all(|v| v.is_finite() && *v >= -1e-12) {
            return Err(MatchStatus::InvalidNumerical);
        }
        // Normalized Mahalanobis weight: directions of small spread weigh
        // up to 1, directions of large spread are discounted.
        let eps = 1e-6;
        let w = [
            ((vals[2] + eps) / (vals[0] + eps)).sqrt(),
            ((vals[2] + eps) / (vals[1] + eps)).sqrt(),
            1.0,
        ];
        let mut sqrt_weight = Matrix3::zeros();
        for (axis, &weight) in vecs.iter().zip(w.iter()) {
            sqrt_weight += (*axis * axis.transpose()) * weight;
        }
        if !sqrt_weight.iter().all(|v| v.is_finite()) {
            return Err(MatchStatus::InvalidNumerical);
        }
        Ok(KeypointMatch {
            point: raw,
            time,
            target: mean,
            sqrt_weight,
        })
    }
}
