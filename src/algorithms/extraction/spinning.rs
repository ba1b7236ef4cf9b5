//! Curvature-based keypoint extractor for spinning multi-beam sensors.
//!
//! Each laser ring is processed independently, in measurement (azimuth)
//! order. Points at depth discontinuities or grazing incidence are
//! invalidated, a LOAM-style curvature is computed over a sliding window,
//! and the highest-curvature survivors become edge candidates while the
//! lowest become planar candidates. Candidates must pass a PCA shape test
//! on their window and a spatial exclusion rule before being emitted.
//! Remaining valid points are decimated into the blob class.

use nalgebra::Vector3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{ExtractedKeypoints, KeypointExtractor};
use crate::core::math::mean_and_covariance;
use crate::core::math::sorted_eigen;
use crate::core::types::{KeypointLabel, PointCloud};

/// Configuration of the spinning-sensor extractor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpinningExtractorConfig {
    /// Half-width of the per-line neighborhood window.
    ///
    /// Larger windows smooth the curvature estimate and yield fewer edges.
    #[serde(default = "default_neighborhood_size")]
    pub neighborhood_size: usize,

    /// Points closer to the sensor than this are dropped (meters).
    #[serde(default = "default_min_distance_to_sensor")]
    pub min_distance_to_sensor: f64,

    /// Depth ratio with an adjacent point above which a point is
    /// invalidated as occluded.
    #[serde(default = "default_depth_gap_ratio")]
    pub depth_gap_ratio: f64,

    /// Minimum sine of the bend angle between the two window half-segments
    /// for a point to qualify as an edge.
    #[serde(default = "default_edge_sin_angle_threshold")]
    pub edge_sin_angle_threshold: f64,

    /// Minimum sine of the incidence angle between the beam and the local
    /// line direction; below it the return is grazing and invalid.
    #[serde(default = "default_plane_sin_angle_threshold")]
    pub plane_sin_angle_threshold: f64,

    /// Edge keypoint budget per ring.
    #[serde(default = "default_max_edges_per_ring")]
    pub max_edges_per_ring: usize,

    /// Planar keypoint budget per ring.
    #[serde(default = "default_max_planars_per_ring")]
    pub max_planars_per_ring: usize,

    /// Edge window shape test: largest eigenvalue must exceed this factor
    /// times each of the other two.
    #[serde(default = "default_edge_pca_factor")]
    pub edge_pca_factor: f64,

    /// Planar window shape test: smallest eigenvalue times this factor must
    /// not exceed the middle one.
    #[serde(default = "default_plane_pca_factor")]
    pub plane_pca_factor: f64,

    /// No two keypoints of one class may lie within this many consecutive
    /// positions on a line.
    #[serde(default = "default_keypoint_exclusion_width")]
    pub keypoint_exclusion_width: usize,

    /// Keep every Nth remaining valid point as a blob keypoint.
    #[serde(default = "default_blob_decimation")]
    pub blob_decimation: usize,

    /// Optional laser-id to ring re-ordering, sorted by vertical angle.
    /// When empty, `laser_id` is used directly.
    #[serde(default)]
    pub laser_id_mapping: Vec<usize>,
}

fn default_neighborhood_size() -> usize {
    5
}
fn default_min_distance_to_sensor() -> f64 {
    3.0
}
fn default_depth_gap_ratio() -> f64 {
    1.15
}
fn default_edge_sin_angle_threshold() -> f64 {
    0.86
}
fn default_plane_sin_angle_threshold() -> f64 {
    0.5
}
fn default_max_edges_per_ring() -> usize {
    200
}
fn default_max_planars_per_ring() -> usize {
    400
}
fn default_edge_pca_factor() -> f64 {
    3.0
}
fn default_plane_pca_factor() -> f64 {
    9.0
}
fn default_keypoint_exclusion_width() -> usize {
    5
}
fn default_blob_decimation() -> usize {
    8
}

impl Default for SpinningExtractorConfig {
    fn default() -> Self {
        Self {
            neighborhood_size: default_neighborhood_size(),
            min_distance_to_sensor: default_min_distance_to_sensor(),
            depth_gap_ratio: default_depth_gap_ratio(),
            edge_sin_angle_threshold: default_edge_sin_angle_threshold(),
            plane_sin_angle_threshold: default_plane_sin_angle_threshold(),
            max_edges_per_ring: default_max_edges_per_ring(),
            max_planars_per_ring: default_max_planars_per_ring(),
            edge_pca_factor: default_edge_pca_factor(),
            plane_pca_factor: default_plane_pca_factor(),
            keypoint_exclusion_width: default_keypoint_exclusion_width(),
            blob_decimation: default_blob_decimation(),
            laser_id_mapping: Vec::new(),
        }
    }
}

/// Per-line extraction output, indices into the input cloud.
struct LineResult {
    labels: Vec<(usize, KeypointLabel)>,
    curvature: Vec<(usize, f64)>,
    edges: Vec<usize>,
    planars: Vec<usize>,
    blobs: Vec<usize>,
}

/// Spinning-sensor keypoint extractor.
pub struct SpinningSensorKeypointExtractor {
    config: SpinningExtractorConfig,
}

impl SpinningSensorKeypointExtractor {
    /// Create an extractor with the given configuration.
    pub fn new(config: SpinningExtractorConfig) -> Self {
        Self { config }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(SpinningExtractorConfig::default())
    }

    /// Get the configuration.
    pub fn config(&self) -> &SpinningExtractorConfig {
        &self.config
    }

    /// Ring index of a laser id, applying the optional vertical-angle
    /// mapping.
    fn ring_of(&self, laser_id: u8) -> usize {
        let id = laser_id as usize;
        match self.config.laser_id_mapping.get(id) {
            Some(&ring) => ring,
            None => id,
        }
    }

    /// Process one scan line. `line` holds input indices in azimuth order.
    fn process_line(&self, cloud: &PointCloud, line: &[usize], blobs_only: bool) -> LineResult {
        let nn = self.config.neighborhood_size;
        let n = line.len();
        let mut result = LineResult {
            labels: Vec::new(),
            curvature: Vec::new(),
            edges: Vec::new(),
            planars: Vec::new(),
            blobs: Vec::new(),
        };
        // Lines too short for the window are skipped silently.
        if n < 2 * nn + 1 {
            return result;
        }

        let positions: Vec<Vector3<f64>> =
            line.iter().map(|&i| cloud.points[i].position()).collect();
        let ranges: Vec<f64> = positions.iter().map(|p| p.norm()).collect();

        let mut valid = vec![false; n];
        let mut curvature = vec![0.0f64; n];

        for i in nn..n - nn {
            let r = ranges[i];
            if r < self.config.min_distance_to_sensor || r < 1e-9 {
                continue;
            }

            // Depth discontinuity with either adjacent point invalidates
            // the point (occlusion boundary, either side).
            let gap = self.config.depth_gap_ratio;
            let ratio = |a: f64, b: f64| {
                if a > b {
                    a / b.max(1e-9)
                } else {
                    b / a.max(1e-9)
                }
            };
            if ratio(r, ranges[i - 1]) > gap || ratio(r, ranges[i + 1]) > gap {
                continue;
            }

            // Grazing incidence: beam nearly parallel to the local line.
            let local_dir = positions[i + 1] - positions[i - 1];
            let local_norm = local_dir.norm();
            if local_norm < 1e-9 {
                continue;
            }
            let beam = positions[i] / r;
            let sin_incidence = beam.cross(&(local_dir / local_norm)).norm();
            if sin_incidence < self.config.plane_sin_angle_threshold {
                continue;
            }

            // LOAM curvature: displaced window sum, normalized by range.
            let mut sum = Vector3::zeros();
            for j in i - nn..=i + nn {
                sum += positions[j] - positions[i];
            }
            curvature[i] = sum.norm() / (2.0 * nn as f64 * r);
            valid[i] = true;
        }

        for i in nn..n - nn {
            if curvature[i] > 0.0 || valid[i] {
                result.curvature.push((line[i], curvature[i]));
            }
        }

        let mut labels = vec![KeypointLabel::Invalid; n];

        if !blobs_only {
            // Candidates ordered by curvature, index as deterministic
            // tie-break.
            let mut order: Vec<usize> = (nn..n - nn).filter(|&i| valid[i]).collect();
            order.sort_by(|&a, &b| {
                curvature[b]
                    .partial_cmp(&curvature[a])
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.cmp(&b))
            });

            let excl = self.config.keypoint_exclusion_width;
            let too_close = |picked: &[usize], i: usize| {
                picked
                    .iter()
                    .any(|&p| (p as i64 - i as i64).unsigned_abs() as usize <= excl)
            };

            // Edges: descending curvature.
            let mut picked_edges: Vec<usize> = Vec::new();
            for &i in &order {
                if picked_edges.len() >= self.config.max_edges_per_ring {
                    break;
                }
                if too_close(&picked_edges, i) {
                    continue;
                }
                let left = positions[i] - positions[i - nn];
                let right = positions[i + nn] - positions[i];
                let (ln, rn) = (left.norm(), right.norm());
                if ln < 1e-9 || rn < 1e-9 {
                    continue;
                }
                let sin_bend = (left / ln).cross(&(right / rn)).norm();
                if sin_bend < self.config.edge_sin_angle_threshold {
                    continue;
                }
                let (vals, _) = sorted_eigen(&window_covariance(&positions, i, nn));
                if vals[0] < self.config.edge_pca_factor * vals[1]
                    || vals[0] < self.config.edge_pca_factor * vals[2]
                {
                    continue;
                }
                picked_edges.push(i);
                labels[i] = KeypointLabel::Edge;
            }

            // Planars: ascending curvature.
            let mut picked_planars: Vec<usize> = Vec::new();
            for &i in order.iter().rev() {
                if picked_planars.len() >= self.config.max_planars_per_ring {
                    break;
                }
                if labels[i] != KeypointLabel::Invalid || too_close(&picked_planars, i) {
                    continue;
                }
                let (vals, _) = sorted_eigen(&window_covariance(&positions, i, nn));
                // Absolute floor keeps noise-free collinear windows valid.
                if vals[2] > (vals[1] / self.config.plane_pca_factor).max(1e-10) {
                    continue;
                }
                picked_planars.push(i);
                labels[i] = KeypointLabel::Planar;
            }
        }

        // Blobs: decimated remainder of the valid points.
        let mut kept = 0usize;
        for i in nn..n - nn {
            if valid[i] && labels[i] == KeypointLabel::Invalid {
                if kept % self.config.blob_decimation == 0 {
                    labels[i] = KeypointLabel::Blob;
                }
                kept += 1;
            }
        }

        for i in 0..n {
            match labels[i] {
                KeypointLabel::Edge => result.edges.push(line[i]),
                KeypointLabel::Planar => result.planars.push(line[i]),
                KeypointLabel::Blob => result.blobs.push(line[i]),
                KeypointLabel::Invalid => {}
            }
            if labels[i] != KeypointLabel::Invalid {
                result.labels.push((line[i], labels[i]));
            }
        }
        result
    }
}

/// Covariance of the window `[i - nn, i + nn]` on a line.
fn window_covariance(positions: &[Vector3<f64>], i: usize, nn: usize) -> nalgebra::Matrix3<f64> {
    let window: Vec<Vector3<f64>> = positions[i - nn..=i + nn].to_vec();
    mean_and_covariance(&window).1
}

impl KeypointExtractor for SpinningSensorKeypointExtractor {
    fn extract(&self, cloud: &PointCloud) -> ExtractedKeypoints {
        let mut out = ExtractedKeypoints {
            edges: PointCloud::new(cloud.timestamp_us, cloud.frame_id.clone()),
            planars: PointCloud::new(cloud.timestamp_us, cloud.frame_id.clone()),
            blobs: PointCloud::new(cloud.timestamp_us, cloud.frame_id.clone()),
            labels: vec![KeypointLabel::Invalid; cloud.len()],
            curvature: vec![0.0; cloud.len()],
        };
        if cloud.is_empty() {
            return out;
        }

        // Group indices by ring, preserving measurement order within each.
        let mut rings: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, p) in cloud.points.iter().enumerate() {
            rings.entry(self.ring_of(p.laser_id)).or_default().push(i);
        }

        // A single scan line cannot disambiguate planes from lines across
        // rings; degrade to the generic blob class.
        let blobs_only = rings.len() < 2;

        let lines: Vec<&Vec<usize>> = rings.values().collect();
        let results: Vec<LineResult> = lines
            .par_iter()
            .map(|line| self.process_line(cloud, line, blobs_only))
            .collect();

        for r in results {
            for (i, label) in r.labels {
                out.labels[i] = label;
            }
            for (i, c) in r.curvature {
                out.curvature[i] = c;
            }
            for i in r.edges {
                out.edges.push(cloud.points[i]);
            }
            for i in r.planars {
                out.planars.push(cloud.points[i]);
            }
            for i in r.blobs {
                out.blobs.push(cloud.points[i]);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::LidarPoint;

    /// Two rings tracing the inside of a square room, centered on the
    /// sensor. Corners bend sharply (edges), walls are straight (planars).
    fn square_room_cloud(rings: &[f64]) -> PointCloud {
        let mut cloud = PointCloud::new(1_000_000, "lidar");
        let half = 8.0;
        for (ring, &z) in rings.iter().enumerate() {
            for step in 0..720 {
                let az = step as f64 * std::f64::consts::TAU / 720.0;
                let (s, c) = az.sin_cos();
                // Range to the square boundary along (c, s).
                let r = (half / c.abs().max(1e-9)).min(half / s.abs().max(1e-9));
                cloud.push(LidarPoint {
                    x: r * c,
                    y: r * s,
                    z,
                    intensity: 0.0,
                    laser_id: ring as u8,
                    time: step as f64 / 720.0 * 0.1,
                });
            }
        }
        cloud
    }

    #[test]
    fn test_empty_input_yields_empty_outputs() {
        let extractor = SpinningSensorKeypointExtractor::with_defaults();
        let out = extractor.extract(&PointCloud::new(0, "lidar"));
        assert_eq!(out.total_keypoints(), 0);
        assert!(out.labels.is_empty());
    }

    #[test]
    fn test_square_room_classification() {
        let extractor = SpinningSensorKeypointExtractor::with_defaults();
        let cloud = square_room_cloud(&[0.0, 0.5]);
        let out = extractor.extract(&cloud);

        assert!(!out.edges.is_empty(), "corners should yield edges");
        assert!(out.planars.len() > out.edges.len(), "walls dominate");
        assert_eq!(out.labels.len(), cloud.len());

        // Every edge keypoint lies near a corner diagonal (|x| ~ |y|).
        for p in &out.edges.points {
            let bend = (p.x.abs() - p.y.abs()).abs();
            assert!(bend < 1.0, "edge at ({:.2}, {:.2}) is not a corner", p.x, p.y);
        }
    }

    #[test]
    fn test_single_laser_yields_only_blobs() {
        let extractor = SpinningSensorKeypointExtractor::with_defaults();
        let cloud = square_room_cloud(&[0.0]);
        let out = extractor.extract(&cloud);
        assert!(out.edges.is_empty());
        assert!(out.planars.is_empty());
        assert!(!out.blobs.is_empty());
    }

    #[test]
    fn test_short_line_skipped() {
        let extractor = SpinningSensorKeypointExtractor::with_defaults();
        let mut cloud = PointCloud::new(0, "lidar");
        for i in 0..5 {
            cloud.push(LidarPoint {
                x: 5.0 + i as f64 * 0.01,
                y: 0.0,
                z: 0.0,
                intensity: 0.0,
                laser_id: 0,
                time: 0.0,
            });
        }
        let out = extractor.extract(&cloud);
        assert_eq!(out.total_keypoints(), 0);
        assert!(out.labels.iter().all(|l| !l.is_valid()));
    }

    #[test]
    fn test_min_distance_filter() {
        let config = SpinningExtractorConfig {
            min_distance_to_sensor: 20.0,
            ..Default::default()
        };
        let extractor = SpinningSensorKeypointExtractor::new(config);
        // Room boundary is at most ~11.3 m away, everything is too close.
        let out = extractor.extract(&square_room_cloud(&[0.0, 0.5]));
        assert_eq!(out.total_keypoints(), 0);
    }

    #[test]
    fn test_exclusion_spacing() {
        let extractor = SpinningSensorKeypointExtractor::with_defaults();
        let out = extractor.extract(&square_room_cloud(&[0.0, 0.5]));
        let excl = extractor.config().keypoint_exclusion_width;

        // Planar picks on one ring keep the configured spacing. Recover
        // per-ring positions from labels.
        let cloud = square_room_cloud(&[0.0, 0.5]);
        let ring0: Vec<usize> = (0..cloud.len())
            .filter(|&i| cloud.points[i].laser_id == 0)
            .collect();
        let planar_positions: Vec<usize> = ring0
            .iter()
            .enumerate()
            .filter(|(_, &i)| out.labels[i] == KeypointLabel::Planar)
            .map(|(pos, _)| pos)
            .collect();
        for w in planar_positions.windows(2) {
            assert!(w[1] - w[0] > excl);
        }
    }
}
