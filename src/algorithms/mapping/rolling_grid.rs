//! Rolling voxel-grid feature map.
//!
//! A logical cube of `grid_size` voxels per side, each `voxel_resolution`
//! meters wide, centered near the sensor. Inserting keypoints appends them
//! to their voxel and downsamples the voxel content to a leaf grid of
//! `leaf_size` meters (centroid representatives). Re-centering the grid
//! evicts voxels that leave the window; eviction is permanent.
//!
//! Voxels are keyed in a `BTreeMap` so iteration (and everything built on
//! it, like per-frame KD-trees) is deterministic across runs.

use std::collections::BTreeMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::core::types::{LidarPoint, PointCloud};

/// Rolling grid parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RollingGridConfig {
    /// Voxels per side of the window.
    #[serde(default = "default_grid_size")]
    pub grid_size: usize,

    /// Voxel edge length in meters.
    #[serde(default = "default_voxel_resolution")]
    pub voxel_resolution: f64,

    /// Intra-voxel downsampling leaf size in meters.
    #[serde(default = "default_leaf_size")]
    pub leaf_size: f64,
}

fn default_grid_size() -> usize {
    50
}
fn default_voxel_resolution() -> f64 {
    10.0
}
fn default_leaf_size() -> f64 {
    0.3
}

impl Default for RollingGridConfig {
    fn default() -> Self {
        Self {
            grid_size: default_grid_size(),
            voxel_resolution: default_voxel_resolution(),
            leaf_size: default_leaf_size(),
        }
    }
}

type VoxelKey = (i64, i64, i64);

/// Bounded voxel map of WORLD-frame keypoints.
#[derive(Clone, Debug)]
pub struct RollingGrid {
    config: RollingGridConfig,
    /// Voxel coordinate of the window center.
    center: VoxelKey,
    voxels: BTreeMap<VoxelKey, Vec<LidarPoint>>,
}

impl RollingGrid {
    /// Create an empty grid centered at the origin.
    pub fn new(config: RollingGridConfig) -> Self {
        Self {
            config,
            center: (0, 0, 0),
            voxels: BTreeMap::new(),
        }
    }

    /// Grid parameters.
    pub fn config(&self) -> &RollingGridConfig {
        &self.config
    }

    /// Total number of stored points.
    pub fn len(&self) -> usize {
        self.voxels.values().map(Vec::len).sum()
    }

    /// True when the grid holds no points.
    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    /// Drop all points, keeping the center.
    pub fn clear(&mut self) {
        self.voxels.clear();
    }

    /// Voxel key of a position.
    fn key_of(&self, p: &Vector3<f64>) -> VoxelKey {
        let r = self.config.voxel_resolution;
        (
            (p.x / r).floor() as i64,
            (p.y / r).floor() as i64,
            (p.z / r).floor() as i64,
        )
    }

    /// Window bounds `[lo, hi]` (inclusive) on each axis for the current
    /// center.
    fn window(&self) -> (VoxelKey, VoxelKey) {
        let n = self.config.grid_size as i64;
        let half = n / 2;
        let lo = (
            self.center.0 - half,
            self.center.1 - half,
            self.center.2 - half,
        );
        let hi = (lo.0 + n - 1, lo.1 + n - 1, lo.2 + n - 1);
        (lo, hi)
    }

    fn in_window(&self, key: &VoxelKey) -> bool {
        let (lo, hi) = self.window();
        key.0 >= lo.0
            && key.0 <= hi.0
            && key.1 >= lo.1
            && key.1 <= hi.1
            && key.2 >= lo.2
            && key.2 <= hi.2
    }

    /// Re-center the window around `position`, evicting voxels that fall
    /// outside. Evicted points never reappear.
    pub fn roll(&mut self, position: &Vector3<f64>) {
        let new_center = self.key_of(position);
        if new_center == self.center && !self.voxels.is_empty() {
            return;
        }
        self.center = new_center;
        let (lo, hi) = self.window();
        self.voxels.retain(|k, _| {
            k.0 >= lo.0 && k.0 <= hi.0 && k.1 >= lo.1 && k.1 <= hi.1 && k.2 >= lo.2 && k.2 <= hi.2
        });
    }

    /// Insert points, skipping any that fall outside the current window,
    /// then downsample the touched voxels to the leaf grid.
    pub fn add(&mut self, points: &[LidarPoint]) {
        let mut touched: Vec<VoxelKey> = Vec::new();
        for p in points {
            let key = self.key_of(&p.position());
            if !self.in_window(&key) {
                continue;
            }
            self.voxels.entry(key).or_default().push(*p);
            if !touched.contains(&key) {
                touched.push(key);
            }
        }
        for key in touched {
            if let Some(bucket) = self.voxels.get_mut(&key) {
                *bucket = leaf_downsample(bucket, self.config.leaf_size);
            }
        }
    }

    /// All stored points, in deterministic voxel order.
    pub fn all_points(&self) -> Vec<LidarPoint> {
        let mut out = Vec::with_capacity(self.len());
        for bucket in self.voxels.values() {
            out.extend_from_slice(bucket);
        }
        out
    }

    /// All stored points as a cloud with the given metadata.
    pub fn as_cloud(&self, timestamp_us: u64, frame_id: impl Into<String>) -> PointCloud {
        PointCloud::from_points(self.all_points(), timestamp_us, frame_id)
    }

    /// All points within `radius` of `center`, scanning only the voxels
    /// overlapping the query ball.
    pub fn points_within_radius(&self, center: &Vector3<f64>, radius: f64) -> Vec<LidarPoint> {
        let r = self.config.voxel_resolution;
        let lo = self.key_of(&Vector3::new(center.x - radius, center.y - radius, center.z - radius));
        let hi = self.key_of(&Vector3::new(center.x + radius, center.y + radius, center.z + radius));
        let sq = radius * radius;
        let mut out = Vec::new();
        for kx in lo.0..=hi.0 {
            for ky in lo.1..=hi.1 {
                for kz in lo.2..=hi.2 {
                    if let Some(bucket) = self.voxels.get(&(kx, ky, kz)) {
                        for p in bucket {
                            if (p.position() - center).norm_squared() <= sq {
                                out.push(*p);
                            }
                        }
                    }
                }
            }
        }
        out
    }
}

/// Downsample a bucket to one centroid representative per leaf cell.
fn leaf_downsample(points: &[LidarPoint], leaf_size: f64) -> Vec<LidarPoint> {
    if leaf_size <= 0.0 {
        return points.to_vec();
    }
    let mut leaves: BTreeMap<(i64, i64, i64), (Vector3<f64>, f32, usize, LidarPoint)> =
        BTreeMap::new();
    for p in points {
        let key = (
            (p.x / leaf_size).floor() as i64,
            (p.y / leaf_size).floor() as i64,
            (p.z / leaf_size).floor() as i64,
        );
        let entry = leaves
            .entry(key)
            .or_insert((Vector3::zeros(), 0.0, 0, *p));
        entry.0 += p.position();
        entry.1 += p.intensity;
        entry.2 += 1;
    }
    leaves
        .into_values()
        .map(|(sum, intensity, count, first)| {
            let n = count as f64;
            let mut rep = first.with_position(sum / n);
            rep.intensity = intensity / count as f32;
            rep
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_grid() -> RollingGrid {
        RollingGrid::new(RollingGridConfig {
            grid_size: 10,
            voxel_resolution: 1.0,
            leaf_size: 0.2,
        })
    }

    fn point_at(x: f64, y: f64, z: f64) -> LidarPoint {
        LidarPoint::new(x, y, z)
    }

    #[test]
    fn test_add_and_query() {
        let mut grid = small_grid();
        grid.roll(&Vector3::zeros());
        grid.add(&[point_at(0.5, 0.5, 0.5), point_at(2.0, 0.0, 0.0)]);
        assert_eq!(grid.len(), 2);

        let near = grid.points_within_radius(&Vector3::new(0.5, 0.5, 0.5), 0.1);
        assert_eq!(near.len(), 1);
        let all = grid.points_within_radius(&Vector3::zeros(), 5.0);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_leaf_downsampling_merges_close_points() {
        let mut grid = small_grid();
        grid.roll(&Vector3::zeros());
        // Ten points inside one 0.2 m leaf collapse to one representative.
        let points: Vec<LidarPoint> = (0..10)
            .map(|i| point_at(0.50 + i as f64 * 0.005, 0.5, 0.5))
            .collect();
        grid.add(&points);
        assert_eq!(grid.len(), 1);
        let rep = grid.all_points()[0];
        assert!((rep.x - 0.5225).abs() < 1e-9);
    }

    #[test]
    fn test_points_outside_window_are_skipped() {
        let mut grid = small_grid();
        grid.roll(&Vector3::zeros());
        grid.add(&[point_at(100.0, 0.0, 0.0)]);
        assert!(grid.is_empty());
    }

    #[test]
    fn test_roll_evicts_left_behind_voxels() {
        let mut grid = small_grid();
        grid.roll(&Vector3::zeros());
        grid.add(&[point_at(0.5, 0.0, 0.0)]);

        // Drive twice the window size along +x, rolling as we go.
        let span = 2.0 * 10.0 * 1.0;
        let mut x = 0.0;
        while x < span {
            x += 0.5;
            grid.roll(&Vector3::new(x, 0.0, 0.0));
            grid.add(&[point_at(x, 0.0, 0.0)]);
        }

        let half_extent = 10.0 * 1.0 / 2.0;
        for p in grid.all_points() {
            assert!(
                p.x >= span - half_extent - 2.0,
                "stale point at x = {} survived eviction",
                p.x
            );
        }
        // The origin point is long gone.
        assert!(grid
            .points_within_radius(&Vector3::new(0.5, 0.0, 0.0), 1.0)
            .is_empty());
    }

    #[test]
    fn test_extent_bounded_by_window() {
        let mut grid = small_grid();
        grid.roll(&Vector3::zeros());
        let points: Vec<LidarPoint> = (-50..50)
            .map(|i| point_at(i as f64 * 0.3, 0.0, 0.0))
            .collect();
        grid.add(&points);
        let n_r = 10.0 * 1.0;
        for p in grid.all_points() {
            assert!(p.x.abs() <= n_r, "point at {} exceeds the window", p.x);
        }
    }

    #[test]
    fn test_clear() {
        let mut grid = small_grid();
        grid.roll(&Vector3::zeros());
        grid.add(&[point_at(0.5, 0.5, 0.5)]);
        grid.clear();
        assert!(grid.is_empty());
    }
}
