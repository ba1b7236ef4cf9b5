//! K-d tree over 3D point sets.
//!
//! Trees are rebuilt per frame over immutable snapshots (previous-frame
//! keypoints or the rolling-grid window) and discarded when the frame
//! completes; nothing in here is retained across frames.

use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::Vector3;

use crate::core::types::PointCloud;

/// A k-d tree paired with the positions it indexes.
pub struct KdTreeCloud {
    tree: KdTree<f64, 3>,
    points: Vec<Vector3<f64>>,
}

impl KdTreeCloud {
    /// Build from a point cloud.
    pub fn build(cloud: &PointCloud) -> Self {
        Self::from_points(cloud.points.iter().map(|p| p.position()).collect())
    }

    /// Build from raw positions.
    pub fn from_points(points: Vec<Vector3<f64>>) -> Self {
        let mut tree: KdTree<f64, 3> = KdTree::new();
        for (i, p) in points.iter().enumerate() {
            tree.add(&[p.x, p.y, p.z], i as u64);
        }
        Self { tree, points }
    }

    /// Number of indexed points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when no points are indexed.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Position of an indexed point.
    #[inline]
    pub fn point(&self, idx: usize) -> &Vector3<f64> {
        &self.points[idx]
    }

    /// The `k` nearest neighbors of `query`, as `(index, squared distance)`
    /// sorted by increasing distance. Returns fewer than `k` entries when
    /// the tree is smaller.
    pub fn nearest_n(&self, query: &Vector3<f64>, k: usize) -> Vec<(usize, f64)> {
        self.tree
            .nearest_n::<SquaredEuclidean>(&[query.x, query.y, query.z], k)
            .into_iter()
            .map(|n| (n.item as usize, n.distance))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_ordering() {
        let tree = KdTreeCloud::from_points(vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(5.0, 0.0, 0.0),
        ]);
        let nn = tree.nearest_n(&Vector3::new(0.9, 0.0, 0.0), 2);
        assert_eq!(nn.len(), 2);
        assert_eq!(nn[0].0, 1);
        assert_eq!(nn[1].0, 0);
        assert!(nn[0].1 < nn[1].1);
    }

    #[test]
    fn test_fewer_points_than_requested() {
        let tree = KdTreeCloud::from_points(vec![Vector3::new(1.0, 2.0, 3.0)]);
        let nn = tree.nearest_n(&Vector3::zeros(), 5);
        assert_eq!(nn.len(), 1);
    }
}
