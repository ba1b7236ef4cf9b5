//! Keypoint extraction.
//!
//! Extraction partitions a raw sweep into edge, planar and blob keypoints
//! plus an invalid remainder. The orchestrator only depends on the
//! [`KeypointExtractor`] trait, so other sensor geometries (e.g. a
//! solid-state scan pattern) can plug in without touching the pipeline.

mod spinning;

pub use spinning::{SpinningExtractorConfig, SpinningSensorKeypointExtractor};

use crate::core::types::{KeypointLabel, PointCloud};

/// Output of one extraction pass. All clouds are in the input (sensor)
/// frame and share the input cloud's metadata.
#[derive(Clone, Debug, Default)]
pub struct ExtractedKeypoints {
    /// Edge keypoints (sharp per-line curvature).
    pub edges: PointCloud,
    /// Planar keypoints (flat per-line curvature).
    pub planars: PointCloud,
    /// Blob keypoints (generic remainder, decimated).
    pub blobs: PointCloud,
    /// One label per input point, in input order.
    pub labels: Vec<KeypointLabel>,
    /// Per-input-point curvature (0 where not computed).
    pub curvature: Vec<f64>,
}

impl ExtractedKeypoints {
    /// Total number of emitted keypoints.
    pub fn total_keypoints(&self) -> usize {
        self.edges.len() + self.planars.len() + self.blobs.len()
    }
}

/// Capability set of a keypoint extractor.
pub trait KeypointExtractor: Send + Sync {
    /// Classify every point of `cloud` and return the keypoint sets.
    fn extract(&self, cloud: &PointCloud) -> ExtractedKeypoints;
}
