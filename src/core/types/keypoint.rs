//! Keypoint classification.

use serde::{Deserialize, Serialize};

/// Keypoint kind, used to key feature maps and match residual types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Keypoint {
    /// Sharp geometric discontinuity (high curvature along the scan line).
    Edge,
    /// Locally flat surface (low curvature along the scan line).
    Planar,
    /// Generic volumetric feature without a line/plane prior.
    Blob,
}

impl Keypoint {
    /// All keypoint kinds, in map order.
    pub const ALL: [Keypoint; 3] = [Keypoint::Edge, Keypoint::Planar, Keypoint::Blob];

    /// Display name used in logs and debug maps.
    pub fn name(&self) -> &'static str {
        match self {
            Keypoint::Edge => "edges",
            Keypoint::Planar => "planes",
            Keypoint::Blob => "blobs",
        }
    }
}

/// Per-point label assigned by the extractor. At most one label is emitted
/// per consumed input point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeypointLabel {
    /// Selected as an edge keypoint.
    Edge,
    /// Selected as a planar keypoint.
    Planar,
    /// Retained as a blob keypoint.
    Blob,
    /// Discarded (too close, occluded, grazing, not selected).
    #[default]
    Invalid,
}

impl KeypointLabel {
    /// Numeric code used in debug arrays (0 = invalid).
    pub fn as_debug_value(&self) -> f64 {
        match self {
            KeypointLabel::Invalid => 0.0,
            KeypointLabel::Edge => 1.0,
            KeypointLabel::Planar => 2.0,
            KeypointLabel::Blob => 3.0,
        }
    }

    /// True for any label other than `Invalid`.
    pub fn is_valid(&self) -> bool {
        !matches!(self, KeypointLabel::Invalid)
    }
}
