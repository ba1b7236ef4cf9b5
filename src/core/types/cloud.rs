//! Point cloud container with sweep metadata.

use nalgebra::Isometry3;

use super::LidarPoint;

/// An ordered sequence of LiDAR points plus sweep metadata.
///
/// `timestamp_us` is the sweep-end time in microseconds since epoch.
/// `frame_id` names the coordinate frame the points are expressed in.
#[derive(Clone, Debug, Default)]
pub struct PointCloud {
    /// Points in measurement order.
    pub points: Vec<LidarPoint>,
    /// Sweep-end timestamp, microseconds since epoch.
    pub timestamp_us: u64,
    /// Coordinate frame of the points.
    pub frame_id: String,
}

impl PointCloud {
    /// Create an empty cloud with the given metadata.
    pub fn new(timestamp_us: u64, frame_id: impl Into<String>) -> Self {
        Self {
            points: Vec::new(),
            timestamp_us,
            frame_id: frame_id.into(),
        }
    }

    /// Create a cloud from points and metadata.
    pub fn from_points(
        points: Vec<LidarPoint>,
        timestamp_us: u64,
        frame_id: impl Into<String>,
    ) -> Self {
        Self {
            points,
            timestamp_us,
            frame_id: frame_id.into(),
        }
    }

    /// Number of points.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when the cloud holds no points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Sweep-end time in seconds since epoch.
    #[inline]
    pub fn time_s(&self) -> f64 {
        self.timestamp_us as f64 * 1e-6
    }

    /// Append a point.
    #[inline]
    pub fn push(&mut self, p: LidarPoint) {
        self.points.push(p);
    }

    /// New cloud with every position rigidly transformed and a new frame id.
    pub fn transformed(&self, iso: &Isometry3<f64>, frame_id: impl Into<String>) -> Self {
        Self {
            points: self.points.iter().map(|p| p.transformed(iso)).collect(),
            timestamp_us: self.timestamp_us,
            frame_id: frame_id.into(),
        }
    }
}
