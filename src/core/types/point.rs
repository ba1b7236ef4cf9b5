//! Single LiDAR return.

use nalgebra::{Isometry3, Vector3};

/// One point of a spinning LiDAR sweep.
///
/// `time` is the acquisition time in seconds relative to the sweep start
/// (0 at sweep start). Points arrive in measurement order, not laser-id
/// order.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LidarPoint {
    /// X coordinate in meters.
    pub x: f64,
    /// Y coordinate in meters.
    pub y: f64,
    /// Z coordinate in meters.
    pub z: f64,
    /// Return intensity, sensor units.
    pub intensity: f32,
    /// Laser ring index.
    pub laser_id: u8,
    /// Seconds since sweep start.
    pub time: f64,
}

impl LidarPoint {
    /// Create a point with zero intensity/time on laser 0.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            ..Default::default()
        }
    }

    /// Position as a vector.
    #[inline]
    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    /// Distance to the sensor origin of the frame the point lives in.
    #[inline]
    pub fn range(&self) -> f64 {
        self.position().norm()
    }

    /// Same point with a different position, keeping all attributes.
    #[inline]
    pub fn with_position(&self, p: Vector3<f64>) -> Self {
        Self {
            x: p.x,
            y: p.y,
            z: p.z,
            ..*self
        }
    }

    /// Apply a rigid transform to the position, keeping attributes.
    #[inline]
    pub fn transformed(&self, iso: &Isometry3<f64>) -> Self {
        self.with_position(crate::core::math::transform_vector(iso, &self.position()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::math::isometry_from_xyz_rpy;

    #[test]
    fn test_range() {
        let p = LidarPoint::new(3.0, 4.0, 0.0);
        assert!((p.range() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_transformed_keeps_attributes() {
        let p = LidarPoint {
            x: 1.0,
            y: 0.0,
            z: 0.0,
            intensity: 42.0,
            laser_id: 7,
            time: 0.05,
        };
        let iso = isometry_from_xyz_rpy(0.0, 2.0, 0.0, 0.0, 0.0, 0.0);
        let q = p.transformed(&iso);
        assert!((q.y - 2.0).abs() < 1e-12);
        assert_eq!(q.laser_id, 7);
        assert_eq!(q.intensity, 42.0);
    }
}
