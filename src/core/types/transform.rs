//! Stamped rigid transforms and pose covariance.

use nalgebra::Isometry3;

use crate::core::math;

/// Row-major 6x6 pose covariance, DoF order X, Y, Z, rX, rY, rZ.
pub type Covariance6 = [f64; 36];

/// A stamped rigid 6-DoF transform between two named frames.
///
/// Stored as an isometry; Tait-Bryan angles are derived at the boundary.
#[derive(Clone, Debug, PartialEq)]
pub struct Transform {
    /// Pose of `child_frame_id` expressed in `frame_id`.
    pub isometry: Isometry3<f64>,
    /// Time in seconds since epoch.
    pub time: f64,
    /// Parent frame (e.g. WORLD).
    pub frame_id: String,
    /// Child frame (e.g. BASE).
    pub child_frame_id: String,
}

impl Transform {
    /// Create a stamped transform.
    pub fn new(
        isometry: Isometry3<f64>,
        time: f64,
        frame_id: impl Into<String>,
        child_frame_id: impl Into<String>,
    ) -> Self {
        Self {
            isometry,
            time,
            frame_id: frame_id.into(),
            child_frame_id: child_frame_id.into(),
        }
    }

    /// Build from `(x, y, z, rx, ry, rz)` coordinates.
    #[allow(clippy::too_many_arguments)]
    pub fn from_xyz_rpy(
        x: f64,
        y: f64,
        z: f64,
        rx: f64,
        ry: f64,
        rz: f64,
        time: f64,
        frame_id: impl Into<String>,
        child_frame_id: impl Into<String>,
    ) -> Self {
        Self::new(
            math::isometry_from_xyz_rpy(x, y, z, rx, ry, rz),
            time,
            frame_id,
            child_frame_id,
        )
    }

    /// Translation X in meters.
    pub fn x(&self) -> f64 {
        self.isometry.translation.vector.x
    }

    /// Translation Y in meters.
    pub fn y(&self) -> f64 {
        self.isometry.translation.vector.y
    }

    /// Translation Z in meters.
    pub fn z(&self) -> f64 {
        self.isometry.translation.vector.z
    }

    /// Roll angle in radians.
    pub fn rx(&self) -> f64 {
        self.isometry.rotation.euler_angles().0
    }

    /// Pitch angle in radians.
    pub fn ry(&self) -> f64 {
        self.isometry.rotation.euler_angles().1
    }

    /// Yaw angle in radians.
    pub fn rz(&self) -> f64 {
        self.isometry.rotation.euler_angles().2
    }
}
