//! Within-frame motion model.
//!
//! A spinning sensor acquires each sweep over a full rotation, so every
//! point is measured at a slightly different pose. The motion inside a
//! sweep is modeled as constant velocity and angular velocity between two
//! stamped endpoint poses; the pose at any point time is recovered by
//! linear interpolation (translation LERP, rotation SLERP). Times outside
//! the endpoint interval extrapolate linearly, which also serves motion
//! extrapolation between sweeps.

use nalgebra::{Isometry3, Translation3, UnitQuaternion};

/// Linear interpolator between two stamped rigid transforms.
#[derive(Clone, Debug)]
pub struct LinearTransformInterpolator {
    t0: f64,
    t1: f64,
    h0: Isometry3<f64>,
    h1: Isometry3<f64>,
}

impl Default for LinearTransformInterpolator {
    fn default() -> Self {
        Self::identity()
    }
}

impl LinearTransformInterpolator {
    /// Interpolator pinned at identity for all times.
    pub fn identity() -> Self {
        Self {
            t0: 0.0,
            t1: 1.0,
            h0: Isometry3::identity(),
            h1: Isometry3::identity(),
        }
    }

    /// Create from two stamped endpoint poses.
    pub fn new(h0: Isometry3<f64>, t0: f64, h1: Isometry3<f64>, t1: f64) -> Self {
        Self { t0, t1, h0, h1 }
    }

    /// Replace both endpoints.
    pub fn set_endpoints(&mut self, h0: Isometry3<f64>, t0: f64, h1: Isometry3<f64>, t1: f64) {
        self.h0 = h0;
        self.t0 = t0;
        self.h1 = h1;
        self.t1 = t1;
    }

    /// Pose at the start endpoint.
    pub fn begin(&self) -> &Isometry3<f64> {
        &self.h0
    }

    /// Pose at the end endpoint.
    pub fn end(&self) -> &Isometry3<f64> {
        &self.h1
    }

    /// Pose at time `t`. Inside `[t0, t1]` this interpolates; outside it
    /// extrapolates along the same constant-velocity screw.
    pub fn at(&self, t: f64) -> Isometry3<f64> {
        let span = self.t1 - self.t0;
        let s = if span.abs() < 1e-12 {
            1.0
        } else {
            (t - self.t0) / span
        };
        self.at_fraction(s)
    }

    /// Pose at normalized fraction `s` (0 = begin, 1 = end, unclamped).
    pub fn at_fraction(&self, s: f64) -> Isometry3<f64> {
        let delta = self.h0.inverse() * self.h1;
        let axis = delta.rotation.scaled_axis() * s;
        let partial = Isometry3::from_parts(
            Translation3::from(delta.translation.vector * s),
            UnitQuaternion::from_scaled_axis(axis),
        );
        self.h0 * partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::math::{isometry_from_xyz_rpy, xyz_rpy_from_isometry};

    #[test]
    fn test_endpoints_are_exact() {
        let h0 = isometry_from_xyz_rpy(0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        let h1 = isometry_from_xyz_rpy(2.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let interp = LinearTransformInterpolator::new(h0, 0.0, h1, 1.0);
        assert!((interp.at(0.0).translation.vector.x).abs() < 1e-12);
        assert!((interp.at(1.0).translation.vector.x - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_midpoint_rotation() {
        let h0 = Isometry3::identity();
        let h1 = isometry_from_xyz_rpy(1.0, 0.0, 0.0, 0.0, 0.0, 0.8);
        let interp = LinearTransformInterpolator::new(h0, 10.0, h1, 12.0);
        let mid = interp.at(11.0);
        let (x, _, _, _, _, rz) = xyz_rpy_from_isometry(&mid);
        assert!((x - 0.5).abs() < 1e-9);
        assert!((rz - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_extrapolation_beyond_end() {
        let h0 = Isometry3::identity();
        let h1 = isometry_from_xyz_rpy(1.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        let interp = LinearTransformInterpolator::new(h0, 0.0, h1, 1.0);
        let two = interp.at(2.0);
        assert!((two.translation.vector.x - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_interval_returns_end() {
        let h1 = isometry_from_xyz_rpy(3.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        let interp = LinearTransformInterpolator::new(Isometry3::identity(), 5.0, h1, 5.0);
        assert!((interp.at(5.0).translation.vector.x - 3.0).abs() < 1e-12);
    }
}
