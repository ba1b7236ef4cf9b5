//! Mathematical primitives shared across the SLAM pipeline.
//!
//! Conventions:
//! - Rotations exposed at API boundaries are intrinsic ZYX Tait-Bryan angles
//!   `(rx, ry, rz)` = (roll, pitch, yaw), i.e. `R = Rz(rz) * Ry(ry) * Rx(rx)`.
//! - Eigen decompositions of 3x3 covariances are returned sorted by
//!   decreasing eigenvalue.

use nalgebra::{Isometry3, Matrix3, Translation3, UnitQuaternion, Vector3};

/// Build a rigid transform from a translation and Tait-Bryan angles.
pub fn isometry_from_xyz_rpy(x: f64, y: f64, z: f64, rx: f64, ry: f64, rz: f64) -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::new(x, y, z),
        UnitQuaternion::from_euler_angles(rx, ry, rz),
    )
}

/// Extract `(x, y, z, rx, ry, rz)` from a rigid transform.
pub fn xyz_rpy_from_isometry(iso: &Isometry3<f64>) -> (f64, f64, f64, f64, f64, f64) {
    let t = iso.translation.vector;
    let (rx, ry, rz) = iso.rotation.euler_angles();
    (t.x, t.y, t.z, rx, ry, rz)
}

/// Apply a rigid transform to a position vector.
#[inline]
pub fn transform_vector(iso: &Isometry3<f64>, v: &Vector3<f64>) -> Vector3<f64> {
    iso.rotation * v + iso.translation.vector
}

/// Rotation angle (radians) between two rigid transforms.
pub fn angular_distance(a: &Isometry3<f64>, b: &Isometry3<f64>) -> f64 {
    (a.rotation.inverse() * b.rotation).angle()
}

/// Translation distance (meters) between two rigid transforms.
pub fn translation_distance(a: &Isometry3<f64>, b: &Isometry3<f64>) -> f64 {
    (a.translation.vector - b.translation.vector).norm()
}

/// Scale a rigid transform by `s` on the SE(3) tangent: rotation angle and
/// translation are both multiplied by `s`. `s` may lie outside `[0, 1]`
/// (extrapolation).
pub fn scale_isometry(iso: &Isometry3<f64>, s: f64) -> Isometry3<f64> {
    let axis = iso.rotation.scaled_axis() * s;
    Isometry3::from_parts(
        Translation3::from(iso.translation.vector * s),
        UnitQuaternion::from_scaled_axis(axis),
    )
}

/// Symmetric eigen decomposition of a 3x3 covariance, sorted by decreasing
/// eigenvalue. Returns `(eigenvalues, eigenvectors)` with `eigenvalues[0]`
/// the largest and `eigenvectors[i]` the corresponding unit vector.
pub fn sorted_eigen(cov: &Matrix3<f64>) -> ([f64; 3], [Vector3<f64>; 3]) {
    let eigen = nalgebra::SymmetricEigen::new(*cov);
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let vals = [
        eigen.eigenvalues[order[0]],
        eigen.eigenvalues[order[1]],
        eigen.eigenvalues[order[2]],
    ];
    let vecs = [
        eigen.eigenvectors.column(order[0]).into_owned(),
        eigen.eigenvectors.column(order[1]).into_owned(),
        eigen.eigenvectors.column(order[2]).into_owned(),
    ];
    (vals, vecs)
}

/// Mean and covariance of a set of 3D positions.
pub fn mean_and_covariance(points: &[Vector3<f64>]) -> (Vector3<f64>, Matrix3<f64>) {
    let n = points.len().max(1) as f64;
    let mean = points.iter().sum::<Vector3<f64>>() / n;
    let mut cov = Matrix3::zeros();
    for p in points {
        let d = p - mean;
        cov += d * d.transpose();
    }
    (mean, cov / n)
}

/// Partial derivatives of `R = Rz(rz) * Ry(ry) * Rx(rx)` with respect to
/// each angle, evaluated at `(rx, ry, rz)`. Returned in `[d/drx, d/dry,
/// d/drz]` order.
pub fn rotation_derivatives(rx: f64, ry: f64, rz: f64) -> [Matrix3<f64>; 3] {
    let (sx, cx) = rx.sin_cos();
    let (sy, cy) = ry.sin_cos();
    let (sz, cz) = rz.sin_cos();

    let r_x = Matrix3::new(1.0, 0.0, 0.0, 0.0, cx, -sx, 0.0, sx, cx);
    let r_y = Matrix3::new(cy, 0.0, sy, 0.0, 1.0, 0.0, -sy, 0.0, cy);
    let r_z = Matrix3::new(cz, -sz, 0.0, sz, cz, 0.0, 0.0, 0.0, 1.0);

    let d_x = Matrix3::new(0.0, 0.0, 0.0, 0.0, -sx, -cx, 0.0, cx, -sx);
    let d_y = Matrix3::new(-sy, 0.0, cy, 0.0, 0.0, 0.0, -cy, 0.0, -sy);
    let d_z = Matrix3::new(-sz, -cz, 0.0, cz, -sz, 0.0, 0.0, 0.0, 0.0);

    [r_z * r_y * d_x, r_z * d_y * r_x, d_z * r_y * r_x]
}
