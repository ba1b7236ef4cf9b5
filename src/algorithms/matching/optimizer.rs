//! Robust non-linear least squares over SE(3) and SE(3) x SE(3).
//!
//! Minimizes `sum rho(|sqrtA * (H(t_i) * X_i - P_i)|^2)` where `rho` is the
//! saturating arctan loss `rho(q) = s * atan(q / s)` and `H(t)` is either a
//! single end-of-sweep pose or the within-sweep interpolation between a
//! begin and an end pose. Solved by iteratively reweighted Gauss-Newton
//! with adaptive Levenberg-Marquardt damping and step acceptance.
//!
//! The pose parameter vector is ordered `(tx, ty, tz, rx, ry, rz)` so the
//! reported covariance directly matches the X, Y, Z, rX, rY, rZ DoF order.

use nalgebra::{DMatrix, DVector, Isometry3, Matrix6, Vector3};

use super::registration::KeypointMatch;
use crate::core::math::{isometry_from_xyz_rpy, rotation_derivatives, xyz_rpy_from_isometry};
use crate::core::motion::LinearTransformInterpolator;

/// Inner LM convergence threshold on the translation step (meters).
const STEP_EPS_TRANS: f64 = 1e-6;
/// Inner LM convergence threshold on the rotation step (radians).
const STEP_EPS_ROT: f64 = 1e-7;

/// Result of one optimization run.
#[derive(Clone, Debug)]
pub struct SolverOutput {
    /// Optimized end-of-sweep pose.
    pub pose: Isometry3<f64>,
    /// Optimized begin-of-sweep pose, when jointly optimized.
    pub begin_pose: Option<Isometry3<f64>>,
    /// Whether the step criterion was met before the iteration cap.
    pub converged: bool,
    /// Whether all numbers stayed finite and the system stayed solvable.
    pub valid: bool,
    /// Number of residuals used.
    pub nb_residuals: usize,
    /// Final robust cost.
    pub final_cost: f64,
    /// End-pose covariance, DoF order X, Y, Z, rX, rY, rZ.
    pub covariance: Matrix6<f64>,
}

impl SolverOutput {
    fn invalid(init: &Isometry3<f64>, nb_residuals: usize) -> Self {
        Self {
            pose: *init,
            begin_pose: None,
            converged: false,
            valid: false,
            nb_residuals,
            final_cost: f64::INFINITY,
            covariance: Matrix6::identity() * 1e3,
        }
    }
}

/// Adaptive Levenberg-Marquardt damping controller.
///
/// Damping shrinks on good steps (gain ratio near 1) and grows on
/// rejected steps, with a stuck detector at the upper bound.
struct AdaptiveLm {
    damping: f64,
    growth: f64,
}

impl AdaptiveLm {
    const MIN: f64 = 1e-9;
    const MAX: f64 = 1e6;

    fn new() -> Self {
        Self {
            damping: 1e-4,
            growth: 2.0,
        }
    }

    fn damping(&self) -> f64 {
        self.damping
    }

    fn update(&mut self, rho: f64) {
        // Nielsen's rule: large gain ratio shrinks damping fast.
        let factor = (1.0 - (2.0 * rho - 1.0).powi(3)).max(1.0 / 3.0);
        self.damping = (self.damping * factor).max(Self::MIN);
        self.growth = 2.0;
    }

    fn reject_step(&mut self) {
        self.damping = (self.damping * self.growth).min(Self::MAX);
        self.growth *= 2.0;
    }

    fn is_stuck(&self) -> bool {
        self.damping >= Self::MAX
    }
}

/// Arctan robust loss on the squared residual: cost and IRLS weight.
#[inline]
fn robust_loss(sq_residual: f64, scale: f64) -> (f64, f64) {
    let cost = scale * (sq_residual / scale).atan();
    let t = sq_residual / scale;
    let weight = 1.0 / (1.0 + t * t);
    (cost, weight)
}

fn params_from_isometry(iso: &Isometry3<f64>) -> [f64; 6] {
    let (x, y, z, rx, ry, rz) = xyz_rpy_from_isometry(iso);
    [x, y, z, rx, ry, rz]
}

fn isometry_from_params(p: &[f64]) -> Isometry3<f64> {
    isometry_from_xyz_rpy(p[0], p[1], p[2], p[3], p[4], p[5])
}

/// Optimize a single end-of-sweep pose with analytic Jacobians.
pub fn optimize_single_pose(
    matches: &[KeypointMatch],
    init: &Isometry3<f64>,
    loss_scale: f64,
    lm_max_iter: usize,
) -> SolverOutput {
    let n = matches.len();
    if n == 0 {
        return SolverOutput::invalid(init, 0);
    }

    let mut p = params_from_isometry(init);
    let mut lm = AdaptiveLm::new();
    let mut converged = false;

    let mut current = match normal_equations_single(matches, &p, loss_scale) {
        Some(c) => c,
        None => return SolverOutput::invalid(init, n),
    };

    for _ in 0..lm_max_iter {
        let mut h = current.h.clone();
        let damping = lm.damping();
        for i in 0..6 {
            h[(i, i)] += damping * (1.0 + h[(i, i)]);
        }
        let delta = match h.cholesky() {
            Some(chol) => chol.solve(&(-&current.g)),
            None => {
                lm.reject_step();
                if lm.is_stuck() {
                    break;
                }
                continue;
            }
        };
        if !delta.iter().all(|d| d.is_finite()) {
            return SolverOutput::invalid(init, n);
        }

        let mut candidate = p;
        for i in 0..6 {
            candidate[i] += delta[i];
        }
        let cand = match normal_equations_single(matches, &candidate, loss_scale) {
            Some(c) => c,
            None => return SolverOutput::invalid(init, n),
        };

        let predicted = predicted_reduction(&current.h, &current.g, &delta);
        let actual = current.cost - cand.cost;
        if actual > 0.0 {
            p = candidate;
            current = cand;
            let rho = if predicted.abs() > 1e-12 {
                actual / predicted
            } else {
                1.0
            };
            lm.update(rho);

            let dt = (delta[0] * delta[0] + delta[1] * delta[1] + delta[2] * delta[2]).sqrt();
            let dr = (delta[3] * delta[3] + delta[4] * delta[4] + delta[5] * delta[5]).sqrt();
            if dt < STEP_EPS_TRANS && dr < STEP_EPS_ROT {
                converged = true;
                break;
            }
        } else {
            lm.reject_step();
            if lm.is_stuck() {
                break;
            }
        }
    }

    let covariance = match covariance_from_normal_equations(&current.h, current.weighted_sq, n) {
        Some(c) => c,
        None => return SolverOutput::invalid(&isometry_from_params(&p), n),
    };

    SolverOutput {
        pose: isometry_from_params(&p),
        begin_pose: None,
        converged,
        valid: true,
        nb_residuals: n,
        final_cost: current.cost,
        covariance,
    }
}

/// Jointly optimize begin and end poses; residuals interpolate the pose at
/// each match's normalized time. Jacobians are evaluated by central
/// differences.
pub fn optimize_interpolated_pose(
    matches: &[KeypointMatch],
    init_begin: &Isometry3<f64>,
    init_end: &Isometry3<f64>,
    loss_scale: f64,
    lm_max_iter: usize,
) -> SolverOutput {
    let n = matches.len();
    if n == 0 {
        return SolverOutput::invalid(init_end, 0);
    }

    let begin = params_from_isometry(init_begin);
    let end = params_from_isometry(init_end);
    let mut p: Vec<f64> = begin.iter().chain(end.iter()).copied().collect();

    let mut lm = AdaptiveLm::new();
    let mut converged = false;

    let mut current = match normal_equations_interpolated(matches, &p, loss_scale) {
        Some(c) => c,
        None => return SolverOutput::invalid(init_end, n),
    };

    for _ in 0..lm_max_iter {
        let mut h = current.h.clone();
        let damping = lm.damping();
        for i in 0..12 {
            h[(i, i)] += damping * (1.0 + h[(i, i)]);
        }
        let delta = match h.cholesky() {
            Some(chol) => chol.solve(&(-&current.g)),
            None => {
                lm.reject_step();
                if lm.is_stuck() {
                    break;
                }
                continue;
            }
        };
        if !delta.iter().all(|d| d.is_finite()) {
            return SolverOutput::invalid(init_end, n);
        }

        let candidate: Vec<f64> = p.iter().zip(delta.iter()).map(|(a, d)| a + d).collect();
        let cand = match normal_equations_interpolated(matches, &candidate, loss_scale) {
            Some(c) => c,
            None => return SolverOutput::invalid(init_end, n),
        };

        let predicted = predicted_reduction(&current.h, &current.g, &delta);
        let actual = current.cost - cand.cost;
        if actual > 0.0 {
            p = candidate;
            current = cand;
            let rho = if predicted.abs() > 1e-12 {
                actual / predicted
            } else {
                1.0
            };
            lm.update(rho);
            if delta.norm() < STEP_EPS_TRANS {
                converged = true;
                break;
            }
        } else {
            lm.reject_step();
            if lm.is_stuck() {
                break;
            }
        }
    }

    // End-pose covariance: lower-right block of the full inverse.
    let covariance = match full_covariance_block(&current.h, current.weighted_sq, n) {
        Some(c) => c,
        None => {
            let mut out = SolverOutput::invalid(&isometry_from_params(&p[6..12]), n);
            out.begin_pose = Some(isometry_from_params(&p[0..6]));
            return out;
        }
    };

    SolverOutput {
        pose: isometry_from_params(&p[6..12]),
        begin_pose: Some(isometry_from_params(&p[0..6])),
        converged,
        valid: true,
        nb_residuals: n,
        final_cost: current.cost,
        covariance,
    }
}

/// Accumulated normal equations at one parameter point.
struct NormalEquations {
    h: DMatrix<f64>,
    g: DVector<f64>,
    cost: f64,
    /// Robust-weighted sum of squared residuals, for the noise estimate.
    weighted_sq: f64,
}

fn normal_equations_single(
    matches: &[KeypointMatch],
    p: &[f64; 6],
    loss_scale: f64,
) -> Option<NormalEquations> {
    let iso = isometry_from_params(p);
    let rot = iso.rotation.to_rotation_matrix();
    let derivs = rotation_derivatives(p[3], p[4], p[5]);

    let mut h = DMatrix::zeros(6, 6);
    let mut g = DVector::zeros(6);
    let mut cost = 0.0;
    let mut weighted_sq = 0.0;

    for m in matches {
        let transformed = rot * m.point + Vector3::new(p[0], p[1], p[2]);
        let e = m.sqrt_weight * (transformed - m.target);
        let sq = e.norm_squared();
        if !sq.is_finite() {
            return None;
        }
        let (c, w) = robust_loss(sq, loss_scale);
        cost += c;
        weighted_sq += w * sq;

        // J = [sqrtA | sqrtA * dR/dangle * X]
        let mut j = [Vector3::zeros(); 6];
        for col in 0..3 {
            j[col] = m.sqrt_weight.column(col).into_owned();
        }
        for (col, d) in derivs.iter().enumerate() {
            j[3 + col] = m.sqrt_weight * (d * m.point);
        }
        for a in 0..6 {
            g[a] += w * j[a].dot(&e);
            for b in a..6 {
                let v = w * j[a].dot(&j[b]);
                h[(a, b)] += v;
                if a != b {
                    h[(b, a)] += v;
                }
            }
        }
    }
    Some(NormalEquations {
        h,
        g,
        cost,
        weighted_sq,
    })
}

fn interpolated_residual(m: &KeypointMatch, p: &[f64]) -> Vector3<f64> {
    let begin = isometry_from_params(&p[0..6]);
    let end = isometry_from_params(&p[6..12]);
    let interp = LinearTransformInterpolator::new(begin, 0.0, end, 1.0);
    let pose = interp.at_fraction(m.time.clamp(0.0, 1.0));
    m.sqrt_weight * (crate::core::math::transform_vector(&pose, &m.point) - m.target)
}

fn normal_equations_interpolated(
    matches: &[KeypointMatch],
    p: &[f64],
    loss_scale: f64,
) -> Option<NormalEquations> {
    let mut h = DMatrix::zeros(12, 12);
    let mut g = DVector::zeros(12);
    let mut cost = 0.0;
    let mut weighted_sq = 0.0;
    let step = 1e-6;

    let mut scratch = p.to_vec();
    for m in matches {
        let e = interpolated_residual(m, p);
        let sq = e.norm_squared();
        if !sq.is_finite() {
            return None;
        }
        let (c, w) = robust_loss(sq, loss_scale);
        cost += c;
        weighted_sq += w * sq;

        let mut j = [Vector3::zeros(); 12];
        for (col, jcol) in j.iter_mut().enumerate() {
            scratch[col] = p[col] + step;
            let plus = interpolated_residual(m, &scratch);
            scratch[col] = p[col] - step;
            let minus = interpolated_residual(m, &scratch);
            scratch[col] = p[col];
            *jcol = (plus - minus) / (2.0 * step);
        }
        for a in 0..12 {
            g[a] += w * j[a].dot(&e);
            for b in a..12 {
                let v = w * j[a].dot(&j[b]);
                h[(a, b)] += v;
                if a != b {
                    h[(b, a)] += v;
                }
            }
        }
    }
    Some(NormalEquations {
        h,
        g,
        cost,
        weighted_sq,
    })
}

fn predicted_reduction(h: &DMatrix<f64>, g: &DVector<f64>, delta: &DVector<f64>) -> f64 {
    (-g.dot(delta)) - 0.5 * delta.dot(&(h * delta))
}

/// Covariance of the 6-DoF solution from the (undamped) normal equations.
fn covariance_from_normal_equations(
    h: &DMatrix<f64>,
    weighted_sq: f64,
    nb_residuals: usize,
) -> Option<Matrix6<f64>> {
    let dof = (3 * nb_residuals).saturating_sub(6).max(1) as f64;
    let sigma2 = (weighted_sq / dof).max(1e-12);
    let inv = h.clone().cholesky()?.inverse();
    let mut cov = Matrix6::zeros();
    for i in 0..6 {
        for j in 0..6 {
            cov[(i, j)] = sigma2 * inv[(i, j)];
        }
    }
    // Symmetrize against round-off.
    Some((cov + cov.transpose()) * 0.5)
}

fn full_covariance_block(
    h: &DMatrix<f64>,
    weighted_sq: f64,
    nb_residuals: usize,
) -> Option<Matrix6<f64>> {
    let dof = (3 * nb_residuals).saturating_sub(12).max(1) as f64;
    let sigma2 = (weighted_sq / dof).max(1e-12);
    let inv = h.clone().cholesky()?.inverse();
    let mut cov = Matrix6::zeros();
    for i in 0..6 {
        for j in 0..6 {
            cov[(i, j)] = sigma2 * inv[(6 + i, 6 + j)];
        }
    }
    Some((cov + cov.transpose()) * 0.5)
}
