//! Keypoint matching and pose optimization.
//!
//! Registration alternates two phases, ICP-style:
//!
//! 1. **Match building** ([`registration`]): every current keypoint is
//!    associated with a geometric feature (line, plane, or generic blob)
//!    fitted by PCA over its nearest neighbors in a reference set — the
//!    previous frame's keypoints (ego-motion) or the rolling feature maps
//!    (localization). Each accepted match carries a 3x3 quadratic-form
//!    weight; rejected keypoints are tallied by cause.
//! 2. **Solve** ([`optimizer`]): the aggregated weighted residuals are
//!    minimized over SE(3) (or SE(3) x SE(3) for within-frame motion) by
//!    Levenberg-Marquardt with a saturating arctan loss.

mod kdtree;
mod optimizer;
mod registration;

pub use kdtree::KdTreeCloud;
pub use optimizer::{optimize_interpolated_pose, optimize_single_pose, SolverOutput};
pub use registration::{
    KeypointMatch, KeypointsRegistration, MatchStatus, MatchingResults, RegistrationConfig,
};
