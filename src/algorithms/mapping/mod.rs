//! Feature map storage.
//!
//! One [`RollingGrid`] per keypoint kind accumulates WORLD-frame keypoints
//! inside a bounded voxel window that slides with the sensor.

mod rolling_grid;

pub use rolling_grid::{RollingGrid, RollingGridConfig};
