//! Core data types for the SLAM pipeline.
//!
//! Coordinate frames:
//! - **LIDAR** {L}: sensor origin, frame of incoming point clouds
//! - **BASE** {B}: tracked body; equals LIDAR when no offset is configured
//! - **WORLD** {W}: fixed frame, coincides with BASE at the first sweep

mod cloud;
mod keypoint;
mod point;
mod transform;

pub use cloud::PointCloud;
pub use keypoint::{Keypoint, KeypointLabel};
pub use point::LidarPoint;
pub use transform::{Covariance6, Transform};
