//! Core algorithms layer.
//!
//! # Contents
//!
//! - [`extraction`]: per-scan-line curvature keypoint extraction
//! - [`matching`]: keypoint-to-feature matching and robust pose optimization
//! - [`mapping`]: rolling voxel-grid feature maps

pub mod extraction;
pub mod mapping;
pub mod matching;
