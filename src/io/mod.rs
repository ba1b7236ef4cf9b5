//! Persistence.
//!
//! Feature maps are saved and restored as PCD v0.7 files; the
//! `binary_compressed` section uses the in-crate LZF codec, which is also
//! reused to pack keypoint logs when compressed logging storage is
//! selected.

pub mod lzf;
pub mod pcd;

pub use pcd::{load_pcd, save_pcd, PcdFormat};
