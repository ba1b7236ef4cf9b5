//! Map lifecycle scenarios: eviction, persistence, undistortion payoff,
//! FastSlam parity, and the pose-graph data boundary.

mod common;

use common::*;
use nalgebra::{Isometry3, Vector3};

use chakra_slam::{PcdFormat, PointCloud, Slam, UndistortionMode};

/// Driving twice the window size evicts everything near the start: the
/// rolling grids only retain geometry around the sensor.
#[test]
fn test_map_eviction_while_driving() {
    let world = corridor_world();
    let mut config = scenario_config();
    config.maps.grid_size = 10;
    config.maps.voxel_resolution = 1.0;
    let mut slam = Slam::new(config);

    // 2 * N * r = 20 m in half-meter steps.
    let steps = 40u64;
    for k in 0..=steps {
        let cloud = static_sweep(&world, &pose_x(k as f64 * 0.5), (k + 1) * 1_000_000);
        slam.add_frame(&cloud).unwrap();
    }

    let final_x = slam.world_transform().x();
    assert!(final_x > 18.0, "did not reach the corridor end: {final_x}");

    let window_half = 10.0 * 1.0 / 2.0;
    for map in [slam.edges_map(), slam.planars_map(), slam.blobs_map()] {
        for p in &map.points {
            assert!(
                p.x >= final_x - window_half - 2.0,
                "stale map point at x = {:.2} (sensor at {:.2})",
                p.x,
                final_x
            );
        }
    }
    assert!(!slam.planars_map().is_empty());
}

/// Save / clear / load round-trip: the restored maps hold exactly the
/// points that were saved (leaf keys are absolute, so re-insertion does
/// not merge anything further).
#[test]
fn test_maps_pcd_round_trip() {
    let world = small_room_world();
    let mut slam = Slam::new(scenario_config());
    for k in 0..4u64 {
        let cloud = static_sweep(&world, &pose_yaw(0.0), (k + 1) * 1_000_000);
        slam.add_frame(&cloud).unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("session").to_string_lossy().to_string();

    let saved = slam.planars_map();
    assert!(!saved.is_empty());
    slam.save_maps_to_pcd(&prefix, PcdFormat::BinaryCompressed)
        .unwrap();

    slam.clear_maps();
    assert!(slam.planars_map().is_empty());

    slam.load_maps_from_pcd(&prefix, true).unwrap();
    let restored = slam.planars_map();

    let key = |p: &chakra_slam::LidarPoint| (p.x.to_bits(), p.y.to_bits(), p.z.to_bits());
    let mut saved_keys: Vec<_> = saved.points.iter().map(key).collect();
    let mut restored_keys: Vec<_> = restored.points.iter().map(key).collect();
    saved_keys.sort_unstable();
    restored_keys.sort_unstable();
    assert_eq!(saved_keys, restored_keys);
}

/// Missing map files surface an I/O error to the caller.
#[test]
fn test_load_missing_maps_fails() {
    let mut slam = Slam::new(scenario_config());
    assert!(slam
        .load_maps_from_pcd("/nonexistent/prefix/run", true)
        .is_err());
}

/// With real motion during the sweep, compensating the distortion must
/// beat ignoring it on a ground-truth-known trajectory.
#[test]
fn test_undistortion_reduces_error() {
    let world = corridor_world();
    let speed = 3.0; // m/s
    let frame_duration = 0.1;
    let frames = 15u64;

    let run = |mode: UndistortionMode| -> f64 {
        let mut config = scenario_config();
        config.undistortion = mode;
        let mut slam = Slam::new(config);
        for k in 0..frames {
            // The sweep spans [t_k - 0.1, t_k]; the sensor keeps moving
            // while the mirror spins.
            let sweep_end_t = (k + 1) as f64 * frame_duration;
            let cloud = sweep(
                &world,
                |s| pose_x(speed * (sweep_end_t - frame_duration + s * frame_duration)),
                ((k + 1) * 100_000) as u64,
                frame_duration,
            );
            slam.add_frame(&cloud).unwrap();
        }
        // Ground truth relative displacement between first and last sweep
        // ends.
        let truth = speed * frame_duration * (frames - 1) as f64;
        (slam.world_transform().x() - truth).abs()
    };

    let err_none = run(UndistortionMode::None);
    let err_approx = run(UndistortionMode::Approximated);
    assert!(
        err_approx < err_none,
        "undistortion did not help: {:.4} vs {:.4}",
        err_approx,
        err_none
    );
}

/// On a clean synthetic scene, restricting localization planars to the
/// extractor's labels (FastSlam) and using every valid point agree.
#[test]
fn test_fast_slam_parity() {
    let world = corridor_world();

    let run = |fast: bool| -> Isometry3<f64> {
        let mut config = scenario_config();
        config.fast_slam = fast;
        let mut slam = Slam::new(config);
        for k in 0..10u64 {
            let cloud = static_sweep(&world, &pose_x(k as f64 * 0.2), (k + 1) * 1_000_000);
            slam.add_frame(&cloud).unwrap();
        }
        slam.world_transform().isometry
    };

    let with_fast = run(true);
    let without_fast = run(false);
    let dt = (with_fast.translation.vector - without_fast.translation.vector).norm();
    let dr = (with_fast.rotation.inverse() * without_fast.rotation).angle();
    assert!(dt < 0.01, "translation disagreement {:.4} m", dt);
    assert!(dr < 0.01, "rotation disagreement {:.4} rad", dr);
}

/// The pose-graph boundary: logged data round-trips and an "optimized"
/// trajectory rebuilds the maps at the corrected poses.
#[test]
fn test_pose_graph_data_and_map_rebuild() {
    let world = small_room_world();
    let mut slam = Slam::new(scenario_config());
    for k in 0..5u64 {
        let cloud = static_sweep(&world, &pose_x(k as f64 * 0.2), (k + 1) * 1_000_000);
        slam.add_frame(&cloud).unwrap();
    }

    let data = slam.pose_graph_data();
    assert_eq!(data.trajectory.len(), 5);
    assert_eq!(data.covariances.len(), 5);
    assert_eq!(data.edges.len(), 5);
    assert!(!data.planars[0].is_empty());

    // Shift the whole trajectory by 1 m in y, as an external optimizer
    // might, and rebuild.
    let mut optimized = data.trajectory.clone();
    for t in &mut optimized {
        t.isometry.translation.vector += Vector3::new(0.0, 1.0, 0.0);
    }
    slam.apply_optimized_trajectory(&optimized).unwrap();

    let pose = slam.world_transform();
    assert!((pose.y() - 1.0).abs() < 1e-9);
    // The rebuilt map follows the shifted trajectory.
    let mean_y: f64 = slam
        .planars_map()
        .points
        .iter()
        .map(|p| p.y)
        .sum::<f64>()
        / slam.planars_map().len().max(1) as f64;
    assert!(mean_y > 0.5, "rebuilt map mean y = {:.3}", mean_y);

    // Length mismatch is rejected.
    assert!(slam.apply_optimized_trajectory(&optimized[1..]).is_err());
}

/// Compressed keypoint logging round-trips through the pose-graph export.
#[test]
fn test_compressed_logging_storage() {
    let world = small_room_world();
    let mut config = scenario_config();
    config.logging_storage = chakra_slam::LoggingStorage::CompressedCloud;
    let mut slam = Slam::new(config);

    for k in 0..3u64 {
        let cloud = static_sweep(&world, &pose_yaw(0.0), (k + 1) * 1_000_000);
        slam.add_frame(&cloud).unwrap();
    }

    let data = slam.pose_graph_data();
    assert_eq!(data.planars.len(), 3);
    assert!(!data.planars[2].is_empty());
}

/// The logging window prunes entries older than the timeout.
#[test]
fn test_logging_timeout_prunes() {
    let world = small_room_world();
    let mut config = scenario_config();
    config.logging_timeout = 2.5; // seconds
    let mut slam = Slam::new(config);

    for k in 0..6u64 {
        let cloud = static_sweep(&world, &pose_yaw(0.0), (k + 1) * 1_000_000);
        slam.add_frame(&cloud).unwrap();
    }

    // Frames are 1 s apart; only ~3 most recent fit the 2.5 s window.
    let trajectory = slam.trajectory();
    assert!(trajectory.len() <= 3, "kept {} entries", trajectory.len());
    assert!(trajectory.len() >= 2);
}
