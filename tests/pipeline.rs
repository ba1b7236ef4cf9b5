//! End-to-end pipeline scenarios on synthetic worlds.

mod common;

use common::*;

use chakra_slam::{PointCloud, Slam, SlamError};

/// Straight-line constant velocity through a corridor: 1 m per sweep for
/// 30 m. The estimated trajectory must land on the far end within half a
/// meter and stay level.
#[test]
fn test_straight_line_constant_velocity() {
    let world = corridor_world();
    let mut slam = Slam::new(scenario_config());

    for k in 0..=30u64 {
        let cloud = static_sweep(&world, &pose_x(k as f64), (k + 1) * 1_000_000);
        slam.add_frame(&cloud).unwrap();
    }

    let pose = slam.world_transform();
    assert!(
        pose.x() > 29.5 && pose.x() < 30.5,
        "final x = {:.3}",
        pose.x()
    );
    assert!(pose.y().abs() < 0.05, "final y = {:.3}", pose.y());
    assert!(pose.z().abs() < 0.05, "final z = {:.3}", pose.z());
    assert!(pose.rx().abs() < 0.05);
    assert!(pose.ry().abs() < 0.05);
    assert!(pose.rz().abs() < 0.05);
}

/// Pure rotation in place: 1 rad per sweep for 10 rad total. The final
/// attitude must match within 0.1 rad (compared on SO(3), so the 2*pi
/// wrap is irrelevant) with negligible translation.
#[test]
fn test_pure_rotation_in_place() {
    let world = small_room_world();
    let mut slam = Slam::new(scenario_config());

    for k in 0..=10u64 {
        let cloud = static_sweep(&world, &pose_yaw(k as f64), (k + 1) * 1_000_000);
        slam.add_frame(&cloud).unwrap();
    }

    let estimated = slam.world_transform().isometry;
    let expected = pose_yaw(10.0);
    let rot_err = (estimated.rotation.inverse() * expected.rotation).angle();
    assert!(rot_err < 0.1, "rotation error {:.4} rad", rot_err);
    assert!(
        estimated.translation.vector.norm() < 0.1,
        "translation drift {:.3} m",
        estimated.translation.vector.norm()
    );
}

/// A stationary sensor replaying the same geometry converges to identity
/// relative motion within a few frames.
#[test]
fn test_stationary_sensor_relative_identity() {
    let world = small_room_world();
    let mut slam = Slam::new(scenario_config());

    for k in 0..5u64 {
        let cloud = static_sweep(&world, &pose_yaw(0.0), (k + 1) * 1_000_000);
        slam.add_frame(&cloud).unwrap();
    }

    let pose = slam.world_transform().isometry;
    assert!(
        pose.translation.vector.norm() < 0.01,
        "drift {:.4} m while stationary",
        pose.translation.vector.norm()
    );
    assert!(pose.rotation.angle() < 0.01);
}

/// Trajectory timestamps are strictly increasing and every logged
/// covariance is symmetric positive semi-definite.
#[test]
fn test_trajectory_monotonic_and_covariance_psd() {
    let world = corridor_world();
    let mut slam = Slam::new(scenario_config());

    for k in 0..6u64 {
        let cloud = static_sweep(&world, &pose_x(k as f64 * 0.5), (k + 1) * 1_000_000);
        slam.add_frame(&cloud).unwrap();
    }

    let trajectory = slam.trajectory();
    assert_eq!(trajectory.len(), 6);
    for pair in trajectory.windows(2) {
        assert!(pair[1].time > pair[0].time);
    }

    for cov in slam.covariances() {
        // Symmetry (row-major layout).
        for i in 0..6 {
            for j in 0..6 {
                assert!((cov[i * 6 + j] - cov[j * 6 + i]).abs() < 1e-9);
            }
        }
        let m = nalgebra::Matrix6::from_fn(|i, j| cov[i * 6 + j]);
        let eig = nalgebra::SymmetricEigen::new(m);
        assert!(
            eig.eigenvalues.iter().all(|&l| l > -1e-9),
            "covariance not PSD"
        );
    }
}

/// Replaying identical input after `reset(true)` reproduces the pose of a
/// fresh engine bit for bit.
#[test]
fn test_reset_determinism() {
    let world = corridor_world();
    let sweeps: Vec<PointCloud> = (0..10u64)
        .map(|k| static_sweep(&world, &pose_x(k as f64 * 0.4), (k + 1) * 1_000_000))
        .collect();

    let mut slam_a = Slam::new(scenario_config());
    for cloud in &sweeps {
        slam_a.add_frame(cloud).unwrap();
    }
    slam_a.reset(true);
    for cloud in &sweeps {
        slam_a.add_frame(cloud).unwrap();
    }

    let mut slam_b = Slam::new(scenario_config());
    for cloud in &sweeps {
        slam_b.add_frame(cloud).unwrap();
    }

    let a = slam_a.world_transform().isometry;
    let b = slam_b.world_transform().isometry;
    assert_eq!(a.translation.vector, b.translation.vector);
    assert_eq!(a.rotation.into_inner().coords, b.rotation.into_inner().coords);

    let traj_a = slam_a.trajectory();
    let traj_b = slam_b.trajectory();
    assert_eq!(traj_a.len(), traj_b.len());
    for (ta, tb) in traj_a.iter().zip(traj_b.iter()) {
        assert_eq!(ta.isometry, tb.isometry);
    }
}

/// Soft-failure boundary behaviors: empty cloud and duplicate timestamps
/// leave the engine untouched; a single-laser cloud flows through the
/// degenerate path without corrupting the pose.
#[test]
fn test_boundary_inputs() {
    let world = small_room_world();
    let mut slam = Slam::new(scenario_config());

    let good = static_sweep(&world, &pose_yaw(0.0), 1_000_000);
    slam.add_frame(&good).unwrap();
    let pose_before = slam.world_transform().isometry;
    let trajectory_before = slam.trajectory().len();

    // Empty cloud: rejected, no trajectory entry.
    let err = slam
        .add_frame(&PointCloud::new(2_000_000, "lidar"))
        .unwrap_err();
    assert!(matches!(err, SlamError::InputInvalid { .. }));
    assert_eq!(slam.trajectory().len(), trajectory_before);

    // Duplicate timestamp: rejected.
    assert!(slam.add_frame(&good).is_err());

    // Single-laser cloud: only blobs, pipeline survives.
    let mut single = static_sweep(&world, &pose_yaw(0.0), 3_000_000);
    for p in &mut single.points {
        p.laser_id = 0;
    }
    slam.add_frame(&single).unwrap();
    let pose_after = slam.world_transform().isometry;
    assert!(
        (pose_after.translation.vector - pose_before.translation.vector).norm() < 0.5,
        "single-laser frame threw the pose away"
    );
}

/// With a zero BASE<-LIDAR offset the world transform tracks the sensor
/// motion directly.
#[test]
fn test_identity_offset_tracks_lidar() {
    let world = corridor_world();
    let mut slam = Slam::new(scenario_config());

    for k in 0..4u64 {
        let cloud = static_sweep(&world, &pose_x(k as f64 * 0.5), (k + 1) * 1_000_000);
        slam.add_frame(&cloud).unwrap();
    }
    let pose = slam.world_transform();
    assert!((pose.x() - 1.5).abs() < 0.1, "x = {:.3}", pose.x());
    assert_eq!(pose.child_frame_id, "lidar");
}

/// The latency-compensated pose extrapolates beyond the last estimate in
/// the direction of motion.
#[test]
fn test_latency_compensated_pose_advances() {
    let world = corridor_world();
    let mut slam = Slam::new(scenario_config());

    for k in 0..6u64 {
        let cloud = static_sweep(&world, &pose_x(k as f64), (k + 1) * 1_000_000);
        slam.add_frame(&cloud).unwrap();
    }

    let raw = slam.world_transform();
    let compensated = slam.latency_compensated_world_transform();
    assert!(compensated.x() >= raw.x());
    assert!(compensated.time >= raw.time);
}
