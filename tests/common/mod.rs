//! Shared synthetic-world helpers for the integration tests.
//!
//! A world is a set of axis-aligned rectangles; a virtual 16-beam spinning
//! sensor samples it by ray casting, producing clouds in the sensor frame
//! with realistic per-point times and laser ids.

#![allow(dead_code)]

use nalgebra::{Isometry3, Vector3};

use chakra_slam::{LidarPoint, PointCloud, RegistrationConfig, SlamConfig, UndistortionMode};

/// Axis-aligned rectangle: plane `p[axis] = value` bounded on the two
/// remaining axes (in ascending axis order).
pub struct AaRect {
    pub axis: usize,
    pub value: f64,
    pub min: [f64; 2],
    pub max: [f64; 2],
}

/// A set of rectangles to ray cast against.
pub struct World {
    pub rects: Vec<AaRect>,
}

impl World {
    /// Closed axis-aligned box: 6 faces.
    pub fn room(lo: Vector3<f64>, hi: Vector3<f64>) -> Self {
        let mut rects = Vec::new();
        for axis in 0..3 {
            let (a, b) = match axis {
                0 => (1, 2),
                1 => (0, 2),
                _ => (0, 1),
            };
            for value in [lo[axis], hi[axis]] {
                rects.push(AaRect {
                    axis,
                    value,
                    min: [lo[a], lo[b]],
                    max: [hi[a], hi[b]],
                });
            }
        }
        Self { rects }
    }

    /// Add a rectangular pillar protruding from a side wall at `y = 3 *
    /// side` toward the corridor center: two faces perpendicular to x at
    /// `x_center +- width / 2` and one face toward the center.
    pub fn add_pillar(
        &mut self,
        x_center: f64,
        side: f64,
        width: f64,
        depth: f64,
        z_lo: f64,
        z_hi: f64,
    ) {
        let wall_y = 3.0 * side;
        let inner_y = wall_y - depth * side;
        let (y_lo, y_hi) = if side > 0.0 {
            (inner_y, wall_y)
        } else {
            (wall_y, inner_y)
        };
        for x in [x_center - width / 2.0, x_center + width / 2.0] {
            self.rects.push(AaRect {
                axis: 0,
                value: x,
                min: [y_lo, z_lo],
                max: [y_hi, z_hi],
            });
        }
        self.rects.push(AaRect {
            axis: 1,
            value: inner_y,
            min: [x_center - width / 2.0, z_lo],
            max: [x_center + width / 2.0, z_hi],
        });
    }

    /// Range of the first surface hit along `dir` from `origin`.
    pub fn cast_ray(
        &self,
        origin: &Vector3<f64>,
        dir: &Vector3<f64>,
        max_range: f64,
    ) -> Option<f64> {
        let mut best = max_range;
        let mut hit = false;
        for rect in &self.rects {
            let denom = dir[rect.axis];
            if denom.abs() < 1e-12 {
                continue;
            }
            let t = (rect.value - origin[rect.axis]) / denom;
            if t <= 0.2 || t >= best {
                continue;
            }
            let p = origin + dir * t;
            let (a, b) = match rect.axis {
                0 => (1, 2),
                1 => (0, 2),
                _ => (0, 1),
            };
            if p[a] >= rect.min[0] && p[a] <= rect.max[0] && p[b] >= rect.min[1] && p[b] <= rect.max[1]
            {
                best = t;
                hit = true;
            }
        }
        hit.then_some(best)
    }
}

/// Corridor along +x with closed ends and wall pillars every few meters.
/// The pillar faces perpendicular to the corridor keep the along-track
/// direction observable everywhere, and their corners provide edges.
pub fn corridor_world() -> World {
    let mut world = World::room(Vector3::new(-5.0, -3.0, -2.0), Vector3::new(45.0, 3.0, 3.0));
    let mut x = 2.0;
    let mut side = 1.0;
    while x < 44.0 {
        world.add_pillar(x, side, 1.2, 1.0, -2.0, 3.0);
        x += 6.0;
        side = -side;
    }
    world
}

/// Small rectangular room for in-place rotation tests.
pub fn small_room_world() -> World {
    World::room(Vector3::new(-4.0, -2.5, -2.0), Vector3::new(4.0, 2.5, 2.5))
}

/// Number of beams of the virtual sensor.
pub const NB_BEAMS: usize = 16;
/// Azimuth steps per sweep.
pub const NB_AZIMUTH: usize = 240;

/// Sample one sweep. `pose_at(s)` gives the WORLD pose of the sensor at
/// normalized sweep fraction `s` (0 = sweep start, 1 = sweep end); points
/// are returned in the sensor frame with `time = s * frame_duration`.
pub fn sweep(
    world: &World,
    pose_at: impl Fn(f64) -> Isometry3<f64>,
    timestamp_us: u64,
    frame_duration: f64,
) -> PointCloud {
    let mut cloud = PointCloud::new(timestamp_us, "lidar");
    for az_step in 0..NB_AZIMUTH {
        let s = az_step as f64 / NB_AZIMUTH as f64;
        let az = s * std::f64::consts::TAU;
        let pose = pose_at(s);
        for beam in 0..NB_BEAMS {
            let elevation = (-15.0 + 30.0 * beam as f64 / (NB_BEAMS - 1) as f64).to_radians();
            let dir_sensor = Vector3::new(
                elevation.cos() * az.cos(),
                elevation.cos() * az.sin(),
                elevation.sin(),
            );
            let origin = pose.translation.vector;
            let dir_world = pose.rotation * dir_sensor;
            if let Some(range) = world.cast_ray(&origin, &dir_world, 50.0) {
                let p = dir_sensor * range;
                cloud.push(LidarPoint {
                    x: p.x,
                    y: p.y,
                    z: p.z,
                    intensity: 100.0,
                    laser_id: beam as u8,
                    time: s * frame_duration,
                });
            }
        }
    }
    cloud
}

/// Sweep with the sensor frozen at `pose`.
pub fn static_sweep(world: &World, pose: &Isometry3<f64>, timestamp_us: u64) -> PointCloud {
    sweep(world, |_| *pose, timestamp_us, 0.1)
}

/// Engine configuration for the synthetic scenarios: small rooms, large
/// inter-frame motion, permissive residual gates.
pub fn scenario_config() -> SlamConfig {
    let mut config = SlamConfig::default();
    config.logging_timeout = -1.0;
    config.undistortion = UndistortionMode::None;
    config.extractor.min_distance_to_sensor = 0.5;

    let relax = |reg: &mut RegistrationConfig| {
        reg.icp_max_iter = 12;
        reg.lm_max_iter = 30;
        reg.max_line_distance = 4.0;
        reg.max_plane_distance = 4.0;
        reg.init_loss_scale = 10.0;
        reg.final_loss_scale = 0.5;
    };
    relax(&mut config.ego_motion_registration);
    relax(&mut config.localization_registration);
    config
}

/// Isometry translated along +x.
pub fn pose_x(x: f64) -> Isometry3<f64> {
    Isometry3::translation(x, 0.0, 0.0)
}

/// Isometry yawed in place.
pub fn pose_yaw(yaw: f64) -> Isometry3<f64> {
    Isometry3::rotation(Vector3::z() * yaw)
}
