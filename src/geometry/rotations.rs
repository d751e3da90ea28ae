//! Rotation matrix builders for anchor mounting angles

use nalgebra::Matrix3;

/// Rotation about the Z axis (yaw), angle in degrees.
pub fn rotation_z(deg: f64) -> Matrix3<f64> {
    let rad = deg.to_radians();
    let (s, c) = rad.sin_cos();
    Matrix3::new(
        c, -s, 0.0, //
        s, c, 0.0, //
        0.0, 0.0, 1.0,
    )
}

/// Rotation about the Y axis (tilt), angle in degrees.
///
/// With the sensor's local frame board-fixed (x forward, y left, z up), a
/// positive angle tilts the board's forward direction toward global −z. The
/// sign is a calibration decision carried in configuration.
pub fn rotation_y(deg: f64) -> Matrix3<f64> {
    let rad = deg.to_radians();
    let (s, c) = rad.sin_cos();
    Matrix3::new(
        c, 0.0, s, //
        0.0, 1.0, 0.0, //
        -s, 0.0, c,
    )
}
