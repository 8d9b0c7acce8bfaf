//! Quaternion and heading-frame geometry for observation extraction.
//!
//! Quaternions are `[w, x, y, z]` arrays. The coordinate system is Y-up
//! with reference forward axis `(0, 0, 1)`; the heading is the yaw-only
//! facing angle about Y.

/// Normalize a quaternion to unit length. Degenerate input yields identity.
#[inline]
pub fn quat_normalize(q: [f32; 4]) -> [f32; 4] {
    let norm = (q[0] * q[0] + q[1] * q[1] + q[2] * q[2] + q[3] * q[3]).sqrt();
    if norm < 1e-10 {
        return [1.0, 0.0, 0.0, 0.0];
    }
    let inv = 1.0 / norm;
    [q[0] * inv, q[1] * inv, q[2] * inv, q[3] * inv]
}

/// Quaternion product `a * b`.
#[inline]
pub fn quat_mul(a: [f32; 4], b: [f32; 4]) -> [f32; 4] {
    let (aw, ax, ay, az) = (a[0], a[1], a[2], a[3]);
    let (bw, bx, by, bz) = (b[0], b[1], b[2], b[3]);
    [
        aw * bw - ax * bx - ay * by - az * bz,
        aw * bx + ax * bw + ay * bz - az * by,
        aw * by - ax * bz + ay * bw + az * bx,
        aw * bz + ax * by - ay * bx + az * bw,
    ]
}

/// Inverse of a unit quaternion (conjugate).
#[inline]
pub fn quat_inverse(q: [f32; 4]) -> [f32; 4] {
    [q[0], -q[1], -q[2], -q[3]]
}

/// Convert a quaternion to axis-angle. Near-zero rotations fall back to the
/// Y axis so callers always receive a valid axis.
#[inline]
pub fn quat_to_axis_angle(q: [f32; 4]) -> ([f32; 3], f32) {
    let w = q[0].clamp(-1.0, 1.0);
    let angle = 2.0 * w.abs().acos();
    let sin_half = (1.0 - w * w).sqrt();
    if sin_half > 1e-6 {
        let inv = 1.0 / sin_half;
        ([q[1] * inv, q[2] * inv, q[3] * inv], angle)
    } else {
        ([0.0, 1.0, 0.0], angle)
    }
}

/// Convert a quaternion to a 3x3 rotation matrix, row-major.
#[inline]
pub fn quat_to_rotation_matrix(q: [f32; 4]) -> [f32; 9] {
    let (w, x, y, z) = (q[0], q[1], q[2], q[3]);
    [
        1.0 - 2.0 * (y * y + z * z),
        2.0 * (x * y - w * z),
        2.0 * (x * z + w * y),
        2.0 * (x * y + w * z),
        1.0 - 2.0 * (x * x + z * z),
        2.0 * (y * z - w * x),
        2.0 * (x * z - w * y),
        2.0 * (y * z + w * x),
        1.0 - 2.0 * (x * x + y * y),
    ]
}

/// Extract intrinsic XYZ Euler angles from a row-major rotation matrix.
#[inline]
pub fn matrix_to_euler_xyz(m: &[f32; 9]) -> [f32; 3] {
    let sy = m[2]; // m[0][2]
    if sy.abs() < 0.99999 {
        [
            (-m[5]).atan2(m[8]), // atan2(-m12, m22)
            sy.asin(),
            (-m[1]).atan2(m[0]), // atan2(-m01, m00)
        ]
    } else {
        // Gimbal lock
        [
            m[7].atan2(m[4]), // atan2(m21, m11)
            if sy > 0.0 {
                std::f32::consts::FRAC_PI_2
            } else {
                -std::f32::consts::FRAC_PI_2
            },
            0.0,
        ]
    }
}

/// Build a quaternion from intrinsic XYZ Euler angles (radians).
#[inline]
pub fn euler_to_quat(rx: f32, ry: f32, rz: f32) -> [f32; 4] {
    let qx = [(rx * 0.5).cos(), (rx * 0.5).sin(), 0.0, 0.0];
    let qy = [(ry * 0.5).cos(), 0.0, (ry * 0.5).sin(), 0.0];
    let qz = [(rz * 0.5).cos(), 0.0, 0.0, (rz * 0.5).sin()];
    quat_mul(quat_mul(qx, qy), qz)
}

/// Heading (yaw-only facing) angle of an orientation.
///
/// Rotates the forward axis `(0, 0, 1)` by `q` and takes the planar XZ
/// arctangent, which is invariant to pitch and roll.
#[inline]
pub fn heading_angle(q: [f32; 4]) -> f32 {
    let (w, x, y, z) = (q[0], q[1], q[2], q[3]);
    let forward_x = 2.0 * (x * z + w * y);
    let forward_z = 1.0 - 2.0 * (x * x + y * y);
    forward_x.atan2(forward_z)
}

/// Strip the heading (yaw) component of an orientation, preserving pitch
/// and roll: `angle_axis(-heading, Y) * q`.
#[inline]
pub fn remove_heading(q: [f32; 4]) -> [f32; 4] {
    let heading = heading_angle(q);
    let half = -heading * 0.5;
    let heading_quat = [half.cos(), 0.0, half.sin(), 0.0];
    quat_mul(heading_quat, q)
}

/// Continuous 6-D rotation encoding: the first two columns of the rotation
/// matrix, `[m00, m01, m02, m10, m11, m12]` in column order.
#[inline]
pub fn quat_to_tan_norm_6d(q: [f32; 4]) -> [f32; 6] {
    let (w, x, y, z) = (q[0], q[1], q[2], q[3]);
    [
        1.0 - 2.0 * (y * y + z * z),
        2.0 * (x * y + w * z),
        2.0 * (x * z - w * y),
        2.0 * (x * y - w * z),
        1.0 - 2.0 * (x * x + z * z),
        2.0 * (y * z + w * x),
    ]
}

/// Rotate a world-space vector into the heading frame (rotation by
/// `-heading` about Y). The Y component passes through unchanged.
#[inline]
pub fn rotate_to_heading_frame(v: [f32; 3], heading: f32) -> [f32; 3] {
    let cos_h = (-heading).cos();
    let sin_h = (-heading).sin();
    [
        cos_h * v[0] + sin_h * v[2],
        v[1],
        -sin_h * v[0] + cos_h * v[2],
    ]
}
