//! Math types.
//!
//! Only what spawn placement needs: positions and a yaw-only orientation.

use serde::{Deserialize, Serialize};

/// 3D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Unit quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    /// Rotation about the vertical (Y) axis, in degrees.
    pub fn from_yaw_degrees(yaw: f32) -> Self {
        let half = yaw.to_radians() * 0.5;
        Self {
            x: 0.0,
            y: half.sin(),
            z: 0.0,
            w: half.cos(),
        }
    }

    /// Recovers the yaw (degrees) of a Y-axis rotation.
    pub fn yaw_degrees(self) -> f32 {
        (2.0 * self.y.atan2(self.w)).to_degrees()
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}
