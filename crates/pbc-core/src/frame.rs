//! Celestial coordinate frames for sky maps.
//!
//! Maps carry no frame tag of their own; configs say which frame each input
//! is stored in and which frame the audit runs in.

use std::fmt;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// `v_ecl = M · v_gal` for mean obliquity ε = 23.4392911° (J2000).
const ECLIPTIC_FROM_GALACTIC: [[f64; 3]; 3] = [
    [-0.054_875_560_416_215_4, 0.494_109_427_875_583_7, -0.867_666_149_019_004_7],
    [-0.993_821_379_042_939_4, -0.110_990_733_584_660_2, -0.000_351_590_001_241_2],
    [-0.096_476_626_320_556_6, 0.862_285_875_068_589_1, 0.497_147_191_715_895_5],
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateFrame {
    #[default]
    Galactic,
    Ecliptic,
}

impl CoordinateFrame {
    /// Rotation taking unit vectors in `self` to galactic ones.
    fn to_galactic_matrix(self) -> Matrix3<f64> {
        match self {
            Self::Galactic => Matrix3::identity(),
            Self::Ecliptic => ecliptic_from_galactic().transpose(),
        }
    }

    /// Unit vector in `self` expressed in galactic coordinates.
    pub fn to_galactic(self, v: [f64; 3]) -> [f64; 3] {
        let out = self.to_galactic_matrix() * Vector3::from(v);
        [out.x, out.y, out.z]
    }

    /// Rotation taking unit vectors in `self` to `target`.
    pub fn rotation_to(self, target: CoordinateFrame) -> Matrix3<f64> {
        target.to_galactic_matrix().transpose() * self.to_galactic_matrix()
    }
}

impl fmt::Display for CoordinateFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Galactic => "galactic",
            Self::Ecliptic => "ecliptic",
        })
    }
}

fn ecliptic_from_galactic() -> Matrix3<f64> {
    let m = ECLIPTIC_FROM_GALACTIC;
    Matrix3::new(
        m[0][0], m[0][1], m[0][2], m[1][0], m[1][1], m[1][2], m[2][0], m[2][1], m[2][2],
    )
}
