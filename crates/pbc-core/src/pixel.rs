//! Pixel Map Adapter.
//!
//! [`PixelMap`] wraps decoded map values on the HEALPix sphere (NESTED
//! ordering) together with an optional validity mask. Maps are immutable:
//! masking, degrading and rotating all return new maps.
//!
//! A pixel is valid when its mask entry is `true` (or there is no mask) and
//! its value is finite and not the HEALPix `UNSEEN` sentinel.

use std::path::Path;

use nalgebra::{Matrix4, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::error::{AuditError, Result};
use crate::frame::CoordinateFrame;
use crate::healpix::Healpix;

/// HEALPix sentinel for missing pixels.
pub const UNSEEN: f64 = -1.6375e30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MapFile", into = "MapFile")]
pub struct PixelMap {
    healpix: Healpix,
    values: Vec<f64>,
    mask: Option<Vec<bool>>,
}

/// On-disk JSON layout of a map.
#[derive(Serialize, Deserialize)]
struct MapFile {
    nside: u32,
    values: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mask: Option<Vec<bool>>,
}

impl TryFrom<MapFile> for PixelMap {
    type Error = AuditError;

    fn try_from(file: MapFile) -> Result<Self> {
        let map = PixelMap::new(file.nside, file.values)?;
        match file.mask {
            Some(mask) => map.with_mask(mask),
            None => Ok(map),
        }
    }
}

impl From<PixelMap> for MapFile {
    fn from(map: PixelMap) -> Self {
        MapFile {
            nside: map.healpix.nside(),
            values: map.values,
            mask: map.mask,
        }
    }
}

fn usable(v: f64) -> bool {
    v.is_finite() && v != UNSEEN
}

impl PixelMap {
    /// Wrap `values` (length `12·nside²`) as an unmasked map.
    pub fn new(nside: u32, values: Vec<f64>) -> Result<Self> {
        let healpix = Healpix::new(nside)?;
        if values.len() != healpix.npix() {
            return Err(AuditError::dims(
                format!("map values at nside {nside}"),
                healpix.npix(),
                values.len(),
            ));
        }
        Ok(Self {
            healpix,
            values,
            mask: None,
        })
    }

    /// Build a map by evaluating `f(θ, φ)` at every pixel centre.
    pub fn from_fn(nside: u32, f: impl Fn(f64, f64) -> f64) -> Result<Self> {
        let healpix = Healpix::new(nside)?;
        let values = (0..healpix.npix())
            .map(|p| {
                let (theta, phi) = healpix.pix2ang(p);
                f(theta, phi)
            })
            .collect();
        Self::new(nside, values)
    }

    /// Constant-valued map.
    pub fn constant(nside: u32, value: f64) -> Result<Self> {
        let healpix = Healpix::new(nside)?;
        Self::new(nside, vec![value; healpix.npix()])
    }

    /// Replace the validity mask (`true` = valid).
    pub fn with_mask(&self, mask: Vec<bool>) -> Result<Self> {
        if mask.len() != self.values.len() {
            return Err(AuditError::dims("map mask", self.values.len(), mask.len()));
        }
        Ok(Self {
            healpix: self.healpix,
            values: self.values.clone(),
            mask: Some(mask),
        })
    }

    /// Intersect the current validity with `mask`.
    pub fn and_mask(&self, mask: &[bool]) -> Result<Self> {
        if mask.len() != self.values.len() {
            return Err(AuditError::dims("map mask", self.values.len(), mask.len()));
        }
        let combined = (0..self.values.len())
            .map(|p| self.is_valid(p) && mask[p])
            .collect();
        self.with_mask(combined)
    }

    /// New map with the same mask and transformed values.
    pub fn map_values(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            healpix: self.healpix,
            values: self.values.iter().map(|&v| f(v)).collect(),
            mask: self.mask.clone(),
        }
    }

    /// New map with the same mask and the given values.
    pub fn with_values(&self, values: Vec<f64>) -> Result<Self> {
        if values.len() != self.values.len() {
            return Err(AuditError::dims("map values", self.values.len(), values.len()));
        }
        Ok(Self {
            healpix: self.healpix,
            values,
            mask: self.mask.clone(),
        })
    }

    pub fn nside(&self) -> u32 {
        self.healpix.nside()
    }

    pub fn healpix(&self) -> &Healpix {
        &self.healpix
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn mask(&self) -> Option<&[bool]> {
        self.mask.as_deref()
    }

    pub fn is_valid(&self, pix: usize) -> bool {
        self.mask.as_ref().is_none_or(|m| m[pix]) && usable(self.values[pix])
    }

    /// Full validity vector (mask and value checks combined).
    pub fn validity(&self) -> Vec<bool> {
        (0..self.values.len()).map(|p| self.is_valid(p)).collect()
    }

    pub fn valid_pixels(&self) -> Vec<usize> {
        (0..self.values.len()).filter(|&p| self.is_valid(p)).collect()
    }

    pub fn n_valid(&self) -> usize {
        (0..self.values.len()).filter(|&p| self.is_valid(p)).count()
    }

    /// Fraction of the sky that is valid.
    pub fn f_sky(&self) -> f64 {
        self.n_valid() as f64 / self.values.len() as f64
    }

    /// Values at valid pixels, in pixel order.
    pub fn valid_values(&self) -> Vec<f64> {
        (0..self.values.len())
            .filter(|&p| self.is_valid(p))
            .map(|p| self.values[p])
            .collect()
    }

    /// Values with invalid pixels zeroed (the form harmonic analysis wants).
    pub fn zero_filled(&self) -> Vec<f64> {
        (0..self.values.len())
            .map(|p| if self.is_valid(p) { self.values[p] } else { 0.0 })
            .collect()
    }

    /// Degrade to a coarser `target_nside` by averaging valid children.
    ///
    /// A parent pixel is invalid only when all of its children are. Upsampling
    /// is not supported and yields `ResolutionMismatch`.
    pub fn degrade(&self, target_nside: u32) -> Result<Self> {
        let target = Healpix::new(target_nside)?;
        if target.order() > self.healpix.order() {
            return Err(AuditError::ResolutionMismatch {
                input: "degrade".into(),
                expected: target_nside,
                found: self.nside(),
            });
        }
        if target == self.healpix {
            return Ok(self.clone());
        }
        let npix = target.npix();
        let mut sums = vec![0.0; npix];
        let mut counts = vec![0usize; npix];
        for pix in 0..self.values.len() {
            if self.is_valid(pix) {
                let parent = self.healpix.parent(pix, &target);
                sums[parent] += self.values[pix];
                counts[parent] += 1;
            }
        }
        let values = sums
            .iter()
            .zip(&counts)
            .map(|(s, &c)| if c > 0 { s / c as f64 } else { 0.0 })
            .collect();
        let any_invalid = counts.iter().any(|&c| c == 0);
        let mask = any_invalid.then(|| counts.iter().map(|&c| c > 0).collect());
        Ok(Self {
            healpix: target,
            values,
            mask,
        })
    }

    /// Rotate about the polar axis: pixel `p` takes the value found at
    /// `(θ_p, φ_p − angle)`. Validity follows the source pixel.
    pub fn rotate_azimuth(&self, angle: f64) -> Self {
        let hp = self.healpix;
        let mut values = Vec::with_capacity(self.values.len());
        let mut mask = Vec::with_capacity(self.values.len());
        for pix in 0..self.values.len() {
            let (z, phi) = hp.pix2zphi(pix);
            let src = hp.zphi2pix(z, phi - angle);
            values.push(self.values[src]);
            mask.push(self.is_valid(src));
        }
        Self {
            healpix: hp,
            values,
            mask: Some(mask),
        }
    }

    /// Re-grid a map stored in frame `from` onto frame `to`: each output pixel
    /// takes the value of the source pixel containing its direction. Validity
    /// follows the source pixel.
    pub fn rotate_frame(&self, from: CoordinateFrame, to: CoordinateFrame) -> Self {
        if from == to {
            return self.clone();
        }
        let hp = self.healpix;
        let rotation = to.rotation_to(from);
        let mut values = Vec::with_capacity(self.values.len());
        let mut mask = Vec::with_capacity(self.values.len());
        for pix in 0..self.values.len() {
            let v = rotation * Vector3::from(hp.pix2vec(pix));
            let src = hp.zphi2pix(v.z.clamp(-1.0, 1.0), v.y.atan2(v.x));
            values.push(self.values[src]);
            mask.push(self.is_valid(src));
        }
        Self {
            healpix: hp,
            values,
            mask: Some(mask),
        }
    }

    /// Mask pixels whose value deviates from the median by `sigma` standard
    /// deviations or more.
    pub fn threshold_mask(&self, sigma: f64) -> Self {
        let valid = self.valid_values();
        let (Some(med), Some(sd)) = (pbc_stats::median(&valid), pbc_stats::std_dev(&valid, 0))
        else {
            return self.clone();
        };
        let mask = (0..self.values.len())
            .map(|p| self.is_valid(p) && (self.values[p] - med).abs() < sigma * sd)
            .collect();
        Self {
            healpix: self.healpix,
            values: self.values.clone(),
            mask: Some(mask),
        }
    }

    /// Mask galactic latitudes `|b| ≤ b_min_deg` of a map stored in `frame`.
    pub fn with_galactic_cut(&self, b_min_deg: f64, frame: CoordinateFrame) -> Result<Self> {
        self.and_mask(&galactic_cut(&self.healpix, b_min_deg, frame))
    }

    /// Least-squares removal of monopole and dipole over valid pixels.
    ///
    /// Returns the residual map and `[monopole, d_x, d_y, d_z]`.
    pub fn remove_dipole(&self) -> Result<(Self, [f64; 4])> {
        let mut ata = Matrix4::<f64>::zeros();
        let mut atb = Vector4::<f64>::zeros();
        let mut n = 0usize;
        for pix in 0..self.values.len() {
            if !self.is_valid(pix) {
                continue;
            }
            let [x, y, z] = self.healpix.pix2vec(pix);
            let row = Vector4::new(1.0, x, y, z);
            ata += row * row.transpose();
            atb += row * self.values[pix];
            n += 1;
        }
        if n < 4 {
            return Err(AuditError::degenerate(
                "dipole fit",
                format!("{n} valid pixels, need at least 4"),
            ));
        }
        let coeffs = ata
            .cholesky()
            .ok_or_else(|| AuditError::singular("dipole fit", "normal matrix not positive definite"))?
            .solve(&atb);
        let values = (0..self.values.len())
            .map(|pix| {
                let [x, y, z] = self.healpix.pix2vec(pix);
                self.values[pix] - (coeffs[0] + coeffs[1] * x + coeffs[2] * y + coeffs[3] * z)
            })
            .collect();
        Ok((
            self.with_values(values)?,
            [coeffs[0], coeffs[1], coeffs[2], coeffs[3]],
        ))
    }

    /// Require the same resolution as `other`.
    pub fn ensure_same_resolution(&self, other: &PixelMap, input: &str) -> Result<()> {
        if self.nside() != other.nside() {
            return Err(AuditError::ResolutionMismatch {
                input: input.to_string(),
                expected: self.nside(),
                found: other.nside(),
            });
        }
        Ok(())
    }

    /// Load a map from a JSON file (`{nside, values, mask?}`).
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Save the map as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}

/// Mask that keeps pixels with galactic latitude `|b| > b_min_deg`, for a
/// pixelization laid out in `frame`.
pub fn galactic_cut(healpix: &Healpix, b_min_deg: f64, frame: CoordinateFrame) -> Vec<bool> {
    let sin_b_min = b_min_deg.to_radians().sin();
    (0..healpix.npix())
        .map(|p| {
            let z = match frame {
                CoordinateFrame::Galactic => healpix.pix2zphi(p).0,
                other => other.to_galactic(healpix.pix2vec(p))[2],
            };
            z.abs() > sin_b_min
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_length() {
        assert!(PixelMap::new(2, vec![0.0; 48]).is_ok());
        let err = PixelMap::new(2, vec![0.0; 47]).unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
        assert_eq!(PixelMap::new(3, vec![0.0; 108]).unwrap_err().kind(), "invalid_resolution");
    }

    #[test]
    fn test_validity_rules() {
        let mut values = vec![1.0; 12];
        values[1] = f64::NAN;
        values[2] = UNSEEN;
        let map = PixelMap::new(1, values).unwrap();
        let mut mask = vec![true; 12];
        mask[3] = false;
        let map = map.with_mask(mask).unwrap();
        assert_eq!(map.n_valid(), 8);
        assert!(!map.is_valid(1) && !map.is_valid(2) && !map.is_valid(3));
        assert!((map.f_sky() - 8.0 / 12.0).abs() < 1e-12);
        assert_eq!(map.zero_filled()[1], 0.0);
    }

    #[test]
    fn test_degrade_averages_valid_children() {
        let values: Vec<f64> = (0..48).map(|p| p as f64).collect();
        let mut mask = vec![true; 48];
        // Parent 0: children 0..4, one invalid.
        mask[0] = false;
        // Parent 1: children 4..8, all invalid.
        for m in &mut mask[4..8] {
            *m = false;
        }
        let map = PixelMap::new(2, values).unwrap().with_mask(mask).unwrap();
        let coarse = map.degrade(1).unwrap();
        assert_eq!(coarse.nside(), 1);
        assert!((coarse.values()[0] - 2.0).abs() < 1e-12);
        assert!(!coarse.is_valid(1));
        assert!((coarse.values()[2] - 9.5).abs() < 1e-12);
        assert!(coarse.is_valid(2));
    }

    #[test]
    fn test_degrade_rejects_upsampling() {
        let map = PixelMap::constant(2, 1.0).unwrap();
        assert_eq!(map.degrade(4).unwrap_err().kind(), "resolution_mismatch");
        assert_eq!(map.degrade(2).unwrap(), map);
    }

    #[test]
    fn test_rotation_by_full_turn_is_identity() {
        let map = PixelMap::from_fn(8, |t, p| t.cos() + (2.0 * p).sin()).unwrap();
        let rotated = map.rotate_azimuth(2.0 * std::f64::consts::PI);
        assert_eq!(rotated.values(), map.values());
    }

    #[test]
    fn test_rotation_moves_longitude_pattern() {
        let map = PixelMap::from_fn(16, |_, p| p.cos()).unwrap();
        let rotated = map.rotate_azimuth(std::f64::consts::FRAC_PI_2);
        // cos(φ − π/2) = sin φ, up to pixelization.
        let hp = *map.healpix();
        let err: f64 = (0..hp.npix())
            .map(|p| (rotated.values()[p] - hp.pix2zphi(p).1.sin()).abs())
            .sum::<f64>()
            / hp.npix() as f64;
        assert!(err < 0.1, "mean abs error {err}");
    }

    #[test]
    fn test_threshold_mask_drops_outliers() {
        let mut values = vec![0.0; 48];
        for (i, v) in values.iter_mut().enumerate() {
            *v = if i % 2 == 0 { 1.0 } else { -1.0 };
        }
        values[5] = 100.0;
        let map = PixelMap::new(2, values).unwrap().threshold_mask(3.0);
        assert!(!map.is_valid(5));
        assert_eq!(map.n_valid(), 47);
    }

    #[test]
    fn test_galactic_cut() {
        let hp = Healpix::new(8).unwrap();
        let mask = galactic_cut(&hp, 25.0, CoordinateFrame::Galactic);
        for (p, &keep) in mask.iter().enumerate() {
            let (theta, _) = hp.pix2ang(p);
            let b = 90.0 - theta.to_degrees();
            assert_eq!(keep, b.abs() > 25.0);
        }
    }

    #[test]
    fn test_galactic_cut_in_ecliptic_frame() {
        let hp = Healpix::new(16).unwrap();
        let mask = galactic_cut(&hp, 20.0, CoordinateFrame::Ecliptic);
        // The ecliptic poles sit at |b| ≈ 30°, the galactic poles near the
        // ecliptic equator.
        assert!(mask[hp.zphi2pix(1.0, 0.0)]);
        assert!(mask[hp.zphi2pix(-1.0, 0.0)]);
        let gal_north = CoordinateFrame::Galactic.rotation_to(CoordinateFrame::Ecliptic)
            * Vector3::new(0.0, 0.0, 1.0);
        assert!(mask[hp.zphi2pix(gal_north.z, gal_north.y.atan2(gal_north.x))]);
        let kept = mask.iter().filter(|&&k| k).count() as f64 / hp.npix() as f64;
        let expected = 1.0 - 20f64.to_radians().sin();
        assert!((kept - expected).abs() < 0.02, "kept {kept}, expected {expected}");
    }

    #[test]
    fn test_rotate_frame_round_trip() {
        let map = PixelMap::from_fn(16, |t, _| t.cos()).unwrap();
        let ecl = map.rotate_frame(CoordinateFrame::Galactic, CoordinateFrame::Ecliptic);
        // A field equal to galactic z reads, in ecliptic pixels, as the
        // galactic z of each ecliptic direction.
        let hp = *map.healpix();
        let err: f64 = (0..hp.npix())
            .map(|p| {
                let gal_z = CoordinateFrame::Ecliptic.to_galactic(hp.pix2vec(p))[2];
                (ecl.values()[p] - gal_z).abs()
            })
            .sum::<f64>()
            / hp.npix() as f64;
        assert!(err < 0.05, "mean abs error {err}");
        let back = ecl.rotate_frame(CoordinateFrame::Ecliptic, CoordinateFrame::Galactic);
        let err: f64 = (0..hp.npix())
            .map(|p| (back.values()[p] - map.values()[p]).abs())
            .sum::<f64>()
            / hp.npix() as f64;
        assert!(err < 0.1, "mean abs error {err}");
        assert_eq!(map.rotate_frame(CoordinateFrame::Galactic, CoordinateFrame::Galactic), map);
    }

    #[test]
    fn test_rotate_frame_carries_mask() {
        let map = PixelMap::from_fn(8, |t, _| t)
            .unwrap()
            .with_galactic_cut(30.0, CoordinateFrame::Galactic)
            .unwrap();
        let ecl = map.rotate_frame(CoordinateFrame::Galactic, CoordinateFrame::Ecliptic);
        let hp = *map.healpix();
        for p in 0..hp.npix() {
            let gal = CoordinateFrame::Ecliptic.to_galactic(hp.pix2vec(p));
            if gal[2].abs() < 0.4 {
                assert!(!ecl.is_valid(p), "pixel {p} at galactic z {}", gal[2]);
            }
        }
    }

    #[test]
    fn test_remove_dipole_recovers_coefficients() {
        let map = PixelMap::from_fn(8, |t, p| {
            2.0 + 0.5 * t.sin() * p.cos() - 0.25 * t.sin() * p.sin() + 0.75 * t.cos()
        })
        .unwrap();
        let (residual, c) = map.remove_dipole().unwrap();
        assert!((c[0] - 2.0).abs() < 1e-9);
        assert!((c[1] - 0.5).abs() < 1e-9);
        assert!((c[2] + 0.25).abs() < 1e-9);
        assert!((c[3] - 0.75).abs() < 1e-9);
        assert!(residual.values().iter().all(|v| v.abs() < 1e-9));
    }

    #[test]
    fn test_json_round_trip_validates() {
        let map = PixelMap::from_fn(2, |t, _| t).unwrap();
        let json = serde_json::to_string(&map).unwrap();
        let back: PixelMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
        let bad = r#"{"nside": 2, "values": [1.0, 2.0]}"#;
        assert!(serde_json::from_str::<PixelMap>(bad).is_err());
    }
}
