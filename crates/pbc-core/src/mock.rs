//! Synthetic skies and catalogs for validation runs and demos.
//!
//! The scan map mimics a survey hit-count map: a smooth ecliptic gradient,
//! band-limited scan striping, and white noise. The record is a Gaussian
//! field with a red (`C_l ∝ 1/l²`) spectrum and no coupling to the scan.

use rand::Rng;
use rand_distr::StandardNormal;

use crate::context::ContextVector;
use crate::engine::Catalog;
use crate::error::Result;
use crate::harmonic::{Alm, power_law_cl};
use crate::harness::{standardize_record, trial_rng};
use crate::pixel::PixelMap;

/// North ecliptic pole in galactic coordinates (l, b) in degrees.
pub const ECLIPTIC_POLE_DEG: (f64, f64) = (96.384, 29.811);

fn ecliptic_pole() -> [f64; 3] {
    let (l, b) = (ECLIPTIC_POLE_DEG.0.to_radians(), ECLIPTIC_POLE_DEG.1.to_radians());
    [b.cos() * l.cos(), b.cos() * l.sin(), b.sin()]
}

/// `cos` of the angle between each pixel centre and the ecliptic pole.
fn ecliptic_cosines(map_nside: u32) -> Result<Vec<f64>> {
    let pole = ecliptic_pole();
    let proto = PixelMap::constant(map_nside, 0.0)?;
    let hp = proto.healpix();
    Ok((0..hp.npix())
        .map(|p| {
            let v = hp.pix2vec(p);
            v[0] * pole[0] + v[1] * pole[1] + v[2] * pole[2]
        })
        .collect())
}

/// Unit-variance band-limited field with a flat spectrum.
pub fn flat_field(nside: u32, lmax: usize, seed: u64) -> Result<PixelMap> {
    let mut rng = trial_rng(seed, "mock/flat", 0);
    let map = Alm::synalm(&flat_cl(lmax), lmax, &mut rng).to_map(nside)?;
    let sd = pbc_stats::std_dev(map.values(), 0).unwrap_or(1.0);
    Ok(map.map_values(|v| v / sd))
}

/// Hit-count map: `1500 + 400 |cos θ_ecl| + 300 · stripes + 20 · noise`.
pub fn scan_map(nside: u32, lmax: usize, seed: u64) -> Result<PixelMap> {
    let stripes = flat_field(nside, lmax, seed)?;
    let cosines = ecliptic_cosines(nside)?;
    let mut rng = trial_rng(seed, "mock/scan", 0);
    let values = cosines
        .iter()
        .zip(stripes.values())
        .map(|(c, s)| {
            let noise: f64 = rng.sample(StandardNormal);
            1500.0 + 400.0 * c.abs() + 300.0 * s + 20.0 * noise
        })
        .collect();
    PixelMap::new(nside, values)
}

/// Zodiacal-light proxy, brightest on the ecliptic plane: `|sin θ_ecl|`.
pub fn zodi_map(nside: u32) -> Result<PixelMap> {
    let cosines = ecliptic_cosines(nside)?;
    PixelMap::new(nside, cosines.iter().map(|c| (1.0 - c * c).max(0.0).sqrt()).collect())
}

/// CMB-like record with `C_l ∝ 1/l²`, independent of any scan.
pub fn cmb_record(nside: u32, lmax: usize, seed: u64) -> Result<PixelMap> {
    let mut rng = trial_rng(seed, "mock/record", 0);
    Alm::synalm(&power_law_cl(lmax, 1.0, 2.0), lmax, &mut rng).to_map(nside)
}

/// `C_l = 1` for `l ≥ 2`.
pub fn flat_cl(lmax: usize) -> Vec<f64> {
    power_law_cl(lmax, 1.0, 0.0)
}

/// Standardized record plus `amplitude` times the context.
pub fn couple(record: &PixelMap, context: &ContextVector, amplitude: f64) -> Result<PixelMap> {
    let base = standardize_record(record, context)?;
    let mut values = base.values().to_vec();
    for (&p, &c) in context.pixels.iter().zip(&context.values) {
        values[p] += amplitude * c;
    }
    base.with_values(values)
}

/// Catalog of `n` objects. Values are uniform in [0.4, 1.2]; the second
/// weight set leans towards high values in proportion to `coupling`.
pub fn catalog(n: usize, coupling: f64, seed: u64) -> Result<Catalog> {
    let mut rng = trial_rng(seed, "mock/catalog", 0);
    let mut values = Vec::with_capacity(n);
    let mut weights_a = Vec::with_capacity(n);
    let mut weights_b = Vec::with_capacity(n);
    for _ in 0..n {
        let z = 0.4 + 0.8 * rng.random::<f64>();
        let wa = (0.3 * rng.sample::<f64, _>(StandardNormal)).exp();
        let tilt = 0.2 * rng.sample::<f64, _>(StandardNormal) + coupling * (z - 0.8);
        values.push(z);
        weights_a.push(wa);
        weights_b.push(wa * tilt.exp());
    }
    Catalog::new(values, weights_a, weights_b)
}

/// Scan, zodi proxy and record at one resolution.
#[derive(Debug, Clone)]
pub struct MockSky {
    pub scan: PixelMap,
    pub zodi: PixelMap,
    pub record: PixelMap,
}

impl MockSky {
    pub fn generate(nside: u32, lmax: usize, seed: u64) -> Result<Self> {
        Ok(Self {
            scan: scan_map(nside, lmax, seed)?,
            zodi: zodi_map(nside)?,
            record: cmb_record(nside, lmax, seed)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CommutatorMode, commutator};

    #[test]
    fn test_scan_map_is_positive_and_seeded() {
        let a = scan_map(8, 16, 1).unwrap();
        let b = scan_map(8, 16, 1).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, scan_map(8, 16, 2).unwrap());
        assert!(a.values().iter().all(|&v| v > 0.0));
    }

    #[test]
    fn test_zodi_peaks_on_ecliptic() {
        let zodi = zodi_map(8).unwrap();
        let max = zodi.values().iter().cloned().fold(f64::MIN, f64::max);
        let min = zodi.values().iter().cloned().fold(f64::MAX, f64::min);
        assert!(max > 0.99 && max <= 1.0);
        assert!(min < 0.2);
    }

    #[test]
    fn test_record_has_red_spectrum() {
        let record = cmb_record(16, 32, 3).unwrap();
        let cl = Alm::from_map(&record, 32, 2).power_spectrum();
        let low: f64 = cl[2..6].iter().sum();
        let high: f64 = cl[20..24].iter().sum();
        assert!(low > 10.0 * high);
    }

    #[test]
    fn test_catalog_coupling_opens_commutator() {
        let free = commutator(&catalog(4000, 0.0, 1).unwrap(), CommutatorMode::Signed).unwrap();
        let tilted = commutator(&catalog(4000, 2.0, 1).unwrap(), CommutatorMode::Signed).unwrap();
        assert!(free.delta.abs() < 0.01, "{}", free.delta);
        assert!(tilted.delta < -0.05, "{}", tilted.delta);
    }
}
