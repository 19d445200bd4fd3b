//! Spherical-harmonic transforms on the HEALPix ring layout.
//!
//! Coefficients use the m-major ordering `index(l, m) = m(2·lmax + 1 − m)/2 + l`
//! with `0 ≤ m ≤ l ≤ lmax`; negative m follow from reality of the map. The
//! azimuthal sums run through `rustfft` one ring at a time, and the polar part
//! uses the normalized associated Legendre recurrence.

use std::f64::consts::PI;

use rand::Rng;
use rand_distr::StandardNormal;
use rustfft::FftPlanner;
use rustfft::num_complex::Complex64;

use crate::error::{AuditError, Result};
use crate::healpix::{Healpix, Ring};
use crate::pixel::PixelMap;

/// Number of coefficients for `lmax`.
pub fn alm_size(lmax: usize) -> usize {
    (lmax + 1) * (lmax + 2) / 2
}

/// Position of `(l, m)` in the coefficient array.
pub fn alm_index(lmax: usize, l: usize, m: usize) -> usize {
    m * (2 * lmax + 1 - m) / 2 + l
}

/// Complex harmonic coefficients `a_lm` of a real field.
#[derive(Debug, Clone, PartialEq)]
pub struct Alm {
    lmax: usize,
    coeffs: Vec<Complex64>,
}

impl Alm {
    pub fn zeros(lmax: usize) -> Self {
        Self {
            lmax,
            coeffs: vec![Complex64::new(0.0, 0.0); alm_size(lmax)],
        }
    }

    pub fn from_coeffs(lmax: usize, coeffs: Vec<Complex64>) -> Result<Self> {
        if coeffs.len() != alm_size(lmax) {
            return Err(AuditError::dims("alm coefficients", alm_size(lmax), coeffs.len()));
        }
        Ok(Self { lmax, coeffs })
    }

    pub fn lmax(&self) -> usize {
        self.lmax
    }

    pub fn len(&self) -> usize {
        self.coeffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coeffs.is_empty()
    }

    pub fn coeffs(&self) -> &[Complex64] {
        &self.coeffs
    }

    pub fn get(&self, l: usize, m: usize) -> Complex64 {
        self.coeffs[alm_index(self.lmax, l, m)]
    }

    pub fn set(&mut self, l: usize, m: usize, value: Complex64) {
        let i = alm_index(self.lmax, l, m);
        self.coeffs[i] = value;
    }

    fn ensure_same_lmax(&self, other: &Alm) -> Result<()> {
        if self.lmax != other.lmax {
            return Err(AuditError::dims("alm lmax", self.lmax, other.lmax));
        }
        Ok(())
    }

    /// `self + scale·other`.
    pub fn add_scaled(&self, other: &Alm, scale: f64) -> Result<Alm> {
        self.ensure_same_lmax(other)?;
        let coeffs = self
            .coeffs
            .iter()
            .zip(&other.coeffs)
            .map(|(a, b)| *a + *b * scale)
            .collect();
        Ok(Alm {
            lmax: self.lmax,
            coeffs,
        })
    }

    pub fn scaled(&self, scale: f64) -> Alm {
        Alm {
            lmax: self.lmax,
            coeffs: self.coeffs.iter().map(|a| *a * scale).collect(),
        }
    }

    /// `(l, m, a_lm)` for `lmin ≤ l ≤ lmax_band`, `m ≥ m_min`.
    pub fn band(&self, lmin: usize, lmax_band: usize, m_min: usize) -> Vec<(usize, usize, Complex64)> {
        let top = lmax_band.min(self.lmax);
        let mut out = Vec::new();
        for m in m_min..=top {
            for l in lmin.max(m)..=top {
                out.push((l, m, self.get(l, m)));
            }
        }
        out
    }

    /// Angular power spectrum `C_l = (|a_l0|² + 2 Σ_{m>0} |a_lm|²) / (2l + 1)`.
    pub fn power_spectrum(&self) -> Vec<f64> {
        (0..=self.lmax)
            .map(|l| {
                let mut sum = self.get(l, 0).norm_sqr();
                for m in 1..=l {
                    sum += 2.0 * self.get(l, m).norm_sqr();
                }
                sum / (2 * l + 1) as f64
            })
            .collect()
    }

    /// Same amplitudes, fresh uniform phases. `m = 0` coefficients are real
    /// and get a random sign.
    pub fn randomize_phases<R: Rng + ?Sized>(&self, rng: &mut R) -> Alm {
        let mut out = self.clone();
        for m in 0..=self.lmax {
            for l in m..=self.lmax {
                let i = alm_index(self.lmax, l, m);
                let amp = self.coeffs[i].norm();
                out.coeffs[i] = if m == 0 {
                    let sign = if rng.random::<bool>() { 1.0 } else { -1.0 };
                    Complex64::new(sign * amp, 0.0)
                } else {
                    Complex64::from_polar(amp, 2.0 * PI * rng.random::<f64>())
                };
            }
        }
        out
    }

    /// Real vectorization over `lmin ≤ l ≤ lmax_band`: `Re a_l0`, then
    /// `√2 Re a_lm`, `√2 Im a_lm` for `m > 0`. Inner products of these vectors
    /// match the pixel-space inner product of the band-limited fields.
    pub fn to_real_vector(&self, lmin: usize, lmax_band: usize) -> Vec<f64> {
        let mut out = Vec::new();
        for (_, m, a) in self.band(lmin, lmax_band, 0) {
            if m == 0 {
                out.push(a.re);
            } else {
                out.push(std::f64::consts::SQRT_2 * a.re);
                out.push(std::f64::consts::SQRT_2 * a.im);
            }
        }
        out
    }

    /// Per-entry multipole of [`to_real_vector`](Self::to_real_vector).
    pub fn real_vector_multipoles(&self, lmin: usize, lmax_band: usize) -> Vec<usize> {
        let mut out = Vec::new();
        for (l, m, _) in self.band(lmin, lmax_band, 0) {
            out.push(l);
            if m > 0 {
                out.push(l);
            }
        }
        out
    }

    /// Gaussian realization with power spectrum `cl` (indexed by l).
    pub fn synalm<R: Rng + ?Sized>(cl: &[f64], lmax: usize, rng: &mut R) -> Alm {
        let mut alm = Alm::zeros(lmax);
        for m in 0..=lmax {
            for l in m..=lmax {
                let c = cl.get(l).copied().unwrap_or(0.0).max(0.0);
                let value = if m == 0 {
                    Complex64::new(c.sqrt() * rng.sample::<f64, _>(StandardNormal), 0.0)
                } else {
                    let s = (c / 2.0).sqrt();
                    Complex64::new(
                        s * rng.sample::<f64, _>(StandardNormal),
                        s * rng.sample::<f64, _>(StandardNormal),
                    )
                };
                alm.set(l, m, value);
            }
        }
        alm
    }

    /// Analysis of a map (invalid pixels zero-filled) with `iterations`
    /// Jacobi refinement steps.
    pub fn from_map(map: &PixelMap, lmax: usize, iterations: usize) -> Alm {
        let values = map.zero_filled();
        let transform = RingTransform::new(*map.healpix());
        let mut alm = transform.map2alm(&values, lmax);
        for _ in 0..iterations {
            let synth = transform.alm2map(&alm);
            let residual: Vec<f64> = values.iter().zip(&synth).map(|(v, s)| v - s).collect();
            let correction = transform.map2alm(&residual, lmax);
            for (a, c) in alm.coeffs.iter_mut().zip(&correction.coeffs) {
                *a += *c;
            }
        }
        alm
    }

    /// Synthesize the field at `nside`.
    pub fn to_map(&self, nside: u32) -> Result<PixelMap> {
        let healpix = Healpix::new(nside)?;
        let values = RingTransform::new(healpix).alm2map(self);
        PixelMap::new(nside, values)
    }
}

// ---------------------------------------------------------------------------
// Ring transforms
// ---------------------------------------------------------------------------

/// Normalized associated Legendre values `λ_lm(z)` for all `(l, m)` in alm order.
///
/// `Y_lm(θ, φ) = λ_lm(cos θ) e^{imφ}`, Condon-Shortley phase included.
pub fn normalized_legendre(lmax: usize, z: f64, out: &mut [f64]) {
    let s = (1.0 - z * z).max(0.0).sqrt();
    let mut pmm = (1.0 / (4.0 * PI)).sqrt();
    for m in 0..=lmax {
        let mf = m as f64;
        if m > 0 {
            pmm *= -((2.0 * mf + 1.0) / (2.0 * mf)).sqrt() * s;
        }
        let base = alm_index(lmax, m, m);
        out[base] = pmm;
        if m == lmax {
            break;
        }
        let mut p_prev = pmm;
        let mut p_cur = (2.0 * mf + 3.0).sqrt() * z * pmm;
        out[base + 1] = p_cur;
        for l in m + 2..=lmax {
            let lf = l as f64;
            let a = ((4.0 * lf * lf - 1.0) / (lf * lf - mf * mf)).sqrt();
            let lm1 = lf - 1.0;
            let b = ((lm1 * lm1 - mf * mf) / (4.0 * lm1 * lm1 - 1.0)).sqrt();
            let p_next = a * (z * p_cur - b * p_prev);
            out[base + l - m] = p_next;
            p_prev = p_cur;
            p_cur = p_next;
        }
    }
}

struct RingTransform {
    healpix: Healpix,
    rings: Vec<Ring>,
}

impl RingTransform {
    fn new(healpix: Healpix) -> Self {
        Self {
            rings: healpix.rings(),
            healpix,
        }
    }

    fn map2alm(&self, values: &[f64], lmax: usize) -> Alm {
        let mut alm = Alm::zeros(lmax);
        let mut lambda = vec![0.0; alm_size(lmax)];
        let mut planner = FftPlanner::<f64>::new();
        let omega = self.healpix.pixel_area();

        for ring in &self.rings {
            let n = ring.len();
            let fft = planner.plan_fft_forward(n);
            let mut buffer: Vec<Complex64> = ring
                .pixels
                .iter()
                .map(|&p| Complex64::new(values[p], 0.0))
                .collect();
            fft.process(&mut buffer);

            normalized_legendre(lmax, ring.z, &mut lambda);
            for m in 0..=lmax {
                let fm = buffer[m % n] * Complex64::from_polar(omega, -(m as f64) * ring.phi0);
                let base = alm_index(lmax, m, m);
                for l in m..=lmax {
                    alm.coeffs[base + l - m] += fm * lambda[base + l - m];
                }
            }
        }
        alm
    }

    fn alm2map(&self, alm: &Alm) -> Vec<f64> {
        let lmax = alm.lmax;
        let mut values = vec![0.0; self.healpix.npix()];
        let mut lambda = vec![0.0; alm_size(lmax)];
        let mut planner = FftPlanner::<f64>::new();

        for ring in &self.rings {
            let n = ring.len();
            let ifft = planner.plan_fft_inverse(n);
            let mut buffer = vec![Complex64::new(0.0, 0.0); n];

            normalized_legendre(lmax, ring.z, &mut lambda);
            for m in 0..=lmax {
                let base = alm_index(lmax, m, m);
                let mut gm = Complex64::new(0.0, 0.0);
                for l in m..=lmax {
                    gm += alm.coeffs[base + l - m] * lambda[base + l - m];
                }
                let weight = if m == 0 { 1.0 } else { 2.0 };
                buffer[m % n] += gm * Complex64::from_polar(weight, m as f64 * ring.phi0);
            }
            ifft.process(&mut buffer);
            for (j, &p) in ring.pixels.iter().enumerate() {
                values[p] = buffer[j].re;
            }
        }
        values
    }
}

/// Power spectrum `C_l = amplitude / l^index` for `l ≥ 2`, zero below.
pub fn power_law_cl(lmax: usize, amplitude: f64, index: f64) -> Vec<f64> {
    (0..=lmax)
        .map(|l| if l < 2 { 0.0 } else { amplitude / (l as f64).powf(index) })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_index_layout() {
        assert_eq!(alm_size(2), 6);
        assert_eq!(alm_index(2, 0, 0), 0);
        assert_eq!(alm_index(2, 2, 0), 2);
        assert_eq!(alm_index(2, 1, 1), 3);
        assert_eq!(alm_index(2, 2, 2), 5);
    }

    #[test]
    fn test_monopole_synthesis() {
        let mut alm = Alm::zeros(4);
        alm.set(0, 0, Complex64::new((4.0 * PI).sqrt(), 0.0));
        let map = alm.to_map(4).unwrap();
        assert!(map.values().iter().all(|v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_low_order_harmonics() {
        let mut alm = Alm::zeros(3);
        alm.set(1, 1, Complex64::new(1.0, 0.0));
        let map = alm.to_map(8).unwrap();
        let hp = *map.healpix();
        let norm = -2.0 * (3.0 / (8.0 * PI)).sqrt();
        for p in 0..hp.npix() {
            let (theta, phi) = hp.pix2ang(p);
            let expected = norm * theta.sin() * phi.cos();
            assert!((map.values()[p] - expected).abs() < 1e-10, "pix {p}");
        }
    }

    #[test]
    fn test_analysis_recovers_dipole() {
        let map = PixelMap::from_fn(16, |t, _| t.cos()).unwrap();
        let alm = Alm::from_map(&map, 8, 3);
        let a10 = alm.get(1, 0);
        assert!((a10.re - (4.0 * PI / 3.0).sqrt()).abs() < 1e-3, "a10 = {a10}");
        assert!(a10.im.abs() < 1e-9);
        assert!(alm.get(2, 1).norm() < 1e-3);
    }

    #[test]
    fn test_round_trip_band_limited() {
        let mut rng = StdRng::seed_from_u64(9);
        let cl = power_law_cl(12, 1.0, 2.0);
        let alm = Alm::synalm(&cl, 12, &mut rng);
        let map = alm.to_map(16).unwrap();
        let back = Alm::from_map(&map, 12, 3);
        let rms: f64 = alm.coeffs().iter().map(|a| a.norm_sqr()).sum::<f64>().sqrt();
        let err: f64 = alm
            .coeffs()
            .iter()
            .zip(back.coeffs())
            .map(|(a, b)| (a - b).norm_sqr())
            .sum::<f64>()
            .sqrt();
        assert!(err / rms < 1e-2, "relative error {}", err / rms);
    }

    #[test]
    fn test_randomize_phases_keeps_power() {
        let mut rng = StdRng::seed_from_u64(1);
        let alm = Alm::synalm(&power_law_cl(10, 1.0, 2.0), 10, &mut rng);
        let shuffled = alm.randomize_phases(&mut rng);
        for (a, b) in alm.power_spectrum().iter().zip(shuffled.power_spectrum()) {
            assert!((a - b).abs() < 1e-12);
        }
        assert_ne!(alm, shuffled);
    }

    #[test]
    fn test_real_vector_preserves_norm() {
        let mut rng = StdRng::seed_from_u64(2);
        let alm = Alm::synalm(&power_law_cl(6, 1.0, 0.0), 6, &mut rng);
        let v = alm.to_real_vector(0, 6);
        let norm_v: f64 = v.iter().map(|x| x * x).sum();
        let norm_a: f64 = alm
            .power_spectrum()
            .iter()
            .enumerate()
            .map(|(l, c)| (2 * l + 1) as f64 * c)
            .sum();
        assert!((norm_v - norm_a).abs() < 1e-9);
        assert_eq!(v.len(), alm.real_vector_multipoles(0, 6).len());
    }

    #[test]
    fn test_add_scaled_requires_same_lmax() {
        let a = Alm::zeros(4);
        let b = Alm::zeros(5);
        assert!(a.add_scaled(&b, 1.0).is_err());
    }
}
