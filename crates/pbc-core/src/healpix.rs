//! HEALPix geometry in NESTED ordering.
//!
//! Pixel ids follow the nested scheme: the 12 base faces are subdivided
//! hierarchically, so the four children of pixel `p` at `nside` are
//! `4p..4p+4` at `2·nside`, and degrading by a factor `2^d` is a right shift
//! by `2d` bits.

use std::f64::consts::{FRAC_PI_2, PI};

use crate::error::{AuditError, Result};

const JRLL: [i64; 12] = [2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4];
const JPLL: [i64; 12] = [1, 3, 5, 7, 0, 2, 4, 6, 1, 3, 5, 7];

/// Largest supported resolution (pixel ids stay well inside `u64`).
pub const MAX_NSIDE: u32 = 1 << 13;

/// Validated HEALPix resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Healpix {
    nside: u32,
    order: u32,
}

/// One iso-latitude ring of pixels.
#[derive(Debug, Clone)]
pub struct Ring {
    /// 1-based ring index, north to south.
    pub index: usize,
    pub z: f64,
    /// Longitude of the first pixel in the ring.
    pub phi0: f64,
    /// Nested pixel ids in order of increasing longitude.
    pub pixels: Vec<usize>,
}

impl Ring {
    pub fn theta(&self) -> f64 {
        self.z.clamp(-1.0, 1.0).acos()
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

impl Healpix {
    /// Validate `nside`: a power of two in `1..=MAX_NSIDE`.
    pub fn new(nside: u32) -> Result<Self> {
        if nside == 0 || !nside.is_power_of_two() || nside > MAX_NSIDE {
            return Err(AuditError::InvalidResolution { nside });
        }
        Ok(Self {
            nside,
            order: nside.trailing_zeros(),
        })
    }

    pub fn nside(&self) -> u32 {
        self.nside
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    /// Pixel count, `12·nside²`.
    pub fn npix(&self) -> usize {
        12 * (self.nside as usize) * (self.nside as usize)
    }

    /// Number of iso-latitude rings, `4·nside − 1`.
    pub fn nrings(&self) -> usize {
        4 * self.nside as usize - 1
    }

    /// Solid angle of one pixel in steradians.
    pub fn pixel_area(&self) -> f64 {
        4.0 * PI / self.npix() as f64
    }

    /// Split a nested id into `(ix, iy, face)`.
    pub fn nest2xyf(&self, pix: usize) -> (i64, i64, usize) {
        let npface = (self.nside as usize) * (self.nside as usize);
        let face = pix / npface;
        let ipf = (pix % npface) as u64;
        (
            compress_bits(ipf) as i64,
            compress_bits(ipf >> 1) as i64,
            face,
        )
    }

    /// Inverse of [`nest2xyf`](Self::nest2xyf).
    pub fn xyf2nest(&self, ix: i64, iy: i64, face: usize) -> usize {
        let npface = (self.nside as usize) * (self.nside as usize);
        face * npface + (spread_bits(ix as u64) | (spread_bits(iy as u64) << 1)) as usize
    }

    /// Ring index (1-based), position within the ring (0-based) and the
    /// ring's `kshift` for a nested pixel.
    fn ring_coords(&self, pix: usize) -> (i64, i64, i64, i64) {
        let ns = self.nside as i64;
        let (ix, iy, face) = self.nest2xyf(pix);
        let jr = JRLL[face] * ns - ix - iy - 1;

        let (nr, kshift) = if jr < ns {
            (jr, 0)
        } else if jr > 3 * ns {
            (4 * ns - jr, 0)
        } else {
            (ns, (jr - ns) & 1)
        };

        let mut jp = (JPLL[face] * nr + ix - iy + 1 + kshift) / 2;
        if jp > 4 * ns {
            jp -= 4 * ns;
        }
        if jp < 1 {
            jp += 4 * nr;
        }
        (jr, jp, nr, kshift)
    }

    /// `(z, φ)` of a pixel centre, `z = cos θ`.
    pub fn pix2zphi(&self, pix: usize) -> (f64, f64) {
        let ns = self.nside as f64;
        let (jr, jp, nr, kshift) = self.ring_coords(pix);
        let nrf = nr as f64;
        let z = if jr < self.nside as i64 {
            1.0 - nrf * nrf / (3.0 * ns * ns)
        } else if jr > 3 * self.nside as i64 {
            nrf * nrf / (3.0 * ns * ns) - 1.0
        } else {
            (2.0 * ns - jr as f64) * 2.0 / (3.0 * ns)
        };
        let phi = (jp as f64 - (kshift as f64 + 1.0) * 0.5) * (FRAC_PI_2 / nrf);
        (z, phi)
    }

    /// `(θ, φ)` of a pixel centre.
    pub fn pix2ang(&self, pix: usize) -> (f64, f64) {
        let (z, phi) = self.pix2zphi(pix);
        (z.clamp(-1.0, 1.0).acos(), phi)
    }

    /// Unit vector of a pixel centre.
    pub fn pix2vec(&self, pix: usize) -> [f64; 3] {
        let (z, phi) = self.pix2zphi(pix);
        let st = (1.0 - z * z).max(0.0).sqrt();
        [st * phi.cos(), st * phi.sin(), z]
    }

    /// 1-based ring index and 0-based position within the ring.
    pub fn pix2ring(&self, pix: usize) -> (usize, usize) {
        let (jr, jp, _, _) = self.ring_coords(pix);
        (jr as usize, (jp - 1) as usize)
    }

    /// Nested pixel containing direction `(θ, φ)`.
    pub fn ang2pix(&self, theta: f64, phi: f64) -> usize {
        self.zphi2pix(theta.cos(), phi)
    }

    /// Nested pixel containing `(z, φ)`.
    pub fn zphi2pix(&self, z: f64, phi: f64) -> usize {
        let ns = self.nside as i64;
        let nsf = self.nside as f64;
        let za = z.abs();
        let tt = (phi / FRAC_PI_2).rem_euclid(4.0);

        if za <= 2.0 / 3.0 {
            let temp1 = nsf * (0.5 + tt);
            let temp2 = nsf * z * 0.75;
            let jp = (temp1 - temp2).floor() as i64;
            let jm = (temp1 + temp2).floor() as i64;
            let ifp = jp >> self.order;
            let ifm = jm >> self.order;
            let face = if ifp == ifm {
                (ifp | 4) as usize
            } else if ifp < ifm {
                ifp as usize
            } else {
                (ifm + 8) as usize
            };
            let ix = jm & (ns - 1);
            let iy = ns - (jp & (ns - 1)) - 1;
            self.xyf2nest(ix, iy, face)
        } else {
            let ntt = (tt.floor() as i64).min(3);
            let tp = tt - ntt as f64;
            let tmp = nsf * (3.0 * (1.0 - za)).sqrt();
            let jp = ((tp * tmp).floor() as i64).min(ns - 1);
            let jm = (((1.0 - tp) * tmp).floor() as i64).min(ns - 1);
            if z >= 0.0 {
                self.xyf2nest(ns - jm - 1, ns - jp - 1, ntt as usize)
            } else {
                self.xyf2nest(jp, jm, (ntt + 8) as usize)
            }
        }
    }

    /// `z` of a 1-based ring.
    pub fn ring_z(&self, ring: usize) -> f64 {
        let ns = self.nside as f64;
        let r = ring as f64;
        let n = self.nside as usize;
        if ring < n {
            1.0 - r * r / (3.0 * ns * ns)
        } else if ring > 3 * n {
            let nr = 4.0 * ns - r;
            nr * nr / (3.0 * ns * ns) - 1.0
        } else {
            (2.0 * ns - r) * 2.0 / (3.0 * ns)
        }
    }

    /// Pixel count of a 1-based ring.
    pub fn ring_npix(&self, ring: usize) -> usize {
        let n = self.nside as usize;
        if ring < n {
            4 * ring
        } else if ring > 3 * n {
            4 * (4 * n - ring)
        } else {
            4 * n
        }
    }

    /// All rings, north to south, with their pixels sorted by longitude.
    pub fn rings(&self) -> Vec<Ring> {
        let nrings = self.nrings();
        let mut pixels: Vec<Vec<usize>> = (1..=nrings)
            .map(|r| vec![usize::MAX; self.ring_npix(r)])
            .collect();
        for pix in 0..self.npix() {
            let (ring, pos) = self.pix2ring(pix);
            pixels[ring - 1][pos] = pix;
        }
        pixels
            .into_iter()
            .enumerate()
            .map(|(i, pixels)| {
                let (_, phi0) = self.pix2zphi(pixels[0]);
                Ring {
                    index: i + 1,
                    z: self.ring_z(i + 1),
                    phi0,
                    pixels,
                }
            })
            .collect()
    }

    /// Parent of `pix` at the coarser resolution `target`.
    pub fn parent(&self, pix: usize, target: &Healpix) -> usize {
        pix >> (2 * (self.order - target.order))
    }
}

/// Interleave the low 32 bits of `v` into the even bit positions.
fn spread_bits(v: u64) -> u64 {
    let mut x = v & 0xffff_ffff;
    x = (x | (x << 16)) & 0x0000_ffff_0000_ffff;
    x = (x | (x << 8)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x << 4)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x << 2)) & 0x3333_3333_3333_3333;
    (x | (x << 1)) & 0x5555_5555_5555_5555
}

/// Gather the even bit positions of `v`.
fn compress_bits(v: u64) -> u64 {
    let mut x = v & 0x5555_5555_5555_5555;
    x = (x | (x >> 1)) & 0x3333_3333_3333_3333;
    x = (x | (x >> 2)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x >> 4)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x >> 8)) & 0x0000_ffff_0000_ffff;
    (x | (x >> 16)) & 0x0000_0000_ffff_ffff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_nside() {
        assert!(Healpix::new(0).is_err());
        assert!(Healpix::new(3).is_err());
        assert!(Healpix::new(MAX_NSIDE * 2).is_err());
        assert_eq!(Healpix::new(16).unwrap().npix(), 3072);
    }

    #[test]
    fn test_bit_interleave_round_trip() {
        for v in [0u64, 1, 2, 7, 255, 1023, 8191] {
            assert_eq!(compress_bits(spread_bits(v)), v);
        }
        assert_eq!(spread_bits(0b11), 0b101);
    }

    #[test]
    fn test_nside1_centres() {
        let hp = Healpix::new(1).unwrap();
        let (z, phi) = hp.pix2zphi(0);
        assert!((z - 2.0 / 3.0).abs() < 1e-12);
        assert!((phi - PI / 4.0).abs() < 1e-12);
        let (z, phi) = hp.pix2zphi(4);
        assert!(z.abs() < 1e-12);
        assert!(phi.abs() < 1e-12);
        let (z, _) = hp.pix2zphi(8);
        assert!((z + 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_ang2pix_inverts_pix2ang() {
        for nside in [1u32, 2, 4, 8, 16] {
            let hp = Healpix::new(nside).unwrap();
            for pix in 0..hp.npix() {
                let (theta, phi) = hp.pix2ang(pix);
                assert_eq!(hp.ang2pix(theta, phi), pix, "nside {nside} pix {pix}");
            }
        }
    }

    #[test]
    fn test_rings_partition_sphere() {
        let hp = Healpix::new(8).unwrap();
        let rings = hp.rings();
        assert_eq!(rings.len(), hp.nrings());
        let total: usize = rings.iter().map(|r| r.len()).sum();
        assert_eq!(total, hp.npix());
        for ring in &rings {
            assert!(ring.pixels.iter().all(|&p| p < hp.npix()));
            let step = 2.0 * PI / ring.len() as f64;
            for (j, &p) in ring.pixels.iter().enumerate() {
                let (z, phi) = hp.pix2zphi(p);
                assert!((z - ring.z).abs() < 1e-12);
                let expected = ring.phi0 + j as f64 * step;
                assert!((phi - expected).abs() < 1e-9, "ring {} pos {j}", ring.index);
            }
        }
    }

    #[test]
    fn test_parent_contains_children() {
        let fine = Healpix::new(8).unwrap();
        let coarse = Healpix::new(2).unwrap();
        for pix in 0..fine.npix() {
            let (theta, phi) = fine.pix2ang(pix);
            // The coarse pixel containing the fine centre is the nested parent.
            assert_eq!(coarse.ang2pix(theta, phi), fine.parent(pix, &coarse));
        }
    }

    #[test]
    fn test_equal_area_mean_z_is_zero() {
        let hp = Healpix::new(4).unwrap();
        let mean_z: f64 = (0..hp.npix()).map(|p| hp.pix2zphi(p).0).sum::<f64>() / hp.npix() as f64;
        assert!(mean_z.abs() < 1e-12);
    }
}
