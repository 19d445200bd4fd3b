//! Statistic Engine.
//!
//! Reduces Record/Context pairs to one scalar per track and, in a separate
//! step, converts that scalar to a calibrated significance against an
//! empirical null ensemble. A statistic never carries a significance unless
//! a [`Calibration`] was supplied.

use log::{debug, warn};
use pbc_stats::{NullDistribution, Significance, Tail};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::context::ContextVector;
use crate::error::{AuditError, Result};
use crate::harmonic::Alm;
use crate::pixel::PixelMap;

// ═══════════════════════════════════════════════════════════════════════════════
// Statistic kinds and configuration
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticKind {
    /// Weighted phase alignment in harmonic space.
    SGamma,
    /// Variance of the alignment under rotations over its variance under relabelings.
    RotationalSurplus,
    /// Difference of two weighted estimates of one catalog quantity.
    CommutatorDz,
    /// Dual-posterior coupling amplitude in pixel space.
    CouplingAmplitude,
}

impl StatisticKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SGamma => "s_gamma",
            Self::RotationalSurplus => "rotational_surplus",
            Self::CommutatorDz => "commutator_dz",
            Self::CouplingAmplitude => "coupling_amplitude",
        }
    }

    /// Which tail counts as extreme unless configured otherwise.
    pub fn default_tail(&self) -> Tail {
        match self {
            Self::SGamma | Self::RotationalSurplus => Tail::Upper,
            Self::CommutatorDz | Self::CouplingAmplitude => Tail::TwoSided,
        }
    }
}

impl std::fmt::Display for StatisticKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Null ensembles smaller than this are flagged undersized.
    pub min_ensemble: usize,
    /// Jarque-Bera level the null must pass before Gaussian z-scores are used.
    pub gaussianity_alpha: f64,
    /// Fewest multipoles a phase-alignment band may contain.
    pub min_multipoles: usize,
    /// Tail override; `None` uses the statistic's default.
    pub tail: Option<Tail>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_ensemble: 100,
            gaussianity_alpha: 0.001,
            min_multipoles: 8,
            tail: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// 1. PHASE ALIGNMENT (S_gamma)
// ═══════════════════════════════════════════════════════════════════════════════

/// Multipole band of a harmonic statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    pub lmin: usize,
    pub lmax: usize,
    /// Include the real `m = 0` coefficients (phase 0 or π).
    #[serde(default = "default_include_m0")]
    pub include_m0: bool,
}

fn default_include_m0() -> bool {
    true
}

impl Band {
    pub fn new(lmin: usize, lmax: usize) -> Self {
        Self {
            lmin,
            lmax,
            include_m0: true,
        }
    }

    /// Number of multipoles the band covers for coefficients up to `alm_lmax`.
    pub fn multipoles(&self, alm_lmax: usize) -> usize {
        let top = self.lmax.min(alm_lmax);
        if top < self.lmin { 0 } else { top - self.lmin + 1 }
    }
}

/// `S_γ = Σ |c_lm| cos(arg r_lm − arg c_lm) / Σ |c_lm|` over the band.
pub fn phase_alignment(record: &Alm, context: &Alm, band: &Band, min_multipoles: usize) -> Result<f64> {
    if record.lmax() != context.lmax() {
        return Err(AuditError::dims("alm lmax", context.lmax(), record.lmax()));
    }
    let available = band.multipoles(record.lmax());
    if available < min_multipoles.max(1) {
        return Err(AuditError::InsufficientBandwidth {
            available,
            required: min_multipoles.max(1),
        });
    }
    let m_min = if band.include_m0 { 0 } else { 1 };
    let rec = record.band(band.lmin, band.lmax, m_min);
    let ctx = context.band(band.lmin, band.lmax, m_min);
    let phases_r: Vec<f64> = rec.iter().map(|(_, _, a)| a.arg()).collect();
    let phases_c: Vec<f64> = ctx.iter().map(|(_, _, a)| a.arg()).collect();
    let weights: Vec<f64> = ctx.iter().map(|(_, _, a)| a.norm()).collect();
    pbc_stats::weighted_mean_cosine(&phases_r, &phases_c, &weights)
        .ok_or_else(|| AuditError::degenerate("context alm", "no power in band"))
}

// ═══════════════════════════════════════════════════════════════════════════════
// 2. ROTATIONAL SURPLUS
// ═══════════════════════════════════════════════════════════════════════════════

/// Rotation angles about the polar axis; always starts at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "schedule", rename_all = "snake_case")]
pub enum RotationSchedule {
    /// `2π i / count` for `i = 0..count`.
    Even { count: usize },
    /// 0 followed by `count − 1` seeded uniform angles.
    Seeded { count: usize, seed: u64 },
}

impl RotationSchedule {
    pub fn count(&self) -> usize {
        match *self {
            Self::Even { count } | Self::Seeded { count, .. } => count,
        }
    }

    pub fn angles(&self) -> Vec<f64> {
        use rand::Rng;
        let tau = std::f64::consts::TAU;
        match *self {
            Self::Even { count } => (0..count).map(|i| tau * i as f64 / count as f64).collect(),
            Self::Seeded { count, seed } => {
                let mut rng = StdRng::seed_from_u64(seed);
                std::iter::once(0.0)
                    .chain((1..count).map(|_| tau * rng.random::<f64>()))
                    .take(count)
                    .collect()
            }
        }
    }
}

/// Alignment profile of a rotation audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationProfile {
    pub angles: Vec<f64>,
    /// `A(α)`: Pearson correlation of record and rotated context.
    pub alignment: Vec<f64>,
    /// Alignment under seeded relabelings of the record.
    pub relabel_alignment: Vec<f64>,
    /// `1 − A(α)/A(0)` per angle.
    pub decoherence: Vec<f64>,
    pub surplus: f64,
}

fn alignment(record: &PixelMap, context: &PixelMap) -> Result<f64> {
    let (a, b): (Vec<f64>, Vec<f64>) = (0..record.len())
        .filter(|&p| record.is_valid(p) && context.is_valid(p))
        .map(|p| (record.values()[p], context.values()[p]))
        .unzip();
    pbc_stats::pearson(&a, &b).ok_or_else(|| {
        AuditError::degenerate("rotation alignment", format!("{} joint pixels without variance", a.len()))
    })
}

/// Rotational surplus `var_α A(α) / var_j A(perm_j)`.
pub fn rotational_surplus(
    record: &PixelMap,
    context: &ContextVector,
    schedule: &RotationSchedule,
    relabelings: usize,
    seed: u64,
) -> Result<RotationProfile> {
    if schedule.count() < 2 || relabelings < 2 {
        return Err(AuditError::config(format!(
            "rotation audit needs at least 2 angles and 2 relabelings, got {} and {relabelings}",
            schedule.count()
        )));
    }
    let ctx_map = context.to_map()?;
    record.ensure_same_resolution(&ctx_map, "rotation context")?;
    let angles = schedule.angles();
    let profile: Vec<f64> = angles
        .iter()
        .map(|&angle| alignment(record, &ctx_map.rotate_azimuth(angle)))
        .collect::<Result<_>>()?;

    let joint: Vec<usize> = (0..record.len())
        .filter(|&p| record.is_valid(p) && ctx_map.is_valid(p))
        .collect();
    let ctx_values: Vec<f64> = joint.iter().map(|&p| ctx_map.values()[p]).collect();
    let mut shuffled: Vec<f64> = joint.iter().map(|&p| record.values()[p]).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut relabel = Vec::with_capacity(relabelings);
    for _ in 0..relabelings {
        shuffled.shuffle(&mut rng);
        relabel.push(
            pbc_stats::pearson(&shuffled, &ctx_values)
                .ok_or_else(|| AuditError::degenerate("relabeled record", "no variance"))?,
        );
    }

    let var_rot = pbc_stats::variance(&profile, 1).unwrap_or(0.0);
    let var_perm = pbc_stats::variance(&relabel, 1).unwrap_or(0.0);
    if !(var_perm > 0.0) {
        return Err(AuditError::degenerate("relabeled record", "zero relabeling variance"));
    }
    let a0 = profile[0];
    let decoherence = profile
        .iter()
        .map(|a| if a0 != 0.0 { 1.0 - a / a0 } else { 0.0 })
        .collect();
    let surplus = var_rot / var_perm;
    debug!(
        "Rotational surplus {surplus:.4} over {} angles, {relabelings} relabelings",
        angles.len()
    );
    Ok(RotationProfile {
        angles,
        alignment: profile,
        relabel_alignment: relabel,
        decoherence,
        surplus,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// 3. COMMUTATOR Δz
// ═══════════════════════════════════════════════════════════════════════════════

/// Objects with one measured quantity and two competing weight sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub values: Vec<f64>,
    /// Weights of the first ordering (e.g. systematics-corrected first).
    pub weights_a: Vec<f64>,
    /// Weights of the second ordering (e.g. completeness-corrected first).
    pub weights_b: Vec<f64>,
}

impl Catalog {
    pub fn new(values: Vec<f64>, weights_a: Vec<f64>, weights_b: Vec<f64>) -> Result<Self> {
        let catalog = Self {
            values,
            weights_a,
            weights_b,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.values.len();
        if self.weights_a.len() != n {
            return Err(AuditError::dims("catalog weights_a", n, self.weights_a.len()));
        }
        if self.weights_b.len() != n {
            return Err(AuditError::dims("catalog weights_b", n, self.weights_b.len()));
        }
        if n < 2 {
            return Err(AuditError::degenerate("catalog", format!("{n} objects")));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Standardized `ln(w_b / w_a)`: the per-object context differential.
    pub fn context_vector(&self) -> Result<Vec<f64>> {
        let logs: Vec<f64> = self
            .weights_a
            .iter()
            .zip(&self.weights_b)
            .map(|(a, b)| if *a > 0.0 && *b > 0.0 { (b / a).ln() } else { 0.0 })
            .collect();
        let mean = pbc_stats::mean(&logs).unwrap_or(0.0);
        let sd = pbc_stats::std_dev(&logs, 0).unwrap_or(0.0);
        if !(sd > 1e-12) {
            return Err(AuditError::degenerate("catalog weights", "w_b / w_a is constant"));
        }
        Ok(logs.iter().map(|v| (v - mean) / sd).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommutatorMode {
    #[default]
    Signed,
    Absolute,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommutatorResult {
    pub estimate_a: f64,
    pub estimate_b: f64,
    pub delta: f64,
    /// `std(w_b / w_a)`.
    pub tension: f64,
}

/// Difference between the two orderings' weighted estimates.
pub fn commutator(catalog: &Catalog, mode: CommutatorMode) -> Result<CommutatorResult> {
    catalog.validate()?;
    let estimate_a = pbc_stats::weighted_mean(&catalog.values, &catalog.weights_a)
        .ok_or_else(|| AuditError::degenerate("catalog weights_a", "weights sum to zero"))?;
    let estimate_b = pbc_stats::weighted_mean(&catalog.values, &catalog.weights_b)
        .ok_or_else(|| AuditError::degenerate("catalog weights_b", "weights sum to zero"))?;
    let ratios: Vec<f64> = catalog
        .weights_a
        .iter()
        .zip(&catalog.weights_b)
        .filter(|(a, _)| **a != 0.0)
        .map(|(a, b)| b / a)
        .collect();
    let tension = pbc_stats::std_dev(&ratios, 0).unwrap_or(0.0);
    let diff = estimate_a - estimate_b;
    let delta = match mode {
        CommutatorMode::Signed => diff,
        CommutatorMode::Absolute => diff.abs(),
    };
    Ok(CommutatorResult {
        estimate_a,
        estimate_b,
        delta,
        tension,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// 4. CALIBRATED SIGNIFICANCE
// ═══════════════════════════════════════════════════════════════════════════════

/// Empirical null of one statistic, produced by a null ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub kind: StatisticKind,
    pub tail: Tail,
    pub null: NullDistribution,
}

impl Calibration {
    pub fn from_samples(kind: StatisticKind, samples: &[f64], config: &EngineConfig) -> Result<Self> {
        let null = NullDistribution::from_samples(samples, config.gaussianity_alpha).ok_or_else(|| {
            AuditError::CalibrationMissing {
                track: "null ensemble".into(),
                statistic: format!("{kind} ({} usable samples)", samples.len()),
            }
        })?;
        Ok(Self {
            kind,
            tail: config.tail.unwrap_or_else(|| kind.default_tail()),
            null,
        })
    }

    pub fn ensemble_size(&self) -> usize {
        self.null.len()
    }

    pub fn significance(&self, value: f64) -> Significance {
        self.null.significance(value, self.tail)
    }

    /// Whether `value` exceeds `threshold` σ in the calibrated tail.
    pub fn detects(&self, value: f64, threshold: f64) -> bool {
        let sig = self.significance(value);
        match self.tail {
            Tail::Upper => sig.sigma > threshold,
            Tail::TwoSided => sig.sigma.abs() > threshold,
        }
    }
}

/// One track's statistic, with its significance once calibrated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackStatistic {
    pub track: String,
    pub kind: StatisticKind,
    pub value: f64,
    pub significance: Option<Significance>,
    pub ensemble_size: usize,
    /// Calibrated with fewer null realizations than the configured minimum.
    pub undersized: bool,
}

impl TrackStatistic {
    pub fn sigma(&self) -> Option<f64> {
        self.significance.map(|s| s.sigma)
    }

    pub fn is_calibrated(&self) -> bool {
        self.significance.is_some()
    }
}

/// Stateless front end over the statistics above.
#[derive(Debug, Clone, Default)]
pub struct StatisticEngine {
    pub config: EngineConfig,
}

impl StatisticEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn s_gamma(&self, record: &Alm, context: &Alm, band: &Band) -> Result<f64> {
        phase_alignment(record, context, band, self.config.min_multipoles)
    }

    /// Statistic value without a significance.
    pub fn measure(&self, track: &str, kind: StatisticKind, value: f64) -> TrackStatistic {
        TrackStatistic {
            track: track.to_string(),
            kind,
            value,
            significance: None,
            ensemble_size: 0,
            undersized: false,
        }
    }

    /// Convert `value` to a σ-equivalent against `calibration`.
    pub fn assess(
        &self,
        track: &str,
        kind: StatisticKind,
        value: f64,
        calibration: Option<&Calibration>,
    ) -> Result<TrackStatistic> {
        let calibration = calibration
            .filter(|c| c.kind == kind)
            .ok_or_else(|| AuditError::CalibrationMissing {
                track: track.to_string(),
                statistic: kind.name().to_string(),
            })?;
        let significance = calibration.significance(value);
        let ensemble_size = calibration.ensemble_size();
        let undersized = ensemble_size < self.config.min_ensemble;
        if undersized {
            warn!(
                "Track {track}: {kind} calibrated on {ensemble_size} realizations (< {}); significance is imprecise",
                self.config.min_ensemble
            );
        }
        debug!(
            "Track {track}: {kind} = {value:.6} → {:.3}σ ({:?}{})",
            significance.sigma,
            significance.method,
            if significance.lower_bound { ", lower bound" } else { "" }
        );
        Ok(TrackStatistic {
            track: track.to_string(),
            kind,
            value,
            significance: Some(significance),
            ensemble_size,
            undersized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harmonic::power_law_cl;
    use pbc_stats::SignificanceMethod;
    use rand::SeedableRng;

    fn flat_alm(lmax: usize, seed: u64) -> Alm {
        let mut rng = StdRng::seed_from_u64(seed);
        Alm::synalm(&power_law_cl(lmax, 1.0, 0.0), lmax, &mut rng)
    }

    #[test]
    fn test_s_gamma_identity_and_inversion() {
        let ctx = flat_alm(10, 1);
        let band = Band::new(2, 10);
        assert!((phase_alignment(&ctx, &ctx, &band, 4).unwrap() - 1.0).abs() < 1e-12);
        let neg = ctx.scaled(-1.0);
        assert!((phase_alignment(&neg, &ctx, &band, 4).unwrap() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_s_gamma_null_is_near_zero() {
        let ctx = flat_alm(32, 3);
        let band = Band::new(2, 32);
        let mean: f64 = (0..50)
            .map(|i| phase_alignment(&flat_alm(32, 100 + i), &ctx, &band, 8).unwrap())
            .sum::<f64>()
            / 50.0;
        assert!(mean.abs() < 0.03, "null mean {mean}");
    }

    #[test]
    fn test_s_gamma_band_checks() {
        let a = flat_alm(10, 1);
        let b = flat_alm(12, 2);
        assert_eq!(
            phase_alignment(&a, &b, &Band::new(2, 10), 4).unwrap_err().kind(),
            "dimension_mismatch"
        );
        let err = phase_alignment(&a, &a, &Band::new(8, 10), 8).unwrap_err();
        assert!(matches!(
            err,
            AuditError::InsufficientBandwidth {
                available: 3,
                required: 8
            }
        ));
    }

    #[test]
    fn test_rotation_schedules_start_at_zero() {
        let even = RotationSchedule::Even { count: 4 }.angles();
        assert_eq!(even.len(), 4);
        assert_eq!(even[0], 0.0);
        assert!((even[1] - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
        let seeded = RotationSchedule::Seeded { count: 5, seed: 7 };
        assert_eq!(seeded.angles(), seeded.angles());
        assert_eq!(seeded.angles()[0], 0.0);
    }

    #[test]
    fn test_rotational_surplus_locked_vs_symmetric() {
        use crate::context::{CombinationRule, ContextRequest, ContextSpec, build_context};
        let nside = 8;
        // Context with azimuthal structure; record locked to it.
        let scan = PixelMap::from_fn(nside, |t, p| (2.0 * p).cos() * t.sin() + 0.2 * t.cos()).unwrap();
        let spec = ContextSpec::new(nside, CombinationRule::WeightedSum { weights: vec![1.0] });
        let ctx = build_context(&ContextRequest::new(&[scan.clone()], &spec)).unwrap();
        let locked = rotational_surplus(&scan, &ctx, &RotationSchedule::Even { count: 8 }, 50, 1).unwrap();
        assert!((locked.alignment[0] - 1.0).abs() < 1e-9);
        assert!(locked.surplus > 10.0, "surplus {}", locked.surplus);
        assert_eq!(locked.decoherence[0], 0.0);
        // Record depending only on latitude: rotations change nothing.
        let polar = PixelMap::from_fn(nside, |t, _| t.cos()).unwrap();
        let flat = rotational_surplus(&polar, &ctx, &RotationSchedule::Even { count: 8 }, 50, 1).unwrap();
        assert!(flat.surplus < locked.surplus);
    }

    #[test]
    fn test_commutator_modes_and_tension() {
        let cat = Catalog::new(
            vec![0.5, 1.0],
            vec![1.0, 1.0],
            vec![1.0, 3.0],
        )
        .unwrap();
        let signed = commutator(&cat, CommutatorMode::Signed).unwrap();
        assert!((signed.estimate_a - 0.75).abs() < 1e-12);
        assert!((signed.estimate_b - 0.875).abs() < 1e-12);
        assert!((signed.delta + 0.125).abs() < 1e-12);
        assert!((signed.tension - 1.0).abs() < 1e-12);
        let abs = commutator(&cat, CommutatorMode::Absolute).unwrap();
        assert!((abs.delta - 0.125).abs() < 1e-12);
        assert!(Catalog::new(vec![1.0, 2.0], vec![1.0], vec![1.0, 1.0]).is_err());
    }

    #[test]
    fn test_assess_requires_calibration() {
        let engine = StatisticEngine::default();
        let err = engine.assess("P1", StatisticKind::SGamma, 0.1, None).unwrap_err();
        assert_eq!(err.kind(), "calibration_missing");
        let samples: Vec<f64> = (0..200).map(|i| ((i * 37 % 200) as f64 - 100.0) / 1000.0).collect();
        let cal = Calibration::from_samples(StatisticKind::CommutatorDz, &samples, &engine.config).unwrap();
        let err = engine.assess("P1", StatisticKind::SGamma, 0.1, Some(&cal)).unwrap_err();
        assert_eq!(err.kind(), "calibration_missing");
    }

    #[test]
    fn test_assess_flags_undersized_and_lower_bound() {
        let engine = StatisticEngine::default();
        let samples: Vec<f64> = (0..20).map(|i| (i as f64).powi(3)).collect();
        let cal = Calibration::from_samples(StatisticKind::SGamma, &samples, &engine.config).unwrap();
        let stat = engine.assess("P1", StatisticKind::SGamma, 1e9, Some(&cal)).unwrap();
        assert!(stat.undersized);
        assert_eq!(stat.ensemble_size, 20);
        let sig = stat.significance.unwrap();
        assert_eq!(sig.method, SignificanceMethod::EmpiricalRank);
        assert!(sig.lower_bound);
        assert!((sig.p_value - 1.0 / 21.0).abs() < 1e-12);
    }
}
