//! Coupling Estimator (dual posterior).
//!
//! Bayesian linear regression of a Record `d` (length n) on k context
//! templates `C` (n×k):
//!
//! ```text
//! d = C λ + n,    λ ~ N(μ₀, Λ₀⁻¹),    n ~ N(0, D + W Wᵀ)
//! ```
//!
//! with `D` diagonal and `W` n×r. The noise inverse is applied through the
//! Woodbury identity
//!
//! ```text
//! N⁻¹ = D⁻¹ − D⁻¹W (I + WᵀD⁻¹W)⁻¹ WᵀD⁻¹
//! ```
//!
//! so only k×k, r×r, r×k, k×n and r×n products are ever formed. The posterior
//! precision is `Q = Λ₀ + CᵀN⁻¹C` and the mean `Q⁻¹(Λ₀μ₀ + CᵀN⁻¹d)`.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::context::ContextVector;
use crate::error::{AuditError, NumericalWarning, Result};
use crate::linalg::{check_spd, spd_inverse, symmetrize};
use crate::pixel::PixelMap;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Rank caps and conditioning threshold of the estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DualConfig {
    /// Largest accepted template count k.
    pub max_templates: usize,
    /// Largest accepted low-rank noise rank r.
    pub max_noise_rank: usize,
    /// Condition number of the posterior precision or of the Woodbury core
    /// above which the result is flagged low-confidence.
    pub condition_threshold: f64,
    /// Template variance (about its mean) at or below which a template is
    /// degenerate.
    pub degenerate_tolerance: f64,
}

impl Default for DualConfig {
    fn default() -> Self {
        Self {
            max_templates: 8,
            max_noise_rank: 32,
            condition_threshold: 1e8,
            degenerate_tolerance: 1e-12,
        }
    }
}

// ---------------------------------------------------------------------------
// Noise model and prior
// ---------------------------------------------------------------------------

/// Noise covariance `D + W Wᵀ`.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseModel {
    diagonal: Vec<f64>,
    low_rank: Vec<Vec<f64>>,
}

impl NoiseModel {
    /// Diagonal noise; every entry must be finite and positive.
    pub fn diagonal(diagonal: Vec<f64>) -> Result<Self> {
        if let Some((i, v)) = diagonal
            .iter()
            .enumerate()
            .find(|(_, v)| !v.is_finite() || **v <= 0.0)
        {
            return Err(AuditError::InvalidNoiseModel {
                reason: format!("diagonal entry {i} is {v}, must be positive"),
            });
        }
        Ok(Self {
            diagonal,
            low_rank: Vec::new(),
        })
    }

    /// Uniform white noise of the given variance.
    pub fn white(n: usize, variance: f64) -> Result<Self> {
        Self::diagonal(vec![variance; n])
    }

    /// Add low-rank columns `W` (each of length n).
    pub fn with_low_rank(mut self, columns: Vec<Vec<f64>>) -> Result<Self> {
        for col in &columns {
            if col.len() != self.diagonal.len() {
                return Err(AuditError::dims(
                    "noise low-rank column",
                    self.diagonal.len(),
                    col.len(),
                ));
            }
            if col.iter().any(|v| !v.is_finite()) {
                return Err(AuditError::InvalidNoiseModel {
                    reason: "low-rank column has non-finite entries".into(),
                });
            }
        }
        self.low_rank = columns;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.diagonal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagonal.is_empty()
    }

    /// Rank r of the low-rank part.
    pub fn rank(&self) -> usize {
        self.low_rank.len()
    }

    pub fn diagonal_values(&self) -> &[f64] {
        &self.diagonal
    }

    pub fn low_rank_columns(&self) -> &[Vec<f64>] {
        &self.low_rank
    }

    /// Noise restricted to the given sample indices.
    pub fn restrict(&self, indices: &[usize]) -> NoiseModel {
        NoiseModel {
            diagonal: indices.iter().map(|&i| self.diagonal[i]).collect(),
            low_rank: self
                .low_rank
                .iter()
                .map(|col| indices.iter().map(|&i| col[i]).collect())
                .collect(),
        }
    }

    /// Dense n×n covariance. Only meant for small cross-checks.
    pub fn to_dense(&self) -> DMatrix<f64> {
        let n = self.diagonal.len();
        let mut m = DMatrix::from_diagonal(&DVector::from_column_slice(&self.diagonal));
        if !self.low_rank.is_empty() {
            let w = DMatrix::from_fn(n, self.low_rank.len(), |i, j| self.low_rank[j][i]);
            m += &w * w.transpose();
        }
        m
    }
}

/// Gaussian prior on the k coupling amplitudes, stored as mean and precision.
#[derive(Debug, Clone, PartialEq)]
pub struct Prior {
    mean: DVector<f64>,
    precision: DMatrix<f64>,
}

impl Prior {
    /// Flat prior: zero precision.
    pub fn uninformative(k: usize) -> Self {
        Self {
            mean: DVector::zeros(k),
            precision: DMatrix::zeros(k, k),
        }
    }

    /// Zero-mean prior with covariance `variance · I`.
    pub fn isotropic(k: usize, variance: f64) -> Result<Self> {
        if !(variance.is_finite() && variance > 0.0) {
            return Err(AuditError::config(format!(
                "prior variance must be positive, got {variance}"
            )));
        }
        Ok(Self {
            mean: DVector::zeros(k),
            precision: DMatrix::identity(k, k) / variance,
        })
    }

    /// Prior from a mean and a full covariance matrix (row-major rows).
    pub fn gaussian(mean: Vec<f64>, covariance: &[Vec<f64>]) -> Result<Self> {
        let k = mean.len();
        if covariance.len() != k || covariance.iter().any(|row| row.len() != k) {
            return Err(AuditError::dims("prior covariance", k, covariance.len()));
        }
        let cov = DMatrix::from_fn(k, k, |i, j| covariance[i][j]);
        check_spd(&cov, "prior covariance")?;
        Ok(Self {
            mean: DVector::from_vec(mean),
            precision: spd_inverse(&cov, "prior covariance")?,
        })
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn precision(&self) -> &DMatrix<f64> {
        &self.precision
    }
}

// ---------------------------------------------------------------------------
// Posterior
// ---------------------------------------------------------------------------

/// Posterior over the coupling amplitudes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouplingPosterior {
    pub mean: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
    /// Template count k.
    pub template_rank: usize,
    /// Low-rank noise rank r.
    pub noise_rank: usize,
    /// Condition number of the posterior precision `Q`.
    pub condition_number: f64,
    /// Condition number of the Woodbury core `I + WᵀD⁻¹W`, when r > 0.
    pub core_condition_number: Option<f64>,
    pub low_confidence: bool,
    pub warning: Option<NumericalWarning>,
    pub n_samples: usize,
}

impl CouplingPosterior {
    /// Leading amplitude (first template).
    pub fn amplitude(&self) -> f64 {
        self.mean[0]
    }

    /// Posterior standard deviation of amplitude `i`.
    pub fn std_error(&self, i: usize) -> f64 {
        self.covariance[i][i].max(0.0).sqrt()
    }

    /// Leading amplitude over its posterior standard deviation.
    pub fn snr(&self) -> f64 {
        let sd = self.std_error(0);
        if sd > 0.0 { self.amplitude() / sd } else { 0.0 }
    }

    pub fn covariance_matrix(&self) -> DMatrix<f64> {
        let k = self.template_rank;
        DMatrix::from_fn(k, k, |i, j| self.covariance[i][j])
    }

    /// Whether the covariance is positive semi-definite within `tol`.
    pub fn is_psd(&self, tol: f64) -> bool {
        let eig = nalgebra::SymmetricEigen::new(self.covariance_matrix());
        eig.eigenvalues.iter().all(|&v| v >= -tol)
    }
}

// ---------------------------------------------------------------------------
// Estimator
// ---------------------------------------------------------------------------

/// Posterior of the coupling amplitudes of `templates` in `record`.
pub fn estimate_coupling(
    record: &[f64],
    templates: &[Vec<f64>],
    prior: &Prior,
    noise: &NoiseModel,
    config: &DualConfig,
) -> Result<CouplingPosterior> {
    let n = record.len();
    let k = templates.len();
    let r = noise.rank();

    if k == 0 {
        return Err(AuditError::dims("template count", 1, 0));
    }
    if k > config.max_templates {
        return Err(AuditError::RankCapExceeded {
            what: "templates".into(),
            rank: k,
            cap: config.max_templates,
        });
    }
    if r > config.max_noise_rank {
        return Err(AuditError::RankCapExceeded {
            what: "noise low-rank".into(),
            rank: r,
            cap: config.max_noise_rank,
        });
    }
    for (j, t) in templates.iter().enumerate() {
        if t.len() != n {
            return Err(AuditError::dims(format!("template {j} length"), n, t.len()));
        }
    }
    if noise.len() != n {
        return Err(AuditError::dims("noise model length", n, noise.len()));
    }
    if prior.dim() != k {
        return Err(AuditError::dims("prior dimension", k, prior.dim()));
    }
    if n == 0 {
        return Err(AuditError::degenerate("record", "no samples"));
    }
    for (j, t) in templates.iter().enumerate() {
        let mean = t.iter().sum::<f64>() / n as f64;
        let variance = t.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        if !(variance > config.degenerate_tolerance) {
            return Err(AuditError::degenerate(
                format!("template {j}"),
                format!("variance {variance:.3e} about mean {mean:.3e}"),
            ));
        }
    }

    let dinv: Vec<f64> = noise.diagonal.iter().map(|v| 1.0 / v).collect();
    let c = DMatrix::from_fn(n, k, |i, j| templates[j][i]);
    let dinv_c = DMatrix::from_fn(n, k, |i, j| templates[j][i] * dinv[i]);
    let d = DVector::from_column_slice(record);

    // CᵀD⁻¹C and CᵀD⁻¹d
    let mut ctnc = c.tr_mul(&dinv_c);
    let mut ctnd = dinv_c.tr_mul(&d);

    let mut core_condition_number = None;
    if r > 0 {
        let w = DMatrix::from_fn(n, r, |i, j| noise.low_rank[j][i]);
        let dinv_w = DMatrix::from_fn(n, r, |i, j| noise.low_rank[j][i] * dinv[i]);
        let core = DMatrix::identity(r, r) + w.tr_mul(&dinv_w);
        let core_cond = check_spd(&core, "woodbury core")?;
        core_condition_number = Some(core_cond.condition_number);
        let core_inv = spd_inverse(&core, "woodbury core")?;
        // WᵀD⁻¹C (r×k) and WᵀD⁻¹d (r)
        let p = dinv_w.tr_mul(&c);
        let q = dinv_w.tr_mul(&d);
        ctnc -= p.tr_mul(&(&core_inv * &p));
        ctnd -= p.tr_mul(&(&core_inv * &q));
    }

    let precision = symmetrize(&(prior.precision() + ctnc));
    let cond = check_spd(&precision, "posterior precision")?;
    let covariance = spd_inverse(&precision, "posterior precision")?;
    let mean = &covariance * (prior.precision() * prior.mean() + ctnd);

    let mut warning = None;
    let (stage, worst) = match core_condition_number {
        Some(core) if core > cond.condition_number => ("woodbury core", core),
        _ => ("posterior precision", cond.condition_number),
    };
    let low_confidence = worst > config.condition_threshold;
    if low_confidence {
        let w = NumericalWarning {
            stage: stage.into(),
            condition_number: worst,
            threshold: config.condition_threshold,
        };
        warn!("Low-confidence coupling posterior: {w}");
        warning = Some(w);
    }

    debug!(
        "Coupling posterior: n={n} k={k} r={r} amplitude={:.6e} cond={:.3e}",
        mean[0], cond.condition_number
    );

    Ok(CouplingPosterior {
        mean: mean.iter().copied().collect(),
        covariance: (0..k)
            .map(|i| (0..k).map(|j| covariance[(i, j)]).collect())
            .collect(),
        template_rank: k,
        noise_rank: r,
        condition_number: cond.condition_number,
        core_condition_number,
        low_confidence,
        warning,
        n_samples: n,
    })
}

/// Coupling of a Record map to a context vector over their jointly valid
/// pixels. `noise` is indexed by pixel id (length `12·nside²`).
pub fn estimate_map_coupling(
    record: &PixelMap,
    context: &ContextVector,
    prior: &Prior,
    noise: &NoiseModel,
    config: &DualConfig,
) -> Result<CouplingPosterior> {
    if record.nside() != context.nside {
        return Err(AuditError::ResolutionMismatch {
            input: "record".into(),
            expected: context.nside,
            found: record.nside(),
        });
    }
    if noise.len() != record.len() {
        return Err(AuditError::dims("map noise model length", record.len(), noise.len()));
    }
    let (pixels, template): (Vec<usize>, Vec<f64>) = context
        .pixels
        .iter()
        .zip(&context.values)
        .filter(|(p, _)| record.is_valid(**p))
        .map(|(p, v)| (*p, *v))
        .unzip();
    let values: Vec<f64> = pixels.iter().map(|&p| record.values()[p]).collect();
    estimate_coupling(
        &values,
        &[template],
        prior,
        &noise.restrict(&pixels),
        config,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn templates(n: usize) -> Vec<Vec<f64>> {
        vec![
            (0..n).map(|i| (i as f64 * 0.7).sin()).collect(),
            (0..n).map(|i| (i as f64 * 0.3).cos() + 0.1).collect(),
        ]
    }

    /// Dense reference: Q = Λ₀ + CᵀN⁻¹C with N inverted directly.
    fn brute_force(
        record: &[f64],
        templates: &[Vec<f64>],
        prior: &Prior,
        noise: &NoiseModel,
    ) -> (DVector<f64>, DMatrix<f64>) {
        let n = record.len();
        let k = templates.len();
        let c = DMatrix::from_fn(n, k, |i, j| templates[j][i]);
        let ninv = noise.to_dense().try_inverse().unwrap();
        let q = prior.precision() + c.transpose() * &ninv * &c;
        let cov = q.clone().try_inverse().unwrap();
        let d = DVector::from_column_slice(record);
        let mean = &cov * (prior.precision() * prior.mean() + c.transpose() * &ninv * d);
        (mean, cov)
    }

    #[test]
    fn test_woodbury_matches_brute_force() {
        let n = 12;
        let t = templates(n);
        let record: Vec<f64> = (0..n).map(|i| 0.4 * t[0][i] - 0.2 * t[1][i] + (i as f64).sin() * 0.05).collect();
        let noise = NoiseModel::diagonal((0..n).map(|i| 0.5 + 0.1 * i as f64).collect())
            .unwrap()
            .with_low_rank(vec![
                (0..n).map(|i| (i as f64 * 0.9).cos()).collect(),
                (0..n).map(|i| 0.3 * i as f64 / n as f64).collect(),
            ])
            .unwrap();
        let prior = Prior::isotropic(2, 4.0).unwrap();
        let post = estimate_coupling(&record, &t, &prior, &noise, &DualConfig::default()).unwrap();
        let (mean, cov) = brute_force(&record, &t, &prior, &noise);
        for i in 0..2 {
            assert!((post.mean[i] - mean[i]).abs() < 1e-9);
            for j in 0..2 {
                assert!((post.covariance[i][j] - cov[(i, j)]).abs() < 1e-9);
            }
        }
        assert!(post.is_psd(1e-12));
        assert_eq!(post.noise_rank, 2);
        assert!(post.core_condition_number.is_some());
    }

    #[test]
    fn test_recovers_injected_amplitude() {
        let n = 400;
        let t: Vec<f64> = (0..n).map(|i| (i as f64 * 0.05).sin()).collect();
        let record: Vec<f64> = t.iter().map(|v| 0.05 * v).collect();
        let noise = NoiseModel::white(n, 1.0).unwrap();
        let post = estimate_coupling(
            &record,
            &[t],
            &Prior::uninformative(1),
            &noise,
            &DualConfig::default(),
        )
        .unwrap();
        assert!((post.amplitude() - 0.05).abs() < 1e-12);
        assert!(!post.low_confidence);
    }

    #[test]
    fn test_error_conditions() {
        let cfg = DualConfig::default();
        let noise = NoiseModel::white(4, 1.0).unwrap();
        let prior = Prior::uninformative(1);
        let err = estimate_coupling(&[1.0; 3], &[vec![1.0; 4]], &prior, &noise, &cfg).unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
        let err = estimate_coupling(&[1.0; 4], &[vec![0.0; 4]], &prior, &noise, &cfg).unwrap_err();
        assert_eq!(err.kind(), "degenerate_context");
        let many: Vec<Vec<f64>> = (0..9).map(|j| vec![j as f64 + 1.0; 4]).collect();
        let err = estimate_coupling(&[1.0; 4], &many, &Prior::uninformative(9), &noise, &cfg)
            .unwrap_err();
        assert_eq!(err.kind(), "rank_cap_exceeded");
        assert_eq!(
            NoiseModel::diagonal(vec![1.0, 0.0]).unwrap_err().kind(),
            "invalid_noise_model"
        );
    }

    #[test]
    fn test_collinear_templates_are_singular() {
        let t = vec![vec![1.0, 2.0, 3.0], vec![2.0, 4.0, 6.0]];
        let noise = NoiseModel::white(3, 1.0).unwrap();
        let err = estimate_coupling(
            &[1.0, 0.0, 1.0],
            &t,
            &Prior::uninformative(2),
            &noise,
            &DualConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "singular_update");
    }

    #[test]
    fn test_ill_conditioned_is_flagged() {
        let t = vec![vec![1.0, 2.0, 3.0, 4.0], vec![1.0, 2.0, 3.0, 4.0001]];
        let noise = NoiseModel::white(4, 1.0).unwrap();
        let cfg = DualConfig {
            condition_threshold: 1e6,
            ..DualConfig::default()
        };
        let post =
            estimate_coupling(&[1.0, 2.0, 3.0, 4.0], &t, &Prior::uninformative(2), &noise, &cfg)
                .unwrap();
        assert!(post.low_confidence);
        let w = post.warning.unwrap();
        assert!(w.condition_number > 1e6);
        assert_eq!(w.stage, "posterior precision");
    }

    #[test]
    fn test_ill_conditioned_woodbury_core_is_flagged() {
        // One template keeps the posterior precision 1×1; the noise basis mixes
        // a huge and a tiny column, so only the core I + WᵀD⁻¹W is ill-conditioned.
        let n = 50;
        let t: Vec<f64> = (0..n).map(|i| (i as f64 * 0.3).sin()).collect();
        let loud: Vec<f64> = (0..n).map(|i| if i % 2 == 0 { 1e5 } else { -1e5 }).collect();
        let quiet: Vec<f64> = (0..n).map(|i| 1e-3 * (i as f64 * 0.7).cos()).collect();
        let noise = NoiseModel::white(n, 1.0).unwrap().with_low_rank(vec![loud, quiet]).unwrap();
        let record: Vec<f64> = t.iter().map(|v| 0.1 * v).collect();

        let post = estimate_coupling(
            &record,
            std::slice::from_ref(&t),
            &Prior::uninformative(1),
            &noise,
            &DualConfig::default(),
        )
        .unwrap();
        assert!((post.condition_number - 1.0).abs() < 1e-9);
        let core = post.core_condition_number.unwrap();
        assert!(core > 1e8, "core condition {core:.3e}");
        assert!(post.low_confidence);
        let w = post.warning.unwrap();
        assert_eq!(w.stage, "woodbury core");
        assert_eq!(w.condition_number, core);

        let well_conditioned = NoiseModel::white(n, 1.0)
            .unwrap()
            .with_low_rank(vec![(0..n).map(|i| (i as f64 * 0.7).cos()).collect()])
            .unwrap();
        let post = estimate_coupling(
            &record,
            &[t],
            &Prior::uninformative(1),
            &well_conditioned,
            &DualConfig::default(),
        )
        .unwrap();
        assert!(!post.low_confidence);
        assert!(post.warning.is_none());
    }

    #[test]
    fn test_constant_template_is_degenerate() {
        let noise = NoiseModel::white(6, 1.0).unwrap();
        let err = estimate_coupling(
            &[1.0, 2.0, 0.5, 1.5, 3.0, 2.0],
            &[vec![5.0; 6]],
            &Prior::uninformative(1),
            &noise,
            &DualConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "degenerate_context");
        assert!(err.to_string().contains("variance"));
    }
}
