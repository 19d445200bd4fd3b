//! Statistics battery for phase-locking audits.
//!
//! Descriptive statistics, correlation, the weighted mean cosine of phase
//! differences, a Jarque-Bera Gaussianity check, and empirical null
//! distributions that turn a statistic into a σ-equivalent significance.
//!
//! Functions return `None` when the input cannot support the statistic
//! (too few samples, zero variance) rather than a made-up value.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};

// ═══════════════════════════════════════════════════════════════════════════════
// Core types
// ═══════════════════════════════════════════════════════════════════════════════

/// Which tail of the null distribution counts as "more extreme".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tail {
    /// Large positive values are extreme (locking).
    #[default]
    Upper,
    /// Deviations in either direction are extreme.
    TwoSided,
}

/// How a significance value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignificanceMethod {
    /// Rank of the observed value within the null ensemble.
    EmpiricalRank,
    /// z-score against a null ensemble that passed the Gaussianity check.
    CalibratedGaussian,
}

/// σ-equivalent significance of an observed statistic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Significance {
    pub sigma: f64,
    pub p_value: f64,
    pub method: SignificanceMethod,
    pub tail: Tail,
    /// The observed value exceeded every null sample; `sigma` is a lower bound.
    pub lower_bound: bool,
}

/// Result of a normality check on a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianityCheck {
    pub name: String,
    pub statistic: f64,
    pub p_value: f64,
    pub passed: bool,
    pub details: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════════

fn sorted_copy(data: &[f64]) -> Vec<f64> {
    let mut v = data.to_vec();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    v
}

fn standard_normal() -> Normal {
    Normal::standard()
}

/// Clamp p into the open interval where the inverse normal CDF is finite.
fn clamp_p(p: f64) -> f64 {
    p.clamp(1e-300, 1.0 - 1e-16)
}

// ═══════════════════════════════════════════════════════════════════════════════
// 1. DESCRIPTIVE STATISTICS
// ═══════════════════════════════════════════════════════════════════════════════

/// Arithmetic mean.
pub fn mean(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    Some(data.iter().sum::<f64>() / data.len() as f64)
}

/// Variance with `ddof` delta degrees of freedom (0 = population, 1 = sample).
pub fn variance(data: &[f64], ddof: usize) -> Option<f64> {
    let n = data.len();
    if n <= ddof {
        return None;
    }
    let m = mean(data)?;
    let ss: f64 = data.iter().map(|x| (x - m) * (x - m)).sum();
    Some(ss / (n - ddof) as f64)
}

/// Standard deviation with `ddof` delta degrees of freedom.
pub fn std_dev(data: &[f64], ddof: usize) -> Option<f64> {
    variance(data, ddof).map(f64::sqrt)
}

/// Median (mean of the two central values for even lengths).
pub fn median(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    let s = sorted_copy(data);
    let n = s.len();
    Some(if n % 2 == 1 {
        s[n / 2]
    } else {
        0.5 * (s[n / 2 - 1] + s[n / 2])
    })
}

/// Median absolute deviation (unscaled).
pub fn median_abs_deviation(data: &[f64]) -> Option<f64> {
    let med = median(data)?;
    let dev: Vec<f64> = data.iter().map(|x| (x - med).abs()).collect();
    median(&dev)
}

/// Weighted mean. `None` when lengths differ or the weights sum to ~0.
pub fn weighted_mean(values: &[f64], weights: &[f64]) -> Option<f64> {
    if values.len() != weights.len() || values.is_empty() {
        return None;
    }
    let w_sum: f64 = weights.iter().sum();
    if w_sum.abs() < 1e-300 {
        return None;
    }
    let num: f64 = values.iter().zip(weights).map(|(v, w)| v * w).sum();
    Some(num / w_sum)
}

/// Sample skewness and excess kurtosis from population moments.
pub fn skewness_kurtosis(data: &[f64]) -> Option<(f64, f64)> {
    let n = data.len();
    if n < 3 {
        return None;
    }
    let m = mean(data)?;
    let nf = n as f64;
    let m2 = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / nf;
    if m2 < 1e-300 {
        return None;
    }
    let m3 = data.iter().map(|x| (x - m).powi(3)).sum::<f64>() / nf;
    let m4 = data.iter().map(|x| (x - m).powi(4)).sum::<f64>() / nf;
    Some((m3 / m2.powf(1.5), m4 / (m2 * m2) - 3.0))
}

// ═══════════════════════════════════════════════════════════════════════════════
// 2. CORRELATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Pearson correlation coefficient. `None` on length mismatch or zero variance.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let ma = mean(a)?;
    let mb = mean(b)?;
    let mut cov = 0.0;
    let mut va = 0.0;
    let mut vb = 0.0;
    for (x, y) in a.iter().zip(b) {
        let dx = x - ma;
        let dy = y - mb;
        cov += dx * dy;
        va += dx * dx;
        vb += dy * dy;
    }
    let denom = (va * vb).sqrt();
    if denom < 1e-300 { None } else { Some(cov / denom) }
}

// ═══════════════════════════════════════════════════════════════════════════════
// 3. CIRCULAR STATISTICS
// ═══════════════════════════════════════════════════════════════════════════════

/// Weighted mean cosine of phase differences, `Σ w cos(a − b) / Σ w`.
///
/// Lies in [-1, 1]; ≈ 0 for independent uniformly distributed phases,
/// 1 for identical phases, -1 for phases offset by π.
pub fn weighted_mean_cosine(phases_a: &[f64], phases_b: &[f64], weights: &[f64]) -> Option<f64> {
    if phases_a.len() != phases_b.len() || phases_a.len() != weights.len() {
        return None;
    }
    let w_sum: f64 = weights.iter().sum();
    if w_sum <= 0.0 {
        return None;
    }
    let num: f64 = phases_a
        .iter()
        .zip(phases_b)
        .zip(weights)
        .map(|((a, b), w)| w * (a - b).cos())
        .sum();
    Some(num / w_sum)
}

// ═══════════════════════════════════════════════════════════════════════════════
// 4. GAUSSIANITY
// ═══════════════════════════════════════════════════════════════════════════════

/// Jarque-Bera normality check: `JB = n/6 (S² + K²/4)` against χ²(2).
///
/// `passed` is true when the p-value is at least `alpha`.
pub fn jarque_bera(data: &[f64], alpha: f64) -> Option<GaussianityCheck> {
    let n = data.len();
    if n < 8 {
        return None;
    }
    let (s, k) = skewness_kurtosis(data)?;
    let jb = n as f64 / 6.0 * (s * s + k * k / 4.0);
    let dist = ChiSquared::new(2.0).ok()?;
    let p = dist.sf(jb);
    Some(GaussianityCheck {
        name: "Jarque-Bera".to_string(),
        statistic: jb,
        p_value: p,
        passed: p >= alpha,
        details: format!("skew={s:.4}, excess_kurtosis={k:.4}, n={n}"),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// 5. SIGNIFICANCE CONVERSION
// ═══════════════════════════════════════════════════════════════════════════════

/// σ-equivalent of a p-value for the given tail.
pub fn sigma_from_p(p: f64, tail: Tail) -> f64 {
    let norm = standard_normal();
    match tail {
        Tail::Upper => norm.inverse_cdf(1.0 - clamp_p(p)),
        Tail::TwoSided => norm.inverse_cdf(1.0 - clamp_p(p) / 2.0),
    }
}

/// p-value of a z-score for the given tail.
pub fn p_from_sigma(z: f64, tail: Tail) -> f64 {
    let norm = standard_normal();
    match tail {
        Tail::Upper => norm.sf(z),
        Tail::TwoSided => 2.0 * norm.sf(z.abs()),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// 6. EMPIRICAL NULL DISTRIBUTION
// ═══════════════════════════════════════════════════════════════════════════════

/// A statistic's distribution over an ensemble of null realizations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullDistribution {
    samples: Vec<f64>,
    pub mean: f64,
    pub std_dev: f64,
    pub median: f64,
    /// Normality check of the ensemble; `None` when it could not be run.
    pub gaussianity: Option<GaussianityCheck>,
}

impl NullDistribution {
    /// Build from null samples. Non-finite samples are rejected (`None`), as
    /// are ensembles with fewer than two samples.
    pub fn from_samples(samples: &[f64], gaussianity_alpha: f64) -> Option<Self> {
        if samples.len() < 2 || samples.iter().any(|x| !x.is_finite()) {
            return None;
        }
        let sorted = sorted_copy(samples);
        Some(Self {
            mean: mean(&sorted)?,
            std_dev: std_dev(&sorted, 1)?,
            median: median(&sorted)?,
            gaussianity: jarque_bera(&sorted, gaussianity_alpha),
            samples: sorted,
        })
    }

    /// Number of null realizations.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sorted null samples.
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Whether the null passed its Gaussianity check and has non-zero spread.
    pub fn is_gaussian(&self) -> bool {
        self.std_dev > 0.0 && self.gaussianity.as_ref().is_some_and(|g| g.passed)
    }

    /// Standard error of the null mean.
    pub fn standard_error(&self) -> f64 {
        self.std_dev / (self.samples.len() as f64).sqrt()
    }

    /// Empirical quantile by linear interpolation, `q` in [0, 1].
    pub fn quantile(&self, q: f64) -> f64 {
        let n = self.samples.len();
        let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        let frac = pos - lo as f64;
        self.samples[lo] * (1.0 - frac) + self.samples[hi] * frac
    }

    /// Rank p-value `(1 + #{more extreme}) / (N + 1)`.
    pub fn rank_p_value(&self, x: f64, tail: Tail) -> f64 {
        let n = self.samples.len();
        let extreme = match tail {
            Tail::Upper => n - self.samples.partition_point(|&s| s < x),
            Tail::TwoSided => {
                let d = (x - self.median).abs();
                self.samples
                    .iter()
                    .filter(|&&s| (s - self.median).abs() >= d)
                    .count()
            }
        };
        (1 + extreme) as f64 / (n + 1) as f64
    }

    /// z-score against the null mean and standard deviation.
    pub fn z_score(&self, x: f64) -> Option<f64> {
        if self.std_dev > 0.0 {
            Some((x - self.mean) / self.std_dev)
        } else {
            None
        }
    }

    /// Significance of `x`. Uses the Gaussian z-score only when the ensemble
    /// passed its Gaussianity check; otherwise the empirical rank.
    pub fn significance(&self, x: f64, tail: Tail) -> Significance {
        if self.is_gaussian() {
            if let Some(z) = self.z_score(x) {
                return Significance {
                    sigma: z,
                    p_value: p_from_sigma(z, tail),
                    method: SignificanceMethod::CalibratedGaussian,
                    tail,
                    lower_bound: false,
                };
            }
        }
        let p = self.rank_p_value(x, tail);
        let floor = 1.0 / (self.samples.len() + 1) as f64;
        let mut sigma = sigma_from_p(p, tail);
        if tail == Tail::TwoSided && x < self.median {
            sigma = -sigma;
        }
        Significance {
            sigma,
            p_value: p,
            method: SignificanceMethod::EmpiricalRank,
            tail,
            lower_bound: p <= floor,
        }
    }
}
