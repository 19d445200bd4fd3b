//! Context Builder.
//!
//! Turns one or more raw exposure, scan or hit-count maps into a single
//! normalized "cost of observation" vector over the valid pixels. The
//! combination rule is chosen from a closed set and recorded on the result,
//! so every context can be traced back to how it was made.

use log::debug;
use nalgebra::{DMatrix, SymmetricEigen};
use serde::{Deserialize, Serialize};

use crate::error::{AuditError, Result};
use crate::healpix::Healpix;
use crate::linalg::least_squares;
use crate::pixel::PixelMap;

/// MAD to standard deviation for Gaussian data.
const MAD_SCALE: f64 = 1.4826;

// ---------------------------------------------------------------------------
// Rules and modes
// ---------------------------------------------------------------------------

/// How the (resampled, transformed) inputs are combined into one cost map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum CombinationRule {
    /// `Σ wᵢ mᵢ`, one weight per input.
    WeightedSum { weights: Vec<f64> },
    /// `m[numerator] / m[denominator]`; pixels with a zero denominator drop out.
    Ratio { numerator: usize, denominator: usize },
    /// `m[minuend] − m[subtrahend]` on the pixels valid in both.
    MaskedDifference { minuend: usize, subtrahend: usize },
    /// Leading principal direction of the standardized inputs.
    LeadingMode,
}

impl CombinationRule {
    pub fn describe(&self) -> String {
        match self {
            Self::WeightedSum { weights } => format!("weighted_sum{weights:?}"),
            Self::Ratio {
                numerator,
                denominator,
            } => format!("ratio(m{numerator}/m{denominator})"),
            Self::MaskedDifference {
                minuend,
                subtrahend,
            } => format!("masked_difference(m{minuend}-m{subtrahend})"),
            Self::LeadingMode => "leading_mode".to_string(),
        }
    }
}

/// Final normalization of the cost map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Normalization {
    /// Zero mean, unit variance.
    #[default]
    Standardize,
    /// Winsorize at `median ± sigma·1.4826·MAD`, then standardize.
    Clipped { sigma: f64 },
}

/// What to do with inputs at a resolution other than the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResamplePolicy {
    /// Any mismatch is an error.
    #[default]
    Strict,
    /// Finer inputs are degraded by averaging; coarser inputs are an error.
    Aggregate,
}

/// Per-input value transform applied after resampling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "transform", rename_all = "snake_case")]
pub enum InputTransform {
    #[default]
    Identity,
    /// `1 / (v + offset)`: inverse hit count as a noise-level proxy.
    InverseCount { offset: f64 },
    /// `ln(v + offset)`.
    Log { offset: f64 },
}

impl InputTransform {
    fn apply(&self, v: f64) -> f64 {
        match *self {
            Self::Identity => v,
            Self::InverseCount { offset } => {
                let x = v + offset;
                if x > 0.0 { 1.0 / x } else { f64::NAN }
            }
            Self::Log { offset } => {
                let x = v + offset;
                if x > 0.0 { x.ln() } else { f64::NAN }
            }
        }
    }
}

/// Declarative description of a context: everything except the maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSpec {
    pub nside: u32,
    pub rule: CombinationRule,
    #[serde(default)]
    pub normalization: Normalization,
    #[serde(default)]
    pub resample: ResamplePolicy,
    /// Empty means identity for every input.
    #[serde(default)]
    pub transforms: Vec<InputTransform>,
}

impl ContextSpec {
    pub fn new(nside: u32, rule: CombinationRule) -> Self {
        Self {
            nside,
            rule,
            normalization: Normalization::default(),
            resample: ResamplePolicy::default(),
            transforms: Vec::new(),
        }
    }
}

/// Maps plus the [`ContextSpec`] that says how to combine them.
#[derive(Debug, Clone)]
pub struct ContextRequest<'a> {
    pub inputs: &'a [PixelMap],
    pub spec: &'a ContextSpec,
    /// Extra validity mask at the target resolution.
    pub mask: Option<&'a [bool]>,
    /// Templates the cost map is made orthogonal to.
    pub systematics: &'a [PixelMap],
}

impl<'a> ContextRequest<'a> {
    pub fn new(inputs: &'a [PixelMap], spec: &'a ContextSpec) -> Self {
        Self {
            inputs,
            spec,
            mask: None,
            systematics: &[],
        }
    }

    pub fn with_mask(mut self, mask: &'a [bool]) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_systematics(mut self, systematics: &'a [PixelMap]) -> Self {
        self.systematics = systematics;
        self
    }
}

// ---------------------------------------------------------------------------
// Context vector
// ---------------------------------------------------------------------------

/// Normalized context values over the valid pixels of one resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextVector {
    pub nside: u32,
    /// Valid pixel ids in increasing order.
    pub pixels: Vec<usize>,
    pub values: Vec<f64>,
    /// Description of the combination rule that produced it.
    pub rule: String,
    /// Mean of the combined cost map before normalization.
    pub raw_mean: f64,
    /// Standard deviation of the combined cost map before normalization.
    pub raw_std: f64,
}

impl ContextVector {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        pbc_stats::mean(&self.values).unwrap_or(0.0)
    }

    /// Population variance over the valid pixels.
    pub fn variance(&self) -> f64 {
        pbc_stats::variance(&self.values, 0).unwrap_or(0.0)
    }

    /// Full-sky map with the context on its pixels and everything else masked.
    pub fn to_map(&self) -> Result<PixelMap> {
        let hp = Healpix::new(self.nside)?;
        let mut values = vec![0.0; hp.npix()];
        let mut mask = vec![false; hp.npix()];
        for (&p, &v) in self.pixels.iter().zip(&self.values) {
            values[p] = v;
            mask[p] = true;
        }
        PixelMap::new(self.nside, values)?.with_mask(mask)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

fn resample(map: &PixelMap, nside: u32, policy: ResamplePolicy, input: &str) -> Result<PixelMap> {
    if map.nside() == nside {
        return Ok(map.clone());
    }
    match policy {
        ResamplePolicy::Aggregate if map.nside() > nside => map.degrade(nside),
        _ => Err(AuditError::ResolutionMismatch {
            input: input.to_string(),
            expected: nside,
            found: map.nside(),
        }),
    }
}

fn standardize_columns(columns: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
    columns
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let mean = pbc_stats::mean(col).unwrap_or(0.0);
            let sd = pbc_stats::std_dev(col, 0).unwrap_or(0.0);
            if sd <= 1e-12 * (1.0 + mean.abs()) {
                return Err(AuditError::degenerate(
                    format!("input {i}"),
                    "zero variance over valid pixels",
                ));
            }
            Ok(col.iter().map(|v| (v - mean) / sd).collect())
        })
        .collect()
}

/// Leading left singular direction of the column matrix, signed so the
/// loadings sum to a non-negative value.
fn leading_mode(columns: &[Vec<f64>]) -> Result<Vec<f64>> {
    let standardized = standardize_columns(columns)?;
    let n = standardized[0].len();
    let m = standardized.len();
    let x = DMatrix::from_fn(n, m, |i, j| standardized[j][i]);
    let eig = SymmetricEigen::new(x.tr_mul(&x));
    let top = eig.eigenvalues.imax();
    let mut loading = eig.eigenvectors.column(top).clone_owned();
    if loading.sum() < 0.0 {
        loading = -loading;
    }
    debug!("Leading mode loadings: {:?}", loading.as_slice());
    Ok((&x * loading).iter().copied().collect())
}

fn winsorize(values: &mut [f64], sigma: f64) {
    let (Some(med), Some(mad)) = (
        pbc_stats::median(values),
        pbc_stats::median_abs_deviation(values),
    ) else {
        return;
    };
    if mad <= 0.0 {
        return;
    }
    let half = sigma * MAD_SCALE * mad;
    for v in values.iter_mut() {
        *v = v.clamp(med - half, med + half);
    }
}

/// Build the normalized context vector described by `request`.
pub fn build_context(request: &ContextRequest) -> Result<ContextVector> {
    let spec = request.spec;
    let target = Healpix::new(spec.nside)?;
    let inputs = request.inputs;
    if inputs.is_empty() {
        return Err(AuditError::dims("context inputs", 1, 0));
    }
    if !spec.transforms.is_empty() && spec.transforms.len() != inputs.len() {
        return Err(AuditError::dims(
            "context transforms",
            inputs.len(),
            spec.transforms.len(),
        ));
    }
    let check_index = |what: &str, idx: usize| {
        if idx >= inputs.len() {
            Err(AuditError::dims(what.to_string(), inputs.len(), idx + 1))
        } else {
            Ok(())
        }
    };
    match &spec.rule {
        CombinationRule::WeightedSum { weights } => {
            if weights.len() != inputs.len() {
                return Err(AuditError::dims("weighted_sum weights", inputs.len(), weights.len()));
            }
        }
        CombinationRule::Ratio {
            numerator,
            denominator,
        } => {
            check_index("ratio numerator", *numerator)?;
            check_index("ratio denominator", *denominator)?;
        }
        CombinationRule::MaskedDifference {
            minuend,
            subtrahend,
        } => {
            check_index("masked_difference minuend", *minuend)?;
            check_index("masked_difference subtrahend", *subtrahend)?;
        }
        CombinationRule::LeadingMode => {}
    }

    let maps: Vec<PixelMap> = inputs
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let resampled = resample(m, spec.nside, spec.resample, &format!("input {i}"))?;
            Ok(match spec.transforms.get(i) {
                Some(t) if *t != InputTransform::Identity => resampled.map_values(|v| t.apply(v)),
                _ => resampled,
            })
        })
        .collect::<Result<_>>()?;
    let systematics: Vec<PixelMap> = request
        .systematics
        .iter()
        .enumerate()
        .map(|(i, m)| resample(m, spec.nside, spec.resample, &format!("systematic {i}")))
        .collect::<Result<_>>()?;
    if let Some(mask) = request.mask {
        if mask.len() != target.npix() {
            return Err(AuditError::dims("context mask", target.npix(), mask.len()));
        }
    }

    let npix = target.npix();
    let mut pixels = Vec::new();
    let mut cost = Vec::new();
    for p in 0..npix {
        if !maps.iter().all(|m| m.is_valid(p))
            || !systematics.iter().all(|m| m.is_valid(p))
            || request.mask.is_some_and(|mask| !mask[p])
        {
            continue;
        }
        let v = |i: usize| maps[i].values()[p];
        let value = match &spec.rule {
            CombinationRule::WeightedSum { weights } => {
                weights.iter().enumerate().map(|(i, w)| w * v(i)).sum::<f64>()
            }
            CombinationRule::Ratio {
                numerator,
                denominator,
            } => {
                let den = v(*denominator);
                if den.abs() < f64::MIN_POSITIVE {
                    continue;
                }
                v(*numerator) / den
            }
            CombinationRule::MaskedDifference {
                minuend,
                subtrahend,
            } => v(*minuend) - v(*subtrahend),
            CombinationRule::LeadingMode => 0.0,
        };
        pixels.push(p);
        cost.push(value);
    }

    if pixels.len() < 2 {
        return Err(AuditError::degenerate(
            spec.rule.describe(),
            format!("{} valid pixels after masking", pixels.len()),
        ));
    }

    if spec.rule == CombinationRule::LeadingMode {
        let columns: Vec<Vec<f64>> = maps
            .iter()
            .map(|m| pixels.iter().map(|&p| m.values()[p]).collect())
            .collect();
        cost = leading_mode(&columns)?;
    }

    if !systematics.is_empty() {
        let s = DMatrix::from_fn(pixels.len(), systematics.len(), |i, j| {
            systematics[j].values()[pixels[i]]
        });
        let beta = least_squares(&s, &cost, "systematics projection")?;
        let fitted = &s * nalgebra::DVector::from_vec(beta);
        for (c, f) in cost.iter_mut().zip(fitted.iter()) {
            *c -= f;
        }
    }

    let raw_mean = pbc_stats::mean(&cost).unwrap_or(0.0);
    let raw_std = pbc_stats::std_dev(&cost, 0).unwrap_or(0.0);
    if !(raw_std > 1e-12 * (1.0 + raw_mean.abs())) {
        return Err(AuditError::degenerate(
            spec.rule.describe(),
            format!("variance over {} valid pixels is ~0 (std {raw_std:.3e})", pixels.len()),
        ));
    }

    if let Normalization::Clipped { sigma } = spec.normalization {
        winsorize(&mut cost, sigma);
    }
    let mean = pbc_stats::mean(&cost).unwrap_or(0.0);
    let sd = pbc_stats::std_dev(&cost, 0).unwrap_or(0.0);
    if !(sd > 1e-12 * (1.0 + mean.abs())) {
        return Err(AuditError::degenerate(
            spec.rule.describe(),
            "no variance left after clipping",
        ));
    }
    let values = cost.iter().map(|v| (v - mean) / sd).collect();

    debug!(
        "Built context {} at nside {}: {} valid pixels, raw mean {raw_mean:.4e}, raw std {raw_std:.4e}",
        spec.rule.describe(),
        spec.nside,
        pixels.len()
    );

    Ok(ContextVector {
        nside: spec.nside,
        pixels,
        values,
        rule: spec.rule.describe(),
        raw_mean,
        raw_std,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(nside: u32) -> PixelMap {
        PixelMap::from_fn(nside, |t, p| t.cos().abs() + 0.1 * (3.0 * p).sin()).unwrap()
    }

    fn moments(ctx: &ContextVector) -> (f64, f64) {
        (ctx.mean(), ctx.variance())
    }

    #[test]
    fn test_weighted_sum_is_standardized() {
        let inputs = [scan(8), PixelMap::from_fn(8, |t, _| t.sin()).unwrap()];
        let spec = ContextSpec::new(8, CombinationRule::WeightedSum { weights: vec![1.0, 0.5] });
        let ctx = build_context(&ContextRequest::new(&inputs, &spec)).unwrap();
        let (m, v) = moments(&ctx);
        assert!(m.abs() < 1e-12);
        assert!((v - 1.0).abs() < 1e-12);
        assert_eq!(ctx.len(), 768);
        assert!(ctx.rule.starts_with("weighted_sum"));
    }

    #[test]
    fn test_ratio_drops_zero_denominators() {
        let num = scan(4);
        let mut den_values = vec![2.0; 192];
        den_values[7] = 0.0;
        den_values[8] = 1.0;
        let den = PixelMap::new(4, den_values).unwrap();
        let spec = ContextSpec::new(
            4,
            CombinationRule::Ratio {
                numerator: 0,
                denominator: 1,
            },
        );
        let ctx = build_context(&ContextRequest::new(&[num, den], &spec)).unwrap();
        assert_eq!(ctx.len(), 191);
        assert!(!ctx.pixels.contains(&7));
    }

    #[test]
    fn test_masked_difference_uses_joint_validity() {
        let a = scan(4);
        let mut mask = vec![true; 192];
        mask[0] = false;
        let b = PixelMap::from_fn(4, |t, _| 0.5 * t.cos()).unwrap().with_mask(mask).unwrap();
        let spec = ContextSpec::new(
            4,
            CombinationRule::MaskedDifference {
                minuend: 0,
                subtrahend: 1,
            },
        );
        let ctx = build_context(&ContextRequest::new(&[a, b], &spec)).unwrap();
        assert_eq!(ctx.len(), 191);
        assert_eq!(ctx.pixels[0], 1);
    }

    #[test]
    fn test_leading_mode_of_collinear_inputs() {
        let a = scan(4);
        let b = a.map_values(|v| 3.0 * v + 1.0);
        let spec = ContextSpec::new(4, CombinationRule::LeadingMode);
        let ctx = build_context(&ContextRequest::new(&[a.clone(), b], &spec)).unwrap();
        let direct = build_context(&ContextRequest::new(
            &[a],
            &ContextSpec::new(4, CombinationRule::WeightedSum { weights: vec![1.0] }),
        ))
        .unwrap();
        for (x, y) in ctx.values.iter().zip(&direct.values) {
            assert!((x - y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_all_zero_exposure_is_degenerate() {
        let zero = PixelMap::constant(8, 0.0).unwrap();
        let spec = ContextSpec::new(8, CombinationRule::WeightedSum { weights: vec![1.0] });
        let err = build_context(&ContextRequest::new(&[zero], &spec)).unwrap_err();
        assert_eq!(err.kind(), "degenerate_context");
    }

    #[test]
    fn test_resolution_policies() {
        let inputs = [scan(8), scan(32)];
        let mut spec = ContextSpec::new(8, CombinationRule::WeightedSum { weights: vec![1.0, 1.0] });
        let err = build_context(&ContextRequest::new(&inputs, &spec)).unwrap_err();
        assert_eq!(err.kind(), "resolution_mismatch");
        spec.resample = ResamplePolicy::Aggregate;
        let ctx = build_context(&ContextRequest::new(&inputs, &spec)).unwrap();
        assert_eq!(ctx.nside, 8);
        // Aggregation never upsamples.
        spec.nside = 16;
        let err = build_context(&ContextRequest::new(&inputs, &spec)).unwrap_err();
        assert_eq!(err.kind(), "resolution_mismatch");
    }

    #[test]
    fn test_rule_index_checks() {
        let spec = ContextSpec::new(
            4,
            CombinationRule::Ratio {
                numerator: 0,
                denominator: 3,
            },
        );
        let err = build_context(&ContextRequest::new(&[scan(4)], &spec)).unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
        let spec = ContextSpec::new(4, CombinationRule::WeightedSum { weights: vec![1.0, 2.0] });
        let err = build_context(&ContextRequest::new(&[scan(4)], &spec)).unwrap_err();
        assert_eq!(err.kind(), "dimension_mismatch");
    }

    #[test]
    fn test_inverse_count_transform() {
        let hits = PixelMap::from_fn(4, |t, _| 10.0 + 5.0 * t.cos()).unwrap();
        let mut spec = ContextSpec::new(4, CombinationRule::WeightedSum { weights: vec![1.0] });
        spec.transforms = vec![InputTransform::InverseCount { offset: 0.0 }];
        let ctx = build_context(&ContextRequest::new(&[hits.clone()], &spec)).unwrap();
        // Fewer hits means more cost: north (high hits) maps to low values.
        let north = ctx.values[ctx.pixels.iter().position(|&p| p == 0).unwrap()];
        let south = ctx.values[ctx.pixels.iter().position(|&p| p == 191).unwrap()];
        assert!(north < south);
    }

    #[test]
    fn test_systematics_are_projected_out() {
        let sys = PixelMap::from_fn(8, |t, _| t.cos()).unwrap();
        let base = PixelMap::from_fn(8, |t, p| t.cos() + 0.3 * (2.0 * p).cos() * t.sin()).unwrap();
        let spec = ContextSpec::new(8, CombinationRule::WeightedSum { weights: vec![1.0] });
        let systematics = [sys.clone()];
        let ctx = build_context(
            &ContextRequest::new(&[base], &spec).with_systematics(&systematics),
        )
        .unwrap();
        let sys_values: Vec<f64> = ctx.pixels.iter().map(|&p| sys.values()[p]).collect();
        let dot: f64 = ctx.values.iter().zip(&sys_values).map(|(a, b)| a * b).sum();
        assert!(dot.abs() < 1e-8, "residual overlap {dot}");
    }

    #[test]
    fn test_clipped_normalization_limits_outliers() {
        let mut values: Vec<f64> = (0..192).map(|i| (i as f64 * 0.37).sin()).collect();
        values[10] = 1e6;
        let map = PixelMap::new(4, values).unwrap();
        let mut spec = ContextSpec::new(4, CombinationRule::WeightedSum { weights: vec![1.0] });
        spec.normalization = Normalization::Clipped { sigma: 3.0 };
        let ctx = build_context(&ContextRequest::new(&[map], &spec)).unwrap();
        let (m, v) = moments(&ctx);
        assert!(m.abs() < 1e-12 && (v - 1.0).abs() < 1e-12);
        assert!(ctx.values[10] < 5.0);
    }

    #[test]
    fn test_extra_mask_and_to_map() {
        let mut mask = vec![true; 192];
        mask[3] = false;
        let spec = ContextSpec::new(4, CombinationRule::WeightedSum { weights: vec![1.0] });
        let inputs = [scan(4)];
        let ctx = build_context(&ContextRequest::new(&inputs, &spec).with_mask(&mask)).unwrap();
        assert_eq!(ctx.len(), 191);
        let map = ctx.to_map().unwrap();
        assert!(!map.is_valid(3));
        assert_eq!(map.n_valid(), 191);
    }
}
