//! Validation Harness: null and injection ensembles.
//!
//! Every trial draws from its own generator seeded by
//! `SHA-256(base seed, stream, trial index)`, and results are reduced in trial
//! order, so an ensemble is identical for any thread count. Injection trials
//! reuse the same trial seeds at every amplitude (common random numbers).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::context::ContextVector;
use crate::dual::{
    CouplingPosterior, DualConfig, NoiseModel, Prior, estimate_coupling, estimate_map_coupling,
};
use crate::engine::{
    Band, Calibration, Catalog, CommutatorMode, EngineConfig, RotationProfile, RotationSchedule,
    StatisticKind, commutator, phase_alignment, rotational_surplus,
};
use crate::error::{AuditError, Result};
use crate::harmonic::Alm;
use crate::pixel::PixelMap;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Acceptance band for the null mean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BiasTolerance {
    /// `|mean − expected| ≤ value`.
    Absolute { value: f64 },
    /// `|mean − expected| ≤ k · std / √N`.
    StandardErrors { k: f64 },
}

impl BiasTolerance {
    pub fn bound(&self, std_error: f64) -> f64 {
        match *self {
            Self::Absolute { value } => value,
            Self::StandardErrors { k } => k * std_error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub null_trials: usize,
    pub injection_trials: usize,
    /// Injected coupling amplitudes; sorted ascending before use.
    pub amplitudes: Vec<f64>,
    /// An injection counts as detected above this many σ.
    pub detection_sigma: f64,
    pub bias_tolerance: BiasTolerance,
    /// Detection rate required at `certify_amplitude`.
    pub min_detection_rate: f64,
    pub certify_amplitude: Option<f64>,
    /// Largest tolerated fraction of failed trials.
    pub failure_tolerance: f64,
    /// Worker threads; `None` uses the global rayon pool.
    pub threads: Option<usize>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            null_trials: 200,
            injection_trials: 100,
            amplitudes: vec![0.0, 0.01, 0.05, 0.1],
            detection_sigma: 3.0,
            bias_tolerance: BiasTolerance::StandardErrors { k: 3.0 },
            min_detection_rate: 0.8,
            certify_amplitude: Some(0.05),
            failure_tolerance: 0.05,
            threads: None,
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.null_trials < 2 {
            return Err(AuditError::config("null_trials must be at least 2"));
        }
        if self.amplitudes.iter().any(|a| !a.is_finite()) {
            return Err(AuditError::config("injection amplitudes must be finite"));
        }
        if !(0.0..=1.0).contains(&self.failure_tolerance) {
            return Err(AuditError::config("failure_tolerance must lie in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.min_detection_rate) {
            return Err(AuditError::config("min_detection_rate must lie in [0, 1]"));
        }
        if !(self.detection_sigma > 0.0) {
            return Err(AuditError::config("detection_sigma must be positive"));
        }
        match self.bias_tolerance {
            BiasTolerance::Absolute { value } if !(value > 0.0) => {
                return Err(AuditError::config("absolute bias tolerance must be positive"));
            }
            BiasTolerance::StandardErrors { k } if !(k > 0.0) => {
                return Err(AuditError::config("bias tolerance k must be positive"));
            }
            _ => {}
        }
        if let Some(target) = self.certify_amplitude {
            if !self.amplitudes.iter().any(|a| (a - target).abs() < 1e-12) {
                return Err(AuditError::config(format!(
                    "certify_amplitude {target} is not in the amplitude grid"
                )));
            }
        }
        if self.threads == Some(0) {
            return Err(AuditError::config("threads must be at least 1"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cancellation and seeding
// ---------------------------------------------------------------------------

/// Shared flag that stops an ensemble from scheduling further trials.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 32-byte seed of one trial.
pub fn trial_seed(base: u64, stream: &str, index: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(base.to_le_bytes());
    hasher.update((stream.len() as u64).to_le_bytes());
    hasher.update(stream.as_bytes());
    hasher.update(index.to_le_bytes());
    hasher.finalize().into()
}

pub fn trial_rng(base: u64, stream: &str, index: u64) -> StdRng {
    StdRng::from_seed(trial_seed(base, stream, index))
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

/// Statistic and recovered amplitude of one injection trial.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InjectionOutcome {
    pub statistic: f64,
    pub recovered: f64,
}

/// One statistic wired for Monte Carlo validation.
pub trait TrialPipeline: Sync {
    fn kind(&self) -> StatisticKind;

    /// Value of the statistic expected with no coupling, when one exists.
    fn null_expectation(&self) -> Option<f64>;

    /// Statistic on the observed data.
    fn observed(&self) -> Result<f64>;

    /// Statistic on one coupling-free realization.
    fn null_trial(&self, rng: &mut StdRng) -> Result<f64>;

    /// Statistic and recovered amplitude with coupling `amplitude` injected.
    fn injection_trial(&self, amplitude: f64, rng: &mut StdRng) -> Result<InjectionOutcome>;
}

/// Record values over the context's pixels, standardized on the pixels
/// where both are valid; every other pixel is masked.
pub fn standardize_record(record: &PixelMap, context: &ContextVector) -> Result<PixelMap> {
    if record.nside() != context.nside {
        return Err(AuditError::ResolutionMismatch {
            input: "record".into(),
            expected: context.nside,
            found: record.nside(),
        });
    }
    let pixels: Vec<usize> = context.pixels.iter().copied().filter(|&p| record.is_valid(p)).collect();
    let values: Vec<f64> = pixels.iter().map(|&p| record.values()[p]).collect();
    let mean = pbc_stats::mean(&values).unwrap_or(0.0);
    let sd = pbc_stats::std_dev(&values, 0).unwrap_or(0.0);
    if !(sd > 0.0) {
        return Err(AuditError::degenerate("record", "no variance on context pixels"));
    }
    let mut out = vec![0.0; record.len()];
    let mut mask = vec![false; record.len()];
    for &p in &pixels {
        out[p] = (record.values()[p] - mean) / sd;
        mask[p] = true;
    }
    PixelMap::new(record.nside(), out)?.with_mask(mask)
}

/// Standardized record projected onto multipoles `ℓ ≤ lmax`, with the
/// coefficients it was synthesized from. Random-phase nulls are drawn from the
/// same coefficients, so observed and null maps share one harmonic space.
pub fn band_limited_record(
    record: &PixelMap,
    context: &ContextVector,
    lmax: usize,
) -> Result<(PixelMap, Alm)> {
    let standardized = standardize_record(record, context)?;
    let alm = Alm::from_map(&standardized, lmax, 0);
    let limited = alm
        .to_map(standardized.nside())?
        .and_mask(&standardized.validity())?;
    Ok((limited, alm))
}

/// `s_gamma` between record and context coefficients. Nulls randomize the
/// record phases; the coupling is recovered from the real-vectorized band.
pub struct PhasePipeline {
    record: Alm,
    context: Alm,
    band: Band,
    min_multipoles: usize,
    template: Vec<f64>,
    noise: NoiseModel,
    dual: DualConfig,
}

impl PhasePipeline {
    pub fn new(
        record: &PixelMap,
        context: &ContextVector,
        band: Band,
        iterations: usize,
        engine: &EngineConfig,
        dual: DualConfig,
    ) -> Result<Self> {
        let record_alm = Alm::from_map(&standardize_record(record, context)?, band.lmax, iterations);
        let context_alm = Alm::from_map(&context.to_map()?, band.lmax, iterations);
        Self::from_alms(record_alm, context_alm, band, engine, dual)
    }

    pub fn from_alms(
        record: Alm,
        context: Alm,
        band: Band,
        engine: &EngineConfig,
        dual: DualConfig,
    ) -> Result<Self> {
        // Validates the band before any trial runs.
        phase_alignment(&record, &context, &band, engine.min_multipoles)?;
        let template = context.to_real_vector(band.lmin, band.lmax);
        let cl = record.power_spectrum();
        let ells = record.real_vector_multipoles(band.lmin, band.lmax);
        let band_power: Vec<f64> = ells.iter().map(|&l| cl[l]).collect();
        let floor = pbc_stats::mean(&band_power).unwrap_or(0.0) * 1e-6;
        if !(floor > 0.0) {
            return Err(AuditError::InvalidNoiseModel {
                reason: "record has no power in band".into(),
            });
        }
        let noise = NoiseModel::diagonal(band_power.iter().map(|c| c.max(floor)).collect())?;
        Ok(Self {
            record,
            context,
            band,
            min_multipoles: engine.min_multipoles,
            template,
            noise,
            dual,
        })
    }

    fn statistic(&self, record: &Alm) -> Result<f64> {
        phase_alignment(record, &self.context, &self.band, self.min_multipoles)
    }
}

impl TrialPipeline for PhasePipeline {
    fn kind(&self) -> StatisticKind {
        StatisticKind::SGamma
    }

    fn null_expectation(&self) -> Option<f64> {
        Some(0.0)
    }

    fn observed(&self) -> Result<f64> {
        self.statistic(&self.record)
    }

    fn null_trial(&self, rng: &mut StdRng) -> Result<f64> {
        self.statistic(&self.record.randomize_phases(rng))
    }

    fn injection_trial(&self, amplitude: f64, rng: &mut StdRng) -> Result<InjectionOutcome> {
        let injected = self
            .record
            .randomize_phases(rng)
            .add_scaled(&self.context, amplitude)?;
        let posterior = estimate_coupling(
            &injected.to_real_vector(self.band.lmin, self.band.lmax),
            std::slice::from_ref(&self.template),
            &Prior::uninformative(1),
            &self.noise,
            &self.dual,
        )?;
        Ok(InjectionOutcome {
            statistic: self.statistic(&injected)?,
            recovered: posterior.amplitude(),
        })
    }
}

/// Pixel-space dual-posterior amplitude of the context in the record.
pub struct CouplingPipeline {
    record: PixelMap,
    record_alm: Alm,
    context: ContextVector,
    context_map: PixelMap,
    prior: Prior,
    noise: NoiseModel,
    dual: DualConfig,
}

impl CouplingPipeline {
    /// The record is band-limited to `lmax` before the observed amplitude is
    /// measured; nulls are random-phase realizations of the same band.
    pub fn new(
        record: &PixelMap,
        context: &ContextVector,
        lmax: usize,
        prior: Prior,
        noise: NoiseModel,
        dual: DualConfig,
    ) -> Result<Self> {
        let (record, record_alm) = band_limited_record(record, context, lmax)?;
        if noise.len() != record.len() {
            return Err(AuditError::dims("map noise model length", record.len(), noise.len()));
        }
        Ok(Self {
            record_alm,
            context_map: context.to_map()?,
            context: context.clone(),
            record,
            prior,
            noise,
            dual,
        })
    }

    /// Posterior on the observed record.
    pub fn posterior(&self) -> Result<CouplingPosterior> {
        estimate_map_coupling(&self.record, &self.context, &self.prior, &self.noise, &self.dual)
    }

    fn amplitude(&self, map: &PixelMap) -> Result<f64> {
        Ok(estimate_map_coupling(map, &self.context, &self.prior, &self.noise, &self.dual)?.amplitude())
    }

    fn null_map(&self, rng: &mut StdRng) -> Result<PixelMap> {
        self.record_alm
            .randomize_phases(rng)
            .to_map(self.record.nside())?
            .and_mask(&self.record.validity())
    }
}

impl TrialPipeline for CouplingPipeline {
    fn kind(&self) -> StatisticKind {
        StatisticKind::CouplingAmplitude
    }

    fn null_expectation(&self) -> Option<f64> {
        Some(0.0)
    }

    fn observed(&self) -> Result<f64> {
        self.amplitude(&self.record)
    }

    fn null_trial(&self, rng: &mut StdRng) -> Result<f64> {
        self.amplitude(&self.null_map(rng)?)
    }

    fn injection_trial(&self, amplitude: f64, rng: &mut StdRng) -> Result<InjectionOutcome> {
        let injected = inject_map(&self.null_map(rng)?, &self.context_map, amplitude)?;
        let value = self.amplitude(&injected)?;
        Ok(InjectionOutcome {
            statistic: value,
            recovered: value,
        })
    }
}

fn inject_map(base: &PixelMap, context: &PixelMap, amplitude: f64) -> Result<PixelMap> {
    let values = base
        .values()
        .iter()
        .zip(context.values())
        .map(|(b, c)| b + amplitude * c)
        .collect();
    base.with_values(values)
}

/// Rotational surplus of the record against the context. The record is
/// band-limited to `lmax` like [`CouplingPipeline`].
pub struct RotationPipeline {
    record: PixelMap,
    record_alm: Alm,
    context: ContextVector,
    context_map: PixelMap,
    schedule: RotationSchedule,
    relabelings: usize,
    seed: u64,
    white: NoiseModel,
    dual: DualConfig,
}

impl RotationPipeline {
    pub fn new(
        record: &PixelMap,
        context: &ContextVector,
        lmax: usize,
        schedule: RotationSchedule,
        relabelings: usize,
        seed: u64,
        dual: DualConfig,
    ) -> Result<Self> {
        let (record, record_alm) = band_limited_record(record, context, lmax)?;
        Ok(Self {
            record_alm,
            context_map: context.to_map()?,
            context: context.clone(),
            white: NoiseModel::white(record.len(), 1.0)?,
            record,
            schedule,
            relabelings,
            seed,
            dual,
        })
    }

    /// Full rotation profile of the observed record.
    pub fn profile(&self) -> Result<RotationProfile> {
        rotational_surplus(&self.record, &self.context, &self.schedule, self.relabelings, self.seed)
    }

    fn surplus(&self, map: &PixelMap, seed: u64) -> Result<f64> {
        Ok(rotational_surplus(map, &self.context, &self.schedule, self.relabelings, seed)?.surplus)
    }

    fn null_map(&self, rng: &mut StdRng) -> Result<PixelMap> {
        self.record_alm
            .randomize_phases(rng)
            .to_map(self.record.nside())?
            .and_mask(&self.record.validity())
    }
}

impl TrialPipeline for RotationPipeline {
    fn kind(&self) -> StatisticKind {
        StatisticKind::RotationalSurplus
    }

    fn null_expectation(&self) -> Option<f64> {
        None
    }

    fn observed(&self) -> Result<f64> {
        self.surplus(&self.record, self.seed)
    }

    fn null_trial(&self, rng: &mut StdRng) -> Result<f64> {
        let map = self.null_map(rng)?;
        self.surplus(&map, rng.random())
    }

    fn injection_trial(&self, amplitude: f64, rng: &mut StdRng) -> Result<InjectionOutcome> {
        let injected = inject_map(&self.null_map(rng)?, &self.context_map, amplitude)?;
        let recovered =
            estimate_map_coupling(&injected, &self.context, &Prior::uninformative(1), &self.white, &self.dual)?
                .amplitude();
        Ok(InjectionOutcome {
            statistic: self.surplus(&injected, rng.random())?,
            recovered,
        })
    }
}

/// Commutator Δz of a catalog. Nulls permute the values against the weights.
pub struct CommutatorPipeline {
    catalog: Catalog,
    mode: CommutatorMode,
    context: Vec<f64>,
    noise: NoiseModel,
    dual: DualConfig,
}

impl CommutatorPipeline {
    pub fn new(catalog: Catalog, mode: CommutatorMode, dual: DualConfig) -> Result<Self> {
        catalog.validate()?;
        let context = catalog.context_vector()?;
        let variance = pbc_stats::variance(&catalog.values, 1).unwrap_or(0.0);
        if !(variance > 0.0) {
            return Err(AuditError::degenerate("catalog values", "no variance"));
        }
        let noise = NoiseModel::white(catalog.len(), variance)?;
        Ok(Self {
            catalog,
            mode,
            context,
            noise,
            dual,
        })
    }

    fn delta(&self, values: Vec<f64>) -> Result<f64> {
        let catalog = Catalog {
            values,
            weights_a: self.catalog.weights_a.clone(),
            weights_b: self.catalog.weights_b.clone(),
        };
        Ok(commutator(&catalog, self.mode)?.delta)
    }

    fn permuted(&self, rng: &mut StdRng) -> Vec<f64> {
        let mut values = self.catalog.values.clone();
        values.shuffle(rng);
        values
    }
}

impl TrialPipeline for CommutatorPipeline {
    fn kind(&self) -> StatisticKind {
        StatisticKind::CommutatorDz
    }

    fn null_expectation(&self) -> Option<f64> {
        match self.mode {
            CommutatorMode::Signed => Some(0.0),
            CommutatorMode::Absolute => None,
        }
    }

    fn observed(&self) -> Result<f64> {
        self.delta(self.catalog.values.clone())
    }

    fn null_trial(&self, rng: &mut StdRng) -> Result<f64> {
        self.delta(self.permuted(rng))
    }

    fn injection_trial(&self, amplitude: f64, rng: &mut StdRng) -> Result<InjectionOutcome> {
        let injected: Vec<f64> = self
            .permuted(rng)
            .iter()
            .zip(&self.context)
            .map(|(v, c)| v + amplitude * c)
            .collect();
        // The context is centred, so regressing the centred values on it
        // matches a fit with a free intercept.
        let offset = pbc_stats::mean(&injected).unwrap_or(0.0);
        let centred: Vec<f64> = injected.iter().map(|v| v - offset).collect();
        let posterior = estimate_coupling(
            &centred,
            std::slice::from_ref(&self.context),
            &Prior::uninformative(1),
            &self.noise,
            &self.dual,
        )?;
        Ok(InjectionOutcome {
            statistic: self.delta(injected)?,
            recovered: posterior.amplitude(),
        })
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasCheck {
    pub expected: f64,
    pub tolerance: f64,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullReport {
    pub kind: StatisticKind,
    pub requested: usize,
    pub completed: usize,
    pub failed: usize,
    pub first_failure: Option<String>,
    pub mean: f64,
    pub std_dev: f64,
    pub std_error: f64,
    /// `None` when the statistic has no null expectation.
    pub bias: Option<BiasCheck>,
    pub calibration: Calibration,
}

impl NullReport {
    /// Fails with `BiasExceeded` when the null mean is outside tolerance.
    pub fn require_unbiased(&self) -> Result<()> {
        match &self.bias {
            Some(check) if !check.passed => Err(AuditError::BiasExceeded {
                statistic: self.kind.name().to_string(),
                mean: self.mean,
                tolerance: check.tolerance,
            }),
            _ => Ok(()),
        }
    }

    pub fn bias_summary(&self) -> String {
        match &self.bias {
            Some(check) => format!(
                "{} (|{:.6} − {}| vs ±{:.6})",
                if check.passed { "pass" } else { "FAIL" },
                self.mean,
                check.expected,
                check.tolerance
            ),
            None => "not applicable".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionPoint {
    pub amplitude: f64,
    pub completed: usize,
    pub failed: usize,
    pub recovered_mean: f64,
    pub recovered_std: f64,
    pub statistic_mean: f64,
    pub detection_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certification {
    pub amplitude: f64,
    pub detection_rate: f64,
    pub required: f64,
    pub certified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionReport {
    pub kind: StatisticKind,
    pub detection_sigma: f64,
    pub points: Vec<InjectionPoint>,
    /// Recovered amplitude is non-decreasing in the injected amplitude.
    pub monotone: bool,
    pub certification: Option<Certification>,
}

impl InjectionReport {
    pub fn point(&self, amplitude: f64) -> Option<&InjectionPoint> {
        self.points.iter().find(|p| (p.amplitude - amplitude).abs() < 1e-12)
    }

    pub fn certified(&self) -> bool {
        self.certification.as_ref().is_some_and(|c| c.certified)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Batch<T> {
    values: Vec<T>,
    failed: usize,
    first_failure: Option<String>,
}

enum Outcome<T> {
    Done(T),
    Failed(String),
    Skipped,
}

pub struct ValidationHarness {
    config: HarnessConfig,
    engine: EngineConfig,
    seed: u64,
    cancel: CancelToken,
    pool: Option<rayon::ThreadPool>,
}

impl ValidationHarness {
    pub fn new(config: HarnessConfig, engine: EngineConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let pool = match config.threads {
            Some(n) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| AuditError::config(format!("thread pool: {e}")))?,
            ),
            None => None,
        };
        Ok(Self {
            config,
            engine,
            seed,
            cancel: CancelToken::new(),
            pool,
        })
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    fn run_trials<T, F>(&self, n: usize, stream: &str, trial: F) -> Result<Batch<T>>
    where
        T: Send,
        F: Fn(&mut StdRng) -> Result<T> + Sync,
    {
        let run = || {
            (0..n)
                .into_par_iter()
                .map(|i| {
                    if self.cancel.is_cancelled() {
                        return Outcome::Skipped;
                    }
                    let mut rng = trial_rng(self.seed, stream, i as u64);
                    match trial(&mut rng) {
                        Ok(v) => Outcome::Done(v),
                        Err(e) => Outcome::Failed(e.to_string()),
                    }
                })
                .collect::<Vec<_>>()
        };
        let outcomes = match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        };

        let mut batch = Batch {
            values: Vec::with_capacity(n),
            failed: 0,
            first_failure: None,
        };
        let mut skipped = 0;
        for outcome in outcomes {
            match outcome {
                Outcome::Done(v) => batch.values.push(v),
                Outcome::Failed(msg) => {
                    batch.failed += 1;
                    batch.first_failure.get_or_insert(msg);
                }
                Outcome::Skipped => skipped += 1,
            }
        }
        if skipped > 0 {
            return Err(AuditError::Cancelled {
                completed: n - skipped,
                requested: n,
            });
        }
        if batch.failed > 0 {
            let rate = batch.failed as f64 / n as f64;
            warn!(
                "{stream}: {} of {n} trials failed and were excluded (first: {})",
                batch.failed,
                batch.first_failure.as_deref().unwrap_or("")
            );
            if rate > self.config.failure_tolerance {
                return Err(AuditError::FailureRateExceeded {
                    failed: batch.failed,
                    attempted: n,
                    rate,
                    tolerance: self.config.failure_tolerance,
                    first: batch.first_failure.unwrap_or_default(),
                });
            }
        }
        Ok(batch)
    }

    /// Null ensemble: bias, scale and calibration of the statistic.
    pub fn run_null(&self, pipeline: &dyn TrialPipeline) -> Result<NullReport> {
        let n = self.config.null_trials;
        let kind = pipeline.kind();
        let stream = format!("null/{}", kind.name());
        let batch = self.run_trials(n, &stream, |rng| pipeline.null_trial(rng))?;
        let calibration = Calibration::from_samples(kind, &batch.values, &self.engine)?;
        let mean = calibration.null.mean;
        let std_dev = calibration.null.std_dev;
        let std_error = calibration.null.standard_error();
        let bias = pipeline.null_expectation().map(|expected| {
            let tolerance = self.config.bias_tolerance.bound(std_error);
            BiasCheck {
                expected,
                tolerance,
                passed: (mean - expected).abs() <= tolerance,
            }
        });
        let report = NullReport {
            kind,
            requested: n,
            completed: batch.values.len(),
            failed: batch.failed,
            first_failure: batch.first_failure,
            mean,
            std_dev,
            std_error,
            bias,
            calibration,
        };
        info!(
            "Null {kind}: {} trials, mean {mean:.6}, std {std_dev:.6}, bias {}",
            report.completed,
            report.bias_summary()
        );
        Ok(report)
    }

    /// Injection ensembles at every configured amplitude.
    pub fn run_injection(
        &self,
        pipeline: &dyn TrialPipeline,
        calibration: &Calibration,
    ) -> Result<InjectionReport> {
        let kind = pipeline.kind();
        if calibration.kind != kind {
            return Err(AuditError::CalibrationMissing {
                track: "injection".into(),
                statistic: kind.name().to_string(),
            });
        }
        let mut amplitudes = self.config.amplitudes.clone();
        amplitudes.sort_by(|a, b| a.total_cmp(b));
        let stream = format!("injection/{}", kind.name());
        let threshold = self.config.detection_sigma;

        let mut points = Vec::with_capacity(amplitudes.len());
        for &amplitude in &amplitudes {
            let batch = self.run_trials(self.config.injection_trials, &stream, |rng| {
                pipeline.injection_trial(amplitude, rng)
            })?;
            let recovered: Vec<f64> = batch.values.iter().map(|o| o.recovered).collect();
            let statistic: Vec<f64> = batch.values.iter().map(|o| o.statistic).collect();
            let detected = statistic.iter().filter(|&&s| calibration.detects(s, threshold)).count();
            let point = InjectionPoint {
                amplitude,
                completed: batch.values.len(),
                failed: batch.failed,
                recovered_mean: pbc_stats::mean(&recovered).unwrap_or(f64::NAN),
                recovered_std: pbc_stats::std_dev(&recovered, 1).unwrap_or(0.0),
                statistic_mean: pbc_stats::mean(&statistic).unwrap_or(f64::NAN),
                detection_rate: if batch.values.is_empty() {
                    0.0
                } else {
                    detected as f64 / batch.values.len() as f64
                },
            };
            info!(
                "Injection {kind} λ={amplitude}: recovered {:.6} ± {:.6}, detection rate {:.2}",
                point.recovered_mean, point.recovered_std, point.detection_rate
            );
            points.push(point);
        }

        let monotone = points
            .windows(2)
            .all(|w| w[1].recovered_mean >= w[0].recovered_mean - 1e-12);
        if !monotone {
            warn!("Injection {kind}: recovered amplitude is not monotone in the injected amplitude");
        }
        let certification = self.config.certify_amplitude.and_then(|target| {
            points
                .iter()
                .find(|p| (p.amplitude - target).abs() < 1e-12)
                .map(|p| Certification {
                    amplitude: target,
                    detection_rate: p.detection_rate,
                    required: self.config.min_detection_rate,
                    certified: p.detection_rate >= self.config.min_detection_rate,
                })
        });
        Ok(InjectionReport {
            kind,
            detection_sigma: threshold,
            points,
            monotone,
            certification,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_distr::StandardNormal;

    /// Gaussian statistic shifted by the injected amplitude.
    struct ShiftPipeline {
        fail_every: Option<u64>,
    }

    impl TrialPipeline for ShiftPipeline {
        fn kind(&self) -> StatisticKind {
            StatisticKind::CommutatorDz
        }

        fn null_expectation(&self) -> Option<f64> {
            Some(0.0)
        }

        fn observed(&self) -> Result<f64> {
            Ok(0.0)
        }

        fn null_trial(&self, rng: &mut StdRng) -> Result<f64> {
            let draw: u64 = rng.random();
            if let Some(k) = self.fail_every {
                if draw % k == 0 {
                    return Err(AuditError::degenerate("trial", "forced failure"));
                }
            }
            Ok(rng.sample::<f64, _>(StandardNormal))
        }

        fn injection_trial(&self, amplitude: f64, rng: &mut StdRng) -> Result<InjectionOutcome> {
            let x = rng.sample::<f64, _>(StandardNormal) + 10.0 * amplitude;
            Ok(InjectionOutcome {
                statistic: x,
                recovered: x / 10.0,
            })
        }
    }

    fn config(threads: Option<usize>) -> HarnessConfig {
        HarnessConfig {
            null_trials: 300,
            injection_trials: 50,
            amplitudes: vec![0.0, 0.5, 1.0],
            certify_amplitude: Some(0.5),
            threads,
            ..HarnessConfig::default()
        }
    }

    #[test]
    fn test_trial_seeds_differ_by_stream_and_index() {
        assert_eq!(trial_seed(1, "null", 0), trial_seed(1, "null", 0));
        assert_ne!(trial_seed(1, "null", 0), trial_seed(1, "null", 1));
        assert_ne!(trial_seed(1, "null", 0), trial_seed(1, "injection", 0));
        assert_ne!(trial_seed(1, "null", 0), trial_seed(2, "null", 0));
    }

    #[test]
    fn test_null_is_identical_across_thread_counts() {
        let p = ShiftPipeline { fail_every: None };
        let one = ValidationHarness::new(config(Some(1)), EngineConfig::default(), 42).unwrap();
        let four = ValidationHarness::new(config(Some(4)), EngineConfig::default(), 42).unwrap();
        let a = one.run_null(&p).unwrap();
        let b = four.run_null(&p).unwrap();
        assert_eq!(a, b);
        a.require_unbiased().unwrap();
    }

    #[test]
    fn test_injection_detects_and_certifies() {
        let p = ShiftPipeline { fail_every: None };
        let h = ValidationHarness::new(config(None), EngineConfig::default(), 7).unwrap();
        let null = h.run_null(&p).unwrap();
        let inj = h.run_injection(&p, &null.calibration).unwrap();
        assert!(inj.monotone);
        assert!(inj.certified());
        assert!(inj.point(1.0).unwrap().detection_rate > 0.99);
        assert!(inj.point(0.0).unwrap().detection_rate < 0.1);
    }

    #[test]
    fn test_failures_are_counted_then_abort() {
        let p = ShiftPipeline { fail_every: Some(50) };
        let h = ValidationHarness::new(config(None), EngineConfig::default(), 3).unwrap();
        let report = h.run_null(&p).unwrap();
        assert!(report.failed > 0);
        assert_eq!(report.completed + report.failed, 300);
        assert!(report.first_failure.unwrap().contains("forced failure"));

        let strict = HarnessConfig {
            failure_tolerance: 0.0,
            ..config(None)
        };
        let h = ValidationHarness::new(strict, EngineConfig::default(), 3).unwrap();
        assert_eq!(h.run_null(&p).unwrap_err().kind(), "failure_rate_exceeded");
    }

    #[test]
    fn test_cancelled_ensemble_is_not_merged() {
        let p = ShiftPipeline { fail_every: None };
        let h = ValidationHarness::new(config(None), EngineConfig::default(), 3).unwrap();
        h.cancel_token().cancel();
        let err = h.run_null(&p).unwrap_err();
        assert!(matches!(err, AuditError::Cancelled { completed: 0, requested: 300 }));
    }

    #[test]
    fn test_config_validation() {
        let bad = HarnessConfig {
            certify_amplitude: Some(0.3),
            ..config(None)
        };
        assert_eq!(bad.validate().unwrap_err().kind(), "invalid_config");
        let bad = HarnessConfig {
            threads: Some(0),
            ..config(None)
        };
        assert!(bad.validate().is_err());
        assert!(HarnessConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bias_exceeded() {
        struct Biased;
        impl TrialPipeline for Biased {
            fn kind(&self) -> StatisticKind {
                StatisticKind::SGamma
            }
            fn null_expectation(&self) -> Option<f64> {
                Some(0.0)
            }
            fn observed(&self) -> Result<f64> {
                Ok(0.0)
            }
            fn null_trial(&self, rng: &mut StdRng) -> Result<f64> {
                Ok(1.0 + 0.01 * rng.sample::<f64, _>(StandardNormal))
            }
            fn injection_trial(&self, _: f64, _: &mut StdRng) -> Result<InjectionOutcome> {
                unreachable!()
            }
        }
        let h = ValidationHarness::new(config(None), EngineConfig::default(), 1).unwrap();
        let report = h.run_null(&Biased).unwrap();
        assert_eq!(report.require_unbiased().unwrap_err().kind(), "bias_exceeded");
    }

    fn white_map(nside: u32, rng: &mut StdRng) -> PixelMap {
        let npix = 12 * (nside as usize).pow(2);
        PixelMap::new(nside, (0..npix).map(|_| rng.sample::<f64, _>(StandardNormal)).collect()).unwrap()
    }

    fn white_context(nside: u32, seed: u64) -> ContextVector {
        use crate::context::{CombinationRule, ContextRequest, ContextSpec, build_context};
        let maps = [white_map(nside, &mut StdRng::seed_from_u64(seed))];
        let spec = ContextSpec::new(nside, CombinationRule::WeightedSum { weights: vec![1.0] });
        build_context(&ContextRequest::new(&maps, &spec)).unwrap()
    }

    fn sample_sd(values: &[f64]) -> f64 {
        pbc_stats::std_dev(values, 1).unwrap()
    }

    #[test]
    fn test_band_limited_record_has_no_power_above_lmax() {
        let (nside, lmax) = (16, 8);
        let context = white_context(nside, 1);
        let record = white_map(nside, &mut StdRng::seed_from_u64(2));
        let (limited, alm) = band_limited_record(&record, &context, lmax).unwrap();
        assert_eq!(alm.lmax(), lmax);
        let cl = Alm::from_map(&limited, 2 * lmax, 0).power_spectrum();
        let in_band: f64 = cl[..=lmax].iter().sum();
        let above: f64 = cl[lmax + 1..].iter().sum();
        assert!(above < 0.05 * in_band, "in band {in_band:.3e}, above {above:.3e}");
    }

    #[test]
    fn test_coupling_observed_spread_matches_null_for_broadband_record() {
        // White records carry power far above lmax; observed amplitudes of
        // independent records must spread like the random-phase nulls.
        let (nside, lmax) = (16, 8);
        let context = white_context(nside, 3);
        let npix = 12 * (nside as usize).pow(2);
        let pipeline = |record: &PixelMap| {
            CouplingPipeline::new(
                record,
                &context,
                lmax,
                Prior::uninformative(1),
                NoiseModel::white(npix, 1.0).unwrap(),
                DualConfig::default(),
            )
            .unwrap()
        };

        let mut rng = StdRng::seed_from_u64(4);
        let observed: Vec<f64> = (0..200)
            .map(|_| pipeline(&white_map(nside, &mut rng)).observed().unwrap())
            .collect();
        let reference = pipeline(&white_map(nside, &mut rng));
        let nulls: Vec<f64> = (0..200)
            .map(|i| reference.null_trial(&mut trial_rng(1, "null", i)).unwrap())
            .collect();

        let ratio = sample_sd(&observed) / sample_sd(&nulls);
        assert!((0.7..=1.4).contains(&ratio), "observed/null spread ratio {ratio:.3}");
    }

    #[test]
    fn test_rotation_observed_uses_band_limited_record() {
        let (nside, lmax) = (8, 6);
        let context = white_context(nside, 5);
        let record = white_map(nside, &mut StdRng::seed_from_u64(6));
        let p = RotationPipeline::new(
            &record,
            &context,
            lmax,
            RotationSchedule::Even { count: 6 },
            4,
            9,
            DualConfig::default(),
        )
        .unwrap();
        let (limited, _) = band_limited_record(&record, &context, lmax).unwrap();
        let expected = rotational_surplus(&limited, &context, &RotationSchedule::Even { count: 6 }, 4, 9)
            .unwrap()
            .surplus;
        assert_eq!(p.observed().unwrap(), expected);
    }

    #[test]
    fn test_commutator_pipeline_null_and_recovery() {
        let mut rng = StdRng::seed_from_u64(11);
        let n = 400;
        let values: Vec<f64> = (0..n).map(|_| 0.5 + rng.random::<f64>()).collect();
        let weights_a: Vec<f64> = (0..n).map(|_| 1.0 + 0.2 * rng.random::<f64>()).collect();
        let weights_b: Vec<f64> = weights_a
            .iter()
            .map(|w| w * (0.7 + 0.6 * rng.random::<f64>()))
            .collect();
        let catalog = Catalog::new(values, weights_a, weights_b).unwrap();
        let p = CommutatorPipeline::new(catalog, CommutatorMode::Signed, DualConfig::default()).unwrap();
        let h = ValidationHarness::new(config(None), EngineConfig::default(), 5).unwrap();
        let null = h.run_null(&p).unwrap();
        null.require_unbiased().unwrap();
        let inj = h.run_injection(&p, &null.calibration).unwrap();
        assert!(inj.monotone);
        let top = inj.point(1.0).unwrap();
        assert!((top.recovered_mean - 1.0).abs() < 0.05, "{}", top.recovered_mean);
    }
}
