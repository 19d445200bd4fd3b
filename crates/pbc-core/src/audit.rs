//! Audit runner: configuration in, decoherence table out.
//!
//! Per track: build the context, compute the observed statistic, run the null
//! ensemble (bias asserted), optionally the injection ensemble, then assess
//! significance against the null calibration. All tracks are aggregated into
//! one [`DecoherenceTable`].

use std::path::Path;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{AuditConfig, ContextSource, RecordCleaning, TrackConfig, TrackKind};
use crate::context::{ContextRequest, ContextVector, build_context};
use crate::decoherence::{DecoherenceTable, Epoch, aggregate};
use crate::dual::{CouplingPosterior, NoiseModel, Prior};
use crate::engine::{Catalog, CommutatorResult, RotationProfile, StatisticEngine, TrackStatistic, commutator};
use crate::error::{AuditError, Result};
use crate::frame::CoordinateFrame;
use crate::harness::{
    CancelToken, CommutatorPipeline, CouplingPipeline, InjectionReport, NullReport, PhasePipeline,
    RotationPipeline, TrialPipeline, ValidationHarness, trial_seed,
};
use crate::ledger::AuditRecord;
use crate::pixel::PixelMap;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Data of one track, already in memory.
#[derive(Debug, Clone, Default)]
pub struct TrackInputs {
    pub record: Option<PixelMap>,
    pub context_maps: Vec<PixelMap>,
    /// Context validity at the context resolution, in the source frame.
    pub mask: Option<Vec<bool>>,
    pub systematics: Vec<PixelMap>,
    /// Per-pixel noise variance.
    pub noise_variance: Option<PixelMap>,
    /// Low-rank noise columns.
    pub noise_modes: Vec<PixelMap>,
    pub catalog: Option<Catalog>,
}

impl TrackInputs {
    pub fn maps(record: PixelMap, context_maps: Vec<PixelMap>) -> Self {
        Self {
            record: Some(record),
            context_maps,
            ..Self::default()
        }
    }

    pub fn catalog(catalog: Catalog) -> Self {
        Self {
            catalog: Some(catalog),
            ..Self::default()
        }
    }

    /// Read every file a track references; relative paths resolve against `base`.
    pub fn load(track: &TrackConfig, base: &Path) -> Result<Self> {
        let name = &track.name;
        let mut inputs = Self::default();
        if track.kind.needs_maps() {
            let record = track
                .record
                .as_ref()
                .ok_or_else(|| AuditError::config(format!("track {name}: record is required")))?;
            inputs.record = Some(PixelMap::load(&base.join(record))?);
            if let Some(source) = &track.context {
                inputs.context_maps = source
                    .inputs
                    .iter()
                    .map(|p| PixelMap::load(&base.join(p)))
                    .collect::<Result<_>>()?;
                inputs.systematics = source
                    .systematics
                    .iter()
                    .map(|p| PixelMap::load(&base.join(p)))
                    .collect::<Result<_>>()?;
                if let Some(mask) = &source.mask {
                    let map = PixelMap::load(&base.join(mask))?;
                    inputs.mask = Some(
                        (0..map.len())
                            .map(|p| map.is_valid(p) && map.values()[p] > 0.0)
                            .collect(),
                    );
                }
            }
            if let Some(path) = &track.noise.variance_map {
                inputs.noise_variance = Some(PixelMap::load(&base.join(path))?);
            }
            inputs.noise_modes = track
                .noise
                .modes
                .iter()
                .map(|p| PixelMap::load(&base.join(p)))
                .collect::<Result<_>>()?;
        } else {
            let path = track
                .catalog
                .as_ref()
                .ok_or_else(|| AuditError::config(format!("track {name}: catalog is required")))?;
            let text = std::fs::read_to_string(base.join(path))?;
            let catalog: Catalog = serde_json::from_str(&text)?;
            catalog.validate()?;
            inputs.catalog = Some(catalog);
        }
        Ok(inputs)
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub rule: String,
    pub n_valid: usize,
    pub f_sky: f64,
    pub raw_mean: f64,
    pub raw_std: f64,
}

impl ContextSummary {
    fn new(context: &ContextVector, npix: usize) -> Self {
        Self {
            rule: context.rule.clone(),
            n_valid: context.len(),
            f_sky: context.len() as f64 / npix as f64,
            raw_mean: context.raw_mean,
            raw_std: context.raw_std,
        }
    }
}

/// Observed-data detail specific to the track's statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "detail", rename_all = "snake_case")]
pub enum TrackDetail {
    Phase,
    Coupling { posterior: CouplingPosterior },
    Rotation { profile: RotationProfile },
    Commutator { result: CommutatorResult },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackReport {
    pub name: String,
    pub epoch: Epoch,
    pub statistic: TrackStatistic,
    pub context: Option<ContextSummary>,
    pub detail: TrackDetail,
    pub null: NullReport,
    pub injection: Option<InjectionReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub seed: u64,
    pub config_fingerprint: String,
    pub tracks: Vec<TrackReport>,
    pub table: DecoherenceTable,
}

impl AuditReport {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.table.rows.iter().map(AuditRecord::from_row).collect()
    }

    pub fn track(&self, name: &str) -> Option<&TrackReport> {
        self.tracks.iter().find(|t| t.name == name)
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// A track ready to run: its pipeline, the harness seeded for it, and the
/// observed-data summaries computed while building the pipeline.
pub struct PreparedTrack {
    pub pipeline: Box<dyn TrialPipeline>,
    pub context: Option<ContextSummary>,
    pub detail: TrackDetail,
    pub harness: ValidationHarness,
}

pub struct AuditRunner {
    config: AuditConfig,
    engine: StatisticEngine,
    cancel: CancelToken,
}

impl AuditRunner {
    pub fn new(config: AuditConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            engine: StatisticEngine::new(config.engine.clone()),
            config,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn engine(&self) -> &StatisticEngine {
        &self.engine
    }

    /// Seed of one track, derived from the audit seed and the track name.
    pub fn track_seed(&self, track: &str) -> u64 {
        let digest = trial_seed(self.config.seed, &format!("track/{track}"), 0);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(bytes)
    }

    /// Load every track's inputs relative to `base` and run the audit.
    pub fn run_from_dir(&self, base: &Path) -> Result<AuditReport> {
        let inputs = self
            .config
            .tracks
            .iter()
            .map(|t| TrackInputs::load(t, base))
            .collect::<Result<Vec<_>>>()?;
        self.run(&inputs)
    }

    /// `inputs[i]` belongs to `config.tracks[i]`.
    pub fn run(&self, inputs: &[TrackInputs]) -> Result<AuditReport> {
        if inputs.len() != self.config.tracks.len() {
            return Err(AuditError::dims("track inputs", self.config.tracks.len(), inputs.len()));
        }
        let mut tracks = Vec::with_capacity(inputs.len());
        for (track, input) in self.config.tracks.iter().zip(inputs) {
            tracks.push(self.run_track(track, input)?);
        }
        let table = aggregate(
            tracks
                .iter()
                .map(|t| (t.epoch.clone(), t.statistic.clone()))
                .collect(),
            self.config.thresholds,
        )?;
        for row in &table.rows {
            info!(
                "{:<12} {:<22} {:>8.3}σ  {}",
                row.statistic.track,
                row.statistic.kind.name(),
                row.sigma(),
                row.verdict
            );
        }
        if !table.is_decohering() {
            info!("Significance does not decrease monotonically from past to present");
        }
        Ok(AuditReport {
            seed: self.config.seed,
            config_fingerprint: self.config.fingerprint()?,
            tracks,
            table,
        })
    }

    /// Configuration of the track called `name`.
    pub fn track_config(&self, name: &str) -> Result<&TrackConfig> {
        self.config
            .tracks
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| AuditError::config(format!("no track named {name}")))
    }

    /// Build the track's pipeline and seeded harness without running any trials.
    pub fn prepare_track(&self, track: &TrackConfig, inputs: &TrackInputs) -> Result<PreparedTrack> {
        let seed = self.track_seed(&track.name);
        let harness = ValidationHarness::new(self.config.harness_for(track), self.config.engine.clone(), seed)?
            .with_cancel_token(self.cancel.clone());
        let dual = self.config.dual.clone();
        info!("Track {}: {}", track.name, track.kind.statistic());

        let (pipeline, context, detail): (Box<dyn TrialPipeline>, Option<ContextSummary>, TrackDetail) =
            match &track.kind {
                TrackKind::CommutatorDz { mode } => {
                    let catalog = inputs.catalog.clone().ok_or_else(|| {
                        AuditError::config(format!("track {}: catalog is required", track.name))
                    })?;
                    let result = commutator(&catalog, *mode)?;
                    let pipeline: Box<dyn TrialPipeline> =
                        Box::new(CommutatorPipeline::new(catalog, *mode, dual)?);
                    (pipeline, None, TrackDetail::Commutator { result })
                }
                TrackKind::SGamma { band, iterations } => {
                    let (record, ctx) = self.map_inputs(track, inputs)?;
                    let pipeline: Box<dyn TrialPipeline> = Box::new(PhasePipeline::new(
                        &record,
                        &ctx,
                        *band,
                        *iterations,
                        &self.config.engine,
                        dual,
                    )?);
                    (pipeline, Some(ContextSummary::new(&ctx, record.len())), TrackDetail::Phase)
                }
                TrackKind::CouplingAmplitude { prior_variance } => {
                    let (record, ctx) = self.map_inputs(track, inputs)?;
                    let prior = match prior_variance {
                        Some(v) => Prior::isotropic(1, *v)?,
                        None => Prior::uninformative(1),
                    };
                    let noise = self.noise_model(track, inputs, &record)?;
                    let coupling = CouplingPipeline::new(&record, &ctx, self.config.lmax, prior, noise, dual)?;
                    let posterior = coupling.posterior()?;
                    if let Some(w) = &posterior.warning {
                        warn!("Track {}: {w}", track.name);
                    }
                    let pipeline: Box<dyn TrialPipeline> = Box::new(coupling);
                    (
                        pipeline,
                        Some(ContextSummary::new(&ctx, record.len())),
                        TrackDetail::Coupling { posterior },
                    )
                }
                TrackKind::RotationalSurplus { schedule, relabelings } => {
                    let (record, ctx) = self.map_inputs(track, inputs)?;
                    let rotation = RotationPipeline::new(
                        &record,
                        &ctx,
                        self.config.lmax,
                        *schedule,
                        *relabelings,
                        seed,
                        dual,
                    )?;
                    let profile = rotation.profile()?;
                    let pipeline: Box<dyn TrialPipeline> = Box::new(rotation);
                    (
                        pipeline,
                        Some(ContextSummary::new(&ctx, record.len())),
                        TrackDetail::Rotation { profile },
                    )
                }
            };

        Ok(PreparedTrack {
            pipeline,
            context,
            detail,
            harness,
        })
    }

    pub fn run_track(&self, track: &TrackConfig, inputs: &TrackInputs) -> Result<TrackReport> {
        let PreparedTrack {
            pipeline,
            context,
            detail,
            harness,
        } = self.prepare_track(track, inputs)?;
        let kind = pipeline.kind();
        let observed = pipeline.observed()?;
        let null = harness.run_null(pipeline.as_ref())?;
        null.require_unbiased()?;
        let statistic = self
            .engine
            .assess(&track.name, kind, observed, Some(&null.calibration))?;
        let injection = if track.injection && !harness.config().amplitudes.is_empty() {
            let report = harness.run_injection(pipeline.as_ref(), &null.calibration)?;
            if report.certification.as_ref().is_some_and(|c| !c.certified) {
                warn!("Track {}: sensitivity not certified", track.name);
            }
            Some(report)
        } else {
            None
        };

        Ok(TrackReport {
            name: track.name.clone(),
            epoch: track.epoch.clone(),
            statistic,
            context,
            detail,
            null,
            injection,
        })
    }

    /// Cleaned record and context of a map track, both in the audit frame.
    fn map_inputs(&self, track: &TrackConfig, inputs: &TrackInputs) -> Result<(PixelMap, ContextVector)> {
        let name = &track.name;
        let record = inputs
            .record
            .as_ref()
            .ok_or_else(|| AuditError::config(format!("track {name}: record is required")))?;
        let source = track
            .context
            .as_ref()
            .ok_or_else(|| AuditError::config(format!("track {name}: context is required")))?;
        let record = clean_record(record, &track.cleaning, self.config.frame)?;

        let (from, to) = (source.frame, self.config.frame);
        if from != to {
            info!("Track {name}: rotating context inputs from {from} to {to}");
        }
        let context_maps: Vec<PixelMap> =
            inputs.context_maps.iter().map(|m| m.rotate_frame(from, to)).collect();
        let systematics: Vec<PixelMap> =
            inputs.systematics.iter().map(|m| m.rotate_frame(from, to)).collect();
        let mask = context_mask(source, inputs.mask.as_deref(), &context_maps, to)?;

        let mut request = ContextRequest::new(&context_maps, &source.spec).with_systematics(&systematics);
        if let Some(mask) = &mask {
            request = request.with_mask(mask);
        }
        Ok((record, build_context(&request)?))
    }

    fn noise_model(&self, track: &TrackConfig, inputs: &TrackInputs, record: &PixelMap) -> Result<NoiseModel> {
        let npix = record.len();
        let diagonal = match &inputs.noise_variance {
            Some(map) => {
                record.ensure_same_resolution(map, "noise variance")?;
                (0..npix)
                    .map(|p| {
                        if map.is_valid(p) {
                            map.values()[p]
                        } else {
                            track.noise.white_variance
                        }
                    })
                    .collect()
            }
            None => vec![track.noise.white_variance; npix],
        };
        let mut columns = Vec::with_capacity(inputs.noise_modes.len());
        for mode in &inputs.noise_modes {
            record.ensure_same_resolution(mode, "noise mode")?;
            columns.push(mode.zero_filled());
        }
        NoiseModel::diagonal(diagonal)?.with_low_rank(columns)
    }
}

/// Galactic cut, then monopole and dipole removal, of a record stored in `frame`.
pub fn clean_record(record: &PixelMap, cleaning: &RecordCleaning, frame: CoordinateFrame) -> Result<PixelMap> {
    let mut cleaned = match cleaning.galactic_cut_deg {
        Some(b) => {
            let cut = record.with_galactic_cut(b, frame)?;
            debug!("Galactic cut |b| > {b}°: f_sky {:.3} -> {:.3}", record.f_sky(), cut.f_sky());
            cut
        }
        None => record.clone(),
    };
    if cleaning.remove_dipole {
        let (residual, [mono, dx, dy, dz]) = cleaned.remove_dipole()?;
        debug!("Removed monopole {mono:.4e}, dipole ({dx:.4e}, {dy:.4e}, {dz:.4e})");
        cleaned = residual;
    }
    Ok(cleaned)
}

/// Validity mask of a context at the audit frame and the context resolution:
/// the given mask rotated from the source frame, else a threshold mask of the
/// first (already rotated) input when the source asks for one.
fn context_mask(
    source: &ContextSource,
    mask: Option<&[bool]>,
    rotated_inputs: &[PixelMap],
    frame: CoordinateFrame,
) -> Result<Option<Vec<bool>>> {
    let nside = source.spec.nside;
    if let Some(mask) = mask {
        let map = PixelMap::constant(nside, 1.0)?.with_mask(mask.to_vec())?;
        return Ok(Some(map.rotate_frame(source.frame, frame).validity()));
    }
    let (Some(sigma), Some(first)) = (source.mask_threshold, rotated_inputs.first()) else {
        return Ok(None);
    };
    let masked = first.threshold_mask(sigma).degrade(nside)?;
    debug!("Threshold mask at {sigma}σ keeps f_sky {:.3}", masked.f_sky());
    Ok(Some(masked.validity()))
}
