//! # pbc-core
//!
//! **Audit survey data for coupling to the way it was observed.**
//!
//! `pbc-core` tests whether an observed sky signal (the *Record*) is
//! statistically locked to the geometry that acquired it (the *Context*:
//! hit counts, scan stripes, zodiacal light). A dependency that survives
//! calibrated nulls is a sign the "signal" carries the instrument's
//! fingerprint.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pbc_core::{
//!     Band, CombinationRule, ContextRequest, ContextSpec, EngineConfig, HarnessConfig,
//!     PhasePipeline, DualConfig, ValidationHarness, build_context, mock,
//! };
//!
//! let sky = mock::MockSky::generate(64, 64, 7).unwrap();
//! let spec = ContextSpec::new(64, CombinationRule::WeightedSum { weights: vec![1.0] });
//! let inputs = [sky.scan.clone()];
//! let context = build_context(&ContextRequest::new(&inputs, &spec)).unwrap();
//!
//! let pipeline = PhasePipeline::new(
//!     &sky.record, &context, Band::new(2, 64), 0, &EngineConfig::default(), DualConfig::default(),
//! ).unwrap();
//! let harness = ValidationHarness::new(HarnessConfig::default(), EngineConfig::default(), 7).unwrap();
//! let null = harness.run_null(&pipeline).unwrap();
//! println!("null mean {:.4} ± {:.4}", null.mean, null.std_error);
//! ```
//!
//! ## Architecture
//!
//! Maps → Context Builder → Statistic (S_γ, dual posterior, rotation, Δz)
//! → Null / injection ensembles → Calibrated σ → Decoherence table → Ledger
//!
//! Every statistic is converted to a significance only against its own
//! empirical null; nothing is compared to a textbook distribution unless the
//! null passed a Gaussianity check first.

pub mod audit;
pub mod config;
pub mod context;
pub mod decoherence;
pub mod dual;
pub mod engine;
pub mod error;
pub mod frame;
pub mod harmonic;
pub mod harness;
pub mod healpix;
pub mod ledger;
pub mod linalg;
pub mod mock;
pub mod pixel;

pub use audit::{
    AuditReport, AuditRunner, ContextSummary, PreparedTrack, TrackDetail, TrackInputs, TrackReport,
};
pub use config::{
    AuditConfig, ContextSource, NoiseSpec, RecordCleaning, TrackConfig, TrackKind,
};
pub use context::{
    CombinationRule, ContextRequest, ContextSpec, ContextVector, InputTransform, Normalization,
    ResamplePolicy, build_context,
};
pub use decoherence::{
    DecoherenceRow, DecoherenceTable, Epoch, Verdict, VerdictThresholds, aggregate,
};
pub use dual::{
    CouplingPosterior, DualConfig, NoiseModel, Prior, estimate_coupling, estimate_map_coupling,
};
pub use engine::{
    Band, Calibration, Catalog, CommutatorMode, CommutatorResult, EngineConfig, RotationProfile,
    RotationSchedule, StatisticEngine, StatisticKind, TrackStatistic, commutator, phase_alignment,
    rotational_surplus,
};
pub use error::{AuditError, NumericalWarning, Result};
pub use frame::CoordinateFrame;
pub use harmonic::{Alm, power_law_cl};
pub use harness::{
    BiasTolerance, CancelToken, CommutatorPipeline, CouplingPipeline, HarnessConfig,
    InjectionPoint, InjectionReport, NullReport, PhasePipeline, RotationPipeline, TrialPipeline,
    ValidationHarness,
};
pub use healpix::Healpix;
pub use ledger::{AuditRecord, Ledger, LedgerMeta, LedgerWriter, list_ledgers, read_ledger};
pub use pixel::{PixelMap, UNSEEN};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
