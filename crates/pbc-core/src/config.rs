//! Audit configuration.
//!
//! One JSON document holds the global settings and the list of tracks. Every
//! section has defaults, so a config file only needs its tracks.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::context::ContextSpec;
use crate::decoherence::{Epoch, VerdictThresholds};
use crate::dual::DualConfig;
use crate::engine::{Band, CommutatorMode, EngineConfig, RotationSchedule, StatisticKind};
use crate::error::{AuditError, Result};
use crate::frame::CoordinateFrame;
use crate::harness::HarnessConfig;
use crate::healpix::Healpix;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Working resolution of every map-based track.
    pub nside: u32,
    /// Band limit of records in coupling and rotation tracks. Observed and
    /// random-phase null maps share it.
    pub lmax: usize,
    /// Frame map tracks are analyzed in. Records and noise maps are stored
    /// in it.
    pub frame: CoordinateFrame,
    pub seed: u64,
    pub thresholds: VerdictThresholds,
    pub engine: EngineConfig,
    pub dual: DualConfig,
    pub harness: HarnessConfig,
    pub tracks: Vec<TrackConfig>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            nside: 64,
            lmax: 64,
            frame: CoordinateFrame::default(),
            seed: 0x5eed,
            thresholds: VerdictThresholds::default(),
            engine: EngineConfig::default(),
            dual: DualConfig::default(),
            harness: HarnessConfig::default(),
            tracks: Vec::new(),
        }
    }
}

/// Statistic of a track and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "statistic", rename_all = "snake_case")]
pub enum TrackKind {
    SGamma {
        band: Band,
        /// Jacobi refinement steps of the map analysis.
        #[serde(default)]
        iterations: usize,
    },
    CouplingAmplitude {
        /// Isotropic prior variance; `None` is uninformative.
        #[serde(default)]
        prior_variance: Option<f64>,
    },
    RotationalSurplus {
        schedule: RotationSchedule,
        relabelings: usize,
    },
    CommutatorDz {
        #[serde(default)]
        mode: CommutatorMode,
    },
}

impl TrackKind {
    pub fn statistic(&self) -> StatisticKind {
        match self {
            Self::SGamma { .. } => StatisticKind::SGamma,
            Self::CouplingAmplitude { .. } => StatisticKind::CouplingAmplitude,
            Self::RotationalSurplus { .. } => StatisticKind::RotationalSurplus,
            Self::CommutatorDz { .. } => StatisticKind::CommutatorDz,
        }
    }

    pub fn needs_maps(&self) -> bool {
        !matches!(self, Self::CommutatorDz { .. })
    }
}

/// Where a track's context maps come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSource {
    pub inputs: Vec<PathBuf>,
    pub spec: ContextSpec,
    #[serde(default)]
    pub mask: Option<PathBuf>,
    #[serde(default)]
    pub systematics: Vec<PathBuf>,
    /// Frame the inputs, mask and systematics are stored in. They are
    /// rotated to the audit frame before the context is built.
    #[serde(default)]
    pub frame: CoordinateFrame,
    /// Without a mask, keep pixels where the first input lies within this
    /// many standard deviations of its median.
    #[serde(default)]
    pub mask_threshold: Option<f64>,
}

impl ContextSource {
    pub fn new(inputs: Vec<PathBuf>, spec: ContextSpec) -> Self {
        Self {
            inputs,
            spec,
            mask: None,
            systematics: Vec::new(),
            frame: CoordinateFrame::default(),
            mask_threshold: None,
        }
    }
}

/// Foreground cleaning applied to a track's record before any statistic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordCleaning {
    /// Mask galactic latitudes `|b|` at or below this many degrees.
    pub galactic_cut_deg: Option<f64>,
    /// Fit and subtract monopole and dipole over the surviving pixels.
    pub remove_dipole: bool,
}

/// Noise covariance `D + W Wᵀ` of a map track, in units of the
/// standardized record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseSpec {
    /// Uniform diagonal variance, used when no variance map is given.
    pub white_variance: f64,
    /// Per-pixel variance map.
    pub variance_map: Option<PathBuf>,
    /// Maps used as the low-rank columns of `W`.
    pub modes: Vec<PathBuf>,
}

impl Default for NoiseSpec {
    fn default() -> Self {
        Self {
            white_variance: 1.0,
            variance_map: None,
            modes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackConfig {
    pub name: String,
    pub epoch: Epoch,
    #[serde(flatten)]
    pub kind: TrackKind,
    #[serde(default)]
    pub record: Option<PathBuf>,
    #[serde(default)]
    pub context: Option<ContextSource>,
    #[serde(default)]
    pub catalog: Option<PathBuf>,
    #[serde(default)]
    pub noise: NoiseSpec,
    #[serde(default)]
    pub cleaning: RecordCleaning,
    /// Replaces the global harness settings for this track.
    #[serde(default)]
    pub harness: Option<HarnessConfig>,
    #[serde(default = "default_true")]
    pub injection: bool,
}

fn default_true() -> bool {
    true
}

impl TrackConfig {
    pub fn new(name: impl Into<String>, epoch: Epoch, kind: TrackKind) -> Self {
        Self {
            name: name.into(),
            epoch,
            kind,
            record: None,
            context: None,
            catalog: None,
            noise: NoiseSpec::default(),
            cleaning: RecordCleaning::default(),
            harness: None,
            injection: true,
        }
    }
}

impl AuditConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Harness settings of `track`, falling back to the global ones.
    pub fn harness_for(&self, track: &TrackConfig) -> HarnessConfig {
        track.harness.clone().unwrap_or_else(|| self.harness.clone())
    }

    pub fn validate(&self) -> Result<()> {
        let healpix = Healpix::new(self.nside)?;
        let band_limit = 3 * self.nside as usize - 1;
        if self.lmax < 2 || self.lmax > band_limit {
            return Err(AuditError::config(format!(
                "lmax {} outside [2, {band_limit}] for nside {}",
                self.lmax,
                healpix.nside()
            )));
        }
        self.thresholds.validate()?;
        self.harness.validate()?;
        if !(self.dual.condition_threshold > 1.0) {
            return Err(AuditError::config("condition_threshold must exceed 1"));
        }
        if !(self.engine.gaussianity_alpha > 0.0 && self.engine.gaussianity_alpha < 1.0) {
            return Err(AuditError::config("gaussianity_alpha must lie in (0, 1)"));
        }

        let mut names = HashSet::new();
        for track in &self.tracks {
            if track.name.trim().is_empty() {
                return Err(AuditError::config("track names must not be empty"));
            }
            if !names.insert(track.name.as_str()) {
                return Err(AuditError::config(format!("duplicate track name {}", track.name)));
            }
            if let Some(h) = &track.harness {
                h.validate()?;
            }
            self.validate_track(track, band_limit)?;
        }
        Ok(())
    }

    fn validate_track(&self, track: &TrackConfig, band_limit: usize) -> Result<()> {
        let name = &track.name;
        if track.kind.needs_maps() {
            let Some(ctx) = &track.context else {
                return Err(AuditError::config(format!("track {name}: context is required")));
            };
            if ctx.spec.nside != self.nside {
                return Err(AuditError::config(format!(
                    "track {name}: context nside {} differs from audit nside {}",
                    ctx.spec.nside, self.nside
                )));
            }
            if ctx.inputs.is_empty() {
                return Err(AuditError::config(format!("track {name}: context has no inputs")));
            }
            if !(track.noise.white_variance > 0.0) {
                return Err(AuditError::config(format!("track {name}: white_variance must be positive")));
            }
            if let Some(sigma) = ctx.mask_threshold {
                if !(sigma > 0.0) {
                    return Err(AuditError::config(format!("track {name}: mask_threshold must be positive")));
                }
            }
            if let Some(b) = track.cleaning.galactic_cut_deg {
                if !(0.0..90.0).contains(&b) {
                    return Err(AuditError::config(format!(
                        "track {name}: galactic_cut_deg {b} outside [0, 90)"
                    )));
                }
            }
            if track.noise.modes.len() > self.dual.max_noise_rank {
                return Err(AuditError::RankCapExceeded {
                    what: format!("track {name} noise modes"),
                    rank: track.noise.modes.len(),
                    cap: self.dual.max_noise_rank,
                });
            }
        }
        match &track.kind {
            TrackKind::SGamma { band, .. } => {
                if band.lmin > band.lmax || band.lmax > band_limit {
                    return Err(AuditError::config(format!(
                        "track {name}: band [{}, {}] invalid for nside {}",
                        band.lmin, band.lmax, self.nside
                    )));
                }
            }
            TrackKind::CouplingAmplitude {
                prior_variance: Some(v),
            } if !(*v > 0.0) => {
                return Err(AuditError::config(format!("track {name}: prior_variance must be positive")));
            }
            TrackKind::RotationalSurplus { schedule, relabelings } => {
                if schedule.count() < 2 || *relabelings < 2 {
                    return Err(AuditError::config(format!(
                        "track {name}: rotation needs at least 2 angles and 2 relabelings"
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// SHA-256 of the canonical JSON encoding.
    pub fn fingerprint(&self) -> Result<String> {
        let json = serde_json::to_string(self)?;
        let digest = Sha256::digest(json.as_bytes());
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CombinationRule;

    fn phase_track(name: &str) -> TrackConfig {
        let mut track = TrackConfig::new(
            name,
            Epoch::new("recombination", Some(1100.0)),
            TrackKind::SGamma {
                band: Band::new(2, 32),
                iterations: 0,
            },
        );
        track.record = Some("record.json".into());
        track.context = Some(ContextSource::new(
            vec!["hits.json".into()],
            ContextSpec::new(64, CombinationRule::WeightedSum { weights: vec![1.0] }),
        ));
        track
    }

    #[test]
    fn test_defaults_validate() {
        AuditConfig::default().validate().unwrap();
        let config = AuditConfig {
            tracks: vec![phase_track("P1")],
            ..AuditConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_json_round_trip_keeps_fingerprint() {
        let config = AuditConfig {
            tracks: vec![phase_track("P1")],
            ..AuditConfig::default()
        };
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"statistic\": \"s_gamma\""));
        let back: AuditConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        assert_eq!(back.fingerprint().unwrap(), config.fingerprint().unwrap());
        assert_eq!(config.fingerprint().unwrap().len(), 64);
    }

    #[test]
    fn test_sparse_json_uses_defaults() {
        let config: AuditConfig = serde_json::from_str(r#"{"seed": 9}"#).unwrap();
        assert_eq!(config.seed, 9);
        assert_eq!(config.nside, 64);
        assert_eq!(config.thresholds.hard, 5.0);
    }

    #[test]
    fn test_cleaning_and_frame_options_parse() {
        let json = r#"{
            "frame": "ecliptic",
            "tracks": [{
                "name": "P1",
                "epoch": {"label": "recombination", "redshift": 1100.0},
                "statistic": "coupling_amplitude",
                "record": "record.json",
                "context": {
                    "inputs": ["hits.json"],
                    "spec": {"nside": 64, "rule": {"rule": "weighted_sum", "weights": [1.0]}},
                    "mask_threshold": 10.0
                },
                "cleaning": {"galactic_cut_deg": 20.0, "remove_dipole": true}
            }]
        }"#;
        let config: AuditConfig = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.frame, CoordinateFrame::Ecliptic);
        let track = &config.tracks[0];
        assert_eq!(track.cleaning.galactic_cut_deg, Some(20.0));
        assert!(track.cleaning.remove_dipole);
        let source = track.context.as_ref().unwrap();
        assert_eq!(source.frame, CoordinateFrame::Galactic);
        assert_eq!(source.mask_threshold, Some(10.0));
    }

    #[test]
    fn test_rejects_bad_cleaning_options() {
        let mut track = phase_track("P1");
        track.cleaning.galactic_cut_deg = Some(90.0);
        let config = AuditConfig {
            tracks: vec![track],
            ..AuditConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().kind(), "invalid_config");

        let mut track = phase_track("P1");
        if let Some(source) = track.context.as_mut() {
            source.mask_threshold = Some(0.0);
        }
        let config = AuditConfig {
            tracks: vec![track],
            ..AuditConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().kind(), "invalid_config");
    }

    #[test]
    fn test_rejects_inconsistent_tracks() {
        let mut dup = AuditConfig {
            tracks: vec![phase_track("P1"), phase_track("P1")],
            ..AuditConfig::default()
        };
        assert_eq!(dup.validate().unwrap_err().kind(), "invalid_config");

        dup.tracks.pop();
        dup.tracks[0].context = None;
        assert!(dup.validate().is_err());

        let mut wrong_nside = AuditConfig {
            tracks: vec![phase_track("P1")],
            ..AuditConfig::default()
        };
        wrong_nside.nside = 32;
        assert!(wrong_nside.validate().is_err());

        let bad_res = AuditConfig {
            nside: 100,
            ..AuditConfig::default()
        };
        assert_eq!(bad_res.validate().unwrap_err().kind(), "invalid_resolution");

        let commutator = AuditConfig {
            tracks: vec![TrackConfig::new(
                "P5",
                Epoch::new("late", Some(0.7)),
                TrackKind::CommutatorDz {
                    mode: CommutatorMode::Signed,
                },
            )],
            ..AuditConfig::default()
        };
        commutator.validate().unwrap();

        let mut rotation = phase_track("P6");
        rotation.kind = TrackKind::RotationalSurplus {
            schedule: RotationSchedule::Even { count: 8 },
            relabelings: 1,
        };
        let rotation = AuditConfig {
            tracks: vec![rotation],
            ..AuditConfig::default()
        };
        assert!(rotation.validate().is_err());
    }
}
