//! Decoherence Aggregator: verdicts per epoch, ordered from past to present.

use serde::{Deserialize, Serialize};

use crate::engine::TrackStatistic;
use crate::error::{AuditError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerdictThresholds {
    /// `|σ|` at or above which a track is Hard-Locked.
    pub hard: f64,
    /// `|σ|` at or above which a track is Soft-Locked.
    pub soft: f64,
}

impl Default for VerdictThresholds {
    fn default() -> Self {
        Self { hard: 5.0, soft: 2.0 }
    }
}

impl VerdictThresholds {
    pub fn validate(&self) -> Result<()> {
        if !(self.soft > 0.0 && self.hard > self.soft && self.hard.is_finite()) {
            return Err(AuditError::config(format!(
                "verdict thresholds need hard > soft > 0, got hard {} soft {}",
                self.hard, self.soft
            )));
        }
        Ok(())
    }

    /// Lower bounds are inclusive: exactly `hard` σ is Hard-Locked.
    pub fn verdict(&self, sigma: f64) -> Verdict {
        let s = sigma.abs();
        if s >= self.hard {
            Verdict::HardLocked
        } else if s >= self.soft {
            Verdict::SoftLocked
        } else {
            Verdict::Decohered
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "Hard-Locked")]
    HardLocked,
    #[serde(rename = "Soft-Locked")]
    SoftLocked,
    #[serde(rename = "Decohered")]
    Decohered,
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Self::HardLocked => "Hard-Locked",
            Self::SoftLocked => "Soft-Locked",
            Self::Decohered => "Decohered",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Observation epoch of a track; higher redshift is earlier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epoch {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redshift: Option<f64>,
}

impl Epoch {
    pub fn new(label: impl Into<String>, redshift: Option<f64>) -> Self {
        Self {
            label: label.into(),
            redshift,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoherenceRow {
    pub epoch: Epoch,
    pub statistic: TrackStatistic,
    pub verdict: Verdict,
}

impl DecoherenceRow {
    pub fn sigma(&self) -> f64 {
        self.statistic.sigma().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoherenceTable {
    pub thresholds: VerdictThresholds,
    /// Past to present.
    pub rows: Vec<DecoherenceRow>,
}

impl DecoherenceTable {
    /// Significance never increases from earlier to later epochs.
    pub fn is_decohering(&self) -> bool {
        self.rows
            .windows(2)
            .all(|w| w[1].sigma().abs() <= w[0].sigma().abs())
    }

    pub fn count(&self, verdict: Verdict) -> usize {
        self.rows.iter().filter(|r| r.verdict == verdict).count()
    }
}

/// Verdict per calibrated statistic, ordered by redshift descending; rows
/// without a redshift go last, ties by track name.
pub fn aggregate(
    entries: Vec<(Epoch, TrackStatistic)>,
    thresholds: VerdictThresholds,
) -> Result<DecoherenceTable> {
    thresholds.validate()?;
    let mut rows = entries
        .into_iter()
        .map(|(epoch, statistic)| {
            let sigma = statistic.sigma().ok_or_else(|| AuditError::CalibrationMissing {
                track: statistic.track.clone(),
                statistic: statistic.kind.name().to_string(),
            })?;
            Ok(DecoherenceRow {
                epoch,
                verdict: thresholds.verdict(sigma),
                statistic,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    rows.sort_by(|a, b| {
        let by_z = match (a.epoch.redshift, b.epoch.redshift) {
            (Some(za), Some(zb)) => zb.total_cmp(&za),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        };
        by_z.then_with(|| a.statistic.track.cmp(&b.statistic.track))
    });
    Ok(DecoherenceTable { thresholds, rows })
}
