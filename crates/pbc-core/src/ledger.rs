//! Audit ledger persistence.
//!
//! Each audit run is a directory containing:
//! - `ledger.json`: run metadata plus every record
//! - `ledger.csv`: one row per record, stable column order

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decoherence::{DecoherenceRow, DecoherenceTable, Verdict};
use crate::error::Result;

/// CSV header; matches the field order of [`AuditRecord`].
pub const CSV_HEADER: &str = "track,epoch,statistic_name,value,significance_sigma,ensemble_size,verdict";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One persisted verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub track: String,
    pub epoch: String,
    pub statistic_name: String,
    pub value: f64,
    pub significance_sigma: f64,
    pub ensemble_size: usize,
    pub verdict: Verdict,
}

impl AuditRecord {
    pub fn from_row(row: &DecoherenceRow) -> Self {
        Self {
            track: row.statistic.track.clone(),
            epoch: row.epoch.label.clone(),
            statistic_name: row.statistic.kind.name().to_string(),
            value: row.statistic.value,
            significance_sigma: row.sigma(),
            ensemble_size: row.statistic.ensemble_size,
            verdict: row.verdict,
        }
    }

    fn csv_row(&self) -> String {
        format!(
            "{},{},{},{},{:.4},{},{}",
            csv_field(&self.track),
            csv_field(&self.epoch),
            self.statistic_name,
            self.value,
            self.significance_sigma,
            self.ensemble_size,
            self.verdict
        )
    }
}

/// Run metadata written to ledger.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerMeta {
    pub version: u32,
    pub id: String,
    pub started_at: String,
    pub finished_at: String,
    pub seed: u64,
    pub config_fingerprint: String,
    pub hard_threshold: f64,
    pub soft_threshold: f64,
    pub decohering: bool,
    pub note: Option<String>,
    pub pbc_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    pub meta: LedgerMeta,
    pub records: Vec<AuditRecord>,
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Writes one run directory; `finish` seals it with ledger.json.
pub struct LedgerWriter {
    run_dir: PathBuf,
    csv_writer: BufWriter<File>,
    records: Vec<AuditRecord>,
    started_at: UtcStamp,
    run_id: String,
    seed: u64,
    config_fingerprint: String,
    note: Option<String>,
}

impl LedgerWriter {
    /// Create `{output_dir}/{timestamp}-{run id prefix}` with an empty CSV.
    pub fn new(output_dir: &Path, seed: u64, config_fingerprint: &str) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = UtcStamp::now();
        let dir_name = format!("{}-{}", started_at.dir_label(), &run_id[..8]);

        let run_dir = output_dir.join(dir_name);
        fs::create_dir_all(&run_dir)?;
        let mut csv_writer = BufWriter::new(File::create(run_dir.join("ledger.csv"))?);
        writeln!(csv_writer, "{CSV_HEADER}")?;
        csv_writer.flush()?;

        Ok(Self {
            run_dir,
            csv_writer,
            records: Vec::new(),
            started_at,
            run_id,
            seed,
            config_fingerprint: config_fingerprint.to_string(),
            note: None,
        })
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn write_record(&mut self, record: AuditRecord) -> Result<()> {
        writeln!(self.csv_writer, "{}", record.csv_row())?;
        self.csv_writer.flush()?;
        self.records.push(record);
        Ok(())
    }

    /// Write every row of `table`, then ledger.json.
    pub fn write_table(mut self, table: &DecoherenceTable) -> Result<PathBuf> {
        for row in &table.rows {
            self.write_record(AuditRecord::from_row(row))?;
        }
        self.finish(table)
    }

    pub fn finish(mut self, table: &DecoherenceTable) -> Result<PathBuf> {
        self.csv_writer.flush()?;
        let meta = LedgerMeta {
            version: 1,
            id: self.run_id,
            started_at: self.started_at.to_string(),
            finished_at: UtcStamp::now().to_string(),
            seed: self.seed,
            config_fingerprint: self.config_fingerprint,
            hard_threshold: table.thresholds.hard,
            soft_threshold: table.thresholds.soft,
            decohering: table.is_decohering(),
            note: self.note,
            pbc_version: crate::VERSION.to_string(),
        };
        let ledger = Ledger {
            meta,
            records: self.records,
        };
        fs::write(self.run_dir.join("ledger.json"), serde_json::to_string_pretty(&ledger)?)?;
        Ok(self.run_dir)
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }
}

/// Load ledger.json from a run directory.
pub fn read_ledger(run_dir: &Path) -> Result<Ledger> {
    let contents = fs::read_to_string(run_dir.join("ledger.json"))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Run directories under `output_dir` that contain a ledger, oldest first.
pub fn list_ledgers(output_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(output_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.join("ledger.json").is_file())
        .collect();
    dirs.sort();
    Ok(dirs)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Wall-clock second in UTC, as stamped on run directories and ledger.json.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct UtcStamp {
    year: i64,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
}

impl UtcStamp {
    fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self::from_unix(secs as i64)
    }

    /// Leap seconds are not represented.
    fn from_unix(secs: i64) -> Self {
        let days = secs.div_euclid(86_400);
        let rem = secs.rem_euclid(86_400);
        let (year, month, day) = civil_date(days);
        Self {
            year,
            month,
            day,
            hour: (rem / 3600) as u32,
            minute: (rem / 60 % 60) as u32,
            second: (rem % 60) as u32,
        }
    }

    /// `2026-02-15T013000Z`: sortable and free of path-hostile colons.
    fn dir_label(&self) -> String {
        format!(
            "{:04}-{:02}-{:02}T{:02}{:02}{:02}Z",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

impl fmt::Display for UtcStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Proleptic Gregorian `(year, month, day)` of a day count from 1970-01-01,
/// computed over 400-year eras that start on March 1st.
fn civil_date(days: i64) -> (i64, u32, u32) {
    let shifted = days + 719_468;
    let era = shifted.div_euclid(146_097);
    let day_of_era = shifted.rem_euclid(146_097);
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let march_month = (5 * day_of_year + 2) / 153;
    let day = (day_of_year - (153 * march_month + 2) / 5 + 1) as u32;
    let month = (if march_month < 10 { march_month + 3 } else { march_month - 9 }) as u32;
    let year = year_of_era + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
