//! `pbc audit`: run every track and record the decoherence table.

use std::path::Path;

use pbc_core::{AuditRunner, DecoherenceTable, LedgerWriter, Result, TrackDetail};

use super::{cancel_on_ctrlc, fmt_sigma, load_config, write_json};

pub fn run(
    config_path: &Path,
    output: &Path,
    note: Option<&str>,
    report_path: Option<&Path>,
) -> Result<()> {
    let (config, base) = load_config(config_path)?;
    let fingerprint = config.fingerprint()?;
    let seed = config.seed;
    println!("Audit");
    println!("  Config:    {} ({})", config_path.display(), &fingerprint[..12]);
    println!("  Tracks:    {}", config.tracks.len());
    println!("  Seed:      {seed}");
    println!();

    let runner = AuditRunner::new(config)?.with_cancel_token(cancel_on_ctrlc());
    let report = runner.run_from_dir(&base)?;

    for track in &report.tracks {
        let detail = match &track.detail {
            TrackDetail::Phase => String::new(),
            TrackDetail::Coupling { posterior } => format!(
                "  λ = {:.4} ± {:.4}{}",
                posterior.amplitude(),
                posterior.covariance[0][0].max(0.0).sqrt(),
                if posterior.low_confidence { " (low confidence)" } else { "" }
            ),
            TrackDetail::Rotation { profile } => format!("  surplus = {:.3}", profile.surplus),
            TrackDetail::Commutator { result } => format!(
                "  Δz = {:+.5}, tension {:.2}",
                result.delta, result.tension
            ),
        };
        let injection = match &track.injection {
            Some(inj) if inj.certification.is_some() => {
                if inj.certified() { "  certified" } else { "  NOT certified" }
            }
            _ => "",
        };
        println!(
            "  {:<12} {:<20} {:>12.5} {:>9}  null {}{}{}",
            track.name,
            track.statistic.kind.name(),
            track.statistic.value,
            fmt_sigma(track.statistic.sigma()),
            track.null.bias_summary(),
            detail,
            injection
        );
    }

    print_table(&report.table);

    let mut writer = LedgerWriter::new(output, seed, &report.config_fingerprint)?;
    if let Some(n) = note {
        writer = writer.with_note(n);
    }
    let dir = writer.write_table(&report.table)?;
    println!("\nLedger saved to {}", dir.display());
    println!("  ledger.json  — metadata and records");
    println!("  ledger.csv   — one row per track");

    if let Some(path) = report_path {
        write_json(path, &report)?;
    }
    Ok(())
}

pub fn print_table(table: &DecoherenceTable) {
    println!("\n{:=<76}", "");
    println!("DECOHERENCE TABLE");
    println!("{:=<76}", "");
    println!(
        "  {:<16} {:>8} {:<12} {:<20} {:>9}  {}",
        "epoch", "z", "track", "statistic", "σ", "verdict"
    );
    println!("  {}", "-".repeat(74));
    for row in &table.rows {
        let z = row
            .epoch
            .redshift
            .map_or_else(|| "-".to_string(), |z| format!("{z:.2}"));
        println!(
            "  {:<16} {:>8} {:<12} {:<20} {:>9}  {}",
            row.epoch.label,
            z,
            row.statistic.track,
            row.statistic.kind.name(),
            fmt_sigma(row.statistic.sigma()),
            row.verdict
        );
    }
    println!(
        "\n  Thresholds: hard {}σ, soft {}σ — {}",
        table.thresholds.hard,
        table.thresholds.soft,
        if table.is_decohering() {
            "significance never rises toward later epochs"
        } else {
            "significance rises at a later epoch"
        }
    );
}
