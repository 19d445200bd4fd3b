//! `pbc ledger`: list recorded audit runs or show one.

use std::path::Path;

use pbc_core::{Ledger, Result, list_ledgers, read_ledger};

use super::fmt_sigma;

pub fn run(path: &Path, json: bool) -> Result<()> {
    if path.join("ledger.json").is_file() {
        let ledger = read_ledger(path)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&ledger)?);
        } else {
            show(&ledger);
        }
        return Ok(());
    }

    if !path.is_dir() {
        println!("No ledgers found in {}/", path.display());
        return Ok(());
    }
    let runs = list_ledgers(path)?;
    if runs.is_empty() {
        println!("No ledgers found in {}/", path.display());
        return Ok(());
    }

    println!(
        "  {:<32} {:<22} {:>6} {:>6} {:>11}",
        "run", "started", "tracks", "hard", "decohering"
    );
    for dir in &runs {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match read_ledger(dir) {
            Ok(ledger) => println!(
                "  {:<32} {:<22} {:>6} {:>6} {:>11}",
                name,
                ledger.meta.started_at,
                ledger.records.len(),
                ledger
                    .records
                    .iter()
                    .filter(|r| r.verdict == pbc_core::Verdict::HardLocked)
                    .count(),
                if ledger.meta.decohering { "yes" } else { "no" }
            ),
            Err(e) => println!("  {name:<32} (unreadable: {e})"),
        }
    }
    println!("\n{} ledger(s) in {}/", runs.len(), path.display());
    Ok(())
}

fn show(ledger: &Ledger) {
    let meta = &ledger.meta;
    println!("Ledger {}", meta.id);
    println!("  Started:     {}", meta.started_at);
    println!("  Finished:    {}", meta.finished_at);
    println!("  Seed:        {}", meta.seed);
    println!("  Config:      {}", meta.config_fingerprint);
    println!("  Thresholds:  hard {}σ, soft {}σ", meta.hard_threshold, meta.soft_threshold);
    println!("  Version:     {}", meta.pbc_version);
    if let Some(note) = &meta.note {
        println!("  Note:        {note}");
    }
    println!();
    for r in &ledger.records {
        println!(
            "  {:<12} {:<16} {:<20} {:>12.5} {:>9} {:>6}  {}",
            r.track,
            r.epoch,
            r.statistic_name,
            r.value,
            fmt_sigma(Some(r.significance_sigma)),
            r.ensemble_size,
            r.verdict
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbc_core::{LedgerWriter, VerdictThresholds, aggregate};

    #[test]
    fn test_lists_and_shows_runs() {
        let dir = tempfile::tempdir().unwrap();
        let table = aggregate(Vec::new(), VerdictThresholds::default()).unwrap();
        let run_dir = LedgerWriter::new(dir.path(), 1, "abc")
            .unwrap()
            .write_table(&table)
            .unwrap();

        run(dir.path(), false).unwrap();
        run(&run_dir, true).unwrap();
        run(&dir.path().join("missing"), false).unwrap();
    }
}
