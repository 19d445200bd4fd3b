pub mod audit;
pub mod context;
pub mod inject;
pub mod ledger;
pub mod mock;
pub mod null;

use std::path::{Path, PathBuf};

use pbc_core::{
    AuditConfig, AuditError, AuditRunner, CancelToken, InjectionReport, NullReport, Result,
};

/// Cancel token that Ctrl+C trips. Running trials finish; no new ones start.
pub fn cancel_on_ctrlc() -> CancelToken {
    let token = CancelToken::new();
    let handle = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, finishing running trials...");
        handle.cancel();
    }) {
        eprintln!("Warning: could not install Ctrl+C handler: {e}");
    }
    token
}

/// Load and validate an audit config. Returns it with the directory its
/// relative paths resolve against.
pub fn load_config(path: &Path) -> Result<(AuditConfig, PathBuf)> {
    let config = AuditConfig::load(path)?;
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((config, base))
}

/// Runner for a single track with its harness settings pinned into the
/// global ones, so command-line overrides apply to it.
pub fn single_track_runner(
    mut config: AuditConfig,
    track: &str,
    adjust: impl FnOnce(&mut pbc_core::HarnessConfig),
) -> Result<AuditRunner> {
    let pos = config
        .tracks
        .iter()
        .position(|t| t.name == track)
        .ok_or_else(|| invalid(format!("no track named {track}")))?;
    let mut selected = config.tracks.swap_remove(pos);
    let mut harness = config.harness_for(&selected);
    adjust(&mut harness);
    selected.harness = None;
    config.harness = harness;
    config.tracks = vec![selected];
    Ok(AuditRunner::new(config)?.with_cancel_token(cancel_on_ctrlc()))
}

pub fn invalid(reason: impl Into<String>) -> AuditError {
    AuditError::InvalidConfig {
        reason: reason.into(),
    }
}

/// Parse "0,0.01,0.05" into numbers.
pub fn parse_list(s: &str) -> Result<Vec<f64>> {
    s.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.parse::<f64>().map_err(|_| invalid(format!("not a number: {v}"))))
        .collect()
}

pub fn fmt_sigma(sigma: Option<f64>) -> String {
    match sigma {
        Some(s) => format!("{s:+.2}σ"),
        None => "n/a".to_string(),
    }
}

pub fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    println!("\nResults written to {}", path.display());
    Ok(())
}

pub fn print_null(report: &NullReport) {
    println!("\n{:=<68}", "");
    println!("NULL ENSEMBLE — {}", report.kind);
    println!("{:=<68}", "");
    println!("  Trials:       {}/{} completed", report.completed, report.requested);
    if report.failed > 0 {
        println!(
            "  Failed:       {} (first: {})",
            report.failed,
            report.first_failure.as_deref().unwrap_or("?")
        );
    }
    println!("  Mean:         {:.6} ± {:.6}", report.mean, report.std_error);
    println!("  Std dev:      {:.6}", report.std_dev);
    println!("  Bias:         {}", report.bias_summary());
    println!(
        "  Calibration:  {} tail, {} samples",
        match report.calibration.tail {
            pbc_stats::Tail::Upper => "upper",
            pbc_stats::Tail::TwoSided => "two-sided",
        },
        report.calibration.ensemble_size()
    );
}

pub fn print_injection(report: &InjectionReport) {
    println!("\n{:=<68}", "");
    println!(
        "INJECTION RECOVERY — {} (detection at {}σ)",
        report.kind, report.detection_sigma
    );
    println!("{:=<68}", "");
    println!(
        "  {:>10} {:>8} {:>14} {:>12} {:>10}",
        "amplitude", "trials", "recovered", "statistic", "detected"
    );
    for p in &report.points {
        println!(
            "  {:>10.4} {:>8} {:>14} {:>12.5} {:>9.1}%",
            p.amplitude,
            p.completed,
            format!("{:.4}±{:.4}", p.recovered_mean, p.recovered_std),
            p.statistic_mean,
            p.detection_rate * 100.0
        );
    }
    println!(
        "\n  Recovery monotone: {}",
        if report.monotone { "yes" } else { "NO" }
    );
    if let Some(c) = &report.certification {
        println!(
            "  Certified at {}: {} ({:.1}% detected, {:.1}% required)",
            c.amplitude,
            if c.certified { "yes" } else { "NO" },
            c.detection_rate * 100.0,
            c.required * 100.0
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("0, 0.01,0.05,").unwrap(), vec![0.0, 0.01, 0.05]);
        assert!(parse_list("0,x").is_err());
    }

    #[test]
    fn test_fmt_sigma() {
        assert_eq!(fmt_sigma(Some(3.0)), "+3.00σ");
        assert_eq!(fmt_sigma(None), "n/a");
    }
}
