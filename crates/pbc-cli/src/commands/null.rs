//! `pbc null`: null ensemble of one track.

use std::path::Path;

use pbc_core::{Result, TrackInputs};

use super::{fmt_sigma, load_config, print_null, single_track_runner, write_json};

pub fn run(
    config_path: &Path,
    track: &str,
    trials: Option<usize>,
    threads: Option<usize>,
    output: Option<&Path>,
) -> Result<()> {
    let (config, base) = load_config(config_path)?;
    let runner = single_track_runner(config, track, |h| {
        if let Some(n) = trials {
            h.null_trials = n;
        }
        if threads.is_some() {
            h.threads = threads;
        }
    })?;
    let track_config = runner.track_config(track)?;
    let inputs = TrackInputs::load(track_config, &base)?;
    let prepared = runner.prepare_track(track_config, &inputs)?;

    let observed = prepared.pipeline.observed()?;
    println!("Track {track}: {} = {observed:.6}", prepared.pipeline.kind());
    let report = prepared.harness.run_null(prepared.pipeline.as_ref())?;
    print_null(&report);

    let statistic = runner
        .engine()
        .assess(track, report.kind, observed, Some(&report.calibration))?;
    println!("  Observed:     {}", fmt_sigma(statistic.sigma()));
    if statistic.undersized {
        println!("  (ensemble below the configured minimum; significance is indicative only)");
    }
    report.require_unbiased()?;

    if let Some(path) = output {
        write_json(path, &report)?;
    }
    Ok(())
}
