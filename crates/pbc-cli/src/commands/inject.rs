//! `pbc inject`: injection recovery of one track.

use std::path::Path;

use pbc_core::{Result, TrackInputs};

use super::{load_config, parse_list, print_injection, print_null, single_track_runner, write_json};

pub fn run(
    config_path: &Path,
    track: &str,
    amplitudes: Option<&str>,
    trials: Option<usize>,
    threads: Option<usize>,
    output: Option<&Path>,
) -> Result<()> {
    let (config, base) = load_config(config_path)?;
    let amplitudes = amplitudes.map(parse_list).transpose()?;
    let runner = single_track_runner(config, track, |h| {
        if let Some(a) = amplitudes {
            if h.certify_amplitude.is_some_and(|c| !a.contains(&c)) {
                h.certify_amplitude = None;
            }
            h.amplitudes = a;
        }
        if let Some(n) = trials {
            h.injection_trials = n;
        }
        if threads.is_some() {
            h.threads = threads;
        }
    })?;
    let track_config = runner.track_config(track)?;
    let inputs = TrackInputs::load(track_config, &base)?;
    let prepared = runner.prepare_track(track_config, &inputs)?;

    let null = prepared.harness.run_null(prepared.pipeline.as_ref())?;
    print_null(&null);
    null.require_unbiased()?;

    let report = prepared
        .harness
        .run_injection(prepared.pipeline.as_ref(), &null.calibration)?;
    print_injection(&report);

    if let Some(path) = output {
        write_json(path, &report)?;
    }
    Ok(())
}
