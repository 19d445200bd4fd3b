//! `pbc mock`: write a synthetic sky and an audit config that runs on it.

use std::path::{Path, PathBuf};

use pbc_core::{
    AuditConfig, Band, CombinationRule, CommutatorMode, ContextRequest, ContextSource, ContextSpec,
    Epoch, Result, RotationSchedule, TrackConfig, TrackKind, build_context, mock,
};

pub struct MockOptions<'a> {
    pub output: &'a Path,
    pub nside: u32,
    pub lmax: usize,
    pub seed: u64,
    pub coupling: f64,
    pub objects: usize,
    pub catalog_coupling: f64,
}

pub fn run(opts: MockOptions) -> Result<()> {
    std::fs::create_dir_all(opts.output)?;

    let sky = mock::MockSky::generate(opts.nside, opts.lmax, opts.seed)?;
    let spec = ContextSpec::new(opts.nside, CombinationRule::WeightedSum { weights: vec![1.0] });
    let scan = [sky.scan.clone()];
    let context = build_context(&ContextRequest::new(&scan, &spec))?;
    let record = if opts.coupling != 0.0 {
        mock::couple(&sky.record, &context, opts.coupling)?
    } else {
        sky.record.clone()
    };
    let catalog = mock::catalog(opts.objects, opts.catalog_coupling, opts.seed)?;

    sky.scan.save(&opts.output.join("scan.json"))?;
    sky.zodi.save(&opts.output.join("zodi.json"))?;
    record.save(&opts.output.join("record.json"))?;
    std::fs::write(
        opts.output.join("catalog.json"),
        serde_json::to_string_pretty(&catalog)?,
    )?;

    let config = mock_config(&opts, spec);
    config.validate()?;
    let config_path = opts.output.join("audit.json");
    config.save(&config_path)?;

    println!("Mock sky written to {}", opts.output.display());
    println!("  scan.json     — hit-count map (nside {})", opts.nside);
    println!("  zodi.json     — zodiacal light proxy");
    println!("  record.json   — record, coupling {}", opts.coupling);
    println!("  catalog.json  — {} objects, weight tilt {}", opts.objects, opts.catalog_coupling);
    println!("  audit.json    — {} tracks", config.tracks.len());
    println!("\nRun it with: pbc audit --config {}", config_path.display());
    Ok(())
}

fn mock_config(opts: &MockOptions, spec: ContextSpec) -> AuditConfig {
    let source = ContextSource::new(vec![PathBuf::from("scan.json")], spec);
    let map_track = |name: &str, epoch: Epoch, kind: TrackKind| {
        let mut track = TrackConfig::new(name, epoch, kind);
        track.record = Some(PathBuf::from("record.json"));
        track.context = Some(source.clone());
        track
    };

    let mut commutator = TrackConfig::new(
        "P5",
        Epoch::new("late-time", Some(0.7)),
        TrackKind::CommutatorDz {
            mode: CommutatorMode::Signed,
        },
    );
    commutator.catalog = Some(PathBuf::from("catalog.json"));

    AuditConfig {
        nside: opts.nside,
        lmax: opts.lmax,
        seed: opts.seed,
        tracks: vec![
            map_track(
                "P1",
                Epoch::new("recombination", Some(1100.0)),
                TrackKind::SGamma {
                    band: Band::new(2, opts.lmax),
                    iterations: 0,
                },
            ),
            map_track(
                "P2",
                Epoch::new("recombination", Some(1100.0)),
                TrackKind::CouplingAmplitude {
                    prior_variance: None,
                },
            ),
            map_track(
                "P6",
                Epoch::new("recombination", Some(1100.0)),
                TrackKind::RotationalSurplus {
                    schedule: RotationSchedule::Even { count: 12 },
                    relabelings: 8,
                },
            ),
            commutator,
        ],
        ..AuditConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        run(MockOptions {
            output: dir.path(),
            nside: 8,
            lmax: 16,
            seed: 3,
            coupling: 0.1,
            objects: 50,
            catalog_coupling: 0.0,
        })
        .unwrap();

        let config = AuditConfig::load(&dir.path().join("audit.json")).unwrap();
        assert_eq!(config.nside, 8);
        assert_eq!(config.tracks.len(), 4);
        for track in &config.tracks {
            pbc_core::TrackInputs::load(track, dir.path()).unwrap();
        }
    }
}
