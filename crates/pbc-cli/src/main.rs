//! CLI for the phase-locking audit engine.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pbc")]
#[command(about = "pbc — audit sky maps for coupling to their observing geometry")]
#[command(version = pbc_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a synthetic sky (scan, zodi, record, catalog) and a runnable audit config
    Mock {
        /// Output directory
        #[arg(long, default_value = "mock")]
        output: PathBuf,

        /// HEALPix resolution
        #[arg(long, default_value = "64")]
        nside: u32,

        /// Band limit of the synthetic fields
        #[arg(long, default_value = "64")]
        lmax: usize,

        #[arg(long, default_value = "7")]
        seed: u64,

        /// Amplitude of the scan pattern injected into the record
        #[arg(long, default_value = "0.0")]
        coupling: f64,

        /// Number of catalog objects
        #[arg(long, default_value = "2000")]
        objects: usize,

        /// Weight tilt of the second catalog estimator
        #[arg(long, default_value = "0.0")]
        catalog_coupling: f64,
    },

    /// Build a standardized context map from one or more input maps
    Context {
        /// Input map files (JSON), in rule order
        #[arg(long = "input", required = true)]
        inputs: Vec<PathBuf>,

        /// Target resolution
        #[arg(long)]
        nside: u32,

        /// Combination rule
        #[arg(long, default_value = "weighted_sum", value_parser = ["weighted_sum", "ratio", "masked_difference", "leading_mode"])]
        rule: String,

        /// Comma-separated weights for weighted_sum (default: all 1)
        #[arg(long)]
        weights: Option<String>,

        /// Degrade finer inputs instead of rejecting them
        #[arg(long)]
        aggregate: bool,

        /// Winsorize at this many robust sigmas before standardizing
        #[arg(long)]
        clip_sigma: Option<f64>,

        /// Mask map; pixels with a positive value are kept
        #[arg(long)]
        mask: Option<PathBuf>,

        /// Write the context map here
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run the null ensemble of one audit track
    Null {
        /// Audit config (JSON); paths inside resolve against its directory
        #[arg(long)]
        config: PathBuf,

        /// Track name
        #[arg(long)]
        track: String,

        /// Override the number of null trials
        #[arg(long)]
        trials: Option<usize>,

        /// Worker threads (default: all cores)
        #[arg(long)]
        threads: Option<usize>,

        /// Write the null report as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run the null and injection ensembles of one audit track
    Inject {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        track: String,

        /// Comma-separated injection amplitudes (overrides the config)
        #[arg(long)]
        amplitudes: Option<String>,

        /// Override the number of injection trials per amplitude
        #[arg(long)]
        trials: Option<usize>,

        #[arg(long)]
        threads: Option<usize>,

        /// Write the injection report as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run every track of an audit config and write a ledger
    Audit {
        #[arg(long)]
        config: PathBuf,

        /// Ledger directory (default: ./ledgers/)
        #[arg(long, default_value = "ledgers")]
        output: PathBuf,

        /// Ledger note
        #[arg(long)]
        note: Option<String>,

        /// Also write the full audit report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// List ledgers or show one
    Ledger {
        /// Ledger directory, or a single run directory
        #[arg(default_value = "ledgers")]
        path: PathBuf,

        /// Print the ledger as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Mock {
            output,
            nside,
            lmax,
            seed,
            coupling,
            objects,
            catalog_coupling,
        } => commands::mock::run(commands::mock::MockOptions {
            output: &output,
            nside,
            lmax,
            seed,
            coupling,
            objects,
            catalog_coupling,
        }),
        Commands::Context {
            inputs,
            nside,
            rule,
            weights,
            aggregate,
            clip_sigma,
            mask,
            output,
        } => commands::context::run(commands::context::ContextOptions {
            inputs: &inputs,
            nside,
            rule: &rule,
            weights: weights.as_deref(),
            aggregate,
            clip_sigma,
            mask: mask.as_deref(),
            output: output.as_deref(),
        }),
        Commands::Null {
            config,
            track,
            trials,
            threads,
            output,
        } => commands::null::run(&config, &track, trials, threads, output.as_deref()),
        Commands::Inject {
            config,
            track,
            amplitudes,
            trials,
            threads,
            output,
        } => commands::inject::run(
            &config,
            &track,
            amplitudes.as_deref(),
            trials,
            threads,
            output.as_deref(),
        ),
        Commands::Audit {
            config,
            output,
            note,
            report,
        } => commands::audit::run(&config, &output, note.as_deref(), report.as_deref()),
        Commands::Ledger { path, json } => commands::ledger::run(&path, json),
    };

    if let Err(e) = result {
        eprintln!("Error [{}]: {e}", e.kind());
        let code = if matches!(e, pbc_core::AuditError::Cancelled { .. }) { 130 } else { 1 };
        std::process::exit(code);
    }
}
