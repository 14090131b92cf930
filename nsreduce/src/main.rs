//! nsreduce
//!
//! Merge neutron scattering scans and reduce them to moments from the command line.
//!
//! Usage:
//!     nsreduce merge scan_1.json scan_2.json --tolerance 0.0005 --out merged.json
//!     nsreduce reduce --config reduce.json scan_1.json scan_2.json

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nscore::{MatchPolicy, MergeOptions, MergeReport, Tolerance};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nsreduce::data::columns_file::{load_and_merge, write_columns};
use nsreduce::data::reduce::{run_reduction, ReduceConfig};

#[derive(Parser)]
#[command(name = "nsreduce")]
#[command(version)]
#[command(about = "Merge and reduce neutron scattering point clouds", long_about = None)]
struct Cli {
    /// Log debug events (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge column files into a single point cloud
    Merge {
        /// JSON column files; the first one sets the normalization
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Match tolerance, either one value for all axes or five comma separated values
        #[arg(short, long, value_delimiter = ',')]
        tolerance: Vec<f64>,

        /// How incoming points pair with existing ones: all_within_tolerance, nearest, one_to_one
        #[arg(short, long, default_value = "all_within_tolerance")]
        policy: MatchPolicy,

        /// Write the merged columns to this file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Merge, optionally rebin, and print moments as JSON
    Reduce {
        /// JSON reduction settings; defaults are used when absent
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// JSON column files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn tolerance_from_args(values: &[f64]) -> Result<Tolerance> {
    match values {
        [] => Ok(Tolerance::default()),
        [value] => Ok(Tolerance::uniform(*value)),
        values => {
            Tolerance::from_slice(values).context("tolerance takes one value or one per axis")
        }
    }
}

fn total(reports: &[MergeReport]) -> MergeReport {
    reports.iter().fold(MergeReport::default(), |mut acc, report| {
        acc += *report;
        acc
    })
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Merge { files, tolerance, policy, out } => {
            let options = MergeOptions::new(tolerance_from_args(&tolerance)?, policy);
            let (cloud, reports) = load_and_merge(&files, &options)?;
            let merged = total(&reports);
            info!(
                files = files.len(),
                matched_pairs = merged.matched_pairs,
                appended = merged.appended,
                "merge finished"
            );
            println!("{}", cloud);

            if let Some(path) = out {
                write_columns(&path, &cloud.to_columns())?;
                info!(path = %path.display(), "wrote merged columns");
            }
        }
        Commands::Reduce { config, files } => {
            let config = match config {
                Some(path) => ReduceConfig::from_file(&path)?,
                None => ReduceConfig::default(),
            };
            let (cloud, reports) = load_and_merge(&files, &config.merge_options())?;
            let summary = run_reduction(cloud, total(&reports), &config)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
