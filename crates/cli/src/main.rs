//! CLI entry point for the chop/nod burst demultiplexer
//!
//! Parses command line arguments, runs one demultiplexing pass over the input
//! directory and writes the four streams below the output directory.

use chopnod::{
    run_burst, BurstOptions, Config, DirectorySink, MissingKeyReport, TrimPolicy,
    DEFAULT_STREAM_NAMES,
};
use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportMissing {
    /// Report missing header keys while processing the last file
    LastFile,
    /// Report missing header keys as soon as they are found missing
    Immediate,
}

impl From<ReportMissing> for MissingKeyReport {
    fn from(value: ReportMissing) -> Self {
        match value {
            ReportMissing::LastFile => MissingKeyReport::LastFile,
            ReportMissing::Immediate => MissingKeyReport::Immediate,
        }
    }
}

/// Split chop/nod burst exposures into four output streams
#[derive(Parser, Debug)]
#[command(name = "chopnod")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory with the burst files (.fits, .fits.Z)
    #[arg(short, long)]
    input_dir: PathBuf,

    /// Directory receiving one subdirectory per output stream
    #[arg(short, long)]
    output_dir: PathBuf,

    /// Path to the configuration file (config.toml); built-in defaults if omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Nod scheme assumed when files carry no nod position (ABBA or ABAB)
    #[arg(long, default_value = "ABBA")]
    scheme: String,

    /// Check all configured attributes instead of only the required ones
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    check: bool,

    /// Discard existing data of the output streams
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    overwrite: bool,

    /// Output stream for nod A, chop A
    #[arg(long, default_value = DEFAULT_STREAM_NAMES[0])]
    tag_noda_chopa: String,

    /// Output stream for nod A, chop B
    #[arg(long, default_value = DEFAULT_STREAM_NAMES[1])]
    tag_noda_chopb: String,

    /// Output stream for nod B, chop A
    #[arg(long, default_value = DEFAULT_STREAM_NAMES[2])]
    tag_nodb_chopa: String,

    /// Output stream for nod B, chop B
    #[arg(long, default_value = DEFAULT_STREAM_NAMES[3])]
    tag_nodb_chopb: String,

    /// When missing header keys are reported
    #[arg(long, value_enum, default_value_t = ReportMissing::LastFile)]
    report_missing: ReportMissing,

    /// Also drop frames whose first pixel is exactly zero
    #[arg(long, default_value = "false")]
    legacy_trim: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, chopnod::config::ConfigError> {
    match path {
        Some(path) => Config::load(path),
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match load_config(args.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let options = BurstOptions {
        input_dir: args.input_dir.clone(),
        names: [
            args.tag_noda_chopa,
            args.tag_noda_chopb,
            args.tag_nodb_chopa,
            args.tag_nodb_chopb,
        ],
        scheme: args.scheme,
        check: args.check,
        overwrite: args.overwrite,
        missing_keys: args.report_missing.into(),
        trim: if args.legacy_trim {
            TrimPolicy::LegacyZeroPixel
        } else {
            TrimPolicy::WrittenCount
        },
    };

    println!("Input directory: {}", args.input_dir.display());
    println!("Output directory: {}", args.output_dir.display());

    let sink = DirectorySink::new(&args.output_dir);
    match run_burst(options, &config, sink).await {
        Ok((report, _)) => {
            println!("Processed {} files", report.files);
            for (name, frames) in &report.frames_per_stream {
                println!("  {}: {} frames", name, frames);
            }
            if report.frames_dropped > 0 {
                println!("Dropped {} frames with unknown chop position", report.frames_dropped);
            }
            println!("Warnings: {}", report.diagnostics.warning_count());
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                input = %args.input_dir.display(),
                "Demultiplexing failed"
            );
            ExitCode::FAILURE
        }
    }
}
