//! civitai-dl - download Civitai models and keep a history of them.
//!
//! Thin front end over `civitai-core`: argument parsing, logging setup,
//! console progress and confirmation prompts.

mod commands;
mod console;

use clap::{Args, Parser, Subcommand};
use civitai_core::CivitaiError;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "civitai-dl")]
#[command(version, about = "Download models from Civitai and track what you downloaded")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = civitai_core::config::AppConfig::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Download a model by its Civitai page URL
    Download(DownloadArgs),

    /// Inspect or maintain the download history
    #[command(subcommand)]
    History(HistoryCommand),

    /// Download models again from the history
    Redownload(RedownloadArgs),

    /// Identify local model files by hash and save their metadata as JSON
    Scan(ScanArgs),

    /// Add scan results to the download history
    Import(ImportArgs),
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// Model page URL, e.g. https://civitai.com/models/649516?modelVersionId=726676
    pub url: String,

    /// Model type (detected from the API when omitted)
    #[arg(short = 't', long = "type", value_parser = parse_model_type)]
    pub model_type: Option<civitai_core::ModelKind>,

    /// Overwrite an existing file without asking
    #[arg(long)]
    pub force: bool,

    /// Answer yes to every prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Discard any partial download and start from zero
    #[arg(long)]
    pub no_resume: bool,
}

#[derive(Subcommand, Debug)]
pub enum HistoryCommand {
    /// List downloads
    List {
        /// Include repeated downloads of the same version
        #[arg(long)]
        all: bool,

        /// Group by model type (checkpoint, lora, embedding)
        #[arg(long)]
        sort_by_type: bool,
    },

    /// Remove duplicate rows (a .backup copy is kept)
    Clean,

    /// Convert a plain-text history file to CSV
    Migrate {
        /// The old text history
        old: PathBuf,

        /// Output CSV (defaults to OLD with a .csv extension)
        new: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false, id = "target")]
pub struct RedownloadTarget {
    /// 1-based position in `history list`
    #[arg(long)]
    pub index: Option<usize>,

    /// URL as recorded in the history
    #[arg(long)]
    pub url: Option<String>,

    /// Every (deduplicated) history entry
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct RedownloadArgs {
    #[command(flatten)]
    pub target: RedownloadTarget,

    /// Overwrite existing files without asking
    #[arg(long)]
    pub force: bool,

    /// Answer yes to every prompt
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Args, Debug)]
pub struct ScanArgs {
    /// Directories to scan (defaults to the configured download directories)
    pub dirs: Vec<PathBuf>,

    /// Output JSON file
    #[arg(short, long, default_value = civitai_core::config::ScanConfig::DEFAULT_OUTPUT)]
    pub output: PathBuf,

    /// Maximum lookups in flight
    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Scan results JSON
    pub json: PathBuf,

    /// History CSV (defaults to the configured history file)
    #[arg(long)]
    pub history: Option<PathBuf>,
}

fn parse_model_type(s: &str) -> Result<civitai_core::ModelKind, String> {
    civitai_core::ModelKind::parse_user_type(s)
        .ok_or_else(|| format!("'{}' is not one of: lora, checkpoint, embedding", s))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr so listings on stdout stay clean
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    debug!("Using configuration {}", cli.config.display());

    tokio::select! {
        result = commands::run(cli) => match result {
            Ok(code) => code,
            Err(e) => {
                match e.downcast_ref::<CivitaiError>() {
                    Some(err) => eprintln!("Error: {}", err.user_message()),
                    None => eprintln!("Error: {:#}", e),
                }
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted, partial downloads are kept for resume");
            ExitCode::from(130)
        }
    }
}
