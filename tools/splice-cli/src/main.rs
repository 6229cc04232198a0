//! Splice CLI: inspect sequences, conform them ahead of time, and export.
//!
//! Usage:
//!   splice info <SEQUENCE>          Show sequence information
//!   splice validate <SEQUENCE>      Validate a sequence file
//!   splice plan <SEQUENCE>          Show the export segment plan
//!   splice conform <SEQUENCE>       Conform a sequence into the warm tier
//!   splice export <SEQUENCE>        Export a sequence
//!   splice clear-cache <SEQUENCE>   Drop a sequence's warm-tier packets

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "splice",
    about = "Conform cache and smart-render export for timeline sequences",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override the warm-tier directory
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sequence information
    Info {
        /// Path to the sequence JSON file
        path: PathBuf,
    },

    /// Validate a sequence file
    Validate {
        /// Path to the sequence JSON file
        path: PathBuf,
    },

    /// Show how an export range would be split into segments
    Plan {
        /// Path to the sequence JSON file
        path: PathBuf,

        /// First frame of the range
        #[arg(long)]
        start: Option<u64>,

        /// One past the last frame of the range
        #[arg(long)]
        end: Option<u64>,

        /// Output codec
        #[arg(long)]
        codec: Option<String>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Conform a sequence and persist its packets
    Conform {
        /// Path to the sequence JSON file
        path: PathBuf,

        /// Give up after this many seconds
        #[arg(long, default_value = "300")]
        timeout_secs: u64,

        /// Print the coverage report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Export a sequence
    Export {
        /// Path to the sequence JSON file
        path: PathBuf,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// First frame of the range
        #[arg(long)]
        start: Option<u64>,

        /// One past the last frame of the range
        #[arg(long)]
        end: Option<u64>,

        /// Output codec
        #[arg(long)]
        codec: Option<String>,

        /// Output bitrate in bits per second
        #[arg(long)]
        bitrate: Option<u64>,

        /// Audio file handed to the muxer
        #[arg(long)]
        audio: Option<PathBuf>,

        /// Conform the range before exporting
        #[arg(long)]
        conform_first: bool,
    },

    /// Drop a sequence's persisted packets
    ClearCache {
        /// Path to the sequence JSON file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = splice_common::config::AppConfig::load();
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    if let Some(dir) = cli.store_dir {
        config.store_dir = dir;
    }
    splice_common::logging::init_logging(&config.logging);
    tracing::debug!(store_dir = %config.store_dir.display(), "Configuration loaded");

    match cli.command {
        Commands::Info { path } => commands::info::run(path),
        Commands::Validate { path } => commands::validate::run(path),
        Commands::Plan {
            path,
            start,
            end,
            codec,
            json,
        } => commands::plan::run(&config, path, start, end, codec, json),
        Commands::Conform {
            path,
            timeout_secs,
            json,
        } => commands::conform::run(&config, path, timeout_secs, json).await,
        Commands::Export {
            path,
            output,
            start,
            end,
            codec,
            bitrate,
            audio,
            conform_first,
        } => {
            commands::export::run(
                &config,
                commands::export::ExportArgs {
                    path,
                    output,
                    start,
                    end,
                    codec,
                    bitrate,
                    audio,
                    conform_first,
                },
            )
            .await
        }
        Commands::ClearCache { path } => commands::clear_cache::run(&config, path).await,
    }
}
