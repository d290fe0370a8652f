//! # SRT scraper CLI (`srt`)
//!
//! The `srt` binary runs the nightly solicitation ingestion and offers a few
//! read-only commands for checking on the results.
//!
//! ## Usage
//!
//! ```bash
//! srt --config ./config/srt.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `srt init` | Create the SQLite database and seed lookup tables |
//! | `srt run` | Ingest and classify solicitations (the default with no command) |
//! | `srt stats` | Counts, pending queue and retraining check |
//! | `srt get <notice-id>` | Print a stored solicitation with its documents |
//!
//! ## Exit status
//!
//! `0` on success (individual documents may still have failed), `2` when a
//! solicitation failed or the run timed out, `1` when the run could not
//! start at all (bad config, missing model, database unavailable).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use srt_scraper::pipeline::RunOutcome;
use srt_scraper::{config, get, migrate, pipeline, stats};

/// Exit status for a run that finished with failed solicitations.
const EXIT_PARTIAL_FAILURE: i32 = 2;

/// SRT scraper: nightly solicitation ingestion and Section 508 classification.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/srt.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "srt",
    about = "Ingest federal IT solicitations and classify their documents for Section 508 compliance",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/srt.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file, all tables, and the notice type
    /// lookup rows. Running it again is harmless.
    Init,

    /// Ingest solicitations posted in a date window.
    ///
    /// Without flags the window is the previous UTC calendar day. Notices
    /// left pending by an earlier run are processed first.
    Run {
        /// First posted date to include (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Last posted date to include (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// Maximum number of solicitations to process.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show database statistics.
    Stats,

    /// Show a stored solicitation by notice id.
    Get {
        /// SAM.gov notice id.
        notice_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // logs go to stderr; stdout carries command output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let command = cli.command.unwrap_or(Commands::Run {
        since: None,
        until: None,
        limit: None,
    });

    match command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
        }
        Commands::Run {
            since,
            until,
            limit,
        } => {
            let outcome = pipeline::run_ingest(&cfg, since, until, limit).await?;
            if outcome == RunOutcome::PartialFailure {
                std::process::exit(EXIT_PARTIAL_FAILURE);
            }
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Get { notice_id } => {
            get::run_get(&cfg, &notice_id).await?;
        }
    }

    Ok(())
}
