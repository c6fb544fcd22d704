use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use profstore::commands::{
    config_or_default, functions_command, info_command, ingest_command, init_command,
    init_logging, locations_command, mappings_command, run_command, status_command,
    symbolize_command,
};

/// Symbol metastore and symbolizer for continuous profiling.
///
/// This CLI is a thin wrapper around `profstore-core` (exposed in code as `profstore_core`).
/// All substantive logic lives in the library so it can be tested thoroughly
/// and reused from other frontends.
#[derive(Parser, Debug)]
#[command(
    name = "profstore",
    version,
    about = "Symbol metastore and symbolizer for continuous profiling",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a data directory.
    ///
    /// This will:
    /// - Create a `.profstore` metadata directory and a `debuginfo` directory.
    /// - Write `.profstore/config.yml` with defaults.
    /// - Create the SQLite metastore.
    Init {
        /// Data directory root. Defaults to the current working directory.
        #[arg(long, default_value = ".")]
        root: String,

        /// Overwrite an existing config.
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Show the layout and effective configuration of a data directory.
    Info {
        #[arg(long, default_value = ".")]
        root: String,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Ingest a pprof profile (plain or gzip-compressed).
    ///
    /// Mappings, functions and locations are deduplicated into the metastore and
    /// the canonical samples are appended to `.profstore/samples.jsonl`.
    Ingest {
        #[arg(long, default_value = ".")]
        root: String,

        /// Path to the profile.
        #[arg(long)]
        file: String,

        /// Series label as `key=value`. May be repeated.
        #[arg(long = "label")]
        labels: Vec<String>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Run one symbolization pass over every unsymbolized location.
    Symbolize {
        #[arg(long, default_value = ".")]
        root: String,

        /// JSON symbol table to resolve against instead of the debug info directory.
        #[arg(long)]
        symbols: Option<PathBuf>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Run the background symbolizer until interrupted.
    Run {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long)]
        symbols: Option<PathBuf>,
    },

    /// List locations with their mapping and inline frames.
    Locations {
        #[arg(long, default_value = ".")]
        root: String,

        /// Only locations still waiting for symbolization.
        #[arg(long, default_value_t = false)]
        unsymbolized: bool,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// List stored functions.
    Functions {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// List stored mappings.
    Mappings {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Entity counts and the symbolization backlog.
    Status {
        #[arg(long, default_value = ".")]
        root: String,

        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

impl Command {
    fn root(&self) -> &str {
        match self {
            Command::Init { root, .. }
            | Command::Info { root, .. }
            | Command::Ingest { root, .. }
            | Command::Symbolize { root, .. }
            | Command::Run { root, .. }
            | Command::Locations { root, .. }
            | Command::Functions { root, .. }
            | Command::Mappings { root, .. }
            | Command::Status { root, .. } => root,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&config_or_default(cli.command.root()).logging);

    match cli.command {
        Command::Init { root, force } => init_command(&root, force)?,
        Command::Info { root, json } => info_command(&root, json)?,
        Command::Ingest { root, file, labels, json } => {
            ingest_command(&root, &file, &labels, json).await?
        }
        Command::Symbolize { root, symbols, json } => {
            symbolize_command(&root, symbols.as_deref(), json).await?
        }
        Command::Run { root, symbols } => run_command(&root, symbols.as_deref()).await?,
        Command::Locations { root, unsymbolized, json } => {
            locations_command(&root, unsymbolized, json)?
        }
        Command::Functions { root, json } => functions_command(&root, json)?,
        Command::Mappings { root, json } => mappings_command(&root, json)?,
        Command::Status { root, json } => status_command(&root, json)?,
    }

    Ok(())
}
