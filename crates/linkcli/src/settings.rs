use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use linkcache_service::config::Config;
use tracing::level_filters::LevelFilter;

/// Loads content through the linkcache loading cache.
///
/// The backend, either a local bundle directory or a remote catalog, is selected in the
/// configuration file passed via `--config`. Without a configuration file, the current
/// directory is read as a local bundle.
#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The severity level of logging output, overriding the configuration.
    ///
    /// Possible values:
    /// off, error, warn, info, debug, trace
    #[arg(long, global = true)]
    log_level: Option<LevelFilter>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Loads every address of a group and lists them.
    Preload {
        /// The group to load.
        group: String,
    },

    /// Loads a single address and prints its content.
    Load {
        /// The address to load.
        address: String,
    },

    /// Checks the remote catalog for changed content.
    CheckUpdates,

    /// Downloads content from the remote catalog.
    ///
    /// Without any addresses, everything reported by an update check is downloaded.
    Download {
        /// The addresses to download.
        addresses: Vec<String>,

        /// Only download if an update check reports anything.
        #[arg(long, conflicts_with = "addresses")]
        if_needed: bool,
    },

    /// Prints how many bytes still need to be downloaded for the given addresses.
    Size {
        #[arg(required = true)]
        addresses: Vec<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub config: Config,
    pub command: Command,
}

impl Settings {
    pub fn get() -> Result<Self> {
        let cli = Cli::parse();

        let mut config = Config::get(cli.config.as_deref()).context("failed loading config")?;
        if let Some(level) = cli.log_level {
            config.logging.level = level;
        }

        Ok(Settings {
            config,
            command: cli.command,
        })
    }
}
