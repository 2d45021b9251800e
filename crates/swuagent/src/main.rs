//! swuagent - run one image handler under the update lock
//!
//! Takes the update lock, runs the pipe or exec handler, releases the lock.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use swu_common::{logging, AgentConfig};
use swuagent::handlers::{self, Properties};
use swuagent::{StreamOptions, UpdateLock};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "swuagent")]
#[command(about = "Run an update handler under the update lock", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase verbosity (repeat for more)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Alternate configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream an image into a command's stdin
    Pipe {
        /// Command receiving the image
        #[arg(long)]
        cmd: String,

        /// Image file (stdin when omitted or "-")
        file: Option<PathBuf>,
    },

    /// Run a command with the image path as last argument
    Exec {
        /// Command to run
        #[arg(long)]
        cmd: String,

        /// Image file, relative names are looked up in the agent tmpdir
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => {
            let mut config = AgentConfig::load_from_path(path)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            config.apply_overrides(|key| std::env::var(key).ok());
            config
        }
        None => AgentConfig::load(),
    };
    let options = StreamOptions::from(&config.handler);

    let mut lock = UpdateLock::new(&config.lock);
    lock.acquire().context("Failed to take the update lock")?;
    info!("Holding update lock {}", lock.path().display());

    let result = run_handler(cli.command, &config, &options);
    lock.release();
    result
}

fn run_handler(command: Commands, config: &AgentConfig, options: &StreamOptions) -> Result<()> {
    match command {
        Commands::Pipe { cmd, file } => {
            let properties = cmd_properties(cmd);
            let mut image: Box<dyn Read> = match file {
                Some(path) if path.as_os_str() != "-" => Box::new(
                    File::open(&path)
                        .with_context(|| format!("Unable to open {}", path.display()))?,
                ),
                _ => Box::new(io::stdin().lock()),
            };
            handlers::pipe_image(&properties, &mut image, options)?;
        }
        Commands::Exec { cmd, file } => {
            let properties = cmd_properties(cmd);
            handlers::exec_image(&properties, &file, &config.tmpdir, options)?;
        }
    }
    Ok(())
}

fn cmd_properties(cmd: String) -> Properties {
    [("cmd".to_string(), cmd)].into_iter().collect()
}
