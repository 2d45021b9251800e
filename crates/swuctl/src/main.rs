//! swuctl - send update images to the update controller
//!
//! Streams one or more images (or stdin) through an install session and
//! prints progress and the final result.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use swu_common::ipc::{InstallRequest, Notification, RecoveryStatus};
use swu_common::{logging, AgentConfig};
use swuctl::{CompletionHandler, IpcClient, NotifyHandler, SessionClient, WriteSupplier};

/// Image bytes handed to the session per supplier call
const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Parser)]
#[command(name = "swuctl")]
#[command(about = "Send software update images to the update controller", long_about = None)]
#[command(version)]
struct Cli {
    /// Ask the controller for a dry run
    #[arg(short = 'd', long)]
    dry_run: bool,

    /// Software set and running mode
    #[arg(short = 'e', long = "select", value_name = "SET,MODE")]
    select: Option<String>,

    /// No progress output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// More output (repeat for debug logs)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run post-update actions after a successful update
    #[arg(short = 'p', long)]
    postupdate: bool,

    /// AES key as hex
    #[arg(long, requires = "aes_ivt")]
    aes_key: Option<String>,

    /// AES initialization vector as hex
    #[arg(long, requires = "aes_key")]
    aes_ivt: Option<String>,

    /// Lowest accepted image version
    #[arg(long)]
    min_version: Option<String>,

    /// Highest accepted image version
    #[arg(long)]
    max_version: Option<String>,

    /// Version currently installed
    #[arg(long)]
    current_version: Option<String>,

    /// Alternate configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Images to install, `-` or none reads stdin
    files: Vec<PathBuf>,
}

struct Options {
    request: InstallRequest,
    show_progress: bool,
    postupdate: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose.saturating_sub(1));

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let config = match &cli.config {
        Some(path) => {
            let mut config = AgentConfig::load_from_path(path)
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Could not load {}", path.display()))?;
            config.apply_overrides(|key| std::env::var(key).ok());
            config
        }
        None => AgentConfig::load(),
    };
    let ipc = IpcClient::new(&config.ipc);

    if let (Some(key), Some(ivt)) = (&cli.aes_key, &cli.aes_ivt) {
        ipc.set_aes_key(key, ivt)
            .await
            .context("Failed to set AES key")?;
    }
    let versions = [&cli.min_version, &cli.max_version, &cli.current_version];
    if versions.iter().any(|v| v.is_some()) {
        ipc.set_version_range(
            cli.min_version.as_deref(),
            cli.max_version.as_deref(),
            cli.current_version.as_deref(),
        )
        .await
        .context("Failed to set version range")?;
    }

    let mut request = InstallRequest::default().dry_run(cli.dry_run).info("swuctl");
    if let Some(selection) = &cli.select {
        let (set, mode) = parse_selection(selection)?;
        request = request.selection(set, mode);
    }
    let options = Options {
        request,
        show_progress: !cli.quiet,
        postupdate: cli.postupdate,
    };

    let mut client = SessionClient::new(ipc);
    let from_stdin = match cli.files.as_slice() {
        [] => true,
        [only] => only == Path::new("-"),
        _ => false,
    };
    if from_stdin {
        println!("no input given, reading from STDIN...");
        return install(&mut client, None, &options).await;
    }
    for file in &cli.files {
        if !install(&mut client, Some(file), &options).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn parse_selection(selection: &str) -> Result<(&str, &str)> {
    match selection.split_once(',') {
        Some((set, mode)) if !set.is_empty() && !mode.is_empty() => Ok((set, mode)),
        _ => bail!("Wrong selection {:?}, expected SET,MODE", selection),
    }
}

async fn install(
    client: &mut SessionClient,
    path: Option<&Path>,
    options: &Options,
) -> Result<bool> {
    let reader: Box<dyn Read + Send> = match path {
        Some(path) => Box::new(
            File::open(path).with_context(|| format!("Unable to open {}", path.display()))?,
        ),
        None => Box::new(io::stdin()),
    };
    let write = chunk_supplier(reader);

    let show_progress = options.show_progress;
    let notify: NotifyHandler = Box::new(move |notification: &Notification| {
        if show_progress {
            println!(
                "Status: {} message: {}",
                notification.status.as_str(),
                notification.msg
            );
        }
    });
    let completion: CompletionHandler = Box::new(|status| {
        if status == RecoveryStatus::Success {
            println!("SWUpdate was successful !");
        } else {
            println!("SWUpdate *failed* !");
        }
    });

    let handle = client
        .begin(write, Some(notify), Some(completion), options.request.clone())
        .await
        .with_context(|| {
            format!(
                "Failed to start update via {}",
                client.ipc().control_socket().display()
            )
        })?;
    if handle.wait().await != RecoveryStatus::Success {
        return Ok(false);
    }

    if options.postupdate {
        println!("Executing post-update actions.");
        if let Err(e) = client.ipc().post_update().await {
            eprintln!("Running post-update failed: {}", e);
            return Ok(false);
        }
    }
    Ok(true)
}

/// Image supplier reading `CHUNK_SIZE` blocks from `reader`.
/// Needs a multi-threaded runtime: file and stdin reads block, so they run
/// under `block_in_place` to keep the async workers free.
fn chunk_supplier(mut reader: Box<dyn Read + Send>) -> WriteSupplier {
    Box::new(move || {
        tokio::task::block_in_place(|| -> io::Result<Vec<u8>> {
            let mut buf = vec![0u8; CHUNK_SIZE];
            let n = loop {
                match reader.read(&mut buf) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    other => break other?,
                }
            };
            buf.truncate(n);
            Ok(buf)
        })
    })
}
