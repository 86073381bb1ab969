//! Command-line frontend for the LAN deployment updater.

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use updater_core::discovery::DiscoveryResponder;
use updater_core::{AppCommand, AppEvent, ProtocolConfig, TransferReceiver, run_backend};

/// Deploy software updates to a device on the local network
#[derive(Parser)]
#[command(name = "updater")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Broadcast for a deployment target on the LAN
    Discover {
        /// Seconds to wait for a reply
        #[arg(long, default_value_t = 3)]
        timeout_secs: u64,
    },

    /// Stream the staged update folder to the device
    Deploy {
        /// Target address; discovered via broadcast when omitted
        #[arg(short, long)]
        target: Option<IpAddr>,

        /// Folder to send; defaults to the staged update's src/
        #[arg(short, long)]
        folder: Option<PathBuf>,
    },

    /// Run the device side: answer discovery and receive folders
    Serve {
        /// Directory received files are written into
        #[arg(short, long, default_value = "received")]
        dest: PathBuf,
    },

    /// Fetch and stage the latest release archive
    Download {
        /// Repository as owner/name; defaults from the config file
        #[arg(long)]
        repo: Option<String>,
    },

    /// Show the currently staged release version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "warn" })
        .init();

    match cli.command {
        Commands::Discover { timeout_secs } => {
            run_command(AppCommand::Discover {
                timeout: Some(Duration::from_secs(timeout_secs)),
            })
            .await
        }
        Commands::Deploy { target, folder } => {
            run_command(AppCommand::Deploy { target, folder }).await
        }
        Commands::Download { repo } => run_command(AppCommand::Download { repo }).await,
        Commands::Serve { dest } => serve(dest).await,
        Commands::Version => {
            let update_dir = updater_core::config::get_update_dir();
            match updater_core::release::installed_version(&update_dir) {
                Some(version) => println!("{version}"),
                None => println!("no update staged"),
            }
            Ok(())
        }
    }
}

/// Drive the backend for a single command and render its events until the
/// operation finishes.
async fn run_command(command: AppCommand) -> Result<()> {
    let (cmd_tx, cmd_rx) = mpsc::channel(1000);
    let (event_tx, mut event_rx) = mpsc::channel(1000);
    tokio::spawn(run_backend(cmd_rx, event_tx));

    cmd_tx
        .send(command)
        .await
        .map_err(|_| anyhow!("backend stopped before the command was sent"))?;

    let mut bar: Option<ProgressBar> = None;
    while let Some(event) = event_rx.recv().await {
        match event {
            AppEvent::Status(msg) => match &bar {
                Some(b) => b.println(msg),
                None => println!("{msg}"),
            },
            AppEvent::Error(msg) => {
                if let Some(b) = bar.take() {
                    b.abandon();
                }
                return Err(anyhow!(msg));
            }
            AppEvent::ServerFound { ip } => println!("deployment target found at {ip}"),
            AppEvent::DiscoveryFinished { found } => {
                if found.is_none() {
                    println!("no deployment target found");
                }
                break;
            }
            AppEvent::TransferProgress {
                file_name,
                completed,
                total,
            } => {
                let b = bar.get_or_insert_with(|| file_progress_bar(total as u64));
                b.set_position(completed as u64);
                b.set_message(file_name);
            }
            AppEvent::TransferCompleted {
                files_sent,
                files_failed,
                total_files,
            } => {
                if let Some(b) = bar.take() {
                    b.finish_and_clear();
                }
                if files_failed > 0 {
                    println!("deployed {files_sent}/{total_files} files ({files_failed} failed)");
                } else {
                    println!("deployed {files_sent}/{total_files} files");
                }
                break;
            }
            AppEvent::DownloadCompleted { version } => {
                println!("staged update {version}");
                break;
            }
        }
    }

    Ok(())
}

/// Device side: discovery responder plus transfer receiver, until ctrl-c.
async fn serve(dest: PathBuf) -> Result<()> {
    let cfg = ProtocolConfig::default();
    let (event_tx, mut event_rx) = mpsc::channel(1000);
    let cancel = CancellationToken::new();

    let responder = DiscoveryResponder::bind(&cfg).await?;
    let receiver = TransferReceiver::bind(&cfg, dest.clone()).await?;

    match local_ip_address::local_ip() {
        Ok(ip) => println!(
            "serving on {ip} (transfer port {}, discovery port {})",
            cfg.tcp_port, cfg.udp_port
        ),
        Err(_) => println!(
            "serving on transfer port {} / discovery port {}",
            cfg.tcp_port, cfg.udp_port
        ),
    }
    println!("received files go to {}", dest.display());

    let responder_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = responder.run(responder_cancel).await {
            tracing::error!("discovery responder error: {e:#}");
        }
    });

    let receiver_cancel = cancel.clone();
    let receiver_events = event_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = receiver.run(receiver_events, receiver_cancel).await {
            tracing::error!("transfer receiver error: {e:#}");
        }
    });
    drop(event_tx);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("shutting down");
                cancel.cancel();
                return Ok(());
            }
            event = event_rx.recv() => {
                match event {
                    Some(AppEvent::Status(msg)) => println!("{msg}"),
                    Some(AppEvent::TransferCompleted { files_sent, .. }) => {
                        println!("transfer complete: {files_sent} files");
                    }
                    Some(_) => {}
                    None => return Ok(()),
                }
            }
        }
    }
}

fn file_progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{wide_bar:.cyan/blue}] {pos}/{len} files {msg}")
            .expect("Invalid progress bar template")
            .progress_chars("#>-"),
    );
    bar
}
