//! Core of the LAN deployment updater: UDP broadcast discovery, the TCP
//! folder-transfer protocol, release staging, and the command/event loop
//! frontends drive over channels.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod config;
pub mod discovery;
pub mod release;
pub mod transfer;

pub use config::{AppConfig, ProtocolConfig};
pub use transfer::{FileRecord, SessionOutcome, TransferReceiver, send_folder};

/// Commands from a frontend to the backend
#[derive(Debug, Clone)]
pub enum AppCommand {
    /// Broadcast for a deployment target on the LAN
    Discover {
        /// Override for the configured discovery timeout
        timeout: Option<Duration>,
    },
    /// Fetch and stage the latest release archive
    Download {
        /// Repository override ("owner/name"); falls back to the config
        repo: Option<String>,
    },
    /// Stream the staged update folder to the device
    Deploy {
        /// Target address; resolved via discovery when absent
        target: Option<IpAddr>,
        /// Folder override; defaults to the staged update's src/
        folder: Option<PathBuf>,
    },
    /// Cancel the deploy in flight, if any
    CancelDeploy,
}

/// Events from the backend to a frontend
#[derive(Debug, Clone)]
pub enum AppEvent {
    Status(String),
    Error(String),

    /// A device answered the discovery broadcast
    ServerFound {
        ip: IpAddr,
    },
    /// The discovery attempt finished, successfully or not
    DiscoveryFinished {
        found: Option<IpAddr>,
    },

    /// One more file has been sent
    TransferProgress {
        file_name: String,
        completed: usize,
        total: usize,
    },
    TransferCompleted {
        files_sent: usize,
        files_failed: usize,
        total_files: usize,
    },

    /// A release was staged locally under the given version
    DownloadCompleted {
        version: String,
    },
}

/// Backend loop: dispatches each command onto its own task so the caller's
/// foreground loop stays responsive, and routes progress back over
/// `event_tx`. Runs until the command channel closes.
///
/// Operations are not mutually excluded; triggering two deploys opens two
/// independent sessions. Only the most recent deploy keeps a cancellation
/// handle.
pub async fn run_backend(mut cmd_rx: mpsc::Receiver<AppCommand>, event_tx: mpsc::Sender<AppEvent>) {
    let app_config = AppConfig::load();
    let protocol = ProtocolConfig::default();
    let mut deploy_cancel: Option<CancellationToken> = None;

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            AppCommand::Discover { timeout } => {
                let cfg = protocol.clone();
                let evt = event_tx.clone();
                tokio::spawn(async move {
                    let _ = evt
                        .send(AppEvent::Status("Scanning for a deployment target...".to_string()))
                        .await;
                    let wait = timeout.unwrap_or(cfg.discovery_timeout);
                    let found = discovery::discover(&cfg, wait).await;
                    if let Some(ip) = found {
                        let _ = evt.send(AppEvent::ServerFound { ip }).await;
                    }
                    let _ = evt.send(AppEvent::DiscoveryFinished { found }).await;
                });
            }
            AppCommand::Download { repo } => {
                let repo = repo.or_else(|| app_config.release_repo.clone());
                let update_dir = config::get_update_dir();
                let evt = event_tx.clone();
                tokio::spawn(async move {
                    let Some(repo) = repo else {
                        let _ = evt
                            .send(AppEvent::Error(
                                "No release repository configured.".to_string(),
                            ))
                            .await;
                        return;
                    };
                    match release::download_update(&repo, &update_dir, &evt).await {
                        Ok(version) => {
                            let _ = evt.send(AppEvent::DownloadCompleted { version }).await;
                        }
                        Err(e) => {
                            let _ = evt
                                .send(AppEvent::Error(format!("Download failed: {e:#}")))
                                .await;
                        }
                    }
                });
            }
            AppCommand::Deploy { target, folder } => {
                let cfg = protocol.clone();
                let evt = event_tx.clone();
                let folder =
                    folder.unwrap_or_else(|| config::get_update_dir().join("src"));
                let cancel = CancellationToken::new();
                deploy_cancel = Some(cancel.clone());

                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = evt
                                .send(AppEvent::Status("Deploy cancelled.".to_string()))
                                .await;
                        }
                        res = deploy(cfg, target, folder, evt.clone()) => {
                            if let Err(e) = res {
                                let _ = evt
                                    .send(AppEvent::Error(format!("Deploy failed: {e:#}")))
                                    .await;
                            }
                        }
                    }
                });
            }
            AppCommand::CancelDeploy => {
                match deploy_cancel.take() {
                    Some(cancel) => cancel.cancel(),
                    None => {
                        let _ = event_tx
                            .send(AppEvent::Status("No deploy in flight.".to_string()))
                            .await;
                    }
                }
            }
        }
    }
}

/// One deploy operation: resolve the target (manual address or discovery
/// fallback), then run the transfer session against it.
async fn deploy(
    cfg: ProtocolConfig,
    target: Option<IpAddr>,
    folder: PathBuf,
    event_tx: mpsc::Sender<AppEvent>,
) -> anyhow::Result<()> {
    let ip = match target {
        Some(ip) => ip,
        None => {
            let _ = event_tx
                .send(AppEvent::Status(
                    "No target given, trying discovery...".to_string(),
                ))
                .await;
            match discovery::discover(&cfg, cfg.discovery_timeout).await {
                Some(ip) => {
                    let _ = event_tx.send(AppEvent::ServerFound { ip }).await;
                    ip
                }
                None => anyhow::bail!(
                    "could not auto-locate a deployment target; specify an address"
                ),
            }
        }
    };

    let addr = SocketAddr::new(ip, cfg.tcp_port);
    info!("deploying {} to {addr}", folder.display());
    let outcome = send_folder(&cfg, addr, &folder, event_tx.clone()).await?;

    let _ = event_tx
        .send(AppEvent::TransferCompleted {
            files_sent: outcome.files_sent,
            files_failed: outcome.files_failed,
            total_files: outcome.total_files,
        })
        .await;
    Ok(())
}
