use crate::AppEvent;
use crate::config::ProtocolConfig;
use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::protocol::read_record;

/// Device-side listener: accepts one transfer connection at a time and
/// unpacks the framed stream under a destination directory.
pub struct TransferReceiver {
    listener: TcpListener,
    dest_dir: PathBuf,
}

impl TransferReceiver {
    pub async fn bind(cfg: &ProtocolConfig, dest_dir: impl Into<PathBuf>) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, cfg.tcp_port))
            .await
            .with_context(|| format!("failed to bind transfer port {}", cfg.tcp_port))?;
        Ok(Self {
            listener,
            dest_dir: dest_dir.into(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and unpack transfer streams until cancelled.
    ///
    /// A malformed stream ends its own connection; the listener keeps
    /// accepting. Records are applied in send order, so a duplicate path
    /// overwrites the earlier write.
    pub async fn run(
        self,
        event_tx: mpsc::Sender<AppEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(
            "listening for transfers on {}",
            self.listener.local_addr()?
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.listener.accept() => {
                    let (stream, peer) = res?;
                    let _ = event_tx
                        .send(AppEvent::Status(format!("Incoming transfer from {peer}")))
                        .await;

                    match receive_stream(stream, &self.dest_dir, &event_tx).await {
                        Ok(count) => {
                            let _ = event_tx
                                .send(AppEvent::TransferCompleted {
                                    files_sent: count,
                                    files_failed: 0,
                                    total_files: count,
                                })
                                .await;
                        }
                        Err(e) => {
                            warn!("transfer from {peer} failed: {e:#}");
                            let _ = event_tx
                                .send(AppEvent::Status(format!(
                                    "Transfer from {peer} failed: {e:#}"
                                )))
                                .await;
                        }
                    }
                }
            }
        }
    }
}

/// Read records until the sentinel, writing each under `dest_dir`.
/// Returns the number of files written.
async fn receive_stream(
    mut stream: TcpStream,
    dest_dir: &Path,
    event_tx: &mpsc::Sender<AppEvent>,
) -> Result<usize> {
    let mut count = 0usize;

    while let Some(record) = read_record(&mut stream).await? {
        let Some(rel) = sanitize_relative_path(&record.relative_path) else {
            warn!(
                "rejecting unsafe path {:?} from peer",
                record.relative_path
            );
            continue;
        };

        let path = dest_dir.join(&rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &record.content)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        count += 1;
        let _ = event_tx
            .send(AppEvent::Status(format!(
                "Received {} ({} bytes)",
                record.relative_path,
                record.content.len()
            )))
            .await;
    }

    info!("received {count} files into {}", dest_dir.display());
    Ok(count)
}

/// Turn a wire path into a safe relative path, or `None` if it escapes
/// the destination: empty paths, absolute paths, backslashes and dot or
/// dot-dot components are all rejected.
fn sanitize_relative_path(raw: &str) -> Option<PathBuf> {
    if raw.is_empty() || raw.contains('\\') {
        return None;
    }

    let mut path = PathBuf::new();
    for part in raw.split('/') {
        if part.is_empty() || part == "." || part == ".." || part.contains(':') {
            return None;
        }
        path.push(part);
    }
    Some(path)
}
