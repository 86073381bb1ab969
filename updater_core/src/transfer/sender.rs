use crate::AppEvent;
use crate::config::ProtocolConfig;
use anyhow::{Context, Result, bail};
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::protocol::{encode_record, write_frame, write_sentinel};
use super::walk::enumerate_folder;

/// Tally of one completed session.
#[derive(Debug, Clone, Default)]
pub struct SessionOutcome {
    pub total_files: usize,
    pub files_sent: usize,
    pub files_failed: usize,
    pub bytes_sent: u64,
}

/// Stream every regular file under `folder` to `target` as one framed
/// record each, then the sentinel.
///
/// Only a connect failure is fatal (and, when
/// [`ProtocolConfig::abort_on_file_error`] is set, the first per-file
/// error). By default a file that cannot be read or sent is logged and
/// skipped, and a failed sentinel write still leaves the session
/// completed. The connection is closed on every exit path.
pub async fn send_folder(
    cfg: &ProtocolConfig,
    target: SocketAddr,
    folder: &Path,
    event_tx: mpsc::Sender<AppEvent>,
) -> Result<SessionOutcome> {
    let files = enumerate_folder(folder);
    let mut outcome = SessionOutcome {
        total_files: files.len(),
        ..Default::default()
    };

    let _ = event_tx
        .send(AppEvent::Status(format!(
            "Connecting to {target} ({} files)...",
            files.len()
        )))
        .await;

    let mut stream = bounded(cfg.io_timeout, "connect", TcpStream::connect(target))
        .await
        .with_context(|| format!("failed to connect to {target}"))?;
    info!("connected to {target}");

    // The peer has no ready handshake; give it a moment to set up before
    // the first byte arrives
    tokio::time::sleep(cfg.connect_grace).await;

    for (rel, abs) in &files {
        match send_one(cfg, &mut stream, rel, abs).await {
            Ok(n) => {
                outcome.files_sent += 1;
                outcome.bytes_sent += n;
                let _ = event_tx
                    .send(AppEvent::TransferProgress {
                        file_name: rel.clone(),
                        completed: outcome.files_sent,
                        total: outcome.total_files,
                    })
                    .await;
            }
            Err(e) => {
                outcome.files_failed += 1;
                warn!("error sending {rel}: {e:#}");
                let _ = event_tx
                    .send(AppEvent::Status(format!("Error sending {rel}: {e:#}")))
                    .await;
                if cfg.abort_on_file_error {
                    return Err(e.context(format!("aborting session on {rel}")));
                }
            }
        }

        // Coarse pacing in place of real backpressure; the peer writes
        // each file to disk as it lands
        tokio::time::sleep(cfg.inter_file_delay).await;
    }

    match bounded(cfg.io_timeout, "sentinel write", write_sentinel(&mut stream)).await {
        Ok(()) => outcome.bytes_sent += super::protocol::SENTINEL.len() as u64,
        Err(e) => {
            warn!("error sending end-of-stream marker: {e:#}");
            let _ = event_tx
                .send(AppEvent::Status(format!(
                    "Error sending end-of-stream marker: {e:#}"
                )))
                .await;
        }
    }

    info!(
        "folder transfer complete: {}/{} files, {} bytes",
        outcome.files_sent, outcome.total_files, outcome.bytes_sent
    );
    let _ = event_tx
        .send(AppEvent::Status("Folder transfer complete.".to_string()))
        .await;

    Ok(outcome)
}

/// Frame and send a single file; returns the bytes put on the wire.
async fn send_one(
    cfg: &ProtocolConfig,
    stream: &mut TcpStream,
    rel: &str,
    abs: &Path,
) -> Result<u64> {
    let content = tokio::fs::read(abs)
        .await
        .with_context(|| format!("failed to read {}", abs.display()))?;
    let payload = encode_record(rel, &content);

    bounded(cfg.io_timeout, "frame write", write_frame(stream, &payload)).await?;
    Ok(4 + payload.len() as u64)
}

/// Run `fut` under the configured deadline, or unbounded when none is set.
async fn bounded<T, E, F>(deadline: Option<Duration>, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: Into<anyhow::Error>,
{
    match deadline {
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(res) => res.map_err(Into::into),
            Err(_) => bail!("{what} timed out after {d:?}"),
        },
        None => fut.await.map_err(Into::into),
    }
}
