//! Release download glue: pulls the latest release archive from the
//! hosting service, unpacks it and stages its `src/` folder in the update
//! directory next to a one-line version marker.

use crate::AppEvent;
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::info;

const VERSION_FILE: &str = "version.txt";
const USER_AGENT: &str = concat!("updater/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseInfo {
    pub tag_name: String,
    pub zipball_url: String,
}

fn http_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().user_agent(USER_AGENT).build()?)
}

/// Query the hosting service for the latest release of `repo`
/// ("owner/name").
pub async fn fetch_latest_release(repo: &str) -> Result<ReleaseInfo> {
    let url = format!("https://api.github.com/repos/{repo}/releases/latest");
    let resp = http_client()?.get(&url).send().await?;
    if !resp.status().is_success() {
        bail!("release query for {repo} failed with status {}", resp.status());
    }
    Ok(resp.json().await?)
}

/// Read the currently staged version from the marker file, if any.
pub fn installed_version(update_dir: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(update_dir.join(VERSION_FILE)).ok()?;
    let version = raw.trim().to_string();
    (!version.is_empty()).then_some(version)
}

/// Write the version marker for the staged update.
pub fn write_version_marker(update_dir: &Path, tag: &str) -> Result<()> {
    std::fs::create_dir_all(update_dir)?;
    std::fs::write(update_dir.join(VERSION_FILE), tag)?;
    Ok(())
}

/// Download the latest release of `repo`, extract it and replace
/// `update_dir` with its `src/` folder plus the version marker. Returns
/// the release tag.
pub async fn download_update(
    repo: &str,
    update_dir: &Path,
    event_tx: &mpsc::Sender<AppEvent>,
) -> Result<String> {
    let release = fetch_latest_release(repo)
        .await
        .context("failed to query latest release")?;
    info!("latest release of {repo}: {}", release.tag_name);
    let _ = event_tx
        .send(AppEvent::Status(format!("Latest release: {}", release.tag_name)))
        .await;

    let work_dir = update_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    tokio::fs::create_dir_all(&work_dir).await?;
    let zip_path = work_dir.join("update.zip");
    let extract_dir = work_dir.join("temp_update");

    // Stream the archive to disk
    let mut resp = http_client()?.get(&release.zipball_url).send().await?;
    if !resp.status().is_success() {
        bail!("archive download failed with status {}", resp.status());
    }
    let mut zip_file = tokio::fs::File::create(&zip_path).await?;
    while let Some(chunk) = resp.chunk().await? {
        zip_file.write_all(&chunk).await?;
    }
    zip_file.flush().await?;
    drop(zip_file);
    let _ = event_tx
        .send(AppEvent::Status("Downloaded release archive.".to_string()))
        .await;

    // Extraction is synchronous, keep it off the runtime threads
    let _ = tokio::fs::remove_dir_all(&extract_dir).await;
    {
        let zip_path = zip_path.clone();
        let extract_dir = extract_dir.clone();
        tokio::task::spawn_blocking(move || extract_archive(&zip_path, &extract_dir))
            .await
            .context("extraction task panicked")??;
    }
    let _ = event_tx
        .send(AppEvent::Status("Extracted release archive.".to_string()))
        .await;

    // The archive contains a single top-level folder; the update payload
    // is its src/ subfolder
    let top_level = first_subdirectory(&extract_dir)
        .await?
        .context("no directory found in the extracted archive")?;
    let src_path = top_level.join("src");
    if !tokio::fs::try_exists(&src_path).await? {
        bail!("no 'src' folder found in the release archive");
    }

    // Replace any previously staged update wholesale
    let _ = tokio::fs::remove_dir_all(update_dir).await;
    tokio::fs::create_dir_all(update_dir).await?;
    tokio::fs::rename(&src_path, update_dir.join("src"))
        .await
        .context("failed to move release payload into the update directory")?;
    write_version_marker(update_dir, &release.tag_name)?;
    info!(
        "update staged in {} as version {}",
        update_dir.display(),
        release.tag_name
    );

    // Clean up the download leftovers
    let _ = tokio::fs::remove_file(&zip_path).await;
    let _ = tokio::fs::remove_dir_all(&extract_dir).await;

    Ok(release.tag_name)
}

fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    std::fs::create_dir_all(dest)?;
    zip.extract(dest)?;
    Ok(())
}

async fn first_subdirectory(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}
