//! boot2docker ISO cache

use crate::error::{Result, VirtualBoxError};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const ISO_FILE: &str = "boot2docker.iso";

pub const DEFAULT_ISO_URL: &str =
    "https://github.com/boot2docker/boot2docker/releases/download/v19.03.12/boot2docker.iso";

fn is_remote(source: &str) -> bool {
    source.starts_with("https://") || source.starts_with("http://")
}

/// Place the ISO named by `source` at `dest`
///
/// URLs are downloaded once into `cache_dir` and copied from there; anything
/// else is taken as a local path.
pub async fn ensure_iso(source: &str, cache_dir: &Path, dest: &Path) -> Result<PathBuf> {
    let origin = if is_remote(source) {
        let cached = cache_dir.join(ISO_FILE);
        if !cached.exists() {
            download(source, &cached).await?;
        } else {
            tracing::debug!(path = %cached.display(), "Using cached ISO");
        }
        cached
    } else {
        let local = PathBuf::from(source);
        if !local.is_file() {
            return Err(VirtualBoxError::Download(format!(
                "ISO not found at {}",
                local.display()
            )));
        }
        local
    };

    fs::copy(&origin, dest).await?;
    tracing::debug!(from = %origin.display(), to = %dest.display(), "Copied ISO");
    Ok(dest.to_path_buf())
}

async fn download(url: &str, dest: &Path) -> Result<()> {
    tracing::info!(url, "Downloading boot2docker ISO");

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    let client = reqwest::Client::builder()
        .user_agent(concat!("dodo/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| VirtualBoxError::Download(e.to_string()))?;
    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| VirtualBoxError::Download(format!("{}: {}", url, e)))?;

    if !response.status().is_success() {
        return Err(VirtualBoxError::Download(format!(
            "{} returned {}",
            url,
            response.status()
        )));
    }

    // Stream into a partial file so an interrupted download is never cached
    let partial = dest.with_extension("iso.part");
    let mut file = fs::File::create(&partial).await?;
    let mut total = 0u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| VirtualBoxError::Download(format!("{}: {}", url, e)))?
    {
        file.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);

    fs::rename(&partial, dest).await?;
    tracing::info!(bytes = total, path = %dest.display(), "Downloaded ISO");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_iso_is_copied() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("custom.iso");
        std::fs::write(&source, b"iso image").unwrap();
        let dest = dir.path().join("stage").join(ISO_FILE);
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();

        let placed = ensure_iso(source.to_str().unwrap(), &dir.path().join("cache"), &dest)
            .await
            .unwrap();

        assert_eq!(placed, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), b"iso image");
    }

    #[tokio::test]
    async fn test_cached_download_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join(ISO_FILE), b"cached").unwrap();
        let dest = dir.path().join(ISO_FILE);

        ensure_iso("https://invalid.example/boot2docker.iso", &cache, &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"cached");
    }

    #[tokio::test]
    async fn test_missing_local_iso() {
        let dir = tempfile::tempdir().unwrap();
        let err = ensure_iso("/nonexistent/boot2docker.iso", dir.path(), &dir.path().join("x.iso"))
            .await
            .unwrap_err();
        assert!(matches!(err, VirtualBoxError::Download(_)));
    }
}
