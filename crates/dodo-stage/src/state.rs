//! Persisted stage state
//!
//! Manages `state.json` (the only state a VM-backed stage keeps between
//! invocations) and `lock.json`, an advisory lock keyed by the stage storage
//! directory.

use crate::error::{Result, StageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";
const LOCK_FILE: &str = "lock.json";
const STALE_LOCK_HOURS: i64 = 1;

/// State saved after create/start and loaded at initialize
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageState {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,

    #[serde(rename = "Username", default)]
    pub username: String,

    #[serde(rename = "PrivateKeyFile", default)]
    pub private_key_file: String,
}

/// Reads and writes the files of one stage storage directory
#[derive(Debug, Clone)]
pub struct StateManager {
    dir: PathBuf,
}

impl StateManager {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.dir.join(STATE_BACKUP)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).await?;
            tracing::debug!("Created stage directory: {}", self.dir.display());
        }
        Ok(())
    }

    /// Load the persisted state, `None` when the stage never saved any
    pub async fn load(&self) -> Result<Option<StageState>> {
        let path = self.state_path();
        if !path.exists() {
            tracing::debug!("State file not found: {}", path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        let state: StageState = serde_json::from_str(&content)?;
        tracing::debug!(ip = %state.ip_address, "Loaded stage state");
        Ok(Some(state))
    }

    /// Save the state, keeping the previous file as a backup
    pub async fn save(&self, state: &StageState) -> Result<()> {
        self.ensure_dir().await?;

        let path = self.state_path();
        let backup = self.backup_path();

        if path.exists() {
            if backup.exists() {
                fs::remove_file(&backup).await?;
            }
            fs::rename(&path, &backup).await?;
        }

        let content = serde_json::to_string_pretty(state)?;
        fs::write(&path, content).await?;

        tracing::debug!(ip = %state.ip_address, "Saved stage state");
        Ok(())
    }

    /// Acquire the advisory lock for exclusive access to this stage
    ///
    /// The lock file is created with `create_new`, so two callers can never
    /// both hold it. A lock older than one hour is considered stale and taken
    /// over once.
    pub async fn acquire_lock(&self, operation: &str) -> Result<StageLock> {
        self.ensure_dir().await?;

        let lock_path = self.lock_path();
        let lock_info = LockInfo {
            holder: format!("{} (pid {})", hostname(), std::process::id()),
            operation: operation.to_string(),
            acquired_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&lock_info)?;

        if !create_lock_file(&lock_path, &content).await? {
            check_existing_lock(&lock_path).await?;

            match fs::remove_file(&lock_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if !create_lock_file(&lock_path, &content).await? {
                return Err(StageError::Locked(format!(
                    "{} was taken over by another process",
                    lock_path.display()
                )));
            }
        }

        tracing::debug!(operation, "Acquired stage lock");
        Ok(StageLock {
            lock_path,
            released: false,
        })
    }
}

/// Create the lock file; `false` when it already exists
async fn create_lock_file(path: &Path, content: &str) -> Result<bool> {
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    file.write_all(content.as_bytes()).await?;
    file.flush().await?;
    Ok(true)
}

/// Fail with `Locked` unless the lock at `path` is stale or gone
async fn check_existing_lock(path: &Path) -> Result<()> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_str::<LockInfo>(&content) {
        Ok(lock_info) => {
            let age = Utc::now().signed_duration_since(lock_info.acquired_at);
            if age.num_hours() < STALE_LOCK_HOURS {
                return Err(StageError::Locked(format!(
                    "{} is running '{}' since {} (remove {} if this is wrong)",
                    lock_info.holder,
                    lock_info.operation,
                    lock_info.acquired_at,
                    path.display()
                )));
            }
            tracing::warn!("Removing stale lock from {}", lock_info.holder);
        }
        Err(e) => {
            // A lock still being written by its creator reads as empty
            let window = Duration::from_secs(STALE_LOCK_HOURS as u64 * 3600);
            let fresh = match fs::metadata(path).await.and_then(|m| m.modified()) {
                Ok(modified) => modified.elapsed().map_or(true, |age| age < window),
                Err(_) => false,
            };
            if fresh {
                return Err(StageError::Locked(format!(
                    "{} is being acquired by another process",
                    path.display()
                )));
            }
            tracing::warn!("Removing unreadable lock file {}: {}", path.display(), e);
        }
    }
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    operation: String,
    acquired_at: DateTime<Utc>,
}

/// RAII guard for the stage lock
#[derive(Debug)]
pub struct StageLock {
    lock_path: PathBuf,
    released: bool,
}

impl StageLock {
    /// Release the lock
    pub async fn release(mut self) -> Result<()> {
        if !self.released {
            if self.lock_path.exists() {
                fs::remove_file(&self.lock_path).await?;
                tracing::debug!("Released stage lock");
            }
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for StageLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}
