//! Stage backed by the caller's docker environment variables

use crate::error::{Result, StageError};
use crate::stage::Stage;
use crate::types::{DockerOptions, RemoveOptions, SshOptions, StageConfig};
use async_trait::async_trait;
use std::path::PathBuf;

pub const STAGE_TYPE: &str = "environment";

#[cfg(windows)]
const DEFAULT_DOCKER_HOST: &str = "npipe:////./pipe/docker_engine";
#[cfg(not(windows))]
const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Uses whatever daemon `DOCKER_HOST` and friends point at
///
/// Lifecycle methods are no-ops; the daemon is managed elsewhere.
#[derive(Debug, Default)]
pub struct EnvironmentStage {
    name: String,
}

impl EnvironmentStage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Read `DockerOptions` from `DOCKER_HOST`, `DOCKER_API_VERSION`,
/// `DOCKER_TLS_VERIFY` and `DOCKER_CERT_PATH`
pub fn docker_options_from_env() -> DockerOptions {
    let mut options = DockerOptions {
        api_version: env_var("DOCKER_API_VERSION").unwrap_or_default(),
        host: env_var("DOCKER_HOST").unwrap_or_else(|| DEFAULT_DOCKER_HOST.to_string()),
        ..Default::default()
    };

    if env_var("DOCKER_TLS_VERIFY").is_some() {
        let cert_path = env_var("DOCKER_CERT_PATH")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".docker")));

        if let Some(dir) = cert_path {
            options.ca_file = dir.join("ca.pem").display().to_string();
            options.cert_file = dir.join("cert.pem").display().to_string();
            options.key_file = dir.join("key.pem").display().to_string();
        }
    }

    options
}

#[async_trait]
impl Stage for EnvironmentStage {
    async fn initialize(&mut self, name: &str, _config: &StageConfig) -> Result<()> {
        self.name = name.to_string();
        tracing::debug!(stage = %name, "Initialized environment stage");
        Ok(())
    }

    async fn create(&mut self) -> Result<()> {
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    async fn remove(&mut self, _options: RemoveOptions) -> Result<()> {
        Ok(())
    }

    async fn exist(&self) -> Result<bool> {
        Ok(true)
    }

    async fn available(&self) -> Result<bool> {
        Ok(true)
    }

    async fn ssh_options(&self) -> Result<SshOptions> {
        Err(StageError::Unsupported {
            stage_type: STAGE_TYPE.to_string(),
            operation: "ssh access",
        })
    }

    async fn docker_options(&self) -> Result<DockerOptions> {
        let options = docker_options_from_env();
        tracing::debug!(stage = %self.name, host = %options.host, "Using docker environment");
        Ok(options)
    }
}
