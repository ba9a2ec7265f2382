//! Stage pointing at a statically configured daemon

use crate::error::{Result, StageError};
use crate::stage::Stage;
use crate::types::{DockerOptions, RemoveOptions, SshOptions, StageConfig};
use async_trait::async_trait;

pub const STAGE_TYPE: &str = "generic";

/// Daemon reachable at a fixed address
///
/// Options: `host` (required), `api_version`, `ca_file`, `cert_file`,
/// `key_file`, and `ssh_hostname`, `ssh_port`, `ssh_username`,
/// `ssh_private_key_file` for shell access.
#[derive(Debug, Default)]
pub struct GenericStage {
    docker: Option<DockerOptions>,
    ssh: Option<SshOptions>,
}

impl GenericStage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn option(config: &StageConfig, key: &str) -> String {
    config.option(key).unwrap_or_default().to_string()
}

#[async_trait]
impl Stage for GenericStage {
    async fn initialize(&mut self, name: &str, config: &StageConfig) -> Result<()> {
        let host = config.option("host").ok_or_else(|| {
            StageError::Configuration(format!("stage '{}' requires the 'host' option", name))
        })?;

        let docker = DockerOptions {
            api_version: option(config, "api_version"),
            host: host.to_string(),
            ca_file: option(config, "ca_file"),
            cert_file: option(config, "cert_file"),
            key_file: option(config, "key_file"),
        };

        let partial_tls = docker.uses_tls()
            && (docker.ca_file.is_empty() || docker.cert_file.is_empty() || docker.key_file.is_empty());
        if partial_tls {
            return Err(StageError::Configuration(format!(
                "stage '{}' needs all of 'ca_file', 'cert_file' and 'key_file' for TLS",
                name
            )));
        }

        self.ssh = match config.option("ssh_hostname") {
            Some(hostname) => Some(SshOptions {
                hostname: hostname.to_string(),
                port: config.parse_option("ssh_port", 22u16)?,
                username: option(config, "ssh_username"),
                private_key_file: option(config, "ssh_private_key_file"),
            }),
            None => None,
        };

        tracing::debug!(stage = %name, host = %docker.host, "Initialized generic stage");
        self.docker = Some(docker);
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
        self.ssh.clone().ok_or_else(|| StageError::Unsupported {
            stage_type: STAGE_TYPE.to_string(),
            operation: "ssh access without 'ssh_hostname'",
        })
    }

    async fn docker_options(&self) -> Result<DockerOptions> {
        self.docker.clone().ok_or(StageError::NotInitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requires_host() {
        let mut stage = GenericStage::new();
        let err = stage
            .initialize("remote", &StageConfig::new(STAGE_TYPE))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Configuration(msg) if msg.contains("host")));
    }

    #[tokio::test]
    async fn test_static_options() {
        let config = StageConfig::new(STAGE_TYPE)
            .with_option("host", "tcp://build.example.com:2376")
            .with_option("ca_file", "/certs/ca.pem")
            .with_option("cert_file", "/certs/cert.pem")
            .with_option("key_file", "/certs/key.pem")
            .with_option("ssh_hostname", "build.example.com")
            .with_option("ssh_username", "ci");

        let mut stage = GenericStage::new();
        stage.initialize("remote", &config).await.unwrap();

        let docker = stage.docker_options().await.unwrap();
        assert_eq!(docker.host, "tcp://build.example.com:2376");
        assert!(docker.uses_tls());

        let ssh = stage.ssh_options().await.unwrap();
        assert_eq!(ssh.hostname, "build.example.com");
        assert_eq!(ssh.port, 22);
        assert_eq!(ssh.username, "ci");
    }

    #[tokio::test]
    async fn test_rejects_partial_tls() {
        let config = StageConfig::new(STAGE_TYPE)
            .with_option("host", "tcp://10.0.0.2:2376")
            .with_option("ca_file", "/certs/ca.pem");

        let mut stage = GenericStage::new();
        assert!(matches!(
            stage.initialize("remote", &config).await,
            Err(StageError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_docker_options_before_initialize() {
        let stage = GenericStage::new();
        assert!(matches!(
            stage.docker_options().await,
            Err(StageError::NotInitialized)
        ));
    }
}
