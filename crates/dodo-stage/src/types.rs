//! Data exchanged between stages and their callers

use crate::error::{Result, StageError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Stage selection and free-form options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Built-in type name or plugin name (e.g. "virtualbox", "environment")
    #[serde(rename = "type")]
    pub stage_type: String,

    /// Implementation specific options
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl StageConfig {
    pub fn new(stage_type: impl Into<String>) -> Self {
        Self {
            stage_type: stage_type.into(),
            options: HashMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Get a non-empty option value
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Parse an option, falling back to `default` when absent
    pub fn parse_option<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.option(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse::<T>().map_err(|e| {
                StageError::Configuration(format!("option '{}' has invalid value '{}': {}", key, raw, e))
            }),
        }
    }
}

/// How to reach a stage over SSH
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshOptions {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub private_key_file: String,
}

/// How to reach the container daemon of a stage
///
/// Empty TLS fields mean the daemon is reached without TLS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerOptions {
    #[serde(rename = "version")]
    pub api_version: String,
    pub host: String,
    pub ca_file: String,
    pub cert_file: String,
    pub key_file: String,
}

impl DockerOptions {
    pub fn uses_tls(&self) -> bool {
        !self.ca_file.is_empty() || !self.cert_file.is_empty() || !self.key_file.is_empty()
    }

    /// Environment variables understood by the docker CLI
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env = vec![("DOCKER_HOST".to_string(), self.host.clone())];
        if !self.api_version.is_empty() {
            env.push(("DOCKER_API_VERSION".to_string(), self.api_version.clone()));
        }
        if self.uses_tls() {
            env.push(("DOCKER_TLS_VERIFY".to_string(), "1".to_string()));
            if let Some(dir) = std::path::Path::new(&self.ca_file).parent() {
                env.push((
                    "DOCKER_CERT_PATH".to_string(),
                    dir.display().to_string(),
                ));
            }
        }
        env
    }
}

/// Options for `Stage::remove`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveOptions {
    /// Log and skip failing teardown steps instead of aborting
    pub force: bool,
    /// Also remove data volumes
    pub volumes: bool,
}

/// Observed lifecycle status of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Nonexistent,
    Stopped,
    Running,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageStatus::Nonexistent => write!(f, "nonexistent"),
            StageStatus::Stopped => write!(f, "stopped"),
            StageStatus::Running => write!(f, "running"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_config_serde_uses_type_key() {
        let config = StageConfig::new("virtualbox").with_option("cpus", "2");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["type"], "virtualbox");
        assert_eq!(json["options"]["cpus"], "2");

        let parsed: StageConfig = serde_json::from_str(r#"{"type":"generic"}"#).unwrap();
        assert_eq!(parsed.stage_type, "generic");
        assert!(parsed.options.is_empty());
    }

    #[test]
    fn test_parse_option() {
        let config = StageConfig::new("virtualbox")
            .with_option("memory", "2048")
            .with_option("cpus", "two")
            .with_option("blank", "  ");

        assert_eq!(config.parse_option("memory", 1024u32).unwrap(), 2048);
        assert_eq!(config.parse_option("disk_size", 20000u64).unwrap(), 20000);
        assert_eq!(config.parse_option("blank", 7u32).unwrap(), 7);
        assert!(matches!(
            config.parse_option("cpus", 1u32),
            Err(StageError::Configuration(_))
        ));
    }

    #[test]
    fn test_docker_env() {
        let options = DockerOptions {
            api_version: "1.40".to_string(),
            host: "tcp://192.168.99.100:2376".to_string(),
            ca_file: "/stages/dev/ca.pem".to_string(),
            cert_file: "/stages/dev/client.pem".to_string(),
            key_file: "/stages/dev/client-key.pem".to_string(),
        };

        let env = options.to_env();
        assert!(env.contains(&("DOCKER_TLS_VERIFY".to_string(), "1".to_string())));
        assert!(env.contains(&("DOCKER_CERT_PATH".to_string(), "/stages/dev".to_string())));

        let plain = DockerOptions {
            host: "unix:///var/run/docker.sock".to_string(),
            ..Default::default()
        };
        assert!(!plain.uses_tls());
        assert_eq!(plain.to_env().len(), 1);
    }
}
