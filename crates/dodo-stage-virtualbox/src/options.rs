//! Options of the `virtualbox` stage type

use crate::iso::DEFAULT_ISO_URL;
use dodo_stage::{Result, StageConfig, StageError};
use ipnetwork::Ipv4Network;

pub const DEFAULT_CPUS: u32 = 1;
pub const DEFAULT_MEMORY_MB: u32 = 1024;
pub const DEFAULT_DISK_SIZE_MB: u64 = 20000;
pub const DEFAULT_HOST_ONLY_CIDR: &str = "192.168.99.1/24";

/// Validated stage options
///
/// | option | default |
/// |---|---|
/// | `cpus` | 1 |
/// | `memory` (MB) | 1024 |
/// | `disk_size` (MB) | 20000 |
/// | `host_only_cidr` | 192.168.99.1/24 |
/// | `iso_url` | boot2docker release (URL or local path) |
/// | `hostname` | stage name |
/// | `ssh_port` | 0, a free loopback port |
/// | `docker_args` | none, space separated |
/// | `docker_env` | none, comma separated `KEY=VALUE` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualBoxOptions {
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_size_mb: u64,
    pub host_only_cidr: String,
    pub iso_url: String,
    pub hostname: String,
    pub ssh_port: u16,
    pub docker_args: Vec<String>,
    pub docker_env: Vec<(String, String)>,
}

impl VirtualBoxOptions {
    pub fn from_config(name: &str, config: &StageConfig) -> Result<Self> {
        let cpus = config.parse_option("cpus", DEFAULT_CPUS)?;
        if cpus == 0 {
            return Err(StageError::Configuration("option 'cpus' must be at least 1".to_string()));
        }

        let memory_mb = config.parse_option("memory", DEFAULT_MEMORY_MB)?;
        if memory_mb < 64 {
            return Err(StageError::Configuration(
                "option 'memory' must be at least 64 (MB)".to_string(),
            ));
        }

        let disk_size_mb = config.parse_option("disk_size", DEFAULT_DISK_SIZE_MB)?;
        if disk_size_mb == 0 || crate::disk::image_size(disk_size_mb).is_err() {
            return Err(StageError::Configuration(format!(
                "option 'disk_size' has invalid value {}: expected a size in MB",
                disk_size_mb
            )));
        }

        // Stage names may carry '_', which hostnames may not
        let hostname = match config.option("hostname") {
            Some(hostname) => hostname.trim().to_string(),
            None => name.replace('_', "-"),
        };
        if !is_valid_hostname(&hostname) {
            return Err(StageError::Configuration(format!(
                "option 'hostname' has invalid value '{}': expected an RFC 1123 host name",
                hostname
            )));
        }

        let host_only_cidr = config
            .option("host_only_cidr")
            .unwrap_or(DEFAULT_HOST_ONLY_CIDR)
            .trim()
            .to_string();
        if !host_only_cidr.contains('/') || host_only_cidr.parse::<Ipv4Network>().is_err() {
            return Err(StageError::Configuration(format!(
                "option 'host_only_cidr' has invalid value '{}': expected an IPv4 CIDR",
                host_only_cidr
            )));
        }

        let docker_env = match config.option("docker_env") {
            None => Vec::new(),
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(|entry| match entry.split_once('=') {
                    Some((key, value)) if !key.trim().is_empty() => {
                        Ok((key.trim().to_string(), value.to_string()))
                    }
                    _ => Err(StageError::Configuration(format!(
                        "option 'docker_env' entry '{}' is not KEY=VALUE",
                        entry
                    ))),
                })
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(Self {
            cpus,
            memory_mb,
            disk_size_mb,
            host_only_cidr,
            iso_url: config.option("iso_url").unwrap_or(DEFAULT_ISO_URL).to_string(),
            hostname,
            ssh_port: config.parse_option("ssh_port", 0u16)?,
            docker_args: config
                .option("docker_args")
                .map(|raw| raw.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
            docker_env,
        })
    }
}

/// RFC 1123 host name: dot-separated labels of ASCII letters, digits and
/// inner hyphens, each at most 63 characters
pub(crate) fn is_valid_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.len() <= 253
        && hostname.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = VirtualBoxOptions::from_config("dev", &StageConfig::new("virtualbox")).unwrap();

        assert_eq!(options.cpus, DEFAULT_CPUS);
        assert_eq!(options.memory_mb, DEFAULT_MEMORY_MB);
        assert_eq!(options.disk_size_mb, DEFAULT_DISK_SIZE_MB);
        assert_eq!(options.host_only_cidr, DEFAULT_HOST_ONLY_CIDR);
        assert_eq!(options.hostname, "dev");
        assert_eq!(options.ssh_port, 0);
        assert!(options.docker_env.is_empty());
    }

    #[test]
    fn test_parses_all_options() {
        let config = StageConfig::new("virtualbox")
            .with_option("cpus", "2")
            .with_option("memory", "2048")
            .with_option("disk_size", "4096")
            .with_option("host_only_cidr", "10.10.0.1/28")
            .with_option("iso_url", "/isos/b2d.iso")
            .with_option("hostname", "builder")
            .with_option("docker_args", "--label env=dev  --debug")
            .with_option("docker_env", "HTTP_PROXY=http://proxy:3128, NO_PROXY=localhost");

        let options = VirtualBoxOptions::from_config("dev", &config).unwrap();
        assert_eq!(options.cpus, 2);
        assert_eq!(options.disk_size_mb, 4096);
        assert_eq!(options.host_only_cidr, "10.10.0.1/28");
        assert_eq!(options.hostname, "builder");
        assert_eq!(options.docker_args, vec!["--label", "env=dev", "--debug"]);
        assert_eq!(
            options.docker_env,
            vec![
                ("HTTP_PROXY".to_string(), "http://proxy:3128".to_string()),
                ("NO_PROXY".to_string(), "localhost".to_string()),
            ]
        );
    }

    #[test]
    fn test_rejects_invalid_options() {
        for (key, value) in [
            ("cpus", "0"),
            ("memory", "lots"),
            ("disk_size", "0"),
            ("host_only_cidr", "192.168.99.1"),
            ("docker_env", "NOVALUE"),
            ("ssh_port", "70000"),
            ("disk_size", "18446744073709551615"),
            ("hostname", "dev'; reboot; echo '"),
            ("hostname", "-dev"),
            ("hostname", "dev..local"),
        ] {
            let config = StageConfig::new("virtualbox").with_option(key, value);
            assert!(
                matches!(
                    VirtualBoxOptions::from_config("dev", &config),
                    Err(StageError::Configuration(_))
                ),
                "{}={} should be rejected",
                key,
                value
            );
        }
    }

    #[test]
    fn test_hostname_defaults_to_a_valid_form_of_the_name() {
        let options = VirtualBoxOptions::from_config("my_stage", &StageConfig::new("virtualbox")).unwrap();
        assert_eq!(options.hostname, "my-stage");

        let config = StageConfig::new("virtualbox").with_option("hostname", "builder-1.local");
        let options = VirtualBoxOptions::from_config("dev", &config).unwrap();
        assert_eq!(options.hostname, "builder-1.local");
    }
}
