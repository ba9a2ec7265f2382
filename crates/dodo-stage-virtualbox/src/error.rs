//! VirtualBox stage error types

use dodo_stage::{PollTimeout, StageError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VirtualBoxError {
    #[error("{program} failed: {stderr}")]
    Command { program: String, stderr: String },

    #[error("host-only network {network} collides with host interface {interface}; choose another range")]
    NetworkCollision { network: String, interface: String },

    #[error("Invalid network '{0}': expected an IPv4 CIDR such as 192.168.99.1/24")]
    InvalidNetwork(String),

    #[error("Unexpected VBoxManage output: {0}")]
    Parse(String),

    #[error("Disk image error: {0}")]
    Disk(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("SSH key error: {0}")]
    Key(String),

    #[error("ISO download failed: {0}")]
    Download(String),

    #[error("Provisioning failed: {0}")]
    Provision(String),

    #[error(transparent)]
    Timeout(#[from] PollTimeout),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<VirtualBoxError> for StageError {
    fn from(err: VirtualBoxError) -> Self {
        match err {
            VirtualBoxError::Command { program, stderr } => StageError::Process { program, stderr },
            VirtualBoxError::NetworkCollision { network, interface } => {
                StageError::NetworkCollision { network, interface }
            }
            VirtualBoxError::InvalidNetwork(network) => StageError::Configuration(format!(
                "option 'host_only_cidr' has invalid value '{}': expected an IPv4 CIDR",
                network
            )),
            VirtualBoxError::Timeout(timeout) => StageError::Timeout(timeout),
            VirtualBoxError::Stage(inner) => inner,
            VirtualBoxError::Io(e) => StageError::Io(e),
            other => StageError::Provider(other.to_string()),
        }
    }
}

impl From<dodo_config::ConfigError> for VirtualBoxError {
    fn from(err: dodo_config::ConfigError) -> Self {
        VirtualBoxError::Stage(err.into())
    }
}

pub type Result<T> = std::result::Result<T, VirtualBoxError>;
