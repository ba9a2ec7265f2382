//! VirtualBox-backed stage for dodo
//!
//! Builds a boot2docker VM through `VBoxManage`, attaches it to a host-only
//! network, and provisions a TLS-protected container daemon over SSH.
//!
//! # Requirements
//!
//! - `VBoxManage` on `PATH` (or `DODO_VBOXMANAGE`)
//! - an OpenSSH client on `PATH`
//!
//! # Example
//!
//! ```ignore
//! use dodo_stage::{HostEnv, Stage, StageConfig};
//! use dodo_stage_virtualbox::VirtualBoxStage;
//!
//! let mut stage = VirtualBoxStage::new(HostEnv::from_process()?);
//! stage.initialize("dev", &StageConfig::new("virtualbox")).await?;
//! stage.create().await?;
//! let docker = stage.docker_options().await?;
//! ```

pub mod certs;
pub mod disk;
pub mod error;
mod fsutil;
pub mod iso;
pub mod network;
pub mod options;
pub mod provision;
pub mod ssh;
pub mod stage;
pub mod vboxmanage;

pub use error::{Result, VirtualBoxError};
pub use options::VirtualBoxOptions;
pub use stage::{STAGE_TYPE, SSH_USERNAME, Timeouts, VirtualBoxStage};
pub use vboxmanage::{RetryPolicy, VBoxManage};
