//! Stage trait definition

use crate::error::Result;
use crate::types::{DockerOptions, RemoveOptions, SshOptions, StageConfig};
use async_trait::async_trait;

/// Execution environment capable of hosting a container daemon
///
/// All implementations (the `environment` and `generic` built-ins, the
/// VirtualBox VM, and out-of-process plugins) share this interface.
///
/// Lifecycle: `initialize` first, then `create`/`start`/`stop`/`remove` as the
/// observed status allows. `exist` and `available` never change anything.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Bind the stage to its name and options, loading persisted state
    async fn initialize(&mut self, name: &str, config: &StageConfig) -> Result<()>;

    /// Bring a nonexistent stage up, ending in the running state
    async fn create(&mut self) -> Result<()>;

    /// Start a stopped stage
    async fn start(&mut self) -> Result<()>;

    /// Stop a running stage
    async fn stop(&mut self) -> Result<()>;

    /// Tear the stage down, whatever its state
    async fn remove(&mut self, options: RemoveOptions) -> Result<()>;

    /// Whether the stage exists at all
    async fn exist(&self) -> Result<bool>;

    /// Whether the stage is running and its daemon is reachable
    async fn available(&self) -> Result<bool>;

    async fn ssh_options(&self) -> Result<SshOptions>;

    async fn docker_options(&self) -> Result<DockerOptions>;

    /// Release resources owned by this instance (plugin processes)
    async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}
