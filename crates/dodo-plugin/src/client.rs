//! Host side: launching plugins and the RPC-backed stage

use crate::codec::{Connection, Request};
use crate::error::{PluginError, Result};
use crate::handshake::{COOKIE_KEY, HANDSHAKE_TIMEOUT, Handshake, PROTOCOLS_ENV, Protocol};
use async_trait::async_trait;
use dodo_stage::{DockerOptions, RemoveOptions, SshOptions, Stage, StageConfig};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type PluginConnection = Connection<BoxedReader, BoxedWriter>;

/// A running plugin subprocess
///
/// [`PluginProcess::release`] kills it; the child is also spawned with
/// `kill_on_drop`, so every other exit path terminates it too.
#[derive(Debug)]
pub struct PluginProcess {
    stage_type: String,
    child: Option<Child>,
    stderr_task: Option<JoinHandle<()>>,
}

impl PluginProcess {
    pub fn is_released(&self) -> bool {
        self.child.is_none()
    }

    /// Kill the plugin and reap it; later calls do nothing
    pub async fn release(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        match child.try_wait()? {
            Some(status) => {
                tracing::debug!(plugin = %self.stage_type, %status, "Plugin already exited");
            }
            None => {
                child.start_kill()?;
                let status = child.wait().await?;
                tracing::debug!(plugin = %self.stage_type, %status, "Plugin stopped");
            }
        }

        // The forwarder ends on its own once the pipe closes
        self.stderr_task.take();
        Ok(())
    }
}

async fn forward_stderr(stage_type: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!(target: "dodo::plugin", plugin = %stage_type, "{}", line);
    }
}

fn missing_pipe(name: &str) -> PluginError {
    PluginError::Handshake(format!("plugin {} is not available", name))
}

/// Launch the plugin at `path` and complete the handshake
pub async fn launch(path: &Path, stage_type: &str) -> Result<(PluginProcess, PluginConnection)> {
    tracing::debug!(plugin = stage_type, path = %path.display(), "Launching plugin");

    let mut child = Command::new(path)
        .env(COOKIE_KEY, stage_type)
        .env(PROTOCOLS_ENV, Protocol::offer(&Protocol::HOST_PREFERENCE))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

    let mut process = PluginProcess {
        stage_type: stage_type.to_string(),
        child: Some(child),
        stderr_task: Some(tokio::spawn(forward_stderr(stage_type.to_string(), stderr))),
    };

    let mut lines = BufReader::new(Box::new(stdout) as BoxedReader).lines();
    let handshake = match tokio::time::timeout(HANDSHAKE_TIMEOUT, lines.next_line()).await {
        Ok(Ok(Some(line))) => Handshake::parse(&line),
        Ok(Ok(None)) => Err(PluginError::Handshake(
            "plugin exited before completing the handshake".to_string(),
        )),
        Ok(Err(e)) => Err(PluginError::Io(e)),
        Err(_) => Err(PluginError::Handshake(format!(
            "no handshake from plugin within {}s",
            HANDSHAKE_TIMEOUT.as_secs()
        ))),
    };

    let handshake = match handshake {
        Ok(handshake) => handshake,
        Err(e) => {
            if let Err(release) = process.release().await {
                tracing::warn!(plugin = stage_type, error = %release, "Failed to stop plugin");
            }
            return Err(e);
        }
    };

    tracing::info!(plugin = stage_type, protocol = %handshake.protocol, "Plugin connected");
    let conn = Connection::from_lines(lines, Box::new(stdin) as BoxedWriter, handshake.protocol);
    Ok((process, conn))
}

/// A stage implemented by a plugin
#[derive(Debug)]
pub struct PluginStage {
    stage_type: String,
    conn: Mutex<PluginConnection>,
    process: Mutex<Option<PluginProcess>>,
}

impl PluginStage {
    /// Launch the plugin executable at `path`
    pub async fn spawn(stage_type: &str, path: &Path) -> Result<Self> {
        let (process, conn) = launch(path, stage_type).await?;
        Ok(Self {
            stage_type: stage_type.to_string(),
            conn: Mutex::new(conn),
            process: Mutex::new(Some(process)),
        })
    }

    /// Talk to a plugin over an already established connection
    pub fn from_connection(stage_type: &str, conn: PluginConnection) -> Self {
        Self {
            stage_type: stage_type.to_string(),
            conn: Mutex::new(conn),
            process: Mutex::new(None),
        }
    }

    pub fn stage_type(&self) -> &str {
        &self.stage_type
    }

    async fn call<T: DeserializeOwned>(&self, request: Request) -> dodo_stage::Result<T> {
        let response = self.conn.lock().await.call(&request).await?;
        Ok(response.into_result()?)
    }
}

#[async_trait]
impl Stage for PluginStage {
    async fn initialize(&mut self, name: &str, config: &StageConfig) -> dodo_stage::Result<()> {
        self.call(Request::initialize(name, config)?).await
    }

    async fn create(&mut self) -> dodo_stage::Result<()> {
        self.call(Request::Create).await
    }

    async fn start(&mut self) -> dodo_stage::Result<()> {
        self.call(Request::Start).await
    }

    async fn stop(&mut self) -> dodo_stage::Result<()> {
        self.call(Request::Stop).await
    }

    async fn remove(&mut self, options: RemoveOptions) -> dodo_stage::Result<()> {
        self.call(Request::remove(options)).await
    }

    async fn exist(&self) -> dodo_stage::Result<bool> {
        self.call(Request::Exist).await
    }

    async fn available(&self) -> dodo_stage::Result<bool> {
        self.call(Request::Available).await
    }

    async fn ssh_options(&self) -> dodo_stage::Result<SshOptions> {
        self.call(Request::GetSshOptions).await
    }

    async fn docker_options(&self) -> dodo_stage::Result<DockerOptions> {
        self.call(Request::GetDockerOptions).await
    }

    async fn cleanup(&mut self) -> dodo_stage::Result<()> {
        if let Some(process) = self.process.get_mut().as_mut() {
            process.release().await?;
        }
        Ok(())
    }
}
