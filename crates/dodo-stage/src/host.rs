//! Host environment handed to stage constructors
//!
//! Running external programs, the storage root and the host identity are
//! values rather than globals, so tests can swap the runner for a script and
//! several stages can live in one process.

use async_trait::async_trait;
use dodo_config::Platform;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::Command;

/// Captured result of an external program
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

impl From<std::process::Output> for ToolOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// A running program whose standard input is fed by the caller
///
/// Drop `stdin` (or shut it down) before awaiting `exit`, otherwise programs
/// reading until EOF never terminate.
pub struct PipedChild {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub exit: BoxFuture<'static, io::Result<ToolOutput>>,
}

/// Runs external programs
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run to completion, optionally feeding `input` on stdin
    async fn run(&self, program: &Path, args: &[String], input: Option<&[u8]>)
    -> io::Result<ToolOutput>;

    /// Start a program with a writable stdin
    async fn spawn_piped(&self, program: &Path, args: &[String]) -> io::Result<PipedChild>;
}

/// Runs programs on the local machine with `tokio::process`
///
/// Children are killed when the awaiting future is dropped, so cancelling an
/// operation terminates whatever it started.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl ToolRunner for SystemRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        input: Option<&[u8]>,
    ) -> io::Result<ToolOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!("Running: {} {}", program.display(), args.join(" "));

        let mut child = cmd.spawn()?;

        if let Some(input) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input).await?;
                stdin.shutdown().await?;
            }
        }

        let output = child.wait_with_output().await?;
        Ok(output.into())
    }

    async fn spawn_piped(&self, program: &Path, args: &[String]) -> io::Result<PipedChild> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!("Spawning: {} {}", program.display(), args.join(" "));

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin was not captured"))?;

        // Collect output concurrently so a chatty child cannot block on a full pipe.
        // Dropping `exit` aborts the waiter, which drops and kills the child.
        let mut waiter = AbortOnDrop(tokio::spawn(async move { child.wait_with_output().await }));
        let exit = async move {
            let output = (&mut waiter.0).await.map_err(io::Error::other)??;
            Ok::<_, io::Error>(ToolOutput::from(output))
        }
        .boxed();

        Ok(PipedChild {
            stdin: Box::new(stdin),
            exit,
        })
    }
}

struct AbortOnDrop<T>(tokio::task::JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Explicit host environment
#[derive(Clone)]
pub struct HostEnv {
    /// Runs every external program (VBoxManage, ssh)
    pub runner: Arc<dyn ToolRunner>,
    /// Application directory (`~/.dodo`)
    pub app_dir: PathBuf,
    /// OS/architecture identity
    pub platform: Platform,
    /// Executable overrides by logical name (e.g. "VBoxManage")
    pub executables: HashMap<String, PathBuf>,
}

impl HostEnv {
    pub fn new(runner: Arc<dyn ToolRunner>, app_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            app_dir: app_dir.into(),
            platform: Platform::current(),
            executables: HashMap::new(),
        }
    }

    /// Host environment of the running process
    ///
    /// Honors `DODO_HOME` and `DODO_VBOXMANAGE`.
    pub fn from_process() -> dodo_config::Result<Self> {
        let mut env = Self::new(Arc::new(SystemRunner), dodo_config::app_dir()?);
        if let Ok(path) = std::env::var("DODO_VBOXMANAGE") {
            if !path.is_empty() {
                env.executables.insert("VBoxManage".to_string(), PathBuf::from(path));
            }
        }
        Ok(env)
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_executable(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.executables.insert(name.into(), path.into());
        self
    }

    /// Resolve an executable by logical name
    ///
    /// Falls back to the bare name, which the OS resolves through `PATH`.
    pub fn executable(&self, name: &str) -> PathBuf {
        if let Some(path) = self.executables.get(name) {
            return path.clone();
        }
        if self.platform.is_windows() {
            PathBuf::from(format!("{}.exe", name))
        } else {
            PathBuf::from(name)
        }
    }

    /// Storage directory of a stage
    pub fn stage_dir(&self, name: &str) -> dodo_config::Result<PathBuf> {
        dodo_config::stage_dir(&self.app_dir, name)
    }
}

impl std::fmt::Debug for HostEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEnv")
            .field("app_dir", &self.app_dir)
            .field("platform", &self.platform)
            .field("executables", &self.executables)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executable_resolution() {
        let env = HostEnv::new(Arc::new(SystemRunner), "/tmp/dodo")
            .with_platform(Platform::new("linux", "amd64"))
            .with_executable("VBoxManage", "/opt/vbox/VBoxManage");

        assert_eq!(env.executable("VBoxManage"), PathBuf::from("/opt/vbox/VBoxManage"));
        assert_eq!(env.executable("ssh"), PathBuf::from("ssh"));

        let windows = env.with_platform(Platform::new("windows", "amd64"));
        assert_eq!(windows.executable("ssh"), PathBuf::from("ssh.exe"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_feeds_stdin() {
        let output = SystemRunner
            .run(Path::new("cat"), &[], Some(b"hello"))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_piped_child() {
        let mut child = SystemRunner
            .spawn_piped(Path::new("wc"), &["-c".to_string()])
            .await
            .unwrap();
        child.stdin.write_all(&[0u8; 4096]).await.unwrap();
        child.stdin.shutdown().await.unwrap();
        drop(child.stdin);

        let output = child.exit.await.unwrap();
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "4096");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropping_piped_child_kills_it() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());

        let child = SystemRunner
            .spawn_piped(Path::new("sh"), &["-c".to_string(), script])
            .await
            .unwrap();

        let mut pid = String::new();
        for _ in 0..100 {
            pid = std::fs::read_to_string(&pid_file).unwrap_or_default();
            if pid.ends_with('\n') {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let proc_stat = PathBuf::from(format!("/proc/{}/stat", pid.trim()));
        assert!(proc_stat.exists());

        drop(child);

        // Gone, or a zombie waiting to be reaped
        let mut alive = true;
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let stat = std::fs::read_to_string(&proc_stat).unwrap_or_default();
            if stat.is_empty() || stat.contains(") Z") {
                alive = false;
                break;
            }
        }
        assert!(!alive, "child survived the dropped handle");
    }
}
