//! Plugin side: serving a [`Stage`] to the host
//!
//! A plugin executable is a thin `main` around [`serve`]:
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut stage = MyStage::default();
//!     dodo_plugin::serve("hyperv", &mut stage).await?;
//!     Ok(())
//! }
//! ```
//!
//! Stdout carries the protocol; log to stderr, which the host forwards.

use crate::codec::{Connection, Request, Response, decode_config};
use crate::error::{PluginError, Result};
use crate::handshake::{COOKIE_KEY, Handshake, PROTOCOLS_ENV, Protocol, negotiate};
use dodo_stage::{RemoveOptions, Stage};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Serve `stage` over stdin/stdout until the host disconnects
pub async fn serve(stage_type: &str, stage: &mut dyn Stage) -> Result<()> {
    let cookie = std::env::var(COOKIE_KEY).ok();
    if cookie.as_deref() != Some(stage_type) {
        return Err(PluginError::Handshake(format!(
            "this program is the dodo plugin for stage type '{}' and is launched by dodo, not directly",
            stage_type
        )));
    }

    let protocol = negotiate(std::env::var(PROTOCOLS_ENV).ok().as_deref())?;

    let mut stdout = tokio::io::stdout();
    let line = format!("{}\n", Handshake::new(protocol).to_line());
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await?;

    tracing::debug!(stage_type, %protocol, "Serving stage");
    serve_io(tokio::io::stdin(), stdout, protocol, stage).await
}

/// Serve `stage` on an established byte stream pair
///
/// Requests are handled one at a time. The stage is cleaned up when the host
/// closes the stream.
pub async fn serve_io<R, W>(reader: R, writer: W, protocol: Protocol, stage: &mut dyn Stage) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut conn = Connection::new(reader, writer, protocol);

    while let Some((id, request)) = conn.recv().await? {
        let method = request.method();
        let response = match handle(stage, request).await {
            Ok(result) => Response::ok(result),
            Err(e) => {
                tracing::debug!(method, error = %e, "Request failed");
                Response::error(e.to_string())
            }
        };
        conn.reply(id, &response).await?;
    }

    tracing::debug!("Host disconnected");
    stage.cleanup().await?;
    Ok(())
}

async fn handle(stage: &mut dyn Stage, request: Request) -> Result<Value> {
    tracing::debug!(method = request.method(), "Handling request");

    let result = match request {
        Request::Initialize { name, config } => {
            let config = decode_config(&config)?;
            stage.initialize(&name, &config).await?;
            Value::Null
        }
        Request::Create => {
            stage.create().await?;
            Value::Null
        }
        Request::Start => {
            stage.start().await?;
            Value::Null
        }
        Request::Stop => {
            stage.stop().await?;
            Value::Null
        }
        Request::Remove { force, volumes } => {
            stage.remove(RemoveOptions { force, volumes }).await?;
            Value::Null
        }
        Request::Exist => Value::Bool(stage.exist().await?),
        Request::Available => Value::Bool(stage.available().await?),
        Request::GetSshOptions => serde_json::to_value(stage.ssh_options().await?)?,
        Request::GetDockerOptions => serde_json::to_value(stage.docker_options().await?)?,
    };
    Ok(result)
}
