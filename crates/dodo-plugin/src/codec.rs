//! NDJSON RPC over a pair of byte streams
//!
//! One JSON document per line. With [`Protocol::NetRpc`] a line is a bare
//! [`Request`] or [`Response`]; with [`Protocol::Mux`] it is wrapped in an
//! [`Envelope`] and responses are matched to requests by id.

use crate::error::{PluginError, Result};
use crate::handshake::Protocol;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dodo_stage::{RemoveOptions, StageConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

/// Calls a host makes on a plugin stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    Initialize {
        name: String,
        /// base64 of the JSON-encoded [`StageConfig`]
        config: String,
    },
    Create,
    Start,
    Stop,
    Remove {
        force: bool,
        volumes: bool,
    },
    Exist,
    Available,
    GetSshOptions,
    GetDockerOptions,
}

impl Request {
    pub fn initialize(name: &str, config: &StageConfig) -> Result<Self> {
        Ok(Request::Initialize {
            name: name.to_string(),
            config: STANDARD.encode(serde_json::to_vec(config)?),
        })
    }

    pub fn remove(options: RemoveOptions) -> Self {
        Request::Remove {
            force: options.force,
            volumes: options.volumes,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Request::Initialize { .. } => "Initialize",
            Request::Create => "Create",
            Request::Start => "Start",
            Request::Stop => "Stop",
            Request::Remove { .. } => "Remove",
            Request::Exist => "Exist",
            Request::Available => "Available",
            Request::GetSshOptions => "GetSshOptions",
            Request::GetDockerOptions => "GetDockerOptions",
        }
    }
}

/// Decode the config blob of an `Initialize` request
pub fn decode_config(blob: &str) -> Result<StageConfig> {
    let json = STANDARD.decode(blob)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Result of one call; errors travel as plain strings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }

    /// The result as `T`, or the remote error
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T> {
        if let Some(message) = self.error {
            return Err(PluginError::Remote(message));
        }
        Ok(serde_json::from_value(self.result.unwrap_or(Value::Null))?)
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: u64,
    pub body: T,
}

/// One end of an RPC connection
pub struct Connection<R, W> {
    lines: Lines<BufReader<R>>,
    writer: W,
    protocol: Protocol,
    next_id: u64,
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, protocol: Protocol) -> Self {
        Self::from_lines(BufReader::new(reader).lines(), writer, protocol)
    }

    /// Continue on a reader the handshake line was already taken from
    pub fn from_lines(lines: Lines<BufReader<R>>, writer: W, protocol: Protocol) -> Self {
        Self {
            lines,
            writer,
            protocol,
            next_id: 1,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn write_frame<T: Serialize>(&mut self, frame: &T) -> Result<()> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| PluginError::Protocol(format!("invalid frame '{}': {}", line, e)));
        }
    }

    /// Send a request and wait for its response (host side)
    pub async fn call(&mut self, request: &Request) -> Result<Response> {
        tracing::trace!(method = request.method(), protocol = %self.protocol, "Plugin call");

        match self.protocol {
            Protocol::NetRpc => {
                self.write_frame(request).await?;
                self.read_frame::<Response>().await?.ok_or(PluginError::Closed)
            }
            Protocol::Mux => {
                let id = self.next_id;
                self.next_id += 1;
                self.write_frame(&Envelope { id, body: request }).await?;

                loop {
                    let envelope = self
                        .read_frame::<Envelope<Response>>()
                        .await?
                        .ok_or(PluginError::Closed)?;
                    if envelope.id == id {
                        return Ok(envelope.body);
                    }
                    tracing::warn!(id = envelope.id, expected = id, "Dropping response to unknown request");
                }
            }
        }
    }

    /// Next request, with its id under `mux` (plugin side); `None` at EOF
    pub async fn recv(&mut self) -> Result<Option<(Option<u64>, Request)>> {
        match self.protocol {
            Protocol::NetRpc => Ok(self.read_frame::<Request>().await?.map(|r| (None, r))),
            Protocol::Mux => Ok(self
                .read_frame::<Envelope<Request>>()
                .await?
                .map(|envelope| (Some(envelope.id), envelope.body))),
        }
    }

    /// Answer the request `id` (plugin side)
    pub async fn reply(&mut self, id: Option<u64>, response: &Response) -> Result<()> {
        match (self.protocol, id) {
            (Protocol::Mux, Some(id)) => self.write_frame(&Envelope { id, body: response }).await,
            (Protocol::Mux, None) => Err(PluginError::Protocol(
                "mux reply without a request id".to_string(),
            )),
            (Protocol::NetRpc, _) => self.write_frame(response).await,
        }
    }
}

impl<R, W> std::fmt::Debug for Connection<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("protocol", &self.protocol)
            .field("next_id", &self.next_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dodo_stage::{DockerOptions, SshOptions};
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        assert_eq!(
            serde_json::to_value(Request::Create).unwrap(),
            json!({"method": "Create"})
        );
        assert_eq!(
            serde_json::to_value(Request::remove(RemoveOptions {
                force: true,
                volumes: false
            }))
            .unwrap(),
            json!({"method": "Remove", "params": {"force": true, "volumes": false}})
        );
        assert_eq!(
            serde_json::from_str::<Request>(r#"{"method":"Exist"}"#).unwrap(),
            Request::Exist
        );
    }

    #[test]
    fn test_option_payload_field_names() {
        let docker = DockerOptions {
            api_version: "1.40".to_string(),
            host: "tcp://192.168.99.100:2376".to_string(),
            ca_file: "/s/ca.pem".to_string(),
            cert_file: "/s/client.pem".to_string(),
            key_file: "/s/client-key.pem".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&docker).unwrap(),
            json!({
                "version": "1.40",
                "host": "tcp://192.168.99.100:2376",
                "caFile": "/s/ca.pem",
                "certFile": "/s/client.pem",
                "keyFile": "/s/client-key.pem"
            })
        );

        let ssh: SshOptions = Response::ok(json!({
            "hostname": "127.0.0.1",
            "port": 50022,
            "username": "docker",
            "privateKeyFile": "/s/id_rsa"
        }))
        .into_result()
        .unwrap();
        assert_eq!(ssh.port, 50022);
        assert_eq!(ssh.private_key_file, "/s/id_rsa");
    }

    #[test]
    fn test_config_blob() {
        let config = StageConfig::new("hyperv").with_option("memory", "2048");
        let Request::Initialize { name, config: blob } = Request::initialize("dev", &config).unwrap()
        else {
            panic!("expected Initialize");
        };
        assert_eq!(name, "dev");
        assert_eq!(decode_config(&blob).unwrap(), config);
        assert!(decode_config("not base64!").is_err());
    }

    #[test]
    fn test_response_into_result() {
        assert!(Response::ok(json!(true)).into_result::<bool>().unwrap());
        let err = Response::error("boom").into_result::<bool>().unwrap_err();
        assert!(matches!(err, PluginError::Remote(ref m) if m == "boom"));
        Response::default().into_result::<()>().unwrap();
    }

    #[tokio::test]
    async fn test_mux_skips_foreign_ids() {
        let (host_side, plugin_side) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host_side);
        let (plugin_read, mut plugin_write) = tokio::io::split(plugin_side);

        let plugin = tokio::spawn(async move {
            let mut lines = BufReader::new(plugin_read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let envelope: Envelope<Request> = serde_json::from_str(&line).unwrap();
            assert_eq!(envelope.body, Request::Available);

            let stray = Envelope { id: 99, body: Response::ok(json!(false)) };
            let answer = Envelope { id: envelope.id, body: Response::ok(json!(true)) };
            for frame in [stray, answer] {
                let mut out = serde_json::to_vec(&frame).unwrap();
                out.push(b'\n');
                plugin_write.write_all(&out).await.unwrap();
            }
        });

        let mut conn = Connection::new(host_read, host_write, Protocol::Mux);
        let response = conn.call(&Request::Available).await.unwrap();
        assert!(response.into_result::<bool>().unwrap());
        plugin.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_on_closed_connection() {
        let (host_side, plugin_side) = tokio::io::duplex(1024);
        drop(plugin_side);
        let (read, write) = tokio::io::split(host_side);

        let mut conn = Connection::new(read, write, Protocol::NetRpc);
        assert!(conn.call(&Request::Exist).await.is_err());
    }
}
