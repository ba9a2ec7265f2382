use async_trait::async_trait;
use dodo_plugin::client::{BoxedReader, BoxedWriter};
use dodo_plugin::{Connection, PluginStage, Protocol, serve_io};
use dodo_stage::{DockerOptions, RemoveOptions, SshOptions, Stage, StageConfig, StageError};
use std::sync::{Arc, Mutex};

/// Stage that records every call it receives
#[derive(Debug, Default, Clone)]
struct RecordingStage {
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingStage {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl Stage for RecordingStage {
    async fn initialize(&mut self, name: &str, config: &StageConfig) -> dodo_stage::Result<()> {
        self.record(format!(
            "initialize {} {} memory={}",
            name,
            config.stage_type,
            config.option("memory").unwrap_or("-")
        ));
        Ok(())
    }

    async fn create(&mut self) -> dodo_stage::Result<()> {
        self.record("create");
        Ok(())
    }

    async fn start(&mut self) -> dodo_stage::Result<()> {
        self.record("start");
        Ok(())
    }

    async fn stop(&mut self) -> dodo_stage::Result<()> {
        self.record("stop");
        Err(StageError::Locked("VM is busy".to_string()))
    }

    async fn remove(&mut self, options: RemoveOptions) -> dodo_stage::Result<()> {
        self.record(format!("remove force={} volumes={}", options.force, options.volumes));
        Ok(())
    }

    async fn exist(&self) -> dodo_stage::Result<bool> {
        self.record("exist");
        Ok(true)
    }

    async fn available(&self) -> dodo_stage::Result<bool> {
        self.record("available");
        Ok(false)
    }

    async fn ssh_options(&self) -> dodo_stage::Result<SshOptions> {
        Ok(SshOptions {
            hostname: "10.0.0.5".to_string(),
            port: 2222,
            username: "core".to_string(),
            private_key_file: "/keys/id_rsa".to_string(),
        })
    }

    async fn docker_options(&self) -> dodo_stage::Result<DockerOptions> {
        Ok(DockerOptions {
            api_version: "1.40".to_string(),
            host: "tcp://10.0.0.5:2376".to_string(),
            ..Default::default()
        })
    }

    async fn cleanup(&mut self) -> dodo_stage::Result<()> {
        self.record("cleanup");
        Ok(())
    }
}

async fn run_session(protocol: Protocol) -> Vec<String> {
    let (host_side, plugin_side) = tokio::io::duplex(8192);
    let (plugin_read, plugin_write) = tokio::io::split(plugin_side);

    let plugin = RecordingStage::default();
    let calls = plugin.calls.clone();
    let server = tokio::spawn(async move {
        let mut stage = plugin;
        serve_io(plugin_read, plugin_write, protocol, &mut stage).await
    });

    let (host_read, host_write) = tokio::io::split(host_side);
    let conn = Connection::new(
        Box::new(host_read) as BoxedReader,
        Box::new(host_write) as BoxedWriter,
        protocol,
    );
    let mut stage = PluginStage::from_connection("recording", conn);

    let config = StageConfig::new("recording").with_option("memory", "2048");
    stage.initialize("dev", &config).await.unwrap();
    stage.create().await.unwrap();
    assert!(stage.exist().await.unwrap());
    assert!(!stage.available().await.unwrap());

    let ssh = stage.ssh_options().await.unwrap();
    assert_eq!(ssh.port, 2222);
    assert_eq!(ssh.username, "core");

    let docker = stage.docker_options().await.unwrap();
    assert_eq!(docker.host, "tcp://10.0.0.5:2376");
    assert!(!docker.uses_tls());

    let err = stage.stop().await.unwrap_err();
    assert!(matches!(err, StageError::Remote(_)));
    assert_eq!(err.to_string(), "stage is locked: VM is busy");

    stage.start().await.unwrap();
    stage
        .remove(RemoveOptions {
            force: true,
            volumes: true,
        })
        .await
        .unwrap();

    // Closing the host end ends the session
    drop(stage);
    server.await.unwrap().unwrap();

    calls.lock().unwrap().clone()
}

fn expected_calls() -> Vec<String> {
    [
        "initialize dev recording memory=2048",
        "create",
        "exist",
        "available",
        "stop",
        "start",
        "remove force=true volumes=true",
        "cleanup",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[tokio::test]
async fn test_netrpc_session() {
    assert_eq!(run_session(Protocol::NetRpc).await, expected_calls());
}

#[tokio::test]
async fn test_mux_session() {
    assert_eq!(run_session(Protocol::Mux).await, expected_calls());
}
