#![cfg(unix)]

use dodo_plugin::{PluginError, PluginStage, launch};
use dodo_stage::Stage;
use serial_test::serial;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

fn write_plugin(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("plugin-scripted_linux_amd64");
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[tokio::test]
#[serial]
async fn test_plugin_process_answers_and_is_released_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_plugin(
        dir.path(),
        r#"[ "$DODO_STAGE_PLUGIN" = "scripted" ] || exit 1
echo "plugin starting" >&2
echo "1|1|stdio|netrpc"
while read -r line; do
  echo '{"result":true}'
done
"#,
    );

    let mut stage = PluginStage::spawn("scripted", &path).await.unwrap();
    assert!(stage.exist().await.unwrap());
    assert!(stage.available().await.unwrap());

    stage.cleanup().await.unwrap();
    stage.cleanup().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_version_mismatch_fails_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_plugin(dir.path(), "echo \"2|1|stdio|netrpc\"\nsleep 30\n");

    let err = launch(&path, "scripted").await.unwrap_err();
    assert!(matches!(err, PluginError::Handshake(_)), "{:?}", err);
}

#[tokio::test]
#[serial]
async fn test_plugin_exiting_early_fails_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_plugin(dir.path(), "exit 0\n");

    let err = launch(&path, "scripted").await.unwrap_err();
    assert!(matches!(err, PluginError::Handshake(_)), "{:?}", err);
}

#[tokio::test]
#[serial]
async fn test_release_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_plugin(dir.path(), "echo \"1|1|stdio|mux\"\nsleep 30\n");

    let (mut process, conn) = launch(&path, "scripted").await.unwrap();
    assert_eq!(conn.protocol(), dodo_plugin::Protocol::Mux);
    assert!(!process.is_released());

    process.release().await.unwrap();
    assert!(process.is_released());
    process.release().await.unwrap();
}
