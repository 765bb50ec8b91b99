//! Driver lifecycle against a launch script and a simulated QMP server.

#![cfg(unix)]
#![allow(clippy::unwrap_used, missing_docs)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use qvm::{Driver, KvmDriver};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::Mutex;

/// Held while writing and running scripts. A child forked by one test can
/// inherit another test's open script fd, and that script then fails to
/// exec with `ETXTBSY`.
static SCRIPTS: Mutex<()> = Mutex::const_new(());

const GREETING: &str = r#"{"QMP": {"version": {"qemu": {"micro": 1, "minor": 0, "major": 9}, "package": ""}, "capabilities": []}}"#;

#[tokio::test]
async fn start_query_stop() {
    let _scripts = SCRIPTS.lock().await;
    let dir = tempfile::tempdir().unwrap();

    // The script stands in for a daemonizing hypervisor: it exits at once and
    // the VM's control socket is served by this test.
    let script = write_script(dir.path(), "vm.sh", "exit 0");

    let listener = UnixListener::bind(qvm::control_socket_path(&script)).unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(format!("{GREETING}\n").as_bytes()).await.unwrap();
        let replies = [
            ("qmp_capabilities", "{\"return\": {}}"),
            ("cont", "{\"return\": {}}"),
            ("query-status", "{\"return\": {\"running\": true, \"singlestep\": false, \"status\": \"running\"}}"),
            ("quit", "{\"return\": {}}"),
        ];
        for (command, reply) in replies {
            let line = lines.next_line().await.unwrap().unwrap();
            let request: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(request["execute"], command);
            writer.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
        }
        assert!(lines.next_line().await.unwrap().is_none());
    });

    let driver = KvmDriver::new()
        .socket_timeout(Duration::from_secs(5))
        .poll_interval(Duration::from_millis(20))
        .command_timeout(Duration::from_secs(5));

    let control = driver.start(&script).await.unwrap();
    assert_eq!(control.greeting().version.qemu.major, 9);
    assert!(driver.is_running(&control).await.unwrap());

    driver.stop(&control).await.unwrap();
    assert!(!control.is_active());
    assert!(!driver.is_running(&control).await.unwrap());

    server.await.unwrap();
}

#[tokio::test]
async fn start_does_not_wait_for_script_children() {
    let _scripts = SCRIPTS.lock().await;
    let dir = tempfile::tempdir().unwrap();

    // The background child inherits the script's stdio and outlives it.
    let script = write_script(dir.path(), "vm.sh", "sleep 5 &\nexit 0");

    let started = Instant::now();
    let err = KvmDriver::new()
        .socket_timeout(Duration::from_millis(300))
        .poll_interval(Duration::from_millis(20))
        .start(&script)
        .await
        .unwrap_err();
    assert!(matches!(err, qvm::Error::Timeout { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
}

#[tokio::test]
async fn start_reports_failing_script() {
    let _scripts = SCRIPTS.lock().await;
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "vm.sh", "exit 3");

    let err = KvmDriver::new().start(&script).await.unwrap_err();
    assert!(matches!(err, qvm::Error::Process { ref status, .. } if status.code() == Some(3)), "{err}");
}

/// Writes an executable shell script named `name` into `dir`.
fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}
