//! VM lifecycle: disk creation, start, stop, and status.
//!
//! [`Driver`] is the capability interface the rest of a build pipeline
//! programs against. [`KvmDriver`] implements it by running `qemu-img` and
//! the launch script directly and talking QMP over the script's control
//! socket.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tokio::time::Instant;

use crate::control::{ControlChannel, QueryStatus};
use crate::error::{Error, Result};
use crate::settings::{self, DEFAULT_PROGRAM};

/// Operations every VM backend provides.
pub trait Driver {
    /// Creates a disk image at `path` with the given size (e.g. `"10G"`).
    fn create_disk(&self, path: &Path, size: &str) -> impl Future<Output = Result<()>> + Send;

    /// Starts the VM described by the launch script at `script` and returns
    /// a control channel to it. The VM is running when this returns.
    fn start(&self, script: &Path) -> impl Future<Output = Result<ControlChannel>> + Send;

    /// Asks the VM to quit and closes the channel.
    fn stop(&self, control: &ControlChannel) -> impl Future<Output = Result<()>> + Send;

    /// Reports whether the VM is running. A VM whose process is gone is
    /// reported as not running rather than as an error.
    fn is_running(&self, control: &ControlChannel) -> impl Future<Output = Result<bool>> + Send;

    /// Checks that everything the driver needs is present on the host.
    fn verify(&self) -> Result<()>;
}

/// Driver that runs QEMU/KVM directly from a launch script.
///
/// Defaults: `qemu-img` and [`DEFAULT_PROGRAM`] looked up on `PATH`, 10 s to
/// wait for the control socket, polled every 100 ms, no command timeout.
#[derive(Debug, Clone)]
#[must_use]
pub struct KvmDriver {
    /// Disk image tool.
    qemu_img: String,
    /// Hypervisor program the launch scripts exec.
    kvm: String,
    /// How long to wait for the control socket after starting.
    socket_timeout: Duration,
    /// Delay between connection attempts.
    poll_interval: Duration,
    /// Deadline applied to each QMP command, if any.
    command_timeout: Option<Duration>,
}

impl Default for KvmDriver {
    fn default() -> Self {
        Self {
            qemu_img: "qemu-img".to_owned(),
            kvm: DEFAULT_PROGRAM.to_owned(),
            socket_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            command_timeout: None,
        }
    }
}

impl KvmDriver {
    /// Creates a driver with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the disk image tool.
    pub fn qemu_img(mut self, program: impl Into<String>) -> Self {
        self.qemu_img = program.into();
        self
    }

    /// Sets the hypervisor program checked by [`Driver::verify`].
    pub fn kvm(mut self, program: impl Into<String>) -> Self {
        self.kvm = program.into();
        self
    }

    /// Sets how long [`Driver::start`] waits for the control socket.
    pub const fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// Sets the delay between control socket connection attempts.
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Bounds every QMP command issued by the driver.
    pub const fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Runs `command` on `control`, honouring the command timeout.
    async fn execute(&self, control: &ControlChannel, command: &str) -> Result<Value> {
        match self.command_timeout {
            Some(timeout) => control.execute_timeout(command, None, timeout).await,
            None => control.execute(command, None).await,
        }
    }

    /// Connects to `socket`, retrying until the VM creates it.
    async fn attach(&self, socket: &Path) -> Result<ControlChannel> {
        let deadline = Instant::now() + self.socket_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match ControlChannel::connect_timeout(socket, remaining).await {
                Err(Error::Connection { source, .. }) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout {
                            op: format!("waiting for control socket {}", socket.display()),
                            after: self.socket_timeout,
                        });
                    }
                    tracing::debug!(path = %socket.display(), error = %source, "control socket not ready");
                    tokio::time::sleep(self.poll_interval).await;
                }
                other => return other,
            }
        }
    }
}

impl Driver for KvmDriver {
    async fn create_disk(&self, path: &Path, size: &str) -> Result<()> {
        let mut cmd = Command::new(&self.qemu_img);
        cmd.args(["create", "-f", "qcow2"]).arg(path).arg(size);
        run_and_log(&mut cmd, &self.qemu_img).await?;
        Ok(())
    }

    async fn start(&self, script: &Path) -> Result<ControlChannel> {
        // A bare file name would be looked up on PATH.
        let program = if script.components().count() == 1 {
            Path::new(".").join(script)
        } else {
            script.to_path_buf()
        };
        run_detached(&program).await?;

        let socket = settings::control_socket_path(&program);
        let control = self.attach(&socket).await?;
        self.execute(&control, "cont").await?;
        tracing::info!(script = %script.display(), "VM started");
        Ok(control)
    }

    async fn stop(&self, control: &ControlChannel) -> Result<()> {
        match self.execute(control, "quit").await {
            Ok(_) => {}
            // QEMU may hang up before acknowledging.
            Err(e) if e.is_not_running() => {
                tracing::debug!(path = %control.path().display(), "VM closed the control socket on quit");
            }
            Err(e) => return Err(e),
        }
        control.close().await;
        Ok(())
    }

    async fn is_running(&self, control: &ControlChannel) -> Result<bool> {
        match self.execute(control, "query-status").await {
            Ok(value) => {
                let status: QueryStatus = serde_json::from_value(value)?;
                tracing::debug!(status = %status.status, running = status.running, "VM status");
                Ok(status.running)
            }
            Err(e) if e.is_not_running() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn verify(&self) -> Result<()> {
        for program in [&self.qemu_img, &self.kvm] {
            if find_program(program).is_none() {
                return Err(Error::Verify(format!("'{program}' not found")));
            }
        }
        Ok(())
    }
}

/// Runs `cmd` to completion, logging its output. Returns stdout.
async fn run_and_log(cmd: &mut Command, program: &str) -> Result<String> {
    tracing::info!(command = ?cmd.as_std(), "executing");
    let output = cmd.output().await?;

    let stdout = String::from_utf8_lossy(&output.stdout).replace("\r\n", "\n");
    let stderr = String::from_utf8_lossy(&output.stderr).replace("\r\n", "\n");
    tracing::debug!(stdout = %stdout.trim(), stderr = %stderr.trim(), "{program} finished");

    if !output.status.success() {
        return Err(Error::Process {
            program: program.to_owned(),
            status: output.status,
            stderr: stderr.trim().to_owned(),
        });
    }
    Ok(stdout)
}

/// Runs a launch script with stdio on `/dev/null`.
///
/// The script daemonizes the VM; a daemon that kept inherited pipes open
/// would otherwise block until the VM exits.
async fn run_detached(script: &Path) -> Result<()> {
    tracing::info!(script = %script.display(), "executing");
    let status = Command::new(script)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;

    if !status.success() {
        return Err(Error::Process {
            program: script.display().to_string(),
            status,
            stderr: String::new(),
        });
    }
    Ok(())
}

/// Resolves `program` to an existing file, searching `PATH` for bare names.
fn find_program(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    let dirs = std::env::var_os("PATH")?;
    std::env::split_paths(&dirs)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_disk_reports_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let disk = dir.path().join("disk.qcow2");

        KvmDriver::new()
            .qemu_img("true")
            .create_disk(&disk, "1G")
            .await
            .unwrap();

        let err = KvmDriver::new()
            .qemu_img("false")
            .create_disk(&disk, "1G")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Process { ref program, .. } if program == "false"), "{err}");
    }

    #[tokio::test]
    async fn create_disk_missing_tool_is_io_error() {
        let err = KvmDriver::new()
            .qemu_img("/nonexistent/qemu-img")
            .create_disk(Path::new("disk.qcow2"), "1G")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{err}");
    }

    #[test]
    fn verify_checks_programs() {
        KvmDriver::new().qemu_img("sh").kvm("sh").verify().unwrap();

        let err = KvmDriver::new()
            .qemu_img("sh")
            .kvm("qvm-no-such-hypervisor")
            .verify()
            .unwrap_err();
        assert!(matches!(err, Error::Verify(_)), "{err}");

        let err = KvmDriver::new()
            .qemu_img("/nonexistent/qemu-img")
            .kvm("sh")
            .verify()
            .unwrap_err();
        assert!(matches!(err, Error::Verify(_)), "{err}");
    }

    #[test]
    fn find_program_handles_paths_and_names() {
        assert!(find_program("sh").is_some());
        assert!(find_program("/bin/sh").is_some() || find_program("/usr/bin/sh").is_some());
        assert!(find_program("./qvm-definitely-missing").is_none());
    }

    #[tokio::test]
    async fn start_fails_when_script_fails() {
        let err = KvmDriver::new()
            .start(Path::new("/nonexistent/dir/vm.sh"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{err}");
    }

    #[tokio::test]
    async fn start_times_out_without_control_socket() {
        // `true` exits cleanly but never creates `control` next to itself.
        let program = find_program("true").unwrap();
        let err = KvmDriver::new()
            .socket_timeout(Duration::from_millis(200))
            .poll_interval(Duration::from_millis(20))
            .start(&program)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err}");
    }
}
