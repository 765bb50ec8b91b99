//! VM lifecycle commands: start, status, stop, exec, disk, verify.

use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;

use crate::DriverArgs;

/// Commands that act on a VM or the host, at the top level of `qvm`.
#[derive(Subcommand)]
pub enum VmCommand {
    /// Start the VM described by a launch script.
    Start(TargetArgs),

    /// Report whether a VM is running.
    Status(TargetArgs),

    /// Ask a running VM to quit.
    Stop(TargetArgs),

    /// Run a QMP command against a running VM and print its result.
    Exec(ExecArgs),

    /// Manage disk images.
    Disk {
        #[command(subcommand)]
        action: DiskAction,
    },

    /// Check that the host has the programs the backend needs.
    Verify,
}

/// The launch script a command refers to.
#[derive(clap::Args)]
pub struct TargetArgs {
    /// Launch script path.
    pub script: PathBuf,
}

/// Arguments for `qvm exec`.
#[derive(clap::Args)]
pub struct ExecArgs {
    /// Launch script path.
    pub script: PathBuf,

    /// QMP command name, e.g. `query-status`.
    pub command: String,

    /// Command arguments as a JSON object.
    #[arg(long)]
    pub args: Option<String>,

    /// Seconds to wait for the reply.
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Subcommands for `qvm disk`.
#[derive(Subcommand)]
pub enum DiskAction {
    /// Create a qcow2 disk image.
    Create {
        /// Image path.
        path: PathBuf,
        /// Image size, e.g. `10G`.
        size: String,
    },
}

#[cfg(unix)]
mod imp {
    use std::path::Path;
    use std::time::Duration;

    use anyhow::{Context, Result};
    use qvm::{ControlChannel, Driver, KvmDriver};
    use serde_json::Value;

    use super::{DiskAction, ExecArgs, VmCommand};
    use crate::DriverArgs;

    impl DriverArgs {
        /// Builds the backend these options describe.
        pub fn driver(&self) -> KvmDriver {
            KvmDriver::new()
                .qemu_img(&self.qemu_img)
                .kvm(&self.kvm)
                .socket_timeout(self.timeout())
        }

        pub const fn timeout(&self) -> Duration {
            Duration::from_secs(self.socket_timeout)
        }
    }

    pub async fn run(command: VmCommand, opts: &DriverArgs) -> Result<()> {
        let driver = opts.driver();
        match command {
            VmCommand::Start(args) => start(&driver, &args.script).await,
            VmCommand::Status(args) => status(&driver, &args.script, opts.timeout()).await,
            VmCommand::Stop(args) => stop(&driver, &args.script, opts.timeout()).await,
            VmCommand::Exec(args) => exec(args, opts.timeout()).await,
            VmCommand::Disk {
                action: DiskAction::Create { path, size },
            } => {
                driver
                    .create_disk(&path, &size)
                    .await
                    .with_context(|| format!("creating {}", path.display()))?;
                println!("{}", path.display());
                Ok(())
            }
            VmCommand::Verify => {
                driver.verify()?;
                println!("ok");
                Ok(())
            }
        }
    }

    async fn start(driver: &impl Driver, script: &Path) -> Result<()> {
        let control = driver
            .start(script)
            .await
            .with_context(|| format!("starting {}", script.display()))?;
        println!(
            "{} started (QEMU {})",
            script.display(),
            control.greeting().version.qemu
        );
        control.close().await;
        Ok(())
    }

    async fn status(driver: &impl Driver, script: &Path, timeout: Duration) -> Result<()> {
        let socket = qvm::control_socket_path(script);
        let running = match ControlChannel::connect_timeout(&socket, timeout).await {
            Ok(control) => {
                let running = driver.is_running(&control).await?;
                control.close().await;
                running
            }
            // No socket, or nobody listening on it.
            Err(qvm::Error::Connection { source, .. }) => {
                tracing::debug!(path = %socket.display(), error = %source, "control socket unreachable");
                false
            }
            Err(e) => return Err(e.into()),
        };
        println!("{}", if running { "running" } else { "not running" });
        Ok(())
    }

    async fn stop(driver: &impl Driver, script: &Path, timeout: Duration) -> Result<()> {
        let control = attach(script, timeout).await?;
        driver.stop(&control).await?;
        println!("{}", script.display());
        Ok(())
    }

    async fn exec(args: ExecArgs, timeout: Duration) -> Result<()> {
        let arguments: Option<Value> = args
            .args
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("parsing --args")?;

        let control = attach(&args.script, timeout).await?;
        let result = match args.timeout {
            Some(secs) => {
                control
                    .execute_timeout(&args.command, arguments, Duration::from_secs(secs))
                    .await
            }
            None => control.execute(&args.command, arguments).await,
        };
        control.close().await;

        let value = result.with_context(|| format!("executing '{}'", args.command))?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        Ok(())
    }

    /// Connects to the control socket of the VM started from `script`.
    async fn attach(script: &Path, timeout: Duration) -> Result<ControlChannel> {
        let socket = qvm::control_socket_path(script);
        ControlChannel::connect_timeout(&socket, timeout)
            .await
            .with_context(|| format!("connecting to {}", socket.display()))
    }
}

impl VmCommand {
    #[cfg(unix)]
    pub async fn run(self, driver: &DriverArgs) -> Result<()> {
        imp::run(self, driver).await
    }

    #[cfg(not(unix))]
    #[allow(clippy::unused_async)]
    pub async fn run(self, _driver: &DriverArgs) -> Result<()> {
        anyhow::bail!("VM control requires a Unix control socket")
    }
}
