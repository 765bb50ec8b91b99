//! CLI for qvm launch scripts and QEMU/KVM virtual machines.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod script;
mod vm;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
const LOG_ENV: &str = "QVM_LOG";

#[derive(Parser)]
#[command(name = "qvm", version, about = "Launch scripts and QMP control for QEMU/KVM VMs")]
struct Cli {
    /// Log debug output, ignoring QVM_LOG.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    driver: DriverArgs,

    #[command(subcommand)]
    command: Command,
}

/// Options for the VM backend.
#[derive(clap::Args)]
pub(crate) struct DriverArgs {
    /// Disk image tool.
    #[arg(long, global = true, default_value = "qemu-img")]
    pub qemu_img: String,

    /// Hypervisor program that launch scripts exec.
    #[arg(long, global = true, default_value = qvm::DEFAULT_PROGRAM)]
    pub kvm: String,

    /// Seconds to wait for a VM's control socket.
    #[arg(long, global = true, default_value_t = 10)]
    pub socket_timeout: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Create, inspect, and edit launch scripts.
    Script {
        #[command(subcommand)]
        action: script::ScriptAction,
    },

    #[command(flatten)]
    Vm(vm::VmCommand),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for `script show`.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = cli.dispatch().await {
        eprintln!("qvm: {e:#}");
        std::process::exit(1);
    }
}

/// Installs a stderr subscriber filtered by `QVM_LOG`, or `debug` with `-v`.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("qvm=debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("qvm=warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Script { action } => action.run(&self.driver),
            Command::Vm(command) => command.run(&self.driver).await,
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "qvm", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_driver_flags_follow_subcommands() {
        let cli = Cli::try_parse_from([
            "qvm",
            "start",
            "vm.sh",
            "--kvm",
            "qemu-system-x86_64",
            "--socket-timeout",
            "30",
        ])
        .unwrap();
        assert_eq!(cli.driver.kvm, "qemu-system-x86_64");
        assert_eq!(cli.driver.socket_timeout, 30);
        assert_eq!(cli.driver.qemu_img, "qemu-img");
        assert!(matches!(cli.command, Command::Vm(vm::VmCommand::Start(_))));
    }
}
