//! Launch scripts and QMP control for QEMU/KVM virtual machines.
//!
//! `qvm` covers the two pieces needed to drive a VM from a build tool:
//!
//! - [`Settings`] parses and writes the shell launch script that starts the
//!   hypervisor, one command-line flag per line.
//! - [`ControlChannel`] speaks the QEMU Machine Protocol (QMP) over the VM's
//!   control socket to query and change the running VM.
//!
//! [`KvmDriver`] combines both behind the [`Driver`] interface.
//!
//! # Quick start
//!
//! ```no_run
//! use qvm::{Driver, KvmDriver, ScriptBuilder};
//!
//! # async fn run() -> qvm::Result<()> {
//! let script = std::path::Path::new("/vms/web/web.sh");
//! ScriptBuilder::new("web")
//!     .memory_mib(1024)
//!     .build()
//!     .write_script(script)?;
//!
//! let driver = KvmDriver::new();
//! driver.create_disk("/vms/web/web.img".as_ref(), "10G").await?;
//! let control = driver.start(script).await?;
//! assert!(driver.is_running(&control).await?);
//! driver.stop(&control).await?;
//! # Ok(())
//! # }
//! ```

#[cfg(unix)]
mod control;
#[cfg(unix)]
mod driver;
mod error;
mod settings;

#[cfg(unix)]
pub use control::{ControlChannel, QueryStatus};
#[cfg(unix)]
pub use driver::{Driver, KvmDriver};
pub use error::{Error, Result};
pub use qvm_proto::QmpInfo;
pub use settings::{CONTROL_SOCKET, DEFAULT_PROGRAM, ScriptBuilder, Settings, control_socket_path};
