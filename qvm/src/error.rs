//! Error types for qvm operations.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

/// Alias for `Result<T, qvm::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by qvm operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The control socket could not be dialed.
    #[error("connect {}: {source}", path.display())]
    Connection {
        /// Socket path that was dialed.
        path: PathBuf,
        /// Underlying socket error.
        source: std::io::Error,
    },

    /// The peer violated the handshake sequence or sent an unusable message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The control channel is closed; the VM process is gone or unreachable.
    #[error("'{}' does not appear to be connected to a running VM", path.display())]
    NotRunning {
        /// Control socket path of the closed channel.
        path: PathBuf,
    },

    /// Reading a launch script failed.
    #[error("reading launch script: {0}")]
    Parse(#[source] std::io::Error),

    /// A flag line in a launch script is malformed (strict parsing only).
    #[error("launch script line {line}: {reason}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// What is wrong with the line.
        reason: String,
    },

    /// An operation did not finish before its deadline.
    #[error("{op} timed out after {after:?}")]
    Timeout {
        /// The operation that timed out.
        op: String,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// The VM rejected a command.
    #[error("command failed: {class}: {desc}")]
    Command {
        /// QMP error class.
        class: String,
        /// Human-readable description from the VM.
        desc: String,
    },

    /// An external program exited unsuccessfully.
    #[error("{program} exited with {status}: {stderr}")]
    Process {
        /// Program that was run.
        program: String,
        /// Its exit status.
        status: ExitStatus,
        /// Trimmed standard error output.
        stderr: String,
    },

    /// The host is missing something the driver needs.
    #[error("verification failed: {0}")]
    Verify(String),

    /// JSON (de)serialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// An I/O error from socket, process, or file operations.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` if this error means the VM process is no longer
    /// reachable, which callers usually treat as an expected outcome.
    pub const fn is_not_running(&self) -> bool {
        matches!(self, Self::NotRunning { .. })
    }
}

impl From<qvm_proto::QmpError> for Error {
    fn from(e: qvm_proto::QmpError) -> Self {
        Self::Command {
            class: e.class,
            desc: e.desc,
        }
    }
}
