//! QMP control channel to a running VM.
//!
//! A [`ControlChannel`] owns one Unix socket connection. A background task
//! reads from it, reassembles newline-delimited messages and classifies
//! each one: the greeting completes the handshake, events are logged and
//! dropped, and command returns are handed to the caller of
//! [`ControlChannel::execute`].
//!
//! Only one command is ever in flight: replies carry no request id, so the
//! next return the server sends belongs to the command just written.
//! `execute` holds a lock for its whole send/wait cycle to guarantee this.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use qvm_proto::{CAPABILITIES_COMMAND, Command, LineFramer, Message, QmpInfo, Reply};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 8192;

/// Return value of `query-status`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[non_exhaustive]
pub struct QueryStatus {
    /// Whether guest CPUs are executing.
    pub running: bool,
    /// Whether single-step mode is on.
    #[serde(default)]
    pub singlestep: bool,
    /// Run state name, e.g. `running`, `paused`, `shutdown`.
    #[serde(default)]
    pub status: String,
}

/// Outcome of the handshake as seen by the receive task.
type GreetingResult = std::result::Result<QmpInfo, String>;

/// State shared between the channel and its receive task.
#[derive(Debug)]
struct Shared {
    /// Control socket path, for errors and logs.
    path: PathBuf,
    /// Cleared exactly once, when the channel closes.
    active: AtomicBool,
    /// Flipped to `true` on close; wakes the receive task.
    closed: watch::Sender<bool>,
}

impl Shared {
    /// Marks the channel closed and signals the receive task.
    fn shut(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            tracing::debug!(path = %self.path.display(), "control channel closed");
        }
        self.closed.send_replace(true);
    }

    /// The error returned by commands on a closed channel.
    fn not_running(&self) -> Error {
        Error::NotRunning {
            path: self.path.clone(),
        }
    }
}

/// The caller's side of the connection, guarded by the execute lock.
#[derive(Debug)]
struct Io {
    /// Write half of the socket.
    writer: OwnedWriteHalf,
    /// Single-slot reply channel fed by the receive task.
    replies: mpsc::Receiver<Reply>,
}

/// A live QMP connection to a VM.
///
/// Created by [`connect`](Self::connect) once the VM's control socket is
/// reachable. After the socket closes, or after [`close`](Self::close),
/// every command fails with [`Error::NotRunning`]; channels never reconnect.
#[derive(Debug)]
pub struct ControlChannel {
    /// State shared with the receive task.
    shared: Arc<Shared>,
    /// Greeting received during the handshake.
    info: QmpInfo,
    /// Execute lock plus the resources it protects.
    io: Mutex<Io>,
    /// Background receive task.
    receiver: JoinHandle<()>,
}

impl ControlChannel {
    /// Connects to the control socket at `path` and completes the handshake.
    ///
    /// Waits for the server greeting, then negotiates capabilities. Blocks
    /// for as long as the server stays silent; see
    /// [`connect_timeout`](Self::connect_timeout).
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&path)
            .await
            .map_err(|source| Error::Connection {
                path: path.clone(),
                source,
            })?;
        Self::handshake(path, stream).await
    }

    /// Like [`connect`](Self::connect), bounded by `timeout` overall.
    pub async fn connect_timeout(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        tokio::time::timeout(timeout, Self::connect(path))
            .await
            .map_err(|_| Error::Timeout {
                op: format!("QMP handshake on {}", path.display()),
                after: timeout,
            })?
    }

    /// Starts the receive task and runs the greeting/capabilities exchange.
    async fn handshake(path: PathBuf, stream: UnixStream) -> Result<Self> {
        let (reader, writer) = stream.into_split();
        let (closed_tx, closed_rx) = watch::channel(false);
        let (reply_tx, reply_rx) = mpsc::channel(1);
        let (greeting_tx, greeting_rx) = oneshot::channel();

        let shared = Arc::new(Shared {
            path,
            active: AtomicBool::new(true),
            closed: closed_tx,
        });
        let receiver = tokio::spawn(receive_loop(
            reader,
            Arc::clone(&shared),
            closed_rx,
            greeting_tx,
            reply_tx,
        ));

        let mut channel = Self {
            shared,
            info: QmpInfo::default(),
            io: Mutex::new(Io {
                writer,
                replies: reply_rx,
            }),
            receiver,
        };

        channel.info = match greeting_rx.await {
            Ok(Ok(info)) => info,
            Ok(Err(violation)) => return Err(Error::Protocol(violation)),
            Err(_) => {
                return Err(Error::Protocol(
                    "connection closed before the QMP greeting".to_owned(),
                ));
            }
        };
        tracing::info!(
            path = %channel.shared.path.display(),
            version = %channel.info.version.qemu,
            capabilities = ?channel.info.capabilities,
            "QMP greeting received"
        );

        channel.execute(CAPABILITIES_COMMAND, None).await?;
        Ok(channel)
    }

    /// Control socket path.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Server version and capabilities from the greeting.
    pub const fn greeting(&self) -> &QmpInfo {
        &self.info
    }

    /// Returns `false` once the channel has closed.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Sends `command` and waits for its return value.
    ///
    /// `arguments` is omitted from the request when `None` or empty.
    /// Fails with [`Error::NotRunning`] if the channel is closed, or closes
    /// while waiting, and with [`Error::Command`] if the VM rejects the
    /// command.
    pub async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        if !self.is_active() {
            return Err(self.shared.not_running());
        }

        let mut cmd = Command::new(command);
        if let Some(arguments) = arguments {
            cmd = cmd.with_arguments(arguments);
        }
        let frame = qvm_proto::encode(&cmd)?;

        let mut io = self.io.lock().await;
        if !self.is_active() {
            return Err(self.shared.not_running());
        }
        while let Ok(stale) = io.replies.try_recv() {
            tracing::warn!(reply = ?stale, "discarding unsolicited QMP reply");
        }

        tracing::debug!(path = %self.shared.path.display(), command, "sending QMP command");
        if let Err(e) = io.writer.write_all(&frame).await {
            return Err(self.write_failed(e));
        }

        match io.replies.recv().await {
            Some(reply) => Ok(reply.into_result()?),
            None => Err(self.shared.not_running()),
        }
    }

    /// Like [`execute`](Self::execute), bounded by `timeout`.
    ///
    /// An expired deadline closes the channel: a reply that arrives later
    /// could no longer be matched to its command.
    pub async fn execute_timeout(
        &self,
        command: &str,
        arguments: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if let Ok(res) = tokio::time::timeout(timeout, self.execute(command, arguments)).await {
            return res;
        }
        self.close().await;
        Err(Error::Timeout {
            op: format!("QMP command '{command}'"),
            after: timeout,
        })
    }

    /// Runs `query-status`.
    pub async fn query_status(&self) -> Result<QueryStatus> {
        let value = self.execute("query-status", None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Closes the channel. Idempotent.
    ///
    /// A command waiting for its reply fails with [`Error::NotRunning`].
    pub async fn close(&self) {
        self.shared.shut();
        let mut io = self.io.lock().await;
        if let Err(e) = io.writer.shutdown().await {
            tracing::debug!(error = %e, "shutting down control socket");
        }
    }

    /// Maps a failed write to an error, closing the channel if the peer is gone.
    fn write_failed(&self, e: std::io::Error) -> Error {
        use std::io::ErrorKind;

        if matches!(
            e.kind(),
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected
        ) {
            self.shared.shut();
            return self.shared.not_running();
        }
        e.into()
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.shared.shut();
        self.receiver.abort();
    }
}

/// Reads from the socket until EOF, a read error, or close.
///
/// Dropping `replies` on exit is what releases a blocked `execute`.
async fn receive_loop(
    mut reader: OwnedReadHalf,
    shared: Arc<Shared>,
    mut closed: watch::Receiver<bool>,
    greeting: oneshot::Sender<GreetingResult>,
    replies: mpsc::Sender<Reply>,
) {
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut greeting = Some(greeting);

    loop {
        let n = tokio::select! {
            res = reader.read(&mut buf) => match res {
                Ok(0) => {
                    tracing::debug!(path = %shared.path.display(), "control socket closed by peer");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(path = %shared.path.display(), error = %e, "control socket read failed");
                    break;
                }
            },
            _ = closed.wait_for(|c| *c) => break,
        };

        framer.push(&buf[..n]);
        for frame in framer.frames() {
            dispatch(&frame, &mut greeting, &replies);
        }
    }

    shared.shut();
}

/// Classifies one frame and routes it.
fn dispatch(
    frame: &[u8],
    greeting: &mut Option<oneshot::Sender<GreetingResult>>,
    replies: &mpsc::Sender<Reply>,
) {
    let msg: Message = match qvm_proto::decode(frame) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(
                error = %e,
                frame = %String::from_utf8_lossy(frame),
                "discarding malformed QMP message"
            );
            return;
        }
    };

    match msg {
        Message::Greeting(info) => match greeting.take() {
            Some(tx) => {
                let _ = tx.send(Ok(info));
            }
            None => tracing::warn!(?info, "ignoring repeated QMP greeting"),
        },
        other if greeting.is_some() => {
            if let Some(tx) = greeting.take() {
                let _ = tx.send(Err(format!("expected QMP greeting, got {other:?}")));
            }
        }
        Message::Event(ev) => tracing::info!(
            event = %ev.event,
            seconds = ev.timestamp.seconds,
            micros = ev.timestamp.microseconds,
            data = %ev.data,
            "QMP event"
        ),
        Message::Return(reply) => match replies.try_send(reply) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(reply)) => {
                tracing::warn!(?reply, "reply slot occupied, dropping QMP reply");
            }
        },
        other => tracing::debug!(message = ?other, "ignoring unrecognized QMP message"),
    }
}
