//! QMP message types.
//!
//! QEMU spells its keys in lower case (`version`, `capabilities`,
//! `seconds`). Capitalized spellings are accepted as aliases because some
//! clients and test fixtures emit them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command that must be executed before the server accepts any other one.
pub const CAPABILITIES_COMMAND: &str = "qmp_capabilities";

/// A `major.minor.micro` version number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionTriple {
    /// Major version.
    #[serde(default, alias = "Major")]
    pub major: u32,
    /// Minor version.
    #[serde(default, alias = "Minor")]
    pub minor: u32,
    /// Micro (patch) version.
    #[serde(default, alias = "Micro")]
    pub micro: u32,
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

/// Server version announced in the greeting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpVersion {
    /// QEMU version.
    #[serde(default, alias = "Qemu")]
    pub qemu: VersionTriple,
    /// Distribution package string, often empty.
    #[serde(default, alias = "Package")]
    pub package: String,
}

/// Contents of the `QMP` greeting object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpInfo {
    /// Server version.
    #[serde(default, alias = "Version")]
    pub version: QmpVersion,
    /// Optional protocol capabilities offered by the server.
    #[serde(default, alias = "Capabilities")]
    pub capabilities: Vec<String>,
}

/// Event timestamp, split into seconds and microseconds since the epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Whole seconds.
    #[serde(default, alias = "Seconds")]
    pub seconds: i64,
    /// Microseconds within the second.
    #[serde(default, alias = "Microseconds")]
    pub microseconds: i64,
}

/// An asynchronous notification not correlated with any command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name, e.g. `STOP` or `SHUTDOWN`.
    pub event: String,
    /// When the server emitted the event.
    #[serde(default)]
    pub timestamp: Timestamp,
    /// Event-specific payload.
    #[serde(default)]
    pub data: Value,
}

/// Failure reported by the server in place of a `return` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpError {
    /// Error class, e.g. `GenericError` or `CommandNotFound`.
    #[serde(default)]
    pub class: String,
    /// Human-readable description.
    #[serde(default)]
    pub desc: String,
}

impl fmt::Display for QmpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.desc)
    }
}

impl std::error::Error for QmpError {}

/// Outcome of a single command.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Reply {
    /// `{"return": ...}`.
    Value(Value),
    /// `{"error": {...}}`.
    Error(QmpError),
}

impl Reply {
    /// Converts the reply into a `Result`.
    pub fn into_result(self) -> Result<Value, QmpError> {
        match self {
            Self::Value(v) => Ok(v),
            Self::Error(e) => Err(e),
        }
    }
}

/// A message received from the server.
///
/// Classification happens once, at decode time. When an object carries the
/// keys of several shapes, the first matching variant in declaration order
/// wins: greeting, then event, then command return.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "Wire")]
#[non_exhaustive]
pub enum Message {
    /// Handshake greeting, sent once right after the connection opens.
    Greeting(QmpInfo),
    /// Asynchronous event.
    Event(Event),
    /// Result of the most recently issued command.
    Return(Reply),
}

/// On-the-wire shapes, tried in order by serde.
#[derive(Deserialize)]
#[serde(untagged)]
enum Wire {
    /// `{"QMP": {...}}`.
    Greeting {
        /// Greeting payload.
        #[serde(rename = "QMP")]
        qmp: QmpInfo,
    },
    /// `{"event": ..., "timestamp": ..., "data": ...}`.
    Event(Event),
    /// `{"return": ...}`.
    Return {
        /// Returned value.
        #[serde(rename = "return")]
        value: Value,
    },
    /// `{"error": {...}}`.
    Error {
        /// Failure details.
        error: QmpError,
    },
}

impl From<Wire> for Message {
    fn from(wire: Wire) -> Self {
        match wire {
            Wire::Greeting { qmp } => Self::Greeting(qmp),
            Wire::Event(ev) => Self::Event(ev),
            Wire::Return { value } => Self::Return(Reply::Value(value)),
            Wire::Error { error } => Self::Return(Reply::Error(error)),
        }
    }
}

/// A command sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name, e.g. `query-status`.
    pub execute: String,
    /// Command arguments. Omitted on the wire when absent or empty.
    #[serde(default, skip_serializing_if = "arguments_absent")]
    pub arguments: Option<Value>,
}

impl Command {
    /// Creates a command without arguments.
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            arguments: None,
        }
    }

    /// Attaches arguments to the command.
    #[must_use]
    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = Some(arguments);
        self
    }
}

/// Returns `true` when `arguments` would carry nothing on the wire.
#[allow(clippy::ref_option)]
fn arguments_absent(arguments: &Option<Value>) -> bool {
    match arguments {
        None | Some(Value::Null) => true,
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(s: &str) -> Message {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn classifies_greeting() {
        let msg = parse(
            r#"{"QMP": {"version": {"qemu": {"micro": 1, "minor": 2, "major": 8}, "package": "Debian"}, "capabilities": ["oob"]}}"#,
        );
        let Message::Greeting(info) = msg else {
            panic!("expected greeting, got {msg:?}");
        };
        assert_eq!(info.version.qemu.to_string(), "8.2.1");
        assert_eq!(info.version.package, "Debian");
        assert_eq!(info.capabilities, vec!["oob"]);
    }

    #[test]
    fn accepts_capitalized_greeting_keys() {
        let msg = parse(
            r#"{"QMP": {"Version": {"Qemu": {"Major": 1, "Minor": 5, "Micro": 0}, "Package": ""}, "Capabilities": []}}"#,
        );
        let Message::Greeting(info) = msg else {
            panic!("expected greeting, got {msg:?}");
        };
        assert_eq!(info.version.qemu.major, 1);
        assert_eq!(info.version.qemu.minor, 5);
    }

    #[test]
    fn classifies_event() {
        let msg = parse(
            r#"{"event": "STOP", "timestamp": {"seconds": 1700000000, "microseconds": 42}, "data": {}}"#,
        );
        let Message::Event(ev) = msg else {
            panic!("expected event, got {msg:?}");
        };
        assert_eq!(ev.event, "STOP");
        assert_eq!(ev.timestamp.seconds, 1_700_000_000);
        assert_eq!(ev.timestamp.microseconds, 42);
    }

    #[test]
    fn event_without_data_or_timestamp() {
        let msg = parse(r#"{"event": "RESUME"}"#);
        assert!(matches!(msg, Message::Event(ref ev) if ev.data.is_null()));
    }

    #[test]
    fn classifies_return_and_error() {
        assert_eq!(
            parse(r#"{"return": {"running": true}}"#),
            Message::Return(Reply::Value(json!({"running": true})))
        );
        assert_eq!(
            parse(r#"{"return": {}}"#),
            Message::Return(Reply::Value(json!({})))
        );

        let msg = parse(r#"{"error": {"class": "CommandNotFound", "desc": "nope"}}"#);
        let Message::Return(reply) = msg else {
            panic!("expected return, got {msg:?}");
        };
        let err = reply.into_result().unwrap_err();
        assert_eq!(err.class, "CommandNotFound");
        assert_eq!(err.to_string(), "CommandNotFound: nope");
    }

    #[test]
    fn greeting_takes_precedence() {
        let msg = parse(r#"{"QMP": {}, "event": "STOP", "return": {}}"#);
        assert!(matches!(msg, Message::Greeting(_)));

        let msg = parse(r#"{"event": "STOP", "return": {}}"#);
        assert!(matches!(msg, Message::Event(_)));
    }

    #[test]
    fn rejects_unknown_shape() {
        assert!(serde_json::from_str::<Message>(r#"{"hello": 1}"#).is_err());
        assert!(serde_json::from_str::<Message>("[1, 2]").is_err());
    }

    #[test]
    fn command_omits_empty_arguments() {
        let cmd = Command::new("ping");
        assert_eq!(serde_json::to_string(&cmd).unwrap(), r#"{"execute":"ping"}"#);

        let cmd = Command::new("ping").with_arguments(json!([]));
        assert_eq!(serde_json::to_string(&cmd).unwrap(), r#"{"execute":"ping"}"#);

        let cmd = Command::new("device_del").with_arguments(json!({"id": "net0"}));
        assert_eq!(
            serde_json::to_string(&cmd).unwrap(),
            r#"{"execute":"device_del","arguments":{"id":"net0"}}"#
        );
    }
}
