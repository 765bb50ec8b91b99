//! Wire protocol for the QEMU Machine Protocol (QMP) control socket.
//!
//! Every message, in both directions, is one JSON object followed by a
//! newline. QEMU writes its replies that way; JSON itself does not require
//! it, so the framing here is an assumption about the server rather than a
//! property of the format.

mod codec;
mod message;

pub use codec::{Frames, LineFramer, decode, encode};
pub use message::{
    CAPABILITIES_COMMAND, Command, Event, Message, QmpError, QmpInfo, QmpVersion, Reply,
    Timestamp, VersionTriple,
};
