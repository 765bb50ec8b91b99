//! Newline-delimited JSON framing.
//!
//! Each frame is: `[JSON object]\n`. The server may also terminate lines
//! with `\r\n`.

use std::io;

use serde::{Deserialize, Serialize};

/// Reassembles newline-delimited frames from arbitrarily split reads.
///
/// Bytes are appended with [`push`](Self::push); complete frames are taken
/// with [`frames`](Self::frames). Whatever follows the last newline stays
/// buffered until a later read completes it. There is no size limit on a
/// single frame.
#[derive(Debug, Default)]
pub struct LineFramer {
    /// Received bytes not yet handed out as frames (from `consumed` on).
    buf: Vec<u8>,
    /// Length of the already-yielded prefix of `buf`.
    consumed: usize,
}

impl LineFramer {
    /// Creates an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one read's worth of bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.consumed > 0 {
            self.buf.drain(..self.consumed);
            self.consumed = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Returns an iterator over the complete frames buffered so far.
    ///
    /// Frames are yielded without their delimiter. Blank lines are skipped.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { framer: self }
    }

    /// Number of buffered bytes that do not yet form a complete frame.
    ///
    /// Only meaningful once [`frames`](Self::frames) has been drained.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.consumed
    }

    /// Splits off the next complete, non-blank line.
    fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let rest = self.buf.get(self.consumed..)?;
            let pos = rest.iter().position(|&b| b == b'\n')?;
            let mut line = rest[..pos].to_vec();
            self.consumed += pos + 1;

            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().any(|b| !b.is_ascii_whitespace()) {
                return Some(line);
            }
        }
    }
}

/// Iterator returned by [`LineFramer::frames`].
#[derive(Debug)]
pub struct Frames<'a> {
    /// The framer being drained.
    framer: &'a mut LineFramer,
}

impl Iterator for Frames<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_frame()
    }
}

/// Serializes `msg` as one newline-terminated JSON frame.
pub fn encode(msg: &impl Serialize) -> io::Result<Vec<u8>> {
    let mut frame =
        serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    frame.push(b'\n');
    Ok(frame)
}

/// Decodes a single frame, as yielded by [`LineFramer::frames`].
pub fn decode<T: for<'de> Deserialize<'de>>(frame: &[u8]) -> io::Result<T> {
    serde_json::from_slice(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{Command, Message, Reply};

    #[test]
    fn message_split_across_reads() {
        let mut framer = LineFramer::new();

        framer.push(br#"{"return":{"ok""#);
        assert_eq!(framer.frames().count(), 0);
        assert_eq!(framer.pending(), 15);

        framer.push(b":true}}\n");
        let frames: Vec<_> = framer.frames().collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(framer.pending(), 0);

        let split: Message = decode(&frames[0]).unwrap();
        let whole: Message = decode(br#"{"return":{"ok":true}}"#).unwrap();
        assert_eq!(split, whole);
        assert_eq!(split, Message::Return(Reply::Value(json!({"ok": true}))));
    }

    #[test]
    fn several_messages_in_one_read() {
        let mut framer = LineFramer::new();
        framer.push(b"{\"event\":\"STOP\"}\r\n{\"return\":{}}\n{\"ret");

        let frames: Vec<_> = framer.frames().collect();
        assert_eq!(frames, vec![br#"{"event":"STOP"}"#.to_vec(), br#"{"return":{}}"#.to_vec()]);
        assert_eq!(framer.pending(), 5);

        framer.push(b"urn\":{}}\n");
        let frames: Vec<_> = framer.frames().collect();
        assert_eq!(frames, vec![br#"{"return":{}}"#.to_vec()]);
    }

    #[test]
    fn skips_blank_lines() {
        let mut framer = LineFramer::new();
        framer.push(b"\n\r\n  \n{\"return\":{}}\n\n");
        assert_eq!(framer.frames().count(), 1);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn reassembles_large_message_across_many_reads() {
        let payload = "x".repeat(64 * 1024);
        let line = format!("{{\"return\":{{\"blob\":\"{payload}\"}}}}\n");

        let mut framer = LineFramer::new();
        let mut frames = Vec::new();
        for chunk in line.as_bytes().chunks(1000) {
            framer.push(chunk);
            frames.extend(framer.frames());
        }

        assert_eq!(frames.len(), 1);
        let msg: Message = decode(&frames[0]).unwrap();
        assert_eq!(msg, Message::Return(Reply::Value(json!({"blob": payload}))));
    }

    #[test]
    fn encode_terminates_with_newline() {
        let frame = encode(&Command::new("query-status")).unwrap();
        assert_eq!(frame, b"{\"execute\":\"query-status\"}\n");

        let mut framer = LineFramer::new();
        framer.push(&frame);
        let back: Command = decode(&framer.frames().next().unwrap()).unwrap();
        assert_eq!(back.execute, "query-status");
    }

    #[test]
    fn decode_reports_invalid_data() {
        let err = decode::<Message>(b"{not json").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
