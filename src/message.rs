//! Bolt message identification and canned responses.
//!
//! The proxy never re-encodes traffic: a [`Message`] carries the raw framed
//! bytes exactly as they arrived (length prefixes and `00 00` terminator
//! included) so it can be written to the peer verbatim. Only the `kind` is
//! derived, from the signature byte of the first chunk.

use std::fmt;

use bytes::Bytes;

use crate::error::ProxyError;
use crate::packstream::{self, Value};

/// Message signature bytes (fourth byte of a framed message).
pub mod sig {
    pub const HELLO: u8 = 0x01;
    pub const GOODBYE: u8 = 0x02;
    pub const RESET: u8 = 0x0F;
    pub const RUN: u8 = 0x10;
    pub const BEGIN: u8 = 0x11;
    pub const COMMIT: u8 = 0x12;
    pub const ROLLBACK: u8 = 0x13;
    pub const DISCARD: u8 = 0x2F;
    pub const PULL: u8 = 0x3F;
    pub const SUCCESS: u8 = 0x70;
    pub const RECORD: u8 = 0x71;
    pub const IGNORE: u8 = 0x7E;
    pub const FAILURE: u8 = 0x7F;
}

/// The kind of a Bolt message, as far as the proxy cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Reset,
    Run,
    Discard,
    Pull,
    Record,
    Success,
    Ignore,
    Failure,
    Hello,
    Goodbye,
    Begin,
    Commit,
    Rollback,
    /// Too short to carry a signature (keep-alive padding).
    Nop,
    /// Continuation chunk of a message that did not fit one chunk.
    Chunked,
    Unknown,
}

impl MessageKind {
    /// Maps a signature byte to its message kind.
    pub fn from_signature(b: u8) -> Self {
        match b {
            sig::RESET => Self::Reset,
            sig::RUN => Self::Run,
            sig::DISCARD => Self::Discard,
            sig::PULL => Self::Pull,
            sig::RECORD => Self::Record,
            sig::SUCCESS => Self::Success,
            sig::IGNORE => Self::Ignore,
            sig::FAILURE => Self::Failure,
            sig::HELLO => Self::Hello,
            sig::GOODBYE => Self::Goodbye,
            sig::BEGIN => Self::Begin,
            sig::COMMIT => Self::Commit,
            sig::ROLLBACK => Self::Rollback,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reset => "RESET",
            Self::Run => "RUN",
            Self::Discard => "DISCARD",
            Self::Pull => "PULL",
            Self::Record => "RECORD",
            Self::Success => "SUCCESS",
            Self::Ignore => "IGNORE",
            Self::Failure => "FAILURE",
            Self::Hello => "HELLO",
            Self::Goodbye => "GOODBYE",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
            Self::Nop => "NOP",
            Self::Chunked => "CHUNKED",
            Self::Unknown => "?UNKNOWN?",
        };
        f.write_str(name)
    }
}

/// Identifies a framed message from its leading bytes.
///
/// The buffer starts with the 2-byte chunk length; the signature is the
/// fourth byte. Buffers shorter than 4 bytes are keep-alive noise.
pub fn identify_type(buf: &[u8]) -> MessageKind {
    if buf.len() < 4 {
        return MessageKind::Nop;
    }
    MessageKind::from_signature(buf[3])
}

/// A single framed Bolt message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    /// Raw on-wire bytes including length prefix(es) and terminator.
    pub data: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// The canned SUCCESS completing a client's HELLO exchange: a map of
    /// `server = "Neo4j/4.2.0"` and `connection_id = "bolt-4"`.
    pub fn hello_success() -> Self {
        const DATA: &[u8] = &[
            0x00, 0x2B, 0xB1, 0x70, //
            0xA2, //
            0x86, b's', b'e', b'r', b'v', b'e', b'r', //
            0x8B, b'N', b'e', b'o', b'4', b'j', b'/', b'4', b'.', b'2', b'.', b'0', //
            0x8D, b'c', b'o', b'n', b'n', b'e', b'c', b't', b'i', b'o', b'n', b'_', b'i',
            b'd', //
            0x86, b'b', b'o', b'l', b't', b'-', b'4', //
            0x00, 0x00,
        ];
        Self::new(MessageKind::Success, DATA)
    }

    /// The canned empty SUCCESS sent in reply to a RESET outside of any
    /// transaction.
    pub fn empty_success() -> Self {
        const DATA: &[u8] = &[0x00, 0x03, 0xB1, 0x70, 0xA0, 0x00, 0x00];
        Self::new(MessageKind::Success, DATA)
    }

    /// The polite GOODBYE written before abandoning a failed upstream.
    pub fn goodbye() -> Self {
        const DATA: &[u8] = &[0x00, 0x02, 0xB0, 0x02];
        Self::new(MessageKind::Goodbye, DATA)
    }
}

/// Transaction access mode, extracted from a BEGIN for cluster routing.
/// The upstream is a single host, so the mode is observed but not acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    Read,
    Write,
}

impl fmt::Display for TxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
        })
    }
}

/// Finds the access mode of a framed message.
///
/// Everything defaults to WRITE; a BEGIN whose metadata map carries
/// `mode = "r"` is READ.
pub fn validate_mode(data: &[u8]) -> Result<TxMode, ProxyError> {
    if identify_type(data) != MessageKind::Begin {
        return Ok(TxMode::Write);
    }
    let (map, _) = packstream::parse_map(&data[4..])?;
    match map.get("mode") {
        Some(Value::String(mode)) if mode == "r" => Ok(TxMode::Read),
        _ => Ok(TxMode::Write),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_all_signatures() {
        let table = [
            (0x0Fu8, MessageKind::Reset),
            (0x10, MessageKind::Run),
            (0x2F, MessageKind::Discard),
            (0x3F, MessageKind::Pull),
            (0x71, MessageKind::Record),
            (0x70, MessageKind::Success),
            (0x7E, MessageKind::Ignore),
            (0x7F, MessageKind::Failure),
            (0x01, MessageKind::Hello),
            (0x02, MessageKind::Goodbye),
            (0x11, MessageKind::Begin),
            (0x12, MessageKind::Commit),
            (0x13, MessageKind::Rollback),
        ];
        for (b, kind) in table {
            assert_eq!(identify_type(&[0xF0, 0x00, 0x00, b]), kind, "byte {b:#04X}");
        }
    }

    #[test]
    fn identify_unknown_bytes() {
        let known = [
            0x0Fu8, 0x10, 0x2F, 0x3F, 0x71, 0x70, 0x7E, 0x7F, 0x01, 0x02, 0x11, 0x12, 0x13,
        ];
        for b in 0..=u8::MAX {
            if known.contains(&b) {
                continue;
            }
            assert_eq!(
                identify_type(&[0xF0, 0x00, 0x00, b]),
                MessageKind::Unknown,
                "byte {b:#04X}"
            );
        }
    }

    #[test]
    fn identify_short_buffer() {
        assert_eq!(identify_type(&[]), MessageKind::Nop);
        assert_eq!(identify_type(&[0x00, 0x02, 0xB0]), MessageKind::Nop);
    }

    #[test]
    fn canned_messages_are_framed() {
        for msg in [
            Message::hello_success(),
            Message::empty_success(),
            Message::goodbye(),
        ] {
            let len = u16::from_be_bytes([msg.data[0], msg.data[1]]) as usize;
            assert_eq!(identify_type(&msg.data), msg.kind);
            // GOODBYE is written without a trailing terminator.
            if msg.kind != MessageKind::Goodbye {
                assert_eq!(&msg.data[2 + len..], &[0x00, 0x00]);
            }
        }
    }

    #[test]
    fn mode_defaults_to_write() {
        // RUN message: B1 10 + tiny string body.
        let run = [0x00, 0x04, 0xB1, 0x10, 0x81, b'q'];
        assert_eq!(validate_mode(&run).unwrap(), TxMode::Write);
    }

    #[test]
    fn mode_read_from_begin() {
        // BEGIN with {mode: "r"}: B1 11 A1 84 "mode" 81 "r"
        let begin = [
            0x00, 0x0A, 0xB1, 0x11, 0xA1, 0x84, b'm', b'o', b'd', b'e', 0x81, b'r',
        ];
        assert_eq!(validate_mode(&begin).unwrap(), TxMode::Read);
    }

    #[test]
    fn mode_write_from_plain_begin() {
        // BEGIN with an empty map.
        let begin = [0x00, 0x03, 0xB1, 0x11, 0xA0];
        assert_eq!(validate_mode(&begin).unwrap(), TxMode::Write);
    }
}
