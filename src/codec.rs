// Chat wire codec - the two framed formats that bind hub and clients.
//
// The protocol is deliberately asymmetric: clients address the hub with
// `|`-separated fields (`TYPE|SOURCE|DEST|CONTENT`), while the hub answers
// with `\n`-separated fields in a different order (`SOURCE\nTYPE\nDEST\n
// CONTENT`). Existing clients depend on both shapes byte-for-byte, so they
// are encoded here as two named codecs (request/reply) rather than one
// "unified" format.

use crate::username::SYSTEM_NAME;
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum allowed content length per frame.
pub const MAX_CONTENT: usize = 4096;

/// Upper bound on a whole encoded frame (header fields plus content).
///
/// Used by the stream transport to reject length prefixes that could never
/// describe a legal frame.
pub const MAX_FRAME: usize = MAX_CONTENT + 2 + 2 * 32 + 8;

/// Field separator on the client-to-hub direction.
pub const REQUEST_SEP: u8 = b'|';
/// Field separator on the hub-to-client direction.
pub const REPLY_SEP: u8 = b'\n';

/// The closed set of frame types.
///
/// `Error` never travels client-to-hub: it exists only as the sub-kind of
/// hub-originated `SYSTEM` replies, so the request decoder refuses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Join,
    Leave,
    List,
    Msg,
    Priv,
    System,
    Error,
}

impl FrameType {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Join => "JOIN",
            FrameType::Leave => "LEAVE",
            FrameType::List => "LIST",
            FrameType::Msg => "MSG",
            FrameType::Priv => "PRIV",
            FrameType::System => "SYSTEM",
            FrameType::Error => "ERROR",
        }
    }

    fn from_bytes(raw: &[u8]) -> Option<Self> {
        match raw {
            b"JOIN" => Some(FrameType::Join),
            b"LEAVE" => Some(FrameType::Leave),
            b"LIST" => Some(FrameType::List),
            b"MSG" => Some(FrameType::Msg),
            b"PRIV" => Some(FrameType::Priv),
            b"SYSTEM" => Some(FrameType::System),
            b"ERROR" => Some(FrameType::Error),
            _ => None,
        }
    }
}

/// One decoded frame, borrowing the input buffer.
///
/// Decoding never allocates and never inspects `content`; the slices live
/// exactly as long as the buffer they were parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame<'a> {
    pub frame_type: FrameType,
    pub source: &'a [u8],
    pub dest: &'a [u8],
    pub content: &'a [u8],
}

/// Codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Fewer than three separators in the buffer.
    #[error("malformed frame: expected 4 fields")]
    MalformedFrame,

    /// The type field is not in the closed vocabulary for this direction.
    #[error("unknown frame type {0:?}")]
    UnknownType(String),

    /// A header field contains the separator byte for its direction.
    #[error("field {field} contains the separator byte")]
    SeparatorInField { field: &'static str },

    /// Content exceeds [`MAX_CONTENT`].
    #[error("content too long: {len} bytes (maximum {MAX_CONTENT})")]
    Oversized { len: usize },
}

/// Split a buffer at the first three occurrences of `sep`.
///
/// The fourth piece is the untouched remainder, which is how content gets to
/// carry the separator byte freely.
fn split_fields(buf: &[u8], sep: u8) -> Result<(&[u8], &[u8], &[u8], &[u8]), CodecError> {
    let first = find_byte(buf, 0, sep).ok_or(CodecError::MalformedFrame)?;
    let second = find_byte(buf, first + 1, sep).ok_or(CodecError::MalformedFrame)?;
    let third = find_byte(buf, second + 1, sep).ok_or(CodecError::MalformedFrame)?;
    Ok((
        &buf[..first],
        &buf[first + 1..second],
        &buf[second + 1..third],
        &buf[third + 1..],
    ))
}

fn find_byte(buf: &[u8], from: usize, needle: u8) -> Option<usize> {
    buf.get(from..)?
        .iter()
        .position(|&b| b == needle)
        .map(|i| from + i)
}

/// Decode one client-to-hub frame: `TYPE|SOURCE|DEST|CONTENT`.
pub fn decode_request(buf: &[u8]) -> Result<RawFrame<'_>, CodecError> {
    let (type_raw, source, dest, content) = split_fields(buf, REQUEST_SEP)?;
    let frame_type = FrameType::from_bytes(type_raw)
        .filter(|t| *t != FrameType::Error)
        .ok_or_else(|| CodecError::UnknownType(String::from_utf8_lossy(type_raw).into_owned()))?;
    Ok(RawFrame {
        frame_type,
        source,
        dest,
        content,
    })
}

/// Decode one hub-to-client frame: `SOURCE\nTYPE\nDEST\nCONTENT`.
///
/// Note the field order differs from the request direction; only the first
/// three separators delimit, the remainder is content.
pub fn decode_reply(buf: &[u8]) -> Result<RawFrame<'_>, CodecError> {
    let (source, type_raw, dest, content) = split_fields(buf, REPLY_SEP)?;
    let frame_type = FrameType::from_bytes(type_raw)
        .ok_or_else(|| CodecError::UnknownType(String::from_utf8_lossy(type_raw).into_owned()))?;
    Ok(RawFrame {
        frame_type,
        source,
        dest,
        content,
    })
}

fn check_field(field: &[u8], name: &'static str, sep: u8) -> Result<(), CodecError> {
    if field.contains(&sep) {
        return Err(CodecError::SeparatorInField { field: name });
    }
    Ok(())
}

fn check_content(content: &[u8]) -> Result<(), CodecError> {
    if content.len() > MAX_CONTENT {
        return Err(CodecError::Oversized { len: content.len() });
    }
    Ok(())
}

/// Encode one client-to-hub frame.
pub fn encode_request(
    frame_type: FrameType,
    source: &str,
    dest: &str,
    content: &[u8],
) -> Result<Bytes, CodecError> {
    check_field(source.as_bytes(), "source", REQUEST_SEP)?;
    check_field(dest.as_bytes(), "dest", REQUEST_SEP)?;
    check_content(content)?;

    let type_str = frame_type.as_str();
    let mut buf =
        BytesMut::with_capacity(type_str.len() + source.len() + dest.len() + content.len() + 3);
    buf.put_slice(type_str.as_bytes());
    buf.put_u8(REQUEST_SEP);
    buf.put_slice(source.as_bytes());
    buf.put_u8(REQUEST_SEP);
    buf.put_slice(dest.as_bytes());
    buf.put_u8(REQUEST_SEP);
    buf.put_slice(content);
    Ok(buf.freeze())
}

/// One hub-originated frame, owned, ready to fan out.
///
/// The router allocates one of these per destination; encoding is the last
/// step before the bytes hit a write queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// A user name, or [`SYSTEM_NAME`] for hub control traffic.
    pub source: String,
    /// The frame type; for SYSTEM frames this carries the sub-kind
    /// (JOIN, LEAVE, LIST, ERROR).
    pub kind: FrameType,
    pub dest: String,
    pub content: Bytes,
}

impl Reply {
    /// A hub control frame from `SYSTEM`.
    pub fn system(kind: FrameType, dest: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Reply {
            source: SYSTEM_NAME.to_owned(),
            kind,
            dest: dest.into(),
            content: content.into(),
        }
    }

    /// A user-sourced frame (MSG/PRIV fan-out).
    pub fn from_user(
        source: impl Into<String>,
        kind: FrameType,
        dest: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        Reply {
            source: source.into(),
            kind,
            dest: dest.into(),
            content: content.into(),
        }
    }

    /// Encode as `SOURCE\nTYPE\nDEST\nCONTENT`.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        check_field(self.source.as_bytes(), "source", REPLY_SEP)?;
        check_field(self.dest.as_bytes(), "dest", REPLY_SEP)?;
        check_content(&self.content)?;

        let kind = self.kind.as_str();
        let mut buf = BytesMut::with_capacity(
            self.source.len() + kind.len() + self.dest.len() + self.content.len() + 3,
        );
        buf.put_slice(self.source.as_bytes());
        buf.put_u8(REPLY_SEP);
        buf.put_slice(kind.as_bytes());
        buf.put_u8(REPLY_SEP);
        buf.put_slice(self.dest.as_bytes());
        buf.put_u8(REPLY_SEP);
        buf.put_slice(&self.content);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_request_fields() {
        let frame = decode_request(b"MSG|alice||hello world").unwrap();
        assert_eq!(frame.frame_type, FrameType::Msg);
        assert_eq!(frame.source, b"alice");
        assert_eq!(frame.dest, b"");
        assert_eq!(frame.content, b"hello world");
    }

    #[test]
    fn request_content_may_contain_separator() {
        let frame = decode_request(b"PRIV|alice|bob|a|b|c").unwrap();
        assert_eq!(frame.dest, b"bob");
        assert_eq!(frame.content, b"a|b|c");
    }

    #[test]
    fn empty_fields_and_empty_content_are_legal() {
        let frame = decode_request(b"LIST|alice||").unwrap();
        assert_eq!(frame.content, b"");
        let frame = decode_request(b"JOIN|||").unwrap();
        assert_eq!(frame.source, b"");
    }

    #[test]
    fn too_few_separators_is_malformed() {
        for input in [
            &b""[..],
            b"MSG",
            b"MSG|alice",
            b"MSG|alice|bob",
            b"no separators at all",
        ] {
            assert!(matches!(
                decode_request(input),
                Err(CodecError::MalformedFrame)
            ));
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(matches!(
            decode_request(b"NOPE|alice||x"),
            Err(CodecError::UnknownType(_))
        ));
        // ERROR only exists on the reply direction.
        assert!(matches!(
            decode_request(b"ERROR|alice||x"),
            Err(CodecError::UnknownType(_))
        ));
    }

    #[test]
    fn decode_is_safe_on_arbitrary_input() {
        // Separator-only, binary garbage, every byte value: decode must
        // either produce slices inside the input or fail, never panic.
        let inputs: Vec<Vec<u8>> = vec![
            vec![],
            vec![b'|'],
            vec![b'|'; 3],
            vec![b'|'; 100],
            vec![0xff; 64],
            b"|||".to_vec(),
            b"\n\n\n".to_vec(),
            (0..=255u8).collect(),
        ];
        for input in &inputs {
            let _ = decode_request(input);
            let _ = decode_reply(input);
        }
        // Exactly three separators and nothing else: four empty fields,
        // which fails only because the empty type is unknown.
        assert!(matches!(
            decode_request(b"|||"),
            Err(CodecError::UnknownType(_))
        ));
    }

    #[test]
    fn decodes_reply_fields() {
        let frame = decode_reply(b"alice\nMSG\n\nhello").unwrap();
        assert_eq!(frame.source, b"alice");
        assert_eq!(frame.frame_type, FrameType::Msg);
        assert_eq!(frame.dest, b"");
        assert_eq!(frame.content, b"hello");

        let frame = decode_reply(b"SYSTEM\nERROR\nalice\nname in use").unwrap();
        assert_eq!(frame.source, b"SYSTEM");
        assert_eq!(frame.frame_type, FrameType::Error);
    }

    #[test]
    fn reply_content_may_contain_newlines() {
        let frame = decode_reply(b"alice\nMSG\n\nline one\nline two").unwrap();
        assert_eq!(frame.content, b"line one\nline two");
    }

    #[test]
    fn encode_request_round_trips() {
        let bytes = encode_request(FrameType::Priv, "alice", "bob", b"hi there").unwrap();
        assert_eq!(&bytes[..], b"PRIV|alice|bob|hi there");
        let frame = decode_request(&bytes).unwrap();
        assert_eq!(frame.frame_type, FrameType::Priv);
        assert_eq!(frame.source, b"alice");
        assert_eq!(frame.dest, b"bob");
        assert_eq!(frame.content, b"hi there");
    }

    #[test]
    fn encode_reply_round_trips() {
        let reply = Reply::system(FrameType::List, "alice", &b"alice,bob"[..]);
        let bytes = reply.encode().unwrap();
        assert_eq!(&bytes[..], b"SYSTEM\nLIST\nalice\nalice,bob");
        let frame = decode_reply(&bytes).unwrap();
        assert_eq!(frame.frame_type, FrameType::List);
        assert_eq!(frame.dest, b"alice");
        assert_eq!(frame.content, b"alice,bob");
    }

    #[test]
    fn decode_then_encode_is_identity() {
        // Holds for any well-formed frame; content may carry the separator.
        for wire in [
            &b"MSG|alice||hello"[..],
            b"PRIV|alice|bob|a|b|c",
            b"JOIN|carol||",
            b"LIST|bob||",
        ] {
            let frame = decode_request(wire).unwrap();
            let rebuilt = encode_request(
                frame.frame_type,
                std::str::from_utf8(frame.source).unwrap(),
                std::str::from_utf8(frame.dest).unwrap(),
                frame.content,
            )
            .unwrap();
            assert_eq!(&rebuilt[..], wire);
        }

        for wire in [
            &b"alice\nMSG\n\nhello"[..],
            b"SYSTEM\nLIST\nbob\nalice,bob",
            b"alice\nPRIV\nbob\nline one\nline two",
        ] {
            let frame = decode_reply(wire).unwrap();
            let rebuilt = Reply {
                source: String::from_utf8(frame.source.to_vec()).unwrap(),
                kind: frame.frame_type,
                dest: String::from_utf8(frame.dest.to_vec()).unwrap(),
                content: Bytes::copy_from_slice(frame.content),
            }
            .encode()
            .unwrap();
            assert_eq!(&rebuilt[..], wire);
        }
    }

    #[test]
    fn encode_rejects_separator_in_fields() {
        assert!(matches!(
            encode_request(FrameType::Msg, "ali|ce", "", b"x"),
            Err(CodecError::SeparatorInField { field: "source" })
        ));
        assert!(matches!(
            encode_request(FrameType::Priv, "alice", "b|ob", b"x"),
            Err(CodecError::SeparatorInField { field: "dest" })
        ));
        let reply = Reply::from_user("ali\nce", FrameType::Msg, "", &b"x"[..]);
        assert!(reply.encode().is_err());
    }

    #[test]
    fn content_limit_boundary() {
        let at_limit = vec![b'x'; MAX_CONTENT];
        assert!(encode_request(FrameType::Msg, "alice", "", &at_limit).is_ok());

        let over = vec![b'x'; MAX_CONTENT + 1];
        assert!(matches!(
            encode_request(FrameType::Msg, "alice", "", &over),
            Err(CodecError::Oversized { .. })
        ));
        let reply = Reply::from_user("alice", FrameType::Msg, "", over);
        assert!(matches!(reply.encode(), Err(CodecError::Oversized { .. })));
    }
}
