//! RESP2 frame type and serialization.

use bytes::{BufMut, Bytes, BytesMut};

/// A single RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Status reply, e.g. `+OK\r\n`.
    Simple(String),

    /// Error reply, e.g. `-ERR unknown command\r\n`.
    Error(String),

    /// Integer reply, e.g. `:42\r\n`.
    Integer(i64),

    /// Binary-safe bulk string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Array of frames, e.g. `*2\r\n+a\r\n+b\r\n`.
    Array(Vec<Frame>),

    /// Null bulk string or null array (`$-1\r\n`, `*-1\r\n`).
    Null,
}

impl Frame {
    /// Builds a command frame: an array of bulk strings.
    pub fn command<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Frame::Array(
            parts
                .into_iter()
                .map(|p| Frame::Bulk(Bytes::copy_from_slice(p.as_ref().as_bytes())))
                .collect(),
        )
    }

    /// Returns the textual payload of a simple or bulk string.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Frame::Simple(s) => Some(s.clone()),
            Frame::Bulk(b) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }

    /// Returns `true` for `+OK`.
    pub fn is_ok(&self) -> bool {
        matches!(self, Frame::Simple(s) if s == "OK")
    }

    /// Appends the wire representation of this frame to `dst`.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Error(msg) => {
                dst.put_u8(b'-');
                dst.put_slice(msg.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                dst.put_u8(b':');
                dst.put_slice(n.to_string().as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Bulk(data) => {
                dst.put_u8(b'$');
                dst.put_slice(data.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            Frame::Array(items) => {
                dst.put_u8(b'*');
                dst.put_slice(items.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                for item in items {
                    item.serialize(dst);
                }
            }
            Frame::Null => dst.put_slice(b"$-1\r\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(frame: &Frame) -> Vec<u8> {
        let mut buf = BytesMut::new();
        frame.serialize(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn command_is_array_of_bulks() {
        let frame = Frame::command(["CLUSTER", "MEET", "127.0.0.1", "7001"]);
        assert_eq!(
            wire(&frame),
            b"*4\r\n$7\r\nCLUSTER\r\n$4\r\nMEET\r\n$9\r\n127.0.0.1\r\n$4\r\n7001\r\n"
        );
    }

    #[test]
    fn scalar_frames() {
        assert_eq!(wire(&Frame::Simple("OK".into())), b"+OK\r\n");
        assert_eq!(wire(&Frame::Error("ERR nope".into())), b"-ERR nope\r\n");
        assert_eq!(wire(&Frame::Integer(-3)), b":-3\r\n");
        assert_eq!(wire(&Frame::Null), b"$-1\r\n");
    }

    #[test]
    fn text_accessors() {
        assert_eq!(Frame::Simple("PONG".into()).as_text().as_deref(), Some("PONG"));
        assert_eq!(
            Frame::Bulk(Bytes::from_static(b"abc")).as_text().as_deref(),
            Some("abc")
        );
        assert!(Frame::Integer(1).as_text().is_none());
        assert!(Frame::Simple("OK".into()).is_ok());
        assert!(!Frame::Simple("QUEUED".into()).is_ok());
    }
}
