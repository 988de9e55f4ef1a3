//! Incremental RESP2 parser.
//!
//! The parser works on whatever bytes have been read so far. When the
//! buffer does not hold a complete frame it reports `Ok(None)` and
//! consumes nothing, so the caller can read more and retry.

use std::io::Cursor;

use bytes::Bytes;

use crate::error::WireError;
use crate::frame::Frame;

/// Maximum nesting depth for arrays.
const MAX_NESTING_DEPTH: usize = 32;

/// Cap for the initial array allocation; declared counts above this grow
/// organically as elements arrive.
const PREALLOC_CAP: usize = 1024;

enum Fail {
    Incomplete,
    Invalid(WireError),
}

impl From<WireError> for Fail {
    fn from(e: WireError) -> Self {
        Fail::Invalid(e)
    }
}

/// Parses one frame from the start of `buf`.
///
/// Returns `Ok(Some((frame, consumed)))` for a complete frame, `Ok(None)`
/// when more data is needed, and an error for malformed input.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, WireError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);
    match try_parse(&mut cursor, 0) {
        Ok(frame) => Ok(Some((frame, cursor.position() as usize))),
        Err(Fail::Incomplete) => Ok(None),
        Err(Fail::Invalid(e)) => Err(e),
    }
}

fn try_parse(cursor: &mut Cursor<&[u8]>, depth: usize) -> Result<Frame, Fail> {
    match read_byte(cursor)? {
        b'+' => {
            let line = read_line(cursor)?;
            let s = std::str::from_utf8(line).map_err(|_| WireError::InvalidUtf8("status reply"))?;
            Ok(Frame::Simple(s.to_owned()))
        }
        b'-' => {
            let line = read_line(cursor)?;
            let s = std::str::from_utf8(line).map_err(|_| WireError::InvalidUtf8("error reply"))?;
            Ok(Frame::Error(s.to_owned()))
        }
        b':' => Ok(Frame::Integer(read_integer_line(cursor)?)),
        b'$' => {
            let len = read_integer_line(cursor)?;
            if len == -1 {
                return Ok(Frame::Null);
            }
            if len < 0 {
                return Err(WireError::InvalidFrameLength(len).into());
            }
            let len = len as usize;

            let pos = cursor.position() as usize;
            let buf = *cursor.get_ref();
            if buf.len() < pos + len + 2 {
                return Err(Fail::Incomplete);
            }
            if &buf[pos + len..pos + len + 2] != b"\r\n" {
                return Err(WireError::InvalidFrameLength(len as i64).into());
            }
            cursor.set_position((pos + len + 2) as u64);
            Ok(Frame::Bulk(Bytes::copy_from_slice(&buf[pos..pos + len])))
        }
        b'*' => {
            if depth + 1 > MAX_NESTING_DEPTH {
                return Err(WireError::InvalidFrameLength(depth as i64 + 1).into());
            }
            let count = read_integer_line(cursor)?;
            if count == -1 {
                return Ok(Frame::Null);
            }
            if count < 0 {
                return Err(WireError::InvalidFrameLength(count).into());
            }
            let count = count as usize;
            let mut frames = Vec::with_capacity(count.min(PREALLOC_CAP));
            for _ in 0..count {
                frames.push(try_parse(cursor, depth + 1)?);
            }
            Ok(Frame::Array(frames))
        }
        other => Err(WireError::InvalidPrefix(other).into()),
    }
}

fn read_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8, Fail> {
    let pos = cursor.position() as usize;
    let byte = *cursor.get_ref().get(pos).ok_or(Fail::Incomplete)?;
    cursor.set_position((pos + 1) as u64);
    Ok(byte)
}

/// Returns the bytes before the next CRLF and advances past it.
fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Fail> {
    let buf: &'a [u8] = *cursor.get_ref();
    let start = cursor.position() as usize;
    let rest = buf.get(start..).ok_or(Fail::Incomplete)?;
    let offset = rest
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or(Fail::Incomplete)?;
    cursor.set_position((start + offset + 2) as u64);
    Ok(&buf[start..start + offset])
}

fn read_integer_line(cursor: &mut Cursor<&[u8]>) -> Result<i64, Fail> {
    let line = read_line(cursor)?;
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(Fail::Invalid(WireError::InvalidInteger))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn parse_complete(input: &[u8]) -> Frame {
        let (frame, consumed) = parse_frame(input).unwrap().unwrap();
        assert_eq!(consumed, input.len());
        frame
    }

    #[test]
    fn status_and_error_replies() {
        assert_eq!(parse_complete(b"+OK\r\n"), Frame::Simple("OK".into()));
        assert_eq!(
            parse_complete(b"-ERR Unknown node abc\r\n"),
            Frame::Error("ERR Unknown node abc".into())
        );
        assert_eq!(parse_complete(b":16384\r\n"), Frame::Integer(16384));
    }

    #[test]
    fn bulk_and_null_bulk() {
        assert_eq!(
            parse_complete(b"$13\r\ncluster_state\r\n"),
            Frame::Bulk(Bytes::from_static(b"cluster_state"))
        );
        assert_eq!(parse_complete(b"$-1\r\n"), Frame::Null);
        assert_eq!(parse_complete(b"*-1\r\n"), Frame::Null);
    }

    #[test]
    fn nested_array() {
        let frame = parse_complete(b"*2\r\n:1\r\n*1\r\n+x\r\n");
        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::Integer(1),
                Frame::Array(vec![Frame::Simple("x".into())])
            ])
        );
    }

    #[test]
    fn trailing_bytes_are_left_for_next_frame() {
        let (frame, consumed) = parse_frame(b"+OK\r\n+PONG\r\n").unwrap().unwrap();
        assert_eq!(frame, Frame::Simple("OK".into()));
        assert_eq!(consumed, 5);
    }

    #[test_case(b"" ; "empty")]
    #[test_case(b"+OK" ; "status without crlf")]
    #[test_case(b"$5\r\nhel" ; "short bulk")]
    #[test_case(b"*2\r\n:1\r\n" ; "short array")]
    fn incomplete_input_needs_more_data(input: &[u8]) {
        assert!(parse_frame(input).unwrap().is_none());
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(
            parse_frame(b"!oops\r\n"),
            Err(WireError::InvalidPrefix(b'!'))
        ));
        assert!(matches!(
            parse_frame(b":12x\r\n"),
            Err(WireError::InvalidInteger)
        ));
        assert!(matches!(
            parse_frame(b"$3\r\nabcd\r\n"),
            Err(WireError::InvalidFrameLength(3))
        ));
    }
}
