//! Single-pass RESP parser.
//!
//! Parsing is synchronous over a buffered slice. An incomplete frame is
//! reported as `Ok(None)` and nothing is consumed, so the caller can read
//! more bytes and call again with the longer buffer.
//!
//! [`parse_frame_bytes`] slices bulk payloads out of the source `Bytes`
//! without copying; [`parse_frame`] copies them.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::types::Frame;

/// Command arrays are flat; a little nesting is tolerated for responses.
const MAX_NESTING_DEPTH: usize = 8;

/// The longest command form plus every option fits well inside this.
const MAX_ARRAY_ELEMENTS: usize = 64;

/// Upper bound on one bulk payload. Value and message limits are enforced
/// later against the configured limits; this only stops absurd lengths.
const MAX_BULK_LEN: i64 = 64 * 1024 * 1024;

/// Parses one frame, slicing bulk data out of `buf` without copying.
///
/// Returns the frame and how many bytes it used, or `None` when `buf`
/// doesn't hold a whole frame yet.
#[inline]
pub fn parse_frame_bytes(buf: &Bytes) -> Result<Option<(Frame, usize)>, ProtocolError> {
    run(buf.as_ref(), Some(buf))
}

/// Parses one frame from a plain slice. Bulk data is copied.
#[inline]
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    run(buf, None)
}

fn run(buf: &[u8], src: Option<&Bytes>) -> Result<Option<(Frame, usize)>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut reader = Reader { buf, pos: 0, src };
    match reader.frame(0) {
        Ok(frame) => Ok(Some((frame, reader.pos))),
        Err(ProtocolError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    src: Option<&'a Bytes>,
}

impl<'a> Reader<'a> {
    fn frame(&mut self, depth: usize) -> Result<Frame, ProtocolError> {
        match self.byte()? {
            b'+' => Ok(Frame::Simple(self.utf8_line("simple string")?)),
            b'-' => Ok(Frame::Error(self.utf8_line("error string")?)),
            b':' => Ok(Frame::Integer(self.integer()?)),
            b'$' => self.bulk(),
            b'*' => {
                if depth + 1 > MAX_NESTING_DEPTH {
                    return Err(ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH));
                }
                let count = self.integer()?;
                if count < 0 {
                    return Err(ProtocolError::InvalidFrameLength(count));
                }
                let count = count as usize;
                if count > MAX_ARRAY_ELEMENTS {
                    return Err(ProtocolError::TooManyElements(count));
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.frame(depth + 1)?);
                }
                Ok(Frame::Array(items))
            }
            b'_' => {
                self.line()?;
                Ok(Frame::Null)
            }
            other => Err(ProtocolError::InvalidPrefix(other)),
        }
    }

    fn bulk(&mut self) -> Result<Frame, ProtocolError> {
        let len = self.integer()?;
        if len < 0 {
            return Err(ProtocolError::InvalidFrameLength(len));
        }
        if len > MAX_BULK_LEN {
            return Err(ProtocolError::BulkTooLarge(len as usize));
        }
        let len = len as usize;
        let start = self.pos;
        let end = start + len;
        if self.buf.len() < end + 2 {
            return Err(ProtocolError::Incomplete);
        }
        if &self.buf[end..end + 2] != b"\r\n" {
            return Err(ProtocolError::InvalidFrameLength(len as i64));
        }
        self.pos = end + 2;
        let data = match self.src {
            Some(b) => b.slice(start..end),
            None => Bytes::copy_from_slice(&self.buf[start..end]),
        };
        Ok(Frame::Bulk(data))
    }

    fn byte(&mut self) -> Result<u8, ProtocolError> {
        let b = *self.buf.get(self.pos).ok_or(ProtocolError::Incomplete)?;
        self.pos += 1;
        Ok(b)
    }

    /// Bytes up to the next `\r\n`; the cursor moves past the terminator.
    fn line(&mut self) -> Result<&'a [u8], ProtocolError> {
        let buf = self.buf;
        let start = self.pos;
        let mut from = start;
        while let Some(offset) = memchr::memchr(b'\r', &buf[from..]) {
            let cr = from + offset;
            if buf.get(cr + 1) == Some(&b'\n') {
                self.pos = cr + 2;
                return Ok(&buf[start..cr]);
            }
            from = cr + 1;
        }
        Err(ProtocolError::Incomplete)
    }

    fn utf8_line(&mut self, what: &str) -> Result<String, ProtocolError> {
        let line = self.line()?;
        std::str::from_utf8(line)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidCommandFrame(format!("invalid utf-8 in {what}")))
    }

    fn integer(&mut self) -> Result<i64, ProtocolError> {
        let line = self.line()?;
        parse_i64(line)
    }
}

/// Parses a decimal i64 straight from ASCII digits. Negative values
/// accumulate downward so `i64::MIN` parses.
pub(crate) fn parse_i64(digits: &[u8]) -> Result<i64, ProtocolError> {
    let (negative, digits) = match digits.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, digits),
    };
    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        let d = (b - b'0') as i64;
        n = n
            .checked_mul(10)
            .and_then(|n| if negative { n.checked_sub(d) } else { n.checked_add(d) })
            .ok_or(ProtocolError::InvalidInteger)?;
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whole(input: &[u8]) -> Frame {
        let (frame, used) = parse_frame(input).unwrap().unwrap();
        assert_eq!(used, input.len());
        frame
    }

    #[test]
    fn scalars() {
        assert_eq!(whole(b"+OK\r\n"), Frame::Simple("OK".into()));
        assert_eq!(whole(b"-ERR nope\r\n"), Frame::Error("ERR nope".into()));
        assert_eq!(whole(b":-12\r\n"), Frame::Integer(-12));
        assert_eq!(whole(b"_\r\n"), Frame::Null);
        assert_eq!(whole(b"$0\r\n\r\n"), Frame::Bulk(Bytes::new()));
    }

    #[test]
    fn binary_bulk_with_embedded_crlf() {
        assert_eq!(
            whole(b"$4\r\na\r\nb\r\n"),
            Frame::Bulk(Bytes::from_static(b"a\r\nb"))
        );
    }

    #[test]
    fn command_array() {
        assert_eq!(
            whole(b"*3\r\n$3\r\nPUT\r\n$1\r\nk\r\n$1\r\nv\r\n"),
            Frame::command(&["PUT", "k", "v"])
        );
    }

    #[test]
    fn partial_input_is_not_an_error() {
        for input in [&b"+OK"[..], b"$5\r\nhel", b"*2\r\n:1\r\n", b":1\r"] {
            assert_eq!(parse_frame(input).unwrap(), None, "{input:?}");
        }
    }

    #[test]
    fn stops_at_frame_boundary() {
        let (frame, used) = parse_frame(b":1\r\n:2\r\n").unwrap().unwrap();
        assert_eq!(frame, Frame::Integer(1));
        assert_eq!(used, 4);
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(
            parse_frame(b"~x\r\n").unwrap_err(),
            ProtocolError::InvalidPrefix(b'~')
        );
        assert_eq!(parse_frame(b":1x\r\n").unwrap_err(), ProtocolError::InvalidInteger);
        assert_eq!(
            parse_frame(b"$-1\r\n").unwrap_err(),
            ProtocolError::InvalidFrameLength(-1)
        );
        assert_eq!(
            parse_frame(b"$2\r\nabc\r\n").unwrap_err(),
            ProtocolError::InvalidFrameLength(2)
        );
        assert!(matches!(
            parse_frame(b"*65\r\n").unwrap_err(),
            ProtocolError::TooManyElements(65)
        ));
    }

    #[test]
    fn nesting_limit() {
        let mut ok = b"*1\r\n".repeat(MAX_NESTING_DEPTH);
        ok.extend_from_slice(b":1\r\n");
        assert!(parse_frame(&ok).unwrap().is_some());

        let mut deep = b"*1\r\n".repeat(MAX_NESTING_DEPTH + 1);
        deep.extend_from_slice(b":1\r\n");
        assert_eq!(
            parse_frame(&deep).unwrap_err(),
            ProtocolError::NestingTooDeep(MAX_NESTING_DEPTH)
        );
    }

    #[test]
    fn zero_copy_slices_source() {
        let src = Bytes::from_static(b"$5\r\nhello\r\n");
        let (frame, _) = parse_frame_bytes(&src).unwrap().unwrap();
        let Frame::Bulk(data) = frame else {
            panic!("expected bulk");
        };
        assert_eq!(&data[..], b"hello");
        assert_eq!(data.as_ptr(), src[4..].as_ptr());
    }

    #[test]
    fn integer_edges() {
        assert_eq!(parse_i64(b"9223372036854775807").unwrap(), i64::MAX);
        assert_eq!(parse_i64(b"-9223372036854775808").unwrap(), i64::MIN);
        assert!(parse_i64(b"9223372036854775808").is_err());
        assert!(parse_i64(b"-").is_err());
        assert!(parse_i64(b"").is_err());
    }
}
