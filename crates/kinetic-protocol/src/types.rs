//! RESP frame types.

use bytes::Bytes;

/// One parsed RESP value. Bulk payloads are `Bytes` so values can move
/// from the socket buffer into the value pool without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `+OK\r\n`
    Simple(String),

    /// `-ERR message\r\n`
    Error(String),

    /// `:42\r\n`
    Integer(i64),

    /// `$5\r\nhello\r\n`
    Bulk(Bytes),

    /// `*2\r\n...`
    Array(Vec<Frame>),

    /// `_\r\n`
    Null,
}

impl Frame {
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null)
    }

    /// Builds a command array of bulk strings from `parts`.
    pub fn command(parts: &[&str]) -> Frame {
        Frame::Array(
            parts
                .iter()
                .map(|p| Frame::Bulk(Bytes::copy_from_slice(p.as_bytes())))
                .collect(),
        )
    }

    /// Bulk or null, depending on whether `data` is present.
    pub fn bulk_or_null(data: Option<&Bytes>) -> Frame {
        data.map_or(Frame::Null, |b| Frame::Bulk(b.clone()))
    }

    /// Integer or null.
    pub fn integer_or_null(n: Option<u64>) -> Frame {
        n.map_or(Frame::Null, |n| Frame::Integer(n as i64))
    }
}
