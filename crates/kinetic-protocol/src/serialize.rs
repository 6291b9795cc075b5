//! Writes frames straight into a `BytesMut`.

use bytes::{BufMut, BytesMut};

use crate::types::Frame;

impl Frame {
    /// Appends the wire form of this frame to `dst`.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => line(dst, b'+', s.as_bytes()),
            Frame::Error(msg) => line(dst, b'-', msg.as_bytes()),
            Frame::Integer(n) => {
                dst.put_u8(b':');
                put_i64(*n, dst);
                dst.put_slice(b"\r\n");
            }
            Frame::Bulk(data) => {
                header(dst, b'$', data.len());
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            Frame::Array(items) => {
                header(dst, b'*', items.len());
                for item in items {
                    item.serialize(dst);
                }
            }
            Frame::Null => dst.put_slice(b"_\r\n"),
        }
    }

    /// Exact number of bytes [`Frame::serialize`] would write.
    pub fn wire_len(&self) -> usize {
        match self {
            Frame::Simple(s) => 3 + s.len(),
            Frame::Error(s) => 3 + s.len(),
            Frame::Integer(n) => 3 + itoa::Buffer::new().format(*n).len(),
            Frame::Bulk(data) => header_len(data.len()) + data.len() + 2,
            Frame::Array(items) => {
                header_len(items.len()) + items.iter().map(Frame::wire_len).sum::<usize>()
            }
            Frame::Null => 3,
        }
    }
}

fn line(dst: &mut BytesMut, prefix: u8, body: &[u8]) {
    dst.put_u8(prefix);
    dst.put_slice(body);
    dst.put_slice(b"\r\n");
}

fn header(dst: &mut BytesMut, prefix: u8, len: usize) {
    dst.put_u8(prefix);
    put_i64(len as i64, dst);
    dst.put_slice(b"\r\n");
}

fn header_len(len: usize) -> usize {
    3 + itoa::Buffer::new().format(len).len()
}

fn put_i64(val: i64, dst: &mut BytesMut) {
    let mut buf = itoa::Buffer::new();
    dst.put_slice(buf.format(val).as_bytes());
}
