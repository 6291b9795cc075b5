//! Response frames.
//!
//! Every response is a six element array:
//!
//! ```text
//! [code, ack-seq | null, message, value | null, db-version | null, failed-seq | null]
//! ```
//!
//! `code` is a simple string such as `SUCCESS` or `INVALID_BATCH`. An
//! unsolicited status has a null ack sequence.

use bytes::Bytes;
use kinetic_core::{Response, Status, StatusCode};

use crate::error::ProtocolError;
use crate::types::Frame;

pub fn encode_response(resp: &Response) -> Frame {
    Frame::Array(vec![
        Frame::Simple(resp.status.code.as_str().to_owned()),
        Frame::integer_or_null(resp.ack_sequence),
        Frame::Bulk(Bytes::copy_from_slice(resp.status.message.as_bytes())),
        Frame::bulk_or_null(resp.value.as_ref()),
        Frame::bulk_or_null(resp.db_version.as_ref()),
        Frame::integer_or_null(resp.failed_sequence),
    ])
}

/// Bytes the encoded response will take on the wire.
pub fn encoded_len(resp: &Response) -> usize {
    fn opt_int(n: Option<u64>) -> usize {
        n.map_or(3, |n| 3 + itoa::Buffer::new().format(n).len())
    }
    fn opt_bulk(b: Option<&Bytes>) -> usize {
        b.map_or(3, |b| bulk(b.len()))
    }
    fn bulk(len: usize) -> usize {
        3 + itoa::Buffer::new().format(len).len() + len + 2
    }

    4 // *6\r\n
        + 3 + resp.status.code.as_str().len()
        + opt_int(resp.ack_sequence)
        + bulk(resp.status.message.len())
        + opt_bulk(resp.value.as_ref())
        + opt_bulk(resp.db_version.as_ref())
        + opt_int(resp.failed_sequence)
}

/// Parses a response frame back into a [`Response`]. Used by clients.
pub fn decode_response(frame: Frame) -> Result<Response, ProtocolError> {
    let Frame::Array(items) = frame else {
        return Err(ProtocolError::InvalidResponse("expected array".into()));
    };
    let [code, ack, message, value, version, failed]: [Frame; 6] = items
        .try_into()
        .map_err(|v: Vec<Frame>| ProtocolError::InvalidResponse(format!("{} elements", v.len())))?;

    let code = match &code {
        Frame::Simple(name) => StatusCode::from_name(name)
            .ok_or_else(|| ProtocolError::InvalidResponse(format!("unknown status '{name}'")))?,
        _ => return Err(ProtocolError::InvalidResponse("status code".into())),
    };
    let message = match message {
        Frame::Bulk(b) => String::from_utf8_lossy(&b).into_owned(),
        Frame::Simple(s) => s,
        _ => return Err(ProtocolError::InvalidResponse("message".into())),
    };

    Ok(Response {
        ack_sequence: opt_u64(ack)?,
        status: Status::new(code, message),
        value: opt_bytes(value)?,
        db_version: opt_bytes(version)?,
        failed_sequence: opt_u64(failed)?,
    })
}

fn opt_u64(frame: Frame) -> Result<Option<u64>, ProtocolError> {
    match frame {
        Frame::Null => Ok(None),
        Frame::Integer(n) if n >= 0 => Ok(Some(n as u64)),
        other => Err(ProtocolError::InvalidResponse(format!("expected sequence, got {other:?}"))),
    }
}

fn opt_bytes(frame: Frame) -> Result<Option<Bytes>, ProtocolError> {
    match frame {
        Frame::Null => Ok(None),
        Frame::Bulk(b) => Ok(Some(b)),
        other => Err(ProtocolError::InvalidResponse(format!("expected bulk, got {other:?}"))),
    }
}
