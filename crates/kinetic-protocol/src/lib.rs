//! kinetic-protocol: RESP framing for the drive server's command edge.
//!
//! This is a text-friendly adapter, not the Kinetic protobuf wire format.
//! Clients send arrays such as `PUT key value SEQ 1 SYNC writeback`; the
//! server answers each with a six element array describing the
//! [`Response`](kinetic_core::Response).
//!
//! ```
//! use bytes::BytesMut;
//! use kinetic_protocol::{parse_frame, CommandDecoder, Frame};
//!
//! let mut buf = BytesMut::new();
//! Frame::command(&["GET", "k1"]).serialize(&mut buf);
//!
//! let (frame, consumed) = parse_frame(&buf).unwrap().unwrap();
//! assert_eq!(consumed, buf.len());
//!
//! let mut decoder = CommandDecoder::new();
//! let incoming = decoder.decode(frame).unwrap();
//! assert_eq!(incoming.command.sequence, 1);
//! ```

pub mod command;
pub mod error;
pub mod parse;
pub mod response;
mod serialize;
pub mod types;

pub use command::{encode_command, CommandDecoder};
pub use error::ProtocolError;
pub use parse::{parse_frame, parse_frame_bytes};
pub use response::{decode_response, encode_response, encoded_len};
pub use types::Frame;
