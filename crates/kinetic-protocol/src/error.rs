//! Errors raised while framing or decoding commands and responses.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not enough bytes buffered for a whole frame yet.
    #[error("incomplete frame: need more data")]
    Incomplete,

    #[error("invalid type prefix: {0:#04x}")]
    InvalidPrefix(u8),

    #[error("invalid integer encoding")]
    InvalidInteger,

    #[error("invalid frame length: {0}")]
    InvalidFrameLength(i64),

    #[error("bulk string too large: {0} bytes")]
    BulkTooLarge(usize),

    #[error("too many elements: {0}")]
    TooManyElements(usize),

    #[error("frames nested deeper than {0} levels")]
    NestingTooDeep(usize),

    #[error("invalid command frame: {0}")]
    InvalidCommandFrame(String),

    #[error("wrong number of arguments for '{0}'")]
    WrongArity(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("invalid response frame: {0}")]
    InvalidResponse(String),
}
