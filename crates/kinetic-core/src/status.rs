//! Command outcome codes and the response shape handed to the response role.

use std::fmt;

use bytes::Bytes;

/// Outcome classes a drive reports for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    NotAuthorized,
    /// Cluster version on the command doesn't match the drive's.
    VersionFailure,
    InternalError,
    NotFound,
    /// Stored entry version doesn't match the expected version.
    VersionMismatch,
    ServiceBusy,
    Expired,
    NoSpace,
    InvalidRequest,
    InvalidBatch,
    ConnectionTerminated,
}

impl StatusCode {
    /// Upper-case protocol name, e.g. `INVALID_BATCH`.
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Success => "SUCCESS",
            StatusCode::NotAuthorized => "NOT_AUTHORIZED",
            StatusCode::VersionFailure => "VERSION_FAILURE",
            StatusCode::InternalError => "INTERNAL_ERROR",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::VersionMismatch => "VERSION_MISMATCH",
            StatusCode::ServiceBusy => "SERVICE_BUSY",
            StatusCode::Expired => "EXPIRED",
            StatusCode::NoSpace => "NO_SPACE",
            StatusCode::InvalidRequest => "INVALID_REQUEST",
            StatusCode::InvalidBatch => "INVALID_BATCH",
            StatusCode::ConnectionTerminated => "CONNECTION_TERMINATED",
        }
    }

    /// Inverse of [`StatusCode::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        let code = match name {
            "SUCCESS" => StatusCode::Success,
            "NOT_AUTHORIZED" => StatusCode::NotAuthorized,
            "VERSION_FAILURE" => StatusCode::VersionFailure,
            "INTERNAL_ERROR" => StatusCode::InternalError,
            "NOT_FOUND" => StatusCode::NotFound,
            "VERSION_MISMATCH" => StatusCode::VersionMismatch,
            "SERVICE_BUSY" => StatusCode::ServiceBusy,
            "EXPIRED" => StatusCode::Expired,
            "NO_SPACE" => StatusCode::NoSpace,
            "INVALID_REQUEST" => StatusCode::InvalidRequest,
            "INVALID_BATCH" => StatusCode::InvalidBatch,
            "CONNECTION_TERMINATED" => StatusCode::ConnectionTerminated,
            _ => return None,
        };
        Some(code)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn success() -> Self {
        Self::new(StatusCode::Success, "")
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::success()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// Fixed per-response overhead used when estimating encoded size.
const RESPONSE_ENVELOPE_BYTES: usize = 64;

/// What the response role sends back for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Sequence number being acknowledged. `None` for unsolicited statuses.
    pub ack_sequence: Option<u64>,
    pub status: Status,
    pub value: Option<Bytes>,
    pub db_version: Option<Bytes>,
    /// First batch member that failed commit validation.
    pub failed_sequence: Option<u64>,
}

impl Response {
    /// A response acknowledging `sequence` with `status`.
    pub fn ack(sequence: u64, status: Status) -> Self {
        Self {
            ack_sequence: Some(sequence),
            status,
            value: None,
            db_version: None,
            failed_sequence: None,
        }
    }

    /// A status pushed to the client outside of request order.
    pub fn unsolicited(status: Status) -> Self {
        Self {
            ack_sequence: None,
            status,
            value: None,
            db_version: None,
            failed_sequence: None,
        }
    }

    pub fn with_value(mut self, value: Option<Bytes>) -> Self {
        self.value = value;
        self
    }

    pub fn with_db_version(mut self, version: Option<Bytes>) -> Self {
        self.db_version = version;
        self
    }

    /// Rough encoded size, for sinks that don't compute an exact figure.
    pub fn estimated_len(&self) -> usize {
        RESPONSE_ENVELOPE_BYTES
            + self.status.message.len()
            + self.value.as_ref().map_or(0, |v| v.len())
            + self.db_version.as_ref().map_or(0, |v| v.len())
    }
}
