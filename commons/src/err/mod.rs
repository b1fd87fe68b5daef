use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::rpc::ServiceId;

pub type Result<T> = std::result::Result<T, GraphFlowError>;

/// Error taxonomy for the whole workspace. Local misuse raises at the call
/// site; transport faults are retried only during connection establishment.
#[derive(Debug, Error)]
pub enum GraphFlowError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("id {id} out of range, global count is {count}")]
    OutOfRange { id: u64, count: u64 },

    #[error("id {id} is not owned by partition {part_id}")]
    ForeignId { id: u64, part_id: usize },

    #[error("service {0} already registered with a different type pair")]
    DuplicateService(ServiceId),

    #[error("service {0} is not registered")]
    UnknownService(ServiceId),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("remote processing failed for service {service_id} ({status}): {message}")]
    RemoteProcessing {
        service_id: ServiceId,
        status: StatusCode,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl GraphFlowError {
    pub fn config(msg: impl Into<String>) -> Self {
        GraphFlowError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        GraphFlowError::Internal(msg.into())
    }

    /// Status code reported on the wire when this error aborts a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GraphFlowError::UnknownService(_) => StatusCode::HandlerNotFound,
            GraphFlowError::Deserialization(_) => StatusCode::InvalidRequest,
            GraphFlowError::OutOfRange { .. } | GraphFlowError::ForeignId { .. } => {
                StatusCode::OutOfRange
            }
            _ => StatusCode::RequestHandlerError,
        }
    }
}

/// Failure class shipped across machines in error frames. A server never
/// sends a Rust error value to a client, only a status and a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    InvalidRequest = 1,
    HandlerNotFound = 2,
    RequestHandlerError = 3,
    OutOfRange = 4,
    ShuttingDown = 5,
    Internal = 6,
}

impl StatusCode {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => StatusCode::Ok,
            1 => StatusCode::InvalidRequest,
            2 => StatusCode::HandlerNotFound,
            3 => StatusCode::RequestHandlerError,
            4 => StatusCode::OutOfRange,
            5 => StatusCode::ShuttingDown,
            _ => StatusCode::Internal,
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, StatusCode::Ok)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::InvalidRequest => "INVALID_REQUEST",
            StatusCode::HandlerNotFound => "HANDLER_NOT_FOUND",
            StatusCode::RequestHandlerError => "REQUEST_HANDLER_ERROR",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::ShuttingDown => "SHUTTING_DOWN",
            StatusCode::Internal => "INTERNAL",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_round_trip() {
        for code in [
            StatusCode::Ok,
            StatusCode::InvalidRequest,
            StatusCode::HandlerNotFound,
            StatusCode::RequestHandlerError,
            StatusCode::OutOfRange,
            StatusCode::ShuttingDown,
            StatusCode::Internal,
        ] {
            assert_eq!(StatusCode::from_u8(code.to_u8()), code);
        }
    }

    #[test]
    fn error_maps_to_wire_status() {
        assert_eq!(
            GraphFlowError::UnknownService(7).status_code(),
            StatusCode::HandlerNotFound
        );
        assert_eq!(
            GraphFlowError::Deserialization("bad".into()).status_code(),
            StatusCode::InvalidRequest
        );
    }
}
