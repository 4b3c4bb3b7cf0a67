//! Error taxonomy shared by the gateway, the stream bridge and the export engine.

use serde::Serialize;
use std::io::{self, ErrorKind as IoErrorKind};
use thiserror::Error;

use super::service::{TransportCode, TransportError};

/// Discriminant of a [`TransferError`], cheap to copy into results and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    DeviceUnavailable,
    InvalidArgument,
    Io,
    DiskFull,
    Protocol,
    Cancelled,
    Unknown,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("disk full: {0}")]
    DiskFull(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Unknown(String),
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Io(_) => ErrorKind::Io,
            Self::DiskFull(_) => ErrorKind::DiskFull,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Classify an error raised by the local filesystem (export destination side).
    pub fn from_local_io(context: &str, error: &io::Error) -> Self {
        let message = format!("{}: {}", context, error);

        if is_disk_full_error(error) {
            return Self::DiskFull(message);
        }

        match error.kind() {
            IoErrorKind::NotFound => Self::NotFound(message),
            IoErrorKind::PermissionDenied => Self::PermissionDenied(message),
            _ => Self::Io(message),
        }
    }

    /// Convert a native transport failure reported by a device client.
    pub(crate) fn from_transport(device_id: &str, operation: &str, error: TransportError) -> Self {
        let message = format!("{} on {}: {}", operation, device_id, error.message);
        match error.code {
            TransportCode::NotFound => Self::NotFound(message),
            TransportCode::PermissionDenied => Self::PermissionDenied(message),
            TransportCode::Disconnected => Self::DeviceUnavailable(message),
            TransportCode::InvalidHandle => Self::InvalidArgument(message),
            TransportCode::Io | TransportCode::Other => Self::Unknown(message),
        }
    }
}

fn is_disk_full_error(error: &io::Error) -> bool {
    matches!(error.raw_os_error(), Some(code) if code == libc::ENOSPC || code == libc::EDQUOT)
}
