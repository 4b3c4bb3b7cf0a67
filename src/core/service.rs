//! The device's file-service client, as seen by the gateway.
//!
//! Implementations wrap whatever native transport talks to the physical
//! device. They are never shared: the gateway owns each client exclusively
//! and calls it only while holding the device lock, so methods take `&mut self`.

use serde::Serialize;
use std::fmt;
use std::time::SystemTime;

/// Raw descriptor returned by a client's `open`. Only meaningful to that client.
pub type RemoteFd = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate.
    Write,
    ReadWrite,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub is_directory: bool,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub stat: FileStat,
}

/// Native failure category reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCode {
    NotFound,
    PermissionDenied,
    /// The device went away underneath the client.
    Disconnected,
    InvalidHandle,
    Io,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub code: TransportCode,
    pub message: String,
}

impl TransportError {
    pub fn new(code: TransportCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for TransportError {}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

pub trait FileService: Send {
    fn open(&mut self, path: &str, mode: OpenMode) -> TransportResult<RemoteFd>;

    /// Read into `buf`. Returns 0 at end of file.
    fn read(&mut self, fd: RemoteFd, buf: &mut [u8]) -> TransportResult<usize>;

    fn write(&mut self, fd: RemoteFd, data: &[u8]) -> TransportResult<usize>;

    /// Absolute seek from the start of the file.
    fn seek(&mut self, fd: RemoteFd, offset: u64) -> TransportResult<()>;

    fn close(&mut self, fd: RemoteFd) -> TransportResult<()>;

    /// Names of the entries in a directory. May include `.` and `..`.
    fn list(&mut self, path: &str) -> TransportResult<Vec<String>>;

    fn stat(&mut self, path: &str) -> TransportResult<FileStat>;

    /// Release the native client. Called exactly once, during teardown.
    fn shutdown(&mut self) {}
}
