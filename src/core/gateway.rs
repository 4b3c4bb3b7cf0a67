//! Serialized access to one device's file-service channel.
//!
//! Every operation takes the device lock for its whole duration, so calls from
//! stream connections, export workers and ad hoc UI listings are totally
//! ordered per device. Teardown takes the same lock before releasing the
//! clients, and afterwards every operation fails fast with
//! [`TransferError::DeviceUnavailable`].
//!
//! The underlying protocol is synchronous; async callers run gateway calls
//! through `tokio::task::spawn_blocking`.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use super::error::{Result, TransferError};
use super::service::{DirEntry, FileService, FileStat, OpenMode, RemoteFd, TransportResult};

/// Which root filesystem view of the device an operation addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    #[default]
    Primary,
    /// Secondary root view of the same physical device.
    Alternate,
}

/// A remote file descriptor handed out by the gateway.
///
/// Only the gateway can turn it back into a native descriptor, and only while
/// the owning device is still attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileChannelHandle {
    id: u64,
    channel: Channel,
}

impl FileChannelHandle {
    pub fn channel(&self) -> Channel {
        self.channel
    }
}

struct OpenFile {
    channel: Channel,
    fd: RemoteFd,
    path: String,
}

struct DeviceClients {
    primary: Option<Box<dyn FileService>>,
    alternate: Option<Box<dyn FileService>>,
    has_alternate: bool,
    available: bool,
    open: HashMap<u64, OpenFile>,
}

impl DeviceClients {
    fn client(&mut self, device_id: &str, channel: Channel) -> Result<&mut dyn FileService> {
        let slot = match channel {
            Channel::Primary => &mut self.primary,
            Channel::Alternate => {
                if !self.has_alternate {
                    return Err(TransferError::InvalidArgument(format!(
                        "device {} has no alternate channel",
                        device_id
                    )));
                }
                &mut self.alternate
            }
        };

        match slot {
            Some(client) => Ok(client.as_mut()),
            None => Err(unavailable(device_id)),
        }
    }

    fn lookup(&self, device_id: &str, handle: &FileChannelHandle) -> Result<(Channel, RemoteFd)> {
        self.open
            .get(&handle.id)
            .map(|f| (f.channel, f.fd))
            .ok_or_else(|| {
                TransferError::InvalidArgument(format!(
                    "file handle {} is not open on {}",
                    handle.id, device_id
                ))
            })
    }

    /// Release every client exactly once. Callers hold the device lock.
    fn teardown(&mut self, device_id: &str) -> bool {
        if !self.available {
            return false;
        }
        self.available = false;

        let leaked = self.open.len();
        self.open.clear();
        if leaked > 0 {
            warn!(device = %device_id, open_handles = leaked, "Tearing down with open file handles");
        }

        for mut client in [self.primary.take(), self.alternate.take()].into_iter().flatten() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| client.shutdown())) {
                warn!(
                    device = %device_id,
                    panic = %panic_message(&payload),
                    "File service panicked during shutdown"
                );
            }
        }
        true
    }
}

/// One attached device: its file-service clients and the lock guarding them.
pub struct DeviceHandle {
    id: String,
    clients: Mutex<DeviceClients>,
    next_handle: AtomicU64,
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        let clients = self.clients.get_mut().unwrap_or_else(|e| e.into_inner());
        if clients.teardown(&self.id) {
            debug!(device = %self.id, "Device handle dropped while attached");
        }
    }
}

/// Cheap-to-clone front door to a [`DeviceHandle`].
#[derive(Clone)]
pub struct DeviceChannelGateway {
    device: Arc<DeviceHandle>,
}

impl DeviceChannelGateway {
    pub fn new(
        device_id: impl Into<String>,
        primary: Box<dyn FileService>,
        alternate: Option<Box<dyn FileService>>,
    ) -> Self {
        let has_alternate = alternate.is_some();
        Self {
            device: Arc::new(DeviceHandle {
                id: device_id.into(),
                clients: Mutex::new(DeviceClients {
                    primary: Some(primary),
                    alternate,
                    has_alternate,
                    available: true,
                    open: HashMap::new(),
                }),
                next_handle: AtomicU64::new(1),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    pub fn is_available(&self) -> bool {
        self.lock().available
    }

    pub fn has_alternate(&self) -> bool {
        self.lock().has_alternate
    }

    pub fn open_file(&self, channel: Channel, path: &str, mode: OpenMode) -> Result<FileChannelHandle> {
        let device_id = self.device_id();
        let mut clients = self.acquire()?;

        let client = clients.client(device_id, channel)?;
        let fd = invoke(device_id, "open", || client.open(path, mode))?;

        let id = self.device.next_handle.fetch_add(1, Ordering::Relaxed);
        clients.open.insert(
            id,
            OpenFile {
                channel,
                fd,
                path: path.to_string(),
            },
        );

        debug!(device = %device_id, path = %path, ?mode, handle = id, "Opened device file");
        Ok(FileChannelHandle { id, channel })
    }

    /// Read up to `max_bytes`. An empty buffer means end of file.
    pub fn read_file(&self, handle: &FileChannelHandle, max_bytes: usize) -> Result<Vec<u8>> {
        if max_bytes == 0 {
            return Err(TransferError::InvalidArgument(
                "read size must be greater than zero".to_string(),
            ));
        }

        let device_id = self.device_id();
        let mut clients = self.acquire()?;
        let (channel, fd) = clients.lookup(device_id, handle)?;
        let client = clients.client(device_id, channel)?;

        let mut buf = vec![0u8; max_bytes];
        let n = invoke(device_id, "read", || client.read(fd, &mut buf))?;
        buf.truncate(n.min(max_bytes));

        trace!(device = %device_id, handle = handle.id, bytes = buf.len(), "Read chunk");
        Ok(buf)
    }

    pub fn write_file(&self, handle: &FileChannelHandle, data: &[u8]) -> Result<usize> {
        let device_id = self.device_id();
        let mut clients = self.acquire()?;
        let (channel, fd) = clients.lookup(device_id, handle)?;
        let client = clients.client(device_id, channel)?;

        invoke(device_id, "write", || client.write(fd, data))
    }

    pub fn seek_file(&self, handle: &FileChannelHandle, offset: u64) -> Result<()> {
        let device_id = self.device_id();
        let mut clients = self.acquire()?;
        let (channel, fd) = clients.lookup(device_id, handle)?;
        let client = clients.client(device_id, channel)?;

        invoke(device_id, "seek", || client.seek(fd, offset))
    }

    /// Close a handle. Closing an already-closed handle is a no-op.
    pub fn close_file(&self, handle: &FileChannelHandle) -> Result<()> {
        let device_id = self.device_id();
        let mut clients = self.acquire()?;

        let Some(file) = clients.open.remove(&handle.id) else {
            return Ok(());
        };

        let client = clients.client(device_id, file.channel)?;
        let result = invoke(device_id, "close", || client.close(file.fd));
        debug!(device = %device_id, path = %file.path, handle = handle.id, "Closed device file");
        result
    }

    /// List a directory, statting each entry under the same lock acquisition.
    pub fn list_directory(&self, channel: Channel, path: &str) -> Result<Vec<DirEntry>> {
        let device_id = self.device_id();
        let mut clients = self.acquire()?;
        let client = clients.client(device_id, channel)?;

        let names = invoke(device_id, "list", || client.list(path))?;
        let mut entries = Vec::with_capacity(names.len());

        for name in names {
            if name == "." || name == ".." {
                continue;
            }
            let child = join_device_path(path, &name);
            match invoke(device_id, "stat", || client.stat(&child)) {
                Ok(stat) => entries.push(DirEntry { name, stat }),
                Err(e @ TransferError::DeviceUnavailable(_)) => return Err(e),
                Err(e) => {
                    debug!(device = %device_id, path = %child, error = %e, "Skipping unreadable entry");
                }
            }
        }

        Ok(entries)
    }

    pub fn stat_file(&self, channel: Channel, path: &str) -> Result<FileStat> {
        let device_id = self.device_id();
        let mut clients = self.acquire()?;
        let client = clients.client(device_id, channel)?;

        invoke(device_id, "stat", || client.stat(path))
    }

    /// Tear the device down. Waits for any in-flight operation, then releases
    /// the clients. Returns `true` only for the call that performed the teardown.
    pub fn detach(&self) -> bool {
        let torn_down = self.lock().teardown(self.device_id());
        if torn_down {
            info!(device = %self.device_id(), "Device detached");
        }
        torn_down
    }

    /// Run gateway calls from async code without stalling the runtime while
    /// waiting on the device lock.
    pub async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&DeviceChannelGateway) -> Result<T> + Send + 'static,
    {
        let gateway = self.clone();
        tokio::task::spawn_blocking(move || op(&gateway))
            .await
            .map_err(|e| TransferError::Unknown(format!("device task failed: {}", e)))?
    }

    fn lock(&self) -> MutexGuard<'_, DeviceClients> {
        self.device.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn acquire(&self) -> Result<MutexGuard<'_, DeviceClients>> {
        let clients = self.lock();
        if !clients.available {
            return Err(unavailable(self.device_id()));
        }
        Ok(clients)
    }
}

/// Join a device directory path and an entry name with a single separator.
pub fn join_device_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    format!("{}/{}", dir, name.trim_start_matches('/'))
}

/// Run one transport call, converting native errors and panics to the taxonomy.
fn invoke<T>(device_id: &str, operation: &str, call: impl FnOnce() -> TransportResult<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TransferError::from_transport(device_id, operation, e)),
        Err(payload) => {
            let message = panic_message(&payload);
            warn!(device = %device_id, operation, panic = %message, "File service panicked");
            Err(TransferError::Unknown(format!(
                "{} on {} panicked: {}",
                operation, device_id, message
            )))
        }
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn unavailable(device_id: &str) -> TransferError {
    TransferError::DeviceUnavailable(format!("device {} is detached", device_id))
}
