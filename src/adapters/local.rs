use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use crate::core::service::{
    FileService, FileStat, OpenMode, RemoteFd, TransportCode, TransportError, TransportResult,
};

/// File service over a local directory tree, e.g. the mount point of a
/// device's exported filesystem. Device paths are resolved below `root`.
pub struct LocalDirService {
    root: PathBuf,
    open: HashMap<RemoteFd, File>,
    next_fd: RemoteFd,
}

impl LocalDirService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: HashMap::new(),
            next_fd: 1,
        }
    }

    fn resolve(&self, device_path: &str) -> TransportResult<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(device_path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(TransportError::new(
                        TransportCode::PermissionDenied,
                        format!("path escapes device root: {}", device_path),
                    ));
                }
            }
        }
        Ok(resolved)
    }

    fn file(&mut self, fd: RemoteFd) -> TransportResult<&mut File> {
        self.open
            .get_mut(&fd)
            .ok_or_else(|| TransportError::new(TransportCode::InvalidHandle, format!("fd {}", fd)))
    }

    fn map_io(&self, context: &str, error: io::Error) -> TransportError {
        // A vanished root means the mount went away, whatever the errno says.
        let code = if is_device_removed_error(&error) || !self.root.exists() {
            TransportCode::Disconnected
        } else {
            match error.kind() {
                ErrorKind::NotFound => TransportCode::NotFound,
                ErrorKind::PermissionDenied => TransportCode::PermissionDenied,
                _ => TransportCode::Io,
            }
        };
        TransportError::new(code, format!("{}: {}", context, error))
    }
}

impl FileService for LocalDirService {
    fn open(&mut self, path: &str, mode: OpenMode) -> TransportResult<RemoteFd> {
        let local = self.resolve(path)?;

        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Write => options.write(true).create(true).truncate(true),
            OpenMode::ReadWrite => options.read(true).write(true),
            OpenMode::Append => options.append(true).create(true),
        };

        let file = options.open(&local).map_err(|e| self.map_io(path, e))?;
        if file.metadata().map(|m| m.is_dir()).unwrap_or(false) {
            return Err(TransportError::new(
                TransportCode::Other,
                format!("{} is a directory", path),
            ));
        }

        let fd = self.next_fd;
        self.next_fd += 1;
        self.open.insert(fd, file);
        Ok(fd)
    }

    fn read(&mut self, fd: RemoteFd, buf: &mut [u8]) -> TransportResult<usize> {
        let result = self.file(fd)?.read(buf);
        result.map_err(|e| self.map_io("read", e))
    }

    fn write(&mut self, fd: RemoteFd, data: &[u8]) -> TransportResult<usize> {
        let result = self.file(fd)?.write(data);
        result.map_err(|e| self.map_io("write", e))
    }

    fn seek(&mut self, fd: RemoteFd, offset: u64) -> TransportResult<()> {
        let result = self.file(fd)?.seek(SeekFrom::Start(offset));
        result.map(|_| ()).map_err(|e| self.map_io("seek", e))
    }

    fn close(&mut self, fd: RemoteFd) -> TransportResult<()> {
        self.open
            .remove(&fd)
            .map(drop)
            .ok_or_else(|| TransportError::new(TransportCode::InvalidHandle, format!("fd {}", fd)))
    }

    fn list(&mut self, path: &str) -> TransportResult<Vec<String>> {
        let local = self.resolve(path)?;
        let entries = fs::read_dir(&local).map_err(|e| self.map_io(path, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.map_io(path, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn stat(&mut self, path: &str) -> TransportResult<FileStat> {
        let local = self.resolve(path)?;
        let metadata = fs::metadata(&local).map_err(|e| self.map_io(path, e))?;

        Ok(FileStat {
            is_directory: metadata.is_dir(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified: metadata.modified().ok(),
        })
    }

    fn shutdown(&mut self) {
        self.open.clear();
    }
}

/// Check if an I/O error indicates the device has been removed
fn is_device_removed_error(error: &io::Error) -> bool {
    match error.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected => true,
        _ => matches!(
            error.raw_os_error(),
            Some(libc::EIO | libc::ENODEV | libc::ENXIO | libc::ENOMEDIUM | libc::EMEDIUMTYPE)
        ),
    }
}
