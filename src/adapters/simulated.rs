use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use crate::core::service::{
    FileService, FileStat, OpenMode, RemoteFd, TransportCode, TransportError, TransportResult,
};

/// Counters observed by tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatedStats {
    pub calls: usize,
    pub closes: usize,
    pub shutdowns: usize,
    /// Calls that started while another call was still inside the client.
    pub overlapping_calls: usize,
}

struct OpenSimFile {
    path: String,
    pos: u64,
}

struct SimState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    denied: HashSet<String>,
    open: HashMap<RemoteFd, OpenSimFile>,
    next_fd: RemoteFd,
    latency: Duration,
    disconnected: bool,
    panic_on_read: bool,
    modified: SystemTime,
    stats: SimulatedStats,
}

/// An in-memory device. The handle is a controller: clone it freely, hand
/// [`SimulatedDevice::service`] to a gateway, and inject faults from tests.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
    in_flight: Arc<AtomicUsize>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_string());

        Self {
            state: Arc::new(Mutex::new(SimState {
                files: BTreeMap::new(),
                dirs,
                denied: HashSet::new(),
                open: HashMap::new(),
                next_fd: 3,
                latency: Duration::ZERO,
                disconnected: false,
                panic_on_read: false,
                modified: SystemTime::now(),
                stats: SimulatedStats::default(),
            })),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A device pre-populated with a few camera-roll style files.
    pub fn seeded() -> Self {
        let device = Self::new();
        device.add_file("/DCIM/100APPLE/IMG_0001.JPG", pattern(256 * 1024));
        device.add_file("/DCIM/100APPLE/IMG_0002.MOV", pattern(3 * 1024 * 1024));
        device.add_file("/DCIM/100APPLE/IMG_0003.HEIC", pattern(512 * 1024));
        device.add_file("/Downloads/notes.txt", b"device notes\n".to_vec());
        device
    }

    pub fn service(&self) -> SimulatedService {
        SimulatedService {
            device: self.clone(),
        }
    }

    pub fn add_file(&self, path: &str, content: Vec<u8>) {
        let path = normalize(path);
        let mut state = self.lock();
        add_parents(&mut state.dirs, &path);
        state.files.insert(path, content);
    }

    pub fn add_dir(&self, path: &str) {
        let path = normalize(path);
        let mut state = self.lock();
        add_parents(&mut state.dirs, &path);
        state.dirs.insert(path);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(&normalize(path)).cloned()
    }

    pub fn deny(&self, path: &str) {
        self.lock().denied.insert(normalize(path));
    }

    /// Delay applied inside every client call.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Simulate the transport losing the device (cable pulled).
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
    }

    pub fn panic_on_read(&self, enabled: bool) {
        self.lock().panic_on_read = enabled;
    }

    pub fn stats(&self) -> SimulatedStats {
        self.lock().stats
    }

    pub fn open_count(&self) -> usize {
        self.lock().open.len()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct SimulatedService {
    device: SimulatedDevice,
}

impl SimulatedService {
    /// Enter the client, sleep for the configured latency outside the state
    /// lock, then run `op`. Overlapping entries are counted.
    fn call<T>(&self, op: impl FnOnce(&mut SimState) -> TransportResult<T>) -> TransportResult<T> {
        let previously_inside = self.device.in_flight.fetch_add(1, Ordering::SeqCst);
        let _inside = InFlight(&self.device.in_flight);
        let latency = {
            let mut state = self.device.lock();
            state.stats.calls += 1;
            if previously_inside > 0 {
                state.stats.overlapping_calls += 1;
            }
            state.latency
        };

        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let mut state = self.device.lock();
        if state.disconnected {
            return Err(TransportError::new(TransportCode::Disconnected, "device not connected"));
        }
        op(&mut state)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FileService for SimulatedService {
    fn open(&mut self, path: &str, mode: OpenMode) -> TransportResult<RemoteFd> {
        let path = normalize(path);
        self.call(|state| {
            if state.denied.contains(&path) {
                return Err(TransportError::new(TransportCode::PermissionDenied, path));
            }
            if state.dirs.contains(&path) {
                return Err(TransportError::new(
                    TransportCode::Other,
                    format!("{} is a directory", path),
                ));
            }

            let exists = state.files.contains_key(&path);
            let pos = match mode {
                OpenMode::Read | OpenMode::ReadWrite => {
                    if !exists {
                        return Err(TransportError::new(TransportCode::NotFound, path));
                    }
                    0
                }
                OpenMode::Write | OpenMode::Append => {
                    if !state.dirs.contains(parent_of(&path)) {
                        return Err(TransportError::new(TransportCode::NotFound, path));
                    }
                    let content = state.files.entry(path.clone()).or_default();
                    if mode == OpenMode::Write {
                        content.clear();
                    }
                    if mode == OpenMode::Append { content.len() as u64 } else { 0 }
                }
            };

            let fd = state.next_fd;
            state.next_fd += 1;
            state.open.insert(fd, OpenSimFile { path, pos });
            Ok(fd)
        })
    }

    fn read(&mut self, fd: RemoteFd, buf: &mut [u8]) -> TransportResult<usize> {
        self.call(|state| {
            if state.panic_on_read {
                panic!("simulated transport fault");
            }
            let SimState { files, open, .. } = state;
            let file = open
                .get_mut(&fd)
                .ok_or_else(|| TransportError::new(TransportCode::InvalidHandle, fd.to_string()))?;
            let content = files
                .get(&file.path)
                .ok_or_else(|| TransportError::new(TransportCode::NotFound, file.path.clone()))?;

            let start = (file.pos as usize).min(content.len());
            let n = buf.len().min(content.len() - start);
            buf[..n].copy_from_slice(&content[start..start + n]);
            file.pos += n as u64;
            Ok(n)
        })
    }

    fn write(&mut self, fd: RemoteFd, data: &[u8]) -> TransportResult<usize> {
        self.call(|state| {
            let SimState { files, open, .. } = state;
            let file = open
                .get_mut(&fd)
                .ok_or_else(|| TransportError::new(TransportCode::InvalidHandle, fd.to_string()))?;
            let content = files.entry(file.path.clone()).or_default();

            let start = file.pos as usize;
            if content.len() < start + data.len() {
                content.resize(start + data.len(), 0);
            }
            content[start..start + data.len()].copy_from_slice(data);
            file.pos += data.len() as u64;
            Ok(data.len())
        })
    }

    fn seek(&mut self, fd: RemoteFd, offset: u64) -> TransportResult<()> {
        self.call(|state| {
            let file = state
                .open
                .get_mut(&fd)
                .ok_or_else(|| TransportError::new(TransportCode::InvalidHandle, fd.to_string()))?;
            file.pos = offset;
            Ok(())
        })
    }

    fn close(&mut self, fd: RemoteFd) -> TransportResult<()> {
        self.call(|state| {
            state
                .open
                .remove(&fd)
                .ok_or_else(|| TransportError::new(TransportCode::InvalidHandle, fd.to_string()))?;
            state.stats.closes += 1;
            Ok(())
        })
    }

    fn list(&mut self, path: &str) -> TransportResult<Vec<String>> {
        let path = normalize(path);
        self.call(|state| {
            if !state.dirs.contains(&path) {
                return Err(TransportError::new(TransportCode::NotFound, path));
            }

            let mut names = vec![".".to_string(), "..".to_string()];
            let children = state
                .dirs
                .iter()
                .chain(state.files.keys())
                .filter(|p| p.as_str() != path && parent_of(p) == path);
            names.extend(children.map(|p| base_name(p).to_string()));
            Ok(names)
        })
    }

    fn stat(&mut self, path: &str) -> TransportResult<FileStat> {
        let path = normalize(path);
        self.call(|state| {
            if state.dirs.contains(&path) {
                return Ok(FileStat {
                    is_directory: true,
                    size: 0,
                    modified: Some(state.modified),
                });
            }
            match state.files.get(&path) {
                Some(content) => Ok(FileStat {
                    is_directory: false,
                    size: content.len() as u64,
                    modified: Some(state.modified),
                }),
                None => Err(TransportError::new(TransportCode::NotFound, path)),
            }
        })
    }

    fn shutdown(&mut self) {
        let mut state = self.device.lock();
        state.open.clear();
        state.stats.shutdowns += 1;
    }
}

fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn add_parents(dirs: &mut BTreeSet<String>, path: &str) {
    let mut current = parent_of(path);
    while current != "/" {
        dirs.insert(current.to_string());
        current = parent_of(current);
    }
}

/// Deterministic, non-repeating-per-chunk content so range bugs show up.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_and_parents() {
        assert_eq!(normalize("DCIM//a.jpg/"), "/DCIM/a.jpg");
        assert_eq!(parent_of("/DCIM/a.jpg"), "/DCIM");
        assert_eq!(parent_of("/a.jpg"), "/");
        assert_eq!(base_name("/DCIM/a.jpg"), "a.jpg");
    }

    #[test]
    fn test_write_then_read_back() {
        let device = SimulatedDevice::new();
        device.add_dir("/Uploads");
        let mut svc = device.service();

        let fd = svc.open("/Uploads/x.bin", OpenMode::Write).unwrap();
        assert_eq!(svc.write(fd, b"abc").unwrap(), 3);
        svc.close(fd).unwrap();

        assert_eq!(device.file("/Uploads/x.bin").unwrap(), b"abc");
    }

    #[test]
    fn test_disconnected_calls_fail() {
        let device = SimulatedDevice::new();
        let mut svc = device.service();
        device.disconnect();
        let err = svc.stat("/").unwrap_err();
        assert_eq!(err.code, TransportCode::Disconnected);
    }
}
