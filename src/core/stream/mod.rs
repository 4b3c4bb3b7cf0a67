//! Per-file HTTP bridge.
//!
//! A [`StreamBridge`] binds an ephemeral loopback port and serves exactly one
//! device file at `/`, with byte-range support so media players can seek.
//! Bodies are produced one gateway read at a time: the next chunk is only
//! read from the device after hyper has taken the previous one, so a slow
//! client throttles device reads instead of growing a buffer.
//!
//! ## Endpoints
//!
//! - `GET /` - whole file (`200`) or a single range (`206`)
//! - `HEAD /` - headers only
//! - anything else on `/` - `405`

mod range;

pub use range::{ByteRange, RangeError, content_type_for, parse_range};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{ErrorKind, Result, TransferError};
use super::gateway::{Channel, DeviceChannelGateway, FileChannelHandle};
use super::service::OpenMode;

/// Lifecycle of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Listening,
    /// Streaming to this many connections.
    Serving(usize),
    /// Idle after having served, or closed with streams still finishing.
    Draining,
    Closed,
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub chunk_size: usize,
    pub bind_attempts: u32,
}

struct BridgeShared {
    listening: AtomicBool,
    closed: AtomicBool,
    aborted: AtomicBool,
    active: AtomicUsize,
    served: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl BridgeShared {
    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn enter(self: &Arc<Self>) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.served.fetch_add(1, Ordering::Relaxed);
        self.touch();
        ConnectionGuard {
            shared: Arc::clone(self),
        }
    }
}

/// Counts a connection as active for as long as its response body lives.
struct ConnectionGuard {
    shared: Arc<BridgeShared>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
        self.shared.touch();
    }
}

#[derive(Clone)]
struct ServeContext {
    gateway: DeviceChannelGateway,
    channel: Channel,
    path: Arc<str>,
    chunk_size: usize,
    shared: Arc<BridgeShared>,
}

pub struct StreamBridge {
    path: String,
    channel: Channel,
    addr: SocketAddr,
    shared: Arc<BridgeShared>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl StreamBridge {
    /// Bind a loopback listener and start serving `path`.
    pub async fn start(
        gateway: DeviceChannelGateway,
        channel: Channel,
        path: &str,
        options: BridgeOptions,
    ) -> Result<Self> {
        let listener = bind_loopback(options.bind_attempts).await?;
        let addr = listener
            .local_addr()
            .map_err(|e| TransferError::from_local_io("stream listener address", &e))?;

        let shared = Arc::new(BridgeShared {
            listening: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            served: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        });

        let ctx = ServeContext {
            gateway,
            channel,
            path: Arc::from(path),
            chunk_size: options.chunk_size.max(1),
            shared: Arc::clone(&shared),
        };

        let app = Router::new()
            .route("/", get(serve_file))
            .fallback(|| async { StatusCode::NOT_FOUND })
            .with_state(ctx);

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let task_shared = Arc::clone(&shared);
        let task_path = path.to_string();

        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await;

            if let Err(e) = result {
                warn!(path = %task_path, error = %e, "Stream listener failed");
            }
            task_shared.listening.store(false, Ordering::SeqCst);
            debug!(path = %task_path, "Stream listener stopped");
        });

        info!(path = %path, ?channel, %addr, "Stream bridge listening");

        Ok(Self {
            path: path.to_string(),
            channel,
            addr,
            shared,
            shutdown_tx,
            task,
        })
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn is_listening(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
            && self.shared.listening.load(Ordering::SeqCst)
            && !self.task.is_finished()
    }

    pub fn active_connections(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Restart the idle clock.
    pub fn touch(&self) {
        self.shared.touch();
    }

    pub fn idle_for(&self) -> Duration {
        self.shared
            .last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    pub fn state(&self) -> BridgeState {
        let active = self.active_connections();
        if self.shared.closed.load(Ordering::SeqCst) || !self.is_listening() {
            return if active > 0 {
                BridgeState::Draining
            } else {
                BridgeState::Closed
            };
        }

        if active > 0 {
            BridgeState::Serving(active)
        } else if self.shared.served.load(Ordering::Relaxed) > 0 {
            BridgeState::Draining
        } else {
            BridgeState::Listening
        }
    }

    /// Stop accepting connections. Streams already running finish on their
    /// own. Only the first call has any effect.
    pub fn close(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.shutdown_tx.send(());
        info!(path = %self.path, addr = %self.addr, "Stream bridge closed");
        true
    }

    /// Close and cut every running stream at its next chunk.
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::SeqCst);
        self.close();
        self.task.abort();
    }
}

impl Drop for StreamBridge {
    fn drop(&mut self) {
        self.close();
    }
}

async fn bind_loopback(attempts: u32) -> Result<TcpListener> {
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                warn!(attempt, attempts, error = %e, "Failed to bind stream listener");
                last_error = Some(e);
            }
        }
    }

    let error = last_error.unwrap_or_else(|| io::Error::other("no bind attempt made"));
    Err(TransferError::from_local_io("bind stream listener", &error))
}

async fn serve_file(State(ctx): State<ServeContext>, method: Method, headers: HeaderMap) -> Response {
    let guard = ctx.shared.enter();
    let path = Arc::clone(&ctx.path);
    let channel = ctx.channel;

    let stat = match ctx
        .gateway
        .run_blocking(move |gw| gw.stat_file(channel, &path))
        .await
    {
        Ok(stat) if stat.is_directory => {
            return error_response(&TransferError::NotFound(format!("{} is a directory", ctx.path)));
        }
        Ok(stat) => stat,
        Err(e) => return error_response(&e),
    };

    let total = stat.size;
    let content_type = content_type_for(&ctx.path);

    let range = match headers.get(header::RANGE) {
        None => None,
        Some(value) => {
            let Ok(value) = value.to_str() else {
                return error_response(&TransferError::Protocol("non-ASCII Range header".into()));
            };
            match parse_range(value, total) {
                Ok(range) => Some(range),
                Err(RangeError::Malformed) => {
                    return error_response(&TransferError::Protocol(format!(
                        "unsupported Range header: {}",
                        value
                    )));
                }
                Err(RangeError::Unsatisfiable) => {
                    debug!(path = %ctx.path, range = %value, total, "Unsatisfiable range");
                    return (
                        StatusCode::RANGE_NOT_SATISFIABLE,
                        [
                            (header::CONTENT_RANGE, format!("bytes */{}", total)),
                            (header::ACCEPT_RANGES, "bytes".to_string()),
                        ],
                    )
                        .into_response();
                }
            }
        }
    };

    let (status, start, length) = match range {
        Some(r) => (StatusCode::PARTIAL_CONTENT, r.start, r.len()),
        None => (StatusCode::OK, 0, total),
    };

    let mut response_headers = vec![
        (header::CONTENT_TYPE, content_type),
        (header::CONTENT_LENGTH, length.to_string()),
        (header::ACCEPT_RANGES, "bytes".to_string()),
    ];
    if let Some(r) = range {
        response_headers.push((header::CONTENT_RANGE, r.content_range(total)));
    }

    let mut map = HeaderMap::new();
    for (name, value) in response_headers {
        match value.parse() {
            Ok(value) => {
                map.insert(name, value);
            }
            Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }

    if method == Method::HEAD || length == 0 {
        return (status, map, Body::empty()).into_response();
    }

    let path = Arc::clone(&ctx.path);
    let opened = ctx
        .gateway
        .run_blocking(move |gw| {
            let handle = gw.open_file(channel, &path, OpenMode::Read)?;
            if start > 0
                && let Err(e) = gw.seek_file(&handle, start)
            {
                let _ = gw.close_file(&handle);
                return Err(e);
            }
            Ok(handle)
        })
        .await;

    let handle = match opened {
        Ok(handle) => handle,
        Err(e) => return error_response(&e),
    };

    debug!(path = %ctx.path, start, length, status = status.as_u16(), "Streaming device file");

    let reader = ChunkReader {
        gateway: ctx.gateway.clone(),
        handle: Some(handle),
        remaining: length,
        chunk_size: ctx.chunk_size,
        shared: Arc::clone(&ctx.shared),
        _guard: guard,
    };

    let body = futures_util::stream::unfold(reader, |mut reader| async move {
        match reader.next_chunk().await {
            Ok(Some(chunk)) => Some((Ok(chunk), reader)),
            Ok(None) => None,
            Err(e) => Some((Err(e), reader)),
        }
    });

    (status, map, Body::from_stream(body)).into_response()
}

/// Feeds one response body from the device, one gateway read per chunk.
struct ChunkReader {
    gateway: DeviceChannelGateway,
    handle: Option<FileChannelHandle>,
    remaining: u64,
    chunk_size: usize,
    shared: Arc<BridgeShared>,
    _guard: ConnectionGuard,
}

impl ChunkReader {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        let Some(handle) = self.handle else {
            return Ok(None);
        };
        if self.remaining == 0 {
            self.finish().await;
            return Ok(None);
        }
        if self.shared.aborted.load(Ordering::SeqCst) {
            self.finish().await;
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "stream bridge aborted"));
        }

        let want = (self.chunk_size as u64).min(self.remaining) as usize;
        let read = self
            .gateway
            .run_blocking(move |gw| gw.read_file(&handle, want))
            .await;

        match read {
            Ok(data) if data.is_empty() => {
                warn!(remaining = self.remaining, "Device file ended before the promised length");
                self.finish().await;
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "device file truncated"))
            }
            Ok(data) => {
                self.remaining = self.remaining.saturating_sub(data.len() as u64);
                self.shared.touch();
                Ok(Some(Bytes::from(data)))
            }
            Err(e) => {
                warn!(error = %e, "Device read failed mid-stream");
                self.finish().await;
                Err(io::Error::other(e))
            }
        }
    }

    async fn finish(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self
                .gateway
                .run_blocking(move |gw| gw.close_file(&handle))
                .await;
        }
    }
}

impl Drop for ChunkReader {
    fn drop(&mut self) {
        // Client went away mid-stream.
        let Some(handle) = self.handle.take() else {
            return;
        };
        let gateway = self.gateway.clone();
        let close = move || {
            if let Err(e) = gateway.close_file(&handle) {
                debug!(error = %e, "Closing abandoned stream handle failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(close);
            }
            Err(_) => close(),
        }
    }
}

fn error_response(error: &TransferError) -> Response {
    let status = match error.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => StatusCode::NOT_FOUND,
        ErrorKind::Protocol => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    debug!(error = %error, status = status.as_u16(), "Stream request failed");
    (status, error.to_string()).into_response()
}
