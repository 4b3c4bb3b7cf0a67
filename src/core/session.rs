//! Everything the subsystem holds for one attached device.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use super::device::AttachedDevice;
use super::error::Result;
use super::export::{ExportJob, ExportJobEngine, ExportRequest};
use super::gateway::{Channel, DeviceChannelGateway};
use super::registry::StreamBridgeRegistry;
use super::service::{DirEntry, FileStat};
use crate::config::AppConfig;

pub struct DeviceSession {
    label: String,
    gateway: DeviceChannelGateway,
    streams: Arc<StreamBridgeRegistry>,
    exports: ExportJobEngine,
    sweeper: JoinHandle<()>,
}

impl DeviceSession {
    /// Wrap a freshly attached device. Must be called inside a runtime.
    pub fn open(device: AttachedDevice, config: Arc<AppConfig>) -> Self {
        let gateway = DeviceChannelGateway::new(device.id, device.primary, device.alternate);
        let streams = Arc::new(StreamBridgeRegistry::new(gateway.clone(), Arc::clone(&config)));
        let sweeper = streams.spawn_sweeper();
        let exports = ExportJobEngine::new(gateway.clone(), config);

        info!(
            device = %gateway.device_id(),
            label = %device.label,
            alternate = gateway.has_alternate(),
            "Device session opened"
        );

        Self {
            label: device.label,
            gateway,
            streams,
            exports,
            sweeper,
        }
    }

    pub fn id(&self) -> &str {
        self.gateway.device_id()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn gateway(&self) -> &DeviceChannelGateway {
        &self.gateway
    }

    pub fn streams(&self) -> &Arc<StreamBridgeRegistry> {
        &self.streams
    }

    pub fn exports(&self) -> &ExportJobEngine {
        &self.exports
    }

    pub async fn list_directory(&self, channel: Channel, path: &str) -> Result<Vec<DirEntry>> {
        let path = path.to_string();
        self.gateway
            .run_blocking(move |gw| gw.list_directory(channel, &path))
            .await
    }

    pub async fn stat_file(&self, channel: Channel, path: &str) -> Result<FileStat> {
        let path = path.to_string();
        self.gateway
            .run_blocking(move |gw| gw.stat_file(channel, &path))
            .await
    }

    pub async fn stream_url(&self, channel: Channel, path: &str) -> Result<String> {
        self.streams.acquire(channel, path).await
    }

    pub async fn release_stream(&self, channel: Channel, path: &str) {
        self.streams.release(channel, path).await
    }

    pub fn start_export(&self, request: ExportRequest) -> Result<ExportJob> {
        self.exports.start_export(request)
    }

    pub fn cancel_export(&self, job_id: &str) -> bool {
        self.exports.cancel_export(job_id)
    }

    /// Stop exports and bridges, then release the device. Work still in
    /// flight fails with `DeviceUnavailable`.
    pub async fn close(self) {
        let cancelled = self.exports.cancel_all();
        self.streams.shutdown().await;
        self.sweeper.abort();
        let detached = self.gateway.detach();

        info!(
            device = %self.gateway.device_id(),
            cancelled_exports = cancelled,
            detached,
            "Device session closed"
        );
    }
}
