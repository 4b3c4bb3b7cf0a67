//! Export device files into a local directory.
//!
//! A job runs on one blocking worker and copies its items sequentially,
//! chunk by chunk, through the gateway. A failed item does not stop the job;
//! a cancel request stops it at the next chunk boundary. Progress is
//! reported on a bounded event channel, so a consumer that falls behind
//! slows the copy down rather than queueing events without limit.

mod jobs;
pub mod naming;
mod types;

pub use jobs::{JobProgress, JobTable};
pub use types::{
    ExportEvent, ExportItem, ExportJobSummary, ExportRequest, ExportResult, JobId, JobState,
};

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};

use super::error::{Result, TransferError};
use super::gateway::{Channel, DeviceChannelGateway, FileChannelHandle};
use super::service::{FileStat, OpenMode};
use crate::config::AppConfig;
use crate::logging::ProgressLog;

/// A started job: its id, its event stream and the worker producing both.
pub struct ExportJob {
    pub job_id: JobId,
    events: mpsc::Receiver<ExportEvent>,
    task: JoinHandle<ExportJobSummary>,
}

impl ExportJob {
    /// Next event, or `None` once the job has finished and all events
    /// have been taken.
    pub async fn next_event(&mut self) -> Option<ExportEvent> {
        self.events.recv().await
    }

    /// Wait for the summary. Events not yet taken are discarded.
    pub async fn wait(self) -> Result<ExportJobSummary> {
        let Self { events, task, .. } = self;
        drop(events);
        task.await
            .map_err(|e| TransferError::Unknown(format!("export worker failed: {}", e)))
    }
}

#[derive(Clone)]
pub struct ExportJobEngine {
    gateway: DeviceChannelGateway,
    config: Arc<AppConfig>,
    jobs: JobTable,
}

impl ExportJobEngine {
    pub fn new(gateway: DeviceChannelGateway, config: Arc<AppConfig>) -> Self {
        Self {
            gateway,
            config,
            jobs: JobTable::new(),
        }
    }

    /// Validate the destination and start copying in the background.
    ///
    /// Only a destination that cannot be used fails here. Everything that
    /// goes wrong with individual items is reported in the summary.
    pub fn start_export(&self, request: ExportRequest) -> Result<ExportJob> {
        prepare_destination(&request.destination)?;

        let job_id = uuid::Uuid::now_v7().to_string();
        let cancel = self.jobs.insert(&job_id, request.items.len());
        let (tx, rx) = mpsc::channel(self.config.export.event_buffer.max(1));

        info!(
            job_id = %job_id,
            items = request.items.len(),
            destination = %request.destination.display(),
            device = %self.gateway.device_id(),
            "Export job created"
        );

        let worker = ExportWorker {
            job_id: job_id.clone(),
            gateway: self.gateway.clone(),
            jobs: self.jobs.clone(),
            cancel,
            events: tx,
            channel: request.channel,
            destination: request.destination,
            chunk_size: self.config.chunk_size(),
            sync_files: self.config.export.sync_files,
            preserve_mtime: self.config.export.preserve_mtime,
        };
        let items = request.items;

        let span = info_span!("export_job", job_id = %job_id, destination = %worker.destination.display());
        let task = tokio::task::spawn_blocking(move || {
            let _enter = span.enter();
            worker.run(&items)
        });

        Ok(ExportJob {
            job_id,
            events: rx,
            task,
        })
    }

    /// Ask a running job to stop. Returns false if no such job is running.
    pub fn cancel_export(&self, job_id: &str) -> bool {
        let found = self.jobs.cancel(job_id);
        if found {
            info!(job_id = %job_id, "Export cancellation requested");
        }
        found
    }

    pub fn cancel_all(&self) -> usize {
        self.jobs.cancel_all()
    }

    pub fn is_job_running(&self, job_id: &str) -> bool {
        self.jobs.contains(job_id)
    }

    pub fn is_exporting(&self) -> bool {
        self.jobs.active_count() > 0
    }

    pub fn progress(&self, job_id: &str) -> Option<JobProgress> {
        self.jobs.get(job_id)
    }
}

fn prepare_destination(destination: &Path) -> Result<()> {
    match fs::metadata(destination) {
        Ok(meta) if !meta.is_dir() => {
            return Err(TransferError::InvalidArgument(format!(
                "destination {} is not a directory",
                destination.display()
            )));
        }
        Ok(meta) => {
            if meta.permissions().readonly() {
                return Err(TransferError::PermissionDenied(format!(
                    "destination {} is read-only",
                    destination.display()
                )));
            }
        }
        Err(_) => {
            fs::create_dir_all(destination)
                .map_err(|e| TransferError::from_local_io("create export destination", &e))?;
        }
    }
    Ok(())
}

struct ExportWorker {
    job_id: JobId,
    gateway: DeviceChannelGateway,
    jobs: JobTable,
    cancel: CancellationToken,
    events: mpsc::Sender<ExportEvent>,
    channel: Channel,
    destination: PathBuf,
    chunk_size: usize,
    sync_files: bool,
    preserve_mtime: bool,
}

/// What one item left behind, whether or not it succeeded.
#[derive(Default)]
struct ItemProgress {
    output_path: Option<PathBuf>,
    bytes: u64,
}

impl ExportWorker {
    fn run(self, items: &[ExportItem]) -> ExportJobSummary {
        let started = Instant::now();
        self.jobs.set_running(&self.job_id);
        info!(items = items.len(), destination = %self.destination.display(), "Starting export");
        self.emit(ExportEvent::JobStarted {
            job_id: self.job_id.clone(),
            total_items: items.len(),
            destination: self.destination.clone(),
        });

        let mut results = Vec::with_capacity(items.len());
        let mut cancelled = false;

        for (index, item) in items.iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            self.jobs.start_item(&self.job_id, &item.source_path);
            self.emit(ExportEvent::ItemStarted {
                job_id: self.job_id.clone(),
                index,
                name: item.suggested_name.clone(),
            });

            let result = self.export_item(index, item);
            let interrupted = result.was_interrupted();

            self.jobs.finish_item(&self.job_id);
            self.emit(ExportEvent::ItemFinished {
                job_id: self.job_id.clone(),
                index,
                result: result.clone(),
            });
            results.push(result);

            if interrupted {
                cancelled = true;
                break;
            }
        }

        let summary = ExportJobSummary::new(
            self.job_id.clone(),
            items.len(),
            results,
            cancelled,
            started.elapsed().as_millis() as u64,
        );

        info!(
            successful = summary.successful_items,
            failed = summary.failed_items,
            bytes = summary.total_bytes_transferred,
            cancelled = summary.was_cancelled,
            duration_ms = summary.duration_ms,
            "Export finished"
        );

        self.jobs.remove(&self.job_id);
        let job_id = self.job_id.clone();
        self.emit(if cancelled {
            ExportEvent::JobCancelled {
                job_id,
                summary: summary.clone(),
            }
        } else {
            ExportEvent::JobFinished {
                job_id,
                summary: summary.clone(),
            }
        });

        summary
    }

    fn export_item(&self, index: usize, item: &ExportItem) -> ExportResult {
        let mut progress = ItemProgress::default();

        match self.copy_item(index, item, &mut progress) {
            Ok(()) => {
                let output = progress.output_path.unwrap_or_default();
                debug!(source = %item.source_path, output = %output.display(), bytes = progress.bytes, "Exported item");
                ExportResult::succeeded(item, output, progress.bytes)
            }
            Err(e) => {
                if let Some(partial) = &progress.output_path
                    && let Err(remove_err) = fs::remove_file(partial)
                {
                    warn!(path = %partial.display(), error = %remove_err, "Failed to remove partial export");
                }
                match e {
                    TransferError::Cancelled => {
                        info!(source = %item.source_path, bytes = progress.bytes, "Item interrupted by cancel")
                    }
                    _ => error!(source = %item.source_path, error = %e, "Failed to export item"),
                }
                ExportResult::failed(item, &e, progress.bytes)
            }
        }
    }

    fn copy_item(&self, index: usize, item: &ExportItem, progress: &mut ItemProgress) -> Result<()> {
        let stat = self.gateway.stat_file(self.channel, &item.source_path)?;
        if stat.is_directory {
            return Err(TransferError::InvalidArgument(format!(
                "{} is a directory",
                item.source_path
            )));
        }

        let handle = self
            .gateway
            .open_file(self.channel, &item.source_path, OpenMode::Read)?;

        let result = self.copy_open_file(index, item, &handle, &stat, progress);

        if let Err(e) = self.gateway.close_file(&handle) {
            debug!(source = %item.source_path, error = %e, "Closing device file failed");
        }
        result
    }

    fn copy_open_file(
        &self,
        index: usize,
        item: &ExportItem,
        handle: &FileChannelHandle,
        stat: &FileStat,
        progress: &mut ItemProgress,
    ) -> Result<()> {
        let name = naming::sanitize_name(&item.suggested_name, &item.source_path);
        let (output_path, file) = naming::create_unique(&self.destination, &name)
            .map_err(|e| TransferError::from_local_io("create export file", &e))?;
        progress.output_path = Some(output_path.clone());

        let mut writer = BufWriter::with_capacity(self.chunk_size, file);
        let mut progress_log = ProgressLog::new(std::time::Duration::from_secs(5));

        loop {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let chunk = self.gateway.read_file(handle, self.chunk_size)?;
            if chunk.is_empty() {
                break;
            }

            writer
                .write_all(&chunk)
                .map_err(|e| TransferError::from_local_io("write export file", &e))?;
            progress.bytes += chunk.len() as u64;

            self.jobs.add_bytes(&self.job_id, chunk.len() as u64);
            self.emit(ExportEvent::ItemProgress {
                job_id: self.job_id.clone(),
                index,
                bytes_transferred: progress.bytes,
                total_bytes: Some(stat.size),
            });

            progress_log.record(&item.source_path, progress.bytes, stat.size);
        }

        finish_file(writer, self.sync_files)?;

        if progress.bytes != stat.size {
            return Err(TransferError::Unknown(format!(
                "size mismatch for {}: expected {} bytes, copied {}",
                item.source_path, stat.size, progress.bytes
            )));
        }

        if self.preserve_mtime
            && let Some(modified) = stat.modified
        {
            let mtime = filetime::FileTime::from_system_time(modified);
            if let Err(e) = filetime::set_file_mtime(&output_path, mtime) {
                debug!(path = %output_path.display(), error = %e, "Failed to preserve modification time");
            }
        }

        Ok(())
    }

    fn emit(&self, event: ExportEvent) {
        // A consumer that went away does not stop the job.
        let _ = self.events.blocking_send(event);
    }
}

fn finish_file(mut writer: BufWriter<File>, sync: bool) -> Result<()> {
    writer
        .flush()
        .map_err(|e| TransferError::from_local_io("flush export file", &e))?;
    let file = writer
        .into_inner()
        .map_err(|e| TransferError::from_local_io("flush export file", e.error()))?;
    if sync {
        file.sync_all()
            .map_err(|e| TransferError::from_local_io("sync export file", &e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::simulated::{SimulatedDevice, pattern};
    use crate::core::error::ErrorKind;
    use tempfile::tempdir;

    fn engine(device: &SimulatedDevice, chunk_size: usize) -> ExportJobEngine {
        let gateway = DeviceChannelGateway::new("sim", Box::new(device.service()), None);
        let mut config = AppConfig::default();
        config.chunk_size = chunk_size;
        config.export.sync_files = false;
        ExportJobEngine::new(gateway, Arc::new(config))
    }

    async fn collect(mut job: ExportJob) -> (Vec<ExportEvent>, ExportJobSummary) {
        let mut events = Vec::new();
        while let Some(event) = job.next_event().await {
            events.push(event);
        }
        let summary = job.wait().await.unwrap();
        (events, summary)
    }

    #[tokio::test]
    async fn test_export_copies_files() {
        let device = SimulatedDevice::new();
        device.add_file("/DCIM/a.jpg", pattern(10_000));
        device.add_file("/DCIM/b.jpg", pattern(5));
        let engine = engine(&device, 4096);
        let dest = tempdir().unwrap();

        let job = engine
            .start_export(ExportRequest {
                items: vec![
                    ExportItem::from_path("/DCIM/a.jpg"),
                    ExportItem::from_path("/DCIM/b.jpg"),
                ],
                destination: dest.path().to_path_buf(),
                channel: Channel::Primary,
            })
            .unwrap();

        let (events, summary) = collect(job).await;

        assert_eq!(summary.state, JobState::Completed);
        assert_eq!(summary.successful_items, 2);
        assert_eq!(summary.total_bytes_transferred, 10_005);
        assert_eq!(fs::read(dest.path().join("a.jpg")).unwrap(), pattern(10_000));

        assert!(matches!(events.first(), Some(ExportEvent::JobStarted { total_items: 2, .. })));
        assert!(matches!(events.last(), Some(ExportEvent::JobFinished { .. })));
        assert_eq!(device.open_count(), 0);
        assert!(!engine.is_exporting());
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let device = SimulatedDevice::new();
        device.add_file("/big.bin", pattern(20_000));
        let engine = engine(&device, 4096);
        let dest = tempdir().unwrap();

        let job = engine
            .start_export(ExportRequest {
                items: vec![ExportItem::from_path("/big.bin")],
                destination: dest.path().to_path_buf(),
                channel: Channel::Primary,
            })
            .unwrap();
        let (events, _) = collect(job).await;

        let progress: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                ExportEvent::ItemProgress { bytes_transferred, total_bytes, .. } => {
                    assert_eq!(*total_bytes, Some(20_000));
                    Some(*bytes_transferred)
                }
                _ => None,
            })
            .collect();
        assert_eq!(progress.len(), 5);
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(progress.last(), Some(&20_000));
    }

    #[tokio::test]
    async fn test_existing_file_is_not_overwritten() {
        let device = SimulatedDevice::new();
        device.add_file("/a.jpg", pattern(100));
        let engine = engine(&device, 4096);
        let dest = tempdir().unwrap();
        fs::write(dest.path().join("a.jpg"), b"keep me").unwrap();

        let job = engine
            .start_export(ExportRequest {
                items: vec![ExportItem::from_path("/a.jpg")],
                destination: dest.path().to_path_buf(),
                channel: Channel::Primary,
            })
            .unwrap();
        let summary = job.wait().await.unwrap();

        assert_eq!(fs::read(dest.path().join("a.jpg")).unwrap(), b"keep me");
        assert_eq!(
            summary.results[0].output_path.as_deref(),
            Some(dest.path().join("a (1).jpg").as_path())
        );
    }

    #[tokio::test]
    async fn test_directory_item_fails_alone() {
        let device = SimulatedDevice::new();
        device.add_dir("/DCIM");
        device.add_file("/DCIM/a.jpg", pattern(10));
        let engine = engine(&device, 4096);
        let dest = tempdir().unwrap();

        let job = engine
            .start_export(ExportRequest {
                items: vec![ExportItem::from_path("/DCIM"), ExportItem::from_path("/DCIM/a.jpg")],
                destination: dest.path().to_path_buf(),
                channel: Channel::Primary,
            })
            .unwrap();
        let summary = job.wait().await.unwrap();

        assert_eq!(summary.failed_items, 1);
        assert_eq!(summary.successful_items, 1);
        assert_eq!(summary.results[0].error_kind, Some(ErrorKind::InvalidArgument));
    }

    #[tokio::test]
    async fn test_destination_that_is_a_file_is_rejected() {
        let device = SimulatedDevice::new();
        let engine = engine(&device, 4096);
        let dest = tempdir().unwrap();
        let file = dest.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();

        let err = engine
            .start_export(ExportRequest {
                items: vec![ExportItem::from_path("/a")],
                destination: file,
                channel: Channel::Primary,
            })
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(!engine.is_exporting());
    }

    #[tokio::test]
    async fn test_missing_destination_is_created() {
        let device = SimulatedDevice::new();
        device.add_file("/a.txt", pattern(3));
        let engine = engine(&device, 4096);
        let dest = tempdir().unwrap();
        let nested = dest.path().join("x/y");

        let job = engine
            .start_export(ExportRequest {
                items: vec![ExportItem::from_path("/a.txt")],
                destination: nested.clone(),
                channel: Channel::Primary,
            })
            .unwrap();
        let summary = job.wait().await.unwrap();
        assert_eq!(summary.successful_items, 1);
        assert!(nested.join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let device = SimulatedDevice::new();
        let engine = engine(&device, 4096);
        assert!(!engine.cancel_export("nope"));
        assert!(!engine.is_job_running("nope"));
    }

    #[tokio::test]
    async fn test_preserves_device_mtime() {
        let device = SimulatedDevice::new();
        device.add_file("/a.txt", pattern(3));
        let engine = engine(&device, 4096);
        let modified = engine
            .gateway
            .stat_file(Channel::Primary, "/a.txt")
            .unwrap()
            .modified
            .unwrap();
        let dest = tempdir().unwrap();

        let job = engine
            .start_export(ExportRequest {
                items: vec![ExportItem::from_path("/a.txt")],
                destination: dest.path().to_path_buf(),
                channel: Channel::Primary,
            })
            .unwrap();
        job.wait().await.unwrap();

        let meta = fs::metadata(dest.path().join("a.txt")).unwrap();
        let local = filetime::FileTime::from_last_modification_time(&meta);
        assert_eq!(
            local.unix_seconds(),
            filetime::FileTime::from_system_time(modified).unix_seconds()
        );
    }
}
