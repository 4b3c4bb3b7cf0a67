use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::error::{ErrorKind, TransferError};
use crate::core::gateway::Channel;

pub type JobId = String;

/// One device file to export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportItem {
    pub source_path: String,
    pub suggested_name: String,
}

impl ExportItem {
    pub fn new(source_path: impl Into<String>, suggested_name: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            suggested_name: suggested_name.into(),
        }
    }

    /// Use the device file's own base name.
    pub fn from_path(source_path: impl Into<String>) -> Self {
        let source_path = source_path.into();
        let name = source_path
            .rsplit('/')
            .find(|part| !part.is_empty())
            .unwrap_or_default()
            .to_string();
        Self::new(source_path, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub items: Vec<ExportItem>,
    pub destination: PathBuf,
    #[serde(default)]
    pub channel: Channel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportResult {
    pub source_path: String,
    /// Set only when the file was written and kept.
    pub output_path: Option<PathBuf>,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub bytes_transferred: u64,
}

impl ExportResult {
    pub(super) fn succeeded(item: &ExportItem, output_path: PathBuf, bytes: u64) -> Self {
        Self {
            source_path: item.source_path.clone(),
            output_path: Some(output_path),
            success: true,
            error_kind: None,
            error_message: None,
            bytes_transferred: bytes,
        }
    }

    pub(super) fn failed(item: &ExportItem, error: &TransferError, bytes: u64) -> Self {
        Self {
            source_path: item.source_path.clone(),
            output_path: None,
            success: false,
            error_kind: Some(error.kind()),
            error_message: Some(error.to_string()),
            bytes_transferred: bytes,
        }
    }

    /// Interrupted by a cancel request rather than failed on its own.
    pub fn was_interrupted(&self) -> bool {
        self.error_kind == Some(ErrorKind::Cancelled)
    }
}

/// Lifecycle of a job. A job whose destination fails validation is never
/// created; `start_export` returns the error instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Running,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportJobSummary {
    pub job_id: JobId,
    pub state: JobState,
    pub total_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub total_bytes_transferred: u64,
    pub was_cancelled: bool,
    /// One entry per attempted item, in order.
    pub results: Vec<ExportResult>,
    pub duration_ms: u64,
}

impl ExportJobSummary {
    pub(super) fn new(
        job_id: JobId,
        total_items: usize,
        results: Vec<ExportResult>,
        was_cancelled: bool,
        duration_ms: u64,
    ) -> Self {
        let successful_items = results.iter().filter(|r| r.success).count();
        let failed_items = results
            .iter()
            .filter(|r| !r.success && !r.was_interrupted())
            .count();
        let total_bytes_transferred = results.iter().map(|r| r.bytes_transferred).sum();

        Self {
            job_id,
            state: if was_cancelled {
                JobState::Cancelled
            } else {
                JobState::Completed
            },
            total_items,
            successful_items,
            failed_items,
            total_bytes_transferred,
            was_cancelled,
            results,
            duration_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExportEvent {
    JobStarted {
        job_id: JobId,
        total_items: usize,
        destination: PathBuf,
    },
    ItemStarted {
        job_id: JobId,
        index: usize,
        name: String,
    },
    ItemProgress {
        job_id: JobId,
        index: usize,
        bytes_transferred: u64,
        total_bytes: Option<u64>,
    },
    ItemFinished {
        job_id: JobId,
        index: usize,
        result: ExportResult,
    },
    JobFinished {
        job_id: JobId,
        summary: ExportJobSummary,
    },
    JobCancelled {
        job_id: JobId,
        summary: ExportJobSummary,
    },
}

impl ExportEvent {
    /// The summary carried by a terminal event.
    pub fn summary(&self) -> Option<&ExportJobSummary> {
        match self {
            Self::JobFinished { summary, .. } | Self::JobCancelled { summary, .. } => Some(summary),
            _ => None,
        }
    }
}
