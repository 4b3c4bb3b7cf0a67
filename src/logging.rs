//! Tracing setup and throttled progress logging.
//!
//! Logs go to stderr so that command output on stdout (listings, stream
//! URLs, export summaries) stays machine-readable. `RUST_LOG` overrides the
//! level picked from the config.

use std::time::{Duration, Instant};
use tracing::{Level, debug};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON object per line instead of the human format.
    pub json: bool,
    /// Default to DEBUG instead of INFO.
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.log_json,
            verbose: config.verbose,
        }
    }
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init(config: LogConfig) -> bool {
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("devxfer={}", level.as_str().to_lowercase())));

    let installed = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init()
    };

    installed.is_ok()
}

/// Debug-level progress lines for one file copy, at most one per interval.
pub struct ProgressLog {
    interval: Duration,
    started: Instant,
    last: Option<Instant>,
}

impl ProgressLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            started: Instant::now(),
            last: None,
        }
    }

    /// Log `bytes` of `total` if the interval has elapsed since the last line.
    pub fn record(&mut self, source: &str, bytes: u64, total: u64) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last
            && now.duration_since(last) < self.interval
        {
            return false;
        }
        self.last = Some(now);

        let percent = if total > 0 { bytes * 100 / total } else { 100 };
        let secs = now.duration_since(self.started).as_secs_f64();
        let mib_per_sec = if secs > 0.0 {
            bytes as f64 / (1024.0 * 1024.0) / secs
        } else {
            0.0
        };
        debug!(
            source = %source,
            bytes,
            total,
            percent,
            speed = format!("{:.2} MiB/s", mib_per_sec),
            "Export progress"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_log_first_record_is_logged() {
        let mut log = ProgressLog::new(Duration::from_secs(60));
        assert!(log.record("/a", 10, 100));
        assert!(!log.record("/a", 20, 100));
    }

    #[test]
    fn test_progress_log_zero_interval_logs_every_time() {
        let mut log = ProgressLog::new(Duration::ZERO);
        assert!(log.record("/a", 10, 100));
        assert!(log.record("/a", 20, 100));
    }

    #[test]
    fn test_log_config_from_app_config() {
        let config = AppConfig {
            log_json: true,
            ..AppConfig::default()
        };
        let log = LogConfig::from(&config);
        assert!(log.json);
        assert!(!log.verbose);
    }
}
