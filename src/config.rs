use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "devxfer.toml";

const MIN_CHUNK_SIZE: usize = 4 * 1024;
const MAX_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Bytes moved per device read, for both streaming and export.
    pub chunk_size: usize,
    pub stream: StreamConfig,
    pub export: ExportConfig,
    pub log_json: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub bind_attempts: u32,
    /// How long an unreferenced bridge stays up for a quick re-open.
    pub idle_grace_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub event_buffer: usize,
    pub preserve_mtime: bool,
    pub sync_files: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            stream: StreamConfig::default(),
            export: ExportConfig::default(),
            log_json: false,
            verbose: false,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind_attempts: 3,
            idle_grace_secs: 10,
            sweep_interval_secs: 5,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            event_buffer: 64,
            preserve_mtime: true,
            sync_files: true,
        }
    }
}

impl AppConfig {
    /// Layer defaults, an optional TOML file, `DEVXFER_*` environment
    /// variables and finally CLI overrides.
    pub fn load<T: Serialize>(
        config_file: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, figment::Error> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("DEVXFER_").split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.stream.idle_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stream.sweep_interval_secs.max(1))
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
