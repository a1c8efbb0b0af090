use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CoreError, CoreResult};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_workers: u32,
    pub buffer_size: usize,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub temp_suffix: String,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub checkpoint_bytes: u64,
    pub progress_interval_ms: u64,
    pub buffer_retune_ms: u64,
    pub speed_limit_bytes_per_sec: Option<u64>,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_workers: 12,
            buffer_size: 32 * 1024,
            connect_timeout_ms: 15_000,
            read_timeout_ms: 60_000,
            retry_count: 5,
            retry_delay_ms: 500,
            temp_suffix: ".tmp".to_string(),
            min_chunk_size: 2 * MIB,
            max_chunk_size: 10 * MIB,
            checkpoint_bytes: 2 * MIB,
            progress_interval_ms: 500,
            buffer_retune_ms: 2_000,
            speed_limit_bytes_per_sec: None,
            user_agent: concat!("rangefetch/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DownloadConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.min_chunk_size == 0 {
            return Err(CoreError::Config("min_chunk_size must be positive".to_string()));
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(CoreError::Config(format!(
                "min_chunk_size ({}) exceeds max_chunk_size ({})",
                self.min_chunk_size, self.max_chunk_size
            )));
        }
        if self.max_workers == 0 {
            return Err(CoreError::Config("max_workers must be positive".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(CoreError::Config("buffer_size must be positive".to_string()));
        }
        if self.checkpoint_bytes == 0 {
            return Err(CoreError::Config("checkpoint_bytes must be positive".to_string()));
        }
        if self.temp_suffix.is_empty() {
            return Err(CoreError::Config("temp_suffix must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn from_toml_str(value: &str) -> CoreResult<Self> {
        let config: Self =
            toml::from_str(value).map_err(|err| CoreError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| CoreError::io(path, err))?;
        Self::from_toml_str(&raw)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }

    pub fn buffer_retune_window(&self) -> Duration {
        Duration::from_millis(self.buffer_retune_ms.max(1))
    }
}
