// =============================================================================
// Hub configuration (TOML)
// =============================================================================

use serde::Deserialize;
use sluice_core::StageError;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub timeseries: TimeseriesConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetadataConfig {
    /// `memory://` for an empty graph, otherwise a JSON graph file.
    #[serde(default = "default_location")]
    pub store: String,
    #[serde(default = "default_metadata_workers")]
    pub workers: usize,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            store: default_location(),
            workers: default_metadata_workers(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimeseriesConfig {
    /// `memory://` for an empty backend, otherwise a JSON stream file.
    #[serde(default = "default_location")]
    pub backend: String,
    #[serde(default = "default_timeseries_workers")]
    pub workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_cache_capacity")]
    pub stream_cache_capacity: usize,
    #[serde(default)]
    pub stream_cache_ttl_secs: Option<u64>,
}

impl TimeseriesConfig {
    pub fn stream_cache_ttl(&self) -> Option<Duration> {
        self.stream_cache_ttl_secs.map(Duration::from_secs)
    }
}

impl Default for TimeseriesConfig {
    fn default() -> Self {
        Self {
            backend: default_location(),
            workers: default_timeseries_workers(),
            batch_size: default_batch_size(),
            stream_cache_capacity: default_cache_capacity(),
            stream_cache_ttl_secs: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_response_buffer")]
    pub response_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            response_buffer: default_response_buffer(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8086".into()
}
fn default_location() -> String {
    "memory://".into()
}
fn default_metadata_workers() -> usize {
    10
}
fn default_timeseries_workers() -> usize {
    20
}
fn default_batch_size() -> usize {
    sluice_core::DEFAULT_BATCH_SIZE
}
fn default_cache_capacity() -> usize {
    100_000
}
fn default_queue_depth() -> usize {
    sluice_core::stage::DEFAULT_QUEUE_DEPTH
}
fn default_response_buffer() -> usize {
    sluice_core::request::DEFAULT_RESPONSE_BUFFER
}

impl Config {
    /// Read `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, StageError> {
        if !path.exists() {
            tracing::info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| StageError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, StageError> {
        let config: Config =
            toml::from_str(content).map_err(|e| StageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StageError> {
        if self.metadata.workers == 0 {
            return Err(StageError::Config("metadata.workers must be at least 1".into()));
        }
        if self.timeseries.workers == 0 {
            return Err(StageError::Config("timeseries.workers must be at least 1".into()));
        }
        if self.timeseries.batch_size == 0 {
            return Err(StageError::Config("timeseries.batch_size must be at least 1".into()));
        }
        if self.pipeline.response_buffer == 0 {
            return Err(StageError::Config("pipeline.response_buffer must be at least 1".into()));
        }
        Ok(())
    }
}
