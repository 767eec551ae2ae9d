/*!
 * Kernel Configuration
 *
 * Boot-time configuration: JSON file, then HLE_* environment overrides,
 * then validation. Defaults come from `core::limits`.
 */

use super::limits::*;
use super::types::FirmwareVersion;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// What the GPU consumer does with queued commands on shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Execute everything still in the ring
    #[default]
    Drain,
    /// Drop queued commands and fail their result boxes
    Discard,
}

/// GPU command queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub ring_capacity: usize,
    pub shutdown_mode: ShutdownMode,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_GPU_RING_CAPACITY,
            shutdown_mode: ShutdownMode::Drain,
        }
    }
}

/// Kernel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Emulated cores that may run guest threads concurrently
    pub core_count: usize,
    /// Round-robin quantum between equal-priority threads
    pub time_quantum_us: u64,
    /// Firmware the guest expects; selects versioned IPC commands
    pub firmware_version: FirmwareVersion,
    pub handle_table_capacity: usize,
    pub thread_limit: u64,
    /// Per-process physical memory limit in bytes
    pub memory_limit: u64,
    /// Size of the emulated physical pool in bytes
    pub physical_memory_size: u64,
    pub session_limit: u64,
    pub event_limit: u64,
    pub pointer_buffer_size: u16,
    pub gpu: GpuConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            core_count: DEFAULT_CORE_COUNT,
            time_quantum_us: DEFAULT_TIME_QUANTUM_US,
            firmware_version: FirmwareVersion::default(),
            handle_table_capacity: DEFAULT_HANDLE_TABLE_CAPACITY,
            thread_limit: DEFAULT_THREAD_LIMIT,
            memory_limit: DEFAULT_PROCESS_MEMORY_LIMIT,
            physical_memory_size: DEFAULT_PHYSICAL_MEMORY_SIZE,
            session_limit: DEFAULT_SESSION_LIMIT,
            event_limit: DEFAULT_EVENT_LIMIT,
            pointer_buffer_size: DEFAULT_POINTER_BUFFER_SIZE,
            gpu: GpuConfig::default(),
        }
    }
}

impl KernelConfig {
    /// Load configuration from a JSON file; missing keys take defaults
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: KernelConfig = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Default configuration with environment overrides applied
    pub fn from_env() -> ConfigResult<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `HLE_*` environment variable overrides
    pub fn with_env_overrides(mut self) -> ConfigResult<Self> {
        if let Some(v) = env_parse::<usize>("HLE_CORE_COUNT")? {
            self.core_count = v;
        }
        if let Some(v) = env_parse::<u64>("HLE_TIME_QUANTUM_US")? {
            self.time_quantum_us = v;
        }
        if let Some(text) = env_var("HLE_FIRMWARE_VERSION") {
            self.firmware_version =
                FirmwareVersion::parse(&text).ok_or_else(|| ConfigError::InvalidEnv {
                    key: "HLE_FIRMWARE_VERSION".into(),
                    value: text.clone(),
                })?;
        }
        if let Some(v) = env_parse::<usize>("HLE_HANDLE_TABLE_CAPACITY")? {
            self.handle_table_capacity = v;
        }
        if let Some(v) = env_parse::<u64>("HLE_THREAD_LIMIT")? {
            self.thread_limit = v;
        }
        if let Some(v) = env_parse::<u64>("HLE_MEMORY_LIMIT")? {
            self.memory_limit = v;
        }
        if let Some(v) = env_parse::<u64>("HLE_PHYSICAL_MEMORY_SIZE")? {
            self.physical_memory_size = v;
        }
        if let Some(v) = env_parse::<u64>("HLE_SESSION_LIMIT")? {
            self.session_limit = v;
        }
        if let Some(v) = env_parse::<u64>("HLE_EVENT_LIMIT")? {
            self.event_limit = v;
        }
        if let Some(v) = env_parse::<usize>("HLE_GPU_RING_CAPACITY")? {
            self.gpu.ring_capacity = v;
        }
        if let Some(text) = env_var("HLE_GPU_SHUTDOWN_MODE") {
            self.gpu.shutdown_mode = match text.to_ascii_lowercase().as_str() {
                "drain" => ShutdownMode::Drain,
                "discard" => ShutdownMode::Discard,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: "HLE_GPU_SHUTDOWN_MODE".into(),
                        value: text,
                    })
                }
            };
        }
        Ok(self)
    }

    /// Reject configurations the kernel cannot boot with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.core_count == 0 || self.core_count > MAX_CORE_COUNT {
            return Err(ConfigError::Invalid(format!(
                "core_count must be between 1 and {}, got {}",
                MAX_CORE_COUNT, self.core_count
            )));
        }
        if self.time_quantum_us == 0 {
            return Err(ConfigError::Invalid("time_quantum_us must be non-zero".into()));
        }
        if self.handle_table_capacity == 0 || self.handle_table_capacity > MAX_HANDLE_TABLE_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "handle_table_capacity must be between 1 and {}",
                MAX_HANDLE_TABLE_CAPACITY
            )));
        }
        if self.thread_limit == 0 {
            return Err(ConfigError::Invalid("thread_limit must be non-zero".into()));
        }
        if self.memory_limit % PAGE_SIZE != 0 || self.physical_memory_size % PAGE_SIZE != 0 {
            return Err(ConfigError::Invalid("memory sizes must be page aligned".into()));
        }
        if self.gpu.ring_capacity == 0 {
            return Err(ConfigError::Invalid("gpu.ring_capacity must be non-zero".into()));
        }
        Ok(())
    }

    pub fn time_quantum(&self) -> Duration {
        Duration::from_micros(self.time_quantum_us)
    }

    pub fn with_core_count(mut self, core_count: usize) -> Self {
        self.core_count = core_count;
        self
    }

    pub fn with_time_quantum(mut self, quantum: Duration) -> Self {
        self.time_quantum_us = quantum.as_micros() as u64;
        self
    }

    pub fn with_firmware_version(mut self, version: FirmwareVersion) -> Self {
        self.firmware_version = version;
        self
    }

    pub fn with_thread_limit(mut self, limit: u64) -> Self {
        self.thread_limit = limit;
        self
    }

    pub fn with_handle_table_capacity(mut self, capacity: usize) -> Self {
        self.handle_table_capacity = capacity;
        self
    }

    pub fn with_memory_limit(mut self, limit: u64) -> Self {
        self.memory_limit = limit;
        self
    }

    pub fn with_physical_memory_size(mut self, size: u64) -> Self {
        self.physical_memory_size = size;
        self
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> ConfigResult<Option<T>> {
    match env_var(key) {
        None => Ok(None),
        Some(text) => text
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value: text,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = KernelConfig::default();
        assert_eq!(config.core_count, 4);
        assert_eq!(config.time_quantum(), Duration::from_millis(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: KernelConfig =
            serde_json::from_str(r#"{"core_count": 2, "gpu": {"shutdown_mode": "discard"}}"#).unwrap();
        assert_eq!(config.core_count, 2);
        assert_eq!(config.gpu.shutdown_mode, ShutdownMode::Discard);
        assert_eq!(config.gpu.ring_capacity, DEFAULT_GPU_RING_CAPACITY);
        assert_eq!(config.firmware_version, FirmwareVersion::new(16, 0, 0));
    }

    #[test]
    fn test_validate_rejects_zero_cores() {
        let config = KernelConfig::default().with_core_count(0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
