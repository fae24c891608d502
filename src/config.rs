// =============================================================================
// CONFIGURATION - Load settings from engine.toml
// =============================================================================
//
// Device, dynamic heap, validation and logging settings. Every section has
// defaults, so a missing file or a missing section is not an error.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::error::EngineError;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub device: DeviceConfig,
    pub dynamic_heap: DynamicHeapConfig,
    pub validation: ValidationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Vulkan when available, host otherwise
    #[default]
    Auto,
    Vulkan,
    Host,
}

/// Device settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub backend: BackendKind,
    pub app_name: String,
    pub num_deferred_contexts: usize,
    pub validation_layers: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            app_name: "gpu-lifetime".to_string(),
            num_deferred_contexts: 0,
            validation_layers: cfg!(debug_assertions),
        }
    }
}

/// Upload page settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DynamicHeapConfig {
    pub page_size: u64,
    pub alignment: u64,
}

impl Default for DynamicHeapConfig {
    fn default() -> Self {
        Self {
            page_size: 256 * 1024,
            alignment: 256,
        }
    }
}

/// Validation settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// State verification, reconciliation warnings and stale checks
    pub enabled: bool,
    /// Panic on protocol violations instead of logging them
    pub assert_on_violation: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            assert_on_violation: false,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
            log_file: "gpu_lifetime.log".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or_else(|_| {
            log::warn!("Unknown log level '{}', defaulting to info", self.level);
            log::LevelFilter::Info
        })
    }
}

impl EngineConfig {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("engine.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load engine.toml: {:#}. Using defaults.", e);
            EngineConfig::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(EngineConfig::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.dynamic_heap.page_size == 0 {
            return Err(EngineError::Configuration(
                "dynamic_heap.page_size must not be zero".into(),
            ));
        }
        if !self.dynamic_heap.alignment.is_power_of_two() {
            return Err(EngineError::Configuration(format!(
                "dynamic_heap.alignment must be a power of two, got {}",
                self.dynamic_heap.alignment
            )));
        }
        if self.dynamic_heap.alignment > self.dynamic_heap.page_size {
            return Err(EngineError::Configuration(format!(
                "dynamic_heap.alignment ({}) exceeds the page size ({})",
                self.dynamic_heap.alignment, self.dynamic_heap.page_size
            )));
        }
        Ok(())
    }

    /// Immediate context plus deferred contexts
    pub fn num_contexts(&self) -> usize {
        1 + self.device.num_deferred_contexts
    }
}
