//! Engine configuration
//!
//! Pool-wide settings threaded from the [`EngineFactory`](crate::EngineFactory)
//! constructor into every engine. Files in TOML, YAML or JSON are supported,
//! layered with `MOFA_EXTENSIONS__*` environment overrides.

use config::{Config as Cfg, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::types::{ExtensionError, ExtensionResult};

/// WASM page size in bytes
pub const WASM_PAGE_SIZE: u64 = 65536;

/// Hard ceiling for `memory_limit_pages`
pub const MAX_MEMORY_LIMIT_PAGES: u32 = 0xFFFF;

/// Used when `memory_limit_pages` is zero
pub const DEFAULT_MEMORY_LIMIT_PAGES: u32 = MAX_MEMORY_LIMIT_PAGES;

pub const DEFAULT_PREALLOCATED_BUFFER_SIZE: u32 = 1_000_000;

pub const DEFAULT_BUFFER_GROWTH_INCREMENT: u32 = 4096;

pub const DEFAULT_EPOCH_TICK_MS: u64 = 10;

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "MOFA_EXTENSIONS";

/// Optimization level for compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl From<OptimizationLevel> for wasmtime::OptLevel {
    fn from(level: OptimizationLevel) -> Self {
        match level {
            OptimizationLevel::None => wasmtime::OptLevel::None,
            OptimizationLevel::Speed => wasmtime::OptLevel::Speed,
            OptimizationLevel::SpeedAndSize => wasmtime::OptLevel::SpeedAndSize,
        }
    }
}

/// Extension engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Guest address space ceiling in 64KiB pages (0 = default)
    pub memory_limit_pages: u32,
    /// Size of the first staging buffer requested from every module
    pub preallocated_buffer_size: u32,
    /// Minimum size of staging buffers requested after the first one
    pub buffer_growth_increment: u32,
    /// Restore the memory snapshot after a failed invocation.
    ///
    /// Disable only to observe heap exhaustion in diagnostics: a module
    /// left in its failed state may keep failing.
    pub auto_recover: bool,
    /// Epoch ticker period, the granularity of execution deadlines
    pub epoch_tick_ms: u64,
    /// Cranelift optimization level
    pub optimization_level: OptimizationLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_limit_pages: 0,
            preallocated_buffer_size: DEFAULT_PREALLOCATED_BUFFER_SIZE,
            buffer_growth_increment: DEFAULT_BUFFER_GROWTH_INCREMENT,
            auto_recover: true,
            epoch_tick_ms: DEFAULT_EPOCH_TICK_MS,
            optimization_level: OptimizationLevel::Speed,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_limit_pages(mut self, pages: u32) -> Self {
        self.memory_limit_pages = pages;
        self
    }

    pub fn with_preallocated_buffer_size(mut self, size: u32) -> Self {
        self.preallocated_buffer_size = size;
        self
    }

    pub fn with_buffer_growth_increment(mut self, size: u32) -> Self {
        self.buffer_growth_increment = size;
        self
    }

    pub fn with_auto_recover(mut self, enabled: bool) -> Self {
        self.auto_recover = enabled;
        self
    }

    pub fn with_epoch_tick_ms(mut self, ms: u64) -> Self {
        self.epoch_tick_ms = ms;
        self
    }

    pub fn with_optimization(mut self, level: OptimizationLevel) -> Self {
        self.optimization_level = level;
        self
    }

    /// Memory limit with the zero default applied
    pub fn effective_memory_limit_pages(&self) -> u32 {
        if self.memory_limit_pages == 0 {
            DEFAULT_MEMORY_LIMIT_PAGES
        } else {
            self.memory_limit_pages
        }
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.effective_memory_limit_pages() as u64 * WASM_PAGE_SIZE
    }

    /// Smallest page count leaving 70% headroom over the preallocated buffer
    pub fn min_memory_limit_pages(&self) -> u32 {
        let min_bytes = self.preallocated_buffer_size as u64 * 17 / 10;
        (min_bytes / WASM_PAGE_SIZE + 1) as u32
    }

    /// Check the limits before any module is instantiated
    pub fn validate(&self) -> ExtensionResult<()> {
        let pages = self.effective_memory_limit_pages();
        if pages > MAX_MEMORY_LIMIT_PAGES {
            return Err(ExtensionError::MemoryLimitTooHigh {
                pages,
                max_pages: MAX_MEMORY_LIMIT_PAGES,
            });
        }
        let min_bytes = self.preallocated_buffer_size as u64 * 17 / 10;
        if self.memory_limit_bytes() <= min_bytes {
            return Err(ExtensionError::MemoryLimitTooLow {
                pages,
                min_pages: self.min_memory_limit_pages(),
                buffer_size: self.preallocated_buffer_size,
            });
        }
        if self.epoch_tick_ms == 0 {
            return Err(ExtensionError::Config(
                "epoch_tick_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load from a file, format detected from the extension, with
    /// environment overrides applied on top
    pub fn from_file(path: impl AsRef<Path>) -> ExtensionResult<Self> {
        let path = path.as_ref();
        let format = detect_format(path)?;
        Self::build(
            Cfg::builder()
                .add_source(File::from(path).format(format))
                .add_source(env_source(None)),
        )
    }

    /// Load from a string in the given format
    pub fn from_str(content: &str, format: FileFormat) -> ExtensionResult<Self> {
        Self::build(Cfg::builder().add_source(File::from_str(content, format)))
    }

    /// Like [`from_str`](Self::from_str) but with an explicit environment map
    /// instead of the process environment
    pub fn from_str_with_env(
        content: &str,
        format: FileFormat,
        env: HashMap<String, String>,
    ) -> ExtensionResult<Self> {
        Self::build(
            Cfg::builder()
                .add_source(File::from_str(content, format))
                .add_source(env_source(Some(env))),
        )
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> ExtensionResult<Self> {
        builder
            .build()
            .map_err(|e| ExtensionError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ExtensionError::Config(e.to_string()))
    }
}

fn env_source(source: Option<HashMap<String, String>>) -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
        .source(source)
}

/// Detect configuration format from file extension
fn detect_format(path: &Path) -> ExtensionResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ExtensionError::Config("no file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        other => Err(ExtensionError::Config(format!(
            "unsupported config format: {}",
            other
        ))),
    }
}
