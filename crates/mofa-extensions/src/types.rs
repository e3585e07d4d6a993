//! Extension host type definitions
//!
//! Package descriptors, per-call limits and the error taxonomy shared by the
//! loader, the engine and the host function bridge.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use url::Url;

use crate::state::StateError;

/// Extension host errors
///
/// Variants are grouped by when they can occur: while loading a package,
/// while running a guest (recoverable), or because the caller asked for
/// something that does not exist.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExtensionError {
    // === Load time ===
    #[error("missing exported function: {0}")]
    MissingExport(String),

    #[error("invalid export signature for {name}: {reason}")]
    ExportSignature { name: String, reason: String },

    #[error("unsupported ABI version: {0}")]
    UnsupportedAbiVersion(String),

    #[error("incorrect extension name: {0}")]
    IncorrectExtensionName(String),

    #[error(
        "minimum memory limit is {min_pages} pages for a {buffer_size} byte preallocated buffer, got {pages}"
    )]
    MemoryLimitTooLow {
        pages: u32,
        min_pages: u32,
        buffer_size: u32,
    },

    #[error("memory limit {pages} exceeds maximum of {max_pages} pages")]
    MemoryLimitTooHigh { pages: u32, max_pages: u32 },

    #[error("package already loaded: {0}")]
    PackageAlreadyLoaded(String),

    #[error("unsupported URL: {0}")]
    UnsupportedUrl(String),

    #[error("failed to compile extension module: {0}")]
    Compilation(String),

    #[error("failed to instantiate extension module: {0}")]
    Instantiation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    // === Invocation (recoverable) ===
    #[error("guest trap: {0}")]
    Trap(String),

    #[error("guest panic: {0}")]
    GuestPanic(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("unable to read memory: offset={offset}, size={size}")]
    UnableToReadMemory { offset: u32, size: u32 },

    #[error("unable to write memory: offset={offset}, size={size}")]
    UnableToWriteMemory { offset: u32, size: u32 },

    #[error("invalid row writer kind {0}")]
    InvalidRowWriter(u32),

    #[error("state error: {0}")]
    State(#[from] StateError),

    // === Caller errors ===
    #[error("undefined package: {0}")]
    UndefinedPackage(String),

    #[error("invalid extension name: {0}")]
    InvalidExtensionName(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExtensionError {
    /// Errors raised while the guest was running. These leave the guest heap
    /// in an unknown state and trigger snapshot recovery.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ExtensionError::Trap(_)
                | ExtensionError::GuestPanic(_)
                | ExtensionError::DeadlineExceeded
                | ExtensionError::OutOfMemory(_)
                | ExtensionError::UnableToReadMemory { .. }
                | ExtensionError::UnableToWriteMemory { .. }
                | ExtensionError::InvalidRowWriter(_)
                | ExtensionError::State(_)
        )
    }

    /// Errors that abort loading a package
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            ExtensionError::MissingExport(_)
                | ExtensionError::ExportSignature { .. }
                | ExtensionError::UnsupportedAbiVersion(_)
                | ExtensionError::IncorrectExtensionName(_)
                | ExtensionError::MemoryLimitTooLow { .. }
                | ExtensionError::MemoryLimitTooHigh { .. }
                | ExtensionError::PackageAlreadyLoaded(_)
                | ExtensionError::UnsupportedUrl(_)
                | ExtensionError::Compilation(_)
                | ExtensionError::Instantiation(_)
                | ExtensionError::Io(_)
                | ExtensionError::Config(_)
        )
    }
}

/// Extension result type
pub type ExtensionResult<T> = Result<T, ExtensionError>;

/// Extension package descriptor supplied by the package loader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionPackage {
    /// Qualified package name, the key extensions are invoked under
    pub qualified_name: String,
    /// Location of the module bytecode (`file://` only)
    pub module_url: Url,
    /// Exported extension entry points
    pub extension_names: Vec<String>,
}

impl ExtensionPackage {
    pub fn new(qualified_name: &str, module_url: Url) -> Self {
        Self {
            qualified_name: qualified_name.to_string(),
            module_url,
            extension_names: Vec::new(),
        }
    }

    pub fn with_extension(mut self, name: &str) -> Self {
        if !self.extension_names.iter().any(|n| n == name) {
            self.extension_names.push(name.to_string());
        }
        self
    }

    pub fn with_extensions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            self = self.with_extension(name.as_ref());
        }
        self
    }

    /// Read the module bytecode. Only local files are supported.
    pub async fn read_bytecode(&self) -> ExtensionResult<Vec<u8>> {
        if self.module_url.scheme() != "file" {
            return Err(ExtensionError::UnsupportedUrl(self.module_url.to_string()));
        }
        let path = self
            .module_url
            .to_file_path()
            .map_err(|_| ExtensionError::UnsupportedUrl(self.module_url.to_string()))?;
        Ok(tokio::fs::read(path).await?)
    }
}

/// Per-call resource limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtensionLimits {
    /// Wall-clock ceiling per invocation, zero means unlimited
    pub execution_interval: Duration,
}

impl ExtensionLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_execution_interval(interval: Duration) -> Self {
        Self {
            execution_interval: interval,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.execution_interval.is_zero()
    }
}

/// Execution context of a single invocation
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionContext {
    pub deadline: Option<Instant>,
}

impl ExtensionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Earliest of the context deadline and `now + limits.execution_interval`
    pub fn effective_deadline(&self, limits: &ExtensionLimits, now: Instant) -> Option<Instant> {
        let limit_deadline = if limits.is_unlimited() {
            None
        } else {
            Some(now + limits.execution_interval)
        };
        match (self.deadline, limit_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
