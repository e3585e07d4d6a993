//! MoFA Extensions
//!
//! Sandboxed host for user extensions compiled to WebAssembly:
//! - One isolated module instance per package and engine
//! - Versioned host/guest ABI with a fixed set of host functions
//! - Bump-allocated staging buffers inside guest memory
//! - Snapshot recovery after failed invocations
//! - Memory ceiling and execution deadline enforcement
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      EngineFactory                          │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │  SandboxRuntime (Engine + Linker + epoch ticker)     │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                            │ new_engines(packages, N)       │
//! │  ┌──────────────┐  ┌──────────────┐       ┌──────────────┐  │
//! │  │ Engine #1    │  │ Engine #2    │  ...  │ Engine #N    │  │
//! │  │ ┌──────────┐ │  │ ┌──────────┐ │       │ ┌──────────┐ │  │
//! │  │ │ Guest    │ │  │ │ Guest    │ │       │ │ Guest    │ │  │
//! │  │ │ Module   │ │  │ │ Module   │ │       │ │ Module   │ │  │
//! │  │ │ per pkg  │ │  │ │ per pkg  │ │       │ │ per pkg  │ │  │
//! │  │ └──────────┘ │  │ └──────────┘ │       │ └──────────┘ │  │
//! │  └──────────────┘  └──────────────┘       └──────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!
//!   guest ──host_*──▶ Host Function Bridge ──▶ SafeState (platform)
//!         ◀─(addr << 32 | len)── BufferPool staging
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use mofa_extensions::{EngineConfig, EngineFactory, ExtensionContext, ExtensionPackage};
//!
//! let factory = EngineFactory::new("my-app", EngineConfig::default())?;
//! let package = ExtensionPackage::new("my.pkg", url).with_extension("exec_order");
//! let mut engines = factory.new_engines(&[package], 4).await?;
//!
//! engines[0].invoke("my.pkg", "exec_order", &ExtensionContext::new(), state)?;
//! ```

pub mod abi;
pub mod config;
mod engine;
mod factory;
mod host;
pub mod memory;
mod metrics;
mod module;
mod runtime;
pub mod state;
mod types;

pub use config::{EngineConfig, OptimizationLevel};
pub use engine::ExtensionEngine;
pub use factory::{EngineFactory, FactoryStats};
pub use memory::{AllocatedBuffer, BufferPool, GuestPtr, GuestSlice, pack_slice, unpack_slice};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use module::{GuestModule, HeapStats};
pub use runtime::SandboxRuntime;
pub use state::{
    FieldKind, FieldValue, IntentHandle, KeyBuilderHandle, KeyHandle, QName, ReadCallback,
    RowWriter, SafeState, StateError, StateResult, ValueHandle,
};
pub use types::{
    ExtensionContext, ExtensionError, ExtensionLimits, ExtensionPackage, ExtensionResult,
};
