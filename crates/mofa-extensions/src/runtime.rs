//! Sandbox runtime
//!
//! The wasmtime engine shared by every extension engine of a pool, the linker
//! carrying the host function bridge, and the epoch ticker that drives
//! execution deadlines.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use wasmtime::{Config, Engine, Linker, Module};

use crate::config::EngineConfig;
use crate::host;
use crate::module::ModuleState;
use crate::types::{ExtensionError, ExtensionResult};

/// Epoch deadline used when an invocation has no time limit
pub(crate) const UNBOUNDED_EPOCH_TICKS: u64 = u64::MAX / 2;

/// Background thread advancing the engine epoch
struct EpochTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
    fn start(engine: Engine, tick: Duration) -> ExtensionResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = std::thread::Builder::new()
            .name("mofa-ext-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(tick);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Shared sandbox runtime
pub struct SandboxRuntime {
    engine: Engine,
    linker: Linker<ModuleState>,
    tick: Duration,
    _ticker: EpochTicker,
}

impl SandboxRuntime {
    /// Create the engine, register the host functions and start the ticker
    pub fn new(config: &EngineConfig) -> ExtensionResult<Self> {
        let mut wasmtime_config = Config::new();
        wasmtime_config.epoch_interruption(true);
        wasmtime_config.wasm_multi_value(true);
        wasmtime_config.cranelift_opt_level(config.optimization_level.into());

        let engine = Engine::new(&wasmtime_config)
            .map_err(|e| ExtensionError::Internal(format!("Failed to create engine: {}", e)))?;

        let mut linker = Linker::new(&engine);
        host::register(&mut linker).map_err(|e| {
            ExtensionError::Internal(format!("Failed to link host functions: {}", e))
        })?;

        let tick = Duration::from_millis(config.epoch_tick_ms.max(1));
        let ticker = EpochTicker::start(engine.clone(), tick)?;

        info!(
            "Sandbox runtime created with optimization {:?}, epoch tick {:?}",
            config.optimization_level, tick
        );

        Ok(Self {
            engine,
            linker,
            tick,
            _ticker: ticker,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn linker(&self) -> &Linker<ModuleState> {
        &self.linker
    }

    /// Compile module bytes (binary or text format)
    pub fn compile(&self, name: &str, bytes: &[u8]) -> ExtensionResult<Module> {
        let start = Instant::now();
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| ExtensionError::Compilation(format!("{}: {}", name, e)))?;
        debug!(
            "Compiled module {} in {}ms ({} bytes)",
            name,
            start.elapsed().as_millis(),
            bytes.len()
        );
        Ok(module)
    }

    /// Epoch ticks covering the time left until `deadline`, at least one
    pub fn ticks_until(&self, deadline: Instant, now: Instant) -> u64 {
        let remaining = deadline.saturating_duration_since(now);
        let tick = self.tick.as_nanos().max(1);
        let ticks = remaining.as_nanos().div_ceil(tick);
        ticks.clamp(1, UNBOUNDED_EPOCH_TICKS as u128) as u64
    }
}
