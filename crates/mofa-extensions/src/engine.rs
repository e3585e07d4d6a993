//! Extension Engine
//!
//! Owns one [`GuestModule`] per loaded package and runs invocations against
//! them. An engine is not reentrant: `invoke` takes `&mut self`, so a caller
//! borrows an engine from the pool exclusively for the duration of a call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wasmtime::Module;

use crate::config::EngineConfig;
use crate::metrics::EngineMetrics;
use crate::module::{GuestModule, HeapStats};
use crate::runtime::{SandboxRuntime, UNBOUNDED_EPOCH_TICKS};
use crate::state::SafeState;
use crate::types::{
    ExtensionContext, ExtensionError, ExtensionLimits, ExtensionPackage, ExtensionResult,
};

/// Sandboxed extension engine
pub struct ExtensionEngine {
    id: Uuid,
    app: String,
    runtime: Arc<SandboxRuntime>,
    config: Arc<EngineConfig>,
    modules: HashMap<String, GuestModule>,
    limits: ExtensionLimits,
    metrics: Arc<EngineMetrics>,
}

impl ExtensionEngine {
    pub(crate) fn new(app: &str, runtime: Arc<SandboxRuntime>, config: Arc<EngineConfig>) -> Self {
        Self {
            id: Uuid::now_v7(),
            app: app.to_string(),
            runtime,
            config,
            modules: HashMap::new(),
            limits: ExtensionLimits::unlimited(),
            metrics: Arc::new(EngineMetrics::new()),
        }
    }

    /// Instantiate a compiled package in this engine
    pub(crate) fn load(
        &mut self,
        package: &ExtensionPackage,
        module: &Module,
    ) -> ExtensionResult<()> {
        if self.modules.contains_key(&package.qualified_name) {
            return Err(ExtensionError::PackageAlreadyLoaded(
                package.qualified_name.clone(),
            ));
        }
        let guest = GuestModule::load(&self.runtime, package, module, &self.config)?;
        self.modules.insert(package.qualified_name.clone(), guest);
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Per-call limits applied to every following invocation
    pub fn set_limits(&mut self, limits: ExtensionLimits) {
        self.limits = limits;
    }

    pub fn limits(&self) -> ExtensionLimits {
        self.limits
    }

    /// Counters shared with observers on other threads
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    /// Run `extension` of `package` with `state` bound for the call.
    ///
    /// A failed call restores the module snapshot before returning unless
    /// `auto_recover` is disabled.
    pub fn invoke(
        &mut self,
        package: &str,
        extension: &str,
        ctx: &ExtensionContext,
        state: Arc<dyn SafeState>,
    ) -> ExtensionResult<()> {
        self.metrics.record_invocation();
        let result = self.invoke_inner(package, extension, ctx, state);
        if result.is_err() {
            self.metrics.record_error();
        }
        result
    }

    fn invoke_inner(
        &mut self,
        package: &str,
        extension: &str,
        ctx: &ExtensionContext,
        state: Arc<dyn SafeState>,
    ) -> ExtensionResult<()> {
        let module = self
            .modules
            .get_mut(package)
            .ok_or_else(|| ExtensionError::UndefinedPackage(package.to_string()))?;
        let entry = module.entry(extension)?;

        let now = Instant::now();
        let ticks = match ctx.effective_deadline(&self.limits, now) {
            Some(deadline) if deadline <= now => {
                debug!(package, extension, "Deadline expired before invocation");
                return Err(ExtensionError::DeadlineExceeded);
            }
            Some(deadline) => self.runtime.ticks_until(deadline, now),
            None => UNBOUNDED_EPOCH_TICKS,
        };

        let start = Instant::now();
        let result = module.run(&entry, state, ticks);
        let elapsed = start.elapsed();

        let err = match result {
            Ok(()) => {
                debug!(
                    package,
                    extension,
                    "Invocation completed in {}µs",
                    elapsed.as_micros()
                );
                return Ok(());
            }
            Err(err) => err,
        };

        if self.config.auto_recover {
            warn!(
                engine = %self.id,
                package,
                extension,
                "Invocation failed, restoring snapshot: {}",
                err
            );
            if let Err(restore_err) = restore(module, &self.metrics) {
                error!(
                    engine = %self.id,
                    package,
                    "Snapshot restore failed, module keeps its failed state: {}",
                    restore_err
                );
            }
        } else {
            error!(
                engine = %self.id,
                package,
                extension,
                "Invocation failed, auto recovery disabled: {}",
                err
            );
        }
        Err(err)
    }

    /// Loaded module of a package, for diagnostics
    pub fn module(&self, package: &str) -> Option<&GuestModule> {
        self.modules.get(package)
    }

    fn module_mut(&mut self, package: &str) -> ExtensionResult<&mut GuestModule> {
        self.modules
            .get_mut(package)
            .ok_or_else(|| ExtensionError::UndefinedPackage(package.to_string()))
    }

    /// Guest heap counters of a loaded package
    pub fn heap_stats(&mut self, package: &str) -> ExtensionResult<HeapStats> {
        self.module_mut(package)?.heap_stats()
    }

    /// Trigger the guest's garbage collector
    pub fn gc(&mut self, package: &str) -> ExtensionResult<()> {
        self.module_mut(package)?.gc()
    }

    /// Restore a package's snapshot outside of a failed invocation
    pub fn recover(&mut self, package: &str) -> ExtensionResult<()> {
        let metrics = self.metrics.clone();
        let module = self.module_mut(package)?;
        restore(module, &metrics)
    }

    /// Names of the loaded packages, sorted
    pub fn packages(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn has_extension(&self, package: &str, extension: &str) -> bool {
        self.modules
            .get(package)
            .is_some_and(|module| module.has_extension(extension))
    }

    /// Release every module; later invocations fail with undefined package
    pub fn close(&mut self) {
        if self.modules.is_empty() {
            return;
        }
        let count = self.modules.len();
        self.modules.clear();
        info!(engine = %self.id, app = %self.app, "Closed engine, released {} modules", count);
    }
}

fn restore(module: &mut GuestModule, metrics: &EngineMetrics) -> ExtensionResult<()> {
    module.restore()?;
    metrics.record_recover();
    debug!(package = module.package(), "Restored module snapshot");
    Ok(())
}

impl std::fmt::Debug for ExtensionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionEngine")
            .field("id", &self.id)
            .field("app", &self.app)
            .field("packages", &self.packages())
            .field("limits", &self.limits)
            .finish()
    }
}
