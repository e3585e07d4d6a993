//! Guest Module
//!
//! One instantiated extension module: its store, the resolved infrastructure
//! exports, the named extension entry points and the memory snapshot taken
//! right after initialization.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wasmtime::{
    Global, Instance, Memory, Module, Mutability, ResourceLimiter, Store, Trap, TypedFunc, Val,
    WasmParams, WasmResults,
};

use crate::abi;
use crate::config::EngineConfig;
use crate::memory::{AllocatedBuffer, BufferPool, checked_allocation};
use crate::runtime::{SandboxRuntime, UNBOUNDED_EPOCH_TICKS};
use crate::state::SafeState;
use crate::types::{ExtensionError, ExtensionPackage, ExtensionResult};

const MAX_TABLE_ELEMENTS: usize = 10_000;
const WASM_PAGE_SIZE: u64 = 65536;

/// Store limiter enforcing the memory ceiling
pub(crate) struct MemoryLimiter {
    limit_bytes: usize,
    /// Set when a growth request was denied during the current call
    pub(crate) limit_hit: bool,
}

impl MemoryLimiter {
    fn new(limit_bytes: u64) -> Self {
        Self {
            limit_bytes: usize::try_from(limit_bytes).unwrap_or(usize::MAX),
            limit_hit: false,
        }
    }
}

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired > self.limit_bytes {
            warn!(
                current_bytes = current,
                desired_bytes = desired,
                limit_bytes = self.limit_bytes,
                "Guest memory growth rejected: exceeds limit"
            );
            self.limit_hit = true;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= MAX_TABLE_ELEMENTS)
    }
}

/// Infrastructure exports every guest provides
#[derive(Clone)]
pub(crate) struct GuestExports {
    pub(crate) memory: Memory,
    pub(crate) malloc: TypedFunc<u32, u32>,
    pub(crate) free: TypedFunc<u32, ()>,
    pub(crate) abi_version: TypedFunc<(), ()>,
    pub(crate) heap_in_use: TypedFunc<(), u64>,
    pub(crate) heap_sys: TypedFunc<(), u64>,
    pub(crate) heap_mallocs: TypedFunc<(), u64>,
    pub(crate) heap_frees: TypedFunc<(), u64>,
    pub(crate) heap_gc: TypedFunc<(), ()>,
    pub(crate) on_read_value: TypedFunc<(u64, u64), ()>,
}

impl GuestExports {
    fn resolve(instance: &Instance, store: &mut Store<ModuleState>) -> ExtensionResult<Self> {
        let memory = instance
            .get_memory(&mut *store, abi::MEMORY_EXPORT)
            .ok_or_else(|| ExtensionError::MissingExport(abi::MEMORY_EXPORT.to_string()))?;

        Ok(Self {
            memory,
            malloc: typed_export(instance, store, abi::MALLOC_EXPORT)?,
            free: typed_export(instance, store, abi::FREE_EXPORT)?,
            abi_version: typed_export(instance, store, abi::ABI_VERSION_EXPORT)?,
            heap_in_use: typed_export(instance, store, abi::HEAP_IN_USE_EXPORT)?,
            heap_sys: typed_export(instance, store, abi::HEAP_SYS_EXPORT)?,
            heap_mallocs: typed_export(instance, store, abi::HEAP_MALLOCS_EXPORT)?,
            heap_frees: typed_export(instance, store, abi::HEAP_FREES_EXPORT)?,
            heap_gc: typed_export(instance, store, abi::HEAP_GC_EXPORT)?,
            on_read_value: typed_export(instance, store, abi::ON_READ_VALUE_EXPORT)?,
        })
    }
}

fn typed_export<P, R>(
    instance: &Instance,
    store: &mut Store<ModuleState>,
    name: &str,
) -> ExtensionResult<TypedFunc<P, R>>
where
    P: WasmParams,
    R: WasmResults,
{
    let func = instance
        .get_func(&mut *store, name)
        .ok_or_else(|| ExtensionError::MissingExport(name.to_string()))?;
    func.typed::<P, R>(&*store)
        .map_err(|e| ExtensionError::ExportSignature {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

/// Data held by every module store, reachable from host functions
pub(crate) struct ModuleState {
    pub(crate) package: String,
    pub(crate) limiter: MemoryLimiter,
    pub(crate) buffers: BufferPool,
    pub(crate) exports: Option<GuestExports>,
    /// Adapter bound for the running invocation only
    pub(crate) state: Option<Arc<dyn SafeState>>,
}

impl ModuleState {
    pub(crate) fn new(package: &str, config: &EngineConfig) -> Self {
        Self {
            package: package.to_string(),
            limiter: MemoryLimiter::new(config.memory_limit_bytes()),
            buffers: BufferPool::new(config.buffer_growth_increment),
            exports: None,
            state: None,
        }
    }
}

/// Guest heap counters reported by the introspection exports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapStats {
    pub in_use: u64,
    pub sys: u64,
    pub mallocs: u64,
    pub frees: u64,
}

/// Copy of the guest state taken right after initialization
struct MemorySnapshot {
    memory: Vec<u8>,
    /// Exported mutable globals with a numeric value, by export name
    globals: Vec<(String, Val)>,
    buffers: BufferPool,
}

impl MemorySnapshot {
    fn capture(instance: &Instance, store: &mut Store<ModuleState>, memory: Memory) -> Self {
        let exported: Vec<(String, Global)> = instance
            .exports(&mut *store)
            .filter_map(|export| {
                let name = export.name().to_string();
                export.into_global().map(|global| (name, global))
            })
            .collect();

        let mut globals = Vec::with_capacity(exported.len());
        for (name, global) in exported {
            if global.ty(&*store).mutability() != Mutability::Var {
                continue;
            }
            let value = global.get(&mut *store);
            if matches!(
                value,
                Val::I32(_) | Val::I64(_) | Val::F32(_) | Val::F64(_) | Val::V128(_)
            ) {
                globals.push((name, value));
            }
        }

        Self {
            memory: memory.data(&*store).to_vec(),
            globals,
            buffers: store.data().buffers.clone(),
        }
    }

    /// Overlay the captured state on a freshly initialized instance
    fn apply(
        &self,
        instance: &Instance,
        store: &mut Store<ModuleState>,
        memory: Memory,
    ) -> ExtensionResult<()> {
        let current = memory.data_size(&*store) as u64;
        let captured = self.memory.len() as u64;
        if current < captured {
            memory
                .grow(&mut *store, (captured - current).div_ceil(WASM_PAGE_SIZE))
                .map_err(|e| ExtensionError::Internal(format!("failed to grow memory: {}", e)))?;
        }

        let data = memory.data_mut(&mut *store);
        data[..self.memory.len()].copy_from_slice(&self.memory);
        data[self.memory.len()..].fill(0);

        for (name, value) in &self.globals {
            let global = instance.get_global(&mut *store, name).ok_or_else(|| {
                ExtensionError::Internal(format!("global {} vanished on restore", name))
            })?;
            global
                .set(&mut *store, value.clone())
                .map_err(|e| ExtensionError::Internal(format!("failed to restore global: {}", e)))?;
        }

        let buffers = &mut store.data_mut().buffers;
        *buffers = self.buffers.clone();
        buffers.reset();
        Ok(())
    }
}

/// Store, instance and exports of a module that passed initialization
struct Initialized {
    store: Store<ModuleState>,
    instance: Instance,
    exports: GuestExports,
}

/// Instantiate `module` in a new store, check the ABI version and preallocate the
/// first staging buffer
fn initialize(
    runtime: &SandboxRuntime,
    module: &Module,
    name: &str,
    config: &EngineConfig,
) -> ExtensionResult<Initialized> {
    let mut store = Store::new(runtime.engine(), ModuleState::new(name, config));
    store.limiter(|state| &mut state.limiter);
    store.set_epoch_deadline(UNBOUNDED_EPOCH_TICKS);

    let instance = runtime
        .linker()
        .instantiate(&mut store, module)
        .map_err(|e| ExtensionError::Instantiation(format!("{}: {:#}", name, e)))?;

    let exports = GuestExports::resolve(&instance, &mut store)?;
    store.data_mut().exports = Some(exports.clone());

    exports
        .abi_version
        .call(&mut store, ())
        .map_err(|e| ExtensionError::UnsupportedAbiVersion(format!("{}: {:#}", name, e)))?;

    let size = config.preallocated_buffer_size;
    let preallocation_failed = |reason: ExtensionError| {
        ExtensionError::Instantiation(format!("{}: failed to preallocate buffer: {}", name, reason))
    };
    let base = exports.malloc.call(&mut store, size).map_err(|e| {
        let limit_hit = store.data().limiter.limit_hit;
        preallocation_failed(classify(e, limit_hit))
    })?;
    let memory_len = exports.memory.data_size(&store);
    let base = checked_allocation(base, size, memory_len).ok_or_else(|| {
        preallocation_failed(ExtensionError::UnableToWriteMemory { offset: base, size })
    })?;
    store.data_mut().buffers.adopt(base, size, 0);
    store.data_mut().limiter.limit_hit = false;

    Ok(Initialized {
        store,
        instance,
        exports,
    })
}

/// Resolve the declared extension entry points
fn resolve_extensions<'a>(
    instance: &Instance,
    store: &mut Store<ModuleState>,
    names: impl IntoIterator<Item = &'a String>,
) -> ExtensionResult<HashMap<String, TypedFunc<(), ()>>> {
    let mut extensions = HashMap::new();
    for extension in names {
        if extension.is_empty() || abi::is_reserved_name(extension) {
            return Err(ExtensionError::IncorrectExtensionName(extension.clone()));
        }
        let func = typed_export::<(), ()>(instance, store, extension)?;
        extensions.insert(extension.clone(), func);
    }
    Ok(extensions)
}

/// Map a failed guest call to the error taxonomy
pub(crate) fn classify(err: wasmtime::Error, memory_limit_hit: bool) -> ExtensionError {
    if let Some(Trap::Interrupt) = err.downcast_ref::<Trap>() {
        return ExtensionError::DeadlineExceeded;
    }
    if memory_limit_hit {
        return ExtensionError::OutOfMemory(format!("{:#}", err));
    }
    match err.downcast::<ExtensionError>() {
        Ok(err) => err,
        Err(err) => ExtensionError::Trap(format!("{:#}", err)),
    }
}

/// One instantiated, non-reentrant extension module
pub struct GuestModule {
    package: String,
    runtime: Arc<SandboxRuntime>,
    config: Arc<EngineConfig>,
    module: Module,
    store: Store<ModuleState>,
    exports: GuestExports,
    extensions: HashMap<String, TypedFunc<(), ()>>,
    snapshot: MemorySnapshot,
}

impl GuestModule {
    /// Instantiate `module` for `package` and prepare it for invocations
    pub(crate) fn load(
        runtime: &Arc<SandboxRuntime>,
        package: &ExtensionPackage,
        module: &Module,
        config: &Arc<EngineConfig>,
    ) -> ExtensionResult<Self> {
        let name = package.qualified_name.as_str();
        let Initialized {
            mut store,
            instance,
            exports,
        } = initialize(runtime, module, name, config)?;

        let snapshot = MemorySnapshot::capture(&instance, &mut store, exports.memory);
        debug!(
            "Captured snapshot of {}: {} bytes of memory, {} globals",
            name,
            snapshot.memory.len(),
            snapshot.globals.len()
        );

        let extensions = resolve_extensions(&instance, &mut store, &package.extension_names)?;

        info!(
            "Loaded package {} with {} extensions",
            name,
            extensions.len()
        );

        Ok(Self {
            package: name.to_string(),
            runtime: runtime.clone(),
            config: config.clone(),
            module: module.clone(),
            store,
            exports,
            extensions,
            snapshot,
        })
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.contains_key(name)
    }

    pub fn extension_names(&self) -> impl Iterator<Item = &str> {
        self.extensions.keys().map(String::as_str)
    }

    /// Entry point of a declared extension
    pub(crate) fn entry(&self, extension: &str) -> ExtensionResult<TypedFunc<(), ()>> {
        self.extensions
            .get(extension)
            .cloned()
            .ok_or_else(|| ExtensionError::InvalidExtensionName(extension.to_string()))
    }

    /// Run an entry point with `state` bound, under an epoch deadline
    pub(crate) fn run(
        &mut self,
        entry: &TypedFunc<(), ()>,
        state: Arc<dyn SafeState>,
        deadline_ticks: u64,
    ) -> ExtensionResult<()> {
        {
            let data = self.store.data_mut();
            data.state = Some(state);
            data.buffers.reset();
            data.limiter.limit_hit = false;
        }
        self.store.set_epoch_deadline(deadline_ticks);

        let result = entry.call(&mut self.store, ());

        self.store.set_epoch_deadline(UNBOUNDED_EPOCH_TICKS);
        let data = self.store.data_mut();
        data.state = None;
        let limit_hit = std::mem::take(&mut data.limiter.limit_hit);

        result.map_err(|e| classify(e, limit_hit))
    }

    /// Roll the guest back to its post-initialization state.
    ///
    /// The module is instantiated again in a new store and initialized the
    /// same way as at load, then the snapshot is laid over it. Guest state
    /// outside linear memory, such as unexported globals, starts over with
    /// the new instance. The current instance is kept if any step fails.
    pub(crate) fn restore(&mut self) -> ExtensionResult<()> {
        let Initialized {
            mut store,
            instance,
            exports,
        } = initialize(&self.runtime, &self.module, &self.package, &self.config)?;
        self.snapshot.apply(&instance, &mut store, exports.memory)?;
        let extensions = resolve_extensions(&instance, &mut store, self.extensions.keys())?;

        self.store = store;
        self.exports = exports;
        self.extensions = extensions;
        debug!(
            "Reinstantiated {} from snapshot ({} buffer bytes)",
            self.package,
            self.store.data().buffers.capacity()
        );
        Ok(())
    }

    fn call_counter(&mut self, func: TypedFunc<(), u64>) -> ExtensionResult<u64> {
        func.call(&mut self.store, ()).map_err(|e| {
            let limit_hit = self.store.data().limiter.limit_hit;
            classify(e, limit_hit)
        })
    }

    pub fn heap_stats(&mut self) -> ExtensionResult<HeapStats> {
        let exports = self.exports.clone();
        Ok(HeapStats {
            in_use: self.call_counter(exports.heap_in_use)?,
            sys: self.call_counter(exports.heap_sys)?,
            mallocs: self.call_counter(exports.heap_mallocs)?,
            frees: self.call_counter(exports.heap_frees)?,
        })
    }

    /// Trigger the guest's manual garbage collection
    pub fn gc(&mut self) -> ExtensionResult<()> {
        let gc = self.exports.heap_gc.clone();
        gc.call(&mut self.store, ()).map_err(|e| classify(e, false))
    }

    /// Current size of the guest linear memory in bytes
    pub fn memory_size(&self) -> usize {
        self.exports.memory.data_size(&self.store)
    }

    pub fn buffers(&self) -> &[AllocatedBuffer] {
        self.store.data().buffers.buffers()
    }
}

#[cfg(test)]
impl GuestModule {
    /// Replace the compiled module instantiated on the next restore
    pub(crate) fn set_restore_module(&mut self, module: Module) {
        self.module = module;
    }
}
