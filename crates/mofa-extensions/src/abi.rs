//! Host/guest ABI names
//!
//! The exports every guest module must provide and the import module the
//! host functions are registered under. Bump [`ABI_VERSION_EXPORT`] together
//! with any incompatible change to either side.

/// Import module of all host functions
pub const HOST_MODULE: &str = "env";

pub const MEMORY_EXPORT: &str = "memory";
pub const MALLOC_EXPORT: &str = "malloc";
pub const FREE_EXPORT: &str = "free";
/// ABI version check; a guest built for another ABI traps in it
pub const ABI_VERSION_EXPORT: &str = "abi_version_0_1";
pub const HEAP_IN_USE_EXPORT: &str = "heap_in_use";
pub const HEAP_SYS_EXPORT: &str = "heap_sys";
pub const HEAP_MALLOCS_EXPORT: &str = "heap_mallocs";
pub const HEAP_FREES_EXPORT: &str = "heap_frees";
pub const HEAP_GC_EXPORT: &str = "heap_gc";
pub const ON_READ_VALUE_EXPORT: &str = "on_read_value";

/// Exports resolved for every module at load time
pub const INFRASTRUCTURE_EXPORTS: &[&str] = &[
    MEMORY_EXPORT,
    MALLOC_EXPORT,
    FREE_EXPORT,
    ABI_VERSION_EXPORT,
    HEAP_IN_USE_EXPORT,
    HEAP_SYS_EXPORT,
    HEAP_MALLOCS_EXPORT,
    HEAP_FREES_EXPORT,
    HEAP_GC_EXPORT,
    ON_READ_VALUE_EXPORT,
];

/// Memory-management primitives commonly exported by guest toolchains
pub const MEMORY_PRIMITIVES: &[&str] = &["calloc", "realloc", "_start", "_initialize"];

/// Whether `name` may not be used as an extension name
pub fn is_reserved_name(name: &str) -> bool {
    INFRASTRUCTURE_EXPORTS.contains(&name) || MEMORY_PRIMITIVES.contains(&name)
}
