//! Host function bridge
//!
//! Functions imported by guests from the `env` module. Each one translates
//! guest pointers and opaque handles into calls on the [`SafeState`] bound to
//! the running invocation. Host→guest payloads are staged in buffers taken
//! from the guest allocator and returned as packed `(address << 32) | length`
//! words.
//!
//! Failures are returned as [`ExtensionError`] wrapped in a wasmtime error;
//! the call site in [`GuestModule`](crate::module::GuestModule) recovers the
//! original variant.

use std::sync::Arc;
use tracing::debug;
use wasmtime::{Caller, Linker, Memory};

use crate::abi::HOST_MODULE;
use crate::memory::{GuestSlice, checked_allocation, pack_slice};
use crate::module::{GuestExports, ModuleState};
use crate::state::{
    FieldKind, FieldValue, KeyBuilderHandle, KeyHandle, QName, RowWriter, SafeState, StateError,
    ValueHandle,
};
use crate::types::ExtensionError;

fn trap(err: impl Into<ExtensionError>) -> wasmtime::Error {
    wasmtime::Error::new(err.into())
}

fn guest_exports(caller: &Caller<'_, ModuleState>) -> wasmtime::Result<GuestExports> {
    caller
        .data()
        .exports
        .clone()
        .ok_or_else(|| trap(ExtensionError::Internal("guest exports not resolved".to_string())))
}

fn guest_memory(caller: &Caller<'_, ModuleState>) -> wasmtime::Result<Memory> {
    caller
        .data()
        .exports
        .as_ref()
        .map(|exports| exports.memory)
        .ok_or_else(|| trap(ExtensionError::Internal("guest memory not resolved".to_string())))
}

fn bound_state(caller: &Caller<'_, ModuleState>) -> wasmtime::Result<Arc<dyn SafeState>> {
    caller.data().state.clone().ok_or_else(|| {
        trap(ExtensionError::Internal(format!(
            "no state bound to {}",
            caller.data().package
        )))
    })
}

fn read_bytes(caller: &Caller<'_, ModuleState>, ptr: u32, len: u32) -> wasmtime::Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let data = memory.data(caller);
    GuestSlice::from_raw(ptr, len)
        .range_in(data.len())
        .map(|range| data[range].to_vec())
        .ok_or_else(|| {
            trap(ExtensionError::UnableToReadMemory {
                offset: ptr,
                size: len,
            })
        })
}

fn read_string(caller: &Caller<'_, ModuleState>, ptr: u32, len: u32) -> wasmtime::Result<String> {
    String::from_utf8(read_bytes(caller, ptr, len)?).map_err(|e| {
        trap(ExtensionError::Trap(format!(
            "invalid UTF-8 string at offset {}: {}",
            ptr, e
        )))
    })
}

/// Copy `bytes` into guest memory, growing the buffer pool if needed
fn stage(caller: &mut Caller<'_, ModuleState>, bytes: &[u8]) -> wasmtime::Result<u64> {
    let size = u32::try_from(bytes.len()).map_err(|_| {
        trap(ExtensionError::UnableToWriteMemory {
            offset: 0,
            size: u32::MAX,
        })
    })?;

    let reserved = caller.data_mut().buffers.reserve(size);
    let ptr = match reserved {
        Some(ptr) => ptr,
        None => {
            let malloc = guest_exports(caller)?.malloc;
            let capacity = caller.data().buffers.growth_for(size);
            let base = malloc.call(&mut *caller, capacity)?;
            let memory_len = guest_memory(caller)?.data_size(&*caller);
            let base = checked_allocation(base, capacity, memory_len).ok_or_else(|| {
                trap(ExtensionError::UnableToWriteMemory {
                    offset: base,
                    size: capacity,
                })
            })?;
            caller.data_mut().buffers.adopt(base, capacity, size)
        }
    };

    let memory = guest_memory(caller)?;
    memory
        .write(&mut *caller, ptr.as_usize(), bytes)
        .map_err(|_| {
            trap(ExtensionError::UnableToWriteMemory {
                offset: ptr.0,
                size,
            })
        })?;

    Ok(pack_slice(GuestSlice::new(ptr, size)))
}

/// Field addressed by a reader
#[derive(Clone, Copy)]
enum FieldRef {
    Key { key: u64, name_ptr: u32, name_len: u32 },
    Value { value: u64, name_ptr: u32, name_len: u32 },
    Item { value: u64, index: u32 },
}

fn read_field(
    caller: &Caller<'_, ModuleState>,
    field: FieldRef,
    kind: FieldKind,
) -> wasmtime::Result<FieldValue> {
    let state = bound_state(caller)?;
    let result = match field {
        FieldRef::Key {
            key,
            name_ptr,
            name_len,
        } => {
            let name = read_string(caller, name_ptr, name_len)?;
            state.key_field(KeyHandle(key), &name, kind)
        }
        FieldRef::Value {
            value,
            name_ptr,
            name_len,
        } => {
            let name = read_string(caller, name_ptr, name_len)?;
            state.value_field(ValueHandle(value), &name, kind)
        }
        FieldRef::Item { value, index } => state.value_item(ValueHandle(value), index, kind),
    };
    result.map_err(trap)
}

fn put_field(
    caller: &Caller<'_, ModuleState>,
    id: u64,
    kind: u32,
    name_ptr: u32,
    name_len: u32,
    value: FieldValue,
) -> wasmtime::Result<()> {
    let writer =
        RowWriter::from_tag(id, kind).ok_or_else(|| trap(ExtensionError::InvalidRowWriter(kind)))?;
    let name = read_string(caller, name_ptr, name_len)?;
    bound_state(caller)?
        .put_field(writer, &name, value)
        .map_err(trap)
}

/// Register the scalar, string and qname readers under `<prefix>_<kind>`
macro_rules! field_readers {
    ($linker:ident, $prefix:literal, |$($arg:ident: $ty:ty),*| $field:expr) => {
        $linker.func_wrap(
            HOST_MODULE,
            concat!($prefix, "_string"),
            |mut caller: Caller<'_, ModuleState>, $($arg: $ty),*| -> wasmtime::Result<u64> {
                let text = read_field(&caller, $field, FieldKind::String)?
                    .into_string()
                    .map_err(trap)?;
                stage(&mut caller, text.as_bytes())
            },
        )?;
        $linker.func_wrap(
            HOST_MODULE,
            concat!($prefix, "_bytes"),
            |mut caller: Caller<'_, ModuleState>, $($arg: $ty),*| -> wasmtime::Result<u64> {
                let bytes = read_field(&caller, $field, FieldKind::Bytes)?
                    .into_bytes()
                    .map_err(trap)?;
                stage(&mut caller, &bytes)
            },
        )?;
        $linker.func_wrap(
            HOST_MODULE,
            concat!($prefix, "_int32"),
            |caller: Caller<'_, ModuleState>, $($arg: $ty),*| -> wasmtime::Result<i32> {
                read_field(&caller, $field, FieldKind::Int32)?
                    .as_i32()
                    .map_err(trap)
            },
        )?;
        $linker.func_wrap(
            HOST_MODULE,
            concat!($prefix, "_int64"),
            |caller: Caller<'_, ModuleState>, $($arg: $ty),*| -> wasmtime::Result<i64> {
                read_field(&caller, $field, FieldKind::Int64)?
                    .as_i64()
                    .map_err(trap)
            },
        )?;
        $linker.func_wrap(
            HOST_MODULE,
            concat!($prefix, "_float32"),
            |caller: Caller<'_, ModuleState>, $($arg: $ty),*| -> wasmtime::Result<f32> {
                read_field(&caller, $field, FieldKind::Float32)?
                    .as_f32()
                    .map_err(trap)
            },
        )?;
        $linker.func_wrap(
            HOST_MODULE,
            concat!($prefix, "_float64"),
            |caller: Caller<'_, ModuleState>, $($arg: $ty),*| -> wasmtime::Result<f64> {
                read_field(&caller, $field, FieldKind::Float64)?
                    .as_f64()
                    .map_err(trap)
            },
        )?;
        $linker.func_wrap(
            HOST_MODULE,
            concat!($prefix, "_bool"),
            |caller: Caller<'_, ModuleState>, $($arg: $ty),*| -> wasmtime::Result<u32> {
                read_field(&caller, $field, FieldKind::Bool)?
                    .as_bool()
                    .map(u32::from)
                    .map_err(trap)
            },
        )?;
        $linker.func_wrap(
            HOST_MODULE,
            concat!($prefix, "_qname_pkg"),
            |mut caller: Caller<'_, ModuleState>, $($arg: $ty),*| -> wasmtime::Result<u64> {
                let qname = read_field(&caller, $field, FieldKind::QName)?
                    .into_qname()
                    .map_err(trap)?;
                stage(&mut caller, qname.package.as_bytes())
            },
        )?;
        $linker.func_wrap(
            HOST_MODULE,
            concat!($prefix, "_qname_entity"),
            |mut caller: Caller<'_, ModuleState>, $($arg: $ty),*| -> wasmtime::Result<u64> {
                let qname = read_field(&caller, $field, FieldKind::QName)?
                    .into_qname()
                    .map_err(trap)?;
                stage(&mut caller, qname.entity.as_bytes())
            },
        )?;
    };
}

/// Register every host function on the linker
pub(crate) fn register(linker: &mut Linker<ModuleState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "host_panic",
        |caller: Caller<'_, ModuleState>, ptr: u32, len: u32| -> wasmtime::Result<()> {
            let message = read_string(&caller, ptr, len)?;
            debug!("Guest {} panicked: {}", caller.data().package, message);
            Err(trap(ExtensionError::GuestPanic(message)))
        },
    )?;

    // === Keys and reads ===

    linker.func_wrap(
        HOST_MODULE,
        "host_get_key",
        |caller: Caller<'_, ModuleState>,
         storage_ptr: u32,
         storage_len: u32,
         entity_ptr: u32,
         entity_len: u32|
         -> wasmtime::Result<u64> {
            let storage = read_string(&caller, storage_ptr, storage_len)?;
            let entity = read_string(&caller, entity_ptr, entity_len)?;
            let key = bound_state(&caller)?
                .key_builder(&storage, &entity)
                .map_err(trap)?;
            Ok(key.0)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "host_must_exist",
        |caller: Caller<'_, ModuleState>, key: u64| -> wasmtime::Result<u64> {
            let value = bound_state(&caller)?
                .must_exist(KeyBuilderHandle(key))
                .map_err(trap)?;
            Ok(value.0)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "host_can_exist",
        |caller: Caller<'_, ModuleState>, key: u64| -> wasmtime::Result<(u32, u64)> {
            let value = bound_state(&caller)?
                .can_exist(KeyBuilderHandle(key))
                .map_err(trap)?;
            Ok(match value {
                Some(value) => (1, value.0),
                None => (0, 0),
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "host_read_values",
        |mut caller: Caller<'_, ModuleState>, key: u64| -> wasmtime::Result<()> {
            let state = bound_state(&caller)?;
            let on_read_value = guest_exports(&caller)?.on_read_value;

            // Guest failures stop the iteration and are reported as-is
            let mut guest_error = None;
            let mut on_row = |key: KeyHandle, value: ValueHandle| {
                on_read_value
                    .call(&mut caller, (key.0, value.0))
                    .map_err(|e| {
                        guest_error = Some(e);
                        StateError::Interrupted
                    })
            };
            let result = state.read_values(KeyBuilderHandle(key), &mut on_row);

            if let Some(e) = guest_error {
                return Err(e);
            }
            result.map_err(trap)
        },
    )?;

    // === Intents ===

    linker.func_wrap(
        HOST_MODULE,
        "host_new_value",
        |caller: Caller<'_, ModuleState>, key: u64| -> wasmtime::Result<u64> {
            let intent = bound_state(&caller)?
                .new_value(KeyBuilderHandle(key))
                .map_err(trap)?;
            Ok(intent.0)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "host_update_value",
        |caller: Caller<'_, ModuleState>, key: u64, existing: u64| -> wasmtime::Result<u64> {
            let intent = bound_state(&caller)?
                .update_value(KeyBuilderHandle(key), ValueHandle(existing))
                .map_err(trap)?;
            Ok(intent.0)
        },
    )?;

    // === Row writers ===

    linker.func_wrap(
        HOST_MODULE,
        "host_row_writer_put_string",
        |caller: Caller<'_, ModuleState>,
         id: u64,
         kind: u32,
         name_ptr: u32,
         name_len: u32,
         value_ptr: u32,
         value_len: u32|
         -> wasmtime::Result<()> {
            let value = read_string(&caller, value_ptr, value_len)?;
            put_field(&caller, id, kind, name_ptr, name_len, FieldValue::String(value))
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "host_row_writer_put_bytes",
        |caller: Caller<'_, ModuleState>,
         id: u64,
         kind: u32,
         name_ptr: u32,
         name_len: u32,
         value_ptr: u32,
         value_len: u32|
         -> wasmtime::Result<()> {
            let value = read_bytes(&caller, value_ptr, value_len)?;
            put_field(&caller, id, kind, name_ptr, name_len, FieldValue::Bytes(value))
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "host_row_writer_put_int32",
        |caller: Caller<'_, ModuleState>,
         id: u64,
         kind: u32,
         name_ptr: u32,
         name_len: u32,
         value: i32|
         -> wasmtime::Result<()> {
            put_field(&caller, id, kind, name_ptr, name_len, FieldValue::Int32(value))
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "host_row_writer_put_int64",
        |caller: Caller<'_, ModuleState>,
         id: u64,
         kind: u32,
         name_ptr: u32,
         name_len: u32,
         value: i64|
         -> wasmtime::Result<()> {
            put_field(&caller, id, kind, name_ptr, name_len, FieldValue::Int64(value))
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "host_row_writer_put_float32",
        |caller: Caller<'_, ModuleState>,
         id: u64,
         kind: u32,
         name_ptr: u32,
         name_len: u32,
         value: f32|
         -> wasmtime::Result<()> {
            put_field(&caller, id, kind, name_ptr, name_len, FieldValue::Float32(value))
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "host_row_writer_put_float64",
        |caller: Caller<'_, ModuleState>,
         id: u64,
         kind: u32,
         name_ptr: u32,
         name_len: u32,
         value: f64|
         -> wasmtime::Result<()> {
            put_field(&caller, id, kind, name_ptr, name_len, FieldValue::Float64(value))
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "host_row_writer_put_bool",
        |caller: Caller<'_, ModuleState>,
         id: u64,
         kind: u32,
         name_ptr: u32,
         name_len: u32,
         value: u32|
         -> wasmtime::Result<()> {
            put_field(&caller, id, kind, name_ptr, name_len, FieldValue::Bool(value != 0))
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "host_row_writer_put_qname",
        |caller: Caller<'_, ModuleState>,
         id: u64,
         kind: u32,
         name_ptr: u32,
         name_len: u32,
         pkg_ptr: u32,
         pkg_len: u32,
         entity_ptr: u32,
         entity_len: u32|
         -> wasmtime::Result<()> {
            let package = read_string(&caller, pkg_ptr, pkg_len)?;
            let entity = read_string(&caller, entity_ptr, entity_len)?;
            let value = FieldValue::QName(QName { package, entity });
            put_field(&caller, id, kind, name_ptr, name_len, value)
        },
    )?;

    // === Accessors ===

    field_readers!(linker, "host_key_as", |key: u64, name_ptr: u32, name_len: u32| {
        FieldRef::Key {
            key,
            name_ptr,
            name_len,
        }
    });
    field_readers!(linker, "host_value_as", |value: u64, name_ptr: u32, name_len: u32| {
        FieldRef::Value {
            value,
            name_ptr,
            name_len,
        }
    });
    field_readers!(linker, "host_value_get_as", |value: u64, index: u32| {
        FieldRef::Item { value, index }
    });

    linker.func_wrap(
        HOST_MODULE,
        "host_value_as_value",
        |caller: Caller<'_, ModuleState>,
         value: u64,
         name_ptr: u32,
         name_len: u32|
         -> wasmtime::Result<u64> {
            let field = FieldRef::Value {
                value,
                name_ptr,
                name_len,
            };
            let nested = read_field(&caller, field, FieldKind::Value)?
                .as_value()
                .map_err(trap)?;
            Ok(nested.0)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "host_value_get_as_value",
        |caller: Caller<'_, ModuleState>, value: u64, index: u32| -> wasmtime::Result<u64> {
            let nested = read_field(&caller, FieldRef::Item { value, index }, FieldKind::Value)?
                .as_value()
                .map_err(trap)?;
            Ok(nested.0)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "host_value_len",
        |caller: Caller<'_, ModuleState>, value: u64| -> wasmtime::Result<u32> {
            bound_state(&caller)?
                .value_len(ValueHandle(value))
                .map_err(trap)
        },
    )?;

    Ok(())
}
