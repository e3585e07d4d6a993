//! Safe State Adapter
//!
//! The capability an invocation uses to read and write platform state. The
//! platform's state/intents subsystem implements [`SafeState`]; the host
//! function bridge resolves the guest's opaque handles through it.
//!
//! Handles are minted by the adapter and are only meaningful for the
//! invocation they were minted in.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for u64 {
            fn from(handle: $name) -> Self {
                handle.0
            }
        }
    };
}

handle!(
    /// Key of a row produced by `read_values`
    KeyHandle
);
handle!(
    /// Stored value (record or view row)
    ValueHandle
);
handle!(
    /// Key under construction
    KeyBuilderHandle
);
handle!(
    /// Pending write (new or updated value)
    IntentHandle
);

/// Qualified name: package plus entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QName {
    pub package: String,
    pub entity: String,
}

impl QName {
    pub fn new(package: &str, entity: &str) -> Self {
        Self {
            package: package.to_string(),
            entity: entity.to_string(),
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.package, self.entity)
    }
}

/// Representation the guest asked a field to be read as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    String,
    Bytes,
    Int32,
    Int64,
    Float32,
    Float64,
    Bool,
    QName,
    Value,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::String => write!(f, "string"),
            FieldKind::Bytes => write!(f, "bytes"),
            FieldKind::Int32 => write!(f, "int32"),
            FieldKind::Int64 => write!(f, "int64"),
            FieldKind::Float32 => write!(f, "float32"),
            FieldKind::Float64 => write!(f, "float64"),
            FieldKind::Bool => write!(f, "bool"),
            FieldKind::QName => write!(f, "qname"),
            FieldKind::Value => write!(f, "value"),
        }
    }
}

/// A field value crossing the host/guest boundary
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Bytes(Vec<u8>),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    QName(QName),
    /// Nested value, e.g. a container field
    Value(ValueHandle),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::String(_) => FieldKind::String,
            FieldValue::Bytes(_) => FieldKind::Bytes,
            FieldValue::Int32(_) => FieldKind::Int32,
            FieldValue::Int64(_) => FieldKind::Int64,
            FieldValue::Float32(_) => FieldKind::Float32,
            FieldValue::Float64(_) => FieldKind::Float64,
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::QName(_) => FieldKind::QName,
            FieldValue::Value(_) => FieldKind::Value,
        }
    }

    fn mismatch(&self, expected: FieldKind) -> StateError {
        StateError::TypeMismatch {
            expected,
            actual: self.kind(),
        }
    }

    pub fn into_string(self) -> StateResult<String> {
        match self {
            FieldValue::String(s) => Ok(s),
            other => Err(other.mismatch(FieldKind::String)),
        }
    }

    pub fn into_bytes(self) -> StateResult<Vec<u8>> {
        match self {
            FieldValue::Bytes(b) => Ok(b),
            other => Err(other.mismatch(FieldKind::Bytes)),
        }
    }

    pub fn into_qname(self) -> StateResult<QName> {
        match self {
            FieldValue::QName(q) => Ok(q),
            other => Err(other.mismatch(FieldKind::QName)),
        }
    }

    pub fn as_i32(&self) -> StateResult<i32> {
        match self {
            FieldValue::Int32(v) => Ok(*v),
            other => Err(other.mismatch(FieldKind::Int32)),
        }
    }

    pub fn as_i64(&self) -> StateResult<i64> {
        match self {
            FieldValue::Int64(v) => Ok(*v),
            FieldValue::Int32(v) => Ok(*v as i64),
            other => Err(other.mismatch(FieldKind::Int64)),
        }
    }

    pub fn as_f32(&self) -> StateResult<f32> {
        match self {
            FieldValue::Float32(v) => Ok(*v),
            other => Err(other.mismatch(FieldKind::Float32)),
        }
    }

    pub fn as_f64(&self) -> StateResult<f64> {
        match self {
            FieldValue::Float64(v) => Ok(*v),
            FieldValue::Float32(v) => Ok(*v as f64),
            other => Err(other.mismatch(FieldKind::Float64)),
        }
    }

    pub fn as_bool(&self) -> StateResult<bool> {
        match self {
            FieldValue::Bool(v) => Ok(*v),
            other => Err(other.mismatch(FieldKind::Bool)),
        }
    }

    pub fn as_value(&self) -> StateResult<ValueHandle> {
        match self {
            FieldValue::Value(v) => Ok(*v),
            other => Err(other.mismatch(FieldKind::Value)),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Bytes(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int32(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int64(v)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        FieldValue::Float32(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float64(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<QName> for FieldValue {
    fn from(v: QName) -> Self {
        FieldValue::QName(v)
    }
}

/// Target of a row-writer mutation, discriminated on the wire by a kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowWriter {
    KeyBuilder(KeyBuilderHandle),
    Intent(IntentHandle),
}

impl RowWriter {
    pub const KEY_BUILDER_TAG: u32 = 0;
    pub const INTENT_TAG: u32 = 1;

    /// Decode the `(id, kind)` pair passed by the guest
    pub fn from_tag(id: u64, kind: u32) -> Option<Self> {
        match kind {
            Self::KEY_BUILDER_TAG => Some(RowWriter::KeyBuilder(KeyBuilderHandle(id))),
            Self::INTENT_TAG => Some(RowWriter::Intent(IntentHandle(id))),
            _ => None,
        }
    }
}

/// Errors raised by a state adapter
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StateError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: FieldKind, actual: FieldKind },

    #[error("invalid handle: {0}")]
    InvalidHandle(u64),

    #[error("index {index} out of range for value of length {len}")]
    IndexOutOfRange { index: u32, len: u32 },

    /// Iteration stopped by the callback
    #[error("iteration interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}

/// State adapter result type
pub type StateResult<T> = Result<T, StateError>;

/// Callback invoked for every row produced by [`SafeState::read_values`]
pub type ReadCallback<'a> = dyn FnMut(KeyHandle, ValueHandle) -> StateResult<()> + 'a;

/// Per-invocation state/intents capability
///
/// Implementations must be safe to rebind on every call: the engine binds a
/// fresh adapter for each invocation and drops it when the call returns.
pub trait SafeState: Send + Sync {
    // === Keys ===

    /// Start building a key for `entity` in `storage`
    fn key_builder(&self, storage: &str, entity: &str) -> StateResult<KeyBuilderHandle>;

    // === Reads ===

    /// Value for the key, failing if it does not exist
    fn must_exist(&self, key: KeyBuilderHandle) -> StateResult<ValueHandle>;

    /// Value for the key, if it exists
    fn can_exist(&self, key: KeyBuilderHandle) -> StateResult<Option<ValueHandle>>;

    /// Call `callback` for every row matching the key. An error from the
    /// callback stops the iteration and is returned.
    fn read_values(&self, key: KeyBuilderHandle, callback: &mut ReadCallback<'_>)
    -> StateResult<()>;

    // === Intents ===

    fn new_value(&self, key: KeyBuilderHandle) -> StateResult<IntentHandle>;

    fn update_value(
        &self,
        key: KeyBuilderHandle,
        existing: ValueHandle,
    ) -> StateResult<IntentHandle>;

    /// Set a field on a key builder or an intent
    fn put_field(&self, writer: RowWriter, name: &str, value: FieldValue) -> StateResult<()>;

    // === Accessors ===

    fn key_field(&self, key: KeyHandle, name: &str, kind: FieldKind) -> StateResult<FieldValue>;

    fn value_field(&self, value: ValueHandle, name: &str, kind: FieldKind)
    -> StateResult<FieldValue>;

    /// Positional access for list-like values
    fn value_item(&self, value: ValueHandle, index: u32, kind: FieldKind)
    -> StateResult<FieldValue>;

    fn value_len(&self, value: ValueHandle) -> StateResult<u32>;
}
