//! Guest memory management
//!
//! Pointer types, the packed `(address << 32) | length` word used for
//! host→guest payloads, and the bump allocator that stages those payloads in
//! buffers obtained from the guest's `malloc`.

use tracing::debug;

/// Guest pointer type (32-bit address in WASM linear memory)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestPtr(pub u32);

impl GuestPtr {
    pub fn offset(&self, bytes: u32) -> Self {
        Self(self.0.saturating_add(bytes))
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

/// Address and length of a byte range in guest memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestSlice {
    pub ptr: GuestPtr,
    pub len: u32,
}

impl GuestSlice {
    pub fn new(ptr: GuestPtr, len: u32) -> Self {
        Self { ptr, len }
    }

    pub fn from_raw(ptr: u32, len: u32) -> Self {
        Self::new(GuestPtr(ptr), len)
    }

    /// Byte range inside a memory of `memory_len` bytes, if it fits
    pub fn range_in(&self, memory_len: usize) -> Option<std::ops::Range<usize>> {
        let start = self.ptr.as_usize();
        let end = start.checked_add(self.len as usize)?;
        (end <= memory_len).then_some(start..end)
    }
}

/// Base of a buffer returned by the guest allocator, if it can be adopted.
///
/// A null base is the allocator's failure value; the whole buffer must lie
/// inside the current memory.
pub fn checked_allocation(base: u32, capacity: u32, memory_len: usize) -> Option<GuestPtr> {
    if base == 0 {
        return None;
    }
    GuestSlice::from_raw(base, capacity)
        .range_in(memory_len)
        .map(|_| GuestPtr(base))
}

/// Pack a slice into the single word returned to the guest
pub fn pack_slice(slice: GuestSlice) -> u64 {
    ((slice.ptr.0 as u64) << 32) | slice.len as u64
}

/// Inverse of [`pack_slice`]
pub fn unpack_slice(word: u64) -> GuestSlice {
    GuestSlice::from_raw((word >> 32) as u32, word as u32)
}

/// One buffer obtained from the guest allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedBuffer {
    pub base: GuestPtr,
    pub capacity: u32,
    pub cursor: u32,
}

impl AllocatedBuffer {
    pub fn remaining(&self) -> u32 {
        self.capacity - self.cursor
    }
}

/// Bump allocator over guest-owned buffers
///
/// Buffers are never returned to the guest; cursors are rewound before every
/// invocation instead, so staging a payload never needs a matching `free`.
#[derive(Debug, Clone)]
pub struct BufferPool {
    buffers: Vec<AllocatedBuffer>,
    growth_increment: u32,
}

impl BufferPool {
    pub fn new(growth_increment: u32) -> Self {
        Self {
            buffers: Vec::new(),
            growth_increment: growth_increment.max(1),
        }
    }

    pub fn buffers(&self) -> &[AllocatedBuffer] {
        &self.buffers
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Total bytes obtained from the guest
    pub fn capacity(&self) -> u64 {
        self.buffers.iter().map(|b| b.capacity as u64).sum()
    }

    /// Take `size` bytes from the first buffer with enough room
    pub fn reserve(&mut self, size: u32) -> Option<GuestPtr> {
        let buffer = self.buffers.iter_mut().find(|b| b.remaining() >= size)?;
        let ptr = buffer.base.offset(buffer.cursor);
        buffer.cursor += size;
        Some(ptr)
    }

    /// Size to request from the guest when no buffer can hold `size` bytes
    pub fn growth_for(&self, size: u32) -> u32 {
        size.max(self.growth_increment)
    }

    /// Register a fresh guest buffer and take `size` bytes from it
    pub fn adopt(&mut self, base: GuestPtr, capacity: u32, size: u32) -> GuestPtr {
        debug!(
            "Adopted guest buffer at {:?} ({} bytes, {} buffers)",
            base,
            capacity,
            self.buffers.len() + 1
        );
        self.buffers.push(AllocatedBuffer {
            base,
            capacity,
            cursor: size.min(capacity),
        });
        base
    }

    /// Rewind every cursor; buffers stay allocated in the guest
    pub fn reset(&mut self) {
        for buffer in &mut self.buffers {
            buffer.cursor = 0;
        }
    }
}
