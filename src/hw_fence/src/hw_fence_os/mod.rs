// Copyright 2024 The hw_fence Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Backing memory for the carve-out shared between domains.

mod heap;
#[cfg(unix)]
mod memory_mapping;
#[cfg(unix)]
mod shm;

pub use heap::HeapRegion;
#[cfg(unix)]
pub use memory_mapping::MemoryMapping;
#[cfg(unix)]
pub use shm::round_up_to_page_size;
#[cfg(unix)]
pub use shm::SharedMemory;

/// A contiguous, zero-initialized region every domain maps at its own address.  Only offsets
/// into the region are ever exchanged between domains.
///
/// # Safety
///
/// Implementations must return a pointer that stays valid and 8-byte aligned for `size()` bytes
/// until the region is dropped.
pub unsafe trait MappedRegion: Send + Sync {
    /// Returns a pointer to the beginning of the memory region.
    fn as_ptr(&self) -> *mut u8;

    /// Returns the size of the memory region in bytes.
    fn size(&self) -> usize;
}
