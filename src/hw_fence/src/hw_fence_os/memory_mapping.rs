// Copyright 2024 The hw_fence Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::num::NonZeroUsize;
use std::os::unix::io::AsRawFd;

use libc::c_void;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;

use crate::hw_fence_os::MappedRegion;
use crate::hw_fence_os::SharedMemory;
use crate::hw_fence_utils::HwFenceError;
use crate::hw_fence_utils::HwFenceResult;

/// Wraps a shared memory mapping in the current process. Provides RAII semantics including
/// munmap when no longer needed.
#[derive(Debug)]
pub struct MemoryMapping {
    addr: *mut c_void,
    size: usize,
}

// The mapping is only accessed through atomics and volatile copies.
unsafe impl Send for MemoryMapping {}
unsafe impl Sync for MemoryMapping {}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // This is safe because we mmap the area at addr ourselves, and nobody
        // else is holding a reference to it.
        if let Err(e) = unsafe { munmap(self.addr, self.size) } {
            log::error!("failed to unmap carve-out: {}", e);
        }
    }
}

impl MemoryMapping {
    /// Maps the whole of `shm` read-write and shared, so that every mapping of the same memfd
    /// (in this or another process) observes the same carve-out.
    pub fn from_shared_memory(shm: &SharedMemory) -> HwFenceResult<MemoryMapping> {
        let size: usize = shm.size().try_into()?;
        let non_zero_size =
            NonZeroUsize::new(size).ok_or(HwFenceError::InvalidArgument("zero size mapping"))?;

        // Safe because we map a descriptor we own with a size it was truncated to, and the
        // mapping is released in `drop`.
        let addr = unsafe {
            mmap(
                None,
                non_zero_size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                shm.as_raw_fd(),
                0,
            )?
        };
        Ok(MemoryMapping { addr, size })
    }
}

unsafe impl MappedRegion for MemoryMapping {
    fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    fn size(&self) -> usize {
        self.size
    }
}
