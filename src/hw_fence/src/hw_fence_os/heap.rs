// Copyright 2024 The hw_fence Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::ptr::NonNull;

use crate::hw_fence_os::MappedRegion;
use crate::hw_fence_utils::HwFenceError;
use crate::hw_fence_utils::HwFenceResult;

/// A zeroed region in process memory.  Useful when every domain sharing the carve-out lives in
/// the same address space, e.g. threads standing in for coprocessors.
pub struct HeapRegion {
    ptr: NonNull<u64>,
    words: usize,
}

// The region is only accessed through atomics and volatile copies guarded by the carve-out's
// cross-domain locks.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    pub fn new(size: usize) -> HwFenceResult<HeapRegion> {
        if size == 0 {
            return Err(HwFenceError::InvalidArgument("zero size region"));
        }

        let words = (size + 7) / 8;
        let boxed: Box<[u64]> = vec![0u64; words].into_boxed_slice();
        let raw = Box::into_raw(boxed) as *mut u64;
        let ptr = NonNull::new(raw).ok_or(HwFenceError::InvalidCarveOut)?;
        Ok(HeapRegion { ptr, words })
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // Safe because the pointer came from `Box::into_raw` of a slice with `words` elements.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.words,
            )));
        }
    }
}

unsafe impl MappedRegion for HeapRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }

    fn size(&self) -> usize {
        self.words * 8
    }
}
