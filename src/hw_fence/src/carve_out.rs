// Copyright 2024 The hw_fence Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Partitioning of the shared carve-out.  Every domain computes the same layout from the same
//! configuration, so only offsets ever cross a domain boundary.
//!
//! ```text
//! +------------------+ 0
//! | control queues   |  queue table header, TX + RX headers, 2 x 8 payloads
//! +------------------+
//! | client locks     |  one u64 per internal client id
//! +------------------+
//! | fence table      |  table_entries x HwFenceRecord
//! +------------------+
//! | client 1 queues  |  queue table header, headers, payload rings
//! | client 2 queues  |
//! | ...              |
//! +------------------+ total_size
//! ```

use std::mem::align_of;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;

use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::fence_table::HwFenceRecord;
use crate::hw_fence_os::MappedRegion;
use crate::hw_fence_protocol::*;
use crate::hw_fence_utils::*;

/// The queue table header is padded so queue headers start on a cache line.
pub const HW_FENCE_QUEUE_TABLE_HEADER_SIZE: usize = 64;
pub const HW_FENCE_QUEUE_HEADER_SIZE: usize = size_of::<HwFenceHfiQueueHeader>();
pub const HW_FENCE_PAYLOAD_SIZE: usize = size_of::<HwFenceQueuePayload>();

const HW_FENCE_REGION_ALIGN: usize = 64;

fn align_up(v: usize, align: usize) -> HwFenceResult<usize> {
    let mask = align - 1;
    let v = checked_arithmetic!(v + mask)?;
    Ok(v & !mask)
}

/// Location of one queue set (a queue table header followed by its queues).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueRegionLayout {
    pub offset: usize,
    pub size: usize,
    pub num_q: u32,
    pub entries: u32,
}

impl QueueRegionLayout {
    fn new(offset: usize, num_q: u32, entries: u32) -> HwFenceResult<QueueRegionLayout> {
        let headers = HW_FENCE_QUEUE_TABLE_HEADER_SIZE + num_q as usize * HW_FENCE_QUEUE_HEADER_SIZE;
        let ring_size = entries as usize * HW_FENCE_PAYLOAD_SIZE;
        let rings = num_q as usize;
        let payloads = checked_arithmetic!(ring_size * rings)?;
        let size = align_up(checked_arithmetic!(headers + payloads)?, HW_FENCE_REGION_ALIGN)?;

        Ok(QueueRegionLayout {
            offset,
            size,
            num_q,
            entries,
        })
    }

    pub fn queue_header_offset(&self, queue: u32) -> usize {
        self.offset + HW_FENCE_QUEUE_TABLE_HEADER_SIZE + queue as usize * HW_FENCE_QUEUE_HEADER_SIZE
    }

    pub fn payload_offset(&self, queue: u32) -> usize {
        self.offset
            + HW_FENCE_QUEUE_TABLE_HEADER_SIZE
            + self.num_q as usize * HW_FENCE_QUEUE_HEADER_SIZE
            + queue as usize * self.entries as usize * HW_FENCE_PAYLOAD_SIZE
    }

    pub fn ring_size(&self) -> usize {
        self.entries as usize * HW_FENCE_PAYLOAD_SIZE
    }
}

/// Offsets of every partition of the carve-out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CarveOutLayout {
    pub ctrl: QueueRegionLayout,
    pub locks_offset: usize,
    pub table_offset: usize,
    pub table_entries: u32,
    /// Indexed by internal client id; id 0 owns no queues.
    pub clients: Vec<Option<QueueRegionLayout>>,
    pub total_size: usize,
}

impl CarveOutLayout {
    /// Computes the layout for a table of `table_entries` records and, for each internal client
    /// id starting at 1, a `(queues_num, queue_entries)` pair.
    pub fn new(table_entries: u32, client_queues: &[(u32, u32)]) -> HwFenceResult<CarveOutLayout> {
        if table_entries == 0 {
            return Err(HwFenceError::InvalidConfig("empty fence table"));
        }

        let num_clients = client_queues.len() + 1;
        checked_range!(num_clients; <= HW_FENCE_MAX_CLIENTS)?;

        let ctrl = QueueRegionLayout::new(0, 2, HW_FENCE_CTRL_QUEUE_ENTRIES)?;
        let locks_offset = ctrl.size;
        let locks_size = align_up(HW_FENCE_MAX_CLIENTS * size_of::<u64>(), HW_FENCE_REGION_ALIGN)?;

        let table_offset = checked_arithmetic!(locks_offset + locks_size)?;
        let record_size = size_of::<HwFenceRecord>();
        let entries = table_entries as usize;
        let table_size = align_up(checked_arithmetic!(entries * record_size)?, HW_FENCE_REGION_ALIGN)?;

        let mut offset = checked_arithmetic!(table_offset + table_size)?;
        let mut clients = vec![None];
        for &(num_q, queue_entries) in client_queues {
            if num_q == 0 || queue_entries < 2 {
                clients.push(None);
                continue;
            }

            let region = QueueRegionLayout::new(offset, num_q, queue_entries)?;
            let region_size = region.size;
            offset = checked_arithmetic!(offset + region_size)?;
            clients.push(Some(region));
        }

        // Queue headers store offsets as u32.
        let total_size = offset;
        let max_offset = u32::MAX as usize;
        checked_range!(total_size; <= max_offset)?;

        Ok(CarveOutLayout {
            ctrl,
            locks_offset,
            table_offset,
            table_entries,
            clients,
            total_size,
        })
    }
}

/// The mapped carve-out together with its layout.
pub struct CarveOut {
    region: Box<dyn MappedRegion>,
    layout: CarveOutLayout,
}

impl CarveOut {
    pub fn new(region: Box<dyn MappedRegion>, layout: CarveOutLayout) -> HwFenceResult<CarveOut> {
        if region.size() < layout.total_size
            || region.as_ptr() as usize % align_of::<HwFenceRecord>() != 0
        {
            return Err(HwFenceError::InvalidCarveOut);
        }

        Ok(CarveOut { region, layout })
    }

    pub fn layout(&self) -> &CarveOutLayout {
        &self.layout
    }

    pub(crate) fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.region.size());
        // Safe because every offset handed out by the layout is inside the region.
        unsafe { self.region.as_ptr().add(offset) }
    }

    /// Returns the shared object of type `T` at `offset`.
    ///
    /// # Safety
    ///
    /// `T` must only contain atomics (or other types valid for any bit pattern with interior
    /// mutability), and `offset` must be aligned for `T` and within the layout.
    pub(crate) unsafe fn ref_at<T>(&self, offset: usize) -> &T {
        &*(self.ptr_at(offset) as *const T)
    }

    pub(crate) fn u32_at(&self, offset: usize) -> &AtomicU32 {
        // Safe because offsets of 32-bit header fields are 4-byte aligned.
        unsafe { self.ref_at::<AtomicU32>(offset) }
    }

    pub(crate) fn client_lock(&self, internal_id: u32) -> &AtomicU64 {
        let offset = self.layout.locks_offset + internal_id as usize * size_of::<u64>();
        // Safe because the lock region holds HW_FENCE_MAX_CLIENTS aligned words.
        unsafe { self.ref_at::<AtomicU64>(offset) }
    }

    pub(crate) fn record(&self, hash: u64) -> &HwFenceRecord {
        debug_assert!(hash < self.layout.table_entries as u64);
        let offset = self.layout.table_offset + hash as usize * size_of::<HwFenceRecord>();
        // Safe because HwFenceRecord consists of atomics only and the table region is aligned.
        unsafe { self.ref_at::<HwFenceRecord>(offset) }
    }

    /// Copies `obj` into the carve-out at `offset`.
    pub(crate) fn write_obj<T: AsBytes>(&self, offset: usize, obj: &T) {
        let bytes = obj.as_bytes();
        debug_assert!(offset + bytes.len() <= self.region.size());
        // Safe because the layout keeps every object inside the region, and a private value
        // never overlaps the mapping.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr_at(offset), bytes.len()) }
    }

    /// Copies the object at `offset` out of the carve-out.  Any bit pattern is accepted.
    pub(crate) fn read_obj<T: AsBytes + FromBytes + Default>(&self, offset: usize) -> T {
        let mut obj = T::default();
        let bytes = obj.as_bytes_mut();
        debug_assert!(offset + bytes.len() <= self.region.size());
        // Safe for the same reasons as `write_obj`.
        unsafe { ptr::copy_nonoverlapping(self.ptr_at(offset), bytes.as_mut_ptr(), bytes.len()) }
        obj
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::hw_fence_os::HeapRegion;

    #[test]
    fn layout_partitions_do_not_overlap() {
        let layout = CarveOutLayout::new(64, &[(2, 64), (1, 32), (0, 0), (2, 128)]).unwrap();

        assert_eq!(layout.ctrl.offset, 0);
        assert!(layout.locks_offset >= layout.ctrl.offset + layout.ctrl.size);
        assert!(layout.table_offset >= layout.locks_offset + HW_FENCE_MAX_CLIENTS * 8);
        assert_eq!(layout.clients.len(), 5);
        assert!(layout.clients[0].is_none());
        assert!(layout.clients[3].is_none());

        let table_end = layout.table_offset + 64 * size_of::<HwFenceRecord>();
        let first = layout.clients[1].as_ref().unwrap();
        assert!(first.offset >= table_end);

        let mut end = first.offset;
        for region in layout.clients.iter().flatten() {
            assert!(region.offset >= end);
            assert_eq!(region.offset % HW_FENCE_REGION_ALIGN, 0);
            assert!(region.payload_offset(region.num_q - 1) + region.ring_size() <= region.offset + region.size);
            end = region.offset + region.size;
        }
        assert_eq!(end, layout.total_size);
    }

    #[test]
    fn too_many_clients_is_rejected() {
        let clients = vec![(1, 8); HW_FENCE_MAX_CLIENTS];
        assert!(matches!(
            CarveOutLayout::new(16, &clients),
            Err(HwFenceError::CheckedRange { .. })
        ));
    }

    #[test]
    fn headers_land_at_index_offsets() {
        let layout = CarveOutLayout::new(16, &[(1, 8)]).unwrap();
        let region = HeapRegion::new(layout.total_size).unwrap();
        let carve_out = CarveOut::new(Box::new(region), layout).unwrap();
        let offset = carve_out.layout().clients[1].as_ref().unwrap().queue_header_offset(0);

        let hdr = HwFenceHfiQueueHeader {
            tx_wm: 3,
            read_index: 5,
            write_index: 7,
            ..Default::default()
        };
        carve_out.write_obj(offset, &hdr);
        assert_eq!(carve_out.u32_at(offset + 28).load(Ordering::SeqCst), 3);
        assert_eq!(carve_out.u32_at(offset + 32).load(Ordering::SeqCst), 5);
        assert_eq!(carve_out.u32_at(offset + 36).load(Ordering::SeqCst), 7);

        carve_out.u32_at(offset + 32).store(9, Ordering::SeqCst);
        let back: HwFenceHfiQueueHeader = carve_out.read_obj(offset);
        assert_eq!((back.read_index, back.write_index), (9, 7));
    }

    #[test]
    fn small_region_is_rejected() {
        let layout = CarveOutLayout::new(64, &[(2, 64)]).unwrap();
        let region = HeapRegion::new(layout.total_size / 2).unwrap();
        assert!(matches!(
            CarveOut::new(Box::new(region), layout),
            Err(HwFenceError::InvalidCarveOut)
        ));
    }
}
