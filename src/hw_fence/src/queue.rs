// Copyright 2024 The hw_fence Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ring buffers of fence payloads shared with a peer domain.
//!
//! Indices stored in a queue header are dword offsets into the payload ring.  Some hardware
//! consumers use their own index convention, described by a start value and a factor:
//! `canonical = (raw - start) * factor`.

use std::mem::size_of;
use std::sync::atomic::fence;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use log::trace;
use log::warn;

use crate::carve_out::CarveOut;
use crate::carve_out::QueueRegionLayout;
use crate::carve_out::HW_FENCE_QUEUE_HEADER_SIZE;
use crate::carve_out::HW_FENCE_QUEUE_TABLE_HEADER_SIZE;
use crate::hw_fence_protocol::*;
use crate::hw_fence_utils::*;

// Byte offsets of the index fields inside `HwFenceHfiQueueHeader`.
const QHDR_TX_WM: usize = 28;
const QHDR_READ_INDEX: usize = 32;
const QHDR_WRITE_INDEX: usize = 36;

/// Location and index convention of one queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HwFenceQueue {
    pub queue_type: u32,
    pub header_offset: usize,
    pub payload_offset: usize,
    pub entries: u32,
    pub idx_start: u32,
    pub idx_factor: u32,
    /// Advance `tx_wm` instead of `write_index`.
    pub skip_wr_idx: bool,
}

impl HwFenceQueue {
    /// Queues of a client: queue 0 is TX and carries the client's index convention, queue 1
    /// (when present) is RX and uses canonical indices.
    pub fn client_queues(
        region: &QueueRegionLayout,
        txq_idx_start: u32,
        txq_idx_factor: u32,
        skip_txq_wr_idx: bool,
    ) -> Vec<HwFenceQueue> {
        (0..region.num_q.min(2))
            .map(|q| {
                let tx = q == 0;
                HwFenceQueue {
                    queue_type: if tx {
                        HW_FENCE_QUEUE_TYPE_TX
                    } else {
                        HW_FENCE_QUEUE_TYPE_RX
                    },
                    header_offset: region.queue_header_offset(q),
                    payload_offset: region.payload_offset(q),
                    entries: region.entries,
                    idx_start: if tx { txq_idx_start } else { 0 },
                    idx_factor: if tx { txq_idx_factor } else { 1 },
                    skip_wr_idx: tx && skip_txq_wr_idx,
                }
            })
            .collect()
    }

    /// Ring size in dwords.
    fn size(&self) -> u32 {
        self.entries * HW_FENCE_PAYLOAD_SIZE_DWORDS
    }

    fn to_canonical(&self, raw: u32) -> HwFenceResult<u32> {
        let idx = raw.wrapping_sub(self.idx_start).wrapping_mul(self.idx_factor);
        let last = self.size() - HW_FENCE_PAYLOAD_SIZE_DWORDS;
        checked_range!(idx; <= last)?;
        if idx % HW_FENCE_PAYLOAD_SIZE_DWORDS != 0 {
            return Err(HwFenceError::InvalidArgument("unaligned queue index"));
        }
        Ok(idx)
    }

    fn to_raw(&self, idx: u32) -> u32 {
        idx / self.idx_factor + self.idx_start
    }

    fn index<'a>(&self, carve_out: &'a CarveOut, field: usize) -> &'a AtomicU32 {
        carve_out.u32_at(self.header_offset + field)
    }

    /// Field holding the producer position.
    fn write_field<'a>(&self, carve_out: &'a CarveOut) -> &'a AtomicU32 {
        if self.skip_wr_idx {
            self.index(carve_out, QHDR_TX_WM)
        } else {
            self.index(carve_out, QHDR_WRITE_INDEX)
        }
    }

    fn slot_offset(&self, idx: u32) -> usize {
        self.payload_offset + idx as usize * size_of::<u32>()
    }

    fn next(&self, idx: u32) -> u32 {
        let next = idx + HW_FENCE_PAYLOAD_SIZE_DWORDS;
        if next >= self.size() {
            0
        } else {
            next
        }
    }

    /// Writes the queue header with both indices at the start of the ring.
    pub fn init(&self, carve_out: &CarveOut) {
        let start = self.to_raw(0);
        let hdr = HwFenceHfiQueueHeader {
            status: HW_FENCE_QUEUE_STATUS_ENABLED,
            start_addr: self.payload_offset as u32,
            queue_type: self.queue_type,
            queue_size: self.size() * size_of::<u32>() as u32,
            pkt_size: size_of::<HwFenceQueuePayload>() as u32,
            pkt_drop_cnt: 0,
            rx_wm: 0,
            tx_wm: start,
            read_index: start,
            write_index: start,
            reserved: [0; 6],
        };
        carve_out.write_obj(self.header_offset, &hdr);
        fence(Ordering::SeqCst);
    }

    /// Appends `payload`.  Fails without touching the queue when less than two free slots
    /// remain, so a queue of N entries holds at most N - 1 payloads.
    pub fn write(&self, carve_out: &CarveOut, payload: &HwFenceQueuePayload) -> HwFenceResult<()> {
        let read_field = self.index(carve_out, QHDR_READ_INDEX);
        let write_field = self.write_field(carve_out);

        fence(Ordering::SeqCst);
        let read_idx = self.to_canonical(read_field.load(Ordering::Relaxed))?;
        let write_idx = self.to_canonical(write_field.load(Ordering::Relaxed))?;

        let free = if read_idx <= write_idx {
            self.size() - (write_idx - read_idx)
        } else {
            read_idx - write_idx
        };
        if free <= HW_FENCE_PAYLOAD_SIZE_DWORDS {
            warn!(
                "queue at {:#x} full: read {} write {}",
                self.header_offset, read_idx, write_idx
            );
            return Err(HwFenceError::QueueFull);
        }

        carve_out.write_obj(self.slot_offset(write_idx), payload);
        let write_idx = self.next(write_idx);

        fence(Ordering::SeqCst);
        write_field.store(self.to_raw(write_idx), Ordering::Relaxed);
        fence(Ordering::SeqCst);

        trace!(
            "queue at {:#x} wrote hash {} error {}, write index now {}",
            self.header_offset,
            payload.hash,
            payload.error,
            write_idx
        );
        Ok(())
    }

    /// Pops the oldest payload.  The flag tells whether more payloads are pending.
    pub fn read(&self, carve_out: &CarveOut) -> HwFenceResult<(HwFenceQueuePayload, bool)> {
        let read_field = self.index(carve_out, QHDR_READ_INDEX);
        let write_field = self.write_field(carve_out);

        fence(Ordering::SeqCst);
        let read_idx = self.to_canonical(read_field.load(Ordering::Relaxed))?;
        let write_idx = self.to_canonical(write_field.load(Ordering::Relaxed))?;
        if read_idx == write_idx {
            return Err(HwFenceError::QueueEmpty);
        }

        let payload = carve_out.read_obj::<HwFenceQueuePayload>(self.slot_offset(read_idx));
        let read_idx = self.next(read_idx);

        fence(Ordering::SeqCst);
        read_field.store(self.to_raw(read_idx), Ordering::Relaxed);
        fence(Ordering::SeqCst);

        trace!(
            "queue at {:#x} read hash {}, read index now {}",
            self.header_offset,
            payload.hash,
            read_idx
        );
        Ok((payload, read_idx != write_idx))
    }

    /// Sets the error of a queued payload for `hash`.  Only the two oldest unread payloads are
    /// searched; a match in the second is moved to the front.
    pub fn update_existing_tx_entry(
        &self,
        carve_out: &CarveOut,
        hash: u64,
        error: u32,
    ) -> HwFenceResult<()> {
        fence(Ordering::SeqCst);
        let read_idx = self.to_canonical(self.index(carve_out, QHDR_READ_INDEX).load(Ordering::Relaxed))?;
        let write_idx = self.to_canonical(self.write_field(carve_out).load(Ordering::Relaxed))?;

        let first = read_idx;
        let mut idx = read_idx;
        for pos in 0..2 {
            if idx == write_idx {
                break;
            }

            let mut payload = carve_out.read_obj::<HwFenceQueuePayload>(self.slot_offset(idx));
            if payload.hash == hash {
                payload.error = error;
                if pos == 1 {
                    let front = carve_out.read_obj::<HwFenceQueuePayload>(self.slot_offset(first));
                    carve_out.write_obj(self.slot_offset(idx), &front);
                    carve_out.write_obj(self.slot_offset(first), &payload);
                } else {
                    carve_out.write_obj(self.slot_offset(idx), &payload);
                }
                fence(Ordering::SeqCst);
                return Ok(());
            }
            idx = self.next(idx);
        }

        Err(HwFenceError::NotFound)
    }

    /// Drops everything the consumer has not read yet.
    pub fn discard_unread(&self, carve_out: &CarveOut) {
        let pos = self.write_field(carve_out).load(Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.index(carve_out, QHDR_READ_INDEX).store(pos, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    /// Rewinds the producer to the consumer position.
    pub fn discard_unconsumed(&self, carve_out: &CarveOut) {
        let pos = self.index(carve_out, QHDR_READ_INDEX).load(Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.write_field(carve_out).store(pos, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    /// Raw header, for diagnostics.
    pub fn header(&self, carve_out: &CarveOut) -> HwFenceHfiQueueHeader {
        carve_out.read_obj(self.header_offset)
    }
}

/// Writes the queue table header of a queue set and initializes its queues.
pub fn init_queue_set(carve_out: &CarveOut, region: &QueueRegionLayout, queues: &[HwFenceQueue]) {
    let table_hdr = HwFenceHfiQueueTableHeader {
        version: HW_FENCE_HFI_TABLE_VERSION,
        size: region.size as u32,
        qhdr0_offset: HW_FENCE_QUEUE_TABLE_HEADER_SIZE as u32,
        qhdr_size: HW_FENCE_QUEUE_HEADER_SIZE as u32,
        num_q: region.num_q,
        num_active_q: queues.len() as u32,
    };
    carve_out.write_obj(region.offset, &table_hdr);

    for queue in queues {
        queue.init(carve_out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carve_out::CarveOutLayout;
    use crate::hw_fence_os::HeapRegion;

    fn new_carve_out(entries: u32) -> CarveOut {
        let layout = CarveOutLayout::new(16, &[(2, entries)]).unwrap();
        let region = HeapRegion::new(layout.total_size).unwrap();
        CarveOut::new(Box::new(region), layout).unwrap()
    }

    fn queues(carve_out: &CarveOut, start: u32, factor: u32, skip: bool) -> Vec<HwFenceQueue> {
        let region = carve_out.layout().clients[1].clone().unwrap();
        let queues = HwFenceQueue::client_queues(&region, start, factor, skip);
        init_queue_set(carve_out, &region, &queues);
        queues
    }

    fn payload(hash: u64) -> HwFenceQueuePayload {
        HwFenceQueuePayload::new(100, hash, hash, 1, 0, 0, 0)
    }

    #[test]
    fn fifo_order() {
        let carve_out = new_carve_out(8);
        let tx = &queues(&carve_out, 0, 1, false)[0];

        for hash in 0..5 {
            tx.write(&carve_out, &payload(hash)).unwrap();
        }
        for hash in 0..5 {
            let (p, more) = tx.read(&carve_out).unwrap();
            assert_eq!(p.hash, hash);
            assert_eq!(more, hash != 4);
        }
        assert!(matches!(tx.read(&carve_out), Err(HwFenceError::QueueEmpty)));
    }

    #[test]
    fn full_queue_is_left_untouched() {
        let carve_out = new_carve_out(4);
        let rx = &queues(&carve_out, 0, 1, false)[1];

        for hash in 0..3 {
            rx.write(&carve_out, &payload(hash)).unwrap();
        }
        let before = rx.header(&carve_out);
        assert!(matches!(
            rx.write(&carve_out, &payload(3)),
            Err(HwFenceError::QueueFull)
        ));
        let after = rx.header(&carve_out);
        assert_eq!(before.read_index, after.read_index);
        assert_eq!(before.write_index, after.write_index);

        // Draining one makes room for exactly one more, across the wrap.
        rx.read(&carve_out).unwrap();
        rx.write(&carve_out, &payload(3)).unwrap();
        for hash in 1..4 {
            assert_eq!(rx.read(&carve_out).unwrap().0.hash, hash);
        }
    }

    #[test]
    fn header_describes_ring() {
        let carve_out = new_carve_out(8);
        let qs = queues(&carve_out, 0, 1, false);
        let hdr = qs[1].header(&carve_out);

        assert_eq!(hdr.status, HW_FENCE_QUEUE_STATUS_ENABLED);
        assert_eq!(hdr.queue_type, HW_FENCE_QUEUE_TYPE_RX);
        assert_eq!(hdr.queue_size, 8 * 64);
        assert_eq!(hdr.pkt_size, 64);
        assert_eq!(hdr.start_addr as usize, qs[1].payload_offset);
    }

    #[test]
    fn custom_index_and_high_water_mark() {
        let carve_out = new_carve_out(8);
        let tx = &queues(&carve_out, 8, 4, true)[0];

        let hdr = tx.header(&carve_out);
        assert_eq!(hdr.read_index, 8);
        assert_eq!(hdr.tx_wm, 8);

        tx.write(&carve_out, &payload(1)).unwrap();
        tx.write(&carve_out, &payload(2)).unwrap();

        let hdr = tx.header(&carve_out);
        // Two payloads are 32 dwords, i.e. 8 raw units past the start.
        assert_eq!(hdr.tx_wm, 16);
        assert_eq!(hdr.write_index, 8);
        assert_eq!(hdr.read_index, 8);

        assert_eq!(tx.read(&carve_out).unwrap().0.hash, 1);
        assert_eq!(tx.header(&carve_out).read_index, 12);
    }

    #[test]
    fn corrupt_index_is_rejected() {
        let carve_out = new_carve_out(4);
        let tx = &queues(&carve_out, 0, 1, false)[0];
        carve_out
            .u32_at(tx.header_offset + QHDR_WRITE_INDEX)
            .store(4 * 16, Ordering::SeqCst);

        assert!(matches!(
            tx.write(&carve_out, &payload(1)),
            Err(HwFenceError::CheckedRange { .. })
        ));
    }

    #[test]
    fn update_existing_entry() {
        let carve_out = new_carve_out(8);
        let tx = &queues(&carve_out, 0, 1, false)[0];
        for hash in 1..=3 {
            tx.write(&carve_out, &payload(hash)).unwrap();
        }

        // Third entry is out of reach.
        assert!(matches!(
            tx.update_existing_tx_entry(&carve_out, 3, 5),
            Err(HwFenceError::NotFound)
        ));

        tx.update_existing_tx_entry(&carve_out, 2, 7).unwrap();
        let (first, _) = tx.read(&carve_out).unwrap();
        assert_eq!((first.hash, first.error), (2, 7));
        let (second, _) = tx.read(&carve_out).unwrap();
        assert_eq!((second.hash, second.error), (1, 0));
        let (third, more) = tx.read(&carve_out).unwrap();
        assert_eq!((third.hash, third.error, more), (3, 0, false));
    }

    #[test]
    fn discard() {
        let carve_out = new_carve_out(8);
        let qs = queues(&carve_out, 0, 1, false);
        for hash in 0..3 {
            qs[0].write(&carve_out, &payload(hash)).unwrap();
            qs[1].write(&carve_out, &payload(hash)).unwrap();
        }

        qs[0].discard_unread(&carve_out);
        qs[1].discard_unconsumed(&carve_out);
        assert!(matches!(qs[0].read(&carve_out), Err(HwFenceError::QueueEmpty)));
        assert!(matches!(qs[1].read(&carve_out), Err(HwFenceError::QueueEmpty)));

        let hdr = qs[1].header(&carve_out);
        assert_eq!(hdr.read_index, 0);
        assert_eq!(hdr.write_index, 0);
    }
}
