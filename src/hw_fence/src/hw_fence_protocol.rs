// Copyright 2024 The hw_fence Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hand-written layout of the queue structures in the carve-out.  Intended to be shared with the
//! peer domains' own implementations of the protocol, so widths and order never change.

use std::mem::size_of;

use zerocopy::AsBytes;
use zerocopy::FromBytes;

/// Version of the queue table header.
pub const HW_FENCE_HFI_TABLE_VERSION: u32 = 0x0100;

/// Queue directions
pub const HW_FENCE_QUEUE_TYPE_TX: u32 = 1;
pub const HW_FENCE_QUEUE_TYPE_RX: u32 = 2;

/// Queue header status
pub const HW_FENCE_QUEUE_STATUS_ENABLED: u32 = 1;

/// Payload type and version written by this engine.
pub const HW_FENCE_PAYLOAD_TYPE_FENCE: u16 = 1;
pub const HW_FENCE_PAYLOAD_REV: u16 = 1;

/// Number of entries in each of the two control queues.
pub const HW_FENCE_CTRL_QUEUE_ENTRIES: u32 = 8;

/// Size of one queue payload in 32-bit words, the unit of the canonical queue indices.
pub const HW_FENCE_PAYLOAD_SIZE_DWORDS: u32 = (size_of::<HwFenceQueuePayload>() / 4) as u32;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
pub struct HwFenceHfiQueueTableHeader {
    pub version: u32,
    /// Total size of the client's queue region in bytes.
    pub size: u32,
    /// Offset of the first queue header relative to this header.
    pub qhdr0_offset: u32,
    pub qhdr_size: u32,
    pub num_q: u32,
    pub num_active_q: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
pub struct HwFenceHfiQueueHeader {
    pub status: u32,
    /// Offset of the first payload slot from the start of the carve-out.
    pub start_addr: u32,
    pub queue_type: u32,
    /// Size of the payload ring in bytes.
    pub queue_size: u32,
    pub pkt_size: u32,
    pub pkt_drop_cnt: u32,
    pub rx_wm: u32,
    /// Write position for clients whose hardware consumer skips `write_index`.
    pub tx_wm: u32,
    pub read_index: u32,
    pub write_index: u32,
    pub reserved: [u32; 6],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, AsBytes, FromBytes)]
pub struct HwFenceQueuePayload {
    pub size: u32,
    pub payload_type: u16,
    pub version: u16,
    pub ctxt_id: u64,
    pub seqno: u64,
    pub hash: u64,
    pub flags: u64,
    pub client_data: u64,
    pub error: u32,
    pub timestamp_lo: u32,
    pub timestamp_hi: u32,
    pub reserve: u32,
}

impl HwFenceQueuePayload {
    /// Builds a fence payload stamped with `timestamp`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctxt_id: u64,
        seqno: u64,
        hash: u64,
        flags: u64,
        client_data: u64,
        error: u32,
        timestamp: u64,
    ) -> HwFenceQueuePayload {
        HwFenceQueuePayload {
            size: size_of::<HwFenceQueuePayload>() as u32,
            payload_type: HW_FENCE_PAYLOAD_TYPE_FENCE,
            version: HW_FENCE_PAYLOAD_REV,
            ctxt_id,
            seqno,
            hash,
            flags,
            client_data,
            error,
            timestamp_lo: timestamp as u32,
            timestamp_hi: (timestamp >> 32) as u32,
            reserve: 0,
        }
    }

    pub fn timestamp(&self) -> u64 {
        ((self.timestamp_hi as u64) << 32) | self.timestamp_lo as u64
    }
}

const _: () = assert!(size_of::<HwFenceHfiQueueTableHeader>() == 24);
const _: () = assert!(size_of::<HwFenceHfiQueueHeader>() == 64);
const _: () = assert!(size_of::<HwFenceQueuePayload>() == 64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_layout_is_bit_exact() {
        let payload = HwFenceQueuePayload::new(100, 1, 7, 1, 0xdead, 0, 0x1_0000_0002);
        let bytes = payload.as_bytes();
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[0..4], &64u32.to_ne_bytes());
        assert_eq!(&bytes[8..16], &100u64.to_ne_bytes());
        assert_eq!(&bytes[24..32], &7u64.to_ne_bytes());
        assert_eq!(&bytes[40..48], &0xdeadu64.to_ne_bytes());
        assert_eq!(payload.timestamp(), 0x1_0000_0002);

        let copy = HwFenceQueuePayload::read_from(bytes).unwrap();
        assert_eq!(copy, payload);
    }

    #[test]
    fn payload_dwords() {
        assert_eq!(HW_FENCE_PAYLOAD_SIZE_DWORDS, 16);
    }
}
