// Copyright 2024 The hw_fence Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Delivery of signaled fences to their waiters and to the join records depending on them.

use log::debug;
use log::error;
use log::warn;

use crate::client::ClientSlot;
use crate::hw_fence_core::HwFence;
use crate::hw_fence_protocol::HwFenceQueuePayload;
use crate::hw_fence_utils::*;
use crate::lock::lock;

impl HwFence {
    /// Runs everything that follows a fence becoming signaled.  `info` must be the snapshot taken
    /// under the record lock when the fence was marked signaled.
    pub(crate) fn complete(&self, info: HwFenceInfo) {
        self.dispatch(&info);
        for &parent in info.parents() {
            self.signal_parent(parent, &info);
        }
    }

    /// Notifies every waiter of `info`, in ascending internal id order.
    pub(crate) fn dispatch(&self, info: &HwFenceInfo) {
        let mask = info.wait_client_mask & !(1u64 << HW_FENCE_CLIENT_ID_CTX0);
        for internal_id in 0..HW_FENCE_MAX_CLIENTS as u32 {
            if mask & (1u64 << internal_id) == 0 {
                continue;
            }

            match self.clients.slot(internal_id) {
                Some(slot) => self.deliver(slot, info),
                None => warn!("fence {} waited on by unknown client {}", info.hash, internal_id),
            }
        }
    }

    /// Delivers `info` to one client.  Failures are logged and never retried.
    pub(crate) fn deliver(&self, slot: &ClientSlot, info: &HwFenceInfo) {
        if info.error != 0 {
            if let Some(handler) = self.states[slot.internal_id as usize].error_handler() {
                debug!(
                    "fence {} error {} reported to client {} callback",
                    info.hash, info.error, slot.client_id
                );
                handler.call(HwFenceErrorData {
                    ctx_id: info.ctx_id,
                    seq_id: info.seq_id,
                    hash: info.hash,
                    flags: info.flags,
                    error: info.error,
                });
                return;
            }
        }

        if slot.update_rxq {
            if let Some(rxq) = slot.rx_queue() {
                let client_data = slot
                    .client_data_idx
                    .map(|idx| info.client_data[idx])
                    .unwrap_or(0);
                let payload = HwFenceQueuePayload::new(
                    info.ctx_id,
                    info.seq_id,
                    info.hash,
                    info.flags,
                    client_data,
                    info.error,
                    self.now(),
                );

                let _guard = lock(
                    self.carve_out.client_lock(slot.internal_id),
                    self.domain_id,
                    self.doorbell.as_ref(),
                );
                if let Err(e) = rxq.write(&self.carve_out, &payload) {
                    error!(
                        "failed to queue fence {} for client {}: {}",
                        info.hash, slot.client_id, e
                    );
                }
            }
        }

        if slot.send_ipc {
            if let Err(e) = self
                .ipc
                .trigger_signal(self.domain_id, slot.ipc_domain, slot.signal_id)
            {
                error!(
                    "failed to signal domain {} for client {}: {}",
                    slot.ipc_domain, slot.client_id, e
                );
            }
        }
    }

    /// Accounts signaled member `child` in join record `parent`, completing the join when it was
    /// the last pending member.
    fn signal_parent(&self, parent: u64, child: &HwFenceInfo) {
        let signaled = {
            let (record, _guard) = match self.table.lock_record(parent) {
                Ok(locked) => locked,
                Err(e) => {
                    error!("fence {} has bad parent {}: {}", child.hash, parent, e);
                    return;
                }
            };

            if !record.is_valid()
                || !record.flags().contains(HwFenceFlags::JOIN)
                || record.is_signaled()
            {
                warn!("fence {} parent {} is not a pending join", child.hash, parent);
                return;
            }

            record.child_signaled(parent, child.error, self.now())
        };

        if let Some(info) = signaled {
            debug!("join fence {} signaled by member {}", parent, child.hash);
            self.complete(info);
        }
    }
}
