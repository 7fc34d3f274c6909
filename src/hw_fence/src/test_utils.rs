// Copyright 2024 The hw_fence Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Collaborators for tests.

use std::sync::Mutex;

use crate::hw_fence_utils::*;

/// Records every interrupt instead of raising it.
#[derive(Default)]
pub struct RecordingIpc {
    calls: Mutex<Vec<(u32, u32, u32)>>,
}

impl RecordingIpc {
    /// `(tx_domain_id, rx_domain_id, signal_id)` of every interrupt so far.
    pub fn calls(&self) -> Vec<(u32, u32, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl IpcSignal for RecordingIpc {
    fn trigger_signal(&self, tx_domain_id: u32, rx_domain_id: u32, signal_id: u32) -> HwFenceResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((tx_domain_id, rx_domain_id, signal_id));
        Ok(())
    }
}

/// Clock advancing by one on every read.
#[derive(Default)]
pub struct TickClock {
    ticks: std::sync::atomic::AtomicU64,
}

impl Clock for TickClock {
    fn now(&self) -> u64 {
        self.ticks.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1
    }
}
