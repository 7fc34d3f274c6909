// Copyright 2024 The hw_fence Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A crate for creating, signaling and waiting on hardware fences shared between execution
//! domains through a block of shared memory and cross-domain interrupts.

#[macro_use]
mod macros;

mod carve_out;
mod client;
mod dispatch;
mod fence_table;
mod hw_fence_core;
mod hw_fence_os;
mod hw_fence_protocol;
mod hw_fence_utils;
mod join_fence;
mod lock;
mod queue;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use crate::carve_out::CarveOutLayout;
pub use crate::carve_out::QueueRegionLayout;
pub use crate::client::ClientType;
pub use crate::client::ClientTypeDesc;
pub use crate::client::HwFenceClient;
pub use crate::client::HW_FENCE_CLIENT_TYPES;
pub use crate::hw_fence_core::HwFence;
pub use crate::hw_fence_core::HwFenceBuilder;
pub use crate::hw_fence_os::HeapRegion;
pub use crate::hw_fence_os::MappedRegion as HwFenceMappedRegion;
#[cfg(unix)]
pub use crate::hw_fence_os::MemoryMapping;
#[cfg(unix)]
pub use crate::hw_fence_os::SharedMemory;
pub use crate::hw_fence_protocol::*;
pub use crate::hw_fence_utils::*;
pub use crate::lock::Doorbell;
pub use crate::lock::SpinDoorbell;
