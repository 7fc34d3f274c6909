// Copyright 2024 The hw_fence Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! hw_fence_utils: Utility enums, structs, and implementations needed by the rest of the crate.

use std::fmt;
use std::io::Error as IoError;
use std::num::TryFromIntError;
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
#[cfg(unix)]
use nix::Error as NixError;
use remain::sorted;
use thiserror::Error;

/// Maximum number of join fences a single fence may be a member of.
pub const HW_FENCE_MAX_PARENTS: usize = 3;

/// Number of client types that carry opaque data from waiter to signaler.
pub const HW_FENCE_MAX_CLIENTS_WITH_DATA: usize = 2;

/// Width of the wait mask, which bounds the number of internal client ids.
pub const HW_FENCE_MAX_CLIENTS: usize = 64;

/// Internal id 0 is reserved for the control context and never receives deliveries.
pub const HW_FENCE_CLIENT_ID_CTX0: u32 = 0;

/// Error code injected into fences whose allocator was reset before signaling them.
pub const HW_FENCE_ERROR_RESET: u32 = 1 << 0;

/// Default number of records in the global fence table.
pub const HW_FENCE_DEFAULT_TABLE_ENTRIES: u32 = 4096;

bitflags! {
    /// Flags stored in the `flags` word of a fence record and echoed in queue payloads.
    pub struct HwFenceFlags: u64 {
        const SIGNALED = 1 << 0;
        const JOIN = 1 << 1;
    }
}

bitflags! {
    /// Flags accepted by `HwFence::reset_client`.
    pub struct HwFenceResetFlags: u32 {
        /// Signal the client's pending fences with an error but keep the records allocated.
        const WITHOUT_DESTROY = 1 << 0;
    }
}

/// An error generated while using this crate.
#[sorted]
#[derive(Error, Debug)]
pub enum HwFenceError {
    /// The external client id already has an active registration.
    #[error("client is already registered")]
    AlreadyRegistered,
    /// The fence was signaled before.
    #[error("fence is already signaled")]
    AlreadySignaled,
    /// Checked Arithmetic error
    #[error("arithmetic failed: {}({}) {op} {}({})", .field1.0, .field1.1, .field2.0, .field2.1)]
    CheckedArithmetic {
        field1: (&'static str, usize),
        field2: (&'static str, usize),
        op: &'static str,
    },
    /// Checked Range error
    #[error("range check failed: {}({}) vs {}({})", .field1.0, .field1.1, .field2.0, .field2.1)]
    CheckedRange {
        field1: (&'static str, usize),
        field2: (&'static str, usize),
    },
    /// A fence with the same context and sequence number is already present in the table.
    #[error("fence with the same context and seqno already exists")]
    DuplicateKey,
    /// An argument passed by the caller is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The shared memory region is too small or misaligned for the configured layout.
    #[error("invalid carve-out region")]
    InvalidCarveOut,
    /// The client handle does not refer to an active registration.
    #[error("invalid client")]
    InvalidClient,
    /// The engine configuration is inconsistent.
    #[error("invalid hw fence configuration: {0}")]
    InvalidConfig(&'static str),
    /// An input/output error occured.
    #[error("an input/output error occur: {0}")]
    IoError(IoError),
    /// Nix crate error.
    #[cfg(unix)]
    #[error("The errno is {0}")]
    NixError(NixError),
    /// The client type has no queues configured for this client.
    #[error("no queue configuration for client")]
    NoQueueConfig,
    /// No valid fence matches the requested key.
    #[error("fence not found")]
    NotFound,
    /// Only the allocating client may destroy a fence.
    #[error("client does not own the fence")]
    NotOwner,
    /// Nothing pending in the queue.
    #[error("queue is empty")]
    QueueEmpty,
    /// Writing one more payload would overflow the queue.
    #[error("queue is full")]
    QueueFull,
    /// The client is being reset.
    #[error("client reset in progress")]
    ResetInProgress,
    /// Every slot of the fence table was probed without finding a free one.
    #[error("fence table is full")]
    TableFull,
    /// A fence cannot be a member of more than `HW_FENCE_MAX_PARENTS` join fences.
    #[error("fence already has the maximum number of parents")]
    TooManyParents,
    /// An attempted integer conversion failed.
    #[error("int conversion failed: {0}")]
    TryFromIntError(TryFromIntError),
    /// The external client id does not belong to any known client type.
    #[error("unknown client type")]
    UnknownType,
}

#[cfg(unix)]
impl From<NixError> for HwFenceError {
    fn from(e: NixError) -> HwFenceError {
        HwFenceError::NixError(e)
    }
}

impl From<IoError> for HwFenceError {
    fn from(e: IoError) -> HwFenceError {
        HwFenceError::IoError(e)
    }
}

impl From<TryFromIntError> for HwFenceError {
    fn from(e: TryFromIntError) -> HwFenceError {
        HwFenceError::TryFromIntError(e)
    }
}

/// The result of an operation in this crate.
pub type HwFenceResult<T> = std::result::Result<T, HwFenceError>;

/// Data handed to a client's error callback instead of an RX queue update.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HwFenceErrorData {
    pub ctx_id: u64,
    pub seq_id: u64,
    pub hash: u64,
    pub flags: u64,
    pub error: u32,
}

/// Plain copy of a fence record, for diagnostics and tests.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HwFenceInfo {
    pub hash: u64,
    pub ctx_id: u64,
    pub seq_id: u64,
    pub error: u32,
    pub flags: u64,
    pub wait_client_mask: u64,
    pub fence_allocator: u32,
    pub fence_signal_client: u32,
    pub parent_list: [u64; HW_FENCE_MAX_PARENTS],
    pub parents_cnt: u32,
    pub pending_child_cnt: u32,
    pub fence_create_time: u64,
    pub fence_trigger_time: u64,
    pub fence_wait_time: u64,
    pub client_data: [u64; HW_FENCE_MAX_CLIENTS_WITH_DATA],
}

impl HwFenceInfo {
    pub fn is_signaled(&self) -> bool {
        HwFenceFlags::from_bits_truncate(self.flags).contains(HwFenceFlags::SIGNALED)
    }

    /// Join records this fence is a member of.
    pub fn parents(&self) -> &[u64] {
        let cnt = (self.parents_cnt as usize).min(HW_FENCE_MAX_PARENTS);
        &self.parent_list[..cnt]
    }
}

#[derive(Clone)]
pub struct HwFenceHandler<S> {
    closure: Arc<dyn Fn(S) + Send + Sync>,
}

impl<S> HwFenceHandler<S>
where
    S: Send + Sync + Clone + 'static,
{
    pub fn new(closure: impl Fn(S) + Send + Sync + 'static) -> HwFenceHandler<S> {
        HwFenceHandler {
            closure: Arc::new(closure),
        }
    }

    pub fn call(&self, data: S) {
        (self.closure)(data)
    }
}

impl<S> fmt::Debug for HwFenceHandler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure debug").finish()
    }
}

pub type HwFenceErrorHandler = HwFenceHandler<HwFenceErrorData>;

/// Source of the diagnostic timestamps stored in fence records and payloads.  Every domain
/// sharing a carve-out should read the same clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// Nanoseconds elapsed since the clock was created.
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

/// Fire-and-forget cross-domain interrupt.  Failures are reported to the caller but never
/// retried by the core.
pub trait IpcSignal: Send + Sync {
    fn trigger_signal(&self, tx_domain_id: u32, rx_domain_id: u32, signal_id: u32)
        -> HwFenceResult<()>;
}
