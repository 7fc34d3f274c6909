// Copyright 2024 The hw_fence Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! C API of the hw_fence engine.  Every entry point returns zero or a positive value on success
//! and a negative errno on failure.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::slice;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use hw_fence::{
    HwFence, HwFenceBuilder, HwFenceClient, HwFenceError, HwFenceResetFlags, HwFenceResult,
    IpcSignal,
};
use log::{debug, trace, warn, LevelFilter};
use once_cell::sync::Lazy;

#[cfg(test)]
mod api_tests;

// Value returned on success. We use libc's errors otherwise.
const HWF_SUCCESS: i32 = 0;
// Domain id this process raises interrupts from.
const HWF_DOMAIN_ID: u32 = 8;

static CTX_MAP: Lazy<Mutex<HashMap<u32, Arc<HwfContext>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));
static CTX_IDS: AtomicI32 = AtomicI32::new(0);

/// Interrupt lines of this process, one channel per `(rx_domain_id, signal_id)`.  A pending
/// interrupt is latched until a waiter consumes it, and repeated interrupts coalesce.
#[derive(Default)]
struct ChannelIpc {
    lines: Mutex<HashMap<(u32, u32), (Sender<()>, Receiver<()>)>>,
}

impl ChannelIpc {
    fn line(&self, binding: (u32, u32)) -> Receiver<()> {
        let mut lines = self.lines.lock().unwrap();
        let (_, receiver) = lines.entry(binding).or_insert_with(|| bounded(1));
        receiver.clone()
    }
}

impl IpcSignal for ChannelIpc {
    fn trigger_signal(
        &self,
        tx_domain_id: u32,
        rx_domain_id: u32,
        signal_id: u32,
    ) -> HwFenceResult<()> {
        trace!(
            "interrupt from domain {} to domain {} signal {}",
            tx_domain_id,
            rx_domain_id,
            signal_id
        );
        if let Some((sender, _)) = self.lines.lock().unwrap().get(&(rx_domain_id, signal_id)) {
            // A full channel already has an interrupt latched.
            let _ = sender.try_send(());
        }
        Ok(())
    }
}

struct HwfContext {
    hw_fence: HwFence,
    ipc: Arc<ChannelIpc>,
    clients: Mutex<HashMap<u32, HwFenceClient>>,
}

impl HwfContext {
    fn client(&self, client_id: u32) -> Result<HwFenceClient, i32> {
        self.clients
            .lock()
            .unwrap()
            .get(&client_id)
            .copied()
            .ok_or(-libc::ENOENT)
    }
}

fn errno(e: &HwFenceError) -> i32 {
    let errno = match e {
        HwFenceError::AlreadyRegistered => libc::EBUSY,
        HwFenceError::AlreadySignaled => libc::EALREADY,
        HwFenceError::DuplicateKey => libc::EEXIST,
        HwFenceError::IoError(e) => e.raw_os_error().unwrap_or(libc::EIO),
        #[cfg(unix)]
        HwFenceError::NixError(e) => *e as i32,
        HwFenceError::NoQueueConfig => libc::ENOTSUP,
        HwFenceError::NotFound => libc::ENOENT,
        HwFenceError::NotOwner => libc::EPERM,
        HwFenceError::QueueEmpty => libc::EAGAIN,
        HwFenceError::QueueFull => libc::ENOSPC,
        HwFenceError::ResetInProgress => libc::EBUSY,
        HwFenceError::TableFull => libc::ENOMEM,
        HwFenceError::TooManyParents => libc::E2BIG,
        HwFenceError::UnknownType => libc::ENODEV,
        _ => libc::EINVAL,
    };
    -errno
}

fn to_result(res: HwFenceResult<()>) -> i32 {
    match res {
        Ok(()) => HWF_SUCCESS,
        Err(e) => {
            debug!("hw fence call failed: {}", e);
            errno(&e)
        }
    }
}

fn get_ctx(ctx_id: u32) -> Result<Arc<HwfContext>, i32> {
    CTX_MAP
        .lock()
        .unwrap()
        .get(&ctx_id)
        .cloned()
        .ok_or(-libc::ENOENT)
}

fn with_client<F>(ctx_id: u32, client_id: u32, f: F) -> i32
where
    F: FnOnce(&HwFence, &HwFenceClient) -> HwFenceResult<()>,
{
    let ctx = match get_ctx(ctx_id) {
        Ok(ctx) => ctx,
        Err(e) => return e,
    };
    let client = match ctx.client(client_id) {
        Ok(client) => client,
        Err(e) => return e,
    };
    to_result(f(&ctx.hw_fence, &client))
}

#[no_mangle]
pub extern "C" fn hwf_set_log_level(level: u32) -> i32 {
    let log_level = match level {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    // Only the first call installs the logger; later calls adjust its level.
    let _ = env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .try_init();
    log::set_max_level(log_level);

    HWF_SUCCESS
}

/// Creates an engine over a fresh carve-out with `table_entries` fence records, or the default
/// table size when zero.  Returns the context id.
#[no_mangle]
pub extern "C" fn hwf_create_ctx(table_entries: u32) -> i32 {
    let mut builder = HwFenceBuilder::new().set_domain_id(HWF_DOMAIN_ID);
    if table_entries != 0 {
        builder = builder.set_table_entries(table_entries);
    }

    let ipc = Arc::new(ChannelIpc::default());
    #[cfg(unix)]
    let hw_fence = builder.build_with_memfd(ipc.clone());
    #[cfg(not(unix))]
    let hw_fence = builder.carve_out_size().and_then(|size| {
        let region = hw_fence::HeapRegion::new(size)?;
        builder.build(ipc.clone(), Box::new(region))
    });

    let hw_fence = match hw_fence {
        Ok(hw_fence) => hw_fence,
        Err(e) => {
            warn!("Error creating hw fence context: {}", e);
            return errno(&e);
        }
    };

    let ctx_id = CTX_IDS.fetch_add(1, Ordering::SeqCst);
    if ctx_id == i32::MAX || CTX_MAP.lock().unwrap().contains_key(&(ctx_id as u32)) {
        // hwfence is not meant to hand out contexts for the lifetime of a daemon.
        panic!("Context ID namespace exhausted");
    }

    let ctx = HwfContext {
        hw_fence,
        ipc,
        clients: Mutex::new(HashMap::new()),
    };
    CTX_MAP
        .lock()
        .unwrap()
        .insert(ctx_id as u32, Arc::new(ctx));

    ctx_id
}

#[no_mangle]
pub extern "C" fn hwf_free_ctx(ctx_id: u32) -> i32 {
    match CTX_MAP.lock().unwrap().remove(&ctx_id) {
        Some(_) => HWF_SUCCESS,
        None => -libc::ENOENT,
    }
}

#[no_mangle]
pub extern "C" fn hwf_register_client(ctx_id: u32, client_id: u32) -> i32 {
    let ctx = match get_ctx(ctx_id) {
        Ok(ctx) => ctx,
        Err(e) => return e,
    };

    let mut clients = ctx.clients.lock().unwrap();
    match clients.entry(client_id) {
        Entry::Occupied(_) => -libc::EBUSY,
        Entry::Vacant(entry) => match ctx.hw_fence.register_client(client_id) {
            Ok(client) => {
                entry.insert(client);
                HWF_SUCCESS
            }
            Err(e) => errno(&e),
        },
    }
}

#[no_mangle]
pub extern "C" fn hwf_deregister_client(ctx_id: u32, client_id: u32) -> i32 {
    let ctx = match get_ctx(ctx_id) {
        Ok(ctx) => ctx,
        Err(e) => return e,
    };

    let mut clients = ctx.clients.lock().unwrap();
    let client = match clients.get(&client_id) {
        Some(client) => *client,
        None => return -libc::ENOENT,
    };
    match ctx.hw_fence.deregister_client(&client) {
        Ok(()) => {
            clients.remove(&client_id);
            HWF_SUCCESS
        }
        Err(e) => errno(&e),
    }
}

/// # Safety
///
/// `handle` must be null or point to writable memory for a `u64`.
#[no_mangle]
pub unsafe extern "C" fn hwf_create_fence(
    ctx_id: u32,
    client_id: u32,
    fence_ctx: u64,
    fence_seq: u64,
    handle: *mut u64,
) -> i32 {
    if handle.is_null() {
        return -libc::EINVAL;
    }

    with_client(ctx_id, client_id, |hw_fence, client| {
        let hash = hw_fence.create_fence(client, fence_ctx, fence_seq)?;
        *handle = hash;
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn hwf_destroy_fence(ctx_id: u32, client_id: u32, handle: u64) -> i32 {
    with_client(ctx_id, client_id, |hw_fence, client| {
        hw_fence.destroy_fence_by_hash(client, handle)
    })
}

/// Creates a fence signaling once the `num_members` fences in `members` have signaled.
/// `members` holds one `(context, seqno)` pair per member, flattened.
///
/// # Safety
///
/// `members` must point to `2 * num_members` readable `u64`s, and `handle` must be null or point
/// to writable memory for a `u64`.
#[no_mangle]
pub unsafe extern "C" fn hwf_create_fence_array(
    ctx_id: u32,
    client_id: u32,
    fence_ctx: u64,
    fence_seq: u64,
    members: *const u64,
    num_members: u32,
    handle: *mut u64,
) -> i32 {
    if handle.is_null() || members.is_null() || num_members == 0 {
        return -libc::EINVAL;
    }

    let flat = slice::from_raw_parts(members, num_members as usize * 2);
    let members: Vec<(u64, u64)> = flat.chunks_exact(2).map(|m| (m[0], m[1])).collect();

    with_client(ctx_id, client_id, |hw_fence, client| {
        let hash = hw_fence.create_join(client, fence_ctx, fence_seq, &members)?;
        *handle = hash;
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn hwf_register_wait(
    ctx_id: u32,
    client_id: u32,
    handle: u64,
    client_data: u64,
) -> i32 {
    with_client(ctx_id, client_id, |hw_fence, client| {
        hw_fence.wait_register(client, handle, client_data)
    })
}

#[no_mangle]
pub extern "C" fn hwf_signal(ctx_id: u32, client_id: u32, handle: u64, error: u32) -> i32 {
    with_client(ctx_id, client_id, |hw_fence, client| {
        hw_fence.update_txq(client, handle, error)
    })
}

/// Waits up to `timeout_ms` for the next fence delivered to the client and stores its handle
/// and error.  Returns `-ETIMEDOUT` if nothing arrives in time.
///
/// # Safety
///
/// `handle` and `error` must be null or point to writable memory of their type.
#[no_mangle]
pub unsafe extern "C" fn hwf_wait(
    ctx_id: u32,
    client_id: u32,
    timeout_ms: u32,
    handle: *mut u64,
    error: *mut u32,
) -> i32 {
    if handle.is_null() || error.is_null() {
        return -libc::EINVAL;
    }

    let ctx = match get_ctx(ctx_id) {
        Ok(ctx) => ctx,
        Err(e) => return e,
    };
    let client = match ctx.client(client_id) {
        Ok(client) => client,
        Err(e) => return e,
    };
    let line = match ctx.hw_fence.client_signal(&client) {
        Ok(binding) => ctx.ipc.line(binding),
        Err(e) => return errno(&e),
    };

    let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
    loop {
        match ctx.hw_fence.read_rxq(&client) {
            Ok((payload, _)) => {
                *handle = payload.hash;
                *error = payload.error;
                return HWF_SUCCESS;
            }
            Err(HwFenceError::QueueEmpty) => (),
            Err(e) => return errno(&e),
        }

        let now = Instant::now();
        if now >= deadline {
            return -libc::ETIMEDOUT;
        }
        match line.recv_timeout(deadline - now) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return -libc::EPIPE,
        }
    }
}

#[no_mangle]
pub extern "C" fn hwf_reset_client(ctx_id: u32, client_id: u32, flags: u32) -> i32 {
    let flags = match HwFenceResetFlags::from_bits(flags) {
        Some(flags) => flags,
        None => return -libc::EINVAL,
    };

    with_client(ctx_id, client_id, |hw_fence, client| {
        hw_fence.reset_client(client, flags)
    })
}
