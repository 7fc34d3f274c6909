//! Unit tests for the public hwfence C API.
//!
//! Verifies error codes and the signal/wait path through a real memfd carve-out.

use std::thread;

use hw_fence::HW_FENCE_ERROR_RESET;

use crate::*;

const VAL0: u32 = 8;
const VAL1: u32 = 9;
const IPE: u32 = 15;

fn new_ctx() -> u32 {
    let ctx_id = hwf_create_ctx(256);
    assert!(ctx_id >= 0);
    ctx_id as u32
}

fn create_fence(ctx_id: u32, client_id: u32, fence_ctx: u64, fence_seq: u64) -> u64 {
    let mut handle = 0;
    let ret = unsafe { hwf_create_fence(ctx_id, client_id, fence_ctx, fence_seq, &mut handle) };
    assert_eq!(ret, HWF_SUCCESS);
    handle
}

fn wait(ctx_id: u32, client_id: u32, timeout_ms: u32) -> Result<(u64, u32), i32> {
    let mut handle = 0;
    let mut error = 0;
    match unsafe { hwf_wait(ctx_id, client_id, timeout_ms, &mut handle, &mut error) } {
        HWF_SUCCESS => Ok((handle, error)),
        e => Err(e),
    }
}

#[test]
fn test_log_level() {
    assert_eq!(hwf_set_log_level(0), HWF_SUCCESS);
    assert_eq!(hwf_set_log_level(2), HWF_SUCCESS);
}

#[test]
fn test_ctx_lifecycle() {
    let ctx_id = new_ctx();
    assert_eq!(hwf_free_ctx(ctx_id), HWF_SUCCESS);
    assert_eq!(hwf_free_ctx(ctx_id), -libc::ENOENT);
    assert_eq!(hwf_register_client(ctx_id, VAL0), -libc::ENOENT);
}

#[test]
fn test_register_errors() {
    let ctx_id = new_ctx();

    assert_eq!(hwf_register_client(ctx_id, VAL0), HWF_SUCCESS);
    assert_eq!(hwf_register_client(ctx_id, VAL0), -libc::EBUSY);
    assert_eq!(hwf_register_client(ctx_id, 0), -libc::ENODEV);
    assert_eq!(hwf_register_client(ctx_id, 80), -libc::ENOTSUP);

    assert_eq!(hwf_deregister_client(ctx_id, VAL0), HWF_SUCCESS);
    assert_eq!(hwf_deregister_client(ctx_id, VAL0), -libc::ENOENT);
    assert_eq!(hwf_register_client(ctx_id, VAL0), HWF_SUCCESS);

    hwf_free_ctx(ctx_id);
}

#[test]
fn test_fence_errors() {
    let ctx_id = new_ctx();
    assert_eq!(hwf_register_client(ctx_id, VAL0), HWF_SUCCESS);
    assert_eq!(hwf_register_client(ctx_id, VAL1), HWF_SUCCESS);

    let handle = create_fence(ctx_id, VAL0, 100, 1);
    let mut dup = 0;
    assert_eq!(
        unsafe { hwf_create_fence(ctx_id, VAL1, 100, 1, &mut dup) },
        -libc::EEXIST
    );
    assert_eq!(
        unsafe { hwf_create_fence(ctx_id, VAL0, 100, 2, std::ptr::null_mut()) },
        -libc::EINVAL
    );

    assert_eq!(hwf_destroy_fence(ctx_id, VAL1, handle), -libc::EPERM);
    assert_eq!(hwf_signal(ctx_id, VAL0, handle, 0), HWF_SUCCESS);
    assert_eq!(hwf_signal(ctx_id, VAL0, handle, 0), -libc::EALREADY);
    assert_eq!(hwf_destroy_fence(ctx_id, VAL0, handle), HWF_SUCCESS);
    assert_eq!(hwf_destroy_fence(ctx_id, VAL0, handle), -libc::ENOENT);
    assert_eq!(hwf_register_wait(ctx_id, VAL1, handle, 0), -libc::ENOENT);
    assert_eq!(hwf_reset_client(ctx_id, VAL0, 0x80), -libc::EINVAL);

    hwf_free_ctx(ctx_id);
}

#[test]
fn test_signal_and_wait() {
    let ctx_id = new_ctx();
    assert_eq!(hwf_register_client(ctx_id, VAL0), HWF_SUCCESS);
    assert_eq!(hwf_register_client(ctx_id, VAL1), HWF_SUCCESS);

    let handle = create_fence(ctx_id, VAL0, 100, 1);
    assert_eq!(hwf_register_wait(ctx_id, VAL1, handle, 0), HWF_SUCCESS);
    assert_eq!(wait(ctx_id, VAL1, 10), Err(-libc::ETIMEDOUT));

    let waiter = thread::spawn(move || wait(ctx_id, VAL1, 5000));
    assert_eq!(hwf_signal(ctx_id, VAL0, handle, 0), HWF_SUCCESS);
    assert_eq!(waiter.join().unwrap(), Ok((handle, 0)));

    hwf_free_ctx(ctx_id);
}

#[test]
fn test_wait_without_rx_queue() {
    let ctx_id = new_ctx();
    assert_eq!(hwf_register_client(ctx_id, IPE), HWF_SUCCESS);
    assert_eq!(wait(ctx_id, IPE, 10), Err(-libc::ENOTSUP));
    assert_eq!(wait(ctx_id, VAL0, 10), Err(-libc::ENOENT));
    hwf_free_ctx(ctx_id);
}

#[test]
fn test_fence_array() {
    let ctx_id = new_ctx();
    assert_eq!(hwf_register_client(ctx_id, VAL0), HWF_SUCCESS);
    assert_eq!(hwf_register_client(ctx_id, VAL1), HWF_SUCCESS);

    let first = create_fence(ctx_id, VAL0, 7, 1);
    let second = create_fence(ctx_id, VAL0, 7, 2);
    let members = [7u64, 1, 7, 2];

    let mut array = 0;
    let ret = unsafe { hwf_create_fence_array(ctx_id, VAL0, 8, 1, members.as_ptr(), 2, &mut array) };
    assert_eq!(ret, HWF_SUCCESS);
    let ret = unsafe { hwf_create_fence_array(ctx_id, VAL0, 8, 2, members.as_ptr(), 0, &mut array) };
    assert_eq!(ret, -libc::EINVAL);

    assert_eq!(hwf_register_wait(ctx_id, VAL1, array, 0), HWF_SUCCESS);
    assert_eq!(hwf_signal(ctx_id, VAL0, first, 0), HWF_SUCCESS);
    assert_eq!(wait(ctx_id, VAL1, 10), Err(-libc::ETIMEDOUT));
    assert_eq!(hwf_signal(ctx_id, VAL0, second, 2), HWF_SUCCESS);
    assert_eq!(wait(ctx_id, VAL1, 1000), Ok((array, 2)));

    hwf_free_ctx(ctx_id);
}

#[test]
fn test_reset_unblocks_waiter() {
    let ctx_id = new_ctx();
    assert_eq!(hwf_register_client(ctx_id, VAL0), HWF_SUCCESS);
    assert_eq!(hwf_register_client(ctx_id, VAL1), HWF_SUCCESS);

    let handle = create_fence(ctx_id, VAL0, 100, 1);
    assert_eq!(hwf_register_wait(ctx_id, VAL1, handle, 0), HWF_SUCCESS);
    assert_eq!(hwf_reset_client(ctx_id, VAL0, 0), HWF_SUCCESS);

    assert_eq!(wait(ctx_id, VAL1, 1000), Ok((handle, HW_FENCE_ERROR_RESET)));
    assert_eq!(hwf_destroy_fence(ctx_id, VAL0, handle), -libc::ENOENT);

    hwf_free_ctx(ctx_id);
}
