// Copyright 2024 The hw_fence Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cross-domain lock: mutual exclusion over one 64-bit word in the carve-out, plus an optional
//! doorbell so a releaser can wake a peer that parked while waiting.

use std::hint::spin_loop;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

// The low bits hold the owner tag, the high bits count waiters parked on the doorbell.  The
// count survives handoffs, so every release observes waiters that are still parked.
const HW_FENCE_LOCK_OWNER_BITS: u32 = 48;
const HW_FENCE_LOCK_OWNER_MASK: u64 = (1 << HW_FENCE_LOCK_OWNER_BITS) - 1;
const HW_FENCE_LOCK_PARKED_ONE: u64 = 1 << HW_FENCE_LOCK_OWNER_BITS;
const HW_FENCE_LOCK_PARKED_MASK: u64 = !HW_FENCE_LOCK_OWNER_MASK;
const HW_FENCE_LOCK_SPINS_BEFORE_PARK: u32 = 1024;

/// Wake side channel of the lock.  `ring` is invoked by a releaser that observes parked
/// waiters and must wake at least one of them; a ring that arrives before the matching `wait`
/// must not be lost.  `wait` is invoked by a parked waiter and may return spuriously.
pub trait Doorbell: Send + Sync {
    fn ring(&self);

    fn wait(&self) {
        std::thread::yield_now();
    }
}

/// Doorbell for domains that never park: waiting is plain spinning.
#[derive(Default)]
pub struct SpinDoorbell;

impl Doorbell for SpinDoorbell {
    fn ring(&self) {}

    fn wait(&self) {
        spin_loop();
    }
}

/// Holds a cross-domain lock until dropped.
pub struct LockGuard<'a> {
    word: &'a AtomicU64,
    doorbell: &'a dyn Doorbell,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let old = self.word.fetch_and(HW_FENCE_LOCK_PARKED_MASK, Ordering::Release);
        if old & HW_FENCE_LOCK_PARKED_MASK != 0 {
            self.doorbell.ring();
        }
    }
}

fn owner_tag(owner: u32) -> u64 {
    // Zero means unlocked, so tags start at one.
    owner as u64 + 1
}

/// Busy-waits until `word` is acquired for `owner`.  The caller's domain is expected to keep
/// preemption off for the duration of the hold.
pub fn lock<'a>(word: &'a AtomicU64, owner: u32, doorbell: &'a dyn Doorbell) -> LockGuard<'a> {
    let tag = owner_tag(owner);
    let mut spins = 0;

    loop {
        let cur = word.load(Ordering::Relaxed);
        if cur & HW_FENCE_LOCK_OWNER_MASK == 0 {
            let next = (cur & HW_FENCE_LOCK_PARKED_MASK) | tag;
            if word
                .compare_exchange_weak(cur, next, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return LockGuard { word, doorbell };
            }
            continue;
        }

        spins += 1;
        let saturated = cur & HW_FENCE_LOCK_PARKED_MASK == HW_FENCE_LOCK_PARKED_MASK;
        if spins < HW_FENCE_LOCK_SPINS_BEFORE_PARK || saturated {
            spin_loop();
            continue;
        }

        // Only park once the holder is certain to see the count on release.
        if word
            .compare_exchange(
                cur,
                cur + HW_FENCE_LOCK_PARKED_ONE,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_err()
        {
            continue;
        }
        doorbell.wait();
        word.fetch_sub(HW_FENCE_LOCK_PARKED_ONE, Ordering::Relaxed);
        spins = 0;
    }
}

/// Single attempt at acquiring `word`.
pub fn try_lock<'a>(
    word: &'a AtomicU64,
    owner: u32,
    doorbell: &'a dyn Doorbell,
) -> Option<LockGuard<'a>> {
    let cur = word.load(Ordering::Relaxed);
    if cur & HW_FENCE_LOCK_OWNER_MASK != 0 {
        return None;
    }

    let next = (cur & HW_FENCE_LOCK_PARKED_MASK) | owner_tag(owner);
    word.compare_exchange(cur, next, Ordering::Acquire, Ordering::Relaxed)
        .ok()
        .map(|_| LockGuard { word, doorbell })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::sync::Condvar;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;
    use std::time::Instant;

    fn parked_waiters(word: &AtomicU64) -> u64 {
        word.load(Ordering::SeqCst) >> HW_FENCE_LOCK_OWNER_BITS
    }

    struct Shared {
        word: AtomicU64,
        counter: UnsafeCell<u64>,
    }

    unsafe impl Sync for Shared {}

    /// Blocks in `wait` until rung; every ring releases exactly one wait.
    #[derive(Default)]
    struct SemaphoreDoorbell {
        permits: Mutex<u32>,
        rung: Condvar,
    }

    impl Doorbell for SemaphoreDoorbell {
        fn ring(&self) {
            *self.permits.lock().unwrap() += 1;
            self.rung.notify_one();
        }

        fn wait(&self) {
            let mut permits = self.permits.lock().unwrap();
            while *permits == 0 {
                permits = self.rung.wait(permits).unwrap();
            }
            *permits -= 1;
        }
    }

    #[derive(Default)]
    struct CountingDoorbell {
        rings: AtomicUsize,
    }

    impl Doorbell for CountingDoorbell {
        fn ring(&self) {
            self.rings.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn excludes_across_threads() {
        let shared = Arc::new(Shared {
            word: AtomicU64::new(0),
            counter: UnsafeCell::new(0),
        });

        let workers: Vec<_> = (0..4u32)
            .map(|owner| {
                let shared = shared.clone();
                thread::spawn(move || {
                    let doorbell = SpinDoorbell;
                    for _ in 0..10_000 {
                        let _guard = lock(&shared.word, owner, &doorbell);
                        unsafe { *shared.counter.get() += 1 };
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(unsafe { *shared.counter.get() }, 40_000);
        assert_eq!(shared.word.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let word = AtomicU64::new(0);
        let doorbell = SpinDoorbell;

        let guard = try_lock(&word, 3, &doorbell).unwrap();
        assert_eq!(word.load(Ordering::SeqCst), 4);
        assert!(try_lock(&word, 5, &doorbell).is_none());
        drop(guard);
        assert!(try_lock(&word, 5, &doorbell).is_some());
    }

    #[test]
    fn release_rings_parked_waiter() {
        let word = Arc::new(AtomicU64::new(0));
        let doorbell = Arc::new(CountingDoorbell::default());

        let guard = lock(&word, 0, doorbell.as_ref());

        let waiter = {
            let word = word.clone();
            let doorbell = doorbell.clone();
            thread::spawn(move || {
                let _guard = lock(&word, 1, doorbell.as_ref());
            })
        };

        while parked_waiters(&word) == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        drop(guard);
        waiter.join().unwrap();

        assert!(doorbell.rings.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn every_parked_waiter_is_woken() {
        let word = Arc::new(AtomicU64::new(0));
        let doorbell = Arc::new(SemaphoreDoorbell::default());
        let acquired = Arc::new(AtomicUsize::new(0));

        let guard = lock(&word, 0, doorbell.as_ref());

        let waiters: Vec<_> = (1..=2u32)
            .map(|owner| {
                let word = word.clone();
                let doorbell = doorbell.clone();
                let acquired = acquired.clone();
                thread::spawn(move || {
                    let _guard = lock(&word, owner, doorbell.as_ref());
                    acquired.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        while parked_waiters(&word) < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        drop(guard);

        let deadline = Instant::now() + Duration::from_secs(5);
        while acquired.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(acquired.load(Ordering::SeqCst), 2);

        for waiter in waiters {
            waiter.join().unwrap();
        }
        assert_eq!(word.load(Ordering::SeqCst), 0);
    }
}
