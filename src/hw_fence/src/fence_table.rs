// Copyright 2024 The hw_fence Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The global fence table: an open-addressing hash map over `(context, seqno)` living in the
//! carve-out.  Records are addressed by their index ("hash"), never by pointer.

use std::mem::size_of;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;

use crate::carve_out::CarveOut;
use crate::hw_fence_utils::*;
use crate::lock::lock;
use crate::lock::try_lock;
use crate::lock::Doorbell;
use crate::lock::LockGuard;

/// Multipliers of the table hash.
const HW_FENCE_HASH_A_MULT: u64 = 4969;
const HW_FENCE_HASH_C_MULT: u64 = 907;

/// One fence as seen by every domain.  Field order and widths are part of the shared layout.
/// Apart from `valid` and `lock`, fields are only touched while holding `lock`.
#[repr(C)]
pub struct HwFenceRecord {
    pub valid: AtomicU32,
    pub error: AtomicU32,
    pub ctx_id: AtomicU64,
    pub seq_id: AtomicU64,
    pub wait_client_mask: AtomicU64,
    pub fence_allocator: AtomicU32,
    pub fence_signal_client: AtomicU32,
    pub lock: AtomicU64,
    pub flags: AtomicU64,
    pub parent_list: [AtomicU64; HW_FENCE_MAX_PARENTS],
    pub parents_cnt: AtomicU32,
    pub pending_child_cnt: AtomicU32,
    pub fence_create_time: AtomicU64,
    pub fence_trigger_time: AtomicU64,
    pub fence_wait_time: AtomicU64,
    pub client_data: [AtomicU64; HW_FENCE_MAX_CLIENTS_WITH_DATA],
}

const _: () = assert!(size_of::<HwFenceRecord>() == 128);

impl HwFenceRecord {
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire) != 0
    }

    pub fn matches(&self, ctx_id: u64, seq_id: u64) -> bool {
        self.is_valid()
            && self.ctx_id.load(Ordering::Relaxed) == ctx_id
            && self.seq_id.load(Ordering::Relaxed) == seq_id
    }

    pub fn flags(&self) -> HwFenceFlags {
        HwFenceFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub fn is_signaled(&self) -> bool {
        self.flags().contains(HwFenceFlags::SIGNALED)
    }

    pub(crate) fn set_flags(&self, flags: HwFenceFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    fn init(&self, client_id: u32, ctx_id: u64, seq_id: u64, now: u64) {
        self.error.store(0, Ordering::Relaxed);
        self.ctx_id.store(ctx_id, Ordering::Relaxed);
        self.seq_id.store(seq_id, Ordering::Relaxed);
        self.wait_client_mask.store(0, Ordering::Relaxed);
        self.fence_allocator.store(client_id, Ordering::Relaxed);
        self.fence_signal_client.store(0, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        self.parents_cnt.store(0, Ordering::Relaxed);
        self.pending_child_cnt.store(0, Ordering::Relaxed);
        self.fence_create_time.store(now, Ordering::Relaxed);
        self.fence_trigger_time.store(0, Ordering::Relaxed);
        self.fence_wait_time.store(0, Ordering::Relaxed);
        self.valid.store(1, Ordering::Release);
    }

    /// Zeroes every field but the lock word.  The slot only reads as free once it is clean.
    fn clear(&self) {
        self.error.store(0, Ordering::Relaxed);
        self.ctx_id.store(0, Ordering::Relaxed);
        self.seq_id.store(0, Ordering::Relaxed);
        self.wait_client_mask.store(0, Ordering::Relaxed);
        self.fence_allocator.store(0, Ordering::Relaxed);
        self.fence_signal_client.store(0, Ordering::Relaxed);
        self.flags.store(0, Ordering::Relaxed);
        for parent in &self.parent_list {
            parent.store(0, Ordering::Relaxed);
        }
        self.parents_cnt.store(0, Ordering::Relaxed);
        self.pending_child_cnt.store(0, Ordering::Relaxed);
        self.fence_create_time.store(0, Ordering::Relaxed);
        self.fence_trigger_time.store(0, Ordering::Relaxed);
        self.fence_wait_time.store(0, Ordering::Relaxed);
        for data in &self.client_data {
            data.store(0, Ordering::Relaxed);
        }
        self.valid.store(0, Ordering::Release);
    }

    /// Marks the record signaled by `client_id`, merging `error` into the recorded error.
    pub(crate) fn mark_signaled(&self, client_id: u32, error: u32, now: u64) {
        self.error.fetch_or(error, Ordering::Relaxed);
        self.fence_signal_client.store(client_id, Ordering::Relaxed);
        self.fence_trigger_time.store(now, Ordering::Relaxed);
        self.set_flags(HwFenceFlags::SIGNALED);
    }

    /// Accounts one signaled member of a join record.  Returns a snapshot when this was the
    /// last pending member and the join is now signaled.
    pub(crate) fn child_signaled(&self, hash: u64, error: u32, now: u64) -> Option<HwFenceInfo> {
        self.error.fetch_or(error, Ordering::Relaxed);
        let pending = self.pending_child_cnt.load(Ordering::Relaxed);
        if pending == 0 {
            return None;
        }

        self.pending_child_cnt.store(pending - 1, Ordering::Relaxed);
        if pending > 1 {
            return None;
        }

        self.mark_signaled(HW_FENCE_CLIENT_ID_CTX0, 0, now);
        Some(self.info(hash))
    }

    /// Links `parent` to this record.  Fails once the fan-in cap is reached.
    pub(crate) fn add_parent(&self, parent: u64) -> HwFenceResult<()> {
        let cnt = self.parents_cnt.load(Ordering::Relaxed) as usize;
        if cnt >= HW_FENCE_MAX_PARENTS {
            return Err(HwFenceError::TooManyParents);
        }

        self.parent_list[cnt].store(parent, Ordering::Relaxed);
        self.parents_cnt.store(cnt as u32 + 1, Ordering::Relaxed);
        Ok(())
    }

    /// Unlinks `parent`, keeping the remaining parents packed in order.  Returns whether it was
    /// linked.
    pub(crate) fn remove_parent(&self, parent: u64) -> bool {
        let cnt = (self.parents_cnt.load(Ordering::Relaxed) as usize).min(HW_FENCE_MAX_PARENTS);
        let pos = match (0..cnt).find(|&i| self.parent_list[i].load(Ordering::Relaxed) == parent) {
            Some(pos) => pos,
            None => return false,
        };

        for i in pos..cnt - 1 {
            let next = self.parent_list[i + 1].load(Ordering::Relaxed);
            self.parent_list[i].store(next, Ordering::Relaxed);
        }
        self.parent_list[cnt - 1].store(0, Ordering::Relaxed);
        self.parents_cnt.store(cnt as u32 - 1, Ordering::Relaxed);
        true
    }

    pub(crate) fn info(&self, hash: u64) -> HwFenceInfo {
        let mut parent_list = [0; HW_FENCE_MAX_PARENTS];
        for (dst, src) in parent_list.iter_mut().zip(&self.parent_list) {
            *dst = src.load(Ordering::Relaxed);
        }
        let mut client_data = [0; HW_FENCE_MAX_CLIENTS_WITH_DATA];
        for (dst, src) in client_data.iter_mut().zip(&self.client_data) {
            *dst = src.load(Ordering::Relaxed);
        }

        HwFenceInfo {
            hash,
            ctx_id: self.ctx_id.load(Ordering::Relaxed),
            seq_id: self.seq_id.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
            flags: self.flags.load(Ordering::Relaxed),
            wait_client_mask: self.wait_client_mask.load(Ordering::Relaxed),
            fence_allocator: self.fence_allocator.load(Ordering::Relaxed),
            fence_signal_client: self.fence_signal_client.load(Ordering::Relaxed),
            parent_list,
            parents_cnt: self.parents_cnt.load(Ordering::Relaxed),
            pending_child_cnt: self.pending_child_cnt.load(Ordering::Relaxed),
            fence_create_time: self.fence_create_time.load(Ordering::Relaxed),
            fence_trigger_time: self.fence_trigger_time.load(Ordering::Relaxed),
            fence_wait_time: self.fence_wait_time.load(Ordering::Relaxed),
            client_data,
        }
    }
}

enum Probe<T> {
    Done(T),
    Next,
    Fail(HwFenceError),
}

/// Access to the fence table from one domain.
pub struct FenceTable {
    carve_out: Arc<CarveOut>,
    entries: u32,
    domain_id: u32,
    doorbell: Arc<dyn Doorbell>,
}

impl FenceTable {
    pub fn new(carve_out: Arc<CarveOut>, domain_id: u32, doorbell: Arc<dyn Doorbell>) -> FenceTable {
        let entries = carve_out.layout().table_entries;
        FenceTable {
            carve_out,
            entries,
            domain_id,
            doorbell,
        }
    }

    pub fn entries(&self) -> u32 {
        self.entries
    }

    /// Slot at which the probe for `(ctx_id, seq_id)` starts.  The context-derived multiplier
    /// is odd, so the table size need not be a power of two.
    pub fn hash(&self, ctx_id: u64, seq_id: u64) -> u64 {
        let b_mult = ctx_id.wrapping_mul(2).wrapping_sub(1);
        let val = HW_FENCE_HASH_A_MULT
            .wrapping_mul(seq_id)
            .wrapping_mul(b_mult)
            .wrapping_add(HW_FENCE_HASH_C_MULT.wrapping_mul(ctx_id));
        val % self.entries as u64
    }

    pub(crate) fn record(&self, hash: u64) -> HwFenceResult<&HwFenceRecord> {
        if hash >= self.entries as u64 {
            return Err(HwFenceError::NotFound);
        }
        Ok(self.carve_out.record(hash))
    }

    /// Acquires the lock of slot `hash`.
    pub(crate) fn lock_record(&self, hash: u64) -> HwFenceResult<(&HwFenceRecord, LockGuard<'_>)> {
        let record = self.record(hash)?;
        let guard = lock(&record.lock, self.domain_id, self.doorbell.as_ref());
        Ok((record, guard))
    }

    /// Visits slots in probe order, holding one slot lock at a time.
    fn probe<T, F>(&self, ctx_id: u64, seq_id: u64, exhausted: HwFenceError, mut step: F) -> HwFenceResult<T>
    where
        F: FnMut(u64, &HwFenceRecord) -> Probe<T>,
    {
        let hash0 = self.hash(ctx_id, seq_id);
        for i in 0..self.entries as u64 {
            let hash = (hash0 + i) % self.entries as u64;
            let (record, guard) = self.lock_record(hash)?;
            let res = step(hash, record);
            drop(guard);

            match res {
                Probe::Done(v) => return Ok(v),
                Probe::Fail(e) => return Err(e),
                Probe::Next => continue,
            }
        }

        Err(exhausted)
    }

    /// Lock-free scan for a valid record with this key.  A destroyed record leaves a hole in
    /// the probe chain, so the scan covers the whole table.
    fn contains(&self, ctx_id: u64, seq_id: u64) -> bool {
        (0..self.entries as u64).any(|hash| self.carve_out.record(hash).matches(ctx_id, seq_id))
    }

    /// Reserves a slot for `(ctx_id, seq_id)` on behalf of `client_id`.
    pub fn create(&self, client_id: u32, ctx_id: u64, seq_id: u64, now: u64) -> HwFenceResult<u64> {
        if self.contains(ctx_id, seq_id) {
            return Err(HwFenceError::DuplicateKey);
        }

        let hash = self.probe(ctx_id, seq_id, HwFenceError::TableFull, |hash, record| {
            if record.matches(ctx_id, seq_id) {
                Probe::Fail(HwFenceError::DuplicateKey)
            } else if !record.is_valid() {
                record.init(client_id, ctx_id, seq_id, now);
                Probe::Done(hash)
            } else {
                Probe::Next
            }
        })?;

        debug!(
            "client {} created fence ctx {} seq {} at hash {}",
            client_id, ctx_id, seq_id, hash
        );
        Ok(hash)
    }

    pub fn find(&self, ctx_id: u64, seq_id: u64) -> HwFenceResult<u64> {
        self.probe(ctx_id, seq_id, HwFenceError::NotFound, |hash, record| {
            if record.matches(ctx_id, seq_id) {
                Probe::Done(hash)
            } else {
                Probe::Next
            }
        })
    }

    /// Frees the record keyed by `(ctx_id, seq_id)`.  Returns the freed slot.
    pub fn destroy(&self, client_id: u32, ctx_id: u64, seq_id: u64) -> HwFenceResult<u64> {
        let hash = self.probe(ctx_id, seq_id, HwFenceError::NotFound, |hash, record| {
            if !record.matches(ctx_id, seq_id) {
                Probe::Next
            } else if record.fence_allocator.load(Ordering::Relaxed) != client_id {
                Probe::Fail(HwFenceError::NotOwner)
            } else {
                Probe::Done(hash)
            }
        })?;

        self.destroy_at(client_id, hash, Some((ctx_id, seq_id)))?;
        Ok(hash)
    }

    pub fn destroy_by_hash(&self, client_id: u32, hash: u64) -> HwFenceResult<()> {
        self.destroy_at(client_id, hash, None)
    }

    /// Frees slot `hash`.  A join is first unlinked from every member, so a later record in
    /// the same slot is never signaled through a link that was made for the old one.
    fn destroy_at(&self, client_id: u32, hash: u64, key: Option<(u64, u64)>) -> HwFenceResult<()> {
        let check = |record: &HwFenceRecord| -> HwFenceResult<()> {
            let live = match key {
                Some((ctx_id, seq_id)) => record.matches(ctx_id, seq_id),
                None => record.is_valid(),
            };
            if !live {
                return Err(HwFenceError::NotFound);
            }
            if record.fence_allocator.load(Ordering::Relaxed) != client_id {
                return Err(HwFenceError::NotOwner);
            }
            Ok(())
        };

        let is_join = {
            let (record, _guard) = self.lock_record(hash)?;
            check(record)?;
            record.flags().contains(HwFenceFlags::JOIN)
        };
        if is_join {
            self.unlink_parent(hash);
        }

        let (record, _guard) = self.lock_record(hash)?;
        check(record)?;
        record.clear();
        Ok(())
    }

    /// Drops `parent` from the parent list of every record, one slot lock at a time.
    fn unlink_parent(&self, parent: u64) {
        for hash in (0..self.entries as u64).filter(|&hash| hash != parent) {
            let record = self.carve_out.record(hash);
            if record.parents_cnt.load(Ordering::Relaxed) == 0 {
                continue;
            }

            let _guard = lock(&record.lock, self.domain_id, self.doorbell.as_ref());
            if record.is_valid() && record.remove_parent(parent) {
                debug!("unlinked join {} from member {}", parent, hash);
            }
        }
    }

    /// Snapshot of a valid record.
    pub fn info(&self, hash: u64) -> HwFenceResult<HwFenceInfo> {
        let (record, _guard) = self.lock_record(hash)?;
        if !record.is_valid() {
            return Err(HwFenceError::NotFound);
        }
        Ok(record.info(hash))
    }

    /// Logs every valid record.  Slots locked by another domain are reported as busy rather
    /// than waited on.
    pub fn dump(&self) {
        for hash in 0..self.entries as u64 {
            let record = self.carve_out.record(hash);
            let _guard = match try_lock(&record.lock, self.domain_id, self.doorbell.as_ref()) {
                Some(guard) => guard,
                None => {
                    debug!("hash {} busy", hash);
                    continue;
                }
            };
            if !record.is_valid() {
                continue;
            }

            let info = record.info(hash);
            debug!(
                "hash {} ctx {} seq {} flags {:#x} error {} allocator {} waiters {:#x} parents {} pending {}",
                hash,
                info.ctx_id,
                info.seq_id,
                info.flags,
                info.error,
                info.fence_allocator,
                info.wait_client_mask,
                info.parents_cnt,
                info.pending_child_cnt
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carve_out::CarveOutLayout;
    use crate::hw_fence_os::HeapRegion;
    use crate::lock::SpinDoorbell;

    fn new_table(entries: u32) -> FenceTable {
        let layout = CarveOutLayout::new(entries, &[]).unwrap();
        let region = HeapRegion::new(layout.total_size).unwrap();
        let carve_out = Arc::new(CarveOut::new(Box::new(region), layout).unwrap());
        FenceTable::new(carve_out, 0, Arc::new(SpinDoorbell))
    }

    /// Finds a seqno that starts probing at the same slot as `(ctx_id, seq_id)`.
    fn colliding_seq(table: &FenceTable, ctx_id: u64, seq_id: u64) -> u64 {
        let target = table.hash(ctx_id, seq_id);
        (seq_id + 1..)
            .find(|&seq| table.hash(ctx_id, seq) == target)
            .unwrap()
    }

    #[test]
    fn hash_matches_formula() {
        let table = new_table(4096);
        let (ctx, seq) = (100u64, 1u64);
        let expected = (4969 * seq * (2 * ctx - 1) + 907 * ctx) % 4096;
        assert_eq!(table.hash(ctx, seq), expected);
    }

    #[test]
    fn create_find_destroy_round_trip() {
        let table = new_table(64);

        let hash = table.create(1, 100, 1, 5).unwrap();
        assert_eq!(table.find(100, 1).unwrap(), hash);

        let info = table.info(hash).unwrap();
        assert_eq!(info.ctx_id, 100);
        assert_eq!(info.seq_id, 1);
        assert_eq!(info.fence_allocator, 1);
        assert_eq!(info.fence_create_time, 5);
        assert!(!info.is_signaled());

        assert_eq!(table.destroy(1, 100, 1).unwrap(), hash);
        assert!(matches!(table.find(100, 1), Err(HwFenceError::NotFound)));
        assert!(matches!(table.info(hash), Err(HwFenceError::NotFound)));

        // The freed slot is the first one probed, so it is reused.
        assert_eq!(table.create(2, 100, 1, 6).unwrap(), hash);
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let table = new_table(64);
        table.create(1, 7, 7, 0).unwrap();
        assert!(matches!(
            table.create(2, 7, 7, 0),
            Err(HwFenceError::DuplicateKey)
        ));
    }

    #[test]
    fn duplicate_detected_past_a_freed_slot() {
        let table = new_table(16);
        let other = colliding_seq(&table, 3, 1);

        let first = table.create(1, 3, 1, 0).unwrap();
        let second = table.create(1, 3, other, 0).unwrap();
        assert_eq!(second, (first + 1) % 16);

        table.destroy(1, 3, 1).unwrap();
        assert!(matches!(
            table.create(1, 3, other, 0),
            Err(HwFenceError::DuplicateKey)
        ));
        assert_eq!(table.find(3, other).unwrap(), second);
    }

    #[test]
    fn destroy_checks_owner() {
        let table = new_table(64);
        let hash = table.create(1, 9, 9, 0).unwrap();

        assert!(matches!(table.destroy(2, 9, 9), Err(HwFenceError::NotOwner)));
        assert!(matches!(
            table.destroy_by_hash(2, hash),
            Err(HwFenceError::NotOwner)
        ));
        assert!(matches!(table.destroy(1, 9, 10), Err(HwFenceError::NotFound)));
        table.destroy_by_hash(1, hash).unwrap();
        assert!(matches!(
            table.destroy_by_hash(1, hash),
            Err(HwFenceError::NotFound)
        ));
    }

    #[test]
    fn full_table() {
        let table = new_table(4);
        for seq in 0..4 {
            table.create(1, 1, seq, 0).unwrap();
        }
        assert!(matches!(
            table.create(1, 1, 4, 0),
            Err(HwFenceError::TableFull)
        ));
        assert!(matches!(table.find(1, 4), Err(HwFenceError::NotFound)));

        // Every key stays reachable even though all of them probed past collisions.
        for seq in 0..4 {
            table.find(1, seq).unwrap();
        }
    }

    #[test]
    fn keys_stay_unique() {
        // 55 distinct keys, so the table never fills.
        let table = new_table(64);
        let mut live = Vec::new();

        for round in 0..200u64 {
            let key = (round % 5, round % 11);
            match table.create(1, key.0, key.1, round) {
                Ok(_) => live.push(key),
                Err(HwFenceError::DuplicateKey) => assert!(live.contains(&key)),
                Err(e) => panic!("unexpected error {e}"),
            }
            if round % 3 == 0 {
                if let Some(key) = live.pop() {
                    table.destroy(1, key.0, key.1).unwrap();
                }
            }
        }

        let mut keys: Vec<_> = (0..64)
            .filter_map(|hash| table.info(hash).ok())
            .map(|info| (info.ctx_id, info.seq_id))
            .collect();
        assert_eq!(keys.len(), live.len());
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), live.len());
    }

    #[test]
    fn parent_list_is_capped() {
        let table = new_table(16);
        let hash = table.create(1, 1, 1, 0).unwrap();
        let (record, _guard) = table.lock_record(hash).unwrap();

        for parent in 10..13 {
            record.add_parent(parent).unwrap();
        }
        assert!(matches!(
            record.add_parent(13),
            Err(HwFenceError::TooManyParents)
        ));

        assert!(record.remove_parent(11));
        assert!(!record.remove_parent(11));
        assert_eq!(record.info(hash).parents(), &[10, 12]);
    }

    #[test]
    fn destroying_join_unlinks_it() {
        let table = new_table(16);
        let member = table.create(1, 1, 1, 0).unwrap();
        let join = table.create(1, 2, 1, 0).unwrap();
        let other = table.create(1, 2, 2, 0).unwrap();
        for parent in [join, other] {
            let (record, _guard) = table.lock_record(parent).unwrap();
            record.set_flags(HwFenceFlags::JOIN);
        }
        {
            let (record, _guard) = table.lock_record(member).unwrap();
            record.add_parent(join).unwrap();
            record.add_parent(other).unwrap();
        }

        table.destroy_by_hash(1, join).unwrap();
        assert_eq!(table.info(member).unwrap().parents(), &[other]);

        // Owner is checked before anything is unlinked.
        assert!(matches!(table.destroy(2, 2, 2), Err(HwFenceError::NotOwner)));
        assert_eq!(table.info(member).unwrap().parents(), &[other]);

        assert_eq!(table.destroy(1, 2, 2).unwrap(), other);
        assert!(table.info(member).unwrap().parents().is_empty());
    }
}
