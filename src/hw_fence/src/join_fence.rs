// Copyright 2024 The hw_fence Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Join fences: synthetic fences that signal once all of their members have signaled.

use std::sync::atomic::Ordering;

use log::debug;
use log::warn;

use crate::client::HwFenceClient;
use crate::hw_fence_core::HwFence;
use crate::hw_fence_utils::*;

/// Outcome of attaching one member to a join record.
enum Member {
    /// The member was pending and now lists the join as a parent.
    Linked(u64),
    /// The member was already signaled and has been accounted.
    Signaled,
}

impl HwFence {
    /// Creates join fence `(ctx_id, seq_id)` over `members`, each given as `(ctx_id, seq_id)`.
    /// Members already signaled are accounted right away; when all are, the join signals before
    /// this returns.  On failure the join record is destroyed and no member keeps a link to it.
    pub fn create_join(
        &self,
        client: &HwFenceClient,
        ctx_id: u64,
        seq_id: u64,
        members: &[(u64, u64)],
    ) -> HwFenceResult<u64> {
        self.active_slot(client)?;
        if members.is_empty() {
            return Err(HwFenceError::InvalidArgument("join fence without members"));
        }
        let pending: u32 = members.len().try_into()?;

        let hash = self.table.create(client.internal_id, ctx_id, seq_id, self.now())?;
        {
            let (record, _guard) = self.table.lock_record(hash)?;
            record.set_flags(HwFenceFlags::JOIN);
            record.pending_child_cnt.store(pending, Ordering::Relaxed);
        }

        let mut linked = Vec::with_capacity(members.len());
        for &(member_ctx, member_seq) in members {
            match self.add_member(hash, member_ctx, member_seq) {
                Ok(Member::Linked(member)) => linked.push(member),
                Ok(Member::Signaled) => {}
                Err(e) => {
                    warn!(
                        "join fence ctx {} seq {}: member ctx {} seq {} failed: {}",
                        ctx_id, seq_id, member_ctx, member_seq, e
                    );
                    self.rollback_join(client, hash, &linked);
                    return Err(e);
                }
            }
        }

        debug!(
            "client {} created join fence {} over {} members",
            client.client_id,
            hash,
            members.len()
        );
        Ok(hash)
    }

    fn add_member(&self, join: u64, ctx_id: u64, seq_id: u64) -> HwFenceResult<Member> {
        let member = self.table.find(ctx_id, seq_id)?;
        if member == join {
            return Err(HwFenceError::InvalidArgument("join fence cannot be its own member"));
        }

        let error = {
            let (record, _guard) = self.table.lock_record(member)?;
            if !record.matches(ctx_id, seq_id) {
                return Err(HwFenceError::NotFound);
            }
            if !record.is_signaled() {
                record.add_parent(join)?;
                return Ok(Member::Linked(member));
            }
            record.error.load(Ordering::Relaxed)
        };

        let signaled = {
            let (record, _guard) = self.table.lock_record(join)?;
            record.child_signaled(join, error, self.now())
        };
        if let Some(info) = signaled {
            debug!("join fence {} complete at creation", join);
            self.complete(info);
        }
        Ok(Member::Signaled)
    }

    /// Unlinks the join from exactly the members in `linked`, last first, then frees it.
    fn rollback_join(&self, client: &HwFenceClient, join: u64, linked: &[u64]) {
        for &member in linked.iter().rev() {
            match self.table.lock_record(member) {
                Ok((record, _guard)) => {
                    if !record.remove_parent(join) {
                        warn!("member {} lost its link to join fence {}", member, join);
                    }
                }
                Err(e) => warn!("failed to unlink member {}: {}", member, e),
            }
        }

        if let Err(e) = self.table.destroy_by_hash(client.internal_id, join) {
            warn!("failed to destroy join fence {}: {}", join, e);
        }
    }
}
