// Copyright 2024 The hw_fence Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! hw_fence_core: the fence engine of one domain, and its builder.

#[cfg(unix)]
use std::ffi::CStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;
use log::info;
use log::warn;

use crate::carve_out::CarveOut;
use crate::carve_out::CarveOutLayout;
use crate::client::ClientConfig;
use crate::client::ClientMap;
use crate::client::ClientSlot;
use crate::client::ClientState;
use crate::client::ClientType;
use crate::client::HwFenceClient;
use crate::fence_table::FenceTable;
use crate::hw_fence_os::MappedRegion;
#[cfg(unix)]
use crate::hw_fence_os::MemoryMapping;
#[cfg(unix)]
use crate::hw_fence_os::SharedMemory;
use crate::hw_fence_protocol::*;
use crate::hw_fence_utils::*;
use crate::lock::lock;
use crate::lock::Doorbell;
use crate::lock::SpinDoorbell;
use crate::queue::init_queue_set;
use crate::queue::HwFenceQueue;

/// The fence engine as seen from one domain.  Every domain sharing a carve-out builds its own
/// `HwFence` over it with the same configuration and its own `domain_id`.
pub struct HwFence {
    pub(crate) carve_out: Arc<CarveOut>,
    pub(crate) table: FenceTable,
    pub(crate) clients: ClientMap,
    pub(crate) states: Vec<ClientState>,
    pub(crate) ipc: Arc<dyn IpcSignal>,
    pub(crate) doorbell: Arc<dyn Doorbell>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) domain_id: u32,
    #[cfg(unix)]
    shm: Option<SharedMemory>,
}

impl HwFence {
    pub fn domain_id(&self) -> u32 {
        self.domain_id
    }

    pub fn layout(&self) -> &CarveOutLayout {
        self.carve_out.layout()
    }

    /// The memfd backing the carve-out, when built by `build_with_memfd`.  Other domains map it
    /// to join.
    #[cfg(unix)]
    pub fn shared_memory(&self) -> Option<&SharedMemory> {
        self.shm.as_ref()
    }

    fn state(&self, client: &HwFenceClient) -> HwFenceResult<(&ClientSlot, &ClientState)> {
        let slot = self
            .clients
            .slot(client.internal_id)
            .filter(|slot| slot.client_id == client.client_id)
            .ok_or(HwFenceError::InvalidClient)?;
        let state = self
            .states
            .get(client.internal_id as usize)
            .ok_or(HwFenceError::InvalidClient)?;

        if !state.is_registered() {
            return Err(HwFenceError::InvalidClient);
        }
        Ok((slot, state))
    }

    /// Slot of a registered client that is not being reset.
    pub(crate) fn active_slot(&self, client: &HwFenceClient) -> HwFenceResult<&ClientSlot> {
        let (slot, state) = self.state(client)?;
        if state.is_resetting() {
            return Err(HwFenceError::ResetInProgress);
        }
        Ok(slot)
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Registers external client `client_id` in this domain and resets its queues.
    pub fn register_client(&self, client_id: u32) -> HwFenceResult<HwFenceClient> {
        let slot = self.clients.lookup(client_id)?;
        let state = &self.states[slot.internal_id as usize];
        if !state.claim() {
            return Err(HwFenceError::AlreadyRegistered);
        }

        if let Some(Some(region)) = self.layout().clients.get(slot.internal_id as usize) {
            let _guard = lock(
                self.carve_out.client_lock(slot.internal_id),
                self.domain_id,
                self.doorbell.as_ref(),
            );
            init_queue_set(&self.carve_out, region, &slot.queues);
        }

        debug!(
            "registered {:?} client {} as internal id {}",
            slot.client_type, client_id, slot.internal_id
        );
        Ok(HwFenceClient {
            client_id,
            internal_id: slot.internal_id,
        })
    }

    /// Releases the registration.  Fences the client allocated stay in the table.
    pub fn deregister_client(&self, client: &HwFenceClient) -> HwFenceResult<()> {
        let (_, state) = self.state(client)?;
        if state.is_resetting() {
            return Err(HwFenceError::ResetInProgress);
        }

        state.release();
        debug!("deregistered client {}", client.client_id);
        Ok(())
    }

    /// `(rx_domain_id, signal_id)` the client's interrupts are raised on.
    pub fn client_signal(&self, client: &HwFenceClient) -> HwFenceResult<(u32, u32)> {
        let (slot, _) = self.state(client)?;
        Ok((slot.ipc_domain, slot.signal_id))
    }

    /// Errors signaled on fences this client waits on are reported to `handler` instead of the
    /// client's RX queue.
    pub fn register_error_callback(
        &self,
        client: &HwFenceClient,
        handler: HwFenceErrorHandler,
    ) -> HwFenceResult<()> {
        let (_, state) = self.state(client)?;
        state.set_error_handler(Some(handler));
        Ok(())
    }

    pub fn deregister_error_callback(&self, client: &HwFenceClient) -> HwFenceResult<()> {
        let (_, state) = self.state(client)?;
        state.set_error_handler(None);
        Ok(())
    }

    pub fn create_fence(&self, client: &HwFenceClient, ctx_id: u64, seq_id: u64) -> HwFenceResult<u64> {
        self.active_slot(client)?;
        self.table.create(client.internal_id, ctx_id, seq_id, self.now())
    }

    /// Frees a fence allocated by `client`.  Destroying a join unlinks it from its members.
    /// Destroying an unsignaled member does not signal the joins that count on it: they stay
    /// pending until they are destroyed themselves or their allocator is reset.
    pub fn destroy_fence(&self, client: &HwFenceClient, ctx_id: u64, seq_id: u64) -> HwFenceResult<()> {
        self.active_slot(client)?;
        self.table.destroy(client.internal_id, ctx_id, seq_id)?;
        Ok(())
    }

    /// Same as `destroy_fence`, addressing the fence by its slot.
    pub fn destroy_fence_by_hash(&self, client: &HwFenceClient, hash: u64) -> HwFenceResult<()> {
        self.active_slot(client)?;
        self.table.destroy_by_hash(client.internal_id, hash)
    }

    pub fn find_fence(&self, ctx_id: u64, seq_id: u64) -> HwFenceResult<u64> {
        self.table.find(ctx_id, seq_id)
    }

    pub fn fence_info(&self, hash: u64) -> HwFenceResult<HwFenceInfo> {
        self.table.info(hash)
    }

    /// Logs every valid record and the queue positions of every client at debug level.
    pub fn dump_table(&self) {
        self.table.dump();

        for internal_id in 1..self.clients.len() as u32 {
            let slot = match self.clients.slot(internal_id) {
                Some(slot) => slot,
                None => continue,
            };
            for queue in &slot.queues {
                let hdr = queue.header(&self.carve_out);
                debug!(
                    "client {} queue type {}: read {} write {} tx_wm {}",
                    slot.client_id, hdr.queue_type, hdr.read_index, hdr.write_index, hdr.tx_wm
                );
            }
        }
    }

    /// Adds `client` to the waiters of fence `hash`.  `client_data` is echoed back in the
    /// delivery for client types that carry data.  A fence that is already signaled is
    /// delivered right away.
    pub fn wait_register(&self, client: &HwFenceClient, hash: u64, client_data: u64) -> HwFenceResult<()> {
        let slot = self.active_slot(client)?;

        let signaled = {
            let (record, _guard) = self.table.lock_record(hash)?;
            if !record.is_valid() {
                return Err(HwFenceError::NotFound);
            }

            record.wait_client_mask.fetch_or(slot.wait_bit(), Ordering::Relaxed);
            if let Some(idx) = slot.client_data_idx {
                record.client_data[idx].store(client_data, Ordering::Relaxed);
            }
            record.fence_wait_time.store(self.now(), Ordering::Relaxed);

            if record.is_signaled() {
                Some(record.info(hash))
            } else {
                None
            }
        };

        if let Some(info) = signaled {
            debug!("fence {} already signaled, delivering to client {}", hash, client.client_id);
            self.deliver(slot, &info);
        }
        Ok(())
    }

    /// Signals fence `hash` on behalf of `client`: queues a TX payload for the client's peer,
    /// marks the record signaled, notifies the waiters and any join records depending on it.
    pub fn update_txq(&self, client: &HwFenceClient, hash: u64, error: u32) -> HwFenceResult<()> {
        let slot = self.active_slot(client)?;
        let txq = slot.tx_queue().ok_or(HwFenceError::NoQueueConfig)?;

        let info = {
            let (record, _guard) = self.table.lock_record(hash)?;
            if !record.is_valid() {
                return Err(HwFenceError::NotFound);
            }
            if record.is_signaled() {
                return Err(HwFenceError::AlreadySignaled);
            }

            let now = self.now();
            let client_data = slot
                .client_data_idx
                .map(|idx| record.client_data[idx].load(Ordering::Relaxed))
                .unwrap_or(0);
            let payload = HwFenceQueuePayload::new(
                record.ctx_id.load(Ordering::Relaxed),
                record.seq_id.load(Ordering::Relaxed),
                hash,
                (record.flags() | HwFenceFlags::SIGNALED).bits(),
                client_data,
                error,
                now,
            );
            txq.write(&self.carve_out, &payload)?;

            record.mark_signaled(client.internal_id, error, now);
            record.info(hash)
        };

        debug!("client {} signaled fence {} error {}", client.client_id, hash, error);
        self.complete(info);
        Ok(())
    }

    /// Attaches `error` to a TX payload for `hash` the peer has not consumed yet.
    pub fn update_txq_error(&self, client: &HwFenceClient, hash: u64, error: u32) -> HwFenceResult<()> {
        let slot = self.active_slot(client)?;
        let txq = slot.tx_queue().ok_or(HwFenceError::NoQueueConfig)?;
        txq.update_existing_tx_entry(&self.carve_out, hash, error)
    }

    /// Pops the oldest delivery from the client's RX queue.
    pub fn read_rxq(&self, client: &HwFenceClient) -> HwFenceResult<(HwFenceQueuePayload, bool)> {
        let slot = self.active_slot(client)?;
        let rxq = slot.rx_queue().ok_or(HwFenceError::NoQueueConfig)?;

        let _guard = lock(
            self.carve_out.client_lock(slot.internal_id),
            self.domain_id,
            self.doorbell.as_ref(),
        );
        rxq.read(&self.carve_out)
    }

    /// Pops the oldest payload of the client's TX queue, as its peer would.
    pub fn read_txq(&self, client: &HwFenceClient) -> HwFenceResult<(HwFenceQueuePayload, bool)> {
        let slot = self.active_slot(client)?;
        let txq = slot.tx_queue().ok_or(HwFenceError::NoQueueConfig)?;
        txq.read(&self.carve_out)
    }

    /// Recovers after the domain behind `client` went away: it stops waiting on anything, its
    /// pending fences are signaled with `HW_FENCE_ERROR_RESET` and, unless `WITHOUT_DESTROY` is
    /// given, its fences are destroyed.  Its queues are emptied.
    pub fn reset_client(&self, client: &HwFenceClient, flags: HwFenceResetFlags) -> HwFenceResult<()> {
        let (slot, state) = self.state(client)?;
        if state.resetting.swap(true, Ordering::AcqRel) {
            return Err(HwFenceError::ResetInProgress);
        }

        info!("resetting client {} flags {:?}", client.client_id, flags);
        let res = self.reset_fences(slot, flags);
        self.reset_queues(slot);

        state.resetting.store(false, Ordering::Release);
        res
    }

    fn reset_fences(&self, slot: &ClientSlot, flags: HwFenceResetFlags) -> HwFenceResult<()> {
        let internal_id = slot.internal_id;

        for hash in 0..self.table.entries() as u64 {
            let signaled = {
                let (record, _guard) = self.table.lock_record(hash)?;
                if !record.is_valid() {
                    continue;
                }

                record
                    .wait_client_mask
                    .fetch_and(!slot.wait_bit(), Ordering::Relaxed);
                if record.fence_allocator.load(Ordering::Relaxed) != internal_id {
                    continue;
                }

                if record.is_signaled() {
                    None
                } else {
                    record.mark_signaled(internal_id, HW_FENCE_ERROR_RESET, self.now());
                    Some(record.info(hash))
                }
            };

            if let Some(info) = signaled {
                warn!(
                    "signaling fence ctx {} seq {} of reset client {}",
                    info.ctx_id, info.seq_id, slot.client_id
                );
                self.complete(info);
            }

            if !flags.contains(HwFenceResetFlags::WITHOUT_DESTROY) {
                match self.table.destroy_by_hash(internal_id, hash) {
                    Ok(()) | Err(HwFenceError::NotFound) => {}
                    Err(e) => warn!("failed to destroy fence {} on reset: {}", hash, e),
                }
            }
        }

        Ok(())
    }

    fn reset_queues(&self, slot: &ClientSlot) {
        if let Some(txq) = slot.tx_queue() {
            txq.discard_unread(&self.carve_out);
        }
        if let Some(rxq) = slot.rx_queue() {
            let _guard = lock(
                self.carve_out.client_lock(slot.internal_id),
                self.domain_id,
                self.doorbell.as_ref(),
            );
            rxq.discard_unconsumed(&self.carve_out);
        }
    }
}

/// HwFence Builder, following the Rust builder pattern.
pub struct HwFenceBuilder {
    table_entries: u32,
    domain_id: u32,
    client_config: ClientConfig,
    doorbell: Option<Arc<dyn Doorbell>>,
    clock: Option<Arc<dyn Clock>>,
}

impl HwFenceBuilder {
    /// Create new a HwFenceBuilder with the default table size and client counts.
    pub fn new() -> HwFenceBuilder {
        HwFenceBuilder {
            table_entries: HW_FENCE_DEFAULT_TABLE_ENTRIES,
            domain_id: 0,
            client_config: ClientConfig::default(),
            doorbell: None,
            clock: None,
        }
    }

    /// Set the number of records in the fence table.
    pub fn set_table_entries(mut self, table_entries: u32) -> HwFenceBuilder {
        self.table_entries = table_entries;
        self
    }

    /// Set the IPC domain id of the domain building the engine.  It tags the cross-domain locks
    /// and is the source of every interrupt the engine raises.
    pub fn set_domain_id(mut self, domain_id: u32) -> HwFenceBuilder {
        self.domain_id = domain_id;
        self
    }

    /// Set how many sub-clients of `client_type` get an internal id.
    pub fn set_client_count(mut self, client_type: ClientType, count: u32) -> HwFenceBuilder {
        self.client_config.clients_num.insert(client_type, count);
        self
    }

    pub fn set_queue_entries(mut self, client_type: ClientType, entries: u32) -> HwFenceBuilder {
        self.client_config.queue_entries.insert(client_type, entries);
        self
    }

    pub fn set_doorbell(mut self, doorbell: Arc<dyn Doorbell>) -> HwFenceBuilder {
        self.doorbell = Some(doorbell);
        self
    }

    pub fn set_clock(mut self, clock: Arc<dyn Clock>) -> HwFenceBuilder {
        self.clock = Some(clock);
        self
    }

    fn client_map(&self) -> HwFenceResult<(ClientMap, CarveOutLayout)> {
        let mut clients = ClientMap::new(&self.client_config)?;
        let layout = CarveOutLayout::new(self.table_entries, &clients.queue_config())?;
        clients.bind_queues(&layout);
        Ok((clients, layout))
    }

    /// Size in bytes of the carve-out this configuration needs.
    pub fn carve_out_size(&self) -> HwFenceResult<usize> {
        let (_, layout) = self.client_map()?;
        Ok(layout.total_size)
    }

    /// Builds the engine over `region`, which must be zeroed or already initialized by another
    /// domain with the same configuration.
    pub fn build(self, ipc: Arc<dyn IpcSignal>, region: Box<dyn MappedRegion>) -> HwFenceResult<HwFence> {
        let (clients, layout) = self.client_map()?;
        let ctrl = layout.ctrl.clone();
        let carve_out = Arc::new(CarveOut::new(region, layout)?);

        // The first domain to come up initializes the control queues.
        if carve_out.u32_at(ctrl.offset).load(Ordering::Acquire) == 0 {
            let ctrl_queues = HwFenceQueue::client_queues(&ctrl, 0, 1, false);
            init_queue_set(&carve_out, &ctrl, &ctrl_queues);
        }

        let doorbell = self
            .doorbell
            .unwrap_or_else(|| Arc::new(SpinDoorbell) as Arc<dyn Doorbell>);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()) as Arc<dyn Clock>);
        let table = FenceTable::new(carve_out.clone(), self.domain_id, doorbell.clone());
        let states = (0..clients.len()).map(|_| ClientState::default()).collect();

        info!(
            "hw fence domain {}: {} table entries, {} clients, {} byte carve-out",
            self.domain_id,
            table.entries(),
            clients.len() - 1,
            carve_out.layout().total_size
        );

        Ok(HwFence {
            carve_out,
            table,
            clients,
            states,
            ipc,
            doorbell,
            clock,
            domain_id: self.domain_id,
            #[cfg(unix)]
            shm: None,
        })
    }

    /// Builds the engine over a fresh memfd, which other domains can map through
    /// `HwFence::shared_memory`.
    #[cfg(unix)]
    pub fn build_with_memfd(self, ipc: Arc<dyn IpcSignal>) -> HwFenceResult<HwFence> {
        let size = crate::hw_fence_os::round_up_to_page_size(self.carve_out_size()? as u64)?;
        let name = CStr::from_bytes_with_nul(b"hw_fence\0")
            .map_err(|_| HwFenceError::InvalidArgument("bad memfd name"))?;
        let shm = SharedMemory::new(name, size)?;
        let mapping = MemoryMapping::from_shared_memory(&shm)?;

        let mut hw_fence = self.build(ipc, Box::new(mapping))?;
        hw_fence.shm = Some(shm);
        Ok(hw_fence)
    }
}

impl Default for HwFenceBuilder {
    fn default() -> Self {
        HwFenceBuilder::new()
    }
}
