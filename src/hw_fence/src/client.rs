// Copyright 2024 The hw_fence Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client types and the mapping from external client ids to compact internal ids.
//!
//! Every domain builds the same `ClientMap` from the same configuration, so internal ids,
//! queue locations and interrupt bindings agree across domains without being exchanged.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::carve_out::CarveOutLayout;
use crate::hw_fence_utils::*;
use crate::queue::HwFenceQueue;

/// IPC domain ids of the peers a fence interrupt can be routed to.
pub const HW_FENCE_IPC_DOMAIN_APPS: u32 = 8;
pub const HW_FENCE_IPC_DOMAIN_GPU: u32 = 9;
pub const HW_FENCE_IPC_DOMAIN_IPE: u32 = 11;
pub const HW_FENCE_IPC_DOMAIN_VPU: u32 = 12;
pub const HW_FENCE_IPC_DOMAIN_DPU: u32 = 25;
pub const HW_FENCE_IPC_DOMAIN_IFE: u32 = 128;

/// Queue index of the TX and RX queues within a client's queue set.
pub const HW_FENCE_TX_QUEUE: u32 = 0;
pub const HW_FENCE_RX_QUEUE: u32 = 1;

/// Closed set of client types.  Each owns a contiguous range of external client ids.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClientType {
    Gpu,
    Dpu,
    Val,
    Ipe,
    Vpu,
    Ife0,
    Ife1,
    Ife2,
    Ife3,
    Ife4,
    Ife5,
    Ife6,
    Ife7,
}

/// Static description of a client type.
#[derive(Clone, Debug)]
pub struct ClientTypeDesc {
    pub client_type: ClientType,
    pub name: &'static str,
    /// First external client id of the type.
    pub init_id: u32,
    /// Size of the external id range.
    pub max_clients_num: u32,
    /// Number of sub-clients that get an internal id unless configured otherwise.
    pub clients_num: u32,
    pub queues_num: u32,
    pub queue_entries: u32,
    pub txq_idx_start: u32,
    pub txq_idx_factor: u32,
    pub skip_txq_wr_idx: bool,
    pub update_rxq: bool,
    pub send_ipc: bool,
    pub ipc_domain: u32,
    /// Signal id of the first sub-client; sub-client `n` uses `signal_base + n`.
    pub signal_base: u32,
    pub client_data_idx: Option<usize>,
}

const fn ife_desc(client_type: ClientType, name: &'static str, n: u32) -> ClientTypeDesc {
    ClientTypeDesc {
        client_type,
        name,
        init_id: 79 + 32 * n,
        max_clients_num: 32,
        clients_num: 0,
        queues_num: 1,
        queue_entries: 32,
        txq_idx_start: 0,
        txq_idx_factor: 4,
        skip_txq_wr_idx: true,
        update_rxq: false,
        send_ipc: true,
        ipc_domain: HW_FENCE_IPC_DOMAIN_IFE + n,
        signal_base: 0,
        client_data_idx: None,
    }
}

pub static HW_FENCE_CLIENT_TYPES: [ClientTypeDesc; 13] = [
    ClientTypeDesc {
        client_type: ClientType::Gpu,
        name: "gpu",
        init_id: 1,
        max_clients_num: 1,
        clients_num: 1,
        queues_num: 2,
        queue_entries: 64,
        txq_idx_start: 0,
        txq_idx_factor: 1,
        skip_txq_wr_idx: false,
        update_rxq: true,
        send_ipc: true,
        ipc_domain: HW_FENCE_IPC_DOMAIN_GPU,
        signal_base: 0,
        client_data_idx: None,
    },
    ClientTypeDesc {
        client_type: ClientType::Dpu,
        name: "dpu",
        init_id: 2,
        max_clients_num: 6,
        clients_num: 6,
        queues_num: 1,
        queue_entries: 128,
        txq_idx_start: 0,
        txq_idx_factor: 1,
        skip_txq_wr_idx: false,
        update_rxq: false,
        send_ipc: true,
        ipc_domain: HW_FENCE_IPC_DOMAIN_DPU,
        signal_base: 0,
        client_data_idx: None,
    },
    ClientTypeDesc {
        client_type: ClientType::Val,
        name: "val",
        init_id: 8,
        max_clients_num: 7,
        clients_num: 7,
        queues_num: 2,
        queue_entries: 128,
        txq_idx_start: 0,
        txq_idx_factor: 1,
        skip_txq_wr_idx: false,
        update_rxq: true,
        send_ipc: true,
        ipc_domain: HW_FENCE_IPC_DOMAIN_APPS,
        signal_base: 14,
        client_data_idx: None,
    },
    ClientTypeDesc {
        client_type: ClientType::Ipe,
        name: "ipe",
        init_id: 15,
        max_clients_num: 32,
        clients_num: 1,
        queues_num: 1,
        queue_entries: 32,
        txq_idx_start: 0,
        txq_idx_factor: 1,
        skip_txq_wr_idx: false,
        update_rxq: false,
        send_ipc: true,
        ipc_domain: HW_FENCE_IPC_DOMAIN_IPE,
        signal_base: 0,
        client_data_idx: Some(0),
    },
    ClientTypeDesc {
        client_type: ClientType::Vpu,
        name: "vpu",
        init_id: 47,
        max_clients_num: 32,
        clients_num: 1,
        queues_num: 1,
        queue_entries: 32,
        txq_idx_start: 0,
        txq_idx_factor: 1,
        skip_txq_wr_idx: false,
        update_rxq: false,
        send_ipc: true,
        ipc_domain: HW_FENCE_IPC_DOMAIN_VPU,
        signal_base: 0,
        client_data_idx: Some(1),
    },
    ife_desc(ClientType::Ife0, "ife0", 0),
    ife_desc(ClientType::Ife1, "ife1", 1),
    ife_desc(ClientType::Ife2, "ife2", 2),
    ife_desc(ClientType::Ife3, "ife3", 3),
    ife_desc(ClientType::Ife4, "ife4", 4),
    ife_desc(ClientType::Ife5, "ife5", 5),
    ife_desc(ClientType::Ife6, "ife6", 6),
    ife_desc(ClientType::Ife7, "ife7", 7),
];

impl ClientType {
    pub fn desc(self) -> &'static ClientTypeDesc {
        // The descriptor table is ordered like the enum.
        &HW_FENCE_CLIENT_TYPES[self as usize]
    }

    /// Client type owning the external id `client_id`.
    pub fn from_client_id(client_id: u32) -> Option<ClientType> {
        HW_FENCE_CLIENT_TYPES
            .iter()
            .find(|desc| client_id >= desc.init_id && client_id - desc.init_id < desc.max_clients_num)
            .map(|desc| desc.client_type)
    }
}

/// Per-type overrides applied on top of the descriptor table.
#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    pub clients_num: BTreeMap<ClientType, u32>,
    pub queue_entries: BTreeMap<ClientType, u32>,
}

/// Everything every domain knows about one internal client id.
#[derive(Clone, Debug)]
pub struct ClientSlot {
    pub internal_id: u32,
    pub client_id: u32,
    pub client_type: ClientType,
    pub queues_num: u32,
    pub queue_entries: u32,
    pub update_rxq: bool,
    pub send_ipc: bool,
    pub ipc_domain: u32,
    pub signal_id: u32,
    pub client_data_idx: Option<usize>,
    /// Filled in once the carve-out layout is known.
    pub queues: Vec<HwFenceQueue>,
}

impl ClientSlot {
    pub fn tx_queue(&self) -> Option<&HwFenceQueue> {
        self.queues.get(HW_FENCE_TX_QUEUE as usize)
    }

    pub fn rx_queue(&self) -> Option<&HwFenceQueue> {
        self.queues.get(HW_FENCE_RX_QUEUE as usize)
    }

    pub fn wait_bit(&self) -> u64 {
        1 << self.internal_id
    }
}

/// Internal ids of all configured clients.  Internal id 0 is reserved and has no slot.
#[derive(Debug)]
pub struct ClientMap {
    slots: Vec<Option<ClientSlot>>,
    by_client_id: BTreeMap<u32, u32>,
}

impl ClientMap {
    pub fn new(config: &ClientConfig) -> HwFenceResult<ClientMap> {
        let mut slots = vec![None];
        let mut by_client_id = BTreeMap::new();

        for desc in HW_FENCE_CLIENT_TYPES.iter() {
            let clients_num = config
                .clients_num
                .get(&desc.client_type)
                .copied()
                .unwrap_or(desc.clients_num);
            let queue_entries = config
                .queue_entries
                .get(&desc.client_type)
                .copied()
                .unwrap_or(desc.queue_entries);

            if clients_num > desc.max_clients_num {
                return Err(HwFenceError::InvalidConfig("too many sub-clients for client type"));
            }
            if desc.txq_idx_factor == 0 || queue_entries < 2 {
                return Err(HwFenceError::InvalidConfig("invalid queue descriptor"));
            }

            for n in 0..clients_num {
                let internal_id = slots.len() as u32;
                if internal_id as usize >= HW_FENCE_MAX_CLIENTS {
                    return Err(HwFenceError::InvalidConfig("too many clients"));
                }

                let client_id = desc.init_id + n;
                by_client_id.insert(client_id, internal_id);
                slots.push(Some(ClientSlot {
                    internal_id,
                    client_id,
                    client_type: desc.client_type,
                    queues_num: desc.queues_num,
                    queue_entries,
                    update_rxq: desc.update_rxq,
                    send_ipc: desc.send_ipc,
                    ipc_domain: desc.ipc_domain,
                    signal_id: desc.signal_base + n,
                    client_data_idx: desc.client_data_idx,
                    queues: Vec::new(),
                }));
            }
        }

        Ok(ClientMap {
            slots,
            by_client_id,
        })
    }

    /// `(queues_num, queue_entries)` for internal ids 1.., the input of `CarveOutLayout::new`.
    pub fn queue_config(&self) -> Vec<(u32, u32)> {
        self.slots
            .iter()
            .skip(1)
            .flatten()
            .map(|slot| (slot.queues_num, slot.queue_entries))
            .collect()
    }

    /// Binds every slot to its queues inside `layout`.
    pub fn bind_queues(&mut self, layout: &CarveOutLayout) {
        for slot in self.slots.iter_mut().flatten() {
            let desc = slot.client_type.desc();
            if let Some(Some(region)) = layout.clients.get(slot.internal_id as usize) {
                slot.queues = HwFenceQueue::client_queues(
                    region,
                    desc.txq_idx_start,
                    desc.txq_idx_factor,
                    desc.skip_txq_wr_idx,
                );
            }
        }
    }

    /// Internal slot of external client `client_id`.
    pub fn lookup(&self, client_id: u32) -> HwFenceResult<&ClientSlot> {
        let client_type = ClientType::from_client_id(client_id).ok_or(HwFenceError::UnknownType)?;
        let slot = self
            .by_client_id
            .get(&client_id)
            .and_then(|&internal_id| self.slot(internal_id))
            .ok_or(HwFenceError::NoQueueConfig)?;

        if slot.client_type != client_type || slot.queues.is_empty() {
            return Err(HwFenceError::NoQueueConfig);
        }
        Ok(slot)
    }

    pub fn slot(&self, internal_id: u32) -> Option<&ClientSlot> {
        self.slots.get(internal_id as usize).and_then(|slot| slot.as_ref())
    }

    /// Number of internal ids in use, including the reserved id 0.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.len() <= 1
    }
}

/// Registration state of an internal id in this domain.
#[derive(Default)]
pub struct ClientState {
    pub registered: AtomicBool,
    pub resetting: AtomicBool,
    error_handler: Mutex<Option<HwFenceErrorHandler>>,
}

impl ClientState {
    pub fn error_handler(&self) -> Option<HwFenceErrorHandler> {
        match self.error_handler.lock() {
            Ok(handler) => handler.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_error_handler(&self, handler: Option<HwFenceErrorHandler>) {
        let mut guard = match self.error_handler.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = handler;
    }

    /// Claims the registration.  Fails if it is already held.
    pub fn claim(&self) -> bool {
        self.registered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.set_error_handler(None);
        self.registered.store(false, Ordering::Release);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn is_resetting(&self) -> bool {
        self.resetting.load(Ordering::Acquire)
    }
}

/// Handle of a registered client.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HwFenceClient {
    pub client_id: u32,
    pub internal_id: u32,
}
