// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Attribute client adapter: the transport trait, its event set, and a
//! per-connection queue that keeps at most one request in flight.

use crate::types::Address;
use log::warn;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// CCC value enabling notifications.
pub const CCC_NOTIFY: u16 = 0x0001;
/// CCC value enabling indications.
pub const CCC_INDICATE: u16 = 0x0002;

/// Default ATT MTU; anything at this value triggers an upgrade request.
pub const DEFAULT_MTU: u16 = 23;
/// MTU requested on every new connection.
pub const REQUESTED_MTU: u16 = 240;

/// Characteristic discovered by a service search.
#[derive(Debug, Clone)]
pub struct GattCharacteristic {
    pub uuid: u16,
    pub value_handle: u16,
    pub ccc_handle: Option<u16>,
}

/// Service included by another service.
#[derive(Debug, Clone)]
pub struct GattIncludedService {
    pub uuid: u16,
    pub start_handle: u16,
}

/// Service discovered by a service search.
#[derive(Debug, Clone)]
pub struct GattService {
    pub uuid: u16,
    pub handle: u16,
    pub is_primary: bool,
    pub included_services: Vec<GattIncludedService>,
    pub characteristics: Vec<GattCharacteristic>,
}

/// Attribute protocol transport. Requests return immediately; completions
/// arrive later as [`GattEvent`]s posted to the main loop.
pub trait GattClient {
    fn open(&self, addr: Address, direct: bool);
    fn cancel_open(&self, addr: Address, direct: bool);
    fn close(&self, conn_id: u16);
    fn configure_mtu(&self, conn_id: u16, mtu: u16);
    fn request_peer_sca(&self, addr: Address);
    fn is_encrypted(&self, addr: Address) -> bool;
    fn set_encryption(&self, addr: Address);
    fn service_search(&self, conn_id: u16, service_uuid: u16);
    fn get_services(&self, conn_id: u16) -> Vec<GattService>;
    fn register_notification(&self, addr: Address, handle: u16);
    fn deregister_notification(&self, addr: Address, handle: u16);
    fn read_characteristic(&self, conn_id: u16, handle: u16);
    fn write_characteristic(&self, conn_id: u16, handle: u16, value: Vec<u8>);
    fn write_descriptor(&self, conn_id: u16, handle: u16, value: Vec<u8>);
    /// HCI connection handle of the LE link, used to bind CISes to it.
    fn acl_conn_handle(&self, addr: Address) -> u16;
    /// Drop the underlying ACL, not just the client registration. Used to
    /// recover from unresponsive peers.
    fn disconnect_acl(&self, addr: Address);
}

/// Transport completions and notifications, in main-loop message form.
#[derive(Debug)]
pub enum GattEvent {
    Open { status: u8, conn_id: u16, addr: Address, mtu: u16 },
    Close { conn_id: u16, addr: Address, reason: DisconnectReason },
    MtuConfigured { conn_id: u16, mtu: u16 },
    EncryptionComplete { addr: Address, success: bool },
    SearchComplete { conn_id: u16, success: bool },
    Notification { conn_id: u16, handle: u16, value: Vec<u8> },
    ReadResponse { conn_id: u16, handle: u16, success: bool, value: Vec<u8> },
    WriteResponse { conn_id: u16, handle: u16, success: bool },
    DescriptorWriteResponse { conn_id: u16, handle: u16, success: bool },
    ServiceChanged { addr: Address },
    ServiceDiscoveryDone { addr: Address },
}

pub const GATT_STATUS_SUCCESS: u8 = 0x00;

/// Why a connection closed, as far as reconnect policy cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    TerminatedLocalHost,
    Remote,
}

/// Read completions carry the tag the read was queued with; a non-zero tag
/// marks the final initial-state read of a device, after which the
/// connection-ready hook runs.
pub const READ_TAG_NONE: u32 = 0;
pub const READ_TAG_NOTIFY_CONNECTED: u32 = 1;

#[derive(Debug)]
enum QueuedOp {
    Read { handle: u16, tag: u32 },
    WriteCharacteristic { handle: u16, value: Vec<u8> },
    WriteDescriptor { handle: u16, value: Vec<u8> },
    ConfigureMtu { mtu: u16 },
}

/// Serializes attribute requests per connection: one outstanding operation,
/// the rest queued in issue order.
pub struct GattQueue {
    raw: Rc<dyn GattClient>,
    queues: RefCell<HashMap<u16, VecDeque<QueuedOp>>>,
}

impl GattQueue {
    pub fn new(raw: Rc<dyn GattClient>) -> Self {
        Self { raw, queues: RefCell::new(HashMap::new()) }
    }

    pub fn raw(&self) -> &Rc<dyn GattClient> {
        &self.raw
    }

    pub fn read_characteristic(&self, conn_id: u16, handle: u16, tag: u32) {
        self.enqueue(conn_id, QueuedOp::Read { handle, tag });
    }

    pub fn write_characteristic(&self, conn_id: u16, handle: u16, value: Vec<u8>) {
        self.enqueue(conn_id, QueuedOp::WriteCharacteristic { handle, value });
    }

    pub fn write_descriptor(&self, conn_id: u16, handle: u16, value: Vec<u8>) {
        self.enqueue(conn_id, QueuedOp::WriteDescriptor { handle, value });
    }

    pub fn configure_mtu(&self, conn_id: u16, mtu: u16) {
        self.enqueue(conn_id, QueuedOp::ConfigureMtu { mtu });
    }

    /// Drop every queued operation of a closing connection.
    pub fn clean(&self, conn_id: u16) {
        self.queues.borrow_mut().remove(&conn_id);
    }

    /// Completion of the in-flight read; returns its tag and issues the
    /// next queued operation.
    pub fn on_read_complete(&self, conn_id: u16) -> u32 {
        match self.pop_and_issue_next(conn_id) {
            Some(QueuedOp::Read { tag, .. }) => tag,
            completed => {
                warn!("Read completion did not match queue head: {:?}", completed);
                READ_TAG_NONE
            }
        }
    }

    /// Completion of the in-flight write, descriptor write or MTU exchange.
    pub fn on_write_complete(&self, conn_id: u16) {
        self.pop_and_issue_next(conn_id);
    }

    fn enqueue(&self, conn_id: u16, op: QueuedOp) {
        let mut queues = self.queues.borrow_mut();
        let queue = queues.entry(conn_id).or_default();
        queue.push_back(op);
        if queue.len() == 1 {
            self.issue(conn_id, queue.front().unwrap());
        }
    }

    fn pop_and_issue_next(&self, conn_id: u16) -> Option<QueuedOp> {
        let mut queues = self.queues.borrow_mut();
        let queue = queues.get_mut(&conn_id)?;
        let completed = queue.pop_front();
        if let Some(next) = queue.front() {
            self.issue(conn_id, next);
        }
        completed
    }

    fn issue(&self, conn_id: u16, op: &QueuedOp) {
        match op {
            QueuedOp::Read { handle, .. } => self.raw.read_characteristic(conn_id, *handle),
            QueuedOp::WriteCharacteristic { handle, value } => {
                self.raw.write_characteristic(conn_id, *handle, value.clone())
            }
            QueuedOp::WriteDescriptor { handle, value } => {
                self.raw.write_descriptor(conn_id, *handle, value.clone())
            }
            QueuedOp::ConfigureMtu { mtu } => self.raw.configure_mtu(conn_id, *mtu),
        }
    }
}
