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

//! The LE Audio client: the public operations, service discovery over the
//! attribute protocol, and the audio-session coordinator interlocking the
//! platform audio framework with the group state machine.

use crate::ascs;
use crate::audio_hal::{
    AudioContentType, AudioSessionEvent, AudioSink, AudioSource, AudioUsage, TrackMetadata,
};
use crate::codec::CodecEngine;
use crate::device::{DeviceRef, HandlePair, LeAudioDevices};
use crate::gatt::{
    DisconnectReason, GattClient, GattEvent, GattQueue, GattService, CCC_NOTIFY, DEFAULT_MTU,
    GATT_STATUS_SUCCESS, READ_TAG_NONE, READ_TAG_NOTIFY_CONNECTED, REQUESTED_MTU,
};
use crate::group::LeAudioDeviceGroups;
use crate::iso::{IsoEvent, IsoManager};
use crate::lc3::Lc3;
use crate::pacs;
use crate::state_machine::GroupStateMachine;
use crate::timer::Alarm;
use crate::types::{
    Address, AseState, AudioContexts, ConnectionState, Direction, GroupId, GroupNodeStatus,
    GroupStatus, GroupStreamStatus, LeAudioCodecConfiguration, LeAudioContextType,
    CONN_ID_INVALID, GROUP_ID_UNKNOWN,
};
use crate::{uuid, Message};
use log::{debug, error, info, warn};
use std::fmt::Write as _;
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

/// Keep the ISO links alive this long after the framework suspends, so a
/// quick resume does not rebuild the stream.
pub const AUDIO_SUSPEND_KEEP_ISO_ALIVE_TIMEOUT_MS: u64 = 5000;
const AUDIO_SUSPEND_TIMEOUT_PROP: &str = "persist.bluetooth.leaudio.audio.suspend.timeoutms";

#[derive(Debug, Error)]
pub enum LeAudioError {
    #[error("peer violates the profile: {0}")]
    PeerProtocol(&'static str),
    #[error("no audio set configuration supports {0:?}")]
    ConfigurationUnsupported(LeAudioContextType),
    #[error("audio session could not be acquired")]
    ResourceAcquireFailed,
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),
    #[error("group {0} has no connected member")]
    NotConnected(GroupId),
    #[error("another group is in transition")]
    Busy,
    #[error("invalid context bitmap {0:#06x}")]
    InvalidContext(u16),
}

/// Side state of one audio-framework session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AudioState {
    Idle,
    ReadyToStart,
    Started,
    ReadyToRelease,
    Releasing,
}

/// Consumer callbacks of the client.
pub trait LeAudioClientCallbacks {
    fn on_connection_state(&self, state: ConnectionState, addr: Address);
    fn on_group_status(&self, group_id: GroupId, status: GroupStatus);
    fn on_group_node_status(&self, addr: Address, group_id: GroupId, status: GroupNodeStatus);
    fn on_audio_conf(
        &self,
        directions: crate::types::Directions,
        group_id: GroupId,
        snk_locations: u32,
        src_locations: u32,
        contexts: AudioContexts,
    );
    fn on_sink_audio_location_available(&self, addr: Address, locations: u32);
}

/// Bonded-device storage boundary.
pub trait Storage {
    fn set_leaudio_autoconnect(&self, addr: Address, autoconnect: bool);
}

/// Group-membership (coordinated set) boundary.
pub trait DeviceGroups {
    fn add_device(&self, addr: Address, group_id: Option<GroupId>);
    fn remove_device(&self, addr: Address, group_id: GroupId);
    fn get_group_id(&self, addr: Address) -> GroupId;
}

/// Group-membership callbacks, in main-loop message form.
#[derive(Debug)]
pub enum GroupEvent {
    GroupAdded { addr: Address, group_id: GroupId },
    MemberAdded { addr: Address, group_id: GroupId },
    MemberRemoved { addr: Address, group_id: GroupId },
}

pub struct LeAudioClient {
    callbacks: Rc<dyn LeAudioClientCallbacks>,
    gatt: Rc<GattQueue>,
    iso: Rc<dyn IsoManager>,
    audio_source: Rc<dyn AudioSource>,
    audio_sink: Rc<dyn AudioSink>,
    storage: Rc<dyn Storage>,
    device_groups: Rc<dyn DeviceGroups>,

    devices: LeAudioDevices,
    groups: LeAudioDeviceGroups,
    state_machine: GroupStateMachine,
    codec: CodecEngine,

    active_group_id: GroupId,
    current_context_type: LeAudioContextType,

    audio_sender_state: AudioState,
    audio_receiver_state: AudioState,

    current_source_codec_config: LeAudioCodecConfiguration,
    current_sink_codec_config: LeAudioCodecConfiguration,
    audio_framework_source_config: LeAudioCodecConfiguration,
    audio_framework_sink_config: LeAudioCodecConfiguration,

    audio_source_acquired: bool,
    audio_sink_acquired: bool,

    suspend_timeout: Alarm,

    stream_setup_start: Option<Instant>,
    stream_setup_ms: u64,
}

impl LeAudioClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        callbacks: Rc<dyn LeAudioClientCallbacks>,
        gatt_client: Rc<dyn GattClient>,
        iso: Rc<dyn IsoManager>,
        audio_source: Rc<dyn AudioSource>,
        audio_sink: Rc<dyn AudioSink>,
        storage: Rc<dyn Storage>,
        device_groups: Rc<dyn DeviceGroups>,
        lc3: Rc<dyn Lc3>,
        tx: UnboundedSender<Message>,
    ) -> Self {
        let gatt = Rc::new(GattQueue::new(gatt_client));
        let state_machine = GroupStateMachine::new(gatt.clone(), iso.clone(), tx.clone());
        Self {
            callbacks,
            gatt,
            iso,
            audio_source,
            audio_sink,
            storage,
            device_groups,
            devices: LeAudioDevices::default(),
            groups: LeAudioDeviceGroups::default(),
            state_machine,
            codec: CodecEngine::new(lc3),
            active_group_id: GROUP_ID_UNKNOWN,
            current_context_type: LeAudioContextType::Media,
            audio_sender_state: AudioState::Idle,
            audio_receiver_state: AudioState::Idle,
            current_source_codec_config: LeAudioCodecConfiguration::default(),
            current_sink_codec_config: LeAudioCodecConfiguration::default(),
            audio_framework_source_config: LeAudioCodecConfiguration {
                num_channels: 2,
                sample_rate: 48000,
                bits_per_sample: 16,
                data_interval_us: 10000,
            },
            audio_framework_sink_config: LeAudioCodecConfiguration {
                num_channels: 1,
                sample_rate: 16000,
                bits_per_sample: 16,
                data_interval_us: 10000,
            },
            audio_source_acquired: false,
            audio_sink_acquired: false,
            suspend_timeout: Alarm::new(tx),
            stream_setup_start: None,
            stream_setup_ms: 0,
        }
    }

    fn suspend_timeout_ms() -> u64 {
        std::env::var(AUDIO_SUSPEND_TIMEOUT_PROP)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(AUDIO_SUSPEND_KEEP_ISO_ALIVE_TIMEOUT_MS)
    }

    /// Main-loop entry point; every external event lands here.
    pub fn handle_message(&mut self, message: Message) {
        match message {
            Message::Gatt(event) => self.handle_gatt_event(event),
            Message::Iso(event) => self.handle_iso_event(event),
            Message::SourceSession(event) => self.handle_source_session_event(event),
            Message::SinkSession(event) => self.handle_sink_session_event(event),
            Message::Group(event) => self.handle_group_event(event),
            Message::StatusReport(group_id, status) => self.status_report(group_id, status),
            Message::TransitionTimeout(group_id) => self.on_transition_timeout(group_id),
            Message::SuspendTimeout(group_id) => self.group_stop(group_id),
        }
    }

    // ---- Public operations ----

    pub fn connect(&mut self, addr: Address) {
        match self.devices.find_by_address(addr) {
            Some(device) => device.borrow_mut().connecting_actively = true,
            None => {
                self.devices.add(addr, true);
            }
        }
        self.gatt.raw().open(addr, true);
    }

    /// Restore a bonded device and its group assignment from storage.
    pub fn add_from_storage(&mut self, addr: Address, autoconnect: bool) {
        info!("restoring {}", addr);
        if self.devices.find_by_address(addr).is_none() {
            self.devices.add(addr, false);
        }

        let group_id = self.device_groups.get_group_id(addr);
        if group_id != GROUP_ID_UNKNOWN {
            self.group_add_node_internal(group_id, addr);
        }

        if autoconnect {
            self.gatt.raw().open(addr, false);
        }
    }

    pub fn disconnect(&mut self, addr: Address) {
        let Some(device) = self.devices.find_by_address(addr) else {
            error!("{} is not known", addr);
            return;
        };

        let connected = {
            let mut device = device.borrow_mut();
            if device.connecting_actively {
                self.gatt.raw().cancel_open(addr, true);
                device.connecting_actively = false;
            }
            self.gatt.raw().cancel_open(addr, false);
            device.is_connected()
        };

        if connected {
            self.disconnect_device(&device, false);
        } else {
            self.background_connect_if_group_connected(&device);
        }
    }

    pub fn remove_device(&mut self, addr: Address) {
        let Some(device) = self.devices.find_by_address(addr) else { return };

        if device.borrow().is_connected() {
            device.borrow_mut().removing_device = true;
            self.disconnect(addr);
            return;
        }

        let group_id = device.borrow().group_id;
        if group_id != GROUP_ID_UNKNOWN {
            self.group_remove_node_internal(group_id, addr, true);
        }
        self.devices.remove(addr);
    }

    pub fn group_add_node(&mut self, group_id: GroupId, addr: Address) {
        let current = self.device_groups.get_group_id(addr);
        if current == group_id {
            return;
        }
        if current != GROUP_ID_UNKNOWN {
            self.device_groups.remove_device(addr, current);
        }
        self.device_groups.add_device(addr, Some(group_id));
    }

    pub fn group_remove_node(&mut self, group_id: GroupId, addr: Address) {
        let Some(device) = self.devices.find_by_address(addr) else {
            error!("skipping unknown device {}", addr);
            return;
        };
        if device.borrow().group_id != group_id {
            error!("{} is not in group {}", addr, group_id);
            return;
        }
        self.group_remove_node_internal(group_id, addr, true);
    }

    pub fn group_set_active(&mut self, group_id: GroupId) -> Result<(), LeAudioError> {
        debug!("group_set_active {}", group_id);

        if group_id == GROUP_ID_UNKNOWN {
            if self.active_group_id == GROUP_ID_UNKNOWN {
                return Ok(());
            }
            self.suspend_timeout.cancel();
            self.stop_audio();
            self.release_audio_sessions();
            let previous = self.active_group_id;
            self.group_stop(previous);
            self.callbacks.on_group_status(previous, GroupStatus::Inactive);
            self.active_group_id = GROUP_ID_UNKNOWN;
            return Ok(());
        }

        if self.groups.find_by_id(group_id).is_none() {
            error!("invalid group {}", group_id);
            return Err(LeAudioError::UnknownGroup(group_id));
        }

        if self.active_group_id != GROUP_ID_UNKNOWN {
            if self.active_group_id == group_id {
                info!("group {} already active", group_id);
                self.callbacks.on_group_status(group_id, GroupStatus::Active);
                return Ok(());
            }
            info!("switching active group to {}", group_id);
        }

        if !self.audio_source_acquired {
            if !self.audio_source.acquire() {
                error!("could not acquire audio source session");
                return Err(LeAudioError::ResourceAcquireFailed);
            }
            self.audio_source_acquired = true;
        }
        if !self.audio_sink_acquired {
            if !self.audio_sink.acquire() {
                error!("could not acquire audio sink session");
                self.audio_source.release();
                self.audio_source_acquired = false;
                return Err(LeAudioError::ResourceAcquireFailed);
            }
            self.audio_sink_acquired = true;
        }

        self.update_config_if_needed(group_id, LeAudioContextType::Media);
        if self.current_source_codec_config.is_invalid()
            && self.current_sink_codec_config.is_invalid()
        {
            warn!("unsupported device configurations in group {}", group_id);
            return Err(LeAudioError::ConfigurationUnsupported(LeAudioContextType::Media));
        }

        if self.active_group_id == GROUP_ID_UNKNOWN {
            self.audio_framework_source_config.data_interval_us =
                self.current_source_codec_config.data_interval_us;
            self.audio_source.start(self.audio_framework_source_config);
            self.audio_framework_sink_config.data_interval_us =
                self.current_source_codec_config.data_interval_us;
            self.audio_sink.start(self.audio_framework_sink_config);
        } else {
            let previous = self.active_group_id;
            self.group_stop(previous);
        }

        self.active_group_id = group_id;
        self.callbacks.on_group_status(group_id, GroupStatus::Active);
        Ok(())
    }

    pub fn group_stream(&mut self, group_id: GroupId, context_bitmap: u16) {
        if let Err(e) = self.internal_group_stream(group_id, context_bitmap) {
            error!("group {} stream request failed: {}", group_id, e);
        }
    }

    fn internal_group_stream(
        &mut self,
        group_id: GroupId,
        context_bitmap: u16,
    ) -> Result<(), LeAudioError> {
        let context = LeAudioContextType::from_bitmask(context_bitmap)
            .ok_or(LeAudioError::InvalidContext(context_bitmap))?;

        let group =
            self.groups.find_by_id(group_id).ok_or(LeAudioError::UnknownGroup(group_id))?;

        let final_context = if group.active_contexts().intersects(context.as_bitmask()) {
            context
        } else {
            warn!("context {:?} not available on group {}, using unspecified", context, group_id);
            LeAudioContextType::Unspecified
        };

        if !group.is_any_device_connected() {
            return Err(LeAudioError::NotConnected(group_id));
        }

        if self.groups.is_any_in_transition() {
            info!("a group is already in transition");
            return Err(LeAudioError::Busy);
        }

        let group = self.groups.find_by_id_mut(group_id).unwrap();
        if self.state_machine.start_stream(group, final_context) {
            self.stream_setup_start = Some(Instant::now());
        }
        Ok(())
    }

    pub fn group_suspend(&mut self, group_id: GroupId) {
        let Some(group) = self.groups.find_by_id_mut(group_id) else {
            error!("unknown group {}", group_id);
            return;
        };
        if !group.is_any_device_connected() {
            error!("group {} is not connected", group_id);
            return;
        }
        if group.is_in_transition() {
            info!(
                "group {} in transition {:?} -> {:?}",
                group_id,
                group.state(),
                group.target_state()
            );
            return;
        }
        if group.state() != AseState::Streaming {
            error!("group {} is not streaming", group_id);
            return;
        }
        self.state_machine.suspend_stream(group);
    }

    pub fn group_stop(&mut self, group_id: GroupId) {
        let Some(group) = self.groups.find_by_id_mut(group_id) else {
            error!("unknown group {}", group_id);
            return;
        };
        if group.is_empty() {
            error!("group {} is empty", group_id);
            return;
        }
        if group.state() == AseState::Idle && !group.is_in_transition() {
            info!("group {} already stopped", group_id);
            return;
        }
        self.state_machine.stop_stream(group);
    }

    pub fn group_destroy(&mut self, group_id: GroupId) {
        let addrs = self.get_group_devices(group_id);
        for addr in addrs {
            self.remove_device(addr);
        }
    }

    pub fn get_group_devices(&self, group_id: GroupId) -> Vec<Address> {
        self.groups
            .find_by_id(group_id)
            .map(|group| group.devices().map(|device| device.borrow().address).collect())
            .unwrap_or_default()
    }

    pub fn cleanup(&mut self) {
        self.suspend_timeout.cancel();
        self.stop_audio();
        self.release_audio_sessions();
        self.devices.clear();
        self.groups.clear();
    }

    pub fn debug_dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "LeAudio client:");
        let _ = writeln!(out, "  active group: {}", self.active_group_id);
        let _ = writeln!(out, "  current context: {:?}", self.current_context_type);
        let _ = writeln!(out, "  stream setup time: {} ms", self.stream_setup_ms);
        let _ = writeln!(out, "  audio sender state: {:?}", self.audio_sender_state);
        let _ = writeln!(out, "  audio receiver state: {:?}", self.audio_receiver_state);
        let _ = writeln!(
            out,
            "  speaker codec config (bluetooth): {:?}",
            self.current_source_codec_config
        );
        let _ = writeln!(
            out,
            "  microphone codec config (bluetooth): {:?}",
            self.current_sink_codec_config
        );
        let _ = writeln!(out, "  groups:");
        self.groups.dump(&mut out);
        let _ = writeln!(out, "  not grouped devices:");
        self.devices.dump(GROUP_ID_UNKNOWN, &mut out);
        out
    }

    // ---- Group membership ----

    fn handle_group_event(&mut self, event: GroupEvent) {
        match event {
            GroupEvent::GroupAdded { addr, group_id }
            | GroupEvent::MemberAdded { addr, group_id } => {
                info!("{} joined set {}", addr, group_id);
                let Some(device) = self.devices.find_by_address(addr) else { return };
                if device.borrow().group_id != GROUP_ID_UNKNOWN {
                    info!("group already set: {}", device.borrow().group_id);
                    return;
                }
                self.group_add_node_internal(group_id, addr);
            }
            GroupEvent::MemberRemoved { addr, group_id } => {
                info!("{} left set {}", addr, group_id);
                let Some(device) = self.devices.find_by_address(addr) else { return };
                if device.borrow().group_id == GROUP_ID_UNKNOWN {
                    return;
                }
                if self.groups.find_by_id(group_id).is_none() {
                    return;
                }
                self.group_remove_node_internal(group_id, addr, false);
            }
        }
    }

    fn group_add_node_internal(&mut self, group_id: GroupId, addr: Address) {
        let device = match self.devices.find_by_address(addr) {
            Some(device) => device,
            None => {
                if group_id == GROUP_ID_UNKNOWN {
                    return;
                }
                info!("adding set member {}", addr);
                self.devices.add(addr, true)
            }
        };

        let old_group_id = device.borrow().group_id;
        if old_group_id == group_id {
            return;
        }
        if old_group_id != GROUP_ID_UNKNOWN {
            self.group_remove_node_internal(old_group_id, addr, false);
        }

        if self.groups.find_by_id(group_id).is_none() {
            self.groups.add(group_id);
        }
        let group = self.groups.find_by_id_mut(group_id).unwrap();
        if !group.add_node(device.clone()) {
            return;
        }

        self.callbacks.on_group_node_status(addr, group_id, GroupNodeStatus::Added);

        if device.borrow().is_connected() {
            self.ase_initial_state_read_request(&device);
        }

        self.update_context_and_locations(group_id);
    }

    fn group_remove_node_internal(&mut self, group_id: GroupId, addr: Address, update_module: bool) {
        let Some(device) = self.devices.find_by_address(addr) else { return };
        let Some(group) = self.groups.find_by_id_mut(group_id) else { return };
        group.remove_node(&device);

        if update_module && self.device_groups.get_group_id(addr) == group_id {
            self.device_groups.remove_device(addr, group_id);
        }

        self.callbacks.on_group_node_status(addr, group_id, GroupNodeStatus::Removed);

        let group = self.groups.find_by_id(group_id).unwrap();
        if group.is_empty() {
            self.remove_group_if_possible(group_id);
            return;
        }
        self.update_context_and_locations(group_id);
    }

    fn remove_group_if_possible(&mut self, group_id: GroupId) {
        if let Some(group) = self.groups.find_by_id(group_id) {
            if group.is_empty() && !group.cig_created {
                self.groups.remove(group_id);
            }
        }
    }

    fn update_context_and_locations(&mut self, group_id: GroupId) {
        let Some(group) = self.groups.find_by_id_mut(group_id) else { return };
        let contexts_changed = group.update_active_contexts_map().is_some();
        let locations_changed = group.reload_audio_locations();
        if contexts_changed || locations_changed {
            self.emit_audio_conf(group_id);
        }
    }

    fn emit_audio_conf(&self, group_id: GroupId) {
        let Some(group) = self.groups.find_by_id(group_id) else { return };
        self.callbacks.on_audio_conf(
            group.audio_directions,
            group_id,
            group.snk_audio_locations.bits(),
            group.src_audio_locations.bits(),
            group.active_contexts(),
        );
    }

    // ---- Attribute plane ----

    fn handle_gatt_event(&mut self, event: GattEvent) {
        match event {
            GattEvent::Open { status, conn_id, addr, mtu } => {
                self.on_gatt_open(status, conn_id, addr, mtu)
            }
            GattEvent::Close { conn_id, addr, reason } => {
                self.on_gatt_close(conn_id, addr, reason)
            }
            GattEvent::MtuConfigured { conn_id, mtu } => self.on_mtu_configured(conn_id, mtu),
            GattEvent::EncryptionComplete { addr, success } => {
                self.on_encryption_complete(addr, success)
            }
            GattEvent::SearchComplete { conn_id, success } => {
                self.on_service_search_complete(conn_id, success)
            }
            GattEvent::Notification { conn_id, handle, value } => {
                self.char_value_handler(conn_id, handle, &value)
            }
            GattEvent::ReadResponse { conn_id, handle, success, value } => {
                let tag = self.gatt.on_read_complete(conn_id);
                if success {
                    self.char_value_handler(conn_id, handle, &value);
                }
                if tag == READ_TAG_NOTIFY_CONNECTED {
                    if let Some(device) = self.devices.find_by_conn_id(conn_id) {
                        device.borrow_mut().notify_connected_after_read = false;
                        self.connection_ready(&device);
                    }
                }
            }
            GattEvent::WriteResponse { conn_id, handle, success } => {
                self.gatt.on_write_complete(conn_id);
                if !success {
                    warn!("write failed on handle {:#06x}", handle);
                }
            }
            GattEvent::DescriptorWriteResponse { conn_id, handle, success } => {
                self.gatt.on_write_complete(conn_id);
                self.on_ccc_write_result(conn_id, handle, success);
            }
            GattEvent::ServiceChanged { addr } => self.on_service_changed(addr),
            GattEvent::ServiceDiscoveryDone { addr } => {
                if let Some(device) = self.devices.find_by_address(addr) {
                    let device = device.borrow();
                    if !device.known_service_handles && device.is_connected() {
                        self.gatt.raw().service_search(device.conn_id, uuid::PACS_SERVICE);
                    }
                }
            }
        }
    }

    fn on_gatt_open(&mut self, status: u8, conn_id: u16, addr: Address, mtu: u16) {
        let Some(device) = self.devices.find_by_address(addr) else { return };

        if status != GATT_STATUS_SUCCESS {
            if !device.borrow().connecting_actively {
                // Background connect attempt failed; nothing to report.
                return;
            }
            error!("failed to connect {}: status {:#04x}", addr, status);
            self.callbacks.on_connection_state(ConnectionState::Disconnected, addr);
            return;
        }

        {
            let mut device = device.borrow_mut();
            device.connecting_actively = false;
            device.conn_id = conn_id;
            device.mtu = mtu;
            device.acl_conn_handle = self.gatt.raw().acl_conn_handle(addr);
        }

        self.gatt.raw().request_peer_sca(addr);

        if device.borrow().known_service_handles {
            self.register_known_notifications(&device);
        }

        if mtu == DEFAULT_MTU {
            info!("{}: configuring MTU", addr);
            self.gatt.configure_mtu(conn_id, REQUESTED_MTU);
            return;
        }
        self.start_encryption(&device);
    }

    fn on_mtu_configured(&mut self, conn_id: u16, mtu: u16) {
        self.gatt.on_write_complete(conn_id);
        let Some(device) = self.devices.find_by_conn_id(conn_id) else { return };
        device.borrow_mut().mtu = mtu;
        self.start_encryption(&device);
    }

    fn start_encryption(&mut self, device: &DeviceRef) {
        let addr = device.borrow().address;
        if self.gatt.raw().is_encrypted(addr) {
            self.on_encryption_complete(addr, true);
        } else {
            self.gatt.raw().set_encryption(addr);
        }
    }

    fn on_encryption_complete(&mut self, addr: Address, success: bool) {
        let Some(device) = self.devices.find_by_address(addr) else {
            warn!("skipping unknown device {}", addr);
            return;
        };

        if !success {
            error!("encryption failed for {}", addr);
            let (conn_id, connecting) = {
                let device = device.borrow();
                (device.conn_id, device.connecting_actively)
            };
            self.gatt.raw().close(conn_id);
            if connecting {
                self.callbacks.on_connection_state(ConnectionState::Disconnected, addr);
            }
            return;
        }

        {
            let mut device = device.borrow_mut();
            if device.encrypted {
                info!("{} already encrypted", addr);
                return;
            }
            device.encrypted = true;
        }

        let (known, reading, conn_id) = {
            let device = device.borrow();
            (device.known_service_handles, device.notify_connected_after_read, device.conn_id)
        };
        if known && !reading {
            self.connection_ready(&device);
            return;
        }
        self.gatt.raw().service_search(conn_id, uuid::PACS_SERVICE);
    }

    fn on_service_search_complete(&mut self, conn_id: u16, success: bool) {
        let Some(device) = self.devices.find_by_conn_id(conn_id) else {
            debug!("skipping unknown connection {}", conn_id);
            return;
        };

        if !success {
            error!("service discovery failed on {}", device.borrow().address);
            self.disconnect_device(&device, false);
            return;
        }

        let services = self.gatt.raw().get_services(conn_id);
        if let Err(e) = self.discover_audio_services(&device, &services) {
            error!("{}: {}", device.borrow().address, e);
            self.disconnect_device(&device, false);
            return;
        }

        {
            let mut device = device.borrow_mut();
            device.known_service_handles = true;
            device.notify_connected_after_read = true;
        }

        let (addr, group_id) = {
            let device = device.borrow();
            (device.address, device.group_id)
        };

        if group_id != GROUP_ID_UNKNOWN {
            self.ase_initial_state_read_request(&device);
            return;
        }

        let known_id = self.device_groups.get_group_id(addr);
        if known_id != GROUP_ID_UNKNOWN {
            self.group_add_node_internal(known_id, addr);
            return;
        }

        if device.borrow().csis_member {
            info!("waiting for the coordinated set module to group {}", addr);
            return;
        }

        self.device_groups.add_device(addr, None);
    }

    /// Locate PACS, ASCS, CAS and CSIS, record every relevant characteristic
    /// and subscribe plus read its initial value.
    fn discover_audio_services(
        &mut self,
        device: &DeviceRef,
        services: &[GattService],
    ) -> Result<(), LeAudioError> {
        let (conn_id, addr) = {
            let device = device.borrow();
            (device.conn_id, device.address)
        };

        let pac_svc = services.iter().find(|s| s.uuid == uuid::PACS_SERVICE);
        let ase_svc = services.iter().find(|s| s.uuid == uuid::ASCS_SERVICE);

        let csis_primary_handles: Vec<u16> = services
            .iter()
            .filter(|s| s.uuid == uuid::CSIS_SERVICE && s.is_primary)
            .map(|s| s.handle)
            .collect();
        let cas_csis_included = services
            .iter()
            .filter(|s| s.uuid == uuid::CAS_SERVICE)
            .flat_map(|s| s.included_services.iter())
            .find(|included| included.uuid == uuid::CSIS_SERVICE)
            .map(|included| included.start_handle);

        let (Some(pac_svc), Some(ase_svc)) = (pac_svc, ase_svc) else {
            return Err(LeAudioError::PeerProtocol("mandatory audio services missing"));
        };

        device.borrow_mut().clear_service_data();
        device.borrow_mut().csis_member = cas_csis_included
            .is_some_and(|handle| csis_primary_handles.contains(&handle));

        for charac in &pac_svc.characteristics {
            let pair = HandlePair { val: charac.value_handle, ccc: charac.ccc_handle };
            match charac.uuid {
                uuid::SINK_PAC | uuid::SOURCE_PAC => {
                    let ccc = pair
                        .ccc
                        .ok_or(LeAudioError::PeerProtocol("PAC without CCC"))?;
                    self.subscribe(conn_id, addr, pair.val, ccc);
                    self.gatt.read_characteristic(conn_id, pair.val, READ_TAG_NONE);
                    let mut device = device.borrow_mut();
                    if charac.uuid == uuid::SINK_PAC {
                        device.snk_pacs.push((pair, vec![]));
                    } else {
                        device.src_pacs.push((pair, vec![]));
                    }
                    info!("found PAC characteristic, handle {:#06x}", pair.val);
                }
                uuid::SINK_AUDIO_LOCATIONS | uuid::SOURCE_AUDIO_LOCATIONS => {
                    // CCC is optional here; missing means no subscription.
                    if let Some(ccc) = pair.ccc {
                        self.subscribe(conn_id, addr, pair.val, ccc);
                    }
                    self.gatt.read_characteristic(conn_id, pair.val, READ_TAG_NONE);
                    let mut device = device.borrow_mut();
                    if charac.uuid == uuid::SINK_AUDIO_LOCATIONS {
                        device.snk_audio_locations_handles = Some(pair);
                    } else {
                        device.src_audio_locations_handles = Some(pair);
                    }
                }
                uuid::AVAILABLE_AUDIO_CONTEXTS => {
                    let ccc = pair
                        .ccc
                        .ok_or(LeAudioError::PeerProtocol("available contexts without CCC"))?;
                    self.subscribe(conn_id, addr, pair.val, ccc);
                    self.gatt.read_characteristic(conn_id, pair.val, READ_TAG_NONE);
                    device.borrow_mut().available_contexts_handles = Some(pair);
                }
                uuid::SUPPORTED_AUDIO_CONTEXTS => {
                    if let Some(ccc) = pair.ccc {
                        self.subscribe(conn_id, addr, pair.val, ccc);
                    }
                    self.gatt.read_characteristic(conn_id, pair.val, READ_TAG_NONE);
                    device.borrow_mut().supported_contexts_handles = Some(pair);
                }
                _ => (),
            }
        }

        for charac in &ase_svc.characteristics {
            match charac.uuid {
                uuid::SINK_ASE | uuid::SOURCE_ASE => {
                    let ccc = charac
                        .ccc_handle
                        .ok_or(LeAudioError::PeerProtocol("ASE without CCC"))?;
                    self.subscribe(conn_id, addr, charac.value_handle, ccc);
                    let direction = if charac.uuid == uuid::SINK_ASE {
                        Direction::Sink
                    } else {
                        Direction::Source
                    };
                    device.borrow_mut().add_ase(charac.value_handle, ccc, direction);
                    info!(
                        "found ASE characteristic, handle {:#06x}, {:?}",
                        charac.value_handle, direction
                    );
                }
                uuid::ASE_CONTROL_POINT => {
                    let ccc = charac
                        .ccc_handle
                        .ok_or(LeAudioError::PeerProtocol("ASE control point without CCC"))?;
                    self.subscribe(conn_id, addr, charac.value_handle, ccc);
                    device.borrow_mut().ctp_handles =
                        Some(HandlePair { val: charac.value_handle, ccc: Some(ccc) });
                }
                _ => (),
            }
        }

        Ok(())
    }

    fn subscribe(&self, conn_id: u16, addr: Address, val_handle: u16, ccc_handle: u16) {
        self.gatt.raw().register_notification(addr, val_handle);
        self.gatt.write_descriptor(conn_id, ccc_handle, CCC_NOTIFY.to_le_bytes().to_vec());
    }

    /// Read every ASE state; the last read carries the sentinel that fires
    /// the connection-ready hook once it completes.
    fn ase_initial_state_read_request(&mut self, device: &DeviceRef) {
        let reads: Vec<(u16, u16, u32)> = {
            let device = device.borrow();
            let count = device.ases.len();
            device
                .ases
                .iter()
                .enumerate()
                .map(|(i, ase)| {
                    let tag = if device.notify_connected_after_read && i == count - 1 {
                        READ_TAG_NOTIFY_CONNECTED
                    } else {
                        READ_TAG_NONE
                    };
                    (device.conn_id, ase.val_handle, tag)
                })
                .collect()
        };
        for (conn_id, handle, tag) in reads {
            self.gatt.read_characteristic(conn_id, handle, tag);
        }
    }

    fn on_ccc_write_result(&mut self, conn_id: u16, ccc_handle: u16, success: bool) {
        if success {
            debug!("registered on ccc {:#06x}", ccc_handle);
            return;
        }
        error!("failed to register for notifications on ccc {:#06x}", ccc_handle);
        let Some(device) = self.devices.find_by_conn_id(conn_id) else { return };
        let (addr, val_handle) = {
            let device = device.borrow();
            let Some(ase) = device.ases.iter().find(|ase| ase.ccc_handle == ccc_handle) else {
                return;
            };
            (device.address, ase.val_handle)
        };
        self.gatt.raw().deregister_notification(addr, val_handle);
    }

    /// Generic read/notify dispatcher; values land at the entity owning the
    /// handle.
    fn char_value_handler(&mut self, conn_id: u16, handle: u16, value: &[u8]) {
        let Some(device) = self.devices.find_by_conn_id(conn_id) else {
            error!("no device for connection {}", conn_id);
            return;
        };

        let is_ase = device.borrow().ases.iter().any(|ase| ase.val_handle == handle);
        if is_ase {
            let group_id = device.borrow().group_id;
            match self.groups.find_by_id_mut(group_id) {
                Some(group) => {
                    self.state_machine.process_gatt_notif(group, &device, handle, value)
                }
                None => {
                    // Not grouped yet; record the reported state only.
                    if let Some(ntf) = ascs::parse_ase_notification(value) {
                        let mut device = device.borrow_mut();
                        if let Some(ase) = device.ase_by_val_handle(handle) {
                            ase.id = ntf.ase_id;
                            ase.state = ntf.state;
                        }
                    }
                }
            }
            return;
        }

        let group_id = device.borrow().group_id;

        let pac_direction = {
            let device = device.borrow();
            if device.snk_pacs.iter().any(|(pair, _)| pair.val == handle) {
                Some(Direction::Sink)
            } else if device.src_pacs.iter().any(|(pair, _)| pair.val == handle) {
                Some(Direction::Source)
            } else {
                None
            }
        };
        if let Some(direction) = pac_direction {
            let Some(records) = pacs::parse_pac(value) else {
                // Guard consistency of the PAC structure.
                return;
            };
            info!("registering {:?} PACs for {}", direction, device.borrow().address);
            device.borrow_mut().register_pacs(direction, handle, records);
            if let Some(group) = self.groups.find_by_id_mut(group_id) {
                let _ = group.update_active_contexts_map();
            }
            return;
        }

        let locations_handle = |pair: Option<HandlePair>| pair.map(|p| p.val) == Some(handle);

        if locations_handle(device.borrow().snk_audio_locations_handles) {
            let Some(locations) = pacs::parse_audio_locations(value) else { return };
            {
                let device = device.borrow();
                if device.audio_directions.contains(crate::types::Directions::SINK)
                    && device.snk_audio_locations == locations
                {
                    return;
                }
            }
            {
                let mut device = device.borrow_mut();
                device.audio_directions |= crate::types::Directions::SINK;
                device.snk_audio_locations = locations;
            }
            self.callbacks
                .on_sink_audio_location_available(device.borrow().address, locations.bits());
            if let Some(group) = self.groups.find_by_id_mut(group_id) {
                if group.reload_audio_locations() {
                    self.emit_audio_conf(group_id);
                }
            }
            return;
        }

        if locations_handle(device.borrow().src_audio_locations_handles) {
            let Some(locations) = pacs::parse_audio_locations(value) else { return };
            {
                let device = device.borrow();
                if device.audio_directions.contains(crate::types::Directions::SOURCE)
                    && device.src_audio_locations == locations
                {
                    return;
                }
            }
            {
                let mut device = device.borrow_mut();
                device.audio_directions |= crate::types::Directions::SOURCE;
                device.src_audio_locations = locations;
            }
            if let Some(group) = self.groups.find_by_id_mut(group_id) {
                if group.reload_audio_locations() {
                    self.emit_audio_conf(group_id);
                }
            }
            return;
        }

        if locations_handle(device.borrow().available_contexts_handles) {
            let Some((snk, src)) = pacs::parse_contexts(value) else { return };
            let changed = device.borrow_mut().set_available_contexts(snk, src);
            if changed.is_empty() {
                return;
            }
            let Some(group) = self.groups.find_by_id_mut(group_id) else { return };
            if group.is_in_transition() || group.state() == AseState::Streaming {
                // Defer until the group settles; only the latest matters.
                group.set_pending_update_available_contexts(Some(changed));
                return;
            }
            if group.update_active_contexts_map().is_some() {
                self.emit_audio_conf(group_id);
            }
            return;
        }

        if locations_handle(device.borrow().supported_contexts_handles) {
            if let Some((snk, src)) = pacs::parse_contexts(value) {
                device.borrow_mut().set_supported_contexts(snk, src);
            }
            return;
        }

        if locations_handle(device.borrow().ctp_handles) {
            if let Some(ntf) = ascs::parse_ctp_notification(value) {
                self.control_point_notification_handler(&ntf);
            }
            return;
        }

        error!("unknown attribute read: {:#06x}", handle);
    }

    fn control_point_notification_handler(&mut self, ntf: &ascs::CtpNotification) {
        for entry in &ntf.entries {
            if entry.response_code == ascs::RESPONSE_CODE_INVALID_CONFIGURATION_PARAMETER_VALUE
                && entry.reason == ascs::REASON_INVALID_ASE_CIS_MAPPING
            {
                self.cancel_streaming_request();
            }
        }
    }

    fn register_known_notifications(&self, device: &DeviceRef) {
        let device = device.borrow();
        let addr = device.address;
        for (pair, _) in device.snk_pacs.iter().chain(device.src_pacs.iter()) {
            self.gatt.raw().register_notification(addr, pair.val);
        }
        for pair in [
            device.snk_audio_locations_handles,
            device.src_audio_locations_handles,
            device.available_contexts_handles,
            device.supported_contexts_handles,
            device.ctp_handles,
        ]
        .into_iter()
        .flatten()
        {
            self.gatt.raw().register_notification(addr, pair.val);
        }
        for ase in &device.ases {
            self.gatt.raw().register_notification(addr, ase.val_handle);
        }
    }

    fn deregister_notifications(&self, device: &DeviceRef) {
        let device = device.borrow();
        let addr = device.address;
        for (pair, _) in device.snk_pacs.iter().chain(device.src_pacs.iter()) {
            self.gatt.raw().deregister_notification(addr, pair.val);
        }
        for pair in [
            device.snk_audio_locations_handles,
            device.src_audio_locations_handles,
            device.available_contexts_handles,
            device.supported_contexts_handles,
            device.ctp_handles,
        ]
        .into_iter()
        .flatten()
        {
            self.gatt.raw().deregister_notification(addr, pair.val);
        }
        for ase in &device.ases {
            self.gatt.raw().deregister_notification(addr, ase.val_handle);
        }
    }

    fn on_service_changed(&mut self, addr: Address) {
        let Some(device) = self.devices.find_by_address(addr) else {
            debug!("skipping unknown device {}", addr);
            return;
        };
        info!("service change on {}", addr);
        let conn_id = device.borrow().conn_id;
        self.gatt.clean(conn_id);
        self.deregister_notifications(&device);
        let mut device = device.borrow_mut();
        device.known_service_handles = false;
        device.csis_member = false;
    }

    fn on_gatt_close(&mut self, _conn_id: u16, addr: Address, reason: DisconnectReason) {
        let Some(device) = self.devices.find_by_address(addr) else {
            error!("skipping unknown device {}", addr);
            return;
        };

        let group_id = device.borrow().group_id;
        if let Some(group) = self.groups.find_by_id_mut(group_id) {
            self.state_machine.process_acl_disconnected(group, &device);
        }

        let conn_id = device.borrow().conn_id;
        self.gatt.clean(conn_id);
        self.deregister_notifications(&device);

        self.callbacks.on_connection_state(ConnectionState::Disconnected, addr);
        {
            let mut device = device.borrow_mut();
            device.conn_id = CONN_ID_INVALID;
            device.acl_conn_handle = 0;
            device.encrypted = false;
        }

        if device.borrow().removing_device {
            if group_id != GROUP_ID_UNKNOWN {
                self.group_remove_node_internal(group_id, addr, true);
            }
            self.devices.remove(addr);
            return;
        }

        // Reconnect in background unless this host asked for the drop.
        if reason != DisconnectReason::TerminatedLocalHost {
            self.gatt.raw().open(addr, false);
        }
    }

    fn disconnect_device(&mut self, device: &DeviceRef, acl_force_disconnect: bool) {
        let (conn_id, addr) = {
            let device = device.borrow();
            (device.conn_id, device.address)
        };
        if conn_id == CONN_ID_INVALID {
            return;
        }
        if acl_force_disconnect {
            self.gatt.raw().disconnect_acl(addr);
            return;
        }
        self.gatt.clean(conn_id);
        self.gatt.raw().close(conn_id);
        device.borrow_mut().conn_id = CONN_ID_INVALID;
    }

    fn background_connect_if_group_connected(&self, device: &DeviceRef) {
        let (addr, group_id) = {
            let device = device.borrow();
            (device.address, device.group_id)
        };
        let Some(group) = self.groups.find_by_id(group_id) else { return };
        if !group.is_any_device_connected() {
            return;
        }
        debug!("background connect of {} to connected group {}", addr, group_id);
        self.gatt.raw().open(addr, false);
    }

    fn connection_ready(&mut self, device: &DeviceRef) {
        let (addr, group_id, first_connection) = {
            let device = device.borrow();
            (device.address, device.group_id, device.first_connection)
        };

        self.callbacks.on_connection_state(ConnectionState::Connected, addr);

        if group_id != GROUP_ID_UNKNOWN {
            self.update_context_and_locations(group_id);
            self.attach_to_streaming_group_if_needed(device);
        }

        if first_connection {
            self.storage.set_leaudio_autoconnect(addr, true);
            device.borrow_mut().first_connection = false;
        }
    }

    /// A member reconnected while its group is bound to the framework:
    /// either slot it into the running CIG or force a reconfiguration. The
    /// criterion is strictly whether the configuration expects fewer devices
    /// than are now connected.
    fn attach_to_streaming_group_if_needed(&mut self, device: &DeviceRef) {
        let group_id = device.borrow().group_id;
        if group_id != self.active_group_id {
            info!("group {} is not streaming, nothing to do", group_id);
            return;
        }
        if self.audio_sender_state == AudioState::Idle
            && self.audio_receiver_state == AudioState::Idle
        {
            debug!("device active but not streaming, nothing to do");
            return;
        }

        let Some(group) = self.groups.find_by_id_mut(group_id) else { return };
        let Some(conf) = group.stream_conf.conf.clone() else { return };

        if (conf.num_of_devices() as usize) < group.num_of_connected() {
            // A second device paired mid-stream; the layout must grow.
            group.set_pending_configuration(true);
            self.state_machine.stop_stream(group);
            return;
        }

        info!("attaching {} to group {}", device.borrow().address, group_id);

        for ent in &conf.confs {
            let (mut active_count, mut claimed) = match ent.direction {
                Direction::Sink => (
                    group.stream_conf.sink_streams.len() as u8,
                    group.stream_conf.sink_audio_channel_allocation,
                ),
                Direction::Source => (
                    group.stream_conf.source_streams.len() as u8,
                    group.stream_conf.source_audio_channel_allocation,
                ),
            };
            if !device.borrow_mut().configure_ases(ent, &mut active_count, &mut claimed, true) {
                info!("could not set configuration of {}", conf.name);
                return;
            }
        }

        self.state_machine.attach_to_stream(group, device);
    }

    // ---- ISO plane ----

    fn handle_iso_event(&mut self, event: IsoEvent) {
        match event {
            IsoEvent::CigCreated { cig_id, status, conn_handles } => {
                let group_id = cig_id as GroupId;
                let Some(group) = self.groups.find_by_id_mut(group_id) else { return };
                self.state_machine.process_cig_created(group, status, conn_handles);
            }
            IsoEvent::CigRemoved { cig_id, status } => {
                let group_id = cig_id as GroupId;
                if let Some(group) = self.groups.find_by_id_mut(group_id) {
                    self.state_machine.process_cig_removed(group, status);
                }
                self.remove_group_if_possible(group_id);
            }
            IsoEvent::CisEstablished {
                cis_conn_handle,
                status,
                transport_latency_c_to_p,
                transport_latency_p_to_c,
                max_pdu_c_to_p,
                max_pdu_p_to_c,
            } => {
                let Some(device) = self.devices.find_by_cis_conn_hdl(cis_conn_handle) else {
                    error!("no device with CIS {:#06x}", cis_conn_handle);
                    return;
                };
                let group_id = device.borrow().group_id;
                let Some(group) = self.groups.find_by_id_mut(group_id) else { return };
                self.state_machine.process_cis_established(
                    group,
                    &device,
                    cis_conn_handle,
                    status,
                    transport_latency_c_to_p,
                    transport_latency_p_to_c,
                    max_pdu_c_to_p,
                    max_pdu_p_to_c,
                );
            }
            IsoEvent::CisDisconnected { cis_conn_handle, reason } => {
                let Some(device) = self.devices.find_by_cis_conn_hdl(cis_conn_handle) else {
                    error!("no device with CIS {:#06x}", cis_conn_handle);
                    return;
                };
                let group_id = device.borrow().group_id;
                let Some(group) = self.groups.find_by_id_mut(group_id) else { return };
                self.state_machine.process_cis_disconnected(group, &device, cis_conn_handle, reason);
            }
            IsoEvent::DataPathSetup { cis_conn_handle, status } => {
                let Some(device) = self.devices.find_by_cis_conn_hdl(cis_conn_handle) else {
                    return;
                };
                let group_id = device.borrow().group_id;
                let Some(group) = self.groups.find_by_id_mut(group_id) else { return };
                self.state_machine.process_setup_iso_data_path(
                    group,
                    &device,
                    status,
                    cis_conn_handle,
                );
            }
            IsoEvent::DataPathRemoved { cis_conn_handle, status } => {
                let Some(device) = self.devices.find_by_cis_conn_hdl(cis_conn_handle) else {
                    return;
                };
                let group_id = device.borrow().group_id;
                let Some(group) = self.groups.find_by_id_mut(group_id) else { return };
                self.state_machine.process_remove_iso_data_path(
                    group,
                    &device,
                    status,
                    cis_conn_handle,
                );
            }
            IsoEvent::DataAvailable { cis_conn_handle, timestamp, data } => {
                self.on_iso_data(cis_conn_handle, timestamp, &data)
            }
            IsoEvent::LinkQuality {
                cis_conn_handle,
                tx_unacked_packets,
                retransmitted_packets,
                crc_error_packets,
                rx_unreceived_packets,
                ..
            } => {
                debug!(
                    "link quality on {:#06x}: unacked {} retx {} crc {} unreceived {}",
                    cis_conn_handle,
                    tx_unacked_packets,
                    retransmitted_packets,
                    crc_error_packets,
                    rx_unreceived_packets
                );
            }
        }
    }

    fn on_iso_data(&mut self, cis_conn_handle: u16, timestamp: u32, data: &[u8]) {
        if self.active_group_id == GROUP_ID_UNKNOWN
            || self.audio_receiver_state != AudioState::Started
        {
            debug!("receiver not ready for ISO data");
            return;
        }
        let Some(group) = self.groups.find_by_id(self.active_group_id) else {
            error!("no streaming group available");
            return;
        };
        if let Some(pcm) = self.codec.decode_uplink(
            data,
            cis_conn_handle,
            timestamp,
            &group.stream_conf,
            &self.audio_framework_sink_config,
        ) {
            let written = self.audio_sink.send(&pcm);
            if written != pcm.len() {
                error!("not all decoded data consumed: {} of {}", written, pcm.len());
            }
        }
    }

    // ---- Audio-session coordinator ----

    fn handle_source_session_event(&mut self, event: AudioSessionEvent) {
        match event {
            AudioSessionEvent::Resume => self.on_audio_sink_resume(),
            AudioSessionEvent::Suspend { ack } => {
                self.on_audio_sink_suspend();
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            AudioSessionEvent::DataReady { data } => self.on_audio_data_ready(&data),
            AudioSessionEvent::MetadataUpdate { tracks, ack } => {
                self.on_audio_metadata_update(&tracks);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
        }
    }

    fn handle_sink_session_event(&mut self, event: AudioSessionEvent) {
        match event {
            AudioSessionEvent::Resume => self.on_audio_source_resume(),
            AudioSessionEvent::Suspend { ack } => {
                self.on_audio_source_suspend();
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            AudioSessionEvent::DataReady { .. } => {
                warn!("PCM delivery on the uplink session")
            }
            AudioSessionEvent::MetadataUpdate { ack, .. } => {
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
        }
    }

    fn on_audio_data_ready(&mut self, data: &[u8]) {
        if self.active_group_id == GROUP_ID_UNKNOWN
            || self.audio_sender_state != AudioState::Started
        {
            return;
        }
        let Some(group) = self.groups.find_by_id(self.active_group_id) else {
            error!("no streaming group available");
            return;
        };
        let stream_conf = &group.stream_conf;
        if stream_conf.sink_num_of_devices > 2
            || stream_conf.sink_num_of_devices == 0
            || stream_conf.sink_streams.is_empty()
        {
            error!("stream configuration is not valid");
            return;
        }

        let sdus =
            self.codec.encode_downlink(data, stream_conf, &self.audio_framework_source_config);
        for (cis_conn_handle, sdu) in sdus {
            self.iso.send_iso_data(cis_conn_handle, &sdu);
        }
    }

    fn on_audio_resume(&mut self) -> bool {
        let Some(group) = self.groups.find_by_id(self.active_group_id) else { return false };
        if group.target_state() == AseState::Streaming {
            return true;
        }
        self.internal_group_stream(
            self.active_group_id,
            self.current_context_type.as_bitmask().bits(),
        )
        .is_ok()
    }

    fn on_audio_suspend(&mut self) {
        if self.active_group_id == GROUP_ID_UNKNOWN {
            warn!("there is no longer an active group");
            return;
        }
        self.suspend_timeout.schedule(
            Duration::from_millis(Self::suspend_timeout_ms()),
            Message::SuspendTimeout(self.active_group_id),
        );
    }

    fn on_audio_sink_suspend(&mut self) {
        debug!(
            "sink suspend in: sender {:?} receiver {:?}",
            self.audio_sender_state, self.audio_receiver_state
        );
        match self.audio_sender_state {
            AudioState::ReadyToStart | AudioState::Started => {
                self.audio_sender_state = AudioState::ReadyToRelease;
            }
            AudioState::Releasing => return,
            AudioState::Idle => {
                if self.audio_receiver_state == AudioState::ReadyToRelease {
                    self.on_audio_suspend();
                }
                return;
            }
            AudioState::ReadyToRelease => (),
        }

        // The last released direction arms the shared keep-alive.
        if matches!(self.audio_receiver_state, AudioState::Idle | AudioState::ReadyToRelease) {
            self.on_audio_suspend();
        }
    }

    fn on_audio_sink_resume(&mut self) {
        let Some(group) = self.groups.find_by_id(self.active_group_id) else {
            error!("invalid group {}", self.active_group_id);
            return;
        };

        if group
            .codec_configuration_by_direction(self.current_context_type, Direction::Sink)
            .is_none()
        {
            error!("invalid resume request for context {:?}", self.current_context_type);
            self.audio_source.cancel_streaming_request();
            return;
        }

        let group_streaming = group.state() == AseState::Streaming;
        let pending_configuration = group.is_pending_configuration();

        match self.audio_sender_state {
            AudioState::Started => {
                // The previous confirmation may not have reached the framework.
                self.audio_source.confirm_streaming_request();
            }
            AudioState::Idle => match self.audio_receiver_state {
                AudioState::Idle => {
                    if self.on_audio_resume() {
                        self.audio_sender_state = AudioState::ReadyToStart;
                    } else {
                        self.audio_source.cancel_streaming_request();
                    }
                }
                AudioState::ReadyToStart | AudioState::Started => {
                    self.audio_sender_state = AudioState::ReadyToStart;
                    if group_streaming {
                        self.start_sending_audio(self.active_group_id);
                    }
                }
                AudioState::Releasing | AudioState::ReadyToRelease => {
                    if pending_configuration {
                        self.audio_sender_state = self.audio_receiver_state;
                    } else {
                        self.audio_source.cancel_streaming_request();
                    }
                }
            },
            AudioState::ReadyToStart => {
                warn!(
                    "sink resume in wrong state: sender {:?} receiver {:?}",
                    self.audio_sender_state, self.audio_receiver_state
                );
            }
            AudioState::ReadyToRelease => match self.audio_receiver_state {
                AudioState::Started | AudioState::Idle | AudioState::ReadyToRelease => {
                    // Stream is still up; restore it.
                    self.audio_sender_state = AudioState::Started;
                    self.suspend_timeout.cancel();
                    self.audio_source.confirm_streaming_request();
                }
                _ => self.audio_source.cancel_streaming_request(),
            },
            AudioState::Releasing => {
                self.audio_source.cancel_streaming_request();
            }
        }
    }

    fn on_audio_source_suspend(&mut self) {
        debug!(
            "source suspend in: sender {:?} receiver {:?}",
            self.audio_sender_state, self.audio_receiver_state
        );
        match self.audio_receiver_state {
            AudioState::ReadyToStart | AudioState::Started => {
                self.audio_receiver_state = AudioState::ReadyToRelease;
            }
            AudioState::Releasing => return,
            AudioState::Idle => {
                if self.audio_sender_state == AudioState::ReadyToRelease {
                    self.on_audio_suspend();
                }
                return;
            }
            AudioState::ReadyToRelease => (),
        }

        if matches!(self.audio_sender_state, AudioState::Idle | AudioState::ReadyToRelease) {
            self.on_audio_suspend();
        }
    }

    fn on_audio_source_resume(&mut self) {
        let Some(group) = self.groups.find_by_id(self.active_group_id) else {
            error!("invalid group {}", self.active_group_id);
            return;
        };

        if group
            .codec_configuration_by_direction(self.current_context_type, Direction::Source)
            .is_none()
        {
            error!("invalid resume request for context {:?}", self.current_context_type);
            self.audio_sink.cancel_streaming_request();
            return;
        }

        let group_streaming = group.state() == AseState::Streaming;
        let pending_configuration = group.is_pending_configuration();

        match self.audio_receiver_state {
            AudioState::Started => self.audio_sink.confirm_streaming_request(),
            AudioState::Idle => match self.audio_sender_state {
                AudioState::Idle => {
                    if self.on_audio_resume() {
                        self.audio_receiver_state = AudioState::ReadyToStart;
                    } else {
                        self.audio_sink.cancel_streaming_request();
                    }
                }
                AudioState::ReadyToStart | AudioState::Started => {
                    self.audio_receiver_state = AudioState::ReadyToStart;
                    if group_streaming {
                        self.start_receiving_audio(self.active_group_id);
                    }
                }
                AudioState::Releasing | AudioState::ReadyToRelease => {
                    if pending_configuration {
                        self.audio_receiver_state = self.audio_sender_state;
                    } else {
                        self.audio_sink.cancel_streaming_request();
                    }
                }
            },
            AudioState::ReadyToStart => {
                warn!(
                    "source resume in wrong state: sender {:?} receiver {:?}",
                    self.audio_sender_state, self.audio_receiver_state
                );
            }
            AudioState::ReadyToRelease => match self.audio_sender_state {
                AudioState::Started | AudioState::Idle | AudioState::ReadyToRelease => {
                    self.audio_receiver_state = AudioState::Started;
                    self.suspend_timeout.cancel();
                    self.audio_sink.confirm_streaming_request();
                }
                _ => self.audio_sink.cancel_streaming_request(),
            },
            AudioState::Releasing => self.audio_sink.cancel_streaming_request(),
        }
    }

    fn start_sending_audio(&mut self, group_id: GroupId) {
        let Some(group) = self.groups.find_by_id_mut(group_id) else { return };
        if !group.reload_stream_configuration(Direction::Sink) {
            error!("could not get sink configuration for group {}", group_id);
            return;
        }
        let remote_delay_ms = group.remote_delay_ms(Direction::Sink);

        let dt_us = self.current_source_codec_config.data_interval_us;
        let sr_hz = self.current_source_codec_config.sample_rate;
        let af_hz = self.audio_framework_source_config.sample_rate;
        if !self.codec.setup_encoders(dt_us, sr_hz, af_hz) {
            error!("could not set up encoders");
            return;
        }

        self.audio_source.update_remote_delay(remote_delay_ms);
        self.audio_source.confirm_streaming_request();
        self.audio_sender_state = AudioState::Started;
    }

    fn start_receiving_audio(&mut self, group_id: GroupId) {
        let Some(group) = self.groups.find_by_id_mut(group_id) else { return };
        if !group.reload_stream_configuration(Direction::Source) {
            warn!("no source configuration for group {}, microphone not configured", group_id);
            return;
        }
        let remote_delay_ms = group.remote_delay_ms(Direction::Source);

        let dt_us = self.current_sink_codec_config.data_interval_us;
        let sr_hz = self.current_sink_codec_config.sample_rate;
        let af_hz = self.audio_framework_sink_config.sample_rate;
        if !self.codec.setup_decoders(dt_us, sr_hz, af_hz) {
            error!("could not set up decoders");
            return;
        }

        self.audio_sink.update_remote_delay(remote_delay_ms);
        self.audio_sink.confirm_streaming_request();
        self.audio_receiver_state = AudioState::Started;
    }

    fn suspend_audio(&mut self) {
        self.audio_sender_state = AudioState::Idle;
        self.audio_receiver_state = AudioState::Idle;
        self.codec.release_all();
    }

    fn stop_audio(&mut self) {
        self.suspend_audio();
    }

    fn release_audio_sessions(&mut self) {
        if self.audio_source_acquired {
            self.audio_source.stop();
            self.audio_source.release();
            self.audio_source_acquired = false;
        }
        if self.audio_sink_acquired {
            self.audio_sink.stop();
            self.audio_sink.release();
            self.audio_sink_acquired = false;
        }
    }

    fn cancel_streaming_request(&mut self) {
        if self.audio_sender_state >= AudioState::ReadyToStart {
            self.audio_source.cancel_streaming_request();
            self.audio_sender_state = AudioState::Idle;
        }
        if self.audio_receiver_state >= AudioState::ReadyToStart {
            self.audio_sink.cancel_streaming_request();
            self.audio_receiver_state = AudioState::Idle;
        }
    }

    fn suspended_for_reconfiguration(&mut self) {
        if self.audio_sender_state > AudioState::Idle {
            self.audio_source.suspended_for_reconfiguration();
        }
        if self.audio_receiver_state > AudioState::Idle {
            self.audio_sink.suspended_for_reconfiguration();
        }
    }

    // ---- Context classification ----

    fn audio_content_to_le_audio_context(
        current_context_type: LeAudioContextType,
        content_type: AudioContentType,
        usage: AudioUsage,
    ) -> LeAudioContextType {
        // Stay conversational once conversational, for call-adjacent audio.
        if current_context_type == LeAudioContextType::Conversational {
            match content_type {
                AudioContentType::Speech | AudioContentType::Sonification => {
                    return LeAudioContextType::Conversational;
                }
                _ => (),
            }
            match usage {
                AudioUsage::NotificationTelephonyRingtone
                | AudioUsage::Notification
                | AudioUsage::Alarm
                | AudioUsage::Emergency
                | AudioUsage::VoiceCommunication => {
                    return LeAudioContextType::Conversational;
                }
                _ => (),
            }
        }

        match content_type {
            AudioContentType::Speech => return LeAudioContextType::Conversational,
            AudioContentType::Music | AudioContentType::Movie | AudioContentType::Sonification => {
                return LeAudioContextType::Media;
            }
            _ => (),
        }

        match usage {
            AudioUsage::VoiceCommunication => LeAudioContextType::Conversational,
            AudioUsage::Game => LeAudioContextType::Game,
            AudioUsage::Notification => LeAudioContextType::Notifications,
            AudioUsage::NotificationTelephonyRingtone => LeAudioContextType::Ringtone,
            AudioUsage::Alarm => LeAudioContextType::Alerts,
            AudioUsage::Emergency => LeAudioContextType::EmergencyAlarm,
            _ => LeAudioContextType::Media,
        }
    }

    fn choose_context_type(candidates: &[LeAudioContextType]) -> LeAudioContextType {
        // Mini policy: voice first, then media.
        if candidates.contains(&LeAudioContextType::Conversational) {
            return LeAudioContextType::Conversational;
        }
        if candidates.contains(&LeAudioContextType::Media) {
            return LeAudioContextType::Media;
        }
        candidates[0]
    }

    fn on_audio_metadata_update(&mut self, tracks: &[TrackMetadata]) {
        let contexts: Vec<LeAudioContextType> = tracks
            .iter()
            .filter(|track| {
                track.content_type != AudioContentType::Unknown
                    || track.usage != AudioUsage::Unknown
            })
            .map(|track| {
                Self::audio_content_to_le_audio_context(
                    self.current_context_type,
                    track.content_type,
                    track.usage,
                )
            })
            .collect();

        if contexts.is_empty() {
            debug!("invalid metadata update");
            return;
        }

        let new_context = Self::choose_context_type(&contexts);
        debug!("new context type {:?}", new_context);

        if self.active_group_id == GROUP_ID_UNKNOWN {
            warn!("cannot switch context without an active group");
            return;
        }
        if new_context == self.current_context_type {
            return;
        }
        if self.groups.find_by_id(self.active_group_id).is_none() {
            error!("invalid group {}", self.active_group_id);
            return;
        }

        self.current_context_type = new_context;
        if self.stop_stream_if_needed(self.active_group_id, new_context) {
            return;
        }

        let target_streaming = self
            .groups
            .find_by_id(self.active_group_id)
            .is_some_and(|group| group.target_state() == AseState::Streaming);
        if target_streaming {
            // Same layout serves the new context; only the metadata moves.
            self.group_stream(self.active_group_id, new_context.as_bitmask().bits());
        }
    }

    /// Whether the context switch requires a stream reconfiguration; if so
    /// the stream is stopped with the pending-configuration flag raised.
    fn stop_stream_if_needed(
        &mut self,
        group_id: GroupId,
        new_context: LeAudioContextType,
    ) -> bool {
        if !self.update_config_if_needed(group_id, new_context) {
            return false;
        }
        let Some(group) = self.groups.find_by_id_mut(group_id) else { return false };
        if group.state() != AseState::Streaming {
            return false;
        }
        self.suspend_timeout.cancel();
        let group = self.groups.find_by_id_mut(group_id).unwrap();
        group.set_pending_configuration(true);
        self.state_machine.stop_stream(group);
        true
    }

    /// Refresh the cached PCM session parameters; true when they changed.
    fn update_config_if_needed(&mut self, group_id: GroupId, context: LeAudioContextType) -> bool {
        let Some(group) = self.groups.find_by_id(group_id) else {
            error!("invalid group {}", group_id);
            return false;
        };

        let mut reconfiguration_needed = false;

        match group.codec_configuration_by_direction(context, Direction::Sink) {
            Some(config) => {
                if config != self.current_source_codec_config {
                    self.current_source_codec_config = config;
                    reconfiguration_needed = true;
                }
            }
            None => {
                if !self.current_source_codec_config.is_invalid() {
                    self.current_source_codec_config = LeAudioCodecConfiguration::default();
                    reconfiguration_needed = true;
                }
                info!("group {} does not support sink direction for {:?}", group_id, context);
            }
        }

        match group.codec_configuration_by_direction(context, Direction::Source) {
            Some(config) => {
                if config != self.current_sink_codec_config {
                    self.current_sink_codec_config = config;
                    reconfiguration_needed = true;
                }
            }
            None => {
                if !self.current_sink_codec_config.is_invalid() {
                    self.current_sink_codec_config = LeAudioCodecConfiguration::default();
                    reconfiguration_needed = true;
                }
                info!("group {} does not support source direction for {:?}", group_id, context);
            }
        }

        self.current_context_type = context;
        reconfiguration_needed
    }

    // ---- Stream status ----

    fn handle_pending_available_contexts(&mut self, group_id: GroupId) {
        let Some(group) = self.groups.find_by_id_mut(group_id) else { return };
        if group.pending_update_available_contexts().is_none() {
            return;
        }
        group.set_pending_update_available_contexts(None);
        if group.update_active_contexts_map().is_some() {
            self.emit_audio_conf(group_id);
        }
    }

    fn status_report(&mut self, group_id: GroupId, status: GroupStreamStatus) {
        info!(
            "group {} stream status {:?}, sender {:?} receiver {:?}",
            group_id, status, self.audio_sender_state, self.audio_receiver_state
        );
        match status {
            GroupStreamStatus::Streaming => {
                if group_id != self.active_group_id {
                    error!(
                        "streaming group {} is not the active group {}",
                        group_id, self.active_group_id
                    );
                    return;
                }
                if self.audio_sender_state == AudioState::ReadyToStart {
                    self.start_sending_audio(group_id);
                }
                if self.audio_receiver_state == AudioState::ReadyToStart {
                    self.start_receiving_audio(group_id);
                }
                if let Some(start) = self.stream_setup_start.take() {
                    self.stream_setup_ms = start.elapsed().as_millis() as u64;
                }
            }
            GroupStreamStatus::Suspended => {
                self.stream_setup_start = None;
                // Stop the audio without releasing the session resources.
                self.suspend_audio();
            }
            GroupStreamStatus::ConfiguredByUser => {
                self.cancel_streaming_request();
                self.handle_pending_available_contexts(group_id);
            }
            GroupStreamStatus::ConfiguredAutonomous | GroupStreamStatus::Idle => {
                self.stream_setup_start = None;
                let pending = self
                    .groups
                    .find_by_id(group_id)
                    .is_some_and(|group| group.is_pending_configuration());
                if pending {
                    self.suspended_for_reconfiguration();
                    let context = self.current_context_type;
                    let group = self.groups.find_by_id_mut(group_id).unwrap();
                    if self.state_machine.configure_stream(group, context) {
                        // Wait for the new status once reconfigured.
                        return;
                    }
                }
                self.cancel_streaming_request();
                self.handle_pending_available_contexts(group_id);
            }
            GroupStreamStatus::Releasing | GroupStreamStatus::Suspending => {
                if self.audio_sender_state != AudioState::Idle {
                    self.audio_sender_state = AudioState::Releasing;
                }
                if self.audio_receiver_state != AudioState::Idle {
                    self.audio_receiver_state = AudioState::Releasing;
                }
            }
            GroupStreamStatus::Destroyed => (),
        }
    }

    /// The transition watchdog fired: the peers did not reach the target
    /// state in time. Drop their links to recover.
    fn on_transition_timeout(&mut self, group_id: GroupId) {
        let Some(group) = self.groups.find_by_id_mut(group_id) else { return };
        error!(
            "state not achieved on time for group {}: {:?} -> {:?}",
            group_id,
            group.state(),
            group.target_state()
        );
        group.set_target_state(AseState::Idle);

        self.cancel_streaming_request();

        let group = self.groups.find_by_id(group_id).unwrap();
        let mut to_disconnect: Vec<DeviceRef> = group.active_devices().cloned().collect();
        if to_disconnect.is_empty() {
            to_disconnect = group.connected_devices().cloned().collect();
        }
        for device in to_disconnect {
            self.disconnect_device(&device, true);
        }
    }
}
