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

//! Group state machine: drives every member's ASEs through the ASCS state
//! machine so the group as a whole moves between IDLE and STREAMING, and
//! orchestrates the CIG, CIS and ISO data paths along the way.

use crate::ascs;
use crate::device::{DeviceRef, LeAudioDevice};
use crate::gatt::GattQueue;
use crate::group::{LeAudioDeviceGroup, DEFAULT_PRES_DELAY_US};
use crate::iso::{
    CigParameters, CisAclPair, CisParameters, IsoDataPathParameters, IsoManager, DATA_PATH_ID_HCI,
    DATA_PATH_INPUT, DATA_PATH_OUTPUT, ISO_STATUS_SUCCESS,
};
use crate::timer::Alarm;
use crate::types::{
    AseState, DataPathState, Direction, GroupStreamStatus, LeAudioContextType, CODEC_ID_LC3,
};
use crate::Message;
use log::{error, info, warn};
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Deadline for a whole group transition; expiry force-disconnects the
/// members to recover.
pub const DEVICE_SET_STATE_TIMEOUT_MS: u64 = 4000;

const PHY_2M: u8 = 0x02;
const UNFRAMED: u8 = 0x00;
const PACKING_SEQUENTIAL: u8 = 0x00;
const CIS_DISCONNECT_REASON: u8 = 0x13; // remote user terminated

pub struct GroupStateMachine {
    gatt: Rc<GattQueue>,
    iso: Rc<dyn IsoManager>,
    tx: UnboundedSender<Message>,
    watchdog: Alarm,
}

impl GroupStateMachine {
    pub fn new(
        gatt: Rc<GattQueue>,
        iso: Rc<dyn IsoManager>,
        tx: UnboundedSender<Message>,
    ) -> Self {
        let watchdog = Alarm::new(tx.clone());
        Self { gatt, iso, tx, watchdog }
    }

    fn report(&self, group_id: i32, status: GroupStreamStatus) {
        let _ = self.tx.send(Message::StatusReport(group_id, status));
    }

    fn arm_watchdog(&mut self, group_id: i32) {
        self.watchdog.schedule(
            Duration::from_millis(DEVICE_SET_STATE_TIMEOUT_MS),
            Message::TransitionTimeout(group_id),
        );
    }

    fn cancel_watchdog(&mut self) {
        self.watchdog.cancel();
    }

    /// Drive the group towards STREAMING for a context. Returns false when
    /// nothing was started.
    pub fn start_stream(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        context: LeAudioContextType,
    ) -> bool {
        match group.state() {
            AseState::Idle => {
                if !self.configure_ases_for_stream(group, context) {
                    return false;
                }
                group.set_target_state(AseState::Streaming);
                self.arm_watchdog(group.group_id);
                self.send_config_codec_all(group);
                true
            }
            AseState::CodecConfigured => {
                group.current_context_type = context;
                group.set_target_state(AseState::Streaming);
                self.arm_watchdog(group.group_id);
                if group.cig_created {
                    self.send_config_qos_all(group);
                } else {
                    self.create_cig(group);
                }
                true
            }
            AseState::QosConfigured => {
                group.current_context_type = context;
                group.set_target_state(AseState::Streaming);
                self.arm_watchdog(group.group_id);
                self.send_enable_all(group);
                true
            }
            AseState::Streaming => {
                if group.current_context_type == context {
                    // Same stream requested again; nothing to change.
                    return true;
                }
                group.current_context_type = context;
                self.send_update_metadata_all(group);
                true
            }
            state => {
                warn!("group {}: cannot start stream from {:?}", group.group_id, state);
                false
            }
        }
    }

    /// Configure codecs without starting the stream; used for pending
    /// reconfiguration.
    pub fn configure_stream(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        context: LeAudioContextType,
    ) -> bool {
        if !self.configure_ases_for_stream(group, context) {
            return false;
        }
        group.set_target_state(AseState::CodecConfigured);
        self.arm_watchdog(group.group_id);
        self.send_config_codec_all(group);
        true
    }

    /// Move a streaming group to QOS_CONFIGURED, keeping the CIG.
    pub fn suspend_stream(&mut self, group: &mut LeAudioDeviceGroup) {
        if group.state() != AseState::Streaming {
            warn!("group {}: suspend in state {:?}", group.group_id, group.state());
            return;
        }
        group.set_target_state(AseState::QosConfigured);
        self.arm_watchdog(group.group_id);
        self.report(group.group_id, GroupStreamStatus::Suspending);
        let members: Vec<DeviceRef> = group.devices().cloned().collect();
        for device in members {
            let device = device.borrow();
            let ase_ids: Vec<u8> = device.active_ases().map(|ase| ase.id).collect();
            if !ase_ids.is_empty() && device.is_connected() {
                self.write_ctp(&device, ascs::serialize_disable(&ase_ids));
            }
        }
    }

    /// Release every active ASE and tear the stream down to IDLE.
    pub fn stop_stream(&mut self, group: &mut LeAudioDeviceGroup) {
        if group.state() == AseState::Idle && !group.is_in_transition() {
            return;
        }
        group.set_target_state(AseState::Idle);
        self.arm_watchdog(group.group_id);
        self.report(group.group_id, GroupStreamStatus::Releasing);
        let members: Vec<DeviceRef> = group.devices().cloned().collect();
        for device in members {
            let device = device.borrow();
            let ase_ids: Vec<u8> = device.active_ases().map(|ase| ase.id).collect();
            if !ase_ids.is_empty() && device.is_connected() {
                self.write_ctp(&device, ascs::serialize_release(&ase_ids));
            }
        }
    }

    /// Bring a late-joining member into the running stream. The caller has
    /// already activated the device's ASEs for the current configuration.
    pub fn attach_to_stream(&mut self, group: &mut LeAudioDeviceGroup, device: &DeviceRef) {
        let Some(conf) = group.stream_conf.conf.clone() else {
            warn!("group {}: no stream configuration to attach to", group.group_id);
            return;
        };
        group.assign_cis_ids(&conf);
        // Map reserved CIG handles onto the newly activated ASEs.
        let handles: Vec<(u8, Option<u16>)> = {
            let device = device.borrow();
            device
                .active_ases()
                .filter(|ase| ase.cis_conn_hdl.is_none())
                .map(|ase| (ase.cis_id, group.cis_handle_for_id(ase.cis_id)))
                .collect()
        };
        {
            let mut device = device.borrow_mut();
            for (cis_id, handle) in handles {
                if let Some(ase) =
                    device.active_ases_mut().find(|ase| ase.cis_id == cis_id)
                {
                    ase.cis_conn_hdl = handle;
                    ase.data_path_state = DataPathState::CisAssigned;
                }
            }
        }
        self.send_config_codec_device(group, &device.borrow());
    }

    /// ASE characteristic notification for one member.
    pub fn process_gatt_notif(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        device: &DeviceRef,
        val_handle: u16,
        value: &[u8],
    ) {
        let Some(ntf) = ascs::parse_ase_notification(value) else {
            error!("Malformed ASE notification, handle {:#06x}", val_handle);
            return;
        };

        let (previous_state, direction) = {
            let mut device = device.borrow_mut();
            let Some(ase) = device.ase_by_val_handle(val_handle) else { return };
            let previous = ase.state;
            ase.id = ntf.ase_id;
            ase.state = ntf.state;
            match &ntf.params {
                ascs::AseParams::CodecConfigured(params) => {
                    ase.pres_delay_min = params.pres_delay_min;
                    ase.pres_delay_max = params.pres_delay_max;
                }
                ascs::AseParams::QosConfigured(params) => {
                    ase.cis_id = params.cis_id;
                }
                _ => (),
            }
            (previous, ase.direction)
        };

        if previous_state == ntf.state && ntf.state != AseState::CodecConfigured {
            // Peers may repeat notifications; state handling is edge driven.
            return;
        }

        info!(
            "group {}: ASE {} {:?} {:?} -> {:?}",
            group.group_id, ntf.ase_id, direction, previous_state, ntf.state
        );

        match ntf.state {
            AseState::CodecConfigured => self.on_ase_codec_configured(group, device),
            AseState::QosConfigured => self.on_ase_qos_configured(group, device),
            AseState::Enabling => self.on_ase_enabling(group, device, val_handle),
            AseState::Streaming => self.check_streaming_complete(group),
            AseState::Disabling => self.on_ase_disabling(group, device),
            AseState::Releasing => self.on_ase_releasing(group, device),
            AseState::Idle => self.on_ase_idle(group),
        }
    }

    fn is_streaming_steadily(group: &LeAudioDeviceGroup) -> bool {
        group.state() == AseState::Streaming && group.target_state() == AseState::Streaming
    }

    fn on_ase_codec_configured(&mut self, group: &mut LeAudioDeviceGroup, device: &DeviceRef) {
        if Self::is_streaming_steadily(group) {
            // Late attach: this member progresses alone.
            self.send_config_qos_device(group, &device.borrow());
            return;
        }

        if !group.all_active_ases_in_state(AseState::CodecConfigured) {
            return;
        }

        match group.target_state() {
            AseState::Streaming => {
                if group.cig_created {
                    self.send_config_qos_all(group);
                } else {
                    self.create_cig(group);
                }
            }
            AseState::CodecConfigured => {
                group.set_state(AseState::CodecConfigured);
                group.set_pending_configuration(false);
                self.cancel_watchdog();
                self.report(group.group_id, GroupStreamStatus::ConfiguredByUser);
            }
            AseState::Idle => {
                // Released with caching on the way down.
                self.on_group_released_with_cache(group);
            }
            _ => (),
        }
    }

    fn on_ase_qos_configured(&mut self, group: &mut LeAudioDeviceGroup, device: &DeviceRef) {
        // Data paths of ASEs stepping down from STREAMING come off first.
        let to_remove: Vec<(u16, u8)> = {
            let mut device = device.borrow_mut();
            let mut removals = Vec::new();
            for ase in device.active_ases_mut() {
                if ase.state == AseState::QosConfigured
                    && ase.data_path_state == DataPathState::DataPathEstablished
                {
                    ase.data_path_state = DataPathState::CisEstablished;
                    if let Some(handle) = ase.cis_conn_hdl {
                        removals.push((handle, direction_mask(ase.direction)));
                    }
                }
            }
            removals
        };
        for (handle, mask) in to_remove {
            self.iso.remove_iso_data_path(handle, mask);
        }

        if Self::is_streaming_steadily(group) {
            self.send_enable_device(group, &device.borrow());
            return;
        }

        if !group.all_active_ases_in_state(AseState::QosConfigured) {
            return;
        }

        match group.target_state() {
            AseState::Streaming => self.send_enable_all(group),
            AseState::QosConfigured => {
                group.set_state(AseState::QosConfigured);
                self.cancel_watchdog();
                self.report(group.group_id, GroupStreamStatus::Suspended);
            }
            _ => (),
        }
    }

    fn on_ase_enabling(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        device: &DeviceRef,
        val_handle: u16,
    ) {
        // An ASE resuming over a kept CIS skips establishment; its data
        // path restarts right away.
        let resumed: Option<(u16, Direction, u8)> = {
            let device = device.borrow();
            device
                .ases
                .iter()
                .find(|ase| {
                    ase.val_handle == val_handle
                        && ase.active
                        && ase.data_path_state == DataPathState::CisEstablished
                })
                .and_then(|ase| {
                    ase.cis_conn_hdl.map(|handle| (handle, ase.direction, ase.id))
                })
        };
        if let Some((cis_conn_handle, direction, ase_id)) = resumed {
            self.iso.setup_iso_data_path(IsoDataPathParameters {
                cis_conn_handle,
                data_path_direction: match direction {
                    Direction::Sink => DATA_PATH_INPUT,
                    Direction::Source => DATA_PATH_OUTPUT,
                },
                data_path_id: DATA_PATH_ID_HCI,
            });
            if direction == Direction::Source {
                self.write_ctp(&device.borrow(), ascs::serialize_receiver_start_ready(&[ase_id]));
            }
            return;
        }

        if Self::is_streaming_steadily(group) {
            self.establish_cis_device(group, device);
            return;
        }
        if group.minimum_active_ase_state() == Some(AseState::Enabling) {
            self.establish_cis_all(group);
        }
    }

    fn on_ase_disabling(&mut self, _group: &mut LeAudioDeviceGroup, device: &DeviceRef) {
        // Source ASEs stop at DISABLING until the receiver confirms.
        let device = device.borrow();
        let ase_ids: Vec<u8> = device
            .active_ases()
            .filter(|ase| ase.direction == Direction::Source && ase.state == AseState::Disabling)
            .map(|ase| ase.id)
            .collect();
        if !ase_ids.is_empty() {
            self.write_ctp(&device, ascs::serialize_receiver_stop_ready(&ase_ids));
        }
    }

    fn on_ase_releasing(&mut self, group: &mut LeAudioDeviceGroup, device: &DeviceRef) {
        // Remove data paths under the releasing ASEs.
        let to_remove: Vec<(u16, u8)> = {
            let device = device.borrow();
            device
                .active_ases()
                .filter(|ase| {
                    ase.state == AseState::Releasing
                        && ase.data_path_state == DataPathState::DataPathEstablished
                })
                .filter_map(|ase| {
                    ase.cis_conn_hdl.map(|handle| (handle, direction_mask(ase.direction)))
                })
                .collect()
        };
        {
            let mut device = device.borrow_mut();
            for ase in device.active_ases_mut() {
                if ase.state == AseState::Releasing
                    && ase.data_path_state == DataPathState::DataPathEstablished
                {
                    ase.data_path_state = DataPathState::CisEstablished;
                }
            }
        }
        for (handle, mask) in to_remove {
            self.iso.remove_iso_data_path(handle, mask);
        }

        if group.state() != AseState::Releasing {
            group.set_state(AseState::Releasing);
            if group.target_state() != AseState::Idle {
                // Spontaneous release by the peer drags the group down.
                group.set_target_state(AseState::Idle);
                self.arm_watchdog(group.group_id);
            }
            self.report(group.group_id, GroupStreamStatus::Releasing);
        }
    }

    fn on_ase_idle(&mut self, group: &mut LeAudioDeviceGroup) {
        if group.all_active_ases_in_state(AseState::Idle) {
            self.on_group_released(group);
        }
    }

    fn on_group_released(&mut self, group: &mut LeAudioDeviceGroup) {
        self.cancel_watchdog();
        group.set_state(AseState::Idle);
        group.set_target_state(AseState::Idle);
        for device in group.devices() {
            device.borrow_mut().deactivate_all_ases();
        }
        group.stream_conf.clear();
        if group.cig_created {
            self.iso.remove_cig(group.cig_id());
        }
        self.report(group.group_id, GroupStreamStatus::Idle);
    }

    fn on_group_released_with_cache(&mut self, group: &mut LeAudioDeviceGroup) {
        self.cancel_watchdog();
        group.set_state(AseState::CodecConfigured);
        group.set_target_state(AseState::CodecConfigured);
        for device in group.devices() {
            device.borrow_mut().deactivate_all_ases();
        }
        group.stream_conf.clear();
        if group.cig_created {
            self.iso.remove_cig(group.cig_id());
        }
        self.report(group.group_id, GroupStreamStatus::ConfiguredAutonomous);
    }

    /// Create-CIG completion.
    pub fn process_cig_created(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        status: u8,
        conn_handles: Vec<u16>,
    ) {
        if status != ISO_STATUS_SUCCESS {
            error!("group {}: CIG create failed: {:#04x}", group.group_id, status);
            self.stop_stream(group);
            return;
        }
        group.cig_created = true;
        group.cig_cis_handles = conn_handles;
        for device in group.devices() {
            let mut device = device.borrow_mut();
            for ase in device.active_ases_mut() {
                ase.cis_conn_hdl = group
                    .cig_cis_handles
                    .get(ase.cis_id.saturating_sub(1) as usize)
                    .copied();
                if ase.cis_conn_hdl.is_some() {
                    ase.data_path_state = DataPathState::CisAssigned;
                }
            }
        }
        if group.target_state() == AseState::Streaming {
            self.send_config_qos_all(group);
        }
    }

    /// Remove-CIG completion.
    pub fn process_cig_removed(&mut self, group: &mut LeAudioDeviceGroup, status: u8) {
        if status != ISO_STATUS_SUCCESS {
            warn!("group {}: CIG remove failed: {:#04x}", group.group_id, status);
        }
        group.cig_created = false;
        group.cig_cis_handles.clear();
    }

    /// CIS establishment completion.
    pub fn process_cis_established(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        device: &DeviceRef,
        cis_conn_hdl: u16,
        status: u8,
        transport_latency_c_to_p: u32,
        transport_latency_p_to_c: u32,
        max_pdu_c_to_p: u16,
        max_pdu_p_to_c: u16,
    ) {
        if status != ISO_STATUS_SUCCESS {
            error!(
                "group {}: CIS {:#06x} establishment failed: {:#04x}",
                group.group_id, cis_conn_hdl, status
            );
            self.stop_stream(group);
            return;
        }

        if max_pdu_c_to_p > 0 {
            group.set_transport_latency(Direction::Sink, transport_latency_c_to_p);
        }
        if max_pdu_p_to_c > 0 {
            group.set_transport_latency(Direction::Source, transport_latency_p_to_c);
        }

        let mut setups: Vec<IsoDataPathParameters> = Vec::new();
        let mut start_ready: Vec<u8> = Vec::new();
        {
            let mut device = device.borrow_mut();
            for ase in device.active_ases_mut() {
                if ase.cis_conn_hdl != Some(cis_conn_hdl) {
                    continue;
                }
                ase.data_path_state = DataPathState::CisEstablished;
                setups.push(IsoDataPathParameters {
                    cis_conn_handle: cis_conn_hdl,
                    data_path_direction: match ase.direction {
                        Direction::Sink => DATA_PATH_INPUT,
                        Direction::Source => DATA_PATH_OUTPUT,
                    },
                    data_path_id: DATA_PATH_ID_HCI,
                });
                if ase.direction == Direction::Source {
                    start_ready.push(ase.id);
                }
            }
        }
        for params in setups {
            self.iso.setup_iso_data_path(params);
        }
        if !start_ready.is_empty() {
            self.write_ctp(&device.borrow(), ascs::serialize_receiver_start_ready(&start_ready));
        }
    }

    /// CIS disconnection.
    pub fn process_cis_disconnected(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        device: &DeviceRef,
        cis_conn_hdl: u16,
        reason: u8,
    ) {
        info!(
            "group {}: CIS {:#06x} disconnected, reason {:#04x}",
            group.group_id, cis_conn_hdl, reason
        );
        {
            let mut device = device.borrow_mut();
            for ase in device.active_ases_mut() {
                if ase.cis_conn_hdl == Some(cis_conn_hdl) {
                    ase.data_path_state = DataPathState::CisAssigned;
                }
            }
        }
        if group.target_state() == AseState::Streaming && group.state() == AseState::Streaming {
            // Transport dropped under a live stream; release and recover.
            self.stop_stream(group);
        }
    }

    /// Setup ISO data path completion.
    pub fn process_setup_iso_data_path(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        device: &DeviceRef,
        status: u8,
        cis_conn_hdl: u16,
    ) {
        if status != ISO_STATUS_SUCCESS {
            error!(
                "group {}: data path setup failed on {:#06x}: {:#04x}",
                group.group_id, cis_conn_hdl, status
            );
            self.stop_stream(group);
            return;
        }
        {
            let mut device = device.borrow_mut();
            for ase in device.active_ases_mut() {
                if ase.cis_conn_hdl == Some(cis_conn_hdl)
                    && ase.data_path_state == DataPathState::CisEstablished
                {
                    ase.data_path_state = DataPathState::DataPathEstablished;
                }
            }
        }
        self.check_streaming_complete(group);
    }

    /// Remove ISO data path completion.
    pub fn process_remove_iso_data_path(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        device: &DeviceRef,
        status: u8,
        cis_conn_hdl: u16,
    ) {
        if status != ISO_STATUS_SUCCESS {
            warn!(
                "group {}: data path removal failed on {:#06x}: {:#04x}",
                group.group_id, cis_conn_hdl, status
            );
        }
        let mut disconnect = false;
        {
            let mut device = device.borrow_mut();
            for ase in device.active_ases_mut() {
                if ase.cis_conn_hdl != Some(cis_conn_hdl)
                    || ase.data_path_state != DataPathState::DataPathEstablished
                {
                    continue;
                }
                ase.data_path_state = DataPathState::CisEstablished;
                disconnect |= ase.state == AseState::Releasing;
            }
        }
        if disconnect {
            // Teardown continues under the released ASE: the CIS goes next.
            self.iso.disconnect_cis(cis_conn_hdl, CIS_DISCONNECT_REASON);
        }
    }

    /// Member ACL dropped.
    pub fn process_acl_disconnected(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        device: &DeviceRef,
    ) {
        {
            // The peer resets its endpoints when the link drops.
            let mut device = device.borrow_mut();
            for ase in &mut device.ases {
                ase.state = AseState::Idle;
            }
            device.deactivate_all_ases();
        }

        if !group.is_any_device_connected() {
            self.cancel_watchdog();
            group.set_state(AseState::Idle);
            group.set_target_state(AseState::Idle);
            group.stream_conf.clear();
            if group.cig_created {
                self.iso.remove_cig(group.cig_id());
            }
            self.report(group.group_id, GroupStreamStatus::Idle);
            return;
        }

        if group.state() == AseState::Streaming {
            // Remaining members keep the stream; refresh the descriptor.
            group.reload_stream_configuration(Direction::Sink);
            group.reload_stream_configuration(Direction::Source);
        }
    }

    fn check_streaming_complete(&mut self, group: &mut LeAudioDeviceGroup) {
        let complete = {
            let mut any = false;
            let mut all = true;
            for device in group.devices() {
                for ase in device.borrow().active_ases() {
                    any = true;
                    if ase.state != AseState::Streaming
                        || ase.data_path_state != DataPathState::DataPathEstablished
                    {
                        all = false;
                    }
                }
            }
            any && all
        };
        if !complete {
            return;
        }

        group.reload_stream_configuration(Direction::Sink);
        group.reload_stream_configuration(Direction::Source);

        if group.state() != AseState::Streaming {
            group.set_state(AseState::Streaming);
            self.cancel_watchdog();
            for (handle, _) in group
                .stream_conf
                .sink_streams
                .iter()
                .chain(group.stream_conf.source_streams.iter())
            {
                self.iso.read_iso_link_quality(*handle);
            }
            self.report(group.group_id, GroupStreamStatus::Streaming);
        }
    }

    fn configure_ases_for_stream(
        &mut self,
        group: &mut LeAudioDeviceGroup,
        context: LeAudioContextType,
    ) -> bool {
        let Some(conf) = group.find_first_supported_configuration(context) else {
            warn!("group {}: no configuration for {:?}", group.group_id, context);
            return false;
        };
        info!("group {}: using configuration {}", group.group_id, conf.name);

        for device in group.devices() {
            device.borrow_mut().deactivate_all_ases();
        }

        for ent in &conf.confs {
            let mut active_count = 0u8;
            let mut claimed = crate::types::AudioLocations::empty();
            let members: Vec<DeviceRef> = group.connected_devices().cloned().collect();
            for device in members {
                device.borrow_mut().configure_ases(ent, &mut active_count, &mut claimed, false);
            }
            if active_count < ent.ase_cnt {
                warn!(
                    "group {}: only {} of {} ASEs available for {:?}",
                    group.group_id, active_count, ent.ase_cnt, ent.direction
                );
                for device in group.devices() {
                    device.borrow_mut().deactivate_all_ases();
                }
                return false;
            }
        }

        group.assign_cis_ids(&conf);
        group.stream_conf.clear();
        group.stream_conf.conf = Some(conf);
        group.current_context_type = context;
        true
    }

    fn write_ctp(&self, device: &LeAudioDevice, value: Vec<u8>) {
        if let Some(ctp) = device.ctp_handles {
            self.gatt.write_characteristic(device.conn_id, ctp.val, value);
        }
    }

    fn send_config_codec_all(&mut self, group: &mut LeAudioDeviceGroup) {
        let members: Vec<DeviceRef> = group.connected_devices().cloned().collect();
        for device in members {
            self.send_config_codec_device(group, &device.borrow());
        }
    }

    fn send_config_codec_device(&self, _group: &LeAudioDeviceGroup, device: &LeAudioDevice) {
        let entries: Vec<ascs::ConfigCodecEntry> = device
            .active_ases()
            .map(|ase| ascs::ConfigCodecEntry {
                ase_id: ase.id,
                target_latency: ase.target_latency,
                target_phy: PHY_2M,
                codec_id: CODEC_ID_LC3,
                config: ase.codec_config,
            })
            .collect();
        if !entries.is_empty() {
            self.write_ctp(device, ascs::serialize_config_codec(&entries));
        }
    }

    fn create_cig(&mut self, group: &mut LeAudioDeviceGroup) {
        let Some(conf) = group.stream_conf.conf.clone() else {
            error!("group {}: CIG create without a configuration", group.group_id);
            return;
        };

        let mut cis: Vec<CisParameters> = Vec::new();
        let mut sdu_interval_c_to_p = 0u32;
        let mut sdu_interval_p_to_c = 0u32;
        let mut max_latency_c_to_p = 0u16;
        let mut max_latency_p_to_c = 0u16;

        for ent in &conf.confs {
            let max_sdu =
                ent.octets_per_codec_frame * ent.channel_count as u16 * ent.codec_frame_blocks_per_sdu as u16;
            let interval = crate::types::codec_spec::frame_duration_to_us(ent.frame_duration);
            for _ in 0..ent.ase_cnt {
                let cis_id = (cis.len() + 1) as u8;
                let (c_to_p, p_to_c) = match ent.direction {
                    Direction::Sink => (max_sdu, 0),
                    Direction::Source => (0, max_sdu),
                };
                cis.push(CisParameters {
                    cis_id,
                    max_sdu_c_to_p: c_to_p,
                    max_sdu_p_to_c: p_to_c,
                    phy_c_to_p: PHY_2M,
                    phy_p_to_c: PHY_2M,
                    rtn_c_to_p: ent.retransmission_number,
                    rtn_p_to_c: ent.retransmission_number,
                });
            }
            match ent.direction {
                Direction::Sink => {
                    sdu_interval_c_to_p = interval;
                    max_latency_c_to_p = ent.max_transport_latency;
                }
                Direction::Source => {
                    sdu_interval_p_to_c = interval;
                    max_latency_p_to_c = ent.max_transport_latency;
                }
            }
        }

        self.iso.create_cig(
            group.cig_id(),
            CigParameters {
                sdu_interval_c_to_p,
                sdu_interval_p_to_c,
                worst_case_sca: 0,
                packing: PACKING_SEQUENTIAL,
                framing: UNFRAMED,
                max_transport_latency_c_to_p: max_latency_c_to_p,
                max_transport_latency_p_to_c: max_latency_p_to_c,
                cis,
            },
        );
    }

    fn qos_entries(&self, group: &LeAudioDeviceGroup, device: &LeAudioDevice) -> Vec<ascs::ConfigQosEntry> {
        device
            .active_ases()
            .map(|ase| {
                let config = &ase.codec_config;
                let max_sdu = config.octets_per_codec_frame.unwrap_or(0)
                    * config.channel_count as u16
                    * config.codec_frame_blocks_per_sdu.unwrap_or(1) as u16;
                ascs::ConfigQosEntry {
                    ase_id: ase.id,
                    cig_id: group.cig_id(),
                    cis_id: ase.cis_id,
                    sdu_interval: config.frame_duration_us(),
                    framing: UNFRAMED,
                    phy: PHY_2M,
                    max_sdu,
                    retrans_nb: ase.retrans_nb,
                    max_transport_latency: ase.max_transport_latency,
                    pres_delay: DEFAULT_PRES_DELAY_US,
                }
            })
            .collect()
    }

    fn send_config_qos_all(&mut self, group: &mut LeAudioDeviceGroup) {
        let members: Vec<DeviceRef> = group.connected_devices().cloned().collect();
        for device in members {
            self.send_config_qos_device(group, &device.borrow());
        }
    }

    fn send_config_qos_device(&self, group: &LeAudioDeviceGroup, device: &LeAudioDevice) {
        let entries = self.qos_entries(group, device);
        if !entries.is_empty() {
            self.write_ctp(device, ascs::serialize_config_qos(&entries));
        }
    }

    fn send_enable_all(&mut self, group: &mut LeAudioDeviceGroup) {
        let members: Vec<DeviceRef> = group.connected_devices().cloned().collect();
        for device in members {
            self.send_enable_device(group, &device.borrow());
        }
    }

    fn send_enable_device(&self, group: &LeAudioDeviceGroup, device: &LeAudioDevice) {
        let contexts = group.current_context_type.as_bitmask();
        let entries: Vec<(u8, crate::types::AudioContexts)> =
            device.active_ases().map(|ase| (ase.id, contexts)).collect();
        if !entries.is_empty() {
            self.write_ctp(device, ascs::serialize_enable(&entries));
        }
    }

    fn send_update_metadata_all(&mut self, group: &mut LeAudioDeviceGroup) {
        let contexts = group.current_context_type.as_bitmask();
        let members: Vec<DeviceRef> = group.connected_devices().cloned().collect();
        for device in members {
            let device = device.borrow();
            let entries: Vec<(u8, crate::types::AudioContexts)> =
                device.active_ases().map(|ase| (ase.id, contexts)).collect();
            if !entries.is_empty() {
                self.write_ctp(&device, ascs::serialize_update_metadata(&entries));
            }
        }
    }

    fn establish_cis_all(&mut self, group: &mut LeAudioDeviceGroup) {
        let mut pairs: Vec<CisAclPair> = Vec::new();
        for device in group.devices() {
            let mut device = device.borrow_mut();
            let acl_conn_handle = device.acl_conn_handle;
            for ase in device.active_ases_mut() {
                if ase.data_path_state != DataPathState::CisAssigned {
                    continue;
                }
                if let Some(cis_conn_handle) = ase.cis_conn_hdl {
                    ase.data_path_state = DataPathState::CisPending;
                    pairs.push(CisAclPair { cis_conn_handle, acl_conn_handle });
                }
            }
        }
        if !pairs.is_empty() {
            self.iso.establish_cis(pairs);
        }
    }

    fn establish_cis_device(&mut self, _group: &mut LeAudioDeviceGroup, device: &DeviceRef) {
        let mut device = device.borrow_mut();
        let acl_conn_handle = device.acl_conn_handle;
        let mut pairs: Vec<CisAclPair> = Vec::new();
        for ase in device.active_ases_mut() {
            if ase.data_path_state != DataPathState::CisAssigned {
                continue;
            }
            if let Some(cis_conn_handle) = ase.cis_conn_hdl {
                ase.data_path_state = DataPathState::CisPending;
                pairs.push(CisAclPair { cis_conn_handle, acl_conn_handle });
            }
        }
        if !pairs.is_empty() {
            self.iso.establish_cis(pairs);
        }
    }
}

fn direction_mask(direction: Direction) -> u8 {
    match direction {
        Direction::Sink => 1 << DATA_PATH_INPUT,
        Direction::Source => 1 << DATA_PATH_OUTPUT,
    }
}
