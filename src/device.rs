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

//! Device registry: per-peer attribute handles, PAC records, contexts,
//! locations and the ASE list.

use crate::audio_set_configurations::SetConfigEntry;
use crate::pacs::PacRecord;
use crate::types::{
    Address, AseCodecConfiguration, AseState, AudioContexts, AudioLocations, DataPathState,
    Direction, Directions, GroupId, CONN_ID_INVALID, GROUP_ID_UNKNOWN,
};
use log::info;
use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

/// Value handle with its client characteristic configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlePair {
    pub val: u16,
    pub ccc: Option<u16>,
}

/// One Audio Stream Endpoint of a peer.
#[derive(Debug, Clone)]
pub struct Ase {
    /// Peer-assigned identifier, learned from the first state notification.
    pub id: u8,
    pub val_handle: u16,
    pub ccc_handle: u16,
    pub direction: Direction,
    /// Participates in the current stream configuration.
    pub active: bool,
    pub state: AseState,
    pub codec_config: AseCodecConfiguration,
    pub target_latency: u8,
    pub retrans_nb: u8,
    pub max_transport_latency: u16,
    /// Preferred presentation delay range from the Codec Configured state.
    pub pres_delay_min: u32,
    pub pres_delay_max: u32,
    pub cis_id: u8,
    pub cis_conn_hdl: Option<u16>,
    pub data_path_state: DataPathState,
}

impl Ase {
    fn new(val_handle: u16, ccc_handle: u16, direction: Direction) -> Self {
        Self {
            id: 0,
            val_handle,
            ccc_handle,
            direction,
            active: false,
            state: AseState::Idle,
            codec_config: AseCodecConfiguration::default(),
            target_latency: 0,
            retrans_nb: 0,
            max_transport_latency: 0,
            pres_delay_min: 0,
            pres_delay_max: 0,
            cis_id: 0,
            cis_conn_hdl: None,
            data_path_state: DataPathState::Idle,
        }
    }
}

pub struct LeAudioDevice {
    pub address: Address,
    pub conn_id: u16,
    pub acl_conn_handle: u16,
    pub mtu: u16,
    pub encrypted: bool,
    pub group_id: GroupId,
    pub csis_member: bool,
    pub known_service_handles: bool,
    pub connecting_actively: bool,
    pub removing_device: bool,
    pub first_connection: bool,
    pub notify_connected_after_read: bool,
    pub audio_directions: Directions,

    pub snk_pacs: Vec<(HandlePair, Vec<PacRecord>)>,
    pub src_pacs: Vec<(HandlePair, Vec<PacRecord>)>,
    pub snk_audio_locations_handles: Option<HandlePair>,
    pub src_audio_locations_handles: Option<HandlePair>,
    pub available_contexts_handles: Option<HandlePair>,
    pub supported_contexts_handles: Option<HandlePair>,
    pub ctp_handles: Option<HandlePair>,

    pub snk_audio_locations: AudioLocations,
    pub src_audio_locations: AudioLocations,
    pub snk_available_contexts: AudioContexts,
    pub src_available_contexts: AudioContexts,
    pub snk_supported_contexts: AudioContexts,
    pub src_supported_contexts: AudioContexts,

    pub ases: Vec<Ase>,
}

impl LeAudioDevice {
    pub fn new(address: Address, first_connection: bool) -> Self {
        Self {
            address,
            conn_id: CONN_ID_INVALID,
            acl_conn_handle: 0,
            mtu: 0,
            encrypted: false,
            group_id: GROUP_ID_UNKNOWN,
            csis_member: false,
            known_service_handles: false,
            connecting_actively: first_connection,
            removing_device: false,
            first_connection,
            notify_connected_after_read: false,
            audio_directions: Directions::empty(),
            snk_pacs: Vec::new(),
            src_pacs: Vec::new(),
            snk_audio_locations_handles: None,
            src_audio_locations_handles: None,
            available_contexts_handles: None,
            supported_contexts_handles: None,
            ctp_handles: None,
            snk_audio_locations: AudioLocations::empty(),
            src_audio_locations: AudioLocations::empty(),
            snk_available_contexts: AudioContexts::empty(),
            src_available_contexts: AudioContexts::empty(),
            snk_supported_contexts: AudioContexts::empty(),
            src_supported_contexts: AudioContexts::empty(),
            ases: Vec::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn_id != CONN_ID_INVALID
    }

    /// Forget discovered handles, keeping bonding-level state.
    pub fn clear_service_data(&mut self) {
        self.snk_pacs.clear();
        self.src_pacs.clear();
        self.snk_audio_locations_handles = None;
        self.src_audio_locations_handles = None;
        self.available_contexts_handles = None;
        self.supported_contexts_handles = None;
        self.ctp_handles = None;
        self.ases.clear();
        self.known_service_handles = false;
        self.csis_member = false;
    }

    pub fn add_ase(&mut self, val_handle: u16, ccc_handle: u16, direction: Direction) {
        self.ases.push(Ase::new(val_handle, ccc_handle, direction));
    }

    pub fn ase_by_val_handle(&mut self, handle: u16) -> Option<&mut Ase> {
        self.ases.iter_mut().find(|ase| ase.val_handle == handle)
    }

    pub fn ase_by_id(&mut self, id: u8) -> Option<&mut Ase> {
        self.ases.iter_mut().find(|ase| ase.id == id)
    }

    pub fn ase_by_cis_conn_hdl(&mut self, handle: u16) -> Option<&mut Ase> {
        self.ases.iter_mut().find(|ase| ase.cis_conn_hdl == Some(handle))
    }

    pub fn have_active_ase(&self) -> bool {
        self.ases.iter().any(|ase| ase.active)
    }

    pub fn active_ases(&self) -> impl Iterator<Item = &Ase> {
        self.ases.iter().filter(|ase| ase.active)
    }

    pub fn active_ases_mut(&mut self) -> impl Iterator<Item = &mut Ase> {
        self.ases.iter_mut().filter(|ase| ase.active)
    }

    pub fn deactivate_all_ases(&mut self) {
        for ase in &mut self.ases {
            ase.active = false;
            ase.cis_conn_hdl = None;
            ase.data_path_state = DataPathState::Idle;
        }
    }

    pub fn register_pacs(&mut self, direction: Direction, handle: u16, records: Vec<PacRecord>) {
        let pacs = match direction {
            Direction::Sink => &mut self.snk_pacs,
            Direction::Source => &mut self.src_pacs,
        };
        if let Some(entry) = pacs.iter_mut().find(|(hdls, _)| hdls.val == handle) {
            entry.1 = records;
        }
    }

    pub fn pacs_by_direction(&self, direction: Direction) -> &[(HandlePair, Vec<PacRecord>)] {
        match direction {
            Direction::Sink => &self.snk_pacs,
            Direction::Source => &self.src_pacs,
        }
    }

    /// Store a new available-contexts pair; returns the bits that changed.
    pub fn set_available_contexts(
        &mut self,
        snk: AudioContexts,
        src: AudioContexts,
    ) -> AudioContexts {
        let changed = (self.snk_available_contexts ^ snk) | (self.src_available_contexts ^ src);
        self.snk_available_contexts = snk;
        self.src_available_contexts = src;
        changed
    }

    pub fn set_supported_contexts(&mut self, snk: AudioContexts, src: AudioContexts) {
        self.snk_supported_contexts = snk;
        self.src_supported_contexts = src;
    }

    pub fn available_contexts(&self) -> AudioContexts {
        self.snk_available_contexts | self.src_available_contexts
    }

    pub fn audio_locations(&self, direction: Direction) -> AudioLocations {
        match direction {
            Direction::Sink => self.snk_audio_locations,
            Direction::Source => self.src_audio_locations,
        }
    }

    /// Whether any PAC of the direction accepts the entry's codec frame.
    pub fn supports_codec_config(&self, ent: &SetConfigEntry) -> bool {
        self.pacs_by_direction(ent.direction).iter().any(|(_, records)| {
            records.iter().any(|record| {
                record.codec_id == crate::types::CODEC_ID_LC3
                    && record.capabilities.supports(
                        ent.sampling_frequency,
                        ent.frame_duration,
                        ent.octets_per_codec_frame,
                        ent.channel_count,
                    )
            })
        })
    }

    /// Activate this device's share of a configuration entry, claiming
    /// channel allocations greedily from its audio locations.
    pub fn configure_ases(
        &mut self,
        ent: &SetConfigEntry,
        active_ase_count: &mut u8,
        claimed_locations: &mut AudioLocations,
        reuse_cis_id: bool,
    ) -> bool {
        if *active_ase_count >= ent.ase_cnt {
            return true;
        }
        if !self.is_connected() {
            return true;
        }

        let has_candidates =
            self.ases.iter().any(|ase| ase.direction == ent.direction && !ase.active);
        if !has_candidates {
            return true;
        }
        if !self.supports_codec_config(ent) {
            return false;
        }

        let device_locations = self.audio_locations(ent.direction);
        let needed = ent.ase_cnt - *active_ase_count;
        let mut configured = 0u8;

        for ase in self.ases.iter_mut().filter(|ase| ase.direction == ent.direction && !ase.active)
        {
            if configured >= needed {
                break;
            }
            let allocation = pick_allocation(device_locations, claimed_locations, ent.channel_count);
            ase.active = true;
            ase.codec_config = AseCodecConfiguration {
                sampling_frequency: ent.sampling_frequency,
                frame_duration: ent.frame_duration,
                audio_channel_allocation: allocation,
                octets_per_codec_frame: Some(ent.octets_per_codec_frame),
                codec_frame_blocks_per_sdu: Some(ent.codec_frame_blocks_per_sdu),
                channel_count: allocation
                    .map_or(1, |a| (a.bits().count_ones() as u8).max(1)),
            };
            ase.target_latency = ent.target_latency;
            ase.retrans_nb = ent.retransmission_number;
            ase.max_transport_latency = ent.max_transport_latency;
            if !reuse_cis_id {
                ase.cis_id = 0;
                ase.cis_conn_hdl = None;
            }
            configured += 1;
            *active_ase_count += 1;

            info!(
                "{}: activated ASE handle {:#06x} allocation {:?}",
                self.address, ase.val_handle, allocation
            );
        }

        true
    }

    pub fn dump(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "    {} conn_id: {} group: {} encrypted: {} ases: {}",
            self.address,
            if self.is_connected() { self.conn_id.to_string() } else { "none".into() },
            self.group_id,
            self.encrypted,
            self.ases.len(),
        );
        for ase in &self.ases {
            let _ = writeln!(
                out,
                "      ase id {} dir {:?} active {} state {:?} cis {:?} path {:?}",
                ase.id, ase.direction, ase.active, ase.state, ase.cis_conn_hdl, ase.data_path_state,
            );
        }
    }
}

/// Claim up to `channel_count` positions from a device's location bitmap,
/// skipping positions already claimed by other group members. A device
/// without published locations streams mono with no allocation.
fn pick_allocation(
    device_locations: AudioLocations,
    claimed: &mut AudioLocations,
    channel_count: u8,
) -> Option<AudioLocations> {
    if device_locations.is_empty() {
        return None;
    }

    let mut available = device_locations & !*claimed;
    if available.is_empty() {
        available = device_locations;
    }

    let mut picked = AudioLocations::empty();
    for bit_idx in 0..32 {
        let bit = AudioLocations::from_bits_retain(1 << bit_idx);
        if available.intersects(bit) {
            picked |= bit;
            if picked.bits().count_ones() as u8 == channel_count {
                break;
            }
        }
    }
    *claimed |= picked;
    (!picked.is_empty()).then_some(picked)
}

pub type DeviceRef = Rc<RefCell<LeAudioDevice>>;

/// All known devices, grouped or not.
#[derive(Default)]
pub struct LeAudioDevices {
    devices: Vec<DeviceRef>,
}

impl LeAudioDevices {
    pub fn add(&mut self, address: Address, first_connection: bool) -> DeviceRef {
        let device = Rc::new(RefCell::new(LeAudioDevice::new(address, first_connection)));
        self.devices.push(device.clone());
        device
    }

    pub fn remove(&mut self, address: Address) {
        self.devices.retain(|device| device.borrow().address != address);
    }

    pub fn find_by_address(&self, address: Address) -> Option<DeviceRef> {
        self.devices.iter().find(|device| device.borrow().address == address).cloned()
    }

    pub fn find_by_conn_id(&self, conn_id: u16) -> Option<DeviceRef> {
        self.devices.iter().find(|device| device.borrow().conn_id == conn_id).cloned()
    }

    pub fn find_by_cis_conn_hdl(&self, handle: u16) -> Option<DeviceRef> {
        self.devices
            .iter()
            .find(|device| {
                device.borrow().ases.iter().any(|ase| ase.cis_conn_hdl == Some(handle))
            })
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceRef> {
        self.devices.iter()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn dump(&self, group_id: GroupId, out: &mut String) {
        for device in &self.devices {
            let device = device.borrow();
            if device.group_id == group_id {
                device.dump(out);
            }
        }
    }
}
