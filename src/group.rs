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

//! Group registry: member lists, aggregated locations and contexts, the
//! group-level ASE state pair and the active stream configuration.

use crate::audio_set_configurations::{configurations_for, AudioSetConfiguration};
use crate::device::DeviceRef;
use crate::types::{
    AseState, AudioContexts, AudioLocations, Direction, Directions, GroupId,
    LeAudioCodecConfiguration, LeAudioContextType,
};
use log::{info, warn};
use std::fmt::Write as _;

/// Presentation delay requested in QoS configuration.
pub const DEFAULT_PRES_DELAY_US: u32 = 40_000;

const BITS_PER_SAMPLE: u8 = 16;

/// The chosen per-direction codec and channel layout of a streaming group.
#[derive(Default)]
pub struct StreamConfiguration {
    pub conf: Option<AudioSetConfiguration>,

    /// (CIS connection handle, channel allocation) per direction.
    pub sink_streams: Vec<(u16, AudioLocations)>,
    pub source_streams: Vec<(u16, AudioLocations)>,

    pub sink_num_of_devices: u8,
    pub sink_num_of_channels: u8,
    pub sink_sample_frequency_hz: u32,
    pub sink_frame_duration_us: u32,
    pub sink_octets_per_codec_frame: u16,
    pub sink_codec_frames_blocks_per_sdu: u8,
    pub sink_audio_channel_allocation: AudioLocations,

    pub source_num_of_devices: u8,
    pub source_num_of_channels: u8,
    pub source_sample_frequency_hz: u32,
    pub source_frame_duration_us: u32,
    pub source_octets_per_codec_frame: u16,
    pub source_codec_frames_blocks_per_sdu: u8,
    pub source_audio_channel_allocation: AudioLocations,
}

impl StreamConfiguration {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

pub struct LeAudioDeviceGroup {
    pub group_id: GroupId,
    devices: Vec<DeviceRef>,

    pub snk_audio_locations: AudioLocations,
    pub src_audio_locations: AudioLocations,
    pub audio_directions: Directions,
    active_contexts: AudioContexts,

    current_state: AseState,
    target_state: AseState,

    pub cig_created: bool,
    /// CIS connection handles returned by Create-CIG, indexed by CIS id - 1.
    pub cig_cis_handles: Vec<u16>,
    pending_configuration: bool,
    pending_update_available_contexts: Option<AudioContexts>,

    pub stream_conf: StreamConfiguration,
    pub transport_latency_mtos_us: u32,
    pub transport_latency_stom_us: u32,
    pub current_context_type: LeAudioContextType,
}

impl LeAudioDeviceGroup {
    pub fn new(group_id: GroupId) -> Self {
        Self {
            group_id,
            devices: Vec::new(),
            snk_audio_locations: AudioLocations::empty(),
            src_audio_locations: AudioLocations::empty(),
            audio_directions: Directions::empty(),
            active_contexts: AudioContexts::empty(),
            current_state: AseState::Idle,
            target_state: AseState::Idle,
            cig_created: false,
            cig_cis_handles: Vec::new(),
            pending_configuration: false,
            pending_update_available_contexts: None,
            stream_conf: StreamConfiguration::default(),
            transport_latency_mtos_us: 0,
            transport_latency_stom_us: 0,
            current_context_type: LeAudioContextType::Media,
        }
    }

    /// CIG identifier on the controller; the group id doubles as it.
    pub fn cig_id(&self) -> u8 {
        self.group_id as u8
    }

    pub fn add_node(&mut self, device: DeviceRef) -> bool {
        let address = device.borrow().address;
        if self.devices.iter().any(|member| member.borrow().address == address) {
            warn!("group {}: {} already a member", self.group_id, address);
            return false;
        }
        device.borrow_mut().group_id = self.group_id;
        self.devices.push(device);
        true
    }

    pub fn remove_node(&mut self, device: &DeviceRef) {
        let address = device.borrow().address;
        device.borrow_mut().group_id = crate::types::GROUP_ID_UNKNOWN;
        self.devices.retain(|member| member.borrow().address != address);
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn size(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceRef> {
        self.devices.iter()
    }

    pub fn connected_devices(&self) -> impl Iterator<Item = &DeviceRef> {
        self.devices.iter().filter(|device| device.borrow().is_connected())
    }

    pub fn active_devices(&self) -> impl Iterator<Item = &DeviceRef> {
        self.devices.iter().filter(|device| device.borrow().have_active_ase())
    }

    pub fn num_of_connected(&self) -> usize {
        self.connected_devices().count()
    }

    pub fn is_any_device_connected(&self) -> bool {
        self.num_of_connected() > 0
    }

    pub fn state(&self) -> AseState {
        self.current_state
    }

    pub fn set_state(&mut self, state: AseState) {
        info!("group {}: state {:?} -> {:?}", self.group_id, self.current_state, state);
        self.current_state = state;
    }

    pub fn target_state(&self) -> AseState {
        self.target_state
    }

    pub fn set_target_state(&mut self, state: AseState) {
        info!("group {}: target {:?} -> {:?}", self.group_id, self.target_state, state);
        self.target_state = state;
    }

    pub fn is_in_transition(&self) -> bool {
        self.current_state != self.target_state
    }

    pub fn active_contexts(&self) -> AudioContexts {
        self.active_contexts
    }

    /// Recompute the active-context bitmap from the members; `Some(new)` on
    /// change, `None` when nothing moved.
    pub fn update_active_contexts_map(&mut self) -> Option<AudioContexts> {
        let mut contexts = AudioContexts::empty();
        for device in self.connected_devices() {
            contexts |= device.borrow().available_contexts();
        }
        if contexts == self.active_contexts {
            return None;
        }
        self.active_contexts = contexts;
        Some(contexts)
    }

    /// Re-aggregate member audio locations; true when the OR changed.
    pub fn reload_audio_locations(&mut self) -> bool {
        let mut snk = AudioLocations::empty();
        let mut src = AudioLocations::empty();
        let mut directions = Directions::empty();
        for device in &self.devices {
            let device = device.borrow();
            snk |= device.snk_audio_locations;
            src |= device.src_audio_locations;
            directions |= device.audio_directions;
        }
        let changed = snk != self.snk_audio_locations || src != self.src_audio_locations;
        self.snk_audio_locations = snk;
        self.src_audio_locations = src;
        self.audio_directions = directions;
        changed
    }

    pub fn set_pending_configuration(&mut self, pending: bool) {
        self.pending_configuration = pending;
    }

    pub fn is_pending_configuration(&self) -> bool {
        self.pending_configuration
    }

    pub fn set_pending_update_available_contexts(&mut self, contexts: Option<AudioContexts>) {
        self.pending_update_available_contexts = contexts;
    }

    pub fn pending_update_available_contexts(&self) -> Option<AudioContexts> {
        self.pending_update_available_contexts
    }

    pub fn set_transport_latency(&mut self, direction: Direction, latency_us: u32) {
        match direction {
            Direction::Sink => self.transport_latency_mtos_us = latency_us,
            Direction::Source => self.transport_latency_stom_us = latency_us,
        }
    }

    /// Delay reported to the audio framework: transport plus presentation.
    pub fn remote_delay_ms(&self, direction: Direction) -> u16 {
        let transport_us = match direction {
            Direction::Sink => self.transport_latency_mtos_us,
            Direction::Source => self.transport_latency_stom_us,
        };
        ((transport_us + DEFAULT_PRES_DELAY_US) / 1000) as u16
    }

    /// Least-advanced state among active members' active ASEs.
    pub fn minimum_active_ase_state(&self) -> Option<AseState> {
        self.devices
            .iter()
            .flat_map(|device| {
                device.borrow().active_ases().map(|ase| ase.state).collect::<Vec<_>>()
            })
            .min()
    }

    pub fn all_active_ases_in_state(&self, state: AseState) -> bool {
        let mut any = false;
        for device in &self.devices {
            for ase in device.borrow().active_ases() {
                any = true;
                if ase.state != state {
                    return false;
                }
            }
        }
        any
    }

    /// Give every active ASE a CIS identifier from its configuration
    /// entry's slot range. Already-assigned identifiers stay put, so a late
    /// joiner claims a free slot of the running CIG.
    pub fn assign_cis_ids(&mut self, conf: &AudioSetConfiguration) {
        let mut next = 1u8;
        for ent in &conf.confs {
            let range = next..next + ent.ase_cnt;
            next += ent.ase_cnt;

            let mut used: Vec<u8> = Vec::new();
            for device in &self.devices {
                for ase in device.borrow().active_ases() {
                    if ase.direction == ent.direction && range.contains(&ase.cis_id) {
                        used.push(ase.cis_id);
                    }
                }
            }
            let mut free = range.clone().filter(|id| !used.contains(id));

            for device in &self.devices {
                for ase in device.borrow_mut().active_ases_mut() {
                    if ase.direction != ent.direction || range.contains(&ase.cis_id) {
                        continue;
                    }
                    match free.next() {
                        Some(id) => ase.cis_id = id,
                        None => warn!(
                            "group {}: no free CIS slot for ASE {:#06x}",
                            self.group_id, ase.val_handle
                        ),
                    }
                }
            }
        }
    }

    /// CIS connection handle reserved for a CIS id by Create-CIG.
    pub fn cis_handle_for_id(&self, cis_id: u8) -> Option<u16> {
        if cis_id == 0 {
            return None;
        }
        self.cig_cis_handles.get(cis_id as usize - 1).copied()
    }

    /// Whether the group's connected members can serve a configuration.
    fn is_configuration_supported(&self, conf: &AudioSetConfiguration) -> bool {
        conf.confs.iter().all(|ent| {
            let mut devices = 0usize;
            let mut ases = 0usize;
            for device in self.connected_devices() {
                let device = device.borrow();
                if !device.supports_codec_config(ent) {
                    continue;
                }
                let matching =
                    device.ases.iter().filter(|ase| ase.direction == ent.direction).count();
                if matching > 0 {
                    devices += 1;
                    ases += matching;
                }
            }
            devices >= ent.device_cnt as usize && ases >= ent.ase_cnt as usize
        })
    }

    /// First configuration of the context's preference list the members can
    /// serve.
    pub fn find_first_supported_configuration(
        &self,
        context: LeAudioContextType,
    ) -> Option<AudioSetConfiguration> {
        configurations_for(context)
            .into_iter()
            .find(|conf| self.is_configuration_supported(conf))
    }

    /// PCM session parameters the chosen configuration implies for one
    /// direction, or `None` when the context cannot serve it.
    pub fn codec_configuration_by_direction(
        &self,
        context: LeAudioContextType,
        direction: Direction,
    ) -> Option<LeAudioCodecConfiguration> {
        let conf = self.find_first_supported_configuration(context)?;
        let ent = conf.confs.iter().find(|ent| ent.direction == direction)?;
        Some(LeAudioCodecConfiguration {
            num_channels: ent.ase_cnt * ent.channel_count,
            sample_rate: crate::types::codec_spec::sampling_freq_to_hz(ent.sampling_frequency),
            bits_per_sample: BITS_PER_SAMPLE,
            data_interval_us: crate::types::codec_spec::frame_duration_to_us(ent.frame_duration),
        })
    }

    /// Rebuild the per-direction stream descriptor from the active ASEs.
    /// Returns false when the direction carries no stream.
    pub fn reload_stream_configuration(&mut self, direction: Direction) -> bool {
        let mut streams: Vec<(u16, AudioLocations)> = Vec::new();
        let mut num_of_devices = 0u8;
        let mut num_of_channels = 0u8;
        let mut sample_freq_hz = 0u32;
        let mut frame_duration_us = 0u32;
        let mut octets_per_frame = 0u16;
        let mut blocks_per_sdu = 0u8;
        let mut allocation = AudioLocations::empty();

        for device in &self.devices {
            let device = device.borrow();
            let mut device_counted = false;
            for ase in device.active_ases().filter(|ase| ase.direction == direction) {
                let Some(cis_conn_hdl) = ase.cis_conn_hdl else { continue };
                if !device_counted {
                    num_of_devices += 1;
                    device_counted = true;
                }
                let ase_allocation =
                    ase.codec_config.audio_channel_allocation.unwrap_or(AudioLocations::empty());
                streams.push((cis_conn_hdl, ase_allocation));
                allocation |= ase_allocation;
                num_of_channels += ase.codec_config.channel_count;
                sample_freq_hz = ase.codec_config.sampling_frequency_hz();
                frame_duration_us = ase.codec_config.frame_duration_us();
                octets_per_frame = ase.codec_config.octets_per_codec_frame.unwrap_or(0);
                blocks_per_sdu = ase.codec_config.codec_frame_blocks_per_sdu.unwrap_or(1);
            }
        }

        if streams.is_empty() {
            return false;
        }

        match direction {
            Direction::Sink => {
                self.stream_conf.sink_streams = streams;
                self.stream_conf.sink_num_of_devices = num_of_devices;
                self.stream_conf.sink_num_of_channels = num_of_channels;
                self.stream_conf.sink_sample_frequency_hz = sample_freq_hz;
                self.stream_conf.sink_frame_duration_us = frame_duration_us;
                self.stream_conf.sink_octets_per_codec_frame = octets_per_frame;
                self.stream_conf.sink_codec_frames_blocks_per_sdu = blocks_per_sdu;
                self.stream_conf.sink_audio_channel_allocation = allocation;
            }
            Direction::Source => {
                self.stream_conf.source_streams = streams;
                self.stream_conf.source_num_of_devices = num_of_devices;
                self.stream_conf.source_num_of_channels = num_of_channels;
                self.stream_conf.source_sample_frequency_hz = sample_freq_hz;
                self.stream_conf.source_frame_duration_us = frame_duration_us;
                self.stream_conf.source_octets_per_codec_frame = octets_per_frame;
                self.stream_conf.source_codec_frames_blocks_per_sdu = blocks_per_sdu;
                self.stream_conf.source_audio_channel_allocation = allocation;
            }
        }
        true
    }

    pub fn dump(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "  group {}: state {:?} target {:?} cig_created {} pending_conf {} contexts {:?}",
            self.group_id,
            self.current_state,
            self.target_state,
            self.cig_created,
            self.pending_configuration,
            self.active_contexts,
        );
        for device in &self.devices {
            device.borrow().dump(out);
        }
    }
}

/// All groups, keyed by group id.
#[derive(Default)]
pub struct LeAudioDeviceGroups {
    groups: Vec<LeAudioDeviceGroup>,
}

impl LeAudioDeviceGroups {
    pub fn add(&mut self, group_id: GroupId) -> Option<&mut LeAudioDeviceGroup> {
        if self.find_by_id(group_id).is_some() {
            return None;
        }
        self.groups.push(LeAudioDeviceGroup::new(group_id));
        self.groups.last_mut()
    }

    pub fn remove(&mut self, group_id: GroupId) {
        self.groups.retain(|group| group.group_id != group_id);
    }

    pub fn find_by_id(&self, group_id: GroupId) -> Option<&LeAudioDeviceGroup> {
        self.groups.iter().find(|group| group.group_id == group_id)
    }

    pub fn find_by_id_mut(&mut self, group_id: GroupId) -> Option<&mut LeAudioDeviceGroup> {
        self.groups.iter_mut().find(|group| group.group_id == group_id)
    }

    pub fn is_any_in_transition(&self) -> bool {
        self.groups.iter().any(|group| group.is_in_transition())
    }

    pub fn clear(&mut self) {
        self.groups.clear();
    }

    pub fn dump(&self, out: &mut String) {
        for group in &self.groups {
            group.dump(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LeAudioDevices;
    use crate::pacs::{CodecCapabilities, PacRecord};
    use crate::types::Address;

    fn stereo_member(
        devices: &mut LeAudioDevices,
        addr_lsb: u8,
        locations: AudioLocations,
    ) -> DeviceRef {
        let device = devices.add(Address([addr_lsb, 0, 0, 0, 0, 0]), true);
        {
            let mut d = device.borrow_mut();
            d.conn_id = addr_lsb as u16;
            d.snk_audio_locations = locations;
            d.audio_directions = Directions::SINK;
            d.snk_pacs = vec![(
                crate::device::HandlePair { val: 0x10, ccc: Some(0x11) },
                vec![PacRecord {
                    codec_id: crate::types::CODEC_ID_LC3,
                    capabilities: CodecCapabilities {
                        supported_sampling_frequencies: 0xffff,
                        supported_frame_durations: 0xff,
                        audio_channel_counts: Some(0x01),
                        octets_per_codec_frame: Some((26, 120)),
                        max_codec_frames_per_sdu: None,
                    },
                    metadata: vec![],
                }],
            )];
            d.add_ase(0x20, 0x21, Direction::Sink);
            d.snk_available_contexts = AudioContexts::MEDIA | AudioContexts::CONVERSATIONAL;
        }
        device
    }

    #[test]
    fn duplicate_members_are_rejected() {
        let mut devices = LeAudioDevices::default();
        let device = stereo_member(&mut devices, 1, AudioLocations::FRONT_LEFT);
        let mut group = LeAudioDeviceGroup::new(1);
        assert!(group.add_node(device.clone()));
        assert!(!group.add_node(device));
        assert_eq!(group.size(), 1);
    }

    #[test]
    fn locations_aggregate_as_or_of_members() {
        let mut devices = LeAudioDevices::default();
        let left = stereo_member(&mut devices, 1, AudioLocations::FRONT_LEFT);
        let right = stereo_member(&mut devices, 2, AudioLocations::FRONT_RIGHT);
        let mut group = LeAudioDeviceGroup::new(1);
        group.add_node(left);
        group.add_node(right);

        assert!(group.reload_audio_locations());
        assert_eq!(
            group.snk_audio_locations,
            AudioLocations::FRONT_LEFT | AudioLocations::FRONT_RIGHT
        );
        assert!(!group.reload_audio_locations());
    }

    #[test]
    fn active_contexts_follow_members() {
        let mut devices = LeAudioDevices::default();
        let member = stereo_member(&mut devices, 1, AudioLocations::FRONT_LEFT);
        let mut group = LeAudioDeviceGroup::new(1);
        group.add_node(member.clone());

        assert_eq!(
            group.update_active_contexts_map(),
            Some(AudioContexts::MEDIA | AudioContexts::CONVERSATIONAL)
        );
        assert_eq!(group.update_active_contexts_map(), None);

        member
            .borrow_mut()
            .set_available_contexts(AudioContexts::MEDIA, AudioContexts::empty());
        assert_eq!(group.update_active_contexts_map(), Some(AudioContexts::MEDIA));
    }

    #[test]
    fn stereo_pair_selects_two_device_configuration() {
        let mut devices = LeAudioDevices::default();
        let left = stereo_member(&mut devices, 1, AudioLocations::FRONT_LEFT);
        let right = stereo_member(&mut devices, 2, AudioLocations::FRONT_RIGHT);
        let mut group = LeAudioDeviceGroup::new(1);
        group.add_node(left);
        group.add_node(right);

        let conf = group.find_first_supported_configuration(LeAudioContextType::Media).unwrap();
        assert_eq!(conf.num_of_devices(), 2);
        assert_eq!(conf.confs[0].octets_per_codec_frame, 100);
    }

    #[test]
    fn single_mono_device_falls_back() {
        let mut devices = LeAudioDevices::default();
        let solo = stereo_member(
            &mut devices,
            1,
            AudioLocations::FRONT_LEFT | AudioLocations::FRONT_RIGHT,
        );
        let mut group = LeAudioDeviceGroup::new(1);
        group.add_node(solo);

        // One-channel PACs cannot take the two-channel layout.
        let conf = group.find_first_supported_configuration(LeAudioContextType::Media).unwrap();
        assert_eq!(conf.name, "One-OneChan-SnkAse-Lc3_48_2");

        let pcm = group
            .codec_configuration_by_direction(LeAudioContextType::Media, Direction::Sink)
            .unwrap();
        assert_eq!(pcm.num_channels, 1);
        assert_eq!(pcm.sample_rate, 48000);
        assert_eq!(pcm.data_interval_us, 10000);
        assert!(group
            .codec_configuration_by_direction(LeAudioContextType::Media, Direction::Source)
            .is_none());
    }

    #[test]
    fn minimum_state_tracks_least_advanced_member() {
        let mut devices = LeAudioDevices::default();
        let left = stereo_member(&mut devices, 1, AudioLocations::FRONT_LEFT);
        let right = stereo_member(&mut devices, 2, AudioLocations::FRONT_RIGHT);
        let mut group = LeAudioDeviceGroup::new(1);
        group.add_node(left.clone());
        group.add_node(right.clone());

        left.borrow_mut().ases[0].active = true;
        right.borrow_mut().ases[0].active = true;
        left.borrow_mut().ases[0].state = AseState::Streaming;
        right.borrow_mut().ases[0].state = AseState::Enabling;

        assert_eq!(group.minimum_active_ase_state(), Some(AseState::Enabling));
        assert!(!group.all_active_ases_in_state(AseState::Streaming));

        right.borrow_mut().ases[0].state = AseState::Streaming;
        assert!(group.all_active_ases_in_state(AseState::Streaming));
    }
}
