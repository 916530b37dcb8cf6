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

//! Audio Stream Control Service values: ASE state notifications, control
//! point notifications, and the control point operations this client writes.

use crate::packet::{ltv_entries, Reader, Writer};
use crate::types::{codec_spec, AseCodecConfiguration, AseState, AudioContexts, AudioLocations, CodecId};
use num_traits::FromPrimitive;

pub const OPCODE_CONFIG_CODEC: u8 = 0x01;
pub const OPCODE_CONFIG_QOS: u8 = 0x02;
pub const OPCODE_ENABLE: u8 = 0x03;
pub const OPCODE_RECEIVER_START_READY: u8 = 0x04;
pub const OPCODE_DISABLE: u8 = 0x05;
pub const OPCODE_RECEIVER_STOP_READY: u8 = 0x06;
pub const OPCODE_UPDATE_METADATA: u8 = 0x07;
pub const OPCODE_RELEASE: u8 = 0x08;

pub const RESPONSE_CODE_SUCCESS: u8 = 0x00;
pub const RESPONSE_CODE_INVALID_CONFIGURATION_PARAMETER_VALUE: u8 = 0x09;

pub const REASON_NONE: u8 = 0x00;
pub const REASON_INVALID_ASE_CIS_MAPPING: u8 = 0x0a;

/// One ASE state notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AseStateNotification {
    pub ase_id: u8,
    pub state: AseState,
    pub params: AseParams,
}

/// State-specific body of an ASE notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AseParams {
    None,
    CodecConfigured(CodecConfiguredParams),
    QosConfigured(QosConfiguredParams),
    Metadata(MetadataParams),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecConfiguredParams {
    pub framing: u8,
    pub preferred_phy: u8,
    pub preferred_retrans_nb: u8,
    pub max_transport_latency: u16,
    pub pres_delay_min: u32,
    pub pres_delay_max: u32,
    pub preferred_pres_delay_min: u32,
    pub preferred_pres_delay_max: u32,
    pub codec_id: CodecId,
    pub codec_config: AseCodecConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosConfiguredParams {
    pub cig_id: u8,
    pub cis_id: u8,
    pub sdu_interval: u32,
    pub framing: u8,
    pub phy: u8,
    pub max_sdu: u16,
    pub retrans_nb: u8,
    pub max_transport_latency: u16,
    pub pres_delay: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataParams {
    pub cig_id: u8,
    pub cis_id: u8,
    pub metadata: Vec<u8>,
}

/// Parse a Codec Specific Configuration LTV block.
pub fn parse_codec_spec_conf(data: &[u8]) -> Option<AseCodecConfiguration> {
    let mut config = AseCodecConfiguration::default();
    for (entry_type, value) in ltv_entries(data)? {
        let mut v = Reader::new(value);
        match entry_type {
            codec_spec::TYPE_SAMPLING_FREQUENCY => config.sampling_frequency = v.read_u8()?,
            codec_spec::TYPE_FRAME_DURATION => config.frame_duration = v.read_u8()?,
            codec_spec::TYPE_AUDIO_CHANNEL_ALLOCATION => {
                config.audio_channel_allocation =
                    Some(AudioLocations::from_bits_retain(v.read_u32()?));
            }
            codec_spec::TYPE_OCTETS_PER_CODEC_FRAME => {
                config.octets_per_codec_frame = Some(v.read_u16()?);
            }
            codec_spec::TYPE_CODEC_FRAME_BLOCKS_PER_SDU => {
                config.codec_frame_blocks_per_sdu = Some(v.read_u8()?);
            }
            _ => (),
        }
    }
    config.channel_count = match config.audio_channel_allocation {
        Some(allocation) if !allocation.is_empty() => allocation.bits().count_ones() as u8,
        _ => 1,
    };
    Some(config)
}

fn write_codec_spec_conf(w: &mut Writer, config: &AseCodecConfiguration) {
    w.write_u8(2);
    w.write_u8(codec_spec::TYPE_SAMPLING_FREQUENCY);
    w.write_u8(config.sampling_frequency);
    w.write_u8(2);
    w.write_u8(codec_spec::TYPE_FRAME_DURATION);
    w.write_u8(config.frame_duration);
    if let Some(allocation) = config.audio_channel_allocation {
        w.write_u8(5);
        w.write_u8(codec_spec::TYPE_AUDIO_CHANNEL_ALLOCATION);
        w.write_u32(allocation.bits());
    }
    if let Some(octets) = config.octets_per_codec_frame {
        w.write_u8(3);
        w.write_u8(codec_spec::TYPE_OCTETS_PER_CODEC_FRAME);
        w.write_u16(octets);
    }
    if let Some(blocks) = config.codec_frame_blocks_per_sdu {
        w.write_u8(2);
        w.write_u8(codec_spec::TYPE_CODEC_FRAME_BLOCKS_PER_SDU);
        w.write_u8(blocks);
    }
}

/// Parse an ASE characteristic notification.
pub fn parse_ase_notification(data: &[u8]) -> Option<AseStateNotification> {
    let mut r = Reader::new(data);
    let ase_id = r.read_u8()?;
    let state = AseState::from_u8(r.read_u8()?)?;

    let params = match state {
        AseState::Idle | AseState::Releasing => AseParams::None,
        AseState::CodecConfigured => {
            let framing = r.read_u8()?;
            let preferred_phy = r.read_u8()?;
            let preferred_retrans_nb = r.read_u8()?;
            let max_transport_latency = r.read_u16()?;
            let pres_delay_min = r.read_u24()?;
            let pres_delay_max = r.read_u24()?;
            let preferred_pres_delay_min = r.read_u24()?;
            let preferred_pres_delay_max = r.read_u24()?;
            let codec_id = CodecId {
                coding_format: r.read_u8()?,
                company_id: r.read_u16()?,
                vendor_id: r.read_u16()?,
            };
            let conf_len = r.read_u8()? as usize;
            let codec_config = parse_codec_spec_conf(r.get(conf_len)?)?;
            AseParams::CodecConfigured(CodecConfiguredParams {
                framing,
                preferred_phy,
                preferred_retrans_nb,
                max_transport_latency,
                pres_delay_min,
                pres_delay_max,
                preferred_pres_delay_min,
                preferred_pres_delay_max,
                codec_id,
                codec_config,
            })
        }
        AseState::QosConfigured => AseParams::QosConfigured(QosConfiguredParams {
            cig_id: r.read_u8()?,
            cis_id: r.read_u8()?,
            sdu_interval: r.read_u24()?,
            framing: r.read_u8()?,
            phy: r.read_u8()?,
            max_sdu: r.read_u16()?,
            retrans_nb: r.read_u8()?,
            max_transport_latency: r.read_u16()?,
            pres_delay: r.read_u24()?,
        }),
        AseState::Enabling | AseState::Streaming | AseState::Disabling => {
            let cig_id = r.read_u8()?;
            let cis_id = r.read_u8()?;
            let metadata_len = r.read_u8()? as usize;
            let metadata = Vec::from(r.get(metadata_len)?);
            AseParams::Metadata(MetadataParams { cig_id, cis_id, metadata })
        }
    };

    Some(AseStateNotification { ase_id, state, params })
}

/// One entry of a control point notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtpEntry {
    pub ase_id: u8,
    pub response_code: u8,
    pub reason: u8,
}

/// Parsed ASE Control Point notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtpNotification {
    pub opcode: u8,
    pub entries: Vec<CtpEntry>,
}

/// Parse an ASE Control Point notification.
pub fn parse_ctp_notification(data: &[u8]) -> Option<CtpNotification> {
    let mut r = Reader::new(data);
    let opcode = r.read_u8()?;
    let num_entries = r.read_u8()? as usize;
    let mut entries = Vec::with_capacity(num_entries);
    for _ in 0..num_entries {
        entries.push(CtpEntry {
            ase_id: r.read_u8()?,
            response_code: r.read_u8()?,
            reason: r.read_u8()?,
        });
    }
    Some(CtpNotification { opcode, entries })
}

/// One ASE of a Config Codec operation.
#[derive(Debug, Clone)]
pub struct ConfigCodecEntry {
    pub ase_id: u8,
    pub target_latency: u8,
    pub target_phy: u8,
    pub codec_id: CodecId,
    pub config: AseCodecConfiguration,
}

/// One ASE of a Config QoS operation.
#[derive(Debug, Clone)]
pub struct ConfigQosEntry {
    pub ase_id: u8,
    pub cig_id: u8,
    pub cis_id: u8,
    pub sdu_interval: u32,
    pub framing: u8,
    pub phy: u8,
    pub max_sdu: u16,
    pub retrans_nb: u8,
    pub max_transport_latency: u16,
    pub pres_delay: u32,
}

pub fn serialize_config_codec(entries: &[ConfigCodecEntry]) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u8(OPCODE_CONFIG_CODEC);
    w.write_u8(entries.len() as u8);
    for entry in entries {
        w.write_u8(entry.ase_id);
        w.write_u8(entry.target_latency);
        w.write_u8(entry.target_phy);
        w.write_u8(entry.codec_id.coding_format);
        w.write_u16(entry.codec_id.company_id);
        w.write_u16(entry.codec_id.vendor_id);
        let conf_len_pos = w.len();
        w.write_u8(0);
        write_codec_spec_conf(&mut w, &entry.config);
        let conf_len = (w.len() - conf_len_pos - 1) as u8;
        w.set_u8(conf_len_pos, conf_len);
    }
    w.into_vec()
}

pub fn serialize_config_qos(entries: &[ConfigQosEntry]) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u8(OPCODE_CONFIG_QOS);
    w.write_u8(entries.len() as u8);
    for entry in entries {
        w.write_u8(entry.ase_id);
        w.write_u8(entry.cig_id);
        w.write_u8(entry.cis_id);
        w.write_u24(entry.sdu_interval);
        w.write_u8(entry.framing);
        w.write_u8(entry.phy);
        w.write_u16(entry.max_sdu);
        w.write_u8(entry.retrans_nb);
        w.write_u16(entry.max_transport_latency);
        w.write_u24(entry.pres_delay);
    }
    w.into_vec()
}

fn serialize_with_metadata(opcode: u8, entries: &[(u8, AudioContexts)]) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u8(opcode);
    w.write_u8(entries.len() as u8);
    for (ase_id, contexts) in entries {
        w.write_u8(*ase_id);
        w.write_u8(4); // metadata length
        w.write_u8(3);
        w.write_u8(codec_spec::METADATA_TYPE_STREAMING_AUDIO_CONTEXTS);
        w.write_u16(contexts.bits());
    }
    w.into_vec()
}

pub fn serialize_enable(entries: &[(u8, AudioContexts)]) -> Vec<u8> {
    serialize_with_metadata(OPCODE_ENABLE, entries)
}

pub fn serialize_update_metadata(entries: &[(u8, AudioContexts)]) -> Vec<u8> {
    serialize_with_metadata(OPCODE_UPDATE_METADATA, entries)
}

fn serialize_ase_list(opcode: u8, ase_ids: &[u8]) -> Vec<u8> {
    let mut w = Writer::with_capacity(2 + ase_ids.len());
    w.write_u8(opcode);
    w.write_u8(ase_ids.len() as u8);
    w.put(ase_ids);
    w.into_vec()
}

pub fn serialize_receiver_start_ready(ase_ids: &[u8]) -> Vec<u8> {
    serialize_ase_list(OPCODE_RECEIVER_START_READY, ase_ids)
}

pub fn serialize_disable(ase_ids: &[u8]) -> Vec<u8> {
    serialize_ase_list(OPCODE_DISABLE, ase_ids)
}

pub fn serialize_receiver_stop_ready(ase_ids: &[u8]) -> Vec<u8> {
    serialize_ase_list(OPCODE_RECEIVER_STOP_READY, ase_ids)
}

pub fn serialize_release(ase_ids: &[u8]) -> Vec<u8> {
    serialize_ase_list(OPCODE_RELEASE, ase_ids)
}
