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

//! Published Audio Capabilities Service values: PAC records, audio
//! locations and the context bitmaps.

use crate::packet::{ltv_entries, Reader, Writer};
use crate::types::{codec_spec, AudioContexts, AudioLocations, CodecId};

/// One Published Audio Capabilities record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacRecord {
    pub codec_id: CodecId,
    pub capabilities: CodecCapabilities,
    /// Raw metadata LTVs, forwarded untouched.
    pub metadata: Vec<u8>,
}

/// Codec capabilities advertised in a PAC record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodecCapabilities {
    /// Bitmask, one bit per sampling-frequency code.
    pub supported_sampling_frequencies: u16,
    /// Bitmask, one bit per frame-duration code.
    pub supported_frame_durations: u8,
    /// Bitmask of supported channel counts; absent means one channel.
    pub audio_channel_counts: Option<u8>,
    pub octets_per_codec_frame: Option<(u16, u16)>,
    pub max_codec_frames_per_sdu: Option<u8>,
}

impl CodecCapabilities {
    /// Whether one codec frame of the given shape fits these capabilities.
    pub fn supports(
        &self,
        sampling_frequency: u8,
        frame_duration: u8,
        octets_per_frame: u16,
        channel_count: u8,
    ) -> bool {
        if self.supported_sampling_frequencies
            & codec_spec::sampling_freq_capability_bit(sampling_frequency)
            == 0
        {
            return false;
        }
        if self.supported_frame_durations
            & codec_spec::frame_duration_capability_bit(frame_duration)
            == 0
        {
            return false;
        }
        if let Some((min, max)) = self.octets_per_codec_frame {
            if octets_per_frame < min || octets_per_frame > max {
                return false;
            }
        }
        let counts = self.audio_channel_counts.unwrap_or(0x01);
        counts & (1 << (channel_count - 1)) != 0
    }
}

fn parse_codec_id(r: &mut Reader) -> Option<CodecId> {
    Some(CodecId {
        coding_format: r.read_u8()?,
        company_id: r.read_u16()?,
        vendor_id: r.read_u16()?,
    })
}

fn write_codec_id(w: &mut Writer, id: &CodecId) {
    w.write_u8(id.coding_format);
    w.write_u16(id.company_id);
    w.write_u16(id.vendor_id);
}

/// Parse a Sink or Source PAC characteristic value.
pub fn parse_pac(data: &[u8]) -> Option<Vec<PacRecord>> {
    let mut r = Reader::new(data);
    let num_records = r.read_u8()? as usize;
    let mut records = Vec::with_capacity(num_records);

    for _ in 0..num_records {
        let codec_id = parse_codec_id(&mut r)?;

        let caps_len = r.read_u8()? as usize;
        let mut capabilities = CodecCapabilities::default();
        for (entry_type, value) in ltv_entries(r.get(caps_len)?)? {
            let mut v = Reader::new(value);
            match entry_type {
                codec_spec::CAPS_TYPE_SUPPORTED_SAMPLING_FREQUENCIES => {
                    capabilities.supported_sampling_frequencies = v.read_u16()?;
                }
                codec_spec::CAPS_TYPE_SUPPORTED_FRAME_DURATIONS => {
                    capabilities.supported_frame_durations = v.read_u8()?;
                }
                codec_spec::CAPS_TYPE_AUDIO_CHANNEL_COUNTS => {
                    capabilities.audio_channel_counts = Some(v.read_u8()?);
                }
                codec_spec::CAPS_TYPE_SUPPORTED_OCTETS_PER_CODEC_FRAME => {
                    capabilities.octets_per_codec_frame = Some((v.read_u16()?, v.read_u16()?));
                }
                codec_spec::CAPS_TYPE_MAX_CODEC_FRAMES_PER_SDU => {
                    capabilities.max_codec_frames_per_sdu = Some(v.read_u8()?);
                }
                _ => (),
            }
        }

        let metadata_len = r.read_u8()? as usize;
        let metadata = Vec::from(r.get(metadata_len)?);

        records.push(PacRecord { codec_id, capabilities, metadata });
    }

    Some(records)
}

/// Serialize PAC records back into the characteristic wire form.
pub fn serialize_pac(records: &[PacRecord]) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_u8(records.len() as u8);

    for record in records {
        write_codec_id(&mut w, &record.codec_id);

        let caps_len_pos = w.len();
        w.write_u8(0);
        let caps = &record.capabilities;
        w.write_u8(3);
        w.write_u8(codec_spec::CAPS_TYPE_SUPPORTED_SAMPLING_FREQUENCIES);
        w.write_u16(caps.supported_sampling_frequencies);
        w.write_u8(2);
        w.write_u8(codec_spec::CAPS_TYPE_SUPPORTED_FRAME_DURATIONS);
        w.write_u8(caps.supported_frame_durations);
        if let Some(counts) = caps.audio_channel_counts {
            w.write_u8(2);
            w.write_u8(codec_spec::CAPS_TYPE_AUDIO_CHANNEL_COUNTS);
            w.write_u8(counts);
        }
        if let Some((min, max)) = caps.octets_per_codec_frame {
            w.write_u8(5);
            w.write_u8(codec_spec::CAPS_TYPE_SUPPORTED_OCTETS_PER_CODEC_FRAME);
            w.write_u16(min);
            w.write_u16(max);
        }
        if let Some(frames) = caps.max_codec_frames_per_sdu {
            w.write_u8(2);
            w.write_u8(codec_spec::CAPS_TYPE_MAX_CODEC_FRAMES_PER_SDU);
            w.write_u8(frames);
        }
        let caps_len = (w.len() - caps_len_pos - 1) as u8;
        w.set_u8(caps_len_pos, caps_len);

        w.write_u8(record.metadata.len() as u8);
        w.put(&record.metadata);
    }

    w.into_vec()
}

/// Parse a Sink or Source Audio Locations characteristic value.
pub fn parse_audio_locations(data: &[u8]) -> Option<AudioLocations> {
    let mut r = Reader::new(data);
    Some(AudioLocations::from_bits_retain(r.read_u32()?))
}

/// Parse the Available or Supported Audio Contexts value into its
/// (sink, source) bitmap pair.
pub fn parse_contexts(data: &[u8]) -> Option<(AudioContexts, AudioContexts)> {
    let mut r = Reader::new(data);
    let sink = AudioContexts::from_bits_truncate(r.read_u16()?);
    let source = AudioContexts::from_bits_truncate(r.read_u16()?);
    Some((sink, source))
}
