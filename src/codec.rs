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

//! Codec engine: LC3 encoder/decoder lifecycles, channel split and mix
//! between the framework PCM format and the CIS streams, and packet loss
//! concealment on the uplink.

use crate::group::StreamConfiguration;
use crate::lc3::{Lc3, Lc3Decoder, Lc3Encoder};
use crate::types::{AudioLocations, LeAudioCodecConfiguration};
use log::{error, info, warn};
use std::rc::Rc;

pub struct CodecEngine {
    lc3: Rc<dyn Lc3>,

    encoder_left: Option<Box<dyn Lc3Encoder>>,
    encoder_right: Option<Box<dyn Lc3Encoder>>,
    decoder_left: Option<Box<dyn Lc3Decoder>>,
    decoder_right: Option<Box<dyn Lc3Decoder>>,

    cached_channel_data: Vec<i16>,
    cached_channel_timestamp: u32,
    cached_channel_is_left: bool,
}

impl CodecEngine {
    pub fn new(lc3: Rc<dyn Lc3>) -> Self {
        Self {
            lc3,
            encoder_left: None,
            encoder_right: None,
            decoder_left: None,
            decoder_right: None,
            cached_channel_data: Vec::new(),
            cached_channel_timestamp: 0,
            cached_channel_is_left: false,
        }
    }

    pub fn setup_encoders(&mut self, dt_us: u32, sr_hz: u32, af_hz: u32) -> bool {
        if self.encoder_left.is_some() {
            warn!("Encoder instances should have been released already");
        }
        self.encoder_left = self.lc3.new_encoder(dt_us, sr_hz, af_hz);
        self.encoder_right = self.lc3.new_encoder(dt_us, sr_hz, af_hz);
        self.encoder_left.is_some() && self.encoder_right.is_some()
    }

    pub fn setup_decoders(&mut self, dt_us: u32, sr_hz: u32, af_hz: u32) -> bool {
        if self.decoder_left.is_some() {
            warn!("Decoder instances should have been released already");
        }
        self.clean_cached_channel();
        self.decoder_left = self.lc3.new_decoder(dt_us, sr_hz, af_hz);
        self.decoder_right = self.lc3.new_decoder(dt_us, sr_hz, af_hz);
        self.decoder_left.is_some() && self.decoder_right.is_some()
    }

    pub fn release_all(&mut self) {
        self.encoder_left = None;
        self.encoder_right = None;
        self.decoder_left = None;
        self.decoder_right = None;
        self.clean_cached_channel();
    }

    pub fn has_encoders(&self) -> bool {
        self.encoder_left.is_some()
    }

    pub fn has_decoders(&self) -> bool {
        self.decoder_left.is_some()
    }

    fn clean_cached_channel(&mut self) {
        self.cached_channel_data.clear();
        self.cached_channel_timestamp = 0;
        self.cached_channel_is_left = false;
    }

    /// Encode one framework PCM delivery into per-CIS SDUs.
    pub fn encode_downlink(
        &mut self,
        pcm: &[u8],
        stream_conf: &StreamConfiguration,
        af_config: &LeAudioCodecConfiguration,
    ) -> Vec<(u16, Vec<u8>)> {
        let dt_us = af_config.data_interval_us;
        let af_hz = af_config.sample_rate;
        let Some(samples_per_channel) = self.lc3.frame_samples(dt_us, af_hz) else {
            error!("No frame size for interval {} us at {} Hz", dt_us, af_hz);
            return vec![];
        };

        if stream_conf.sink_num_of_devices == 2 {
            self.encode_for_two_devices(pcm, stream_conf, samples_per_channel)
        } else {
            self.encode_for_single_device(pcm, stream_conf, samples_per_channel)
        }
    }

    fn encode_for_two_devices(
        &mut self,
        pcm: &[u8],
        stream_conf: &StreamConfiguration,
        samples_per_channel: usize,
    ) -> Vec<(u16, Vec<u8>)> {
        let byte_count = stream_conf.sink_octets_per_codec_frame as usize;
        let (left_cis_handle, right_cis_handle) = sided_handles(&stream_conf.sink_streams);

        if pcm.len() < 2 * 2 * samples_per_channel {
            error!("Missing samples: got {} bytes, expected {}", pcm.len(), 4 * samples_per_channel);
            return vec![];
        }
        let samples = pcm_to_samples(pcm);

        let mut out = Vec::new();
        let mono = left_cis_handle.is_none() || right_cis_handle.is_none();
        if !mono {
            let mut left = vec![0u8; byte_count];
            let mut right = vec![0u8; byte_count];
            if let Some(encoder) = &mut self.encoder_left {
                if let Err(e) = encoder.encode(&samples, 2, &mut left) {
                    error!("Encoding failed: {}", e);
                }
            }
            if let Some(encoder) = &mut self.encoder_right {
                if let Err(e) = encoder.encode(&samples[1..], 2, &mut right) {
                    error!("Encoding failed: {}", e);
                }
            }
            out.push((left_cis_handle.unwrap(), left));
            out.push((right_cis_handle.unwrap(), right));
        } else {
            let mono_samples = downmix_to_mono(&samples, samples_per_channel);
            for (handle, encoder) in [
                (left_cis_handle, &mut self.encoder_left),
                (right_cis_handle, &mut self.encoder_right),
            ] {
                let (Some(handle), Some(encoder)) = (handle, encoder.as_mut()) else { continue };
                let mut sdu = vec![0u8; byte_count];
                if let Err(e) = encoder.encode(&mono_samples, 1, &mut sdu) {
                    error!("Encoding failed: {}", e);
                }
                out.push((handle, sdu));
            }
        }
        out
    }

    fn encode_for_single_device(
        &mut self,
        pcm: &[u8],
        stream_conf: &StreamConfiguration,
        samples_per_channel: usize,
    ) -> Vec<(u16, Vec<u8>)> {
        let num_channels = stream_conf.sink_num_of_channels as usize;
        let byte_count = stream_conf.sink_octets_per_codec_frame as usize;
        let Some((cis_handle, _)) = stream_conf.sink_streams.first() else {
            error!("Stream configuration carries no sink stream");
            return vec![];
        };

        if pcm.len() < 2 * num_channels.max(1) * samples_per_channel {
            error!("Missing samples: got {} bytes", pcm.len());
            return vec![];
        }
        let samples = pcm_to_samples(pcm);

        let mut sdu = vec![0u8; num_channels * byte_count];
        if num_channels == 1 {
            let mono_samples = downmix_to_mono(&samples, samples_per_channel);
            if let Some(encoder) = &mut self.encoder_left {
                if let Err(e) = encoder.encode(&mono_samples, 1, &mut sdu) {
                    error!("Encoding failed: {}", e);
                }
            }
        } else {
            let (first, second) = sdu.split_at_mut(byte_count);
            if let Some(encoder) = &mut self.encoder_left {
                if let Err(e) = encoder.encode(&samples, 2, first) {
                    error!("Encoding failed: {}", e);
                }
            }
            if let Some(encoder) = &mut self.encoder_right {
                if let Err(e) = encoder.encode(&samples[1..], 2, second) {
                    error!("Encoding failed: {}", e);
                }
            }
        }
        vec![(*cis_handle, sdu)]
    }

    /// Decode one uplink SDU; `Some(bytes)` is a PCM delivery for the
    /// framework, `None` means the frame was cached awaiting its sibling
    /// channel or dropped.
    pub fn decode_uplink(
        &mut self,
        data: &[u8],
        cis_conn_hdl: u16,
        timestamp: u32,
        stream_conf: &StreamConfiguration,
        af_config: &LeAudioCodecConfiguration,
    ) -> Option<Vec<u8>> {
        let (left_cis_handle, right_cis_handle) = sided_handles(&stream_conf.source_streams);

        let is_left = if Some(cis_conn_hdl) == left_cis_handle {
            true
        } else if Some(cis_conn_hdl) == right_cis_handle {
            false
        } else {
            error!("Received data for unknown handle {:#06x}", cis_conn_hdl);
            return None;
        };

        let pcm_size =
            decoder_pcm_size(stream_conf.source_frame_duration_us, af_config.sample_rate)?;
        let mut pcm = vec![0i16; pcm_size];

        let expected = stream_conf.source_octets_per_codec_frame as usize;
        let frame = if data.len() == expected && expected != 0 {
            Some(data)
        } else {
            info!("Expected {} octets, received {}, doing PLC", expected, data.len());
            None
        };

        let decoder =
            if is_left { self.decoder_left.as_mut() } else { self.decoder_right.as_mut() };
        match decoder {
            Some(decoder) => {
                if let Err(e) = decoder.decode(frame, &mut pcm) {
                    error!("Decoding failed: {}", e);
                    return None;
                }
            }
            None => return None,
        }

        let af_is_stereo = af_config.num_channels == 2;

        if left_cis_handle.is_none() || right_cis_handle.is_none() {
            return Some(mix_to_framework(Some(&pcm), None, false, af_is_stereo));
        }

        if self.cached_channel_data.is_empty() && self.cached_channel_timestamp == 0 {
            self.cached_channel_data = pcm;
            self.cached_channel_timestamp = timestamp;
            self.cached_channel_is_left = is_left;
            return None;
        }

        if self.cached_channel_is_left != is_left {
            if timestamp == self.cached_channel_timestamp {
                let cached = std::mem::take(&mut self.cached_channel_data);
                let (left, right) =
                    if is_left { (&pcm, &cached) } else { (&cached, &pcm) };
                let out =
                    mix_to_framework(Some(left), Some(right), true, af_is_stereo);
                self.clean_cached_channel();
                return Some(out);
            }

            // The second channel ran ahead; flush what we held and cache it.
            let out = self.flush_cached_channel(af_is_stereo);
            self.cached_channel_data = pcm;
            self.cached_channel_timestamp = timestamp;
            self.cached_channel_is_left = is_left;
            return out;
        }

        // Same channel again; its sibling is down or not sending.
        let out = self.flush_cached_channel(af_is_stereo);
        self.cached_channel_data = pcm;
        self.cached_channel_timestamp = timestamp;
        self.cached_channel_is_left = is_left;
        out
    }

    fn flush_cached_channel(&mut self, af_is_stereo: bool) -> Option<Vec<u8>> {
        if self.cached_channel_data.is_empty() {
            return None;
        }
        let cached = std::mem::take(&mut self.cached_channel_data);
        Some(mix_to_framework(Some(&cached), None, false, af_is_stereo))
    }
}

/// Left/right CIS handles of a stream list, by channel allocation side.
fn sided_handles(streams: &[(u16, AudioLocations)]) -> (Option<u16>, Option<u16>) {
    let mut left = None;
    let mut right = None;
    for (handle, allocation) in streams {
        if allocation.intersects(AudioLocations::any_left()) {
            left = Some(*handle);
        }
        if allocation.intersects(AudioLocations::any_right()) {
            right = Some(*handle);
        }
    }
    (left, right)
}

/// Decoder PCM buffer length in samples for a frame interval at a framework
/// rate; `None` for intervals the stream cannot carry.
pub fn decoder_pcm_size(dt_us: u32, af_hz: u32) -> Option<usize> {
    match dt_us {
        10000 => Some(if af_hz == 44100 { 480 } else { af_hz as usize / 100 }),
        7500 => Some(if af_hz == 44100 { 360 } else { af_hz as usize * 3 / 400 }),
        _ => {
            error!("Invalid frame interval: {} us", dt_us);
            None
        }
    }
}

fn pcm_to_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect()
}

/// Mean of the interleaved channels, each pre-shifted one bit so the sum
/// cannot overflow.
fn downmix_to_mono(samples: &[i16], samples_per_channel: usize) -> Vec<i16> {
    let mut mono = Vec::with_capacity(samples_per_channel);
    for frame in samples.chunks_exact(2).take(samples_per_channel) {
        mono.push((frame[0] >> 1) + (frame[1] >> 1));
    }
    mono
}

/// Adapt decoded channels to the framework layout. The four cases:
/// passthrough, average to mono, duplicate mono to stereo, interleave.
fn mix_to_framework(
    left: Option<&[i16]>,
    right: Option<&[i16]>,
    bt_is_stereo: bool,
    af_is_stereo: bool,
) -> Vec<u8> {
    let mut out: Vec<i16>;
    match (bt_is_stereo, af_is_stereo) {
        (false, false) => {
            out = left.or(right).unwrap_or(&[]).to_vec();
        }
        (true, true) => {
            let (left, right) = (left.unwrap(), right.unwrap());
            out = Vec::with_capacity(left.len() * 2);
            for i in 0..left.len() {
                out.push(left[i]);
                out.push(right[i]);
            }
        }
        (true, false) => {
            let (left, right) = (left.unwrap(), right.unwrap());
            out = (0..left.len())
                .map(|i| ((left[i] as i32 + right[i] as i32) / 2) as i16)
                .collect();
        }
        (false, true) => {
            let mono = left.or(right).unwrap_or(&[]);
            out = Vec::with_capacity(mono.len() * 2);
            for sample in mono {
                out.push(*sample);
                out.push(*sample);
            }
        }
    }
    samples_to_pcm(&out)
}

fn samples_to_pcm(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}
