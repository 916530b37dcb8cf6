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

//! Audio set configurations: the codec layouts a group may be driven with,
//! per context type, in preference order.

use crate::types::{codec_spec, Direction, LeAudioContextType};

/// Per-direction part of an audio set configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetConfigEntry {
    pub direction: Direction,
    /// Devices expected to serve this entry.
    pub device_cnt: u8,
    /// ASEs activated across those devices.
    pub ase_cnt: u8,
    /// Channels carried by each ASE.
    pub channel_count: u8,
    pub sampling_frequency: u8,
    pub frame_duration: u8,
    pub octets_per_codec_frame: u16,
    pub codec_frame_blocks_per_sdu: u8,
    pub target_latency: u8,
    pub retransmission_number: u8,
    pub max_transport_latency: u16,
}

/// A named codec layout for a whole group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSetConfiguration {
    pub name: &'static str,
    pub confs: Vec<SetConfigEntry>,
}

impl AudioSetConfiguration {
    /// Devices this configuration expects, the larger direction deciding.
    pub fn num_of_devices(&self) -> u8 {
        self.confs.iter().map(|c| c.device_cnt).max().unwrap_or(0)
    }
}

pub const TARGET_LATENCY_BALANCED: u8 = 0x02;

const RTN_MEDIA: u8 = 13;
const RTN_CONVERSATIONAL: u8 = 5;
const MAX_LATENCY_MEDIA_MS: u16 = 100;
const MAX_LATENCY_CONVERSATIONAL_MS: u16 = 10;

fn entry(
    direction: Direction,
    device_cnt: u8,
    ase_cnt: u8,
    channel_count: u8,
    sampling_frequency: u8,
    octets: u16,
    rtn: u8,
    max_latency: u16,
) -> SetConfigEntry {
    SetConfigEntry {
        direction,
        device_cnt,
        ase_cnt,
        channel_count,
        sampling_frequency,
        frame_duration: codec_spec::FRAME_DURATION_10000,
        octets_per_codec_frame: octets,
        codec_frame_blocks_per_sdu: 1,
        target_latency: TARGET_LATENCY_BALANCED,
        retransmission_number: rtn,
        max_transport_latency: max_latency,
    }
}

fn media_sets() -> Vec<AudioSetConfiguration> {
    use Direction::Sink;
    vec![
        AudioSetConfiguration {
            name: "Two-OneChan-SnkAse-Lc3_48_2",
            confs: vec![entry(
                Sink,
                2,
                2,
                1,
                codec_spec::SAMPLING_FREQ_48000,
                100,
                RTN_MEDIA,
                MAX_LATENCY_MEDIA_MS,
            )],
        },
        AudioSetConfiguration {
            name: "One-TwoChan-SnkAse-Lc3_48_2",
            confs: vec![entry(
                Sink,
                1,
                1,
                2,
                codec_spec::SAMPLING_FREQ_48000,
                100,
                RTN_MEDIA,
                MAX_LATENCY_MEDIA_MS,
            )],
        },
        AudioSetConfiguration {
            name: "One-OneChan-SnkAse-Lc3_48_2",
            confs: vec![entry(
                Sink,
                1,
                1,
                1,
                codec_spec::SAMPLING_FREQ_48000,
                100,
                RTN_MEDIA,
                MAX_LATENCY_MEDIA_MS,
            )],
        },
        AudioSetConfiguration {
            name: "Two-OneChan-SnkAse-Lc3_16_2",
            confs: vec![entry(
                Sink,
                2,
                2,
                1,
                codec_spec::SAMPLING_FREQ_16000,
                40,
                RTN_MEDIA,
                MAX_LATENCY_MEDIA_MS,
            )],
        },
        AudioSetConfiguration {
            name: "One-OneChan-SnkAse-Lc3_16_2",
            confs: vec![entry(
                Sink,
                1,
                1,
                1,
                codec_spec::SAMPLING_FREQ_16000,
                40,
                RTN_MEDIA,
                MAX_LATENCY_MEDIA_MS,
            )],
        },
    ]
}

fn conversational_sets() -> Vec<AudioSetConfiguration> {
    use Direction::{Sink, Source};
    vec![
        AudioSetConfiguration {
            name: "Two-OneChan-SnkAse-Lc3_16_2-One-OneChan-SrcAse-Lc3_16_2",
            confs: vec![
                entry(
                    Sink,
                    2,
                    2,
                    1,
                    codec_spec::SAMPLING_FREQ_16000,
                    40,
                    RTN_CONVERSATIONAL,
                    MAX_LATENCY_CONVERSATIONAL_MS,
                ),
                entry(
                    Source,
                    1,
                    1,
                    1,
                    codec_spec::SAMPLING_FREQ_16000,
                    40,
                    RTN_CONVERSATIONAL,
                    MAX_LATENCY_CONVERSATIONAL_MS,
                ),
            ],
        },
        AudioSetConfiguration {
            name: "One-OneChan-SnkAse-Lc3_16_2-One-OneChan-SrcAse-Lc3_16_2",
            confs: vec![
                entry(
                    Sink,
                    1,
                    1,
                    1,
                    codec_spec::SAMPLING_FREQ_16000,
                    40,
                    RTN_CONVERSATIONAL,
                    MAX_LATENCY_CONVERSATIONAL_MS,
                ),
                entry(
                    Source,
                    1,
                    1,
                    1,
                    codec_spec::SAMPLING_FREQ_16000,
                    40,
                    RTN_CONVERSATIONAL,
                    MAX_LATENCY_CONVERSATIONAL_MS,
                ),
            ],
        },
        AudioSetConfiguration {
            name: "One-OneChan-SnkAse-Lc3_16_2",
            confs: vec![entry(
                Sink,
                1,
                1,
                1,
                codec_spec::SAMPLING_FREQ_16000,
                40,
                RTN_CONVERSATIONAL,
                MAX_LATENCY_CONVERSATIONAL_MS,
            )],
        },
    ]
}

/// Configurations usable for a context, most preferred first.
pub fn configurations_for(context: LeAudioContextType) -> Vec<AudioSetConfiguration> {
    match context {
        LeAudioContextType::Conversational => conversational_sets(),
        LeAudioContextType::Media
        | LeAudioContextType::Game
        | LeAudioContextType::Ringtone
        | LeAudioContextType::Notifications
        | LeAudioContextType::Instructional
        | LeAudioContextType::Alerts
        | LeAudioContextType::EmergencyAlarm => media_sets(),
        _ => {
            let mut sets = media_sets();
            sets.extend(conversational_sets());
            sets
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_prefers_stereo_pair_then_single() {
        let sets = configurations_for(LeAudioContextType::Media);
        assert_eq!(sets[0].num_of_devices(), 2);
        assert_eq!(sets[0].confs[0].octets_per_codec_frame, 100);
        assert_eq!(sets[1].num_of_devices(), 1);
        assert_eq!(sets[1].confs[0].channel_count, 2);
    }

    #[test]
    fn conversational_carries_both_directions() {
        let sets = configurations_for(LeAudioContextType::Conversational);
        assert!(sets[0].confs.iter().any(|c| c.direction == Direction::Source));
        assert!(sets[0].confs.iter().any(|c| c.direction == Direction::Sink));
    }
}
