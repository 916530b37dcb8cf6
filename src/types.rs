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

//! Shared types of the LE Audio client: addresses, ASE and stream states,
//! audio contexts and locations, and codec configuration values.

use bitflags::bitflags;
use num_derive::FromPrimitive;
use std::fmt;

/// Public device address, in the over-the-air octet order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address(pub [u8; 6]);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", b[5], b[4], b[3], b[2], b[1], b[0])
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Group identifier assigned by the group-membership module.
pub type GroupId = i32;

/// Marks a device not yet assigned to any group.
pub const GROUP_ID_UNKNOWN: GroupId = -1;

/// Marks a closed attribute connection.
pub const CONN_ID_INVALID: u16 = 0xffff;

/// ASE state, as exposed in the Audio Stream Control Service state
/// notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromPrimitive)]
#[repr(u8)]
pub enum AseState {
    Idle = 0x00,
    CodecConfigured = 0x01,
    QosConfigured = 0x02,
    Enabling = 0x03,
    Streaming = 0x04,
    Disabling = 0x05,
    Releasing = 0x06,
}

/// Data-path progress of a single ASE, from CIS assignment up to an
/// established controller data path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataPathState {
    #[default]
    Idle,
    CisDisconnecting,
    CisAssigned,
    CisPending,
    CisEstablished,
    DataPathEstablished,
}

/// Stream direction, from the server's point of view: a Sink ASE receives
/// audio from this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sink,
    Source,
}

bitflags! {
    /// Direction pair, used where both may be reported at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Directions: u8 {
        const SINK = 0x01;
        const SOURCE = 0x02;
    }
}

impl Direction {
    pub fn as_bitmask(&self) -> Directions {
        match self {
            Direction::Sink => Directions::SINK,
            Direction::Source => Directions::SOURCE,
        }
    }
}

/// Context type of an audio stream, one bit of the context bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum LeAudioContextType {
    Unspecified = 0x0001,
    Conversational = 0x0002,
    Media = 0x0004,
    Game = 0x0008,
    Instructional = 0x0010,
    VoiceAssistants = 0x0020,
    Live = 0x0040,
    SoundEffects = 0x0080,
    Notifications = 0x0100,
    Ringtone = 0x0200,
    Alerts = 0x0400,
    EmergencyAlarm = 0x0800,
    Rfu = 0x1000,
}

bitflags! {
    /// Audio context bitmap, as carried by the Available / Supported Audio
    /// Contexts characteristics and stream metadata.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AudioContexts: u16 {
        const UNSPECIFIED = 0x0001;
        const CONVERSATIONAL = 0x0002;
        const MEDIA = 0x0004;
        const GAME = 0x0008;
        const INSTRUCTIONAL = 0x0010;
        const VOICE_ASSISTANTS = 0x0020;
        const LIVE = 0x0040;
        const SOUND_EFFECTS = 0x0080;
        const NOTIFICATIONS = 0x0100;
        const RINGTONE = 0x0200;
        const ALERTS = 0x0400;
        const EMERGENCY_ALARM = 0x0800;
    }
}

impl LeAudioContextType {
    pub fn as_bitmask(&self) -> AudioContexts {
        AudioContexts::from_bits_truncate(*self as u16)
    }

    /// Single context type out of a one-bit bitmap.
    pub fn from_bitmask(bitmap: u16) -> Option<Self> {
        use LeAudioContextType::*;
        let all = [
            Unspecified,
            Conversational,
            Media,
            Game,
            Instructional,
            VoiceAssistants,
            Live,
            SoundEffects,
            Notifications,
            Ringtone,
            Alerts,
            EmergencyAlarm,
        ];
        all.into_iter().find(|context| *context as u16 == bitmap)
    }
}

bitflags! {
    /// Audio channel allocation bitmap (Generic Audio assigned numbers).
    /// Only the positions this client routes by are named.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AudioLocations: u32 {
        const FRONT_LEFT = 0x0000_0001;
        const FRONT_RIGHT = 0x0000_0002;
        const BACK_LEFT = 0x0000_0010;
        const BACK_RIGHT = 0x0000_0020;
        const FRONT_LEFT_OF_CENTER = 0x0000_0040;
        const FRONT_RIGHT_OF_CENTER = 0x0000_0080;
        const SIDE_LEFT = 0x0000_0400;
        const SIDE_RIGHT = 0x0000_0800;
        const _ = !0;
    }
}

impl AudioLocations {
    /// Left-side positions, any of which routes a stream to the left CIS.
    pub fn any_left() -> Self {
        Self::FRONT_LEFT | Self::BACK_LEFT | Self::FRONT_LEFT_OF_CENTER | Self::SIDE_LEFT
    }

    /// Right-side positions, any of which routes a stream to the right CIS.
    pub fn any_right() -> Self {
        Self::FRONT_RIGHT | Self::BACK_RIGHT | Self::FRONT_RIGHT_OF_CENTER | Self::SIDE_RIGHT
    }
}

/// Group level stream status reported to the audio-session coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStreamStatus {
    Idle,
    Streaming,
    Releasing,
    Suspending,
    Suspended,
    ConfiguredAutonomous,
    ConfiguredByUser,
    Destroyed,
}

/// Connection state reported through the client callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Active-group status reported through the client callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Inactive,
    Active,
}

/// Group membership change reported through the client callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupNodeStatus {
    Added,
    Removed,
}

/// Codec identifier: coding format with company/vendor discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecId {
    pub coding_format: u8,
    pub company_id: u16,
    pub vendor_id: u16,
}

/// LC3, the only coding format this client configures.
pub const CODEC_ID_LC3: CodecId = CodecId { coding_format: 0x06, company_id: 0, vendor_id: 0 };

/// Codec Specific Configuration / Capability LTV types (Generic Audio).
pub mod codec_spec {
    pub const TYPE_SAMPLING_FREQUENCY: u8 = 0x01;
    pub const TYPE_FRAME_DURATION: u8 = 0x02;
    pub const TYPE_AUDIO_CHANNEL_ALLOCATION: u8 = 0x03;
    pub const TYPE_OCTETS_PER_CODEC_FRAME: u8 = 0x04;
    pub const TYPE_CODEC_FRAME_BLOCKS_PER_SDU: u8 = 0x05;

    // Capability-side: channel counts is a bitmask, octets per frame a range.
    pub const CAPS_TYPE_SUPPORTED_SAMPLING_FREQUENCIES: u8 = 0x01;
    pub const CAPS_TYPE_SUPPORTED_FRAME_DURATIONS: u8 = 0x02;
    pub const CAPS_TYPE_AUDIO_CHANNEL_COUNTS: u8 = 0x03;
    pub const CAPS_TYPE_SUPPORTED_OCTETS_PER_CODEC_FRAME: u8 = 0x04;
    pub const CAPS_TYPE_MAX_CODEC_FRAMES_PER_SDU: u8 = 0x05;

    pub const METADATA_TYPE_PREFERRED_AUDIO_CONTEXTS: u8 = 0x01;
    pub const METADATA_TYPE_STREAMING_AUDIO_CONTEXTS: u8 = 0x02;

    pub const SAMPLING_FREQ_8000: u8 = 0x01;
    pub const SAMPLING_FREQ_16000: u8 = 0x03;
    pub const SAMPLING_FREQ_24000: u8 = 0x05;
    pub const SAMPLING_FREQ_32000: u8 = 0x06;
    pub const SAMPLING_FREQ_44100: u8 = 0x07;
    pub const SAMPLING_FREQ_48000: u8 = 0x08;

    pub const FRAME_DURATION_7500: u8 = 0x00;
    pub const FRAME_DURATION_10000: u8 = 0x01;

    /// Sampling-frequency configuration code to its capability bit.
    pub fn sampling_freq_capability_bit(freq: u8) -> u16 {
        1 << (freq - 1)
    }

    /// Frame-duration configuration code to its capability bit.
    pub fn frame_duration_capability_bit(duration: u8) -> u8 {
        1 << duration
    }

    pub fn sampling_freq_to_hz(freq: u8) -> u32 {
        match freq {
            SAMPLING_FREQ_8000 => 8000,
            SAMPLING_FREQ_16000 => 16000,
            SAMPLING_FREQ_24000 => 24000,
            SAMPLING_FREQ_32000 => 32000,
            SAMPLING_FREQ_44100 => 44100,
            SAMPLING_FREQ_48000 => 48000,
            _ => 0,
        }
    }

    pub fn frame_duration_to_us(duration: u8) -> u32 {
        match duration {
            FRAME_DURATION_7500 => 7500,
            FRAME_DURATION_10000 => 10000,
            _ => 0,
        }
    }
}

/// LC3 configuration of a single ASE, decoded from or encoded to the Codec
/// Specific Configuration LTVs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AseCodecConfiguration {
    pub sampling_frequency: u8,
    pub frame_duration: u8,
    pub audio_channel_allocation: Option<AudioLocations>,
    pub octets_per_codec_frame: Option<u16>,
    pub codec_frame_blocks_per_sdu: Option<u8>,
    /// Channels carried by this ASE, derived from the allocation.
    pub channel_count: u8,
}

impl AseCodecConfiguration {
    pub fn sampling_frequency_hz(&self) -> u32 {
        codec_spec::sampling_freq_to_hz(self.sampling_frequency)
    }

    pub fn frame_duration_us(&self) -> u32 {
        codec_spec::frame_duration_to_us(self.frame_duration)
    }
}

/// PCM session parameters, shared between the audio-framework sessions and
/// the codec engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeAudioCodecConfiguration {
    pub num_channels: u8,
    pub sample_rate: u32,
    pub bits_per_sample: u8,
    pub data_interval_us: u32,
}

impl LeAudioCodecConfiguration {
    pub fn is_invalid(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_reverses_octets() {
        let addr = Address([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(addr.to_string(), "06:05:04:03:02:01");
    }

    #[test]
    fn ase_states_order_by_progress() {
        assert!(AseState::Idle < AseState::CodecConfigured);
        assert!(AseState::QosConfigured < AseState::Enabling);
        assert!(AseState::Enabling < AseState::Streaming);
    }

    #[test]
    fn context_type_maps_to_its_bit() {
        assert_eq!(LeAudioContextType::Media.as_bitmask(), AudioContexts::MEDIA);
        assert_eq!(
            LeAudioContextType::Conversational.as_bitmask(),
            AudioContexts::CONVERSATIONAL
        );
    }

    #[test]
    fn capability_bits() {
        assert_eq!(codec_spec::sampling_freq_capability_bit(codec_spec::SAMPLING_FREQ_8000), 0x01);
        assert_eq!(
            codec_spec::sampling_freq_capability_bit(codec_spec::SAMPLING_FREQ_48000),
            0x80
        );
        assert_eq!(
            codec_spec::frame_duration_capability_bit(codec_spec::FRAME_DURATION_10000),
            0x02
        );
    }
}
