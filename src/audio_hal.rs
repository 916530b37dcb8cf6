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

//! Platform audio framework boundary: the PCM source feeding the
//! peripherals' sinks and the PCM sink fed from their sources.

use crate::types::LeAudioCodecConfiguration;
use tokio::sync::oneshot;

/// Framework PCM source session (downlink towards the peripherals).
pub trait AudioSource {
    fn acquire(&self) -> bool;
    fn release(&self);
    fn start(&self, config: LeAudioCodecConfiguration);
    fn stop(&self);
    fn update_remote_delay(&self, delay_ms: u16);
    fn confirm_streaming_request(&self);
    fn cancel_streaming_request(&self);
    fn suspended_for_reconfiguration(&self);
}

/// Framework PCM sink session (uplink from the peripherals).
pub trait AudioSink {
    fn acquire(&self) -> bool;
    fn release(&self);
    fn start(&self, config: LeAudioCodecConfiguration);
    fn stop(&self);
    fn update_remote_delay(&self, delay_ms: u16);
    fn confirm_streaming_request(&self);
    fn cancel_streaming_request(&self);
    fn suspended_for_reconfiguration(&self);
    /// Deliver decoded PCM; returns the number of bytes accepted.
    fn send(&self, data: &[u8]) -> usize;
}

/// Stream usage attached to framework metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioUsage {
    Unknown,
    Media,
    VoiceCommunication,
    Game,
    Notification,
    NotificationTelephonyRingtone,
    Alarm,
    Emergency,
}

/// Content classification attached to framework metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioContentType {
    Unknown,
    Speech,
    Music,
    Movie,
    Sonification,
}

/// One track of a framework metadata update.
#[derive(Debug, Clone, Copy)]
pub struct TrackMetadata {
    pub usage: AudioUsage,
    pub content_type: AudioContentType,
    pub gain: f64,
}

/// Audio-session callbacks, in main-loop message form. Suspend and metadata
/// updates carry an acknowledgement the coordinator completes once the event
/// has been applied, so the framework observes ordering.
#[derive(Debug)]
pub enum AudioSessionEvent {
    Resume,
    Suspend { ack: Option<oneshot::Sender<()>> },
    DataReady { data: Vec<u8> },
    MetadataUpdate { tracks: Vec<TrackMetadata>, ack: Option<oneshot::Sender<()>> },
}
