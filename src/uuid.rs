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

//! 16-bit assigned numbers of the services and characteristics this client
//! discovers and subscribes to.

/// Published Audio Capabilities Service
pub const PACS_SERVICE: u16 = 0x1850;
/// Audio Stream Control Service
pub const ASCS_SERVICE: u16 = 0x184e;
/// Coordinated Set Identification Service
pub const CSIS_SERVICE: u16 = 0x1846;
/// Common Audio Service
pub const CAS_SERVICE: u16 = 0x1853;

/// Sink PAC
pub const SINK_PAC: u16 = 0x2bc9;
/// Sink Audio Locations
pub const SINK_AUDIO_LOCATIONS: u16 = 0x2bca;
/// Source PAC
pub const SOURCE_PAC: u16 = 0x2bcb;
/// Source Audio Locations
pub const SOURCE_AUDIO_LOCATIONS: u16 = 0x2bcc;
/// Available Audio Contexts
pub const AVAILABLE_AUDIO_CONTEXTS: u16 = 0x2bcd;
/// Supported Audio Contexts
pub const SUPPORTED_AUDIO_CONTEXTS: u16 = 0x2bce;

/// Sink ASE
pub const SINK_ASE: u16 = 0x2bc4;
/// Source ASE
pub const SOURCE_ASE: u16 = 0x2bc5;
/// ASE Control Point
pub const ASE_CONTROL_POINT: u16 = 0x2bc6;

/// Client Characteristic Configuration descriptor
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: u16 = 0x2902;
