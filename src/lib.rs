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

//! LE Audio unicast client
//!
//! Binds a set of coordinated audio peripherals into one streaming session:
//! attribute-server discovery and subscription, group-wide ASE state
//! orchestration, and the isochronous audio plane in between.
//!
//! ```text
//!      GATT | ^                HCI | ^ ISO              | ^ PCM
//!    events | | writes      events | | commands  events | | data
//!        ___|_|_________________ __|_|________________ _|_|_______
//!       |   : :    attribute    |   : :     iso       |  : :      |
//!       |   : :     client      |   : :    manager    |  : audio  |
//!       |   : :_________________|   : :_______________|  : frame- |
//!       |   :        group state machine / client        :  work  |
//!       |___:____________________:_______________________:________|
//!                                |
//!                                | messages, drained on one thread
//!                                v
//! ```
//!
//! Every external callback is translated into a [`Message`] and posted to
//! the main loop; all state is owned by [`LeAudioClient`] and only touched
//! from that loop.

pub mod ascs;
pub mod audio_hal;
pub mod audio_set_configurations;
pub mod client;
pub mod codec;
pub mod device;
pub mod gatt;
pub mod group;
pub mod iso;
pub mod lc3;
mod packet;
pub mod pacs;
pub mod state_machine;
pub mod timer;
pub mod types;
pub mod uuid;

#[cfg(test)]
mod tests;

pub use client::{LeAudioClient, LeAudioClientCallbacks, LeAudioError};

use audio_hal::AudioSessionEvent;
use client::GroupEvent;
use gatt::GattEvent;
use iso::IsoEvent;
use log::info;
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use types::{GroupId, GroupStreamStatus};

/// One event of the main loop. Adapters around the external collaborators
/// build these; [`LeAudioClient::handle_message`] consumes them.
#[derive(Debug)]
pub enum Message {
    Gatt(GattEvent),
    Iso(IsoEvent),
    /// Framework PCM source session (downlink towards the peripherals).
    SourceSession(AudioSessionEvent),
    /// Framework PCM sink session (uplink from the peripherals).
    SinkSession(AudioSessionEvent),
    Group(GroupEvent),
    /// Group stream status from the state machine.
    StatusReport(GroupId, GroupStreamStatus),
    /// The transition watchdog of a group expired.
    TransitionTimeout(GroupId),
    /// The keep-ISO-alive window after an audio suspend elapsed.
    SuspendTimeout(GroupId),
}

/// Runs the client event loop on the calling thread until every message
/// sender is dropped. The builder receives the sender the adapters and
/// timers post through.
pub fn run(build: impl FnOnce(mpsc::UnboundedSender<Message>) -> LeAudioClient) {
    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to start tokio runtime");
    let local = LocalSet::new();

    local.block_on(&rt, async move {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut le_audio_client = build(tx);

        info!("starting LE Audio event loop");
        while let Some(message) = rx.recv().await {
            le_audio_client.handle_message(message);
        }
    });

    info!("LE Audio event loop has stopped");
}

/// Inits logging for host
pub fn init_logging() {
    env_logger::Builder::new().parse_default_env().try_init().ok();
}
