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

//! End-to-end scenarios driven through mock collaborators.

use crate::ascs;
use crate::audio_hal::{
    AudioContentType, AudioSessionEvent, AudioSink, AudioSource, AudioUsage, TrackMetadata,
};
use crate::client::{
    DeviceGroups, GroupEvent, LeAudioClient, LeAudioClientCallbacks, Storage,
};
use crate::gatt::{
    DisconnectReason, GattCharacteristic, GattClient, GattEvent, GattIncludedService, GattService,
};
use crate::iso::{CigParameters, CisAclPair, IsoDataPathParameters, IsoEvent, IsoManager};
use crate::lc3::{Lc3, Lc3Decoder, Lc3Encoder, Lc3Error};
use crate::pacs::{serialize_pac, CodecCapabilities, PacRecord};
use crate::state_machine::DEVICE_SET_STATE_TIMEOUT_MS;
use crate::types::{
    codec_spec, Address, AudioContexts, ConnectionState, Directions, GroupId, GroupNodeStatus,
    GroupStatus, LeAudioCodecConfiguration, LeAudioContextType, CODEC_ID_LC3, GROUP_ID_UNKNOWN,
};
use crate::{uuid, Message};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

const GROUP: GroupId = 1;
const MEDIA: u16 = LeAudioContextType::Media as u16;

const SINK_PAC_VAL: u16 = 0x0011;
const SINK_LOCATIONS_VAL: u16 = 0x0013;
const AVAILABLE_CONTEXTS_VAL: u16 = 0x0015;
const SUPPORTED_CONTEXTS_VAL: u16 = 0x0017;
const SINK_ASE_VAL: u16 = 0x0021;
const CTP_VAL: u16 = 0x0025;

fn addr(lsb: u8) -> Address {
    Address([lsb, 0, 0, 0, 0, 0])
}

#[derive(Debug)]
enum IssuedOp {
    Read { conn_id: u16, handle: u16 },
    WriteChar { conn_id: u16, handle: u16 },
    WriteDesc { conn_id: u16, handle: u16 },
    Mtu { conn_id: u16, mtu: u16 },
}

#[derive(Default)]
struct MockGatt {
    opens: RefCell<Vec<(Address, bool)>>,
    searches: RefCell<Vec<(u16, u16)>>,
    services: RefCell<HashMap<u16, Vec<GattService>>>,
    char_values: RefCell<HashMap<(u16, u16), Vec<u8>>>,
    issued: RefCell<VecDeque<IssuedOp>>,
    char_writes: RefCell<Vec<(u16, u16, Vec<u8>)>>,
    acl_disconnects: RefCell<Vec<Address>>,
}

impl GattClient for MockGatt {
    fn open(&self, addr: Address, direct: bool) {
        self.opens.borrow_mut().push((addr, direct));
    }
    fn cancel_open(&self, _addr: Address, _direct: bool) {}
    fn close(&self, _conn_id: u16) {}
    fn configure_mtu(&self, conn_id: u16, mtu: u16) {
        self.issued.borrow_mut().push_back(IssuedOp::Mtu { conn_id, mtu });
    }
    fn request_peer_sca(&self, _addr: Address) {}
    fn is_encrypted(&self, _addr: Address) -> bool {
        true
    }
    fn set_encryption(&self, _addr: Address) {}
    fn service_search(&self, conn_id: u16, service_uuid: u16) {
        self.searches.borrow_mut().push((conn_id, service_uuid));
    }
    fn get_services(&self, conn_id: u16) -> Vec<GattService> {
        self.services.borrow().get(&conn_id).cloned().unwrap_or_default()
    }
    fn register_notification(&self, _addr: Address, _handle: u16) {}
    fn deregister_notification(&self, _addr: Address, _handle: u16) {}
    fn read_characteristic(&self, conn_id: u16, handle: u16) {
        self.issued.borrow_mut().push_back(IssuedOp::Read { conn_id, handle });
    }
    fn write_characteristic(&self, conn_id: u16, handle: u16, value: Vec<u8>) {
        self.char_writes.borrow_mut().push((conn_id, handle, value));
        self.issued.borrow_mut().push_back(IssuedOp::WriteChar { conn_id, handle });
    }
    fn write_descriptor(&self, conn_id: u16, handle: u16, _value: Vec<u8>) {
        self.issued.borrow_mut().push_back(IssuedOp::WriteDesc { conn_id, handle });
    }
    fn acl_conn_handle(&self, addr: Address) -> u16 {
        0x0100 + addr.0[0] as u16
    }
    fn disconnect_acl(&self, addr: Address) {
        self.acl_disconnects.borrow_mut().push(addr);
    }
}

#[derive(Default)]
struct MockIso {
    created_cigs: RefCell<Vec<(u8, CigParameters)>>,
    removed_cigs: RefCell<Vec<u8>>,
    establishes: RefCell<Vec<Vec<CisAclPair>>>,
    data_paths: RefCell<Vec<IsoDataPathParameters>>,
    removed_paths: RefCell<Vec<(u16, u8)>>,
    sent: RefCell<Vec<(u16, usize)>>,
}

impl IsoManager for MockIso {
    fn create_cig(&self, cig_id: u8, params: CigParameters) {
        self.created_cigs.borrow_mut().push((cig_id, params));
    }
    fn remove_cig(&self, cig_id: u8) {
        self.removed_cigs.borrow_mut().push(cig_id);
    }
    fn establish_cis(&self, pairs: Vec<CisAclPair>) {
        self.establishes.borrow_mut().push(pairs);
    }
    fn disconnect_cis(&self, _cis_conn_handle: u16, _reason: u8) {}
    fn setup_iso_data_path(&self, params: IsoDataPathParameters) {
        self.data_paths.borrow_mut().push(params);
    }
    fn remove_iso_data_path(&self, cis_conn_handle: u16, direction_mask: u8) {
        self.removed_paths.borrow_mut().push((cis_conn_handle, direction_mask));
    }
    fn send_iso_data(&self, cis_conn_handle: u16, data: &[u8]) {
        self.sent.borrow_mut().push((cis_conn_handle, data.len()));
    }
    fn read_iso_link_quality(&self, _cis_conn_handle: u16) {}
}

#[derive(Default)]
struct MockAudioSession {
    started: RefCell<Vec<LeAudioCodecConfiguration>>,
    confirms: Cell<usize>,
    cancels: Cell<usize>,
    suspended_for_reconfigurations: Cell<usize>,
    delays: RefCell<Vec<u16>>,
}

impl AudioSource for MockAudioSession {
    fn acquire(&self) -> bool {
        true
    }
    fn release(&self) {}
    fn start(&self, config: LeAudioCodecConfiguration) {
        self.started.borrow_mut().push(config);
    }
    fn stop(&self) {}
    fn update_remote_delay(&self, delay_ms: u16) {
        self.delays.borrow_mut().push(delay_ms);
    }
    fn confirm_streaming_request(&self) {
        self.confirms.set(self.confirms.get() + 1);
    }
    fn cancel_streaming_request(&self) {
        self.cancels.set(self.cancels.get() + 1);
    }
    fn suspended_for_reconfiguration(&self) {
        self.suspended_for_reconfigurations
            .set(self.suspended_for_reconfigurations.get() + 1);
    }
}

impl AudioSink for MockAudioSession {
    fn acquire(&self) -> bool {
        true
    }
    fn release(&self) {}
    fn start(&self, config: LeAudioCodecConfiguration) {
        self.started.borrow_mut().push(config);
    }
    fn stop(&self) {}
    fn update_remote_delay(&self, delay_ms: u16) {
        self.delays.borrow_mut().push(delay_ms);
    }
    fn confirm_streaming_request(&self) {
        self.confirms.set(self.confirms.get() + 1);
    }
    fn cancel_streaming_request(&self) {
        self.cancels.set(self.cancels.get() + 1);
    }
    fn suspended_for_reconfiguration(&self) {
        self.suspended_for_reconfigurations
            .set(self.suspended_for_reconfigurations.get() + 1);
    }
    fn send(&self, data: &[u8]) -> usize {
        data.len()
    }
}

#[derive(Default)]
struct MockCallbacks {
    connection_states: RefCell<Vec<(ConnectionState, Address)>>,
    group_statuses: RefCell<Vec<(GroupId, GroupStatus)>>,
    node_statuses: RefCell<Vec<(Address, GroupId, GroupNodeStatus)>>,
    audio_confs: RefCell<Vec<(GroupId, AudioContexts)>>,
    sink_locations: RefCell<Vec<(Address, u32)>>,
}

impl LeAudioClientCallbacks for MockCallbacks {
    fn on_connection_state(&self, state: ConnectionState, addr: Address) {
        self.connection_states.borrow_mut().push((state, addr));
    }
    fn on_group_status(&self, group_id: GroupId, status: GroupStatus) {
        self.group_statuses.borrow_mut().push((group_id, status));
    }
    fn on_group_node_status(&self, addr: Address, group_id: GroupId, status: GroupNodeStatus) {
        self.node_statuses.borrow_mut().push((addr, group_id, status));
    }
    fn on_audio_conf(
        &self,
        _directions: Directions,
        group_id: GroupId,
        _snk_locations: u32,
        _src_locations: u32,
        contexts: AudioContexts,
    ) {
        self.audio_confs.borrow_mut().push((group_id, contexts));
    }
    fn on_sink_audio_location_available(&self, addr: Address, locations: u32) {
        self.sink_locations.borrow_mut().push((addr, locations));
    }
}

#[derive(Default)]
struct MockStorage {
    autoconnects: RefCell<Vec<(Address, bool)>>,
}

impl Storage for MockStorage {
    fn set_leaudio_autoconnect(&self, addr: Address, autoconnect: bool) {
        self.autoconnects.borrow_mut().push((addr, autoconnect));
    }
}

#[derive(Default)]
struct MockDeviceGroups {
    group_ids: RefCell<HashMap<Address, GroupId>>,
    added: RefCell<Vec<(Address, Option<GroupId>)>>,
}

impl DeviceGroups for MockDeviceGroups {
    fn add_device(&self, addr: Address, group_id: Option<GroupId>) {
        self.added.borrow_mut().push((addr, group_id));
    }
    fn remove_device(&self, _addr: Address, _group_id: GroupId) {}
    fn get_group_id(&self, addr: Address) -> GroupId {
        self.group_ids.borrow().get(&addr).copied().unwrap_or(GROUP_ID_UNKNOWN)
    }
}

#[derive(Default)]
struct FakeLc3 {
    encoders_built: Cell<usize>,
    decoders_built: Cell<usize>,
}

struct FakeEncoder;
struct FakeDecoder;

impl Lc3Encoder for FakeEncoder {
    fn encode(&mut self, _pcm: &[i16], _stride: usize, out: &mut [u8]) -> Result<(), Lc3Error> {
        out.fill(0x5a);
        Ok(())
    }
}

impl Lc3Decoder for FakeDecoder {
    fn decode(&mut self, data: Option<&[u8]>, out_pcm: &mut [i16]) -> Result<(), Lc3Error> {
        out_pcm.fill(data.map_or(0, |bytes| bytes[0] as i16));
        Ok(())
    }
}

impl Lc3 for FakeLc3 {
    fn frame_samples(&self, frame_duration_us: u32, sample_rate_hz: u32) -> Option<usize> {
        matches!(frame_duration_us, 7500 | 10000)
            .then(|| (frame_duration_us as u64 * sample_rate_hz as u64 / 1_000_000) as usize)
    }
    fn new_encoder(&self, _dt: u32, _sr: u32, _pcm: u32) -> Option<Box<dyn Lc3Encoder>> {
        self.encoders_built.set(self.encoders_built.get() + 1);
        Some(Box::new(FakeEncoder))
    }
    fn new_decoder(&self, _dt: u32, _sr: u32, _pcm: u32) -> Option<Box<dyn Lc3Decoder>> {
        self.decoders_built.set(self.decoders_built.get() + 1);
        Some(Box::new(FakeDecoder))
    }
}

struct Fixture {
    client: LeAudioClient,
    rx: UnboundedReceiver<Message>,
    _tx: UnboundedSender<Message>,
    gatt: Rc<MockGatt>,
    iso: Rc<MockIso>,
    source: Rc<MockAudioSession>,
    sink: Rc<MockAudioSession>,
    callbacks: Rc<MockCallbacks>,
    storage: Rc<MockStorage>,
    device_groups: Rc<MockDeviceGroups>,
    lc3: Rc<FakeLc3>,
}

impl Fixture {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let gatt = Rc::new(MockGatt::default());
        let iso = Rc::new(MockIso::default());
        let source = Rc::new(MockAudioSession::default());
        let sink = Rc::new(MockAudioSession::default());
        let callbacks = Rc::new(MockCallbacks::default());
        let storage = Rc::new(MockStorage::default());
        let device_groups = Rc::new(MockDeviceGroups::default());
        let lc3 = Rc::new(FakeLc3::default());

        let client = LeAudioClient::new(
            callbacks.clone(),
            gatt.clone(),
            iso.clone(),
            source.clone(),
            sink.clone(),
            storage.clone(),
            device_groups.clone(),
            lc3.clone(),
            tx.clone(),
        );

        Self {
            client,
            rx,
            _tx: tx,
            gatt,
            iso,
            source,
            sink,
            callbacks,
            storage,
            device_groups,
            lc3,
        }
    }

    /// Complete queued attribute operations until the queues run dry.
    fn pump_gatt(&mut self) {
        loop {
            let op = self.gatt.issued.borrow_mut().pop_front();
            let Some(op) = op else { break };
            let event = match op {
                IssuedOp::Read { conn_id, handle } => {
                    let value = self
                        .gatt
                        .char_values
                        .borrow()
                        .get(&(conn_id, handle))
                        .cloned()
                        .unwrap_or_default();
                    GattEvent::ReadResponse { conn_id, handle, success: true, value }
                }
                IssuedOp::WriteChar { conn_id, handle } => {
                    GattEvent::WriteResponse { conn_id, handle, success: true }
                }
                IssuedOp::WriteDesc { conn_id, handle } => {
                    GattEvent::DescriptorWriteResponse { conn_id, handle, success: true }
                }
                IssuedOp::Mtu { conn_id, mtu } => GattEvent::MtuConfigured { conn_id, mtu },
            };
            self.client.handle_message(Message::Gatt(event));
        }
    }

    /// Dispatch everything the state machine and timers posted, completing
    /// attribute operations as they appear, until the system settles.
    fn drain(&mut self) {
        loop {
            let mut progressed = false;
            while let Ok(message) = self.rx.try_recv() {
                self.client.handle_message(message);
                progressed = true;
            }
            if !self.gatt.issued.borrow().is_empty() {
                self.pump_gatt();
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    fn notify(&mut self, conn_id: u16, handle: u16, value: Vec<u8>) {
        self.client.handle_message(Message::Gatt(GattEvent::Notification {
            conn_id,
            handle,
            value,
        }));
        self.drain();
    }

    fn ctp_opcodes(&self, conn_id: u16) -> Vec<u8> {
        self.gatt
            .char_writes
            .borrow()
            .iter()
            .filter(|(conn, handle, _)| *conn == conn_id && *handle == CTP_VAL)
            .map(|(_, _, value)| value[0])
            .collect()
    }
}

fn lc3_sink_pac() -> Vec<u8> {
    serialize_pac(&[PacRecord {
        codec_id: CODEC_ID_LC3,
        capabilities: CodecCapabilities {
            supported_sampling_frequencies: codec_spec::sampling_freq_capability_bit(
                codec_spec::SAMPLING_FREQ_16000,
            ) | codec_spec::sampling_freq_capability_bit(codec_spec::SAMPLING_FREQ_48000),
            supported_frame_durations: codec_spec::frame_duration_capability_bit(
                codec_spec::FRAME_DURATION_10000,
            ),
            audio_channel_counts: Some(0x01),
            octets_per_codec_frame: Some((26, 120)),
            max_codec_frames_per_sdu: None,
        },
        metadata: vec![],
    }])
}

fn device_services() -> Vec<GattService> {
    let charac = |uuid, val: u16| GattCharacteristic {
        uuid,
        value_handle: val,
        ccc_handle: Some(val + 1),
    };
    vec![
        GattService {
            uuid: uuid::PACS_SERVICE,
            handle: 0x0010,
            is_primary: true,
            included_services: vec![],
            characteristics: vec![
                charac(uuid::SINK_PAC, SINK_PAC_VAL),
                charac(uuid::SINK_AUDIO_LOCATIONS, SINK_LOCATIONS_VAL),
                charac(uuid::AVAILABLE_AUDIO_CONTEXTS, AVAILABLE_CONTEXTS_VAL),
                charac(uuid::SUPPORTED_AUDIO_CONTEXTS, SUPPORTED_CONTEXTS_VAL),
            ],
        },
        GattService {
            uuid: uuid::ASCS_SERVICE,
            handle: 0x0020,
            is_primary: true,
            included_services: vec![],
            characteristics: vec![
                charac(uuid::SINK_ASE, SINK_ASE_VAL),
                charac(uuid::ASE_CONTROL_POINT, CTP_VAL),
            ],
        },
        GattService {
            uuid: uuid::CAS_SERVICE,
            handle: 0x0030,
            is_primary: true,
            included_services: vec![GattIncludedService {
                uuid: uuid::CSIS_SERVICE,
                start_handle: 0x0040,
            }],
            characteristics: vec![],
        },
        GattService {
            uuid: uuid::CSIS_SERVICE,
            handle: 0x0040,
            is_primary: true,
            included_services: vec![],
            characteristics: vec![],
        },
    ]
}

/// Connect one device with a sink ASE and add it to the group.
fn install_device(f: &mut Fixture, lsb: u8, conn_id: u16, locations: u32) {
    let address = addr(lsb);
    f.device_groups.group_ids.borrow_mut().insert(address, GROUP);
    f.gatt.services.borrow_mut().insert(conn_id, device_services());
    {
        let mut values = f.gatt.char_values.borrow_mut();
        values.insert((conn_id, SINK_PAC_VAL), lc3_sink_pac());
        values.insert((conn_id, SINK_LOCATIONS_VAL), locations.to_le_bytes().to_vec());
        values.insert((conn_id, AVAILABLE_CONTEXTS_VAL), vec![0x06, 0x00, 0x00, 0x00]);
        values.insert((conn_id, SUPPORTED_CONTEXTS_VAL), vec![0x06, 0x00, 0x00, 0x00]);
        values.insert((conn_id, SINK_ASE_VAL), vec![0x01, 0x00]);
    }

    f.client.connect(address);
    f.client.handle_message(Message::Gatt(GattEvent::Open {
        status: 0,
        conn_id,
        addr: address,
        mtu: 100,
    }));
    f.client
        .handle_message(Message::Gatt(GattEvent::SearchComplete { conn_id, success: true }));
    f.drain();

    assert!(f
        .callbacks
        .connection_states
        .borrow()
        .contains(&(ConnectionState::Connected, address)));
}

fn codec_configured_ntf(ase_id: u8) -> Vec<u8> {
    vec![
        ase_id, 0x01, // Codec Configured
        0x00, 0x02, 0x05, // unframed, 2M, rtn 5
        0x64, 0x00, // max transport latency
        0xe8, 0x03, 0x00, // pres delay min
        0x40, 0x9c, 0x00, // pres delay max
        0xe8, 0x03, 0x00, // preferred min
        0x40, 0x9c, 0x00, // preferred max
        0x06, 0x00, 0x00, 0x00, 0x00, // LC3
        0x00, // no configuration LTVs
    ]
}

fn qos_configured_ntf(ase_id: u8, cig_id: u8, cis_id: u8) -> Vec<u8> {
    vec![
        ase_id, 0x02, cig_id, cis_id, 0x10, 0x27, 0x00, 0x00, 0x02, 0x64, 0x00, 0x05, 0x64, 0x00,
        0x40, 0x9c, 0x00,
    ]
}

fn enabling_ntf(ase_id: u8, cig_id: u8, cis_id: u8) -> Vec<u8> {
    vec![ase_id, 0x03, cig_id, cis_id, 0x00]
}

fn streaming_ntf(ase_id: u8, cig_id: u8, cis_id: u8) -> Vec<u8> {
    vec![ase_id, 0x04, cig_id, cis_id, 0x00]
}

fn releasing_ntf(ase_id: u8) -> Vec<u8> {
    vec![ase_id, 0x06]
}

fn idle_ntf(ase_id: u8) -> Vec<u8> {
    vec![ase_id, 0x00]
}

fn stereo_pcm_48k() -> Vec<u8> {
    let mut pcm = Vec::with_capacity(480 * 4);
    for _ in 0..480 {
        pcm.extend_from_slice(&100i16.to_le_bytes());
        pcm.extend_from_slice(&(-100i16).to_le_bytes());
    }
    pcm
}

/// Drive a configured group up to STREAMING, feeding the peer and
/// controller responses in order.
fn run_stream_establishment(f: &mut Fixture, members: &[(u16, u16)]) {
    // members: (conn_id, cis_conn_handle), CIS ids assigned in order.
    for (conn_id, _) in members {
        f.notify(*conn_id, SINK_ASE_VAL, codec_configured_ntf(1));
    }

    let handles: Vec<u16> = members.iter().map(|(_, cis)| *cis).collect();
    f.client.handle_message(Message::Iso(IsoEvent::CigCreated {
        cig_id: GROUP as u8,
        status: 0,
        conn_handles: handles,
    }));
    f.drain();

    for (index, (conn_id, _)) in members.iter().enumerate() {
        f.notify(*conn_id, SINK_ASE_VAL, qos_configured_ntf(1, GROUP as u8, index as u8 + 1));
    }
    for (index, (conn_id, _)) in members.iter().enumerate() {
        f.notify(*conn_id, SINK_ASE_VAL, enabling_ntf(1, GROUP as u8, index as u8 + 1));
    }
    for (index, (conn_id, cis)) in members.iter().enumerate() {
        f.client.handle_message(Message::Iso(IsoEvent::CisEstablished {
            cis_conn_handle: *cis,
            status: 0,
            transport_latency_c_to_p: 10_000,
            transport_latency_p_to_c: 10_000,
            max_pdu_c_to_p: 120,
            max_pdu_p_to_c: 0,
        }));
        f.drain();
        f.notify(*conn_id, SINK_ASE_VAL, streaming_ntf(1, GROUP as u8, index as u8 + 1));
        f.client.handle_message(Message::Iso(IsoEvent::DataPathSetup {
            cis_conn_handle: *cis,
            status: 0,
        }));
        f.drain();
    }
}

#[tokio::test(start_paused = true)]
async fn stereo_pair_media_start() {
    let mut f = Fixture::new();
    install_device(&mut f, 1, 1, 0x01);
    install_device(&mut f, 2, 2, 0x02);

    assert!(f.callbacks.sink_locations.borrow().contains(&(addr(1), 0x01)));
    assert!(f.callbacks.sink_locations.borrow().contains(&(addr(2), 0x02)));

    f.client.group_set_active(GROUP).unwrap();
    assert_eq!(*f.callbacks.group_statuses.borrow(), vec![(GROUP, GroupStatus::Active)]);

    f.client.handle_message(Message::SourceSession(AudioSessionEvent::Resume));
    f.drain();

    // Both peers got a Config Codec write.
    assert_eq!(f.ctp_opcodes(1), vec![ascs::OPCODE_CONFIG_CODEC]);
    assert_eq!(f.ctp_opcodes(2), vec![ascs::OPCODE_CONFIG_CODEC]);

    run_stream_establishment(&mut f, &[(1, 0x60), (2, 0x61)]);

    // Transport plus presentation delay was pushed to the framework.
    assert_eq!(f.source.delays.borrow().last(), Some(&50));

    // One CIG with one CIS per ASE, 100-octet SDUs towards the peers.
    {
        let cigs = f.iso.created_cigs.borrow();
        assert_eq!(cigs.len(), 1);
        assert_eq!(cigs[0].1.cis.len(), 2);
        assert_eq!(cigs[0].1.cis[0].max_sdu_c_to_p, 100);
        assert_eq!(cigs[0].1.sdu_interval_c_to_p, 10_000);
    }
    assert_eq!(f.source.confirms.get(), 1);

    // First PCM delivery becomes one 100-octet SDU per side.
    f.client.handle_message(Message::SourceSession(AudioSessionEvent::DataReady {
        data: stereo_pcm_48k(),
    }));
    assert_eq!(*f.iso.sent.borrow(), vec![(0x60, 100), (0x61, 100)]);
}

#[tokio::test(start_paused = true)]
async fn mono_fallback_downmixes_single_device() {
    let mut f = Fixture::new();
    install_device(&mut f, 1, 1, 0x03); // left and right on one device

    f.client.group_set_active(GROUP).unwrap();
    f.client.handle_message(Message::SourceSession(AudioSessionEvent::Resume));
    f.drain();

    run_stream_establishment(&mut f, &[(1, 0x60)]);
    assert_eq!(f.source.confirms.get(), 1);

    f.client.handle_message(Message::SourceSession(AudioSessionEvent::DataReady {
        data: stereo_pcm_48k(),
    }));
    assert_eq!(*f.iso.sent.borrow(), vec![(0x60, 100)]);
}

#[tokio::test(start_paused = true)]
async fn double_group_stream_is_a_no_op() {
    let mut f = Fixture::new();
    install_device(&mut f, 1, 1, 0x03);
    f.client.group_set_active(GROUP).unwrap();
    f.client.handle_message(Message::SourceSession(AudioSessionEvent::Resume));
    f.drain();
    run_stream_establishment(&mut f, &[(1, 0x60)]);

    let writes_before = f.gatt.char_writes.borrow().len();
    f.client.group_stream(GROUP, MEDIA);
    f.drain();
    assert_eq!(f.gatt.char_writes.borrow().len(), writes_before);
}

#[tokio::test(start_paused = true)]
async fn reconfigure_on_metadata_change() {
    let mut f = Fixture::new();
    install_device(&mut f, 1, 1, 0x03);
    f.client.group_set_active(GROUP).unwrap();
    f.client.handle_message(Message::SourceSession(AudioSessionEvent::Resume));
    f.drain();
    run_stream_establishment(&mut f, &[(1, 0x60)]);
    assert_eq!(f.lc3.encoders_built.get(), 2);

    // Voice metadata needs another codec layout: expect a release cycle.
    f.client.handle_message(Message::SourceSession(AudioSessionEvent::MetadataUpdate {
        tracks: vec![TrackMetadata {
            usage: AudioUsage::VoiceCommunication,
            content_type: AudioContentType::Speech,
            gain: 1.0,
        }],
        ack: None,
    }));
    f.drain();
    assert_eq!(f.ctp_opcodes(1).last(), Some(&ascs::OPCODE_RELEASE));

    f.notify(1, SINK_ASE_VAL, releasing_ntf(1));
    f.notify(1, SINK_ASE_VAL, idle_ntf(1));

    // Reconfiguration was requested and the codec reconfigured.
    assert_eq!(f.source.suspended_for_reconfigurations.get(), 1);
    assert_eq!(f.ctp_opcodes(1).last(), Some(&ascs::OPCODE_CONFIG_CODEC));
    assert_eq!(*f.iso.removed_cigs.borrow(), vec![GROUP as u8]);
    f.client.handle_message(Message::Iso(IsoEvent::CigRemoved {
        cig_id: GROUP as u8,
        status: 0,
    }));
    f.drain();

    f.notify(1, SINK_ASE_VAL, codec_configured_ntf(1));

    // The framework resumes after the cancel; the stream restarts.
    f.client.handle_message(Message::SourceSession(AudioSessionEvent::Resume));
    f.drain();
    run_stream_establishment_from_qos(&mut f, 1, 0x70);

    assert_eq!(*f.callbacks.group_statuses.borrow(), vec![(GROUP, GroupStatus::Active)]);
    // Encoders were rebuilt exactly once.
    assert_eq!(f.lc3.encoders_built.get(), 4);
    let started = f.source.started.borrow();
    assert_eq!(started.len(), 1); // the session itself was never restarted
}

/// Continuation of a stream start that begins at Config QoS (the codec was
/// configured before the CIG existed).
fn run_stream_establishment_from_qos(f: &mut Fixture, conn_id: u16, cis: u16) {
    f.client.handle_message(Message::Iso(IsoEvent::CigCreated {
        cig_id: GROUP as u8,
        status: 0,
        conn_handles: vec![cis],
    }));
    f.drain();
    f.notify(conn_id, SINK_ASE_VAL, qos_configured_ntf(1, GROUP as u8, 1));
    f.notify(conn_id, SINK_ASE_VAL, enabling_ntf(1, GROUP as u8, 1));
    f.client.handle_message(Message::Iso(IsoEvent::CisEstablished {
        cis_conn_handle: cis,
        status: 0,
        transport_latency_c_to_p: 10_000,
        transport_latency_p_to_c: 0,
        max_pdu_c_to_p: 40,
        max_pdu_p_to_c: 0,
    }));
    f.drain();
    f.notify(conn_id, SINK_ASE_VAL, streaming_ntf(1, GROUP as u8, 1));
    f.client
        .handle_message(Message::Iso(IsoEvent::DataPathSetup { cis_conn_handle: cis, status: 0 }));
    f.drain();
}

#[tokio::test(start_paused = true)]
async fn peer_timeout_disconnects_active_members() {
    let mut f = Fixture::new();
    install_device(&mut f, 1, 1, 0x01);
    install_device(&mut f, 2, 2, 0x02);
    f.client.group_set_active(GROUP).unwrap();
    f.client.handle_message(Message::SourceSession(AudioSessionEvent::Resume));
    f.drain();

    // Both configure, the CIG is made, but the second peer stalls in QoS.
    f.notify(1, SINK_ASE_VAL, codec_configured_ntf(1));
    f.notify(2, SINK_ASE_VAL, codec_configured_ntf(1));
    f.client.handle_message(Message::Iso(IsoEvent::CigCreated {
        cig_id: GROUP as u8,
        status: 0,
        conn_handles: vec![0x60, 0x61],
    }));
    f.drain();
    f.notify(1, SINK_ASE_VAL, qos_configured_ntf(1, GROUP as u8, 1));
    f.notify(1, SINK_ASE_VAL, enabling_ntf(1, GROUP as u8, 1));

    tokio::time::sleep(Duration::from_millis(DEVICE_SET_STATE_TIMEOUT_MS + 100)).await;
    f.drain();

    assert_eq!(f.source.cancels.get(), 1);
    assert_eq!(f.sink.cancels.get(), 0); // uplink was never requested
    assert_eq!(*f.gatt.acl_disconnects.borrow(), vec![addr(1), addr(2)]);
}

#[tokio::test(start_paused = true)]
async fn late_joiner_forces_reconfiguration_when_layout_is_too_small() {
    let mut f = Fixture::new();
    install_device(&mut f, 1, 1, 0x01);
    f.client.group_set_active(GROUP).unwrap();
    f.client.handle_message(Message::SourceSession(AudioSessionEvent::Resume));
    f.drain();
    run_stream_establishment(&mut f, &[(1, 0x60)]);

    // The second member connects while a one-device layout is streaming.
    install_device(&mut f, 2, 2, 0x02);

    // num_of_devices_in_configuration < num_of_connected: stop and regrow.
    assert_eq!(f.ctp_opcodes(1).last(), Some(&ascs::OPCODE_RELEASE));

    f.notify(1, SINK_ASE_VAL, releasing_ntf(1));
    f.notify(1, SINK_ASE_VAL, idle_ntf(1));
    f.client.handle_message(Message::Iso(IsoEvent::CigRemoved {
        cig_id: GROUP as u8,
        status: 0,
    }));
    f.drain();

    // Reconfiguration now covers both members.
    assert_eq!(f.ctp_opcodes(1).last(), Some(&ascs::OPCODE_CONFIG_CODEC));
    assert_eq!(f.ctp_opcodes(2).last(), Some(&ascs::OPCODE_CONFIG_CODEC));
}

#[tokio::test(start_paused = true)]
async fn reconnecting_member_attaches_seamlessly() {
    let mut f = Fixture::new();
    install_device(&mut f, 1, 1, 0x01);
    install_device(&mut f, 2, 2, 0x02);
    f.client.group_set_active(GROUP).unwrap();
    f.client.handle_message(Message::SourceSession(AudioSessionEvent::Resume));
    f.drain();
    run_stream_establishment(&mut f, &[(1, 0x60), (2, 0x61)]);
    let confirms = f.source.confirms.get();

    // The right side drops and comes back while the stream keeps running.
    f.client.handle_message(Message::Gatt(GattEvent::Close {
        conn_id: 2,
        addr: addr(2),
        reason: DisconnectReason::Remote,
    }));
    f.drain();

    f.client.handle_message(Message::Gatt(GattEvent::Open {
        status: 0,
        conn_id: 2,
        addr: addr(2),
        mtu: 100,
    }));
    f.drain();

    // Two devices fit the two-device layout: no release, direct attach.
    let opcodes = f.ctp_opcodes(2);
    assert_eq!(opcodes.last(), Some(&ascs::OPCODE_CONFIG_CODEC));
    assert!(!f.ctp_opcodes(1).contains(&ascs::OPCODE_RELEASE));

    f.notify(2, SINK_ASE_VAL, codec_configured_ntf(1));
    assert_eq!(f.ctp_opcodes(2).last(), Some(&ascs::OPCODE_CONFIG_QOS));
    f.notify(2, SINK_ASE_VAL, qos_configured_ntf(1, GROUP as u8, 2));
    assert_eq!(f.ctp_opcodes(2).last(), Some(&ascs::OPCODE_ENABLE));
    f.notify(2, SINK_ASE_VAL, enabling_ntf(1, GROUP as u8, 2));

    // It reclaims the CIS slot reserved for CIS id 2.
    assert_eq!(
        f.iso.establishes.borrow().last().unwrap(),
        &vec![CisAclPair { cis_conn_handle: 0x61, acl_conn_handle: 0x0102 }]
    );

    f.client.handle_message(Message::Iso(IsoEvent::CisEstablished {
        cis_conn_handle: 0x61,
        status: 0,
        transport_latency_c_to_p: 10_000,
        transport_latency_p_to_c: 0,
        max_pdu_c_to_p: 120,
        max_pdu_p_to_c: 0,
    }));
    f.drain();
    f.notify(2, SINK_ASE_VAL, streaming_ntf(1, GROUP as u8, 2));
    f.client
        .handle_message(Message::Iso(IsoEvent::DataPathSetup { cis_conn_handle: 0x61, status: 0 }));
    f.drain();

    // No second confirmation: the stream never went down.
    assert_eq!(f.source.confirms.get(), confirms);

    f.client.handle_message(Message::SourceSession(AudioSessionEvent::DataReady {
        data: stereo_pcm_48k(),
    }));
    assert_eq!(*f.iso.sent.borrow(), vec![(0x60, 100), (0x61, 100)]);
}

#[tokio::test(start_paused = true)]
async fn available_contexts_deferred_while_streaming() {
    let mut f = Fixture::new();
    install_device(&mut f, 1, 1, 0x03);
    f.client.group_set_active(GROUP).unwrap();
    f.client.handle_message(Message::SourceSession(AudioSessionEvent::Resume));
    f.drain();
    run_stream_establishment(&mut f, &[(1, 0x60)]);

    let confs_before = f.callbacks.audio_confs.borrow().len();

    // Conversational is withdrawn mid-stream: stash, do not refire.
    f.notify(1, AVAILABLE_CONTEXTS_VAL, vec![0x04, 0x00, 0x00, 0x00]);
    assert_eq!(f.callbacks.audio_confs.borrow().len(), confs_before);

    f.client.group_stop(GROUP);
    f.drain();
    f.notify(1, SINK_ASE_VAL, releasing_ntf(1));
    f.notify(1, SINK_ASE_VAL, idle_ntf(1));

    // Exactly one deferred update, carrying the new contexts.
    let confs = f.callbacks.audio_confs.borrow();
    assert_eq!(confs.len(), confs_before + 1);
    assert_eq!(confs.last().unwrap().1, AudioContexts::MEDIA);
}

#[tokio::test(start_paused = true)]
async fn suspend_then_quick_resume_keeps_the_stream() {
    let mut f = Fixture::new();
    install_device(&mut f, 1, 1, 0x03);
    f.client.group_set_active(GROUP).unwrap();
    f.client.handle_message(Message::SourceSession(AudioSessionEvent::Resume));
    f.drain();
    run_stream_establishment(&mut f, &[(1, 0x60)]);

    let encoders_before = f.lc3.encoders_built.get();
    let writes_before = f.gatt.char_writes.borrow().len();

    f.client
        .handle_message(Message::SourceSession(AudioSessionEvent::Suspend { ack: None }));
    f.client.handle_message(Message::SourceSession(AudioSessionEvent::Resume));
    f.drain();

    // Short sleep inside the keep-alive window: nothing may tear down.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    f.drain();

    assert!(f.iso.removed_cigs.borrow().is_empty());
    assert_eq!(f.lc3.encoders_built.get(), encoders_before);
    assert_eq!(f.gatt.char_writes.borrow().len(), writes_before);
    assert_eq!(f.source.confirms.get(), 2); // start + restore
}

#[tokio::test(start_paused = true)]
async fn explicit_suspend_resumes_over_the_kept_cig() {
    let mut f = Fixture::new();
    install_device(&mut f, 1, 1, 0x03);
    f.client.group_set_active(GROUP).unwrap();
    f.client.handle_message(Message::SourceSession(AudioSessionEvent::Resume));
    f.drain();
    run_stream_establishment(&mut f, &[(1, 0x60)]);
    assert_eq!(f.lc3.encoders_built.get(), 2);

    f.client.group_suspend(GROUP);
    f.drain();
    assert_eq!(f.ctp_opcodes(1).last(), Some(&ascs::OPCODE_DISABLE));

    // The sink ASE drops straight to QoS Configured; the data path comes
    // off but the CIS and the CIG stay.
    f.notify(1, SINK_ASE_VAL, qos_configured_ntf(1, GROUP as u8, 1));
    assert_eq!(*f.iso.removed_paths.borrow(), vec![(0x60, 0x01)]);
    assert!(f.iso.removed_cigs.borrow().is_empty());

    // Resume re-enables and restarts the data path without establishing.
    let establishes_before = f.iso.establishes.borrow().len();
    f.client.handle_message(Message::SourceSession(AudioSessionEvent::Resume));
    f.drain();
    assert_eq!(f.ctp_opcodes(1).last(), Some(&ascs::OPCODE_ENABLE));

    f.notify(1, SINK_ASE_VAL, enabling_ntf(1, GROUP as u8, 1));
    assert_eq!(f.iso.establishes.borrow().len(), establishes_before);
    assert_eq!(f.iso.data_paths.borrow().len(), 2); // initial + resume

    f.notify(1, SINK_ASE_VAL, streaming_ntf(1, GROUP as u8, 1));
    f.client
        .handle_message(Message::Iso(IsoEvent::DataPathSetup { cis_conn_handle: 0x60, status: 0 }));
    f.drain();

    assert_eq!(f.lc3.encoders_built.get(), 4);
    assert_eq!(f.lc3.decoders_built.get(), 0); // no source direction configured
    assert_eq!(f.source.confirms.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn suspend_timeout_stops_the_group() {
    let mut f = Fixture::new();
    install_device(&mut f, 1, 1, 0x03);
    f.client.group_set_active(GROUP).unwrap();
    f.client.handle_message(Message::SourceSession(AudioSessionEvent::Resume));
    f.drain();
    run_stream_establishment(&mut f, &[(1, 0x60)]);

    f.client
        .handle_message(Message::SourceSession(AudioSessionEvent::Suspend { ack: None }));
    f.drain();

    tokio::time::sleep(Duration::from_millis(5100)).await;
    f.drain();

    assert_eq!(f.ctp_opcodes(1).last(), Some(&ascs::OPCODE_RELEASE));
}

#[tokio::test(start_paused = true)]
async fn group_set_active_unknown_deactivates() {
    let mut f = Fixture::new();
    install_device(&mut f, 1, 1, 0x03);
    f.client.group_set_active(GROUP).unwrap();
    f.client.group_set_active(GROUP_ID_UNKNOWN).unwrap();
    assert_eq!(
        *f.callbacks.group_statuses.borrow(),
        vec![(GROUP, GroupStatus::Active), (GROUP, GroupStatus::Inactive)]
    );
}

#[tokio::test(start_paused = true)]
async fn set_member_waits_for_group_module() {
    let mut f = Fixture::new();
    let address = addr(5);
    let conn_id = 5;
    f.gatt.services.borrow_mut().insert(conn_id, device_services());
    {
        let mut values = f.gatt.char_values.borrow_mut();
        values.insert((conn_id, SINK_PAC_VAL), lc3_sink_pac());
        values.insert((conn_id, SINK_LOCATIONS_VAL), vec![0x01, 0x00, 0x00, 0x00]);
        values.insert((conn_id, AVAILABLE_CONTEXTS_VAL), vec![0x06, 0x00, 0x00, 0x00]);
        values.insert((conn_id, SUPPORTED_CONTEXTS_VAL), vec![0x06, 0x00, 0x00, 0x00]);
        values.insert((conn_id, SINK_ASE_VAL), vec![0x01, 0x00]);
    }

    f.client.connect(address);
    f.client.handle_message(Message::Gatt(GattEvent::Open {
        status: 0,
        conn_id,
        addr: address,
        mtu: 100,
    }));
    f.client
        .handle_message(Message::Gatt(GattEvent::SearchComplete { conn_id, success: true }));
    f.drain();

    // A set member is not self-grouped; the coordinated-set module decides.
    assert!(f.device_groups.added.borrow().is_empty());
    assert!(f
        .callbacks
        .connection_states
        .borrow()
        .iter()
        .all(|(state, _)| *state != ConnectionState::Connected));

    f.client
        .handle_message(Message::Group(GroupEvent::GroupAdded { addr: address, group_id: GROUP }));
    f.drain();

    assert!(f
        .callbacks
        .node_statuses
        .borrow()
        .contains(&(address, GROUP, GroupNodeStatus::Added)));
    assert!(f
        .callbacks
        .connection_states
        .borrow()
        .contains(&(ConnectionState::Connected, address)));

    // The first completed connection persists the autoconnect flag.
    assert_eq!(*f.storage.autoconnects.borrow(), vec![(address, true)]);
    assert!(f.gatt.opens.borrow().contains(&(address, true)));
    assert!(f.gatt.searches.borrow().contains(&(conn_id, uuid::PACS_SERVICE)));
}
