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

//! HCI/ISO manager boundary: CIG and CIS control, ISO data paths and the
//! SDU plane.

/// Parameters of one CIS inside a CIG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CisParameters {
    pub cis_id: u8,
    pub max_sdu_c_to_p: u16,
    pub max_sdu_p_to_c: u16,
    pub phy_c_to_p: u8,
    pub phy_p_to_c: u8,
    pub rtn_c_to_p: u8,
    pub rtn_p_to_c: u8,
}

/// Parameters of a Connected Isochronous Group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CigParameters {
    pub sdu_interval_c_to_p: u32,
    pub sdu_interval_p_to_c: u32,
    pub worst_case_sca: u8,
    pub packing: u8,
    pub framing: u8,
    pub max_transport_latency_c_to_p: u16,
    pub max_transport_latency_p_to_c: u16,
    pub cis: Vec<CisParameters>,
}

/// CIS / ACL handle pair for CIS establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CisAclPair {
    pub cis_conn_handle: u16,
    pub acl_conn_handle: u16,
}

pub const DATA_PATH_INPUT: u8 = 0x00;
pub const DATA_PATH_OUTPUT: u8 = 0x01;

/// Data path over HCI.
pub const DATA_PATH_ID_HCI: u8 = 0x00;

/// Parameters of a Setup ISO Data Path command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoDataPathParameters {
    pub cis_conn_handle: u16,
    pub data_path_direction: u8,
    pub data_path_id: u8,
}

/// ISO manager boundary. Commands return immediately; completions arrive as
/// [`IsoEvent`]s posted to the main loop.
pub trait IsoManager {
    fn create_cig(&self, cig_id: u8, params: CigParameters);
    fn remove_cig(&self, cig_id: u8);
    fn establish_cis(&self, pairs: Vec<CisAclPair>);
    fn disconnect_cis(&self, cis_conn_handle: u16, reason: u8);
    fn setup_iso_data_path(&self, params: IsoDataPathParameters);
    fn remove_iso_data_path(&self, cis_conn_handle: u16, direction_mask: u8);
    fn send_iso_data(&self, cis_conn_handle: u16, data: &[u8]);
    fn read_iso_link_quality(&self, cis_conn_handle: u16);
}

pub const ISO_STATUS_SUCCESS: u8 = 0x00;

/// ISO manager completions and data, in main-loop message form.
#[derive(Debug)]
pub enum IsoEvent {
    CigCreated {
        cig_id: u8,
        status: u8,
        conn_handles: Vec<u16>,
    },
    CigRemoved {
        cig_id: u8,
        status: u8,
    },
    CisEstablished {
        cis_conn_handle: u16,
        status: u8,
        transport_latency_c_to_p: u32,
        transport_latency_p_to_c: u32,
        max_pdu_c_to_p: u16,
        max_pdu_p_to_c: u16,
    },
    CisDisconnected {
        cis_conn_handle: u16,
        reason: u8,
    },
    DataPathSetup {
        cis_conn_handle: u16,
        status: u8,
    },
    DataPathRemoved {
        cis_conn_handle: u16,
        status: u8,
    },
    DataAvailable {
        cis_conn_handle: u16,
        timestamp: u32,
        data: Vec<u8>,
    },
    LinkQuality {
        cis_conn_handle: u16,
        tx_unacked_packets: u32,
        tx_flushed_packets: u32,
        tx_last_subevent_packets: u32,
        retransmitted_packets: u32,
        crc_error_packets: u32,
        rx_unreceived_packets: u32,
        duplicate_packets: u32,
    },
}
