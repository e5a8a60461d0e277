// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Test fixtures wiring the egress path to deterministic collaborators

use crate::{connection::Connection, crypto, datapath, endpoint, recovery};
use quiver_core::{
    connection::{LocalId, PeerId},
    crypto::{testing as crypto_testing, KeyType},
    endpoint::Type,
    packet::{short::SpinBit, version},
    path::Path,
    time,
};

#[derive(Debug)]
pub struct Config;

impl endpoint::Config for Config {
    type PacketKey = crypto_testing::Key;
    type HeaderKey = crypto_testing::HeaderKey;
    type CongestionController = recovery::testing::CongestionController;
    type LossDetection = recovery::testing::LossDetection;
    type Datapath = datapath::testing::Datapath;
    type Clock = time::testing::Clock;
}

/// The source connection ID stamped into long headers by test connections
pub const SOURCE_CID: &[u8] = &[0xfe, 0xed, 0xfa, 0xce];

/// The destination connection ID used by [`path`]
pub const DEST_CID: &[u8] = &[0xc0, 0xff, 0xee, 0x00, 0xc0, 0xff, 0xee, 0x00];

/// A connection with no write keys installed; push keys with
/// [`install_keys`]
pub fn connection(endpoint_type: Type) -> Connection<Config> {
    let mut connection = Connection::new(
        endpoint_type,
        version::DRAFT_24,
        crypto::State::new(),
        recovery::testing::CongestionController::new(u32::MAX),
        recovery::testing::LossDetection::new(),
    );
    connection
        .source_connection_ids
        .push(LocalId::try_from(SOURCE_CID).unwrap());
    connection
}

pub fn client_connection() -> Connection<Config> {
    connection(Type::Client)
}

pub fn server_connection() -> Connection<Config> {
    connection(Type::Server)
}

/// Installs a deterministic key set at `key_type`
pub fn install_keys(connection: &mut Connection<Config>, key_type: KeyType) {
    connection.crypto.install(
        key_type,
        crypto_testing::Key::new(),
        crypto_testing::HeaderKey::new(),
    );
}

/// An IPv4 path with a bound local address and a 1350-byte MTU
pub fn path() -> Path {
    Path {
        local_address: "192.0.2.1:4433".parse().unwrap(),
        remote_address: "192.0.2.2:443".parse().unwrap(),
        mtu: 1350,
        allowance: u32::MAX,
        spin_bit: SpinBit::Zero,
        destination_connection_id: PeerId::try_from(DEST_CID).unwrap(),
    }
}
