// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod limits;

pub use limits::Limits;

use crate::{crypto, endpoint::Config, send::SendState, space::PacketSpaces};
use quiver_core::{
    connection::LocalId,
    endpoint,
    packet::{number::PacketNumberSpace, version::Version},
    transport,
};
use smallvec::SmallVec;
use tracing::{debug, warn};

/// Connection state flags consulted by the egress path
#[derive(Clone, Copy, Debug)]
pub struct State {
    pub encryption_enabled: bool,
    pub header_protection_enabled: bool,
    pub handshake_confirmed: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            encryption_enabled: true,
            header_protection_enabled: true,
            handshake_confirmed: false,
        }
    }
}

/// Transport parameters advertised by the peer that bound the egress path
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerParameters {
    /// Peer's `max_udp_payload_size`, if it advertised one
    pub max_packet_size: Option<u16>,
}

/// A local close of the connection
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Close {
    /// No CONNECTION_CLOSE is sent for a silent close
    pub silent: bool,
    pub code: transport::Error,
    pub reason: &'static str,
    pub is_fatal: bool,
}

/// The connection-side state the packet builder borrows for a flush.
///
/// The builder is the only mutator of `send`, `spaces` and `crypto` while a
/// flush is running; the connection guarantees no concurrent access.
pub struct Connection<C: Config> {
    pub endpoint_type: endpoint::Type,
    pub quic_version: Version,
    /// Connection IDs issued to the peer; the first is stamped into long
    /// headers as the source CID
    pub source_connection_ids: SmallVec<[LocalId; 2]>,
    pub state: State,
    pub peer_parameters: PeerParameters,
    pub limits: Limits,
    pub send: SendState,
    pub spaces: PacketSpaces,
    pub crypto: crypto::State<C::PacketKey, C::HeaderKey>,
    pub congestion_controller: C::CongestionController,
    pub loss_detection: C::LossDetection,
    close: Option<Close>,
}

impl<C: Config> Connection<C> {
    pub fn new(
        endpoint_type: endpoint::Type,
        quic_version: Version,
        crypto: crypto::State<C::PacketKey, C::HeaderKey>,
        congestion_controller: C::CongestionController,
        loss_detection: C::LossDetection,
    ) -> Self {
        Self {
            endpoint_type,
            quic_version,
            source_connection_ids: SmallVec::new(),
            state: State::default(),
            peer_parameters: PeerParameters::default(),
            limits: Limits::default(),
            send: SendState::default(),
            spaces: PacketSpaces::default(),
            crypto,
            congestion_controller,
            loss_detection,
            close: None,
        }
    }

    /// Reports an unrecoverable error and closes the connection.
    ///
    /// Further egress calls on this connection are undefined; the builder
    /// abandons any in-flight batch after reporting one of these.
    pub fn fatal_error(&mut self, reason: &'static str) {
        warn!(reason, "fatal connection error");
        if self.close.is_none() {
            self.close = Some(Close {
                silent: false,
                code: transport::Error::INTERNAL_ERROR,
                reason,
                is_fatal: true,
            });
        }
    }

    /// Closes the connection locally
    pub fn close_locally(&mut self, silent: bool, code: transport::Error, reason: &'static str) {
        debug!(%code, silent, "closing connection");
        if self.close.is_none() {
            self.close = Some(Close {
                silent,
                code,
                reason,
                is_fatal: false,
            });
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.close.is_some()
    }

    #[inline]
    pub fn close(&self) -> Option<&Close> {
        self.close.as_ref()
    }

    /// Advances the 1-RTT key phase after new keys were generated.
    ///
    /// `local_initiated` updates leave the space awaiting confirmation from
    /// the peer, which holds off further send-triggered updates.
    pub fn update_key_phase(&mut self, local_initiated: bool) {
        let space = &mut self.spaces[PacketNumberSpace::ApplicationData];
        space.current_key_phase = space.current_key_phase.next();
        space.current_key_phase_bytes_sent = 0;
        space.awaiting_key_phase_confirmation = local_initiated;
    }
}
