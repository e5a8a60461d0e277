// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Path data consumed by the egress core

use crate::{connection::PeerId, packet::short::SpinBit};
use std::net::SocketAddr;

//= https://www.rfc-editor.org/rfc/rfc9000#section-14
//# QUIC MUST NOT be used if the network path cannot support a
//# maximum datagram size of at least 1200 bytes.

/// The smallest MTU any QUIC path supports; also the floor a client
/// Initial datagram is padded to.
pub const MINIMUM_MTU: u16 = 1200;

/// The largest MTU probed for; path MTU discovery sends datagrams sized
/// for this.
pub const MAX_MTU: u16 = 1500;

pub const UDP_HEADER_LEN: u16 = 8;
pub const IPV4_MIN_HEADER_LEN: u16 = 20;
pub const IPV6_MIN_HEADER_LEN: u16 = 40;

/// Largest UDP payload that fits in `mtu` for the remote address family
#[inline]
pub fn max_udp_payload_for_family(remote_address: &SocketAddr, mtu: u16) -> u16 {
    let ip_header_len = match remote_address {
        SocketAddr::V4(_) => IPV4_MIN_HEADER_LEN,
        SocketAddr::V6(_) => IPV6_MIN_HEADER_LEN,
    };
    mtu.saturating_sub(ip_header_len + UDP_HEADER_LEN)
}

/// A (local, remote) address pair with its transmission limits
#[derive(Clone, Debug)]
pub struct Path {
    pub local_address: SocketAddr,
    pub remote_address: SocketAddr,
    /// Current path MTU, at the IP layer
    pub mtu: u16,
    /// Bytes the path may still carry before address validation completes
    pub allowance: u32,
    pub spin_bit: SpinBit,
    pub destination_connection_id: PeerId,
}

impl Path {
    /// Largest UDP payload this path's remote family allows for `mtu`
    #[inline]
    pub fn max_udp_payload(&self, mtu: u16) -> u16 {
        max_udp_payload_for_family(&self.remote_address, mtu)
    }

    /// True when the local address was explicitly bound rather than
    /// assigned by the stack
    #[inline]
    pub fn is_locally_bound(&self) -> bool {
        !self.local_address.ip().is_unspecified()
    }
}
