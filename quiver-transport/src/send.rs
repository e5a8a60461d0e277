// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use core::{fmt, ops::BitOr};
use quiver_core::time::Timestamp;

/// Pending send reasons for a connection.
///
/// The packet-type selector turns a set of these into a concrete packet
/// type and key; see `transmission::PacketBuilder::prepare_for_control_frames`.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct Flags(u32);

impl Flags {
    pub const ACK: Self = Self(1 << 0);
    pub const CRYPTO: Self = Self(1 << 1);
    pub const CONNECTION_CLOSE: Self = Self(1 << 2);
    pub const APPLICATION_CLOSE: Self = Self(1 << 3);
    pub const PING: Self = Self(1 << 4);
    pub const PATH_CHALLENGE: Self = Self(1 << 5);
    pub const PATH_RESPONSE: Self = Self(1 << 6);
    pub const NEW_CONNECTION_ID: Self = Self(1 << 7);
    pub const MAX_DATA: Self = Self(1 << 8);
    pub const PATH_MTU_DISCOVERY: Self = Self(1 << 9);

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Flags {
    type Output = Self;

    #[inline]
    fn bitor(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut list = f.debug_list();
        for (flag, name) in [
            (Self::ACK, "ACK"),
            (Self::CRYPTO, "CRYPTO"),
            (Self::CONNECTION_CLOSE, "CONNECTION_CLOSE"),
            (Self::APPLICATION_CLOSE, "APPLICATION_CLOSE"),
            (Self::PING, "PING"),
            (Self::PATH_CHALLENGE, "PATH_CHALLENGE"),
            (Self::PATH_RESPONSE, "PATH_RESPONSE"),
            (Self::NEW_CONNECTION_ID, "NEW_CONNECTION_ID"),
            (Self::MAX_DATA, "MAX_DATA"),
            (Self::PATH_MTU_DISCOVERY, "PATH_MTU_DISCOVERY"),
        ] {
            if self.contains(flag) {
                list.entry(&name);
            }
        }
        list.finish()
    }
}

/// Connection-wide send bookkeeping mutated by the packet builder
#[derive(Debug, Default)]
pub struct SendState {
    /// The next packet number to allocate. A single allocator is shared by
    /// all encryption levels, which keeps numbers strictly increasing
    /// within each level.
    pub next_packet_number: u64,
    pub last_flush_time: Option<Timestamp>,
    /// Token echoed into Initial packets, from a Retry or NEW_TOKEN
    pub initial_token: Bytes,
}
