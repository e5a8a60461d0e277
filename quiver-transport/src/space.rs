// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::ops::{Index, IndexMut};
use quiver_core::packet::{number::PacketNumberSpace, KeyPhase};

/// Receive-side state the egress path consults when deciding whether a
/// level has ACK-eliciting packets waiting to be acknowledged
#[derive(Debug, Default)]
pub struct AckTracker {
    pub ack_eliciting_packets_to_acknowledge: u64,
}

/// Per-encryption-level bookkeeping
#[derive(Debug, Default)]
pub struct PacketSpace {
    pub current_key_phase: KeyPhase,
    /// Plaintext bytes sealed under the current key phase; drives the
    /// send-triggered key update
    pub current_key_phase_bytes_sent: u64,
    pub awaiting_key_phase_confirmation: bool,
    pub ack_tracker: AckTracker,
}

#[derive(Debug, Default)]
pub struct PacketSpaces([PacketSpace; PacketNumberSpace::COUNT]);

impl Index<PacketNumberSpace> for PacketSpaces {
    type Output = PacketSpace;

    #[inline]
    fn index(&self, space: PacketNumberSpace) -> &Self::Output {
        &self.0[space.index()]
    }
}

impl IndexMut<PacketNumberSpace> for PacketSpaces {
    #[inline]
    fn index_mut(&mut self, space: PacketNumberSpace) -> &mut Self::Output {
        &mut self.0[space.index()]
    }
}
