// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod builder;

#[cfg(test)]
mod tests;

pub use builder::PacketBuilder;

/// Most datagrams one flush may hand to the datapath
pub const MAX_DATAGRAMS_PER_SEND: u8 = 40;

/// Smallest writable region worth preparing another packet into.
///
/// Once the space left in a datagram (after encryption overhead) drops
/// below this, the datagram is completed instead of coalescing further.
pub const MIN_PACKET_SPARE_SPACE: u16 = 64;

/// Short-header packets whose header protection is computed in one batch
pub const MAX_CRYPTO_BATCH_COUNT: usize = 16;

/// What a framer wrote into a prepared packet
#[derive(Clone, Copy, Debug, Default)]
pub struct Outcome {
    pub frames: u8,
    /// Set when any written frame counts toward bytes in flight
    pub is_retransmittable: bool,
    /// Set when a CRYPTO frame was written
    pub has_crypto: bool,
}

/// Soft failures of the egress path; the flush loop drops the intent for
/// this cycle and retries later
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// The connection has no source connection ID to stamp into headers
    #[error("no source connection id available")]
    NoSourceCid,
    /// The datapath could not allocate a send context or datagram
    #[error("datapath allocation failed")]
    AllocFailure,
    /// This flush already produced `MAX_DATAGRAMS_PER_SEND` datagrams
    #[error("datagram batch is full")]
    BatchFull,
    /// The selector was invoked without a sendable control frame
    #[error("no packet type satisfies the requested frames")]
    InvalidSelector,
}
