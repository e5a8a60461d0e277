// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The datapath seam.
//!
//! A send context holds the datagrams queued for one `sendmsg`-class call;
//! the builder owns it from allocation until dispatch, after which
//! ownership transfers to the datapath. Allocation never blocks; failures
//! return `None` and the caller drops the intent for this flush.

use std::net::SocketAddr;

/// Handle to a datagram inside a send context
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DatagramId(pub usize);

/// A batch of datagrams destined for a single transmission
pub trait SendContext {
    /// Allocates a datagram buffer of exactly `len` bytes
    fn alloc_datagram(&mut self, len: u16) -> Option<DatagramId>;

    /// The full buffer for `id`.
    ///
    /// Buffers stay addressable until the context is sent; the builder
    /// rewrites already-committed datagrams when it flushes batched header
    /// protection.
    fn datagram_mut(&mut self, id: DatagramId) -> &mut [u8];

    /// Releases a datagram that ended up empty
    fn free_datagram(&mut self, id: DatagramId);

    /// Records the final length of a completed datagram
    fn commit_datagram(&mut self, id: DatagramId, len: u16);

    /// True once the context cannot take another datagram
    fn is_full(&self) -> bool;
}

pub trait Datapath {
    type SendContext: SendContext;

    /// Allocates a context sized for datagrams of `ideal_datagram_len`
    /// bytes (zero requests a single maximum-size datagram)
    fn alloc_send_context(&mut self, ideal_datagram_len: u16) -> Option<Self::SendContext>;

    /// True when the datapath buffers a batch contiguously and wants every
    /// datagram but the last padded to full length
    fn is_padding_preferred(&self) -> bool;

    /// Transmits from the bound local address
    fn send_to(&mut self, remote: SocketAddr, context: Self::SendContext);

    /// Transmits with an explicit local address
    fn send_from_to(&mut self, local: SocketAddr, remote: SocketAddr, context: Self::SendContext);
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::{DatagramId, SocketAddr};

    /// A recorded transmission
    #[derive(Debug)]
    pub struct Transmission {
        pub local: Option<SocketAddr>,
        pub remote: SocketAddr,
        pub datagrams: Vec<Vec<u8>>,
    }

    #[derive(Debug)]
    struct Datagram {
        buffer: Vec<u8>,
        committed_len: Option<u16>,
        freed: bool,
    }

    #[derive(Debug)]
    pub struct SendContext {
        datagrams: Vec<Datagram>,
        capacity: usize,
        fail_datagram_alloc: bool,
        pub ideal_datagram_len: u16,
    }

    impl super::SendContext for SendContext {
        fn alloc_datagram(&mut self, len: u16) -> Option<DatagramId> {
            if self.fail_datagram_alloc || self.is_full() {
                return None;
            }
            self.datagrams.push(Datagram {
                buffer: vec![0; len as usize],
                committed_len: None,
                freed: false,
            });
            Some(DatagramId(self.datagrams.len() - 1))
        }

        fn datagram_mut(&mut self, id: DatagramId) -> &mut [u8] {
            &mut self.datagrams[id.0].buffer
        }

        fn free_datagram(&mut self, id: DatagramId) {
            let datagram = &mut self.datagrams[id.0];
            assert!(datagram.committed_len.is_none());
            datagram.freed = true;
        }

        fn commit_datagram(&mut self, id: DatagramId, len: u16) {
            let datagram = &mut self.datagrams[id.0];
            assert!(!datagram.freed);
            assert!(len as usize <= datagram.buffer.len());
            datagram.committed_len = Some(len);
        }

        fn is_full(&self) -> bool {
            self.datagrams.iter().filter(|d| !d.freed).count() >= self.capacity
        }
    }

    impl SendContext {
        fn into_datagrams(self) -> Vec<Vec<u8>> {
            self.datagrams
                .into_iter()
                .filter(|datagram| !datagram.freed)
                .map(|datagram| {
                    let len = datagram.committed_len.expect("datagram was never committed") as usize;
                    let mut buffer = datagram.buffer;
                    buffer.truncate(len);
                    buffer
                })
                .collect()
        }
    }

    #[derive(Debug)]
    pub struct Datapath {
        pub padding_preferred: bool,
        /// Datagrams a single send context can hold
        pub context_capacity: usize,
        pub fail_context_alloc: bool,
        pub fail_datagram_alloc: bool,
        pub sent: Vec<Transmission>,
    }

    impl Default for Datapath {
        fn default() -> Self {
            Self {
                padding_preferred: false,
                context_capacity: crate::transmission::MAX_DATAGRAMS_PER_SEND as usize,
                fail_context_alloc: false,
                fail_datagram_alloc: false,
                sent: Vec::new(),
            }
        }
    }

    impl Datapath {
        pub fn new() -> Self {
            Self::default()
        }

        /// All datagrams sent so far, flattened across transmissions
        pub fn datagrams(&self) -> impl Iterator<Item = &Vec<u8>> {
            self.sent.iter().flat_map(|t| t.datagrams.iter())
        }
    }

    impl super::Datapath for Datapath {
        type SendContext = SendContext;

        fn alloc_send_context(&mut self, ideal_datagram_len: u16) -> Option<Self::SendContext> {
            if self.fail_context_alloc {
                return None;
            }
            Some(SendContext {
                datagrams: Vec::new(),
                capacity: self.context_capacity,
                fail_datagram_alloc: self.fail_datagram_alloc,
                ideal_datagram_len,
            })
        }

        fn is_padding_preferred(&self) -> bool {
            self.padding_preferred
        }

        fn send_to(&mut self, remote: SocketAddr, context: Self::SendContext) {
            self.sent.push(Transmission {
                local: None,
                remote,
                datagrams: context.into_datagrams(),
            });
        }

        fn send_from_to(
            &mut self,
            local: SocketAddr,
            remote: SocketAddr,
            context: Self::SendContext,
        ) {
            self.sent.push(Transmission {
                local: Some(local),
                remote,
                datagrams: context.into_datagrams(),
            });
        }
    }
}
