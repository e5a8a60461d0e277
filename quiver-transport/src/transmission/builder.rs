// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Builds up a chain of UDP datagrams, each carrying one or more QUIC
//! packets. As needed it allocates datagrams from the datapath, writes
//! packet headers, finalizes packet protection and sends the batch off.

use crate::{
    connection::Connection,
    datapath::{Datapath, DatagramId, SendContext},
    endpoint::Config,
    recovery::{CongestionController, LossDetection, SentPacketInfo},
    send,
    transmission::{
        Error, Outcome, MAX_CRYPTO_BATCH_COUNT, MAX_DATAGRAMS_PER_SEND, MIN_PACKET_SPARE_SPACE,
    },
};
use core::time::Duration;
use quiver_core::{
    connection::LocalId,
    crypto::{
        self, HeaderKey, KeyType, PacketKey, HEADER_PROTECTION_MASK_LEN, HP_SAMPLE_LEN,
        LONG_HEADER_MASK, SHORT_HEADER_MASK,
    },
    packet::{
        long,
        number::{PacketNumberLen, PacketNumberSpace},
        short, version, PacketType,
    },
    path::{self, Path},
    stateless_reset,
    time::Clock,
    transport,
};
use s2n_codec::{Encoder, EncoderBuffer, EncoderValue};
use tracing::{debug, warn};

const HP_MASK_LEN: usize = MAX_CRYPTO_BATCH_COUNT * HEADER_PROTECTION_MASK_LEN;
const CIPHER_BATCH_LEN: usize = MAX_CRYPTO_BATCH_COUNT * HP_SAMPLE_LEN;

/// The QUIC packet currently being written into the datagram
struct Packet {
    packet_type: PacketType,
    key_type: KeyType,
    /// Offset of the packet within the datagram
    packet_start: u16,
    header_length: u16,
    packet_number_length: PacketNumberLen,
    /// Offset of the payload-length field from `packet_start`; long
    /// headers only
    payload_length_offset: u16,
    metadata: SentPacketInfo,
}

/// A short-header packet waiting for batched header protection
#[derive(Clone, Copy, Default)]
struct BatchEntry {
    datagram: DatagramId,
    packet_start: u16,
    packet_number_len: u8,
}

/// Assembles and dispatches one flush worth of packets for a
/// (connection, path) pair.
///
/// The builder holds at most one in-progress packet and one in-progress
/// datagram. It is created at flush start and must be torn down with
/// [`cleanup`](Self::cleanup), which finalizes and sends anything still
/// pending.
pub struct PacketBuilder<'a, C: Config> {
    connection: &'a mut Connection<C>,
    path: &'a Path,
    datapath: &'a mut C::Datapath,
    clock: &'a C::Clock,
    source_connection_id: LocalId,

    send_context: Option<<C::Datapath as Datapath>::SendContext>,
    datagram: Option<DatagramId>,
    datagram_capacity: u16,
    datagram_length: u16,
    minimum_datagram_length: u16,
    packet: Option<Packet>,

    total_datagrams: u8,
    send_allowance: u32,
    encryption_overhead: u16,
    packet_batch_sent: bool,
    packet_batch_retransmittable: bool,

    batch_count: usize,
    header_batch: [BatchEntry; MAX_CRYPTO_BATCH_COUNT],
    cipher_batch: [u8; CIPHER_BATCH_LEN],
    hp_mask: [u8; HP_MASK_LEN],
}

impl<'a, C: Config> PacketBuilder<'a, C> {
    /// Prepares a builder for one flush over `path`.
    ///
    /// Seeds the send allowance from the congestion controller, bounded by
    /// the path's address-validation allowance, and stamps the flush time.
    pub fn new(
        connection: &'a mut Connection<C>,
        path: &'a Path,
        datapath: &'a mut C::Datapath,
        clock: &'a C::Clock,
    ) -> Result<Self, Error> {
        let Some(source_connection_id) = connection.source_connection_ids.first().copied() else {
            warn!("no source connection id to send with");
            return Err(Error::NoSourceCid);
        };

        let encryption_overhead = if connection.state.encryption_enabled {
            crypto::ENCRYPTION_OVERHEAD
        } else {
            0
        };

        let now = clock.get_time();
        let (time_since_last_flush, valid) = match connection.send.last_flush_time {
            Some(last_flush) => (now.saturating_duration_since(last_flush), true),
            None => (Duration::ZERO, false),
        };
        let allowance = connection
            .congestion_controller
            .send_allowance(time_since_last_flush, valid);
        let send_allowance = allowance.min(path.allowance);
        connection.send.last_flush_time = Some(now);

        Ok(Self {
            connection,
            path,
            datapath,
            clock,
            source_connection_id,
            send_context: None,
            datagram: None,
            datagram_capacity: 0,
            datagram_length: 0,
            minimum_datagram_length: 0,
            packet: None,
            total_datagrams: 0,
            send_allowance,
            encryption_overhead,
            packet_batch_sent: false,
            packet_batch_retransmittable: false,
            batch_count: 0,
            header_batch: [BatchEntry::default(); MAX_CRYPTO_BATCH_COUNT],
            cipher_batch: [0; CIPHER_BATCH_LEN],
            hp_mask: [0; HP_MASK_LEN],
        })
    }

    /// Bytes this flush may still emit
    #[inline]
    pub fn send_allowance(&self) -> u32 {
        self.send_allowance
    }

    /// Datagrams completed so far in this flush
    #[inline]
    pub fn total_datagrams(&self) -> u8 {
        self.total_datagrams
    }

    /// Bytes the framer can still write into the current packet
    #[inline]
    pub fn remaining_payload_capacity(&self) -> usize {
        if self.datagram.is_none() {
            return 0;
        }
        usize::from(self.datagram_capacity - self.encryption_overhead - self.datagram_length)
    }

    /// Short-header packets waiting for batched header protection
    #[inline]
    pub fn pending_header_protection(&self) -> usize {
        self.batch_count
    }

    /// Chooses the packet type and key for a set of pending control
    /// frames.
    ///
    /// Encryption levels are walked in priority order up to the current
    /// write key; 1-RTT always wins once available. ACKs only select a
    /// level that has ACK-eliciting packets to acknowledge, and CRYPTO only
    /// the level the handshake currently sends at.
    pub(crate) fn packet_type_and_key_for_control_frames(
        &self,
        send_flags: send::Flags,
    ) -> Option<(PacketType, KeyType)> {
        debug_assert!(!send_flags.is_empty());
        let crypto = &self.connection.crypto;

        for key_type in KeyType::up_to(crypto.write_key_level()) {
            if crypto.write_keys(key_type).is_none() {
                // key has been discarded
                continue;
            }

            if key_type == KeyType::OneRtt {
                // always allowed to send with 1-RTT
                return Some((PacketType::Short, KeyType::OneRtt));
            }

            let space = key_type.space();

            if send_flags.contains(send::Flags::ACK)
                && self.connection.spaces[space]
                    .ack_tracker
                    .ack_eliciting_packets_to_acknowledge
                    != 0
            {
                return Some((key_type.packet_type(), key_type));
            }

            if send_flags.contains(send::Flags::CRYPTO)
                && crypto.has_pending_crypto_frame()
                && crypto.next_encrypt_level() == Some(space)
            {
                return Some((key_type.packet_type(), key_type));
            }
        }

        if send_flags.intersects(
            send::Flags::CONNECTION_CLOSE | send::Flags::APPLICATION_CLOSE | send::Flags::PING,
        ) {
            // Sent with the current write key, even though the peer might
            // not be able to read it before handshake confirmation.
            let level = crypto.write_key_level();
            if crypto.write_keys(level).is_some() {
                return Some((level.packet_type(), level));
            }
        }

        None
    }

    /// Prepares a packet for pending control frames, picking the type and
    /// key with the selector above
    pub fn prepare_for_control_frames(
        &mut self,
        is_tail_loss_probe: bool,
        send_flags: send::Flags,
    ) -> Result<(), Error> {
        debug_assert!(!send_flags.contains(send::Flags::PATH_MTU_DISCOVERY));

        let Some((packet_type, key_type)) =
            self.packet_type_and_key_for_control_frames(send_flags)
        else {
            warn!(?send_flags, "no packet type satisfies the pending control frames");
            debug_assert!(false, "selector invoked without a sendable control frame");
            return Err(Error::InvalidSelector);
        };

        self.prepare(packet_type, key_type, is_tail_loss_probe, false)
    }

    /// Prepares a packet for stream data. 0-RTT is used only while the
    /// 1-RTT key is unavailable.
    pub fn prepare_for_stream_frames(&mut self, is_tail_loss_probe: bool) -> Result<(), Error> {
        let crypto = &self.connection.crypto;
        let (packet_type, key_type) = if crypto.write_keys(KeyType::ZeroRtt).is_some()
            && crypto.write_keys(KeyType::OneRtt).is_none()
        {
            (PacketType::ZeroRtt, KeyType::ZeroRtt)
        } else {
            debug_assert!(crypto.write_keys(KeyType::OneRtt).is_some());
            (PacketType::Short, KeyType::OneRtt)
        };

        self.prepare(packet_type, key_type, is_tail_loss_probe, false)
    }

    /// Prepares a maximum-size probe datagram for path MTU discovery.
    ///
    /// Callers must have validated the path (`path.allowance >= path.mtu`).
    pub fn prepare_for_path_mtu_discovery(&mut self) -> Result<(), Error> {
        debug_assert!(self.connection.crypto.write_keys(KeyType::OneRtt).is_some());
        self.prepare(PacketType::Short, KeyType::OneRtt, false, true)
    }

    /// Makes sure a writable datagram region exists for `new_packet_type`.
    ///
    /// An in-progress packet of the same type is reused; a mismatched one
    /// is finalized first and a new packet is started, allocating a send
    /// context and datagram as necessary.
    pub fn prepare(
        &mut self,
        new_packet_type: PacketType,
        new_key_type: KeyType,
        is_tail_loss_probe: bool,
        is_path_mtu_discovery: bool,
    ) -> Result<(), Error> {
        debug_assert!(!(is_tail_loss_probe && is_path_mtu_discovery));

        let mut datagram_size = self.path.mtu;
        if u32::from(datagram_size) > self.path.allowance {
            // PMTUD only runs after source address validation
            debug_assert!(!is_path_mtu_discovery);
            datagram_size = self.path.allowance as u16;
        }

        // The current packet cannot take the new data; finalize it so a new
        // one can be started. PMTUD always gets a datagram of its own.
        let needs_finalize = is_path_mtu_discovery
            || self
                .packet
                .as_ref()
                .is_some_and(|packet| packet.packet_type != new_packet_type);
        if needs_finalize && self.send_context.is_some() {
            self.finalize(is_path_mtu_discovery);
        }

        if self.datagram.is_none() {
            if self.send_context.is_none() {
                if self.total_datagrams >= MAX_DATAGRAMS_PER_SEND {
                    return Err(Error::BatchFull);
                }

                let ideal_datagram_len = if is_path_mtu_discovery {
                    0
                } else {
                    self.path.max_udp_payload(datagram_size)
                };
                let Some(context) = self.datapath.alloc_send_context(ideal_datagram_len) else {
                    warn!(len = ideal_datagram_len, "send context allocation failed");
                    return Err(Error::AllocFailure);
                };
                self.send_context = Some(context);
            }

            let mut new_datagram_length = self.path.max_udp_payload(if is_path_mtu_discovery {
                path::MAX_MTU
            } else {
                datagram_size
            });
            if let Some(max_packet_size) = self.connection.peer_parameters.max_packet_size {
                new_datagram_length = new_datagram_length.min(max_packet_size);
            }

            let context = self
                .send_context
                .as_mut()
                .expect("send context was allocated above");
            let Some(id) = context.alloc_datagram(new_datagram_length) else {
                warn!(len = new_datagram_length, "datagram allocation failed");
                return Err(Error::AllocFailure);
            };
            self.datagram = Some(id);
            self.datagram_capacity = new_datagram_length;
            self.datagram_length = 0;
            self.minimum_datagram_length = 0;

            if is_tail_loss_probe && self.connection.endpoint_type.is_client() {
                if self.connection.crypto.write_key_level() == KeyType::OneRtt {
                    // Short-header probes need enough length to elicit a
                    // stateless reset from the server.
                    self.minimum_datagram_length = stateless_reset::RECOMMENDED_PACKET_LEN + 8;
                } else {
                    // Initial/Handshake probes are fully padded to unblock a
                    // server stuck on source address validation.
                    self.minimum_datagram_length = new_datagram_length;
                }
            } else if new_packet_type == PacketType::Initial
                && self.connection.endpoint_type.is_client()
            {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
                //# A client MUST expand the payload of all UDP datagrams carrying
                //# Initial packets to at least the smallest allowed maximum datagram
                //# size of 1200 bytes
                self.minimum_datagram_length = path::MINIMUM_MTU.min(new_datagram_length);
            } else if is_path_mtu_discovery {
                self.minimum_datagram_length = new_datagram_length;
            }

            debug!(space = new_datagram_length, "new udp datagram");
        } else {
            debug_assert!(
                self.datagram_capacity - self.datagram_length >= MIN_PACKET_SPARE_SPACE
            );
        }

        if self.packet.is_none() {
            self.start_packet(new_packet_type, new_key_type, is_path_mtu_discovery);
        }

        debug_assert!(self
            .packet
            .as_ref()
            .is_some_and(|packet| packet.packet_type == new_packet_type
                && packet.key_type == new_key_type));

        Ok(())
    }

    /// Allocates a packet number and writes the header for a new packet at
    /// the current datagram cursor
    fn start_packet(
        &mut self,
        packet_type: PacketType,
        key_type: KeyType,
        is_path_mtu_discovery: bool,
    ) {
        debug_assert!(version::is_supported(self.connection.quic_version));

        let packet_number = self.connection.send.next_packet_number;
        self.connection.send.next_packet_number += 1;

        let mut metadata = SentPacketInfo::new(packet_number, key_type);
        metadata.is_path_mtu_discovery = is_path_mtu_discovery;

        let packet_start = self.datagram_length;
        let id = self.datagram.expect("prepare allocated a datagram");

        // TODO: size the packet number from the unacknowledged range
        // instead of always writing 4 bytes
        let packet_number_length = PacketNumberLen::MAX;
        let truncated_packet_number = packet_number_length.truncate(packet_number);

        let context = self
            .send_context
            .as_mut()
            .expect("datagram implies a send context");
        let buffer = context.datagram_mut(id);
        let available = &mut buffer[packet_start as usize..];
        debug_assert!(available.len() >= MIN_PACKET_SPARE_SPACE as usize);

        let mut encoder = EncoderBuffer::new(available);
        let payload_length_offset;

        if packet_type == PacketType::Short {
            let space = &self.connection.spaces[PacketNumberSpace::ApplicationData];
            metadata.key_phase = space.current_key_phase;
            short::Short {
                spin_bit: self.path.spin_bit,
                key_phase: space.current_key_phase,
                destination_connection_id: self.path.destination_connection_id.as_slice(),
                packet_number: truncated_packet_number,
            }
            .encode(&mut encoder);
            payload_length_offset = 0;
        } else {
            let header = long::Long {
                version: self.connection.quic_version,
                packet_type,
                destination_connection_id: self.path.destination_connection_id.as_slice(),
                source_connection_id: self.source_connection_id.as_slice(),
                token: &self.connection.send.initial_token,
                packet_number: truncated_packet_number,
            };
            payload_length_offset = header.payload_len_offset() as u16;
            header.encode(&mut encoder);
        }

        let header_length = encoder.len() as u16;
        self.datagram_length += header_length;

        debug!(
            packet_type = ?packet_type,
            packet_number,
            "new quic packet"
        );

        self.packet = Some(Packet {
            packet_type,
            key_type,
            packet_start,
            header_length,
            packet_number_length,
            payload_length_offset,
            metadata,
        });
    }

    /// Hands the writable payload region to a framer.
    ///
    /// The framer writes wire-formatted frames into the encoder and reports
    /// what it wrote; the packet's flags and frame count are folded in.
    /// Returns `false` when no packet is prepared.
    pub fn write_frames<F>(&mut self, framer: F) -> bool
    where
        F: FnOnce(&mut EncoderBuffer) -> Outcome,
    {
        let Some(packet) = self.packet.as_mut() else {
            debug_assert!(false, "write_frames called without a prepared packet");
            return false;
        };
        let id = self.datagram.expect("packet implies a datagram");
        let context = self
            .send_context
            .as_mut()
            .expect("packet implies a send context");

        let buffer = context.datagram_mut(id);
        let end = (self.datagram_capacity - self.encryption_overhead) as usize;
        let mut encoder = EncoderBuffer::new(&mut buffer[self.datagram_length as usize..end]);

        let outcome = framer(&mut encoder);
        let written = encoder.len() as u16;

        self.datagram_length += written;
        packet.metadata.frame_count = packet.metadata.frame_count.saturating_add(outcome.frames);
        packet.metadata.is_retransmittable |= outcome.is_retransmittable;
        packet.metadata.has_crypto |= outcome.has_crypto;

        true
    }

    /// Completes the current QUIC packet: pads, encrypts, header-protects
    /// and records it. When the datagram is full (or `all_done_sending`),
    /// the datagram is completed too, and a full send context is dispatched.
    ///
    /// A packet with no frames written is abandoned: its packet number is
    /// returned to the connection and the header is rewound.
    pub fn finalize(&mut self, all_done_sending: bool) {
        let mut final_quic_packet = false;
        let mut finalized_packet_type = None;

        match self.packet.take() {
            None => {
                final_quic_packet = all_done_sending;
            }
            Some(packet) if packet.metadata.frame_count == 0 => {
                // Nothing was framed into this packet; undo its header and
                // give the packet number back.
                self.connection.send.next_packet_number -= 1;
                self.datagram_length -= packet.header_length;

                if self.datagram_length == 0 {
                    if let (Some(context), Some(id)) =
                        (self.send_context.as_mut(), self.datagram.take())
                    {
                        context.free_datagram(id);
                    }
                }
                final_quic_packet = all_done_sending;
            }
            Some(mut packet) => match self.complete_packet(&mut packet, all_done_sending) {
                Ok(is_final) => {
                    final_quic_packet = is_final;
                    finalized_packet_type = Some(packet.packet_type);
                }
                Err(()) => {
                    // fatal error already reported; drop the batch unsent
                    self.abandon();
                    return;
                }
            },
        }

        if final_quic_packet {
            if let Some(id) = self.datagram.take() {
                let context = self
                    .send_context
                    .as_mut()
                    .expect("datagram implies a send context");
                context.commit_datagram(id, self.datagram_length);
                self.total_datagrams += 1;
            }

            let context_full = self
                .send_context
                .as_ref()
                .is_some_and(|context| context.is_full());
            if self.send_context.is_some() && (all_done_sending || context_full) {
                if self.batch_count != 0 && self.flush_header_protection().is_err() {
                    self.abandon();
                    return;
                }
                self.send_batch();
            }

            if finalized_packet_type == Some(PacketType::Retry) {
                // Retry is a one-shot server artifact; the connection that
                // produced it goes away without telling the peer anything.
                self.connection
                    .close_locally(true, transport::Error::NO_ERROR, "retry sent");
            }
        }
    }

    /// Pads, rewrites the payload length, encrypts and records a non-empty
    /// packet. Returns whether this was the final packet in the datagram.
    ///
    /// `Err` means a fatal error was reported to the connection; the packet
    /// must not be sent.
    fn complete_packet(
        &mut self,
        packet: &mut Packet,
        all_done_sending: bool,
    ) -> Result<bool, ()> {
        let id = self.datagram.expect("packet implies a datagram");
        let capacity = self.datagram_capacity;

        debug_assert!(capacity >= self.datagram_length + self.encryption_overhead);
        debug_assert!(capacity >= self.minimum_datagram_length);
        debug_assert!(packet.metadata.frame_count != 0);

        let packet_number_len = packet.packet_number_length.bytesize() as u16;
        let mut payload_length =
            self.datagram_length - (packet.packet_start + packet.header_length);
        let expected_final_datagram_length = self.datagram_length + self.encryption_overhead;

        let mut final_quic_packet = false;
        if all_done_sending
            || packet.packet_type == PacketType::Short
            || capacity - expected_final_datagram_length < MIN_PACKET_SPARE_SPACE
        {
            final_quic_packet = true;

            if !all_done_sending && self.datapath.is_padding_preferred() {
                // When the datapath buffers a batch contiguously, every
                // datagram but the last must be full length.
                self.minimum_datagram_length = capacity;
            }
        }

        let padding_length = if final_quic_packet
            && expected_final_datagram_length < self.minimum_datagram_length
        {
            self.minimum_datagram_length - expected_final_datagram_length
        } else if packet_number_len + payload_length < 4 {
            // Header protection samples 16 bytes starting 4 bytes past the
            // packet-number offset; the packet number and payload together
            // must cover those 4 bytes.
            4 - packet_number_len - payload_length
        } else {
            0
        };

        if padding_length != 0 {
            let context = self
                .send_context
                .as_mut()
                .expect("packet implies a send context");
            let buffer = context.datagram_mut(id);
            let start = self.datagram_length as usize;
            // PADDING frames are the all-zero byte
            buffer[start..start + padding_length as usize].fill(0);
            payload_length += padding_length;
            self.datagram_length += padding_length;
        }

        if packet.packet_type.is_long() {
            let context = self
                .send_context
                .as_mut()
                .expect("packet implies a send context");
            let buffer = context.datagram_mut(id);
            let offset = (packet.packet_start + packet.payload_length_offset) as usize;
            long::update_payload_len(
                packet_number_len + payload_length + self.encryption_overhead,
                &mut buffer[offset..],
            );
        }

        if self.connection.state.encryption_enabled {
            payload_length += self.encryption_overhead;
            self.datagram_length += self.encryption_overhead;

            let encrypt_result = {
                let Some(keys) = self.connection.crypto.write_keys(packet.key_type) else {
                    self.connection
                        .fatal_error("packet key discarded before finalize");
                    return Err(());
                };
                let nonce = crypto::packet_nonce(keys.packet.iv(), packet.metadata.packet_number);

                let context = self
                    .send_context
                    .as_mut()
                    .expect("packet implies a send context");
                let buffer = context.datagram_mut(id);
                let packet_start = packet.packet_start as usize;
                let packet_end = packet_start + (packet.header_length + payload_length) as usize;
                let (header, in_out) = buffer[packet_start..packet_end]
                    .split_at_mut(packet.header_length as usize);
                keys.packet.encrypt(&nonce, header, in_out)
            };
            if let Err(error) = encrypt_result {
                warn!(%error, "packet encryption failed");
                self.connection.fatal_error("packet encryption failed");
                return Err(());
            }

            if self.connection.state.header_protection_enabled {
                let pn_start = packet.packet_start + packet.header_length - packet_number_len;
                let sample_start = (pn_start + 4) as usize;

                if packet.packet_type == PacketType::Short {
                    debug_assert!(self.batch_count < MAX_CRYPTO_BATCH_COUNT);

                    // Batch the header protection for short header packets;
                    // they all share the 1-RTT header key.
                    let context = self
                        .send_context
                        .as_mut()
                        .expect("packet implies a send context");
                    let buffer = context.datagram_mut(id);
                    self.cipher_batch[self.batch_count * HP_SAMPLE_LEN..][..HP_SAMPLE_LEN]
                        .copy_from_slice(&buffer[sample_start..sample_start + HP_SAMPLE_LEN]);
                    self.header_batch[self.batch_count] = BatchEntry {
                        datagram: id,
                        packet_start: packet.packet_start,
                        packet_number_len: packet_number_len as u8,
                    };
                    self.batch_count += 1;

                    if self.batch_count == MAX_CRYPTO_BATCH_COUNT {
                        self.flush_header_protection()?;
                    }
                } else {
                    debug_assert_eq!(self.batch_count, 0);

                    // Long header levels use their own keys, so protect
                    // each packet individually.
                    let mask_result = {
                        let Some(keys) = self.connection.crypto.write_keys(packet.key_type)
                        else {
                            self.connection
                                .fatal_error("packet key discarded before finalize");
                            return Err(());
                        };
                        let context = self
                            .send_context
                            .as_mut()
                            .expect("packet implies a send context");
                        let buffer = context.datagram_mut(id);
                        keys.header.header_protection_mask(
                            &buffer[sample_start..sample_start + HP_SAMPLE_LEN],
                        )
                    };
                    match mask_result {
                        Ok(mask) => {
                            let context = self
                                .send_context
                                .as_mut()
                                .expect("packet implies a send context");
                            let buffer = context.datagram_mut(id);
                            buffer[packet.packet_start as usize] ^= mask[0] & LONG_HEADER_MASK;
                            for i in 0..packet_number_len as usize {
                                buffer[pn_start as usize + i] ^= mask[1 + i];
                            }
                        }
                        Err(error) => {
                            warn!(%error, "header protection failed");
                            self.connection.fatal_error("header protection failed");
                            return Err(());
                        }
                    }
                }
            }

            let space_id = packet.packet_type.space();
            let plaintext_length = payload_length - self.encryption_overhead;
            let space = &mut self.connection.spaces[space_id];
            space.current_key_phase_bytes_sent += u64::from(plaintext_length);

            // If the next full-size packet would cross the per-phase byte
            // limit, roll the 1-RTT keys now.
            let bytes_sent = space.current_key_phase_bytes_sent;
            let awaiting_confirmation = space.awaiting_key_phase_confirmation;
            if packet.packet_type == PacketType::Short
                && self.connection.state.handshake_confirmed
                && !awaiting_confirmation
                && bytes_sent + u64::from(path::MAX_MTU) >= self.connection.limits.max_bytes_per_key
            {
                if let Err(error) = self.connection.crypto.generate_new_keys() {
                    warn!(%error, "send-triggered key update failed");
                    self.connection.fatal_error("send-triggered key update failed");
                    return Err(());
                }
                self.connection.update_key_phase(true);
                // the builder resolves keys by slot, so the fresh 1-RTT key
                // is picked up on the next use
            }
        }

        packet.metadata.sent_time = self.clock.get_time();
        packet.metadata.packet_length = packet.header_length + payload_length;

        debug!(
            packet_number = packet.metadata.packet_number,
            length = packet.metadata.packet_length,
            packet_type = ?packet.packet_type,
            "packet sent"
        );
        self.connection
            .loss_detection
            .on_packet_sent(self.path, &packet.metadata);

        if packet.metadata.is_retransmittable {
            self.packet_batch_retransmittable = true;
            self.send_allowance = self
                .send_allowance
                .saturating_sub(u32::from(packet.metadata.packet_length));
        }

        Ok(final_quic_packet)
    }

    /// Computes the header-protection masks for every batched short-header
    /// packet in one call and applies them
    fn flush_header_protection(&mut self) -> Result<(), ()> {
        debug_assert!(self.batch_count != 0);
        let count = self.batch_count;

        let mask_result = {
            let Some(keys) = self.connection.crypto.write_keys(KeyType::OneRtt) else {
                self.connection
                    .fatal_error("1-rtt key unavailable for header protection");
                return Err(());
            };
            keys.header.header_protection_mask_batch(
                &self.cipher_batch[..count * HP_SAMPLE_LEN],
                &mut self.hp_mask[..count * HEADER_PROTECTION_MASK_LEN],
            )
        };
        if let Err(error) = mask_result {
            warn!(%error, "header protection failed");
            self.connection.fatal_error("header protection failed");
            return Err(());
        }

        let dcid_len = self.path.destination_connection_id.len() as u16;
        let context = self
            .send_context
            .as_mut()
            .expect("batched packets imply a send context");

        for (i, entry) in self.header_batch[..count].iter().enumerate() {
            let offset = i * HEADER_PROTECTION_MASK_LEN;
            let buffer = context.datagram_mut(entry.datagram);

            buffer[entry.packet_start as usize] ^= self.hp_mask[offset] & SHORT_HEADER_MASK;

            let pn_start = (entry.packet_start + 1 + dcid_len) as usize;
            for j in 0..entry.packet_number_len as usize {
                buffer[pn_start + j] ^= self.hp_mask[offset + 1 + j];
            }
        }

        self.batch_count = 0;
        Ok(())
    }

    /// Hands the send context to the datapath
    fn send_batch(&mut self) {
        debug_assert_eq!(self.batch_count, 0);
        let Some(context) = self.send_context.take() else {
            return;
        };

        debug!(datagrams = self.total_datagrams, "sending batch");

        if self.path.is_locally_bound() {
            self.datapath.send_to(self.path.remote_address, context);
        } else {
            self.datapath
                .send_from_to(self.path.local_address, self.path.remote_address, context);
        }

        self.packet_batch_sent = true;
    }

    /// Drops everything held by the builder after a fatal connection error
    fn abandon(&mut self) {
        self.datagram = None;
        self.send_context = None;
        self.batch_count = 0;
    }

    /// Tears the builder down: finalizes and sends anything still pending,
    /// re-arms the loss-detection timer if retransmittable data went out,
    /// and scrubs the header-protection masks
    pub fn cleanup(mut self) {
        if self.send_context.is_some() {
            self.finalize(true);
        }

        if self.packet_batch_sent && self.packet_batch_retransmittable {
            self.connection.loss_detection.update_timer();
        }

        self.hp_mask = [0; HP_MASK_LEN];
    }
}
