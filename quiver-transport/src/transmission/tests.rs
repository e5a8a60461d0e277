// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    connection::Connection,
    datapath::testing::Datapath,
    send,
    testing::{self, Config, DEST_CID},
    transmission::{Error, Outcome, PacketBuilder, MAX_CRYPTO_BATCH_COUNT, MAX_DATAGRAMS_PER_SEND},
};
use quiver_core::{
    crypto::{testing as crypto_testing, KeyType},
    packet::{number::PacketNumberSpace, KeyPhase, PacketType},
    time::testing::Clock,
    transport,
    varint::VarInt,
};
use s2n_codec::{DecoderBuffer, Encoder};

// Header sizes with the fixture connection IDs (8-byte destination,
// 4-byte source) and a 4-byte packet number
const SHORT_HEADER_LEN: usize = 13;
const INITIAL_HEADER_LEN: usize = 26;
const HANDSHAKE_HEADER_LEN: usize = 25;
const TAG_LEN: usize = 16;

/// UDP payload capacity of the fixture path (IPv4, mtu 1350)
const CAPACITY: usize = 1322;

fn harness() -> (Datapath, Clock) {
    (Datapath::new(), Clock::new())
}

fn write_payload(builder: &mut PacketBuilder<Config>, len: usize, byte: u8, outcome: Outcome) {
    assert!(builder.write_frames(|encoder| {
        encoder.write_repeated(len, byte);
        outcome
    }));
}

fn write_stream_data(builder: &mut PacketBuilder<Config>, len: usize) {
    write_payload(
        builder,
        len,
        0x01,
        Outcome {
            frames: 1,
            is_retransmittable: true,
            has_crypto: false,
        },
    );
}

fn read_varint(bytes: &[u8]) -> u64 {
    let (value, _) = DecoderBuffer::new(bytes).decode::<VarInt>().unwrap();
    value.as_u64()
}

// S1: a client Initial carrying 300 bytes of CRYPTO is padded out to a
// 1200-byte datagram and consumes packet number 0
#[test]
fn client_initial_padded_to_1200() {
    let mut connection = testing::client_connection();
    testing::install_keys(&mut connection, KeyType::Initial);
    connection
        .crypto
        .set_pending_crypto(Some(PacketNumberSpace::Initial));
    let path = testing::path();
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    builder
        .prepare_for_control_frames(false, send::Flags::CRYPTO)
        .unwrap();
    write_payload(
        &mut builder,
        300,
        0x06,
        Outcome {
            frames: 1,
            is_retransmittable: true,
            has_crypto: true,
        },
    );
    builder.finalize(true);
    builder.cleanup();

    assert_eq!(connection.send.next_packet_number, 1);
    assert_eq!(datapath.sent.len(), 1);
    // the fixture path is explicitly bound, so no local address is passed
    assert!(datapath.sent[0].local.is_none());
    assert_eq!(datapath.sent[0].remote, path.remote_address);

    let datagrams = &datapath.sent[0].datagrams;
    assert_eq!(datagrams.len(), 1);
    let datagram = &datagrams[0];
    assert_eq!(datagram.len(), 1200);

    // destination connection id is in the clear
    assert_eq!(&datagram[6..14], DEST_CID);

    // payload length reads pn_len + padded payload + tag
    let payload_len_offset = INITIAL_HEADER_LEN - 4 - 2;
    let expected_payload_len = (4 + (1200 - INITIAL_HEADER_LEN - TAG_LEN) + TAG_LEN) as u64;
    assert_eq!(
        read_varint(&datagram[payload_len_offset..payload_len_offset + 2]),
        expected_payload_len
    );

    // header protection covered the low type bits and the packet number
    let sample = &datagram[INITIAL_HEADER_LEN..INITIAL_HEADER_LEN + 16];
    let mask = crypto_testing::HeaderKey::mask_for_sample(sample);
    assert_eq!(datagram[0], 0xc3 ^ (mask[0] & 0x0f));
    for (i, byte) in datagram[INITIAL_HEADER_LEN - 4..INITIAL_HEADER_LEN]
        .iter()
        .enumerate()
    {
        // packet number 0
        assert_eq!(*byte, mask[1 + i]);
    }

    // the padding region is zero plaintext under the null cipher
    assert!(datagram[INITIAL_HEADER_LEN + 300..1200 - TAG_LEN]
        .iter()
        .all(|byte| *byte == 0));
    assert!(datagram[1200 - TAG_LEN..]
        .iter()
        .all(|byte| *byte == crypto_testing::TAG_MARKER));

    let sent = &connection.loss_detection.sent;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].packet_number, 0);
    assert_eq!(sent[0].packet_length, 1200);
    assert!(sent[0].has_crypto);
}

// S2: a prepared packet that receives no frames returns its packet number
// and leaves the builder ready for another prepare
#[test]
fn empty_packet_is_abandoned() {
    let mut connection = testing::client_connection();
    testing::install_keys(&mut connection, KeyType::OneRtt);
    let path = testing::path();
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();

    builder.prepare_for_stream_frames(false).unwrap();
    builder.finalize(false);

    builder.prepare_for_stream_frames(false).unwrap();
    write_stream_data(&mut builder, 50);
    builder.finalize(true);
    builder.cleanup();

    // the abandoned packet's number was reused by the second prepare
    assert_eq!(connection.send.next_packet_number, 1);
    assert_eq!(connection.loss_detection.sent.len(), 1);
    assert_eq!(connection.loss_detection.sent[0].packet_number, 0);
    assert_eq!(datapath.sent.len(), 1);
    assert_eq!(datapath.sent[0].datagrams.len(), 1);
}

// S3: short-header packets share one batched header-protection computation
#[test]
fn batched_short_header_protection() {
    let mut connection = testing::client_connection();
    testing::install_keys(&mut connection, KeyType::OneRtt);
    let path = testing::path();
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    for _ in 0..MAX_CRYPTO_BATCH_COUNT {
        builder.prepare_for_stream_frames(false).unwrap();
        write_stream_data(&mut builder, 100);
        builder.finalize(false);
    }
    // the batch was flushed when it filled up
    assert_eq!(builder.pending_header_protection(), 0);
    builder.cleanup();

    let keys = connection.crypto.write_keys(KeyType::OneRtt).unwrap();
    assert_eq!(keys.header.batch_calls.get(), 1);
    assert_eq!(keys.header.mask_calls.get(), 0);

    let datagrams: Vec<_> = datapath.datagrams().collect();
    assert_eq!(datagrams.len(), MAX_CRYPTO_BATCH_COUNT);

    for (packet_number, datagram) in datagrams.iter().enumerate() {
        assert_eq!(datagram.len(), SHORT_HEADER_LEN + 100 + TAG_LEN);

        let sample = &datagram[SHORT_HEADER_LEN..SHORT_HEADER_LEN + 16];
        let mask = crypto_testing::HeaderKey::mask_for_sample(sample);

        // low 5 bits of the first byte were masked
        assert_eq!(datagram[0], 0x43 ^ (mask[0] & 0x1f));

        // applying the mask a second time restores the original bytes
        let mut unprotected = datagram.to_vec();
        unprotected[0] ^= mask[0] & 0x1f;
        for i in 0..4 {
            unprotected[9 + i] ^= mask[1 + i];
        }
        assert_eq!(unprotected[0], 0x43);
        assert_eq!(
            unprotected[9..13],
            (packet_number as u32).to_be_bytes()
        );
    }
}

// S4: crossing the per-phase byte limit rolls the 1-RTT keys exactly once
// and subsequent packets seal under the new generation
#[test]
fn send_triggered_key_update() {
    let mut connection = testing::client_connection();
    testing::install_keys(&mut connection, KeyType::OneRtt);
    connection.state.handshake_confirmed = true;
    connection.limits.max_bytes_per_key = 1_000_000;
    connection.spaces[PacketNumberSpace::ApplicationData].current_key_phase_bytes_sent = 999_000;
    let path = testing::path();
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    for _ in 0..2 {
        builder.prepare_for_stream_frames(false).unwrap();
        write_stream_data(&mut builder, 100);
        builder.finalize(false);
    }
    builder.cleanup();

    // exactly one derivation; the second packet could not re-trigger while
    // the phase awaits confirmation
    let keys = connection.crypto.write_keys(KeyType::OneRtt).unwrap();
    assert_eq!(keys.packet.generation, 1);

    let space = &connection.spaces[PacketNumberSpace::ApplicationData];
    assert_eq!(space.current_key_phase, KeyPhase::One);
    assert!(space.awaiting_key_phase_confirmation);
    assert_eq!(space.current_key_phase_bytes_sent, 100);

    let datagrams: Vec<_> = datapath.datagrams().collect();
    assert_eq!(datagrams.len(), 2);
    let tag_at = |datagram: &Vec<u8>| datagram[datagram.len() - TAG_LEN];
    assert_eq!(tag_at(datagrams[0]), crypto_testing::TAG_MARKER);
    assert_eq!(tag_at(datagrams[1]), crypto_testing::TAG_MARKER.wrapping_add(1));

    // the second packet was built before the update took effect for its
    // header, but after for its phase bit bookkeeping
    assert_eq!(connection.loss_detection.sent[0].key_phase, KeyPhase::Zero);
    assert_eq!(connection.loss_detection.sent[1].key_phase, KeyPhase::One);
}

// S5: a Retry closes the connection silently and never arms loss detection
#[test]
fn retry_closes_silently() {
    let mut connection = testing::server_connection();
    testing::install_keys(&mut connection, KeyType::Initial);
    let path = testing::path();
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    builder
        .prepare(PacketType::Retry, KeyType::Initial, false, false)
        .unwrap();
    write_payload(
        &mut builder,
        32,
        0xab,
        Outcome {
            frames: 1,
            is_retransmittable: false,
            has_crypto: false,
        },
    );
    builder.finalize(true);
    builder.cleanup();

    let close = connection.close().expect("connection should be closed");
    assert!(close.silent);
    assert_eq!(close.code, transport::Error::NO_ERROR);
    assert!(!close.is_fatal);

    assert_eq!(datapath.sent.len(), 1);
    assert_eq!(connection.loss_detection.sent.len(), 1);
    assert!(!connection.loss_detection.sent[0].is_retransmittable);
    assert_eq!(connection.loss_detection.timer_updates, 0);
}

// S6: retransmittable packets deduct from the allowance, saturating at zero
#[test]
fn send_allowance_saturates() {
    let mut connection = testing::client_connection();
    testing::install_keys(&mut connection, KeyType::OneRtt);
    connection.congestion_controller.allowance = 1500;
    let path = testing::path();
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    assert_eq!(builder.send_allowance(), 1500);

    builder.prepare_for_stream_frames(false).unwrap();
    write_stream_data(&mut builder, 1200 - SHORT_HEADER_LEN - TAG_LEN);
    builder.finalize(false);
    assert_eq!(builder.send_allowance(), 300);

    builder.prepare_for_stream_frames(false).unwrap();
    write_stream_data(&mut builder, 500 - SHORT_HEADER_LEN - TAG_LEN);
    builder.finalize(false);
    assert_eq!(builder.send_allowance(), 0);

    builder.cleanup();

    assert_eq!(connection.loss_detection.sent[0].packet_length, 1200);
    assert_eq!(connection.loss_detection.sent[1].packet_length, 500);
    // retransmittable data went out and a batch was sent
    assert_eq!(connection.loss_detection.timer_updates, 1);
}

#[test]
fn packet_number_consumed_only_for_emitted_packets() {
    let mut connection = testing::client_connection();
    testing::install_keys(&mut connection, KeyType::OneRtt);
    let path = testing::path();
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    let mut emitted = 0u64;
    for round in 0..10 {
        builder.prepare_for_stream_frames(false).unwrap();
        if round % 2 == 0 {
            write_stream_data(&mut builder, 25);
            emitted += 1;
        }
        builder.finalize(false);
    }
    builder.cleanup();

    assert_eq!(emitted, 5);
    assert_eq!(connection.send.next_packet_number, emitted);
    assert_eq!(connection.loss_detection.sent.len(), emitted as usize);
}

// Initial and Handshake packets coalesce into one datagram; each carries
// its own payload-length field and header protection
#[test]
fn coalesced_long_header_packets() {
    let mut connection = testing::server_connection();
    testing::install_keys(&mut connection, KeyType::Initial);
    testing::install_keys(&mut connection, KeyType::Handshake);
    let path = testing::path();
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    builder
        .prepare(PacketType::Initial, KeyType::Initial, false, false)
        .unwrap();
    write_payload(
        &mut builder,
        100,
        0x06,
        Outcome {
            frames: 1,
            is_retransmittable: true,
            has_crypto: true,
        },
    );
    // the type switch finalizes the Initial packet and appends the
    // Handshake packet to the same datagram
    builder
        .prepare(PacketType::Handshake, KeyType::Handshake, false, false)
        .unwrap();
    write_payload(
        &mut builder,
        50,
        0x07,
        Outcome {
            frames: 1,
            is_retransmittable: true,
            has_crypto: true,
        },
    );
    builder.finalize(true);
    builder.cleanup();

    let datagrams: Vec<_> = datapath.datagrams().collect();
    assert_eq!(datagrams.len(), 1);
    let datagram = datagrams[0];

    let packet1_len = INITIAL_HEADER_LEN + 100 + TAG_LEN;
    let packet2_len = HANDSHAKE_HEADER_LEN + 50 + TAG_LEN;
    assert_eq!(datagram.len(), packet1_len + packet2_len);

    let offset1 = INITIAL_HEADER_LEN - 4 - 2;
    assert_eq!(read_varint(&datagram[offset1..offset1 + 2]), (4 + 100 + TAG_LEN) as u64);

    let offset2 = packet1_len + HANDSHAKE_HEADER_LEN - 4 - 2;
    assert_eq!(read_varint(&datagram[offset2..offset2 + 2]), (4 + 50 + TAG_LEN) as u64);

    let sample1 = &datagram[INITIAL_HEADER_LEN..INITIAL_HEADER_LEN + 16];
    let mask1 = crypto_testing::HeaderKey::mask_for_sample(sample1);
    assert_eq!(datagram[0], 0xc3 ^ (mask1[0] & 0x0f));

    let header2_end = packet1_len + HANDSHAKE_HEADER_LEN;
    let sample2 = &datagram[header2_end..header2_end + 16];
    let mask2 = crypto_testing::HeaderKey::mask_for_sample(sample2);
    assert_eq!(datagram[packet1_len], 0xe3 ^ (mask2[0] & 0x0f));

    assert_eq!(connection.send.next_packet_number, 2);
}

// All datagrams but the last are fully padded when the datapath buffers
// the batch contiguously
#[test]
fn padding_preferred_pads_intermediate_datagrams() {
    let mut connection = testing::client_connection();
    testing::install_keys(&mut connection, KeyType::OneRtt);
    let path = testing::path();
    let (mut datapath, clock) = harness();
    datapath.padding_preferred = true;

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    builder.prepare_for_stream_frames(false).unwrap();
    write_stream_data(&mut builder, 10);
    builder.finalize(false);

    builder.prepare_for_stream_frames(false).unwrap();
    write_stream_data(&mut builder, 10);
    builder.finalize(true);
    builder.cleanup();

    let datagrams: Vec<_> = datapath.datagrams().collect();
    assert_eq!(datagrams.len(), 2);
    assert_eq!(datagrams[0].len(), CAPACITY);
    assert_eq!(datagrams[1].len(), SHORT_HEADER_LEN + 10 + TAG_LEN);
}

// A packet with frames but no payload bytes still has 16 bytes of
// ciphertext to sample, thanks to the tag and the 4-byte packet number
#[test]
fn zero_length_payload_still_protects() {
    let mut connection = testing::client_connection();
    testing::install_keys(&mut connection, KeyType::OneRtt);
    let path = testing::path();
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    builder.prepare_for_stream_frames(false).unwrap();
    write_payload(
        &mut builder,
        0,
        0,
        Outcome {
            frames: 1,
            is_retransmittable: false,
            has_crypto: false,
        },
    );
    builder.finalize(true);
    builder.cleanup();

    let datagrams: Vec<_> = datapath.datagrams().collect();
    assert_eq!(datagrams.len(), 1);
    assert_eq!(datagrams[0].len(), SHORT_HEADER_LEN + TAG_LEN);
}

#[test]
fn tail_loss_probe_padding() {
    // a 1-RTT probe pads enough to elicit a stateless reset
    let mut connection = testing::client_connection();
    testing::install_keys(&mut connection, KeyType::OneRtt);
    let path = testing::path();
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    builder.prepare_for_stream_frames(true).unwrap();
    write_stream_data(&mut builder, 1);
    builder.finalize(true);
    builder.cleanup();

    let datagrams: Vec<_> = datapath.datagrams().collect();
    assert_eq!(datagrams[0].len(), (quiver_core::stateless_reset::RECOMMENDED_PACKET_LEN + 8) as usize);

    // a probe at earlier keys pads the full datagram to unblock address
    // validation
    let mut connection = testing::client_connection();
    testing::install_keys(&mut connection, KeyType::Initial);
    connection
        .crypto
        .set_pending_crypto(Some(PacketNumberSpace::Initial));
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    builder
        .prepare_for_control_frames(true, send::Flags::CRYPTO)
        .unwrap();
    write_payload(
        &mut builder,
        40,
        0x06,
        Outcome {
            frames: 1,
            is_retransmittable: true,
            has_crypto: true,
        },
    );
    builder.finalize(true);
    builder.cleanup();

    let datagrams: Vec<_> = datapath.datagrams().collect();
    assert_eq!(datagrams[0].len(), CAPACITY);
}

#[test]
fn path_mtu_discovery_probe() {
    let mut connection = testing::client_connection();
    testing::install_keys(&mut connection, KeyType::OneRtt);
    let path = testing::path();
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();

    // some regular data first; the probe must not share its batch
    builder.prepare_for_stream_frames(false).unwrap();
    write_stream_data(&mut builder, 100);
    builder.finalize(false);

    builder.prepare_for_path_mtu_discovery().unwrap();
    write_payload(
        &mut builder,
        1,
        0x01,
        Outcome {
            frames: 1,
            is_retransmittable: false,
            has_crypto: false,
        },
    );
    builder.finalize(true);
    builder.cleanup();

    assert_eq!(datapath.sent.len(), 2);
    assert_eq!(datapath.sent[0].datagrams[0].len(), SHORT_HEADER_LEN + 100 + TAG_LEN);
    // the probe assumes a 1500-byte MTU
    assert_eq!(datapath.sent[1].datagrams[0].len(), 1472);

    let sent = &connection.loss_detection.sent;
    assert!(!sent[0].is_path_mtu_discovery);
    assert!(sent[1].is_path_mtu_discovery);
}

#[test]
fn batch_full_after_max_datagrams() {
    let mut connection = testing::client_connection();
    testing::install_keys(&mut connection, KeyType::OneRtt);
    let path = testing::path();
    let (mut datapath, clock) = harness();
    // every datagram completes its context and is sent immediately
    datapath.context_capacity = 1;

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    for _ in 0..MAX_DATAGRAMS_PER_SEND {
        builder.prepare_for_stream_frames(false).unwrap();
        write_stream_data(&mut builder, 10);
        builder.finalize(false);
    }

    assert_eq!(builder.prepare_for_stream_frames(false), Err(Error::BatchFull));
    assert_eq!(builder.total_datagrams(), MAX_DATAGRAMS_PER_SEND);
    builder.cleanup();

    assert_eq!(datapath.sent.len(), MAX_DATAGRAMS_PER_SEND as usize);
}

#[test]
fn allocation_failures_are_soft() {
    let mut connection = testing::client_connection();
    testing::install_keys(&mut connection, KeyType::OneRtt);
    let path = testing::path();

    let (mut datapath, clock) = harness();
    datapath.fail_context_alloc = true;
    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    assert_eq!(builder.prepare_for_stream_frames(false), Err(Error::AllocFailure));
    builder.cleanup();
    assert!(!connection.is_closed());
    assert_eq!(connection.send.next_packet_number, 0);

    let (mut datapath, clock) = harness();
    datapath.fail_datagram_alloc = true;
    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    assert_eq!(builder.prepare_for_stream_frames(false), Err(Error::AllocFailure));
    builder.cleanup();
    assert!(!connection.is_closed());
}

#[test]
fn missing_source_cid_fails_initialize() {
    let mut connection = testing::client_connection();
    connection.source_connection_ids.clear();
    testing::install_keys(&mut connection, KeyType::OneRtt);
    let path = testing::path();
    let (mut datapath, clock) = harness();

    let result = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock);
    assert_eq!(result.err(), Some(Error::NoSourceCid));
}

#[test]
fn encryption_failure_is_fatal_and_nothing_is_sent() {
    let mut connection = testing::client_connection();
    connection.crypto.install(
        KeyType::OneRtt,
        crypto_testing::Key {
            fail_on_encrypt: true,
            ..Default::default()
        },
        crypto_testing::HeaderKey::new(),
    );
    let path = testing::path();
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    builder.prepare_for_stream_frames(false).unwrap();
    write_stream_data(&mut builder, 100);
    builder.finalize(true);
    builder.cleanup();

    let close = connection.close().expect("connection should be closed");
    assert!(close.is_fatal);
    assert_eq!(close.code, transport::Error::INTERNAL_ERROR);
    assert!(datapath.sent.is_empty());
    assert!(connection.loss_detection.sent.is_empty());
}

#[test]
fn header_protection_failure_is_fatal() {
    let mut connection = testing::client_connection();
    connection.crypto.install(
        KeyType::Initial,
        crypto_testing::Key::new(),
        crypto_testing::HeaderKey {
            fail: true,
            ..Default::default()
        },
    );
    connection
        .crypto
        .set_pending_crypto(Some(PacketNumberSpace::Initial));
    let path = testing::path();
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    builder
        .prepare_for_control_frames(false, send::Flags::CRYPTO)
        .unwrap();
    write_payload(
        &mut builder,
        100,
        0x06,
        Outcome {
            frames: 1,
            is_retransmittable: true,
            has_crypto: true,
        },
    );
    builder.finalize(true);
    builder.cleanup();

    assert!(connection.close().is_some_and(|close| close.is_fatal));
    assert!(datapath.sent.is_empty());
}

#[test]
fn key_update_failure_is_fatal() {
    let mut connection = testing::client_connection();
    connection.crypto.install(
        KeyType::OneRtt,
        crypto_testing::Key {
            fail_on_derive: true,
            ..Default::default()
        },
        crypto_testing::HeaderKey::new(),
    );
    connection.state.handshake_confirmed = true;
    connection.limits.max_bytes_per_key = 1_000_000;
    connection.spaces[PacketNumberSpace::ApplicationData].current_key_phase_bytes_sent = 999_999;
    let path = testing::path();
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    builder.prepare_for_stream_frames(false).unwrap();
    write_stream_data(&mut builder, 100);
    builder.finalize(true);
    builder.cleanup();

    assert!(connection.close().is_some_and(|close| close.is_fatal));
    assert!(datapath.sent.is_empty());
    assert!(connection.loss_detection.sent.is_empty());
}

#[test]
fn allowance_is_seeded_from_congestion_and_path() {
    let mut connection = testing::client_connection();
    testing::install_keys(&mut connection, KeyType::OneRtt);
    connection.congestion_controller.allowance = 5000;
    let mut path = testing::path();
    path.allowance = 1000;
    let (mut datapath, clock) = harness();

    {
        let builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
        assert_eq!(builder.send_allowance(), 1000);
    }

    clock.advance(core::time::Duration::from_millis(25));
    {
        let _builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    }

    let calls = &connection.congestion_controller.calls;
    assert_eq!(calls.len(), 2);
    // no previous flush on the first call
    assert_eq!(calls[0], (core::time::Duration::ZERO, false));
    assert_eq!(calls[1], (core::time::Duration::from_millis(25), true));
}

#[test]
fn unbound_local_address_sends_from_to() {
    let mut connection = testing::client_connection();
    testing::install_keys(&mut connection, KeyType::OneRtt);
    let mut path = testing::path();
    path.local_address = "0.0.0.0:0".parse().unwrap();
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    builder.prepare_for_stream_frames(false).unwrap();
    write_stream_data(&mut builder, 10);
    builder.finalize(true);
    builder.cleanup();

    assert_eq!(datapath.sent[0].local, Some(path.local_address));
    assert_eq!(datapath.sent[0].remote, path.remote_address);
}

#[test]
fn disabled_encryption_writes_plaintext() {
    let mut connection = testing::client_connection();
    connection.state.encryption_enabled = false;
    connection.state.header_protection_enabled = false;
    let path = testing::path();
    let (mut datapath, clock) = harness();

    let mut builder = PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
    builder
        .prepare(PacketType::Short, KeyType::OneRtt, false, false)
        .unwrap();
    write_payload(
        &mut builder,
        20,
        0x05,
        Outcome {
            frames: 1,
            is_retransmittable: true,
            has_crypto: false,
        },
    );
    builder.finalize(true);
    builder.cleanup();

    let datagrams: Vec<_> = datapath.datagrams().collect();
    assert_eq!(datagrams[0].len(), SHORT_HEADER_LEN + 20);
    // first byte unprotected, payload in the clear
    assert_eq!(datagrams[0][0], 0x43);
    assert!(datagrams[0][SHORT_HEADER_LEN..].iter().all(|byte| *byte == 0x05));
}

// Property: the payload-length varint always reads back as
// pn_len + payload_len + tag_len, whatever the framer wrote
#[test]
fn long_header_payload_length_round_trips() {
    bolero::check!().with_type::<u16>().for_each(|payload_len| {
        let payload_len = usize::from(*payload_len) % 1000 + 1;

        let mut connection = testing::server_connection();
        testing::install_keys(&mut connection, KeyType::Handshake);
        let path = testing::path();
        let (mut datapath, clock) = harness();

        let mut builder =
            PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
        builder
            .prepare(PacketType::Handshake, KeyType::Handshake, false, false)
            .unwrap();
        write_payload(
            &mut builder,
            payload_len,
            0x07,
            Outcome {
                frames: 1,
                is_retransmittable: true,
                has_crypto: true,
            },
        );
        builder.finalize(true);
        builder.cleanup();

        let datagram = &datapath.sent[0].datagrams[0];
        assert_eq!(datagram.len(), HANDSHAKE_HEADER_LEN + payload_len + TAG_LEN);

        let offset = HANDSHAKE_HEADER_LEN - 4 - 2;
        assert_eq!(
            read_varint(&datagram[offset..offset + 2]),
            (4 + payload_len + TAG_LEN) as u64
        );
    });
}

mod selector {
    use super::*;

    fn builder_harness(
        connection: &mut Connection<Config>,
        path: &quiver_core::path::Path,
        datapath: &mut Datapath,
        clock: &Clock,
    ) -> Option<(PacketType, KeyType)> {
        let builder = PacketBuilder::new(connection, path, datapath, clock).unwrap();
        builder.packet_type_and_key_for_control_frames(send::Flags::ACK | send::Flags::CRYPTO)
    }

    #[test]
    fn one_rtt_always_wins() {
        let mut connection = testing::client_connection();
        testing::install_keys(&mut connection, KeyType::Initial);
        testing::install_keys(&mut connection, KeyType::OneRtt);
        connection.spaces[PacketNumberSpace::Initial]
            .ack_tracker
            .ack_eliciting_packets_to_acknowledge = 1;
        let path = testing::path();
        let (mut datapath, clock) = harness();

        // Initial has pending acks but carries no sendable reason that
        // outranks the 1-RTT short header
        let mut connection2 = testing::client_connection();
        testing::install_keys(&mut connection2, KeyType::OneRtt);
        for connection in [&mut connection, &mut connection2] {
            let builder = PacketBuilder::new(connection, &path, &mut datapath, &clock).unwrap();
            assert_eq!(
                builder.packet_type_and_key_for_control_frames(send::Flags::PING),
                Some((PacketType::Short, KeyType::OneRtt))
            );
        }
    }

    #[test]
    fn ack_selects_level_with_pending_acks() {
        let mut connection = testing::client_connection();
        testing::install_keys(&mut connection, KeyType::Initial);
        testing::install_keys(&mut connection, KeyType::Handshake);
        connection.spaces[PacketNumberSpace::Handshake]
            .ack_tracker
            .ack_eliciting_packets_to_acknowledge = 1;
        let path = testing::path();
        let (mut datapath, clock) = harness();

        assert_eq!(
            builder_harness(&mut connection, &path, &mut datapath, &clock),
            Some((PacketType::Handshake, KeyType::Handshake))
        );
    }

    #[test]
    fn crypto_selects_the_handshake_send_level() {
        let mut connection = testing::client_connection();
        testing::install_keys(&mut connection, KeyType::Initial);
        testing::install_keys(&mut connection, KeyType::Handshake);
        connection
            .crypto
            .set_pending_crypto(Some(PacketNumberSpace::Handshake));
        let path = testing::path();
        let (mut datapath, clock) = harness();

        assert_eq!(
            builder_harness(&mut connection, &path, &mut datapath, &clock),
            Some((PacketType::Handshake, KeyType::Handshake))
        );
    }

    #[test]
    fn discarded_keys_are_skipped() {
        let mut connection = testing::client_connection();
        testing::install_keys(&mut connection, KeyType::Initial);
        testing::install_keys(&mut connection, KeyType::Handshake);
        connection.crypto.discard(KeyType::Initial);
        connection
            .crypto
            .set_pending_crypto(Some(PacketNumberSpace::Handshake));
        let path = testing::path();
        let (mut datapath, clock) = harness();

        assert_eq!(
            builder_harness(&mut connection, &path, &mut datapath, &clock),
            Some((PacketType::Handshake, KeyType::Handshake))
        );
    }

    #[test]
    fn close_falls_back_to_the_write_key() {
        let mut connection = testing::client_connection();
        testing::install_keys(&mut connection, KeyType::Initial);
        testing::install_keys(&mut connection, KeyType::Handshake);
        let path = testing::path();
        let (mut datapath, clock) = harness();

        let builder =
            PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
        assert_eq!(
            builder.packet_type_and_key_for_control_frames(send::Flags::CONNECTION_CLOSE),
            Some((PacketType::Handshake, KeyType::Handshake))
        );
    }

    #[test]
    fn no_reason_selects_nothing() {
        let mut connection = testing::client_connection();
        testing::install_keys(&mut connection, KeyType::Initial);
        let path = testing::path();
        let (mut datapath, clock) = harness();

        let builder =
            PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
        assert_eq!(
            builder.packet_type_and_key_for_control_frames(send::Flags::ACK),
            None
        );
    }

    #[test]
    #[should_panic(expected = "selector invoked without a sendable control frame")]
    fn prepare_without_selection_asserts() {
        let mut connection = testing::client_connection();
        testing::install_keys(&mut connection, KeyType::Initial);
        let path = testing::path();
        let (mut datapath, clock) = harness();

        let mut builder =
            PacketBuilder::new(&mut connection, &path, &mut datapath, &clock).unwrap();
        let _ = builder.prepare_for_control_frames(false, send::Flags::ACK);
    }
}
