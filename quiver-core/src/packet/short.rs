// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::packet::{key_phase::KeyPhase, number::TruncatedPacketNumber, Tag};
use s2n_codec::{Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.3.1
//# 1-RTT Packet {
//#   Header Form (1) = 0,
//#   Fixed Bit (1) = 1,
//#   Spin Bit (1),
//#   Reserved Bits (2),
//#   Key Phase (1),
//#   Packet Number Length (2),
//#   Destination Connection ID (0..160),
//#   Packet Number (8..32),
//#   Packet Payload (..),
//# }

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.3.1
//# Header Form:  The most significant bit (0x80) of byte 0 is set to 0
//#    for the short header.
//#
//# Fixed Bit:  The next bit (0x40) of byte 0 is set to 1.

const ENCODING_TAG: u8 = 0b0100_0000;

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.3.1
//# Spin Bit:  The third most significant bit (0x20) of byte 0 is the
//#    latency spin bit, set as described in Section 17.4.

const SPIN_BIT_MASK: u8 = 0x20;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SpinBit {
    Zero,
    One,
}

impl Default for SpinBit {
    fn default() -> Self {
        Self::Zero
    }
}

impl SpinBit {
    pub fn from_tag(tag: Tag) -> Self {
        if tag & SPIN_BIT_MASK == SPIN_BIT_MASK {
            Self::One
        } else {
            Self::Zero
        }
    }

    pub fn into_packet_tag_mask(self) -> u8 {
        match self {
            Self::One => SPIN_BIT_MASK,
            Self::Zero => 0,
        }
    }
}

/// Header of a 1-RTT packet.
///
/// Only the header is encoded here; the assembler appends the payload and
/// applies packet protection afterwards.
#[derive(Debug)]
pub struct Short<'a> {
    pub spin_bit: SpinBit,
    pub key_phase: KeyPhase,
    pub destination_connection_id: &'a [u8],
    pub packet_number: TruncatedPacketNumber,
}

impl EncoderValue for Short<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        (ENCODING_TAG
            | self.spin_bit.into_packet_tag_mask()
            | self.key_phase.into_packet_tag_mask()
            | self.packet_number.len().into_packet_tag_mask())
        .encode(encoder);

        encoder.write_slice(self.destination_connection_id);
        self.packet_number.encode(encoder);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::number::PacketNumberLen;
    use hex_literal::hex;
    use s2n_codec::EncoderBuffer;

    #[test]
    fn encode_header() {
        let header = Short {
            spin_bit: SpinBit::One,
            key_phase: KeyPhase::One,
            destination_connection_id: &hex!("c0ffee00c0ffee00"),
            packet_number: PacketNumberLen::Len4.truncate(0x0001_0203),
        };

        let mut buffer = [0u8; 13];
        let mut encoder = EncoderBuffer::new(&mut buffer);
        header.encode(&mut encoder);
        assert_eq!(encoder.len(), 13);

        // form=0, fixed=1, spin=1, reserved=00, key phase=1, pn len = 4
        assert_eq!(buffer, hex!("67 c0ffee00c0ffee00 00010203"));
    }

    #[test]
    fn encode_empty_connection_id() {
        let header = Short {
            spin_bit: SpinBit::default(),
            key_phase: KeyPhase::default(),
            destination_connection_id: &[],
            packet_number: PacketNumberLen::Len4.truncate(7),
        };

        let mut buffer = [0u8; 5];
        let mut encoder = EncoderBuffer::new(&mut buffer);
        header.encode(&mut encoder);

        assert_eq!(buffer, hex!("43 00000007"));
    }
}
