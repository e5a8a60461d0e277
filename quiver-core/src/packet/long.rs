// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    packet::{number::TruncatedPacketNumber, version::Version, PacketType},
    varint::VarInt,
};
use s2n_codec::{Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# Long Header Packet {
//#   Header Form (1) = 1,
//#   Fixed Bit (1) = 1,
//#   Long Packet Type (2),
//#   Type-Specific Bits (4),
//#   Version (32),
//#   Destination Connection ID Length (8),
//#   Destination Connection ID (0..160),
//#   Source Connection ID Length (8),
//#   Source Connection ID (0..160),
//# }

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# Header Form:  The most significant bit (0x80) of byte 0 (the first
//#   byte) is set to 1 for long headers.
//#
//# Fixed Bit:  The next bit (0x40) of byte 0 is set to 1.

const ENCODING_TAG: u8 = 0b1100_0000;

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# Long Packet Type:  The next two bits (those with a mask of 0x30)
//#    of byte 0 contain a packet type.

const PACKET_TYPE_OFFSET: u8 = 4;

/// Size of the payload-length field as written by `Long::encode`.
///
/// The field is always written in the 2-byte varint form so the real value
/// can be placed over it once the payload size is known; the associated
/// data for the AEAD must be the final header bytes, so a staging buffer is
/// not an option.
pub const PAYLOAD_LEN_SIZE: usize = 2;

const TWO_BYTE_FORM: u16 = 0b01 << 14;

/// Header of a long packet.
///
/// Only the header is encoded here; the assembler appends the payload,
/// rewrites the payload-length field and applies packet protection
/// afterwards. The token is encoded for Initial packets and ignored for
/// every other type.
#[derive(Debug)]
pub struct Long<'a> {
    pub version: Version,
    pub packet_type: PacketType,
    pub destination_connection_id: &'a [u8],
    pub source_connection_id: &'a [u8],
    pub token: &'a [u8],
    pub packet_number: TruncatedPacketNumber,
}

impl Long<'_> {
    /// Offset of the payload-length field from the start of the header
    #[inline]
    pub fn payload_len_offset(&self) -> usize {
        self.encoding_size() - self.packet_number.len().bytesize() - PAYLOAD_LEN_SIZE
    }
}

impl EncoderValue for Long<'_> {
    #[inline]
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        (ENCODING_TAG
            | (self.packet_type.long_type_bits() << PACKET_TYPE_OFFSET)
            | self.packet_number.len().into_packet_tag_mask())
        .encode(encoder);

        self.version.encode(encoder);
        encoder.encode_with_len_prefix::<u8, _>(&self.destination_connection_id);
        encoder.encode_with_len_prefix::<u8, _>(&self.source_connection_id);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.2
        //# Token Length:  A variable-length integer specifying the length of
        //#    the Token field, in bytes.  This value is 0 if no token is
        //#    present.
        if matches!(self.packet_type, PacketType::Initial) {
            VarInt::try_from(self.token.len())
                .expect("token length fits in a varint")
                .encode(encoder);
            encoder.write_slice(self.token);
        }

        // placeholder; rewritten in place with `update_payload_len`
        TWO_BYTE_FORM.encode(encoder);

        self.packet_number.encode(encoder);
    }
}

/// Rewrites the payload-length field at `slot` with the final value.
///
/// `len` covers the packet number, the payload and the AEAD tag.
#[inline]
pub fn update_payload_len(len: u16, slot: &mut [u8]) {
    debug_assert!(len <= 0x3fff, "payload length exceeds the 2-byte varint form");
    slot[..PAYLOAD_LEN_SIZE].copy_from_slice(&(TWO_BYTE_FORM | len).to_be_bytes());
}
