// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::crypto::packet_protection;

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.3
//# QUIC can use any of the cipher suites defined in [TLS13] with the
//# exception of TLS_AES_128_CCM_8_SHA256.

/// Length of the packet-protection IV
pub const NONCE_LEN: usize = 12;

/// A packet-protection (AEAD) key for one encryption level
pub trait PacketKey: Send {
    /// The key's packet-protection IV
    fn iv(&self) -> &[u8; NONCE_LEN];

    /// Encrypts `in_out` in place.
    ///
    /// `header` is the associated data (the final on-wire header bytes).
    /// The last `ENCRYPTION_OVERHEAD` bytes of `in_out` are reserved for
    /// the authentication tag; the plaintext occupies the bytes before it.
    fn encrypt(
        &self,
        nonce: &[u8; NONCE_LEN],
        header: &[u8],
        in_out: &mut [u8],
    ) -> Result<(), packet_protection::Error>;

    /// Derives the next-generation key for a 1-RTT key update
    fn derive_next_key(&self) -> Result<Self, packet_protection::Error>
    where
        Self: Sized;
}
