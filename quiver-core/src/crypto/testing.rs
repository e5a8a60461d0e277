// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic packet-protection doubles for tests.
//!
//! The null cipher leaves plaintext in place and writes a generation-tagged
//! marker where the AEAD tag would be, so tests can assert both payload
//! contents and which key generation sealed a packet. The header key
//! derives its mask from the first sample byte, so a wrong sample offset
//! shows up as a wrong mask.

use crate::crypto::{
    packet_protection, HeaderProtectionMask, ENCRYPTION_OVERHEAD, HEADER_PROTECTION_MASK_LEN,
    HP_SAMPLE_LEN, NONCE_LEN,
};
use core::cell::Cell;

/// Marker byte written into the tag region; the key generation is added to it
pub const TAG_MARKER: u8 = 0xe0;

#[derive(Debug)]
pub struct Key {
    pub iv: [u8; NONCE_LEN],
    pub generation: u64,
    pub fail_on_encrypt: bool,
    pub fail_on_derive: bool,
}

impl Key {
    pub fn new() -> Self {
        Self::default()
    }

    /// The tag byte this key generation writes
    pub fn tag_byte(&self) -> u8 {
        TAG_MARKER.wrapping_add(self.generation as u8)
    }
}

impl Default for Key {
    fn default() -> Self {
        Self {
            iv: [
                0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x1b,
            ],
            generation: 0,
            fail_on_encrypt: false,
            fail_on_derive: false,
        }
    }
}

impl super::PacketKey for Key {
    fn iv(&self) -> &[u8; NONCE_LEN] {
        &self.iv
    }

    fn encrypt(
        &self,
        _nonce: &[u8; NONCE_LEN],
        _header: &[u8],
        in_out: &mut [u8],
    ) -> Result<(), packet_protection::Error> {
        if self.fail_on_encrypt {
            return Err(packet_protection::Error::new("testing encrypt failure"));
        }

        let overhead = ENCRYPTION_OVERHEAD as usize;
        debug_assert!(in_out.len() >= overhead);
        let tag_start = in_out.len() - overhead;
        let tag_byte = self.tag_byte();
        in_out[tag_start..].fill(tag_byte);

        Ok(())
    }

    fn derive_next_key(&self) -> Result<Self, packet_protection::Error> {
        if self.fail_on_derive {
            return Err(packet_protection::Error::new("testing derive failure"));
        }

        Ok(Self {
            iv: self.iv,
            generation: self.generation + 1,
            fail_on_encrypt: self.fail_on_encrypt,
            fail_on_derive: self.fail_on_derive,
        })
    }
}

#[derive(Debug, Default)]
pub struct HeaderKey {
    pub fail: bool,
    pub mask_calls: Cell<usize>,
    pub batch_calls: Cell<usize>,
}

impl HeaderKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mask this key derives for a given sample
    pub fn mask_for_sample(sample: &[u8]) -> HeaderProtectionMask {
        debug_assert_eq!(sample.len(), HP_SAMPLE_LEN);
        let seed = sample[0];
        [seed, seed ^ 1, seed ^ 2, seed ^ 3, seed ^ 4]
    }
}

impl super::HeaderKey for HeaderKey {
    fn header_protection_mask(
        &self,
        ciphertext_sample: &[u8],
    ) -> Result<HeaderProtectionMask, packet_protection::Error> {
        if self.fail {
            return Err(packet_protection::Error::new("testing hp failure"));
        }

        self.mask_calls.set(self.mask_calls.get() + 1);
        Ok(Self::mask_for_sample(ciphertext_sample))
    }

    fn header_protection_mask_batch(
        &self,
        samples: &[u8],
        masks: &mut [u8],
    ) -> Result<(), packet_protection::Error> {
        if self.fail {
            return Err(packet_protection::Error::new("testing hp failure"));
        }

        self.batch_calls.set(self.batch_calls.get() + 1);
        for (sample, mask) in samples
            .chunks_exact(HP_SAMPLE_LEN)
            .zip(masks.chunks_exact_mut(HEADER_PROTECTION_MASK_LEN))
        {
            mask.copy_from_slice(&Self::mask_for_sample(sample));
        }

        Ok(())
    }
}
