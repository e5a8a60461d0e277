// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::crypto::packet_protection;

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.1
//# The output of this algorithm is a 5 byte mask that is applied to the
//# protected header fields using exclusive OR.

pub const HEADER_PROTECTION_MASK_LEN: usize = 5;
pub type HeaderProtectionMask = [u8; HEADER_PROTECTION_MASK_LEN];

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.2
//# in sampling packet ciphertext for header protection,
//# the Packet Number field is assumed to be 4 bytes long

/// Length of the ciphertext sample fed to the header-protection primitive
pub const HP_SAMPLE_LEN: usize = 16;

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.1
//# mask = header_protection(hp_key, sample)
//#
//# pn_length = (packet[0] & 0x03) + 1
//# if (packet[0] & 0x80) == 0x80:
//#    # Long header: 4 bits masked
//#    packet[0] ^= mask[0] & 0x0f
//# else:
//#    # Short header: 5 bits masked
//#    packet[0] ^= mask[0] & 0x1f

pub const LONG_HEADER_MASK: u8 = 0x0f;
pub const SHORT_HEADER_MASK: u8 = 0x1f;

/// A header-protection key for one encryption level
pub trait HeaderKey: Send {
    /// Derives a header protection mask from a 16-byte ciphertext sample
    fn header_protection_mask(
        &self,
        ciphertext_sample: &[u8],
    ) -> Result<HeaderProtectionMask, packet_protection::Error>;

    /// Derives masks for a batch of samples in one call.
    ///
    /// `samples` is a contiguous buffer of 16-byte samples; `masks` receives
    /// 5 mask bytes per sample. Short-header packets within a flush share
    /// key material, so implementations can amortize the mask computation.
    fn header_protection_mask_batch(
        &self,
        samples: &[u8],
        masks: &mut [u8],
    ) -> Result<(), packet_protection::Error> {
        debug_assert_eq!(samples.len() % HP_SAMPLE_LEN, 0);
        debug_assert_eq!(
            samples.len() / HP_SAMPLE_LEN * HEADER_PROTECTION_MASK_LEN,
            masks.len()
        );

        for (sample, mask) in samples
            .chunks_exact(HP_SAMPLE_LEN)
            .zip(masks.chunks_exact_mut(HEADER_PROTECTION_MASK_LEN))
        {
            mask.copy_from_slice(&self.header_protection_mask(sample)?);
        }

        Ok(())
    }
}
