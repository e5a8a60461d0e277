// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//= https://www.rfc-editor.org/rfc/rfc9001#section-6.6
//# Endpoints MUST count the number of encrypted packets for each set of
//# keys.  If the total number of encrypted packets with the same key
//# exceeds the confidentiality limit for the selected AEAD, the endpoint
//# MUST stop using those keys.

/// Locally-configured limits that shape the egress path
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// Bytes that may be sealed under one 1-RTT key phase before a
    /// send-triggered key update
    pub max_bytes_per_key: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_bytes_per_key: 1 << 38,
        }
    }
}
