// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The connection's chain of write keys, one slot per encryption level

use quiver_core::{
    crypto::{packet_protection, KeyType, PacketKey},
    packet::number::PacketNumberSpace,
};

/// The packet key and header key for one encryption level
#[derive(Debug)]
pub struct KeySet<K, H> {
    pub packet: K,
    pub header: H,
}

/// Write-key state consumed by the packet builder.
///
/// Slots are installed as the handshake progresses and discarded once a
/// level is retired; the highest installed slot bounds the packet-type
/// selector.
#[derive(Debug)]
pub struct State<K, H> {
    write_keys: [Option<KeySet<K, H>>; KeyType::COUNT],
    write_key_level: KeyType,
    pending_crypto: Option<PacketNumberSpace>,
}

impl<K, H> Default for State<K, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, H> State<K, H> {
    pub fn new() -> Self {
        Self {
            write_keys: [None, None, None, None],
            write_key_level: KeyType::Initial,
            pending_crypto: None,
        }
    }

    /// The highest encryption level this connection can currently write at
    #[inline]
    pub fn write_key_level(&self) -> KeyType {
        self.write_key_level
    }

    #[inline]
    pub fn write_keys(&self, key_type: KeyType) -> Option<&KeySet<K, H>> {
        self.write_keys[key_type.index()].as_ref()
    }

    pub fn install(&mut self, key_type: KeyType, packet: K, header: H) {
        self.write_keys[key_type.index()] = Some(KeySet { packet, header });
        if key_type > self.write_key_level {
            self.write_key_level = key_type;
        }
    }

    pub fn discard(&mut self, key_type: KeyType) {
        self.write_keys[key_type.index()] = None;
    }

    /// Marks handshake data as pending at `level` (or clears it)
    pub fn set_pending_crypto(&mut self, level: Option<PacketNumberSpace>) {
        self.pending_crypto = level;
    }

    #[inline]
    pub fn has_pending_crypto_frame(&self) -> bool {
        self.pending_crypto.is_some()
    }

    /// The level the next pending CRYPTO frame must be sent at
    #[inline]
    pub fn next_encrypt_level(&self) -> Option<PacketNumberSpace> {
        self.pending_crypto
    }
}

impl<K: PacketKey, H> State<K, H> {
    /// Derives and installs the next-generation 1-RTT packet key.
    ///
    /// The header-protection key is retained; it does not rotate with the
    /// key phase.
    pub fn generate_new_keys(&mut self) -> Result<(), packet_protection::Error> {
        let Some(keys) = self.write_keys[KeyType::OneRtt.index()].as_mut() else {
            return Err(packet_protection::Error::new("no 1-rtt key installed"));
        };
        keys.packet = keys.packet.derive_next_key()?;
        Ok(())
    }
}
