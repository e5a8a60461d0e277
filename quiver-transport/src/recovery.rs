// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Seams into loss detection and congestion control.
//!
//! The egress core only notifies these collaborators; pacing, RTT
//! estimation and retransmission scheduling live behind them.

use core::time::Duration;
use quiver_core::{
    crypto::KeyType,
    packet::KeyPhase,
    path::Path,
    time::Timestamp,
};

/// Metadata recorded for every packet handed to the datapath
#[derive(Clone, Debug)]
pub struct SentPacketInfo {
    pub packet_number: u64,
    pub sent_time: Timestamp,
    /// Header, payload and authentication tag
    pub packet_length: u16,
    pub frame_count: u8,
    pub key_type: KeyType,
    pub key_phase: KeyPhase,
    pub is_retransmittable: bool,
    pub has_crypto: bool,
    pub is_path_mtu_discovery: bool,
}

impl SentPacketInfo {
    pub fn new(packet_number: u64, key_type: KeyType) -> Self {
        Self {
            packet_number,
            sent_time: Timestamp::default(),
            packet_length: 0,
            frame_count: 0,
            key_type,
            key_phase: KeyPhase::default(),
            is_retransmittable: false,
            has_crypto: false,
            is_path_mtu_discovery: false,
        }
    }
}

pub trait CongestionController {
    /// Bytes the sender may emit this flush.
    ///
    /// `time_since_last_flush` is only meaningful when
    /// `time_since_last_flush_valid` is set (i.e. a previous flush exists).
    fn send_allowance(
        &mut self,
        time_since_last_flush: Duration,
        time_since_last_flush_valid: bool,
    ) -> u32;
}

pub trait LossDetection {
    /// A packet was handed to the datapath
    fn on_packet_sent(&mut self, path: &Path, packet: &SentPacketInfo);

    /// Retransmittable data went out; re-arm the loss-detection timer
    fn update_timer(&mut self);
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::{Duration, Path, SentPacketInfo};

    #[derive(Debug)]
    pub struct CongestionController {
        pub allowance: u32,
        pub calls: Vec<(Duration, bool)>,
    }

    impl CongestionController {
        pub fn new(allowance: u32) -> Self {
            Self {
                allowance,
                calls: Vec::new(),
            }
        }
    }

    impl super::CongestionController for CongestionController {
        fn send_allowance(
            &mut self,
            time_since_last_flush: Duration,
            time_since_last_flush_valid: bool,
        ) -> u32 {
            self.calls
                .push((time_since_last_flush, time_since_last_flush_valid));
            self.allowance
        }
    }

    #[derive(Debug, Default)]
    pub struct LossDetection {
        pub sent: Vec<SentPacketInfo>,
        pub timer_updates: usize,
    }

    impl LossDetection {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl super::LossDetection for LossDetection {
        fn on_packet_sent(&mut self, _path: &Path, packet: &SentPacketInfo) {
            self.sent.push(packet.clone());
        }

        fn update_timer(&mut self) {
            self.timer_updates += 1;
        }
    }
}
