// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    datapath::Datapath,
    recovery::{CongestionController, LossDetection},
};
use quiver_core::{
    crypto::{HeaderKey, PacketKey},
    time::Clock,
};

/// Collaborator types for a connection's egress path.
///
/// The builder is generic over this bundle so crypto providers, datapaths
/// and recovery implementations can be swapped without touching the
/// assembly logic.
pub trait Config {
    type PacketKey: PacketKey;
    type HeaderKey: HeaderKey;
    type CongestionController: CongestionController;
    type LossDetection: LossDetection;
    type Datapath: Datapath;
    type Clock: Clock;
}
