// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection-scoped identifier types

pub mod id;

pub use id::{ConnectionId, LocalId, PeerId};
