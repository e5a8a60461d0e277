// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-connection egress machinery: the packet builder turns a connection's
//! pending send intentions into a chain of UDP datagrams of encrypted QUIC
//! packets and hands them to a datapath.
//!
//! The builder is strictly single-threaded per connection; every operation
//! runs on the connection's serialization context and nothing here blocks.

#![forbid(unsafe_code)]

pub mod connection;
pub mod crypto;
pub mod datapath;
pub mod endpoint;
pub mod recovery;
pub mod send;
pub mod space;
pub mod transmission;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
