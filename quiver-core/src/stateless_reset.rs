// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
//# An endpoint that sends a Stateless Reset in response to a packet that
//# is 43 bytes or shorter SHOULD send a Stateless Reset that is one byte
//# shorter than the packet it responds to.

/// The minimum length of a packet that can carry a stateless reset token
pub const MIN_PACKET_LEN: u16 = 21;

/// Recommended length for a datagram that should be able to elicit a
/// stateless reset from the peer. Short-header probe packets are padded to
/// at least this length (plus slack) so the response is indistinguishable
/// from a regular packet.
pub const RECOMMENDED_PACKET_LEN: u16 = 41;
