// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// A packet-protection failure.
///
/// Any of these reported during packet finalization is fatal to the
/// connection.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Error {
    reason: &'static str,
}

impl Error {
    #[inline]
    pub const fn new(reason: &'static str) -> Self {
        Self { reason }
    }

    #[inline]
    pub const fn reason(self) -> &'static str {
        self.reason
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("packet_protection::Error")
            .field("reason", &self.reason)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "packet protection failed: {}", self.reason)
    }
}

impl std::error::Error for Error {}
