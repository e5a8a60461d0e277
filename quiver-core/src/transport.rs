// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

//= https://www.rfc-editor.org/rfc/rfc9000#section-20.1
//# QUIC transport error codes and application error codes share a common
//# range of values.

/// A transport-level error code
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Error {
    code: u64,
}

impl Error {
    //= https://www.rfc-editor.org/rfc/rfc9000#section-20.1
    //# NO_ERROR (0x00):  An endpoint uses this with CONNECTION_CLOSE to
    //#    signal that the connection is being closed abruptly in the absence
    //#    of any error.
    pub const NO_ERROR: Self = Self { code: 0x00 };

    //= https://www.rfc-editor.org/rfc/rfc9000#section-20.1
    //# INTERNAL_ERROR (0x01):  The endpoint encountered an internal error
    //#    and cannot continue with the connection.
    pub const INTERNAL_ERROR: Self = Self { code: 0x01 };

    #[inline]
    pub const fn new(code: u64) -> Self {
        Self { code }
    }

    #[inline]
    pub const fn code(self) -> u64 {
        self.code
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("transport::Error")
            .field(&format_args!("{:#04x}", self.code))
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::NO_ERROR => write!(f, "NO_ERROR"),
            Self::INTERNAL_ERROR => write!(f, "INTERNAL_ERROR"),
            _ => write!(f, "error {:#04x}", self.code),
        }
    }
}
