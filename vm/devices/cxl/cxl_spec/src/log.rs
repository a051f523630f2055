// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Well-known log identifiers.

use std::fmt;

/// A 16-byte log identifier as reported by Get Supported Logs.
///
/// Identifiers are compared by exact byte equality.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct LogUuid(pub [u8; 16]);

impl LogUuid {
    /// Command Effects Log.
    pub const COMMAND_EFFECTS_LOG: Self = Self([
        0x0d, 0xa9, 0xc0, 0xb5, 0xbf, 0x41, 0x4b, 0x78, 0x8f, 0x79, 0x96, 0xb1, 0x62, 0x3b, 0x3f,
        0x17,
    ]);
    /// Vendor debug log.
    pub const VENDOR_DEBUG: Self = Self([
        0x5e, 0x18, 0x19, 0xd9, 0x11, 0xa9, 0x40, 0x0c, 0x81, 0x1f, 0xd6, 0x07, 0x19, 0x40, 0x3d,
        0x86,
    ]);
    /// Component state dump log.
    pub const COMPONENT_STATE_DUMP: Self = Self([
        0xb3, 0xfa, 0xb4, 0xcf, 0x01, 0xb6, 0x43, 0x32, 0x94, 0x3e, 0x5e, 0x99, 0x62, 0xf2, 0x35,
        0x67,
    ]);

    /// Returns the identifier if `bytes` is exactly 16 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }
}

impl fmt::Debug for LogUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for LogUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}
