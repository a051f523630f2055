// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A PCI segment/bus/device/function address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    /// PCI segment (domain).
    pub segment: u16,
    /// Bus number.
    pub bus: u8,
    /// Device number, 0-31.
    pub device: u8,
    /// Function number, 0-7.
    pub function: u8,
}

/// An error parsing a [`PciAddress`].
#[derive(Debug, Error)]
#[error("invalid PCI address {0:?}, expected [segment:]bus:device.function")]
pub struct PciAddressError(String);

impl PciAddress {
    /// Creates an address, masking device and function to their field widths.
    pub const fn new(segment: u16, bus: u8, device: u8, function: u8) -> Self {
        Self {
            segment,
            bus,
            device: device & 0x1f,
            function: function & 0x7,
        }
    }
}

impl FromStr for PciAddress {
    type Err = PciAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || PciAddressError(s.to_owned());
        let (rest, function) = s.rsplit_once('.').ok_or_else(err)?;
        let mut parts = rest.rsplitn(3, ':');
        let device = parts.next().ok_or_else(err)?;
        let bus = parts.next().ok_or_else(err)?;
        let segment = parts.next().unwrap_or("0");

        let segment = u16::from_str_radix(segment, 16).map_err(|_| err())?;
        let bus = u8::from_str_radix(bus, 16).map_err(|_| err())?;
        let device = u8::from_str_radix(device, 16).map_err(|_| err())?;
        let function = u8::from_str_radix(function, 16).map_err(|_| err())?;
        if device > 0x1f || function > 7 {
            return Err(err());
        }
        Ok(Self {
            segment,
            bus,
            device,
            function,
        })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.segment, self.bus, self.device, self.function
        )
    }
}

#[cfg(test)]
mod tests {
    use super::PciAddress;

    #[test]
    fn parse_with_and_without_segment() {
        let addr: PciAddress = "0000:3a:00.1".parse().unwrap();
        assert_eq!(addr, PciAddress::new(0, 0x3a, 0, 1));
        assert_eq!(addr.to_string(), "0000:3a:00.1");

        let addr: PciAddress = "17:1f.7".parse().unwrap();
        assert_eq!(addr, PciAddress::new(0, 0x17, 0x1f, 7));

        let addr: PciAddress = "10:02:03.0".parse().unwrap();
        assert_eq!(addr.segment, 0x10);
    }

    #[test]
    fn parse_rejects_garbage() {
        for s in ["", "3a", "3a:00", "3a:20.0", "3a:00.8", "x:00.0", "1:2:3:4.0"] {
            assert!(s.parse::<PciAddress>().is_err(), "{s}");
        }
    }
}
