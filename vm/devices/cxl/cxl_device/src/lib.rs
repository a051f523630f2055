// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Discovery and mapping of the register blocks of a CXL PCI function.
//!
//! Discovery proceeds in three steps:
//!
//! 1. [`walker`] follows the PCIe extended capability list in configuration
//!    space to the CXL Register Locator DVSEC and selects the memory device
//!    register block.
//! 2. [`mapper`] resolves the block's BAR to a physical address, reads the
//!    device capabilities array, and maps the primary mailbox registers.
//! 3. The resulting [`DeviceRegisterIo`] handle is handed to the mailbox
//!    protocol engine.

#![forbid(unsafe_code)]

mod address;
pub mod config_space;
pub mod mapper;
pub mod walker;

pub use address::PciAddress;
pub use address::PciAddressError;
pub use config_space::ConfigSpace;

use std::io;
use thiserror::Error;

/// Access to a device's memory-mapped registers.
///
/// Accesses are volatile and performed in program order. Offsets are
/// relative to the start of the mapping.
pub trait DeviceRegisterIo: Send + Sync {
    /// Returns the length of the register space.
    fn len(&self) -> usize;
    /// Reads a u32 register.
    fn read_u32(&self, offset: usize) -> u32;
    /// Reads a u64 register.
    fn read_u64(&self, offset: usize) -> u64;
    /// Writes a u32 register.
    fn write_u32(&self, offset: usize, data: u32);
    /// Writes a u64 register.
    fn write_u64(&self, offset: usize, data: u64);
}

impl<T: DeviceRegisterIo + ?Sized> DeviceRegisterIo for Box<T> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn read_u32(&self, offset: usize) -> u32 {
        (**self).read_u32(offset)
    }

    fn read_u64(&self, offset: usize) -> u64 {
        (**self).read_u64(offset)
    }

    fn write_u32(&self, offset: usize, data: u32) {
        (**self).write_u32(offset, data)
    }

    fn write_u64(&self, offset: usize, data: u64) {
        (**self).write_u64(offset, data)
    }
}

/// Maps physical register ranges for access.
pub trait RegisterMapper {
    /// The register access type produced by a mapping.
    type Registers: 'static + DeviceRegisterIo;

    /// Maps `len` bytes of registers at physical address `address`.
    fn map(&mut self, address: u64, len: usize) -> io::Result<Self::Registers>;
}

/// An error discovering or mapping the CXL mailbox of a device.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No CXL Register Locator DVSEC is present.
    #[error("CXL register locator capability not found")]
    CapabilityNotFound,
    /// The Register Locator has no memory device register block.
    #[error("CXL memory device register block not found")]
    RegisterBlockNotFound,
    /// The extended capability list is cyclic or points outside the
    /// extended configuration space.
    #[error("malformed extended capability list at offset {offset:#x}")]
    MalformedCapabilityList {
        /// The offending offset.
        offset: u16,
    },
    /// The device capabilities array has no primary mailbox.
    #[error("primary mailbox capability not found")]
    MailboxCapabilityNotFound,
    /// The BAR that holds the register block cannot be used.
    #[error("bar {index} is unusable: {reason}")]
    InvalidBar {
        /// The BAR index.
        index: u8,
        /// Why the BAR was rejected.
        reason: &'static str,
    },
    /// Reading configuration space failed.
    #[error("failed to read config space at offset {offset:#x}")]
    ConfigSpace {
        /// The offset being read.
        offset: u16,
        /// The underlying error.
        #[source]
        err: io::Error,
    },
    /// Mapping the register block failed.
    #[error("failed to map {len:#x} bytes at physical address {address:#x}")]
    MapFailed {
        /// The physical address.
        address: u64,
        /// The requested length.
        len: usize,
        /// The underlying error.
        #[source]
        err: io::Error,
    },
}
