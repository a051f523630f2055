// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This crate provides an emulated CXL memory device: a configuration space
//! with a Register Locator DVSEC, a memory device register block with a
//! device capabilities array, and a scripted primary mailbox. It lets the
//! discovery, mailbox, and dispatch layers run end to end without hardware.
//! Everything in this crate is meant for TESTING PURPOSES ONLY and it should
//! only ever be added as a dev-dependency.

mod config;
mod mailbox;

pub use config::ConfigSpaceBuilder;
pub use mailbox::Access;
pub use mailbox::CommandHandler;
pub use mailbox::Component;
pub use mailbox::EmulatedMailbox;
pub use mailbox::MailboxRegisterWindow;
pub use mailbox::MailboxReply;

use anyhow::Context;
use cxl_device::DeviceRegisterIo;
use cxl_device::RegisterMapper;
use cxl_device::config_space::ConfigSpaceBuffer;
use cxl_spec::caps::ExtendedCapabilityId;
use cxl_spec::caps::register_locator::RegisterBlockIdentifier;
use cxl_spec::caps::register_locator::RegisterLocatorEntry;
use cxl_spec::device_regs::CapabilitiesArray;
use cxl_spec::device_regs::CapabilityHeaderId;
use cxl_spec::device_regs::DeviceCapabilityId;
use std::io;
use std::sync::Arc;

/// Physical address of the emulated device's 64-bit BAR 2.
pub const BAR2_ADDRESS: u64 = 0x38_0000_0000;
/// Offset of the memory device register block within BAR 2.
pub const MEMORY_DEVICE_BLOCK_OFFSET: u64 = 0x1_0000;
/// Offset of the primary mailbox within the memory device register block.
pub const MAILBOX_OFFSET: u32 = 0x1000;
/// Offset of the Register Locator DVSEC in configuration space.
pub const REGISTER_LOCATOR_OFFSET: u16 = 0x150;

/// Routes `tracing` output at all levels to the test harness. Safe to call
/// from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// An emulated CXL memory device wrapping an [`EmulatedMailbox`].
pub struct EmulatedCxlDevice {
    config: ConfigSpaceBuffer,
    mailbox: EmulatedMailbox,
    capabilities_array: Arc<[u8]>,
}

impl EmulatedCxlDevice {
    /// Creates a device whose primary mailbox is `mailbox`.
    pub fn new(mailbox: EmulatedMailbox) -> anyhow::Result<Self> {
        let entries = [
            RegisterLocatorEntry {
                bar: 2,
                block_identifier: RegisterBlockIdentifier::COMPONENT,
                offset: 0,
            },
            RegisterLocatorEntry {
                bar: 2,
                block_identifier: RegisterBlockIdentifier::MEMORY_DEVICE,
                offset: MEMORY_DEVICE_BLOCK_OFFSET,
            },
        ];
        let config = ConfigSpaceBuilder::new()
            .bar64(2, BAR2_ADDRESS)
            .extended_capability(0x100, ExtendedCapabilityId::AER, &[0; 17])
            .register_locator(REGISTER_LOCATOR_OFFSET, &entries)
            .build()
            .context("failed to build config space")?;

        let capabilities = [
            (DeviceCapabilityId::DEVICE_STATUS, 0x100, 0x100),
            (
                DeviceCapabilityId::PRIMARY_MAILBOX,
                MAILBOX_OFFSET,
                mailbox.len() as u32,
            ),
            (DeviceCapabilityId::MEMORY_DEVICE_STATUS, 0x4000, 0x8),
        ];
        let mut array = Vec::new();
        array.extend_from_slice(
            &CapabilitiesArray::new()
                .with_version(1)
                .with_capabilities_count(capabilities.len() as u16)
                .into_bits()
                .to_le_bytes(),
        );
        for (id, offset, len) in capabilities {
            let header = CapabilityHeaderId::new()
                .with_capability_id(id)
                .with_version(1);
            array.extend_from_slice(&header.into_bits().to_le_bytes());
            array.extend_from_slice(&offset.to_le_bytes());
            array.extend_from_slice(&len.to_le_bytes());
            array.extend_from_slice(&0u32.to_le_bytes());
        }

        Ok(Self {
            config,
            mailbox,
            capabilities_array: array.into(),
        })
    }

    /// Returns a copy of the device's configuration space.
    pub fn config_space(&self) -> ConfigSpaceBuffer {
        self.config.clone()
    }

    /// Returns the device's mailbox.
    pub fn mailbox(&self) -> &EmulatedMailbox {
        &self.mailbox
    }

    /// The physical address of the memory device register block.
    pub fn block_address(&self) -> u64 {
        BAR2_ADDRESS + MEMORY_DEVICE_BLOCK_OFFSET
    }

    /// The physical address of the primary mailbox.
    pub fn mailbox_address(&self) -> u64 {
        self.block_address() + MAILBOX_OFFSET as u64
    }

    /// Returns a mapper that resolves the device's physical register ranges.
    pub fn mapper(&self) -> EmulatedMapper {
        EmulatedMapper {
            block: self.block_address(),
            mailbox_address: self.mailbox_address(),
            capabilities_array: self.capabilities_array.clone(),
            mailbox: self.mailbox.clone(),
            mappings: Vec::new(),
        }
    }
}

/// A [`RegisterMapper`] for an [`EmulatedCxlDevice`].
pub struct EmulatedMapper {
    block: u64,
    mailbox_address: u64,
    capabilities_array: Arc<[u8]>,
    mailbox: EmulatedMailbox,
    mappings: Vec<(u64, usize)>,
}

impl EmulatedMapper {
    /// The (address, length) of every successful mapping so far.
    pub fn mappings(&self) -> &[(u64, usize)] {
        &self.mappings
    }
}

impl RegisterMapper for EmulatedMapper {
    type Registers = EmulatedRegisters;

    fn map(&mut self, address: u64, len: usize) -> io::Result<EmulatedRegisters> {
        let registers = if address == self.mailbox_address && len <= self.mailbox.len() {
            EmulatedRegisters::Mailbox(self.mailbox.registers(len))
        } else if address == self.block && len <= self.capabilities_array.len() {
            EmulatedRegisters::Memory {
                data: self.capabilities_array.clone(),
                len,
            }
        } else {
            tracing::debug!(address, len, "unmapped emulated range");
            return Err(io::Error::other(format!(
                "no emulated registers at {address:#x}+{len:#x}"
            )));
        };
        self.mappings.push((address, len));
        Ok(registers)
    }
}

/// Registers produced by an [`EmulatedMapper`].
pub enum EmulatedRegisters {
    /// Read-only memory, such as the device capabilities array.
    Memory {
        /// The contents.
        data: Arc<[u8]>,
        /// The mapped length.
        len: usize,
    },
    /// The primary mailbox.
    Mailbox(MailboxRegisterWindow),
}

impl DeviceRegisterIo for EmulatedRegisters {
    fn len(&self) -> usize {
        match self {
            Self::Memory { len, .. } => *len,
            Self::Mailbox(regs) => regs.len(),
        }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        match self {
            Self::Memory { data, len } => {
                assert!(offset + 4 <= *len, "bad read at {offset:#x}");
                let mut n = [0; 4];
                n.copy_from_slice(&data[offset..offset + 4]);
                u32::from_le_bytes(n)
            }
            Self::Mailbox(regs) => regs.read_u32(offset),
        }
    }

    fn read_u64(&self, offset: usize) -> u64 {
        match self {
            Self::Memory { .. } => {
                self.read_u32(offset) as u64 | (self.read_u32(offset + 4) as u64) << 32
            }
            Self::Mailbox(regs) => regs.read_u64(offset),
        }
    }

    fn write_u32(&self, offset: usize, data: u32) {
        match self {
            Self::Memory { .. } => {}
            Self::Mailbox(regs) => regs.write_u32(offset, data),
        }
    }

    fn write_u64(&self, offset: usize, data: u64) {
        match self {
            Self::Memory { .. } => {}
            Self::Mailbox(regs) => regs.write_u64(offset, data),
        }
    }
}
