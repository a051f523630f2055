// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types and constants specified by the PCI Express and CXL specifications
//! that are needed to discover and drive a CXL component command interface.
//!
//! This crate contains definitions only; it performs no I/O.

#![forbid(unsafe_code)]

pub mod cci;
pub mod log;
pub mod mailbox;

pub use log::LogUuid;
pub use mailbox::ReturnCode;

/// Configuration Space
///
/// Sources: PCI 2.3 Spec - Chapter 6, PCIe Base Spec 6.0 - 7.5
pub mod cfg_space {
    use bitfield_struct::bitfield;

    /// Size of the conventional (PCI-compatible) configuration space.
    pub const CONFIG_SPACE_SIZE: u16 = 0x100;

    /// Size of the PCI Express extended configuration space.
    pub const EXTENDED_CONFIG_SPACE_SIZE: u16 = 0x1000;

    /// Offset of the first extended capability header.
    pub const EXTENDED_CAPABILITIES_START: u16 = 0x100;

    /// Number of base address registers in a type 00h header.
    pub const BAR_COUNT: u8 = 6;

    /// Offsets into the type 00h configuration space header.
    ///
    /// | Offset | Bits 31-24                 | Bits 23-16  | Bits 15-8           | Bits 7-0             |
    /// |--------|----------------------------|-------------|---------------------|--------------------- |
    /// | 0x0    | Device ID                  |             | Vendor ID           |                      |
    /// | 0x4    | Status                     |             | Command             |                      |
    /// | 0x8    | Class code                 |             |                     | Revision ID          |
    /// | 0xC    | BIST                       | Header type | Latency Timer       | Cache Line Size      |
    /// | 0x10   | Base address #0 (BAR0)     |             |                     |                      |
    /// | ...    | ...                        |             |                     |                      |
    /// | 0x24   | Base address #5 (BAR5)     |             |                     |                      |
    /// | 0x2C   | Subsystem ID               |             | Subsystem Vendor ID |                      |
    /// | 0x34   | Reserved                   |             |                     | Capabilities Pointer |
    #[expect(missing_docs)] // self explanatory offsets
    pub mod header_type_00 {
        pub const DEVICE_VENDOR: u16 = 0x00;
        pub const STATUS_COMMAND: u16 = 0x04;
        pub const CLASS_REVISION: u16 = 0x08;
        pub const BIST_HEADER: u16 = 0x0C;
        pub const BAR0: u16 = 0x10;
        pub const SUBSYSTEM_ID: u16 = 0x2C;
        pub const RESERVED_CAP_PTR: u16 = 0x34;
    }

    /// Returns the configuration space offset of BAR `index`.
    pub const fn bar_offset(index: u8) -> u16 {
        header_type_00::BAR0 + 4 * index as u16
    }

    /// BAR in-band encoding bits.
    ///
    /// The low bits of the BAR are not actually part of the address.
    /// Instead, they are used to in-band encode various bits of
    /// metadata about the BAR, and are masked off when determining the
    /// actual address.
    #[bitfield(u32)]
    #[derive(PartialEq, Eq)]
    pub struct BarEncodingBits {
        /// The BAR decodes I/O space rather than memory space.
        pub use_pio: bool,

        _reserved: bool,

        /// False indicates 32 bit.
        /// Only used in MMIO
        pub type_64_bit: bool,
        /// The memory range is prefetchable.
        pub prefetchable: bool,

        #[bits(28)]
        _reserved2: u32,
    }

    /// Mask selecting the address bits of a memory BAR.
    pub const BAR_MEMORY_ADDRESS_MASK: u32 = !0xf;

    /// Mask selecting the address bits of an I/O BAR.
    pub const BAR_IO_ADDRESS_MASK: u32 = !0x3;

    /// Command Register
    #[bitfield(u16)]
    #[derive(PartialEq, Eq)]
    pub struct Command {
        /// I/O space decoding enabled.
        pub pio_enabled: bool,
        /// Memory space decoding enabled.
        pub mmio_enabled: bool,
        /// Bus mastering enabled.
        pub bus_master: bool,
        #[bits(7)]
        _reserved: u16,
        /// Legacy INTx assertion disabled.
        pub intx_disable: bool,
        #[bits(5)]
        _reserved2: u16,
    }
}

/// PCI Express extended capabilities and the CXL designated vendor-specific
/// extended capabilities that live among them.
pub mod caps {
    use bitfield_struct::bitfield;

    /// An extended capability ID.
    ///
    /// Sources: PCIe Base Spec 6.0 - 7.6.3
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ExtendedCapabilityId(pub u16);

    impl ExtendedCapabilityId {
        /// Advanced Error Reporting.
        pub const AER: Self = Self(0x0001);
        /// Vendor-specific extended capability.
        pub const VENDOR_SPECIFIC: Self = Self(0x000B);
        /// Designated vendor-specific extended capability.
        pub const DVSEC: Self = Self(0x0023);
        /// Data object exchange.
        pub const DOE: Self = Self(0x002E);

        /// Converts from the raw field value.
        pub const fn from_bits(bits: u16) -> Self {
            Self(bits)
        }

        /// Converts to the raw field value.
        pub const fn into_bits(self) -> u16 {
            self.0
        }
    }

    /// PCI Express Extended Capability Header
    ///
    /// | Bits 31-20           | Bits 19-16 | Bits 15-0                 |
    /// |----------------------|------------|---------------------------|
    /// | Next Capability Ofs  | Version    | Extended Capability ID    |
    #[bitfield(u32)]
    #[derive(PartialEq, Eq)]
    pub struct ExtendedCapabilityHeader {
        /// The capability ID.
        #[bits(16)]
        pub capability_id: ExtendedCapabilityId,
        /// The capability structure version.
        #[bits(4)]
        pub version: u8,
        /// Offset of the next capability, or zero at the end of the list.
        #[bits(12)]
        pub next_offset: u16,
    }

    /// Designated Vendor-Specific Extended Capability definitions.
    pub mod dvsec {
        use bitfield_struct::bitfield;

        /// The vendor ID assigned to the CXL consortium.
        pub const CXL_VENDOR_ID: u16 = 0x1E98;

        /// Offset of DVSEC Header 1, relative to the capability.
        pub const HEADER1: u16 = 0x04;
        /// Offset of DVSEC Header 2, relative to the capability.
        pub const HEADER2: u16 = 0x08;

        /// DVSEC Header 1
        #[bitfield(u32)]
        #[derive(PartialEq, Eq)]
        pub struct DvsecHeader1 {
            /// The vendor that defines the DVSEC ID.
            #[bits(16)]
            pub vendor_id: u16,
            /// The vendor-defined revision.
            #[bits(4)]
            pub revision: u8,
            /// Length of the entire capability structure in bytes.
            #[bits(12)]
            pub length: u16,
        }

        /// CXL DVSEC IDs.
        ///
        /// Sources: CXL 3.1 Spec - Table 8-2
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub struct CxlDvsecId(pub u16);

        impl CxlDvsecId {
            /// PCIe DVSEC for CXL devices.
            pub const CXL_DEVICE: Self = Self(0x0000);
            /// Non-CXL function map.
            pub const NON_CXL_FUNCTION_MAP: Self = Self(0x0002);
            /// CXL extensions DVSEC for ports.
            pub const PORT_EXTENSIONS: Self = Self(0x0003);
            /// GPF DVSEC for CXL ports.
            pub const GPF_PORT: Self = Self(0x0004);
            /// GPF DVSEC for CXL devices.
            pub const GPF_DEVICE: Self = Self(0x0005);
            /// PCIe DVSEC for flex bus port.
            pub const FLEX_BUS_PORT: Self = Self(0x0007);
            /// Register Locator DVSEC.
            pub const REGISTER_LOCATOR: Self = Self(0x0008);
            /// MLD DVSEC.
            pub const MLD: Self = Self(0x0009);
        }
    }

    /// Register Locator DVSEC
    ///
    /// Sources: CXL 3.1 Spec - 8.1.9
    ///
    /// | Offset     | Bits 31-16             | Bits 15-0                |
    /// |------------|------------------------|--------------------------|
    /// | Cap + 0x0  | PCIe Extended Capability Header                   |
    /// | Cap + 0x4  | DVSEC Header 1                                    |
    /// | Cap + 0x8  | Reserved               | DVSEC Header 2 (ID)      |
    /// | Cap + 0xC  | Register Block 1 - Register Offset Low            |
    /// | Cap + 0x10 | Register Block 1 - Register Offset High           |
    /// | ...        | ...                                               |
    pub mod register_locator {
        use bitfield_struct::bitfield;

        /// Offset of the first register block entry, relative to the capability.
        pub const ENTRIES_OFFSET: u16 = 0x0C;
        /// Size of a single register block entry.
        pub const ENTRY_SIZE: u16 = 8;
        /// The maximum number of register block entries this driver considers.
        pub const MAX_ENTRIES: usize = 4;

        /// Register Offset Low
        #[bitfield(u32)]
        #[derive(PartialEq, Eq)]
        pub struct RegisterOffsetLow {
            /// BAR Indicator Register: the BAR containing the register block.
            #[bits(3)]
            pub bir: u8,
            #[bits(5)]
            _reserved: u8,
            /// The kind of register block.
            #[bits(8)]
            pub block_identifier: RegisterBlockIdentifier,
            /// Bits 31:16 of the register block offset within the BAR.
            #[bits(16)]
            pub offset_low: u16,
        }

        /// Register Block Identifier
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub struct RegisterBlockIdentifier(pub u8);

        impl RegisterBlockIdentifier {
            /// The entry is unused.
            pub const EMPTY: Self = Self(0x00);
            /// CXL component registers.
            pub const COMPONENT: Self = Self(0x01);
            /// BAR virtualization ACL registers.
            pub const BAR_VIRTUALIZATION_ACL: Self = Self(0x02);
            /// CXL memory device registers, which host the device mailbox.
            pub const MEMORY_DEVICE: Self = Self(0x03);
            /// CXL performance monitoring unit registers.
            pub const CPMU: Self = Self(0x04);

            /// Converts from the raw field value.
            pub const fn from_bits(bits: u8) -> Self {
                Self(bits)
            }

            /// Converts to the raw field value.
            pub const fn into_bits(self) -> u8 {
                self.0
            }
        }

        /// One decoded Register Locator entry.
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        pub struct RegisterLocatorEntry {
            /// The BAR containing the register block.
            pub bar: u8,
            /// The kind of register block.
            pub block_identifier: RegisterBlockIdentifier,
            /// Byte offset of the register block within the BAR.
            pub offset: u64,
        }

        impl RegisterLocatorEntry {
            /// Decodes an entry from its low and high dwords.
            pub fn from_dwords(low: u32, high: u32) -> Self {
                let low = RegisterOffsetLow::from(low);
                Self {
                    bar: low.bir(),
                    block_identifier: low.block_identifier(),
                    offset: ((high as u64) << 32) | ((low.offset_low() as u64) << 16),
                }
            }

            /// Encodes the entry as its low and high dwords.
            pub fn to_dwords(&self) -> (u32, u32) {
                let low = RegisterOffsetLow::new()
                    .with_bir(self.bar)
                    .with_block_identifier(self.block_identifier)
                    .with_offset_low((self.offset >> 16) as u16);
                (low.into(), (self.offset >> 32) as u32)
            }
        }
    }
}

/// CXL device register interface: the capabilities array at the start of the
/// memory device register block.
///
/// Sources: CXL 3.1 Spec - 8.2.8
pub mod device_regs {
    use bitfield_struct::bitfield;

    /// Size of the capabilities array register.
    pub const CAPABILITIES_ARRAY_SIZE: usize = 0x10;
    /// Size of one capability header.
    pub const CAPABILITY_HEADER_SIZE: usize = 0x10;
    /// The number of capability headers this driver will scan.
    pub const MAX_CAPABILITIES: usize = 32;

    /// Device Capabilities Array Register
    #[bitfield(u64)]
    #[derive(PartialEq, Eq)]
    pub struct CapabilitiesArray {
        /// Always zero.
        #[bits(16)]
        pub capability_id: u16,
        /// Structure version.
        #[bits(8)]
        pub version: u8,
        /// Type of the CXL device register interface.
        #[bits(8)]
        pub device_type: u8,
        /// Number of capability headers that follow.
        #[bits(16)]
        pub capabilities_count: u16,
        #[bits(16)]
        _reserved: u16,
    }

    /// Device capability IDs.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct DeviceCapabilityId(pub u16);

    impl DeviceCapabilityId {
        /// Device status registers.
        pub const DEVICE_STATUS: Self = Self(0x0001);
        /// Primary mailbox registers.
        pub const PRIMARY_MAILBOX: Self = Self(0x0002);
        /// Secondary mailbox registers.
        pub const SECONDARY_MAILBOX: Self = Self(0x0003);
        /// Memory device status registers.
        pub const MEMORY_DEVICE_STATUS: Self = Self(0x4000);

        /// Converts from the raw field value.
        pub const fn from_bits(bits: u16) -> Self {
            Self(bits)
        }

        /// Converts to the raw field value.
        pub const fn into_bits(self) -> u16 {
            self.0
        }
    }

    /// First dword of a device capability header.
    #[bitfield(u32)]
    #[derive(PartialEq, Eq)]
    pub struct CapabilityHeaderId {
        /// The capability.
        #[bits(16)]
        pub capability_id: DeviceCapabilityId,
        /// Capability structure version.
        #[bits(8)]
        pub version: u8,
        #[bits(8)]
        _reserved: u8,
    }

    /// A decoded device capability header.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DeviceCapability {
        /// The capability.
        pub id: DeviceCapabilityId,
        /// Capability structure version.
        pub version: u8,
        /// Offset of the capability registers from the start of the block.
        pub offset: u32,
        /// Length of the capability registers.
        pub length: u32,
    }

    impl DeviceCapability {
        /// Decodes a header from its first three dwords.
        pub fn from_dwords(id: u32, offset: u32, length: u32) -> Self {
            let id = CapabilityHeaderId::from(id);
            Self {
                id: id.capability_id(),
                version: id.version(),
                offset,
                length,
            }
        }
    }
}
