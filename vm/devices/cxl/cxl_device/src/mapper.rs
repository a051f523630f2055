// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! BAR resolution and mapping of the CXL mailbox registers.

use crate::ConfigSpace;
use crate::DeviceRegisterIo;
use crate::DiscoveryError;
use crate::RegisterMapper;
use crate::config_space::read_u32;
use cxl_spec::caps::register_locator::RegisterLocatorEntry;
use cxl_spec::cfg_space;
use cxl_spec::cfg_space::BarEncodingBits;
use cxl_spec::device_regs;
use cxl_spec::device_regs::CapabilitiesArray;
use cxl_spec::device_regs::DeviceCapability;
use cxl_spec::device_regs::DeviceCapabilityId;
use cxl_spec::mailbox;

/// A decoded memory BAR.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BarAddress {
    /// The BAR index.
    pub index: u8,
    /// The base physical address.
    pub address: u64,
    /// The BAR is 64-bit and consumes the following BAR as its high half.
    pub is_64_bit: bool,
    /// The BAR is prefetchable.
    pub prefetchable: bool,
}

/// Reads and decodes memory BAR `index`.
pub fn read_bar(cfg: &dyn ConfigSpace, index: u8) -> Result<BarAddress, DiscoveryError> {
    if index >= cfg_space::BAR_COUNT {
        return Err(DiscoveryError::InvalidBar {
            index,
            reason: "no such bar",
        });
    }
    let low = read_u32(cfg, cfg_space::bar_offset(index))?;
    let bits = BarEncodingBits::from_bits(low);
    if bits.use_pio() {
        return Err(DiscoveryError::InvalidBar {
            index,
            reason: "i/o bar",
        });
    }
    let mut address = (low & cfg_space::BAR_MEMORY_ADDRESS_MASK) as u64;
    if bits.type_64_bit() {
        if index + 1 >= cfg_space::BAR_COUNT {
            return Err(DiscoveryError::InvalidBar {
                index,
                reason: "64-bit bar in last slot",
            });
        }
        let high = read_u32(cfg, cfg_space::bar_offset(index + 1))?;
        address |= (high as u64) << 32;
    }
    if address == 0 {
        return Err(DiscoveryError::InvalidBar {
            index,
            reason: "unassigned",
        });
    }
    Ok(BarAddress {
        index,
        address,
        is_64_bit: bits.type_64_bit(),
        prefetchable: bits.prefetchable(),
    })
}

/// Reads the device capabilities array at the start of a memory device
/// register block.
///
/// Headers that would fall outside `regs` are not read.
pub fn read_device_capabilities(regs: &dyn DeviceRegisterIo) -> Vec<DeviceCapability> {
    if regs.len() < device_regs::CAPABILITIES_ARRAY_SIZE {
        return Vec::new();
    }
    let array = CapabilitiesArray::from_bits(regs.read_u64(0));
    let count = (array.capabilities_count() as usize).min(device_regs::MAX_CAPABILITIES);
    let available = (regs.len() - device_regs::CAPABILITIES_ARRAY_SIZE)
        / device_regs::CAPABILITY_HEADER_SIZE;
    if count > available {
        tracing::warn!(count, available, "capabilities array exceeds register block");
    }
    (0..count.min(available))
        .map(|i| {
            let base = device_regs::CAPABILITIES_ARRAY_SIZE + i * device_regs::CAPABILITY_HEADER_SIZE;
            DeviceCapability::from_dwords(
                regs.read_u32(base),
                regs.read_u32(base + 4),
                regs.read_u32(base + 8),
            )
        })
        .collect()
}

/// Maps the primary mailbox registers of the register block described by
/// `entry`.
///
/// The capabilities array is mapped first to locate the mailbox. The mailbox
/// mapping covers the capability's advertised length, and never less than
/// the register header plus the minimum payload window.
pub fn map_mailbox<M: RegisterMapper>(
    mapper: &mut M,
    cfg: &dyn ConfigSpace,
    entry: &RegisterLocatorEntry,
) -> Result<M::Registers, DiscoveryError> {
    let bar = read_bar(cfg, entry.bar)?;
    let block = bar
        .address
        .checked_add(entry.offset)
        .ok_or(DiscoveryError::InvalidBar {
            index: entry.bar,
            reason: "register block offset overflows",
        })?;
    tracing::debug!(bar = bar.index, block, "memory device register block");

    let array = map(mapper, block, device_regs::CAPABILITIES_ARRAY_SIZE)?;
    let count = CapabilitiesArray::from_bits(array.read_u64(0)).capabilities_count() as usize;
    drop(array);

    let array_len = device_regs::CAPABILITIES_ARRAY_SIZE
        + count.min(device_regs::MAX_CAPABILITIES) * device_regs::CAPABILITY_HEADER_SIZE;
    let array = map(mapper, block, array_len)?;
    let capability = read_device_capabilities(&array)
        .into_iter()
        .find(|cap| cap.id == DeviceCapabilityId::PRIMARY_MAILBOX)
        .ok_or(DiscoveryError::MailboxCapabilityNotFound)?;
    drop(array);

    let address =
        block
            .checked_add(capability.offset.into())
            .ok_or(DiscoveryError::InvalidBar {
                index: entry.bar,
                reason: "mailbox capability offset overflows",
            })?;
    let len = (capability.length as usize).max(mailbox::HEADER_SIZE + mailbox::MIN_PAYLOAD_SIZE);
    tracing::debug!(
        address,
        len,
        version = capability.version,
        "mapping primary mailbox"
    );
    map(mapper, address, len)
}

fn map<M: RegisterMapper>(
    mapper: &mut M,
    address: u64,
    len: usize,
) -> Result<M::Registers, DiscoveryError> {
    mapper
        .map(address, len)
        .map_err(|err| DiscoveryError::MapFailed { address, len, err })
}

#[cfg(target_os = "linux")]
pub use mmio::MmioRegisters;
#[cfg(target_os = "linux")]
pub use mmio::PhysicalMemoryMapper;

#[cfg(target_os = "linux")]
mod mmio {
    use crate::DeviceRegisterIo;
    use crate::RegisterMapper;
    use mmio_mapping::MappedRegion;
    use mmio_mapping::MappingError;
    use std::io;
    use std::path::PathBuf;

    /// Maps registers through a physical memory device such as `/dev/mem`.
    #[derive(Debug, Clone)]
    pub struct PhysicalMemoryMapper {
        mem_device: PathBuf,
    }

    impl PhysicalMemoryMapper {
        /// Creates a mapper over `mem_device`.
        pub fn new(mem_device: impl Into<PathBuf>) -> Self {
            Self {
                mem_device: mem_device.into(),
            }
        }
    }

    impl RegisterMapper for PhysicalMemoryMapper {
        type Registers = MmioRegisters;

        fn map(&mut self, address: u64, len: usize) -> io::Result<MmioRegisters> {
            let region = MappedRegion::map_physical(&self.mem_device, address, len)
                .map_err(|err| match err {
                    MappingError::Open(err) => err,
                    err => io::Error::other(err),
                })?;
            Ok(MmioRegisters { region })
        }
    }

    /// Registers accessed through a [`MappedRegion`].
    ///
    /// Reads outside the mapping return all ones and writes outside it are
    /// dropped, matching an unclaimed PCI access.
    #[derive(Debug)]
    pub struct MmioRegisters {
        region: MappedRegion,
    }

    impl MmioRegisters {
        /// Wraps an existing mapping.
        pub fn new(region: MappedRegion) -> Self {
            Self { region }
        }
    }

    impl DeviceRegisterIo for MmioRegisters {
        fn len(&self) -> usize {
            self.region.len()
        }

        fn read_u32(&self, offset: usize) -> u32 {
            self.region.read_volatile(offset).unwrap_or_else(|err| {
                tracing::warn!(offset, error = &err as &dyn std::error::Error, "bad register read");
                !0
            })
        }

        fn read_u64(&self, offset: usize) -> u64 {
            self.region.read_volatile(offset).unwrap_or_else(|err| {
                tracing::warn!(offset, error = &err as &dyn std::error::Error, "bad register read");
                !0
            })
        }

        fn write_u32(&self, offset: usize, data: u32) {
            if let Err(err) = self.region.write_volatile(offset, &data) {
                tracing::warn!(offset, error = &err as &dyn std::error::Error, "bad register write");
            }
        }

        fn write_u64(&self, offset: usize, data: u64) {
            if let Err(err) = self.region.write_volatile(offset, &data) {
                tracing::warn!(offset, error = &err as &dyn std::error::Error, "bad register write");
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_space::ConfigSpaceBuffer;
    use cxl_spec::device_regs::CapabilityHeaderId;
    use std::collections::BTreeMap;
    use std::io;
    use std::sync::Arc;
    use std::sync::Mutex;

    /// Sparse physical memory shared between a test and its mappings.
    #[derive(Default, Clone)]
    struct PhysMem(Arc<Mutex<BTreeMap<u64, u32>>>);

    impl PhysMem {
        fn write_u32(&self, address: u64, value: u32) {
            self.0.lock().unwrap().insert(address, value);
        }
    }

    struct Window {
        mem: PhysMem,
        base: u64,
        len: usize,
    }

    impl DeviceRegisterIo for Window {
        fn len(&self) -> usize {
            self.len
        }

        fn read_u32(&self, offset: usize) -> u32 {
            assert!(offset + 4 <= self.len);
            let mem = self.mem.0.lock().unwrap();
            mem.get(&(self.base + offset as u64)).copied().unwrap_or(0)
        }

        fn read_u64(&self, offset: usize) -> u64 {
            self.read_u32(offset) as u64 | (self.read_u32(offset + 4) as u64) << 32
        }

        fn write_u32(&self, offset: usize, data: u32) {
            assert!(offset + 4 <= self.len);
            self.mem.write_u32(self.base + offset as u64, data);
        }

        fn write_u64(&self, offset: usize, data: u64) {
            self.write_u32(offset, data as u32);
            self.write_u32(offset + 4, (data >> 32) as u32);
        }
    }

    #[derive(Default)]
    struct TestMapper {
        mem: PhysMem,
        maps: Vec<(u64, usize)>,
    }

    impl RegisterMapper for TestMapper {
        type Registers = Window;

        fn map(&mut self, address: u64, len: usize) -> io::Result<Window> {
            if address >> 48 == 1 {
                return Err(io::ErrorKind::PermissionDenied.into());
            }
            self.maps.push((address, len));
            Ok(Window {
                mem: self.mem.clone(),
                base: address,
                len,
            })
        }
    }

    fn cfg_with_bar2_64(address: u64) -> ConfigSpaceBuffer {
        let mut cfg = ConfigSpaceBuffer::new();
        cfg.write_u32(
            cfg_space::bar_offset(2),
            address as u32
                | u32::from(BarEncodingBits::new().with_type_64_bit(true).with_prefetchable(true)),
        );
        cfg.write_u32(cfg_space::bar_offset(3), (address >> 32) as u32);
        cfg
    }

    fn capability(mem: &PhysMem, block: u64, index: u64, id: DeviceCapabilityId, offset: u32, len: u32) {
        let base = block + 0x10 + index * 0x10;
        mem.write_u32(
            base,
            CapabilityHeaderId::new().with_capability_id(id).with_version(1).into(),
        );
        mem.write_u32(base + 4, offset);
        mem.write_u32(base + 8, len);
    }

    fn mailbox_entry() -> RegisterLocatorEntry {
        RegisterLocatorEntry::from_dwords(0x0001_0302, 0)
    }

    #[test]
    fn bar_decode() {
        let cfg = cfg_with_bar2_64(0x38_0000_0000);
        let bar = read_bar(&cfg, 2).unwrap();
        assert_eq!(bar.address, 0x38_0000_0000);
        assert!(bar.is_64_bit);
        assert!(bar.prefetchable);

        let mut cfg = ConfigSpaceBuffer::new();
        cfg.write_u32(cfg_space::bar_offset(0), 0xfe00_0000);
        let bar = read_bar(&cfg, 0).unwrap();
        assert_eq!(bar.address, 0xfe00_0000);
        assert!(!bar.is_64_bit);

        cfg.write_u32(cfg_space::bar_offset(1), 0xe001);
        assert!(matches!(
            read_bar(&cfg, 1),
            Err(DiscoveryError::InvalidBar { index: 1, .. })
        ));
        cfg.write_u32(cfg_space::bar_offset(5), 0xfd00_0004);
        assert!(matches!(
            read_bar(&cfg, 5),
            Err(DiscoveryError::InvalidBar { index: 5, .. })
        ));
        assert!(matches!(
            read_bar(&cfg, 4),
            Err(DiscoveryError::InvalidBar { index: 4, .. })
        ));
        assert!(matches!(
            read_bar(&cfg, 6),
            Err(DiscoveryError::InvalidBar { index: 6, .. })
        ));
    }

    #[test]
    fn maps_primary_mailbox() {
        let bar = 0x38_0000_0000;
        let block = bar + 0x1_0000;
        let cfg = cfg_with_bar2_64(bar);
        let mut mapper = TestMapper::default();
        mapper.mem.write_u32(block, 0);
        mapper.mem.write_u32(block + 4, 3);
        capability(&mapper.mem, block, 0, DeviceCapabilityId::DEVICE_STATUS, 0x100, 0x100);
        capability(&mapper.mem, block, 1, DeviceCapabilityId::MEMORY_DEVICE_STATUS, 0x200, 0x8);
        capability(&mapper.mem, block, 2, DeviceCapabilityId::PRIMARY_MAILBOX, 0x1000, 0x820);
        mapper.mem.write_u32(block + 0x1000, 0x0b);

        let regs = map_mailbox(&mut mapper, &cfg, &mailbox_entry()).unwrap();
        assert_eq!(regs.len(), 0x820);
        assert_eq!(regs.read_u32(0), 0x0b);
        assert_eq!(
            mapper.maps,
            [(block, 0x10), (block, 0x40), (block + 0x1000, 0x820)]
        );
    }

    #[test]
    fn short_mailbox_length_is_extended() {
        let bar = 0x38_0000_0000;
        let block = bar + 0x1_0000;
        let cfg = cfg_with_bar2_64(bar);
        let mut mapper = TestMapper::default();
        mapper.mem.write_u32(block + 4, 1);
        capability(&mapper.mem, block, 0, DeviceCapabilityId::PRIMARY_MAILBOX, 0x80, 0x20);

        let regs = map_mailbox(&mut mapper, &cfg, &mailbox_entry()).unwrap();
        assert_eq!(regs.len(), 0x120);
    }

    #[test]
    fn no_primary_mailbox() {
        let bar = 0x38_0000_0000;
        let block = bar + 0x1_0000;
        let cfg = cfg_with_bar2_64(bar);
        let mut mapper = TestMapper::default();
        mapper.mem.write_u32(block + 4, 2);
        capability(&mapper.mem, block, 0, DeviceCapabilityId::DEVICE_STATUS, 0x100, 0x100);
        capability(&mapper.mem, block, 1, DeviceCapabilityId::SECONDARY_MAILBOX, 0x800, 0x820);

        assert!(matches!(
            map_mailbox(&mut mapper, &cfg, &mailbox_entry()),
            Err(DiscoveryError::MailboxCapabilityNotFound)
        ));
    }

    #[test]
    fn mailbox_offset_overflow() {
        // The block sits near the top of the address space and the mailbox
        // offset wraps past it.
        let bar = 0xffff_ffff_0000_0000;
        let block = bar + 0x1_0000;
        let cfg = cfg_with_bar2_64(bar);
        let mut mapper = TestMapper::default();
        mapper.mem.write_u32(block + 4, 1);
        capability(&mapper.mem, block, 0, DeviceCapabilityId::PRIMARY_MAILBOX, 0xffff_0000, 0x820);

        assert!(matches!(
            map_mailbox(&mut mapper, &cfg, &mailbox_entry()),
            Err(DiscoveryError::InvalidBar { index: 2, .. })
        ));
    }

    #[test]
    fn map_failure() {
        let cfg = cfg_with_bar2_64(0x1_0000_0000_0000);
        let mut mapper = TestMapper::default();
        assert!(matches!(
            map_mailbox(&mut mapper, &cfg, &mailbox_entry()),
            Err(DiscoveryError::MapFailed { .. })
        ));
    }
}
