// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Read access to PCI configuration space.

use crate::DiscoveryError;
use cxl_spec::cfg_space;
use cxl_spec::cfg_space::Command;
use cxl_spec::cfg_space::header_type_00;
use std::io;

/// Read access to the 4 KiB extended configuration space of a PCI function.
pub trait ConfigSpace: Send {
    /// Reads the dword at `offset`, which must be 4-byte aligned.
    fn read_u32(&self, offset: u16) -> io::Result<u32>;

    /// Reads the word at `offset`, which must be 2-byte aligned.
    fn read_u16(&self, offset: u16) -> io::Result<u16> {
        let shift = (offset & 2) * 8;
        Ok((self.read_u32(offset & !3)? >> shift) as u16)
    }

    /// Reads the byte at `offset`.
    fn read_u8(&self, offset: u16) -> io::Result<u8> {
        let shift = (offset & 3) * 8;
        Ok((self.read_u32(offset & !3)? >> shift) as u8)
    }
}

impl<T: ConfigSpace + ?Sized> ConfigSpace for Box<T> {
    fn read_u32(&self, offset: u16) -> io::Result<u32> {
        (**self).read_u32(offset)
    }
}

fn check_offset(offset: u16, len: usize, align: u16) -> io::Result<()> {
    if offset % align != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unaligned config space access at {offset:#x}"),
        ));
    }
    if offset as usize + len > cfg_space::EXTENDED_CONFIG_SPACE_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("config space offset {offset:#x} out of range"),
        ));
    }
    Ok(())
}

/// Reads a dword, attaching the offset to any error.
pub(crate) fn read_u32(cfg: &dyn ConfigSpace, offset: u16) -> Result<u32, DiscoveryError> {
    cfg.read_u32(offset)
        .map_err(|err| DiscoveryError::ConfigSpace { offset, err })
}

/// Reads a word, attaching the offset to any error.
pub(crate) fn read_u16(cfg: &dyn ConfigSpace, offset: u16) -> Result<u16, DiscoveryError> {
    cfg.read_u16(offset)
        .map_err(|err| DiscoveryError::ConfigSpace { offset, err })
}

/// A configuration space image held in memory.
///
/// Space that was never written reads as zero, which terminates capability
/// lists.
#[derive(Debug, Clone)]
pub struct ConfigSpaceBuffer {
    data: Box<[u8]>,
}

impl ConfigSpaceBuffer {
    /// Creates a zero-filled 4 KiB configuration space.
    pub fn new() -> Self {
        Self {
            data: vec![0; cfg_space::EXTENDED_CONFIG_SPACE_SIZE.into()].into(),
        }
    }

    /// Creates a configuration space from an image. Images shorter than
    /// 4 KiB are zero extended; longer images are truncated.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut this = Self::new();
        let len = bytes.len().min(this.data.len());
        this.data[..len].copy_from_slice(&bytes[..len]);
        this
    }

    /// Writes a dword. Out-of-range writes are ignored.
    pub fn write_u32(&mut self, offset: u16, value: u32) {
        let offset = offset as usize;
        if let Some(dst) = self.data.get_mut(offset..offset + 4) {
            dst.copy_from_slice(&value.to_le_bytes());
        }
    }

    /// Writes a word. Out-of-range writes are ignored.
    pub fn write_u16(&mut self, offset: u16, value: u16) {
        let offset = offset as usize;
        if let Some(dst) = self.data.get_mut(offset..offset + 2) {
            dst.copy_from_slice(&value.to_le_bytes());
        }
    }

    /// The raw image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl ConfigSpace for ConfigSpaceBuffer {
    fn read_u32(&self, offset: u16) -> io::Result<u32> {
        check_offset(offset, 4, 4)?;
        let offset = offset as usize;
        let mut n = [0; 4];
        n.copy_from_slice(&self.data[offset..offset + 4]);
        Ok(u32::from_le_bytes(n))
    }
}

/// The decoded type 00h configuration header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigHeader {
    /// Vendor ID.
    pub vendor_id: u16,
    /// Device ID.
    pub device_id: u16,
    /// Command register.
    pub command: Command,
    /// Status register.
    pub status: u16,
    /// Revision ID.
    pub revision_id: u8,
    /// Programming interface.
    pub prog_if: u8,
    /// Sub class code.
    pub sub_class: u8,
    /// Base class code.
    pub base_class: u8,
    /// Header type, without the multi-function bit.
    pub header_type: u8,
    /// Raw BAR values.
    pub bars: [u32; cfg_space::BAR_COUNT as usize],
}

impl ConfigHeader {
    /// Class code of a CXL memory device (memory controller, CXL).
    pub const CXL_MEMORY_DEVICE_CLASS: (u8, u8, u8) = (0x05, 0x02, 0x10);

    /// Reads and decodes the header.
    pub fn read(cfg: &dyn ConfigSpace) -> Result<Self, DiscoveryError> {
        let id = read_u32(cfg, header_type_00::DEVICE_VENDOR)?;
        let status_command = read_u32(cfg, header_type_00::STATUS_COMMAND)?;
        let class_revision = read_u32(cfg, header_type_00::CLASS_REVISION)?;
        let bist_header = read_u32(cfg, header_type_00::BIST_HEADER)?;
        let mut bars = [0; cfg_space::BAR_COUNT as usize];
        for (i, bar) in (0..).zip(bars.iter_mut()) {
            *bar = read_u32(cfg, cfg_space::bar_offset(i))?;
        }
        Ok(Self {
            vendor_id: id as u16,
            device_id: (id >> 16) as u16,
            command: Command::from_bits(status_command as u16),
            status: (status_command >> 16) as u16,
            revision_id: class_revision as u8,
            prog_if: (class_revision >> 8) as u8,
            sub_class: (class_revision >> 16) as u8,
            base_class: (class_revision >> 24) as u8,
            header_type: (bist_header >> 16) as u8 & 0x7f,
            bars,
        })
    }

    /// Returns true if the class code identifies a CXL memory device.
    pub fn is_cxl_memory_device(&self) -> bool {
        (self.base_class, self.sub_class, self.prog_if) == Self::CXL_MEMORY_DEVICE_CLASS
    }
}

#[cfg(target_os = "linux")]
pub use sysfs::SysfsConfigSpace;

#[cfg(target_os = "linux")]
mod sysfs {
    use super::ConfigSpace;
    use super::check_offset;
    use crate::PciAddress;
    use std::io;
    use std::os::unix::fs::FileExt;
    use std::path::Path;
    use std::path::PathBuf;

    /// Configuration space read through the sysfs `config` attribute of a
    /// PCI function.
    #[derive(Debug)]
    pub struct SysfsConfigSpace {
        file: fs_err::File,
        device_path: PathBuf,
    }

    impl SysfsConfigSpace {
        /// Opens the configuration space of `address` under `sysfs_root`,
        /// usually `/sys/bus/pci/devices`.
        pub fn open(sysfs_root: &Path, address: PciAddress) -> io::Result<Self> {
            let device_path = sysfs_root.join(address.to_string());
            let file = fs_err::File::open(device_path.join("config"))?;
            tracing::debug!(path = %device_path.display(), "opened config space");
            Ok(Self { file, device_path })
        }

        /// The sysfs directory of the device.
        pub fn device_path(&self) -> &Path {
            &self.device_path
        }
    }

    impl ConfigSpace for SysfsConfigSpace {
        fn read_u32(&self, offset: u16) -> io::Result<u32> {
            check_offset(offset, 4, 4)?;
            let mut n = [0; 4];
            self.file.file().read_exact_at(&mut n, offset.into())?;
            Ok(u32::from_le_bytes(n))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_dword_reads() {
        let mut cfg = ConfigSpaceBuffer::new();
        cfg.write_u32(0x100, 0x1501_0023);
        assert_eq!(cfg.read_u16(0x100).unwrap(), 0x0023);
        assert_eq!(cfg.read_u16(0x102).unwrap(), 0x1501);
        assert_eq!(cfg.read_u8(0x103).unwrap(), 0x15);
    }

    #[test]
    fn out_of_range_reads_fail() {
        let cfg = ConfigSpaceBuffer::new();
        assert!(cfg.read_u32(0xffc).is_ok());
        assert!(cfg.read_u32(0x1000).is_err());
        assert!(cfg.read_u32(0x102).is_err());
    }

    #[test]
    fn header_decode() {
        let mut cfg = ConfigSpaceBuffer::new();
        cfg.write_u32(0x00, 0x0d93_1e98);
        cfg.write_u32(0x04, 0x0010_0006);
        cfg.write_u32(0x08, 0x0502_1001);
        cfg.write_u32(0x0c, 0x0080_0000);
        cfg.write_u32(0x10, 0xfe00_000c);
        cfg.write_u32(0x14, 0x0000_0001);

        let header = ConfigHeader::read(&cfg).unwrap();
        assert_eq!(header.vendor_id, 0x1e98);
        assert_eq!(header.device_id, 0x0d93);
        assert!(header.command.mmio_enabled());
        assert!(header.command.bus_master());
        assert_eq!(header.status, 0x0010);
        assert_eq!(header.revision_id, 1);
        assert_eq!(header.header_type, 0);
        assert!(header.is_cxl_memory_device());
        assert_eq!(header.bars[..2], [0xfe00_000c, 1]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn sysfs_config_read() {
        let root = std::env::temp_dir().join(format!("cxl_device_sysfs_{}", std::process::id()));
        let address = crate::PciAddress::new(0, 0x3a, 0, 1);
        let dir = root.join(address.to_string());
        fs_err::create_dir_all(&dir).unwrap();
        let mut image = ConfigSpaceBuffer::new();
        image.write_u32(0x100, 0x0001_0023);
        fs_err::write(dir.join("config"), image.as_bytes()).unwrap();

        let cfg = SysfsConfigSpace::open(&root, address).unwrap();
        assert_eq!(cfg.device_path(), dir);
        assert_eq!(cfg.read_u32(0x100).unwrap(), 0x0001_0023);
        assert_eq!(cfg.read_u16(0x102).unwrap(), 0x0001);
        fs_err::remove_dir_all(&root).unwrap();
    }
}
