// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mappings of device register ranges into the process for volatile access.
//!
//! A [`MappedRegion`] is backed by the physical memory device (`/dev/mem`),
//! or by anonymous memory in tests. The mapping is unmapped when the region
//! is dropped.

#![cfg(target_os = "linux")]
// UNSAFETY: Manual pointer manipulation and dealing with mmap.
#![expect(unsafe_code)]

use fs_err::os::unix::fs::OpenOptionsExt;
use std::io;
use std::os::fd::AsRawFd;
use std::os::fd::RawFd;
use std::path::Path;
use std::ptr::NonNull;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// An error accessing or creating a mapping.
#[derive(Debug, Error)]
pub enum MappingError {
    /// The access falls outside the mapped range.
    #[error("out of bounds")]
    OutOfBounds,
    /// The access is not naturally aligned.
    #[error("unaligned access at offset {0:#x}")]
    Unaligned(usize),
    /// A zero-length mapping was requested.
    #[error("cannot map an empty range")]
    Empty,
    /// The backing file could not be opened.
    #[error("failed to open mapping source")]
    Open(#[source] io::Error),
    /// The `mmap` call failed.
    #[error("failed to map {len:#x} bytes at {offset:#x}")]
    Map {
        /// The requested offset in the backing file.
        offset: u64,
        /// The requested length.
        len: usize,
        /// The OS error.
        #[source]
        err: io::Error,
    },
}

/// Returns the system page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no safety requirements.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

/// A shared, read/write mapping of a device register range.
#[derive(Debug)]
pub struct MappedRegion {
    /// Page-aligned start of the OS mapping.
    base: NonNull<u8>,
    map_len: usize,
    /// Offset of the requested range within the OS mapping.
    delta: usize,
    len: usize,
}

// SAFETY: the region is plain memory (or device memory) with no thread
// affinity, and all accesses go through raw volatile reads and writes.
unsafe impl Send for MappedRegion {}
// SAFETY: as above; the region never hands out references into the mapping.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Maps `len` bytes of physical memory at `address` through the memory
    /// device at `mem_device`, typically `/dev/mem`.
    ///
    /// The device is opened with `O_SYNC` so the mapping is uncached.
    pub fn map_physical(mem_device: &Path, address: u64, len: usize) -> Result<Self, MappingError> {
        let file = fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(mem_device)
            .map_err(MappingError::Open)?;
        Self::map_fd(file.file().as_raw_fd(), address, len)
    }

    /// Creates a zero-filled private anonymous mapping.
    pub fn anonymous(len: usize) -> Result<Self, MappingError> {
        if len == 0 {
            return Err(MappingError::Empty);
        }
        let map_len = len.next_multiple_of(page_size());
        // SAFETY: requesting a fresh anonymous mapping; no existing memory is
        // affected.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        Self::from_mmap(ptr, map_len, 0, len, 0)
    }

    fn map_fd(fd: RawFd, offset: u64, len: usize) -> Result<Self, MappingError> {
        if len == 0 {
            return Err(MappingError::Empty);
        }
        let page_mask = page_size() as u64 - 1;
        let aligned = offset & !page_mask;
        let delta = (offset - aligned) as usize;
        let map_len = (delta + len).next_multiple_of(page_size());
        let file_offset = libc::off_t::try_from(aligned).map_err(|_| MappingError::Map {
            offset,
            len,
            err: io::ErrorKind::InvalidInput.into(),
        })?;
        // SAFETY: mapping a new range chosen by the kernel; the file
        // descriptor is valid for the duration of the call.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                file_offset,
            )
        };
        let region = Self::from_mmap(ptr, map_len, delta, len, offset)?;
        tracing::trace!(offset, len, map_len, "mapped region");
        Ok(region)
    }

    fn from_mmap(
        ptr: *mut libc::c_void,
        map_len: usize,
        delta: usize,
        len: usize,
        offset: u64,
    ) -> Result<Self, MappingError> {
        if ptr == libc::MAP_FAILED {
            return Err(MappingError::Map {
                offset,
                len,
                err: io::Error::last_os_error(),
            });
        }
        let base = NonNull::new(ptr.cast::<u8>()).ok_or(MappingError::Map {
            offset,
            len,
            err: io::ErrorKind::Other.into(),
        })?;
        Ok(Self {
            base,
            map_len,
            delta,
            len,
        })
    }

    /// The length of the requested range in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    fn as_ptr(&self) -> *mut u8 {
        // SAFETY: delta is within the OS mapping.
        unsafe { self.base.as_ptr().add(self.delta) }
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), MappingError> {
        if self.len < offset || self.len - offset < len {
            return Err(MappingError::OutOfBounds);
        }
        Ok(())
    }

    fn check_aligned<T>(&self, offset: usize) -> Result<(), MappingError> {
        if (self.as_ptr() as usize + offset) % align_of::<T>() != 0 {
            return Err(MappingError::Unaligned(offset));
        }
        Ok(())
    }

    /// Reads a `T` at `offset` with a single volatile load.
    pub fn read_volatile<T: FromBytes + Immutable + KnownLayout>(
        &self,
        offset: usize,
    ) -> Result<T, MappingError> {
        self.check(offset, size_of::<T>())?;
        self.check_aligned::<T>(offset)?;
        // SAFETY: the range is in bounds and aligned, the mapping is live
        // for the lifetime of self, and any bit pattern is a valid T.
        Ok(unsafe { std::ptr::read_volatile(self.as_ptr().add(offset).cast::<T>()) })
    }

    /// Writes a `T` at `offset` with a single volatile store.
    pub fn write_volatile<T: IntoBytes + Immutable + KnownLayout + Copy>(
        &self,
        offset: usize,
        value: &T,
    ) -> Result<(), MappingError> {
        self.check(offset, size_of::<T>())?;
        self.check_aligned::<T>(offset)?;
        // SAFETY: the range is in bounds and aligned and the mapping is live
        // for the lifetime of self.
        unsafe { std::ptr::write_volatile(self.as_ptr().add(offset).cast::<T>(), *value) };
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: base and map_len describe a mapping created by mmap and
        // owned exclusively by self.
        let r = unsafe { libc::munmap(self.base.as_ptr().cast(), self.map_len) };
        if r != 0 {
            tracing::warn!(
                error = &io::Error::last_os_error() as &dyn std::error::Error,
                "munmap failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_volatile_access() {
        let region = MappedRegion::anonymous(64).unwrap();
        assert_eq!(region.len(), 64);
        assert_eq!(region.read_volatile::<u64>(0).unwrap(), 0);
        region.write_volatile(8, &0x1122_3344_5566_7788u64).unwrap();
        assert_eq!(region.read_volatile::<u32>(8).unwrap(), 0x5566_7788);
        assert_eq!(region.read_volatile::<u32>(12).unwrap(), 0x1122_3344);
        region.write_volatile(60, &0xaau8).unwrap();
        assert_eq!(region.read_volatile::<u32>(60).unwrap(), 0xaa);
    }

    #[test]
    fn out_of_bounds_and_unaligned() {
        let region = MappedRegion::anonymous(16).unwrap();
        assert!(matches!(
            region.read_volatile::<u64>(12),
            Err(MappingError::OutOfBounds)
        ));
        assert!(matches!(
            region.write_volatile(16, &0u8),
            Err(MappingError::OutOfBounds)
        ));
        assert!(matches!(
            region.read_volatile::<u32>(2),
            Err(MappingError::Unaligned(2))
        ));
        assert!(matches!(
            MappedRegion::anonymous(0),
            Err(MappingError::Empty)
        ));
    }

    #[test]
    fn physical_mapping_at_unaligned_address() {
        // A regular file stands in for the memory device.
        let path = std::env::temp_dir().join(format!("mmio_mapping_{}", std::process::id()));
        let mut contents = vec![0u8; 8192];
        contents[4100..4104].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        fs_err::write(&path, &contents).unwrap();

        let region = MappedRegion::map_physical(&path, 4100, 16).unwrap();
        assert_eq!(region.len(), 16);
        assert_eq!(region.read_volatile::<u32>(0).unwrap(), 0xdead_beef);
        region.write_volatile(4, &7u32).unwrap();
        drop(region);

        let contents = fs_err::read(&path).unwrap();
        assert_eq!(contents[4104..4108], 7u32.to_le_bytes());
        fs_err::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_mem_device() {
        assert!(matches!(
            MappedRegion::map_physical(Path::new("/nonexistent/mem"), 0, 16),
            Err(MappingError::Open(_))
        ));
    }
}
