// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Construction of emulated configuration spaces.

use cxl_device::config_space::ConfigSpaceBuffer;
use cxl_spec::caps::ExtendedCapabilityHeader;
use cxl_spec::caps::ExtendedCapabilityId;
use cxl_spec::caps::dvsec;
use cxl_spec::caps::dvsec::CxlDvsecId;
use cxl_spec::caps::dvsec::DvsecHeader1;
use cxl_spec::caps::register_locator::RegisterLocatorEntry;
use cxl_spec::cfg_space;
use cxl_spec::cfg_space::BarEncodingBits;
use cxl_spec::cfg_space::Command;
use cxl_spec::cfg_space::header_type_00;

struct ExtendedCapability {
    offset: u16,
    id: ExtendedCapabilityId,
    body: Vec<u32>,
}

/// Builds a [`ConfigSpaceBuffer`] with a type 00h header, BARs, and a chain
/// of extended capabilities.
///
/// Capabilities are linked in the order they are added, whatever their
/// offsets. Raw writes are applied last and can be used to corrupt the
/// result.
pub struct ConfigSpaceBuilder {
    vendor_id: u16,
    device_id: u16,
    class: (u8, u8, u8),
    bars: [u32; cfg_space::BAR_COUNT as usize],
    caps: Vec<ExtendedCapability>,
    raw: Vec<(u16, u32)>,
}

impl ConfigSpaceBuilder {
    /// Creates a builder for a CXL memory device with no BARs or
    /// capabilities.
    pub fn new() -> Self {
        Self {
            vendor_id: dvsec::CXL_VENDOR_ID,
            device_id: 0x0d93,
            class: (0x05, 0x02, 0x10),
            bars: [0; cfg_space::BAR_COUNT as usize],
            caps: Vec::new(),
            raw: Vec::new(),
        }
    }

    /// Sets the vendor and device IDs.
    pub fn ids(mut self, vendor_id: u16, device_id: u16) -> Self {
        self.vendor_id = vendor_id;
        self.device_id = device_id;
        self
    }

    /// Sets a 32-bit memory BAR.
    pub fn bar32(mut self, index: u8, address: u32) -> Self {
        self.bars[index as usize] = address & cfg_space::BAR_MEMORY_ADDRESS_MASK;
        self
    }

    /// Sets a 64-bit prefetchable memory BAR, consuming `index + 1` as well.
    pub fn bar64(mut self, index: u8, address: u64) -> Self {
        let bits = BarEncodingBits::new()
            .with_type_64_bit(true)
            .with_prefetchable(true);
        self.bars[index as usize] =
            (address as u32 & cfg_space::BAR_MEMORY_ADDRESS_MASK) | bits.into_bits();
        self.bars[index as usize + 1] = (address >> 32) as u32;
        self
    }

    /// Adds an extended capability whose header is followed by `body`.
    pub fn extended_capability(
        mut self,
        offset: u16,
        id: ExtendedCapabilityId,
        body: &[u32],
    ) -> Self {
        self.caps.push(ExtendedCapability {
            offset,
            id,
            body: body.to_vec(),
        });
        self
    }

    /// Adds a DVSEC. `body` follows DVSEC Header 2; the DVSEC length is
    /// computed from it.
    pub fn dvsec(self, offset: u16, vendor_id: u16, dvsec_id: u16, body: &[u32]) -> Self {
        let length = 0xc + 4 * body.len() as u16;
        let mut full = vec![
            DvsecHeader1::new()
                .with_vendor_id(vendor_id)
                .with_revision(0)
                .with_length(length)
                .into_bits(),
            dvsec_id as u32,
        ];
        full.extend_from_slice(body);
        self.extended_capability(offset, ExtendedCapabilityId::DVSEC, &full)
    }

    /// Adds a CXL Register Locator DVSEC with `entries`.
    pub fn register_locator(self, offset: u16, entries: &[RegisterLocatorEntry]) -> Self {
        let body = entries
            .iter()
            .flat_map(|entry| {
                let (low, high) = entry.to_dwords();
                [low, high]
            })
            .collect::<Vec<_>>();
        self.dvsec(
            offset,
            dvsec::CXL_VENDOR_ID,
            CxlDvsecId::REGISTER_LOCATOR.0,
            &body,
        )
    }

    /// Writes `value` at `offset` after everything else is laid out.
    pub fn raw_u32(mut self, offset: u16, value: u32) -> Self {
        self.raw.push((offset, value));
        self
    }

    /// Lays out the configuration space.
    pub fn build(self) -> anyhow::Result<ConfigSpaceBuffer> {
        let mut cfg = ConfigSpaceBuffer::new();
        cfg.write_u32(
            header_type_00::DEVICE_VENDOR,
            self.vendor_id as u32 | (self.device_id as u32) << 16,
        );
        cfg.write_u32(
            header_type_00::STATUS_COMMAND,
            Command::new()
                .with_mmio_enabled(true)
                .with_bus_master(true)
                .into_bits() as u32,
        );
        let (base, sub, prog_if) = self.class;
        cfg.write_u32(
            header_type_00::CLASS_REVISION,
            (base as u32) << 24 | (sub as u32) << 16 | (prog_if as u32) << 8 | 1,
        );
        for (i, bar) in (0..).zip(self.bars) {
            cfg.write_u32(cfg_space::bar_offset(i), bar);
        }

        for (i, cap) in self.caps.iter().enumerate() {
            anyhow::ensure!(
                cap.offset >= cfg_space::EXTENDED_CAPABILITIES_START && cap.offset % 4 == 0,
                "bad extended capability offset {:#x}",
                cap.offset
            );
            let end = cap.offset as usize + 4 * (cap.body.len() + 1);
            anyhow::ensure!(
                end <= cfg_space::EXTENDED_CONFIG_SPACE_SIZE as usize,
                "capability at {:#x} extends past config space",
                cap.offset
            );
            let next = self.caps.get(i + 1).map_or(0, |cap| cap.offset);
            cfg.write_u32(
                cap.offset,
                ExtendedCapabilityHeader::new()
                    .with_capability_id(cap.id)
                    .with_version(1)
                    .with_next_offset(next)
                    .into_bits(),
            );
            for (j, &dword) in (1..).zip(&cap.body) {
                cfg.write_u32(cap.offset + 4 * j, dword);
            }
        }

        for (offset, value) in self.raw {
            anyhow::ensure!(
                offset as usize + 4 <= cfg_space::EXTENDED_CONFIG_SPACE_SIZE as usize,
                "raw write at {offset:#x} out of range"
            );
            cfg.write_u32(offset, value);
        }
        Ok(cfg)
    }
}
