// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Extended capability list traversal to the CXL Register Locator DVSEC.

use crate::ConfigSpace;
use crate::DiscoveryError;
use crate::config_space::read_u16;
use crate::config_space::read_u32;
use cxl_spec::caps::ExtendedCapabilityHeader;
use cxl_spec::caps::ExtendedCapabilityId;
use cxl_spec::caps::dvsec;
use cxl_spec::caps::dvsec::CxlDvsecId;
use cxl_spec::caps::dvsec::DvsecHeader1;
use cxl_spec::caps::register_locator;
use cxl_spec::caps::register_locator::RegisterBlockIdentifier;
use cxl_spec::caps::register_locator::RegisterLocatorEntry;
use cxl_spec::cfg_space;

/// Upper bound on the number of extended capabilities: one per dword of the
/// extended configuration space.
const MAX_EXTENDED_CAPABILITIES: usize = (cfg_space::EXTENDED_CONFIG_SPACE_SIZE
    - cfg_space::EXTENDED_CAPABILITIES_START) as usize
    / 4;

/// Returns the configuration space offset of the CXL Register Locator DVSEC.
pub fn find_register_locator(cfg: &dyn ConfigSpace) -> Result<u16, DiscoveryError> {
    let mut offset = cfg_space::EXTENDED_CAPABILITIES_START;
    for _ in 0..MAX_EXTENDED_CAPABILITIES {
        let raw = read_u32(cfg, offset)?;
        // An empty or absent extended capability list reads as all zeroes
        // or all ones.
        if raw == 0 || raw == !0 {
            return Err(DiscoveryError::CapabilityNotFound);
        }
        let header = ExtendedCapabilityHeader::from(raw);
        tracing::trace!(
            offset,
            id = header.capability_id().0,
            next = header.next_offset(),
            "extended capability"
        );

        if header.capability_id() == ExtendedCapabilityId::DVSEC {
            if offset > cfg_space::EXTENDED_CONFIG_SPACE_SIZE - register_locator::ENTRIES_OFFSET {
                return Err(DiscoveryError::MalformedCapabilityList { offset });
            }
            let header1 = DvsecHeader1::from(read_u32(cfg, offset + dvsec::HEADER1)?);
            let dvsec_id = CxlDvsecId(read_u16(cfg, offset + dvsec::HEADER2)?);
            if header1.vendor_id() == dvsec::CXL_VENDOR_ID
                && dvsec_id == CxlDvsecId::REGISTER_LOCATOR
            {
                tracing::debug!(offset, "found register locator");
                return Ok(offset);
            }
        }

        let next = header.next_offset();
        if next == 0 {
            return Err(DiscoveryError::CapabilityNotFound);
        }
        if next < cfg_space::EXTENDED_CAPABILITIES_START || next % 4 != 0 {
            return Err(DiscoveryError::MalformedCapabilityList { offset: next });
        }
        offset = next;
    }
    Err(DiscoveryError::MalformedCapabilityList { offset })
}

/// Reads the register block entries of the Register Locator DVSEC at
/// `offset`.
///
/// The DVSEC length bounds the number of entries; at most
/// [`register_locator::MAX_ENTRIES`] are returned.
pub fn register_locator_entries(
    cfg: &dyn ConfigSpace,
    offset: u16,
) -> Result<Vec<RegisterLocatorEntry>, DiscoveryError> {
    let header1 = DvsecHeader1::from(read_u32(cfg, offset + dvsec::HEADER1)?);
    let count = (header1.length().saturating_sub(register_locator::ENTRIES_OFFSET)
        / register_locator::ENTRY_SIZE) as usize;
    let count = count.min(register_locator::MAX_ENTRIES);

    let mut entries = Vec::with_capacity(count);
    for i in 0..count as u16 {
        let entry_offset =
            offset + register_locator::ENTRIES_OFFSET + i * register_locator::ENTRY_SIZE;
        if entry_offset > cfg_space::EXTENDED_CONFIG_SPACE_SIZE - register_locator::ENTRY_SIZE {
            return Err(DiscoveryError::MalformedCapabilityList {
                offset: entry_offset,
            });
        }
        let low = read_u32(cfg, entry_offset)?;
        let high = read_u32(cfg, entry_offset + 4)?;
        let entry = RegisterLocatorEntry::from_dwords(low, high);
        tracing::trace!(
            index = i,
            bar = entry.bar,
            block = entry.block_identifier.0,
            offset = entry.offset,
            "register locator entry"
        );
        entries.push(entry);
    }
    Ok(entries)
}

/// Finds the memory device register block, which contains the mailbox.
pub fn find_mailbox_block(cfg: &dyn ConfigSpace) -> Result<RegisterLocatorEntry, DiscoveryError> {
    let offset = find_register_locator(cfg)?;
    register_locator_entries(cfg, offset)?
        .into_iter()
        .find(|entry| entry.block_identifier == RegisterBlockIdentifier::MEMORY_DEVICE)
        .ok_or(DiscoveryError::RegisterBlockNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_space::ConfigSpaceBuffer;

    fn ext_cap(cfg: &mut ConfigSpaceBuffer, offset: u16, id: ExtendedCapabilityId, next: u16) {
        cfg.write_u32(
            offset,
            ExtendedCapabilityHeader::new()
                .with_capability_id(id)
                .with_version(1)
                .with_next_offset(next)
                .into(),
        );
    }

    fn register_locator(
        cfg: &mut ConfigSpaceBuffer,
        offset: u16,
        next: u16,
        entries: &[RegisterLocatorEntry],
    ) {
        ext_cap(cfg, offset, ExtendedCapabilityId::DVSEC, next);
        let len = register_locator::ENTRIES_OFFSET + entries.len() as u16 * 8;
        cfg.write_u32(
            offset + 4,
            DvsecHeader1::new()
                .with_vendor_id(dvsec::CXL_VENDOR_ID)
                .with_length(len)
                .into(),
        );
        cfg.write_u16(offset + 8, CxlDvsecId::REGISTER_LOCATOR.0);
        for (i, entry) in entries.iter().enumerate() {
            let (low, high) = entry.to_dwords();
            let o = offset + 0xc + i as u16 * 8;
            cfg.write_u32(o, low);
            cfg.write_u32(o + 4, high);
        }
    }

    fn entry(bar: u8, id: RegisterBlockIdentifier, offset: u64) -> RegisterLocatorEntry {
        RegisterLocatorEntry {
            bar,
            block_identifier: id,
            offset,
        }
    }

    #[test]
    fn finds_locator_after_other_capabilities() {
        let mut cfg = ConfigSpaceBuffer::new();
        ext_cap(&mut cfg, 0x100, ExtendedCapabilityId::AER, 0x148);
        // A DVSEC from another vendor.
        ext_cap(&mut cfg, 0x148, ExtendedCapabilityId::DVSEC, 0x200);
        cfg.write_u32(0x14c, DvsecHeader1::new().with_vendor_id(0x8086).into());
        cfg.write_u16(0x150, CxlDvsecId::REGISTER_LOCATOR.0);
        // A CXL DVSEC with a different ID.
        ext_cap(&mut cfg, 0x200, ExtendedCapabilityId::DVSEC, 0x300);
        cfg.write_u32(
            0x204,
            DvsecHeader1::new()
                .with_vendor_id(dvsec::CXL_VENDOR_ID)
                .into(),
        );
        cfg.write_u16(0x208, CxlDvsecId::CXL_DEVICE.0);
        register_locator(&mut cfg, 0x300, 0, &[]);

        assert_eq!(find_register_locator(&cfg).unwrap(), 0x300);
    }

    #[test]
    fn mailbox_entry_selected_iff_present() {
        let others = [
            entry(0, RegisterBlockIdentifier::COMPONENT, 0),
            entry(2, RegisterBlockIdentifier::CPMU, 0x2_0000),
            entry(0, RegisterBlockIdentifier::EMPTY, 0),
            entry(4, RegisterBlockIdentifier::BAR_VIRTUALIZATION_ACL, 0x1_0000),
        ];
        let mailbox = entry(2, RegisterBlockIdentifier::MEMORY_DEVICE, 0x1_0001_0000);

        for n in 0..=4 {
            for position in 0..=n {
                let mut entries = others[..n].to_vec();
                let expect_found = position < n;
                if expect_found {
                    entries[position] = mailbox;
                }
                let mut cfg = ConfigSpaceBuffer::new();
                register_locator(&mut cfg, 0x100, 0, &entries);
                match find_mailbox_block(&cfg) {
                    Ok(found) => {
                        assert!(expect_found, "n={n} position={position}");
                        assert_eq!(found, mailbox);
                    }
                    Err(DiscoveryError::RegisterBlockNotFound) => {
                        assert!(!expect_found, "n={n} position={position}")
                    }
                    Err(err) => panic!("unexpected error {err}"),
                }
            }
        }
    }

    #[test]
    fn entries_bounded_by_length_and_cap() {
        let entries = [entry(1, RegisterBlockIdentifier::COMPONENT, 0); 6];
        let mut cfg = ConfigSpaceBuffer::new();
        register_locator(&mut cfg, 0x100, 0, &entries);
        assert_eq!(register_locator_entries(&cfg, 0x100).unwrap().len(), 4);

        // Length too short for even one entry.
        cfg.write_u32(
            0x104,
            DvsecHeader1::new()
                .with_vendor_id(dvsec::CXL_VENDOR_ID)
                .with_length(0x10)
                .into(),
        );
        assert!(register_locator_entries(&cfg, 0x100).unwrap().is_empty());
    }

    #[test]
    fn missing_capability() {
        let cfg = ConfigSpaceBuffer::new();
        assert!(matches!(
            find_register_locator(&cfg),
            Err(DiscoveryError::CapabilityNotFound)
        ));

        let mut cfg = ConfigSpaceBuffer::new();
        ext_cap(&mut cfg, 0x100, ExtendedCapabilityId::AER, 0x140);
        ext_cap(&mut cfg, 0x140, ExtendedCapabilityId::DOE, 0);
        assert!(matches!(
            find_register_locator(&cfg),
            Err(DiscoveryError::CapabilityNotFound)
        ));
        assert!(matches!(
            find_mailbox_block(&cfg),
            Err(DiscoveryError::CapabilityNotFound)
        ));
    }

    #[test]
    fn cyclic_list_terminates() {
        let mut cfg = ConfigSpaceBuffer::new();
        ext_cap(&mut cfg, 0x100, ExtendedCapabilityId::AER, 0x140);
        ext_cap(&mut cfg, 0x140, ExtendedCapabilityId::DOE, 0x100);
        assert!(matches!(
            find_register_locator(&cfg),
            Err(DiscoveryError::MalformedCapabilityList { .. })
        ));

        let mut cfg = ConfigSpaceBuffer::new();
        ext_cap(&mut cfg, 0x100, ExtendedCapabilityId::AER, 0x100);
        assert!(matches!(
            find_register_locator(&cfg),
            Err(DiscoveryError::MalformedCapabilityList { .. })
        ));
    }

    #[test]
    fn bad_next_pointer() {
        let mut cfg = ConfigSpaceBuffer::new();
        ext_cap(&mut cfg, 0x100, ExtendedCapabilityId::AER, 0x40);
        assert!(matches!(
            find_register_locator(&cfg),
            Err(DiscoveryError::MalformedCapabilityList { offset: 0x40 })
        ));

        let mut cfg = ConfigSpaceBuffer::new();
        ext_cap(&mut cfg, 0x100, ExtendedCapabilityId::AER, 0x142);
        assert!(matches!(
            find_register_locator(&cfg),
            Err(DiscoveryError::MalformedCapabilityList { offset: 0x142 })
        ));
    }
}
