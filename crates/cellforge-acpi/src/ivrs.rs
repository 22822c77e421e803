use tracing::warn;

use cellforge_pci::{CapId, PciDevice};
use cellforge_sysinfo::{MemRegion, SysfsRoot};

use crate::bytes::TableReader;
use crate::error::{AcpiError, Result};
use crate::iommu::{AmdIommuInfo, IommuKind, IommuUnit, MAX_IOMMU_UNITS};
use crate::madt::IoApic;

const IVRS_PATH: &str = "/sys/firmware/acpi/tables/IVRS";
const IVRS_BLOCKS_OFFSET: usize = 48;
const IVRS_MAX_REVISION: u8 = 2;

// I/O virtualization block types.
const IVHD_TYPE_10: u8 = 0x10;
const IVHD_TYPE_11: u8 = 0x11;
const IVMD_TYPE_ALL: u8 = 0x20;
const IVMD_TYPE_SELECT: u8 = 0x21;
const IVMD_TYPE_RANGE: u8 = 0x22;
const IVHD_TYPE_40: u8 = 0x40;

// IVHD device entry types.
const ENTRY_ALL: u8 = 0x01;
const ENTRY_SELECT: u8 = 0x02;
const ENTRY_RANGE_START: u8 = 0x03;
const ENTRY_RANGE_END: u8 = 0x04;
const ENTRY_ALIAS_SELECT: u8 = 0x42;
const ENTRY_ALIAS_RANGE_START: u8 = 0x43;
const ENTRY_SPECIAL: u8 = 0x48;

const SPECIAL_VARIETY_IOAPIC: u8 = 0x01;

/// Devices permitted outside IOMMU scope: the root complex.
const IOMMU_SKIPLIST: &[u16] = &[0x0];

fn format_bdf(bdf: u16) -> String {
    format!(
        "{:02x}:{:02x}.{:x}",
        (bdf >> 8) & 0xff,
        (bdf >> 3) & 0x1f,
        bdf & 0x7
    )
}

/// Parse the AMD IVRS table: a single IVHD hardware-definition block yields
/// the IOMMU unit and its device assignments; IVMD blocks yield reserved
/// memory regions.
///
/// The IOMMU's own PCI function is removed from the device list (it must
/// never be granted to a cell).
pub fn parse_ivrs(
    root: &SysfsRoot,
    devices: &mut Vec<PciDevice>,
    ioapics: &mut [IoApic],
) -> Result<(Vec<IommuUnit>, Vec<MemRegion>)> {
    let data = root.read_bytes(IVRS_PATH)?;
    parse_ivrs_bytes(&data, devices, ioapics)
}

fn parse_ivrs_bytes(
    data: &[u8],
    devices: &mut Vec<PciDevice>,
    ioapics: &mut [IoApic],
) -> Result<(Vec<IommuUnit>, Vec<MemRegion>)> {
    let r = TableReader::new("IVRS", data);
    let length = r.header(b"IVRS")?;

    let revision = r.u8(8)?;
    if revision > IVRS_MAX_REVISION {
        return Err(AcpiError::UnsupportedRevision {
            table: r.table(),
            revision,
        });
    }

    let mut units: Vec<IommuUnit> = Vec::new();
    let mut regions: Vec<MemRegion> = Vec::new();
    let mut ivhd_blocks = 0;

    let mut offset = IVRS_BLOCKS_OFFSET;
    while offset < length {
        let block_type = r.u8(offset)?;
        let block_length = r.u16(offset + 2)? as usize;
        if block_length < 4 {
            return Err(AcpiError::MalformedStructure {
                table: r.table(),
                offset,
            });
        }

        match block_type {
            IVHD_TYPE_10 | IVHD_TYPE_11 => {
                ivhd_blocks += 1;
                if ivhd_blocks > 1 {
                    return Err(AcpiError::MultipleAmdIommus);
                }

                let iommu_bdf = r.u16(offset + 4)?;
                let base_cap = r.u16(offset + 6)?;
                let base = r.u64(offset + 8)?;
                let segment = r.u16(offset + 16)?;
                let features = r.u32(offset + 20)?;

                if segment != 0 {
                    return Err(AcpiError::MultiplePciSegments);
                }
                if units.len() >= MAX_IOMMU_UNITS {
                    return Err(AcpiError::TooManyIommuUnits(MAX_IOMMU_UNITS));
                }

                // The IOMMU is driven through its MSI capability; find it on
                // the owning function and withhold that function from cells.
                let mut msi_cap = None;
                if let Some(i) = devices.iter().position(|d| d.bdf() == iommu_bdf) {
                    for c in &devices[i].caps {
                        if !c.extended && c.id == CapId::Msi.raw() as u16 {
                            msi_cap = Some(c.offset);
                        }
                    }
                    devices.remove(i);
                }
                let Some(msi_cap) = msi_cap else {
                    return Err(AcpiError::AmdIommuWithoutMsi);
                };

                // With performance counters present the unit decodes a
                // 512 KiB window, 16 KiB otherwise.
                let mmio_size = if features & (0xf << 13) != 0 && features & (0x3f << 17) != 0 {
                    0x8_0000
                } else {
                    0x4000
                };

                units.push(IommuUnit {
                    kind: IommuKind::Amd,
                    base,
                    mmio_size,
                    amd: Some(AmdIommuInfo {
                        bdf: iommu_bdf,
                        base_cap,
                        msi_cap,
                        // Type 0x11 blocks carry an exact EFR copy in
                        // hardware registers; type 0x10 may override what
                        // hardware reports. Reserved bit 0 marks the value
                        // as in use.
                        features: if block_type == IVHD_TYPE_10 {
                            features | 0x1
                        } else {
                            0
                        },
                    }),
                });
                let unit = (units.len() - 1) as u8;

                let mut bdf_start_range = None;
                let mut entry_offset = offset + 24;
                while entry_offset < offset + block_length {
                    let entry_type = r.u8(entry_offset)?;
                    let device_id = r.u16(entry_offset + 1)?;
                    let mut entry_len = 4;

                    match entry_type {
                        ENTRY_ALL => {
                            for d in devices.iter_mut() {
                                d.iommu = Some(unit);
                            }
                        }
                        ENTRY_SELECT => {
                            for d in devices.iter_mut() {
                                if d.bdf() == device_id {
                                    d.iommu = Some(unit);
                                }
                            }
                        }
                        ENTRY_RANGE_START => {
                            bdf_start_range = Some(device_id);
                        }
                        ENTRY_RANGE_END => {
                            if let Some(start) = bdf_start_range.take() {
                                for d in devices.iter_mut() {
                                    if d.bdf() >= start && d.bdf() <= device_id {
                                        d.iommu = Some(unit);
                                    }
                                }
                            }
                        }
                        ENTRY_ALIAS_SELECT => {
                            let source_id = r.u16(entry_offset + 5)?;
                            entry_len = 8;
                            for d in devices.iter_mut() {
                                if d.bdf() == source_id {
                                    d.iommu = Some(unit);
                                }
                            }
                        }
                        ENTRY_ALIAS_RANGE_START => {
                            let source_id = r.u16(entry_offset + 5)?;
                            entry_len = 8;
                            bdf_start_range = Some(source_id);
                        }
                        ENTRY_SPECIAL => {
                            let handle = r.u8(entry_offset + 4)?;
                            let special_id = r.u16(entry_offset + 5)?;
                            let variety = r.u8(entry_offset + 7)?;
                            entry_len = 8;
                            if variety == SPECIAL_VARIETY_IOAPIC {
                                for chip in ioapics.iter_mut() {
                                    if chip.id == handle {
                                        chip.bdf = special_id;
                                        chip.iommu = Some(unit);
                                    }
                                }
                            }
                        }
                        _ => {
                            // Reserved or ignored entries; 8-byte forms carry
                            // a second dword.
                            if entry_type >= 0x40 {
                                entry_len = 8;
                            }
                        }
                    }

                    entry_offset += entry_len;
                }
            }
            IVMD_TYPE_ALL | IVMD_TYPE_SELECT | IVMD_TYPE_RANGE => {
                let flags = r.u8(offset + 1)?;
                let device_id = r.u16(offset + 4)?;
                let aux_data = r.u16(offset + 6)?;
                let mem_addr = r.u64(offset + 16)?;
                let mem_len = r.u64(offset + 24)?;

                if flags != 0 {
                    warn!(
                        "configurable (e.g. read-only) device memory is not supported; \
                         device {} may not work properly",
                        format_bdf(device_id)
                    );
                }

                let comment = match block_type {
                    IVMD_TYPE_SELECT => Some(format!("PCI Device: {}", format_bdf(device_id))),
                    IVMD_TYPE_RANGE => Some(format!(
                        "PCI Device: {} - {}",
                        format_bdf(device_id),
                        format_bdf(aux_data)
                    )),
                    _ => None,
                };

                if comment.is_some() {
                    warn!(
                        "per-device memory regions are not supported; the memory at \
                         {mem_addr:#x} will be mapped accessible to all devices"
                    );
                }

                regions.push(MemRegion::with_comments(
                    mem_addr,
                    mem_addr + mem_len - 1,
                    "ACPI IVRS",
                    comment.into_iter().collect(),
                ));
            }
            IVHD_TYPE_40 => {
                return Err(AcpiError::UnsupportedIvrsRev2Feature);
            }
            other => {
                warn!("skipping unknown IVRS block type {other:#04x}");
            }
        }

        offset += block_length;
    }

    for d in devices.iter() {
        if !IOMMU_SKIPLIST.contains(&d.bdf()) && d.iommu.is_none() {
            return Err(AcpiError::DeviceOutsideIommu {
                bus: d.bus,
                device: d.device,
                function: d.function,
            });
        }
    }

    Ok((units, regions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellforge_pci::{AccessPolicy, PciCapability, PciDeviceKind};

    fn device(bus: u8, dev: u8, func: u8) -> PciDevice {
        PciDevice {
            kind: PciDeviceKind::Endpoint,
            domain: 0,
            bus,
            device: dev,
            function: func,
            bar_mask: [0; 6],
            caps: Vec::new(),
            iommu: None,
            num_msi_vectors: 0,
            msi_64bit: false,
            msi_maskable: false,
            num_msix_vectors: 0,
            msix_region_size: 0,
            msix_address: 0,
            secondary_bus: 0,
            subordinate_bus: 0,
            path: format!("/sys/bus/pci/devices/0000:{bus:02x}:{dev:02x}.{func:x}"),
        }
    }

    fn iommu_device(bus: u8, dev: u8, func: u8, msi_offset: u16) -> PciDevice {
        let mut d = device(bus, dev, func);
        d.caps.push(PciCapability {
            id: CapId::Msi.raw() as u16,
            extended: false,
            offset: msi_offset,
            len: 10,
            access: AccessPolicy::Moderated,
            content: vec![0; 8],
            msix_address: 0,
            comments: Vec::new(),
        });
        d
    }

    fn ioapic(id: u8) -> IoApic {
        IoApic {
            id,
            address: 0xfec0_0000,
            gsi_base: 0,
            iommu: None,
            bdf: 0,
        }
    }

    struct IvrsBuilder {
        data: Vec<u8>,
    }

    impl IvrsBuilder {
        fn new(revision: u8) -> Self {
            let mut data = vec![0u8; IVRS_BLOCKS_OFFSET];
            data[0..4].copy_from_slice(b"IVRS");
            data[8] = revision;
            Self { data }
        }

        fn ivhd(
            mut self,
            block_type: u8,
            iommu_bdf: u16,
            base: u64,
            features: u32,
            entries: &[u8],
        ) -> Self {
            let len = (24 + entries.len()) as u16;
            self.data.push(block_type);
            self.data.push(0); // flags
            self.data.extend_from_slice(&len.to_le_bytes());
            self.data.extend_from_slice(&iommu_bdf.to_le_bytes());
            self.data.extend_from_slice(&0x64u16.to_le_bytes()); // capability offset
            self.data.extend_from_slice(&base.to_le_bytes());
            self.data.extend_from_slice(&0u16.to_le_bytes()); // segment
            self.data.extend_from_slice(&0u16.to_le_bytes()); // info
            self.data.extend_from_slice(&features.to_le_bytes());
            self.data.extend_from_slice(entries);
            self
        }

        fn ivmd(
            mut self,
            block_type: u8,
            flags: u8,
            device_id: u16,
            aux_data: u16,
            addr: u64,
            len: u64,
        ) -> Self {
            self.data.push(block_type);
            self.data.push(flags);
            self.data.extend_from_slice(&32u16.to_le_bytes());
            self.data.extend_from_slice(&device_id.to_le_bytes());
            self.data.extend_from_slice(&aux_data.to_le_bytes());
            self.data.extend_from_slice(&[0u8; 8]);
            self.data.extend_from_slice(&addr.to_le_bytes());
            self.data.extend_from_slice(&len.to_le_bytes());
            self
        }

        fn raw_block(mut self, block_type: u8, length: u16) -> Self {
            let start = self.data.len();
            self.data.push(block_type);
            self.data.push(0);
            self.data.extend_from_slice(&length.to_le_bytes());
            self.data.resize(start + length as usize, 0);
            self
        }

        fn build(mut self) -> Vec<u8> {
            let len = self.data.len() as u32;
            self.data[4..8].copy_from_slice(&len.to_le_bytes());
            self.data
        }
    }

    fn entry(entry_type: u8, device_id: u16) -> Vec<u8> {
        let mut e = vec![entry_type];
        e.extend_from_slice(&device_id.to_le_bytes());
        e.push(0);
        e
    }

    fn entry8(entry_type: u8, device_id: u16, b4: u8, id2: u16, b7: u8) -> Vec<u8> {
        let mut e = entry(entry_type, device_id);
        e.push(b4);
        e.extend_from_slice(&id2.to_le_bytes());
        e.push(b7);
        e
    }

    #[test]
    fn ivhd_block_yields_amd_unit() {
        let table = IvrsBuilder::new(1)
            .ivhd(IVHD_TYPE_10, 0x0010, 0xfd20_0000, 0xdeadbeef, &entry(ENTRY_ALL, 0))
            .build();
        let mut devices = vec![iommu_device(0, 2, 0, 0x64), device(0, 3, 0)];

        let (units, regions) = parse_ivrs_bytes(&table, &mut devices, &mut []).unwrap();
        assert!(regions.is_empty());
        assert_eq!(units.len(), 1);
        let unit = &units[0];
        assert_eq!(unit.kind, IommuKind::Amd);
        assert_eq!(unit.base, 0xfd20_0000);
        let amd = unit.amd.as_ref().unwrap();
        assert_eq!(amd.bdf, 0x0010);
        assert_eq!(amd.base_cap, 0x64);
        assert_eq!(amd.msi_cap, 0x64);
        // type 0x10 blocks snapshot the (possibly overridden) feature word
        assert_eq!(amd.features, 0xdeadbeef | 1);

        // the IOMMU's own function was withheld from the grantable set
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].iommu, Some(0));
    }

    #[test]
    fn type_11_block_leaves_features_to_hardware() {
        let table = IvrsBuilder::new(2)
            .ivhd(IVHD_TYPE_11, 0x0010, 0xfd20_0000, 0xdeadbeef, &entry(ENTRY_ALL, 0))
            .build();
        let mut devices = vec![iommu_device(0, 2, 0, 0x40)];
        let (units, _) = parse_ivrs_bytes(&table, &mut devices, &mut []).unwrap();
        assert_eq!(units[0].amd.as_ref().unwrap().features, 0);
    }

    #[test]
    fn performance_counters_select_large_window() {
        let features = (0xf << 13) | (0x3f << 17);
        let table = IvrsBuilder::new(1)
            .ivhd(IVHD_TYPE_10, 0x0010, 0xfd20_0000, features, &entry(ENTRY_ALL, 0))
            .build();
        let mut devices = vec![iommu_device(0, 2, 0, 0x64)];
        let (units, _) = parse_ivrs_bytes(&table, &mut devices, &mut []).unwrap();
        assert_eq!(units[0].mmio_size, 0x8_0000);

        let table = IvrsBuilder::new(1)
            .ivhd(IVHD_TYPE_10, 0x0010, 0xfd20_0000, 0xf << 13, &entry(ENTRY_ALL, 0))
            .build();
        let mut devices = vec![iommu_device(0, 2, 0, 0x64)];
        let (units, _) = parse_ivrs_bytes(&table, &mut devices, &mut []).unwrap();
        assert_eq!(units[0].mmio_size, 0x4000);
    }

    #[test]
    fn second_ivhd_block_is_fatal() {
        let table = IvrsBuilder::new(1)
            .ivhd(IVHD_TYPE_10, 0x0010, 0xfd20_0000, 0, &entry(ENTRY_ALL, 0))
            .ivhd(IVHD_TYPE_11, 0x0011, 0xfd30_0000, 0, &[])
            .build();
        let mut devices = vec![iommu_device(0, 2, 0, 0x64)];
        let err = parse_ivrs_bytes(&table, &mut devices, &mut []).unwrap_err();
        assert!(matches!(err, AcpiError::MultipleAmdIommus));
    }

    #[test]
    fn iommu_without_msi_is_fatal() {
        let table = IvrsBuilder::new(1)
            .ivhd(IVHD_TYPE_10, 0x0010, 0xfd20_0000, 0, &entry(ENTRY_ALL, 0))
            .build();
        // the owning function exists but has no MSI capability
        let mut devices = vec![device(0, 2, 0)];
        let err = parse_ivrs_bytes(&table, &mut devices, &mut []).unwrap_err();
        assert!(matches!(err, AcpiError::AmdIommuWithoutMsi));
    }

    #[test]
    fn select_and_range_entries_assign_devices() {
        let mut entries = entry(ENTRY_SELECT, device(0, 3, 0).bdf());
        entries.extend(entry(ENTRY_RANGE_START, device(1, 0, 0).bdf()));
        entries.extend(entry(ENTRY_RANGE_END, device(1, 0x1f, 7).bdf()));
        let table = IvrsBuilder::new(1)
            .ivhd(IVHD_TYPE_10, 0x0010, 0xfd20_0000, 0, &entries)
            .build();

        let mut devices = vec![
            iommu_device(0, 2, 0, 0x64),
            device(0, 0, 0), // root complex, on the skip-list
            device(0, 3, 0),
            device(1, 4, 0),
            device(1, 9, 2),
        ];
        parse_ivrs_bytes(&table, &mut devices, &mut []).unwrap();
        assert_eq!(devices[0].iommu, None); // root complex, skipped
        assert_eq!(devices[1].iommu, Some(0));
        assert_eq!(devices[2].iommu, Some(0));
        assert_eq!(devices[3].iommu, Some(0));
    }

    #[test]
    fn alias_select_assigns_by_source_id() {
        let target = device(2, 0, 0);
        let entries = entry8(ENTRY_ALIAS_SELECT, 0x1234, 0, target.bdf(), 0);
        let table = IvrsBuilder::new(1)
            .ivhd(IVHD_TYPE_10, 0x0010, 0xfd20_0000, 0, &entries)
            .build();

        let mut devices = vec![iommu_device(0, 2, 0, 0x64), device(0, 0, 0), target];
        parse_ivrs_bytes(&table, &mut devices, &mut []).unwrap();
        // the IOMMU function was removed; the aliased target is last
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].iommu, Some(0));
    }

    #[test]
    fn special_entry_resolves_ioapic() {
        let mut entries = entry(ENTRY_ALL, 0);
        entries.extend(entry8(ENTRY_SPECIAL, 0, 5, 0x00f8, SPECIAL_VARIETY_IOAPIC));
        let table = IvrsBuilder::new(1)
            .ivhd(IVHD_TYPE_10, 0x0010, 0xfd20_0000, 0, &entries)
            .build();

        let mut devices = vec![iommu_device(0, 2, 0, 0x64)];
        let mut ioapics = [ioapic(5), ioapic(6)];
        parse_ivrs_bytes(&table, &mut devices, &mut ioapics).unwrap();
        assert_eq!(ioapics[0].bdf, 0x00f8);
        assert_eq!(ioapics[0].iommu, Some(0));
        assert_eq!(ioapics[1].iommu, None);
    }

    #[test]
    fn unassigned_device_outside_skiplist_is_fatal() {
        let table = IvrsBuilder::new(1)
            .ivhd(IVHD_TYPE_10, 0x0010, 0xfd20_0000, 0, &entry(ENTRY_SELECT, 0x0018))
            .build();
        let mut devices = vec![
            iommu_device(0, 2, 0, 0x64),
            device(0, 3, 0), // bdf 0x0018, selected
            device(0, 4, 0), // bdf 0x0020, not covered
        ];
        let err = parse_ivrs_bytes(&table, &mut devices, &mut []).unwrap_err();
        assert!(matches!(
            err,
            AcpiError::DeviceOutsideIommu {
                bus: 0,
                device: 4,
                function: 0
            }
        ));
    }

    #[test]
    fn ivmd_per_type_comments() {
        // Dispatch must follow each block's own freshly decoded type.
        let table = IvrsBuilder::new(1)
            .ivhd(IVHD_TYPE_10, 0x0010, 0xfd20_0000, 0, &entry(ENTRY_ALL, 0))
            .ivmd(IVMD_TYPE_ALL, 0, 0, 0, 0x1000_0000, 0x1000)
            .ivmd(IVMD_TYPE_SELECT, 0, 0x0018, 0, 0x2000_0000, 0x1000)
            .ivmd(IVMD_TYPE_RANGE, 0, 0x0018, 0x0020, 0x3000_0000, 0x1000)
            .build();

        let mut devices = vec![iommu_device(0, 2, 0, 0x64)];
        let (_, regions) = parse_ivrs_bytes(&table, &mut devices, &mut []).unwrap();

        assert_eq!(regions.len(), 3);
        assert_eq!(regions[0].kind, "ACPI IVRS");
        assert_eq!(regions[0].start, 0x1000_0000);
        assert_eq!(regions[0].stop, 0x1000_0fff);
        assert!(regions[0].comments.is_empty());
        assert_eq!(regions[1].comments, ["PCI Device: 00:03.0"]);
        assert_eq!(regions[2].comments, ["PCI Device: 00:03.0 - 00:04.0"]);
    }

    #[test]
    fn ivmd_nonzero_flags_degrade_to_warning() {
        let table = IvrsBuilder::new(1)
            .ivhd(IVHD_TYPE_10, 0x0010, 0xfd20_0000, 0, &entry(ENTRY_ALL, 0))
            .ivmd(IVMD_TYPE_SELECT, 0x08, 0x0018, 0, 0x2000_0000, 0x1000)
            .build();
        let mut devices = vec![iommu_device(0, 2, 0, 0x64)];
        // read-only device memory is not enforced downstream; still a region
        let (_, regions) = parse_ivrs_bytes(&table, &mut devices, &mut []).unwrap();
        assert_eq!(regions.len(), 1);
    }

    #[test]
    fn rev2_only_block_type_is_fatal() {
        let table = IvrsBuilder::new(2)
            .ivhd(IVHD_TYPE_10, 0x0010, 0xfd20_0000, 0, &entry(ENTRY_ALL, 0))
            .raw_block(IVHD_TYPE_40, 24)
            .build();
        let mut devices = vec![iommu_device(0, 2, 0, 0x64)];
        let err = parse_ivrs_bytes(&table, &mut devices, &mut []).unwrap_err();
        assert!(matches!(err, AcpiError::UnsupportedIvrsRev2Feature));
    }

    #[test]
    fn unknown_block_type_is_skipped() {
        let table = IvrsBuilder::new(1)
            .raw_block(0x30, 16)
            .ivhd(IVHD_TYPE_10, 0x0010, 0xfd20_0000, 0, &entry(ENTRY_ALL, 0))
            .build();
        let mut devices = vec![iommu_device(0, 2, 0, 0x64)];
        let (units, _) = parse_ivrs_bytes(&table, &mut devices, &mut []).unwrap();
        assert_eq!(units.len(), 1);
    }

    #[test]
    fn unsupported_revision_is_rejected() {
        let table = IvrsBuilder::new(3).build();
        let err = parse_ivrs_bytes(&table, &mut Vec::new(), &mut []).unwrap_err();
        assert!(matches!(
            err,
            AcpiError::UnsupportedRevision {
                table: "IVRS",
                revision: 3
            }
        ));
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut table = IvrsBuilder::new(1).build();
        table[0..4].copy_from_slice(b"DMAR");
        let err = parse_ivrs_bytes(&table, &mut Vec::new(), &mut []).unwrap_err();
        assert!(matches!(err, AcpiError::BadSignature { table: "IVRS" }));
    }
}
