use cellforge_pci::{PciDevice, PciDeviceKind};
use cellforge_sysinfo::{MemRegion, SysfsRoot};

use crate::bytes::TableReader;
use crate::error::{AcpiError, Result};
use crate::iommu::{IommuKind, IommuUnit, MAX_IOMMU_UNITS};
use crate::madt::IoApic;

const DMAR_PATH: &str = "/sys/firmware/acpi/tables/DMAR";
const DMAR_STRUCTS_OFFSET: usize = 48;

// Remapping structure types, Intel VT-d spec chapter 8.
const DMAR_TYPE_DRHD: u16 = 0;
const DMAR_TYPE_RMRR: u16 = 1;

const DRHD_FLAG_INCLUDE_PCI_ALL: u8 = 1 << 0;

// Device scope entry types.
const SCOPE_TYPE_ENDPOINT: u8 = 1;
const SCOPE_TYPE_BRIDGE: u8 = 2;
const SCOPE_TYPE_IOAPIC: u8 = 3;

/// The largest MMIO window the kernel reports for a healthy remapping unit.
const DRHD_MMIO_SIZE_LIMIT: u64 = 0x3000;

struct DevScope {
    scope_type: u8,
    len: u8,
    id: u8,
    bus: u8,
    device: u8,
    function: u8,
}

fn parse_devscope(r: &TableReader<'_>, offset: usize) -> Result<DevScope> {
    let scope = DevScope {
        scope_type: r.u8(offset)?,
        len: r.u8(offset + 1)?,
        id: r.u8(offset + 4)?,
        bus: r.u8(offset + 5)?,
        device: r.u8(offset + 6)?,
        function: r.u8(offset + 7)?,
    };
    if scope.len != 8 {
        return Err(AcpiError::UnsupportedDevScope { len: scope.len });
    }
    Ok(scope)
}

/// Parse the Intel DMAR table: one IOMMU unit per remapping-hardware
/// definition, device/IOAPIC assignments from the nested device scopes, and
/// reserved memory regions from the RMRR structures.
///
/// The MMIO window size of each unit is recovered from the kernel-reported
/// `dmar` regions of `/proc/iomem` collected earlier.
pub fn parse_dmar(
    root: &SysfsRoot,
    devices: &mut Vec<PciDevice>,
    ioapics: &mut [IoApic],
    dmar_regions: &[MemRegion],
) -> Result<(Vec<IommuUnit>, Vec<MemRegion>)> {
    let data = root.read_bytes(DMAR_PATH)?;
    parse_dmar_bytes(&data, devices, ioapics, dmar_regions)
}

fn parse_dmar_bytes(
    data: &[u8],
    devices: &mut Vec<PciDevice>,
    ioapics: &mut [IoApic],
    dmar_regions: &[MemRegion],
) -> Result<(Vec<IommuUnit>, Vec<MemRegion>)> {
    let r = TableReader::new("DMAR", data);
    let length = r.header(b"DMAR")?;

    let mut units: Vec<IommuUnit> = Vec::new();
    let mut regions: Vec<MemRegion> = Vec::new();

    let mut offset = DMAR_STRUCTS_OFFSET;
    while offset < length {
        let struct_type = r.u16(offset)?;
        let struct_len = r.u16(offset + 2)? as usize;
        if struct_len < 4 {
            return Err(AcpiError::MalformedStructure {
                table: r.table(),
                offset,
            });
        }

        match struct_type {
            DMAR_TYPE_DRHD => {
                let flags = r.u8(offset + 4)?;
                let segment = r.u16(offset + 6)?;
                let base = r.u64(offset + 8)?;
                if segment != 0 {
                    return Err(AcpiError::MultiplePciSegments);
                }
                if units.len() >= MAX_IOMMU_UNITS {
                    return Err(AcpiError::TooManyIommuUnits(MAX_IOMMU_UNITS));
                }

                let size = dmar_regions
                    .iter()
                    .find(|reg| reg.start == base)
                    .map(|reg| reg.size())
                    .unwrap_or(0);
                if size == 0 {
                    return Err(AcpiError::DmarRegionUnknown { base });
                }
                if size > DRHD_MMIO_SIZE_LIMIT {
                    return Err(AcpiError::DmarRegionTooLarge { base, size });
                }

                units.push(IommuUnit {
                    kind: IommuKind::Intel,
                    base,
                    mmio_size: size as u32,
                    amd: None,
                });
                let unit = (units.len() - 1) as u8;

                let include_all = flags & DRHD_FLAG_INCLUDE_PCI_ALL != 0;
                if include_all {
                    for d in devices.iter_mut() {
                        if d.iommu.is_none() {
                            d.iommu = Some(unit);
                        }
                    }
                }

                let mut scope_offset = offset + 16;
                while scope_offset < offset + struct_len {
                    let scope = parse_devscope(&r, scope_offset)?;
                    match scope.scope_type {
                        SCOPE_TYPE_ENDPOINT => {
                            if include_all {
                                return Err(AcpiError::ScopeWithIncludeAll);
                            }
                            if let Some(d) = devices.iter_mut().find(|d| {
                                d.bus == scope.bus
                                    && d.device == scope.device
                                    && d.function == scope.function
                            }) {
                                d.iommu = Some(unit);
                            }
                        }
                        SCOPE_TYPE_BRIDGE => {
                            if include_all {
                                return Err(AcpiError::ScopeWithIncludeAll);
                            }
                            let bridge = devices.iter().position(|d| {
                                d.bus == scope.bus
                                    && d.device == scope.device
                                    && d.function == scope.function
                            });
                            if let Some(i) = bridge {
                                devices[i].iommu = Some(unit);
                                debug_assert_eq!(devices[i].kind, PciDeviceKind::Bridge);
                                let secondary = devices[i].secondary_bus;
                                let subordinate = devices[i].subordinate_bus;
                                for d in devices.iter_mut() {
                                    if d.bus >= secondary && d.bus <= subordinate {
                                        d.iommu = Some(unit);
                                    }
                                }
                            }
                        }
                        SCOPE_TYPE_IOAPIC => {
                            let bdf = (scope.bus as u16) << 8
                                | (scope.device as u16) << 3
                                | scope.function as u16;
                            if !ioapics.iter().any(|chip| chip.id == scope.id) {
                                return Err(AcpiError::NoSuchIoApic { id: scope.id });
                            }
                            if ioapics.iter().any(|chip| chip.bdf == bdf) {
                                return Err(AcpiError::DuplicateIoApicBdf { bdf });
                            }
                            for chip in ioapics.iter_mut() {
                                if chip.id == scope.id {
                                    chip.bdf = bdf;
                                    chip.iommu = Some(unit);
                                }
                            }
                        }
                        _ => {}
                    }
                    scope_offset += scope.len as usize;
                }
            }
            DMAR_TYPE_RMRR => {
                let base = r.u64(offset + 8)?;
                let limit = r.u64(offset + 16)?;

                let mut comments = Vec::new();
                let mut scope_offset = offset + 24;
                while scope_offset < offset + struct_len {
                    let scope = parse_devscope(&r, scope_offset)?;
                    if scope.scope_type == SCOPE_TYPE_ENDPOINT {
                        comments.push(format!(
                            "PCI device: {:02x}:{:02x}.{:x}",
                            scope.bus, scope.device, scope.function
                        ));
                    } else {
                        comments.push(String::from("DMAR parser could not decode device path"));
                    }
                    scope_offset += scope.len as usize;
                }

                regions.push(MemRegion::with_comments(
                    base,
                    limit,
                    "ACPI DMAR RMRR",
                    comments,
                ));
            }
            _ => {}
        }

        offset += struct_len;
    }

    for d in devices.iter() {
        if d.iommu.is_none() {
            return Err(AcpiError::DeviceOutsideIommu {
                bus: d.bus,
                device: d.device,
                function: d.function,
            });
        }
    }

    Ok((units, regions))
}
