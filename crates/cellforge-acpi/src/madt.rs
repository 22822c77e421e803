use cellforge_sysinfo::SysfsRoot;

use crate::bytes::TableReader;
use crate::error::{AcpiError, Result};

const MADT_PATH: &str = "/sys/firmware/acpi/tables/APIC";
const MADT_STRUCTS_OFFSET: usize = 44;
const MADT_TYPE_IOAPIC: u8 = 1;

/// An I/O APIC as reported by the MADT. The owning IOMMU unit and the
/// controller's own bus/device/function are filled in later by the
/// DMA-remapping table parsers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoApic {
    pub id: u8,
    pub address: u32,
    pub gsi_base: u32,
    pub iommu: Option<u8>,
    pub bdf: u16,
}

impl IoApic {
    /// The IOMMU unit index is encoded into the irqchip ID consumed by the
    /// hypervisor.
    pub fn irqchip_id(&self) -> u32 {
        (self.iommu.unwrap_or(0) as u32) << 16 | self.bdf as u32
    }
}

/// Parse the MADT (signature `APIC`) and collect its I/O APIC entries.
pub fn parse_madt(root: &SysfsRoot) -> Result<Vec<IoApic>> {
    let data = root.read_bytes(MADT_PATH)?;
    parse_madt_bytes(&data)
}

fn parse_madt_bytes(data: &[u8]) -> Result<Vec<IoApic>> {
    let r = TableReader::new("MADT", data);
    let length = r.header(b"APIC")?;

    let mut ioapics = Vec::new();
    let mut offset = MADT_STRUCTS_OFFSET;
    while offset < length {
        let struct_type = r.u8(offset)?;
        let struct_len = r.u8(offset + 1)? as usize;
        if struct_len < 2 {
            return Err(AcpiError::MalformedStructure {
                table: r.table(),
                offset,
            });
        }

        if struct_type == MADT_TYPE_IOAPIC {
            ioapics.push(IoApic {
                id: r.u8(offset + 2)?,
                address: r.u32(offset + 4)?,
                gsi_base: r.u32(offset + 8)?,
                iommu: None,
                bdf: 0,
            });
        }

        offset += struct_len;
    }

    Ok(ioapics)
}
