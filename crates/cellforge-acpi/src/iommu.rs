use cellforge_pci::PciDevice;
use cellforge_sysinfo::{CpuVendor, MemRegion, SysfsRoot};

use crate::dmar::parse_dmar;
use crate::error::{AcpiError, Result};
use crate::ivrs::parse_ivrs;
use crate::madt::IoApic;

/// The hypervisor's fixed IOMMU-unit array size.
pub const MAX_IOMMU_UNITS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuKind {
    Intel,
    Amd,
}

impl IommuKind {
    pub fn name(self) -> &'static str {
        match self {
            IommuKind::Intel => "Intel",
            IommuKind::Amd => "AMD",
        }
    }
}

/// AMD-specific unit state the hypervisor needs to take over the IOMMU's
/// own PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmdIommuInfo {
    pub bdf: u16,
    pub base_cap: u16,
    pub msi_cap: u16,
    pub features: u32,
}

/// One DMA-remapping hardware unit. The position in the discovery list is
/// the stable handle devices and IOAPICs are assigned by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IommuUnit {
    pub kind: IommuKind,
    pub base: u64,
    pub mmio_size: u32,
    pub amd: Option<AmdIommuInfo>,
}

/// Discover the platform's IOMMU units and assign every PCI device and
/// IOAPIC to one, dispatching on the CPU vendor. Returns the units plus the
/// reserved memory regions the tables report.
pub fn scan_iommus(
    root: &SysfsRoot,
    vendor: CpuVendor,
    devices: &mut Vec<PciDevice>,
    ioapics: &mut [IoApic],
    dmar_regions: &[MemRegion],
) -> Result<(Vec<IommuUnit>, Vec<MemRegion>)> {
    match vendor {
        CpuVendor::Intel => parse_dmar(root, devices, ioapics, dmar_regions),
        CpuVendor::Amd => parse_ivrs(root, devices, ioapics),
        CpuVendor::Unknown => Err(AcpiError::UnknownCpuVendor),
    }
}
