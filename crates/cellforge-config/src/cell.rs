use std::io::{Read, Write};

use crate::error::{ConfigError, Result};
use crate::flags::MemFlags;
use crate::io::{ReadLeExt, WriteLeExt};

/// Incremented on any layout or semantic change of the cell or system
/// record. A decoder never accepts another revision.
pub const CONFIG_REVISION: u16 = 13;

pub const CELL_SIGNATURE: &[u8; 6] = b"CFCELL";
pub const CELL_NAME_MAXLEN: usize = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchTag {
    X86,
    Arm,
    Arm64,
}

impl ArchTag {
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(ArchTag::X86),
            1 => Ok(ArchTag::Arm),
            2 => Ok(ArchTag::Arm64),
            other => Err(ConfigError::UnknownArch(other)),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            ArchTag::X86 => 0,
            ArchTag::Arm => 1,
            ArchTag::Arm64 => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ArchTag::X86 => "x86",
            ArchTag::Arm => "arm",
            ArchTag::Arm64 => "arm64",
        }
    }
}

/// A guest-physical memory mapping granted to a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub phys_start: u64,
    pub virt_start: u64,
    pub size: u64,
    pub flags: MemFlags,
}

impl MemoryRegion {
    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64_le(self.phys_start)?;
        w.write_u64_le(self.virt_start)?;
        w.write_u64_le(self.size)?;
        w.write_u64_le(self.flags.bits())?;
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            phys_start: r.read_u64_le()?,
            virt_start: r.read_u64_le()?,
            size: r.read_u64_le()?,
            flags: MemFlags::from_bits_retain(r.read_u64_le()?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheRegion {
    pub start: u32,
    pub size: u32,
    pub cache_type: u8,
    pub flags: u16,
}

impl CacheRegion {
    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32_le(self.start)?;
        w.write_u32_le(self.size)?;
        w.write_u8(self.cache_type)?;
        w.write_u8(0)?;
        w.write_u16_le(self.flags)?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let start = r.read_u32_le()?;
        let size = r.read_u32_le()?;
        let cache_type = r.read_u8()?;
        let _pad = r.read_u8()?;
        let flags = r.read_u16_le()?;
        Ok(Self {
            start,
            size,
            cache_type,
            flags,
        })
    }
}

/// One interrupt controller (IOAPIC) with the pins handed to the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Irqchip {
    pub address: u64,
    pub id: u32,
    pub pin_base: u32,
    pub pin_bitmap: [u32; 4],
}

impl Irqchip {
    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64_le(self.address)?;
        w.write_u32_le(self.id)?;
        w.write_u32_le(self.pin_base)?;
        for word in self.pin_bitmap {
            w.write_u32_le(word)?;
        }
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let address = r.read_u64_le()?;
        let id = r.read_u32_le()?;
        let pin_base = r.read_u32_le()?;
        let mut pin_bitmap = [0u32; 4];
        for word in &mut pin_bitmap {
            *word = r.read_u32_le()?;
        }
        Ok(Self {
            address,
            id,
            pin_base,
            pin_bitmap,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PioRegion {
    pub base: u16,
    pub length: u16,
}

impl PioRegion {
    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u16_le(self.base)?;
        w.write_u16_le(self.length)?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            base: r.read_u16_le()?,
            length: r.read_u16_le()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciType {
    Device,
    Bridge,
}

impl PciType {
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(PciType::Device),
            2 => Ok(PciType::Bridge),
            _ => Err(ConfigError::Corrupt("unknown PCI device type")),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            PciType::Device => 1,
            PciType::Bridge => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PciType::Device => "device",
            PciType::Bridge => "bridge",
        }
    }
}

const MSI_FLAG_64BIT: u8 = 1 << 0;
const MSI_FLAG_MASKABLE: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDeviceConfig {
    pub device_type: PciType,
    pub iommu: u8,
    pub domain: u16,
    pub bdf: u16,
    pub bar_mask: [u32; 6],
    pub caps_start: u16,
    pub num_caps: u16,
    pub num_msi_vectors: u8,
    pub msi_64bit: bool,
    pub msi_maskable: bool,
    pub num_msix_vectors: u16,
    pub msix_region_size: u16,
    pub msix_address: u64,
}

impl PciDeviceConfig {
    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u8(self.device_type.raw())?;
        w.write_u8(self.iommu)?;
        w.write_u16_le(self.domain)?;
        w.write_u16_le(self.bdf)?;
        for mask in self.bar_mask {
            w.write_u32_le(mask)?;
        }
        w.write_u16_le(self.caps_start)?;
        w.write_u16_le(self.num_caps)?;
        w.write_u8(self.num_msi_vectors)?;
        let mut msi_flags = 0;
        if self.msi_64bit {
            msi_flags |= MSI_FLAG_64BIT;
        }
        if self.msi_maskable {
            msi_flags |= MSI_FLAG_MASKABLE;
        }
        w.write_u8(msi_flags)?;
        w.write_u16_le(self.num_msix_vectors)?;
        w.write_u16_le(self.msix_region_size)?;
        w.write_u64_le(self.msix_address)?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let device_type = PciType::from_raw(r.read_u8()?)?;
        let iommu = r.read_u8()?;
        let domain = r.read_u16_le()?;
        let bdf = r.read_u16_le()?;
        let mut bar_mask = [0u32; 6];
        for mask in &mut bar_mask {
            *mask = r.read_u32_le()?;
        }
        let caps_start = r.read_u16_le()?;
        let num_caps = r.read_u16_le()?;
        let num_msi_vectors = r.read_u8()?;
        let msi_flags = r.read_u8()?;
        Ok(Self {
            device_type,
            iommu,
            domain,
            bdf,
            bar_mask,
            caps_start,
            num_caps,
            num_msi_vectors,
            msi_64bit: msi_flags & MSI_FLAG_64BIT != 0,
            msi_maskable: msi_flags & MSI_FLAG_MASKABLE != 0,
            num_msix_vectors: r.read_u16_le()?,
            msix_region_size: r.read_u16_le()?,
            msix_address: r.read_u64_le()?,
        })
    }
}

/// Extended capability IDs carry this marker bit in the record.
pub const PCI_CAP_EXTENDED: u16 = 0x8000;
const PCI_CAP_FLAG_MODERATED: u16 = 0x0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciCapConfig {
    pub id: u16,
    pub extended: bool,
    pub start: u16,
    pub len: u16,
    /// Writes to this capability are mediated by the hypervisor.
    pub moderated: bool,
}

impl PciCapConfig {
    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let id = if self.extended {
            self.id | PCI_CAP_EXTENDED
        } else {
            self.id
        };
        w.write_u16_le(id)?;
        w.write_u16_le(self.start)?;
        w.write_u16_le(self.len)?;
        w.write_u16_le(if self.moderated {
            PCI_CAP_FLAG_MODERATED
        } else {
            0
        })?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let raw_id = r.read_u16_le()?;
        Ok(Self {
            id: raw_id & !PCI_CAP_EXTENDED,
            extended: raw_id & PCI_CAP_EXTENDED != 0,
            start: r.read_u16_le()?,
            len: r.read_u16_le()?,
            moderated: r.read_u16_le()? & PCI_CAP_FLAG_MODERATED != 0,
        })
    }
}

/// The versioned cell descriptor: a fixed header followed back-to-back by
/// the CPU bitmap and the per-kind resource arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellConfig {
    pub arch: ArchTag,
    pub name: String,
    pub flags: u32,
    pub cpu_set: Vec<u8>,
    pub memory_regions: Vec<MemoryRegion>,
    pub cache_regions: Vec<CacheRegion>,
    pub irqchips: Vec<Irqchip>,
    pub pio_regions: Vec<PioRegion>,
    pub pci_devices: Vec<PciDeviceConfig>,
    pub pci_caps: Vec<PciCapConfig>,
    pub vpci_irq_base: u32,
    pub cpu_reset_address: u64,
}

impl CellConfig {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = data;
        Self::read_from(&mut cursor)
    }

    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        if self.name.len() > CELL_NAME_MAXLEN {
            return Err(ConfigError::NameTooLong {
                max: CELL_NAME_MAXLEN,
            });
        }

        w.write_bytes(CELL_SIGNATURE)?;
        w.write_u8(self.arch.raw())?;
        w.write_u8(0)?;
        w.write_u16_le(CONFIG_REVISION)?;
        let mut name = [0u8; CELL_NAME_MAXLEN + 1];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());
        w.write_bytes(&name)?;
        w.write_u32_le(self.flags)?;
        w.write_u32_le(self.cpu_set.len() as u32)?;
        w.write_u32_le(self.memory_regions.len() as u32)?;
        w.write_u32_le(self.cache_regions.len() as u32)?;
        w.write_u32_le(self.irqchips.len() as u32)?;
        w.write_u32_le(self.pio_regions.len() as u32)?;
        w.write_u32_le(self.pci_devices.len() as u32)?;
        w.write_u32_le(self.pci_caps.len() as u32)?;
        w.write_u32_le(self.vpci_irq_base)?;
        w.write_u64_le(self.cpu_reset_address)?;

        w.write_bytes(&self.cpu_set)?;
        for region in &self.memory_regions {
            region.write_to(w)?;
        }
        for region in &self.cache_regions {
            region.write_to(w)?;
        }
        for chip in &self.irqchips {
            chip.write_to(w)?;
        }
        for region in &self.pio_regions {
            region.write_to(w)?;
        }
        for device in &self.pci_devices {
            device.write_to(w)?;
        }
        for cap in &self.pci_caps {
            cap.write_to(w)?;
        }
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut signature = [0u8; 6];
        r.read_exact(&mut signature)
            .map_err(|_| ConfigError::NotACellConfig)?;
        if &signature != CELL_SIGNATURE {
            return Err(ConfigError::NotACellConfig);
        }
        let arch = ArchTag::from_raw(r.read_u8()?)?;
        let _reserved = r.read_u8()?;
        let revision = r.read_u16_le()?;
        if revision != CONFIG_REVISION {
            return Err(ConfigError::RevisionMismatch {
                found: revision,
                expected: CONFIG_REVISION,
            });
        }

        let mut name = [0u8; CELL_NAME_MAXLEN + 1];
        r.read_exact(&mut name)?;
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        let name = std::str::from_utf8(&name[..end])
            .map_err(|_| ConfigError::BadName)?
            .to_string();

        let flags = r.read_u32_le()?;
        let cpu_set_size = r.read_u32_le()? as usize;
        let num_memory_regions = r.read_u32_le()? as usize;
        let num_cache_regions = r.read_u32_le()? as usize;
        let num_irqchips = r.read_u32_le()? as usize;
        let num_pio_regions = r.read_u32_le()? as usize;
        let num_pci_devices = r.read_u32_le()? as usize;
        let num_pci_caps = r.read_u32_le()? as usize;
        let vpci_irq_base = r.read_u32_le()?;
        let cpu_reset_address = r.read_u64_le()?;

        let cpu_set = r.read_exact_vec(cpu_set_size)?;
        let mut memory_regions = Vec::with_capacity(num_memory_regions);
        for _ in 0..num_memory_regions {
            memory_regions.push(MemoryRegion::read_from(r)?);
        }
        let mut cache_regions = Vec::with_capacity(num_cache_regions);
        for _ in 0..num_cache_regions {
            cache_regions.push(CacheRegion::read_from(r)?);
        }
        let mut irqchips = Vec::with_capacity(num_irqchips);
        for _ in 0..num_irqchips {
            irqchips.push(Irqchip::read_from(r)?);
        }
        let mut pio_regions = Vec::with_capacity(num_pio_regions);
        for _ in 0..num_pio_regions {
            pio_regions.push(PioRegion::read_from(r)?);
        }
        let mut pci_devices = Vec::with_capacity(num_pci_devices);
        for _ in 0..num_pci_devices {
            pci_devices.push(PciDeviceConfig::read_from(r)?);
        }
        let mut pci_caps = Vec::with_capacity(num_pci_caps);
        for _ in 0..num_pci_caps {
            pci_caps.push(PciCapConfig::read_from(r)?);
        }

        Ok(Self {
            arch,
            name,
            flags,
            cpu_set,
            memory_regions,
            cache_regions,
            irqchips,
            pio_regions,
            pci_devices,
            pci_caps,
            vpci_irq_base,
            cpu_reset_address,
        })
    }
}
