use std::io::{Read, Write};

use crate::cell::{ArchTag, CellConfig, MemoryRegion, CONFIG_REVISION};
use crate::error::{ConfigError, Result};
use crate::io::{ReadLeExt, WriteLeExt};

pub const SYSTEM_SIGNATURE: &[u8; 6] = b"CFSYST";

/// The system record carries a fixed array of this many IOMMU slots; unused
/// slots are tagged `IommuType::Unused`.
pub const SYSTEM_IOMMU_SLOTS: usize = 8;

/// Byte size of the architecture-specific platform payload. The x86 variant
/// fills it exactly; the ARM variant is zero-padded up to it.
const ARCH_PLATFORM_SIZE: usize = 210;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleType {
    None,
    Vga,
    Uart8250,
}

impl ConsoleType {
    pub fn from_raw(raw: u16) -> Result<Self> {
        match raw {
            0 => Ok(ConsoleType::None),
            1 => Ok(ConsoleType::Vga),
            2 => Ok(ConsoleType::Uart8250),
            other => Err(ConfigError::UnknownConsoleType(other)),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            ConsoleType::None => 0,
            ConsoleType::Vga => 1,
            ConsoleType::Uart8250 => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConsoleType::None => "none",
            ConsoleType::Vga => "VGA",
            ConsoleType::Uart8250 => "8250 UART",
        }
    }
}

/// Console register access is through I/O ports unless this flag is set.
pub const CONSOLE_ACCESS_MMIO: u16 = 0x0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Console {
    pub address: u64,
    pub size: u32,
    pub con_type: ConsoleType,
    pub flags: u16,
    pub divider: u32,
    pub gate: u32,
    pub clock: u64,
}

impl Console {
    pub fn none() -> Self {
        Self {
            address: 0,
            size: 0,
            con_type: ConsoleType::None,
            flags: 0,
            divider: 0,
            gate: 0,
            clock: 0,
        }
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64_le(self.address)?;
        w.write_u32_le(self.size)?;
        w.write_u16_le(self.con_type.raw())?;
        w.write_u16_le(self.flags)?;
        w.write_u32_le(self.divider)?;
        w.write_u32_le(self.gate)?;
        w.write_u64_le(self.clock)?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            address: r.read_u64_le()?,
            size: r.read_u32_le()?,
            con_type: ConsoleType::from_raw(r.read_u16_le()?)?,
            flags: r.read_u16_le()?,
            divider: r.read_u32_le()?,
            gate: r.read_u32_le()?,
            clock: r.read_u64_le()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuType {
    Unused,
    Amd,
    Intel,
}

impl IommuType {
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(IommuType::Unused),
            1 => Ok(IommuType::Amd),
            2 => Ok(IommuType::Intel),
            other => Err(ConfigError::UnknownIommuType(other)),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            IommuType::Unused => 0,
            IommuType::Amd => 1,
            IommuType::Intel => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            IommuType::Unused => "unused",
            IommuType::Amd => "AMD",
            IommuType::Intel => "Intel",
        }
    }
}

/// One IOMMU-unit slot of the system record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IommuConfig {
    pub iommu_type: IommuType,
    pub base: u64,
    pub mmio_size: u32,
    pub amd_bdf: u16,
    pub amd_base_cap: u8,
    pub amd_msi_cap: u8,
    pub amd_features: u32,
}

impl IommuConfig {
    pub fn unused() -> Self {
        Self {
            iommu_type: IommuType::Unused,
            base: 0,
            mmio_size: 0,
            amd_bdf: 0,
            amd_base_cap: 0,
            amd_msi_cap: 0,
            amd_features: 0,
        }
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32_le(self.iommu_type.raw())?;
        w.write_u64_le(self.base)?;
        w.write_u32_le(self.mmio_size)?;
        w.write_u16_le(self.amd_bdf)?;
        w.write_u8(self.amd_base_cap)?;
        w.write_u8(self.amd_msi_cap)?;
        w.write_u32_le(self.amd_features)?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            iommu_type: IommuType::from_raw(r.read_u32_le()?)?,
            base: r.read_u64_le()?,
            mmio_size: r.read_u32_le()?,
            amd_bdf: r.read_u16_le()?,
            amd_base_cap: r.read_u8()?,
            amd_msi_cap: r.read_u8()?,
            amd_features: r.read_u32_le()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X86Platform {
    pub pm_timer_address: u16,
    pub iommu_interrupt_limit: u32,
    pub apic_mode: u8,
    pub tsc_khz: u32,
    pub apic_khz: u32,
    pub iommu_units: Vec<IommuConfig>,
}

impl X86Platform {
    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        if self.iommu_units.len() > SYSTEM_IOMMU_SLOTS {
            return Err(ConfigError::TooManyIommuUnits(self.iommu_units.len()));
        }
        w.write_u16_le(self.pm_timer_address)?;
        w.write_u32_le(self.iommu_interrupt_limit)?;
        w.write_u8(self.apic_mode)?;
        w.write_zeroes(3)?;
        w.write_u32_le(self.tsc_khz)?;
        w.write_u32_le(self.apic_khz)?;
        for unit in &self.iommu_units {
            unit.write_to(w)?;
        }
        for _ in self.iommu_units.len()..SYSTEM_IOMMU_SLOTS {
            IommuConfig::unused().write_to(w)?;
        }
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let pm_timer_address = r.read_u16_le()?;
        let iommu_interrupt_limit = r.read_u32_le()?;
        let apic_mode = r.read_u8()?;
        let _pad = r.read_exact_vec(3)?;
        let tsc_khz = r.read_u32_le()?;
        let apic_khz = r.read_u32_le()?;
        let mut iommu_units = Vec::new();
        for _ in 0..SYSTEM_IOMMU_SLOTS {
            let unit = IommuConfig::read_from(r)?;
            if unit.iommu_type != IommuType::Unused {
                iommu_units.push(unit);
            }
        }
        Ok(Self {
            pm_timer_address,
            iommu_interrupt_limit,
            apic_mode,
            tsc_khz,
            apic_khz,
            iommu_units,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmPlatform {
    pub maintenance_irq: u8,
    pub gic_version: u8,
    pub gicd_base: u64,
    pub gicc_base: u64,
    pub gich_base: u64,
    pub gicv_base: u64,
    pub gicr_base: u64,
}

impl ArmPlatform {
    const ENCODED_SIZE: usize = 48;

    fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u8(self.maintenance_irq)?;
        w.write_u8(self.gic_version)?;
        w.write_zeroes(6)?;
        w.write_u64_le(self.gicd_base)?;
        w.write_u64_le(self.gicc_base)?;
        w.write_u64_le(self.gich_base)?;
        w.write_u64_le(self.gicv_base)?;
        w.write_u64_le(self.gicr_base)?;
        w.write_zeroes(ARCH_PLATFORM_SIZE - Self::ENCODED_SIZE)?;
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let maintenance_irq = r.read_u8()?;
        let gic_version = r.read_u8()?;
        let _pad = r.read_exact_vec(6)?;
        let platform = Self {
            maintenance_irq,
            gic_version,
            gicd_base: r.read_u64_le()?,
            gicc_base: r.read_u64_le()?,
            gich_base: r.read_u64_le()?,
            gicv_base: r.read_u64_le()?,
            gicr_base: r.read_u64_le()?,
        };
        let _tail = r.read_exact_vec(ARCH_PLATFORM_SIZE - Self::ENCODED_SIZE)?;
        Ok(platform)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchPlatform {
    X86(X86Platform),
    Arm(ArmPlatform),
}

/// The root/system descriptor: hypervisor carve-out, console, PCI MMCONFIG
/// window and platform payload, with the full root-cell record embedded at
/// the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    pub arch: ArchTag,
    pub flags: u32,
    pub hypervisor_memory: MemoryRegion,
    pub console: Console,
    pub mmconfig_base: u64,
    pub mmconfig_end_bus: u8,
    pub pci_is_virtual: bool,
    pub pci_domain: u16,
    pub platform: ArchPlatform,
    pub root_cell: CellConfig,
}

impl SystemConfig {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        out.write_bytes(SYSTEM_SIGNATURE)?;
        out.write_u8(self.arch.raw())?;
        out.write_u8(0)?;
        out.write_u16_le(CONFIG_REVISION)?;
        out.write_u32_le(self.flags)?;
        self.hypervisor_memory.write_to(&mut out)?;
        self.console.write_to(&mut out)?;
        out.write_u64_le(self.mmconfig_base)?;
        out.write_u8(self.mmconfig_end_bus)?;
        out.write_u8(self.pci_is_virtual as u8)?;
        out.write_u16_le(self.pci_domain)?;
        match (&self.platform, self.arch) {
            (ArchPlatform::X86(p), ArchTag::X86) => p.write_to(&mut out)?,
            (ArchPlatform::Arm(p), ArchTag::Arm | ArchTag::Arm64) => p.write_to(&mut out)?,
            _ => return Err(ConfigError::Corrupt("platform payload does not match arch")),
        }
        self.root_cell.write_to(&mut out)?;

        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = data;

        let mut signature = [0u8; 6];
        r.read_exact(&mut signature)
            .map_err(|_| ConfigError::NotASystemConfig)?;
        if &signature != SYSTEM_SIGNATURE {
            return Err(ConfigError::NotASystemConfig);
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
        let flags = r.read_u32_le()?;
        let hypervisor_memory = MemoryRegion::read_from(&mut r)?;
        let console = Console::read_from(&mut r)?;
        let mmconfig_base = r.read_u64_le()?;
        let mmconfig_end_bus = r.read_u8()?;
        let pci_is_virtual = r.read_u8()? != 0;
        let pci_domain = r.read_u16_le()?;
        let platform = match arch {
            ArchTag::X86 => ArchPlatform::X86(X86Platform::read_from(&mut r)?),
            ArchTag::Arm | ArchTag::Arm64 => ArchPlatform::Arm(ArmPlatform::read_from(&mut r)?),
        };
        let root_cell = CellConfig::read_from(&mut r)?;

        Ok(Self {
            arch,
            flags,
            hypervisor_memory,
            console,
            mmconfig_base,
            mmconfig_end_bus,
            pci_is_virtual,
            pci_domain,
            platform,
            root_cell,
        })
    }
}
