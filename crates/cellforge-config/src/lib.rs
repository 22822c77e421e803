#![forbid(unsafe_code)]

//! The versioned binary configuration records consumed by the hypervisor:
//! the per-cell descriptor and the system descriptor that embeds the root
//! cell. Little-endian, packed, validated exactly on decode.

mod cell;
mod error;
mod flags;
mod io;
mod system;

pub use crate::cell::{
    ArchTag, CacheRegion, CellConfig, Irqchip, MemoryRegion, PciCapConfig, PciDeviceConfig,
    PciType, PioRegion, CELL_NAME_MAXLEN, CELL_SIGNATURE, CONFIG_REVISION, PCI_CAP_EXTENDED,
};
pub use crate::error::{ConfigError, Result};
pub use crate::flags::MemFlags;
pub use crate::system::{
    ArchPlatform, ArmPlatform, Console, ConsoleType, IommuConfig, IommuType, SystemConfig,
    X86Platform, CONSOLE_ACCESS_MMIO, SYSTEM_IOMMU_SLOTS, SYSTEM_SIGNATURE,
};
