#![forbid(unsafe_code)]

//! PCI function discovery: configuration-space capability walking and the
//! sysfs-backed device model the IOMMU assignment runs against.

mod caps;
mod device;
mod error;
mod ids;

pub use crate::caps::{
    parse_capabilities, AccessPolicy, PciCapability, PCI_CONFIG_SPACE_SIZE,
    PCI_EXT_CONFIG_SPACE_SIZE,
};
pub use crate::device::{parse_pci_devices, PciDevice, PciDeviceKind};
pub use crate::error::{PciError, Result};
pub use crate::ids::{CapId, ExtCapId};
