#![forbid(unsafe_code)]

//! Host-side hardware topology discovery: allowlisted access to the kernel's
//! resource listings and the classifier passes that turn them into a flat,
//! conflict-free region map.

mod error;
mod input;
mod iomem;
mod ioports;
mod region;
mod tree;

pub use crate::error::{Result, SysinfoError};
pub use crate::input::{memmap_reservation, CpuVendor, MemmapReservation, SysfsRoot};
pub use crate::iomem::{parse_iomem, VGA_APERTURE_BASE};
pub use crate::ioports::parse_ioports;
pub use crate::region::{MemRegion, MsixWindow, PortRegion, PAGE_SIZE};
pub use crate::tree::{Node, NodeId, RawRegion, ResourceTree};
