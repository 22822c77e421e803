use thiserror::Error;

use cellforge_sysinfo::SysinfoError;

pub type Result<T> = std::result::Result<T, AcpiError>;

#[derive(Debug, Error)]
pub enum AcpiError {
    #[error(transparent)]
    Sysinfo(#[from] SysinfoError),

    #[error("{table}: incorrect input file format")]
    BadSignature { table: &'static str },

    #[error("{table}: truncated structure at offset {offset:#x}")]
    Truncated { table: &'static str, offset: usize },

    #[error("{table}: malformed structure at offset {offset:#x}")]
    MalformedStructure { table: &'static str, offset: usize },

    #[error("{table}: unsupported revision {revision:#04x}")]
    UnsupportedRevision { table: &'static str, revision: u8 },

    #[error("multiple PCI segments are not supported")]
    MultiplePciSegments,

    #[error("too many IOMMU units (at most {0} are supported)")]
    TooManyIommuUnits(usize),

    #[error(
        "DMAR region size at {base:#x} cannot be identified; \
         the target kernel must run with the Intel IOMMU enabled"
    )]
    DmarRegionUnknown { base: u64 },

    #[error("unexpectedly large DMAR region at {base:#x} ({size:#x} bytes)")]
    DmarRegionTooLarge { base: u64, size: u64 },

    #[error("unsupported DMAR device scope structure (length {len})")]
    UnsupportedDevScope { len: u8 },

    #[error("device scope entries combined with the include-all flag")]
    ScopeWithIncludeAll,

    #[error("no IOAPIC with id {id}")]
    NoSuchIoApic { id: u8 },

    #[error("IOAPICs with identical BDF {bdf:#06x}")]
    DuplicateIoApicBdf { bdf: u16 },

    #[error("PCI device {bus:02x}:{device:02x}.{function:x} outside the scope of an IOMMU")]
    DeviceOutsideIommu { bus: u8, device: u8, function: u8 },

    #[error("more than one AMD IOMMU per PCI function is not supported")]
    MultipleAmdIommus,

    #[error("AMD IOMMU lacks MSI support; MSI-X-only IOMMUs are not supported")]
    AmdIommuWithoutMsi,

    #[error("the board uses an IVRS revision 2 feature that is not supported yet")]
    UnsupportedIvrsRev2Feature,

    #[error("cannot scan IOMMUs for an unknown CPU vendor")]
    UnknownCpuVendor,
}
