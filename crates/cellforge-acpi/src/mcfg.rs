use cellforge_sysinfo::SysfsRoot;

use crate::bytes::TableReader;
use crate::error::{AcpiError, Result};

const MCFG_PATH: &str = "/sys/firmware/acpi/tables/MCFG";
const MCFG_ALLOC_OFFSET: usize = 44;
const MCFG_ALLOC_SIZE: usize = 16;

/// The PCI MMCONFIG window: one ECAM allocation for segment 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mmconfig {
    pub base: u64,
    pub start_bus: u8,
    pub end_bus: u8,
}

/// Parse the MCFG table. Exactly one allocation on segment 0 is supported.
pub fn parse_mcfg(root: &SysfsRoot) -> Result<Mmconfig> {
    let data = root.read_bytes(MCFG_PATH)?;
    parse_mcfg_bytes(&data)
}

fn parse_mcfg_bytes(data: &[u8]) -> Result<Mmconfig> {
    let r = TableReader::new("MCFG", data);
    let length = r.header(b"MCFG")?;

    if length.saturating_sub(MCFG_ALLOC_OFFSET) > MCFG_ALLOC_SIZE {
        return Err(AcpiError::MultiplePciSegments);
    }

    let segment = r.u16(MCFG_ALLOC_OFFSET + 8)?;
    if segment != 0 {
        return Err(AcpiError::MultiplePciSegments);
    }

    Ok(Mmconfig {
        base: r.u64(MCFG_ALLOC_OFFSET)?,
        start_bus: r.u8(MCFG_ALLOC_OFFSET + 10)?,
        end_bus: r.u8(MCFG_ALLOC_OFFSET + 11)?,
    })
}
