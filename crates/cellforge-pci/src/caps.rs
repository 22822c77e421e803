use tracing::warn;

use crate::error::{PciError, Result};
use crate::ids::{CapId, ExtCapId};

pub const PCI_CONFIG_SPACE_SIZE: usize = 256;
pub const PCI_EXT_CONFIG_SPACE_SIZE: usize = 4096;

const PCI_STATUS_OFFSET: usize = 0x06;
const PCI_CAP_PTR_OFFSET: usize = 0x34;
const PCI_STATUS_CAPABILITIES_LIST: u16 = 1 << 4;
const PCI_BAR0_OFFSET: usize = 0x10;
const PCI_EXT_CAP_START: usize = 0x100;

/// IDs carrying this bit collide with the marker the hypervisor uses to tag
/// extended capabilities in the config record, so they cannot be represented.
const EXT_CAP_MARKER: u16 = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPolicy {
    /// Handed to the cell read-only.
    ReadOnly,
    /// Writes are mediated by the hypervisor.
    Moderated,
}

/// One decoded capability of a PCI function.
#[derive(Debug, Clone)]
pub struct PciCapability {
    pub id: u16,
    pub extended: bool,
    pub offset: u16,
    pub len: u16,
    pub access: AccessPolicy,
    pub content: Vec<u8>,
    /// Resolved MSI-X doorbell address; 0 for everything else.
    pub msix_address: u64,
    pub comments: Vec<String>,
}

impl PartialEq for PciCapability {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.extended == other.extended
            && self.offset == other.offset
            && self.len == other.len
            && self.access == other.access
    }
}

impl Eq for PciCapability {}

fn read_u8(config: &[u8], offset: usize) -> Result<u8> {
    config
        .get(offset)
        .copied()
        .ok_or(PciError::TruncatedConfigSpace { offset, len: 1 })
}

fn read_u16(config: &[u8], offset: usize) -> Result<u16> {
    let bytes = config
        .get(offset..offset + 2)
        .ok_or(PciError::TruncatedConfigSpace { offset, len: 2 })?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(config: &[u8], offset: usize) -> Result<u32> {
    let bytes = config
        .get(offset..offset + 4)
        .ok_or(PciError::TruncatedConfigSpace { offset, len: 4 })?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_slice<'a>(config: &'a [u8], offset: usize, len: usize) -> Result<&'a [u8]> {
    config
        .get(offset..offset + len)
        .ok_or(PciError::TruncatedConfigSpace { offset, len })
}

/// Walk the standard and (when a PCI Express capability is present) extended
/// capability lists of a function's raw configuration space.
pub fn parse_capabilities(config: &[u8]) -> Result<Vec<PciCapability>> {
    let mut caps = Vec::new();
    let mut has_extended_caps = false;

    let status = read_u16(config, PCI_STATUS_OFFSET)?;
    if status & PCI_STATUS_CAPABILITIES_LIST == 0 {
        return Ok(caps);
    }

    let mut next = read_u8(config, PCI_CAP_PTR_OFFSET)? as usize;
    while next != 0 {
        let cap = next;
        let mut msix_address = 0u64;
        let id = CapId::from_raw(read_u8(config, cap)?);
        next = read_u8(config, cap + 1)? as usize;

        let (len, access) = match id {
            // This capability can be handed out completely.
            CapId::Pm => (8, AccessPolicy::Moderated),
            CapId::Msi => {
                let msg_ctrl = read_u16(config, cap + 2)?;
                let mut len = 10;
                if msg_ctrl & (1 << 7) != 0 {
                    // 64-bit addressing
                    len += 4;
                }
                if msg_ctrl & (1 << 8) != 0 {
                    // per-vector masking
                    len += 10;
                }
                (len, AccessPolicy::Moderated)
            }
            CapId::Exp => {
                let cap_reg = read_u16(config, cap + 2)?;
                let len = if cap_reg & 0xf >= 2 { 60 } else { 20 };
                has_extended_caps = true;
                // Access side effects still need to be analyzed.
                (len, AccessPolicy::ReadOnly)
            }
            CapId::Msix => {
                let table = read_u32(config, cap + 4)?;
                let bar_offset = PCI_BAR0_OFFSET + (table as usize & 7) * 4;
                let mut bar = read_u32(config, bar_offset)? as u64;
                if bar & 0x3 != 0 {
                    return Err(PciError::InvalidMsixBar);
                }
                if bar & 0x4 != 0 {
                    bar |= (read_u32(config, bar_offset + 4)? as u64) << 32;
                }
                msix_address = (bar & 0xffff_ffff_ffff_fff0) + (table & 0xffff_fff8) as u64;
                (12, AccessPolicy::Moderated)
            }
            // Unknown/unhandled capability, mark its existence.
            _ => (2, AccessPolicy::ReadOnly),
        };

        let content = read_slice(config, cap + 2, len as usize - 2)?.to_vec();
        caps.push(PciCapability {
            id: id.raw() as u16,
            extended: false,
            offset: cap as u16,
            len,
            access,
            content,
            msix_address,
            comments: Vec::new(),
        });
    }

    if has_extended_caps {
        let mut next = PCI_EXT_CAP_START;
        while next != 0 {
            let cap = next;
            let raw_id = read_u16(config, cap)?;
            if raw_id == 0xffff {
                break;
            }
            let version_next = read_u16(config, cap + 2)?;
            next = (version_next >> 4) as usize;
            if raw_id & EXT_CAP_MARKER != 0 {
                warn!("ignoring unsupported PCI Express extended capability ID {raw_id:#x}");
                continue;
            }

            let id = ExtCapId::from_raw(raw_id);
            let len: u16 = match id {
                ExtCapId::Vndr => {
                    let vsec = read_u32(config, cap + 4)?;
                    4 + (vsec >> 20) as u16
                }
                ExtCapId::Acs => {
                    let mut len = 8;
                    let acs_cap = read_u16(config, cap + 4)?;
                    let acs_ctrl = read_u16(config, cap + 6)?;
                    if acs_cap & (1 << 5) != 0 && acs_ctrl & (1 << 5) != 0 {
                        let mut vector_bits = acs_cap >> 8;
                        if vector_bits == 0 {
                            vector_bits = 256;
                        }
                        len += (vector_bits + 31) / 32;
                    }
                    len
                }
                // Parsing is too complex, but there are at least 4 dwords.
                ExtCapId::Vc | ExtCapId::Vc9 => 16,
                ExtCapId::Mfvc => 4,
                ExtCapId::Ltr | ExtCapId::Ari | ExtCapId::Pasid => 8,
                ExtCapId::Dsn | ExtCapId::Ptm => 12,
                ExtCapId::Pwr | ExtCapId::Secpci => 16,
                ExtCapId::Mcast => 48,
                ExtCapId::Sriov | ExtCapId::Err => 64,
                // Unknown/unhandled capability, mark its existence.
                _ => 4,
            };

            let content = read_slice(config, cap + 4, len as usize - 4)?.to_vec();
            caps.push(PciCapability {
                id: raw_id,
                extended: true,
                offset: cap as u16,
                len,
                // Access side effects still need to be analyzed.
                access: AccessPolicy::ReadOnly,
                content,
                msix_address: 0,
                comments: Vec::new(),
            });
        }
    }

    Ok(caps)
}
