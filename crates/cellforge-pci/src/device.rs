use tracing::warn;

use cellforge_sysinfo::{MsixWindow, SysfsRoot};

use crate::caps::{parse_capabilities, PciCapability};
use crate::error::{PciError, Result};
use crate::ids::CapId;

const PCI_DEVICES_DIR: &str = "/sys/bus/pci/devices";

const PCI_CLASS_OFFSET: usize = 0x0a;
const PCI_CLASS_BRIDGE_PCI: u16 = 0x0604;
const PCI_SECONDARY_BUS_OFFSET: usize = 0x19;
const PCI_SUBORDINATE_BUS_OFFSET: usize = 0x1a;

// Linux `resource` file flag bits.
const IORESOURCE_IO: u64 = 0x0000_0100;
const IORESOURCE_MEM: u64 = 0x0000_0200;
const IORESOURCE_MEM_64: u64 = 0x0010_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciDeviceKind {
    Endpoint,
    Bridge,
}

/// A PCI function as discovered through sysfs.
#[derive(Debug, Clone)]
pub struct PciDevice {
    pub kind: PciDeviceKind,
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub bar_mask: [u32; 6],
    pub caps: Vec<PciCapability>,
    /// Index of the IOMMU unit covering this function; assigned by the
    /// DMA-remapping table parsers.
    pub iommu: Option<u8>,
    pub num_msi_vectors: u8,
    pub msi_64bit: bool,
    pub msi_maskable: bool,
    pub num_msix_vectors: u16,
    pub msix_region_size: u16,
    pub msix_address: u64,
    pub secondary_bus: u8,
    pub subordinate_bus: u8,
    pub path: String,
}

impl PciDevice {
    pub fn bdf(&self) -> u16 {
        (self.bus as u16) << 8 | (self.device as u16) << 3 | self.function as u16
    }

    /// The doorbell page range to carve out of the memory map, if MSI-X was
    /// resolved for this function.
    pub fn msix_window(&self) -> Option<MsixWindow> {
        (self.msix_address != 0).then(|| MsixWindow {
            address: self.msix_address,
            size: self.msix_region_size as u64,
        })
    }

    /// Parse one `/sys/bus/pci/devices` entry. Returns `Ok(None)` for
    /// apparently disabled functions (all-ones vendor/device).
    pub fn parse_sysfs_entry(root: &SysfsRoot, basedir: &str, entry: &str) -> Result<Option<Self>> {
        let dpath = format!("{basedir}/{entry}");
        let config = root.read_bytes(&format!("{dpath}/config"))?;

        let vendor_device = config
            .get(0..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or(PciError::TruncatedConfigSpace { offset: 0, len: 4 })?;
        if vendor_device == 0xffff_ffff {
            warn!("ignoring apparently disabled PCI device {entry}");
            return Ok(None);
        }

        let classcode = config
            .get(PCI_CLASS_OFFSET..PCI_CLASS_OFFSET + 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .ok_or(PciError::TruncatedConfigSpace {
                offset: PCI_CLASS_OFFSET,
                len: 2,
            })?;
        let kind = if classcode == PCI_CLASS_BRIDGE_PCI {
            PciDeviceKind::Bridge
        } else {
            PciDeviceKind::Endpoint
        };

        let (domain, bus, device, function) = parse_bdf_name(entry)?;
        let bar_mask = parse_bar_masks(root, &dpath)?;
        let caps = parse_capabilities(&config)?;

        let mut dev = PciDevice {
            kind,
            domain,
            bus,
            device,
            function,
            bar_mask,
            caps,
            iommu: None,
            num_msi_vectors: 0,
            msi_64bit: false,
            msi_maskable: false,
            num_msix_vectors: 0,
            msix_region_size: 0,
            msix_address: 0,
            secondary_bus: 0,
            subordinate_bus: 0,
            path: dpath,
        };

        if dev.kind == PciDeviceKind::Bridge {
            dev.secondary_bus = config.get(PCI_SECONDARY_BUS_OFFSET).copied().unwrap_or(0);
            dev.subordinate_bus = config.get(PCI_SUBORDINATE_BUS_OFFSET).copied().unwrap_or(0);
        }

        dev.derive_interrupt_fields();
        Ok(Some(dev))
    }

    fn derive_interrupt_fields(&mut self) {
        for c in &self.caps {
            if c.extended || c.content.len() < 2 {
                continue;
            }
            let msg_ctrl = u16::from_le_bytes([c.content[0], c.content[1]]);
            if c.id == CapId::Msi.raw() as u16 {
                self.num_msi_vectors = 1 << ((msg_ctrl >> 1) & 0x7);
                self.msi_64bit = msg_ctrl & (1 << 7) != 0;
                self.msi_maskable = msg_ctrl & (1 << 8) != 0;
            } else if c.id == CapId::Msix.raw() as u16 {
                if c.msix_address != 0 {
                    let vectors = (msg_ctrl & 0x7ff) + 1;
                    self.num_msix_vectors = vectors;
                    self.msix_region_size = (vectors as u32 * 16).next_multiple_of(0x1000) as u16;
                    self.msix_address = c.msix_address;
                } else {
                    warn!(
                        "ignoring invalid MSI-X configuration of device {:02x}:{:02x}.{:x}",
                        self.bus, self.device, self.function
                    );
                }
            }
        }
    }
}

/// Enumerate all populated PCI functions, sorted by sysfs entry name.
pub fn parse_pci_devices(root: &SysfsRoot) -> Result<Vec<PciDevice>> {
    let mut devices = Vec::new();
    for entry in root.list_dir(PCI_DEVICES_DIR, &["*/config"])? {
        if let Some(d) = PciDevice::parse_sysfs_entry(root, PCI_DEVICES_DIR, &entry)? {
            devices.push(d);
        }
    }
    Ok(devices)
}

fn parse_bdf_name(entry: &str) -> Result<(u16, u8, u8, u8)> {
    let malformed = || PciError::MalformedDeviceDir {
        name: entry.to_string(),
    };

    let mut parts = entry.split(':');
    let domain = parts.next().ok_or_else(malformed)?;
    let bus = parts.next().ok_or_else(malformed)?;
    let devfn = parts.next().ok_or_else(malformed)?;
    let (device, function) = devfn.split_once('.').ok_or_else(malformed)?;

    Ok((
        u16::from_str_radix(domain, 16).map_err(|_| malformed())?,
        u8::from_str_radix(bus, 16).map_err(|_| malformed())?,
        u8::from_str_radix(device, 16).map_err(|_| malformed())?,
        u8::from_str_radix(function, 16).map_err(|_| malformed())?,
    ))
}

/// Decode the 6 BAR size masks from the sysfs `resource` file. 64-bit memory
/// BARs span two register slots; the mask is split into its low and high
/// dwords.
fn parse_bar_masks(root: &SysfsRoot, dpath: &str) -> Result<[u32; 6]> {
    let text = root.read_to_string(&format!("{dpath}/resource"))?;
    let mut lines = text.lines();
    let eof = || PciError::MalformedResourceLine {
        line: String::from("<eof>"),
    };

    let mut mask: Vec<u32> = Vec::with_capacity(6);
    while mask.len() < 6 {
        let (start, end, flags) = parse_resource_line(lines.next().ok_or_else(eof)?)?;

        if flags & IORESOURCE_IO != 0 {
            mask.push(!(end - start) as u32);
        } else if flags & IORESOURCE_MEM != 0 {
            if flags & IORESOURCE_MEM_64 != 0 {
                let mut span = end - start;
                let (start2, end2, _) = parse_resource_line(lines.next().ok_or_else(eof)?)?;
                span |= (end2 - start2) << 32;
                let full = !span;
                mask.push(full as u32);
                mask.push((full >> 32) as u32);
            } else {
                mask.push(!(end - start) as u32);
            }
        } else {
            mask.push(0);
        }
    }

    let mut out = [0u32; 6];
    out.copy_from_slice(&mask[..6]);
    Ok(out)
}

fn parse_resource_line(line: &str) -> Result<(u64, u64, u64)> {
    let malformed = || PciError::MalformedResourceLine {
        line: line.to_string(),
    };
    let parse = |s: &str| {
        u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|_| malformed())
    };

    let mut fields = line.split_whitespace();
    let start = parse(fields.next().ok_or_else(malformed)?)?;
    let end = parse(fields.next().ok_or_else(malformed)?)?;
    let flags = parse(fields.next().ok_or_else(malformed)?)?;
    Ok((start, end, flags))
}
