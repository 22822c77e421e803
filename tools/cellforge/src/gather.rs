use anyhow::{bail, Context, Result};
use tracing::info;

use cellforge_acpi::{parse_madt, parse_mcfg, scan_iommus, IoApic, IommuUnit, Mmconfig};
use cellforge_pci::{parse_pci_devices, PciDevice};
use cellforge_sysinfo::{
    memmap_reservation, parse_iomem, parse_ioports, MemRegion, MemmapReservation, MsixWindow,
    PortRegion, SysfsRoot,
};

/// Everything the discovery passes learn about the machine, in the shape the
/// assembler consumes.
pub struct Discovered {
    pub devices: Vec<PciDevice>,
    pub ioapics: Vec<IoApic>,
    pub mem_regions: Vec<MemRegion>,
    pub port_regions: Vec<PortRegion>,
    pub pm_timer_base: u16,
    pub mmconfig: Mmconfig,
    pub iommu_units: Vec<IommuUnit>,
    pub cpus: Vec<u32>,
    pub hypervisor: MemmapReservation,
    pub serial_port: Option<u16>,
}

/// Run the strictly ordered discovery pipeline against a (possibly
/// redirected) host filesystem root.
pub fn gather(root: &SysfsRoot) -> Result<Discovered> {
    let mut devices = parse_pci_devices(root).context("enumerating PCI devices")?;
    info!("found {} PCI functions", devices.len());
    let msix_windows: Vec<MsixWindow> = devices.iter().filter_map(|d| d.msix_window()).collect();

    let (mut mem_regions, dmar_side) =
        parse_iomem(root, &msix_windows).context("parsing the physical memory map")?;
    let (port_regions, pm_timer_base) =
        parse_ioports(root).context("parsing the I/O port map")?;

    let mut ioapics = parse_madt(root).context("parsing the ACPI MADT")?;
    let mmconfig = parse_mcfg(root).context("parsing the ACPI MCFG")?;

    let vendor = root.cpu_vendor().context("detecting the CPU vendor")?;
    let (iommu_units, reserved) =
        scan_iommus(root, vendor, &mut devices, &mut ioapics, &dmar_side)
            .context("parsing the DMA-remapping tables")?;
    info!(
        "{} IOMMU unit(s), {} table-reported reserved region(s)",
        iommu_units.len(),
        reserved.len()
    );
    // Table-reported reservations are appended after the regular map.
    mem_regions.extend(reserved);

    let cpus = root.cpu_ids().context("enumerating CPUs")?;
    if cpus.is_empty() {
        bail!("no CPUs found under /sys/devices/system/cpu");
    }

    let cmdline = root.kernel_cmdline().context("reading the kernel command line")?;
    let Some(hypervisor) = memmap_reservation(&cmdline) else {
        bail!(
            "no memmap=<size>$<start> reservation on the kernel command line; \
             the hypervisor needs a dedicated memory carve-out"
        );
    };

    Ok(Discovered {
        serial_port: serial_port(root),
        devices,
        ioapics,
        mem_regions,
        port_regions,
        pm_timer_base,
        mmconfig,
        iommu_units,
        cpus,
        hypervisor,
    })
}

/// Base port of the first serial console, from the optional tty metadata.
fn serial_port(root: &SysfsRoot) -> Option<u16> {
    let text = root.read_optional("/sys/class/tty/ttyS0/port").ok()?;
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    u16::from_str_radix(text.trim_start_matches("0x"), 16).ok()
}
