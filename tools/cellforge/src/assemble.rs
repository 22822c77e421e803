use anyhow::{ensure, Result};

use cellforge_acpi::{IommuKind, IommuUnit};
use cellforge_config::{
    ArchPlatform, ArchTag, CellConfig, Console, ConsoleType, IommuConfig, IommuType, Irqchip,
    MemFlags, MemoryRegion, PciCapConfig, PciDeviceConfig, PciType, PioRegion, SystemConfig,
    X86Platform,
};
use cellforge_pci::{AccessPolicy, PciDevice, PciDeviceKind};

use crate::gather::Discovered;

/// Interrupt remapping entries the hypervisor reserves per IOMMU.
const IOMMU_INTERRUPT_LIMIT: u32 = 256;

/// Map the discovery output onto the wire records of the root-cell system
/// configuration.
pub fn assemble(name: &str, d: &Discovered) -> Result<SystemConfig> {
    let memory_regions = d
        .mem_regions
        .iter()
        .map(|r| MemoryRegion {
            phys_start: r.start,
            virt_start: r.start,
            size: r.size(),
            flags: if r.is_ram() {
                MemFlags::ram()
            } else {
                MemFlags::device()
            },
        })
        .collect();

    let irqchips = d
        .ioapics
        .iter()
        .map(|chip| Irqchip {
            address: chip.address as u64,
            id: chip.irqchip_id(),
            pin_base: chip.gsi_base,
            // the root cell starts out owning every pin
            pin_bitmap: [u32::MAX; 4],
        })
        .collect();

    let pio_regions = d
        .port_regions
        .iter()
        .filter(|p| p.permit)
        .map(|p| PioRegion {
            base: p.start as u16,
            length: p.size() as u16,
        })
        .collect();

    let mut pci_devices = Vec::with_capacity(d.devices.len());
    let mut pci_caps = Vec::new();
    for dev in &d.devices {
        pci_devices.push(device_config(dev, pci_caps.len() as u16)?);
        pci_caps.extend(dev.caps.iter().map(|c| PciCapConfig {
            id: c.id,
            extended: c.extended,
            start: c.offset,
            len: c.len,
            moderated: c.access == AccessPolicy::Moderated,
        }));
    }

    let root_cell = CellConfig {
        arch: ArchTag::X86,
        name: name.to_string(),
        flags: 0,
        cpu_set: cpu_bitmap(&d.cpus),
        memory_regions,
        cache_regions: Vec::new(),
        irqchips,
        pio_regions,
        pci_devices,
        pci_caps,
        vpci_irq_base: 0,
        cpu_reset_address: 0,
    };

    Ok(SystemConfig {
        arch: ArchTag::X86,
        flags: 0,
        hypervisor_memory: MemoryRegion {
            phys_start: d.hypervisor.start,
            virt_start: d.hypervisor.start,
            size: d.hypervisor.size,
            flags: MemFlags::empty(),
        },
        console: console_config(d.serial_port),
        mmconfig_base: d.mmconfig.base,
        mmconfig_end_bus: d.mmconfig.end_bus,
        pci_is_virtual: false,
        pci_domain: 0,
        platform: ArchPlatform::X86(X86Platform {
            pm_timer_address: d.pm_timer_base,
            iommu_interrupt_limit: IOMMU_INTERRUPT_LIMIT,
            apic_mode: 0,
            tsc_khz: 0,
            apic_khz: 0,
            iommu_units: d.iommu_units.iter().map(iommu_config).collect(),
        }),
        root_cell,
    })
}

fn device_config(dev: &PciDevice, caps_start: u16) -> Result<PciDeviceConfig> {
    ensure!(
        dev.iommu.is_some() || dev.bdf() == 0,
        "device {:02x}:{:02x}.{:x} has no IOMMU assignment",
        dev.bus,
        dev.device,
        dev.function
    );
    Ok(PciDeviceConfig {
        device_type: match dev.kind {
            PciDeviceKind::Endpoint => PciType::Device,
            PciDeviceKind::Bridge => PciType::Bridge,
        },
        iommu: dev.iommu.unwrap_or(0),
        domain: dev.domain,
        bdf: dev.bdf(),
        bar_mask: dev.bar_mask,
        caps_start,
        num_caps: dev.caps.len() as u16,
        num_msi_vectors: dev.num_msi_vectors,
        msi_64bit: dev.msi_64bit,
        msi_maskable: dev.msi_maskable,
        num_msix_vectors: dev.num_msix_vectors,
        msix_region_size: dev.msix_region_size,
        msix_address: dev.msix_address,
    })
}

fn iommu_config(unit: &IommuUnit) -> IommuConfig {
    let mut config = IommuConfig {
        iommu_type: match unit.kind {
            IommuKind::Intel => IommuType::Intel,
            IommuKind::Amd => IommuType::Amd,
        },
        base: unit.base,
        mmio_size: unit.mmio_size,
        amd_bdf: 0,
        amd_base_cap: 0,
        amd_msi_cap: 0,
        amd_features: 0,
    };
    if let Some(amd) = &unit.amd {
        config.amd_bdf = amd.bdf;
        config.amd_base_cap = amd.base_cap as u8;
        config.amd_msi_cap = amd.msi_cap as u8;
        config.amd_features = amd.features;
    }
    config
}

fn console_config(serial_port: Option<u16>) -> Console {
    match serial_port {
        Some(port) => Console {
            address: port as u64,
            size: 8,
            con_type: ConsoleType::Uart8250,
            flags: 0, // port I/O access
            divider: 0,
            gate: 0,
            clock: 0,
        },
        None => Console::none(),
    }
}

fn cpu_bitmap(cpus: &[u32]) -> Vec<u8> {
    let max = cpus.iter().max().copied().unwrap_or(0);
    let mut bitmap = vec![0u8; max as usize / 8 + 1];
    for &cpu in cpus {
        bitmap[cpu as usize / 8] |= 1 << (cpu % 8);
    }
    bitmap
}
