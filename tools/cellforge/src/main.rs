#![forbid(unsafe_code)]

mod assemble;
mod gather;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cellforge_config::{CellConfig, SystemConfig, SYSTEM_SIGNATURE};
use cellforge_sysinfo::SysfsRoot;

#[derive(Parser, Debug)]
#[command(
    name = "cellforge",
    about = "Discover the machine's hardware topology and generate the root-cell \
             configuration for a partitioning hypervisor."
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Gather the hardware topology and write the system configuration blob
    Generate {
        /// Directory the host resource files are read from
        #[arg(long, default_value = "/", value_name = "DIR")]
        root: PathBuf,

        /// Name of the root cell
        #[arg(long, default_value = "root-cell")]
        name: String,

        /// Output file
        #[arg(short, long, value_name = "PATH")]
        out: PathBuf,
    },
    /// Decode a configuration blob and pretty-print its contents
    Inspect {
        /// System or cell configuration file
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match Args::parse().command {
        Command::Generate { root, name, out } => generate(&root, &name, &out),
        Command::Inspect { file } => inspect(&file),
    }
}

fn generate(root: &Path, name: &str, out: &Path) -> Result<()> {
    let root = SysfsRoot::new(root);
    let discovered = gather::gather(&root)?;
    let system = assemble::assemble(name, &discovered)?;
    let blob = system.encode().context("encoding the system configuration")?;
    fs::write(out, &blob).with_context(|| format!("writing {}", out.display()))?;
    println!("wrote {} bytes to {}", blob.len(), out.display());
    Ok(())
}

fn inspect(file: &Path) -> Result<()> {
    let data = fs::read(file).with_context(|| format!("reading {}", file.display()))?;

    if data.starts_with(SYSTEM_SIGNATURE) {
        let system = SystemConfig::decode(&data)
            .with_context(|| format!("decoding {}", file.display()))?;
        print_system(&system);
    } else {
        let cell = CellConfig::decode(&data)
            .with_context(|| format!("decoding {}", file.display()))?;
        print_cell(&cell);
    }
    Ok(())
}

fn print_system(system: &SystemConfig) {
    println!("System configuration ({})", system.arch.name());
    println!(
        "  hypervisor memory: {:#x} ({:#x} bytes)",
        system.hypervisor_memory.phys_start, system.hypervisor_memory.size
    );
    println!(
        "  console:           {} at {:#x}",
        system.console.con_type.name(),
        system.console.address
    );
    println!(
        "  PCI MMCONFIG:      {:#x}, end bus {:#x}, domain {}",
        system.mmconfig_base, system.mmconfig_end_bus, system.pci_domain
    );

    if let cellforge_config::ArchPlatform::X86(platform) = &system.platform {
        println!("  PM timer port:     {:#x}", platform.pm_timer_address);
        for (i, unit) in platform.iommu_units.iter().enumerate() {
            println!(
                "  IOMMU unit {i}:      {} at {:#x} ({:#x} bytes)",
                unit.iommu_type.name(),
                unit.base,
                unit.mmio_size
            );
        }
    }

    println!();
    print_cell(&system.root_cell);
}

fn print_cell(cell: &CellConfig) {
    println!("Cell \"{}\" ({})", cell.name, cell.arch.name());
    println!("  CPU set: {}", format_cpu_set(&cell.cpu_set));

    println!("  memory regions:");
    for region in &cell.memory_regions {
        println!(
            "    {:#012x}..{:#012x} ({:#x} bytes) {}",
            region.phys_start,
            region.phys_start + region.size,
            region.size,
            region.flags.names().join(" | ")
        );
    }

    println!("  irqchips:");
    for chip in &cell.irqchips {
        println!(
            "    id {:#x} at {:#x}, pin base {}",
            chip.id, chip.address, chip.pin_base
        );
    }

    println!("  I/O port regions:");
    for pio in &cell.pio_regions {
        println!(
            "    {:#06x}..{:#06x}",
            pio.base,
            pio.base as u32 + pio.length as u32
        );
    }

    println!("  PCI devices:");
    for dev in &cell.pci_devices {
        println!(
            "    {:04x}:{:02x}:{:02x}.{:x} {} iommu {} caps {}..{}",
            dev.domain,
            dev.bdf >> 8,
            (dev.bdf >> 3) & 0x1f,
            dev.bdf & 0x7,
            dev.device_type.name(),
            dev.iommu,
            dev.caps_start,
            dev.caps_start + dev.num_caps
        );
    }
}

fn format_cpu_set(bitmap: &[u8]) -> String {
    let mut cpus = Vec::new();
    for (byte_index, byte) in bitmap.iter().enumerate() {
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                cpus.push((byte_index * 8 + bit).to_string());
            }
        }
    }
    cpus.join(", ")
}
