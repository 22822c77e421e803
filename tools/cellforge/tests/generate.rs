use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const IOMEM: &str = "\
00001000-0009ffff : System RAM
000c0000-000c7fff : Video ROM
00100000-3fffffff : System RAM
  01000000-01a02fff : Kernel code
  01a03000-01ee57ff : Kernel data
fec00000-fec003ff : IOAPIC 0
fed90000-fed90fff : dmar0
";

const IOPORTS: &str = "\
0040-0043 : timer0
0060-0060 : keyboard
0070-0071 : rtc0
03f8-03ff : serial
0408-040b : ACPI PM_TMR
0cf8-0cff : PCI conf1
";

fn write(root: &Path, path: &str, content: &[u8]) {
    let full = root.join(path);
    fs::create_dir_all(full.parent().unwrap()).unwrap();
    fs::write(full, content).unwrap();
}

fn madt() -> Vec<u8> {
    let mut table = vec![0u8; 44];
    table[0..4].copy_from_slice(b"APIC");
    // one I/O APIC at the standard address
    table.extend_from_slice(&[1, 12, 0, 0]);
    table.extend_from_slice(&0xfec0_0000u32.to_le_bytes());
    table.extend_from_slice(&0u32.to_le_bytes());
    let len = table.len() as u32;
    table[4..8].copy_from_slice(&len.to_le_bytes());
    table
}

fn mcfg() -> Vec<u8> {
    let mut table = vec![0u8; 44];
    table[0..4].copy_from_slice(b"MCFG");
    table.extend_from_slice(&0xb000_0000u64.to_le_bytes());
    table.extend_from_slice(&0u16.to_le_bytes()); // segment
    table.push(0); // start bus
    table.push(0xff); // end bus
    table.extend_from_slice(&[0u8; 4]);
    let len = table.len() as u32;
    table[4..8].copy_from_slice(&len.to_le_bytes());
    table
}

fn dmar() -> Vec<u8> {
    let mut table = vec![0u8; 48];
    table[0..4].copy_from_slice(b"DMAR");
    // one DRHD covering all devices
    table.extend_from_slice(&0u16.to_le_bytes()); // type
    table.extend_from_slice(&16u16.to_le_bytes()); // length
    table.push(1); // INCLUDE_PCI_ALL
    table.push(0);
    table.extend_from_slice(&0u16.to_le_bytes()); // segment
    table.extend_from_slice(&0xfed9_0000u64.to_le_bytes());
    let len = table.len() as u32;
    table[4..8].copy_from_slice(&len.to_le_bytes());
    table
}

fn pci_config(class: u16, with_msi: bool) -> Vec<u8> {
    let mut config = vec![0u8; 256];
    config[0..4].copy_from_slice(&0x1234_8086u32.to_le_bytes());
    config[0x0a..0x0c].copy_from_slice(&class.to_le_bytes());
    if with_msi {
        config[0x06] = 0x10; // capability list present
        config[0x34] = 0x50;
        config[0x50] = 0x05; // MSI
        let msg_ctrl: u16 = 1 << 7; // 64-bit
        config[0x52..0x54].copy_from_slice(&msg_ctrl.to_le_bytes());
    }
    config
}

fn fixture() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    write(root, "proc/iomem", IOMEM.as_bytes());
    write(root, "proc/ioports", IOPORTS.as_bytes());
    write(root, "proc/cpuinfo", b"processor\t: 0\nvendor_id\t: GenuineIntel\n");
    write(
        root,
        "proc/cmdline",
        b"BOOT_IMAGE=/boot/vmlinuz root=/dev/sda1 memmap=66M$0x3a000000\n",
    );

    write(root, "sys/devices/system/cpu/cpu0/uevent", b"");
    write(root, "sys/devices/system/cpu/cpu1/uevent", b"");

    let zero_bar = "0x0000000000000000 0x0000000000000000 0x0000000000000000\n".repeat(13);
    write(
        root,
        "sys/bus/pci/devices/0000:00:00.0/config",
        &pci_config(0x0600, false),
    );
    write(
        root,
        "sys/bus/pci/devices/0000:00:00.0/resource",
        zero_bar.as_bytes(),
    );
    write(
        root,
        "sys/bus/pci/devices/0000:00:1f.6/config",
        &pci_config(0x0200, true),
    );
    write(
        root,
        "sys/bus/pci/devices/0000:00:1f.6/resource",
        zero_bar.as_bytes(),
    );

    write(root, "sys/firmware/acpi/tables/APIC", &madt());
    write(root, "sys/firmware/acpi/tables/MCFG", &mcfg());
    write(root, "sys/firmware/acpi/tables/DMAR", &dmar());

    write(root, "sys/class/tty/ttyS0/port", b"0x3f8\n");

    dir
}

#[test]
fn generate_and_inspect_round_trip() {
    let fixture = fixture();
    let out = fixture.path().join("system.cell");

    Command::cargo_bin("cellforge")
        .unwrap()
        .args(["generate", "--name", "demo"])
        .arg("--root")
        .arg(fixture.path())
        .arg("--out")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote"));

    Command::cargo_bin("cellforge")
        .unwrap()
        .arg("inspect")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("System configuration (x86)"))
        .stdout(predicate::str::contains("IOMMU unit 0:      Intel at 0xfed90000"))
        .stdout(predicate::str::contains("PM timer port:     0x408"))
        .stdout(predicate::str::contains("Cell \"demo\" (x86)"))
        .stdout(predicate::str::contains("CPU set: 0, 1"))
        .stdout(predicate::str::contains("8250 UART"));
}

#[test]
fn generated_blob_decodes_with_expected_topology() {
    let fixture = fixture();
    let out = fixture.path().join("system.cell");

    Command::cargo_bin("cellforge")
        .unwrap()
        .args(["generate", "--name", "demo"])
        .arg("--root")
        .arg(fixture.path())
        .arg("--out")
        .arg(&out)
        .assert()
        .success();

    let blob = fs::read(&out).unwrap();
    let system = cellforge_config::SystemConfig::decode(&blob).unwrap();

    assert_eq!(system.hypervisor_memory.phys_start, 0x3a00_0000);
    assert_eq!(system.hypervisor_memory.size, 66 << 20);
    assert_eq!(system.mmconfig_base, 0xb000_0000);
    assert_eq!(system.mmconfig_end_bus, 0xff);

    let cell = &system.root_cell;
    assert_eq!(cell.name, "demo");
    assert_eq!(cell.cpu_set, vec![0x03]);

    // first page unhidden, kernel split kept, ROM placeholder appended
    let spans: Vec<(u64, u64)> = cell
        .memory_regions
        .iter()
        .map(|r| (r.phys_start, r.size))
        .collect();
    assert_eq!(
        spans,
        [
            (0, 0xa0000),
            (0x100000, 0xf00000),
            (0x1000000, 0x1000000),
            (0x2000000, 0x3e000000),
            (0xc0000, 0x20000),
        ]
    );

    // both devices covered by the include-all unit
    assert_eq!(cell.pci_devices.len(), 2);
    assert!(cell.pci_devices.iter().all(|d| d.iommu == 0));
    let nic = &cell.pci_devices[1];
    assert_eq!(nic.bdf, 0x1f << 3 | 6);
    assert_eq!(nic.num_msi_vectors, 1);
    assert!(nic.msi_64bit);
    assert_eq!(cell.pci_caps.len(), 1);
    assert_eq!(cell.pci_caps[0].id, 0x05);

    // PM_TMR itself is not permitted; the legacy whitelist and serial are
    let bases: Vec<u16> = cell.pio_regions.iter().map(|p| p.base).collect();
    assert_eq!(bases, [0x40, 0x60, 0x70, 0x3f8]);

    assert_eq!(cell.irqchips.len(), 1);
    assert_eq!(cell.irqchips[0].address, 0xfec0_0000);
}
