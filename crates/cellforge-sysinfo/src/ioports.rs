use crate::error::{Result, SysinfoError};
use crate::input::SysfsRoot;
use crate::region::PortRegion;
use crate::tree::{NodeId, RawRegion, ResourceTree};

const PCI_CONFIG_PORT: u64 = 0xcf8;
const PORT_CLASSIFY_LIMIT: u64 = 0xd00;

/// Legacy device ports the root cell may keep.
const PORT_WHITELIST: &[u64] = &[
    0x40,  // PIT
    0x60,  // keyboard
    0x61,  // NMI status/control
    0x64,  // i8042
    0x70,  // RTC
    0x2f8, // serial
    0x3f8, // serial
];

/// Parse `/proc/ioports` into the permitted/denied port map plus the ACPI
/// PM-timer base port.
pub fn parse_ioports(root: &SysfsRoot) -> Result<(Vec<PortRegion>, u16)> {
    let text = root.read_to_string("/proc/ioports")?;
    let tree = ResourceTree::parse(&text)?;
    classify(&tree)
}

fn classify(tree: &ResourceTree) -> Result<(Vec<PortRegion>, u16)> {
    let pm_timer = tree.find_by_name("ACPI PM_TMR");
    if pm_timer.len() != 1 {
        return Err(SysinfoError::PmTimerEntries(pm_timer.len()));
    }
    let pm_timer_base = pm_timer[0].start as u16;

    let mut ports: Vec<PortRegion> = tree
        .leaves()
        .into_iter()
        // Never expose the PCI config-space ports, and drop everything above
        // the legacy range.
        .filter(|r| r.start != PCI_CONFIG_PORT && r.start < PORT_CLASSIFY_LIMIT)
        .map(|r| PortRegion::new(r.start, r.stop, r.label.clone()))
        .collect();

    for r in &mut ports {
        let label = r.kind.to_ascii_lowercase();
        if PORT_WHITELIST.contains(&r.start) || label.contains("vga") || label.contains("vesa") {
            r.permit = true;
        }
    }

    // PCI-device-owned ranges above the legacy limit are handed back to the
    // root cell; below it the leaves already cover them (not permitted).
    let mut pci_ports = Vec::new();
    search_pci_devices(tree, ResourceTree::ROOT, &mut pci_ports);
    for r in pci_ports {
        if r.start >= PORT_CLASSIFY_LIMIT {
            let mut port = PortRegion::new(r.start, r.stop, r.label.clone());
            port.permit = true;
            ports.push(port);
        }
    }

    ports.sort_by_key(|r| r.start);
    Ok((ports, pm_timer_base))
}

/// Collect subtrees whose label is a PCI `dddd:bb:dd.f` function address.
/// A match claims the whole subtree; everything else recurses.
fn search_pci_devices<'a>(tree: &'a ResourceTree, id: NodeId, out: &mut Vec<&'a RawRegion>) {
    let node = tree.node(id);
    match &node.region {
        Some(r) if is_bdf_label(&r.label) => out.push(r),
        _ => {
            for &child in &node.children {
                search_pci_devices(tree, child, out);
            }
        }
    }
}

fn is_bdf_label(label: &str) -> bool {
    let b = label.as_bytes();
    let word = |c: u8| c.is_ascii_alphanumeric() || c == b'_';
    b.len() >= 12
        && b[..4].iter().all(|&c| word(c))
        && b[4] == b':'
        && b[5..7].iter().all(|&c| word(c))
        && b[7] == b':'
        && b[8..10].iter().all(|&c| word(c))
        && b[10] == b'.'
        && word(b[11])
}
