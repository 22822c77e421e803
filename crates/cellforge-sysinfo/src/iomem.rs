use crate::error::Result;
use crate::input::SysfsRoot;
use crate::region::{MemRegion, MsixWindow};
use crate::tree::{NodeId, ResourceTree};

/// The legacy VGA aperture. The PCI bus placeholder that starts here is the
/// one placeholder we keep: dropping it would hide the aperture itself.
pub const VGA_APERTURE_BASE: u64 = 0xa0000;

const ROM_WINDOW_START: u64 = 0xc0000;
const ROM_WINDOW_STOP: u64 = 0xdffff;

/// Parse `/proc/iomem` into the flat memory map plus the side list of
/// kernel-reported DMA-remapping regions (needed later to size the Intel
/// IOMMU MMIO windows).
pub fn parse_iomem(
    root: &SysfsRoot,
    msix_windows: &[MsixWindow],
) -> Result<(Vec<MemRegion>, Vec<MemRegion>)> {
    let text = root.read_to_string("/proc/iomem")?;
    let tree = ResourceTree::parse(&text)?;
    Ok(classify(&tree, msix_windows))
}

fn classify(tree: &ResourceTree, msix_windows: &[MsixWindow]) -> (Vec<MemRegion>, Vec<MemRegion>) {
    let regions = walk(tree, ResourceTree::ROOT);

    let rom_region = MemRegion::new(ROM_WINDOW_START, ROM_WINDOW_STOP, "ROMs");
    let mut add_rom_region = false;

    let mut ret: Vec<MemRegion> = Vec::new();
    let mut dmar_regions: Vec<MemRegion> = Vec::new();

    for r in regions {
        // Skip empty PCI bus placeholders so they don't have to be
        // intercepted once devices show up on them. Exception: VGA.
        if r.kind.starts_with("PCI Bus") && r.start != VGA_APERTURE_BASE {
            continue;
        }

        let mut append_r = true;

        // Carve MSI-X doorbell windows out of whatever region contains them.
        for w in msix_windows {
            if r.start <= w.address && w.address <= r.stop {
                if w.address > r.start {
                    ret.push(MemRegion::with_comments(
                        r.start,
                        w.address - 1,
                        r.kind.clone(),
                        r.comments.clone(),
                    ));
                }
                if w.address + w.size < r.stop {
                    ret.push(MemRegion::with_comments(
                        w.address + w.size,
                        r.stop,
                        r.kind.clone(),
                        r.comments.clone(),
                    ));
                }
                append_r = false;
                break;
            }
        }

        // Legacy option-ROM shadows collapse into one synthetic region.
        if r.start >= rom_region.start && r.stop <= rom_region.stop {
            add_rom_region = true;
            append_r = false;
        }

        // DMA-remapping reservations leave the map but feed the side list.
        if r.kind.contains("dmar") {
            dmar_regions.push(r.clone());
            append_r = false;
        }
        if r.kind.contains("amd_iommu") {
            append_r = false;
        }

        // Coalesce contiguous RAM. The kernel carve-out stays its own region.
        if append_r {
            if let Some(prev) = ret.last_mut() {
                if prev.is_ram()
                    && r.is_ram()
                    && prev.stop + 1 == r.start
                    && prev.kind != "Kernel"
                    && r.kind != "Kernel"
                {
                    prev.stop = r.stop;
                    append_r = false;
                }
            }
        }

        if append_r {
            ret.push(r);
        }
    }

    if add_rom_region {
        ret.push(rom_region);
    }

    // Newer kernels report the first page as reserved. It is needed for CPU
    // init, so include it anyway.
    if let Some(first) = ret.first_mut() {
        if first.kind == "System RAM" && first.start == 0x1000 {
            first.start = 0;
        }
    }

    (ret, dmar_regions)
}

/// One pass over a subtree: split RAM around the kernel, blacklist MMCONFIG
/// and APIC pages, drop childless "reserved" entries, keep the rest.
fn walk(tree: &ResourceTree, id: NodeId) -> Vec<MemRegion> {
    let mut regions = Vec::new();

    for &child in tree.children(id) {
        let node = tree.node(child);
        let Some(raw) = &node.region else {
            continue;
        };

        // Top-level System RAM is taken whole unless it contains the kernel,
        // in which case it gets split around it.
        if node.level == 1 && raw.label == "System RAM" {
            regions.extend(split_by_kernel(tree, child));
            continue;
        }

        // Blacklisted on all levels; covers both APIC and IOAPIC.
        if raw.label.contains("PCI MMCONFIG") || raw.label.contains("APIC") {
            continue;
        }

        if !node.children.is_empty() {
            regions.extend(walk(tree, child));
            continue;
        }

        if raw.label.eq_ignore_ascii_case("reserved") {
            continue;
        }

        regions.push(MemRegion::new(raw.start, raw.stop, raw.label.clone()));
    }

    regions
}

fn split_by_kernel(tree: &ResourceTree, id: NodeId) -> Vec<MemRegion> {
    let node = tree.node(id);
    let raw = node.region.as_ref().expect("RAM node has a region");

    let kernel: Vec<_> = node
        .children
        .iter()
        .filter_map(|&c| tree.node(c).region.as_ref())
        .filter(|r| r.label.starts_with("Kernel"))
        .collect();

    let Some(first) = kernel.first() else {
        return vec![MemRegion::new(raw.start, raw.stop, raw.label.clone())];
    };

    let kernel_start = first.start;
    // Round the kernel span up to the next 16 MiB boundary, but never past
    // the end of the surrounding RAM.
    let mut kernel_stop = (kernel.last().unwrap().stop & !0xff_ffff) + 0xff_ffff;
    if kernel_stop > raw.stop {
        kernel_stop = raw.stop;
    }

    let mut result = Vec::new();
    if raw.start < kernel_start {
        result.push(MemRegion::new(raw.start, kernel_start - 1, raw.label.clone()));
    }
    result.push(MemRegion::new(kernel_start, kernel_stop, "Kernel"));
    if raw.stop > kernel_stop {
        result.push(MemRegion::new(kernel_stop + 1, raw.stop, raw.label.clone()));
    }

    result
}
