use bitflags::bitflags;

bitflags! {
    /// Access flags of a cell memory region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemFlags: u64 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const EXECUTE = 0x0004;
        const DMA = 0x0008;
        const IO = 0x0010;
        const COMM_REGION = 0x0020;
        const LOADABLE = 0x0040;
        const ROOTSHARED = 0x0080;
    }
}

impl MemFlags {
    /// The flag set granted to RAM-like regions.
    pub fn ram() -> Self {
        MemFlags::READ | MemFlags::WRITE | MemFlags::EXECUTE | MemFlags::DMA
    }

    /// The flag set granted to device regions.
    pub fn device() -> Self {
        MemFlags::READ | MemFlags::WRITE
    }

    /// Decompose into named flags, scanning bits from the highest down.
    pub fn names(self) -> Vec<&'static str> {
        let mut value = self.bits();
        let mut names = Vec::new();
        while value != 0 {
            let mask = 1u64 << (63 - value.leading_zeros());
            if let Some(name) = flag_name(mask) {
                names.push(name);
            }
            value &= !mask;
        }
        names
    }
}

fn flag_name(mask: u64) -> Option<&'static str> {
    Some(match MemFlags::from_bits(mask)? {
        f if f == MemFlags::READ => "READ",
        f if f == MemFlags::WRITE => "WRITE",
        f if f == MemFlags::EXECUTE => "EXECUTE",
        f if f == MemFlags::DMA => "DMA",
        f if f == MemFlags::IO => "IO",
        f if f == MemFlags::COMM_REGION => "COMM_REGION",
        f if f == MemFlags::LOADABLE => "LOADABLE",
        f if f == MemFlags::ROOTSHARED => "ROOTSHARED",
        _ => return None,
    })
}
