use std::fmt;

/// Standard PCI capability IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapId {
    /// Power Management
    Pm,
    /// Vital Product Data
    Vpd,
    /// Message Signalled Interrupts
    Msi,
    /// HyperTransport
    Ht,
    /// Vendor-specific
    Vndr,
    /// Debug port
    Dbg,
    /// Bridge subsystem vendor/device ID
    Ssvid,
    /// Secure Device
    Secdev,
    /// PCI Express
    Exp,
    /// MSI-X
    Msix,
    /// SATA Data/Index configuration
    Sata,
    /// PCI Advanced Features
    Af,
    Other(u8),
}

impl CapId {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0x01 => CapId::Pm,
            0x03 => CapId::Vpd,
            0x05 => CapId::Msi,
            0x08 => CapId::Ht,
            0x09 => CapId::Vndr,
            0x0a => CapId::Dbg,
            0x0d => CapId::Ssvid,
            0x0f => CapId::Secdev,
            0x10 => CapId::Exp,
            0x11 => CapId::Msix,
            0x12 => CapId::Sata,
            0x13 => CapId::Af,
            other => CapId::Other(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            CapId::Pm => 0x01,
            CapId::Vpd => 0x03,
            CapId::Msi => 0x05,
            CapId::Ht => 0x08,
            CapId::Vndr => 0x09,
            CapId::Dbg => 0x0a,
            CapId::Ssvid => 0x0d,
            CapId::Secdev => 0x0f,
            CapId::Exp => 0x10,
            CapId::Msix => 0x11,
            CapId::Sata => 0x12,
            CapId::Af => 0x13,
            CapId::Other(raw) => raw,
        }
    }
}

impl fmt::Display for CapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapId::Pm => f.write_str("PM"),
            CapId::Vpd => f.write_str("VPD"),
            CapId::Msi => f.write_str("MSI"),
            CapId::Ht => f.write_str("HT"),
            CapId::Vndr => f.write_str("VNDR"),
            CapId::Dbg => f.write_str("DBG"),
            CapId::Ssvid => f.write_str("SSVID"),
            CapId::Secdev => f.write_str("SECDEV"),
            CapId::Exp => f.write_str("EXP"),
            CapId::Msix => f.write_str("MSIX"),
            CapId::Sata => f.write_str("SATA"),
            CapId::Af => f.write_str("AF"),
            CapId::Other(raw) => write!(f, "{raw:#04x}"),
        }
    }
}

/// PCI Express extended capability IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtCapId {
    /// Advanced Error Reporting
    Err,
    /// Virtual Channel
    Vc,
    /// Device Serial Number
    Dsn,
    /// Power Budgeting
    Pwr,
    /// Multi-Function Virtual Channel
    Mfvc,
    /// Virtual Channel (alternate ID when MFVC is present)
    Vc9,
    /// Vendor-specific
    Vndr,
    /// Access Control Services
    Acs,
    /// Alternative Routing-ID Interpretation
    Ari,
    /// Single Root I/O Virtualization
    Sriov,
    /// Multicast
    Mcast,
    /// Latency Tolerance Reporting
    Ltr,
    /// Secondary PCI Express
    Secpci,
    /// Process Address Space ID
    Pasid,
    /// Precision Time Measurement
    Ptm,
    Other(u16),
}

impl ExtCapId {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x01 => ExtCapId::Err,
            0x02 => ExtCapId::Vc,
            0x03 => ExtCapId::Dsn,
            0x04 => ExtCapId::Pwr,
            0x08 => ExtCapId::Mfvc,
            0x09 => ExtCapId::Vc9,
            0x0b => ExtCapId::Vndr,
            0x0d => ExtCapId::Acs,
            0x0e => ExtCapId::Ari,
            0x10 => ExtCapId::Sriov,
            0x12 => ExtCapId::Mcast,
            0x18 => ExtCapId::Ltr,
            0x19 => ExtCapId::Secpci,
            0x1b => ExtCapId::Pasid,
            0x1f => ExtCapId::Ptm,
            other => ExtCapId::Other(other),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            ExtCapId::Err => 0x01,
            ExtCapId::Vc => 0x02,
            ExtCapId::Dsn => 0x03,
            ExtCapId::Pwr => 0x04,
            ExtCapId::Mfvc => 0x08,
            ExtCapId::Vc9 => 0x09,
            ExtCapId::Vndr => 0x0b,
            ExtCapId::Acs => 0x0d,
            ExtCapId::Ari => 0x0e,
            ExtCapId::Sriov => 0x10,
            ExtCapId::Mcast => 0x12,
            ExtCapId::Ltr => 0x18,
            ExtCapId::Secpci => 0x19,
            ExtCapId::Pasid => 0x1b,
            ExtCapId::Ptm => 0x1f,
            ExtCapId::Other(raw) => raw,
        }
    }
}

impl fmt::Display for ExtCapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtCapId::Err => f.write_str("ERR"),
            ExtCapId::Vc => f.write_str("VC"),
            ExtCapId::Dsn => f.write_str("DSN"),
            ExtCapId::Pwr => f.write_str("PWR"),
            ExtCapId::Mfvc => f.write_str("MFVC"),
            ExtCapId::Vc9 => f.write_str("VC9"),
            ExtCapId::Vndr => f.write_str("VNDR"),
            ExtCapId::Acs => f.write_str("ACS"),
            ExtCapId::Ari => f.write_str("ARI"),
            ExtCapId::Sriov => f.write_str("SRIOV"),
            ExtCapId::Mcast => f.write_str("MCAST"),
            ExtCapId::Ltr => f.write_str("LTR"),
            ExtCapId::Secpci => f.write_str("SECPCI"),
            ExtCapId::Pasid => f.write_str("PASID"),
            ExtCapId::Ptm => f.write_str("PTM"),
            ExtCapId::Other(raw) => write!(f, "{raw:#06x}"),
        }
    }
}
