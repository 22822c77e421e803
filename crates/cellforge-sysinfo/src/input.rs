use std::fs;
use std::io;
use std::path::PathBuf;

use crate::error::{Result, SysinfoError};

/// Host files the discovery passes are allowed to read. Everything else is
/// refused at open time, so a misdirected parser cannot wander off into
/// unrelated parts of the filesystem.
const INPUT_FILES: &[&str] = &[
    "/proc/iomem",
    "/proc/cpuinfo",
    "/proc/cmdline",
    "/proc/ioports",
    "/sys/bus/pci/devices/*/config",
    "/sys/bus/pci/devices/*/resource",
    "/sys/devices/system/cpu/cpu*/uevent",
    "/sys/firmware/acpi/tables/APIC",
    "/sys/firmware/acpi/tables/MCFG",
];

const INPUT_FILES_OPT: &[&str] = &[
    "/sys/class/dmi/id/product_name",
    "/sys/class/dmi/id/sys_vendor",
    "/sys/class/tty/*/iomem_base",
    "/sys/class/tty/*/iomem_reg_shift",
    "/sys/class/tty/*/io_type",
    "/sys/class/tty/*/port",
];

const INPUT_FILES_INTEL: &[&str] = &["/sys/firmware/acpi/tables/DMAR"];
const INPUT_FILES_AMD: &[&str] = &["/sys/firmware/acpi/tables/IVRS"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
    Unknown,
}

impl CpuVendor {
    fn from_vendor_id(s: &str) -> Self {
        match s {
            "GenuineIntel" => CpuVendor::Intel,
            "AuthenticAMD" => CpuVendor::Amd,
            _ => CpuVendor::Unknown,
        }
    }
}

/// Rooted, allowlisted access to the host's resource listings.
///
/// All reads are prefixed with the configured root directory, which lets tests
/// (and offline runs) point the whole engine at a fixture tree instead of the
/// live system.
#[derive(Debug, Clone)]
pub struct SysfsRoot {
    root: PathBuf,
}

impl SysfsRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn check_listed(&self, path: &str) -> Result<()> {
        if INPUT_FILES
            .iter()
            .chain(INPUT_FILES_OPT)
            .any(|p| wildcard_match(p, path))
        {
            return Ok(());
        }
        // Vendor-specific tables are only listed for the matching platform.
        let vendor_files = match self.cpu_vendor().unwrap_or(CpuVendor::Unknown) {
            CpuVendor::Intel => INPUT_FILES_INTEL,
            CpuVendor::Amd => INPUT_FILES_AMD,
            CpuVendor::Unknown => &[],
        };
        if vendor_files.iter().any(|p| wildcard_match(p, path)) {
            return Ok(());
        }
        Err(SysinfoError::NotListed(path.to_string()))
    }

    /// Read a required input file as text.
    pub fn read_to_string(&self, path: &str) -> Result<String> {
        self.check_listed(path)?;
        Ok(fs::read_to_string(self.host_path(path))?)
    }

    /// Read a required input file as raw bytes.
    pub fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        self.check_listed(path)?;
        Ok(fs::read(self.host_path(path))?)
    }

    /// Read an optional input file; a missing file degrades to empty content.
    pub fn read_optional(&self, path: &str) -> Result<String> {
        self.check_listed(path)?;
        match fs::read_to_string(self.host_path(path)) {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("optional input {path} not present");
                Ok(String::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Sorted listing of a directory whose entries will be read through the
    /// given wildcard patterns. Each pattern is itself checked against the
    /// allowlist before anything is touched.
    pub fn list_dir(&self, dir: &str, wildcards: &[&str]) -> Result<Vec<String>> {
        for w in wildcards {
            let joined = format!("{}/{}", dir.trim_end_matches('/'), w);
            self.check_listed(&joined)?;
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(self.host_path(dir))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    /// CPU vendor from the `vendor_id` line of `/proc/cpuinfo`.
    pub fn cpu_vendor(&self) -> Result<CpuVendor> {
        let text = fs::read_to_string(self.host_path("/proc/cpuinfo"))?;
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if key.trim() == "vendor_id" {
                return Ok(CpuVendor::from_vendor_id(value.trim()));
            }
        }
        Err(SysinfoError::MissingCpuVendor)
    }

    /// IDs of the CPUs the kernel exposes under `/sys/devices/system/cpu`.
    pub fn cpu_ids(&self) -> Result<Vec<u32>> {
        let names = self.list_dir("/sys/devices/system/cpu", &["cpu*/uevent"])?;
        let mut ids = Vec::new();
        for name in names {
            let Some(id) = name.strip_prefix("cpu").and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            if self
                .host_path(&format!("/sys/devices/system/cpu/{name}/uevent"))
                .is_file()
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn kernel_cmdline(&self) -> Result<String> {
        self.read_to_string("/proc/cmdline")
    }
}

/// A `memmap=<size>$<start>` kernel command-line carve-out. This is the memory
/// the hypervisor itself will live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemmapReservation {
    pub start: u64,
    pub size: u64,
}

/// Parse the first `memmap=<size>$<start>` option from a kernel command line.
/// Sizes accept the usual K/M/G suffixes; both numbers may be hex.
pub fn memmap_reservation(cmdline: &str) -> Option<MemmapReservation> {
    for opt in cmdline.split_whitespace() {
        let Some(arg) = opt.strip_prefix("memmap=") else {
            continue;
        };
        // Boot loaders escape the separator in various ways.
        let arg = arg.replace("\\$", "$");
        let (size, start) = arg.split_once('$')?;
        let size = parse_mem_value(size)?;
        let start = parse_mem_value(start)?;
        return Some(MemmapReservation { start, size });
    }
    None
}

fn parse_mem_value(s: &str) -> Option<u64> {
    let (num, shift) = match s.as_bytes().last()? {
        b'K' | b'k' => (&s[..s.len() - 1], 10),
        b'M' | b'm' => (&s[..s.len() - 1], 20),
        b'G' | b'g' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let value = if let Some(hex) = num.strip_prefix("0x").or_else(|| num.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()?
    } else {
        num.parse::<u64>().ok()?
    };
    value.checked_shl(shift)
}

/// `fnmatch`-style wildcard matching: `*` matches any run of characters,
/// including path separators.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let mut rest = match name.strip_prefix(parts[0]) {
        Some(r) => r,
        None => return false,
    };
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    let last = parts[parts.len() - 1];
    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture_root(dir: &TempDir, files: &[(&str, &str)]) -> SysfsRoot {
        for (path, content) in files {
            let full = dir.path().join(path.trim_start_matches('/'));
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        SysfsRoot::new(dir.path())
    }

    #[test]
    fn wildcard_matching() {
        assert!(wildcard_match("/proc/iomem", "/proc/iomem"));
        assert!(wildcard_match(
            "/sys/bus/pci/devices/*/config",
            "/sys/bus/pci/devices/0000:00:1f.0/config"
        ));
        assert!(wildcard_match(
            "/sys/devices/system/cpu/cpu*/uevent",
            "/sys/devices/system/cpu/cpu12/uevent"
        ));
        assert!(!wildcard_match(
            "/sys/devices/system/cpu/cpu*/uevent",
            "/sys/devices/system/cpu/cpufreq"
        ));
        assert!(!wildcard_match("/proc/iomem", "/proc/ioports"));
    }

    #[test]
    fn unlisted_path_is_refused() {
        let dir = TempDir::new().unwrap();
        let root = fixture_root(&dir, &[("/etc/passwd", "root:x:0:0\n")]);
        let err = root.read_to_string("/etc/passwd").unwrap_err();
        assert!(matches!(err, SysinfoError::NotListed(_)));
    }

    #[test]
    fn missing_optional_file_degrades_to_empty() {
        let dir = TempDir::new().unwrap();
        let root = SysfsRoot::new(dir.path());
        let text = root.read_optional("/sys/class/dmi/id/product_name").unwrap();
        assert_eq!(text, "");
    }

    #[test]
    fn missing_required_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let root = SysfsRoot::new(dir.path());
        assert!(root.read_to_string("/proc/iomem").is_err());
    }

    #[test]
    fn vendor_table_listed_only_for_matching_platform() {
        let dir = TempDir::new().unwrap();
        let root = fixture_root(
            &dir,
            &[
                ("/proc/cpuinfo", "vendor_id\t: GenuineIntel\n"),
                ("/sys/firmware/acpi/tables/DMAR", "DMAR"),
                ("/sys/firmware/acpi/tables/IVRS", "IVRS"),
            ],
        );
        assert!(root.read_bytes("/sys/firmware/acpi/tables/DMAR").is_ok());
        let err = root.read_bytes("/sys/firmware/acpi/tables/IVRS").unwrap_err();
        assert!(matches!(err, SysinfoError::NotListed(_)));
    }

    #[test]
    fn cpu_vendor_detection() {
        let dir = TempDir::new().unwrap();
        let root = fixture_root(
            &dir,
            &[(
                "/proc/cpuinfo",
                "processor\t: 0\nvendor_id\t: AuthenticAMD\nmodel name\t: test\n",
            )],
        );
        assert_eq!(root.cpu_vendor().unwrap(), CpuVendor::Amd);
    }

    #[test]
    fn cpu_enumeration() {
        let dir = TempDir::new().unwrap();
        let root = fixture_root(
            &dir,
            &[
                ("/sys/devices/system/cpu/cpu0/uevent", ""),
                ("/sys/devices/system/cpu/cpu1/uevent", ""),
                ("/sys/devices/system/cpu/cpu10/uevent", ""),
            ],
        );
        fs::create_dir_all(dir.path().join("sys/devices/system/cpu/cpufreq")).unwrap();
        assert_eq!(root.cpu_ids().unwrap(), vec![0, 1, 10]);
    }

    #[test]
    fn memmap_reservation_parsing() {
        let r = memmap_reservation("quiet memmap=82M$0x3a000000 rw").unwrap();
        assert_eq!(r.size, 82 << 20);
        assert_eq!(r.start, 0x3a000000);

        let r = memmap_reservation("memmap=0x2000000$0x100000000").unwrap();
        assert_eq!(r.size, 0x2000000);
        assert_eq!(r.start, 0x100000000);

        let r = memmap_reservation("memmap=64M\\$0x3b000000").unwrap();
        assert_eq!(r.start, 0x3b000000);

        assert!(memmap_reservation("quiet rw").is_none());
    }
}
