use thiserror::Error;

use cellforge_sysinfo::SysinfoError;

pub type Result<T> = std::result::Result<T, PciError>;

#[derive(Debug, Error)]
pub enum PciError {
    #[error(transparent)]
    Sysinfo(#[from] SysinfoError),

    #[error("config space read of {len} bytes at {offset:#x} past end of buffer")]
    TruncatedConfigSpace { offset: usize, len: usize },

    #[error("invalid MSI-X BAR found")]
    InvalidMsixBar,

    #[error("malformed BAR resource line: {line:?}")]
    MalformedResourceLine { line: String },

    #[error("malformed PCI device directory name: {name:?}")]
    MalformedDeviceDir { name: String },
}
