use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("not a cell configuration")]
    NotACellConfig,

    #[error("not a system configuration")]
    NotASystemConfig,

    #[error("configuration revision mismatch (found {found}, expected {expected})")]
    RevisionMismatch { found: u16, expected: u16 },

    #[error("cell name longer than {max} bytes")]
    NameTooLong { max: usize },

    #[error("cell name is not valid UTF-8")]
    BadName,

    #[error("unknown architecture tag {0}")]
    UnknownArch(u8),

    #[error("unknown IOMMU type {0}")]
    UnknownIommuType(u32),

    #[error("unknown console type {0}")]
    UnknownConsoleType(u16),

    #[error("too many IOMMU units ({0}, at most 8 fit the system record)")]
    TooManyIommuUnits(usize),

    #[error("corrupt configuration: {0}")]
    Corrupt(&'static str),
}
