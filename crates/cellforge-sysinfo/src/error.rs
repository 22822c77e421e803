use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SysinfoError>;

#[derive(Debug, Error)]
pub enum SysinfoError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("\"{0}\" is not a listed input file")]
    NotListed(String),

    #[error("malformed resource line: {line:?}")]
    MalformedLine { line: String },

    #[error("inconsistent indentation at resource line: {line:?}")]
    BadIndentation { line: String },

    #[error("no vendor_id entry in /proc/cpuinfo")]
    MissingCpuVendor,

    #[error("found {0} entries for ACPI PM_TMR (expected 1)")]
    PmTimerEntries(usize),
}
