use crate::error::{AcpiError, Result};

/// Bounds-checked little-endian field access over a raw table blob. Any read
/// past the end of the buffer is a format error naming the table.
pub(crate) struct TableReader<'a> {
    table: &'static str,
    buf: &'a [u8],
}

impl<'a> TableReader<'a> {
    pub fn new(table: &'static str, buf: &'a [u8]) -> Self {
        Self { table, buf }
    }

    fn truncated(&self, offset: usize) -> AcpiError {
        AcpiError::Truncated {
            table: self.table,
            offset,
        }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn u8(&self, offset: usize) -> Result<u8> {
        self.buf
            .get(offset)
            .copied()
            .ok_or_else(|| self.truncated(offset))
    }

    pub fn u16(&self, offset: usize) -> Result<u16> {
        let b = self
            .buf
            .get(offset..offset + 2)
            .ok_or_else(|| self.truncated(offset))?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&self, offset: usize) -> Result<u32> {
        let b = self
            .buf
            .get(offset..offset + 4)
            .ok_or_else(|| self.truncated(offset))?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&self, offset: usize) -> Result<u64> {
        let b = self
            .buf
            .get(offset..offset + 8)
            .ok_or_else(|| self.truncated(offset))?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Validate the 4-byte table signature and return the declared length.
    pub fn header(&self, signature: &[u8; 4]) -> Result<usize> {
        let found = self.buf.get(0..4).ok_or_else(|| self.truncated(0))?;
        if found != signature {
            return Err(AcpiError::BadSignature { table: self.table });
        }
        Ok(self.u32(4)? as usize)
    }
}
