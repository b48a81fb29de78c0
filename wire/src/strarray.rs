//! Bounded, NUL-joined string arrays and single strings embedded in a fixed-size wire record.

use anyhow::{bail, Result};

/// A bounded list of strings, stored as a count plus a fixed-capacity buffer of NUL-joined
/// bytes. `import` fails deterministically (no partial state) if the joined strings do not fit;
/// `export` is the exact inverse for any array that was successfully imported.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct StringArray<const N: usize> {
    count: u32,
    len: u32,
    buf: [u8; N],
}

impl<const N: usize> StringArray<N> {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    /// Replaces the contents with `items`, joined by NUL bytes. Fails if the joined length
    /// exceeds the buffer capacity; on failure `self` is left unchanged.
    pub fn import<S: AsRef<str>>(&mut self, items: &[S]) -> Result<()> {
        let mut total = 0usize;
        for item in items {
            total += item.as_ref().len() + 1; // +1 for the joining NUL
        }
        if total > N {
            bail!("too much data: {total} bytes exceeds capacity {N}");
        }

        let mut buf = [0u8; N];
        let mut offset = 0usize;
        for item in items {
            let bytes = item.as_ref().as_bytes();
            buf[offset..offset + bytes.len()].copy_from_slice(bytes);
            offset += bytes.len() + 1; // leave the NUL in place
        }

        self.count = items.len() as u32;
        self.len = total as u32;
        self.buf = buf;
        Ok(())
    }

    /// Splits the buffer back into `count` strings. Invalid UTF-8 inside the buffer, or a `len`
    /// that claims more than the buffer's own capacity, is a protocol error: both peers only ever
    /// write values that came out of a successful `import`, so anything else means the bytes on
    /// the wire were never produced by this code (corruption, or a non-conforming peer).
    pub fn export(&self) -> Result<Vec<String>> {
        if self.len as usize > N {
            bail!("wire: string array len {} exceeds capacity {N}", self.len);
        }
        let mut out = Vec::with_capacity(self.count as usize);
        let mut offset = 0usize;
        for _ in 0..self.count {
            let nul = self.buf[offset..self.len as usize]
                .iter()
                .position(|&b| b == 0)
                .map(|p| offset + p)
                .ok_or_else(|| anyhow::anyhow!("wire: string array missing NUL terminator"))?;
            let s = std::str::from_utf8(&self.buf[offset..nul])?;
            out.push(s.to_string());
            offset = nul + 1;
        }
        Ok(out)
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// A single bounded string (account name, working directory): a length plus a fixed-capacity
/// byte buffer, no NUL terminator required.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FixedStr<const N: usize> {
    len: u32,
    buf: [u8; N],
}

impl<const N: usize> FixedStr<N> {
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }

    pub fn import(&mut self, s: &str) -> Result<()> {
        if s.len() > N {
            bail!("too much data: {} bytes exceeds capacity {N}", s.len());
        }
        let mut buf = [0u8; N];
        buf[..s.len()].copy_from_slice(s.as_bytes());
        self.len = s.len() as u32;
        self.buf = buf;
        Ok(())
    }

    pub fn export(&self) -> Result<String> {
        if self.len as usize > N {
            bail!("wire: string len {} exceeds capacity {N}", self.len);
        }
        Ok(std::str::from_utf8(&self.buf[..self.len as usize])?.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_array_round_trips() {
        let mut arr: StringArray<64> = StringArray::zeroed();
        let items = vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()];
        arr.import(&items).unwrap();
        assert_eq!(arr.export().unwrap(), items);
    }

    #[test]
    fn string_array_rejects_oversize_input() {
        let mut arr: StringArray<4> = StringArray::zeroed();
        let before = arr;
        assert!(arr.import(&["too long for four bytes"]).is_err());
        assert_eq!(arr.count(), before.count());
    }

    #[test]
    fn fixed_str_round_trips() {
        let mut s: FixedStr<32> = FixedStr::zeroed();
        s.import("alice").unwrap();
        assert_eq!(s.export().unwrap(), "alice");
        assert!(!s.is_empty());
    }

    #[test]
    fn fixed_str_empty_by_default() {
        let s: FixedStr<32> = FixedStr::zeroed();
        assert!(s.is_empty());
        assert_eq!(s.export().unwrap(), "");
    }

    #[test]
    fn fixed_str_rejects_out_of_range_len() {
        let mut s: FixedStr<8> = FixedStr::zeroed();
        s.import("ok").unwrap();
        s.len = 9999; // simulates bytes from an untrusted or corrupt peer
        assert!(s.export().is_err());
    }

    #[test]
    fn string_array_rejects_out_of_range_len() {
        let mut arr: StringArray<8> = StringArray::zeroed();
        arr.import(&["ok"]).unwrap();
        arr.len = 9999;
        assert!(arr.export().is_err());
    }
}
