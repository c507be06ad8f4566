//! Building blocks shared by every container in the image: bounds-checked
//! big-endian access and count-prefixed offset tables.

use byteorder::{BigEndian, ByteOrder};

use crate::{RomError, Result};

/// Shape of one count-prefixed offset table.
///
/// Some tables in the image append one extra offset after the last entry
/// that marks the end of the final payload; others stop at `count`. Payload
/// starts are rounded up to `align` bytes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TableLayout {
    pub sentinel: bool,
    pub align: usize,
}

impl TableLayout {
    pub const STRINGS: TableLayout = TableLayout {
        sentinel: false,
        align: 2,
    };
    pub const FS_DIRS: TableLayout = TableLayout {
        sentinel: true,
        align: 4,
    };
    pub const FS_FILES: TableLayout = TableLayout {
        sentinel: false,
        align: 4,
    };
    pub const ANIM_DIRS: TableLayout = TableLayout {
        sentinel: false,
        align: 4,
    };

    /// Bytes taken by the count word and the offsets for `count` entries.
    pub fn header_len(&self, count: usize) -> usize {
        4 + 4 * (count + usize::from(self.sentinel))
    }

    /// Total packed length of a table holding payloads of the given sizes.
    pub fn packed_len(&self, payload_lens: &[usize]) -> usize {
        let mut cursor = align(self.header_len(payload_lens.len()), self.align);
        for len in payload_lens {
            cursor = align(cursor + len, self.align);
        }
        cursor
    }
}

pub fn align(value: usize, to: usize) -> usize {
    if to <= 1 {
        return value;
    }
    (value + to - 1) / to * to
}

pub fn read_u16(buf: &[u8], offset: usize, what: &str) -> Result<u16> {
    match buf.get(offset..offset + 2) {
        Some(bytes) => Ok(BigEndian::read_u16(bytes)),
        None => Err(RomError::truncated(what, offset)),
    }
}

pub fn read_u32(buf: &[u8], offset: usize, what: &str) -> Result<u32> {
    match buf.get(offset..offset + 4) {
        Some(bytes) => Ok(BigEndian::read_u32(bytes)),
        None => Err(RomError::truncated(what, offset)),
    }
}

pub fn write_u16(buf: &mut [u8], offset: usize, value: u16, what: &str) -> Result<()> {
    match buf.get_mut(offset..offset + 2) {
        Some(bytes) => {
            BigEndian::write_u16(bytes, value);
            Ok(())
        }
        None => Err(RomError::truncated(what, offset)),
    }
}

pub fn write_u32(buf: &mut [u8], offset: usize, value: u32, what: &str) -> Result<()> {
    match buf.get_mut(offset..offset + 4) {
        Some(bytes) => {
            BigEndian::write_u32(bytes, value);
            Ok(())
        }
        None => Err(RomError::truncated(what, offset)),
    }
}

pub fn slice<'a>(buf: &'a [u8], start: usize, len: usize, what: &str) -> Result<&'a [u8]> {
    buf.get(start..start.saturating_add(len))
        .ok_or_else(|| RomError::truncated(what, start))
}

/// A parsed offset table with offsets converted to absolute positions.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OffsetTable {
    pub starts: Vec<usize>,
    /// Absolute end of the last payload, when the table carries a sentinel.
    pub end: Option<usize>,
}

impl OffsetTable {
    pub fn read(buf: &[u8], base: usize, layout: TableLayout, what: &str) -> Result<Self> {
        let count = read_u32(buf, base, what)? as usize;
        // Every entry needs at least its offset word, so a count larger than
        // the remaining buffer can only be garbage.
        if count > buf.len().saturating_sub(base) / 4 {
            return Err(RomError::truncated(format!("{what} (count {count})"), base));
        }

        let mut starts = Vec::with_capacity(count);
        for i in 0..count {
            let rel = read_u32(buf, base + 4 + i * 4, what)? as usize;
            starts.push(base + rel);
        }

        let end = if layout.sentinel {
            let rel = read_u32(buf, base + 4 + count * 4, what)? as usize;
            Some(base + rel)
        } else {
            None
        };

        Ok(Self { starts, end })
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// Absolute end of entry `i`, if the table can tell.
    pub fn end_of(&self, i: usize) -> Option<usize> {
        if i + 1 < self.starts.len() {
            Some(self.starts[i + 1])
        } else {
            self.end
        }
    }
}

/// Serializes `payloads` behind a count-prefixed offset table.
///
/// Offsets are relative to the start of the returned buffer. Padding bytes
/// are zero.
pub fn pack_table<P: AsRef<[u8]>>(payloads: &[P], layout: TableLayout) -> Vec<u8> {
    let lens: Vec<usize> = payloads.iter().map(|p| p.as_ref().len()).collect();
    let total = layout.packed_len(&lens);

    let mut out = vec![0u8; total];
    BigEndian::write_u32(&mut out[0..4], payloads.len() as u32);

    let mut cursor = align(layout.header_len(payloads.len()), layout.align);
    for (i, payload) in payloads.iter().enumerate() {
        let payload = payload.as_ref();
        let pos = 4 + i * 4;
        BigEndian::write_u32(&mut out[pos..pos + 4], cursor as u32);
        out[cursor..cursor + payload.len()].copy_from_slice(payload);
        cursor = align(cursor + payload.len(), layout.align);
    }

    if layout.sentinel {
        let pos = 4 + payloads.len() * 4;
        BigEndian::write_u32(&mut out[pos..pos + 4], cursor as u32);
    }

    out
}
