//! Fixed-stride lists that connect board spaces to their handlers.
//!
//! A space event list is `{activation:u16, mystery:u16, address:u32}*`
//! closed by an all-zero entry. A space event table is
//! `{space:u16, 0:u16, address:u32}*` closed by `{0xFFFF, 0, 0}`.

use crate::codec;
use crate::{RomError, Result};

pub const ENTRY_LEN: usize = 8;
pub const TABLE_TERMINATOR: u16 = 0xFFFF;
/// Space indices are 16 bits and one value is the terminator.
pub const MAX_TABLE_ENTRIES: usize = 0xFFFF;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SpaceEventEntry {
    pub activation: u16,
    pub mystery: u16,
    pub address: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SpaceTableEntry {
    pub space: u16,
    pub address: u32,
}

pub fn list_len(entries: usize) -> usize {
    (entries + 1) * ENTRY_LEN
}

pub fn write_space_event_list(
    buf: &mut [u8],
    offset: usize,
    entries: &[SpaceEventEntry],
) -> Result<usize> {
    let len = list_len(entries.len());
    if buf.len() < offset + len {
        return Err(RomError::Capacity(format!(
            "space event list of {} entries does not fit at {offset:#X}",
            entries.len()
        )));
    }

    let mut pos = offset;
    for e in entries {
        if e.activation == 0 {
            return Err(RomError::Config(format!(
                "space event at {:#X} has activation 0, which ends a list",
                e.address
            )));
        }
        codec::write_u16(buf, pos, e.activation, "space event list")?;
        codec::write_u16(buf, pos + 2, e.mystery, "space event list")?;
        codec::write_u32(buf, pos + 4, e.address, "space event list")?;
        pos += ENTRY_LEN;
    }
    buf[pos..pos + ENTRY_LEN].fill(0);
    Ok(len)
}

pub fn parse_space_event_list(buf: &[u8], offset: usize) -> Result<Vec<SpaceEventEntry>> {
    let mut entries = Vec::new();
    let mut pos = offset;
    loop {
        let activation = codec::read_u16(buf, pos, "space event list")?;
        if activation == 0 {
            return Ok(entries);
        }
        entries.push(SpaceEventEntry {
            activation,
            mystery: codec::read_u16(buf, pos + 2, "space event list")?,
            address: codec::read_u32(buf, pos + 4, "space event list")?,
        });
        pos += ENTRY_LEN;
    }
}

pub fn table_len(entries: usize) -> usize {
    (entries + 1) * ENTRY_LEN
}

pub fn write_space_event_table(
    buf: &mut [u8],
    offset: usize,
    entries: &[SpaceTableEntry],
) -> Result<usize> {
    if entries.len() > MAX_TABLE_ENTRIES {
        return Err(RomError::Capacity(format!(
            "space event table has {} entries, the limit is {MAX_TABLE_ENTRIES}",
            entries.len()
        )));
    }
    let len = table_len(entries.len());
    if buf.len() < offset + len {
        return Err(RomError::Capacity(format!(
            "space event table of {} entries does not fit at {offset:#X}",
            entries.len()
        )));
    }

    let mut pos = offset;
    for e in entries {
        if e.space == TABLE_TERMINATOR {
            return Err(RomError::Config(
                "space index 0xFFFF is reserved for the table terminator".to_string(),
            ));
        }
        codec::write_u16(buf, pos, e.space, "space event table")?;
        codec::write_u16(buf, pos + 2, 0, "space event table")?;
        codec::write_u32(buf, pos + 4, e.address, "space event table")?;
        pos += ENTRY_LEN;
    }
    codec::write_u16(buf, pos, TABLE_TERMINATOR, "space event table")?;
    buf[pos + 2..pos + ENTRY_LEN].fill(0);
    Ok(len)
}

pub fn parse_space_event_table(buf: &[u8], offset: usize) -> Result<Vec<SpaceTableEntry>> {
    let mut entries = Vec::new();
    let mut pos = offset;
    loop {
        let space = codec::read_u16(buf, pos, "space event table")?;
        if space == TABLE_TERMINATOR {
            return Ok(entries);
        }
        if entries.len() == MAX_TABLE_ENTRIES {
            return Err(RomError::Capacity(format!(
                "space event table at {offset:#X} has no terminator within {MAX_TABLE_ENTRIES} entries"
            )));
        }
        entries.push(SpaceTableEntry {
            space,
            address: codec::read_u32(buf, pos + 4, "space event table")?,
        });
        pos += ENTRY_LEN;
    }
}
