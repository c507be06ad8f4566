//! Message tables: a flat table for the first two generations and a
//! locale/group nested table for the third.

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::codec::{self, OffsetTable, TableLayout};
use crate::{RomError, Result};

/// Locale and group levels of the nested table.
const NESTED: TableLayout = TableLayout {
    sentinel: false,
    align: 4,
};

/// Characters whose in-game code differs from ASCII.
const CHAR_OVERRIDES: [(char, u8); 7] = [
    ('\'', 0x5C),
    ('-', 0x3D),
    (',', 0x82),
    ('.', 0x85),
    ('!', 0xC2),
    ('?', 0xC3),
    ('\n', 0x0A),
];

const UNKNOWN_CHAR: u8 = 0xC3;

/// Encodes display text with the game's character map.
///
/// `<XX>` hex tags pass through as raw bytes so control codes survive a
/// decode/encode cycle.
pub fn encode_text(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut rest = text;
    while let Some(ch) = rest.chars().next() {
        if ch == '<' {
            if let Some(byte) = rest
                .get(1..3)
                .filter(|_| rest.get(3..4) == Some(">"))
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                out.push(byte);
                rest = &rest[4..];
                continue;
            }
        }
        rest = &rest[ch.len_utf8()..];

        let code = match CHAR_OVERRIDES.iter().find(|(c, _)| *c == ch) {
            Some((_, code)) => *code,
            None if ch.is_ascii_alphanumeric() || ch == ' ' => ch as u8,
            None => UNKNOWN_CHAR,
        };
        out.push(code);
    }
    out
}

pub fn decode_text(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match CHAR_OVERRIDES.iter().find(|(_, code)| *code == b) {
            Some((ch, _)) => out.push(*ch),
            None if b.is_ascii_alphanumeric() || b == b' ' => out.push(b as char),
            None => out.push_str(&format!("<{b:02X}>")),
        }
    }
    out
}

/// How a string is addressed in either table shape.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StringKey {
    Index(usize),
    Localized {
        locale: usize,
        group: usize,
        index: usize,
    },
}

/// Read/write access that does not care which table shape backs it.
pub trait StringSource {
    fn read(&self, key: StringKey) -> Option<&[u8]>;
    fn write(&mut self, key: StringKey, bytes: &[u8]) -> Result<()>;
    fn to_bytes(&self) -> Vec<u8>;

    fn byte_length(&self) -> usize {
        self.to_bytes().len()
    }

    fn pack(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let bytes = self.to_bytes();
        let dest = buf.get_mut(offset..offset + bytes.len()).ok_or_else(|| {
            RomError::Capacity(format!(
                "string table of {} bytes does not fit at {offset:#X}",
                bytes.len()
            ))
        })?;
        dest.copy_from_slice(&bytes);
        Ok(bytes.len())
    }
}

fn wrong_key(key: StringKey, shape: &str) -> RomError {
    RomError::Config(format!("{key:?} does not address a {shape} string table"))
}

/// Flat `{count, offsets[count], {len:u16, bytes}*}` table.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StringTable {
    entries: Vec<Vec<u8>>,
}

impl StringTable {
    pub fn extract(buf: &[u8], offset: usize) -> Result<Self> {
        let table = OffsetTable::read(buf, offset, TableLayout::STRINGS, "string table")?;
        let mut entries = Vec::with_capacity(table.len());
        for (i, &start) in table.starts.iter().enumerate() {
            let what = format!("string {i}");
            let len = codec::read_u16(buf, start, &what)? as usize;
            entries.push(codec::slice(buf, start + 2, len, &what)?.to_vec());
        }
        debug!("extracted {} strings at {offset:#X}", entries.len());
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn read(&self, index: usize) -> Option<&[u8]> {
        self.entries.get(index).map(Vec::as_slice)
    }

    /// Replaces string `index`, appending empty strings if it is past the end.
    pub fn write(&mut self, index: usize, bytes: &[u8]) -> Result<()> {
        if bytes.len() > u16::MAX as usize {
            return Err(RomError::Capacity(format!(
                "string {index} is {} bytes, the length prefix holds at most {}",
                bytes.len(),
                u16::MAX
            )));
        }
        if self.entries.len() <= index {
            self.entries.resize_with(index + 1, Vec::new);
        }
        self.entries[index] = bytes.to_vec();
        Ok(())
    }

    fn serialize(&self) -> Vec<u8> {
        let payloads: Vec<Vec<u8>> = self
            .entries
            .iter()
            .map(|e| {
                let mut p = vec![0u8; 2];
                BigEndian::write_u16(&mut p, e.len() as u16);
                p.extend_from_slice(e);
                p
            })
            .collect();
        codec::pack_table(&payloads, TableLayout::STRINGS)
    }
}

impl StringSource for StringTable {
    fn read(&self, key: StringKey) -> Option<&[u8]> {
        match key {
            StringKey::Index(i) => StringTable::read(self, i),
            StringKey::Localized { .. } => None,
        }
    }

    fn write(&mut self, key: StringKey, bytes: &[u8]) -> Result<()> {
        match key {
            StringKey::Index(i) => StringTable::write(self, i, bytes),
            other => Err(wrong_key(other, "flat")),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.serialize()
    }
}

/// Third-generation table: locales of groups of flat tables.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StringTable3 {
    locales: Vec<Vec<StringTable>>,
}

impl StringTable3 {
    pub fn extract(buf: &[u8], offset: usize) -> Result<Self> {
        let locale_table = OffsetTable::read(buf, offset, NESTED, "locale table")?;
        let mut locales = Vec::with_capacity(locale_table.len());
        for (l, &locale_start) in locale_table.starts.iter().enumerate() {
            let what = format!("group table of locale {l}");
            let group_table = OffsetTable::read(buf, locale_start, NESTED, &what)?;
            let groups = group_table
                .starts
                .iter()
                .map(|&start| StringTable::extract(buf, start))
                .collect::<Result<Vec<_>>>()?;
            locales.push(groups);
        }
        Ok(Self { locales })
    }

    pub fn locale_count(&self) -> usize {
        self.locales.len()
    }

    pub fn group_count(&self, locale: usize) -> usize {
        self.locales.get(locale).map_or(0, Vec::len)
    }

    pub fn read(&self, locale: usize, group: usize, index: usize) -> Option<&[u8]> {
        self.locales.get(locale)?.get(group)?.read(index)
    }

    /// Groups and locales are created on demand.
    pub fn write(&mut self, locale: usize, group: usize, index: usize, bytes: &[u8]) -> Result<()> {
        if self.locales.len() <= locale {
            self.locales.resize_with(locale + 1, Vec::new);
        }
        let groups = &mut self.locales[locale];
        if groups.len() <= group {
            groups.resize_with(group + 1, StringTable::default);
        }
        groups[group].write(index, bytes)
    }

    fn serialize(&self) -> Vec<u8> {
        let locales: Vec<Vec<u8>> = self
            .locales
            .iter()
            .map(|groups| {
                let packed: Vec<Vec<u8>> = groups.iter().map(StringTable::serialize).collect();
                codec::pack_table(&packed, NESTED)
            })
            .collect();
        codec::pack_table(&locales, NESTED)
    }
}

impl StringSource for StringTable3 {
    fn read(&self, key: StringKey) -> Option<&[u8]> {
        match key {
            StringKey::Localized {
                locale,
                group,
                index,
            } => StringTable3::read(self, locale, group, index),
            StringKey::Index(_) => None,
        }
    }

    fn write(&mut self, key: StringKey, bytes: &[u8]) -> Result<()> {
        match key {
            StringKey::Localized {
                locale,
                group,
                index,
            } => StringTable3::write(self, locale, group, index, bytes),
            other => Err(wrong_key(other, "localized")),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.serialize()
    }
}

/// Whichever table shape the loaded game uses.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StringStore {
    Flat(StringTable),
    Localized(StringTable3),
}

impl StringStore {
    fn source(&self) -> &dyn StringSource {
        match self {
            StringStore::Flat(t) => t,
            StringStore::Localized(t) => t,
        }
    }

    fn source_mut(&mut self) -> &mut dyn StringSource {
        match self {
            StringStore::Flat(t) => t,
            StringStore::Localized(t) => t,
        }
    }
}

impl StringSource for StringStore {
    fn read(&self, key: StringKey) -> Option<&[u8]> {
        self.source().read(key)
    }

    fn write(&mut self, key: StringKey, bytes: &[u8]) -> Result<()> {
        self.source_mut().write(key, bytes)
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.source().to_bytes()
    }
}
