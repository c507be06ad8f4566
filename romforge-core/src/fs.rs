//! Two-level virtual file store: directories of files, each file carrying a
//! small header and a possibly compressed payload.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

use crate::codec::{self, OffsetTable, TableLayout};
use crate::compression::{SharedCodec, TYPE_NONE};
use crate::{RomError, Result};

/// Compression types whose header repeats the decompressed size.
const TYPES_WITH_SIZE_COPY: [u32; 3] = [1, 2, 3];

pub fn header_len(compression_type: u32) -> usize {
    if TYPES_WITH_SIZE_COPY.contains(&compression_type) {
        12
    } else {
        8
    }
}

/// Offset table shapes for the directory level and the file level.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StoreLayout {
    pub dirs: TableLayout,
    pub files: TableLayout,
}

impl StoreLayout {
    pub const MAIN: StoreLayout = StoreLayout {
        dirs: TableLayout::FS_DIRS,
        files: TableLayout::FS_FILES,
    };
    pub const ANIMATION: StoreLayout = StoreLayout {
        dirs: TableLayout::ANIM_DIRS,
        files: TableLayout::FS_FILES,
    };
}

/// One file slot.
///
/// `compressed` holds the payload exactly as it was stored, trailing padding
/// included, until the file is rewritten.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VirtualFileEntry {
    pub compression_type: u32,
    pub decompressed_size: u32,
    decompressed: Option<Vec<u8>>,
    compressed: Option<Vec<u8>>,
}

impl VirtualFileEntry {
    /// True while the stored payload is still the one read from the image.
    pub fn has_stored_payload(&self) -> bool {
        self.compressed.is_some()
    }

    fn ensure_decompressed(&mut self, codec: &SharedCodec) -> Result<&[u8]> {
        if self.decompressed.is_none() {
            let stored = self.compressed.as_deref().unwrap_or(&[]);
            let data = codec.decompress(
                self.compression_type,
                stored,
                self.decompressed_size as usize,
            )?;
            self.decompressed = Some(data);
        }
        Ok(self.decompressed.as_deref().unwrap_or(&[]))
    }
}

#[derive(Clone)]
pub struct VirtualFileStore {
    layout: StoreLayout,
    dirs: Vec<Vec<VirtualFileEntry>>,
    codec: SharedCodec,
    always_write_decompressed: bool,
}

impl fmt::Debug for VirtualFileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualFileStore")
            .field("layout", &self.layout)
            .field(
                "files_per_dir",
                &self.dirs.iter().map(Vec::len).collect::<Vec<_>>(),
            )
            .field("always_write_decompressed", &self.always_write_decompressed)
            .finish()
    }
}

impl VirtualFileStore {
    pub fn new(layout: StoreLayout, codec: SharedCodec) -> Self {
        Self {
            layout,
            dirs: Vec::new(),
            codec,
            always_write_decompressed: false,
        }
    }

    pub fn set_always_write_decompressed(&mut self, value: bool) {
        self.always_write_decompressed = value;
    }

    /// Parses the store starting at `offset`.
    pub fn extract(
        buf: &[u8],
        offset: usize,
        layout: StoreLayout,
        codec: SharedCodec,
    ) -> Result<Self> {
        let dir_table = OffsetTable::read(buf, offset, layout.dirs, "directory table")?;
        let mut dirs = Vec::with_capacity(dir_table.len());

        for (d, &dir_start) in dir_table.starts.iter().enumerate() {
            let what = format!("file table of directory {d}");
            let files = OffsetTable::read(buf, dir_start, layout.files, &what)?;
            let mut entries = Vec::with_capacity(files.len());

            for (f, &file_start) in files.starts.iter().enumerate() {
                let end = files.end_of(f).or_else(|| dir_table.end_of(d));
                entries.push(read_entry(buf, file_start, end, &codec, d, f)?);
            }

            trace!("directory {d}: {} files", entries.len());
            dirs.push(entries);
        }

        debug!(
            "extracted store at {offset:#X}: {} directories, {} files",
            dirs.len(),
            dirs.iter().map(Vec::len).sum::<usize>()
        );

        Ok(Self {
            layout,
            dirs,
            codec,
            always_write_decompressed: false,
        })
    }

    pub fn layout(&self) -> StoreLayout {
        self.layout
    }

    pub fn dir_count(&self) -> usize {
        self.dirs.len()
    }

    pub fn file_count(&self, dir: usize) -> usize {
        self.dirs.get(dir).map_or(0, Vec::len)
    }

    pub fn entry(&self, dir: usize, file: usize) -> Option<&VirtualFileEntry> {
        self.dirs.get(dir)?.get(file)
    }

    /// Decompressed contents of a file, decompressing on first access.
    pub fn read(&mut self, dir: usize, file: usize) -> Result<&[u8]> {
        let codec = self.codec.clone();
        let entry = self
            .dirs
            .get_mut(dir)
            .and_then(|d| d.get_mut(file))
            .ok_or_else(|| RomError::Config(format!("no file {dir}/{file} in store")))?;
        entry.ensure_decompressed(&codec)
    }

    /// Replaces a file, growing the directory list and the directory as
    /// needed. Writing identical content keeps the stored payload.
    pub fn write(&mut self, dir: usize, file: usize, bytes: &[u8]) -> Result<()> {
        if self.dirs.len() <= dir {
            self.set_dir_count(dir + 1);
        }
        if self.dirs[dir].len() <= file {
            self.set_entry_count(dir, file + 1);
        }

        let codec = self.codec.clone();
        let entry = &mut self.dirs[dir][file];

        let unchanged = entry.decompressed_size as usize == bytes.len()
            && matches!(entry.ensure_decompressed(&codec), Ok(current) if current == bytes);
        if unchanged {
            trace!("write to {dir}/{file} is identical, keeping stored payload");
            return Ok(());
        }

        if !codec.supports(entry.compression_type) {
            entry.compression_type = TYPE_NONE;
        }
        entry.decompressed_size = u32::try_from(bytes.len())
            .map_err(|_| RomError::Capacity(format!("file {dir}/{file} is too large")))?;
        entry.decompressed = Some(bytes.to_vec());
        entry.compressed = None;
        Ok(())
    }

    /// Resizes one directory. New slots are empty uncompressed files.
    pub fn set_entry_count(&mut self, dir: usize, count: usize) {
        if self.dirs.len() <= dir {
            self.set_dir_count(dir + 1);
        }
        self.dirs[dir].resize_with(count, || VirtualFileEntry {
            decompressed: Some(Vec::new()),
            ..Default::default()
        });
    }

    pub fn set_dir_count(&mut self, count: usize) {
        self.dirs.resize_with(count, Vec::new);
    }

    fn entry_bytes(&mut self, dir: usize, file: usize) -> Result<Vec<u8>> {
        let codec = self.codec.clone();
        let always_raw = self.always_write_decompressed;
        let entry = &mut self.dirs[dir][file];

        let (compression_type, payload) = if always_raw {
            (TYPE_NONE, entry.ensure_decompressed(&codec)?.to_vec())
        } else {
            if entry.compressed.is_none() {
                let data = entry.decompressed.as_deref().unwrap_or(&[]);
                entry.compressed = Some(codec.compress(entry.compression_type, data)?);
            }
            (
                entry.compression_type,
                entry.compressed.clone().unwrap_or_default(),
            )
        };

        let mut out = vec![0u8; header_len(compression_type)];
        BigEndian::write_u32(&mut out[0..4], entry.decompressed_size);
        BigEndian::write_u32(&mut out[4..8], compression_type);
        if out.len() == 12 {
            BigEndian::write_u32(&mut out[8..12], entry.decompressed_size);
        }
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Serializes the whole store with freshly computed offset tables.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let mut dir_payloads = Vec::with_capacity(self.dirs.len());
        for d in 0..self.dirs.len() {
            let mut files = Vec::with_capacity(self.dirs[d].len());
            for f in 0..self.dirs[d].len() {
                files.push(self.entry_bytes(d, f)?);
            }
            dir_payloads.push(codec::pack_table(&files, self.layout.files));
        }
        Ok(codec::pack_table(&dir_payloads, self.layout.dirs))
    }

    pub fn byte_length(&mut self) -> Result<usize> {
        Ok(self.to_bytes()?.len())
    }

    /// Writes the store into `buf` at `offset` and returns the bytes written.
    pub fn pack(&mut self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let bytes = self.to_bytes()?;
        let dest = buf
            .get_mut(offset..offset + bytes.len())
            .ok_or_else(|| {
                RomError::Capacity(format!(
                    "store of {} bytes does not fit at {offset:#X}",
                    bytes.len()
                ))
            })?;
        dest.copy_from_slice(&bytes);
        Ok(bytes.len())
    }
}

fn read_entry(
    buf: &[u8],
    start: usize,
    end: Option<usize>,
    codec: &SharedCodec,
    dir: usize,
    file: usize,
) -> Result<VirtualFileEntry> {
    let what = format!("file {dir}/{file}");
    let decompressed_size = codec::read_u32(buf, start, &what)?;
    let compression_type = codec::read_u32(buf, start + 4, &what)?;
    let payload_start = start + header_len(compression_type);

    let payload_end = match end {
        Some(end) if end >= payload_start => end,
        Some(_) => return Err(RomError::truncated(what, start)),
        None => {
            let rest = buf
                .get(payload_start..)
                .ok_or_else(|| RomError::truncated(what.as_str(), payload_start))?;
            let used =
                codec.compressed_size_of(compression_type, rest, decompressed_size as usize)?;
            codec::align(payload_start + used, 4).min(buf.len())
        }
    };

    let stored = codec::slice(buf, payload_start, payload_end - payload_start, &what)?;
    Ok(VirtualFileEntry {
        compression_type,
        decompressed_size,
        decompressed: None,
        compressed: Some(stored.to_vec()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{BuiltinCodec, TYPE_LZSS};

    fn store() -> VirtualFileStore {
        VirtualFileStore::new(StoreLayout::MAIN, BuiltinCodec::shared())
    }

    #[test]
    fn two_directory_scenario() {
        let raw: Vec<u8> = (1..=10).collect();
        let mut fs = store();
        fs.set_dir_count(2);
        fs.write(0, 0, &raw).unwrap();
        assert_eq!(fs.file_count(1), 0);

        let mut buf = vec![0u8; 0x100];
        let written = fs.pack(&mut buf, 0x10).unwrap();
        assert_eq!(written, fs.byte_length().unwrap());

        let mut back =
            VirtualFileStore::extract(&buf, 0x10, StoreLayout::MAIN, BuiltinCodec::shared())
                .unwrap();
        assert_eq!(back.dir_count(), 2);
        assert_eq!(back.file_count(0), 1);
        assert_eq!(back.file_count(1), 0);
        assert_eq!(back.read(0, 0).unwrap(), &raw[..]);
    }

    #[test]
    fn untouched_store_repacks_byte_exact() {
        let mut fs = store();
        fs.write(0, 0, b"plain bytes here").unwrap();
        fs.write(0, 1, &[7u8; 3]).unwrap();
        fs.write(1, 0, &vec![0x11u8; 300]).unwrap();
        fs.dirs[1][0].compression_type = TYPE_LZSS;
        fs.write(2, 2, b"sparse").unwrap();
        let original = fs.to_bytes().unwrap();

        let mut back = VirtualFileStore::extract(
            &original,
            0,
            StoreLayout::MAIN,
            BuiltinCodec::shared(),
        )
        .unwrap();
        assert!(back.entry(1, 0).unwrap().has_stored_payload());
        assert_eq!(back.to_bytes().unwrap(), original);
        assert_eq!(back.read(1, 0).unwrap(), &vec![0x11u8; 300][..]);
        assert_eq!(back.read(2, 0).unwrap(), b"");
    }

    #[test]
    fn identical_write_keeps_stored_payload() {
        let mut fs = store();
        fs.write(0, 0, b"abc").unwrap();
        let bytes = fs.to_bytes().unwrap();
        let mut back =
            VirtualFileStore::extract(&bytes, 0, StoreLayout::MAIN, BuiltinCodec::shared())
                .unwrap();

        back.write(0, 0, b"abc").unwrap();
        assert!(back.entry(0, 0).unwrap().has_stored_payload());

        back.write(0, 0, b"abcd").unwrap();
        assert!(!back.entry(0, 0).unwrap().has_stored_payload());
        assert_eq!(back.read(0, 0).unwrap(), b"abcd");
    }

    #[test]
    fn compressed_headers_carry_size_copy() {
        let mut fs = store();
        fs.write(0, 0, &[5u8; 64]).unwrap();
        fs.dirs[0][0].compression_type = TYPE_LZSS;
        let bytes = fs.to_bytes().unwrap();
        // dir table (count, offset, sentinel) then file table (count, offset).
        let file = 12 + 8;
        assert_eq!(BigEndian::read_u32(&bytes[file..]), 64);
        assert_eq!(BigEndian::read_u32(&bytes[file + 4..]), TYPE_LZSS);
        assert_eq!(BigEndian::read_u32(&bytes[file + 8..]), 64);

        fs.set_always_write_decompressed(true);
        let raw = fs.to_bytes().unwrap();
        assert_eq!(BigEndian::read_u32(&raw[file + 4..]), TYPE_NONE);
        assert_eq!(&raw[file + 8..file + 8 + 64], &[5u8; 64][..]);
    }

    #[test]
    fn animation_layout_without_sentinel_measures_last_file() {
        let mut fs = VirtualFileStore::new(StoreLayout::ANIMATION, BuiltinCodec::shared());
        fs.write(0, 0, &[1u8; 9]).unwrap();
        fs.write(1, 0, &[2u8; 40]).unwrap();
        fs.dirs[1][0].compression_type = TYPE_LZSS;
        let bytes = fs.to_bytes().unwrap();

        let mut back = VirtualFileStore::extract(
            &bytes,
            0,
            StoreLayout::ANIMATION,
            BuiltinCodec::shared(),
        )
        .unwrap();
        assert_eq!(back.read(1, 0).unwrap(), &[2u8; 40][..]);
        assert_eq!(back.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn set_entry_count_shrinks_and_grows() {
        let mut fs = store();
        fs.write(0, 3, b"x").unwrap();
        assert_eq!(fs.file_count(0), 4);
        fs.set_entry_count(0, 1);
        assert_eq!(fs.file_count(0), 1);
        assert!(fs.read(0, 3).is_err());
        assert_eq!(fs.read(0, 0).unwrap(), b"");
    }

    #[test]
    fn pack_reports_missing_room() {
        let mut fs = store();
        fs.write(0, 0, &[0u8; 32]).unwrap();
        let mut small = vec![0u8; 16];
        assert!(matches!(fs.pack(&mut small, 0), Err(RomError::Capacity(_))));
    }
}
