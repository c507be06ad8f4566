//! Loading an image into its stores and writing it back out.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::checksum::{N64Checksum, SharedChecksum};
use crate::codec::{self, align};
use crate::compression::{BuiltinCodec, SharedCodec};
use crate::events::{
    self, BatchReport, EventCache, EventInstance, EventRegistry, ParsedSpace, PlacementContext,
    SpaceEvents, WriteScratch,
};
use crate::fs::{StoreLayout, VirtualFileStore};
use crate::game::{self, Game, SectionKind, TargetProfile, ID_OFFSET};
use crate::hook;
use crate::patch;
use crate::strings::{StringSource, StringStore, StringTable, StringTable3};
use crate::symbols::{SymbolLookup, SymbolTable};
use crate::{RomError, Result, Settings};

/// Sections are placed on 16-byte boundaries.
const SECTION_ALIGN: usize = 16;
/// The loader misreads sections whose start has a low halfword in this range.
const HAZARD_RANGE: std::ops::Range<usize> = 0x8000..0x8010;

/// Word layout the image was found in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ByteOrder {
    /// `80 37 12 40`, the layout everything else is converted to.
    BigEndian,
    /// `37 80 40 12`, every pair of bytes swapped.
    ByteSwapped,
    /// `12 40 80 37`, the two halfwords of every word swapped.
    HalfWordSwapped,
    /// `40 12 37 80`, every word reversed.
    LittleEndian,
}

impl ByteOrder {
    pub fn detect(bytes: &[u8]) -> Result<ByteOrder> {
        let magic = codec::read_u32(bytes, 0, "image header")?;
        match magic {
            0x8037_1240 => Ok(ByteOrder::BigEndian),
            0x3780_4012 => Ok(ByteOrder::ByteSwapped),
            0x1240_8037 => Ok(ByteOrder::HalfWordSwapped),
            0x4012_3780 => Ok(ByteOrder::LittleEndian),
            magic => Err(RomError::UnrecognizedImage { magic }),
        }
    }

    /// Converts `bytes` from this order to big-endian in place. Every
    /// conversion is its own inverse.
    pub fn normalize(self, bytes: &mut [u8]) -> Result<()> {
        let unit = match self {
            ByteOrder::BigEndian => return Ok(()),
            ByteOrder::ByteSwapped => 2,
            ByteOrder::HalfWordSwapped | ByteOrder::LittleEndian => 4,
        };
        if bytes.len() % unit != 0 {
            return Err(RomError::truncated("image", bytes.len() - bytes.len() % unit));
        }
        for chunk in bytes.chunks_exact_mut(unit) {
            match self {
                ByteOrder::HalfWordSwapped => chunk.rotate_left(2),
                _ => chunk.reverse(),
            }
        }
        Ok(())
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ByteOrder::BigEndian => "big-endian (.z64)",
            ByteOrder::ByteSwapped => "byte-swapped (.v64)",
            ByteOrder::HalfWordSwapped => "half-word-swapped",
            ByteOrder::LittleEndian => "little-endian (.n64)",
        })
    }
}

/// Collaborators and overrides for [`RomImage::load_with`].
#[derive(Clone)]
pub struct LoadOptions {
    pub settings: Settings,
    /// Used instead of the built-in profile for the image's identifier.
    pub profile: Option<TargetProfile>,
    pub symbols: Arc<dyn SymbolLookup + Send + Sync>,
    pub codec: SharedCodec,
    pub checksum: SharedChecksum,
}

impl LoadOptions {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            profile: None,
            symbols: Arc::new(SymbolTable::new()),
            codec: BuiltinCodec::shared(),
            checksum: N64Checksum::shared(),
        }
    }
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

/// Where a section sits in the current image.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SectionInfo {
    pub kind: SectionKind,
    pub offset: usize,
    pub len: usize,
}

/// A file region of the main store that holds a board's event code.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoardTarget {
    pub dir: usize,
    pub file: usize,
    /// Where free space starts inside the file.
    pub offset: usize,
    /// Bytes of free space from `offset`.
    pub capacity: usize,
    /// RAM address of the file's first byte once loaded.
    pub ram_base: u32,
}

/// Section start offsets for the given lengths, beginning at `start`.
///
/// Each section starts 16-aligned after the previous one; a start that would
/// land in the hazard range pushes the section back in 16-byte steps.
pub fn layout_sections(start: usize, lens: &[usize]) -> Vec<usize> {
    let mut cursor = align(start, SECTION_ALIGN);
    let mut offsets = Vec::with_capacity(lens.len());
    for &len in lens {
        while HAZARD_RANGE.contains(&(cursor & 0xFFFF)) {
            cursor += SECTION_ALIGN;
        }
        offsets.push(cursor);
        cursor = align(cursor + len, SECTION_ALIGN);
    }
    offsets
}

pub struct RomImage {
    bytes: Vec<u8>,
    byte_order: ByteOrder,
    id: String,
    game: Option<Game>,
    profile: Option<TargetProfile>,
    settings: Settings,
    sections: Vec<SectionInfo>,
    main_fs: Option<VirtualFileStore>,
    strings: Option<StringStore>,
    texture_fs: Option<Vec<u8>>,
    animation_fs: Option<VirtualFileStore>,
    events: EventRegistry,
    cache: EventCache,
    scratch: WriteScratch,
    cheats: Vec<Vec<u8>>,
    symbols: Arc<dyn SymbolLookup + Send + Sync>,
    codec: SharedCodec,
    checksum: SharedChecksum,
}

impl fmt::Debug for RomImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RomImage")
            .field("id", &self.id)
            .field("game", &self.game)
            .field("byte_order", &self.byte_order)
            .field("len", &self.bytes.len())
            .field("sections", &self.sections)
            .field("staged_cheats", &self.cheats.len())
            .finish()
    }
}

impl RomImage {
    pub fn load(bytes: &[u8], settings: &Settings) -> Result<Self> {
        Self::load_with(bytes, LoadOptions::new(settings.clone()))
    }

    pub fn load_with(bytes: &[u8], options: LoadOptions) -> Result<Self> {
        let byte_order = ByteOrder::detect(bytes)?;
        let mut bytes = bytes.to_vec();
        byte_order.normalize(&mut bytes)?;
        if byte_order != ByteOrder::BigEndian {
            info!("converted image from {byte_order}");
        }

        let id_bytes = codec::slice(&bytes, ID_OFFSET, 4, "image identifier")?;
        let id = String::from_utf8_lossy(id_bytes).into_owned();

        let LoadOptions {
            settings,
            profile,
            symbols,
            codec,
            checksum,
        } = options;

        let (game, profile) = match profile {
            Some(p) => (Some(p.game), Some(p)),
            None => {
                let found = Game::from_id(&id);
                (found, found.and_then(game::profile))
            }
        };

        match (game, &profile) {
            (None, _) if !settings.allow_unsupported => {
                return Err(RomError::UnsupportedImage(id));
            }
            (None, _) => warn!("'{id}' is not a known image, nothing will be extracted"),
            (Some(g), None) => warn!("{g} has no known layout, nothing will be extracted"),
            (Some(g), Some(_)) => info!("loaded {g}"),
        }

        let mut image = RomImage {
            bytes,
            byte_order,
            id,
            game,
            profile,
            settings,
            sections: Vec::new(),
            main_fs: None,
            strings: None,
            texture_fs: None,
            animation_fs: None,
            events: EventRegistry::with_builtins()?,
            cache: EventCache::new(),
            scratch: WriteScratch::new(),
            cheats: Vec::new(),
            symbols,
            codec,
            checksum,
        };
        image.extract_sections()?;
        Ok(image)
    }

    fn extract_sections(&mut self) -> Result<()> {
        let Some(profile) = &self.profile else {
            return Ok(());
        };

        let mut found = Vec::with_capacity(profile.sections.len());
        for section in &profile.sections {
            let offset = patch::rom_offset(
                &self.bytes,
                &section.patch_group,
                self.settings.validate_patch_groups,
            )? as usize;
            if offset >= self.bytes.len() {
                return Err(RomError::truncated(section.kind.name(), offset));
            }
            found.push((section.kind, offset));
        }
        found.sort_by_key(|&(_, offset)| offset);

        let mut sections = Vec::with_capacity(found.len());
        for (i, &(kind, offset)) in found.iter().enumerate() {
            let end = found
                .get(i + 1)
                .map_or(self.bytes.len(), |&(_, next)| next);
            match kind {
                SectionKind::MainFs => {
                    let mut fs = VirtualFileStore::extract(
                        &self.bytes,
                        offset,
                        StoreLayout::MAIN,
                        self.codec.clone(),
                    )?;
                    fs.set_always_write_decompressed(self.settings.always_write_decompressed);
                    self.main_fs = Some(fs);
                }
                SectionKind::AnimationFs => {
                    let mut fs = VirtualFileStore::extract(
                        &self.bytes,
                        offset,
                        StoreLayout::ANIMATION,
                        self.codec.clone(),
                    )?;
                    fs.set_always_write_decompressed(self.settings.always_write_decompressed);
                    self.animation_fs = Some(fs);
                }
                SectionKind::Strings => {
                    self.strings = Some(if profile.game.generation() == 3 {
                        StringStore::Localized(StringTable3::extract(&self.bytes, offset)?)
                    } else {
                        StringStore::Flat(StringTable::extract(&self.bytes, offset)?)
                    });
                }
                SectionKind::TextureFs => {
                    self.texture_fs = Some(self.bytes[offset..end].to_vec());
                }
            }
            debug!("{} at {offset:#X}..{end:#X}", kind.name());
            sections.push(SectionInfo {
                kind,
                offset,
                len: end - offset,
            });
        }
        self.sections = sections;
        Ok(())
    }

    pub fn game(&self) -> Option<Game> {
        self.game
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// The image as of the last load or save, big-endian.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn sections(&self) -> &[SectionInfo] {
        &self.sections
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn missing(&self, feature: &'static str) -> RomError {
        match self.game {
            Some(game) => RomError::unsupported(game, feature),
            None => RomError::unsupported(&self.id, feature),
        }
    }

    pub fn main_fs(&self) -> Result<&VirtualFileStore> {
        let missing = self.missing("the main file system");
        self.main_fs.as_ref().ok_or(missing)
    }

    pub fn main_fs_mut(&mut self) -> Result<&mut VirtualFileStore> {
        let missing = self.missing("the main file system");
        self.main_fs.as_mut().ok_or(missing)
    }

    pub fn strings(&self) -> Result<&StringStore> {
        let missing = self.missing("strings");
        self.strings.as_ref().ok_or(missing)
    }

    pub fn strings_mut(&mut self) -> Result<&mut StringStore> {
        let missing = self.missing("strings");
        self.strings.as_mut().ok_or(missing)
    }

    /// Texture data, carried through unparsed.
    pub fn texture_fs(&self) -> Result<&[u8]> {
        let missing = self.missing("the texture file system");
        self.texture_fs.as_deref().ok_or(missing)
    }

    pub fn animation_fs(&self) -> Result<&VirtualFileStore> {
        let missing = self.missing("the animation file system");
        self.animation_fs.as_ref().ok_or(missing)
    }

    pub fn animation_fs_mut(&mut self) -> Result<&mut VirtualFileStore> {
        let missing = self.missing("the animation file system");
        self.animation_fs.as_mut().ok_or(missing)
    }

    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventRegistry {
        &mut self.events
    }

    /// Adds a user-authored event after test-assembling it against this
    /// image's symbols.
    pub fn register_custom_event(&mut self, text: &str) -> Result<()> {
        self.events.register_custom(text, &*self.symbols)
    }

    pub fn create_event(&self, id: &str, args: Vec<i16>) -> Result<EventInstance> {
        self.events.create(id, args)
    }

    /// Writes a board's events into free space of a main store file.
    ///
    /// Shared code emitted here is reused by later calls until the next
    /// [`save`](Self::save) or [`begin_pass`](Self::begin_pass).
    pub fn write_board_events(
        &mut self,
        target: &BoardTarget,
        spaces: &mut [SpaceEvents],
    ) -> Result<BatchReport> {
        let game = self.game.ok_or_else(|| self.missing("board events"))?;
        let fs = self
            .main_fs
            .as_mut()
            .ok_or_else(|| RomError::unsupported(game, "the main file system"))?;

        let end = target.offset + target.capacity;
        let mut region = fs.read(target.dir, target.file)?.to_vec();
        if region.len() < end {
            region.resize(end, 0);
        }

        let ctx = PlacementContext::new(game, target.ram_base, &*self.symbols).at(target.offset);
        let report = events::write_board_events(
            &mut region[..end],
            spaces,
            &self.events,
            &ctx,
            &mut self.scratch,
            &self.cache,
        )?;
        fs.write(target.dir, target.file, &region)?;
        self.cache.clear_recognized();
        Ok(report)
    }

    /// Reads back the event table at `table_offset` of the target file.
    pub fn parse_board_events(
        &mut self,
        target: &BoardTarget,
        table_offset: usize,
    ) -> Result<Vec<ParsedSpace>> {
        let game = self.game.ok_or_else(|| self.missing("board events"))?;
        let fs = self
            .main_fs
            .as_mut()
            .ok_or_else(|| RomError::unsupported(game, "the main file system"))?;
        let region = fs.read(target.dir, target.file)?.to_vec();

        let ctx = PlacementContext::new(game, target.ram_base, &*self.symbols).at(target.offset);
        events::parse_board_events(&region, table_offset, &ctx, &self.events, &mut self.cache)
    }

    /// Starts a new write pass: shared code is emitted again.
    pub fn begin_pass(&mut self) {
        self.scratch = WriteScratch::new();
        self.cache.clear_recognized();
    }

    /// Queues machine code to run every frame through the cheat hook.
    pub fn stage_cheat(&mut self, code: Vec<u8>) -> Result<()> {
        if code.is_empty() || code.len() % 4 != 0 {
            return Err(RomError::Config(format!(
                "cheat code must be whole instructions, got {} bytes",
                code.len()
            )));
        }
        self.cheats.push(code);
        Ok(())
    }

    pub fn clear_cheats(&mut self) {
        self.cheats.clear();
    }

    pub fn staged_cheats(&self) -> usize {
        self.cheats.len()
    }

    /// Builds the output image. On success it also becomes the loaded
    /// image; on failure nothing changes.
    pub fn save(&mut self) -> Result<Vec<u8>> {
        let built = self.build()?;
        self.bytes = built.bytes.clone();
        if let Some(stores) = built.stores {
            self.sections = stores.sections;
            self.main_fs = stores.main_fs;
            self.animation_fs = stores.animation_fs;
        }
        self.scratch = WriteScratch::new();
        self.cache.clear_recognized();
        info!("saved {} bytes", built.bytes.len());
        Ok(built.bytes)
    }

    fn build(&self) -> Result<Built> {
        let Some(profile) = &self.profile else {
            if !self.cheats.is_empty() {
                return Err(self.missing("the cheat hook"));
            }
            let mut out = self.bytes.clone();
            if self.settings.fix_checksum {
                self.checksum.fix(&mut out)?;
            }
            return Ok(Built {
                bytes: out,
                stores: None,
            });
        };

        let mut main_fs = self.main_fs.clone();
        let mut animation_fs = self.animation_fs.clone();

        let prefix_end = self.sections.first().map_or(self.bytes.len(), |s| s.offset);
        let mut out = self.bytes[..prefix_end].to_vec();

        if !self.cheats.is_empty() {
            let desc = profile
                .hook
                .as_ref()
                .ok_or_else(|| self.missing("the cheat hook"))?;
            let fs = main_fs
                .as_mut()
                .ok_or_else(|| self.missing("the main file system"))?;
            hook::compile(&mut out, fs, desc, &self.cheats, &[])?;
        }

        let mut payloads = Vec::with_capacity(self.sections.len());
        for section in &self.sections {
            let bytes = match section.kind {
                SectionKind::MainFs => stored(&mut main_fs, section.kind)?.to_bytes()?,
                SectionKind::AnimationFs => stored(&mut animation_fs, section.kind)?.to_bytes()?,
                SectionKind::Strings => self
                    .strings
                    .as_ref()
                    .ok_or_else(|| RomError::truncated(section.kind.name(), section.offset))?
                    .to_bytes(),
                SectionKind::TextureFs => self
                    .texture_fs
                    .clone()
                    .ok_or_else(|| RomError::truncated(section.kind.name(), section.offset))?,
            };
            payloads.push(bytes);
        }

        let lens: Vec<usize> = payloads.iter().map(Vec::len).collect();
        let offsets = layout_sections(prefix_end, &lens);
        let end = offsets
            .last()
            .zip(lens.last())
            .map_or(prefix_end, |(&o, &l)| o + l);
        out.resize(end.max(self.bytes.len()), 0);

        let mut placed = Vec::with_capacity(self.sections.len());
        for ((section, bytes), &offset) in self.sections.iter().zip(&payloads).zip(&offsets) {
            out[offset..offset + bytes.len()].copy_from_slice(bytes);
            let group = &profile
                .section(section.kind)
                .ok_or_else(|| self.missing(section.kind.name()))?
                .patch_group;
            patch::rebase(&mut out, group, offset as u32)?;
            if offset != section.offset {
                debug!(
                    "{} moved {:#X} -> {offset:#X}",
                    section.kind.name(),
                    section.offset
                );
            }
            placed.push(SectionInfo {
                kind: section.kind,
                offset,
                len: bytes.len(),
            });
        }

        if self.settings.fix_checksum {
            self.checksum.fix(&mut out)?;
        }
        Ok(Built {
            bytes: out,
            stores: Some(BuiltStores {
                sections: placed,
                main_fs,
                animation_fs,
            }),
        })
    }
}

/// Output of a successful build, committed by [`RomImage::save`].
struct Built {
    bytes: Vec<u8>,
    /// `None` when the image has no known layout.
    stores: Option<BuiltStores>,
}

/// The stores as written into `Built::bytes`, hook payload included.
struct BuiltStores {
    sections: Vec<SectionInfo>,
    main_fs: Option<VirtualFileStore>,
    animation_fs: Option<VirtualFileStore>,
}

fn stored(fs: &mut Option<VirtualFileStore>, kind: SectionKind) -> Result<&mut VirtualFileStore> {
    fs.as_mut()
        .ok_or_else(|| RomError::Config(format!("{} was never extracted", kind.name())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use byteorder::{BigEndian, ByteOrder as _};

    use crate::checksum::ChecksumFixer;
    use crate::events::builtin::{self, tests_support::SYMBOLS};
    use crate::events::ParsedEvent;
    use crate::game::SectionProfile;
    use crate::hook::HookDescriptor;
    use crate::mips::{Instruction, Reg, JR_RA, NOP};
    use crate::patch::{PatchGroup, PatchSite};
    use crate::strings::{encode_text, StringKey};

    const MAIN_SITES: [usize; 2] = [0x100, 0x108];
    const STRING_SITE: usize = 0x110;
    const TEXTURE_SITE: usize = 0x118;
    const INTERCEPT: usize = 0x400;
    const HOOK_BASE: usize = 0x800;

    fn pair(buf: &mut [u8], at: usize) -> PatchSite {
        let lui = Instruction::Lui { rt: Reg::A0, imm: 0 }.encode().unwrap();
        let addiu = Instruction::Addiu {
            rt: Reg::A0,
            rs: Reg::A0,
            imm: 0,
        }
        .encode()
        .unwrap();
        BigEndian::write_u32(&mut buf[at..], lui);
        BigEndian::write_u32(&mut buf[at + 4..], addiu);
        PatchSite::new(at + 2, at + 6)
    }

    fn hook_descriptor() -> HookDescriptor {
        HookDescriptor {
            main_fs_target_file: (1, 0),
            hook_rom_base: HOOK_BASE,
            hook_ram_base: 0x8000_0800,
            hook_capacity: 0x100,
            intercept_site_offset: INTERCEPT,
            intercept_site_ram: 0x8000_0400,
            displaced_count: 3,
            cached_address_sentinel_value: 0x8000_0000,
            read_routine_ram: 0x8000_2000,
        }
    }

    /// A small MP2 image: 0x1000 bytes of header and code, then the main
    /// store, the strings and 0x40 bytes of texture data.
    fn synthetic() -> (Vec<u8>, TargetProfile) {
        let mut buf = vec![0u8; 0x1000];
        BigEndian::write_u32(&mut buf, 0x8037_1240);
        buf[ID_OFFSET..ID_OFFSET + 4].copy_from_slice(b"NMWE");

        let main_group = PatchGroup::new(
            "main file system",
            MAIN_SITES.iter().map(|&at| pair(&mut buf, at)).collect(),
        );
        let string_group = PatchGroup::new("strings", vec![pair(&mut buf, STRING_SITE)]);
        let texture_group = PatchGroup::new("texture file system", vec![pair(&mut buf, TEXTURE_SITE)]);

        for i in 0..3 {
            let word = Instruction::Addiu {
                rt: Reg::T0,
                rs: Reg::T0,
                imm: i + 1,
            }
            .encode()
            .unwrap();
            BigEndian::write_u32(&mut buf[INTERCEPT + 4 * i as usize..], word);
        }

        let mut fs = VirtualFileStore::new(StoreLayout::MAIN, BuiltinCodec::shared());
        fs.write(0, 0, b"board overlay code").unwrap();
        fs.write(0, 1, &[0u8; 0x200]).unwrap();
        fs.write(1, 0, &[]).unwrap();
        let fs_bytes = fs.to_bytes().unwrap();

        let mut strings = StringTable::default();
        strings.write(0, &encode_text("Hello!")).unwrap();
        strings.write(1, &encode_text("Roll again?")).unwrap();
        let string_bytes = StringSource::to_bytes(&strings);

        let offsets = layout_sections(0x1000, &[fs_bytes.len(), string_bytes.len(), 0x40]);
        buf.resize(offsets[2] + 0x40, 0);
        buf[offsets[0]..offsets[0] + fs_bytes.len()].copy_from_slice(&fs_bytes);
        buf[offsets[1]..offsets[1] + string_bytes.len()].copy_from_slice(&string_bytes);
        for (i, b) in buf[offsets[2]..].iter_mut().enumerate() {
            *b = i as u8;
        }
        patch::rebase(&mut buf, &main_group, offsets[0] as u32).unwrap();
        patch::rebase(&mut buf, &string_group, offsets[1] as u32).unwrap();
        patch::rebase(&mut buf, &texture_group, offsets[2] as u32).unwrap();

        let profile = TargetProfile {
            game: Game::Mp2Us,
            sections: vec![
                SectionProfile {
                    kind: SectionKind::MainFs,
                    patch_group: main_group,
                },
                SectionProfile {
                    kind: SectionKind::Strings,
                    patch_group: string_group,
                },
                SectionProfile {
                    kind: SectionKind::TextureFs,
                    patch_group: texture_group,
                },
            ],
            hook: Some(hook_descriptor()),
        };
        (buf, profile)
    }

    fn options(profile: &TargetProfile) -> LoadOptions {
        let mut symbols = SymbolTable::new();
        for (name, addr) in SYMBOLS {
            symbols.insert(Game::Mp2Us, *name, *addr);
        }
        LoadOptions {
            settings: Settings {
                fix_checksum: false,
                ..Settings::default()
            },
            profile: Some(profile.clone()),
            symbols: Arc::new(symbols),
            ..LoadOptions::default()
        }
    }

    #[test]
    fn all_byte_orders_are_normalized() {
        let (native, profile) = synthetic();
        for order in [
            ByteOrder::BigEndian,
            ByteOrder::ByteSwapped,
            ByteOrder::HalfWordSwapped,
            ByteOrder::LittleEndian,
        ] {
            let mut converted = native.clone();
            order.normalize(&mut converted).unwrap();
            assert_eq!(ByteOrder::detect(&converted).unwrap(), order);

            let image = RomImage::load_with(&converted, options(&profile)).unwrap();
            assert_eq!(image.byte_order(), order);
            assert_eq!(image.bytes(), &native[..]);
        }
        assert!(matches!(
            ByteOrder::detect(&[0, 1, 2, 3]),
            Err(RomError::UnrecognizedImage { magic: 0x0001_0203 })
        ));
    }

    #[test]
    fn unchanged_image_saves_byte_identical() {
        let (native, profile) = synthetic();
        let mut image = RomImage::load_with(&native, options(&profile)).unwrap();
        assert_eq!(image.game(), Some(Game::Mp2Us));
        assert_eq!(image.sections().len(), 3);
        assert_eq!(image.save().unwrap(), native);
    }

    #[test]
    fn edits_move_sections_and_patch_their_pointers() {
        let (native, profile) = synthetic();
        let mut image = RomImage::load_with(&native, options(&profile)).unwrap();
        let grown = vec![0x5Au8; 0x1234];
        image.main_fs_mut().unwrap().write(2, 5, &grown).unwrap();
        image
            .strings_mut()
            .unwrap()
            .write(StringKey::Index(1), &encode_text("Go!"))
            .unwrap();

        let saved = image.save().unwrap();
        for section in image.sections() {
            assert_eq!(section.offset % 16, 0);
        }
        let strings = image.sections()[1];
        assert!(strings.offset > native.len());
        let group = &profile.section(SectionKind::Strings).unwrap().patch_group;
        assert_eq!(patch::rom_offset(&saved, group, true).unwrap() as usize, strings.offset);

        let mut reloaded = RomImage::load_with(&saved, options(&profile)).unwrap();
        assert_eq!(reloaded.main_fs_mut().unwrap().read(2, 5).unwrap(), &grown[..]);
        assert_eq!(
            reloaded.main_fs_mut().unwrap().read(0, 0).unwrap(),
            b"board overlay code"
        );
        assert_eq!(
            reloaded.strings().unwrap().read(StringKey::Index(1)),
            Some(&encode_text("Go!")[..])
        );
        assert_eq!(reloaded.texture_fs().unwrap(), image.texture_fs().unwrap());
    }

    #[test]
    fn staged_cheats_bake_the_hook() {
        let (native, profile) = synthetic();
        let mut image = RomImage::load_with(&native, options(&profile)).unwrap();
        let cheat = Instruction::Addiu {
            rt: Reg::V0,
            rs: Reg::ZERO,
            imm: 99,
        }
        .encode()
        .unwrap()
        .to_be_bytes()
        .to_vec();
        image.stage_cheat(cheat.clone()).unwrap();
        let saved = image.save().unwrap();

        let redirect = Instruction::J { target: 0x8000_0800 }.encode().unwrap();
        assert_eq!(BigEndian::read_u32(&saved[INTERCEPT..]), redirect);
        assert_eq!(BigEndian::read_u32(&saved[INTERCEPT + 4..]), NOP);

        let mut reloaded = RomImage::load_with(&saved, options(&profile)).unwrap();
        let payload = reloaded.main_fs_mut().unwrap().read(1, 0).unwrap().to_vec();
        assert_eq!(&payload[..4], &cheat[..]);
        assert_eq!(BigEndian::read_u32(&payload[4..]), JR_RA);
        assert_eq!(BigEndian::read_u32(&payload[8..]), NOP);
    }

    #[test]
    fn baked_hook_survives_later_saves() {
        let (native, profile) = synthetic();
        let mut image = RomImage::load_with(&native, options(&profile)).unwrap();
        let redirect = Instruction::J { target: 0x8000_0800 }.encode().unwrap();

        image.stage_cheat(vec![0x11; 4]).unwrap();
        let first = image.save().unwrap();
        assert_eq!(image.main_fs_mut().unwrap().read(1, 0).unwrap().len(), 12);

        image.clear_cheats();
        let second = image.save().unwrap();
        assert_eq!(second, first);

        let mut reloaded = RomImage::load_with(&second, options(&profile)).unwrap();
        assert_eq!(BigEndian::read_u32(&second[INTERCEPT..]), redirect);
        assert_eq!(
            &reloaded.main_fs_mut().unwrap().read(1, 0).unwrap()[..4],
            &[0x11; 4]
        );

        // Re-baking on the same image swaps the payload and keeps the site.
        image.stage_cheat(vec![0x22; 8]).unwrap();
        let third = image.save().unwrap();
        assert_eq!(&third[..0x1000], &first[..0x1000]);
        let mut reloaded = RomImage::load_with(&third, options(&profile)).unwrap();
        assert_eq!(
            &reloaded.main_fs_mut().unwrap().read(1, 0).unwrap()[..8],
            &[0x22; 8]
        );
    }

    #[test]
    fn cleared_cheats_leave_the_image_alone() {
        let (native, profile) = synthetic();
        let mut image = RomImage::load_with(&native, options(&profile)).unwrap();
        image.stage_cheat(vec![0; 8]).unwrap();
        image.clear_cheats();
        assert_eq!(image.save().unwrap(), native);
        assert!(image.stage_cheat(vec![0; 3]).is_err());
    }

    #[test]
    fn failed_save_changes_nothing() {
        let (native, mut profile) = synthetic();
        if let Some(hook) = profile.hook.as_mut() {
            hook.hook_capacity = 8;
        }
        let mut image = RomImage::load_with(&native, options(&profile)).unwrap();
        image.main_fs_mut().unwrap().write(0, 0, b"edited").unwrap();
        image.stage_cheat(vec![0; 4]).unwrap();

        assert!(matches!(image.save(), Err(RomError::Capacity(_))));
        assert_eq!(image.bytes(), &native[..]);
        assert_eq!(image.main_fs_mut().unwrap().read(1, 0).unwrap(), &[] as &[u8]);
        assert_eq!(image.main_fs_mut().unwrap().read(0, 0).unwrap(), b"edited");
    }

    #[test]
    fn inconsistent_patch_groups_fail_the_load() {
        let (mut native, profile) = synthetic();
        BigEndian::write_u16(&mut native[MAIN_SITES[1] + 6..], 0x1230);
        assert!(matches!(
            RomImage::load_with(&native, options(&profile)),
            Err(RomError::InconsistentPatchGroup { site: 1, .. })
        ));

        let mut lenient = options(&profile);
        lenient.settings.validate_patch_groups = false;
        assert!(RomImage::load_with(&native, lenient).is_ok());
    }

    #[test]
    fn unknown_images_need_allow_unsupported() {
        let (mut native, _) = synthetic();
        native[ID_OFFSET..ID_OFFSET + 4].copy_from_slice(b"NSME");
        let settings = Settings {
            fix_checksum: false,
            ..Settings::default()
        };
        assert!(matches!(
            RomImage::load(&native, &settings),
            Err(RomError::UnsupportedImage(id)) if id == "NSME"
        ));

        let mut image = RomImage::load(
            &native,
            &Settings {
                allow_unsupported: true,
                ..settings
            },
        )
        .unwrap();
        assert!(matches!(
            image.main_fs(),
            Err(RomError::UnsupportedTarget { .. })
        ));
        assert_eq!(image.save().unwrap(), native);
        image.stage_cheat(vec![0; 4]).unwrap();
        assert!(image.save().is_err());
    }

    #[test]
    fn sections_avoid_the_hazard_range() {
        assert_eq!(layout_sections(0x1001, &[0x10, 0x20]), vec![0x1010, 0x1020]);
        // The second section would start at 0x18000.
        assert_eq!(
            layout_sections(0x17F00, &[0x100, 0x10]),
            vec![0x17F00, 0x18010]
        );
        assert_eq!(layout_sections(0x28000, &[4]), vec![0x28010]);
    }

    #[derive(Default)]
    struct CountingChecksum(AtomicUsize);

    impl ChecksumFixer for CountingChecksum {
        fn fix(&self, buf: &mut [u8]) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            buf[0x10..0x18].fill(0xCC);
            Ok(())
        }
    }

    #[test]
    fn checksum_runs_last_on_every_save() {
        let (native, profile) = synthetic();
        let fixer = Arc::new(CountingChecksum::default());
        let mut opts = options(&profile);
        opts.settings.fix_checksum = true;
        opts.checksum = fixer.clone();

        let mut image = RomImage::load_with(&native, opts).unwrap();
        let saved = image.save().unwrap();
        assert_eq!(fixer.0.load(Ordering::SeqCst), 1);
        assert_eq!(&saved[0x10..0x18], &[0xCC; 8]);
        assert_eq!(&saved[0x18..], &native[0x18..]);
    }

    #[test]
    fn board_events_round_trip_through_a_store_file() {
        let (native, profile) = synthetic();
        let mut image = RomImage::load_with(&native, options(&profile)).unwrap();
        let target = BoardTarget {
            dir: 0,
            file: 1,
            offset: 0x40,
            capacity: 0x1C0,
            ram_base: 0x8010_0000,
        };
        let mut spaces = vec![SpaceEvents {
            space: 4,
            events: vec![
                image.create_event(builtin::ADJUST_COINS, vec![-3]).unwrap(),
                image.create_event(builtin::SHARED_DIALOG, vec![]).unwrap(),
            ],
        }];

        let report = image.write_board_events(&target, &mut spaces).unwrap();
        assert!(report.failures.is_empty());
        image.save().unwrap();

        let mut reloaded = RomImage::load_with(image.bytes(), options(&profile)).unwrap();
        let parsed = reloaded
            .parse_board_events(&target, report.table_offset)
            .unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].space, 4);
        match &parsed[0].events[0] {
            ParsedEvent::Recognized(e) => {
                assert_eq!(e.id, builtin::ADJUST_COINS);
                assert_eq!(e.args, vec![-3]);
            }
            other => panic!("{other:?}"),
        }
        assert!(matches!(&parsed[0].events[1], ParsedEvent::Recognized(e) if e.id == builtin::SHARED_DIALOG));
    }

    #[test]
    fn one_image_rewrites_and_reparses_boards() {
        let (native, profile) = synthetic();
        let mut image = RomImage::load_with(&native, options(&profile)).unwrap();
        let target = BoardTarget {
            dir: 0,
            file: 1,
            offset: 0x40,
            capacity: 0x1C0,
            ram_base: 0x8010_0000,
        };
        let first_id = |parsed: &[ParsedSpace]| match &parsed[0].events[0] {
            ParsedEvent::Recognized(e) => (e.id.clone(), e.args.clone()),
            other => panic!("{other:?}"),
        };

        let mut coins = vec![SpaceEvents {
            space: 2,
            events: vec![image.create_event(builtin::ADJUST_COINS, vec![5]).unwrap()],
        }];
        let report = image.write_board_events(&target, &mut coins).unwrap();
        let parsed = image.parse_board_events(&target, report.table_offset).unwrap();
        assert_eq!(first_id(&parsed), (builtin::ADJUST_COINS.to_string(), vec![5]));

        let mut warp = vec![SpaceEvents {
            space: 2,
            events: vec![image.create_event(builtin::WARP_TO_SPACE, vec![9]).unwrap()],
        }];
        let report = image.write_board_events(&target, &mut warp).unwrap();
        let parsed = image.parse_board_events(&target, report.table_offset).unwrap();
        assert_eq!(first_id(&parsed), (builtin::WARP_TO_SPACE.to_string(), vec![9]));

        // Saving twice keeps the board, then it still parses from the image.
        let first = image.save().unwrap();
        assert_eq!(image.save().unwrap(), first);
        let parsed = image.parse_board_events(&target, report.table_offset).unwrap();
        assert_eq!(first_id(&parsed), (builtin::WARP_TO_SPACE.to_string(), vec![9]));
    }
}
