//! Cheat hook: redirects an always-executed site into a trampoline that
//! lazily loads a payload file from the main store and calls it each frame.

use log::{debug, info};

use crate::codec;
use crate::fs::VirtualFileStore;
use crate::mips::{self, split_address_for_load, Instruction, Reg, JR_RA, NOP};
use crate::{RomError, Result};

/// Per-revision constants for the cheat hook.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HookDescriptor {
    /// Directory and file the payload is written to in the main store.
    pub main_fs_target_file: (usize, usize),
    pub hook_rom_base: usize,
    pub hook_ram_base: u32,
    /// Free bytes available at `hook_rom_base`.
    pub hook_capacity: usize,
    pub intercept_site_offset: usize,
    pub intercept_site_ram: u32,
    /// Instructions moved out of the intercept site, delay slot included.
    pub displaced_count: usize,
    /// Value the pointer cell holds until the payload is loaded.
    pub cached_address_sentinel_value: u32,
    /// RAM address of the routine that reads and decompresses a store file.
    pub read_routine_ram: u32,
}

/// Words emitted before the replayed instructions.
const PROLOGUE_WORDS: usize = 26;
const FRAME: i16 = 0x28;

impl HookDescriptor {
    /// Size in words of the trampoline for this descriptor.
    pub fn trampoline_words(&self) -> usize {
        PROLOGUE_WORDS + self.displaced_count + 3
    }

    fn cache_cell_ram(&self) -> u32 {
        self.hook_ram_base + 4 * (PROLOGUE_WORDS + self.displaced_count + 2) as u32
    }

    fn redirect_word(&self) -> Result<u32> {
        Instruction::J {
            target: self.hook_ram_base,
        }
        .encode()
    }
}

/// Concatenates staged cheats, any extra words and a closing `jr $ra`.
pub fn build_payload(cheats: &[Vec<u8>], trailing_words: &[u32]) -> Vec<u8> {
    let mut payload: Vec<u8> = cheats.iter().flatten().copied().collect();
    while payload.len() % 4 != 0 {
        payload.push(0);
    }
    for word in trailing_words.iter().chain([JR_RA, NOP].iter()) {
        payload.extend_from_slice(&word.to_be_bytes());
    }
    payload
}

/// True when the intercept site already jumps into the hook region.
pub fn is_baked(buf: &[u8], desc: &HookDescriptor) -> Result<bool> {
    let word = codec::read_u32(buf, desc.intercept_site_offset, "hook intercept site")?;
    Ok(word == desc.redirect_word()?)
}

/// The original instructions of the intercept site, recovered from the old
/// trampoline when the hook was baked before.
pub fn displaced_words(buf: &[u8], desc: &HookDescriptor) -> Result<Vec<u32>> {
    let base = if is_baked(buf, desc)? {
        desc.hook_rom_base + PROLOGUE_WORDS * 4
    } else {
        desc.intercept_site_offset
    };

    let mut words = Vec::with_capacity(desc.displaced_count);
    for i in 0..desc.displaced_count {
        let word = codec::read_u32(buf, base + i * 4, "displaced instruction")?;
        if mips::word_is_control_flow(word) {
            return Err(RomError::MalformedInstruction {
                word,
                reason: "control flow cannot be moved out of the intercept site",
            });
        }
        words.push(word);
    }
    Ok(words)
}

/// Emits the trampoline placed at `hook_ram_base`.
pub fn trampoline(desc: &HookDescriptor, displaced: &[u32]) -> Result<Vec<u8>> {
    use Instruction as I;

    let (cell_hi, cell_lo) = split_address_for_load(desc.cache_cell_ram());
    let (dir, file) = desc.main_fs_target_file;
    let file_id = |v: usize, what: &str| {
        u16::try_from(v).map_err(|_| RomError::Capacity(format!("payload {what} {v} is too large")))
    };
    let (dir, file) = (file_id(dir, "directory")?, file_id(file, "file")?);
    let sentinel = desc.cached_address_sentinel_value;

    let save = |rt, offset| I::Sw { rt, base: Reg::SP, offset };
    let restore = |rt, offset| I::Lw { rt, base: Reg::SP, offset };

    let mut code = vec![
        I::Addiu { rt: Reg::SP, rs: Reg::SP, imm: -FRAME },
        save(Reg::RA, 0x10),
        save(Reg::A0, 0x14),
        save(Reg::A1, 0x18),
        save(Reg::A2, 0x1C),
        save(Reg::A3, 0x20),
        I::Lui { rt: Reg::T0, imm: cell_hi },
        I::Lw { rt: Reg::T1, base: Reg::T0, offset: cell_lo as i16 },
        I::Lui { rt: Reg::T2, imm: (sentinel >> 16) as u16 },
        I::Ori { rt: Reg::T2, rs: Reg::T2, imm: sentinel as u16 },
        // to `loaded`, counted from the delay slot
        I::Bne { rs: Reg::T1, rt: Reg::T2, offset: 7 * 4 },
        I::Nop,
        I::Lui { rt: Reg::A0, imm: dir },
        I::Jal { target: desc.read_routine_ram },
        I::Ori { rt: Reg::A0, rs: Reg::A0, imm: file },
        I::Lui { rt: Reg::T0, imm: cell_hi },
        I::Sw { rt: Reg::V0, base: Reg::T0, offset: cell_lo as i16 },
        I::Addu { rd: Reg::T1, rs: Reg::V0, rt: Reg::ZERO },
        // loaded:
        I::Jalr { rd: Reg::RA, rs: Reg::T1 },
        I::Nop,
        restore(Reg::RA, 0x10),
        restore(Reg::A0, 0x14),
        restore(Reg::A1, 0x18),
        restore(Reg::A2, 0x1C),
        restore(Reg::A3, 0x20),
        I::Addiu { rt: Reg::SP, rs: Reg::SP, imm: FRAME },
    ];
    debug_assert_eq!(code.len(), PROLOGUE_WORDS);

    let mut bytes = mips::encode_all(&code)?;
    for word in displaced {
        bytes.extend_from_slice(&word.to_be_bytes());
    }

    code.clear();
    code.push(I::J {
        target: desc.intercept_site_ram + 4 * displaced.len() as u32,
    });
    code.push(I::Nop);
    bytes.extend_from_slice(&mips::encode_all(&code)?);
    bytes.extend_from_slice(&sentinel.to_be_bytes());
    Ok(bytes)
}

/// Bakes the hook for `cheats` into `buf` and the payload into `main_fs`.
///
/// Returns `false` without touching anything when no cheats are staged.
pub fn compile(
    buf: &mut [u8],
    main_fs: &mut VirtualFileStore,
    desc: &HookDescriptor,
    cheats: &[Vec<u8>],
    trailing_words: &[u32],
) -> Result<bool> {
    if cheats.is_empty() {
        return Ok(false);
    }
    if desc.displaced_count < 2 {
        return Err(RomError::Config(
            "the intercept site needs room for a jump and its delay slot".to_string(),
        ));
    }

    let rebake = is_baked(buf, desc)?;
    let displaced = displaced_words(buf, desc)?;
    let code = trampoline(desc, &displaced)?;
    if code.len() > desc.hook_capacity {
        return Err(RomError::Capacity(format!(
            "hook trampoline needs {} bytes, {} available at {:#X}",
            code.len(),
            desc.hook_capacity,
            desc.hook_rom_base
        )));
    }

    let payload = build_payload(cheats, trailing_words);
    let (dir, file) = desc.main_fs_target_file;
    main_fs.write(dir, file, &payload)?;

    let region = buf
        .get_mut(desc.hook_rom_base..desc.hook_rom_base + code.len())
        .ok_or_else(|| RomError::truncated("hook region", desc.hook_rom_base))?;
    region.copy_from_slice(&code);

    let redirect = desc.redirect_word()?;
    for i in 0..desc.displaced_count {
        let word = if i == 0 { redirect } else { NOP };
        codec::write_u32(buf, desc.intercept_site_offset + i * 4, word, "hook intercept site")?;
    }

    if rebake {
        debug!("hook was already baked, replaced its trampoline");
    }
    info!(
        "baked cheat hook: {} cheats, {} byte payload in file {dir}/{file}",
        cheats.len(),
        payload.len()
    );
    Ok(true)
}

/// Reads back the trampoline word at `index`, for inspection.
pub fn trampoline_word(buf: &[u8], desc: &HookDescriptor, index: usize) -> Result<u32> {
    codec::read_u32(buf, desc.hook_rom_base + index * 4, "hook trampoline")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::BuiltinCodec;
    use byteorder::{BigEndian, ByteOrder};
    use crate::fs::StoreLayout;

    fn descriptor() -> HookDescriptor {
        HookDescriptor {
            main_fs_target_file: (1, 3),
            hook_rom_base: 0x100,
            hook_ram_base: 0x8000_0500,
            hook_capacity: 0x100,
            intercept_site_offset: 0x40,
            intercept_site_ram: 0x8000_0440,
            displaced_count: 3,
            cached_address_sentinel_value: 0xDEAD_BEEF,
            read_routine_ram: 0x8001_2340,
        }
    }

    fn image() -> Vec<u8> {
        let mut buf = vec![0u8; 0x300];
        let site = mips::encode_all(&[
            Instruction::Addiu { rt: Reg::SP, rs: Reg::SP, imm: -0x18 },
            Instruction::Sw { rt: Reg::RA, base: Reg::SP, offset: 0x14 },
            Instruction::Addu { rd: Reg::S0, rs: Reg::A0, rt: Reg::ZERO },
        ])
        .unwrap();
        buf[0x40..0x4C].copy_from_slice(&site);
        buf
    }

    fn store() -> VirtualFileStore {
        VirtualFileStore::new(StoreLayout::MAIN, BuiltinCodec::shared())
    }

    #[test]
    fn zero_cheats_change_nothing() {
        let mut buf = image();
        let original = buf.clone();
        let mut fs = store();
        assert!(!compile(&mut buf, &mut fs, &descriptor(), &[], &[0x1234]).unwrap());
        assert_eq!(buf, original);
        assert_eq!(fs.dir_count(), 0);
    }

    #[test]
    fn trampoline_layout_and_site_redirect() {
        let desc = descriptor();
        let mut buf = image();
        let site: Vec<u32> = (0..3)
            .map(|i| BigEndian::read_u32(&buf[0x40 + i * 4..]))
            .collect();
        let mut fs = store();
        assert!(compile(&mut buf, &mut fs, &desc, &[vec![1, 2, 3, 4]], &[]).unwrap());

        assert!(is_baked(&buf, &desc).unwrap());
        assert_eq!(BigEndian::read_u32(&buf[0x44..]), NOP);
        assert_eq!(BigEndian::read_u32(&buf[0x48..]), NOP);

        for (i, word) in site.iter().enumerate() {
            assert_eq!(trampoline_word(&buf, &desc, PROLOGUE_WORDS + i).unwrap(), *word);
        }
        let back = trampoline_word(&buf, &desc, PROLOGUE_WORDS + 3).unwrap();
        assert_eq!(
            Instruction::decode(back).unwrap(),
            Instruction::J { target: 0x0000_044C }
        );
        let cell = trampoline_word(&buf, &desc, desc.trampoline_words() - 1).unwrap();
        assert_eq!(cell, 0xDEAD_BEEF);

        // The cell load resolves to the cell's own RAM address.
        let lui = trampoline_word(&buf, &desc, 6).unwrap();
        let lw = trampoline_word(&buf, &desc, 7).unwrap();
        let cell_ram = mips::join_address(lui as u16, lw as u16);
        assert_eq!(cell_ram, desc.hook_ram_base + 4 * (desc.trampoline_words() as u32 - 1));

        let jal = trampoline_word(&buf, &desc, 13).unwrap();
        assert_eq!(mips::extract_jal_target(jal).unwrap(), 0x0001_2340);

        assert_eq!(
            fs.read(1, 3).unwrap(),
            &[1, 2, 3, 4, 0x03, 0xE0, 0x00, 0x08, 0, 0, 0, 0][..]
        );
    }

    #[test]
    fn rebake_recovers_original_instructions() {
        let desc = descriptor();
        let mut buf = image();
        let mut fs = store();
        compile(&mut buf, &mut fs, &desc, &[vec![0xAA; 4]], &[]).unwrap();
        let first = buf.clone();

        compile(&mut buf, &mut fs, &desc, &[vec![0xBB; 8]], &[]).unwrap();
        assert_eq!(buf, first);
        assert_eq!(&fs.read(1, 3).unwrap()[..8], &[0xBB; 8]);
    }

    #[test]
    fn control_flow_in_displaced_words_is_rejected() {
        let desc = descriptor();
        let mut buf = image();
        BigEndian::write_u32(&mut buf[0x44..], JR_RA);
        let err = compile(&mut buf, &mut store(), &desc, &[vec![0; 4]], &[]).unwrap_err();
        assert!(matches!(err, RomError::MalformedInstruction { .. }));
    }

    #[test]
    fn oversized_trampoline_is_a_capacity_error() {
        let desc = HookDescriptor {
            hook_capacity: 16,
            ..descriptor()
        };
        let mut buf = image();
        let original = buf.clone();
        let err = compile(&mut buf, &mut store(), &desc, &[vec![0; 4]], &[]).unwrap_err();
        assert!(matches!(err, RomError::Capacity(_)));
        assert_eq!(buf, original);
    }

    #[test]
    fn payload_is_word_aligned_and_returns() {
        let payload = build_payload(&[vec![1, 2], vec![3]], &[0xCAFE_F00D]);
        assert_eq!(payload.len(), 4 + 4 + 8);
        assert_eq!(&payload[..4], &[1, 2, 3, 0]);
        assert_eq!(BigEndian::read_u32(&payload[4..]), 0xCAFE_F00D);
        assert_eq!(BigEndian::read_u32(&payload[8..]), JR_RA);
    }
}
