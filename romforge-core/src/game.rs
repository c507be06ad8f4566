//! Supported images and the per-revision constants needed to take them apart.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hook::HookDescriptor;
use crate::patch::{PatchGroup, PatchSite};

/// Offset of the four-character identifier in the image header.
pub const ID_OFFSET: usize = 0x3B;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Game {
    #[serde(rename = "NLXE")]
    Mp1Us,
    #[serde(rename = "NLXJ")]
    Mp1Jp,
    #[serde(rename = "NLXP")]
    Mp1Pal,
    #[serde(rename = "NMWE")]
    Mp2Us,
    #[serde(rename = "NMWJ")]
    Mp2Jp,
    #[serde(rename = "NMWP")]
    Mp2Pal,
    #[serde(rename = "NMVE")]
    Mp3Us,
    #[serde(rename = "NMVJ")]
    Mp3Jp,
    #[serde(rename = "NMVP")]
    Mp3Pal,
}

impl Game {
    pub const ALL: [Game; 9] = [
        Game::Mp1Us,
        Game::Mp1Jp,
        Game::Mp1Pal,
        Game::Mp2Us,
        Game::Mp2Jp,
        Game::Mp2Pal,
        Game::Mp3Us,
        Game::Mp3Jp,
        Game::Mp3Pal,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Game::Mp1Us => "NLXE",
            Game::Mp1Jp => "NLXJ",
            Game::Mp1Pal => "NLXP",
            Game::Mp2Us => "NMWE",
            Game::Mp2Jp => "NMWJ",
            Game::Mp2Pal => "NMWP",
            Game::Mp3Us => "NMVE",
            Game::Mp3Jp => "NMVJ",
            Game::Mp3Pal => "NMVP",
        }
    }

    pub fn from_id(id: &str) -> Option<Game> {
        Game::ALL.iter().copied().find(|g| g.id() == id)
    }

    pub fn generation(self) -> u8 {
        match self {
            Game::Mp1Us | Game::Mp1Jp | Game::Mp1Pal => 1,
            Game::Mp2Us | Game::Mp2Jp | Game::Mp2Pal => 2,
            Game::Mp3Us | Game::Mp3Jp | Game::Mp3Pal => 3,
        }
    }

    fn region(self) -> &'static str {
        match self.id().as_bytes()[3] {
            b'E' => "US",
            b'J' => "JP",
            _ => "PAL",
        }
    }
}

impl fmt::Display for Game {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Mario Party {} ({}, {})",
            self.generation(),
            self.region(),
            self.id()
        )
    }
}

/// What a relocatable section holds.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SectionKind {
    MainFs,
    Strings,
    /// Packed texture data, carried through as opaque bytes.
    TextureFs,
    AnimationFs,
}

impl SectionKind {
    pub fn name(self) -> &'static str {
        match self {
            SectionKind::MainFs => "main file system",
            SectionKind::Strings => "strings",
            SectionKind::TextureFs => "texture file system",
            SectionKind::AnimationFs => "animation file system",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SectionProfile {
    pub kind: SectionKind,
    pub patch_group: PatchGroup,
}

impl SectionProfile {
    fn new(kind: SectionKind, sites: &[(usize, usize)]) -> Self {
        Self {
            kind,
            patch_group: PatchGroup::new(
                kind.name(),
                sites.iter().map(|&(u, l)| PatchSite::new(u, l)).collect(),
            ),
        }
    }
}

/// Everything needed to take one revision apart and put it back together.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetProfile {
    pub game: Game,
    pub sections: Vec<SectionProfile>,
    pub hook: Option<HookDescriptor>,
}

impl TargetProfile {
    pub fn section(&self, kind: SectionKind) -> Option<&SectionProfile> {
        self.sections.iter().find(|s| s.kind == kind)
    }
}

/// ROM offset of the boot segment, loaded at [`BOOT_SEGMENT_RAM`].
pub const BOOT_SEGMENT_ROM: usize = 0x1000;
pub const BOOT_SEGMENT_RAM: u32 = 0x8000_0400;
/// The boot segment is the first megabyte after the header.
pub const BOOT_SEGMENT_LEN: usize = 0x10_0000;

/// RAM address of a boot segment ROM offset.
pub fn boot_ram(rom_offset: usize) -> u32 {
    BOOT_SEGMENT_RAM.wrapping_add((rom_offset - BOOT_SEGMENT_ROM) as u32)
}

/// Profile for `game`, or `None` when the revision has no known layout.
///
/// Every site is the pair of immediate halfwords of a `lui`/`addiu` in the
/// boot segment that loads the section's ROM address. Hook addresses are
/// boot segment code too, so `*_ram` and `*_rom` agree through [`boot_ram`].
/// Loading checks every group's sites against each other.
pub fn profile(game: Game) -> Option<TargetProfile> {
    use SectionKind::*;

    let (sections, hook) = match game {
        // NLXE v1.0
        Game::Mp1Us => (
            vec![
                SectionProfile::new(MainFs, &[(0x3D6A, 0x3D72), (0x3DAE, 0x3DB6)]),
                SectionProfile::new(Strings, &[(0x1AE6E, 0x1AE76), (0x1AF02, 0x1AF0A)]),
                SectionProfile::new(TextureFs, &[(0x5B0E2, 0x5B0EA)]),
            ],
            Some(HookDescriptor {
                main_fs_target_file: (10, 0),
                hook_rom_base: 0x000C_A3E0,
                hook_ram_base: 0x800C_97E0,
                hook_capacity: 0x100,
                intercept_site_offset: 0x0004_2D58,
                intercept_site_ram: 0x8004_2158,
                displaced_count: 3,
                cached_address_sentinel_value: 0x8000_0000,
                read_routine_ram: 0x8000_9A1C,
            }),
        ),
        // NMWE v1.0
        Game::Mp2Us => (
            vec![
                SectionProfile::new(MainFs, &[(0x41DD2, 0x41DDA), (0x41E2E, 0x41E36)]),
                SectionProfile::new(Strings, &[(0x1D1D6, 0x1D1DE), (0x1D2A2, 0x1D2AA)]),
                SectionProfile::new(TextureFs, &[(0x7BE0E, 0x7BE16)]),
                SectionProfile::new(AnimationFs, &[(0x6A93A, 0x6A942)]),
            ],
            Some(HookDescriptor {
                main_fs_target_file: (10, 424),
                hook_rom_base: 0x000E_8D90,
                hook_ram_base: 0x800E_8190,
                hook_capacity: 0x100,
                intercept_site_offset: 0x0004_6A30,
                intercept_site_ram: 0x8004_5E30,
                displaced_count: 4,
                cached_address_sentinel_value: 0x8000_0000,
                read_routine_ram: 0x8001_7680,
            }),
        ),
        // NMVE v1.0
        Game::Mp3Us => (
            vec![
                SectionProfile::new(MainFs, &[(0x3B76E, 0x3B776), (0x3B7B2, 0x3B7BA)]),
                SectionProfile::new(Strings, &[(0x0F56A, 0x0F572), (0x0F5D2, 0x0F5DA)]),
                SectionProfile::new(TextureFs, &[(0x6D5AE, 0x6D5B6)]),
            ],
            Some(HookDescriptor {
                main_fs_target_file: (9, 30),
                hook_rom_base: 0x000F_B780,
                hook_ram_base: 0x800F_AB80,
                hook_capacity: 0x100,
                intercept_site_offset: 0x0004_8190,
                intercept_site_ram: 0x8004_7590,
                displaced_count: 3,
                cached_address_sentinel_value: 0x8000_0000,
                read_routine_ram: 0x8000_EB58,
            }),
        ),
        _ => return None,
    };

    Some(TargetProfile {
        game,
        sections,
        hook,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip() {
        for game in Game::ALL {
            assert_eq!(Game::from_id(game.id()), Some(game));
            let json = serde_json::to_string(&game).unwrap();
            assert_eq!(json, format!("\"{}\"", game.id()));
        }
        assert_eq!(Game::from_id("NSME"), None);
        assert_eq!(Game::Mp2Us.to_string(), "Mario Party 2 (US, NMWE)");
    }

    #[test]
    fn us_revisions_have_profiles() {
        for game in [Game::Mp1Us, Game::Mp2Us, Game::Mp3Us] {
            let p = profile(game).unwrap();
            assert!(p.section(SectionKind::MainFs).is_some());
            assert!(p.section(SectionKind::Strings).is_some());
            assert!(p.hook.is_some());
            for s in &p.sections {
                assert!(!s.patch_group.sites.is_empty());
            }
        }
        assert!(profile(Game::Mp2Pal).is_none());
        // Only the second generation ships an animation store.
        assert!(profile(Game::Mp2Us)
            .unwrap()
            .section(SectionKind::AnimationFs)
            .is_some());
        assert!(profile(Game::Mp3Us)
            .unwrap()
            .section(SectionKind::AnimationFs)
            .is_none());
    }

    #[test]
    fn retail_constants_agree_with_the_boot_segment() {
        let segment = BOOT_SEGMENT_ROM..BOOT_SEGMENT_ROM + BOOT_SEGMENT_LEN;
        for game in [Game::Mp1Us, Game::Mp2Us, Game::Mp3Us] {
            let p = profile(game).unwrap();
            for s in &p.sections {
                for site in &s.patch_group.sites {
                    // Low halves of adjacent `lui` / `addiu` words.
                    assert_eq!(site.upper % 4, 2, "{game}");
                    assert_eq!(site.lower, site.upper + 8, "{game}");
                    assert!(segment.contains(&site.lower), "{game}");
                }
            }

            let hook = p.hook.unwrap();
            assert_eq!(boot_ram(hook.hook_rom_base), hook.hook_ram_base, "{game}");
            assert_eq!(boot_ram(hook.intercept_site_offset), hook.intercept_site_ram, "{game}");
            assert!(segment.contains(&(hook.hook_rom_base + hook.hook_capacity - 1)));
            assert!(hook.read_routine_ram < boot_ram(segment.end));
            assert_eq!(hook.intercept_site_offset % 4, 0);
        }
    }
}
