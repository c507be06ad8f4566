//! Section pointers baked into code as `lui` / `addiu` immediate pairs.

use log::trace;

use crate::codec;
use crate::mips::{join_address, split_address_for_load};
use crate::{RomError, Result};

/// ROM offsets of the two immediate halfwords that together hold an address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PatchSite {
    pub upper: usize,
    pub lower: usize,
}

impl PatchSite {
    pub const fn new(upper: usize, lower: usize) -> Self {
        Self { upper, lower }
    }

    pub fn read(&self, buf: &[u8]) -> Result<u32> {
        let upper = codec::read_u16(buf, self.upper, "patch site upper half")?;
        let lower = codec::read_u16(buf, self.lower, "patch site lower half")?;
        Ok(join_address(upper, lower))
    }

    pub fn write(&self, buf: &mut [u8], value: u32) -> Result<()> {
        let (upper, lower) = split_address_for_load(value);
        codec::write_u16(buf, self.upper, upper, "patch site upper half")?;
        codec::write_u16(buf, self.lower, lower, "patch site lower half")
    }
}

/// Redundant pointers to one section. Every site must resolve the same.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PatchGroup {
    pub name: String,
    pub sites: Vec<PatchSite>,
}

impl PatchGroup {
    pub fn new(name: impl Into<String>, sites: Vec<PatchSite>) -> Self {
        Self {
            name: name.into(),
            sites,
        }
    }

    fn first(&self) -> Result<&PatchSite> {
        self.sites
            .first()
            .ok_or_else(|| RomError::Capacity(format!("patch group {} has no sites", self.name)))
    }
}

/// Resolves the section offset from the first site, cross-checking the rest
/// when `validate` is set.
pub fn rom_offset(buf: &[u8], group: &PatchGroup, validate: bool) -> Result<u32> {
    let expected = group.first()?.read(buf)?;
    if validate {
        for (i, site) in group.sites.iter().enumerate().skip(1) {
            let found = site.read(buf)?;
            if found != expected {
                return Err(RomError::InconsistentPatchGroup {
                    section: group.name.clone(),
                    site: i,
                    expected,
                    found,
                });
            }
        }
    }
    Ok(expected)
}

/// Points every site of `group` at `new_offset`.
pub fn rebase(buf: &mut [u8], group: &PatchGroup, new_offset: u32) -> Result<()> {
    group.first()?;
    for site in &group.sites {
        site.write(buf, new_offset)?;
    }
    trace!(
        "rebased {} ({} sites) to {new_offset:#X}",
        group.name,
        group.sites.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mips::{Instruction, Reg};

    fn image_with_sites() -> (Vec<u8>, PatchGroup) {
        let mut buf = vec![0u8; 0x40];
        // Two lui/addiu pairs, the immediates live in the low halfwords.
        let code = [
            Instruction::Lui { rt: Reg::A0, imm: 0 },
            Instruction::Addiu { rt: Reg::A0, rs: Reg::A0, imm: 0 },
            Instruction::Lui { rt: Reg::A1, imm: 0 },
            Instruction::Addiu { rt: Reg::A1, rs: Reg::A1, imm: 0 },
        ];
        let bytes = crate::mips::encode_all(&code).unwrap();
        buf[0x10..0x20].copy_from_slice(&bytes);
        let group = PatchGroup::new(
            "main file system",
            vec![PatchSite::new(0x12, 0x16), PatchSite::new(0x1A, 0x1E)],
        );
        (buf, group)
    }

    #[test]
    fn rebase_then_read_agrees_on_every_site() {
        let (mut buf, group) = image_with_sites();
        for target in [0x0031_C7E0u32, 0x0001_7FF0, 0x00AB_8000] {
            rebase(&mut buf, &group, target).unwrap();
            for site in &group.sites {
                assert_eq!(site.read(&buf).unwrap(), target);
            }
            assert_eq!(rom_offset(&buf, &group, true).unwrap(), target);
        }
        // Opcodes are untouched.
        assert_eq!(
            Instruction::decode(u32::from_be_bytes([buf[0x10], buf[0x11], buf[0x12], buf[0x13]]))
                .unwrap(),
            Instruction::Lui { rt: Reg::A0, imm: 0x00AC }
        );
    }

    #[test]
    fn inconsistent_sites_name_the_section() {
        let (mut buf, group) = image_with_sites();
        rebase(&mut buf, &group, 0x0010_0000).unwrap();
        group.sites[1].write(&mut buf, 0x0020_0000).unwrap();

        // Without validation the first site wins.
        assert_eq!(rom_offset(&buf, &group, false).unwrap(), 0x0010_0000);
        match rom_offset(&buf, &group, true).unwrap_err() {
            RomError::InconsistentPatchGroup {
                section,
                site,
                expected,
                found,
            } => {
                assert_eq!(section, "main file system");
                assert_eq!(site, 1);
                assert_eq!(expected, 0x0010_0000);
                assert_eq!(found, 0x0020_0000);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn empty_groups_are_refused() {
        let mut buf = vec![0u8; 8];
        let group = PatchGroup::new("empty", Vec::new());
        assert!(matches!(rebase(&mut buf, &group, 4), Err(RomError::Capacity(_))));
        assert!(rom_offset(&buf, &group, true).is_err());
    }
}
