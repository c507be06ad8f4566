use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::{RomError, Result};

/// Boot checksum recomputation, applied once to a finished image.
pub trait ChecksumFixer {
    fn fix(&self, buf: &mut [u8]) -> Result<()>;
}

pub type SharedChecksum = Arc<dyn ChecksumFixer + Send + Sync>;

const SEED_6102: u32 = 0xF8CA_4DDC;
const CHECKSUM_START: usize = 0x1000;
const CHECKSUM_LENGTH: usize = 0x10_0000;
const CRC1_OFFSET: usize = 0x10;
const CRC2_OFFSET: usize = 0x14;

/// CRC pair checked by the CIC-6102 boot chip.
#[derive(Clone, Copy, Debug, Default)]
pub struct N64Checksum;

impl N64Checksum {
    pub fn shared() -> SharedChecksum {
        Arc::new(N64Checksum)
    }

    pub fn compute(buf: &[u8]) -> Result<(u32, u32)> {
        let data = buf
            .get(CHECKSUM_START..CHECKSUM_START + CHECKSUM_LENGTH)
            .ok_or_else(|| RomError::truncated("checksummed region", buf.len()))?;

        let (mut t1, mut t2, mut t3, mut t4, mut t5, mut t6) = (
            SEED_6102, SEED_6102, SEED_6102, SEED_6102, SEED_6102, SEED_6102,
        );

        for chunk in data.chunks_exact(4) {
            let d = BigEndian::read_u32(chunk);
            if t6.wrapping_add(d) < t6 {
                t4 = t4.wrapping_add(1);
            }
            t6 = t6.wrapping_add(d);
            t3 ^= d;
            let r = d.rotate_left(d & 0x1F);
            t5 = t5.wrapping_add(r);
            if t2 > d {
                t2 ^= r;
            } else {
                t2 ^= t6 ^ d;
            }
            t1 = t1.wrapping_add(t5 ^ d);
        }

        Ok((t6 ^ t4 ^ t3, t5 ^ t2 ^ t1))
    }
}

impl ChecksumFixer for N64Checksum {
    fn fix(&self, buf: &mut [u8]) -> Result<()> {
        let (crc1, crc2) = Self::compute(buf)?;
        BigEndian::write_u32(&mut buf[CRC1_OFFSET..CRC1_OFFSET + 4], crc1);
        BigEndian::write_u32(&mut buf[CRC2_OFFSET..CRC2_OFFSET + 4], crc2);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_image_has_known_crcs() {
        let mut buf = vec![0u8; CHECKSUM_START + CHECKSUM_LENGTH];
        N64Checksum.fix(&mut buf).unwrap();
        assert_eq!(BigEndian::read_u32(&buf[0x10..]), 0);
        assert_eq!(BigEndian::read_u32(&buf[0x14..]), 0x303A_4DDC);
    }

    #[test]
    fn fix_is_stable_and_tracks_content() {
        let mut buf = vec![0u8; CHECKSUM_START + CHECKSUM_LENGTH + 0x20];
        for (i, b) in buf.iter_mut().enumerate().skip(CHECKSUM_START) {
            *b = (i * 7 % 251) as u8;
        }
        N64Checksum.fix(&mut buf).unwrap();
        let first = buf[0x10..0x18].to_vec();
        N64Checksum.fix(&mut buf).unwrap();
        assert_eq!(&buf[0x10..0x18], &first[..]);

        buf[0x2000] ^= 0xFF;
        N64Checksum.fix(&mut buf).unwrap();
        assert_ne!(&buf[0x10..0x18], &first[..]);
    }

    #[test]
    fn short_images_are_truncated() {
        let mut buf = vec![0u8; 0x2000];
        assert!(matches!(
            N64Checksum.fix(&mut buf),
            Err(RomError::Truncated { .. })
        ));
    }
}
