//! Encoding and decoding of the MIPS instructions the engine emits or has to
//! look at inside existing code.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use crate::{RomError, Result};

/// `jr $ra`, the epilogue every compiled function ends with.
pub const JR_RA: u32 = 0x03E0_0008;
pub const NOP: u32 = 0;

/// How far `scan_function_length` looks before giving up.
const FUNCTION_SCAN_WINDOW: usize = 0x4000;

const OP_SPECIAL: u32 = 0x00;
const OP_REGIMM: u32 = 0x01;
const OP_J: u32 = 0x02;
const OP_JAL: u32 = 0x03;
const OP_BEQ: u32 = 0x04;
const OP_BNE: u32 = 0x05;
const OP_BLEZ: u32 = 0x06;
const OP_BGTZ: u32 = 0x07;
const OP_ADDIU: u32 = 0x09;
const OP_SLTI: u32 = 0x0A;
const OP_ANDI: u32 = 0x0C;
const OP_ORI: u32 = 0x0D;
const OP_LUI: u32 = 0x0F;
const OP_LB: u32 = 0x20;
const OP_LH: u32 = 0x21;
const OP_LW: u32 = 0x23;
const OP_LBU: u32 = 0x24;
const OP_LHU: u32 = 0x25;
const OP_SB: u32 = 0x28;
const OP_SH: u32 = 0x29;
const OP_SW: u32 = 0x2B;

const FN_SLL: u32 = 0x00;
const FN_SRL: u32 = 0x02;
const FN_JR: u32 = 0x08;
const FN_JALR: u32 = 0x09;
const FN_ADDU: u32 = 0x21;
const FN_SUBU: u32 = 0x23;
const FN_AND: u32 = 0x24;
const FN_OR: u32 = 0x25;
const FN_SLT: u32 = 0x2A;

const RT_BLTZ: u32 = 0x00;
const RT_BGEZ: u32 = 0x01;

const REGISTER_NAMES: [&str; 32] = [
    "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5", "t6",
    "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1", "gp", "sp",
    "fp", "ra",
];

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Reg(u8);

impl Reg {
    pub const ZERO: Reg = Reg(0);
    pub const AT: Reg = Reg(1);
    pub const V0: Reg = Reg(2);
    pub const V1: Reg = Reg(3);
    pub const A0: Reg = Reg(4);
    pub const A1: Reg = Reg(5);
    pub const A2: Reg = Reg(6);
    pub const A3: Reg = Reg(7);
    pub const T0: Reg = Reg(8);
    pub const T1: Reg = Reg(9);
    pub const T2: Reg = Reg(10);
    pub const S0: Reg = Reg(16);
    pub const SP: Reg = Reg(29);
    pub const RA: Reg = Reg(31);

    pub fn new(index: u8) -> Option<Reg> {
        (index < 32).then_some(Reg(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn name(self) -> &'static str {
        REGISTER_NAMES[self.0 as usize]
    }

    /// Accepts `$t0`, `t0`, `$8` and `s8` (alias of `fp`).
    pub fn parse(token: &str) -> Option<Reg> {
        let t = token.trim();
        let t = t.strip_prefix('$').unwrap_or(t).to_ascii_lowercase();
        if let Ok(n) = t.parse::<u8>() {
            return Reg::new(n);
        }
        if t == "s8" {
            return Some(Reg(30));
        }
        REGISTER_NAMES
            .iter()
            .position(|name| *name == t)
            .map(|i| Reg(i as u8))
    }

    fn field(word: u32, shift: u32) -> Reg {
        Reg(((word >> shift) & 0x1F) as u8)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.name())
    }
}

/// One decoded instruction.
///
/// Branch offsets are byte distances from the delay slot, jump targets are
/// byte addresses. Both are stored as the program sees them and only shifted
/// down to word granularity when packed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Instruction {
    Nop,
    Sll { rd: Reg, rt: Reg, sa: u8 },
    Srl { rd: Reg, rt: Reg, sa: u8 },
    Jr { rs: Reg },
    Jalr { rd: Reg, rs: Reg },
    Addu { rd: Reg, rs: Reg, rt: Reg },
    Subu { rd: Reg, rs: Reg, rt: Reg },
    And { rd: Reg, rs: Reg, rt: Reg },
    Or { rd: Reg, rs: Reg, rt: Reg },
    Slt { rd: Reg, rs: Reg, rt: Reg },
    Bltz { rs: Reg, offset: i32 },
    Bgez { rs: Reg, offset: i32 },
    J { target: u32 },
    Jal { target: u32 },
    Beq { rs: Reg, rt: Reg, offset: i32 },
    Bne { rs: Reg, rt: Reg, offset: i32 },
    Blez { rs: Reg, offset: i32 },
    Bgtz { rs: Reg, offset: i32 },
    Addiu { rt: Reg, rs: Reg, imm: i16 },
    Slti { rt: Reg, rs: Reg, imm: i16 },
    Andi { rt: Reg, rs: Reg, imm: u16 },
    Ori { rt: Reg, rs: Reg, imm: u16 },
    Lui { rt: Reg, imm: u16 },
    Lb { rt: Reg, base: Reg, offset: i16 },
    Lh { rt: Reg, base: Reg, offset: i16 },
    Lw { rt: Reg, base: Reg, offset: i16 },
    Lbu { rt: Reg, base: Reg, offset: i16 },
    Lhu { rt: Reg, base: Reg, offset: i16 },
    Sb { rt: Reg, base: Reg, offset: i16 },
    Sh { rt: Reg, base: Reg, offset: i16 },
    Sw { rt: Reg, base: Reg, offset: i16 },
}

fn r_type(rs: Reg, rt: Reg, rd: Reg, sa: u8, funct: u32) -> u32 {
    (OP_SPECIAL << 26)
        | ((rs.0 as u32) << 21)
        | ((rt.0 as u32) << 16)
        | ((rd.0 as u32) << 11)
        | (((sa & 0x1F) as u32) << 6)
        | funct
}

fn i_type(op: u32, rs: Reg, rt: Reg, imm: u16) -> u32 {
    (op << 26) | ((rs.0 as u32) << 21) | ((rt.0 as u32) << 16) | imm as u32
}

fn branch_field(offset: i32) -> Result<u16> {
    if offset & 3 != 0 {
        return Err(RomError::MalformedInstruction {
            word: offset as u32,
            reason: "branch offset is not word aligned",
        });
    }
    let words = offset >> 2;
    if words < i16::MIN as i32 || words > i16::MAX as i32 {
        return Err(RomError::MalformedInstruction {
            word: offset as u32,
            reason: "branch offset out of range",
        });
    }
    Ok(words as i16 as u16)
}

fn jump_field(op: u32, target: u32) -> Result<u32> {
    if target & 3 != 0 {
        return Err(RomError::MalformedInstruction {
            word: target,
            reason: "jump target is not word aligned",
        });
    }
    Ok((op << 26) | ((target >> 2) & 0x03FF_FFFF))
}

impl Instruction {
    pub fn encode(&self) -> Result<u32> {
        use Instruction::*;
        Ok(match *self {
            Nop => NOP,
            Sll { rd, rt, sa } => r_type(Reg::ZERO, rt, rd, sa, FN_SLL),
            Srl { rd, rt, sa } => r_type(Reg::ZERO, rt, rd, sa, FN_SRL),
            Jr { rs } => r_type(rs, Reg::ZERO, Reg::ZERO, 0, FN_JR),
            Jalr { rd, rs } => r_type(rs, Reg::ZERO, rd, 0, FN_JALR),
            Addu { rd, rs, rt } => r_type(rs, rt, rd, 0, FN_ADDU),
            Subu { rd, rs, rt } => r_type(rs, rt, rd, 0, FN_SUBU),
            And { rd, rs, rt } => r_type(rs, rt, rd, 0, FN_AND),
            Or { rd, rs, rt } => r_type(rs, rt, rd, 0, FN_OR),
            Slt { rd, rs, rt } => r_type(rs, rt, rd, 0, FN_SLT),
            Bltz { rs, offset } => i_type(OP_REGIMM, rs, Reg(RT_BLTZ as u8), branch_field(offset)?),
            Bgez { rs, offset } => i_type(OP_REGIMM, rs, Reg(RT_BGEZ as u8), branch_field(offset)?),
            J { target } => jump_field(OP_J, target)?,
            Jal { target } => jump_field(OP_JAL, target)?,
            Beq { rs, rt, offset } => i_type(OP_BEQ, rs, rt, branch_field(offset)?),
            Bne { rs, rt, offset } => i_type(OP_BNE, rs, rt, branch_field(offset)?),
            Blez { rs, offset } => i_type(OP_BLEZ, rs, Reg::ZERO, branch_field(offset)?),
            Bgtz { rs, offset } => i_type(OP_BGTZ, rs, Reg::ZERO, branch_field(offset)?),
            Addiu { rt, rs, imm } => i_type(OP_ADDIU, rs, rt, imm as u16),
            Slti { rt, rs, imm } => i_type(OP_SLTI, rs, rt, imm as u16),
            Andi { rt, rs, imm } => i_type(OP_ANDI, rs, rt, imm),
            Ori { rt, rs, imm } => i_type(OP_ORI, rs, rt, imm),
            Lui { rt, imm } => i_type(OP_LUI, Reg::ZERO, rt, imm),
            Lb { rt, base, offset } => i_type(OP_LB, base, rt, offset as u16),
            Lh { rt, base, offset } => i_type(OP_LH, base, rt, offset as u16),
            Lw { rt, base, offset } => i_type(OP_LW, base, rt, offset as u16),
            Lbu { rt, base, offset } => i_type(OP_LBU, base, rt, offset as u16),
            Lhu { rt, base, offset } => i_type(OP_LHU, base, rt, offset as u16),
            Sb { rt, base, offset } => i_type(OP_SB, base, rt, offset as u16),
            Sh { rt, base, offset } => i_type(OP_SH, base, rt, offset as u16),
            Sw { rt, base, offset } => i_type(OP_SW, base, rt, offset as u16),
        })
    }

    pub fn decode(word: u32) -> Result<Instruction> {
        use Instruction::*;
        let op = word >> 26;
        let rs = Reg::field(word, 21);
        let rt = Reg::field(word, 16);
        let rd = Reg::field(word, 11);
        let sa = ((word >> 6) & 0x1F) as u8;
        let imm = (word & 0xFFFF) as u16;
        let simm = imm as i16;
        let branch = (simm as i32) << 2;

        let malformed = |reason| RomError::MalformedInstruction { word, reason };

        Ok(match op {
            OP_SPECIAL => match word & 0x3F {
                FN_SLL if word == NOP => Nop,
                FN_SLL => Sll { rd, rt, sa },
                FN_SRL => Srl { rd, rt, sa },
                FN_JR => Jr { rs },
                FN_JALR => Jalr { rd, rs },
                FN_ADDU => Addu { rd, rs, rt },
                FN_SUBU => Subu { rd, rs, rt },
                FN_AND => And { rd, rs, rt },
                FN_OR => Or { rd, rs, rt },
                FN_SLT => Slt { rd, rs, rt },
                _ => return Err(malformed("unsupported SPECIAL function")),
            },
            OP_REGIMM => match rt.0 as u32 {
                RT_BLTZ => Bltz { rs, offset: branch },
                RT_BGEZ => Bgez { rs, offset: branch },
                _ => return Err(malformed("unsupported REGIMM branch")),
            },
            OP_J => J {
                target: (word & 0x03FF_FFFF) << 2,
            },
            OP_JAL => Jal {
                target: (word & 0x03FF_FFFF) << 2,
            },
            OP_BEQ => Beq { rs, rt, offset: branch },
            OP_BNE => Bne { rs, rt, offset: branch },
            OP_BLEZ => Blez { rs, offset: branch },
            OP_BGTZ => Bgtz { rs, offset: branch },
            OP_ADDIU => Addiu { rt, rs, imm: simm },
            OP_SLTI => Slti { rt, rs, imm: simm },
            OP_ANDI => Andi { rt, rs, imm },
            OP_ORI => Ori { rt, rs, imm },
            OP_LUI => Lui { rt, imm },
            OP_LB => Lb { rt, base: rs, offset: simm },
            OP_LH => Lh { rt, base: rs, offset: simm },
            OP_LW => Lw { rt, base: rs, offset: simm },
            OP_LBU => Lbu { rt, base: rs, offset: simm },
            OP_LHU => Lhu { rt, base: rs, offset: simm },
            OP_SB => Sb { rt, base: rs, offset: simm },
            OP_SH => Sh { rt, base: rs, offset: simm },
            OP_SW => Sw { rt, base: rs, offset: simm },
            _ => return Err(malformed("unsupported opcode")),
        })
    }

    /// True for anything with a delay slot.
    pub fn is_control_flow(&self) -> bool {
        use Instruction::*;
        matches!(
            self,
            Jr { .. }
                | Jalr { .. }
                | Bltz { .. }
                | Bgez { .. }
                | J { .. }
                | Jal { .. }
                | Beq { .. }
                | Bne { .. }
                | Blez { .. }
                | Bgtz { .. }
        )
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;
        match *self {
            Nop => write!(f, "nop"),
            Sll { rd, rt, sa } => write!(f, "sll {rd}, {rt}, {sa}"),
            Srl { rd, rt, sa } => write!(f, "srl {rd}, {rt}, {sa}"),
            Jr { rs } => write!(f, "jr {rs}"),
            Jalr { rd, rs } => write!(f, "jalr {rd}, {rs}"),
            Addu { rd, rs, rt } => write!(f, "addu {rd}, {rs}, {rt}"),
            Subu { rd, rs, rt } => write!(f, "subu {rd}, {rs}, {rt}"),
            And { rd, rs, rt } => write!(f, "and {rd}, {rs}, {rt}"),
            Or { rd, rs, rt } => write!(f, "or {rd}, {rs}, {rt}"),
            Slt { rd, rs, rt } => write!(f, "slt {rd}, {rs}, {rt}"),
            Bltz { rs, offset } => write!(f, "bltz {rs}, {offset}"),
            Bgez { rs, offset } => write!(f, "bgez {rs}, {offset}"),
            J { target } => write!(f, "j {target:#X}"),
            Jal { target } => write!(f, "jal {target:#X}"),
            Beq { rs, rt, offset } => write!(f, "beq {rs}, {rt}, {offset}"),
            Bne { rs, rt, offset } => write!(f, "bne {rs}, {rt}, {offset}"),
            Blez { rs, offset } => write!(f, "blez {rs}, {offset}"),
            Bgtz { rs, offset } => write!(f, "bgtz {rs}, {offset}"),
            Addiu { rt, rs, imm } => write!(f, "addiu {rt}, {rs}, {imm}"),
            Slti { rt, rs, imm } => write!(f, "slti {rt}, {rs}, {imm}"),
            Andi { rt, rs, imm } => write!(f, "andi {rt}, {rs}, {imm:#X}"),
            Ori { rt, rs, imm } => write!(f, "ori {rt}, {rs}, {imm:#X}"),
            Lui { rt, imm } => write!(f, "lui {rt}, {imm:#X}"),
            Lb { rt, base, offset } => write!(f, "lb {rt}, {offset}({base})"),
            Lh { rt, base, offset } => write!(f, "lh {rt}, {offset}({base})"),
            Lw { rt, base, offset } => write!(f, "lw {rt}, {offset}({base})"),
            Lbu { rt, base, offset } => write!(f, "lbu {rt}, {offset}({base})"),
            Lhu { rt, base, offset } => write!(f, "lhu {rt}, {offset}({base})"),
            Sb { rt, base, offset } => write!(f, "sb {rt}, {offset}({base})"),
            Sh { rt, base, offset } => write!(f, "sh {rt}, {offset}({base})"),
            Sw { rt, base, offset } => write!(f, "sw {rt}, {offset}({base})"),
        }
    }
}

/// Like [`Instruction::is_control_flow`], but also catches branch forms the
/// encoder does not model (likely branches, coprocessor branches).
pub fn word_is_control_flow(word: u32) -> bool {
    let op = word >> 26;
    match op {
        OP_SPECIAL => matches!(word & 0x3F, FN_JR | FN_JALR),
        OP_REGIMM | OP_J | OP_JAL | OP_BEQ | OP_BNE | OP_BLEZ | OP_BGTZ => true,
        // COP0..COP2 with the BC format in rs
        0x10..=0x12 => (word >> 21) & 0x1F == 0x08,
        // BEQL, BNEL, BLEZL, BGTZL
        0x14..=0x17 => true,
        _ => false,
    }
}

/// Target of a `jal`, without the segment bits the instruction cannot hold.
pub fn extract_jal_target(word: u32) -> Result<u32> {
    if word >> 26 != OP_JAL {
        return Err(RomError::MalformedInstruction {
            word,
            reason: "not a jal",
        });
    }
    Ok((word & 0x03FF_FFFF) << 2)
}

/// Splits an address into the halves loaded by `lui` + `addiu`/`lw`.
///
/// The low half is sign-extended by the second instruction, so the high half
/// is bumped by one whenever bit 15 of the low half is set.
pub fn split_address_for_load(addr: u32) -> (u16, u16) {
    let lower = (addr & 0xFFFF) as u16;
    let mut upper = (addr >> 16) as u16;
    if lower & 0x8000 != 0 {
        upper = upper.wrapping_add(1);
    }
    (upper, lower)
}

/// Inverse of [`split_address_for_load`].
pub fn join_address(upper: u16, lower: u16) -> u32 {
    ((upper as u32) << 16).wrapping_add(lower as i16 as i32 as u32)
}

/// Measures a function starting at `start` by finding its `jr $ra`.
///
/// The returned length includes the delay slot. `None` means no epilogue was
/// found in the scan window.
pub fn scan_function_length(bytes: &[u8], start: usize) -> Option<usize> {
    let limit = bytes.len().min(start.saturating_add(FUNCTION_SCAN_WINDOW));
    let mut pos = start;
    while pos + 4 <= limit {
        if BigEndian::read_u32(&bytes[pos..pos + 4]) == JR_RA {
            let end = (pos + 8).min(bytes.len());
            return Some(end - start);
        }
        pos += 4;
    }
    None
}

pub fn encode_all(instructions: &[Instruction]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(instructions.len() * 4);
    for ins in instructions {
        out.extend_from_slice(&ins.encode()?.to_be_bytes());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn encodes_known_words() {
        let cases = [
            (Instruction::Jr { rs: Reg::RA }, JR_RA),
            (Instruction::Nop, 0),
            (
                Instruction::Addiu {
                    rt: Reg::SP,
                    rs: Reg::SP,
                    imm: -0x18,
                },
                0x27BD_FFE8,
            ),
            (
                Instruction::Sw {
                    rt: Reg::RA,
                    base: Reg::SP,
                    offset: 0x10,
                },
                0xAFBF_0010,
            ),
            (
                Instruction::Lui {
                    rt: Reg::T0,
                    imm: 0x800D,
                },
                0x3C08_800D,
            ),
            (Instruction::Jal { target: 0x8004_1234 }, 0x0C01_048D),
            (
                Instruction::Beq {
                    rs: Reg::ZERO,
                    rt: Reg::ZERO,
                    offset: 8,
                },
                0x1000_0002,
            ),
            (
                Instruction::Addu {
                    rd: Reg::A0,
                    rs: Reg::V0,
                    rt: Reg::ZERO,
                },
                0x0040_2021,
            ),
        ];
        for (ins, word) in cases {
            assert_eq!(ins.encode().unwrap(), word, "{ins}");
        }
    }

    #[test]
    fn decode_inverts_encode() {
        let samples = [
            Instruction::Bne {
                rs: Reg::T1,
                rt: Reg::T2,
                offset: -16,
            },
            Instruction::Bgtz {
                rs: Reg::A0,
                offset: 32,
            },
            Instruction::Blez {
                rs: Reg::V0,
                offset: -4,
            },
            Instruction::Lw {
                rt: Reg::T1,
                base: Reg::T0,
                offset: -0x7000,
            },
            Instruction::Jalr {
                rd: Reg::RA,
                rs: Reg::T1,
            },
            Instruction::Ori {
                rt: Reg::A0,
                rs: Reg::ZERO,
                imm: 0xBEEF,
            },
            Instruction::Sll {
                rd: Reg::T0,
                rt: Reg::T1,
                sa: 2,
            },
        ];
        for ins in samples {
            let word = ins.encode().unwrap();
            assert_eq!(Instruction::decode(word).unwrap(), ins);
        }
    }

    #[test]
    fn jump_targets_are_stored_as_words() {
        let word = Instruction::J { target: 0x0040_0010 }.encode().unwrap();
        assert_eq!(word & 0x03FF_FFFF, 0x0010_0004);
        assert!(Instruction::J { target: 0x0040_0012 }.encode().is_err());
        assert!(Instruction::Beq {
            rs: Reg::ZERO,
            rt: Reg::ZERO,
            offset: 0x20000
        }
        .encode()
        .is_err());
    }

    #[test]
    fn jal_target_extraction() {
        let word = Instruction::Jal { target: 0x8004_1234 }.encode().unwrap();
        assert_eq!(extract_jal_target(word).unwrap(), 0x0004_1234);
        assert!(matches!(
            extract_jal_target(JR_RA),
            Err(RomError::MalformedInstruction { .. })
        ));
    }

    #[test]
    fn split_compensates_sign_bit() {
        assert_eq!(split_address_for_load(0x800C_9000), (0x800D, 0x9000));
        assert_eq!(join_address(0x800D, 0x9000), 0x800C_9000);
        assert_eq!(split_address_for_load(0x8012_3456), (0x8012, 0x3456));
        assert_eq!(split_address_for_load(0x0000_8000), (0x0001, 0x8000));
    }

    #[test]
    fn split_join_round_trips_random_addresses() {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        for _ in 0..10_000 {
            let addr: u32 = rng.gen();
            let (upper, lower) = split_address_for_load(addr);
            assert_eq!(join_address(upper, lower) & 0x7FFF_FFFF, addr & 0x7FFF_FFFF);
            assert_eq!(join_address(upper, lower), addr);
        }
    }

    #[test]
    fn function_scan_finds_epilogue() {
        let code = encode_all(&[
            Instruction::Addiu {
                rt: Reg::V0,
                rs: Reg::ZERO,
                imm: 1,
            },
            Instruction::Jr { rs: Reg::RA },
            Instruction::Nop,
            Instruction::Jr { rs: Reg::RA },
        ])
        .unwrap();
        assert_eq!(scan_function_length(&code, 0), Some(12));
        assert_eq!(scan_function_length(&code, 12), Some(4));
        assert_eq!(scan_function_length(&code[..4], 0), None);
    }

    #[test]
    fn registers_parse_in_all_spellings() {
        assert_eq!(Reg::parse("$t0"), Some(Reg::T0));
        assert_eq!(Reg::parse("ra"), Some(Reg::RA));
        assert_eq!(Reg::parse("$29"), Some(Reg::SP));
        assert_eq!(Reg::parse("s8").map(Reg::name), Some("fp"));
        assert_eq!(Reg::parse("$32"), None);
        assert_eq!(Reg::parse("x1"), None);
    }

    #[test]
    fn raw_control_flow_check_covers_unmodelled_branches() {
        assert!(word_is_control_flow(JR_RA));
        assert!(word_is_control_flow(0x5080_0003)); // beql a0, zero
        assert!(word_is_control_flow(0x4501_0002)); // bc1t
        assert!(!word_is_control_flow(0x4600_0000)); // add.s
        assert!(!word_is_control_flow(0x27BD_FFE8));
        assert!(!word_is_control_flow(0x0040_2021));
    }
}
