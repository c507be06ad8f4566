use std::collections::HashMap;

use thiserror::Error;

use crate::mips::{split_address_for_load, Instruction, Reg};

/// Errors that can occur while assembling event or hook source text.
#[derive(Debug, Error)]
pub enum AsmError {
    #[error("line {line}: unknown instruction '{mnemonic}'")]
    UnknownInstruction { line: usize, mnemonic: String },

    #[error("line {line}: {mnemonic} expects {expected} operands, got {got}")]
    WrongOperandCount {
        line: usize,
        mnemonic: String,
        expected: &'static str,
        got: usize,
    },

    #[error("line {line}: bad register '{token}'")]
    BadRegister { line: usize, token: String },

    #[error("line {line}: undefined symbol '{name}'")]
    UndefinedSymbol { line: usize, name: String },

    #[error("line {line}: cannot parse expression '{token}'")]
    BadExpression { line: usize, token: String },

    #[error("line {line}: label '{name}' is defined twice")]
    DuplicateLabel { line: usize, name: String },

    #[error("line {line}: value {value:#X} is out of range for {kind}")]
    OutOfRange {
        line: usize,
        value: i64,
        kind: &'static str,
    },

    #[error("line {line}: {message}")]
    Directive { line: usize, message: String },

    #[error("line {line}: {message}")]
    Encode { line: usize, message: String },
}

type AsmResult<T> = std::result::Result<T, AsmError>;

/// Largest zero fill a forward `.org` may ask for.
const MAX_ORG_GAP: usize = 0x1_0000;

/// Output of a successful assembly.
#[derive(Clone, Debug)]
pub struct Assembled {
    pub origin: u32,
    pub bytes: Vec<u8>,
    /// Every label and `.definelabel`, lowercased.
    pub labels: HashMap<String, u32>,
}

/// Builds the source text every placed event is assembled from: the origin,
/// one `.definelabel` per symbol, the body, then a closing word alignment.
pub fn compose_source(origin: u32, defines: &[(String, u32)], body: &str) -> String {
    let mut src = format!(".org {origin:#X}\n");
    for (name, value) in defines {
        if is_identifier(name) {
            src.push_str(&format!(".definelabel {name}, {value:#X}\n"));
        }
    }
    src.push_str(body);
    if !body.ends_with('\n') {
        src.push('\n');
    }
    src.push_str(".align 4\n");
    src
}

#[derive(Clone, Debug)]
enum StmtKind {
    Org(String),
    DefineLabel(String, String),
    Align(String),
    Data { width: usize, exprs: Vec<String> },
    Ascii { bytes: Vec<u8> },
    Instr { mnemonic: String, operands: Vec<String> },
}

#[derive(Clone, Debug)]
struct Stmt {
    line: usize,
    labels: Vec<String>,
    kind: Option<StmtKind>,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '.' || c == '@' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '@')
}

fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => in_string = !in_string,
            b';' if !in_string => return &line[..i],
            b'/' if !in_string && bytes.get(i + 1) == Some(&b'/') => return &line[..i],
            _ => {}
        }
        i += 1;
    }
    line
}

/// Splits operands on commas outside parentheses and quotes.
fn split_operands(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '"' => {
                in_string = !in_string;
                current.push(c);
            }
            '(' if !in_string => {
                depth += 1;
                current.push(c);
            }
            ')' if !in_string => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 && !in_string => {
                out.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() || !out.is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

fn parse_string_literal(line: usize, text: &str) -> AsmResult<Vec<u8>> {
    let t = text.trim();
    let inner = t
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or_else(|| AsmError::Directive {
            line,
            message: format!("expected a quoted string, got {t}"),
        })?;
    let mut out = Vec::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push(b'\n'),
                Some('0') => out.push(0),
                Some('"') => out.push(b'"'),
                Some('\\') => out.push(b'\\'),
                other => {
                    return Err(AsmError::Directive {
                        line,
                        message: format!("unknown escape \\{}", other.unwrap_or(' ')),
                    })
                }
            }
        } else if c.is_ascii() {
            out.push(c as u8);
        } else {
            out.push(b'?');
        }
    }
    Ok(out)
}

fn parse_statements(src: &str) -> AsmResult<Vec<Stmt>> {
    let mut stmts = Vec::new();

    for (idx, raw_line) in src.lines().enumerate() {
        let line_no = idx + 1;
        let mut rest = strip_comment(raw_line).trim();
        let mut labels = Vec::new();

        // Leading `name:` labels, possibly several.
        while let Some(colon) = rest.find(':') {
            let candidate = rest[..colon].trim();
            if !is_identifier(candidate) || candidate.starts_with('.') {
                break;
            }
            labels.push(candidate.to_ascii_lowercase());
            rest = rest[colon + 1..].trim();
        }

        if rest.is_empty() {
            if !labels.is_empty() {
                stmts.push(Stmt {
                    line: line_no,
                    labels,
                    kind: None,
                });
            }
            continue;
        }

        let (head, tail) = match rest.find(char::is_whitespace) {
            Some(pos) => (&rest[..pos], rest[pos..].trim()),
            None => (rest, ""),
        };
        let head = head.to_ascii_lowercase();
        let operands = split_operands(tail);

        let kind = match head.as_str() {
            ".org" | ".orga" => StmtKind::Org(tail.to_string()),
            ".definelabel" => {
                if operands.len() != 2 {
                    return Err(AsmError::WrongOperandCount {
                        line: line_no,
                        mnemonic: head,
                        expected: "2",
                        got: operands.len(),
                    });
                }
                StmtKind::DefineLabel(operands[0].to_ascii_lowercase(), operands[1].clone())
            }
            ".align" => StmtKind::Align(if tail.is_empty() {
                "4".to_string()
            } else {
                tail.to_string()
            }),
            ".word" | "dw" | ".dw" => StmtKind::Data {
                width: 4,
                exprs: operands,
            },
            ".halfword" | ".half" | "dh" | ".dh" => StmtKind::Data {
                width: 2,
                exprs: operands,
            },
            ".byte" | "db" | ".db" => StmtKind::Data {
                width: 1,
                exprs: operands,
            },
            ".ascii" => StmtKind::Ascii {
                bytes: parse_string_literal(line_no, tail)?,
            },
            ".asciiz" => {
                let mut bytes = parse_string_literal(line_no, tail)?;
                bytes.push(0);
                StmtKind::Ascii { bytes }
            }
            d if d.starts_with('.') => {
                return Err(AsmError::Directive {
                    line: line_no,
                    message: format!("unsupported directive {d}"),
                })
            }
            _ => StmtKind::Instr {
                mnemonic: head,
                operands,
            },
        };

        stmts.push(Stmt {
            line: line_no,
            labels,
            kind: Some(kind),
        });
    }

    Ok(stmts)
}

/// Tiny recursive-descent evaluator for `a + b - hi(c)` style operands.
struct ExprParser<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    symbols: &'a HashMap<String, u32>,
    text: &'a str,
}

impl<'a> ExprParser<'a> {
    fn bad(&self) -> AsmError {
        AsmError::BadExpression {
            line: self.line,
            token: self.text.to_string(),
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn expr(&mut self) -> AsmResult<i64> {
        let mut value = self.term()?;
        loop {
            self.skip_ws();
            match self.src.get(self.pos) {
                Some(b'+') => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(b'-') => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> AsmResult<i64> {
        self.skip_ws();
        match self.src.get(self.pos) {
            Some(b'-') => {
                self.pos += 1;
                Ok(-self.term()?)
            }
            Some(b'(') => {
                self.pos += 1;
                let v = self.expr()?;
                self.expect(b')')?;
                Ok(v)
            }
            Some(c) if c.is_ascii_digit() => self.number(),
            Some(_) => self.identifier_or_call(),
            None => Err(self.bad()),
        }
    }

    fn expect(&mut self, c: u8) -> AsmResult<()> {
        self.skip_ws();
        if self.src.get(self.pos) == Some(&c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.bad())
        }
    }

    fn number(&mut self) -> AsmResult<i64> {
        let start = self.pos;
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_alphanumeric() {
            self.pos += 1;
        }
        let token = std::str::from_utf8(&self.src[start..self.pos]).map_err(|_| self.bad())?;
        let t = token.to_ascii_lowercase();
        let parsed = if let Some(hex) = t.strip_prefix("0x") {
            i64::from_str_radix(hex, 16)
        } else if let Some(bin) = t.strip_prefix("0b") {
            i64::from_str_radix(bin, 2)
        } else {
            t.parse::<i64>()
        };
        parsed.map_err(|_| self.bad())
    }

    fn identifier_or_call(&mut self) -> AsmResult<i64> {
        let start = self.pos;
        while self.pos < self.src.len() {
            let c = self.src[self.pos];
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'.' || c == b'@' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(self.bad());
        }
        let name = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.bad())?
            .to_ascii_lowercase();

        self.skip_ws();
        if self.src.get(self.pos) == Some(&b'(') && (name == "hi" || name == "lo") {
            self.pos += 1;
            let inner = self.expr()?;
            self.expect(b')')?;
            let (upper, lower) = split_address_for_load(inner as u32);
            return Ok(if name == "hi" {
                upper as i64
            } else {
                lower as i16 as i64
            });
        }

        match self.symbols.get(&name) {
            Some(v) => Ok(*v as i64),
            None => Err(AsmError::UndefinedSymbol {
                line: self.line,
                name,
            }),
        }
    }
}

fn eval(line: usize, text: &str, symbols: &HashMap<String, u32>) -> AsmResult<i64> {
    let mut parser = ExprParser {
        src: text.as_bytes(),
        pos: 0,
        line,
        symbols,
        text,
    };
    let value = parser.expr()?;
    parser.skip_ws();
    if parser.pos != parser.src.len() {
        return Err(parser.bad());
    }
    Ok(value)
}

fn reg(line: usize, token: &str) -> AsmResult<Reg> {
    Reg::parse(token).ok_or_else(|| AsmError::BadRegister {
        line,
        token: token.to_string(),
    })
}

fn expect_operands(
    line: usize,
    mnemonic: &str,
    operands: &[String],
    expected: usize,
) -> AsmResult<()> {
    if operands.len() != expected {
        return Err(AsmError::WrongOperandCount {
            line,
            mnemonic: mnemonic.to_string(),
            expected: match expected {
                0 => "0",
                1 => "1",
                2 => "2",
                _ => "3",
            },
            got: operands.len(),
        });
    }
    Ok(())
}

fn imm16(line: usize, value: i64, kind: &'static str) -> AsmResult<u16> {
    if !(-0x8000..=0xFFFF).contains(&value) {
        return Err(AsmError::OutOfRange { line, value, kind });
    }
    Ok(value as u16)
}

/// `off(base)` memory operand.
fn mem_operand(
    line: usize,
    text: &str,
    symbols: &HashMap<String, u32>,
) -> AsmResult<(i16, Reg)> {
    let t = text.trim();
    let open = t.rfind('(').ok_or_else(|| AsmError::BadExpression {
        line,
        token: t.to_string(),
    })?;
    let base_text = t[open + 1..]
        .strip_suffix(')')
        .ok_or_else(|| AsmError::BadExpression {
            line,
            token: t.to_string(),
        })?;
    let base = reg(line, base_text)?;
    let offset_text = t[..open].trim();
    let offset = if offset_text.is_empty() {
        0
    } else {
        eval(line, offset_text, symbols)?
    };
    Ok((imm16(line, offset, "memory offset")? as i16, base))
}

/// Instruction size in bytes, decided before labels are known.
fn instruction_size(
    line: usize,
    mnemonic: &str,
    operands: &[String],
    known: &HashMap<String, u32>,
) -> AsmResult<usize> {
    Ok(match mnemonic {
        "la" => 8,
        "li" => {
            expect_operands(line, mnemonic, operands, 2)?;
            match eval(line, &operands[1], known) {
                Ok(v) if (-0x8000..=0xFFFF).contains(&v) => 4,
                _ => 8,
            }
        }
        _ => 4,
    })
}

fn encode_instruction(
    line: usize,
    pc: u32,
    mnemonic: &str,
    ops: &[String],
    symbols: &HashMap<String, u32>,
    size: usize,
) -> AsmResult<Vec<Instruction>> {
    use Instruction as I;

    let branch_offset = |text: &str| -> AsmResult<i32> {
        let target = eval(line, text, symbols)?;
        Ok((target - (pc as i64 + 4)) as i32)
    };
    let signed = |text: &str, kind: &'static str| -> AsmResult<i16> {
        let v = eval(line, text, symbols)?;
        if !(-0x8000..=0x7FFF).contains(&v) {
            return Err(AsmError::OutOfRange { line, value: v, kind });
        }
        Ok(v as i16)
    };
    let unsigned = |text: &str, kind: &'static str| -> AsmResult<u16> {
        imm16(line, eval(line, text, symbols)?, kind)
    };

    let ins = match mnemonic {
        "nop" => {
            expect_operands(line, mnemonic, ops, 0)?;
            vec![I::Nop]
        }
        "addu" | "subu" | "and" | "or" | "slt" => {
            expect_operands(line, mnemonic, ops, 3)?;
            let (rd, rs, rt) = (reg(line, &ops[0])?, reg(line, &ops[1])?, reg(line, &ops[2])?);
            vec![match mnemonic {
                "addu" => I::Addu { rd, rs, rt },
                "subu" => I::Subu { rd, rs, rt },
                "and" => I::And { rd, rs, rt },
                "or" => I::Or { rd, rs, rt },
                _ => I::Slt { rd, rs, rt },
            }]
        }
        "sll" | "srl" => {
            expect_operands(line, mnemonic, ops, 3)?;
            let (rd, rt) = (reg(line, &ops[0])?, reg(line, &ops[1])?);
            let sa = eval(line, &ops[2], symbols)?;
            if !(0..32).contains(&sa) {
                return Err(AsmError::OutOfRange {
                    line,
                    value: sa,
                    kind: "shift amount",
                });
            }
            let sa = sa as u8;
            vec![if mnemonic == "sll" {
                I::Sll { rd, rt, sa }
            } else {
                I::Srl { rd, rt, sa }
            }]
        }
        "move" => {
            expect_operands(line, mnemonic, ops, 2)?;
            vec![I::Addu {
                rd: reg(line, &ops[0])?,
                rs: reg(line, &ops[1])?,
                rt: Reg::ZERO,
            }]
        }
        "jr" => {
            expect_operands(line, mnemonic, ops, 1)?;
            vec![I::Jr {
                rs: reg(line, &ops[0])?,
            }]
        }
        "jalr" => match ops.len() {
            1 => vec![I::Jalr {
                rd: Reg::RA,
                rs: reg(line, &ops[0])?,
            }],
            _ => {
                expect_operands(line, mnemonic, ops, 2)?;
                vec![I::Jalr {
                    rd: reg(line, &ops[0])?,
                    rs: reg(line, &ops[1])?,
                }]
            }
        },
        "addiu" | "slti" => {
            expect_operands(line, mnemonic, ops, 3)?;
            let (rt, rs) = (reg(line, &ops[0])?, reg(line, &ops[1])?);
            if mnemonic == "addiu" {
                let imm = unsigned(&ops[2], "16-bit immediate")? as i16;
                vec![I::Addiu { rt, rs, imm }]
            } else {
                let imm = signed(&ops[2], "signed immediate")?;
                vec![I::Slti { rt, rs, imm }]
            }
        }
        "andi" | "ori" => {
            expect_operands(line, mnemonic, ops, 3)?;
            let (rt, rs) = (reg(line, &ops[0])?, reg(line, &ops[1])?);
            let imm = unsigned(&ops[2], "16-bit immediate")?;
            vec![if mnemonic == "andi" {
                I::Andi { rt, rs, imm }
            } else {
                I::Ori { rt, rs, imm }
            }]
        }
        "lui" => {
            expect_operands(line, mnemonic, ops, 2)?;
            vec![I::Lui {
                rt: reg(line, &ops[0])?,
                imm: unsigned(&ops[1], "16-bit immediate")?,
            }]
        }
        "li" => {
            expect_operands(line, mnemonic, ops, 2)?;
            let rt = reg(line, &ops[0])?;
            let value = eval(line, &ops[1], symbols)?;
            if size == 4 {
                if (-0x8000..=0x7FFF).contains(&value) {
                    vec![I::Addiu {
                        rt,
                        rs: Reg::ZERO,
                        imm: value as i16,
                    }]
                } else {
                    vec![I::Ori {
                        rt,
                        rs: Reg::ZERO,
                        imm: value as u16,
                    }]
                }
            } else {
                let (upper, lower) = split_address_for_load(value as u32);
                vec![
                    I::Lui { rt, imm: upper },
                    I::Addiu {
                        rt,
                        rs: rt,
                        imm: lower as i16,
                    },
                ]
            }
        }
        "la" => {
            expect_operands(line, mnemonic, ops, 2)?;
            let rt = reg(line, &ops[0])?;
            let (upper, lower) = split_address_for_load(eval(line, &ops[1], symbols)? as u32);
            vec![
                I::Lui { rt, imm: upper },
                I::Addiu {
                    rt,
                    rs: rt,
                    imm: lower as i16,
                },
            ]
        }
        "lb" | "lh" | "lw" | "lbu" | "lhu" | "sb" | "sh" | "sw" => {
            expect_operands(line, mnemonic, ops, 2)?;
            let rt = reg(line, &ops[0])?;
            let (offset, base) = mem_operand(line, &ops[1], symbols)?;
            vec![match mnemonic {
                "lb" => I::Lb { rt, base, offset },
                "lh" => I::Lh { rt, base, offset },
                "lw" => I::Lw { rt, base, offset },
                "lbu" => I::Lbu { rt, base, offset },
                "lhu" => I::Lhu { rt, base, offset },
                "sb" => I::Sb { rt, base, offset },
                "sh" => I::Sh { rt, base, offset },
                _ => I::Sw { rt, base, offset },
            }]
        }
        "beq" | "bne" => {
            expect_operands(line, mnemonic, ops, 3)?;
            let (rs, rt) = (reg(line, &ops[0])?, reg(line, &ops[1])?);
            let offset = branch_offset(&ops[2])?;
            vec![if mnemonic == "beq" {
                I::Beq { rs, rt, offset }
            } else {
                I::Bne { rs, rt, offset }
            }]
        }
        "beqz" | "bnez" => {
            expect_operands(line, mnemonic, ops, 2)?;
            let rs = reg(line, &ops[0])?;
            let offset = branch_offset(&ops[1])?;
            vec![if mnemonic == "beqz" {
                I::Beq {
                    rs,
                    rt: Reg::ZERO,
                    offset,
                }
            } else {
                I::Bne {
                    rs,
                    rt: Reg::ZERO,
                    offset,
                }
            }]
        }
        "b" => {
            expect_operands(line, mnemonic, ops, 1)?;
            vec![I::Beq {
                rs: Reg::ZERO,
                rt: Reg::ZERO,
                offset: branch_offset(&ops[0])?,
            }]
        }
        "bgtz" | "blez" | "bltz" | "bgez" => {
            expect_operands(line, mnemonic, ops, 2)?;
            let rs = reg(line, &ops[0])?;
            let offset = branch_offset(&ops[1])?;
            vec![match mnemonic {
                "bgtz" => I::Bgtz { rs, offset },
                "blez" => I::Blez { rs, offset },
                "bltz" => I::Bltz { rs, offset },
                _ => I::Bgez { rs, offset },
            }]
        }
        "j" | "jal" => {
            expect_operands(line, mnemonic, ops, 1)?;
            let target = eval(line, &ops[0], symbols)? as u32;
            vec![if mnemonic == "j" {
                I::J { target }
            } else {
                I::Jal { target }
            }]
        }
        _ => {
            return Err(AsmError::UnknownInstruction {
                line,
                mnemonic: mnemonic.to_string(),
            })
        }
    };

    Ok(ins)
}

fn define(
    labels: &mut HashMap<String, u32>,
    line: usize,
    name: &str,
    value: u32,
) -> AsmResult<()> {
    if labels.insert(name.to_string(), value).is_some() {
        return Err(AsmError::DuplicateLabel {
            line,
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Assembles `src` in two passes: the first places labels, the second
/// encodes with every label known.
pub fn assemble(src: &str) -> AsmResult<Assembled> {
    let stmts = parse_statements(src)?;

    // Pass 1: addresses and sizes.
    let mut labels: HashMap<String, u32> = HashMap::new();
    let mut sizes: Vec<usize> = Vec::with_capacity(stmts.len());
    let mut origin: Option<u32> = None;
    let mut pc: u32 = 0;
    let mut emitted = false;

    for stmt in &stmts {
        // `.org` moves the address before labels on the same line bind. The
        // first one before any output sets the origin; later ones pad forward.
        let mut fill = 0;
        if let Some(StmtKind::Org(text)) = &stmt.kind {
            let target = eval(stmt.line, text, &labels)? as u32;
            if origin.is_none() && !emitted {
                origin = Some(target);
            } else {
                let gap = target.checked_sub(pc).ok_or_else(|| AsmError::Directive {
                    line: stmt.line,
                    message: format!(".org {target:#X} moves backwards from {pc:#X}"),
                })?;
                if gap as usize > MAX_ORG_GAP {
                    return Err(AsmError::Directive {
                        line: stmt.line,
                        message: format!(
                            ".org {target:#X} leaves a gap of {gap:#X} bytes after {pc:#X}"
                        ),
                    });
                }
                fill = gap as usize;
                emitted |= fill > 0;
            }
            pc = target;
        }

        for label in &stmt.labels {
            define(&mut labels, stmt.line, label, pc)?;
        }

        let size = match &stmt.kind {
            None | Some(StmtKind::Org(_)) => 0,
            Some(StmtKind::DefineLabel(name, value)) => {
                let v = eval(stmt.line, value, &labels)?;
                define(&mut labels, stmt.line, name, v as u32)?;
                0
            }
            Some(StmtKind::Align(text)) => {
                let to = eval(stmt.line, text, &labels)?;
                if to <= 0 || to & (to - 1) != 0 {
                    return Err(AsmError::Directive {
                        line: stmt.line,
                        message: format!("alignment {to} is not a power of two"),
                    });
                }
                let to = to as u32;
                (((pc + to - 1) / to) * to - pc) as usize
            }
            Some(StmtKind::Data { width, exprs }) => width * exprs.len(),
            Some(StmtKind::Ascii { bytes }) => bytes.len(),
            Some(StmtKind::Instr { mnemonic, operands }) => {
                instruction_size(stmt.line, mnemonic, operands, &labels)?
            }
        };
        if size > 0 {
            emitted = true;
        }
        pc = pc.wrapping_add(size as u32);
        // Pass 2 pads an `.org` with its fill and reaches the same address.
        sizes.push(size + fill);
    }

    // Pass 2: encode.
    let origin = origin.unwrap_or(0);
    let mut bytes = Vec::new();
    let mut pc = origin;

    for (stmt, size) in stmts.iter().zip(sizes) {
        match &stmt.kind {
            None | Some(StmtKind::DefineLabel(..)) => {}
            Some(StmtKind::Org(_)) | Some(StmtKind::Align(_)) => {
                bytes.extend(std::iter::repeat(0u8).take(size));
            }
            Some(StmtKind::Data { width, exprs }) => {
                for text in exprs {
                    let v = eval(stmt.line, text, &labels)?;
                    match width {
                        4 => bytes.extend_from_slice(&(v as u32).to_be_bytes()),
                        2 => bytes.extend_from_slice(&(imm16(stmt.line, v, "halfword")?).to_be_bytes()),
                        _ => {
                            if !(-0x80..=0xFF).contains(&v) {
                                return Err(AsmError::OutOfRange {
                                    line: stmt.line,
                                    value: v,
                                    kind: "byte",
                                });
                            }
                            bytes.push(v as u8);
                        }
                    }
                }
            }
            Some(StmtKind::Ascii { bytes: data }) => bytes.extend_from_slice(data),
            Some(StmtKind::Instr { mnemonic, operands }) => {
                let ins = encode_instruction(stmt.line, pc, mnemonic, operands, &labels, size)?;
                for i in ins {
                    let word = i.encode().map_err(|e| AsmError::Encode {
                        line: stmt.line,
                        message: e.to_string(),
                    })?;
                    bytes.extend_from_slice(&word.to_be_bytes());
                }
            }
        }
        pc = pc.wrapping_add(size as u32);
    }

    Ok(Assembled {
        origin,
        bytes,
        labels,
    })
}
