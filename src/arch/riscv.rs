//! The RISC-V 32 IM backend.
//!
//! Implements the RV32I base integer set plus the M extension, minus CSR
//! and FENCE. Instructions are 32 bits, stored little-endian; the PC
//! advances by 4 unless a branch or jump writes it.
//!
//! Two documented divergences from the ratified ISA:
//! - Division by zero yields 0 for both quotient and remainder (the
//!   ratified rule is -1 and the dividend). `i32::MIN / -1` wraps to
//!   `i32::MIN`.
//! - There is no trap machinery: `ecall` and `ebreak` surface a [`Call`]
//!   to the host instead, with the call number in x17 and arguments in
//!   x10 and x11.

use std::path::Path;

use crate::asm::{
    self, AsmErr, DebugToken, EncodeErr, ResolvedKind, ResolvedToken, TranslateErr,
};
use crate::parse;
use crate::sim::{ArchInfo, Call, Machine, MemErr, RegErr, StepErr, SYS_BREAK};
use crate::sim::mem::PagedMemory;

const MAX_ADDRESS: u64 = u32::MAX as u64;
const REGISTER_COUNT: u64 = 32;

static REGISTER_NAMES: &[&str] = &[
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2",
    "s0", "s1", "a0", "a1", "a2", "a3", "a4", "a5",
    "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7",
    "s8", "s9", "s10", "s11", "t3", "t4", "t5", "t6",
];

/// A RISC-V 32 IM machine.
pub struct RiscV {
    registers: [u32; 32],
    pc: u32,
    mem: PagedMemory,
}

impl RiscV {
    /// Creates a machine with zeroed registers and memory.
    pub fn new() -> Self {
        RiscV {
            registers: [0; 32],
            pc: 0,
            mem: PagedMemory::new(MAX_ADDRESS),
        }
    }

    /// Assembles source held in memory. `name` is the file name reported
    /// in errors and debug symbols.
    pub fn assemble_source(&self, name: &str, src: &str) -> Result<(Vec<u8>, Vec<DebugToken>), AsmErr> {
        let tokens = parse::tokenize_source(name, src)?;
        let (resolved, debug) = asm::resolve_tokens_fixed(tokens, 4, translate_arg)?;
        Ok((encode(&resolved)?, debug))
    }

    fn read_reg(&self, reg: u8) -> u32 {
        self.registers[reg as usize]
    }

    fn write_reg(&mut self, reg: u8, value: u32) {
        if reg != 0 {
            self.registers[reg as usize] = value;
        }
    }

    fn execute(&mut self, word: u32) -> Result<Option<Call>, StepErr> {
        let unknown = StepErr::UnknownInstruction { pc: self.pc as u64, word };

        match word & 0x7f {
            0b0110011 => {
                let (rd, rs1, rs2, funct3, funct7) = parse_r(word);
                self.exec_arithmetic(rd, rs1, rs2, funct3, funct7).ok_or(unknown)?;
            }
            0b0010011 => {
                let (rd, rs1, imm, funct3) = parse_i(word);
                self.exec_imm_arithmetic(rd, rs1, imm, funct3);
            }
            0b0000011 => {
                let (rd, rs1, imm, funct3) = parse_i(word);
                self.exec_load(rd, rs1, imm, funct3).ok_or(unknown)??;
            }
            0b0100011 => {
                let (rs1, rs2, imm, funct3) = parse_s(word);
                self.exec_store(rs1, rs2, imm, funct3).ok_or(unknown)??;
            }
            0b1100011 => {
                let (rs1, rs2, imm, funct3) = parse_b(word);
                self.exec_branch(rs1, rs2, imm, funct3).ok_or(unknown)?;
            }
            0b1101111 => {
                let (rd, imm) = parse_j(word);
                self.write_reg(rd, self.pc.wrapping_add(4));
                self.pc = self.pc.wrapping_add(imm);
            }
            0b1100111 => {
                let (rd, rs1, imm, _) = parse_i(word);
                let target = self.read_reg(rs1).wrapping_add(imm) & !1;
                self.write_reg(rd, self.pc.wrapping_add(4));
                self.pc = target;
            }
            0b0110111 => {
                let (rd, imm) = parse_u(word);
                self.write_reg(rd, imm);
                self.pc = self.pc.wrapping_add(4);
            }
            0b0010111 => {
                let (rd, imm) = parse_u(word);
                self.write_reg(rd, self.pc.wrapping_add(imm));
                self.pc = self.pc.wrapping_add(4);
            }
            0b1110011 => {
                let (_, _, imm, _) = parse_i(word);
                let number = match imm & 1 {
                    1 => SYS_BREAK,
                    _ => self.read_reg(17) as u64,
                };
                let call = Call {
                    number,
                    arg1: self.read_reg(10) as u64,
                    arg2: self.read_reg(11) as u64,
                };
                self.pc = self.pc.wrapping_add(4);
                return Ok(Some(call));
            }
            _ => return Err(StepErr::UnknownOpcode { pc: self.pc as u64, word }),
        }

        Ok(None)
    }

    /// R-type arithmetic, including the M extension. Returns `None` for
    /// an undefined funct combination.
    fn exec_arithmetic(&mut self, rd: u8, rs1: u8, rs2: u8, funct3: u8, funct7: u8) -> Option<()> {
        let a = self.read_reg(rs1) as i32;
        let b = self.read_reg(rs2) as i32;

        let r: i32 = match (funct7, funct3) {
            // M extension.
            (0x01, 0x0) => a.wrapping_mul(b),
            (0x01, 0x1) => (((a as i64) * (b as i64)) >> 32) as i32,
            (0x01, 0x2) => (((a as i64) * (b as u32 as i64)) >> 32) as i32,
            (0x01, 0x3) => (((a as u32 as u64) * (b as u32 as u64)) >> 32) as i32,
            // Division by zero yields 0; MIN / -1 wraps.
            (0x01, 0x4) => if b == 0 { 0 } else { a.wrapping_div(b) },
            (0x01, 0x5) => if b == 0 { 0 } else { ((a as u32) / (b as u32)) as i32 },
            (0x01, 0x6) => if b == 0 { 0 } else { a.wrapping_rem(b) },
            (0x01, 0x7) => if b == 0 { 0 } else { ((a as u32) % (b as u32)) as i32 },

            (0x00, 0x0) => a.wrapping_add(b),
            (0x20, 0x0) => a.wrapping_sub(b),
            (0x00, 0x1) => ((a as u32) << (b & 0x1f)) as i32,
            (0x00, 0x2) => (a < b) as i32,
            (0x00, 0x3) => ((a as u32) < (b as u32)) as i32,
            (0x00, 0x4) => a ^ b,
            (0x00, 0x5) => ((a as u32) >> (b & 0x1f)) as i32,
            (0x20, 0x5) => a >> (b & 0x1f),
            (0x00, 0x6) => a | b,
            (0x00, 0x7) => a & b,
            _ => return None,
        };

        self.write_reg(rd, r as u32);
        self.pc = self.pc.wrapping_add(4);
        Some(())
    }

    fn exec_imm_arithmetic(&mut self, rd: u8, rs1: u8, imm: u32, funct3: u8) {
        let a = self.read_reg(rs1) as i32;
        let imm_s = imm as i32;

        let r: i32 = match funct3 {
            0x0 => a.wrapping_add(imm_s),
            0x1 => ((a as u32) << (imm & 0x1f)) as i32,
            0x2 => (a < imm_s) as i32,
            0x3 => ((a as u32) < imm) as i32,
            0x4 => a ^ imm_s,
            // Shift-right: bit 30 of the instruction (bit 10 of the raw
            // immediate) selects arithmetic over logical.
            0x5 if imm & 0x400 != 0 => a >> (imm & 0x1f),
            0x5 => ((a as u32) >> (imm & 0x1f)) as i32,
            0x6 => a | imm_s,
            0x7 => a & imm_s,
            _ => unreachable!("funct3 is three bits"),
        };

        self.write_reg(rd, r as u32);
        self.pc = self.pc.wrapping_add(4);
    }

    /// Loads. Returns `None` for an undefined width.
    fn exec_load(&mut self, rd: u8, rs1: u8, imm: u32, funct3: u8) -> Option<Result<(), StepErr>> {
        let addr = self.read_reg(rs1).wrapping_add(imm) as u64;

        let r: Result<u32, MemErr> = match funct3 {
            0x0 => self.mem.get(addr).map(|b| b as i8 as i32 as u32),
            0x1 => self.load_half(addr).map(|h| h as i16 as i32 as u32),
            0x2 => self.load_word(addr),
            0x4 => self.mem.get(addr).map(u32::from),
            0x5 => self.load_half(addr).map(u32::from),
            _ => return None,
        };

        Some(match r {
            Ok(value) => {
                self.write_reg(rd, value);
                self.pc = self.pc.wrapping_add(4);
                Ok(())
            }
            Err(e) => Err(StepErr::Mem(e)),
        })
    }

    fn load_half(&self, addr: u64) -> Result<u16, MemErr> {
        let bytes = self.mem.get_chunk(addr, 2)?;
        Ok(u16::from(bytes[0]) | (u16::from(bytes[1]) << 8))
    }

    fn load_word(&self, addr: u64) -> Result<u32, MemErr> {
        let bytes = self.mem.get_chunk(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Stores. Returns `None` for an undefined width.
    fn exec_store(&mut self, rs1: u8, rs2: u8, imm: u32, funct3: u8) -> Option<Result<(), StepErr>> {
        let addr = self.read_reg(rs1).wrapping_add(imm) as u64;
        let value = self.read_reg(rs2);

        let r = match funct3 {
            0x0 => self.mem.set(addr, value as u8),
            0x1 => self.mem.set_chunk(addr, &(value as u16).to_le_bytes()),
            0x2 => self.mem.set_chunk(addr, &value.to_le_bytes()),
            _ => return None,
        };

        Some(match r {
            Ok(()) => {
                self.pc = self.pc.wrapping_add(4);
                Ok(())
            }
            Err(e) => Err(StepErr::Mem(e)),
        })
    }

    /// Branches. Returns `None` for an undefined condition.
    fn exec_branch(&mut self, rs1: u8, rs2: u8, imm: u32, funct3: u8) -> Option<()> {
        let a = self.read_reg(rs1) as i32;
        let b = self.read_reg(rs2) as i32;

        let taken = match funct3 {
            0x0 => a == b,
            0x1 => a != b,
            0x4 => a < b,
            0x5 => a >= b,
            0x6 => (a as u32) < (b as u32),
            0x7 => (a as u32) >= (b as u32),
            _ => return None,
        };

        self.pc = match taken {
            true => self.pc.wrapping_add(imm),
            false => self.pc.wrapping_add(4),
        };
        Some(())
    }
}

impl Default for RiscV {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine for RiscV {
    fn load_program(&mut self, image: &[u8]) -> Result<(), MemErr> {
        self.pc = 0;
        self.mem.set_chunk(0, image)
    }

    fn next_instruction(&mut self) -> Result<Option<Call>, StepErr> {
        let pc = self.pc as u64;
        let bytes = self.mem.get_chunk(pc, 4).map_err(|_| StepErr::Fetch { pc })?;
        let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        self.execute(word)
    }

    fn get_memory(&self, addr: u64) -> Result<u8, MemErr> {
        self.mem.get(addr)
    }

    fn set_memory(&mut self, addr: u64, byte: u8) -> Result<(), MemErr> {
        self.mem.set(addr, byte)
    }

    fn get_memory_chunk(&self, addr: u64, size: u64) -> Result<Vec<u8>, MemErr> {
        self.mem.get_chunk(addr, size)
    }

    fn set_memory_chunk(&mut self, addr: u64, bytes: &[u8]) -> Result<(), MemErr> {
        self.mem.set_chunk(addr, bytes)
    }

    fn get_register(&self, reg: u64) -> Result<u64, RegErr> {
        match reg < REGISTER_COUNT {
            true => Ok(self.registers[reg as usize] as u64),
            false => Err(RegErr::BadNumber { reg, count: REGISTER_COUNT }),
        }
    }

    fn set_register(&mut self, reg: u64, value: u64) -> Result<(), RegErr> {
        if reg >= REGISTER_COUNT {
            return Err(RegErr::BadNumber { reg, count: REGISTER_COUNT });
        }
        if reg != 0 {
            // Truncation to 32 bits is intentional.
            self.registers[reg as usize] = value as u32;
        }
        Ok(())
    }

    fn register_number(&self, name: &str) -> Result<u64, RegErr> {
        register_by_name(name).ok_or_else(|| RegErr::BadName(name.to_string()))
    }

    fn assemble(&self, path: &Path) -> Result<(Vec<u8>, Vec<DebugToken>), AsmErr> {
        let tokens = parse::tokenize(path)?;
        let (resolved, debug) = asm::resolve_tokens_fixed(tokens, 4, translate_arg)?;
        Ok((encode(&resolved)?, debug))
    }

    fn current_instruction_address(&self) -> u64 {
        self.pc as u64
    }

    fn info(&self) -> ArchInfo {
        ArchInfo {
            name: "RISC-V 32 IM",
            register_names: REGISTER_NAMES,
            word_width: 32,
        }
    }
}

/// Sign-extends the low `bits` bits of `n`.
fn sign_extend(n: u32, bits: u32) -> u32 {
    let shift = 32 - bits;
    (((n << shift) as i32) >> shift) as u32
}

/// Parses an R-type word. Returns rd, rs1, rs2, funct3, funct7.
fn parse_r(word: u32) -> (u8, u8, u8, u8, u8) {
    let rd = ((word >> 7) & 0x1f) as u8;
    let rs1 = ((word >> 15) & 0x1f) as u8;
    let rs2 = ((word >> 20) & 0x1f) as u8;
    let funct3 = ((word >> 12) & 0x7) as u8;
    let funct7 = ((word >> 25) & 0x7f) as u8;
    (rd, rs1, rs2, funct3, funct7)
}

/// Parses an I-type word. Returns rd, rs1, the sign-extended immediate,
/// and funct3.
fn parse_i(word: u32) -> (u8, u8, u32, u8) {
    let rd = ((word >> 7) & 0x1f) as u8;
    let rs1 = ((word >> 15) & 0x1f) as u8;
    let funct3 = ((word >> 12) & 0x7) as u8;
    let imm = sign_extend(word >> 20, 12);
    (rd, rs1, imm, funct3)
}

/// Parses an S-type word. Returns rs1, rs2, the sign-extended immediate,
/// and funct3.
fn parse_s(word: u32) -> (u8, u8, u32, u8) {
    let rs1 = ((word >> 15) & 0x1f) as u8;
    let rs2 = ((word >> 20) & 0x1f) as u8;
    let funct3 = ((word >> 12) & 0x7) as u8;
    let imm = ((word >> 7) & 0x1f) | (((word >> 25) & 0x7f) << 5);
    (rs1, rs2, sign_extend(imm, 12), funct3)
}

/// Parses a B-type word. Returns rs1, rs2, the sign-extended
/// (pre-shifted) immediate, and funct3.
fn parse_b(word: u32) -> (u8, u8, u32, u8) {
    let rs1 = ((word >> 15) & 0x1f) as u8;
    let rs2 = ((word >> 20) & 0x1f) as u8;
    let funct3 = ((word >> 12) & 0x7) as u8;

    let imm = ((word >> 7) & 0x1e)
        | ((word << 4) & 0x800)
        | ((word >> 20) & 0x7e0)
        | ((word >> 19) & 0x1000);
    (rs1, rs2, sign_extend(imm, 13), funct3)
}

/// Parses a U-type word. Returns rd and the immediate, already in its
/// high-20-bit position.
fn parse_u(word: u32) -> (u8, u32) {
    let rd = ((word >> 7) & 0x1f) as u8;
    (rd, word & 0xfffff000)
}

/// Parses a J-type word. Returns rd and the sign-extended (pre-shifted)
/// immediate.
fn parse_j(word: u32) -> (u8, u32) {
    let rd = ((word >> 7) & 0x1f) as u8;

    let imm = (word & 0xff000)
        | ((word >> 9) & 0x800)
        | ((word >> 20) & 0x7fe)
        | ((word >> 11) & 0x100000);
    (rd, sign_extend(imm, 21))
}

/// Translates an argument that is not a label: a numeric literal or a
/// register name.
fn translate_arg(arg: &str) -> Result<u64, TranslateErr> {
    let Some(first) = arg.bytes().next() else {
        return Err(TranslateErr::Empty);
    };
    if first.is_ascii_digit() || first == b'-' {
        return asm::parse_integer(arg);
    }
    register_by_name(arg).ok_or_else(|| TranslateErr::UnknownRegister(arg.to_string()))
}

fn register_by_name(name: &str) -> Option<u64> {
    match name {
        "zero" => return Some(0),
        "ra" => return Some(1),
        "sp" => return Some(2),
        "gp" => return Some(3),
        "tp" => return Some(4),
        "fp" => return Some(8),
        _ => {}
    }

    if name.len() < 2 || !name.is_ascii() {
        return None;
    }
    let n: u64 = name[1..].parse().ok()?;
    match name.as_bytes()[0] {
        b't' if n <= 2 => Some(n + 5),
        b't' if n <= 6 => Some(n + 25),
        b's' if n <= 1 => Some(n + 8),
        b's' if n <= 11 => Some(n + 16),
        b'a' if n <= 7 => Some(n + 10),
        b'x' if n <= 31 => Some(n),
        _ => None,
    }
}

//
// Encoding.
//

fn encode(tokens: &[ResolvedToken]) -> Result<Vec<u8>, AsmErr> {
    let size: u64 = tokens.iter().map(|t| match &t.kind {
        ResolvedKind::Instruction { .. } => 4,
        ResolvedKind::Literal(bytes) => bytes.len() as u64,
    }).sum();

    let mut code = vec![0u8; size as usize];
    for token in tokens {
        let at = token.address as usize;
        match &token.kind {
            ResolvedKind::Literal(bytes) => code[at..at + bytes.len()].copy_from_slice(bytes),
            ResolvedKind::Instruction { mnemonic, args } => {
                let word = encode_instruction(mnemonic, args, token.address)
                    .map_err(|e| AsmErr::encode(e, token.loc.clone()))?;
                code[at..at + 4].copy_from_slice(&word.to_le_bytes());
            }
        }
    }
    Ok(code)
}

fn encode_instruction(mnemonic: &str, args: &[u64], address: u64) -> Result<u32, EncodeErr> {
    match mnemonic {
        "add" | "sub" | "xor" | "or" | "and" | "sll" | "srl" | "sra" | "slt" | "sltu"
        | "mul" | "mulh" | "mulhsu" | "mulhu" | "div" | "divu" | "rem" | "remu" => {
            encode_arithmetic(mnemonic, args)
        }
        "addi" | "xori" | "ori" | "andi" | "slli" | "srli" | "srai" | "slti" | "sltiu" => {
            encode_imm_arithmetic(mnemonic, args)
        }
        "lb" | "lh" | "lw" | "lbu" | "lhu" => encode_load(mnemonic, args),
        "sb" | "sh" | "sw" => encode_store(mnemonic, args),
        "beq" | "bne" | "blt" | "bge" | "bltu" | "bgeu" => encode_branch(mnemonic, args, address),
        "jal" => encode_jal(args, address),
        "jalr" => encode_jalr(args),
        "lui" | "auipc" => encode_upper(mnemonic, args),
        "ecall" | "ebreak" => encode_call(mnemonic, args),
        _ => Err(EncodeErr::UnknownMnemonic(mnemonic.to_string())),
    }
}

fn expect_args(mnemonic: &str, args: &[u64], expected: usize) -> Result<(), EncodeErr> {
    match args.len() == expected {
        true => Ok(()),
        false => Err(EncodeErr::WrongArgCount { mnemonic: mnemonic.to_string(), expected }),
    }
}

/// Checks a register-number argument fits the 5-bit field.
fn reg_field(mnemonic: &str, value: u64) -> Result<u32, EncodeErr> {
    match value < 32 {
        true => Ok(value as u32),
        false => Err(EncodeErr::BadOperand {
            mnemonic: mnemonic.to_string(),
            operand: value.to_string(),
        }),
    }
}

/// Checks an immediate argument fits a signed (or raw unsigned) 12-bit
/// field and returns its masked value.
fn imm12(mnemonic: &str, value: u64) -> Result<u32, EncodeErr> {
    let signed = value as i64;
    match (-2048..=2047).contains(&signed) || value <= 0xfff {
        true => Ok((value as u32) & 0xfff),
        false => Err(EncodeErr::ImmTooLarge { mnemonic: mnemonic.to_string(), value: signed, bits: 12 }),
    }
}

/// Byte offset from this instruction to the absolute target the resolver
/// produced. The target is truncated to 32 bits first so that negative
/// numeric arguments behave.
fn branch_offset(target: u64, address: u64) -> i64 {
    (target as u32 as i32 as i64) - (address as u32 as i32 as i64)
}

fn encode_arithmetic(mnemonic: &str, args: &[u64]) -> Result<u32, EncodeErr> {
    expect_args(mnemonic, args, 3)?;

    let (funct3, funct7) = match mnemonic {
        "add"    => (0x0, 0x00),
        "sub"    => (0x0, 0x20),
        "sll"    => (0x1, 0x00),
        "slt"    => (0x2, 0x00),
        "sltu"   => (0x3, 0x00),
        "xor"    => (0x4, 0x00),
        "srl"    => (0x5, 0x00),
        "sra"    => (0x5, 0x20),
        "or"     => (0x6, 0x00),
        "and"    => (0x7, 0x00),
        "mul"    => (0x0, 0x01),
        "mulh"   => (0x1, 0x01),
        "mulhsu" => (0x2, 0x01),
        "mulhu"  => (0x3, 0x01),
        "div"    => (0x4, 0x01),
        "divu"   => (0x5, 0x01),
        "rem"    => (0x6, 0x01),
        "remu"   => (0x7, 0x01),
        _ => unreachable!("dispatched on mnemonic"),
    };

    Ok(0b0110011
        | (reg_field(mnemonic, args[0])? << 7)
        | (funct3 << 12)
        | (reg_field(mnemonic, args[1])? << 15)
        | (reg_field(mnemonic, args[2])? << 20)
        | (funct7 << 25))
}

fn encode_imm_arithmetic(mnemonic: &str, args: &[u64]) -> Result<u32, EncodeErr> {
    expect_args(mnemonic, args, 3)?;

    let (funct3, upper) = match mnemonic {
        "addi"  => (0x0, 0),
        "slli"  => (0x1, 0),
        "slti"  => (0x2, 0),
        "sltiu" => (0x3, 0),
        "xori"  => (0x4, 0),
        "srli"  => (0x5, 0),
        "srai"  => (0x5, 0x20 << 5),
        "ori"   => (0x6, 0),
        "andi"  => (0x7, 0),
        _ => unreachable!("dispatched on mnemonic"),
    };

    let imm = match mnemonic {
        // Shift amounts live in the low five bits of the immediate.
        "slli" | "srli" | "srai" => {
            if args[2] > 31 {
                return Err(EncodeErr::ImmTooLarge {
                    mnemonic: mnemonic.to_string(),
                    value: args[2] as i64,
                    bits: 5,
                });
            }
            args[2] as u32 | upper
        }
        _ => imm12(mnemonic, args[2])?,
    };

    Ok(0b0010011
        | (reg_field(mnemonic, args[0])? << 7)
        | (funct3 << 12)
        | (reg_field(mnemonic, args[1])? << 15)
        | (imm << 20))
}

fn encode_load(mnemonic: &str, args: &[u64]) -> Result<u32, EncodeErr> {
    expect_args(mnemonic, args, 3)?;

    let funct3 = match mnemonic {
        "lb"  => 0x0,
        "lh"  => 0x1,
        "lw"  => 0x2,
        "lbu" => 0x4,
        "lhu" => 0x5,
        _ => unreachable!("dispatched on mnemonic"),
    };

    Ok(0b0000011
        | (reg_field(mnemonic, args[0])? << 7)
        | (funct3 << 12)
        | (reg_field(mnemonic, args[1])? << 15)
        | (imm12(mnemonic, args[2])? << 20))
}

fn encode_store(mnemonic: &str, args: &[u64]) -> Result<u32, EncodeErr> {
    expect_args(mnemonic, args, 3)?;

    let funct3 = match mnemonic {
        "sb" => 0x0,
        "sh" => 0x1,
        "sw" => 0x2,
        _ => unreachable!("dispatched on mnemonic"),
    };

    let imm = imm12(mnemonic, args[2])?;
    Ok(0b0100011
        | ((imm & 0x1f) << 7)
        | (funct3 << 12)
        | (reg_field(mnemonic, args[0])? << 15)
        | (reg_field(mnemonic, args[1])? << 20)
        | ((imm >> 5) << 25))
}

fn encode_branch(mnemonic: &str, args: &[u64], address: u64) -> Result<u32, EncodeErr> {
    expect_args(mnemonic, args, 3)?;

    let funct3 = match mnemonic {
        "beq"  => 0x0,
        "bne"  => 0x1,
        "blt"  => 0x4,
        "bge"  => 0x5,
        "bltu" => 0x6,
        "bgeu" => 0x7,
        _ => unreachable!("dispatched on mnemonic"),
    };

    let offset = branch_offset(args[2], address);
    if offset % 2 != 0 || !(-4096..=4094).contains(&offset) {
        return Err(EncodeErr::BranchOutOfRange { mnemonic: mnemonic.to_string(), offset });
    }
    let off = offset as u32;

    Ok(0b1100011
        | (((off >> 11) & 0x1) << 7)
        | (((off >> 1) & 0xf) << 8)
        | (funct3 << 12)
        | (reg_field(mnemonic, args[0])? << 15)
        | (reg_field(mnemonic, args[1])? << 20)
        | (((off >> 5) & 0x3f) << 25)
        | (((off >> 12) & 0x1) << 31))
}

fn encode_jal(args: &[u64], address: u64) -> Result<u32, EncodeErr> {
    expect_args("jal", args, 2)?;

    let offset = branch_offset(args[1], address);
    if offset % 2 != 0 || !(-(1 << 20)..=(1 << 20) - 2).contains(&offset) {
        return Err(EncodeErr::BranchOutOfRange { mnemonic: "jal".to_string(), offset });
    }
    let off = offset as u32;

    Ok(0b1101111
        | (reg_field("jal", args[0])? << 7)
        | (((off >> 12) & 0xff) << 12)
        | (((off >> 11) & 0x1) << 20)
        | (((off >> 1) & 0x3ff) << 21)
        | (((off >> 20) & 0x1) << 31))
}

fn encode_jalr(args: &[u64]) -> Result<u32, EncodeErr> {
    expect_args("jalr", args, 3)?;

    Ok(0b1100111
        | (reg_field("jalr", args[0])? << 7)
        | (reg_field("jalr", args[1])? << 15)
        | (imm12("jalr", args[2])? << 20))
}

fn encode_upper(mnemonic: &str, args: &[u64]) -> Result<u32, EncodeErr> {
    expect_args(mnemonic, args, 2)?;

    let opcode = match mnemonic {
        "lui" => 0b0110111,
        _ => 0b0010111,
    };

    let imm = args[1];
    let signed = imm as i64;
    if imm > 0xfffff && !(-(1 << 19)..0).contains(&signed) {
        return Err(EncodeErr::ImmTooLarge { mnemonic: mnemonic.to_string(), value: signed, bits: 20 });
    }

    Ok(opcode
        | (reg_field(mnemonic, args[0])? << 7)
        | (((imm as u32) & 0xfffff) << 12))
}

fn encode_call(mnemonic: &str, args: &[u64]) -> Result<u32, EncodeErr> {
    expect_args(mnemonic, args, 0)?;

    let mut code = 0b1110011;
    if mnemonic == "ebreak" {
        code |= 1 << 20;
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::RiscV;
    use crate::asm::{AsmErrKind, EncodeErr};
    use crate::sim::{Call, Machine, SYS_BREAK};

    fn assemble(src: &str) -> Vec<u8> {
        RiscV::new().assemble_source("test.asm", src).unwrap().0
    }

    fn machine_with(src: &str) -> RiscV {
        let mut m = RiscV::new();
        let (code, _) = m.assemble_source("test.asm", src).unwrap();
        m.load_program(&code).unwrap();
        m
    }

    fn step(m: &mut RiscV) -> Option<Call> {
        m.next_instruction().unwrap()
    }

    fn reg(m: &RiscV, name: &str) -> u64 {
        let r = m.register_number(name).unwrap();
        m.get_register(r).unwrap()
    }

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_register_zero() {
        let mut m = RiscV::new();
        m.set_register(1, 39).unwrap();
        assert_eq!(m.get_register(1), Ok(39));

        m.set_register(0, 39).unwrap();
        assert_eq!(m.get_register(0), Ok(0));

        m.set_register(31, 42).unwrap();
        assert_eq!(m.get_register(31), Ok(42));

        assert!(m.get_register(32).is_err());
        assert!(m.set_register(32, 0).is_err());
    }

    #[test]
    fn test_register_truncates() {
        let mut m = RiscV::new();
        m.set_register(5, 0x1_2345_6789).unwrap();
        assert_eq!(m.get_register(5), Ok(0x2345_6789));
    }

    #[test]
    fn test_memory_bounds() {
        let mut m = RiscV::new();
        let max = u32::MAX as u64;

        m.set_memory(0, 69).unwrap();
        assert_eq!(m.get_memory(0), Ok(69));
        m.set_memory(max, 42).unwrap();
        assert_eq!(m.get_memory(max), Ok(42));

        assert!(m.set_memory(max + 1, 39).is_err());
        assert!(m.get_memory(max + 1).is_err());
    }

    #[test]
    fn test_memory_chunks() {
        let mut m = RiscV::new();
        let max = u32::MAX as u64;
        let bytes = [69, 42, 39];

        m.set_memory_chunk(0, &bytes).unwrap();
        assert_eq!(m.get_memory_chunk(0, 3).unwrap(), bytes);

        m.set_memory_chunk(max - 2, &bytes).unwrap();
        assert_eq!(m.get_memory_chunk(max - 2, 3).unwrap(), bytes);

        assert!(m.set_memory_chunk(max - 1, &bytes).is_err());
        assert!(m.get_memory_chunk(max - 1, 3).is_err());
    }

    #[test]
    fn test_register_names() {
        let m = RiscV::new();
        assert_eq!(m.register_number("zero"), Ok(0));
        assert_eq!(m.register_number("ra"), Ok(1));
        assert_eq!(m.register_number("sp"), Ok(2));
        assert_eq!(m.register_number("fp"), Ok(8));
        assert_eq!(m.register_number("s0"), Ok(8));
        assert_eq!(m.register_number("s1"), Ok(9));
        assert_eq!(m.register_number("s2"), Ok(18));
        assert_eq!(m.register_number("s11"), Ok(27));
        assert_eq!(m.register_number("t0"), Ok(5));
        assert_eq!(m.register_number("t2"), Ok(7));
        assert_eq!(m.register_number("t3"), Ok(28));
        assert_eq!(m.register_number("t6"), Ok(31));
        assert_eq!(m.register_number("a0"), Ok(10));
        assert_eq!(m.register_number("a7"), Ok(17));
        assert_eq!(m.register_number("x0"), Ok(0));
        assert_eq!(m.register_number("x31"), Ok(31));
        assert!(m.register_number("x32").is_err());
        assert!(m.register_number("t7").is_err());
        assert!(m.register_number("q0").is_err());
    }

    #[test]
    fn test_encodings() {
        // Reference words produced by RARS.
        let code = assemble(
            "add gp, t0, t2\n\
             sub gp, t0, t2\n\
             xor gp, t0, t2\n\
             or gp, t0, t2\n\
             and gp, t0, t2\n\
             addi gp, t0, 42\n\
             sltiu gp, t0, 42\n\
             lw gp, t0, 42\n\
             sb t0, gp, 3\n\
             sh t0, gp, -3\n\
             lui gp, 5\n\
             auipc gp, 5\n\
             lui gp, 0xffffb\n\
             ecall\n\
             ebreak\n\
             mul gp, t0, t2\n",
        );
        assert_eq!(words(&code), vec![
            0x007281b3,
            0x407281b3,
            0x0072c1b3,
            0x0072e1b3,
            0x0072f1b3,
            0x02a28193,
            0x02a2b193,
            0x02a2a183,
            0x003281a3,
            0xfe329ea3,
            0x000051b7,
            0x00005197,
            0xffffb1b7,
            0x00000073,
            0x00100073,
            0x027281b3,
        ]);
    }

    #[test]
    fn test_branch_and_jal_encoding() {
        // beq t0, t1, +8 and jal ra, +8, both at address 0.
        let code = assemble("beq t0, t1, 8\nnext: jal ra, 12");
        let ws = words(&code);
        assert_eq!(ws[0], 0x00628463);
        assert_eq!(ws[1], 0x008000ef);
    }

    #[test]
    fn test_addi_step() {
        let mut m = machine_with("addi t0, zero, 5");
        assert_eq!(step(&mut m), None);
        assert_eq!(reg(&m, "t0"), 5);
        assert_eq!(m.current_instruction_address(), 4);
    }

    #[test]
    fn test_sub_from_zero() {
        let mut m = machine_with("addi t0, zero, 7\nsub t0, zero, t0");
        step(&mut m);
        step(&mut m);
        // Two's complement of 7.
        assert_eq!(reg(&m, "t0"), 0xFFFF_FFF9);
    }

    #[test]
    fn test_branch_taken_and_skipped() {
        let mut m = machine_with(
            "addi t0, zero, 1\n\
             beq t0, t0, skip\n\
             addi t1, zero, 42\n\
             skip: addi t2, zero, 99\n",
        );
        step(&mut m);
        step(&mut m);
        assert_eq!(m.current_instruction_address(), 12);
        assert_eq!(reg(&m, "t1"), 0);
        step(&mut m);
        assert_eq!(reg(&m, "t2"), 99);
    }

    #[test]
    fn test_branch_not_taken() {
        let mut m = machine_with(
            "addi t0, zero, 1\n\
             bne t0, t0, 0\n\
             addi t1, zero, 2\n",
        );
        step(&mut m);
        let pc = m.current_instruction_address();
        step(&mut m);
        assert_eq!(m.current_instruction_address(), pc + 4);
    }

    #[test]
    fn test_branch_conditions() {
        let mut m = machine_with(
            "addi t0, zero, -1\n\
             addi t1, zero, 1\n\
             blt t0, t1, a\n\
             a: bltu t0, t1, b\n\
             addi t2, zero, 1\n\
             b: bge t1, t0, c\n\
             c: ebreak\n",
        );
        step(&mut m);
        step(&mut m);
        // blt: -1 < 1, taken.
        step(&mut m);
        assert_eq!(m.current_instruction_address(), 12);
        // bltu: 0xFFFFFFFF < 1 is false unsigned, not taken.
        step(&mut m);
        assert_eq!(m.current_instruction_address(), 16);
        step(&mut m);
        // bge: 1 >= -1, taken.
        step(&mut m);
        assert_eq!(m.current_instruction_address(), 24);
    }

    #[test]
    fn test_jal_jalr_round_trip() {
        let mut m = machine_with(
            "jal ra, func\n\
             addi t1, zero, 1\n\
             ebreak\n\
             func: addi t0, zero, 5\n\
             jalr zero, ra, 0\n",
        );
        step(&mut m);
        assert_eq!(m.current_instruction_address(), 12);
        assert_eq!(reg(&m, "ra"), 4);
        step(&mut m);
        assert_eq!(reg(&m, "t0"), 5);
        step(&mut m);
        assert_eq!(m.current_instruction_address(), 4);
        step(&mut m);
        assert_eq!(reg(&m, "t1"), 1);
    }

    #[test]
    fn test_jalr_masks_low_bit() {
        let mut m = machine_with("addi t0, zero, 9\njalr zero, t0, 0");
        step(&mut m);
        step(&mut m);
        assert_eq!(m.current_instruction_address(), 8);
    }

    #[test]
    fn test_syscall_routing() {
        // Call number 1 in x17 surfaces a BREAK-numbered record.
        let mut m = machine_with("addi a7, zero, 1\necall");
        step(&mut m);
        let call = step(&mut m).unwrap();
        assert_eq!(call.number, SYS_BREAK);

        // Other numbers pass x10/x11 through, and the PC advances.
        let mut m = machine_with(
            "addi a7, zero, 3\n\
             addi a0, zero, 0x40\n\
             addi a1, zero, 5\n\
             ecall\n\
             addi t0, zero, 1\n",
        );
        step(&mut m);
        step(&mut m);
        step(&mut m);
        assert_eq!(step(&mut m), Some(Call { number: 3, arg1: 0x40, arg2: 5 }));
        assert_eq!(m.current_instruction_address(), 16);
        step(&mut m);
        assert_eq!(reg(&m, "t0"), 1);
    }

    #[test]
    fn test_ebreak() {
        let mut m = machine_with("ebreak");
        assert_eq!(step(&mut m).unwrap().number, SYS_BREAK);
        assert_eq!(m.current_instruction_address(), 4);
    }

    #[test]
    fn test_lui_auipc() {
        let mut m = machine_with("lui t0, 0xaaaaa\nauipc t1, 0xaaaaa");
        step(&mut m);
        assert_eq!(reg(&m, "t0"), 0xAAAA_A000);
        let pc = m.current_instruction_address();
        step(&mut m);
        assert_eq!(reg(&m, "t1"), 0xAAAA_A000 + pc);
        assert_eq!(m.current_instruction_address(), pc + 4);
    }

    #[test]
    fn test_loads_and_stores() {
        let mut m = machine_with(
            "lui t0, 0x1\n\
             lui t1, 0xaaef0\n\
             addi t1, t1, -1\n\
             sw t0, t1, 0\n\
             lw t2, t0, 0\n\
             lb t2, t0, 0\n\
             lbu t3, t0, 0\n\
             lh t4, t0, 0\n\
             lhu t5, t0, 0\n\
             lbu t6, t0, 2\n",
        );
        step(&mut m); // t0 = 0x1000
        step(&mut m);
        step(&mut m);
        assert_eq!(reg(&m, "t1"), 0xAAEE_FFFF);
        step(&mut m); // mem[0x1000..] = ff ff ee aa
        step(&mut m);
        assert_eq!(reg(&m, "t2"), 0xAAEE_FFFF);
        step(&mut m);
        assert_eq!(reg(&m, "t2"), 0xFFFF_FFFF); // lb sign-extends 0xff
        step(&mut m);
        assert_eq!(reg(&m, "t3"), 0x0000_00FF);
        step(&mut m);
        assert_eq!(reg(&m, "t4"), 0xFFFF_FFFF); // lh sign-extends 0xffff
        step(&mut m);
        assert_eq!(reg(&m, "t5"), 0x0000_FFFF);
        step(&mut m);
        assert_eq!(reg(&m, "t6"), 0x0000_00EE);
    }

    #[test]
    fn test_sb_sh() {
        let mut m = machine_with(
            "addi t0, zero, 0x100\n\
             addi t1, zero, -2\n\
             sb t0, t1, 0\n\
             sh t0, t1, 2\n",
        );
        step(&mut m);
        step(&mut m);
        step(&mut m);
        step(&mut m);
        assert_eq!(m.get_memory_chunk(0x100, 4).unwrap(), [0xFE, 0x00, 0xFE, 0xFF]);
    }

    #[test]
    fn test_shifts() {
        let mut m = machine_with(
            "lui t0, 0xe0000\n\
             addi t1, zero, 4\n\
             srl t2, t0, t1\n\
             sra t3, t0, t1\n\
             sll t4, t0, t1\n\
             srai t5, t0, 4\n\
             srli t6, t0, 4\n",
        );
        step(&mut m);
        step(&mut m);
        step(&mut m);
        assert_eq!(reg(&m, "t2"), 0x0E00_0000);
        step(&mut m);
        assert_eq!(reg(&m, "t3"), 0xFE00_0000);
        step(&mut m);
        assert_eq!(reg(&m, "t4"), 0x0000_0000);
        step(&mut m);
        assert_eq!(reg(&m, "t5"), 0xFE00_0000);
        step(&mut m);
        assert_eq!(reg(&m, "t6"), 0x0E00_0000);
    }

    #[test]
    fn test_slt_family() {
        let mut m = machine_with(
            "addi t0, zero, -1\n\
             addi t1, zero, 1\n\
             slt t2, t0, t1\n\
             sltu t3, t0, t1\n\
             slti t4, t0, 0\n\
             sltiu t5, t0, -1\n",
        );
        for _ in 0..6 {
            step(&mut m);
        }
        assert_eq!(reg(&m, "t2"), 1); // -1 < 1 signed
        assert_eq!(reg(&m, "t3"), 0); // 0xFFFFFFFF < 1 unsigned is false
        assert_eq!(reg(&m, "t4"), 1);
        assert_eq!(reg(&m, "t5"), 0); // 0xFFFFFFFF < 0xFFFFFFFF is false
    }

    #[test]
    fn test_multiplication() {
        let mut m = machine_with(
            "lui t0, 0xaaaaa\n\
             addi t1, zero, 3\n\
             mul t2, t0, t1\n\
             mulh t3, t0, t1\n\
             mulhu t4, t0, t1\n",
        );
        for _ in 0..5 {
            step(&mut m);
        }
        // 0xAAAAA000 * 3 = 0x1_FFFFE000: low word 0xFFFFE000.
        assert_eq!(reg(&m, "t2"), 0xFFFF_E000);
        // Signed product is -0x1_00002000, so the high word is -2.
        assert_eq!(reg(&m, "t3"), 0xFFFF_FFFE);
        // Unsigned high word is 1.
        assert_eq!(reg(&m, "t4"), 1);
    }

    #[test]
    fn test_division_edge_cases() {
        let mut m = machine_with(
            "addi t0, zero, 7\n\
             div t1, t0, zero\n\
             rem t2, t0, zero\n\
             lui t3, 0x80000\n\
             addi t4, zero, -1\n\
             div t5, t3, t4\n\
             rem t6, t3, t4\n",
        );
        for _ in 0..7 {
            step(&mut m);
        }
        // Division by zero yields 0 here.
        assert_eq!(reg(&m, "t1"), 0);
        assert_eq!(reg(&m, "t2"), 0);
        // MIN / -1 wraps to MIN; MIN % -1 is 0.
        assert_eq!(reg(&m, "t5"), 0x8000_0000);
        assert_eq!(reg(&m, "t6"), 0);
    }

    #[test]
    fn test_division() {
        let mut m = machine_with(
            "addi t0, zero, -7\n\
             addi t1, zero, 2\n\
             div t2, t0, t1\n\
             rem t3, t0, t1\n\
             divu t4, t0, t1\n",
        );
        for _ in 0..5 {
            step(&mut m);
        }
        assert_eq!(reg(&m, "t2") as u32 as i32, -3);
        assert_eq!(reg(&m, "t3") as u32 as i32, -1);
        assert_eq!(reg(&m, "t4"), 0x7FFF_FFFC);
    }

    #[test]
    fn test_unknown_opcode() {
        let mut m = RiscV::new();
        m.load_program(&0x0000_007Fu32.to_le_bytes()).unwrap();
        assert!(matches!(
            m.next_instruction(),
            Err(crate::sim::StepErr::UnknownOpcode { pc: 0, .. })
        ));
    }

    #[test]
    fn test_encode_errors() {
        let m = RiscV::new();

        let err = m.assemble_source("t.asm", "add t0, t1").unwrap_err();
        assert!(matches!(
            err.kind,
            AsmErrKind::Encode(EncodeErr::WrongArgCount { expected: 3, .. })
        ));

        let err = m.assemble_source("t.asm", "frobnicate t0").unwrap_err();
        assert!(matches!(
            err.kind,
            AsmErrKind::Encode(EncodeErr::UnknownMnemonic(_))
        ));

        let err = m.assemble_source("t.asm", "addi t0, zero, 4096").unwrap_err();
        assert!(matches!(
            err.kind,
            AsmErrKind::Encode(EncodeErr::ImmTooLarge { bits: 12, .. })
        ));

        let err = m.assemble_source("t.asm", "beq t0, t1, 8192").unwrap_err();
        assert!(matches!(
            err.kind,
            AsmErrKind::Encode(EncodeErr::BranchOutOfRange { .. })
        ));
    }

    #[test]
    fn test_label_across_literal() {
        // The five-byte literal sits between the labels, so `bar` lands
        // exactly five bytes after `foo`; both resolve as instruction
        // arguments.
        let mut m = machine_with(
            "addi t0, zero, bar\n\
             addi t1, zero, foo\n\
             foo:\n\
             #hello\n\
             bar: addi t2, zero, 0\n",
        );
        step(&mut m);
        step(&mut m);
        assert_eq!(reg(&m, "t1"), 8);
        assert_eq!(reg(&m, "t0"), 13); // 2 instructions (8) + literal (5)
    }

    #[test]
    fn test_debug_symbols() {
        let m = RiscV::new();
        let (_, debug) = m
            .assemble_source("t.asm", "start: addi t0, zero, 1\nloop: beq t0, t0, loop\n")
            .unwrap();

        assert_eq!(debug.len(), 2);
        assert_eq!(debug[0].address, 0);
        assert_eq!(debug[0].label.as_deref(), Some("start"));
        assert_eq!(debug[0].mnemonic, "addi");
        assert_eq!(debug[0].args, vec!["t0", "zero", "1"]);
        assert_eq!(debug[1].address, 4);
        assert_eq!(debug[1].label.as_deref(), Some("loop"));
    }
}
