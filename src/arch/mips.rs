//! The MIPS-I backend.
//!
//! A subset of MIPS32: no delay slots, no coprocessors, no traps.
//! Instructions are stored little-endian in memory, matching the RISC-V
//! backend's layout. The 32 general-purpose registers are joined by HI
//! and LO as register numbers 32 and 33.
//!
//! Documented divergences from real MIPS-I:
//! - Branch displacements are relative to the branch instruction itself
//!   (there is no delay slot to be relative to).
//! - `lwl`/`lwr` splice a two-byte halfword into the upper or lower half
//!   of RT rather than performing the alignment-dependent load of the
//!   MIPS spec.
//! - Division by zero leaves HI = LO = 0 instead of an unpredictable
//!   result.
//! - `syscall` and `break` surface a [`Call`] to the host: the call
//!   number in v0, arguments in a0 and a1.

use std::path::Path;

use crate::asm::{
    self, AsmErr, DebugToken, EncodeErr, ResolvedKind, ResolvedToken, TranslateErr,
};
use crate::parse;
use crate::sim::{ArchInfo, Call, Machine, MemErr, RegErr, StepErr, SYS_BREAK};
use crate::sim::mem::PagedMemory;

const MAX_ADDRESS: u64 = u32::MAX as u64;
const REGISTER_COUNT: u64 = 34;

/// Register number of HI.
const HI: usize = 32;
/// Register number of LO.
const LO: usize = 33;

static REGISTER_NAMES: &[&str] = &[
    "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3",
    "t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7",
    "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7",
    "t8", "t9", "k0", "k1", "gp", "sp", "s8", "ra",
    "hi", "lo",
];

/// A MIPS-I machine.
pub struct Mips {
    registers: [u32; 34],
    pc: u32,
    mem: PagedMemory,
}

impl Mips {
    /// Creates a machine with zeroed registers and memory.
    pub fn new() -> Self {
        Mips {
            registers: [0; 34],
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

        match word >> 26 {
            0 => {
                let (rs, rt, rd, shamt, funct) = parse_r(word);
                match funct {
                    // syscall
                    12 => {
                        let call = Call {
                            number: self.read_reg(2) as u64,
                            arg1: self.read_reg(4) as u64,
                            arg2: self.read_reg(5) as u64,
                        };
                        self.pc = self.pc.wrapping_add(4);
                        return Ok(Some(call));
                    }
                    // break
                    13 => {
                        self.pc = self.pc.wrapping_add(4);
                        return Ok(Some(Call { number: SYS_BREAK, arg1: 0, arg2: 0 }));
                    }
                    _ => self.exec_special(rs, rt, rd, shamt, funct).ok_or(unknown)?,
                }
            }
            1 => {
                let (rs, rt, imm) = parse_i(word);
                self.exec_regimm(rs, rt, imm).ok_or(unknown)?;
            }
            2 => self.exec_jump(parse_j(word)),
            3 => {
                self.write_reg(31, self.pc.wrapping_add(4));
                self.exec_jump(parse_j(word));
            }
            28 => {
                let (rs, _, rd, _, funct) = parse_r(word);
                self.exec_special2(rs, rd, funct).ok_or(unknown)?;
            }
            31 => {
                let (_, rt, rd, shamt, funct) = parse_r(word);
                self.exec_special3(rt, rd, shamt, funct).ok_or(unknown)?;
            }
            4..=7 => {
                let (rs, rt, imm) = parse_i(word);
                self.exec_branch(word >> 26, rs, rt, imm);
            }
            8..=15 => {
                let (rs, rt, imm) = parse_i(word);
                self.exec_imm_arithmetic(word >> 26, rs, rt, imm);
            }
            32..=38 => {
                let (rs, rt, imm) = parse_i(word);
                self.exec_load(word >> 26, rs, rt, imm).ok_or(unknown)??;
            }
            40 | 41 | 43 => {
                let (rs, rt, imm) = parse_i(word);
                self.exec_store(word >> 26, rs, rt, imm)?;
            }
            _ => return Err(StepErr::UnknownOpcode { pc: self.pc as u64, word }),
        }

        Ok(None)
    }

    /// SPECIAL-group instructions (opcode 0, dispatch on funct). Returns
    /// `None` for an undefined funct.
    fn exec_special(&mut self, rs: u8, rt: u8, rd: u8, shamt: u8, funct: u8) -> Option<()> {
        let a = self.read_reg(rs) as i32;
        let b = self.read_reg(rt) as i32;

        match funct {
            // jr
            8 => {
                self.pc = a as u32;
                return Some(());
            }
            // jalr
            9 => {
                let target = a as u32;
                self.write_reg(rd, self.pc.wrapping_add(4));
                self.pc = target;
                return Some(());
            }
            // mult: signed 64-bit product into HI/LO.
            0x18 => {
                let product = (a as i64) * (b as i64);
                self.registers[HI] = (product >> 32) as u32;
                self.registers[LO] = product as u32;
            }
            // div: quotient into LO, remainder into HI. A zero divisor
            // clears both.
            0x1a => match b {
                0 => {
                    self.registers[HI] = 0;
                    self.registers[LO] = 0;
                }
                _ => {
                    self.registers[LO] = a.wrapping_div(b) as u32;
                    self.registers[HI] = a.wrapping_rem(b) as u32;
                }
            },
            // mthi / mtlo
            0x11 => self.registers[HI] = a as u32,
            0x13 => self.registers[LO] = a as u32,
            _ => {
                let r: i32 = match funct {
                    // Shifts operate on RT; the amount is the shamt field
                    // or the low five bits of RS.
                    0 => ((b as u32) << shamt) as i32,
                    2 => ((b as u32) >> shamt) as i32,
                    3 => b >> shamt,
                    4 => ((b as u32) << (a & 0x1f)) as i32,
                    6 => ((b as u32) >> (a & 0x1f)) as i32,
                    7 => b >> (a & 0x1f),
                    // mfhi / mflo
                    0x10 => self.registers[HI] as i32,
                    0x12 => self.registers[LO] as i32,
                    // movz / movn write RD only when the condition holds.
                    0xa => match b == 0 {
                        true => a,
                        false => {
                            self.pc = self.pc.wrapping_add(4);
                            return Some(());
                        }
                    },
                    0xb => match b != 0 {
                        true => a,
                        false => {
                            self.pc = self.pc.wrapping_add(4);
                            return Some(());
                        }
                    },
                    0x20 => a.wrapping_add(b),
                    0x21 => (a as u32).wrapping_add(b as u32) as i32,
                    0x22 => a.wrapping_sub(b),
                    0x23 => (a as u32).wrapping_sub(b as u32) as i32,
                    0x24 => a & b,
                    0x25 => a | b,
                    0x26 => a ^ b,
                    0x27 => !(a | b),
                    0x2a => (a < b) as i32,
                    0x2b => ((a as u32) < (b as u32)) as i32,
                    _ => return None,
                };
                self.write_reg(rd, r as u32);
            }
        }

        self.pc = self.pc.wrapping_add(4);
        Some(())
    }

    /// SPECIAL2-group instructions (opcode 28): clz and clo.
    fn exec_special2(&mut self, rs: u8, rd: u8, funct: u8) -> Option<()> {
        let a = self.read_reg(rs);

        let r = match funct {
            16 => a.leading_zeros(),
            17 => (!a).leading_zeros(),
            _ => return None,
        };

        self.write_reg(rd, r);
        self.pc = self.pc.wrapping_add(4);
        Some(())
    }

    /// SPECIAL3-group instructions (opcode 31): seb and seh.
    fn exec_special3(&mut self, rt: u8, rd: u8, shamt: u8, funct: u8) -> Option<()> {
        if funct != 32 {
            return None;
        }
        let b = self.read_reg(rt);

        let r = match shamt {
            16 => b as u8 as i8 as i32 as u32,
            24 => b as u16 as i16 as i32 as u32,
            _ => return None,
        };

        self.write_reg(rd, r);
        self.pc = self.pc.wrapping_add(4);
        Some(())
    }

    /// REGIMM-group branches (opcode 1, dispatch on the RT field).
    fn exec_regimm(&mut self, rs: u8, rt: u8, imm: u32) -> Option<()> {
        let a = self.read_reg(rs) as i32;

        let taken = match rt {
            0 => a < 0,
            1 => a >= 0,
            _ => return None,
        };

        self.take_branch(taken, imm);
        Some(())
    }

    fn exec_branch(&mut self, opcode: u32, rs: u8, rt: u8, imm: u32) {
        let a = self.read_reg(rs) as i32;
        let b = self.read_reg(rt) as i32;

        let taken = match opcode {
            4 => a == b,
            5 => a != b,
            6 => a <= 0,
            _ => a > 0,
        };

        self.take_branch(taken, imm);
    }

    /// Applies a 16-bit branch displacement (in words, relative to this
    /// instruction) or falls through.
    fn take_branch(&mut self, taken: bool, imm: u32) {
        self.pc = match taken {
            true => self.pc.wrapping_add(sign_extend16(imm) << 2),
            false => self.pc.wrapping_add(4),
        };
    }

    /// J/JAL target: the region bits of PC+4 with the 26-bit field
    /// shifted into place.
    fn exec_jump(&mut self, imm: u32) {
        self.pc = (self.pc.wrapping_add(4) & 0xf000_0000) | (imm << 2);
    }

    fn exec_imm_arithmetic(&mut self, opcode: u32, rs: u8, rt: u8, imm: u32) {
        let a = self.read_reg(rs) as i32;
        let signed = sign_extend16(imm) as i32;

        let r: i32 = match opcode {
            // addi / addiu (no overflow trap, so they coincide)
            8 | 9 => a.wrapping_add(signed),
            // slti / sltiu (sltiu sign-extends, then compares unsigned)
            10 => (a < signed) as i32,
            11 => ((a as u32) < (signed as u32)) as i32,
            // andi / ori / xori zero-extend
            12 => a & imm as i32,
            13 => a | imm as i32,
            14 => a ^ imm as i32,
            // lui
            _ => (imm << 16) as i32,
        };

        self.write_reg(rt, r as u32);
        self.pc = self.pc.wrapping_add(4);
    }

    /// Loads. Returns `None` for an undefined opcode in the load group.
    fn exec_load(&mut self, opcode: u32, rs: u8, rt: u8, imm: u32) -> Option<Result<(), StepErr>> {
        let addr = self.read_reg(rs).wrapping_add(sign_extend16(imm)) as u64;
        let old = self.read_reg(rt);

        let r: Result<u32, MemErr> = match opcode {
            // lb / lbu
            32 => self.mem.get(addr).map(|b| b as i8 as i32 as u32),
            36 => self.mem.get(addr).map(u32::from),
            // lh / lhu
            33 => self.load_half(addr).map(|h| h as i16 as i32 as u32),
            37 => self.load_half(addr).map(u32::from),
            // lw
            35 => self.load_word(addr),
            // lwl / lwr: splice a halfword into the upper or lower half.
            34 => self.load_half(addr).map(|h| ((h as u32) << 16) | (old & 0xffff)),
            38 => self.load_half(addr).map(|h| (h as u32) | (old & 0xffff_0000)),
            _ => return None,
        };

        Some(match r {
            Ok(value) => {
                self.write_reg(rt, value);
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

    fn exec_store(&mut self, opcode: u32, rs: u8, rt: u8, imm: u32) -> Result<(), StepErr> {
        let addr = self.read_reg(rs).wrapping_add(sign_extend16(imm)) as u64;
        let value = self.read_reg(rt);

        match opcode {
            40 => self.mem.set(addr, value as u8)?,
            41 => self.mem.set_chunk(addr, &(value as u16).to_le_bytes())?,
            _ => self.mem.set_chunk(addr, &value.to_le_bytes())?,
        }

        self.pc = self.pc.wrapping_add(4);
        Ok(())
    }
}

impl Default for Mips {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine for Mips {
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
            name: "MIPS32",
            register_names: REGISTER_NAMES,
            word_width: 32,
        }
    }
}

fn sign_extend16(n: u32) -> u32 {
    n as u16 as i16 as i32 as u32
}

/// Parses an R-type word. Returns rs, rt, rd, shamt, funct.
fn parse_r(word: u32) -> (u8, u8, u8, u8, u8) {
    let rs = ((word >> 21) & 0x1f) as u8;
    let rt = ((word >> 16) & 0x1f) as u8;
    let rd = ((word >> 11) & 0x1f) as u8;
    let shamt = ((word >> 6) & 0x1f) as u8;
    let funct = (word & 0x3f) as u8;
    (rs, rt, rd, shamt, funct)
}

/// Parses an I-type word. Returns rs, rt and the raw 16-bit immediate.
fn parse_i(word: u32) -> (u8, u8, u32) {
    let rs = ((word >> 21) & 0x1f) as u8;
    let rt = ((word >> 16) & 0x1f) as u8;
    (rs, rt, word & 0xffff)
}

/// Parses a J-type word. Returns the 26-bit target field.
fn parse_j(word: u32) -> u32 {
    word & 0x03ff_ffff
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
        "at" => return Some(1),
        "v0" => return Some(2),
        "v1" => return Some(3),
        "k0" => return Some(26),
        "k1" => return Some(27),
        "gp" => return Some(28),
        "sp" => return Some(29),
        "fp" | "s8" => return Some(30),
        "ra" => return Some(31),
        "hi" => return Some(32),
        "lo" => return Some(33),
        _ => {}
    }

    if name.len() < 2 || !name.is_ascii() {
        return None;
    }
    let n: u64 = name[1..].parse().ok()?;
    match name.as_bytes()[0] {
        b't' if n <= 7 => Some(n + 8),
        b't' if n <= 9 => Some(n + 16),
        b's' if n <= 7 => Some(n + 16),
        b'a' if n <= 3 => Some(n + 4),
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
        "add" | "addu" | "sub" | "subu" | "slt" | "sltu" | "and" | "or" | "xor" | "nor"
        | "movz" | "movn" | "sll" | "srl" | "sra" | "sllv" | "srlv" | "srav" | "jr"
        | "jalr" | "mult" | "div" | "mfhi" | "mflo" | "mthi" | "mtlo" => {
            encode_special(mnemonic, args)
        }
        "clz" | "clo" => encode_special2(mnemonic, args),
        "seb" | "seh" => encode_special3(mnemonic, args),
        "bltz" | "bgez" => encode_regimm(mnemonic, args, address),
        "beq" | "bne" => encode_branch2(mnemonic, args, address),
        "blez" | "bgtz" => encode_branch1(mnemonic, args, address),
        "addi" | "addiu" | "slti" | "sltiu" | "andi" | "ori" | "xori" => {
            encode_imm_arithmetic(mnemonic, args)
        }
        "lui" => encode_lui(args),
        "j" | "jal" => encode_jump(mnemonic, args),
        "lb" | "lbu" | "lh" | "lhu" | "lw" | "lwl" | "lwr" => encode_mem(mnemonic, args),
        "sb" | "sh" | "sw" => encode_mem(mnemonic, args),
        "syscall" => expect_args(mnemonic, args, 0).map(|_| 12),
        "break" => expect_args(mnemonic, args, 0).map(|_| 13),
        "nop" => expect_args(mnemonic, args, 0).map(|_| 0),
        _ => Err(EncodeErr::UnknownMnemonic(mnemonic.to_string())),
    }
}

fn expect_args(mnemonic: &str, args: &[u64], expected: usize) -> Result<(), EncodeErr> {
    match args.len() == expected {
        true => Ok(()),
        false => Err(EncodeErr::WrongArgCount { mnemonic: mnemonic.to_string(), expected }),
    }
}

fn reg_field(mnemonic: &str, value: u64) -> Result<u32, EncodeErr> {
    match value < 32 {
        true => Ok(value as u32),
        false => Err(EncodeErr::BadOperand {
            mnemonic: mnemonic.to_string(),
            operand: value.to_string(),
        }),
    }
}

/// Checks an immediate fits a signed (or raw unsigned) 16-bit field and
/// returns its masked value.
fn imm16(mnemonic: &str, value: u64) -> Result<u32, EncodeErr> {
    let signed = value as i64;
    match (-32768..=32767).contains(&signed) || value <= 0xffff {
        true => Ok((value as u32) & 0xffff),
        false => Err(EncodeErr::ImmTooLarge { mnemonic: mnemonic.to_string(), value: signed, bits: 16 }),
    }
}

fn special_fields(rs: u32, rt: u32, rd: u32, shamt: u32, funct: u32) -> u32 {
    (rs << 21) | (rt << 16) | (rd << 11) | (shamt << 6) | funct
}

fn encode_special(mnemonic: &str, args: &[u64]) -> Result<u32, EncodeErr> {
    let r = |v: u64| reg_field(mnemonic, v);

    match mnemonic {
        "jr" => {
            expect_args(mnemonic, args, 1)?;
            Ok(special_fields(r(args[0])?, 0, 0, 0, 8))
        }
        "jalr" => {
            // One argument links through ra; two pick the link register.
            let (rd, rs) = match args {
                [rs] => (31, r(*rs)?),
                [rd, rs] => (r(*rd)?, r(*rs)?),
                _ => return Err(EncodeErr::WrongArgCount { mnemonic: mnemonic.to_string(), expected: 2 }),
            };
            Ok(special_fields(rs, 0, rd, 0, 9))
        }
        "mult" | "div" => {
            expect_args(mnemonic, args, 2)?;
            let funct = match mnemonic { "mult" => 0x18, _ => 0x1a };
            Ok(special_fields(r(args[0])?, r(args[1])?, 0, 0, funct))
        }
        "mfhi" | "mflo" => {
            expect_args(mnemonic, args, 1)?;
            let funct = match mnemonic { "mfhi" => 0x10, _ => 0x12 };
            Ok(special_fields(0, 0, r(args[0])?, 0, funct))
        }
        "mthi" | "mtlo" => {
            expect_args(mnemonic, args, 1)?;
            let funct = match mnemonic { "mthi" => 0x11, _ => 0x13 };
            Ok(special_fields(r(args[0])?, 0, 0, 0, funct))
        }
        // Constant shifts take the value in RT and the amount in shamt.
        "sll" | "srl" | "sra" => {
            expect_args(mnemonic, args, 3)?;
            let funct = match mnemonic { "sll" => 0, "srl" => 2, _ => 3 };
            if args[2] > 31 {
                return Err(EncodeErr::ImmTooLarge {
                    mnemonic: mnemonic.to_string(),
                    value: args[2] as i64,
                    bits: 5,
                });
            }
            Ok(special_fields(0, r(args[1])?, r(args[0])?, args[2] as u32, funct))
        }
        // Variable shifts take the value in RT and the amount in RS.
        "sllv" | "srlv" | "srav" => {
            expect_args(mnemonic, args, 3)?;
            let funct = match mnemonic { "sllv" => 4, "srlv" => 6, _ => 7 };
            Ok(special_fields(r(args[2])?, r(args[1])?, r(args[0])?, 0, funct))
        }
        _ => {
            expect_args(mnemonic, args, 3)?;
            let funct = match mnemonic {
                "add"  => 0x20,
                "addu" => 0x21,
                "sub"  => 0x22,
                "subu" => 0x23,
                "and"  => 0x24,
                "or"   => 0x25,
                "xor"  => 0x26,
                "nor"  => 0x27,
                "slt"  => 0x2a,
                "sltu" => 0x2b,
                "movz" => 0xa,
                "movn" => 0xb,
                _ => unreachable!("dispatched on mnemonic"),
            };
            Ok(special_fields(r(args[1])?, r(args[2])?, r(args[0])?, 0, funct))
        }
    }
}

fn encode_special2(mnemonic: &str, args: &[u64]) -> Result<u32, EncodeErr> {
    expect_args(mnemonic, args, 2)?;

    let funct = match mnemonic { "clz" => 16, _ => 17 };
    Ok((28 << 26)
        | special_fields(reg_field(mnemonic, args[1])?, 0, reg_field(mnemonic, args[0])?, 0, funct))
}

fn encode_special3(mnemonic: &str, args: &[u64]) -> Result<u32, EncodeErr> {
    expect_args(mnemonic, args, 2)?;

    let shamt = match mnemonic { "seb" => 16, _ => 24 };
    Ok((31 << 26)
        | special_fields(0, reg_field(mnemonic, args[1])?, reg_field(mnemonic, args[0])?, shamt, 32))
}

/// Word offset from this instruction to the absolute target, as the
/// 16-bit branch field.
fn branch_field(mnemonic: &str, target: u64, address: u64) -> Result<u32, EncodeErr> {
    let offset = (target as u32 as i32 as i64) - (address as u32 as i32 as i64);
    if offset % 4 != 0 || !(-(1 << 17)..=(1 << 17) - 4).contains(&offset) {
        return Err(EncodeErr::BranchOutOfRange { mnemonic: mnemonic.to_string(), offset });
    }
    Ok(((offset >> 2) as u32) & 0xffff)
}

fn encode_regimm(mnemonic: &str, args: &[u64], address: u64) -> Result<u32, EncodeErr> {
    expect_args(mnemonic, args, 2)?;

    let rt = match mnemonic { "bltz" => 0, _ => 1 };
    Ok((1 << 26)
        | (reg_field(mnemonic, args[0])? << 21)
        | (rt << 16)
        | branch_field(mnemonic, args[1], address)?)
}

fn encode_branch2(mnemonic: &str, args: &[u64], address: u64) -> Result<u32, EncodeErr> {
    expect_args(mnemonic, args, 3)?;

    let opcode = match mnemonic { "beq" => 4, _ => 5 };
    Ok((opcode << 26)
        | (reg_field(mnemonic, args[0])? << 21)
        | (reg_field(mnemonic, args[1])? << 16)
        | branch_field(mnemonic, args[2], address)?)
}

fn encode_branch1(mnemonic: &str, args: &[u64], address: u64) -> Result<u32, EncodeErr> {
    expect_args(mnemonic, args, 2)?;

    let opcode = match mnemonic { "blez" => 6, _ => 7 };
    Ok((opcode << 26)
        | (reg_field(mnemonic, args[0])? << 21)
        | branch_field(mnemonic, args[1], address)?)
}

fn encode_imm_arithmetic(mnemonic: &str, args: &[u64]) -> Result<u32, EncodeErr> {
    expect_args(mnemonic, args, 3)?;

    let opcode = match mnemonic {
        "addi"  => 8,
        "addiu" => 9,
        "slti"  => 10,
        "sltiu" => 11,
        "andi"  => 12,
        "ori"   => 13,
        _       => 14,
    };

    Ok((opcode << 26)
        | (reg_field(mnemonic, args[1])? << 21)
        | (reg_field(mnemonic, args[0])? << 16)
        | imm16(mnemonic, args[2])?)
}

fn encode_lui(args: &[u64]) -> Result<u32, EncodeErr> {
    expect_args("lui", args, 2)?;

    Ok((15 << 26)
        | (reg_field("lui", args[0])? << 16)
        | imm16("lui", args[1])?)
}

fn encode_jump(mnemonic: &str, args: &[u64]) -> Result<u32, EncodeErr> {
    expect_args(mnemonic, args, 1)?;

    if args[0] % 4 != 0 {
        return Err(EncodeErr::BranchOutOfRange { mnemonic: mnemonic.to_string(), offset: args[0] as i64 });
    }

    let opcode = match mnemonic { "j" => 2, _ => 3 };
    Ok((opcode << 26) | (((args[0] >> 2) as u32) & 0x03ff_ffff))
}

fn encode_mem(mnemonic: &str, args: &[u64]) -> Result<u32, EncodeErr> {
    expect_args(mnemonic, args, 3)?;

    let opcode = match mnemonic {
        "lb"  => 0x20,
        "lh"  => 0x21,
        "lwl" => 0x22,
        "lw"  => 0x23,
        "lbu" => 0x24,
        "lhu" => 0x25,
        "lwr" => 0x26,
        "sb"  => 0x28,
        "sh"  => 0x29,
        _     => 0x2b,
    };

    Ok((opcode << 26)
        | (reg_field(mnemonic, args[1])? << 21)
        | (reg_field(mnemonic, args[0])? << 16)
        | imm16(mnemonic, args[2])?)
}

#[cfg(test)]
mod tests {
    use super::Mips;
    use crate::asm::{AsmErrKind, EncodeErr};
    use crate::sim::{Call, Machine, SYS_BREAK};

    fn assemble(src: &str) -> Vec<u8> {
        Mips::new().assemble_source("test.asm", src).unwrap().0
    }

    fn machine_with(src: &str) -> Mips {
        let mut m = Mips::new();
        let (code, _) = m.assemble_source("test.asm", src).unwrap();
        m.load_program(&code).unwrap();
        m
    }

    fn step(m: &mut Mips) -> Option<Call> {
        m.next_instruction().unwrap()
    }

    fn reg(m: &Mips, name: &str) -> u64 {
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
        let mut m = Mips::new();
        m.set_register(0, 39).unwrap();
        assert_eq!(m.get_register(0), Ok(0));
        m.set_register(33, 7).unwrap();
        assert_eq!(m.get_register(33), Ok(7));
        assert!(m.get_register(34).is_err());
        assert!(m.set_register(34, 0).is_err());
    }

    #[test]
    fn test_register_names() {
        let m = Mips::new();
        assert_eq!(m.register_number("zero"), Ok(0));
        assert_eq!(m.register_number("at"), Ok(1));
        assert_eq!(m.register_number("v0"), Ok(2));
        assert_eq!(m.register_number("a0"), Ok(4));
        assert_eq!(m.register_number("a3"), Ok(7));
        assert_eq!(m.register_number("t0"), Ok(8));
        assert_eq!(m.register_number("t7"), Ok(15));
        assert_eq!(m.register_number("t8"), Ok(24));
        assert_eq!(m.register_number("t9"), Ok(25));
        assert_eq!(m.register_number("s0"), Ok(16));
        assert_eq!(m.register_number("s7"), Ok(23));
        assert_eq!(m.register_number("s8"), Ok(30));
        assert_eq!(m.register_number("fp"), Ok(30));
        assert_eq!(m.register_number("gp"), Ok(28));
        assert_eq!(m.register_number("sp"), Ok(29));
        assert_eq!(m.register_number("ra"), Ok(31));
        assert_eq!(m.register_number("hi"), Ok(32));
        assert_eq!(m.register_number("lo"), Ok(33));
        assert_eq!(m.register_number("x31"), Ok(31));
        assert!(m.register_number("t10").is_err());
        assert!(m.register_number("q0").is_err());
    }

    #[test]
    fn test_encodings() {
        let code = assemble(
            "addi v0, zero, 1\n\
             add t0, t1, t2\n\
             sll t0, t1, 4\n\
             lw t0, sp, 4\n\
             j 16\n\
             syscall\n\
             break\n\
             nop\n\
             lui t0, 0x1234\n",
        );
        assert_eq!(words(&code), vec![
            0x20020001,
            0x012a4020,
            0x00094100,
            0x8fa80004,
            0x08000004,
            0x0000000c,
            0x0000000d,
            0x00000000,
            0x3c081234,
        ]);
    }

    #[test]
    fn test_branch_encoding() {
        // beq t0, t1, +8 at address 0: a displacement of two words.
        let code = assemble("beq t0, t1, 8");
        assert_eq!(words(&code)[0], 0x11090002);

        // Backward branch to self: displacement 0.
        let code = assemble("loop: beq zero, zero, loop");
        assert_eq!(words(&code)[0], 0x10000000);
    }

    #[test]
    fn test_jal_scenario() {
        // jal jumps, the callee returns through ra, and execution
        // continues after the nop.
        let mut m = machine_with(
            "jal target\n\
             nop\n\
             target: addi v0, zero, 1\n\
             jr ra\n",
        );
        step(&mut m);
        assert_eq!(m.current_instruction_address(), 8);
        assert_eq!(reg(&m, "ra"), 4);
        step(&mut m);
        assert_eq!(reg(&m, "v0"), 1);
        step(&mut m);
        assert_eq!(m.current_instruction_address(), 4);
    }

    #[test]
    fn test_jalr() {
        let mut m = machine_with(
            "addi t0, zero, 12\n\
             jalr s0, t0\n\
             nop\n\
             addi t1, zero, 5\n",
        );
        step(&mut m);
        step(&mut m);
        assert_eq!(m.current_instruction_address(), 12);
        assert_eq!(reg(&m, "s0"), 8);
        step(&mut m);
        assert_eq!(reg(&m, "t1"), 5);
    }

    #[test]
    fn test_arithmetic() {
        let mut m = machine_with(
            "addi t0, zero, 6\n\
             addi t1, zero, -2\n\
             add t2, t0, t1\n\
             sub t3, t0, t1\n\
             and t4, t0, t1\n\
             or t5, t0, t1\n\
             xor t6, t0, t1\n\
             nor t7, t0, t1\n\
             slt s0, t1, t0\n\
             sltu s1, t1, t0\n",
        );
        for _ in 0..10 {
            step(&mut m);
        }
        assert_eq!(reg(&m, "t2"), 4);
        assert_eq!(reg(&m, "t3"), 8);
        assert_eq!(reg(&m, "t4"), 6 & 0xFFFF_FFFE);
        assert_eq!(reg(&m, "t5"), 0xFFFF_FFFE);
        assert_eq!(reg(&m, "t6"), 0xFFFF_FFF8);
        assert_eq!(reg(&m, "t7"), 1);
        assert_eq!(reg(&m, "s0"), 1); // -2 < 6 signed
        assert_eq!(reg(&m, "s1"), 0); // 0xFFFFFFFE < 6 unsigned is false
    }

    #[test]
    fn test_shifts() {
        let mut m = machine_with(
            "addi t0, zero, -16\n\
             addi t1, zero, 2\n\
             sll t2, t0, 2\n\
             srl t3, t0, 2\n\
             sra t4, t0, 2\n\
             sllv t5, t0, t1\n\
             srlv t6, t0, t1\n\
             srav t7, t0, t1\n",
        );
        for _ in 0..8 {
            step(&mut m);
        }
        assert_eq!(reg(&m, "t2"), 0xFFFF_FFC0);
        assert_eq!(reg(&m, "t3"), 0x3FFF_FFFC);
        assert_eq!(reg(&m, "t4"), 0xFFFF_FFFC);
        assert_eq!(reg(&m, "t5"), 0xFFFF_FFC0);
        assert_eq!(reg(&m, "t6"), 0x3FFF_FFFC);
        assert_eq!(reg(&m, "t7"), 0xFFFF_FFFC);
    }

    #[test]
    fn test_branches() {
        let mut m = machine_with(
            "addi t0, zero, 1\n\
             beq t0, t0, a\n\
             a: bne t0, t0, a\n\
             addi t1, zero, -1\n\
             bltz t1, b\n\
             b: bgez t1, b\n\
             blez t1, c\n\
             c: bgtz t0, d\n\
             d: break\n",
        );
        step(&mut m); // addi
        step(&mut m); // beq taken
        assert_eq!(m.current_instruction_address(), 8);
        step(&mut m); // bne not taken
        assert_eq!(m.current_instruction_address(), 12);
        step(&mut m); // addi t1
        step(&mut m); // bltz taken
        assert_eq!(m.current_instruction_address(), 20);
        step(&mut m); // bgez not taken
        assert_eq!(m.current_instruction_address(), 24);
        step(&mut m); // blez taken
        assert_eq!(m.current_instruction_address(), 28);
        step(&mut m); // bgtz taken
        assert_eq!(m.current_instruction_address(), 32);
    }

    #[test]
    fn test_lui_ori() {
        let mut m = machine_with("lui t0, 0xdead\nori t0, t0, 0xbeef\n");
        step(&mut m);
        step(&mut m);
        assert_eq!(reg(&m, "t0"), 0xDEAD_BEEF);
    }

    #[test]
    fn test_loads_and_stores() {
        let mut m = machine_with(
            "lui t0, 0x1\n\
             lui t1, 0xaaef\n\
             addi t1, t1, -1\n\
             sw t1, t0, 0\n\
             lw t2, t0, 0\n\
             lb t3, t0, 0\n\
             lbu t4, t0, 0\n\
             lh t5, t0, 0\n\
             lhu t6, t0, 0\n\
             sb t1, t0, 4\n\
             sh t1, t0, 6\n",
        );
        for _ in 0..4 {
            step(&mut m);
        }
        assert_eq!(reg(&m, "t1"), 0xAAEE_FFFF);
        step(&mut m);
        assert_eq!(reg(&m, "t2"), 0xAAEE_FFFF);
        step(&mut m);
        assert_eq!(reg(&m, "t3"), 0xFFFF_FFFF);
        step(&mut m);
        assert_eq!(reg(&m, "t4"), 0xFF);
        step(&mut m);
        assert_eq!(reg(&m, "t5"), 0xFFFF_FFFF);
        step(&mut m);
        assert_eq!(reg(&m, "t6"), 0xFFFF);
        step(&mut m);
        step(&mut m);
        assert_eq!(m.get_memory_chunk(0x10004, 4).unwrap(), [0xFF, 0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn test_negative_load_offset() {
        let mut m = machine_with(
            "addi t0, zero, 0x100\n\
             addi t1, zero, 77\n\
             sb t1, t0, -4\n\
             lbu t2, t0, -4\n",
        );
        for _ in 0..4 {
            step(&mut m);
        }
        assert_eq!(m.get_memory(0xFC), Ok(77));
        assert_eq!(reg(&m, "t2"), 77);
    }

    #[test]
    fn test_lwl_lwr_splice() {
        let mut m = machine_with(
            "addi t0, zero, 0x200\n\
             lui t1, 0x1234\n\
             ori t1, t1, 0x5678\n\
             sw t1, t0, 0\n\
             lui t2, 0xaaaa\n\
             ori t2, t2, 0xbbbb\n\
             lwl t2, t0, 0\n\
             lui t3, 0xaaaa\n\
             ori t3, t3, 0xbbbb\n\
             lwr t3, t0, 0\n",
        );
        for _ in 0..10 {
            step(&mut m);
        }
        // The halfword at 0x200 is 0x5678; lwl replaces the upper half,
        // lwr the lower.
        assert_eq!(reg(&m, "t2"), 0x5678_BBBB);
        assert_eq!(reg(&m, "t3"), 0xAAAA_5678);
    }

    #[test]
    fn test_count_leading() {
        let mut m = machine_with(
            "addi t0, zero, 1\n\
             clz t1, t0\n\
             clo t2, t0\n\
             addi t3, zero, -1\n\
             clo t4, t3\n\
             clz t5, zero\n",
        );
        for _ in 0..6 {
            step(&mut m);
        }
        assert_eq!(reg(&m, "t1"), 31);
        assert_eq!(reg(&m, "t2"), 0);
        assert_eq!(reg(&m, "t4"), 32);
        assert_eq!(reg(&m, "t5"), 32);
    }

    #[test]
    fn test_sign_extension_ops() {
        let mut m = machine_with(
            "addi t0, zero, 0x80\n\
             seb t1, t0\n\
             lui t2, 0x1\n\
             ori t2, t2, 0x8000\n\
             seh t3, t2\n",
        );
        for _ in 0..5 {
            step(&mut m);
        }
        assert_eq!(reg(&m, "t1"), 0xFFFF_FF80);
        assert_eq!(reg(&m, "t3"), 0xFFFF_8000);
    }

    #[test]
    fn test_mult_div() {
        let mut m = machine_with(
            "addi t0, zero, -7\n\
             addi t1, zero, 2\n\
             mult t0, t1\n\
             mfhi t2\n\
             mflo t3\n\
             div t0, t1\n\
             mfhi t4\n\
             mflo t5\n\
             div t0, zero\n",
        );
        for _ in 0..9 {
            step(&mut m);
        }
        // -7 * 2 = -14: HI is the sign extension, LO the low word.
        assert_eq!(reg(&m, "t2"), 0xFFFF_FFFF);
        assert_eq!(reg(&m, "t3"), 0xFFFF_FFF2);
        // -7 / 2 truncates toward zero.
        assert_eq!(reg(&m, "t4") as u32 as i32, -1);
        assert_eq!(reg(&m, "t5") as u32 as i32, -3);
        // A zero divisor clears HI and LO.
        assert_eq!(reg(&m, "hi"), 0);
        assert_eq!(reg(&m, "lo"), 0);
    }

    #[test]
    fn test_mthi_mtlo() {
        let mut m = machine_with(
            "addi t0, zero, 5\n\
             mthi t0\n\
             mtlo t0\n",
        );
        for _ in 0..3 {
            step(&mut m);
        }
        assert_eq!(reg(&m, "hi"), 5);
        assert_eq!(reg(&m, "lo"), 5);
    }

    #[test]
    fn test_conditional_moves() {
        let mut m = machine_with(
            "addi t0, zero, 7\n\
             addi t1, zero, 1\n\
             movz t2, t0, zero\n\
             movz t3, t0, t1\n\
             movn t4, t0, t1\n\
             movn t5, t0, zero\n",
        );
        for _ in 0..6 {
            step(&mut m);
        }
        assert_eq!(reg(&m, "t2"), 7);
        assert_eq!(reg(&m, "t3"), 0);
        assert_eq!(reg(&m, "t4"), 7);
        assert_eq!(reg(&m, "t5"), 0);
    }

    #[test]
    fn test_syscall_routing() {
        let mut m = machine_with("addi v0, zero, 1\nsyscall");
        step(&mut m);
        assert_eq!(step(&mut m).unwrap().number, SYS_BREAK);

        let mut m = machine_with(
            "addi v0, zero, 3\n\
             addi a0, zero, 0x80\n\
             addi a1, zero, 4\n\
             syscall\n\
             addi t0, zero, 1\n",
        );
        for _ in 0..3 {
            step(&mut m);
        }
        assert_eq!(step(&mut m), Some(Call { number: 3, arg1: 0x80, arg2: 4 }));
        assert_eq!(m.current_instruction_address(), 16);
        step(&mut m);
        assert_eq!(reg(&m, "t0"), 1);
    }

    #[test]
    fn test_break() {
        let mut m = machine_with("break");
        assert_eq!(step(&mut m), Some(Call { number: SYS_BREAK, arg1: 0, arg2: 0 }));
        assert_eq!(m.current_instruction_address(), 4);
    }

    #[test]
    fn test_unknown_opcode() {
        let mut m = Mips::new();
        // Opcode 63 is not defined.
        m.load_program(&(63u32 << 26).to_le_bytes()).unwrap();
        assert!(matches!(
            m.next_instruction(),
            Err(crate::sim::StepErr::UnknownOpcode { pc: 0, .. })
        ));
    }

    #[test]
    fn test_encode_errors() {
        let m = Mips::new();

        let err = m.assemble_source("t.asm", "add t0, t1").unwrap_err();
        assert!(matches!(
            err.kind,
            AsmErrKind::Encode(EncodeErr::WrongArgCount { expected: 3, .. })
        ));

        let err = m.assemble_source("t.asm", "frobnicate").unwrap_err();
        assert!(matches!(
            err.kind,
            AsmErrKind::Encode(EncodeErr::UnknownMnemonic(_))
        ));

        let err = m.assemble_source("t.asm", "addi t0, zero, 0x10000").unwrap_err();
        assert!(matches!(
            err.kind,
            AsmErrKind::Encode(EncodeErr::ImmTooLarge { bits: 16, .. })
        ));
    }
}
