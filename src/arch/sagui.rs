//! The Sagui backend: a fantasy 8-bit RISC.
//!
//! Four 8-bit registers, 256 bytes of memory, one-byte instructions. The
//! high nibble is the opcode; the low nibble is either two 2-bit register
//! fields (ra in bits 3:2, rb in bits 1:0) or a 4-bit immediate.
//!
//! `ebreak` is the one extension over the original Sagui: `movr r0, r0`
//! (byte 0x60) surfaces a BREAK. There is no `ecall`.
//!
//! Jump immediates are 4-bit and unsigned, and the assembler does not
//! convert absolute targets to displacements for `ji`/`brzi`; programs
//! compute their jumps by hand.

use std::path::Path;

use crate::asm::{
    self, AsmErr, DebugToken, EncodeErr, ResolvedKind, ResolvedToken, TranslateErr,
};
use crate::parse;
use crate::sim::{ArchInfo, Call, Machine, MemErr, RegErr, StepErr, SYS_BREAK};
use crate::sim::mem::FlatMemory;

const MEMORY_SIZE: usize = 256;
const REGISTER_COUNT: u64 = 4;

/// The `movr r0, r0` encoding that doubles as `ebreak`.
const BREAK_BYTE: u8 = 0x60;

static REGISTER_NAMES: &[&str] = &["r0", "r1", "r2", "r3"];

/// A Sagui machine.
pub struct Sagui {
    registers: [u8; 4],
    pc: u8,
    mem: FlatMemory,
}

impl Sagui {
    /// Creates a machine with zeroed registers and memory.
    pub fn new() -> Self {
        Sagui {
            registers: [0; 4],
            pc: 0,
            mem: FlatMemory::new(MEMORY_SIZE),
        }
    }

    /// Assembles source held in memory. `name` is the file name reported
    /// in errors and debug symbols.
    pub fn assemble_source(&self, name: &str, src: &str) -> Result<(Vec<u8>, Vec<DebugToken>), AsmErr> {
        let tokens = parse::tokenize_source(name, src)?;
        let (resolved, debug) = asm::resolve_tokens_fixed(tokens, 1, translate_arg)?;
        Ok((encode(&resolved)?, debug))
    }

    fn execute(&mut self, instr: u8) -> Option<Call> {
        if instr == BREAK_BYTE {
            self.pc = self.pc.wrapping_add(1);
            return Some(Call { number: SYS_BREAK, arg1: 0, arg2: 0 });
        }

        let imm = instr & 0xf;
        let ra = ((instr >> 2) & 0x3) as usize;
        let rb = (instr & 0x3) as usize;

        let rav = self.registers[ra];
        let rbv = self.registers[rb];
        let r0v = self.registers[0];

        match instr >> 4 {
            // brzr: branch to the address in rb when ra is zero.
            0x0 => {
                self.pc = match rav == 0 {
                    true => rbv,
                    false => self.pc.wrapping_add(1),
                };
                return None;
            }
            // brzi: skip forward by imm when r0 is zero.
            0x1 => {
                self.pc = match r0v == 0 {
                    true => self.pc.wrapping_add(imm),
                    false => self.pc.wrapping_add(1),
                };
                return None;
            }
            // jr / ji
            0x2 => {
                self.pc = rbv;
                return None;
            }
            0x3 => {
                self.pc = self.pc.wrapping_add(imm);
                return None;
            }
            0x4 => self.registers[ra] = self.mem.get(rbv as u64).unwrap_or(0),
            0x5 => {
                // rbv is always a valid address in a 256-byte memory.
                let _ = self.mem.set(rbv as u64, rav);
            }
            0x6 => self.registers[ra] = rbv,
            0x7 => self.registers[0] = (imm << 4) | (r0v & 0x0f),
            0x8 => self.registers[0] = imm | (r0v & 0xf0),
            0x9 => self.registers[ra] = rav.wrapping_add(rbv),
            0xa => self.registers[ra] = rav.wrapping_sub(rbv),
            0xb => self.registers[ra] = rav & rbv,
            0xc => self.registers[ra] = rav | rbv,
            0xd => self.registers[ra] = (rbv == 0) as u8,
            0xe => self.registers[ra] = rav.checked_shl(rbv as u32).unwrap_or(0),
            _ => self.registers[ra] = rav.checked_shr(rbv as u32).unwrap_or(0),
        }

        self.pc = self.pc.wrapping_add(1);
        None
    }
}

impl Default for Sagui {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine for Sagui {
    fn load_program(&mut self, image: &[u8]) -> Result<(), MemErr> {
        self.pc = 0;
        self.mem.set_chunk(0, image)
    }

    fn next_instruction(&mut self) -> Result<Option<Call>, StepErr> {
        let pc = self.pc as u64;
        let instr = self.mem.get(pc).map_err(|_| StepErr::Fetch { pc })?;
        Ok(self.execute(instr))
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
        match reg < REGISTER_COUNT {
            true => {
                self.registers[reg as usize] = value as u8;
                Ok(())
            }
            false => Err(RegErr::BadNumber { reg, count: REGISTER_COUNT }),
        }
    }

    fn register_number(&self, name: &str) -> Result<u64, RegErr> {
        register_by_name(name).ok_or_else(|| RegErr::BadName(name.to_string()))
    }

    fn assemble(&self, path: &Path) -> Result<(Vec<u8>, Vec<DebugToken>), AsmErr> {
        let tokens = parse::tokenize(path)?;
        let (resolved, debug) = asm::resolve_tokens_fixed(tokens, 1, translate_arg)?;
        Ok((encode(&resolved)?, debug))
    }

    fn current_instruction_address(&self) -> u64 {
        self.pc as u64
    }

    fn info(&self) -> ArchInfo {
        ArchInfo {
            name: "Sagui",
            register_names: REGISTER_NAMES,
            word_width: 8,
        }
    }
}

fn register_by_name(name: &str) -> Option<u64> {
    match name {
        "r0" | "0" => Some(0),
        "r1" | "1" => Some(1),
        "r2" | "2" => Some(2),
        "r3" | "3" => Some(3),
        _ => None,
    }
}

fn translate_arg(arg: &str) -> Result<u64, TranslateErr> {
    if arg.is_empty() {
        return Err(TranslateErr::Empty);
    }
    match register_by_name(arg) {
        Some(reg) => Ok(reg),
        None => asm::parse_integer(arg),
    }
}

//
// Encoding.
//

fn encode(tokens: &[ResolvedToken]) -> Result<Vec<u8>, AsmErr> {
    let size: u64 = tokens.iter().map(|t| match &t.kind {
        ResolvedKind::Instruction { .. } => 1,
        ResolvedKind::Literal(bytes) => bytes.len() as u64,
    }).sum();

    let mut code = vec![0u8; size as usize];
    for token in tokens {
        let at = token.address as usize;
        match &token.kind {
            ResolvedKind::Literal(bytes) => code[at..at + bytes.len()].copy_from_slice(bytes),
            ResolvedKind::Instruction { mnemonic, args } => {
                code[at] = encode_instruction(mnemonic, args)
                    .map_err(|e| AsmErr::encode(e, token.loc.clone()))?;
            }
        }
    }
    Ok(code)
}

fn encode_instruction(mnemonic: &str, args: &[u64]) -> Result<u8, EncodeErr> {
    match mnemonic {
        "brzr" | "ld" | "st" | "movr" | "add" | "sub" | "and" | "or" | "not" | "slr" | "srr" => {
            let op = match mnemonic {
                "brzr" => 0x0,
                "ld"   => 0x4,
                "st"   => 0x5,
                "movr" => 0x6,
                "add"  => 0x9,
                "sub"  => 0xa,
                "and"  => 0xb,
                "or"   => 0xc,
                "not"  => 0xd,
                "slr"  => 0xe,
                _      => 0xf,
            };
            encode_rr(mnemonic, op, args)
        }
        "brzi" | "ji" | "movh" | "movl" => {
            let op = match mnemonic {
                "brzi" => 0x1,
                "ji"   => 0x3,
                "movh" => 0x7,
                _      => 0x8,
            };
            encode_imm(mnemonic, op, args)
        }
        "jr" => {
            // The target register sits in the rb field.
            expect_args(mnemonic, args, 1)?;
            Ok(0x20 | reg_field(mnemonic, args[0])?)
        }
        "ebreak" => {
            expect_args(mnemonic, args, 0)?;
            Ok(BREAK_BYTE)
        }
        _ => Err(EncodeErr::UnknownMnemonic(mnemonic.to_string())),
    }
}

fn expect_args(mnemonic: &str, args: &[u64], expected: usize) -> Result<(), EncodeErr> {
    match args.len() == expected {
        true => Ok(()),
        false => Err(EncodeErr::WrongArgCount { mnemonic: mnemonic.to_string(), expected }),
    }
}

fn reg_field(mnemonic: &str, value: u64) -> Result<u8, EncodeErr> {
    match value < 4 {
        true => Ok(value as u8),
        false => Err(EncodeErr::BadOperand {
            mnemonic: mnemonic.to_string(),
            operand: value.to_string(),
        }),
    }
}

fn encode_rr(mnemonic: &str, op: u8, args: &[u64]) -> Result<u8, EncodeErr> {
    expect_args(mnemonic, args, 2)?;
    Ok((op << 4) | (reg_field(mnemonic, args[0])? << 2) | reg_field(mnemonic, args[1])?)
}

fn encode_imm(mnemonic: &str, op: u8, args: &[u64]) -> Result<u8, EncodeErr> {
    expect_args(mnemonic, args, 1)?;
    if args[0] > 0xf {
        return Err(EncodeErr::ImmTooLarge {
            mnemonic: mnemonic.to_string(),
            value: args[0] as i64,
            bits: 4,
        });
    }
    Ok((op << 4) | args[0] as u8)
}
