//! The REDUX-K backend: REDUX-V's sibling with vector experiments.
//!
//! Same skeleton as [`crate::arch::reduxv`]: four 8-bit registers, 256
//! bytes of memory, one-byte instructions with ra in bits 3:2 and rb in
//! bits 1:0 of the low nibble.
//!
//! The opcode map trades REDUX-V's dedicated syscall opcodes for
//! register tricks and gains three extras:
//! - `ebreak` is `or r0, r0` (byte 0xA0) and `ecall` is `xor r0, r0`
//!   (byte 0xB0); the degenerate encodings surface syscalls instead of
//!   computing a no-op.
//! - `inc` adds a 2-bit immediate to one register, or to all four when
//!   ra is r0.
//! - `loadv` and `addv` run a fixed register/memory update sequence for
//!   `size` iterations, treating r0-r3 as address, stride and
//!   accumulator registers; `addv` stages its loads through two internal
//!   auxiliary registers.

use std::path::Path;

use crate::asm::{
    self, AsmErr, DebugToken, EncodeErr, ResolvedKind, ResolvedToken, TranslateErr,
};
use crate::parse;
use crate::sim::{ArchInfo, Call, Machine, MemErr, RegErr, StepErr, SYS_BREAK};
use crate::sim::mem::FlatMemory;

const MEMORY_SIZE: usize = 256;
const REGISTER_COUNT: u64 = 4;

static REGISTER_NAMES: &[&str] = &["r0", "r1", "r2", "r3"];

/// A REDUX-K machine.
pub struct ReduxK {
    registers: [u8; 4],
    aux_registers: [u8; 2],
    pc: u8,
    mem: FlatMemory,
}

impl ReduxK {
    /// Creates a machine with zeroed registers and memory.
    pub fn new() -> Self {
        ReduxK {
            registers: [0; 4],
            aux_registers: [0; 2],
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
        let imm = instr & 0xf;
        let ra = ((instr >> 2) & 0x3) as usize;
        let rb = (instr & 0x3) as usize;
        let uimm = instr & 0x3;

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
            // ji: unconditional jump by a signed 4-bit displacement.
            0x1 => {
                self.pc = self.pc.wrapping_add(sign_extend4(imm));
                return None;
            }
            0x2 => self.registers[ra] = self.mem.get(rbv as u64).unwrap_or(0),
            0x3 => {
                // rbv is always a valid address in a 256-byte memory.
                let _ = self.mem.set(rbv as u64, rav);
            }
            0x4 => self.registers[0] = r0v.wrapping_add(sign_extend4(imm)),
            // loadv: store r2 through the r0 pointer `imm` times,
            // striding r2 by r3 and r0 by r1.
            0x5 => {
                for _ in 0..imm {
                    let [r0, r1, r2, r3] = self.registers;
                    let _ = self.mem.set(r0 as u64, r2);
                    self.registers[2] = r2.wrapping_add(r3);
                    self.registers[0] = r0.wrapping_add(r1);
                }
            }
            // addv: element-wise add of the r0 and r1 streams into the
            // r2 stream, staged through the auxiliary registers, with
            // every pointer advancing by one per iteration.
            0x6 => {
                for _ in 0..imm {
                    let [r0, r1, r2, _] = self.registers;
                    self.aux_registers[0] = self.mem.get(r0 as u64).unwrap_or(0);
                    self.aux_registers[1] = self.mem.get(r1 as u64).unwrap_or(0);

                    let sum = self.aux_registers[0].wrapping_add(self.aux_registers[1]);
                    self.registers[3] = sum;
                    let _ = self.mem.set(r2 as u64, sum);

                    for reg in &mut self.registers {
                        *reg = reg.wrapping_add(1);
                    }
                }
            }
            // inc: bump one register by the 2-bit immediate, or all four
            // when ra is r0.
            0x7 => match ra {
                0 => {
                    for reg in &mut self.registers {
                        *reg = reg.wrapping_add(uimm);
                    }
                }
                _ => self.registers[ra] = rav.wrapping_add(uimm),
            },
            0x8 => self.registers[ra] = (rbv == 0) as u8,
            0x9 => self.registers[ra] = rav & rbv,
            // or r0, r0 is ebreak.
            0xa => {
                if ra == 0 && rb == 0 {
                    self.pc = self.pc.wrapping_add(1);
                    return Some(Call { number: SYS_BREAK, arg1: 0, arg2: 0 });
                }
                self.registers[ra] = rav | rbv;
            }
            // xor r0, r0 is ecall.
            0xb => {
                if ra == 0 && rb == 0 {
                    self.pc = self.pc.wrapping_add(1);
                    return Some(Call {
                        number: r0v as u64,
                        arg1: self.registers[1] as u64,
                        arg2: self.registers[2] as u64,
                    });
                }
                self.registers[ra] = rav ^ rbv;
            }
            0xc => self.registers[ra] = rav.wrapping_add(rbv),
            0xd => self.registers[ra] = rav.wrapping_sub(rbv),
            0xe => self.registers[ra] = rav.checked_shl(rbv as u32).unwrap_or(0),
            _ => self.registers[ra] = rav.checked_shr(rbv as u32).unwrap_or(0),
        }

        self.pc = self.pc.wrapping_add(1);
        None
    }
}

impl Default for ReduxK {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine for ReduxK {
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
            name: "REDUX-K",
            register_names: REGISTER_NAMES,
            word_width: 8,
        }
    }
}

/// Sign-extends a 4-bit value to 8 bits.
fn sign_extend4(n: u8) -> u8 {
    (((n << 4) as i8) >> 4) as u8
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

/// Translates an argument: register names first, then numbers checked
/// against the 4-bit immediate range.
fn translate_arg(arg: &str) -> Result<u64, TranslateErr> {
    if arg.is_empty() {
        return Err(TranslateErr::Empty);
    }
    if let Some(reg) = register_by_name(arg) {
        return Ok(reg);
    }

    let value = asm::parse_integer(arg)?;
    let signed = value as i64;
    match (-8..=15).contains(&signed) {
        true => Ok(value),
        false => Err(TranslateErr::OutOfRange { text: arg.to_string(), bits: 4 }),
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
                code[at] = encode_instruction(mnemonic, args, token.address)
                    .map_err(|e| AsmErr::encode(e, token.loc.clone()))?;
            }
        }
    }
    Ok(code)
}

fn encode_instruction(mnemonic: &str, args: &[u64], address: u64) -> Result<u8, EncodeErr> {
    match mnemonic {
        "brzr" | "ld" | "st" | "not" | "and" | "or" | "xor" | "add" | "sub" | "slr" | "srr" => {
            let op = match mnemonic {
                "brzr" => 0x0,
                "ld"   => 0x2,
                "st"   => 0x3,
                "not"  => 0x8,
                "and"  => 0x9,
                "or"   => 0xa,
                "xor"  => 0xb,
                "add"  => 0xc,
                "sub"  => 0xd,
                "slr"  => 0xe,
                _      => 0xf,
            };
            encode_rr(mnemonic, op, args)
        }
        "ji" => encode_ji(args, address),
        "addi" => encode_imm("addi", 0x4, args),
        "loadv" => encode_imm("loadv", 0x5, args),
        "addv" => encode_imm("addv", 0x6, args),
        "inc" => encode_inc(args),
        "ebreak" => {
            expect_args(mnemonic, args, 0)?;
            Ok(0xa0)
        }
        "ecall" => {
            expect_args(mnemonic, args, 0)?;
            Ok(0xb0)
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

    // The degenerate or/xor encodings belong to ebreak/ecall.
    if (op == 0xa || op == 0xb) && args[0] == 0 && args[1] == 0 {
        return Err(EncodeErr::BadOperand {
            mnemonic: mnemonic.to_string(),
            operand: "r0, r0".to_string(),
        });
    }

    Ok((op << 4) | (reg_field(mnemonic, args[0])? << 2) | reg_field(mnemonic, args[1])?)
}

fn encode_imm(mnemonic: &str, op: u8, args: &[u64]) -> Result<u8, EncodeErr> {
    expect_args(mnemonic, args, 1)?;
    Ok((op << 4) | (args[0] as u8 & 0xf))
}

/// `ji` takes an absolute target from the resolver and encodes the
/// displacement from this instruction.
fn encode_ji(args: &[u64], address: u64) -> Result<u8, EncodeErr> {
    expect_args("ji", args, 1)?;

    let offset = (args[0] as u8).wrapping_sub(address as u8) as i8;
    if !(-8..=7).contains(&offset) {
        return Err(EncodeErr::BranchOutOfRange { mnemonic: "ji".to_string(), offset: offset as i64 });
    }
    Ok(0x10 | (offset as u8 & 0xf))
}

fn encode_inc(args: &[u64]) -> Result<u8, EncodeErr> {
    expect_args("inc", args, 2)?;

    if args[1] > 3 {
        return Err(EncodeErr::ImmTooLarge { mnemonic: "inc".to_string(), value: args[1] as i64, bits: 2 });
    }
    Ok(0x70 | (reg_field("inc", args[0])? << 2) | args[1] as u8)
}
