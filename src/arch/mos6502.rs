//! The MOS 6502 backend.
//!
//! 16-bit address space, 8-bit data, the five visible registers A, P, S,
//! X and Y (numbered 0 to 4 for the capability surface) and a 16-bit PC.
//! The full documented instruction set is implemented over the standard
//! addressing modes; decimal mode is the one deliberate gap: the D flag
//! can be set and cleared but never alters ADC/SBC arithmetic.
//!
//! Programs load at [`TEXT_PAGE`] (0x8000), following the convention
//! that the upper half of the address space is ROM and the reset vector
//! points into it. The stack lives in page 1 and grows downward from
//! 0x1FF.
//!
//! `brk` is the syscall mechanism: the call number travels in X, and for
//! non-BREAK calls the two arguments are read little-endian from the
//! four bytes just above the stack pointer.
//!
//! The assembler resolves each instruction's addressing mode in the
//! first pass (choosing zero page over absolute when a numeric operand
//! fits in a byte; label operands assume absolute) and carries it to the
//! encoder in the resolved token's reserved slot.

use std::path::Path;

use crate::asm::{
    self, AsmErr, AsmErrKind, DebugToken, EncodeErr, Instruction, ResolvedKind,
    ResolvedToken, TranslateErr,
};
use crate::parse;
use crate::sim::{ArchInfo, Call, Machine, MemErr, RegErr, StepErr, SYS_BREAK};
use crate::sim::mem::FlatMemory;

/// The address programs are loaded and started at.
pub const TEXT_PAGE: u16 = 0x8000;
/// The base of the stack page; the stack grows down within it.
pub const STACK_PAGE: u16 = 0x0100;

const MEMORY_SIZE: usize = 1 << 16;
const REGISTER_COUNT: u64 = 5;

const FLAG_N: u8 = 1 << 7;
const FLAG_V: u8 = 1 << 6;
const FLAG_B: u8 = 1 << 4;
/// Decimal mode: storable, never honored by the arithmetic.
const FLAG_D: u8 = 1 << 3;
const FLAG_I: u8 = 1 << 2;
const FLAG_Z: u8 = 1 << 1;
const FLAG_C: u8 = 1 << 0;

static REGISTER_NAMES: &[&str] = &["A", "P", "S", "X", "Y"];

/// A MOS 6502 machine.
pub struct Mos6502 {
    a: u8,
    p: u8,
    s: u8,
    x: u8,
    y: u8,
    pc: u16,
    mem: FlatMemory,
}

/// The addressing modes of the 6502, as resolved by the assembler's
/// first pass and dispatched on by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrMode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    /// `(zp,x)`
    IndexedIndirect,
    /// `(zp),y`
    IndirectIndexed,
    /// `(abs)`, for jmp only.
    Indirect,
    Relative,
}

impl AddrMode {
    /// Total instruction length in bytes for this mode.
    fn length(self) -> u64 {
        match self {
            Self::Implied | Self::Accumulator => 1,
            Self::Absolute | Self::AbsoluteX | Self::AbsoluteY | Self::Indirect => 3,
            _ => 2,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::Implied         => "implied",
            Self::Accumulator     => "accumulator",
            Self::Immediate       => "immediate",
            Self::ZeroPage        => "zero page",
            Self::ZeroPageX       => "zero page indexed by x",
            Self::ZeroPageY       => "zero page indexed by y",
            Self::Absolute        => "absolute",
            Self::AbsoluteX       => "absolute indexed by x",
            Self::AbsoluteY       => "absolute indexed by y",
            Self::IndexedIndirect => "indexed indirect",
            Self::IndirectIndexed => "indirect indexed",
            Self::Indirect        => "indirect",
            Self::Relative        => "relative",
        }
    }
}

// The reserved slot carries the addressing mode from the first assembler
// pass to the encoder.
impl From<AddrMode> for u64 {
    fn from(mode: AddrMode) -> u64 {
        mode as u64
    }
}

impl TryFrom<u64> for AddrMode {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, ()> {
        const MODES: [AddrMode; 13] = [
            AddrMode::Implied, AddrMode::Accumulator, AddrMode::Immediate,
            AddrMode::ZeroPage, AddrMode::ZeroPageX, AddrMode::ZeroPageY,
            AddrMode::Absolute, AddrMode::AbsoluteX, AddrMode::AbsoluteY,
            AddrMode::IndexedIndirect, AddrMode::IndirectIndexed,
            AddrMode::Indirect, AddrMode::Relative,
        ];
        MODES.get(value as usize).copied().ok_or(())
    }
}

/// The 6502 operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
enum Op {
    ADC, AND, ASL, BCC, BCS, BEQ, BIT, BMI, BNE, BPL, BRK, BVC, BVS,
    CLC, CLD, CLI, CLV, CMP, CPX, CPY, DEC, DEX, DEY, EOR, INC, INX,
    INY, JMP, JSR, LDA, LDX, LDY, LSR, NOP, ORA, PHA, PHP, PLA, PLP,
    ROL, ROR, RTI, RTS, SBC, SEC, SED, SEI, STA, STX, STY, TAX, TAY,
    TSX, TXA, TXS, TYA,
}

impl Op {
    fn from_mnemonic(mnemonic: &str) -> Option<Op> {
        Some(match mnemonic {
            "adc" => Op::ADC, "and" => Op::AND, "asl" => Op::ASL,
            "bcc" => Op::BCC, "bcs" => Op::BCS, "beq" => Op::BEQ,
            "bit" => Op::BIT, "bmi" => Op::BMI, "bne" => Op::BNE,
            "bpl" => Op::BPL, "brk" => Op::BRK, "bvc" => Op::BVC,
            "bvs" => Op::BVS, "clc" => Op::CLC, "cld" => Op::CLD,
            "cli" => Op::CLI, "clv" => Op::CLV, "cmp" => Op::CMP,
            "cpx" => Op::CPX, "cpy" => Op::CPY, "dec" => Op::DEC,
            "dex" => Op::DEX, "dey" => Op::DEY, "eor" => Op::EOR,
            "inc" => Op::INC, "inx" => Op::INX, "iny" => Op::INY,
            "jmp" => Op::JMP, "jsr" => Op::JSR, "lda" => Op::LDA,
            "ldx" => Op::LDX, "ldy" => Op::LDY, "lsr" => Op::LSR,
            "nop" => Op::NOP, "ora" => Op::ORA, "pha" => Op::PHA,
            "php" => Op::PHP, "pla" => Op::PLA, "plp" => Op::PLP,
            "rol" => Op::ROL, "ror" => Op::ROR, "rti" => Op::RTI,
            "rts" => Op::RTS, "sbc" => Op::SBC, "sec" => Op::SEC,
            "sed" => Op::SED, "sei" => Op::SEI, "sta" => Op::STA,
            "stx" => Op::STX, "sty" => Op::STY, "tax" => Op::TAX,
            "tay" => Op::TAY, "tsx" => Op::TSX, "txa" => Op::TXA,
            "txs" => Op::TXS, "tya" => Op::TYA,
            _ => return None,
        })
    }
}

/// The documented opcode matrix: one row per (opcode byte, operation,
/// addressing mode).
#[rustfmt::skip]
static OPCODES: &[(u8, Op, AddrMode)] = &[
    (0x69, Op::ADC, AddrMode::Immediate),
    (0x65, Op::ADC, AddrMode::ZeroPage),
    (0x75, Op::ADC, AddrMode::ZeroPageX),
    (0x6D, Op::ADC, AddrMode::Absolute),
    (0x7D, Op::ADC, AddrMode::AbsoluteX),
    (0x79, Op::ADC, AddrMode::AbsoluteY),
    (0x61, Op::ADC, AddrMode::IndexedIndirect),
    (0x71, Op::ADC, AddrMode::IndirectIndexed),
    (0x29, Op::AND, AddrMode::Immediate),
    (0x25, Op::AND, AddrMode::ZeroPage),
    (0x35, Op::AND, AddrMode::ZeroPageX),
    (0x2D, Op::AND, AddrMode::Absolute),
    (0x3D, Op::AND, AddrMode::AbsoluteX),
    (0x39, Op::AND, AddrMode::AbsoluteY),
    (0x21, Op::AND, AddrMode::IndexedIndirect),
    (0x31, Op::AND, AddrMode::IndirectIndexed),
    (0x0A, Op::ASL, AddrMode::Accumulator),
    (0x06, Op::ASL, AddrMode::ZeroPage),
    (0x16, Op::ASL, AddrMode::ZeroPageX),
    (0x0E, Op::ASL, AddrMode::Absolute),
    (0x1E, Op::ASL, AddrMode::AbsoluteX),
    (0x90, Op::BCC, AddrMode::Relative),
    (0xB0, Op::BCS, AddrMode::Relative),
    (0xF0, Op::BEQ, AddrMode::Relative),
    (0x24, Op::BIT, AddrMode::ZeroPage),
    (0x2C, Op::BIT, AddrMode::Absolute),
    (0x30, Op::BMI, AddrMode::Relative),
    (0xD0, Op::BNE, AddrMode::Relative),
    (0x10, Op::BPL, AddrMode::Relative),
    (0x00, Op::BRK, AddrMode::Implied),
    (0x50, Op::BVC, AddrMode::Relative),
    (0x70, Op::BVS, AddrMode::Relative),
    (0x18, Op::CLC, AddrMode::Implied),
    (0xD8, Op::CLD, AddrMode::Implied),
    (0x58, Op::CLI, AddrMode::Implied),
    (0xB8, Op::CLV, AddrMode::Implied),
    (0xC9, Op::CMP, AddrMode::Immediate),
    (0xC5, Op::CMP, AddrMode::ZeroPage),
    (0xD5, Op::CMP, AddrMode::ZeroPageX),
    (0xCD, Op::CMP, AddrMode::Absolute),
    (0xDD, Op::CMP, AddrMode::AbsoluteX),
    (0xD9, Op::CMP, AddrMode::AbsoluteY),
    (0xC1, Op::CMP, AddrMode::IndexedIndirect),
    (0xD1, Op::CMP, AddrMode::IndirectIndexed),
    (0xE0, Op::CPX, AddrMode::Immediate),
    (0xE4, Op::CPX, AddrMode::ZeroPage),
    (0xEC, Op::CPX, AddrMode::Absolute),
    (0xC0, Op::CPY, AddrMode::Immediate),
    (0xC4, Op::CPY, AddrMode::ZeroPage),
    (0xCC, Op::CPY, AddrMode::Absolute),
    (0xC6, Op::DEC, AddrMode::ZeroPage),
    (0xD6, Op::DEC, AddrMode::ZeroPageX),
    (0xCE, Op::DEC, AddrMode::Absolute),
    (0xDE, Op::DEC, AddrMode::AbsoluteX),
    (0xCA, Op::DEX, AddrMode::Implied),
    (0x88, Op::DEY, AddrMode::Implied),
    (0x49, Op::EOR, AddrMode::Immediate),
    (0x45, Op::EOR, AddrMode::ZeroPage),
    (0x55, Op::EOR, AddrMode::ZeroPageX),
    (0x4D, Op::EOR, AddrMode::Absolute),
    (0x5D, Op::EOR, AddrMode::AbsoluteX),
    (0x59, Op::EOR, AddrMode::AbsoluteY),
    (0x41, Op::EOR, AddrMode::IndexedIndirect),
    (0x51, Op::EOR, AddrMode::IndirectIndexed),
    (0xE6, Op::INC, AddrMode::ZeroPage),
    (0xF6, Op::INC, AddrMode::ZeroPageX),
    (0xEE, Op::INC, AddrMode::Absolute),
    (0xFE, Op::INC, AddrMode::AbsoluteX),
    (0xE8, Op::INX, AddrMode::Implied),
    (0xC8, Op::INY, AddrMode::Implied),
    (0x4C, Op::JMP, AddrMode::Absolute),
    (0x6C, Op::JMP, AddrMode::Indirect),
    (0x20, Op::JSR, AddrMode::Absolute),
    (0xA9, Op::LDA, AddrMode::Immediate),
    (0xA5, Op::LDA, AddrMode::ZeroPage),
    (0xB5, Op::LDA, AddrMode::ZeroPageX),
    (0xAD, Op::LDA, AddrMode::Absolute),
    (0xBD, Op::LDA, AddrMode::AbsoluteX),
    (0xB9, Op::LDA, AddrMode::AbsoluteY),
    (0xA1, Op::LDA, AddrMode::IndexedIndirect),
    (0xB1, Op::LDA, AddrMode::IndirectIndexed),
    (0xA2, Op::LDX, AddrMode::Immediate),
    (0xA6, Op::LDX, AddrMode::ZeroPage),
    (0xB6, Op::LDX, AddrMode::ZeroPageY),
    (0xAE, Op::LDX, AddrMode::Absolute),
    (0xBE, Op::LDX, AddrMode::AbsoluteY),
    (0xA0, Op::LDY, AddrMode::Immediate),
    (0xA4, Op::LDY, AddrMode::ZeroPage),
    (0xB4, Op::LDY, AddrMode::ZeroPageX),
    (0xAC, Op::LDY, AddrMode::Absolute),
    (0xBC, Op::LDY, AddrMode::AbsoluteX),
    (0x4A, Op::LSR, AddrMode::Accumulator),
    (0x46, Op::LSR, AddrMode::ZeroPage),
    (0x56, Op::LSR, AddrMode::ZeroPageX),
    (0x4E, Op::LSR, AddrMode::Absolute),
    (0x5E, Op::LSR, AddrMode::AbsoluteX),
    (0xEA, Op::NOP, AddrMode::Implied),
    (0x09, Op::ORA, AddrMode::Immediate),
    (0x05, Op::ORA, AddrMode::ZeroPage),
    (0x15, Op::ORA, AddrMode::ZeroPageX),
    (0x0D, Op::ORA, AddrMode::Absolute),
    (0x1D, Op::ORA, AddrMode::AbsoluteX),
    (0x19, Op::ORA, AddrMode::AbsoluteY),
    (0x01, Op::ORA, AddrMode::IndexedIndirect),
    (0x11, Op::ORA, AddrMode::IndirectIndexed),
    (0x48, Op::PHA, AddrMode::Implied),
    (0x08, Op::PHP, AddrMode::Implied),
    (0x68, Op::PLA, AddrMode::Implied),
    (0x28, Op::PLP, AddrMode::Implied),
    (0x2A, Op::ROL, AddrMode::Accumulator),
    (0x26, Op::ROL, AddrMode::ZeroPage),
    (0x36, Op::ROL, AddrMode::ZeroPageX),
    (0x2E, Op::ROL, AddrMode::Absolute),
    (0x3E, Op::ROL, AddrMode::AbsoluteX),
    (0x6A, Op::ROR, AddrMode::Accumulator),
    (0x66, Op::ROR, AddrMode::ZeroPage),
    (0x76, Op::ROR, AddrMode::ZeroPageX),
    (0x6E, Op::ROR, AddrMode::Absolute),
    (0x7E, Op::ROR, AddrMode::AbsoluteX),
    (0x40, Op::RTI, AddrMode::Implied),
    (0x60, Op::RTS, AddrMode::Implied),
    (0xE9, Op::SBC, AddrMode::Immediate),
    (0xE5, Op::SBC, AddrMode::ZeroPage),
    (0xF5, Op::SBC, AddrMode::ZeroPageX),
    (0xED, Op::SBC, AddrMode::Absolute),
    (0xFD, Op::SBC, AddrMode::AbsoluteX),
    (0xF9, Op::SBC, AddrMode::AbsoluteY),
    (0xE1, Op::SBC, AddrMode::IndexedIndirect),
    (0xF1, Op::SBC, AddrMode::IndirectIndexed),
    (0x38, Op::SEC, AddrMode::Implied),
    (0xF8, Op::SED, AddrMode::Implied),
    (0x78, Op::SEI, AddrMode::Implied),
    (0x85, Op::STA, AddrMode::ZeroPage),
    (0x95, Op::STA, AddrMode::ZeroPageX),
    (0x8D, Op::STA, AddrMode::Absolute),
    (0x9D, Op::STA, AddrMode::AbsoluteX),
    (0x99, Op::STA, AddrMode::AbsoluteY),
    (0x81, Op::STA, AddrMode::IndexedIndirect),
    (0x91, Op::STA, AddrMode::IndirectIndexed),
    (0x86, Op::STX, AddrMode::ZeroPage),
    (0x96, Op::STX, AddrMode::ZeroPageY),
    (0x8E, Op::STX, AddrMode::Absolute),
    (0x84, Op::STY, AddrMode::ZeroPage),
    (0x94, Op::STY, AddrMode::ZeroPageX),
    (0x8C, Op::STY, AddrMode::Absolute),
    (0xAA, Op::TAX, AddrMode::Implied),
    (0xA8, Op::TAY, AddrMode::Implied),
    (0xBA, Op::TSX, AddrMode::Implied),
    (0x8A, Op::TXA, AddrMode::Implied),
    (0x9A, Op::TXS, AddrMode::Implied),
    (0x98, Op::TYA, AddrMode::Implied),
];

fn decode(byte: u8) -> Option<(Op, AddrMode)> {
    OPCODES.iter()
        .find(|&&(code, _, _)| code == byte)
        .map(|&(_, op, mode)| (op, mode))
}

fn opcode_for(op: Op, mode: AddrMode) -> Option<u8> {
    OPCODES.iter()
        .find(|&&(_, o, m)| o == op && m == mode)
        .map(|&(code, _, _)| code)
}

/// Where an instruction's operand lives.
enum Operand {
    None,
    Accumulator,
    Immediate(u8),
    Address(u16),
}

impl Mos6502 {
    /// Creates a machine with zeroed registers and memory.
    pub fn new() -> Self {
        Mos6502 {
            a: 0,
            p: 0,
            s: 0xff,
            x: 0,
            y: 0,
            pc: 0,
            mem: FlatMemory::new(MEMORY_SIZE),
        }
    }

    /// Assembles source held in memory. `name` is the file name reported
    /// in errors and debug symbols.
    pub fn assemble_source(&self, name: &str, src: &str) -> Result<(Vec<u8>, Vec<DebugToken>), AsmErr> {
        let tokens = parse::tokenize_source(name, src)?;
        let (resolved, debug) =
            asm::resolve_tokens_at(tokens, TEXT_PAGE as u64, process, translate_arg)?;
        Ok((encode(&resolved)?, debug))
    }

    /// Every u16 address is valid in a 64 KiB memory, so raw accesses
    /// cannot fail.
    fn read(&self, addr: u16) -> u8 {
        self.mem.get(addr as u64).unwrap_or(0)
    }

    fn write(&mut self, addr: u16, byte: u8) {
        let _ = self.mem.set(addr as u64, byte);
    }

    fn read_word(&self, addr: u16) -> u16 {
        u16::from(self.read(addr)) | (u16::from(self.read(addr.wrapping_add(1))) << 8)
    }

    fn flag(&self, flag: u8) -> bool {
        self.p & flag != 0
    }

    fn set_flag(&mut self, flag: u8, on: bool) {
        match on {
            true => self.p |= flag,
            false => self.p &= !flag,
        }
    }

    fn set_nz(&mut self, value: u8) {
        self.set_flag(FLAG_Z, value == 0);
        self.set_flag(FLAG_N, value & 0x80 != 0);
    }

    fn push(&mut self, byte: u8) {
        self.write(STACK_PAGE | u16::from(self.s), byte);
        self.s = self.s.wrapping_sub(1);
    }

    fn pull(&mut self) -> u8 {
        self.s = self.s.wrapping_add(1);
        self.read(STACK_PAGE | u16::from(self.s))
    }

    /// Resolves the operand for `mode`, with the PC at the opcode byte.
    fn fetch_operand(&self, mode: AddrMode) -> Operand {
        let pc = self.pc;
        match mode {
            AddrMode::Implied => Operand::None,
            AddrMode::Accumulator => Operand::Accumulator,
            AddrMode::Immediate => Operand::Immediate(self.read(pc.wrapping_add(1))),
            AddrMode::ZeroPage => Operand::Address(self.read(pc.wrapping_add(1)) as u16),
            AddrMode::ZeroPageX => {
                Operand::Address(self.read(pc.wrapping_add(1)).wrapping_add(self.x) as u16)
            }
            AddrMode::ZeroPageY => {
                Operand::Address(self.read(pc.wrapping_add(1)).wrapping_add(self.y) as u16)
            }
            AddrMode::Absolute => Operand::Address(self.read_word(pc.wrapping_add(1))),
            AddrMode::AbsoluteX => {
                Operand::Address(self.read_word(pc.wrapping_add(1)).wrapping_add(self.x as u16))
            }
            AddrMode::AbsoluteY => {
                Operand::Address(self.read_word(pc.wrapping_add(1)).wrapping_add(self.y as u16))
            }
            AddrMode::IndexedIndirect => {
                let zp = self.read(pc.wrapping_add(1)).wrapping_add(self.x);
                let lo = self.read(zp as u16);
                let hi = self.read(zp.wrapping_add(1) as u16);
                Operand::Address(u16::from(lo) | (u16::from(hi) << 8))
            }
            AddrMode::IndirectIndexed => {
                let zp = self.read(pc.wrapping_add(1));
                let lo = self.read(zp as u16);
                let hi = self.read(zp.wrapping_add(1) as u16);
                let base = u16::from(lo) | (u16::from(hi) << 8);
                Operand::Address(base.wrapping_add(self.y as u16))
            }
            AddrMode::Indirect => {
                let ptr = self.read_word(pc.wrapping_add(1));
                Operand::Address(self.read_word(ptr))
            }
            AddrMode::Relative => {
                let disp = self.read(pc.wrapping_add(1)) as i8;
                Operand::Address(pc.wrapping_add(2).wrapping_add(disp as i16 as u16))
            }
        }
    }

    fn operand_value(&self, operand: &Operand) -> u8 {
        match operand {
            Operand::None => 0,
            Operand::Accumulator => self.a,
            Operand::Immediate(value) => *value,
            Operand::Address(addr) => self.read(*addr),
        }
    }

    /// Applies a read-modify-write operation to the accumulator or to
    /// memory.
    fn modify(&mut self, operand: &Operand, f: impl FnOnce(&mut Self, u8) -> u8) {
        match operand {
            Operand::Accumulator => {
                let r = f(self, self.a);
                self.a = r;
            }
            Operand::Address(addr) => {
                let addr = *addr;
                let value = self.read(addr);
                let r = f(self, value);
                self.write(addr, r);
            }
            _ => {}
        }
    }

    fn adc(&mut self, value: u8) {
        let carry = self.flag(FLAG_C) as u16;
        let sum = u16::from(self.a) + u16::from(value) + carry;
        let result = sum as u8;

        self.set_flag(FLAG_C, sum > 0xff);
        self.set_flag(FLAG_V, (!(self.a ^ value) & (self.a ^ result) & 0x80) != 0);
        self.a = result;
        self.set_nz(result);
    }

    fn compare(&mut self, reg: u8, value: u8) {
        self.set_flag(FLAG_C, reg >= value);
        self.set_nz(reg.wrapping_sub(value));
    }

    fn branch(&mut self, taken: bool, target: u16) {
        self.pc = match taken {
            true => target,
            false => self.pc.wrapping_add(2),
        };
    }

    /// Surfaces a syscall for `brk`: the number travels in X, and the
    /// arguments sit little-endian in the four bytes just above the
    /// stack pointer (arg2 on top).
    fn exec_brk(&mut self) -> Call {
        self.pc = self.pc.wrapping_add(1);

        let number = self.x as u64;
        if number == SYS_BREAK {
            return Call { number, arg1: 0, arg2: 0 };
        }

        let byte = |i: u8| self.read(STACK_PAGE | u16::from(self.s.wrapping_add(i))) as u64;
        Call {
            number,
            arg1: byte(3) | (byte(4) << 8),
            arg2: byte(1) | (byte(2) << 8),
        }
    }

    fn execute(&mut self, op: Op, mode: AddrMode) -> Option<Call> {
        let operand = self.fetch_operand(mode);
        let next = self.pc.wrapping_add(mode.length() as u16);

        match op {
            Op::BRK => return Some(self.exec_brk()),

            Op::LDA => {
                self.a = self.operand_value(&operand);
                self.set_nz(self.a);
            }
            Op::LDX => {
                self.x = self.operand_value(&operand);
                self.set_nz(self.x);
            }
            Op::LDY => {
                self.y = self.operand_value(&operand);
                self.set_nz(self.y);
            }
            Op::STA | Op::STX | Op::STY => {
                if let Operand::Address(addr) = operand {
                    let value = match op {
                        Op::STA => self.a,
                        Op::STX => self.x,
                        _ => self.y,
                    };
                    self.write(addr, value);
                }
            }

            Op::TAX => { self.x = self.a; self.set_nz(self.x); }
            Op::TAY => { self.y = self.a; self.set_nz(self.y); }
            Op::TXA => { self.a = self.x; self.set_nz(self.a); }
            Op::TYA => { self.a = self.y; self.set_nz(self.a); }
            Op::TSX => { self.x = self.s; self.set_nz(self.x); }
            Op::TXS => self.s = self.x,

            Op::PHA => self.push(self.a),
            Op::PHP => self.push(self.p | FLAG_B),
            Op::PLA => {
                self.a = self.pull();
                self.set_nz(self.a);
            }
            Op::PLP => self.p = self.pull(),

            Op::AND => {
                self.a &= self.operand_value(&operand);
                self.set_nz(self.a);
            }
            Op::ORA => {
                self.a |= self.operand_value(&operand);
                self.set_nz(self.a);
            }
            Op::EOR => {
                self.a ^= self.operand_value(&operand);
                self.set_nz(self.a);
            }
            Op::BIT => {
                let value = self.operand_value(&operand);
                self.set_flag(FLAG_Z, self.a & value == 0);
                self.set_flag(FLAG_N, value & FLAG_N != 0);
                self.set_flag(FLAG_V, value & FLAG_V != 0);
            }

            Op::ADC => self.adc(self.operand_value(&operand)),
            Op::SBC => self.adc(self.operand_value(&operand) ^ 0xff),

            Op::CMP => self.compare(self.a, self.operand_value(&operand)),
            Op::CPX => self.compare(self.x, self.operand_value(&operand)),
            Op::CPY => self.compare(self.y, self.operand_value(&operand)),

            Op::INC => self.modify(&operand, |m, v| {
                let r = v.wrapping_add(1);
                m.set_nz(r);
                r
            }),
            Op::DEC => self.modify(&operand, |m, v| {
                let r = v.wrapping_sub(1);
                m.set_nz(r);
                r
            }),
            Op::INX => { self.x = self.x.wrapping_add(1); self.set_nz(self.x); }
            Op::INY => { self.y = self.y.wrapping_add(1); self.set_nz(self.y); }
            Op::DEX => { self.x = self.x.wrapping_sub(1); self.set_nz(self.x); }
            Op::DEY => { self.y = self.y.wrapping_sub(1); self.set_nz(self.y); }

            Op::ASL => self.modify(&operand, |m, v| {
                m.set_flag(FLAG_C, v & 0x80 != 0);
                let r = v << 1;
                m.set_nz(r);
                r
            }),
            Op::LSR => self.modify(&operand, |m, v| {
                m.set_flag(FLAG_C, v & 1 != 0);
                let r = v >> 1;
                m.set_nz(r);
                r
            }),
            Op::ROL => self.modify(&operand, |m, v| {
                let carry = m.flag(FLAG_C) as u8;
                m.set_flag(FLAG_C, v & 0x80 != 0);
                let r = (v << 1) | carry;
                m.set_nz(r);
                r
            }),
            Op::ROR => self.modify(&operand, |m, v| {
                let carry = m.flag(FLAG_C) as u8;
                m.set_flag(FLAG_C, v & 1 != 0);
                let r = (v >> 1) | (carry << 7);
                m.set_nz(r);
                r
            }),

            Op::JMP => {
                if let Operand::Address(addr) = operand {
                    self.pc = addr;
                }
                return None;
            }
            Op::JSR => {
                if let Operand::Address(addr) = operand {
                    // Push the address of the instruction's last byte;
                    // rts adds one.
                    let ret = self.pc.wrapping_add(2);
                    self.push((ret >> 8) as u8);
                    self.push(ret as u8);
                    self.pc = addr;
                }
                return None;
            }
            Op::RTS => {
                let lo = self.pull();
                let hi = self.pull();
                self.pc = (u16::from(lo) | (u16::from(hi) << 8)).wrapping_add(1);
                return None;
            }
            Op::RTI => {
                self.p = self.pull();
                let lo = self.pull();
                let hi = self.pull();
                self.pc = u16::from(lo) | (u16::from(hi) << 8);
                return None;
            }

            Op::BPL | Op::BMI | Op::BVC | Op::BVS | Op::BCC | Op::BCS | Op::BNE | Op::BEQ => {
                if let Operand::Address(target) = operand {
                    let taken = match op {
                        Op::BPL => !self.flag(FLAG_N),
                        Op::BMI => self.flag(FLAG_N),
                        Op::BVC => !self.flag(FLAG_V),
                        Op::BVS => self.flag(FLAG_V),
                        Op::BCC => !self.flag(FLAG_C),
                        Op::BCS => self.flag(FLAG_C),
                        Op::BNE => !self.flag(FLAG_Z),
                        _ => self.flag(FLAG_Z),
                    };
                    self.branch(taken, target);
                }
                return None;
            }

            Op::CLC => self.set_flag(FLAG_C, false),
            Op::SEC => self.set_flag(FLAG_C, true),
            Op::CLI => self.set_flag(FLAG_I, false),
            Op::SEI => self.set_flag(FLAG_I, true),
            Op::CLV => self.set_flag(FLAG_V, false),
            Op::CLD => self.set_flag(FLAG_D, false),
            Op::SED => self.set_flag(FLAG_D, true),

            Op::NOP => {}
        }

        self.pc = next;
        None
    }
}

impl Default for Mos6502 {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine for Mos6502 {
    fn load_program(&mut self, image: &[u8]) -> Result<(), MemErr> {
        self.pc = TEXT_PAGE;
        self.s = 0xff;
        self.mem.set_chunk(TEXT_PAGE as u64, image)
    }

    fn next_instruction(&mut self) -> Result<Option<Call>, StepErr> {
        let pc = self.pc as u64;
        let byte = self.mem.get(pc).map_err(|_| StepErr::Fetch { pc })?;
        let (op, mode) = decode(byte)
            .ok_or(StepErr::UnknownOpcode { pc, word: byte as u32 })?;
        Ok(self.execute(op, mode))
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
        match reg {
            0 => Ok(self.a as u64),
            1 => Ok(self.p as u64),
            2 => Ok(self.s as u64),
            3 => Ok(self.x as u64),
            4 => Ok(self.y as u64),
            _ => Err(RegErr::BadNumber { reg, count: REGISTER_COUNT }),
        }
    }

    fn set_register(&mut self, reg: u64, value: u64) -> Result<(), RegErr> {
        let value = value as u8;
        match reg {
            0 => self.a = value,
            1 => self.p = value,
            2 => self.s = value,
            3 => self.x = value,
            4 => self.y = value,
            _ => return Err(RegErr::BadNumber { reg, count: REGISTER_COUNT }),
        }
        Ok(())
    }

    fn register_number(&self, name: &str) -> Result<u64, RegErr> {
        match name {
            "A" | "a" => Ok(0),
            "P" | "p" => Ok(1),
            "S" | "s" => Ok(2),
            "X" | "x" => Ok(3),
            "Y" | "y" => Ok(4),
            _ => Err(RegErr::BadName(name.to_string())),
        }
    }

    fn assemble(&self, path: &Path) -> Result<(Vec<u8>, Vec<DebugToken>), AsmErr> {
        let tokens = parse::tokenize(path)?;
        let (resolved, debug) =
            asm::resolve_tokens_at(tokens, TEXT_PAGE as u64, process, translate_arg)?;
        Ok((encode(&resolved)?, debug))
    }

    fn current_instruction_address(&self) -> u64 {
        self.pc as u64
    }

    fn info(&self) -> ArchInfo {
        ArchInfo {
            name: "MOS 6502",
            register_names: REGISTER_NAMES,
            // The data word is 8 bits; 16 is the address width, which is
            // what hosts care about when formatting.
            word_width: 16,
        }
    }
}

static BRANCH_MNEMONICS: &[&str] = &["bpl", "bmi", "bvc", "bvs", "bcc", "bcs", "bne", "beq"];
static SHIFT_MNEMONICS: &[&str] = &["asl", "lsr", "rol", "ror"];

/// First-pass callback: derives the addressing mode from the argument
/// shapes, rewrites the arguments down to a bare operand, and records
/// the mode in the reserved slot.
fn process(instruction: &mut Instruction) -> Result<(), AsmErr> {
    let mode = classify(instruction).map_err(|e| AsmErr::new(AsmErrKind::Encode(e), instruction.loc.clone()))?;
    instruction.reserved = mode.into();
    instruction.size = mode.length();
    Ok(())
}

fn classify(instruction: &mut Instruction) -> Result<AddrMode, EncodeErr> {
    let mnemonic = instruction.mnemonic.as_str();
    let bad = |operand: &str| EncodeErr::BadOperand {
        mnemonic: mnemonic.to_string(),
        operand: operand.to_string(),
    };

    if BRANCH_MNEMONICS.contains(&mnemonic) {
        return Ok(AddrMode::Relative);
    }

    match &mut instruction.args[..] {
        [] => Ok(match SHIFT_MNEMONICS.contains(&mnemonic) {
            true => AddrMode::Accumulator,
            false => AddrMode::Implied,
        }),

        [arg] if arg.eq_ignore_ascii_case("a") && SHIFT_MNEMONICS.contains(&mnemonic) => {
            instruction.args.clear();
            Ok(AddrMode::Accumulator)
        }

        // Immediate: #value
        [arg] if arg.starts_with('#') => {
            *arg = arg[1..].to_string();
            Ok(AddrMode::Immediate)
        }

        // Indirect: (abs), for jmp.
        [arg] if arg.starts_with('(') && arg.ends_with(')') => {
            *arg = arg[1..arg.len() - 1].to_string();
            Ok(AddrMode::Indirect)
        }

        // Plain operand: zero page when a number fits in a byte,
        // absolute otherwise (labels always resolve as absolute).
        [arg] => {
            if mnemonic == "jmp" || mnemonic == "jsr" {
                return Ok(AddrMode::Absolute);
            }
            Ok(match operand_fits_zero_page(arg) {
                true => AddrMode::ZeroPage,
                false => AddrMode::Absolute,
            })
        }

        // Indexed indirect: (zp,x) arrives comma-split as "(zp" "x)".
        [first, second] if first.starts_with('(') && second.eq_ignore_ascii_case("x)") => {
            let operand = first[1..].to_string();
            instruction.args = vec![operand];
            Ok(AddrMode::IndexedIndirect)
        }

        // Indirect indexed: (zp),y
        [first, second] if first.starts_with('(') && first.ends_with(')')
            && second.eq_ignore_ascii_case("y") =>
        {
            let operand = first[1..first.len() - 1].to_string();
            instruction.args = vec![operand];
            Ok(AddrMode::IndirectIndexed)
        }

        // Indexed: operand,x or operand,y
        [first, second] if second.eq_ignore_ascii_case("x") || second.eq_ignore_ascii_case("y") => {
            let by_x = second.eq_ignore_ascii_case("x");
            let zero_page = operand_fits_zero_page(first);
            let operand = first.clone();
            instruction.args = vec![operand];
            let mode = match (zero_page, by_x) {
                (true, true) => AddrMode::ZeroPageX,
                (true, false) => AddrMode::ZeroPageY,
                (false, true) => AddrMode::AbsoluteX,
                (false, false) => AddrMode::AbsoluteY,
            };
            Ok(promote_indexed(mnemonic, mode))
        }

        [_, second] => Err(bad(&second.clone())),
        _ => Err(EncodeErr::WrongArgCount { mnemonic: mnemonic.to_string(), expected: 1 }),
    }
}

/// A numeric operand below 0x100 selects zero-page addressing. Labels do
/// not parse as numbers and land in absolute mode.
fn operand_fits_zero_page(arg: &str) -> bool {
    matches!(asm::parse_integer(arg), Ok(value) if value < 0x100)
}

/// Zero-page indexing only exists for some ops (most index zero page by
/// x only, ldx/stx by y only). When the op lacks the zero-page-indexed
/// opcode, the operand is encoded through the absolute-indexed form
/// instead, as 6502 assemblers do.
fn promote_indexed(mnemonic: &str, mode: AddrMode) -> AddrMode {
    let promoted = match mode {
        AddrMode::ZeroPageX => AddrMode::AbsoluteX,
        AddrMode::ZeroPageY => AddrMode::AbsoluteY,
        _ => return mode,
    };
    match Op::from_mnemonic(mnemonic) {
        Some(op) if opcode_for(op, mode).is_none() => promoted,
        _ => mode,
    }
}

/// Translates an argument that is not a label. Register letters and
/// addressing punctuation were consumed by the first pass, so only
/// numbers remain.
fn translate_arg(arg: &str) -> Result<u64, TranslateErr> {
    asm::parse_integer(arg)
}

//
// Encoding.
//

fn encode(tokens: &[ResolvedToken]) -> Result<Vec<u8>, AsmErr> {
    let size: u64 = tokens.iter().map(|t| match &t.kind {
        ResolvedKind::Instruction { .. } => {
            AddrMode::try_from(t.reserved).map_or(0, AddrMode::length)
        }
        ResolvedKind::Literal(bytes) => bytes.len() as u64,
    }).sum();

    let mut code = vec![0u8; size as usize];
    for token in tokens {
        // Layout starts at the text page; the image itself is 0-based.
        let at = (token.address - TEXT_PAGE as u64) as usize;
        match &token.kind {
            ResolvedKind::Literal(bytes) => code[at..at + bytes.len()].copy_from_slice(bytes),
            ResolvedKind::Instruction { mnemonic, args } => {
                let mode = AddrMode::try_from(token.reserved)
                    .unwrap_or_else(|_| unreachable!("reserved slot always holds a mode"));
                let bytes = encode_instruction(mnemonic, args, mode, token.address)
                    .map_err(|e| AsmErr::encode(e, token.loc.clone()))?;
                code[at..at + bytes.len()].copy_from_slice(&bytes);
            }
        }
    }
    Ok(code)
}

fn encode_instruction(
    mnemonic: &str,
    args: &[u64],
    mode: AddrMode,
    address: u64,
) -> Result<Vec<u8>, EncodeErr> {
    let op = Op::from_mnemonic(mnemonic)
        .ok_or_else(|| EncodeErr::UnknownMnemonic(mnemonic.to_string()))?;
    let opcode = opcode_for(op, mode).ok_or_else(|| EncodeErr::BadOperand {
        mnemonic: mnemonic.to_string(),
        operand: mode.describe().to_string(),
    })?;

    let operand_len = mode.length() as usize - 1;
    if args.len() != operand_len.min(1) {
        return Err(EncodeErr::WrongArgCount {
            mnemonic: mnemonic.to_string(),
            expected: operand_len.min(1),
        });
    }

    let mut bytes = vec![opcode];
    match mode {
        AddrMode::Implied | AddrMode::Accumulator => {}
        AddrMode::Relative => {
            let offset = (args[0] as u16 as i32) - (address as u16 as i32) - 2;
            if !(-128..=127).contains(&offset) {
                return Err(EncodeErr::BranchOutOfRange {
                    mnemonic: mnemonic.to_string(),
                    offset: offset as i64,
                });
            }
            bytes.push(offset as u8);
        }
        AddrMode::Absolute | AddrMode::AbsoluteX | AddrMode::AbsoluteY | AddrMode::Indirect => {
            let value = operand_field(mnemonic, args[0], 16)?;
            bytes.extend_from_slice(&(value as u16).to_le_bytes());
        }
        _ => {
            bytes.push(operand_field(mnemonic, args[0], 8)? as u8);
        }
    }
    Ok(bytes)
}

/// Checks an operand fits in `bits` bits, signed or unsigned.
fn operand_field(mnemonic: &str, value: u64, bits: u32) -> Result<u64, EncodeErr> {
    let signed = value as i64;
    let max = (1u64 << bits) - 1;
    match value <= max || (-(1i64 << (bits - 1))..0).contains(&signed) {
        true => Ok(value & max),
        false => Err(EncodeErr::ImmTooLarge { mnemonic: mnemonic.to_string(), value: signed, bits }),
    }
}
