//! The machine abstraction and its host-side runner.
//!
//! This module consists of:
//! - [`Machine`]: the capability surface every architecture backend
//!   implements.
//! - [`Call`]: the syscall record a step may surface to the host, with
//!   the three reserved call numbers [`SYS_BREAK`], [`SYS_READ`] and
//!   [`SYS_WRITE`].
//! - [`run`] / [`run_with`]: the host runner loop.
//! - [`mem`]: the memory backing stores shared by the backends.
//!
//! Execution is single-threaded and purely sequential: a step either
//! advances the machine, surfaces a syscall record, or fails. The core
//! does no I/O of its own; the runner drives standard input and output in
//! response to syscall records.

pub mod mem;

use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::asm::{AsmErr, DebugToken};

/// Syscall number: transfer control to the host (stop the machine or drop
/// into the debugger). No arguments.
pub const SYS_BREAK: u64 = 1;
/// Syscall number: read input. Arg1 is the buffer address, arg2 the size
/// in bytes.
pub const SYS_READ: u64 = 2;
/// Syscall number: write output. Arg1 is the buffer address, arg2 the
/// size in bytes.
pub const SYS_WRITE: u64 = 3;

/// A syscall record surfaced by a machine step.
///
/// The three reserved numbers are [`SYS_BREAK`], [`SYS_READ`] and
/// [`SYS_WRITE`]; any other number is opaque to the core and forwarded to
/// the host unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    /// The syscall number.
    pub number: u64,
    /// The first argument.
    pub arg1: u64,
    /// The second argument.
    pub arg2: u64,
}

/// A description of an architecture, for hosts that present the machine
/// to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchInfo {
    /// A human-readable architecture name.
    pub name: &'static str,
    /// The names of the registers, indexed by register number.
    pub register_names: &'static [&'static str],
    /// The architecture word width in bits.
    pub word_width: u32,
}

/// A memory access failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemErr {
    /// The address is beyond the architecture's address space.
    OutOfRange {
        /// The failing address.
        addr: u64,
        /// The maximum valid address.
        max: u64,
    },
    /// A chunk access runs past the end of the address space.
    ChunkOutOfRange {
        /// The starting address.
        addr: u64,
        /// The length of the chunk in bytes.
        len: u64,
        /// The maximum valid address.
        max: u64,
    },
}

impl fmt::Display for MemErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { addr, max } =>
                write!(f, "address {addr:#x} is bigger than the maximum address {max:#x}"),
            Self::ChunkOutOfRange { addr, len, max } =>
                write!(f, "chunk of {len} bytes at {addr:#x} ends beyond the maximum address {max:#x}"),
        }
    }
}

impl std::error::Error for MemErr {}
impl crate::err::Error for MemErr {}

/// A register access failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegErr {
    /// The register number is not defined by the architecture.
    BadNumber {
        /// The failing register number.
        reg: u64,
        /// How many registers the architecture has.
        count: u64,
    },
    /// The register name is not defined by the architecture.
    BadName(String),
}

impl fmt::Display for RegErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadNumber { reg, count } =>
                write!(f, "no such register: {reg} (the architecture has {count} registers)"),
            Self::BadName(name) =>
                write!(f, "no such register: {name}"),
        }
    }
}

impl std::error::Error for RegErr {}
impl crate::err::Error for RegErr {}

/// A failure while stepping the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepErr {
    /// The next instruction could not be fetched.
    Fetch {
        /// The PC the fetch was attempted at.
        pc: u64,
    },
    /// The fetched word's opcode is not defined by the architecture.
    UnknownOpcode {
        /// The PC of the instruction.
        pc: u64,
        /// The fetched instruction word.
        word: u32,
    },
    /// The opcode is recognized, but the rest of the encoding is not.
    UnknownInstruction {
        /// The PC of the instruction.
        pc: u64,
        /// The fetched instruction word.
        word: u32,
    },
    /// A memory access during execution failed.
    Mem(MemErr),
}

impl fmt::Display for StepErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch { pc } =>
                write!(f, "could not fetch the next instruction at PC {pc:#x}"),
            Self::UnknownOpcode { pc, word } =>
                write!(f, "unknown opcode in instruction {word:#x} at {pc:#x}"),
            Self::UnknownInstruction { pc, word } =>
                write!(f, "unknown instruction encoding {word:#x} at {pc:#x}"),
            Self::Mem(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for StepErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Mem(e) => Some(e),
            _ => None,
        }
    }
}

impl crate::err::Error for StepErr {}

impl From<MemErr> for StepErr {
    fn from(err: MemErr) -> Self {
        StepErr::Mem(err)
    }
}

/// The capability surface of an emulated machine.
///
/// Every architecture backend implements this trait; hosts (the runner,
/// a debugger) drive machines exclusively through it. Backends are
/// self-contained: two machine instances share nothing.
///
/// A step is synchronous. All register and memory effects of an
/// instruction are observable once [`next_instruction`] returns; when a
/// step fails, the machine may be left in a partially updated state and
/// the host must not assume atomicity.
///
/// [`next_instruction`]: Machine::next_instruction
pub trait Machine {
    /// Copies a program image into memory at the architecture's entry
    /// address and resets the PC to it.
    ///
    /// The entry address is 0, except where the architecture defines a
    /// text base (the 6502 loads at 0x8000).
    fn load_program(&mut self, image: &[u8]) -> Result<(), MemErr>;

    /// Executes one instruction.
    ///
    /// Returns `Ok(Some(call))` when the instruction crosses the emulator
    /// boundary with a syscall, `Ok(None)` otherwise.
    fn next_instruction(&mut self) -> Result<Option<Call>, StepErr>;

    /// Reads one byte of memory.
    fn get_memory(&self, addr: u64) -> Result<u8, MemErr>;

    /// Writes one byte of memory.
    fn set_memory(&mut self, addr: u64, byte: u8) -> Result<(), MemErr>;

    /// Reads `size` contiguous bytes of memory starting at `addr`.
    fn get_memory_chunk(&self, addr: u64, size: u64) -> Result<Vec<u8>, MemErr>;

    /// Writes contiguous bytes of memory starting at `addr`.
    fn set_memory_chunk(&mut self, addr: u64, bytes: &[u8]) -> Result<(), MemErr>;

    /// Reads a register by number.
    fn get_register(&self, reg: u64) -> Result<u64, RegErr>;

    /// Writes a register by number.
    ///
    /// Where the architecture defines a hardwired zero register (RISC-V,
    /// MIPS), writes to it succeed but are silently discarded.
    fn set_register(&mut self, reg: u64, value: u64) -> Result<(), RegErr>;

    /// Translates a human register name (e.g. `"t0"`, `"zero"`) to its
    /// register number.
    fn register_number(&self, name: &str) -> Result<u64, RegErr>;

    /// Assembles the file at `path` into a program image and its debug
    /// symbols.
    ///
    /// On error no partial image is returned.
    fn assemble(&self, path: &Path) -> Result<(Vec<u8>, Vec<DebugToken>), AsmErr>;

    /// The current PC: the address of the next instruction to execute.
    fn current_instruction_address(&self) -> u64;

    /// Describes the architecture.
    fn info(&self) -> ArchInfo;
}

/// A failure from the host runner loop.
#[derive(Debug)]
pub enum RunErr {
    /// The machine failed to step.
    Step(StepErr),
    /// A syscall touched memory out of range.
    Mem(MemErr),
    /// Host input or output failed.
    Io(io::Error),
}

impl fmt::Display for RunErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step(e) => write!(f, "instruction execution failed: {e}"),
            Self::Mem(e) => write!(f, "syscall memory access failed: {e}"),
            Self::Io(e) => write!(f, "host i/o failed: {e}"),
        }
    }
}

impl std::error::Error for RunErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Step(e) => Some(e),
            Self::Mem(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}

impl crate::err::Error for RunErr {}

impl From<StepErr> for RunErr {
    fn from(err: StepErr) -> Self {
        RunErr::Step(err)
    }
}
impl From<MemErr> for RunErr {
    fn from(err: MemErr) -> Self {
        RunErr::Mem(err)
    }
}
impl From<io::Error> for RunErr {
    fn from(err: io::Error) -> Self {
        RunErr::Io(err)
    }
}

/// Steps the machine to completion, driving standard input and output.
///
/// See [`run_with`] for the loop's behavior.
pub fn run(machine: &mut dyn Machine) -> Result<(), RunErr> {
    run_with(machine, &mut io::stdin().lock(), &mut io::stdout().lock())
}

/// Steps the machine to completion, driving the provided input and
/// output.
///
/// The loop dispatches syscall records as they surface:
/// - [`SYS_BREAK`] ends the run with `Ok(())`.
/// - [`SYS_READ`] fills target memory at arg1 with arg2 bytes from
///   `input`; if input ends early, the tail of the buffer stays zero.
/// - [`SYS_WRITE`] copies arg2 bytes of target memory at arg1 to
///   `output`.
/// - Any other number passes through without effect on the machine.
///
/// Execution also ends on the first step, memory or I/O error.
pub fn run_with(
    machine: &mut dyn Machine,
    input: &mut dyn Read,
    output: &mut dyn Write,
) -> Result<(), RunErr> {
    loop {
        let Some(call) = machine.next_instruction()? else {
            continue;
        };

        match call.number {
            SYS_BREAK => return Ok(()),
            SYS_READ => {
                let mut buf = vec![0u8; call.arg2 as usize];
                read_full(input, &mut buf)?;
                machine.set_memory_chunk(call.arg1, &buf)?;
            }
            SYS_WRITE => {
                let buf = machine.get_memory_chunk(call.arg1, call.arg2)?;
                output.write_all(&buf)?;
                output.flush()?;
            }
            _ => {}
        }
    }
}

/// Reads until the buffer is full or input is exhausted.
fn read_full(input: &mut dyn Read, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match input.read(buf) {
            Ok(0) => break,
            Ok(n) => buf = &mut buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{run_with, Machine, RunErr};
    use crate::arch::riscv::RiscV;

    fn machine_with(src: &str) -> RiscV {
        let mut m = RiscV::new();
        let (code, _) = m.assemble_source("test.asm", src).unwrap();
        m.load_program(&code).unwrap();
        m
    }

    #[test]
    fn test_run_write_and_break() {
        let mut m = machine_with(
            "addi a7, zero, 3\n\
             addi a0, zero, msg\n\
             addi a1, zero, 3\n\
             ecall\n\
             addi a7, zero, 1\n\
             ecall\n\
             msg:\n\
             #hey\n",
        );

        let mut output = Vec::new();
        run_with(&mut m, &mut std::io::empty(), &mut output).unwrap();
        assert_eq!(output, b"hey");
    }

    #[test]
    fn test_run_read() {
        let mut m = machine_with(
            "addi a7, zero, 2\n\
             addi a0, zero, 0x100\n\
             addi a1, zero, 4\n\
             ecall\n\
             addi a7, zero, 1\n\
             ecall\n",
        );

        let mut input: &[u8] = b"ping";
        run_with(&mut m, &mut input, &mut Vec::new()).unwrap();
        assert_eq!(m.get_memory_chunk(0x100, 4).unwrap(), b"ping");
    }

    #[test]
    fn test_run_short_read_leaves_zeroes() {
        let mut m = machine_with(
            "addi a7, zero, 2\n\
             addi a0, zero, 0x100\n\
             addi a1, zero, 4\n\
             ecall\n\
             addi a7, zero, 1\n\
             ecall\n",
        );

        let mut input: &[u8] = b"a";
        run_with(&mut m, &mut input, &mut Vec::new()).unwrap();
        assert_eq!(m.get_memory_chunk(0x100, 4).unwrap(), [b'a', 0, 0, 0]);
    }

    #[test]
    fn test_run_ignores_unknown_calls() {
        let mut m = machine_with(
            "addi a7, zero, 99\n\
             ecall\n\
             addi a7, zero, 1\n\
             ecall\n",
        );
        run_with(&mut m, &mut std::io::empty(), &mut Vec::new()).unwrap();
    }

    #[test]
    fn test_run_surfaces_step_errors() {
        let mut m = RiscV::new();
        // An all-zero word has no valid opcode.
        m.load_program(&[0, 0, 0, 0]).unwrap();
        let err = run_with(&mut m, &mut std::io::empty(), &mut Vec::new()).unwrap_err();
        assert!(matches!(err, RunErr::Step(_)));
    }
}
