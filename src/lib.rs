//! A multi-architecture assembler and emulator for teaching small CPU
//! designs.
//!
//! The crate assembles line-oriented assembly for several small
//! instruction sets (a 32-bit RISC-V IM subset, a MIPS-I subset, the
//! 8-bit Sagui, REDUX-V and REDUX-K teaching ISAs, and the MOS 6502),
//! loads the image into an emulated machine, and steps it, surfacing
//! syscalls to the host.
//!
//! # Usage
//!
//! Every backend implements the [`sim::Machine`] capability surface:
//! assemble a file (or an in-memory string), load the image, and step or
//! run it:
//!
//! ```
//! use menagerie::arch::riscv::RiscV;
//! use menagerie::sim::{self, Machine};
//!
//! let code = "
//!     addi a7, zero, 3    ; write(msg, 14)
//!     addi a0, zero, msg
//!     addi a1, zero, 14
//!     ecall
//!     addi a7, zero, 1    ; break
//!     ecall
//! msg:
//! .literal Hello, world!%0A
//! ";
//!
//! let mut machine = RiscV::new();
//! let (image, symbols) = machine.assemble_source("demo.asm", code).unwrap();
//! machine.load_program(&image).unwrap();
//!
//! let mut output = Vec::new();
//! sim::run_with(&mut machine, &mut std::io::empty(), &mut output).unwrap();
//! assert_eq!(output, b"Hello, world!\n");
//!
//! // The debug symbols map addresses back to source.
//! assert_eq!(symbols[0].address, 0);
//! assert_eq!(symbols[0].loc.line, 2);
//! ```
//!
//! Hosts that drive a machine by architecture name (the bundled runner
//! binary, a debugger) go through [`arch::select`] and the
//! [`sim::Machine`] trait object it returns.
//!
//! The crate is organized bottom-up: [`parse`] turns source files into
//! tokens, [`asm`] lays tokens out into addressed, numeric form plus a
//! debug-symbol stream, [`arch`] holds the per-ISA encoders and
//! machines, and [`sim`] defines the machine capability surface and the
//! host runner loop.

#![warn(missing_docs)]

pub mod arch;
pub mod asm;
pub mod err;
pub mod parse;
pub mod sim;
