//! The architecture backends.
//!
//! One module per supported ISA, each implementing [`Machine`], plus the
//! name-based factory used by hosts to pick one.

pub mod mips;
pub mod mos6502;
pub mod reduxk;
pub mod reduxv;
pub mod riscv;
pub mod sagui;

use crate::sim::Machine;

/// Creates the machine selected by `name`, or `None` if the name matches
/// no backend.
///
/// # Example
/// ```
/// use menagerie::arch;
///
/// let machine = arch::select("riscv").unwrap();
/// assert_eq!(machine.info().name, "RISC-V 32 IM");
/// assert!(arch::select("pdp11").is_none());
/// ```
pub fn select(name: &str) -> Option<Box<dyn Machine>> {
    match name {
        "riscv" => Some(Box::new(riscv::RiscV::new())),
        "mips" => Some(Box::new(mips::Mips::new())),
        "sagui" => Some(Box::new(sagui::Sagui::new())),
        "reduxv" => Some(Box::new(reduxv::ReduxV::new())),
        "reduxk" => Some(Box::new(reduxk::ReduxK::new())),
        "mos6502" | "6502" => Some(Box::new(mos6502::Mos6502::new())),
        _ => None,
    }
}

/// The selectable architecture names with one-line descriptions, for
/// hosts that list them.
pub fn listing() -> &'static [(&'static str, &'static str)] {
    &[
        ("riscv", "RISC-V IM, 32 bits"),
        ("mips", "subset of MIPS32"),
        ("sagui", "fantasy 8 bit RISC"),
        ("reduxv", "REDUX-V, 8 bit teaching ISA"),
        ("reduxk", "REDUX-K, REDUX-V with vector experiments"),
        ("mos6502", "MOS 6502"),
    ]
}

#[cfg(test)]
mod tests {
    use super::{listing, select};

    #[test]
    fn test_select_covers_listing() {
        for (name, _) in listing() {
            let machine = select(name)
                .unwrap_or_else(|| panic!("{name} is listed but not selectable"));
            assert!(machine.info().word_width > 0);
        }
        assert!(select("z80").is_none());
    }

    #[test]
    fn test_machines_are_independent() {
        let mut a = select("riscv").unwrap();
        let b = select("riscv").unwrap();
        a.set_memory(0, 7).unwrap();
        assert_eq!(b.get_memory(0), Ok(0));
    }
}
