//! i386. Only the two relocations a `-fno-pic` module needs.

use deluge_core::elf::Arch;

use super::{absolute, RelocError, Relocation, Relocator, SectionImage};

pub const R_386_NONE: u8 = 0;
pub const R_386_32: u8 = 1;
pub const R_386_PC32: u8 = 2;

pub struct X86;

impl Relocator for X86 {
    fn arch(&self) -> Arch {
        Arch::X86
    }

    fn relocate(
        &self,
        section: &mut SectionImage,
        rel: &Relocation,
        symbol: u32,
    ) -> Result<(), RelocError> {
        let value = absolute(symbol, rel.addend);
        match rel.r_type {
            R_386_NONE => Ok(()),
            R_386_32 => section.write_u32(rel.offset, value),
            R_386_PC32 => {
                let place = section.place(rel.offset);
                section.write_u32(rel.offset, value.wrapping_sub(place))
            }
            other => Err(RelocError::Unsupported(other)),
        }
    }
}
