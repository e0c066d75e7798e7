//! MSP430 (16-bit address space).

use deluge_core::elf::Arch;

use super::{absolute, RelocError, Relocation, Relocator, SectionImage};

pub const R_MSP430_NONE: u8 = 0;
pub const R_MSP430_32: u8 = 1;
pub const R_MSP430_16: u8 = 3;
pub const R_MSP430_16_PCREL: u8 = 4;
pub const R_MSP430_16_BYTE: u8 = 5;
pub const R_MSP430_16_PCREL_BYTE: u8 = 6;

/// Flash segment size.
pub const FLASH_SEGMENT: usize = 512;

pub struct Msp430;

impl Relocator for Msp430 {
    fn arch(&self) -> Arch {
        Arch::Msp430
    }

    fn implicit_addend(&self, section: &SectionImage, offset: u32, r_type: u8) -> i32 {
        implicit_addend(section, offset, r_type)
    }

    fn relocate(
        &self,
        section: &mut SectionImage,
        rel: &Relocation,
        symbol: u32,
    ) -> Result<(), RelocError> {
        relocate_base(section, rel, symbol).unwrap_or(Err(RelocError::Unsupported(rel.r_type)))
    }

    fn rom_page_size(&self) -> Option<usize> {
        Some(FLASH_SEGMENT)
    }
}

pub(super) fn implicit_addend(section: &SectionImage, offset: u32, r_type: u8) -> i32 {
    let value = match r_type {
        R_MSP430_32 => section.read_u32(offset),
        _ => section.read_u16(offset).map(|v| v as i16 as i32 as u32),
    };
    value.map(|v| v as i32).unwrap_or(0)
}

/// Types shared with MSP430X. `None` when `rel` is not one of them.
///
/// The PC-relative variants are stored as the absolute target, as the
/// toolchain resolves the PC offset itself.
pub(super) fn relocate_base(
    section: &mut SectionImage,
    rel: &Relocation,
    symbol: u32,
) -> Option<Result<(), RelocError>> {
    let value = absolute(symbol, rel.addend);
    let result = match rel.r_type {
        R_MSP430_NONE => Ok(()),
        R_MSP430_16 | R_MSP430_16_PCREL | R_MSP430_16_BYTE | R_MSP430_16_PCREL_BYTE => {
            section.write_u16(rel.offset, value as u16)
        }
        R_MSP430_32 => section.write_u32(rel.offset, value),
        _ => return None,
    };
    Some(result)
}
