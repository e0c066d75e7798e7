//! MSP430X extended (20-bit) addressing.
//!
//! A 20-bit address is split: bits 15:0 go into an operand word after the
//! opcode, bits 19:16 into a nibble of the opcode or of the extension word
//! that precedes it.

use deluge_core::elf::Arch;

use super::msp430::{self, FLASH_SEGMENT};
use super::{absolute, field_after, RelocError, Relocation, Relocator, SectionImage};

pub const R_MSP430X_SRC_BYTE: u8 = 9;
pub const R_MSP430X_SRC: u8 = 10;
pub const R_MSP430X_DST_BYTE: u8 = 11;
pub const R_MSP430X_DST: u8 = 12;
pub const R_MSP430X_DST_2ND_BYTE: u8 = 13;
pub const R_MSP430X_DST_2ND: u8 = 14;
pub const R_MSP430X_PCREL_SRC_BYTE: u8 = 15;
pub const R_MSP430X_PCREL_SRC: u8 = 16;
pub const R_MSP430X_PCREL_DST_BYTE: u8 = 17;
pub const R_MSP430X_PCREL_DST: u8 = 18;
pub const R_MSP430X_PCREL_DST_2ND: u8 = 19;
pub const R_MSP430X_PCREL_DST_2ND_BYTE: u8 = 20;
pub const R_MSP430X_S_BYTE: u8 = 21;
pub const R_MSP430X_S: u8 = 22;
pub const R_MSP430X_D_BYTE: u8 = 23;
pub const R_MSP430X_D: u8 = 24;
pub const R_MSP430X_PCREL_D: u8 = 25;
pub const R_MSP430X_INDXD: u8 = 26;
pub const R_MSP430X_PCREL_INDXD: u8 = 27;

pub struct Msp430x;

impl Relocator for Msp430x {
    fn arch(&self) -> Arch {
        Arch::Msp430x
    }

    fn implicit_addend(&self, section: &SectionImage, offset: u32, r_type: u8) -> i32 {
        let delta = match r_type {
            R_MSP430X_S
            | R_MSP430X_S_BYTE
            | R_MSP430X_D
            | R_MSP430X_PCREL_D
            | R_MSP430X_D_BYTE
            | R_MSP430X_INDXD
            | R_MSP430X_PCREL_INDXD => 2,
            R_MSP430X_SRC..=R_MSP430X_DST
            | R_MSP430X_SRC_BYTE
            | R_MSP430X_PCREL_SRC_BYTE..=R_MSP430X_PCREL_DST => 4,
            R_MSP430X_DST_2ND_BYTE | R_MSP430X_DST_2ND => 6,
            R_MSP430X_PCREL_DST_2ND | R_MSP430X_PCREL_DST_2ND_BYTE => 6,
            _ => return msp430::implicit_addend(section, offset, r_type),
        };
        field_after(offset, delta)
            .and_then(|low_word| section.read_u16(low_word))
            .map_or(0, |v| v as i16 as i32)
    }

    fn relocate(
        &self,
        section: &mut SectionImage,
        rel: &Relocation,
        symbol: u32,
    ) -> Result<(), RelocError> {
        if let Some(result) = msp430::relocate_base(section, rel, symbol) {
            return result;
        }

        let value = absolute(symbol, rel.addend);
        let low = value as u16;
        let at = rel.offset;
        match rel.r_type {
            R_MSP430X_S | R_MSP430X_S_BYTE => {
                // bits 19:16 → opcode 11:8
                let op = section.read_u16(at)?;
                section.write_u16(at, (op & 0xf0ff) | ((value >> 8) & 0x0f00) as u16)?;
                section.write_u16(field_after(at, 2)?, low)
            }
            R_MSP430X_D | R_MSP430X_PCREL_D | R_MSP430X_D_BYTE => {
                // bits 19:16 → opcode 3:0
                set_low_nibble(section, at, value)?;
                section.write_u16(field_after(at, 2)?, low)
            }
            R_MSP430X_SRC | R_MSP430X_SRC_BYTE | R_MSP430X_PCREL_SRC | R_MSP430X_PCREL_SRC_BYTE => {
                // bits 19:16 → extension word 10:7
                let ext = section.read_u16(at)?;
                section.write_u16(at, (ext & 0xf87f) | ((value >> 9) & 0x0780) as u16)?;
                section.write_u16(field_after(at, 4)?, low)
            }
            R_MSP430X_DST | R_MSP430X_DST_BYTE | R_MSP430X_PCREL_DST | R_MSP430X_PCREL_DST_BYTE => {
                set_low_nibble(section, at, value)?;
                section.write_u16(field_after(at, 4)?, low)
            }
            R_MSP430X_DST_2ND
            | R_MSP430X_DST_2ND_BYTE
            | R_MSP430X_PCREL_DST_2ND
            | R_MSP430X_PCREL_DST_2ND_BYTE => {
                // destination word follows the source word
                set_low_nibble(section, at, value)?;
                section.write_u16(field_after(at, 6)?, low)
            }
            R_MSP430X_INDXD | R_MSP430X_PCREL_INDXD => {
                section.write_u16(field_after(at, 2)?, low)
            }
            other => Err(RelocError::Unsupported(other)),
        }
    }

    fn rom_page_size(&self) -> Option<usize> {
        Some(FLASH_SEGMENT)
    }
}

fn set_low_nibble(section: &mut SectionImage, at: u32, value: u32) -> Result<(), RelocError> {
    let word = section.read_u16(at)?;
    section.write_u16(at, (word & 0xfff0) | ((value >> 16) & 0x000f) as u16)
}
