//! AVR. Code addresses are word addresses; data addresses are bytes.

use deluge_core::elf::Arch;

use super::{absolute, displacement, field_after, RelocError, Relocation, Relocator, SectionImage};

pub const R_AVR_NONE: u8 = 0;
pub const R_AVR_32: u8 = 1;
pub const R_AVR_7_PCREL: u8 = 2;
pub const R_AVR_13_PCREL: u8 = 3;
pub const R_AVR_16: u8 = 4;
pub const R_AVR_16_PM: u8 = 5;
pub const R_AVR_LO8_LDI: u8 = 6;
pub const R_AVR_HI8_LDI: u8 = 7;
pub const R_AVR_HH8_LDI: u8 = 8;
pub const R_AVR_LO8_LDI_NEG: u8 = 9;
pub const R_AVR_HI8_LDI_NEG: u8 = 10;
pub const R_AVR_HH8_LDI_NEG: u8 = 11;
pub const R_AVR_LO8_LDI_PM: u8 = 12;
pub const R_AVR_HI8_LDI_PM: u8 = 13;
pub const R_AVR_HH8_LDI_PM: u8 = 14;
pub const R_AVR_CALL: u8 = 18;

/// SPM page size on ATmega128-class parts.
pub const FLASH_PAGE: usize = 256;

pub struct Avr;

impl Relocator for Avr {
    fn arch(&self) -> Arch {
        Arch::Avr
    }

    fn implicit_addend(&self, section: &SectionImage, offset: u32, r_type: u8) -> i32 {
        match r_type {
            R_AVR_32 => section.read_u32(offset).map(|v| v as i32).unwrap_or(0),
            R_AVR_16 | R_AVR_16_PM => {
                section.read_u16(offset).map(|v| v as i16 as i32).unwrap_or(0)
            }
            // instruction fields carry no addend
            _ => 0,
        }
    }

    fn relocate(
        &self,
        section: &mut SectionImage,
        rel: &Relocation,
        symbol: u32,
    ) -> Result<(), RelocError> {
        let value = absolute(symbol, rel.addend);
        let at = rel.offset;
        match rel.r_type {
            R_AVR_NONE => Ok(()),
            R_AVR_32 => section.write_u32(at, value),
            R_AVR_16 => section.write_u16(at, value as u16),
            R_AVR_16_PM => section.write_u16(at, (value >> 1) as u16),
            R_AVR_7_PCREL => {
                // brxx k: 1111 0xkk kkkk ksss, k = signed words from PC+1
                let op = section.read_u16(at)?;
                let k = word_displacement(rel, value, section.place(at).wrapping_add(2), 7)?;
                section.write_u16(at, (op & 0xfc07) | (((k & 0x7f) as u16) << 3))
            }
            R_AVR_13_PCREL => {
                // rjmp/rcall k: xxxx kkkk kkkk kkkk
                let op = section.read_u16(at)?;
                let k = word_displacement(rel, value, section.place(at).wrapping_add(2), 12)?;
                section.write_u16(at, (op & 0xf000) | (k & 0x0fff) as u16)
            }
            R_AVR_LO8_LDI..=R_AVR_HH8_LDI_PM => {
                let byte = ldi_byte(rel.r_type, value);
                let op = section.read_u16(at)?;
                section.write_u16(at, (op & 0xf0f0) | (byte & 0x0f) | ((byte & 0xf0) << 4))
            }
            R_AVR_CALL => {
                // call/jmp: 22-bit word address, bits 21:17 and 16 in the
                // opcode word, bits 15:0 in the next word
                let v = value >> 1;
                let op = section.read_u16(at)?;
                let hi = ((v >> 16) & 0x1) as u16 | ((((v >> 17) & 0x1f) as u16) << 4);
                section.write_u16(at, (op & 0xfe0e) | hi)?;
                section.write_u16(field_after(at, 2)?, v as u16)
            }
            other => Err(RelocError::Unsupported(other)),
        }
    }

    fn rom_page_size(&self) -> Option<usize> {
        Some(FLASH_PAGE)
    }
}

/// Signed word displacement from `pc` to `target`, checked to fit `bits`.
fn word_displacement(rel: &Relocation, target: u32, pc: u32, bits: u32) -> Result<i32, RelocError> {
    let bytes = displacement(target, pc);
    let words = bytes >> 1;
    let limit = 1i64 << (bits - 1);
    if bytes & 1 != 0 || words < -limit || words >= limit {
        return Err(RelocError::OutOfRange {
            r_type: rel.r_type,
            offset: rel.offset,
            value: bytes,
        });
    }
    Ok(words as i32)
}

/// The byte an `ldi` loads for the given LDI relocation.
fn ldi_byte(r_type: u8, value: u32) -> u16 {
    let v = match r_type {
        R_AVR_LO8_LDI_NEG | R_AVR_HI8_LDI_NEG | R_AVR_HH8_LDI_NEG => value.wrapping_neg(),
        R_AVR_LO8_LDI_PM | R_AVR_HI8_LDI_PM | R_AVR_HH8_LDI_PM => value >> 1,
        _ => value,
    };
    let shift = match r_type {
        R_AVR_LO8_LDI | R_AVR_LO8_LDI_NEG | R_AVR_LO8_LDI_PM => 0,
        R_AVR_HI8_LDI | R_AVR_HI8_LDI_NEG | R_AVR_HI8_LDI_PM => 8,
        _ => 16,
    };
    ((v >> shift) & 0xff) as u16
}
