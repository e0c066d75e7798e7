//! ARM in Thumb-2 state (Cortex-M).

use deluge_core::elf::Arch;

use super::{absolute, displacement, field_after, RelocError, Relocation, Relocator, SectionImage};

pub const R_ARM_NONE: u8 = 0;
pub const R_ARM_ABS32: u8 = 2;
pub const R_ARM_REL32: u8 = 3;
pub const R_ARM_THM_CALL: u8 = 10;
pub const R_ARM_THM_JUMP24: u8 = 30;

/// BL/B.W reach: a signed 25-bit byte offset.
const BRANCH_RANGE: i64 = 1 << 24;

pub struct ArmThumb;

impl Relocator for ArmThumb {
    fn arch(&self) -> Arch {
        Arch::ArmThumb
    }

    fn implicit_addend(&self, section: &SectionImage, offset: u32, r_type: u8) -> i32 {
        match r_type {
            R_ARM_THM_CALL | R_ARM_THM_JUMP24 => {
                let hw1 = field_after(offset, 2).and_then(|at| section.read_u16(at));
                match (section.read_u16(offset), hw1) {
                    (Ok(hw0), Ok(hw1)) => decode_branch(hw0, hw1),
                    _ => 0,
                }
            }
            _ => section.read_u32(offset).map(|v| v as i32).unwrap_or(0),
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
        let place = section.place(at);
        match rel.r_type {
            R_ARM_NONE => Ok(()),
            R_ARM_ABS32 => section.write_u32(at, value),
            R_ARM_REL32 => section.write_u32(at, value.wrapping_sub(place)),
            R_ARM_THM_CALL => {
                // An even target is ARM code: turn BL into BLX, which
                // branches from the word-aligned PC.
                let thumb = value & 1 != 0;
                let from = if thumb { place } else { place & !3 };
                let offset = branch_offset(rel, value & !1, from)?;
                let second = field_after(at, 2)?;
                let (hw0, hw1) = (section.read_u16(at)?, section.read_u16(second)?);
                let (imm0, imm1) = encode_branch(offset);
                let link = if thumb { 1 << 12 } else { 0 };
                section.write_u16(at, (hw0 & 0xf800) | imm0)?;
                section.write_u16(second, (hw1 & 0xc000) | link | imm1)
            }
            R_ARM_THM_JUMP24 => {
                let offset = branch_offset(rel, value & !1, place)?;
                let second = field_after(at, 2)?;
                let (hw0, hw1) = (section.read_u16(at)?, section.read_u16(second)?);
                let (imm0, imm1) = encode_branch(offset);
                section.write_u16(at, (hw0 & 0xf800) | imm0)?;
                section.write_u16(second, (hw1 & 0xd000) | imm1)
            }
            other => Err(RelocError::Unsupported(other)),
        }
    }
}

fn branch_offset(rel: &Relocation, target: u32, from: u32) -> Result<u32, RelocError> {
    let offset = displacement(target, from);
    if !(-BRANCH_RANGE..BRANCH_RANGE).contains(&offset) {
        return Err(RelocError::OutOfRange {
            r_type: rel.r_type,
            offset: rel.offset,
            value: offset,
        });
    }
    Ok(offset as u32)
}

/// Split a branch offset into the immediate bits of both halfwords:
/// `S imm10` and `J1 J2 imm11`, where `Jn = !(In ^ S)`.
fn encode_branch(offset: u32) -> (u16, u16) {
    let s = (offset >> 24) & 1;
    let i1 = (offset >> 23) & 1;
    let i2 = (offset >> 22) & 1;
    let j1 = !(i1 ^ s) & 1;
    let j2 = !(i2 ^ s) & 1;
    let imm10 = (offset >> 12) & 0x3ff;
    let imm11 = (offset >> 1) & 0x7ff;
    ((s << 10 | imm10) as u16, (j1 << 13 | j2 << 11 | imm11) as u16)
}

fn decode_branch(hw0: u16, hw1: u16) -> i32 {
    let (hw0, hw1) = (hw0 as u32, hw1 as u32);
    let s = (hw0 >> 10) & 1;
    let j1 = (hw1 >> 13) & 1;
    let j2 = (hw1 >> 11) & 1;
    let i1 = !(j1 ^ s) & 1;
    let i2 = !(j2 ^ s) & 1;
    let offset = s << 24 | i1 << 23 | i2 << 22 | (hw0 & 0x3ff) << 12 | (hw1 & 0x7ff) << 1;
    // sign-extend from bit 24
    ((offset << 7) as i32) >> 7
}
