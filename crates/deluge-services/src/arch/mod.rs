//! Per-ISA relocation backends.
//!
//! A backend patches one relocation record into a staged copy of a section.
//! `S` is the resolved symbol address, `A` the addend and `P` the runtime
//! address of the patched field (`section.base + offset`).

use deluge_core::elf::Arch;

pub mod arm;
pub mod avr;
pub mod msp430;
pub mod msp430x;
pub mod x86;

pub use arm::ArmThumb;
pub use avr::Avr;
pub use msp430::Msp430;
pub use msp430x::Msp430x;
pub use x86::X86;

/// A section's bytes while they are being relocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionImage {
    /// Offset of the section in the ELF file.
    pub file_offset: u64,
    /// Runtime address of the first byte.
    pub base: u32,
    pub bytes: Vec<u8>,
}

impl SectionImage {
    pub fn new(file_offset: u64, base: u32, bytes: Vec<u8>) -> Self {
        Self {
            file_offset,
            base,
            bytes,
        }
    }

    /// Runtime address of `offset`.
    pub fn place(&self, offset: u32) -> u32 {
        self.base.wrapping_add(offset)
    }

    pub fn read_u16(&self, offset: u32) -> Result<u16, RelocError> {
        let b = self.field::<2>(offset)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn read_u32(&self, offset: u32) -> Result<u32, RelocError> {
        let b = self.field::<4>(offset)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn write_u16(&mut self, offset: u32, value: u16) -> Result<(), RelocError> {
        self.field_mut(offset, 2)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_u32(&mut self, offset: u32, value: u32) -> Result<(), RelocError> {
        self.field_mut(offset, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn field<const N: usize>(&self, offset: u32) -> Result<[u8; N], RelocError> {
        let start = offset as usize;
        start
            .checked_add(N)
            .and_then(|end| self.bytes.get(start..end))
            .and_then(|s| s.try_into().ok())
            .ok_or(RelocError::OutOfBounds { offset })
    }

    fn field_mut(&mut self, offset: u32, len: usize) -> Result<&mut [u8], RelocError> {
        let start = offset as usize;
        start
            .checked_add(len)
            .and_then(|end| self.bytes.get_mut(start..end))
            .ok_or(RelocError::OutOfBounds { offset })
    }
}

/// One REL/RELA record with its addend already known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Offset of the patched field inside the section.
    pub offset: u32,
    pub r_type: u8,
    pub addend: i32,
}

pub trait Relocator: Send + Sync {
    fn arch(&self) -> Arch;

    /// Addend of a REL record, stored in the bytes being patched.
    fn implicit_addend(&self, section: &SectionImage, offset: u32, _r_type: u8) -> i32 {
        section.read_u32(offset).map(|v| v as i32).unwrap_or(0)
    }

    /// Patch `rel` so that it refers to `symbol`.
    fn relocate(&self, section: &mut SectionImage, rel: &Relocation, symbol: u32)
        -> Result<(), RelocError>;

    /// Erase granularity of the ROM the code is written to. `None` = plain RAM.
    fn rom_page_size(&self) -> Option<usize> {
        None
    }
}

pub fn for_arch(arch: Arch) -> Box<dyn Relocator> {
    match arch {
        Arch::Avr => Box::new(Avr),
        Arch::Msp430 => Box::new(Msp430),
        Arch::Msp430x => Box::new(Msp430x),
        Arch::X86 => Box::new(X86),
        Arch::ArmThumb => Box::new(ArmThumb),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelocError {
    #[error("unsupported relocation type {0}")]
    Unsupported(u8),
    #[error("relocation type {r_type} at offset {offset:#x}: value {value} out of range")]
    OutOfRange { r_type: u8, offset: u32, value: i64 },
    #[error("relocation at offset {offset:#x} runs past the end of the section")]
    OutOfBounds { offset: u32 },
}

/// Offset of a field `delta` bytes into the instruction at `offset`.
pub(crate) fn field_after(offset: u32, delta: u32) -> Result<u32, RelocError> {
    offset
        .checked_add(delta)
        .ok_or(RelocError::OutOfBounds { offset })
}

/// `S + A`, wrapping in the 32-bit address space.
pub(crate) fn absolute(symbol: u32, addend: i32) -> u32 {
    symbol.wrapping_add(addend as u32)
}

/// Signed distance from `place` to `target`.
pub(crate) fn displacement(target: u32, place: u32) -> i64 {
    target as i64 - place as i64
}
