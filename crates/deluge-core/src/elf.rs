//! ELF32 little-endian on-disk layouts used by the relocating loader.
//!
//! Only the pieces a relocatable object needs: the file header, section
//! headers, symbols and REL/RELA records.

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, I32, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub type Le16 = U16<LittleEndian>;
pub type Le32 = U32<LittleEndian>;
pub type LeI32 = I32<LittleEndian>;

/// `e_ident[0..7]`: magic, 32-bit class, little-endian data, version 1.
pub const ELF_MAGIC: [u8; 7] = [0x7f, b'E', b'L', b'F', 0x01, 0x01, 0x01];

pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOBITS: u32 = 8;
pub const SHT_REL: u32 = 9;

pub const EM_386: u16 = 3;
pub const EM_ARM: u16 = 40;
pub const EM_AVR: u16 = 83;
pub const EM_MSP430: u16 = 105;

// ── Headers ───────────────────────────────────────────────────────────────────

/// Wire size: 52 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Elf32Header {
    pub e_ident: [u8; 16],
    pub e_type: Le16,
    pub e_machine: Le16,
    pub e_version: Le32,
    pub e_entry: Le32,
    pub e_phoff: Le32,
    pub e_shoff: Le32,
    pub e_flags: Le32,
    pub e_ehsize: Le16,
    pub e_phentsize: Le16,
    pub e_phnum: Le16,
    pub e_shentsize: Le16,
    pub e_shnum: Le16,
    pub e_shstrndx: Le16,
}

assert_eq_size!(Elf32Header, [u8; 52]);

impl Elf32Header {
    pub fn has_valid_ident(&self) -> bool {
        self.e_ident[..ELF_MAGIC.len()] == ELF_MAGIC
    }
}

/// Wire size: 40 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Elf32SectionHeader {
    pub sh_name: Le32,
    pub sh_type: Le32,
    pub sh_flags: Le32,
    pub sh_addr: Le32,
    pub sh_offset: Le32,
    pub sh_size: Le32,
    pub sh_link: Le32,
    pub sh_info: Le32,
    pub sh_addralign: Le32,
    pub sh_entsize: Le32,
}

assert_eq_size!(Elf32SectionHeader, [u8; 40]);

// ── Symbols and relocations ───────────────────────────────────────────────────

/// Wire size: 16 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Elf32Sym {
    /// Offset into the string table. 0 = unnamed (section symbol).
    pub st_name: Le32,
    pub st_value: Le32,
    pub st_size: Le32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: Le16,
}

assert_eq_size!(Elf32Sym, [u8; 16]);

/// Relocation without addend; the addend lives in the patched bytes.
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Elf32Rel {
    pub r_offset: Le32,
    pub r_info: Le32,
}

assert_eq_size!(Elf32Rel, [u8; 8]);

/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Elf32Rela {
    pub r_offset: Le32,
    pub r_info: Le32,
    pub r_addend: LeI32,
}

assert_eq_size!(Elf32Rela, [u8; 12]);

/// Symbol index of an `r_info` field.
pub fn r_sym(info: u32) -> u32 {
    info >> 8
}

/// Relocation type of an `r_info` field.
pub fn r_type(info: u32) -> u8 {
    (info & 0xff) as u8
}

pub fn r_info(sym: u32, ty: u8) -> u32 {
    (sym << 8) | ty as u32
}

// ── Target architecture ───────────────────────────────────────────────────────

/// Instruction set the loader relocates for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Arch {
    Avr,
    Msp430,
    #[default]
    Msp430x,
    X86,
    ArmThumb,
}

impl Arch {
    pub fn name(&self) -> &'static str {
        match self {
            Arch::Avr => "avr",
            Arch::Msp430 => "msp430",
            Arch::Msp430x => "msp430x",
            Arch::X86 => "x86",
            Arch::ArmThumb => "arm-thumb",
        }
    }

    /// Expected `e_machine` value.
    pub fn machine(&self) -> u16 {
        match self {
            Arch::Avr => EM_AVR,
            Arch::Msp430 | Arch::Msp430x => EM_MSP430,
            Arch::X86 => EM_386,
            Arch::ArmThumb => EM_ARM,
        }
    }

    /// Code and constants live in `.far.text`/`.far.rodata` (20-bit space).
    pub fn uses_far_sections(&self) -> bool {
        matches!(self, Arch::Msp430x)
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avr" => Ok(Arch::Avr),
            "msp430" => Ok(Arch::Msp430),
            "msp430x" => Ok(Arch::Msp430x),
            "x86" => Ok(Arch::X86),
            "arm-thumb" | "arm" | "thumb" => Ok(Arch::ArmThumb),
            other => Err(format!("unknown architecture '{other}'")),
        }
    }
}
