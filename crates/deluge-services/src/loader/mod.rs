//! Relocating loader for ELF32 objects.
//!
//! An object is linked against the node's global symbols and copied into
//! the load arena: `.text`/`.rodata` to ROM, `.bss`/`.data` to RAM. The
//! object file itself is only read; relocations are applied to staged
//! copies of its sections.

mod image;
mod memory;
mod symbols;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

use std::io::{Read, Seek};

use deluge_core::config::LoaderConfig;
use deluge_core::elf::{self, Arch};

use crate::arch::{self, RelocError, Relocation, Relocator, SectionImage};
use image::{read_bytes, ElfImage, Kind};

pub use memory::{LoadArena, MemoryError, Region};
pub use symbols::{SymbolMap, SymbolMapError, SymbolResolver};

/// Symbol a module exports to be started after loading.
pub const START_SYMBOL: &str = "autostart_processes";

/// Why a load failed. Success is reported as code 0.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Bad ELF header")]
    BadElfHeader,
    #[error("No symbol table")]
    NoSymtab,
    #[error("No string table")]
    NoStrtab,
    #[error("No text segment")]
    NoText,
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("Unknown segment")]
    SegmentNotFound,
    #[error("No starting point")]
    NoStartPoint,
    #[error("Bad relocation in {section}: {source}")]
    BadRelocation {
        section: &'static str,
        source: RelocError,
    },
    #[error("Out of memory: {0}")]
    OutOfMemory(#[from] MemoryError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoadError {
    pub fn code(&self) -> u8 {
        match self {
            LoadError::BadElfHeader => 1,
            LoadError::NoSymtab => 2,
            LoadError::NoStrtab => 3,
            LoadError::NoText => 4,
            LoadError::SymbolNotFound(_) => 5,
            LoadError::SegmentNotFound => 6,
            LoadError::NoStartPoint => 7,
            LoadError::BadRelocation { .. } => 8,
            LoadError::OutOfMemory(_) => 9,
            LoadError::Io(_) => 10,
        }
    }
}

/// Where a module ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub text: u32,
    pub rodata: Option<u32>,
    pub data: u32,
    pub bss: u32,
    /// Address of the start symbol.
    pub start: u32,
    pub relocations: usize,
    /// Relocations that could not be applied and were left unpatched.
    pub skipped: usize,
}

/// Runtime base address of each loaded section.
#[derive(Debug, Clone, Copy)]
struct Bases {
    text: u32,
    rodata: Option<u32>,
    data: u32,
    bss: u32,
}

impl Bases {
    fn of(&self, kind: Kind) -> Option<u32> {
        match kind {
            Kind::Text => Some(self.text),
            Kind::Rodata => self.rodata,
            Kind::Data => Some(self.data),
            Kind::Bss => Some(self.bss),
        }
    }
}

#[derive(Default)]
struct Tally {
    applied: usize,
    skipped: usize,
}

pub struct ElfLoader {
    relocator: Box<dyn Relocator>,
    arena: LoadArena,
    symbols: Box<dyn SymbolResolver>,
    strict: bool,
}

impl ElfLoader {
    pub fn new(config: &LoaderConfig, symbols: impl SymbolResolver + 'static) -> Self {
        let relocator = arch::for_arch(config.arch);
        let arena = LoadArena::new(config, relocator.rom_page_size());
        Self {
            relocator,
            arena,
            symbols: Box::new(symbols),
            strict: config.strict_relocations,
        }
    }

    pub fn arch(&self) -> Arch {
        self.relocator.arch()
    }

    pub fn arena(&self) -> &LoadArena {
        &self.arena
    }

    /// Forget every module loaded so far.
    pub fn reset(&mut self) {
        self.arena.reset();
    }

    /// Link and load one object. Memory taken by a failed load is not
    /// released until [`reset`](Self::reset).
    pub fn load<F: Read + Seek>(&mut self, file: &mut F) -> Result<LoadedModule, LoadError> {
        let arch = self.relocator.arch();
        let image = ElfImage::parse(file, arch.uses_far_sections())?;
        if image.machine != arch.machine() {
            tracing::warn!(%arch, machine = image.machine, "object built for another machine");
        }

        let size = |kind| image.section(kind).map_or(0, |s| s.size as usize);
        let bss_size = size(Kind::Bss);
        let ram = self.arena.ram.allocate(bss_size + size(Kind::Data))?;
        let text_size = size(Kind::Text);
        let text = self.arena.rom.allocate(text_size + size(Kind::Rodata))?;
        let rodata = image.rodata.map(|_| text.wrapping_add(text_size as u32));
        let bases = Bases {
            text,
            rodata,
            data: ram + bss_size as u32,
            bss: ram,
        };

        let mut tally = Tally::default();
        let mut staged = Vec::with_capacity(3);
        for kind in [Kind::Text, Kind::Rodata, Kind::Data] {
            let (Some(section), Some(base)) = (image.section(kind), bases.of(kind)) else {
                continue;
            };
            let bytes = read_bytes(file, section.offset, section.size as usize)?;
            let mut staging = SectionImage::new(section.offset, base, bytes);
            self.relocate_section(file, &image, kind, &mut staging, &bases, &mut tally)?;
            staged.push((kind, staging));
        }

        for (kind, section) in &staged {
            match kind {
                Kind::Data => self.arena.ram.write(section.base, &section.bytes)?,
                _ => self.arena.rom.write(section.base, &section.bytes)?,
            }
        }
        self.arena.ram.write(bases.bss, &vec![0; bss_size])?;

        let start = image
            .find_local_symbol(START_SYMBOL.as_bytes())
            .and_then(|(kind, value)| Some(bases.of(kind)?.wrapping_add(value)))
            .ok_or(LoadError::NoStartPoint)?;

        tracing::info!(
            text = format_args!("{:#x}", bases.text),
            data = format_args!("{:#x}", bases.data),
            start = format_args!("{start:#x}"),
            relocations = tally.applied,
            skipped = tally.skipped,
            "module loaded"
        );
        Ok(LoadedModule {
            text: bases.text,
            rodata: bases.rodata,
            data: bases.data,
            bss: bases.bss,
            start,
            relocations: tally.applied,
            skipped: tally.skipped,
        })
    }

    fn relocate_section<F: Read + Seek>(
        &self,
        file: &mut F,
        image: &ElfImage,
        kind: Kind,
        section: &mut SectionImage,
        bases: &Bases,
        tally: &mut Tally,
    ) -> Result<(), LoadError> {
        let Some(table) = image.relocations(kind) else {
            return Ok(());
        };
        for raw in image.read_relocations(file, table)? {
            let r_type = elf::r_type(raw.info);
            let symbol = self.resolve(image, elf::r_sym(raw.info), bases)?;
            let addend = raw
                .addend
                .unwrap_or_else(|| self.relocator.implicit_addend(section, raw.offset, r_type));
            let rel = Relocation {
                offset: raw.offset,
                r_type,
                addend,
            };
            match self.relocator.relocate(section, &rel, symbol) {
                Ok(()) => tally.applied += 1,
                Err(source) if self.strict => {
                    return Err(LoadError::BadRelocation {
                        section: kind.name(),
                        source,
                    })
                }
                Err(e) => {
                    tracing::warn!(
                        section = kind.name(),
                        offset = raw.offset,
                        error = %e,
                        "relocation skipped"
                    );
                    tally.skipped += 1;
                }
            }
        }
        Ok(())
    }

    /// Address a relocation against symbol `index` refers to.
    ///
    /// Named symbols are looked up in the global table, then among this
    /// object's own definitions, and finally fall back to the base of the
    /// section they are attached to. Unnamed symbols stand for a section.
    fn resolve(&self, image: &ElfImage, index: u32, bases: &Bases) -> Result<u32, LoadError> {
        let sym = image
            .symbol(index)
            .ok_or_else(|| LoadError::SymbolNotFound(format!("#{index}")))?;
        let own_section = image.kind_of(sym.st_shndx.get()).and_then(|k| bases.of(k));
        if sym.st_name.get() == 0 {
            return own_section.ok_or(LoadError::SegmentNotFound);
        }

        let name = image.symbol_name(sym);
        let name_str = String::from_utf8_lossy(name);
        if let Some(addr) = self.symbols.lookup(&name_str) {
            return Ok(addr);
        }
        if let Some((kind, value)) = image.find_local_symbol(name) {
            if let Some(base) = bases.of(kind) {
                return Ok(base.wrapping_add(value));
            }
        }
        own_section.ok_or_else(|| {
            tracing::debug!(symbol = %name_str, "unresolved symbol");
            LoadError::SymbolNotFound(name_str.into_owned())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ElfBuilder;
    use super::*;
    use crate::arch::msp430::{R_MSP430_16, R_MSP430_32};
    use deluge_core::elf::EM_MSP430;
    use std::io::Cursor;

    fn msp430() -> LoaderConfig {
        LoaderConfig {
            arch: Arch::Msp430,
            ram_base: 0x1100,
            ram_size: 1024,
            rom_base: 0x8000,
            rom_size: 4096,
            ..Default::default()
        }
    }

    /// `.text` calling a global, reading `.data`, and a start symbol in `.data`.
    fn module() -> ElfBuilder {
        let mut elf = ElfBuilder::new(EM_MSP430);
        let text = elf.section(".text", &[0xb0, 0x12, 0, 0, 0x1f, 0x42, 0, 0]);
        let data = elf.section(".data", &[1, 2, 3, 4, 0, 0, 0, 0]);
        elf.bss(6);
        let putchar = elf.undefined("putchar");
        let data_sym = elf.section_symbol(data);
        elf.symbol(START_SYMBOL, data, 4);
        elf.rela(text, 2, putchar, R_MSP430_16, 0)
            .rela(text, 6, data_sym, R_MSP430_16, 2);
        elf
    }

    fn symbols() -> SymbolMap {
        let mut map = SymbolMap::new();
        map.insert("putchar", 0x4a3c);
        map
    }

    #[test]
    fn loads_and_links_module() {
        let mut loader = ElfLoader::new(&msp430(), symbols());
        let module = loader.load(&mut Cursor::new(module().build())).unwrap();

        assert_eq!(module.bss, 0x1100);
        assert_eq!(module.data, 0x1106);
        assert_eq!(module.text, 0x8000);
        assert_eq!(module.start, 0x110a);
        assert_eq!(module.relocations, 2);

        let rom = loader.arena().rom.read(0x8000, 8).unwrap();
        assert_eq!(rom, &[0xb0, 0x12, 0x3c, 0x4a, 0x1f, 0x42, 0x08, 0x11]);
        let ram = loader.arena().ram.read(0x1100, 10).unwrap();
        assert_eq!(ram, &[0, 0, 0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn bad_magic_allocates_nothing() {
        let mut bytes = module().build();
        bytes[1] = b'X';
        let mut loader = ElfLoader::new(&msp430(), symbols());
        let err = loader.load(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, LoadError::BadElfHeader));
        assert_eq!(err.code(), 1);
        assert!(loader.arena().is_empty());
    }

    #[test]
    fn truncated_header_is_bad_header() {
        let mut loader = ElfLoader::new(&msp430(), symbols());
        let err = loader.load(&mut Cursor::new(vec![0x7f, b'E', b'L'])).unwrap_err();
        assert!(matches!(err, LoadError::BadElfHeader));
    }

    #[test]
    fn missing_tables_and_text() {
        let mut loader = ElfLoader::new(&msp430(), symbols());

        let bytes = module().without_symtab().build();
        assert_eq!(loader.load(&mut Cursor::new(bytes)).unwrap_err().code(), 2);

        let bytes = module().without_strtab().build();
        assert_eq!(loader.load(&mut Cursor::new(bytes)).unwrap_err().code(), 3);

        let mut elf = ElfBuilder::new(EM_MSP430);
        elf.section(".data", &[0; 4]);
        elf.symbol("x", 1, 0);
        assert_eq!(loader.load(&mut Cursor::new(elf.build())).unwrap_err().code(), 4);
    }

    #[test]
    fn unknown_global_is_reported_by_name() {
        let mut loader = ElfLoader::new(&msp430(), SymbolMap::new());
        let err = loader.load(&mut Cursor::new(module().build())).unwrap_err();
        assert!(matches!(&err, LoadError::SymbolNotFound(name) if name == "putchar"));
        assert_eq!(err.to_string(), "Symbol not found: putchar");
    }

    #[test]
    fn section_symbol_outside_loaded_sections() {
        let mut elf = ElfBuilder::new(EM_MSP430);
        let text = elf.section(".text", &[0; 4]);
        let comment = elf.section(".comment", b"gcc\0");
        let sym = elf.section_symbol(comment);
        elf.rela(text, 0, sym, R_MSP430_16, 0);
        let mut loader = ElfLoader::new(&msp430(), symbols());
        let err = loader.load(&mut Cursor::new(elf.build())).unwrap_err();
        assert!(matches!(err, LoadError::SegmentNotFound));
    }

    #[test]
    fn local_definition_used_when_not_global() {
        let mut elf = ElfBuilder::new(EM_MSP430);
        let text = elf.section(".text", &[0; 8]);
        let helper = elf.symbol("helper", text, 6);
        elf.symbol(START_SYMBOL, text, 0);
        elf.rela(text, 0, helper, R_MSP430_16, 0);
        let mut loader = ElfLoader::new(&msp430(), SymbolMap::new());
        let module = loader.load(&mut Cursor::new(elf.build())).unwrap();
        assert_eq!(module.start, 0x8000);
        assert_eq!(loader.arena().rom.read(0x8000, 2).unwrap(), &[0x06, 0x80]);
    }

    #[test]
    fn missing_start_symbol() {
        let mut elf = ElfBuilder::new(EM_MSP430);
        let text = elf.section(".text", &[0; 4]);
        elf.symbol("main", text, 0);
        let mut loader = ElfLoader::new(&msp430(), symbols());
        let err = loader.load(&mut Cursor::new(elf.build())).unwrap_err();
        assert!(matches!(err, LoadError::NoStartPoint));
        assert_eq!(err.to_string(), "No starting point");
    }

    #[test]
    fn rel_tables_take_addend_from_section() {
        let mut elf = ElfBuilder::new(EM_MSP430);
        let text = elf.section(".text", &[0x10, 0, 0, 0]);
        let data = elf.section(".data", &[0; 2]);
        let data_sym = elf.section_symbol(data);
        elf.symbol(START_SYMBOL, text, 0);
        elf.rel(text, 0, data_sym, R_MSP430_32);
        let mut loader = ElfLoader::new(&msp430(), symbols());
        loader.load(&mut Cursor::new(elf.build())).unwrap();
        assert_eq!(loader.arena().rom.read(0x8000, 4).unwrap(), &[0x10, 0x11, 0, 0]);
    }

    #[test]
    fn unsupported_relocation_skipped_or_fatal() {
        let mut elf = module();
        let text = 1;
        let putchar = 1;
        elf.rela(text, 0, putchar, 22, 0);

        let mut loader = ElfLoader::new(&msp430(), symbols());
        let module = loader.load(&mut Cursor::new(elf.build())).unwrap();
        assert_eq!(module.skipped, 1);

        let strict = LoaderConfig {
            strict_relocations: true,
            ..msp430()
        };
        let mut loader = ElfLoader::new(&strict, symbols());
        let err = loader.load(&mut Cursor::new(elf.build())).unwrap_err();
        assert!(matches!(
            err,
            LoadError::BadRelocation {
                section: "text",
                source: RelocError::Unsupported(22)
            }
        ));
        assert_eq!(err.code(), 8);
    }

    #[test]
    fn object_file_is_not_modified_and_reloads_identically() {
        let bytes = module().build();
        let mut file = Cursor::new(bytes.clone());
        let mut loader = ElfLoader::new(&msp430(), symbols());

        let first = loader.load(&mut file).unwrap();
        let rom = loader.arena().rom.read(0x8000, 8).unwrap().to_vec();
        loader.reset();
        let second = loader.load(&mut file).unwrap();

        assert_eq!(first, second);
        assert_eq!(loader.arena().rom.read(0x8000, 8).unwrap(), rom.as_slice());
        assert_eq!(file.into_inner(), bytes);
    }

    #[test]
    fn out_of_ram() {
        let tiny = LoaderConfig {
            ram_size: 8,
            ..msp430()
        };
        let mut loader = ElfLoader::new(&tiny, symbols());
        let err = loader.load(&mut Cursor::new(module().build())).unwrap_err();
        assert!(matches!(
            err,
            LoadError::OutOfMemory(MemoryError::Exhausted { region: "ram", .. })
        ));
        assert_eq!(err.code(), 9);
    }
}
