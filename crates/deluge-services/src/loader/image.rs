//! Parsed view of a relocatable ELF32 object.
//!
//! Only the section headers, the symbol table and the string table are held
//! in memory. Section contents and relocation tables are read on demand.

use std::io::{self, Read, Seek, SeekFrom};

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use deluge_core::elf::{Elf32Header, Elf32Rel, Elf32Rela, Elf32SectionHeader, Elf32Sym};

use super::LoadError;

/// One of the loadable sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SectionRef {
    pub index: u16,
    pub offset: u64,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RelTable {
    pub offset: u64,
    pub size: u32,
    /// `.rela.*`: addend stored in the record rather than in the section.
    pub with_addend: bool,
}

impl RelTable {
    fn entry_size(&self) -> usize {
        if self.with_addend {
            std::mem::size_of::<Elf32Rela>()
        } else {
            std::mem::size_of::<Elf32Rel>()
        }
    }
}

/// A relocation record, REL or RELA.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawRelocation {
    pub offset: u32,
    pub info: u32,
    pub addend: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Text,
    Rodata,
    Data,
    Bss,
}

impl Kind {
    pub fn name(self) -> &'static str {
        match self {
            Kind::Text => "text",
            Kind::Rodata => "rodata",
            Kind::Data => "data",
            Kind::Bss => "bss",
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ElfImage {
    pub machine: u16,
    pub text: Option<SectionRef>,
    pub rodata: Option<SectionRef>,
    pub data: Option<SectionRef>,
    pub bss: Option<SectionRef>,
    pub text_rel: Option<RelTable>,
    pub rodata_rel: Option<RelTable>,
    pub data_rel: Option<RelTable>,
    symbols: Vec<Elf32Sym>,
    strtab: Vec<u8>,
}

enum Slot {
    Section(Kind),
    Relocations(Kind, bool),
    Symtab,
    Strtab,
}

/// Map a section name onto the loader's fixed set.
fn classify(name: &[u8], far: bool) -> Option<Slot> {
    let (text, rodata): (&[u8], &[u8]) = if far {
        (b".far.text", b".far.rodata")
    } else {
        (b".text", b".rodata")
    };
    let kind_of = |n: &[u8]| match n {
        n if n == text => Some(Kind::Text),
        n if n == rodata => Some(Kind::Rodata),
        b".data" => Some(Kind::Data),
        b".bss" => Some(Kind::Bss),
        _ => None,
    };

    match name {
        b".symtab" => Some(Slot::Symtab),
        b".strtab" => Some(Slot::Strtab),
        _ => {
            if let Some(target) = name.strip_prefix(b".rela") {
                kind_of(target).map(|k| Slot::Relocations(k, true))
            } else if let Some(target) = name.strip_prefix(b".rel") {
                kind_of(target).map(|k| Slot::Relocations(k, false))
            } else {
                kind_of(name).map(Slot::Section)
            }
        }
    }
}

/// NUL-terminated string at `offset`, or empty when out of range.
fn c_str(table: &[u8], offset: usize) -> &[u8] {
    let tail = table.get(offset..).unwrap_or_default();
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    &tail[..end]
}

fn read_struct<T, F>(file: &mut F, offset: u64) -> io::Result<T>
where
    T: AsBytes + FromBytes + FromZeroes,
    F: Read + Seek,
{
    let mut value = T::new_zeroed();
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(value.as_bytes_mut())?;
    Ok(value)
}

pub(crate) fn read_bytes<F: Read + Seek>(
    file: &mut F,
    offset: u64,
    len: usize,
) -> io::Result<Vec<u8>> {
    let file_len = file.seek(SeekFrom::End(0))?;
    if offset.saturating_add(len as u64) > file_len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("{len} bytes at {offset:#x} run past the end of the file ({file_len} bytes)"),
        ));
    }
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
    buf.resize(len, 0);
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

impl ElfImage {
    /// Read the header and section table. `far` selects `.far.text`/`.far.rodata`.
    pub fn parse<F: Read + Seek>(file: &mut F, far: bool) -> Result<Self, LoadError> {
        let header: Elf32Header = match read_struct(file, 0) {
            Ok(h) => h,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(LoadError::BadElfHeader)
            }
            Err(e) => return Err(e.into()),
        };
        if !header.has_valid_ident() {
            return Err(LoadError::BadElfHeader);
        }

        let shoff = header.e_shoff.get() as u64;
        let shentsize = header.e_shentsize.get() as u64;
        let shnum = header.e_shnum.get();
        let shstrndx = header.e_shstrndx.get() as u64;

        let names_hdr: Elf32SectionHeader = read_struct(file, shoff + shentsize * shstrndx)?;
        let names = read_bytes(
            file,
            names_hdr.sh_offset.get() as u64,
            names_hdr.sh_size.get() as usize,
        )?;

        let mut image = ElfImage {
            machine: header.e_machine.get(),
            ..Default::default()
        };
        let mut symtab = None;
        let mut strtab = None;

        for index in 0..shnum {
            let sh: Elf32SectionHeader = read_struct(file, shoff + shentsize * index as u64)?;
            let name = c_str(&names, sh.sh_name.get() as usize);
            let section = SectionRef {
                index,
                offset: sh.sh_offset.get() as u64,
                size: sh.sh_size.get(),
            };
            match classify(name, far) {
                Some(Slot::Section(kind)) => *image.section_mut(kind) = Some(section),
                Some(Slot::Relocations(kind, with_addend)) => {
                    let table = RelTable {
                        offset: section.offset,
                        size: section.size,
                        with_addend,
                    };
                    match kind {
                        Kind::Text => image.text_rel = Some(table),
                        Kind::Rodata => image.rodata_rel = Some(table),
                        Kind::Data => image.data_rel = Some(table),
                        Kind::Bss => {}
                    }
                }
                Some(Slot::Symtab) => symtab = Some(section),
                Some(Slot::Strtab) => strtab = Some(section),
                None => {
                    tracing::trace!(name = %String::from_utf8_lossy(name), "ignoring section");
                }
            }
        }

        let symtab = symtab.filter(|s| s.size > 0).ok_or(LoadError::NoSymtab)?;
        let strtab = strtab.filter(|s| s.size > 0).ok_or(LoadError::NoStrtab)?;
        if image.text.map_or(true, |t| t.size == 0) {
            return Err(LoadError::NoText);
        }

        let raw = read_bytes(file, symtab.offset, symtab.size as usize)?;
        image.symbols = raw
            .chunks_exact(std::mem::size_of::<Elf32Sym>())
            .filter_map(Elf32Sym::read_from)
            .collect();
        image.strtab = read_bytes(file, strtab.offset, strtab.size as usize)?;
        Ok(image)
    }

    pub fn section(&self, kind: Kind) -> Option<SectionRef> {
        match kind {
            Kind::Text => self.text,
            Kind::Rodata => self.rodata,
            Kind::Data => self.data,
            Kind::Bss => self.bss,
        }
    }

    fn section_mut(&mut self, kind: Kind) -> &mut Option<SectionRef> {
        match kind {
            Kind::Text => &mut self.text,
            Kind::Rodata => &mut self.rodata,
            Kind::Data => &mut self.data,
            Kind::Bss => &mut self.bss,
        }
    }

    pub fn relocations(&self, kind: Kind) -> Option<RelTable> {
        match kind {
            Kind::Text => self.text_rel,
            Kind::Rodata => self.rodata_rel,
            Kind::Data => self.data_rel,
            Kind::Bss => None,
        }
    }

    /// Which loadable section, if any, has header index `shndx`.
    pub fn kind_of(&self, shndx: u16) -> Option<Kind> {
        [Kind::Text, Kind::Rodata, Kind::Data, Kind::Bss]
            .into_iter()
            .find(|&k| self.section(k).is_some_and(|s| s.index == shndx && shndx != 0))
    }

    pub fn symbol(&self, index: u32) -> Option<&Elf32Sym> {
        self.symbols.get(index as usize)
    }

    pub fn symbol_name(&self, sym: &Elf32Sym) -> &[u8] {
        c_str(&self.strtab, sym.st_name.get() as usize)
    }

    /// First named symbol called `name`: its defining section and value.
    pub fn find_local_symbol(&self, name: &[u8]) -> Option<(Kind, u32)> {
        let sym = self
            .symbols
            .iter()
            .find(|s| s.st_name.get() != 0 && self.symbol_name(s) == name)?;
        Some((self.kind_of(sym.st_shndx.get())?, sym.st_value.get()))
    }

    pub fn read_relocations<F: Read + Seek>(
        &self,
        file: &mut F,
        table: RelTable,
    ) -> io::Result<Vec<RawRelocation>> {
        let raw = read_bytes(file, table.offset, table.size as usize)?;
        let records = raw.chunks_exact(table.entry_size()).filter_map(|chunk| {
            if table.with_addend {
                Elf32Rela::read_from(chunk).map(|r| RawRelocation {
                    offset: r.r_offset.get(),
                    info: r.r_info.get(),
                    addend: Some(r.r_addend.get()),
                })
            } else {
                Elf32Rel::read_from(chunk).map(|r| RawRelocation {
                    offset: r.r_offset.get(),
                    info: r.r_info.get(),
                    addend: None,
                })
            }
        });
        Ok(records.collect())
    }
}
