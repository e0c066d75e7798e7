//! Builds small relocatable ELF32 objects in memory.

use zerocopy::{AsBytes, FromZeroes};

use deluge_core::elf::{
    r_info, Elf32Header, Elf32Rel, Elf32Rela, Elf32SectionHeader, Elf32Sym, Le16, Le32, LeI32,
    ELF_MAGIC, SHT_NOBITS, SHT_REL, SHT_RELA, SHT_STRTAB, SHT_SYMTAB,
};

const SHT_PROGBITS: u32 = 1;
const ET_REL: u16 = 1;
const STT_SECTION: u8 = 3;
const STB_GLOBAL_FUNC: u8 = 0x12;

struct Section {
    name: String,
    sh_type: u32,
    data: Vec<u8>,
    size: u32,
}

struct RelGroup {
    target: u16,
    with_addend: bool,
    entries: Vec<u8>,
}

/// ```ignore
/// let mut elf = ElfBuilder::new(EM_MSP430);
/// let text = elf.section(".text", &[0x30, 0x40, 0, 0]);
/// let putchar = elf.undefined("putchar");
/// elf.rela(text, 2, putchar, R_MSP430_16, 0);
/// let bytes = elf.build();
/// ```
pub struct ElfBuilder {
    machine: u16,
    sections: Vec<Section>,
    symbols: Vec<Elf32Sym>,
    strtab: Vec<u8>,
    relocations: Vec<RelGroup>,
    symtab: bool,
    strtab_section: bool,
}

impl ElfBuilder {
    pub fn new(machine: u16) -> Self {
        Self {
            machine,
            sections: Vec::new(),
            symbols: vec![Elf32Sym::new_zeroed()],
            strtab: vec![0],
            relocations: Vec::new(),
            symtab: true,
            strtab_section: true,
        }
    }

    /// Add a section with contents. Returns its header index.
    pub fn section(&mut self, name: &str, data: &[u8]) -> u16 {
        self.push(name, SHT_PROGBITS, data.to_vec(), data.len() as u32)
    }

    pub fn bss(&mut self, size: u32) -> u16 {
        self.push(".bss", SHT_NOBITS, Vec::new(), size)
    }

    /// Named symbol defined at `value` in section `shndx`. Returns its index.
    pub fn symbol(&mut self, name: &str, shndx: u16, value: u32) -> u32 {
        let st_name = self.strtab.len() as u32;
        self.strtab.extend_from_slice(name.as_bytes());
        self.strtab.push(0);
        self.push_symbol(st_name, STB_GLOBAL_FUNC, shndx, value)
    }

    /// Named symbol with no definition in this object.
    pub fn undefined(&mut self, name: &str) -> u32 {
        self.symbol(name, 0, 0)
    }

    /// Unnamed symbol standing for section `shndx`.
    pub fn section_symbol(&mut self, shndx: u16) -> u32 {
        self.push_symbol(0, STT_SECTION, shndx, 0)
    }

    pub fn rela(
        &mut self,
        target: u16,
        offset: u32,
        sym: u32,
        r_type: u8,
        addend: i32,
    ) -> &mut Self {
        let record = Elf32Rela {
            r_offset: Le32::new(offset),
            r_info: Le32::new(r_info(sym, r_type)),
            r_addend: LeI32::new(addend),
        };
        self.group(target, true).extend_from_slice(record.as_bytes());
        self
    }

    /// REL record; the addend is whatever the section holds at `offset`.
    pub fn rel(&mut self, target: u16, offset: u32, sym: u32, r_type: u8) -> &mut Self {
        let record = Elf32Rel {
            r_offset: Le32::new(offset),
            r_info: Le32::new(r_info(sym, r_type)),
        };
        self.group(target, false).extend_from_slice(record.as_bytes());
        self
    }

    pub fn without_symtab(&mut self) -> &mut Self {
        self.symtab = false;
        self
    }

    pub fn without_strtab(&mut self) -> &mut Self {
        self.strtab_section = false;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![0u8; std::mem::size_of::<Elf32Header>()];
        let mut names = vec![0u8];
        let mut headers = vec![Elf32SectionHeader::new_zeroed()];

        for s in &self.sections {
            let offset = out.len() as u32;
            out.extend_from_slice(&s.data);
            headers.push(header(add_name(&mut names, &s.name), s.sh_type, offset, s.size));
        }

        let symtab_index = (headers.len() + self.relocations.len()) as u32;
        for group in &self.relocations {
            let target = &self.sections[group.target as usize - 1].name;
            let (prefix, sh_type) = if group.with_addend {
                (".rela", SHT_RELA)
            } else {
                (".rel", SHT_REL)
            };
            let offset = out.len() as u32;
            out.extend_from_slice(&group.entries);
            let mut h = header(
                add_name(&mut names, &format!("{prefix}{target}")),
                sh_type,
                offset,
                group.entries.len() as u32,
            );
            h.sh_link = Le32::new(symtab_index);
            h.sh_info = Le32::new(group.target as u32);
            headers.push(h);
        }

        if self.symtab {
            let offset = out.len() as u32;
            for sym in &self.symbols {
                out.extend_from_slice(sym.as_bytes());
            }
            let size = out.len() as u32 - offset;
            let mut h = header(add_name(&mut names, ".symtab"), SHT_SYMTAB, offset, size);
            h.sh_link = Le32::new(symtab_index + 1);
            h.sh_entsize = Le32::new(std::mem::size_of::<Elf32Sym>() as u32);
            headers.push(h);
        }
        if self.strtab_section {
            let offset = out.len() as u32;
            out.extend_from_slice(&self.strtab);
            headers.push(header(
                add_name(&mut names, ".strtab"),
                SHT_STRTAB,
                offset,
                self.strtab.len() as u32,
            ));
        }

        let shstrndx = headers.len() as u16;
        let names_name = add_name(&mut names, ".shstrtab");
        let offset = out.len() as u32;
        out.extend_from_slice(&names);
        headers.push(header(names_name, SHT_STRTAB, offset, names.len() as u32));

        while out.len() % 4 != 0 {
            out.push(0);
        }
        let shoff = out.len() as u32;
        for h in &headers {
            out.extend_from_slice(h.as_bytes());
        }

        let mut ehdr = Elf32Header::new_zeroed();
        ehdr.e_ident[..ELF_MAGIC.len()].copy_from_slice(&ELF_MAGIC);
        ehdr.e_type = Le16::new(ET_REL);
        ehdr.e_machine = Le16::new(self.machine);
        ehdr.e_version = Le32::new(1);
        ehdr.e_shoff = Le32::new(shoff);
        ehdr.e_ehsize = Le16::new(std::mem::size_of::<Elf32Header>() as u16);
        ehdr.e_shentsize = Le16::new(std::mem::size_of::<Elf32SectionHeader>() as u16);
        ehdr.e_shnum = Le16::new(headers.len() as u16);
        ehdr.e_shstrndx = Le16::new(shstrndx);
        out[..std::mem::size_of::<Elf32Header>()].copy_from_slice(ehdr.as_bytes());
        out
    }

    fn push(&mut self, name: &str, sh_type: u32, data: Vec<u8>, size: u32) -> u16 {
        self.sections.push(Section {
            name: name.to_string(),
            sh_type,
            data,
            size,
        });
        self.sections.len() as u16
    }

    fn push_symbol(&mut self, st_name: u32, st_info: u8, shndx: u16, value: u32) -> u32 {
        self.symbols.push(Elf32Sym {
            st_name: Le32::new(st_name),
            st_value: Le32::new(value),
            st_size: Le32::new(0),
            st_info,
            st_other: 0,
            st_shndx: Le16::new(shndx),
        });
        (self.symbols.len() - 1) as u32
    }

    fn group(&mut self, target: u16, with_addend: bool) -> &mut Vec<u8> {
        let i = match self
            .relocations
            .iter()
            .position(|g| g.target == target && g.with_addend == with_addend)
        {
            Some(i) => i,
            None => {
                self.relocations.push(RelGroup {
                    target,
                    with_addend,
                    entries: Vec::new(),
                });
                self.relocations.len() - 1
            }
        };
        &mut self.relocations[i].entries
    }
}

fn add_name(names: &mut Vec<u8>, name: &str) -> u32 {
    let offset = names.len() as u32;
    names.extend_from_slice(name.as_bytes());
    names.push(0);
    offset
}

fn header(name: u32, sh_type: u32, offset: u32, size: u32) -> Elf32SectionHeader {
    let mut h = Elf32SectionHeader::new_zeroed();
    h.sh_name = Le32::new(name);
    h.sh_type = Le32::new(sh_type);
    h.sh_offset = Le32::new(offset);
    h.sh_size = Le32::new(size);
    h.sh_addralign = Le32::new(if sh_type == SHT_PROGBITS { 2 } else { 4 });
    h
}
