//! RAM and ROM regions a module is loaded into.
//!
//! Both are bump allocators over a byte image of the target's memory. ROM
//! may be flash: a page is erased the first time a write touches it, and
//! programming can only clear bits.

use deluge_core::config::LoaderConfig;

const ERASED: u8 = 0xff;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("{region}: {requested} bytes requested, {available} available")]
    Exhausted {
        region: &'static str,
        requested: usize,
        available: usize,
    },
    #[error("{region}: write of {len} bytes at {addr:#x} is outside the region")]
    OutOfBounds {
        region: &'static str,
        addr: u32,
        len: usize,
    },
}

#[derive(Debug, Clone)]
pub struct Region {
    name: &'static str,
    base: u32,
    bytes: Vec<u8>,
    used: usize,
    /// Erase page size; `None` for plain RAM.
    flash_page: Option<usize>,
    erased: Vec<bool>,
    erase_count: usize,
}

impl Region {
    pub fn ram(base: u32, size: u32) -> Self {
        Self::new("ram", base, size, None, 0)
    }

    pub fn rom(base: u32, size: u32, flash_page: Option<usize>) -> Self {
        let pages = flash_page.map_or(0, |p| (size as usize).div_ceil(p));
        Self::new("rom", base, size, flash_page, pages)
    }

    fn new(
        name: &'static str,
        base: u32,
        size: u32,
        flash_page: Option<usize>,
        pages: usize,
    ) -> Self {
        let fill = if flash_page.is_some() { ERASED } else { 0 };
        // a region cannot extend past the end of the address space
        let len = u64::from(size).min((1u64 << 32) - u64::from(base)) as usize;
        Self {
            name,
            base,
            bytes: vec![fill; len],
            used: 0,
            flash_page,
            erased: vec![false; pages],
            erase_count: 0,
        }
    }

    /// Reserve `len` bytes. Returns the runtime address of the first one.
    pub fn allocate(&mut self, len: usize) -> Result<u32, MemoryError> {
        let align = self.flash_page.unwrap_or(2);
        let start = self.used.next_multiple_of(align);
        let available = self.bytes.len().saturating_sub(start);
        let addr = u32::try_from(start)
            .ok()
            .and_then(|offset| self.base.checked_add(offset));
        let Some(addr) = addr.filter(|_| len <= available) else {
            return Err(MemoryError::Exhausted {
                region: self.name,
                requested: len,
                available,
            });
        };
        self.used = start + len;
        Ok(addr)
    }

    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let start = self.index(addr, data.len())?;
        let Some(page) = self.flash_page else {
            self.bytes[start..start + data.len()].copy_from_slice(data);
            return Ok(());
        };
        for (i, &b) in data.iter().enumerate() {
            let at = start + i;
            if !self.erased[at / page] {
                self.erase(at / page, page);
            }
            self.bytes[at] &= b;
        }
        Ok(())
    }

    pub fn read(&self, addr: u32, len: usize) -> Option<&[u8]> {
        let start = self.index(addr, len).ok()?;
        Some(&self.bytes[start..start + len])
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// Flash pages erased since the last reset.
    pub fn erase_count(&self) -> usize {
        self.erase_count
    }

    /// Release every allocation. Contents are left as they are.
    pub fn reset(&mut self) {
        self.used = 0;
        self.erased.iter_mut().for_each(|e| *e = false);
        self.erase_count = 0;
    }

    fn erase(&mut self, index: usize, page: usize) {
        let start = index * page;
        let end = (start + page).min(self.bytes.len());
        self.bytes[start..end].fill(ERASED);
        self.erased[index] = true;
        self.erase_count += 1;
        tracing::trace!(region = self.name, page = index, "erased flash page");
    }

    fn index(&self, addr: u32, len: usize) -> Result<usize, MemoryError> {
        let out = MemoryError::OutOfBounds {
            region: self.name,
            addr,
            len,
        };
        let start = addr.checked_sub(self.base).ok_or(out.clone())? as usize;
        if start + len > self.bytes.len() {
            return Err(out);
        }
        Ok(start)
    }
}

/// RAM for bss/data and ROM for text/rodata.
#[derive(Debug, Clone)]
pub struct LoadArena {
    pub ram: Region,
    pub rom: Region,
}

impl LoadArena {
    pub fn new(config: &LoaderConfig, flash_page: Option<usize>) -> Self {
        Self {
            ram: Region::ram(config.ram_base, config.ram_size),
            rom: Region::rom(config.rom_base, config.rom_size, flash_page),
        }
    }

    /// Nothing allocated in either region.
    pub fn is_empty(&self) -> bool {
        self.ram.used() == 0 && self.rom.used() == 0
    }

    pub fn reset(&mut self) {
        self.ram.reset();
        self.rom.reset();
    }
}
