use crate::*;

use deluge_core::config::LoaderConfig;
use deluge_core::elf::{Arch, EM_ARM, EM_AVR, EM_MSP430};
use deluge_services::arch::arm::{R_ARM_ABS32, R_ARM_THM_CALL};
use deluge_services::arch::avr::{R_AVR_13_PCREL, R_AVR_HI8_LDI, R_AVR_LO8_LDI};
use deluge_services::arch::msp430::{R_MSP430_16, R_MSP430_32};
use deluge_services::arch::msp430x::{R_MSP430X_S, R_MSP430X_SRC};
use deluge_services::loader::testing::ElfBuilder;
use deluge_services::loader::START_SYMBOL;
use deluge_services::{ElfLoader, LoadError, SymbolMap};

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

fn rom(loader: &ElfLoader, addr: u32, len: usize) -> Vec<u8> {
    loader.arena().rom.read(addr, len).expect("rom range").to_vec()
}

fn ram(loader: &ElfLoader, addr: u32, len: usize) -> Vec<u8> {
    loader.arena().ram.read(addr, len).expect("ram range").to_vec()
}

/// A small MSP430 process: code calling into the kernel and a process
/// structure in `.data` pointing back at it.
fn msp430_process() -> Vec<u8> {
    let mut elf = ElfBuilder::new(EM_MSP430);
    // call #0; ret
    let text = elf.section(".text", &[0xb0, 0x12, 0x00, 0x00, 0x30, 0x41]);
    let data = elf.section(".data", &[0; 4]);
    elf.bss(16);
    let thread = elf.symbol("hello_thread", text, 0);
    let yield_ = elf.undefined("process_yield");
    elf.symbol(START_SYMBOL, data, 0);
    elf.rela(text, 2, yield_, R_MSP430_16, 0);
    elf.rela(data, 0, thread, R_MSP430_16, 0);
    elf.build()
}

fn kernel_symbols() -> SymbolMap {
    let mut symbols = SymbolMap::new();
    symbols.insert("process_yield", 0x4c20);
    symbols
}

#[test]
fn msp430_process_is_linked_into_rom_and_ram() {
    let mut loader = ElfLoader::new(&msp430(), kernel_symbols());
    let module = loader.load(&mut Cursor::new(msp430_process())).unwrap();

    assert_eq!(module.text, 0x8000);
    assert_eq!(module.bss, 0x1100);
    assert_eq!(module.data, 0x1110);
    assert_eq!(module.start, 0x1110);
    assert_eq!(module.relocations, 2);
    assert_eq!(rom(&loader, 0x8000, 6), [0xb0, 0x12, 0x20, 0x4c, 0x30, 0x41]);
    assert_eq!(ram(&loader, 0x1110, 4), [0x00, 0x80, 0x00, 0x00]);
    assert_eq!(ram(&loader, 0x1100, 16), [0; 16]);
}

#[test]
fn disseminated_object_loads_like_the_original() {
    let original = msp430_process();
    let mut sim = Sim::new(11);
    sim.seed(&original, 1);
    let joiner = sim.join();
    assert!(sim.run_until(Duration::from_secs(600), |s| s.has(joiner, 1)));

    // the received file is padded to whole pages
    let received = sim.stored(joiner);
    assert_eq!(received.len() % 256, 0);
    assert!(received.len() >= original.len());

    let mut a = ElfLoader::new(&msp430(), kernel_symbols());
    let mut b = ElfLoader::new(&msp430(), kernel_symbols());
    let from_original = a.load(&mut Cursor::new(original)).unwrap();
    let from_received = b.load(&mut Cursor::new(received)).unwrap();

    assert_eq!(from_original, from_received);
    assert_eq!(rom(&a, 0x8000, 6), rom(&b, 0x8000, 6));
    assert_eq!(ram(&a, 0x1100, 20), ram(&b, 0x1100, 20));
}

#[test]
fn consecutive_modules_take_fresh_flash_segments() {
    let mut loader = ElfLoader::new(&msp430(), kernel_symbols());
    let first = loader.load(&mut Cursor::new(msp430_process())).unwrap();
    let second = loader.load(&mut Cursor::new(msp430_process())).unwrap();

    assert_eq!(first.text, 0x8000);
    assert_eq!(second.text, 0x8200);
    assert_eq!(second.bss, 0x1114);
    assert_eq!(loader.arena().rom.erase_count(), 2);

    loader.reset();
    let again = loader.load(&mut Cursor::new(msp430_process())).unwrap();
    assert_eq!(again, first);
}

#[test]
fn msp430x_links_far_sections() {
    let mut elf = ElfBuilder::new(EM_MSP430);
    // near .text is not part of an MSP430X module
    elf.section(".text", &[0xff; 8]);
    // mova &abs20, r12; ret
    let text = elf.section(".far.text", &[0x00, 0x00, 0x00, 0x00, 0x30, 0x41]);
    let rodata = elf.section(".far.rodata", b"hi\0\0");
    let data = elf.section(".data", &[0; 4]);
    let greeting = elf.section_symbol(rodata);
    let main = elf.symbol("main", text, 4);
    elf.symbol(START_SYMBOL, data, 0);
    elf.rela(text, 0, greeting, R_MSP430X_S, 2);
    elf.rela(data, 0, main, R_MSP430_32, 0);

    let config = LoaderConfig {
        arch: Arch::Msp430x,
        ..Default::default()
    };
    let mut loader = ElfLoader::new(&config, SymbolMap::new());
    let module = loader.load(&mut Cursor::new(elf.build())).unwrap();

    // rodata follows text in the same flash segment
    assert_eq!(module.text, 0x10000);
    assert_eq!(module.rodata, Some(0x10006));
    assert_eq!(loader.arena().rom.erase_count(), 1);
    assert_eq!(rom(&loader, 0x10000, 6), [0x00, 0x01, 0x08, 0x00, 0x30, 0x41]);
    assert_eq!(rom(&loader, 0x10006, 4), *b"hi\0\0");
    assert_eq!(ram(&loader, module.data, 4), [0x04, 0x00, 0x01, 0x00]);
}

#[test]
fn msp430x_object_without_far_text_has_no_text() {
    let mut elf = ElfBuilder::new(EM_MSP430);
    let text = elf.section(".text", &[0x30, 0x41]);
    elf.symbol(START_SYMBOL, text, 0);

    let config = LoaderConfig {
        arch: Arch::Msp430x,
        ..Default::default()
    };
    let mut loader = ElfLoader::new(&config, SymbolMap::new());
    let err = loader.load(&mut Cursor::new(elf.build())).unwrap_err();
    assert!(matches!(err, LoadError::NoText));
    assert_eq!(err.code(), 4);
}

#[test]
fn avr_call_and_data_address() {
    let mut elf = ElfBuilder::new(EM_AVR);
    // rcall helper; ldi r24, lo8(buf+1); ldi r25, hi8(buf+1); ret
    let text = elf.section(".text", &[0x00, 0xd0, 0x80, 0xe0, 0x90, 0xe0, 0x08, 0x95]);
    let data = elf.section(".data", &[0xaa, 0xbb]);
    let helper = elf.symbol("helper", text, 6);
    let buf = elf.section_symbol(data);
    elf.symbol(START_SYMBOL, data, 0);
    elf.rela(text, 0, helper, R_AVR_13_PCREL, 0);
    elf.rela(text, 2, buf, R_AVR_LO8_LDI, 1);
    elf.rela(text, 4, buf, R_AVR_HI8_LDI, 1);

    let config = LoaderConfig {
        arch: Arch::Avr,
        ram_base: 0x0200,
        ram_size: 2048,
        rom_base: 0x1000,
        rom_size: 8192,
        ..Default::default()
    };
    let mut loader = ElfLoader::new(&config, SymbolMap::new());
    let module = loader.load(&mut Cursor::new(elf.build())).unwrap();

    assert_eq!(module.data, 0x0200);
    assert_eq!(
        rom(&loader, 0x1000, 8),
        [0x02, 0xd0, 0x81, 0xe0, 0x92, 0xe0, 0x08, 0x95]
    );
    assert_eq!(ram(&loader, 0x0200, 2), [0xaa, 0xbb]);
}

#[test]
fn arm_thumb_call_into_kernel() {
    let mut elf = ElfBuilder::new(EM_ARM);
    // bl printf; nop; nop
    let text = elf.section(".text", &[0x00, 0xf0, 0x00, 0xf8, 0x00, 0xbf, 0x00, 0xbf]);
    let data = elf.section(".data", &[0; 4]);
    let printf = elf.undefined("printf");
    let main = elf.symbol("main", text, 5);
    elf.symbol(START_SYMBOL, data, 0);
    elf.rela(text, 0, printf, R_ARM_THM_CALL, -4);
    elf.rela(data, 0, main, R_ARM_ABS32, 0);

    let mut symbols = SymbolMap::new();
    symbols.insert("printf", 0x0800_1001);
    let config = LoaderConfig {
        arch: Arch::ArmThumb,
        ram_base: 0x2000_0000,
        ram_size: 4096,
        rom_base: 0x0800_0000,
        rom_size: 16 * 1024,
        ..Default::default()
    };
    let mut loader = ElfLoader::new(&config, symbols);
    let module = loader.load(&mut Cursor::new(elf.build())).unwrap();

    assert_eq!(module.start, 0x2000_0000);
    assert_eq!(rom(&loader, 0x0800_0000, 4), [0x00, 0xf0, 0xfe, 0xff]);
    assert_eq!(ram(&loader, 0x2000_0000, 4), 0x0800_0005u32.to_le_bytes());
}

#[test]
fn unknown_kernel_symbol_is_reported_by_name() {
    let mut loader = ElfLoader::new(&msp430(), SymbolMap::new());
    let err = loader.load(&mut Cursor::new(msp430_process())).unwrap_err();
    assert!(matches!(&err, LoadError::SymbolNotFound(name) if name == "process_yield"));
    assert_eq!(err.code(), 5);
    assert_eq!(err.to_string(), "Symbol not found: process_yield");
}

#[test]
fn object_without_process_list_has_no_start_point() {
    let mut elf = ElfBuilder::new(EM_MSP430);
    let text = elf.section(".text", &[0x30, 0x41]);
    elf.symbol("main", text, 0);

    let mut loader = ElfLoader::new(&msp430(), SymbolMap::new());
    let err = loader.load(&mut Cursor::new(elf.build())).unwrap_err();
    assert!(matches!(err, LoadError::NoStartPoint));
    assert_eq!(err.code(), 7);
}

#[test]
fn corrupt_object_leaves_memory_untouched() {
    let mut bytes = msp430_process();
    bytes[1] = b'X';

    let mut loader = ElfLoader::new(&msp430(), kernel_symbols());
    let err = loader.load(&mut Cursor::new(bytes)).unwrap_err();
    assert!(matches!(err, LoadError::BadElfHeader));
    assert_eq!(err.code(), 1);
    assert!(loader.arena().is_empty());
}

#[test]
fn strict_mode_rejects_unknown_relocation() {
    let mut elf = ElfBuilder::new(EM_MSP430);
    let text = elf.section(".text", &[0; 8]);
    let data = elf.section(".data", &[0; 2]);
    let sym = elf.section_symbol(text);
    elf.symbol(START_SYMBOL, data, 0);
    // an MSP430X type in a plain MSP430 object
    elf.rela(text, 0, sym, R_MSP430X_S, 0);

    let mut lenient = ElfLoader::new(&msp430(), SymbolMap::new());
    let module = lenient.load(&mut Cursor::new(elf.build())).unwrap();
    assert_eq!((module.relocations, module.skipped), (0, 1));

    let strict = LoaderConfig {
        strict_relocations: true,
        ..msp430()
    };
    let mut loader = ElfLoader::new(&strict, SymbolMap::new());
    let err = loader.load(&mut Cursor::new(elf.build())).unwrap_err();
    assert!(matches!(err, LoadError::BadRelocation { section: "text", .. }));
    assert_eq!(err.code(), 8);
}

#[test]
fn relocation_offset_past_address_space_is_rejected() {
    let mut elf = ElfBuilder::new(EM_MSP430);
    let text = elf.section(".far.text", &[0; 8]);
    let data = elf.section(".data", &[0; 2]);
    let sym = elf.section_symbol(text);
    elf.symbol(START_SYMBOL, data, 0);
    elf.rel(text, 0xffff_fffe, sym, R_MSP430X_SRC);

    let lenient = LoaderConfig {
        arch: Arch::Msp430x,
        ..Default::default()
    };
    let mut loader = ElfLoader::new(&lenient, SymbolMap::new());
    let module = loader.load(&mut Cursor::new(elf.build())).unwrap();
    assert_eq!((module.relocations, module.skipped), (0, 1));
    assert_eq!(rom(&loader, module.text, 8), [0; 8]);

    let strict = LoaderConfig {
        strict_relocations: true,
        ..lenient
    };
    let mut loader = ElfLoader::new(&strict, SymbolMap::new());
    let err = loader.load(&mut Cursor::new(elf.build())).unwrap_err();
    assert!(matches!(err, LoadError::BadRelocation { section: "text", .. }));
}
