//! `deluged exec`: link and load an object, report the loader result.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};

use deluge_core::config::LoaderConfig;
use deluge_services::{ElfLoader, LoadedModule, SymbolMap};

/// A loader for `config`, with the configured global symbols.
pub fn loader(config: &LoaderConfig) -> Result<ElfLoader> {
    let symbols = match &config.symbols {
        Some(path) => SymbolMap::load(path)
            .with_context(|| format!("failed to load symbols from {}", path.display()))?,
        None => {
            tracing::debug!("no symbol file configured");
            SymbolMap::new()
        }
    };
    Ok(ElfLoader::new(config, symbols))
}

/// Print where a module went, or the diagnostic and exit with its code.
pub fn run(config: &LoaderConfig, path: &Path) -> Result<()> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut loader = loader(config)?;
    match loader.load(&mut file) {
        Ok(module) => {
            print_module(path, loader.arch().name(), &module);
            Ok(())
        }
        Err(e) => {
            println!("{}: {e}", path.display());
            std::process::exit(e.code() as i32);
        }
    }
}

fn print_module(path: &Path, arch: &str, m: &LoadedModule) {
    println!("{}: loaded ({arch})", path.display());
    println!("  text    {:#07x}", m.text);
    if let Some(rodata) = m.rodata {
        println!("  rodata  {rodata:#07x}");
    }
    println!("  data    {:#07x}", m.data);
    println!("  bss     {:#07x}", m.bss);
    println!("  start   {:#07x}", m.start);
    println!("  relocations applied: {}", m.relocations);
    if m.skipped > 0 {
        println!("  relocations skipped: {}", m.skipped);
    }
}
