//! Global symbols a loaded module may link against.

use std::collections::HashMap;
use std::path::Path;

pub trait SymbolResolver: Send + Sync {
    fn lookup(&self, name: &str) -> Option<u32>;
}

#[derive(Debug, thiserror::Error)]
pub enum SymbolMapError {
    #[error("cannot read symbol file: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad symbol file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Name → address table, loadable from a TOML file of `name = 0x1234` lines.
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    symbols: HashMap<String, u32>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(s: &str) -> Result<Self, SymbolMapError> {
        let symbols: HashMap<String, u32> = toml::from_str(s)?;
        Ok(Self { symbols })
    }

    pub fn load(path: &Path) -> Result<Self, SymbolMapError> {
        let map = Self::from_toml_str(&std::fs::read_to_string(path)?)?;
        tracing::debug!(path = %path.display(), symbols = map.len(), "loaded symbol table");
        Ok(map)
    }

    pub fn insert(&mut self, name: impl Into<String>, addr: u32) {
        self.symbols.insert(name.into(), addr);
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl SymbolResolver for SymbolMap {
    fn lookup(&self, name: &str) -> Option<u32> {
        self.symbols.get(name).copied()
    }
}
