//! deluge-services: dissemination sessions, storage and the relocating loader.

pub mod arch;
pub mod error;
pub mod loader;
pub mod object;
pub mod protocol;
pub mod registry;
pub mod send_target;
pub mod storage;

pub use error::DelugeError;
pub use loader::{ElfLoader, LoadError, LoadedModule, SymbolMap, SymbolResolver};
pub use object::DisseminationObject;
pub use protocol::{Deluge, ProtocolParams, State, StreamHint};
pub use registry::DelugeRegistry;
pub use send_target::{Outgoing, SendTarget};
