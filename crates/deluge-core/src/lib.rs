//! deluge-core: wire format, page geometry, ELF32 layouts and configuration.
//! All other deluge crates depend on this one.

pub mod config;
pub mod elf;
pub mod page;
pub mod wire;

pub use page::{crc16, Geometry, Variant, PACKET_SIZE};
pub use wire::{Message, Packet, Profile, Request, Summary, WireError};
