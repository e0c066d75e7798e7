//! Deluge wire format: the four protocol messages.
//!
//! Every frame starts with a one-byte command. Fixed-size frames are
//! #[repr(C, packed)] zerocopy structs; the profile carries a trailing
//! per-page version vector whose length is its `npages` field. Multi-byte
//! fields are little-endian.
//!
//! Decoding never trusts the command byte alone: each frame is checked
//! against the size its command requires before a typed value is built.

use bytes::Bytes;
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::page::PACKET_SIZE;

// ── Commands ──────────────────────────────────────────────────────────────────

pub mod cmd {
    pub const SUMMARY: u8 = 1;
    pub const REQUEST: u8 = 2;
    pub const PACKET: u8 = 3;
    pub const PROFILE: u8 = 4;
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// Periodic advertisement. Wire size: 4 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct SummaryFrame {
    pub cmd: u8,
    pub version: u8,
    /// Index of the sender's first incomplete page.
    pub highest_available: u8,
    pub object_id: u8,
}

assert_eq_size!(SummaryFrame, [u8; 4]);

/// Page request. Wire size: 5 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RequestFrame {
    pub cmd: u8,
    pub version: u8,
    pub pagenum: u8,
    /// One bit per packet the requester is missing.
    pub request_set: u8,
    pub object_id: u8,
}

assert_eq_size!(RequestFrame, [u8; 5]);

/// One packet of page data. Wire size: 71 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PacketFrame {
    pub cmd: u8,
    pub version: u8,
    pub pagenum: u8,
    pub packetnum: u8,
    /// CRC-16 of `payload`.
    pub crc: U16<LittleEndian>,
    pub object_id: u8,
    pub payload: [u8; PACKET_SIZE],
}

assert_eq_size!(PacketFrame, [u8; 71]);

/// Fixed part of a profile. Followed by `npages` version bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ProfileHeader {
    pub cmd: u8,
    pub version: u8,
    pub npages: u8,
    pub object_id: u8,
}

assert_eq_size!(ProfileHeader, [u8; 4]);

// ── Typed messages ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub version: u8,
    pub highest_available: u8,
    pub object_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub version: u8,
    pub pagenum: u8,
    pub request_set: u8,
    pub object_id: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub pagenum: u8,
    pub packetnum: u8,
    pub crc: u16,
    pub object_id: u8,
    pub payload: [u8; PACKET_SIZE],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub version: u8,
    pub object_id: u8,
    /// Version of each page; its length is the page count.
    pub version_vector: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Summary(Summary),
    Request(Request),
    Packet(Packet),
    Profile(Profile),
}

impl Message {
    /// Decode one frame, validating its length against its command.
    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        let cmd = *frame.first().ok_or(WireError::Empty)?;
        match cmd {
            cmd::SUMMARY => {
                let f: SummaryFrame = read_frame(cmd, frame)?;
                Ok(Message::Summary(Summary {
                    version: f.version,
                    highest_available: f.highest_available,
                    object_id: f.object_id,
                }))
            }
            cmd::REQUEST => {
                let f: RequestFrame = read_frame(cmd, frame)?;
                Ok(Message::Request(Request {
                    version: f.version,
                    pagenum: f.pagenum,
                    request_set: f.request_set,
                    object_id: f.object_id,
                }))
            }
            cmd::PACKET => {
                let f: PacketFrame = read_frame(cmd, frame)?;
                Ok(Message::Packet(Packet {
                    version: f.version,
                    pagenum: f.pagenum,
                    packetnum: f.packetnum,
                    crc: f.crc.get(),
                    object_id: f.object_id,
                    payload: f.payload,
                }))
            }
            cmd::PROFILE => {
                let h: ProfileHeader = read_frame(cmd, frame)?;
                let header_len = std::mem::size_of::<ProfileHeader>();
                let need = header_len + h.npages as usize;
                if frame.len() < need {
                    return Err(WireError::Truncated {
                        cmd,
                        len: frame.len(),
                        need,
                    });
                }
                Ok(Message::Profile(Profile {
                    version: h.version,
                    object_id: h.object_id,
                    version_vector: frame[header_len..need].to_vec(),
                }))
            }
            other => Err(WireError::UnknownCommand(other)),
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Message::Summary(s) => Bytes::copy_from_slice(
                SummaryFrame {
                    cmd: cmd::SUMMARY,
                    version: s.version,
                    highest_available: s.highest_available,
                    object_id: s.object_id,
                }
                .as_bytes(),
            ),
            Message::Request(r) => Bytes::copy_from_slice(
                RequestFrame {
                    cmd: cmd::REQUEST,
                    version: r.version,
                    pagenum: r.pagenum,
                    request_set: r.request_set,
                    object_id: r.object_id,
                }
                .as_bytes(),
            ),
            Message::Packet(p) => Bytes::copy_from_slice(
                PacketFrame {
                    cmd: cmd::PACKET,
                    version: p.version,
                    pagenum: p.pagenum,
                    packetnum: p.packetnum,
                    crc: U16::new(p.crc),
                    object_id: p.object_id,
                    payload: p.payload,
                }
                .as_bytes(),
            ),
            Message::Profile(p) => {
                let header = ProfileHeader {
                    cmd: cmd::PROFILE,
                    version: p.version,
                    npages: p.version_vector.len() as u8,
                    object_id: p.object_id,
                };
                let mut out = Vec::with_capacity(header.as_bytes().len() + p.version_vector.len());
                out.extend_from_slice(header.as_bytes());
                out.extend_from_slice(&p.version_vector);
                Bytes::from(out)
            }
        }
    }

    pub fn object_id(&self) -> u8 {
        match self {
            Message::Summary(m) => m.object_id,
            Message::Request(m) => m.object_id,
            Message::Packet(m) => m.object_id,
            Message::Profile(m) => m.object_id,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Summary(_) => "summary",
            Message::Request(_) => "request",
            Message::Packet(_) => "packet",
            Message::Profile(_) => "profile",
        }
    }
}

fn read_frame<T: FromBytes>(cmd: u8, frame: &[u8]) -> Result<T, WireError> {
    T::read_from_prefix(frame).ok_or(WireError::Truncated {
        cmd,
        len: frame.len(),
        need: std::mem::size_of::<T>(),
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty frame")]
    Empty,
    #[error("unknown command byte: {0:#04x}")]
    UnknownCommand(u8),
    #[error("frame for command {cmd} is {len} bytes, need {need}")]
    Truncated { cmd: u8, len: usize, need: usize },
}
