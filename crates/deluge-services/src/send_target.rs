//! Send targeting: link broadcast vs a single neighbour.

use std::net::SocketAddr;

use bytes::Bytes;

/// Where an outgoing frame goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendTarget {
    /// Every node in radio range.
    #[default]
    Broadcast,

    /// One neighbour, by the address its frames arrived from.
    Peer(SocketAddr),
}

/// A frame queued by the state machine for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub target: SendTarget,
    pub frame: Bytes,
}

impl Outgoing {
    pub fn broadcast(frame: Bytes) -> Self {
        Self {
            target: SendTarget::Broadcast,
            frame,
        }
    }

    pub fn to_peer(peer: SocketAddr, frame: Bytes) -> Self {
        Self {
            target: SendTarget::Peer(peer),
            frame,
        }
    }
}
