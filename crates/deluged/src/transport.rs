//! Link-local UDP transport.
//!
//! One socket on the Deluge port, joined to ff02::1. Broadcast frames go to
//! the group, unicast frames back to the address a neighbour sent from.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use deluge_core::config::NetworkConfig;
use deluge_services::{Outgoing, SendTarget};

pub const MULTICAST_ADDR: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// Largest datagram the protocol produces is a 4 + 255 byte profile.
pub const MAX_FRAME: usize = 512;

pub struct Transport {
    socket: UdpSocket,
    group: SocketAddr,
}

impl Transport {
    pub fn bind(config: &NetworkConfig) -> Result<Self> {
        let interface_index = if config.interface.is_empty() {
            0
        } else {
            if_index(&config.interface)?
        };
        let socket = make_socket(config.port, interface_index)
            .context("failed to create multicast socket")?;
        let socket = UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?;
        tracing::info!(
            interface = %config.interface,
            interface_index,
            port = config.port,
            "transport ready"
        );
        Ok(Self {
            socket,
            group: SocketAddrV6::new(MULTICAST_ADDR, config.port, 0, interface_index).into(),
        })
    }

    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    pub async fn send(&self, out: &Outgoing) -> std::io::Result<usize> {
        let dest = match out.target {
            SendTarget::Broadcast => self.group,
            SendTarget::Peer(addr) => addr,
        };
        self.socket.send_to(&out.frame, dest).await
    }
}

fn make_socket(port: u16, interface_index: u32) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_only_v6(true).context("IPV6_V6ONLY")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    socket.bind(&bind_addr.into()).context("bind()")?;

    socket
        .join_multicast_v6(&MULTICAST_ADDR, interface_index)
        .context("IPV6_JOIN_GROUP")?;
    socket.set_multicast_if_v6(interface_index).context("IPV6_MULTICAST_IF")?;
    // link-local only
    socket.set_multicast_hops_v6(1).context("IPV6_MULTICAST_HOPS")?;
    // our own summaries would count towards suppression
    socket.set_multicast_loop_v6(false).context("IPV6_MULTICAST_LOOP")?;

    Ok(socket.into())
}

/// OS interface index for a named network interface.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}
