//! UDP socket setup for the two discovery roles.
//!
//! Sockets are built with socket2 so the multicast listener can share its
//! port with other processes on the same host (SO_REUSEADDR / SO_REUSEPORT),
//! then handed to tokio.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to create UDP socket: {0}")]
    Create(#[source] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to join multicast group {group} on {interface}: {source}")]
    Join {
        group: Ipv4Addr,
        interface: Ipv4Addr,
        #[source]
        source: io::Error,
    },

    #[error("failed to configure socket: {0}")]
    Configure(#[source] io::Error),
}

/// Group membership held by a multicast listener, needed to leave it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub group: Ipv4Addr,
    pub interface: Ipv4Addr,
}

/// Bind the server-side listener on the multicast port and join the group.
///
/// Loopback delivery is enabled so a searcher on the same host sees our
/// replies. Must be called from within a tokio runtime.
pub fn bind_multicast(
    group: SocketAddrV4,
    interface: Ipv4Addr,
) -> Result<(UdpSocket, Membership), BindError> {
    let socket = new_udp_socket()?;
    socket.set_reuse_address(true).map_err(BindError::Configure)?;
    #[cfg(unix)]
    socket.set_reuse_port(true).map_err(BindError::Configure)?;

    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port()));
    socket
        .bind(&bind_addr.into())
        .map_err(|source| BindError::Bind { addr: bind_addr, source })?;

    socket
        .join_multicast_v4(group.ip(), &interface)
        .map_err(|source| BindError::Join {
            group: *group.ip(),
            interface,
            source,
        })?;
    socket.set_multicast_loop_v4(true).map_err(BindError::Configure)?;

    tracing::debug!(
        "Joined {} on interface {} (bound {})",
        group.ip(),
        interface,
        bind_addr
    );

    let membership = Membership {
        group: *group.ip(),
        interface,
    };
    Ok((into_tokio(socket)?, membership))
}

/// Bind the client-side socket to an ephemeral port on `interface`.
///
/// Outgoing multicast is routed through the same interface.
pub fn bind_unicast(interface: Ipv4Addr) -> Result<UdpSocket, BindError> {
    let socket = new_udp_socket()?;

    let bind_addr = SocketAddr::V4(SocketAddrV4::new(interface, 0));
    socket
        .bind(&bind_addr.into())
        .map_err(|source| BindError::Bind { addr: bind_addr, source })?;

    if !interface.is_unspecified() {
        socket
            .set_multicast_if_v4(&interface)
            .map_err(BindError::Configure)?;
    }
    socket.set_multicast_loop_v4(true).map_err(BindError::Configure)?;

    into_tokio(socket)
}

fn new_udp_socket() -> Result<Socket, BindError> {
    Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(BindError::Create)
}

fn into_tokio(socket: Socket) -> Result<UdpSocket, BindError> {
    socket.set_nonblocking(true).map_err(BindError::Configure)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(BindError::Configure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_unicast_picks_ephemeral_port() {
        let socket = bind_unicast(Ipv4Addr::LOCALHOST).unwrap();
        let local = socket.local_addr().unwrap();

        assert_eq!(local.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(local.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_error_reports_address() {
        // 192.0.2.0/24 is TEST-NET-1, never assigned to a local interface
        let err = bind_unicast(Ipv4Addr::new(192, 0, 2, 1)).unwrap_err();

        assert!(matches!(err, BindError::Bind { .. }));
        assert!(err.to_string().contains("192.0.2.1:0"));
    }
}
