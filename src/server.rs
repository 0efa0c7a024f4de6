//! Passive-socket acceptor: one OS thread per connection.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6, TcpListener};
use std::time::Duration;
use tracing::{info, warn};

use crate::session;

const BACKLOG: i32 = 1024;

/// Bind the dual-stack IPv6 listener; IPv4 peers arrive as `::ffff:…`.
/// Port 0 picks an ephemeral port, readable from `local_addr`.
pub fn bind(port: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_only_v6(false)?;
    let addr: SocketAddr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0).into();
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

/// Accept forever, spawning a session thread per client.
pub fn serve(listener: TcpListener) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "waiting for connections");
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!(%peer, "client connected");
                std::thread::spawn(move || session::serve(stream, peer));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_ephemeral_port() {
        let listener = bind(0).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.is_ipv6());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn rebinding_same_port_after_drop() {
        let first = bind(0).unwrap();
        let port = first.local_addr().unwrap().port();
        drop(first);
        // SO_REUSEADDR lets the port be taken again right away
        let second = bind(port).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), port);
    }
}
