//! One network-server endpoint: a pair of connected UDP sockets, one for
//! upstream traffic and one for the downstream PULL session. An endpoint is
//! live only once both sockets resolved and connected; a failed endpoint
//! stays configured but is never used.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use anyhow::{anyhow, Context, Result};
use tracing::info;

#[derive(Debug)]
pub struct Endpoint {
    pub addr: String,
    pub port_up: u16,
    pub port_down: u16,
    pub sock_up: UdpSocket,
    pub sock_down: UdpSocket,
}

/// Resolve `host:port` and connect a UDP socket to the first address that
/// accepts one, IPv4 or IPv6.
fn connect_udp(host: &str, port: u16) -> Result<UdpSocket> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("getaddrinfo on address {} (PORT {}) failed", host, port))?
        .collect();

    for addr in &addrs {
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse()?
        } else {
            "[::]:0".parse()?
        };
        let sock = match UdpSocket::bind(bind_addr) {
            Ok(s) => s,
            Err(_) => continue, /* try next resolved address */
        };
        if sock.connect(addr).is_ok() {
            return Ok(sock);
        }
    }
    Err(anyhow!(
        "failed to open socket to any of server {} addresses (port {})",
        host,
        port
    ))
}

impl Endpoint {
    /// Open both sockets towards one server. Failure leaves the endpoint
    /// dead; the daemon continues with the remaining ones.
    pub fn connect(addr: &str, port_up: u16, port_down: u16) -> Result<Endpoint> {
        let sock_up = connect_udp(addr, port_up).context("[up]")?;
        let sock_down = connect_udp(addr, port_down).context("[down]")?;
        info!("INFO: Successfully contacted server {}", addr);
        Ok(Endpoint {
            addr: addr.to_string(),
            port_up,
            port_down,
            sock_up,
            sock_down,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connects_both_sockets_to_local_servers() {
        let srv_up = UdpSocket::bind("127.0.0.1:0").unwrap();
        let srv_down = UdpSocket::bind("127.0.0.1:0").unwrap();
        let ep = Endpoint::connect(
            "127.0.0.1",
            srv_up.local_addr().unwrap().port(),
            srv_down.local_addr().unwrap().port(),
        )
        .unwrap();

        ep.sock_up.send(b"ping").unwrap();
        let mut buff = [0u8; 16];
        let (n, _) = srv_up.recv_from(&mut buff).unwrap();
        assert_eq!(&buff[..n], b"ping");
    }

    #[test]
    fn unresolvable_host_is_an_error() {
        assert!(Endpoint::connect("host.invalid.", 1780, 1782).is_err());
    }
}
