/// Outbound sockets pinned to a source interface.
///
/// Binding the local endpoint to `(iface_ipv4, 0)` before connecting is
/// what routes a stream through a specific interface; the kernel picks
/// the ephemeral port. Both the health monitor's probes and the
/// dispatcher's dials go through here.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{lookup_host, TcpSocket, TcpStream};

/// Resolve `host` and connect from `local_ip`, trying each IPv4 address
/// in resolution order until one answers. Which address ends up carrying
/// the connection is left to the resolver.
pub async fn connect_from(local_ip: Ipv4Addr, host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last_err: Option<io::Error> = None;
    for addr in lookup_host((host, port)).await? {
        if !addr.is_ipv4() {
            continue;
        }
        let socket = TcpSocket::new_v4()?;
        socket.bind(SocketAddr::new(IpAddr::V4(local_ip), 0))?;
        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "destination resolved to no IPv4 address",
        )
    }))
}

/// Socket options for long-lived relay streams: disable Nagle, detect
/// dead peers with keepalive.
pub fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_from_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = connect_from(Ipv4Addr::LOCALHOST, "127.0.0.1", addr.port())
            .await
            .unwrap();
        let local = stream.local_addr().unwrap();
        assert_eq!(local.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        configure_stream(&stream).unwrap();
    }

    #[tokio::test]
    async fn unassigned_source_address_fails() {
        // 198.51.100.1 (TEST-NET-2) is not assigned to any local interface,
        // so the bind itself must fail.
        let err = connect_from(Ipv4Addr::new(198, 51, 100, 1), "127.0.0.1", 80).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn refused_destination_fails() {
        // Bind a listener to grab a free port, then close it again.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = connect_from(Ipv4Addr::LOCALHOST, "127.0.0.1", port).await;
        assert!(err.is_err());
    }
}
