/// SOCKS5 server and dispatcher.
///
/// Accepts clients on the loopback listener, terminates the no-auth
/// handshake, dials the requested destination through the selector's
/// preferred interface (falling back through the rest on failure), then
/// relays bytes both ways while keeping the health store's gauges and
/// byte counters current. Every client is served by its own task; the
/// store is the only state shared between them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use uplink_protocol::socks::{self, ConnectRequest, Reply, ReplyCode, SocksError};

use crate::egress;
use crate::store::{ActiveGuard, HealthStore};
use crate::SharedState;

const RELAY_BUF_SIZE: usize = 4096;

/// Accept loop. Stops accepting as soon as the token fires; in-flight
/// sessions are torn down by dropping their sockets.
pub async fn serve(
    listener: TcpListener,
    state: Arc<SharedState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                info!("SOCKS5 listener stopping");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };

        let state = Arc::clone(&state);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                // Dropping the session future closes both sockets, which
                // ends the relay pumps; the active-conn guard unwinds with it.
                _ = cancel.cancelled() => {}
                result = handle_client(state, stream, peer) => {
                    if let Err(e) = result {
                        warn!(peer = %peer, error = %e, "Client session error");
                    }
                }
            }
        });
    }
}

async fn handle_client(
    state: Arc<SharedState>,
    mut client: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    debug!(peer = %peer, "New client connection");

    let request = match handshake(&mut client).await {
        Ok(request) => request,
        Err(e) => {
            // Some handshake failures still owe the client a reply
            if let Some(code) = e.reply_code() {
                let mut buf = [0u8; Reply::SIZE];
                Reply::failure(code).serialize(&mut buf);
                let _ = client.write_all(&buf).await;
            }
            warn!(peer = %peer, error = %e, "Handshake failed");
            return Ok(());
        }
    };

    info!(peer = %peer, dest = %request.dest, port = request.port, "CONNECT request");

    let Some((remote, iface_name)) = dial_with_fallback(&state, &request).await else {
        error!(
            peer = %peer,
            dest = %request.dest,
            port = request.port,
            "All interfaces failed to reach destination"
        );
        let mut buf = [0u8; Reply::SIZE];
        Reply::failure(ReplyCode::HostUnreachable).serialize(&mut buf);
        let _ = client.write_all(&buf).await;
        return Ok(());
    };

    // The bound source endpoint goes back to the client in the reply
    let SocketAddr::V4(local) = remote.local_addr()? else {
        let mut buf = [0u8; Reply::SIZE];
        Reply::failure(ReplyCode::GeneralFailure).serialize(&mut buf);
        let _ = client.write_all(&buf).await;
        return Ok(());
    };

    let mut buf = [0u8; Reply::SIZE];
    Reply::success(local).serialize(&mut buf);
    client.write_all(&buf).await?;

    let _active = ActiveGuard::new(Arc::clone(&state.store), &iface_name);
    debug!(peer = %peer, iface = %iface_name, bind = %local, "Relay started");

    relay(client, remote, &state.store, &iface_name).await;

    debug!(peer = %peer, "Closed client connection");
    Ok(())
}

/// Greeting and request phases. The method reply goes out here; request
/// decoding errors are left to the caller, which may still owe the
/// client a failure reply.
async fn handshake(client: &mut TcpStream) -> Result<ConnectRequest, SocksError> {
    let methods = socks::read_greeting(client).await?;
    if !methods.contains(&socks::METHOD_NO_AUTH) {
        let _ = client
            .write_all(&socks::method_reply(socks::METHOD_NO_ACCEPTABLE))
            .await;
        return Err(SocksError::NoAcceptableMethod);
    }
    client
        .write_all(&socks::method_reply(socks::METHOD_NO_AUTH))
        .await?;

    socks::read_request(client).await
}

/// Try interfaces in the selector's preference order until one carries
/// the connection. Failures are charged both to the live store and to a
/// local snapshot copy, so the next selector call already sees them. At
/// most one dial attempt per enumerated interface.
async fn dial_with_fallback(
    state: &SharedState,
    request: &ConnectRequest,
) -> Option<(TcpStream, String)> {
    let host = request.dest.to_string();
    let dial_timeout = Duration::from_secs(state.config.dial.timeout_seconds);
    let mut working = state.store.snapshot();

    for _ in 0..state.interfaces.len() {
        let Some(name) = state.selector.best(&working) else {
            error!("Selector returned no interface");
            break;
        };
        let Some(local_ip) = state.interfaces.ipv4(&name) else {
            // Enumeration race during shutdown; skip this candidate
            working.bump_failure(&name);
            continue;
        };

        debug!(iface = %name, dest = %host, port = request.port, "Dialing via interface");
        match tokio::time::timeout(
            dial_timeout,
            egress::connect_from(local_ip, &host, request.port),
        )
        .await
        {
            Ok(Ok(stream)) => {
                state.store.record_success(&name);
                if let Err(e) = egress::configure_stream(&stream) {
                    debug!(iface = %name, error = %e, "Failed to set relay socket options");
                }
                return Some((stream, name));
            }
            Ok(Err(e)) => {
                warn!(iface = %name, dest = %host, error = %e, "Dial failed");
            }
            Err(_) => {
                warn!(iface = %name, dest = %host, "Dial timed out");
            }
        }
        state.store.record_failure(&name);
        working.bump_failure(&name);
    }
    None
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ClientToRemote,
    RemoteToClient,
}

/// Bidirectional forwarding. Each direction half-closes its peer on
/// exit, so a clean EOF on one side lets the other drain before the
/// session ends.
async fn relay(client: TcpStream, remote: TcpStream, store: &Arc<HealthStore>, iface: &str) {
    let (client_r, client_w) = client.into_split();
    let (remote_r, remote_w) = remote.into_split();

    tokio::join!(
        pump(client_r, remote_w, store, iface, Direction::ClientToRemote),
        pump(remote_r, client_w, store, iface, Direction::RemoteToClient),
    );
}

async fn pump<R, W>(mut reader: R, mut writer: W, store: &HealthStore, iface: &str, dir: Direction)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; RELAY_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(iface, direction = ?dir, error = %e, "Relay read error");
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            warn!(iface, direction = ?dir, error = %e, "Relay write error");
            break;
        }
        match dir {
            Direction::ClientToRemote => store.add_bytes_sent(iface, n as u64),
            Direction::RemoteToClient => store.add_bytes_received(iface, n as u64),
        }
    }
    let _ = writer.shutdown().await;
}
