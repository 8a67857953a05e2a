use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

// -- Wire constants (RFC 1928 subset) --

pub const VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

// -- Reply codes --

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    HostUnreachable = 0x04,
    CommandNotSupported = 0x07,
    AddrTypeNotSupported = 0x08,
}

impl ReplyCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::Succeeded),
            0x01 => Some(Self::GeneralFailure),
            0x04 => Some(Self::HostUnreachable),
            0x07 => Some(Self::CommandNotSupported),
            0x08 => Some(Self::AddrTypeNotSupported),
            _ => None,
        }
    }
}

// -- Handshake errors --

/// Everything that can go wrong while decoding a client handshake.
/// These close the client connection; they never affect other streams.
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("bad SOCKS version {0:#04x}")]
    BadVersion(u8),
    #[error("client offered no acceptable auth method")]
    NoAcceptableMethod,
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddrType(u8),
    #[error("malformed domain name")]
    BadDomain,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SocksError {
    /// Reply code owed to the client before closing, when the handshake
    /// got far enough that a reply is expected at all.
    pub fn reply_code(&self) -> Option<ReplyCode> {
        match self {
            Self::UnsupportedCommand(_) => Some(ReplyCode::CommandNotSupported),
            Self::UnsupportedAddrType(_) => Some(ReplyCode::AddrTypeNotSupported),
            _ => None,
        }
    }
}

// -- Requests --

/// Destination requested by a CONNECT. IPv6 is rejected at decode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestAddr {
    Ipv4(Ipv4Addr),
    Domain(String),
}

impl fmt::Display for DestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ipv4(ip) => write!(f, "{ip}"),
            Self::Domain(d) => write!(f, "{d}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub dest: DestAddr,
    pub port: u16,
}

/// Read the client greeting `[ver, nmethods, methods…]` and return the
/// offered method list. The server decides whether no-auth is among them.
pub async fn read_greeting<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, SocksError> {
    let mut hdr = [0u8; 2];
    r.read_exact(&mut hdr).await?;
    if hdr[0] != VERSION {
        return Err(SocksError::BadVersion(hdr[0]));
    }
    let mut methods = vec![0u8; hdr[1] as usize];
    r.read_exact(&mut methods).await?;
    Ok(methods)
}

/// Read the request `[ver, cmd, rsv, atyp, addr…, port]`. Only CONNECT
/// with an IPv4 or domain destination is accepted. Rejected-but-decodable
/// requests (IPv6, non-CONNECT) are consumed in full first, so the error
/// reply is not lost to a reset when the connection closes.
pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<ConnectRequest, SocksError> {
    let mut hdr = [0u8; 4];
    r.read_exact(&mut hdr).await?;
    if hdr[0] != VERSION {
        return Err(SocksError::BadVersion(hdr[0]));
    }

    let dest = match hdr[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            r.read_exact(&mut octets).await?;
            Some(DestAddr::Ipv4(Ipv4Addr::from(octets)))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            r.read_exact(&mut len).await?;
            if len[0] == 0 {
                return Err(SocksError::BadDomain);
            }
            let mut name = vec![0u8; len[0] as usize];
            r.read_exact(&mut name).await?;
            let domain = String::from_utf8(name).map_err(|_| SocksError::BadDomain)?;
            Some(DestAddr::Domain(domain))
        }
        ATYP_IPV6 => {
            let mut skipped = [0u8; 16];
            r.read_exact(&mut skipped).await?;
            None
        }
        other => return Err(SocksError::UnsupportedAddrType(other)),
    };

    let mut port = [0u8; 2];
    r.read_exact(&mut port).await?;

    if hdr[1] != CMD_CONNECT {
        return Err(SocksError::UnsupportedCommand(hdr[1]));
    }
    let Some(dest) = dest else {
        return Err(SocksError::UnsupportedAddrType(ATYP_IPV6));
    };

    Ok(ConnectRequest {
        dest,
        port: u16::from_be_bytes(port),
    })
}

/// The method-selection reply `[ver, method]`.
pub fn method_reply(method: u8) -> [u8; 2] {
    [VERSION, method]
}

// -- Reply --

/// Final handshake reply. Always carries an IPv4 bind address: the real
/// local endpoint of the outbound socket on success, all zeroes on
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub code: ReplyCode,
    pub bind: SocketAddrV4,
}

impl Reply {
    /// ver(1) + rep(1) + rsv(1) + atyp(1) + addr(4) + port(2)
    pub const SIZE: usize = 10;

    pub fn success(bind: SocketAddrV4) -> Self {
        Self {
            code: ReplyCode::Succeeded,
            bind,
        }
    }

    pub fn failure(code: ReplyCode) -> Self {
        Self {
            code,
            bind: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        }
    }

    pub fn serialize(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0] = VERSION;
        buf[1] = self.code as u8;
        buf[2] = 0x00;
        buf[3] = ATYP_IPV4;
        buf[4..8].copy_from_slice(&self.bind.ip().octets());
        buf[8..10].copy_from_slice(&self.bind.port().to_be_bytes());
    }

    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        if data[0] != VERSION || data[3] != ATYP_IPV4 {
            return None;
        }
        Some(Self {
            code: ReplyCode::from_u8(data[1])?,
            bind: SocketAddrV4::new(
                Ipv4Addr::new(data[4], data[5], data[6], data[7]),
                u16::from_be_bytes([data[8], data[9]]),
            ),
        })
    }
}
