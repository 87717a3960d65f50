//! PROXY protocol v2 stripping for UDP datagrams.
//!
//! When the server sits behind a forwarding proxy, each datagram may carry a
//! binary PROXY v2 prefix naming the real client. The stripper peels that
//! prefix off without copying the payload and reports the original client
//! endpoint; responses still go back to the proxy.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use tracing::{debug, warn};

/// PROXY v2 signature: "\r\n\r\n\0\r\nQUIT\n".
pub const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

const VERSION_2: u8 = 0x2;

const CMD_LOCAL: u8 = 0x0;
const CMD_PROXY: u8 = 0x1;

const FAMILY_INET4: u8 = 0x1;
const FAMILY_INET6: u8 = 0x2;

const INET4_ADDR_BLOCK: usize = 12;
const INET6_ADDR_BLOCK: usize = 36;

/// Result of stripping a datagram.
///
/// `payload` is a slice sharing the input's backing storage; holding it keeps
/// the original allocation alive, dropping it is the release.
#[derive(Debug, Clone)]
pub struct Stripped {
    pub payload: Bytes,
    pub origin: SocketAddr,
    pub proxied: bool,
}

/// True when the buffer starts with the PROXY v2 signature.
pub fn has_signature(buf: &[u8]) -> bool {
    buf.len() >= SIGNATURE.len() && buf[..SIGNATURE.len()] == SIGNATURE
}

struct Header {
    len: usize,
    source: Option<SocketAddr>,
}

fn parse_header(buf: &[u8]) -> Option<Header> {
    // Signature already matched; the fixed part is 16 bytes.
    if buf.len() < 16 {
        return None;
    }
    let version = buf[12] >> 4;
    let command = buf[12] & 0x0F;
    if version != VERSION_2 {
        warn!(version, "unsupported proxy protocol version");
        return None;
    }
    if command != CMD_LOCAL && command != CMD_PROXY {
        warn!(command, "unsupported proxy protocol command");
        return None;
    }
    let family = buf[13] >> 4;
    // Low nibble of byte 13 is the transport protocol, informational here.
    let addr_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    let header_len = 16 + addr_len;
    if buf.len() < header_len {
        return None;
    }

    if command == CMD_LOCAL {
        return Some(Header {
            len: header_len,
            source: None,
        });
    }

    let block = &buf[16..header_len];
    let source = match family {
        FAMILY_INET4 if addr_len >= INET4_ADDR_BLOCK => {
            let ip: [u8; 4] = block[..4].try_into().ok()?;
            let port = u16::from_be_bytes([block[8], block[9]]);
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
        }
        FAMILY_INET6 if addr_len >= INET6_ADDR_BLOCK => {
            let ip: [u8; 16] = block[..16].try_into().ok()?;
            let port = u16::from_be_bytes([block[32], block[33]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port))
        }
        _ => {
            debug!(family, addr_len, "unknown proxy address family, treating as unproxied");
            None
        }
    };

    Some(Header {
        len: header_len,
        source,
    })
}

/// Strip a PROXY v2 prefix from `datagram`.
///
/// Without the signature, or on any parse failure, the datagram passes
/// through untouched with `fallback` as the origin. The input is never
/// modified; the returned payload borrows its backing storage.
pub fn strip(datagram: &Bytes, fallback: SocketAddr) -> Stripped {
    if !has_signature(datagram) {
        return Stripped {
            payload: datagram.clone(),
            origin: fallback,
            proxied: false,
        };
    }

    match parse_header(datagram) {
        Some(header) => {
            let proxied = header.source.is_some();
            Stripped {
                payload: datagram.slice(header.len..),
                origin: header.source.unwrap_or(fallback),
                proxied,
            }
        }
        None => {
            warn!(len = datagram.len(), "malformed proxy protocol header, passing datagram through");
            Stripped {
                payload: datagram.clone(),
                origin: fallback,
                proxied: false,
            }
        }
    }
}
