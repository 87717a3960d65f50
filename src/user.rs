//! Peer identity for a session.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Identity of the remote peer of a session.
///
/// `response_addr` is where outbound datagrams go (the proxy when the
/// traffic was forwarded, otherwise the direct peer). `origin_addr` is the
/// real client as extracted from the PROXY header, equal to `response_addr`
/// for direct traffic. Origin and local endpoints never change for the
/// lifetime of a session; the response endpoint may be rewritten by the
/// session owner only.
#[derive(Clone)]
pub struct User {
    response_addr: SocketAddr,
    origin_addr: SocketAddr,
    local_addr: SocketAddr,
    cache: Option<Arc<dyn Any + Send + Sync>>,
}

impl User {
    pub fn new(response_addr: SocketAddr, origin_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            response_addr,
            origin_addr,
            local_addr,
            cache: None,
        }
    }

    /// A peer that was not forwarded: origin and response coincide.
    pub fn direct(peer: SocketAddr, local_addr: SocketAddr) -> Self {
        Self::new(peer, peer, local_addr)
    }

    pub fn response_addr(&self) -> SocketAddr {
        self.response_addr
    }

    pub fn origin_addr(&self) -> SocketAddr {
        self.origin_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn set_response_addr(&mut self, addr: SocketAddr) {
        self.response_addr = addr;
    }

    /// Attach an opaque application value to this peer.
    pub fn set_cache(&mut self, cache: Arc<dyn Any + Send + Sync>) {
        self.cache = Some(cache);
    }

    pub fn cache(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.cache.as_ref()
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("response_addr", &self.response_addr)
            .field("origin_addr", &self.origin_addr)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
