//! Conversation registry.
//!
//! Authoritative dual-index map from conversation id and from origin
//! endpoint to the owning session. Both indexes are updated under one lock,
//! so a session is reachable by either key or by neither. The same lock
//! serializes conversation-id allocation against insertion, closing the
//! check-then-act race between concurrent handshakes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rand::rngs::OsRng;
use rand::RngCore;

use crate::session::Session;
use crate::waiters::WaiterTable;
use crate::wire;

struct Indexes {
    by_conv: HashMap<u64, Arc<Session>>,
    by_origin: HashMap<SocketAddr, Arc<Session>>,
}

pub struct ConvRegistry {
    inner: Mutex<Indexes>,
}

impl ConvRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Indexes {
                by_conv: HashMap::new(),
                by_origin: HashMap::new(),
            }),
        })
    }

    pub fn get_by_endpoint(&self, origin: SocketAddr) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().by_origin.get(&origin).cloned()
    }

    pub fn get_by_conv(&self, conv: u64) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().by_conv.get(&conv).cloned()
    }

    pub fn contains_conv(&self, conv: u64) -> bool {
        self.inner.lock().unwrap().by_conv.contains_key(&conv)
    }

    /// Resolve the session a data datagram belongs to. With conversation-
    /// channel keying enabled, the id carried in the header wins (this is
    /// what lets a client migrate ports mid-conversation); otherwise, or on
    /// a miss, the origin endpoint decides. Control datagrams never come
    /// through here: they have no conversation id to read.
    pub fn get(
        &self,
        payload: &[u8],
        origin: SocketAddr,
        use_conv_channel: bool,
    ) -> Option<Arc<Session>> {
        if use_conv_channel {
            if let Some(conv) = wire::conv_of(payload) {
                if let Some(session) = self.get_by_conv(conv) {
                    return Some(session);
                }
            }
        }
        self.get_by_endpoint(origin)
    }

    /// Install both indexes for a session. The session must already carry
    /// its conversation id and user.
    pub fn insert(&self, session: Arc<Session>) {
        let conv = session.conv();
        let Some(user) = session.user() else {
            return;
        };
        let mut inner = self.inner.lock().unwrap();
        inner.by_conv.insert(conv, session.clone());
        inner.by_origin.insert(user.origin_addr(), session);
    }

    /// Remove both indexes for a session. Idempotent; entries belonging to
    /// a different session under the same keys are left alone.
    pub fn remove(&self, session: &Arc<Session>) {
        let conv = session.conv();
        let origin = session.user().map(|u| u.origin_addr());
        let mut inner = self.inner.lock().unwrap();
        if inner
            .by_conv
            .get(&conv)
            .is_some_and(|s| Arc::ptr_eq(s, session))
        {
            inner.by_conv.remove(&conv);
        }
        if let Some(origin) = origin {
            if inner
                .by_origin
                .get(&origin)
                .is_some_and(|s| Arc::ptr_eq(s, session))
            {
                inner.by_origin.remove(&origin);
            }
        }
    }

    /// Draw a conversation id that collides with neither an active session
    /// nor a pending waiter. Zero is reserved as "unassigned". The registry
    /// lock is held across the draw so a concurrent handshake cannot pick
    /// the same id before this one is parked.
    pub fn alloc_conv(&self, waiters: &WaiterTable) -> u64 {
        let inner = self.inner.lock().unwrap();
        loop {
            let conv = OsRng.next_u64();
            if conv == 0 {
                continue;
            }
            if inner.by_conv.contains_key(&conv) {
                continue;
            }
            if waiters.find_by_conv(conv).is_some() {
                continue;
            }
            return conv;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_conv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
