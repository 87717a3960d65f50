//! Pending-handshake table.
//!
//! Between a CONNECT control datagram and the first data datagram the
//! connection is half-open: the chosen conversation id is parked here keyed
//! by both the id and the originating endpoint. The table is a bounded FIFO;
//! when full, the oldest entry is evicted so handshake retries cannot grow
//! it without bound.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::telemetry;

/// A half-open connection: the conversation id promised to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeWaiter {
    pub conv: u64,
    pub origin: SocketAddr,
}

struct Indexed {
    fifo: VecDeque<HandshakeWaiter>,
    by_conv: HashMap<u64, HandshakeWaiter>,
    by_origin: HashMap<SocketAddr, HandshakeWaiter>,
}

impl Indexed {
    fn insert(&mut self, waiter: HandshakeWaiter) {
        self.fifo.push_back(waiter);
        self.by_conv.insert(waiter.conv, waiter);
        self.by_origin.insert(waiter.origin, waiter);
    }

    fn evict_oldest(&mut self) -> Option<HandshakeWaiter> {
        let oldest = self.fifo.pop_front()?;
        self.by_conv.remove(&oldest.conv);
        self.by_origin.remove(&oldest.origin);
        Some(oldest)
    }
}

/// Bounded FIFO of [`HandshakeWaiter`]s with O(1) lookup by conversation id
/// and by origin endpoint.
pub struct WaiterTable {
    cap: usize,
    // Size mirror read outside the lock on the append fast path; the
    // authoritative check happens under the lock.
    len: AtomicUsize,
    inner: Mutex<Indexed>,
}

impl WaiterTable {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            len: AtomicUsize::new(0),
            inner: Mutex::new(Indexed {
                fifo: VecDeque::new(),
                by_conv: HashMap::new(),
                by_origin: HashMap::new(),
            }),
        }
    }

    pub fn find_by_conv(&self, conv: u64) -> Option<HandshakeWaiter> {
        self.inner.lock().unwrap().by_conv.get(&conv).copied()
    }

    pub fn find_by_endpoint(&self, origin: SocketAddr) -> Option<HandshakeWaiter> {
        self.inner.lock().unwrap().by_origin.get(&origin).copied()
    }

    /// Insert a waiter, evicting the oldest entry first when the table is
    /// at capacity.
    pub fn append(&self, waiter: HandshakeWaiter) {
        if self.len.load(Ordering::Relaxed) >= self.cap {
            let mut inner = self.inner.lock().unwrap();
            if inner.fifo.len() >= self.cap {
                if let Some(evicted) = inner.evict_oldest() {
                    debug!(
                        conv = evicted.conv,
                        origin = %evicted.origin,
                        "handshake backlog full, evicting oldest waiter"
                    );
                    telemetry::record_waiter_evicted();
                }
            }
            inner.insert(waiter);
            self.len.store(inner.fifo.len(), Ordering::Relaxed);
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.insert(waiter);
        self.len.store(inner.fifo.len(), Ordering::Relaxed);
    }

    /// Remove a waiter from the FIFO and both indexes. Idempotent.
    pub fn remove(&self, waiter: &HandshakeWaiter) {
        let mut inner = self.inner.lock().unwrap();
        inner.fifo.retain(|w| w != waiter);
        if inner.by_conv.get(&waiter.conv) == Some(waiter) {
            inner.by_conv.remove(&waiter.conv);
        }
        if inner.by_origin.get(&waiter.origin) == Some(waiter) {
            inner.by_origin.remove(&waiter.origin);
        }
        self.len.store(inner.fifo.len(), Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(port: u16) -> SocketAddr {
        SocketAddr::from(([198, 51, 100, 1], port))
    }

    fn waiter(conv: u64, port: u16) -> HandshakeWaiter {
        HandshakeWaiter {
            conv,
            origin: origin(port),
        }
    }

    #[test]
    fn lookups_by_both_keys() {
        let table = WaiterTable::new(10);
        table.append(waiter(7, 4000));
        assert_eq!(table.find_by_conv(7), Some(waiter(7, 4000)));
        assert_eq!(table.find_by_endpoint(origin(4000)), Some(waiter(7, 4000)));
        assert_eq!(table.find_by_conv(8), None);
        assert_eq!(table.find_by_endpoint(origin(4001)), None);
    }

    #[test]
    fn bounded_with_fifo_eviction() {
        let table = WaiterTable::new(10);
        for i in 0..100u64 {
            table.append(waiter(i, 4000 + i as u16));
            assert!(table.len() <= 10);
        }
        assert_eq!(table.len(), 10);
        // Oldest entries are gone, newest survive.
        assert_eq!(table.find_by_conv(89), None);
        assert_eq!(table.find_by_conv(90), Some(waiter(90, 4090)));
        assert_eq!(table.find_by_conv(99), Some(waiter(99, 4099)));
    }

    #[test]
    fn eviction_clears_all_indexes() {
        let table = WaiterTable::new(2);
        table.append(waiter(1, 1001));
        table.append(waiter(2, 1002));
        table.append(waiter(3, 1003));
        assert_eq!(table.find_by_conv(1), None);
        assert_eq!(table.find_by_endpoint(origin(1001)), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn remove_is_idempotent() {
        let table = WaiterTable::new(10);
        let w = waiter(5, 5000);
        table.append(w);
        table.remove(&w);
        assert!(table.is_empty());
        assert_eq!(table.find_by_conv(5), None);
        table.remove(&w);
        assert!(table.is_empty());
    }

    #[test]
    fn remove_leaves_other_entries_alone() {
        let table = WaiterTable::new(10);
        table.append(waiter(1, 1001));
        table.append(waiter(2, 1002));
        table.remove(&waiter(1, 1001));
        assert_eq!(table.len(), 1);
        assert_eq!(table.find_by_conv(2), Some(waiter(2, 1002)));
        assert_eq!(table.find_by_endpoint(origin(1002)), Some(waiter(2, 1002)));
    }

    #[test]
    fn indexes_stay_consistent_with_fifo() {
        let table = WaiterTable::new(4);
        for i in 0..20u64 {
            table.append(waiter(i, 2000 + i as u16));
            let inner = table.inner.lock().unwrap();
            assert_eq!(inner.fifo.len(), inner.by_conv.len());
            assert_eq!(inner.fifo.len(), inner.by_origin.len());
            for w in &inner.fifo {
                assert_eq!(inner.by_conv.get(&w.conv), Some(w));
                assert_eq!(inner.by_origin.get(&w.origin), Some(w));
            }
        }
    }
}
