use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

pub(crate) const TELEMETRY_ENV: &str = "SQUALL_TELEMETRY";

static DATAGRAMS_IN: AtomicU64 = AtomicU64::new(0);
static DATAGRAM_BYTES_IN: AtomicU64 = AtomicU64::new(0);
static DATAGRAMS_OUT: AtomicU64 = AtomicU64::new(0);
static PROXY_STRIPPED: AtomicU64 = AtomicU64::new(0);
static HANDSHAKES_SENT: AtomicU64 = AtomicU64::new(0);
static SESSIONS_OPENED: AtomicU64 = AtomicU64::new(0);
static SESSIONS_CLOSED: AtomicU64 = AtomicU64::new(0);
static WAITERS_EVICTED: AtomicU64 = AtomicU64::new(0);
static DROP_MALFORMED: AtomicU64 = AtomicU64::new(0);
static DROP_UNKNOWN_CONV: AtomicU64 = AtomicU64::new(0);
static DROP_SN_MISMATCH: AtomicU64 = AtomicU64::new(0);
static DROP_REJECTED_SUBMIT: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Default, Debug, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub datagrams_in: u64,
    pub datagram_bytes_in: u64,
    pub datagrams_out: u64,
    pub proxy_stripped: u64,
    pub handshakes_sent: u64,
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub waiters_evicted: u64,
    pub drop_malformed: u64,
    pub drop_unknown_conv: u64,
    pub drop_sn_mismatch: u64,
    pub drop_rejected_submit: u64,
}

impl Snapshot {
    pub fn delta(self, prev: Self) -> Self {
        Self {
            datagrams_in: self.datagrams_in.saturating_sub(prev.datagrams_in),
            datagram_bytes_in: self
                .datagram_bytes_in
                .saturating_sub(prev.datagram_bytes_in),
            datagrams_out: self.datagrams_out.saturating_sub(prev.datagrams_out),
            proxy_stripped: self.proxy_stripped.saturating_sub(prev.proxy_stripped),
            handshakes_sent: self.handshakes_sent.saturating_sub(prev.handshakes_sent),
            sessions_opened: self.sessions_opened.saturating_sub(prev.sessions_opened),
            sessions_closed: self.sessions_closed.saturating_sub(prev.sessions_closed),
            waiters_evicted: self.waiters_evicted.saturating_sub(prev.waiters_evicted),
            drop_malformed: self.drop_malformed.saturating_sub(prev.drop_malformed),
            drop_unknown_conv: self.drop_unknown_conv.saturating_sub(prev.drop_unknown_conv),
            drop_sn_mismatch: self.drop_sn_mismatch.saturating_sub(prev.drop_sn_mismatch),
            drop_rejected_submit: self
                .drop_rejected_submit
                .saturating_sub(prev.drop_rejected_submit),
        }
    }
}

pub(crate) fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        let res = std::env::var(TELEMETRY_ENV)
            .ok()
            .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(true);
        tracing::info!(enabled = res, "Telemetry status initialized");
        res
    })
}

pub(crate) fn record_datagram_in(bytes: usize) {
    if !enabled() {
        return;
    }
    DATAGRAMS_IN.fetch_add(1, Ordering::Relaxed);
    DATAGRAM_BYTES_IN.fetch_add(bytes as u64, Ordering::Relaxed);
}

pub(crate) fn record_datagram_out() {
    if !enabled() {
        return;
    }
    DATAGRAMS_OUT.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_proxy_stripped() {
    if !enabled() {
        return;
    }
    PROXY_STRIPPED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_handshake_sent() {
    if !enabled() {
        return;
    }
    HANDSHAKES_SENT.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_session_opened() {
    if !enabled() {
        return;
    }
    SESSIONS_OPENED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_session_closed() {
    if !enabled() {
        return;
    }
    SESSIONS_CLOSED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_waiter_evicted() {
    if !enabled() {
        return;
    }
    WAITERS_EVICTED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_drop_malformed() {
    if !enabled() {
        return;
    }
    DROP_MALFORMED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_drop_unknown_conv() {
    if !enabled() {
        return;
    }
    DROP_UNKNOWN_CONV.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_drop_sn_mismatch() {
    if !enabled() {
        return;
    }
    DROP_SN_MISMATCH.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_drop_rejected_submit() {
    if !enabled() {
        return;
    }
    DROP_REJECTED_SUBMIT.fetch_add(1, Ordering::Relaxed);
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        datagrams_in: DATAGRAMS_IN.load(Ordering::Relaxed),
        datagram_bytes_in: DATAGRAM_BYTES_IN.load(Ordering::Relaxed),
        datagrams_out: DATAGRAMS_OUT.load(Ordering::Relaxed),
        proxy_stripped: PROXY_STRIPPED.load(Ordering::Relaxed),
        handshakes_sent: HANDSHAKES_SENT.load(Ordering::Relaxed),
        sessions_opened: SESSIONS_OPENED.load(Ordering::Relaxed),
        sessions_closed: SESSIONS_CLOSED.load(Ordering::Relaxed),
        waiters_evicted: WAITERS_EVICTED.load(Ordering::Relaxed),
        drop_malformed: DROP_MALFORMED.load(Ordering::Relaxed),
        drop_unknown_conv: DROP_UNKNOWN_CONV.load(Ordering::Relaxed),
        drop_sn_mismatch: DROP_SN_MISMATCH.load(Ordering::Relaxed),
        drop_rejected_submit: DROP_REJECTED_SUBMIT.load(Ordering::Relaxed),
    }
}
