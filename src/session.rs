//! Per-conversation session handle.
//!
//! A [`Session`] is the server-side end of one reliable conversation. The
//! dispatcher creates it when a handshake completes, the registry indexes
//! it, and all of its state mutation happens on the single executor it was
//! bound to at creation. The ARQ machinery proper sits behind the
//! [`KcpOutput`] / [`KcpListener`] seams.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ChannelConfig;
use crate::executor::Executor;
use crate::registry::ConvRegistry;
use crate::telemetry;
use crate::user::User;
use crate::wire::HandshakeRsp;

/// Error handed to [`KcpListener::handle_exception`].
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
}

/// Sink for outbound datagrams. Implementations send to
/// [`User::response_addr`], which is the proxy when the peer was forwarded.
pub trait KcpOutput: Send + Sync {
    fn send(&self, data: Bytes, user: &User) -> io::Result<()>;
}

/// Application callbacks for session lifecycle and inbound data.
///
/// `on_connected` runs strictly before the first `handle_receive` of a
/// session. A callback returning an error is routed to `handle_exception`
/// and never tears down the server.
pub trait KcpListener: Send + Sync {
    fn on_connected(&self, session: &Arc<Session>) -> Result<(), ListenerError>;
    fn handle_receive(&self, payload: Bytes, session: &Arc<Session>) -> Result<(), ListenerError>;
    fn handle_exception(&self, error: ListenerError, session: &Arc<Session>);
    fn handle_close(&self, session: &Arc<Session>);
}

pub struct Session {
    output: Arc<dyn KcpOutput>,
    listener: Arc<dyn KcpListener>,
    executor: Executor,
    config: Arc<ChannelConfig>,
    // The registry owns sessions, never the reverse.
    registry: Weak<ConvRegistry>,
    conv: AtomicU64,
    user: Mutex<Option<User>>,
    input: Mutex<VecDeque<Bytes>>,
    last_read: Mutex<Instant>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(
        output: Arc<dyn KcpOutput>,
        listener: Arc<dyn KcpListener>,
        executor: Executor,
        config: Arc<ChannelConfig>,
        registry: &Arc<ConvRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            output,
            listener,
            executor,
            config,
            registry: Arc::downgrade(registry),
            conv: AtomicU64::new(0),
            user: Mutex::new(None),
            input: Mutex::new(VecDeque::new()),
            last_read: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn set_conv(&self, conv: u64) {
        self.conv.store(conv, Ordering::SeqCst);
    }

    pub fn conv(&self) -> u64 {
        self.conv.load(Ordering::SeqCst)
    }

    pub fn set_user(&self, user: User) {
        *self.user.lock().unwrap() = Some(user);
    }

    pub fn user(&self) -> Option<User> {
        self.user.lock().unwrap().clone()
    }

    /// Redirect future responses, e.g. when the proxy in front of the peer
    /// moved. Origin and local endpoints are fixed for the session's life.
    pub fn set_response_addr(&self, addr: std::net::SocketAddr) {
        if let Some(user) = self.user.lock().unwrap().as_mut() {
            user.set_response_addr(addr);
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub(crate) fn listener(&self) -> &Arc<dyn KcpListener> {
        &self.listener
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a datagram to the peer through the session's output sink.
    pub fn write(&self, data: Bytes) -> io::Result<()> {
        let Some(user) = self.user() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "session has no peer"));
        };
        self.output.send(data, &user)
    }

    /// Feed one inbound datagram payload into the session.
    ///
    /// Ownership of `payload` transfers into the input queue; delivery to
    /// the listener releases it. Must run on the session's executor, which
    /// is where the dispatcher invokes it. A listener error is forwarded to
    /// `handle_exception` and does not poison the queue.
    pub fn read(self: &Arc<Self>, payload: Bytes) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        *self.last_read.lock().unwrap() = Instant::now();
        self.input.lock().unwrap().push_back(payload);
        self.drain_input();
        Ok(())
    }

    fn drain_input(self: &Arc<Self>) {
        loop {
            let next = self.input.lock().unwrap().pop_front();
            let Some(payload) = next else { break };
            if let Err(error) = self.listener.handle_receive(payload, self) {
                self.listener.handle_exception(error, self);
            }
        }
    }

    /// Periodic housekeeping, run on the session's executor from the timer
    /// tick: closes the session once the peer has been idle too long.
    pub fn update(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let idle = self.last_read.lock().unwrap().elapsed();
        if idle > self.config.idle_timeout {
            info!(conv = self.conv(), idle_ms = idle.as_millis(), "session idle, closing");
            self.close(false);
        }
    }

    /// Close the session and drop it from the registry. Idempotent. A
    /// non-forceful close lets already-queued input drain; a forceful one
    /// discards it.
    pub fn close(self: &Arc<Self>, force: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if force {
            let dropped = {
                let mut input = self.input.lock().unwrap();
                let n = input.len();
                input.clear();
                n
            };
            if dropped > 0 {
                debug!(conv = self.conv(), dropped, "discarded queued input on forced close");
            }
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self);
        }
        telemetry::record_session_closed();
        info!(conv = self.conv(), force, "session closed");
        self.listener.handle_close(self);
    }

    /// Encode and send the handshake response for a CONNECT, carrying the
    /// echoed enet token and the chosen conversation id. Routed to the
    /// response endpoint, not the origin.
    pub fn send_handshake_rsp(
        output: &dyn KcpOutput,
        user: &User,
        enet: i32,
        conv: u64,
    ) -> io::Result<()> {
        let rsp = HandshakeRsp { conv, enet };
        output.send(rsp.encode(), user)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("conv", &self.conv())
            .field("closed", &self.is_closed())
            .finish()
    }
}
