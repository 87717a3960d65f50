//! Ingress dispatcher and UDP server loop.
//!
//! One task owns the socket and feeds every inbound datagram through the
//! same pipeline: strip the PROXY prefix, classify by payload length,
//! resolve or establish the session, then hand the clean payload to the
//! session's executor. Nothing on this path is allowed to take the server
//! down; malformed traffic is logged and dropped.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ChannelConfig;
use crate::executor::ExecutorPool;
use crate::proxy;
use crate::registry::ConvRegistry;
use crate::session::{KcpListener, KcpOutput, Session};
use crate::telemetry;
use crate::timer::{self, TimingWheel};
use crate::user::User;
use crate::waiters::{HandshakeWaiter, WaiterTable};
use crate::wire::{self, Control, CONTROL_LEN};

const RECV_BUFFER_SIZE: usize = 65536;

/// Output sink bound to the server socket. Sends go to the peer's response
/// endpoint; a full socket buffer falls back to an async send so the
/// dispatcher never blocks.
struct UdpOutput {
    socket: Arc<UdpSocket>,
}

impl KcpOutput for UdpOutput {
    fn send(&self, data: Bytes, user: &User) -> io::Result<()> {
        let target = user.response_addr();
        match self.socket.try_send_to(&data, target) {
            Ok(_) => {
                telemetry::record_datagram_out();
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let socket = self.socket.clone();
                tokio::spawn(async move {
                    match socket.send_to(&data, target).await {
                        Ok(_) => telemetry::record_datagram_out(),
                        Err(e) => warn!(%target, error = %e, "deferred send failed"),
                    }
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// UDP server hosting many conversations over one socket.
pub struct Server {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: Arc<ChannelConfig>,
    registry: Arc<ConvRegistry>,
    waiters: WaiterTable,
    pool: Arc<ExecutorPool>,
    wheel: TimingWheel,
    listener: Arc<dyn KcpListener>,
    output: Arc<dyn KcpOutput>,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind the server socket and spin up the executor pool. Must run
    /// inside a tokio runtime.
    pub async fn bind(
        config: ChannelConfig,
        listener: Arc<dyn KcpListener>,
    ) -> io::Result<Server> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let addr: SocketAddr = config
            .listen_addr
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "server listening");

        Ok(Server {
            output: Arc::new(UdpOutput {
                socket: socket.clone(),
            }),
            socket,
            local_addr,
            waiters: WaiterTable::new(config.handshake_backlog),
            pool: ExecutorPool::new(config.executor_count),
            wheel: TimingWheel::new(),
            registry: ConvRegistry::new(),
            config: Arc::new(config),
            listener,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConvRegistry> {
        &self.registry
    }

    /// Active conversations.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Pending half-open handshakes.
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    /// Stop the receive loop, the executor pool and the timer.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.pool.stop();
        self.wheel.stop();
    }

    /// Receive loop. Datagrams from one endpoint reach its session's
    /// executor in arrival order because this loop is the only producer.
    pub async fn run(&self) -> io::Result<()> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, sender)) => {
                            telemetry::record_datagram_in(len);
                            trace!(
                                target: "squall::datagram_dump",
                                peer = %sender,
                                len,
                                hex = %hex::encode(&buf[..len]),
                            );
                            let datagram = Bytes::copy_from_slice(&buf[..len]);
                            self.handle_datagram(datagram, sender);
                        }
                        Err(e) => {
                            return Err(e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    debug!("server shutdown requested, exiting receive loop");
                    break Ok(());
                }
            }
        }
    }

    /// Process one inbound datagram end to end.
    fn handle_datagram(&self, datagram: Bytes, sender: SocketAddr) {
        let stripped = if self.config.proxy_protocol_v2_enabled {
            proxy::strip(&datagram, sender)
        } else {
            proxy::Stripped {
                payload: datagram.clone(),
                origin: sender,
                proxied: false,
            }
        };
        if stripped.proxied {
            telemetry::record_proxy_stripped();
            debug!(origin = %stripped.origin, via = %sender, "stripped proxy header");
        }
        let payload = stripped.payload;
        let origin = stripped.origin;

        let user = User::new(sender, origin, self.local_addr);

        if payload.len() == CONTROL_LEN {
            // Control datagrams carry no conversation id; they resolve by
            // the originating endpoint only.
            let existing = self.registry.get_by_endpoint(origin);
            self.handle_control(&payload, existing, &user, origin);
            return;
        }

        let existing = self
            .registry
            .get(&payload, origin, self.config.use_conv_channel);

        if payload.len() < 8 && existing.is_none() {
            warn!(%origin, len = payload.len(), "dropping runt datagram with no session");
            telemetry::record_drop_malformed();
            return;
        }

        let (session, new_connection) = match existing {
            Some(session) => (session, false),
            None => match self.promote(&payload, user, origin) {
                Some(session) => (session, true),
                None => return,
            },
        };

        let exec = session.executor().clone();
        if !exec.is_active() {
            warn!(%origin, "executor inactive, dropping datagram and closing session");
            session.close(false);
            return;
        }

        let task_session = session.clone();
        let task_payload = payload.clone();
        let submitted = exec.submit(move || {
            deliver(new_connection, task_session, task_payload, origin);
        });
        if submitted.is_err() {
            // The executor died between the active check and the submit;
            // the rejected task and its payload handle were dropped with it.
            error!(%origin, "executor rejected datagram, closing session");
            telemetry::record_drop_rejected_submit();
            session.close(false);
        }
    }

    /// Handle a 20-byte control datagram.
    fn handle_control(
        &self,
        payload: &Bytes,
        existing: Option<Arc<Session>>,
        user: &User,
        origin: SocketAddr,
    ) {
        let Some(control) = Control::decode(payload) else {
            return;
        };
        match control {
            Control::Connect { enet } => {
                let conv = match self.waiters.find_by_endpoint(origin) {
                    Some(waiter) => {
                        debug!(%origin, conv = waiter.conv, "reusing pending handshake");
                        waiter.conv
                    }
                    None => {
                        if let Some(session) = existing.as_ref() {
                            // Origin already has a live conversation; echo
                            // its id rather than opening a second one.
                            debug!(%origin, conv = session.conv(), "connect from active session");
                            session.conv()
                        } else {
                            let conv = self.registry.alloc_conv(&self.waiters);
                            info!(%origin, conv, "allocated conversation for handshake");
                            self.waiters.append(HandshakeWaiter { conv, origin });
                            conv
                        }
                    }
                };
                if let Err(e) =
                    Session::send_handshake_rsp(self.output.as_ref(), user, enet, conv)
                {
                    warn!(%origin, error = %e, "failed to send handshake response");
                } else {
                    telemetry::record_handshake_sent();
                }
            }
            Control::Disconnect => {
                if let Some(session) = existing {
                    info!(%origin, conv = session.conv(), "disconnect requested by peer");
                    session.close(false);
                }
            }
            Control::Unknown { code } => {
                debug!(%origin, code, "ignoring control datagram with unrecognized code");
            }
        }
    }

    /// First data datagram for an unknown endpoint: complete the pending
    /// handshake and install the session. The first segment must carry
    /// sequence number zero; anything else leaves the waiter in place.
    fn promote(
        &self,
        payload: &Bytes,
        user: User,
        origin: SocketAddr,
    ) -> Option<Arc<Session>> {
        let conv = wire::conv_of(payload)?;
        let Some(waiter) = self.waiters.find_by_conv(conv) else {
            warn!(%origin, conv, "no pending handshake for conversation, dropping");
            telemetry::record_drop_unknown_conv();
            return None;
        };

        let Some(sn) = wire::sn_at(payload, self.config.sn_offset()) else {
            warn!(%origin, conv, len = payload.len(), "first datagram too short to carry a sequence number");
            telemetry::record_drop_malformed();
            return None;
        };
        if sn != 0 {
            warn!(%origin, conv, sn, "first datagram must carry sequence number 0, dropping");
            telemetry::record_drop_sn_mismatch();
            return None;
        }

        self.waiters.remove(&waiter);

        let session = Session::new(
            self.output.clone(),
            self.listener.clone(),
            self.pool.acquire(),
            self.config.clone(),
            &self.registry,
        );
        session.set_conv(waiter.conv);
        session.set_user(user);
        self.registry.insert(session.clone());
        timer::schedule_update(&self.wheel, session.clone());
        telemetry::record_session_opened();
        info!(%origin, conv = waiter.conv, "handshake established");
        Some(session)
    }
}

/// Runs on the session's executor for every dispatched datagram. Connection
/// notification happens before the first delivery; listener failures go to
/// the exception handler without tearing anything down.
fn deliver(new_connection: bool, session: Arc<Session>, payload: Bytes, origin: SocketAddr) {
    if new_connection {
        debug!(%origin, conv = session.conv(), "notifying listener of new connection");
        if let Err(error) = session.listener().on_connected(&session) {
            session.listener().handle_exception(error, &session);
        }
    }
    if let Err(error) = session.read(payload) {
        session.listener().handle_exception(Box::new(error), &session);
    }
}

/// Handle to a server running in a background task.
///
/// Dropping the handle shuts the server down via the cancellation token;
/// tests that need a clean exit call [`ServerHandle::shutdown`] explicitly.
pub struct ServerHandle {
    /// The address the server is listening on.
    pub addr: SocketAddr,
    server: Arc<Server>,
    task: Option<JoinHandle<io::Result<()>>>,
}

impl ServerHandle {
    /// Bind and spawn a server with the given configuration.
    pub async fn spawn(
        config: ChannelConfig,
        listener: Arc<dyn KcpListener>,
    ) -> io::Result<ServerHandle> {
        let server = Arc::new(Server::bind(config, listener).await?);
        let addr = server.local_addr();
        let runner = server.clone();
        let task = tokio::spawn(async move {
            let result = runner.run().await;
            if let Err(ref e) = result {
                error!(error = %e, "server receive loop failed");
            }
            result
        });
        Ok(ServerHandle {
            addr,
            server,
            task: Some(task),
        })
    }

    pub fn session_count(&self) -> usize {
        self.server.session_count()
    }

    pub fn waiter_count(&self) -> usize {
        self.server.waiter_count()
    }

    pub fn registry(&self) -> &Arc<ConvRegistry> {
        self.server.registry()
    }

    pub fn shutdown(&self) {
        self.server.shutdown();
    }

    /// Shut down and wait for the receive loop to exit.
    pub async fn stop(mut self) -> io::Result<()> {
        self.server.shutdown();
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
            }
        } else {
            Ok(())
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}
