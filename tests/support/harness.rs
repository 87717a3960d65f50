//! Shared test harness for driving a server through a real UDP socket.
//!
//! Spawns the production server via `ServerHandle` and records listener
//! callbacks as events on a channel, so scenarios can assert on lifecycle
//! ordering without reaching into server internals.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use squall::config::ChannelConfig;
use squall::dispatch::ServerHandle;
use squall::session::{KcpListener, ListenerError, Session};
use squall::wire;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// One recorded listener callback.
#[derive(Debug)]
pub enum Event {
    Connected(u64),
    Received(u64, Bytes),
    Closed(u64),
    Exception(String),
}

/// Listener that forwards every callback onto an unbounded channel.
pub struct EventListener {
    tx: mpsc::UnboundedSender<Event>,
}

impl KcpListener for EventListener {
    fn on_connected(&self, session: &Arc<Session>) -> Result<(), ListenerError> {
        let _ = self.tx.send(Event::Connected(session.conv()));
        Ok(())
    }

    fn handle_receive(&self, payload: Bytes, session: &Arc<Session>) -> Result<(), ListenerError> {
        let _ = self.tx.send(Event::Received(session.conv(), payload));
        Ok(())
    }

    fn handle_exception(&self, error: ListenerError, _session: &Arc<Session>) {
        let _ = self.tx.send(Event::Exception(error.to_string()));
    }

    fn handle_close(&self, session: &Arc<Session>) {
        let _ = self.tx.send(Event::Closed(session.conv()));
    }
}

/// Spawn a server on an ephemeral localhost port with the given config.
pub async fn spawn_server(
    mut config: ChannelConfig,
) -> (ServerHandle, mpsc::UnboundedReceiver<Event>) {
    init_tracing();
    config.listen_addr = "127.0.0.1:0".to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ServerHandle::spawn(config, Arc::new(EventListener { tx }))
        .await
        .expect("failed to spawn server");
    (handle, rx)
}

/// Await the next recorded listener event.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for listener event")
        .expect("event channel closed")
}

/// UDP client socket bound to an ephemeral port.
pub struct Client {
    pub socket: UdpSocket,
}

impl Client {
    pub async fn bind() -> Client {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("failed to bind client socket");
        Client { socket }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("client has no local addr")
    }

    pub async fn send(&self, server: SocketAddr, data: &[u8]) {
        self.socket
            .send_to(data, server)
            .await
            .expect("client send failed");
    }

    pub async fn recv(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 2048];
        let (len, _from) = timeout(RECV_TIMEOUT, self.socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for server datagram")
            .expect("client recv failed");
        buf.truncate(len);
        buf
    }

    /// Run the connect exchange and return the conversation id the server
    /// assigned.
    pub async fn connect(&self, server: SocketAddr, enet: i32) -> u64 {
        self.send(server, &wire::Control::encode_connect(enet)).await;
        let raw = self.recv().await;
        let rsp = wire::HandshakeRsp::decode(&raw).expect("malformed handshake response");
        assert_eq!(rsp.enet, enet);
        rsp.conv
    }
}

/// A minimal data datagram: conversation id, zeroed header fields, given
/// sequence number, plus an optional body after the header.
pub fn data_datagram(conv: u64, sn: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(wire::KCP_HEADER_BASE + body.len());
    buf.resize(wire::KCP_HEADER_BASE, 0);
    buf[..8].copy_from_slice(&conv.to_be_bytes());
    buf[wire::SN_OFFSET..wire::SN_OFFSET + 4].copy_from_slice(&sn.to_le_bytes());
    buf.put_slice(body);
    buf.freeze()
}

/// Wrap a payload in a PROXY v2 INET4 header declaring `src` as the real
/// client.
pub fn proxy_v2_inet4(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Bytes {
    let (SocketAddr::V4(src), SocketAddr::V4(dst)) = (src, dst) else {
        panic!("proxy_v2_inet4 needs v4 addresses");
    };
    let mut buf = BytesMut::with_capacity(28 + payload.len());
    buf.put_slice(&squall::proxy::SIGNATURE);
    buf.put_u8(0x21); // version 2, command PROXY
    buf.put_u8(0x12); // INET4, DGRAM
    buf.put_u16(12);
    buf.put_slice(&src.ip().octets());
    buf.put_slice(&dst.ip().octets());
    buf.put_u16(src.port());
    buf.put_u16(dst.port());
    buf.put_slice(payload);
    buf.freeze()
}

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });
}
