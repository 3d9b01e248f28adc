use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;
use udp_stream::UdpStream;

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Transport flavor of an endpoint. Stream transports carry DNS messages
/// behind a two-byte length prefix, datagram transports do not.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransportKind {
    Tcp,
    Tls,
    Udp,
}

impl TransportKind {
    pub fn supports_framing(&self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::Tls)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "TCP"),
            TransportKind::Tls => write!(f, "TLS"),
            TransportKind::Udp => write!(f, "UDP"),
        }
    }
}

/// The socket owned by an endpoint. `Detached` marks an endpoint whose socket
/// was moved out during a hand-off (or never attached); dropping a detached
/// endpoint closes nothing.
pub enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Udp(UdpStream),
    Detached,
}

/// One half of a relayed connection: the socket, its buffers, and the
/// transparent-redirection metadata the acceptor resolved for it.
pub struct Endpoint {
    name: String,
    kind: TransportKind,
    transport: Transport,
    read_buf: Vec<u8>,
    write_buf: VecDeque<u8>,
    paused: bool,
    peer_addr: Option<SocketAddr>,
    nonlocal_dst: Option<SocketAddr>,
    nonlocal_src: Option<SocketAddr>,
    log_buf: String,
    pub meter_read_bytes: u64,
    pub meter_write_bytes: u64,
    pub meter_read_count: u64,
    pub meter_write_count: u64,
}

impl Endpoint {
    fn with_transport(name: String, kind: TransportKind, transport: Transport) -> Self {
        Self {
            name,
            kind,
            transport,
            read_buf: Vec::new(),
            write_buf: VecDeque::new(),
            paused: false,
            peer_addr: None,
            nonlocal_dst: None,
            nonlocal_src: None,
            log_buf: String::new(),
            meter_read_bytes: 0,
            meter_write_bytes: 0,
            meter_read_count: 0,
            meter_write_count: 0,
        }
    }

    pub fn from_tcp(stream: TcpStream, name: String) -> Self {
        Self::with_transport(name, TransportKind::Tcp, Transport::Tcp(stream))
    }

    pub fn from_tls(stream: TlsStream<TcpStream>, name: String) -> Self {
        Self::with_transport(name, TransportKind::Tls, Transport::Tls(Box::new(stream)))
    }

    pub fn from_udp(stream: UdpStream, name: String) -> Self {
        Self::with_transport(name, TransportKind::Udp, Transport::Udp(stream))
    }

    /// Endpoint without a socket; used by hand-off staging and by tests that
    /// drive the relay logic directly.
    pub fn detached(kind: TransportKind, name: String) -> Self {
        Self::with_transport(name, kind, Transport::Detached)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn is_detached(&self) -> bool {
        matches!(self.transport, Transport::Detached)
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn set_peer_addr(&mut self, addr: SocketAddr) {
        self.peer_addr = Some(addr);
    }

    pub fn nonlocal_dst(&self) -> Option<SocketAddr> {
        self.nonlocal_dst
    }

    pub fn set_nonlocal_dst(&mut self, addr: SocketAddr) {
        self.nonlocal_dst = Some(addr);
    }

    pub fn dst_resolved(&self) -> bool {
        self.nonlocal_dst.is_some()
    }

    pub fn nonlocal_src(&self) -> Option<SocketAddr> {
        self.nonlocal_src
    }

    pub fn set_nonlocal_src(&mut self, addr: SocketAddr) {
        self.nonlocal_src = Some(addr);
    }

    /// View of the bytes read from the socket and not yet relayed. The owning
    /// session wipes this with [`Endpoint::consume_read`] once forwarded.
    pub fn to_read(&self) -> &[u8] {
        &self.read_buf
    }

    pub fn consume_read(&mut self) {
        self.read_buf.clear();
    }

    /// Queues bytes for delivery to this endpoint's socket.
    pub fn to_write(&mut self, bytes: &[u8]) {
        self.write_buf.extend(bytes);
    }

    pub fn pending_write(&self) -> usize {
        self.write_buf.len()
    }

    pub fn clear_write_buf(&mut self) {
        self.write_buf.clear();
    }

    pub fn log_append(&mut self, text: &str) {
        self.log_buf.push_str(text);
    }

    pub fn take_log(&mut self) -> String {
        std::mem::take(&mut self.log_buf)
    }

    /// Feeds bytes into the read buffer as if they had arrived from the
    /// socket; used by tests and by the hand-off path to carry over data.
    pub fn inject_read(&mut self, bytes: &[u8]) {
        self.read_buf.extend_from_slice(bytes);
        self.meter_read_bytes += bytes.len() as u64;
        self.meter_read_count += 1;
    }

    /// Moves the socket out, leaving the endpoint detached. The detached
    /// endpoint's drop closes no descriptor, so a hand-off never tears down
    /// the live connection.
    pub fn take_transport(&mut self) -> Transport {
        std::mem::replace(&mut self.transport, Transport::Detached)
    }

    /// Reads once from the socket into the read buffer. `Ok(0)` signals an
    /// orderly close; datagram transports return one datagram per call.
    pub async fn read_some(&mut self) -> std::io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let n = match &mut self.transport {
            Transport::Tcp(s) => s.read(&mut chunk).await?,
            Transport::Tls(s) => s.read(&mut chunk).await?,
            Transport::Udp(s) => s.read(&mut chunk).await?,
            Transport::Detached => return Err(std::io::ErrorKind::NotConnected.into()),
        };
        if n > 0 {
            self.read_buf.extend_from_slice(&chunk[..n]);
            self.meter_read_bytes += n as u64;
            self.meter_read_count += 1;
        }
        Ok(n)
    }

    /// Writes out everything queued in the write buffer.
    pub async fn flush_write(&mut self) -> std::io::Result<usize> {
        if self.write_buf.is_empty() {
            return Ok(0);
        }
        let data: Vec<u8> = self.write_buf.drain(..).collect();
        match &mut self.transport {
            Transport::Tcp(s) => s.write_all(&data).await?,
            Transport::Tls(s) => s.write_all(&data).await?,
            Transport::Udp(s) => s.write_all(&data).await?,
            Transport::Detached => return Err(std::io::ErrorKind::NotConnected.into()),
        }
        self.meter_write_bytes += data.len() as u64;
        self.meter_write_count += 1;
        Ok(data.len())
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_endpoint_buffers_without_socket() {
        let mut cx = Endpoint::detached(TransportKind::Tcp, "test".into());
        cx.inject_read(b"hello");
        assert_eq!(cx.to_read(), b"hello");
        cx.consume_read();
        assert!(cx.to_read().is_empty());
        cx.to_write(b"world");
        assert_eq!(cx.pending_write(), 5);
        cx.clear_write_buf();
        assert_eq!(cx.pending_write(), 0);
    }

    #[test]
    fn take_transport_leaves_endpoint_detached() {
        let mut cx = Endpoint::detached(TransportKind::Tcp, "test".into());
        assert!(matches!(cx.take_transport(), Transport::Detached));
        assert!(cx.is_detached());
    }

    #[test]
    fn framing_follows_transport_kind() {
        assert!(TransportKind::Tcp.supports_framing());
        assert!(TransportKind::Tls.supports_framing());
        assert!(!TransportKind::Udp.supports_framing());
    }
}
