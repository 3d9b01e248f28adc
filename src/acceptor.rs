use crate::auth::AuthTable;
use crate::dns_cache::ResponseCache;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::policy::PolicyEvaluator;
use crate::session::ProxySession;
use crate::stats;
use crate::traflog::TrafficLog;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use udp_stream::{UdpListener, UdpStream};

pub const DNS_PORT: u16 = 53;

/// Settings shared by every acceptor flavor.
#[derive(Clone, Debug)]
pub struct ProxyOptions {
    pub write_payload: bool,
    pub payload_dir: PathBuf,
    pub payload_prefix: String,
    pub payload_suffix: String,
    pub tcp_timeout_secs: u64,
    pub udp_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_sessions: usize,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            write_payload: false,
            payload_dir: PathBuf::from("mitm"),
            payload_prefix: String::new(),
            payload_suffix: "smcap".to_string(),
            tcp_timeout_secs: 600,
            udp_timeout_secs: 60,
            connect_timeout_secs: 10,
            max_sessions: 200,
        }
    }
}

/// Read access to the transparent-redirection metadata of an accepted socket.
/// The proxy only consumes this; producing it is the kernel's business.
pub trait DstResolver: Send + Sync {
    fn resolve(&self, stream: &TcpStream) -> Option<SocketAddr>;
}

/// Routes every accepted connection to one configured destination. Used when
/// no redirection metadata is available, and by tests.
pub struct FixedDst(pub SocketAddr);

impl DstResolver for FixedDst {
    fn resolve(&self, _stream: &TcpStream) -> Option<SocketAddr> {
        Some(self.0)
    }
}

/// Reads the pre-NAT destination recorded by the kernel for a redirected
/// connection.
#[cfg(target_os = "linux")]
pub struct OriginalDst;

#[cfg(target_os = "linux")]
impl DstResolver for OriginalDst {
    fn resolve(&self, stream: &TcpStream) -> Option<SocketAddr> {
        use nix::sys::socket::{getsockopt, sockopt};
        use std::net::{Ipv4Addr, Ipv6Addr};

        if let Ok(sa) = getsockopt(stream, sockopt::OriginalDst) {
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            return Some(SocketAddr::new(ip.into(), port));
        }
        if let Ok(sa6) = getsockopt(stream, sockopt::Ip6tOriginalDst) {
            let ip = Ipv6Addr::from(sa6.sin6_addr.s6_addr);
            let port = u16::from_be(sa6.sin6_port);
            return Some(SocketAddr::new(ip.into(), port));
        }
        None
    }
}

/// A listening proxy flavor, driven until the shutdown token fires.
#[async_trait::async_trait]
pub trait MasterProxy: Send {
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Assembles a session from an accepted endpoint and its outbound pair, and
/// gates it through policy. `None` means the session was vetoed and must be
/// discarded without registration.
pub(crate) fn build_session(
    accepted_cx: Endpoint,
    target_cx: Endpoint,
    policy: &dyn PolicyEvaluator,
    auth: &AuthTable,
    dns_cache: &Arc<ResponseCache>,
    opts: &ProxyOptions,
    idle_timeout_secs: u64,
) -> Option<ProxySession> {
    let mut session = ProxySession::new();
    session.set_idle_timeout_secs(idle_timeout_secs);
    if let Some(dst) = accepted_cx.nonlocal_dst() {
        if dst.port() == DNS_PORT {
            session.enable_dns_inspection(accepted_cx.kind(), dns_cache.clone());
        }
    }
    session.ladd(accepted_cx);
    session.radd(target_cx);

    let verdict = {
        let accepted = session.left().first()?;
        policy.apply(accepted, &session)
    }?;

    session.set_matched_policy(&verdict.tag);
    if let Some(rules) = verdict.content_rules {
        session.set_content_rules(rules);
    }
    if opts.write_payload && verdict.write_payload {
        let peer = session
            .left()
            .first()
            .and_then(|cx| cx.peer_addr())
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let label = format!("{}-{}", session.id(), peer);
        let mut tlog = TrafficLog::new(&opts.payload_dir, &opts.payload_prefix, &opts.payload_suffix, &label);
        tlog.left_write("Connection start\n");
        session.set_traffic_log(tlog);
    }
    session.resolve_identity(auth);
    Some(session)
}

/// Connects the outbound leg of a session, carrying the observed client
/// source address for upstream attribution.
pub(crate) async fn connect_target(dst: SocketAddr, peer: SocketAddr, connect_timeout_secs: u64) -> Result<Endpoint> {
    let timeout = Duration::from_secs(connect_timeout_secs.max(1));
    let stream = tokio::time::timeout(timeout, TcpStream::connect(dst))
        .await
        .map_err(|_| Error::from(format!("connect to {dst} timed out")))??;
    let mut cx = Endpoint::from_tcp(stream, format!("R:{dst}"));
    cx.set_nonlocal_dst(dst);
    cx.set_nonlocal_src(peer);
    Ok(cx)
}

async fn read_side(side: &mut [Endpoint]) -> (usize, std::io::Result<usize>) {
    for (idx, cx) in side.iter_mut().enumerate() {
        if cx.paused() || cx.is_detached() {
            continue;
        }
        return (idx, cx.read_some().await);
    }
    std::future::pending().await
}

enum PumpEvent {
    Left(usize, std::io::Result<usize>),
    Right(usize, std::io::Result<usize>),
    Idle,
}

/// Drives one session until it is dead: waits for readiness, lets the session
/// react, then flushes whatever the reaction queued. The session itself never
/// blocks.
pub(crate) async fn session_pump(mut session: ProxySession) {
    log::info!("Connection {} established", session);
    // deliver bytes staged during setup, e.g. by a SOCKS hand-off
    session.flush_writes().await;

    while !session.dead() {
        let idle = Duration::from_secs(session.idle_timeout_secs().max(1));
        let event = {
            let (left, right) = session.sides_mut();
            tokio::select! {
                (idx, result) = read_side(left) => PumpEvent::Left(idx, result),
                (idx, result) = read_side(right) => PumpEvent::Right(idx, result),
                _ = tokio::time::sleep(idle) => PumpEvent::Idle,
            }
        };
        match event {
            PumpEvent::Left(idx, Ok(n)) if n > 0 => {
                stats::traffic_update(n, 0);
                session.on_left_bytes(idx);
            }
            PumpEvent::Left(idx, _) => session.on_left_error(idx),
            PumpEvent::Right(idx, Ok(n)) if n > 0 => {
                stats::traffic_update(0, n);
                session.on_right_bytes(idx);
            }
            PumpEvent::Right(idx, _) => session.on_right_error(idx),
            PumpEvent::Idle => {
                log::info!("Connection {} reached idle timeout", session);
                session.set_dead();
            }
        }
        if !session.dead() {
            session.flush_writes().await;
        }
    }
    log::debug!("Connection {} torn down", session);
}

/// Accepts transparently redirected TCP connections and spawns one relayed
/// session per connection.
pub struct MitmMasterProxy {
    listener: TcpListener,
    resolver: Arc<dyn DstResolver>,
    policy: Arc<dyn PolicyEvaluator>,
    auth: Arc<AuthTable>,
    dns_cache: Arc<ResponseCache>,
    opts: ProxyOptions,
}

impl MitmMasterProxy {
    pub async fn bind(
        addr: SocketAddr,
        resolver: Arc<dyn DstResolver>,
        policy: Arc<dyn PolicyEvaluator>,
        auth: Arc<AuthTable>,
        dns_cache: Arc<ResponseCache>,
        opts: ProxyOptions,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            resolver,
            policy,
            auth,
            dns_cache,
            opts,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn on_left_new(&self, stream: TcpStream, peer: SocketAddr, sessions: &mut JoinSet<()>) {
        if sessions.len() >= self.opts.max_sessions {
            log::warn!("session limit {} reached, rejecting {}", self.opts.max_sessions, peer);
            return;
        }
        // a connection whose true destination is unknown cannot be proxied
        let Some(dst) = self.resolver.resolve(&stream) else {
            log::error!("Was not possible to resolve original destination for {peer}!");
            return;
        };
        let mut accepted_cx = Endpoint::from_tcp(stream, format!("L:{peer}"));
        accepted_cx.set_peer_addr(peer);
        accepted_cx.set_nonlocal_dst(dst);

        let policy = self.policy.clone();
        let auth = self.auth.clone();
        let dns_cache = self.dns_cache.clone();
        let opts = self.opts.clone();
        sessions.spawn(async move {
            let target_cx = match connect_target(dst, peer, opts.connect_timeout_secs).await {
                Ok(cx) => cx,
                Err(err) => {
                    log::error!("connect to {dst} failed: {err}");
                    return;
                }
            };
            let idle = opts.tcp_timeout_secs;
            match build_session(accepted_cx, target_cx, policy.as_ref(), auth.as_ref(), &dns_cache, &opts, idle) {
                Some(session) => session_pump(session).await,
                None => log::info!("policy vetoed connection from {peer} to {dst}"),
            }
        });
    }
}

#[async_trait::async_trait]
impl MasterProxy for MitmMasterProxy {
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        log::info!("tcp acceptor listening on {}", self.listener.local_addr()?);
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => self.on_left_new(stream, peer, &mut sessions),
                    Err(err) => log::error!("accept failed: {err}"),
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }
        sessions.shutdown().await;
        Ok(())
    }
}

/// Receives redirected UDP flows and relays each peer's datagram stream to
/// the configured destination.
pub struct MitmUdpProxy {
    listener: UdpListener,
    target: SocketAddr,
    policy: Arc<dyn PolicyEvaluator>,
    auth: Arc<AuthTable>,
    dns_cache: Arc<ResponseCache>,
    opts: ProxyOptions,
}

impl MitmUdpProxy {
    pub async fn bind(
        addr: SocketAddr,
        target: SocketAddr,
        policy: Arc<dyn PolicyEvaluator>,
        auth: Arc<AuthTable>,
        dns_cache: Arc<ResponseCache>,
        opts: ProxyOptions,
    ) -> Result<Self> {
        let listener = UdpListener::bind(addr).await?;
        Ok(Self {
            listener,
            target,
            policy,
            auth,
            dns_cache,
            opts,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn on_left_new(&self, stream: UdpStream, peer: SocketAddr, sessions: &mut JoinSet<()>) {
        if sessions.len() >= self.opts.max_sessions {
            log::warn!("session limit {} reached, rejecting {}", self.opts.max_sessions, peer);
            return;
        }
        let target = self.target;
        let mut accepted_cx = Endpoint::from_udp(stream, format!("L:{peer}"));
        accepted_cx.set_peer_addr(peer);
        accepted_cx.set_nonlocal_dst(target);

        let policy = self.policy.clone();
        let auth = self.auth.clone();
        let dns_cache = self.dns_cache.clone();
        let opts = self.opts.clone();
        sessions.spawn(async move {
            let target_cx = match UdpStream::connect(target).await {
                Ok(stream) => {
                    let mut cx = Endpoint::from_udp(stream, format!("R:{target}"));
                    cx.set_nonlocal_dst(target);
                    cx.set_nonlocal_src(peer);
                    cx
                }
                Err(err) => {
                    log::error!("udp connect to {target} failed: {err}");
                    return;
                }
            };
            let idle = opts.udp_timeout_secs;
            match build_session(accepted_cx, target_cx, policy.as_ref(), auth.as_ref(), &dns_cache, &opts, idle) {
                Some(session) => session_pump(session).await,
                None => log::info!("policy vetoed udp flow from {peer} to {target}"),
            }
        });
    }
}

#[async_trait::async_trait]
impl MasterProxy for MitmUdpProxy {
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        log::info!("udp receiver listening on {}, relaying to {}", self.listener.local_addr()?, self.target);
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => self.on_left_new(stream, peer, &mut sessions),
                    Err(err) => log::error!("udp accept failed: {err}"),
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }
        sessions.shutdown().await;
        Ok(())
    }
}
