use crate::acceptor::{build_session, connect_target, session_pump, MasterProxy, ProxyOptions};
use crate::auth::AuthTable;
use crate::dns_cache::ResponseCache;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::policy::PolicyEvaluator;
use crate::session::ProxySession;
use crate::tls::{server_name_for, TlsContext};
use socks5_impl::protocol::password_method::Status;
use socks5_impl::protocol::{handshake, password_method, Address, AsyncStreamOperation, AuthMethod, Command, Reply, Request, Response, UserKey};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Destination ports that select the TLS-splicing transport on hand-off.
pub const TLS_PORTS: [u16; 5] = [443, 465, 636, 993, 995];

pub fn is_tls_port(port: u16) -> bool {
    TLS_PORTS.contains(&port)
}

/// Lifecycle of the client-facing negotiation endpoint. After `Zombie` the
/// object holds no socket and is only waiting to be dropped.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SocksPhase {
    WaitRequest,
    WaitPolicy,
    Handoff,
    Zombie,
}

/// Server side of the SOCKS5 sub-protocol. Performs the negotiation on the
/// accepted socket, then surrenders the socket to a relayed session.
pub struct SocksServerCx {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    phase: SocksPhase,
    credentials: Option<UserKey>,
    dst: Option<SocketAddr>,
}

async fn resolve_address(address: &Address) -> Result<SocketAddr> {
    match address {
        Address::SocketAddress(addr) => Ok(*addr),
        Address::DomainAddress(host, port) => {
            let mut addrs = tokio::net::lookup_host((host.as_str(), *port)).await?;
            addrs
                .next()
                .ok_or_else(|| Error::from(format!("`{host}` does not resolve to a usable address")))
        }
    }
}

impl SocksServerCx {
    pub fn new(stream: TcpStream, peer: SocketAddr, credentials: Option<UserKey>) -> Self {
        Self {
            stream: Some(stream),
            peer,
            phase: SocksPhase::WaitRequest,
            credentials,
            dst: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn phase(&self) -> SocksPhase {
        self.phase
    }

    pub fn dst(&self) -> Option<SocketAddr> {
        self.dst
    }

    /// Runs the SOCKS5 negotiation to completion: method selection, optional
    /// username/password sub-negotiation, then the CONNECT request.
    pub async fn negotiate(&mut self) -> Result<SocketAddr> {
        let stream = self.stream.as_mut().ok_or("negotiation endpoint already handed off")?;

        let request = handshake::Request::retrieve_from_async_stream(stream).await?;
        let method = if self.credentials.is_some() {
            AuthMethod::UserPass
        } else {
            AuthMethod::NoAuth
        };
        if !request.evaluate_method(method) {
            handshake::Response::new(AuthMethod::NoAcceptableMethods)
                .write_to_async_stream(stream)
                .await?;
            return Err("client offered no acceptable authentication method".into());
        }
        handshake::Response::new(method).write_to_async_stream(stream).await?;

        if let Some(expected) = &self.credentials {
            let auth = password_method::Request::retrieve_from_async_stream(stream).await?;
            let accepted = &auth.user_key == expected;
            let status = if accepted { Status::Succeeded } else { Status::Failed };
            password_method::Response::new(status).write_to_async_stream(stream).await?;
            if !accepted {
                return Err("SOCKS5 authentication failed".into());
            }
        }

        let request = Request::retrieve_from_async_stream(stream).await?;
        if request.command != Command::Connect {
            Response::new(Reply::CommandNotSupported, Address::unspecified())
                .write_to_async_stream(stream)
                .await?;
            return Err("unsupported SOCKS5 command".into());
        }
        let dst = resolve_address(&request.address).await?;
        Response::new(Reply::Succeeded, Address::unspecified())
            .write_to_async_stream(stream)
            .await?;

        log::debug!("socks5 negotiation with {} completed, destination {}", self.peer, dst);
        self.dst = Some(dst);
        self.phase = SocksPhase::WaitPolicy;
        Ok(dst)
    }

    fn take_stream(&mut self) -> Option<TcpStream> {
        self.stream.take()
    }
}

/// Promotes a negotiated SOCKS5 endpoint into a relayed session. The socket
/// moves into a fresh paused endpoint carrying the negotiated destination;
/// the old negotiation object ends up a zombie owning nothing. Well-known
/// TLS ports get both legs explicitly upgraded before relaying begins.
pub async fn socks5_handoff(
    mut cx: SocksServerCx,
    tls: Option<Arc<TlsContext>>,
    policy: &dyn PolicyEvaluator,
    auth: &AuthTable,
    dns_cache: &Arc<ResponseCache>,
    opts: &ProxyOptions,
) -> Result<ProxySession> {
    let dst = cx.dst().ok_or("hand-off without a negotiated destination")?;
    let peer = cx.peer();
    cx.phase = SocksPhase::Handoff;
    let stream = cx.take_stream().ok_or("negotiation endpoint already handed off")?;
    cx.phase = SocksPhase::Zombie;

    let tls_ctx = if is_tls_port(dst.port()) {
        Some(tls.ok_or("TLS hand-off requires certificate material")?)
    } else {
        None
    };

    let mut accepted_cx = match &tls_ctx {
        Some(ctx) => {
            let tls_stream = ctx.acceptor().accept(stream).await?;
            let mut ep = Endpoint::from_tls(tokio_rustls::TlsStream::Server(tls_stream), format!("L:{peer}"));
            ep.log_append("TLS established on client leg\n");
            ep
        }
        None => Endpoint::from_tcp(stream, format!("L:{peer}")),
    };
    accepted_cx.set_paused(true);
    accepted_cx.set_peer_addr(peer);
    accepted_cx.set_nonlocal_dst(dst);
    accepted_cx.log_append(&format!("SOCKS5 hand-off to {dst}\n"));

    let target_cx = match &tls_ctx {
        Some(ctx) => {
            let timeout = Duration::from_secs(opts.connect_timeout_secs.max(1));
            let tcp = tokio::time::timeout(timeout, TcpStream::connect(dst))
                .await
                .map_err(|_| Error::from(format!("connect to {dst} timed out")))??;
            let upstream = ctx.connector().connect(server_name_for(&dst), tcp).await?;
            let mut ep = Endpoint::from_tls(tokio_rustls::TlsStream::Client(upstream), format!("R:{dst}"));
            ep.set_nonlocal_dst(dst);
            ep.set_nonlocal_src(peer);
            ep.log_append("TLS established on server leg\n");
            ep
        }
        None => connect_target(dst, peer, opts.connect_timeout_secs).await?,
    };

    accepted_cx.set_paused(false);
    build_session(accepted_cx, target_cx, policy, auth, dns_cache, opts, opts.tcp_timeout_secs)
        .ok_or_else(|| Error::from(format!("policy vetoed SOCKS5 session from {peer} to {dst}")))
}

/// Accepts SOCKS5 clients and relays each negotiated connection.
pub struct MitmSocksProxy {
    listener: TcpListener,
    credentials: Option<UserKey>,
    tls: Option<Arc<TlsContext>>,
    policy: Arc<dyn PolicyEvaluator>,
    auth: Arc<AuthTable>,
    dns_cache: Arc<ResponseCache>,
    opts: ProxyOptions,
}

impl MitmSocksProxy {
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        addr: SocketAddr,
        credentials: Option<UserKey>,
        tls: Option<Arc<TlsContext>>,
        policy: Arc<dyn PolicyEvaluator>,
        auth: Arc<AuthTable>,
        dns_cache: Arc<ResponseCache>,
        opts: ProxyOptions,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            credentials,
            tls,
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
        let credentials = self.credentials.clone();
        let tls = self.tls.clone();
        let policy = self.policy.clone();
        let auth = self.auth.clone();
        let dns_cache = self.dns_cache.clone();
        let opts = self.opts.clone();
        sessions.spawn(async move {
            let mut cx = SocksServerCx::new(stream, peer, credentials);
            match cx.negotiate().await {
                Ok(_) => {
                    match socks5_handoff(cx, tls, policy.as_ref(), auth.as_ref(), &dns_cache, &opts).await {
                        Ok(session) => session_pump(session).await,
                        Err(err) => log::error!("socks5 hand-off failed for {peer}: {err}"),
                    }
                }
                Err(err) => log::info!("socks5 negotiation with {peer} failed: {err}"),
            }
        });
    }
}

#[async_trait::async_trait]
impl MasterProxy for MitmSocksProxy {
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        log::info!("socks5 acceptor listening on {}", self.listener.local_addr()?);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_port_set_matches_handoff_contract() {
        for port in TLS_PORTS {
            assert!(is_tls_port(port));
        }
        assert!(!is_tls_port(80));
        assert!(!is_tls_port(8080));
        assert!(!is_tls_port(53));
    }
}
