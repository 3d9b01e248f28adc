use mitmrelay::acceptor::{FixedDst, MasterProxy, MitmMasterProxy, MitmUdpProxy, ProxyOptions};
use mitmrelay::auth::AuthTable;
use mitmrelay::dns_cache::ResponseCache;
use mitmrelay::policy::{AllowAll, PolicyEvaluator, PortDenyPolicy};
use mitmrelay::socks::MitmSocksProxy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn spawn_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn shared_state() -> (Arc<AuthTable>, Arc<ResponseCache>, ProxyOptions) {
    (
        Arc::new(AuthTable::new(Duration::from_secs(600))),
        Arc::new(ResponseCache::new("test cache", 64, true)),
        ProxyOptions::default(),
    )
}

async fn start_tcp_proxy(target: SocketAddr, policy: Arc<dyn PolicyEvaluator>) -> (SocketAddr, CancellationToken) {
    let (auth, cache, opts) = shared_state();
    let proxy = MitmMasterProxy::bind("127.0.0.1:0".parse().unwrap(), Arc::new(FixedDst(target)), policy, auth, cache, opts)
        .await
        .unwrap();
    let addr = proxy.local_addr().unwrap();
    let token = CancellationToken::new();
    let run_token = token.clone();
    tokio::spawn(async move {
        Box::new(proxy).run(run_token).await.unwrap();
    });
    (addr, token)
}

#[tokio::test]
async fn tcp_relay_roundtrip() {
    let echo = spawn_tcp_echo().await;
    let (proxy_addr, token) = start_tcp_proxy(echo, Arc::new(AllowAll)).await;

    let result = tokio::time::timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"hello through the relay").await.unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello through the relay");

        // second exchange on the same session keeps byte order
        client.write_all(b"second message").await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second message");
    })
    .await;
    token.cancel();
    result.expect("relay round trip timed out");
}

#[tokio::test]
async fn policy_veto_closes_the_connection() {
    let echo = spawn_tcp_echo().await;
    let policy = Arc::new(PortDenyPolicy::new(vec![echo.port()]));
    let (proxy_addr, token) = start_tcp_proxy(echo, policy).await;

    let result = tokio::time::timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        // the vetoed session is discarded; the client observes a close
        let _ = client.write_all(b"doomed").await;
        let mut buf = [0u8; 16];
        match client.read(&mut buf).await {
            Ok(0) => {}
            Ok(n) => panic!("unexpected {n} bytes through a vetoed session"),
            Err(_) => {}
        }
    })
    .await;
    token.cancel();
    result.expect("veto test timed out");
}

#[tokio::test]
async fn socks5_negotiation_and_relay() {
    let echo = spawn_tcp_echo().await;
    let (auth, cache, opts) = shared_state();
    let proxy = MitmSocksProxy::bind(
        "127.0.0.1:0".parse().unwrap(),
        None,
        None,
        Arc::new(AllowAll),
        auth,
        cache,
        opts,
    )
    .await
    .unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    let token = CancellationToken::new();
    let run_token = token.clone();
    tokio::spawn(async move {
        Box::new(proxy).run(run_token).await.unwrap();
    });

    let result = tokio::time::timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();

        // method selection: no authentication
        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut hello = [0u8; 2];
        client.read_exact(&mut hello).await.unwrap();
        assert_eq!(hello, [5, 0]);

        // CONNECT to the echo server by IPv4 address
        let SocketAddr::V4(echo_v4) = echo else { panic!("echo not v4") };
        let mut request = vec![5, 1, 0, 1];
        request.extend_from_slice(&echo_v4.ip().octets());
        request.extend_from_slice(&echo_v4.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 5);
        assert_eq!(reply[1], 0, "SOCKS5 reply must be Succeeded");

        // relay after hand-off: port is not in the TLS set, plain TCP splice
        client.write_all(b"post-handoff payload").await.unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"post-handoff payload");
    })
    .await;
    token.cancel();
    result.expect("socks5 test timed out");
}

#[tokio::test]
async fn udp_relay_roundtrip() {
    let echo_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo_socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, peer)) = echo_socket.recv_from(&mut buf).await {
            let _ = echo_socket.send_to(&buf[..n], peer).await;
        }
    });

    let (auth, cache, opts) = shared_state();
    let proxy = MitmUdpProxy::bind(
        "127.0.0.1:0".parse().unwrap(),
        echo_addr,
        Arc::new(AllowAll),
        auth,
        cache,
        opts,
    )
    .await
    .unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    let token = CancellationToken::new();
    let run_token = token.clone();
    tokio::spawn(async move {
        Box::new(proxy).run(run_token).await.unwrap();
    });

    let result = tokio::time::timeout(TEST_TIMEOUT, async {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"datagram ping", proxy_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, proxy_addr);
        assert_eq!(&buf[..n], b"datagram ping");
    })
    .await;
    token.cancel();
    result.expect("udp relay timed out");
}
