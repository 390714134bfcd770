//! End-to-end gateway tests over real loopback sockets
//!
//! A minimal agent registers over QUIC, accepts virtual connections and
//! dials the requested address locally, the same way the agent binary does.

use rdproxy_auth::{REGISTRATION_PATH, SECRET_HEADER};
use rdproxy_gateway::{Gateway, GatewayConfig, TlsSource};
use rdproxy_proto::{AgentMetadata, RegisterRequest};
use rdproxy_relay::{relay, PeerTarget, RetryPolicy};
use rdproxy_transport::TransportError;
use rdproxy_transport_quic::{AgentConnector, AgentSession, ConnectRequest, QuicConfig};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const SECRET: &str = "test-secret";

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

fn gateway_config(peer_address: String, retry: RetryPolicy) -> GatewayConfig {
    GatewayConfig {
        secret: SECRET.to_string(),
        proxy_addr: "127.0.0.1:0".parse().unwrap(),
        session_addr: "127.0.0.1:0".parse().unwrap(),
        peer_target: PeerTarget::tcp(peer_address),
        tls_name: "localhost".to_string(),
        tls: TlsSource::SelfSigned {
            names: vec!["localhost".to_string()],
        },
        retry,
        debug: true,
    }
}

async fn start_gateway(config: GatewayConfig) -> (SocketAddr, Option<SocketAddr>, CancellationToken) {
    let gateway = Gateway::bind(&config).await.unwrap();
    let session_addr = gateway.session_addr().unwrap();
    let proxy_addr = gateway.proxy_addr();
    let cancel = CancellationToken::new();
    tokio::spawn(gateway.run(cancel.clone()));
    (session_addr, proxy_addr, cancel)
}

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

async fn connect_agent(
    session_addr: SocketAddr,
    secret: &str,
) -> Result<AgentSession, TransportError> {
    let connector = AgentConnector::new(&QuicConfig::client_insecure()).unwrap();
    let request = RegisterRequest::new(
        REGISTRATION_PATH,
        AgentMetadata {
            name: "test-agent".to_string(),
            ..Default::default()
        },
    )
    .with_header(SECRET_HEADER, secret);
    connector.connect(session_addr, "localhost", request).await
}

/// Serve virtual connections by dialing the requested address locally
fn serve_agent(session: AgentSession) {
    tokio::spawn(async move {
        while let Some(stream) = session.accept_stream().await {
            tokio::spawn(async move {
                let request = ConnectRequest::read(stream).await.unwrap();
                match TcpStream::connect(&request.address).await {
                    Ok(local) => {
                        let tunneled = request.accept().await.unwrap();
                        relay(tunneled, local).await;
                    }
                    Err(e) => request.reject(e.to_string()).await,
                }
            });
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hello_proxy_through_one_agent() {
    init_tracing();

    let echo_addr = spawn_echo_server().await;
    let (session_addr, proxy_addr, cancel) =
        start_gateway(gateway_config(echo_addr.to_string(), RetryPolicy::default())).await;

    let session = connect_agent(session_addr, SECRET).await.unwrap();
    serve_agent(session);

    let mut proxy_conn = TcpStream::connect(proxy_addr.unwrap()).await.unwrap();

    const MESSAGE: &[u8] = b"hello proxy";
    proxy_conn.write_all(MESSAGE).await.unwrap();

    let mut buf = vec![0u8; MESSAGE.len()];
    timeout(Duration::from_secs(2), proxy_conn.read_exact(&mut buf))
        .await
        .expect("no echo within 2s")
        .unwrap();
    assert_eq!(buf, MESSAGE);

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_zero_agents_closes_socket_after_budget() {
    init_tracing();

    let echo_addr = spawn_echo_server().await;
    let retry = RetryPolicy::new(10, Duration::from_millis(50));
    let (_, proxy_addr, cancel) = start_gateway(gateway_config(echo_addr.to_string(), retry)).await;

    let started = Instant::now();
    let mut proxy_conn = TcpStream::connect(proxy_addr.unwrap()).await.unwrap();
    proxy_conn.write_all(b"nobody home").await.unwrap();

    let mut received = Vec::new();
    let read = timeout(Duration::from_secs(5), proxy_conn.read_to_end(&mut received))
        .await
        .expect("socket was not closed");

    // Either a clean EOF or a reset, but never any relayed bytes.
    if let Ok(n) = read {
        assert_eq!(n, 0);
    }
    assert!(received.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(500));

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_agent_with_wrong_secret_is_rejected() {
    init_tracing();

    let (session_addr, _, cancel) =
        start_gateway(gateway_config("127.0.0.1:1".to_string(), RetryPolicy::default())).await;

    let result = connect_agent(session_addr, "wrong-secret").await;
    assert!(matches!(
        result,
        Err(TransportError::RegistrationRejected(_))
    ));

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_proxy_bind_failure_keeps_session_server() {
    init_tracing();

    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = gateway_config("127.0.0.1:1".to_string(), RetryPolicy::default());
    config.proxy_addr = occupied.local_addr().unwrap();

    let gateway = Gateway::bind(&config).await.unwrap();
    assert!(gateway.proxy_addr().is_none());
    let session_addr = gateway.session_addr().unwrap();
    let pool = gateway.pool();
    let cancel = CancellationToken::new();
    tokio::spawn(gateway.run(cancel.clone()));

    let session = connect_agent(session_addr, SECRET).await.unwrap();
    assert_eq!(pool.len(), 1);

    session.close();
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_stops_proxy_listener() {
    init_tracing();

    let (_, proxy_addr, cancel) =
        start_gateway(gateway_config("127.0.0.1:1".to_string(), RetryPolicy::default())).await;
    let proxy_addr = proxy_addr.unwrap();

    cancel.cancel();

    let refused = timeout(Duration::from_secs(2), async {
        loop {
            if TcpStream::connect(proxy_addr).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(refused.is_ok(), "proxy listener still accepting after shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_keeps_open_relay_until_it_finishes() {
    init_tracing();

    let echo_addr = spawn_echo_server().await;
    let config = gateway_config(echo_addr.to_string(), RetryPolicy::default());
    let gateway = Gateway::bind(&config).await.unwrap();
    let session_addr = gateway.session_addr().unwrap();
    let proxy_addr = gateway.proxy_addr().unwrap();
    let pool = gateway.pool();
    let cancel = CancellationToken::new();
    let running = tokio::spawn(gateway.run(cancel.clone()));

    let session = connect_agent(session_addr, SECRET).await.unwrap();
    serve_agent(session);

    let mut proxy_conn = TcpStream::connect(proxy_addr).await.unwrap();
    let mut buf = [0u8; 6];
    proxy_conn.write_all(b"before").await.unwrap();
    timeout(Duration::from_secs(2), proxy_conn.read_exact(&mut buf))
        .await
        .expect("no echo within 2s")
        .unwrap();
    assert_eq!(&buf, b"before");

    cancel.cancel();

    proxy_conn.write_all(b"after!").await.unwrap();
    timeout(Duration::from_secs(2), proxy_conn.read_exact(&mut buf))
        .await
        .expect("relay torn down by shutdown")
        .unwrap();
    assert_eq!(&buf, b"after!");
    assert_eq!(pool.len(), 1);
    assert!(!running.is_finished());

    // Closing the client ends the last relay, and with it the gateway.
    drop(proxy_conn);
    timeout(Duration::from_secs(5), running)
        .await
        .expect("gateway did not stop after the relay finished")
        .unwrap();
    wait_until_empty(&pool).await;
}

async fn wait_until_empty(pool: &rdproxy_transport_quic::QuicAgentPool) {
    timeout(Duration::from_secs(5), async {
        while !pool.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions still registered after shutdown");
}
