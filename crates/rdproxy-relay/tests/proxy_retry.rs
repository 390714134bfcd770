//! Selection, retry and proxy behaviour against an in-memory agent pool

use async_trait::async_trait;
use rdproxy_relay::{
    bind, dial_any_agent, PeerTarget, ProxyServer, RetryPolicy, SelectError,
};
use rdproxy_transport::{AgentId, AgentPool, TransportError, TransportResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

struct MockPool {
    agents: Mutex<Vec<AgentId>>,
    dials: AtomicUsize,
    refuse_dials: bool,
    far_ends: mpsc::UnboundedSender<(AgentId, String, DuplexStream)>,
}

impl MockPool {
    fn new(
        agents: &[&str],
        refuse_dials: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(AgentId, String, DuplexStream)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Self {
            agents: Mutex::new(agents.iter().map(|a| AgentId::from(*a)).collect()),
            dials: AtomicUsize::new(0),
            refuse_dials,
            far_ends: tx,
        };
        (Arc::new(pool), rx)
    }

    fn add(&self, agent: &str) {
        self.agents.lock().unwrap().push(AgentId::from(agent));
    }

    fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentPool for MockPool {
    type Conn = DuplexStream;

    fn list_agents(&self) -> Vec<AgentId> {
        self.agents.lock().unwrap().clone()
    }

    async fn dial(
        &self,
        agent: &AgentId,
        _protocol: &str,
        address: &str,
    ) -> TransportResult<DuplexStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.refuse_dials {
            return Err(TransportError::DialRejected("connection refused".into()));
        }
        let (near, far) = duplex(1024);
        let _ = self
            .far_ends
            .send((agent.clone(), address.to_string(), far));
        Ok(near)
    }
}

fn peer() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

fn target() -> PeerTarget {
    PeerTarget::tcp("127.0.0.1:6666")
}

async fn assert_closed(stream: &mut DuplexStream) {
    let mut buf = Vec::new();
    let n = timeout(Duration::from_secs(1), stream.read_to_end(&mut buf))
        .await
        .expect("inbound stream was not closed")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test(start_paused = true)]
async fn test_empty_pool_gives_up_after_budget() {
    let (pool, _far_ends) = MockPool::new(&[], false);
    let server = ProxyServer::new(pool.clone(), target(), RetryPolicy::default());
    let (mut client, inbound) = duplex(64);

    let started = Instant::now();
    let result = server
        .handle_connection(inbound, peer(), &CancellationToken::new())
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(SelectError::NoAgents { attempts: 10 })));
    assert_eq!(elapsed, Duration::from_secs(10));
    assert_eq!(pool.dial_count(), 0);
    assert_closed(&mut client).await;
}

#[tokio::test(start_paused = true)]
async fn test_custom_policy_bounds_wait() {
    let (pool, _far_ends) = MockPool::new(&[], false);
    let policy = RetryPolicy::new(3, Duration::from_millis(250));

    let started = Instant::now();
    let result = dial_any_agent(pool.as_ref(), &target(), &policy, &CancellationToken::new()).await;

    assert!(matches!(result, Err(SelectError::NoAgents { attempts: 3 })));
    assert_eq!(started.elapsed(), Duration::from_millis(750));
}

#[tokio::test(start_paused = true)]
async fn test_agent_appearing_mid_window_is_dialed_next_attempt() {
    let (pool, mut far_ends) = MockPool::new(&[], false);

    let late = pool.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(3500)).await;
        late.add("late-agent");
    });

    let started = Instant::now();
    let (agent, _conn) = dial_any_agent(
        pool.as_ref(),
        &target(),
        &RetryPolicy::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(agent.as_str(), "late-agent");
    assert_eq!(started.elapsed(), Duration::from_secs(4));
    assert_eq!(pool.dial_count(), 1);

    let (dialed, address, _far) = far_ends.recv().await.unwrap();
    assert_eq!(dialed, agent);
    assert_eq!(address, "127.0.0.1:6666");
}

#[tokio::test(start_paused = true)]
async fn test_dial_failure_is_not_retried() {
    let (pool, _far_ends) = MockPool::new(&["a", "b", "c"], true);
    let server = ProxyServer::new(pool.clone(), target(), RetryPolicy::default());
    let (mut client, inbound) = duplex(64);

    let started = Instant::now();
    let result = server
        .handle_connection(inbound, peer(), &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(SelectError::Dial { .. })));
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(pool.dial_count(), 1);
    assert_closed(&mut client).await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_retry_sleep() {
    let (pool, _far_ends) = MockPool::new(&[], false);
    let server = ProxyServer::new(pool.clone(), target(), RetryPolicy::default());
    let (mut client, inbound) = duplex(64);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = server.handle_connection(inbound, peer(), &cancel).await;

    assert!(matches!(result, Err(SelectError::Cancelled)));
    assert_eq!(started.elapsed(), Duration::from_millis(2500));
    assert_closed(&mut client).await;
}

#[tokio::test]
async fn test_proxy_listener_relays_through_agent() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (pool, mut far_ends) = MockPool::new(&["agent-1"], false);
    let server = ProxyServer::new(pool.clone(), target(), RetryPolicy::default());
    let listener = bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();

    let serve = {
        let cancel = cancel.clone();
        tokio::spawn(async move { server.serve(listener, cancel).await })
    };

    // Echo on the agent side of the virtual connection.
    tokio::spawn(async move {
        while let Some((_, _, far)) = far_ends.recv().await {
            tokio::spawn(async move {
                let (mut read, mut write) = tokio::io::split(far);
                let _ = tokio::io::copy(&mut read, &mut write).await;
                let _ = write.shutdown().await;
            });
        }
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hello proxy").await.unwrap();
    let mut buf = [0u8; 11];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello proxy");

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());

    cancel.cancel();
    timeout(Duration::from_secs(1), serve)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(pool.dial_count(), 1);
}

#[tokio::test]
async fn test_cancel_lets_open_relay_drain() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (pool, mut far_ends) = MockPool::new(&["agent-1"], false);
    let server = ProxyServer::new(pool.clone(), target(), RetryPolicy::default());
    let listener = bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();

    let serve = {
        let cancel = cancel.clone();
        tokio::spawn(async move { server.serve(listener, cancel).await })
    };

    tokio::spawn(async move {
        while let Some((_, _, far)) = far_ends.recv().await {
            tokio::spawn(async move {
                let (mut read, mut write) = tokio::io::split(far);
                let _ = tokio::io::copy(&mut read, &mut write).await;
                let _ = write.shutdown().await;
            });
        }
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 6];
    client.write_all(b"before").await.unwrap();
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"before");

    cancel.cancel();

    // New connections are no longer accepted.
    timeout(Duration::from_secs(2), async {
        while TcpStream::connect(addr).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("proxy listener still accepting after cancel");

    // The relay that was already running keeps carrying bytes.
    client.write_all(b"after!").await.unwrap();
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"after!");
    assert!(!serve.is_finished());

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();

    timeout(Duration::from_secs(2), serve)
        .await
        .expect("serve did not return once the relay finished")
        .unwrap()
        .unwrap();
}
