//! Bidirectional byte relay between two duplex streams

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Byte counts for one finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from the first stream into the second
    pub a_to_b: u64,
    /// Bytes copied from the second stream into the first
    pub b_to_a: u64,
}

/// Relay bytes between `a` and `b` until both directions are finished
///
/// Both directions run concurrently. When one direction reaches end of stream
/// (or fails) the write side of its destination is shut down so the peer on
/// that side observes end of stream; the other direction keeps draining
/// until its own source ends. Once both are done both streams are closed and
/// dropped. Errors are logged and otherwise only end their direction early.
///
/// Payload is passed through untouched.
pub async fn relay<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, a_write) = tokio::io::split(a);
    let (mut b_read, b_write) = tokio::io::split(b);
    let mut a_write = CountingWriter::new(a_write);
    let mut b_write = CountingWriter::new(b_write);

    let a_to_b = async {
        let copied = tokio::io::copy(&mut a_read, &mut b_write).await;
        log_direction_end("a->b", copied);
        let _ = b_write.shutdown().await;
    };

    let b_to_a = async {
        let copied = tokio::io::copy(&mut b_read, &mut a_write).await;
        log_direction_end("b->a", copied);
        let _ = a_write.shutdown().await;
    };

    tokio::join!(a_to_b, b_to_a);

    let stats = RelayStats {
        a_to_b: b_write.written,
        b_to_a: a_write.written,
    };

    close(&mut a_read.unsplit(a_write.inner)).await;
    close(&mut b_read.unsplit(b_write.inner)).await;

    stats
}

/// Shut a stream down, ignoring errors from a stream that is already closed
pub async fn close<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = stream.shutdown().await {
        debug!("Ignoring error while closing stream: {}", e);
    }
}

fn log_direction_end(direction: &str, result: io::Result<u64>) {
    if let Err(e) = result {
        debug!(direction, "Relay direction ended with error: {}", e);
    }
}

/// Write half that counts the bytes its inner writer accepted
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            self.written += n as u64;
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_relay_round_trip_both_directions() {
        let (mut client, a) = duplex(64);
        let (b, mut agent) = duplex(64);

        let relay_task = tokio::spawn(relay(a, b));

        client.write_all(b"hello proxy").await.unwrap();
        let mut buf = [0u8; 11];
        agent.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello proxy");

        agent.write_all(b"and back").await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"and back");

        drop(client);
        let mut rest = Vec::new();
        agent.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(agent);

        let stats = timeout(Duration::from_secs(1), relay_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.a_to_b, 11);
        assert_eq!(stats.b_to_a, 8);
    }

    #[tokio::test]
    async fn test_relay_preserves_order_of_large_payload() {
        let (mut client, a) = duplex(1024);
        let (b, mut agent) = duplex(1024);
        let relay_task = tokio::spawn(relay(a, b));

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        let mut received = Vec::new();
        agent.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        drop(agent);
        drop(writer.await.unwrap());
        let stats = relay_task.await.unwrap();
        assert_eq!(stats.a_to_b, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_half_close_lets_other_direction_drain() {
        let (mut client, a) = duplex(64);
        let (b, mut agent) = duplex(64);
        let relay_task = tokio::spawn(relay(a, b));

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = Vec::new();
        agent.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        // The response still flows after the client stopped writing.
        agent.write_all(b"response").await.unwrap();
        drop(agent);

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");

        timeout(Duration::from_secs(1), relay_task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_tears_down_both_ends() {
        let (client, a) = duplex(64);
        let (b, mut agent) = duplex(64);
        let relay_task = tokio::spawn(relay(a, b));

        drop(client);

        // EOF propagates to the agent side, which then closes as well.
        let mut buf = Vec::new();
        let n = timeout(Duration::from_secs(1), agent.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        drop(agent);

        let stats = timeout(Duration::from_secs(1), relay_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats, RelayStats::default());
    }

    /// Reads end at once; writes accept `limit` bytes, then fail
    struct BrokenPipe {
        limit: usize,
    }

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.limit == 0 {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            let n = buf.len().min(self.limit);
            self.limit -= n;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_stats_keep_bytes_copied_before_an_error() {
        let (mut client, a) = duplex(64);
        client.write_all(b"0123456789").await.unwrap();

        let stats = timeout(Duration::from_secs(1), relay(a, BrokenPipe { limit: 4 }))
            .await
            .unwrap();
        assert_eq!(stats, RelayStats { a_to_b: 4, b_to_a: 0 });
    }

    #[tokio::test]
    async fn test_close_twice_is_noop() {
        let (mut near, mut far) = duplex(16);
        close(&mut near).await;
        close(&mut near).await;

        let mut buf = Vec::new();
        assert_eq!(far.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
