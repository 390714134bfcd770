//! Virtual connection over one QUIC bidirectional stream

use quinn::{RecvStream, SendStream};
use rdproxy_proto::{SessionCodec, SessionMessage};
use rdproxy_transport::{TransportError, TransportResult};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A bidirectional QUIC stream exposed as a plain byte stream
///
/// Shutting down the write side finishes the QUIC send stream, so the peer
/// reads end of stream while this side can still receive.
#[derive(Debug)]
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
}

impl QuicStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    /// QUIC stream index, for logging
    pub fn stream_id(&self) -> u64 {
        self.send.id().index()
    }

    /// Send one handshake message
    pub async fn send_message(&mut self, message: &SessionMessage) -> TransportResult<()> {
        SessionCodec::write_message(self, message)
            .await
            .map_err(|e| TransportError::ProtocolError(e.to_string()))
    }

    /// Receive one handshake message, leaving any following bytes unread
    pub async fn recv_message(&mut self) -> TransportResult<Option<SessionMessage>> {
        SessionCodec::read_message(self)
            .await
            .map_err(|e| TransportError::ProtocolError(e.to_string()))
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.recv), cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.send), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.send), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.send), cx)
    }
}
