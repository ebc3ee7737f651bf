use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use super::stream::{peer_state, PeerState};
use super::{Connector, TrackedStream, Transport};
use crate::error::TransportError;
use crate::job::JobSlot;
use crate::proxy;
use crate::types::{Destination, ProxyDescriptor};

/// A plain TCP stream, possibly tunnelled through SOCKS5.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TrackedStream<TcpStream>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: TrackedStream::new(stream),
        }
    }

    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }
}

impl Transport for TcpTransport {
    fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    fn is_eof(&self) -> bool {
        self.stream.is_eof()
    }

    /// Unread bytes are left for the next job.
    fn refresh_state(&mut self) {
        if !self.stream.is_usable() {
            return;
        }

        match peer_state(self.stream.get_ref()) {
            PeerState::Quiet | PeerState::Readable => {}
            PeerState::HungUp => self.stream.mark_eof(),
            PeerState::Failed => self.stream.mark_closed(),
        }
    }

    fn set_notifications_enabled(&mut self, enabled: bool) {
        self.stream.set_notifications_enabled(enabled);
    }
}

impl AsyncRead for TcpTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Transport = TcpTransport;

    async fn connect(
        &self,
        destination: &Destination,
        proxy: &ProxyDescriptor,
        _binding: &JobSlot,
    ) -> Result<TcpTransport, TransportError> {
        let stream = proxy::tunnel(destination, proxy).await?;
        if let Err(error) = stream.set_nodelay(true) {
            tracing::trace!(%error, "Failed to set TCP_NODELAY");
        }
        Ok(TcpTransport::new(stream))
    }
}
