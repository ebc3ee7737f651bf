use socket2::SockRef;
use std::io;
use std::mem::MaybeUninit;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// What a non-blocking peek at a socket revealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PeerState {
    /// Nothing to read yet.
    Quiet,
    /// Bytes are waiting to be read.
    Readable,
    /// The peer sent FIN.
    HungUp,
    /// The socket reported an error, e.g. a reset.
    Failed,
}

/// Peeks at `socket` without consuming anything. The socket is non-blocking,
/// so this returns immediately and does not involve the runtime's reactor.
pub(crate) fn peer_state(socket: &TcpStream) -> PeerState {
    let mut byte = [MaybeUninit::<u8>::uninit(); 1];

    match SockRef::from(socket).peek(&mut byte) {
        Ok(0) => PeerState::HungUp,
        Ok(_) => PeerState::Readable,
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => PeerState::Quiet,
        Err(error) if error.kind() == io::ErrorKind::Interrupted => PeerState::Quiet,
        Err(_) => PeerState::Failed,
    }
}

/// Wraps a stream and remembers what it has observed about it: whether the
/// peer closed it, whether it was shut down or failed, and whether it is
/// currently parked.
#[derive(Debug)]
pub struct TrackedStream<S> {
    inner: S,
    eof: bool,
    closed: bool,
    notifications_enabled: bool,
}

impl<S> TrackedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            eof: false,
            closed: false,
            notifications_enabled: true,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Neither shut down, failed nor closed by the peer, as far as observed.
    pub fn is_usable(&self) -> bool {
        !self.closed && !self.eof
    }

    pub(crate) fn mark_eof(&mut self) {
        self.eof = true;
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn notifications_enabled(&self) -> bool {
        self.notifications_enabled
    }

    pub fn set_notifications_enabled(&mut self, enabled: bool) {
        self.notifications_enabled = enabled;
    }

    fn observe<T>(&mut self, result: &io::Result<T>) {
        if result.is_err() {
            self.closed = true;
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.notifications_enabled {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "transport is parked",
            )));
        }

        let filled_before = buf.filled().len();
        let result = ready!(Pin::new(&mut this.inner).poll_read(cx, buf));
        this.observe(&result);
        if result.is_ok() && buf.remaining() > 0 && buf.filled().len() == filled_before {
            this.eof = true;
        }
        Poll::Ready(result)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = ready!(Pin::new(&mut this.inner).poll_write(cx, buf));
        this.observe(&result);
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = ready!(Pin::new(&mut this.inner).poll_flush(cx));
        this.observe(&result);
        Poll::Ready(result)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = ready!(Pin::new(&mut this.inner).poll_shutdown(cx));
        this.closed = true;
        Poll::Ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn read_of_zero_bytes_marks_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = TrackedStream::new(client);

        server.write_all(b"pong").await.unwrap();
        drop(server);

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"pong");
        assert!(stream.is_eof());
        assert!(stream.is_open());
    }

    #[tokio::test]
    async fn parked_stream_refuses_reads() {
        let (client, _server) = tokio::io::duplex(64);
        let mut stream = TrackedStream::new(client);
        stream.set_notifications_enabled(false);

        let error = stream.read(&mut [0u8; 8]).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::WouldBlock);
        assert!(stream.is_open(), "refusing a read is not a stream failure");
    }

    #[tokio::test]
    async fn shutdown_closes_stream() {
        let (client, _server) = tokio::io::duplex(64);
        let mut stream = TrackedStream::new(client);

        stream.shutdown().await.unwrap();
        assert!(!stream.is_open());
    }
}
