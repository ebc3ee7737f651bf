//! Byte streams the cache hands to jobs, and the connectors that open them.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TransportError;
use crate::job::JobSlot;
use crate::types::{Destination, ProxyDescriptor};

pub mod stream;
pub mod tcp;
pub mod tls;

pub use stream::TrackedStream;
pub use tcp::{TcpConnector, TcpTransport};
pub use tls::{TlsConnector, TlsTransport};

/// An open byte stream usable by one job at a time.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// False once the stream was shut down or hit a fatal I/O error.
    fn is_open(&self) -> bool;

    /// True once the peer closed its side of the stream.
    fn is_eof(&self) -> bool;

    /// Checks the underlying socket, without blocking, for a hang-up or
    /// failure that no read has surfaced yet, and updates [`is_open`] and
    /// [`is_eof`] accordingly. Called before a parked or just returned
    /// transport is judged.
    ///
    /// [`is_open`]: Transport::is_open
    /// [`is_eof`]: Transport::is_eof
    fn refresh_state(&mut self) {}

    /// Parked transports have notifications disabled and refuse reads.
    fn set_notifications_enabled(&mut self, enabled: bool);
}

/// Opens transports of one kind, either directly or through a SOCKS5 hop.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// `binding` is the slot holding whichever job is bound to the connection
    /// this transport is opened for. Encrypted transports use it to route
    /// alerts and client certificate requests to that job.
    async fn connect(
        &self,
        destination: &Destination,
        proxy: &ProxyDescriptor,
        binding: &JobSlot,
    ) -> Result<Self::Transport, TransportError>;
}
