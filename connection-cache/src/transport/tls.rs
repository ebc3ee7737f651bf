use async_trait::async_trait;
use futures::task::noop_waker_ref;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::ResolvesClientCert;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{self, AlertDescription, ClientConfig, RootCertStore, SignatureScheme};

use super::stream::{peer_state, PeerState};
use super::{Connector, TrackedStream, Transport};
use crate::error::{JobError, TransportError};
use crate::job::JobSlot;
use crate::proxy;
use crate::types::{Destination, ProxyDescriptor};

pub type AlertHandler = Box<dyn Fn(AlertDescription) + Send + Sync>;

/// Maps a TLS alert received from the peer on an established session to the
/// reason reported to the job.
///
/// Alerts that end the handshake never reach this: they surface as
/// [`TransportError::Tls`] and are mapped by [`TransportError::job_error`].
pub fn classify_alert(alert: AlertDescription) -> JobError {
    match alert {
        AlertDescription::HandshakeFailure => JobError::ProtocolFailed,
        AlertDescription::DecryptError => JobError::ConnectionFailed,
        _ => JobError::TransmissionFailed,
    }
}

/// Extracts the alert from an I/O error surfaced by `tokio-rustls`, if any.
pub fn received_alert(error: &io::Error) -> Option<AlertDescription> {
    match error.get_ref()?.downcast_ref::<rustls::Error>()? {
        rustls::Error::AlertReceived(alert) => Some(*alert),
        _ => None,
    }
}

/// A TLS session over a (possibly tunnelled) TCP stream.
pub struct TlsTransport {
    stream: TrackedStream<TlsStream<TcpStream>>,
    on_alert: Option<AlertHandler>,
}

impl TlsTransport {
    pub fn new(stream: TlsStream<TcpStream>) -> Self {
        Self {
            stream: TrackedStream::new(stream),
            on_alert: None,
        }
    }

    pub fn set_alert_handler(&mut self, handler: impl Fn(AlertDescription) + Send + Sync + 'static) {
        self.on_alert = Some(Box::new(handler));
    }

    pub fn get_ref(&self) -> &TlsStream<TcpStream> {
        self.stream.get_ref()
    }

    /// Lets rustls consume records that arrived while nobody was reading.
    /// Alerts seen here are not routed to the bound job, which is either
    /// finished or not started yet.
    ///
    /// Session tickets are absorbed and leave the transport usable. A
    /// `close_notify` marks it EOF. Application data on a transport nobody
    /// is reading cannot be handed to anyone, so it closes the transport.
    fn absorb_pending_records(&mut self) {
        let mut scratch = [0u8; 512];
        let mut buf = ReadBuf::new(&mut scratch);
        let mut cx = Context::from_waker(noop_waker_ref());

        let poll = Pin::new(self.stream.get_mut()).poll_read(&mut cx, &mut buf);
        match poll {
            Poll::Pending => {}
            Poll::Ready(Ok(())) if buf.filled().is_empty() => self.stream.mark_eof(),
            Poll::Ready(Ok(())) => {
                tracing::debug!(
                    bytes = buf.filled().len(),
                    "Discarding unsolicited data on an idle TLS transport"
                );
                self.stream.mark_closed();
            }
            Poll::Ready(Err(error)) => {
                tracing::debug!(%error, "TLS transport failed while idle");
                self.stream.mark_closed();
            }
        }
    }

    fn inspect<T>(&self, poll: &Poll<io::Result<T>>) {
        if let Poll::Ready(Err(error)) = poll {
            if let (Some(alert), Some(on_alert)) = (received_alert(error), self.on_alert.as_ref()) {
                tracing::debug!(?alert, "Received TLS alert");
                on_alert(alert);
            }
        }
    }
}

impl fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsTransport")
            .field("open", &self.stream.is_open())
            .field("eof", &self.stream.is_eof())
            .field("alert_handler", &self.on_alert.is_some())
            .finish()
    }
}

impl Transport for TlsTransport {
    fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    fn is_eof(&self) -> bool {
        self.stream.is_eof()
    }

    fn refresh_state(&mut self) {
        if !self.stream.is_usable() {
            return;
        }

        let (socket, _) = self.stream.get_ref().get_ref();
        match peer_state(socket) {
            PeerState::Quiet => {}
            PeerState::Readable => self.absorb_pending_records(),
            PeerState::HungUp => self.stream.mark_eof(),
            PeerState::Failed => self.stream.mark_closed(),
        }
    }

    fn set_notifications_enabled(&mut self, enabled: bool) {
        self.stream.set_notifications_enabled(enabled);
    }
}

impl AsyncRead for TlsTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let poll = Pin::new(&mut self.stream).poll_read(cx, buf);
        self.inspect(&poll);
        poll
    }
}

impl AsyncWrite for TlsTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.stream).poll_write(cx, buf);
        self.inspect(&poll);
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let poll = Pin::new(&mut self.stream).poll_flush(cx);
        self.inspect(&poll);
        poll
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Answers the server's certificate request with whatever the job bound to
/// the connection provides.
struct BoundJobCertificates {
    binding: JobSlot,
}

impl fmt::Debug for BoundJobCertificates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundJobCertificates")
            .field("binding", &self.binding)
            .finish()
    }
}

impl ResolvesClientCert for BoundJobCertificates {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.binding.current()?.provide_client_certificates()
    }

    fn has_certs(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct TlsConnector {
    roots: Arc<RootCertStore>,
}

impl TlsConnector {
    pub fn with_webpki_roots() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_root_certificates(roots)
    }

    pub fn with_root_certificates(roots: RootCertStore) -> Self {
        Self {
            roots: Arc::new(roots),
        }
    }
}

impl Default for TlsConnector {
    fn default() -> Self {
        Self::with_webpki_roots()
    }
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector")
            .field("roots", &self.roots.len())
            .finish()
    }
}

#[async_trait]
impl Connector for TlsConnector {
    type Transport = TlsTransport;

    async fn connect(
        &self,
        destination: &Destination,
        proxy: &ProxyDescriptor,
        binding: &JobSlot,
    ) -> Result<TlsTransport, TransportError> {
        let host = destination.host().to_string();
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| TransportError::InvalidServerName(host.clone()))?;

        let config = ClientConfig::builder()
            .with_root_certificates(self.roots.clone())
            .with_client_cert_resolver(Arc::new(BoundJobCertificates {
                binding: binding.clone(),
            }));

        let stream = proxy::tunnel(destination, proxy).await?;
        let stream = tokio_rustls::TlsConnector::from(Arc::new(config))
            .connect(server_name, stream)
            .await
            .map_err(|source| TransportError::Tls { host, source })?;

        let mut transport = TlsTransport::new(stream);
        let binding = binding.clone();
        transport.set_alert_handler(move |alert| match binding.current() {
            Some(job) => job.fail(classify_alert(alert)),
            None => tracing::debug!(?alert, "TLS alert on a connection with no bound job"),
        });

        Ok(transport)
    }
}
