#![allow(dead_code)]

use async_trait::async_trait;
use connection_cache::{
    Config, ConnectionCache, Connector, Destination, Job, JobError, JobSlot, ProxyDescriptor,
    Transport, TransportError, TransportLease,
};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_rustls::rustls::{self, AlertDescription};

/// Flags of one mock socket, shared between the transport and the test.
#[derive(Debug)]
pub struct MockSocket {
    pub serial: usize,
    pub host: String,
    open: AtomicBool,
    eof: AtomicBool,
    notifications: AtomicBool,
}

impl MockSocket {
    pub fn close_remote(&self) {
        self.eof.store(true, Ordering::SeqCst);
    }

    pub fn notifications_enabled(&self) -> bool {
        self.notifications.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct MockTransport {
    socket: Arc<MockSocket>,
}

impl MockTransport {
    pub fn socket(&self) -> &Arc<MockSocket> {
        &self.socket
    }
}

impl Transport for MockTransport {
    fn is_open(&self) -> bool {
        self.socket.open.load(Ordering::SeqCst)
    }

    fn is_eof(&self) -> bool {
        self.socket.eof.load(Ordering::SeqCst)
    }

    fn set_notifications_enabled(&mut self, enabled: bool) {
        self.socket.notifications.store(enabled, Ordering::SeqCst);
    }
}

impl AsyncRead for MockTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.is_eof() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }
}

impl AsyncWrite for MockTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.socket.open.store(false, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

#[derive(Default)]
struct ConnectorState {
    refuse: AtomicBool,
    refuse_handshake: AtomicBool,
    fail_next: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    sockets: Mutex<Vec<Arc<MockSocket>>>,
}

/// Hands out mock transports and records every socket it opened.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<ConnectorState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> usize {
        self.state.sockets.lock().unwrap().len()
    }

    pub fn sockets(&self) -> Vec<Arc<MockSocket>> {
        self.state.sockets.lock().unwrap().clone()
    }

    pub fn refuse(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Makes every connect fail as if the server answered the TLS
    /// handshake with a `handshake_failure` alert.
    pub fn refuse_handshake(&self, refuse: bool) {
        self.state.refuse_handshake.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_next(&self, count: usize) {
        self.state.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(
        &self,
        destination: &Destination,
        _proxy: &ProxyDescriptor,
        _binding: &JobSlot,
    ) -> Result<MockTransport, TransportError> {
        let delay = *self.state.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .state
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing || self.state.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                target: format!("{}:{}", destination.host(), destination.port()),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
            });
        }

        if self.state.refuse_handshake.load(Ordering::SeqCst) {
            return Err(TransportError::Tls {
                host: destination.host().to_string(),
                source: io::Error::new(
                    io::ErrorKind::InvalidData,
                    rustls::Error::AlertReceived(AlertDescription::HandshakeFailure),
                ),
            });
        }

        let mut sockets = self.state.sockets.lock().unwrap();
        let socket = Arc::new(MockSocket {
            serial: sockets.len() + 1,
            host: destination.host().to_string(),
            open: AtomicBool::new(true),
            eof: AtomicBool::new(false),
            notifications: AtomicBool::new(false),
        });
        sockets.push(socket.clone());

        Ok(MockTransport { socket })
    }
}

pub type TestCache = ConnectionCache<MockConnector>;

pub fn cache(config: Config) -> (TestCache, MockConnector) {
    let connector = MockConnector::new();
    let cache = ConnectionCache::new(connector.clone(), config).unwrap();
    (cache, connector)
}

#[derive(Debug)]
pub enum Event {
    Started(String, TransportLease<MockTransport>),
    Failed(String, JobError),
}

impl Event {
    pub fn name(&self) -> &str {
        match self {
            Event::Started(name, _) | Event::Failed(name, _) => name,
        }
    }

    pub fn started(self) -> (String, TransportLease<MockTransport>) {
        match self {
            Event::Started(name, lease) => (name, lease),
            Event::Failed(name, reason) => panic!("{} failed with {}", name, reason),
        }
    }

    pub fn failed(self) -> (String, JobError) {
        match self {
            Event::Failed(name, reason) => (name, reason),
            Event::Started(name, _) => panic!("{} started unexpectedly", name),
        }
    }
}

/// Forwards everything the cache does with it to the test.
pub struct RecordingJob {
    name: String,
    events: mpsc::UnboundedSender<Event>,
}

impl Job<MockTransport> for RecordingJob {
    fn start(&self, lease: TransportLease<MockTransport>) {
        let _ = self.events.send(Event::Started(self.name.clone(), lease));
    }

    fn fail(&self, reason: JobError) {
        let _ = self.events.send(Event::Failed(self.name.clone(), reason));
    }
}

pub struct Recorder {
    sender: mpsc::UnboundedSender<Event>,
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl Recorder {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self { sender, receiver }
    }

    pub fn job(&self, name: &str) -> Arc<dyn Job<MockTransport>> {
        Arc::new(RecordingJob {
            name: name.to_string(),
            events: self.sender.clone(),
        })
    }

    pub async fn next(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(60), self.receiver.recv())
            .await
            .expect("timed out waiting for a job event")
            .expect("event channel closed")
    }

    /// Returns whatever has been emitted so far without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Lets every task spawned by the cache run to completion.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

pub fn destination(url: &str) -> Destination {
    Destination::parse(url).unwrap()
}

pub fn direct() -> ProxyDescriptor {
    ProxyDescriptor::Direct
}
