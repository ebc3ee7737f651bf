use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_rustls::rustls::sign::CertifiedKey;

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::JobError;
use crate::lock;
use crate::types::{ConnectionKey, Destination};

/// A unit of work (usually one request) that runs on a pooled transport.
///
/// The cache never looks inside a job. It either hands it a [`TransportLease`]
/// through [`Job::start`] or reports why it could not through [`Job::fail`].
/// A started job must give the lease back with
/// [`ConnectionCache::notify_job_finished`](crate::ConnectionCache::notify_job_finished),
/// otherwise its connection stays busy forever.
pub trait Job<T>: Send + Sync + 'static {
    fn start(&self, lease: TransportLease<T>);

    fn fail(&self, reason: JobError);

    fn provide_client_certificates(&self) -> Option<Arc<CertifiedKey>> {
        None
    }
}

/// The part of a job that transport hooks may call while it is bound to a
/// connection.
pub trait BoundJob: Send + Sync {
    fn fail(&self, reason: JobError);

    fn provide_client_certificates(&self) -> Option<Arc<CertifiedKey>>;
}

/// A submitted job together with where it is going.
pub struct JobData<T> {
    job: Arc<dyn Job<T>>,
    destination: Destination,
    submitted_at: Instant,
}

impl<T: 'static> JobData<T> {
    pub fn create(job: Arc<dyn Job<T>>, destination: Destination) -> Arc<Self> {
        Arc::new(Self {
            job,
            destination,
            submitted_at: Instant::now(),
        })
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn start(&self, lease: TransportLease<T>) {
        self.job.start(lease);
    }

    pub fn fail(&self, reason: JobError) {
        self.job.fail(reason);
    }

    /// Whether this wraps exactly `job`.
    pub fn wraps(&self, job: &Arc<dyn Job<T>>) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.job) as *const (),
            Arc::as_ptr(job) as *const (),
        )
    }
}

impl<T: 'static> BoundJob for JobData<T> {
    fn fail(&self, reason: JobError) {
        self.job.fail(reason);
    }

    fn provide_client_certificates(&self) -> Option<Arc<CertifiedKey>> {
        self.job.provide_client_certificates()
    }
}

/// The job currently bound to a connection, shared with the hooks installed
/// on that connection's transport.
#[derive(Clone, Default)]
pub struct JobSlot(Arc<Mutex<Option<Arc<dyn BoundJob>>>>);

impl JobSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, job: Arc<dyn BoundJob>) {
        *lock(&self.0) = Some(job);
    }

    pub fn clear(&self) {
        lock(&self.0).take();
    }

    pub fn current(&self) -> Option<Arc<dyn BoundJob>> {
        lock(&self.0).clone()
    }

    pub fn is_bound(&self) -> bool {
        lock(&self.0).is_some()
    }
}

impl fmt::Debug for JobSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSlot")
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// Exclusive use of a connection's transport for the duration of one job.
///
/// Derefs to the transport so jobs can read and write through it directly.
pub struct TransportLease<T> {
    key: ConnectionKey,
    connection: ConnectionId,
    destination: Destination,
    transport: T,
}

impl<T> TransportLease<T> {
    pub(crate) fn new(
        key: ConnectionKey,
        connection: ConnectionId,
        destination: Destination,
        transport: T,
    ) -> Self {
        Self {
            key,
            connection,
            destination,
            transport,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn connection(&self) -> ConnectionHandle {
        ConnectionHandle::new(self.key.clone(), self.connection)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub(crate) fn into_parts(self) -> (ConnectionKey, ConnectionId, Destination, T) {
        (self.key, self.connection, self.destination, self.transport)
    }
}

impl<T> Deref for TransportLease<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.transport
    }
}

impl<T> DerefMut for TransportLease<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.transport
    }
}

impl<T> fmt::Debug for TransportLease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLease")
            .field("key", &self.key)
            .field("connection", &self.connection)
            .field("destination", &self.destination.to_string())
            .finish()
    }
}
