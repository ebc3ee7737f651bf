use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::connection::{Connection, ConnectionHandle, ConnectionId, ConnectionRef};
use crate::diagnostics::{
    BucketSnapshot, CacheSnapshot, ConnectionSnapshot, DumpHandle, ProfileSnapshot,
};
use crate::error::{ConfigError, JobError, TransportError};
use crate::job::{Job, JobData, TransportLease};
use crate::lock;
use crate::profile::{ServerProfile, ServerProfiles};
use crate::proxy;
use crate::transport::{Connector, Transport};
use crate::types::{ConnectionKey, Destination, ProxyDescriptor};

type Bucket<T> = Vec<ConnectionRef<T>>;

/// Shared pool of connections opened by one [`Connector`].
///
/// Cloning is cheap and yields a handle to the same pool. Must be used from
/// within a tokio runtime: follow-up work is spawned onto it.
pub struct ConnectionCache<C: Connector> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Connector> {
    connector: C,
    config: Config,
    pool: RwLock<HashMap<ConnectionKey, Bucket<C::Transport>>>,
    profiles: ServerProfiles,
    next_connection_id: AtomicU64,
}

impl<C: Connector> Clone for ConnectionCache<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

enum Selection<T> {
    Reuse(ConnectionRef<T>),
    Create,
}

/// Picks a connection for a new job.
///
/// An idle connection always wins. Otherwise a new one is opened if the bucket
/// has room, unless the host is known to serve one request per connection and
/// the bucket already has a connection to queue behind. Failing both, the job
/// waits on the least loaded connection; ties go to the oldest.
fn select<T: Transport>(
    bucket: &[ConnectionRef<T>],
    single_request: bool,
    max_connections: usize,
) -> Option<Selection<T>> {
    if let Some(idle) = bucket.iter().find(|connection| lock(connection).is_idle()) {
        return Some(Selection::Reuse(idle.clone()));
    }

    let may_create = bucket.len() < max_connections && !(single_request && !bucket.is_empty());
    if may_create {
        return Some(Selection::Create);
    }

    bucket
        .iter()
        .min_by_key(|connection| lock(connection).queue_len())
        .cloned()
        .map(Selection::Reuse)
}

fn find_connection<T>(bucket: &[ConnectionRef<T>], id: ConnectionId) -> Option<&ConnectionRef<T>>
where
    T: Transport,
{
    bucket.iter().find(|connection| lock(connection).id() == id)
}

fn defer_fail<T: 'static>(job: Arc<JobData<T>>, reason: JobError) {
    tokio::spawn(async move {
        job.fail(reason);
    });
}

impl<C: Connector> ConnectionCache<C> {
    pub fn new(connector: C, config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            shared: Arc::new(Shared {
                connector,
                config,
                pool: RwLock::new(HashMap::new()),
                profiles: ServerProfiles::new(),
                next_connection_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn connector(&self) -> &C {
        &self.shared.connector
    }

    pub fn server_profiles(&self) -> &ServerProfiles {
        &self.shared.profiles
    }

    pub fn server_profile(&self, hostname: &str) -> ServerProfile {
        self.shared.profiles.get_or_create(hostname)
    }

    /// Submits `job` for `destination`.
    ///
    /// The job is either started on a connection (on a later turn of the
    /// runtime, never from inside this call) or queued behind the job already
    /// running there. Returns `None` when no connection could be provided; the
    /// job is then failed with [`JobError::ConnectionFailed`], or
    /// [`JobError::ProtocolFailed`] if the server refused the TLS handshake,
    /// also on a later turn.
    pub async fn acquire_connection(
        &self,
        destination: &Destination,
        proxy: &ProxyDescriptor,
        job: Arc<dyn Job<C::Transport>>,
    ) -> Option<ConnectionHandle> {
        let key = ConnectionKey::new(destination, proxy);
        let single_request = self
            .shared
            .profiles
            .get_or_create(key.hostname())
            .requires_single_request(self.shared.config.single_request_threshold);
        let max_connections = self.shared.config.max_connections_per_destination;
        let job = JobData::create(job, destination.clone());

        {
            let pool = self.shared.pool.read().await;
            if let Some(bucket) = pool.get(&key) {
                if let Some(Selection::Reuse(connection)) =
                    select(bucket, single_request, max_connections)
                {
                    return Some(self.assign(&key, &connection, job));
                }
            }
        }

        // Inserting needs the write lock. Whatever we saw under the read lock
        // may be stale by now, so decide again.
        let connection = {
            let mut pool = self.shared.pool.write().await;
            let bucket = pool.entry(key.clone()).or_default();

            match select(bucket, single_request, max_connections) {
                Some(Selection::Reuse(connection)) => {
                    return Some(self.assign(&key, &connection, job));
                }
                Some(Selection::Create) => self.reserve(bucket, proxy, Some(&job)),
                None => {
                    if bucket.is_empty() {
                        pool.remove(&key);
                    }
                    error!(%key, %destination, "Failed to find a connection");
                    defer_fail(job, JobError::ConnectionFailed);
                    return None;
                }
            }
        };

        let binding = lock(&connection).current_job().clone();
        let opened = proxy::open_transport(
            &self.shared.connector,
            destination,
            proxy,
            &binding,
            self.shared.config.connect_timeout(),
        )
        .await;

        match opened {
            Ok(transport) => {
                let id = {
                    let mut guard = lock(&connection);
                    guard.install_transport(transport);
                    guard.id()
                };
                debug!(%key, connection = %id, %destination, "Created new connection");
                self.spawn_start(key.clone(), connection, job);
                Some(ConnectionHandle::new(key, id))
            }
            Err(error) => {
                warn!(%key, %destination, %error, "Connection failed");
                defer_fail(job, error.job_error());
                self.abandon(key, connection).await;
                None
            }
        }
    }

    /// Takes back the transport of a finished job and moves its connection on:
    /// to the next queued job, or towards idle removal.
    ///
    /// If the server hung up, the next job gets a fresh socket. When that
    /// reconnect fails, only that job is failed and the jobs queued behind it
    /// still get their turn, each with its own reconnect attempt.
    pub async fn notify_job_finished(&self, lease: TransportLease<C::Transport>) {
        let (key, id, destination, mut transport) = lease.into_parts();

        let connection = {
            let pool = self.shared.pool.read().await;
            let Some(bucket) = pool.get(&key) else {
                error!(%key, %destination, "Job finished for a destination without connections");
                return;
            };
            let Some(connection) = find_connection(bucket, id) else {
                error!(%key, connection = %id, %destination, "Job finished on an unknown connection");
                return;
            };
            connection.clone()
        };

        transport.refresh_state();
        let remote_closed = !transport.is_open() || transport.is_eof();
        let served = {
            let mut guard = lock(&connection);
            guard.install_transport(transport);
            guard.high_water_mark() + 1
        };

        if remote_closed {
            self.shared
                .profiles
                .observe_early_close(key.hostname(), served);
        }

        trace!(%key, connection = %id, %destination, "Job finished");
        self.release(key, connection);
    }

    /// Opens a connection for `destination` ahead of any job, unless the
    /// bucket already has one. The new connection is parked right away.
    pub async fn preconnect(
        &self,
        destination: &Destination,
        proxy: &ProxyDescriptor,
    ) -> Result<ConnectionHandle, TransportError> {
        let key = ConnectionKey::new(destination, proxy);

        let connection = {
            let mut pool = self.shared.pool.write().await;
            let bucket = pool.entry(key.clone()).or_default();
            if let Some(existing) = bucket.first() {
                let id = lock(existing).id();
                return Ok(ConnectionHandle::new(key, id));
            }
            self.reserve(bucket, proxy, None)
        };

        let (id, binding) = {
            let guard = lock(&connection);
            (guard.id(), guard.current_job().clone())
        };

        match proxy::open_transport(
            &self.shared.connector,
            destination,
            proxy,
            &binding,
            self.shared.config.connect_timeout(),
        )
        .await
        {
            Ok(transport) => {
                lock(&connection).install_transport(transport);
                debug!(%key, connection = %id, "Preconnected");
                self.release(key.clone(), connection);
                Ok(ConnectionHandle::new(key, id))
            }
            Err(error) => {
                self.abandon(key, connection).await;
                Err(error)
            }
        }
    }

    /// Removes `job` from the queue of the connection it was assigned to.
    /// Returns whether it was still waiting there. The job is not failed.
    pub async fn cancel_queued_job(
        &self,
        handle: &ConnectionHandle,
        job: &Arc<dyn Job<C::Transport>>,
    ) -> bool {
        let pool = self.shared.pool.read().await;
        let withdrawn = pool
            .get(handle.key())
            .and_then(|bucket| find_connection(bucket, handle.id()))
            .is_some_and(|connection| lock(connection).withdraw(job));

        if withdrawn {
            debug!(key = %handle.key(), connection = %handle.id(), "Withdrew queued job");
        }
        withdrawn
    }

    /// Captures every bucket and connection under the read lock and logs it.
    pub async fn dump(&self) -> CacheSnapshot {
        let now = Instant::now();
        let pool = self.shared.pool.read().await;

        let mut buckets: Vec<BucketSnapshot> = pool
            .iter()
            .map(|(key, bucket)| BucketSnapshot {
                key: key.clone(),
                connections: bucket
                    .iter()
                    .map(|connection| {
                        let guard = lock(connection);
                        ConnectionSnapshot {
                            id: guard.id(),
                            active: guard.is_active(),
                            current_destination: guard
                                .current_destination()
                                .map(ToString::to_string),
                            elapsed_ms: guard
                                .job_started_at()
                                .map(|started| now.saturating_duration_since(started).as_millis() as u64),
                            queued: guard.queue_len(),
                            high_water_mark: guard.high_water_mark(),
                        }
                    })
                    .collect(),
            })
            .collect();
        drop(pool);

        buckets.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        let snapshot = CacheSnapshot {
            buckets,
            server_profiles: self
                .shared
                .profiles
                .snapshot()
                .into_iter()
                .map(|(hostname, profile)| ProfileSnapshot {
                    hostname,
                    requests_served_per_connection: profile.requests_served_per_connection(),
                })
                .collect(),
        };

        info!("Connection cache state:\n{}", snapshot);
        snapshot
    }

    /// Dumps the cache every `interval` until the returned handle is dropped.
    pub fn spawn_periodic_dump(&self, interval: Duration) -> DumpHandle {
        let cache = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                cache.dump().await;
            }
        });

        DumpHandle::new(handle)
    }

    fn reserve(
        &self,
        bucket: &mut Bucket<C::Transport>,
        proxy: &ProxyDescriptor,
        job: Option<&Arc<JobData<C::Transport>>>,
    ) -> ConnectionRef<C::Transport> {
        let id = ConnectionId::new(
            self.shared
                .next_connection_id
                .fetch_add(1, Ordering::Relaxed),
        );
        let mut connection = Connection::reserved(id, proxy.clone());
        if let Some(job) = job {
            connection.mark_active(job.clone());
        }

        let connection = Arc::new(Mutex::new(connection));
        bucket.push(connection.clone());
        connection
    }

    /// Runs `job` on `connection` if it is free, otherwise queues it there.
    fn assign(
        &self,
        key: &ConnectionKey,
        connection: &ConnectionRef<C::Transport>,
        job: Arc<JobData<C::Transport>>,
    ) -> ConnectionHandle {
        let mut guard = lock(connection);
        let handle = ConnectionHandle::new(key.clone(), guard.id());

        if guard.is_active() {
            guard.enqueue(job);
            debug!(
                %key,
                connection = %handle.id(),
                queued = guard.queue_len(),
                "Enqueued job on busy connection"
            );
        } else {
            guard.mark_active(job.clone());
            drop(guard);
            debug!(%key, connection = %handle.id(), "Starting job on idle connection");
            self.spawn_start(key.clone(), connection.clone(), job);
        }

        handle
    }

    /// Starts the job just bound to `connection` on a later turn, reopening
    /// the socket first if it went stale while parked.
    fn spawn_start(
        &self,
        key: ConnectionKey,
        connection: ConnectionRef<C::Transport>,
        job: Arc<JobData<C::Transport>>,
    ) {
        let cache = self.clone();
        tokio::spawn(async move {
            let ensured = proxy::ensure_transport_usable(
                &cache.shared.connector,
                &connection,
                job.destination(),
                cache.shared.config.connect_timeout(),
            )
            .await;

            match ensured {
                Ok(()) => cache.launch(key, &connection, job),
                Err(error) => {
                    warn!(%key, %error, "Request failed to start, failed to make a socket");
                    job.fail(error.job_error());
                    cache.release(key, connection);
                }
            }
        });
    }

    /// Lends the connection's transport to `job`, which must already be bound.
    fn launch(
        &self,
        key: ConnectionKey,
        connection: &ConnectionRef<C::Transport>,
        job: Arc<JobData<C::Transport>>,
    ) {
        let (id, transport) = {
            let mut guard = lock(connection);
            (guard.id(), guard.take_transport())
        };

        let Some(mut transport) = transport else {
            error!(%key, connection = %id, "Connection has no transport to lend");
            job.fail(JobError::ConnectionFailed);
            self.release(key, connection.clone());
            return;
        };

        transport.set_notifications_enabled(true);
        let lease = TransportLease::new(key.clone(), id, job.destination().clone(), transport);

        trace!(
            %key,
            connection = %lease.connection().id(),
            destination = %job.destination(),
            waited_ms = job.submitted_at().elapsed().as_millis() as u64,
            "Starting job"
        );
        job.start(lease);
    }

    /// The connection's current job is done. Move on to the next queued job,
    /// or mark the connection idle and schedule it for parking.
    fn release(&self, key: ConnectionKey, connection: ConnectionRef<C::Transport>) {
        let mut guard = lock(&connection);

        if guard.queue_is_empty() {
            guard.mark_idle();
            drop(guard);
            self.spawn_park(key, connection);
        } else {
            drop(guard);
            let cache = self.clone();
            tokio::spawn(async move { cache.resume(key, connection).await });
        }
    }

    /// Starts the next queued job, reconnecting first if the server hung up.
    ///
    /// A failed reconnect fails that one job and then keeps draining the
    /// queue: the following job gets its own reconnect attempt instead of
    /// being left queued on a connection with no socket. The loop ends once a
    /// job is launched or the queue is empty.
    async fn resume(&self, key: ConnectionKey, connection: ConnectionRef<C::Transport>) {
        loop {
            let next = {
                let guard = lock(&connection);
                let next = guard.peek_next();
                if let Some(next) = next.as_ref() {
                    // The reconnect below may need the job's client certificate.
                    guard.current_job().bind(next.clone());
                }
                next
            };

            let Some(next) = next else {
                self.release(key, connection);
                return;
            };

            let ensured = proxy::ensure_transport_usable(
                &self.shared.connector,
                &connection,
                next.destination(),
                self.shared.config.connect_timeout(),
            )
            .await;

            match ensured {
                Ok(()) => {
                    let job = {
                        let mut guard = lock(&connection);
                        let job = guard.dequeue_next();
                        if let Some(job) = job.as_ref() {
                            guard.mark_active(job.clone());
                        }
                        job
                    };

                    // Everything queued was withdrawn while we reconnected.
                    let Some(job) = job else {
                        self.release(key, connection);
                        return;
                    };
                    self.launch(key, &connection, job);
                    return;
                }
                Err(error) => {
                    warn!(%key, %error, "Reconnection failed, failing next queued job");
                    if lock(&connection).remove_queued(&next) {
                        next.fail(error.job_error());
                    }
                }
            }
        }
    }

    /// Clears the finished job and arms the idle timer, provided no new job
    /// arrived in the meantime.
    fn spawn_park(&self, key: ConnectionKey, connection: ConnectionRef<C::Transport>) {
        let shared = Arc::downgrade(&self.shared);
        let idle_timeout = self.shared.config.idle_timeout();

        tokio::spawn(async move {
            let mut guard = lock(&connection);
            if !guard.is_idle() {
                trace!(%key, connection = %guard.id(), "Connection was reused before parking");
                return;
            }

            guard.clear_current_job();
            let id = guard.id();
            let epoch = guard.begin_idle_period();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(idle_timeout).await;
                if let Some(shared) = shared.upgrade() {
                    ConnectionCache { shared }.expire(key, id, epoch).await;
                }
            });
            guard.set_idle_timer(timer.abort_handle());
        });
    }

    /// Idle timer expiry. Removes the connection unless it picked up work.
    async fn expire(&self, key: ConnectionKey, id: ConnectionId, epoch: u64) {
        tokio::task::yield_now().await;

        let mut pool = self.shared.pool.write().await;
        let Some(bucket) = pool.get_mut(&key) else {
            return;
        };
        let Some(index) = bucket
            .iter()
            .position(|connection| lock(connection).id() == id)
        else {
            return;
        };

        {
            let mut guard = lock(&bucket[index]);
            if !guard.is_idle() || guard.idle_epoch() != epoch {
                trace!(%key, connection = %id, "Connection picked up work, keeping it");
                return;
            }
            guard.forget_idle_timer();
        }

        let removed = bucket.remove(index);
        let remaining = bucket.len();
        if remaining == 0 {
            pool.remove(&key);
        }
        drop(pool);

        debug!(%key, connection = %id, remaining, "Removed idle connection");
        drop(removed);
    }

    /// Cleans up after a connection whose first socket could not be opened.
    async fn abandon(&self, key: ConnectionKey, connection: ConnectionRef<C::Transport>) {
        let id = {
            let mut guard = lock(&connection);
            guard.clear_current_job();
            if !guard.queue_is_empty() {
                drop(guard);
                let cache = self.clone();
                tokio::spawn(async move { cache.resume(key, connection).await });
                return;
            }
            guard.mark_idle();
            guard.id()
        };

        let mut pool = self.shared.pool.write().await;
        if let Some(bucket) = pool.get_mut(&key) {
            bucket.retain(|candidate| {
                let guard = lock(candidate);
                !(guard.id() == id && guard.is_idle())
            });
            if bucket.is_empty() {
                pool.remove(&key);
            }
        }
    }
}
