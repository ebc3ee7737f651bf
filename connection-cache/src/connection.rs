use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio::task::AbortHandle;

use crate::job::{Job, JobData, JobSlot};
use crate::transport::Transport;
use crate::types::{ConnectionKey, Destination, ProxyDescriptor};

pub(crate) type ConnectionRef<T> = Arc<Mutex<Connection<T>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A reference to a pooled connection. It does not keep the connection alive
/// and is resolved against the pool every time it is used.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    key: ConnectionKey,
    id: ConnectionId,
}

impl ConnectionHandle {
    pub(crate) fn new(key: ConnectionKey, id: ConnectionId) -> Self {
        Self { key, id }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

/// One pooled transport and the jobs waiting for it.
pub struct Connection<T> {
    id: ConnectionId,
    transport: Option<T>,
    queue: VecDeque<Arc<JobData<T>>>,
    is_active: bool,
    current_job: JobSlot,
    current_destination: Option<Destination>,
    job_started_at: Option<Instant>,
    high_water_mark: usize,
    idle_timer: Option<AbortHandle>,
    idle_epoch: u64,
    proxy: ProxyDescriptor,
}

impl<T: Transport> Connection<T> {
    /// A connection that is claimed by whoever creates it until it either
    /// starts its first job or is parked.
    pub(crate) fn reserved(id: ConnectionId, proxy: ProxyDescriptor) -> Self {
        Self {
            id,
            transport: None,
            queue: VecDeque::new(),
            is_active: true,
            current_job: JobSlot::new(),
            current_destination: None,
            job_started_at: None,
            high_water_mark: 0,
            idle_timer: None,
            idle_epoch: 0,
            proxy,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn proxy(&self) -> &ProxyDescriptor {
        &self.proxy
    }

    pub fn enqueue(&mut self, job: Arc<JobData<T>>) {
        self.queue.push_back(job);
        self.high_water_mark = self.high_water_mark.max(self.queue.len());
    }

    pub fn dequeue_next(&mut self) -> Option<Arc<JobData<T>>> {
        self.queue.pop_front()
    }

    pub fn peek_next(&self) -> Option<Arc<JobData<T>>> {
        self.queue.front().cloned()
    }

    /// Removes one specific queued entry. Returns whether it was still queued.
    pub fn remove_queued(&mut self, job: &Arc<JobData<T>>) -> bool {
        let before = self.queue.len();
        self.queue.retain(|queued| !Arc::ptr_eq(queued, job));
        before != self.queue.len()
    }

    /// Removes a queued job by the caller's handle to it.
    pub fn withdraw(&mut self, job: &Arc<dyn Job<T>>) -> bool {
        let before = self.queue.len();
        self.queue.retain(|queued| !queued.wraps(job));
        before != self.queue.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_idle(&self) -> bool {
        !self.is_active && self.queue.is_empty()
    }

    pub fn mark_active(&mut self, job: Arc<JobData<T>>) {
        self.is_active = true;
        self.current_destination = Some(job.destination().clone());
        self.job_started_at = Some(Instant::now());
        self.current_job.bind(job);
        self.disarm_idle_timer();
    }

    pub fn mark_idle(&mut self) {
        self.is_active = false;
        if let Some(transport) = self.transport.as_mut() {
            transport.set_notifications_enabled(false);
        }
    }

    pub fn current_job(&self) -> &JobSlot {
        &self.current_job
    }

    pub fn current_destination(&self) -> Option<&Destination> {
        self.current_destination.as_ref()
    }

    pub fn job_started_at(&self) -> Option<Instant> {
        self.job_started_at
    }

    pub(crate) fn clear_current_job(&mut self) {
        self.current_job.clear();
        self.current_destination = None;
        self.job_started_at = None;
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    /// Refreshes the transport's view of its socket before judging it.
    pub(crate) fn transport_is_usable(&mut self) -> bool {
        self.transport.as_mut().is_some_and(|transport| {
            transport.refresh_state();
            transport.is_open() && !transport.is_eof()
        })
    }

    pub(crate) fn install_transport(&mut self, transport: T) {
        self.transport = Some(transport);
    }

    pub(crate) fn take_transport(&mut self) -> Option<T> {
        self.transport.take()
    }

    /// Starts a new idle period and returns its epoch. Timers from earlier
    /// periods compare unequal and must not act.
    pub(crate) fn begin_idle_period(&mut self) -> u64 {
        self.disarm_idle_timer();
        self.idle_epoch
    }

    pub(crate) fn set_idle_timer(&mut self, timer: AbortHandle) {
        self.idle_timer = Some(timer);
    }

    pub(crate) fn idle_epoch(&self) -> u64 {
        self.idle_epoch
    }

    /// Drops the timer handle without aborting it, used by the timer itself.
    pub(crate) fn forget_idle_timer(&mut self) {
        self.idle_timer = None;
    }

    fn disarm_idle_timer(&mut self) {
        self.idle_epoch += 1;
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

impl<T> Drop for Connection<T> {
    fn drop(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}
