//! Connection reuse for outbound requests.
//!
//! Requests are addressed to `(host, port, proxy)` triples. For each triple the
//! [`ConnectionCache`] keeps a small bucket of connections, decides whether a new
//! request gets a fresh socket or waits behind another request on an existing
//! one, tears down connections that stay idle, and learns which servers only
//! serve a single request per connection.
//!
//! ```text
//! RwLock<HashMap<ConnectionKey, Vec<Arc<Mutex<Connection<T>>>>>>
//! ```
//!
//! Locking strategy
//! ----------------
//! * **`RwLock` around the map** – read for lookups and for assigning work to a
//!   connection that was found, write for inserting or removing connections.
//! * **`Mutex` per connection** – short synchronous sections only, never held
//!   across an `.await`.
//!
//! Every follow-up action (starting the next job, parking, evicting) runs on a
//! later turn of the runtime and re-validates the connection's state first.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod cache;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod job;
pub mod profile;
pub mod proxy;
pub mod tracing_util;
pub mod transport;
pub mod types;

pub use cache::ConnectionCache;
pub use config::Config;
pub use connection::{ConnectionHandle, ConnectionId};
pub use diagnostics::{CacheSnapshot, DumpHandle};
pub use error::{ConfigError, DestinationError, JobError, TransportError};
pub use job::{BoundJob, Job, JobData, JobSlot, TransportLease};
pub use profile::{ServerProfile, ServerProfiles};
pub use transport::{
    Connector, TcpConnector, TcpTransport, TlsConnector, TlsTransport, Transport,
};
pub use types::{ConnectionKey, Destination, ProxyDescriptor, Socks5Credentials};

/// Locks a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
