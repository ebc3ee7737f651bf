use serde::Serialize;
use std::fmt;
use tokio::task::JoinHandle;

use crate::connection::ConnectionId;
use crate::types::ConnectionKey;

/// Point-in-time view of every bucket in the cache.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub buckets: Vec<BucketSnapshot>,
    pub server_profiles: Vec<ProfileSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub key: ConnectionKey,
    pub connections: Vec<ConnectionSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub active: bool,
    /// URL of the job currently running, if any.
    pub current_destination: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub queued: usize,
    pub high_water_mark: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileSnapshot {
    pub hostname: String,
    pub requests_served_per_connection: Option<usize>,
}

impl CacheSnapshot {
    pub fn bucket(&self, key: &ConnectionKey) -> Option<&BucketSnapshot> {
        self.buckets.iter().find(|bucket| &bucket.key == key)
    }

    pub fn connection_count(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.connections.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

impl fmt::Display for CacheSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} destination(s)", self.buckets.len())?;
        for bucket in &self.buckets {
            write!(f, "{}", bucket)?;
        }

        if !self.server_profiles.is_empty() {
            writeln!(f, "server profiles:")?;
            for profile in &self.server_profiles {
                match profile.requests_served_per_connection {
                    Some(served) => writeln!(f, "  {}: {} per connection", profile.hostname, served)?,
                    None => writeln!(f, "  {}: unbounded", profile.hostname)?,
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for BucketSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  {} ({} connection(s))", self.key, self.connections.len())?;
        for connection in &self.connections {
            writeln!(f, "    {}", connection)?;
        }
        Ok(())
    }
}

impl fmt::Display for ConnectionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.id)?;

        match (&self.current_destination, self.elapsed_ms) {
            (Some(url), Some(elapsed)) if self.active => {
                write!(f, "busy with {} for {}ms", url, elapsed)?
            }
            _ if self.active => write!(f, "busy")?,
            _ => write!(f, "idle")?,
        }

        write!(
            f,
            ", {} queued (max {})",
            self.queued, self.high_water_mark
        )
    }
}

/// Keeps a periodic dump running. Dropping it stops the task.
pub struct DumpHandle {
    handle: JoinHandle<()>,
}

impl DumpHandle {
    pub(crate) fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }
}

impl Drop for DumpHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
