//! Per-hostname properties learned from how servers treat our connections.
//!
//! Profiles are keyed by hostname only: a server that hangs up after every
//! response does so regardless of the port or proxy it is reached through.

use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use crate::lock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerProfile {
    /// `None` until the server has been seen closing a connection.
    requests_served_per_connection: Option<NonZeroUsize>,
}

impl ServerProfile {
    pub fn requests_served_per_connection(&self) -> Option<usize> {
        self.requests_served_per_connection.map(NonZeroUsize::get)
    }

    pub fn is_unbounded(&self) -> bool {
        self.requests_served_per_connection.is_none()
    }

    /// Whether concurrent sockets to this host are not worth opening.
    pub fn requires_single_request(&self, threshold: usize) -> bool {
        self.requests_served_per_connection()
            .is_some_and(|served| served < threshold)
    }

    /// Ratchets the expectation down; returns whether it changed.
    fn lower_to(&mut self, served: usize) -> bool {
        let served = NonZeroUsize::new(served).unwrap_or(NonZeroUsize::MIN);
        match self.requests_served_per_connection {
            Some(current) if current <= served => false,
            _ => {
                self.requests_served_per_connection = Some(served);
                true
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ServerProfiles {
    profiles: Mutex<HashMap<String, ServerProfile>>,
}

impl ServerProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, hostname: &str) -> ServerProfile {
        *lock(&self.profiles)
            .entry(hostname.to_string())
            .or_default()
    }

    /// Records that a connection to `hostname` was closed by the remote side
    /// after serving `requests_actually_served` requests.
    pub fn observe_early_close(&self, hostname: &str, requests_actually_served: usize) {
        let mut profiles = lock(&self.profiles);
        let profile = profiles.entry(hostname.to_string()).or_default();

        if profile.lower_to(requests_actually_served) {
            tracing::debug!(
                hostname,
                requests_served_per_connection = profile.requests_served_per_connection(),
                "Server closed connection early, lowering reuse expectation"
            );
        }
    }

    pub fn snapshot(&self) -> Vec<(String, ServerProfile)> {
        let mut profiles: Vec<_> = lock(&self.profiles)
            .iter()
            .map(|(hostname, profile)| (hostname.clone(), *profile))
            .collect();
        profiles.sort_by(|a, b| a.0.cmp(&b.0));
        profiles
    }
}
