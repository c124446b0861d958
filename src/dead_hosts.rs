//! Bookkeeping for backends which recently failed to connect.

use crate::backend::Name;
use crate::backoff::ExponentialBackoff;

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{event, Level};

/// The backoff applied after the first failure to connect to a backend.
pub const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The largest backoff ever applied to a backend.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10 * 60);

#[derive(Clone, Copy, Debug)]
struct Entry {
    marked_at: Instant,
    backoff: Duration,
}

/// Records which backends are being backed off from.
///
/// This never performs I/O itself: the router consults it before
/// connecting, and updates it with the outcome.
#[derive(Debug, Default)]
pub struct DeadHosts {
    entries: Mutex<HashMap<Name, Entry>>,
}

impl DeadHosts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure to connect, returning the backoff now in effect.
    ///
    /// The first failure backs off for [BASE_RETRY_DELAY]; each further
    /// failure doubles the backoff, up to [MAX_RETRY_DELAY].
    pub fn mark_failed(&self, name: &Name) -> Duration {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(name.clone())
            .and_modify(|entry| {
                entry.marked_at = now;
                entry.backoff = entry.backoff.exponential_backoff(MAX_RETRY_DELAY);
            })
            .or_insert(Entry {
                marked_at: now,
                backoff: BASE_RETRY_DELAY,
            });
        event!(Level::DEBUG, backend = %name, backoff = ?entry.backoff, "Marked backend dead");
        entry.backoff
    }

    /// Forgets any failures of a backend.
    ///
    /// Returns true if the backend had been marked dead.
    pub fn mark_recovered(&self, name: &Name) -> bool {
        let removed = self.entries.lock().unwrap().remove(name).is_some();
        if removed {
            event!(Level::INFO, backend = %name, "Backend recovered");
        }
        removed
    }

    /// Returns true if connecting to this backend should be skipped.
    ///
    /// Backends are only skipped while failback is enabled and their backoff
    /// has not yet elapsed.
    pub fn is_suppressed(&self, name: &Name, failback: bool) -> bool {
        if !failback {
            return false;
        }
        let entries = self.entries.lock().unwrap();
        match entries.get(name) {
            Some(entry) => Instant::now() < entry.marked_at + entry.backoff,
            None => false,
        }
    }

    /// Returns the current backoff for a backend, if it is marked dead.
    pub fn backoff(&self, name: &Name) -> Option<Duration> {
        self.entries
            .lock()
            .unwrap()
            .get(name)
            .map(|entry| entry.backoff)
    }

    /// Returns the number of backends currently marked dead.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
