//! In-memory registry of live sessions and their service managers.
//!
//! Each entry owns both handles of one connection, so the set of sessions
//! and the set of service managers always share the same keys. The lock is
//! a plain mutex and is never held across an await point: callers take
//! entries out under the lock and signal them after releasing it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::service::ServiceManager;
use crate::session::{ConnectionId, Session};

/// Session and service manager of one live connection.
#[derive(Clone)]
pub struct RegistryEntry {
    pub session: Arc<dyn Session>,
    pub manager: Arc<dyn ServiceManager>,
}

impl RegistryEntry {
    pub fn new(session: Arc<dyn Session>, manager: Arc<dyn ServiceManager>) -> Self {
        Self { session, manager }
    }

    /// Signal the service manager to stop and the session to close.
    pub fn shutdown(&self) {
        self.manager.stop();
        self.session.close();
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ConnectionId, RegistryEntry>,
    stopping: bool,
}

/// Thread-safe registry of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection.
    ///
    /// Once the registry has been drained for shutdown, registration is
    /// refused and the entry is handed back so the caller can tear it down.
    pub fn register(&self, id: ConnectionId, entry: RegistryEntry) -> Result<(), RegistryEntry> {
        let mut inner = self.lock();
        if inner.stopping {
            return Err(entry);
        }
        inner.entries.insert(id, entry);
        let count = inner.entries.len();
        drop(inner);

        info!(connection = %id, count, "Connection registered");
        Ok(())
    }

    /// Remove a connection. `None` if it was already removed.
    pub fn unregister(&self, id: ConnectionId) -> Option<RegistryEntry> {
        let entry = self.lock().entries.remove(&id);
        if entry.is_some() {
            info!(connection = %id, "Connection unregistered");
        } else {
            debug!(connection = %id, "Connection already unregistered");
        }
        entry
    }

    /// Refuse further registrations and take every entry.
    pub fn drain(&self) -> Vec<(ConnectionId, RegistryEntry)> {
        let mut inner = self.lock();
        inner.stopping = true;
        inner.entries.drain().collect()
    }

    pub fn is_stopping(&self) -> bool {
        self.lock().stopping
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    /// Count of live connections.
    pub fn connection_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Live connection ids, sorted.
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.lock().entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Live sessions with the id they are registered under.
    pub fn sessions(&self) -> Vec<(ConnectionId, Arc<dyn Session>)> {
        self.lock()
            .entries
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(&entry.session)))
            .collect()
    }
}
