//! Server-global set of live sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use crate::session::Session;

/// Tracks every live session so shutdown can fan out to all of them.
///
/// Entries are weak: the registry never keeps a session alive, and each
/// session removes its own entry during cleanup.
pub struct Registry {
    sessions: DashMap<Uuid, Weak<Session>>,
    draining: AtomicBool,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            draining: AtomicBool::new(false),
        })
    }

    pub fn insert(&self, session: &Arc<Session>) {
        self.sessions.insert(session.id(), Arc::downgrade(session));
        // A session that arrives while shutdown is underway dies at once,
        // so shutdown_all never leaves stragglers behind.
        if self.draining.load(Ordering::SeqCst) {
            session.cancel();
        }
    }

    pub fn remove(&self, id: Uuid) {
        self.sessions.remove(&id);
    }

    /// Snapshot of every session still alive.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    /// Number of sessions still alive (dead weak entries are not counted).
    pub fn len(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every live session and wait for each one to finish cleanup.
    pub async fn shutdown_all(&self) {
        self.draining.store(true, Ordering::SeqCst);

        let live = self.sessions();
        if live.is_empty() {
            return;
        }

        info!(count = live.len(), "shutting down live sessions");
        for session in &live {
            session.cancel();
        }
        for session in live {
            session.closed().await;
        }
    }
}
