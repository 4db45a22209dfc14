//! Session registry: tracks each client's last activity so the reaper can
//! tear down abandoned sessions.
//!
//! Sessions are created on first use and removed by explicit cleanup or by
//! the reaper after the configured timeout.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::store::meta::SessionId;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub last_access: Instant,
}

#[derive(Default)]
pub struct Sessions {
    inner: Mutex<HashMap<SessionId, Session>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp activity for a session, creating it on first use.
    pub fn touch(&self, session_id: SessionId) {
        let mut inner = self.inner.lock().expect("session registry poisoned");
        inner
            .entry(session_id)
            .and_modify(|s| s.last_access = Instant::now())
            .or_insert_with(|| Session {
                id: session_id,
                last_access: Instant::now(),
            });
    }

    /// Remove a session record. Safe to call for unknown sessions.
    pub fn remove(&self, session_id: SessionId) -> Option<Session> {
        self.inner
            .lock()
            .expect("session registry poisoned")
            .remove(&session_id)
    }

    /// Sessions idle longer than `timeout`.
    pub fn expired(&self, timeout: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        self.inner
            .lock()
            .expect("session registry poisoned")
            .values()
            .filter(|s| now.duration_since(s.last_access) >= timeout)
            .map(|s| s.id)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().expect("session registry poisoned").len()
    }
}
