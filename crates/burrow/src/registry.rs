//! SessionRegistry - the process-wide map from client identifier to its live session.
//!
//! All mutation goes through `register`/`unregister`. Supersession happens
//! under the write lock, so once `register` returns no lookup can observe the
//! replaced session, and the replaced session has already released its callers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::TunnelError;
use crate::metrics;
use crate::tunnel::{ClientId, TunnelSession};

pub struct SessionRegistry {
    sessions: RwLock<HashMap<ClientId, Arc<TunnelSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace the session for its client identifier.
    /// A replaced session is closed with `SessionSuperseded` and returned.
    pub fn register(&self, session: Arc<TunnelSession>) -> Option<Arc<TunnelSession>> {
        let client_id = session.client_id().clone();
        let previous = {
            let mut sessions = self.sessions.write();
            let previous = sessions.insert(client_id.clone(), Arc::clone(&session));
            if let Some(ref old) = previous {
                old.close(TunnelError::SessionSuperseded(client_id.to_string()));
            }
            metrics::set_active_sessions(sessions.len());
            previous
        };

        match previous {
            Some(ref old) => {
                info!(
                    client_id = %client_id,
                    session_id = session.session_id(),
                    superseded = old.session_id(),
                    "client superseded"
                );
                metrics::record_registration("superseded");
            }
            None => {
                info!(
                    client_id = %client_id,
                    session_id = session.session_id(),
                    remote_addr = ?session.remote_addr(),
                    "client registered"
                );
                metrics::record_registration("registered");
            }
        }
        previous
    }

    /// Current session for `client_id`. Never blocks on I/O.
    pub fn lookup(&self, client_id: &str) -> Option<Arc<TunnelSession>> {
        self.sessions.read().get(client_id).cloned()
    }

    /// Remove the entry only if it still refers to `session`; a newer
    /// registration under the same identifier is left in place.
    pub fn unregister(&self, session: &Arc<TunnelSession>) -> bool {
        let removed = {
            let mut sessions = self.sessions.write();
            let current = sessions
                .get(session.client_id().as_str())
                .is_some_and(|current| Arc::ptr_eq(current, session));
            if current {
                sessions.remove(session.client_id().as_str());
                metrics::set_active_sessions(sessions.len());
            }
            current
        };

        if removed {
            info!(
                client_id = %session.client_id(),
                session_id = session.session_id(),
                uptime_secs = session.uptime().as_secs(),
                "client disconnected"
            );
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close and drop every session (used on shutdown).
    pub fn close_all(&self, reason: &str) -> usize {
        let drained: Vec<Arc<TunnelSession>> = {
            let mut sessions = self.sessions.write();
            let drained = sessions.drain().map(|(_, s)| s).collect();
            metrics::set_active_sessions(0);
            drained
        };
        for session in &drained {
            session.close(TunnelError::Channel(reason.to_string()));
        }
        drained.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
