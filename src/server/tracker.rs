//! Live session tracking
//!
//! One record per accepted client, kept for the worker's lifetime. Shutdown
//! reads the map to summarize stragglers and to force-close them: each
//! tracked session carries a kill token its worker selects on, so
//! cancelling the token tears down both of the worker's sockets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

/// Per-live-client record.
struct TrackedSession {
    client_addr: SocketAddr,
    backend_addr: Option<SocketAddr>,
    started_at: Instant,
    kill: CancellationToken,
}

#[derive(Default)]
pub struct SessionTracker {
    sessions: RwLock<HashMap<u64, TrackedSession>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an accepted client; returns the session's kill token.
    pub fn track_client(&self, session_id: u64, client_addr: SocketAddr) -> CancellationToken {
        let kill = CancellationToken::new();
        self.sessions.write().insert(
            session_id,
            TrackedSession {
                client_addr,
                backend_addr: None,
                started_at: Instant::now(),
                kill: kill.clone(),
            },
        );
        kill
    }

    /// Record the backend endpoint once the worker has one.
    pub fn track_backend(&self, session_id: u64, backend_addr: SocketAddr) {
        if let Some(session) = self.sessions.write().get_mut(&session_id) {
            session.backend_addr = Some(backend_addr);
        }
    }

    pub fn untrack(&self, session_id: u64) {
        self.sessions.write().remove(&session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Count of live sessions and the age of the oldest one.
    pub fn active_summary(&self) -> (usize, Duration) {
        let sessions = self.sessions.read();
        let oldest = sessions
            .values()
            .map(|s| s.started_at.elapsed())
            .max()
            .unwrap_or(Duration::ZERO);
        (sessions.len(), oldest)
    }

    /// Cancel every live session's kill token.
    ///
    /// Returns the number of sockets being torn down: one per client plus
    /// one per attached backend. The snapshot is taken under the read lock;
    /// cancellation happens without it.
    pub fn force_close_all(&self) -> usize {
        let targets: Vec<(CancellationToken, bool)> = {
            let sessions = self.sessions.read();
            sessions
                .values()
                .map(|s| (s.kill.clone(), s.backend_addr.is_some()))
                .collect()
        };

        let mut closed = 0;
        for (kill, has_backend) in targets {
            kill.cancel();
            closed += 1; // client socket
            if has_backend {
                closed += 1;
            }
        }
        closed
    }

    /// Client endpoint of a session, if it is still live (used in logs).
    pub fn client_addr(&self, session_id: u64) -> Option<SocketAddr> {
        self.sessions.read().get(&session_id).map(|s| s.client_addr)
    }
}
