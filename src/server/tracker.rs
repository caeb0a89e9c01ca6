//! Connection lifecycle tracking for graceful shutdown.
//!
//! The transport reports every state change of every connection. The tracker
//! counts connections that are serving a request ("active") and, once the
//! server is destroyed, refuses new work and closes connections as soon as
//! they are not serving anything.
//!
//! Hijacked connections (protocol upgrades) leave the tracker entirely: their
//! lifetime belongs to the upgrade handler, so shutdown does not wait for them.

use crate::ids::ConnId;
use crate::logging::Logger;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

const NORMAL: u8 = 0;
const DESTROYED: u8 = 1;

/// Transport-level connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, no request read yet.
    New,
    /// Serving a request.
    Active,
    /// Between requests on a keep-alive connection.
    Idle,
    /// Taken over by an upgrade handler.
    Hijacked,
    Closed,
}

/// A connection the tracker may close from another coroutine.
pub trait TrackedConn: Send + Sync {
    /// Shut the socket down so the serving coroutine's next read fails.
    fn force_close(&self);
}

struct Tracked {
    conn: Arc<dyn TrackedConn>,
    state: ConnState,
}

#[derive(Default)]
struct Inner {
    conns: HashMap<ConnId, Tracked>,
    active: usize,
}

/// Active-connection counter plus the one-way normal → destroyed flag.
pub struct ConnectionTracker {
    state: AtomicU8,
    inner: Mutex<Inner>,
    drained: Condvar,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(NORMAL),
            inner: Mutex::new(Inner::default()),
            drained: Condvar::new(),
        }
    }
}

impl ConnectionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state.load(Ordering::Acquire) == DESTROYED
    }

    /// Connections currently serving a request.
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.lock().active
    }

    /// Connections still tracked (new, active or idle).
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.inner.lock().conns.len()
    }

    /// Record a state change of `conn`.
    ///
    /// Returns `false` when the transport must stop serving the connection
    /// (it has been force-closed or is no longer tracked).
    pub fn transition(&self, id: ConnId, conn: &Arc<dyn TrackedConn>, next: ConnState) -> bool {
        let mut inner = self.inner.lock();
        // Read under the lock so a destroy cannot slip between check and count.
        let destroyed = self.is_destroyed();
        let prev = inner.conns.get(&id).map(|t| t.state);
        if prev == Some(ConnState::Active) && next != ConnState::Active {
            inner.active -= 1;
            if inner.active == 0 {
                self.drained.notify_all();
            }
        }

        match next {
            ConnState::Active if prev == Some(ConnState::Active) => true,
            ConnState::New | ConnState::Active | ConnState::Idle if destroyed => {
                inner.conns.remove(&id);
                conn.force_close();
                false
            }
            ConnState::New | ConnState::Active | ConnState::Idle => {
                if next == ConnState::Active {
                    inner.active += 1;
                }
                inner.conns.insert(
                    id,
                    Tracked {
                        conn: Arc::clone(conn),
                        state: next,
                    },
                );
                true
            }
            ConnState::Hijacked | ConnState::Closed => {
                inner.conns.remove(&id);
                false
            }
        }
    }

    /// Flip normal → destroyed. Only the first caller gets `true`.
    pub fn begin_destroy(&self) -> bool {
        self.state
            .compare_exchange(NORMAL, DESTROYED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Force-close every connection that is not serving a request.
    pub fn close_idle(&self, logger: &Logger) {
        let inner = self.inner.lock();
        for (id, tracked) in &inner.conns {
            if tracked.state != ConnState::Active {
                logger.in_scope(|| debug!(conn = %id, "Closing idle connection"));
                tracked.conn.force_close();
            }
        }
    }

    /// Block until no connection is serving a request. Unbounded.
    pub fn wait_drained(&self, logger: &Logger) {
        let mut inner = self.inner.lock();
        while inner.active > 0 {
            let active = inner.active;
            logger.in_scope(|| debug!(active, "Waiting for active connections"));
            self.drained.wait(&mut inner);
        }
    }
}
