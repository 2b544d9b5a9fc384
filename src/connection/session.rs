//! Shared session state observed by the receiver and the parameter channel.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::debug;

use crate::transport::Transport;
use crate::{Result, TransferError};

/// Liveness of the device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Live,
    /// Link lost, reconnect in progress
    Degraded,
    /// Reconnect attempts exhausted or session shut down
    Closed,
}

/// Snapshot of the session published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Bumped every time the link is lost
    pub generation: u64,
    /// Negotiated during the handshake, 0 before the first one
    pub protocol_version: u8,
}

/// Session owned by the connection manager.
///
/// The status is guarded by a single lock and every change is published on a
/// watch channel, so waiters never miss a transition.
pub struct Session {
    status: Mutex<SessionStatus>,
    updates: watch::Sender<SessionStatus>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let initial =
            SessionStatus { state: SessionState::Connecting, generation: 0, protocol_version: 0 };
        let (updates, _) = watch::channel(initial);
        Self { status: Mutex::new(initial), updates, transport: RwLock::new(None) }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn state(&self) -> SessionState {
        self.status.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.status.lock().generation
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.updates.subscribe()
    }

    /// Current transport, `None` unless the session is live.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().clone()
    }

    fn transition(&self, change: impl FnOnce(&mut SessionStatus)) -> SessionStatus {
        let mut status = self.status.lock();
        let before = *status;
        change(&mut status);
        if *status != before {
            debug!(
                from = ?before.state,
                to = ?status.state,
                generation = status.generation,
                "Session transition"
            );
            self.updates.send_replace(*status);
        }
        *status
    }

    /// Install a freshly handshaken transport and mark the session live.
    pub(crate) fn go_live(&self, transport: Arc<dyn Transport>, protocol_version: u8) -> bool {
        let mut installed = false;
        self.transition(|status| {
            if status.state != SessionState::Closed {
                *self.transport.write() = Some(transport);
                status.state = SessionState::Live;
                status.protocol_version = protocol_version;
                installed = true;
            }
        });
        installed
    }

    /// Mark the link lost: bump the generation and hand back the old transport.
    pub(crate) fn degrade(&self) -> Option<Arc<dyn Transport>> {
        let mut previous = None;
        self.transition(|status| {
            if status.state == SessionState::Closed {
                return;
            }
            previous = self.transport.write().take();
            status.state = SessionState::Degraded;
            status.generation += 1;
        });
        previous
    }

    /// Terminal transition; returns the transport that was active, if any.
    pub(crate) fn close(&self) -> Option<Arc<dyn Transport>> {
        let mut previous = None;
        self.transition(|status| {
            previous = self.transport.write().take();
            status.state = SessionState::Closed;
        });
        previous
    }

    /// Wait until the session is live and return its transport and generation.
    ///
    /// Fails with `ConnectionLost` if the session closes or stays unavailable
    /// for longer than `timeout`.
    pub async fn wait_live(&self, timeout: Duration) -> Result<(Arc<dyn Transport>, u64)> {
        let mut updates = self.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let status = updates
                    .wait_for(|s| matches!(s.state, SessionState::Live | SessionState::Closed))
                    .await
                    .map(|s| *s)
                    .map_err(|_| TransferError::connection_lost("session dropped"))?;
                if status.state == SessionState::Closed {
                    return Err(TransferError::connection_lost("session closed"));
                }
                // The transport is installed under the status lock, re-check both together.
                {
                    let status_now = self.status.lock();
                    if status_now.state == SessionState::Live {
                        if let Some(transport) = self.transport.read().clone() {
                            return Ok((transport, status_now.generation));
                        }
                    }
                }
                updates.mark_changed();
                tokio::task::yield_now().await;
            }
        })
        .await;

        waited.unwrap_or_else(|_| {
            Err(TransferError::connection_lost(format!("device unavailable for {timeout:?}")))
        })
    }
}
