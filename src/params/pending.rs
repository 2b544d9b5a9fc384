//! Outstanding parameter requests, keyed by request id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::protocol::{ResponseBody, UNSOLICITED_REQUEST_ID};
use crate::{Result, TransferError};

struct PendingEntry {
    reply: oneshot::Sender<Result<ResponseBody>>,
    deadline: Instant,
    timeout: Duration,
}

/// Request id demultiplexer.
///
/// Each request registers a oneshot sender; the session receive loop resolves
/// it when the matching response arrives, in whatever order responses come.
pub struct PendingRequests {
    next_id: AtomicU32,
    entries: Mutex<HashMap<u32, PendingEntry>>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self { next_id: AtomicU32::new(1), entries: Mutex::new(HashMap::new()) }
    }

    fn allocate_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != UNSOLICITED_REQUEST_ID {
                return id;
            }
        }
    }

    /// Register a new request that expires after `timeout`.
    pub fn register(&self, timeout: Duration) -> (u32, oneshot::Receiver<Result<ResponseBody>>) {
        let (reply, rx) = oneshot::channel();
        let id = self.allocate_id();
        let entry = PendingEntry { reply, deadline: Instant::now() + timeout, timeout };
        self.entries.lock().insert(id, entry);
        trace!(request_id = id, "Parameter request registered");
        (id, rx)
    }

    /// Complete a request. Returns false for unknown or already expired ids.
    pub fn resolve(&self, request_id: u32, body: ResponseBody) -> bool {
        match self.entries.lock().remove(&request_id) {
            Some(entry) => {
                let _ = entry.reply.send(Ok(body));
                true
            }
            None => {
                debug!(request_id, "Response for unknown or expired request");
                false
            }
        }
    }

    /// Forget a request whose caller stopped waiting.
    pub fn cancel(&self, request_id: u32) {
        self.entries.lock().remove(&request_id);
    }

    /// Fail every outstanding request, e.g. when the link is lost.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.reply.send(Err(TransferError::connection_lost(reason)));
        }
        if count > 0 {
            debug!(count, reason, "Failed outstanding parameter requests");
        }
        count
    }

    /// Time out every request whose deadline has passed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<_> = {
            let mut entries = self.entries.lock();
            let ids: Vec<u32> =
                entries.iter().filter(|(_, e)| e.deadline <= now).map(|(id, _)| *id).collect();
            ids.into_iter().filter_map(|id| entries.remove(&id).map(|e| (id, e))).collect()
        };
        let count = expired.len();
        for (request_id, entry) in expired {
            let _ = entry
                .reply
                .send(Err(TransferError::RequestTimeout { request_id, duration: entry.timeout }));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
