//! Single-slot, freshest-wins handoff between the receive loop and the consumer.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::protocol::sequence_after;
use crate::types::ImageSet;

/// What happened to a published image set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    Stored,
    /// An unretrieved older set was overwritten
    Replaced { superseded: u32 },
    /// Older than the last published set in this session, discarded
    OutOfOrder,
    Closed,
}

#[derive(Debug, Default)]
struct SlotInner {
    latest: Option<ImageSet>,
    last_published: Option<u32>,
    closed: bool,
}

/// Holds at most one completed image set.
#[derive(Debug, Default)]
pub struct HandoffSlot {
    inner: Mutex<SlotInner>,
    notify: Notify,
}

impl HandoffSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a completed set; an unretrieved one is overwritten.
    pub fn publish(&self, set: ImageSet) -> Published {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Published::Closed;
            }
            let newest = inner.last_published;
            if newest.is_some_and(|last| sequence_after(last, set.sequence_number)) {
                return Published::OutOfOrder;
            }
            inner.last_published = Some(set.sequence_number);
            match inner.latest.replace(set) {
                Some(old) => Published::Replaced { superseded: old.sequence_number },
                None => Published::Stored,
            }
        };
        self.notify.notify_waiters();
        outcome
    }

    /// Take the pending set, if any.
    pub fn take(&self) -> Option<ImageSet> {
        self.inner.lock().latest.take()
    }

    /// Sequence numbers restart with a new device session.
    pub fn reset_ordering(&self) {
        self.inner.lock().last_published = None;
    }

    /// Wake all waiters; later waits return `None` once the slot is drained.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Wait for a set, up to `timeout` when given.
    pub async fn wait(&self, timeout: Option<Duration>) -> Option<ImageSet> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(set) = inner.latest.take() {
                    return Some(set);
                }
                if inner.closed {
                    return None;
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }
}
