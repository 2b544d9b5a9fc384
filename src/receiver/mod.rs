//! Asynchronous image receiver.
//!
//! The session receive loop feeds fragments into a
//! [`FragmentAssembler`](crate::protocol::FragmentAssembler) and publishes each
//! completed set into a single [`HandoffSlot`]. Consumers swap the slot
//! contents out; they never touch assembly state.

mod handoff;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{Stream, StreamExt, stream};
use tokio_stream::wrappers::WatchStream;
use tracing::trace;

pub use handoff::{HandoffSlot, Published};

use crate::connection::{Session, SessionState};
use crate::protocol::AssemblerStats;
use crate::stream::ThrottleExt;
use crate::types::{ImageSet, UpdateRate};

/// Counters describing what happened to received image data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    /// Sets fully reassembled
    pub completed: u64,
    /// Sets taken by a consumer
    pub delivered: u64,
    /// Completed sets overwritten before anyone took them
    pub superseded: u64,
    /// Partial sets given up in favour of a newer one or after link loss
    pub abandoned: u64,
    pub stale_fragments: u64,
    pub duplicate_fragments: u64,
    pub malformed_frames: u64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    delivered: AtomicU64,
    superseded: AtomicU64,
    abandoned: AtomicU64,
    stale: AtomicU64,
    duplicates: AtomicU64,
    assembler_malformed: AtomicU64,
    transport_malformed: AtomicU64,
}

/// State shared between the receive loop and all receiver handles.
#[derive(Debug, Default)]
pub struct ReceiverShared {
    slot: HandoffSlot,
    counters: Counters,
}

impl ReceiverShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish(&self, set: ImageSet) -> Published {
        let sequence = set.sequence_number;
        let outcome = self.slot.publish(set);
        if let Published::Replaced { superseded } = outcome {
            trace!(superseded, newer = sequence, "Unretrieved image set overwritten");
            self.counters.superseded.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Mirror the assembler's counters.
    pub(crate) fn record_assembler(&self, stats: AssemblerStats) {
        let c = &self.counters;
        c.completed.store(stats.completed, Ordering::Relaxed);
        c.abandoned.store(stats.abandoned, Ordering::Relaxed);
        c.stale.store(stats.stale, Ordering::Relaxed);
        c.duplicates.store(stats.duplicates, Ordering::Relaxed);
        c.assembler_malformed.store(stats.malformed, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.counters.transport_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn new_generation(&self) {
        self.slot.reset_ordering();
    }

    pub(crate) fn close(&self) {
        self.slot.close();
    }

    async fn wait(&self, timeout: Option<Duration>) -> Option<ImageSet> {
        let set = self.slot.wait(timeout).await;
        if set.is_some() {
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
        set
    }

    fn stats(&self) -> ReceiverStats {
        let c = &self.counters;
        ReceiverStats {
            completed: c.completed.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            superseded: c.superseded.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            stale_fragments: c.stale.load(Ordering::Relaxed),
            duplicate_fragments: c.duplicates.load(Ordering::Relaxed),
            malformed_frames: c.assembler_malformed.load(Ordering::Relaxed)
                + c.transport_malformed.load(Ordering::Relaxed),
        }
    }
}

/// Consumer handle for completed image sets.
///
/// Cloning is cheap, but all clones compete for the same slot: each set is
/// handed to exactly one caller.
#[derive(Clone)]
pub struct ImageReceiver {
    shared: Arc<ReceiverShared>,
    session: Arc<Session>,
    device_fps: Option<f64>,
}

impl ImageReceiver {
    pub(crate) fn new(
        shared: Arc<ReceiverShared>,
        session: Arc<Session>,
        device_fps: Option<f64>,
    ) -> Self {
        Self { shared, session, device_fps }
    }

    pub(crate) fn set_device_fps(&mut self, device_fps: Option<f64>) {
        self.device_fps = device_fps;
    }

    /// Wait up to `timeout` for an image set newer than the last one returned.
    ///
    /// Returns `None` on timeout, or once the session is closed and no set is
    /// left to hand out.
    pub async fn collect_received_image_set(&self, timeout: Duration) -> Option<ImageSet> {
        self.shared.wait(Some(timeout)).await
    }

    /// Wait without a deadline; `None` only after the session closed.
    pub async fn next_image_set(&self) -> Option<ImageSet> {
        self.shared.wait(None).await
    }

    /// Stream of image sets, throttled to `rate` with latest-wins semantics.
    pub fn image_sets(&self, rate: UpdateRate) -> impl Stream<Item = ImageSet> + Send + 'static {
        let sets = stream::unfold(self.clone(), |receiver| async move {
            receiver.next_image_set().await.map(|set| (set, receiver))
        });
        match rate.throttle_interval(self.device_fps) {
            None => sets.boxed(),
            Some(interval) => sets.throttle(interval).boxed(),
        }
    }

    pub fn stats(&self) -> ReceiverStats {
        self.shared.stats()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Session state transitions, starting with the current state.
    pub fn state_changes(&self) -> impl Stream<Item = SessionState> + Send + 'static {
        WatchStream::new(self.session.subscribe()).map(|status| status.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Channel, ImageType, PixelFormat, Timestamp};

    fn set(sequence: u32) -> ImageSet {
        let channel = Channel::new(ImageType::Left, PixelFormat::Mono8, 2, 1, vec![1, 2]).unwrap();
        ImageSet::new(sequence, Timestamp::default(), vec![channel]).unwrap()
    }

    fn receiver() -> (Arc<ReceiverShared>, ImageReceiver) {
        let shared = Arc::new(ReceiverShared::new());
        let receiver = ImageReceiver::new(shared.clone(), Arc::new(Session::new()), None);
        (shared, receiver)
    }

    #[tokio::test]
    async fn collect_returns_freshest_set() {
        let (shared, receiver) = receiver();
        shared.publish(set(1));
        shared.publish(set(2));

        let got = receiver.collect_received_image_set(Duration::from_millis(50)).await;
        assert_eq!(got.map(|s| s.sequence_number), Some(2));
        assert!(receiver.collect_received_image_set(Duration::from_millis(10)).await.is_none());

        let stats = receiver.stats();
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn stream_ends_when_receiver_closes() {
        let (shared, receiver) = receiver();
        let mut sets = receiver.image_sets(UpdateRate::Native);
        shared.publish(set(7));
        assert_eq!(sets.next().await.map(|s| s.sequence_number), Some(7));
        shared.close();
        assert!(sets.next().await.is_none());
    }
}
