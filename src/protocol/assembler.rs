//! Reassembly of fragmented image sets.
//!
//! One image set is assembled at a time. A fragment of a newer set abandons
//! the one in progress, and fragments at or below the watermark (the newest
//! sequence number already completed or abandoned) are stale. Sequence
//! numbers are compared with wrapping arithmetic, so a device counter that
//! overflows `u32` keeps advancing.

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::frame::{Frame, MessageKind};
use super::image::decode_image_block;
use crate::config::StalePolicy;
use crate::types::ImageSet;
use crate::{Result, TransferError};

/// Lifecycle of the set currently tracked by the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    Empty,
    Assembling { sequence: u32, received: u16, expected: u16 },
    Complete { sequence: u32 },
    Abandoned { sequence: u32 },
}

/// What happened to one pushed fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum Assembled {
    /// Accepted, set still incomplete
    Pending,
    Complete(ImageSet),
    Duplicate,
    /// Older than the watermark and dropped
    Stale,
}

/// Running counters of the assembler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub completed: u64,
    pub abandoned: u64,
    pub stale: u64,
    pub duplicates: u64,
    pub malformed: u64,
}

#[derive(Debug)]
struct Partial {
    sequence: u32,
    fragments: Vec<Option<Bytes>>,
    received: u16,
}

impl Partial {
    fn new(sequence: u32, count: u16) -> Self {
        Self { sequence, fragments: vec![None; count as usize], received: 0 }
    }

    fn expected(&self) -> u16 {
        self.fragments.len() as u16
    }

    fn is_complete(&self) -> bool {
        self.received == self.expected()
    }

    fn join(self) -> Bytes {
        let len = self.fragments.iter().flatten().map(Bytes::len).sum();
        let mut block = BytesMut::with_capacity(len);
        for fragment in self.fragments.into_iter().flatten() {
            block.extend_from_slice(&fragment);
        }
        block.freeze()
    }
}

/// True when `a` comes after `b` in wrapping sequence order.
pub(crate) fn sequence_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Rebuilds image sets from fragments arriving in any order.
#[derive(Debug)]
pub struct FragmentAssembler {
    policy: StalePolicy,
    current: Option<Partial>,
    watermark: Option<u32>,
    state: AssemblyState,
    stats: AssemblerStats,
}

impl FragmentAssembler {
    pub fn new(policy: StalePolicy) -> Self {
        Self {
            policy,
            current: None,
            watermark: None,
            state: AssemblyState::Empty,
            stats: AssemblerStats::default(),
        }
    }

    pub fn state(&self) -> AssemblyState {
        self.state
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Newest sequence number completed or abandoned.
    pub fn watermark(&self) -> Option<u32> {
        self.watermark
    }

    /// Forget all progress, e.g. after a reconnect where sequence numbers restart.
    pub fn reset(&mut self) {
        if let Some(partial) = self.current.take() {
            debug!(sequence = partial.sequence, "Abandoning partial image set on reset");
            self.stats.abandoned += 1;
        }
        self.watermark = None;
        self.state = AssemblyState::Empty;
    }

    /// Feed one image fragment.
    pub fn push(&mut self, frame: Frame) -> Result<Assembled> {
        let result = self.push_inner(frame);
        if matches!(result, Err(TransferError::MalformedFrame { .. })) {
            self.stats.malformed += 1;
        }
        result
    }

    fn push_inner(&mut self, frame: Frame) -> Result<Assembled> {
        if frame.kind != MessageKind::ImageFragment {
            return Err(TransferError::malformed(format!(
                "{:?} frame fed to image assembler",
                frame.kind
            )));
        }
        if frame.fragment_count == 0 || frame.fragment_index >= frame.fragment_count {
            return Err(TransferError::malformed(format!(
                "fragment {}/{} of set {} is inconsistent",
                frame.fragment_index, frame.fragment_count, frame.id
            )));
        }
        let sequence = frame.id;

        if self.watermark.is_some_and(|w| !sequence_after(sequence, w)) {
            return self.stale(sequence);
        }

        match &self.current {
            Some(partial) if sequence_after(partial.sequence, sequence) => {
                return self.stale(sequence);
            }
            Some(partial) if sequence_after(sequence, partial.sequence) => {
                debug!(
                    abandoned = partial.sequence,
                    received = partial.received,
                    expected = partial.expected(),
                    newer = sequence,
                    "Newer image set started, abandoning incomplete one"
                );
                let abandoned = partial.sequence;
                self.current = None;
                self.watermark = Some(abandoned);
                self.stats.abandoned += 1;
                self.state = AssemblyState::Abandoned { sequence: abandoned };
            }
            _ => {}
        }

        let partial = self
            .current
            .get_or_insert_with(|| Partial::new(sequence, frame.fragment_count));
        if partial.expected() != frame.fragment_count {
            return Err(TransferError::malformed(format!(
                "fragment count {} for set {} differs from {}",
                frame.fragment_count,
                sequence,
                partial.expected()
            )));
        }

        let slot = &mut partial.fragments[frame.fragment_index as usize];
        if slot.is_some() {
            self.stats.duplicates += 1;
            trace!(sequence, index = frame.fragment_index, "Duplicate fragment ignored");
            return Ok(Assembled::Duplicate);
        }
        *slot = Some(frame.payload);
        partial.received += 1;
        trace!(
            sequence,
            received = partial.received,
            expected = partial.expected(),
            "Fragment accepted"
        );

        if !partial.is_complete() {
            self.state = AssemblyState::Assembling {
                sequence,
                received: partial.received,
                expected: partial.expected(),
            };
            return Ok(Assembled::Pending);
        }

        let Some(partial) = self.current.take() else {
            return Ok(Assembled::Pending);
        };
        self.watermark = Some(sequence);
        let set = decode_image_block(&partial.join()).inspect_err(|_| {
            self.state = AssemblyState::Abandoned { sequence };
        })?;
        if set.sequence_number != sequence {
            self.state = AssemblyState::Abandoned { sequence };
            return Err(TransferError::malformed(format!(
                "image block sequence {} inside frames of set {sequence}",
                set.sequence_number
            )));
        }

        self.stats.completed += 1;
        self.state = AssemblyState::Complete { sequence };
        Ok(Assembled::Complete(set))
    }

    fn stale(&mut self, sequence: u32) -> Result<Assembled> {
        self.stats.stale += 1;
        match self.policy {
            StalePolicy::Drop => {
                trace!(sequence, watermark = ?self.watermark, "Stale fragment dropped");
                Ok(Assembled::Stale)
            }
            StalePolicy::Report => {
                warn!(sequence, watermark = ?self.watermark, "Stale fragment");
                Err(TransferError::malformed(format!("stale fragment of image set {sequence}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::fragment_image_set;
    use crate::types::{Channel, ImageType, PixelFormat, Timestamp};
    use proptest::prelude::*;

    fn image_set(sequence: u32, fill: u8) -> ImageSet {
        let left =
            Channel::new(ImageType::Left, PixelFormat::Mono8, 16, 8, vec![fill; 128]).unwrap();
        let disparity =
            Channel::new(ImageType::Disparity, PixelFormat::Mono12, 16, 8, vec![fill ^ 0xFF; 256])
                .unwrap();
        ImageSet::new(sequence, Timestamp::new(sequence as u64, 0), vec![left, disparity]).unwrap()
    }

    fn fragments(sequence: u32) -> Vec<Frame> {
        fragment_image_set(&image_set(sequence, sequence as u8), 64).unwrap()
    }

    #[test]
    fn in_order_fragments_complete() {
        let mut assembler = FragmentAssembler::new(StalePolicy::Drop);
        let frames = fragments(1);
        let last = frames.len() - 1;
        for (i, frame) in frames.into_iter().enumerate() {
            match assembler.push(frame).unwrap() {
                Assembled::Complete(set) => {
                    assert_eq!(i, last);
                    assert_eq!(set, image_set(1, 1));
                }
                Assembled::Pending => assert!(i < last),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(assembler.state(), AssemblyState::Complete { sequence: 1 });
        assert_eq!(assembler.watermark(), Some(1));
    }

    #[test]
    fn newer_set_abandons_incomplete_one() {
        let mut assembler = FragmentAssembler::new(StalePolicy::Drop);
        let first = fragments(5);
        assembler.push(first[0].clone()).unwrap();

        let mut completed = None;
        for frame in fragments(6) {
            if let Assembled::Complete(set) = assembler.push(frame).unwrap() {
                completed = Some(set);
            }
        }
        assert_eq!(completed.map(|s| s.sequence_number), Some(6));
        assert_eq!(assembler.stats().abandoned, 1);

        // late fragments of the abandoned set are never resumed
        assert_eq!(assembler.push(first[1].clone()).unwrap(), Assembled::Stale);
        assert_eq!(assembler.stats().stale, 1);
    }

    #[test]
    fn stale_fragments_can_be_reported() {
        let mut assembler = FragmentAssembler::new(StalePolicy::Report);
        for frame in fragments(2) {
            assembler.push(frame).unwrap();
        }
        let err = assembler.push(fragments(1).remove(0)).unwrap_err();
        assert!(matches!(err, TransferError::MalformedFrame { .. }));
        assert_eq!(assembler.stats().malformed, 1);
    }

    #[test]
    fn fragment_count_mismatch_is_malformed() {
        let mut assembler = FragmentAssembler::new(StalePolicy::Drop);
        let mut frames = fragments(3);
        assembler.push(frames.remove(0)).unwrap();
        let mut odd = frames.remove(0);
        odd.fragment_count += 1;
        assert!(assembler.push(odd).is_err());
    }

    #[test]
    fn reset_clears_watermark() {
        let mut assembler = FragmentAssembler::new(StalePolicy::Drop);
        for frame in fragments(9) {
            assembler.push(frame).unwrap();
        }
        assembler.push(fragments(10).remove(0)).unwrap();
        assembler.reset();
        assert_eq!(assembler.state(), AssemblyState::Empty);
        assert_eq!(assembler.watermark(), None);
        assert_eq!(assembler.stats().abandoned, 1);

        let completed = fragments(1)
            .into_iter()
            .filter_map(|f| match assembler.push(f).unwrap() {
                Assembled::Complete(set) => Some(set),
                _ => None,
            })
            .count();
        assert_eq!(completed, 1);
    }

    #[test]
    fn out_of_range_fragment_index_is_malformed() {
        let mut assembler = FragmentAssembler::new(StalePolicy::Drop);
        let beyond = Frame {
            kind: MessageKind::ImageFragment,
            id: 1,
            fragment_index: 5,
            fragment_count: 2,
            payload: Bytes::from_static(b"x"),
        };
        assert!(matches!(assembler.push(beyond), Err(TransferError::MalformedFrame { .. })));

        let empty = Frame {
            kind: MessageKind::ImageFragment,
            id: 1,
            fragment_index: 0,
            fragment_count: 0,
            payload: Bytes::new(),
        };
        assert!(matches!(assembler.push(empty), Err(TransferError::MalformedFrame { .. })));
        assert_eq!(assembler.stats().malformed, 2);
        assert_eq!(assembler.state(), AssemblyState::Empty);

        // a valid set still assembles afterwards
        let completed = fragments(1)
            .into_iter()
            .filter(|f| matches!(assembler.push(f.clone()), Ok(Assembled::Complete(_))))
            .count();
        assert_eq!(completed, 1);
    }

    #[test]
    fn sequence_wraparound_keeps_delivering() {
        let mut assembler = FragmentAssembler::new(StalePolicy::Drop);
        let mut delivered = Vec::new();
        for sequence in [u32::MAX - 1, u32::MAX, 0, 1] {
            for frame in fragments(sequence) {
                if let Assembled::Complete(set) = assembler.push(frame).unwrap() {
                    delivered.push(set.sequence_number);
                }
            }
        }
        assert_eq!(delivered, vec![u32::MAX - 1, u32::MAX, 0, 1]);
        assert_eq!(assembler.push(fragments(u32::MAX).remove(0)).unwrap(), Assembled::Stale);
        assert!(sequence_after(0, u32::MAX));
        assert!(!sequence_after(u32::MAX, 0));
    }

    #[test]
    fn non_image_frame_is_rejected() {
        let mut assembler = FragmentAssembler::new(StalePolicy::Drop);
        assert!(assembler.push(Frame::control(MessageKind::Heartbeat, 1)).is_err());
    }

    proptest! {
        #[test]
        fn shuffled_and_duplicated_fragments_complete_exactly_once(
            seed in prop::collection::vec(any::<prop::sample::Index>(), 1..64),
            dupes in prop::collection::vec(any::<prop::sample::Index>(), 0..16)
        ) {
            let mut frames = fragments(7);
            let n = frames.len();
            for (i, index) in seed.iter().enumerate() {
                frames.swap(i % n, index.index(n));
            }
            for index in &dupes {
                let copy = frames[index.index(n)].clone();
                frames.push(copy);
            }

            let mut assembler = FragmentAssembler::new(StalePolicy::Drop);
            let mut completed = Vec::new();
            for frame in frames {
                if let Assembled::Complete(set) = assembler.push(frame).unwrap() {
                    completed.push(set);
                }
            }
            prop_assert_eq!(completed.len(), 1);
            prop_assert_eq!(&completed[0], &image_set(7, 7));
        }

        #[test]
        fn completed_sequences_strictly_increase(
            order in prop::collection::vec(1u32..12, 1..40)
        ) {
            let mut assembler = FragmentAssembler::new(StalePolicy::Drop);
            let mut delivered = Vec::new();
            for sequence in order {
                for frame in fragments(sequence) {
                    if let Assembled::Complete(set) = assembler.push(frame).unwrap() {
                        delivered.push(set.sequence_number);
                    }
                }
            }
            prop_assert!(delivered.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
