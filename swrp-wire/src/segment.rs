//! Frame segmenter / reassembler (C4).
//!
//! Maps a variable-size encoded video frame onto a finite sequence of
//! `FrameSegment`s no larger than [`SEGMENT_SIZE`], and reassembles them back
//! into an [`EncodedFrame`] on the other side, tolerating out-of-order
//! arrival and duplicates. The underlying transport in this system delivers
//! packets in order, but the reassembler does not rely on that.

use crate::error::{Error, Result};
use alloc::vec;
use alloc::vec::Vec;

/// Maximum payload carried by a single segment: 64 KiB.
pub const SEGMENT_SIZE: usize = 64 * 1024;

/// The largest `segment_count` the wire format can express
/// (`segment_count` is a `u16`).
pub const MAX_SEGMENT_COUNT: usize = 65_535;

/// A complete, encoded video frame, still owned by the source encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Unique, strictly increasing per session.
    pub frame_number: u64,
    pub pts_us: u64,
    pub capture_ts_us: u64,
    /// Whether the encoder marked this an IDR/keyframe. The wire format does
    /// not carry this bit; the sink derives it from the codec bitstream, not
    /// from reassembly, so frames reconstructed by [`Reassembler`] always
    /// carry `false` here — callers that need the real value get it from the
    /// decoder, not from this struct.
    pub is_keyframe: bool,
    pub data: Vec<u8>,
}

/// An immutable slice of an [`EncodedFrame`], sized to fit in one FRAME
/// packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSegment {
    pub frame_number: u64,
    pub pts_us: u64,
    pub capture_ts_us: u64,
    /// Total size of the frame this segment belongs to, across all segments.
    pub frame_size: u32,
    pub segment_index: u16,
    pub segment_count: u16,
    pub data: Vec<u8>,
}

/// Splits encoded frames into wire-sized segments.
///
/// Stateless: holds no per-frame data between calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct Segmenter;

impl Segmenter {
    pub const fn new() -> Self {
        Self
    }

    /// Splits `frame` into `ceil(N / SEGMENT_SIZE)` segments (at least one,
    /// even for a zero-byte frame). Fails with [`Error::TooManySegments`] if
    /// that would exceed [`MAX_SEGMENT_COUNT`].
    pub fn split(&self, frame: &EncodedFrame) -> Result<Vec<FrameSegment>> {
        let n = frame.data.len();
        let segment_count = n.div_ceil(SEGMENT_SIZE).max(1);
        if segment_count > MAX_SEGMENT_COUNT {
            return Err(Error::TooManySegments);
        }

        let mut segments = Vec::with_capacity(segment_count);
        for index in 0..segment_count {
            let start = index * SEGMENT_SIZE;
            let end = (start + SEGMENT_SIZE).min(n);
            segments.push(FrameSegment {
                frame_number: frame.frame_number,
                pts_us: frame.pts_us,
                capture_ts_us: frame.capture_ts_us,
                frame_size: n as u32,
                segment_index: index as u16,
                segment_count: segment_count as u16,
                data: frame.data[start..end].to_vec(),
            });
        }
        Ok(segments)
    }
}

/// The single in-flight frame the reassembler is collecting segments for.
struct PendingFrame {
    frame_number: u64,
    pts_us: u64,
    capture_ts_us: u64,
    frame_size: u32,
    segment_count: u16,
    slots: Vec<Option<Vec<u8>>>,
    received_count: u16,
}

impl PendingFrame {
    fn new(
        frame_number: u64,
        pts_us: u64,
        capture_ts_us: u64,
        frame_size: u32,
        segment_count: u16,
    ) -> Self {
        Self {
            frame_number,
            pts_us,
            capture_ts_us,
            frame_size,
            segment_count,
            slots: vec![None; segment_count as usize],
            received_count: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.received_count == self.segment_count
    }

    fn into_frame(self) -> EncodedFrame {
        let mut data = Vec::with_capacity(self.frame_size as usize);
        for slot in self.slots {
            data.extend_from_slice(&slot.expect("complete frame has every slot filled"));
        }
        EncodedFrame {
            frame_number: self.frame_number,
            pts_us: self.pts_us,
            capture_ts_us: self.capture_ts_us,
            is_keyframe: false,
            data,
        }
    }
}

/// Reassembles [`FrameSegment`]s back into [`EncodedFrame`]s.
///
/// Holds at most one pending frame: the arrival of a segment from a newer
/// `frame_number` implicitly drops whatever incomplete frame was pending
/// (frames are not interleaved in flight on this link; a later keyframe
/// recovers any loss).
#[derive(Default)]
pub struct Reassembler {
    pending: Option<PendingFrame>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self { pending: None }
    }

    /// Feeds one segment in. Returns `Some(frame)` the moment the frame it
    /// belongs to becomes complete, `None` otherwise (including for
    /// duplicate segments, which are silently ignored).
    pub fn push(&mut self, segment: FrameSegment) -> Option<EncodedFrame> {
        let needs_new_pending = match &self.pending {
            Some(p) => p.frame_number != segment.frame_number,
            None => true,
        };
        if needs_new_pending {
            self.pending = Some(PendingFrame::new(
                segment.frame_number,
                segment.pts_us,
                segment.capture_ts_us,
                segment.frame_size,
                segment.segment_count,
            ));
        }

        let pending = self.pending.as_mut().expect("just installed above");
        let index = segment.segment_index as usize;
        if index >= pending.slots.len() {
            // Malformed segment_count disagreement; drop rather than panic.
            return None;
        }
        if pending.slots[index].is_some() {
            return None; // duplicate, silently ignored
        }

        pending.slots[index] = Some(segment.data);
        pending.received_count += 1;

        if pending.is_complete() {
            self.pending.take().map(PendingFrame::into_frame)
        } else {
            None
        }
    }

    /// Clears any pending frame. Used on session teardown.
    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// `frame_number` of the frame currently being assembled, if any.
    pub fn pending_frame_number(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.frame_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(frame_number: u64, data: Vec<u8>) -> EncodedFrame {
        EncodedFrame {
            frame_number,
            pts_us: 1_000 + frame_number,
            capture_ts_us: 2_000 + frame_number,
            is_keyframe: frame_number == 0,
            data,
        }
    }

    #[test]
    fn single_segment_for_small_frame() {
        let f = frame(1, vec![1, 2, 3, 4]);
        let segments = Segmenter::new().split(&f).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].segment_count, 1);
        assert_eq!(segments[0].frame_size, 4);
    }

    #[test]
    fn zero_byte_frame_still_yields_one_segment() {
        let f = frame(1, vec![]);
        let segments = Segmenter::new().split(&f).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].data.len(), 0);
    }

    #[test]
    fn exact_multiple_of_segment_size_splits_evenly() {
        let f = frame(1, vec![7u8; SEGMENT_SIZE * 2]);
        let segments = Segmenter::new().split(&f).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].data.len(), SEGMENT_SIZE);
        assert_eq!(segments[1].data.len(), SEGMENT_SIZE);
    }

    #[test]
    fn multi_segment_frame_has_expected_sizes() {
        // 200_000 bytes -> ceil(200000/65536) = 4 segments: 65536 x3 + 3392
        let f = frame(42, vec![9u8; 200_000]);
        let segments = Segmenter::new().split(&f).unwrap();
        assert_eq!(segments.len(), 4);
        let sizes: Vec<usize> = segments.iter().map(|s| s.data.len()).collect();
        assert_eq!(sizes, vec![65536, 65536, 65536, 3392]);
        for (i, s) in segments.iter().enumerate() {
            assert_eq!(s.segment_index, i as u16);
            assert_eq!(s.segment_count, 4);
            assert_eq!(s.frame_size, 200_000);
        }
    }

    #[test]
    fn segment_bijection_any_permutation_order() {
        let f = frame(7, (0u32..200_000).map(|b| (b % 251) as u8).collect());
        let segments = Segmenter::new().split(&f).unwrap();

        let mut permuted = segments.clone();
        permuted.swap(0, 2);
        permuted.swap(1, 3);

        let mut reassembler = Reassembler::new();
        let mut completed = None;
        for (i, seg) in permuted.into_iter().enumerate() {
            let out = reassembler.push(seg);
            if i < 3 {
                assert!(out.is_none(), "should not complete before the last segment");
            } else {
                completed = out;
            }
        }

        let reassembled = completed.expect("frame should complete on the last segment");
        assert_eq!(reassembled.frame_number, f.frame_number);
        assert_eq!(reassembled.pts_us, f.pts_us);
        assert_eq!(reassembled.capture_ts_us, f.capture_ts_us);
        assert_eq!(reassembled.data, f.data);
    }

    #[test]
    fn duplicate_segment_is_ignored_without_error() {
        let f = frame(2, vec![1, 2, 3, 4, 5]);
        let first = as_segment(&f, 0, 2, vec![1, 2, 3]);
        let second = as_segment(&f, 1, 2, vec![4, 5]);

        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(first.clone()).is_none());
        assert!(reassembler.push(first.clone()).is_none()); // duplicate
        let complete = reassembler.push(second);
        assert_eq!(complete.unwrap().data, vec![1, 2, 3, 4, 5]);
    }

    fn as_segment(
        f: &EncodedFrame,
        index: u16,
        count: u16,
        data: Vec<u8>,
    ) -> FrameSegment {
        FrameSegment {
            frame_number: f.frame_number,
            pts_us: f.pts_us,
            capture_ts_us: f.capture_ts_us,
            frame_size: f.data.len() as u32,
            segment_index: index,
            segment_count: count,
            data,
        }
    }

    #[test]
    fn new_frame_number_drops_incomplete_predecessor() {
        let f1 = frame(1, vec![1u8; 3 * SEGMENT_SIZE]);
        let segments1 = Segmenter::new().split(&f1).unwrap();
        assert_eq!(segments1.len(), 3);

        let mut reassembler = Reassembler::new();
        reassembler.push(segments1[0].clone());
        assert_eq!(reassembler.pending_frame_number(), Some(1));

        let f2 = frame(2, vec![2, 2, 2]);
        let segments2 = Segmenter::new().split(&f2).unwrap();
        let out = reassembler.push(segments2[0].clone());
        assert!(out.is_some()); // single-segment frame 2 completes immediately
        assert_eq!(out.unwrap().frame_number, 2);
    }

    #[test]
    fn reset_clears_pending_frame() {
        let f = frame(1, vec![1u8; 3 * SEGMENT_SIZE]);
        let segments = Segmenter::new().split(&f).unwrap();
        let mut reassembler = Reassembler::new();
        reassembler.push(segments[0].clone());
        assert!(reassembler.pending_frame_number().is_some());
        reassembler.reset();
        assert!(reassembler.pending_frame_number().is_none());
    }

    #[test]
    fn out_of_order_three_segment_frame_completes_on_third_call() {
        let f = frame(3, vec![5u8; 3]);
        let mut segments = vec![
            as_segment(&f, 0, 3, vec![1]),
            as_segment(&f, 1, 3, vec![2]),
            as_segment(&f, 2, 3, vec![3]),
        ];
        // feed order 2, 0, 1
        segments.swap(0, 2);
        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(segments[0].clone()).is_none());
        assert!(reassembler.push(segments[1].clone()).is_none());
        let out = reassembler.push(segments[2].clone());
        assert_eq!(out.unwrap().data, vec![1, 2, 3]);

        // duplicate of an already-consumed frame's segment on a fresh pending
        // frame with the same shape: feeding segment 1 twice yields no frame.
        let f2 = frame(4, vec![9u8; 3]);
        let segs2 = vec![
            as_segment(&f2, 0, 3, vec![1]),
            as_segment(&f2, 1, 3, vec![2]),
            as_segment(&f2, 2, 3, vec![3]),
        ];
        reassembler.push(segs2[0].clone());
        assert!(reassembler.push(segs2[1].clone()).is_none());
        assert!(reassembler.push(segs2[1].clone()).is_none()); // duplicate
    }
}
