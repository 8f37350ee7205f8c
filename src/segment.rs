//! Segment manager: carves the target byte range into segments, assigns
//! them to commands by CUID, and tracks completion.

use std::collections::VecDeque;

use crate::cuid::Cuid;
use crate::request::Request;

/// A half-open byte range `[begin, end)` within the target, with a current
/// write cursor and the owning command's CUID, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub begin: u64,
    pub end: u64,
    pub cursor: u64,
    pub cuid: Option<Cuid>,
    pub finished: bool,
}

impl Segment {
    fn new(begin: u64, end: u64) -> Self {
        let finished = begin == end;
        Self {
            begin,
            end,
            cursor: begin,
            cuid: None,
            finished,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.cursor
    }
}

/// Owns every segment of the current target, plus the error counter and
/// the reserved-request fallback FIFO. Mutated only by the command
/// currently holding a given segment, enforced here by CUID check.
#[derive(Debug, Default)]
pub struct SegmentManager {
    segments: Vec<Segment>,
    errors: u64,
    reserved: VecDeque<Request>,
}

impl SegmentManager {
    /// Splits `[0, total_length)` into `split` roughly-equal segments.
    /// A `total_length` of zero or a `split` of zero yields a single
    /// already-finished zero-length segment.
    pub fn new(total_length: u64, split: usize) -> Self {
        let split = split.max(1);
        let mut segments = Vec::with_capacity(split);
        if total_length == 0 {
            segments.push(Segment::new(0, 0));
        } else {
            let chunk = total_length / split as u64;
            let remainder = total_length % split as u64;
            let mut begin = 0;
            for i in 0..split {
                let size = chunk + if (i as u64) < remainder { 1 } else { 0 };
                if size == 0 {
                    continue;
                }
                let end = begin + size;
                segments.push(Segment::new(begin, end));
                begin = end;
            }
        }
        Self {
            segments,
            errors: 0,
            reserved: VecDeque::new(),
        }
    }

    /// Rebuilds a manager directly from a persisted segment list (used by
    /// the sidecar loader to resume a partial transfer).
    pub fn from_segments(segments: Vec<Segment>) -> Self {
        Self {
            segments,
            errors: 0,
            reserved: VecDeque::new(),
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Assigns an unassigned segment to `cuid`, preferring the
    /// lowest-index incomplete-and-unheld segment, and returns a copy.
    /// Returns `None` when every segment is held or finished.
    pub fn get_segment(&mut self, cuid: Cuid) -> Option<Segment> {
        let slot = self
            .segments
            .iter_mut()
            .find(|s| !s.finished && s.cuid.is_none())?;
        slot.cuid = Some(cuid);
        Some(slot.clone())
    }

    /// Writes back the write cursor for the caller's held segment. Panics
    /// in debug builds via `debug_assert` if the CUID doesn't match; in
    /// release the write is simply refused, matching the "segment manager
    /// is mutated only by the command currently holding the segment"
    /// invariant.
    pub fn update_segment(&mut self, segment: &Segment) -> bool {
        let Some(slot) = self.find_by_range_mut(segment.begin, segment.end) else {
            return false;
        };
        if slot.cuid != segment.cuid || segment.cuid.is_none() {
            return false;
        }
        slot.cursor = segment.cursor;
        true
    }

    /// Marks the segment finished and releases it.
    pub fn complete_segment(&mut self, segment: &Segment) -> bool {
        let Some(slot) = self.find_by_range_mut(segment.begin, segment.end) else {
            return false;
        };
        if slot.cuid != segment.cuid || segment.cuid.is_none() {
            return false;
        }
        slot.cursor = slot.end;
        slot.finished = true;
        slot.cuid = None;
        true
    }

    /// Releases any segment held by `cuid` without marking it finished;
    /// its write cursor is preserved so a future assignment can resume.
    pub fn cancel_segment(&mut self, cuid: Cuid) {
        for segment in &mut self.segments {
            if segment.cuid == Some(cuid) {
                segment.cuid = None;
            }
        }
    }

    pub fn finished(&self) -> bool {
        self.segments.iter().all(|s| s.finished)
    }

    /// Marks every segment finished outright. Swarm mode has no byte
    /// ranges of its own to complete; a completion-watching command calls
    /// this once the piece manager reports every piece verified, so the
    /// dispatcher's single `finished()` exit condition still applies.
    pub fn force_finish(&mut self) {
        for segment in &mut self.segments {
            segment.finished = true;
            segment.cuid = None;
        }
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn add_error(&mut self) {
        self.errors += 1;
    }

    pub fn push_reserved(&mut self, request: Request) {
        self.reserved.push_back(request);
    }

    /// Consumed by the abort path's `tryReserved` fallback.
    pub fn pop_reserved(&mut self) -> Option<Request> {
        self.reserved.pop_front()
    }

    fn find_by_range_mut(&mut self, begin: u64, end: u64) -> Option<&mut Segment> {
        self.segments
            .iter_mut()
            .find(|s| s.begin == begin && s.end == end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_is_lowest_index_first() {
        let mut mgr = SegmentManager::new(100, 4);
        let s0 = mgr.get_segment(1).unwrap();
        assert_eq!(s0.begin, 0);
        let s1 = mgr.get_segment(2).unwrap();
        assert_eq!(s1.begin, 25);
    }

    #[test]
    fn zero_length_segment_is_immediately_finished() {
        let mgr = SegmentManager::new(0, 4);
        assert!(mgr.finished());
    }

    #[test]
    fn cancel_releases_for_reassignment() {
        let mut mgr = SegmentManager::new(100, 4);
        let seg = mgr.get_segment(1).unwrap();
        assert!(mgr.get_segment(1).is_none() || seg.begin != mgr.get_segment(2).unwrap().begin);
        mgr.cancel_segment(1);
        let reassigned = mgr.get_segment(5).unwrap();
        assert_eq!(reassigned.begin, 0);
    }

    #[test]
    fn complete_segment_requires_matching_cuid() {
        let mut mgr = SegmentManager::new(100, 1);
        let mut seg = mgr.get_segment(1).unwrap();
        seg.cursor = seg.end;
        seg.cuid = Some(99);
        assert!(!mgr.complete_segment(&seg));
        seg.cuid = Some(1);
        assert!(mgr.complete_segment(&seg));
        assert!(mgr.finished());
    }

    #[test]
    fn update_segment_persists_cursor() {
        let mut mgr = SegmentManager::new(100, 1);
        let mut seg = mgr.get_segment(7).unwrap();
        seg.cursor = 42;
        assert!(mgr.update_segment(&seg));
        assert_eq!(mgr.segments()[0].cursor, 42);
    }

    #[test]
    fn get_segment_returns_none_when_all_held_or_finished() {
        let mut mgr = SegmentManager::new(10, 1);
        let seg = mgr.get_segment(1).unwrap();
        assert!(mgr.get_segment(2).is_none());
        let mut done = seg.clone();
        done.cursor = done.end;
        mgr.complete_segment(&done);
        assert!(mgr.finished());
        assert!(mgr.get_segment(3).is_none());
    }

    #[test]
    fn reserved_fifo_order() {
        use crate::request::ProtocolHint;
        use url::Url;
        let mut mgr = SegmentManager::default();
        mgr.push_reserved(Request::new(
            Url::parse("http://a/1").unwrap(),
            ProtocolHint::RequestResponse,
        ));
        mgr.push_reserved(Request::new(
            Url::parse("http://a/2").unwrap(),
            ProtocolHint::RequestResponse,
        ));
        assert_eq!(mgr.pop_reserved().unwrap().url().path(), "/1");
        assert_eq!(mgr.pop_reserved().unwrap().url().path(), "/2");
        assert!(mgr.pop_reserved().is_none());
    }
}
