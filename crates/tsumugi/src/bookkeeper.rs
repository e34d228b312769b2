use std::{cmp::Ordering, collections::BTreeMap, ops::Bound};

use crate::{segment::Segment, util::range::TimeRange};

/// Pieces shorter than this left over by an overwrite are dropped.
const MIN_CHUNK_DURATION: f64 = 1e-3;

/// Edge tolerance, in seconds, when matching chunks against the sink's real ranges.
pub const SYNC_TOLERANCE: f64 = 0.05;

/// Segment believed to fill a buffered range.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRef {
    pub segment: Segment,
    pub period_id: String,
    pub adaptation_id: String,
    pub representation_id: String,
    pub bitrate: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedChunk {
    pub range: TimeRange,
    pub reference: SegmentRef,
}

impl BufferedChunk {
    /// Whether the chunk still holds the whole segment it was created for.
    pub fn is_complete(&self) -> bool {
        self.reference
            .segment
            .time_range()
            .is_some_and(|wanted| self.range.covers(&wanted, SYNC_TOLERANCE))
    }
}

#[derive(Debug, Clone, Copy)]
struct TimeKey(f64);

impl PartialEq for TimeKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for TimeKey {}

impl PartialOrd for TimeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Ordered, non-overlapping record of which segments a buffer sink holds.
///
/// Chunks are keyed by their start time, so point lookups and overwrites only
/// touch the chunks around the affected range.
#[derive(Debug, Default)]
pub struct SegmentBookkeeper {
    chunks: BTreeMap<TimeKey, BufferedChunk>,
}

impl SegmentBookkeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &BufferedChunk> {
        self.chunks.values()
    }

    /// Chunks overlapping `range`, in time order.
    pub fn chunks_in(&self, range: TimeRange) -> impl Iterator<Item = &BufferedChunk> {
        let before = self
            .chunks
            .range(..TimeKey(range.start))
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.range.overlaps(&range));
        let inside = self
            .chunks
            .range((
                Bound::Included(TimeKey(range.start)),
                Bound::Excluded(TimeKey(range.end)),
            ))
            .map(|(_, chunk)| chunk);
        before.into_iter().chain(inside)
    }

    /// Record `reference` as filling `range`; whatever was recorded there before is overwritten.
    pub fn insert(&mut self, range: TimeRange, reference: SegmentRef) {
        if range.is_empty() {
            return;
        }
        self.carve(range);
        self.chunks
            .insert(TimeKey(range.start), BufferedChunk { range, reference });
    }

    pub fn query(&self, time: f64) -> Option<&BufferedChunk> {
        self.chunks
            .range(..=TimeKey(time))
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.range.contains(time))
    }

    pub fn remove_range(&mut self, start: f64, end: f64) {
        let range = TimeRange::new(start, end);
        if !range.is_empty() {
            self.carve(range);
        }
    }

    /// Whether `segment` of `representation_id` is entirely recorded.
    pub fn has_segment(&self, segment: &Segment, representation_id: &str) -> bool {
        let Some(wanted) = segment.time_range() else {
            return false;
        };
        self.chunks_in(wanted).any(|chunk| {
            chunk.reference.representation_id == representation_id
                && chunk.reference.segment.id == segment.id
                && chunk.is_complete()
        })
    }

    /// Forget chunks the sink no longer holds.
    ///
    /// A chunk survives only if one of the sink's ranges covers it; the platform may
    /// evict data on its own and the record must never claim more than the sink has.
    pub fn synchronize(&mut self, actual: &[TimeRange]) {
        let before = self.chunks.len();
        self.chunks.retain(|_, chunk| {
            let index = actual.partition_point(|r| r.end + SYNC_TOLERANCE <= chunk.range.start);
            actual[index..]
                .iter()
                .take_while(|r| r.start - SYNC_TOLERANCE < chunk.range.end)
                .any(|r| r.covers(&chunk.range, SYNC_TOLERANCE))
        });
        let evicted = before - self.chunks.len();
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted chunks missing from the buffer.");
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Remove everything overlapping `range`, keeping the parts of chunks outside of it.
    fn carve(&mut self, range: TimeRange) {
        let overlapping: Vec<TimeKey> = {
            let before = self
                .chunks
                .range(..TimeKey(range.start))
                .next_back()
                .filter(|(_, chunk)| chunk.range.overlaps(&range))
                .map(|(key, _)| *key);
            let inside = self
                .chunks
                .range((
                    Bound::Included(TimeKey(range.start)),
                    Bound::Excluded(TimeKey(range.end)),
                ))
                .map(|(key, _)| *key);
            before.into_iter().chain(inside).collect()
        };

        for key in overlapping {
            let Some(chunk) = self.chunks.remove(&key) else {
                continue;
            };
            if range.start - chunk.range.start >= MIN_CHUNK_DURATION {
                let left = TimeRange::new(chunk.range.start, range.start);
                self.chunks.insert(
                    TimeKey(left.start),
                    BufferedChunk {
                        range: left,
                        reference: chunk.reference.clone(),
                    },
                );
            }
            if chunk.range.end - range.end >= MIN_CHUNK_DURATION {
                let right = TimeRange::new(range.end, chunk.range.end);
                self.chunks.insert(
                    TimeKey(right.start),
                    BufferedChunk {
                        range: right,
                        reference: chunk.reference,
                    },
                );
            }
        }
    }
}
