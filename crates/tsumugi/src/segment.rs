use std::sync::{PoisonError, RwLock};

use url::Url;

use crate::{
    util::range::{ByteRange, TimeRange},
    TsumugiResult,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentKind {
    /// Initialization data, carries no media time.
    Init,
    /// Media data presented in `[start, end)`.
    Media { start: f64, end: f64 },
}

/// Reference to one downloadable unit of a representation.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub id: String,
    pub kind: SegmentKind,
    pub url: Url,
    pub byte_range: Option<ByteRange>,
}

impl Segment {
    pub fn init(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: id.into(),
            kind: SegmentKind::Init,
            url,
            byte_range: None,
        }
    }

    pub fn media(id: impl Into<String>, url: Url, start: f64, end: f64) -> Self {
        Self {
            id: id.into(),
            kind: SegmentKind::Media { start, end },
            url,
            byte_range: None,
        }
    }

    pub fn with_byte_range(mut self, byte_range: ByteRange) -> Self {
        self.byte_range = Some(byte_range);
        self
    }

    pub fn is_init(&self) -> bool {
        matches!(self.kind, SegmentKind::Init)
    }

    pub fn time_range(&self) -> Option<TimeRange> {
        match self.kind {
            SegmentKind::Init => None,
            SegmentKind::Media { start, end } => Some(TimeRange::new(start, end)),
        }
    }
}

/// Resolves playback positions of one representation to segments.
pub trait SegmentIndex: Send + Sync + std::fmt::Debug {
    fn init_segment(&self) -> Option<Segment>;

    /// Segment containing `time`, or the first one starting after it when `time` sits in a hole.
    fn segment_at(&self, time: f64) -> Option<Segment>;

    /// Media segments whose start is at or after `time`.
    fn segments_from(&self, time: f64) -> Vec<Segment>;

    /// End of the last known media segment.
    fn last_position(&self) -> Option<f64>;

    /// Whether segments may still be appended to this index (live content).
    fn is_finished(&self) -> bool;

    /// Merge the knowledge of a refreshed index into this one.
    fn update(&self, newer: &dyn SegmentIndex);
}

#[derive(Debug, Default)]
struct SegmentList {
    init: Option<Segment>,
    segments: Vec<Segment>,
    finished: bool,
}

/// Explicit, time-ordered list of media segments.
#[derive(Debug, Default)]
pub struct SegmentListIndex {
    inner: RwLock<SegmentList>,
}

impl SegmentListIndex {
    pub fn new(init: Option<Segment>, mut segments: Vec<Segment>, finished: bool) -> Self {
        segments.retain(|s| !s.is_init());
        segments.sort_by(|a, b| segment_start(a).total_cmp(&segment_start(b)));
        Self {
            inner: RwLock::new(SegmentList {
                init,
                segments,
                finished,
            }),
        }
    }

    /// Evenly sized segments named `<prefix>-<n>.m4s` relative to `base`.
    pub fn uniform(
        base: &Url,
        prefix: &str,
        start: f64,
        end: f64,
        duration: f64,
        finished: bool,
    ) -> TsumugiResult<Self> {
        let init = Segment::init(format!("{prefix}-init"), base.join(&format!("{prefix}-init.mp4"))?);
        let mut segments = Vec::new();
        let mut time = start;
        let mut number = 0;
        while time < end && duration > 0. {
            let segment_end = (time + duration).min(end);
            let name = format!("{prefix}-{number}.m4s");
            segments.push(Segment::media(
                format!("{prefix}-{number}"),
                base.join(&name)?,
                time,
                segment_end,
            ));
            time = segment_end;
            number += 1;
        }
        Ok(Self::new(Some(init), segments, finished))
    }

    pub fn push(&self, segment: Segment) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let start = segment_start(&segment);
        if inner
            .segments
            .last()
            .is_some_and(|last| segment_start(last) >= start)
        {
            tracing::debug!(segment = %segment.id, "Ignoring segment older than the index tail.");
            return;
        }
        inner.segments.push(segment);
    }

    pub fn finish(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .finished = true;
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .segments
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn segment_start(segment: &Segment) -> f64 {
    match segment.kind {
        SegmentKind::Media { start, .. } => start,
        SegmentKind::Init => f64::NEG_INFINITY,
    }
}

fn segment_end(segment: &Segment) -> f64 {
    match segment.kind {
        SegmentKind::Media { end, .. } => end,
        SegmentKind::Init => f64::NEG_INFINITY,
    }
}

impl SegmentIndex for SegmentListIndex {
    fn init_segment(&self) -> Option<Segment> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .init
            .clone()
    }

    fn segment_at(&self, time: f64) -> Option<Segment> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let index = inner.segments.partition_point(|s| segment_end(s) <= time);
        inner.segments.get(index).cloned()
    }

    fn segments_from(&self, time: f64) -> Vec<Segment> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let index = inner.segments.partition_point(|s| segment_start(s) < time);
        inner.segments[index..].to_vec()
    }

    fn last_position(&self) -> Option<f64> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .segments
            .last()
            .map(segment_end)
    }

    fn is_finished(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .finished
    }

    fn update(&self, newer: &dyn SegmentIndex) {
        let since = self.last_position().unwrap_or(f64::NEG_INFINITY);
        let added = newer.segments_from(since);
        tracing::debug!(added = added.len(), since, "Updating segment list index.");
        for segment in added {
            self.push(segment);
        }
        if newer.is_finished() {
            self.finish();
        }
    }
}
