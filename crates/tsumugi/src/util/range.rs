/// Byte window of a resource, sent as an HTTP `Range` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, length: Option<u64>) -> Self {
        Self { offset, length }
    }

    pub fn is_empty(&self) -> bool {
        self.length == Some(0)
    }

    /// `None` for an empty range, which has no header form.
    pub fn to_http_range(&self) -> Option<String> {
        match self.length {
            Some(0) => None,
            Some(length) => Some(format!("bytes={}-{}", self.offset, self.offset + length - 1)),
            None => Some(format!("bytes={}-", self.offset)),
        }
    }
}

/// Half-open time range `[start, end)` in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        (self.end - self.start).max(0.)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether `other` lies entirely inside `self`, allowing `tolerance` seconds on each edge.
    pub fn covers(&self, other: &TimeRange, tolerance: f64) -> bool {
        self.start <= other.start + tolerance && self.end >= other.end - tolerance
    }

    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        let range = TimeRange::new(self.start.max(other.start), self.end.min(other.end));
        (!range.is_empty()).then_some(range)
    }
}

/// Find the range in an ordered list of ranges that contains `time`.
pub fn range_containing(ranges: &[TimeRange], time: f64) -> Option<TimeRange> {
    let index = ranges.partition_point(|r| r.end <= time);
    ranges.get(index).copied().filter(|r| r.contains(time))
}

/// Seconds of contiguous buffered data ahead of `time`, `0` when `time` is not buffered.
pub fn buffer_gap(ranges: &[TimeRange], time: f64) -> f64 {
    range_containing(ranges, time)
        .map(|r| r.end - time)
        .unwrap_or(0.)
}

/// Subtract `removed` from an ordered list of disjoint ranges.
pub fn subtract(ranges: &[TimeRange], removed: &TimeRange) -> Vec<TimeRange> {
    let mut result = Vec::with_capacity(ranges.len() + 1);
    for range in ranges {
        if !range.overlaps(removed) {
            result.push(*range);
            continue;
        }
        if range.start < removed.start {
            result.push(TimeRange::new(range.start, removed.start));
        }
        if range.end > removed.end {
            result.push(TimeRange::new(removed.end, range.end));
        }
    }
    result
}

/// Insert `added` into an ordered list of disjoint ranges, merging ranges closer than `gap_tolerance`.
pub fn union(ranges: &[TimeRange], added: &TimeRange, gap_tolerance: f64) -> Vec<TimeRange> {
    let mut result: Vec<TimeRange> = Vec::with_capacity(ranges.len() + 1);
    let mut pending = *added;
    let mut inserted = false;
    for range in ranges {
        if range.end + gap_tolerance < pending.start {
            result.push(*range);
        } else if pending.end + gap_tolerance < range.start {
            if !inserted {
                result.push(pending);
                inserted = true;
            }
            result.push(*range);
        } else {
            pending = TimeRange::new(pending.start.min(range.start), pending.end.max(range.end));
        }
    }
    if !inserted {
        result.push(pending);
    }
    result
}
