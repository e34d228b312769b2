use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::{
    bookkeeper::SegmentBookkeeper,
    clock::ClockReceiver,
    sink::{BufferSink, SinkHandle},
    util::range::TimeRange,
    TsumugiResult,
};

/// Data this close behind the playback position is never collected.
const SEEK_BACK_MARGIN: f64 = 1.;

/// Ranges to evict so that at most `max_behind` seconds behind and `max_ahead` seconds
/// ahead of `position` stay buffered.
pub fn collectable_ranges(
    buffered: &[TimeRange],
    position: f64,
    max_behind: Option<f64>,
    max_ahead: Option<f64>,
) -> Vec<TimeRange> {
    let mut ranges = Vec::new();
    if let Some(behind) = max_behind {
        let limit = position - behind.max(SEEK_BACK_MARGIN);
        ranges.extend(
            buffered
                .iter()
                .filter(|r| r.start < limit)
                .map(|r| TimeRange::new(r.start, r.end.min(limit))),
        );
    }
    if let Some(ahead) = max_ahead {
        let limit = position + ahead;
        ranges.extend(
            buffered
                .iter()
                .filter(|r| r.end > limit)
                .map(|r| TimeRange::new(r.start.max(limit), r.end)),
        );
    }
    ranges
}

/// Widen the kept window so that it never cuts through a recorded segment.
///
/// Returns the `(max_behind, max_ahead)` to collect with. A half-evicted segment
/// is dropped by the bookkeeper and would only be fetched again.
pub fn aligned_limits(
    bookkeeper: &SegmentBookkeeper,
    position: f64,
    max_behind: Option<f64>,
    max_ahead: Option<f64>,
) -> (Option<f64>, Option<f64>) {
    let behind = max_behind.map(|behind| {
        let limit = position - behind.max(SEEK_BACK_MARGIN);
        let start = bookkeeper
            .query(limit)
            .map_or(limit, |chunk| chunk.range.start);
        position - start
    });
    let ahead = max_ahead.map(|ahead| {
        let limit = position + ahead;
        let end = bookkeeper
            .query(limit)
            .filter(|chunk| chunk.range.start < limit)
            .map_or(limit, |chunk| chunk.range.end);
        end - position
    });
    (behind, ahead)
}

/// Periodically evict buffered data far from the playback position.
///
/// Returns once the clock goes away.
pub async fn collect_garbage<S: BufferSink>(
    sink: SinkHandle<S>,
    clock: ClockReceiver,
    max_behind: Option<f64>,
    max_ahead: Option<f64>,
    interval: Duration,
) -> TsumugiResult<()> {
    if max_behind.is_none() && max_ahead.is_none() {
        return clock_closed(clock).await;
    }

    let mut interval = tokio::time::interval(interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if clock.has_changed().is_err() {
            return Ok(());
        }

        let position = clock.borrow().current_time;
        let buffered = sink.sink().buffered_ranges();
        let (behind, ahead) = aligned_limits(&sink.bookkeeper(), position, max_behind, max_ahead);
        for range in collectable_ranges(&buffered, position, behind, ahead) {
            tracing::debug!(track_type = %sink.track_type(), start = range.start, end = range.end, position, "Collecting buffered data.");
            sink.remove(range.start, range.end).await?;
        }
        sink.synchronize();
    }
}

async fn clock_closed(mut clock: ClockReceiver) -> TsumugiResult<()> {
    while clock.changed().await.is_ok() {}
    Ok(())
}
