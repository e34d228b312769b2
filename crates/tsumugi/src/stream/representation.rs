use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    abr::bandwidth::{SampleSender, ThroughputSample},
    backoff::try_with_backoff,
    bookkeeper::{SegmentRef, SYNC_TOLERANCE},
    clock::ClockReceiver,
    config::StreamConfig,
    events::{EventSender, StreamEvent},
    fetch::SegmentFetcher,
    manifest::{Adaptation, Period, Representation, TrackType},
    segment::Segment,
    sink::{BufferSink, SinkChunk, SinkHandle},
    TsumugiResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    FetchingInit,
    FetchingMedia,
    Pushing,
    Stopped,
}

/// Why a loop has nothing to download right now.
#[derive(Debug, Clone, Copy, PartialEq)]
enum IdleReason {
    BufferFull,
    Complete,
    /// The index ends at this position and more segments are expected.
    NeedsRefresh(f64),
}

enum NextStep {
    Fetch(Segment),
    Idle(IdleReason),
}

/// Fetches and pushes the segments of one representation into a sink.
///
/// ```text
///            ┌──────────────────────────────────────────┐
///            ▼                                          │
///  Idle ─► FetchingInit ─► FetchingMedia ─► Pushing ────┘
///   │           │               │             │
///   └───────────┴───── kill / terminate ──────┴──► Stopped
/// ```
///
/// Only one loop may write to a sink at any time; [`LoopHandle::wait`] must have
/// returned before another loop is spawned for the same sink.
pub struct RepresentationStream<F, S> {
    pub track_type: TrackType,
    pub period: Arc<Period>,
    pub adaptation: Arc<Adaptation>,
    pub representation: Arc<Representation>,
    pub fetcher: Arc<F>,
    pub sink: SinkHandle<S>,
    pub clock: ClockReceiver,
    pub config: Arc<StreamConfig>,
    pub events: EventSender,
    pub samples: SampleSender,
}

impl<F, S> RepresentationStream<F, S>
where
    F: SegmentFetcher,
    S: BufferSink,
{
    pub fn spawn(self) -> LoopHandle {
        let kill = CancellationToken::new();
        let terminate = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(LoopState::Idle);
        let representation = self.representation.clone();

        let task = tokio::spawn({
            let kill = kill.clone();
            let terminate = terminate.clone();
            let track_type = self.track_type;
            let representation_id = representation.id.clone();
            async move {
                tracing::debug!(%track_type, representation_id, "Starting representation stream.");
                let result = tokio::select! {
                    biased;
                    _ = kill.cancelled() => {
                        tracing::debug!(%track_type, representation_id, "Representation stream killed.");
                        Ok(())
                    }
                    result = self.run(&state_tx, terminate) => result,
                };
                state_tx.send_replace(LoopState::Stopped);
                if let Err(e) = &result {
                    tracing::warn!(%track_type, representation_id, "Representation stream failed. {e}");
                }
                result
            }
        });

        LoopHandle {
            representation,
            kill,
            terminate,
            state: state_rx,
            task,
            finished: false,
        }
    }

    async fn run(
        mut self,
        state: &watch::Sender<LoopState>,
        terminate: CancellationToken,
    ) -> TsumugiResult<()> {
        let mut init_pushed = false;
        let mut reported: Option<IdleReason> = None;

        loop {
            if terminate.is_cancelled() {
                tracing::debug!(track_type = %self.track_type, representation_id = %self.representation.id, "Representation stream terminated.");
                return Ok(());
            }

            if !init_pushed {
                if let Some(init) = self.representation.index.init_segment() {
                    state.send_replace(LoopState::FetchingInit);
                    let (data, _) = self.fetch(&init).await?;
                    state.send_replace(LoopState::Pushing);
                    self.push(init, data).await?;
                }
                init_pushed = true;
                continue;
            }

            let position = self
                .clock
                .borrow_and_update()
                .current_time
                .max(self.period.start);
            self.sink.synchronize();

            match self.next_step(position) {
                NextStep::Fetch(segment) => {
                    reported = None;
                    state.send_replace(LoopState::FetchingMedia);
                    let (data, elapsed) = self.fetch(&segment).await?;
                    let _ = self
                        .samples
                        .send(ThroughputSample::new(data.len() as u64, elapsed));
                    state.send_replace(LoopState::Pushing);
                    self.push(segment, data).await?;
                }
                NextStep::Idle(reason) => {
                    if reported != Some(reason) {
                        reported = Some(reason);
                        self.report_idle(reason);
                    }
                    state.send_replace(LoopState::Idle);
                    tokio::select! {
                        _ = terminate.cancelled() => {}
                        changed = self.clock.changed() => {
                            if changed.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    /// End of the content this loop may download, when known.
    fn content_end(&self) -> Option<f64> {
        let index = &self.representation.index;
        let index_end = if index.is_finished() {
            index.last_position()
        } else {
            None
        };
        match (self.period.end(), index_end) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (end, None) | (None, end) => end,
        }
    }

    fn next_step(&self, position: f64) -> NextStep {
        let index = &self.representation.index;
        let content_end = self.content_end();
        let horizon =
            (position + self.config.buffer_goal()).min(content_end.unwrap_or(f64::INFINITY));
        let period_end = self.period.end_or_infinity();

        {
            let bookkeeper = self.sink.bookkeeper();
            let mut cursor = index.segment_at(position);
            while let Some(segment) = cursor {
                let Some(range) = segment.time_range() else {
                    break;
                };
                if range.start >= horizon || range.start >= period_end {
                    break;
                }
                if !bookkeeper.has_segment(&segment, &self.representation.id) {
                    return NextStep::Fetch(segment);
                }
                if range.end <= range.start {
                    break;
                }
                cursor = index.segment_at(range.end);
            }
        }

        let last_position = index.last_position().unwrap_or(self.period.start);
        if !index.is_finished() && last_position < horizon {
            NextStep::Idle(IdleReason::NeedsRefresh(last_position))
        } else if content_end.is_some_and(|end| horizon >= end - SYNC_TOLERANCE) {
            NextStep::Idle(IdleReason::Complete)
        } else {
            NextStep::Idle(IdleReason::BufferFull)
        }
    }

    fn report_idle(&self, reason: IdleReason) {
        let track_type = self.track_type;
        let period_id = self.period.id.clone();
        let event = match reason {
            IdleReason::BufferFull => StreamEvent::BufferFull {
                track_type,
                period_id,
            },
            IdleReason::Complete => {
                tracing::info!(%track_type, period_id, "Period fully buffered.");
                StreamEvent::StreamComplete {
                    track_type,
                    period_id,
                }
            }
            IdleReason::NeedsRefresh(last_position) => {
                tracing::debug!(%track_type, period_id, last_position, "Segment index exhausted.");
                StreamEvent::NeedsManifestRefresh {
                    track_type,
                    period_id,
                }
            }
        };
        let _ = self.events.send(event);
    }

    async fn fetch(&self, segment: &Segment) -> TsumugiResult<(Bytes, Duration)> {
        let backoff = self.config.backoff();
        try_with_backoff(
            || {
                let fetcher = self.fetcher.clone();
                let segment = segment.clone();
                async move {
                    let started = Instant::now();
                    let data = fetcher.fetch(&segment).await?;
                    Ok((data, started.elapsed()))
                }
            },
            &backoff,
            |error| {
                tracing::warn!(
                    track_type = %self.track_type,
                    segment = %segment.id,
                    "Processing segment failed, retry later. {error}"
                );
                let _ = self.events.send(StreamEvent::Warning {
                    track_type: Some(self.track_type),
                    error: error.detached(),
                });
            },
        )
        .await
    }

    async fn push(&self, segment: Segment, data: Bytes) -> TsumugiResult<()> {
        let range = segment.time_range();
        let chunk = SinkChunk {
            data,
            segment: segment.clone(),
            mime_type: self.adaptation.mime_type.clone(),
            codecs: self.adaptation.codecs.clone(),
            range,
        };
        self.sink.sink().append(chunk).await?;

        if let Some(range) = range {
            self.sink.bookkeeper().insert(
                range,
                SegmentRef {
                    segment: segment.clone(),
                    period_id: self.period.id.clone(),
                    adaptation_id: self.adaptation.id.clone(),
                    representation_id: self.representation.id.clone(),
                    bitrate: self.representation.bitrate,
                },
            );
        }

        tracing::debug!(
            track_type = %self.track_type,
            representation_id = %self.representation.id,
            segment = %segment.id,
            "Segment pushed."
        );
        let _ = self.events.send(StreamEvent::SegmentPushed {
            track_type: self.track_type,
            period_id: self.period.id.clone(),
            representation_id: self.representation.id.clone(),
            segment,
            range,
        });
        Ok(())
    }
}

/// Control over a spawned [`RepresentationStream`]. Dropping it kills the loop.
pub struct LoopHandle {
    representation: Arc<Representation>,
    kill: CancellationToken,
    terminate: CancellationToken,
    state: watch::Receiver<LoopState>,
    task: JoinHandle<TsumugiResult<()>>,
    finished: bool,
}

impl LoopHandle {
    pub fn representation(&self) -> &Arc<Representation> {
        &self.representation
    }

    /// Stop at once, dropping any in-flight download or push.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Stop once the in-flight segment is pushed.
    pub fn terminate(&self) {
        self.terminate.cancel();
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }

    /// Wait for the loop to stop. Returns immediately once it has been observed stopped.
    pub async fn wait(&mut self) -> TsumugiResult<()> {
        if self.finished {
            return Ok(());
        }
        let result = (&mut self.task).await;
        self.finished = true;
        result?
    }
}

impl Drop for LoopHandle {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}
