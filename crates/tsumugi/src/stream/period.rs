use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{adaptation::AdaptationStream, gc};
use crate::{
    abr::{bandwidth::SharedBandwidth, AbrSettingsReceiver},
    clock::ClockReceiver,
    config::StreamConfig,
    events::{EventSender, StreamEvent},
    fetch::SegmentFetcher,
    manifest::{Adaptation, Period, TrackType},
    sink::{BufferSink, SinkFactory, SinkHandle, SinkStore},
    util::range::{self, TimeRange},
    TsumugiError, TsumugiResult,
};

/// How buffered data is handled when the adaptation of a period changes.
#[derive(Debug, Clone, PartialEq)]
pub enum SwitchStrategy {
    /// Buffered data can stay.
    NoOp,
    /// These ranges hold data of another adaptation and must be removed first.
    CleanBuffer(Vec<TimeRange>),
    /// The sink can not take the new adaptation's data.
    NeedsReload,
}

pub fn switch_strategy<S: BufferSink>(
    sink: &SinkHandle<S>,
    period: &Period,
    adaptation: &Adaptation,
) -> SwitchStrategy {
    if !sink
        .sink()
        .is_compatible(&adaptation.mime_type, &adaptation.codecs)
    {
        return SwitchStrategy::NeedsReload;
    }

    let period_range = period.time_range();
    let bookkeeper = sink.bookkeeper();
    let ranges = bookkeeper
        .chunks_in(period_range)
        .filter(|chunk| {
            chunk.reference.period_id == period.id
                && chunk.reference.adaptation_id != adaptation.id
        })
        .filter_map(|chunk| chunk.range.intersection(&period_range))
        .fold(Vec::new(), |ranges, added| range::union(&ranges, &added, 0.));

    if ranges.is_empty() {
        SwitchStrategy::NoOp
    } else {
        SwitchStrategy::CleanBuffer(ranges)
    }
}

enum Outcome {
    ChoiceChanged,
    Finished,
}

/// Manages the buffer of one track type during one period.
///
/// Follows the adaptation chosen for the period, preparing the sink for it and running
/// an [`AdaptationStream`] alongside the garbage collector. Failures of non-essential
/// track types are turned into a warning and the track is dropped.
pub struct PeriodStream<F, K: SinkFactory> {
    pub track_type: TrackType,
    pub period: Arc<Period>,
    pub fetcher: Arc<F>,
    pub sinks: Arc<SinkStore<K>>,
    pub clock: ClockReceiver,
    pub config: Arc<StreamConfig>,
    pub events: EventSender,
    pub settings: AbrSettingsReceiver,
    pub bandwidth: SharedBandwidth,
    pub choice: watch::Receiver<Option<Arc<Adaptation>>>,
}

impl<F, K> PeriodStream<F, K>
where
    F: SegmentFetcher,
    K: SinkFactory,
{
    pub async fn run(mut self, cancel: CancellationToken) -> TsumugiResult<()> {
        loop {
            let choice = self.choice.borrow_and_update().clone();
            let outcome = match choice {
                None => self.disable(&cancel).await?,
                Some(adaptation) => match self.run_adaptation(adaptation, &cancel).await {
                    Ok(outcome) => outcome,
                    Err(e) if !self.track_type.is_essential() => {
                        self.drop_track(e);
                        self.placeholder(&cancel).await
                    }
                    Err(e) => return Err(e),
                },
            };
            if let Outcome::Finished = outcome {
                return Ok(());
            }
        }
    }

    async fn disable(&mut self, cancel: &CancellationToken) -> TsumugiResult<Outcome> {
        if let Some(handle) = self.sinks.get(self.track_type) {
            handle
                .remove(self.period.start, self.period.end_or_infinity())
                .await?;
        }
        tracing::info!(track_type = %self.track_type, period_id = %self.period.id, "Track disabled.");
        let _ = self.events.send(StreamEvent::AdaptationChanged {
            track_type: self.track_type,
            period: self.period.clone(),
            adaptation: None,
        });
        Ok(self.placeholder(cancel).await)
    }

    async fn run_adaptation(
        &mut self,
        adaptation: Arc<Adaptation>,
        cancel: &CancellationToken,
    ) -> TsumugiResult<Outcome> {
        let track_type = self.track_type;
        let mut handle =
            self.sinks
                .get_or_create(track_type, &adaptation.mime_type, &adaptation.codecs)?;

        let strategy = switch_strategy(&handle, &self.period, &adaptation);
        tracing::debug!(%track_type, period_id = %self.period.id, adaptation_id = %adaptation.id, ?strategy, "Switching adaptation.");
        match strategy {
            SwitchStrategy::NoOp => {}
            SwitchStrategy::CleanBuffer(ranges) => {
                for range in ranges {
                    handle.remove(range.start, range.end).await?;
                }
            }
            SwitchStrategy::NeedsReload if handle.sink().buffered_ranges().is_empty() => {
                self.sinks.dispose(track_type);
                handle =
                    self.sinks
                        .get_or_create(track_type, &adaptation.mime_type, &adaptation.codecs)?;
            }
            SwitchStrategy::NeedsReload => {
                let position = self.clock.borrow().current_time;
                let _ = self.events.send(StreamEvent::NeedsMediaSourceReload {
                    track_type,
                    period_id: self.period.id.clone(),
                    position,
                });
                return Ok(self.placeholder(cancel).await);
            }
        }

        tracing::info!(%track_type, period_id = %self.period.id, adaptation_id = %adaptation.id, "Adaptation changed.");
        let _ = self.events.send(StreamEvent::AdaptationChanged {
            track_type,
            period: self.period.clone(),
            adaptation: Some(adaptation.clone()),
        });

        let controller_cancel = cancel.child_token();
        let controller = AdaptationStream {
            track_type,
            period: self.period.clone(),
            adaptation,
            fetcher: self.fetcher.clone(),
            sink: handle.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            settings: self.settings.clone(),
            bandwidth: self.bandwidth.clone(),
        }
        .run(controller_cancel.clone());
        let gc = gc::collect_garbage(
            handle,
            self.clock.clone(),
            self.config.max_buffer_behind,
            self.config.max_buffer_ahead,
            Duration::from_secs_f64(self.config.gc_interval),
        );
        tokio::pin!(controller);
        tokio::pin!(gc);

        let mut choice_changed = false;
        let mut choice_open = true;
        let mut gc_done = false;
        loop {
            tokio::select! {
                result = &mut controller => {
                    result?;
                    return Ok(if choice_changed {
                        Outcome::ChoiceChanged
                    } else {
                        Outcome::Finished
                    });
                }
                result = &mut gc, if !gc_done => {
                    gc_done = true;
                    result?;
                }
                changed = self.choice.changed(), if choice_open && !choice_changed => {
                    if changed.is_ok() {
                        choice_changed = true;
                        controller_cancel.cancel();
                    } else {
                        choice_open = false;
                    }
                }
            }
        }
    }

    /// Follow the clock without fetching anything until the choice changes.
    async fn placeholder(&mut self, cancel: &CancellationToken) -> Outcome {
        let mut clock = self.clock.clone();
        let mut choice_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Outcome::Finished,
                changed = clock.changed() => {
                    if changed.is_err() {
                        return Outcome::Finished;
                    }
                }
                changed = self.choice.changed(), if choice_open => {
                    if changed.is_ok() {
                        return Outcome::ChoiceChanged;
                    }
                    choice_open = false;
                }
            }
        }
    }

    fn drop_track(&self, error: TsumugiError) {
        tracing::warn!(track_type = %self.track_type, period_id = %self.period.id, "Track failed, continuing without it. {error}");
        self.sinks.dispose(self.track_type);
        let _ = self.events.send(StreamEvent::Warning {
            track_type: Some(self.track_type),
            error,
        });
    }
}
