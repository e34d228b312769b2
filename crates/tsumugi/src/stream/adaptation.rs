use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::representation::{LoopHandle, RepresentationStream};
use crate::{
    abr::{
        bandwidth::{SampleSender, SharedBandwidth},
        stream::{EstimateReceiver, EstimateStream},
        AbrSettingsReceiver, Estimate, QualityEstimator,
    },
    clock::ClockReceiver,
    config::{ManualBitrateSwitchingMode, StreamConfig},
    events::{EventSender, StreamEvent},
    fetch::SegmentFetcher,
    manifest::{Adaptation, Period, Representation, TrackType},
    sink::{BufferSink, SinkHandle},
    util::range,
    TsumugiError, TsumugiResult,
};

/// Drives the representation streams of one adaptation from the estimates of its
/// quality estimator.
///
/// A replaced stream is killed when the estimate is urgent and terminated otherwise.
/// Its replacement is only spawned once it has stopped.
pub struct AdaptationStream<F, S> {
    pub track_type: TrackType,
    pub period: Arc<Period>,
    pub adaptation: Arc<Adaptation>,
    pub fetcher: Arc<F>,
    pub sink: SinkHandle<S>,
    pub clock: ClockReceiver,
    pub config: Arc<StreamConfig>,
    pub events: EventSender,
    pub settings: AbrSettingsReceiver,
    pub bandwidth: SharedBandwidth,
}

enum Step {
    Estimate(Estimate),
    Stop,
    Stopped(TsumugiResult<()>),
}

enum SwitchOutcome {
    Stopped(TsumugiResult<()>),
    Estimate(Option<Estimate>),
    Cancelled,
}

async fn wait_active(active: &mut Option<LoopHandle>) -> TsumugiResult<()> {
    match active {
        Some(handle) => handle.wait().await,
        None => std::future::pending().await,
    }
}

impl<F, S> AdaptationStream<F, S>
where
    F: SegmentFetcher,
    S: BufferSink,
{
    /// Run until `cancel` fires, the clock goes away or a representation stream fails.
    pub async fn run(self, cancel: CancellationToken) -> TsumugiResult<()> {
        let representations = self.adaptation.playable_representations();
        if representations.is_empty() {
            return Err(TsumugiError::UnsupportedTrack {
                track_type: self.track_type,
                reason: format!(
                    "adaptation {} has no playable representation",
                    self.adaptation.id
                ),
            });
        }

        let (samples_tx, samples_rx) = mpsc::unbounded_channel();
        let (current_tx, current_rx) = watch::channel(None);
        let sink = self.sink.clone();
        let (mut estimates, estimator) = EstimateStream {
            estimator: QualityEstimator::new(
                self.track_type,
                self.config.abr.clone(),
                representations,
            ),
            clock: self.clock.clone(),
            settings: self.settings.clone(),
            samples: samples_rx,
            bandwidth: self.bandwidth.clone(),
            current: current_rx,
            buffer_gap: move |time: f64| range::buffer_gap(&sink.sink().buffered_ranges(), time),
        }
        .spawn();

        let mut active: Option<LoopHandle> = None;
        let result = self
            .drive(&mut estimates, &mut active, &current_tx, &samples_tx, &cancel)
            .await;

        if let Some(mut handle) = active.take() {
            handle.kill();
            handle.wait().await?;
        }
        drop(estimates);
        estimator.await?;
        result
    }

    async fn drive(
        &self,
        estimates: &mut EstimateReceiver,
        active: &mut Option<LoopHandle>,
        current: &watch::Sender<Option<Arc<Representation>>>,
        samples: &SampleSender,
        cancel: &CancellationToken,
    ) -> TsumugiResult<()> {
        let mut last_bitrate = None;
        let mut reload_requested = false;

        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Stop,
                estimate = estimates.recv() => match estimate {
                    Some(estimate) => Step::Estimate(estimate),
                    None => Step::Stop,
                },
                result = wait_active(active) => Step::Stopped(result),
            };

            let estimate = match step {
                Step::Estimate(estimate) => estimate,
                Step::Stop => return Ok(()),
                Step::Stopped(result) => {
                    // Streams only stop on their own on failure or once the clock is gone.
                    *active = None;
                    return result;
                }
            };

            self.forward_bitrate(&estimate, &mut last_bitrate);
            if reload_requested {
                continue;
            }
            let direct = estimate.is_manual()
                && self.config.manual_bitrate_switching_mode == ManualBitrateSwitchingMode::Direct;

            let Some(handle) = active.as_mut() else {
                if direct && self.holds_other_data(&estimate.representation) {
                    self.request_reload();
                    reload_requested = true;
                    continue;
                }
                self.emit_representation(&estimate.representation);
                *active = Some(self.start(estimate.representation.clone(), samples));
                current.send_replace(Some(estimate.representation));
                continue;
            };

            if handle.representation().id == estimate.representation.id {
                continue;
            }
            let previous = handle.representation().clone();

            if direct {
                handle.kill();
                handle.wait().await?;
                *active = None;
                current.send_replace(None);
                self.request_reload();
                reload_requested = true;
                continue;
            }

            tracing::info!(
                track_type = %self.track_type,
                from = %previous.id,
                to = %estimate.representation.id,
                urgent = estimate.is_urgent,
                "Switching representation."
            );
            if estimate.is_urgent {
                handle.kill();
            } else {
                handle.terminate();
            }

            let mut next = estimate;
            loop {
                let outcome = tokio::select! {
                    result = handle.wait() => SwitchOutcome::Stopped(result),
                    estimate = estimates.recv() => SwitchOutcome::Estimate(estimate),
                    _ = cancel.cancelled() => SwitchOutcome::Cancelled,
                };
                match outcome {
                    SwitchOutcome::Stopped(result) => {
                        result?;
                        break;
                    }
                    SwitchOutcome::Estimate(Some(estimate)) => {
                        self.forward_bitrate(&estimate, &mut last_bitrate);
                        if estimate.is_urgent {
                            handle.kill();
                        }
                        next = estimate;
                    }
                    SwitchOutcome::Estimate(None) | SwitchOutcome::Cancelled => return Ok(()),
                }
            }

            if next.representation.id != previous.id {
                self.emit_representation(&next.representation);
            }
            *active = Some(self.start(next.representation.clone(), samples));
            current.send_replace(Some(next.representation));
        }
    }

    fn start(&self, representation: Arc<Representation>, samples: &SampleSender) -> LoopHandle {
        RepresentationStream {
            track_type: self.track_type,
            period: self.period.clone(),
            adaptation: self.adaptation.clone(),
            representation,
            fetcher: self.fetcher.clone(),
            sink: self.sink.clone(),
            clock: self.clock.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            samples: samples.clone(),
        }
        .spawn()
    }

    /// Whether the sink holds data of this period from another representation.
    fn holds_other_data(&self, representation: &Representation) -> bool {
        self.sink
            .bookkeeper()
            .chunks_in(self.period.time_range())
            .any(|chunk| chunk.reference.representation_id != representation.id)
    }

    fn forward_bitrate(&self, estimate: &Estimate, last: &mut Option<Option<u64>>) {
        if *last == Some(estimate.bitrate) {
            return;
        }
        *last = Some(estimate.bitrate);
        let _ = self.events.send(StreamEvent::BitrateEstimateChanged {
            track_type: self.track_type,
            bitrate: estimate.bitrate,
        });
    }

    fn emit_representation(&self, representation: &Arc<Representation>) {
        tracing::info!(
            track_type = %self.track_type,
            period_id = %self.period.id,
            representation_id = %representation.id,
            bitrate = representation.bitrate,
            "Representation changed."
        );
        let _ = self.events.send(StreamEvent::RepresentationChanged {
            track_type: self.track_type,
            period: self.period.clone(),
            representation: Some(representation.clone()),
        });
    }

    fn request_reload(&self) {
        let position = self.clock.borrow().current_time;
        tracing::info!(track_type = %self.track_type, period_id = %self.period.id, position, "Manual switch needs a media source reload.");
        let _ = self.events.send(StreamEvent::NeedsMediaSourceReload {
            track_type: self.track_type,
            period_id: self.period.id.clone(),
            position,
        });
    }
}
