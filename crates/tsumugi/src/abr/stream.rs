use std::sync::Arc;

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use super::{
    bandwidth::{self, SampleReceiver, SharedBandwidth},
    AbrSettingsReceiver, Estimate, EstimatorInput, QualityEstimator,
};
use crate::{clock::ClockReceiver, manifest::Representation};

pub type EstimateReceiver = mpsc::UnboundedReceiver<Estimate>;

/// Runs a [`QualityEstimator`] for one adaptation.
///
/// Estimates are re-evaluated on clock ticks, throughput samples and settings changes.
/// Only estimates differing from the previously emitted one are sent. The task stops
/// when the receiver is dropped or the clock goes away.
pub struct EstimateStream<G> {
    pub(crate) estimator: QualityEstimator,
    pub(crate) clock: ClockReceiver,
    pub(crate) settings: AbrSettingsReceiver,
    pub(crate) samples: SampleReceiver,
    pub(crate) bandwidth: SharedBandwidth,
    /// Representation of the live fetch loop.
    pub(crate) current: watch::Receiver<Option<Arc<Representation>>>,
    /// Seconds buffered ahead of a position.
    pub(crate) buffer_gap: G,
}

impl<G> EstimateStream<G>
where
    G: Fn(f64) -> f64 + Send + 'static,
{
    pub fn spawn(self) -> (EstimateReceiver, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(self.run(sender));
        (receiver, handle)
    }

    async fn run(mut self, sender: mpsc::UnboundedSender<Estimate>) {
        let mut last: Option<(String, Option<u64>, super::EstimateKind)> = None;
        let mut settings_open = true;
        let mut samples_open = true;

        loop {
            if let Some(estimate) = self.evaluate() {
                let key = (
                    estimate.representation.id.clone(),
                    estimate.bitrate,
                    estimate.kind,
                );
                if last.as_ref() != Some(&key) {
                    last = Some(key);
                    if sender.send(estimate).is_err() {
                        break;
                    }
                }
            }

            tokio::select! {
                _ = sender.closed() => break,
                changed = self.clock.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = self.settings.changed(), if settings_open => {
                    settings_open = changed.is_ok();
                }
                sample = self.samples.recv(), if samples_open => match sample {
                    Some(sample) => bandwidth::lock(&self.bandwidth).push_sample(sample),
                    None => samples_open = false,
                },
            }
        }
    }

    fn evaluate(&mut self) -> Option<Estimate> {
        let position = self.clock.borrow_and_update().current_time;
        let buffer_gap = (self.buffer_gap)(position);
        let bandwidth = bandwidth::lock(&self.bandwidth).estimate();
        let current = self.current.borrow().clone();
        let settings = self.settings.borrow_and_update().clone();

        self.estimator.estimate(EstimatorInput {
            bandwidth,
            buffer_gap,
            current: current.as_deref(),
            settings: &settings,
        })
    }
}
