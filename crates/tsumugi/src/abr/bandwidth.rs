use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::sync::mpsc;

use crate::config::AbrConfig;

/// Measured download of one media segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    pub bytes: u64,
    pub duration: Duration,
}

impl ThroughputSample {
    pub fn new(bytes: u64, duration: Duration) -> Self {
        Self { bytes, duration }
    }
}

pub type SampleSender = mpsc::UnboundedSender<ThroughputSample>;
pub type SampleReceiver = mpsc::UnboundedReceiver<ThroughputSample>;

/// Bandwidth estimate in bits per second, built from a reactive and a stable average.
///
/// The estimate is the minimum of both averages so a sudden drop is followed at once
/// while a sudden rise needs to be confirmed over time.
#[derive(Debug, Clone)]
pub struct BandwidthEstimator {
    fast: Ewma,
    slow: Ewma,
    min_sample_bytes: u64,
}

impl BandwidthEstimator {
    const MIN_DURATION_MS: f64 = 0.5;

    pub fn new(config: &AbrConfig) -> Self {
        Self {
            fast: Ewma::new(config.fast_half_life),
            slow: Ewma::new(config.slow_half_life),
            min_sample_bytes: config.min_sample_bytes,
        }
    }

    pub fn push_sample(&mut self, sample: ThroughputSample) {
        if sample.bytes < self.min_sample_bytes {
            return;
        }

        let duration_ms = (sample.duration.as_secs_f64() * 1000.).max(Self::MIN_DURATION_MS);
        let bps = sample.bytes as f64 * 8000. / duration_ms;
        let weight = duration_ms / 1000.;

        self.fast.add_sample(weight, bps);
        self.slow.add_sample(weight, bps);
    }

    /// `None` until a large enough download has been measured.
    pub fn estimate(&self) -> Option<f64> {
        let estimate = self.fast.estimate().min(self.slow.estimate());
        (estimate > 0.).then_some(estimate)
    }
}

/// Estimator shared by every stream of one track type, so measurements survive
/// quality switches and period transitions.
pub type SharedBandwidth = Arc<Mutex<BandwidthEstimator>>;

pub fn shared(config: &AbrConfig) -> SharedBandwidth {
    Arc::new(Mutex::new(BandwidthEstimator::new(config)))
}

pub(crate) fn lock(bandwidth: &SharedBandwidth) -> MutexGuard<'_, BandwidthEstimator> {
    bandwidth.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct Ewma {
    alpha: f64,
    last_estimate: f64,
    total_weight: f64,
}

impl Ewma {
    fn new(half_life: f64) -> Self {
        Self {
            alpha: f64::exp(0.5_f64.ln() / half_life.max(0.001)),
            last_estimate: 0.,
            total_weight: 0.,
        }
    }

    fn add_sample(&mut self, weight: f64, value: f64) {
        let adjusted = self.alpha.powf(weight.max(0.));
        self.last_estimate = value * (1. - adjusted) + adjusted * self.last_estimate;
        self.total_weight += weight.max(0.);
    }

    fn estimate(&self) -> f64 {
        if self.total_weight <= 0. {
            return 0.;
        }
        // Early samples are biased towards the initial zero.
        let zero_factor = 1. - self.alpha.powf(self.total_weight);
        self.last_estimate / zero_factor.max(1e-6)
    }
}
