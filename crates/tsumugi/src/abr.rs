//! Quality selection.
//!
//! [`QualityEstimator`] turns bandwidth measurements, the buffer level and the
//! user's constraints into [`Estimate`]s. [`stream::EstimateStream`] runs it as a
//! task for one adaptation, re-evaluating on every clock tick, throughput sample and
//! settings change.

pub mod bandwidth;
pub mod stream;

use std::{collections::HashMap, sync::Arc};

use tokio::sync::watch;

use crate::{
    config::{AbrConfig, ManualUrgency},
    manifest::{Representation, TrackType},
};

/// Quality forced by the user for one track type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualSelection {
    Representation(String),
    /// Highest representation whose bitrate does not exceed this one.
    Bitrate(u64),
}

/// Runtime constraints on quality selection, shared by all streams.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AbrSettings {
    pub manual: HashMap<TrackType, ManualSelection>,
    pub limit_width: Option<u32>,
    pub throttle_bitrate: Option<u64>,
}

pub type AbrSettingsSender = watch::Sender<AbrSettings>;
pub type AbrSettingsReceiver = watch::Receiver<AbrSettings>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateKind {
    Auto,
    Manual,
}

#[derive(Debug, Clone)]
pub struct Estimate {
    pub representation: Arc<Representation>,
    /// Estimated bandwidth in bits per second, `None` before the first measurement.
    pub bitrate: Option<u64>,
    /// The active download must be abandoned at once.
    pub is_urgent: bool,
    pub kind: EstimateKind,
}

impl Estimate {
    pub fn is_manual(&self) -> bool {
        self.kind == EstimateKind::Manual
    }
}

/// Greatest representation whose bitrate is at most `target`.
///
/// `representations` must be sorted by ascending bitrate. Returns `None` when even the
/// lowest one is above `target`.
pub fn ceiling_match(
    representations: &[Arc<Representation>],
    target: f64,
) -> Option<&Arc<Representation>> {
    let index = representations.partition_point(|r| r.bitrate as f64 <= target);
    index.checked_sub(1).map(|i| &representations[i])
}

/// Apply width and bitrate caps, falling back to the whole set when nothing is left.
pub fn filter_representations(
    track_type: TrackType,
    representations: &[Arc<Representation>],
    limit_width: Option<u32>,
    throttle_bitrate: Option<u64>,
) -> Vec<Arc<Representation>> {
    let filtered: Vec<_> = representations
        .iter()
        .filter(|r| match (track_type, limit_width, r.width) {
            (TrackType::Video, Some(limit), Some(width)) => width <= limit,
            _ => true,
        })
        .filter(|r| throttle_bitrate.map_or(true, |max| r.bitrate <= max))
        .cloned()
        .collect();

    if filtered.is_empty() {
        tracing::debug!(%track_type, ?limit_width, ?throttle_bitrate, "Quality filters ignored, no representation left.");
        representations.to_vec()
    } else {
        filtered
    }
}

/// What the estimator knows at the time of an evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EstimatorInput<'a> {
    /// Bandwidth estimate in bits per second.
    pub bandwidth: Option<f64>,
    /// Seconds buffered ahead of the playback position.
    pub buffer_gap: f64,
    /// Representation of the live fetch loop.
    pub current: Option<&'a Representation>,
    pub settings: &'a AbrSettings,
}

/// Picks a representation of one adaptation.
#[derive(Debug)]
pub struct QualityEstimator {
    track_type: TrackType,
    config: AbrConfig,
    representations: Vec<Arc<Representation>>,
    last: Option<Arc<Representation>>,
}

impl QualityEstimator {
    /// `representations` are the playable ones, sorted by ascending bitrate.
    pub fn new(
        track_type: TrackType,
        config: AbrConfig,
        representations: Vec<Arc<Representation>>,
    ) -> Self {
        Self {
            track_type,
            config,
            representations,
            last: None,
        }
    }

    pub fn representations(&self) -> &[Arc<Representation>] {
        &self.representations
    }

    /// Evaluate once. `None` means the previous estimate still holds.
    pub fn estimate(&mut self, input: EstimatorInput<'_>) -> Option<Estimate> {
        let lowest = self.representations.first()?.clone();
        let bitrate = input.bandwidth.map(|b| b.round() as u64);

        if let Some(manual) = input.settings.manual.get(&self.track_type) {
            if let Some(representation) = self.resolve_manual(manual) {
                let is_urgent = match self.config.manual_urgency {
                    ManualUrgency::FollowBitrateRule => self.is_urgent(&representation, &input),
                    ManualUrgency::AlwaysSlow => false,
                    ManualUrgency::AlwaysUrgent => true,
                };
                self.last = Some(representation.clone());
                return Some(Estimate {
                    representation,
                    bitrate,
                    is_urgent,
                    kind: EstimateKind::Manual,
                });
            }
            tracing::warn!(track_type = %self.track_type, ?manual, "Manual quality not found, using automatic selection.");
        }

        let candidates = filter_representations(
            self.track_type,
            &self.representations,
            input.settings.limit_width,
            input.settings.throttle_bitrate,
        );

        let chosen = match input.bandwidth {
            Some(bandwidth) => {
                let target = bandwidth * self.config.bandwidth_safety_factor;
                match ceiling_match(&candidates, target) {
                    Some(representation) => representation.clone(),
                    None if self.last.is_none() => candidates.first().cloned().unwrap_or(lowest),
                    None => return None,
                }
            }
            None if self.last.is_none() => candidates.first().cloned().unwrap_or(lowest),
            None => return None,
        };

        let is_urgent = self.is_urgent(&chosen, &input);
        self.last = Some(chosen.clone());
        Some(Estimate {
            representation: chosen,
            bitrate,
            is_urgent,
            kind: EstimateKind::Auto,
        })
    }

    fn resolve_manual(&self, manual: &ManualSelection) -> Option<Arc<Representation>> {
        match manual {
            ManualSelection::Representation(id) => {
                self.representations.iter().find(|r| &r.id == id).cloned()
            }
            ManualSelection::Bitrate(bitrate) => ceiling_match(&self.representations, *bitrate as f64)
                .or(self.representations.first())
                .cloned(),
        }
    }

    /// A switch is urgent when it drops steeply, or when the buffer is about to run dry.
    fn is_urgent(&self, next: &Representation, input: &EstimatorInput<'_>) -> bool {
        let Some(current) = input.current else {
            return false;
        };
        if next.id == current.id {
            return false;
        }
        let steep = next.bitrate < current.bitrate
            && (next.bitrate as f64) < current.bitrate as f64 * (1. - self.config.urgent_drop_ratio);
        steep || input.buffer_gap < self.config.low_buffer_threshold
    }
}
