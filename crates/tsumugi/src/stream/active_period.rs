use std::{collections::HashMap, sync::Arc};

use crate::{
    events::StreamEvent,
    manifest::{Period, TrackType},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackStatus {
    /// An adaptation is chosen, its representation is not yet known.
    Pending,
    Ready,
}

#[derive(Debug)]
struct TrackedPeriod {
    period: Arc<Period>,
    tracks: HashMap<TrackType, TrackStatus>,
}

/// Finds the first period whose every required track type has settled on its tracks.
///
/// A track type has settled once its adaptation is chosen and, unless no adaptation is
/// wanted, a representation is chosen too.
#[derive(Debug)]
pub struct ActivePeriodTracker {
    required: Vec<TrackType>,
    /// Ordered by period start.
    periods: Vec<TrackedPeriod>,
    active: Option<String>,
}

impl ActivePeriodTracker {
    pub fn new(required: impl IntoIterator<Item = TrackType>) -> Self {
        Self {
            required: required.into_iter().collect(),
            periods: Vec::new(),
            active: None,
        }
    }

    pub fn active(&self) -> Option<&Arc<Period>> {
        let id = self.active.as_ref()?;
        self.periods
            .iter()
            .find(|p| &p.period.id == id)
            .map(|p| &p.period)
    }

    /// Feed an event; returns the new active period when it changed.
    pub fn on_event(&mut self, event: &StreamEvent) -> Option<Arc<Period>> {
        match event {
            StreamEvent::AdaptationChanged {
                track_type,
                period,
                adaptation,
            } => {
                let status = match adaptation {
                    Some(_) => TrackStatus::Pending,
                    None => TrackStatus::Ready,
                };
                self.tracked(period).tracks.insert(*track_type, status);
            }
            StreamEvent::RepresentationChanged {
                track_type, period, ..
            } => {
                self.tracked(period)
                    .tracks
                    .insert(*track_type, TrackStatus::Ready);
            }
            StreamEvent::PeriodCleared {
                track_type,
                period_id,
            } => {
                if let Some(index) = self.periods.iter().position(|p| &p.period.id == period_id) {
                    let tracked = &mut self.periods[index];
                    tracked.tracks.remove(track_type);
                    if tracked.tracks.is_empty() {
                        self.periods.remove(index);
                    }
                }
            }
            _ => return None,
        }
        self.update()
    }

    fn tracked(&mut self, period: &Arc<Period>) -> &mut TrackedPeriod {
        let index = match self.periods.iter().position(|p| p.period.id == period.id) {
            Some(index) => index,
            None => {
                let index = self
                    .periods
                    .partition_point(|p| p.period.start <= period.start);
                self.periods.insert(
                    index,
                    TrackedPeriod {
                        period: period.clone(),
                        tracks: HashMap::new(),
                    },
                );
                index
            }
        };
        &mut self.periods[index]
    }

    fn update(&mut self) -> Option<Arc<Period>> {
        let first = self.periods.iter().find(|tracked| {
            self.required
                .iter()
                .all(|t| tracked.tracks.get(t) == Some(&TrackStatus::Ready))
        })?;
        if self.active.as_ref() == Some(&first.period.id) {
            return None;
        }
        let period = first.period.clone();
        tracing::info!(period_id = %period.id, "Active period changed.");
        self.active = Some(period.id.clone());
        Some(period)
    }
}
