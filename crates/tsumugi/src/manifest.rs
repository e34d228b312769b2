use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    sync::{Arc, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};

use crate::{segment::SegmentIndex, util::range::TimeRange, TsumugiResult};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TrackType {
    Audio,
    #[default]
    Video,
    Text,
    Image,
}

impl TrackType {
    pub const ALL: [TrackType; 4] = [Self::Audio, Self::Video, Self::Text, Self::Image];

    /// Playback cannot continue without an essential track.
    pub fn is_essential(&self) -> bool {
        matches!(self, Self::Audio | Self::Video)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Text => "text",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One quality level of an adaptation.
#[derive(Debug)]
pub struct Representation {
    pub id: String,
    /// Bits per second.
    pub bitrate: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Representations the platform cannot decode are never offered to the estimator.
    pub is_supported: bool,
    pub index: Arc<dyn SegmentIndex>,
}

impl Representation {
    pub fn new(id: impl Into<String>, bitrate: u64, index: Arc<dyn SegmentIndex>) -> Self {
        Self {
            id: id.into(),
            bitrate,
            width: None,
            height: None,
            is_supported: true,
            index,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn unsupported(mut self) -> Self {
        self.is_supported = false;
        self
    }
}

/// A selectable track, e.g. one language of audio.
#[derive(Debug)]
pub struct Adaptation {
    pub id: String,
    pub track_type: TrackType,
    pub language: Option<String>,
    pub mime_type: String,
    pub codecs: String,
    pub representations: Vec<Arc<Representation>>,
}

impl Adaptation {
    pub fn new(
        id: impl Into<String>,
        track_type: TrackType,
        mime_type: impl Into<String>,
        codecs: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            track_type,
            language: None,
            mime_type: mime_type.into(),
            codecs: codecs.into(),
            representations: Vec::new(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_representation(mut self, representation: Representation) -> Self {
        self.representations.push(Arc::new(representation));
        self
    }

    /// Supported representations, sorted by ascending bitrate.
    pub fn playable_representations(&self) -> Vec<Arc<Representation>> {
        let mut representations: Vec<_> = self
            .representations
            .iter()
            .filter(|r| r.is_supported)
            .cloned()
            .collect();
        representations.sort_by_key(|r| r.bitrate);
        representations
    }

    pub fn is_playable(&self) -> bool {
        self.representations.iter().any(|r| r.is_supported)
    }

    pub fn find_representation(&self, id: &str) -> Option<&Arc<Representation>> {
        self.representations.iter().find(|r| r.id == id)
    }
}

/// Time range of content with its own set of tracks.
#[derive(Debug)]
pub struct Period {
    pub id: String,
    pub start: f64,
    /// Learnt from a later refresh for live periods, see [`Period::end`].
    end: RwLock<Option<f64>>,
    pub adaptations: BTreeMap<TrackType, Vec<Arc<Adaptation>>>,
}

impl Period {
    pub fn new(id: impl Into<String>, start: f64, end: Option<f64>) -> Self {
        Self {
            id: id.into(),
            start,
            end: RwLock::new(end),
            adaptations: BTreeMap::new(),
        }
    }

    pub fn with_adaptation(mut self, adaptation: Adaptation) -> Self {
        self.adaptations
            .entry(adaptation.track_type)
            .or_default()
            .push(Arc::new(adaptation));
        self
    }

    pub fn adaptations_for(&self, track_type: TrackType) -> &[Arc<Adaptation>] {
        self.adaptations
            .get(&track_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn find_adaptation(&self, track_type: TrackType, id: &str) -> Option<&Arc<Adaptation>> {
        self.adaptations_for(track_type).iter().find(|a| a.id == id)
    }

    /// End of the period, `None` while it is still growing.
    ///
    /// Refreshes update it in place, so streams holding this period see the new end.
    pub fn end(&self) -> Option<f64> {
        *self.end.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_end(&self, end: Option<f64>) {
        *self.end.write().unwrap_or_else(PoisonError::into_inner) = end;
    }

    pub fn end_or_infinity(&self) -> f64 {
        self.end().unwrap_or(f64::INFINITY)
    }

    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end_or_infinity())
    }

    pub fn contains(&self, time: f64) -> bool {
        self.time_range().contains(time)
    }
}

/// Root content description.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub is_live: bool,
    /// Ordered by `start`.
    pub periods: Vec<Arc<Period>>,
}

impl Manifest {
    pub fn new(is_live: bool, periods: Vec<Period>) -> Self {
        let mut periods: Vec<_> = periods.into_iter().map(Arc::new).collect();
        periods.sort_by(|a, b| a.start.total_cmp(&b.start));
        Self { is_live, periods }
    }

    pub fn period_at(&self, time: f64) -> Option<Arc<Period>> {
        self.periods.iter().rev().find(|p| p.contains(time)).cloned()
    }

    /// Period containing `time`, or the first period starting after it.
    pub fn period_from(&self, time: f64) -> Option<Arc<Period>> {
        self.period_at(time)
            .or_else(|| self.periods.iter().find(|p| p.start > time).cloned())
    }

    pub fn next_period(&self, period: &Period) -> Option<Arc<Period>> {
        let index = self.periods.iter().position(|p| p.id == period.id)?;
        self.periods.get(index + 1).cloned()
    }

    pub fn find_period(&self, id: &str) -> Option<Arc<Period>> {
        self.periods.iter().find(|p| p.id == id).cloned()
    }

    /// Merge a refreshed manifest into this one, matching periods by id.
    ///
    /// Known representations keep their identity and have their index updated in
    /// place, so running fetch loops observe new segments without being restarted.
    pub fn merge(&self, newer: Manifest) -> Manifest {
        let first_new_start = newer
            .periods
            .first()
            .map(|p| p.start)
            .unwrap_or(f64::INFINITY);

        let mut periods: Vec<Arc<Period>> = self
            .periods
            .iter()
            .filter(|old| {
                old.start < first_new_start && !newer.periods.iter().any(|p| p.id == old.id)
            })
            .cloned()
            .collect();

        for new_period in newer.periods {
            match self.find_period(&new_period.id) {
                Some(old_period) => periods.push(merge_period(&old_period, &new_period)),
                None => periods.push(new_period),
            }
        }
        periods.sort_by(|a, b| a.start.total_cmp(&b.start));

        Manifest {
            is_live: newer.is_live,
            periods,
        }
    }
}

fn merge_period(old: &Arc<Period>, new: &Period) -> Arc<Period> {
    let mut adaptations = old.adaptations.clone();
    for (track_type, new_adaptations) in &new.adaptations {
        let merged = adaptations.entry(*track_type).or_default();
        for new_adaptation in new_adaptations {
            let Some(old_adaptation) = merged.iter().find(|a| a.id == new_adaptation.id) else {
                merged.push(new_adaptation.clone());
                continue;
            };
            for new_representation in &new_adaptation.representations {
                if let Some(old_representation) =
                    old_adaptation.find_representation(&new_representation.id)
                {
                    old_representation
                        .index
                        .update(new_representation.index.as_ref());
                } else {
                    tracing::warn!(
                        period_id = %new.id,
                        representation_id = %new_representation.id,
                        "New representation appeared in a known adaptation, ignoring."
                    );
                }
            }
        }
    }

    let end = new.end();
    if old.end() != end {
        tracing::info!(period_id = %old.id, ?end, "Period end updated.");
        old.set_end(end);
    }

    if adaptations.len() == old.adaptations.len() {
        let unchanged = adaptations
            .iter()
            .all(|(t, a)| old.adaptations.get(t).map(Vec::len) == Some(a.len()));
        if unchanged {
            return old.clone();
        }
    }

    Arc::new(Period {
        id: old.id.clone(),
        start: old.start,
        end: RwLock::new(end),
        adaptations,
    })
}

/// Produces fresh manifests for live refreshes. Parsing happens behind this seam.
pub trait ManifestLoader: Send + Sync + 'static {
    fn load(&self) -> impl Future<Output = TsumugiResult<Manifest>> + Send;
}
