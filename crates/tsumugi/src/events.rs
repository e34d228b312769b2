use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    manifest::{Adaptation, Period, Representation, TrackType},
    segment::Segment,
    util::range::TimeRange,
    TsumugiError,
};

/// Everything the engine reports to the surrounding player.
#[derive(Debug)]
pub enum StreamEvent {
    AdaptationChanged {
        track_type: TrackType,
        period: Arc<Period>,
        /// `None` when no track of this type is wanted.
        adaptation: Option<Arc<Adaptation>>,
    },
    RepresentationChanged {
        track_type: TrackType,
        period: Arc<Period>,
        representation: Option<Arc<Representation>>,
    },
    BitrateEstimateChanged {
        track_type: TrackType,
        bitrate: Option<u64>,
    },
    SegmentPushed {
        track_type: TrackType,
        period_id: String,
        representation_id: String,
        segment: Segment,
        /// `None` for initialization segments.
        range: Option<TimeRange>,
    },
    /// Everything up to the wanted buffer horizon is buffered.
    BufferFull {
        track_type: TrackType,
        period_id: String,
    },
    /// The period is buffered up to its end.
    StreamComplete {
        track_type: TrackType,
        period_id: String,
    },
    NeedsMediaSourceReload {
        track_type: TrackType,
        period_id: String,
        position: f64,
    },
    NeedsManifestRefresh {
        track_type: TrackType,
        period_id: String,
    },
    Warning {
        track_type: Option<TrackType>,
        error: TsumugiError,
    },
    PeriodCleared {
        track_type: TrackType,
        period_id: String,
    },
    ActivePeriodChanged {
        period: Arc<Period>,
    },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AdaptationChanged { .. } => "adaptation-changed",
            Self::RepresentationChanged { .. } => "representation-changed",
            Self::BitrateEstimateChanged { .. } => "bitrate-estimate-changed",
            Self::SegmentPushed { .. } => "segment-pushed",
            Self::BufferFull { .. } => "buffer-full",
            Self::StreamComplete { .. } => "stream-complete",
            Self::NeedsMediaSourceReload { .. } => "needs-media-source-reload",
            Self::NeedsManifestRefresh { .. } => "needs-manifest-refresh",
            Self::Warning { .. } => "warning",
            Self::PeriodCleared { .. } => "period-cleared",
            Self::ActivePeriodChanged { .. } => "active-period-changed",
        }
    }

    pub fn track_type(&self) -> Option<TrackType> {
        match self {
            Self::AdaptationChanged { track_type, .. }
            | Self::RepresentationChanged { track_type, .. }
            | Self::BitrateEstimateChanged { track_type, .. }
            | Self::SegmentPushed { track_type, .. }
            | Self::BufferFull { track_type, .. }
            | Self::StreamComplete { track_type, .. }
            | Self::NeedsMediaSourceReload { track_type, .. }
            | Self::NeedsManifestRefresh { track_type, .. }
            | Self::PeriodCleared { track_type, .. } => Some(*track_type),
            Self::Warning { track_type, .. } => *track_type,
            Self::ActivePeriodChanged { .. } => None,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<StreamEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<StreamEvent>;
