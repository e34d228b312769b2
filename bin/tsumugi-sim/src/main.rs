mod fetcher;

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tsumugi::{
    abr::ManualSelection,
    clock::{clock, ClockTick},
    config::StreamConfig,
    events::{EventReceiver, StreamEvent},
    manifest::{Adaptation, Manifest, Period, Representation, TrackType},
    segment::SegmentListIndex,
    sink::{memory::MemorySinkFactory, BufferSink},
    util::range::buffer_gap,
    Orchestrator,
};
use url::Url;

use crate::fetcher::SimulatedFetcher;

/// Video ladder of every simulated period: (bitrate, width, height).
const LADDER: [(u64, u32, u32); 4] = [
    (400_000, 640, 360),
    (1_200_000, 1280, 720),
    (3_000_000, 1920, 1080),
    (6_000_000, 3840, 2160),
];
const AUDIO_BITRATE: u64 = 128_000;
const TICK: Duration = Duration::from_millis(250);

#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
pub struct SimArgs {
    /// Content duration in seconds
    #[clap(long, default_value = "120")]
    duration: f64,

    /// Number of periods the content is split into
    #[clap(long, default_value = "2")]
    periods: u32,

    /// Segment duration in seconds
    #[clap(long, default_value = "4")]
    segment_duration: f64,

    /// Network bandwidth in kbps, one value per 10 seconds, cycled
    #[clap(long, value_delimiter = ',', default_value = "4000,1500,800,6000")]
    bandwidth: Vec<u64>,

    /// Probability for a segment request to fail
    #[clap(long, default_value = "0.02")]
    failure_rate: f64,

    /// Playback speed
    #[clap(long, default_value = "1")]
    speed: f64,

    /// Seconds of content to keep buffered ahead
    #[clap(long)]
    buffer_ahead: Option<f64>,

    /// Stream configuration file (JSON)
    #[clap(long, env = "TSUMUGI_CONFIG")]
    config: Option<PathBuf>,

    /// Force the highest video quality under this bitrate
    #[clap(long)]
    manual_bitrate: Option<u64>,

    /// Maximum video width
    #[clap(long)]
    limit_width: Option<u32>,

    /// Debug output
    #[clap(long, alias = "debug")]
    verbose: bool,
}

impl SimArgs {
    fn stream_config(&self) -> anyhow::Result<StreamConfig> {
        let mut config = match &self.config {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => StreamConfig::default(),
        };
        if let Some(seconds) = self.buffer_ahead {
            config = config.wanted_buffer_ahead(seconds);
        }
        if self.limit_width.is_some() {
            config = config.limit_width(self.limit_width);
        }
        Ok(config)
    }

    fn manifest(&self, fetcher: &SimulatedFetcher) -> anyhow::Result<Manifest> {
        let base = Url::parse("https://sim.invalid/")?;
        let count = self.periods.max(1);
        let length = self.duration / count as f64;

        let mut periods = Vec::new();
        for n in 0..count {
            let id = format!("p{n}");
            let start = length * n as f64;
            let end = start + length;

            let mut video = Adaptation::new("video", TrackType::Video, "video/mp4", "avc1.640028");
            for (bitrate, width, height) in LADDER {
                let prefix = format!("{id}-v{bitrate}");
                let index =
                    SegmentListIndex::uniform(&base, &prefix, start, end, self.segment_duration, true)?;
                fetcher.register(&prefix, bitrate);
                video = video.with_representation(
                    Representation::new(format!("v{bitrate}"), bitrate, Arc::new(index))
                        .with_dimensions(width, height),
                );
            }

            let prefix = format!("{id}-a");
            let index =
                SegmentListIndex::uniform(&base, &prefix, start, end, self.segment_duration, true)?;
            fetcher.register(&prefix, AUDIO_BITRATE);
            let audio = Adaptation::new("audio", TrackType::Audio, "audio/mp4", "mp4a.40.2")
                .with_language("en")
                .with_representation(Representation::new("a", AUDIO_BITRATE, Arc::new(index)));

            periods.push(
                Period::new(id, start, Some(end))
                    .with_adaptation(video)
                    .with_adaptation(audio),
            );
        }
        Ok(Manifest::new(false, periods))
    }
}

async fn log_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match &event {
            StreamEvent::RepresentationChanged {
                track_type,
                period,
                representation: Some(representation),
            } => tracing::info!(
                %track_type,
                period_id = %period.id,
                representation_id = %representation.id,
                bitrate = representation.bitrate,
                "Quality changed."
            ),
            StreamEvent::ActivePeriodChanged { period } => {
                tracing::info!(period_id = %period.id, start = period.start, "Now playing.")
            }
            StreamEvent::Warning { track_type, error } => {
                tracing::warn!(?track_type, "{error}")
            }
            StreamEvent::BitrateEstimateChanged {
                track_type: TrackType::Video,
                bitrate: Some(bitrate),
            } => tracing::debug!(kbps = bitrate / 1000, "Bandwidth estimate."),
            event => tracing::trace!(event = event.name(), track_type = ?event.track_type()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = SimArgs::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let fetcher = SimulatedFetcher::new(args.bandwidth.clone(), args.failure_rate);
    let manifest = args.manifest(&fetcher)?;
    let orchestrator = Orchestrator::new(
        manifest,
        fetcher,
        MemorySinkFactory::default(),
        args.stream_config()?,
    )?
    .track_types([TrackType::Video, TrackType::Audio]);
    let controls = orchestrator.controls();
    let sinks = orchestrator.sinks();
    if let Some(bitrate) = args.manual_bitrate {
        controls.set_manual_quality(TrackType::Video, Some(ManualSelection::Bitrate(bitrate)));
    }

    let (clock_tx, clock_rx) = clock(ClockTick::at(0.));
    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let logger = tokio::spawn(log_events(events_rx));
    let engine = tokio::spawn(orchestrator.run(clock_rx, events_tx));

    let mut interval = tokio::time::interval(TICK);
    let mut position = 0.;
    let mut stalled = false;
    while position < args.duration {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted.");
                controls.shutdown();
                break;
            }
        }

        let gap = sinks
            .get(TrackType::Video)
            .map(|handle| buffer_gap(&handle.sink().buffered_ranges(), position))
            .unwrap_or(0.);
        if engine.is_finished() {
            break;
        }

        let can_play = gap > 0.1 || position + gap >= args.duration - 0.1;
        if stalled == can_play {
            stalled = !can_play;
            tracing::info!(position, stalled, "Playback state changed.");
        }
        if can_play {
            position = (position + TICK.as_secs_f64() * args.speed).min(args.duration);
        }
        clock_tx.send_replace(ClockTick {
            duration: Some(args.duration),
            is_paused: stalled,
            ready_state: if stalled { 2 } else { 4 },
            speed: args.speed,
            ..ClockTick::at(position)
        });
    }

    tracing::info!(position, "Playback finished.");
    drop(clock_tx);
    engine.await??;
    logger.await?;
    Ok(())
}
