use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tsumugi::{
    abr::{bandwidth, AbrSettings, AbrSettingsSender},
    clock::{clock, ClockSender, ClockTick},
    config::StreamConfig,
    events::{EventReceiver, StreamEvent},
    manifest::{Adaptation, Period, TrackType},
    sink::{memory::MemorySinkFactory, BufferSink, SinkStore},
    stream::period::PeriodStream,
    track::TrackSelector,
    util::range::TimeRange,
    TsumugiResult,
};

use crate::common::{self, TestFetcher};

/// English and French audio sharing a codec family, and Opus in another container.
fn period() -> Arc<Period> {
    Arc::new(
        Period::new("p1", 0., Some(60.))
            .with_adaptation(
                Adaptation::new("en", TrackType::Audio, "audio/mp4", "mp4a.40.2")
                    .with_language("en")
                    .with_representation(common::representation(
                        "p1", "aac-en", 128_000, 0., 60., true,
                    )),
            )
            .with_adaptation(
                Adaptation::new("fr", TrackType::Audio, "audio/mp4", "mp4a.40.5")
                    .with_language("fr")
                    .with_representation(common::representation(
                        "p1", "aac-fr", 128_000, 0., 60., true,
                    )),
            )
            .with_adaptation(
                Adaptation::new("opus", TrackType::Audio, "audio/webm", "opus")
                    .with_representation(common::representation(
                        "p1", "opus", 96_000, 0., 60., true,
                    )),
            ),
    )
}

struct Running {
    factory: MemorySinkFactory,
    sinks: Arc<SinkStore<MemorySinkFactory>>,
    tracks: TrackSelector,
    clock: ClockSender,
    events: EventReceiver,
    _settings: AbrSettingsSender,
    cancel: CancellationToken,
    task: JoinHandle<TsumugiResult<()>>,
}

impl Running {
    async fn stop(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.task.await??;
        Ok(())
    }
}

fn start(config: StreamConfig) -> Running {
    let period = period();
    let factory = MemorySinkFactory::default();
    let sinks = Arc::new(SinkStore::new(factory.clone()));
    let tracks = TrackSelector::new();
    let choice = tracks.subscribe(&period, TrackType::Audio);
    let (clock_tx, clock_rx) = clock(ClockTick::at(0.));
    let (events_tx, events) = mpsc::unbounded_channel();
    let (settings_tx, settings_rx) = watch::channel(AbrSettings::default());
    let cancel = CancellationToken::new();

    let task = tokio::spawn(
        PeriodStream {
            track_type: TrackType::Audio,
            period,
            fetcher: Arc::new(TestFetcher::new().delay(Duration::from_millis(100))),
            sinks: sinks.clone(),
            clock: clock_rx,
            config: Arc::new(config.clone()),
            events: events_tx,
            settings: settings_rx,
            bandwidth: bandwidth::shared(&config.abr),
            choice,
        }
        .run(cancel.clone()),
    );

    Running {
        factory,
        sinks,
        tracks,
        clock: clock_tx,
        events,
        _settings: settings_tx,
        cancel,
        task,
    }
}

fn adaptation_changed_to(event: &StreamEvent, id: Option<&str>) -> bool {
    matches!(
        event,
        StreamEvent::AdaptationChanged { adaptation, .. }
            if adaptation.as_ref().map(|a| a.id.as_str()) == id
    )
}

fn buffer_full(event: &StreamEvent) -> bool {
    matches!(event, StreamEvent::BufferFull { .. })
}

#[tokio::test(start_paused = true)]
async fn test_language_switch_cleans_buffer_first() -> anyhow::Result<()> {
    let mut running = start(StreamConfig::default().wanted_buffer_ahead(10.));
    common::wait_for(&mut running.events, buffer_full).await?;
    let sink = running.factory.sink(TrackType::Audio).unwrap();
    assert_eq!(sink.buffered_ranges(), vec![TimeRange::new(0., 10.)]);

    running.tracks.select("p1", TrackType::Audio, Some("fr"))?;
    common::wait_for(&mut running.events, |e| adaptation_changed_to(e, Some("fr"))).await?;
    assert!(sink.buffered_ranges().is_empty());

    let seen = common::collect_until(&mut running.events, |e| common::pushed_by(e, "aac-fr")).await?;
    assert!(!seen.iter().any(|e| common::pushed_by(e, "aac-en")));
    {
        let handle = running.sinks.get(TrackType::Audio).unwrap();
        let bookkeeper = handle.bookkeeper();
        assert!(bookkeeper.chunks().all(|c| c.reference.adaptation_id == "fr"));
    }
    // Same codec family, so the sink is kept.
    assert_eq!(running.factory.created(), 1);

    running.stop().await
}

#[tokio::test(start_paused = true)]
async fn test_disabling_track_clears_period() -> anyhow::Result<()> {
    let mut running = start(StreamConfig::default().wanted_buffer_ahead(10.));
    common::wait_for(&mut running.events, buffer_full).await?;

    running.tracks.select("p1", TrackType::Audio, None)?;
    common::wait_for(&mut running.events, |e| adaptation_changed_to(e, None)).await?;
    let sink = running.factory.sink(TrackType::Audio).unwrap();
    assert!(sink.buffered_ranges().is_empty());
    assert!(!sink.is_disposed());

    // The placeholder follows the clock without fetching.
    running.clock.send_replace(ClockTick::at(4.));
    tokio::time::sleep(Duration::from_secs(5)).await;
    let later = common::drain(&mut running.events);
    assert!(!later
        .iter()
        .any(|e| matches!(e, StreamEvent::SegmentPushed { .. })));
    assert!(sink.buffered_ranges().is_empty());

    running.stop().await
}

#[tokio::test(start_paused = true)]
async fn test_incompatible_switch_with_data_needs_reload() -> anyhow::Result<()> {
    let mut running = start(StreamConfig::default().wanted_buffer_ahead(10.));
    common::wait_for(&mut running.events, buffer_full).await?;

    running.tracks.select("p1", TrackType::Audio, Some("opus"))?;
    let event = common::wait_for(&mut running.events, |e| {
        matches!(e, StreamEvent::NeedsMediaSourceReload { .. })
    })
    .await?;
    assert!(matches!(
        event,
        StreamEvent::NeedsMediaSourceReload { track_type: TrackType::Audio, period_id, .. } if period_id == "p1"
    ));

    tokio::time::sleep(Duration::from_secs(5)).await;
    let later = common::drain(&mut running.events);
    assert!(!later.iter().any(|e| common::pushed_by(e, "opus")));
    // Nothing is torn down here; the reload is up to the player.
    let sink = running.factory.sink(TrackType::Audio).unwrap();
    assert_eq!(sink.buffered_ranges(), vec![TimeRange::new(0., 10.)]);
    assert_eq!(running.factory.created(), 1);

    running.stop().await
}

#[tokio::test(start_paused = true)]
async fn test_garbage_collector_keeps_seek_back_margin() -> anyhow::Result<()> {
    let config = StreamConfig::default()
        .wanted_buffer_ahead(10.)
        .max_buffer_behind(Some(0.));
    let mut running = start(config);
    common::wait_for(&mut running.events, buffer_full).await?;

    running.clock.send_replace(ClockTick::at(9.));
    common::wait_for(&mut running.events, buffer_full).await?;
    tokio::time::sleep(Duration::from_secs(3)).await;

    // One second behind 9 is 8, the start of the segment playing since 8.
    let sink = running.factory.sink(TrackType::Audio).unwrap();
    assert_eq!(sink.buffered_ranges(), vec![TimeRange::new(8., 20.)]);
    {
        let handle = running.sinks.get(TrackType::Audio).unwrap();
        let bookkeeper = handle.bookkeeper();
        assert!(bookkeeper.chunks().all(|c| c.range.start >= 8.));
        assert!(bookkeeper.query(8.5).is_some());
    }
    // Evicted data behind the position is not fetched again.
    assert_eq!(
        sink.appended()
            .iter()
            .filter(|id| id.as_str() == "p1-aac-en-0")
            .count(),
        1
    );

    running.stop().await
}
