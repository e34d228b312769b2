use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::mpsc;
use tsumugi::{
    clock::{clock, ClockTick},
    config::StreamConfig,
    events::StreamEvent,
    manifest::{Manifest, ManifestLoader, TrackType},
    sink::{memory::MemorySinkFactory, BufferSink},
    track::TrackPreference,
    ErrorKind, Orchestrator, TsumugiError, TsumugiResult,
};

use crate::common::{self, TestFetcher};

fn active_period_is(event: &StreamEvent, id: &str) -> bool {
    matches!(event, StreamEvent::ActivePeriodChanged { period } if period.id == id)
}

fn complete(event: &StreamEvent, track_type: TrackType, id: &str) -> bool {
    matches!(
        event,
        StreamEvent::StreamComplete { track_type: t, period_id } if *t == track_type && period_id == id
    )
}

#[tokio::test(start_paused = true)]
async fn test_next_period_is_preloaded_and_previous_cleared() -> anyhow::Result<()> {
    let manifest = Manifest::new(
        false,
        vec![
            common::period("p1", 0., 10.),
            common::period("p2", 10., 20.),
        ],
    );
    let factory = MemorySinkFactory::default();
    let orchestrator = Orchestrator::new(
        manifest,
        TestFetcher::new(),
        factory.clone(),
        StreamConfig::default(),
    )?
    .track_types([TrackType::Video, TrackType::Audio]);
    let controls = orchestrator.controls();
    let (clock_tx, clock_rx) = clock(ClockTick::at(0.));
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let task = tokio::spawn(orchestrator.run(clock_rx, events_tx));

    common::wait_for(&mut events, |e| active_period_is(e, "p1")).await?;

    let mut video_done = false;
    let mut audio_done = false;
    common::wait_for(&mut events, |e| {
        video_done |= complete(e, TrackType::Video, "p2");
        audio_done |= complete(e, TrackType::Audio, "p2");
        video_done && audio_done
    })
    .await?;
    let video = factory.sink(TrackType::Video).unwrap();
    assert!(video.appended().contains(&"p2-low-4".to_string()));

    clock_tx.send_replace(ClockTick::at(12.));
    let seen = common::collect_until(&mut events, |e| active_period_is(e, "p2")).await?;
    assert!(seen.iter().any(|e| matches!(
        e,
        StreamEvent::PeriodCleared { period_id, .. } if period_id == "p1"
    )));
    assert_eq!(controls.manifest().periods.len(), 2);

    controls.shutdown();
    task.await??;
    assert!(video.is_disposed());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failing_text_track_is_dropped() -> anyhow::Result<()> {
    let manifest = Manifest::new(false, vec![common::period("p1", 0., 20.)]);
    let factory = MemorySinkFactory::default();
    let orchestrator = Orchestrator::new(
        manifest,
        TestFetcher::new().fail_permanently("p1-vtt"),
        factory.clone(),
        StreamConfig::default(),
    )?;
    let controls = orchestrator.controls();
    controls
        .tracks()
        .set_preference(TrackType::Text, TrackPreference::Language("en".to_string()));
    let (_clock, clock_rx) = clock(ClockTick::at(0.));
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let task = tokio::spawn(orchestrator.run(clock_rx, events_tx));

    let mut video_done = false;
    let mut audio_done = false;
    let mut seen = common::collect_until(&mut events, |e| {
        video_done |= complete(e, TrackType::Video, "p1");
        audio_done |= complete(e, TrackType::Audio, "p1");
        video_done && audio_done
    })
    .await?;
    tokio::time::sleep(Duration::from_secs(5)).await;
    seen.extend(common::drain(&mut events));

    let text_warnings = seen
        .iter()
        .filter(|e| {
            matches!(
                e,
                StreamEvent::Warning {
                    track_type: Some(TrackType::Text),
                    ..
                }
            )
        })
        .count();
    assert_eq!(text_warnings, 1);
    assert!(!task.is_finished());
    assert!(factory.sink(TrackType::Text).unwrap().is_disposed());
    assert!(!factory.sink(TrackType::Video).unwrap().is_disposed());

    controls.shutdown();
    task.await??;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failing_video_track_is_fatal() -> anyhow::Result<()> {
    let manifest = Manifest::new(false, vec![common::period("p1", 0., 20.)]);
    let orchestrator = Orchestrator::new(
        manifest,
        TestFetcher::new().fail_permanently("p1-low"),
        MemorySinkFactory::default(),
        StreamConfig::default(),
    )?
    .track_types([TrackType::Video]);
    let (_clock, clock_rx) = clock(ClockTick::at(0.));
    let (events_tx, _events) = mpsc::unbounded_channel();

    let error = orchestrator.run(clock_rx, events_tx).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Parse);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_position_after_last_period() -> anyhow::Result<()> {
    let manifest = Manifest::new(false, vec![common::period("p1", 0., 20.)]);
    let orchestrator = Orchestrator::new(
        manifest,
        TestFetcher::new(),
        MemorySinkFactory::default(),
        StreamConfig::default(),
    )?;
    let (_clock, clock_rx) = clock(ClockTick::at(100.));
    let (events_tx, _events) = mpsc::unbounded_channel();

    let error = orchestrator.run(clock_rx, events_tx).await.unwrap_err();
    assert!(matches!(error, TsumugiError::NoPeriodFound(_)));

    Ok(())
}

#[test]
fn test_invalid_config_is_rejected() {
    let manifest = Manifest::new(false, vec![common::period("p1", 0., 20.)]);
    let result = Orchestrator::new(
        manifest,
        TestFetcher::new(),
        MemorySinkFactory::default(),
        StreamConfig::default().wanted_buffer_ahead(f64::NAN),
    );
    assert!(matches!(result, Err(TsumugiError::InvalidConfig(_))));
}

struct LiveLoader {
    calls: Arc<AtomicUsize>,
}

impl ManifestLoader for LiveLoader {
    async fn load(&self) -> TsumugiResult<Manifest> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(TsumugiError::NetworkTransient("timed out".to_string()));
        }
        Ok(Manifest::new(
            true,
            vec![common::period_with("live", 0., None, 20., true)],
        ))
    }
}

#[tokio::test(start_paused = true)]
async fn test_live_manifest_is_refreshed() -> anyhow::Result<()> {
    let manifest = Manifest::new(true, vec![common::period_with("live", 0., None, 6., false)]);
    let calls = Arc::new(AtomicUsize::new(0));
    let orchestrator = Orchestrator::new(
        manifest,
        TestFetcher::new(),
        MemorySinkFactory::default(),
        StreamConfig::default(),
    )?
    .track_types([TrackType::Video])
    .manifest_loader(LiveLoader {
        calls: calls.clone(),
    });
    let controls = orchestrator.controls();
    let (clock_tx, clock_rx) = clock(ClockTick::at(0.));
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let task = tokio::spawn(orchestrator.run(clock_rx, events_tx));

    common::wait_for(&mut events, |e| {
        matches!(e, StreamEvent::NeedsManifestRefresh { .. })
    })
    .await?;
    common::wait_for(&mut events, |e| {
        matches!(e, StreamEvent::Warning { track_type: None, .. })
    })
    .await?;

    // Refreshed segments are picked up on the next tick.
    tokio::time::sleep(Duration::from_secs(1)).await;
    clock_tx.send_replace(ClockTick::at(0.5));
    common::wait_for(&mut events, |e| {
        matches!(e, StreamEvent::SegmentPushed { segment, .. } if segment.id == "live-low-9")
    })
    .await?;
    common::wait_for(&mut events, |e| complete(e, TrackType::Video, "live")).await?;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(controls.manifest().periods.len(), 1);

    controls.shutdown();
    task.await??;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_max_buffer_ahead_below_wanted_buffer_settles() -> anyhow::Result<()> {
    let manifest = Manifest::new(false, vec![common::period("p1", 0., 600.)]);
    let fetcher = TestFetcher::new();
    let factory = MemorySinkFactory::default();
    let config = StreamConfig::default()
        .wanted_buffer_ahead(30.)
        .max_buffer_ahead(Some(10.));
    let orchestrator = Orchestrator::new(manifest, fetcher.clone(), factory.clone(), config)?
        .track_types([TrackType::Video]);
    let controls = orchestrator.controls();
    let (clock_tx, clock_rx) = clock(ClockTick::at(0.));
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let task = tokio::spawn(orchestrator.run(clock_rx, events_tx));

    common::wait_for(&mut events, |e| matches!(e, StreamEvent::BufferFull { .. })).await?;
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        clock_tx.send_replace(ClockTick::at(0.));
    }

    // The init segment and the five segments starting before 10s.
    let fetched = fetcher.fetched();
    assert_eq!(fetched.len(), 6, "fetched {fetched:?}");
    let video = factory.sink(TrackType::Video).unwrap();
    let end = video.buffered_ranges().last().map(|r| r.end);
    assert_eq!(end, Some(10.));

    controls.shutdown();
    task.await??;

    Ok(())
}
