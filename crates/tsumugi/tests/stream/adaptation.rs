use std::{sync::Arc, time::Duration};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tsumugi::{
    abr::{bandwidth, AbrSettings, ManualSelection},
    clock::{clock, ClockTick},
    config::{AbrConfig, ManualBitrateSwitchingMode, ManualUrgency, StreamConfig},
    events::StreamEvent,
    manifest::TrackType,
    sink::SinkStore,
    stream::adaptation::AdaptationStream,
};

use crate::common::{self, CountingSinkFactory, TestFetcher};

fn representation_changed_to(event: &StreamEvent, id: &str) -> bool {
    matches!(
        event,
        StreamEvent::RepresentationChanged { representation: Some(r), .. } if r.id == id
    )
}

#[tokio::test(start_paused = true)]
async fn test_urgent_switch_never_overlaps_appends() -> anyhow::Result<()> {
    let period = Arc::new(common::period("p1", 0., 60.));
    let adaptation = period.adaptations_for(TrackType::Video)[0].clone();
    let factory = CountingSinkFactory::default().with_append_delay(Duration::from_millis(500));
    let store = SinkStore::new(factory.clone());
    let sink = store.get_or_create(TrackType::Video, "video/mp4", "avc1.64001f")?;
    let config = StreamConfig::default().abr(AbrConfig {
        manual_urgency: ManualUrgency::AlwaysUrgent,
        ..Default::default()
    });
    let (_clock, clock_rx) = clock(ClockTick::at(0.));
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (settings_tx, settings_rx) = watch::channel(AbrSettings::default());
    let cancel = CancellationToken::new();

    let controller = tokio::spawn(
        AdaptationStream {
            track_type: TrackType::Video,
            period: period.clone(),
            adaptation,
            fetcher: Arc::new(TestFetcher::new().delay(Duration::from_millis(300))),
            sink,
            clock: clock_rx,
            config: Arc::new(config.clone()),
            events: events_tx,
            settings: settings_rx,
            bandwidth: bandwidth::shared(&config.abr),
        }
        .run(cancel.clone()),
    );

    // Nothing measured yet, the lowest quality comes first.
    common::wait_for(&mut events, |e| representation_changed_to(e, "low")).await?;
    common::wait_for(&mut events, |e| common::pushed_by(e, "low")).await?;
    common::wait_for(&mut events, |e| common::pushed_by(e, "low")).await?;

    settings_tx.send_modify(|s| {
        s.manual.insert(
            TrackType::Video,
            ManualSelection::Representation("high".to_string()),
        );
    });
    common::wait_for(&mut events, |e| representation_changed_to(e, "high")).await?;

    let mut high_pushes = 0;
    while high_pushes < 3 {
        let event = common::wait_for(&mut events, |e| {
            matches!(e, StreamEvent::SegmentPushed { .. })
        })
        .await?;
        assert!(
            !common::pushed_by(&event, "low"),
            "old representation pushed after the switch"
        );
        high_pushes += 1;
    }
    assert_eq!(factory.max_in_flight(), 1);
    assert!(factory
        .last()
        .unwrap()
        .appended()
        .contains(&"p1-high-init".to_string()));

    cancel.cancel();
    controller.await??;

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_direct_manual_switch_requests_reload() -> anyhow::Result<()> {
    let period = Arc::new(common::period("p1", 0., 60.));
    let adaptation = period.adaptations_for(TrackType::Video)[0].clone();
    let store = SinkStore::new(CountingSinkFactory::default());
    let sink = store.get_or_create(TrackType::Video, "video/mp4", "avc1.64001f")?;
    let config = StreamConfig::default()
        .wanted_buffer_ahead(10.)
        .manual_bitrate_switching_mode(ManualBitrateSwitchingMode::Direct);
    let (_clock, clock_rx) = clock(ClockTick::at(0.));
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let (settings_tx, settings_rx) = watch::channel(AbrSettings::default());
    let cancel = CancellationToken::new();

    let controller = tokio::spawn(
        AdaptationStream {
            track_type: TrackType::Video,
            period: period.clone(),
            adaptation,
            fetcher: Arc::new(TestFetcher::new()),
            sink,
            clock: clock_rx,
            config: Arc::new(config.clone()),
            events: events_tx,
            settings: settings_rx,
            bandwidth: bandwidth::shared(&config.abr),
        }
        .run(cancel.clone()),
    );

    common::wait_for(&mut events, |e| matches!(e, StreamEvent::BufferFull { .. })).await?;
    settings_tx.send_modify(|s| {
        s.manual
            .insert(TrackType::Video, ManualSelection::Bitrate(5_000_000));
    });

    let seen = common::collect_until(&mut events, |e| {
        matches!(e, StreamEvent::NeedsMediaSourceReload { .. })
    })
    .await?;
    assert!(!seen.iter().any(|e| representation_changed_to(e, "high")));

    // Further estimates are ignored until the player reloads.
    settings_tx.send_modify(|s| {
        s.manual.remove(&TrackType::Video);
    });
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!common::drain(&mut events)
        .iter()
        .any(|e| matches!(e, StreamEvent::SegmentPushed { .. })));

    cancel.cancel();
    controller.await??;

    Ok(())
}
