use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use futures::{future::BoxFuture, FutureExt};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use super::{active_period::ActivePeriodTracker, period::PeriodStream};
use crate::{
    abr::{
        bandwidth::{self, SharedBandwidth},
        AbrSettings, AbrSettingsSender, ManualSelection,
    },
    backoff::try_with_backoff,
    clock::ClockReceiver,
    config::StreamConfig,
    events::{EventSender, StreamEvent},
    fetch::SegmentFetcher,
    manifest::{Manifest, ManifestLoader, Period, TrackType},
    sink::{SinkFactory, SinkStore},
    track::TrackSelector,
    TsumugiError, TsumugiResult,
};

type Refresh = Arc<dyn Fn() -> BoxFuture<'static, TsumugiResult<Manifest>> + Send + Sync>;

/// Composition root of the engine.
///
/// Streams every track type of the period under the playback position, pre-loads the
/// following period once a track type has buffered its current one to the end, and
/// retires periods the position has left.
///
/// ```text
///                 ┌──────────────┐  ticks   ┌─────────────────────────────┐
///  ClockTick ────►│              ├─────────►│ PeriodStream (P1, video)    ├──┐
///                 │              │          ├─────────────────────────────┤  │
///                 │ Orchestrator ├─────────►│ PeriodStream (P1, audio)    ├──┤ events
///                 │              │          ├─────────────────────────────┤  │
///  StreamEvent ◄──┤              ├─────────►│ PeriodStream (P2, video)    ├──┤
///                 │              │◄─────────┴─────────────────────────────┘◄─┘
///                 └──────────────┘
/// ```
pub struct Orchestrator<F, K: SinkFactory> {
    manifest: Arc<watch::Sender<Arc<Manifest>>>,
    fetcher: Arc<F>,
    sinks: Arc<SinkStore<K>>,
    config: Arc<StreamConfig>,
    track_types: Vec<TrackType>,
    tracks: TrackSelector,
    settings: Arc<AbrSettingsSender>,
    bandwidth: HashMap<TrackType, SharedBandwidth>,
    loader: Option<Refresh>,
    cancel: CancellationToken,
}

impl<F, K> Orchestrator<F, K>
where
    F: SegmentFetcher,
    K: SinkFactory,
{
    pub fn new(
        manifest: Manifest,
        fetcher: F,
        sink_factory: K,
        config: StreamConfig,
    ) -> TsumugiResult<Self> {
        config.validate()?;
        let settings = AbrSettings {
            limit_width: config.limit_width,
            throttle_bitrate: config.throttle_bitrate,
            ..Default::default()
        };
        let bandwidth = TrackType::ALL
            .into_iter()
            .map(|t| (t, bandwidth::shared(&config.abr)))
            .collect();

        Ok(Self {
            manifest: Arc::new(watch::Sender::new(Arc::new(manifest))),
            fetcher: Arc::new(fetcher),
            sinks: Arc::new(SinkStore::new(sink_factory)),
            config: Arc::new(config),
            track_types: vec![TrackType::Audio, TrackType::Video, TrackType::Text],
            tracks: TrackSelector::new(),
            settings: Arc::new(watch::Sender::new(settings)),
            bandwidth,
            loader: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Track types to stream, audio, video and text by default.
    pub fn track_types(mut self, track_types: impl IntoIterator<Item = TrackType>) -> Self {
        self.track_types = track_types.into_iter().collect();
        self
    }

    /// Refresh the manifest through `loader` whenever a live index runs out of segments.
    pub fn manifest_loader<L: ManifestLoader>(mut self, loader: L) -> Self {
        let loader = Arc::new(loader);
        let refresh: Refresh = Arc::new(move || {
            let loader = loader.clone();
            async move { loader.load().await }.boxed()
        });
        self.loader = Some(refresh);
        self
    }

    pub fn controls(&self) -> OrchestratorControls {
        OrchestratorControls {
            manifest: self.manifest.clone(),
            tracks: self.tracks.clone(),
            settings: self.settings.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn sinks(&self) -> Arc<SinkStore<K>> {
        self.sinks.clone()
    }

    /// Stream until the clock goes away, [`OrchestratorControls::shutdown`] is called, or
    /// an essential track fails.
    pub async fn run(self, clock: ClockReceiver, events: EventSender) -> TsumugiResult<()> {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let mut session = Session {
            tracker: ActivePeriodTracker::new(self.track_types.iter().copied()),
            orchestrator: &self,
            chains: HashMap::new(),
            completed: HashSet::new(),
            clock,
            events,
            internal_tx,
            failure_tx,
            refresh: None,
        };

        let result = session.run(internal_rx, failure_rx).await;
        session.shutdown().await;
        self.sinks.dispose_all();
        result
    }
}

/// Runtime controls of a running [`Orchestrator`].
#[derive(Clone)]
pub struct OrchestratorControls {
    manifest: Arc<watch::Sender<Arc<Manifest>>>,
    tracks: TrackSelector,
    settings: Arc<AbrSettingsSender>,
    cancel: CancellationToken,
}

impl OrchestratorControls {
    pub fn tracks(&self) -> &TrackSelector {
        &self.tracks
    }

    pub fn manifest(&self) -> Arc<Manifest> {
        self.manifest.borrow().clone()
    }

    /// Merge a manifest obtained out of band into the current one.
    pub fn update_manifest(&self, manifest: Manifest) {
        self.manifest
            .send_modify(|current| *current = Arc::new(current.merge(manifest)));
    }

    /// Force the quality of `track_type`, or go back to automatic selection with `None`.
    pub fn set_manual_quality(&self, track_type: TrackType, selection: Option<ManualSelection>) {
        tracing::info!(%track_type, ?selection, "Manual quality changed.");
        self.settings.send_modify(|settings| match selection {
            Some(selection) => {
                settings.manual.insert(track_type, selection);
            }
            None => {
                settings.manual.remove(&track_type);
            }
        });
    }

    pub fn set_limit_width(&self, width: Option<u32>) {
        self.settings
            .send_modify(|settings| settings.limit_width = width);
    }

    pub fn set_throttle_bitrate(&self, bitrate: Option<u64>) {
        self.settings
            .send_modify(|settings| settings.throttle_bitrate = bitrate);
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct ManagedPeriod {
    period: Arc<Period>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type Failure = (TrackType, String, TsumugiError);

struct Session<'a, F, K: SinkFactory> {
    orchestrator: &'a Orchestrator<F, K>,
    /// Managed periods of every track type, ordered by start.
    chains: HashMap<TrackType, Vec<ManagedPeriod>>,
    /// Periods buffered to their end, per track type.
    completed: HashSet<(TrackType, String)>,
    tracker: ActivePeriodTracker,
    clock: ClockReceiver,
    events: EventSender,
    internal_tx: EventSender,
    failure_tx: mpsc::UnboundedSender<Failure>,
    refresh: Option<JoinHandle<TsumugiResult<Manifest>>>,
}

enum Step {
    Stop,
    Tick,
    Event(StreamEvent),
    Failure(Failure),
    Refreshed(TsumugiResult<Manifest>),
}

async fn wait_refresh(
    refresh: &mut Option<JoinHandle<TsumugiResult<Manifest>>>,
) -> TsumugiResult<Manifest> {
    match refresh {
        Some(task) => task.await?,
        None => std::future::pending().await,
    }
}

impl<F, K> Session<'_, F, K>
where
    F: SegmentFetcher,
    K: SinkFactory,
{
    async fn run(
        &mut self,
        mut internal_rx: mpsc::UnboundedReceiver<StreamEvent>,
        mut failure_rx: mpsc::UnboundedReceiver<Failure>,
    ) -> TsumugiResult<()> {
        let position = self.clock.borrow_and_update().current_time;
        if self.manifest().period_from(position).is_none() {
            return Err(TsumugiError::NoPeriodFound(position));
        }
        self.follow_position().await;

        loop {
            let step = tokio::select! {
                _ = self.orchestrator.cancel.cancelled() => Step::Stop,
                changed = self.clock.changed() => match changed {
                    Ok(()) => Step::Tick,
                    Err(_) => Step::Stop,
                },
                Some(event) = internal_rx.recv() => Step::Event(event),
                Some(failure) = failure_rx.recv() => Step::Failure(failure),
                result = wait_refresh(&mut self.refresh) => Step::Refreshed(result),
            };

            match step {
                Step::Stop => return Ok(()),
                Step::Tick => self.follow_position().await,
                Step::Event(event) => self.on_event(event),
                Step::Failure((track_type, period_id, error)) => {
                    tracing::error!(%track_type, %period_id, "Essential track failed. {error}");
                    return Err(error);
                }
                Step::Refreshed(result) => {
                    self.refresh = None;
                    self.on_refreshed(result?);
                }
            }
        }
    }

    fn manifest(&self) -> Arc<Manifest> {
        self.orchestrator.manifest.borrow().clone()
    }

    /// Make sure every track type streams the period under the playback position.
    async fn follow_position(&mut self) {
        let position = self.clock.borrow_and_update().current_time;
        let manifest = self.manifest();
        let Some(wanted) = manifest.period_from(position) else {
            return;
        };

        for track_type in self.orchestrator.track_types.clone() {
            let chain = self.chains.entry(track_type).or_default();
            let retired: Vec<ManagedPeriod> =
                match chain.iter().position(|m| m.period.id == wanted.id) {
                    Some(index) => chain.drain(..index).collect(),
                    None => chain.drain(..).collect(),
                };
            if !retired.is_empty() {
                tracing::debug!(%track_type, position, period_id = %wanted.id, retired = retired.len(), "Retiring periods.");
            }
            for managed in retired {
                self.retire(track_type, managed).await;
            }

            if self.chains.get(&track_type).map_or(true, Vec::is_empty) {
                self.start(track_type, wanted.clone());
            }
        }
    }

    fn start(&mut self, track_type: TrackType, period: Arc<Period>) {
        let orchestrator = self.orchestrator;
        tracing::info!(%track_type, period_id = %period.id, start = period.start, "Starting period stream.");

        let cancel = orchestrator.cancel.child_token();
        let stream = PeriodStream {
            track_type,
            period: period.clone(),
            fetcher: orchestrator.fetcher.clone(),
            sinks: orchestrator.sinks.clone(),
            clock: self.clock.clone(),
            config: orchestrator.config.clone(),
            events: self.internal_tx.clone(),
            settings: orchestrator.settings.subscribe(),
            bandwidth: orchestrator.bandwidth[&track_type].clone(),
            choice: orchestrator.tracks.subscribe(&period, track_type),
        };
        let failure_tx = self.failure_tx.clone();
        let period_id = period.id.clone();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if let Err(e) = stream.run(cancel).await {
                    let _ = failure_tx.send((track_type, period_id, e));
                }
            }
        });

        let chain = self.chains.entry(track_type).or_default();
        let index = chain.partition_point(|m| m.period.start <= period.start);
        chain.insert(
            index,
            ManagedPeriod {
                period,
                cancel,
                task,
            },
        );
    }

    async fn retire(&mut self, track_type: TrackType, managed: ManagedPeriod) {
        managed.cancel.cancel();
        if let Err(e) = managed.task.await {
            tracing::warn!(%track_type, period_id = %managed.period.id, "Period stream panicked. {e}");
        }
        self.orchestrator
            .tracks
            .forget(&managed.period.id, track_type);
        self.completed
            .remove(&(track_type, managed.period.id.clone()));
        self.emit(StreamEvent::PeriodCleared {
            track_type,
            period_id: managed.period.id.clone(),
        });
    }

    fn on_event(&mut self, event: StreamEvent) {
        match &event {
            StreamEvent::StreamComplete {
                track_type,
                period_id,
            } => {
                self.completed.insert((*track_type, period_id.clone()));
                self.preload_next(*track_type);
            }
            StreamEvent::NeedsManifestRefresh { .. } => self.refresh_manifest(),
            _ => {}
        }
        self.emit(event);
    }

    /// Start the period after the last managed one once that one is complete.
    fn preload_next(&mut self, track_type: TrackType) {
        let Some(last) = self
            .chains
            .get(&track_type)
            .and_then(|chain| chain.last())
            .map(|m| m.period.clone())
        else {
            return;
        };
        if !self.completed.contains(&(track_type, last.id.clone())) {
            return;
        }
        if let Some(next) = self.manifest().next_period(&last) {
            tracing::debug!(%track_type, period_id = %next.id, "Pre-loading next period.");
            self.start(track_type, next);
        }
    }

    fn refresh_manifest(&mut self) {
        if self.refresh.is_some() {
            return;
        }
        let Some(loader) = self.orchestrator.loader.clone() else {
            return;
        };

        tracing::info!("Refreshing manifest.");
        let backoff = self.orchestrator.config.backoff();
        let events = self.events.clone();
        self.refresh = Some(tokio::spawn(async move {
            try_with_backoff(
                || (*loader)(),
                &backoff,
                |error| {
                    let _ = events.send(StreamEvent::Warning {
                        track_type: None,
                        error: error.detached(),
                    });
                },
            )
            .await
        }));
    }

    fn on_refreshed(&mut self, manifest: Manifest) {
        self.orchestrator
            .manifest
            .send_modify(|current| *current = Arc::new(current.merge(manifest)));
        tracing::debug!(periods = self.manifest().periods.len(), "Manifest refreshed.");

        for track_type in self.orchestrator.track_types.clone() {
            self.preload_next(track_type);
        }
    }

    /// Forward an event, followed by the active period when it changes.
    fn emit(&mut self, event: StreamEvent) {
        let active = self.tracker.on_event(&event);
        let _ = self.events.send(event);
        if let Some(period) = active {
            let _ = self.events.send(StreamEvent::ActivePeriodChanged { period });
        }
    }

    async fn shutdown(&mut self) {
        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }
        let chains: Vec<_> = self.chains.drain().collect();
        for (track_type, chain) in chains {
            for managed in chain {
                self.retire(track_type, managed).await;
            }
        }
    }
}
