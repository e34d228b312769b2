use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use tsumugi::{
    events::{EventReceiver, StreamEvent},
    fetch::SegmentFetcher,
    manifest::{Adaptation, Period, Representation, TrackType},
    segment::{Segment, SegmentListIndex},
    sink::{memory::MemorySink, BufferSink, SinkChunk, SinkFactory},
    util::range::TimeRange,
    TsumugiError, TsumugiResult,
};
use url::Url;

pub const SEGMENT_DURATION: f64 = 2.;

#[derive(Default)]
struct FetcherState {
    fetched: Vec<String>,
    transient: HashMap<String, u32>,
    broken: Vec<String>,
}

/// Serves every segment with its id as payload.
#[derive(Clone, Default)]
pub struct TestFetcher {
    delay: Duration,
    state: Arc<Mutex<FetcherState>>,
}

impl TestFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail `segment_id` with a transient network error `times` times.
    pub fn fail_transient(self, segment_id: &str, times: u32) -> Self {
        self.state
            .lock()
            .unwrap()
            .transient
            .insert(segment_id.to_string(), times);
        self
    }

    /// Fail every segment whose id starts with `prefix` with a parse error.
    pub fn fail_permanently(self, prefix: &str) -> Self {
        self.state.lock().unwrap().broken.push(prefix.to_string());
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.state.lock().unwrap().fetched.clone()
    }
}

impl SegmentFetcher for TestFetcher {
    async fn fetch(&self, segment: &Segment) -> TsumugiResult<Bytes> {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            state.fetched.push(segment.id.clone());
            if state.broken.iter().any(|p| segment.id.starts_with(p.as_str())) {
                Err(TsumugiError::Parse(format!("{} is not a valid segment", segment.id)))
            } else if let Some(remaining) =
                state.transient.get_mut(&segment.id).filter(|r| **r > 0)
            {
                *remaining -= 1;
                Err(TsumugiError::NetworkTransient("connection reset".to_string()))
            } else {
                Ok(())
            }
        };

        tokio::time::sleep(self.delay).await;
        outcome.map(|_| Bytes::from(segment.id.clone().into_bytes()))
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Memory sink recording how many appends ever overlapped.
pub struct CountingSink {
    inner: MemorySink,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl CountingSink {
    pub fn appended(&self) -> Vec<String> {
        self.inner.appended()
    }
}

impl BufferSink for CountingSink {
    async fn append(&self, chunk: SinkChunk) -> TsumugiResult<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(self.in_flight.clone());
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.inner.append(chunk).await
    }

    async fn remove(&self, start: f64, end: f64) -> TsumugiResult<()> {
        self.inner.remove(start, end).await
    }

    fn buffered_ranges(&self) -> Vec<TimeRange> {
        self.inner.buffered_ranges()
    }

    fn is_compatible(&self, mime_type: &str, codecs: &str) -> bool {
        self.inner.is_compatible(mime_type, codecs)
    }

    fn dispose(&self) {
        self.inner.dispose()
    }
}

#[derive(Clone, Default)]
pub struct CountingSinkFactory {
    append_delay: Duration,
    max_in_flight: Arc<AtomicUsize>,
    sinks: Arc<Mutex<Vec<Arc<CountingSink>>>>,
}

impl CountingSinkFactory {
    pub fn with_append_delay(mut self, delay: Duration) -> Self {
        self.append_delay = delay;
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<Arc<CountingSink>> {
        self.sinks.lock().unwrap().last().cloned()
    }
}

impl SinkFactory for CountingSinkFactory {
    type Sink = Arc<CountingSink>;

    fn create(
        &self,
        track_type: TrackType,
        mime_type: &str,
        codecs: &str,
    ) -> TsumugiResult<Self::Sink> {
        let sink = Arc::new(CountingSink {
            inner: MemorySink::new(track_type, mime_type, codecs)
                .with_append_delay(self.append_delay),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: self.max_in_flight.clone(),
        });
        self.sinks.lock().unwrap().push(sink.clone());
        Ok(sink)
    }
}

pub fn base_url() -> Url {
    Url::parse("https://cdn.example.com/content/").unwrap()
}

/// Representation whose segments are named `<period>-<id>-<n>`.
pub fn representation(
    period_id: &str,
    id: &str,
    bitrate: u64,
    start: f64,
    end: f64,
    finished: bool,
) -> Representation {
    let index = SegmentListIndex::uniform(
        &base_url(),
        &format!("{period_id}-{id}"),
        start,
        end,
        SEGMENT_DURATION,
        finished,
    )
    .unwrap();
    Representation::new(id, bitrate, Arc::new(index))
}

/// Video in `low` and `high`, English audio in `aac`, English subtitles in `vtt`.
pub fn period_with(id: &str, start: f64, end: Option<f64>, index_end: f64, finished: bool) -> Period {
    Period::new(id, start, end)
        .with_adaptation(
            Adaptation::new("video", TrackType::Video, "video/mp4", "avc1.64001f")
                .with_representation(
                    representation(id, "low", 500_000, start, index_end, finished)
                        .with_dimensions(640, 360),
                )
                .with_representation(
                    representation(id, "high", 3_000_000, start, index_end, finished)
                        .with_dimensions(1920, 1080),
                ),
        )
        .with_adaptation(
            Adaptation::new("audio", TrackType::Audio, "audio/mp4", "mp4a.40.2")
                .with_language("en")
                .with_representation(representation(id, "aac", 128_000, start, index_end, finished)),
        )
        .with_adaptation(
            Adaptation::new("text", TrackType::Text, "text/vtt", "wvtt")
                .with_language("en")
                .with_representation(representation(id, "vtt", 1_000, start, index_end, finished)),
        )
}

pub fn period(id: &str, start: f64, end: f64) -> Period {
    period_with(id, start, Some(end), end, true)
}

/// Receive events until one matches `predicate`, returning every event seen.
pub async fn collect_until(
    events: &mut EventReceiver,
    mut predicate: impl FnMut(&StreamEvent) -> bool,
) -> anyhow::Result<Vec<StreamEvent>> {
    let seen = tokio::time::timeout(Duration::from_secs(600), async {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let done = predicate(&event);
            seen.push(event);
            if done {
                return Ok(seen);
            }
        }
        anyhow::bail!("event channel closed")
    })
    .await??;
    Ok(seen)
}

/// Receive events until one matches `predicate`.
pub async fn wait_for(
    events: &mut EventReceiver,
    predicate: impl FnMut(&StreamEvent) -> bool,
) -> anyhow::Result<StreamEvent> {
    collect_until(events, predicate)
        .await?
        .pop()
        .ok_or_else(|| anyhow::anyhow!("no event received"))
}

/// Events already queued, without waiting.
pub fn drain(events: &mut EventReceiver) -> Vec<StreamEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

pub fn pushed_by(event: &StreamEvent, representation: &str) -> bool {
    matches!(event, StreamEvent::SegmentPushed { representation_id, .. } if representation_id == representation)
}
