pub mod memory;

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use bytes::Bytes;

use crate::{
    bookkeeper::SegmentBookkeeper, manifest::TrackType, segment::Segment,
    util::range::TimeRange, TsumugiResult,
};

/// Data pushed into a buffer sink.
#[derive(Debug, Clone)]
pub struct SinkChunk {
    pub data: Bytes,
    pub segment: Segment,
    pub mime_type: String,
    pub codecs: String,
    /// Time range the data is expected to fill, `None` for initialization data.
    pub range: Option<TimeRange>,
}

/// Platform media buffer of one track type.
pub trait BufferSink: Send + Sync + 'static {
    /// Append data. Fails with [`crate::TsumugiError::BufferFull`] when the quota is reached
    /// and [`crate::TsumugiError::BufferAppend`] when the data is rejected.
    fn append(&self, chunk: SinkChunk) -> impl Future<Output = TsumugiResult<()>> + Send;

    fn remove(&self, start: f64, end: f64) -> impl Future<Output = TsumugiResult<()>> + Send;

    /// Ordered, disjoint buffered ranges.
    fn buffered_ranges(&self) -> Vec<TimeRange>;

    /// Whether data of this type can be appended after the data already pushed.
    fn is_compatible(&self, _mime_type: &str, _codecs: &str) -> bool {
        true
    }

    fn dispose(&self);
}

impl<S: BufferSink> BufferSink for Arc<S> {
    fn append(
        &self,
        chunk: SinkChunk,
    ) -> impl Future<Output = TsumugiResult<()>> + Send {
        self.as_ref().append(chunk)
    }

    fn remove(
        &self,
        start: f64,
        end: f64,
    ) -> impl Future<Output = TsumugiResult<()>> + Send {
        self.as_ref().remove(start, end)
    }

    fn buffered_ranges(&self) -> Vec<TimeRange> {
        self.as_ref().buffered_ranges()
    }

    fn is_compatible(&self, mime_type: &str, codecs: &str) -> bool {
        self.as_ref().is_compatible(mime_type, codecs)
    }

    fn dispose(&self) {
        self.as_ref().dispose()
    }
}

/// Creates buffer sinks on demand.
pub trait SinkFactory: Send + Sync + 'static {
    type Sink: BufferSink;

    fn create(
        &self,
        track_type: TrackType,
        mime_type: &str,
        codecs: &str,
    ) -> TsumugiResult<Self::Sink>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

/// A sink together with the bookkeeping created and destroyed alongside it.
pub struct SinkHandle<S> {
    id: SinkId,
    track_type: TrackType,
    sink: Arc<S>,
    bookkeeper: Arc<Mutex<SegmentBookkeeper>>,
}

impl<S> Clone for SinkHandle<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            track_type: self.track_type,
            sink: self.sink.clone(),
            bookkeeper: self.bookkeeper.clone(),
        }
    }
}

impl<S: BufferSink> SinkHandle<S> {
    pub fn id(&self) -> SinkId {
        self.id
    }

    pub fn track_type(&self) -> TrackType {
        self.track_type
    }

    pub fn sink(&self) -> &Arc<S> {
        &self.sink
    }

    pub fn bookkeeper(&self) -> MutexGuard<'_, SegmentBookkeeper> {
        self.bookkeeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reconcile the bookkeeper with what the sink really holds.
    pub fn synchronize(&self) -> Vec<TimeRange> {
        let ranges = self.sink.buffered_ranges();
        self.bookkeeper().synchronize(&ranges);
        ranges
    }

    /// Remove `[start, end)` from both the sink and its bookkeeper.
    pub async fn remove(&self, start: f64, end: f64) -> TsumugiResult<()> {
        if end <= start {
            return Ok(());
        }
        tracing::debug!(track_type = %self.track_type, start, end, "Removing buffered data.");
        self.sink.remove(start, end).await?;
        self.bookkeeper().remove_range(start, end);
        Ok(())
    }
}

/// Sinks currently alive, at most one per track type.
pub struct SinkStore<K: SinkFactory> {
    factory: K,
    sinks: Mutex<HashMap<TrackType, SinkHandle<K::Sink>>>,
    next_id: AtomicU64,
}

impl<K: SinkFactory> SinkStore<K> {
    pub fn new(factory: K) -> Self {
        Self {
            factory,
            sinks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn sinks(&self) -> MutexGuard<'_, HashMap<TrackType, SinkHandle<K::Sink>>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, track_type: TrackType) -> Option<SinkHandle<K::Sink>> {
        self.sinks().get(&track_type).cloned()
    }

    pub fn get_or_create(
        &self,
        track_type: TrackType,
        mime_type: &str,
        codecs: &str,
    ) -> TsumugiResult<SinkHandle<K::Sink>> {
        let mut sinks = self.sinks();
        if let Some(handle) = sinks.get(&track_type) {
            return Ok(handle.clone());
        }

        let sink = self.factory.create(track_type, mime_type, codecs)?;
        let handle = SinkHandle {
            id: SinkId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            track_type,
            sink: Arc::new(sink),
            bookkeeper: Arc::new(Mutex::new(SegmentBookkeeper::new())),
        };
        tracing::info!(%track_type, mime_type, codecs, "Created buffer sink.");
        sinks.insert(track_type, handle.clone());
        Ok(handle)
    }

    /// Dispose the sink of `track_type`, dropping its bookkeeping with it.
    pub fn dispose(&self, track_type: TrackType) {
        if let Some(handle) = self.sinks().remove(&track_type) {
            tracing::info!(%track_type, "Disposing buffer sink.");
            handle.sink.dispose();
        }
    }

    pub fn dispose_all(&self) {
        let handles: Vec<_> = self.sinks().drain().collect();
        for (track_type, handle) in handles {
            tracing::info!(%track_type, "Disposing buffer sink.");
            handle.sink.dispose();
        }
    }
}
