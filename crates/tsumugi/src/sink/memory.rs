use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use super::{BufferSink, SinkChunk, SinkFactory};
use crate::{
    manifest::TrackType,
    util::range::{self, TimeRange},
    TsumugiError, TsumugiResult,
};

/// Appended ranges closer than this are merged into one buffered range.
const GAP_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Default)]
struct MemoryBuffer {
    ranges: Vec<TimeRange>,
    /// Byte size of every appended media chunk still buffered.
    chunks: Vec<(TimeRange, usize)>,
    bytes: usize,
    appended: Vec<String>,
    disposed: bool,
}

/// In-memory buffer sink, mostly useful for tests and simulations.
#[derive(Debug)]
pub struct MemorySink {
    track_type: TrackType,
    mime_type: String,
    codecs: String,
    quota: Option<usize>,
    append_delay: Duration,
    inner: Mutex<MemoryBuffer>,
}

impl MemorySink {
    pub fn new(track_type: TrackType, mime_type: &str, codecs: &str) -> Self {
        Self {
            track_type,
            mime_type: mime_type.to_string(),
            codecs: codecs.to_string(),
            quota: None,
            append_delay: Duration::ZERO,
            inner: Mutex::new(MemoryBuffer::default()),
        }
    }

    /// Reject appends once `bytes` are buffered.
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    /// Time every append takes before the data becomes buffered.
    pub fn with_append_delay(mut self, delay: Duration) -> Self {
        self.append_delay = delay;
        self
    }

    fn inner(&self) -> MutexGuard<'_, MemoryBuffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn track_type(&self) -> TrackType {
        self.track_type
    }

    /// Ids of every segment appended so far, in order.
    pub fn appended(&self) -> Vec<String> {
        self.inner().appended.clone()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.inner().bytes
    }

    pub fn is_disposed(&self) -> bool {
        self.inner().disposed
    }

    /// Drop buffered data without telling anyone, like a platform under memory pressure.
    pub fn evict(&self, start: f64, end: f64) {
        Self::remove_inner(&mut self.inner(), TimeRange::new(start, end));
    }

    /// Chunks cut by `removed` keep the share of their size that is left.
    fn remove_inner(inner: &mut MemoryBuffer, removed: TimeRange) {
        inner.ranges = range::subtract(&inner.ranges, &removed);
        let mut kept = Vec::with_capacity(inner.chunks.len());
        for (chunk, size) in inner.chunks.drain(..) {
            if !chunk.overlaps(&removed) {
                kept.push((chunk, size));
                continue;
            }
            let duration = chunk.duration();
            for piece in range::subtract(&[chunk], &removed) {
                let share = (size as f64 * piece.duration() / duration).round() as usize;
                kept.push((piece, share));
            }
        }
        inner.bytes = kept.iter().map(|(_, size)| size).sum();
        inner.chunks = kept;
    }
}

fn codec_family(codecs: &str) -> &str {
    codecs.split('.').next().unwrap_or(codecs)
}

fn container(mime_type: &str) -> &str {
    mime_type.split(';').next().unwrap_or(mime_type).trim()
}

impl BufferSink for MemorySink {
    async fn append(&self, chunk: SinkChunk) -> TsumugiResult<()> {
        if !self.append_delay.is_zero() {
            tokio::time::sleep(self.append_delay).await;
        }

        let mut inner = self.inner();
        if inner.disposed {
            return Err(TsumugiError::BufferAppend(
                "sink has been disposed".to_string(),
            ));
        }
        if !self.is_compatible(&chunk.mime_type, &chunk.codecs) {
            return Err(TsumugiError::BufferAppend(format!(
                "{} {} can not be appended to a {} {} buffer",
                chunk.mime_type, chunk.codecs, self.mime_type, self.codecs
            )));
        }
        let size = chunk.data.len();
        if self.quota.is_some_and(|quota| inner.bytes + size > quota) {
            return Err(TsumugiError::BufferFull);
        }

        inner.appended.push(chunk.segment.id.clone());
        if let Some(added) = chunk.range.filter(|r| !r.is_empty()) {
            inner.ranges = range::union(&inner.ranges, &added, GAP_TOLERANCE);
            inner.chunks.push((added, size));
            inner.bytes += size;
        }
        Ok(())
    }

    async fn remove(&self, start: f64, end: f64) -> TsumugiResult<()> {
        Self::remove_inner(&mut self.inner(), TimeRange::new(start, end));
        Ok(())
    }

    fn buffered_ranges(&self) -> Vec<TimeRange> {
        self.inner().ranges.clone()
    }

    fn is_compatible(&self, mime_type: &str, codecs: &str) -> bool {
        container(mime_type) == container(&self.mime_type)
            && codec_family(codecs) == codec_family(&self.codecs)
    }

    fn dispose(&self) {
        let mut inner = self.inner();
        inner.disposed = true;
        inner.ranges.clear();
        inner.chunks.clear();
        inner.bytes = 0;
    }
}

/// Creates [`MemorySink`]s and keeps a reference to each for inspection.
#[derive(Debug, Default, Clone)]
pub struct MemorySinkFactory {
    quota: Option<usize>,
    append_delay: Duration,
    created: Arc<Mutex<Vec<Arc<MemorySink>>>>,
}

impl MemorySinkFactory {
    pub fn with_quota(mut self, bytes: usize) -> Self {
        self.quota = Some(bytes);
        self
    }

    pub fn with_append_delay(mut self, delay: Duration) -> Self {
        self.append_delay = delay;
        self
    }

    /// Most recently created sink of `track_type`.
    pub fn sink(&self, track_type: TrackType) -> Option<Arc<MemorySink>> {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|s| s.track_type == track_type)
            .cloned()
    }

    pub fn created(&self) -> usize {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl SinkFactory for MemorySinkFactory {
    type Sink = Arc<MemorySink>;

    fn create(
        &self,
        track_type: TrackType,
        mime_type: &str,
        codecs: &str,
    ) -> TsumugiResult<Self::Sink> {
        let mut sink =
            MemorySink::new(track_type, mime_type, codecs).with_append_delay(self.append_delay);
        if let Some(quota) = self.quota {
            sink = sink.with_quota(quota);
        }
        let sink = Arc::new(sink);
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink.clone());
        Ok(sink)
    }
}
