use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use rand::Rng;
use tokio::time::Instant;
use tsumugi::{fetch::SegmentFetcher, segment::Segment, TsumugiError, TsumugiResult};

/// Size of every initialization segment.
const INIT_SIZE: usize = 1_500;
/// Seconds each bandwidth value of the profile lasts.
const STEP_SECONDS: u64 = 10;

/// Fetcher serving zeroed payloads at the speed of a bandwidth profile.
#[derive(Clone)]
pub struct SimulatedFetcher {
    /// Bitrate of every registered segment name prefix.
    bitrates: Arc<Mutex<HashMap<String, u64>>>,
    profile: Arc<Vec<u64>>,
    failure_rate: f64,
    started: Instant,
}

impl SimulatedFetcher {
    pub fn new(profile_kbps: Vec<u64>, failure_rate: f64) -> Self {
        let profile = if profile_kbps.is_empty() {
            vec![5_000]
        } else {
            profile_kbps
        };
        Self {
            bitrates: Default::default(),
            profile: Arc::new(profile),
            failure_rate: failure_rate.clamp(0., 1.),
            started: Instant::now(),
        }
    }

    pub fn register(&self, prefix: &str, bitrate: u64) {
        self.bitrates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(prefix.to_string(), bitrate);
    }

    fn bandwidth(&self) -> u64 {
        let step = self.started.elapsed().as_secs() / STEP_SECONDS;
        self.profile[step as usize % self.profile.len()].max(1) * 1000
    }

    fn size(&self, segment: &Segment) -> TsumugiResult<usize> {
        let Some(range) = segment.time_range() else {
            return Ok(INIT_SIZE);
        };
        let prefix = segment
            .id
            .rsplit_once('-')
            .map(|(prefix, _)| prefix)
            .unwrap_or(&segment.id);
        let bitrate = self
            .bitrates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(prefix)
            .copied()
            .ok_or_else(|| TsumugiError::Internal(format!("unknown segment {}", segment.id)))?;
        Ok((bitrate as f64 * range.duration() / 8.) as usize)
    }
}

impl SegmentFetcher for SimulatedFetcher {
    async fn fetch(&self, segment: &Segment) -> TsumugiResult<Bytes> {
        let size = self.size(segment)?;
        let bandwidth = self.bandwidth();
        let transfer = Duration::from_secs_f64(size as f64 * 8. / bandwidth as f64);
        let fails = rand::thread_rng().gen_bool(self.failure_rate);

        if fails {
            tokio::time::sleep(transfer / 2).await;
            return Err(TsumugiError::NetworkTransient(format!(
                "connection reset while fetching {}",
                segment.id
            )));
        }
        tokio::time::sleep(transfer).await;
        tracing::trace!(segment = %segment.id, size, kbps = bandwidth / 1000, "Served segment.");
        Ok(Bytes::from(vec![0u8; size]))
    }
}
