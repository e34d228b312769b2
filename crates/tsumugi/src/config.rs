use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{backoff::BackoffOptions, TsumugiError, TsumugiResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManualBitrateSwitchingMode {
    /// Keep already buffered data, switch on the next segment.
    #[default]
    Seamless,
    /// Discard buffered data and rebuild the media pipeline.
    Direct,
}

/// How a manual quality choice is classified when it replaces the active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManualUrgency {
    /// Same rule as automatic estimates: urgent on a large bitrate drop or a low buffer.
    #[default]
    FollowBitrateRule,
    AlwaysSlow,
    AlwaysUrgent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbrConfig {
    /// Fraction of the measured bandwidth considered usable.
    pub bandwidth_safety_factor: f64,
    /// Half-life in seconds of the reactive bandwidth average.
    pub fast_half_life: f64,
    /// Half-life in seconds of the stable bandwidth average.
    pub slow_half_life: f64,
    /// Downloads smaller than this are too noisy to be measured.
    pub min_sample_bytes: u64,
    /// A switch down by more than this fraction of the active bitrate is urgent.
    pub urgent_drop_ratio: f64,
    /// Seconds of buffer ahead under which any switch is urgent.
    pub low_buffer_threshold: f64,
    pub manual_urgency: ManualUrgency,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            bandwidth_safety_factor: 0.8,
            fast_half_life: 2.,
            slow_half_life: 10.,
            min_sample_bytes: 16_000,
            urgent_drop_ratio: 0.5,
            low_buffer_threshold: 5.,
            manual_urgency: ManualUrgency::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Seconds of content to keep buffered ahead of the playback position.
    pub wanted_buffer_ahead: f64,
    /// Buffered data further behind the position than this is garbage collected.
    pub max_buffer_behind: Option<f64>,
    /// Buffered data further ahead of the position than this is garbage collected.
    pub max_buffer_ahead: Option<f64>,
    pub manual_bitrate_switching_mode: ManualBitrateSwitchingMode,
    pub max_retry: u32,
    pub max_retry_offline: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// Maximum width of video representations considered by the estimator.
    pub limit_width: Option<u32>,
    /// Maximum bitrate of representations considered by the estimator.
    pub throttle_bitrate: Option<u64>,
    /// Seconds between two garbage collection passes.
    pub gc_interval: f64,
    pub abr: AbrConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            wanted_buffer_ahead: 30.,
            max_buffer_behind: None,
            max_buffer_ahead: None,
            manual_bitrate_switching_mode: ManualBitrateSwitchingMode::default(),
            max_retry: 4,
            max_retry_offline: 7,
            base_delay_ms: 200,
            max_delay_ms: 3_000,
            jitter: false,
            limit_width: None,
            throttle_bitrate: None,
            gc_interval: 1.,
            abr: AbrConfig::default(),
        }
    }
}

impl StreamConfig {
    pub fn wanted_buffer_ahead(mut self, seconds: f64) -> Self {
        self.wanted_buffer_ahead = seconds;
        self
    }

    pub fn max_buffer_behind(mut self, seconds: Option<f64>) -> Self {
        self.max_buffer_behind = seconds;
        self
    }

    pub fn max_buffer_ahead(mut self, seconds: Option<f64>) -> Self {
        self.max_buffer_ahead = seconds;
        self
    }

    pub fn manual_bitrate_switching_mode(mut self, mode: ManualBitrateSwitchingMode) -> Self {
        self.manual_bitrate_switching_mode = mode;
        self
    }

    pub fn retries(mut self, online: u32, offline: u32) -> Self {
        self.max_retry = online;
        self.max_retry_offline = offline;
        self
    }

    pub fn delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn limit_width(mut self, width: Option<u32>) -> Self {
        self.limit_width = width;
        self
    }

    pub fn throttle_bitrate(mut self, bitrate: Option<u64>) -> Self {
        self.throttle_bitrate = bitrate;
        self
    }

    pub fn abr(mut self, abr: AbrConfig) -> Self {
        self.abr = abr;
        self
    }

    pub fn validate(&self) -> TsumugiResult<()> {
        if !self.wanted_buffer_ahead.is_finite() || self.wanted_buffer_ahead < 0. {
            return Err(TsumugiError::InvalidConfig(format!(
                "wanted_buffer_ahead must be a finite value >= 0, got {}",
                self.wanted_buffer_ahead
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(TsumugiError::InvalidConfig(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        for (name, value) in [
            ("max_buffer_behind", self.max_buffer_behind),
            ("max_buffer_ahead", self.max_buffer_ahead),
        ] {
            if value.is_some_and(|v| v.is_nan() || v < 0.) {
                return Err(TsumugiError::InvalidConfig(format!("{name} must be >= 0")));
            }
        }
        if !(self.abr.bandwidth_safety_factor > 0.) {
            return Err(TsumugiError::InvalidConfig(
                "abr.bandwidth_safety_factor must be > 0".to_string(),
            ));
        }
        if !(self.gc_interval > 0.) {
            return Err(TsumugiError::InvalidConfig(
                "gc_interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Seconds ahead of the position fetch loops fill, never past what the collector keeps.
    pub fn buffer_goal(&self) -> f64 {
        self.max_buffer_ahead
            .map_or(self.wanted_buffer_ahead, |max| self.wanted_buffer_ahead.min(max))
    }

    pub fn backoff(&self) -> BackoffOptions {
        BackoffOptions {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_retry: self.max_retry,
            max_retry_offline: self.max_retry_offline,
            jitter: self.jitter,
        }
    }
}
