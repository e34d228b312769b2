use tokio::sync::watch;

/// Snapshot of the playback state, delivered on a fixed cadence and on seek/play/pause.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockTick {
    /// Playback position in seconds.
    pub current_time: f64,
    pub duration: Option<f64>,
    pub is_live: bool,
    pub is_paused: bool,
    /// HTMLMediaElement-like ready state, 0 to 4.
    pub ready_state: u8,
    pub speed: f64,
    /// Distance to the live edge, live content only.
    pub live_gap: Option<f64>,
    /// Set on ticks emitted because the position jumped.
    pub is_seeking: bool,
}

impl ClockTick {
    pub fn at(current_time: f64) -> Self {
        Self {
            current_time,
            duration: None,
            is_live: false,
            is_paused: false,
            ready_state: 4,
            speed: 1.,
            live_gap: None,
            is_seeking: false,
        }
    }

    pub fn seeking(mut self) -> Self {
        self.is_seeking = true;
        self
    }
}

impl Default for ClockTick {
    fn default() -> Self {
        Self::at(0.)
    }
}

pub type ClockSender = watch::Sender<ClockTick>;
pub type ClockReceiver = watch::Receiver<ClockTick>;

/// Channel every stream component reads playback ticks from.
pub fn clock(initial: ClockTick) -> (ClockSender, ClockReceiver) {
    watch::channel(initial)
}
