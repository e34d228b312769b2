//! Buffer orchestration for adaptive segmented streams.
//!
//! ```text
//!                  ┌──────────────┐
//!  ClockTick ─────►│ Orchestrator │──────────────► StreamEvent
//!                  └──────┬───────┘
//!                         │ one per (period, track type)
//!                  ┌──────▼───────┐  choice   ┌───────────────┐
//!                  │ PeriodStream │◄──────────┤ TrackSelector │
//!                  └──────┬───────┘           └───────────────┘
//!                         │ one per chosen adaptation
//!                ┌────────▼─────────┐ estimates ┌────────────────┐
//!                │ AdaptationStream │◄──────────┤ EstimateStream │◄── throughput
//!                └────────┬─────────┘           └────────────────┘
//!                         │ one at a time
//!             ┌───────────▼──────────┐  fetch   ┌────────────────┐
//!             │ RepresentationStream ├─────────►│ SegmentFetcher │
//!             └───────────┬──────────┘          └────────────────┘
//!                         │ append
//!                  ┌──────▼──────┐
//!                  │ BufferSink  │
//!                  └─────────────┘
//! ```

pub mod abr;
pub mod backoff;
pub mod bookkeeper;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod manifest;
pub mod segment;
pub mod sink;
pub mod stream;
pub mod track;
pub mod util;

pub use error::{ErrorKind, TsumugiError, TsumugiResult};
pub use stream::{Orchestrator, OrchestratorControls};
