//! Buffer controllers, from one representation up to the whole presentation.

pub mod active_period;
pub mod adaptation;
pub mod gc;
pub mod orchestrator;
pub mod period;
pub mod representation;

pub use orchestrator::{Orchestrator, OrchestratorControls};
