mod adaptation;
mod orchestrator;
mod period;
