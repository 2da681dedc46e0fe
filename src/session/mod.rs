//! Per-connection session state

pub mod state;

pub use state::{BoundStream, SessionPhase, SessionState};
