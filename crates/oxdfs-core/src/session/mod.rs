//! Process-wide bookkeeping of live filesystem sessions.

pub mod registry;

pub use registry::{SessionRegistry, SessionSummary, ShutdownReport};
