//! Update agent core - exposes modules for testing.
//!
//! - `lock`: single-update-at-a-time file lock
//! - `line_router`: descriptor output to log lines
//! - `subprocess`: payload streaming into a child with output capture
//! - `handlers`: pipe and exec image handlers

pub mod handlers;
pub mod line_router;
pub mod lock;
pub mod subprocess;

pub use line_router::{LineRouter, LogSink, TracingSink};
pub use lock::UpdateLock;
pub use subprocess::{ChildProcess, PollEvent, StreamOptions};
