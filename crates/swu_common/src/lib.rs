//! Shared types for the update agent
//!
//! Wire protocol spoken with the update controller, the error taxonomy used by
//! every agent component, configuration loading and logging bootstrap.

pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;

pub use config::AgentConfig;
pub use error::{ExitOutcome, SwuError, SwuResult};
