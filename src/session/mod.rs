//! Viewer sessions and their lifecycle.

pub mod manager;
mod session;

pub use manager::{HealthSnapshot, SessionManager, SessionStats, StatsSnapshot};
pub use session::Session;
