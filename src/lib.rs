//! RTSP-to-WebRTC media gateway.
//!
//! Pulls video (H.264) and audio (Opus) out of RTSP cameras and serves
//! them to browsers over WebRTC, with HTTP/JSON signaling, per-session
//! heartbeats, and a supervisor that reaps dead sessions.

pub mod backoff;
pub mod capture;
pub mod config;
pub mod error;
pub mod media;
pub mod session;
pub mod signaling;
pub mod supervisor;

pub use backoff::BackoffPolicy;
pub use config::{GatewayConfig, StreamType};
pub use error::{Error, Result};
pub use session::SessionManager;
