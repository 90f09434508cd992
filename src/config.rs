//! Gateway configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::{Error, Result};

/// Which RTSP stream profile to pull from a camera.
///
/// `Sub` selects the camera's low-resolution substream and starts the video
/// source in low-bitrate mode from the first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    /// Full-resolution main stream
    #[default]
    Main,
    /// Low-resolution substream
    Sub,
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Maximum number of concurrent viewer sessions
    pub max_connections: usize,

    /// Interval clients are told to send heartbeats at, in seconds
    pub heartbeat_interval_secs: u64,

    /// Seconds without a heartbeat before a session is reaped
    pub heartbeat_timeout_secs: u64,

    /// Supervisor sweep interval in seconds
    pub sweep_interval_secs: u64,

    /// Deadline for each SDP negotiation step, in seconds
    pub negotiation_timeout_secs: u64,

    /// Grace period after an ICE disconnection before teardown, in seconds
    pub disconnect_grace_secs: u64,

    /// Consecutive decode failures before a video source reconnects
    pub error_threshold: u32,

    /// Source reconnection policy, shared by video and audio
    pub backoff: BackoffPolicy,

    /// STUN/TURN server URLs for ICE
    pub ice_servers: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 30,
            sweep_interval_secs: 10,
            negotiation_timeout_secs: 10,
            disconnect_grace_secs: 5,
            error_threshold: 10,
            backoff: BackoffPolicy::default(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

impl GatewayConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::InvalidConfig(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        if self.heartbeat_timeout_secs <= self.heartbeat_interval_secs {
            return Err(Error::InvalidConfig(
                "heartbeat_timeout must exceed heartbeat_interval".to_string(),
            ));
        }

        if self.sweep_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "sweep_interval must be greater than 0".to_string(),
            ));
        }

        if self.negotiation_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "negotiation_timeout must be greater than 0".to_string(),
            ));
        }

        if self.error_threshold == 0 {
            return Err(Error::InvalidConfig(
                "error_threshold must be greater than 0".to_string(),
            ));
        }

        if self.backoff.max_delay < self.backoff.base_delay {
            return Err(Error::InvalidConfig(
                "backoff max_delay must not be below base_delay".to_string(),
            ));
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }
}
