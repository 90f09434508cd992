//! Media sources feeding WebRTC tracks.
//!
//! Both sources share one contract: once constructed they never surface
//! errors to the consumer. Failures are absorbed with substitute output
//! (cached or blank video, silent audio) and recovery runs internally.

use std::time::Duration;

pub mod audio;
pub mod encoder;
pub mod video;

pub use audio::RtspAudioSource;
pub use video::RtspVideoSource;

/// RTP clock rate for video tracks
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Audio sample rate delivered to WebRTC
pub const AUDIO_SAMPLE_RATE: u32 = 48_000;

/// Samples per audio quantum (20 ms at 48 kHz)
pub const AUDIO_FRAME_SAMPLES: usize = 960;

/// Duration of one audio quantum
pub const AUDIO_FRAME_DURATION: Duration = Duration::from_millis(20);

/// Fallback frame geometry when no frame was ever decoded
pub const BLANK_WIDTH: u32 = 640;
/// Fallback frame geometry when no frame was ever decoded
pub const BLANK_HEIGHT: u32 = 480;

/// One video frame ready for encoding
#[derive(Debug, Clone)]
pub struct VideoSample {
    pub width: u32,
    pub height: u32,
    /// Packed RGB24 pixel data
    pub rgb: Vec<u8>,
    /// Presentation timestamp in 90 kHz units, strictly increasing
    pub pts: u64,
    /// Wall-clock span this frame covers
    pub duration: Duration,
}

/// One 20 ms audio quantum, mono s16 at 48 kHz
#[derive(Debug, Clone)]
pub struct AudioSample {
    pub samples: Vec<i16>,
    /// Presentation timestamp in samples, strictly increasing
    pub pts: u64,
}
