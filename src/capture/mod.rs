//! Capture layer: opening RTSP streams and pulling raw frames.
//!
//! The gateway talks to cameras through the traits in this module. The
//! FFmpeg-backed implementation requires native libraries and is gated
//! behind the `ffmpeg` feature; everything above this seam runs without it.

use async_trait::async_trait;
use serde::Serialize;

use crate::config::StreamType;
use crate::{Error, Result};

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegCaptureFactory;

/// Properties of an opened video stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    /// Native frame rate in frames per second
    pub fps: f64,
}

/// Properties of an opened audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Result of probing an RTSP URL without starting a session
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub has_audio: bool,
}

/// Pixel data of a decoded frame
#[derive(Debug, Clone)]
pub enum Pixels {
    /// Packed RGB, 3 bytes per pixel
    Rgb24(Vec<u8>),
    /// Single-channel grayscale, 1 byte per pixel
    Gray8(Vec<u8>),
}

/// A decoded video frame as it comes off the wire
#[derive(Debug, Clone)]
pub struct RawVideoFrame {
    pub width: u32,
    pub height: u32,
    pub pixels: Pixels,
}

/// An open video stream
#[async_trait]
pub trait VideoCapture: Send {
    /// Stream properties discovered at open
    fn params(&self) -> VideoParams;

    /// Decode the next frame
    async fn read(&mut self) -> Result<RawVideoFrame>;
}

/// An open audio stream, resampled to mono s16 at the requested rate
#[async_trait]
pub trait AudioCapture: Send {
    /// Stream properties discovered at open
    fn params(&self) -> AudioParams;

    /// Read exactly `samples` mono s16 samples
    async fn read(&mut self, samples: usize) -> Result<Vec<i16>>;
}

/// Opens captures for RTSP URLs
#[async_trait]
pub trait CaptureFactory: Send + Sync {
    /// Open the video stream of `url`
    async fn open_video(
        &self,
        url: &str,
        stream_type: StreamType,
    ) -> Result<Box<dyn VideoCapture>>;

    /// Open the audio stream of `url`, resampled to `sample_rate` mono s16
    async fn open_audio(&self, url: &str, sample_rate: u32) -> Result<Box<dyn AudioCapture>>;

    /// Connect briefly and report stream properties
    async fn probe(&self, url: &str) -> Result<StreamInfo>;
}

/// Stand-in factory for builds without the `ffmpeg` feature.
///
/// Every operation fails with a source connection error, so the signaling
/// surface stays up and reports the missing backend instead of panicking.
pub struct DisabledCaptureFactory;

#[async_trait]
impl CaptureFactory for DisabledCaptureFactory {
    async fn open_video(
        &self,
        _url: &str,
        _stream_type: StreamType,
    ) -> Result<Box<dyn VideoCapture>> {
        Err(Error::SourceConnection(
            "capture backend requires the 'ffmpeg' feature".to_string(),
        ))
    }

    async fn open_audio(&self, _url: &str, _sample_rate: u32) -> Result<Box<dyn AudioCapture>> {
        Err(Error::SourceConnection(
            "capture backend requires the 'ffmpeg' feature".to_string(),
        ))
    }

    async fn probe(&self, _url: &str) -> Result<StreamInfo> {
        Err(Error::SourceConnection(
            "capture backend requires the 'ffmpeg' feature".to_string(),
        ))
    }
}
