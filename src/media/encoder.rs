//! Track encoders.
//!
//! Audio always encodes to Opus (pure Rust backend). H.264 video requires
//! native libraries and is gated behind the `h264` feature; without it
//! `encode` reports the missing codec and the session keeps running with
//! the track negotiated but unfed.

use crate::{Error, Result};

use super::{VideoSample, AUDIO_SAMPLE_RATE};

/// One encoded video access unit, Annex B format
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub is_keyframe: bool,
}

/// H.264 encoder for the video track
pub struct VideoEncoder {
    #[cfg(feature = "h264")]
    inner: openh264::encoder::Encoder,
}

impl VideoEncoder {
    #[cfg(feature = "h264")]
    pub fn new() -> Result<Self> {
        let inner = openh264::encoder::Encoder::new()
            .map_err(|e| Error::Encoding(format!("failed to create H.264 encoder: {e}")))?;
        Ok(Self { inner })
    }

    #[cfg(not(feature = "h264"))]
    pub fn new() -> Result<Self> {
        Ok(Self {})
    }

    /// Encode one RGB24 frame. Dimensions may change between frames; the
    /// encoder picks them up from the buffer.
    #[cfg(feature = "h264")]
    pub fn encode(&mut self, frame: &VideoSample) -> Result<EncodedFrame> {
        use openh264::encoder::FrameType;
        use openh264::formats::YUVBuffer;

        let expected = (frame.width * frame.height * 3) as usize;
        if frame.rgb.len() != expected {
            return Err(Error::Encoding(format!(
                "frame size mismatch: expected {} bytes, got {}",
                expected,
                frame.rgb.len()
            )));
        }

        let yuv = rgb_to_yuv420(&frame.rgb, frame.width, frame.height);
        let buffer = YUVBuffer::from_vec(yuv, frame.width as usize, frame.height as usize);

        let bitstream = self
            .inner
            .encode(&buffer)
            .map_err(|e| Error::Encoding(format!("H.264 encode failed: {e}")))?;

        let is_keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);

        Ok(EncodedFrame {
            data: bitstream.to_vec(),
            is_keyframe,
        })
    }

    #[cfg(not(feature = "h264"))]
    pub fn encode(&mut self, _frame: &VideoSample) -> Result<EncodedFrame> {
        Err(Error::Encoding(
            "H.264 encoding requires the 'h264' feature flag".to_string(),
        ))
    }

    /// Request an IDR frame (e.g. after a resolution change)
    pub fn force_keyframe(&mut self) {
        #[cfg(feature = "h264")]
        self.inner.force_intra_frame();
    }
}

/// Opus encoder for the audio track
pub struct AudioEncoder {
    inner: opus::Encoder,
}

impl AudioEncoder {
    pub fn new() -> Result<Self> {
        let inner = opus::Encoder::new(
            AUDIO_SAMPLE_RATE,
            opus::Channels::Mono,
            opus::Application::Audio,
        )
        .map_err(|e| Error::Encoding(format!("failed to create Opus encoder: {e}")))?;
        Ok(Self { inner })
    }

    /// Encode one 20 ms quantum of mono s16 samples
    pub fn encode(&mut self, samples: &[i16]) -> Result<Vec<u8>> {
        self.inner
            .encode_vec(samples, 4000)
            .map_err(|e| Error::Encoding(format!("Opus encode failed: {e}")))
    }
}

/// Convert packed RGB24 to planar YUV420 (BT.601). Chroma planes are
/// sized with rounded-up halves so odd dimensions stay in bounds.
#[cfg_attr(not(feature = "h264"), allow(dead_code))]
fn rgb_to_yuv420(rgb: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;

    let chroma_w = (w + 1) / 2;
    let chroma_h = (h + 1) / 2;
    let y_size = w * h;
    let uv_size = chroma_w * chroma_h;
    let mut yuv = vec![0u8; y_size + uv_size * 2];

    let (y_plane, uv_planes) = yuv.split_at_mut(y_size);
    let (u_plane, v_plane) = uv_planes.split_at_mut(uv_size);

    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) * 3;
            let r = rgb[idx] as i32;
            let g = rgb[idx + 1] as i32;
            let b = rgb[idx + 2] as i32;

            let y_val = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
            y_plane[y * w + x] = y_val.clamp(0, 255) as u8;

            // Subsample chroma over 2x2 blocks
            if y % 2 == 0 && x % 2 == 0 {
                let uv_idx = (y / 2) * chroma_w + (x / 2);
                let u_val = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                let v_val = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                u_plane[uv_idx] = u_val.clamp(0, 255) as u8;
                v_plane[uv_idx] = v_val.clamp(0, 255) as u8;
            }
        }
    }

    yuv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::AUDIO_FRAME_SAMPLES;

    #[test]
    fn test_yuv420_buffer_size() {
        let rgb = vec![128u8; 640 * 480 * 3];
        let yuv = rgb_to_yuv420(&rgb, 640, 480);
        assert_eq!(yuv.len(), 640 * 480 * 3 / 2);
    }

    #[test]
    fn test_yuv420_handles_odd_dimensions() {
        // Cameras report odd native geometry; chroma planes must cover
        // the rounded-up half in each direction.
        let rgb = vec![200u8; 3 * 3 * 3];
        let yuv = rgb_to_yuv420(&rgb, 3, 3);
        assert_eq!(yuv.len(), 3 * 3 + 2 * 2 * 2);

        let rgb = vec![64u8; 639 * 480 * 3];
        let yuv = rgb_to_yuv420(&rgb, 639, 480);
        assert_eq!(yuv.len(), 639 * 480 + 2 * 320 * 240);
    }

    #[test]
    fn test_opus_encoder_produces_packets() {
        let mut encoder = AudioEncoder::new().unwrap();
        let quantum = vec![0i16; AUDIO_FRAME_SAMPLES];
        let packet = encoder.encode(&quantum).unwrap();
        assert!(!packet.is_empty());
    }

    #[cfg(not(feature = "h264"))]
    #[test]
    fn test_video_encode_requires_feature() {
        let mut encoder = VideoEncoder::new().unwrap();
        let frame = VideoSample {
            width: 2,
            height: 2,
            rgb: vec![0u8; 12],
            pts: 0,
            duration: std::time::Duration::from_millis(40),
        };
        assert!(matches!(
            encoder.encode(&frame),
            Err(Error::Encoding(_))
        ));
    }

    #[cfg(feature = "h264")]
    #[test]
    fn test_h264_first_frame_is_keyframe() {
        let mut encoder = VideoEncoder::new().unwrap();
        let frame = VideoSample {
            width: 640,
            height: 480,
            rgb: vec![128u8; 640 * 480 * 3],
            pts: 0,
            duration: std::time::Duration::from_millis(40),
        };
        let encoded = encoder.encode(&frame).unwrap();
        assert!(encoded.is_keyframe);
        assert!(
            encoded.data.starts_with(&[0x00, 0x00, 0x00, 0x01])
                || encoded.data.starts_with(&[0x00, 0x00, 0x01])
        );
    }
}
