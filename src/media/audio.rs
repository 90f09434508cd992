//! Gapless RTSP audio source.
//!
//! Emits fixed 20 ms quanta of mono s16 at 48 kHz. Whenever the capture
//! cannot supply samples the quantum is silence instead; pts advances by
//! exactly one quantum per call either way, so the track timeline never
//! gaps or jumps. A source whose retry budget is spent disables itself
//! and generates silence for the rest of the session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time::Instant;

use crate::backoff::BackoffPolicy;
use crate::capture::{AudioCapture, CaptureFactory};

use super::{AudioSample, AUDIO_FRAME_DURATION, AUDIO_FRAME_SAMPLES, AUDIO_SAMPLE_RATE};

/// Audio source for one RTSP stream
pub struct RtspAudioSource {
    url: String,
    factory: Arc<dyn CaptureFactory>,
    backoff: BackoffPolicy,

    capture: Option<Box<dyn AudioCapture>>,
    enabled: bool,
    open_failures: u32,
    /// Earliest time the next reopen may run; retry delays are charged
    /// against the 20 ms cadence instead of sleeping, keeping pts gapless.
    next_retry_at: Option<Instant>,

    /// Running timestamp in samples at 48 kHz
    pts: u64,
    next_due: Option<Instant>,
    stopped: Arc<AtomicBool>,
}

impl RtspAudioSource {
    pub fn new(
        url: String,
        factory: Arc<dyn CaptureFactory>,
        backoff: BackoffPolicy,
        stopped: Arc<AtomicBool>,
    ) -> Self {
        Self {
            url,
            factory,
            backoff,
            capture: None,
            enabled: true,
            open_failures: 0,
            next_retry_at: None,
            pts: 0,
            next_due: None,
            stopped,
        }
    }

    /// Connect to the camera's audio stream. Failure counts against the
    /// retry budget; the source keeps producing silence either way.
    pub async fn open(&mut self) {
        if let Err(e) = self.try_open().await {
            tracing::warn!(error = %e, "initial audio open failed");
        }
    }

    /// Whether the source is still trying to deliver real audio
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Produce the next 20 ms quantum. Never fails; pts always advances
    /// by exactly one quantum.
    pub async fn next_frame(&mut self) -> AudioSample {
        self.pace().await;

        let samples = if self.enabled {
            self.acquire().await
        } else {
            silence()
        };

        let sample = AudioSample {
            samples,
            pts: self.pts,
        };
        self.pts += AUDIO_FRAME_SAMPLES as u64;
        sample
    }

    async fn pace(&mut self) {
        let now = Instant::now();
        match self.next_due {
            Some(due) if due > now => {
                tokio::time::sleep_until(due).await;
                self.next_due = Some(due + AUDIO_FRAME_DURATION);
            }
            _ => {
                self.next_due = Some(now + AUDIO_FRAME_DURATION);
            }
        }
    }

    async fn acquire(&mut self) -> Vec<i16> {
        if self.capture.is_none() {
            let due = self
                .next_retry_at
                .map_or(true, |at| Instant::now() >= at);
            if due && !self.stopped.load(Ordering::SeqCst) {
                if let Err(e) = self.try_open().await {
                    tracing::debug!(error = %e, "audio reopen failed");
                }
            }
        }

        match self.capture.as_mut() {
            Some(capture) => match capture.read(AUDIO_FRAME_SAMPLES).await {
                Ok(mut samples) => {
                    samples.resize(AUDIO_FRAME_SAMPLES, 0);
                    samples
                }
                Err(e) => {
                    tracing::debug!(error = %e, "audio read failed, substituting silence");
                    self.capture = None;
                    self.record_failure();
                    silence()
                }
            },
            None => silence(),
        }
    }

    async fn try_open(&mut self) -> crate::Result<()> {
        match self
            .factory
            .open_audio(&self.url, AUDIO_SAMPLE_RATE)
            .await
        {
            Ok(capture) => {
                tracing::info!("audio source connected");
                self.capture = Some(capture);
                self.next_retry_at = None;
                Ok(())
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    fn record_failure(&mut self) {
        self.open_failures += 1;
        if !self.backoff.allows(self.open_failures) {
            if self.enabled {
                tracing::warn!(
                    failures = self.open_failures,
                    "audio retry budget exhausted, track goes silent"
                );
            }
            self.enabled = false;
            return;
        }
        self.next_retry_at =
            Some(Instant::now() + self.backoff.delay_for(self.open_failures));
    }
}

fn silence() -> Vec<i16> {
    vec![0i16; AUDIO_FRAME_SAMPLES]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{AudioParams, StreamInfo, VideoCapture};
    use crate::config::StreamType;
    use crate::Result;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct ToneCapture {
        fail_after: Option<usize>,
        reads: usize,
    }

    #[async_trait]
    impl AudioCapture for ToneCapture {
        fn params(&self) -> AudioParams {
            AudioParams {
                sample_rate: AUDIO_SAMPLE_RATE,
                channels: 1,
            }
        }

        async fn read(&mut self, samples: usize) -> Result<Vec<i16>> {
            if let Some(limit) = self.fail_after {
                if self.reads >= limit {
                    return Err(crate::Error::Decode("scripted failure".to_string()));
                }
            }
            self.reads += 1;
            Ok(vec![1000i16; samples])
        }
    }

    struct ToneFactory {
        opens: AtomicU32,
        open_ok: bool,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl CaptureFactory for ToneFactory {
        async fn open_video(
            &self,
            _url: &str,
            _stream_type: StreamType,
        ) -> Result<Box<dyn VideoCapture>> {
            Err(crate::Error::SourceConnection("no video".to_string()))
        }

        async fn open_audio(
            &self,
            _url: &str,
            _sample_rate: u32,
        ) -> Result<Box<dyn AudioCapture>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.open_ok {
                Ok(Box::new(ToneCapture {
                    fail_after: self.fail_after,
                    reads: 0,
                }))
            } else {
                Err(crate::Error::SourceConnection("scripted".to_string()))
            }
        }

        async fn probe(&self, _url: &str) -> Result<StreamInfo> {
            Err(crate::Error::SourceConnection("no probe".to_string()))
        }
    }

    fn source(factory: Arc<ToneFactory>) -> RtspAudioSource {
        RtspAudioSource::new(
            "rtsp://cam.local/main".to_string(),
            factory,
            BackoffPolicy::default(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_quanta_are_fixed_size_with_gapless_pts() {
        let factory = Arc::new(ToneFactory {
            opens: AtomicU32::new(0),
            open_ok: true,
            fail_after: None,
        });
        let mut src = source(factory);
        src.open().await;

        let mut expected_pts = 0u64;
        for _ in 0..10 {
            let quantum = src.next_frame().await;
            assert_eq!(quantum.samples.len(), AUDIO_FRAME_SAMPLES);
            assert_eq!(quantum.pts, expected_pts);
            expected_pts += AUDIO_FRAME_SAMPLES as u64;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_when_capture_unavailable() {
        let factory = Arc::new(ToneFactory {
            opens: AtomicU32::new(0),
            open_ok: false,
            fail_after: None,
        });
        let mut src = source(factory);
        src.open().await;

        let mut expected_pts = 0u64;
        for _ in 0..5 {
            let quantum = src.next_frame().await;
            assert!(quantum.samples.iter().all(|&s| s == 0));
            assert_eq!(quantum.pts, expected_pts);
            expected_pts += AUDIO_FRAME_SAMPLES as u64;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_disables_source() {
        let factory = Arc::new(ToneFactory {
            opens: AtomicU32::new(0),
            open_ok: false,
            fail_after: None,
        });
        let mut src = source(factory.clone());
        src.open().await;

        // Enough quanta for the retry deadlines (1s + 2s + 3s) to pass
        for _ in 0..400 {
            src.next_frame().await;
        }

        assert!(!src.is_enabled());
        // Initial open plus the budgeted reopens, nothing after that
        let policy = BackoffPolicy::default();
        assert!(factory.opens.load(Ordering::SeqCst) <= policy.max_attempts + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_stream_failure_substitutes_silence() {
        let factory = Arc::new(ToneFactory {
            opens: AtomicU32::new(0),
            open_ok: true,
            fail_after: Some(3),
        });
        let mut src = source(factory);
        src.open().await;

        let mut last_pts = None;
        for i in 0..8 {
            let quantum = src.next_frame().await;
            assert_eq!(quantum.samples.len(), AUDIO_FRAME_SAMPLES);
            if i < 3 {
                assert_eq!(quantum.samples[0], 1000);
            }
            if let Some(prev) = last_pts {
                assert!(quantum.pts > prev);
            }
            last_pts = Some(quantum.pts);
        }
    }
}
