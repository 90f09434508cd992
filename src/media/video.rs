//! Self-healing RTSP video source.
//!
//! `next_frame` never fails. Decode errors are absorbed by substituting the
//! last good frame (or a black frame when none exists yet), and a run of
//! consecutive failures triggers one reconnection attempt. From the second
//! reconnection attempt onward the source switches to low-bitrate mode:
//! half resolution and one delivered frame out of every three. When the
//! reconnect budget is spent the source stays alive serving substitutes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::backoff::BackoffPolicy;
use crate::capture::{CaptureFactory, Pixels, RawVideoFrame, VideoCapture};
use crate::config::StreamType;

use super::{VideoSample, BLANK_HEIGHT, BLANK_WIDTH, VIDEO_CLOCK_RATE};

/// Frames skipped per delivered frame in low-bitrate mode
const LOW_BITRATE_DIVIDER: u32 = 3;

#[derive(Clone)]
struct CachedFrame {
    width: u32,
    height: u32,
    rgb: Vec<u8>,
}

/// Video source for one RTSP stream
pub struct RtspVideoSource {
    url: String,
    stream_type: StreamType,
    factory: Arc<dyn CaptureFactory>,
    backoff: BackoffPolicy,
    error_threshold: u32,

    capture: Option<Box<dyn VideoCapture>>,
    fps: f64,
    frame_interval: Duration,

    consecutive_errors: u32,
    reconnect_attempts: u32,
    exhausted: bool,
    low_bitrate: bool,

    last_good: Option<CachedFrame>,
    pts: u64,
    next_due: Option<Instant>,
    stopped: Arc<AtomicBool>,
}

impl RtspVideoSource {
    /// Create a source. No connection is made until [`open`](Self::open).
    ///
    /// A `Sub` stream starts in low-bitrate mode from the first frame.
    pub fn new(
        url: String,
        stream_type: StreamType,
        factory: Arc<dyn CaptureFactory>,
        backoff: BackoffPolicy,
        error_threshold: u32,
        stopped: Arc<AtomicBool>,
    ) -> Self {
        Self {
            url,
            stream_type,
            factory,
            backoff,
            error_threshold,
            capture: None,
            fps: 25.0,
            frame_interval: Duration::from_millis(40),
            consecutive_errors: 0,
            reconnect_attempts: 0,
            exhausted: false,
            low_bitrate: stream_type == StreamType::Sub,
            last_good: None,
            pts: 0,
            next_due: None,
            stopped,
        }
    }

    /// Connect to the camera. A failed open is routed into the
    /// reconnection path instead of being surfaced.
    pub async fn open(&mut self) {
        match self
            .factory
            .open_video(&self.url, self.stream_type)
            .await
        {
            Ok(capture) => self.adopt(capture),
            Err(e) => {
                tracing::warn!(error = %e, "initial video open failed");
                self.reconnect().await;
            }
        }
    }

    /// Produce the next frame, paced to the delivery interval.
    pub async fn next_frame(&mut self) -> VideoSample {
        let divider = if self.low_bitrate { LOW_BITRATE_DIVIDER } else { 1 };
        let interval = self
            .frame_interval
            .saturating_mul(divider)
            .max(Duration::from_millis(1));

        self.pace(interval).await;

        // In low-bitrate mode the capture still runs at native rate;
        // drain the frames we are not going to deliver. Failed drains
        // count toward the error threshold like any other read.
        for _ in 1..divider {
            if let Some(capture) = self.capture.as_mut() {
                if capture.read().await.is_err() {
                    self.consecutive_errors += 1;
                }
            }
        }

        let (width, height, rgb) = self.acquire().await;

        let pts = self.pts;
        let ticks = (VIDEO_CLOCK_RATE as f64 / self.fps).round() as u64 * divider as u64;
        self.pts += ticks.max(1);

        VideoSample {
            width,
            height,
            rgb,
            pts,
            duration: interval,
        }
    }

    /// Whether the source has dropped to low-bitrate delivery
    pub fn is_low_bitrate(&self) -> bool {
        self.low_bitrate
    }

    /// Reconnection attempts made so far
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    async fn pace(&mut self, interval: Duration) {
        let now = Instant::now();
        match self.next_due {
            Some(due) if due > now => {
                tokio::time::sleep_until(due).await;
                self.next_due = Some(due + interval);
            }
            _ => {
                // First frame or we fell behind; resync the schedule.
                self.next_due = Some(now + interval);
            }
        }
    }

    async fn acquire(&mut self) -> (u32, u32, Vec<u8>) {
        let result = match self.capture.as_mut() {
            Some(capture) => capture.read().await,
            None => Err(crate::Error::SourceConnection("not connected".to_string())),
        };

        match result {
            Ok(raw) => {
                self.consecutive_errors = 0;
                let (width, height, rgb) = self.normalize(raw);
                self.last_good = Some(CachedFrame {
                    width,
                    height,
                    rgb: rgb.clone(),
                });
                (width, height, rgb)
            }
            Err(e) => {
                self.consecutive_errors += 1;
                tracing::debug!(
                    error = %e,
                    consecutive = self.consecutive_errors,
                    "video read failed, substituting"
                );

                if self.consecutive_errors >= self.error_threshold && !self.exhausted {
                    tracing::warn!(
                        errors = self.consecutive_errors,
                        "video error threshold reached, reconnecting"
                    );
                    self.reconnect().await;
                    self.consecutive_errors = 0;
                }

                self.substitute()
            }
        }
    }

    /// One reconnection attempt against the budget for the current
    /// failure episode. A successful reconnect resets the budget;
    /// low-bitrate mode stays latched once entered.
    async fn reconnect(&mut self) {
        self.capture = None;

        if self.stopped.load(Ordering::SeqCst) || self.exhausted {
            return;
        }

        self.reconnect_attempts += 1;
        let attempt = self.reconnect_attempts;

        if !self.backoff.allows(attempt) {
            self.exhausted = true;
            tracing::warn!(
                attempts = attempt - 1,
                "reconnect budget exhausted, serving substitute frames"
            );
            return;
        }

        if attempt >= 2 && !self.low_bitrate {
            self.low_bitrate = true;
            tracing::info!("switching to low-bitrate delivery");
        }

        tokio::time::sleep(self.backoff.delay_for(attempt)).await;

        // Stop may have been requested while we slept
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        match self
            .factory
            .open_video(&self.url, self.stream_type)
            .await
        {
            Ok(capture) => {
                tracing::info!(attempt, "video source reconnected");
                self.adopt(capture);
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "video reconnect failed");
            }
        }
    }

    fn adopt(&mut self, capture: Box<dyn VideoCapture>) {
        let params = capture.params();
        if params.fps.is_finite() && params.fps > 0.0 {
            self.fps = params.fps;
            self.frame_interval = Duration::from_secs_f64(1.0 / params.fps);
        }
        self.capture = Some(capture);
        self.consecutive_errors = 0;
        // A live connection closes the failure episode; later failures
        // get a fresh retry budget.
        self.reconnect_attempts = 0;
        self.exhausted = false;
    }

    fn normalize(&self, raw: RawVideoFrame) -> (u32, u32, Vec<u8>) {
        let rgb = match raw.pixels {
            Pixels::Rgb24(data) => data,
            Pixels::Gray8(data) => {
                let mut rgb = Vec::with_capacity(data.len() * 3);
                for value in data {
                    rgb.extend_from_slice(&[value, value, value]);
                }
                rgb
            }
        };

        if self.low_bitrate {
            halve_resolution(raw.width, raw.height, &rgb)
        } else {
            (raw.width, raw.height, rgb)
        }
    }

    fn substitute(&self) -> (u32, u32, Vec<u8>) {
        match &self.last_good {
            Some(cached) => (cached.width, cached.height, cached.rgb.clone()),
            None => (
                BLANK_WIDTH,
                BLANK_HEIGHT,
                vec![0u8; (BLANK_WIDTH * BLANK_HEIGHT * 3) as usize],
            ),
        }
    }
}

/// Halve both dimensions, rounding down to even values (YUV encoders
/// require even geometry), sampling every other pixel.
fn halve_resolution(width: u32, height: u32, rgb: &[u8]) -> (u32, u32, Vec<u8>) {
    let new_width = ((width / 2) & !1).max(2);
    let new_height = ((height / 2) & !1).max(2);

    let mut out = Vec::with_capacity((new_width * new_height * 3) as usize);
    for y in 0..new_height {
        let src_y = (y * 2).min(height.saturating_sub(1)) as usize;
        for x in 0..new_width {
            let src_x = (x * 2).min(width.saturating_sub(1)) as usize;
            let idx = (src_y * width as usize + src_x) * 3;
            if idx + 3 <= rgb.len() {
                out.extend_from_slice(&rgb[idx..idx + 3]);
            } else {
                out.extend_from_slice(&[0, 0, 0]);
            }
        }
    }

    (new_width, new_height, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{AudioCapture, StreamInfo, VideoParams};
    use crate::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    enum ReadOutcome {
        Frame(RawVideoFrame),
        Fail,
    }

    struct ScriptedCapture {
        params: VideoParams,
        reads: VecDeque<ReadOutcome>,
    }

    #[async_trait]
    impl VideoCapture for ScriptedCapture {
        fn params(&self) -> VideoParams {
            self.params
        }

        async fn read(&mut self) -> Result<RawVideoFrame> {
            match self.reads.pop_front() {
                Some(ReadOutcome::Frame(f)) => Ok(f),
                _ => Err(crate::Error::Decode("scripted failure".to_string())),
            }
        }
    }

    enum OpenPlan {
        Succeed(Vec<ReadOutcome>),
        Fail,
    }

    struct ScriptedFactory {
        opens: AtomicU32,
        plan: Mutex<VecDeque<OpenPlan>>,
        fps: f64,
    }

    impl ScriptedFactory {
        fn new(plan: Vec<OpenPlan>, fps: f64) -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicU32::new(0),
                plan: Mutex::new(plan.into_iter().collect()),
                fps,
            })
        }

        fn open_count(&self) -> u32 {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CaptureFactory for ScriptedFactory {
        async fn open_video(
            &self,
            _url: &str,
            _stream_type: StreamType,
        ) -> Result<Box<dyn VideoCapture>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let plan = self.plan.lock().unwrap().pop_front();
            match plan {
                Some(OpenPlan::Succeed(reads)) => Ok(Box::new(ScriptedCapture {
                    params: VideoParams {
                        width: 640,
                        height: 480,
                        fps: self.fps,
                    },
                    reads: reads.into_iter().collect(),
                })),
                _ => Err(crate::Error::SourceConnection("scripted".to_string())),
            }
        }

        async fn open_audio(
            &self,
            _url: &str,
            _sample_rate: u32,
        ) -> Result<Box<dyn AudioCapture>> {
            Err(crate::Error::SourceConnection("no audio".to_string()))
        }

        async fn probe(&self, _url: &str) -> Result<StreamInfo> {
            Err(crate::Error::SourceConnection("no probe".to_string()))
        }
    }

    fn rgb_frame(width: u32, height: u32, value: u8) -> RawVideoFrame {
        RawVideoFrame {
            width,
            height,
            pixels: Pixels::Rgb24(vec![value; (width * height * 3) as usize]),
        }
    }

    fn many(n: usize, f: impl Fn() -> ReadOutcome) -> Vec<ReadOutcome> {
        (0..n).map(|_| f()).collect()
    }

    fn source_with(factory: Arc<ScriptedFactory>) -> RtspVideoSource {
        RtspVideoSource::new(
            "rtsp://cam.local/main".to_string(),
            StreamType::Main,
            factory,
            BackoffPolicy::default(),
            10,
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_frame_before_first_decode() {
        let factory = ScriptedFactory::new(vec![OpenPlan::Succeed(many(1, || ReadOutcome::Fail))], 25.0);
        let mut source = source_with(factory);
        source.open().await;

        let frame = source.next_frame().await;
        assert_eq!(frame.width, BLANK_WIDTH);
        assert_eq!(frame.height, BLANK_HEIGHT);
        assert!(frame.rgb.iter().all(|&b| b == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_frame_substituted_on_errors() {
        let mut reads = vec![ReadOutcome::Frame(rgb_frame(640, 480, 77))];
        reads.extend(many(9, || ReadOutcome::Fail));
        let factory = ScriptedFactory::new(vec![OpenPlan::Succeed(reads)], 25.0);
        let mut source = source_with(factory.clone());
        source.open().await;

        let first = source.next_frame().await;
        assert_eq!(first.rgb[0], 77);

        // Nine failures in a row all substitute the cached frame and
        // never trigger a reconnect.
        for _ in 0..9 {
            let frame = source.next_frame().await;
            assert_eq!(frame.width, 640);
            assert_eq!(frame.rgb[0], 77);
        }
        assert_eq!(factory.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tenth_failure_triggers_one_reconnect() {
        let factory = ScriptedFactory::new(
            vec![
                OpenPlan::Succeed(many(10, || ReadOutcome::Fail)),
                OpenPlan::Fail,
            ],
            25.0,
        );
        let mut source = source_with(factory.clone());
        source.open().await;

        for _ in 0..10 {
            source.next_frame().await;
        }
        assert_eq!(factory.open_count(), 2);
        assert_eq!(source.reconnect_attempts(), 1);
        assert!(!source.is_low_bitrate());
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_bitrate_after_second_reconnect() {
        // First reconnect attempt fails, so the episode escalates to a
        // second attempt and latches low-bitrate mode.
        let factory = ScriptedFactory::new(
            vec![
                OpenPlan::Succeed(many(10, || ReadOutcome::Fail)),
                OpenPlan::Fail,
                OpenPlan::Succeed(many(30, || ReadOutcome::Frame(rgb_frame(640, 480, 5)))),
            ],
            25.0,
        );
        let mut source = source_with(factory.clone());
        source.open().await;

        for _ in 0..20 {
            source.next_frame().await;
        }
        assert_eq!(factory.open_count(), 3);
        assert!(source.is_low_bitrate());

        let frame = source.next_frame().await;
        assert_eq!(frame.width, 320);
        assert_eq!(frame.height, 240);
        // Delivered cadence drops to a third of the native rate
        assert_eq!(frame.duration, Duration::from_millis(40) * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_resets_after_successful_reconnect() {
        // Two separate failure episodes, each resolved by a single
        // reconnect attempt. The budget is per episode, so the second
        // episode gets a fresh allowance and never escalates.
        let mut second = vec![ReadOutcome::Frame(rgb_frame(640, 480, 77))];
        second.extend(many(10, || ReadOutcome::Fail));
        let factory = ScriptedFactory::new(
            vec![
                OpenPlan::Succeed(many(10, || ReadOutcome::Fail)),
                OpenPlan::Succeed(second),
                OpenPlan::Succeed(many(5, || ReadOutcome::Frame(rgb_frame(640, 480, 9)))),
            ],
            25.0,
        );
        let mut source = source_with(factory.clone());
        source.open().await;

        for _ in 0..22 {
            source.next_frame().await;
        }
        assert_eq!(factory.open_count(), 3);
        assert_eq!(source.reconnect_attempts(), 0);
        assert!(!source.is_low_bitrate());

        let frame = source.next_frame().await;
        assert_eq!(frame.width, 640);
        assert_eq!(frame.rgb[0], 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pts_strictly_increasing_across_recovery() {
        let factory = ScriptedFactory::new(
            vec![
                OpenPlan::Succeed(many(10, || ReadOutcome::Fail)),
                OpenPlan::Succeed(many(10, || ReadOutcome::Fail)),
                OpenPlan::Succeed(many(10, || ReadOutcome::Frame(rgb_frame(640, 480, 5)))),
            ],
            25.0,
        );
        let mut source = source_with(factory);
        source.open().await;

        let mut last_pts = None;
        for _ in 0..25 {
            let frame = source.next_frame().await;
            if let Some(prev) = last_pts {
                assert!(frame.pts > prev, "pts must strictly increase");
            }
            last_pts = Some(frame.pts);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_leaves_source_alive() {
        // Every reconnect open fails; after the budget is spent the
        // source keeps producing substitute frames without reconnecting.
        let factory = ScriptedFactory::new(
            vec![OpenPlan::Succeed(many(60, || ReadOutcome::Fail))],
            25.0,
        );
        let mut source = source_with(factory.clone());
        source.open().await;

        for _ in 0..60 {
            let frame = source.next_frame().await;
            assert!(!frame.rgb.is_empty());
        }
        // Initial open plus at most max_attempts reconnect opens
        assert!(factory.open_count() <= 1 + BackoffPolicy::default().max_attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_flag_blocks_reconnect() {
        let factory = ScriptedFactory::new(
            vec![OpenPlan::Succeed(many(10, || ReadOutcome::Fail))],
            25.0,
        );
        let stopped = Arc::new(AtomicBool::new(false));
        let mut source = RtspVideoSource::new(
            "rtsp://cam.local/main".to_string(),
            StreamType::Main,
            factory.clone(),
            BackoffPolicy::default(),
            10,
            stopped.clone(),
        );
        source.open().await;

        stopped.store(true, Ordering::SeqCst);
        for _ in 0..10 {
            source.next_frame().await;
        }
        // Threshold was reached but the reconnect path saw the stop flag
        assert_eq!(factory.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_bitrate_drain_failures_count_toward_threshold() {
        // Three reads per delivered frame in low-bitrate mode; a dead
        // capture must not take three times as long to hit the threshold.
        let factory = ScriptedFactory::new(
            vec![
                OpenPlan::Succeed(many(40, || ReadOutcome::Fail)),
                OpenPlan::Succeed(many(10, || ReadOutcome::Frame(rgb_frame(640, 480, 3)))),
            ],
            25.0,
        );
        let mut source = RtspVideoSource::new(
            "rtsp://cam.local/sub".to_string(),
            StreamType::Sub,
            factory.clone(),
            BackoffPolicy::default(),
            10,
            Arc::new(AtomicBool::new(false)),
        );
        source.open().await;

        for _ in 0..4 {
            source.next_frame().await;
        }
        assert_eq!(factory.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_stream_starts_low_bitrate() {
        let factory = ScriptedFactory::new(
            vec![OpenPlan::Succeed(many(10, || {
                ReadOutcome::Frame(rgb_frame(640, 480, 9))
            }))],
            25.0,
        );
        let mut source = RtspVideoSource::new(
            "rtsp://cam.local/sub".to_string(),
            StreamType::Sub,
            factory,
            BackoffPolicy::default(),
            10,
            Arc::new(AtomicBool::new(false)),
        );
        source.open().await;

        assert!(source.is_low_bitrate());
        let frame = source.next_frame().await;
        assert_eq!(frame.width, 320);
    }

    #[test]
    fn test_halve_resolution_rounds_to_even() {
        let rgb = vec![1u8; 638 * 478 * 3];
        let (w, h, out) = halve_resolution(638, 478, &rgb);
        assert_eq!(w, 318);
        assert_eq!(h, 238);
        assert_eq!(out.len(), (w * h * 3) as usize);
    }

    #[test]
    fn test_gray_replication() {
        let factory = ScriptedFactory::new(vec![], 25.0);
        let source = source_with(factory);
        let raw = RawVideoFrame {
            width: 2,
            height: 1,
            pixels: Pixels::Gray8(vec![10, 20]),
        };
        let (w, h, rgb) = source.normalize(raw);
        assert_eq!((w, h), (2, 1));
        assert_eq!(rgb, vec![10, 10, 10, 20, 20, 20]);
    }
}
