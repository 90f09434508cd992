//! A single viewer session: one peer connection fed by one camera.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::capture::CaptureFactory;
use crate::config::{GatewayConfig, StreamType};
use crate::media::encoder::{AudioEncoder, VideoEncoder};
use crate::media::{
    RtspAudioSource, RtspVideoSource, AUDIO_FRAME_DURATION, AUDIO_SAMPLE_RATE, VIDEO_CLOCK_RATE,
};
use crate::{Error, Result};

/// Called when a session reaches a terminal ICE state and must be reaped
pub(crate) type TerminalCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// One viewer session.
///
/// Cleanup runs through [`close`](Session::close) and nowhere else. The
/// ICE callback, an explicit stop and the supervisor sweep can all race
/// into it; the `closed` swap guarantees teardown happens once.
pub struct Session {
    pub id: String,
    pub rtsp_url: String,
    pub stream_type: StreamType,
    pub created_at: Instant,

    pc: Arc<RTCPeerConnection>,
    ice_state: Arc<RwLock<RTCIceConnectionState>>,
    closed: AtomicBool,
    stop_flag: Arc<AtomicBool>,
    low_bitrate: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    video_track: Arc<TrackLocalStaticSample>,
    audio_track: Option<Arc<TrackLocalStaticSample>>,
}

impl Session {
    /// Build the peer connection, register tracks and negotiate the
    /// answer. Every awaited negotiation step runs under the configured
    /// deadline. On any failure the peer connection is closed before the
    /// error is returned.
    pub(crate) async fn create(
        id: String,
        offer_sdp: String,
        rtsp_url: String,
        stream_type: StreamType,
        has_audio: bool,
        config: &GatewayConfig,
        on_terminal: TerminalCallback,
    ) -> Result<(Arc<Session>, String)> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        // No configured servers means host candidates only
        let rtc_config = if config.ice_servers.is_empty() {
            RTCConfiguration::default()
        } else {
            RTCConfiguration {
                ice_servers: vec![RTCIceServer {
                    urls: config.ice_servers.clone(),
                    ..Default::default()
                }],
                ..Default::default()
            }
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
            "video".to_owned(),
            format!("camera-{id}"),
        ));
        pc.add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let audio_track = if has_audio {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: AUDIO_SAMPLE_RATE,
                    channels: 1,
                    ..Default::default()
                },
                "audio".to_owned(),
                format!("camera-{id}"),
            ));
            pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            Some(track)
        } else {
            None
        };

        let session = Arc::new(Session {
            id: id.clone(),
            rtsp_url,
            stream_type,
            created_at: Instant::now(),
            pc: Arc::clone(&pc),
            ice_state: Arc::new(RwLock::new(RTCIceConnectionState::New)),
            closed: AtomicBool::new(false),
            stop_flag: Arc::new(AtomicBool::new(false)),
            low_bitrate: Arc::new(AtomicBool::new(stream_type == StreamType::Sub)),
            tasks: Mutex::new(Vec::new()),
            video_track,
            audio_track,
        });

        session.install_ice_handler(config.disconnect_grace(), on_terminal);

        let answer_sdp = match negotiate(&pc, offer_sdp, config.negotiation_timeout()).await {
            Ok(sdp) => sdp,
            Err(e) => {
                let _ = pc.close().await;
                return Err(e);
            }
        };

        Ok((session, answer_sdp))
    }

    fn install_ice_handler(self: &Arc<Self>, grace: Duration, on_terminal: TerminalCallback) {
        let ice_state = Arc::clone(&self.ice_state);
        let session_id = self.id.clone();

        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let ice_state = Arc::clone(&ice_state);
                let session_id = session_id.clone();
                let on_terminal = Arc::clone(&on_terminal);

                Box::pin(async move {
                    tracing::debug!(session_id = %session_id, ?state, "ICE connection state changed");
                    *ice_state.write().await = state;

                    match state {
                        RTCIceConnectionState::Failed | RTCIceConnectionState::Closed => {
                            on_terminal(&session_id);
                        }
                        RTCIceConnectionState::Disconnected => {
                            // Transient drops often recover; re-check
                            // after the grace period before tearing down.
                            tokio::spawn(async move {
                                if still_disconnected_after(&ice_state, grace).await {
                                    tracing::info!(
                                        session_id = %session_id,
                                        "ICE still disconnected after grace period"
                                    );
                                    on_terminal(&session_id);
                                }
                            });
                        }
                        _ => {}
                    }
                })
            }));
    }

    /// Start the media pump tasks feeding the negotiated tracks.
    pub(crate) async fn start_media(
        self: &Arc<Self>,
        config: &GatewayConfig,
        factory: Arc<dyn CaptureFactory>,
    ) {
        let video_source = RtspVideoSource::new(
            self.rtsp_url.clone(),
            self.stream_type,
            Arc::clone(&factory),
            config.backoff,
            config.error_threshold,
            Arc::clone(&self.stop_flag),
        );
        let video_handle = tokio::spawn(video_pump(
            video_source,
            Arc::clone(&self.video_track),
            Arc::clone(&self.low_bitrate),
            Arc::clone(&self.stop_flag),
            self.id.clone(),
        ));

        let mut tasks = self.tasks.lock().await;
        tasks.push(video_handle);

        if let Some(audio_track) = &self.audio_track {
            let audio_source = RtspAudioSource::new(
                self.rtsp_url.clone(),
                Arc::clone(&factory),
                config.backoff,
                Arc::clone(&self.stop_flag),
            );
            tasks.push(tokio::spawn(audio_pump(
                audio_source,
                Arc::clone(audio_track),
                Arc::clone(&self.stop_flag),
                self.id.clone(),
            )));
        }
    }

    /// Current ICE connection state
    pub async fn ice_state(&self) -> RTCIceConnectionState {
        *self.ice_state.read().await
    }

    /// Whether the video source has degraded to low-bitrate delivery
    pub fn is_low_bitrate(&self) -> bool {
        self.low_bitrate.load(Ordering::Relaxed)
    }

    /// Whether close() has already run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear the session down. Idempotent and safe to call concurrently;
    /// only the first caller does any work.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.stop_flag.store(true, Ordering::SeqCst);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in &tasks {
            task.abort();
        }

        if let Err(e) = self.pc.close().await {
            tracing::debug!(session_id = %self.id, error = %e, "peer connection close failed");
        }

        tracing::info!(session_id = %self.id, "session closed");
    }
}

/// Wait out the disconnection grace period, then report whether the
/// connection is still down. Any state change away from `Disconnected`
/// during the wait spares the session.
async fn still_disconnected_after(
    ice_state: &Arc<RwLock<RTCIceConnectionState>>,
    grace: Duration,
) -> bool {
    tokio::time::sleep(grace).await;
    *ice_state.read().await == RTCIceConnectionState::Disconnected
}

/// Run one negotiation step under a deadline
async fn step<T, F>(limit: Duration, what: &'static str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, webrtc::Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::Negotiation(format!("{what}: {e}"))),
        Err(_) => Err(Error::Timeout(what.to_string())),
    }
}

/// Offer in, complete answer out. Waits for ICE gathering so the answer
/// carries all candidates (no trickle).
async fn negotiate(
    pc: &Arc<RTCPeerConnection>,
    offer_sdp: String,
    limit: Duration,
) -> Result<String> {
    let offer = RTCSessionDescription::offer(offer_sdp)?;
    step(limit, "remote description", pc.set_remote_description(offer)).await?;

    let answer = step(limit, "answer creation", pc.create_answer(None)).await?;

    let mut gather_complete = pc.gathering_complete_promise().await;
    step(limit, "local description", pc.set_local_description(answer)).await?;

    if tokio::time::timeout(limit, gather_complete.recv())
        .await
        .is_err()
    {
        return Err(Error::Timeout("ICE gathering".to_string()));
    }

    let local = pc
        .local_description()
        .await
        .ok_or_else(|| Error::Negotiation("no local description after gathering".to_string()))?;

    Ok(local.sdp)
}

async fn video_pump(
    mut source: RtspVideoSource,
    track: Arc<TrackLocalStaticSample>,
    low_bitrate: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    session_id: String,
) {
    source.open().await;

    let mut encoder = match VideoEncoder::new() {
        Ok(encoder) => encoder,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "video encoder unavailable");
            return;
        }
    };

    let mut codec_warned = false;
    let mut last_dims = (0u32, 0u32);

    while !stopped.load(Ordering::SeqCst) {
        let frame = source.next_frame().await;
        low_bitrate.store(source.is_low_bitrate(), Ordering::Relaxed);

        // Resolution changes (low-bitrate switch) need a fresh IDR
        if (frame.width, frame.height) != last_dims {
            if last_dims != (0, 0) {
                encoder.force_keyframe();
            }
            last_dims = (frame.width, frame.height);
        }

        match encoder.encode(&frame) {
            Ok(encoded) => {
                let sample = Sample {
                    data: encoded.data.into(),
                    duration: frame.duration,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    tracing::debug!(session_id = %session_id, error = %e, "video write_sample failed");
                }
            }
            Err(e) => {
                if !codec_warned {
                    tracing::warn!(session_id = %session_id, error = %e, "video frames not delivered");
                    codec_warned = true;
                }
            }
        }
    }
}

async fn audio_pump(
    mut source: RtspAudioSource,
    track: Arc<TrackLocalStaticSample>,
    stopped: Arc<AtomicBool>,
    session_id: String,
) {
    source.open().await;

    let mut encoder = match AudioEncoder::new() {
        Ok(encoder) => encoder,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "audio encoder unavailable");
            return;
        }
    };

    while !stopped.load(Ordering::SeqCst) {
        let quantum = source.next_frame().await;
        match encoder.encode(&quantum.samples) {
            Ok(packet) => {
                let sample = Sample {
                    data: packet.into(),
                    duration: AUDIO_FRAME_DURATION,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    tracing::debug!(session_id = %session_id, error = %e, "audio write_sample failed");
                }
            }
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "audio encode failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_reaps_connection_still_down() {
        let state = Arc::new(RwLock::new(RTCIceConnectionState::Disconnected));
        assert!(still_disconnected_after(&state, Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_spares_recovered_connection() {
        let state = Arc::new(RwLock::new(RTCIceConnectionState::Disconnected));

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                still_disconnected_after(&state, Duration::from_secs(5)).await
            })
        };

        // Recovery lands inside the grace window
        tokio::time::sleep(Duration::from_secs(2)).await;
        *state.write().await = RTCIceConnectionState::Connected;

        assert!(!waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_treats_terminal_state_as_not_disconnected() {
        // Failed during the wait is handled by its own callback arm;
        // the re-check must not fire a second teardown for it.
        let state = Arc::new(RwLock::new(RTCIceConnectionState::Failed));
        assert!(!still_disconnected_after(&state, Duration::from_secs(5)).await);
    }
}
