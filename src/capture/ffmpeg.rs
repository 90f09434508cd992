//! FFmpeg-backed RTSP capture.
//!
//! Connects to cameras over RTSP using FFmpeg's native protocol support.
//! Each open capture spawns a dedicated worker thread that owns all FFmpeg
//! state; FFmpeg contexts are not Send/Sync, but callers are async tasks.
//! RTSP runs over TCP with a 5 second socket timeout so a dead camera
//! fails the open instead of hanging it.

use std::ffi::CString;
use std::ptr;
use std::sync::mpsc;
use std::thread;

use async_trait::async_trait;

use crate::config::StreamType;
use crate::{Error, Result};

use super::{
    AudioCapture, AudioParams, CaptureFactory, Pixels, RawVideoFrame, StreamInfo, VideoCapture,
    VideoParams,
};

/// Minimal FFI surface over the FFmpeg libraries linked in by ac-ffmpeg.
/// Complex struct access goes through ac-ffmpeg's ffw_* wrapper symbols.
mod ffi {
    #![allow(dead_code)]
    #![allow(non_camel_case_types)]

    use std::os::raw::{c_char, c_int, c_uint, c_void};

    pub const AVMEDIA_TYPE_VIDEO: c_int = 0;
    pub const AVMEDIA_TYPE_AUDIO: c_int = 1;

    pub const AV_PIX_FMT_RGB24: c_int = 2;
    pub const AV_PIX_FMT_GRAY8: c_int = 8;

    pub const AV_SAMPLE_FMT_S16: c_int = 1;

    pub const AV_CH_LAYOUT_MONO: i64 = 0x4;

    pub const SWS_BILINEAR: c_int = 2;

    pub const AVERROR_EOF: c_int = fferrtag(b'E', b'O', b'F', b' ');
    pub const AVERROR_EAGAIN: c_int = -11;

    const fn fferrtag(a: u8, b: u8, c: u8, d: u8) -> c_int {
        -((a as c_int) | ((b as c_int) << 8) | ((c as c_int) << 16) | ((d as c_int) << 24))
    }

    pub enum AVCodec {}
    pub enum AVCodecContext {}
    pub enum AVCodecParameters {}
    pub enum AVDictionary {}
    pub enum AVFrame {}
    pub enum SwrContext {}
    pub enum SwsContext {}

    #[repr(C)]
    pub struct AVRational {
        pub num: c_int,
        pub den: c_int,
    }

    // Partial layouts for the leading fields we read directly.
    #[repr(C)]
    pub struct AVFormatContext {
        pub av_class: *const c_void,
        pub iformat: *const c_void,
        pub oformat: *const c_void,
        pub priv_data: *mut c_void,
        pub pb: *mut c_void,
        pub ctx_flags: c_int,
        pub nb_streams: c_uint,
        pub streams: *mut *mut AVStream,
    }

    #[repr(C)]
    pub struct AVStream {
        pub av_class: *const c_void,
        pub index: c_int,
        pub id: c_int,
        pub codecpar: *mut AVCodecParameters,
    }

    #[repr(C)]
    pub struct AVPacket {
        pub buf: *mut c_void,
        pub pts: i64,
        pub dts: i64,
        pub data: *mut u8,
        pub size: c_int,
        pub stream_index: c_int,
    }

    #[link(name = "avformat")]
    extern "C" {
        pub fn avformat_open_input(
            ps: *mut *mut AVFormatContext,
            url: *const c_char,
            fmt: *const c_void,
            options: *mut *mut AVDictionary,
        ) -> c_int;
        pub fn avformat_close_input(s: *mut *mut AVFormatContext);
        pub fn avformat_find_stream_info(
            ic: *mut AVFormatContext,
            options: *mut *mut AVDictionary,
        ) -> c_int;
        pub fn av_find_best_stream(
            ic: *mut AVFormatContext,
            media_type: c_int,
            wanted_stream: c_int,
            related_stream: c_int,
            decoder: *mut *const AVCodec,
            flags: c_int,
        ) -> c_int;
        pub fn av_read_frame(s: *mut AVFormatContext, pkt: *mut AVPacket) -> c_int;
        pub fn av_guess_frame_rate(
            ctx: *mut AVFormatContext,
            stream: *mut AVStream,
            frame: *mut AVFrame,
        ) -> AVRational;
    }

    #[link(name = "avcodec")]
    extern "C" {
        pub fn avcodec_alloc_context3(codec: *const AVCodec) -> *mut AVCodecContext;
        pub fn avcodec_free_context(avctx: *mut *mut AVCodecContext);
        pub fn avcodec_parameters_to_context(
            codec: *mut AVCodecContext,
            par: *const AVCodecParameters,
        ) -> c_int;
        pub fn avcodec_open2(
            avctx: *mut AVCodecContext,
            codec: *const AVCodec,
            options: *mut *mut AVDictionary,
        ) -> c_int;
        pub fn avcodec_send_packet(avctx: *mut AVCodecContext, pkt: *const AVPacket) -> c_int;
        pub fn avcodec_receive_frame(avctx: *mut AVCodecContext, frame: *mut AVFrame) -> c_int;
    }

    #[link(name = "avutil")]
    extern "C" {
        pub fn av_strerror(errnum: c_int, errbuf: *mut c_char, errbuf_size: usize) -> c_int;
        pub fn av_dict_set(
            pm: *mut *mut AVDictionary,
            key: *const c_char,
            value: *const c_char,
            flags: c_int,
        ) -> c_int;
        pub fn av_dict_free(m: *mut *mut AVDictionary);
        pub fn av_packet_alloc() -> *mut AVPacket;
        pub fn av_packet_free(pkt: *mut *mut AVPacket);
        pub fn av_packet_unref(pkt: *mut AVPacket);
        pub fn av_frame_alloc() -> *mut AVFrame;
        pub fn av_frame_free(frame: *mut *mut AVFrame);
        pub fn av_frame_unref(frame: *mut AVFrame);
        pub fn av_opt_set_int(
            obj: *mut c_void,
            name: *const c_char,
            val: i64,
            search_flags: c_int,
        ) -> c_int;
        pub fn av_opt_set_sample_fmt(
            obj: *mut c_void,
            name: *const c_char,
            fmt: c_int,
            search_flags: c_int,
        ) -> c_int;
    }

    #[link(name = "swscale")]
    extern "C" {
        pub fn sws_getContext(
            src_w: c_int,
            src_h: c_int,
            src_format: c_int,
            dst_w: c_int,
            dst_h: c_int,
            dst_format: c_int,
            flags: c_int,
            src_filter: *mut c_void,
            dst_filter: *mut c_void,
            param: *const f64,
        ) -> *mut SwsContext;
        pub fn sws_freeContext(ctx: *mut SwsContext);
        pub fn sws_scale(
            ctx: *mut SwsContext,
            src_slice: *const *const u8,
            src_stride: *const c_int,
            src_slice_y: c_int,
            src_slice_h: c_int,
            dst: *const *mut u8,
            dst_stride: *const c_int,
        ) -> c_int;
    }

    #[link(name = "swresample")]
    extern "C" {
        pub fn swr_alloc() -> *mut SwrContext;
        pub fn swr_free(s: *mut *mut SwrContext);
        pub fn swr_init(s: *mut SwrContext) -> c_int;
        pub fn swr_convert(
            s: *mut SwrContext,
            out: *mut *mut u8,
            out_count: c_int,
            inp: *const *const u8,
            in_count: c_int,
        ) -> c_int;
    }

    // Accessors exported by ac-ffmpeg's wrapper library.
    extern "C" {
        pub fn ffw_frame_get_width(frame: *const AVFrame) -> c_int;
        pub fn ffw_frame_get_height(frame: *const AVFrame) -> c_int;
        pub fn ffw_frame_get_format(frame: *const AVFrame) -> c_int;
        pub fn ffw_frame_get_nb_samples(frame: *const AVFrame) -> c_int;
        pub fn ffw_frame_get_sample_rate(frame: *const AVFrame) -> c_int;
        pub fn ffw_frame_get_plane_data(frame: *const AVFrame, plane: c_int) -> *const u8;
        pub fn ffw_frame_get_line_size(frame: *const AVFrame, plane: usize) -> usize;
        pub fn ffw_frame_get_channel_layout(frame: *const AVFrame) -> i64;
        pub fn ffw_codec_parameters_get_width(params: *const AVCodecParameters) -> c_int;
        pub fn ffw_codec_parameters_get_height(params: *const AVCodecParameters) -> c_int;
        pub fn ffw_codec_parameters_get_sample_rate(params: *const AVCodecParameters) -> c_int;
    }

    pub fn av_err_str(errnum: c_int) -> String {
        let mut buf = [0i8; 256];
        unsafe {
            av_strerror(errnum, buf.as_mut_ptr(), buf.len());
            std::ffi::CStr::from_ptr(buf.as_ptr())
                .to_string_lossy()
                .into_owned()
        }
    }
}

fn set_rtsp_options(options: &mut *mut ffi::AVDictionary) {
    // CString::new on literals cannot fail
    let pairs = [("rtsp_transport", "tcp"), ("stimeout", "5000000")];
    for (key, value) in pairs {
        if let (Ok(k), Ok(v)) = (CString::new(key), CString::new(value)) {
            unsafe {
                ffi::av_dict_set(options, k.as_ptr(), v.as_ptr(), 0);
            }
        }
    }
}

/// Open the input and run find_stream_info. Caller owns the returned context.
fn open_input(url: &str) -> std::result::Result<*mut ffi::AVFormatContext, String> {
    let c_url = CString::new(url).map_err(|_| "invalid URL encoding".to_string())?;

    unsafe {
        let mut options: *mut ffi::AVDictionary = ptr::null_mut();
        set_rtsp_options(&mut options);

        let mut format_ctx: *mut ffi::AVFormatContext = ptr::null_mut();
        let ret =
            ffi::avformat_open_input(&mut format_ctx, c_url.as_ptr(), ptr::null(), &mut options);
        ffi::av_dict_free(&mut options);

        if ret < 0 {
            return Err(format!("failed to open stream: {}", ffi::av_err_str(ret)));
        }

        let ret = ffi::avformat_find_stream_info(format_ctx, ptr::null_mut());
        if ret < 0 {
            ffi::avformat_close_input(&mut format_ctx);
            return Err(format!(
                "failed to read stream info: {}",
                ffi::av_err_str(ret)
            ));
        }

        Ok(format_ctx)
    }
}

/// Locate the best stream of `media_type` and open a decoder for it.
fn open_decoder(
    format_ctx: *mut ffi::AVFormatContext,
    media_type: i32,
) -> std::result::Result<(i32, *mut ffi::AVStream, *mut ffi::AVCodecContext), String> {
    unsafe {
        let mut decoder: *const ffi::AVCodec = ptr::null();
        let stream_index =
            ffi::av_find_best_stream(format_ctx, media_type, -1, -1, &mut decoder, 0);
        if stream_index < 0 || decoder.is_null() {
            return Err("no matching stream found".to_string());
        }

        let stream = *(*format_ctx).streams.offset(stream_index as isize);
        if stream.is_null() || (*stream).codecpar.is_null() {
            return Err("stream has no codec parameters".to_string());
        }

        let codec_ctx = ffi::avcodec_alloc_context3(decoder);
        if codec_ctx.is_null() {
            return Err("failed to allocate codec context".to_string());
        }

        let ret = ffi::avcodec_parameters_to_context(codec_ctx, (*stream).codecpar);
        if ret < 0 {
            ffi::avcodec_free_context(&mut (codec_ctx as *mut _));
            return Err(format!("failed to copy codec params: {}", ffi::av_err_str(ret)));
        }

        let ret = ffi::avcodec_open2(codec_ctx, decoder, ptr::null_mut());
        if ret < 0 {
            ffi::avcodec_free_context(&mut (codec_ctx as *mut _));
            return Err(format!("failed to open codec: {}", ffi::av_err_str(ret)));
        }

        Ok((stream_index, stream, codec_ctx))
    }
}

enum WorkerCommand {
    NextFrame,
    Stop,
}

enum VideoResponse {
    Frame(RawVideoFrame),
    Error(String),
}

enum AudioResponse {
    Samples(Vec<i16>),
    Error(String),
}

struct VideoWorkerState {
    format_ctx: *mut ffi::AVFormatContext,
    codec_ctx: *mut ffi::AVCodecContext,
    stream_index: i32,
    packet: *mut ffi::AVPacket,
    frame: *mut ffi::AVFrame,
    sws_ctx: *mut ffi::SwsContext,
    sws_dims: (i32, i32, i32),
    width: u32,
    height: u32,
}

// FFmpeg pointers never leave the worker thread.
unsafe impl Send for VideoWorkerState {}

impl Drop for VideoWorkerState {
    fn drop(&mut self) {
        unsafe {
            if !self.sws_ctx.is_null() {
                ffi::sws_freeContext(self.sws_ctx);
            }
            if !self.packet.is_null() {
                ffi::av_packet_free(&mut self.packet);
            }
            if !self.frame.is_null() {
                ffi::av_frame_free(&mut self.frame);
            }
            if !self.codec_ctx.is_null() {
                ffi::avcodec_free_context(&mut self.codec_ctx);
            }
            if !self.format_ctx.is_null() {
                ffi::avformat_close_input(&mut self.format_ctx);
            }
        }
    }
}

fn video_worker_init(url: &str) -> std::result::Result<(VideoWorkerState, VideoParams), String> {
    let format_ctx = open_input(url)?;
    let (stream_index, stream, codec_ctx) =
        match open_decoder(format_ctx, ffi::AVMEDIA_TYPE_VIDEO) {
            Ok(v) => v,
            Err(e) => {
                unsafe { ffi::avformat_close_input(&mut (format_ctx as *mut _)) };
                return Err(e);
            }
        };

    unsafe {
        let codecpar = (*stream).codecpar;
        let width = ffi::ffw_codec_parameters_get_width(codecpar) as u32;
        let height = ffi::ffw_codec_parameters_get_height(codecpar) as u32;

        let rate = ffi::av_guess_frame_rate(format_ctx, stream, ptr::null_mut());
        let fps = if rate.num > 0 && rate.den > 0 {
            rate.num as f64 / rate.den as f64
        } else {
            25.0
        };

        let packet = ffi::av_packet_alloc();
        let frame = ffi::av_frame_alloc();
        if packet.is_null() || frame.is_null() {
            ffi::avcodec_free_context(&mut (codec_ctx as *mut _));
            ffi::avformat_close_input(&mut (format_ctx as *mut _));
            return Err("failed to allocate packet/frame".to_string());
        }

        let state = VideoWorkerState {
            format_ctx,
            codec_ctx,
            stream_index,
            packet,
            frame,
            sws_ctx: ptr::null_mut(),
            sws_dims: (0, 0, -1),
            width,
            height,
        };
        let params = VideoParams { width, height, fps };
        Ok((state, params))
    }
}

fn video_decode_next(state: &mut VideoWorkerState) -> std::result::Result<RawVideoFrame, String> {
    unsafe {
        loop {
            let ret = ffi::av_read_frame(state.format_ctx, state.packet);
            if ret < 0 {
                return Err(format!("read error: {}", ffi::av_err_str(ret)));
            }

            if (*state.packet).stream_index != state.stream_index {
                ffi::av_packet_unref(state.packet);
                continue;
            }

            let ret = ffi::avcodec_send_packet(state.codec_ctx, state.packet);
            ffi::av_packet_unref(state.packet);
            if ret < 0 {
                continue;
            }

            let ret = ffi::avcodec_receive_frame(state.codec_ctx, state.frame);
            if ret == ffi::AVERROR_EAGAIN {
                continue;
            }
            if ret < 0 {
                return Err(format!("decode error: {}", ffi::av_err_str(ret)));
            }

            let width = ffi::ffw_frame_get_width(state.frame);
            let height = ffi::ffw_frame_get_height(state.frame);
            let format = ffi::ffw_frame_get_format(state.frame);
            if width <= 0 || height <= 0 {
                ffi::av_frame_unref(state.frame);
                continue;
            }

            // Rebuild the scaler if the decoder output geometry changed
            if state.sws_dims != (width, height, format) {
                if !state.sws_ctx.is_null() {
                    ffi::sws_freeContext(state.sws_ctx);
                }
                state.sws_ctx = ffi::sws_getContext(
                    width,
                    height,
                    format,
                    width,
                    height,
                    ffi::AV_PIX_FMT_RGB24,
                    ffi::SWS_BILINEAR,
                    ptr::null_mut(),
                    ptr::null_mut(),
                    ptr::null(),
                );
                if state.sws_ctx.is_null() {
                    ffi::av_frame_unref(state.frame);
                    return Err("failed to create pixel format converter".to_string());
                }
                state.sws_dims = (width, height, format);
                state.width = width as u32;
                state.height = height as u32;
            }

            let mut rgb = vec![0u8; width as usize * height as usize * 3];
            let src_planes: [*const u8; 4] = [
                ffi::ffw_frame_get_plane_data(state.frame, 0),
                ffi::ffw_frame_get_plane_data(state.frame, 1),
                ffi::ffw_frame_get_plane_data(state.frame, 2),
                ptr::null(),
            ];
            let src_strides: [i32; 4] = [
                ffi::ffw_frame_get_line_size(state.frame, 0) as i32,
                ffi::ffw_frame_get_line_size(state.frame, 1) as i32,
                ffi::ffw_frame_get_line_size(state.frame, 2) as i32,
                0,
            ];
            let dst_planes: [*mut u8; 1] = [rgb.as_mut_ptr()];
            let dst_strides: [i32; 1] = [width * 3];

            let ret = ffi::sws_scale(
                state.sws_ctx,
                src_planes.as_ptr(),
                src_strides.as_ptr(),
                0,
                height,
                dst_planes.as_ptr(),
                dst_strides.as_ptr(),
            );
            ffi::av_frame_unref(state.frame);

            if ret <= 0 {
                return Err("pixel format conversion failed".to_string());
            }

            return Ok(RawVideoFrame {
                width: width as u32,
                height: height as u32,
                pixels: Pixels::Rgb24(rgb),
            });
        }
    }
}

fn video_worker_main(
    url: String,
    cmd_rx: mpsc::Receiver<WorkerCommand>,
    resp_tx: mpsc::Sender<VideoResponse>,
    init_tx: mpsc::Sender<std::result::Result<VideoParams, String>>,
) {
    let mut state = match video_worker_init(&url) {
        Ok((state, params)) => {
            let _ = init_tx.send(Ok(params));
            state
        }
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };
    drop(init_tx);

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            WorkerCommand::NextFrame => match video_decode_next(&mut state) {
                Ok(frame) => {
                    let _ = resp_tx.send(VideoResponse::Frame(frame));
                }
                Err(e) => {
                    let _ = resp_tx.send(VideoResponse::Error(e));
                }
            },
            WorkerCommand::Stop => break,
        }
    }
}

/// Video capture backed by an FFmpeg worker thread
pub struct FfmpegVideoCapture {
    cmd_tx: mpsc::Sender<WorkerCommand>,
    resp_rx: mpsc::Receiver<VideoResponse>,
    worker_handle: Option<thread::JoinHandle<()>>,
    params: VideoParams,
}

#[async_trait]
impl VideoCapture for FfmpegVideoCapture {
    fn params(&self) -> VideoParams {
        self.params
    }

    async fn read(&mut self) -> Result<RawVideoFrame> {
        if self.cmd_tx.send(WorkerCommand::NextFrame).is_err() {
            return Err(Error::SourceConnection("capture worker exited".to_string()));
        }

        let response = tokio::task::block_in_place(|| self.resp_rx.recv());
        match response {
            Ok(VideoResponse::Frame(frame)) => Ok(frame),
            Ok(VideoResponse::Error(e)) => Err(Error::Decode(e)),
            Err(_) => Err(Error::SourceConnection("capture worker exited".to_string())),
        }
    }
}

impl Drop for FfmpegVideoCapture {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WorkerCommand::Stop);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

struct AudioWorkerState {
    format_ctx: *mut ffi::AVFormatContext,
    codec_ctx: *mut ffi::AVCodecContext,
    stream_index: i32,
    packet: *mut ffi::AVPacket,
    frame: *mut ffi::AVFrame,
    swr_ctx: *mut ffi::SwrContext,
    target_rate: u32,
}

unsafe impl Send for AudioWorkerState {}

impl Drop for AudioWorkerState {
    fn drop(&mut self) {
        unsafe {
            if !self.swr_ctx.is_null() {
                ffi::swr_free(&mut self.swr_ctx);
            }
            if !self.packet.is_null() {
                ffi::av_packet_free(&mut self.packet);
            }
            if !self.frame.is_null() {
                ffi::av_frame_free(&mut self.frame);
            }
            if !self.codec_ctx.is_null() {
                ffi::avcodec_free_context(&mut self.codec_ctx);
            }
            if !self.format_ctx.is_null() {
                ffi::avformat_close_input(&mut self.format_ctx);
            }
        }
    }
}

fn audio_worker_init(
    url: &str,
    target_rate: u32,
) -> std::result::Result<(AudioWorkerState, AudioParams), String> {
    let format_ctx = open_input(url)?;
    let (stream_index, stream, codec_ctx) =
        match open_decoder(format_ctx, ffi::AVMEDIA_TYPE_AUDIO) {
            Ok(v) => v,
            Err(e) => {
                unsafe { ffi::avformat_close_input(&mut (format_ctx as *mut _)) };
                return Err(e);
            }
        };

    unsafe {
        let source_rate = ffi::ffw_codec_parameters_get_sample_rate((*stream).codecpar) as u32;

        let packet = ffi::av_packet_alloc();
        let frame = ffi::av_frame_alloc();
        if packet.is_null() || frame.is_null() {
            ffi::avcodec_free_context(&mut (codec_ctx as *mut _));
            ffi::avformat_close_input(&mut (format_ctx as *mut _));
            return Err("failed to allocate packet/frame".to_string());
        }

        let state = AudioWorkerState {
            format_ctx,
            codec_ctx,
            stream_index,
            packet,
            frame,
            // The resampler is configured lazily from the first decoded
            // frame, which carries the authoritative sample format.
            swr_ctx: ptr::null_mut(),
            target_rate,
        };
        let params = AudioParams {
            sample_rate: source_rate,
            channels: 1,
        };
        Ok((state, params))
    }
}

fn audio_build_resampler(
    state: &mut AudioWorkerState,
) -> std::result::Result<(), String> {
    unsafe {
        let in_rate = ffi::ffw_frame_get_sample_rate(state.frame) as i64;
        let in_layout = ffi::ffw_frame_get_channel_layout(state.frame);
        let in_format = ffi::ffw_frame_get_format(state.frame);

        let swr = ffi::swr_alloc();
        if swr.is_null() {
            return Err("failed to allocate resampler".to_string());
        }

        let set_int = |name: &str, val: i64| {
            if let Ok(c_name) = CString::new(name) {
                ffi::av_opt_set_int(swr as *mut _, c_name.as_ptr(), val, 0);
            }
        };
        set_int("in_channel_layout", in_layout);
        set_int("in_sample_rate", in_rate);
        set_int("out_channel_layout", ffi::AV_CH_LAYOUT_MONO);
        set_int("out_sample_rate", state.target_rate as i64);
        if let (Ok(in_fmt), Ok(out_fmt)) =
            (CString::new("in_sample_fmt"), CString::new("out_sample_fmt"))
        {
            ffi::av_opt_set_sample_fmt(swr as *mut _, in_fmt.as_ptr(), in_format, 0);
            ffi::av_opt_set_sample_fmt(swr as *mut _, out_fmt.as_ptr(), ffi::AV_SAMPLE_FMT_S16, 0);
        }

        let ret = ffi::swr_init(swr);
        if ret < 0 {
            ffi::swr_free(&mut (swr as *mut _));
            return Err(format!("failed to init resampler: {}", ffi::av_err_str(ret)));
        }

        state.swr_ctx = swr;
        Ok(())
    }
}

fn audio_decode_next(state: &mut AudioWorkerState) -> std::result::Result<Vec<i16>, String> {
    unsafe {
        loop {
            let ret = ffi::av_read_frame(state.format_ctx, state.packet);
            if ret < 0 {
                return Err(format!("read error: {}", ffi::av_err_str(ret)));
            }

            if (*state.packet).stream_index != state.stream_index {
                ffi::av_packet_unref(state.packet);
                continue;
            }

            let ret = ffi::avcodec_send_packet(state.codec_ctx, state.packet);
            ffi::av_packet_unref(state.packet);
            if ret < 0 {
                continue;
            }

            let ret = ffi::avcodec_receive_frame(state.codec_ctx, state.frame);
            if ret == ffi::AVERROR_EAGAIN {
                continue;
            }
            if ret < 0 {
                return Err(format!("decode error: {}", ffi::av_err_str(ret)));
            }

            let nb_samples = ffi::ffw_frame_get_nb_samples(state.frame);
            if nb_samples <= 0 {
                ffi::av_frame_unref(state.frame);
                continue;
            }

            if state.swr_ctx.is_null() {
                if let Err(e) = audio_build_resampler(state) {
                    ffi::av_frame_unref(state.frame);
                    return Err(e);
                }
            }

            let in_rate = ffi::ffw_frame_get_sample_rate(state.frame).max(1) as u64;
            let out_cap =
                (nb_samples as u64 * state.target_rate as u64 / in_rate + 256) as usize;
            let mut out: Vec<i16> = vec![0; out_cap];

            let layout = ffi::ffw_frame_get_channel_layout(state.frame);
            let channels = if layout != 0 {
                (layout as u64).count_ones() as usize
            } else {
                1
            };
            let mut in_ptrs: Vec<*const u8> = Vec::with_capacity(channels.max(1));
            for ch in 0..channels.max(1) {
                in_ptrs.push(ffi::ffw_frame_get_plane_data(state.frame, ch as i32));
            }

            let mut out_ptr = out.as_mut_ptr() as *mut u8;
            let converted = ffi::swr_convert(
                state.swr_ctx,
                &mut out_ptr,
                out_cap as i32,
                in_ptrs.as_ptr(),
                nb_samples,
            );
            ffi::av_frame_unref(state.frame);

            if converted < 0 {
                return Err(format!("resample error: {}", ffi::av_err_str(converted)));
            }
            if converted == 0 {
                continue;
            }

            out.truncate(converted as usize);
            return Ok(out);
        }
    }
}

fn audio_worker_main(
    url: String,
    target_rate: u32,
    cmd_rx: mpsc::Receiver<WorkerCommand>,
    resp_tx: mpsc::Sender<AudioResponse>,
    init_tx: mpsc::Sender<std::result::Result<AudioParams, String>>,
) {
    let mut state = match audio_worker_init(&url, target_rate) {
        Ok((state, params)) => {
            let _ = init_tx.send(Ok(params));
            state
        }
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };
    drop(init_tx);

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            WorkerCommand::NextFrame => match audio_decode_next(&mut state) {
                Ok(samples) => {
                    let _ = resp_tx.send(AudioResponse::Samples(samples));
                }
                Err(e) => {
                    let _ = resp_tx.send(AudioResponse::Error(e));
                }
            },
            WorkerCommand::Stop => break,
        }
    }
}

/// Audio capture backed by an FFmpeg worker thread.
///
/// The worker hands back variably sized decoded chunks; a local buffer
/// carries the remainder so `read` can return exact quanta.
pub struct FfmpegAudioCapture {
    cmd_tx: mpsc::Sender<WorkerCommand>,
    resp_rx: mpsc::Receiver<AudioResponse>,
    worker_handle: Option<thread::JoinHandle<()>>,
    params: AudioParams,
    buffer: Vec<i16>,
}

#[async_trait]
impl AudioCapture for FfmpegAudioCapture {
    fn params(&self) -> AudioParams {
        self.params
    }

    async fn read(&mut self, samples: usize) -> Result<Vec<i16>> {
        while self.buffer.len() < samples {
            if self.cmd_tx.send(WorkerCommand::NextFrame).is_err() {
                return Err(Error::SourceConnection("capture worker exited".to_string()));
            }
            let response = tokio::task::block_in_place(|| self.resp_rx.recv());
            match response {
                Ok(AudioResponse::Samples(chunk)) => self.buffer.extend_from_slice(&chunk),
                Ok(AudioResponse::Error(e)) => return Err(Error::Decode(e)),
                Err(_) => {
                    return Err(Error::SourceConnection("capture worker exited".to_string()))
                }
            }
        }

        let rest = self.buffer.split_off(samples);
        Ok(std::mem::replace(&mut self.buffer, rest))
    }
}

impl Drop for FfmpegAudioCapture {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WorkerCommand::Stop);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Opens FFmpeg-backed captures for RTSP URLs
pub struct FfmpegCaptureFactory;

#[async_trait]
impl CaptureFactory for FfmpegCaptureFactory {
    async fn open_video(
        &self,
        url: &str,
        stream_type: StreamType,
    ) -> Result<Box<dyn VideoCapture>> {
        tracing::debug!(?stream_type, "opening video capture");

        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (resp_tx, resp_rx) = mpsc::channel();
        let (init_tx, init_rx) = mpsc::channel();

        let worker_url = url.to_string();
        let worker_handle = thread::spawn(move || {
            video_worker_main(worker_url, cmd_rx, resp_tx, init_tx);
        });

        let params = tokio::task::spawn_blocking(move || init_rx.recv())
            .await
            .map_err(|e| Error::SourceConnection(format!("init task failed: {e}")))?
            .map_err(|_| Error::SourceConnection("capture worker died during init".to_string()))?
            .map_err(Error::SourceConnection)?;

        Ok(Box::new(FfmpegVideoCapture {
            cmd_tx,
            resp_rx,
            worker_handle: Some(worker_handle),
            params,
        }))
    }

    async fn open_audio(&self, url: &str, sample_rate: u32) -> Result<Box<dyn AudioCapture>> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (resp_tx, resp_rx) = mpsc::channel();
        let (init_tx, init_rx) = mpsc::channel();

        let worker_url = url.to_string();
        let worker_handle = thread::spawn(move || {
            audio_worker_main(worker_url, sample_rate, cmd_rx, resp_tx, init_tx);
        });

        let params = tokio::task::spawn_blocking(move || init_rx.recv())
            .await
            .map_err(|e| Error::SourceConnection(format!("init task failed: {e}")))?
            .map_err(|_| Error::SourceConnection("capture worker died during init".to_string()))?
            .map_err(Error::SourceConnection)?;

        Ok(Box::new(FfmpegAudioCapture {
            cmd_tx,
            resp_rx,
            worker_handle: Some(worker_handle),
            params,
            buffer: Vec::new(),
        }))
    }

    async fn probe(&self, url: &str) -> Result<StreamInfo> {
        let url = url.to_string();
        tokio::task::spawn_blocking(move || probe_sync(&url))
            .await
            .map_err(|e| Error::SourceConnection(format!("probe task failed: {e}")))?
    }
}

fn probe_sync(url: &str) -> Result<StreamInfo> {
    let mut format_ctx = open_input(url).map_err(Error::SourceConnection)?;

    unsafe {
        let mut info: Option<StreamInfo> = None;
        let mut has_audio = false;

        let mut decoder: *const ffi::AVCodec = ptr::null();
        let video_index = ffi::av_find_best_stream(
            format_ctx,
            ffi::AVMEDIA_TYPE_VIDEO,
            -1,
            -1,
            &mut decoder,
            0,
        );
        if video_index >= 0 {
            let stream = *(*format_ctx).streams.offset(video_index as isize);
            if !stream.is_null() && !(*stream).codecpar.is_null() {
                let codecpar = (*stream).codecpar;
                let rate = ffi::av_guess_frame_rate(format_ctx, stream, ptr::null_mut());
                let fps = if rate.num > 0 && rate.den > 0 {
                    rate.num as f64 / rate.den as f64
                } else {
                    25.0
                };
                info = Some(StreamInfo {
                    width: ffi::ffw_codec_parameters_get_width(codecpar) as u32,
                    height: ffi::ffw_codec_parameters_get_height(codecpar) as u32,
                    fps,
                    has_audio: false,
                });
            }
        }

        let mut audio_decoder: *const ffi::AVCodec = ptr::null();
        let audio_index = ffi::av_find_best_stream(
            format_ctx,
            ffi::AVMEDIA_TYPE_AUDIO,
            -1,
            -1,
            &mut audio_decoder,
            0,
        );
        if audio_index >= 0 {
            has_audio = true;
        }

        ffi::avformat_close_input(&mut format_ctx);

        match info {
            Some(mut info) => {
                info.has_audio = has_audio;
                Ok(info)
            }
            None => Err(Error::SourceConnection("no video stream found".to_string())),
        }
    }
}
