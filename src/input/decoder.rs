/// 进程内FFmpeg解码器
/// In-process FFmpeg decoder (ez-ffmpeg)
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use ez_ffmpeg::core::context::null_output::create_null_output;
use ez_ffmpeg::filter::frame_pipeline_builder::FramePipelineBuilder;
use ez_ffmpeg::stream_info::{find_video_stream_info, StreamInfo};
use ez_ffmpeg::{AVMediaType, FfmpegContext, Input};
use tracing::{error, info, warn};

use super::decode_filter::DecodeFilter;
use super::{FrameSource, SourceFactory, SourceProperties};
use crate::error::{Result, StreamError};
use crate::frame::Frame;
use crate::process::AbortHandle;

#[derive(Debug, Clone)]
pub struct LibavSourceFactory {
    read_timeout: Duration,
}

impl LibavSourceFactory {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl SourceFactory for LibavSourceFactory {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(LibavSource::open(uri, self.read_timeout)?))
    }
}

fn probe(uri: &str) -> anyhow::Result<SourceProperties> {
    let info = find_video_stream_info(uri)
        .map_err(|e| anyhow!("探测失败: {}", e))?
        .ok_or_else(|| anyhow!("no video stream"))?;
    match info {
        StreamInfo::Video {
            width, height, fps, ..
        } if width > 0 && height > 0 => Ok(SourceProperties {
            width: width as u32,
            height: height as u32,
            fps,
        }),
        _ => Err(anyhow!("video stream has no geometry")),
    }
}

/// 解码线程: 构建FFmpeg上下文并阻塞到流结束
fn decode(uri: &str, filter: DecodeFilter, props: SourceProperties) -> anyhow::Result<()> {
    let pipe: FramePipelineBuilder = AVMediaType::AVMEDIA_TYPE_VIDEO.into();
    let pipe = pipe.filter("decode", Box::new(filter));
    let out = create_null_output().add_frame_pipeline(pipe);

    let mut input = Input::new(uri);
    if uri.to_ascii_lowercase().starts_with("rtsp") {
        input = input.set_input_opts(
            [
                ("rtsp_transport", "tcp"),
                ("buffer_size", "67108864"),
                ("rtsp_flags", "prefer_tcp"),
            ]
            .into(),
        );
    }

    let scale = format!("scale={}:{},format=yuv420p", props.width, props.height);
    let ctx = FfmpegContext::builder()
        .input(input)
        .filter_desc(scale.as_str())
        .output(out)
        .build()
        .map_err(|e| anyhow!("构建失败: {}", e))?;

    let sch = ctx.start().map_err(|e| anyhow!("启动失败: {}", e))?;
    let _ = sch.wait();
    Ok(())
}

struct DecodeThread {
    frames: Receiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// ez-ffmpeg帧源
pub struct LibavSource {
    uri: String,
    props: SourceProperties,
    read_timeout: Duration,
    thread: Option<DecodeThread>,
    aborted: Arc<AtomicBool>,
}

impl LibavSource {
    pub fn open(uri: &str, read_timeout: Duration) -> Result<Self> {
        let props = probe(uri).map_err(|e| {
            StreamError::Unavailable(format!("failed to open stream {}: {:#}", uri, e))
        })?;
        info!("📹 流已打开: {} ({}x{} @ {:.2}fps)", uri, props.width, props.height, props.fps);

        let mut source = Self {
            uri: uri.to_string(),
            props,
            read_timeout,
            thread: None,
            aborted: Arc::new(AtomicBool::new(false)),
        };
        source
            .spawn_thread()
            .map_err(|e| StreamError::Unavailable(format!("{:#}", e)))?;
        Ok(source)
    }

    fn spawn_thread(&mut self) -> anyhow::Result<()> {
        let (tx, frames) = crossbeam_channel::bounded(2);
        let stop = Arc::new(AtomicBool::new(false));
        let filter = DecodeFilter::new(tx, Arc::clone(&stop), self.props.width, self.props.height);
        let uri = self.uri.clone();
        let props = self.props;
        let handle = thread::Builder::new()
            .name("libav-decode".to_string())
            .spawn(move || {
                if let Err(e) = decode(&uri, filter, props) {
                    error!("❌ 解码失败: {:#}", e);
                }
            })
            .context("failed to spawn decode thread")?;
        self.thread = Some(DecodeThread {
            frames,
            stop,
            handle: Some(handle),
        });
        Ok(())
    }

    fn stop_thread(&mut self) {
        if let Some(mut t) = self.thread.take() {
            t.stop.store(true, Ordering::SeqCst);
            drop(t.frames);
            // 流挂起时FFmpeg不会回调滤镜, 不阻塞等待
            if let Some(handle) = t.handle.take() {
                if handle.is_finished() {
                    let _ = handle.join();
                } else {
                    warn!("⚠️ 解码线程仍在运行, 等待其自行退出");
                }
            }
        }
    }
}

impl FrameSource for LibavSource {
    fn properties(&self) -> SourceProperties {
        self.props
    }

    fn read_frame(&mut self) -> Option<Frame> {
        if self.aborted.load(Ordering::SeqCst) {
            return None;
        }
        if self.thread.is_none() {
            info!("🔄 重新拉流: {}", self.uri);
            if let Err(e) = self.spawn_thread() {
                warn!("⚠️ 解码线程启动失败: {:#}", e);
                return None;
            }
        }
        let frames = &self.thread.as_ref()?.frames;
        match frames.recv_timeout(self.read_timeout) {
            Ok(data) => Frame::new(self.props.width, self.props.height, data).ok(),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.stop_thread();
                None
            }
        }
    }

    fn close(&mut self) {
        self.stop_thread();
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        let aborted = Arc::clone(&self.aborted);
        let stop = self.thread.as_ref().map(|t| Arc::clone(&t.stop));
        Some(AbortHandle::new(move || {
            aborted.store(true, Ordering::SeqCst);
            if let Some(stop) = &stop {
                stop.store(true, Ordering::SeqCst);
            }
        }))
    }
}

impl Drop for LibavSource {
    fn drop(&mut self) {
        self.stop_thread();
    }
}
