/// ffmpeg子进程解码器
/// Subprocess decoder: ffprobe probe + ffmpeg rawvideo pipe
use std::io::Read;
use std::path::PathBuf;
use std::process::{ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{FrameSource, SourceFactory, SourceProperties};
use crate::error::{Result, StreamError};
use crate::frame::Frame;
use crate::process::{run_with_timeout, AbortHandle, ManagedChild};

/// 解码帧队列深度 (读线程 → 泵线程)
const FRAME_QUEUE: usize = 2;

/// 解码器设置
#[derive(Debug, Clone)]
pub struct DecoderSettings {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub probe_timeout: Duration,
    pub read_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            probe_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessSourceFactory {
    settings: DecoderSettings,
}

impl ProcessSourceFactory {
    pub fn new(settings: DecoderSettings) -> Self {
        Self { settings }
    }
}

impl SourceFactory for ProcessSourceFactory {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>> {
        let source = ProcessSource::open(uri, self.settings.clone())?;
        Ok(Box::new(source))
    }
}

// ========== ffprobe ==========

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
}

/// "30000/1001" → 29.97; "0/0" → None
fn parse_rate(rate: &str) -> Option<f64> {
    let (num, den) = match rate.split_once('/') {
        Some((n, d)) => (n.trim().parse::<f64>().ok()?, d.trim().parse::<f64>().ok()?),
        None => (rate.trim().parse::<f64>().ok()?, 1.0),
    };
    if den <= 0.0 || num <= 0.0 {
        return None;
    }
    Some(num / den)
}

/// 解析 `ffprobe -of json` 输出
pub fn parse_probe(json: &[u8]) -> anyhow::Result<SourceProperties> {
    let output: ProbeOutput = serde_json::from_slice(json).context("invalid ffprobe json")?;
    let stream = output
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no video stream"))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => bail!("video stream has no geometry"),
    };

    // avg_frame_rate 对直播流常为 0/0, 退回 r_frame_rate
    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate))
        .unwrap_or(0.0);

    Ok(SourceProperties { width, height, fps })
}

fn is_rtsp(uri: &str) -> bool {
    uri.to_ascii_lowercase().starts_with("rtsp")
}

fn probe(uri: &str, settings: &DecoderSettings) -> anyhow::Result<SourceProperties> {
    let mut cmd = Command::new(&settings.ffprobe);
    cmd.args(["-v", "error"]);
    if is_rtsp(uri) {
        cmd.args(["-rtsp_transport", "tcp"]);
    }
    cmd.args([
        "-select_streams",
        "v:0",
        "-show_entries",
        "stream=width,height,avg_frame_rate,r_frame_rate",
        "-of",
        "json",
    ])
    .arg(uri);

    let (status, stdout) = run_with_timeout("ffprobe", &mut cmd, settings.probe_timeout)
        .with_context(|| format!("failed to run {}", settings.ffprobe.display()))?;
    if !status.success() {
        bail!("ffprobe exited with {}", status);
    }
    parse_probe(&stdout)
}

// ========== 解码子进程 ==========

struct DecoderProcess {
    child: ManagedChild,
    frames: Option<Receiver<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl DecoderProcess {
    fn spawn(uri: &str, props: &SourceProperties, settings: &DecoderSettings) -> anyhow::Result<Self> {
        let mut cmd = Command::new(&settings.ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"]);
        if is_rtsp(uri) {
            cmd.args(["-rtsp_transport", "tcp"]);
        }
        cmd.arg("-i")
            .arg(uri)
            .args(["-an", "-sn", "-f", "rawvideo", "-pix_fmt", "bgr24"])
            .arg("-s")
            .arg(format!("{}x{}", props.width, props.height))
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped());

        let mut child = ManagedChild::spawn("ffmpeg-decode", &mut cmd)
            .with_context(|| format!("failed to spawn {}", settings.ffmpeg.display()))?;
        let stdout = child
            .take_stdout()
            .ok_or_else(|| anyhow!("decoder stdout not captured"))?;

        let frame_len = Frame::byte_len(props.width, props.height);
        let (tx, rx) = crossbeam_channel::bounded(FRAME_QUEUE);
        let reader = thread::Builder::new()
            .name("decode-reader".to_string())
            .spawn(move || read_frames(stdout, frame_len, tx))
            .context("failed to spawn decode reader")?;

        Ok(Self {
            child,
            frames: Some(rx),
            reader: Some(reader),
        })
    }

    fn shutdown(mut self, grace: Duration) {
        // 先断开接收端, 读线程阻塞在send时会立即返回
        drop(self.frames.take());
        if let Err(e) = self.child.terminate(grace) {
            warn!("❌ 解码进程回收失败: {}", e);
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// 读线程: stdout → 定长BGR24帧
fn read_frames(mut stdout: ChildStdout, frame_len: usize, tx: Sender<Vec<u8>>) {
    loop {
        let mut buf = vec![0u8; frame_len];
        if let Err(e) = stdout.read_exact(&mut buf) {
            debug!("解码输出结束: {}", e);
            break;
        }
        if tx.send(buf).is_err() {
            break;
        }
    }
}

/// 泵线程与控制线程共享的中止状态
#[derive(Default)]
struct AbortState {
    aborted: AtomicBool,
    current: Mutex<Option<AbortHandle>>,
}

impl AbortState {
    fn set_current(&self, handle: Option<AbortHandle>) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = handle;
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        if let Some(handle) = self.current.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            handle.abort();
        }
    }
}

/// ffmpeg子进程帧源
///
/// 解码进程退出(断流)后, 下一次 read_frame 会重新拉流
pub struct ProcessSource {
    uri: String,
    settings: DecoderSettings,
    props: SourceProperties,
    decoder: Option<DecoderProcess>,
    abort: Arc<AbortState>,
    respawns: u64,
}

impl ProcessSource {
    pub fn open(uri: &str, settings: DecoderSettings) -> Result<Self> {
        let props = probe(uri, &settings).map_err(|e| {
            StreamError::Unavailable(format!("failed to open stream {}: {:#}", uri, e))
        })?;
        info!(
            "📹 流已打开: {} ({}x{} @ {:.2}fps)",
            uri, props.width, props.height, props.fps
        );

        let mut source = Self {
            uri: uri.to_string(),
            settings,
            props,
            decoder: None,
            abort: Arc::new(AbortState::default()),
            respawns: 0,
        };
        source
            .spawn_decoder()
            .map_err(|e| StreamError::Unavailable(format!("{:#}", e)))?;
        Ok(source)
    }

    fn spawn_decoder(&mut self) -> anyhow::Result<()> {
        if self.abort.aborted.load(Ordering::SeqCst) {
            bail!("source aborted");
        }
        let decoder = DecoderProcess::spawn(&self.uri, &self.props, &self.settings)?;
        self.abort.set_current(Some(decoder.child.abort_handle()));
        self.decoder = Some(decoder);
        Ok(())
    }

    fn drop_decoder(&mut self) {
        self.abort.set_current(None);
        if let Some(decoder) = self.decoder.take() {
            decoder.shutdown(self.settings.stop_timeout);
        }
    }
}

impl FrameSource for ProcessSource {
    fn properties(&self) -> SourceProperties {
        self.props
    }

    fn read_frame(&mut self) -> Option<Frame> {
        if self.abort.aborted.load(Ordering::SeqCst) {
            return None;
        }

        if self.decoder.is_none() {
            self.respawns += 1;
            info!("🔄 重新拉流 (第{}次): {}", self.respawns, self.uri);
            if let Err(e) = self.spawn_decoder() {
                warn!("⚠️ 解码进程启动失败: {:#}", e);
                return None;
            }
        }

        let frames = self.decoder.as_ref()?.frames.as_ref()?;
        match frames.recv_timeout(self.settings.read_timeout) {
            Ok(data) => Frame::new(self.props.width, self.props.height, data).ok(),
            Err(RecvTimeoutError::Timeout) => {
                warn!("⚠️ {:?}内未收到新帧", self.settings.read_timeout);
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.drop_decoder();
                None
            }
        }
    }

    fn close(&mut self) {
        self.drop_decoder();
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        let state = Arc::clone(&self.abort);
        Some(AbortHandle::new(move || state.abort()))
    }
}

impl Drop for ProcessSource {
    fn drop(&mut self) {
        self.drop_decoder();
    }
}
