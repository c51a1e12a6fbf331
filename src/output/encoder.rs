//! HLS编码子进程 (HLS encoder subprocess)
//!
//! 原始BGR24帧经stdin送入ffmpeg, 输出滚动HLS切片.
//! stdin写满时write阻塞, 慢编码器自然限制整个泵的速度.

use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::{ChildStdin, Command, Stdio};
use std::time::Duration;

use tracing::{info, warn};

use super::hwaccel::{self, EncoderBackend, EncoderPreference};
use super::{FrameSink, SinkFactory, StreamGeometry};
use crate::error::{Result, StreamError};
use crate::frame::Frame;
use crate::process::{AbortHandle, ManagedChild};

/// HLS输出选项
#[derive(Debug, Clone)]
pub struct HlsOptions {
    pub ffmpeg: PathBuf,
    pub hls_dir: PathBuf,
    pub playlist_name: String,   // stream.m3u8
    pub segment_pattern: String, // segment_%05d.ts
    pub segment_seconds: u32,    // 每个切片时长(秒)
    pub playlist_size: u32,      // 播放列表中的切片数量
    pub stop_timeout: Duration,  // 优雅退出等待时间
}

impl Default for HlsOptions {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            hls_dir: PathBuf::from("./hls/"),
            playlist_name: "stream.m3u8".to_string(),
            segment_pattern: "segment_%05d.ts".to_string(),
            segment_seconds: 10,
            playlist_size: 10,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

fn format_rate(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{}", fps as u64)
    } else {
        format!("{:.3}", fps)
    }
}

/// 组装ffmpeg参数
pub fn hls_args(options: &HlsOptions, backend: EncoderBackend, geometry: StreamGeometry) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-y",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "bgr24",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.push("-s".into());
    args.push(format!("{}x{}", geometry.width, geometry.height));
    args.push("-r".into());
    args.push(format_rate(geometry.fps));
    args.push("-i".into());
    args.push("pipe:0".into());
    args.push("-an".into());

    args.extend(backend.codec_args().iter().map(|s| s.to_string()));

    // 关键帧对齐切片边界
    args.push("-force_key_frames".into());
    args.push(format!("expr:gte(t,n_forced*{})", options.segment_seconds));

    args.push("-f".into());
    args.push("hls".into());
    args.push("-hls_time".into());
    args.push(options.segment_seconds.to_string());
    args.push("-hls_list_size".into());
    args.push(options.playlist_size.to_string());
    args.push("-hls_flags".into());
    args.push("delete_segments".into());
    args.push("-hls_segment_filename".into());
    args.push(options.hls_dir.join(&options.segment_pattern).to_string_lossy().into_owned());
    args.push(options.hls_dir.join(&options.playlist_name).to_string_lossy().into_owned());
    args
}

/// ffmpeg HLS编码器
pub struct HlsEncoder {
    child: Option<ManagedChild>,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
    frames_written: u64,
    stop_timeout: Duration,
}

impl HlsEncoder {
    pub fn spawn(options: &HlsOptions, backend: EncoderBackend, geometry: StreamGeometry) -> Result<Self> {
        let mut cmd = Command::new(&options.ffmpeg);
        cmd.args(hls_args(options, backend, geometry));
        info!(
            "🎬 启动编码器: {} {}x{} @ {}fps → {}",
            backend.codec(),
            geometry.width,
            geometry.height,
            format_rate(geometry.fps),
            options.hls_dir.join(&options.playlist_name).display()
        );
        Self::from_command(cmd, geometry, options.stop_timeout)
    }

    pub(crate) fn from_command(mut cmd: Command, geometry: StreamGeometry, stop_timeout: Duration) -> Result<Self> {
        cmd.stdin(Stdio::piped()).stdout(Stdio::null());
        let mut child = ManagedChild::spawn("ffmpeg-encode", &mut cmd)
            .map_err(|e| StreamError::Unavailable(format!("failed to spawn encoder: {}", e)))?;
        let stdin = child.take_stdin();
        if stdin.is_none() {
            return Err(StreamError::Unavailable("encoder stdin not captured".to_string()));
        }
        Ok(Self {
            child: Some(child),
            stdin,
            width: geometry.width,
            height: geometry.height,
            frames_written: 0,
            stop_timeout,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn exit_description(&mut self) -> String {
        match self.child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(Some(status))) => format!("encoder exited with {}", status),
            _ => "encoder input closed".to_string(),
        }
    }
}

impl FrameSink for HlsEncoder {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(StreamError::InvalidArgument(format!(
                "frame {}x{} does not match encoder geometry {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }

        let stdin = match self.stdin.as_mut() {
            Some(stdin) => stdin,
            None => return Err(StreamError::SinkDead("encoder already closed".to_string())),
        };

        if let Err(e) = stdin.write_all(frame.data()) {
            // 管道已断, 之后的写入都不再尝试
            self.stdin = None;
            let reason = self.exit_description();
            return Err(match e.kind() {
                ErrorKind::BrokenPipe => StreamError::SinkDead(reason),
                _ => StreamError::SinkDead(format!("{}: {}", reason, e)),
            });
        }
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let status = child.terminate(self.stop_timeout)?;
            info!("🛑 编码器已关闭: 写入{}帧, {}", self.frames_written, status);
        }
        Ok(())
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        self.child.as_ref().map(|c| c.abort_handle())
    }
}

impl Drop for HlsEncoder {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("❌ 编码器关闭失败: {}", e);
        }
    }
}

/// 每次运行创建一个新的编码器进程
#[derive(Debug, Clone, Default)]
pub struct HlsEncoderFactory {
    options: HlsOptions,
    preference: EncoderPreference,
}

impl HlsEncoderFactory {
    pub fn new(options: HlsOptions, preference: EncoderPreference) -> Self {
        Self {
            options,
            preference,
        }
    }
}

impl SinkFactory for HlsEncoderFactory {
    fn spawn(&self, geometry: StreamGeometry) -> Result<Box<dyn FrameSink>> {
        let backend = hwaccel::resolve(self.preference, &self.options.ffmpeg);
        Ok(Box::new(HlsEncoder::spawn(&self.options, backend, geometry)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn geometry() -> StreamGeometry {
        StreamGeometry {
            width: 64,
            height: 48,
            fps: 25.0,
        }
    }

    #[test]
    fn test_hls_args_software() {
        let options = HlsOptions {
            hls_dir: PathBuf::from("/tmp/hls"),
            ..Default::default()
        };
        let args = hls_args(&options, EncoderBackend::Software, geometry());
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt bgr24 -s 64x48 -r 25 -i pipe:0"));
        assert!(joined.contains("-c:v libx264 -preset ultrafast -tune zerolatency"));
        assert!(joined.contains("-hls_time 10 -hls_list_size 10 -hls_flags delete_segments"));
        assert!(joined.contains("/tmp/hls/segment_%05d.ts"));
        assert_eq!(args.last().unwrap(), "/tmp/hls/stream.m3u8");
    }

    #[test]
    fn test_hls_args_nvenc_and_fractional_rate() {
        let g = StreamGeometry {
            fps: 29.97,
            ..geometry()
        };
        let args = hls_args(&HlsOptions::default(), EncoderBackend::Nvenc, g);
        let joined = args.join(" ");
        assert!(joined.contains("-r 29.970"));
        assert!(joined.contains("-c:v h264_nvenc"));
        assert!(!joined.contains("libx264"));
    }

    #[cfg(unix)]
    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[cfg(unix)]
    #[test]
    fn test_write_and_close() {
        let mut enc = HlsEncoder::from_command(sh("cat > /dev/null"), geometry(), Duration::from_secs(5)).unwrap();
        let frame = Frame::blank(64, 48);
        for _ in 0..10 {
            enc.write(&frame).unwrap();
        }
        assert_eq!(enc.frames_written(), 10);
        enc.close().unwrap();
        // 重复关闭
        enc.close().unwrap();
        assert!(matches!(enc.write(&frame), Err(StreamError::SinkDead(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_geometry_mismatch_rejected() {
        let mut enc = HlsEncoder::from_command(sh("cat > /dev/null"), geometry(), Duration::from_secs(5)).unwrap();
        let err = enc.write(&Frame::blank(32, 48)).unwrap_err();
        assert!(matches!(err, StreamError::InvalidArgument(_)));
        enc.close().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_encoder_is_sink_dead() {
        let mut enc = HlsEncoder::from_command(sh("exit 1"), geometry(), Duration::from_secs(5)).unwrap();
        let frame = Frame::blank(64, 48);
        let mut dead = None;
        for _ in 0..100 {
            match enc.write(&frame) {
                Ok(()) => std::thread::sleep(Duration::from_millis(20)),
                Err(e) => {
                    dead = Some(e);
                    break;
                }
            }
        }
        assert!(matches!(dead, Some(StreamError::SinkDead(_))));
        enc.close().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_close_kills_stubborn_encoder() {
        let mut enc = HlsEncoder::from_command(
            sh("trap '' TERM; exec sleep 30"),
            geometry(),
            Duration::from_millis(200),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        let start = Instant::now();
        enc.close().unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
