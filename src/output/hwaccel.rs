/// 编码器硬件能力检测模块
/// Encoder capability detection, cached for the process lifetime
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use clap::ValueEnum;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::process::run_with_timeout;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// 检测结果, 进程内只检测一次
static DETECTED: OnceCell<EncoderBackend> = OnceCell::new();

/// 配置/命令行中的编码偏好
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EncoderPreference {
    #[default]
    Auto,
    Nvenc,
    Qsv,
    Software,
}

/// 编码器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderBackend {
    Nvenc,    // NVIDIA GPU硬件编码
    Qsv,      // Intel QuickSync硬件编码
    Software, // CPU软件编码 (libx264)
}

impl EncoderBackend {
    /// 优先硬件, 最后软编
    const CANDIDATES: [EncoderBackend; 3] =
        [EncoderBackend::Nvenc, EncoderBackend::Qsv, EncoderBackend::Software];

    pub fn name(&self) -> &str {
        match self {
            EncoderBackend::Nvenc => "NVIDIA NVENC",
            EncoderBackend::Qsv => "Intel QuickSync",
            EncoderBackend::Software => "CPU软件编码",
        }
    }

    pub fn codec(&self) -> &'static str {
        match self {
            EncoderBackend::Nvenc => "h264_nvenc",
            EncoderBackend::Qsv => "h264_qsv",
            EncoderBackend::Software => "libx264",
        }
    }

    /// 输出像素格式 + 编码器 + 低延迟参数
    pub fn codec_args(&self) -> &'static [&'static str] {
        match self {
            EncoderBackend::Nvenc => &[
                "-pix_fmt", "yuv420p", "-c:v", "h264_nvenc", "-preset", "p1", "-tune", "ll",
            ],
            EncoderBackend::Qsv => &["-pix_fmt", "nv12", "-c:v", "h264_qsv", "-preset", "veryfast"],
            EncoderBackend::Software => &[
                "-pix_fmt",
                "yuv420p",
                "-c:v",
                "libx264",
                "-preset",
                "ultrafast",
                "-tune",
                "zerolatency",
            ],
        }
    }

    fn is_available(&self, encoders: &str, caps: &DeviceCaps) -> bool {
        match self {
            EncoderBackend::Nvenc => encoders.contains("h264_nvenc") && caps.nvidia,
            EncoderBackend::Qsv => encoders.contains("h264_qsv") && caps.render_node,
            EncoderBackend::Software => true,
        }
    }
}

/// 运行环境中的硬件设备
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceCaps {
    pub nvidia: bool,
    pub render_node: bool,
}

impl DeviceCaps {
    fn detect() -> Self {
        let nvidia = Path::new("/dev/nvidiactl").exists()
            || run_with_timeout("nvidia-smi", Command::new("nvidia-smi").arg("-L"), PROBE_TIMEOUT)
                .map(|(status, _)| status.success())
                .unwrap_or(false);
        let render_node = Path::new("/dev/dri/renderD128").exists();
        Self {
            nvidia,
            render_node,
        }
    }
}

/// 按 `ffmpeg -encoders` 输出和设备情况选择编码器
pub fn choose_backend(encoders: &str, caps: &DeviceCaps) -> EncoderBackend {
    EncoderBackend::CANDIDATES
        .into_iter()
        .find(|b| b.is_available(encoders, caps))
        .unwrap_or(EncoderBackend::Software)
}

fn probe_backend(ffmpeg: &Path) -> EncoderBackend {
    let mut cmd = Command::new(ffmpeg);
    cmd.args(["-hide_banner", "-encoders"]);
    let encoders = match run_with_timeout("ffmpeg-encoders", &mut cmd, PROBE_TIMEOUT) {
        Ok((_, out)) => String::from_utf8_lossy(&out).into_owned(),
        Err(e) => {
            warn!("⚠️ 无法列出ffmpeg编码器: {}, 使用软件编码", e);
            String::new()
        }
    };
    let caps = DeviceCaps::detect();
    let backend = choose_backend(&encoders, &caps);
    info!("🎞️ 编码器: {} ({}) | 设备 {:?}", backend.name(), backend.codec(), caps);
    backend
}

/// 首次调用时检测, 之后返回缓存
pub fn detect(ffmpeg: &Path) -> EncoderBackend {
    *DETECTED.get_or_init(|| probe_backend(ffmpeg))
}

pub fn resolve(preference: EncoderPreference, ffmpeg: &Path) -> EncoderBackend {
    match preference {
        EncoderPreference::Auto => detect(ffmpeg),
        EncoderPreference::Nvenc => EncoderBackend::Nvenc,
        EncoderPreference::Qsv => EncoderBackend::Qsv,
        EncoderPreference::Software => EncoderBackend::Software,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENCODERS: &str = " V....D libx264              libx264 H.264 / AVC\n \
                            V....D h264_nvenc           NVIDIA NVENC H.264 encoder\n \
                            V....D h264_qsv             H.264 (Intel Quick Sync Video acceleration)\n";

    #[test]
    fn test_prefers_nvenc_with_device() {
        let caps = DeviceCaps {
            nvidia: true,
            render_node: true,
        };
        assert_eq!(choose_backend(ENCODERS, &caps), EncoderBackend::Nvenc);
    }

    #[test]
    fn test_listed_but_no_device_falls_back() {
        let caps = DeviceCaps {
            nvidia: false,
            render_node: true,
        };
        assert_eq!(choose_backend(ENCODERS, &caps), EncoderBackend::Qsv);
        assert_eq!(
            choose_backend(ENCODERS, &DeviceCaps::default()),
            EncoderBackend::Software
        );
    }

    #[test]
    fn test_empty_encoder_list_is_software() {
        let caps = DeviceCaps {
            nvidia: true,
            render_node: true,
        };
        assert_eq!(choose_backend("", &caps), EncoderBackend::Software);
    }

    #[test]
    fn test_forced_preference_skips_detection() {
        let ffmpeg = Path::new("/nonexistent/ffmpeg");
        assert_eq!(resolve(EncoderPreference::Software, ffmpeg), EncoderBackend::Software);
        assert_eq!(resolve(EncoderPreference::Nvenc, ffmpeg), EncoderBackend::Nvenc);
    }

    #[test]
    fn test_preference_serde() {
        let p: EncoderPreference = serde_json::from_str("\"qsv\"").unwrap();
        assert_eq!(p, EncoderPreference::Qsv);
        assert_eq!(serde_json::to_string(&EncoderPreference::Auto).unwrap(), "\"auto\"");
    }
}
