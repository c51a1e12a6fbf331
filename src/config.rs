//! 流水线配置 - 通过JSON文件和命令行调整参数

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::detection::ModelCatalog;
use crate::input::DecoderSettings;
use crate::output::{EncoderPreference, HlsOptions, SegmentStore};
use crate::params::StreamParameters;
use crate::pipeline::{ControllerSettings, FailurePolicy};

/// 解码方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    #[default]
    Process, // ffmpeg子进程
    Libav,   // 进程内FFmpeg (需要 ez-ffmpeg feature)
}

/// 流水线参数配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // === 输出 ===
    pub hls_dir: PathBuf,        // HLS输出目录
    pub playlist_name: String,   // 播放列表文件名
    pub segment_pattern: String, // 切片文件名模板
    pub segment_seconds: u32,    // 切片时长(秒)
    pub playlist_size: u32,      // 播放列表切片数量

    // === 模型 ===
    pub weights_dir: PathBuf,
    pub default_model: String,
    pub model_extensions: Vec<String>,
    pub label_font: Option<PathBuf>, // 标签字体, 为空时只画框

    // === 外部程序 ===
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub encoder: EncoderPreference,
    pub decoder: DecoderKind,

    // === 失败与超时 ===
    pub max_consecutive_failures: u32,
    pub retry_backoff_ms: u64,
    pub read_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub stop_timeout_ms: u64, // 子进程优雅退出等待
    pub stop_grace_ms: u64,   // 泵线程退出等待
    pub kill_grace_ms: u64,   // 强制终止后等待

    // === 检测参数 ===
    pub params: StreamParameters,
    pub restart_on_threshold_change: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            hls_dir: PathBuf::from("./hls/"),
            playlist_name: "stream.m3u8".to_string(),
            segment_pattern: "segment_%05d.ts".to_string(),
            segment_seconds: 10,
            playlist_size: 10,

            weights_dir: PathBuf::from("./weights/"),
            default_model: "yolo11m.onnx".to_string(),
            model_extensions: vec!["onnx".to_string(), "pt".to_string()],
            label_font: None,

            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            encoder: EncoderPreference::Auto,
            decoder: DecoderKind::Process,

            max_consecutive_failures: 30,
            retry_backoff_ms: 1000,
            read_timeout_ms: 5000,
            probe_timeout_ms: 10_000,
            stop_timeout_ms: 5000,
            stop_grace_ms: 5000,
            kill_grace_ms: 2000,

            params: StreamParameters::default(),
            restart_on_threshold_change: true,
        }
    }
}

impl PipelineConfig {
    /// 从JSON文件加载配置; 文件不存在时写入默认配置
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(config) => {
                    info!("✅ 配置已从 {} 加载", path.display());
                    config
                }
                Err(e) => {
                    warn!("⚠️ 配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("📝 配置文件不存在, 创建默认配置...");
                let config = Self::default();
                config.save(path);
                config
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: &Path) {
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = fs::write(path, json) {
                    error!("❌ 保存配置失败: {}", e);
                } else {
                    info!("💾 配置已保存到 {}", path.display());
                }
            }
            Err(e) => error!("❌ 序列化配置失败: {}", e),
        }
    }

    pub fn log_summary(&self) {
        info!("🎛️ 当前配置:");
        info!("  HLS输出: {}", self.hls_dir.join(&self.playlist_name).display());
        info!("  模型: {} ({})", self.default_model, self.weights_dir.display());
        info!(
            "  参数: conf={:.2} iou={:.2} line_width={} fps={}",
            self.params.confidence, self.params.iou, self.params.line_width, self.params.fps
        );
        info!("  编码器: {:?} | 解码: {:?}", self.encoder, self.decoder);
    }

    pub fn decoder_settings(&self) -> DecoderSettings {
        DecoderSettings {
            ffmpeg: self.ffmpeg.clone(),
            ffprobe: self.ffprobe.clone(),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
        }
    }

    pub fn hls_options(&self) -> HlsOptions {
        HlsOptions {
            ffmpeg: self.ffmpeg.clone(),
            hls_dir: self.hls_dir.clone(),
            playlist_name: self.playlist_name.clone(),
            segment_pattern: self.segment_pattern.clone(),
            segment_seconds: self.segment_seconds,
            playlist_size: self.playlist_size,
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            policy: FailurePolicy {
                max_consecutive_failures: self.max_consecutive_failures.max(1),
                retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            },
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            restart_on_threshold_change: self.restart_on_threshold_change,
            default_model: self.default_model.clone(),
        }
    }

    pub fn catalog(&self) -> ModelCatalog {
        ModelCatalog::new(&self.weights_dir, &self.model_extensions)
    }

    pub fn segment_store(&self) -> SegmentStore {
        SegmentStore::new(&self.hls_dir, self.playlist_name.clone())
    }
}

/// 数字卫兵参数
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "数字卫兵 - 直播流检测标注与HLS切片", long_about = None)]
pub struct Args {
    /// JSON配置文件
    #[arg(short, long, default_value = "sentinel.json")]
    pub config: PathBuf,

    /// HLS输出目录
    #[arg(long)]
    pub hls_dir: Option<PathBuf>,

    /// 模型权重目录
    #[arg(long)]
    pub weights_dir: Option<PathBuf>,

    /// 初始模型文件名
    #[arg(short, long)]
    pub model: Option<String>,

    /// 启动后立即拉取的流地址
    #[arg(short, long)]
    pub uri: Option<String>,

    /// 追加写入的日志文件
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// 编码器: auto/nvenc/qsv/software
    #[arg(long, value_enum)]
    pub encoder: Option<EncoderPreference>,

    /// 解码方式: process/libav
    #[arg(long, value_enum)]
    pub decoder: Option<DecoderKind>,
}

impl Args {
    /// 命令行参数覆盖配置文件
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(dir) = &self.hls_dir {
            config.hls_dir = dir.clone();
        }
        if let Some(dir) = &self.weights_dir {
            config.weights_dir = dir.clone();
        }
        if let Some(model) = &self.model {
            config.default_model = model.clone();
        }
        if let Some(encoder) = self.encoder {
            config.encoder = encoder;
        }
        if let Some(decoder) = self.decoder {
            config.decoder = decoder;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.json");
        let config = PipelineConfig::load(&path);
        assert_eq!(config, PipelineConfig::default());
        assert!(path.exists());
        assert_eq!(PipelineConfig::load(&path), config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.json");
        fs::write(&path, r#"{"segment_seconds": 4, "encoder": "software", "params": {"conf": 0.3, "iou": 0.5, "line_width": 3, "fps": 12}}"#).unwrap();
        let config = PipelineConfig::load(&path);
        assert_eq!(config.segment_seconds, 4);
        assert_eq!(config.encoder, EncoderPreference::Software);
        assert_eq!(config.params.confidence, 0.3);
        assert_eq!(config.params.fps, 12);
        assert_eq!(config.playlist_name, "stream.m3u8");
        assert_eq!(config.max_consecutive_failures, 30);
    }

    #[test]
    fn test_broken_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(PipelineConfig::load(&path), PipelineConfig::default());
    }

    #[test]
    fn test_conversions() {
        let config = PipelineConfig::default();
        let settings = config.controller_settings();
        assert_eq!(settings.policy.max_consecutive_failures, 30);
        assert_eq!(settings.policy.retry_backoff, Duration::from_secs(1));
        assert_eq!(settings.stop_grace, Duration::from_secs(5));
        assert_eq!(settings.kill_grace, Duration::from_secs(2));
        assert_eq!(config.decoder_settings().read_timeout, Duration::from_secs(5));
        assert_eq!(config.hls_options().segment_seconds, 10);
        assert_eq!(config.segment_store().playlist_path(), PathBuf::from("./hls/stream.m3u8"));
    }

    #[test]
    fn test_args_override() {
        let args = Args::parse_from([
            "sentinel",
            "--hls-dir",
            "/srv/hls",
            "--model",
            "yolo11n.pt",
            "--encoder",
            "qsv",
        ]);
        let mut config = PipelineConfig::default();
        args.apply(&mut config);
        assert_eq!(config.hls_dir, PathBuf::from("/srv/hls"));
        assert_eq!(config.default_model, "yolo11n.pt");
        assert_eq!(config.encoder, EncoderPreference::Qsv);
        assert_eq!(args.config, PathBuf::from("sentinel.json"));
    }
}
