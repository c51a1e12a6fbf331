/// 数字卫兵 (Digital Sentinel)
///
/// 直播流 → 逐帧检测标注 → HLS切片
///
/// 系统架构:
/// 1. 泵线程:   读帧 → 标注 → 写入编码器 (每次运行一个)
/// 2. 子进程:   ffmpeg解码 / ffmpeg HLS编码
/// 3. 主线程:   stdin行协议控制面
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use yolo_hls_rs::control;
use yolo_hls_rs::detection::PassthroughLoader;
use yolo_hls_rs::input::ProcessSourceFactory;
use yolo_hls_rs::output::HlsEncoderFactory;
use yolo_hls_rs::{Args, DecoderKind, PipelineConfig, PipelineController, SourceFactory};

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let file_layer = match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("无法打开日志文件 {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "yolo_hls_rs=info,sentinel=info,ffmpeg=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn source_factory(config: &PipelineConfig) -> Arc<dyn SourceFactory> {
    match config.decoder {
        DecoderKind::Process => Arc::new(ProcessSourceFactory::new(config.decoder_settings())),
        #[cfg(feature = "ez-ffmpeg")]
        DecoderKind::Libav => Arc::new(yolo_hls_rs::input::LibavSourceFactory::new(
            config.decoder_settings().read_timeout,
        )),
        #[cfg(not(feature = "ez-ffmpeg"))]
        DecoderKind::Libav => {
            warn!("⚠️ 未启用 ez-ffmpeg feature, 改用ffmpeg子进程解码");
            Arc::new(ProcessSourceFactory::new(config.decoder_settings()))
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = PipelineConfig::load(&args.config);
    args.apply(&mut config);
    config.log_summary();

    info!("🚀 数字卫兵启动");
    let controller = PipelineController::new(
        config.controller_settings(),
        source_factory(&config),
        Arc::new(HlsEncoderFactory::new(config.hls_options(), config.encoder)),
        Arc::new(PassthroughLoader::new(config.label_font.clone())),
        config.catalog(),
        config.segment_store(),
        config.params,
    )
    .context("配置无效")?;
    controller
        .segments()
        .ensure_dir()
        .context("无法创建HLS输出目录")?;

    if let Some(uri) = &args.uri {
        if let Err(e) = controller.start(uri) {
            warn!("⚠️ 自动启动失败: {}", e);
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line.context("读取控制命令失败")?;
        if line.trim().is_empty() {
            continue;
        }
        let (reply, quit) = control::handle_line(&controller, &line);
        writeln!(stdout, "{}", reply)?;
        stdout.flush()?;
        if quit {
            break;
        }
    }

    controller.stop()?;
    info!("👋 数字卫兵退出");
    Ok(())
}
