//! 流水线控制器 (Pipeline controller)
//!
//! 所有状态迁移都在同一把锁内完成, 任何时刻最多一个泵线程.
//! 自行结束的运行由下一次控制/查询调用回收.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{error, info, warn};

use super::pump::{FailurePolicy, Pump, PumpGauge, RunExit, StopSignal};
use super::{RunState, RunStatus};
use crate::detection::{ModelCatalog, ModelLoader, ModelSelection};
use crate::error::{Result, StreamError};
use crate::input::SourceFactory;
use crate::output::{SegmentStore, SinkFactory, StreamGeometry};
use crate::params::{ParamsUpdate, SharedParams, StreamParameters};
use crate::process::AbortHandle;

/// 源帧率缺失时的编码帧率
const FALLBACK_FPS: f64 = 25.0;

/// 控制器设置
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub policy: FailurePolicy,
    pub stop_grace: Duration, // 等待泵线程自行退出
    pub kill_grace: Duration, // 强制中止后再等待
    pub restart_on_threshold_change: bool,
    pub default_model: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            policy: FailurePolicy::default(),
            stop_grace: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
            restart_on_threshold_change: true,
            default_model: "yolo11m.onnx".to_string(),
        }
    }
}

/// 正在运行的泵
struct ActiveRun {
    uri: String,
    started_at: DateTime<Local>,
    stop_tx: Sender<()>,
    exit_rx: Receiver<RunExit>,
    aborts: Vec<AbortHandle>,
    handle: JoinHandle<()>,
}

/// 强制中止后仍未退出的泵
struct Draining {
    exit_rx: Receiver<RunExit>,
    handle: JoinHandle<()>,
}

struct Inner {
    state: RunState,
    model: String,
    run: Option<ActiveRun>,
    draining: Option<Draining>,
}

pub struct PipelineController {
    inner: Mutex<Inner>,
    settings: ControllerSettings,
    source_factory: Arc<dyn SourceFactory>,
    sink_factory: Arc<dyn SinkFactory>,
    loader: Arc<dyn ModelLoader>,
    catalog: ModelCatalog,
    segments: SegmentStore,
    params: SharedParams,
    gauge: PumpGauge,
}

fn into_unavailable(e: StreamError) -> StreamError {
    match e {
        StreamError::Io(e) => StreamError::Unavailable(e.to_string()),
        other => other,
    }
}

impl PipelineController {
    pub fn new(
        settings: ControllerSettings,
        source_factory: Arc<dyn SourceFactory>,
        sink_factory: Arc<dyn SinkFactory>,
        loader: Arc<dyn ModelLoader>,
        catalog: ModelCatalog,
        segments: SegmentStore,
        params: StreamParameters,
    ) -> Result<Self> {
        params.validate()?;
        ModelCatalog::validate_name(&settings.default_model)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                state: RunState::Idle,
                model: settings.default_model.clone(),
                run: None,
                draining: None,
            }),
            settings,
            source_factory,
            sink_factory,
            loader,
            catalog,
            segments,
            params: SharedParams::new(params),
            gauge: PumpGauge::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 启动; 已在运行时先停止再启动
    pub fn start(&self, uri: &str) -> Result<()> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(StreamError::InvalidArgument("stream uri must not be empty".to_string()));
        }
        let mut inner = self.lock();
        self.reap(&mut inner);
        if inner.run.is_some() {
            info!("🔄 切换输入流: {}", uri);
            self.stop_locked(&mut inner);
        }
        self.start_locked(&mut inner, uri)
    }

    /// 停止并清理切片; 空闲时同样清理, 返回Ok
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.lock();
        self.reap(&mut inner);
        if inner.run.is_some() {
            self.stop_locked(&mut inner);
        }
        self.clear_segments(&inner);
        Ok(())
    }

    /// 合并并校验参数, 运行中按需重启
    pub fn update_params(&self, update: ParamsUpdate) -> Result<StreamParameters> {
        let mut inner = self.lock();
        self.reap(&mut inner);

        let current = self.params.snapshot();
        let next = update.apply_to(&current);
        next.validate()?;
        self.ensure_not_draining(&inner)?;

        self.params.store(next);
        info!(
            "⚙️ 参数更新: conf={} iou={} line_width={} fps={}",
            next.confidence, next.iou, next.line_width, next.fps
        );

        if inner.run.is_some() {
            let restart = self.settings.restart_on_threshold_change || next.needs_encoder_restart(&current);
            if restart {
                self.restart_or_log(&mut inner)?;
            }
        }
        Ok(next)
    }

    /// 切换模型, 运行中则重启
    pub fn switch_model(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        self.reap(&mut inner);
        self.catalog.resolve(name)?;
        self.ensure_not_draining(&inner)?;

        info!("🧠 切换模型: {} → {}", inner.model, name);
        inner.model = name.to_string();
        if inner.run.is_some() {
            self.restart_or_log(&mut inner)?;
        }
        Ok(())
    }

    pub fn params(&self) -> StreamParameters {
        self.params.snapshot()
    }

    pub fn models(&self) -> Result<ModelSelection> {
        let current = self.lock().model.clone();
        self.catalog.selection(&current)
    }

    pub fn state(&self) -> RunState {
        let mut inner = self.lock();
        self.reap(&mut inner);
        inner.state
    }

    pub fn status(&self) -> RunStatus {
        let mut inner = self.lock();
        self.reap(&mut inner);
        RunStatus {
            state: inner.state,
            uri: inner.run.as_ref().map(|r| r.uri.clone()),
            model: inner.model.clone(),
            started_at: inner.run.as_ref().map(|r| r.started_at.to_rfc3339()),
            live_pumps: self.gauge.get(),
        }
    }

    /// 存活的泵线程数量 (含强制中止后仍在退出的)
    pub fn active_pumps(&self) -> usize {
        self.gauge.get()
    }

    pub fn segments(&self) -> &SegmentStore {
        &self.segments
    }

    fn ensure_not_draining(&self, inner: &Inner) -> Result<()> {
        if inner.draining.is_some() {
            return Err(StreamError::Conflict(
                "previous pipeline is still shutting down".to_string(),
            ));
        }
        Ok(())
    }

    /// 回收已自行结束的运行 (并清理其切片) 和退出中的泵
    fn reap(&self, inner: &mut Inner) {
        if let Some(draining) = inner.draining.take() {
            match draining.exit_rx.try_recv() {
                Err(TryRecvError::Empty) => inner.draining = Some(draining),
                _ => {
                    let _ = draining.handle.join();
                    info!("✅ 滞留的泵线程已退出");
                }
            }
        }

        if let Some(run) = inner.run.take() {
            let exit = match run.exit_rx.try_recv() {
                Ok(exit) => exit,
                Err(TryRecvError::Disconnected) => RunExit::Panicked,
                Err(TryRecvError::Empty) => {
                    inner.run = Some(run);
                    return;
                }
            };
            let _ = run.handle.join();
            inner.state = RunState::Idle;
            info!("⏹️ 运行已结束 ({}): {}", exit, run.uri);
            // 泵退出前已关闭编码器
            self.clear_segments(inner);
        }
    }

    /// 停止信号 → 限时等待 → 强制中止 → 再次限时等待
    fn stop_locked(&self, inner: &mut Inner) {
        let run = match inner.run.take() {
            Some(run) => run,
            None => {
                inner.state = RunState::Idle;
                return;
            }
        };
        inner.state = RunState::Stopping;
        info!("🛑 停止流水线: {}", run.uri);

        let ActiveRun {
            stop_tx,
            exit_rx,
            aborts,
            handle,
            ..
        } = run;
        drop(stop_tx);

        let exited = match exit_rx.recv_timeout(self.settings.stop_grace) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "⚠️ 泵线程{:?}内未退出, 强制终止{}个子进程",
                    self.settings.stop_grace,
                    aborts.len()
                );
                for abort in &aborts {
                    abort.abort();
                }
                !matches!(
                    exit_rx.recv_timeout(self.settings.kill_grace),
                    Err(RecvTimeoutError::Timeout)
                )
            }
            _ => true,
        };

        if exited {
            let _ = handle.join();
        } else {
            error!("❌ 泵线程强制终止后仍未退出, 新的启动将被拒绝直到其退出");
            inner.draining = Some(Draining { exit_rx, handle });
        }
        inner.state = RunState::Idle;
    }

    /// 编码器全部退出后才清理切片
    fn clear_segments(&self, inner: &Inner) {
        if inner.draining.is_some() {
            warn!("⚠️ 旧编码器可能仍在写入, 跳过切片清理");
            return;
        }
        if let Err(e) = self.segments.clear() {
            warn!("⚠️ 清理切片失败: {}", e);
        }
    }

    fn restart_locked(&self, inner: &mut Inner) -> Result<()> {
        let uri = match &inner.run {
            Some(run) => run.uri.clone(),
            None => return Ok(()),
        };
        info!("🔄 重启流水线: {}", uri);
        self.stop_locked(inner);
        self.start_locked(inner, &uri)
    }

    /// 重启失败时回到Idle; 只有Conflict返回给调用方
    fn restart_or_log(&self, inner: &mut Inner) -> Result<()> {
        match self.restart_locked(inner) {
            Ok(()) => Ok(()),
            Err(e @ StreamError::Conflict(_)) => Err(e),
            Err(e) => {
                error!("❌ 重启失败, 流水线已停止: {}", e);
                Ok(())
            }
        }
    }

    fn start_locked(&self, inner: &mut Inner, uri: &str) -> Result<()> {
        self.ensure_not_draining(inner)?;
        inner.state = RunState::Starting;
        match self.launch(inner, uri) {
            Ok(run) => {
                inner.run = Some(run);
                inner.state = RunState::Running;
                Ok(())
            }
            Err(e) => {
                inner.state = RunState::Idle;
                error!("❌ 启动失败: {}", e);
                Err(into_unavailable(e))
            }
        }
    }

    /// 打开源 → 加载模型 → 启动编码器 → 启动泵线程
    ///
    /// 任一步失败时, 已打开的资源随局部变量一起释放
    fn launch(&self, inner: &Inner, uri: &str) -> Result<ActiveRun> {
        let model_path = self.catalog.path_of(&inner.model);
        if !model_path.is_file() {
            return Err(StreamError::Unavailable(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        self.segments.ensure_dir()?;
        self.clear_segments(inner);

        let params = self.params.snapshot();
        let mut source = self.source_factory.open(uri)?;
        let props = source.properties();

        let annotator = match self.loader.load(&model_path) {
            Ok(annotator) => annotator,
            Err(e) => {
                source.close();
                return Err(StreamError::Unavailable(format!(
                    "failed to load model {}: {:#}",
                    inner.model, e
                )));
            }
        };

        let fps = if params.fps > 0 {
            params.fps as f64
        } else if props.fps.is_finite() && props.fps > 0.0 {
            props.fps
        } else {
            FALLBACK_FPS
        };
        let geometry = StreamGeometry {
            width: props.width,
            height: props.height,
            fps,
        };
        let sink = match self.sink_factory.spawn(geometry) {
            Ok(sink) => sink,
            Err(e) => {
                source.close();
                return Err(e);
            }
        };

        let aborts: Vec<AbortHandle> = source
            .abort_handle()
            .into_iter()
            .chain(sink.abort_handle())
            .collect();
        let (stop_tx, stop) = StopSignal::new();
        let (exit_tx, exit_rx) = crossbeam_channel::bounded(1);
        let pump = Pump {
            source,
            annotator,
            sink,
            params: self.params.clone(),
            policy: self.settings.policy,
            stop,
            exit_tx,
            guard: self.gauge.enter(),
        };

        // 线程创建失败时闭包(连同pump)被丢弃, 子进程随之回收
        let handle = thread::Builder::new()
            .name("frame-pump".to_string())
            .spawn(move || pump.run())
            .map_err(|e| StreamError::Unavailable(format!("failed to spawn pump thread: {}", e)))?;

        info!(
            "▶️ 流水线启动: {} ({}x{} @ {:.2}fps, 模型 {})",
            uri, props.width, props.height, fps, inner.model
        );
        Ok(ActiveRun {
            uri: uri.to_string(),
            started_at: Local::now(),
            stop_tx,
            exit_rx,
            aborts,
            handle,
        })
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        let mut inner = self.lock();
        if inner.run.is_some() {
            self.stop_locked(&mut inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{Annotator, PassthroughLoader};
    use crate::frame::Frame;
    use crate::input::{FrameSource, SourceProperties};
    use crate::output::FrameSink;
    use std::path::Path;

    struct StaticSource;

    impl FrameSource for StaticSource {
        fn properties(&self) -> SourceProperties {
            SourceProperties {
                width: 8,
                height: 8,
                fps: 100.0,
            }
        }

        fn read_frame(&mut self) -> Option<Frame> {
            Some(Frame::blank(8, 8))
        }

        fn close(&mut self) {}
    }

    struct StaticFactory;

    impl SourceFactory for StaticFactory {
        fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>> {
            if uri.starts_with("bad") {
                return Err(StreamError::Unavailable("cannot open".into()));
            }
            Ok(Box::new(StaticSource))
        }
    }

    struct NullSink;

    impl FrameSink for NullSink {
        fn write(&mut self, _frame: &Frame) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct NullSinkFactory;

    impl SinkFactory for NullSinkFactory {
        fn spawn(&self, _geometry: StreamGeometry) -> Result<Box<dyn FrameSink>> {
            Ok(Box::new(NullSink))
        }
    }

    struct BrokenLoader;

    impl ModelLoader for BrokenLoader {
        fn load(&self, _path: &Path) -> anyhow::Result<Box<dyn Annotator>> {
            anyhow::bail!("corrupt weights")
        }
    }

    fn controller(dir: &Path, loader: Arc<dyn ModelLoader>) -> PipelineController {
        let weights = dir.join("weights");
        std::fs::create_dir_all(&weights).unwrap();
        std::fs::write(weights.join("yolo11m.onnx"), b"w").unwrap();
        PipelineController::new(
            ControllerSettings::default(),
            Arc::new(StaticFactory),
            Arc::new(NullSinkFactory),
            loader,
            ModelCatalog::new(weights, &["onnx".to_string(), "pt".to_string()]),
            SegmentStore::new(dir.join("hls"), "stream.m3u8"),
            StreamParameters::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_start_stop_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path(), Arc::new(PassthroughLoader::default()));
        assert_eq!(c.state(), RunState::Idle);
        c.start("rtsp://camera/1").unwrap();
        assert_eq!(c.state(), RunState::Running);
        assert_eq!(c.active_pumps(), 1);
        let status = c.status();
        assert_eq!(status.uri.as_deref(), Some("rtsp://camera/1"));
        assert!(status.started_at.is_some());

        c.stop().unwrap();
        assert_eq!(c.state(), RunState::Idle);
        assert_eq!(c.active_pumps(), 0);
        assert!(c.status().uri.is_none());
    }

    #[test]
    fn test_open_failure_stays_idle() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path(), Arc::new(PassthroughLoader::default()));
        assert!(matches!(c.start("bad://x"), Err(StreamError::Unavailable(_))));
        assert_eq!(c.state(), RunState::Idle);
        assert_eq!(c.active_pumps(), 0);
    }

    #[test]
    fn test_model_load_failure_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path(), Arc::new(BrokenLoader));
        assert!(matches!(c.start("rtsp://camera/1"), Err(StreamError::Unavailable(_))));
        assert_eq!(c.state(), RunState::Idle);
    }

    #[test]
    fn test_missing_default_model_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path(), Arc::new(PassthroughLoader::default()));
        std::fs::remove_file(dir.path().join("weights").join("yolo11m.onnx")).unwrap();
        assert!(matches!(c.start("rtsp://camera/1"), Err(StreamError::Unavailable(_))));
    }

    #[test]
    fn test_invalid_params_are_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path(), Arc::new(PassthroughLoader::default()));
        let update = ParamsUpdate {
            confidence: Some(1.5),
            ..Default::default()
        };
        assert!(matches!(c.update_params(update), Err(StreamError::InvalidArgument(_))));
        assert_eq!(c.params(), StreamParameters::default());
    }

    #[test]
    fn test_restart_failure_keeps_params() {
        let dir = tempfile::tempdir().unwrap();
        let c = controller(dir.path(), Arc::new(PassthroughLoader::default()));
        c.start("rtsp://camera/1").unwrap();
        // 删除模型后重启会失败
        std::fs::remove_file(dir.path().join("weights").join("yolo11m.onnx")).unwrap();
        let update = ParamsUpdate {
            fps: Some(5),
            ..Default::default()
        };
        let stored = c.update_params(update).unwrap();
        assert_eq!(stored.fps, 5);
        assert_eq!(c.params().fps, 5);
        assert_eq!(c.state(), RunState::Idle);
        assert_eq!(c.active_pumps(), 0);
    }
}
