//! 帧泵 (Frame pump)
//! 职责: 读帧 → 标注 → 写入编码器, 每次运行一个线程

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

use crate::detection::Annotator;
use crate::error::StreamError;
use crate::input::FrameSource;
use crate::output::FrameSink;
use crate::params::SharedParams;

/// 无可用帧率时的帧间隔
const DEFAULT_FRAME_DELAY: Duration = Duration::from_millis(33);

/// 协作式停止信号; 发送端被丢弃即表示停止
#[derive(Debug, Clone)]
pub struct StopSignal(Receiver<()>);

impl StopSignal {
    pub fn new() -> (Sender<()>, StopSignal) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (tx, StopSignal(rx))
    }

    pub fn is_raised(&self) -> bool {
        !matches!(self.0.try_recv(), Err(TryRecvError::Empty))
    }

    /// 等待一段时间; 期间收到停止信号返回true
    pub fn wait(&self, timeout: Duration) -> bool {
        if timeout.is_zero() {
            return self.is_raised();
        }
        !matches!(self.0.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

/// 运行结束原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    Stopped,                  // 收到停止信号
    SourceExhausted(u32),     // 连续读取失败次数达到上限
    SinkDead(String),         // 编码器已退出
    Panicked,                 // 泵线程内部panic
}

impl std::fmt::Display for RunExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunExit::Stopped => write!(f, "stopped"),
            RunExit::SourceExhausted(n) => write!(f, "source failed {} consecutive reads", n),
            RunExit::SinkDead(reason) => write!(f, "sink dead: {}", reason),
            RunExit::Panicked => write!(f, "pump panicked"),
        }
    }
}

/// 读取失败策略
#[derive(Debug, Clone, Copy)]
pub struct FailurePolicy {
    pub max_consecutive_failures: u32,
    pub retry_backoff: Duration,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 30,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// 存活泵计数
#[derive(Debug, Clone, Default)]
pub struct PumpGauge(Arc<AtomicUsize>);

impl PumpGauge {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// 计数+1, 返回的守卫析构时-1
    pub(crate) fn enter(&self) -> GaugeGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        GaugeGuard(Arc::clone(&self.0))
    }
}

pub(crate) struct GaugeGuard(Arc<AtomicUsize>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 帧间隔: 输出帧率优先, 其次源帧率
pub fn frame_delay(fps: u32, source_fps: f64) -> Duration {
    if fps > 0 {
        Duration::from_secs_f64(1.0 / fps as f64)
    } else if source_fps.is_finite() && source_fps > 0.0 {
        Duration::from_secs_f64(1.0 / source_fps)
    } else {
        DEFAULT_FRAME_DELAY
    }
}

/// 吞吐统计, 每秒输出一次
struct PumpStats {
    written: u64,
    dropped: u64,
    window: u64,
    last: Instant,
}

impl PumpStats {
    fn new() -> Self {
        Self {
            written: 0,
            dropped: 0,
            window: 0,
            last: Instant::now(),
        }
    }

    fn record_written(&mut self) {
        self.written += 1;
        self.window += 1;
        let elapsed = self.last.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            debug!(
                "📊 泵统计: {:.1}fps | 写入{} | 丢弃{}",
                self.window as f64 / elapsed,
                self.written,
                self.dropped
            );
            self.window = 0;
            self.last = Instant::now();
        }
    }
}

/// 一次运行拥有的全部资源
pub(crate) struct Pump {
    pub(crate) source: Box<dyn FrameSource>,
    pub(crate) annotator: Box<dyn Annotator>,
    pub(crate) sink: Box<dyn FrameSink>,
    pub(crate) params: SharedParams,
    pub(crate) policy: FailurePolicy,
    pub(crate) stop: StopSignal,
    pub(crate) exit_tx: Sender<RunExit>,
    pub(crate) guard: GaugeGuard,
}

impl Pump {
    pub fn run(mut self) {
        let exit = match panic::catch_unwind(AssertUnwindSafe(|| self.pump_loop())) {
            Ok(exit) => exit,
            Err(_) => {
                error!("❌ 泵线程panic");
                RunExit::Panicked
            }
        };
        self.finish(exit);
    }

    fn pump_loop(&mut self) -> RunExit {
        let source_fps = self.source.properties().fps;
        let mut stats = PumpStats::new();
        let mut failures: u32 = 0;

        loop {
            if self.stop.is_raised() {
                return RunExit::Stopped;
            }

            let frame = match self.source.read_frame() {
                Some(frame) => {
                    failures = 0;
                    frame
                }
                None => {
                    failures += 1;
                    if failures >= self.policy.max_consecutive_failures {
                        error!("❌ 连续{}次读取失败, 结束运行", failures);
                        return RunExit::SourceExhausted(failures);
                    }
                    warn!(
                        "⚠️ 读帧失败 ({}/{}), {:?}后重试",
                        failures, self.policy.max_consecutive_failures, self.policy.retry_backoff
                    );
                    if self.stop.wait(self.policy.retry_backoff) {
                        return RunExit::Stopped;
                    }
                    continue;
                }
            };

            let params = self.params.snapshot();
            let annotator = &mut self.annotator;
            let annotated = panic::catch_unwind(AssertUnwindSafe(|| annotator.annotate(frame, &params)));
            match annotated {
                Ok(Ok(annotated)) => match self.sink.write(&annotated) {
                    Ok(()) => stats.record_written(),
                    Err(StreamError::InvalidArgument(msg)) => {
                        stats.dropped += 1;
                        warn!("⚠️ 丢弃帧: {}", msg);
                    }
                    Err(e) => {
                        error!("❌ 编码器失效: {}", e);
                        return RunExit::SinkDead(e.to_string());
                    }
                },
                Ok(Err(e)) => {
                    stats.dropped += 1;
                    warn!("⚠️ 标注失败, 丢弃帧: {:#}", e);
                }
                Err(_) => {
                    stats.dropped += 1;
                    warn!("⚠️ 标注器panic, 丢弃帧");
                }
            }

            if self.stop.wait(frame_delay(params.fps, source_fps)) {
                return RunExit::Stopped;
            }
        }
    }

    /// 唯一的清理路径
    fn finish(self, exit: RunExit) {
        let Pump {
            mut source,
            mut sink,
            annotator,
            exit_tx,
            guard,
            ..
        } = self;

        source.close();
        if let Err(e) = sink.close() {
            warn!("⚠️ 关闭编码器失败: {}", e);
        }
        drop(annotator);
        drop(source);
        drop(sink);

        match &exit {
            RunExit::Stopped => info!("⏹️ 流水线已停止"),
            other => warn!("⏹️ 流水线结束: {}", other),
        }
        // 先释放计数, 控制器收到退出消息时本泵已不再计入
        drop(guard);
        let _ = exit_tx.send(exit);
    }
}
