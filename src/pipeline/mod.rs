/// 视频处理流水线 (Video Processing Pipeline)
///
/// 单泵架构, 每次运行一个泵线程:
/// - Pump:       读帧 → 标注 → 编码 (独立线程)
/// - Controller: 启停/热更新状态机 (调用方线程)
pub mod controller;
pub mod pump;

use serde::Serialize;

pub use controller::{ControllerSettings, PipelineController};
pub use pump::{frame_delay, FailurePolicy, PumpGauge, RunExit, StopSignal};

/// 运行状态, 进程内唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "Idle",
            RunState::Starting => "Starting",
            RunState::Running => "Running",
            RunState::Stopping => "Stopping",
        };
        f.write_str(s)
    }
}

/// 控制面状态快照
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub state: RunState,
    pub uri: Option<String>,
    pub model: String,
    pub started_at: Option<String>, // RFC 3339
    pub live_pumps: usize,
}
