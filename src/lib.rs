// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 配置文件与命令行
pub mod control; // 行协议控制面
pub mod detection; // 检测与标注
pub mod error; // 错误类型
pub mod frame; // 原始视频帧
pub mod input; // 视频输入系统
pub mod output; // HLS输出系统
pub mod params; // 运行参数
pub mod pipeline; // 流水线状态机与帧泵
pub mod process; // 外部子进程管理

pub use crate::config::{Args, DecoderKind, PipelineConfig};
pub use crate::detection::{Annotator, Detector, ModelCatalog, ModelLoader, ModelSelection};
pub use crate::error::{Result, StreamError};
pub use crate::frame::Frame;
pub use crate::input::{FrameSource, SourceFactory, SourceProperties};
pub use crate::output::{FrameSink, SegmentStore, SinkFactory, StreamGeometry};
pub use crate::params::{ParamsUpdate, StreamParameters};
pub use crate::pipeline::{ControllerSettings, PipelineController, RunState, RunStatus};

