/// 输出系统 (HLS Output System)
///
/// - HlsEncoder:   ffmpeg编码子进程 (stdin写入原始帧)
/// - hwaccel:      硬件编码能力检测 (进程内缓存)
/// - SegmentStore: HLS切片目录管理
pub mod encoder;
pub mod hwaccel;
pub mod segments;

use crate::error::Result;
use crate::frame::Frame;
use crate::process::AbortHandle;

pub use encoder::{hls_args, HlsEncoder, HlsEncoderFactory, HlsOptions};
pub use hwaccel::{EncoderBackend, EncoderPreference};
pub use segments::SegmentStore;

/// 编码器输入几何参数, 一次运行内固定
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamGeometry {
    pub width: u32,
    pub height: u32,
    pub fps: f64, // 编码器输入帧率
}

/// 帧输出端
pub trait FrameSink: Send {
    /// 写入一帧; 输出端已死返回 `StreamError::SinkDead`
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// 关闭输出端, 可重复调用
    fn close(&mut self) -> Result<()>;

    fn abort_handle(&self) -> Option<AbortHandle> {
        None
    }
}

pub trait SinkFactory: Send + Sync {
    fn spawn(&self, geometry: StreamGeometry) -> Result<Box<dyn FrameSink>>;
}
