/// 视频输入系统 (Video Input System)
///
/// 每次运行打开一个输入源, 由泵线程独占
/// - ProcessSource: ffprobe探测 + ffmpeg子进程解码 (默认)
/// - LibavSource:   进程内FFmpeg解码 (`ez-ffmpeg` feature)
pub mod process;

#[cfg(feature = "ez-ffmpeg")]
pub mod decode_filter;
#[cfg(feature = "ez-ffmpeg")]
pub mod decoder;

use crate::error::Result;
use crate::frame::Frame;
use crate::process::AbortHandle;

pub use process::{parse_probe, DecoderSettings, ProcessSource, ProcessSourceFactory};

#[cfg(feature = "ez-ffmpeg")]
pub use decoder::{LibavSource, LibavSourceFactory};

/// 打开时协商得到的流属性, 整个运行期间不变
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceProperties {
    pub width: u32,
    pub height: u32,
    pub fps: f64, // 源帧率, 未知时为0
}

/// 阻塞式帧源
pub trait FrameSource: Send {
    fn properties(&self) -> SourceProperties;

    /// 阻塞直到拿到一帧; 读失败或超时返回 None, 由泵线程按失败策略重试
    fn read_frame(&mut self) -> Option<Frame>;

    fn close(&mut self);

    /// 泵线程卡住时, 控制线程用它强制释放底层资源
    fn abort_handle(&self) -> Option<AbortHandle> {
        None
    }
}

/// 按URI打开帧源; 打不开返回 `StreamError::Unavailable`
pub trait SourceFactory: Send + Sync {
    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>>;
}
