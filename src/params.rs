//! 检测/编码参数 (Stream parameters)
//!
//! 控制线程写入, 泵线程每帧读取一次快照

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

/// 每帧读取的运行参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamParameters {
    #[serde(rename = "conf")]
    pub confidence: f32, // 置信度阈值 (0,1]
    pub iou: f32,        // NMS IOU阈值 (0,1]
    pub line_width: u32, // 标注框线宽
    pub fps: u32,        // 输出帧率, 0 = 使用源帧率
}

impl Default for StreamParameters {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            iou: 0.45,
            line_width: 2,
            fps: 0,
        }
    }
}

impl StreamParameters {
    /// 校验数值范围, 越界直接拒绝(不做截断)
    pub fn validate(&self) -> Result<()> {
        if !(self.confidence > 0.0 && self.confidence <= 1.0) {
            return Err(StreamError::InvalidArgument(format!(
                "conf must be in (0, 1], got {}",
                self.confidence
            )));
        }
        if !(self.iou > 0.0 && self.iou <= 1.0) {
            return Err(StreamError::InvalidArgument(format!(
                "iou must be in (0, 1], got {}",
                self.iou
            )));
        }
        if self.line_width == 0 {
            return Err(StreamError::InvalidArgument(
                "line_width must be a positive integer".to_string(),
            ));
        }
        Ok(())
    }

    /// 只有帧率影响编码器配置
    pub fn needs_encoder_restart(&self, previous: &StreamParameters) -> bool {
        self.fps != previous.fps
    }
}

/// 部分更新: 缺省字段保持当前值
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamsUpdate {
    #[serde(rename = "conf", default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub iou: Option<f32>,
    #[serde(default)]
    pub line_width: Option<u32>,
    #[serde(default)]
    pub fps: Option<u32>,
}

impl ParamsUpdate {
    pub fn apply_to(&self, current: &StreamParameters) -> StreamParameters {
        StreamParameters {
            confidence: self.confidence.unwrap_or(current.confidence),
            iou: self.iou.unwrap_or(current.iou),
            line_width: self.line_width.unwrap_or(current.line_width),
            fps: self.fps.unwrap_or(current.fps),
        }
    }
}

/// 进程内共享参数
///
/// 写入只经过控制器; 读取方拿到的是一份拷贝, 最多滞后一帧
#[derive(Debug, Clone, Default)]
pub struct SharedParams {
    inner: Arc<RwLock<StreamParameters>>,
}

impl SharedParams {
    pub fn new(params: StreamParameters) -> Self {
        Self {
            inner: Arc::new(RwLock::new(params)),
        }
    }

    pub fn snapshot(&self) -> StreamParameters {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn store(&self, params: StreamParameters) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = params;
    }
}
