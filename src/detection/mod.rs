/// 检测系统 (Detection System)
///
/// 泵线程每帧调用一次, 模型运行时由外部注入
/// - Detector:    帧 → 检测框
/// - Annotator:   帧 → 标注后的帧
/// - ModelLoader: 权重文件 → Annotator (每次运行加载一次)
/// - ModelCatalog: 权重目录
pub mod annotator;
pub mod catalog;
pub mod types;

use std::path::Path;

use image::RgbImage;

use crate::frame::Frame;
use crate::params::StreamParameters;

pub use annotator::{BoxAnnotator, EmptyDetector, PassthroughLoader};
pub use catalog::{ModelCatalog, ModelSelection};
pub use types::{filter_confidence, non_max_suppression, Bbox};

/// 目标检测器; 输入图像通道顺序为 B,G,R
pub trait Detector: Send {
    fn detect(&mut self, image: &RgbImage) -> anyhow::Result<Vec<Bbox>>;

    fn class_name(&self, _class_id: usize) -> Option<&str> {
        None
    }
}

/// 单帧标注, 可能较慢; 失败时该帧被丢弃
pub trait Annotator: Send {
    fn annotate(&mut self, frame: Frame, params: &StreamParameters) -> anyhow::Result<Frame>;
}

/// 从权重文件构建标注器
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path) -> anyhow::Result<Box<dyn Annotator>>;
}
