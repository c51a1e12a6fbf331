//! 检测框标注器 (Box annotator)
//! 职责: 检测 → 置信度过滤 → NMS → 在BGR帧上画框和标签

use std::path::{Path, PathBuf};

use ab_glyph::{FontVec, PxScale};
use anyhow::{bail, Context};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::info;

use super::types::{filter_confidence, non_max_suppression, Bbox};
use super::{Annotator, Detector, ModelLoader};
use crate::frame::Frame;
use crate::params::StreamParameters;

/// 调色板 (RGB十六进制), 画到BGR缓冲区前需交换通道
const PALETTE: [u32; 20] = [
    0xFF3838, 0xFF9D97, 0xFF701F, 0xFFB21D, 0xCFD231, 0x48F90A, 0x92CC17, 0x3DDB86, 0x1A9334, 0x00D4BB,
    0x2C99A8, 0x00C2FF, 0x344593, 0x6473FF, 0x0018EC, 0x8438FF, 0x520085, 0xCB38FF, 0xFF95C8, 0xFF37C7,
];

/// 类别颜色, 已是 B,G,R 顺序
pub fn class_color(class_id: usize) -> Rgb<u8> {
    let hex = PALETTE[class_id % PALETTE.len()];
    let r = (hex >> 16) as u8;
    let g = (hex >> 8) as u8;
    let b = hex as u8;
    Rgb([b, g, r])
}

const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// 不做任何检测, 输出原帧
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyDetector;

impl Detector for EmptyDetector {
    fn detect(&mut self, _image: &RgbImage) -> anyhow::Result<Vec<Bbox>> {
        Ok(Vec::new())
    }
}

pub struct BoxAnnotator {
    detector: Box<dyn Detector>,
    font: Option<FontVec>,
}

impl BoxAnnotator {
    pub fn new(detector: Box<dyn Detector>) -> Self {
        Self {
            detector,
            font: None,
        }
    }

    pub fn with_font(mut self, font: FontVec) -> Self {
        self.font = Some(font);
        self
    }

    pub fn load_font(path: &Path) -> anyhow::Result<FontVec> {
        let data = std::fs::read(path).with_context(|| format!("读取字体失败: {}", path.display()))?;
        FontVec::try_from_vec(data).with_context(|| format!("无效字体文件: {}", path.display()))
    }

    fn label(&self, bbox: &Bbox) -> String {
        let name = self
            .detector
            .class_name(bbox.class_id())
            .map(str::to_string)
            .unwrap_or_else(|| format!("class{}", bbox.class_id()));
        format!("{} {:.2}", name, bbox.confidence())
    }

    fn draw(&self, image: &mut RgbImage, bbox: &Bbox, line_width: u32) {
        let (w, h) = image.dimensions();
        let bbox = match bbox.clamp_to(w, h) {
            Some(b) => b,
            None => return,
        };
        let color = class_color(bbox.class_id());
        let x = bbox.xmin() as u32;
        let y = bbox.ymin() as u32;
        let bw = bbox.width() as u32;
        let bh = bbox.height() as u32;

        // 线宽 = 向内收缩的同心矩形数量
        for t in 0..line_width {
            let inner_w = bw.saturating_sub(2 * t);
            let inner_h = bh.saturating_sub(2 * t);
            if inner_w == 0 || inner_h == 0 {
                break;
            }
            let rect = Rect::at((x + t) as i32, (y + t) as i32).of_size(inner_w, inner_h);
            draw_hollow_rect_mut(image, rect, color);
        }

        if let Some(font) = &self.font {
            let text = self.label(&bbox);
            let scale = PxScale::from((line_width as f32 * 6.0).max(12.0));
            let (tw, th) = text_size(scale, font, &text);
            if tw == 0 || th == 0 {
                return;
            }
            // 标签放在框上方, 顶部放不下时放在框内
            let ty = if y >= th + 2 { y - th - 2 } else { y };
            let bg = Rect::at(x as i32, ty as i32).of_size(tw + 4, th + 2);
            draw_filled_rect_mut(image, bg, color);
            draw_text_mut(image, TEXT_COLOR, x as i32 + 2, ty as i32, scale, font, &text);
        }
    }
}

impl Annotator for BoxAnnotator {
    fn annotate(&mut self, frame: Frame, params: &StreamParameters) -> anyhow::Result<Frame> {
        let mut image = frame.into_image();
        let mut boxes = self.detector.detect(&image)?;
        filter_confidence(&mut boxes, params.confidence);
        non_max_suppression(&mut boxes, params.iou);
        for bbox in &boxes {
            self.draw(&mut image, bbox, params.line_width);
        }
        Ok(Frame::from_image(image)?)
    }
}

/// 无模型运行时时使用: 校验权重文件存在, 帧原样输出
#[derive(Debug, Clone, Default)]
pub struct PassthroughLoader {
    font: Option<PathBuf>,
}

impl PassthroughLoader {
    pub fn new(font: Option<PathBuf>) -> Self {
        Self { font }
    }
}

impl ModelLoader for PassthroughLoader {
    fn load(&self, path: &Path) -> anyhow::Result<Box<dyn Annotator>> {
        if !path.is_file() {
            bail!("模型文件不存在: {}", path.display());
        }
        let mut annotator = BoxAnnotator::new(Box::new(EmptyDetector));
        if let Some(font) = &self.font {
            annotator = annotator.with_font(BoxAnnotator::load_font(font)?);
        }
        info!("🧠 模型已加载: {} (无推理后端, 帧原样输出)", path.display());
        Ok(Box::new(annotator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDetector(Vec<Bbox>);

    impl Detector for FixedDetector {
        fn detect(&mut self, _image: &RgbImage) -> anyhow::Result<Vec<Bbox>> {
            Ok(self.0.clone())
        }

        fn class_name(&self, class_id: usize) -> Option<&str> {
            (class_id == 0).then_some("person")
        }
    }

    struct FailingDetector;

    impl Detector for FailingDetector {
        fn detect(&mut self, _image: &RgbImage) -> anyhow::Result<Vec<Bbox>> {
            bail!("inference failed")
        }
    }

    fn pixel(frame: &Frame, x: u32, y: u32) -> [u8; 3] {
        let i = ((y * frame.width() + x) * 3) as usize;
        [frame.data()[i], frame.data()[i + 1], frame.data()[i + 2]]
    }

    fn params(confidence: f32, line_width: u32) -> StreamParameters {
        StreamParameters {
            confidence,
            line_width,
            ..Default::default()
        }
    }

    #[test]
    fn test_palette_is_bgr() {
        assert_eq!(class_color(0), Rgb([0x38, 0x38, 0xFF]));
        assert_eq!(class_color(20), class_color(0));
    }

    #[test]
    fn test_draws_box_with_line_width() {
        let det = FixedDetector(vec![Bbox::new(10.0, 10.0, 20.0, 20.0, 0, 0.9)]);
        let mut annotator = BoxAnnotator::new(Box::new(det));
        let color = class_color(0).0;

        let out = annotator.annotate(Frame::blank(64, 48), &params(0.5, 3)).unwrap();
        assert_eq!((out.width(), out.height()), (64, 48));
        assert_eq!(pixel(&out, 10, 10), color);
        assert_eq!(pixel(&out, 12, 20), color);
        assert_eq!(pixel(&out, 13, 20), [0, 0, 0]);
        assert_eq!(pixel(&out, 20, 20), [0, 0, 0]);

        let thin = annotator.annotate(Frame::blank(64, 48), &params(0.5, 1)).unwrap();
        assert_eq!(pixel(&thin, 10, 20), color);
        assert_eq!(pixel(&thin, 11, 20), [0, 0, 0]);
    }

    #[test]
    fn test_confidence_threshold_filters_boxes() {
        let det = FixedDetector(vec![Bbox::new(10.0, 10.0, 20.0, 20.0, 0, 0.4)]);
        let mut annotator = BoxAnnotator::new(Box::new(det));
        let out = annotator.annotate(Frame::blank(64, 48), &params(0.5, 2)).unwrap();
        assert!(out.data().iter().all(|&b| b == 0));

        let out = annotator.annotate(Frame::blank(64, 48), &params(0.3, 2)).unwrap();
        assert!(out.data().iter().any(|&b| b != 0));
    }

    #[test]
    fn test_detector_error_propagates() {
        let mut annotator = BoxAnnotator::new(Box::new(FailingDetector));
        assert!(annotator.annotate(Frame::blank(8, 8), &params(0.5, 2)).is_err());
    }

    #[test]
    fn test_offscreen_box_is_ignored() {
        let det = FixedDetector(vec![Bbox::new(100.0, 100.0, 20.0, 20.0, 1, 0.9)]);
        let mut annotator = BoxAnnotator::new(Box::new(det));
        let out = annotator.annotate(Frame::blank(32, 32), &params(0.5, 2)).unwrap();
        assert!(out.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_passthrough_loader() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("yolo11m.onnx");
        let loader = PassthroughLoader::default();
        assert!(loader.load(&weights).is_err());

        std::fs::write(&weights, b"weights").unwrap();
        let mut annotator = loader.load(&weights).unwrap();
        let data: Vec<u8> = (0..48).collect();
        let frame = Frame::new(4, 4, data.clone()).unwrap();
        let out = annotator.annotate(frame, &StreamParameters::default()).unwrap();
        assert_eq!(out.data(), &data[..]);
    }

    #[test]
    fn test_missing_font_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("m.pt");
        std::fs::write(&weights, b"weights").unwrap();
        let loader = PassthroughLoader::new(Some(dir.path().join("missing.ttf")));
        assert!(loader.load(&weights).is_err());
    }
}
