/// 检测数据结构定义
/// Data structures for detections
use std::cmp::Ordering;

/// 检测框 (Detection bounding box), 像素坐标
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bbox {
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
    class_id: usize,
    confidence: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32, class_id: usize, confidence: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
            class_id,
            confidence,
        }
    }

    /// 由左上/右下角点构造
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32, class_id: usize, confidence: f32) -> Self {
        Self::new(x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0), class_id, confidence)
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn class_id(&self) -> usize {
        self.class_id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = self.xmax().min(another.xmax());
        let t = self.ymin.max(another.ymin);
        let b = self.ymax().min(another.ymax());
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &Bbox) -> f32 {
        let union = self.union(another);
        if union <= 0.0 {
            return 0.0;
        }
        self.intersection_area(another) / union
    }

    /// 裁剪到画面内, 完全在画面外时返回None
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Bbox> {
        let x1 = self.xmin.max(0.0);
        let y1 = self.ymin.max(0.0);
        let x2 = self.xmax().min(width as f32);
        let y2 = self.ymax().min(height as f32);
        if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
            return None;
        }
        Some(Bbox::from_corners(x1, y1, x2, y2, self.class_id, self.confidence))
    }
}

/// 置信度过滤
pub fn filter_confidence(xs: &mut Vec<Bbox>, confidence: f32) {
    xs.retain(|b| b.confidence >= confidence);
}

/// 按类别的非极大值抑制, 结果按置信度降序
pub fn non_max_suppression(xs: &mut Vec<Bbox>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.confidence.partial_cmp(&b1.confidence).unwrap_or(Ordering::Equal));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if xs[prev_index].class_id != xs[index].class_id {
                continue;
            }
            if xs[prev_index].iou(&xs[index]) > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}
