//! 原始视频帧 (Raw video frame)
//!
//! 像素布局固定为 BGR24, 字节数 = width × height × 3,
//! 与编码器 `-pix_fmt bgr24 -s WxH` 输入约定一致

use image::RgbImage;

use crate::error::{Result, StreamError};

#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u8>, // BGR24, 行优先, 无行填充
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Frame {
    pub const CHANNELS: usize = 3;

    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * Self::CHANNELS
    }

    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = Self::byte_len(width, height);
        if width == 0 || height == 0 || data.len() != expected {
            return Err(StreamError::InvalidArgument(format!(
                "frame {}x{} needs {} bytes, got {}",
                width,
                height,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// 全黑帧
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; Self::byte_len(width, height)],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 零拷贝转为 image 缓冲区; 通道顺序仍是 B,G,R
    pub fn into_image(self) -> RgbImage {
        // 长度在构造时已校验
        RgbImage::from_raw(self.width, self.height, self.data)
            .unwrap_or_else(|| RgbImage::new(0, 0))
    }

    pub fn from_image(image: RgbImage) -> Result<Self> {
        let (width, height) = image.dimensions();
        Self::new(width, height, image.into_raw())
    }
}
