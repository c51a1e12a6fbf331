//! FFmpeg解码过滤器模块
//! FFmpeg decode filter module
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;
use ez_ffmpeg::filter::frame_filter::FrameFilter;
use ez_ffmpeg::filter::frame_filter_context::FrameFilterContext;
use ez_ffmpeg::{AVMediaType, Frame};
use tracing::{debug, info, warn};

/// FFmpeg解码过滤器: 直播流 → BGR24帧
#[derive(Clone)]
pub struct DecodeFilter {
    tx: Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
    width: u32,
    height: u32,
    count: usize,
    last: Instant,
    pub dropped_frames: usize, // 队列满或损坏而丢弃的帧数
    pub total_frames: usize,
}

impl DecodeFilter {
    pub fn new(tx: Sender<Vec<u8>>, stop: Arc<AtomicBool>, width: u32, height: u32) -> Self {
        Self {
            tx,
            stop,
            width,
            height,
            count: 0,
            last: Instant::now(),
            dropped_frames: 0,
            total_frames: 0,
        }
    }
}

impl FrameFilter for DecodeFilter {
    fn media_type(&self) -> AVMediaType {
        AVMediaType::AVMEDIA_TYPE_VIDEO
    }

    fn init(&mut self, _ctx: &FrameFilterContext) -> Result<(), String> {
        info!("✅ 解码线程启动");
        Ok(())
    }

    fn filter_frame(
        &mut self,
        frame: Frame,
        _ctx: &FrameFilterContext,
    ) -> Result<Option<Frame>, String> {
        // 运行已结束, 让调度器退出
        if self.stop.load(Ordering::Relaxed) {
            return Err("decoder stopped".to_string());
        }

        unsafe {
            self.total_frames += 1;

            if frame.as_ptr().is_null() || frame.is_empty() || frame.is_corrupt() {
                self.dropped_frames += 1;
                return Ok(None);
            }

            let w = (*frame.as_ptr()).width as u32;
            let h = (*frame.as_ptr()).height as u32;
            // scale滤镜已固定输出尺寸, 不一致说明滤镜链异常
            if w != self.width || h != self.height {
                self.dropped_frames += 1;
                warn!("⚠️ 丢弃帧 #{}: 分辨率 {}x{} != {}x{}", self.total_frames, w, h, self.width, self.height);
                return Ok(None);
            }

            let y_plane = (*frame.as_ptr()).data[0];
            let u_plane = (*frame.as_ptr()).data[1];
            let v_plane = (*frame.as_ptr()).data[2];
            let y_stride = (*frame.as_ptr()).linesize[0] as usize;
            let uv_stride = (*frame.as_ptr()).linesize[1] as usize;

            if y_plane.is_null() || u_plane.is_null() || v_plane.is_null() {
                self.dropped_frames += 1;
                return Ok(None);
            }

            let mut buffer = vec![0u8; w as usize * h as usize * 3];
            yuv420p_to_bgr24(
                y_plane,
                u_plane,
                v_plane,
                y_stride,
                uv_stride,
                &mut buffer,
                w as usize,
                h as usize,
            );

            self.count += 1;
            if self.last.elapsed().as_secs_f64() >= 1.0 {
                let fps = self.count as f64 / self.last.elapsed().as_secs_f64();
                debug!(
                    "📺 解码统计: {:.1}fps | 总帧{} | 丢弃{}",
                    fps, self.total_frames, self.dropped_frames
                );
                self.last = Instant::now();
                self.count = 0;
            }

            // 泵线程跟不上时丢弃最新帧, 不阻塞解码
            if self.tx.try_send(buffer).is_err() {
                self.dropped_frames += 1;
            }

            Ok(Some(frame))
        }
    }

    fn uninit(&mut self, _ctx: &FrameFilterContext) {
        info!("✅ 解码线程退出");
    }
}

/// YUV420P → BGR24 (BT.601, 定点)
#[inline]
unsafe fn yuv420p_to_bgr24(
    y_plane: *const u8,
    u_plane: *const u8,
    v_plane: *const u8,
    y_stride: usize,
    uv_stride: usize,
    buffer: &mut [u8],
    width: usize,
    height: usize,
) {
    let mut out_idx = 0;
    for y in 0..height {
        let y_row = y * y_stride;
        let uv_row = (y >> 1) * uv_stride;

        for x in 0..width {
            let y_val = *y_plane.add(y_row + x) as i32;
            let u_val = *u_plane.add(uv_row + (x >> 1)) as i32 - 128;
            let v_val = *v_plane.add(uv_row + (x >> 1)) as i32 - 128;

            buffer[out_idx] = (y_val + ((u_val * 227) >> 7)).clamp(0, 255) as u8;
            buffer[out_idx + 1] =
                (y_val - ((u_val * 44) >> 7) - ((v_val * 91) >> 7)).clamp(0, 255) as u8;
            buffer[out_idx + 2] = (y_val + ((v_val * 179) >> 7)).clamp(0, 255) as u8;
            out_idx += 3;
        }
    }
}
