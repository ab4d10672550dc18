//! 解码后的帧数据 (Frame).
//!
//! 对标 FFmpeg 的 `AVFrame`, 表示解码后的原始视频数据.

use tao_core::PixelFormat;

use crate::packet::NOPTS_VALUE;

/// 视频帧
///
/// 包含解码后的原始像素数据, 支持多平面存储.
/// 例如 YUV420P 格式有 3 个平面: Y, U, V.
/// 位深大于 8 时每个样本按 2 字节小端存储.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// 各平面的像素数据
    pub data: Vec<Vec<u8>>,
    /// 各平面每行的字节数 (linesize / stride)
    pub linesize: Vec<usize>,
    /// 宽度 (像素, 已应用 conformance window)
    pub width: u32,
    /// 高度 (像素, 已应用 conformance window)
    pub height: u32,
    /// 像素格式
    pub pixel_format: PixelFormat,
    /// 显示时间戳 (PTS)
    pub pts: i64,
    /// 图像顺序号 (POC)
    pub poc: i32,
    /// 是否为关键帧 (IRAP)
    pub is_keyframe: bool,
    /// 图片类型 (I/P/B 帧)
    pub picture_type: PictureType,
    /// 解码是否完整 (出错的图像内容不确定)
    pub complete: bool,
    /// 附加元数据平面 (运动矢量, 码率密度, 残差), 未启用时为空
    pub side_planes: Vec<Vec<u8>>,
}

impl VideoFrame {
    /// 创建空的视频帧
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        let plane_count = pixel_format.plane_count() as usize;
        Self {
            data: vec![Vec::new(); plane_count],
            linesize: vec![0; plane_count],
            width,
            height,
            pixel_format,
            pts: NOPTS_VALUE,
            poc: 0,
            is_keyframe: false,
            picture_type: PictureType::None,
            complete: true,
            side_planes: Vec::new(),
        }
    }
}

/// 帧 (解码器输出的统一包装)
#[derive(Debug, Clone)]
pub enum Frame {
    /// 视频帧
    Video(VideoFrame),
}

/// 图片类型 (I/P/B 帧)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PictureType {
    /// 未指定
    #[default]
    None,
    /// I 帧 (关键帧, 帧内编码)
    I,
    /// P 帧 (前向预测)
    P,
    /// B 帧 (双向预测)
    B,
}
