//! 像素格式定义.
//!
//! 对标 FFmpeg 的 `AVPixelFormat`, 只保留 HEVC 解码输出会用到的平面格式.
//! 位深大于 8 的格式每个样本占 2 字节, 小端存储.

use std::fmt;

/// 像素格式
///
/// 命名规则: 颜色空间 + 位深 + 排列方式 (P=Planar, LE=小端).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PixelFormat {
    /// 未指定
    None,

    // ========================
    // 灰度格式 (chroma_format_idc = 0)
    // ========================
    /// 灰度 8 位
    Gray8,
    /// 灰度 10 位小端
    Gray10le,
    /// 灰度 12 位小端
    Gray12le,

    // ========================
    // YUV 平面格式 (Planar)
    // ========================
    /// YUV 4:2:0 平面格式, 8 位 (Main profile 默认)
    Yuv420p,
    /// YUV 4:2:2 平面格式, 8 位
    Yuv422p,
    /// YUV 4:4:4 平面格式, 8 位
    Yuv444p,
    /// YUV 4:2:0 平面格式, 10 位小端 (Main 10)
    Yuv420p10le,
    /// YUV 4:2:2 平面格式, 10 位小端
    Yuv422p10le,
    /// YUV 4:4:4 平面格式, 10 位小端
    Yuv444p10le,
    /// YUV 4:2:0 平面格式, 12 位小端
    Yuv420p12le,
    /// YUV 4:2:2 平面格式, 12 位小端
    Yuv422p12le,
    /// YUV 4:4:4 平面格式, 12 位小端
    Yuv444p12le,
}

impl PixelFormat {
    /// 根据 HEVC SPS 的 chroma_format_idc 与位深选择输出格式
    pub const fn from_chroma_format(chroma_format_idc: u32, bit_depth: u32) -> Self {
        match (chroma_format_idc, bit_depth) {
            (0, 8) => Self::Gray8,
            (0, 10) => Self::Gray10le,
            (0, 12) => Self::Gray12le,
            (1, 8) => Self::Yuv420p,
            (2, 8) => Self::Yuv422p,
            (3, 8) => Self::Yuv444p,
            (1, 10) => Self::Yuv420p10le,
            (2, 10) => Self::Yuv422p10le,
            (3, 10) => Self::Yuv444p10le,
            (1, 12) => Self::Yuv420p12le,
            (2, 12) => Self::Yuv422p12le,
            (3, 12) => Self::Yuv444p12le,
            _ => Self::None,
        }
    }

    /// 单个分量的位深
    pub const fn bits_per_component(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Gray8 | Self::Yuv420p | Self::Yuv422p | Self::Yuv444p => 8,
            Self::Gray10le | Self::Yuv420p10le | Self::Yuv422p10le | Self::Yuv444p10le => 10,
            Self::Gray12le | Self::Yuv420p12le | Self::Yuv422p12le | Self::Yuv444p12le => 12,
        }
    }

    /// 每个样本占用的字节数
    pub const fn bytes_per_sample(&self) -> usize {
        if self.bits_per_component() > 8 { 2 } else { 1 }
    }

    /// 获取色度子采样 (log2 水平, log2 垂直)
    pub const fn chroma_subsampling(&self) -> (u32, u32) {
        match self {
            Self::Yuv420p | Self::Yuv420p10le | Self::Yuv420p12le => (1, 1),
            Self::Yuv422p | Self::Yuv422p10le | Self::Yuv422p12le => (1, 0),
            _ => (0, 0),
        }
    }

    /// 平面数量
    pub const fn plane_count(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Gray8 | Self::Gray10le | Self::Gray12le => 1,
            _ => 3,
        }
    }

    /// 计算指定平面的行字节数
    pub fn plane_linesize(&self, plane: usize, width: u32) -> Option<usize> {
        if plane >= self.plane_count() as usize {
            return None;
        }
        let (hs, _) = self.chroma_subsampling();
        let w = if plane == 0 {
            width
        } else {
            width.div_ceil(1 << hs)
        };
        Some(w as usize * self.bytes_per_sample())
    }

    /// 计算指定平面的行数
    pub fn plane_height(&self, plane: usize, height: u32) -> Option<usize> {
        if plane >= self.plane_count() as usize {
            return None;
        }
        let (_, vs) = self.chroma_subsampling();
        let h = if plane == 0 {
            height
        } else {
            height.div_ceil(1 << vs)
        };
        Some(h as usize)
    }

    /// 计算整帧字节数
    pub fn frame_size(&self, width: u32, height: u32) -> Option<usize> {
        if *self == Self::None {
            return None;
        }
        let mut total = 0usize;
        for plane in 0..self.plane_count() as usize {
            total += self.plane_linesize(plane, width)? * self.plane_height(plane, height)?;
        }
        Some(total)
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Gray8 => "gray",
            Self::Gray10le => "gray10le",
            Self::Gray12le => "gray12le",
            Self::Yuv420p => "yuv420p",
            Self::Yuv422p => "yuv422p",
            Self::Yuv444p => "yuv444p",
            Self::Yuv420p10le => "yuv420p10le",
            Self::Yuv422p10le => "yuv422p10le",
            Self::Yuv444p10le => "yuv444p10le",
            Self::Yuv420p12le => "yuv420p12le",
            Self::Yuv422p12le => "yuv422p12le",
            Self::Yuv444p12le => "yuv444p12le",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_chroma_format() {
        assert_eq!(PixelFormat::from_chroma_format(1, 8), PixelFormat::Yuv420p);
        assert_eq!(PixelFormat::from_chroma_format(2, 10), PixelFormat::Yuv422p10le);
        assert_eq!(PixelFormat::from_chroma_format(0, 12), PixelFormat::Gray12le);
        assert_eq!(PixelFormat::from_chroma_format(1, 9), PixelFormat::None);
    }

    #[test]
    fn test_yuv420p_frame_size() {
        let fmt = PixelFormat::Yuv420p;
        assert_eq!(fmt.frame_size(1920, 1080), Some(1920 * 1080 * 3 / 2));
        assert_eq!(fmt.plane_linesize(1, 1920), Some(960));
        assert_eq!(fmt.plane_height(2, 1080), Some(540));
    }

    #[test]
    fn test_yuv422p10le_frame_size() {
        let fmt = PixelFormat::Yuv422p10le;
        // Y: 64*2*16, U/V: 32*2*16
        assert_eq!(fmt.frame_size(64, 16), Some(64 * 2 * 16 + 2 * 32 * 2 * 16));
    }

    #[test]
    fn test_奇数尺寸色度向上取整() {
        let fmt = PixelFormat::Yuv420p;
        assert_eq!(fmt.plane_linesize(1, 33), Some(17));
        assert_eq!(fmt.plane_height(1, 17), Some(9));
    }

    #[test]
    fn test_plane_index_out_of_bounds_return_none() {
        assert_eq!(PixelFormat::Gray8.plane_linesize(1, 16), None);
        assert_eq!(PixelFormat::None.frame_size(16, 16), None);
    }
}
