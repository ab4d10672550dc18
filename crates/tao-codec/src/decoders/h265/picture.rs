//! 图像平面与运动场.
//!
//! 解码过程中样本统一以 u16 存储, 输出时再按位深打包为 8 位或 16 位小端.
//! 所有读写经由 [`PlaneView`] / [`PlaneViewMut`] 的切片索引完成, 越界即 panic,
//! 调用方负责在写入前把坐标裁剪到 SPS 几何范围内.

use tao_core::{TaoError, TaoResult};

// ============================================================
// 样本平面
// ============================================================

/// 单个样本平面
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u16>,
    pub width: usize,
    pub height: usize,
    pub stride: usize,
}

impl Plane {
    /// 分配平面并以 `fill` 填充
    pub fn new(width: usize, height: usize, fill: u16) -> TaoResult<Self> {
        let len = width
            .checked_mul(height)
            .ok_or_else(|| TaoError::InvalidArgument(format!("HEVC: 平面尺寸溢出 {}x{}", width, height)))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)?;
        data.resize(len, fill);
        Ok(Self {
            data,
            width,
            height,
            stride: width,
        })
    }

    /// 读取样本, 坐标越界时钳位到边缘
    #[inline]
    pub fn get_clamped(&self, x: i32, y: i32) -> u16 {
        let x = x.clamp(0, self.width as i32 - 1) as usize;
        let y = y.clamp(0, self.height as i32 - 1) as usize;
        self.data[y * self.stride + x]
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u16 {
        self.data[y * self.stride + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, v: u16) {
        self.data[y * self.stride + x] = v;
    }

    /// 整个平面的只读视图
    pub fn view(&self) -> PlaneView<'_> {
        PlaneView {
            data: &self.data,
            stride: self.stride,
            width: self.width,
            height: self.height,
        }
    }

    /// 从 (x0, y0) 起的可写子视图, 尺寸裁剪到平面边界
    pub fn region_mut(&mut self, x0: usize, y0: usize, width: usize, height: usize) -> PlaneViewMut<'_> {
        let width = width.min(self.width.saturating_sub(x0));
        let height = height.min(self.height.saturating_sub(y0));
        let start = y0 * self.stride + x0;
        let data = if height == 0 || width == 0 {
            &mut self.data[0..0]
        } else {
            &mut self.data[start..start + (height - 1) * self.stride + width]
        };
        PlaneViewMut {
            data,
            stride: self.stride,
            width,
            height,
        }
    }

    /// 以 `fill` 填充整个平面
    pub fn fill(&mut self, fill: u16) {
        self.data.fill(fill);
    }

    /// 打包输出: 裁剪窗口 (x, y, w, h), 8 位按字节, 其余按 16 位小端
    pub fn pack(&self, x: usize, y: usize, w: usize, h: usize, bit_depth: u32) -> Vec<u8> {
        let bytes_per_sample = if bit_depth > 8 { 2 } else { 1 };
        let mut out = Vec::with_capacity(w * h * bytes_per_sample);
        for row in y..(y + h).min(self.height) {
            let line = &self.data[row * self.stride + x..row * self.stride + (x + w).min(self.width)];
            if bytes_per_sample == 1 {
                out.extend(line.iter().map(|&s| s as u8));
            } else {
                for &s in line {
                    out.extend_from_slice(&s.to_le_bytes());
                }
            }
        }
        out
    }
}

/// 只读平面视图
#[derive(Debug, Clone, Copy)]
pub struct PlaneView<'a> {
    data: &'a [u16],
    stride: usize,
    width: usize,
    height: usize,
}

impl<'a> PlaneView<'a> {
    /// 由切片构造视图, 校验切片长度覆盖 width x height
    pub fn new(data: &'a [u16], stride: usize, width: usize, height: usize) -> TaoResult<Self> {
        if height > 0 && width > 0 && data.len() < (height - 1) * stride + width {
            return Err(TaoError::InvalidArgument(format!(
                "HEVC: 平面视图越界, len={}, {}x{} stride={}",
                data.len(),
                width,
                height,
                stride
            )));
        }
        Ok(Self {
            data,
            stride,
            width,
            height,
        })
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> u16 {
        self.data[y * self.stride + x]
    }

    /// 读取样本, 坐标越界时钳位到边缘 (等价于边缘扩展)
    #[inline]
    pub fn at_clamped(&self, x: i32, y: i32) -> u16 {
        let x = x.clamp(0, self.width as i32 - 1) as usize;
        let y = y.clamp(0, self.height as i32 - 1) as usize;
        self.data[y * self.stride + x]
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }
}

/// 可写平面视图
#[derive(Debug)]
pub struct PlaneViewMut<'a> {
    data: &'a mut [u16],
    stride: usize,
    width: usize,
    height: usize,
}

impl<'a> PlaneViewMut<'a> {
    pub fn new(data: &'a mut [u16], stride: usize, width: usize, height: usize) -> TaoResult<Self> {
        if height > 0 && width > 0 && data.len() < (height - 1) * stride + width {
            return Err(TaoError::InvalidArgument(format!(
                "HEVC: 平面视图越界, len={}, {}x{} stride={}",
                data.len(),
                width,
                height,
                stride
            )));
        }
        Ok(Self {
            data,
            stride,
            width,
            height,
        })
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> u16 {
        self.data[y * self.stride + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, v: u16) {
        self.data[y * self.stride + x] = v;
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }
}

// ============================================================
// 图像
// ============================================================

/// 一帧重建图像 (1 或 3 个平面, 尺寸为 SPS 编码尺寸)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture {
    pub planes: Vec<Plane>,
    pub hshift: [u32; 3],
    pub vshift: [u32; 3],
    pub bit_depth: u32,
    pub bit_depth_chroma: u32,
}

impl Picture {
    /// 按 SPS 几何分配图像, 样本填充为 1 << (bd - 1)
    pub fn new(
        width: usize,
        height: usize,
        plane_count: usize,
        hshift: [u32; 3],
        vshift: [u32; 3],
        bit_depth: u32,
        bit_depth_chroma: u32,
    ) -> TaoResult<Self> {
        let mut planes = Vec::with_capacity(plane_count);
        for c in 0..plane_count {
            let bd = if c == 0 { bit_depth } else { bit_depth_chroma };
            planes.push(Plane::new(
                width >> hshift[c],
                height >> vshift[c],
                1 << (bd - 1),
            )?);
        }
        Ok(Self {
            planes,
            hshift,
            vshift,
            bit_depth,
            bit_depth_chroma,
        })
    }

    /// 分量位深
    pub fn bit_depth_of(&self, c_idx: usize) -> u32 {
        if c_idx == 0 { self.bit_depth } else { self.bit_depth_chroma }
    }
}

// ============================================================
// 运动场
// ============================================================

/// 运动矢量 (1/4 亮度像素单位)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Mv {
    pub x: i16,
    pub y: i16,
}

impl Mv {
    pub const fn new(x: i16, y: i16) -> Self {
        Self { x, y }
    }

    /// 16 位回绕加法
    pub fn wrapping_add(self, other: Mv) -> Mv {
        Mv::new(self.x.wrapping_add(other.x), self.y.wrapping_add(other.y))
    }
}

/// 预测方向
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PredFlag {
    #[default]
    Intra,
    L0,
    L1,
    Bi,
}

impl PredFlag {
    /// 是否使用参考列表 `list`
    pub fn uses(&self, list: usize) -> bool {
        matches!(
            (self, list),
            (Self::L0, 0) | (Self::L1, 1) | (Self::Bi, 0) | (Self::Bi, 1)
        )
    }

    pub fn from_lists(l0: bool, l1: bool) -> Self {
        match (l0, l1) {
            (true, true) => Self::Bi,
            (true, false) => Self::L0,
            (false, true) => Self::L1,
            (false, false) => Self::Intra,
        }
    }
}

/// 一个最小 PU 单元的运动信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MvField {
    pub pred_flag: PredFlag,
    pub mv: [Mv; 2],
    pub ref_idx: [i8; 2],
}

impl Default for MvField {
    fn default() -> Self {
        Self {
            pred_flag: PredFlag::Intra,
            mv: [Mv::default(); 2],
            ref_idx: [-1, -1],
        }
    }
}

/// 每 4x4 亮度块一项的运动场
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionField {
    /// 以 4x4 为单位的宽度
    pub width: usize,
    /// 以 4x4 为单位的高度
    pub height: usize,
    pub cells: Vec<MvField>,
}

impl MotionField {
    pub fn new(width: usize, height: usize) -> TaoResult<Self> {
        let mut cells = Vec::new();
        cells.try_reserve_exact(width * height)?;
        cells.resize(width * height, MvField::default());
        Ok(Self { width, height, cells })
    }

    /// 亮度像素坐标处的运动信息
    #[inline]
    pub fn at(&self, x: usize, y: usize) -> &MvField {
        &self.cells[(y >> 2) * self.width + (x >> 2)]
    }

    /// 以 mvf 填充亮度区域 (x0, y0, w, h), 区域裁剪到运动场范围
    pub fn fill(&mut self, x0: usize, y0: usize, w: usize, h: usize, mvf: MvField) {
        let x_end = ((x0 + w) >> 2).min(self.width);
        let y_end = ((y0 + h) >> 2).min(self.height);
        for y in (y0 >> 2)..y_end {
            let row = &mut self.cells[y * self.width..(y + 1) * self.width];
            row[(x0 >> 2).min(x_end)..x_end].fill(mvf);
        }
    }

    pub fn reset(&mut self) {
        self.cells.fill(MvField::default());
    }
}
