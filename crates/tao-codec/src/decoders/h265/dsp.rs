//! HEVC 样本级运算 (DSP).
//!
//! [`DspKernels`] 描述核心解码流程依赖的全部样本运算: 帧内预测, 反变换与残差叠加,
//! 亚像素插值, 单向/双向 (加权) 输出, 边缘扩展, PCM 写入, 去块滤波与 SAO.
//! [`ReferenceDsp`] 是逐样本的参考实现, 数值与 H.265 规范一致.
//!
//! 插值中间结果统一为 14 位精度 (i16), 与规范的 shift1/shift2/shift3 一致.

use super::picture::{Plane, PlaneView, PlaneViewMut};
use super::tables::{
    DST_MATRIX, EPEL_FILTERS, INTRA_PRED_ANGLE, INV_ANGLE, QPEL_FILTERS, dct_matrix,
};

/// 帧内预测模式编号
pub const INTRA_PLANAR: u32 = 0;
pub const INTRA_DC: u32 = 1;
pub const INTRA_HORIZONTAL: u32 = 10;
pub const INTRA_VERTICAL: u32 = 26;
pub const INTRA_ANGULAR_34: u32 = 34;

/// 帧内参考样本
///
/// `top[0]` 与 `left[0]` 都是左上角样本 p[-1][-1];
/// `top[1 + i]` = p[i][-1], `left[1 + i]` = p[-1][i], i 取 0..2N.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntraRefs {
    pub top: Vec<u16>,
    pub left: Vec<u16>,
}

/// 帧内预测参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntraParams {
    pub log2_size: u32,
    pub mode: u32,
    pub bit_depth: u32,
    /// 允许参考样本滤波 (亮度或 4:4:4 色度, 且未禁用平滑)
    pub filter_refs: bool,
    /// 允许 32x32 强平滑
    pub strong_smoothing: bool,
    /// DC/水平/垂直模式的边界滤波
    pub edge_filters: bool,
}

/// 反变换类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    Dct,
    /// 4x4 帧内亮度
    Dst,
}

/// 加权预测参数 (偏移已按位深缩放)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightParams {
    pub log2_wd: u32,
    pub w0: i32,
    pub w1: i32,
    pub o0: i32,
    pub o1: i32,
}

/// 亮度边界滤波参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LumaEdge {
    pub beta: i32,
    pub tc: i32,
    /// P 侧不滤波 (PCM / transquant bypass)
    pub no_p: bool,
    pub no_q: bool,
    pub bit_depth: u32,
}

/// SAO 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaoType {
    #[default]
    NotApplied,
    Band,
    Edge,
}

/// 单个分量的 SAO 参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaoComponent {
    pub sao_type: SaoType,
    pub band_position: u8,
    pub eo_class: u8,
    /// [0] 恒为 0, [1..=4] 为带偏移或边缘偏移 (已带符号与缩放)
    pub offset_val: [i32; 5],
}

/// SAO 边缘分类时不可使用的相邻方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SaoBorders {
    pub left: bool,
    pub right: bool,
    pub top: bool,
    pub bottom: bool,
}

/// 样本级运算
pub trait DspKernels: Send + Sync {
    /// 帧内预测, 结果写入 dst 左上角 N x N
    fn intra_pred(&self, dst: &mut PlaneViewMut, refs: &IntraRefs, params: &IntraParams);

    /// 反 DCT/DST, 原位把系数变为残差
    fn inverse_transform(&self, coeffs: &mut [i32], log2_size: u32, kind: TransformKind, bit_depth: u32, extended_precision: bool);
    /// 变换跳过的残差缩放
    fn transform_skip(&self, coeffs: &mut [i32], log2_size: u32, bit_depth: u32, extended_precision: bool);
    /// RDPCM 累加 (vertical 为 true 时沿列方向)
    fn rdpcm(&self, residual: &mut [i32], log2_size: u32, vertical: bool);
    /// 残差叠加并钳位
    fn add_residual(&self, dst: &mut PlaneViewMut, residual: &[i32], log2_size: u32, bit_depth: u32);

    /// 亮度 8 抽头插值到 14 位中间结果, (x, y) 为整像素位置
    ///
    /// 直接读取样本: 左上 3 个, 右下 4 个样本的滤波窗口必须落在 src 内.
    #[allow(clippy::too_many_arguments)]
    fn interpolate_luma(&self, dst: &mut [i16], src: &PlaneView, x: i32, y: i32, mx: u32, my: u32, width: usize, height: usize, bit_depth: u32);
    /// 色度 4 抽头插值, mx/my 为 1/8 相位; 窗口为左上 1 个, 右下 2 个样本
    #[allow(clippy::too_many_arguments)]
    fn interpolate_chroma(&self, dst: &mut [i16], src: &PlaneView, x: i32, y: i32, mx: u32, my: u32, width: usize, height: usize, bit_depth: u32);
    /// 把 (x, y) 起的 width x height 区域复制到独立缓冲, 越界部分取最近边缘样本
    fn emulated_edge(&self, src: &PlaneView, x: i32, y: i32, width: usize, height: usize) -> Plane;

    fn put_uni(&self, dst: &mut PlaneViewMut, src: &[i16], width: usize, height: usize, bit_depth: u32);
    fn put_uni_weighted(&self, dst: &mut PlaneViewMut, src: &[i16], width: usize, height: usize, bit_depth: u32, weight: &WeightParams);
    fn put_bi(&self, dst: &mut PlaneViewMut, src0: &[i16], src1: &[i16], width: usize, height: usize, bit_depth: u32);
    #[allow(clippy::too_many_arguments)]
    fn put_bi_weighted(&self, dst: &mut PlaneViewMut, src0: &[i16], src1: &[i16], width: usize, height: usize, bit_depth: u32, weight: &WeightParams);

    /// PCM 样本写入 (左移到解码位深)
    fn put_pcm(&self, dst: &mut PlaneViewMut, samples: &[u16], size: usize, pcm_bit_depth: u32, bit_depth: u32);

    /// 亮度边界 4 行/列滤波, (x, y) 为 Q 侧第一个样本
    fn deblock_luma(&self, plane: &mut Plane, x: usize, y: usize, vertical: bool, edge: &LumaEdge);
    /// 色度边界滤波 (bs = 2), len 为沿边界的样本数
    #[allow(clippy::too_many_arguments)]
    fn deblock_chroma(&self, plane: &mut Plane, x: usize, y: usize, vertical: bool, len: usize, tc: i32, no_p: bool, no_q: bool, bit_depth: u32);

    /// 对一个 CTB 区域做 SAO, src 为去块后的副本
    #[allow(clippy::too_many_arguments)]
    fn sao(&self, dst: &mut Plane, src: &Plane, x0: usize, y0: usize, width: usize, height: usize, params: &SaoComponent, borders: &SaoBorders, bit_depth: u32);
}

#[inline]
fn clip_pixel(v: i32, bit_depth: u32) -> u16 {
    v.clamp(0, (1 << bit_depth) - 1) as u16
}

/// 参考实现
#[derive(Debug, Clone)]
pub struct ReferenceDsp {
    dct: [[i32; 32]; 32],
}

impl Default for ReferenceDsp {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceDsp {
    pub fn new() -> Self {
        Self { dct: dct_matrix() }
    }

    /// 变换矩阵第 j 行第 n 列
    #[inline]
    fn coef(&self, kind: TransformKind, log2_size: u32, j: usize, n: usize) -> i32 {
        match kind {
            TransformKind::Dst => DST_MATRIX[j][n],
            TransformKind::Dct => self.dct[j << (5 - log2_size)][n],
        }
    }
}

// ============================================================
// 帧内预测
// ============================================================

fn filter_refs(refs: &IntraRefs, params: &IntraParams) -> IntraRefs {
    let n = 1usize << params.log2_size;
    if !params.filter_refs || params.mode == INTRA_DC || n == 4 {
        return refs.clone();
    }
    let min_dist = (params.mode as i32 - 26).abs().min((params.mode as i32 - 10).abs());
    let threshold = match n {
        8 => 7,
        16 => 1,
        _ => 0,
    };
    if min_dist <= threshold {
        return refs.clone();
    }

    let corner = i32::from(refs.top[0]);
    let (top, left) = (&refs.top, &refs.left);
    let bd_thr = 1 << (params.bit_depth - 5);
    if params.strong_smoothing
        && n == 32
        && (corner + i32::from(top[2 * n]) - 2 * i32::from(top[n])).abs() < bd_thr
        && (corner + i32::from(left[2 * n]) - 2 * i32::from(left[n])).abs() < bd_thr
    {
        let mut out = refs.clone();
        let top_end = i32::from(top[2 * n]);
        let left_end = i32::from(left[2 * n]);
        for i in 0..63 {
            out.top[i + 1] = (((63 - i as i32) * corner + (i as i32 + 1) * top_end + 32) >> 6) as u16;
            out.left[i + 1] = (((63 - i as i32) * corner + (i as i32 + 1) * left_end + 32) >> 6) as u16;
        }
        return out;
    }

    let mut out = refs.clone();
    out.top[0] = ((i32::from(left[1]) + 2 * corner + i32::from(top[1]) + 2) >> 2) as u16;
    out.left[0] = out.top[0];
    for i in 1..2 * n {
        out.top[i] = ((i32::from(top[i + 1]) + 2 * i32::from(top[i]) + i32::from(top[i - 1]) + 2) >> 2) as u16;
        out.left[i] = ((i32::from(left[i + 1]) + 2 * i32::from(left[i]) + i32::from(left[i - 1]) + 2) >> 2) as u16;
    }
    out
}

fn pred_planar(dst: &mut PlaneViewMut, refs: &IntraRefs, log2: u32) {
    let n = 1usize << log2;
    let top_right = i32::from(refs.top[n + 1]);
    let bottom_left = i32::from(refs.left[n + 1]);
    for y in 0..n {
        for x in 0..n {
            let v = (n - 1 - x) as i32 * i32::from(refs.left[y + 1])
                + (x + 1) as i32 * top_right
                + (n - 1 - y) as i32 * i32::from(refs.top[x + 1])
                + (y + 1) as i32 * bottom_left
                + n as i32;
            dst.set(x, y, (v >> (log2 + 1)) as u16);
        }
    }
}

fn pred_dc(dst: &mut PlaneViewMut, refs: &IntraRefs, log2: u32, edge_filters: bool) {
    let n = 1usize << log2;
    let sum: i32 = (1..=n).map(|i| i32::from(refs.top[i]) + i32::from(refs.left[i])).sum();
    let dc = (sum + n as i32) >> (log2 + 1);
    for y in 0..n {
        for x in 0..n {
            dst.set(x, y, dc as u16);
        }
    }
    if edge_filters {
        let top = |i: usize| i32::from(refs.top[i + 1]);
        let left = |i: usize| i32::from(refs.left[i + 1]);
        dst.set(0, 0, ((left(0) + 2 * dc + top(0) + 2) >> 2) as u16);
        for x in 1..n {
            dst.set(x, 0, ((top(x) + 3 * dc + 2) >> 2) as u16);
        }
        for y in 1..n {
            dst.set(0, y, ((left(y) + 3 * dc + 2) >> 2) as u16);
        }
    }
}

fn pred_angular(dst: &mut PlaneViewMut, refs: &IntraRefs, params: &IntraParams) {
    let n = 1usize << params.log2_size;
    let ni = n as i32;
    let mode = params.mode;
    let angle = INTRA_PRED_ANGLE[(mode - 2) as usize];
    let vertical = mode >= 18;
    let (main, side) = if vertical { (&refs.top, &refs.left) } else { (&refs.left, &refs.top) };

    // ref_buf[k + n] = ref[k], k 取 -n..=2n
    let mut ref_buf = vec![0i32; 3 * n + 1];
    for k in 0..=n {
        ref_buf[k + n] = i32::from(main[k]);
    }
    let last = (ni * angle) >> 5;
    if angle < 0 && last < -1 {
        let inv = INV_ANGLE[(mode - 11) as usize];
        for k in last..=-1 {
            let idx = ((k * inv + 128) >> 8) as usize;
            ref_buf[(k + ni) as usize] = i32::from(side[idx]);
        }
    } else {
        for k in n + 1..=2 * n {
            ref_buf[k + n] = i32::from(main[k]);
        }
    }

    for j in 0..n {
        let pos = (j as i32 + 1) * angle;
        let idx = pos >> 5;
        let fact = pos & 31;
        for i in 0..n {
            let base = (i as i32 + idx + 1 + ni) as usize;
            let v = if fact != 0 {
                ((32 - fact) * ref_buf[base] + fact * ref_buf[base + 1] + 16) >> 5
            } else {
                ref_buf[base]
            };
            if vertical {
                dst.set(i, j, v as u16);
            } else {
                dst.set(j, i, v as u16);
            }
        }
    }

    if params.edge_filters && angle == 0 {
        let corner = i32::from(refs.top[0]);
        for k in 0..n {
            if vertical {
                let v = i32::from(refs.top[1]) + ((i32::from(refs.left[k + 1]) - corner) >> 1);
                dst.set(0, k, clip_pixel(v, params.bit_depth));
            } else {
                let v = i32::from(refs.left[1]) + ((i32::from(refs.top[k + 1]) - corner) >> 1);
                dst.set(k, 0, clip_pixel(v, params.bit_depth));
            }
        }
    }
}

// ============================================================
// 插值
// ============================================================

fn interpolate<const TAPS: usize>(
    dst: &mut [i16],
    src: &PlaneView,
    x: i32,
    y: i32,
    fx: Option<&[i32; TAPS]>,
    fy: Option<&[i32; TAPS]>,
    width: usize,
    height: usize,
    bit_depth: u32,
) {
    let before = (TAPS / 2 - 1) as i32;
    let shift1 = bit_depth as i32 - 8;
    let sample = |sx: i32, sy: i32| i32::from(src.at(sx as usize, sy as usize));
    match (fx, fy) {
        (None, None) => {
            for j in 0..height {
                for i in 0..width {
                    dst[j * width + i] = (sample(x + i as i32, y + j as i32) << (14 - bit_depth)) as i16;
                }
            }
        }
        (Some(f), None) => {
            for j in 0..height {
                for i in 0..width {
                    let sum: i32 = (0..TAPS)
                        .map(|k| f[k] * sample(x + i as i32 + k as i32 - before, y + j as i32))
                        .sum();
                    dst[j * width + i] = (sum >> shift1) as i16;
                }
            }
        }
        (None, Some(f)) => {
            for j in 0..height {
                for i in 0..width {
                    let sum: i32 = (0..TAPS)
                        .map(|k| f[k] * sample(x + i as i32, y + j as i32 + k as i32 - before))
                        .sum();
                    dst[j * width + i] = (sum >> shift1) as i16;
                }
            }
        }
        (Some(hf), Some(vf)) => {
            let tmp_h = height + TAPS - 1;
            let mut tmp = vec![0i32; width * tmp_h];
            for j in 0..tmp_h {
                for i in 0..width {
                    let sy = y + j as i32 - before;
                    let sum: i32 = (0..TAPS)
                        .map(|k| hf[k] * sample(x + i as i32 + k as i32 - before, sy))
                        .sum();
                    tmp[j * width + i] = sum >> shift1;
                }
            }
            for j in 0..height {
                for i in 0..width {
                    let sum: i32 = (0..TAPS).map(|k| vf[k] * tmp[(j + k) * width + i]).sum();
                    dst[j * width + i] = (sum >> 6) as i16;
                }
            }
        }
    }
}

// ============================================================
// 去块滤波
// ============================================================

/// 边界两侧样本的访问器: side 为 0 表示 P 侧, 1 表示 Q 侧
struct EdgeAccess {
    x: usize,
    y: usize,
    vertical: bool,
}

impl EdgeAccess {
    /// 第 k 行/列上 P/Q 侧距离边界 i 的样本坐标
    #[inline]
    fn pos(&self, k: usize, q_side: bool, i: usize) -> (usize, usize) {
        match (self.vertical, q_side) {
            (true, false) => (self.x - 1 - i, self.y + k),
            (true, true) => (self.x + i, self.y + k),
            (false, false) => (self.x + k, self.y - 1 - i),
            (false, true) => (self.x + k, self.y + i),
        }
    }

    #[inline]
    fn p(&self, plane: &Plane, k: usize, i: usize) -> i32 {
        let (x, y) = self.pos(k, false, i);
        i32::from(plane.get(x, y))
    }

    #[inline]
    fn q(&self, plane: &Plane, k: usize, i: usize) -> i32 {
        let (x, y) = self.pos(k, true, i);
        i32::from(plane.get(x, y))
    }

    #[inline]
    fn set_p(&self, plane: &mut Plane, k: usize, i: usize, v: u16) {
        let (x, y) = self.pos(k, false, i);
        plane.set(x, y, v);
    }

    #[inline]
    fn set_q(&self, plane: &mut Plane, k: usize, i: usize, v: u16) {
        let (x, y) = self.pos(k, true, i);
        plane.set(x, y, v);
    }
}

impl DspKernels for ReferenceDsp {
    fn intra_pred(&self, dst: &mut PlaneViewMut, refs: &IntraRefs, params: &IntraParams) {
        let refs = filter_refs(refs, params);
        match params.mode {
            INTRA_PLANAR => pred_planar(dst, &refs, params.log2_size),
            INTRA_DC => pred_dc(dst, &refs, params.log2_size, params.edge_filters),
            _ => pred_angular(dst, &refs, params),
        }
    }

    fn inverse_transform(&self, coeffs: &mut [i32], log2_size: u32, kind: TransformKind, bit_depth: u32, extended_precision: bool) {
        let n = 1usize << log2_size;
        let coeff_max = if extended_precision { (1 << bit_depth.max(15)) - 1 } else { 32767 };
        let coeff_min = -coeff_max - 1;
        let mut tmp = vec![0i32; n * n];
        // 第一级: 列
        for x in 0..n {
            for y in 0..n {
                let mut sum: i64 = 0;
                for j in 0..n {
                    let c = coeffs[j * n + x];
                    if c != 0 {
                        sum += i64::from(self.coef(kind, log2_size, j, y)) * i64::from(c);
                    }
                }
                tmp[y * n + x] = (((sum + 64) >> 7) as i32).clamp(coeff_min, coeff_max);
            }
        }
        // 第二级: 行
        let bd_shift = (20 - bit_depth as i32).max(if extended_precision { 11 } else { 0 });
        let round = 1i64 << (bd_shift - 1);
        for y in 0..n {
            for x in 0..n {
                let mut sum: i64 = 0;
                for j in 0..n {
                    sum += i64::from(self.coef(kind, log2_size, j, x)) * i64::from(tmp[y * n + j]);
                }
                coeffs[y * n + x] = ((sum + round) >> bd_shift) as i32;
            }
        }
    }

    fn transform_skip(&self, coeffs: &mut [i32], log2_size: u32, bit_depth: u32, extended_precision: bool) {
        let bd_shift = (20 - bit_depth as i32).max(if extended_precision { 11 } else { 0 });
        let ts_shift = if extended_precision {
            (bd_shift - 2).min(5 + log2_size as i32)
        } else {
            5 + log2_size as i32
        };
        let round = 1 << (bd_shift - 1);
        for c in coeffs.iter_mut() {
            *c = ((*c << ts_shift) + round) >> bd_shift;
        }
    }

    fn rdpcm(&self, residual: &mut [i32], log2_size: u32, vertical: bool) {
        let n = 1usize << log2_size;
        if vertical {
            for y in 1..n {
                for x in 0..n {
                    residual[y * n + x] += residual[(y - 1) * n + x];
                }
            }
        } else {
            for y in 0..n {
                for x in 1..n {
                    residual[y * n + x] += residual[y * n + x - 1];
                }
            }
        }
    }

    fn add_residual(&self, dst: &mut PlaneViewMut, residual: &[i32], log2_size: u32, bit_depth: u32) {
        let n = (1usize << log2_size).min(dst.width());
        let rows = (1usize << log2_size).min(dst.height());
        let stride = 1usize << log2_size;
        for y in 0..rows {
            for x in 0..n {
                let v = i32::from(dst.at(x, y)) + residual[y * stride + x];
                dst.set(x, y, clip_pixel(v, bit_depth));
            }
        }
    }

    fn interpolate_luma(&self, dst: &mut [i16], src: &PlaneView, x: i32, y: i32, mx: u32, my: u32, width: usize, height: usize, bit_depth: u32) {
        let fx = (mx != 0).then(|| &QPEL_FILTERS[(mx - 1) as usize]);
        let fy = (my != 0).then(|| &QPEL_FILTERS[(my - 1) as usize]);
        interpolate::<8>(dst, src, x, y, fx, fy, width, height, bit_depth);
    }

    fn interpolate_chroma(&self, dst: &mut [i16], src: &PlaneView, x: i32, y: i32, mx: u32, my: u32, width: usize, height: usize, bit_depth: u32) {
        let fx = (mx != 0).then(|| &EPEL_FILTERS[(mx - 1) as usize]);
        let fy = (my != 0).then(|| &EPEL_FILTERS[(my - 1) as usize]);
        interpolate::<4>(dst, src, x, y, fx, fy, width, height, bit_depth);
    }

    fn emulated_edge(&self, src: &PlaneView, x: i32, y: i32, width: usize, height: usize) -> Plane {
        let mut out = Plane {
            data: vec![0; width * height],
            width,
            height,
            stride: width,
        };
        for j in 0..height {
            for i in 0..width {
                out.set(i, j, src.at_clamped(x + i as i32, y + j as i32));
            }
        }
        out
    }

    fn put_uni(&self, dst: &mut PlaneViewMut, src: &[i16], width: usize, height: usize, bit_depth: u32) {
        let shift = 14 - bit_depth;
        let offset = 1 << (shift - 1);
        for y in 0..height.min(dst.height()) {
            for x in 0..width.min(dst.width()) {
                let v = (i32::from(src[y * width + x]) + offset) >> shift;
                dst.set(x, y, clip_pixel(v, bit_depth));
            }
        }
    }

    fn put_uni_weighted(&self, dst: &mut PlaneViewMut, src: &[i16], width: usize, height: usize, bit_depth: u32, weight: &WeightParams) {
        let log2_wd = weight.log2_wd;
        for y in 0..height.min(dst.height()) {
            for x in 0..width.min(dst.width()) {
                let s = i32::from(src[y * width + x]);
                let v = if log2_wd >= 1 {
                    ((s * weight.w0 + (1 << (log2_wd - 1))) >> log2_wd) + weight.o0
                } else {
                    s * weight.w0 + weight.o0
                };
                dst.set(x, y, clip_pixel(v, bit_depth));
            }
        }
    }

    fn put_bi(&self, dst: &mut PlaneViewMut, src0: &[i16], src1: &[i16], width: usize, height: usize, bit_depth: u32) {
        let shift = 15 - bit_depth;
        let offset = 1 << (shift - 1);
        for y in 0..height.min(dst.height()) {
            for x in 0..width.min(dst.width()) {
                let i = y * width + x;
                let v = (i32::from(src0[i]) + i32::from(src1[i]) + offset) >> shift;
                dst.set(x, y, clip_pixel(v, bit_depth));
            }
        }
    }

    fn put_bi_weighted(&self, dst: &mut PlaneViewMut, src0: &[i16], src1: &[i16], width: usize, height: usize, bit_depth: u32, weight: &WeightParams) {
        let log2_wd = weight.log2_wd;
        for y in 0..height.min(dst.height()) {
            for x in 0..width.min(dst.width()) {
                let i = y * width + x;
                let v = (i32::from(src0[i]) * weight.w0
                    + i32::from(src1[i]) * weight.w1
                    + ((weight.o0 + weight.o1 + 1) << log2_wd))
                    >> (log2_wd + 1);
                dst.set(x, y, clip_pixel(v, bit_depth));
            }
        }
    }

    fn put_pcm(&self, dst: &mut PlaneViewMut, samples: &[u16], size: usize, pcm_bit_depth: u32, bit_depth: u32) {
        let shift = bit_depth - pcm_bit_depth;
        for y in 0..size.min(dst.height()) {
            for x in 0..size.min(dst.width()) {
                dst.set(x, y, samples[y * size + x] << shift);
            }
        }
    }

    fn deblock_luma(&self, plane: &mut Plane, x: usize, y: usize, vertical: bool, edge: &LumaEdge) {
        let e = EdgeAccess { x, y, vertical };
        let (beta, tc) = (edge.beta, edge.tc);
        let dp0 = (e.p(plane, 0, 2) - 2 * e.p(plane, 0, 1) + e.p(plane, 0, 0)).abs();
        let dp3 = (e.p(plane, 3, 2) - 2 * e.p(plane, 3, 1) + e.p(plane, 3, 0)).abs();
        let dq0 = (e.q(plane, 0, 2) - 2 * e.q(plane, 0, 1) + e.q(plane, 0, 0)).abs();
        let dq3 = (e.q(plane, 3, 2) - 2 * e.q(plane, 3, 1) + e.q(plane, 3, 0)).abs();
        let d = dp0 + dq0 + dp3 + dq3;
        if d >= beta {
            return;
        }
        let strong_line = |k: usize, dpq: i32| {
            2 * dpq < (beta >> 2)
                && (e.p(plane, k, 3) - e.p(plane, k, 0)).abs() + (e.q(plane, k, 0) - e.q(plane, k, 3)).abs() < (beta >> 3)
                && (e.p(plane, k, 0) - e.q(plane, k, 0)).abs() < ((5 * tc + 1) >> 1)
        };
        let strong = strong_line(0, dp0 + dq0) && strong_line(3, dp3 + dq3);
        let side_thr = (beta + (beta >> 1)) >> 3;
        let de_p = dp0 + dp3 < side_thr;
        let de_q = dq0 + dq3 < side_thr;
        let bd = edge.bit_depth;

        for k in 0..4 {
            let p: [i32; 4] = std::array::from_fn(|i| e.p(plane, k, i));
            let q: [i32; 4] = std::array::from_fn(|i| e.q(plane, k, i));
            if strong {
                let tc2 = 2 * tc;
                if !edge.no_p {
                    let np0 = (p[2] + 2 * p[1] + 2 * p[0] + 2 * q[0] + q[1] + 4) >> 3;
                    let np1 = (p[2] + p[1] + p[0] + q[0] + 2) >> 2;
                    let np2 = (2 * p[3] + 3 * p[2] + p[1] + p[0] + q[0] + 4) >> 3;
                    e.set_p(plane, k, 0, np0.clamp(p[0] - tc2, p[0] + tc2) as u16);
                    e.set_p(plane, k, 1, np1.clamp(p[1] - tc2, p[1] + tc2) as u16);
                    e.set_p(plane, k, 2, np2.clamp(p[2] - tc2, p[2] + tc2) as u16);
                }
                if !edge.no_q {
                    let nq0 = (p[1] + 2 * p[0] + 2 * q[0] + 2 * q[1] + q[2] + 4) >> 3;
                    let nq1 = (p[0] + q[0] + q[1] + q[2] + 2) >> 2;
                    let nq2 = (p[0] + q[0] + q[1] + 3 * q[2] + 2 * q[3] + 4) >> 3;
                    e.set_q(plane, k, 0, nq0.clamp(q[0] - tc2, q[0] + tc2) as u16);
                    e.set_q(plane, k, 1, nq1.clamp(q[1] - tc2, q[1] + tc2) as u16);
                    e.set_q(plane, k, 2, nq2.clamp(q[2] - tc2, q[2] + tc2) as u16);
                }
            } else {
                let mut delta = (9 * (q[0] - p[0]) - 3 * (q[1] - p[1]) + 8) >> 4;
                if delta.abs() >= tc * 10 {
                    continue;
                }
                delta = delta.clamp(-tc, tc);
                let tc_half = tc >> 1;
                if !edge.no_p {
                    e.set_p(plane, k, 0, clip_pixel(p[0] + delta, bd));
                    if de_p {
                        let dp = ((((p[2] + p[0] + 1) >> 1) - p[1] + delta) >> 1).clamp(-tc_half, tc_half);
                        e.set_p(plane, k, 1, clip_pixel(p[1] + dp, bd));
                    }
                }
                if !edge.no_q {
                    e.set_q(plane, k, 0, clip_pixel(q[0] - delta, bd));
                    if de_q {
                        let dq = ((((q[2] + q[0] + 1) >> 1) - q[1] - delta) >> 1).clamp(-tc_half, tc_half);
                        e.set_q(plane, k, 1, clip_pixel(q[1] + dq, bd));
                    }
                }
            }
        }
    }

    fn deblock_chroma(&self, plane: &mut Plane, x: usize, y: usize, vertical: bool, len: usize, tc: i32, no_p: bool, no_q: bool, bit_depth: u32) {
        let e = EdgeAccess { x, y, vertical };
        for k in 0..len {
            let (p0, p1) = (e.p(plane, k, 0), e.p(plane, k, 1));
            let (q0, q1) = (e.q(plane, k, 0), e.q(plane, k, 1));
            let delta = ((((q0 - p0) << 2) + p1 - q1 + 4) >> 3).clamp(-tc, tc);
            if !no_p {
                e.set_p(plane, k, 0, clip_pixel(p0 + delta, bit_depth));
            }
            if !no_q {
                e.set_q(plane, k, 0, clip_pixel(q0 - delta, bit_depth));
            }
        }
    }

    fn sao(&self, dst: &mut Plane, src: &Plane, x0: usize, y0: usize, width: usize, height: usize, params: &SaoComponent, borders: &SaoBorders, bit_depth: u32) {
        match params.sao_type {
            SaoType::NotApplied => {}
            SaoType::Band => {
                let mut table = [0usize; 32];
                for k in 0..4 {
                    table[(usize::from(params.band_position) + k) & 31] = k + 1;
                }
                let shift = bit_depth - 5;
                for y in y0..y0 + height {
                    for x in x0..x0 + width {
                        let s = src.get(x, y);
                        let band = table[usize::from(s >> shift)];
                        if band != 0 {
                            dst.set(x, y, clip_pixel(i32::from(s) + params.offset_val[band], bit_depth));
                        }
                    }
                }
            }
            SaoType::Edge => {
                const POS: [[(i32, i32); 2]; 4] = [
                    [(-1, 0), (1, 0)],
                    [(0, -1), (0, 1)],
                    [(-1, -1), (1, 1)],
                    [(1, -1), (-1, 1)],
                ];
                let [a, b] = POS[usize::from(params.eo_class & 3)];
                let x_end = x0 + width;
                let y_end = y0 + height;
                for y in y0..y_end {
                    for x in x0..x_end {
                        let blocked = |dx: i32, dy: i32| {
                            (dx < 0 && x == x0 && borders.left)
                                || (dx > 0 && x + 1 == x_end && borders.right)
                                || (dy < 0 && y == y0 && borders.top)
                                || (dy > 0 && y + 1 == y_end && borders.bottom)
                                || (dx < 0 && x == 0)
                                || (dy < 0 && y == 0)
                                || (dx > 0 && x + 1 >= src.width)
                                || (dy > 0 && y + 1 >= src.height)
                        };
                        if blocked(a.0, a.1) || blocked(b.0, b.1) {
                            continue;
                        }
                        let s = i32::from(src.get(x, y));
                        let na = i32::from(src.get((x as i32 + a.0) as usize, (y as i32 + a.1) as usize));
                        let nb = i32::from(src.get((x as i32 + b.0) as usize, (y as i32 + b.1) as usize));
                        let raw = (2 + (s - na).signum() + (s - nb).signum()) as usize;
                        let edge_idx = match raw {
                            0 | 1 => raw + 1,
                            2 => 0,
                            other => other,
                        };
                        if edge_idx != 0 {
                            dst.set(x, y, clip_pixel(s + params.offset_val[edge_idx], bit_depth));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs_const(n: usize, v: u16) -> IntraRefs {
        IntraRefs {
            top: vec![v; 2 * n + 1],
            left: vec![v; 2 * n + 1],
        }
    }

    fn intra(log2: u32, mode: u32) -> IntraParams {
        IntraParams {
            log2_size: log2,
            mode,
            bit_depth: 8,
            filter_refs: true,
            strong_smoothing: false,
            edge_filters: true,
        }
    }

    #[test]
    fn test_平坦参考样本所有模式输出常量() {
        let dsp = ReferenceDsp::new();
        for mode in 0..=34 {
            let mut plane = Plane::new(8, 8, 0).unwrap();
            let mut view = plane.region_mut(0, 0, 8, 8);
            dsp.intra_pred(&mut view, &refs_const(8, 100), &intra(3, mode));
            assert!(plane.data.iter().all(|&s| s == 100), "mode={}", mode);
        }
    }

    #[test]
    fn test_垂直模式复制上方样本() {
        let dsp = ReferenceDsp::new();
        let mut refs = refs_const(4, 50);
        for i in 0..4 {
            refs.top[i + 1] = 10 * (i as u16 + 1);
        }
        let mut plane = Plane::new(4, 4, 0).unwrap();
        let mut params = intra(2, INTRA_VERTICAL);
        params.edge_filters = false;
        dsp.intra_pred(&mut plane.region_mut(0, 0, 4, 4), &refs, &params);
        for y in 0..4 {
            assert_eq!(plane.get(2, y), 30);
        }
    }

    #[test]
    fn test_dc_only_inverse_dct() {
        let dsp = ReferenceDsp::new();
        // 4x4 DC 系数 64: 第一级 (64*64+64)>>7 = 32, 第二级 (32*64 + 2048)>>12 = 1
        let mut coeffs = vec![0i32; 16];
        coeffs[0] = 64;
        dsp.inverse_transform(&mut coeffs, 2, TransformKind::Dct, 8, false);
        assert!(coeffs.iter().all(|&c| c == 1));
    }

    #[test]
    fn test_put_uni_与_put_bi() {
        let dsp = ReferenceDsp::new();
        let mut plane = Plane::new(2, 1, 0).unwrap();
        let src = [100i16 << 6, 255 << 6];
        dsp.put_uni(&mut plane.region_mut(0, 0, 2, 1), &src, 2, 1, 8);
        assert_eq!(plane.data, vec![100, 255]);
        let a = [100i16 << 6, 0];
        let b = [102i16 << 6, 0];
        dsp.put_bi(&mut plane.region_mut(0, 0, 2, 1), &a, &b, 2, 1, 8);
        assert_eq!(plane.get(0, 0), 101);
    }

    #[test]
    fn test_整像素插值() {
        let dsp = ReferenceDsp::new();
        let mut plane = Plane::new(4, 4, 0).unwrap();
        plane.set(1, 1, 200);
        let mut out = vec![0i16; 4];
        dsp.interpolate_luma(&mut out, &plane.view(), 1, 1, 0, 0, 2, 2, 8);
        assert_eq!(out[0], 200 << 6);
        assert_eq!(out[1], 0);
    }

    #[test]
    fn test_边缘扩展后插值() {
        let dsp = ReferenceDsp::new();
        let mut plane = Plane::new(4, 4, 0).unwrap();
        for y in 0..4 {
            for x in 0..4 {
                plane.set(x, y, (10 * x + y) as u16);
            }
        }
        let padded = dsp.emulated_edge(&plane.view(), -3, -3, 9, 9);
        assert_eq!(padded.get(0, 0), 0);
        assert_eq!(padded.get(8, 0), 30);
        assert_eq!(padded.get(4, 5), 12);
        assert_eq!(padded.get(8, 8), 33);

        // 原点 (0, 0) 右侧的半像素, 左侧窗口来自扩展出的常量列
        let mut out = vec![0i16; 1];
        dsp.interpolate_luma(&mut out, &padded.view(), 3, 3, 2, 0, 1, 1, 8);
        assert_eq!(out[0], 40 * 10 - 11 * 20 + 4 * 30 - 30);
    }

    #[test]
    fn test_sao_band() {
        let dsp = ReferenceDsp::new();
        let src = Plane::new(4, 4, 80).unwrap(); // band 10
        let mut dst = src.clone();
        let params = SaoComponent {
            sao_type: SaoType::Band,
            band_position: 9,
            eo_class: 0,
            offset_val: [0, 1, 3, 0, 0],
        };
        dsp.sao(&mut dst, &src, 0, 0, 4, 4, &params, &SaoBorders::default(), 8);
        assert!(dst.data.iter().all(|&s| s == 83));
    }

    #[test]
    fn test_sao_edge_局部极小值() {
        let dsp = ReferenceDsp::new();
        let mut src = Plane::new(3, 1, 50).unwrap();
        src.set(1, 0, 40);
        let mut dst = src.clone();
        let params = SaoComponent {
            sao_type: SaoType::Edge,
            band_position: 0,
            eo_class: 0,
            offset_val: [0, 4, 0, 0, 0],
        };
        dsp.sao(&mut dst, &src, 0, 0, 3, 1, &params, &SaoBorders::default(), 8);
        assert_eq!(dst.data, vec![50, 44, 50]);
    }

    #[test]
    fn test_deblock_平坦区域不变() {
        let dsp = ReferenceDsp::new();
        let mut plane = Plane::new(8, 4, 90).unwrap();
        let before = plane.clone();
        let edge = LumaEdge {
            beta: 64,
            tc: 10,
            no_p: false,
            no_q: false,
            bit_depth: 8,
        };
        dsp.deblock_luma(&mut plane, 4, 0, true, &edge);
        assert_eq!(plane, before);
    }

    #[test]
    fn test_deblock_台阶被平滑() {
        let dsp = ReferenceDsp::new();
        let mut plane = Plane::new(8, 4, 0).unwrap();
        for y in 0..4 {
            for x in 0..8 {
                plane.set(x, y, if x < 4 { 60 } else { 70 });
            }
        }
        let edge = LumaEdge {
            beta: 64,
            tc: 4,
            no_p: false,
            no_q: true,
            bit_depth: 8,
        };
        dsp.deblock_luma(&mut plane, 4, 0, true, &edge);
        assert!(plane.get(3, 0) > 60);
        assert_eq!(plane.get(4, 0), 70);
    }
}
