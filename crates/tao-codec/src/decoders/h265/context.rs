//! 解码上下文: 每帧的边信息数组与 CTU 内的局部状态.
//!
//! 边信息数组按 SPS 几何分配 (SPS 切换时重新分配), 每帧开始时清理
//! 边界强度, cbf 与分片地址表. 局部状态 [`LocalContext`] 在 CU/TU/PU 入口处重置.

use bitflags::bitflags;
use tao_core::TaoResult;

use super::dsp::SaoComponent;
use super::params::{Pps, Sps};

fn alloc<T: Clone>(len: usize, value: T) -> TaoResult<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, value);
    Ok(v)
}

// ============================================================
// 每 CTB 的环路滤波参数
// ============================================================

/// 一个 CTB 的 SAO 参数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaoParams {
    pub components: [SaoComponent; 3],
}

/// 一个 CTB 的去块参数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeblockParams {
    /// 已乘 2
    pub beta_offset: i32,
    /// 已乘 2
    pub tc_offset: i32,
    pub disabled: bool,
}

// ============================================================
// 边信息数组
// ============================================================

/// 每帧的边信息数组
#[derive(Debug, Clone, Default)]
pub struct SideArrays {
    pub min_cb_width: usize,
    pub min_cb_height: usize,
    /// 4x4 网格宽度
    pub min_pu_width: usize,
    pub min_pu_height: usize,
    pub min_tb_width: usize,
    pub ctb_width: usize,
    pub ctb_height: usize,

    /// 最小 CB 网格
    pub skip_flag: Vec<u8>,
    pub ct_depth: Vec<u8>,
    pub qp_y_tab: Vec<i8>,
    /// 4x4 网格: 帧内亮度模式
    pub tab_ipm: Vec<u8>,
    /// 4x4 网格: 去块/SAO 旁路 (PCM 或 transquant bypass)
    pub is_pcm: Vec<u8>,
    /// 最小 TB 网格 (每行 ctb_width << (log2_ctb - log2_min_tb) 项)
    pub cbf_luma: Vec<u8>,
    pub cbf_stride: usize,
    /// 每 CTB 的分片地址 (-1 表示未解码)
    pub tab_slice_address: Vec<i32>,
    pub sao: Vec<SaoParams>,
    pub deblock: Vec<DeblockParams>,
    /// 该 CTB 所在分片是否允许跨分片边界滤波
    pub filter_slice_edges: Vec<u8>,
    /// 4x4 网格: 水平边界 (块上边) 强度
    pub horizontal_bs: Vec<u8>,
    /// 4x4 网格: 垂直边界 (块左边) 强度
    pub vertical_bs: Vec<u8>,
}

impl SideArrays {
    /// 按 SPS 几何分配
    pub fn allocate(sps: &Sps) -> TaoResult<Self> {
        let min_cb = (sps.min_cb_width * sps.min_cb_height) as usize;
        let min_pu_width = sps.min_pu_width as usize;
        let min_pu_height = sps.min_pu_height as usize;
        let min_pu = min_pu_width * min_pu_height;
        let ctb_count = sps.ctb_count() as usize;
        let cbf_stride = (sps.ctb_width as usize) << (sps.log2_ctb_size - sps.log2_min_tb_size);
        let cbf_rows = (sps.ctb_height as usize) << (sps.log2_ctb_size - sps.log2_min_tb_size);
        Ok(Self {
            min_cb_width: sps.min_cb_width as usize,
            min_cb_height: sps.min_cb_height as usize,
            min_pu_width,
            min_pu_height,
            min_tb_width: sps.min_tb_width as usize,
            ctb_width: sps.ctb_width as usize,
            ctb_height: sps.ctb_height as usize,
            skip_flag: alloc(min_cb, 0)?,
            ct_depth: alloc(min_cb, 0)?,
            qp_y_tab: alloc(min_cb, 0)?,
            tab_ipm: alloc(min_pu, 1)?,
            is_pcm: alloc(min_pu, 0)?,
            cbf_luma: alloc(cbf_stride * cbf_rows, 0)?,
            cbf_stride,
            tab_slice_address: alloc(ctb_count, -1)?,
            sao: alloc(ctb_count, SaoParams::default())?,
            deblock: alloc(ctb_count, DeblockParams::default())?,
            filter_slice_edges: alloc(ctb_count, 0)?,
            horizontal_bs: alloc(min_pu, 0)?,
            vertical_bs: alloc(min_pu, 0)?,
        })
    }

    /// 新图像开始时清理
    pub fn reset_for_picture(&mut self) {
        self.horizontal_bs.fill(0);
        self.vertical_bs.fill(0);
        self.cbf_luma.fill(0);
        self.is_pcm.fill(0);
        self.tab_slice_address.fill(-1);
    }

    /// 以 value 填充网格上的矩形 (网格单位), 超出网格的部分被裁掉
    pub fn fill_grid<T: Copy>(tab: &mut [T], stride: usize, x0: usize, y0: usize, w: usize, h: usize, value: T) {
        if stride == 0 {
            return;
        }
        let rows = tab.len() / stride;
        let x_end = (x0 + w.max(1)).min(stride);
        if x0 >= x_end {
            return;
        }
        for y in y0..(y0 + h.max(1)).min(rows) {
            tab[y * stride + x0..y * stride + x_end].fill(value);
        }
    }

    /// 标记去块/SAO 旁路 (亮度坐标)
    pub fn mark_bypass(&mut self, x0: usize, y0: usize, size: usize) {
        Self::fill_grid(&mut self.is_pcm, self.min_pu_width, x0 >> 2, y0 >> 2, size >> 2, size >> 2, 1);
    }

    /// 写入帧内亮度模式 (亮度坐标)
    pub fn set_ipm(&mut self, x0: usize, y0: usize, size: usize, mode: u8) {
        Self::fill_grid(&mut self.tab_ipm, self.min_pu_width, x0 >> 2, y0 >> 2, size >> 2, size >> 2, mode);
    }

    #[inline]
    pub fn skip_flag_at(&self, x: usize, y: usize, log2_min_cb: u32) -> u8 {
        self.skip_flag[(y >> log2_min_cb) * self.min_cb_width + (x >> log2_min_cb)]
    }

    #[inline]
    pub fn ct_depth_at(&self, x: usize, y: usize, log2_min_cb: u32) -> u8 {
        self.ct_depth[(y >> log2_min_cb) * self.min_cb_width + (x >> log2_min_cb)]
    }

    #[inline]
    pub fn qp_y_at(&self, x: usize, y: usize, log2_min_cb: u32) -> i32 {
        i32::from(self.qp_y_tab[(y >> log2_min_cb) * self.min_cb_width + (x >> log2_min_cb)])
    }

    #[inline]
    pub fn ipm_at(&self, x: usize, y: usize) -> u8 {
        self.tab_ipm[(y >> 2) * self.min_pu_width + (x >> 2)]
    }

    #[inline]
    pub fn is_pcm_at(&self, x: usize, y: usize) -> bool {
        self.is_pcm[(y >> 2) * self.min_pu_width + (x >> 2)] != 0
    }

    #[inline]
    pub fn cbf_luma_at(&self, x: usize, y: usize, log2_min_tb: u32) -> bool {
        self.cbf_luma[(y >> log2_min_tb) * self.cbf_stride + (x >> log2_min_tb)] != 0
    }

    /// CTB 光栅地址
    #[inline]
    pub fn ctb_addr(&self, x: usize, y: usize, log2_ctb: u32) -> usize {
        (y >> log2_ctb) * self.ctb_width + (x >> log2_ctb)
    }
}

// ============================================================
// 可用性
// ============================================================

/// z 扫描顺序可用性判断 (6.4.1)
#[derive(Clone, Copy)]
pub struct Availability<'a> {
    pub sps: &'a Sps,
    pub pps: &'a Pps,
    pub tab_slice_address: &'a [i32],
}

impl<'a> Availability<'a> {
    /// 当前块 (x_cur, y_cur) 能否使用相邻位置 (x_n, y_n)
    pub fn z_scan(&self, x_cur: i32, y_cur: i32, x_n: i32, y_n: i32) -> bool {
        let sps = self.sps;
        if x_n < 0 || y_n < 0 || x_n >= sps.width as i32 || y_n >= sps.height as i32 {
            return false;
        }
        let log2_min_tb = sps.log2_min_tb_size;
        let stride = self.pps.min_tb_stride(sps);
        let zs = |x: i32, y: i32| self.pps.min_tb_addr_zs[(y as usize >> log2_min_tb) * stride + (x as usize >> log2_min_tb)];
        if zs(x_n, y_n) > zs(x_cur, y_cur) {
            return false;
        }
        let log2_ctb = sps.log2_ctb_size;
        let ctb_w = sps.ctb_width as usize;
        let ctb_cur = (y_cur as usize >> log2_ctb) * ctb_w + (x_cur as usize >> log2_ctb);
        let ctb_n = (y_n as usize >> log2_ctb) * ctb_w + (x_n as usize >> log2_ctb);
        let slice_n = self.tab_slice_address[ctb_n];
        if slice_n < 0 || slice_n != self.tab_slice_address[ctb_cur] {
            return false;
        }
        self.pps.tile_id[self.pps.ctb_addr_rs_to_ts[ctb_n] as usize]
            == self.pps.tile_id[self.pps.ctb_addr_rs_to_ts[ctb_cur] as usize]
    }
}

// ============================================================
// 局部状态
// ============================================================

bitflags! {
    /// 当前 CTB 的分片/tile 左边界与上边界
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct BoundaryFlags: u8 {
        const SLICE_LEFT = 1 << 0;
        const SLICE_UP = 1 << 1;
        const TILE_LEFT = 1 << 2;
        const TILE_UP = 1 << 3;
    }
}

/// 预测模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PredMode {
    #[default]
    Inter,
    Intra,
    Skip,
}

/// 划分模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PartMode {
    #[default]
    Part2Nx2N,
    Part2NxN,
    PartNx2N,
    PartNxN,
    Part2NxnU,
    Part2NxnD,
    PartnLx2N,
    PartnRx2N,
}

impl PartMode {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Part2Nx2N,
            1 => Self::Part2NxN,
            2 => Self::PartNx2N,
            3 => Self::PartNxN,
            4 => Self::Part2NxnU,
            5 => Self::Part2NxnD,
            6 => Self::PartnLx2N,
            7 => Self::PartnRx2N,
            _ => return None,
        })
    }

    pub fn is_amp(&self) -> bool {
        matches!(self, Self::Part2NxnU | Self::Part2NxnD | Self::PartnLx2N | Self::PartnRx2N)
    }

    /// 各 PU 的 (x 偏移, y 偏移, 宽, 高), cb 为 CU 边长
    pub fn partitions(&self, cb: usize) -> Vec<(usize, usize, usize, usize)> {
        let h = cb / 2;
        let q = cb / 4;
        match self {
            Self::Part2Nx2N => vec![(0, 0, cb, cb)],
            Self::Part2NxN => vec![(0, 0, cb, h), (0, h, cb, h)],
            Self::PartNx2N => vec![(0, 0, h, cb), (h, 0, h, cb)],
            Self::PartNxN => vec![(0, 0, h, h), (h, 0, h, h), (0, h, h, h), (h, h, h, h)],
            Self::Part2NxnU => vec![(0, 0, cb, q), (0, q, cb, cb - q)],
            Self::Part2NxnD => vec![(0, 0, cb, cb - q), (0, cb - q, cb, q)],
            Self::PartnLx2N => vec![(0, 0, q, cb), (q, 0, cb - q, cb)],
            Self::PartnRx2N => vec![(0, 0, cb - q, cb), (cb - q, 0, q, cb)],
        }
    }
}

/// 编码单元状态
#[derive(Debug, Clone, Copy, Default)]
pub struct CodingUnit {
    pub x: usize,
    pub y: usize,
    pub log2_cb_size: u32,
    pub pred_mode: PredMode,
    pub part_mode: PartMode,
    pub cu_transquant_bypass: bool,
    pub pcm_flag: bool,
    pub intra_split: bool,
    pub max_trafo_depth: u32,
}

/// 变换单元状态
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformUnit {
    pub is_cu_qp_delta_coded: bool,
    pub cu_qp_delta: i32,
    pub is_cu_chroma_qp_offset_coded: bool,
    pub cu_qp_offset_cb: i32,
    pub cu_qp_offset_cr: i32,
    pub intra_pred_mode: u32,
    pub intra_pred_mode_c: u32,
    pub chroma_mode_c: u8,
    /// 跨分量预测缩放 (0 表示不启用)
    pub res_scale_val: i32,
    pub cross_pf: bool,
}

/// 预测单元状态 (帧内模式按 NxN 子块)
#[derive(Debug, Clone, Copy, Default)]
pub struct PredictionUnit {
    pub intra_pred_mode: [u32; 4],
    pub intra_pred_mode_c: [u32; 4],
    pub chroma_mode_c: [u8; 4],
}

/// CTU 解码的局部状态
#[derive(Debug, Clone, Default)]
pub struct LocalContext {
    pub cu: CodingUnit,
    pub tu: TransformUnit,
    pub pu: PredictionUnit,
    pub qp_y: i32,
    pub qpy_pred: i32,
    pub first_qp_group: bool,
    pub ctb_left_flag: bool,
    pub ctb_up_flag: bool,
    pub ctb_up_right_flag: bool,
    pub ctb_up_left_flag: bool,
    pub end_of_tiles_x: usize,
    pub end_of_tiles_y: usize,
    pub boundary_flags: BoundaryFlags,
    /// 当前 CU 开始时熵解码器的字节位置
    pub cu_start_bytes: usize,
    /// 最近一个亮度变换块的残差 (跨分量预测)
    pub residual_y: Vec<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amp_划分() {
        let parts = PartMode::Part2NxnU.partitions(16);
        assert_eq!(parts, vec![(0, 0, 16, 4), (0, 4, 16, 12)]);
        let parts = PartMode::PartnRx2N.partitions(32);
        assert_eq!(parts, vec![(0, 0, 24, 32), (24, 0, 8, 32)]);
        assert!(PartMode::PartnLx2N.is_amp());
        assert_eq!(PartMode::from_code(8), None);
    }

    #[test]
    fn test_fill_grid_裁剪() {
        let mut tab = vec![0u8; 4 * 2];
        SideArrays::fill_grid(&mut tab, 4, 2, 0, 4, 4, 7);
        assert_eq!(tab, vec![0, 0, 7, 7, 0, 0, 7, 7]);
    }
}
