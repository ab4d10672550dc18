//! CTU 解码上下文.
//!
//! [`CtuDecoder`] 在一个分片段内独占借用当前图像与边信息数组,
//! 编码四叉树/变换树的递归全程通过 `&mut self` 传递状态.
//! 不同阶段的实现分布在 `coding_tree`, `transform_tree`, `intra`,
//! `prediction`, `mc` 与 `filter` 模块中.

use tao_core::TaoResult;

use super::context::{Availability, BoundaryFlags, DeblockParams, LocalContext, SaoParams, SideArrays};
use super::dsp::{DspKernels, SaoComponent, SaoType};
use super::metadata::MetadataWriter;
use super::mvp::{MotionPredictor, MvpContext};
use super::params::{Pps, Sps};
use super::refs::{DecodedPicture, RefPicList};
use super::slice_header::SliceHeader;
use super::syntax::SyntaxReader;

/// 四叉树节点的解码结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuadtreeStatus {
    /// 分片段内还有后续 CTU
    Continue,
    /// end_of_slice_segment_flag 为 1 或到达图像末尾
    EndOfSlice,
}

/// CTU 解码器
pub struct CtuDecoder<'a> {
    pub sps: &'a Sps,
    pub pps: &'a Pps,
    pub sh: &'a SliceHeader,
    pub pic: &'a mut DecodedPicture,
    pub side: &'a mut SideArrays,
    pub refs: &'a [RefPicList; 2],
    pub syntax: &'a mut dyn SyntaxReader,
    pub dsp: &'a dyn DspKernels,
    pub mvp: &'a dyn MotionPredictor,
    pub metadata: Option<MetadataWriter>,
    pub lc: &'a mut LocalContext,
    /// 当前分片在图像内的序号
    pub slice_idx: u16,
}

impl<'a> CtuDecoder<'a> {
    /// 解码 tile 扫描序号为 `ctb_addr_ts` 的 CTU
    pub fn decode_ctu(&mut self, ctb_addr_ts: usize) -> TaoResult<QuadtreeStatus> {
        let log2_ctb = self.sps.log2_ctb_size;
        let ctb_addr_rs = self.pps.ctb_addr_ts_to_rs[ctb_addr_ts] as usize;
        let ctb_width = self.side.ctb_width;
        let x_ctb = (ctb_addr_rs % ctb_width) << log2_ctb;
        let y_ctb = (ctb_addr_rs / ctb_width) << log2_ctb;

        self.decode_neighbour(x_ctb, y_ctb, ctb_addr_ts);
        self.side.deblock[ctb_addr_rs] = DeblockParams {
            beta_offset: self.sh.beta_offset,
            tc_offset: self.sh.tc_offset,
            disabled: self.sh.disable_deblocking_filter,
        };
        self.side.filter_slice_edges[ctb_addr_rs] = u8::from(self.sh.loop_filter_across_slices_enabled);
        self.sao_param(x_ctb >> log2_ctb, y_ctb >> log2_ctb, ctb_addr_rs)?;
        self.coding_quadtree(x_ctb, y_ctb, log2_ctb, 0, 0, ctb_addr_rs)
    }

    // ========================================================
    // 邻居上下文
    // ========================================================

    /// 计算 CTU 的 tile 边界, 分片/tile 边界标志与左/上/右上/左上可用性
    pub fn decode_neighbour(&mut self, x_ctb: usize, y_ctb: usize, ctb_addr_ts: usize) {
        let sps = self.sps;
        let pps = self.pps;
        let log2_ctb = sps.log2_ctb_size;
        let ctb_size = 1usize << log2_ctb;
        let width = sps.width as usize;
        let height = sps.height as usize;
        let ctb_width = self.side.ctb_width;
        let ctb_addr_rs = pps.ctb_addr_ts_to_rs[ctb_addr_ts] as usize;
        let slice_addr = self.sh.slice_addr as i32;
        let in_slice = ctb_addr_rs as i64 - i64::from(slice_addr);

        self.side.tab_slice_address[ctb_addr_rs] = slice_addr;
        self.pic.ctb_slice_idx[ctb_addr_rs] = self.slice_idx;

        let tile_of_rs = |rs: usize| pps.tile_id[pps.ctb_addr_rs_to_ts[rs] as usize];
        let cur_tile = pps.tile_id[ctb_addr_ts];

        let lc = &mut *self.lc;
        if pps.entropy_coding_sync_enabled && x_ctb == 0 {
            lc.first_qp_group = true;
        }
        if pps.tiles_enabled {
            if ctb_addr_ts > 0 && cur_tile != pps.tile_id[ctb_addr_ts - 1] {
                lc.first_qp_group = true;
            }
            let col = pps.col_idx_x[x_ctb >> log2_ctb] as usize;
            lc.end_of_tiles_x = ((pps.col_bd[col + 1] as usize) << log2_ctb).min(width);
        } else {
            lc.end_of_tiles_x = width;
        }
        lc.end_of_tiles_y = (y_ctb + ctb_size).min(height);

        let mut flags = BoundaryFlags::empty();
        if pps.tiles_enabled {
            if x_ctb > 0 && cur_tile != tile_of_rs(ctb_addr_rs - 1) {
                flags |= BoundaryFlags::TILE_LEFT;
            }
            if x_ctb > 0 && self.side.tab_slice_address[ctb_addr_rs - 1] != slice_addr {
                flags |= BoundaryFlags::SLICE_LEFT;
            }
            if y_ctb > 0 && cur_tile != tile_of_rs(ctb_addr_rs - ctb_width) {
                flags |= BoundaryFlags::TILE_UP;
            }
            if y_ctb > 0 && self.side.tab_slice_address[ctb_addr_rs - ctb_width] != slice_addr {
                flags |= BoundaryFlags::SLICE_UP;
            }
        } else {
            if in_slice <= 0 {
                flags |= BoundaryFlags::SLICE_LEFT;
            }
            if in_slice < ctb_width as i64 {
                flags |= BoundaryFlags::SLICE_UP;
            }
        }
        lc.boundary_flags = flags;

        let w = ctb_width as i64;
        lc.ctb_left_flag = x_ctb > 0 && in_slice > 0 && !flags.contains(BoundaryFlags::TILE_LEFT);
        lc.ctb_up_flag = y_ctb > 0 && in_slice >= w && !flags.contains(BoundaryFlags::TILE_UP);
        lc.ctb_up_right_flag = y_ctb > 0
            && in_slice + 1 >= w
            && x_ctb + ctb_size < width
            && cur_tile == tile_of_rs(ctb_addr_rs + 1 - ctb_width);
        lc.ctb_up_left_flag = x_ctb > 0
            && y_ctb > 0
            && in_slice - 1 >= w
            && cur_tile == tile_of_rs(ctb_addr_rs - 1 - ctb_width);
    }

    /// z 扫描可用性
    pub fn availability(&self) -> Availability<'_> {
        Availability {
            sps: self.sps,
            pps: self.pps,
            tab_slice_address: &self.side.tab_slice_address,
        }
    }

    /// 供运动矢量预测器使用的只读上下文
    pub fn mvp_context(&self) -> MvpContext<'_> {
        MvpContext {
            sps: self.sps,
            pps: self.pps,
            sh: self.sh,
            poc: self.pic.poc,
            motion: &self.pic.motion,
            avail: self.availability(),
            refs: self.refs,
        }
    }

    // ========================================================
    // QP
    // ========================================================

    /// 量化组的亮度 QP 预测值 qPY_PRED
    fn qpy_pred(&mut self, x_base: usize, y_base: usize) -> i32 {
        let sps = self.sps;
        let log2_ctb = sps.log2_ctb_size;
        let ctb_mask = (1usize << log2_ctb) - 1;
        let qp_block_mask = (1usize << (log2_ctb - self.pps.diff_cu_qp_delta_depth)) - 1;
        let log2_min_cb = sps.log2_min_cb_size;
        let x_qg = x_base - (x_base & qp_block_mask);
        let y_qg = y_base - (y_base & qp_block_mask);
        let x_cb = x_qg >> log2_min_cb;
        let y_cb = y_qg >> log2_min_cb;
        let min_cb_width = self.side.min_cb_width;

        let avail_a = (x_base & ctb_mask) != 0 && (x_qg & ctb_mask) != 0;
        let avail_b = (y_base & ctb_mask) != 0 && (y_qg & ctb_mask) != 0;

        let pred = if self.lc.first_qp_group || (x_qg == 0 && y_qg == 0) {
            self.lc.first_qp_group = !self.lc.tu.is_cu_qp_delta_coded;
            self.sh.slice_qp
        } else {
            self.lc.qpy_pred
        };
        let qp_a = if avail_a {
            i32::from(self.side.qp_y_tab[y_cb * min_cb_width + x_cb - 1])
        } else {
            pred
        };
        let qp_b = if avail_b {
            i32::from(self.side.qp_y_tab[(y_cb - 1) * min_cb_width + x_cb])
        } else {
            pred
        };
        (qp_a + qp_b + 1) >> 1
    }

    /// 由预测值与 cu_qp_delta 得到 QpY
    pub fn set_qpy(&mut self, x_base: usize, y_base: usize) {
        let pred = self.qpy_pred(x_base, y_base);
        let delta = self.lc.tu.cu_qp_delta;
        self.lc.qp_y = if delta != 0 {
            let off = self.sps.qp_bd_offset;
            (pred + delta + 52 + 2 * off).rem_euclid(52 + off) - off
        } else {
            pred
        };
    }

    // ========================================================
    // SAO 语法
    // ========================================================

    fn sao_param(&mut self, rx: usize, ry: usize, ctb_addr_rs: usize) -> TaoResult<()> {
        let sh = self.sh;
        let mut merge_left = false;
        let mut merge_up = false;
        if sh.sao_enabled[0] || sh.sao_enabled[1] {
            if rx > 0 && self.lc.ctb_left_flag {
                merge_left = self.syntax.sao_merge_flag()?;
            }
            if ry > 0 && !merge_left && self.lc.ctb_up_flag {
                merge_up = self.syntax.sao_merge_flag()?;
            }
        }

        let mut sao = if merge_left {
            self.side.sao[ctb_addr_rs - 1]
        } else if merge_up {
            self.side.sao[ctb_addr_rs - self.side.ctb_width]
        } else {
            SaoParams::default()
        };
        let components = if self.sps.chroma_array_type() != 0 { 3 } else { 1 };
        for c in 0..3 {
            if c >= components || !sh.sao_enabled[c] {
                sao.components[c] = SaoComponent::default();
                continue;
            }
            if merge_left || merge_up {
                continue;
            }
            sao.components[c] = self.sao_component(c, &sao.components)?;
        }
        self.side.sao[ctb_addr_rs] = sao;
        Ok(())
    }

    fn sao_component(&mut self, c_idx: usize, decoded: &[SaoComponent; 3]) -> TaoResult<SaoComponent> {
        let (bit_depth, scale) = if c_idx == 0 {
            (self.sps.bit_depth, self.pps.log2_sao_offset_scale_luma)
        } else {
            (self.sps.bit_depth_chroma, self.pps.log2_sao_offset_scale_chroma)
        };
        let mut comp = SaoComponent::default();
        if c_idx == 2 {
            comp.sao_type = decoded[1].sao_type;
            comp.eo_class = decoded[1].eo_class;
        } else {
            comp.sao_type = match self.syntax.sao_type_idx()? {
                0 => SaoType::NotApplied,
                1 => SaoType::Band,
                _ => SaoType::Edge,
            };
        }
        if comp.sao_type == SaoType::NotApplied {
            return Ok(comp);
        }

        let max = (1u32 << (bit_depth.min(10) - 5)) - 1;
        let mut offsets = [0i32; 4];
        for o in offsets.iter_mut() {
            *o = self.syntax.sao_offset_abs(max)?.min(max) as i32;
        }
        if comp.sao_type == SaoType::Band {
            for o in offsets.iter_mut() {
                if *o != 0 && self.syntax.sao_offset_sign()? {
                    *o = -*o;
                }
            }
            comp.band_position = self.syntax.sao_band_position()? & 31;
        } else {
            if c_idx != 2 {
                comp.eo_class = self.syntax.sao_eo_class()? & 3;
            }
            offsets[2] = -offsets[2];
            offsets[3] = -offsets[3];
        }
        for (i, o) in offsets.iter().enumerate() {
            comp.offset_val[i + 1] = o * (1 << scale);
        }
        Ok(comp)
    }
}
