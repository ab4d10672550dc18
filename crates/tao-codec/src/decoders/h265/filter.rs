//! 环路滤波: 边界强度, 去块滤波与样本自适应偏移 (SAO).
//!
//! 边界强度在 CTU 解码期间按变换块/预测块写入 [`SideArrays`];
//! 整帧的去块与 SAO 在所有分片解码完成后由 [`LoopFilter`] 执行.
//! 去块先处理全帧垂直边界, 再在其输出上处理水平边界;
//! SAO 读取去块后的副本, 写回原图像.

use rayon::prelude::*;

use super::context::{BoundaryFlags, SideArrays};
use super::ctu::CtuDecoder;
use super::dsp::{DspKernels, LumaEdge, SaoBorders, SaoType};
use super::params::{Pps, Sps};
use super::picture::{Mv, MvField, Picture, Plane, PredFlag};
use super::refs::{RefPicList, SliceRefs};
use super::tables::{BETA_TABLE, TC_TABLE, chroma_qp};

/// 色度去块固定使用 bS = 2 的 tc 偏移
const CHROMA_TC_OFFSET: i32 = 2;

// ============================================================
// 边界强度
// ============================================================

/// 当前分片参考列表中各方向参考图像的 POC
fn current_ref_pocs(refs: &[RefPicList; 2], mvf: &MvField) -> [Option<i32>; 2] {
    std::array::from_fn(|list| {
        if !mvf.pred_flag.uses(list) {
            return None;
        }
        usize::try_from(mvf.ref_idx[list])
            .ok()
            .and_then(|idx| refs[list].get(idx))
            .map(|e| e.poc)
    })
}

/// 相邻分片记录的参考 POC
fn slice_ref_pocs(refs: Option<&SliceRefs>, mvf: &MvField) -> [Option<i32>; 2] {
    std::array::from_fn(|list| {
        if !mvf.pred_flag.uses(list) {
            return None;
        }
        let idx = usize::try_from(mvf.ref_idx[list]).ok()?;
        refs?.poc[list].get(idx).copied()
    })
}

/// 两个帧间块之间的运动边界强度 (0 或 1)
///
/// 参考图像以 POC 比较, 运动矢量差达到 4 个 1/4 像素即视为不连续.
pub(crate) fn motion_bs(curr: &MvField, curr_pocs: [Option<i32>; 2], neigh: &MvField, neigh_pocs: [Option<i32>; 2]) -> u8 {
    let far = |a: Mv, b: Mv| (i32::from(a.x) - i32::from(b.x)).abs() >= 4 || (i32::from(a.y) - i32::from(b.y)).abs() >= 4;
    let curr_bi = curr.pred_flag == PredFlag::Bi;
    let neigh_bi = neigh.pred_flag == PredFlag::Bi;
    match (curr_bi, neigh_bi) {
        (true, true) => {
            let [c0, c1] = curr_pocs;
            let [n0, n1] = neigh_pocs;
            if n0 == c0 && c0 == c1 && n0 == n1 {
                let straight = far(neigh.mv[0], curr.mv[0]) || far(neigh.mv[1], curr.mv[1]);
                let crossed = far(neigh.mv[1], curr.mv[0]) || far(neigh.mv[0], curr.mv[1]);
                u8::from(straight && crossed)
            } else if n0 == c0 && n1 == c1 {
                u8::from(far(neigh.mv[0], curr.mv[0]) || far(neigh.mv[1], curr.mv[1]))
            } else if n1 == c0 && n0 == c1 {
                u8::from(far(neigh.mv[1], curr.mv[0]) || far(neigh.mv[0], curr.mv[1]))
            } else {
                1
            }
        }
        (false, false) => {
            let pick = |m: &MvField, pocs: [Option<i32>; 2]| {
                if m.pred_flag.uses(0) { (m.mv[0], pocs[0]) } else { (m.mv[1], pocs[1]) }
            };
            let (a, ref_a) = pick(curr, curr_pocs);
            let (b, ref_b) = pick(neigh, neigh_pocs);
            if ref_a == ref_b { u8::from(far(a, b)) } else { 1 }
        }
        _ => 1,
    }
}

impl CtuDecoder<'_> {
    /// 计算块 (x0, y0, 1 << log2_size) 上边/左边以及内部 PU 边界的强度
    pub(super) fn boundary_strengths(&mut self, x0: usize, y0: usize, log2_size: u32) {
        let sps = self.sps;
        let pps = self.pps;
        let sh = self.sh;
        let refs = self.refs;
        let log2_ctb = sps.log2_ctb_size;
        let log2_min_tb = sps.log2_min_tb_size;
        let ctb_mask = (1usize << log2_ctb) - 1;
        let ctb_width = sps.ctb_width as usize;
        let flags = self.lc.boundary_flags;
        let size = 1usize << log2_size;
        let pic = &*self.pic;
        let side = &mut *self.side;
        let stride = side.min_pu_width;
        let is_intra = pic.motion.at(x0, y0).pred_flag == PredFlag::Intra;

        let edge_bs = |side: &SideArrays, xq: usize, yq: usize, xp: usize, yp: usize, neigh_refs: Option<&SliceRefs>| {
            let curr = pic.motion.at(xq, yq);
            let neigh = pic.motion.at(xp, yp);
            if curr.pred_flag == PredFlag::Intra || neigh.pred_flag == PredFlag::Intra {
                2
            } else if side.cbf_luma_at(xq, yq, log2_min_tb) || side.cbf_luma_at(xp, yp, log2_min_tb) {
                1
            } else {
                let neigh_pocs = match neigh_refs {
                    Some(r) => slice_ref_pocs(Some(r), neigh),
                    None => current_ref_pocs(refs, neigh),
                };
                motion_bs(curr, current_ref_pocs(refs, curr), neigh, neigh_pocs)
            }
        };

        let at_ctb_top = y0 & ctb_mask == 0;
        let upper_blocked = at_ctb_top
            && ((!sh.loop_filter_across_slices_enabled && flags.contains(BoundaryFlags::SLICE_UP))
                || (!pps.loop_filter_across_tiles_enabled && flags.contains(BoundaryFlags::TILE_UP)));
        if y0 > 0 && y0 & 7 == 0 && !upper_blocked {
            let neigh_refs = if flags.contains(BoundaryFlags::SLICE_UP) {
                pic.refs_at(x0, y0 - 1, log2_ctb, ctb_width)
            } else {
                None
            };
            for i in (0..size).step_by(4) {
                let bs = edge_bs(side, x0 + i, y0, x0 + i, y0 - 1, neigh_refs);
                side.horizontal_bs[(y0 >> 2) * stride + ((x0 + i) >> 2)] = bs;
            }
        }

        let at_ctb_left = x0 & ctb_mask == 0;
        let left_blocked = at_ctb_left
            && ((!sh.loop_filter_across_slices_enabled && flags.contains(BoundaryFlags::SLICE_LEFT))
                || (!pps.loop_filter_across_tiles_enabled && flags.contains(BoundaryFlags::TILE_LEFT)));
        if x0 > 0 && x0 & 7 == 0 && !left_blocked {
            let neigh_refs = if flags.contains(BoundaryFlags::SLICE_LEFT) {
                pic.refs_at(x0 - 1, y0, log2_ctb, ctb_width)
            } else {
                None
            };
            for i in (0..size).step_by(4) {
                let bs = edge_bs(side, x0, y0 + i, x0 - 1, y0 + i, neigh_refs);
                side.vertical_bs[((y0 + i) >> 2) * stride + (x0 >> 2)] = bs;
            }
        }

        // 块内部的 PU 边界 (8x8 网格)
        if log2_size > 2 && !is_intra {
            for j in (8..size).step_by(8) {
                for i in (0..size).step_by(4) {
                    let curr = pic.motion.at(x0 + i, y0 + j);
                    let top = pic.motion.at(x0 + i, y0 + j - 1);
                    let bs = motion_bs(curr, current_ref_pocs(refs, curr), top, current_ref_pocs(refs, top));
                    side.horizontal_bs[((y0 + j) >> 2) * stride + ((x0 + i) >> 2)] = bs;
                }
            }
            for j in (0..size).step_by(4) {
                for i in (8..size).step_by(8) {
                    let curr = pic.motion.at(x0 + i, y0 + j);
                    let left = pic.motion.at(x0 + i - 1, y0 + j);
                    let bs = motion_bs(curr, current_ref_pocs(refs, curr), left, current_ref_pocs(refs, left));
                    side.vertical_bs[((y0 + j) >> 2) * stride + ((x0 + i) >> 2)] = bs;
                }
            }
        }
    }
}

// ============================================================
// 整帧滤波
// ============================================================

/// 整帧环路滤波器
pub struct LoopFilter<'a> {
    pub sps: &'a Sps,
    pub pps: &'a Pps,
    pub side: &'a SideArrays,
    pub dsp: &'a dyn DspKernels,
}

impl LoopFilter<'_> {
    /// 去块滤波; `parallel` 为真时各分量平面并行处理
    pub fn deblock(&self, picture: &mut Picture, parallel: bool) {
        let run = |(c_idx, plane): (usize, &mut Plane)| {
            if c_idx == 0 {
                self.deblock_luma_plane(plane, true);
                self.deblock_luma_plane(plane, false);
            } else {
                self.deblock_chroma_plane(plane, c_idx, true);
                self.deblock_chroma_plane(plane, c_idx, false);
            }
        };
        if parallel {
            picture.planes.par_iter_mut().enumerate().for_each(run);
        } else {
            picture.planes.iter_mut().enumerate().for_each(run);
        }
    }

    /// 样本自适应偏移
    pub fn sao(&self, picture: &mut Picture, parallel: bool) {
        let run = |(c_idx, plane): (usize, &mut Plane)| self.sao_plane(plane, c_idx);
        if parallel {
            picture.planes.par_iter_mut().enumerate().for_each(run);
        } else {
            picture.planes.iter_mut().enumerate().for_each(run);
        }
    }

    fn bs_at(&self, x: usize, y: usize, vertical: bool) -> u8 {
        let idx = (y >> 2) * self.side.min_pu_width + (x >> 2);
        if vertical {
            self.side.vertical_bs[idx]
        } else {
            self.side.horizontal_bs[idx]
        }
    }

    /// P/Q 两侧亮度 QP 的平均值, 以及 Q 所在 CTB 的偏移 (beta, tc)
    fn edge_qp(&self, xq: usize, yq: usize, xp: usize, yp: usize) -> Option<(i32, i32, i32)> {
        let log2_min_cb = self.sps.log2_min_cb_size;
        let params = self.side.deblock[self.side.ctb_addr(xq, yq, self.sps.log2_ctb_size)];
        if params.disabled {
            return None;
        }
        let qp_q = self.side.qp_y_at(xq, yq, log2_min_cb);
        let qp_p = self.side.qp_y_at(xp, yp, log2_min_cb);
        Some(((qp_q + qp_p + 1) >> 1, params.beta_offset, params.tc_offset))
    }

    fn deblock_luma_plane(&self, plane: &mut Plane, vertical: bool) {
        let bit_depth = self.sps.bit_depth;
        let scale = 1 << (bit_depth - 8);
        let (width, height) = (plane.width, plane.height);
        let (x_start, x_step, y_start, y_step) = if vertical { (8, 8, 0, 4) } else { (0, 4, 8, 8) };

        for y in (y_start..height).step_by(y_step) {
            for x in (x_start..width).step_by(x_step) {
                let bs = i32::from(self.bs_at(x, y, vertical));
                if bs == 0 {
                    continue;
                }
                let (xp, yp) = if vertical { (x - 1, y) } else { (x, y - 1) };
                let Some((qp, beta_offset, tc_offset)) = self.edge_qp(x, y, xp, yp) else {
                    continue;
                };
                let beta = BETA_TABLE[(qp + beta_offset).clamp(0, 51) as usize] * scale;
                let tc = TC_TABLE[(qp + 2 * (bs - 1) + tc_offset).clamp(0, 53) as usize] * scale;
                let edge = LumaEdge {
                    beta,
                    tc,
                    no_p: self.side.is_pcm_at(xp, yp),
                    no_q: self.side.is_pcm_at(x, y),
                    bit_depth,
                };
                self.dsp.deblock_luma(plane, x, y, vertical, &edge);
            }
        }
    }

    /// 色度边界位于色度 8 样本网格上, 仅对 bS = 2 的边界滤波
    fn deblock_chroma_plane(&self, plane: &mut Plane, c_idx: usize, vertical: bool) {
        let sps = self.sps;
        let bit_depth = sps.bit_depth_chroma;
        let hshift = sps.hshift[c_idx];
        let vshift = sps.vshift[c_idx];
        let width = sps.width as usize;
        let height = sps.height as usize;
        let qp_offset = if c_idx == 1 { self.pps.cb_qp_offset } else { self.pps.cr_qp_offset };
        let (x_start, x_step, y_start, y_step, len) = if vertical {
            (8 << hshift, 8 << hshift, 0, 4, 4 >> vshift)
        } else {
            (0, 4, 8 << vshift, 8 << vshift, 4 >> hshift)
        };

        for y in (y_start..height).step_by(y_step) {
            for x in (x_start..width).step_by(x_step) {
                if self.bs_at(x, y, vertical) != 2 {
                    continue;
                }
                let (xp, yp) = if vertical { (x - 1, y) } else { (x, y - 1) };
                let Some((qp, _, tc_offset)) = self.edge_qp(x, y, xp, yp) else {
                    continue;
                };
                let qpc = chroma_qp((qp + qp_offset).clamp(0, 57), sps.chroma_format_idc);
                let tc = TC_TABLE[(qpc + CHROMA_TC_OFFSET + tc_offset).clamp(0, 53) as usize] * (1 << (bit_depth - 8));
                self.dsp.deblock_chroma(
                    plane,
                    x >> hshift,
                    y >> vshift,
                    vertical,
                    len.max(1),
                    tc,
                    self.side.is_pcm_at(xp, yp),
                    self.side.is_pcm_at(x, y),
                    bit_depth,
                );
            }
        }
    }

    fn sao_plane(&self, plane: &mut Plane, c_idx: usize) {
        let sps = self.sps;
        let side = self.side;
        let log2_ctb = sps.log2_ctb_size;
        let ctb_size = 1usize << log2_ctb;
        let hshift = sps.hshift[c_idx];
        let vshift = sps.vshift[c_idx];
        let bit_depth = if c_idx == 0 { sps.bit_depth } else { sps.bit_depth_chroma };

        let mut src: Option<Plane> = None;
        for ctb_rs in 0..side.ctb_width * side.ctb_height {
            if side.tab_slice_address[ctb_rs] < 0 {
                continue;
            }
            let params = &side.sao[ctb_rs].components[c_idx];
            if params.sao_type == SaoType::NotApplied {
                continue;
            }
            let src = src.get_or_insert_with(|| plane.clone());
            let rx = ctb_rs % side.ctb_width;
            let ry = ctb_rs / side.ctb_width;
            let x0 = (rx << log2_ctb) >> hshift;
            let y0 = (ry << log2_ctb) >> vshift;
            if x0 >= plane.width || y0 >= plane.height {
                continue;
            }
            let w = (ctb_size >> hshift).min(plane.width - x0);
            let h = (ctb_size >> vshift).min(plane.height - y0);
            let borders = self.sao_borders(rx, ry);
            self.dsp.sao(plane, src, x0, y0, w, h, params, &borders, bit_depth);
            self.restore_bypass(plane, src, c_idx, rx, ry);
        }
    }

    /// 相邻 CTB 跨越不允许滤波的分片/tile 边界时, SAO 不读取其样本
    pub(crate) fn sao_borders(&self, rx: usize, ry: usize) -> SaoBorders {
        let side = self.side;
        let pps = self.pps;
        let cur = ry * side.ctb_width + rx;
        let cur_addr = side.tab_slice_address[cur];
        let tile_of = |rs: usize| pps.tile_id.get(pps.ctb_addr_rs_to_ts[rs] as usize).copied();
        let blocked = |n: usize| {
            let n_addr = side.tab_slice_address[n];
            if n_addr < 0 {
                return true;
            }
            let slice_blocked = n_addr != cur_addr
                && if n_addr < cur_addr {
                    side.filter_slice_edges[cur] == 0
                } else {
                    side.filter_slice_edges[n] == 0
                };
            let tile_blocked = pps.tiles_enabled && !pps.loop_filter_across_tiles_enabled && tile_of(n) != tile_of(cur);
            slice_blocked || tile_blocked
        };
        SaoBorders {
            left: rx > 0 && blocked(cur - 1),
            right: rx + 1 < side.ctb_width && blocked(cur + 1),
            top: ry > 0 && blocked(cur - side.ctb_width),
            bottom: ry + 1 < side.ctb_height && blocked(cur + side.ctb_width),
        }
    }

    /// PCM (环路滤波关闭) 与 transquant bypass 样本恢复为去块输出
    fn restore_bypass(&self, plane: &mut Plane, src: &Plane, c_idx: usize, rx: usize, ry: usize) {
        let sps = self.sps;
        let log2_ctb = sps.log2_ctb_size;
        let hshift = sps.hshift[c_idx];
        let vshift = sps.vshift[c_idx];
        let x_start = rx << log2_ctb;
        let y_start = ry << log2_ctb;
        let x_end = (x_start + (1 << log2_ctb)).min(sps.width as usize);
        let y_end = (y_start + (1 << log2_ctb)).min(sps.height as usize);
        let cell_w = (4 >> hshift).max(1);
        let cell_h = (4 >> vshift).max(1);

        for y in (y_start..y_end).step_by(4) {
            for x in (x_start..x_end).step_by(4) {
                if !self.side.is_pcm_at(x, y) {
                    continue;
                }
                let xc = x >> hshift;
                let yc = y >> vshift;
                for dy in 0..cell_h.min(plane.height.saturating_sub(yc)) {
                    let row = (yc + dy) * plane.stride + xc;
                    let n = cell_w.min(plane.width.saturating_sub(xc));
                    plane.data[row..row + n].copy_from_slice(&src.data[row..row + n]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uni(list: usize, x: i16, y: i16) -> MvField {
        let mut m = MvField::default();
        m.pred_flag = PredFlag::from_lists(list == 0, list == 1);
        m.mv[list] = Mv::new(x, y);
        m.ref_idx[list] = 0;
        m
    }

    fn bi(mv0: (i16, i16), mv1: (i16, i16)) -> MvField {
        let mut m = MvField::default();
        m.pred_flag = PredFlag::Bi;
        m.mv = [Mv::new(mv0.0, mv0.1), Mv::new(mv1.0, mv1.1)];
        m.ref_idx = [0, 0];
        m
    }

    #[test]
    fn test_单向运动边界强度() {
        let a = uni(0, 0, 0);
        let b = uni(0, 3, -3);
        assert_eq!(motion_bs(&a, [Some(8), None], &b, [Some(8), None]), 0);
        let c = uni(0, 4, 0);
        assert_eq!(motion_bs(&a, [Some(8), None], &c, [Some(8), None]), 1);
        // 不同参考图像
        assert_eq!(motion_bs(&a, [Some(8), None], &b, [Some(4), None]), 1);
        // L1 与 L0 指向同一图像时按 POC 比较
        let d = uni(1, 1, 1);
        assert_eq!(motion_bs(&a, [Some(8), None], &d, [None, Some(8)]), 0);
    }

    #[test]
    fn test_双向运动边界强度() {
        let a = bi((0, 0), (8, 8));
        let b = bi((1, 1), (9, 9));
        assert_eq!(motion_bs(&a, [Some(0), Some(16)], &b, [Some(0), Some(16)]), 0);
        // 交叉匹配
        let c = bi((8, 8), (0, 0));
        assert_eq!(motion_bs(&a, [Some(0), Some(16)], &c, [Some(16), Some(0)]), 0);
        let d = bi((0, 0), (16, 8));
        assert_eq!(motion_bs(&a, [Some(0), Some(16)], &d, [Some(0), Some(16)]), 1);
        // 两个方向参考同一图像: 直连与交叉均不连续才为 1
        let e = bi((0, 0), (8, 8));
        let f = bi((8, 8), (0, 0));
        assert_eq!(motion_bs(&e, [Some(4), Some(4)], &f, [Some(4), Some(4)]), 0);
    }

    #[test]
    fn test_单双向混合强度为一() {
        let a = uni(0, 0, 0);
        let b = bi((0, 0), (0, 0));
        assert_eq!(motion_bs(&a, [Some(0), None], &b, [Some(0), Some(0)]), 1);
    }
}
